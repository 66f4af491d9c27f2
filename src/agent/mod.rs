//! Agent subprocess integration

pub mod cli;
pub mod permissions;
pub mod process;
pub mod stream;
