//! Wire protocol
//!
//! Event types, request bodies, and the frame codec shared by the server
//! and the client.

pub mod codec;
pub mod event;
pub mod request;

pub use codec::{decode, encode_json, encode_sse, FrameDecoder};
pub use event::{
    ContentBlock, ErrorCode, PermissionDecision, PermissionOutcome, PermissionRequest,
    StreamEvent, TurnResult, Usage,
};
pub use request::{PermissionMode, StartOptions, StartRequest};
