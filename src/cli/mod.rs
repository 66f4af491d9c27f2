//! CLI output formatting
//!
//! Human-readable terminal display for chat turns and doctor reports.

pub mod display;

pub use display::parse_decision;
pub use display::PermissionPrompt;
pub use display::render_diagnostic_report;
pub use display::TurnDisplay;
