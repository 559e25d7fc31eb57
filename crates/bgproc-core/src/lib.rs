//! bgproc-core: Shared protocol library for bgproc.
//!
//! Provides session/log data types, MCP and JSON-RPC envelopes, the
//! newline-delimited JSON codec, and terminal key encoding.

pub mod codec;
pub mod error;
pub mod keys;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{json_decode, line_encode, LineDecoder};
pub use error::{ProcError, ProcResult};
pub use keys::{encode_keys, render_paste};
pub use messages::{
    LogEntry, LogKind, LogPage, SessionRecord, SessionStatus, ToolResult, PROTOCOL_VERSION,
};
