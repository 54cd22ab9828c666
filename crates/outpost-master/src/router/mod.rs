//! Request relay: tool calls and commands sent through slave connections.

mod pending;
mod relay;

pub use pending::{CallState, PendingCalls};
pub use relay::{DEFAULT_CALL_TIMEOUT, RelayError, ToolRelay};
