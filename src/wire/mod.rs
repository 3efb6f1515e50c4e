//! Wire protocol: message types, binary frame classification, the
//! per-connection outbound queue, and the WebSocket endpoint.

pub mod endpoint;
pub mod message;
pub mod outbound;

pub use endpoint::{router, AppState};
pub use message::{classify_binary, BinaryFrame, ControlMarker, ServerMessage};
pub use outbound::{Outbound, OutboundQueue};
