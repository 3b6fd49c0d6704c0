pub mod messages;
pub mod protocol;

pub use messages::{Request, Response};
pub use protocol::{Phase, ProtocolState, Signaling};
