pub mod registry;
pub mod supervisor;

pub use registry::SessionRegistry;
pub use supervisor::{ConnectionHandle, ConnectionState, ConnectionSupervisor};
