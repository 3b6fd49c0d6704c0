pub mod memory_store;
pub mod pg_store;
pub mod stream_store;

pub use memory_store::MemoryStreamStore;
pub use pg_store::PgStreamStore;
pub use stream_store::StreamStore;
