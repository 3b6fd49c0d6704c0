use beamcast_shared::errors::{AppError, AppResult, ErrorCode};

use crate::models::{NewStream, NewStreamJoiner, Stream, StreamJoiner, StreamStatus, StreamWithJoiners};

/// Persistence for broadcast metadata.
///
/// Calls are blocking; handlers run them inline like any other diesel query.
pub trait StreamStore: Send + Sync {
    /// Every stream with its joiners, oldest first.
    fn list_streams(&self) -> AppResult<Vec<StreamWithJoiners>>;

    fn find_stream(&self, id: i32) -> AppResult<Option<Stream>>;

    fn create_stream(&self, new: NewStream) -> AppResult<Stream>;

    /// Checks the transition and writes in one step, so a concurrent
    /// update cannot revive a terminated stream. `None` when the stream
    /// does not exist.
    fn set_status(&self, id: i32, status: StreamStatus) -> AppResult<Option<StatusChange>>;

    /// `None` when the stream does not exist.
    fn add_joiner(&self, new: NewStreamJoiner) -> AppResult<Option<StreamJoiner>>;

    /// Cheap connectivity probe for `/health`.
    fn ping(&self) -> AppResult<()>;

    fn get_stream(&self, id: i32) -> AppResult<Stream> {
        self.find_stream(id)?.ok_or_else(|| stream_not_found(id))
    }
}

/// A status update together with the status it replaced.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub from: StreamStatus,
    pub stream: Stream,
}

pub fn stream_not_found(id: i32) -> AppError {
    AppError::new(ErrorCode::StreamNotFound, format!("stream {id} not found"))
}
