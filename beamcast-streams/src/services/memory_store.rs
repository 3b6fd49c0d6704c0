use chrono::Utc;
use parking_lot::Mutex;

use beamcast_shared::errors::AppResult;

use super::stream_store::StatusChange;
use super::StreamStore;
use crate::models::{NewStream, NewStreamJoiner, Stream, StreamJoiner, StreamStatus, StreamWithJoiners};

#[derive(Default)]
struct Tables {
    streams: Vec<Stream>,
    joiners: Vec<StreamJoiner>,
    next_stream_id: i32,
    next_joiner_id: i32,
}

/// Process-local store. Used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStreamStore {
    tables: Mutex<Tables>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamStore for MemoryStreamStore {
    fn list_streams(&self) -> AppResult<Vec<StreamWithJoiners>> {
        let tables = self.tables.lock();
        Ok(tables
            .streams
            .iter()
            .map(|stream| StreamWithJoiners {
                stream: stream.clone(),
                joiners: tables
                    .joiners
                    .iter()
                    .filter(|j| j.stream_id == stream.id)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    fn find_stream(&self, id: i32) -> AppResult<Option<Stream>> {
        Ok(self.tables.lock().streams.iter().find(|s| s.id == id).cloned())
    }

    fn create_stream(&self, new: NewStream) -> AppResult<Stream> {
        let mut tables = self.tables.lock();
        tables.next_stream_id += 1;
        let now = Utc::now();
        let stream = Stream {
            id: tables.next_stream_id,
            title: new.title,
            path: new.path,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        tables.streams.push(stream.clone());
        Ok(stream)
    }

    fn set_status(&self, id: i32, status: StreamStatus) -> AppResult<Option<StatusChange>> {
        let mut tables = self.tables.lock();
        let Some(stream) = tables.streams.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };

        let from = stream.status()?;
        StreamStatus::ensure_transition(from, status)?;
        stream.status = status.as_str().to_string();
        stream.updated_at = Utc::now();
        Ok(Some(StatusChange {
            from,
            stream: stream.clone(),
        }))
    }

    fn add_joiner(&self, new: NewStreamJoiner) -> AppResult<Option<StreamJoiner>> {
        let mut tables = self.tables.lock();
        if !tables.streams.iter().any(|s| s.id == new.stream_id) {
            return Ok(None);
        }
        tables.next_joiner_id += 1;
        let joiner = StreamJoiner {
            id: tables.next_joiner_id,
            stream_id: new.stream_id,
            joiner_type: new.joiner_type,
            user_email: new.user_email,
            created_at: Utc::now(),
        };
        tables.joiners.push(joiner.clone());
        Ok(Some(joiner))
    }

    fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
