use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use beamcast_shared::errors::{AppError, AppResult, ErrorCode};

use crate::schema::{stream_joiners, streams};

// --- Status / joiner type ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Pending,
    Started,
    Terminated,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "terminated" => Ok(Self::Terminated),
            other => Err(AppError::new(
                ErrorCode::InvalidStreamStatus,
                format!("unknown stream status '{other}'"),
            )),
        }
    }

    /// A terminated stream stays terminated.
    pub fn ensure_transition(from: Self, to: Self) -> AppResult<()> {
        if from == Self::Terminated && to != Self::Terminated {
            return Err(AppError::new(
                ErrorCode::StreamTerminated,
                "stream is terminated and cannot change status",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinerType {
    Viewer,
    Streamer,
}

impl JoinerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Streamer => "streamer",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "viewer" => Ok(Self::Viewer),
            "streamer" => Ok(Self::Streamer),
            other => Err(AppError::new(
                ErrorCode::InvalidJoinerType,
                format!("unknown joiner type '{other}'"),
            )),
        }
    }
}

// --- Stream ---

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, PartialEq)]
#[diesel(table_name = streams)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: i32,
    pub title: String,
    pub path: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    pub fn status(&self) -> AppResult<StreamStatus> {
        StreamStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = streams)]
pub struct NewStream {
    pub title: String,
    pub path: Option<String>,
    pub status: String,
}

// --- Joiner ---

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations, Serialize, PartialEq)]
#[diesel(belongs_to(Stream))]
#[diesel(table_name = stream_joiners)]
#[serde(rename_all = "camelCase")]
pub struct StreamJoiner {
    pub id: i32,
    pub stream_id: i32,
    pub joiner_type: String,
    pub user_email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = stream_joiners)]
pub struct NewStreamJoiner {
    pub stream_id: i32,
    pub joiner_type: String,
    pub user_email: String,
}

/// A stream as listed by `GET /api/streams`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamWithJoiners {
    #[serde(flatten)]
    pub stream: Stream,
    pub joiners: Vec<StreamJoiner>,
}
