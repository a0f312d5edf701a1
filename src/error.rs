use crate::batch::{Channel, SourceId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("malformed batch for source {source_id}, channel {channel:?}: {reason}")]
    MalformedBatch {
        source_id: SourceId,
        channel: String,
        reason: String,
    },
    #[error("unknown source: {0}")]
    UnknownSource(SourceId),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("invalid alarm query: {0}")]
    InvalidQuery(String),
    #[error("monitor is shut down")]
    ShutDown,
    #[error("background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "duplicate alarm for source {source_id}, channel {channel}, segment {segment_begin}..{segment_end}"
    )]
    DuplicateAlarm {
        source_id: SourceId,
        channel: Channel,
        segment_begin: DateTime<Utc>,
        segment_end: DateTime<Utc>,
    },
    #[error("alarm storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("alarm storage failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            StoreError::DuplicateAlarm { .. } | StoreError::StorageUnavailable(_)
        )
    }
}

impl From<tokio::task::JoinError> for MonitorError {
    fn from(err: tokio::task::JoinError) -> Self {
        MonitorError::Task(err.to_string())
    }
}
