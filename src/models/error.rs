use std::time::Duration;

use thiserror::Error;

/// Failure of a single dispatch, tagged by the stage that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Broker unreachable, handshake failed, or no channel could be opened.
    #[error("failed to connect to message broker: {0}")]
    Connection(String),

    /// Exchange, queue or binding declaration was rejected.
    #[error("failed to provision broker topology: {0}")]
    Topology(String),

    #[error("failed to serialize notification: {0}")]
    Serialization(String),

    /// Channel-level rejection while publishing.
    #[error("failed to publish notification: {0}")]
    Publish(String),

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Connection(_) => "connection",
            DispatchError::Topology(_) => "topology",
            DispatchError::Serialization(_) => "serialization",
            DispatchError::Publish(_) => "publish",
            DispatchError::Timeout(_) => "timeout",
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}
