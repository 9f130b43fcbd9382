// src/queue/errors.rs

use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Broker connection error: {0}")]
    ConnectionError(String),

    #[error("Broker channel error: {0}")]
    ChannelError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Consume error: {0}")]
    ConsumeError(String),

    #[error("Acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),
}

// Custom Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    pub fn connection(error: impl ToString) -> Self {
        QueueError::ConnectionError(error.to_string())
    }

    pub fn channel(error: impl ToString) -> Self {
        QueueError::ChannelError(error.to_string())
    }

    pub fn publish(error: impl ToString) -> Self {
        QueueError::PublishError(error.to_string())
    }

    pub fn consume(error: impl ToString) -> Self {
        QueueError::ConsumeError(error.to_string())
    }

    pub fn ack(error: impl ToString) -> Self {
        QueueError::AckError(error.to_string())
    }

    /// Broker unreachable or channel gone: the caller should rebuild the
    /// connection and try again.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            QueueError::ConnectionError(_)
                | QueueError::ChannelError(_)
                | QueueError::TimeoutError(_)
        )
    }
}

impl From<Elapsed> for QueueError {
    fn from(_: Elapsed) -> Self {
        QueueError::TimeoutError("Connection timed out".to_string())
    }
}
