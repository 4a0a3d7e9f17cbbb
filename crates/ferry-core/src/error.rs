use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // ==================== Store Errors ====================
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // ==================== Data Errors ====================
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    // ==================== Configuration Errors ====================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Runtime Errors ====================
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The backing store cannot be reached. Destinations observing this stop
    /// consuming until they are registered again.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Other(format!("task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::StoreUnavailable("down".into()).is_store_unavailable());
        assert!(!Error::InvalidRecord("x".into()).is_store_unavailable());
    }

    #[tokio::test]
    async fn test_channel_errors_convert() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u32>(1);
        drop(rx);
        let err: Error = tx.send(1).await.unwrap_err().into();
        assert!(matches!(err, Error::ChannelClosed));

        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
        drop(tx);
        let err: Error = rx.await.unwrap_err().into();
        assert!(matches!(err, Error::ChannelClosed));
    }
}
