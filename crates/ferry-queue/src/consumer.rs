//! Message callbacks

use async_trait::async_trait;
use ferry_core::Record;
use std::future::Future;
use thiserror::Error;

/// Failure reported by a consumer callback
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// The record could not be processed. The worker keeps running and the
    /// record goes through the dead-letter policy.
    #[error("Message processing failed: {0}")]
    Processing(String),

    /// A store operation inside the callback failed. `StoreUnavailable` stops
    /// the destination.
    #[error(transparent)]
    Store(#[from] ferry_core::Error),
}

impl ConsumeError {
    pub fn processing(reason: impl std::fmt::Display) -> Self {
        ConsumeError::Processing(reason.to_string())
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, ConsumeError::Store(e) if e.is_store_unavailable())
    }
}

/// Application callback for one destination
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Called once before the destination starts consuming
    async fn init(&self) -> ferry_core::Result<()> {
        Ok(())
    }

    async fn on_message(&self, record: &Record) -> Result<(), ConsumeError>;

    /// Called once after the destination stopped
    async fn destroy(&self) {}
}

/// Consumer backed by an async closure
pub struct FnConsumer<F> {
    f: F,
}

/// Build a [`Consumer`] from an async closure taking the record by value
pub fn consumer_fn<F, Fut>(f: F) -> FnConsumer<F>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
    FnConsumer { f }
}

#[async_trait]
impl<F, Fut> Consumer for FnConsumer<F>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
    async fn on_message(&self, record: &Record) -> Result<(), ConsumeError> {
        (self.f)(record.clone()).await
    }
}
