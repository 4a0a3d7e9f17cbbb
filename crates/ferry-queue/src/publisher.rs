//! Publishing records into destination stores

use ferry_core::{Error, ProcessState, Record, RecordKey, Result};
use ferry_grid::DataGrid;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writes records under per-destination monotonically increasing keys.
///
/// Writing a record is what triggers its delivery: the owning member's
/// supervisor sees the new entry and dispatches it.
#[derive(Clone)]
pub struct Publisher {
    grid: Arc<dyn DataGrid>,
}

impl Publisher {
    pub fn new(grid: Arc<dyn DataGrid>) -> Self {
        Self { grid }
    }

    /// Next key of a destination's sequence
    pub async fn next_key(&self, destination: &str) -> Result<RecordKey> {
        Ok(RecordKey::new(self.grid.next_id(destination).await?))
    }

    /// Synchronous put; returns once the record is stored
    pub async fn offer(&self, record: Record) -> Result<RecordKey> {
        let record = prepare(record)?;
        let store = self.grid.store(&record.destination).await?;
        let key = self.next_key(&record.destination).await?;
        store.put(key, record).await?;
        debug!(destination = %store.name(), key = %key, "Offered record");
        Ok(key)
    }

    /// Asynchronous put; the returned handle resolves to the key
    pub fn ingest(&self, record: Record) -> JoinHandle<Result<RecordKey>> {
        let publisher = self.clone();
        tokio::spawn(async move {
            let destination = record.destination.clone();
            let result = publisher.offer(record).await;
            if let Err(err) = &result {
                warn!(destination = %destination, error = %err, "Asynchronous ingest failed");
            }
            result
        })
    }

    /// Route on the record's `add_async` flag. Asynchronous publishes
    /// return `None`.
    pub async fn publish(&self, record: Record) -> Result<Option<RecordKey>> {
        if record.add_async {
            validate_destination(&record)?;
            drop(self.ingest(record));
            Ok(None)
        } else {
            self.offer(record).await.map(Some)
        }
    }
}

fn validate_destination(record: &Record) -> Result<()> {
    if record.destination.trim().is_empty() {
        return Err(Error::InvalidRecord("destination is not provided".into()));
    }
    Ok(())
}

/// Validate and reset delivery state of an outgoing record
fn prepare(mut record: Record) -> Result<Record> {
    validate_destination(&record)?;
    record.process_state = ProcessState::Open;
    record.locked_at = None;
    Ok(record)
}
