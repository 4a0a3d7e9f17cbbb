//! Core data model for the Ferry message queue.
//!
//! Records are the unit of work: a payload plus delivery metadata, stored under
//! a [`RecordKey`] in a per-destination store. An [`Envelope`] carries one
//! delivery attempt of a record from a destination supervisor to a worker and
//! back.

pub mod envelope;
pub mod error;
pub mod key;
pub mod record;

pub use envelope::Envelope;
pub use error::{Error, Result};
pub use key::RecordKey;
pub use record::{Payload, ProcessState, Record};
