//! Retention sweeping (spec §4.4): enumerate items older than a backend's
//! retention window and remove them.

pub mod local;
pub mod remote;

use chrono::{DateTime, Utc};

use crate::error::SinkError;

/// One recording eligible for removal. Removal is deferred behind a
/// closure so listing (`list_expired`) stays a pure read even against a
/// remote backend.
pub struct Item {
    pub key: String,
    pub modified: DateTime<Utc>,
    remove_fn: Box<dyn FnOnce() -> Result<(), SinkError> + Send>,
}

impl Item {
    pub fn new(
        key: String,
        modified: DateTime<Utc>,
        remove_fn: impl FnOnce() -> Result<(), SinkError> + Send + 'static,
    ) -> Self {
        Self {
            key,
            modified,
            remove_fn: Box::new(remove_fn),
        }
    }

    pub fn remove(self) -> Result<(), SinkError> {
        (self.remove_fn)()
    }
}

/// `today - retention_days`, the exact cutoff spec.md §4.4 and the
/// testable properties of §8 define expiry against (an item is expired
/// when its modification time is at or before this instant).
pub fn threshold(retention_days: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(retention_days)
}
