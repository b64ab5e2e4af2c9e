//! The sink capability set (spec §4.1): `open` / `is_opened` / `write` /
//! `close`, implemented as a trait object rather than an inheritance
//! hierarchy (Design Note 9).

pub mod broadcast;
pub mod file;
pub mod object_store;

use chrono::Local;

use crate::config::StorageDescriptor;
use crate::error::SinkError;

/// One durable destination for a camera's encoded byte stream.
///
/// Contract (spec §4.1): `open` is idempotent; `write` never reorders
/// bytes and surfaces any background-worker failure on the *next* call
/// rather than swallowing it; `close` flushes and finalizes the segment
/// and is safe to call when already closed.
pub trait Sink: Send {
    fn open(&mut self, ext: &str) -> Result<(), SinkError>;
    fn is_opened(&self) -> bool;
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Segment name stamped from local time at `open()`, shared by every sink
/// variant: `dd_mm_yy_HH_MM` (spec §6 "Persisted state").
pub fn segment_stem() -> String {
    Local::now().format("%d_%m_%y_%H_%M").to_string()
}

/// Build the concrete [`Sink`] a [`StorageDescriptor`] describes for one
/// camera.
pub fn build(descriptor: &StorageDescriptor, camera_name: &str) -> Box<dyn Sink> {
    match descriptor {
        StorageDescriptor::Local { root, .. } => {
            Box::new(file::FileSink::new(root.join(camera_name)))
        }
        StorageDescriptor::ObjectStore {
            bucket,
            key_prefix,
            region,
            access_key_id,
            secret_access_key,
            connect_timeout_secs,
            ..
        } => Box::new(object_store::ObjectStoreSink::new(
            bucket.clone(),
            format!("{key_prefix}/{camera_name}"),
            region.clone(),
            access_key_id.clone(),
            secret_access_key.clone(),
            std::time::Duration::from_secs(*connect_timeout_secs),
        )),
        StorageDescriptor::Broadcast {
            client_id,
            client_secret,
            refresh_token,
            ..
        } => Box::new(broadcast::BroadcastSink::new(broadcast::OauthCredentials {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            refresh_token: refresh_token.clone(),
        })),
    }
}
