//! Object-store sink: multipart upload to an S3-compatible bucket
//! (spec §4.3), grounded the same way the teacher's remote-storage crate
//! shapes its bucket client, with bytes handed to a background uploader
//! thread so the pipeline's byte-reader never blocks on the network.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::error::SinkError;
use crate::sink::{segment_stem, Sink};

/// Minimum accumulated buffer before a non-final part is uploaded. S3
/// requires every part but the last to be at least 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// How often the uploader thread wakes to check for a `Stop` even with no
/// new bytes queued, so `close()`'s timeout is bounded.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
enum UploaderError {
    Network(String),
    Permission(String),
    NotFound(String),
}

impl From<UploaderError> for SinkError {
    fn from(e: UploaderError) -> Self {
        match e {
            UploaderError::Network(s) => SinkError::Network(s),
            UploaderError::Permission(s) => SinkError::Permission(s),
            UploaderError::NotFound(s) => SinkError::NotFound(s),
        }
    }
}

enum UploaderMsg {
    Block(Vec<u8>),
    Stop,
}

struct UploaderHandle {
    tx: SyncSender<UploaderMsg>,
    done_rx: Receiver<()>,
    thread: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<UploaderError>>>,
}

pub struct ObjectStoreSink {
    bucket: String,
    key_prefix: String,
    region: Option<String>,
    access_key_id: String,
    secret_access_key: String,
    connect_timeout: Duration,
    uploader: Option<UploaderHandle>,
}

impl ObjectStoreSink {
    pub fn new(
        bucket: String,
        key_prefix: String,
        region: Option<String>,
        access_key_id: String,
        secret_access_key: String,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            bucket,
            key_prefix,
            region,
            access_key_id,
            secret_access_key,
            connect_timeout,
            uploader: None,
        }
    }

    fn build_client(&self, rt: &tokio::runtime::Runtime) -> Result<Client, UploaderError> {
        rt.block_on(async {
            let region = Region::new(self.region.clone().unwrap_or_else(|| "us-east-1".into()));
            let credentials = Credentials::new(
                &self.access_key_id,
                &self.secret_access_key,
                None,
                None,
                "warden-nvr",
            );
            let timeout_config = aws_smithy_types::timeout::TimeoutConfig::builder()
                .connect_timeout(self.connect_timeout)
                .read_timeout(self.connect_timeout)
                .build();
            let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(region)
                .credentials_provider(credentials)
                .timeout_config(timeout_config)
                .retry_config(aws_config::retry::RetryConfig::disabled())
                .load()
                .await;
            let client = Client::new(&shared_config);

            let buckets = client
                .list_buckets()
                .send()
                .await
                .map_err(classify_sdk_error)?;
            let exists = buckets
                .buckets()
                .iter()
                .any(|b| b.name() == Some(self.bucket.as_str()));
            if !exists {
                return Err(UploaderError::NotFound(format!(
                    "bucket '{}' not found",
                    self.bucket
                )));
            }
            Ok(client)
        })
    }
}

fn classify_sdk_error<E: std::fmt::Display>(err: E) -> UploaderError {
    let msg = err.to_string();
    if msg.contains("AccessDenied") || msg.contains("Forbidden") {
        UploaderError::Permission(msg)
    } else if msg.contains("dns error") || msg.contains("connection") || msg.contains("timed out")
    {
        UploaderError::Network(msg)
    } else {
        UploaderError::Network(msg)
    }
}

impl Sink for ObjectStoreSink {
    fn open(&mut self, ext: &str) -> Result<(), SinkError> {
        if self.uploader.is_some() {
            return Ok(());
        }

        let key = format!("{}/{}.{ext}", self.key_prefix, segment_stem());
        let bucket = self.bucket.clone();
        let region = self.region.clone();
        let access_key_id = self.access_key_id.clone();
        let secret_access_key = self.secret_access_key.clone();
        let connect_timeout = self.connect_timeout;

        let (tx, rx) = sync_channel::<UploaderMsg>(64);
        let (done_tx, done_rx) = sync_channel::<()>(1);
        let error = Arc::new(Mutex::new(None));
        let error_clone = error.clone();

        let sink_for_client = ObjectStoreSink {
            bucket: bucket.clone(),
            key_prefix: self.key_prefix.clone(),
            region,
            access_key_id,
            secret_access_key,
            connect_timeout,
            uploader: None,
        };

        let thread = std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    *error_clone.lock().unwrap() = Some(UploaderError::Network(e.to_string()));
                    let _ = done_tx.send(());
                    return;
                }
            };

            let client = match sink_for_client.build_client(&rt) {
                Ok(c) => c,
                Err(e) => {
                    *error_clone.lock().unwrap() = Some(e);
                    let _ = done_tx.send(());
                    return;
                }
            };

            run_uploader(&rt, &client, &bucket, &key, rx, &error_clone);
            let _ = done_tx.send(());
        });

        self.uploader = Some(UploaderHandle {
            tx,
            done_rx,
            thread: Some(thread),
            error,
        });
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.uploader.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let uploader = self
            .uploader
            .as_ref()
            .ok_or(SinkError::NotFound("write on a closed object-store sink".into()))?;
        if let Some(e) = uploader.error.lock().unwrap().clone() {
            return Err(e.into());
        }
        uploader
            .tx
            .send(UploaderMsg::Block(data.to_vec()))
            .map_err(|_| SinkError::InternalThread("uploader thread is gone".into()))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let mut uploader = match self.uploader.take() {
            Some(u) => u,
            None => return Ok(()),
        };

        let _ = uploader.tx.send(UploaderMsg::Stop);
        match uploader.done_rx.recv_timeout(Duration::from_secs(30)) {
            Ok(()) => {
                if let Some(handle) = uploader.thread.take() {
                    let _ = handle.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(SinkError::Timeout(
                    "object-store uploader did not finish closing".into(),
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {}
        }

        if let Some(e) = uploader.error.lock().unwrap().clone() {
            return Err(e.into());
        }
        Ok(())
    }
}

fn run_uploader(
    rt: &tokio::runtime::Runtime,
    client: &Client,
    bucket: &str,
    key: &str,
    rx: Receiver<UploaderMsg>,
    error: &Arc<Mutex<Option<UploaderError>>>,
) {
    let upload_id = match rt.block_on(async {
        client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify_sdk_error)
    }) {
        Ok(resp) => match resp.upload_id().map(|s| s.to_string()) {
            Some(id) => id,
            None => {
                *error.lock().unwrap() =
                    Some(UploaderError::Network("no upload id returned".into()));
                return;
            }
        },
        Err(e) => {
            *error.lock().unwrap() = Some(e);
            return;
        }
    };

    let mut buffer: Vec<u8> = Vec::new();
    let mut parts: Vec<aws_sdk_s3::types::CompletedPart> = Vec::new();
    let mut part_number: i32 = 1;
    let mut stop = false;

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(UploaderMsg::Block(bytes)) => buffer.extend_from_slice(&bytes),
            Ok(UploaderMsg::Stop) => stop = true,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => stop = true,
        }

        if !stop && buffer.len() < MIN_PART_SIZE {
            continue;
        }
        if buffer.is_empty() {
            if stop {
                break;
            }
            continue;
        }

        let body = std::mem::take(&mut buffer);
        let len = body.len() as i64;
        let result = rt.block_on(async {
            client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .content_length(len)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(classify_sdk_error)
        });
        match result {
            Ok(resp) => {
                parts.push(
                    aws_sdk_s3::types::CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(resp.e_tag().map(|s| s.to_string()))
                        .build(),
                );
                part_number += 1;
            }
            Err(e) => {
                *error.lock().unwrap() = Some(e);
                return;
            }
        }

        if stop {
            break;
        }
    }

    if parts.is_empty() {
        let _ = rt.block_on(async {
            client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
        });
        return;
    }

    let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
        .set_parts(Some(parts))
        .build();
    let result = rt.block_on(async {
        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(classify_sdk_error)
    });
    if let Err(e) = result {
        *error.lock().unwrap() = Some(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_part_size_is_five_mebibytes() {
        assert_eq!(MIN_PART_SIZE, 5 * 1024 * 1024);
    }
}
