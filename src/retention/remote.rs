//! Object-store retention backend. Runs inside the supervisor's async
//! retention-sweep task, so listing/removal are plain `async fn`s rather
//! than wrapped in their own runtime the way the sink's uploader thread
//! must be.

use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};

use crate::error::SinkError;
use crate::retention::threshold;

/// One expired object key plus its modification time, returned instead of
/// [`crate::retention::Item`] because removal here is itself async.
pub struct RemoteItem {
    pub key: String,
    pub modified: DateTime<Utc>,
}

/// List every object under `prefix` whose `LastModified` is at or before
/// `today - retention_days`, paging through the bucket with the SDK's
/// native continuation-token support.
pub async fn list_expired(
    client: &Client,
    bucket: &str,
    prefix: &str,
    retention_days: i64,
) -> Result<Vec<RemoteItem>, SinkError> {
    if retention_days <= 0 {
        return Ok(Vec::new());
    }
    let cutoff = threshold(retention_days);

    let mut items = Vec::new();
    let mut continuation_token: Option<String> = None;
    loop {
        let mut req = client.list_objects_v2().bucket(bucket).prefix(prefix);
        if let Some(token) = &continuation_token {
            req = req.continuation_token(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        for object in resp.contents() {
            let (Some(key), Some(last_modified)) = (object.key(), object.last_modified()) else {
                continue;
            };
            let modified: DateTime<Utc> = DateTime::from_timestamp(
                last_modified.secs(),
                last_modified.subsec_nanos(),
            )
            .unwrap_or_else(Utc::now);
            if modified <= cutoff {
                items.push(RemoteItem {
                    key: key.to_string(),
                    modified,
                });
            }
        }

        if resp.is_truncated().unwrap_or(false) {
            continuation_token = resp.next_continuation_token().map(|s| s.to_string());
        } else {
            break;
        }
    }
    Ok(items)
}

pub async fn remove(client: &Client, bucket: &str, item: &RemoteItem) -> Result<(), SinkError> {
    client
        .delete_object()
        .bucket(bucket)
        .key(&item.key)
        .send()
        .await
        .map_err(|e| SinkError::Network(e.to_string()))?;
    Ok(())
}
