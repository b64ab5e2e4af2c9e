//! Live-broadcast sink: pushes the encoded stream to a streaming
//! platform's RTMP ingest endpoint. The platform's OAuth flow and HTTP
//! client are an external collaborator (spec §1 scope); only the interface
//! this sink needs from it is specified here.

use std::io::Write as _;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::SinkError;
use crate::sink::Sink;

#[derive(Debug, Clone)]
pub struct OauthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct BroadcastHandle {
    pub id: String,
    pub ingest_url: String,
}

/// External collaborator: creates/ends a live broadcast and hands back the
/// RTMP ingest URL to push encoded bytes to. Implemented elsewhere against
/// the platform's HTTP API; this sink only depends on the trait.
pub trait BroadcastApi: Send + Sync {
    fn create_broadcast(&self) -> Result<BroadcastHandle, SinkError>;
    fn end_broadcast(&self, handle: &BroadcastHandle) -> Result<(), SinkError>;
}

/// Placeholder implementation wired from [`OauthCredentials`] until a real
/// HTTP client is supplied; it always fails fast rather than silently
/// pretending to broadcast.
struct UnconfiguredBroadcastApi {
    _credentials: OauthCredentials,
}

impl BroadcastApi for UnconfiguredBroadcastApi {
    fn create_broadcast(&self) -> Result<BroadcastHandle, SinkError> {
        Err(SinkError::NotFound(
            "no broadcast API client configured".into(),
        ))
    }

    fn end_broadcast(&self, _handle: &BroadcastHandle) -> Result<(), SinkError> {
        Ok(())
    }
}

struct InitResult {
    handle: BroadcastHandle,
    child: Child,
}

/// Pushes the encoded stream to a live-broadcast ingest endpoint.
///
/// `open()` returns as soon as the broadcast-creation fiber is spawned;
/// until that fiber finishes, `is_opened()` already reports `true` (the
/// pipeline treats this sink as live) but `write()` silently drops frames
/// rather than blocking the recording path on the platform's API latency.
pub struct BroadcastSink {
    api: Arc<dyn BroadcastApi>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    child: Arc<Mutex<Option<Child>>>,
    current_handle: Arc<Mutex<Option<BroadcastHandle>>>,
    init_thread: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<SinkError>>>,
    opened: bool,
}

impl BroadcastSink {
    pub fn new(credentials: OauthCredentials) -> Self {
        Self::with_api(Arc::new(UnconfiguredBroadcastApi {
            _credentials: credentials,
        }))
    }

    pub fn with_api(api: Arc<dyn BroadcastApi>) -> Self {
        Self {
            api,
            stdin: Arc::new(Mutex::new(None)),
            child: Arc::new(Mutex::new(None)),
            current_handle: Arc::new(Mutex::new(None)),
            init_thread: None,
            error: Arc::new(Mutex::new(None)),
            opened: false,
        }
    }
}

fn spawn_pusher(ingest_url: &str) -> std::io::Result<Child> {
    Command::new("ffmpeg")
        .args(["-i", "pipe:0", "-c", "copy", "-f", "flv", ingest_url])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

impl Sink for BroadcastSink {
    fn open(&mut self, _ext: &str) -> Result<(), SinkError> {
        if self.opened {
            return Ok(());
        }
        let api = self.api.clone();
        let stdin = self.stdin.clone();
        let child_slot = self.child.clone();
        let handle_slot = self.current_handle.clone();
        let error = self.error.clone();

        self.init_thread = Some(std::thread::spawn(move || {
            let handle = match api.create_broadcast() {
                Ok(h) => h,
                Err(e) => {
                    *error.lock().unwrap() = Some(e);
                    return;
                }
            };
            let mut child = match spawn_pusher(&handle.ingest_url) {
                Ok(c) => c,
                Err(e) => {
                    *error.lock().unwrap() = Some(SinkError::Io(e));
                    return;
                }
            };
            *stdin.lock().unwrap() = child.stdin.take();
            *handle_slot.lock().unwrap() = Some(handle);
            *child_slot.lock().unwrap() = Some(child);
        }));
        self.opened = true;
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        let mut guard = self.stdin.lock().unwrap();
        if let Some(stdin) = guard.as_mut() {
            // Not yet ready, or the pusher died: drop the frame rather than
            // block the recording path.
            let _ = stdin.write_all(data);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if !self.opened {
            return Ok(());
        }
        self.opened = false;

        if let Some(t) = self.init_thread.take() {
            let _ = t.join();
        }
        // Dropping stdin sends EOF to the pusher process.
        self.stdin.lock().unwrap().take();

        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = wait_with_timeout(&mut child, Duration::from_secs(10));
        }
        if let Some(handle) = self.current_handle.lock().unwrap().take() {
            self.api.end_broadcast(&handle)?;
        }
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(())
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<()> {
    let start = std::time::Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeApi {
        ended: Arc<AtomicBool>,
    }

    impl BroadcastApi for FakeApi {
        fn create_broadcast(&self) -> Result<BroadcastHandle, SinkError> {
            Ok(BroadcastHandle {
                id: "b1".into(),
                ingest_url: "rtmp://example.invalid/live/key".into(),
            })
        }

        fn end_broadcast(&self, _handle: &BroadcastHandle) -> Result<(), SinkError> {
            self.ended.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn write_before_pusher_ready_does_not_error() {
        let mut sink = BroadcastSink::with_api(Arc::new(UnconfiguredBroadcastApi {
            _credentials: OauthCredentials {
                client_id: "x".into(),
                client_secret: "y".into(),
                refresh_token: "z".into(),
            },
        }));
        sink.open("flv").unwrap();
        assert!(sink.is_opened());
        assert!(sink.write(b"frame").is_ok());
    }
}
