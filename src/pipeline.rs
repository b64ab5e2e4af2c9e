//! Per-camera pipeline (spec §4.5): connect to one camera's stream,
//! transcode/segment it, fan the encoded bytes out to every configured
//! sink, and restart with exponential backoff on failure.
//!
//! This runs as its own OS process (spawned by the supervisor via
//! self-re-exec) rather than as an async task: every suspension point
//! here is a blocking subprocess read or a plain sleep, so thread-per-
//! responsibility is simpler than threading an executor through it.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write as _};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::config::{CameraDescriptor, StorageDescriptor};
use crate::error::{exit_code, PipelineError, StderrClass};
use crate::motion::{MotionTap, MotionTapHandle, UnconfiguredMotionDetector};
use crate::sink::{self, Sink};
use crate::taxonomy;

/// Container extension written to every sink for each segment.
const SEGMENT_EXT: &str = "mp4";
const MAIN_LOOP_TICK: Duration = Duration::from_secs(1);

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigterm(_: libc_signum) {
    STOP.store(true, Ordering::SeqCst);
}

#[allow(non_camel_case_types)]
type libc_signum = i32;

/// Installs the `SIGTERM` handler that the pipeline process's own
/// "quit" request (spec §4.5) and the supervisor's `stop` both rely on.
pub fn install_signal_handler() -> Result<(), nix::Error> {
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGTERM,
            nix::sys::signal::SigHandler::Handler(handle_sigterm),
        )?;
    }
    Ok(())
}

fn requested_to_stop() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// `base_delay, 2*base_delay, 4*base_delay, ...` (spec §9, Open Question i
/// resolved in SPEC_FULL.md §5): one unified backoff schedule for any
/// trigger that sends the loop back to step 1.
fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

/// Whether the wall clock has crossed a segment boundary since the last
/// check, using the modular rollover test from spec.md §4.5: local time
/// modulo the segment length wrapped around between the previous and
/// current tick.
fn segment_rolled_over(
    previous_local_secs: i64,
    current_local_secs: i64,
    segment_length_secs: i64,
) -> bool {
    if segment_length_secs <= 0 {
        return false;
    }
    let previous_phase = previous_local_secs.rem_euclid(segment_length_secs);
    let current_phase = current_local_secs.rem_euclid(segment_length_secs);
    current_phase < previous_phase
}

fn local_seconds(offset_secs: i64) -> i64 {
    let utc_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    utc_secs + offset_secs
}

fn local_utc_offset_secs() -> i64 {
    chrono::Local::now().offset().local_minus_utc() as i64
}

struct SinkEntry {
    name: String,
    sink: Box<dyn Sink>,
    /// Set the instant a `write()` fails; skipped for the rest of the
    /// segment rather than retried block-by-block (spec §4.5 fan-out
    /// discipline).
    failed: bool,
}

struct ActiveSinks {
    entries: Vec<SinkEntry>,
}

impl ActiveSinks {
    /// Opens every configured sink fresh, regardless of whether it
    /// succeeded last segment (Open Question ii, SPEC_FULL.md §5): a sink
    /// that failed `open()` gets a clean new attempt every segment. This
    /// also clears `failed`, so a sink that died mid-write last segment
    /// gets the same fresh attempt.
    fn open_all(&mut self) -> usize {
        let mut opened = 0;
        for entry in self.entries.iter_mut() {
            match entry.sink.open(SEGMENT_EXT) {
                Ok(()) => {
                    entry.failed = false;
                    opened += 1;
                }
                Err(e) => {
                    entry.failed = true;
                    warn!(sink = %entry.name, error = %e, "sink failed to open for this segment");
                }
            }
        }
        opened
    }

    /// Writes to every sink still active this segment. Returns `false` once
    /// every sink has failed, so the caller can raise `NoSink` and restart
    /// rather than keep spinning with nowhere to send bytes.
    fn write_all(&mut self, data: &[u8]) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.failed || !entry.sink.is_opened() {
                continue;
            }
            if let Err(e) = entry.sink.write(data) {
                warn!(sink = %entry.name, error = %e, "sink write failed, dropping it for the rest of this segment");
                entry.failed = true;
            }
        }
        self.entries.iter().any(|e| !e.failed && e.sink.is_opened())
    }

    fn close_all(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Err(e) = entry.sink.close() {
                warn!(sink = %entry.name, error = %e, "sink failed to close cleanly");
            }
        }
    }
}

enum ReaderEvent {
    FirstByte,
    StderrLine(StderrClass),
    ByteReaderDone,
    LineReaderDone,
}

/// Spawns the external transcoder, invoked with the camera's transport and
/// opaque transcoder options (spec: the transcoder itself is an external
/// collaborator; only its stdout/stderr contract is specified).
fn spawn_transcoder(camera: &CameraDescriptor) -> std::io::Result<Child> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-rtsp_transport").arg(&camera.transport);
    cmd.arg("-i").arg(&camera.url);
    if let Some((w, h)) = camera.resolution {
        cmd.arg("-s").arg(format!("{w}x{h}"));
    }
    for (key, value) in &camera.transcoder_options {
        cmd.arg(format!("-{key}")).arg(value);
    }
    cmd.args(["-f", "mp4", "-movflags", "frag_keyframe+empty_moov", "pipe:1"]);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.spawn()
}

pub struct CameraPipeline {
    camera: CameraDescriptor,
    base_delay: Duration,
    max_attempts: u32,
}

impl CameraPipeline {
    pub fn new(camera: CameraDescriptor) -> Self {
        Self {
            camera,
            base_delay: Duration::from_secs(1),
            max_attempts: 10,
        }
    }

    fn build_sinks(&self, storage: &HashMap<String, StorageDescriptor>) -> ActiveSinks {
        let entries = self
            .camera
            .sinks
            .iter()
            .filter_map(|name| {
                storage.get(name).map(|descriptor| SinkEntry {
                    name: name.clone(),
                    sink: sink::build(descriptor, &self.camera.name),
                    failed: false,
                })
            })
            .collect();
        ActiveSinks { entries }
    }

    /// Runs until stopped (returns `exit_code::OK`) or until retries are
    /// exhausted (returns `exit_code::EIO`). This is the sole entry point
    /// the `__run-pipeline` subcommand calls.
    pub fn run(&self, storage: &HashMap<String, StorageDescriptor>) -> i32 {
        let segment_length = self
            .camera
            .sinks
            .iter()
            .filter_map(|n| storage.get(n))
            .map(|d| d.segment_length_secs())
            .min()
            .unwrap_or(3600) as i64;
        let utc_offset = local_utc_offset_secs();

        // One tap for the whole process lifetime, spanning transcoder
        // restarts and segment rollovers alike, matching the original
        // recorder's single motion thread per camera.
        let motion_tap = self
            .camera
            .motion
            .clone()
            .map(|cfg| MotionTap::spawn(Box::new(UnconfiguredMotionDetector::new(cfg))));
        let motion_handle = motion_tap.as_ref().map(|t| t.handle());

        let mut attempt: u32 = 0;
        let mut sinks = self.build_sinks(storage);

        let code = loop {
            if requested_to_stop() {
                sinks.close_all();
                break exit_code::OK;
            }

            let opened = sinks.open_all();
            if opened == 0 {
                if attempt >= self.max_attempts {
                    break exit_code::EIO;
                }
                let delay = backoff_delay(self.base_delay, attempt);
                attempt += 1;
                info!(camera = %self.camera.name, attempt, delay_secs = delay.as_secs(), "no sink opened, backing off");
                std::thread::sleep(delay);
                continue;
            }

            match self.run_segment_loop(&mut sinks, segment_length, utc_offset, motion_handle.clone()) {
                Ok(SegmentOutcome::Stopped) => {
                    sinks.close_all();
                    break exit_code::OK;
                }
                Ok(SegmentOutcome::ReaderJoinTimedOut) => {
                    warn!(camera = %self.camera.name, "reader join timed out after quit");
                    if requested_to_stop() {
                        sinks.close_all();
                        break exit_code::OK;
                    }
                    attempt = 0;
                }
                Ok(SegmentOutcome::RestartRequested) => {
                    attempt = 0;
                }
                Err(e) => {
                    if attempt >= self.max_attempts {
                        warn!(camera = %self.camera.name, error = %e, "retries exhausted");
                        sinks.close_all();
                        break exit_code::EIO;
                    }
                    let delay = backoff_delay(self.base_delay, attempt);
                    attempt += 1;
                    warn!(camera = %self.camera.name, error = %e, attempt, delay_secs = delay.as_secs(), "pipeline error, backing off");
                    std::thread::sleep(delay);
                }
            }
        };

        if let Some(tap) = motion_tap {
            tap.shutdown();
        }
        code
    }

    fn run_segment_loop(
        &self,
        sinks: &mut ActiveSinks,
        segment_length: i64,
        utc_offset: i64,
        motion: Option<MotionTapHandle>,
    ) -> Result<SegmentOutcome, PipelineError> {
        let mut child = spawn_transcoder(&self.camera)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Internal("transcoder has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::Internal("transcoder has no stderr".into()))?;

        let (event_tx, event_rx) = sync_channel::<ReaderEvent>(16);
        let (byte_tx, byte_rx) = sync_channel::<Vec<u8>>(64);

        let byte_event_tx = event_tx.clone();
        let byte_reader = std::thread::spawn(move || {
            let mut buf = [0u8; 64 * 1024];
            let mut first = true;
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if first {
                            let _ = byte_event_tx.send(ReaderEvent::FirstByte);
                            first = false;
                        }
                        // Same fan-out point as the sinks: the motion tap
                        // never blocks this thread even if its consumer
                        // stalls (see MotionTapHandle::offer).
                        if let Some(tap) = &motion {
                            tap.offer(&buf[..n]);
                        }
                        if byte_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = byte_event_tx.send(ReaderEvent::ByteReaderDone);
        });

        let line_event_tx = event_tx.clone();
        let line_reader = std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(|l| l.ok()) {
                let class = taxonomy::classify(&line);
                if line_event_tx.send(ReaderEvent::StderrLine(class)).is_err() {
                    break;
                }
            }
            let _ = line_event_tx.send(ReaderEvent::LineReaderDone);
        });

        let connect_timeout = Duration::from_secs(self.camera.connect_timeout_secs);
        let connect_deadline = Instant::now() + connect_timeout;
        let mut connected = false;
        while !connected && Instant::now() < connect_deadline {
            match event_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(ReaderEvent::FirstByte) => connected = true,
                Ok(ReaderEvent::StderrLine(StderrClass::Warning(line))) => {
                    warn!(camera = %self.camera.name, %line, "transcoder warning during connect")
                }
                Ok(ReaderEvent::StderrLine(class)) => {
                    let _ = kill_and_join(child, byte_reader, line_reader);
                    return Err(PipelineError::Transcoder(format!("{class:?}")));
                }
                Ok(ReaderEvent::ByteReaderDone) | Ok(ReaderEvent::LineReaderDone) => {
                    let _ = kill_and_join(child, byte_reader, line_reader);
                    return Err(PipelineError::NoSink);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if !connected {
            let _ = kill_and_join(child, byte_reader, line_reader);
            return Err(PipelineError::Timeout("no first byte before connect timeout".into()));
        }

        let mut previous_local = local_seconds(utc_offset);
        let mut last_tick = Instant::now();
        let outcome = loop {
            if requested_to_stop() {
                break SegmentOutcome::Stopped;
            }

            match byte_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(block) => {
                    if !sinks.write_all(&block) {
                        warn!(camera = %self.camera.name, "every sink failed mid-segment, restarting");
                        kill_and_join(child, byte_reader, line_reader);
                        return Err(PipelineError::NoSink);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break SegmentOutcome::RestartRequested,
            }

            let mut restart = false;
            while let Ok(event) = event_rx.try_recv() {
                match event {
                    ReaderEvent::StderrLine(StderrClass::Warning(line)) => {
                        warn!(camera = %self.camera.name, %line, "transcoder warning")
                    }
                    ReaderEvent::StderrLine(class) => {
                        info!(camera = %self.camera.name, ?class, "restarting segment loop");
                        restart = true;
                    }
                    ReaderEvent::ByteReaderDone | ReaderEvent::LineReaderDone => {
                        restart = true;
                    }
                    ReaderEvent::FirstByte => {}
                }
            }
            if restart {
                break SegmentOutcome::RestartRequested;
            }

            if last_tick.elapsed() >= MAIN_LOOP_TICK {
                last_tick = Instant::now();
                let now_local = local_seconds(utc_offset);
                if segment_rolled_over(previous_local, now_local, segment_length) {
                    sinks.close_all();
                    sinks.open_all();
                }
                previous_local = now_local;
            }
        };

        finish(child, byte_reader, line_reader, outcome)
    }
}

enum SegmentOutcome {
    Stopped,
    RestartRequested,
    ReaderJoinTimedOut,
}

fn finish(
    mut child: Child,
    byte_reader: std::thread::JoinHandle<()>,
    line_reader: std::thread::JoinHandle<()>,
    outcome: SegmentOutcome,
) -> Result<SegmentOutcome, PipelineError> {
    if matches!(outcome, SegmentOutcome::Stopped) {
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(b"q");
        }
        child.stdin.take();
        let joined = join_with_timeout(&byte_reader, Duration::from_secs(5))
            && join_with_timeout(&line_reader, Duration::from_secs(5));
        let _ = child.wait();
        if !joined {
            let _ = child.kill();
            return Ok(SegmentOutcome::ReaderJoinTimedOut);
        }
    } else {
        kill_and_join(child, byte_reader, line_reader);
        return Ok(outcome);
    }
    Ok(outcome)
}

fn kill_and_join(
    mut child: Child,
    byte_reader: std::thread::JoinHandle<()>,
    line_reader: std::thread::JoinHandle<()>,
) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = byte_reader.join();
    let _ = line_reader.join();
}

/// `std::thread::JoinHandle` has no native timed join; poll `is_finished`
/// (which doesn't require consuming the handle) up to `timeout`.
fn join_with_timeout(handle: &std::thread::JoinHandle<()>, timeout: Duration) -> bool {
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
    }

    #[test]
    fn detects_rollover_across_a_segment_boundary() {
        // 60s segments: phase goes 58 -> 61 (wraps to 1), which is a
        // rollover.
        assert!(segment_rolled_over(58, 61, 60));
    }

    #[test]
    fn no_rollover_within_the_same_segment() {
        assert!(!segment_rolled_over(10, 40, 60));
    }

    #[test]
    fn zero_length_segments_never_roll_over() {
        assert!(!segment_rolled_over(58, 61, 0));
    }

    struct FlakySink {
        fails_from_call: usize,
        calls: usize,
    }

    impl Sink for FlakySink {
        fn open(&mut self, _ext: &str) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
        fn is_opened(&self) -> bool {
            true
        }
        fn write(&mut self, _data: &[u8]) -> Result<(), crate::error::SinkError> {
            self.calls += 1;
            if self.calls >= self.fails_from_call {
                Err(crate::error::SinkError::Network("boom".into()))
            } else {
                Ok(())
            }
        }
        fn close(&mut self) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
    }

    fn entry(name: &str, fails_from_call: usize) -> SinkEntry {
        SinkEntry {
            name: name.to_string(),
            sink: Box::new(FlakySink { fails_from_call, calls: 0 }),
            failed: false,
        }
    }

    #[test]
    fn a_failed_sink_is_skipped_for_the_rest_of_the_segment() {
        let mut sinks = ActiveSinks {
            entries: vec![entry("flaky", 2), entry("healthy", usize::MAX)],
        };
        assert!(sinks.write_all(b"one"));
        assert!(sinks.write_all(b"two"));
        assert!(sinks.entries[0].failed);
        // A third write must not retry the failed sink: the healthy one
        // keeps the set alive.
        assert!(sinks.write_all(b"three"));
    }

    #[test]
    fn write_all_reports_false_once_every_sink_has_failed() {
        let mut sinks = ActiveSinks {
            entries: vec![entry("a", 1), entry("b", 1)],
        };
        assert!(!sinks.write_all(b"one"));
    }

    #[test]
    fn open_all_clears_failed_flags() {
        let mut sinks = ActiveSinks {
            entries: vec![entry("a", 1)],
        };
        sinks.write_all(b"one");
        assert!(sinks.entries[0].failed);
        sinks.open_all();
        assert!(!sinks.entries[0].failed);
    }
}
