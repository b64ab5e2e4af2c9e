//! Motion-detection tap: a second, best-effort consumer of the same
//! encoded-byte stream the pipeline fans out to its sinks.
//!
//! The detection algorithm itself is an external collaborator (out of
//! scope here, same as the transcoder); this module only owns the plumbing
//! that gets frames to it without ever slowing down the recording path —
//! grounded on the original recorder's motion thread, which is fed via a
//! `frame_iter.write(frame)` call sitting right next to each writer's
//! `write(frame)` in the main read loop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::MotionConfig;

/// External collaborator: decides whether a decimated frame represents
/// motion. Implemented elsewhere against a real pixel-diff or ML backend;
/// this module only depends on the trait.
pub trait MotionDetector: Send {
    fn observe(&mut self, frame: &[u8]);
}

/// Placeholder implementation wired from a camera's [`MotionConfig`] until a
/// real detector is supplied; it never raises an alert.
pub struct UnconfiguredMotionDetector {
    _config: MotionConfig,
}

impl UnconfiguredMotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self { _config: config }
    }
}

impl MotionDetector for UnconfiguredMotionDetector {
    fn observe(&mut self, _frame: &[u8]) {}
}

/// Frames offered between ticks of this period are coalesced into the one
/// sitting in the mailbox; only the latest survives.
const FRAMESTEP: usize = 5;

struct Mailbox {
    slot: Mutex<Option<Vec<u8>>>,
    cond: Condvar,
    stop: Mutex<bool>,
}

/// Cheaply cloneable handle used to offer bytes from the byte-reader thread
/// without ever blocking it: a single-slot mailbox overwritten in place,
/// not a bounded channel, so a slow or stalled detector thread can never
/// back up onto the recording path.
#[derive(Clone)]
pub struct MotionTapHandle {
    mailbox: Arc<Mailbox>,
    counter: Arc<std::sync::atomic::AtomicUsize>,
}

impl MotionTapHandle {
    /// Frame-decimated, lossy offer: most calls return immediately having
    /// done nothing, and a frame already waiting in the mailbox is dropped
    /// in favor of a newer one rather than queued.
    pub fn offer(&self, data: &[u8]) {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        if n % FRAMESTEP != 0 {
            return;
        }
        let mut guard = self.mailbox.slot.lock().unwrap();
        *guard = Some(data.to_vec());
        self.mailbox.cond.notify_one();
    }
}

/// Owns the background thread that drains a [`MotionTapHandle`]'s mailbox
/// into a [`MotionDetector`]. One tap lives for the lifetime of a camera
/// pipeline run, spanning segment rollovers, matching the original
/// recorder's single motion thread per camera process.
pub struct MotionTap {
    handle: MotionTapHandle,
    thread: Option<JoinHandle<()>>,
}

impl MotionTap {
    pub fn spawn(mut detector: Box<dyn MotionDetector>) -> Self {
        let mailbox = Arc::new(Mailbox {
            slot: Mutex::new(None),
            cond: Condvar::new(),
            stop: Mutex::new(false),
        });
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let thread_mailbox = mailbox.clone();
        let thread = std::thread::spawn(move || loop {
            let mut guard = thread_mailbox.slot.lock().unwrap();
            while guard.is_none() {
                if *thread_mailbox.stop.lock().unwrap() {
                    return;
                }
                let (g, _timeout) = thread_mailbox
                    .cond
                    .wait_timeout(guard, Duration::from_millis(250))
                    .unwrap();
                guard = g;
            }
            let frame = guard.take().unwrap();
            drop(guard);
            detector.observe(&frame);
        });

        Self {
            handle: MotionTapHandle { mailbox, counter },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> MotionTapHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) {
        *self.handle.mailbox.stop.lock().unwrap() = true;
        self.handle.mailbox.cond.notify_one();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDetector {
        seen: Arc<AtomicUsize>,
    }

    impl MotionDetector for CountingDetector {
        fn observe(&mut self, _frame: &[u8]) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn decimated_frames_reach_the_detector() {
        let seen = Arc::new(AtomicUsize::new(0));
        let tap = MotionTap::spawn(Box::new(CountingDetector { seen: seen.clone() }));
        let handle = tap.handle();
        for _ in 0..FRAMESTEP * 3 {
            handle.offer(b"frame");
        }
        // Give the background thread a chance to drain the mailbox.
        std::thread::sleep(Duration::from_millis(200));
        tap.shutdown();
        assert!(seen.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn sub_decimation_offers_never_reach_the_detector() {
        let seen = Arc::new(AtomicUsize::new(0));
        let tap = MotionTap::spawn(Box::new(CountingDetector { seen: seen.clone() }));
        let handle = tap.handle();
        for _ in 0..FRAMESTEP - 1 {
            handle.offer(b"frame");
        }
        std::thread::sleep(Duration::from_millis(100));
        tap.shutdown();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
