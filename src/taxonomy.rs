//! Classifies a transcoder stderr line into the error taxonomy of spec §7.
//!
//! The patterns mirror the original recorder's stderr scraping: a TCP
//! connect failure, an RTSP `CSeq` resync failure, or a codec-probe
//! failure are distinguished from ordinary warnings so the pipeline can
//! decide whether a line is informational or grounds for tearing the
//! segment down.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::StderrClass;

static UNREACHABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[tcp @ [0-9a-fx]+\]").expect("valid regex"));

static RESET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[rtsp @ [0-9a-fx]+\] CSeq \d+ expected, \d+ received\.")
        .expect("valid regex")
});

static ABORTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Could not find codec parameters").expect("valid regex"));

/// Classify one complete stderr line (no trailing newline).
pub fn classify(line: &str) -> StderrClass {
    if UNREACHABLE.is_match(line) {
        StderrClass::Unreachable(line.to_string())
    } else if RESET.is_match(line) {
        StderrClass::Reset(line.to_string())
    } else if ABORTED.is_match(line) {
        StderrClass::Aborted(line.to_string())
    } else {
        StderrClass::Warning(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_tcp_unreachable() {
        let line = "[tcp @ 0x55d2a1b2c3d0] Connection to tcp://10.0.0.5:554 failed";
        assert!(matches!(classify(line), StderrClass::Unreachable(_)));
    }

    #[test]
    fn classifies_rtsp_cseq_reset() {
        let line = "[rtsp @ 0x55d2a1b2c3d0] CSeq 4 expected, 9 received.";
        assert!(matches!(classify(line), StderrClass::Reset(_)));
    }

    #[test]
    fn classifies_codec_probe_abort() {
        let line = "Could not find codec parameters for stream 0";
        assert!(matches!(classify(line), StderrClass::Aborted(_)));
    }

    #[test]
    fn classifies_other_lines_as_warning() {
        let line = "frame=  120 fps= 25 q=28.0 size=    512kB time=00:00:04.80";
        assert!(matches!(classify(line), StderrClass::Warning(_)));
    }
}
