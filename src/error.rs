//! Typed error taxonomy (spec §7).
//!
//! Three enums cover the three failure surfaces: sinks, transcoder stderr
//! classification, and the pipeline loop itself. `anyhow` is reserved for
//! the CLI boundary in `main.rs`.

use thiserror::Error;

/// Errors a [`crate::sink::Sink`] can raise from `open`/`write`/`close`.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is already open")]
    AlreadyOpen,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("background uploader thread died: {0}")]
    InternalThread(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Classification of a single line the transcoder wrote to stderr.
///
/// `Warning` carries the raw line and is logged, never propagated as a
/// pipeline error (spec §7: warning-class errors are logged and never
/// propagated).
#[derive(Debug, Clone)]
pub enum StderrClass {
    Unreachable(String),
    Reset(String),
    Aborted(String),
    Warning(String),
}

/// Errors that can unwind the [`crate::pipeline::CameraPipeline`] main loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no sink is open")]
    NoSink,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transcoder reported: {0}")]
    Transcoder(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("all {0} retry attempts exhausted")]
    RetriesExhausted(u32),
}

impl From<SinkError> for PipelineError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Io(e) => PipelineError::Io(e),
            SinkError::Timeout(s) => PipelineError::Timeout(s),
            other => PipelineError::Transcoder(other.to_string()),
        }
    }
}

/// Errors surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced by the control-socket client/server.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("supervisor unreachable: {0}")]
    Unreachable(String),

    #[error("unknown camera {0}")]
    UnknownCamera(String),
}

/// POSIX-style exit codes spec.md §6 names explicitly.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EIO: i32 = 5;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}
