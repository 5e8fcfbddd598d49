//! Error types for the tapedeck engine.
//!
//! One crate-level [`Error`] enum covers every failure kind that crosses the
//! public boundary. Timeouts and tape misses are ordinary typed returns here,
//! not panics: callers are expected to match on them.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure kinds surfaced across the crate boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// A tape file did not conform to the accepted schema.
    #[error("invalid tape {path}: {message}")]
    Schema {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    /// No recorded exchange matches the current send.
    #[error("no tape matches input {input:?} (key {key})")]
    TapeMiss {
        /// Hex digest of the failing composite match key.
        key: String,
        /// Canonical input text that failed to match.
        input: String,
        /// Closest recorded inputs, nearest first, at most five.
        nearest: Vec<String>,
    },

    /// A user-supplied redaction pattern failed to compile, or recording was
    /// requested with redaction disabled and no explicit override.
    #[error("redaction error: {0}")]
    Redaction(String),

    /// The advisory file lock on a tape path could not be acquired in time.
    #[error("tape store busy: {path} still locked after {waited_ms} ms")]
    StoreBusy { path: PathBuf, waited_ms: u64 },

    /// `send` was called while an exchange was still open.
    #[error("send while an exchange is open; pair every send with an expect")]
    RecorderReentrancy,

    /// Operation on a session that has already been closed.
    #[error("session is closed")]
    SessionClosed,

    /// `expect` ran out of time before any pattern matched.
    #[error("timed out after {timeout_ms} ms waiting for patterns")]
    Timeout {
        timeout_ms: u64,
        /// Tail of the output buffer at the moment of the timeout.
        tail: String,
    },

    /// The child process ended before a pattern matched.
    #[error("process ended (code {code:?}, signal {signal:?}) before match")]
    Process {
        code: Option<i32>,
        signal: Option<String>,
    },

    /// Fault injection truncated the exchange mid-stream.
    #[error("injected timeout after {streamed} of {total} chunks")]
    SimulatedTimeout { streamed: usize, total: usize },

    /// Fault injection synthesized a process exit.
    #[error("injected process exit with code {code}")]
    SimulatedExit { code: i32 },

    /// Invalid session configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// PTY allocation or child spawn failure.
    #[error("pty error: {0}")]
    Pty(#[from] anyhow::Error),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure outside the tape codec.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable kind string for this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema-error",
            Self::TapeMiss { .. } => "tape-miss",
            Self::Redaction(_) => "redaction-error",
            Self::StoreBusy { .. } => "store-busy",
            Self::RecorderReentrancy => "recorder-reentrancy",
            Self::SessionClosed => "session-closed",
            Self::Timeout { .. } => "timeout",
            Self::Process { .. } => "process-error",
            Self::SimulatedTimeout { .. } => "simulated-timeout",
            Self::SimulatedExit { .. } => "simulated-exit",
            Self::Config(_) => "config-error",
            Self::Pty(_) => "pty-error",
            Self::Io(_) => "io-error",
            Self::Json(_) => "serde-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let err = Error::TapeMiss {
            key: "ab".into(),
            input: "x".into(),
            nearest: vec![],
        };
        assert_eq!(err.kind(), "tape-miss");
        assert_eq!(Error::RecorderReentrancy.kind(), "recorder-reentrancy");
        assert_eq!(Error::SessionClosed.kind(), "session-closed");
        assert_eq!(
            Error::SimulatedTimeout {
                streamed: 1,
                total: 2
            }
            .kind(),
            "simulated-timeout"
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert_eq!(err.kind(), "io-error");
    }

    #[test]
    fn display_includes_context() {
        let err = Error::StoreBusy {
            path: PathBuf::from("/t/a.json5"),
            waited_ms: 30_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("a.json5"));
        assert!(msg.contains("30000"));
    }
}
