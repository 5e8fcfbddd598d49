//! Session configuration consumed by the transport facade.

use std::path::PathBuf;
use std::sync::Arc;

use crate::decorate::DecoratorSet;
use crate::latency::LatencyPolicy;
use crate::matching::{ArgFilter, CommandMatcher, KeyBuilder, StdinMatcher};
use crate::namegen::TapeNameGenerator;
use crate::normalize::Normalizer;
use crate::redact::CustomPattern;
use crate::tape::PtyDims;

/// Default ceiling on buffered output per exchange before spilling to disk.
pub const DEFAULT_BUFFER_CEILING: usize = 16 * 1024 * 1024;

/// Recording behavior for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordMode {
    /// Record only when no tape matches this session's identity; replay
    /// otherwise.
    #[default]
    New,
    /// Always record, truncating any tape at the target path.
    Overwrite,
    /// Never write tapes.
    Disabled,
}

/// Behavior when replay finds no matching exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    /// Surface a tape miss to the caller.
    #[default]
    NotFound,
    /// Swap in a live transport and re-issue the send.
    Proxy,
}

/// Everything the facade needs to decide between live and replay and to wire
/// the recording pipeline.
#[derive(Clone)]
pub struct SessionConfig {
    /// Root directory of the tape store.
    pub tapes_root: PathBuf,
    pub record: RecordMode,
    pub fallback: FallbackMode,
    /// When non-empty, only these environment names participate in matching
    /// and are snapshotted into tapes.
    pub allow_env: Vec<String>,
    /// Additional names excluded from matching (on top of the built-in noise
    /// list).
    pub ignore_env: Vec<String>,
    pub ignore_args: Vec<ArgFilter>,
    pub ignore_stdin: bool,
    pub command_matcher: Option<Arc<dyn CommandMatcher>>,
    pub stdin_matcher: Option<Arc<dyn StdinMatcher>>,
    pub decorators: DecoratorSet,
    pub latency: LatencyPolicy,
    /// Per-exchange fault probability, 0-100.
    pub error_rate: u8,
    /// Seed for fault injection and latency draws when the tape carries none.
    pub seed: u64,
    /// Tag used by the default name generator.
    pub tag: Option<String>,
    pub name_generator: Option<Arc<dyn TapeNameGenerator>>,
    /// Extra redaction patterns; malformed patterns fail session start.
    pub redaction_patterns: Vec<CustomPattern>,
    /// Permit recording with built-in redaction disabled via `CC_REDACT=0`.
    pub allow_unredacted: bool,
    /// Print the new/unused tape summary at close.
    pub summary: bool,
    /// Suppress all summary output, regardless of `summary`.
    pub silent: bool,
    pub debug: bool,
    /// Surface recording write failures instead of logging and continuing.
    pub strict_recording: bool,
    pub pty: PtyDims,
    /// Byte ceiling for in-memory chunks per exchange; beyond it, older
    /// chunks spill to a temp file.
    pub buffer_ceiling: usize,
    /// Default expect timeout in milliseconds when the caller passes none.
    pub expect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tapes_root: PathBuf::from("tapes"),
            record: RecordMode::default(),
            fallback: FallbackMode::default(),
            allow_env: Vec::new(),
            ignore_env: Vec::new(),
            ignore_args: Vec::new(),
            ignore_stdin: false,
            command_matcher: None,
            stdin_matcher: None,
            decorators: DecoratorSet::default(),
            latency: LatencyPolicy::Recorded,
            error_rate: 0,
            seed: 0,
            tag: None,
            name_generator: None,
            redaction_patterns: Vec::new(),
            allow_unredacted: false,
            summary: true,
            silent: false,
            debug: false,
            strict_recording: false,
            pty: PtyDims::default(),
            buffer_ceiling: DEFAULT_BUFFER_CEILING,
            expect_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    /// Convenience constructor rooted at a tapes directory.
    #[must_use]
    pub fn new(tapes_root: impl Into<PathBuf>) -> Self {
        Self {
            tapes_root: tapes_root.into(),
            ..Self::default()
        }
    }

    /// The key builder derived from this configuration. Record, lookup, and
    /// index sides all use the same builder so keys collide exactly.
    #[must_use]
    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder {
            normalizer: Normalizer::default(),
            allow_env: self.allow_env.clone(),
            ignore_env: self.ignore_env.clone(),
            ignore_args: self.ignore_args.clone(),
            ignore_stdin: self.ignore_stdin,
            command_matcher: self.command_matcher.clone(),
            stdin_matcher: self.stdin_matcher.clone(),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("tapes_root", &self.tapes_root)
            .field("record", &self.record)
            .field("fallback", &self.fallback)
            .field("latency", &self.latency)
            .field("error_rate", &self.error_rate)
            .field("seed", &self.seed)
            .field("summary", &self.summary)
            .field("silent", &self.silent)
            .finish_non_exhaustive()
    }
}
