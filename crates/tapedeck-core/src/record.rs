//! Exchange-boundary recording state machine.
//!
//! ```text
//! idle ──on_send──▶ capturing ──on_exchange_end──▶ idle
//!                       └──on_process_exit──▶ terminal
//! ```
//!
//! Each send opens an exchange; the expect layer closes it on match, timeout,
//! or process exit. At close the captured chunks run through the output
//! decorator and the redactor, then join the in-memory tape. Nothing touches
//! disk until [`Recorder::finalize`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::decorate::DecoratorSet;
use crate::error::{Error, Result};
use crate::matching::{KeyBuilder, MatchingContext};
use crate::redact::{is_secret_key_name, Redactor};
use crate::sink::ChunkSink;
use crate::store::TapeStore;
use crate::tape::{
    Chunk, Exchange, ExitInfo, InputKind, InputRecord, OutputRecord, PreState, SessionInfo, Tape,
    TapeMeta, SCHEMA_VERSION,
};

/// Recorder lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// No open exchange.
    Idle,
    /// An exchange is open; the sink is accumulating chunks.
    Capturing,
    /// The process exited; only finalize is permitted.
    Terminal,
}

struct PendingExchange {
    ctx: MatchingContext,
    input: InputRecord,
    sent_at: Instant,
    input_redactions: usize,
}

/// Records one session into an in-memory tape, promoted to disk at finalize.
pub struct Recorder {
    state: RecorderState,
    store: Arc<TapeStore>,
    keys: KeyBuilder,
    redactor: Redactor,
    decorators: DecoratorSet,
    sink: ChunkSink,
    meta: TapeMeta,
    session: SessionInfo,
    exchanges: Vec<Exchange>,
    pending: Option<PendingExchange>,
    strict: bool,
}

impl Recorder {
    /// Build a recorder for one session.
    ///
    /// Fails with [`Error::Redaction`] when built-in redaction has been
    /// disabled via the environment and the caller did not explicitly allow
    /// unredacted recording.
    pub fn new(
        store: Arc<TapeStore>,
        keys: KeyBuilder,
        redactor: Redactor,
        decorators: DecoratorSet,
        mut meta: TapeMeta,
        session: SessionInfo,
        buffer_ceiling: usize,
        strict: bool,
        allow_unredacted: bool,
    ) -> Result<Self> {
        if !redactor.builtins_enabled() && !allow_unredacted {
            return Err(Error::Redaction(
                "built-in redaction is disabled (CC_REDACT=0); refusing to record without \
                 an explicit unredacted override"
                    .into(),
            ));
        }
        meta.env = filter_env_snapshot(&keys, meta.env);
        Ok(Self {
            state: RecorderState::Idle,
            store,
            keys,
            redactor,
            decorators,
            sink: ChunkSink::new(buffer_ceiling),
            meta,
            session,
            exchanges: Vec::new(),
            pending: None,
            strict,
        })
    }

    #[must_use]
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Number of exchanges captured so far.
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    /// Open a new exchange for input just sent to the process.
    pub fn on_send(
        &mut self,
        data: &[u8],
        kind: InputKind,
        prompt: &str,
        state_hash: Option<String>,
    ) -> Result<()> {
        match self.state {
            RecorderState::Terminal => return Err(Error::SessionClosed),
            RecorderState::Capturing => return Err(Error::RecorderReentrancy),
            RecorderState::Idle => {}
        }

        let ctx = MatchingContext {
            program: self.meta.program.clone(),
            args: self.meta.args.clone(),
            env: self.meta.env.clone(),
            cwd: self.meta.cwd.clone(),
            prompt: prompt.to_string(),
            state_hash,
        };
        let decorated = self.decorators.decorate_input(&ctx, data);
        let mut input = InputRecord::from_bytes(kind, &decorated);
        let mut input_redactions = 0;
        if let Some(text) = input.text.take() {
            let (redacted, n) = self.redactor.redact_text(&text);
            input.text = Some(redacted);
            input_redactions = n;
        }

        let now = Instant::now();
        self.sink.begin_exchange(now);
        self.pending = Some(PendingExchange {
            ctx,
            input,
            sent_at: now,
            input_redactions,
        });
        self.state = RecorderState::Capturing;
        Ok(())
    }

    /// Forward one captured output chunk. Output outside an open exchange
    /// (e.g. a startup banner before the first send) is not recorded; the
    /// expect layer folds it into the next prompt snapshot instead.
    pub fn on_output(&mut self, data: &[u8]) -> Result<()> {
        if self.state == RecorderState::Capturing {
            self.sink.push(data)?;
        }
        Ok(())
    }

    /// Close the open exchange after an expect match or timeout.
    pub fn on_exchange_end(
        &mut self,
        annotations: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        if self.state == RecorderState::Terminal {
            return Err(Error::SessionClosed);
        }
        if self.state == RecorderState::Capturing {
            self.flush_exchange(None, annotations)?;
            self.state = RecorderState::Idle;
        }
        Ok(())
    }

    /// Record process exit. Closes the open exchange when there is one,
    /// otherwise attaches the exit to the last captured exchange.
    pub fn on_process_exit(&mut self, code: i32, signal: Option<String>) -> Result<()> {
        let exit = ExitInfo { code, signal };
        match self.state {
            RecorderState::Terminal => return Err(Error::SessionClosed),
            RecorderState::Capturing => {
                self.flush_exchange(Some(exit), BTreeMap::new())?;
            }
            RecorderState::Idle => {
                if let Some(last) = self.exchanges.last_mut() {
                    last.exit = Some(exit);
                }
            }
        }
        self.state = RecorderState::Terminal;
        Ok(())
    }

    fn flush_exchange(
        &mut self,
        exit: Option<ExitInfo>,
        mut annotations: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let pending = self.pending.take().expect("capturing implies pending");
        let raw_chunks = self.sink.take()?;

        let mut redactions = pending.input_redactions;
        let mut chunks = Vec::with_capacity(raw_chunks.len());
        for raw in raw_chunks {
            let decorated = self.decorators.decorate_output(&pending.ctx, &raw.data);
            let (clean, n) = self.redactor.redact_bytes(&decorated);
            redactions += n;
            chunks.push(Chunk::from_bytes(raw.delay_ms, &clean));
        }
        if redactions > 0 {
            annotations.insert("redactions".into(), serde_json::Value::from(redactions));
        }

        self.exchanges.push(Exchange {
            pre: PreState {
                prompt: pending.ctx.prompt.clone(),
                state_hash: pending.ctx.state_hash.clone(),
            },
            input: pending.input,
            output: OutputRecord { chunks },
            exit,
            dur_ms: pending.sent_at.elapsed().as_millis() as u64,
            annotations,
        });
        Ok(())
    }

    /// Write the tape through the store's atomic path. Returns `None` when
    /// nothing was captured (no file is written) or when a non-strict write
    /// failed and was logged instead.
    pub fn finalize(mut self, relative: &Path) -> Result<Option<PathBuf>> {
        if self.state == RecorderState::Capturing {
            // Close dangling exchange so its chunks are not lost.
            self.flush_exchange(None, BTreeMap::new())?;
        }
        if self.exchanges.is_empty() {
            tracing::debug!("no exchanges captured; skipping tape write");
            return Ok(None);
        }

        let ctx = MatchingContext {
            program: self.meta.program.clone(),
            args: self.meta.args.clone(),
            env: self.meta.env.clone(),
            cwd: self.meta.cwd.clone(),
            prompt: String::new(),
            state_hash: None,
        };
        let tape = Tape {
            schema_version: SCHEMA_VERSION,
            meta: self.meta,
            session: self.session,
            exchanges: self.exchanges,
            extra: BTreeMap::new(),
        };
        let tape = self.decorators.decorate_tape(&ctx, tape);

        match self.store.write_tape(&tape, relative) {
            Ok(path) => Ok(Some(path)),
            Err(e) if !self.strict => {
                tracing::warn!(
                    relative = %relative.display(),
                    error = %e,
                    "tape write failed; session continues without a tape"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("state", &self.state)
            .field("exchanges", &self.exchanges.len())
            .finish()
    }
}

/// Restrict the env snapshot the same way matching does, and mask values of
/// secret-bearing names so tapes never leak credentials through metadata.
fn filter_env_snapshot(
    keys: &KeyBuilder,
    env: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    env.into_iter()
        .filter(|(k, _)| {
            if !keys.allow_env.is_empty() {
                return keys.allow_env.iter().any(|a| a == k);
            }
            !crate::matching::DEFAULT_IGNORED_ENV.contains(&k.as_str())
                && !keys.ignore_env.iter().any(|i| i == k)
        })
        .map(|(k, v)| {
            if is_secret_key_name(&k) {
                (k, "<REDACTED:ENV>".to_string())
            } else {
                (k, v)
            }
        })
        .collect()
}
