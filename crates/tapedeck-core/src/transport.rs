//! The transport facade: one interface over live PTY and replay.
//!
//! A [`Session`] picks live or replay at start based on record mode, fallback
//! mode, and whether a tape already matches the session identity. Callers
//! drive `send`/`send_line`/`expect`/`is_alive`/`close` and cannot observe
//! which variant is underneath except through side channels (timing, PID).
//!
//! The live variant spawns the child under a PTY via `portable-pty`, tees
//! the read loop through the chunk sink into the recorder, and matches
//! expect patterns over the accumulated buffer. On a proxy fallback the
//! replay variant is swapped out for a live one in place and the pending
//! send is re-issued.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::config::{FallbackMode, RecordMode, SessionConfig};
use crate::error::{Error, Result};
use crate::latency::LatencyPolicy;
use crate::matching::MatchKey;
use crate::namegen::{DefaultNameGenerator, NamingContext, TapeNameGenerator};
use crate::record::Recorder;
use crate::redact::Redactor;
use crate::replay::{compile_patterns, scan_buffer, tail_text, ExpectMatch, ReplayTransport};
use crate::sink::{spawn_reader, SinkEvent, READER_CHANNEL_DEPTH};
use crate::store::TapeStore;
use crate::summary::print_summary;
use crate::tape::{ExitInfo, InputKind, LatencySpec, SessionInfo, TapeMeta};

/// Maximum lines of buffer tail in live timeout diagnostics.
const TAIL_LINES: usize = 50;

/// A live child process driven over a PTY.
pub struct LiveTransport {
    child: Box<dyn portable_pty::Child + Send + Sync>,
    writer: Box<dyn std::io::Write + Send>,
    /// Keeps the PTY master (and thus the reader) alive.
    _master: Box<dyn MasterPty + Send>,
    rx: mpsc::Receiver<SinkEvent>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
    buf: Vec<u8>,
    eof: bool,
    exit: Option<ExitInfo>,
    prompt: String,
    state_hash: Option<String>,
    recorder: Option<Recorder>,
    expect_timeout: Duration,
    closed: bool,
}

impl LiveTransport {
    /// Spawn the child and install the read loop.
    pub fn spawn(
        program: &str,
        args: &[String],
        cwd: &str,
        config: &SessionConfig,
        recorder: Option<Recorder>,
        initial_prompt: String,
    ) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: config.pty.rows,
            cols: config.pty.cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(cwd);
        let child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;
        let (tx, rx) = mpsc::channel(READER_CHANNEL_DEPTH);
        let reader_thread = spawn_reader(reader, tx);

        tracing::debug!(program, ?args, "spawned live child under pty");
        Ok(Self {
            child,
            writer,
            _master: pair.master,
            rx,
            reader_thread: Some(reader_thread),
            buf: Vec::new(),
            eof: false,
            exit: None,
            prompt: initial_prompt,
            state_hash: None,
            recorder,
            expect_timeout: Duration::from_millis(config.expect_timeout_ms),
            closed: false,
        })
    }

    /// Caller-supplied state hash recorded into subsequent pre-states.
    pub fn set_state_hash(&mut self, state_hash: Option<String>) {
        self.state_hash = state_hash;
    }

    /// Write input to the child, opening a recorded exchange first.
    pub fn send(&mut self, data: &[u8], kind: InputKind) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if let Some(exit) = &self.exit {
            return Err(Error::Process {
                code: Some(exit.code),
                signal: exit.signal.clone(),
            });
        }
        if let Some(recorder) = &mut self.recorder {
            recorder.on_send(data, kind, &self.prompt, self.state_hash.clone())?;
        }
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(data.len())
    }

    /// Wait for any pattern over the accumulated PTY output.
    pub async fn expect(
        &mut self,
        patterns: &[&str],
        timeout: Option<Duration>,
    ) -> Result<ExpectMatch> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let regexes = compile_patterns(patterns)?;
        let timeout = timeout.unwrap_or(self.expect_timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(found) = scan_buffer(&mut self.buf, &regexes) {
                self.prompt.clone_from(&found.matched_text);
                if let Some(recorder) = &mut self.recorder {
                    recorder.on_exchange_end(BTreeMap::new())?;
                }
                return Ok(found);
            }

            if self.eof {
                let exit = self.reap_exit()?;
                return Err(Error::Process {
                    code: Some(exit.code),
                    signal: exit.signal,
                });
            }

            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(SinkEvent::Output(bytes)) => {
                        if let Some(recorder) = &mut self.recorder {
                            recorder.on_output(&bytes)?;
                        }
                        self.buf.extend_from_slice(&bytes);
                    }
                    Some(SinkEvent::Eof) | None => {
                        self.eof = true;
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    if let Some(recorder) = &mut self.recorder {
                        recorder.on_exchange_end(BTreeMap::from([(
                            "timeout".to_string(),
                            serde_json::Value::Bool(true),
                        )]))?;
                    }
                    return Err(Error::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                        tail: tail_text(&self.buf, TAIL_LINES),
                    });
                }
            }
        }
    }

    fn reap_exit(&mut self) -> Result<ExitInfo> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        let status = self.child.wait()?;
        let exit = ExitInfo {
            code: status.exit_code() as i32,
            signal: None,
        };
        self.exit = Some(exit.clone());
        if let Some(recorder) = &mut self.recorder {
            recorder.on_process_exit(exit.code, exit.signal.clone())?;
        }
        tracing::debug!(code = exit.code, "live child exited");
        Ok(exit)
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.closed || self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => false,
        }
    }

    /// Terminate the child (always on `force`, and whenever it has not
    /// exited on its own) and collect its exit code.
    pub fn close(&mut self, force: bool) -> Result<Option<i32>> {
        if self.closed {
            return Ok(self.exit.as_ref().map(|e| e.code));
        }
        self.closed = true;

        if self.exit.is_none() {
            let running = matches!(self.child.try_wait(), Ok(None));
            if running || force {
                let _ = self.child.kill();
            }
            match self.child.wait() {
                Ok(status) => {
                    let exit = ExitInfo {
                        code: status.exit_code() as i32,
                        signal: None,
                    };
                    if let Some(recorder) = &mut self.recorder {
                        let _ = recorder.on_process_exit(exit.code, None);
                    }
                    self.exit = Some(exit);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to reap live child");
                }
            }
        }

        // Close the channel so the reader thread can exit once the PTY does.
        self.rx.close();
        if let Some(thread) = self.reader_thread.take() {
            let _ = thread.join();
        }
        Ok(self.exit.as_ref().map(|e| e.code))
    }

    /// Hand the recorder back for finalization.
    pub fn take_recorder(&mut self) -> Option<Recorder> {
        self.recorder.take()
    }

    /// Prompt snapshot after the most recent match.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

impl std::fmt::Debug for LiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTransport")
            .field("eof", &self.eof)
            .field("exit", &self.exit)
            .field("closed", &self.closed)
            .finish()
    }
}

/// The two transport variants behind the facade.
#[derive(Debug)]
pub enum Transport {
    Live(LiveTransport),
    Replay(ReplayTransport),
}

/// How the facade decided to run this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Live child with a recorder attached.
    RecordLive,
    /// Live child, no recording.
    LiveOnly,
    /// Replay from tapes.
    Replay,
}

/// One interactive session: the single owner of its transport.
///
/// Exclusive access through `&mut self` is what serializes `send`/`expect`
/// and protects the in-place transport swap on proxy fallback.
pub struct Session {
    transport: Transport,
    store: Arc<TapeStore>,
    config: SessionConfig,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: String,
    identity: MatchKey,
    mode: SessionMode,
    closed: bool,
    exit_code: Option<i32>,
}

impl Session {
    /// Start a session for `program args`, choosing live or replay:
    ///
    /// | record   | fallback  | tape exists | action          |
    /// |----------|-----------|-------------|-----------------|
    /// | new      | any       | yes         | replay          |
    /// | new      | any       | no          | record + live   |
    /// | overwrite| any       | any         | record + live   |
    /// | disabled | not_found | yes         | replay          |
    /// | disabled | not_found | no          | fail fast       |
    /// | disabled | proxy     | yes         | replay          |
    /// | disabled | proxy     | no          | live, no record |
    pub fn start(config: SessionConfig, program: &str, args: &[String]) -> Result<Self> {
        // A malformed custom redaction pattern aborts the session here,
        // before any child is spawned.
        Redactor::with_custom(&config.redaction_patterns)?;

        let env: BTreeMap<String, String> = std::env::vars().collect();
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| ".".to_string());

        let keys = config.key_builder();
        let store = Arc::new(TapeStore::open(&config.tapes_root, keys.clone())?);
        let identity = keys.identity_key(program, args, &env, &cwd);
        let tape_exists = store.contains_identity(&identity);

        let mode = match (config.record, config.fallback, tape_exists) {
            (RecordMode::New, _, true) => SessionMode::Replay,
            (RecordMode::New, _, false) | (RecordMode::Overwrite, _, _) => SessionMode::RecordLive,
            (RecordMode::Disabled, FallbackMode::NotFound, true)
            | (RecordMode::Disabled, FallbackMode::Proxy, true) => SessionMode::Replay,
            (RecordMode::Disabled, FallbackMode::NotFound, false) => {
                return Err(Error::TapeMiss {
                    key: identity.to_string(),
                    input: String::new(),
                    nearest: Vec::new(),
                });
            }
            (RecordMode::Disabled, FallbackMode::Proxy, false) => SessionMode::LiveOnly,
        };
        tracing::debug!(program, ?mode, tape_exists, "session mode selected");
        if config.debug {
            tracing::debug!(?config, "session configuration");
        }

        let transport = match mode {
            SessionMode::Replay => Transport::Replay(ReplayTransport::new(
                Arc::clone(&store),
                &config,
                program.to_string(),
                args.to_vec(),
                env.clone(),
                cwd.clone(),
            )),
            SessionMode::RecordLive | SessionMode::LiveOnly => {
                let recorder = if mode == SessionMode::RecordLive {
                    Some(build_recorder(&store, &config, program, args, &env, &cwd)?)
                } else {
                    None
                };
                Transport::Live(LiveTransport::spawn(
                    program,
                    args,
                    &cwd,
                    &config,
                    recorder,
                    String::new(),
                )?)
            }
        };

        Ok(Self {
            transport,
            store,
            config,
            program: program.to_string(),
            args: args.to_vec(),
            env,
            cwd,
            identity,
            mode,
            closed: false,
            exit_code: None,
        })
    }

    /// The mode selected at start (replay sessions may switch to live on a
    /// proxy fallback).
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// The shared tape store backing this session.
    #[must_use]
    pub fn store(&self) -> &Arc<TapeStore> {
        &self.store
    }

    /// Send raw bytes.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.send_kind(data, InputKind::Raw).await
    }

    /// Send a text line terminated with the platform newline.
    pub async fn send_line(&mut self, line: &str) -> Result<usize> {
        let mut data = line.as_bytes().to_vec();
        if cfg!(windows) {
            data.extend_from_slice(b"\r\n");
        } else {
            data.push(b'\n');
        }
        self.send_kind(&data, InputKind::Line).await
    }

    /// Caller-supplied state hash folded into subsequent match keys and
    /// recorded pre-states.
    pub fn set_state_hash(&mut self, state_hash: Option<String>) {
        match &mut self.transport {
            Transport::Live(live) => live.set_state_hash(state_hash),
            Transport::Replay(replay) => replay.set_state_hash(state_hash),
        }
    }

    async fn send_kind(&mut self, data: &[u8], kind: InputKind) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let miss = match &mut self.transport {
            Transport::Live(live) => return live.send(data, kind),
            Transport::Replay(replay) => match replay.send(data, kind).await {
                Err(e @ Error::TapeMiss { .. }) => e,
                other => return other,
            },
        };
        if self.config.fallback != FallbackMode::Proxy {
            return Err(miss);
        }

        tracing::debug!("tape miss; proxying to a live child");
        self.switch_to_live()?;
        match &mut self.transport {
            Transport::Live(live) => live.send(data, kind),
            Transport::Replay(_) => unreachable!("just swapped to live"),
        }
    }

    /// Wait for any of `patterns` (regexes over raw output) to match.
    pub async fn expect(
        &mut self,
        patterns: &[&str],
        timeout_ms: Option<u64>,
    ) -> Result<ExpectMatch> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let timeout = timeout_ms.map(Duration::from_millis);
        match &mut self.transport {
            Transport::Live(live) => live.expect(patterns, timeout).await,
            Transport::Replay(replay) => replay.expect(patterns, timeout).await,
        }
    }

    /// Whether the (real or replayed) process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        match &mut self.transport {
            Transport::Live(live) => live.is_alive(),
            Transport::Replay(replay) => replay.is_alive(),
        }
    }

    /// Drain the transport, finalize any recording, and emit the summary.
    /// Returns the exit code when one is known.
    pub async fn close(&mut self, force: bool) -> Result<Option<i32>> {
        if self.closed {
            return Ok(self.exit_code);
        }
        self.closed = true;

        let (exit_code, recorder) = match &mut self.transport {
            Transport::Live(live) => (live.close(force)?, live.take_recorder()),
            Transport::Replay(replay) => {
                let code = replay.exit_info().map(|e| e.code);
                replay.close();
                (code, None)
            }
        };
        if let Some(recorder) = recorder {
            self.finalize_recorder(recorder)?;
        }
        self.exit_code = exit_code;

        if self.config.summary && !self.config.silent {
            print_summary(&self.store.summary());
        }
        Ok(exit_code)
    }

    fn finalize_recorder(&self, recorder: Recorder) -> Result<()> {
        // Overwrite mode replaces the tape already matching this identity;
        // otherwise a fresh name is generated.
        let relative = if self.config.record == RecordMode::Overwrite {
            self.store
                .identity_path(&self.identity)
                .and_then(|p| p.strip_prefix(self.store.root()).ok().map(PathBuf::from))
        } else {
            None
        };
        let relative = match relative {
            Some(rel) => rel,
            None => {
                let naming = NamingContext {
                    program: self.program.clone(),
                    args: self.args.clone(),
                    cwd: self.cwd.clone(),
                    tag: self.config.tag.clone(),
                    identity: self.identity.clone(),
                    unix_ms: Utc::now().timestamp_millis().max(0) as u64,
                };
                match &self.config.name_generator {
                    Some(generator) => generator.tape_path(&naming),
                    None => DefaultNameGenerator.tape_path(&naming),
                }
            }
        };
        recorder.finalize(&relative).map(|_| ())
    }

    fn switch_to_live(&mut self) -> Result<()> {
        let prompt = match &self.transport {
            Transport::Replay(replay) => replay.last_prompt().to_string(),
            Transport::Live(_) => return Ok(()),
        };

        let recorder = if self.config.record != RecordMode::Disabled {
            Some(build_recorder(
                &self.store,
                &self.config,
                &self.program,
                &self.args,
                &self.env,
                &self.cwd,
            )?)
        } else {
            None
        };

        let live = LiveTransport::spawn(
            &self.program,
            &self.args,
            &self.cwd,
            &self.config,
            recorder,
            prompt,
        )?;
        self.transport = Transport::Live(live);
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("program", &self.program)
            .field("mode", &self.mode)
            .field("closed", &self.closed)
            .finish()
    }
}

fn build_recorder(
    store: &Arc<TapeStore>,
    config: &SessionConfig,
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    cwd: &str,
) -> Result<Recorder> {
    // Recording requires a writable root; surface a misconfigured path now.
    std::fs::create_dir_all(&config.tapes_root).map_err(|e| {
        Error::Config(format!(
            "tapes root {} is not writable: {e}",
            config.tapes_root.display()
        ))
    })?;

    let latency_spec = match config.latency {
        LatencyPolicy::Fixed(ms) => Some(LatencySpec::Fixed(ms)),
        LatencyPolicy::Uniform(lo, hi) => Some(LatencySpec::Range(lo, hi)),
        LatencyPolicy::Recorded | LatencyPolicy::Custom(_) => None,
    };
    let meta = TapeMeta {
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        program: program.to_string(),
        args: args.to_vec(),
        env: env.clone(),
        cwd: cwd.to_string(),
        pty: config.pty,
        tag: config.tag.clone(),
        latency: latency_spec,
        error_rate: config.error_rate,
        seed: config.seed,
    };

    Recorder::new(
        Arc::clone(store),
        config.key_builder(),
        Redactor::with_custom(&config.redaction_patterns)?,
        config.decorators.clone(),
        meta,
        SessionInfo::default(),
        config.buffer_ceiling,
        config.strict_recording,
        config.allow_unredacted,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_table_fail_fast_row() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = SessionConfig {
            record: RecordMode::Disabled,
            fallback: FallbackMode::NotFound,
            ..SessionConfig::new(tmp.path())
        };
        let err = Session::start(config, "definitely-not-recorded", &[]).unwrap_err();
        assert_eq!(err.kind(), "tape-miss");
    }

    #[test]
    fn malformed_custom_redaction_aborts_start() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = SessionConfig {
            redaction_patterns: vec![crate::redact::CustomPattern {
                pattern: "([bad".into(),
                replacement: "x".into(),
            }],
            ..SessionConfig::new(tmp.path())
        };
        let err = Session::start(config, "any", &[]).unwrap_err();
        assert_eq!(err.kind(), "redaction-error");
    }
}
