//! Serving recorded exchanges as if a live program produced them.
//!
//! `send` resolves the composite match key against the store and hands the
//! recorded chunks to a background pacer task, which feeds an internal byte
//! buffer honoring per-chunk delays under the latency policy. `expect`
//! suspends on a notification until a pattern matches the accumulated buffer.
//! Replay output is byte-identical to what the recorder persisted; only
//! timing is policy-dependent.
//!
//! An expect timeout leaves already-paced bytes in the buffer; a later expect
//! may still consume them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::decorate::DecoratorSet;
use crate::error::{Error, Result};
use crate::inject::{FaultInjector, FaultPlan};
use crate::latency::LatencyPolicy;
use crate::matching::{KeyBuilder, MatchingContext};
use crate::store::TapeStore;
use crate::tape::{ExitInfo, InputKind, Tape};

/// How many nearest recorded inputs a tape miss reports.
const NEAREST_LIMIT: usize = 5;

/// Maximum lines of buffer tail carried in timeout diagnostics.
const TAIL_LINES: usize = 50;

/// Result of a successful expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the first pattern that matched.
    pub index: usize,
    /// The matched portion of the buffer.
    pub matched_text: String,
    /// Buffer content consumed ahead of the match.
    pub tail: String,
}

#[derive(Debug, Default)]
struct BufState {
    buf: Vec<u8>,
    pacer_done: bool,
    /// Set when the pacer truncated the stream as an injected timeout.
    sim_timeout: Option<(usize, usize)>,
    exit: Option<ExitInfo>,
    exit_injected: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BufState>,
    notify: Notify,
}

/// Transport that serves sends and expects from tapes instead of a process.
pub struct ReplayTransport {
    store: Arc<TapeStore>,
    keys: KeyBuilder,
    decorators: DecoratorSet,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: String,
    /// Suffix matched by the most recent expect; the next exchange's prompt.
    prompt: String,
    state_hash: Option<String>,
    shared: Arc<Shared>,
    pacer: Option<JoinHandle<()>>,
    latency: LatencyPolicy,
    latency_rng: StdRng,
    injector: FaultInjector,
    /// Tape defaults are bound on the first hit.
    policies_bound: bool,
    config_seed: u64,
    config_error_rate: u8,
    expect_timeout: Duration,
    exchange_count: usize,
    closed: bool,
}

impl ReplayTransport {
    /// Build a replay transport over an already-loaded store.
    #[must_use]
    pub fn new(
        store: Arc<TapeStore>,
        config: &SessionConfig,
        program: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: String,
    ) -> Self {
        let keys = store.keys().clone();
        Self {
            store,
            keys,
            decorators: config.decorators.clone(),
            program,
            args,
            env,
            cwd,
            prompt: String::new(),
            state_hash: None,
            shared: Arc::new(Shared::default()),
            pacer: None,
            latency: config.latency.clone(),
            latency_rng: StdRng::seed_from_u64(config.seed ^ 0x9e37_79b9_7f4a_7c15),
            injector: FaultInjector::new(config.seed, config.error_rate),
            policies_bound: false,
            config_seed: config.seed,
            config_error_rate: config.error_rate,
            expect_timeout: Duration::from_millis(config.expect_timeout_ms),
            exchange_count: 0,
            closed: false,
        }
    }

    /// Caller-supplied state hash folded into subsequent match keys.
    pub fn set_state_hash(&mut self, state_hash: Option<String>) {
        self.state_hash = state_hash;
    }

    /// Suffix matched by the most recent expect; carried into a live child
    /// on proxy fallback so recorded prompts stay continuous.
    #[must_use]
    pub fn last_prompt(&self) -> &str {
        &self.prompt
    }

    /// Exchanges served so far.
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.exchange_count
    }

    /// Whether the replayed process still appears alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.closed {
            return false;
        }
        self.shared
            .state
            .lock()
            .expect("replay buffer lock poisoned")
            .exit
            .is_none()
    }

    /// Exit info once the replayed process has ended.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.shared
            .state
            .lock()
            .expect("replay buffer lock poisoned")
            .exit
            .clone()
    }

    fn context(&self) -> MatchingContext {
        MatchingContext {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            prompt: self.prompt.clone(),
            state_hash: self.state_hash.clone(),
        }
    }

    /// Accept input and stage the matching recorded output. Returns the
    /// number of input bytes accepted, or [`Error::TapeMiss`] when nothing
    /// matches.
    pub async fn send(&mut self, data: &[u8], kind: InputKind) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if let Some(exit) = self.exit_info() {
            return Err(Error::Process {
                code: Some(exit.code),
                signal: exit.signal,
            });
        }

        let ctx = self.context();
        let decorated = self.decorators.decorate_input(&ctx, data);
        let key = self.keys.exchange_key(&ctx, &decorated, kind);

        let Some(handle) = self.store.lookup(&key) else {
            let input = self.keys.canonical_input(&decorated, kind, &ctx);
            let nearest = self.store.nearest_inputs(&input, NEAREST_LIMIT);
            return Err(Error::TapeMiss {
                key: key.to_string(),
                input,
                nearest,
            });
        };

        self.bind_tape_policies(&handle.tape);
        let exchange = handle.exchange();
        let plan = self.injector.draw(exchange.output.chunks.len());
        tracing::debug!(
            tape = %handle.path.display(),
            exchange = handle.exchange_index,
            chunks = exchange.output.chunks.len(),
            ?plan,
            "serving recorded exchange"
        );

        // Decode payloads and fix delays up front so the pacer task owns
        // plain data and the draw order stays deterministic.
        let mut staged: Vec<(u64, Vec<u8>)> = Vec::new();
        let limit = match plan {
            FaultPlan::TimeoutAfter { prefix_chunks, .. } => {
                prefix_chunks.min(exchange.output.chunks.len())
            }
            _ => exchange.output.chunks.len(),
        };
        for (i, chunk) in exchange.output.chunks.iter().take(limit).enumerate() {
            let delay = self
                .latency
                .delay_ms(i, chunk.delay_ms, &mut self.latency_rng);
            staged.push((delay, chunk.data()?));
        }

        let ending = match plan {
            FaultPlan::None => exchange.exit.clone().map(|e| (e, false)),
            FaultPlan::ExitWith { code } => Some((
                ExitInfo {
                    code,
                    signal: None,
                },
                true,
            )),
            FaultPlan::TimeoutAfter { .. } => None,
        };
        let sim_timeout = match plan {
            FaultPlan::TimeoutAfter {
                prefix_chunks,
                total,
            } => Some((prefix_chunks, total)),
            _ => None,
        };

        if let Some(old) = self.pacer.take() {
            old.abort();
        }
        {
            let mut state = self.shared.state.lock().expect("replay buffer lock poisoned");
            state.pacer_done = false;
            state.sim_timeout = None;
        }

        let shared = Arc::clone(&self.shared);
        self.pacer = Some(tokio::spawn(async move {
            for (delay_ms, bytes) in staged {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                {
                    let mut state = shared.state.lock().expect("replay buffer lock poisoned");
                    state.buf.extend_from_slice(&bytes);
                }
                shared.notify.notify_waiters();
            }
            {
                let mut state = shared.state.lock().expect("replay buffer lock poisoned");
                state.pacer_done = true;
                state.sim_timeout = sim_timeout;
                if let Some((exit, injected)) = ending {
                    state.exit = Some(exit);
                    state.exit_injected = injected;
                }
            }
            shared.notify.notify_waiters();
        }));

        self.exchange_count += 1;
        Ok(data.len())
    }

    fn bind_tape_policies(&mut self, tape: &Tape) {
        if self.policies_bound {
            return;
        }
        self.policies_bound = true;
        if matches!(self.latency, LatencyPolicy::Recorded) {
            if let Some(spec) = tape.meta.latency {
                self.latency = LatencyPolicy::from_spec(Some(spec));
            }
        }
        let seed = if tape.meta.seed != 0 {
            tape.meta.seed
        } else {
            self.config_seed
        };
        let rate = if self.config_error_rate != 0 {
            self.config_error_rate
        } else {
            tape.meta.error_rate
        };
        self.injector = FaultInjector::new(seed, rate);
        self.latency_rng = StdRng::seed_from_u64(seed ^ 0x9e37_79b9_7f4a_7c15);
    }

    /// Wait until any pattern matches the accumulated buffer.
    ///
    /// Matched bytes and everything before them are consumed; the matched
    /// suffix becomes the prompt snapshot for the next exchange.
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
            let notified = self.shared.notify.notified();

            {
                let mut state = self.shared.state.lock().expect("replay buffer lock poisoned");
                if let Some(found) = scan_buffer(&mut state.buf, &regexes) {
                    self.prompt.clone_from(&found.matched_text);
                    return Ok(found);
                }
                if state.pacer_done {
                    if let Some((streamed, total)) = state.sim_timeout {
                        return Err(Error::SimulatedTimeout { streamed, total });
                    }
                    if let Some(exit) = state.exit.clone() {
                        if state.exit_injected {
                            return Err(Error::SimulatedExit { code: exit.code });
                        }
                        return Err(Error::Process {
                            code: Some(exit.code),
                            signal: exit.signal,
                        });
                    }
                }
            }

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    let state = self.shared.state.lock().expect("replay buffer lock poisoned");
                    return Err(Error::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                        tail: tail_text(&state.buf, TAIL_LINES),
                    });
                }
            }
        }
    }

    /// Stop the pacer and release buffers.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(pacer) = self.pacer.take() {
            pacer.abort();
        }
        let mut state = self.shared.state.lock().expect("replay buffer lock poisoned");
        state.buf = Vec::new();
    }
}

impl Drop for ReplayTransport {
    fn drop(&mut self) {
        if let Some(pacer) = self.pacer.take() {
            pacer.abort();
        }
    }
}

impl std::fmt::Debug for ReplayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayTransport")
            .field("program", &self.program)
            .field("exchanges", &self.exchange_count)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Compile expect patterns as byte-oriented regexes so raw output never needs
/// to be valid UTF-8.
pub(crate) fn compile_patterns(patterns: &[&str]) -> Result<Vec<regex::bytes::Regex>> {
    if patterns.is_empty() {
        return Err(Error::Config("expect requires at least one pattern".into()));
    }
    patterns
        .iter()
        .map(|p| {
            regex::bytes::Regex::new(p)
                .map_err(|e| Error::Config(format!("invalid expect pattern {p:?}: {e}")))
        })
        .collect()
}

/// Find the first pattern (in argument order) matching the buffer; on a hit,
/// consume through the end of the match.
pub(crate) fn scan_buffer(
    buf: &mut Vec<u8>,
    regexes: &[regex::bytes::Regex],
) -> Option<ExpectMatch> {
    for (index, regex) in regexes.iter().enumerate() {
        if let Some(m) = regex.find(buf) {
            let matched_text = String::from_utf8_lossy(&buf[m.start()..m.end()]).into_owned();
            let tail = String::from_utf8_lossy(&buf[..m.start()]).into_owned();
            buf.drain(..m.end());
            return Some(ExpectMatch {
                index,
                matched_text,
                tail,
            });
        }
    }
    None
}

/// Last `max_lines` lines of the buffer, lossily decoded, for diagnostics.
pub(crate) fn tail_text(buf: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(buf);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
