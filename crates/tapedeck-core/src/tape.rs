//! Tape data model and on-disk codec.
//!
//! Tapes are stored as JSON5 so humans can annotate them with comments and
//! trailing commas. Decoding accepts the full JSON5 grammar; encoding always
//! writes pretty, two-space-indented canonical JSON (a strict JSON5 subset)
//! with fields in a fixed order, so writes stay deterministic and diffable.
//!
//! Unknown top-level fields survive a decode/encode round trip.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The single schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

/// File extension for tapes.
pub const TAPE_EXTENSION: &str = "json5";

/// A persisted recording of one interactive session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tape {
    pub schema_version: u32,
    pub meta: TapeMeta,
    pub session: SessionInfo,
    pub exchanges: Vec<Exchange>,
    /// Unknown top-level fields, preserved verbatim on re-write.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Metadata describing how the session was spawned and how replay should
/// behave by default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TapeMeta {
    /// ISO 8601 UTC creation time.
    pub created_at: String,
    pub program: String,
    pub args: Vec<String>,
    /// Selected environment snapshot; `BTreeMap` keeps keys sorted on disk.
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub pty: PtyDims,
    pub tag: Option<String>,
    pub latency: Option<LatencySpec>,
    pub error_rate: u8,
    pub seed: u64,
}

/// PTY dimensions at record time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PtyDims {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyDims {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Recorded default for replay pacing: a scalar delay or a uniform range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum LatencySpec {
    Fixed(u64),
    Range(u64, u64),
}

/// Identity of the recorder that produced the tape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub recorder: String,
    pub platform: String,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            recorder: format!("tapedeck/{}", crate::VERSION),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// One input/output round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub pre: PreState,
    pub input: InputRecord,
    pub output: OutputRecord,
    pub exit: Option<ExitInfo>,
    pub dur_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

/// State observed just before the input was sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreState {
    /// Most recent prompt snapshot (the suffix matched by the last expect).
    pub prompt: String,
    pub state_hash: Option<String>,
}

/// Input kind: a text line (newline-terminated) or raw bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Line,
    Raw,
}

/// Input sent to the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputRecord {
    pub kind: InputKind,
    /// UTF-8 text when the input decodes cleanly.
    pub text: Option<String>,
    /// Base64 fallback for non-UTF-8 input.
    pub bytes_b64: Option<String>,
}

impl InputRecord {
    /// Build a record, preferring the text form when the bytes are UTF-8.
    #[must_use]
    pub fn from_bytes(kind: InputKind, data: &[u8]) -> Self {
        match std::str::from_utf8(data) {
            Ok(text) => Self {
                kind,
                text: Some(text.to_string()),
                bytes_b64: None,
            },
            Err(_) => Self {
                kind,
                text: None,
                bytes_b64: Some(BASE64.encode(data)),
            },
        }
    }

    /// Recover the original input bytes.
    pub fn data(&self) -> Result<Vec<u8>> {
        if let Some(text) = &self.text {
            return Ok(text.as_bytes().to_vec());
        }
        match &self.bytes_b64 {
            Some(b64) => decode_b64(b64),
            None => Ok(Vec::new()),
        }
    }
}

/// Ordered chunk sequence produced between a send and its expect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputRecord {
    pub chunks: Vec<Chunk>,
}

impl OutputRecord {
    /// Concatenation of all chunk payloads, exactly as observed live.
    pub fn data(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data()?);
        }
        Ok(out)
    }
}

/// A contiguous burst of PTY output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Delay from the previous chunk in milliseconds; the first chunk of an
    /// exchange is measured from send completion.
    pub delay_ms: u64,
    pub data_b64: String,
    /// Whether the payload decodes as UTF-8 (editor and normalizer hint).
    pub is_utf8: bool,
}

impl Chunk {
    #[must_use]
    pub fn from_bytes(delay_ms: u64, data: &[u8]) -> Self {
        Self {
            delay_ms,
            data_b64: BASE64.encode(data),
            is_utf8: std::str::from_utf8(data).is_ok(),
        }
    }

    /// Decode the payload bytes.
    pub fn data(&self) -> Result<Vec<u8>> {
        decode_b64(&self.data_b64)
    }
}

/// How the process ended, when it ended during the exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
    pub signal: Option<String>,
}

fn decode_b64(b64: &str) -> Result<Vec<u8>> {
    BASE64.decode(b64).map_err(|e| Error::Schema {
        path: PathBuf::from("<tape>"),
        line: None,
        column: None,
        message: format!("invalid base64 payload: {e}"),
    })
}

/// Optional stricter schema checker plugged into the store. When absent,
/// validation is structural only.
pub trait SchemaChecker: Send + Sync {
    fn check(&self, raw: &serde_json::Value, path: &Path) -> Result<()>;
}

impl Tape {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let fail = |message: String| Error::Schema {
            path: path.to_path_buf(),
            line: None,
            column: None,
            message,
        };
        if self.exchanges.is_empty() {
            return Err(fail("tape has no exchanges".into()));
        }
        if self.meta.error_rate > 100 {
            return Err(fail(format!(
                "errorRate {} out of range 0-100",
                self.meta.error_rate
            )));
        }
        if let Some(LatencySpec::Range(lo, hi)) = self.meta.latency {
            if lo > hi {
                return Err(fail(format!("latency range [{lo}, {hi}] is inverted")));
            }
        }
        for (i, exchange) in self.exchanges.iter().enumerate() {
            for (j, chunk) in exchange.output.chunks.iter().enumerate() {
                chunk.data().map_err(|_| {
                    fail(format!("exchanges[{i}].output.chunks[{j}]: invalid base64"))
                })?;
            }
            exchange
                .input
                .data()
                .map_err(|_| fail(format!("exchanges[{i}].input: invalid base64")))?;
        }
        Ok(())
    }
}

/// Decode a tape from JSON5 text.
///
/// The error carries the line/column of the first offending construct when
/// the parser reports one.
pub fn decode_tape(text: &str, path: &Path) -> Result<Tape> {
    let value: serde_json::Value = json5::from_str(text).map_err(|e| {
        let (line, column) = json5_location(&e);
        Error::Schema {
            path: path.to_path_buf(),
            line,
            column,
            message: e.to_string(),
        }
    })?;

    match value.get("schemaVersion").and_then(serde_json::Value::as_u64) {
        Some(v) if v == u64::from(SCHEMA_VERSION) => {}
        Some(v) => {
            return Err(Error::Schema {
                path: path.to_path_buf(),
                line: None,
                column: None,
                message: format!("unsupported schemaVersion {v} (this build reads {SCHEMA_VERSION})"),
            });
        }
        None => {
            return Err(Error::Schema {
                path: path.to_path_buf(),
                line: None,
                column: None,
                message: "missing integer schemaVersion".into(),
            });
        }
    }

    let tape: Tape = serde_json::from_value(value).map_err(|e| Error::Schema {
        path: path.to_path_buf(),
        line: None,
        column: None,
        message: e.to_string(),
    })?;
    tape.validate(path)?;
    Ok(tape)
}

fn json5_location(err: &json5::Error) -> (Option<usize>, Option<usize>) {
    match err {
        json5::Error::Message { location, .. } => location
            .as_ref()
            .map_or((None, None), |loc| (Some(loc.line), Some(loc.column))),
    }
}

/// Encode a tape as pretty, stable-order text ready for persistence.
pub fn encode_tape(tape: &Tape) -> Result<String> {
    let mut text = serde_json::to_string_pretty(tape)?;
    text.push('\n');
    Ok(text)
}
