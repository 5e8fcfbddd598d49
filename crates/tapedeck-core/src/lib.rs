//! tapedeck-core: record and replay interactive CLI sessions over a PTY.
//!
//! A control layer spawns a child process, sends input, and waits for output
//! patterns. This crate lets that layer transparently swap the live child for
//! a replay transport that reproduces a previously recorded session
//! byte-for-byte, with optional timing and fault injection, without launching
//! the real program.
//!
//! # Architecture
//!
//! ```text
//! Session (facade) ──▶ LiveTransport ──▶ PTY ──▶ reader task
//!        │                   │                        │
//!        │                   └── ChunkSink ◀── bounded channel
//!        │                         │
//!        │                     Recorder ──▶ Redactor ──▶ TapeStore (json5)
//!        │                                                   ▲
//!        └──────────▶ ReplayTransport ── pacer task ◀── index│lookup
//! ```
//!
//! # Modules
//!
//! - `normalize`: canonicalize noisy terminal text for matching
//! - `redact`: mask secrets before anything reaches disk
//! - `matching`: composite SHA-256 match keys over session state
//! - `tape`: tape/exchange/chunk model and the JSON5 codec
//! - `store`: recursive tape loading, indices, atomic locked writes
//! - `lock`: cross-process advisory file locks
//! - `sink`: PTY output capture as timestamped chunks
//! - `record`: the exchange-boundary recording state machine
//! - `replay`: serving recorded exchanges with pacing and fault injection
//! - `latency`: chunk pacing policies
//! - `inject`: deterministic fault injection
//! - `transport`: the live/replay facade
//! - `namegen`: deterministic tape naming
//! - `summary`: exit-time tape accounting
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod decorate;
pub mod error;
pub mod inject;
pub mod latency;
pub mod lock;
pub mod matching;
pub mod namegen;
pub mod normalize;
pub mod record;
pub mod redact;
pub mod replay;
pub mod sink;
pub mod store;
pub mod summary;
pub mod tape;
pub mod transport;

pub use config::{FallbackMode, RecordMode, SessionConfig};
pub use error::{Error, Result};
pub use latency::LatencyPolicy;
pub use replay::ExpectMatch;
pub use store::TapeStore;
pub use tape::{Exchange, Tape};
pub use transport::{Session, SessionMode};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
