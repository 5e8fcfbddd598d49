//! Composite match keys over noisy session state.
//!
//! A lookup must find the same recorded exchange on any machine, at any time,
//! regardless of ANSI styling, environment drift, or timestamps in prompts.
//! The pipeline canonicalizes each fingerprint field, serializes them as a
//! canonical JSON array, and hashes the result with SHA-256.
//!
//! Custom [`CommandMatcher`]/[`StdinMatcher`] implementations override the
//! program and input fields respectively. They must be deterministic and
//! side-effect free; the key is recomputed freely and never cached across
//! processes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::normalize::Normalizer;
use crate::tape::{Exchange, InputKind, Tape};

/// Environment names ignored by default: shell-session noise that differs
/// between otherwise identical runs.
pub const DEFAULT_IGNORED_ENV: &[&str] = &[
    "PWD",
    "OLDPWD",
    "SHLVL",
    "RANDOM",
    "_",
    "COLUMNS",
    "LINES",
    "PS1",
    "PS2",
    "PS3",
    "PS4",
    "HISTSIZE",
    "HISTFILESIZE",
    "HISTFILE",
    "SSH_CLIENT",
    "SSH_CONNECTION",
    "SSH_TTY",
    "DISPLAY",
    "WINDOWID",
    "TERM_SESSION_ID",
    "TERM_PROGRAM",
];

/// Placeholder for argv values elided by value/prefix filters.
pub const IGNORED_ARG: &str = "<IGN>";

/// Hex SHA-256 digest identifying a matching context or session identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchKey(String);

impl MatchKey {
    /// Full 64-char hex digest.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// First eight hex chars, used in generated tape names.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl std::fmt::Display for MatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable per-lookup state.
#[derive(Debug, Clone)]
pub struct MatchingContext {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    /// Most recent prompt snapshot (raw; normalized during key building).
    pub prompt: String,
    pub state_hash: Option<String>,
}

/// Argv filter: elide a position entirely, or mask values by exact match or
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgFilter {
    Index(usize),
    Value(String),
}

/// Overrides the program/argv fingerprint field.
pub trait CommandMatcher: Send + Sync {
    /// Canonical form of the command for key building.
    fn canonical(&self, program: &str, args: &[String], ctx: &MatchingContext) -> String;
}

impl<F> CommandMatcher for F
where
    F: Fn(&str, &[String], &MatchingContext) -> String + Send + Sync,
{
    fn canonical(&self, program: &str, args: &[String], ctx: &MatchingContext) -> String {
        self(program, args, ctx)
    }
}

/// Overrides the input fingerprint field.
pub trait StdinMatcher: Send + Sync {
    /// Canonical form of the input for key building.
    fn canonical(&self, input: &[u8], kind: InputKind, ctx: &MatchingContext) -> String;
}

impl<F> StdinMatcher for F
where
    F: Fn(&[u8], InputKind, &MatchingContext) -> String + Send + Sync,
{
    fn canonical(&self, input: &[u8], kind: InputKind, ctx: &MatchingContext) -> String {
        self(input, kind, ctx)
    }
}

/// Builds composite match keys from session state and recorded tapes.
///
/// Cloning is cheap; custom matchers are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct KeyBuilder {
    pub normalizer: Normalizer,
    pub allow_env: Vec<String>,
    pub ignore_env: Vec<String>,
    pub ignore_args: Vec<ArgFilter>,
    pub ignore_stdin: bool,
    pub command_matcher: Option<Arc<dyn CommandMatcher>>,
    pub stdin_matcher: Option<Arc<dyn StdinMatcher>>,
}

impl std::fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBuilder")
            .field("allow_env", &self.allow_env)
            .field("ignore_env", &self.ignore_env)
            .field("ignore_args", &self.ignore_args)
            .field("ignore_stdin", &self.ignore_stdin)
            .field("command_matcher", &self.command_matcher.is_some())
            .field("stdin_matcher", &self.stdin_matcher.is_some())
            .finish()
    }
}

impl KeyBuilder {
    /// Canonical input text for a send: decoded, decorated elsewhere, with a
    /// single trailing newline stripped for line-kind input.
    #[must_use]
    pub fn canonical_input(&self, input: &[u8], kind: InputKind, ctx: &MatchingContext) -> String {
        if self.ignore_stdin {
            return String::new();
        }
        if let Some(matcher) = &self.stdin_matcher {
            return matcher.canonical(input, kind, ctx);
        }
        let mut text = String::from_utf8_lossy(input).into_owned();
        if kind == InputKind::Line {
            if text.ends_with("\r\n") {
                text.truncate(text.len() - 2);
            } else if text.ends_with('\n') {
                text.truncate(text.len() - 1);
            }
        }
        self.normalizer.normalize(&text)
    }

    /// Exchange-level key for a live lookup.
    #[must_use]
    pub fn exchange_key(&self, ctx: &MatchingContext, input: &[u8], kind: InputKind) -> MatchKey {
        let input_text = self.canonical_input(input, kind, ctx);
        self.hash_fields(ctx, Some(&input_text))
    }

    /// Exchange-level key for a recorded exchange, built from tape metadata
    /// so that record-side and lookup-side keys collide exactly.
    #[must_use]
    pub fn recorded_exchange_key(&self, tape: &Tape, exchange: &Exchange) -> MatchKey {
        let ctx = self.context_for_tape(tape, exchange);
        let input = exchange.input.data().unwrap_or_default();
        let input_text = self.canonical_input(&input, exchange.input.kind, &ctx);
        self.hash_fields(&ctx, Some(&input_text))
    }

    /// Session-identity key: program, filtered argv, filtered env, cwd.
    #[must_use]
    pub fn identity_key(
        &self,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: &str,
    ) -> MatchKey {
        let ctx = MatchingContext {
            program: program.to_string(),
            args: args.to_vec(),
            env: env.clone(),
            cwd: cwd.to_string(),
            prompt: String::new(),
            state_hash: None,
        };
        self.hash_fields(&ctx, None)
    }

    /// Identity key for a loaded tape.
    #[must_use]
    pub fn tape_identity_key(&self, tape: &Tape) -> MatchKey {
        self.identity_key(
            &tape.meta.program,
            &tape.meta.args,
            &tape.meta.env,
            &tape.meta.cwd,
        )
    }

    fn context_for_tape(&self, tape: &Tape, exchange: &Exchange) -> MatchingContext {
        MatchingContext {
            program: tape.meta.program.clone(),
            args: tape.meta.args.clone(),
            env: tape.meta.env.clone(),
            cwd: tape.meta.cwd.clone(),
            prompt: exchange.pre.prompt.clone(),
            state_hash: exchange.pre.state_hash.clone(),
        }
    }

    fn hash_fields(&self, ctx: &MatchingContext, input: Option<&str>) -> MatchKey {
        let command = match &self.command_matcher {
            Some(matcher) => matcher.canonical(&ctx.program, &ctx.args, ctx),
            None => basename(&ctx.program),
        };
        let args = self.filtered_args(&ctx.args);
        let env = self.filtered_env(&ctx.env);
        let cwd = realpath(&ctx.cwd);
        let prompt = self.normalizer.normalize(&ctx.prompt);

        let mut fields = vec![
            serde_json::Value::String(command),
            serde_json::Value::Array(args.into_iter().map(serde_json::Value::String).collect()),
            serde_json::Value::Array(
                env.into_iter()
                    .map(|(k, v)| {
                        serde_json::Value::Array(vec![
                            serde_json::Value::String(k),
                            serde_json::Value::String(v),
                        ])
                    })
                    .collect(),
            ),
            serde_json::Value::String(cwd),
        ];
        if let Some(input) = input {
            fields.push(serde_json::Value::String(prompt));
            fields.push(serde_json::Value::String(input.to_string()));
            fields.push(match &ctx.state_hash {
                Some(h) => serde_json::Value::String(h.clone()),
                None => serde_json::Value::Null,
            });
        }

        let canonical = serde_json::Value::Array(fields).to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        MatchKey(hex_encode(&hasher.finalize()))
    }

    fn filtered_args(&self, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len());
        'next: for (idx, arg) in args.iter().enumerate() {
            for filter in &self.ignore_args {
                match filter {
                    ArgFilter::Index(i) if *i == idx => continue 'next,
                    ArgFilter::Value(v) if arg == v || arg.starts_with(v.as_str()) => {
                        out.push(IGNORED_ARG.to_string());
                        continue 'next;
                    }
                    _ => {}
                }
            }
            out.push(arg.clone());
        }
        out
    }

    /// Secret-named variables contribute their name but a masked value, so
    /// the recorded snapshot (already masked) and the live environment build
    /// the same key and no credential flows into the hash input.
    fn filtered_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mask = |k: &String, v: &String| {
            if crate::redact::is_secret_key_name(k) {
                (k.clone(), "<REDACTED:ENV>".to_string())
            } else {
                (k.clone(), v.clone())
            }
        };
        if !self.allow_env.is_empty() {
            return env
                .iter()
                .filter(|(k, _)| self.allow_env.iter().any(|a| a == *k))
                .map(|(k, v)| mask(k, v))
                .collect();
        }
        env.iter()
            .filter(|(k, _)| {
                !DEFAULT_IGNORED_ENV.contains(&k.as_str())
                    && !self.ignore_env.iter().any(|i| i == *k)
            })
            .map(|(k, v)| mask(k, v))
            .collect()
    }
}

fn basename(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map_or_else(|| program.to_string(), |n| n.to_string_lossy().into_owned())
}

/// Realpath resolution is best effort: a cwd that no longer exists hashes as
/// given, identically on both sides of the lookup.
fn realpath(cwd: &str) -> String {
    std::fs::canonicalize(cwd)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| cwd.to_string())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Edit distance used to rank nearest recorded inputs in miss diagnostics.
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(prompt: &str) -> MatchingContext {
        MatchingContext {
            program: "/usr/bin/echo-prompt".into(),
            args: vec!["--color".into(), "auto".into()],
            env: BTreeMap::from([
                ("TERM".to_string(), "xterm".to_string()),
                ("PWD".to_string(), "/somewhere".to_string()),
            ]),
            cwd: "/definitely/not/a/real/dir".into(),
            prompt: prompt.into(),
            state_hash: None,
        }
    }

    #[test]
    fn key_is_stable_across_calls() {
        let kb = KeyBuilder::default();
        let c = ctx("> ");
        let k1 = kb.exchange_key(&c, b"hello\n", InputKind::Line);
        let k2 = kb.exchange_key(&c, b"hello\n", InputKind::Line);
        assert_eq!(k1, k2);
        assert_eq!(k1.as_hex().len(), 64);
    }

    #[test]
    fn key_ignores_ansi_and_volatile_prompt_noise() {
        let kb = KeyBuilder::default();
        let plain = kb.exchange_key(&ctx("> "), b"hi\n", InputKind::Line);
        let noisy = kb.exchange_key(&ctx("\x1b[1m> \x1b[0m"), b"hi\n", InputKind::Line);
        assert_eq!(plain, noisy);
    }

    #[test]
    fn key_differs_on_input() {
        let kb = KeyBuilder::default();
        let c = ctx("> ");
        assert_ne!(
            kb.exchange_key(&c, b"hello\n", InputKind::Line),
            kb.exchange_key(&c, b"world\n", InputKind::Line)
        );
    }

    #[test]
    fn line_kind_strips_one_trailing_newline() {
        let kb = KeyBuilder::default();
        let c = ctx("> ");
        assert_eq!(
            kb.exchange_key(&c, b"hello\n", InputKind::Line),
            kb.exchange_key(&c, b"hello", InputKind::Line)
        );
        assert_eq!(
            kb.exchange_key(&c, b"hello\r\n", InputKind::Line),
            kb.exchange_key(&c, b"hello", InputKind::Line)
        );
        // Raw kind keeps the newline significant.
        assert_ne!(
            kb.exchange_key(&c, b"hello\n", InputKind::Raw),
            kb.exchange_key(&c, b"hello", InputKind::Raw)
        );
    }

    #[test]
    fn program_matches_by_basename() {
        let kb = KeyBuilder::default();
        let mut a = ctx("");
        a.program = "/usr/bin/git".into();
        let mut b = ctx("");
        b.program = "/usr/local/bin/git".into();
        assert_eq!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&b, b"x", InputKind::Raw)
        );
    }

    #[test]
    fn default_ignored_env_is_invisible() {
        let kb = KeyBuilder::default();
        let mut a = ctx("");
        let mut b = ctx("");
        a.env.insert("PWD".into(), "/a".into());
        b.env.insert("PWD".into(), "/b".into());
        assert_eq!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&b, b"x", InputKind::Raw)
        );
    }

    #[test]
    fn allow_env_restricts_the_field() {
        let kb = KeyBuilder {
            allow_env: vec!["LANG".into()],
            ..KeyBuilder::default()
        };
        let mut a = ctx("");
        let mut b = ctx("");
        // TERM differs but is not allowed, so it does not participate.
        a.env.insert("TERM".into(), "xterm".into());
        b.env.insert("TERM".into(), "vt100".into());
        assert_eq!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&b, b"x", InputKind::Raw)
        );
        // LANG differs and is allowed.
        a.env.insert("LANG".into(), "C".into());
        b.env.insert("LANG".into(), "en_US".into());
        assert_ne!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&b, b"x", InputKind::Raw)
        );
    }

    #[test]
    fn ignore_args_by_index_and_value() {
        let kb = KeyBuilder {
            ignore_args: vec![ArgFilter::Index(1), ArgFilter::Value("--seed".into())],
            ..KeyBuilder::default()
        };
        let mut a = ctx("");
        a.args = vec!["--color".into(), "auto".into(), "--seed=1".into()];
        let mut b = ctx("");
        b.args = vec!["--color".into(), "never".into(), "--seed=9".into()];
        assert_eq!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&b, b"x", InputKind::Raw)
        );
    }

    #[test]
    fn ignore_stdin_blanks_input() {
        let kb = KeyBuilder {
            ignore_stdin: true,
            ..KeyBuilder::default()
        };
        let c = ctx("> ");
        assert_eq!(
            kb.exchange_key(&c, b"one\n", InputKind::Line),
            kb.exchange_key(&c, b"two\n", InputKind::Line)
        );
    }

    #[test]
    fn custom_matchers_override_fields() {
        let kb = KeyBuilder {
            command_matcher: Some(Arc::new(
                |_: &str, _: &[String], _: &MatchingContext| "fixed".to_string(),
            )),
            stdin_matcher: Some(Arc::new(
                |_: &[u8], _: InputKind, _: &MatchingContext| "same".to_string(),
            )),
            ..KeyBuilder::default()
        };
        let mut a = ctx("");
        a.program = "one".into();
        let mut b = ctx("");
        b.program = "two".into();
        assert_eq!(
            kb.exchange_key(&a, b"aaa", InputKind::Raw),
            kb.exchange_key(&b, b"bbb", InputKind::Raw)
        );
    }

    #[test]
    fn secret_env_values_never_affect_keys() {
        let kb = KeyBuilder::default();
        let mut a = ctx("");
        let mut b = ctx("");
        a.env.insert("GITHUB_TOKEN".into(), "ghp_live_value".into());
        b.env.insert("GITHUB_TOKEN".into(), "<REDACTED:ENV>".into());
        // A live environment and a masked tape snapshot build the same key.
        assert_eq!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&b, b"x", InputKind::Raw)
        );
        // But the variable's presence still matters.
        let c = ctx("");
        assert_ne!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&c, b"x", InputKind::Raw)
        );
    }

    #[test]
    fn state_hash_participates() {
        let kb = KeyBuilder::default();
        let mut a = ctx("> ");
        let b = ctx("> ");
        a.state_hash = Some("abc".into());
        assert_ne!(
            kb.exchange_key(&a, b"x", InputKind::Raw),
            kb.exchange_key(&b, b"x", InputKind::Raw)
        );
    }

    #[test]
    fn identity_key_excludes_prompt_and_input() {
        let kb = KeyBuilder::default();
        let c = ctx("> ");
        let id = kb.identity_key(&c.program, &c.args, &c.env, &c.cwd);
        let id2 = kb.identity_key(&c.program, &c.args, &c.env, &c.cwd);
        assert_eq!(id, id2);
        assert_ne!(
            id,
            kb.identity_key("other", &c.args, &c.env, &c.cwd)
        );
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("hello", "world"), 4);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
    }
}
