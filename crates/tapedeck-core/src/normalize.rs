//! Text canonicalization for matching.
//!
//! Terminal output is noisy: ANSI styling, ragged whitespace, timestamps,
//! UUIDs, PIDs. Match keys must survive all of it, so every piece of text
//! that participates in a key goes through here first.
//!
//! All functions are pure and idempotent: `normalize(normalize(x)) ==
//! normalize(x)`.

use std::sync::OnceLock;

use regex::Regex;

/// Placeholder substituted for timestamps.
pub const TS_PLACEHOLDER: &str = "<TS>";
/// Placeholder substituted for UUIDs.
pub const UUID_PLACEHOLDER: &str = "<UUID>";
/// Placeholder substituted for process ids.
pub const PID_PLACEHOLDER: &str = "<PID>";
/// Placeholder substituted for long hex content addresses.
pub const HEX_PLACEHOLDER: &str = "<HEX>";

fn scrub_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // ISO 8601, with optional fraction and zone.
            (
                Regex::new(
                    r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?\b",
                )
                .unwrap(),
                TS_PLACEHOLDER,
            ),
            // Bare wall-clock times, common in log prefixes.
            (
                Regex::new(r"\b\d{2}:\d{2}:\d{2}(?:\.\d+)?\b").unwrap(),
                TS_PLACEHOLDER,
            ),
            (
                Regex::new(
                    r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
                )
                .unwrap(),
                UUID_PLACEHOLDER,
            ),
            // Keep the `pid` context, scrub the number.
            (
                Regex::new(r"(?i)\b(pid[=:\s]+)\d+\b").unwrap(),
                "${1}<PID>",
            ),
            // Long hex runs: content addresses, digests.
            (
                Regex::new(r"\b[0-9a-f]{16,}\b").unwrap(),
                HEX_PLACEHOLDER,
            ),
        ]
    })
}

fn user_path_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (Regex::new(r"/home/[^/\s]+").unwrap(), "/home/<USER>"),
            (Regex::new(r"/Users/[^/\s]+").unwrap(), "/Users/<USER>"),
            (
                Regex::new(r"C:\\Users\\[^\\\s]+").unwrap(),
                r"C:\Users\<USER>",
            ),
        ]
    })
}

/// Remove ANSI escape sequences while preserving printable text and newlines.
///
/// An incomplete escape at the end of the input is kept verbatim so that the
/// caller can re-normalize once the rest of the sequence arrives.
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != 0x1b {
            // Multi-byte UTF-8 never contains 0x1b, so byte scanning is safe;
            // copy the full character.
            let ch_len = utf8_len(bytes[i]);
            let end = (i + ch_len).min(bytes.len());
            out.push_str(&s[i..end]);
            i = end;
            continue;
        }
        match classify_escape(&bytes[i..]) {
            EscapeScan::Complete(len) => i += len,
            EscapeScan::Incomplete => {
                // Truncated sequence at buffer end: keep verbatim.
                out.push_str(&s[i..]);
                break;
            }
        }
    }
    out
}

enum EscapeScan {
    Complete(usize),
    Incomplete,
}

/// Measure one escape sequence starting at `bytes[0] == ESC`.
fn classify_escape(bytes: &[u8]) -> EscapeScan {
    debug_assert_eq!(bytes[0], 0x1b);
    let Some(&intro) = bytes.get(1) else {
        return EscapeScan::Incomplete;
    };
    match intro {
        // CSI: parameters 0x30-0x3F, intermediates 0x20-0x2F, final 0x40-0x7E.
        b'[' => {
            let mut j = 2;
            while let Some(&b) = bytes.get(j) {
                if (0x40..=0x7e).contains(&b) {
                    return EscapeScan::Complete(j + 1);
                }
                if !(0x20..=0x3f).contains(&b) {
                    // Malformed; swallow up to the offending byte.
                    return EscapeScan::Complete(j);
                }
                j += 1;
            }
            EscapeScan::Incomplete
        }
        // OSC: terminated by BEL or ST (ESC \).
        b']' => {
            let mut j = 2;
            while let Some(&b) = bytes.get(j) {
                if b == 0x07 {
                    return EscapeScan::Complete(j + 1);
                }
                if b == 0x1b {
                    return match bytes.get(j + 1) {
                        Some(b'\\') => EscapeScan::Complete(j + 2),
                        Some(_) => EscapeScan::Complete(j),
                        None => EscapeScan::Incomplete,
                    };
                }
                j += 1;
            }
            EscapeScan::Incomplete
        }
        // Two-byte escapes (RIS, charset selection, etc.).
        _ => EscapeScan::Complete(2),
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b & 0xe0 == 0xc0 => 2,
        b if b & 0xf0 == 0xe0 => 3,
        b if b & 0xf8 == 0xf0 => 4,
        _ => 1,
    }
}

/// Collapse runs of non-newline whitespace to one space and trim trailing
/// spaces on each line.
#[must_use]
pub fn collapse_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (idx, line) in s.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let mut pending_space = false;
        let mut seen_non_ws = false;
        for ch in line.chars() {
            if ch.is_whitespace() {
                pending_space = true;
            } else {
                if pending_space && seen_non_ws {
                    out.push(' ');
                }
                pending_space = false;
                seen_non_ws = true;
                out.push(ch);
            }
        }
    }
    out
}

/// Replace volatile substrings (timestamps, UUIDs, PIDs, hex addresses) with
/// fixed placeholders so that hashing over the result is deterministic.
#[must_use]
pub fn scrub(s: &str) -> String {
    let mut text = s.to_string();
    for (pattern, replacement) in scrub_patterns() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    text
}

/// Replace user-specific home directory prefixes with `<USER>` placeholders.
#[must_use]
pub fn normalize_user_paths(s: &str) -> String {
    let mut text = s.to_string();
    for (pattern, replacement) in user_path_patterns() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    text
}

/// Normalize `\r\n` and bare `\r` to `\n`.
#[must_use]
pub fn normalize_line_endings(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Configurable normalizer used by the matcher pipeline and the tape index.
///
/// `strip_ansi` runs first, then whitespace collapsing, then volatile
/// scrubbing, then path and line-ending normalization.
#[derive(Debug, Clone)]
pub struct Normalizer {
    pub strip_ansi: bool,
    pub collapse_ws: bool,
    pub scrub_volatile: bool,
    pub normalize_paths: bool,
    custom: Vec<(Regex, String)>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            strip_ansi: true,
            collapse_ws: true,
            scrub_volatile: true,
            normalize_paths: true,
            custom: Vec::new(),
        }
    }
}

impl Normalizer {
    /// Add a custom scrub pattern applied after the built-in ones.
    #[must_use]
    pub fn with_pattern(mut self, pattern: Regex, replacement: impl Into<String>) -> Self {
        self.custom.push((pattern, replacement.into()));
        self
    }

    /// Apply the configured normalizations in order.
    #[must_use]
    pub fn normalize(&self, s: &str) -> String {
        let mut text = normalize_line_endings(s);
        if self.strip_ansi {
            text = strip_ansi(&text);
        }
        if self.collapse_ws {
            text = collapse_ws(&text);
        }
        if self.scrub_volatile {
            text = scrub(&text);
            for (pattern, replacement) in &self.custom {
                text = pattern.replace_all(&text, replacement.as_str()).into_owned();
            }
        }
        if self.normalize_paths {
            text = normalize_user_paths(&text);
        }
        text
    }

    /// Normalize raw bytes; invalid UTF-8 is replacement-escaped first so the
    /// result is deterministic for hashing.
    #[must_use]
    pub fn normalize_bytes(&self, data: &[u8]) -> String {
        self.normalize(&String::from_utf8_lossy(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_sgr_and_csi() {
        let s = "\x1b[1;32mgreen\x1b[0m plain \x1b[2K";
        assert_eq!(strip_ansi(s), "green plain ");
    }

    #[test]
    fn strips_osc_title() {
        let s = "\x1b]0;window title\x07after";
        assert_eq!(strip_ansi(s), "after");
        let st_terminated = "\x1b]2;t\x1b\\after";
        assert_eq!(strip_ansi(st_terminated), "after");
    }

    #[test]
    fn incomplete_escape_kept_verbatim() {
        let s = "prompt> \x1b[3";
        assert_eq!(strip_ansi(s), "prompt> \x1b[3");
        let s = "x\x1b";
        assert_eq!(strip_ansi(s), "x\x1b");
        let s = "x\x1b]0;half";
        assert_eq!(strip_ansi(s), "x\x1b]0;half");
    }

    #[test]
    fn preserves_newlines_and_unicode() {
        let s = "héllo\n\x1b[31mwörld\x1b[0m\n";
        assert_eq!(strip_ansi(s), "héllo\nwörld\n");
    }

    #[test]
    fn collapse_ws_basics() {
        assert_eq!(collapse_ws("a  b\tc"), "a b c");
        assert_eq!(collapse_ws("line one   \nline  two  "), "line one\nline two");
        assert_eq!(collapse_ws("  leading"), "leading");
    }

    #[test]
    fn scrub_timestamps() {
        let s = "started 2024-05-01T12:30:00Z done at 09:15:01.250";
        assert_eq!(scrub(s), format!("started {TS_PLACEHOLDER} done at {TS_PLACEHOLDER}"));
    }

    #[test]
    fn scrub_uuid_pid_hex() {
        let s = "id=9f1c2d3e-4a5b-6c7d-8e9f-0a1b2c3d4e5f pid: 4821 sha abcdef0123456789abcdef0123456789";
        let out = scrub(s);
        assert!(out.contains(UUID_PLACEHOLDER), "{out}");
        assert!(out.contains("pid: <PID>"), "{out}");
        assert!(out.contains(HEX_PLACEHOLDER), "{out}");
    }

    #[test]
    fn short_hex_untouched() {
        assert_eq!(scrub("deadbeef"), "deadbeef");
    }

    #[test]
    fn user_paths_normalized() {
        assert_eq!(
            normalize_user_paths("/home/alice/project and /Users/bob/x"),
            "/home/<USER>/project and /Users/<USER>/x"
        );
    }

    #[test]
    fn normalizer_pipeline_order() {
        let n = Normalizer::default();
        let s = "\x1b[1m> \x1b[0mbuilt  at 2024-05-01 12:30:00\r\n";
        assert_eq!(n.normalize(s), format!("> built at {TS_PLACEHOLDER}\n"));
    }

    #[test]
    fn normalizer_custom_pattern() {
        let n = Normalizer::default()
            .with_pattern(Regex::new(r"session-\d+").unwrap(), "session-<N>");
        assert_eq!(n.normalize("session-42 ready"), "session-<N> ready");
    }

    #[test]
    fn normalize_bytes_is_lossy_but_stable() {
        let n = Normalizer::default();
        let bytes = b"ok \xff\xfe done";
        assert_eq!(n.normalize_bytes(bytes), n.normalize_bytes(bytes));
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(s in "\\PC{0,200}") {
            let n = Normalizer::default();
            let once = n.normalize(&s);
            prop_assert_eq!(n.normalize(&once), once.clone());
        }

        #[test]
        fn strip_ansi_idempotent_on_complete_input(s in "[a-z \\n]{0,100}") {
            // Plain text has no escapes: stripping is the identity.
            prop_assert_eq!(strip_ansi(&s), s);
        }
    }
}
