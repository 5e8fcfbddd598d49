//! Deterministic tape file naming.
//!
//! Generators return paths relative to the store root; the store rejects
//! absolute paths, parent escapes, and extensions other than `.json5`.

use std::path::{Path, PathBuf};

use crate::matching::MatchKey;
use crate::tape::TAPE_EXTENSION;

/// Inputs available to a name generator.
#[derive(Debug, Clone)]
pub struct NamingContext {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub tag: Option<String>,
    /// Session-identity key; its short form keeps names collision-resistant.
    pub identity: MatchKey,
    /// Wall-clock milliseconds at finalize time.
    pub unix_ms: u64,
}

/// Strategy for choosing where a new tape lands under the store root.
pub trait TapeNameGenerator: Send + Sync {
    fn tape_path(&self, ctx: &NamingContext) -> PathBuf;
}

impl<F> TapeNameGenerator for F
where
    F: Fn(&NamingContext) -> PathBuf + Send + Sync,
{
    fn tape_path(&self, ctx: &NamingContext) -> PathBuf {
        self(ctx)
    }
}

/// Default layout: `<program>/<tag-or-'unnamed'>-<unix-ms>-<hash8>.json5`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNameGenerator;

impl TapeNameGenerator for DefaultNameGenerator {
    fn tape_path(&self, ctx: &NamingContext) -> PathBuf {
        let program = sanitize(&basename(&ctx.program));
        let stem = ctx
            .tag
            .as_deref()
            .map_or_else(|| "unnamed".to_string(), sanitize);
        PathBuf::from(program).join(format!(
            "{stem}-{}-{}.{TAPE_EXTENSION}",
            ctx.unix_ms,
            ctx.identity.short()
        ))
    }
}

/// Layout that nests a leading sub-command verb when the first argument looks
/// like one: `git/commit/commit-<unix-ms>-<hash8>.json5`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticNameGenerator;

impl TapeNameGenerator for SemanticNameGenerator {
    fn tape_path(&self, ctx: &NamingContext) -> PathBuf {
        let program = sanitize(&basename(&ctx.program));
        let verb = ctx
            .args
            .first()
            .filter(|a| a.chars().all(|c| c.is_ascii_lowercase()))
            .map(|a| sanitize(a));
        let suffix = format!("{}-{}.{TAPE_EXTENSION}", ctx.unix_ms, ctx.identity.short());
        match verb {
            Some(verb) => PathBuf::from(program)
                .join(&verb)
                .join(format!("{verb}-{suffix}")),
            None => PathBuf::from(program).join(format!("session-{suffix}")),
        }
    }
}

fn basename(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map_or_else(|| program.to_string(), |n| n.to_string_lossy().into_owned())
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::KeyBuilder;
    use crate::store::validate_tape_name;
    use std::collections::BTreeMap;

    fn ctx(program: &str, args: &[&str], tag: Option<&str>) -> NamingContext {
        let keys = KeyBuilder::default();
        let args: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();
        NamingContext {
            identity: keys.identity_key(program, &args, &BTreeMap::new(), "/"),
            program: program.into(),
            args,
            cwd: "/".into(),
            tag: tag.map(Into::into),
            unix_ms: 1_714_500_000_000,
        }
    }

    #[test]
    fn default_layout() {
        let path = DefaultNameGenerator.tape_path(&ctx("/usr/bin/git", &["status"], None));
        let s = path.to_string_lossy();
        assert!(s.starts_with("git/unnamed-1714500000000-"), "{s}");
        assert!(s.ends_with(".json5"));
        validate_tape_name(&path).unwrap();
    }

    #[test]
    fn tag_replaces_unnamed() {
        let path = DefaultNameGenerator.tape_path(&ctx("git", &[], Some("smoke test")));
        assert!(path.to_string_lossy().contains("smoke_test-"), "{path:?}");
    }

    #[test]
    fn hash_is_stable_per_identity() {
        let a = DefaultNameGenerator.tape_path(&ctx("git", &["status"], None));
        let b = DefaultNameGenerator.tape_path(&ctx("git", &["status"], None));
        assert_eq!(a, b);
        let c = DefaultNameGenerator.tape_path(&ctx("git", &["log"], None));
        assert_ne!(a, c);
    }

    #[test]
    fn semantic_nests_verbs() {
        let path = SemanticNameGenerator.tape_path(&ctx("git", &["commit", "-m", "x"], None));
        let s = path.to_string_lossy();
        assert!(s.starts_with("git/commit/commit-"), "{s}");
        validate_tape_name(&path).unwrap();

        let no_verb = SemanticNameGenerator.tape_path(&ctx("git", &["--version"], None));
        assert!(no_verb.to_string_lossy().starts_with("git/session-"));
    }

    #[test]
    fn hostile_names_sanitized() {
        let path = DefaultNameGenerator.tape_path(&ctx("../../evil prog", &[], Some("a/b")));
        validate_tape_name(&path).unwrap();
    }
}
