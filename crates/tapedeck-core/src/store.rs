//! Tape storage: recursive loading, in-memory indices, atomic writes.
//!
//! The store is shared process-wide behind an `Arc`: many replay sessions
//! read it concurrently while recorders append new tapes. The in-memory
//! index sits behind a reader/writer lock; on-disk writes serialize per path
//! through [`PathLock`].
//!
//! A tape that fails to parse is logged and skipped; one bad file never
//! poisons the store.

use std::collections::{BTreeSet, HashMap};
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::lock::{PathLock, LOCK_WAIT_DEFAULT};
use crate::matching::{levenshtein, KeyBuilder, MatchKey};
use crate::tape::{decode_tape, encode_tape, Exchange, SchemaChecker, Tape, TAPE_EXTENSION};

/// Read-only handle into a loaded tape.
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
    pub tape: Arc<Tape>,
    pub path: PathBuf,
    pub exchange_index: usize,
}

impl ExchangeHandle {
    /// The matched exchange within the tape.
    #[must_use]
    pub fn exchange(&self) -> &Exchange {
        &self.tape.exchanges[self.exchange_index]
    }
}

/// Usage accounting reported at session close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    /// Tapes written during this session, sorted.
    pub new: Vec<PathBuf>,
    /// Tapes loaded but never matched, sorted.
    pub unused: Vec<PathBuf>,
}

struct LoadedTape {
    path: PathBuf,
    tape: Arc<Tape>,
}

#[derive(Default)]
struct Index {
    tapes: Vec<LoadedTape>,
    /// Composite exchange key -> (tape ordinal, exchange ordinal).
    exchanges: HashMap<MatchKey, (usize, usize)>,
    /// Canonical input text per indexed exchange, for miss diagnostics.
    inputs: Vec<String>,
    /// Session identity key -> tape ordinal.
    identities: HashMap<MatchKey, usize>,
}

#[derive(Default)]
struct Usage {
    used: BTreeSet<PathBuf>,
    new: BTreeSet<PathBuf>,
}

/// Thread-safe tape store rooted at a directory.
pub struct TapeStore {
    root: PathBuf,
    keys: KeyBuilder,
    lock_wait: Duration,
    checker: Option<Box<dyn SchemaChecker>>,
    index: RwLock<Index>,
    usage: Mutex<Usage>,
}

impl TapeStore {
    /// Open a store and index every `*.json5` tape under `root`.
    pub fn open(root: impl Into<PathBuf>, keys: KeyBuilder) -> Result<Self> {
        Self::open_with_checker(root, keys, None)
    }

    /// Open with an optional stricter schema checker applied per tape.
    pub fn open_with_checker(
        root: impl Into<PathBuf>,
        keys: KeyBuilder,
        checker: Option<Box<dyn SchemaChecker>>,
    ) -> Result<Self> {
        let store = Self {
            root: root.into(),
            keys,
            lock_wait: LOCK_WAIT_DEFAULT,
            checker,
            index: RwLock::new(Index::default()),
            usage: Mutex::new(Usage::default()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Root directory of this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key builder shared with this store's index.
    #[must_use]
    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Rebuild the index from disk. Individual tape failures are logged and
    /// skipped; the rebuild itself only fails on I/O errors walking the root.
    pub fn reload(&self) -> Result<()> {
        let started = Instant::now();
        let mut paths = Vec::new();
        if self.root.exists() {
            collect_tape_paths(&self.root, &mut paths)?;
        }
        paths.sort();

        let mut index = Index::default();
        for path in paths {
            match self.load_tape_file(&path) {
                Ok(tape) => index_tape(&mut index, &self.keys, path, Arc::new(tape)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable tape"
                    );
                }
            }
        }

        tracing::debug!(
            root = %self.root.display(),
            tapes = index.tapes.len(),
            exchanges = index.exchanges.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tape index built"
        );
        *self.index.write().expect("index lock poisoned") = index;
        Ok(())
    }

    fn load_tape_file(&self, path: &Path) -> Result<Tape> {
        let text = std::fs::read_to_string(path)?;
        if let Some(checker) = &self.checker {
            let raw: serde_json::Value = json5::from_str(&text).map_err(|e| Error::Schema {
                path: path.to_path_buf(),
                line: None,
                column: None,
                message: e.to_string(),
            })?;
            checker.check(&raw, path)?;
        }
        decode_tape(&text, path)
    }

    /// Number of loaded tapes.
    #[must_use]
    pub fn tape_count(&self) -> usize {
        self.index.read().expect("index lock poisoned").tapes.len()
    }

    /// Number of indexed exchanges.
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.index
            .read()
            .expect("index lock poisoned")
            .exchanges
            .len()
    }

    /// Look up an exchange by composite key, marking its tape used on a hit.
    #[must_use]
    pub fn lookup(&self, key: &MatchKey) -> Option<ExchangeHandle> {
        let index = self.index.read().expect("index lock poisoned");
        let &(tape_idx, exchange_idx) = index.exchanges.get(key)?;
        let loaded = &index.tapes[tape_idx];
        let handle = ExchangeHandle {
            tape: Arc::clone(&loaded.tape),
            path: loaded.path.clone(),
            exchange_index: exchange_idx,
        };
        drop(index);
        self.mark_used(&handle.path);
        Some(handle)
    }

    /// Whether any loaded tape matches the given session identity.
    #[must_use]
    pub fn contains_identity(&self, key: &MatchKey) -> bool {
        self.index
            .read()
            .expect("index lock poisoned")
            .identities
            .contains_key(key)
    }

    /// Path of the tape matching a session identity, if any. Overwrite-mode
    /// recording reuses it as the write target.
    #[must_use]
    pub fn identity_path(&self, key: &MatchKey) -> Option<PathBuf> {
        let index = self.index.read().expect("index lock poisoned");
        index
            .identities
            .get(key)
            .map(|&idx| index.tapes[idx].path.clone())
    }

    /// The recorded inputs closest to `input` by edit distance, nearest
    /// first, at most `limit` entries.
    #[must_use]
    pub fn nearest_inputs(&self, input: &str, limit: usize) -> Vec<String> {
        let index = self.index.read().expect("index lock poisoned");
        let mut scored: Vec<(usize, &String)> = index
            .inputs
            .iter()
            .map(|recorded| (levenshtein(input, recorded), recorded))
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        scored.dedup_by(|a, b| a.1 == b.1);
        scored.into_iter().take(limit).map(|(_, s)| s.clone()).collect()
    }

    /// Persist a tape at `relative` under the store root, atomically and
    /// under the per-path file lock, then add it to the index.
    pub fn write_tape(&self, tape: &Tape, relative: &Path) -> Result<PathBuf> {
        validate_tape_name(relative)?;
        let path = self.root.join(relative);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&parent)?;

        let _lock = PathLock::acquire(&path, self.lock_wait)?;
        let text = encode_tape(tape)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!(
            path = %path.display(),
            exchanges = tape.exchanges.len(),
            "tape written"
        );

        {
            let mut index = self.index.write().expect("index lock poisoned");
            index_tape(&mut index, &self.keys, path.clone(), Arc::new(tape.clone()));
        }
        self.mark_new(&path);
        Ok(path)
    }

    /// Record that a loaded tape served at least one exchange.
    pub fn mark_used(&self, path: &Path) {
        self.usage
            .lock()
            .expect("usage lock poisoned")
            .used
            .insert(path.to_path_buf());
    }

    /// Record that a tape was created during this session.
    pub fn mark_new(&self, path: &Path) {
        self.usage
            .lock()
            .expect("usage lock poisoned")
            .new
            .insert(path.to_path_buf());
    }

    /// New and loaded-but-unused tapes for this session; the sets are
    /// disjoint.
    #[must_use]
    pub fn summary(&self) -> StoreSummary {
        let usage = self.usage.lock().expect("usage lock poisoned");
        let index = self.index.read().expect("index lock poisoned");
        let mut unused: Vec<PathBuf> = index
            .tapes
            .iter()
            .map(|t| t.path.clone())
            .filter(|p| !usage.used.contains(p) && !usage.new.contains(p))
            .collect();
        unused.sort();
        StoreSummary {
            new: usage.new.iter().cloned().collect(),
            unused,
        }
    }
}

impl std::fmt::Debug for TapeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapeStore")
            .field("root", &self.root)
            .field("tapes", &self.tape_count())
            .finish()
    }
}

fn index_tape(index: &mut Index, keys: &KeyBuilder, path: PathBuf, tape: Arc<Tape>) {
    let tape_idx = index.tapes.len();

    let identity = keys.tape_identity_key(&tape);
    if let Some(prev) = index.identities.insert(identity, tape_idx) {
        tracing::debug!(
            path = %path.display(),
            shadowed = %index.tapes[prev].path.display(),
            "tape shadows an earlier session identity"
        );
    }

    for (exchange_idx, exchange) in tape.exchanges.iter().enumerate() {
        let key = keys.recorded_exchange_key(&tape, exchange);
        let ctx_input = exchange.input.data().unwrap_or_default();
        let ctx = crate::matching::MatchingContext {
            program: tape.meta.program.clone(),
            args: tape.meta.args.clone(),
            env: tape.meta.env.clone(),
            cwd: tape.meta.cwd.clone(),
            prompt: exchange.pre.prompt.clone(),
            state_hash: exchange.pre.state_hash.clone(),
        };
        index
            .inputs
            .push(keys.canonical_input(&ctx_input, exchange.input.kind, &ctx));
        if let Some((prev_tape, prev_ex)) =
            index.exchanges.insert(key.clone(), (tape_idx, exchange_idx))
        {
            tracing::warn!(
                key = %key,
                path = %path.display(),
                shadowed = %index.tapes[prev_tape].path.display(),
                shadowed_exchange = prev_ex,
                "duplicate match key; later tape shadows earlier"
            );
        }
    }

    index.tapes.push(LoadedTape { path, tape });
}

fn collect_tape_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_tape_paths(&path, out)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == TAPE_EXTENSION)
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Reject absolute paths, parent escapes, and non-`.json5` extensions for
/// generated tape names.
pub fn validate_tape_name(relative: &Path) -> Result<()> {
    if relative.is_absolute() {
        return Err(Error::Config(format!(
            "tape name must be relative: {}",
            relative.display()
        )));
    }
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Config(format!(
            "tape name must not escape the root: {}",
            relative.display()
        )));
    }
    if relative
        .extension()
        .map_or(true, |ext| ext != TAPE_EXTENSION)
    {
        return Err(Error::Config(format!(
            "tape name must end in .{TAPE_EXTENSION}: {}",
            relative.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::{
        Chunk, InputKind, InputRecord, OutputRecord, PreState, PtyDims, SessionInfo, TapeMeta,
        SCHEMA_VERSION,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn tape_for(program: &str, input: &str, output: &str) -> Tape {
        Tape {
            schema_version: SCHEMA_VERSION,
            meta: TapeMeta {
                created_at: "2024-05-01T00:00:00Z".into(),
                program: program.into(),
                args: vec![],
                env: BTreeMap::new(),
                cwd: "/".into(),
                pty: PtyDims::default(),
                tag: None,
                latency: None,
                error_rate: 0,
                seed: 0,
            },
            session: SessionInfo {
                recorder: "test".into(),
                platform: "linux".into(),
            },
            exchanges: vec![Exchange {
                pre: PreState::default(),
                input: InputRecord::from_bytes(InputKind::Line, input.as_bytes()),
                output: OutputRecord {
                    chunks: vec![Chunk::from_bytes(0, output.as_bytes())],
                },
                exit: None,
                dur_ms: 1,
                annotations: BTreeMap::new(),
            }],
            extra: BTreeMap::new(),
        }
    }

    fn store_in(tmp: &TempDir) -> TapeStore {
        TapeStore::open(tmp.path(), KeyBuilder::default()).unwrap()
    }

    #[test]
    fn open_on_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = TapeStore::open(tmp.path().join("nope"), KeyBuilder::default()).unwrap();
        assert_eq!(store.tape_count(), 0);
    }

    #[test]
    fn write_then_lookup_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let tape = tape_for("cat", "hello\n", "hello\n");
        let path = store
            .write_tape(&tape, Path::new("cat/one.json5"))
            .unwrap();
        assert!(path.exists());

        let key = store.keys().recorded_exchange_key(&tape, &tape.exchanges[0]);
        let handle = store.lookup(&key).expect("indexed after write");
        assert_eq!(handle.exchange().output.data().unwrap(), b"hello\n");
    }

    #[test]
    fn reload_discovers_nested_tapes() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store
            .write_tape(&tape_for("a", "1\n", "x"), Path::new("a/deep/t.json5"))
            .unwrap();
        store
            .write_tape(&tape_for("b", "2\n", "y"), Path::new("b.json5"))
            .unwrap();

        let fresh = store_in(&tmp);
        assert_eq!(fresh.tape_count(), 2);
    }

    #[test]
    fn bad_tape_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("broken.json5"), "{ not valid").unwrap();
        let store = store_in(&tmp);
        store
            .write_tape(&tape_for("ok", "1\n", "x"), Path::new("ok.json5"))
            .unwrap();
        let fresh = store_in(&tmp);
        assert_eq!(fresh.tape_count(), 1);
    }

    #[test]
    fn duplicate_keys_shadow_later_wins() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let tape = tape_for("cat", "same\n", "first");
        store.write_tape(&tape, Path::new("a.json5")).unwrap();
        let mut second = tape.clone();
        second.exchanges[0].output.chunks = vec![Chunk::from_bytes(0, b"second")];
        store.write_tape(&second, Path::new("z.json5")).unwrap();

        let fresh = store_in(&tmp);
        let key = fresh
            .keys()
            .recorded_exchange_key(&tape, &tape.exchanges[0]);
        let handle = fresh.lookup(&key).unwrap();
        // Paths sort a.json5 before z.json5, so z shadows a.
        assert_eq!(handle.exchange().output.data().unwrap(), b"second");
    }

    #[test]
    fn identity_index_answers_tape_exists() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let tape = tape_for("prog", "x\n", "y");
        store.write_tape(&tape, Path::new("p.json5")).unwrap();

        let id = store.keys().tape_identity_key(&tape);
        assert!(store.contains_identity(&id));

        let other = store.keys().identity_key(
            "other",
            &[],
            &BTreeMap::new(),
            "/",
        );
        assert!(!store.contains_identity(&other));
    }

    #[test]
    fn nearest_inputs_ranked_by_distance() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store
            .write_tape(&tape_for("p", "hello\n", "1"), Path::new("1.json5"))
            .unwrap();
        store
            .write_tape(&tape_for("p", "help\n", "2"), Path::new("2.json5"))
            .unwrap();
        store
            .write_tape(&tape_for("p", "completely different\n", "3"), Path::new("3.json5"))
            .unwrap();

        let nearest = store.nearest_inputs("hallo", 2);
        assert_eq!(nearest.len(), 2);
        assert_eq!(nearest[0], "hello");
        assert_eq!(nearest[1], "help");
    }

    #[test]
    fn usage_summary_is_disjoint() {
        let tmp = TempDir::new().unwrap();
        {
            let seed = store_in(&tmp);
            seed.write_tape(&tape_for("used", "a\n", "x"), Path::new("used.json5"))
                .unwrap();
            seed.write_tape(&tape_for("unused", "b\n", "y"), Path::new("unused.json5"))
                .unwrap();
        }

        let store = store_in(&tmp);
        let used_tape = tape_for("used", "a\n", "x");
        let key = store
            .keys()
            .recorded_exchange_key(&used_tape, &used_tape.exchanges[0]);
        store.lookup(&key).unwrap();
        store
            .write_tape(&tape_for("fresh", "c\n", "z"), Path::new("fresh.json5"))
            .unwrap();

        let summary = store.summary();
        assert_eq!(summary.new, vec![tmp.path().join("fresh.json5")]);
        assert_eq!(summary.unused, vec![tmp.path().join("unused.json5")]);
    }

    #[test]
    fn atomic_write_leaves_no_partial_file() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let tape = tape_for("p", "x\n", "y");
        let path = store.write_tape(&tape, Path::new("p.json5")).unwrap();

        // The written file parses back whole.
        let text = std::fs::read_to_string(&path).unwrap();
        let back = decode_tape(&text, &path).unwrap();
        assert_eq!(back, tape);

        // No temp droppings beside it.
        let stray: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tmp"))
            .collect();
        assert!(stray.is_empty(), "stray temp files: {stray:?}");
    }

    #[test]
    fn tape_name_validation() {
        assert!(validate_tape_name(Path::new("a/b.json5")).is_ok());
        assert!(validate_tape_name(Path::new("/abs.json5")).is_err());
        assert!(validate_tape_name(Path::new("../escape.json5")).is_err());
        assert!(validate_tape_name(Path::new("wrong.json")).is_err());
        assert!(validate_tape_name(Path::new("noext")).is_err());
    }

    #[test]
    fn index_determinism_across_loads() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        for i in 0..5 {
            store
                .write_tape(
                    &tape_for("p", &format!("input-{i}\n"), "out"),
                    Path::new(&format!("t{i}.json5")),
                )
                .unwrap();
        }

        let a = store_in(&tmp);
        let b = store_in(&tmp);
        assert_eq!(a.exchange_count(), b.exchange_count());
        let tape = tape_for("p", "input-3\n", "out");
        let key = a.keys().recorded_exchange_key(&tape, &tape.exchanges[0]);
        assert_eq!(
            a.lookup(&key).map(|h| h.path),
            b.lookup(&key).map(|h| h.path)
        );
    }
}
