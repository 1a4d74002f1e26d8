use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Bucket consulted when the page-specific bucket has no entry.
pub const WILDCARD_CONTEXT: &str = "*";
const HISTORY_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialise selector history: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What the store knows about one `(context, goal)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorMapping {
    pub selector: String,
    pub occurrences: u64,
    #[serde(rename = "firstSeenAt")]
    pub first_seen_at: DateTime<Utc>,
    #[serde(rename = "lastSeenAt")]
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    #[serde(default)]
    contexts: BTreeMap<String, BTreeMap<String, SelectorMapping>>,
}

impl Default for HistoryFile {
    fn default() -> Self {
        Self {
            version: HISTORY_FORMAT,
            contexts: BTreeMap::new(),
        }
    }
}

/// Durable `(context URL, goal) -> selector` memory.
///
/// Every successful `record` is flushed to disk before returning, so a crash
/// never loses a learned mapping. Load failures degrade to an empty store.
#[derive(Debug, Default)]
pub struct SelectorHistory {
    path: Option<PathBuf>,
    data: HistoryFile,
}

impl SelectorHistory {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. Missing files start empty; unreadable or corrupt
    /// files are reported and also start empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<HistoryFile>(&contents) {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "selector history unreadable, starting empty");
                    HistoryFile::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => HistoryFile::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read selector history, starting empty");
                HistoryFile::default()
            }
        };
        debug!(path = %path.display(), contexts = data.contexts.len(), "selector history loaded");
        Self {
            path: Some(path),
            data,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of stored `(context, goal)` pairs, wildcard bucket included.
    pub fn len(&self) -> usize {
        self.data.contexts.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selector learned for `goal` on `context_url`, falling back to the
    /// wildcard bucket.
    pub fn lookup(&self, goal: &str, context_url: &str) -> Option<&str> {
        self.mapping(goal, context_url).map(|m| m.selector.as_str())
    }

    pub fn mapping(&self, goal: &str, context_url: &str) -> Option<&SelectorMapping> {
        let goal = normalize_goal(goal);
        let context = normalize_context(context_url);
        self.data
            .contexts
            .get(&context)
            .and_then(|bucket| bucket.get(&goal))
            .or_else(|| {
                self.data
                    .contexts
                    .get(WILDCARD_CONTEXT)
                    .and_then(|bucket| bucket.get(&goal))
            })
    }

    /// Increment-or-create the mapping in both the page bucket and the
    /// wildcard bucket, then persist. A different selector for a known goal
    /// replaces the old one but keeps its count and first sighting.
    pub fn record(&mut self, goal: &str, selector: &str, context_url: &str) -> Result<(), HistoryError> {
        let goal = normalize_goal(goal);
        if goal.is_empty() || selector.trim().is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let context = normalize_context(context_url);
        let mut buckets = vec![context];
        if buckets[0] != WILDCARD_CONTEXT {
            buckets.push(WILDCARD_CONTEXT.to_string());
        }
        for bucket in buckets {
            let entries = self.data.contexts.entry(bucket).or_default();
            match entries.get_mut(&goal) {
                Some(existing) => {
                    if existing.selector != selector {
                        debug!(goal = %goal, from = %existing.selector, to = selector, "relearned selector");
                        existing.selector = selector.to_string();
                    }
                    existing.occurrences += 1;
                    existing.last_seen_at = now;
                }
                None => {
                    entries.insert(
                        goal.clone(),
                        SelectorMapping {
                            selector: selector.to_string(),
                            occurrences: 1,
                            first_seen_at: now,
                            last_seen_at: now,
                        },
                    );
                }
            }
        }
        self.save()
    }

    /// Persist with flock + fsync + atomic rename. No-op for in-memory stores.
    pub fn save(&self) -> Result<(), HistoryError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let io_err = |source: io::Error| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let lock = File::create(sibling(path, "lock")).map_err(io_err)?;
        lock.lock_exclusive().map_err(io_err)?;

        let temp_path = sibling(path, "tmp");
        let mut temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(io_err)?;
        serde_json::to_writer_pretty(&mut temp, &self.data)?;
        temp.sync_all().map_err(io_err)?;
        drop(temp);

        std::fs::rename(&temp_path, path).map_err(io_err)?;

        #[cfg(target_family = "unix")]
        {
            let dir_handle = File::open(&dir).map_err(io_err)?;
            dir_handle.sync_all().map_err(io_err)?;
        }

        drop(lock);
        Ok(())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Goals match case- and whitespace-insensitively.
pub fn normalize_goal(goal: &str) -> String {
    goal.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Pages are keyed by origin and path; query strings and fragments vary too
/// much between visits to be useful keys.
pub fn normalize_context(context_url: &str) -> String {
    let trimmed = context_url.trim();
    if trimmed.is_empty() || trimmed == WILDCARD_CONTEXT {
        return WILDCARD_CONTEXT.to_string();
    }
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            let rendered = url.to_string();
            match rendered.strip_suffix('/') {
                Some(stripped) if url.path() != "/" => stripped.to_string(),
                _ => rendered,
            }
        }
        Err(_) => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_drop_query_and_fragment() {
        assert_eq!(
            normalize_context("https://shop.test/cart?item=3#top"),
            "https://shop.test/cart"
        );
        assert_eq!(normalize_context("https://shop.test"), "https://shop.test/");
        assert_eq!(normalize_context(""), WILDCARD_CONTEXT);
        assert_eq!(normalize_context("not a url"), "not a url");
    }

    #[test]
    fn goals_ignore_case_and_spacing() {
        assert_eq!(normalize_goal("  Sign   In "), "sign in");
    }

    #[test]
    fn record_increments_and_falls_back_to_wildcard() {
        let mut history = SelectorHistory::in_memory();
        history.record("Login", "#login", "https://a.test/").unwrap();
        history.record("login", "#login", "https://a.test/?x=1").unwrap();

        let mapping = history.mapping("LOGIN", "https://a.test/").unwrap();
        assert_eq!(mapping.occurrences, 2);
        assert!(mapping.first_seen_at <= mapping.last_seen_at);

        assert_eq!(history.lookup("login", "https://b.test/"), Some("#login"));
        assert_eq!(history.lookup("logout", "https://a.test/"), None);
    }

    #[test]
    fn relearning_a_different_selector_keeps_counting() {
        let mut history = SelectorHistory::in_memory();
        history.record("Email", "#email", "https://a.test/").unwrap();
        history.record("Email", "#email", "https://a.test/").unwrap();
        let before = history.mapping("email", "https://a.test/").unwrap().clone();
        assert_eq!(before.occurrences, 2);

        history.record("Email", "#email-input", "https://a.test/").unwrap();
        let after = history.mapping("email", "https://a.test/").unwrap();
        assert_eq!(after.selector, "#email-input");
        assert!(after.occurrences > before.occurrences);
        assert_eq!(after.first_seen_at, before.first_seen_at);
        assert_eq!(history.lookup("email", "https://b.test/"), Some("#email-input"));
    }

    #[test]
    fn corrupt_file_degrades_to_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").unwrap();
        let history = SelectorHistory::load(&path);
        assert!(history.is_empty());
    }
}
