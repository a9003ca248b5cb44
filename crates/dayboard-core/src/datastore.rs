use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use std::collections::BTreeSet;

use anyhow::{Context, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::keys::{DayKey, MonthKey, WeekKey};
use crate::record::Snapshot;

/// What the cache keeps per namespace: the three record collections and
/// the keys edited here that the remote store has not accepted yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDocument {
    #[serde(default)]
    pub records: Snapshot,
    #[serde(default, skip_serializing_if = "UnsyncedKeys::is_empty")]
    pub unsynced: UnsyncedKeys,
}

impl CacheDocument {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.unsynced.is_empty()
    }
}

/// Keys whose local record is newer than the remote copy. A pull leaves
/// these records alone until a push succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsyncedKeys {
    #[serde(default)]
    pub days: BTreeSet<DayKey>,
    #[serde(default)]
    pub weeks: BTreeSet<WeekKey>,
    #[serde(default)]
    pub months: BTreeSet<MonthKey>,
}

impl UnsyncedKeys {
    pub fn is_empty(&self) -> bool {
        self.days.is_empty() && self.weeks.is_empty() && self.months.is_empty()
    }

    pub fn len(&self) -> usize {
        self.days.len() + self.weeks.len() + self.months.len()
    }
}

/// Cache partition. Signed-out work lives under `Guest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    Guest,
    User(String),
}

impl Namespace {
    pub fn for_uid(uid: Option<&str>) -> Self {
        match uid {
            Some(uid) => Self::User(uid.to_string()),
            None => Self::Guest,
        }
    }

    fn file_name(&self) -> String {
        match self {
            Self::Guest => "guest.json".to_string(),
            Self::User(uid) => format!("uid-{}.json", sanitize(uid)),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => f.write_str("guest"),
            Self::User(uid) => write!(f, "uid:{uid}"),
        }
    }
}

#[derive(Debug)]
pub struct DataStore {
    pub data_dir: PathBuf,
    pub session_path: PathBuf,
    pub cache: LocalCache,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let session_path = data_dir.join("session.json");
        let cache = LocalCache::open(&data_dir.join("cache"))?;

        info!(
            data_dir = %data_dir.display(),
            session = %session_path.display(),
            cache = %cache.dir.display(),
            "opened datastore"
        );

        Ok(Self {
            data_dir,
            session_path,
            cache,
        })
    }
}

/// Per-identity working copy of the user's records, one JSON file per
/// namespace.
#[derive(Debug, Clone)]
pub struct LocalCache {
    pub dir: PathBuf,
}

impl LocalCache {
    #[tracing::instrument(skip(dir))]
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, namespace: &Namespace) -> PathBuf {
        self.dir.join(namespace.file_name())
    }

    /// Missing or unreadable caches load as empty.
    #[tracing::instrument(skip(self), fields(namespace = %namespace))]
    pub fn load(&self, namespace: &Namespace) -> CacheDocument {
        let path = self.path_for(namespace);
        match load_json::<CacheDocument>(&path) {
            Ok(Some(doc)) => {
                debug!(
                    days = doc.records.days.len(),
                    weeks = doc.records.weeks.len(),
                    months = doc.records.months.len(),
                    unsynced = doc.unsynced.len(),
                    "loaded cache"
                );
                doc
            }
            Ok(None) => CacheDocument::default(),
            Err(err) => {
                warn!(file = %path.display(), error = %format!("{err:#}"), "ignoring unreadable cache");
                CacheDocument::default()
            }
        }
    }

    #[tracing::instrument(skip(self, doc), fields(namespace = %namespace))]
    pub fn save(&self, namespace: &Namespace, doc: &CacheDocument) -> anyhow::Result<()> {
        let path = self.path_for(namespace);
        save_json_atomic(&path, doc)
            .with_context(|| format!("failed to save cache for {namespace}"))
    }

    #[tracing::instrument(skip(self), fields(namespace = %namespace))]
    pub fn evict(&self, namespace: &Namespace) -> anyhow::Result<()> {
        let path = self.path_for(namespace);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(file = %path.display(), "evicted cache");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

/// Reads a JSON file. `Ok(None)` when it does not exist or is blank.
#[tracing::instrument(skip(path))]
pub fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing {}", path.display()))?;
    Ok(Some(value))
}

#[tracing::instrument(skip(path, value))]
pub fn save_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    debug!(file = %path.display(), "saving json atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    writeln!(temp)?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}

pub fn remove_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{LocalCache, Namespace};
    use crate::record::{DayRecord, Entry};

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open cache");

        let mut doc = cache.load(&Namespace::Guest);
        let mut record = DayRecord::default();
        record.tasks.insert(9, Entry::new("guest task"));
        doc.records.days.insert("2024-01-01".parse().expect("day"), record);
        cache.save(&Namespace::Guest, &doc).expect("save guest");

        let alice = Namespace::User("alice".to_string());
        assert!(cache.load(&alice).is_empty());
        assert_eq!(cache.load(&Namespace::Guest), doc);
    }

    #[test]
    fn evict_removes_only_that_namespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open cache");
        let alice = Namespace::User("alice".to_string());

        let mut doc = cache.load(&alice);
        doc.records.days.insert("2024-01-01".parse().expect("day"), DayRecord::default());
        cache.save(&alice, &doc).expect("save alice");
        cache.save(&Namespace::Guest, &doc).expect("save guest");

        cache.evict(&alice).expect("evict");
        cache.evict(&alice).expect("evicting twice is fine");
        assert!(cache.load(&alice).is_empty());
        assert!(!cache.load(&Namespace::Guest).is_empty());
    }

    #[test]
    fn unsynced_keys_survive_a_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open cache");
        let alice = Namespace::User("alice".to_string());

        let mut doc = cache.load(&alice);
        let day: crate::keys::DayKey = "2024-02-10".parse().expect("day");
        doc.records.days.insert(day.clone(), DayRecord::default());
        doc.unsynced.days.insert(day.clone());
        cache.save(&alice, &doc).expect("save");

        let loaded = cache.load(&alice);
        assert!(loaded.unsynced.days.contains(&day));
        assert_eq!(loaded, doc);
    }

    #[test]
    fn clean_cache_files_omit_unsynced_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open cache");
        let path = cache.path_for(&Namespace::Guest);
        std::fs::write(
            &path,
            r#"{"records":{"days":{"2024-01-01":{"note":"hi","tasks":{"9":{"text":"run","done":false}}}}}}"#,
        )
        .expect("write");

        let doc = cache.load(&Namespace::Guest);
        assert_eq!(doc.records.days.len(), 1);
        assert!(doc.unsynced.is_empty());

        cache.save(&Namespace::Guest, &doc).expect("save");
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(!raw.contains("unsynced"));
    }

    #[test]
    fn corrupt_cache_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open cache");
        std::fs::write(cache.path_for(&Namespace::Guest), "{ not json").expect("write");
        assert!(cache.load(&Namespace::Guest).is_empty());
    }

    #[test]
    fn namespace_labels() {
        assert_eq!(Namespace::Guest.to_string(), "guest");
        assert_eq!(Namespace::for_uid(Some("u1")).to_string(), "uid:u1");
        assert_ne!(
            Namespace::User("a/b".to_string()).file_name(),
            Namespace::Guest.file_name()
        );
    }
}
