use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde_json::{Map, Value};
use tracing::{debug, info, trace, warn};

use super::{DocPath, DocumentBackend, WatchCallback};
use crate::datastore::{load_json, remove_file_if_exists, save_json_atomic};
use crate::subscription::Unsubscribe;

/// Document store on the local filesystem: `<root>/<a>/<b>.json` holds the
/// document at `a/b`. Several processes may share one root; watchers poll.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    poll: Duration,
}

impl FsBackend {
    pub const DEFAULT_POLL: Duration = Duration::from_millis(500);

    #[tracing::instrument(skip(root))]
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        info!(root = %root.display(), "opened document store");
        Ok(Self {
            root: root.to_path_buf(),
            poll: Self::DEFAULT_POLL,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_millis(10));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, path: &DocPath) -> PathBuf {
        path.segments()
            .iter()
            .fold(self.root.clone(), |dir, segment| dir.join(segment))
    }

    fn file_for(&self, path: &DocPath) -> Option<PathBuf> {
        let (last, parents) = path.segments().split_last()?;
        let dir = parents
            .iter()
            .fold(self.root.clone(), |dir, segment| dir.join(segment));
        Some(dir.join(format!("{last}.json")))
    }
}

impl DocumentBackend for FsBackend {
    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }

    #[tracing::instrument(skip(self), fields(path = %path))]
    fn get(&self, path: &DocPath) -> anyhow::Result<Option<Value>> {
        if let Some(file) = self.file_for(path)
            && file.is_file()
        {
            return Ok(read_document(&file));
        }

        let dir = self.dir_for(path);
        if dir.is_dir() {
            return read_collection(&dir);
        }
        Ok(None)
    }

    #[tracing::instrument(skip(self, value), fields(path = %path))]
    fn set(&self, path: &DocPath, value: Value) -> anyhow::Result<()> {
        let file = self
            .file_for(path)
            .ok_or_else(|| anyhow!("cannot write the root document"))?;

        if value.is_null() {
            remove_file_if_exists(&file)?;
            let dir = self.dir_for(path);
            if dir.is_dir() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
            debug!("removed document");
            return Ok(());
        }

        save_json_atomic(&file, &value)?;
        debug!(file = %file.display(), "wrote document");
        Ok(())
    }

    #[tracing::instrument(skip(self, callback), fields(path = %path))]
    fn watch(&self, path: &DocPath, mut callback: WatchCallback) -> anyhow::Result<Unsubscribe> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let backend = self.clone();
        let watched = path.clone();

        let handle = thread::Builder::new()
            .name(format!("watch{path}"))
            .spawn(move || {
                let mut last: Option<Option<Value>> = None;
                while !stop_flag.load(Ordering::Acquire) {
                    match backend.get(&watched) {
                        Ok(current) => {
                            if last.as_ref() != Some(&current) {
                                trace!(path = %watched, "document changed");
                                callback(current.clone());
                                last = Some(current);
                            }
                        }
                        Err(err) => {
                            warn!(path = %watched, error = %format!("{err:#}"), "watch poll failed");
                        }
                    }
                    thread::park_timeout(backend.poll);
                }
                debug!(path = %watched, "watch stopped");
            })
            .context("failed to spawn watch thread")?;

        Ok(Unsubscribe::new(move || {
            stop.store(true, Ordering::Release);
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("watch thread panicked");
            }
        }))
    }
}

fn read_document(file: &Path) -> Option<Value> {
    match load_json::<Value>(file) {
        Ok(value) => value.filter(|value| !value.is_null()),
        Err(err) => {
            warn!(file = %file.display(), error = %format!("{err:#}"), "skipping malformed document");
            None
        }
    }
}

fn read_collection(dir: &Path) -> anyhow::Result<Option<Value>> {
    let mut children = Map::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if let Some(value) = read_collection(&path)? {
                children.entry(name).or_insert(value);
            }
        } else if let Some(stem) = name.strip_suffix(".json")
            && let Some(value) = read_document(&path)
        {
            children.insert(stem.to_string(), value);
        }
    }

    if children.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Value::Object(children)))
    }
}
