use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::{DocPath, DocumentBackend, WatchCallback};
use crate::subscription::Unsubscribe;

struct Watcher {
    id: u64,
    path: DocPath,
    callback: WatchCallback,
}

struct Inner {
    tree: Mutex<Map<String, Value>>,
    watchers: Mutex<Vec<Watcher>>,
    next_id: AtomicU64,
}

/// In-process document store with push notifications. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Map::new()),
                watchers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

impl Inner {
    fn read(&self, path: &DocPath) -> Option<Value> {
        let tree = self.tree.lock();
        let mut segments = path.segments().iter();
        let Some(first) = segments.next() else {
            return (!tree.is_empty()).then(|| Value::Object(tree.clone()));
        };
        let mut node = tree.get(first)?;
        for segment in segments {
            node = node.as_object()?.get(segment)?;
        }
        Some(node.clone())
    }

    fn write(&self, path: &DocPath, value: Value) -> anyhow::Result<()> {
        let (last, parents) = path
            .segments()
            .split_last()
            .ok_or_else(|| anyhow!("cannot write the root document"))?;
        let mut tree = self.tree.lock();
        if value.is_null() {
            remove_at(&mut tree, parents, last);
        } else {
            let mut node = &mut *tree;
            for segment in parents {
                let child = node
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                node = child
                    .as_object_mut()
                    .ok_or_else(|| anyhow!("document at {segment} is not a collection"))?;
            }
            node.insert(last.clone(), value);
        }
        Ok(())
    }
}

/// Removes `last` under `parents` and prunes collections left empty.
fn remove_at(node: &mut Map<String, Value>, parents: &[String], last: &str) {
    match parents.split_first() {
        None => {
            node.remove(last);
        }
        Some((head, rest)) => {
            let now_empty = match node.get_mut(head).and_then(Value::as_object_mut) {
                Some(child) => {
                    remove_at(child, rest, last);
                    child.is_empty()
                }
                None => false,
            };
            if now_empty {
                node.remove(head);
            }
        }
    }
}

impl DocumentBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn get(&self, path: &DocPath) -> anyhow::Result<Option<Value>> {
        Ok(self.inner.read(path))
    }

    #[tracing::instrument(skip(self, value), fields(path = %path))]
    fn set(&self, path: &DocPath, value: Value) -> anyhow::Result<()> {
        self.inner.write(path, value)?;

        let mut watchers = self.inner.watchers.lock();
        for watcher in watchers.iter_mut() {
            if watcher.path.overlaps(path) {
                trace!(watcher = watcher.id, watched = %watcher.path, "notifying watcher");
                let current = self.inner.read(&watcher.path);
                (watcher.callback)(current);
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, callback), fields(path = %path))]
    fn watch(&self, path: &DocPath, mut callback: WatchCallback) -> anyhow::Result<Unsubscribe> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            // Holding the watcher list keeps a concurrent write from slipping
            // between the first snapshot and registration.
            let mut watchers = self.inner.watchers.lock();
            callback(self.inner.read(path));
            watchers.push(Watcher {
                id,
                path: path.clone(),
                callback,
            });
        }
        debug!(watcher = id, "registered watcher");

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.watchers.lock().retain(|watcher| watcher.id != id);
                debug!(watcher = id, "removed watcher");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use serde_json::{Value, json};

    use super::MemoryBackend;
    use crate::backend::{DocPath, DocumentBackend};

    #[test]
    fn removing_last_child_prunes_collection() {
        let backend = MemoryBackend::new();
        let doc = DocPath::parse("users/u1/months/2024-01").expect("path");
        backend.set(&doc, json!({ "goals": ["read"] })).expect("write");
        assert!(backend.get(&DocPath::parse("users").expect("path")).expect("get").is_some());

        backend.set(&doc, Value::Null).expect("remove");
        assert_eq!(backend.get(&DocPath::parse("users").expect("path")).expect("get"), None);
        assert_eq!(backend.get(&DocPath::root()).expect("get"), None);
    }

    #[test]
    fn watchers_see_writes_below_and_above() {
        let backend = MemoryBackend::new();
        let days = DocPath::parse("users/u1/days").expect("path");
        let (tx, rx) = mpsc::channel();
        let mut handle = backend
            .watch(
                &days,
                Box::new(move |value| {
                    let _ = tx.send(value);
                }),
            )
            .expect("watch");
        assert_eq!(rx.try_recv().expect("initial"), None);

        backend
            .set(&days.child("2024-01-01").expect("child"), json!({ "note": "x" }))
            .expect("write");
        assert_eq!(
            rx.try_recv().expect("change"),
            Some(json!({ "2024-01-01": { "note": "x" } }))
        );

        backend
            .set(&DocPath::parse("users/u1/weeks/2024-01-01").expect("path"), json!({}))
            .expect("unrelated write");
        assert!(rx.try_recv().is_err());

        handle.call();
        assert_eq!(backend.watcher_count(), 0);
        backend
            .set(&days.child("2024-01-02").expect("child"), json!({ "note": "y" }))
            .expect("write");
        assert!(rx.try_recv().is_err());
    }
}
