//! In-process realtime backend.
//!
//! Keeps the whole tree in memory and pushes a fresh [`Snapshot`] to every
//! listener whose path overlaps a write.  Reachability, injected write
//! failures and artificial latency make it usable for exercising the
//! offline paths deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{split_path, Filter, RemoteStore, Snapshot};
use crate::error::RemoteError;
use crate::subscription::Subscription;

struct Listener {
    path: Vec<String>,
    filter: Option<Filter>,
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl Listener {
    fn snapshot(&self, root: &Value) -> Snapshot {
        let value = read_at(root, &self.path).cloned();
        let value = match &self.filter {
            Some(filter) => filter.apply(value),
            None => value,
        };
        Snapshot {
            path: self.path.join("/"),
            value,
        }
    }
}

struct Inner {
    root: Value,
    listeners: HashMap<u64, Listener>,
    next_listener: u64,
    reachable: bool,
    failing_writes: u32,
    latency: Duration,
    writes: usize,
}

/// Shared handle; clones see the same tree.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root: Value::Object(Map::new()),
                listeners: HashMap::new(),
                next_listener: 0,
                reachable: true,
                failing_writes: 0,
                latency: Duration::ZERO,
                writes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge every other handle.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// While unreachable every read and write fails with
    /// [`RemoteError::Unavailable`].  Subscriptions stay open.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().failing_writes = n;
    }

    /// Delay added to every read and write.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Read a value directly, bypassing reachability and latency.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        let segments = split_path(path).ok()?;
        read_at(&self.lock().root, &segments).cloned()
    }

    /// Write a value directly, bypassing reachability, latency and the
    /// write counter.  Listeners are still notified.
    pub fn seed(&self, path: &str, value: Value) -> Result<(), RemoteError> {
        let segments = split_path(path)?;
        let mut inner = self.lock();
        write_at(&mut inner.root, &segments, value);
        notify(&mut inner, &segments);
        Ok(())
    }

    async fn round_trip(&self) -> Result<(), RemoteError> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.lock().reachable {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("remote store unreachable".to_string()))
        }
    }

    fn apply_write(&self, writes: Vec<(Vec<String>, Value)>) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(RemoteError::Unavailable("injected write failure".to_string()));
        }
        for (segments, value) in &writes {
            write_at(&mut inner.root, segments, value.clone());
        }
        inner.writes += 1;
        for (segments, _) in &writes {
            notify(&mut inner, segments);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn subscribe(&self, path: &str, filter: Option<Filter>) -> Subscription<Snapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let segments = match split_path(path) {
            Ok(segments) => segments,
            Err(e) => {
                tracing::warn!(path, error = %e, "subscription to invalid path");
                return Subscription::with_cancel(rx, || {});
            }
        };

        let listener = Listener {
            path: segments,
            filter,
            tx,
        };
        let mut inner = self.lock();
        let _ = listener.tx.send(listener.snapshot(&inner.root));
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.insert(id, listener);
        drop(inner);

        let store = self.clone();
        Subscription::with_cancel(rx, move || {
            store.lock().listeners.remove(&id);
        })
    }

    async fn get_once(&self, path: &str) -> Result<Snapshot, RemoteError> {
        let segments = split_path(path)?;
        self.round_trip().await?;
        let value = read_at(&self.lock().root, &segments).cloned();
        Ok(Snapshot {
            path: path.to_string(),
            value,
        })
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), RemoteError> {
        let segments = split_path(path)?;
        self.round_trip().await?;
        self.apply_write(vec![(segments, value)])
    }

    async fn update_fields(&self, path: &str, fields: Map<String, Value>) -> Result<(), RemoteError> {
        let base = split_path(path)?;
        let mut writes = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let mut segments = base.clone();
            segments.extend(split_path(&key)?);
            writes.push((segments, value));
        }
        self.round_trip().await?;
        self.apply_write(writes)
    }
}

fn read_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

// Null deletes; objects left empty by a delete are removed too.
fn write_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };

    if rest.is_empty() {
        if value.is_null() {
            map.remove(first);
        } else {
            map.insert(first.clone(), value);
        }
        return;
    }
    if value.is_null() && !map.contains_key(first) {
        return;
    }

    let child = map
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    write_at(child, rest, value);
    if child.as_object().is_some_and(Map::is_empty) {
        map.remove(first);
    }
}

fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b).all(|(x, y)| x == y)
}

fn notify(inner: &mut Inner, changed: &[String]) {
    let root = &inner.root;
    inner.listeners.retain(|_, listener| {
        if !overlaps(&listener.path, changed) {
            return true;
        }
        listener.tx.send(listener.snapshot(root)).is_ok()
    });
}
