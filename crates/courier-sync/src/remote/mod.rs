//! The realtime backend seen as a JSON tree addressed by `/`-separated
//! paths.  The concrete wire protocol lives behind [`RemoteStore`].

mod memory;

pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::RemoteError;
use crate::subscription::Subscription;

/// The value at a path at one point in time.  `None` means nothing is
/// stored there.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: String,
    pub value: Option<Value>,
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.value
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    /// Decode every child of a collection, skipping children that do not
    /// decode.
    pub fn decode_children<T: DeserializeOwned>(&self) -> Vec<T> {
        let Some(Value::Object(children)) = &self.value else {
            return Vec::new();
        };
        children
            .iter()
            .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::warn!(path = %self.path, child = %key, error = %e, "skipping undecodable remote record");
                    None
                }
            })
            .collect()
    }
}

/// Server-side child filter for collection subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    FieldEquals { field: String, value: Value },
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn matches(&self, child: &Value) -> bool {
        match self {
            Self::FieldEquals { field, value } => child.get(field) == Some(value),
            Self::ArrayContains { field, value } => child
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }

    /// Keep only the children of a collection value that match.
    pub fn apply(&self, value: Option<Value>) -> Option<Value> {
        match value {
            Some(Value::Object(children)) => Some(Value::Object(
                children
                    .into_iter()
                    .filter(|(_, child)| self.matches(child))
                    .collect(),
            )),
            Some(_) | None => None,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current value at `path`, then every change to it.  Cancel the
    /// subscription to release the listener.
    fn subscribe(&self, path: &str, filter: Option<Filter>) -> Subscription<Snapshot>;

    async fn get_once(&self, path: &str) -> Result<Snapshot, RemoteError>;

    /// Replace the value at `path`.  `Value::Null` deletes it.
    async fn set(&self, path: &str, value: Value) -> Result<(), RemoteError>;

    /// Set several fields below `path` at once.  Keys may themselves be
    /// nested paths (`"unread/u1"`).
    async fn update_fields(&self, path: &str, fields: Map<String, Value>) -> Result<(), RemoteError>;
}

/// Join path segments with `/`.
pub fn join(segments: &[&str]) -> String {
    segments.join("/")
}

pub(crate) fn split_path(path: &str) -> Result<Vec<String>, RemoteError> {
    let segments: Vec<String> = path.split('/').map(str::to_string).collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(RemoteError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}
