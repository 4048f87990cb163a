//! Pod event source that also sees objects still pending initialization.

use std::fmt;

use kube_core::Resource;

use crate::pod::InitializablePod;

pub mod decode;
pub mod objects;
pub use objects::{objects, RESYNC_PERIOD};

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        let meta = resource.meta();
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// What happened to an object, as classified against the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// First sighting of the object.
    Created,
    /// A later version of a known object.
    Updated,
    /// The object was deleted or vanished from a relist.
    Deleted,
    /// Periodic replay of a cached object.
    Resync,
}

/// Event for a single pod.
pub type PodEvent = Event<QualifiedName, InitializablePod>;

#[derive(Debug, Clone)]
pub struct Event<Key, Entry> {
    pub key: Key,
    pub entry: Entry,
    pub kind: EventKind,
}

impl<K: Resource> Event<QualifiedName, K> {
    pub fn new(kind: EventKind, entry: K) -> Self {
        Self {
            key: QualifiedName::from_resource(&entry),
            entry,
            kind,
        }
    }
}

/// Errors produced by the pod event source.
///
/// None of them end the stream: the source relists and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot build {verb} request: {source}")]
    Request {
        verb: &'static str,
        #[source]
        source: kube_core::request::Error,
    },
    #[error("cannot add includeUninitialized to {uri}: {source}")]
    Uri {
        uri: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("list failed: {0}")]
    List(#[source] kube_client::Error),
    #[error("watch failed: {0}")]
    Watch(#[source] kube_client::Error),
    #[error("watch ended with server error {} ({}): {}", .0.code, .0.reason, .0.message)]
    WatchStatus(kube_core::ErrorResponse),
    #[error(transparent)]
    Decode(#[from] decode::Error),
}
