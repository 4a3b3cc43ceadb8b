//! kwork core types: watched objects, keys and change notifications

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod key;

pub use key::{deletion_handling_key, meta_namespace_key, split_meta_namespace_key, Key, KeyError};

/// Uniform metadata capability every watched object exposes.
///
/// The engine only ever reads objects through this trait; anything kind-specific lives in
/// the sync handler.
pub trait MetaAccessor: Send + Sync + 'static {
    fn kind(&self) -> &str;
    fn api_version(&self) -> &str;
    fn name(&self) -> &str;
    /// `None` (or empty) for cluster-scoped objects.
    fn namespace(&self) -> Option<&str>;
    fn labels(&self) -> &BTreeMap<String, String>;
    /// Store-assigned version token, when the transport carries one.
    fn resource_version(&self) -> Option<&str> {
        None
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels().get(key).map(String::as_str)
    }
}

/// Owned copy of a remote object with its metadata lifted out of the raw payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Object {
    pub kind: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Raw object (managed fields stripped)
    pub raw: serde_json::Value,
}

impl Object {
    pub fn new(kind: impl Into<String>, api_version: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            api_version: api_version.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.resource_version = Some(rv.into());
        self
    }
}

impl MetaAccessor for Object {
    fn kind(&self) -> &str { &self.kind }
    fn api_version(&self) -> &str { &self.api_version }
    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    fn labels(&self) -> &BTreeMap<String, String> { &self.labels }
    fn resource_version(&self) -> Option<&str> { self.resource_version.as_deref() }
}

/// A single notification from the list/watch transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<O> {
    /// Object added or updated
    Applied(O),
    /// Object deleted; the final state is known
    Deleted(O),
    /// Object deleted but only partial identity survived (e.g. missed while disconnected)
    Tombstone { key: Key, last_known: Option<O> },
    /// Full listing of the collection: the initial list, or a relist after a watch restart
    Restarted(Vec<O>),
}

/// Receiver of keys emitted by change detection. Implemented by the work queue.
pub trait KeySink: Send + Sync {
    fn add(&self, key: Key);
}

pub mod prelude {
    pub use super::{Delta, Key, KeyError, KeySink, MetaAccessor, Object};
}
