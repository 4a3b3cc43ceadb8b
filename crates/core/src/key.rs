//! Queue keys derived from object identity (`namespace/name` or `name`).

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Delta, MetaAccessor};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
    #[error("full listing has no single key")]
    Listing,
}

/// String identity of an object within its kind; the only unit of queuing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn into_string(self) -> String { self.0 }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str { &self.0 }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for Key {
    fn from(s: String) -> Self { Self(s) }
}

/// `namespace/name` for namespaced objects, `name` otherwise.
pub fn meta_namespace_key<O: MetaAccessor + ?Sized>(obj: &O) -> Result<Key, KeyError> {
    let name = obj.name();
    if name.is_empty() {
        return Err(KeyError::MissingName);
    }
    match obj.namespace().filter(|ns| !ns.is_empty()) {
        Some(ns) => Ok(Key(format!("{}/{}", ns, name))),
        None => Ok(Key(name.to_string())),
    }
}

/// Key for a delete notification; tombstones already carry the key of the vanished object.
pub fn deletion_handling_key<O: MetaAccessor>(delta: &Delta<O>) -> Result<Key, KeyError> {
    match delta {
        Delta::Tombstone { key, .. } => Ok(key.clone()),
        Delta::Applied(o) | Delta::Deleted(o) => meta_namespace_key(o),
        Delta::Restarted(_) => Err(KeyError::Listing),
    }
}

/// Inverse of [`meta_namespace_key`]: `(namespace, name)`.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok((None, name)),
        (Some(ns), Some(name), None) if !name.is_empty() => Ok((Some(ns).filter(|s| !s.is_empty()), name)),
        _ => Err(KeyError::Malformed(key.to_string())),
    }
}
