//! Caller supplied call metadata
//!
//! [`Metadata`] is the multi-valued key/value context a client attaches to a
//! call. [`extract`] flattens it, together with the peer address, into the
//! mapping that goes into call records.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::CallContext;

/// Key under which [`extract`] reports the address of the peer.
pub const PEER_ADDRESS: &str = "peer_address";

/// Multi-valued call metadata.
///
/// Keys are normalized to lower case. Values for a key keep the order in which
/// they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value for a key, keeping any values already present.
    pub fn append(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .entry(key.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace all values of a key with a single value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(key.as_ref().to_ascii_lowercase(), vec![value.into()]);
    }

    /// The first value of a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// All values of a key, in insertion order
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over keys and all their values
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut res = Metadata::new();
        res.extend(iter);
        res
    }
}

impl<K: AsRef<str>, V: Into<String>> Extend<(K, V)> for Metadata {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.append(k, v);
        }
    }
}

/// Flatten the metadata of a call into a single valued map.
///
/// Each key keeps only its first value. If the peer of the call is known, it
/// is added under [`PEER_ADDRESS`], replacing a caller supplied value for that key.
pub fn extract(ctx: &CallContext) -> BTreeMap<String, String> {
    let mut res: BTreeMap<String, String> = ctx
        .metadata()
        .iter()
        .filter_map(|(k, values)| values.first().map(|v| (k.to_owned(), v.clone())))
        .collect();
    if let Some(peer) = ctx.peer() {
        res.insert(PEER_ADDRESS.to_owned(), peer.to_string());
    }
    res
}
