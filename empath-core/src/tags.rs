//! The per-message tag store: a string-to-string map queried by matchers
//! and mutated by the evaluator and by actions, serialized as an opaque
//! byte buffer for IPC transport (§3, §6).

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A message's tag store. Cheap to clone so a `dctx` can carry a snapshot
/// across the privilege boundary without holding a borrow on the `mctx`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStore(AHashMap<String, String>);

impl TagStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Add or replace a tag. A key is never added unless it is non-empty —
    /// callers (the tagging step in §4.1) are expected to check this
    /// themselves so the skip is observable, but this is the last line of
    /// defense against an accidental empty-key tag.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if key.is_empty() {
            return;
        }
        self.0.insert(key, value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode for IPC transport. Never produces an empty buffer for a
    /// non-empty store, and an empty store still encodes to a recognisable
    /// non-zero-length buffer so the receiver can distinguish "empty tags"
    /// from "missing payload" (§6).
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails (it does not, barring an
    /// allocation failure, but the caller treats this the same as any
    /// other matcher/action error per §7).
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        bincode::serde::encode_to_vec(&self.0, bincode::config::legacy())
            .map_err(CoreError::TagEncode)
    }

    /// Decode a buffer produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TagDecode`] if the buffer is malformed.
    pub fn decode(buf: &[u8]) -> Result<Self, CoreError> {
        let (map, _): (AHashMap<String, String>, _) =
            bincode::serde::decode_from_slice(buf, bincode::config::legacy())
                .map_err(CoreError::TagDecode)?;
        Ok(Self(map))
    }

    /// Replace this store's contents wholesale, e.g. after an IPC reply
    /// carries the parent's mutated tags (§4.1 blocked path, §4.4).
    pub fn replace(&mut self, other: Self) {
        self.0 = other.0;
    }
}
