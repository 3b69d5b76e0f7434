// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The process-local handle table.
//!
//! Handles are opaque monotonically allocated integers, never reused within
//! a context's lifetime, and invalidated immediately on release. Resolution
//! of anything not currently in the table - including the all-ones sentinel
//! some callers pass - fails with `InvalidHandle`.

use crate::error::TssError;
use crate::error::TssResult;
use crate::object::Object;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

// Handles are allocated process-wide so a handle leaked into another
// context can never alias that context's own objects - it simply fails to
// resolve there. The base keeps raw values visibly distinct from
// TPM-resident handles in traces.
static NEXT_HANDLE: AtomicU32 = AtomicU32::new(0x0010_0001);

/// An opaque reference to an object owned by a [`crate::Context`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The raw integer value. Only useful for diagnostics.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstruct a handle from its raw value. Resolution of a value that
    /// was never allocated (or already released) fails; this cannot be used
    /// to forge access.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

pub(crate) struct HandleTable {
    entries: HashMap<u32, Object>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, object: Object) -> Handle {
        let raw = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(raw, object);
        Handle(raw)
    }

    pub fn get(&self, handle: Handle) -> TssResult<&Object> {
        self.entries
            .get(&handle.0)
            .ok_or(TssError::InvalidHandle(handle.0))
    }

    pub fn get_mut(&mut self, handle: Handle) -> TssResult<&mut Object> {
        self.entries
            .get_mut(&handle.0)
            .ok_or(TssError::InvalidHandle(handle.0))
    }

    pub fn remove(&mut self, handle: Handle) -> TssResult<Object> {
        self.entries
            .remove(&handle.0)
            .ok_or(TssError::InvalidHandle(handle.0))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    /// Release every object at once. Used at context close; handles
    /// already released individually are simply absent, which is fine.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Object)> {
        self.entries.iter().map(|(raw, obj)| (Handle(*raw), obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HashAlg;
    use crate::object::HashObject;

    fn hash_object() -> Object {
        Object::Hash(HashObject {
            alg: HashAlg::Sha1,
            value: None,
        })
    }

    #[test]
    fn test_handles_are_never_reused() {
        let mut table = HandleTable::new();
        let first = table.insert(hash_object());
        table.remove(first).unwrap();
        let second = table.insert(hash_object());
        assert_ne!(first, second);
    }

    #[test]
    fn test_released_handle_does_not_resolve() {
        let mut table = HandleTable::new();
        let handle = table.insert(hash_object());
        assert!(table.get(handle).is_ok());

        table.remove(handle).unwrap();
        assert!(matches!(
            table.get(handle),
            Err(TssError::InvalidHandle(_))
        ));
        // A second release is itself an invalid-handle error.
        assert!(matches!(
            table.remove(handle),
            Err(TssError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_sentinel_never_resolves() {
        let table = HandleTable::new();
        assert!(matches!(
            table.get(Handle::from_raw(0xffff_ffff)),
            Err(TssError::InvalidHandle(0xffff_ffff))
        ));
    }
}
