// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The persistent key registry.
//!
//! Registered key blobs are keyed by `(scope, uuid)`. The registry is
//! process-external by contract: another process may register or delete
//! keys at any time, so `Duplicate` and absent entries are expected
//! outcomes, not invariant violations. The file-backed store re-reads the
//! scope file on every operation and rewrites it atomically.

use crate::error::TssError;
use crate::error::TssResult;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tpm12_proto::Tpm12Uuid;

/// A persistent-storage scope selector, carried as the raw flag word so
/// invalid bitmasks (e.g. both scopes OR'd together) can be observed and
/// rejected rather than made unrepresentable and silently coerced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PsType(u32);

impl PsType {
    /// The system-wide persistent store.
    pub const SYSTEM: PsType = PsType(1);
    /// The per-user persistent store.
    pub const USER: PsType = PsType(2);

    /// Wrap a raw flag word; validated at the point of use.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw flag word.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Validate the flag word into a scope. Anything but exactly one valid
    /// scope bit is a caller error.
    pub(crate) fn validate(self) -> TssResult<Scope> {
        match self {
            PsType::SYSTEM => Ok(Scope::System),
            PsType::USER => Ok(Scope::User),
            _ => Err(TssError::BadParameter(
                "persistent storage scope must be exactly System or User",
            )),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Scope {
    System,
    User,
}

impl Scope {
    fn file_name(self) -> &'static str {
        match self {
            Scope::System => "system.json",
            Scope::User => "user.json",
        }
    }
}

/// One registered key: the wrapped blob plus the parent reference needed to
/// resolve the load chain.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// The serialized wrapped-key structure.
    pub blob: Vec<u8>,
    /// Scope of the parent key's registration.
    pub parent_ps_type: PsType,
    /// UUID of the parent key's registration.
    pub parent_uuid: Tpm12Uuid,
}

/// Outcome of a `put`: a fresh insert or a tolerated duplicate. A duplicate
/// leaves the existing entry untouched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Fresh,
    Duplicate,
}

/// Storage-layer failures, distinct from the protocol taxonomy.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry i/o failure")]
    Io(#[from] std::io::Error),
    #[error("registry file is malformed")]
    Malformed(#[source] serde_json::Error),
}

/// The persistent key registry interface consumed by the stack.
pub trait KeyRegistry: Send {
    /// Insert an entry, reporting a duplicate distinctly (and harmlessly).
    fn put(
        &mut self,
        scope: PsType,
        uuid: Tpm12Uuid,
        entry: RegistryEntry,
    ) -> Result<PutOutcome, RegistryError>;

    /// Look up an entry.
    fn get(
        &self,
        scope: PsType,
        uuid: Tpm12Uuid,
    ) -> Result<Option<RegistryEntry>, RegistryError>;

    /// Delete an entry, returning whether it existed.
    fn delete(&mut self, scope: PsType, uuid: Tpm12Uuid) -> Result<bool, RegistryError>;
}

/// A purely in-memory registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: HashMap<(u32, [u8; 16]), RegistryEntry>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyRegistry for InMemoryRegistry {
    fn put(
        &mut self,
        scope: PsType,
        uuid: Tpm12Uuid,
        entry: RegistryEntry,
    ) -> Result<PutOutcome, RegistryError> {
        let key = (scope.raw(), uuid.to_bytes());
        if self.entries.contains_key(&key) {
            return Ok(PutOutcome::Duplicate);
        }
        self.entries.insert(key, entry);
        Ok(PutOutcome::Fresh)
    }

    fn get(
        &self,
        scope: PsType,
        uuid: Tpm12Uuid,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.entries.get(&(scope.raw(), uuid.to_bytes())).cloned())
    }

    fn delete(&mut self, scope: PsType, uuid: Tpm12Uuid) -> Result<bool, RegistryError> {
        Ok(self
            .entries
            .remove(&(scope.raw(), uuid.to_bytes()))
            .is_some())
    }
}

// The on-disk shape: one JSON document per scope, blobs base64, uuids as
// bare hex strings.
#[derive(Serialize, Deserialize, Default)]
struct ScopeFile {
    keys: BTreeMap<String, StoredEntry>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    blob: String,
    parent_ps_type: u32,
    parent_uuid: String,
}

/// A registry persisted as one JSON file per scope under a root directory.
///
/// Every operation re-reads the file, so concurrent mutation by other
/// processes shows up as ordinary `Duplicate`/absent outcomes. Rewrites go
/// through a temp file and an atomic rename.
pub struct FileKeyRegistry {
    root: PathBuf,
}

impl FileKeyRegistry {
    /// Open (creating if needed) a registry rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();
        fs_err::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn scope_path(&self, scope: Scope) -> PathBuf {
        self.root.join(scope.file_name())
    }

    fn read_scope(&self, scope: Scope) -> Result<ScopeFile, RegistryError> {
        let path = self.scope_path(scope);
        match fs_err::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(RegistryError::Malformed),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ScopeFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_scope(&self, scope: Scope, file: &ScopeFile) -> Result<(), RegistryError> {
        let serialized =
            serde_json::to_vec_pretty(file).map_err(RegistryError::Malformed)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        std::io::Write::write_all(&mut tmp.as_file(), &serialized)?;
        tmp.persist(self.scope_path(scope))
            .map_err(|err| RegistryError::Io(err.error))?;
        Ok(())
    }

    fn validate(scope: PsType) -> Result<Scope, RegistryError> {
        // The stack validates before calling in; a raw trait-level caller
        // gets an io-flavored rejection instead of a panic.
        scope.validate().map_err(|_| {
            RegistryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid persistent storage scope",
            ))
        })
    }
}

impl KeyRegistry for FileKeyRegistry {
    fn put(
        &mut self,
        scope: PsType,
        uuid: Tpm12Uuid,
        entry: RegistryEntry,
    ) -> Result<PutOutcome, RegistryError> {
        let scope = Self::validate(scope)?;
        let mut file = self.read_scope(scope)?;
        let key = uuid_hex(&uuid);
        if file.keys.contains_key(&key) {
            return Ok(PutOutcome::Duplicate);
        }
        file.keys.insert(
            key,
            StoredEntry {
                blob: BASE64.encode(&entry.blob),
                parent_ps_type: entry.parent_ps_type.raw(),
                parent_uuid: uuid_hex(&entry.parent_uuid),
            },
        );
        self.write_scope(scope, &file)?;
        Ok(PutOutcome::Fresh)
    }

    fn get(
        &self,
        scope: PsType,
        uuid: Tpm12Uuid,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let scope = Self::validate(scope)?;
        let file = self.read_scope(scope)?;
        let Some(stored) = file.keys.get(&uuid_hex(&uuid)) else {
            return Ok(None);
        };

        let malformed = |_| {
            RegistryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "undecodable registry entry",
            ))
        };
        let blob = BASE64.decode(&stored.blob).map_err(malformed)?;
        let parent_uuid = uuid_from_hex(&stored.parent_uuid).ok_or_else(|| {
            RegistryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "undecodable parent uuid",
            ))
        })?;

        Ok(Some(RegistryEntry {
            blob,
            parent_ps_type: PsType::from_raw(stored.parent_ps_type),
            parent_uuid,
        }))
    }

    fn delete(&mut self, scope: PsType, uuid: Tpm12Uuid) -> Result<bool, RegistryError> {
        let scope = Self::validate(scope)?;
        let mut file = self.read_scope(scope)?;
        let existed = file.keys.remove(&uuid_hex(&uuid)).is_some();
        if existed {
            self.write_scope(scope, &file)?;
        }
        Ok(existed)
    }
}

fn uuid_hex(uuid: &Tpm12Uuid) -> String {
    let mut out = String::with_capacity(32);
    for b in uuid.to_bytes() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn uuid_from_hex(hex: &str) -> Option<Tpm12Uuid> {
    if hex.len() != 32 || !hex.is_ascii() {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        bytes[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(Tpm12Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(tail: u8) -> Tpm12Uuid {
        Tpm12Uuid::new(1, 2, 3, 4, 5, [6, 7, 8, 9, 10, tail])
    }

    fn entry(data: &[u8]) -> RegistryEntry {
        RegistryEntry {
            blob: data.to_vec(),
            parent_ps_type: PsType::SYSTEM,
            parent_uuid: tpm12_proto::SRK_UUID,
        }
    }

    #[test]
    fn test_ps_type_validation() {
        assert!(PsType::SYSTEM.validate().is_ok());
        assert!(PsType::USER.validate().is_ok());
        // The two flags OR'd together are not a scope.
        let both = PsType::from_raw(PsType::SYSTEM.raw() | PsType::USER.raw());
        assert!(matches!(both.validate(), Err(TssError::BadParameter(_))));
        assert!(matches!(
            PsType::from_raw(0).validate(),
            Err(TssError::BadParameter(_))
        ));
    }

    #[test]
    fn test_in_memory_round_trip() {
        let mut reg = InMemoryRegistry::new();
        assert_eq!(
            reg.put(PsType::USER, uuid(1), entry(b"blob")).unwrap(),
            PutOutcome::Fresh
        );
        // Duplicate put is reported, not fatal, and does not clobber.
        assert_eq!(
            reg.put(PsType::USER, uuid(1), entry(b"other")).unwrap(),
            PutOutcome::Duplicate
        );
        assert_eq!(reg.get(PsType::USER, uuid(1)).unwrap().unwrap().blob, b"blob");

        // Scopes are independent namespaces.
        assert!(reg.get(PsType::SYSTEM, uuid(1)).unwrap().is_none());

        assert!(reg.delete(PsType::USER, uuid(1)).unwrap());
        assert!(!reg.delete(PsType::USER, uuid(1)).unwrap());
    }

    #[test]
    fn test_file_registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = FileKeyRegistry::new(dir.path()).unwrap();

        assert_eq!(
            reg.put(PsType::SYSTEM, uuid(2), entry(&[1, 2, 3])).unwrap(),
            PutOutcome::Fresh
        );
        assert_eq!(
            reg.put(PsType::SYSTEM, uuid(2), entry(&[9])).unwrap(),
            PutOutcome::Duplicate
        );

        // A second instance over the same directory sees the entry.
        let reg2 = FileKeyRegistry::new(dir.path()).unwrap();
        let found = reg2.get(PsType::SYSTEM, uuid(2)).unwrap().unwrap();
        assert_eq!(found.blob, vec![1, 2, 3]);
        assert_eq!(found.parent_uuid, tpm12_proto::SRK_UUID);

        assert!(reg.delete(PsType::SYSTEM, uuid(2)).unwrap());
        assert!(reg2.get(PsType::SYSTEM, uuid(2)).unwrap().is_none());
    }

    #[test]
    fn test_uuid_hex_round_trip() {
        let u = uuid(0xAB);
        assert_eq!(uuid_from_hex(&uuid_hex(&u)), Some(u));
        assert!(uuid_from_hex("xyz").is_none());
    }
}
