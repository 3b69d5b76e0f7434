// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The key hierarchy manager.
//!
//! Keys form a DAG rooted at the authority-resident Storage Root Key:
//! creating a key wraps it under a loaded parent, and the resulting blob is
//! meaningless anywhere that parent is absent. Registered keys resolve by
//! `(scope, uuid)` through the persistent registry, with parents resolved
//! recursively the same way.

use crate::auth::fresh_nonce;
use crate::auth::sha1;
use crate::auth::xor_mask;
use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::handle::Handle;
use crate::object::KeyObject;
use crate::object::Object;
use crate::object::ParentRef;
use crate::object::PolicyKind;
use crate::policy::WELL_KNOWN_SECRET;
use crate::registry::PsType;
use crate::registry::RegistryEntry;
use tpm12_proto::AuthDataUsage;
use tpm12_proto::CreateWrapKeyParams;
use tpm12_proto::EncScheme;
use tpm12_proto::EntityType;
use tpm12_proto::FlushSpecificParams;
use tpm12_proto::Key12;
use tpm12_proto::KeyFlags;
use tpm12_proto::KeyParms;
use tpm12_proto::KeyUsage;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::Reader;
use tpm12_proto::ResourceType;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::SRK_UUID;
use tpm12_proto::SigScheme;
use tpm12_proto::SizedBuffer;
use tpm12_proto::TPM12_KH_SRK;
use tpm12_proto::Tpm12Uuid;
use zerocopy::IntoBytes;

// Parent chains in the registry are expected to be shallow; anything past
// this is a corrupt (cyclic) store.
const MAX_PARENT_DEPTH: u32 = 16;

impl Context {
    /// Create (wrap) a key under a loaded parent. The parent authorizes the
    /// operation through an OSAP session whose shared secret also protects
    /// the new key's secrets in transit. After this call the wrap
    /// relationship and the key's init-time attributes are frozen.
    pub fn create_key(&mut self, key: Handle, parent: Handle) -> TssResult<()> {
        let key_obj = self.objects.get(key)?.as_key()?;
        if key_obj.is_created() {
            return Err(TssError::BadParameter("key is already created"));
        }
        let usage = key_obj.usage;
        let size_bits = key_obj.size_bits;
        let migratable = key_obj.migratable;
        let volatile = key_obj.volatile;
        let auth_required = key_obj.auth_required;
        let enc_scheme = key_obj.enc_scheme;
        let sig_scheme = key_obj.sig_scheme;
        let usage_policy = key_obj.usage_policy;

        let parent_obj = self.objects.get(parent)?.as_key()?;
        let parent_tpm = parent_obj
            .tpm_handle
            .ok_or(TssError::BadParameter("parent key is not loaded"))?;
        let parent_secret = self.usage_secret(parent)?;

        // The new key's secrets. A key that requires authorization must
        // have a usage secret reachable before it can be wrapped; a
        // migratable key likewise needs its migration secret.
        let new_usage_secret = match self.reachable_secret(usage_policy)? {
            Some(secret) => secret,
            None if !auth_required => WELL_KNOWN_SECRET,
            None => {
                return Err(TssError::BadParameter(
                    "the key requires authorization but no usage secret is set",
                ));
            }
        };
        let new_migration_secret = if migratable {
            self.migration_secret(key)?
        } else {
            WELL_KNOWN_SECRET
        };

        let template = key_template(
            usage,
            size_bits,
            migratable,
            volatile,
            auth_required,
            enc_scheme,
            sig_scheme,
        )?;

        let osap = self.start_osap(EntityType::KeyHandle, parent_tpm, &parent_secret)?;
        let nonce_odd = fresh_nonce();

        // ADIP: the secrets travel XOR-encrypted under digests of the OSAP
        // shared secret and the session nonces.
        let mut data_usage_auth = new_usage_secret;
        xor_mask(
            &mut data_usage_auth,
            &sha1(&[&osap.shared_secret, &osap.nonce_even]),
        );
        let mut data_migration_auth = new_migration_secret;
        xor_mask(
            &mut data_migration_auth,
            &sha1(&[&osap.shared_secret, &nonce_odd]),
        );

        let params = CreateWrapKeyParams {
            data_usage_auth,
            data_migration_auth,
            key_info: template,
        }
        .serialize();

        let out = self.osap_call(
            OrdinalEnum::CreateWrapKey,
            &[parent_tpm],
            &params,
            &osap,
            nonce_odd,
        )?;
        let wrapped = Key12::from_blob(&out)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;

        let key_obj = self.objects.get_mut(key)?.as_key_mut()?;
        key_obj.blob = Some(wrapped);
        key_obj.parent = Some(ParentRef::Live(parent));
        Ok(())
    }

    /// Load a created key into the authority under its (loaded) parent.
    pub fn load_key(&mut self, key: Handle, parent: Handle) -> TssResult<()> {
        let key_obj = self.objects.get(key)?.as_key()?;
        let blob = key_obj
            .blob
            .as_ref()
            .ok_or(TssError::BadParameter("key has not been created"))?
            .serialize();

        let parent_obj = self.objects.get(parent)?.as_key()?;
        let parent_tpm = parent_obj
            .tpm_handle
            .ok_or(TssError::BadParameter("parent key is not loaded"))?;
        let parent_secret = self.usage_secret(parent)?;

        let out = self.authorized_call(
            OrdinalEnum::LoadKey2,
            &[parent_tpm],
            &blob,
            parent,
            &parent_secret,
        )?;
        let tpm_handle: [u8; 4] = out[..]
            .try_into()
            .map_err(|_| TssError::Protocol(ResponseValidationError::MalformedParameters))?;

        let key_obj = self.objects.get_mut(key)?.as_key_mut()?;
        key_obj.tpm_handle = Some(u32::from_be_bytes(tpm_handle));
        Ok(())
    }

    /// Unload a key from the authority. Only the in-memory loaded state is
    /// affected; persistent registration survives. A handle that resolves
    /// to nothing fails with `InvalidHandle`.
    pub fn unload_key(&mut self, key: Handle) -> TssResult<()> {
        let key_obj = self.objects.get_mut(key)?.as_key_mut()?;
        let Some(tpm_handle) = key_obj.tpm_handle.take() else {
            // Created but never loaded: nothing to do.
            return Ok(());
        };

        if tpm_handle != TPM12_KH_SRK {
            let params = FlushSpecificParams::new(tpm_handle, ResourceType::Key);
            self.plain_call(OrdinalEnum::FlushSpecific, &[], params.as_bytes())?;
        }
        self.drop_session(key);
        Ok(())
    }

    /// The public part of a key: from its blob when present, otherwise
    /// fetched from the authority (the SRK path).
    pub fn get_pub_key(&mut self, key: Handle) -> TssResult<Vec<u8>> {
        let key_obj = self.objects.get(key)?.as_key()?;
        if let Some(blob) = &key_obj.blob {
            return Ok(blob.pub_key.contents().to_vec());
        }

        let tpm_handle = key_obj.tpm_handle.ok_or(TssError::BadParameter(
            "key has neither a blob nor a loaded instance",
        ))?;
        let secret = self.usage_secret(key)?;
        let out = self.authorized_call(OrdinalEnum::GetPubKey, &[tpm_handle], &[], key, &secret)?;

        let mut reader = Reader::new(&out);
        let pub_key = SizedBuffer::deserialize(&mut reader)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        Ok(pub_key.contents().to_vec())
    }

    /// Register a created key in the persistent registry. A duplicate
    /// registration is reported as `KeyAlreadyRegistered` and leaves the
    /// existing entry untouched - callers performing idempotent
    /// registration treat it as success.
    pub fn register_key(
        &mut self,
        key: Handle,
        scope: PsType,
        uuid: Tpm12Uuid,
        parent_scope: PsType,
        parent_uuid: Tpm12Uuid,
    ) -> TssResult<()> {
        scope.validate()?;
        parent_scope.validate()?;

        let blob = self
            .objects
            .get(key)?
            .as_key()?
            .blob
            .as_ref()
            .ok_or(TssError::BadParameter("key has not been created"))?
            .serialize();

        let outcome = self.registry.lock().put(
            scope,
            uuid,
            RegistryEntry {
                blob,
                parent_ps_type: parent_scope,
                parent_uuid,
            },
        )?;
        match outcome {
            crate::registry::PutOutcome::Fresh => Ok(()),
            crate::registry::PutOutcome::Duplicate => {
                tracing::info!(%uuid, "key already registered");
                Err(TssError::KeyAlreadyRegistered)
            }
        }
    }

    /// Remove a key's registration and return a fresh in-memory object
    /// holding its blob. Loaded instances of the key are unaffected.
    pub fn unregister_key(&mut self, scope: PsType, uuid: Tpm12Uuid) -> TssResult<Handle> {
        scope.validate()?;

        let entry = {
            let mut registry = self.registry.lock();
            let entry = registry.get(scope, uuid)?.ok_or(TssError::KeyNotFound)?;
            registry.delete(scope, uuid)?;
            entry
        };

        self.key_object_from_entry(&entry)
    }

    /// Resolve a registered key by UUID and load it, resolving parents
    /// recursively. Loading the same UUID twice yields two independent
    /// handles.
    pub fn load_key_by_uuid(&mut self, scope: PsType, uuid: Tpm12Uuid) -> TssResult<Handle> {
        scope.validate()?;
        self.load_key_by_uuid_at(scope, uuid, 0)
    }

    fn load_key_by_uuid_at(
        &mut self,
        scope: PsType,
        uuid: Tpm12Uuid,
        depth: u32,
    ) -> TssResult<Handle> {
        if depth > MAX_PARENT_DEPTH {
            return Err(TssError::BadParameter(
                "registered key hierarchy is too deep or cyclic",
            ));
        }

        // The SRK is authority-resident: fabricate the object locally.
        if uuid == SRK_UUID {
            let usage_policy = self.insert_policy(PolicyKind::Usage);
            let migration_policy = self.insert_policy(PolicyKind::Migration);
            return Ok(self.objects.insert(Object::Key(KeyObject {
                usage: KeyUsage::Storage,
                size_bits: 2048,
                migratable: false,
                volatile: false,
                auth_required: true,
                enc_scheme: EncScheme::RsaEsOaepSha1Mgf1 as u16,
                sig_scheme: SigScheme::None as u16,
                usage_policy,
                migration_policy,
                blob: None,
                tpm_handle: Some(TPM12_KH_SRK),
                parent: None,
            })));
        }

        let entry = self
            .registry
            .lock()
            .get(scope, uuid)?
            .ok_or(TssError::KeyNotFound)?;

        entry.parent_ps_type.validate()?;
        let parent = self.load_key_by_uuid_at(entry.parent_ps_type, entry.parent_uuid, depth + 1)?;

        let key = self.key_object_from_entry(&entry)?;
        self.load_key(key, parent)?;

        let key_obj = self.objects.get_mut(key)?.as_key_mut()?;
        key_obj.parent = Some(ParentRef::Registered {
            uuid: entry.parent_uuid,
        });
        Ok(key)
    }

    /// Materialize a key object from a registry entry's blob, mirroring the
    /// public attributes stored in the blob.
    fn key_object_from_entry(&mut self, entry: &RegistryEntry) -> TssResult<Handle> {
        let blob = Key12::from_blob(&entry.blob)
            .ok_or(TssError::BadParameter("registry entry holds a malformed blob"))?;

        let usage_policy = self.insert_policy(PolicyKind::Usage);
        let migration_policy = self.insert_policy(PolicyKind::Migration);
        let flags = blob.flags();
        let key = KeyObject {
            usage: KeyUsage::from_u16(blob.key_usage.get()).unwrap_or(KeyUsage::Legacy),
            size_bits: blob.parms.rsa_key_bits().unwrap_or(2048),
            migratable: flags.migratable(),
            volatile: flags.is_volatile(),
            auth_required: blob.auth_data_usage != 0,
            enc_scheme: blob.parms.enc_scheme.get(),
            sig_scheme: blob.parms.sig_scheme.get(),
            usage_policy,
            migration_policy,
            blob: Some(blob),
            tpm_handle: None,
            parent: Some(ParentRef::Registered {
                uuid: entry.parent_uuid,
            }),
        };
        Ok(self.objects.insert(Object::Key(key)))
    }
}

/// The KEY12 template sent to CreateWrapKey: everything but the public and
/// encrypted parts, which the authority fills in.
fn key_template(
    usage: KeyUsage,
    size_bits: u32,
    migratable: bool,
    volatile: bool,
    auth_required: bool,
    enc_scheme: u16,
    sig_scheme: u16,
) -> TssResult<Key12> {
    let enc_scheme = EncScheme::from_u16(enc_scheme)
        .ok_or(TssError::BadParameter("unknown encryption scheme"))?;
    let sig_scheme = SigScheme::from_u16(sig_scheme)
        .ok_or(TssError::BadParameter("unknown signature scheme"))?;

    let parms = KeyParms::new_rsa(enc_scheme, sig_scheme, size_bits);
    let flags = KeyFlags::new()
        .with_migratable(migratable)
        .with_is_volatile(volatile);
    let auth_data_usage = if auth_required {
        AuthDataUsage::Always
    } else {
        AuthDataUsage::Never
    };

    Ok(Key12::new(usage, flags, auth_data_usage, parms, &[], &[])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::object::init;

    #[test]
    fn test_unload_key_with_sentinel_handle() {
        let mut ctx = Context::new();
        // The all-ones sentinel was never allocated; unloading it is an
        // invalid-handle error, not a crash.
        assert!(matches!(
            ctx.unload_key(Handle::from_raw(0xffff_ffff)),
            Err(TssError::InvalidHandle(0xffff_ffff))
        ));
    }

    #[test]
    fn test_unload_key_never_loaded_is_noop() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING)
            .unwrap();
        ctx.unload_key(key).unwrap();
    }

    #[test]
    fn test_create_key_requires_loaded_parent() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING)
            .unwrap();
        let parent = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_STORAGE)
            .unwrap();
        assert!(matches!(
            ctx.create_key(key, parent),
            Err(TssError::BadParameter(_))
        ));
    }

    #[test]
    fn test_register_key_requires_created_key() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING)
            .unwrap();
        let uuid = Tpm12Uuid::new(1, 2, 3, 4, 5, [0; 6]);
        assert!(matches!(
            ctx.register_key(key, PsType::USER, uuid, PsType::SYSTEM, SRK_UUID),
            Err(TssError::BadParameter(_))
        ));
    }

    #[test]
    fn test_unregister_key_rejects_combined_scope() {
        let mut ctx = Context::new();
        let both = PsType::from_raw(PsType::SYSTEM.raw() | PsType::USER.raw());
        assert!(matches!(
            ctx.unregister_key(both, SRK_UUID),
            Err(TssError::BadParameter(_))
        ));
    }

    #[test]
    fn test_unregister_unknown_uuid() {
        let mut ctx = Context::new();
        let uuid = Tpm12Uuid::new(9, 9, 9, 9, 9, [9; 6]);
        assert!(matches!(
            ctx.unregister_key(PsType::USER, uuid),
            Err(TssError::KeyNotFound)
        ));
    }
}
