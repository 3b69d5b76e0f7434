// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The context: root ownership scope for every other object.
//!
//! A context owns its handle table, its Command Channel binding and its
//! cached authorization sessions. It is a single logical actor: every call
//! runs to completion before the next, and nothing here is shared between
//! threads. Independent contexts over independent channels are fully
//! parallel.

use crate::auth::AuthSession;
use crate::auth::sha1;
use crate::channel::CommandChannel;
use crate::error::TssError;
use crate::error::TssResult;
use crate::error::map_tpm_error;
use crate::handle::Handle;
use crate::handle::HandleTable;
use crate::object::HashObject;
use crate::object::KeyObject;
use crate::object::Object;
use crate::object::ObjectType;
use crate::object::PcrCompositeObject;
use crate::object::PolicyKind;
use crate::object::PolicyObject;
use crate::object::NvObject;
use crate::object::TpmObject;
use crate::object::init;
use crate::registry::InMemoryRegistry;
use crate::registry::KeyRegistry;
use crate::transport::TransportState;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tpm12_proto::FlushSpecificParams;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::Reader;
use tpm12_proto::ReplyFrame;
use tpm12_proto::ResourceType;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::SizedBuffer;
use tpm12_proto::build_command;
use zerocopy::IntoBytes;

/// A registry shared between contexts (and, through the file store, between
/// processes).
pub type SharedRegistry = Arc<Mutex<dyn KeyRegistry>>;

/// The root object of the stack. See the crate docs for the lifecycle.
pub struct Context {
    pub(crate) channel: Option<Box<dyn CommandChannel>>,
    pub(crate) objects: HandleTable,
    pub(crate) registry: SharedRegistry,
    pub(crate) sessions: HashMap<Handle, AuthSession>,
    pub(crate) transport: Option<TransportState>,
    pub(crate) tpm_object: Option<Handle>,
    pub(crate) default_policy: Handle,
}

impl Context {
    /// Create an unconnected context with a private in-memory registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(Mutex::new(InMemoryRegistry::new())))
    }

    /// Create an unconnected context over an injected registry. Use this to
    /// share a persistent store between contexts.
    pub fn with_registry(registry: SharedRegistry) -> Self {
        let mut objects = HandleTable::new();
        let default_policy = objects.insert(Object::Policy(PolicyObject {
            kind: PolicyKind::Usage,
            secret: None,
            lifetime: 0,
        }));
        Self {
            channel: None,
            objects,
            registry,
            sessions: HashMap::new(),
            transport: None,
            tpm_object: None,
            default_policy,
        }
    }

    /// Bind the context to a Command Channel. The channel is owned
    /// exclusively from here on; a context cannot be connected twice.
    pub fn connect(&mut self, channel: Box<dyn CommandChannel>) -> TssResult<()> {
        if self.channel.is_some() {
            return Err(TssError::BadParameter("context is already connected"));
        }
        self.channel = Some(channel);

        let policy = self.insert_policy(PolicyKind::Usage);
        self.tpm_object = Some(self.objects.insert(Object::Tpm(TpmObject {
            usage_policy: policy,
        })));
        Ok(())
    }

    /// The distinguished TPM object of a connected context.
    pub fn tpm(&self) -> TssResult<Handle> {
        self.tpm_object
            .ok_or(TssError::BadParameter("context is not connected"))
    }

    /// The context-wide fallback policy consulted when an object's own
    /// policy carries no secret.
    pub fn default_policy(&self) -> Handle {
        self.default_policy
    }

    /// Create an object of the given type. Init flags are validated per
    /// type; unrecognized or ambiguous combinations are rejected.
    pub fn create_object(&mut self, object_type: ObjectType, init_flags: u32) -> TssResult<Handle> {
        match object_type {
            ObjectType::RsaKey => {
                let usage_policy = self.insert_policy(PolicyKind::Usage);
                let migration_policy = self.insert_policy(PolicyKind::Migration);
                match KeyObject::from_init_flags(init_flags, usage_policy, migration_policy) {
                    Ok(key) => Ok(self.objects.insert(Object::Key(key))),
                    Err(err) => {
                        let _ = self.objects.remove(usage_policy);
                        let _ = self.objects.remove(migration_policy);
                        Err(err)
                    }
                }
            }
            ObjectType::Policy => {
                let kind = match init_flags {
                    init::POLICY_USAGE => PolicyKind::Usage,
                    init::POLICY_MIGRATION => PolicyKind::Migration,
                    _ => return Err(TssError::InvalidObjectInitFlag(init_flags)),
                };
                Ok(self.insert_policy(kind))
            }
            ObjectType::Hash => {
                let hash = HashObject::from_init_flags(init_flags)?;
                Ok(self.objects.insert(Object::Hash(hash)))
            }
            ObjectType::PcrComposite => {
                if init_flags != 0 {
                    return Err(TssError::InvalidObjectInitFlag(init_flags));
                }
                Ok(self.objects.insert(Object::Pcrs(PcrCompositeObject {
                    values: BTreeMap::new(),
                })))
            }
            ObjectType::NvStore => {
                if init_flags != 0 {
                    return Err(TssError::InvalidObjectInitFlag(init_flags));
                }
                let usage_policy = self.insert_policy(PolicyKind::Usage);
                Ok(self.objects.insert(Object::Nv(NvObject {
                    index: None,
                    permissions: 0,
                    data_size: None,
                    defined: false,
                    usage_policy,
                })))
            }
        }
    }

    pub(crate) fn insert_policy(&mut self, kind: PolicyKind) -> Handle {
        self.objects.insert(Object::Policy(PolicyObject {
            kind,
            secret: None,
            lifetime: 0,
        }))
    }

    /// Release one object. A loaded key is flushed from the authority on a
    /// best-effort basis; the handle is invalid afterwards either way.
    pub fn close_object(&mut self, handle: Handle) -> TssResult<()> {
        if Some(handle) == self.tpm_object {
            return Err(TssError::BadParameter("the tpm object cannot be closed"));
        }

        let object = self.objects.remove(handle)?;
        if let Object::Key(key) = &object {
            if let Some(tpm_handle) = key.tpm_handle {
                self.flush_key_best_effort(tpm_handle);
            }
        }
        self.drop_session(handle);
        Ok(())
    }

    /// Close the context: tear down cached sessions, flush every loaded
    /// key, and release the channel binding. Cleanup failures are logged
    /// rather than surfaced; the context is gone regardless.
    pub fn close(mut self) -> TssResult<()> {
        if self.channel.is_some() {
            self.drop_all_sessions();

            let loaded: Vec<u32> = self
                .objects
                .iter()
                .filter_map(|(_, object)| match object {
                    Object::Key(key) => key.tpm_handle,
                    _ => None,
                })
                .collect();
            for tpm_handle in loaded {
                self.flush_key_best_effort(tpm_handle);
            }
        }

        self.objects.clear();
        self.channel = None;
        Ok(())
    }

    fn flush_key_best_effort(&mut self, tpm_handle: u32) {
        if tpm_handle == tpm12_proto::TPM12_KH_SRK {
            // The SRK is authority-resident, not ours to flush.
            return;
        }
        let params = FlushSpecificParams::new(tpm_handle, ResourceType::Key);
        if let Err(err) = self.plain_call(OrdinalEnum::FlushSpecific, &[], params.as_bytes()) {
            tracing::debug!(
                err = &err as &dyn std::error::Error,
                tpm_handle,
                "failed to flush key"
            );
        }
    }

    /// Send one command blob, transparently tunneling it through the active
    /// transport session when one exists.
    pub(crate) fn send_command(&mut self, cmd: &[u8]) -> TssResult<Vec<u8>> {
        let channel = self
            .channel
            .as_mut()
            .ok_or(TssError::BadParameter("context is not connected"))?;

        let Some(transport) = self.transport.as_mut() else {
            return Ok(channel.send(cmd)?);
        };

        let params = SizedBuffer::new(cmd)?.serialize();
        let outer = build_command(OrdinalEnum::ExecuteTransport, &[], &params, &[]);
        let rsp = channel.send(&outer)?;
        let frame = ReplyFrame::parse(&rsp, 0)?;
        let code = frame.return_code();
        if code != 0 {
            return Err(map_tpm_error(OrdinalEnum::ExecuteTransport, code));
        }

        let mut reader = Reader::new(&frame.params);
        let inner = SizedBuffer::deserialize(&mut reader)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        let inner_rsp = inner.contents().to_vec();

        // Mirror the authority's audit log for later signature checking.
        transport.log_digest = sha1(&[
            &transport.log_digest,
            &sha1(&[cmd]),
            &sha1(&[&inner_rsp]),
        ]);
        if cmd.len() >= 10 {
            let ordinal = u32::from_be_bytes(cmd[6..10].try_into().expect("length checked"));
            transport.ordinals.push(ordinal);
        }

        Ok(inner_rsp)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::attrib;

    #[test]
    fn test_hash_object_init_flags() {
        let mut ctx = Context::new();

        for flags in [init::HASH_DEFAULT, init::HASH_SHA1, init::HASH_OTHER] {
            let handle = ctx.create_object(ObjectType::Hash, flags).unwrap();
            ctx.close_object(handle).unwrap();
        }

        // No recognized selector / conflicting selector bits.
        for flags in [0xffddeeff, 0x15151551] {
            assert!(matches!(
                ctx.create_object(ObjectType::Hash, flags),
                Err(TssError::InvalidObjectInitFlag(f)) if f == flags
            ));
        }
    }

    #[test]
    fn test_key_object_init_flags() {
        let mut ctx = Context::new();
        let handle = ctx
            .create_object(
                ObjectType::RsaKey,
                init::KEY_TYPE_SIGNING
                    | init::KEY_SIZE_2048
                    | init::KEY_VOLATILE
                    | init::KEY_NO_AUTHORIZATION
                    | init::KEY_NOT_MIGRATABLE,
            )
            .unwrap();
        assert_eq!(
            ctx.get_attrib_u32(handle, attrib::KEY_INFO, attrib::KEYINFO_SIZE)
                .unwrap(),
            2048
        );
        assert_eq!(
            ctx.get_attrib_u32(handle, attrib::KEY_INFO, attrib::KEYINFO_MIGRATABLE)
                .unwrap(),
            0
        );

        // An unknown flag bit poisons the whole word.
        assert!(matches!(
            ctx.create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING | 0x0080_0000),
            Err(TssError::InvalidObjectInitFlag(_))
        ));
    }

    #[test]
    fn test_tpm_object_requires_connection() {
        let ctx = Context::new();
        assert!(matches!(ctx.tpm(), Err(TssError::BadParameter(_))));
    }

    #[test]
    fn test_close_object_rejects_foreign_handle() {
        let mut ctx = Context::new();
        assert!(matches!(
            ctx.close_object(Handle::from_raw(0xffff_ffff)),
            Err(TssError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_nv_attribute_window() {
        let mut ctx = Context::new();
        let nv = ctx.create_object(ObjectType::NvStore, 0).unwrap();
        ctx.set_attrib_u32(nv, attrib::NV_INDEX, 0, 0x0001_1149).unwrap();
        ctx.set_attrib_u32(nv, attrib::NV_DATASIZE, 0, 10).unwrap();
        assert_eq!(ctx.get_attrib_u32(nv, attrib::NV_INDEX, 0).unwrap(), 0x0001_1149);

        // Reads of unset attributes are caller errors, not defaults.
        let nv2 = ctx.create_object(ObjectType::NvStore, 0).unwrap();
        assert!(matches!(
            ctx.get_attrib_u32(nv2, attrib::NV_INDEX, 0),
            Err(TssError::BadParameter(_))
        ));
    }
}
