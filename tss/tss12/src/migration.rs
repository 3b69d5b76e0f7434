// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The key migration handshake.
//!
//! Linear protocol: the owner authorizes a ticket binding a migration
//! authority key and scheme; blob creation consumes the ticket and blinds
//! the key material with a fresh random; conversion on the destination
//! unblinds and rewraps under the destination parent. Structural mistakes
//! (non-migratable key, missing secrets, malformed ticket) are rejected
//! before any wire traffic.

use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::handle::Handle;
use crate::object::ParentRef;
use tpm12_proto::AuthorizeMigrationKeyParams;
use tpm12_proto::ConvertMigrationBlobParams;
use tpm12_proto::CreateMigrationBlobParams;
use tpm12_proto::CreateMigrationBlobReply;
use tpm12_proto::MigrationKeyAuth;
use tpm12_proto::MigrationScheme;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::Reader;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::SizedBuffer;

/// A migration ticket issued by the authority's owner. Single-use and
/// scheme-specific; the authority refuses a consumed or foreign ticket.
#[derive(Debug, Clone)]
pub struct MigrationTicket {
    bytes: Vec<u8>,
}

impl MigrationTicket {
    /// The serialized ticket, as returned by the authority.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reconstruct a ticket received out of band.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl Context {
    /// Ask the TPM owner to authorize migrations toward `authority_key`
    /// under the given scheme. Requires the owner secret on the TPM
    /// object's usage policy.
    pub fn authorize_migration_ticket(
        &mut self,
        authority_key: Handle,
        scheme: MigrationScheme,
    ) -> TssResult<MigrationTicket> {
        let tpm = self.tpm()?;
        let owner_secret = self.usage_secret(tpm)?;
        let authority_pub = self.get_pub_key(authority_key)?;

        let params = AuthorizeMigrationKeyParams::new(scheme, &authority_pub)?.serialize();
        let out = self.authorized_call(
            OrdinalEnum::AuthorizeMigrationKey,
            &[],
            &params,
            tpm,
            &owner_secret,
        )?;

        // Validate the shape before handing it to the caller.
        MigrationKeyAuth::from_blob(&out)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        Ok(MigrationTicket { bytes: out })
    }

    /// Produce a migration blob for a migratable key under its loaded
    /// parent, consuming the ticket at the authority. Returns the blinding
    /// random and the blob; both are required at the destination.
    pub fn create_migration_blob(
        &mut self,
        key: Handle,
        parent: Handle,
        ticket: &MigrationTicket,
    ) -> TssResult<(Vec<u8>, Vec<u8>)> {
        let key_obj = self.objects.get(key)?.as_key()?;
        if !key_obj.migratable {
            // Checked before anything is sent: no ticket makes a
            // non-migratable key migratable.
            return Err(TssError::BadParameter("key is not migratable"));
        }
        let enc_data = key_obj
            .blob
            .as_ref()
            .ok_or(TssError::BadParameter("key has not been created"))?
            .enc_data
            .contents()
            .to_vec();
        let migration_secret = self.migration_secret(key)?;

        let parent_obj = self.objects.get(parent)?.as_key()?;
        let parent_tpm = parent_obj
            .tpm_handle
            .ok_or(TssError::BadParameter("parent key is not loaded"))?;
        let parent_secret = self.usage_secret(parent)?;

        let ticket_auth = MigrationKeyAuth::from_blob(ticket.bytes())
            .ok_or(TssError::BadParameter("malformed migration ticket"))?;
        let scheme = MigrationScheme::from_u16(ticket_auth.migration_scheme.get())
            .ok_or(TssError::BadParameter("unknown migration scheme in ticket"))?;

        let params = CreateMigrationBlobParams::new(scheme, &ticket_auth, &enc_data)?.serialize();
        let out = self.authorized_call2(
            OrdinalEnum::CreateMigrationBlob,
            &[parent_tpm],
            &params,
            parent,
            &parent_secret,
            &migration_secret,
        )?;

        let reply = CreateMigrationBlobReply::deserialize(&out)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        Ok((
            reply.random.contents().to_vec(),
            reply.out_data.contents().to_vec(),
        ))
    }

    /// Destination side: rewrap a migration blob under the destination
    /// parent using the blinding random, and install the result into
    /// `key`'s blob so it can be loaded.
    pub fn convert_migration_blob(
        &mut self,
        key: Handle,
        parent: Handle,
        blob: &[u8],
        random: &[u8],
    ) -> TssResult<()> {
        // The key object must carry a blob to install into (imported via
        // the blob attribute when the destination is a fresh context).
        if self.objects.get(key)?.as_key()?.blob.is_none() {
            return Err(TssError::BadParameter(
                "key has no blob to install the converted key into",
            ));
        }

        let parent_obj = self.objects.get(parent)?.as_key()?;
        let parent_tpm = parent_obj
            .tpm_handle
            .ok_or(TssError::BadParameter("parent key is not loaded"))?;
        let parent_secret = self.usage_secret(parent)?;

        let params = ConvertMigrationBlobParams::new(blob, random)?.serialize();
        let out = self.authorized_call(
            OrdinalEnum::ConvertMigrationBlob,
            &[parent_tpm],
            &params,
            parent,
            &parent_secret,
        )?;

        let mut reader = Reader::new(&out);
        let enc_data = SizedBuffer::deserialize(&mut reader)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;

        let key_obj = self.objects.get_mut(key)?.as_key_mut()?;
        let blob12 = key_obj.blob.as_mut().expect("checked above");
        blob12.enc_data = enc_data;
        key_obj.tpm_handle = None;
        key_obj.parent = Some(ParentRef::Live(parent));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::object::init;

    #[test]
    fn test_non_migratable_key_is_rejected_before_the_wire() {
        // No channel is connected: reaching the wire would error
        // differently, so BadParameter here proves the structural check
        // fires first.
        let mut ctx = Context::new();
        let key = ctx
            .create_object(
                ObjectType::RsaKey,
                init::KEY_TYPE_SIGNING | init::KEY_NOT_MIGRATABLE,
            )
            .unwrap();
        let parent = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_STORAGE)
            .unwrap();

        let ticket = MigrationTicket::from_bytes(vec![0; 16]);
        assert!(matches!(
            ctx.create_migration_blob(key, parent, &ticket),
            Err(TssError::BadParameter("key is not migratable"))
        ));
    }

    #[test]
    fn test_malformed_ticket_is_rejected() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(
                ObjectType::RsaKey,
                init::KEY_TYPE_SIGNING | init::KEY_MIGRATABLE,
            )
            .unwrap();
        let policy = ctx
            .get_policy_object(key, crate::object::PolicyKind::Migration)
            .unwrap();
        ctx.set_policy_secret(policy, crate::object::SecretMode::Sha1, &[1u8; 20])
            .unwrap();

        let parent = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_STORAGE)
            .unwrap();

        let ticket = MigrationTicket::from_bytes(vec![0xFF; 7]);
        let err = ctx.create_migration_blob(key, parent, &ticket);
        assert!(matches!(err, Err(TssError::BadParameter(_))));
    }
}
