// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Policy objects and secret handling.
//!
//! A policy carries a write-only secret. Operations that structurally
//! require authorization resolve a secret through the target object's
//! attached policy, falling back to the context default policy; if neither
//! carries one the call is rejected as `BadParameter` before anything is
//! sent - an authority rejection (`AuthFail`) means something else
//! entirely.

use crate::auth::sha1;
use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::handle::Handle;
use crate::object::Object;
use crate::object::PolicyKind;
use crate::object::Secret;
use crate::object::SecretMode;
use tpm12_proto::SHA1_DIGEST_SIZE;

/// The TSS well-known secret: twenty zero bytes.
pub const WELL_KNOWN_SECRET: [u8; SHA1_DIGEST_SIZE] = [0u8; SHA1_DIGEST_SIZE];

impl Context {
    /// Return the policy of the given kind attached to an object,
    /// auto-created together with the object.
    pub fn get_policy_object(&self, handle: Handle, kind: PolicyKind) -> TssResult<Handle> {
        let object = self.objects.get(handle)?;
        match (object, kind) {
            (Object::Key(key), PolicyKind::Usage) => Ok(key.usage_policy),
            (Object::Key(key), PolicyKind::Migration) => Ok(key.migration_policy),
            (Object::Tpm(tpm), PolicyKind::Usage) => Ok(tpm.usage_policy),
            (Object::Nv(nv), PolicyKind::Usage) => Ok(nv.usage_policy),
            _ => Err(TssError::BadParameter(
                "object has no policy of the requested kind",
            )),
        }
    }

    /// Attach an existing policy object to a target, replacing the policy
    /// of the same kind.
    pub fn assign_policy(&mut self, policy: Handle, target: Handle) -> TssResult<()> {
        let kind = self.objects.get(policy)?.as_policy()?.kind;

        let object = self.objects.get_mut(target)?;
        match (object, kind) {
            (Object::Key(key), PolicyKind::Usage) => key.usage_policy = policy,
            (Object::Key(key), PolicyKind::Migration) => key.migration_policy = policy,
            (Object::Tpm(tpm), PolicyKind::Usage) => tpm.usage_policy = policy,
            (Object::Nv(nv), PolicyKind::Usage) => nv.usage_policy = policy,
            _ => {
                return Err(TssError::BadParameter(
                    "object cannot carry a policy of that kind",
                ));
            }
        }
        Ok(())
    }

    /// Set a policy's secret. Plain-mode secrets of any length are reduced
    /// to SHA-1 width; pre-hashed secrets must be exactly digest-sized.
    /// Secrets are write-once until explicitly reset.
    pub fn set_policy_secret(
        &mut self,
        policy: Handle,
        mode: SecretMode,
        secret: &[u8],
    ) -> TssResult<()> {
        let derived = match mode {
            SecretMode::Plain => sha1(&[secret]),
            SecretMode::Sha1 => secret
                .try_into()
                .map_err(|_| TssError::BadParameter("pre-hashed secret must be 20 bytes"))?,
        };

        let policy = self.objects.get_mut(policy)?.as_policy_mut()?;
        if policy.secret.is_some() {
            return Err(TssError::BadParameter(
                "policy secret is already set; reset it first",
            ));
        }
        policy.secret = Some(Secret(derived));
        Ok(())
    }

    /// Clear a policy's secret so it can be set again. Cached sessions may
    /// be keyed to the old secret, so all of them are dropped.
    pub fn reset_policy_secret(&mut self, policy: Handle) -> TssResult<()> {
        self.objects.get_mut(policy)?.as_policy_mut()?.secret = None;
        self.drop_all_sessions();
        Ok(())
    }

    fn policy_secret(&self, policy: Handle) -> TssResult<Option<[u8; SHA1_DIGEST_SIZE]>> {
        Ok(self.objects.get(policy)?.as_policy()?.secret.map(|s| s.0))
    }

    /// Resolve a secret through `policy`, falling back to the context
    /// default policy.
    pub(crate) fn reachable_secret(
        &self,
        policy: Handle,
    ) -> TssResult<Option<[u8; SHA1_DIGEST_SIZE]>> {
        if let Some(secret) = self.policy_secret(policy)? {
            return Ok(Some(secret));
        }
        self.policy_secret(self.default_policy)
    }

    /// The usage secret required to operate on an object. Structural
    /// absence is `BadParameter`; objects created without an authorization
    /// requirement fall back to the well-known secret.
    pub(crate) fn usage_secret(&self, target: Handle) -> TssResult<[u8; SHA1_DIGEST_SIZE]> {
        let (policy, auth_required) = match self.objects.get(target)? {
            Object::Key(key) => (key.usage_policy, key.auth_required),
            Object::Tpm(tpm) => (tpm.usage_policy, true),
            Object::Nv(nv) => (nv.usage_policy, true),
            _ => {
                return Err(TssError::BadParameter(
                    "object cannot be the target of an authorized call",
                ));
            }
        };

        match self.reachable_secret(policy)? {
            Some(secret) => Ok(secret),
            None if !auth_required => Ok(WELL_KNOWN_SECRET),
            None => Err(TssError::BadParameter(
                "no policy with a secret is reachable from the target object",
            )),
        }
    }

    /// The migration secret of a key; required for migration-blob creation.
    pub(crate) fn migration_secret(&self, key: Handle) -> TssResult<[u8; SHA1_DIGEST_SIZE]> {
        let policy = self.objects.get(key)?.as_key()?.migration_policy;
        self.reachable_secret(policy)?
            .ok_or(TssError::BadParameter(
                "the key has no migration policy secret",
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::object::init;

    #[test]
    fn test_policy_secret_is_write_once() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING | init::KEY_AUTHORIZATION)
            .unwrap();
        let policy = ctx.get_policy_object(key, PolicyKind::Usage).unwrap();

        ctx.set_policy_secret(policy, SecretMode::Plain, b"opensesame")
            .unwrap();
        assert!(matches!(
            ctx.set_policy_secret(policy, SecretMode::Plain, b"again"),
            Err(TssError::BadParameter(_))
        ));

        ctx.reset_policy_secret(policy).unwrap();
        ctx.set_policy_secret(policy, SecretMode::Sha1, &[7u8; 20])
            .unwrap();
    }

    #[test]
    fn test_pre_hashed_secret_must_be_digest_sized() {
        let mut ctx = Context::new();
        let policy = ctx
            .create_object(ObjectType::Policy, init::POLICY_USAGE)
            .unwrap();
        assert!(matches!(
            ctx.set_policy_secret(policy, SecretMode::Sha1, b"short"),
            Err(TssError::BadParameter(_))
        ));
    }

    #[test]
    fn test_usage_secret_falls_back_to_default_policy() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING | init::KEY_AUTHORIZATION)
            .unwrap();

        // No secret anywhere: structural failure.
        assert!(matches!(
            ctx.usage_secret(key),
            Err(TssError::BadParameter(_))
        ));

        // A secret on the context default policy is reachable.
        let default_policy = ctx.default_policy();
        ctx.set_policy_secret(default_policy, SecretMode::Plain, b"fallback")
            .unwrap();
        assert_eq!(ctx.usage_secret(key).unwrap(), sha1(&[b"fallback"]));
    }

    #[test]
    fn test_no_auth_key_uses_well_known_secret() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING)
            .unwrap();
        assert_eq!(ctx.usage_secret(key).unwrap(), WELL_KNOWN_SECRET);
    }

    #[test]
    fn test_assign_policy_replaces_slot() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING | init::KEY_AUTHORIZATION)
            .unwrap();
        let shared = ctx
            .create_object(ObjectType::Policy, init::POLICY_USAGE)
            .unwrap();
        ctx.set_policy_secret(shared, SecretMode::Plain, b"shared")
            .unwrap();

        ctx.assign_policy(shared, key).unwrap();
        assert_eq!(ctx.get_policy_object(key, PolicyKind::Usage).unwrap(), shared);
        assert_eq!(ctx.usage_secret(key).unwrap(), sha1(&[b"shared"]));
    }
}
