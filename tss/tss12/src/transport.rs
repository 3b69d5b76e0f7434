// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transport sessions: wrapping a command sequence in one audited envelope.
//!
//! While a session is active every round-trip is tunneled through
//! ExecuteTransport and folded into a rolling log digest on both sides
//! (see [`Context::send_command`]). Release asks the authority to sign the
//! log; the stack recomputes the construction locally and reports a
//! mismatch without invalidating any result already returned - the log is
//! evidence, not a rollback mechanism.

use crate::auth::fresh_nonce;
use crate::auth::hmac_sha1;
use crate::auth::sha1;
use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::handle::Handle;
use tpm12_proto::EstablishTransportReply;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::Reader;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::SHA1_DIGEST_SIZE;
use tpm12_proto::SizedBuffer;
use tpm12_proto::TransportAttributes;
use tpm12_proto::TransportPublic;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

pub(crate) struct TransportState {
    #[expect(dead_code, reason = "kept for diagnostics; release targets the only session")]
    pub handle: u32,
    pub log_digest: [u8; SHA1_DIGEST_SIZE],
    pub ordinals: Vec<u32>,
}

impl Context {
    /// Start a logged transport session under a loaded wrapping key. Only
    /// one session may be active per context.
    pub fn transport_init(&mut self, wrap_key: Handle) -> TssResult<u32> {
        if self.transport.is_some() {
            return Err(TssError::BadParameter(
                "a transport session is already active",
            ));
        }

        let wrap_obj = self.objects.get(wrap_key)?.as_key()?;
        let wrap_tpm = wrap_obj
            .tpm_handle
            .ok_or(TssError::BadParameter("wrapping key is not loaded"))?;
        let secret = self.usage_secret(wrap_key)?;

        let trans_public =
            TransportPublic::new(TransportAttributes::new().with_log(true).with_exclusive(true));
        let out = self.authorized_call(
            OrdinalEnum::EstablishTransport,
            &[wrap_tpm],
            trans_public.as_bytes(),
            wrap_key,
            &secret,
        )?;
        let reply = EstablishTransportReply::read_from_bytes(&out[..])
            .map_err(|_| TssError::Protocol(ResponseValidationError::MalformedParameters))?;

        let handle = reply.trans_handle.get();
        self.transport = Some(TransportState {
            handle,
            log_digest: [0u8; SHA1_DIGEST_SIZE],
            ordinals: Vec::new(),
        });
        Ok(handle)
    }

    /// Close the active transport session, obtaining the authority's
    /// signature over the command log and verifying it locally. Returns
    /// the signature bytes.
    pub fn transport_final(&mut self, signing_key: Handle) -> TssResult<Vec<u8>> {
        let sign_obj = self.objects.get(signing_key)?.as_key()?;
        let sign_tpm = sign_obj
            .tpm_handle
            .ok_or(TssError::BadParameter("signing key is not loaded"))?;
        let secret = self.usage_secret(signing_key)?;

        // Take the state first: the release command itself travels outside
        // the tunnel.
        let state = self.transport.take().ok_or(TssError::BadParameter(
            "no transport session is active",
        ))?;

        let anti_replay = fresh_nonce();
        let out = self.authorized_call(
            OrdinalEnum::ReleaseTransportSigned,
            &[sign_tpm],
            &anti_replay,
            signing_key,
            &secret,
        )?;

        let mut reader = Reader::new(&out);
        let signature = SizedBuffer::deserialize(&mut reader)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;

        // The authority signs with the signing key's usage secret over the
        // log digest, the wrapped-ordinal list digest and the anti-replay
        // nonce; verify the whole construction.
        let ordinal_bytes: Vec<u8> = state
            .ordinals
            .iter()
            .flat_map(|o| o.to_be_bytes())
            .collect();
        let expected = hmac_sha1(
            &secret,
            &[&state.log_digest, &sha1(&[&ordinal_bytes]), &anti_replay],
        );
        if signature.contents() != expected {
            tracing::error!("transport log signature mismatch");
            return Err(TssError::TransportIntegrity);
        }

        Ok(signature.contents().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::object::init;

    #[test]
    fn test_transport_final_without_session() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING)
            .unwrap();
        assert!(matches!(
            ctx.transport_final(key),
            Err(TssError::BadParameter("signing key is not loaded"))
        ));
    }

    #[test]
    fn test_transport_init_requires_loaded_key() {
        let mut ctx = Context::new();
        let key = ctx
            .create_object(ObjectType::RsaKey, init::KEY_TYPE_LEGACY)
            .unwrap();
        assert!(matches!(
            ctx.transport_init(key),
            Err(TssError::BadParameter("wrapping key is not loaded"))
        ));
    }
}
