// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The authorization engine.
//!
//! Proof-of-knowledge for every authorized command: the secret never
//! travels; both sides HMAC the parameter digest together with a rolling
//! even/odd nonce pair. A session whose proof exchange fails - or whose
//! command never comes back - is torn down and never retried with stale
//! nonces.

use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::error::map_tpm_error;
use crate::handle::Handle;
use hmac::Hmac;
use hmac::Mac;
use sha1::Digest;
use sha1::Sha1;
use tpm12_proto::CmdAuth;
use tpm12_proto::EntityType;
use tpm12_proto::NONCE_SIZE;
use tpm12_proto::OiapReply;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::OsapParams;
use tpm12_proto::OsapReply;
use tpm12_proto::ReplyAuth;
use tpm12_proto::ReplyFrame;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::SHA1_DIGEST_SIZE;
use tpm12_proto::build_command;
use zerocopy::FromBytes;

/// SHA-1 over the concatenation of the given chunks.
pub(crate) fn sha1(chunks: &[&[u8]]) -> [u8; SHA1_DIGEST_SIZE] {
    let mut hasher = Sha1::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// HMAC-SHA1 over the concatenation of the given chunks.
pub(crate) fn hmac_sha1(key: &[u8], chunks: &[&[u8]]) -> [u8; SHA1_DIGEST_SIZE] {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

/// In-place XOR; lengths must match.
pub(crate) fn xor_mask(data: &mut [u8], mask: &[u8]) {
    assert_eq!(data.len(), mask.len());
    for (d, m) in data.iter_mut().zip(mask) {
        *d ^= m;
    }
}

pub(crate) fn fresh_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::fill(&mut nonce).expect("rng failure");
    nonce
}

/// An object-bound OIAP session: rolling nonce plus the authority handle.
#[derive(Clone)]
pub(crate) struct AuthSession {
    pub handle: u32,
    pub nonce_even: [u8; NONCE_SIZE],
}

/// A one-shot OSAP session with its derived shared secret.
pub(crate) struct OsapSession {
    pub handle: u32,
    pub nonce_even: [u8; NONCE_SIZE],
    pub shared_secret: [u8; SHA1_DIGEST_SIZE],
}

impl Context {
    /// Execute an unauthorized command and return its reply parameters.
    pub(crate) fn plain_call(
        &mut self,
        ordinal: OrdinalEnum,
        handles: &[u32],
        params: &[u8],
    ) -> TssResult<Vec<u8>> {
        let cmd = build_command(ordinal, handles, params, &[]);
        let rsp = self.send_command(&cmd)?;
        let frame = ReplyFrame::parse(&rsp, 0)?;
        let code = frame.return_code();
        if code != 0 {
            return Err(map_tpm_error(ordinal, code));
        }
        Ok(frame.params)
    }

    /// Open a fresh OIAP session with the authority.
    pub(crate) fn start_oiap(&mut self) -> TssResult<AuthSession> {
        let params = self.plain_call(OrdinalEnum::Oiap, &[], &[])?;
        let reply = OiapReply::read_from_bytes(&params[..])
            .map_err(|_| TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        Ok(AuthSession {
            handle: reply.auth_handle.get(),
            nonce_even: reply.nonce_even,
        })
    }

    /// Open a one-shot OSAP session bound to an entity and derive the
    /// shared secret from the entity's secret and the OSAP nonce pair.
    pub(crate) fn start_osap(
        &mut self,
        entity_type: EntityType,
        entity_value: u32,
        entity_secret: &[u8; SHA1_DIGEST_SIZE],
    ) -> TssResult<OsapSession> {
        let nonce_odd_osap = fresh_nonce();
        let params = OsapParams::new(entity_type, entity_value, nonce_odd_osap);
        let reply_params =
            self.plain_call(OrdinalEnum::Osap, &[], zerocopy::IntoBytes::as_bytes(&params))?;
        let reply = OsapReply::read_from_bytes(&reply_params[..])
            .map_err(|_| TssError::Protocol(ResponseValidationError::MalformedParameters))?;

        let shared_secret = hmac_sha1(
            entity_secret,
            &[&reply.nonce_even_osap, &nonce_odd_osap],
        );

        Ok(OsapSession {
            handle: reply.auth_handle.get(),
            nonce_even: reply.nonce_even,
            shared_secret,
        })
    }

    /// Get the cached object-bound session for `target`, or establish one.
    fn object_session(&mut self, target: Handle) -> TssResult<AuthSession> {
        if let Some(session) = self.sessions.get(&target) {
            return Ok(session.clone());
        }
        let session = self.start_oiap()?;
        self.sessions.insert(target, session.clone());
        Ok(session)
    }

    /// Execute a single-session authorized command against `target`,
    /// proving knowledge of `secret` and verifying the authority's proof
    /// over the reply.
    pub(crate) fn authorized_call(
        &mut self,
        ordinal: OrdinalEnum,
        handles: &[u32],
        params: &[u8],
        target: Handle,
        secret: &[u8; SHA1_DIGEST_SIZE],
    ) -> TssResult<Vec<u8>> {
        let session = self.object_session(target)?;
        let nonce_odd = fresh_nonce();
        let auth = request_auth(ordinal, params, &session, nonce_odd, true, secret);

        let cmd = build_command(ordinal, handles, params, &[auth]);
        // Once dispatched the nonce pair is consumed: every failure from
        // here tears the session down.
        let result = self.finish_authorized(ordinal, &cmd, 1, secret, nonce_odd, true, target);
        if result.is_err() {
            self.sessions.remove(&target);
        }
        result
    }

    /// Execute a two-session authorized command: the object-bound session
    /// for `target` plus a one-shot second session proving `secret2`.
    pub(crate) fn authorized_call2(
        &mut self,
        ordinal: OrdinalEnum,
        handles: &[u32],
        params: &[u8],
        target: Handle,
        secret1: &[u8; SHA1_DIGEST_SIZE],
        secret2: &[u8; SHA1_DIGEST_SIZE],
    ) -> TssResult<Vec<u8>> {
        let session1 = self.object_session(target)?;
        let session2 = match self.start_oiap() {
            Ok(session2) => session2,
            Err(err) => {
                self.sessions.remove(&target);
                return Err(err);
            }
        };

        let nonce_odd1 = fresh_nonce();
        let nonce_odd2 = fresh_nonce();
        let auth1 = request_auth(ordinal, params, &session1, nonce_odd1, true, secret1);
        let auth2 = request_auth(ordinal, params, &session2, nonce_odd2, false, secret2);

        let cmd = build_command(ordinal, handles, params, &[auth1, auth2]);
        let result: TssResult<Vec<u8>> = (|| {
            let rsp = self.send_command(&cmd)?;
            let frame = ReplyFrame::parse(&rsp, 2)?;
            let code = frame.return_code();
            if code != 0 {
                return Err(map_tpm_error(ordinal, code));
            }

            let reply1 = frame
                .auth1
                .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
            let reply2 = frame
                .auth2
                .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
            verify_reply_auth(ordinal, &frame.params, &reply1, nonce_odd1, secret1)?;
            verify_reply_auth(ordinal, &frame.params, &reply2, nonce_odd2, secret2)?;

            self.roll_session(target, &reply1);
            Ok(frame.params)
        })();

        if result.is_err() {
            self.sessions.remove(&target);
        }
        result
    }

    /// Execute an authorized command over an already-established one-shot
    /// OSAP session (continue flag off).
    pub(crate) fn osap_call(
        &mut self,
        ordinal: OrdinalEnum,
        handles: &[u32],
        params: &[u8],
        session: &OsapSession,
        nonce_odd: [u8; NONCE_SIZE],
    ) -> TssResult<Vec<u8>> {
        let in_digest = sha1(&[&(ordinal as u32).to_be_bytes(), params]);
        let auth_code = hmac_sha1(
            &session.shared_secret,
            &[&in_digest, &session.nonce_even, &nonce_odd, &[0]],
        );
        let auth = CmdAuth::new(session.handle, nonce_odd, false, auth_code);

        let cmd = build_command(ordinal, handles, params, &[auth]);
        let rsp = self.send_command(&cmd)?;
        let frame = ReplyFrame::parse(&rsp, 1)?;
        let code = frame.return_code();
        if code != 0 {
            return Err(map_tpm_error(ordinal, code));
        }

        let reply_auth = frame
            .auth1
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        verify_reply_auth(
            ordinal,
            &frame.params,
            &reply_auth,
            nonce_odd,
            &session.shared_secret,
        )?;
        Ok(frame.params)
    }

    fn finish_authorized(
        &mut self,
        ordinal: OrdinalEnum,
        cmd: &[u8],
        expected_auths: usize,
        secret: &[u8; SHA1_DIGEST_SIZE],
        nonce_odd: [u8; NONCE_SIZE],
        continue_auth: bool,
        target: Handle,
    ) -> TssResult<Vec<u8>> {
        let rsp = self.send_command(cmd)?;
        let frame = ReplyFrame::parse(&rsp, expected_auths)?;
        let code = frame.return_code();
        if code != 0 {
            return Err(map_tpm_error(ordinal, code));
        }

        let reply_auth = frame
            .auth1
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        verify_reply_auth(ordinal, &frame.params, &reply_auth, nonce_odd, secret)?;

        if continue_auth {
            self.roll_session(target, &reply_auth);
        }
        Ok(frame.params)
    }

    fn roll_session(&mut self, target: Handle, reply_auth: &ReplyAuth) {
        if reply_auth.continue_auth != 0 {
            if let Some(session) = self.sessions.get_mut(&target) {
                session.nonce_even = reply_auth.nonce_even;
            }
        } else {
            self.sessions.remove(&target);
        }
    }

    /// Forget the cached session for an object, telling the authority when
    /// possible. Cleanup failures are logged, not surfaced: the caller's
    /// operation already finished.
    pub(crate) fn drop_session(&mut self, target: Handle) {
        if let Some(session) = self.sessions.remove(&target) {
            let result = self.plain_call(
                OrdinalEnum::TerminateHandle,
                &[],
                &session.handle.to_be_bytes(),
            );
            if let Err(err) = result {
                tracing::debug!(
                    err = &err as &dyn std::error::Error,
                    "failed to terminate auth session"
                );
            }
        }
    }

    /// Invalidate every cached session (used when a policy secret is reset;
    /// a session keyed to the old secret must not outlive it).
    pub(crate) fn drop_all_sessions(&mut self) {
        let targets: Vec<Handle> = self.sessions.keys().copied().collect();
        for target in targets {
            self.drop_session(target);
        }
    }
}

/// Build the request trailer for one session.
fn request_auth(
    ordinal: OrdinalEnum,
    params: &[u8],
    session: &AuthSession,
    nonce_odd: [u8; NONCE_SIZE],
    continue_auth: bool,
    secret: &[u8; SHA1_DIGEST_SIZE],
) -> CmdAuth {
    let in_digest = sha1(&[&(ordinal as u32).to_be_bytes(), params]);
    let auth_code = hmac_sha1(
        secret,
        &[
            &in_digest,
            &session.nonce_even,
            &nonce_odd,
            &[continue_auth as u8],
        ],
    );
    CmdAuth::new(session.handle, nonce_odd, continue_auth, auth_code)
}

/// Verify the authority's proof over the reply parameters. A mismatch is
/// `AuthFail` - never any other kind - and the caller tears the session
/// down.
pub(crate) fn verify_reply_auth(
    ordinal: OrdinalEnum,
    out_params: &[u8],
    reply_auth: &ReplyAuth,
    nonce_odd: [u8; NONCE_SIZE],
    secret: &[u8; SHA1_DIGEST_SIZE],
) -> TssResult<()> {
    let out_digest = sha1(&[
        &0u32.to_be_bytes(),
        &(ordinal as u32).to_be_bytes(),
        out_params,
    ]);
    let expected = hmac_sha1(
        secret,
        &[
            &out_digest,
            &reply_auth.nonce_even,
            &nonce_odd,
            &[reply_auth.continue_auth],
        ],
    );
    if expected != reply_auth.auth_code {
        tracing::error!(?ordinal, "reply authorization code mismatch");
        return Err(TssError::AuthFail);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_auth_is_keyed_by_secret() {
        let session = AuthSession {
            handle: 1,
            nonce_even: [0x11; NONCE_SIZE],
        };
        let a = request_auth(
            OrdinalEnum::LoadKey2,
            b"params",
            &session,
            [0x22; NONCE_SIZE],
            true,
            &[0x01; SHA1_DIGEST_SIZE],
        );
        let b = request_auth(
            OrdinalEnum::LoadKey2,
            b"params",
            &session,
            [0x22; NONCE_SIZE],
            true,
            &[0x02; SHA1_DIGEST_SIZE],
        );
        assert_ne!(a.auth_code, b.auth_code);
    }

    #[test]
    fn test_verify_reply_auth_detects_tamper() {
        let secret = [0x07; SHA1_DIGEST_SIZE];
        let nonce_odd = [0x33; NONCE_SIZE];
        let nonce_even = [0x44; NONCE_SIZE];
        let out_params = b"out";

        let out_digest = sha1(&[
            &0u32.to_be_bytes(),
            &(OrdinalEnum::GetPubKey as u32).to_be_bytes(),
            out_params,
        ]);
        let good = hmac_sha1(&secret, &[&out_digest, &nonce_even, &nonce_odd, &[1]]);
        let reply = ReplyAuth::new(nonce_even, true, good);
        assert!(
            verify_reply_auth(OrdinalEnum::GetPubKey, out_params, &reply, nonce_odd, &secret)
                .is_ok()
        );

        // One flipped byte in the code is AuthFail, not any other kind.
        let mut bad = good;
        bad[0] ^= 0xff;
        let reply = ReplyAuth::new(nonce_even, true, bad);
        assert!(matches!(
            verify_reply_auth(OrdinalEnum::GetPubKey, out_params, &reply, nonce_odd, &secret),
            Err(TssError::AuthFail)
        ));
    }
}
