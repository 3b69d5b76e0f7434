// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process software TPM 1.2 authority.
//!
//! [`SoftTpm`] consumes command frames and produces reply frames over the
//! types of [`tpm12_proto`], playing the device end of a Command Channel.
//! It genuinely verifies the authorization protocol: every authorized
//! command is checked against the rolling nonce pair and the HMAC-SHA1
//! proof, OSAP shared secrets are derived exactly as a hardware TPM derives
//! them, and migration tickets are bound to an internal proof value and
//! consumed on first use.
//!
//! Key material is synthetic (seeds expanded with SHA-1 MGF1 rather than
//! RSA primes), but the wrapping discipline is real: a child blob is masked
//! under its parent's private seed and is undecipherable - and unloadable -
//! anywhere that parent is absent.

mod crypt;

use crypt::hmac_sha1;
use crypt::mgf1;
use crypt::sha1;
use crypt::xor_mask;
use std::collections::HashMap;
use std::collections::HashSet;
use tpm12_proto::AuthDataUsage;
use tpm12_proto::AuthorizeMigrationKeyParams;
use tpm12_proto::CapArea;
use tpm12_proto::CmdAuth;
use tpm12_proto::CommandFrame;
use tpm12_proto::ConvertMigrationBlobParams;
use tpm12_proto::CreateMigrationBlobParams;
use tpm12_proto::CreateMigrationBlobReply;
use tpm12_proto::CreateWrapKeyParams;
use tpm12_proto::EntityType;
use tpm12_proto::EstablishTransportReply;
use tpm12_proto::ExtendParams;
use tpm12_proto::FlushSpecificParams;
use tpm12_proto::FrameError;
use tpm12_proto::GetCapabilityParams;
use tpm12_proto::Key12;
use tpm12_proto::KeyFlags;
use tpm12_proto::KeyUsage;
use tpm12_proto::MigrationKeyAuth;
use tpm12_proto::NONCE_SIZE;
use tpm12_proto::NvDefineSpaceParams;
use tpm12_proto::NvPermission;
use tpm12_proto::NvReadValueParams;
use tpm12_proto::NvWriteValueParams;
use tpm12_proto::OiapReply;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::OsapParams;
use tpm12_proto::OsapReply;
use tpm12_proto::Reader;
use tpm12_proto::ReplyAuth;
use tpm12_proto::ResourceType;
use tpm12_proto::ReturnCode;
use tpm12_proto::SHA1_DIGEST_SIZE;
use tpm12_proto::SizedBuffer;
use tpm12_proto::TPM12_KH_SRK;
use tpm12_proto::TpmVersion;
use tpm12_proto::build_reply;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Secrets and policy knobs for a fresh software TPM.
///
/// Test suites pass their well-known secrets in here; nothing in this crate
/// hardcodes them.
#[derive(Debug, Clone)]
pub struct SoftTpmConfig {
    /// The owner authorization secret (already SHA-1 width).
    pub owner_secret: [u8; SHA1_DIGEST_SIZE],
    /// The SRK usage secret.
    pub srk_secret: [u8; SHA1_DIGEST_SIZE],
    /// TPM version reported by GetCapability.
    pub version: TpmVersion,
}

impl Default for SoftTpmConfig {
    fn default() -> Self {
        Self {
            owner_secret: [0u8; SHA1_DIGEST_SIZE],
            srk_secret: [0u8; SHA1_DIGEST_SIZE],
            version: TpmVersion {
                major: 1,
                minor: 2,
                rev_major: 3,
                rev_minor: 0,
            },
        }
    }
}

const PCR_COUNT: usize = 24;

// Layout of the plaintext sealed inside a wrapped key's enc_data:
// magic, migratable flag, usage secret, migration secret, private seed.
const WRAP_MAGIC: [u8; 4] = *b"K12W";
const WRAP_PLAINTEXT_SIZE: usize = 4 + 1 + 3 * SHA1_DIGEST_SIZE;

struct KeySlot {
    usage: KeyUsage,
    #[expect(dead_code, reason = "kept for parity with the loaded blob")]
    flags: KeyFlags,
    #[expect(dead_code, reason = "kept for parity with the loaded blob")]
    auth_data_usage: AuthDataUsage,
    usage_secret: [u8; SHA1_DIGEST_SIZE],
    #[expect(dead_code, reason = "verified from the unwrapped blob instead")]
    migration_secret: [u8; SHA1_DIGEST_SIZE],
    priv_seed: [u8; SHA1_DIGEST_SIZE],
    pub_key: Vec<u8>,
}

enum SessionKind {
    Oiap,
    Osap {
        shared_secret: [u8; SHA1_DIGEST_SIZE],
        entity_value: u32,
    },
}

struct Session {
    kind: SessionKind,
    nonce_even: [u8; NONCE_SIZE],
}

struct NvArea {
    permission: NvPermission,
    data: Vec<u8>,
    written: bool,
}

struct Transport {
    log_digest: [u8; SHA1_DIGEST_SIZE],
    ordinals: Vec<u32>,
}

/// The authority. One instance models one TPM with its own SRK, owner and
/// internal proof value.
pub struct SoftTpm {
    owner_secret: [u8; SHA1_DIGEST_SIZE],
    tpm_proof: [u8; SHA1_DIGEST_SIZE],
    version: TpmVersion,
    keys: HashMap<u32, KeySlot>,
    sessions: HashMap<u32, Session>,
    nv: HashMap<u32, NvArea>,
    pcrs: [[u8; SHA1_DIGEST_SIZE]; PCR_COUNT],
    transport: Option<(u32, Transport)>,
    issued_tickets: HashSet<[u8; SHA1_DIGEST_SIZE]>,
    next_handle: u32,
}

impl SoftTpm {
    /// Create a TPM with a resident SRK bound to the configured secrets.
    pub fn new(config: SoftTpmConfig) -> Self {
        let mut tpm_proof = [0u8; SHA1_DIGEST_SIZE];
        getrandom::fill(&mut tpm_proof).expect("rng failure");
        let mut srk_seed = [0u8; SHA1_DIGEST_SIZE];
        getrandom::fill(&mut srk_seed).expect("rng failure");

        let srk = KeySlot {
            usage: KeyUsage::Storage,
            flags: KeyFlags::new(),
            auth_data_usage: AuthDataUsage::Always,
            usage_secret: config.srk_secret,
            migration_secret: [0u8; SHA1_DIGEST_SIZE],
            pub_key: derive_pub_key(&srk_seed, 2048),
            priv_seed: srk_seed,
        };

        let mut keys = HashMap::new();
        keys.insert(TPM12_KH_SRK, srk);

        Self {
            owner_secret: config.owner_secret,
            tpm_proof,
            version: config.version,
            keys,
            sessions: HashMap::new(),
            nv: HashMap::new(),
            pcrs: [[0u8; SHA1_DIGEST_SIZE]; PCR_COUNT],
            transport: None,
            issued_tickets: HashSet::new(),
            next_handle: 0x0200_0000,
        }
    }

    /// Execute one command frame and produce the reply frame.
    pub fn execute_command(&mut self, command: &[u8]) -> Vec<u8> {
        let ordinal = match peek_ordinal(command) {
            Some(ordinal) => ordinal,
            None => return error_reply(ReturnCode::BadOrdinal),
        };

        let frame = match CommandFrame::parse(command, handle_count(ordinal)) {
            Ok(frame) => frame,
            Err(FrameError::BadTag(_)) => return error_reply(ReturnCode::BadTag),
            Err(FrameError::BadOrdinal(_)) => return error_reply(ReturnCode::BadOrdinal),
            Err(err) => {
                tracing::debug!(err = &err as &dyn std::error::Error, "malformed command");
                return error_reply(ReturnCode::BadParameter);
            }
        };

        let reply = match ordinal {
            OrdinalEnum::Oiap => self.cmd_oiap(frame),
            OrdinalEnum::Osap => self.cmd_osap(frame),
            OrdinalEnum::TerminateHandle => self.cmd_terminate_handle(frame),
            OrdinalEnum::FlushSpecific => self.cmd_flush_specific(frame),
            OrdinalEnum::CreateWrapKey => self.cmd_create_wrap_key(frame),
            OrdinalEnum::LoadKey2 => self.cmd_load_key2(frame),
            OrdinalEnum::GetPubKey => self.cmd_get_pub_key(frame),
            OrdinalEnum::AuthorizeMigrationKey => self.cmd_authorize_migration_key(frame),
            OrdinalEnum::CreateMigrationBlob => self.cmd_create_migration_blob(frame),
            OrdinalEnum::ConvertMigrationBlob => self.cmd_convert_migration_blob(frame),
            OrdinalEnum::NvDefineSpace => self.cmd_nv_define_space(frame),
            OrdinalEnum::NvWriteValue => self.cmd_nv_write_value(frame),
            OrdinalEnum::NvReadValue => self.cmd_nv_read_value(frame),
            OrdinalEnum::GetCapability => self.cmd_get_capability(frame),
            OrdinalEnum::GetRandom => self.cmd_get_random(frame),
            OrdinalEnum::PcrRead => self.cmd_pcr_read(frame),
            OrdinalEnum::Extend => self.cmd_extend(frame),
            OrdinalEnum::EstablishTransport => self.cmd_establish_transport(frame),
            OrdinalEnum::ExecuteTransport => self.cmd_execute_transport(frame),
            OrdinalEnum::ReleaseTransportSigned => self.cmd_release_transport_signed(frame),
        };

        match reply {
            Ok(reply) => reply,
            Err(code) => {
                tracing::debug!(?ordinal, ?code, "command rejected");
                error_reply(code)
            }
        }
    }

    // === Sessions === //

    fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn cmd_oiap(&mut self, _frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let handle = self.alloc_handle();
        let nonce_even = fresh_nonce();
        self.sessions.insert(
            handle,
            Session {
                kind: SessionKind::Oiap,
                nonce_even,
            },
        );

        let reply = OiapReply {
            auth_handle: handle.into(),
            nonce_even,
        };
        Ok(build_reply(ReturnCode::Success, reply.as_bytes(), &[]))
    }

    fn cmd_osap(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let params =
            OsapParams::read_from_bytes(&frame.params[..]).map_err(|_| ReturnCode::BadParameter)?;
        let entity_type =
            EntityType::from_u16(params.entity_type.get()).ok_or(ReturnCode::WrongEntityType)?;
        let entity_value = params.entity_value.get();

        let entity_secret = match entity_type {
            EntityType::Owner => self.owner_secret,
            EntityType::Srk => self.key(TPM12_KH_SRK)?.usage_secret,
            EntityType::KeyHandle => self.key(entity_value)?.usage_secret,
            EntityType::NvIndex => return Err(ReturnCode::WrongEntityType),
        };

        let nonce_even = fresh_nonce();
        let nonce_even_osap = fresh_nonce();
        let shared_secret =
            hmac_sha1(&entity_secret, &[&nonce_even_osap, &params.nonce_odd_osap]);

        let handle = self.alloc_handle();
        self.sessions.insert(
            handle,
            Session {
                kind: SessionKind::Osap {
                    shared_secret,
                    entity_value,
                },
                nonce_even,
            },
        );

        let reply = OsapReply {
            auth_handle: handle.into(),
            nonce_even,
            nonce_even_osap,
        };
        Ok(build_reply(ReturnCode::Success, reply.as_bytes(), &[]))
    }

    fn cmd_terminate_handle(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let handle = read_u32_param(&frame.params)?;
        self.sessions
            .remove(&handle)
            .ok_or(ReturnCode::InvalidAuthHandle)?;
        Ok(build_reply(ReturnCode::Success, &[], &[]))
    }

    fn key(&self, handle: u32) -> Result<&KeySlot, ReturnCode> {
        self.keys.get(&handle).ok_or(ReturnCode::InvalidKeyHandle)
    }

    /// Verify a request authorization trailer against `entity_secret` (OSAP
    /// sessions substitute their shared secret). Destroys the session on a
    /// proof mismatch; the nonce pair is consumed either way.
    fn authorize(
        &mut self,
        ordinal: OrdinalEnum,
        params: &[u8],
        auth: &CmdAuth,
        entity_secret: [u8; SHA1_DIGEST_SIZE],
        failure: ReturnCode,
    ) -> Result<PendingAuth, ReturnCode> {
        let handle = auth.auth_handle.get();
        let session = self
            .sessions
            .get(&handle)
            .ok_or(ReturnCode::InvalidAuthHandle)?;

        let secret = match &session.kind {
            SessionKind::Oiap => entity_secret,
            SessionKind::Osap { shared_secret, .. } => *shared_secret,
        };

        let in_digest = sha1(&[&(ordinal as u32).to_be_bytes(), params]);
        let expected = hmac_sha1(
            &secret,
            &[
                &in_digest,
                &session.nonce_even,
                &auth.nonce_odd,
                &[auth.continue_auth],
            ],
        );

        if expected != auth.auth_code {
            self.sessions.remove(&handle);
            return Err(failure);
        }

        Ok(PendingAuth {
            handle,
            secret,
            nonce_odd: auth.nonce_odd,
            continue_auth: auth.continue_auth != 0,
        })
    }

    /// Produce the reply trailer for a verified session, rolling its nonce,
    /// and destroy it unless the caller asked to continue.
    fn complete_auth(
        &mut self,
        pending: &PendingAuth,
        ordinal: OrdinalEnum,
        out_params: &[u8],
    ) -> ReplyAuth {
        let nonce_even = fresh_nonce();
        let out_digest = sha1(&[
            &(ReturnCode::Success as u32).to_be_bytes(),
            &(ordinal as u32).to_be_bytes(),
            out_params,
        ]);
        let auth_code = hmac_sha1(
            &pending.secret,
            &[
                &out_digest,
                &nonce_even,
                &pending.nonce_odd,
                &[pending.continue_auth as u8],
            ],
        );

        if pending.continue_auth {
            if let Some(session) = self.sessions.get_mut(&pending.handle) {
                session.nonce_even = nonce_even;
            }
        } else {
            self.sessions.remove(&pending.handle);
        }

        ReplyAuth::new(nonce_even, pending.continue_auth, auth_code)
    }

    /// Drop the sessions referenced by a failed command; a consumed nonce
    /// pair must never be reused.
    fn fail_sessions(&mut self, frame: &CommandFrame) {
        for auth in [&frame.auth1, &frame.auth2].into_iter().flatten() {
            self.sessions.remove(&auth.auth_handle.get());
        }
    }

    /// Run an authorized single-session command body.
    fn authorized1<F>(
        &mut self,
        frame: &CommandFrame,
        entity_secret: [u8; SHA1_DIGEST_SIZE],
        body: F,
    ) -> Result<Vec<u8>, ReturnCode>
    where
        F: FnOnce(&mut Self) -> Result<Vec<u8>, ReturnCode>,
    {
        let auth = frame.auth1.as_ref().ok_or(ReturnCode::BadTag)?;
        let pending = self.authorize(
            frame.ordinal,
            &frame.params,
            auth,
            entity_secret,
            ReturnCode::AuthFail,
        )?;

        match body(self) {
            Ok(out_params) => {
                let reply_auth = self.complete_auth(&pending, frame.ordinal, &out_params);
                Ok(build_reply(ReturnCode::Success, &out_params, &[reply_auth]))
            }
            Err(code) => {
                self.sessions.remove(&pending.handle);
                Err(code)
            }
        }
    }

    // === Keys === //

    fn cmd_create_wrap_key(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let parent_handle = frame.handles[0];
        let parent = self.key(parent_handle)?;
        if parent.usage != KeyUsage::Storage {
            self.fail_sessions(&frame);
            return Err(ReturnCode::InvalidKeyHandle);
        }
        let parent_seed = parent.priv_seed;
        let parent_secret = parent.usage_secret;

        let auth = frame.auth1.as_ref().ok_or(ReturnCode::BadTag)?;

        // CreateWrapKey requires an OSAP session bound to the parent: the
        // shared secret doubles as the ADIP key for the new auth values.
        let (adip_nonce_even, osap_entity) = match self.sessions.get(&auth.auth_handle.get()) {
            Some(Session {
                kind: SessionKind::Osap { entity_value, .. },
                nonce_even,
            }) => (*nonce_even, *entity_value),
            Some(_) => {
                self.fail_sessions(&frame);
                return Err(ReturnCode::WrongEntityType);
            }
            None => return Err(ReturnCode::InvalidAuthHandle),
        };
        if osap_entity != parent_handle {
            self.fail_sessions(&frame);
            return Err(ReturnCode::WrongEntityType);
        }

        let pending = self.authorize(
            frame.ordinal,
            &frame.params,
            auth,
            parent_secret,
            ReturnCode::AuthFail,
        )?;

        let params = match CreateWrapKeyParams::deserialize(&frame.params) {
            Some(params) => params,
            None => {
                self.sessions.remove(&pending.handle);
                return Err(ReturnCode::BadParameter);
            }
        };

        // ADIP: the new secrets travel XOR-masked under the shared secret
        // and the session nonces.
        let mut usage_secret = params.data_usage_auth;
        xor_mask(
            &mut usage_secret,
            &sha1(&[&pending.secret, &adip_nonce_even]),
        );
        let mut migration_secret = params.data_migration_auth;
        xor_mask(
            &mut migration_secret,
            &sha1(&[&pending.secret, &pending.nonce_odd]),
        );

        let key_bits = params
            .key_info
            .parms
            .rsa_key_bits()
            .unwrap_or(2048)
            .clamp(512, 4096);
        let mut priv_seed = [0u8; SHA1_DIGEST_SIZE];
        getrandom::fill(&mut priv_seed).expect("rng failure");
        let pub_key = derive_pub_key(&priv_seed, key_bits);

        let flags = params.key_info.flags();
        let enc_data = wrap_key_material(
            &parent_seed,
            flags.migratable(),
            &usage_secret,
            &migration_secret,
            &priv_seed,
        );

        let mut wrapped = params.key_info;
        wrapped.pub_key = SizedBuffer::new(&pub_key).map_err(|_| ReturnCode::Fail)?;
        wrapped.enc_data = SizedBuffer::new(&enc_data).map_err(|_| ReturnCode::Fail)?;
        let out_params = wrapped.serialize();

        let reply_auth = self.complete_auth(&pending, frame.ordinal, &out_params);
        Ok(build_reply(ReturnCode::Success, &out_params, &[reply_auth]))
    }

    fn cmd_load_key2(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let parent_handle = frame.handles[0];
        let parent = self.key(parent_handle)?;
        let parent_seed = parent.priv_seed;
        let parent_secret = parent.usage_secret;

        let key = Key12::from_blob(&frame.params).ok_or(ReturnCode::BadParameter)?;
        self.authorized1(&frame, parent_secret, move |tpm| {
            let material = unwrap_key_material(&parent_seed, key.enc_data.contents())
                .ok_or(ReturnCode::BadParameter)?;
            let usage = KeyUsage::from_u16(key.key_usage.get()).ok_or(ReturnCode::BadParameter)?;

            let handle = tpm.alloc_handle();
            tpm.keys.insert(
                handle,
                KeySlot {
                    usage,
                    flags: key.flags(),
                    auth_data_usage: if key.auth_data_usage == 0 {
                        AuthDataUsage::Never
                    } else {
                        AuthDataUsage::Always
                    },
                    usage_secret: material.usage_secret,
                    migration_secret: material.migration_secret,
                    priv_seed: material.priv_seed,
                    pub_key: key.pub_key.contents().to_vec(),
                },
            );

            Ok(handle.to_be_bytes().to_vec())
        })
    }

    fn cmd_get_pub_key(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let key_handle = frame.handles[0];
        let key = self.key(key_handle)?;
        let secret = key.usage_secret;
        let pub_key = key.pub_key.clone();

        self.authorized1(&frame, secret, move |_| {
            Ok(SizedBuffer::new(&pub_key)
                .map_err(|_| ReturnCode::Fail)?
                .serialize())
        })
    }

    fn cmd_flush_specific(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let params = FlushSpecificParams::read_from_bytes(&frame.params[..])
            .map_err(|_| ReturnCode::BadParameter)?;
        let handle = params.handle.get();

        match params.resource_type.get() {
            x if x == ResourceType::Key as u32 => {
                if handle == TPM12_KH_SRK {
                    return Err(ReturnCode::BadParameter);
                }
                self.keys
                    .remove(&handle)
                    .ok_or(ReturnCode::InvalidKeyHandle)?;
            }
            x if x == ResourceType::Auth as u32 => {
                self.sessions
                    .remove(&handle)
                    .ok_or(ReturnCode::InvalidAuthHandle)?;
            }
            x if x == ResourceType::Transport as u32 => match self.transport.take() {
                Some((h, _)) if h == handle => {}
                other => {
                    self.transport = other;
                    return Err(ReturnCode::BadParameter);
                }
            },
            _ => return Err(ReturnCode::BadParameter),
        }

        Ok(build_reply(ReturnCode::Success, &[], &[]))
    }

    // === Migration === //

    fn cmd_authorize_migration_key(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let owner_secret = self.owner_secret;
        let params = AuthorizeMigrationKeyParams::deserialize(&frame.params)
            .ok_or(ReturnCode::BadParameter)?;
        let tpm_proof = self.tpm_proof;

        let scheme = params.migration_scheme;
        let migration_key = params.migration_key;
        self.authorized1(&frame, owner_secret, move |tpm| {
            let digest = ticket_digest(&tpm_proof, migration_key.contents(), scheme.get());
            tpm.issued_tickets.insert(digest);

            let ticket = MigrationKeyAuth {
                migration_key,
                migration_scheme: scheme,
                digest,
            };
            Ok(ticket.serialize())
        })
    }

    fn cmd_create_migration_blob(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let parent_handle = frame.handles[0];
        let parent = self.key(parent_handle)?;
        let parent_seed = parent.priv_seed;
        let parent_secret = parent.usage_secret;

        let auth1 = frame.auth1.as_ref().ok_or(ReturnCode::BadTag)?;
        let auth2 = *frame.auth2.as_ref().ok_or(ReturnCode::BadTag)?;

        let pending1 = self.authorize(
            frame.ordinal,
            &frame.params,
            auth1,
            parent_secret,
            ReturnCode::AuthFail,
        )?;

        // From here on, a failure must consume both referenced sessions.
        macro_rules! fail {
            ($code:expr) => {{
                self.sessions.remove(&pending1.handle);
                self.sessions.remove(&auth2.auth_handle.get());
                return Err($code);
            }};
        }

        let params = match CreateMigrationBlobParams::deserialize(&frame.params) {
            Some(params) => params,
            None => fail!(ReturnCode::BadParameter),
        };

        // The migrating key's secrets live inside its parent-wrapped blob;
        // only after unwrapping can the second session be verified.
        let material = match unwrap_key_material(&parent_seed, params.enc_data.contents()) {
            Some(material) => material,
            None => fail!(ReturnCode::BadParameter),
        };

        let pending2 = match self.authorize(
            frame.ordinal,
            &frame.params,
            &auth2,
            material.migration_secret,
            ReturnCode::Auth2Fail,
        ) {
            Ok(pending2) => pending2,
            Err(code) => fail!(code),
        };

        if !material.migratable {
            fail!(ReturnCode::MigrateFail);
        }

        let ticket = match MigrationKeyAuth::from_blob(params.migration_key_auth.contents()) {
            Some(ticket) => ticket,
            None => fail!(ReturnCode::BadParameter),
        };
        if params.migration_type.get() != ticket.migration_scheme.get() {
            fail!(ReturnCode::BadScheme);
        }

        // The ticket must be one this TPM issued and not yet consumed.
        let expected = ticket_digest(
            &self.tpm_proof,
            ticket.migration_key.contents(),
            ticket.migration_scheme.get(),
        );
        if expected != ticket.digest || !self.issued_tickets.remove(&expected) {
            fail!(ReturnCode::MigrateFail);
        }

        // Blind the plaintext under the authority key and a fresh random:
        // holders of the authority key still need the random to unmask.
        let mut plaintext = wrap_plaintext(&material);
        let mut random = vec![0u8; plaintext.len()];
        getrandom::fill(&mut random).expect("rng failure");
        xor_mask(&mut plaintext, &migration_mask(ticket.migration_key.contents()));
        xor_mask(&mut plaintext, &random);

        let reply = CreateMigrationBlobReply {
            random: SizedBuffer::new(&random).map_err(|_| ReturnCode::Fail)?,
            out_data: SizedBuffer::new(&plaintext).map_err(|_| ReturnCode::Fail)?,
        };
        let out_params = reply.serialize();

        let reply_auth1 = self.complete_auth(&pending1, frame.ordinal, &out_params);
        let reply_auth2 = self.complete_auth(&pending2, frame.ordinal, &out_params);
        Ok(build_reply(
            ReturnCode::Success,
            &out_params,
            &[reply_auth1, reply_auth2],
        ))
    }

    fn cmd_convert_migration_blob(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let parent_handle = frame.handles[0];
        let parent = self.key(parent_handle)?;
        let parent_seed = parent.priv_seed;
        let parent_secret = parent.usage_secret;
        let parent_pub = parent.pub_key.clone();

        let params = ConvertMigrationBlobParams::deserialize(&frame.params)
            .ok_or(ReturnCode::BadParameter)?;

        self.authorized1(&frame, parent_secret, move |_| {
            if params.in_data.size.get() != params.random.size.get() {
                return Err(ReturnCode::BadParameter);
            }

            // Unblind with the random, then strip the authority mask; the
            // destination parent is the migration authority key.
            let mut plaintext = params.in_data.contents().to_vec();
            xor_mask(&mut plaintext, params.random.contents());
            xor_mask(&mut plaintext, &migration_mask(&parent_pub));

            let material = parse_wrap_plaintext(&plaintext).ok_or(ReturnCode::MigrateFail)?;

            let enc_data = wrap_key_material(
                &parent_seed,
                material.migratable,
                &material.usage_secret,
                &material.migration_secret,
                &material.priv_seed,
            );
            Ok(SizedBuffer::new(&enc_data)
                .map_err(|_| ReturnCode::Fail)?
                .serialize())
        })
    }

    // === NV storage === //

    fn cmd_nv_define_space(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let owner_secret = self.owner_secret;
        let params = NvDefineSpaceParams::read_from_bytes(&frame.params[..])
            .map_err(|_| ReturnCode::BadParameter)?;
        let index = params.pub_info.index.get();
        let data_size = params.pub_info.data_size.get() as usize;
        let permission = NvPermission::from(params.pub_info.permission.get());

        let define = move |tpm: &mut Self| {
            if data_size == 0 {
                // Size zero releases the index.
                tpm.nv.remove(&index).ok_or(ReturnCode::BadIndex)?;
                return Ok(Vec::new());
            }
            if tpm.nv.contains_key(&index) {
                return Err(ReturnCode::AreaLocked);
            }
            tpm.nv.insert(
                index,
                NvArea {
                    permission,
                    data: vec![0u8; data_size],
                    written: false,
                },
            );
            Ok(Vec::new())
        };

        if frame.auth1.is_some() {
            self.authorized1(&frame, owner_secret, define)
        } else {
            let out = define(self)?;
            Ok(build_reply(ReturnCode::Success, &out, &[]))
        }
    }

    fn cmd_nv_write_value(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let owner_secret = self.owner_secret;
        let params =
            NvWriteValueParams::deserialize(&frame.params).ok_or(ReturnCode::BadParameter)?;
        let index = params.index.get();
        let offset = params.offset.get() as usize;

        let area = self.nv.get(&index).ok_or(ReturnCode::BadIndex)?;
        if area.permission.ownerwrite() && frame.auth1.is_none() {
            return Err(ReturnCode::NoNvPermission);
        }

        let write = move |tpm: &mut Self| {
            let area = tpm.nv.get_mut(&index).ok_or(ReturnCode::BadIndex)?;
            let data = params.data.contents();
            if offset + data.len() > area.data.len() {
                return Err(ReturnCode::NoSpace);
            }
            area.data[offset..offset + data.len()].copy_from_slice(data);
            area.written = true;
            Ok(Vec::new())
        };

        if frame.auth1.is_some() {
            self.authorized1(&frame, owner_secret, write)
        } else {
            let out = write(self)?;
            Ok(build_reply(ReturnCode::Success, &out, &[]))
        }
    }

    fn cmd_nv_read_value(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let owner_secret = self.owner_secret;
        let params = NvReadValueParams::read_from_bytes(&frame.params[..])
            .map_err(|_| ReturnCode::BadParameter)?;
        let index = params.index.get();
        let offset = params.offset.get() as usize;
        let size = params.size.get() as usize;

        let area = self.nv.get(&index).ok_or(ReturnCode::BadIndex)?;
        if area.permission.ownerread() && frame.auth1.is_none() {
            return Err(ReturnCode::NoNvPermission);
        }

        let read = move |tpm: &mut Self| {
            let area = tpm.nv.get(&index).ok_or(ReturnCode::BadIndex)?;
            if !area.written {
                return Err(ReturnCode::BadParameter);
            }
            if offset + size > area.data.len() {
                return Err(ReturnCode::NoSpace);
            }
            Ok(SizedBuffer::new(&area.data[offset..offset + size])
                .map_err(|_| ReturnCode::Fail)?
                .serialize())
        };

        if frame.auth1.is_some() {
            self.authorized1(&frame, owner_secret, read)
        } else {
            let out = read(self)?;
            Ok(build_reply(ReturnCode::Success, &out, &[]))
        }
    }

    // === Capability, random, PCRs === //

    fn cmd_get_capability(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let params =
            GetCapabilityParams::deserialize(&frame.params).ok_or(ReturnCode::BadParameter)?;
        let area = CapArea::from_u32(params.cap_area.get()).ok_or(ReturnCode::BadParameter)?;

        let resp = match area {
            CapArea::VersionVal => self.version.as_bytes().to_vec(),
            CapArea::Ord => {
                let ordinal = u32::from_be_bytes(
                    params
                        .sub_cap
                        .contents()
                        .try_into()
                        .map_err(|_| ReturnCode::BadParameter)?,
                );
                vec![OrdinalEnum::from_u32(ordinal).is_some() as u8]
            }
            CapArea::Property => {
                let property = u32::from_be_bytes(
                    params
                        .sub_cap
                        .contents()
                        .try_into()
                        .map_err(|_| ReturnCode::BadParameter)?,
                );
                match property {
                    // TPM_CAP_PROP_PCR
                    0x0101 => (PCR_COUNT as u32).to_be_bytes().to_vec(),
                    // TPM_CAP_PROP_MANUFACTURER
                    0x0103 => b"SOFT".to_vec(),
                    _ => return Err(ReturnCode::BadParameter),
                }
            }
        };

        let out = SizedBuffer::new(&resp)
            .map_err(|_| ReturnCode::Fail)?
            .serialize();
        Ok(build_reply(ReturnCode::Success, &out, &[]))
    }

    fn cmd_get_random(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let requested = read_u32_param(&frame.params)? as usize;
        let mut bytes = vec![0u8; requested.min(tpm12_proto::MAX_SIZED_BUFFER)];
        getrandom::fill(&mut bytes).expect("rng failure");

        let out = SizedBuffer::new(&bytes)
            .map_err(|_| ReturnCode::Fail)?
            .serialize();
        Ok(build_reply(ReturnCode::Success, &out, &[]))
    }

    fn cmd_pcr_read(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let index = read_u32_param(&frame.params)? as usize;
        let value = self.pcrs.get(index).ok_or(ReturnCode::BadIndex)?;
        Ok(build_reply(ReturnCode::Success, value, &[]))
    }

    fn cmd_extend(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let params = ExtendParams::read_from_bytes(&frame.params[..])
            .map_err(|_| ReturnCode::BadParameter)?;
        let index = params.pcr_index.get() as usize;
        let current = *self.pcrs.get(index).ok_or(ReturnCode::BadIndex)?;
        let next = sha1(&[&current, &params.in_digest]);
        self.pcrs[index] = next;
        Ok(build_reply(ReturnCode::Success, &next, &[]))
    }

    // === Transport === //

    fn cmd_establish_transport(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let wrap_handle = frame.handles[0];
        let wrap_secret = self.key(wrap_handle)?.usage_secret;

        if self.transport.is_some() {
            self.fail_sessions(&frame);
            return Err(ReturnCode::AuthConflict);
        }

        let handle = self.alloc_handle();
        let result = self.authorized1(&frame, wrap_secret, move |_| {
            let reply = EstablishTransportReply {
                trans_handle: handle.into(),
            };
            Ok(reply.as_bytes().to_vec())
        })?;

        self.transport = Some((
            handle,
            Transport {
                log_digest: [0u8; SHA1_DIGEST_SIZE],
                ordinals: Vec::new(),
            },
        ));
        Ok(result)
    }

    fn cmd_execute_transport(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let mut reader = Reader::new(&frame.params);
        let wrapped = SizedBuffer::deserialize(&mut reader).ok_or(ReturnCode::BadParameter)?;
        if !reader.finish() {
            return Err(ReturnCode::BadParameter);
        }
        if self.transport.is_none() {
            return Err(ReturnCode::BadParameter);
        }

        let inner_cmd = wrapped.contents().to_vec();
        let inner_rsp = self.execute_command(&inner_cmd);

        // Both halves of the round-trip enter the rolling audit log.
        if let Some((_, transport)) = self.transport.as_mut() {
            transport.log_digest = sha1(&[
                &transport.log_digest,
                &sha1(&[&inner_cmd]),
                &sha1(&[&inner_rsp]),
            ]);
            if let Some(ordinal) = peek_ordinal(&inner_cmd) {
                transport.ordinals.push(ordinal as u32);
            }
        }

        let out = SizedBuffer::new(&inner_rsp)
            .map_err(|_| ReturnCode::Fail)?
            .serialize();
        Ok(build_reply(ReturnCode::Success, &out, &[]))
    }

    fn cmd_release_transport_signed(&mut self, frame: CommandFrame) -> Result<Vec<u8>, ReturnCode> {
        let signing_handle = frame.handles[0];
        let signing_secret = self.key(signing_handle)?.usage_secret;

        let anti_replay: [u8; SHA1_DIGEST_SIZE] = match frame.params[..].try_into() {
            Ok(anti_replay) => anti_replay,
            Err(_) => {
                self.fail_sessions(&frame);
                return Err(ReturnCode::BadParameter);
            }
        };

        let signature = match self.transport.as_ref() {
            Some((_, transport)) => transport_signature(
                &signing_secret,
                &transport.log_digest,
                &transport.ordinals,
                &anti_replay,
            ),
            None => {
                self.fail_sessions(&frame);
                return Err(ReturnCode::BadParameter);
            }
        };

        let result = self.authorized1(&frame, signing_secret, move |_| {
            Ok(SizedBuffer::new(&signature)
                .map_err(|_| ReturnCode::Fail)?
                .serialize())
        })?;

        // The session closes only once the caller proved knowledge of the
        // signing secret.
        self.transport = None;
        Ok(result)
    }
}

struct PendingAuth {
    handle: u32,
    secret: [u8; SHA1_DIGEST_SIZE],
    nonce_odd: [u8; NONCE_SIZE],
    continue_auth: bool,
}

struct KeyMaterial {
    migratable: bool,
    usage_secret: [u8; SHA1_DIGEST_SIZE],
    migration_secret: [u8; SHA1_DIGEST_SIZE],
    priv_seed: [u8; SHA1_DIGEST_SIZE],
}

fn fresh_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::fill(&mut nonce).expect("rng failure");
    nonce
}

fn error_reply(code: ReturnCode) -> Vec<u8> {
    build_reply(code, &[], &[])
}

fn read_u32_param(params: &[u8]) -> Result<u32, ReturnCode> {
    let arr: [u8; 4] = params.try_into().map_err(|_| ReturnCode::BadParameter)?;
    Ok(u32::from_be_bytes(arr))
}

fn peek_ordinal(command: &[u8]) -> Option<OrdinalEnum> {
    if command.len() < 10 {
        return None;
    }
    OrdinalEnum::from_u32(u32::from_be_bytes(command[6..10].try_into().ok()?))
}

/// Number of wire handles preceding each ordinal's parameter area.
fn handle_count(ordinal: OrdinalEnum) -> usize {
    match ordinal {
        OrdinalEnum::CreateWrapKey
        | OrdinalEnum::LoadKey2
        | OrdinalEnum::GetPubKey
        | OrdinalEnum::CreateMigrationBlob
        | OrdinalEnum::ConvertMigrationBlob
        | OrdinalEnum::EstablishTransport
        | OrdinalEnum::ReleaseTransportSigned => 1,
        _ => 0,
    }
}

/// Deterministic synthetic public key for a private seed.
fn derive_pub_key(priv_seed: &[u8; SHA1_DIGEST_SIZE], key_bits: u32) -> Vec<u8> {
    mgf1(
        &[priv_seed.as_slice(), b"public"].concat(),
        key_bits as usize / 8,
    )
}

fn wrap_plaintext(material: &KeyMaterial) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(WRAP_PLAINTEXT_SIZE);
    plaintext.extend_from_slice(&WRAP_MAGIC);
    plaintext.push(material.migratable as u8);
    plaintext.extend_from_slice(&material.usage_secret);
    plaintext.extend_from_slice(&material.migration_secret);
    plaintext.extend_from_slice(&material.priv_seed);
    plaintext
}

fn parse_wrap_plaintext(plaintext: &[u8]) -> Option<KeyMaterial> {
    if plaintext.len() != WRAP_PLAINTEXT_SIZE || plaintext[..4] != WRAP_MAGIC {
        return None;
    }
    let mut reader = Reader::new(&plaintext[4..]);
    Some(KeyMaterial {
        migratable: reader.u8()? != 0,
        usage_secret: reader.array()?,
        migration_secret: reader.array()?,
        priv_seed: reader.array()?,
    })
}

/// Seal key material to a parent: the blob is meaningless without the
/// parent's private seed.
fn wrap_key_material(
    parent_seed: &[u8; SHA1_DIGEST_SIZE],
    migratable: bool,
    usage_secret: &[u8; SHA1_DIGEST_SIZE],
    migration_secret: &[u8; SHA1_DIGEST_SIZE],
    priv_seed: &[u8; SHA1_DIGEST_SIZE],
) -> Vec<u8> {
    let mut plaintext = wrap_plaintext(&KeyMaterial {
        migratable,
        usage_secret: *usage_secret,
        migration_secret: *migration_secret,
        priv_seed: *priv_seed,
    });
    let mask = mgf1(
        &[parent_seed.as_slice(), b"storage-wrap"].concat(),
        plaintext.len(),
    );
    xor_mask(&mut plaintext, &mask);
    plaintext
}

fn unwrap_key_material(
    parent_seed: &[u8; SHA1_DIGEST_SIZE],
    enc_data: &[u8],
) -> Option<KeyMaterial> {
    if enc_data.len() != WRAP_PLAINTEXT_SIZE {
        return None;
    }
    let mut plaintext = enc_data.to_vec();
    let mask = mgf1(
        &[parent_seed.as_slice(), b"storage-wrap"].concat(),
        plaintext.len(),
    );
    xor_mask(&mut plaintext, &mask);
    parse_wrap_plaintext(&plaintext)
}

fn migration_mask(authority_pub: &[u8]) -> Vec<u8> {
    let pub_digest = sha1(&[authority_pub]);
    mgf1(
        &[pub_digest.as_slice(), b"migrate"].concat(),
        WRAP_PLAINTEXT_SIZE,
    )
}

fn ticket_digest(
    tpm_proof: &[u8; SHA1_DIGEST_SIZE],
    migration_key: &[u8],
    scheme: u16,
) -> [u8; SHA1_DIGEST_SIZE] {
    hmac_sha1(tpm_proof, &[migration_key, &scheme.to_be_bytes()])
}

/// The signature produced by ReleaseTransportSigned: keyed by the signing
/// key's usage secret over the log digest, the wrapped-ordinal list and the
/// anti-replay nonce.
pub fn transport_signature(
    signing_secret: &[u8; SHA1_DIGEST_SIZE],
    log_digest: &[u8; SHA1_DIGEST_SIZE],
    ordinals: &[u32],
    anti_replay: &[u8; SHA1_DIGEST_SIZE],
) -> [u8; SHA1_DIGEST_SIZE] {
    let ordinal_bytes: Vec<u8> = ordinals.iter().flat_map(|o| o.to_be_bytes()).collect();
    hmac_sha1(
        signing_secret,
        &[log_digest, &sha1(&[&ordinal_bytes]), anti_replay],
    )
}
