// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end conformance tests: the full stack driven against the
//! in-process software authority over the real wire framing.

use parking_lot::Mutex;
use sha1::Digest;
use sha1::Sha1;
use std::sync::Arc;
use tpm12_emulator::SoftTpm;
use tpm12_emulator::SoftTpmConfig;
use tss12::CommandChannel;
use tss12::Context;
use tss12::Handle;
use tss12::InMemoryRegistry;
use tss12::MigrationTicket;
use tss12::ObjectType;
use tss12::PolicyKind;
use tss12::PsType;
use tss12::SecretMode;
use tss12::SharedRegistry;
use tss12::TransportError;
use tss12::TssError;
use tss12::attrib;
use tss12::init;
use tss12::proto::MigrationScheme;
use tss12::proto::NvPermission;
use tss12::proto::ReturnCode;
use tss12::proto::SHA1_DIGEST_SIZE;
use tss12::proto::SRK_UUID;
use tss12::proto::Tpm12Uuid;

const OWNER_SECRET: &[u8] = b"owner-secret";
const SRK_SECRET: &[u8] = b"srk-secret";

fn sha1(data: &[u8]) -> [u8; SHA1_DIGEST_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A Command Channel over a shared in-process authority, so several
/// contexts can talk to the same TPM.
struct SoftChannel(Arc<Mutex<SoftTpm>>);

impl CommandChannel for SoftChannel {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(self.0.lock().execute_command(command))
    }
}

struct Fixture {
    tpm: Arc<Mutex<SoftTpm>>,
    registry: SharedRegistry,
}

impl Fixture {
    fn new() -> Self {
        let config = SoftTpmConfig {
            owner_secret: sha1(OWNER_SECRET),
            srk_secret: sha1(SRK_SECRET),
            ..Default::default()
        };
        Self {
            tpm: Arc::new(Mutex::new(SoftTpm::new(config))),
            registry: Arc::new(Mutex::new(InMemoryRegistry::new())),
        }
    }

    fn context(&self) -> Context {
        let mut ctx = Context::with_registry(self.registry.clone());
        ctx.connect(Box::new(SoftChannel(self.tpm.clone()))).unwrap();
        ctx
    }

    /// Load the SRK and attach its usage secret, the way every test
    /// program begins.
    fn srk(&self, ctx: &mut Context) -> Handle {
        let srk = ctx.load_key_by_uuid(PsType::SYSTEM, SRK_UUID).unwrap();
        let policy = ctx.get_policy_object(srk, PolicyKind::Usage).unwrap();
        ctx.set_policy_secret(policy, SecretMode::Plain, SRK_SECRET)
            .unwrap();
        srk
    }

    fn owner_auth(&self, ctx: &mut Context) {
        let tpm = ctx.tpm().unwrap();
        let policy = ctx.get_policy_object(tpm, PolicyKind::Usage).unwrap();
        ctx.set_policy_secret(policy, SecretMode::Plain, OWNER_SECRET)
            .unwrap();
    }
}

fn new_signing_key(ctx: &mut Context) -> Handle {
    ctx.create_object(
        ObjectType::RsaKey,
        init::KEY_TYPE_SIGNING | init::KEY_SIZE_2048 | init::KEY_NO_AUTHORIZATION,
    )
    .unwrap()
}

#[test]
fn capability_queries() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let version = ctx.tpm_version().unwrap();
    assert_eq!((version.major, version.minor), (1, 2));

    // Ordinal support query.
    let supported = ctx
        .get_capability(
            tss12::proto::CapArea::Ord,
            &(tss12::proto::OrdinalEnum::LoadKey2 as u32).to_be_bytes(),
        )
        .unwrap();
    assert_eq!(supported, vec![1]);
}

#[test]
fn random_bytes_come_back_fresh() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let a = ctx.get_random(16).unwrap();
    let b = ctx.get_random(16).unwrap();
    assert_eq!(a.len(), 16);
    assert_eq!(b.len(), 16);
    assert_ne!(a, b);
}

#[test]
fn create_load_unload_key() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    let key = new_signing_key(&mut ctx);
    ctx.create_key(key, srk).unwrap();
    ctx.load_key(key, srk).unwrap();

    let pub_key = ctx.get_pub_key(key).unwrap();
    assert_eq!(pub_key.len(), 256);

    ctx.unload_key(key).unwrap();
    // Unloading an already-unloaded key is a no-op, not an error.
    ctx.unload_key(key).unwrap();

    // The blob survives the unload; reloading works.
    ctx.load_key(key, srk).unwrap();
}

#[test]
fn several_commands_reuse_one_session() {
    // Three wrap operations under the SRK ride the same object-bound
    // session with rolling nonces.
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    for _ in 0..3 {
        let key = new_signing_key(&mut ctx);
        ctx.create_key(key, srk).unwrap();
        ctx.load_key(key, srk).unwrap();
    }
}

#[test]
fn wrong_secret_is_auth_fail_and_recoverable() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let srk = ctx.load_key_by_uuid(PsType::SYSTEM, SRK_UUID).unwrap();
    let policy = ctx.get_policy_object(srk, PolicyKind::Usage).unwrap();

    // One flipped byte in the pre-hashed secret must yield AuthFail,
    // never a different kind.
    let mut tampered = sha1(SRK_SECRET);
    tampered[0] ^= 0xff;
    ctx.set_policy_secret(policy, SecretMode::Sha1, &tampered)
        .unwrap();

    let key = new_signing_key(&mut ctx);
    assert!(matches!(ctx.create_key(key, srk), Err(TssError::AuthFail)));

    // With the correct secret a fresh session succeeds.
    ctx.reset_policy_secret(policy).unwrap();
    ctx.set_policy_secret(policy, SecretMode::Plain, SRK_SECRET)
        .unwrap();
    ctx.create_key(key, srk).unwrap();
}

#[test]
fn missing_policy_is_bad_parameter_not_auth_fail() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    // SRK loaded but no secret reachable anywhere: the failure is
    // structural and nothing reaches the authority.
    let srk = ctx.load_key_by_uuid(PsType::SYSTEM, SRK_UUID).unwrap();
    let key = new_signing_key(&mut ctx);
    assert!(matches!(
        ctx.create_key(key, srk),
        Err(TssError::BadParameter(_))
    ));
}

#[test]
fn released_handles_never_resolve_again() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let hash = ctx.create_object(ObjectType::Hash, init::HASH_SHA1).unwrap();
    ctx.set_attrib_data(hash, attrib::HASH_VALUE, 0, &[0xAA; 20])
        .unwrap();
    ctx.close_object(hash).unwrap();

    assert!(matches!(
        ctx.get_attrib_data(hash, attrib::HASH_VALUE, 0),
        Err(TssError::InvalidHandle(_))
    ));
    assert!(matches!(
        ctx.close_object(hash),
        Err(TssError::InvalidHandle(_))
    ));
}

#[test]
fn foreign_context_handles_do_not_resolve() {
    let fixture = Fixture::new();
    let mut ctx1 = fixture.context();
    let mut ctx2 = fixture.context();

    let hash = ctx1.create_object(ObjectType::Hash, init::HASH_DEFAULT).unwrap();
    assert!(matches!(
        ctx2.get_attrib_data(hash, attrib::HASH_VALUE, 0),
        Err(TssError::InvalidHandle(_))
    ));
}

#[test]
fn unload_key_with_sentinel_handle() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    assert!(matches!(
        ctx.unload_key(Handle::from_raw(0xffff_ffff)),
        Err(TssError::InvalidHandle(0xffff_ffff))
    ));
}

#[test]
fn register_load_unregister_round_trip() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    // Parents in a registry chain are resolved through freshly fabricated
    // objects; give the context default policy the SRK secret so the chain
    // can authorize.
    let default_policy = ctx.default_policy();
    ctx.set_policy_secret(default_policy, SecretMode::Plain, SRK_SECRET)
        .unwrap();

    let key = new_signing_key(&mut ctx);
    ctx.create_key(key, srk).unwrap();
    let original_pub = ctx.get_pub_key(key).unwrap();

    let uuid = Tpm12Uuid::new(1, 2, 3, 4, 5, [6, 7, 8, 9, 10, 2]);
    ctx.register_key(key, PsType::USER, uuid, PsType::SYSTEM, SRK_UUID)
        .unwrap();

    // Idempotent re-registration: reported distinctly, not fatal, and the
    // stored entry is untouched.
    assert!(matches!(
        ctx.register_key(key, PsType::USER, uuid, PsType::SYSTEM, SRK_UUID),
        Err(TssError::KeyAlreadyRegistered)
    ));

    let loaded = ctx.load_key_by_uuid(PsType::USER, uuid).unwrap();
    assert_ne!(loaded, key);
    assert_eq!(ctx.get_pub_key(loaded).unwrap(), original_pub);
    for sub in [
        attrib::KEYINFO_SIZE,
        attrib::KEYINFO_USAGE,
        attrib::KEYINFO_MIGRATABLE,
    ] {
        assert_eq!(
            ctx.get_attrib_u32(loaded, attrib::KEY_INFO, sub).unwrap(),
            ctx.get_attrib_u32(key, attrib::KEY_INFO, sub).unwrap(),
        );
    }

    // Loading twice yields independent handles.
    let loaded_again = ctx.load_key_by_uuid(PsType::USER, uuid).unwrap();
    assert_ne!(loaded, loaded_again);

    // Unregistration invalidates the registration only.
    let recovered = ctx.unregister_key(PsType::USER, uuid).unwrap();
    assert_eq!(ctx.get_pub_key(recovered).unwrap(), original_pub);
    assert!(matches!(
        ctx.unregister_key(PsType::USER, uuid),
        Err(TssError::KeyNotFound)
    ));
    assert!(matches!(
        ctx.load_key_by_uuid(PsType::USER, uuid),
        Err(TssError::KeyNotFound)
    ));
}

#[test]
fn unregister_with_combined_scope_bitmask() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let both = PsType::from_raw(PsType::SYSTEM.raw() | PsType::USER.raw());
    assert!(matches!(
        ctx.unregister_key(both, SRK_UUID),
        Err(TssError::BadParameter(_))
    ));
}

#[test]
fn migration_happy_path_ticket_reuse_and_refusals() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);
    fixture.owner_auth(&mut ctx);

    // The migration authority key, created under the SRK.
    let authority = ctx
        .create_object(
            ObjectType::RsaKey,
            init::KEY_TYPE_BIND | init::KEY_SIZE_2048 | init::KEY_NO_AUTHORIZATION,
        )
        .unwrap();
    ctx.create_key(authority, srk).unwrap();

    // The migratable key, with a migration secret.
    let key = ctx
        .create_object(
            ObjectType::RsaKey,
            init::KEY_TYPE_SIGNING
                | init::KEY_SIZE_2048
                | init::KEY_NO_AUTHORIZATION
                | init::KEY_MIGRATABLE,
        )
        .unwrap();
    let mig_policy = ctx.get_policy_object(key, PolicyKind::Migration).unwrap();
    ctx.set_policy_secret(mig_policy, SecretMode::Plain, b"migration-pass")
        .unwrap();
    ctx.create_key(key, srk).unwrap();

    let ticket = ctx
        .authorize_migration_ticket(authority, MigrationScheme::Rewrap)
        .unwrap();

    let (random, blob) = ctx.create_migration_blob(key, srk, &ticket).unwrap();
    assert!(!random.is_empty());
    assert!(!blob.is_empty());

    // The ticket was consumed: replaying it fails at the authority with a
    // migration-layer error, not an authorization error.
    let replay = ctx.create_migration_blob(key, srk, &ticket);
    assert!(matches!(
        replay,
        Err(TssError::Tpm { code, .. }) if code == ReturnCode::MigrateFail as u32
    ));

    // A non-migratable key is refused before the wire, however fresh the
    // ticket.
    let fresh_ticket = ctx
        .authorize_migration_ticket(authority, MigrationScheme::Rewrap)
        .unwrap();
    let fixed_key = new_signing_key(&mut ctx);
    ctx.create_key(fixed_key, srk).unwrap();
    assert!(matches!(
        ctx.create_migration_blob(fixed_key, srk, &fresh_ticket),
        Err(TssError::BadParameter(_))
    ));

    // Destination side: convert under the authority key and install.
    ctx.load_key(authority, srk).unwrap();
    ctx.convert_migration_blob(key, authority, &blob, &random)
        .unwrap();
    ctx.load_key(key, authority).unwrap();
    assert_eq!(ctx.get_pub_key(key).unwrap().len(), 256);
}

#[test]
fn migration_blob_for_garbage_ticket() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    let key = ctx
        .create_object(
            ObjectType::RsaKey,
            init::KEY_TYPE_SIGNING | init::KEY_MIGRATABLE,
        )
        .unwrap();
    let mig_policy = ctx.get_policy_object(key, PolicyKind::Migration).unwrap();
    ctx.set_policy_secret(mig_policy, SecretMode::Plain, b"migration-pass")
        .unwrap();
    ctx.create_key(key, srk).unwrap();

    let garbage = MigrationTicket::from_bytes(vec![0xEE; 9]);
    assert!(matches!(
        ctx.create_migration_blob(key, srk, &garbage),
        Err(TssError::BadParameter(_))
    ));
}

#[test]
fn nv_define_write_read_release() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let nv = ctx.create_object(ObjectType::NvStore, 0).unwrap();
    ctx.set_attrib_u32(nv, attrib::NV_INDEX, 0, 0x0001_1149).unwrap();
    ctx.set_attrib_u32(nv, attrib::NV_PERMISSIONS, 0, 0).unwrap();
    ctx.set_attrib_u32(nv, attrib::NV_DATASIZE, 0, 10).unwrap();
    ctx.nv_define_space(nv).unwrap();

    ctx.nv_write(nv, 0, b"0123456789").unwrap();
    assert_eq!(ctx.nv_read(nv, 0, 10).unwrap(), b"0123456789");
    assert_eq!(ctx.nv_read(nv, 3, 4).unwrap(), b"3456");

    // Writing past the declared size is a caller error.
    assert!(matches!(
        ctx.nv_write(nv, 8, b"abc"),
        Err(TssError::BadParameter(_))
    ));

    // A second context sees the same index without defining it.
    let mut ctx2 = fixture.context();
    let nv2 = ctx2.create_object(ObjectType::NvStore, 0).unwrap();
    ctx2.set_attrib_u32(nv2, attrib::NV_INDEX, 0, 0x0001_1149)
        .unwrap();
    assert_eq!(ctx2.nv_read(nv2, 0, 10).unwrap(), b"0123456789");

    // While defined, the index cannot be defined again.
    ctx2.set_attrib_u32(nv2, attrib::NV_PERMISSIONS, 0, 0).unwrap();
    ctx2.set_attrib_u32(nv2, attrib::NV_DATASIZE, 0, 10).unwrap();
    assert!(matches!(
        ctx2.nv_define_space(nv2),
        Err(TssError::BadParameter(_))
    ));

    // Release frees the index for redefinition.
    ctx.nv_release_space(nv).unwrap();
    ctx2.nv_define_space(nv2).unwrap();
}

#[test]
fn nv_read_before_any_write() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let nv = ctx.create_object(ObjectType::NvStore, 0).unwrap();
    ctx.set_attrib_u32(nv, attrib::NV_INDEX, 0, 0x0001_1150).unwrap();
    ctx.set_attrib_u32(nv, attrib::NV_DATASIZE, 0, 10).unwrap();
    ctx.nv_define_space(nv).unwrap();

    // Defined but never written: reading is a caller error, mirroring the
    // uninitialized-read behavior of the hardware.
    let mut ctx2 = fixture.context();
    let nv2 = ctx2.create_object(ObjectType::NvStore, 0).unwrap();
    ctx2.set_attrib_u32(nv2, attrib::NV_INDEX, 0, 0x0001_1150)
        .unwrap();
    assert!(matches!(
        ctx2.nv_read(nv2, 0, 9),
        Err(TssError::BadParameter(_))
    ));
}

#[test]
fn nv_owner_read_demands_owner_auth() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    let nv = ctx.create_object(ObjectType::NvStore, 0).unwrap();
    ctx.set_attrib_u32(nv, attrib::NV_INDEX, 0, 0x0001_1151).unwrap();
    let perms: u32 = NvPermission::new()
        .with_ownerread(true)
        .with_ownerwrite(true)
        .into();
    ctx.set_attrib_u32(nv, attrib::NV_PERMISSIONS, 0, perms).unwrap();
    ctx.set_attrib_u32(nv, attrib::NV_DATASIZE, 0, 4).unwrap();

    let policy = ctx.get_policy_object(nv, PolicyKind::Usage).unwrap();
    ctx.set_policy_secret(policy, SecretMode::Plain, OWNER_SECRET)
        .unwrap();
    ctx.nv_define_space(nv).unwrap();
    ctx.nv_write(nv, 0, b"data").unwrap();
    assert_eq!(ctx.nv_read(nv, 0, 4).unwrap(), b"data");

    // A context without the owner secret cannot read.
    let mut ctx2 = fixture.context();
    let nv2 = ctx2.create_object(ObjectType::NvStore, 0).unwrap();
    ctx2.set_attrib_u32(nv2, attrib::NV_INDEX, 0, 0x0001_1151)
        .unwrap();
    assert!(matches!(
        ctx2.nv_read(nv2, 0, 4),
        Err(TssError::BadParameter(_))
    ));
}

#[test]
fn transport_session_wraps_and_signs() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    let signing = new_signing_key(&mut ctx);
    ctx.create_key(signing, srk).unwrap();
    ctx.load_key(signing, srk).unwrap();

    let trans_handle = ctx.transport_init(srk).unwrap();
    assert_ne!(trans_handle, 0);

    // Only one session at a time.
    assert!(matches!(
        ctx.transport_init(srk),
        Err(TssError::BadParameter(_))
    ));

    // A few wrapped commands; results behave exactly as unwrapped ones.
    let random = ctx.get_random(8).unwrap();
    assert_eq!(random.len(), 8);
    let version = ctx.tpm_version().unwrap();
    assert_eq!(version.major, 1);
    let extended = ctx.pcr_extend(5, [0x42; 20]).unwrap();
    assert_ne!(extended, [0u8; 20]);

    // The release signature covers the whole observed sequence and
    // verifies against the locally maintained log.
    let signature = ctx.transport_final(signing).unwrap();
    assert_eq!(signature.len(), 20);

    // The tunnel is gone; plain commands flow again and a new session can
    // be established.
    ctx.get_random(4).unwrap();
    ctx.transport_init(srk).unwrap();
    ctx.transport_final(signing).unwrap();
}

#[test]
fn authorized_key_secret_survives_wrapping() {
    // A key created *with* authorization proves its ADIP-protected secret
    // end to end: using it later succeeds with the right policy secret and
    // AuthFails with a wrong one.
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    let key = ctx
        .create_object(
            ObjectType::RsaKey,
            init::KEY_TYPE_STORAGE | init::KEY_SIZE_2048 | init::KEY_AUTHORIZATION,
        )
        .unwrap();
    let policy = ctx.get_policy_object(key, PolicyKind::Usage).unwrap();
    ctx.set_policy_secret(policy, SecretMode::Plain, b"key-pass")
        .unwrap();
    ctx.create_key(key, srk).unwrap();
    ctx.load_key(key, srk).unwrap();

    // EstablishTransport authorizes against the wrapping key.
    ctx.transport_init(key).unwrap();

    let signing = new_signing_key(&mut ctx);
    ctx.create_key(signing, srk).unwrap();
    ctx.load_key(signing, srk).unwrap();
    ctx.transport_final(signing).unwrap();

    // Same key, wrong secret: AuthFail.
    ctx.reset_policy_secret(policy).unwrap();
    ctx.set_policy_secret(policy, SecretMode::Plain, b"not-the-pass")
        .unwrap();
    assert!(matches!(
        ctx.transport_init(key),
        Err(TssError::AuthFail)
    ));
}

#[test]
fn key_attributes_freeze_at_create() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    let key = new_signing_key(&mut ctx);
    ctx.set_attrib_u32(key, attrib::KEY_INFO, attrib::KEYINFO_SIZE, 1024)
        .unwrap();
    ctx.create_key(key, srk).unwrap();

    // Wrap-relationship attributes are frozen...
    assert!(matches!(
        ctx.set_attrib_u32(key, attrib::KEY_INFO, attrib::KEYINFO_SIZE, 2048),
        Err(TssError::BadParameter(_))
    ));
    assert!(matches!(ctx.create_key(key, srk), Err(TssError::BadParameter(_))));

    // ...but scheme selection stays open, as the original callers rely on.
    ctx.set_attrib_u32(
        key,
        attrib::KEY_INFO,
        attrib::KEYINFO_SIGSCHEME,
        tss12::proto::SigScheme::None as u32,
    )
    .unwrap();
    ctx.set_attrib_u32(
        key,
        attrib::KEY_INFO,
        attrib::KEYINFO_ENCSCHEME,
        tss12::proto::EncScheme::None as u32,
    )
    .unwrap();
}

#[test]
fn context_close_releases_everything() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    let key = new_signing_key(&mut ctx);
    ctx.create_key(key, srk).unwrap();
    ctx.load_key(key, srk).unwrap();

    // Individually released handle, then close: double release through the
    // context teardown is not an error.
    let hash = ctx.create_object(ObjectType::Hash, init::HASH_DEFAULT).unwrap();
    ctx.close_object(hash).unwrap();

    ctx.close().unwrap();

    // The authority no longer knows the key: a fresh context loading by
    // the flushed handle space cannot see it, and the shared TPM keeps
    // serving other contexts.
    let mut ctx2 = fixture.context();
    assert_eq!(ctx2.get_random(4).unwrap().len(), 4);
}

#[test]
fn blob_attribute_imports_a_key() {
    // Moving a created key between contexts through its blob attribute,
    // the way a migration destination receives one.
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let srk = fixture.srk(&mut ctx);

    let key = new_signing_key(&mut ctx);
    ctx.create_key(key, srk).unwrap();
    let blob = ctx.get_attrib_data(key, attrib::KEY_BLOB, attrib::KEYBLOB_BLOB).unwrap();

    let mut ctx2 = fixture.context();
    let srk2 = fixture.srk(&mut ctx2);
    let imported = ctx2
        .create_object(ObjectType::RsaKey, init::KEY_TYPE_SIGNING)
        .unwrap();
    ctx2.set_attrib_data(imported, attrib::KEY_BLOB, attrib::KEYBLOB_BLOB, &blob)
        .unwrap();
    ctx2.load_key(imported, srk2).unwrap();
    assert_eq!(ctx2.get_pub_key(imported).unwrap().len(), 256);
}
