// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 1.2 protocol types, as defined in the TPM Main Specification.
//!
//! Only the frames required by the client stack are defined here: the
//! command/reply envelope with its one- and two-session authorization
//! trailers, the key, migration, NV and transport structures, and the
//! ordinal/return-code tables. Multi-byte integers are big-endian on the
//! wire.

use self::packed_nums::*;
use bitfield_struct::bitfield;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

/// Width of every digest, nonce and authorization code in the 1.2 protocol.
pub const SHA1_DIGEST_SIZE: usize = 20;

/// Width of the rolling session nonces.
pub const NONCE_SIZE: usize = SHA1_DIGEST_SIZE;

/// Upper bound for the variable-size buffers carried in commands.
///
/// Large enough for a wrapped 4096-bit key; anything bigger is rejected at
/// construction time rather than truncated.
pub const MAX_SIZED_BUFFER: usize = 1024;

/// The handle of the Storage Root Key, resident in every TPM.
pub const TPM12_KH_SRK: u32 = 0x4000_0000;

/// The entity value addressing the TPM owner in OSAP/OIAP exchanges.
pub const TPM12_KH_OWNER: u32 = 0x4000_0001;

#[derive(Debug, Error)]
pub enum InvalidInput {
    #[error("input data size too large for buffer - input size > upper bound: {0} > {1}")]
    BufferSizeTooLarge(usize, usize),
}

/// Errors produced while decoding a command frame on the authority side.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown session tag {0:#06x}")]
    BadTag(u16),
    #[error("header size field {header} does not match frame length {actual}")]
    SizeMismatch { header: u32, actual: usize },
    #[error("unknown ordinal {0:#010x}")]
    BadOrdinal(u32),
}

/// Errors produced while validating a reply frame on the client side.
#[derive(Debug, Error)]
pub enum ResponseValidationError {
    #[error("response size is too small to fit the reply header")]
    ResponseSizeTooSmall,
    #[error(
        "unexpected session tag {response_tag:#06x} in the reply header, expected {expected_tag:#06x}"
    )]
    HeaderSessionTagMismatch { response_tag: u16, expected_tag: u16 },
    #[error("size {size} in the reply header does not cover the minimal reply size {expected_size}")]
    HeaderResponseSizeMismatch { size: u32, expected_size: usize },
    #[error("reply parameter area is malformed")]
    MalformedParameters,
}

// === Session tags === //

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct SessionTag(pub u16_be);

impl PartialEq<SessionTag> for u16 {
    fn eq(&self, other: &SessionTag) -> bool {
        other.0.get() == *self
    }
}

impl SessionTag {
    const fn new(val: u16) -> SessionTag {
        SessionTag(new_u16_be(val))
    }
}

/// `TPM_TAG_*` request/reply tags.
#[derive(Debug, Copy, Clone, PartialEq)]
#[repr(u16)]
pub enum SessionTagEnum {
    /// A command with no authorization sessions.
    RquCommand = 0x00C1,
    /// A command with one authorization session.
    RquAuth1Command = 0x00C2,
    /// A command with two authorization sessions.
    RquAuth2Command = 0x00C3,
    /// A reply with no authorization sessions.
    RspCommand = 0x00C4,
    /// A reply with one authorization session.
    RspAuth1Command = 0x00C5,
    /// A reply with two authorization sessions.
    RspAuth2Command = 0x00C6,
}

impl From<SessionTagEnum> for SessionTag {
    fn from(x: SessionTagEnum) -> Self {
        SessionTag::new(x as u16)
    }
}

impl SessionTagEnum {
    pub fn from_u16(val: u16) -> Option<SessionTagEnum> {
        let ret = match val {
            0x00C1 => Self::RquCommand,
            0x00C2 => Self::RquAuth1Command,
            0x00C3 => Self::RquAuth2Command,
            0x00C4 => Self::RspCommand,
            0x00C5 => Self::RspAuth1Command,
            0x00C6 => Self::RspAuth2Command,
            _ => return None,
        };
        Some(ret)
    }

    /// Number of authorization trailers implied by the tag.
    pub fn auth_sessions(&self) -> usize {
        match self {
            Self::RquCommand | Self::RspCommand => 0,
            Self::RquAuth1Command | Self::RspAuth1Command => 1,
            Self::RquAuth2Command | Self::RspAuth2Command => 2,
        }
    }
}

// === Ordinals === //

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct Ordinal(pub u32_be);

impl PartialEq<Ordinal> for u32 {
    fn eq(&self, other: &Ordinal) -> bool {
        other.0.get() == *self
    }
}

impl Ordinal {
    const fn new(val: u32) -> Ordinal {
        Ordinal(new_u32_be(val))
    }

    pub fn into_enum(self) -> Option<OrdinalEnum> {
        OrdinalEnum::from_u32(self.0.get())
    }
}

/// `TPM_ORD_*` command ordinals.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OrdinalEnum {
    Oiap = 0x0000000A,
    Osap = 0x0000000B,
    Extend = 0x00000014,
    PcrRead = 0x00000015,
    CreateWrapKey = 0x0000001F,
    GetPubKey = 0x00000021,
    CreateMigrationBlob = 0x00000028,
    ConvertMigrationBlob = 0x0000002A,
    AuthorizeMigrationKey = 0x0000002B,
    LoadKey2 = 0x00000041,
    GetRandom = 0x00000046,
    GetCapability = 0x00000065,
    TerminateHandle = 0x00000096,
    FlushSpecific = 0x000000BA,
    NvDefineSpace = 0x000000CC,
    NvWriteValue = 0x000000CD,
    NvReadValue = 0x000000CF,
    EstablishTransport = 0x000000E6,
    ExecuteTransport = 0x000000E7,
    ReleaseTransportSigned = 0x000000E8,
}

impl From<OrdinalEnum> for Ordinal {
    fn from(x: OrdinalEnum) -> Self {
        Ordinal::new(x as u32)
    }
}

impl OrdinalEnum {
    pub fn from_u32(val: u32) -> Option<OrdinalEnum> {
        let ret = match val {
            0x0000000A => Self::Oiap,
            0x0000000B => Self::Osap,
            0x00000014 => Self::Extend,
            0x00000015 => Self::PcrRead,
            0x0000001F => Self::CreateWrapKey,
            0x00000021 => Self::GetPubKey,
            0x00000028 => Self::CreateMigrationBlob,
            0x0000002A => Self::ConvertMigrationBlob,
            0x0000002B => Self::AuthorizeMigrationKey,
            0x00000041 => Self::LoadKey2,
            0x00000046 => Self::GetRandom,
            0x00000065 => Self::GetCapability,
            0x00000096 => Self::TerminateHandle,
            0x000000BA => Self::FlushSpecific,
            0x000000CC => Self::NvDefineSpace,
            0x000000CD => Self::NvWriteValue,
            0x000000CF => Self::NvReadValue,
            0x000000E6 => Self::EstablishTransport,
            0x000000E7 => Self::ExecuteTransport,
            0x000000E8 => Self::ReleaseTransportSigned,
            _ => return None,
        };
        Some(ret)
    }
}

// === Return codes === //

/// `TPM_*` return codes carried in the reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReturnCode {
    Success = 0x000,
    /// Authentication failed; the authorization session is invalidated.
    AuthFail = 0x001,
    /// The index to a PCR, DIR or other register is incorrect.
    BadIndex = 0x002,
    /// One or more command parameters is bad.
    BadParameter = 0x003,
    /// The operation failed for an internal reason.
    Fail = 0x009,
    /// The ordinal was unknown or inconsistent.
    BadOrdinal = 0x00A,
    /// The key handle cannot be interpreted.
    InvalidKeyHandle = 0x00C,
    /// The key handle points to an invalid key.
    KeyNotFound = 0x00D,
    /// Migration authorization failed.
    MigrateFail = 0x00F,
    /// No room to load the key.
    NoSpace = 0x011,
    /// Authentication for the second session failed.
    Auth2Fail = 0x01D,
    /// The tag value sent for a command is invalid.
    BadTag = 0x01E,
    /// The authorization handle cannot be interpreted.
    InvalidAuthHandle = 0x022,
    /// The entity type is not allowed for this operation.
    WrongEntityType = 0x025,
    /// The signature or encryption scheme is incorrect for this key.
    BadScheme = 0x02A,
    /// The caller lacks NV permission for the operation.
    NoNvPermission = 0x038,
    /// A conflicting authorization session already exists.
    AuthConflict = 0x03B,
    /// The NV area is locked and not writable.
    AreaLocked = 0x03C,
}

impl ReturnCode {
    pub fn from_u32(val: u32) -> Option<ReturnCode> {
        let ret = match val {
            x if x == ReturnCode::Success as u32 => ReturnCode::Success,
            x if x == ReturnCode::AuthFail as u32 => ReturnCode::AuthFail,
            x if x == ReturnCode::BadIndex as u32 => ReturnCode::BadIndex,
            x if x == ReturnCode::BadParameter as u32 => ReturnCode::BadParameter,
            x if x == ReturnCode::Fail as u32 => ReturnCode::Fail,
            x if x == ReturnCode::BadOrdinal as u32 => ReturnCode::BadOrdinal,
            x if x == ReturnCode::InvalidKeyHandle as u32 => ReturnCode::InvalidKeyHandle,
            x if x == ReturnCode::KeyNotFound as u32 => ReturnCode::KeyNotFound,
            x if x == ReturnCode::MigrateFail as u32 => ReturnCode::MigrateFail,
            x if x == ReturnCode::NoSpace as u32 => ReturnCode::NoSpace,
            x if x == ReturnCode::Auth2Fail as u32 => ReturnCode::Auth2Fail,
            x if x == ReturnCode::BadTag as u32 => ReturnCode::BadTag,
            x if x == ReturnCode::InvalidAuthHandle as u32 => ReturnCode::InvalidAuthHandle,
            x if x == ReturnCode::WrongEntityType as u32 => ReturnCode::WrongEntityType,
            x if x == ReturnCode::BadScheme as u32 => ReturnCode::BadScheme,
            x if x == ReturnCode::NoNvPermission as u32 => ReturnCode::NoNvPermission,
            x if x == ReturnCode::AuthConflict as u32 => ReturnCode::AuthConflict,
            x if x == ReturnCode::AreaLocked as u32 => ReturnCode::AreaLocked,
            _ => return None,
        };
        Some(ret)
    }
}

// === Entity types (OSAP/OIAP) === //

/// `TPM_ET_*` entity types named in OSAP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EntityType {
    /// A loaded key, addressed by its authority handle.
    KeyHandle = 0x0001,
    /// The TPM owner.
    Owner = 0x0002,
    /// The Storage Root Key.
    Srk = 0x0004,
    /// An NV index.
    NvIndex = 0x000B,
}

impl EntityType {
    pub fn from_u16(val: u16) -> Option<EntityType> {
        let ret = match val {
            0x0001 => Self::KeyHandle,
            0x0002 => Self::Owner,
            0x0004 => Self::Srk,
            0x000B => Self::NvIndex,
            _ => return None,
        };
        Some(ret)
    }
}

// === Resource types (FlushSpecific) === //

/// `TPM_RT_*` resource types for FlushSpecific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResourceType {
    /// A loaded key.
    Key = 0x00000001,
    /// An authorization session.
    Auth = 0x00000002,
    /// A transport session.
    Transport = 0x00000004,
}

// === UUIDs === //

/// The TSS 1.2 `TSS_UUID` layout.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq, Hash)]
pub struct Tpm12Uuid {
    pub time_low: u32_be,
    pub time_mid: u16_be,
    pub time_high: u16_be,
    pub clock_seq_high: u8,
    pub clock_seq_low: u8,
    pub node: [u8; 6],
}

/// The well-known UUID of the Storage Root Key.
pub const SRK_UUID: Tpm12Uuid = Tpm12Uuid::new(0, 0, 0, 0, 0, [0, 0, 0, 0, 0, 1]);

impl Tpm12Uuid {
    pub const fn new(
        time_low: u32,
        time_mid: u16,
        time_high: u16,
        clock_seq_high: u8,
        clock_seq_low: u8,
        node: [u8; 6],
    ) -> Self {
        Self {
            time_low: new_u32_be(time_low),
            time_mid: new_u16_be(time_mid),
            time_high: new_u16_be(time_high),
            clock_seq_high,
            clock_seq_low,
            node,
        }
    }

    /// The canonical 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.as_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self::read_from_bytes(&bytes[..]).expect("infallible for a 16-byte input")
    }
}

impl std::fmt::Display for Tpm12Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.time_low.get(),
            self.time_mid.get(),
            self.time_high.get(),
            self.clock_seq_high,
            self.clock_seq_low,
        )?;
        for b in &self.node {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// === Const constructors === //

/// Workaround to allow constructing a zerocopy U32 in a const context.
const fn new_u32_be(val: u32) -> u32_be {
    u32_be::from_bytes(val.to_be_bytes())
}

/// Workaround to allow constructing a zerocopy U16 in a const context.
const fn new_u16_be(val: u16) -> u16_be {
    u16_be::from_bytes(val.to_be_bytes())
}

// === Key structures === //

/// `TPM_KEY_USAGE` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyUsage {
    Signing = 0x0010,
    Storage = 0x0011,
    Identity = 0x0012,
    AuthChange = 0x0013,
    Bind = 0x0014,
    Legacy = 0x0015,
}

impl KeyUsage {
    pub fn from_u16(val: u16) -> Option<KeyUsage> {
        let ret = match val {
            0x0010 => Self::Signing,
            0x0011 => Self::Storage,
            0x0012 => Self::Identity,
            0x0013 => Self::AuthChange,
            0x0014 => Self::Bind,
            0x0015 => Self::Legacy,
            _ => return None,
        };
        Some(ret)
    }
}

/// `TPM_KEY_FLAGS`
#[bitfield(u32)]
pub struct KeyFlags {
    pub redirection: bool,
    pub migratable: bool,
    pub is_volatile: bool,
    pub pcr_ignored_on_read: bool,
    pub migrate_authority: bool,
    #[bits(27)]
    _reserved: u32,
}

/// `TPM_AUTH_DATA_USAGE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthDataUsage {
    /// Usage of the key does not require authorization.
    Never = 0x00,
    /// Every use of the key requires authorization.
    Always = 0x01,
}

/// `TPM_ALGORITHM_ID` values.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AlgorithmId {
    Rsa = 0x00000001,
    Sha = 0x00000004,
    Hmac = 0x00000005,
    Mgf1 = 0x00000007,
    Xor = 0x0000000A,
}

/// `TPM_ENC_SCHEME` values.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EncScheme {
    None = 0x0001,
    RsaEsPkcs1v15 = 0x0002,
    RsaEsOaepSha1Mgf1 = 0x0003,
}

impl EncScheme {
    pub fn from_u16(val: u16) -> Option<EncScheme> {
        let ret = match val {
            0x0001 => Self::None,
            0x0002 => Self::RsaEsPkcs1v15,
            0x0003 => Self::RsaEsOaepSha1Mgf1,
            _ => return None,
        };
        Some(ret)
    }
}

/// `TPM_SIG_SCHEME` values.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SigScheme {
    None = 0x0001,
    RsaSsaPkcs1v15Sha1 = 0x0002,
    RsaSsaPkcs1v15Der = 0x0003,
    RsaSsaPkcs1v15Info = 0x0004,
}

impl SigScheme {
    pub fn from_u16(val: u16) -> Option<SigScheme> {
        let ret = match val {
            0x0001 => Self::None,
            0x0002 => Self::RsaSsaPkcs1v15Sha1,
            0x0003 => Self::RsaSsaPkcs1v15Der,
            0x0004 => Self::RsaSsaPkcs1v15Info,
            _ => return None,
        };
        Some(ret)
    }
}

/// `TPM_MIGRATE_SCHEME` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MigrationScheme {
    /// Blob rewrapped to the migration authority for later conversion.
    Migrate = 0x0001,
    /// Blob directly rewrapped under the new parent.
    Rewrap = 0x0002,
}

impl MigrationScheme {
    pub fn from_u16(val: u16) -> Option<MigrationScheme> {
        let ret = match val {
            0x0001 => Self::Migrate,
            0x0002 => Self::Rewrap,
            _ => return None,
        };
        Some(ret)
    }
}

/// General type for the `UINT32`-sized buffers of the 1.2 structures.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SizedBuffer {
    pub size: u32_be,
    // Use a value that is large enough as the buffer size so that we only
    // need to define one struct.
    pub buffer: [u8; MAX_SIZED_BUFFER],
}

impl SizedBuffer {
    /// Create a `SizedBuffer` from a slice.
    pub fn new(data: &[u8]) -> Result<Self, InvalidInput> {
        let size = data.len();
        if size > MAX_SIZED_BUFFER {
            Err(InvalidInput::BufferSizeTooLarge(size, MAX_SIZED_BUFFER))?
        }

        let mut buffer = [0u8; MAX_SIZED_BUFFER];
        buffer[..size].copy_from_slice(data);

        Ok(Self {
            size: new_u32_be(size as u32),
            buffer,
        })
    }

    /// The valid prefix of the buffer.
    pub fn contents(&self) -> &[u8] {
        &self.buffer[..self.size.get() as usize]
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(self.size.as_bytes());
        buffer.extend_from_slice(self.contents());

        buffer
    }

    pub fn deserialize(reader: &mut Reader<'_>) -> Option<Self> {
        let size = reader.u32()?;
        if size as usize > MAX_SIZED_BUFFER {
            return None;
        }
        let data = reader.bytes(size as usize)?;
        Some(Self::new(data).expect("length already bounds-checked"))
    }

    pub fn payload_size(&self) -> usize {
        size_of::<u32_be>() + self.size.get() as usize
    }
}

/// `TPM_KEY_PARMS`
#[derive(Debug, Clone)]
pub struct KeyParms {
    pub algorithm_id: u32_be,
    pub enc_scheme: u16_be,
    pub sig_scheme: u16_be,
    pub parms: SizedBuffer,
}

impl KeyParms {
    /// RSA key parameters with the given modulus size in bits.
    pub fn new_rsa(enc_scheme: EncScheme, sig_scheme: SigScheme, key_bits: u32) -> Self {
        let rsa = RsaKeyParms {
            key_length: new_u32_be(key_bits),
            num_primes: new_u32_be(2),
            exponent_size: new_u32_be(0),
        };
        Self {
            algorithm_id: new_u32_be(AlgorithmId::Rsa as u32),
            enc_scheme: new_u16_be(enc_scheme as u16),
            sig_scheme: new_u16_be(sig_scheme as u16),
            parms: SizedBuffer::new(rsa.as_bytes()).expect("fixed-size parms fit"),
        }
    }

    /// Modulus size in bits, if the parameter area is RSA-shaped.
    pub fn rsa_key_bits(&self) -> Option<u32> {
        let parms = RsaKeyParms::read_from_bytes(self.parms.contents()).ok()?;
        Some(parms.key_length.get())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(self.algorithm_id.as_bytes());
        buffer.extend_from_slice(self.enc_scheme.as_bytes());
        buffer.extend_from_slice(self.sig_scheme.as_bytes());
        buffer.extend_from_slice(&self.parms.serialize());

        buffer
    }

    pub fn deserialize(reader: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            algorithm_id: new_u32_be(reader.u32()?),
            enc_scheme: new_u16_be(reader.u16()?),
            sig_scheme: new_u16_be(reader.u16()?),
            parms: SizedBuffer::deserialize(reader)?,
        })
    }
}

/// `TPM_RSA_KEY_PARMS`
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RsaKeyParms {
    pub key_length: u32_be,
    pub num_primes: u32_be,
    pub exponent_size: u32_be,
}

/// `TPM_TAG_KEY12`
pub const TPM_TAG_KEY12: u16 = 0x0028;

/// `TPM_KEY12` - the wrapped-key structure produced by CreateWrapKey and
/// consumed by LoadKey2. `enc_data` is opaque to everyone but the parent.
#[derive(Debug, Clone)]
pub struct Key12 {
    pub key_usage: u16_be,
    pub key_flags: u32_be,
    pub auth_data_usage: u8,
    pub parms: KeyParms,
    pub pcr_info: SizedBuffer,
    pub pub_key: SizedBuffer,
    pub enc_data: SizedBuffer,
}

impl Key12 {
    pub fn new(
        key_usage: KeyUsage,
        key_flags: KeyFlags,
        auth_data_usage: AuthDataUsage,
        parms: KeyParms,
        pub_key: &[u8],
        enc_data: &[u8],
    ) -> Result<Self, InvalidInput> {
        Ok(Self {
            key_usage: new_u16_be(key_usage as u16),
            key_flags: new_u32_be(key_flags.into()),
            auth_data_usage: auth_data_usage as u8,
            parms,
            pcr_info: SizedBuffer::new(&[]).expect("empty buffer always fits"),
            pub_key: SizedBuffer::new(pub_key)?,
            enc_data: SizedBuffer::new(enc_data)?,
        })
    }

    pub fn flags(&self) -> KeyFlags {
        KeyFlags::from(self.key_flags.get())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(&TPM_TAG_KEY12.to_be_bytes());
        buffer.extend_from_slice(&0u16.to_be_bytes()); // fill
        buffer.extend_from_slice(self.key_usage.as_bytes());
        buffer.extend_from_slice(self.key_flags.as_bytes());
        buffer.push(self.auth_data_usage);
        buffer.extend_from_slice(&self.parms.serialize());
        buffer.extend_from_slice(&self.pcr_info.serialize());
        buffer.extend_from_slice(&self.pub_key.serialize());
        buffer.extend_from_slice(&self.enc_data.serialize());

        buffer
    }

    pub fn deserialize(reader: &mut Reader<'_>) -> Option<Self> {
        let tag = reader.u16()?;
        if tag != TPM_TAG_KEY12 {
            return None;
        }
        let _fill = reader.u16()?;
        Some(Self {
            key_usage: new_u16_be(reader.u16()?),
            key_flags: new_u32_be(reader.u32()?),
            auth_data_usage: reader.u8()?,
            parms: KeyParms::deserialize(reader)?,
            pcr_info: SizedBuffer::deserialize(reader)?,
            pub_key: SizedBuffer::deserialize(reader)?,
            enc_data: SizedBuffer::deserialize(reader)?,
        })
    }

    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(blob);
        let key = Self::deserialize(&mut reader)?;
        reader.finish().then_some(key)
    }
}

/// `TPM_MIGRATIONKEYAUTH` - the single-use ticket binding a migration to a
/// specific authority key and scheme.
#[derive(Debug, Clone)]
pub struct MigrationKeyAuth {
    pub migration_key: SizedBuffer,
    pub migration_scheme: u16_be,
    pub digest: [u8; SHA1_DIGEST_SIZE],
}

impl MigrationKeyAuth {
    pub fn new(
        migration_key: &[u8],
        migration_scheme: MigrationScheme,
        digest: [u8; SHA1_DIGEST_SIZE],
    ) -> Result<Self, InvalidInput> {
        Ok(Self {
            migration_key: SizedBuffer::new(migration_key)?,
            migration_scheme: new_u16_be(migration_scheme as u16),
            digest,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(&self.migration_key.serialize());
        buffer.extend_from_slice(self.migration_scheme.as_bytes());
        buffer.extend_from_slice(&self.digest);

        buffer
    }

    pub fn deserialize(reader: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            migration_key: SizedBuffer::deserialize(reader)?,
            migration_scheme: new_u16_be(reader.u16()?),
            digest: reader.array()?,
        })
    }

    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(blob);
        let auth = Self::deserialize(&mut reader)?;
        reader.finish().then_some(auth)
    }
}

// === NV structures === //

/// `TPM_NV_PER_*` permission bits.
#[bitfield(u32)]
pub struct NvPermission {
    pub ppwrite: bool,
    pub ownerwrite: bool,
    pub authwrite: bool,
    #[bits(10)]
    _reserved0: u16,
    pub writedefine: bool,
    #[bits(2)]
    _reserved1: u8,
    pub ppread: bool,
    pub ownerread: bool,
    pub authread: bool,
    #[bits(13)]
    _reserved2: u16,
}

/// The public parameters of an NV area.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvDataPublic {
    pub index: u32_be,
    pub permission: u32_be,
    pub data_size: u32_be,
}

impl NvDataPublic {
    pub fn new(index: u32, permission: NvPermission, data_size: u32) -> Self {
        Self {
            index: new_u32_be(index),
            permission: new_u32_be(permission.into()),
            data_size: new_u32_be(data_size),
        }
    }
}

// === Capability === //

/// `TPM_CAP_*` capability areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CapArea {
    /// Query whether an ordinal is supported.
    Ord = 0x00000001,
    /// Query a TPM property.
    Property = 0x00000005,
    /// Query the full version structure.
    VersionVal = 0x0000001A,
}

impl CapArea {
    pub fn from_u32(val: u32) -> Option<CapArea> {
        let ret = match val {
            0x00000001 => Self::Ord,
            0x00000005 => Self::Property,
            0x0000001A => Self::VersionVal,
            _ => return None,
        };
        Some(ret)
    }
}

/// `TPM_VERSION`
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct TpmVersion {
    pub major: u8,
    pub minor: u8,
    pub rev_major: u8,
    pub rev_minor: u8,
}

// === Transport === //

/// `TPM_TAG_TRANSPORT_PUBLIC`
pub const TPM_TAG_TRANSPORT_PUBLIC: u16 = 0x001E;

/// `TPM_TRANSPORT_*` attribute bits.
#[bitfield(u32)]
pub struct TransportAttributes {
    pub encrypt: bool,
    pub log: bool,
    pub exclusive: bool,
    #[bits(29)]
    _reserved: u32,
}

/// The public parameters of a transport session.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TransportPublic {
    pub tag: u16_be,
    pub attributes: u32_be,
    pub algorithm_id: u32_be,
    pub enc_scheme: u16_be,
}

impl TransportPublic {
    pub fn new(attributes: TransportAttributes) -> Self {
        Self {
            tag: new_u16_be(TPM_TAG_TRANSPORT_PUBLIC),
            attributes: new_u32_be(attributes.into()),
            algorithm_id: new_u32_be(AlgorithmId::Mgf1 as u32),
            enc_scheme: new_u16_be(EncScheme::None as u16),
        }
    }
}

// === Authorization trailers === //

/// The per-session authorization trailer of a request.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CmdAuth {
    pub auth_handle: u32_be,
    pub nonce_odd: [u8; NONCE_SIZE],
    pub continue_auth: u8,
    pub auth_code: [u8; SHA1_DIGEST_SIZE],
}

impl CmdAuth {
    pub fn new(
        auth_handle: u32,
        nonce_odd: [u8; NONCE_SIZE],
        continue_auth: bool,
        auth_code: [u8; SHA1_DIGEST_SIZE],
    ) -> Self {
        Self {
            auth_handle: new_u32_be(auth_handle),
            nonce_odd,
            continue_auth: continue_auth as u8,
            auth_code,
        }
    }
}

/// The per-session authorization trailer of a reply.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ReplyAuth {
    pub nonce_even: [u8; NONCE_SIZE],
    pub continue_auth: u8,
    pub auth_code: [u8; SHA1_DIGEST_SIZE],
}

impl ReplyAuth {
    pub fn new(
        nonce_even: [u8; NONCE_SIZE],
        continue_auth: bool,
        auth_code: [u8; SHA1_DIGEST_SIZE],
    ) -> Self {
        Self {
            nonce_even,
            continue_auth: continue_auth as u8,
            auth_code,
        }
    }
}

// === Envelope === //

/// The fixed request header.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CmdHeader {
    pub session_tag: SessionTag,
    pub size: u32_be,
    pub ordinal: Ordinal,
}

/// The fixed reply header.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ReplyHeader {
    pub session_tag: u16_be,
    pub size: u32_be,
    pub return_code: u32_be,
}

impl ReplyHeader {
    /// Performs the command-agnostic validation checks:
    /// - the session tag matches the expectation (failures always come back
    ///   with `TPM_TAG_RSP_COMMAND`),
    /// - the size field covers the minimal reply.
    ///
    /// Returns `Ok(bool)` if validation passes; the bool indicates whether
    /// the return code is [`ReturnCode::Success`].
    pub fn base_validation(
        &self,
        expected_tag: SessionTagEnum,
        expected_size: usize,
    ) -> Result<bool, ResponseValidationError> {
        let succeeded = self.return_code.get() == ReturnCode::Success as u32;

        let (expected_tag, expected_size) = if succeeded {
            (expected_tag, expected_size)
        } else {
            (SessionTagEnum::RspCommand, size_of::<Self>())
        };

        if self.session_tag.get() != expected_tag as u16 {
            Err(ResponseValidationError::HeaderSessionTagMismatch {
                response_tag: self.session_tag.get(),
                expected_tag: expected_tag as u16,
            })?
        }

        if (self.size.get() as usize) < expected_size {
            Err(ResponseValidationError::HeaderResponseSizeMismatch {
                size: self.size.get(),
                expected_size,
            })?
        }

        Ok(succeeded)
    }
}

/// Serialize a request frame: header, handle area, parameter area and up to
/// two authorization trailers. The tag is derived from the trailer count.
pub fn build_command(
    ordinal: OrdinalEnum,
    handles: &[u32],
    params: &[u8],
    auths: &[CmdAuth],
) -> Vec<u8> {
    assert!(auths.len() <= 2);
    let tag = match auths.len() {
        0 => SessionTagEnum::RquCommand,
        1 => SessionTagEnum::RquAuth1Command,
        _ => SessionTagEnum::RquAuth2Command,
    };

    let size = size_of::<CmdHeader>()
        + handles.len() * size_of::<u32_be>()
        + params.len()
        + auths.len() * size_of::<CmdAuth>();

    let header = CmdHeader {
        session_tag: tag.into(),
        size: new_u32_be(size as u32),
        ordinal: ordinal.into(),
    };

    let mut buffer = Vec::with_capacity(size);
    buffer.extend_from_slice(header.as_bytes());
    for handle in handles {
        buffer.extend_from_slice(&handle.to_be_bytes());
    }
    buffer.extend_from_slice(params);
    for auth in auths {
        buffer.extend_from_slice(auth.as_bytes());
    }

    buffer
}

/// Serialize a reply frame. A non-success reply is header-only, matching
/// the behavior of a real 1.2 device.
pub fn build_reply(return_code: ReturnCode, params: &[u8], auths: &[ReplyAuth]) -> Vec<u8> {
    assert!(auths.len() <= 2);
    if return_code != ReturnCode::Success {
        let header = ReplyHeader {
            session_tag: new_u16_be(SessionTagEnum::RspCommand as u16),
            size: new_u32_be(size_of::<ReplyHeader>() as u32),
            return_code: new_u32_be(return_code as u32),
        };
        return header.as_bytes().to_vec();
    }

    let tag = match auths.len() {
        0 => SessionTagEnum::RspCommand,
        1 => SessionTagEnum::RspAuth1Command,
        _ => SessionTagEnum::RspAuth2Command,
    };

    let size = size_of::<ReplyHeader>() + params.len() + auths.len() * size_of::<ReplyAuth>();
    let header = ReplyHeader {
        session_tag: new_u16_be(tag as u16),
        size: new_u32_be(size as u32),
        return_code: new_u32_be(ReturnCode::Success as u32),
    };

    let mut buffer = Vec::with_capacity(size);
    buffer.extend_from_slice(header.as_bytes());
    buffer.extend_from_slice(params);
    for auth in auths {
        buffer.extend_from_slice(auth.as_bytes());
    }

    buffer
}

/// A decoded request frame, as seen by the authority.
#[derive(Debug)]
pub struct CommandFrame {
    pub ordinal: OrdinalEnum,
    pub handles: Vec<u32>,
    pub params: Vec<u8>,
    pub auth1: Option<CmdAuth>,
    pub auth2: Option<CmdAuth>,
}

impl CommandFrame {
    /// Decode a request. `num_handles` is per-ordinal knowledge of the
    /// caller; the parameter area is whatever sits between the handle area
    /// and the authorization trailers implied by the tag.
    pub fn parse(bytes: &[u8], num_handles: usize) -> Result<Self, FrameError> {
        let (header, rest) = CmdHeader::read_from_prefix(bytes).map_err(|_| {
            FrameError::Truncated {
                needed: size_of::<CmdHeader>().saturating_sub(bytes.len()),
            }
        })?;

        let tag = SessionTagEnum::from_u16(header.session_tag.0.get())
            .ok_or(FrameError::BadTag(header.session_tag.0.get()))?;
        if header.size.get() as usize != bytes.len() {
            return Err(FrameError::SizeMismatch {
                header: header.size.get(),
                actual: bytes.len(),
            });
        }
        let ordinal = header
            .ordinal
            .into_enum()
            .ok_or(FrameError::BadOrdinal(header.ordinal.0.get()))?;

        let auth_sessions = tag.auth_sessions();
        let auth_bytes = auth_sessions * size_of::<CmdAuth>();
        let handle_bytes = num_handles * size_of::<u32_be>();
        if rest.len() < handle_bytes + auth_bytes {
            return Err(FrameError::Truncated {
                needed: handle_bytes + auth_bytes - rest.len(),
            });
        }

        let mut handles = Vec::with_capacity(num_handles);
        let mut reader = Reader::new(&rest[..handle_bytes]);
        for _ in 0..num_handles {
            handles.push(reader.u32().expect("sized above"));
        }

        let params = rest[handle_bytes..rest.len() - auth_bytes].to_vec();

        let mut auths = rest[rest.len() - auth_bytes..]
            .chunks_exact(size_of::<CmdAuth>())
            .map(|c| CmdAuth::read_from_bytes(c).expect("chunk is exactly one trailer"));
        let auth1 = auths.next();
        let auth2 = auths.next();

        Ok(Self {
            ordinal,
            handles,
            params,
            auth1,
            auth2,
        })
    }
}

/// A decoded reply frame, as seen by the client.
#[derive(Debug)]
pub struct ReplyFrame {
    pub header: ReplyHeader,
    pub params: Vec<u8>,
    pub auth1: Option<ReplyAuth>,
    pub auth2: Option<ReplyAuth>,
}

impl ReplyFrame {
    /// Decode a reply. `expected_auths` must match the request's session
    /// count; a failed reply is header-only and carries no trailers.
    pub fn parse(bytes: &[u8], expected_auths: usize) -> Result<Self, ResponseValidationError> {
        let (header, rest) = ReplyHeader::read_from_prefix(bytes)
            .map_err(|_| ResponseValidationError::ResponseSizeTooSmall)?;

        let expected_tag = match expected_auths {
            0 => SessionTagEnum::RspCommand,
            1 => SessionTagEnum::RspAuth1Command,
            _ => SessionTagEnum::RspAuth2Command,
        };
        let succeeded = header.base_validation(expected_tag, bytes.len())?;

        if !succeeded {
            return Ok(Self {
                header,
                params: Vec::new(),
                auth1: None,
                auth2: None,
            });
        }

        let auth_bytes = expected_auths * size_of::<ReplyAuth>();
        if rest.len() < auth_bytes {
            return Err(ResponseValidationError::HeaderResponseSizeMismatch {
                size: header.size.get(),
                expected_size: size_of::<ReplyHeader>() + auth_bytes,
            });
        }

        let params = rest[..rest.len() - auth_bytes].to_vec();
        let mut auths = rest[rest.len() - auth_bytes..]
            .chunks_exact(size_of::<ReplyAuth>())
            .map(|c| ReplyAuth::read_from_bytes(c).expect("chunk is exactly one trailer"));

        Ok(Self {
            header,
            params,
            auth1: auths.next(),
            auth2: auths.next(),
        })
    }

    pub fn return_code(&self) -> u32 {
        self.header.return_code.get()
    }
}

// === Per-command parameter areas === //

/// OSAP request parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OsapParams {
    pub entity_type: u16_be,
    pub entity_value: u32_be,
    pub nonce_odd_osap: [u8; NONCE_SIZE],
}

impl OsapParams {
    pub fn new(entity_type: EntityType, entity_value: u32, nonce_odd_osap: [u8; NONCE_SIZE]) -> Self {
        Self {
            entity_type: new_u16_be(entity_type as u16),
            entity_value: new_u32_be(entity_value),
            nonce_odd_osap,
        }
    }
}

/// OIAP reply parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OiapReply {
    pub auth_handle: u32_be,
    pub nonce_even: [u8; NONCE_SIZE],
}

/// OSAP reply parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OsapReply {
    pub auth_handle: u32_be,
    pub nonce_even: [u8; NONCE_SIZE],
    pub nonce_even_osap: [u8; NONCE_SIZE],
}

/// FlushSpecific parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FlushSpecificParams {
    pub handle: u32_be,
    pub resource_type: u32_be,
}

impl FlushSpecificParams {
    pub fn new(handle: u32, resource_type: ResourceType) -> Self {
        Self {
            handle: new_u32_be(handle),
            resource_type: new_u32_be(resource_type as u32),
        }
    }
}

/// CreateWrapKey parameters. The two auth digests are ADIP-encrypted under
/// the OSAP shared secret.
#[derive(Debug)]
pub struct CreateWrapKeyParams {
    pub data_usage_auth: [u8; SHA1_DIGEST_SIZE],
    pub data_migration_auth: [u8; SHA1_DIGEST_SIZE],
    pub key_info: Key12,
}

impl CreateWrapKeyParams {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(&self.data_usage_auth);
        buffer.extend_from_slice(&self.data_migration_auth);
        buffer.extend_from_slice(&self.key_info.serialize());

        buffer
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        let params = Self {
            data_usage_auth: reader.array()?,
            data_migration_auth: reader.array()?,
            key_info: Key12::deserialize(&mut reader)?,
        };
        reader.finish().then_some(params)
    }
}

/// AuthorizeMigrationKey parameters.
#[derive(Debug)]
pub struct AuthorizeMigrationKeyParams {
    pub migration_scheme: u16_be,
    pub migration_key: SizedBuffer,
}

impl AuthorizeMigrationKeyParams {
    pub fn new(scheme: MigrationScheme, migration_key: &[u8]) -> Result<Self, InvalidInput> {
        Ok(Self {
            migration_scheme: new_u16_be(scheme as u16),
            migration_key: SizedBuffer::new(migration_key)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(self.migration_scheme.as_bytes());
        buffer.extend_from_slice(&self.migration_key.serialize());

        buffer
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        let params = Self {
            migration_scheme: new_u16_be(reader.u16()?),
            migration_key: SizedBuffer::deserialize(&mut reader)?,
        };
        reader.finish().then_some(params)
    }
}

/// CreateMigrationBlob parameters; the ticket travels embedded as a sized
/// buffer holding a serialized [`MigrationKeyAuth`].
#[derive(Debug)]
pub struct CreateMigrationBlobParams {
    pub migration_type: u16_be,
    pub migration_key_auth: SizedBuffer,
    pub enc_data: SizedBuffer,
}

impl CreateMigrationBlobParams {
    pub fn new(
        scheme: MigrationScheme,
        ticket: &MigrationKeyAuth,
        enc_data: &[u8],
    ) -> Result<Self, InvalidInput> {
        Ok(Self {
            migration_type: new_u16_be(scheme as u16),
            migration_key_auth: SizedBuffer::new(&ticket.serialize())?,
            enc_data: SizedBuffer::new(enc_data)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(self.migration_type.as_bytes());
        buffer.extend_from_slice(&self.migration_key_auth.serialize());
        buffer.extend_from_slice(&self.enc_data.serialize());

        buffer
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        let params = Self {
            migration_type: new_u16_be(reader.u16()?),
            migration_key_auth: SizedBuffer::deserialize(&mut reader)?,
            enc_data: SizedBuffer::deserialize(&mut reader)?,
        };
        reader.finish().then_some(params)
    }
}

/// CreateMigrationBlob reply parameters.
#[derive(Debug)]
pub struct CreateMigrationBlobReply {
    pub random: SizedBuffer,
    pub out_data: SizedBuffer,
}

impl CreateMigrationBlobReply {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(&self.random.serialize());
        buffer.extend_from_slice(&self.out_data.serialize());

        buffer
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        let reply = Self {
            random: SizedBuffer::deserialize(&mut reader)?,
            out_data: SizedBuffer::deserialize(&mut reader)?,
        };
        reader.finish().then_some(reply)
    }
}

/// ConvertMigrationBlob parameters.
#[derive(Debug)]
pub struct ConvertMigrationBlobParams {
    pub in_data: SizedBuffer,
    pub random: SizedBuffer,
}

impl ConvertMigrationBlobParams {
    pub fn new(in_data: &[u8], random: &[u8]) -> Result<Self, InvalidInput> {
        Ok(Self {
            in_data: SizedBuffer::new(in_data)?,
            random: SizedBuffer::new(random)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(&self.in_data.serialize());
        buffer.extend_from_slice(&self.random.serialize());

        buffer
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        let params = Self {
            in_data: SizedBuffer::deserialize(&mut reader)?,
            random: SizedBuffer::deserialize(&mut reader)?,
        };
        reader.finish().then_some(params)
    }
}

/// NV_DefineSpace parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvDefineSpaceParams {
    pub pub_info: NvDataPublic,
    pub enc_auth: [u8; SHA1_DIGEST_SIZE],
}

/// NV_WriteValue parameters.
#[derive(Debug)]
pub struct NvWriteValueParams {
    pub index: u32_be,
    pub offset: u32_be,
    pub data: SizedBuffer,
}

impl NvWriteValueParams {
    pub fn new(index: u32, offset: u32, data: &[u8]) -> Result<Self, InvalidInput> {
        Ok(Self {
            index: new_u32_be(index),
            offset: new_u32_be(offset),
            data: SizedBuffer::new(data)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(self.index.as_bytes());
        buffer.extend_from_slice(self.offset.as_bytes());
        buffer.extend_from_slice(&self.data.serialize());

        buffer
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        let params = Self {
            index: new_u32_be(reader.u32()?),
            offset: new_u32_be(reader.u32()?),
            data: SizedBuffer::deserialize(&mut reader)?,
        };
        reader.finish().then_some(params)
    }
}

/// NV_ReadValue parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvReadValueParams {
    pub index: u32_be,
    pub offset: u32_be,
    pub size: u32_be,
}

impl NvReadValueParams {
    pub fn new(index: u32, offset: u32, size: u32) -> Self {
        Self {
            index: new_u32_be(index),
            offset: new_u32_be(offset),
            size: new_u32_be(size),
        }
    }
}

/// GetCapability parameters.
#[derive(Debug)]
pub struct GetCapabilityParams {
    pub cap_area: u32_be,
    pub sub_cap: SizedBuffer,
}

impl GetCapabilityParams {
    pub fn new(cap_area: CapArea, sub_cap: &[u8]) -> Result<Self, InvalidInput> {
        Ok(Self {
            cap_area: new_u32_be(cap_area as u32),
            sub_cap: SizedBuffer::new(sub_cap)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(self.cap_area.as_bytes());
        buffer.extend_from_slice(&self.sub_cap.serialize());

        buffer
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        let params = Self {
            cap_area: new_u32_be(reader.u32()?),
            sub_cap: SizedBuffer::deserialize(&mut reader)?,
        };
        reader.finish().then_some(params)
    }
}

/// Extend parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ExtendParams {
    pub pcr_index: u32_be,
    pub in_digest: [u8; SHA1_DIGEST_SIZE],
}

impl ExtendParams {
    pub fn new(pcr_index: u32, in_digest: [u8; SHA1_DIGEST_SIZE]) -> Self {
        Self {
            pcr_index: new_u32_be(pcr_index),
            in_digest,
        }
    }
}

/// EstablishTransport reply parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EstablishTransportReply {
    pub trans_handle: u32_be,
}

/// A cursor over a parameter area.
///
/// Every `deserialize` in this crate walks one of these; a `None` anywhere
/// means the frame was truncated or malformed.
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.bytes.split_first()?;
        self.bytes = rest;
        Some(b)
    }

    pub fn u16(&mut self) -> Option<u16> {
        let arr: [u8; 2] = self.array()?;
        Some(u16::from_be_bytes(arr))
    }

    pub fn u32(&mut self) -> Option<u32> {
        let arr: [u8; 4] = self.array()?;
        Some(u32::from_be_bytes(arr))
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < len {
            return None;
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Some(head)
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Some(out)
    }

    /// True if the cursor consumed the input exactly.
    pub fn finish(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The unconsumed remainder.
    pub fn remaining(&self) -> &'a [u8] {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame_round_trip() {
        let auth = CmdAuth::new(0x02000001, [0xaa; NONCE_SIZE], true, [0xbb; SHA1_DIGEST_SIZE]);
        let cmd = build_command(
            OrdinalEnum::LoadKey2,
            &[TPM12_KH_SRK],
            &[1, 2, 3, 4],
            &[auth],
        );

        // Header: tag C2, full size, ordinal 0x41.
        assert_eq!(&cmd[..2], &[0x00, 0xC2]);
        assert_eq!(cmd.len(), 10 + 4 + 4 + 45);
        assert_eq!(&cmd[6..10], &[0x00, 0x00, 0x00, 0x41]);

        let frame = CommandFrame::parse(&cmd, 1).unwrap();
        assert_eq!(frame.ordinal, OrdinalEnum::LoadKey2);
        assert_eq!(frame.handles, vec![TPM12_KH_SRK]);
        assert_eq!(frame.params, vec![1, 2, 3, 4]);
        let auth1 = frame.auth1.unwrap();
        assert_eq!(auth1.auth_handle.get(), 0x02000001);
        assert_eq!(auth1.nonce_odd, [0xaa; NONCE_SIZE]);
        assert_eq!(auth1.continue_auth, 1);
        assert!(frame.auth2.is_none());
    }

    #[test]
    fn test_two_session_frame() {
        let auth1 = CmdAuth::new(1, [0x01; NONCE_SIZE], false, [0x02; SHA1_DIGEST_SIZE]);
        let auth2 = CmdAuth::new(2, [0x03; NONCE_SIZE], false, [0x04; SHA1_DIGEST_SIZE]);
        let cmd = build_command(OrdinalEnum::CreateMigrationBlob, &[5], &[], &[auth1, auth2]);

        assert_eq!(&cmd[..2], &[0x00, 0xC3]);
        let frame = CommandFrame::parse(&cmd, 1).unwrap();
        assert_eq!(frame.auth1.unwrap().auth_handle.get(), 1);
        assert_eq!(frame.auth2.unwrap().auth_handle.get(), 2);
        assert!(frame.params.is_empty());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut cmd = build_command(OrdinalEnum::Oiap, &[], &[], &[]);
        cmd.push(0);
        assert!(matches!(
            CommandFrame::parse(&cmd, 0),
            Err(FrameError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_reply_is_header_only() {
        let reply = build_reply(ReturnCode::AuthFail, &[1, 2, 3], &[]);
        assert_eq!(reply.len(), size_of::<ReplyHeader>());

        // A failure parses regardless of how many sessions were requested.
        let frame = ReplyFrame::parse(&reply, 1).unwrap();
        assert_eq!(frame.return_code(), ReturnCode::AuthFail as u32);
        assert!(frame.params.is_empty());
        assert!(frame.auth1.is_none());
    }

    #[test]
    fn test_reply_round_trip() {
        let auth = ReplyAuth::new([0x11; NONCE_SIZE], true, [0x22; SHA1_DIGEST_SIZE]);
        let reply = build_reply(ReturnCode::Success, &[9, 9], &[auth]);

        let frame = ReplyFrame::parse(&reply, 1).unwrap();
        assert_eq!(frame.return_code(), 0);
        assert_eq!(frame.params, vec![9, 9]);
        assert_eq!(frame.auth1.unwrap().nonce_even, [0x11; NONCE_SIZE]);
    }

    #[test]
    fn test_key12_round_trip() {
        let parms = KeyParms::new_rsa(EncScheme::None, SigScheme::RsaSsaPkcs1v15Sha1, 2048);
        let key = Key12::new(
            KeyUsage::Signing,
            KeyFlags::new().with_migratable(true),
            AuthDataUsage::Always,
            parms,
            &[0x55; 256],
            &[0x66; 300],
        )
        .unwrap();

        let blob = key.serialize();
        let parsed = Key12::from_blob(&blob).unwrap();
        assert_eq!(parsed.key_usage.get(), KeyUsage::Signing as u16);
        assert!(parsed.flags().migratable());
        assert_eq!(parsed.parms.rsa_key_bits(), Some(2048));
        assert_eq!(parsed.pub_key.contents(), &[0x55; 256]);
        assert_eq!(parsed.enc_data.contents(), &[0x66; 300]);
    }

    #[test]
    fn test_key12_rejects_bad_tag() {
        let parms = KeyParms::new_rsa(EncScheme::None, SigScheme::None, 1024);
        let key = Key12::new(
            KeyUsage::Bind,
            KeyFlags::new(),
            AuthDataUsage::Never,
            parms,
            &[1],
            &[2],
        )
        .unwrap();

        let mut blob = key.serialize();
        blob[0] = 0xff;
        assert!(Key12::from_blob(&blob).is_none());
    }

    #[test]
    fn test_sized_buffer_too_large() {
        assert!(matches!(
            SizedBuffer::new(&[0u8; MAX_SIZED_BUFFER + 1]),
            Err(InvalidInput::BufferSizeTooLarge(..))
        ));
    }

    #[test]
    fn test_migration_key_auth_round_trip() {
        let ticket = MigrationKeyAuth::new(&[0x10; 128], MigrationScheme::Rewrap, [0x77; 20]).unwrap();
        let blob = ticket.serialize();
        let parsed = MigrationKeyAuth::from_blob(&blob).unwrap();
        assert_eq!(parsed.migration_scheme.get(), MigrationScheme::Rewrap as u16);
        assert_eq!(parsed.migration_key.contents(), &[0x10; 128]);
        assert_eq!(parsed.digest, [0x77; 20]);
    }

    #[test]
    fn test_srk_uuid_wire_form() {
        let bytes = SRK_UUID.to_bytes();
        assert_eq!(&bytes[..15], &[0u8; 15]);
        assert_eq!(bytes[15], 1);
        assert_eq!(Tpm12Uuid::from_bytes(bytes), SRK_UUID);
    }
}
