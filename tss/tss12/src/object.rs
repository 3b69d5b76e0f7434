// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-type object model and the attribute surface.
//!
//! Every object lives in its context's handle table as one variant of
//! [`Object`]. Attributes are addressed TSS-style by a `(flag, subflag)`
//! pair; each variant declares which ids it understands and in which
//! lifecycle window they may be written. Writes outside the window are
//! `BadParameter`, never silently ignored.

use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::handle::Handle;
use std::collections::BTreeMap;
use tpm12_proto::EncScheme;
use tpm12_proto::Key12;
use tpm12_proto::KeyUsage;
use tpm12_proto::SHA1_DIGEST_SIZE;
use tpm12_proto::SigScheme;
use tpm12_proto::Tpm12Uuid;

/// Object-creation init flags, per type.
pub mod init {
    /// Key usage selector: pick exactly one `KEY_TYPE_*`.
    pub const KEY_TYPE_DEFAULT: u32 = 0x0000_0000;
    pub const KEY_TYPE_SIGNING: u32 = 0x0000_0010;
    pub const KEY_TYPE_STORAGE: u32 = 0x0000_0020;
    pub const KEY_TYPE_IDENTITY: u32 = 0x0000_0030;
    pub const KEY_TYPE_AUTHCHANGE: u32 = 0x0000_0040;
    pub const KEY_TYPE_BIND: u32 = 0x0000_0050;
    pub const KEY_TYPE_LEGACY: u32 = 0x0000_0060;

    /// Key size selector: pick at most one `KEY_SIZE_*`.
    pub const KEY_SIZE_DEFAULT: u32 = 0x0000_0000;
    pub const KEY_SIZE_512: u32 = 0x0000_0100;
    pub const KEY_SIZE_1024: u32 = 0x0000_0200;
    pub const KEY_SIZE_2048: u32 = 0x0000_0300;
    pub const KEY_SIZE_4096: u32 = 0x0000_0400;
    pub const KEY_SIZE_8192: u32 = 0x0000_0500;
    pub const KEY_SIZE_16384: u32 = 0x0000_0600;

    pub const KEY_NON_VOLATILE: u32 = 0x0000_0000;
    pub const KEY_VOLATILE: u32 = 0x0000_0004;
    pub const KEY_NOT_MIGRATABLE: u32 = 0x0000_0000;
    pub const KEY_MIGRATABLE: u32 = 0x0000_0008;
    pub const KEY_NO_AUTHORIZATION: u32 = 0x0000_0000;
    pub const KEY_AUTHORIZATION: u32 = 0x0000_1000;

    pub(super) const KEY_TYPE_MASK: u32 = 0x0000_00F0;
    pub(super) const KEY_SIZE_MASK: u32 = 0x0000_0F00;
    pub(super) const KEY_KNOWN_MASK: u32 =
        KEY_TYPE_MASK | KEY_SIZE_MASK | KEY_VOLATILE | KEY_MIGRATABLE | KEY_AUTHORIZATION;

    /// Hash type selector: exactly one recognized value, no combinations.
    pub const HASH_DEFAULT: u32 = 0x0000_0000;
    pub const HASH_SHA1: u32 = 0x0000_0001;
    pub const HASH_OTHER: u32 = 0x0000_0002;

    /// Policy usage-kind selector.
    pub const POLICY_USAGE: u32 = 0x0000_0001;
    pub const POLICY_MIGRATION: u32 = 0x0000_0002;
}

/// Attribute ids, addressed as `(flag, subflag)` pairs.
pub mod attrib {
    /// u32 attributes of a key.
    pub const KEY_INFO: u32 = 0x0000_0080;
    pub const KEYINFO_SIZE: u32 = 0x01;
    pub const KEYINFO_USAGE: u32 = 0x02;
    pub const KEYINFO_MIGRATABLE: u32 = 0x03;
    pub const KEYINFO_VOLATILE: u32 = 0x04;
    pub const KEYINFO_AUTHDATAUSAGE: u32 = 0x05;
    pub const KEYINFO_SIGSCHEME: u32 = 0x06;
    pub const KEYINFO_ENCSCHEME: u32 = 0x07;

    /// Data attributes of a key.
    pub const KEY_BLOB: u32 = 0x0000_0040;
    pub const KEYBLOB_BLOB: u32 = 0x01;
    pub const KEYBLOB_PUBLIC_KEY: u32 = 0x02;

    /// u32 attributes of an NV store object (subflag 0).
    pub const NV_INDEX: u32 = 0x0000_0100;
    pub const NV_PERMISSIONS: u32 = 0x0000_0200;
    pub const NV_DATASIZE: u32 = 0x0000_0400;

    /// Data attribute of a hash object (subflag 0).
    pub const HASH_VALUE: u32 = 0x0000_0800;

    /// Data attribute of a PCR composite; the subflag selects the index.
    pub const PCR_VALUE: u32 = 0x0000_1000;

    /// u32 attribute of a policy (subflag 0).
    pub const POLICY_SECRET_LIFETIME: u32 = 0x0000_2000;
}

/// The caller-visible object types.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectType {
    /// An RSA key, created and wrapped under a loaded parent.
    RsaKey,
    /// An authorization policy carrying a write-only secret.
    Policy,
    /// A hash value container.
    Hash,
    /// A selection of PCR indices and their values.
    PcrComposite,
    /// A non-volatile storage area.
    NvStore,
}

/// The usage kind binding a policy to its object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PolicyKind {
    /// Authorizes ordinary use of the object.
    Usage,
    /// Authorizes migration of a key.
    Migration,
}

/// How a policy secret is supplied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecretMode {
    /// Arbitrary bytes, reduced to SHA-1 width by the stack.
    Plain,
    /// A 20-byte pre-hashed secret used verbatim.
    Sha1,
}

/// A policy secret. Write-only: once stored it is only ever fed into the
/// HMAC derivations, and it never appears in debug output.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Secret(pub [u8; SHA1_DIGEST_SIZE]);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

pub(crate) enum Object {
    Tpm(TpmObject),
    Key(KeyObject),
    Policy(PolicyObject),
    Hash(HashObject),
    Pcrs(PcrCompositeObject),
    Nv(NvObject),
}

pub(crate) struct TpmObject {
    pub usage_policy: Handle,
}

/// Where a key's parent came from; fixed once the wrap relationship exists.
#[derive(Debug, Copy, Clone)]
pub(crate) enum ParentRef {
    Live(Handle),
    Registered { uuid: Tpm12Uuid },
}

pub(crate) struct KeyObject {
    pub usage: KeyUsage,
    pub size_bits: u32,
    pub migratable: bool,
    pub volatile: bool,
    pub auth_required: bool,
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub usage_policy: Handle,
    pub migration_policy: Handle,
    /// The wrapped key, present once created, loaded from registry, or
    /// imported via the blob attribute.
    pub blob: Option<Key12>,
    /// The authority-side handle while loaded.
    pub tpm_handle: Option<u32>,
    pub parent: Option<ParentRef>,
}

impl KeyObject {
    /// Build a key object from init flags, validating the flag word.
    pub fn from_init_flags(
        flags: u32,
        usage_policy: Handle,
        migration_policy: Handle,
    ) -> TssResult<Self> {
        if flags & !init::KEY_KNOWN_MASK != 0 {
            return Err(TssError::InvalidObjectInitFlag(flags));
        }

        let usage = match flags & init::KEY_TYPE_MASK {
            init::KEY_TYPE_DEFAULT | init::KEY_TYPE_LEGACY => KeyUsage::Legacy,
            init::KEY_TYPE_SIGNING => KeyUsage::Signing,
            init::KEY_TYPE_STORAGE => KeyUsage::Storage,
            init::KEY_TYPE_IDENTITY => KeyUsage::Identity,
            init::KEY_TYPE_AUTHCHANGE => KeyUsage::AuthChange,
            init::KEY_TYPE_BIND => KeyUsage::Bind,
            _ => return Err(TssError::InvalidObjectInitFlag(flags)),
        };

        let size_bits = match flags & init::KEY_SIZE_MASK {
            init::KEY_SIZE_DEFAULT | init::KEY_SIZE_2048 => 2048,
            init::KEY_SIZE_512 => 512,
            init::KEY_SIZE_1024 => 1024,
            init::KEY_SIZE_4096 => 4096,
            init::KEY_SIZE_8192 => 8192,
            init::KEY_SIZE_16384 => 16384,
            _ => return Err(TssError::InvalidObjectInitFlag(flags)),
        };

        let (enc_scheme, sig_scheme) = default_schemes(usage);

        Ok(Self {
            usage,
            size_bits,
            migratable: flags & init::KEY_MIGRATABLE != 0,
            volatile: flags & init::KEY_VOLATILE != 0,
            auth_required: flags & init::KEY_AUTHORIZATION != 0,
            enc_scheme: enc_scheme as u16,
            sig_scheme: sig_scheme as u16,
            usage_policy,
            migration_policy,
            blob: None,
            tpm_handle: None,
            parent: None,
        })
    }

    pub fn is_created(&self) -> bool {
        self.blob.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.tpm_handle.is_some()
    }
}

fn default_schemes(usage: KeyUsage) -> (EncScheme, SigScheme) {
    match usage {
        KeyUsage::Storage | KeyUsage::Bind => (EncScheme::RsaEsOaepSha1Mgf1, SigScheme::None),
        KeyUsage::Signing => (EncScheme::None, SigScheme::RsaSsaPkcs1v15Sha1),
        _ => (EncScheme::None, SigScheme::None),
    }
}

pub(crate) struct PolicyObject {
    pub kind: PolicyKind,
    pub secret: Option<Secret>,
    pub lifetime: u32,
}

/// Hash algorithm selected at creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum HashAlg {
    Default,
    Sha1,
    Other,
}

pub(crate) struct HashObject {
    pub alg: HashAlg,
    pub value: Option<Vec<u8>>,
}

impl HashObject {
    pub fn from_init_flags(flags: u32) -> TssResult<Self> {
        let alg = match flags {
            init::HASH_DEFAULT => HashAlg::Default,
            init::HASH_SHA1 => HashAlg::Sha1,
            init::HASH_OTHER => HashAlg::Other,
            // Anything else is either no recognized selector or a
            // combination of mutually exclusive ones.
            _ => return Err(TssError::InvalidObjectInitFlag(flags)),
        };
        Ok(Self { alg, value: None })
    }
}

pub(crate) struct PcrCompositeObject {
    pub values: BTreeMap<u32, [u8; SHA1_DIGEST_SIZE]>,
}

pub(crate) struct NvObject {
    pub index: Option<u32>,
    pub permissions: u32,
    pub data_size: Option<u32>,
    pub defined: bool,
    pub usage_policy: Handle,
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Tpm(_) => "tpm",
            Object::Key(_) => "key",
            Object::Policy(_) => "policy",
            Object::Hash(_) => "hash",
            Object::Pcrs(_) => "pcr composite",
            Object::Nv(_) => "nv store",
        }
    }

    pub fn as_key(&self) -> TssResult<&KeyObject> {
        match self {
            Object::Key(key) => Ok(key),
            _ => Err(TssError::BadParameter("handle does not refer to a key")),
        }
    }

    pub fn as_key_mut(&mut self) -> TssResult<&mut KeyObject> {
        match self {
            Object::Key(key) => Ok(key),
            _ => Err(TssError::BadParameter("handle does not refer to a key")),
        }
    }

    pub fn as_policy(&self) -> TssResult<&PolicyObject> {
        match self {
            Object::Policy(policy) => Ok(policy),
            _ => Err(TssError::BadParameter("handle does not refer to a policy")),
        }
    }

    pub fn as_policy_mut(&mut self) -> TssResult<&mut PolicyObject> {
        match self {
            Object::Policy(policy) => Ok(policy),
            _ => Err(TssError::BadParameter("handle does not refer to a policy")),
        }
    }

    pub fn as_nv(&self) -> TssResult<&NvObject> {
        match self {
            Object::Nv(nv) => Ok(nv),
            _ => Err(TssError::BadParameter(
                "handle does not refer to an nv store object",
            )),
        }
    }

    pub fn as_nv_mut(&mut self) -> TssResult<&mut NvObject> {
        match self {
            Object::Nv(nv) => Ok(nv),
            _ => Err(TssError::BadParameter(
                "handle does not refer to an nv store object",
            )),
        }
    }

    pub fn as_tpm(&self) -> TssResult<&TpmObject> {
        match self {
            Object::Tpm(tpm) => Ok(tpm),
            _ => Err(TssError::BadParameter(
                "handle does not refer to the tpm object",
            )),
        }
    }
}

impl Context {
    /// Read a u32 attribute. Reads never mutate state.
    pub fn get_attrib_u32(&self, handle: Handle, flag: u32, sub: u32) -> TssResult<u32> {
        let object = self.objects.get(handle)?;
        match (object, flag) {
            (Object::Key(key), attrib::KEY_INFO) => match sub {
                attrib::KEYINFO_SIZE => Ok(key.size_bits),
                attrib::KEYINFO_USAGE => Ok(key.usage as u32),
                attrib::KEYINFO_MIGRATABLE => Ok(key.migratable as u32),
                attrib::KEYINFO_VOLATILE => Ok(key.volatile as u32),
                attrib::KEYINFO_AUTHDATAUSAGE => Ok(key.auth_required as u32),
                attrib::KEYINFO_SIGSCHEME => Ok(key.sig_scheme as u32),
                attrib::KEYINFO_ENCSCHEME => Ok(key.enc_scheme as u32),
                _ => Err(TssError::BadParameter("unknown key info attribute")),
            },
            (Object::Nv(nv), attrib::NV_INDEX) => nv
                .index
                .ok_or(TssError::BadParameter("nv index not yet assigned")),
            (Object::Nv(nv), attrib::NV_PERMISSIONS) => Ok(nv.permissions),
            (Object::Nv(nv), attrib::NV_DATASIZE) => nv
                .data_size
                .ok_or(TssError::BadParameter("nv data size not yet assigned")),
            (Object::Policy(policy), attrib::POLICY_SECRET_LIFETIME) => Ok(policy.lifetime),
            _ => Err(TssError::BadParameter(
                "attribute is not legal for this object type",
            )),
        }
    }

    /// Write a u32 attribute, enforcing each attribute's legality window.
    /// Writes are last-write-wins.
    pub fn set_attrib_u32(
        &mut self,
        handle: Handle,
        flag: u32,
        sub: u32,
        value: u32,
    ) -> TssResult<()> {
        let object = self.objects.get_mut(handle)?;
        match (object, flag) {
            (Object::Key(key), attrib::KEY_INFO) => match sub {
                // Scheme selection stays open after creation; everything
                // else is frozen with the wrap relationship.
                attrib::KEYINFO_SIGSCHEME => {
                    SigScheme::from_u16(value as u16)
                        .ok_or(TssError::BadParameter("unknown signature scheme"))?;
                    key.sig_scheme = value as u16;
                    Ok(())
                }
                attrib::KEYINFO_ENCSCHEME => {
                    EncScheme::from_u16(value as u16)
                        .ok_or(TssError::BadParameter("unknown encryption scheme"))?;
                    key.enc_scheme = value as u16;
                    Ok(())
                }
                attrib::KEYINFO_SIZE
                | attrib::KEYINFO_USAGE
                | attrib::KEYINFO_MIGRATABLE
                | attrib::KEYINFO_VOLATILE
                | attrib::KEYINFO_AUTHDATAUSAGE => {
                    if key.is_created() {
                        return Err(TssError::BadParameter(
                            "key attributes are immutable once the key is created",
                        ));
                    }
                    match sub {
                        attrib::KEYINFO_SIZE => key.size_bits = value,
                        attrib::KEYINFO_USAGE => {
                            key.usage = KeyUsage::from_u16(value as u16)
                                .ok_or(TssError::BadParameter("unknown key usage"))?
                        }
                        attrib::KEYINFO_MIGRATABLE => key.migratable = value != 0,
                        attrib::KEYINFO_VOLATILE => key.volatile = value != 0,
                        _ => key.auth_required = value != 0,
                    }
                    Ok(())
                }
                _ => Err(TssError::BadParameter("unknown key info attribute")),
            },
            (Object::Nv(nv), attrib::NV_INDEX | attrib::NV_PERMISSIONS | attrib::NV_DATASIZE) => {
                if nv.defined {
                    return Err(TssError::BadParameter(
                        "nv attributes are immutable once the space is defined",
                    ));
                }
                match flag {
                    attrib::NV_INDEX => nv.index = Some(value),
                    attrib::NV_PERMISSIONS => nv.permissions = value,
                    _ => nv.data_size = Some(value),
                }
                let _ = sub;
                Ok(())
            }
            (Object::Policy(policy), attrib::POLICY_SECRET_LIFETIME) => {
                policy.lifetime = value;
                Ok(())
            }
            _ => Err(TssError::BadParameter(
                "attribute is not legal for this object type",
            )),
        }
    }

    /// Read a data (byte sequence) attribute.
    pub fn get_attrib_data(&self, handle: Handle, flag: u32, sub: u32) -> TssResult<Vec<u8>> {
        let object = self.objects.get(handle)?;
        match (object, flag) {
            (Object::Key(key), attrib::KEY_BLOB) => {
                let blob = key
                    .blob
                    .as_ref()
                    .ok_or(TssError::BadParameter("key has not been created yet"))?;
                match sub {
                    attrib::KEYBLOB_BLOB => Ok(blob.serialize()),
                    attrib::KEYBLOB_PUBLIC_KEY => Ok(blob.pub_key.contents().to_vec()),
                    _ => Err(TssError::BadParameter("unknown key blob attribute")),
                }
            }
            (Object::Hash(hash), attrib::HASH_VALUE) => hash
                .value
                .clone()
                .ok_or(TssError::BadParameter("hash value not yet set")),
            (Object::Pcrs(pcrs), attrib::PCR_VALUE) => pcrs
                .values
                .get(&sub)
                .map(|v| v.to_vec())
                .ok_or(TssError::BadParameter("pcr index not selected")),
            _ => Err(TssError::BadParameter(
                "attribute is not legal for this object type",
            )),
        }
    }

    /// Write a data (byte sequence) attribute.
    pub fn set_attrib_data(
        &mut self,
        handle: Handle,
        flag: u32,
        sub: u32,
        data: &[u8],
    ) -> TssResult<()> {
        let object = self.objects.get_mut(handle)?;
        match (object, flag) {
            (Object::Key(key), attrib::KEY_BLOB) => match sub {
                attrib::KEYBLOB_BLOB => {
                    let blob = Key12::from_blob(data)
                        .ok_or(TssError::BadParameter("malformed key blob"))?;
                    key.size_bits = blob.parms.rsa_key_bits().unwrap_or(key.size_bits);
                    if let Some(usage) = KeyUsage::from_u16(blob.key_usage.get()) {
                        key.usage = usage;
                    }
                    key.migratable = blob.flags().migratable();
                    key.auth_required = blob.auth_data_usage != 0;
                    key.blob = Some(blob);
                    Ok(())
                }
                _ => Err(TssError::BadParameter("key blob attribute is read-only")),
            },
            (Object::Hash(hash), attrib::HASH_VALUE) => {
                if matches!(hash.alg, HashAlg::Default | HashAlg::Sha1)
                    && data.len() != SHA1_DIGEST_SIZE
                {
                    return Err(TssError::BadParameter(
                        "hash value length does not match the algorithm",
                    ));
                }
                hash.value = Some(data.to_vec());
                Ok(())
            }
            (Object::Pcrs(pcrs), attrib::PCR_VALUE) => {
                let value: [u8; SHA1_DIGEST_SIZE] = data
                    .try_into()
                    .map_err(|_| TssError::BadParameter("pcr value must be digest-sized"))?;
                pcrs.values.insert(sub, value);
                Ok(())
            }
            _ => Err(TssError::BadParameter(
                "attribute is not legal for this object type",
            )),
        }
    }
}
