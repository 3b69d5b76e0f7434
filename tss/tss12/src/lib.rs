// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A TPM 1.2 client software stack.
//!
//! The stack manages opaque handles to typed objects under a [`Context`],
//! proves knowledge of policy secrets to the TPM through HMAC-SHA1
//! authorization sessions without ever transmitting them, maintains the
//! parent-wraps-child key hierarchy rooted at the Storage Root Key, drives
//! the multi-party key migration handshake, and can wrap command sequences
//! in audited transport sessions.
//!
//! The TPM itself sits behind the [`CommandChannel`] trait: anything that
//! can move a command blob and return the correlated reply blob works,
//! including the in-process software authority used by this repository's
//! tests.
//!
//! ```no_run
//! use tss12::Context;
//! use tss12::ObjectType;
//! use tss12::PolicyKind;
//! use tss12::SecretMode;
//! use tss12::init;
//! use tss12::proto::SRK_UUID;
//! use tss12::PsType;
//!
//! # fn channel() -> Box<dyn tss12::CommandChannel> { unimplemented!() }
//! # fn main() -> Result<(), tss12::TssError> {
//! let mut ctx = Context::new();
//! ctx.connect(channel())?;
//!
//! let srk = ctx.load_key_by_uuid(PsType::SYSTEM, SRK_UUID)?;
//! let srk_policy = ctx.get_policy_object(srk, PolicyKind::Usage)?;
//! ctx.set_policy_secret(srk_policy, SecretMode::Sha1, &[0u8; 20])?;
//!
//! let key = ctx.create_object(
//!     ObjectType::RsaKey,
//!     init::KEY_TYPE_SIGNING | init::KEY_SIZE_2048,
//! )?;
//! ctx.create_key(key, srk)?;
//! ctx.load_key(key, srk)?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod context;
mod error;
mod handle;
mod key;
mod migration;
mod nv;
mod object;
mod policy;
mod registry;
mod tpm;
mod transport;

pub use tpm12_proto as proto;

pub use channel::CommandChannel;
pub use channel::TransportError;
pub use context::Context;
pub use context::SharedRegistry;
pub use error::TssError;
pub use error::TssResult;
pub use handle::Handle;
pub use migration::MigrationTicket;
pub use object::ObjectType;
pub use object::PolicyKind;
pub use object::SecretMode;
pub use object::attrib;
pub use object::init;
pub use policy::WELL_KNOWN_SECRET;
pub use registry::FileKeyRegistry;
pub use registry::InMemoryRegistry;
pub use registry::KeyRegistry;
pub use registry::PsType;
pub use registry::PutOutcome;
pub use registry::RegistryEntry;
pub use registry::RegistryError;
