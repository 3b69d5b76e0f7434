// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The error taxonomy of the stack.
//!
//! Callers dispatch on these kinds; lower-layer errors stay attached as
//! sources and a TPM-layer failure that does not correspond to any caller
//! mistake keeps its raw return code in [`TssError::Tpm`].

use crate::channel::TransportError;
use crate::registry::RegistryError;
use thiserror::Error;
use tpm12_proto::InvalidInput;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::ReturnCode;

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TssError {
    /// A structurally invalid argument or an unmet protocol precondition.
    /// Always fixable by correcting the call; nothing was torn down.
    #[error("invalid parameter: {0}")]
    BadParameter(&'static str),

    /// The handle does not resolve in the calling context (unknown, foreign
    /// or already released).
    #[error("handle {0:#010x} does not resolve in this context")]
    InvalidHandle(u32),

    /// The authority rejected or failed the proof-of-knowledge exchange.
    /// The session involved has been destroyed.
    #[error("authorization proof mismatch")]
    AuthFail,

    /// No key is registered under the requested UUID and scope.
    #[error("no key registered under the requested uuid and scope")]
    KeyNotFound,

    /// A key is already registered under the requested UUID and scope.
    /// Non-fatal: idempotent registration flows continue past this.
    #[error("a key is already registered under the requested uuid and scope")]
    KeyAlreadyRegistered,

    /// Object-creation init flags are ambiguous or unrecognized.
    #[error("object init flags {0:#010x} are ambiguous or unrecognized")]
    InvalidObjectInitFlag(u32),

    /// The Command Channel failed. Never retried internally.
    #[error("command channel failure")]
    Transport(#[from] TransportError),

    /// The authority's reply failed structural validation.
    #[error("malformed reply from the authority")]
    Protocol(#[from] ResponseValidationError),

    /// An input does not fit the protocol's wire buffers.
    #[error("input does not fit a protocol buffer")]
    Encoding(#[from] InvalidInput),

    /// The persistent key registry failed.
    #[error("key registry failure")]
    Registry(#[from] RegistryError),

    /// The signature returned by the transport release does not match the
    /// locally maintained log digest. Individual command results observed
    /// inside the session remain valid; the log is evidence, not rollback.
    #[error("transport session log signature mismatch")]
    TransportIntegrity,

    /// A TPM-layer failure outside the caller-error taxonomy.
    #[error("{ordinal:?} failed at the authority with return code {code:#x}")]
    Tpm { ordinal: OrdinalEnum, code: u32 },
}

/// The canonical result type of the stack.
pub type TssResult<T> = Result<T, TssError>;

/// Map a non-success TPM return code onto the caller-facing taxonomy.
///
/// Codes that indicate a caller mistake fold into the structured kinds;
/// everything else is preserved verbatim as [`TssError::Tpm`].
pub(crate) fn map_tpm_error(ordinal: OrdinalEnum, code: u32) -> TssError {
    match ReturnCode::from_u32(code) {
        Some(ReturnCode::AuthFail) | Some(ReturnCode::Auth2Fail) => TssError::AuthFail,
        Some(ReturnCode::BadParameter)
        | Some(ReturnCode::BadIndex)
        | Some(ReturnCode::BadScheme)
        | Some(ReturnCode::WrongEntityType)
        | Some(ReturnCode::NoNvPermission)
        | Some(ReturnCode::NoSpace)
        | Some(ReturnCode::AreaLocked)
        | Some(ReturnCode::AuthConflict) => {
            TssError::BadParameter("rejected by the authority as structurally invalid")
        }
        Some(ReturnCode::InvalidKeyHandle) | Some(ReturnCode::InvalidAuthHandle) => {
            TssError::InvalidHandle(0)
        }
        Some(ReturnCode::KeyNotFound) => TssError::KeyNotFound,
        _ => TssError::Tpm { ordinal, code },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_codes_map_to_auth_fail() {
        assert!(matches!(
            map_tpm_error(OrdinalEnum::LoadKey2, ReturnCode::AuthFail as u32),
            TssError::AuthFail
        ));
        assert!(matches!(
            map_tpm_error(
                OrdinalEnum::CreateMigrationBlob,
                ReturnCode::Auth2Fail as u32
            ),
            TssError::AuthFail
        ));
    }

    #[test]
    fn test_unlisted_code_keeps_raw_value() {
        let err = map_tpm_error(OrdinalEnum::CreateMigrationBlob, ReturnCode::MigrateFail as u32);
        match err {
            TssError::Tpm { ordinal, code } => {
                assert_eq!(ordinal, OrdinalEnum::CreateMigrationBlob);
                assert_eq!(code, ReturnCode::MigrateFail as u32);
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
