// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Operations on the distinguished TPM object: capability queries, the
//! RNG, and PCR access.

use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::handle::Handle;
use crate::object::Object;
use tpm12_proto::CapArea;
use tpm12_proto::ExtendParams;
use tpm12_proto::GetCapabilityParams;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::Reader;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::SHA1_DIGEST_SIZE;
use tpm12_proto::SizedBuffer;
use tpm12_proto::TpmVersion;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

impl Context {
    /// Query a capability area. The reply payload is area-specific.
    pub fn get_capability(&mut self, area: CapArea, sub_cap: &[u8]) -> TssResult<Vec<u8>> {
        let params = GetCapabilityParams::new(area, sub_cap)?.serialize();
        let out = self.plain_call(OrdinalEnum::GetCapability, &[], &params)?;

        let mut reader = Reader::new(&out);
        let resp = SizedBuffer::deserialize(&mut reader)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        Ok(resp.contents().to_vec())
    }

    /// Convenience wrapper over the version capability.
    pub fn tpm_version(&mut self) -> TssResult<TpmVersion> {
        let resp = self.get_capability(CapArea::VersionVal, &[])?;
        TpmVersion::read_from_bytes(&resp[..])
            .map_err(|_| TssError::Protocol(ResponseValidationError::MalformedParameters))
    }

    /// Fetch random bytes from the authority's RNG.
    pub fn get_random(&mut self, len: u32) -> TssResult<Vec<u8>> {
        let out = self.plain_call(OrdinalEnum::GetRandom, &[], &len.to_be_bytes())?;

        let mut reader = Reader::new(&out);
        let random = SizedBuffer::deserialize(&mut reader)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        Ok(random.contents().to_vec())
    }

    /// Read one PCR.
    pub fn pcr_read(&mut self, index: u32) -> TssResult<[u8; SHA1_DIGEST_SIZE]> {
        let out = self.plain_call(OrdinalEnum::PcrRead, &[], &index.to_be_bytes())?;
        out[..]
            .try_into()
            .map_err(|_| TssError::Protocol(ResponseValidationError::MalformedParameters))
    }

    /// Read one PCR and record its value in a PCR composite object under
    /// the same index.
    pub fn pcr_read_into(&mut self, composite: Handle, index: u32) -> TssResult<()> {
        let value = self.pcr_read(index)?;
        match self.objects.get_mut(composite)? {
            Object::Pcrs(pcrs) => {
                pcrs.values.insert(index, value);
                Ok(())
            }
            _ => Err(TssError::BadParameter(
                "handle does not refer to a pcr composite",
            )),
        }
    }

    /// Extend one PCR with a digest, returning the new PCR value.
    pub fn pcr_extend(
        &mut self,
        index: u32,
        digest: [u8; SHA1_DIGEST_SIZE],
    ) -> TssResult<[u8; SHA1_DIGEST_SIZE]> {
        let params = ExtendParams::new(index, digest);
        let out = self.plain_call(OrdinalEnum::Extend, &[], params.as_bytes())?;
        out[..]
            .try_into()
            .map_err(|_| TssError::Protocol(ResponseValidationError::MalformedParameters))
    }
}
