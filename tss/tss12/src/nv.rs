// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Non-volatile storage operations.
//!
//! An NV object accumulates its index, permissions and size as attributes;
//! defining the space freezes them. Reads and writes go out under the
//! owner secret when one is reachable, unauthorized otherwise - the
//! authority decides whether the permission bits allow that.

use crate::context::Context;
use crate::error::TssError;
use crate::error::TssResult;
use crate::handle::Handle;
use crate::policy::WELL_KNOWN_SECRET;
use tpm12_proto::NvDataPublic;
use tpm12_proto::NvDefineSpaceParams;
use tpm12_proto::NvPermission;
use tpm12_proto::NvReadValueParams;
use tpm12_proto::NvWriteValueParams;
use tpm12_proto::OrdinalEnum;
use tpm12_proto::Reader;
use tpm12_proto::ResponseValidationError;
use tpm12_proto::SizedBuffer;
use zerocopy::IntoBytes;

impl Context {
    /// Define the NV area described by the object's attributes. Index and
    /// data size must have been assigned first.
    pub fn nv_define_space(&mut self, nv: Handle) -> TssResult<()> {
        let nv_obj = self.objects.get(nv)?.as_nv()?;
        if nv_obj.defined {
            return Err(TssError::BadParameter(
                "nv space is already defined through this object",
            ));
        }
        let index = nv_obj
            .index
            .ok_or(TssError::BadParameter("nv index not set"))?;
        let data_size = nv_obj
            .data_size
            .ok_or(TssError::BadParameter("nv data size not set"))?;
        let permissions = nv_obj.permissions;
        let policy = nv_obj.usage_policy;

        let params = NvDefineSpaceParams {
            pub_info: NvDataPublic::new(index, NvPermission::from(permissions), data_size),
            enc_auth: WELL_KNOWN_SECRET,
        };

        match self.reachable_secret(policy)? {
            Some(secret) => {
                self.authorized_call(
                    OrdinalEnum::NvDefineSpace,
                    &[],
                    params.as_bytes(),
                    nv,
                    &secret,
                )?;
            }
            None => {
                self.plain_call(OrdinalEnum::NvDefineSpace, &[], params.as_bytes())?;
            }
        }

        self.objects.get_mut(nv)?.as_nv_mut()?.defined = true;
        Ok(())
    }

    /// Release the NV area (a define with size zero). Frees the index for
    /// redefinition.
    pub fn nv_release_space(&mut self, nv: Handle) -> TssResult<()> {
        let nv_obj = self.objects.get(nv)?.as_nv()?;
        let index = nv_obj
            .index
            .ok_or(TssError::BadParameter("nv index not set"))?;
        let policy = nv_obj.usage_policy;

        let params = NvDefineSpaceParams {
            pub_info: NvDataPublic::new(index, NvPermission::new(), 0),
            enc_auth: WELL_KNOWN_SECRET,
        };

        match self.reachable_secret(policy)? {
            Some(secret) => {
                self.authorized_call(
                    OrdinalEnum::NvDefineSpace,
                    &[],
                    params.as_bytes(),
                    nv,
                    &secret,
                )?;
            }
            None => {
                self.plain_call(OrdinalEnum::NvDefineSpace, &[], params.as_bytes())?;
            }
        }

        self.objects.get_mut(nv)?.as_nv_mut()?.defined = false;
        Ok(())
    }

    /// Write bytes into the NV area at the given offset.
    pub fn nv_write(&mut self, nv: Handle, offset: u32, data: &[u8]) -> TssResult<()> {
        let nv_obj = self.objects.get(nv)?.as_nv()?;
        let index = nv_obj
            .index
            .ok_or(TssError::BadParameter("nv index not set"))?;
        let policy = nv_obj.usage_policy;

        let params = NvWriteValueParams::new(index, offset, data)?.serialize();
        match self.reachable_secret(policy)? {
            Some(secret) => {
                self.authorized_call(OrdinalEnum::NvWriteValue, &[], &params, nv, &secret)?;
            }
            None => {
                self.plain_call(OrdinalEnum::NvWriteValue, &[], &params)?;
            }
        }
        Ok(())
    }

    /// Read bytes from the NV area at the given offset.
    pub fn nv_read(&mut self, nv: Handle, offset: u32, len: u32) -> TssResult<Vec<u8>> {
        let nv_obj = self.objects.get(nv)?.as_nv()?;
        let index = nv_obj
            .index
            .ok_or(TssError::BadParameter("nv index not set"))?;
        let policy = nv_obj.usage_policy;

        let params = NvReadValueParams::new(index, offset, len);
        let out = match self.reachable_secret(policy)? {
            Some(secret) => self.authorized_call(
                OrdinalEnum::NvReadValue,
                &[],
                params.as_bytes(),
                nv,
                &secret,
            )?,
            None => self.plain_call(OrdinalEnum::NvReadValue, &[], params.as_bytes())?,
        };

        let mut reader = Reader::new(&out);
        let data = SizedBuffer::deserialize(&mut reader)
            .ok_or(TssError::Protocol(ResponseValidationError::MalformedParameters))?;
        Ok(data.contents().to_vec())
    }
}
