// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SHA-1/HMAC primitives shared by the command handlers.

use hmac::Hmac;
use hmac::Mac;
use sha1::Digest;
use sha1::Sha1;
use tpm12_proto::SHA1_DIGEST_SIZE;

/// SHA-1 over the concatenation of the given chunks.
pub fn sha1(chunks: &[&[u8]]) -> [u8; SHA1_DIGEST_SIZE] {
    let mut hasher = Sha1::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// HMAC-SHA1 over the concatenation of the given chunks.
pub fn hmac_sha1(key: &[u8], chunks: &[&[u8]]) -> [u8; SHA1_DIGEST_SIZE] {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

/// The MGF1 mask generation function of PKCS#1, instantiated with SHA-1 as
/// the 1.2 specification does.
pub fn mgf1(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len.next_multiple_of(SHA1_DIGEST_SIZE));
    let mut counter = 0u32;
    while out.len() < len {
        out.extend_from_slice(&sha1(&[seed, &counter.to_be_bytes()]));
        counter += 1;
    }
    out.truncate(len);
    out
}

/// In-place XOR of `data` with `mask`; the lengths must match.
pub fn xor_mask(data: &mut [u8], mask: &[u8]) {
    assert_eq!(data.len(), mask.len());
    for (d, m) in data.iter_mut().zip(mask) {
        *d ^= m;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        // SHA1("abc")
        let digest = sha1(&[b"a", b"bc"]);
        assert_eq!(
            digest,
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
                0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
            ]
        );
    }

    #[test]
    fn test_mgf1_is_deterministic_and_sized() {
        let a = mgf1(b"seed", 65);
        let b = mgf1(b"seed", 65);
        assert_eq!(a, b);
        assert_eq!(a.len(), 65);
        assert_ne!(a, mgf1(b"other", 65));
    }

    #[test]
    fn test_xor_mask_round_trips() {
        let mask = mgf1(b"m", 8);
        let mut data = *b"datadata";
        xor_mask(&mut data, &mask);
        assert_ne!(&data, b"datadata");
        xor_mask(&mut data, &mask);
        assert_eq!(&data, b"datadata");
    }
}
