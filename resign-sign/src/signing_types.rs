// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire structures of the APK Signing Block and the v2 scheme block inside it.
//!
//! Field names follow the APK Signature Scheme v2 documentation. Everything is
//! little-endian; sequences are written as a length prefix followed by the
//! elements, each with its own length prefix.

use deku::prelude::*;
use resign_common::*;

use crate::hasher::Sha256Hash;

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct ApkSigningBlock {
    /// Byte count of everything after this field, the trailing size and magic
    /// included. Both size fields hold this same value.
    pub size_of_self_not_counted: u64,
    pub pairs: SigningBlockPairs,
    pub size_of_self_counted: u64,
    pub magic: [u8; 16]
}

/// Kept apart from [ApkSigningBlock] so the pairs can be measured before the
/// sizes around them are known.
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SigningBlockPairs {
    pub pairs: Vec<U64LengthPrefixed<SigningBlockIdValuePair>>
}

#[derive(Debug, PartialEq, Eq, DekuWrite, Clone)]
pub struct SigningBlockIdValuePair {
    pub id: u32,
    pub value: Vec<u8>
}

/// Value of the v2 pair.
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SignatureSchemeV2Block {
    pub signers: U32LengthPrefixed<Vec<U32LengthPrefixed<Signer>>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Signer {
    pub signed_data: U32LengthPrefixed<SignedData>,
    pub signatures: U32LengthPrefixed<Vec<U32LengthPrefixed<Signature>>>,
    /// SubjectPublicKeyInfo, DER
    pub public_key: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Signature {
    pub signature_algorithm_id: SignatureAlgorithmId,
    pub signature: U32LengthPrefixed<Vec<u8>>
}

/// The part of a [Signer] that its signatures cover, byte for byte as
/// serialised.
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SignedData {
    pub digests: U32LengthPrefixed<Vec<U32LengthPrefixed<Digest>>>,
    /// DER certificates, leaf first
    pub certificates: U32LengthPrefixed<Vec<U32LengthPrefixed<Vec<u8>>>>,
    /// Always 0: no additional attributes
    pub additional_attributes: u32
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Digest {
    pub signature_algorithm_id: SignatureAlgorithmId,
    pub digest: U32LengthPrefixed<Sha256Hash>
}

#[derive(Debug, PartialEq, DekuWrite, Clone, Copy)]
#[deku(id_type = "u32")]
pub enum SignatureAlgorithmId {
    #[deku(id = 0x0103)]
    RsaSsaPkcs1v1_5WithSha2_256
}

/// Outer signing block pairs carry u64 lengths.
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct U64LengthPrefixed<T: DekuWriter> {
    pub length: u64,
    pub value: T
}

/// Everything inside the v2 block carries u32 lengths.
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct U32LengthPrefixed<T: DekuWriter> {
    pub length: u32,
    pub value: T
}

// Lets a bare field be serialised on its own, to measure it
#[derive(DekuWrite, Clone)]
struct Measured<T: DekuWriter> {
    value: T
}

fn serialised_len<T: DekuWriter + Clone>(thing: &T) -> Result<usize> {
    let measured = Measured {
        value: thing.clone()
    };
    Ok(measured.to_bytes()?.len())
}

pub fn len_pfx_u32<T: DekuWriter + Clone>(thing: T) -> Result<U32LengthPrefixed<T>> {
    let length = serialised_len(&thing)?;
    let length = u32::try_from(length).map_err(|_| {
        ResignError::SignerMalformedSigningBlock(format!("{length} byte field overflows a u32 length"))
    })?;
    Ok(U32LengthPrefixed { length, value: thing })
}

pub fn len_pfx_u64<T: DekuWriter + Clone>(thing: T) -> Result<U64LengthPrefixed<T>> {
    let length = serialised_len(&thing)? as u64;
    Ok(U64LengthPrefixed { length, value: thing })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_count_serialised_bytes() {
        let nested = len_pfx_u32(vec![len_pfx_u32(vec![1u8, 2, 3]).unwrap()]).unwrap();
        // Inner: 4 byte length + 3 bytes
        assert_eq!(nested.length, 7);
        let bytes = RawBytes(nested).to_bytes().unwrap();
        assert_eq!(bytes, [7, 0, 0, 0, 3, 0, 0, 0, 1, 2, 3]);

        let pair = len_pfx_u64(SigningBlockIdValuePair {
            id: 0x7109871A,
            value: vec![0xAB]
        })
        .unwrap();
        assert_eq!(pair.length, 5);
    }

    #[test]
    fn digest_layout() {
        let digest = Digest {
            signature_algorithm_id: SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_256,
            digest: len_pfx_u32([9; 32]).unwrap()
        };
        let bytes = digest.to_bytes().unwrap();
        assert_eq!(&bytes[..8], &[0x03, 0x01, 0, 0, 32, 0, 0, 0]);
        assert_eq!(&bytes[8..], &[9; 32]);
    }

    #[derive(DekuWrite)]
    struct RawBytes<T: DekuWriter>(T);
}
