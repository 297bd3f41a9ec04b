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

use crate::{
    crypto_keys::CertificateBundle,
    hasher::Sha256Hash,
    signing_block::SIGNATURE_SCHEME_V2_BLOCK_ID,
    signing_types::{
        len_pfx_u32, Digest, Signature, SignatureAlgorithmId::*, SignatureSchemeV2Block,
        SignedData, Signer, SigningBlockIdValuePair
    }
};
use deku::DekuContainerWrite;
use resign_common::*;

// Constructs the Signed Data block for the V2 Scheme
// This is the data that gets signed by the crypto module
// It does not, itself, contain a cryptographic signature
impl SignedData {
    pub fn new(top_level_hash: Sha256Hash, bundle: &CertificateBundle) -> Result<SignedData> {
        Ok(SignedData {
            digests: len_pfx_u32(vec![len_pfx_u32(Digest {
                digest: len_pfx_u32(top_level_hash)?,
                signature_algorithm_id: RsaSsaPkcs1v1_5WithSha2_256
            })?])?,
            certificates: len_pfx_u32(vec![len_pfx_u32(bundle.certificate_der().to_vec())?])?,
            additional_attributes: 0
        })
    }
}

impl SignatureSchemeV2Block {
    pub fn new(
        signed_data: SignedData,
        signature: Vec<u8>,
        bundle: &CertificateBundle
    ) -> Result<SignatureSchemeV2Block> {
        Ok(SignatureSchemeV2Block {
            signers: len_pfx_u32(vec![len_pfx_u32(Signer {
                signed_data: len_pfx_u32(signed_data)?,
                signatures: len_pfx_u32(vec![len_pfx_u32(Signature {
                    signature_algorithm_id: RsaSsaPkcs1v1_5WithSha2_256,
                    signature: len_pfx_u32(signature)?
                })?])?,
                public_key: len_pfx_u32(bundle.subject_public_key_info_der()?)?
            })?])?
        })
    }

    /// Wraps the scheme block as the pair that goes into the APK Signing Block.
    pub fn into_pair(self) -> Result<SigningBlockIdValuePair> {
        Ok(SigningBlockIdValuePair {
            id: SIGNATURE_SCHEME_V2_BLOCK_ID,
            value: self.to_bytes()?
        })
    }
}
