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

//! Encoding and decoding of the APK Signing Block container: a list of
//! ID -> value pairs bracketed by two copies of its size and a magic footer.

use std::io::Cursor;

use deku::DekuContainerWrite;
use resign_common::*;

use crate::{
    byte_store::ByteStore,
    signing_types::{len_pfx_u64, ApkSigningBlock, SigningBlockIdValuePair, SigningBlockPairs}
};

pub const SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109871A;
pub const APK_SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";
/// Two sizes and a magic, no pairs
pub const APK_SIGNING_BLOCK_MIN_SIZE: u64 = 8 + 8 + 16;

impl ApkSigningBlock {
    pub fn new(pairs: Vec<SigningBlockIdValuePair>) -> Result<ApkSigningBlock> {
        let pairs = SigningBlockPairs {
            pairs: pairs.into_iter().map(len_pfx_u64).collect::<Result<_>>()?
        };

        let pairs_length = pairs.to_bytes()?.len();
        // Plus size_of_self_counted plus magic
        let sig_block_size = (pairs_length + 8 + 16) as u64;

        Ok(ApkSigningBlock {
            size_of_self_not_counted: sig_block_size,
            pairs,
            size_of_self_counted: sig_block_size,
            magic: *APK_SIGNING_BLOCK_MAGIC
        })
    }
}

pub fn encode_signing_block(pairs: Vec<SigningBlockIdValuePair>) -> Result<Vec<u8>> {
    Ok(ApkSigningBlock::new(pairs)?.to_bytes()?)
}

/// Parses a complete APK Signing Block, as cut out of an archive, back into
/// its pairs.
pub fn decode_signing_block(block: &[u8]) -> Result<Vec<SigningBlockIdValuePair>> {
    let malformed = |reason: String| ResignError::SignerMalformedSigningBlock(reason);

    let block_len = block.len() as u64;
    if block_len < APK_SIGNING_BLOCK_MIN_SIZE {
        return Err(malformed(format!("{block_len} bytes is too short")));
    }

    let mut store = ByteStore::new(Cursor::new(block))?;
    let leading_size = store.read_u64()?;
    store.seek(block_len - 24)?;
    let trailing_size = store.read_u64()?;
    if leading_size != trailing_size {
        return Err(ResignError::SignerSigningBlockSizeMismatch {
            leading: leading_size,
            trailing: trailing_size
        });
    }
    match store.read_string(APK_SIGNING_BLOCK_MAGIC.len()) {
        Ok(magic) if magic.as_bytes() == APK_SIGNING_BLOCK_MAGIC => {}
        Ok(_) | Err(ResignError::NotAscii(_)) => return Err(ResignError::SignerSigningBlockBadMagic),
        Err(e) => return Err(e)
    }
    if leading_size != block_len - 8 {
        return Err(malformed(format!(
            "declared size {leading_size} but {} bytes follow it",
            block_len - 8
        )));
    }

    let pairs_end = block_len - 24;
    let mut pairs = vec![];
    store.seek(8)?;
    while store.position() < pairs_end {
        let pair_start = store.position();
        if pairs_end - pair_start < 8 {
            return Err(malformed(format!("truncated pair length at {pair_start}")));
        }
        let pair_len = store.read_u64()?;
        if pair_len < 4 || pair_len > pairs_end - store.position() {
            return Err(malformed(format!("pair at {pair_start} has bad length {pair_len}")));
        }
        let id = store.read_u32()?;
        let value = store.read_bytes((pair_len - 4) as usize)?;
        pairs.push(SigningBlockIdValuePair { id, value });
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn pair(id: u32, value: Vec<u8>) -> SigningBlockIdValuePair {
        SigningBlockIdValuePair { id, value }
    }

    #[test]
    fn layout_matches_the_format() {
        let encoded = encode_signing_block(vec![pair(SIGNATURE_SCHEME_V2_BLOCK_ID, vec![0xAB])]).unwrap();

        // size + (pair length + id + value) + size + magic
        assert_eq!(encoded.len(), 8 + (8 + 4 + 1) + 8 + 16);
        let size = (encoded.len() - 8) as u64;
        assert_eq!(&encoded[..8], &size.to_le_bytes());
        assert_eq!(&encoded[8..16], &5u64.to_le_bytes());
        assert_eq!(&encoded[16..20], &[0x1A, 0x87, 0x09, 0x71]);
        assert_eq!(encoded[20], 0xAB);
        assert_eq!(&encoded[21..29], &size.to_le_bytes());
        assert_eq!(&encoded[29..], APK_SIGNING_BLOCK_MAGIC);
    }

    #[test]
    fn round_trips_values_of_any_size() {
        let pairs = vec![
            pair(SIGNATURE_SCHEME_V2_BLOCK_ID, vec![]),
            pair(0x42726577, vec![7]),
            pair(0x504b4453, (0..70_000).map(|i| i as u8).collect()),
        ];

        let encoded = encode_signing_block(pairs.clone()).unwrap();
        assert_eq!(decode_signing_block(&encoded).unwrap(), pairs);
    }

    #[test]
    fn rejects_disagreeing_sizes() {
        let mut encoded = encode_signing_block(vec![pair(1, vec![1, 2])]).unwrap();
        let trailing = encoded.len() - 24;
        encoded[trailing] += 1;
        assert_matches!(
            decode_signing_block(&encoded),
            Err(ResignError::SignerSigningBlockSizeMismatch { .. })
        );
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut encoded = encode_signing_block(vec![pair(1, vec![1, 2])]).unwrap();
        let last = encoded.len() - 1;
        encoded[last] = b'3';
        assert_matches!(
            decode_signing_block(&encoded),
            Err(ResignError::SignerSigningBlockBadMagic)
        );

        // Binary garbage in the footer is a bad magic too, not a string error
        encoded[last] = 0xFF;
        assert_matches!(
            decode_signing_block(&encoded),
            Err(ResignError::SignerSigningBlockBadMagic)
        );
    }

    #[test]
    fn rejects_pairs_running_past_the_end() {
        let mut encoded = encode_signing_block(vec![pair(1, vec![1, 2])]).unwrap();
        encoded[8] = 0xFF;
        assert_matches!(
            decode_signing_block(&encoded),
            Err(ResignError::SignerMalformedSigningBlock(_))
        );
        assert_matches!(
            decode_signing_block(&encoded[..20]),
            Err(ResignError::SignerMalformedSigningBlock(_))
        );
    }
}
