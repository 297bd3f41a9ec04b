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

use std::{
    io::{Read, Seek},
    ops::Range
};

use sha2::{Digest, Sha256};

use crate::{byte_store::ByteStore, zip_parser::ZipOffsets};
use resign_common::*;

pub type Sha256Hash = [u8; 32];

pub const BYTES_IN_1MB: u32 = 1024 * 1024;
pub const FIRST_LEVEL_CHUNK_MAGIC: &[u8] = &[0xa5];
pub const SECOND_LEVEL_CHUNK_MAGIC: &[u8] = &[0x5a];

/// Computes the v2 content digest of an archive.
///
/// The Android Developer documentation calls the digested sections 1, 3 and 4
/// because the APK Signing Block is section 2, and that one is never hashed.
pub fn compute_top_level_hash<T: Read + Seek>(
    store: &mut ByteStore<T>,
    offsets: &ZipOffsets
) -> Result<Sha256Hash> {
    // Section 1: APK contents before the central directory (and before any
    // old signing block)
    let mut first_level_hashes = hash_section(store, 0..offsets.content_end)?;

    // Section 3: Central directories
    first_level_hashes.extend(hash_section(store, offsets.cd_start..offsets.eocd_start)?);

    // Section 4: The EOCD, as though the central directory started where the
    //   signing block does. For a freshly aligned APK those are the bytes on
    //   disk; for one that's already signed it's what the verifier rebuilds.
    let eocd = offsets
        .eocd
        .to_bytes_with_cd_offset(offsets.content_end as u32);
    first_level_hashes.extend(hash_chunks(&eocd));

    Ok(combine_chunk_hashes(&first_level_hashes))
}

/// Hashes `range` of the store 1MB at a time, reading each chunk straight into
/// a single reused buffer.
pub fn hash_section<T: Read + Seek>(
    store: &mut ByteStore<T>,
    range: Range<u64>
) -> Result<Vec<Sha256Hash>> {
    let mut hasher = Sha256::new();
    let mut chunk_hashes = vec![];
    let mut buf = vec![0; (range.end - range.start).min(BYTES_IN_1MB as u64) as usize];

    store.seek(range.start)?;
    let mut pos = range.start;
    while pos < range.end {
        // Each chunk is 1MB OR whatever's left in the section
        let chunk_size = (range.end - pos).min(BYTES_IN_1MB as u64) as usize;
        let chunk = &mut buf[..chunk_size];
        store.read_into(chunk)?;
        chunk_hashes.push(hash_one_chunk(&mut hasher, chunk));
        pos += chunk_size as u64;
    }

    Ok(chunk_hashes)
}

/// In-memory version of [hash_section].
pub fn hash_chunks(section: &[u8]) -> Vec<Sha256Hash> {
    let mut hasher = Sha256::new();
    section
        .chunks(BYTES_IN_1MB as usize)
        .map(|chunk| hash_one_chunk(&mut hasher, chunk))
        .collect()
}

pub fn combine_chunk_hashes(chunk_hashes: &[Sha256Hash]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(SECOND_LEVEL_CHUNK_MAGIC);
    hasher.update((chunk_hashes.len() as u32).to_le_bytes());
    for hash in chunk_hashes {
        hasher.update(hash);
    }
    hasher.finalize().into()
}

fn hash_one_chunk(hasher: &mut Sha256, chunk: &[u8]) -> Sha256Hash {
    hasher.update(FIRST_LEVEL_CHUNK_MAGIC);
    hasher.update((chunk.len() as u32).to_le_bytes());
    hasher.update(chunk);
    hasher.finalize_reset().into()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn store(bytes: Vec<u8>) -> ByteStore<Cursor<Vec<u8>>> {
        ByteStore::new(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn chunk_digest_prefixes_magic_and_length() {
        let mut expected = Sha256::new();
        expected.update([0xa5, 3, 0, 0, 0]);
        expected.update(b"abc");
        let expected: Sha256Hash = expected.finalize().into();

        assert_eq!(hash_chunks(b"abc"), vec![expected]);
    }

    #[test]
    fn sections_split_at_one_megabyte() {
        let bytes: Vec<u8> = (0..(2 * BYTES_IN_1MB + 10)).map(|i| (i % 251) as u8).collect();

        let streamed = hash_section(&mut store(bytes.clone()), 0..bytes.len() as u64).unwrap();
        assert_eq!(streamed.len(), 3);
        assert_eq!(streamed, hash_chunks(&bytes));
        assert_eq!(streamed[2], hash_chunks(&bytes[2 * BYTES_IN_1MB as usize..])[0]);
    }

    #[test]
    fn empty_sections_have_no_chunks() {
        assert!(hash_section(&mut store(vec![1, 2, 3]), 2..2).unwrap().is_empty());
        assert!(hash_chunks(&[]).is_empty());
    }

    #[test]
    fn digest_is_deterministic() {
        let bytes = b"some archive bytes".to_vec();
        let first = combine_chunk_hashes(&hash_section(&mut store(bytes.clone()), 0..18).unwrap());
        let second = combine_chunk_hashes(&hash_section(&mut store(bytes), 0..18).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn chunk_boundaries_change_the_digest() {
        let whole = combine_chunk_hashes(&hash_chunks(b"ab"));
        let mut split = hash_chunks(b"a");
        split.extend(hash_chunks(b"b"));
        let split = combine_chunk_hashes(&split);
        let naive: Sha256Hash = Sha256::digest(b"ab").into();

        assert_ne!(whole, split);
        assert_ne!(whole, naive);
    }
}
