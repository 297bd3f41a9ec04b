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

use std::io::{Read, Seek, Write};

use resign_common::*;
use tracing::debug;

use crate::{
    byte_store::ByteStore,
    signing_block::{APK_SIGNING_BLOCK_MAGIC, APK_SIGNING_BLOCK_MIN_SIZE}
};

pub const EOCD_MAGIC: &[u8; 4] = &[0x50, 0x4B, 0x05, 0x06];
/// Size of the EOCD without its trailing comment
pub const EOCD_MIN_SIZE: u64 = 22;
pub const EOCD_MAX_COMMENT_LENGTH: u64 = u16::MAX as u64;
// Offset of the central directory offset field within the EOCD
const EOCD_CD_OFFSET_FIELD: u64 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_disk_number: u16,
    pub entries_on_disk: u16,
    pub entries_total: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>
}

impl EndOfCentralDirectory {
    pub fn comment_length(&self) -> u16 {
        self.comment.len() as u16
    }

    pub fn size(&self) -> u64 {
        EOCD_MIN_SIZE + self.comment.len() as u64
    }

    /// Serialises the record as it would appear on disk, but pointing at
    /// `cd_offset` instead of its own central directory offset.
    pub fn to_bytes_with_cd_offset(&self, cd_offset: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size() as usize);
        bytes.extend(EOCD_MAGIC);
        bytes.extend(self.disk_number.to_le_bytes());
        bytes.extend(self.cd_disk_number.to_le_bytes());
        bytes.extend(self.entries_on_disk.to_le_bytes());
        bytes.extend(self.entries_total.to_le_bytes());
        bytes.extend(self.cd_size.to_le_bytes());
        bytes.extend(cd_offset.to_le_bytes());
        bytes.extend(self.comment_length().to_le_bytes());
        bytes.extend(&self.comment);
        bytes
    }
}

/// Where each section of the archive lives.
///
/// ```text
/// | entries | APK Signing Block | Central Directory | EOCD |
/// 0         content_end         cd_start            eocd_start
/// ```
///
/// Without a signing block `content_end == cd_start`.
#[derive(Debug, Clone)]
pub struct ZipOffsets {
    // End of the ZIP entries, where a signing block starts (or would start)
    pub content_end: u64,
    // Central Directory (from start of file)
    pub cd_start: u64,
    // End of Central Directory (from start of file)
    pub eocd_start: u64,
    pub eocd: EndOfCentralDirectory
}

impl ZipOffsets {
    pub fn has_signing_block(&self) -> bool {
        self.content_end != self.cd_start
    }
}

/// Finds the End Of Central Directory record by scanning backwards from the
/// end of the store.
///
/// Only the last 22 + 65535 bytes are searched, since that's as far as a
/// maximum-length comment can push the record. A candidate only counts if its
/// comment length reaches exactly to the end of the archive, so a stray magic
/// inside the comment is skipped.
pub fn find_eocd<T: Read + Seek>(
    store: &mut ByteStore<T>
) -> Result<(u64, EndOfCentralDirectory)> {
    let len = store.len();
    if len < EOCD_MIN_SIZE {
        return Err(ResignError::SignerZipParsingFailed);
    }

    let window_start = len.saturating_sub(EOCD_MIN_SIZE + EOCD_MAX_COMMENT_LENGTH);
    store.seek(window_start)?;
    let window = store.read_bytes((len - window_start) as usize)?;

    let last_candidate = window.len() - EOCD_MIN_SIZE as usize;
    for i in (0..=last_candidate).rev() {
        if &window[i..(i + 4)] != EOCD_MAGIC {
            continue;
        }
        let comment_length = u16::from_le_bytes([window[i + 20], window[i + 21]]) as usize;
        if i + EOCD_MIN_SIZE as usize + comment_length != window.len() {
            continue;
        }

        let eocd_start = window_start + i as u64;
        let eocd = read_eocd(store, eocd_start)?;
        debug!(
            "Found EOCD at {eocd_start}, central directory at {} ({} bytes)",
            eocd.cd_offset, eocd.cd_size
        );
        return Ok((eocd_start, eocd));
    }

    Err(ResignError::SignerZipParsingFailed)
}

fn read_eocd<T: Read + Seek>(
    store: &mut ByteStore<T>,
    eocd_start: u64
) -> Result<EndOfCentralDirectory> {
    // Skip the magic, it's already been matched
    store.seek(eocd_start + 4)?;
    let disk_number = store.read_u16()?;
    let cd_disk_number = store.read_u16()?;
    let entries_on_disk = store.read_u16()?;
    let entries_total = store.read_u16()?;
    let cd_size = store.read_u32()?;
    let cd_offset = store.read_u32()?;
    let comment_length = store.read_u16()?;
    let comment = store.read_bytes(comment_length as usize)?;

    Ok(EndOfCentralDirectory {
        disk_number,
        cd_disk_number,
        entries_on_disk,
        entries_total,
        cd_size,
        cd_offset,
        comment
    })
}

/// Rewrites only the central directory offset of the EOCD at `eocd_start`.
pub fn patch_cd_offset<T: Write + Seek>(
    store: &mut ByteStore<T>,
    eocd_start: u64,
    cd_offset: u32
) -> Result<()> {
    store.seek(eocd_start + EOCD_CD_OFFSET_FIELD)?;
    store.write_u32(cd_offset)
}

/// Locates the EOCD, the central directory and any APK Signing Block that
/// already sits in front of the central directory.
pub fn find_offsets<T: Read + Seek>(store: &mut ByteStore<T>) -> Result<ZipOffsets> {
    let (eocd_start, eocd) = find_eocd(store)?;
    let cd_start = eocd.cd_offset as u64;
    let cd_size = eocd.cd_size as u64;

    // The central directory must run right up to the EOCD. This also rejects
    // ZIP64 archives, whose EOCD fields are all 0xFF placeholders.
    if cd_start.checked_add(cd_size) != Some(eocd_start) {
        return Err(ResignError::SignerZipSizeMismatch {
            cd_offset: cd_start,
            cd_size,
            eocd_offset: eocd_start
        });
    }

    let content_end = find_signing_block_start(store, cd_start)?.unwrap_or(cd_start);

    Ok(ZipOffsets {
        content_end,
        cd_start,
        eocd_start,
        eocd
    })
}

// The last 24 bytes of a signing block are its size and magic, so we can find
// its start by reading backwards from the central directory.
fn find_signing_block_start<T: Read + Seek>(
    store: &mut ByteStore<T>,
    cd_start: u64
) -> Result<Option<u64>> {
    if cd_start < APK_SIGNING_BLOCK_MIN_SIZE {
        return Ok(None);
    }

    store.seek(cd_start - APK_SIGNING_BLOCK_MAGIC.len() as u64)?;
    let magic = store.read_bytes(APK_SIGNING_BLOCK_MAGIC.len())?;
    if magic != APK_SIGNING_BLOCK_MAGIC {
        return Ok(None);
    }

    store.seek(cd_start - 24)?;
    let trailing_size = store.read_u64()?;
    let block_start = trailing_size
        .checked_add(8)
        .and_then(|total| cd_start.checked_sub(total))
        .filter(|_| trailing_size >= APK_SIGNING_BLOCK_MIN_SIZE - 8)
        .ok_or_else(|| {
            ResignError::SignerMalformedSigningBlock(format!(
                "size {trailing_size} does not fit before the central directory at {cd_start}"
            ))
        })?;

    store.seek(block_start)?;
    let leading_size = store.read_u64()?;
    if leading_size != trailing_size {
        return Err(ResignError::SignerSigningBlockSizeMismatch {
            leading: leading_size,
            trailing: trailing_size
        });
    }

    debug!("Found existing APK Signing Block at {block_start} ({} bytes)", trailing_size + 8);
    Ok(Some(block_start))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn eocd(cd_offset: u32, cd_size: u32, comment: &[u8]) -> EndOfCentralDirectory {
        EndOfCentralDirectory {
            disk_number: 0,
            cd_disk_number: 0,
            entries_on_disk: 1,
            entries_total: 1,
            cd_size,
            cd_offset,
            comment: comment.to_vec()
        }
    }

    // Fake entries + fake central directory + real EOCD
    fn archive(content_len: usize, cd_len: usize, comment: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x11; content_len];
        bytes.extend(vec![0x22; cd_len]);
        bytes.extend(eocd(content_len as u32, cd_len as u32, comment).to_bytes_with_cd_offset(content_len as u32));
        bytes
    }

    fn store(bytes: Vec<u8>) -> ByteStore<Cursor<Vec<u8>>> {
        ByteStore::new(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn finds_eocd_without_comment() {
        let bytes = archive(100, 46, b"");
        let len = bytes.len() as u64;
        let (start, record) = find_eocd(&mut store(bytes)).unwrap();
        assert_eq!(start, len - 22);
        assert_eq!(record, eocd(100, 46, b""));
    }

    #[test]
    fn finds_eocd_with_longest_comment() {
        let comment = vec![b'c'; u16::MAX as usize];
        let bytes = archive(10, 46, &comment);
        let len = bytes.len() as u64;
        let (start, record) = find_eocd(&mut store(bytes)).unwrap();
        assert_eq!(start, len - 22 - u16::MAX as u64);
        assert_eq!(record.comment_length(), u16::MAX);
        assert_eq!(record.cd_offset, 10);
    }

    #[test]
    fn skips_magic_inside_comment() {
        // A comment containing something that looks like an EOCD, but whose
        // comment length doesn't reach the end of the file
        let mut fake = eocd(0, 0, b"").to_bytes_with_cd_offset(0);
        fake.extend(b"xx");
        let bytes = archive(8, 46, &fake);
        let len = bytes.len() as u64;
        let (start, record) = find_eocd(&mut store(bytes)).unwrap();
        assert_eq!(start, len - 22 - fake.len() as u64);
        assert_eq!(record.cd_offset, 8);
    }

    #[test]
    fn short_archives_fail() {
        assert_matches!(find_eocd(&mut store(vec![])), Err(ResignError::SignerZipParsingFailed));
        assert_matches!(
            find_eocd(&mut store(EOCD_MAGIC.repeat(5))),
            Err(ResignError::SignerZipParsingFailed)
        );
    }

    #[test]
    fn search_stops_at_the_window() {
        // A valid empty archive followed by more than a maximum comment's
        // worth of junk is out of reach.
        let mut bytes = archive(0, 0, b"");
        bytes.extend(vec![0u8; (EOCD_MIN_SIZE + EOCD_MAX_COMMENT_LENGTH) as usize]);
        assert_matches!(find_eocd(&mut store(bytes)), Err(ResignError::SignerZipParsingFailed));
    }

    #[test]
    fn patching_touches_only_the_cd_offset() {
        let bytes = archive(4, 46, b"hello");
        let (start, record) = find_eocd(&mut store(bytes.clone())).unwrap();

        let mut patched = store(bytes.clone());
        patch_cd_offset(&mut patched, start, 0xDEADBEEF).unwrap();
        let patched = patched.into_inner().into_inner();

        assert_eq!(patched.len(), bytes.len());
        assert_eq!(&patched[..start as usize + 16], &bytes[..start as usize + 16]);
        assert_eq!(&patched[start as usize + 16..start as usize + 20], &0xDEADBEEFu32.to_le_bytes());
        assert_eq!(&patched[start as usize + 20..], &bytes[start as usize + 20..]);
        assert_eq!(
            &patched[start as usize..],
            record.to_bytes_with_cd_offset(0xDEADBEEF).as_slice()
        );
    }

    #[test]
    fn offsets_of_real_archive() {
        let files = [
            resign_zip::File {
                path: "AndroidManifest.xml".into(),
                data: b"<manifest/>".to_vec()
            },
            resign_zip::File {
                path: "classes.dex".into(),
                data: vec![7; 5000]
            },
        ];
        let mut buf = Cursor::new(Vec::new());
        resign_zip::zip_apk(&files, &mut buf).unwrap();
        let bytes = buf.into_inner();

        let offsets = find_offsets(&mut store(bytes.clone())).unwrap();
        let cd_start = offsets.cd_start as usize;
        // Central directory file header, then the EOCD right after it
        assert_eq!(&bytes[cd_start..cd_start + 4], b"PK\x01\x02");
        assert_eq!(&bytes[offsets.eocd_start as usize..][..4], EOCD_MAGIC);
        assert_eq!(offsets.eocd.entries_total, 2);
        assert_eq!(offsets.eocd_start as usize, bytes.len() - 22);
        assert!(!offsets.has_signing_block());
    }

    #[test]
    fn offsets_of_unsigned_archive() {
        let offsets = find_offsets(&mut store(archive(64, 46, b""))).unwrap();
        assert_eq!(offsets.content_end, 64);
        assert_eq!(offsets.cd_start, 64);
        assert_eq!(offsets.eocd_start, 110);
        assert!(!offsets.has_signing_block());
    }

    #[test]
    fn offsets_reject_inconsistent_central_directory() {
        let mut bytes = vec![0x11; 64];
        bytes.extend(eocd(10, 10, b"").to_bytes_with_cd_offset(10));
        assert_matches!(
            find_offsets(&mut store(bytes)),
            Err(ResignError::SignerZipSizeMismatch { cd_offset: 10, cd_size: 10, eocd_offset: 64 })
        );
    }

    #[test]
    fn offsets_detect_existing_signing_block() {
        let block = crate::signing_block::encode_signing_block(vec![
            crate::signing_types::SigningBlockIdValuePair {
                id: 0x42,
                value: vec![1, 2, 3]
            },
        ])
        .unwrap();

        let mut bytes = vec![0x11; 40];
        bytes.extend(&block);
        let cd_start = bytes.len() as u32;
        bytes.extend(vec![0x22; 46]);
        bytes.extend(eocd(cd_start, 46, b"").to_bytes_with_cd_offset(cd_start));

        let offsets = find_offsets(&mut store(bytes)).unwrap();
        assert_eq!(offsets.content_end, 40);
        assert_eq!(offsets.cd_start, cd_start as u64);
        assert!(offsets.has_signing_block());
    }

    #[test]
    fn offsets_reject_block_with_mismatched_sizes() {
        let mut block = crate::signing_block::encode_signing_block(vec![
            crate::signing_types::SigningBlockIdValuePair {
                id: 0x42,
                value: vec![]
            },
        ])
        .unwrap();
        // Corrupt the leading size
        block[0] ^= 0x01;

        let mut bytes = block;
        let cd_start = bytes.len() as u32;
        bytes.extend(eocd(cd_start, 0, b"").to_bytes_with_cd_offset(cd_start));

        assert_matches!(
            find_offsets(&mut store(bytes)),
            Err(ResignError::SignerSigningBlockSizeMismatch { .. })
        );
    }
}
