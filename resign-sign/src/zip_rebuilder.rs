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

use std::io::{Cursor, Read, Seek};

use resign_common::*;
use tracing::debug;

use crate::{
    byte_store::ByteStore,
    zip_parser::{patch_cd_offset, ZipOffsets}
};

/// Splices `signing_block` in front of the central directory.
///
/// Sections are copied as-is; the only byte-level edit is the EOCD's
/// central directory offset. Any old signing block is left behind. The result
/// is assembled entirely in memory so nothing on disk is touched yet.
pub fn rebuild_zip_with_signing_block<T: Read + Seek>(
    offsets: &ZipOffsets,
    zip_store: &mut ByteStore<T>,
    signing_block: &[u8]
) -> Result<Vec<u8>> {
    let content_len = offsets.content_end;
    let block_len = signing_block.len() as u64;
    let cd_len = offsets.eocd_start - offsets.cd_start;
    let eocd_len = zip_store.len() - offsets.eocd_start;

    let new_cd_start = content_len + block_len;
    let new_cd_offset =
        u32::try_from(new_cd_start).map_err(|_| ResignError::SignerArchiveTooLarge(new_cd_start))?;

    let total_len = new_cd_start + cd_len + eocd_len;
    let mut final_apk = ByteStore::new(Cursor::new(vec![0u8; total_len as usize]))?;

    zip_store.copy_range_to(&mut final_apk, 0, content_len)?;
    final_apk.write_bytes(signing_block)?;
    zip_store.copy_range_to(&mut final_apk, offsets.cd_start, cd_len)?;
    let new_eocd_start = final_apk.position();
    zip_store.copy_range_to(&mut final_apk, offsets.eocd_start, eocd_len)?;
    patch_cd_offset(&mut final_apk, new_eocd_start, new_cd_offset)?;

    debug!(
        "Rebuilt archive: {content_len} content bytes, {block_len} byte signing block, central directory now at {new_cd_start}"
    );

    // Et voila
    Ok(final_apk.into_inner().into_inner())
}
