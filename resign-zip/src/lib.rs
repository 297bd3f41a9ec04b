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

//! The small amount of entry-level zip handling the signer needs: listing
//! entries for the v1 manifest, swapping out `META-INF/`, and re-aligning.
//! Everything byte-level (EOCD, signing block) lives in resign-sign instead.

use resign_common::*;
use std::io::{Cursor, Read, Seek, Write};
use tracing::debug;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub struct File {
    pub path: String,
    pub data: Vec<u8>
}

/// Directory holding JAR signing metadata. Its contents are never digested.
pub const METADATA_DIR: &str = "META-INF/";

/// Stored native libraries must start on a page boundary to be mmapped.
const PAGE_ALIGNED_SUFFIX: &str = ".so";

/// Builds a new archive from `files` with every entry deflated and 4-byte
/// aligned, into a file or an in-memory buffer.
///
/// Nothing on the signing path creates archives from scratch. This is the
/// fixture builder that the workspace's tests use to make input APKs.
pub fn zip_apk<T: Write + Seek>(files: &[File], output: T) -> Result<()> {
    let mut zip = ZipWriter::new(output);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .with_alignment(4);

    for file in files {
        zip.start_file(file.path.as_str(), options)?;
        zip.write_all(&file.data)?;
    }

    zip.finish()?;
    Ok(())
}

/// Reads every file entry outside of `META-INF/`, uncompressed, in central
/// directory order.
pub fn read_content_entries(zip_buf: &[u8]) -> Result<Vec<File>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_buf))?;
    let mut files = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || entry.name().starts_with(METADATA_DIR) {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.push(File {
            path: entry.name().to_string(),
            data
        });
    }

    Ok(files)
}

/// Copies every entry outside of `META-INF/` byte for byte, drops everything
/// inside it, and appends `metadata` as new compressed entries.
pub fn replace_metadata_entries(zip_buf: &[u8], metadata: &[File]) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_buf))?;
    let mut zip = ZipWriter::new(Cursor::new(Vec::with_capacity(zip_buf.len())));

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        if entry.name().starts_with(METADATA_DIR) {
            debug!("Dropping old metadata entry {}", entry.name());
            continue;
        }
        zip.raw_copy_file(entry)?;
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for file in metadata {
        zip.start_file(file.path.as_str(), options)?;
        zip.write_all(&file.data)?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Rewrites the archive so that every entry's data starts on an `alignment`
/// boundary, or a `page_alignment` boundary for stored native libraries.
///
/// Entries keep their names, order, compression method, permissions and
/// timestamps. Anything between the entries and the central directory (such
/// as an old APK Signing Block) is dropped.
pub fn align_zip(zip_buf: &[u8], alignment: u16, page_alignment: u16) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_buf))?;
    let mut zip = ZipWriter::new(Cursor::new(Vec::with_capacity(zip_buf.len())));

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();

        if entry.is_dir() {
            zip.add_directory(name, SimpleFileOptions::default())?;
            continue;
        }

        let method = entry.compression();
        let entry_alignment =
            if method == CompressionMethod::Stored && name.ends_with(PAGE_ALIGNED_SUFFIX) {
                page_alignment
            } else {
                alignment
            };

        let mut options = SimpleFileOptions::default()
            .compression_method(method)
            .with_alignment(entry_alignment);
        if let Some(mode) = entry.unix_mode() {
            options = options.unix_permissions(mode);
        }
        if let Some(modified) = entry.last_modified() {
            options = options.last_modified_time(modified);
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        zip.start_file(name, options)?;
        zip.write_all(&data)?;
    }

    Ok(zip.finish()?.into_inner())
}
