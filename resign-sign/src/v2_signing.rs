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

//! APK Signature Scheme v2, based on
//! https://source.android.com/docs/security/features/apksigning/v2

use std::{
    fs::File,
    io::{BufReader, Cursor, Read, Seek},
    path::Path
};

use resign_common::Result;
use tracing::{debug, info};

use crate::{
    byte_store::ByteStore,
    crypto::get_signature_for_signed_data,
    crypto_keys::CertificateBundle,
    hasher::{compute_top_level_hash, Sha256Hash},
    signing_block::encode_signing_block,
    signing_types::{SignatureSchemeV2Block, SignedData},
    write_file_atomically,
    zip_parser::find_offsets,
    zip_rebuilder::rebuild_zip_with_signing_block
};

/// Builds the complete, encoded APK Signing Block for an archive whose content
/// digest is `top_level_hash`.
pub fn compute_signing_block(top_level_hash: Sha256Hash, bundle: &CertificateBundle) -> Result<Vec<u8>> {
    // Construct the data block that we're going to sign
    let signed_data = SignedData::new(top_level_hash, bundle)?;
    // Sign it with RSA
    let signature = get_signature_for_signed_data(&signed_data, bundle)?;
    // Create the whole APK Signature Scheme block
    let scheme_block = SignatureSchemeV2Block::new(signed_data, signature, bundle)?;
    // Create and serialise the entire APK Signing Block that goes straight into the zip file
    encode_signing_block(vec![scheme_block.into_pair()?])
}

/// Signs the archive in `zip_store`, returning the complete signed archive.
///
/// If the archive already carries an APK Signing Block it is replaced, not
/// nested.
pub fn sign_apk_store<T: Read + Seek>(
    zip_store: &mut ByteStore<T>,
    bundle: &CertificateBundle
) -> Result<Vec<u8>> {
    // Read ZIP file to find central directory
    let offsets = find_offsets(zip_store)?;
    if offsets.has_signing_block() {
        info!("Replacing existing APK Signing Block");
    }
    // SHA-256 hash of ZIP contents, minus any signing block
    let top_level_hash = compute_top_level_hash(zip_store, &offsets)?;
    debug!("Content digest computed over {} bytes", offsets.content_end);
    let signing_block = compute_signing_block(top_level_hash, bundle)?;
    // Build up the final zip file again
    rebuild_zip_with_signing_block(&offsets, zip_store, &signing_block)
}

/// Signs a ZIP file buffer, adding an APK Signing Block before its Central
/// Directory.
pub fn sign_apk_buffer(apk_buf: &[u8], bundle: &CertificateBundle) -> Result<Vec<u8>> {
    let mut zip_store = ByteStore::new(Cursor::new(apk_buf))?;
    sign_apk_store(&mut zip_store, bundle)
}

/// Signs the APK at `path` in place. The file is only replaced once the
/// signed archive has been fully built.
pub fn sign_v2_file(path: &Path, bundle: &CertificateBundle) -> Result<()> {
    let signed = {
        let mut zip_store = ByteStore::new(BufReader::new(File::open(path)?))?;
        sign_apk_store(&mut zip_store, bundle)?
    };
    write_file_atomically(path, &signed)
}
