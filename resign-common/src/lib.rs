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

use std::io;

use deku::prelude::*;
use rsa::{pkcs1, pkcs8};
use thiserror::Error;
use zip::result::ZipError;

/// Common error type making it easier to share `Result`s between the resign
/// crates.
///
/// In general designed to avoid needing utilities like `map_err`.
#[derive(Debug, Error)]
pub enum ResignError {
    /// resign-cli encountered an error while processing something specific to
    /// the command line implementation, such as an unreadable PEM path.
    #[error("{0}")]
    Cli(String),
    /// A read or write on a `ByteStore` would have crossed the end of the
    /// underlying buffer. Stores never grow implicitly.
    #[error("{requested} bytes at position {position} is out of range for a store of {length} bytes")]
    OutOfRange {
        position: u64,
        requested: u64,
        length: u64
    },
    /// A fixed-length string field contained bytes outside of ASCII.
    #[error("string field at position {0} is not ASCII")]
    NotAscii(u64),
    /// Something went wrong serialising one of the signing structures. See
    /// [DekuError].
    #[error("byte serialisation failed: {0}")]
    ByteSerialisationFailed(#[from] DekuError),
    /// An error occurred while reading or writing the archive on disk.
    #[error("I/O error: {0}")]
    FileIoError(#[from] io::Error),
    /// The `zip` crate failed to read or write an archive, either while
    /// enumerating entries for v1 signing or while aligning.
    #[error("zip error: {0}")]
    ZipFailed(#[from] ZipError),
    /// No ZIP End Of Central Directory record was found within the last
    /// 65557 bytes of the archive, or the archive is too short to hold one.
    #[error("not a valid archive: end of central directory not found")]
    SignerZipParsingFailed,
    /// The central directory offset and size in the EOCD don't line up with
    /// where the EOCD itself was found, or the archive is ZIP64.
    #[error("not a valid archive: central directory at {cd_offset} of size {cd_size} does not end at the EOCD ({eocd_offset})")]
    SignerZipSizeMismatch {
        cd_offset: u64,
        cd_size: u64,
        eocd_offset: u64
    },
    /// Inserting the signing block would push the central directory past the
    /// 4GB a plain (non-ZIP64) EOCD can point at.
    #[error("central directory would move to {0}, which a 32-bit offset can't hold")]
    SignerArchiveTooLarge(u64),
    /// An APK Signing Block was present (or being decoded) but its layout is
    /// broken: truncated, a pair runs past the end, or it starts before the
    /// beginning of the file.
    #[error("malformed APK signing block: {0}")]
    SignerMalformedSigningBlock(String),
    /// The two size fields of an APK Signing Block disagree.
    #[error("APK signing block size fields disagree: {leading} != {trailing}")]
    SignerSigningBlockSizeMismatch { leading: u64, trailing: u64 },
    /// The 16 bytes at the end of an APK Signing Block aren't
    /// `APK Sig Block 42`.
    #[error("APK signing block magic footer does not match")]
    SignerSigningBlockBadMagic,
    /// An error occurred while trying to parse the `.pem` blob.
    #[error("failed to parse PEM: {0}")]
    SignerPemParsingFailed(#[from] pem::PemError),
    /// The `.pem` blob was valid, but contained no `CERTIFICATE` section.
    #[error("certificate could not be loaded from PEM data")]
    SignerMissingCertificate,
    /// The `.pem` blob was valid, but contained no `PRIVATE KEY` or
    /// `RSA PRIVATE KEY` section.
    #[error("private key could not be loaded from PEM data")]
    SignerMissingPrivateKey,
    /// The `PRIVATE KEY` in the `.pem` was present, but it wasn't an RSA
    /// Private Key.
    #[error("failed to parse PKCS#8 private key: {0}")]
    SignerRsaPrivateKeyParsingFailed(#[from] pkcs8::Error),
    /// The `RSA PRIVATE KEY` in the `.pem` was present, but couldn't be parsed.
    #[error("failed to parse PKCS#1 private key: {0}")]
    SignerRsaKeyPairParsingFailed(#[from] pkcs1::Error),
    /// The certificate's public key does not belong to the private key.
    #[error("certificate public key does not match the private key")]
    SignerKeyMismatch,
    /// An error occurred while signing a hash, see [rsa::Error].
    #[error("RSA signing failed: {0}")]
    SignerRsaSigningFailed(#[from] rsa::Error),
    /// An error occurred while reading or serialising a public key, see
    /// [pkcs8::spki::Error].
    #[error("public key serialisation failed: {0}")]
    SignerRsaKeySerialisationFailed(#[from] pkcs8::spki::Error),
    /// The signing certificate couldn't be decoded.
    #[error("failed to decode certificate: {0}")]
    SignerCertificateDecodingFailed(#[from] rasn::error::DecodeError),
    /// A random testing certificate couldn't be created.
    #[error("certificate generation failed: {0}")]
    SignerCertificateGenerationFailed(String),
    /// PKCS#7 or certificate data couldn't be serialised.
    #[error("failed to encode PKCS#7 data: {0}")]
    SignerPKCS7EncodingFailed(#[from] rasn::error::EncodeError),
    /// Neither signature scheme was enabled in the signing options.
    #[error("no signature scheme selected")]
    SignerNoSchemeSelected
}

/// Result type where the error is always [ResignError].
pub type Result<T> = std::result::Result<T, ResignError>;

impl From<tempfile::PersistError> for ResignError {
    fn from(value: tempfile::PersistError) -> Self {
        ResignError::FileIoError(value.error)
    }
}
