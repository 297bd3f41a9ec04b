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

//! Most of this package is concerned with APK Signature Scheme v2,
//! but this module handles Signature Scheme v1, aka. Signed JAR File format.

use std::{fs, path::Path};

use base64::{prelude::BASE64_STANDARD, Engine};
use rasn::types::Integer::Primitive;
use rasn::types::{Any, Oid};
use rasn_cms::algorithms::RSA;
use rasn_cms::{
    pkcs7_compat::SignedData, AlgorithmIdentifier, CertificateChoices, ContentInfo,
    IssuerAndSerialNumber, SignerIdentifier, SignerInfo
};
use resign_common::Result;
use resign_zip::{File, METADATA_DIR};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{crypto_keys::CertificateBundle, write_file_atomically};

const OID_SHA256: &Oid =
    rasn::types::Oid::JOINT_ISO_ITU_T_COUNTRY_US_ORGANIZATION_GOV_CSOR_NIST_ALGORITHMS_HASH_SHA256;
const OID_PKCS7_DATA: &Oid = rasn::types::Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_DATA;
const OID_PKCS7_SIGNED_DATA: &Oid = rasn::types::Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_SIGNED_DATA;
// DER encoding of ASN.1 NULL, for algorithm parameters
const DER_NULL: &[u8] = &[0x05, 0x00];

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub const DEFAULT_SIGNER_ALIAS: &str = "RESIGN";
pub const DEFAULT_CREATED_BY: &str = concat!("1.0 (", env!("CARGO_PKG_NAME"), ")");

/// What goes into the v1 metadata besides the digests.
#[derive(Debug, Clone)]
pub struct JarSignatureSettings {
    /// Base name of the `.SF` and `.RSA` files
    pub alias: String,
    /// Value of the `Created-By` header
    pub created_by: String,
    /// Adds `X-Android-APK-Signed: 2` so that verifiers which understand v2
    /// refuse the APK if its v2 signature gets stripped.
    pub v2_also_applied: bool
}

impl Default for JarSignatureSettings {
    fn default() -> Self {
        JarSignatureSettings {
            alias: DEFAULT_SIGNER_ALIAS.to_string(),
            created_by: DEFAULT_CREATED_BY.to_string(),
            v2_also_applied: false
        }
    }
}

/// Signs a ZIP file buffer with a Signed JAR signature, replacing anything
/// already in `META-INF/`.
pub fn sign_jar_buffer(
    zip_buf: &[u8],
    bundle: &CertificateBundle,
    settings: &JarSignatureSettings
) -> Result<Vec<u8>> {
    let zip_contents = resign_zip::read_content_entries(zip_buf)?;
    debug!("Digesting {} entries for the JAR manifest", zip_contents.len());
    let signature_files = create_v1_signature_files(&zip_contents, bundle, settings)?;
    resign_zip::replace_metadata_entries(zip_buf, &signature_files)
}

/// Signs the APK at `path` in place, see [sign_jar_buffer].
pub fn sign_jar_file(
    path: &Path,
    bundle: &CertificateBundle,
    settings: &JarSignatureSettings
) -> Result<()> {
    let zip_buf = fs::read(path)?;
    let signed = sign_jar_buffer(&zip_buf, bundle, settings)?;
    write_file_atomically(path, &signed)
}

/// Creates `MANIFEST.MF`, `<alias>.SF` and `<alias>.RSA` for `zip_contents`,
/// which must not contain any `META-INF/` entries themselves.
pub fn create_v1_signature_files(
    zip_contents: &[File],
    bundle: &CertificateBundle,
    settings: &JarSignatureSettings
) -> Result<Vec<File>> {
    // Every entry's manifest section, in archive order. The manifest and the
    // signature file must both follow this one ordering.
    let entries: Vec<(&str, String)> = zip_contents
        .iter()
        .map(|file| (file.path.as_str(), create_manifest_entry(file)))
        .collect();

    let manifest = create_manifest(&entries, settings);
    let sig_file = create_signature_file(&entries, &manifest, settings);
    let pkcs7_file = create_pkcs7_file(sig_file.as_bytes(), bundle)?;

    Ok(vec![
        File {
            path: MANIFEST_PATH.to_string(),
            data: manifest.into()
        },
        File {
            path: format!("{METADATA_DIR}{}.SF", settings.alias),
            data: sig_file.into()
        },
        File {
            path: format!("{METADATA_DIR}{}.RSA", settings.alias),
            data: pkcs7_file
        },
    ])
}

// Detached PKCS#7 SignedData over the signature file: the content itself is
// left out, the verifier already has it as `<alias>.SF`.
fn create_pkcs7_file(sig_file: &[u8], bundle: &CertificateBundle) -> Result<Vec<u8>> {
    let signature = bundle.sign_sha256(sig_file)?;
    let cert = bundle.certificate().clone();

    let sha256_algorithm = AlgorithmIdentifier {
        algorithm: OID_SHA256.into(),
        parameters: Some(Any::new(DER_NULL.to_vec()))
    };

    let signer_info = SignerInfo {
        version: Primitive(1),
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: cert.tbs_certificate.issuer.clone(),
            serial_number: cert.tbs_certificate.serial_number.clone()
        }),
        digest_algorithm: sha256_algorithm.clone(),
        signed_attrs: None,
        signature_algorithm: AlgorithmIdentifier {
            algorithm: RSA.into(),
            parameters: Some(Any::new(DER_NULL.to_vec()))
        },
        signature: signature.into(),
        unsigned_attrs: None
    };

    let signed_data = SignedData {
        version: Primitive(1),
        digest_algorithms: vec![sha256_algorithm].into(),
        encap_content_info: rasn_cms::pkcs7_compat::EncapsulatedContentInfo {
            content_type: OID_PKCS7_DATA.into(),
            content: None
        },
        certificates: Some(vec![CertificateChoices::Certificate(Box::new(cert))].into()),
        crls: None,
        signer_infos: vec![signer_info].into()
    };

    let wrapper = ContentInfo {
        content_type: OID_PKCS7_SIGNED_DATA.into(),
        content: Any::new(rasn::der::encode(&signed_data)?)
    };

    Ok(rasn::der::encode(&wrapper)?)
}

fn create_signature_file(
    entries: &[(&str, String)],
    manifest: &str,
    settings: &JarSignatureSettings
) -> String {
    let created_by = &settings.created_by;
    let manifest_digest = b64_digest(manifest);
    let mut output_sig = format!(
        "Signature-Version: 1.0\r\nCreated-By: {created_by}\r\nSHA-256-Digest-Manifest: {manifest_digest}\r\n"
    );
    if settings.v2_also_applied {
        output_sig.push_str("X-Android-APK-Signed: 2\r\n");
    }
    output_sig.push_str("\r\n");

    for (file_name, entry) in entries {
        let digest = b64_digest(entry);
        output_sig.push_str(&format!("Name: {file_name}\r\nSHA-256-Digest: {digest}\r\n\r\n"));
    }

    output_sig
}

fn create_manifest(entries: &[(&str, String)], settings: &JarSignatureSettings) -> String {
    let created_by = &settings.created_by;
    let mut output_manifest = format!("Manifest-Version: 1.0\r\nCreated-By: {created_by}\r\n\r\n");

    for (_, entry) in entries {
        output_manifest.push_str(entry);
    }

    output_manifest
}

// Also used in the generation of <alias>.SF
fn create_manifest_entry(file: &File) -> String {
    let file_name = &file.path;
    let b64_digest = b64_digest(&file.data);
    format!("Name: {file_name}\r\nSHA-256-Digest: {b64_digest}\r\n\r\n")
}

fn b64_digest(input: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(input);
    BASE64_STANDARD.encode(digest)
}
