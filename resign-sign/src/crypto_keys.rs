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

use std::{fmt, fs, path::Path};

use resign_common::*;
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey
};
use sha2::{Digest, Sha256};
use rasn_pkix::Certificate;
use tracing::{debug, info};

const PEM_TAG_CERTIFICATE: &str = "CERTIFICATE";
const PEM_TAG_PKCS8_KEY: &str = "PRIVATE KEY";
const PEM_TAG_PKCS1_KEY: &str = "RSA PRIVATE KEY";

/// Holds the certificate and RSA Private Key used for signing.
///
/// Immutable once loaded, so one bundle can sign any number of APKs one after
/// another.
pub struct CertificateBundle {
    /// X.509 Signing Certificate in ASN.1 DER form
    certificate: Vec<u8>,
    /// The same certificate, decoded
    parsed_certificate: Certificate,
    /// RSA Private Key
    private_key: RsaPrivateKey
}

// Leaves the private key out of logs and test failures
impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("subject", &self.parsed_certificate.tbs_certificate.subject)
            .field("serial_number", &self.parsed_certificate.tbs_certificate.serial_number)
            .finish_non_exhaustive()
    }
}

impl CertificateBundle {
    /// Parses and creates an instance of [CertificateBundle] from a `.pem`
    /// string.
    ///
    /// "Combined" in this case means that the one string has both a `BEGIN
    /// CERTIFICATE` section and a `BEGIN PRIVATE KEY` (or `BEGIN RSA PRIVATE
    /// KEY`) section, in either order. Any other sections are ignored, and when
    /// there are several of a kind the first one wins.
    pub fn from_combined_pem_string(combined_pem: &str) -> Result<CertificateBundle> {
        info!("Reading certificates");

        let mut certificate = None;
        let mut private_key = None;
        for pem_part in pem::parse_many(combined_pem)? {
            match pem_part.tag() {
                PEM_TAG_CERTIFICATE if certificate.is_none() => {
                    certificate = Some(pem_part.contents().to_vec());
                }
                PEM_TAG_PKCS8_KEY if private_key.is_none() => {
                    private_key = Some(RsaPrivateKey::from_pkcs8_der(pem_part.contents())?);
                }
                PEM_TAG_PKCS1_KEY if private_key.is_none() => {
                    private_key = Some(RsaPrivateKey::from_pkcs1_der(pem_part.contents())?);
                }
                other => debug!("Skipping PEM section {other}")
            }
        }

        let certificate = certificate.ok_or(ResignError::SignerMissingCertificate)?;
        let private_key = private_key.ok_or(ResignError::SignerMissingPrivateKey)?;
        CertificateBundle::new(certificate, private_key)
    }

    /// Reads a combined `.pem` file, see [CertificateBundle::from_combined_pem_string].
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<CertificateBundle> {
        let combined_pem = fs::read_to_string(path)?;
        CertificateBundle::from_combined_pem_string(&combined_pem)
    }

    /// Builds a bundle from a DER certificate and its private key, checking
    /// that the two actually belong together.
    pub fn new(certificate: Vec<u8>, private_key: RsaPrivateKey) -> Result<CertificateBundle> {
        let parsed_certificate: Certificate = rasn::der::decode(&certificate)?;
        let bundle = CertificateBundle {
            certificate,
            parsed_certificate,
            private_key
        };

        let certificate_key = RsaPublicKey::from_public_key_der(&bundle.subject_public_key_info_der()?)?;
        if certificate_key != RsaPublicKey::from(&bundle.private_key) {
            return Err(ResignError::SignerKeyMismatch);
        }

        Ok(bundle)
    }

    /// Randomly generates RSA signing keys and an accompanying self-signed
    /// certificate.
    ///
    /// This API is only enabled when the optional "cert-gen" feature is enabled
    /// (it's on by default). It pulls in a non-trivial amount of extra
    /// dependencies, including ASM/C code.
    ///
    /// It is also slow, since it generates a fresh 2048-bit RSA key. Signing
    /// with a random key is fine for installing on your own device, but
    /// Android will refuse to update an app across different signing keys, so
    /// keep the PEM around (see [CertificateBundle::to_combined_pem_string]).
    #[cfg(feature = "cert-gen")]
    pub fn generate_random_testing_keys() -> Result<CertificateBundle> {
        // These dependencies only exist when compiled with cert-gen
        use rand::prelude::*;
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};

        tracing::warn!("Randomly generating a placeholder signing key. This is slow!");

        let private_key = RsaPrivateKey::new(&mut thread_rng(), 2048)?;
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;

        // Self-sign an X.509 certificate using the random keys
        let cert_gen_failed = |e: rcgen::Error| ResignError::SignerCertificateGenerationFailed(e.to_string());
        let key_pair = KeyPair::from_pem(&private_key_pem).map_err(cert_gen_failed)?;
        // We sign all testing certificates as our crate name
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, env!("CARGO_PKG_NAME"));
        let mut cert_params = CertificateParams::new(Vec::<String>::new()).map_err(cert_gen_failed)?;
        cert_params.distinguished_name = distinguished_name;
        let cert = cert_params.self_signed(&key_pair).map_err(cert_gen_failed)?;

        CertificateBundle::new(cert.der().to_vec(), private_key)
    }

    /// Writes the bundle back out as a combined `.pem` string, certificate
    /// first.
    pub fn to_combined_pem_string(&self) -> Result<String> {
        use rsa::pkcs8::EncodePrivateKey;

        let certificate = pem::Pem::new(PEM_TAG_CERTIFICATE, self.certificate.clone());
        let private_key = pem::Pem::new(
            PEM_TAG_PKCS8_KEY,
            self.private_key.to_pkcs8_der()?.as_bytes().to_vec()
        );
        Ok(pem::encode_many(&[certificate, private_key]))
    }

    /// X.509 signing certificate in ASN.1 DER form
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    pub fn certificate(&self) -> &Certificate {
        &self.parsed_certificate
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// RSASSA-PKCS1-v1_5 with SHA-256 over `data`. Both schemes sign this way.
    pub fn sign_sha256(&self, data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(data);
        let padding = Pkcs1v15Sign::new::<Sha256>();
        Ok(self.private_key.sign(padding, &digest)?)
    }

    /// Returns the certificate's SubjectPublicKeyInfo encoded in ASN.1 DER
    /// format.
    pub fn subject_public_key_info_der(&self) -> Result<Vec<u8>> {
        Ok(rasn::der::encode(
            &self.parsed_certificate.tbs_certificate.subject_public_key_info
        )?)
    }
}
