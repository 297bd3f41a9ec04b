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

//! Re-signs APK files in place with APK Signature Scheme v2 and, optionally,
//! the legacy Signed JAR (v1) scheme.
//!
//! ```no_run
//! use resign_sign::{ApkSigner, CertificateBundle, SigningOptions, ZipAligner};
//!
//! let bundle = CertificateBundle::from_pem_file("signing.pem")?;
//! let signer = ApkSigner::new(bundle, SigningOptions::default(), Box::new(ZipAligner::default()));
//! signer.sign("app.apk".as_ref())?;
//! # Ok::<(), resign_common::ResignError>(())
//! ```

use std::{fs, io::Write, path::Path};

use resign_common::{ResignError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

pub mod byte_store;
mod crypto;
pub mod crypto_keys;
pub mod hasher;
mod signed_data_block;
pub mod signing_block;
pub mod signing_types;
pub mod v1_signing;
pub mod v2_signing;
pub mod zip_parser;
mod zip_rebuilder;

pub use crypto_keys::CertificateBundle;
pub use v1_signing::{sign_jar_buffer, sign_jar_file, JarSignatureSettings};
pub use v2_signing::{sign_apk_buffer, sign_v2_file};

/// Replaces the file at `path` with `data` through a temporary file in the
/// same directory, so the original is never left half-written.
pub(crate) fn write_file_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new(".")
    };
    let permissions = fs::metadata(path)?.permissions();

    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(data)?;
    temp_file.as_file().set_permissions(permissions)?;
    temp_file.persist(path)?;
    debug!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

/// Rewrites an archive so its entries start on aligned offsets.
pub trait ArchiveAligner {
    fn align(&self, path: &Path) -> Result<()>;
}

/// The zipalign equivalent: entries on 4-byte boundaries, uncompressed native
/// libraries on page boundaries.
#[derive(Debug, Clone, Copy)]
pub struct ZipAligner {
    pub alignment: u16,
    pub page_alignment: u16
}

impl Default for ZipAligner {
    fn default() -> Self {
        ZipAligner {
            alignment: 4,
            page_alignment: 4096
        }
    }
}

impl ArchiveAligner for ZipAligner {
    fn align(&self, path: &Path) -> Result<()> {
        let zip_buf = fs::read(path)?;
        let aligned = resign_zip::align_zip(&zip_buf, self.alignment, self.page_alignment)?;
        write_file_atomically(path, &aligned)
    }
}

/// One way of signing an archive file in place.
pub trait SignatureScheme {
    fn name(&self) -> &'static str;
    fn apply(&self, path: &Path, bundle: &CertificateBundle) -> Result<()>;
}

/// Signed JAR signing (v1).
pub struct JarSigningScheme {
    pub settings: JarSignatureSettings
}

impl SignatureScheme for JarSigningScheme {
    fn name(&self) -> &'static str {
        "v1"
    }

    fn apply(&self, path: &Path, bundle: &CertificateBundle) -> Result<()> {
        sign_jar_file(path, bundle, &self.settings)
    }
}

/// APK Signature Scheme v2.
pub struct ApkSigningSchemeV2;

impl SignatureScheme for ApkSigningSchemeV2 {
    fn name(&self) -> &'static str {
        "v2"
    }

    fn apply(&self, path: &Path, bundle: &CertificateBundle) -> Result<()> {
        sign_v2_file(path, bundle)
    }
}

#[derive(Debug, Clone)]
pub struct SigningOptions {
    pub v1: bool,
    pub v2: bool,
    /// Align between v1 and v2 signing. Alignment after v2 would break the
    /// v2 signature.
    pub align: bool,
    pub v1_alias: String,
    pub created_by: String
}

impl Default for SigningOptions {
    fn default() -> Self {
        SigningOptions {
            v1: false,
            v2: true,
            align: true,
            v1_alias: v1_signing::DEFAULT_SIGNER_ALIAS.to_string(),
            created_by: v1_signing::DEFAULT_CREATED_BY.to_string()
        }
    }
}

/// Runs the enabled signing steps over APK files with one certificate bundle.
pub struct ApkSigner {
    bundle: CertificateBundle,
    options: SigningOptions,
    aligner: Box<dyn ArchiveAligner>
}

impl ApkSigner {
    pub fn new(bundle: CertificateBundle, options: SigningOptions, aligner: Box<dyn ArchiveAligner>) -> Self {
        ApkSigner {
            bundle,
            options,
            aligner
        }
    }

    /// Signs the APK at `path` in place: v1, then alignment, then v2, each
    /// only if enabled.
    pub fn sign(&self, path: &Path) -> Result<()> {
        let options = &self.options;
        if !options.v1 && !options.v2 {
            return Err(ResignError::SignerNoSchemeSelected);
        }

        if options.v1 {
            self.apply_scheme(
                &JarSigningScheme {
                    settings: JarSignatureSettings {
                        alias: options.v1_alias.clone(),
                        created_by: options.created_by.clone(),
                        v2_also_applied: options.v2
                    }
                },
                path
            )?;
        }
        if options.align {
            info!("Aligning");
            self.aligner.align(path)?;
        }
        if options.v2 {
            self.apply_scheme(&ApkSigningSchemeV2, path)?;
        }

        info!("Done");
        Ok(())
    }

    /// [ApkSigner::sign], reporting failure as `false` after logging it.
    pub fn run(&self, path: &Path) -> bool {
        match self.sign(path) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to sign {}: {e}", path.display());
                false
            }
        }
    }

    fn apply_scheme(&self, scheme: &dyn SignatureScheme, path: &Path) -> Result<()> {
        info!("Signing with {}", scheme.name());
        scheme.apply(path, &self.bundle)
    }
}

#[cfg(test)]
pub(crate) fn test_bundle() -> &'static CertificateBundle {
    use std::sync::OnceLock;

    static BUNDLE: OnceLock<CertificateBundle> = OnceLock::new();
    BUNDLE.get_or_init(|| {
        CertificateBundle::from_combined_pem_string(include_str!("../testdata/test_bundle.pem")).unwrap()
    })
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, io::Cursor, rc::Rc};

    use assert_matches::assert_matches;

    use super::*;

    struct CountingAligner(Rc<Cell<usize>>);

    impl ArchiveAligner for CountingAligner {
        fn align(&self, _path: &Path) -> Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    fn test_signer(options: SigningOptions, aligner: Box<dyn ArchiveAligner>) -> ApkSigner {
        let bundle =
            CertificateBundle::from_combined_pem_string(include_str!("../testdata/test_bundle.pem")).unwrap();
        ApkSigner::new(bundle, options, aligner)
    }

    fn write_archive(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("app.apk");
        let mut buf = Cursor::new(Vec::new());
        resign_zip::zip_apk(
            &[resign_zip::File {
                path: "classes.dex".into(),
                data: b"dex\n035".to_vec()
            }],
            &mut buf
        )
        .unwrap();
        fs::write(&path, buf.into_inner()).unwrap();
        path
    }

    #[test]
    fn no_scheme_selected() {
        let signer = test_signer(
            SigningOptions {
                v2: false,
                ..Default::default()
            },
            Box::new(ZipAligner::default())
        );
        assert_matches!(signer.sign(Path::new("missing.apk")), Err(ResignError::SignerNoSchemeSelected));
        assert!(!signer.run(Path::new("missing.apk")));
    }

    #[test]
    fn aligner_only_runs_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path());
        let calls = Rc::new(Cell::new(0));

        let unaligned = test_signer(
            SigningOptions {
                align: false,
                ..Default::default()
            },
            Box::new(CountingAligner(calls.clone()))
        );
        assert!(unaligned.run(&path));
        assert_eq!(calls.get(), 0);

        let aligned = test_signer(SigningOptions::default(), Box::new(CountingAligner(calls.clone())));
        assert!(aligned.run(&path));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let signer = test_signer(SigningOptions::default(), Box::new(ZipAligner::default()));
        assert_matches!(signer.sign(&dir.path().join("nope.apk")), Err(ResignError::FileIoError(_)));
    }

    #[test]
    fn atomic_write_keeps_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"old").unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&path, permissions).unwrap();

        write_file_atomically(&path, b"new contents").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new contents");
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
