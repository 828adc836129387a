//! Lookup of per-sender signing credential bundles on disk.
//!
//! Each authorized sender owns one combined certificate and private key
//! bundle named after its address, e.g. `alice@example.com` maps to
//! `alice_example_com.p12`. Bundles are looked up again for every message
//! as they may be provisioned or rotated at any time.

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::normalize_address;

/// Default directory holding the credential bundles.
pub const DEFAULT_CERT_DIR: &str = "/var/lib/zone-mta/smime-certs";

/// Default file extension of a credential bundle (PKCS#12).
pub const DEFAULT_BUNDLE_EXTENSION: &str = "p12";

/// Result of a credential bundle lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// The bundle exists at the given path.
    Found(PathBuf),
    /// No bundle is provisioned, the path is where it was expected.
    NotFound(PathBuf),
}

/// Computes the bundle file name for a sender address, replacing every
/// `@` and `.` with `_` and appending the extension.
///
/// Path separators are replaced as well, the name never leaves the
/// bundle directory.
///
/// # Examples
///
/// ```rust
/// assert_eq!(
///     smimegate_utils::bundle_file_name("bob.smith@corp.io", "p12"),
///     "bob_smith_corp_io.p12"
/// );
/// ```
pub fn bundle_file_name(sender: &str, extension: &str) -> String {
    let stem = normalize_address(sender).replace(['@', '.', '/', '\\'], "_");
    format!("{stem}.{extension}")
}

/// Directory based store of signing credential bundles.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    base_dir: PathBuf,
    extension: String,
}

impl CredentialStore {
    pub fn new(base_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            extension: extension.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path where the bundle of `sender` is expected.
    pub fn bundle_path(&self, sender: &str) -> PathBuf {
        self.base_dir.join(bundle_file_name(sender, &self.extension))
    }

    /// Checks whether the bundle of `sender` exists.
    ///
    /// A missing bundle is reported as [`Credential::NotFound`], only
    /// failures of the existence check itself are returned as errors.
    pub async fn resolve(&self, sender: &str) -> io::Result<Credential> {
        let path = self.bundle_path(sender);
        let exists = tokio::fs::try_exists(&path).await?;
        debug!(sender = %sender, path = %path.display(), exists, "Resolved credential bundle");
        Ok(if exists {
            Credential::Found(path)
        } else {
            Credential::NotFound(path)
        })
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_CERT_DIR, DEFAULT_BUNDLE_EXTENSION)
    }
}
