use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where an issued credential ended up, and how to unlock it.
///
/// Constructed only after both files have been written. The triple is
/// never mutated; portals typically stash it in their session store,
/// hence the serde derives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsPathInfo {
    certificate_path: PathBuf,
    private_key_path: PathBuf,
    private_key_password: String,
}

impl CredentialsPathInfo {
    pub fn new(
        certificate_path: PathBuf,
        private_key_path: PathBuf,
        private_key_password: impl Into<String>,
    ) -> Self {
        Self {
            certificate_path,
            private_key_path,
            private_key_password: private_key_password.into(),
        }
    }

    /// PEM file holding the issued certificate.
    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    /// PEM file holding the encrypted private key.
    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    /// Password the private key is encrypted with.
    pub fn private_key_password(&self) -> &str {
        &self.private_key_password
    }
}

/// One certificate extension requested by the issuing service during
/// login, to be embedded into the signing request as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateExtension {
    pub name: String,
    pub value: String,
}

impl CertificateExtension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}
