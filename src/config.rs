use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::transport::PemTlsCredentials;

/// Default RSA modulus size for issued keys. The issuing service caps
/// certificate lifetime, not key strength; deployments that want more
/// set `key_bits` explicitly.
pub const DEFAULT_KEY_BITS: u32 = 1024;

/// Everything the issuance facade needs to reach the issuing service on
/// a user's behalf. Build one with [`IssuanceConfig::builder`], or
/// deserialize it and run [`IssuanceConfig::validate`] afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuanceConfig {
    /// Protected login endpoint of the issuing service.
    pub login_url: String,
    /// Session initiator that turns the assertion into a service
    /// session for the delegated login request.
    pub session_initiator_url: String,
    /// Identity this portal registered with the federation.
    pub provider_id: String,
    /// PEM certificate identifying the portal towards the federation.
    pub certificate_path: PathBuf,
    /// Private key matching `certificate_path`.
    pub private_key_path: PathBuf,
    /// Password of that key; empty for an unencrypted key.
    #[serde(default)]
    pub private_key_password: String,
    /// PEM bundle of certificate authorities trusted for every call.
    pub trust_anchors_path: PathBuf,
    /// Where issued credentials land when the caller does not pick
    /// paths; created on first use.
    #[serde(default = "default_store_directory")]
    pub store_directory: PathBuf,
    /// Modulus size of generated user keys.
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
}

fn default_store_directory() -> PathBuf {
    std::env::temp_dir()
}

fn default_key_bits() -> u32 {
    DEFAULT_KEY_BITS
}

impl IssuanceConfig {
    pub fn builder() -> IssuanceConfigBuilder {
        IssuanceConfigBuilder::default()
    }

    /// The checks `builder().build()` runs, for configurations that
    /// arrived through deserialization instead.
    pub fn validate(&self) -> Result<()> {
        if self.login_url.trim().is_empty() {
            return Err(Error::MissingConfiguration("login_url"));
        }
        if self.session_initiator_url.trim().is_empty() {
            return Err(Error::MissingConfiguration("session_initiator_url"));
        }
        if self.provider_id.trim().is_empty() {
            return Err(Error::MissingConfiguration("provider_id"));
        }
        if self.certificate_path.as_os_str().is_empty() {
            return Err(Error::MissingConfiguration("certificate_path"));
        }
        if self.private_key_path.as_os_str().is_empty() {
            return Err(Error::MissingConfiguration("private_key_path"));
        }
        if self.trust_anchors_path.as_os_str().is_empty() {
            return Err(Error::MissingConfiguration("trust_anchors_path"));
        }
        if self.key_bits < 512 {
            return Err(Error::InvalidConfiguration(format!(
                "key_bits must be at least 512, got {}",
                self.key_bits
            )));
        }
        Ok(())
    }

    pub(crate) fn tls_credentials(&self) -> PemTlsCredentials {
        PemTlsCredentials {
            certificate_path: self.certificate_path.clone(),
            private_key_path: self.private_key_path.clone(),
            private_key_password: self.private_key_password.clone(),
            trust_anchors_path: self.trust_anchors_path.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct IssuanceConfigBuilder {
    login_url: Option<String>,
    session_initiator_url: Option<String>,
    provider_id: Option<String>,
    certificate_path: Option<PathBuf>,
    private_key_path: Option<PathBuf>,
    private_key_password: Option<String>,
    trust_anchors_path: Option<PathBuf>,
    store_directory: Option<PathBuf>,
    key_bits: Option<u32>,
}

impl IssuanceConfigBuilder {
    pub fn login_url(mut self, url: impl Into<String>) -> Self {
        self.login_url = Some(url.into());
        self
    }

    pub fn session_initiator_url(mut self, url: impl Into<String>) -> Self {
        self.session_initiator_url = Some(url.into());
        self
    }

    pub fn provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    pub fn certificate_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_path = Some(path.into());
        self
    }

    pub fn private_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn private_key_password(mut self, password: impl Into<String>) -> Self {
        self.private_key_password = Some(password.into());
        self
    }

    pub fn trust_anchors_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_anchors_path = Some(path.into());
        self
    }

    pub fn store_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_directory = Some(path.into());
        self
    }

    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = Some(bits);
        self
    }

    pub fn build(self) -> Result<IssuanceConfig> {
        let config = IssuanceConfig {
            login_url: self.login_url.unwrap_or_default(),
            session_initiator_url: self.session_initiator_url.unwrap_or_default(),
            provider_id: self.provider_id.unwrap_or_default(),
            certificate_path: self.certificate_path.unwrap_or_default(),
            private_key_path: self.private_key_path.unwrap_or_default(),
            private_key_password: self.private_key_password.unwrap_or_default(),
            trust_anchors_path: self.trust_anchors_path.unwrap_or_default(),
            store_directory: self.store_directory.unwrap_or_else(std::env::temp_dir),
            key_bits: self.key_bits.unwrap_or(DEFAULT_KEY_BITS),
        };
        config.validate()?;
        Ok(config)
    }
}
