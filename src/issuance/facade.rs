//! One-shot "get me a credential" entry point. Wires a fresh
//! [`IssuanceSession`] per call, persists the outcome through the store
//! and hands back the paths.

use std::path::{Path, PathBuf};

use log::info;

use crate::config::IssuanceConfig;
use crate::error::{Error, Result};
use crate::issuance::session::IssuanceSession;
use crate::issuance::store;
use crate::secret::random_secret_default;
use crate::transport::{
    AssertionResolver, DelegatedTransport, HttpDelegatedTransport, UrlAssertionResolver,
};
use crate::types::CredentialsPathInfo;

/// Issues short-lived credentials against one issuing service.
///
/// The factory itself is long-lived and reusable; every
/// [`issue`](CredentialFactory::issue) call runs its own single-use
/// session, so concurrent issuances only share the HTTP client.
pub struct CredentialFactory {
    config: IssuanceConfig,
    resolver: Box<dyn AssertionResolver>,
    transport: Box<dyn DelegatedTransport>,
}

impl CredentialFactory {
    /// Validates the configuration and builds the production HTTP
    /// collaborators from its TLS material.
    pub fn new(config: IssuanceConfig) -> Result<Self> {
        config.validate()?;
        let tls = config.tls_credentials();
        let resolver = UrlAssertionResolver::new(&tls).map_err(Error::Initialization)?;
        let transport = HttpDelegatedTransport::new(&tls, config.provider_id.clone())
            .map_err(Error::Initialization)?;
        Ok(Self {
            config,
            resolver: Box::new(resolver),
            transport: Box::new(transport),
        })
    }

    /// Same factory with caller-supplied collaborators standing in for
    /// the HTTP layer.
    pub fn with_collaborators(
        config: IssuanceConfig,
        resolver: Box<dyn AssertionResolver>,
        transport: Box<dyn DelegatedTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            resolver,
            transport,
        })
    }

    pub fn config(&self) -> &IssuanceConfig {
        &self.config
    }

    /// Issues a credential into the configured store directory under
    /// collision-free names, encrypting the key under a fresh random
    /// password. The returned [`CredentialsPathInfo`] is the only copy
    /// of that password.
    pub fn issue(&self, assertion_url: &str) -> Result<CredentialsPathInfo> {
        let directory = store::resolve_store_directory(&self.config.store_directory)?;
        let unique = random_secret_default();
        let certificate_path = directory.join(format!("cert-{unique}.pem"));
        let private_key_path = directory.join(format!("key-{unique}.pem"));
        self.issue_with(
            assertion_url,
            certificate_path,
            private_key_path,
            random_secret_default(),
        )
    }

    /// Issues a credential to caller-chosen paths, still under a fresh
    /// random password. Parent directories are created as needed.
    pub fn issue_to(
        &self,
        assertion_url: &str,
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
    ) -> Result<CredentialsPathInfo> {
        let certificate_path = certificate_path.into();
        let private_key_path = private_key_path.into();
        ensure_parent(&certificate_path)?;
        ensure_parent(&private_key_path)?;
        self.issue_with(
            assertion_url,
            certificate_path,
            private_key_path,
            random_secret_default(),
        )
    }

    fn issue_with(
        &self,
        assertion_url: &str,
        certificate_path: PathBuf,
        private_key_path: PathBuf,
        password: String,
    ) -> Result<CredentialsPathInfo> {
        let session = IssuanceSession::new(
            self.resolver.as_ref(),
            self.transport.as_ref(),
            &self.config.login_url,
            &self.config.session_initiator_url,
            self.config.key_bits,
        );
        let request_id = session.request_id();
        let credential = session.run(assertion_url, &password)?;
        // Certificate first. If the key write fails the certificate
        // file stays behind, which callers accept.
        store::store_credential(&certificate_path, credential.certificate().pem().as_bytes())?;
        let key_pem = credential.keys().encrypted_private_key_pem()?;
        store::store_credential(&private_key_path, &key_pem)?;
        info!(
            "[issuance] {request_id} stored credential for {}: {}",
            credential.certificate().subject(),
            certificate_path.display()
        );
        Ok(CredentialsPathInfo::new(
            certificate_path,
            private_key_path,
            password,
        ))
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            store::resolve_store_directory(parent)?;
        }
    }
    Ok(())
}
