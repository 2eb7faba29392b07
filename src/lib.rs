//! Short-lived X.509 credentials for federated users. The crate logs
//! in to an SLCS-style issuing service with a delegated identity
//! assertion, obtains a certificate for a freshly generated key pair,
//! stores the result, and can derive VOMS-style delegated proxies from
//! it afterwards.

pub mod config;
pub mod error;
pub mod issuance;
pub mod pki;
pub mod proxy;
pub mod secret;
pub mod transport;
pub mod types;

pub use config::{DEFAULT_KEY_BITS, IssuanceConfig, IssuanceConfigBuilder};
pub use error::{Error, Result};
pub use issuance::{CredentialFactory, IssuanceSession, IssuedCredential};
pub use proxy::{ProxyFactory, ProxyFile, ProxyOptions, ProxyType, VoRequest};
pub use types::{CertificateExtension, CredentialsPathInfo};
