//! Collaborator seams towards the identity federation: resolving the
//! caller's bearer assertion and speaking HTTP on its behalf. The
//! issuance session only ever sees these traits; the production
//! implementations live in [`http`].

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod http;

pub use http::{HttpDelegatedTransport, PemTlsCredentials, UrlAssertionResolver};

/// Status line and body of a service reply as seen by the protocol.
/// Header handling stays inside the transport implementation.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// A bearer assertion resolved from its handle.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub id: Option<String>,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// Raw assertion document, presented to the delegated endpoint.
    pub document: String,
}

/// Everything a delegated request needs to act on the user's behalf.
#[derive(Debug, Clone)]
pub struct DelegationContext {
    pub assertion: Assertion,
    pub session_initiator_url: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read {path}: {source}")]
    Credential {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse PEM in {path}: {source}")]
    BadPem {
        path: PathBuf,
        #[source]
        source: pem::PemError,
    },
    #[error("no usable trust anchors in {path}")]
    EmptyTrustAnchors { path: PathBuf },
    #[error("TLS material rejected: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The assertion lapsed (or was discarded by the identity provider)
    /// before the exchange began. The caller re-authenticates the user
    /// and retries; nothing was sent to the issuing service yet.
    #[error("assertion expired or no longer retrievable: {0}")]
    Expired(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Resolves an assertion handle (the URL a portal holds on behalf of a
/// logged-in user) into the assertion itself.
pub trait AssertionResolver: Send + Sync {
    fn resolve(&self, assertion_url: &str) -> Result<Assertion, ResolveError>;
}

/// HTTP towards the issuing service. The login GET carries the
/// delegation context; the certificate request POST is authorized by
/// token alone and goes out undecorated.
pub trait DelegatedTransport: Send + Sync {
    fn get_delegated(
        &self,
        url: &str,
        delegation: &DelegationContext,
    ) -> Result<TransportResponse, TransportError>;

    fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<TransportResponse, TransportError>;
}
