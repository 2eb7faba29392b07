use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::issuance::response::ResponseError;
use crate::issuance::store::StoreError;
use crate::pki::PkiError;
use crate::proxy::attributes::VoError;
use crate::transport::{ResolveError, TransportError};

/// Everything that can go wrong across issuance and proxy derivation,
/// as one matchable enumeration. Callers branch on the variant; the
/// underlying cause rides along as the error source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration setting was never supplied.
    #[error("missing required configuration setting '{0}'")]
    MissingConfiguration(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Building the HTTP collaborators failed; the factory is unusable.
    #[error("failed to initialize the delegated transport")]
    Initialization(#[source] TransportError),
    /// The bearer assertion lapsed before issuance began. This is the
    /// one kind worth retrying: re-authenticate the user, then call
    /// again. Nothing was sent to the issuing service.
    #[error("assertion expired: {0}")]
    AssertionExpired(String),
    /// The issuing service answered the login with 401.
    #[error("authorization failed (status {status}) at {url}")]
    AuthorizationFailed { status: u16, url: String },
    #[error("login failed with status {status}")]
    LoginFailed { status: u16 },
    #[error("certificate request failed with status {status}")]
    CertificateRequestFailed { status: u16 },
    #[error("issuing service rejected the exchange: {0}")]
    Response(#[from] ResponseError),
    #[error("transport failure: {0}")]
    Transport(TransportError),
    #[error(transparent)]
    Pki(#[from] PkiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read credential {path}: {source}")]
    CredentialRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("proxy derivation failed: {0}")]
    Proxy(String),
    #[error("attribute authority failure: {0}")]
    Vo(#[from] VoError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Expired(message) => Error::AssertionExpired(message),
            ResolveError::Transport(err) => Error::Transport(err),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::Pki(PkiError::OpenSsl(err))
    }
}
