//! The issuance protocol as a chain of single-use states. Every step
//! consumes the current state and returns the next one, so a session
//! cannot be replayed or driven out of order, and a failed step simply
//! drops it.

use log::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::issuance::response::{self, LoginReply};
use crate::pki::{CertificateKeys, IssuedCertificate, SigningRequest};
use crate::transport::{AssertionResolver, DelegatedTransport, DelegationContext};
use crate::types::CertificateExtension;

/// Form field carrying the one-time token on the certificate request.
const TOKEN_FIELD: &str = "AuthorizationToken";
/// Form field carrying the PEM signing request.
const CSR_FIELD: &str = "CertificateSigningRequest";

/// A fresh issuance exchange. Steps run strictly in order:
///
/// ```text
/// IssuanceSession --login--> LoggedIn --generate_keys--> KeysGenerated
///     --generate_request--> RequestGenerated --submit--> IssuedCredential
/// ```
///
/// [`IssuanceSession::run`] chains all four.
pub struct IssuanceSession<'a> {
    resolver: &'a dyn AssertionResolver,
    transport: &'a dyn DelegatedTransport,
    login_url: &'a str,
    session_initiator_url: &'a str,
    key_bits: u32,
    request_id: Uuid,
}

impl<'a> IssuanceSession<'a> {
    pub fn new(
        resolver: &'a dyn AssertionResolver,
        transport: &'a dyn DelegatedTransport,
        login_url: &'a str,
        session_initiator_url: &'a str,
        key_bits: u32,
    ) -> Self {
        Self {
            resolver,
            transport,
            login_url,
            session_initiator_url,
            key_bits,
            request_id: Uuid::new_v4(),
        }
    }

    /// Correlation id carried through this session's log lines.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Resolves the assertion and performs the delegated login GET.
    ///
    /// An expired assertion fails as [`Error::AssertionExpired`] before
    /// the issuing service is contacted at all. A 401 from the service
    /// becomes [`Error::AuthorizationFailed`], any other non-200 status
    /// [`Error::LoginFailed`].
    pub fn login(self, assertion_url: &str) -> Result<LoggedIn<'a>> {
        let assertion = self.resolver.resolve(assertion_url)?;
        debug!(
            "[session] {} assertion id={:?} subject={:?} issuer={:?} expires={:?}",
            self.request_id,
            assertion.id,
            assertion.subject,
            assertion.issuer,
            assertion.not_on_or_after
        );
        let delegation = DelegationContext {
            assertion,
            session_initiator_url: self.session_initiator_url.to_owned(),
        };
        info!("[session] {} GET login: {}", self.request_id, self.login_url);
        let reply = self.transport.get_delegated(self.login_url, &delegation)?;
        if reply.status == 401 {
            return Err(Error::AuthorizationFailed {
                status: reply.status,
                url: self.login_url.to_owned(),
            });
        }
        if reply.status != 200 {
            return Err(Error::LoginFailed {
                status: reply.status,
            });
        }
        let LoginReply {
            authorization_token,
            certificate_request_url,
            subject,
            extensions,
        } = response::parse_login(&reply.body)?;
        info!("[session] {} logged in, subject: {subject}", self.request_id);
        debug!(
            "[session] {} certificate endpoint {certificate_request_url}, token of {} bytes, {} extensions",
            self.request_id,
            authorization_token.len(),
            extensions.len()
        );
        Ok(LoggedIn {
            transport: self.transport,
            authorization_token,
            certificate_request_url,
            subject,
            extensions,
            key_bits: self.key_bits,
            request_id: self.request_id,
        })
    }

    /// All four protocol steps in order; the first failure surfaces
    /// unmodified.
    pub fn run(self, assertion_url: &str, password: &str) -> Result<IssuedCredential> {
        self.login(assertion_url)?
            .generate_keys(password)?
            .generate_request()?
            .submit()
    }
}

/// Session state holding the login grant.
pub struct LoggedIn<'a> {
    transport: &'a dyn DelegatedTransport,
    authorization_token: String,
    certificate_request_url: String,
    subject: String,
    extensions: Vec<CertificateExtension>,
    key_bits: u32,
    request_id: Uuid,
}

impl<'a> LoggedIn<'a> {
    /// Distinguished name the service will certify.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Extensions the service asked to see in the request, in reply
    /// order.
    pub fn extensions(&self) -> &[CertificateExtension] {
        &self.extensions
    }

    /// Generates the RSA pair for the credential; the private key is
    /// held encrypted under `password` from here on.
    pub fn generate_keys(self, password: &str) -> Result<KeysGenerated<'a>> {
        let keys = CertificateKeys::generate(self.key_bits, password)?;
        debug!(
            "[session] {} generated {}-bit key pair",
            self.request_id, self.key_bits
        );
        Ok(KeysGenerated { login: self, keys })
    }
}

/// Session state with key material ready.
pub struct KeysGenerated<'a> {
    login: LoggedIn<'a>,
    keys: CertificateKeys,
}

impl<'a> KeysGenerated<'a> {
    /// Builds the PKCS#10 request binding subject and extensions to the
    /// new public key.
    pub fn generate_request(self) -> Result<RequestGenerated<'a>> {
        let request = SigningRequest::new(&self.keys, &self.login.subject, &self.login.extensions)?;
        debug!(
            "[session] {} built signing request for {}",
            self.login.request_id, self.login.subject
        );
        Ok(RequestGenerated {
            login: self.login,
            keys: self.keys,
            request,
        })
    }
}

/// Session state carrying the signed request.
pub struct RequestGenerated<'a> {
    login: LoggedIn<'a>,
    keys: CertificateKeys,
    request: SigningRequest,
}

impl RequestGenerated<'_> {
    /// Submits the signing request. The authorization token is the sole
    /// credential on this call; no delegation context is attached.
    pub fn submit(self) -> Result<IssuedCredential> {
        let csr_pem = self.request.pem()?;
        info!(
            "[session] {} POST certificate request: {}",
            self.login.request_id, self.login.certificate_request_url
        );
        let reply = self.login.transport.post_form(
            &self.login.certificate_request_url,
            &[
                (TOKEN_FIELD, self.login.authorization_token.as_str()),
                (CSR_FIELD, csr_pem.as_str()),
            ],
        )?;
        if reply.status != 200 {
            return Err(Error::CertificateRequestFailed {
                status: reply.status,
            });
        }
        let pem = response::parse_certificate(&reply.body)?;
        let certificate = IssuedCertificate::from_pem(&pem)?;
        info!(
            "[session] {} issued: subject={} serial={} fingerprint={}",
            self.login.request_id,
            certificate.subject(),
            certificate.serial(),
            certificate.fingerprint()
        );
        Ok(IssuedCredential {
            keys: self.keys,
            certificate,
        })
    }
}

/// Terminal state: certificate and keys, ready to persist.
pub struct IssuedCredential {
    keys: CertificateKeys,
    certificate: IssuedCertificate,
}

impl IssuedCredential {
    pub fn certificate(&self) -> &IssuedCertificate {
        &self.certificate
    }

    pub fn keys(&self) -> &CertificateKeys {
        &self.keys
    }
}
