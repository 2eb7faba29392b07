//! Production transport: a blocking `reqwest` client authenticated with
//! the portal's PEM credentials, plus the assertion resolver that goes
//! with it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use openssl::pkey::PKey;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderValue, SET_COOKIE};
use zeroize::Zeroizing;

use crate::issuance::markup::find_element;
use crate::transport::{
    Assertion, AssertionResolver, DelegatedTransport, DelegationContext, ResolveError,
    TransportError, TransportResponse,
};

/// Default timeout for calls towards the federation, overridable via
/// `GRIDCRED_HTTP_TIMEOUT_SECS`.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub(crate) fn resolve_timeout() -> Duration {
    match std::env::var("GRIDCRED_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
    {
        Some(secs) if secs > 0 => Duration::from_secs(secs),
        _ => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    }
}

/// Filesystem locations of the PEM material identifying this portal
/// towards the identity federation.
#[derive(Debug, Clone)]
pub struct PemTlsCredentials {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    /// Password for the private key; empty means unencrypted.
    pub private_key_password: String,
    pub trust_anchors_path: PathBuf,
}

impl PemTlsCredentials {
    /// Builds a blocking client presenting these credentials and
    /// trusting exactly the configured anchors.
    pub fn build_client(&self) -> Result<Client, TransportError> {
        let certificate = read_credential(&self.certificate_path)?;
        let key_pem = Zeroizing::new(read_credential(&self.private_key_path)?);
        let key = if self.private_key_password.is_empty() {
            PKey::private_key_from_pem(&key_pem)?
        } else {
            PKey::private_key_from_pem_passphrase(&key_pem, self.private_key_password.as_bytes())?
        };
        // reqwest wants the key material unencrypted
        let plain_key = Zeroizing::new(key.private_key_to_pem_pkcs8()?);
        let identity = reqwest::Identity::from_pkcs8_pem(&certificate, &plain_key)?;

        let anchors = read_credential(&self.trust_anchors_path)?;
        let blocks = pem::parse_many(&anchors).map_err(|source| TransportError::BadPem {
            path: self.trust_anchors_path.clone(),
            source,
        })?;
        let mut builder = Client::builder()
            .timeout(resolve_timeout())
            .identity(identity);
        let mut added = 0;
        for block in blocks.iter().filter(|b| b.tag() == "CERTIFICATE") {
            builder = builder.add_root_certificate(reqwest::Certificate::from_der(block.contents())?);
            added += 1;
        }
        if added == 0 {
            return Err(TransportError::EmptyTrustAnchors {
                path: self.trust_anchors_path.clone(),
            });
        }
        debug!("[transport] client ready ({added} trust anchors)");
        Ok(builder.build()?)
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, TransportError> {
    fs::read(path).map_err(|source| TransportError::Credential {
        path: path.to_path_buf(),
        source,
    })
}

/// Delegated HTTP against the protected issuing endpoints: the assertion
/// is presented to the service's session initiator first, and the
/// cookies handed back accompany the actual request.
pub struct HttpDelegatedTransport {
    client: Client,
    provider_id: String,
}

impl HttpDelegatedTransport {
    pub fn new(
        credentials: &PemTlsCredentials,
        provider_id: impl Into<String>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            client: credentials.build_client()?,
            provider_id: provider_id.into(),
        })
    }

    fn bootstrap_session(
        &self,
        delegation: &DelegationContext,
    ) -> Result<Vec<HeaderValue>, TransportError> {
        let response = self
            .client
            .post(&delegation.session_initiator_url)
            .query(&[("providerId", self.provider_id.as_str())])
            .header(CONTENT_TYPE, "text/xml")
            .body(delegation.assertion.document.clone())
            .send()?;
        let status = response.status();
        let cookies: Vec<HeaderValue> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .cloned()
            .collect();
        debug!(
            "[transport] session initiator {} -> {status} ({} cookies)",
            delegation.session_initiator_url,
            cookies.len()
        );
        if cookies.is_empty() {
            warn!("[transport] session initiator handed back no session cookie");
        }
        Ok(cookies)
    }
}

impl DelegatedTransport for HttpDelegatedTransport {
    fn get_delegated(
        &self,
        url: &str,
        delegation: &DelegationContext,
    ) -> Result<TransportResponse, TransportError> {
        let cookies = self.bootstrap_session(delegation)?;
        let mut request = self.client.get(url);
        for cookie in &cookies {
            if let Some(pair) = cookie.to_str().ok().and_then(cookie_pair) {
                request = request.header(COOKIE, pair);
            }
        }
        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        debug!("[transport] GET {url} -> {status} ({} bytes)", body.len());
        Ok(TransportResponse { status, body })
    }

    fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<TransportResponse, TransportError> {
        let response = self.client.post(url).form(form).send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        debug!("[transport] POST {url} -> {status} ({} bytes)", body.len());
        Ok(TransportResponse { status, body })
    }
}

/// `Set-Cookie` carries attributes; only the leading name=value pair
/// goes back out.
fn cookie_pair(raw: &str) -> Option<&str> {
    let pair = raw.split(';').next()?.trim();
    if pair.is_empty() { None } else { Some(pair) }
}

/// Fetches the assertion document from the handle URL and refuses to
/// hand back one that is already past its validity window.
pub struct UrlAssertionResolver {
    client: Client,
}

impl UrlAssertionResolver {
    pub fn new(credentials: &PemTlsCredentials) -> Result<Self, TransportError> {
        Ok(Self {
            client: credentials.build_client()?,
        })
    }
}

impl AssertionResolver for UrlAssertionResolver {
    fn resolve(&self, assertion_url: &str) -> Result<Assertion, ResolveError> {
        let response = self
            .client
            .get(assertion_url)
            .send()
            .map_err(TransportError::from)?;
        let status = response.status().as_u16();
        if status == 404 || status == 410 {
            return Err(ResolveError::Expired(format!(
                "assertion no longer available at {assertion_url} (status {status})"
            )));
        }
        let document = response
            .error_for_status()
            .map_err(TransportError::from)?
            .text()
            .map_err(TransportError::from)?;
        let assertion = parse_assertion(document);
        if let Some(expiry) = assertion.not_on_or_after {
            if expiry <= chrono::Utc::now() {
                return Err(ResolveError::Expired(format!(
                    "assertion {} lapsed at {expiry}",
                    assertion.id.as_deref().unwrap_or("<unknown>")
                )));
            }
        }
        debug!(
            "[transport] resolved assertion id={:?} subject={:?} issuer={:?}",
            assertion.id, assertion.subject, assertion.issuer
        );
        Ok(assertion)
    }
}

/// Best-effort metadata extraction from the assertion document; fields
/// the document does not carry stay empty.
fn parse_assertion(document: String) -> Assertion {
    let id = find_element(&document, "Assertion", 0)
        .and_then(|e| e.attribute("ID").map(str::to_owned));
    let issuer = find_element(&document, "Issuer", 0)
        .map(|e| e.text().to_owned())
        .filter(|s| !s.is_empty());
    let subject = find_element(&document, "NameID", 0)
        .map(|e| e.text().to_owned())
        .filter(|s| !s.is_empty());
    let not_on_or_after = find_element(&document, "Conditions", 0)
        .and_then(|e| e.attribute("NotOnOrAfter").map(str::to_owned))
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(&raw).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));
    Assertion {
        id,
        subject,
        issuer,
        not_on_or_after,
        document,
    }
}
