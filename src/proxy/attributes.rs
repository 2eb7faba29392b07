//! Attribute authority access. A proxy derivation may ask one or more
//! VO authorities for signed attribute certificates; the client
//! authenticates with the user's freshly issued credential, not the
//! portal's.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, info};
use reqwest::blocking::Client;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::issuance::markup::find_element;
use crate::transport::TransportError;
use crate::transport::http::resolve_timeout;

/// One merged request towards a single VO's authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRequest {
    pub vo: String,
    /// Requested roles, in first-appearance order. Empty asks for plain
    /// membership.
    pub fqans: Vec<String>,
    pub lifetime_secs: u64,
}

/// A signed attribute certificate as handed back by an authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeCertificate {
    pub vo: String,
    pub der: Vec<u8>,
}

/// The user credential presented to authorities, decrypted and held
/// only for the duration of one derivation.
pub struct ProxyIdentity {
    pub certificate_pem: String,
    /// Unencrypted PKCS#8 PEM, wiped when the identity drops.
    pub private_key_pem: Zeroizing<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum VoError {
    #[error("no attribute authority configured for VO '{0}'")]
    UnknownVo(String),
    #[error("attribute authority for VO '{vo}' refused the request: {message}")]
    Authority { vo: String, message: String },
    #[error("attribute authority for VO '{vo}' returned no attribute certificates")]
    EmptyReply { vo: String },
    #[error("attribute certificate for VO '{vo}' is not valid base64")]
    BadPayload {
        vo: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Fetches attribute certificates for one VO-scoped request.
pub trait AttributeAuthorityClient: Send + Sync {
    fn fetch_attributes(
        &self,
        identity: &ProxyIdentity,
        request: &AttributeRequest,
    ) -> Result<Vec<AttributeCertificate>, VoError>;
}

/// REST client for VOMS-style authorities: one `generate-ac` endpoint
/// per VO, queried over TLS with the user's credential.
#[derive(Default)]
pub struct RestAttributeClient {
    endpoints: HashMap<String, String>,
    trust_anchors: Vec<Vec<u8>>,
}

impl RestAttributeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the authority endpoint answering for `vo`.
    pub fn with_endpoint(mut self, vo: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.insert(vo.into(), url.into());
        self
    }

    /// Trusts exactly the certificate authorities in the given PEM
    /// bundle instead of the system roots.
    pub fn with_trust_anchors(mut self, path: impl Into<PathBuf>) -> Result<Self, VoError> {
        let path = path.into();
        let bundle = fs::read(&path).map_err(|source| TransportError::Credential {
            path: path.clone(),
            source,
        })?;
        let blocks = pem::parse_many(&bundle).map_err(|source| TransportError::BadPem {
            path: path.clone(),
            source,
        })?;
        let anchors: Vec<Vec<u8>> = blocks
            .iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.contents().to_vec())
            .collect();
        if anchors.is_empty() {
            return Err(TransportError::EmptyTrustAnchors { path }.into());
        }
        self.trust_anchors = anchors;
        Ok(self)
    }

    fn client_for(&self, identity: &ProxyIdentity) -> Result<Client, VoError> {
        let tls_identity = reqwest::Identity::from_pkcs8_pem(
            identity.certificate_pem.as_bytes(),
            &identity.private_key_pem,
        )
        .map_err(TransportError::Http)?;
        let mut builder = Client::builder()
            .timeout(resolve_timeout())
            .identity(tls_identity);
        for der in &self.trust_anchors {
            builder = builder
                .add_root_certificate(reqwest::Certificate::from_der(der).map_err(TransportError::Http)?);
        }
        Ok(builder.build().map_err(TransportError::Http)?)
    }
}

impl AttributeAuthorityClient for RestAttributeClient {
    fn fetch_attributes(
        &self,
        identity: &ProxyIdentity,
        request: &AttributeRequest,
    ) -> Result<Vec<AttributeCertificate>, VoError> {
        let endpoint = self
            .endpoints
            .get(&request.vo)
            .ok_or_else(|| VoError::UnknownVo(request.vo.clone()))?;
        let client = self.client_for(identity)?;
        let mut http = client
            .get(endpoint)
            .query(&[("lifetime", request.lifetime_secs.to_string())]);
        if !request.fqans.is_empty() {
            http = http.query(&[("fqans", request.fqans.join(","))]);
        }
        info!(
            "[attributes] GET {endpoint} (vo {}, {} fqans)",
            request.vo,
            request.fqans.len()
        );
        let response = http.send().map_err(TransportError::Http)?;
        let status = response.status();
        let body = response.text().map_err(TransportError::Http)?;
        debug!(
            "[attributes] {} -> {status} ({} bytes)",
            request.vo,
            body.len()
        );
        let reply = parse_attribute_reply(&request.vo, &body);
        if !status.is_success() {
            return match reply {
                Err(refusal @ VoError::Authority { .. }) => Err(refusal),
                _ => Err(VoError::Authority {
                    vo: request.vo.clone(),
                    message: format!("attribute authority replied with status {status}"),
                }),
            };
        }
        reply
    }
}

/// Digs attribute certificates out of an authority reply. An `error`
/// element anywhere in the body wins over any `ac` elements.
pub(crate) fn parse_attribute_reply(
    vo: &str,
    body: &str,
) -> Result<Vec<AttributeCertificate>, VoError> {
    if let Some(error) = find_element(body, "error", 0) {
        let message = find_element(error.content(), "message", 0)
            .map(|element| element.text().to_owned())
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| error.text().to_owned());
        return Err(VoError::Authority {
            vo: vo.to_owned(),
            message,
        });
    }
    let mut certificates = Vec::new();
    let mut from = 0;
    while let Some(ac) = find_element(body, "ac", from) {
        from = ac.end();
        let compact: String = ac.text().chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            continue;
        }
        let der = STANDARD
            .decode(compact.as_bytes())
            .map_err(|source| VoError::BadPayload {
                vo: vo.to_owned(),
                source,
            })?;
        certificates.push(AttributeCertificate {
            vo: vo.to_owned(),
            der,
        });
    }
    if certificates.is_empty() {
        return Err(VoError::EmptyReply {
            vo: vo.to_owned(),
        });
    }
    Ok(certificates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_certificates_are_decoded_in_order() {
        let body = "<voms>\n  <ac>MAMCAQE=</ac>\n  <ac>MAMC\n      AQE=</ac>\n</voms>";
        let acs = parse_attribute_reply("atlas", body).unwrap();
        assert_eq!(acs.len(), 2);
        for ac in &acs {
            assert_eq!(ac.vo, "atlas");
            assert_eq!(ac.der, vec![0x30, 0x03, 0x02, 0x01, 0x01]);
        }
    }

    #[test]
    fn error_replies_become_authority_failures() {
        let body = "<voms><error><code>NoSuchUser</code>\
                    <message>user unknown to this VO</message></error></voms>";
        let err = parse_attribute_reply("atlas", body).err().unwrap();
        match err {
            VoError::Authority { vo, message } => {
                assert_eq!(vo, "atlas");
                assert_eq!(message, "user unknown to this VO");
            }
            other => panic!("expected Authority, got {other:?}"),
        }
    }

    #[test]
    fn an_error_element_wins_over_attribute_certificates() {
        let body = "<voms><error><message>suspended</message></error><ac>MAMCAQE=</ac></voms>";
        assert!(matches!(
            parse_attribute_reply("atlas", body),
            Err(VoError::Authority { .. })
        ));
    }

    #[test]
    fn a_reply_without_certificates_is_an_empty_reply() {
        let err = parse_attribute_reply("atlas", "<voms></voms>").err().unwrap();
        assert!(matches!(err, VoError::EmptyReply { vo } if vo == "atlas"));
    }

    #[test]
    fn garbled_base64_is_a_bad_payload() {
        let err = parse_attribute_reply("atlas", "<voms><ac>not base64!</ac></voms>")
            .err()
            .unwrap();
        assert!(matches!(err, VoError::BadPayload { vo, .. } if vo == "atlas"));
    }

    #[test]
    fn unknown_vos_fail_before_any_network_traffic() {
        let client = RestAttributeClient::new().with_endpoint("cms", "https://voms.example.org");
        let identity = ProxyIdentity {
            certificate_pem: String::new(),
            private_key_pem: Zeroizing::new(Vec::new()),
        };
        let request = AttributeRequest {
            vo: "atlas".to_owned(),
            fqans: Vec::new(),
            lifetime_secs: 3600,
        };
        let err = client.fetch_attributes(&identity, &request).err().unwrap();
        assert!(matches!(err, VoError::UnknownVo(vo) if vo == "atlas"));
    }
}
