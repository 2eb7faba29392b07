use log::warn;
use thiserror::Error;

use crate::issuance::markup::find_element;
use crate::types::CertificateExtension;

/// Outer element wrapping every login reply.
pub const LOGIN_RESPONSE_ELEMENT: &str = "SLCSLoginResponse";
/// Outer element wrapping every certificate reply.
pub const CERTIFICATE_RESPONSE_ELEMENT: &str = "SLCSCertificateResponse";

/// Why a service reply was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("{outer} element not found in service reply")]
    MissingResponse { outer: &'static str },
    #[error("{element} element not found in {outer} reply")]
    MissingElement {
        element: &'static str,
        outer: &'static str,
    },
    #[error("attribute '{attribute}' not found on {element} element")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("certificate request URL does not look like an HTTP endpoint: {0}")]
    InvalidRequestUrl(String),
    #[error("unknown status in {outer} reply: {status}")]
    UnknownStatus {
        outer: &'static str,
        status: String,
    },
    /// The service reported a failure of its own; the message combines
    /// its error text with the remote stack trace when one was sent.
    #[error("{error}{}", render_stacktrace(.stacktrace))]
    ServiceFailure {
        error: String,
        stacktrace: Option<String>,
    },
}

fn render_stacktrace(stacktrace: &Option<String>) -> String {
    match stacktrace {
        Some(trace) => format!("\nRemote error:\n{trace}"),
        None => String::new(),
    }
}

/// Verifies the status element of a reply wrapped in `outer`.
///
/// The first outer element in the document is authoritative. A status of
/// `Success` (any case) passes; `Error` pulls out the service's `error`
/// element and optional `stacktrace`; anything else is rejected as an
/// unknown status.
pub fn check_status(body: &str, outer: &'static str) -> Result<(), ResponseError> {
    if find_element(body, outer, 0)
        .filter(|e| !e.text().is_empty())
        .is_none()
    {
        return Err(ResponseError::MissingResponse { outer });
    }
    let status = find_element(body, "status", 0)
        .filter(|e| !e.text().is_empty())
        .ok_or(ResponseError::MissingElement {
            element: "status",
            outer,
        })?;
    let verdict = status.text();
    if verdict.eq_ignore_ascii_case("error") {
        let error = find_element(body, "error", status.end())
            .filter(|e| !e.text().is_empty())
            .ok_or(ResponseError::MissingElement {
                element: "error",
                outer,
            })?;
        let stacktrace = find_element(body, "stacktrace", error.end())
            .map(|e| e.text().to_owned())
            .filter(|t| !t.is_empty());
        return Err(ResponseError::ServiceFailure {
            error: error.text().to_owned(),
            stacktrace,
        });
    }
    if !verdict.eq_ignore_ascii_case("success") {
        return Err(ResponseError::UnknownStatus {
            outer,
            status: verdict.to_owned(),
        });
    }
    Ok(())
}

/// Everything a successful login reply grants the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReply {
    pub authorization_token: String,
    pub certificate_request_url: String,
    pub subject: String,
    pub extensions: Vec<CertificateExtension>,
}

/// Extracts the authorization token, certificate request endpoint,
/// issued subject and requested extensions from a login reply.
pub fn parse_login(body: &str) -> Result<LoginReply, ResponseError> {
    let outer = LOGIN_RESPONSE_ELEMENT;
    check_status(body, outer)?;
    let token = find_element(body, "AuthorizationToken", 0)
        .filter(|e| !e.text().is_empty())
        .ok_or(ResponseError::MissingElement {
            element: "AuthorizationToken",
            outer,
        })?;
    let request = find_element(body, "CertificateRequest", token.end()).ok_or(
        ResponseError::MissingElement {
            element: "CertificateRequest",
            outer,
        },
    )?;
    let url = request
        .attribute("url")
        .ok_or(ResponseError::MissingAttribute {
            element: "CertificateRequest",
            attribute: "url",
        })?;
    if !url.starts_with("http") {
        return Err(ResponseError::InvalidRequestUrl(url.to_owned()));
    }
    let subject = find_element(body, "Subject", request.end())
        .filter(|e| !e.text().is_empty())
        .ok_or(ResponseError::MissingElement {
            element: "Subject",
            outer,
        })?;

    let mut extensions = Vec::new();
    let mut pos = subject.end();
    while let Some(extension) = find_element(body, "certificateextension", pos) {
        pos = extension.end();
        match extension.attribute("name") {
            Some(name) if !name.is_empty() => {
                extensions.push(CertificateExtension::new(name, extension.text()));
            }
            _ => warn!("[response] certificateextension without a name attribute ignored"),
        }
    }

    Ok(LoginReply {
        authorization_token: token.text().to_owned(),
        certificate_request_url: url.to_owned(),
        subject: subject.text().to_owned(),
        extensions,
    })
}

/// Extracts the issued certificate PEM from a certificate reply.
pub fn parse_certificate(body: &str) -> Result<String, ResponseError> {
    let outer = CERTIFICATE_RESPONSE_ELEMENT;
    check_status(body, outer)?;
    let certificate = find_element(body, "Certificate", 0)
        .filter(|e| !e.text().is_empty())
        .ok_or(ResponseError::MissingElement {
            element: "Certificate",
            outer,
        })?;
    Ok(certificate.text().to_owned())
}
