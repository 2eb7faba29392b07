//! Proxy derivation: turns an issued credential into a short-lived
//! delegated proxy, optionally augmented with VO attribute
//! certificates. The whole engine is serialized behind one gate.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use log::{info, warn};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::KeyUsage;
use openssl::x509::{X509, X509Extension, X509Name};
use rand::Rng;
use rand::rngs::OsRng;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::issuance::store;
use crate::secret::random_secret;
use crate::types::CredentialsPathInfo;

pub mod attributes;

use attributes::{
    AttributeAuthorityClient, AttributeCertificate, AttributeRequest, ProxyIdentity,
};

/// Default proxy validity, twelve hours.
pub const DEFAULT_PROXY_LIFETIME_SECS: u64 = 43_200;
/// Default modulus size of the throwaway proxy key.
pub const DEFAULT_PROXY_KEY_BITS: u32 = 2048;

/// Grace applied to `notBefore` so freshly cut proxies survive clock
/// skew between hosts.
const BACKDATE_SECS: i64 = 300;

/// RFC 3820 proxyCertInfo extension.
const OID_PROXY_CERT_INFO_RFC: &str = "1.3.6.1.5.5.7.1.14";
/// Pre-RFC draft proxyCertInfo extension.
const OID_PROXY_CERT_INFO_DRAFT: &str = "1.3.6.1.4.1.3536.1.222";
/// VOMS attribute certificate sequence.
const OID_ATTRIBUTE_CERTIFICATES: &str = "1.3.6.1.4.1.8005.100.100.5";

/// ProxyCertInfo payload granting full, non-path-constrained
/// delegation: SEQUENCE { ProxyPolicy { id-ppl-inheritAll } }.
const INHERIT_ALL_PROXY_CERT_INFO: [u8; 14] = [
    0x30, 0x0c, 0x30, 0x0a, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x15, 0x01,
];

/// The three proxy certificate generations relying parties understand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// Globus Toolkit 2 proxies: `CN=proxy`, no marker extension.
    Legacy,
    /// Draft-standard proxies (GT3), marked with the pre-RFC extension.
    Draft,
    /// RFC 3820 proxies, the default.
    #[default]
    Rfc3820,
}

impl FromStr for ProxyType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "legacy" | "gt2" => Ok(ProxyType::Legacy),
            "draft" | "gt3" => Ok(ProxyType::Draft),
            "rfc3820" | "rfc" | "gt4" => Ok(ProxyType::Rfc3820),
            _ => Err(Error::InvalidConfiguration(format!(
                "unknown proxy type '{raw}' (expected legacy, draft or rfc3820)"
            ))),
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyType::Legacy => "legacy",
            ProxyType::Draft => "draft",
            ProxyType::Rfc3820 => "rfc3820",
        })
    }
}

/// Per-derivation knobs. Each `derive` call takes its own copy, so two
/// callers can hold different lifetimes or proxy types without stepping
/// on each other.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Proxy (and attribute certificate) validity in seconds.
    pub lifetime_secs: u64,
    pub proxy_type: ProxyType,
    /// Modulus size of the generated proxy key.
    pub key_bits: u32,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            lifetime_secs: DEFAULT_PROXY_LIFETIME_SECS,
            proxy_type: ProxyType::default(),
            key_bits: DEFAULT_PROXY_KEY_BITS,
        }
    }
}

impl ProxyOptions {
    pub fn validate(&self) -> Result<()> {
        if self.lifetime_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "proxy lifetime_secs must be positive".to_owned(),
            ));
        }
        if self.key_bits < 512 {
            return Err(Error::InvalidConfiguration(format!(
                "proxy key_bits must be at least 512, got {}",
                self.key_bits
            )));
        }
        Ok(())
    }
}

/// One VO membership or role wanted on the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoRequest {
    pub vo: String,
    /// Fully qualified attribute name; `None` asks for plain
    /// membership.
    pub fqan: Option<String>,
}

impl VoRequest {
    pub fn new(vo: impl Into<String>) -> Self {
        Self {
            vo: vo.into(),
            fqan: None,
        }
    }

    pub fn with_fqan(vo: impl Into<String>, fqan: impl Into<String>) -> Self {
        Self {
            vo: vo.into(),
            fqan: Some(fqan.into()),
        }
    }

    /// Parses the conventional `vo` or `vo:fqan` command-line spelling.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || {
            Error::InvalidConfiguration(format!(
                "malformed VO request '{raw}' (expected vo or vo:fqan)"
            ))
        };
        match raw.split_once(':') {
            None => {
                if raw.trim().is_empty() {
                    return Err(malformed());
                }
                Ok(VoRequest::new(raw.trim()))
            }
            Some((vo, fqan)) => {
                let (vo, fqan) = (vo.trim(), fqan.trim());
                if vo.is_empty() || fqan.is_empty() {
                    return Err(malformed());
                }
                Ok(VoRequest::with_fqan(vo, fqan))
            }
        }
    }
}

/// Groups role requests by VO: the first request for a VO seeds the
/// merged entry, later roles for the same VO append to it. VO order is
/// first appearance.
pub fn merge_requests(requests: &[VoRequest], lifetime_secs: u64) -> Vec<AttributeRequest> {
    let mut merged: Vec<AttributeRequest> = Vec::new();
    for request in requests {
        let index = match merged.iter().position(|entry| entry.vo == request.vo) {
            Some(index) => index,
            None => {
                merged.push(AttributeRequest {
                    vo: request.vo.clone(),
                    fqans: Vec::new(),
                    lifetime_secs,
                });
                merged.len() - 1
            }
        };
        if let Some(fqan) = &request.fqan {
            merged[index].fqans.push(fqan.clone());
        }
    }
    merged
}

/// Handle on a derived proxy written to a temp file. The file is
/// removed when the handle drops; call [`into_path`](ProxyFile::into_path)
/// to keep it.
#[derive(Debug)]
pub struct ProxyFile {
    path: PathBuf,
    keep: bool,
}

impl ProxyFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detaches the file from the handle; the caller now owns it.
    pub fn into_path(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ProxyFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("[proxy] could not remove {}: {err}", self.path.display());
            }
        }
    }
}

/// Derives delegated proxies from issued credentials.
///
/// Derivations are serialized process-wide: attribute authority client
/// implementations are allowed to be non-reentrant, so at most one
/// `derive` runs at a time.
pub struct ProxyFactory {
    attribute_client: Option<Box<dyn AttributeAuthorityClient>>,
    gate: Mutex<()>,
}

impl Default for ProxyFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyFactory {
    /// A factory limited to plain proxies; deriving with VO requests
    /// fails until an attribute client is supplied.
    pub fn new() -> Self {
        Self {
            attribute_client: None,
            gate: Mutex::new(()),
        }
    }

    pub fn with_attribute_client(client: Box<dyn AttributeAuthorityClient>) -> Self {
        Self {
            attribute_client: Some(client),
            gate: Mutex::new(()),
        }
    }

    /// Builds a proxy from the credential at `credentials`, asking the
    /// attribute authorities for every VO named in `requests`. Returns
    /// the temp file holding proxy certificate, proxy key and user
    /// certificate.
    pub fn derive(
        &self,
        credentials: &CredentialsPathInfo,
        requests: &[VoRequest],
        options: &ProxyOptions,
    ) -> Result<ProxyFile> {
        let _gate = self
            .gate
            .lock()
            .map_err(|_| Error::Proxy("derivation gate poisoned by an earlier panic".to_owned()))?;
        options.validate()?;
        info!(
            "[proxy] deriving {} proxy from {} ({} VO requests, lifetime {}s)",
            options.proxy_type,
            credentials.certificate_path().display(),
            requests.len(),
            options.lifetime_secs
        );

        let certificate_pem = read_credential_text(credentials.certificate_path())?;
        let key_pem = Zeroizing::new(read_credential_bytes(credentials.private_key_path())?);
        let user = X509::from_pem(certificate_pem.as_bytes())?;
        let user_key = if credentials.private_key_password().is_empty() {
            PKey::private_key_from_pem(&key_pem)?
        } else {
            PKey::private_key_from_pem_passphrase(
                &key_pem,
                credentials.private_key_password().as_bytes(),
            )?
        };

        let attribute_certificates =
            self.fetch_attribute_certificates(&certificate_pem, &user_key, requests, options)?;

        let proxy_key = PKey::from_rsa(Rsa::generate(options.key_bits)?)?;
        let proxy = build_proxy_certificate(
            &user,
            &user_key,
            &proxy_key,
            &attribute_certificates,
            options,
        )?;
        write_proxy_bundle(&proxy, &proxy_key, &certificate_pem)
    }

    fn fetch_attribute_certificates(
        &self,
        certificate_pem: &str,
        user_key: &PKey<Private>,
        requests: &[VoRequest],
        options: &ProxyOptions,
    ) -> Result<Vec<AttributeCertificate>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.attribute_client.as_deref().ok_or_else(|| {
            Error::Proxy(
                "VO attributes requested but no attribute authority client is configured"
                    .to_owned(),
            )
        })?;
        let identity = ProxyIdentity {
            certificate_pem: certificate_pem.to_owned(),
            private_key_pem: Zeroizing::new(user_key.private_key_to_pem_pkcs8()?),
        };
        let mut certificates = Vec::new();
        for request in merge_requests(requests, options.lifetime_secs) {
            info!(
                "[proxy] requesting attributes from VO {} ({} fqans)",
                request.vo,
                request.fqans.len()
            );
            certificates.extend(client.fetch_attributes(&identity, &request)?);
        }
        Ok(certificates)
    }
}

fn read_credential_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| Error::CredentialRead {
        path: path.to_path_buf(),
        source,
    })
}

fn read_credential_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| Error::CredentialRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Signs a proxy certificate with the user key. Naming follows the
/// proxy conventions: subject is the user subject plus one `CN`
/// component, issuer is the user subject.
fn build_proxy_certificate(
    user: &X509,
    user_key: &PKey<Private>,
    proxy_key: &PKey<Private>,
    attribute_certificates: &[AttributeCertificate],
    options: &ProxyOptions,
) -> Result<X509> {
    let serial: u32 = OsRng.gen_range(1..=u32::MAX);
    let cn = match options.proxy_type {
        ProxyType::Legacy => "proxy".to_owned(),
        ProxyType::Draft | ProxyType::Rfc3820 => serial.to_string(),
    };

    let mut subject = X509Name::builder()?;
    for entry in user.subject_name().entries() {
        let text = entry.data().as_utf8()?;
        subject.append_entry_by_nid(entry.object().nid(), &text)?;
    }
    subject.append_entry_by_nid(Nid::COMMONNAME, &cn)?;
    let subject = subject.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial_asn1 = BigNum::from_u32(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&serial_asn1)?;
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(user.subject_name())?;
    builder.set_pubkey(proxy_key)?;

    let now = Utc::now().timestamp();
    let not_before = Asn1Time::from_unix(now - BACKDATE_SECS)?;
    let not_after = Asn1Time::from_unix(now + options.lifetime_secs as i64)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let mut key_usage = KeyUsage::new();
    key_usage.critical().digital_signature().key_encipherment();
    builder.append_extension(key_usage.build()?)?;

    match options.proxy_type {
        ProxyType::Legacy => {}
        ProxyType::Draft => {
            builder.append_extension(proxy_cert_info(OID_PROXY_CERT_INFO_DRAFT, false)?)?;
        }
        ProxyType::Rfc3820 => {
            builder.append_extension(proxy_cert_info(OID_PROXY_CERT_INFO_RFC, true)?)?;
        }
    }
    if !attribute_certificates.is_empty() {
        builder.append_extension(attribute_extension(attribute_certificates)?)?;
    }

    builder.sign(user_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn proxy_cert_info(oid: &str, critical: bool) -> std::result::Result<X509Extension, ErrorStack> {
    let payload = Asn1OctetString::new_from_bytes(&INHERIT_ALL_PROXY_CERT_INFO)?;
    let oid = Asn1Object::from_str(oid)?;
    X509Extension::new_from_der(&oid, critical, &payload)
}

/// Attribute certificates travel as SEQUENCE OF SEQUENCE OF AC under
/// the VOMS extension OID.
fn attribute_extension(
    attribute_certificates: &[AttributeCertificate],
) -> std::result::Result<X509Extension, ErrorStack> {
    let mut inner = Vec::new();
    for certificate in attribute_certificates {
        inner.extend_from_slice(&certificate.der);
    }
    let wrapped = der_sequence(&der_sequence(&inner));
    let payload = Asn1OctetString::new_from_bytes(&wrapped)?;
    let oid = Asn1Object::from_str(OID_ATTRIBUTE_CERTIFICATES)?;
    X509Extension::new_from_der(&oid, false, &payload)
}

fn der_sequence(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(0x30);
    der_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn der_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|byte| **byte == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Writes proxy certificate, proxy key and user certificate to a fresh
/// owner-only temp file, grid bundle order.
fn write_proxy_bundle(
    proxy: &X509,
    proxy_key: &PKey<Private>,
    user_certificate_pem: &str,
) -> Result<ProxyFile> {
    let path = std::env::temp_dir().join(format!("proxy-{}.pem", random_secret(64)));
    let mut bundle = Zeroizing::new(Vec::new());
    bundle.extend_from_slice(&proxy.to_pem()?);
    bundle.extend_from_slice(&proxy_key.private_key_to_pem_pkcs8()?);
    bundle.extend_from_slice(user_certificate_pem.as_bytes());
    if !user_certificate_pem.ends_with('\n') {
        bundle.push(b'\n');
    }
    store::store_credential(&path, &bundle)?;
    info!("[proxy] wrote {}", path.display());
    Ok(ProxyFile::new(path))
}
