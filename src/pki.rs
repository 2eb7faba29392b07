//! Thin wrappers around the OpenSSL primitives the issuance protocol
//! consumes: key-pair generation, PKCS#10 assembly and inspection of
//! the certificate the service hands back.

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{ExtendedKeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Extension, X509Name, X509NameBuilder, X509Req, X509ReqBuilder};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::types::CertificateExtension;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("cryptographic operation failed: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("issued certificate could not be parsed: {0}")]
    BadCertificate(String),
    #[error("subject '{0}' contains no distinguished-name entries")]
    EmptySubject(String),
}

/// A freshly generated RSA key pair plus the password protecting its
/// serialized form.
pub struct CertificateKeys {
    pkey: PKey<Private>,
    password: Zeroizing<String>,
    bits: u32,
}

impl CertificateKeys {
    pub fn generate(bits: u32, password: &str) -> Result<Self, PkiError> {
        let rsa = Rsa::generate(bits)?;
        Ok(Self {
            pkey: PKey::from_rsa(rsa)?,
            password: Zeroizing::new(password.to_owned()),
            bits,
        })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub(crate) fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }

    /// Private key as PKCS#8 PEM, AES-256-CBC encrypted under the
    /// password given at generation time.
    pub fn encrypted_private_key_pem(&self) -> Result<Zeroizing<Vec<u8>>, PkiError> {
        let pem = self
            .pkey
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), self.password.as_bytes())?;
        Ok(Zeroizing::new(pem))
    }

    pub fn public_key_pem(&self) -> Result<Vec<u8>, PkiError> {
        Ok(self.pkey.public_key_to_pem()?)
    }
}

/// PKCS#10 request binding the service-issued subject and extension
/// list to a generated key pair.
pub struct SigningRequest {
    req: X509Req,
}

impl SigningRequest {
    pub fn new(
        keys: &CertificateKeys,
        subject: &str,
        extensions: &[CertificateExtension],
    ) -> Result<Self, PkiError> {
        let name = parse_subject_name(subject)?;
        let mut builder = X509ReqBuilder::new()?;
        builder.set_version(0)?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(keys.pkey())?;
        if let Some(stack) = build_extension_stack(&builder, extensions)? {
            builder.add_extensions(&stack)?;
        }
        builder.sign(keys.pkey(), MessageDigest::sha256())?;
        Ok(Self {
            req: builder.build(),
        })
    }

    pub fn pem(&self) -> Result<String, PkiError> {
        let bytes = self.req.to_pem()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Builds an X.509 name from the `DC=.., O=.., CN=..` form the issuing
/// service hands back. The slash-separated variant is accepted too.
fn parse_subject_name(subject: &str) -> Result<X509Name, PkiError> {
    let mut builder = X509NameBuilder::new()?;
    let mut entries = 0;
    for part in split_dn(subject) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        builder.append_entry_by_text(key.trim(), value.trim())?;
        entries += 1;
    }
    if entries == 0 {
        return Err(PkiError::EmptySubject(subject.to_owned()));
    }
    Ok(builder.build())
}

fn split_dn(subject: &str) -> impl Iterator<Item = &str> {
    let (separator, body) = match subject.strip_prefix('/') {
        Some(rest) => ('/', rest),
        None => (',', subject),
    };
    body.split(separator).map(str::trim).filter(|p| !p.is_empty())
}

/// Turns the extension list into OpenSSL extensions. Names the service
/// may send but this client cannot express are skipped with a warning,
/// never silently mangled.
fn build_extension_stack(
    builder: &X509ReqBuilder,
    extensions: &[CertificateExtension],
) -> Result<Option<Stack<X509Extension>>, PkiError> {
    if extensions.is_empty() {
        return Ok(None);
    }
    let mut stack = Stack::new()?;
    let mut pushed = 0;
    for extension in extensions {
        let built = match extension.name.to_ascii_lowercase().as_str() {
            "subjectaltname" => subject_alt_name(builder, &extension.value)?,
            "extendedkeyusage" => extended_key_usage(&extension.value)?,
            _ => {
                warn!(
                    "[pki] unsupported certificate extension '{}' skipped",
                    extension.name
                );
                None
            }
        };
        if let Some(built) = built {
            stack.push(built)?;
            pushed += 1;
        }
    }
    if pushed == 0 {
        return Ok(None);
    }
    Ok(Some(stack))
}

fn subject_alt_name(
    builder: &X509ReqBuilder,
    value: &str,
) -> Result<Option<X509Extension>, PkiError> {
    let mut san = SubjectAlternativeName::new();
    let mut entries = 0;
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((kind, name)) = entry.split_once(':') else {
            warn!("[pki] untyped SubjectAltName entry '{entry}' skipped");
            continue;
        };
        let name = name.trim();
        match kind.trim().to_ascii_lowercase().as_str() {
            "email" => san.email(name),
            "dns" => san.dns(name),
            "uri" => san.uri(name),
            "ip" => san.ip(name),
            _ => {
                warn!("[pki] unsupported SubjectAltName kind in '{entry}' skipped");
                continue;
            }
        };
        entries += 1;
    }
    if entries == 0 {
        return Ok(None);
    }
    Ok(Some(san.build(&builder.x509v3_context(None))?))
}

fn extended_key_usage(value: &str) -> Result<Option<X509Extension>, PkiError> {
    let mut eku = ExtendedKeyUsage::new();
    let mut entries = 0;
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.to_ascii_lowercase().as_str() {
            "clientauth" => eku.client_auth(),
            "serverauth" => eku.server_auth(),
            "emailprotection" => eku.email_protection(),
            "codesigning" => eku.code_signing(),
            "timestamping" => eku.time_stamping(),
            _ => eku.other(entry),
        };
        entries += 1;
    }
    if entries == 0 {
        return Ok(None);
    }
    Ok(Some(eku.build()?))
}

/// An issued certificate as returned by the service, with the parsed
/// summary used for logging.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pem: String,
    subject: String,
    serial: String,
    fingerprint: String,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
}

impl IssuedCertificate {
    pub fn from_pem(pem_text: &str) -> Result<Self, PkiError> {
        let normalized = normalize_pem(pem_text);
        let (_, parsed) = x509_parser::pem::parse_x509_pem(normalized.as_bytes())
            .map_err(|e| PkiError::BadCertificate(e.to_string()))?;
        let certificate = parsed
            .parse_x509()
            .map_err(|e| PkiError::BadCertificate(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&parsed.contents);
        let fingerprint = format!("sha256:{}", hex::encode(hasher.finalize()));
        let subject = certificate.subject().to_string();
        let serial = certificate.raw_serial_as_string();
        let not_before = Utc
            .timestamp_opt(certificate.validity().not_before.timestamp(), 0)
            .single();
        let not_after = Utc
            .timestamp_opt(certificate.validity().not_after.timestamp(), 0)
            .single();

        Ok(Self {
            pem: normalized,
            subject,
            serial,
            fingerprint,
            not_before,
            not_after,
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// `sha256:<hex>` over the DER encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }
}

fn normalize_pem(text: &str) -> String {
    let trimmed = text.trim();
    let mut out = String::with_capacity(trimmed.len() + 1);
    out.push_str(trimmed);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::nid::Nid;
    use openssl::x509::X509;
    use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension};

    const SUBJECT: &str = "DC=org, DC=example, O=Example, CN=Demo User 1234";

    fn demo_keys() -> CertificateKeys {
        CertificateKeys::generate(1024, "hunter2").unwrap()
    }

    fn self_signed_pem(keys: &CertificateKeys) -> String {
        let name = parse_subject_name(SUBJECT).unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(keys.pkey()).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(11).unwrap())
            .unwrap();
        builder.sign(keys.pkey(), MessageDigest::sha256()).unwrap();
        String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
    }

    #[test]
    fn encrypted_key_round_trips_with_the_password() {
        let keys = demo_keys();
        let pem = keys.encrypted_private_key_pem().unwrap();
        let decrypted = PKey::private_key_from_pem_passphrase(&pem, b"hunter2").unwrap();
        assert!(decrypted.public_eq(keys.pkey()));
    }

    #[test]
    fn encrypted_key_rejects_the_wrong_password() {
        let keys = demo_keys();
        let pem = keys.encrypted_private_key_pem().unwrap();
        assert!(PKey::private_key_from_pem_passphrase(&pem, b"nope").is_err());
    }

    #[test]
    fn signing_request_binds_key_subject_and_extensions() {
        let keys = demo_keys();
        let extensions = vec![
            CertificateExtension::new("SubjectAltName", "email:demo@example.org"),
            CertificateExtension::new("ExtendedKeyUsage", "clientAuth"),
        ];
        let request = SigningRequest::new(&keys, SUBJECT, &extensions).unwrap();
        let parsed = X509Req::from_pem(request.pem().unwrap().as_bytes()).unwrap();

        let public = parsed.public_key().unwrap();
        assert!(public.public_eq(keys.pkey()));
        assert!(parsed.verify(&public).unwrap());

        let cn: Vec<String> = parsed
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .map(|e| e.data().as_utf8().unwrap().to_string())
            .collect();
        assert_eq!(cn, vec!["Demo User 1234".to_owned()]);

        let der = parsed.to_der().unwrap();
        let (_, csr) =
            x509_parser::certification_request::X509CertificationRequest::from_der(&der).unwrap();
        let requested: Vec<&ParsedExtension> = csr
            .requested_extensions()
            .expect("extension request attribute present")
            .collect();
        assert_eq!(requested.len(), 2);
        match requested[0] {
            ParsedExtension::SubjectAlternativeName(san) => {
                assert!(san.general_names.iter().any(
                    |name| matches!(name, GeneralName::RFC822Name(mail) if *mail == "demo@example.org")
                ));
            }
            other => panic!("expected SubjectAlternativeName first, got {other:?}"),
        }
        assert!(matches!(
            requested[1],
            ParsedExtension::ExtendedKeyUsage(eku) if eku.client_auth
        ));
    }

    #[test]
    fn signing_request_without_extensions_omits_the_attribute() {
        let keys = demo_keys();
        let request = SigningRequest::new(&keys, SUBJECT, &[]).unwrap();
        let der = X509Req::from_pem(request.pem().unwrap().as_bytes())
            .unwrap()
            .to_der()
            .unwrap();
        let (_, csr) =
            x509_parser::certification_request::X509CertificationRequest::from_der(&der).unwrap();
        assert!(csr.requested_extensions().is_none());
    }

    #[test]
    fn slash_separated_subjects_parse_too() {
        let name = parse_subject_name("/DC=org/DC=example/CN=Demo User").unwrap();
        assert_eq!(name.entries().count(), 3);
    }

    #[test]
    fn subjects_without_entries_are_rejected() {
        assert!(matches!(
            parse_subject_name("just a string"),
            Err(PkiError::EmptySubject(_))
        ));
    }

    #[test]
    fn issued_certificate_summary_reads_the_pem() {
        let keys = demo_keys();
        let pem = self_signed_pem(&keys);
        let issued = IssuedCertificate::from_pem(&pem).unwrap();
        assert!(issued.subject().contains("Demo User 1234"));
        assert!(issued.fingerprint().starts_with("sha256:"));
        assert!(issued.not_before().is_some());
        assert!(issued.not_after().unwrap() > issued.not_before().unwrap());
        assert!(issued.pem().ends_with('\n'));
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(matches!(
            IssuedCertificate::from_pem("not pem at all"),
            Err(PkiError::BadCertificate(_))
        ));
    }
}
