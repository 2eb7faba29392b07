//! Proxy derivation against an on-disk credential and a mock attribute
//! authority.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::symm::Cipher;
use openssl::x509::{X509, X509Name};

use gridcred::proxy::attributes::{
    AttributeAuthorityClient, AttributeCertificate, AttributeRequest, ProxyIdentity, VoError,
};
use gridcred::secret::random_secret_default;
use gridcred::{CredentialsPathInfo, Error, ProxyFactory, ProxyOptions, ProxyType, VoRequest};

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gridcred-proxy-{}", random_secret_default()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn self_signed(key: &PKey<Private>) -> X509 {
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::DOMAINCOMPONENT, "org").unwrap();
    name.append_entry_by_nid(Nid::DOMAINCOMPONENT, "example").unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "Demo User 1234").unwrap();
    let name = name.build();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(11).unwrap()).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// Lays down a certificate and an encrypted key the way an issuance
/// would have.
fn issued_credentials(dir: &Path, password: &str) -> CredentialsPathInfo {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let certificate = self_signed(&key);
    let cert_path = dir.join("usercert.pem");
    let key_path = dir.join("userkey.pem");
    fs::write(&cert_path, certificate.to_pem().unwrap()).unwrap();
    let encrypted = key
        .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), password.as_bytes())
        .unwrap();
    fs::write(&key_path, encrypted).unwrap();
    CredentialsPathInfo::new(cert_path, key_path, password)
}

struct RecordingClient {
    requests: Arc<Mutex<Vec<AttributeRequest>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RecordingClient {
    fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn requests_handle(&self) -> Arc<Mutex<Vec<AttributeRequest>>> {
        Arc::clone(&self.requests)
    }

    fn peak_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }
}

impl AttributeAuthorityClient for RecordingClient {
    fn fetch_attributes(
        &self,
        _identity: &ProxyIdentity,
        request: &AttributeRequest,
    ) -> Result<Vec<AttributeCertificate>, VoError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(25));
        self.requests.lock().unwrap().push(request.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![AttributeCertificate {
            vo: request.vo.clone(),
            der: vec![0x30, 0x03, 0x02, 0x01, 0x01],
        }])
    }
}

fn pem_tags(bundle: &str) -> Vec<String> {
    pem::parse_many(bundle)
        .unwrap()
        .iter()
        .map(|block| block.tag().to_owned())
        .collect()
}

#[test]
fn a_plain_proxy_bundles_certificate_key_and_user_certificate() {
    let dir = scratch_dir();
    let credentials = issued_credentials(&dir, "pw-1");
    let factory = ProxyFactory::new();

    let proxy = factory
        .derive(&credentials, &[], &ProxyOptions::default())
        .unwrap();
    let bundle = fs::read_to_string(proxy.path()).unwrap();
    assert_eq!(
        pem_tags(&bundle),
        vec!["CERTIFICATE", "PRIVATE KEY", "CERTIFICATE"]
    );

    let blocks = pem::parse_many(&bundle).unwrap();
    let proxy_cert = X509::from_der(blocks[0].contents()).unwrap();
    let user_cert = X509::from_der(blocks[2].contents()).unwrap();
    assert!(proxy.path().exists());
    assert!(
        proxy_cert
            .verify(&user_cert.public_key().unwrap())
            .unwrap()
    );
    let issuer: Vec<String> = proxy_cert
        .issuer_name()
        .entries()
        .map(|entry| entry.data().as_utf8().unwrap().to_string())
        .collect();
    assert_eq!(issuer, vec!["org", "example", "Demo User 1234"]);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn the_proxy_file_is_removed_on_drop_unless_detached() {
    let dir = scratch_dir();
    let credentials = issued_credentials(&dir, "pw-2");
    let factory = ProxyFactory::new();
    let options = ProxyOptions {
        proxy_type: ProxyType::Legacy,
        key_bits: 512,
        ..ProxyOptions::default()
    };

    let dropped_path;
    {
        let proxy = factory.derive(&credentials, &[], &options).unwrap();
        dropped_path = proxy.path().to_path_buf();
        assert!(dropped_path.is_file());
    }
    assert!(!dropped_path.exists());

    let kept_path = factory
        .derive(&credentials, &[], &options)
        .unwrap()
        .into_path();
    assert!(kept_path.is_file());

    fs::remove_file(&kept_path).ok();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn vo_requests_are_merged_before_reaching_the_authority() {
    let dir = scratch_dir();
    let credentials = issued_credentials(&dir, "pw-3");
    let client = RecordingClient::new();
    let seen = client.requests_handle();
    let factory = ProxyFactory::with_attribute_client(Box::new(client));
    let options = ProxyOptions {
        lifetime_secs: 7200,
        key_bits: 512,
        ..ProxyOptions::default()
    };

    let requests = [
        VoRequest::with_fqan("atlas", "/atlas/Role=production"),
        VoRequest::new("cms"),
        VoRequest::with_fqan("atlas", "/atlas/Role=admin"),
    ];
    let proxy = factory.derive(&credentials, &requests, &options).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].vo, "atlas");
    assert_eq!(
        seen[0].fqans,
        vec!["/atlas/Role=production", "/atlas/Role=admin"]
    );
    assert_eq!(seen[0].lifetime_secs, 7200);
    assert_eq!(seen[1].vo, "cms");
    assert!(seen[1].fqans.is_empty());

    // Two VOs answered, so the AC extension wraps both DERs.
    let bundle = fs::read_to_string(proxy.path()).unwrap();
    let blocks = pem::parse_many(&bundle).unwrap();
    let proxy_der = blocks[0].contents().to_vec();
    let (_, parsed) = x509_parser::parse_x509_certificate(&proxy_der).unwrap();
    let ac_extension = parsed
        .extensions()
        .iter()
        .find(|extension| extension.oid.to_id_string() == "1.3.6.1.4.1.8005.100.100.5")
        .expect("attribute certificate extension missing");
    let single_ac = [0x30u8, 0x03, 0x02, 0x01, 0x01];
    let mut expected = vec![0x30, 0x0c, 0x30, 0x0a];
    expected.extend_from_slice(&single_ac);
    expected.extend_from_slice(&single_ac);
    assert_eq!(ac_extension.value, expected.as_slice());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn derivations_never_overlap() {
    let dir = scratch_dir();
    let credentials = issued_credentials(&dir, "pw-4");
    let client = RecordingClient::new();
    let peak = client.peak_handle();
    let factory = Arc::new(ProxyFactory::with_attribute_client(Box::new(client)));
    let options = ProxyOptions {
        key_bits: 512,
        ..ProxyOptions::default()
    };

    let mut handles = Vec::new();
    for _ in 0..2 {
        let factory = Arc::clone(&factory);
        let credentials = credentials.clone();
        let options = options.clone();
        handles.push(thread::spawn(move || {
            let requests = [VoRequest::new("atlas")];
            factory.derive(&credentials, &requests, &options).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_attribute_client_fails_only_when_attributes_are_wanted() {
    let dir = scratch_dir();
    let credentials = issued_credentials(&dir, "pw-5");
    let factory = ProxyFactory::new();
    let options = ProxyOptions {
        key_bits: 512,
        ..ProxyOptions::default()
    };

    assert!(factory.derive(&credentials, &[], &options).is_ok());

    let err = factory
        .derive(&credentials, &[VoRequest::new("atlas")], &options)
        .unwrap_err();
    assert!(matches!(err, Error::Proxy(_)));

    fs::remove_dir_all(&dir).ok();
}
