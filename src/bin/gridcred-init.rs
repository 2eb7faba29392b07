//! Demo command line: issue a credential from an assertion URL and
//! optionally derive a VOMS proxy from it. Everything it needs comes
//! from one JSON configuration file.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use gridcred::proxy::attributes::RestAttributeClient;
use gridcred::{CredentialFactory, Error, IssuanceConfig, ProxyFactory, ProxyOptions, VoRequest};

#[derive(Debug, Deserialize)]
struct DemoConfig {
    issuance: IssuanceConfig,
    #[serde(default)]
    proxy: ProxyOptions,
    /// VO name to attribute authority endpoint.
    #[serde(default)]
    attribute_authorities: HashMap<String, String>,
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (config_path, assertion_url) = match (args.next(), args.next()) {
        (Some(config), Some(url)) => (PathBuf::from(config), url),
        _ => bail!("usage: gridcred-init <config.json> <assertion-url> [vo[:fqan] ...]"),
    };
    let vo_args: Vec<String> = args.collect();

    let file = File::open(&config_path)
        .with_context(|| format!("cannot open {}", config_path.display()))?;
    let config: DemoConfig = serde_json::from_reader(file)
        .with_context(|| format!("cannot parse {}", config_path.display()))?;
    let trust_anchors = config.issuance.trust_anchors_path.clone();

    let factory =
        CredentialFactory::new(config.issuance).context("building the credential factory")?;
    let credentials = match factory.issue(&assertion_url) {
        Ok(credentials) => credentials,
        Err(Error::AssertionExpired(message)) => {
            bail!(
                "the assertion at {assertion_url} is no longer valid ({message}); \
                 re-authenticate to obtain a fresh one and retry"
            );
        }
        Err(err) => return Err(err).context("issuing the credential"),
    };

    println!("Certificate path: {}", credentials.certificate_path().display());
    println!("Private key path: {}", credentials.private_key_path().display());
    println!("Private key password: {}", credentials.private_key_password());

    if vo_args.is_empty() {
        return Ok(());
    }

    let requests = vo_args
        .iter()
        .map(|raw| VoRequest::parse(raw))
        .collect::<gridcred::Result<Vec<_>>>()
        .context("parsing VO requests")?;

    let mut client = RestAttributeClient::new()
        .with_trust_anchors(&trust_anchors)
        .context("loading trust anchors for the attribute authorities")?;
    for (vo, url) in &config.attribute_authorities {
        client = client.with_endpoint(vo.clone(), url.clone());
    }
    let proxies = ProxyFactory::with_attribute_client(Box::new(client));
    let proxy = proxies
        .derive(&credentials, &requests, &config.proxy)
        .context("deriving the proxy")?;
    println!("Proxy path: {}", proxy.into_path().display());
    Ok(())
}
