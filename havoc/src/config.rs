use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

/// A test server for exercising misbehaving and unusual network endpoints
#[derive(Parser, Debug)]
#[command(name = "havoc")]
#[command(version, about, long_about = None)]
pub struct Args {
  /// The domain that structured SNI prefixes are relative to
  #[arg(long, env = "HAVOC_ROOT_DOMAIN", default_value = "localhost")]
  pub root_domain: String,

  /// The TCP ports to bind
  #[arg(long, env = "HAVOC_PORTS", value_delimiter = ',', default_values_t = [8080u16])]
  pub ports: Vec<u16>,

  /// The ACME provider used for publicly trusted certificates
  /// (one of "letsencrypt", "zerossl", "google"; local CA only when unset)
  #[arg(long, env = "HAVOC_ACME_PROVIDER")]
  pub acme_provider: Option<String>,

  /// The ACME External Account Binding key identifier
  #[arg(long, env = "HAVOC_EAB_KID", requires = "eab_hmac_key")]
  pub eab_kid: Option<String>,

  /// The ACME External Account Binding HMAC key (base64url)
  #[arg(long, env = "HAVOC_EAB_HMAC_KEY", requires = "eab_kid")]
  pub eab_hmac_key: Option<String>,

  /// Domains whose certificates are refreshed at startup and every 24 hours
  #[arg(long, env = "HAVOC_PROACTIVE_CERT_DOMAINS", value_delimiter = ',')]
  pub proactive_cert_domains: Vec<String>,

  /// The persistent location for cached certificates
  #[arg(long, env = "HAVOC_CERT_CACHE_DIR")]
  pub cert_cache_dir: Option<PathBuf>,

  /// Trust inbound PROXY protocol headers and surface their source addresses
  #[arg(long, env = "HAVOC_TRUST_PROXY_PROTOCOL", default_value_t = false)]
  pub trust_proxy_protocol: bool,

  /// Where requests for the root path of the bare domain are redirected
  #[arg(long, env = "HAVOC_LANDING_URL", default_value = "https://example.com/")]
  pub landing_url: String,
}

/// The ACME providers the server knows directory URLs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeProvider {
  LetsEncrypt,
  ZeroSsl,
  Google,
}

impl AcmeProvider {
  pub fn parse(name: &str) -> Option<Self> {
    match name {
      "letsencrypt" => Some(Self::LetsEncrypt),
      "zerossl" => Some(Self::ZeroSsl),
      "google" => Some(Self::Google),
      _ => None,
    }
  }

  /// The production directory URL for the provider.
  pub fn directory_url(&self) -> &'static str {
    match self {
      Self::LetsEncrypt => "https://acme-v02.api.letsencrypt.org/directory",
      Self::ZeroSsl => "https://acme.zerossl.com/v2/DV90",
      Self::Google => "https://dv.acme-v02.api.pki.goog/directory",
    }
  }

}

/// The resolved server configuration shared across components.
pub struct ServerOptions {
  pub root_domain: String,
  pub ports: Vec<u16>,
  pub acme_provider: Option<AcmeProvider>,
  pub eab_config: Option<(String, String)>,
  pub proactive_cert_domains: Vec<String>,
  pub cert_cache_dir: Option<PathBuf>,
  pub trust_proxy_protocol: bool,
  pub landing_url: String,
}

impl ServerOptions {
  pub fn from_args(args: Args) -> Result<Arc<Self>, anyhow::Error> {
    let acme_provider = match &args.acme_provider {
      Some(name) => Some(
        AcmeProvider::parse(name).ok_or_else(|| anyhow::anyhow!("Unknown ACME provider \"{name}\""))?,
      ),
      None => None,
    };
    let eab_config = match (args.eab_kid, args.eab_hmac_key) {
      (Some(kid), Some(hmac_key)) => Some((kid, hmac_key)),
      _ => None,
    };
    if args.ports.is_empty() {
      anyhow::bail!("At least one TCP port must be configured");
    }
    Ok(Arc::new(Self {
      root_domain: args.root_domain,
      ports: args.ports,
      acme_provider,
      eab_config,
      proactive_cert_domains: args.proactive_cert_domains,
      cert_cache_dir: args.cert_cache_dir,
      trust_proxy_protocol: args.trust_proxy_protocol,
      landing_url: args.landing_url,
    }))
  }

  /// Computes the structured-SNI prefix of a hostname, if the hostname
  /// belongs to the configured root domain.
  pub fn hostname_prefix<'a>(&self, hostname: &'a str) -> Option<&'a str> {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname == self.root_domain {
      return None;
    }
    hostname
      .strip_suffix(&self.root_domain)
      .and_then(|prefix| prefix.strip_suffix('.'))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn options_with_root(root_domain: &str) -> ServerOptions {
    ServerOptions {
      root_domain: root_domain.to_string(),
      ports: vec![8080],
      acme_provider: None,
      eab_config: None,
      proactive_cert_domains: Vec::new(),
      cert_cache_dir: None,
      trust_proxy_protocol: false,
      landing_url: "https://example.com/".to_string(),
    }
  }

  #[test]
  fn test_hostname_prefix() {
    let options = options_with_root("testserver.host");
    assert_eq!(options.hostname_prefix("testserver.host"), None);
    assert_eq!(options.hostname_prefix("expired.testserver.host"), Some("expired"));
    assert_eq!(
      options.hostname_prefix("expired--http2.testserver.host"),
      Some("expired--http2")
    );
    assert_eq!(options.hostname_prefix("unrelated.example"), None);
    // Trailing root-label dots are ignored
    assert_eq!(options.hostname_prefix("www.testserver.host."), Some("www"));
  }

  #[test]
  fn test_acme_provider_parsing() {
    assert_eq!(AcmeProvider::parse("letsencrypt"), Some(AcmeProvider::LetsEncrypt));
    assert_eq!(AcmeProvider::parse("zerossl"), Some(AcmeProvider::ZeroSsl));
    assert_eq!(AcmeProvider::parse("google"), Some(AcmeProvider::Google));
    assert_eq!(AcmeProvider::parse("buypass"), None);
  }
}
