use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{ServerConfig, SupportedProtocolVersion};
use serde::Serialize;

use crate::cert_generator::ResolvedCertificate;
use crate::sni::{TlsOptions, TlsVersion};
use crate::util::lru_ttl_cache::LruTtlCache;

/// Contexts live at most this long, even for long-lived certificates.
const MAX_CONTEXT_TTL: Duration = Duration::from_secs(24 * 3600);
const MAX_CACHED_CONTEXTS: usize = 1000;

/// A certificate resolver resolving one certified key.
#[derive(Debug)]
pub struct OneCertifiedKeyResolver {
  certified_key: Arc<CertifiedKey>,
}

impl OneCertifiedKeyResolver {
  pub fn new(certified_key: Arc<CertifiedKey>) -> Self {
    Self { certified_key }
  }
}

impl ResolvesServerCert for OneCertifiedKeyResolver {
  fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    Some(self.certified_key.clone())
  }
}

/// The serialized form of everything that distinguishes one TLS context from
/// another besides the certificate itself.
#[derive(Serialize)]
struct ContextOptionsKey<'a> {
  tls: &'a TlsOptions,
  alpn: &'a [String],
}

/// Computes the cache key for a configured context:
/// `<certCacheKey>|<canonical JSON of the TLS options and ALPN preferences>`.
pub fn context_cache_key(cert_cache_key: &str, tls_options: &TlsOptions, alpn: &[String]) -> String {
  let options = ContextOptionsKey { tls: tls_options, alpn };
  format!("{}|{}", cert_cache_key, serde_json::to_string(&options).unwrap_or_default())
}

/// A bounded LRU of configured TLS server contexts, keyed by certificate
/// cache key plus TLS options. Entry lifetime is capped by both the
/// certificate expiry and a 24-hour ceiling.
pub struct SecureContextCache {
  contexts: Mutex<LruTtlCache<String, Arc<ServerConfig>>>,
}

impl Default for SecureContextCache {
  fn default() -> Self {
    Self {
      contexts: Mutex::new(LruTtlCache::new(MAX_CACHED_CONTEXTS)),
    }
  }
}

impl SecureContextCache {
  /// Fetches a live cached context, or builds one with the given factory.
  /// The factory returns the context together with the backing certificate's
  /// expiry, which bounds the cache entry's lifetime.
  pub fn get_or_build(
    &self,
    key: &str,
    factory: impl FnOnce() -> Result<(Arc<ServerConfig>, i64), Box<dyn Error + Send + Sync>>,
  ) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    if let Some(context) = self.contexts.lock().expect("context cache lock poisoned").get(&key.to_string()) {
      return Ok(context);
    }

    let (context, certificate_expiry_ms) = factory()?;

    let until_cert_expiry = certificate_expiry_ms - chrono::Utc::now().timestamp_millis();
    let ttl = if until_cert_expiry > 0 {
      MAX_CONTEXT_TTL.min(Duration::from_millis(until_cert_expiry as u64))
    } else {
      // Deliberately expired certificates still get a cached context
      MAX_CONTEXT_TTL
    };
    self
      .contexts
      .lock()
      .expect("context cache lock poisoned")
      .insert_until(key.to_string(), context.clone(), Instant::now() + ttl);
    Ok(context)
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.contexts.lock().unwrap().len()
  }
}

fn rustls_versions(tls_options: &TlsOptions) -> Result<Vec<&'static SupportedProtocolVersion>, Box<dyn Error + Send + Sync>> {
  if tls_options.min_version.is_none() && tls_options.disabled_versions == 0 {
    return Ok(vec![&TLS12, &TLS13]);
  }
  let mut versions = Vec::new();
  for version in tls_options.enabled_versions() {
    match version {
      TlsVersion::V1_2 => versions.push(&TLS12),
      TlsVersion::V1_3 => versions.push(&TLS13),
      // rustls does not implement TLS 1.0/1.1; those labels can only be
      // honored when a newer version is also enabled
      TlsVersion::V1_0 | TlsVersion::V1_1 => {}
    }
  }
  if versions.is_empty() {
    Err(anyhow::anyhow!("None of the requested TLS versions are supported by this server"))?;
  }
  Ok(versions)
}

/// Builds a rustls server context for a resolved certificate: protocol
/// versions from the compiled TLS options, ALPN preferences in server order,
/// and an optional OCSP staple attached to the certified key.
pub fn build_server_config(
  certificate: &ResolvedCertificate,
  tls_options: &TlsOptions,
  alpn: &[String],
  ocsp_staple: Option<Vec<u8>>,
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
  let versions = rustls_versions(tls_options)?;

  let chain = rustls_pemfile::certs(&mut certificate.chain_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
  let private_key = rustls_pemfile::private_key(&mut certificate.key_pem.as_bytes())?
    .ok_or_else(|| anyhow::anyhow!("Invalid private key"))?;
  let signing_key = CryptoProvider::get_default()
    .ok_or_else(|| anyhow::anyhow!("Cannot get default crypto provider"))?
    .key_provider
    .load_private_key(private_key)?;

  let mut certified_key = CertifiedKey::new(chain, signing_key);
  certified_key.ocsp = ocsp_staple;

  let mut config = ServerConfig::builder_with_protocol_versions(&versions)
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(OneCertifiedKeyResolver::new(Arc::new(certified_key))));
  config.alpn_protocols = alpn.iter().map(|protocol| protocol.as_bytes().to_vec()).collect();

  Ok(Arc::new(config))
}
