use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use instant_acme::{
  Account, AccountCredentials, AuthorizationStatus, BodyWrapper, BytesResponse, ChallengeType, ExternalAccountKey,
  HttpClient, Identifier, NewAccount, NewOrder, OrderStatus, RetryPolicy, RevocationReason, RevocationRequest,
};
use rustls::client::WebPkiServerVerifier;
use rustls::ClientConfig;
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::sync::OnceCell;

use crate::cert_cache::{
  calculate_cert_cache_key, certificate_chain_expiry_ms, load_cached_certificates, store_cached_certificate,
  CachedCertificate,
};
use crate::config::AcmeProvider;
use crate::logging::ErrorLogger;
use crate::sni::CertOptions;

/// Certificates within this window of expiry are renewed in the background.
const PROACTIVE_REFRESH_TIME: Duration = Duration::from_secs(7 * 24 * 3600);
/// Proactively managed domains renew even earlier.
const PROACTIVE_REFRESH_TIME_MANAGED: Duration = Duration::from_secs(14 * 24 * 3600);
/// Certificates expired longer than this are discarded rather than served.
const EXPIRY_GRACE: Duration = Duration::from_secs(60);
/// How often the proactive renewal loop runs.
const PROACTIVE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

const ACCOUNT_CREDENTIALS_FILE: &str = "acme-account.json";

type SharedIssuance = Shared<BoxFuture<'static, Result<CachedCertificate, String>>>;

struct PendingIssuance {
  generation: u64,
  future: SharedIssuance,
}

/// The per-process ACME client: one account, an in-memory + on-disk
/// certificate cache, coalesced issuance, and stateful HTTP-01 challenges.
pub struct AcmeClient {
  directory_url: String,
  eab_key: Option<Arc<ExternalAccountKey>>,
  cache_dir: Option<PathBuf>,
  proactive_domains: Vec<String>,
  account: OnceCell<Account>,
  certificates: Mutex<HashMap<String, CachedCertificate>>,
  pending_renewals: Mutex<HashMap<String, PendingIssuance>>,
  pending_challenges: Mutex<HashMap<String, String>>,
  generation_counter: AtomicU64,
  error_logger: ErrorLogger,
}

impl AcmeClient {
  pub async fn new(
    provider: AcmeProvider,
    eab_config: Option<(String, String)>,
    cache_dir: Option<PathBuf>,
    proactive_domains: Vec<String>,
    error_logger: ErrorLogger,
  ) -> Result<Arc<Self>, Box<dyn Error + Send + Sync>> {
    let eab_key = match eab_config {
      Some((kid, hmac_key)) => {
        let decoded_key = base64::engine::general_purpose::URL_SAFE_NO_PAD
          .decode(hmac_key.trim_end_matches('='))
          .map_err(|e| anyhow::anyhow!("Failed to decode EAB key HMAC: {e}"))?;
        Some(Arc::new(ExternalAccountKey::new(kid, &decoded_key)))
      }
      None => None,
    };

    let certificates = match &cache_dir {
      Some(directory) => load_cached_certificates(directory, &error_logger).await?,
      None => HashMap::new(),
    };

    Ok(Arc::new(Self {
      directory_url: provider.directory_url().to_string(),
      eab_key,
      cache_dir,
      proactive_domains,
      account: OnceCell::new(),
      certificates: Mutex::new(certificates),
      pending_renewals: Mutex::new(HashMap::new()),
      pending_challenges: Mutex::new(HashMap::new()),
      generation_counter: AtomicU64::new(1),
      error_logger,
    }))
  }

  async fn log_error(&self, message: String) {
    self.error_logger.log(&message).await;
  }

  fn refresh_window(&self, domain: &str) -> Duration {
    if self.proactive_domains.iter().any(|d| d == domain) {
      PROACTIVE_REFRESH_TIME_MANAGED
    } else {
      PROACTIVE_REFRESH_TIME
    }
  }

  /// Answers an HTTP-01 challenge request from the pending challenge map.
  pub fn challenge_response(&self, token: &str) -> Option<String> {
    self.pending_challenges.lock().expect("challenge map lock poisoned").get(token).cloned()
  }

  /// Synchronously peeks at the certificate cache without awaiting issuance.
  ///
  /// If the certificate is missing or near expiry, a background
  /// `get_certificate` is fired; the cached (possibly stale) certificate is
  /// returned regardless. This is the only path the TLS SNI callback uses.
  pub fn try_get_certificate_sync(self: &Arc<Self>, domain: &str, options: &CertOptions) -> Option<CachedCertificate> {
    let cache_key = calculate_cert_cache_key(domain, options);
    let cached = self
      .certificates
      .lock()
      .expect("certificate cache lock poisoned")
      .get(&cache_key)
      .cloned();

    let near_expiry = cached
      .as_ref()
      .map(|c| c.remaining_lifetime_ms() < self.refresh_window(domain).as_millis() as i64)
      .unwrap_or(true);
    if near_expiry {
      let client = self.clone();
      let domain = domain.to_string();
      let options = options.clone();
      tokio::spawn(async move {
        if let Err(error) = client.get_certificate(&domain, &options, false).await {
          client.log_error(format!("Background certificate issuance for {domain} failed: {error}")).await;
        }
      });
    }

    cached
  }

  /// Peeks the cache for a certificate with the exact options, regardless of
  /// freshness. Used to prefer genuinely expired or revoked ACME certificates
  /// over locally minted stand-ins.
  pub fn peek_cached(&self, domain: &str, options: &CertOptions) -> Option<CachedCertificate> {
    let cache_key = calculate_cert_cache_key(domain, options);
    self.certificates.lock().expect("certificate cache lock poisoned").get(&cache_key).cloned()
  }

  /// Obtains a certificate, coalescing concurrent requests for the same
  /// cache key into a single ACME order.
  pub fn get_certificate(
    self: &Arc<Self>,
    domain: &str,
    options: &CertOptions,
    force_regenerate: bool,
  ) -> BoxFuture<'static, Result<CachedCertificate, Box<dyn Error + Send + Sync>>> {
    let client = self.clone();
    let domain = domain.to_string();
    let options = options.clone();
    Box::pin(async move { client.get_certificate_with_retries(domain, options, force_regenerate, 1).await })
  }

  fn get_certificate_with_retries(
    self: Arc<Self>,
    domain: String,
    options: CertOptions,
    force_regenerate: bool,
    retries_left: u8,
  ) -> BoxFuture<'static, Result<CachedCertificate, Box<dyn Error + Send + Sync>>> {
    Box::pin(async move {
      let cache_key = calculate_cert_cache_key(&domain, &options);

      if !force_regenerate {
        let cached = self
          .certificates
          .lock()
          .expect("certificate cache lock poisoned")
          .get(&cache_key)
          .cloned();
        if let Some(cached) = cached {
          let remaining = cached.remaining_lifetime_ms();
          if remaining < -(EXPIRY_GRACE.as_millis() as i64) && !options.expired {
            // Too stale to serve; drop it and start over
            self
              .certificates
              .lock()
              .expect("certificate cache lock poisoned")
              .remove(&cache_key);
            return self.get_certificate_with_retries(domain, options, false, retries_left).await;
          }
          if remaining < self.refresh_window(&domain).as_millis() as i64 {
            let has_pending = self
              .pending_renewals
              .lock()
              .expect("pending renewals lock poisoned")
              .contains_key(&cache_key);
            if !has_pending {
              let client = self.clone();
              let renew_domain = domain.clone();
              let renew_options = options.clone();
              tokio::spawn(async move {
                if let Err(error) = client
                  .clone()
                  .get_certificate_with_retries(renew_domain.clone(), renew_options, true, 0)
                  .await
                {
                  client
                    .log_error(format!("Proactive renewal for {renew_domain} failed: {error}"))
                    .await;
                }
              });
            }
          }
          return Ok(cached);
        }
      }

      // Join a pending issuance, or start one and take ownership of the slot
      let (owned_generation, future) = {
        let mut pending = self.pending_renewals.lock().expect("pending renewals lock poisoned");
        match pending.get(&cache_key) {
          Some(existing) if !force_regenerate => (None, existing.future.clone()),
          _ => {
            let generation = self.generation_counter.fetch_add(1, Ordering::Relaxed);
            let future = self
              .clone()
              .issue_certificate(domain.clone(), options.clone(), cache_key.clone())
              .boxed()
              .shared();
            pending.insert(
              cache_key.clone(),
              PendingIssuance {
                generation,
                future: future.clone(),
              },
            );
            (Some(generation), future)
          }
        }
      };

      let result = future.await;

      if let Some(generation) = owned_generation {
        let delegated = {
          let mut pending = self.pending_renewals.lock().expect("pending renewals lock poisoned");
          match pending.get(&cache_key) {
            Some(slot) if slot.generation == generation => {
              pending.remove(&cache_key);
              None
            }
            // Someone replaced the slot; their issuance is authoritative
            Some(slot) => Some(slot.future.clone()),
            None => None,
          }
        };
        if let Some(delegated) = delegated {
          return delegated.await.map_err(|e| anyhow::anyhow!(e).into());
        }

        match result {
          Ok(certificate) => {
            self
              .certificates
              .lock()
              .expect("certificate cache lock poisoned")
              .insert(cache_key.clone(), certificate.clone());
            if let Some(directory) = &self.cache_dir {
              if let Err(error) = store_cached_certificate(directory, &certificate).await {
                self.log_error(format!("Failed to persist certificate {cache_key}: {error}")).await;
              }
            }
            Ok(certificate)
          }
          Err(error) => {
            self.log_error(format!("Certificate issuance for {domain} failed: {error}")).await;
            if retries_left > 0 {
              self.get_certificate_with_retries(domain, options, true, retries_left - 1).await
            } else {
              Err(anyhow::anyhow!(error).into())
            }
          }
        }
      } else {
        result.map_err(|e| anyhow::anyhow!(e).into())
      }
    })
  }

  async fn account(&self) -> Result<Account, Box<dyn Error + Send + Sync>> {
    self
      .account
      .get_or_try_init(|| async {
        let account_builder = Account::builder_with_http(Box::new(HttpsClientForAcme::new(build_client_config()?)));

        let credentials_path = self.cache_dir.as_ref().map(|d| d.join(ACCOUNT_CREDENTIALS_FILE));
        if let Some(path) = &credentials_path {
          if let Ok(serialized) = tokio::fs::read(path).await {
            let credentials = serde_json::from_slice::<AccountCredentials>(&serialized)?;
            return Ok(account_builder.from_credentials(credentials).await?);
          }
        }

        let (account, credentials) = account_builder
          .create(
            &NewAccount {
              contact: &[],
              terms_of_service_agreed: true,
              only_return_existing: false,
            },
            self.directory_url.clone(),
            self.eab_key.as_deref(),
          )
          .await?;

        if let Some(path) = &credentials_path {
          if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap_or_default();
          }
          tokio::fs::write(path, serde_json::to_vec(&credentials)?).await?;
        }
        Ok(account)
      })
      .await
      .cloned()
  }

  /// Runs one full ACME order for the domain. Errors are strings so the
  /// future can be shared between coalesced callers.
  async fn issue_certificate(self: Arc<Self>, domain: String, options: CertOptions, cache_key: String) -> Result<CachedCertificate, String> {
    self.issue_certificate_inner(&domain, &options, &cache_key).await.map_err(|e| e.to_string())
  }

  async fn issue_certificate_inner(
    &self,
    domain: &str,
    options: &CertOptions,
    cache_key: &str,
  ) -> Result<CachedCertificate, Box<dyn Error + Send + Sync>> {
    if domain.starts_with("*.") {
      // DNS-01 would be required here, which needs a configured DNS backend
      Err(anyhow::anyhow!("Wildcard certificates are not supported without a DNS provider"))?;
    }

    let account = self.account().await?;
    let identifiers = vec![Identifier::Dns(domain.to_string())];
    let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

    let mut challenge_guard = ChallengeGuard::new(self);
    let mut authorizations = order.authorizations();
    while let Some(authorization) = authorizations.next().await {
      let mut authorization = authorization?;
      match authorization.status {
        AuthorizationStatus::Pending => {}
        AuthorizationStatus::Valid => continue,
        _ => Err(anyhow::anyhow!("Invalid ACME authorization status"))?,
      }

      let mut challenge = authorization
        .challenge(ChallengeType::Http01)
        .ok_or(anyhow::anyhow!("The ACME server doesn't support the HTTP-01 challenge"))?;

      let key_authorization = challenge.key_authorization();
      challenge_guard.install(challenge.token.clone(), key_authorization.as_str().to_string());
      challenge.set_ready().await?;
    }
    drop(authorizations);

    let order_status = order.poll_ready(&RetryPolicy::default()).await?;
    if order_status != OrderStatus::Ready {
      Err(anyhow::anyhow!("ACME order is not ready"))?;
    }

    let private_key_pem = order.finalize().await?;
    let certificate_chain_pem = order.poll_certificate(&RetryPolicy::default()).await?;
    drop(challenge_guard);

    if options.revoked {
      let leaf_der = rustls_pemfile::certs(&mut certificate_chain_pem.as_bytes())
        .next()
        .ok_or(anyhow::anyhow!("Issued certificate chain is empty"))??;
      account
        .revoke(&RevocationRequest {
          certificate: &leaf_der,
          reason: Some(RevocationReason::KeyCompromise),
        })
        .await?;
    }

    let expiry = certificate_chain_expiry_ms(&certificate_chain_pem)?;
    Ok(CachedCertificate {
      cache_key: cache_key.to_string(),
      domain: domain.to_string(),
      key: private_key_pem,
      cert: certificate_chain_pem,
      expiry,
    })
  }

  /// Refreshes the configured proactive domains now and then every 24 hours.
  pub fn start_proactive_renewals(self: &Arc<Self>) {
    if self.proactive_domains.is_empty() {
      return;
    }
    let client = self.clone();
    tokio::spawn(async move {
      loop {
        for domain in client.proactive_domains.clone() {
          if let Err(error) = client.get_certificate(&domain, &CertOptions::default(), false).await {
            client.log_error(format!("Proactive refresh for {domain} failed: {error}")).await;
          }
        }
        tokio::time::sleep(PROACTIVE_INTERVAL).await;
      }
    });
  }

  #[cfg(test)]
  fn insert_for_test(&self, certificate: CachedCertificate) {
    self
      .certificates
      .lock()
      .unwrap()
      .insert(certificate.cache_key.clone(), certificate);
  }
}

/// Keeps the pending challenge map consistent: tokens are installed during
/// issuance and always deleted when the order finishes, even on failure.
struct ChallengeGuard<'a> {
  client: &'a AcmeClient,
  tokens: Vec<String>,
}

impl<'a> ChallengeGuard<'a> {
  fn new(client: &'a AcmeClient) -> Self {
    Self {
      client,
      tokens: Vec::new(),
    }
  }

  fn install(&mut self, token: String, key_authorization: String) {
    self
      .client
      .pending_challenges
      .lock()
      .expect("challenge map lock poisoned")
      .insert(token.clone(), key_authorization);
    self.tokens.push(token);
  }
}

impl Drop for ChallengeGuard<'_> {
  fn drop(&mut self) {
    let mut challenges = self.client.pending_challenges.lock().expect("challenge map lock poisoned");
    for token in &self.tokens {
      challenges.remove(token);
    }
  }
}

/// Builds the rustls client configuration used for ACME directory traffic,
/// preferring the platform verifier with a webpki-roots fallback.
fn build_client_config() -> Result<ClientConfig, Box<dyn Error + Send + Sync>> {
  let config = match ClientConfig::builder().with_platform_verifier() {
    Ok(config) => config.with_no_client_auth(),
    Err(_) => ClientConfig::builder()
      .with_webpki_verifier(
        WebPkiServerVerifier::builder(Arc::new(rustls::RootCertStore {
          roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        }))
        .build()?,
      )
      .with_no_client_auth(),
  };
  Ok(config)
}

struct HttpsClientForAcme(HyperClient<hyper_rustls::HttpsConnector<HttpConnector>, BodyWrapper<Bytes>>);

impl HttpsClientForAcme {
  fn new(tls_config: ClientConfig) -> Self {
    Self(
      HyperClient::builder(TokioExecutor::new()).build(
        hyper_rustls::HttpsConnectorBuilder::new()
          .with_tls_config(tls_config)
          .https_or_http()
          .enable_http1()
          .enable_http2()
          .build(),
      ),
    )
  }
}

impl HttpClient for HttpsClientForAcme {
  fn request(
    &self,
    req: Request<BodyWrapper<Bytes>>,
  ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
    HttpClient::request(&self.0, req)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn test_client(proactive: Vec<String>) -> Arc<AcmeClient> {
    AcmeClient::new(AcmeProvider::LetsEncrypt, None, None, proactive, ErrorLogger::without_logger())
      .await
      .unwrap()
  }

  fn fresh_certificate(cache_key: &str, domain: &str, remaining: Duration) -> CachedCertificate {
    CachedCertificate {
      cache_key: cache_key.to_string(),
      domain: domain.to_string(),
      key: "key".to_string(),
      cert: "cert".to_string(),
      expiry: chrono::Utc::now().timestamp_millis() + remaining.as_millis() as i64,
    }
  }

  #[tokio::test]
  async fn test_challenge_responses_come_from_the_pending_map() {
    let client = test_client(Vec::new()).await;
    assert_eq!(client.challenge_response("unknown"), None);

    {
      let mut guard = ChallengeGuard::new(&client);
      guard.install("token-1".to_string(), "token-1.auth".to_string());
      assert_eq!(client.challenge_response("token-1"), Some("token-1.auth".to_string()));
    }
    // The guard deletes its tokens when the order finishes
    assert_eq!(client.challenge_response("token-1"), None);
  }

  #[tokio::test]
  async fn test_sync_peek_returns_fresh_certificates_without_spawning() {
    let client = test_client(Vec::new()).await;
    let certificate = fresh_certificate("fresh.test", "fresh.test", Duration::from_secs(30 * 24 * 3600));
    client.insert_for_test(certificate.clone());

    let peeked = client.try_get_certificate_sync("fresh.test", &CertOptions::default());
    assert_eq!(peeked, Some(certificate));
  }

  #[tokio::test]
  async fn test_sync_peek_returns_stale_certificates_while_renewing() {
    let client = test_client(Vec::new()).await;
    let certificate = fresh_certificate("stale.test", "stale.test", Duration::from_secs(3600));
    client.insert_for_test(certificate.clone());

    // Near expiry: the stale certificate is still returned immediately
    let peeked = client.try_get_certificate_sync("stale.test", &CertOptions::default());
    assert_eq!(peeked, Some(certificate));
  }

  #[tokio::test]
  async fn test_refresh_window_is_wider_for_proactive_domains() {
    let client = test_client(vec!["managed.test".to_string()]).await;
    assert_eq!(client.refresh_window("managed.test"), PROACTIVE_REFRESH_TIME_MANAGED);
    assert_eq!(client.refresh_window("other.test"), PROACTIVE_REFRESH_TIME);
  }

  #[tokio::test]
  async fn test_peek_cached_distinguishes_options() {
    let client = test_client(Vec::new()).await;
    let revoked_options = CertOptions {
      revoked: true,
      ..Default::default()
    };
    let certificate = fresh_certificate(
      &calculate_cert_cache_key("peek.test", &revoked_options),
      "peek.test",
      Duration::from_secs(30 * 24 * 3600),
    );
    client.insert_for_test(certificate.clone());

    assert_eq!(client.peek_cached("peek.test", &revoked_options), Some(certificate));
    assert_eq!(client.peek_cached("peek.test", &CertOptions::default()), None);
  }

  #[tokio::test]
  async fn test_concurrent_issuance_coalesces_to_one_future() {
    let client = test_client(Vec::new()).await;

    // Install a pending issuance and observe that a non-forcing caller joins
    // it instead of starting a second order
    let (tx, rx) = tokio::sync::oneshot::channel::<CachedCertificate>();
    let shared: SharedIssuance = async move { rx.await.map_err(|e| e.to_string()) }.boxed().shared();
    client.pending_renewals.lock().unwrap().insert(
      "coalesce.test".to_string(),
      PendingIssuance {
        generation: 9999,
        future: shared.clone(),
      },
    );

    let joined = {
      let pending = client.pending_renewals.lock().unwrap();
      pending.get("coalesce.test").unwrap().future.clone()
    };

    let expected = fresh_certificate("coalesce.test", "coalesce.test", Duration::from_secs(3600));
    tx.send(expected.clone()).unwrap();

    let (first, second) = tokio::join!(shared, joined);
    assert_eq!(first.unwrap(), expected);
    assert_eq!(second.unwrap(), expected);
  }

  #[tokio::test]
  async fn test_eab_requires_valid_base64() {
    let result = AcmeClient::new(
      AcmeProvider::ZeroSsl,
      Some(("kid-1".to_string(), "!!!not-base64!!!".to_string())),
      None,
      Vec::new(),
      ErrorLogger::without_logger(),
    )
    .await;
    assert!(result.is_err());
  }
}
