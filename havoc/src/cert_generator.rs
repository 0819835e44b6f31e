use std::error::Error;
use std::sync::Arc;

use crate::acme::AcmeClient;
use crate::local_ca::{GeneratedCertificate, LocalCa};
use crate::sni::{CertOptions, CertType};

/// A certificate resolved for a TLS handshake: private key, full chain, and
/// the expiry that bounds how long derived TLS contexts may be cached.
#[derive(Debug, Clone)]
pub struct ResolvedCertificate {
  pub key_pem: String,
  pub chain_pem: String,
  pub expiry_ms: i64,
}

impl ResolvedCertificate {
  fn from_local(generated: GeneratedCertificate) -> Self {
    let mut chain_pem = generated.cert_pem;
    if let Some(ca_pem) = generated.ca_pem {
      chain_pem.push_str(&ca_pem);
    }
    Self {
      key_pem: generated.key_pem,
      chain_pem,
      expiry_ms: generated.expiry_ms,
    }
  }
}

/// Decides where each certificate comes from: the ACME client when a trusted
/// certificate is possible, the local CA otherwise. TLS must always succeed,
/// so every ACME path falls back to a locally minted leaf.
pub struct CertGenerator {
  local_ca: Arc<LocalCa>,
  acme: Option<Arc<AcmeClient>>,
  root_domain: String,
}

impl CertGenerator {
  pub fn new(local_ca: Arc<LocalCa>, acme: Option<Arc<AcmeClient>>, root_domain: String) -> Self {
    Self {
      local_ca,
      acme,
      root_domain,
    }
  }

  pub fn generate(&self, domain: &str, options: &CertOptions) -> Result<ResolvedCertificate, Box<dyn Error + Send + Sync>> {
    if options.self_signed || options.required_type == Some(CertType::Local) {
      return Ok(ResolvedCertificate::from_local(self.local_ca.generate_leaf(domain, options)?));
    }

    if options.expired {
      // A trusted certificate that has genuinely aged out beats a minted one
      if let Some(acme) = &self.acme {
        let plain = CertOptions::default();
        if let Some(cached) = acme.peek_cached(domain, &plain) {
          if cached.remaining_lifetime_ms() < 0 {
            return Ok(ResolvedCertificate {
              key_pem: cached.key,
              chain_pem: cached.cert,
              expiry_ms: cached.expiry,
            });
          }
        }
      }
      return Ok(ResolvedCertificate::from_local(self.local_ca.generate_leaf(domain, options)?));
    }

    if options.revoked {
      // Revocation is requested at ACME issuance time; until a revoked
      // certificate lands in the cache, a normal certificate stands in,
      // with revocation still reported via OCSP
      if let Some(acme) = &self.acme {
        if let Some(cached) = acme.try_get_certificate_sync(domain, options) {
          return Ok(ResolvedCertificate {
            key_pem: cached.key,
            chain_pem: cached.cert,
            expiry_ms: cached.expiry,
          });
        }
      }
      return Ok(ResolvedCertificate::from_local(self.local_ca.generate_leaf(domain, options)?));
    }

    if domain.ends_with(&self.root_domain) {
      if let Some(acme) = &self.acme {
        if let Some(cached) = acme.try_get_certificate_sync(domain, options) {
          return Ok(ResolvedCertificate {
            key_pem: cached.key,
            chain_pem: cached.cert,
            expiry_ms: cached.expiry,
          });
        }
      }
    }

    Ok(ResolvedCertificate::from_local(self.local_ca.generate_leaf(domain, options)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::local_ca::tests::test_ca;

  fn generator() -> CertGenerator {
    CertGenerator::new(test_ca(), None, "testserver.host".to_string())
  }

  #[test]
  fn test_self_signed_uses_local_ca_without_chain() {
    let resolved = generator()
      .generate(
        "self-signed.testserver.host",
        &CertOptions {
          self_signed: true,
          ..Default::default()
        },
      )
      .unwrap();
    // Self-signed leaves carry exactly one certificate
    assert_eq!(resolved.chain_pem.matches("BEGIN CERTIFICATE").count(), 1);
  }

  #[test]
  fn test_local_chain_includes_the_ca() {
    let resolved = generator().generate("chained.testserver.host", &CertOptions::default()).unwrap();
    assert_eq!(resolved.chain_pem.matches("BEGIN CERTIFICATE").count(), 2);
  }

  #[test]
  fn test_expired_without_acme_falls_back_to_local_expired_leaf() {
    let resolved = generator()
      .generate(
        "expired.testserver.host",
        &CertOptions {
          expired: true,
          ..Default::default()
        },
      )
      .unwrap();
    assert!(resolved.expiry_ms < chrono::Utc::now().timestamp_millis());
  }

  #[test]
  fn test_off_root_domains_use_the_local_ca() {
    let resolved = generator().generate("unrelated.example", &CertOptions::default()).unwrap();
    assert!(resolved.expiry_ms > chrono::Utc::now().timestamp_millis());
  }
}
