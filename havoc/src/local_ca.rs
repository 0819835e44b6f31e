use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

use crate::cert_cache::calculate_cert_cache_key;
use crate::sni::CertOptions;
use crate::util::lru_ttl_cache::LruTtlCache;

/// The default process keypair length.
pub const DEFAULT_KEY_BITS: usize = 2048;
/// How long minted leaves stay in the per-process cache.
const LEAF_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const LEAF_CACHE_SIZE: usize = 1000;

/// certificatePolicies: policyIdentifier 2.23.140.1.2.1 (domain-validated)
const DOMAIN_VALIDATED_POLICY: &[u8] = &[0x30, 0x0a, 0x30, 0x08, 0x06, 0x06, 0x67, 0x81, 0x0c, 0x01, 0x02, 0x01];

/// The subject identity of the local root CA.
#[derive(Debug, Clone)]
pub struct CaIdentity {
  pub common_name: String,
  pub organization: String,
  pub country: String,
}

impl Default for CaIdentity {
  fn default() -> Self {
    Self {
      common_name: "Havoc Testing CA".to_string(),
      organization: "Havoc".to_string(),
      country: "XX".to_string(),
    }
  }
}

/// A certificate minted by the local CA (or self-signed with its key).
#[derive(Debug, Clone)]
pub struct GeneratedCertificate {
  pub key_pem: String,
  pub cert_pem: String,
  pub ca_pem: Option<String>,
  pub expiry_ms: i64,
}

/// A local certificate authority around the single long-lived process RSA
/// keypair. The same keypair signs the root, every leaf, and OCSP responses.
pub struct LocalCa {
  key_bits: usize,
  key_pair: KeyPair,
  key_pem: String,
  rsa_private_key: RsaPrivateKey,
  ca_params: CertificateParams,
  ca_cert_pem: String,
  ca_cert_der: Vec<u8>,
  leaf_cache: Mutex<LruTtlCache<String, GeneratedCertificate>>,
}

impl LocalCa {
  pub fn new(identity: CaIdentity, key_bits: usize) -> Result<Self, Box<dyn Error + Send + Sync>> {
    let rsa_private_key = RsaPrivateKey::new(&mut rand::thread_rng(), key_bits)?;
    let key_pem = rsa_private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let key_pair = KeyPair::from_pem(&key_pem)?;

    let mut ca_params = CertificateParams::default();
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CountryName, identity.country);
    distinguished_name.push(DnType::OrganizationName, identity.organization);
    distinguished_name.push(DnType::CommonName, identity.common_name);
    ca_params.distinguished_name = distinguished_name;
    ca_params.not_before = (SystemTime::now() - Duration::from_secs(24 * 3600)).into();
    ca_params.not_after = (SystemTime::now() + Duration::from_secs(365 * 24 * 3600)).into();
    ca_params.serial_number = Some(random_serial());
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::CrlSign,
    ];

    let ca_certificate = ca_params.clone().self_signed(&key_pair)?;

    Ok(Self {
      key_bits,
      key_pair,
      key_pem,
      rsa_private_key,
      ca_params,
      ca_cert_pem: ca_certificate.pem(),
      ca_cert_der: ca_certificate.der().to_vec(),
      leaf_cache: Mutex::new(LruTtlCache::new(LEAF_CACHE_SIZE)),
    })
  }

  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  pub fn ca_cert_der(&self) -> &[u8] {
    &self.ca_cert_der
  }

  /// Signs a message with the CA key, SHA-256 with PKCS#1 v1.5 padding.
  pub fn sign_with_ca_key(&self, message: &[u8]) -> Vec<u8> {
    use rsa::sha2::Sha256;
    use rsa::signature::{SignatureEncoding, Signer};
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.rsa_private_key.clone());
    signing_key.sign(message).to_vec()
  }

  /// Mints a leaf certificate for the domain under the given options,
  /// consulting the per-process leaf cache first.
  pub fn generate_leaf(&self, domain: &str, options: &CertOptions) -> Result<GeneratedCertificate, Box<dyn Error + Send + Sync>> {
    let cache_key = calculate_cert_cache_key(domain, options);
    if let Some(cached) = self.leaf_cache.lock().expect("leaf cache lock poisoned").get(&cache_key) {
      return Ok(cached);
    }

    let (effective_domain, is_wildcard) = rewrite_wildcard_domain(domain)?;

    let mut params = CertificateParams::new(vec![effective_domain.clone()])?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CountryName, "XX");
    if !is_wildcard {
      distinguished_name.push(DnType::CommonName, effective_domain.clone());
    }
    params.distinguished_name = distinguished_name;

    let (not_before, not_after) = if options.expired {
      (
        SystemTime::now() - Duration::from_secs(2 * 24 * 3600),
        SystemTime::now() - Duration::from_secs(24 * 3600),
      )
    } else {
      (
        SystemTime::now() - Duration::from_secs(24 * 3600),
        SystemTime::now() + Duration::from_secs(365 * 24 * 3600),
      )
    };
    params.not_before = not_before.into();
    params.not_after = not_after.into();
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    params
      .custom_extensions
      .push(CustomExtension::from_oid_content(&[2, 5, 29, 32], DOMAIN_VALIDATED_POLICY.to_vec()));
    params.use_authority_key_identifier_extension = !options.self_signed;

    let certificate = if options.self_signed {
      params.self_signed(&self.key_pair)?
    } else {
      let issuer = Issuer::from_params(&self.ca_params, &self.key_pair);
      params.signed_by(&self.key_pair, &issuer)?
    };

    let expiry_ms = not_after.duration_since(SystemTime::UNIX_EPOCH)?.as_millis() as i64;
    let generated = GeneratedCertificate {
      key_pem: self.key_pem.clone(),
      cert_pem: certificate.pem(),
      ca_pem: if options.self_signed {
        None
      } else {
        Some(self.ca_cert_pem.clone())
      },
      expiry_ms,
    };

    self
      .leaf_cache
      .lock()
      .expect("leaf cache lock poisoned")
      .insert(cache_key, generated.clone(), LEAF_CACHE_TTL);
    Ok(generated)
  }
}

fn random_serial_bytes() -> [u8; 16] {
  // 128 bits with a clear sign bit so the serial stays positive
  let mut serial = [0u8; 16];
  rand::thread_rng().fill_bytes(&mut serial);
  serial[0] &= 0x7f;
  serial
}

fn random_serial() -> SerialNumber {
  SerialNumber::from_slice(&random_serial_bytes())
}

/// Rewrites domains containing underscores (invalid in certificates) into
/// wildcard names by replacing the first label with `*`.
fn rewrite_wildcard_domain(domain: &str) -> Result<(String, bool), Box<dyn Error + Send + Sync>> {
  if !domain.contains('_') {
    return Ok((domain.to_string(), domain.starts_with("*.")));
  }
  let labels: Vec<&str> = domain.split('.').collect();
  if labels.len() <= 1 {
    Err(anyhow::anyhow!("Cannot generate a certificate for \"{domain}\""))?;
  }
  let remainder = labels[1..].join(".");
  if remainder.contains('_') {
    Err(anyhow::anyhow!("Cannot generate a certificate for \"{domain}\""))?;
  }
  Ok((format!("*.{remainder}"), true))
}

static PROCESS_CA: Mutex<Option<(usize, Arc<LocalCa>)>> = Mutex::new(None);

/// Returns the process-wide local CA, creating it on first use. The keypair
/// is regenerated only when a larger key length is requested.
pub fn process_ca(min_key_bits: usize) -> Result<Arc<LocalCa>, Box<dyn Error + Send + Sync>> {
  let mut slot = PROCESS_CA.lock().expect("process CA lock poisoned");
  if let Some((key_bits, ca)) = slot.as_ref() {
    if *key_bits >= min_key_bits {
      return Ok(ca.clone());
    }
  }
  let ca = Arc::new(LocalCa::new(CaIdentity::default(), min_key_bits)?);
  *slot = Some((ca.key_bits, ca.clone()));
  Ok(ca)
}
