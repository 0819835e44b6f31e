use serde::Serialize;

/// The certificate source a TLS endpoint may force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertType {
  Acme,
  Local,
}

/// Certificate options accumulated from the SNI's modifier labels.
/// Immutable once compilation finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CertOptions {
  pub expired: bool,
  pub revoked: bool,
  pub self_signed: bool,
  pub override_prefix: Option<String>,
  pub required_type: Option<CertType>,
}

/// The TLS protocol versions the server can be asked to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TlsVersion {
  V1_0,
  V1_1,
  V1_2,
  V1_3,
}

impl TlsVersion {
  pub const ALL: [TlsVersion; 4] = [TlsVersion::V1_0, TlsVersion::V1_1, TlsVersion::V1_2, TlsVersion::V1_3];

  fn bit(&self) -> u8 {
    match self {
      TlsVersion::V1_0 => 0b0001,
      TlsVersion::V1_1 => 0b0010,
      TlsVersion::V1_2 => 0b0100,
      TlsVersion::V1_3 => 0b1000,
    }
  }
}

/// TLS knobs accumulated left-to-right across the SNI's modifier labels.
///
/// Version selection uses a disable bitmask combined with a minimum version:
/// the first version label switches every version off, then each label clears
/// its own disable bit and lowers the minimum as needed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TlsOptions {
  pub disabled_versions: u8,
  pub min_version: Option<TlsVersion>,
  pub ciphers: Option<String>,
}

impl Default for TlsOptions {
  fn default() -> Self {
    Self {
      disabled_versions: 0,
      min_version: None,
      ciphers: None,
    }
  }
}

impl TlsOptions {
  /// Enables a single TLS version on top of the accumulated state.
  pub fn enable_version(&mut self, version: TlsVersion) {
    if self.min_version.is_none() {
      // First version label: start from "all versions disabled"
      self.disabled_versions = 0b1111;
    }
    self.disabled_versions &= !version.bit();
    let lowest_enabled = TlsVersion::ALL
      .iter()
      .copied()
      .find(|v| self.disabled_versions & v.bit() == 0);
    self.min_version = lowest_enabled;
    if version <= TlsVersion::V1_1 {
      let ciphers = self.ciphers.take().unwrap_or_else(|| "DEFAULT".to_string());
      self.ciphers = Some(format!("{ciphers}:@SECLEVEL=0"));
    }
  }

  /// The versions left enabled, in ascending order.
  pub fn enabled_versions(&self) -> Vec<TlsVersion> {
    TlsVersion::ALL
      .iter()
      .copied()
      .filter(|v| self.disabled_versions & v.bit() == 0)
      .collect()
  }
}

/// The result of compiling a structured SNI.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSni {
  /// The full SNI, used as the certificate domain unless overridden.
  pub domain: String,
  pub cert_options: CertOptions,
  pub tls_options: TlsOptions,
  pub alpn_preferences: Vec<String>,
}

impl CompiledSni {
  /// The domain the certificate should actually be minted for, after
  /// applying any override prefix from the modifier labels.
  pub fn certificate_domain(&self, root_domain: &str) -> String {
    match &self.cert_options.override_prefix {
      Some(prefix) => format!("{prefix}.{root_domain}"),
      None => self.domain.clone(),
    }
  }

  /// The ALPN preference list, falling back to the default protocols.
  pub fn effective_alpn(&self) -> Vec<String> {
    if self.alpn_preferences.is_empty() {
      vec!["http/1.1".to_string(), "h2".to_string()]
    } else {
      self.alpn_preferences.clone()
    }
  }
}

/// Errors produced by SNI compilation. Every variant fails the handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum SniError {
  TooManyParts(usize),
  RepeatedPart(String),
  UnknownPart(String),
  Rejected(String),
}

impl std::fmt::Display for SniError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SniError::TooManyParts(count) => write!(f, "Too many SNI parts ({count})"),
      SniError::RepeatedPart(part) => write!(f, "Repeated SNI part \"{part}\""),
      SniError::UnknownPart(part) => write!(f, "Unknown SNI part \"{part}\""),
      SniError::Rejected(reason) => write!(f, "{reason}"),
    }
  }
}

impl std::error::Error for SniError {}

/// Splits the SNI prefix into modifier labels. `.` and `--` are equivalent
/// separators, so `expired--http2.tls-v1-2` and `expired.http2.tls-v1-2`
/// compile identically.
fn split_labels(prefix: &str) -> Vec<&str> {
  if prefix.is_empty() {
    return Vec::new();
  }
  prefix.split('.').flat_map(|part| part.split("--")).collect()
}

/// Compiles a full SNI into certificate options, TLS options, and ALPN
/// preferences by resolving and folding its modifier labels in order.
pub fn compile_sni(sni: &str, root_domain: &str) -> Result<CompiledSni, SniError> {
  let sni = sni.strip_suffix('.').unwrap_or(sni);
  let prefix = if sni == root_domain {
    ""
  } else {
    match sni.strip_suffix(root_domain).and_then(|p| p.strip_suffix('.')) {
      Some(prefix) => prefix,
      None => sni,
    }
  };

  let labels = split_labels(prefix);
  if labels.len() > 3 {
    return Err(SniError::TooManyParts(labels.len()));
  }
  for (index, label) in labels.iter().enumerate() {
    if labels[..index].contains(label) {
      return Err(SniError::RepeatedPart(label.to_string()));
    }
  }

  let mut cert_options = CertOptions::default();
  let mut tls_options = TlsOptions::default();
  let mut alpn_preferences = Vec::new();

  for label in labels {
    let endpoint = crate::tls_endpoints::find_tls_endpoint(label)
      .ok_or_else(|| SniError::UnknownPart(label.to_string()))?;
    if let Some(configure) = endpoint.configure_cert_options {
      configure(&mut cert_options);
    }
    if let Some(configure) = endpoint.configure_tls_options {
      tls_options = configure(tls_options).map_err(SniError::Rejected)?;
    }
    if let Some(configure) = endpoint.configure_alpn_preferences {
      alpn_preferences = configure(alpn_preferences);
    }
  }

  Ok(CompiledSni {
    domain: sni.to_string(),
    cert_options,
    tls_options,
    alpn_preferences,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  const ROOT: &str = "testserver.host";

  #[test]
  fn test_bare_root_domain_compiles_to_defaults() {
    let compiled = compile_sni(ROOT, ROOT).unwrap();
    assert_eq!(compiled.cert_options, CertOptions::default());
    assert_eq!(compiled.tls_options, TlsOptions::default());
    assert_eq!(compiled.effective_alpn(), vec!["http/1.1", "h2"]);
    assert_eq!(compiled.certificate_domain(ROOT), ROOT);
  }

  #[test]
  fn test_dot_and_dash_separators_are_equivalent() {
    let dotted = compile_sni(&format!("expired.http2.{ROOT}"), ROOT).unwrap();
    let dashed = compile_sni(&format!("expired--http2.{ROOT}"), ROOT).unwrap();
    assert_eq!(dotted.cert_options, dashed.cert_options);
    assert_eq!(dotted.alpn_preferences, dashed.alpn_preferences);
    assert!(dotted.cert_options.expired);
    assert_eq!(dotted.alpn_preferences, vec!["h2"]);
  }

  #[test]
  fn test_three_labels_accepted_four_rejected() {
    assert!(compile_sni(&format!("expired--revoked--http2.{ROOT}"), ROOT).is_ok());
    assert_eq!(
      compile_sni(&format!("expired--revoked--self-signed--http2.{ROOT}"), ROOT),
      Err(SniError::TooManyParts(4))
    );
  }

  #[test]
  fn test_repeated_labels_rejected() {
    assert_eq!(
      compile_sni(&format!("expired--expired.{ROOT}"), ROOT),
      Err(SniError::RepeatedPart("expired".to_string()))
    );
  }

  #[test]
  fn test_unknown_labels_rejected() {
    assert_eq!(
      compile_sni(&format!("definitely-nonsense.{ROOT}"), ROOT),
      Err(SniError::UnknownPart("definitely-nonsense".to_string()))
    );
  }

  #[test]
  fn test_sni_outside_root_domain_uses_whole_name_as_prefix() {
    // "expired" alone is a valid single-label name
    let compiled = compile_sni("expired", ROOT).unwrap();
    assert!(compiled.cert_options.expired);
  }

  #[test]
  fn test_no_tls_rejects_the_handshake() {
    match compile_sni(&format!("no-tls.{ROOT}"), ROOT) {
      Err(SniError::Rejected(_)) => {}
      other => panic!("expected rejection, got {other:?}"),
    }
  }

  #[test]
  fn test_version_enabling_starts_from_all_disabled() {
    let compiled = compile_sni(&format!("tls-v1-2.{ROOT}"), ROOT).unwrap();
    assert_eq!(compiled.tls_options.enabled_versions(), vec![TlsVersion::V1_2]);
    assert_eq!(compiled.tls_options.min_version, Some(TlsVersion::V1_2));
    assert!(compiled.tls_options.ciphers.is_none());
  }

  #[test]
  fn test_version_enabling_ors_bits_left_to_right() {
    let compiled = compile_sni(&format!("tls-v1-2--tls-v1-3.{ROOT}"), ROOT).unwrap();
    assert_eq!(
      compiled.tls_options.enabled_versions(),
      vec![TlsVersion::V1_2, TlsVersion::V1_3]
    );
    assert_eq!(compiled.tls_options.min_version, Some(TlsVersion::V1_2));
  }

  #[test]
  fn test_legacy_versions_lower_the_security_level() {
    let compiled = compile_sni(&format!("tls-v1-0.{ROOT}"), ROOT).unwrap();
    assert_eq!(compiled.tls_options.min_version, Some(TlsVersion::V1_0));
    assert_eq!(compiled.tls_options.ciphers.as_deref(), Some("DEFAULT:@SECLEVEL=0"));
  }

  #[test]
  fn test_wrong_host_overrides_the_certificate_domain() {
    let compiled = compile_sni(&format!("wrong-host.{ROOT}"), ROOT).unwrap();
    let domain = compiled.certificate_domain(ROOT);
    assert_ne!(domain, compiled.domain);
    assert!(domain.ends_with(ROOT));
  }

  #[test]
  fn test_alpn_preferences_accumulate_in_label_order() {
    let compiled = compile_sni(&format!("http1--http2.{ROOT}"), ROOT).unwrap();
    assert_eq!(compiled.alpn_preferences, vec!["http/1.1", "h2"]);
    let reversed = compile_sni(&format!("http2--http1.{ROOT}"), ROOT).unwrap();
    assert_eq!(reversed.alpn_preferences, vec!["h2", "http/1.1"]);
  }

  #[test]
  fn test_tls_options_serialize_canonically() {
    let first = serde_json::to_string(&TlsOptions::default()).unwrap();
    let second = serde_json::to_string(&TlsOptions::default()).unwrap();
    assert_eq!(first, second);
  }
}
