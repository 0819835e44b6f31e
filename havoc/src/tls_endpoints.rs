use crate::sni::{CertOptions, CertType, TlsOptions, TlsVersion};

/// A TLS endpoint descriptor, keyed by a single SNI modifier label.
///
/// Each descriptor is a record of three optional capability hooks; folding a
/// compiled SNI applies them left-to-right, and a `None` hook leaves that part
/// of the state untouched.
pub struct TlsEndpoint {
  pub sni_part: &'static str,
  pub configure_cert_options: Option<fn(&mut CertOptions)>,
  pub configure_tls_options: Option<fn(TlsOptions) -> Result<TlsOptions, String>>,
  pub configure_alpn_preferences: Option<fn(Vec<String>) -> Vec<String>>,
}

const fn cert_only(sni_part: &'static str, configure: fn(&mut CertOptions)) -> TlsEndpoint {
  TlsEndpoint {
    sni_part,
    configure_cert_options: Some(configure),
    configure_tls_options: None,
    configure_alpn_preferences: None,
  }
}

const fn tls_only(sni_part: &'static str, configure: fn(TlsOptions) -> Result<TlsOptions, String>) -> TlsEndpoint {
  TlsEndpoint {
    sni_part,
    configure_cert_options: None,
    configure_tls_options: Some(configure),
    configure_alpn_preferences: None,
  }
}

const fn alpn_only(sni_part: &'static str, configure: fn(Vec<String>) -> Vec<String>) -> TlsEndpoint {
  TlsEndpoint {
    sni_part,
    configure_cert_options: None,
    configure_tls_options: None,
    configure_alpn_preferences: Some(configure),
  }
}

impl TlsEndpoint {
  const fn passthrough(sni_part: &'static str) -> Self {
    TlsEndpoint {
      sni_part,
      configure_cert_options: None,
      configure_tls_options: None,
      configure_alpn_preferences: None,
    }
  }
}

fn enable(mut options: TlsOptions, version: TlsVersion) -> TlsOptions {
  options.enable_version(version);
  options
}

fn push_protocol(mut preferences: Vec<String>, protocol: &str) -> Vec<String> {
  if !preferences.iter().any(|p| p == protocol) {
    preferences.push(protocol.to_string());
  }
  preferences
}

/// The static TLS endpoint catalog.
pub static TLS_ENDPOINTS: &[TlsEndpoint] = &[
  cert_only("expired", |options| options.expired = true),
  cert_only("revoked", |options| options.revoked = true),
  cert_only("self-signed", |options| {
    options.self_signed = true;
  }),
  cert_only("untrusted-root", |options| {
    options.required_type = Some(CertType::Local);
  }),
  cert_only("wrong-host", |options| {
    // Serve a certificate for an unrelated name under the root domain
    options.override_prefix = Some("not-the-requested-host".to_string());
    options.required_type = Some(CertType::Local);
  }),
  cert_only("acme", |options| {
    options.required_type = Some(CertType::Acme);
  }),
  tls_only("no-tls", |_| Err("TLS deliberately rejected for no-tls".to_string())),
  tls_only("tls-v1-0", |options| Ok(enable(options, TlsVersion::V1_0))),
  tls_only("tls-v1-1", |options| Ok(enable(options, TlsVersion::V1_1))),
  tls_only("tls-v1-2", |options| Ok(enable(options, TlsVersion::V1_2))),
  tls_only("tls-v1-3", |options| Ok(enable(options, TlsVersion::V1_3))),
  alpn_only("http1", |preferences| push_protocol(preferences, "http/1.1")),
  alpn_only("http2", |preferences| push_protocol(preferences, "h2")),
  // Plain identities with default behavior
  TlsEndpoint::passthrough("example"),
  TlsEndpoint::passthrough("localhost"),
  TlsEndpoint::passthrough("www"),
];

/// Looks up a TLS endpoint descriptor by its SNI label.
pub fn find_tls_endpoint(sni_part: &str) -> Option<&'static TlsEndpoint> {
  TLS_ENDPOINTS.iter().find(|endpoint| endpoint.sni_part == sni_part)
}
