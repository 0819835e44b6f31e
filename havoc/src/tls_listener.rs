use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_rustls::LazyConfigAcceptor;

use crate::cert_cache::calculate_cert_cache_key;
use crate::classifier::{classify_connection, ConnectionInfo};
use crate::ocsp::ocsp_response_for;
use crate::secure_context::{build_server_config, context_cache_key};
use crate::server::ServerState;
use crate::sni::compile_sni;
use crate::util::client_hello::{fingerprint_client_hello, required_record_length};
use crate::util::rewind_stream::{BoxedRwStream, RewindStream};

/// The most ClientHello we are willing to buffer before the handshake.
const MAX_CLIENT_HELLO: usize = 65536;

/// Accepts a TLS connection: fingerprints the ClientHello, compiles the SNI
/// into a per-connection server context, staples an OCSP response, and hands
/// the decrypted stream back to the connection classifier.
pub async fn handle_tls_connection(mut stream: BoxedRwStream, mut info: ConnectionInfo, state: Arc<ServerState>) {
  // Peek the whole first record so the hello can be fingerprinted before
  // rustls consumes it
  let mut peeked: Vec<u8> = Vec::new();
  loop {
    match required_record_length(&peeked) {
      Some(required) if peeked.len() >= required => break,
      _ if peeked.len() >= MAX_CLIENT_HELLO => break,
      _ => {
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
          Ok(0) | Err(_) => return,
          Ok(read) => peeked.extend_from_slice(&chunk[..read]),
        }
      }
    }
  }

  // Fingerprinting failures are non-fatal
  info.fingerprint = fingerprint_client_hello(&peeked);

  let rewound = RewindStream::new(Bytes::from(peeked), stream);
  let start_handshake = match LazyConfigAcceptor::new(rustls::server::Acceptor::default(), rewound).await {
    Ok(start_handshake) => start_handshake,
    Err(error) => {
      state.error_logger.log(&format!("Error during TLS handshake: {error}")).await;
      return;
    }
  };

  let client_hello = start_handshake.client_hello();
  let sni = client_hello
    .server_name()
    .map(String::from)
    .unwrap_or_else(|| state.options.root_domain.clone());

  let compiled = match compile_sni(&sni, &state.options.root_domain) {
    Ok(compiled) => compiled,
    Err(error) => {
      state.error_logger.log(&format!("Rejecting TLS handshake for \"{sni}\": {error}")).await;
      return;
    }
  };

  let certificate_domain = compiled.certificate_domain(&state.options.root_domain);
  let alpn = compiled.effective_alpn();
  let cert_cache_key = calculate_cert_cache_key(&certificate_domain, &compiled.cert_options);
  let context_key = context_cache_key(&cert_cache_key, &compiled.tls_options, &alpn);

  let config = state.context_cache.get_or_build(&context_key, || {
    let certificate = state.cert_generator.generate(&certificate_domain, &compiled.cert_options)?;
    // Stapling failures degrade to an unstapled handshake
    let ocsp_staple = leaf_der(&certificate.chain_pem).and_then(|der| ocsp_response_for(&state.local_ca, &der).ok());
    let config = build_server_config(&certificate, &compiled.tls_options, &alpn, ocsp_staple)?;
    Ok((config, certificate.expiry_ms))
  });

  let config = match config {
    Ok(config) => config,
    Err(error) => {
      state.error_logger.log(&format!("Cannot build a TLS context for \"{sni}\": {error}")).await;
      return;
    }
  };

  let tls_stream = match start_handshake.into_stream(config).await {
    Ok(tls_stream) => tls_stream,
    Err(error) => {
      state.error_logger.log(&format!("Error during TLS handshake: {error}")).await;
      return;
    }
  };

  info.encrypted = true;
  info.alpn = tls_stream
    .get_ref()
    .1
    .alpn_protocol()
    .map(|protocol| String::from_utf8_lossy(protocol).to_string());

  // The decrypted stream re-enters classification for HTTP/1, HTTP/2, or
  // even nested TLS
  classify_connection(Box::new(tls_stream), info, state).await;
}

fn leaf_der(chain_pem: &str) -> Option<Vec<u8>> {
  rustls_pemfile::certs(&mut chain_pem.as_bytes())
    .next()
    .and_then(|result| result.ok())
    .map(|der| der.as_ref().to_vec())
}
