use std::error::Error;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::thread;

use hyper::Method;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::acme::AcmeClient;
use crate::cert_generator::CertGenerator;
use crate::classifier::{classify_connection, ConnectionInfo};
use crate::config::ServerOptions;
use crate::endpoints::anything::{AnythingEndpoint, UserAgentEndpoint};
use crate::endpoints::delay::DelayEndpoint;
use crate::endpoints::echo::EchoEndpoint;
use crate::endpoints::fingerprint::FingerprintEndpoint;
use crate::endpoints::ip::IpEndpoint;
use crate::endpoints::status::StatusEndpoint;
use crate::endpoints::ws::{WsCloseEndpoint, WsDelayEndpoint, WsEchoEndpoint, WsNoSubprotocolEndpoint, WsSubprotocolEndpoint};
use crate::endpoints::{HttpEndpoint, WsEndpoint};
use crate::local_ca::{process_ca, LocalCa, DEFAULT_KEY_BITS};
use crate::logging::{logging_event_loop, ErrorLogger, LogMessage};
use crate::secure_context::SecureContextCache;
use crate::util::proxy_protocol::{read_proxy_header, ProxyHeader};
use crate::util::rewind_stream::RewindStream;

/// Process-wide server state shared by every connection.
pub struct ServerState {
  pub options: Arc<ServerOptions>,
  pub error_logger: ErrorLogger,
  pub local_ca: Arc<LocalCa>,
  pub acme: Option<Arc<AcmeClient>>,
  pub cert_generator: CertGenerator,
  pub context_cache: SecureContextCache,
  pub http_endpoints: Vec<Box<dyn HttpEndpoint>>,
  pub ws_endpoints: Vec<Box<dyn WsEndpoint>>,
}

/// The ordered HTTP endpoint catalog; first match wins.
fn http_endpoint_catalog() -> Vec<Box<dyn HttpEndpoint>> {
  vec![
    Box::new(AnythingEndpoint::anything()),
    Box::new(AnythingEndpoint::for_method("/get", Method::GET, &["args", "headers", "origin", "url"])),
    Box::new(AnythingEndpoint::for_method(
      "/post",
      Method::POST,
      &["args", "data", "files", "form", "headers", "json", "origin", "url"],
    )),
    Box::new(AnythingEndpoint::for_method(
      "/put",
      Method::PUT,
      &["args", "data", "files", "form", "headers", "json", "origin", "url"],
    )),
    Box::new(AnythingEndpoint::for_method(
      "/patch",
      Method::PATCH,
      &["args", "data", "files", "form", "headers", "json", "origin", "url"],
    )),
    Box::new(AnythingEndpoint::for_method(
      "/delete",
      Method::DELETE,
      &["args", "data", "files", "form", "headers", "json", "origin", "url"],
    )),
    Box::new(AnythingEndpoint::headers_only()),
    Box::new(UserAgentEndpoint),
    Box::new(IpEndpoint),
    Box::new(FingerprintEndpoint),
    Box::new(StatusEndpoint),
    Box::new(DelayEndpoint),
    Box::new(EchoEndpoint),
  ]
}

/// The ordered WebSocket endpoint catalog.
fn ws_endpoint_catalog() -> Vec<Box<dyn WsEndpoint>> {
  vec![
    Box::new(WsEchoEndpoint),
    Box::new(WsSubprotocolEndpoint),
    Box::new(WsNoSubprotocolEndpoint),
    Box::new(WsDelayEndpoint),
    Box::new(WsCloseEndpoint),
  ]
}

/// Starts the server: builds the runtime, wires logging, initializes the
/// certificate machinery, binds every configured port, and serves until
/// interrupted.
pub fn start_server(options: Arc<ServerOptions>) -> Result<(), Box<dyn Error + Send + Sync>> {
  let available_parallelism = thread::available_parallelism()?.get();

  let server_runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(available_parallelism)
    .thread_name("server-pool")
    .enable_all()
    .build()?;

  let (logger, receive_log) = async_channel::bounded::<LogMessage>(10000);

  server_runtime.block_on(async {
    tokio::spawn(logging_event_loop(receive_log));
    let error_logger = ErrorLogger::new(logger.clone());

    // The TLS context factories rely on the process-default crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
      .install_default()
      .map_err(|_| anyhow::anyhow!("Cannot install the default crypto provider"))?;

    // The local CA must exist before the first TLS listener accepts
    let local_ca = process_ca(DEFAULT_KEY_BITS)?;

    let acme = match options.acme_provider {
      Some(provider) => {
        let client = AcmeClient::new(
          provider,
          options.eab_config.clone(),
          options.cert_cache_dir.clone(),
          options.proactive_cert_domains.clone(),
          error_logger.clone(),
        )
        .await?;
        client.start_proactive_renewals();
        Some(client)
      }
      None => None,
    };

    let state = Arc::new(ServerState {
      options: options.clone(),
      error_logger,
      local_ca: local_ca.clone(),
      acme: acme.clone(),
      cert_generator: CertGenerator::new(local_ca, acme, options.root_domain.clone()),
      context_cache: SecureContextCache::default(),
      http_endpoints: http_endpoint_catalog(),
      ws_endpoints: ws_endpoint_catalog(),
    });

    let shutdown = CancellationToken::new();
    for port in &options.ports {
      let listener = create_tcp_listener(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), *port))?;
      println!("Server is listening on port {port}...");
      let state = state.clone();
      let shutdown = shutdown.clone();
      tokio::spawn(async move {
        accept_loop(listener, state, shutdown).await;
      });
    }

    signal::ctrl_c().await?;
    shutdown.cancel();
    Ok::<(), Box<dyn Error + Send + Sync>>(())
  })?;

  server_runtime.shutdown_timeout(std::time::Duration::from_secs(10));
  Ok(())
}

fn create_tcp_listener(address: SocketAddr) -> Result<TcpListener, Box<dyn Error + Send + Sync>> {
  let listener_socket2 = socket2::Socket::new(
    if address.is_ipv6() {
      socket2::Domain::IPV6
    } else {
      socket2::Domain::IPV4
    },
    socket2::Type::STREAM,
    Some(socket2::Protocol::TCP),
  )?;

  listener_socket2.set_reuse_address(!cfg!(windows)).unwrap_or_default();
  if address.is_ipv6() {
    listener_socket2.set_only_v6(false).unwrap_or_default();
  }
  listener_socket2.set_nonblocking(true).unwrap_or_default();

  listener_socket2.bind(&address.into())?;
  listener_socket2.listen(-1)?;

  Ok(TcpListener::from_std(listener_socket2.into())?)
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, shutdown: CancellationToken) {
  loop {
    let accepted = tokio::select! {
      accepted = listener.accept() => accepted,
      _ = shutdown.cancelled() => return,
    };
    let (stream, remote_address) = match accepted {
      Ok(accepted) => accepted,
      Err(error) => {
        state.error_logger.log(&format!("Cannot accept a connection: {error}")).await;
        continue;
      }
    };

    let state = state.clone();
    tokio::spawn(async move {
      handle_accepted_connection(stream, remote_address, state).await;
    });
  }
}

async fn handle_accepted_connection(stream: TcpStream, remote_address: SocketAddr, state: Arc<ServerState>) {
  stream.set_nodelay(true).unwrap_or_default();
  let local_address = match stream.local_addr() {
    Ok(local_address) => local_address,
    Err(error) => {
      state
        .error_logger
        .log(&format!("Cannot obtain local address of the connection: {error}"))
        .await;
      return;
    }
  };

  let info = ConnectionInfo::new(remote_address, local_address);
  handle_connection_stream(Box::new(stream), info, state).await;
}

/// Runs one accepted byte stream: strips a PROXY protocol header when
/// configured, then hands the stream to the connection classifier.
async fn handle_connection_stream(
  mut stream: Box<dyn crate::util::rewind_stream::RwStream>,
  mut info: ConnectionInfo,
  state: Arc<ServerState>,
) {
  if state.options.trust_proxy_protocol {
    let mut buffer = Vec::new();
    match read_proxy_header(&mut stream, &mut buffer).await {
      Ok(ProxyHeader::Stripped { source, .. }) => {
        info.proxy_source = source;
      }
      Ok(ProxyHeader::None) => {}
      Err(error) => {
        state.error_logger.log(&format!("Destroying connection: {error}")).await;
        return;
      }
    }
    if !buffer.is_empty() {
      stream = Box::new(RewindStream::new(bytes::Bytes::from(buffer), stream));
    }
  }

  classify_connection(stream, info, state).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn test_state() -> Arc<ServerState> {
    let options = Arc::new(crate::config::ServerOptions {
      root_domain: "testserver.host".to_string(),
      ports: vec![0],
      acme_provider: None,
      eab_config: None,
      proactive_cert_domains: Vec::new(),
      cert_cache_dir: None::<PathBuf>,
      trust_proxy_protocol: true,
      landing_url: "https://landing.example/".to_string(),
    });
    let (logger, _receiver) = async_channel::bounded(1000);
    let local_ca = crate::local_ca::tests::test_ca();
    Arc::new(ServerState {
      options: options.clone(),
      error_logger: ErrorLogger::new(logger),
      local_ca: local_ca.clone(),
      acme: None,
      cert_generator: CertGenerator::new(local_ca, None, options.root_domain.clone()),
      context_cache: crate::secure_context::SecureContextCache::default(),
      http_endpoints: http_endpoint_catalog(),
      ws_endpoints: ws_endpoint_catalog(),
    })
  }

  /// Drives one raw request through the classifier and the HTTP/1 server,
  /// returning the raw response bytes.
  async fn drive(state: Arc<ServerState>, request: &[u8]) -> Vec<u8> {
    let (mut client, server) = tokio::io::duplex(256 * 1024);
    let info = ConnectionInfo::new("203.0.113.9:40000".parse().unwrap(), "127.0.0.1:8080".parse().unwrap());
    let task = tokio::spawn(handle_connection_stream(Box::new(server), info, state));

    client.write_all(request).await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    task.await.unwrap();
    response
  }

  fn response_body(response: &[u8]) -> &[u8] {
    let head_end = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    &response[head_end + 4..]
  }

  fn status_line(response: &[u8]) -> String {
    let line_end = response.windows(2).position(|w| w == b"\r\n").unwrap();
    String::from_utf8_lossy(&response[..line_end]).to_string()
  }

  #[tokio::test]
  async fn test_http1_anything_reflection_end_to_end() {
    let request = b"PUT /anything?a=b&a=c&x=y HTTP/1.1\r\n\
host: testserver.host\r\n\
content-type: text/plain;charset=UTF-8\r\n\
test-HEADER: abc\r\n\
content-length: 17\r\n\
connection: close\r\n\
\r\n\
{\"hello\":\"world\"}";
    let response = drive(test_state(), request).await;

    assert_eq!(status_line(&response), "HTTP/1.1 200 OK");
    let value: serde_json::Value = serde_json::from_slice(response_body(&response)).unwrap();
    assert_eq!(value["args"]["a"], serde_json::json!(["b", "c"]));
    assert_eq!(value["args"]["x"], serde_json::json!("y"));
    assert_eq!(value["data"], serde_json::json!("{\"hello\":\"world\"}"));
    assert_eq!(value["form"], serde_json::json!({}));
    assert_eq!(value["files"], serde_json::json!({}));
    assert_eq!(value["json"], serde_json::json!({"hello": "world"}));
    assert_eq!(value["method"], serde_json::json!("PUT"));
    assert_eq!(value["headers"]["Test-Header"], serde_json::json!("abc"));
    assert_eq!(value["origin"], serde_json::json!("203.0.113.9"));
  }

  #[tokio::test]
  async fn test_http1_echo_returns_the_raw_request() {
    let request = b"GET /echo HTTP/1.1\r\nhost: testserver.host\r\nconnection: close\r\n\r\n";
    let response = drive(test_state(), request).await;

    assert_eq!(status_line(&response), "HTTP/1.1 200 OK");
    let body = response_body(&response);
    assert_eq!(body, &request[..]);
  }

  #[tokio::test]
  async fn test_proxy_header_source_reaches_the_ip_endpoint() {
    let mut request = b"PROXY TCP4 203.0.113.99 10.0.0.1 22222 443\r\n".to_vec();
    request.extend_from_slice(b"GET /ip HTTP/1.1\r\nhost: testserver.host\r\nconnection: close\r\n\r\n");
    let response = drive(test_state(), &request).await;

    let value: serde_json::Value = serde_json::from_slice(response_body(&response)).unwrap();
    assert_eq!(value["origin"], serde_json::json!("203.0.113.99"));
  }

  #[tokio::test]
  async fn test_bad_status_parameter_is_400_not_404() {
    let request = b"GET /status/teapot HTTP/1.1\r\nhost: testserver.host\r\nconnection: close\r\n\r\n";
    let response = drive(test_state(), request).await;
    assert_eq!(status_line(&response), "HTTP/1.1 400 Bad Request");
  }

  #[tokio::test]
  async fn test_unknown_path_is_404_naming_the_path() {
    let request = b"GET /definitely-missing HTTP/1.1\r\nhost: testserver.host\r\nconnection: close\r\n\r\n";
    let response = drive(test_state(), request).await;
    assert_eq!(status_line(&response), "HTTP/1.1 404 Not Found");
    assert!(String::from_utf8_lossy(response_body(&response)).contains("/definitely-missing"));
  }

  #[tokio::test]
  async fn test_delay_chains_to_status() {
    let request = b"GET /delay/0/status/503 HTTP/1.1\r\nhost: testserver.host\r\nconnection: close\r\n\r\n";
    let response = drive(test_state(), request).await;
    assert_eq!(status_line(&response), "HTTP/1.1 503 Service Unavailable");
  }

  #[tokio::test]
  async fn test_landing_redirect_on_bare_domain() {
    let request = b"GET / HTTP/1.1\r\nhost: testserver.host\r\nconnection: close\r\n\r\n";
    let response = drive(test_state(), request).await;
    assert_eq!(status_line(&response), "HTTP/1.1 307 Temporary Redirect");
    assert!(String::from_utf8_lossy(&response).contains("location: https://landing.example/"));
  }

  #[tokio::test]
  async fn test_cors_headers_are_applied() {
    let request = b"GET /ip HTTP/1.1\r\nhost: testserver.host\r\norigin: https://client.example\r\nconnection: close\r\n\r\n";
    let response = drive(test_state(), request).await;
    let text = String::from_utf8_lossy(&response).to_ascii_lowercase();
    assert!(text.contains("access-control-allow-origin: https://client.example"));
    assert!(text.contains("access-control-allow-credentials: true"));
  }

  #[tokio::test]
  async fn test_garbage_connections_are_destroyed_silently() {
    let response = drive(test_state(), b"\x00\x01\x02\x03garbage").await;
    assert!(response.is_empty());
  }

  #[tokio::test]
  async fn test_websocket_subprotocol_forcing_end_to_end() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    let state = test_state();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let info = ConnectionInfo::new("203.0.113.9:40000".parse().unwrap(), "127.0.0.1:8080".parse().unwrap());
    tokio::spawn(classify_connection(Box::new(server), info, state));

    let mut request = "ws://testserver.host/ws/subprotocol/mqtt/echo".into_client_request().unwrap();
    // "other" comes first; without forcing, default negotiation would pick it
    request
      .headers_mut()
      .insert("sec-websocket-protocol", "other, mqtt".parse().unwrap());

    let (mut socket, response) = tokio_tungstenite::client_async(request, client).await.unwrap();
    assert_eq!(
      response.headers().get("sec-websocket-protocol").map(|v| v.to_str().unwrap()),
      Some("mqtt")
    );

    // The chained echo endpoint still runs after the subprotocol endpoint
    socket.send(Message::Text("ping".into())).await.unwrap();
    match socket.next().await.unwrap().unwrap() {
      Message::Text(text) => assert_eq!(text.as_str(), "ping"),
      other => panic!("expected an echoed text frame, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_websocket_no_subprotocol_omits_the_header() {
    let state = test_state();
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let info = ConnectionInfo::new("203.0.113.9:40000".parse().unwrap(), "127.0.0.1:8080".parse().unwrap());
    tokio::spawn(classify_connection(Box::new(server), info, state));

    // A raw handshake, because WebSocket client libraries refuse upgrades
    // whose subprotocol handling deviates like this on purpose
    let request = b"GET /ws/no-subprotocol HTTP/1.1\r\n\
host: testserver.host\r\n\
connection: upgrade\r\n\
upgrade: websocket\r\n\
sec-websocket-version: 13\r\n\
sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
sec-websocket-protocol: chat\r\n\
\r\n";
    client.write_all(request).await.unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
      let read = client.read(&mut chunk).await.unwrap();
      assert!(read > 0, "connection closed before the upgrade response");
      response.extend_from_slice(&chunk[..read]);
    }

    let text = String::from_utf8_lossy(&response).to_ascii_lowercase();
    assert!(text.starts_with("http/1.1 101"));
    assert!(!text.contains("sec-websocket-protocol"));
  }
}
