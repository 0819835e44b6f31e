// Import the server module from "server.rs"
#[path = "server.rs"]
mod server;

// Import the request handling modules
#[path = "request_handler.rs"]
mod request_handler;
#[path = "websocket_handler.rs"]
mod websocket_handler;

// Import the connection-level modules
#[path = "classifier.rs"]
mod classifier;
#[path = "tls_listener.rs"]
mod tls_listener;

// Import the certificate machinery
#[path = "acme.rs"]
mod acme;
#[path = "cert_cache.rs"]
mod cert_cache;
#[path = "cert_generator.rs"]
mod cert_generator;
#[path = "local_ca.rs"]
mod local_ca;
#[path = "ocsp.rs"]
mod ocsp;
#[path = "secure_context.rs"]
mod secure_context;

// Import the SNI compiler and its endpoint catalog
#[path = "sni.rs"]
mod sni;
#[path = "tls_endpoints.rs"]
mod tls_endpoints;

// Import the remaining top-level modules
#[path = "config.rs"]
mod config;
#[path = "logging.rs"]
mod logging;

// Import the endpoint modules from the "endpoints" directory
#[path = "endpoints/mod.rs"]
mod endpoints;

// Import utility modules from the "util" directory
#[path = "util"]
mod util {
  pub mod capture_stream;
  pub mod client_hello;
  pub mod der;
  pub mod frame_tap;
  pub mod lru_ttl_cache;
  pub mod proxy_protocol;
  pub mod rewind_stream;
}

use clap::Parser;
use mimalloc::MiMalloc;

use crate::config::{Args, ServerOptions};
use crate::server::start_server;

// Set the global allocator to use mimalloc for performance optimization
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// Entry point of the application
fn main() {
  let args = Args::parse();
  let options = match ServerOptions::from_args(args) {
    Ok(options) => options,
    Err(err) => {
      eprintln!("FATAL ERROR: {err}");
      std::process::exit(1);
    }
  };
  if let Err(err) = start_server(options) {
    eprintln!("FATAL ERROR: {err}");
    std::process::exit(1);
  }
}
