#![deny(missing_docs)]

//! # snare
//!
//! An intercepting ("man-in-the-middle") proxy engine for TCP-based
//! application protocols. `snare` terminates a client connection, inspects
//! or modifies the traffic, and originates a matching upstream connection
//! to the real server.
//!
//! - Plain TCP tunneling
//! - Transparent HTTP/1.x message inspection with body decoding
//! - On-the-fly TLS interception with dynamically minted leaf certificates
//! - WebSocket frame inspection, including permessage-deflate
//!
//! ## Running a proxy
//!
//! ```no_run
//! use snare::{ProxyConfig, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> snare::Result<()> {
//!   let proxy = ProxyServer::new(ProxyConfig::default()).await?;
//!   println!("install this CA: {}", proxy.ca_cert_path().display());
//!   proxy.run("127.0.0.1:8080").await
//! }
//! ```
//!
//! ## Observing traffic
//!
//! Register interceptors on the [`InterceptorHandler`] before starting the
//! server; each HTTP exchange, plaintext or intercepted TLS, passes
//! through the chain:
//!
//! ```no_run
//! # use snare::{LoggingInterceptor, ProxyConfig, ProxyServer};
//! # use std::sync::Arc;
//! # async fn run() -> snare::Result<()> {
//! let proxy = ProxyServer::new(ProxyConfig::default()).await?;
//! let handler = proxy.interceptor_handler();
//! handler
//!   .write()
//!   .await
//!   .add_request_interceptor(Arc::new(LoggingInterceptor));
//! proxy.run("127.0.0.1:8080").await
//! # }
//! ```

mod body;
mod ca;
mod connection;
mod connector;
mod cookies;
mod errors;
mod headers;
mod interceptor;
mod parser;
mod request;
mod response;
mod segment;
mod server;
mod services;
mod url;
/// WebSocket framing, extensions, and message reassembly
pub mod websocket;

pub use body::Body;
pub use ca::{CertificateAuthority, CertificateStore};
pub use connection::{ClientConnection, ConnectionFlow, ServerConnection};
pub use connector::{Connector, TlsVersion};
pub use cookies::Cookie;
pub use errors::{Error, ErrorCode, HttpCode, ProxyCode, Result, TlsCode, WebsocketCode};
pub use headers::{Header, HeaderMap};
pub use http::{Method, StatusCode, Version};
pub use interceptor::{
  InterceptorHandler, LoggingInterceptor, RequestInterceptor, ResponseInterceptor,
};
pub use parser::{BodyFraming, MessageReader};
pub use request::Request;
pub use response::Response;
pub use segment::BufferSegment;
pub use server::{ProxyConfig, ProxyServer};
pub use url::{Netloc, TargetForm, Url};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
