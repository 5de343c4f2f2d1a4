//! Proxy error domain.
//!
//! Every failure in the engine belongs to exactly one of four categories:
//! `proxy` (configuration, resource, and platform errors), `http` (message
//! parsing and semantics), `tls` (handshakes, contexts, certificates), and
//! `websocket` (framing and protocol violations). Each category holds a
//! closed set of codes; the numeric [`ErrorCode`] encoding is derived from
//! the category/code pair, never the other way around.

use std::fmt;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `snare::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Number of bits reserved for each error category in an [`ErrorCode`].
const CATEGORY_BITS: u32 = 5;

const PROXY_CATEGORY: u32 = 0;
const HTTP_CATEGORY: u32 = 1;
const TLS_CATEGORY: u32 = 2;
const WEBSOCKET_CATEGORY: u32 = 3;

const fn category_mask(category: u32) -> u32 {
  ((1 << CATEGORY_BITS) - 1) << (category * CATEGORY_BITS)
}

/// The error that may occur anywhere in the proxy engine.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
  /// Configuration, resource, and platform errors
  #[error(transparent)]
  Proxy(#[from] ProxyCode),
  /// HTTP parsing and semantic errors
  #[error(transparent)]
  Http(#[from] HttpCode),
  /// TLS handshake, context, and certificate errors
  #[error(transparent)]
  Tls(#[from] TlsCode),
  /// WebSocket framing and protocol errors
  #[error(transparent)]
  Websocket(#[from] WebsocketCode),
}

impl Error {
  /// The numeric code of this error.
  pub fn code(&self) -> ErrorCode {
    let (category, index) = match self {
      Error::Proxy(c) => (PROXY_CATEGORY, c.index()),
      Error::Http(c) => (HTTP_CATEGORY, c.index()),
      Error::Tls(c) => (TLS_CATEGORY, c.index()),
      Error::Websocket(c) => (WEBSOCKET_CATEGORY, c.index()),
    };
    ErrorCode(index << (category * CATEGORY_BITS))
  }

  /// A short human-readable description of this error.
  pub fn message(&self) -> &'static str {
    match self {
      Error::Proxy(c) => c.message(),
      Error::Http(c) => c.message(),
      Error::Tls(c) => c.message(),
      Error::Websocket(c) => c.message(),
    }
  }

  /// Whether this is a `proxy`-category error.
  pub fn is_proxy(&self) -> bool {
    matches!(self, Error::Proxy(_))
  }

  /// Whether this is an `http`-category error.
  pub fn is_http(&self) -> bool {
    matches!(self, Error::Http(_))
  }

  /// Whether this is a `tls`-category error.
  pub fn is_tls(&self) -> bool {
    matches!(self, Error::Tls(_))
  }

  /// Whether this is a `websocket`-category error.
  pub fn is_websocket(&self) -> bool {
    matches!(self, Error::Websocket(_))
  }
}

impl From<std::io::Error> for Error {
  fn from(value: std::io::Error) -> Self {
    tracing::debug!("io error: {}", value);
    Error::Proxy(ProxyCode::Io)
  }
}

macro_rules! code_enum {
  (
    $(#[$outer:meta])*
    $name:ident {
      $($(#[$var_meta:meta])* $variant:ident = $index:literal => $msg:literal,)+
    }
  ) => {
    $(#[$outer])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum $name {
      $($(#[$var_meta])* $variant,)+
    }

    impl $name {
      /// All codes in this category.
      pub const ALL: &'static [$name] = &[$($name::$variant,)+];

      pub(crate) fn index(&self) -> u32 {
        match self {
          $($name::$variant => $index,)+
        }
      }

      /// A short human-readable description of this code.
      pub fn message(&self) -> &'static str {
        match self {
          $($name::$variant => $msg,)+
        }
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
      }
    }

    impl std::error::Error for $name {}
  };
}

code_enum! {
  /// Configuration, resource, and platform errors. Fatal to the acceptor or
  /// to the individual flow.
  ProxyCode {
    /// An option value was rejected
    InvalidOption = 1 => "invalid option",
    /// Dual-stack listener setup failed
    Ipv6Error = 2 => "IPv6 error",
    /// An operation was attempted in a state that forbids it
    InvalidOperation = 3 => "invalid operation",
    /// The accept loop failed
    AcceptorError = 4 => "acceptor error",
    /// An internal parser invariant was violated
    ParserError = 5 => "parser error",
    /// The upstream half of the flow is not connected
    ServerNotConnected = 6 => "server is not connected",
    /// A transport-level I/O error
    Io = 7 => "I/O error",
    /// The proxy refused to connect to itself
    SelfConnect = 8 => "proxy cannot connect to itself",
  }
}

code_enum! {
  /// HTTP parsing and semantic errors. A malformed request yields a
  /// synthesized 400; a malformed upstream response yields a 502.
  HttpCode {
    /// Request method outside the supported set
    InvalidMethod = 1 => "invalid HTTP method",
    /// Unparsable response status
    InvalidStatus = 2 => "invalid HTTP status",
    /// Version other than HTTP/1.0 or HTTP/1.1
    InvalidVersion = 3 => "invalid HTTP version",
    /// Request target host missing or malformed
    InvalidTargetHost = 4 => "invalid target host",
    /// Request target port missing or malformed
    InvalidTargetPort = 5 => "invalid target port",
    /// Malformed request line
    InvalidRequestLine = 6 => "invalid HTTP request line",
    /// Malformed header line
    InvalidHeader = 7 => "invalid HTTP header",
    /// A required header was absent
    HeaderNotFound = 8 => "header was not found",
    /// Content-Length not a valid size
    InvalidBodySize = 9 => "invalid HTTP body size",
    /// Declared body size exceeds the configured limit
    BodySizeTooLarge = 10 => "given body size exceeds limit",
    /// Malformed chunked-encoding body
    InvalidChunkedBody = 11 => "malformed chunked-encoding body",
    /// The exchange produced no response
    NoResponse = 12 => "HTTP exchange has no response",
    /// Malformed response status line
    InvalidResponseLine = 13 => "invalid HTTP response line",
    /// Response body ended before its declared length
    MalformedResponseBody = 14 => "malformed response body",
  }
}

code_enum! {
  /// TLS handshake, context, and certificate errors. Any failure aborts the
  /// flow; no leaf is minted or cached on failure.
  TlsCode {
    /// The peeked ClientHello could not be parsed
    InvalidClientHello = 1 => "invalid ClientHello message",
    /// Not enough data to satisfy a read
    ReadAccessViolation = 2 => "read access violation (not enough data)",
    /// Unexpected failure inside the TLS service
    TlsServiceError = 3 => "exception in TLS service",
    /// Malformed ALPN protocol list
    InvalidAlpnProtosList = 4 => "invalid ALPN protocol list",
    /// Failed to create and configure a TLS context
    TlsContextError = 5 => "failed to create and configure TLS context",
    /// Certificate generation failed
    CertificateCreationError = 6 => "an error occurred when generating a certificate",
    /// The certificate store could not be created or read
    CertificateStoreError = 7 => "an error occurred in the certificate store",
    /// Negotiated ALPN could not be found
    AlpnNotFound = 8 => "negotiated ALPN could not be found",
    /// The handshake toward the real server failed
    UpstreamHandshakeFailed = 9 => "upstream handshake failed",
    /// The handshake toward the client failed
    DownstreamHandshakeFailed = 10 => "downstream handshake failed",
    /// The TCP connection to the real server failed
    UpstreamConnectError = 11 => "could not connect to upstream server",
  }
}

code_enum! {
  /// WebSocket framing and protocol errors. The proxy answers with a close
  /// frame carrying an appropriate code, then closes.
  WebsocketCode {
    /// Reserved or unknown opcode
    InvalidOpcode = 1 => "invalid WebSocket opcode",
    /// A required extension parameter was absent
    ExtensionParamNotFound = 2 => "extension parameter was not found",
    /// Malformed Sec-WebSocket-Extensions value
    InvalidExtensionString = 3 => "invalid extension string",
    /// Frame violates RFC 6455 framing rules
    InvalidFrame = 4 => "invalid frame",
    /// Frame opcode is illegal in the current fragmentation state
    UnexpectedOpcode = 5 => "unexpected opcode",
    /// Frame could not be serialized
    SerializationError = 6 => "frame serialization error",
    /// permessage-deflate processing failed
    DeflateError = 7 => "deflate error",
    /// Frame or message exceeds the configured size limit
    PayloadTooLarge = 8 => "payload exceeds limit",
  }
}

/// The 32-bit numeric encoding of an [`Error`].
///
/// Each category owns a 5-bit field: `proxy` occupies bits 0..5, `http`
/// bits 5..10, `tls` bits 10..15, `websocket` bits 15..20. The value of a
/// code is its in-category index shifted into the category's field, so
/// distinct categories never alias and `success` is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
  /// The non-error value.
  pub const SUCCESS: ErrorCode = ErrorCode(0);

  /// The raw 32-bit value.
  pub fn value(self) -> u32 {
    self.0
  }

  /// Whether this code is [`ErrorCode::SUCCESS`].
  pub fn is_success(self) -> bool {
    self.0 == 0
  }

  /// Whether this code belongs to the `proxy` category.
  pub fn is_proxy(self) -> bool {
    self.0 & category_mask(PROXY_CATEGORY) != 0
  }

  /// Whether this code belongs to the `http` category.
  pub fn is_http(self) -> bool {
    self.0 & category_mask(HTTP_CATEGORY) != 0
  }

  /// Whether this code belongs to the `tls` category.
  pub fn is_tls(self) -> bool {
    self.0 & category_mask(TLS_CATEGORY) != 0
  }

  /// Whether this code belongs to the `websocket` category.
  pub fn is_websocket(self) -> bool {
    self.0 & category_mask(WEBSOCKET_CATEGORY) != 0
  }

  /// Recovers the typed error this code encodes, if it is a defined code.
  pub fn decode(self) -> Option<Error> {
    if self.is_proxy() {
      let index = self.0 >> (PROXY_CATEGORY * CATEGORY_BITS);
      ProxyCode::ALL
        .iter()
        .find(|c| c.index() == index)
        .map(|c| Error::Proxy(*c))
    } else if self.is_http() {
      let index = self.0 >> (HTTP_CATEGORY * CATEGORY_BITS);
      HttpCode::ALL
        .iter()
        .find(|c| c.index() == index)
        .map(|c| Error::Http(*c))
    } else if self.is_tls() {
      let index = self.0 >> (TLS_CATEGORY * CATEGORY_BITS);
      TlsCode::ALL
        .iter()
        .find(|c| c.index() == index)
        .map(|c| Error::Tls(*c))
    } else if self.is_websocket() {
      let index = self.0 >> (WEBSOCKET_CATEGORY * CATEGORY_BITS);
      WebsocketCode::ALL
        .iter()
        .find(|c| c.index() == index)
        .map(|c| Error::Websocket(*c))
    } else {
      None
    }
  }

  /// A short human-readable description of this code.
  pub fn message(self) -> &'static str {
    if self.is_success() {
      "success"
    } else {
      match self.decode() {
        Some(error) => error.message(),
        None => "unknown error",
      }
    }
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.message())
  }
}
