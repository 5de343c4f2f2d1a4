//! HTTP request model.

use crate::body::Body;
use crate::errors::{HttpCode, Result};
use crate::headers::HeaderMap;
use crate::url::{TargetForm, Url};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{Method, Version};

/// The closed set of request methods the proxy accepts.
pub(crate) const SUPPORTED_METHODS: [Method; 9] = [
  Method::GET,
  Method::HEAD,
  Method::POST,
  Method::PUT,
  Method::DELETE,
  Method::CONNECT,
  Method::OPTIONS,
  Method::TRACE,
  Method::PATCH,
];

/// Parses a method token, rejecting anything outside the supported set.
pub(crate) fn parse_method(token: &str) -> Result<Method> {
  SUPPORTED_METHODS
    .iter()
    .find(|m| m.as_str() == token)
    .cloned()
    .ok_or_else(|| HttpCode::InvalidMethod.into())
}

/// A single HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  method: Method,
  target: Url,
  version: Version,
  headers: HeaderMap,
  body: Body,
}

impl Request {
  /// Creates a request with empty headers and body.
  pub fn new(method: Method, target: Url) -> Self {
    Request {
      method,
      target,
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: Body::default(),
    }
  }

  pub(crate) fn from_parts(
    method: Method,
    target: Url,
    version: Version,
    headers: HeaderMap,
    body: Body,
  ) -> Self {
    Request {
      method,
      target,
      version,
      headers,
      body,
    }
  }

  /// The request method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// The request target.
  #[inline]
  pub fn target(&self) -> &Url {
    &self.target
  }

  /// A mutable reference to the request target.
  #[inline]
  pub fn target_mut(&mut self) -> &mut Url {
    &mut self.target
  }

  /// The protocol version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// The header multimap.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// A mutable reference to the header multimap.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// The request body.
  #[inline]
  pub fn body(&self) -> &Body {
    &self.body
  }

  /// A mutable reference to the request body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Body {
    &mut self.body
  }

  /// Rewrites an absolute-form target into origin form, for forwarding
  /// upstream. A `Host` header is synthesized from the netloc when the
  /// client did not send one.
  pub fn rewrite_to_origin_form(&mut self) {
    if self.target.form != TargetForm::Absolute {
      return;
    }
    if !self.headers.contains("host") {
      self
        .headers
        .set("Host", self.target.netloc.to_host_string());
    }
    let path = if self.target.path.is_empty() {
      "/".to_string()
    } else {
      self.target.path.clone()
    };
    self.target = Url::origin(path, self.target.search.clone());
  }

  /// Serializes the request to wire bytes: request line, headers in
  /// insertion order, blank line, body verbatim. When the body is non-empty
  /// and no `Content-Length` was set, one is synthesized.
  pub fn to_raw(&self) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(self.method.as_str().as_bytes());
    raw.extend(SPACE);
    raw.extend(self.target.to_string().as_bytes());
    raw.extend(SPACE);
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(CR_LF);
    let needs_length = !self.body.is_empty() && !self.headers.contains("content-length");
    for header in &self.headers {
      raw.extend(header.name().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(header.value().as_bytes());
      raw.extend(CR_LF);
    }
    if needs_length {
      raw.extend(b"Content-Length");
      raw.extend(COLON_SPACE);
      raw.extend(self.body.len().to_string().as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    if !self.body.is_empty() {
      raw.extend(self.body.as_ref());
    }
    Bytes::from(raw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unsupported_methods_are_rejected() {
    assert!(parse_method("GET").is_ok());
    assert!(parse_method("PATCH").is_ok());
    assert!(parse_method("BREW").is_err());
    assert!(parse_method("get").is_err());
  }

  #[test]
  fn to_raw_synthesizes_content_length() {
    let mut request = Request::new(Method::POST, Url::origin("/submit", ""));
    request.headers_mut().append("Host", "example.test");
    *request.body_mut() = Body::from("payload");
    let raw = request.to_raw();
    let text = std::str::from_utf8(&raw).unwrap();
    assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
    assert!(text.contains("Host: example.test\r\n"));
    assert!(text.contains("Content-Length: 7\r\n"));
    assert!(text.ends_with("\r\n\r\npayload"));
  }

  #[test]
  fn to_raw_keeps_existing_content_length() {
    let mut request = Request::new(Method::POST, Url::origin("/x", ""));
    request.headers_mut().append("content-length", "3");
    *request.body_mut() = Body::from("abc");
    let raw = request.to_raw();
    let text = std::str::from_utf8(&raw).unwrap();
    assert_eq!(text.matches("ontent-").count(), 1);
  }

  #[test]
  fn rewrite_to_origin_form_sets_host() {
    let target = Url::parse_target("http://example.test:8080/a?b=1", &Method::GET).unwrap();
    let mut request = Request::new(Method::GET, target);
    request.rewrite_to_origin_form();
    assert_eq!(request.target().form, TargetForm::Origin);
    assert_eq!(request.target().to_string(), "/a?b=1");
    assert_eq!(request.headers().get("host"), Some("example.test:8080"));
  }

  #[test]
  fn rewrite_preserves_an_existing_host_header() {
    let target = Url::parse_target("http://example.test/", &Method::GET).unwrap();
    let mut request = Request::new(Method::GET, target);
    request.headers_mut().append("Host", "other.test");
    request.rewrite_to_origin_form();
    assert_eq!(request.headers().get("host"), Some("other.test"));
  }
}
