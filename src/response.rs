//! HTTP response model.

use crate::body::Body;
use crate::cookies::{extract_response_cookies, Cookie};
use crate::headers::HeaderMap;
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{StatusCode, Version};

/// A single HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  version: Version,
  status: StatusCode,
  headers: HeaderMap,
  body: Body,
}

impl Response {
  /// Creates a response with empty headers and body.
  pub fn new(status: StatusCode) -> Self {
    Response {
      version: Version::HTTP_11,
      status,
      headers: HeaderMap::new(),
      body: Body::default(),
    }
  }

  pub(crate) fn from_parts(
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
  ) -> Self {
    Response {
      version,
      status,
      headers,
      body,
    }
  }

  /// The protocol version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// The status code.
  #[inline]
  pub fn status(&self) -> StatusCode {
    self.status
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

  /// The response body.
  #[inline]
  pub fn body(&self) -> &Body {
    &self.body
  }

  /// A mutable reference to the response body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Body {
    &mut self.body
  }

  /// Whether the status is informational (1xx).
  pub fn is_1xx(&self) -> bool {
    self.status.is_informational()
  }

  /// Whether the status is a success (2xx).
  pub fn is_2xx(&self) -> bool {
    self.status.is_success()
  }

  /// Whether the status is a redirection (3xx).
  pub fn is_3xx(&self) -> bool {
    self.status.is_redirection()
  }

  /// Whether the status is a client error (4xx).
  pub fn is_4xx(&self) -> bool {
    self.status.is_client_error()
  }

  /// Whether the status is a server error (5xx).
  pub fn is_5xx(&self) -> bool {
    self.status.is_server_error()
  }

  /// Whether this status permits a message body (not 1xx, 204, or 304).
  pub fn allows_body(&self) -> bool {
    !(self.is_1xx()
      || self.status == StatusCode::NO_CONTENT
      || self.status == StatusCode::NOT_MODIFIED)
  }

  /// The declared `Content-Length`, when present and numeric.
  pub fn content_length(&self) -> Option<u64> {
    self.headers.get("content-length")?.trim().parse().ok()
  }

  /// The cookies carried in `Set-Cookie` headers. Invalid headers are
  /// skipped.
  pub fn cookies(&self) -> impl Iterator<Item = Cookie<'_>> {
    extract_response_cookies(&self.headers)
  }

  /// Serializes the response to wire bytes: status line, headers in
  /// insertion order, blank line, body verbatim. When the body is non-empty
  /// and no `Content-Length` was set, one is synthesized.
  pub fn to_raw(&self) -> Bytes {
    let mut raw = Vec::new();
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.extend(SPACE);
    raw.extend(self.status.as_str().as_bytes());
    if let Some(reason) = self.status.canonical_reason() {
      raw.extend(SPACE);
      raw.extend(reason.as_bytes());
    }
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
  fn body_permission_follows_the_status_class() {
    assert!(!Response::new(StatusCode::CONTINUE).allows_body());
    assert!(!Response::new(StatusCode::NO_CONTENT).allows_body());
    assert!(!Response::new(StatusCode::NOT_MODIFIED).allows_body());
    assert!(Response::new(StatusCode::OK).allows_body());
    assert!(Response::new(StatusCode::NOT_FOUND).allows_body());
  }

  #[test]
  fn to_raw_synthesizes_content_length_for_bodies() {
    let mut response = Response::new(StatusCode::OK);
    response.headers_mut().append("X-One", "1");
    *response.body_mut() = Body::from("hello world");
    let raw = response.to_raw();
    let text = std::str::from_utf8(&raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("X-One: 1\r\n"));
    assert!(text.contains("Content-Length: 11\r\n"));
    assert!(text.ends_with("\r\n\r\nhello world"));
  }

  #[test]
  fn to_raw_leaves_empty_bodies_unlabelled() {
    let response = Response::new(StatusCode::NO_CONTENT);
    let text = response.to_raw();
    let text = std::str::from_utf8(&text).unwrap();
    assert!(!text.contains("Content-Length"));
    assert!(text.ends_with("\r\n\r\n"));
  }

  #[test]
  fn cookies_come_from_set_cookie_headers() {
    let mut response = Response::new(StatusCode::OK);
    response
      .headers_mut()
      .append("Set-Cookie", "sid=1; Path=/");
    response.headers_mut().append("Set-Cookie", "tok=2");
    let cookies: Vec<_> = response.cookies().collect();
    assert_eq!(cookies.len(), 2);
    assert_eq!(cookies[0].name(), "sid");
    assert_eq!(cookies[1].name(), "tok");
  }
}
