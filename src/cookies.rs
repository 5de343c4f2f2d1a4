//! Set-Cookie parsing.

use crate::headers::HeaderMap;
use std::time::SystemTime;

/// A parsed `Set-Cookie` header: name, value, and attribute set.
#[derive(Debug, Clone)]
pub struct Cookie<'a>(cookie::Cookie<'a>);

impl<'a> Cookie<'a> {
  fn parse(value: &'a str) -> Result<Cookie<'a>, cookie::ParseError> {
    cookie::Cookie::parse(value).map(Cookie)
  }

  /// The cookie's name.
  pub fn name(&self) -> &str {
    self.0.name()
  }

  /// The cookie's value.
  pub fn value(&self) -> &str {
    self.0.value()
  }

  /// Whether the `HttpOnly` attribute is set.
  pub fn http_only(&self) -> bool {
    self.0.http_only().unwrap_or(false)
  }

  /// Whether the `Secure` attribute is set.
  pub fn secure(&self) -> bool {
    self.0.secure().unwrap_or(false)
  }

  /// Whether `SameSite=Lax` is set.
  pub fn same_site_lax(&self) -> bool {
    self.0.same_site() == Some(cookie::SameSite::Lax)
  }

  /// Whether `SameSite=Strict` is set.
  pub fn same_site_strict(&self) -> bool {
    self.0.same_site() == Some(cookie::SameSite::Strict)
  }

  /// The `Path` attribute, when present.
  pub fn path(&self) -> Option<&str> {
    self.0.path()
  }

  /// The `Domain` attribute, when present.
  pub fn domain(&self) -> Option<&str> {
    self.0.domain()
  }

  /// The `Max-Age` attribute, when present.
  pub fn max_age(&self) -> Option<std::time::Duration> {
    self.0.max_age().and_then(|d| d.try_into().ok())
  }

  /// The `Expires` attribute, when present and not a session expiry.
  pub fn expires(&self) -> Option<SystemTime> {
    match self.0.expires() {
      Some(cookie::Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
      None | Some(cookie::Expiration::Session) => None,
    }
  }
}

/// Parses every `Set-Cookie` header in `headers`, skipping invalid ones.
pub(crate) fn extract_response_cookies<'a>(
  headers: &'a HeaderMap,
) -> impl Iterator<Item = Cookie<'a>> + 'a {
  headers
    .get_all("set-cookie")
    .filter_map(|value| Cookie::parse(value).ok())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn attributes_are_exposed() {
    let mut headers = HeaderMap::new();
    headers.append(
      "Set-Cookie",
      "sid=abc123; Path=/; Domain=example.test; Secure; HttpOnly",
    );
    headers.append("Set-Cookie", "not a cookie header %%%;;;=");
    headers.append("set-cookie", "plain=1");

    let cookies: Vec<_> = extract_response_cookies(&headers).collect();
    assert_eq!(cookies.len(), 2);
    assert_eq!(cookies[0].name(), "sid");
    assert_eq!(cookies[0].value(), "abc123");
    assert_eq!(cookies[0].path(), Some("/"));
    assert_eq!(cookies[0].domain(), Some("example.test"));
    assert!(cookies[0].secure());
    assert!(cookies[0].http_only());
    assert_eq!(cookies[1].name(), "plain");
    assert!(!cookies[1].secure());
  }
}
