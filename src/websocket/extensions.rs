//! `Sec-WebSocket-Extensions` parsing.

use crate::errors::{Result, WebsocketCode};
use crate::headers::HeaderMap;
use std::collections::BTreeMap;
use std::fmt;

/// The data for a single negotiated WebSocket extension: a name and its
/// parameter map. Parameters without a value map to an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionData {
  name: String,
  params: BTreeMap<String, String>,
}

impl ExtensionData {
  /// Separates extensions within one header value.
  pub const EXTENSION_DELIM: char = ',';
  /// Separates parameters within one extension.
  pub const PARAM_DELIM: char = ';';
  /// Separates a parameter name from its value.
  pub const ASSIGN_DELIM: char = '=';

  /// An extension with no parameters.
  pub fn new(name: impl Into<String>) -> Self {
    ExtensionData {
      name: name.into(),
      params: BTreeMap::new(),
    }
  }

  /// The extension name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether a parameter is present.
  pub fn has_param(&self, name: &str) -> bool {
    self.params.contains_key(name)
  }

  /// A parameter's value; fails when absent.
  pub fn param(&self, name: &str) -> Result<&str> {
    self
      .params
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| WebsocketCode::ExtensionParamNotFound.into())
  }

  /// Sets a parameter; an empty value renders as a bare token.
  pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.params.insert(name.into(), value.into());
  }

  /// Parses a single extension and its parameters. The input must not
  /// contain [`Self::EXTENSION_DELIM`]; split the header value first.
  pub fn from_header_value(value: &str) -> Result<ExtensionData> {
    if value.contains(Self::EXTENSION_DELIM) {
      return Err(WebsocketCode::InvalidExtensionString.into());
    }
    let mut parts = value.split(Self::PARAM_DELIM);
    let name = parts.next().unwrap_or("").trim();
    if name.is_empty() {
      return Err(WebsocketCode::InvalidExtensionString.into());
    }
    let mut extension = ExtensionData::new(name);
    for part in parts {
      let part = part.trim();
      if part.is_empty() {
        return Err(WebsocketCode::InvalidExtensionString.into());
      }
      match part.split_once(Self::ASSIGN_DELIM) {
        Some((key, value)) => {
          let key = key.trim();
          if key.is_empty() {
            return Err(WebsocketCode::InvalidExtensionString.into());
          }
          extension.set_param(key, value.trim().trim_matches('"'));
        }
        None => extension.set_param(part, ""),
      }
    }
    Ok(extension)
  }

  /// Parses every extension announced under `Sec-WebSocket-Extensions` in
  /// `headers`, across repeated header lines and comma-separated lists.
  pub fn from_headers(headers: &HeaderMap) -> Result<Vec<ExtensionData>> {
    let mut extensions = Vec::new();
    for value in headers.get_all("sec-websocket-extensions") {
      for item in value.split(Self::EXTENSION_DELIM) {
        let item = item.trim();
        if item.is_empty() {
          continue;
        }
        extensions.push(Self::from_header_value(item)?);
      }
    }
    Ok(extensions)
  }
}

impl fmt::Display for ExtensionData {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)?;
    for (key, value) in &self.params {
      write!(f, "{} {}", Self::PARAM_DELIM, key)?;
      if !value.is_empty() {
        write!(f, "{}{}", Self::ASSIGN_DELIM, value)?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_name_and_parameters() {
    let ext = ExtensionData::from_header_value(
      "permessage-deflate; client_max_window_bits=15; server_no_context_takeover",
    )
    .unwrap();
    assert_eq!(ext.name(), "permessage-deflate");
    assert_eq!(ext.param("client_max_window_bits").unwrap(), "15");
    assert!(ext.has_param("server_no_context_takeover"));
    assert_eq!(ext.param("server_no_context_takeover").unwrap(), "");
  }

  #[test]
  fn missing_params_are_a_typed_error() {
    let ext = ExtensionData::from_header_value("permessage-deflate").unwrap();
    assert_eq!(
      ext.param("client_max_window_bits").unwrap_err(),
      crate::Error::Websocket(WebsocketCode::ExtensionParamNotFound)
    );
  }

  #[test]
  fn quoted_parameter_values_are_unquoted() {
    let ext = ExtensionData::from_header_value("x-ext; token=\"abc\"").unwrap();
    assert_eq!(ext.param("token").unwrap(), "abc");
  }

  #[test]
  fn malformed_strings_are_rejected() {
    assert!(ExtensionData::from_header_value("").is_err());
    assert!(ExtensionData::from_header_value("; param=1").is_err());
    assert!(ExtensionData::from_header_value("a, b").is_err());
    assert!(ExtensionData::from_header_value("x; ; y").is_err());
  }

  #[test]
  fn from_headers_crosses_lines_and_commas() {
    let mut headers = HeaderMap::new();
    headers.append(
      "Sec-WebSocket-Extensions",
      "permessage-deflate; server_no_context_takeover, x-other",
    );
    headers.append("sec-websocket-extensions", "x-third; k=v");
    let extensions = ExtensionData::from_headers(&headers).unwrap();
    let names: Vec<_> = extensions.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["permessage-deflate", "x-other", "x-third"]);
  }

  #[test]
  fn display_round_trips() {
    let mut ext = ExtensionData::new("permessage-deflate");
    ext.set_param("client_no_context_takeover", "");
    ext.set_param("server_max_window_bits", "12");
    let rendered = ext.to_string();
    let reparsed = ExtensionData::from_header_value(&rendered).unwrap();
    assert_eq!(ext, reparsed);
  }
}
