//! Ordered, case-insensitive header multimap.
//!
//! An intercepting proxy must reproduce a message on the wire the way it
//! arrived: duplicate headers in their original order and names in their
//! original casing. Lookup folds case; serialization writes the stored
//! bytes back verbatim.

use std::fmt;
use std::slice;

/// A single header entry, name in original casing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
  pub(crate) name: String,
  pub(crate) value: String,
}

impl Header {
  /// The header name as received.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// The header value as received.
  pub fn value(&self) -> &str {
    &self.value
  }
}

/// An insertion-ordered header multimap with case-folded lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
  entries: Vec<Header>,
}

impl HeaderMap {
  /// Creates an empty map.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of header lines held.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the map holds no headers.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Appends a header, preserving any existing entries with the same name.
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.entries.push(Header {
      name: name.into(),
      value: value.into(),
    });
  }

  /// Replaces all entries with this name by a single entry. The new entry
  /// takes the position of the first replaced one, or the end of the map.
  pub fn set(&mut self, name: &str, value: impl Into<String>) {
    let value = value.into();
    let mut position = None;
    self.entries.retain({
      let mut index = 0;
      let position = &mut position;
      move |header| {
        let matched = header.name.eq_ignore_ascii_case(name);
        if matched && position.is_none() {
          *position = Some(index);
        }
        if !matched {
          index += 1;
        }
        !matched
      }
    });
    let header = Header {
      name: name.to_string(),
      value,
    };
    match position {
      Some(index) => self.entries.insert(index, header),
      None => self.entries.push(header),
    }
  }

  /// First value with this name, case-folded.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|h| h.name.eq_ignore_ascii_case(name))
      .map(|h| h.value.as_str())
  }

  /// All values with this name, in insertion order.
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .entries
      .iter()
      .filter(move |h| h.name.eq_ignore_ascii_case(name))
      .map(|h| h.value.as_str())
  }

  /// Whether at least one entry with this name exists.
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Whether any value under `name` carries `token` in its comma-separated
  /// list, compared case-insensitively. `Connection: keep-alive, Upgrade`
  /// contains the token `upgrade`.
  pub fn contains_token(&self, name: &str, token: &str) -> bool {
    self
      .get_all(name)
      .flat_map(|value| value.split(','))
      .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
  }

  /// Removes every entry with this name, returning how many were removed.
  pub fn remove(&mut self, name: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|h| !h.name.eq_ignore_ascii_case(name));
    before - self.entries.len()
  }

  /// Iterates entries in insertion order.
  pub fn iter(&self) -> slice::Iter<'_, Header> {
    self.entries.iter()
  }
}

impl<'a> IntoIterator for &'a HeaderMap {
  type Item = &'a Header;
  type IntoIter = slice::Iter<'a, Header>;

  fn into_iter(self) -> Self::IntoIter {
    self.entries.iter()
  }
}

impl fmt::Display for HeaderMap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for header in &self.entries {
      writeln!(f, "{}: {}", header.name, header.value)?;
    }
    Ok(())
  }
}

/// Whether `name` is a valid RFC 7230 header field name.
pub(crate) fn is_valid_field_name(name: &str) -> bool {
  !name.is_empty()
    && name.bytes().all(|b| {
      b.is_ascii_alphanumeric()
        || matches!(
          b,
          b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
            | b'`' | b'|' | b'~'
        )
    })
}
