//! Stateful byte accumulation over partially filled input buffers.
//!
//! Parsers in this crate never read sockets directly. The owning service
//! pulls bytes from its stream into a [`BytesMut`] streambuf, and a
//! [`BufferSegment`] drains that buffer across as many calls as it takes for
//! a completion predicate to hold: an exact byte count, a delimiter, or
//! everything available.

use crate::errors::{ProxyCode, Result};
use bytes::{Bytes, BytesMut};

/// A stateful reader that accumulates bytes from an input buffer until a
/// completion predicate fires.
///
/// The segment keeps two buffers: a scratch buffer holding bytes consumed
/// while a delimiter search is still in progress, and a committed buffer
/// holding the finished data exposed to the parser. Once a segment is
/// complete no further reads are permitted until [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct BufferSegment {
  complete: bool,
  committed: BytesMut,
  buffer: BytesMut,
  bytes_last_read: usize,
}

impl BufferSegment {
  /// Creates an empty, incomplete segment.
  pub fn new() -> Self {
    Self::default()
  }

  /// Reads from `input` until the total number of bytes committed across
  /// this segment's lifetime reaches `bytes`.
  ///
  /// Returns `true` once the count is reached. Fails if earlier reads
  /// already committed more than `bytes`, or if the segment is complete.
  pub fn read_up_to_bytes(&mut self, input: &mut BytesMut, bytes: usize) -> Result<bool> {
    if self.complete {
      return Err(ProxyCode::InvalidOperation.into());
    }
    if self.committed.len() > bytes {
      return Err(ProxyCode::InvalidOperation.into());
    }
    let needed = bytes - self.committed.len();
    let take = needed.min(input.len());
    self.committed.extend_from_slice(&input.split_to(take));
    self.bytes_last_read = take;
    if self.committed.len() == bytes {
      self.complete = true;
    }
    Ok(self.complete)
  }

  /// Reads from `input` until a single-byte delimiter is found.
  ///
  /// The delimiter is consumed but excluded from the committed data. All
  /// bytes seen before the delimiter are removed from `input` permanently,
  /// even when the call returns `false`.
  pub fn read_until_char(&mut self, input: &mut BytesMut, delim: u8) -> bool {
    self.read_until(input, std::slice::from_ref(&delim))
  }

  /// Reads from `input` until a multi-byte delimiter is found.
  ///
  /// The delimiter may arrive split across calls; the scratch buffer holds
  /// the partial tail between calls. Returns `true` once the delimiter has
  /// been consumed.
  pub fn read_until(&mut self, input: &mut BytesMut, delim: &[u8]) -> bool {
    if self.complete || delim.is_empty() {
      return self.complete;
    }
    match find_across(&self.buffer, input, delim) {
      Some(pos) => {
        // Pull exactly through the delimiter, no further.
        let total = pos + delim.len();
        let from_input = total.saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(&input.split_to(from_input));
        self.bytes_last_read = from_input;
        self.buffer.truncate(pos);
        self.committed.extend_from_slice(&self.buffer);
        self.buffer.clear();
        self.complete = true;
      }
      None => {
        // Keep everything seen so far; a delimiter split across refills is
        // caught on the next call.
        self.bytes_last_read = input.len();
        self.buffer.extend_from_slice(&input.split_to(input.len()));
      }
    }
    self.complete
  }

  /// Moves everything currently in `input` into the committed buffer.
  ///
  /// Read-all has no intrinsic completion condition; the caller marks the
  /// segment complete with [`commit`](Self::commit) when the source reaches
  /// end of stream.
  pub fn read_all(&mut self, input: &mut BytesMut) {
    self.bytes_last_read = input.len();
    self.committed.extend_from_slice(&input.split_to(input.len()));
  }

  /// Commits any scratch data and marks the segment complete.
  pub fn commit(&mut self) {
    self.committed.extend_from_slice(&self.buffer);
    self.buffer.clear();
    self.complete = true;
  }

  /// Number of bytes of committed data being held.
  pub fn bytes_committed(&self) -> usize {
    self.committed.len()
  }

  /// Number of bytes in the scratch buffer that are not yet committed.
  pub fn bytes_not_committed(&self) -> usize {
    self.buffer.len()
  }

  /// Number of bytes consumed from the input by the last read call.
  pub fn bytes_last_read(&self) -> usize {
    self.bytes_last_read
  }

  /// Whether a completion predicate has fired.
  pub fn complete(&self) -> bool {
    self.complete
  }

  /// A view of the committed data.
  pub fn committed_data(&self) -> &[u8] {
    &self.committed
  }

  /// Drains the committed buffer into an owned byte string.
  pub fn export_data(&mut self) -> Bytes {
    self.committed.split().freeze()
  }

  /// Clears all data and flags so the segment can be reused.
  pub fn reset(&mut self) {
    self.complete = false;
    self.committed.clear();
    self.buffer.clear();
    self.bytes_last_read = 0;
  }
}

/// Finds `needle` in the concatenation of `a` and `b` without allocating,
/// returning the index relative to the start of `a`.
fn find_across(a: &[u8], b: &[u8], needle: &[u8]) -> Option<usize> {
  let total = a.len() + b.len();
  if needle.is_empty() || total < needle.len() {
    return None;
  }
  let at = |i: usize| {
    if i < a.len() {
      a[i]
    } else {
      b[i - a.len()]
    }
  };
  'outer: for start in 0..=(total - needle.len()) {
    for (offset, expected) in needle.iter().enumerate() {
      if at(start + offset) != *expected {
        continue 'outer;
      }
    }
    return Some(start);
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn buf(data: &[u8]) -> BytesMut {
    BytesMut::from(data)
  }

  #[test]
  fn read_up_to_bytes_accumulates_across_calls() {
    let mut segment = BufferSegment::new();
    let mut first = buf(b"hel");
    assert!(!segment.read_up_to_bytes(&mut first, 5).unwrap());
    assert_eq!(segment.bytes_last_read(), 3);
    assert!(first.is_empty());

    let mut second = buf(b"lo and more");
    assert!(segment.read_up_to_bytes(&mut second, 5).unwrap());
    assert_eq!(segment.bytes_committed(), 5);
    assert_eq!(segment.bytes_last_read(), 2);
    // Exactly five bytes were taken in total; the rest stays in the input.
    assert_eq!(&second[..], b" and more");
    assert_eq!(&segment.export_data()[..], b"hello");
  }

  #[test]
  fn read_up_to_bytes_rejects_reads_once_complete() {
    let mut segment = BufferSegment::new();
    let mut input = buf(b"abc");
    assert!(segment.read_up_to_bytes(&mut input, 3).unwrap());
    let mut more = buf(b"xyz");
    assert!(segment.read_up_to_bytes(&mut more, 3).is_err());
    segment.reset();
    assert!(segment.read_up_to_bytes(&mut more, 3).unwrap());
  }

  #[test]
  fn read_until_excludes_the_delimiter() {
    let mut segment = BufferSegment::new();
    let mut input = buf(b"GET / HTTP/1.1\r\nHost: x\r\n");
    assert!(segment.read_until(&mut input, b"\r\n"));
    assert_eq!(&segment.export_data()[..], b"GET / HTTP/1.1");
    assert_eq!(&input[..], b"Host: x\r\n");
  }

  #[test]
  fn read_until_handles_delimiter_split_across_refills() {
    let mut segment = BufferSegment::new();
    let mut first = buf(b"partial line\r");
    assert!(!segment.read_until(&mut first, b"\r\n"));
    assert!(first.is_empty());

    let mut second = buf(b"\nrest");
    assert!(segment.read_until(&mut second, b"\r\n"));
    assert_eq!(&segment.export_data()[..], b"partial line");
    assert_eq!(&second[..], b"rest");
  }

  #[test]
  fn read_until_char_finds_single_byte_delimiters() {
    let mut segment = BufferSegment::new();
    let mut input = buf(b"name:value");
    assert!(segment.read_until_char(&mut input, b':'));
    assert_eq!(&segment.export_data()[..], b"name");
    assert_eq!(&input[..], b"value");
  }

  #[test]
  fn read_all_commits_on_explicit_commit() {
    let mut segment = BufferSegment::new();
    let mut first = buf(b"every");
    segment.read_all(&mut first);
    let mut second = buf(b"thing");
    segment.read_all(&mut second);
    assert!(!segment.complete());
    segment.commit();
    assert!(segment.complete());
    assert_eq!(&segment.export_data()[..], b"everything");
  }

  #[test]
  fn find_across_spans_the_boundary() {
    assert_eq!(find_across(b"ab", b"cd", b"bc"), Some(1));
    assert_eq!(find_across(b"", b"abcd", b"cd"), Some(2));
    assert_eq!(find_across(b"abcd", b"", b"cd"), Some(2));
    assert_eq!(find_across(b"ab", b"cd", b"xy"), None);
    assert_eq!(find_across(b"a", b"", b"ab"), None);
  }
}
