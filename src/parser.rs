//! Segment-driven HTTP/1.x message parsing.
//!
//! A [`MessageReader`] owns nothing: it borrows a stream and the
//! connection's streambuf, pulls bytes with [`read_buf`] only when a
//! [`BufferSegment`] reports its predicate unsatisfied, and leaves any
//! surplus bytes in the streambuf for the next message on the connection.
//!
//! [`read_buf`]: tokio::io::AsyncReadExt::read_buf

use crate::body::Body;
use crate::errors::{Error, HttpCode, Result};
use crate::headers::{is_valid_field_name, HeaderMap};
use crate::request::{parse_method, Request};
use crate::response::Response;
use crate::segment::BufferSegment;
use crate::url::Url;
use crate::CR_LF;
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single start line.
const MAX_LINE: usize = 8 * 1024;
/// Upper bound on the accumulated header block.
const MAX_HEADERS_SIZE: usize = 64 * 1024;
/// Upper bound on a chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

/// How a message body was framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
  /// No body bytes belong to the message
  None,
  /// Framed by `Content-Length`
  Length(usize),
  /// Framed by `Transfer-Encoding: chunked`
  Chunked,
  /// Delimited by end of stream; the connection cannot be reused
  ReadToEof,
}

/// Which side of an exchange a body belongs to; responses need the request
/// method and their own status to apply the body-selection rule.
enum BodyContext<'a> {
  Request,
  Response {
    request_method: &'a Method,
    status: StatusCode,
  },
}

/// Whether a status permits a message body (not 1xx, 204, or 304).
fn status_allows_body(status: StatusCode) -> bool {
  !(status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED)
}

/// A stateful reader parsing HTTP/1 messages off a stream.
pub struct MessageReader<'a, S> {
  stream: &'a mut S,
  input: &'a mut BytesMut,
}

impl<'a, S: AsyncRead + Unpin> MessageReader<'a, S> {
  /// Borrows a stream and its streambuf.
  pub fn new(stream: &'a mut S, input: &'a mut BytesMut) -> Self {
    MessageReader { stream, input }
  }

  /// Parses one request.
  ///
  /// Returns `Ok(None)` when the connection closed cleanly before any byte
  /// of a new request arrived.
  pub async fn read_request(&mut self, max_body: usize) -> Result<Option<Request>> {
    let line = match self.read_line(HttpCode::InvalidRequestLine.into()).await? {
      Some(line) => line,
      None => return Ok(None),
    };
    let line = std::str::from_utf8(&line).map_err(|_| HttpCode::InvalidRequestLine)?;
    let mut parts = line.splitn(3, ' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => (m, t, v),
      _ => return Err(HttpCode::InvalidRequestLine.into()),
    };
    let method = parse_method(method)?;
    let version = parse_version(version)?;
    let target = Url::parse_target(target, &method)?;

    let mut headers = self.read_headers().await?;
    let (body, _) = self
      .read_body(&mut headers, BodyContext::Request, max_body)
      .await?;
    Ok(Some(Request::from_parts(
      method, target, version, headers, body,
    )))
  }

  /// Parses one response to a request issued with `method`.
  ///
  /// Also reports how the body was framed, which decides whether the
  /// connection can be reused.
  pub async fn read_response(
    &mut self,
    method: &Method,
    max_body: usize,
  ) -> Result<(Response, BodyFraming)> {
    let line = self
      .read_line(HttpCode::InvalidResponseLine.into())
      .await?
      .ok_or(HttpCode::NoResponse)?;
    let line = std::str::from_utf8(&line).map_err(|_| HttpCode::InvalidResponseLine)?;
    let mut parts = line.splitn(3, ' ');
    let (version, status) = match (parts.next(), parts.next()) {
      (Some(v), Some(s)) if !s.is_empty() => (v, s),
      _ => return Err(HttpCode::InvalidResponseLine.into()),
    };
    let version = parse_version(version)?;
    let status =
      StatusCode::from_bytes(status.as_bytes()).map_err(|_| HttpCode::InvalidStatus)?;

    let mut headers = self.read_headers().await?;
    let (body, framing) = self
      .read_body(
        &mut headers,
        BodyContext::Response {
          request_method: method,
          status,
        },
        max_body,
      )
      .await?;
    Ok((Response::from_parts(version, status, headers, body), framing))
  }

  /// Reads one CRLF-terminated line, excluding the terminator.
  ///
  /// Returns `None` on a clean end of stream before the first byte;
  /// `incomplete` is the error for a line cut short mid-way.
  async fn read_line(&mut self, incomplete: Error) -> Result<Option<Bytes>> {
    let mut segment = BufferSegment::new();
    loop {
      if segment.read_until(self.input, CR_LF) {
        return Ok(Some(segment.export_data()));
      }
      if segment.bytes_committed() + segment.bytes_not_committed() > MAX_LINE {
        return Err(incomplete);
      }
      if self.fill().await? == 0 {
        if segment.bytes_not_committed() == 0 && segment.bytes_committed() == 0 {
          return Ok(None);
        }
        return Err(incomplete);
      }
    }
  }

  /// Reads header lines up to the blank line, preserving duplicates and
  /// casing.
  async fn read_headers(&mut self) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut total = 0usize;
    loop {
      let line = self
        .read_line(HttpCode::InvalidHeader.into())
        .await?
        .ok_or(HttpCode::InvalidHeader)?;
      if line.is_empty() {
        return Ok(headers);
      }
      total += line.len();
      if total > MAX_HEADERS_SIZE {
        return Err(HttpCode::InvalidHeader.into());
      }
      let (name, value) = parse_header_line(&line)?;
      headers.append(name, value);
    }
  }

  /// Selects and reads the message body.
  ///
  /// `Transfer-Encoding: chunked` wins over `Content-Length`; with neither,
  /// requests have no body and responses drain the stream when their
  /// status permits one. Chunked framing is consumed here and the
  /// `Transfer-Encoding` header removed, so the re-serialized message is
  /// length-framed.
  async fn read_body(
    &mut self,
    headers: &mut HeaderMap,
    context: BodyContext<'_>,
    max_body: usize,
  ) -> Result<(Body, BodyFraming)> {
    match context {
      BodyContext::Response { request_method, .. } if request_method == &Method::HEAD => {
        return Ok((Body::default(), BodyFraming::None));
      }
      BodyContext::Response { status, .. } if !status_allows_body(status) => {
        return Ok((Body::default(), BodyFraming::None));
      }
      _ => {}
    }
    let is_response = matches!(context, BodyContext::Response { .. });
    if headers.contains_token("transfer-encoding", "chunked") {
      let body = self.read_chunked_body(headers, max_body).await?;
      headers.remove("transfer-encoding");
      return Ok((body, BodyFraming::Chunked));
    }
    if let Some(value) = headers.get("content-length") {
      let length = parse_content_length(value)?;
      if length > max_body {
        return Err(HttpCode::BodySizeTooLarge.into());
      }
      let truncated: Error = if is_response {
        HttpCode::MalformedResponseBody.into()
      } else {
        HttpCode::InvalidBodySize.into()
      };
      let body = self.read_exact_body(length, truncated).await?;
      return Ok((Body::from(body.to_vec()), BodyFraming::Length(length)));
    }
    if is_response {
      let body = self.read_eof_body(max_body).await?;
      return Ok((Body::from(body.to_vec()), BodyFraming::ReadToEof));
    }
    Ok((Body::default(), BodyFraming::None))
  }

  /// Reads exactly `length` body bytes.
  async fn read_exact_body(&mut self, length: usize, truncated: Error) -> Result<Bytes> {
    let mut segment = BufferSegment::new();
    loop {
      if segment.read_up_to_bytes(self.input, length)? {
        return Ok(segment.export_data());
      }
      if self.fill().await? == 0 {
        return Err(truncated);
      }
    }
  }

  /// Drains the stream to its end, up to `max_body` bytes.
  async fn read_eof_body(&mut self, max_body: usize) -> Result<Bytes> {
    let mut segment = BufferSegment::new();
    loop {
      segment.read_all(self.input);
      if segment.bytes_committed() > max_body {
        return Err(HttpCode::BodySizeTooLarge.into());
      }
      if self.fill().await? == 0 {
        segment.commit();
        return Ok(segment.export_data());
      }
    }
  }

  /// Decodes a chunked body: size lines in hex with extensions ignored,
  /// exact chunk reads, a zero chunk terminator, then optional trailer
  /// headers appended to the message's header block.
  async fn read_chunked_body(
    &mut self,
    headers: &mut HeaderMap,
    max_body: usize,
  ) -> Result<Body> {
    let mut body = Vec::new();
    loop {
      let line = self
        .read_line(HttpCode::InvalidChunkedBody.into())
        .await?
        .ok_or(HttpCode::InvalidChunkedBody)?;
      if line.len() > MAX_CHUNK_LINE {
        return Err(HttpCode::InvalidChunkedBody.into());
      }
      let line = std::str::from_utf8(&line).map_err(|_| HttpCode::InvalidChunkedBody)?;
      let size_token = line.split(';').next().unwrap_or("").trim();
      if size_token.is_empty() {
        return Err(HttpCode::InvalidChunkedBody.into());
      }
      let size = usize::from_str_radix(size_token, 16)
        .map_err(|_| HttpCode::InvalidChunkedBody)?;
      if size == 0 {
        break;
      }
      if body.len() + size > max_body {
        return Err(HttpCode::BodySizeTooLarge.into());
      }
      let chunk = self
        .read_exact_body(size, HttpCode::InvalidChunkedBody.into())
        .await?;
      body.extend_from_slice(&chunk);
      let crlf = self
        .read_exact_body(2, HttpCode::InvalidChunkedBody.into())
        .await?;
      if &crlf[..] != CR_LF {
        return Err(HttpCode::InvalidChunkedBody.into());
      }
    }
    // Optional trailer section, same shape as the header block.
    loop {
      let line = self
        .read_line(HttpCode::InvalidChunkedBody.into())
        .await?
        .ok_or(HttpCode::InvalidChunkedBody)?;
      if line.is_empty() {
        break;
      }
      let (name, value) = parse_header_line(&line).map_err(|_| HttpCode::InvalidChunkedBody)?;
      headers.append(name, value);
    }
    Ok(Body::from(body))
  }

  async fn fill(&mut self) -> Result<usize> {
    Ok(self.stream.read_buf(&mut *self.input).await?)
  }
}

/// Splits a header line at the first colon; name and value are trimmed and
/// the name must be a valid field token.
pub(crate) fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
  let line = std::str::from_utf8(line).map_err(|_| HttpCode::InvalidHeader)?;
  let (name, value) = line.split_once(':').ok_or(HttpCode::InvalidHeader)?;
  let name = name.trim();
  if !is_valid_field_name(name) {
    return Err(HttpCode::InvalidHeader.into());
  }
  Ok((name.to_string(), value.trim().to_string()))
}

/// Parses `HTTP/1.0` or `HTTP/1.1`; anything else is rejected.
pub(crate) fn parse_version(token: &str) -> Result<Version> {
  match token {
    "HTTP/1.0" => Ok(Version::HTTP_10),
    "HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(HttpCode::InvalidVersion.into()),
  }
}

/// Parses a `Content-Length` value, rejecting negative or non-numeric
/// sizes.
fn parse_content_length(value: &str) -> Result<usize> {
  let value = value.trim();
  if value.is_empty() || value.starts_with('-') {
    return Err(HttpCode::InvalidBodySize.into());
  }
  value
    .parse::<usize>()
    .map_err(|_| HttpCode::InvalidBodySize.into())
}
