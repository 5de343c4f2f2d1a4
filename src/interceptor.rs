//! Traffic observation and modification hooks.
//!
//! Services run every parsed exchange through the flow's interceptor
//! chain. An interceptor may pass a message on, rewrite it, or drop it.

use crate::errors::Result;
use crate::request::Request;
use crate::response::Response;
use std::sync::Arc;

/// Intercepts requests before they are forwarded upstream.
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Returns the request to forward, or `None` to block it.
  async fn intercept_request(&self, request: Request) -> Result<Option<Request>>;
}

/// Intercepts responses before they are returned to the client.
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Returns the response to deliver, or `None` to block it.
  async fn intercept_response(&self, response: Response) -> Result<Option<Response>>;
}

/// An ordered chain of interceptors.
#[derive(Default)]
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorHandler {
  /// An empty chain.
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a request interceptor.
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  /// Appends a response interceptor.
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  /// Whether any interceptor is registered.
  pub fn has_interceptors(&self) -> bool {
    !self.request_interceptors.is_empty() || !self.response_interceptors.is_empty()
  }

  /// Runs a request through the chain; `None` means it was blocked.
  pub async fn process_request(&self, mut request: Request) -> Result<Option<Request>> {
    for interceptor in &self.request_interceptors {
      match interceptor.intercept_request(request).await? {
        Some(modified) => request = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(request))
  }

  /// Runs a response through the chain; `None` means it was blocked.
  pub async fn process_response(&self, mut response: Response) -> Result<Option<Response>> {
    for interceptor in &self.response_interceptors {
      match interceptor.intercept_response(response).await? {
        Some(modified) => response = modified,
        None => return Ok(None),
      }
    }
    Ok(Some(response))
  }
}

/// Logs every exchange at `info` level without modifying it.
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn intercept_request(&self, request: Request) -> Result<Option<Request>> {
    tracing::info!("request: {} {}", request.method(), request.target());
    Ok(Some(request))
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn intercept_response(&self, response: Response) -> Result<Option<Response>> {
    tracing::info!("response: {}", response.status());
    Ok(Some(response))
  }
}
