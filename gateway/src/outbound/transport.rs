//! Outbound transports.
//!
//! The gateway treats requests as opaque; a [`Transport`] knows how to send
//! them, what they cost, and what rate-limit hints a response carries.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::error::CallError;
use crate::ratelimit::{RateLimitHint, MAX_SERVER_PAUSE};

/// Sends one request and classifies the outcome.
pub trait Transport: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Response: Send + 'static;

    fn send<'a>(&'a self, request: &'a Self::Request)
        -> BoxFuture<'a, Result<Self::Response, CallError>>;

    /// Tokens this request consumes.
    fn cost(&self, _request: &Self::Request) -> u32 {
        1
    }

    /// Rate-limit state reported by a successful response.
    fn hint(&self, _response: &Self::Response) -> Option<RateLimitHint> {
        None
    }
}

/// Descriptor for an HTTP call.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub cost: u32,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            cost: 1,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_json<T: Serialize>(url: impl Into<String>, body: &T) -> serde_json::Result<Self> {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(Bytes::from(serde_json::to_vec(body)?));
        request.headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(request)
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_bearer(self, token: &str) -> Self {
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                self.with_header(axum::http::header::AUTHORIZATION, value)
            }
            Err(_) => self,
        }
    }

    #[must_use]
    pub const fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

/// A successful (2xx/3xx) HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Map a status code to a failure class. `None` means success.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<CallError> {
    if status.is_success() || status.is_redirection() || status.is_informational() {
        return None;
    }

    let hint = RateLimitHint::from_headers(headers).unwrap_or_default();
    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && hint.is_exhausted());
    if rate_limited {
        let retry_after = hint.retry_after.or_else(|| {
            hint.reset_at
                .and_then(|at| (at - chrono::Utc::now()).to_std().ok())
                .map(|wait| wait.min(MAX_SERVER_PAUSE))
        });
        return Some(CallError::RateLimited { retry_after });
    }

    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return Some(CallError::Transient(format!("HTTP {status}")));
    }
    Some(CallError::Fatal(format!("HTTP {status}")))
}

fn classify_reqwest_error(err: &reqwest::Error) -> CallError {
    if err.is_timeout() {
        CallError::Timeout
    } else if err.is_builder() {
        CallError::Fatal(format!("invalid request: {err}"))
    } else {
        CallError::Transient(err.to_string())
    }
}

/// [`Transport`] over `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    async fn send_inner(&self, request: &HttpRequest) -> Result<HttpResponse, CallError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| CallError::Fatal(format!("invalid method: {e}")))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| CallError::Fatal(format!("invalid status: {e}")))?;
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        if let Some(failure) = classify_status(status, &headers) {
            debug!(url = %request.url, status = %status, error = %failure, "Outbound call failed");
            return Err(failure);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for HttpTransport {
    type Request = HttpRequest;
    type Response = HttpResponse;

    fn send<'a>(&'a self, request: &'a HttpRequest) -> BoxFuture<'a, Result<HttpResponse, CallError>> {
        self.send_inner(request).boxed()
    }

    fn cost(&self, request: &HttpRequest) -> u32 {
        request.cost
    }

    fn hint(&self, response: &HttpResponse) -> Option<RateLimitHint> {
        RateLimitHint::from_headers(&response.headers)
    }
}
