//! Binding-side HTTP exchange: a mutable `Request` performed once into an
//! immutable `Response`.
//!
//! # Design
//! A transport failure is not an `Err`. `perform` only fails when the engine
//! cannot produce a response at all; otherwise the caller gets a `Response`
//! whose `error()` code says how the exchange went, with logs and request
//! headers still readable for diagnostics.
//!
//! Payload accessors distinguish an absent field (`MissingField`) from an
//! empty one (`Ok` with an empty value).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::engine::HttpEngine;
use crate::error::{BindingError, ResourceKind};
use crate::exchange::UreqEngine;
use crate::handle::{HandleSlot, RequestHandle, ResponseHandle};

/// Transport outcome of a completed exchange, using curl's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportError {
    Ok,
    UnsupportedProtocol,
    MalformedUrl,
    CouldNotResolveProxy,
    CouldNotResolveHost,
    CouldNotConnect,
    TimedOut,
    SslConnectError,
    BadFunctionArgument,
    TooManyRedirects,
    RecvError,
    BadCaBundle,
    Other(i64),
}

impl TransportError {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => TransportError::Ok,
            1 => TransportError::UnsupportedProtocol,
            3 => TransportError::MalformedUrl,
            5 => TransportError::CouldNotResolveProxy,
            6 => TransportError::CouldNotResolveHost,
            7 => TransportError::CouldNotConnect,
            28 => TransportError::TimedOut,
            35 => TransportError::SslConnectError,
            43 => TransportError::BadFunctionArgument,
            47 => TransportError::TooManyRedirects,
            56 => TransportError::RecvError,
            77 => TransportError::BadCaBundle,
            other => TransportError::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            TransportError::Ok => 0,
            TransportError::UnsupportedProtocol => 1,
            TransportError::MalformedUrl => 3,
            TransportError::CouldNotResolveProxy => 5,
            TransportError::CouldNotResolveHost => 6,
            TransportError::CouldNotConnect => 7,
            TransportError::TimedOut => 28,
            TransportError::SslConnectError => 35,
            TransportError::BadFunctionArgument => 43,
            TransportError::TooManyRedirects => 47,
            TransportError::RecvError => 56,
            TransportError::BadCaBundle => 77,
            TransportError::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == TransportError::Ok
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportError::Ok => "no error",
            TransportError::UnsupportedProtocol => "unsupported protocol",
            TransportError::MalformedUrl => "malformed URL",
            TransportError::CouldNotResolveProxy => "could not resolve proxy",
            TransportError::CouldNotResolveHost => "could not resolve host",
            TransportError::CouldNotConnect => "could not connect",
            TransportError::TimedOut => "timed out",
            TransportError::SslConnectError => "TLS handshake failed",
            TransportError::BadFunctionArgument => "bad argument",
            TransportError::TooManyRedirects => "too many redirects",
            TransportError::RecvError => "failure receiving data",
            TransportError::BadCaBundle => "cannot load CA bundle",
            TransportError::Other(code) => return write!(f, "transport error {code}"),
        };
        f.write_str(text)
    }
}

/// A pending HTTP exchange. Configure it, then `perform` it once.
pub struct Request {
    engine: Arc<dyn HttpEngine>,
    slot: HandleSlot<RequestHandle>,
}

impl Request {
    pub fn new(engine: Arc<dyn HttpEngine>) -> Result<Self, BindingError> {
        let handle = engine
            .request_new()
            .ok_or(BindingError::AllocationFailed(ResourceKind::Request))?;
        Ok(Self {
            engine,
            slot: HandleSlot::new(handle),
        })
    }

    /// Request on a fresh `UreqEngine` with default settings.
    pub fn with_builtin_engine() -> Result<Self, BindingError> {
        Self::new(Arc::new(UreqEngine::default()))
    }

    fn configure(&mut self, f: impl FnOnce(&dyn HttpEngine, RequestHandle)) -> &mut Self {
        let engine = &*self.engine;
        self.slot.with(|handle| f(engine, handle));
        self
    }

    pub fn set_ca_bundle_path(&mut self, path: &str) -> &mut Self {
        self.configure(|e, h| e.request_set_ca_bundle_path(h, path))
    }

    pub fn enable_http2(&mut self) -> &mut Self {
        self.configure(|e, h| e.request_enable_http2(h))
    }

    pub fn set_method_post(&mut self) -> &mut Self {
        self.configure(|e, h| e.request_set_method_post(h))
    }

    pub fn set_url(&mut self, url: &str) -> &mut Self {
        self.configure(|e, h| e.request_set_url(h, url))
    }

    /// Append one raw `Name: value` line. Order is preserved.
    pub fn add_header(&mut self, header: &str) -> &mut Self {
        self.configure(|e, h| e.request_add_header(h, header))
    }

    pub fn set_body(&mut self, body: impl AsRef<[u8]>) -> &mut Self {
        self.configure(|e, h| e.request_set_body(h, body.as_ref()))
    }

    /// Bound the whole exchange. Zero means the engine default.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.configure(|e, h| e.request_set_timeout(h, timeout))
    }

    pub fn set_proxy_url(&mut self, url: &str) -> &mut Self {
        self.configure(|e, h| e.request_set_proxy_url(h, url))
    }

    pub fn enable_follow_redirect(&mut self) -> &mut Self {
        self.configure(|e, h| e.request_enable_follow_redirect(h))
    }

    /// Run the exchange, blocking the calling thread. The request is released
    /// whatever the outcome.
    pub fn perform(self) -> Result<Response, BindingError> {
        let handle = self
            .slot
            .take()
            .ok_or(BindingError::Released(ResourceKind::Request))?;
        let response = self.engine.perform(handle);
        self.engine.request_delete(handle);
        let response = response.ok_or(BindingError::PerformFailed)?;
        debug!(?response, "exchange performed");
        Ok(Response {
            engine: Arc::clone(&self.engine),
            slot: HandleSlot::new(response),
        })
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.slot.take() {
            self.engine.request_delete(handle);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("handle", &self.slot).finish()
    }
}

/// The read-only result of one exchange.
pub struct Response {
    engine: Arc<dyn HttpEngine>,
    slot: HandleSlot<ResponseHandle>,
}

impl Response {
    fn read<T>(
        &self,
        field: &'static str,
        get: impl FnOnce(&dyn HttpEngine, ResponseHandle) -> Option<T>,
    ) -> Result<T, BindingError> {
        let engine = &*self.engine;
        self.slot
            .with(|handle| get(engine, handle))
            .ok_or(BindingError::Released(ResourceKind::Response))?
            .ok_or(BindingError::MissingField(field))
    }

    /// Raw transport code; zero means the exchange succeeded. A closed
    /// response reports `BadFunctionArgument`.
    pub fn error(&self) -> i64 {
        self.slot
            .with(|handle| self.engine.response_error(handle))
            .unwrap_or(TransportError::BadFunctionArgument.code())
    }

    pub fn transport_error(&self) -> TransportError {
        TransportError::from_code(self.error())
    }

    pub fn is_success(&self) -> bool {
        self.error() == 0
    }

    pub fn status_code(&self) -> Result<u16, BindingError> {
        self.read("status code", |e, h| e.response_status_code(h))
    }

    pub fn redirect_url(&self) -> Result<String, BindingError> {
        self.read("redirect URL", |e, h| e.response_redirect_url(h))
    }

    pub fn body(&self) -> Result<Vec<u8>, BindingError> {
        self.read("body", |e, h| e.response_body(h))
    }

    pub fn bytes_sent(&self) -> f64 {
        self.slot
            .with(|handle| self.engine.response_bytes_sent(handle))
            .unwrap_or_default()
    }

    pub fn bytes_recv(&self) -> f64 {
        self.slot
            .with(|handle| self.engine.response_bytes_recv(handle))
            .unwrap_or_default()
    }

    pub fn logs(&self) -> Result<Vec<u8>, BindingError> {
        self.read("logs", |e, h| e.response_logs(h))
    }

    pub fn request_headers(&self) -> Result<String, BindingError> {
        self.read("request headers", |e, h| e.response_request_headers(h))
    }

    pub fn response_headers(&self) -> Result<Vec<u8>, BindingError> {
        self.read("response headers", |e, h| e.response_response_headers(h))
    }

    pub fn certificate_chain(&self) -> Result<String, BindingError> {
        self.read("certificate chain", |e, h| e.response_certificate_chain(h))
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.slot.take() {
            self.engine.response_delete(handle);
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("handle", &self.slot)
            .field("error", &self.transport_error())
            .finish()
    }
}
