//! Opaque objects handed across the FFI boundary.
//!
//! # Design
//! Each C-visible object boxes one core binding type. Strings and byte
//! buffers returned to C are owned by the object that returned them and
//! stay valid until that object is destroyed, so C callers never free
//! individual fields.

use std::ffi::CString;
use std::os::raw::c_char;

use mk_core::{Event, Mmdb, Request, Response, Task};

/// A running or finished measurement task.
pub struct MkTask {
    pub(crate) inner: Task,
}

/// One event popped from a task.
///
/// The first `mk_event_serialize` consumes the core event; the text is cached
/// so later calls return the same pointer.
pub struct MkEvent {
    pub(crate) inner: Option<Event>,
    pub(crate) serialized: Option<CString>,
}

impl MkEvent {
    pub(crate) fn new(event: Event) -> Self {
        Self {
            inner: Some(event),
            serialized: None,
        }
    }

    pub(crate) fn serialized(&mut self) -> *const c_char {
        if self.serialized.is_none() {
            self.serialized = self
                .inner
                .take()
                .and_then(|event| event.serialize().ok())
                .and_then(|json| CString::new(json).ok());
        }
        self.serialized
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }
}

/// A pending HTTP request. Spent once passed to `mkcurl_perform`.
pub struct MkRequest {
    pub(crate) inner: Option<Request>,
}

/// Snapshot of a completed exchange.
///
/// Fields are read once from the core `Response`, which is then released.
pub struct MkResponse {
    pub(crate) error: i64,
    pub(crate) status_code: Option<u16>,
    pub(crate) redirect_url: Option<CString>,
    pub(crate) body: Option<Vec<u8>>,
    pub(crate) bytes_sent: f64,
    pub(crate) bytes_recv: f64,
    pub(crate) logs: Option<Vec<u8>>,
    pub(crate) request_headers: Option<CString>,
    pub(crate) response_headers: Option<Vec<u8>>,
    pub(crate) certificate_chain: Option<CString>,
}

impl MkResponse {
    pub(crate) fn from_core(mut response: Response) -> Self {
        let text = |s: Result<String, _>| s.ok().and_then(|s| CString::new(s).ok());
        let snapshot = Self {
            error: response.error(),
            status_code: response.status_code().ok(),
            redirect_url: text(response.redirect_url()),
            body: response.body().ok(),
            bytes_sent: response.bytes_sent(),
            bytes_recv: response.bytes_recv(),
            logs: response.logs().ok(),
            request_headers: text(response.request_headers()),
            response_headers: response.response_headers().ok(),
            certificate_chain: text(response.certificate_chain()),
        };
        response.close();
        snapshot
    }
}

/// Parser for Ubuntu GeoIP lookup responses. Holds the last probe IP.
#[derive(Default)]
pub struct MkGeoipUbuntuParser {
    pub(crate) probe_ip: Option<CString>,
}

/// An open MaxMind database plus the last string lookup result.
pub struct MkGeoipMmdb {
    pub(crate) inner: Mmdb,
    pub(crate) saved: Option<CString>,
}

impl MkGeoipMmdb {
    /// Keep `value` alive until the next lookup and return a pointer to it.
    pub(crate) fn save(&mut self, value: Option<String>) -> *const c_char {
        self.saved = value.and_then(|s| CString::new(s).ok());
        c_str_ptr(self.saved.as_ref())
    }
}

/// Point `data`/`len` at `bytes`. Returns false, leaving the outputs
/// untouched, when the field is absent or an output pointer is null.
pub(crate) fn write_bytes(bytes: Option<&[u8]>, data: *mut *const u8, len: *mut usize) -> bool {
    match bytes {
        Some(bytes) if !data.is_null() && !len.is_null() => {
            unsafe {
                *data = bytes.as_ptr();
                *len = bytes.len();
            }
            true
        }
        _ => false,
    }
}

pub(crate) fn c_str_ptr(s: Option<&CString>) -> *const c_char {
    s.map_or(std::ptr::null(), |s| s.as_ptr())
}
