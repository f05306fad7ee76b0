//! C-ABI wrapper around `mk-core`.
//!
//! # Overview
//! Exposes the task/event pipeline (`mk_task_*`, `mk_event_*`), the HTTP
//! exchange (`mkcurl_request_*`, `mkcurl_perform`, `mkcurl_response_*`) and
//! the GeoIP helpers (`mkgeoip_*`) through `extern "C"` functions backed by
//! the built-in engines.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Objects are boxed and handed out as opaque pointers; each has a
//!   matching `*_destroy` / `*_delete` function that accepts null.
//! - Strings and buffers returned to C belong to the object that returned
//!   them and stay valid until that object is destroyed.
//! - Absent values are null pointers (strings) or `false` (binary getters).

pub mod types;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mk_core::{geoip, HttpEngine, Mmdb, Request, TaskRunner, TransportError, UreqEngine};
use tracing::warn;

use types::*;

fn task_runner() -> &'static TaskRunner {
    static RUNNER: OnceLock<TaskRunner> = OnceLock::new();
    RUNNER.get_or_init(TaskRunner::with_builtin_nettests)
}

fn http_engine() -> Arc<dyn HttpEngine> {
    static ENGINE: OnceLock<Arc<UreqEngine>> = OnceLock::new();
    let engine = ENGINE.get_or_init(|| Arc::new(UreqEngine::default()));
    Arc::clone(engine) as Arc<dyn HttpEngine>
}

/// Borrow a C string as UTF-8. Null and invalid UTF-8 both yield `None`.
fn c_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Start a task from a JSON settings string.
///
/// Returns null if `settings` is null or the engine refuses to start it.
/// The caller must release the task with `mk_task_destroy`.
#[unsafe(no_mangle)]
pub extern "C" fn mk_task_start(settings: *const c_char) -> *mut MkTask {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(settings) = c_str(settings) else {
            return std::ptr::null_mut();
        };
        match task_runner().start(settings) {
            Ok(task) => Box::into_raw(Box::new(MkTask { inner: task })),
            Err(err) => {
                warn!(%err, "mk_task_start");
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Non-blocking. A null task reports done.
#[unsafe(no_mangle)]
pub extern "C" fn mk_task_is_done(task: *const MkTask) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        if task.is_null() {
            return true;
        }
        unsafe { &*task }.inner.is_done()
    }))
    .unwrap_or(true)
}

/// Block until the next event. Null means end-of-stream.
///
/// The caller must release each event with `mk_event_destroy`.
#[unsafe(no_mangle)]
pub extern "C" fn mk_task_wait_for_next_event(task: *mut MkTask) -> *mut MkEvent {
    catch_unwind(AssertUnwindSafe(|| {
        if task.is_null() {
            return std::ptr::null_mut();
        }
        match unsafe { &*task }.inner.wait_for_next_event() {
            Some(event) => Box::into_raw(Box::new(MkEvent::new(event))),
            None => std::ptr::null_mut(),
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Ask the task to stop early. Keep draining events afterwards.
#[unsafe(no_mangle)]
pub extern "C" fn mk_task_interrupt(task: *mut MkTask) {
    if !task.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| unsafe { &*task }.inner.interrupt()));
    }
}

/// Release a task created by `mk_task_start`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn mk_task_destroy(task: *mut MkTask) {
    if !task.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(task) });
        }));
    }
}

/// Serialized event as a NUL-terminated JSON string, or null if the engine
/// has no payload. The string lives until `mk_event_destroy`.
#[unsafe(no_mangle)]
pub extern "C" fn mk_event_serialize(event: *mut MkEvent) -> *const c_char {
    if event.is_null() {
        return std::ptr::null();
    }
    catch_unwind(AssertUnwindSafe(|| unsafe { &mut *event }.serialized()))
        .unwrap_or(std::ptr::null())
}

/// Release an event. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn mk_event_destroy(event: *mut MkEvent) {
    if !event.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(event) });
        }));
    }
}

// ---------------------------------------------------------------------------
// HTTP requests
// ---------------------------------------------------------------------------

/// Create an empty GET request. The caller must release it with
/// `mkcurl_request_delete`.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_new() -> *mut MkRequest {
    catch_unwind(AssertUnwindSafe(|| match Request::new(http_engine()) {
        Ok(request) => Box::into_raw(Box::new(MkRequest {
            inner: Some(request),
        })),
        Err(err) => {
            warn!(%err, "mkcurl_request_new");
            std::ptr::null_mut()
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Run `f` on a live, not-yet-performed request. Null and spent requests
/// are ignored.
fn configure(request: *mut MkRequest, f: impl FnOnce(&mut Request)) {
    if request.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(inner) = unsafe { &mut *request }.inner.as_mut() {
            f(inner);
        }
    }));
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_set_ca_bundle_path(request: *mut MkRequest, path: *const c_char) {
    if let Some(path) = c_str(path) {
        configure(request, |r| {
            r.set_ca_bundle_path(path);
        });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_enable_http2(request: *mut MkRequest) {
    configure(request, |r| {
        r.enable_http2();
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_set_method_post(request: *mut MkRequest) {
    configure(request, |r| {
        r.set_method_post();
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_set_url(request: *mut MkRequest, url: *const c_char) {
    if let Some(url) = c_str(url) {
        configure(request, |r| {
            r.set_url(url);
        });
    }
}

/// Append one raw `Name: value` header line.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_add_header(request: *mut MkRequest, header: *const c_char) {
    if let Some(header) = c_str(header) {
        configure(request, |r| {
            r.add_header(header);
        });
    }
}

/// Copy `len` bytes from `data` as the request body. A null `data` with a
/// zero `len` sets an empty body.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_set_body(request: *mut MkRequest, data: *const u8, len: usize) {
    let body: &[u8] = if data.is_null() {
        if len != 0 {
            return;
        }
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }
    };
    configure(request, |r| {
        r.set_body(body);
    });
}

/// Bound the whole exchange to `seconds`. Zero restores the engine default;
/// negative values are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_set_timeout(request: *mut MkRequest, seconds: i64) {
    if let Ok(seconds) = u64::try_from(seconds) {
        configure(request, |r| {
            r.set_timeout(Duration::from_secs(seconds));
        });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_set_proxy_url(request: *mut MkRequest, url: *const c_char) {
    if let Some(url) = c_str(url) {
        configure(request, |r| {
            r.set_proxy_url(url);
        });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_enable_follow_redirect(request: *mut MkRequest) {
    configure(request, |r| {
        r.enable_follow_redirect();
    });
}

/// Release a request. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_request_delete(request: *mut MkRequest) {
    if !request.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(request) });
        }));
    }
}

/// Perform the exchange, blocking the calling thread.
///
/// Returns null if `request` is null, was already performed, or the engine
/// could not produce a response. A transport failure still yields a response
/// with a nonzero `mkcurl_response_get_error`. The request is spent either
/// way but must still be released with `mkcurl_request_delete`.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_perform(request: *mut MkRequest) -> *mut MkResponse {
    if request.is_null() {
        return std::ptr::null_mut();
    }
    catch_unwind(AssertUnwindSafe(|| {
        let Some(inner) = unsafe { &mut *request }.inner.take() else {
            return std::ptr::null_mut();
        };
        match inner.perform() {
            Ok(response) => Box::into_raw(Box::new(MkResponse::from_core(response))),
            Err(err) => {
                warn!(%err, "mkcurl_perform");
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

// ---------------------------------------------------------------------------
// HTTP responses
// ---------------------------------------------------------------------------

/// Run `f` on a response, or return `default` for null.
fn read<T>(response: *const MkResponse, default: T, f: impl FnOnce(&MkResponse) -> T) -> T {
    if response.is_null() {
        return default;
    }
    catch_unwind(AssertUnwindSafe(|| f(unsafe { &*response }))).unwrap_or(default)
}

/// Transport code, zero on success. A null response reports a bad argument.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_error(response: *const MkResponse) -> i64 {
    read(response, TransportError::BadFunctionArgument.code(), |r| r.error)
}

/// HTTP status of the final response, or zero when none was received.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_status_code(response: *const MkResponse) -> i64 {
    read(response, 0, |r| r.status_code.map_or(0, i64::from))
}

/// Redirect target when redirects were not followed, or null.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_redirect_url(response: *const MkResponse) -> *const c_char {
    read(response, std::ptr::null(), |r| c_str_ptr(r.redirect_url.as_ref()))
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_body(
    response: *const MkResponse,
    data: *mut *const u8,
    len: *mut usize,
) -> bool {
    read(response, false, |r| write_bytes(r.body.as_deref(), data, len))
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_bytes_sent(response: *const MkResponse) -> f64 {
    read(response, 0.0, |r| r.bytes_sent)
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_bytes_recv(response: *const MkResponse) -> f64 {
    read(response, 0.0, |r| r.bytes_recv)
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_logs(
    response: *const MkResponse,
    data: *mut *const u8,
    len: *mut usize,
) -> bool {
    read(response, false, |r| write_bytes(r.logs.as_deref(), data, len))
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_request_headers(
    response: *const MkResponse,
) -> *const c_char {
    read(response, std::ptr::null(), |r| c_str_ptr(r.request_headers.as_ref()))
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_response_headers(
    response: *const MkResponse,
    data: *mut *const u8,
    len: *mut usize,
) -> bool {
    read(response, false, |r| {
        write_bytes(r.response_headers.as_deref(), data, len)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_get_certificate_chain(
    response: *const MkResponse,
) -> *const c_char {
    read(response, std::ptr::null(), |r| {
        c_str_ptr(r.certificate_chain.as_ref())
    })
}

/// Release a response. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn mkcurl_response_delete(response: *mut MkResponse) {
    if !response.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(response) });
        }));
    }
}

// ---------------------------------------------------------------------------
// GeoIP
// ---------------------------------------------------------------------------

/// URL of Ubuntu's GeoIP lookup service. Static; never freed.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_ubuntu_get_url() -> *const c_char {
    static URL: OnceLock<Option<CString>> = OnceLock::new();
    c_str_ptr(
        URL.get_or_init(|| CString::new(geoip::ubuntu_get_url()).ok())
            .as_ref(),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_ubuntu_parser_new() -> *mut MkGeoipUbuntuParser {
    catch_unwind(|| Box::into_raw(Box::<MkGeoipUbuntuParser>::default()))
        .unwrap_or(std::ptr::null_mut())
}

/// Probe IP from a lookup response, or null when the exchange failed, the
/// status is not 200 or the body has no valid `<Ip>` element. The string
/// belongs to `parser` and is replaced by the next call.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_ubuntu_parser_get_probe_ip(
    parser: *mut MkGeoipUbuntuParser,
    response: *const MkResponse,
) -> *const c_char {
    if parser.is_null() || response.is_null() {
        return std::ptr::null();
    }
    catch_unwind(AssertUnwindSafe(|| {
        let parser = unsafe { &mut *parser };
        let response = unsafe { &*response };
        parser.probe_ip = None;
        if response.error != 0 || response.status_code != Some(200) {
            return std::ptr::null();
        }
        parser.probe_ip = response
            .body
            .as_deref()
            .and_then(geoip::parse_probe_ip)
            .and_then(|ip| CString::new(ip).ok());
        c_str_ptr(parser.probe_ip.as_ref())
    }))
    .unwrap_or(std::ptr::null())
}

/// Release a parser. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_ubuntu_parser_delete(parser: *mut MkGeoipUbuntuParser) {
    if !parser.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(parser) });
        }));
    }
}

/// Open the MaxMind database at `path`, or return null.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_mmdb_open(path: *const c_char) -> *mut MkGeoipMmdb {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(path) = c_str(path) else {
            return std::ptr::null_mut();
        };
        match Mmdb::open(path) {
            Ok(inner) => Box::into_raw(Box::new(MkGeoipMmdb { inner, saved: None })),
            Err(err) => {
                warn!(%err, "mkgeoip_mmdb_open");
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Run a lookup on a database, or return `default` for null arguments.
fn lookup<T>(
    mmdb: *mut MkGeoipMmdb,
    ip: *const c_char,
    default: T,
    f: impl FnOnce(&mut MkGeoipMmdb, &str) -> T,
) -> T {
    if mmdb.is_null() {
        return default;
    }
    let Some(ip) = c_str(ip) else {
        return default;
    };
    catch_unwind(AssertUnwindSafe(|| f(unsafe { &mut *mmdb }, ip))).unwrap_or(default)
}

/// Country code for `ip`, or null. The string belongs to `mmdb` and is
/// replaced by the next string lookup.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_mmdb_lookup_cc(mmdb: *mut MkGeoipMmdb, ip: *const c_char) -> *const c_char {
    lookup(mmdb, ip, std::ptr::null(), |db, ip| {
        let cc = db.inner.lookup_cc(ip);
        db.save(cc)
    })
}

/// Autonomous system number for `ip`, or zero.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_mmdb_lookup_asn(mmdb: *mut MkGeoipMmdb, ip: *const c_char) -> i64 {
    lookup(mmdb, ip, 0, |db, ip| db.inner.lookup_asn(ip).map_or(0, i64::from))
}

/// Organization owning the network of `ip`, or null. Same lifetime rules as
/// `mkgeoip_mmdb_lookup_cc`.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_mmdb_lookup_org(mmdb: *mut MkGeoipMmdb, ip: *const c_char) -> *const c_char {
    lookup(mmdb, ip, std::ptr::null(), |db, ip| {
        let org = db.inner.lookup_org(ip);
        db.save(org)
    })
}

/// Close a database. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn mkgeoip_mmdb_close(mmdb: *mut MkGeoipMmdb) {
    if !mmdb.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(mmdb) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn serialize(event: *mut MkEvent) -> serde_json::Value {
        let json = mk_event_serialize(event);
        assert!(!json.is_null());
        let text = unsafe { CStr::from_ptr(json) }.to_str().unwrap();
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn null_arguments_are_tolerated() {
        assert!(mk_task_start(std::ptr::null()).is_null());
        assert!(mk_task_is_done(std::ptr::null()));
        assert!(mk_task_wait_for_next_event(std::ptr::null_mut()).is_null());
        mk_task_interrupt(std::ptr::null_mut());
        mk_task_destroy(std::ptr::null_mut());
        assert!(mk_event_serialize(std::ptr::null_mut()).is_null());
        mk_event_destroy(std::ptr::null_mut());
        mkcurl_request_set_url(std::ptr::null_mut(), std::ptr::null());
        mkcurl_request_delete(std::ptr::null_mut());
        assert!(mkcurl_perform(std::ptr::null_mut()).is_null());
        assert_eq!(mkcurl_response_get_error(std::ptr::null()), 43);
        mkcurl_response_delete(std::ptr::null_mut());
    }

    #[test]
    fn invalid_settings_do_not_start() {
        let settings = CString::new("{oops").unwrap();
        assert!(mk_task_start(settings.as_ptr()).is_null());
    }

    #[test]
    fn task_drains_to_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let settings = CString::new(format!(
            r#"{{"name":"TcpConnect","inputs":["{}"],"log_level":"ERR"}}"#,
            listener.local_addr().unwrap()
        ))
        .unwrap();
        let task = mk_task_start(settings.as_ptr());
        assert!(!task.is_null());

        let mut keys = Vec::new();
        loop {
            let event = mk_task_wait_for_next_event(task);
            if event.is_null() {
                break;
            }
            keys.push(serialize(event)["key"].as_str().unwrap().to_string());
            mk_event_destroy(event);
        }
        assert!(mk_task_is_done(task));
        assert_eq!(keys.first().unwrap(), "status.queued");
        assert_eq!(keys.last().unwrap(), "status.end");
        mk_task_destroy(task);
    }

    #[test]
    fn event_text_is_stable_across_calls() {
        let settings = CString::new(r#"{"name":"Unknown"}"#).unwrap();
        let task = mk_task_start(settings.as_ptr());
        let event = mk_task_wait_for_next_event(task);
        let first = mk_event_serialize(event);
        let second = mk_event_serialize(event);
        assert_eq!(first, second);
        assert_eq!(serialize(event)["key"], "status.queued");
        mk_event_destroy(event);
        mk_task_interrupt(task);
        mk_task_destroy(task);
    }

    #[test]
    fn request_without_url_fails_on_the_wire() {
        let request = mkcurl_request_new();
        assert!(!request.is_null());
        let response = mkcurl_perform(request);
        assert!(!response.is_null());
        assert_eq!(mkcurl_response_get_error(response), 3);

        let mut data: *const u8 = std::ptr::null();
        let mut len = 0usize;
        assert!(!mkcurl_response_get_body(response, &mut data, &mut len));
        assert!(data.is_null());
        assert!(mkcurl_response_get_logs(response, &mut data, &mut len));
        assert!(len > 0);
        assert!(mkcurl_response_get_redirect_url(response).is_null());
        assert!(mkcurl_response_get_certificate_chain(response).is_null());

        assert!(mkcurl_perform(request).is_null(), "request is spent");
        mkcurl_request_delete(request);
        mkcurl_response_delete(response);
    }

    #[test]
    fn setters_on_spent_request_are_ignored() {
        let request = mkcurl_request_new();
        let response = mkcurl_perform(request);
        let url = CString::new("http://127.0.0.1:1/").unwrap();
        mkcurl_request_set_url(request, url.as_ptr());
        mkcurl_request_set_body(request, std::ptr::null(), 4);
        mkcurl_request_set_timeout(request, -1);
        mkcurl_request_delete(request);
        mkcurl_response_delete(response);
    }

    #[test]
    fn null_output_pointers_report_absent() {
        let request = mkcurl_request_new();
        let response = mkcurl_perform(request);
        let mut len = 0usize;
        assert!(!mkcurl_response_get_logs(response, std::ptr::null_mut(), &mut len));
        mkcurl_request_delete(request);
        mkcurl_response_delete(response);
    }

    #[test]
    fn geoip_handles_null_arguments() {
        assert!(mkgeoip_mmdb_open(std::ptr::null()).is_null());
        assert!(mkgeoip_mmdb_lookup_cc(std::ptr::null_mut(), std::ptr::null()).is_null());
        assert_eq!(mkgeoip_mmdb_lookup_asn(std::ptr::null_mut(), std::ptr::null()), 0);
        mkgeoip_mmdb_close(std::ptr::null_mut());

        let parser = mkgeoip_ubuntu_parser_new();
        assert!(mkgeoip_ubuntu_parser_get_probe_ip(parser, std::ptr::null()).is_null());
        assert!(mkgeoip_ubuntu_parser_get_probe_ip(std::ptr::null_mut(), std::ptr::null()).is_null());
        mkgeoip_ubuntu_parser_delete(parser);
        mkgeoip_ubuntu_parser_delete(std::ptr::null_mut());

        let url = unsafe { CStr::from_ptr(mkgeoip_ubuntu_get_url()) };
        assert_eq!(url.to_str().unwrap(), "https://geoip.ubuntu.com/lookup");
        assert_eq!(mkcurl_response_get_status_code(std::ptr::null()), 0);
    }
}
