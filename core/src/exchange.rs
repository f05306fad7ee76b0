//! Built-in `HttpEngine` backed by a blocking `ureq` agent.
//!
//! # Design
//! Setters only record configuration; everything happens in `perform`, which
//! builds a one-shot agent for the accumulated settings and runs a single
//! exchange. Transport failures are folded into a curl-style code on the
//! response so callers can still read the logs and the request headers.
//!
//! The agent does not expose the wire bytes, so the header blobs and byte
//! counters are reconstructed from what was sent and received.

use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use ureq::http::Uri;
use ureq::tls::{parse_pem, PemItem, RootCerts, TlsConfig};
use ureq::{Agent, Proxy};

use crate::engine::HttpEngine;
use crate::handle::{HandleTable, RequestHandle, ResponseHandle};
use crate::http::TransportError;

/// Engine-wide settings applied when a request leaves them unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefaults {
    pub timeout: Duration,
    /// Redirect hops followed when a request enables redirects.
    pub max_redirects: u32,
    /// Largest response body read into memory.
    pub body_limit: u64,
}

impl Default for ExchangeDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            body_limit: 16 * 1024 * 1024,
        }
    }
}

/// Accumulated request configuration.
#[derive(Debug, Clone, Default)]
struct PendingRequest {
    ca_bundle_path: Option<String>,
    http2: bool,
    post: bool,
    url: Option<String>,
    headers: Vec<String>,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
    proxy_url: Option<String>,
    follow_redirect: bool,
}

/// Everything observed during one exchange.
#[derive(Debug, Default)]
struct Exchange {
    error: i64,
    status_code: Option<u16>,
    redirect_url: Option<String>,
    body: Option<Vec<u8>>,
    bytes_sent: f64,
    bytes_recv: f64,
    logs: Vec<u8>,
    request_headers: Option<String>,
    response_headers: Option<Vec<u8>>,
    certificate_chain: Option<String>,
}

/// Diagnostic log in curl's verbose style: `*` info, `>` sent, `<` received.
#[derive(Default)]
struct Transcript(String);

impl Transcript {
    fn line(&mut self, prefix: char, text: &str) {
        let _ = writeln!(self.0, "{prefix} {text}");
    }

    fn info(&mut self, text: &str) {
        self.line('*', text);
    }

    fn sent(&mut self, head: &str) {
        for line in head.lines().filter(|l| !l.is_empty()) {
            self.line('>', line);
        }
    }

    fn received(&mut self, head: &str) {
        for line in head.lines().filter(|l| !l.is_empty()) {
            self.line('<', line);
        }
    }
}

/// `HttpEngine` performing real exchanges with `ureq`.
#[derive(Default)]
pub struct UreqEngine {
    defaults: ExchangeDefaults,
    requests: HandleTable<RequestHandle, PendingRequest>,
    responses: HandleTable<ResponseHandle, Exchange>,
}

impl UreqEngine {
    pub fn new(defaults: ExchangeDefaults) -> Self {
        Self {
            defaults,
            requests: HandleTable::new(),
            responses: HandleTable::new(),
        }
    }

    pub fn defaults(&self) -> &ExchangeDefaults {
        &self.defaults
    }

    /// Requests created and not yet deleted.
    pub fn live_requests(&self) -> usize {
        self.requests.len()
    }

    /// Responses produced and not yet deleted.
    pub fn live_responses(&self) -> usize {
        self.responses.len()
    }

    fn update(&self, request: RequestHandle, f: impl FnOnce(&mut PendingRequest)) {
        if self.requests.with_mut(request, f).is_none() {
            warn!(?request, "ignoring setter on unknown request");
        }
    }

    fn read<T>(&self, response: ResponseHandle, f: impl FnOnce(&Exchange) -> T) -> Option<T> {
        self.responses.with(response, f)
    }
}

impl HttpEngine for UreqEngine {
    fn request_new(&self) -> Option<RequestHandle> {
        self.requests.insert(PendingRequest::default())
    }

    fn request_set_ca_bundle_path(&self, request: RequestHandle, path: &str) {
        self.update(request, |r| r.ca_bundle_path = Some(path.to_string()));
    }

    fn request_enable_http2(&self, request: RequestHandle) {
        self.update(request, |r| r.http2 = true);
    }

    fn request_set_method_post(&self, request: RequestHandle) {
        self.update(request, |r| r.post = true);
    }

    fn request_set_url(&self, request: RequestHandle, url: &str) {
        self.update(request, |r| r.url = Some(url.to_string()));
    }

    fn request_add_header(&self, request: RequestHandle, header: &str) {
        self.update(request, |r| r.headers.push(header.to_string()));
    }

    fn request_set_body(&self, request: RequestHandle, body: &[u8]) {
        self.update(request, |r| r.body = Some(body.to_vec()));
    }

    fn request_set_timeout(&self, request: RequestHandle, timeout: Duration) {
        self.update(request, |r| r.timeout = Some(timeout));
    }

    fn request_set_proxy_url(&self, request: RequestHandle, url: &str) {
        self.update(request, |r| r.proxy_url = Some(url.to_string()));
    }

    fn request_enable_follow_redirect(&self, request: RequestHandle) {
        self.update(request, |r| r.follow_redirect = true);
    }

    fn request_delete(&self, request: RequestHandle) {
        self.requests.remove(request);
    }

    fn perform(&self, request: RequestHandle) -> Option<ResponseHandle> {
        let pending = self.requests.get_cloned(request)?;
        let exchange = run_exchange(&self.defaults, &pending);
        debug!(
            url = pending.url.as_deref().unwrap_or(""),
            error = exchange.error,
            "exchange finished"
        );
        self.responses.insert(exchange)
    }

    fn response_error(&self, response: ResponseHandle) -> i64 {
        self.read(response, |x| x.error)
            .unwrap_or(TransportError::BadFunctionArgument.code())
    }

    fn response_status_code(&self, response: ResponseHandle) -> Option<u16> {
        self.read(response, |x| x.status_code).flatten()
    }

    fn response_redirect_url(&self, response: ResponseHandle) -> Option<String> {
        self.read(response, |x| x.redirect_url.clone()).flatten()
    }

    fn response_body(&self, response: ResponseHandle) -> Option<Vec<u8>> {
        self.read(response, |x| x.body.clone()).flatten()
    }

    fn response_bytes_sent(&self, response: ResponseHandle) -> f64 {
        self.read(response, |x| x.bytes_sent).unwrap_or_default()
    }

    fn response_bytes_recv(&self, response: ResponseHandle) -> f64 {
        self.read(response, |x| x.bytes_recv).unwrap_or_default()
    }

    fn response_logs(&self, response: ResponseHandle) -> Option<Vec<u8>> {
        self.read(response, |x| x.logs.clone())
    }

    fn response_request_headers(&self, response: ResponseHandle) -> Option<String> {
        self.read(response, |x| x.request_headers.clone()).flatten()
    }

    fn response_response_headers(&self, response: ResponseHandle) -> Option<Vec<u8>> {
        self.read(response, |x| x.response_headers.clone()).flatten()
    }

    fn response_certificate_chain(&self, response: ResponseHandle) -> Option<String> {
        self.read(response, |x| x.certificate_chain.clone()).flatten()
    }

    fn response_delete(&self, response: ResponseHandle) {
        self.responses.remove(response);
    }
}

fn run_exchange(defaults: &ExchangeDefaults, request: &PendingRequest) -> Exchange {
    let mut exchange = Exchange::default();
    let mut log = Transcript::default();
    if let Err(err) = exchange_into(defaults, request, &mut exchange, &mut log) {
        log.info(&format!("exchange failed: {err} (code {})", err.code()));
        exchange.error = err.code();
        exchange.status_code = None;
        exchange.body = None;
        exchange.response_headers = None;
        exchange.certificate_chain = None;
    }
    exchange.logs = log.0.into_bytes();
    exchange
}

fn exchange_into(
    defaults: &ExchangeDefaults,
    request: &PendingRequest,
    out: &mut Exchange,
    log: &mut Transcript,
) -> Result<(), TransportError> {
    let url = request.url.as_deref().ok_or(TransportError::MalformedUrl)?;
    let uri: Uri = url.parse().map_err(|_| TransportError::MalformedUrl)?;
    let tls = match uri.scheme_str() {
        Some("http") => false,
        Some("https") => true,
        Some(_) => return Err(TransportError::UnsupportedProtocol),
        None => return Err(TransportError::MalformedUrl),
    };
    let authority = uri
        .authority()
        .map(|a| a.as_str())
        .ok_or(TransportError::MalformedUrl)?;
    let headers = parse_headers(&request.headers)?;

    if request.http2 {
        log.info("HTTP/2 requested; continuing over HTTP/1.1");
    }
    if request.body.is_some() && !request.post {
        log.info("request body ignored for GET");
    }
    let agent = build_agent(defaults, request, log)?;

    let method = if request.post { "POST" } else { "GET" };
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in &headers {
        let _ = write!(head, "{name}: {value}\r\n");
    }
    head.push_str("\r\n");
    log.info(&format!("connecting to {authority}"));
    log.sent(&head);
    out.request_headers = Some(head.clone());

    let result = if request.post {
        let mut builder = agent.post(url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match &request.body {
            Some(body) => builder.send(&body[..]),
            None => builder.send_empty(),
        }
    } else {
        let mut builder = agent.get(url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.call()
    };
    let mut response = result.map_err(|err| classify(&err))?;

    let sent_body = match (&request.body, request.post) {
        (Some(body), true) => body.len(),
        _ => 0,
    };
    out.bytes_sent = (head.len() + sent_body) as f64;

    let status = response.status();
    let mut received = format!(
        "{:?} {} {}\r\n",
        response.version(),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        let _ = write!(
            received,
            "{}: {}\r\n",
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes())
        );
    }
    received.push_str("\r\n");
    log.received(&received);

    if status.is_redirection() && !request.follow_redirect {
        if let Some(location) = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
        {
            let target = resolve_location(&uri, location);
            log.info(&format!("not following redirect to {target}"));
            out.redirect_url = Some(target);
        }
    }

    let body = response
        .body_mut()
        .with_config()
        .limit(defaults.body_limit)
        .read_to_vec()
        .map_err(|err| classify(&err))?;
    log.info(&format!("received {} body bytes", body.len()));

    out.bytes_recv = (received.len() + body.len()) as f64;
    out.status_code = Some(status.as_u16());
    out.response_headers = Some(received.into_bytes());
    out.body = Some(body);
    if tls {
        log.info("certificate chain not exposed by this transport");
    } else {
        out.certificate_chain = Some(String::new());
    }
    Ok(())
}

fn build_agent(
    defaults: &ExchangeDefaults,
    request: &PendingRequest,
    log: &mut Transcript,
) -> Result<Agent, TransportError> {
    let timeout = request
        .timeout
        .filter(|t| !t.is_zero())
        .unwrap_or(defaults.timeout);
    let max_redirects = if request.follow_redirect {
        defaults.max_redirects
    } else {
        0
    };
    let mut config = Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(timeout))
        .max_redirects(max_redirects);

    if let Some(proxy_url) = &request.proxy_url {
        let proxy = Proxy::new(proxy_url).map_err(|_| TransportError::CouldNotResolveProxy)?;
        log.info(&format!("using proxy {proxy_url}"));
        config = config.proxy(Some(proxy));
    }

    if let Some(path) = &request.ca_bundle_path {
        let roots = load_ca_bundle(path).map_err(|err| {
            log.info(&format!("cannot load CA bundle {path}: {err}"));
            TransportError::BadCaBundle
        })?;
        log.info(&format!("trusting CA bundle {path}"));
        config = config.tls_config(
            TlsConfig::builder()
                .root_certs(RootCerts::Specific(Arc::new(roots)))
                .build(),
        );
    }

    Ok(config.build().new_agent())
}

fn load_ca_bundle(path: &str) -> io::Result<Vec<ureq::tls::Certificate<'static>>> {
    let pem = std::fs::read(path)?;
    let certs: Vec<_> = parse_pem(&pem)
        .filter_map(|item| match item {
            Ok(PemItem::Certificate(cert)) => Some(cert.to_owned()),
            _ => None,
        })
        .collect();
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates in bundle",
        ));
    }
    Ok(certs)
}

/// Split raw `Name: value` lines. A line without a name is a caller error.
fn parse_headers(lines: &[String]) -> Result<Vec<(String, String)>, TransportError> {
    lines
        .iter()
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or(TransportError::BadFunctionArgument)?;
            let name = name.trim();
            let valid = !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_graphic() && b != b':');
            if !valid {
                return Err(TransportError::BadFunctionArgument);
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Resolve a `Location` header against the URL that produced it, following
/// RFC 3986 section 5.2.
fn resolve_location(base: &Uri, location: &str) -> String {
    if has_scheme(location) {
        return location.to_string();
    }
    let scheme = base.scheme_str().unwrap_or("http");
    if let Some(rest) = location.strip_prefix("//") {
        return format!("{scheme}://{rest}");
    }
    let authority = base.authority().map_or("", |a| a.as_str());
    let base_path = if base.path().is_empty() { "/" } else { base.path() };
    let base_query = base.query().map(|q| format!("?{q}")).unwrap_or_default();

    let split = location.find(['?', '#']).unwrap_or(location.len());
    let (path, suffix) = location.split_at(split);
    let resolved = if path.is_empty() {
        if suffix.starts_with('#') || suffix.is_empty() {
            format!("{base_path}{base_query}{suffix}")
        } else {
            format!("{base_path}{suffix}")
        }
    } else if path.starts_with('/') {
        format!("{}{suffix}", remove_dot_segments(path))
    } else {
        let dir = &base_path[..base_path.rfind('/').map_or(0, |i| i + 1)];
        format!("{}{suffix}", remove_dot_segments(&format!("/{}{path}", dir.trim_start_matches('/'))))
    };
    format!("{scheme}://{authority}{resolved}")
}

/// `scheme ":"` prefix, as opposed to a relative reference.
fn has_scheme(location: &str) -> bool {
    match location.split_once(':') {
        Some((scheme, _)) => {
            let mut chars = scheme.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Drop `.` and `..` segments from an absolute path.
fn remove_dot_segments(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let last = segments.len().saturating_sub(1);
    let mut out: Vec<&str> = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "." => {}
            ".." => {
                out.pop();
            }
            other => {
                out.push(other);
                continue;
            }
        }
        if i == last {
            out.push("");
        }
    }
    format!("/{}", out.join("/"))
}

fn classify(err: &ureq::Error) -> TransportError {
    match err {
        ureq::Error::Timeout(_) => TransportError::TimedOut,
        ureq::Error::HostNotFound => TransportError::CouldNotResolveHost,
        ureq::Error::ConnectionFailed => TransportError::CouldNotConnect,
        ureq::Error::TooManyRedirects => TransportError::TooManyRedirects,
        ureq::Error::BadUri(_) => TransportError::MalformedUrl,
        ureq::Error::InvalidProxyUrl => TransportError::CouldNotResolveProxy,
        ureq::Error::Http(_) => TransportError::BadFunctionArgument,
        ureq::Error::Tls(_) => TransportError::SslConnectError,
        ureq::Error::Io(io) => match io.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::AddrNotAvailable => TransportError::CouldNotConnect,
            io::ErrorKind::TimedOut => TransportError::TimedOut,
            _ => TransportError::RecvError,
        },
        other => {
            let text = other.to_string().to_ascii_lowercase();
            if text.contains("tls") || text.contains("certificate") {
                TransportError::SslConnectError
            } else {
                TransportError::RecvError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perform(engine: &UreqEngine, setup: impl FnOnce(&UreqEngine, RequestHandle)) -> ResponseHandle {
        let req = engine.request_new().unwrap();
        setup(engine, req);
        let resp = engine.perform(req).unwrap();
        engine.request_delete(req);
        resp
    }

    fn logs(engine: &UreqEngine, resp: ResponseHandle) -> String {
        String::from_utf8(engine.response_logs(resp).unwrap()).unwrap()
    }

    #[test]
    fn missing_url_is_malformed() {
        let engine = UreqEngine::default();
        let resp = perform(&engine, |_, _| {});
        assert_eq!(engine.response_error(resp), 3);
        assert!(engine.response_body(resp).is_none());
        assert!(engine.response_request_headers(resp).is_none());
        assert!(logs(&engine, resp).starts_with("* exchange failed"));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let engine = UreqEngine::default();
        let resp = perform(&engine, |e, r| e.request_set_url(r, "ftp://example.org/file"));
        assert_eq!(engine.response_error(resp), 1);
    }

    #[test]
    fn bad_header_line_fails_before_connecting() {
        let engine = UreqEngine::default();
        let resp = perform(&engine, |e, r| {
            e.request_set_url(r, "http://127.0.0.1:1/");
            e.request_add_header(r, "no colon here");
        });
        assert_eq!(engine.response_error(resp), 43);
        assert!(!logs(&engine, resp).contains("connecting"));
    }

    #[test]
    fn unreadable_ca_bundle_is_reported() {
        let engine = UreqEngine::default();
        let resp = perform(&engine, |e, r| {
            e.request_set_url(r, "https://127.0.0.1:1/");
            e.request_set_ca_bundle_path(r, "/nonexistent/ca-bundle.pem");
        });
        assert_eq!(engine.response_error(resp), 77);
        assert!(engine.response_certificate_chain(resp).is_none());
    }

    #[test]
    fn deleted_handles_read_as_absent() {
        let engine = UreqEngine::default();
        let resp = perform(&engine, |_, _| {});
        assert_eq!(engine.live_requests(), 0);
        engine.response_delete(resp);
        assert_eq!(engine.live_responses(), 0);
        assert_eq!(engine.response_error(resp), 43);
        assert!(engine.response_logs(resp).is_none());
        assert_eq!(engine.response_bytes_sent(resp), 0.0);
    }

    #[test]
    fn perform_on_unknown_request_yields_nothing() {
        let engine = UreqEngine::default();
        let req = engine.request_new().unwrap();
        engine.request_delete(req);
        assert!(engine.perform(req).is_none());
    }

    #[test]
    fn headers_are_split_and_trimmed() {
        let lines = vec!["Accept: */*".to_string(), "X-Empty:".to_string()];
        let parsed = parse_headers(&lines).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("Accept".to_string(), "*/*".to_string()),
                ("X-Empty".to_string(), String::new()),
            ]
        );
        assert!(parse_headers(&[": value".to_string()]).is_err());
        assert!(parse_headers(&["Bad Name: v".to_string()]).is_err());
    }

    #[test]
    fn locations_resolve_against_the_request() {
        let base: Uri = "http://example.org:8080/a/b?q=1".parse().unwrap();
        assert_eq!(resolve_location(&base, "https://other.org/x"), "https://other.org/x");
        assert_eq!(resolve_location(&base, "//cdn.org/y"), "http://cdn.org/y");
        assert_eq!(resolve_location(&base, "/root"), "http://example.org:8080/root");
        assert_eq!(resolve_location(&base, "sibling"), "http://example.org:8080/a/sibling");
        assert_eq!(resolve_location(&base, "?page=2"), "http://example.org:8080/a/b?page=2");
        assert_eq!(resolve_location(&base, "#top"), "http://example.org:8080/a/b?q=1#top");
        assert_eq!(resolve_location(&base, "../up?x=1"), "http://example.org:8080/up?x=1");
        assert_eq!(resolve_location(&base, "./c/."), "http://example.org:8080/a/c/");
        assert_eq!(resolve_location(&base, "/x/../y"), "http://example.org:8080/y");
        assert_eq!(resolve_location(&base, "../../../z"), "http://example.org:8080/z");
    }

    #[test]
    fn defaults_bound_the_exchange() {
        let defaults = ExchangeDefaults::default();
        assert_eq!(defaults.timeout, Duration::from_secs(30));
        assert_eq!(UreqEngine::new(defaults.clone()).defaults(), &defaults);
    }

    #[test]
    fn unparsable_proxy_is_reported() {
        let engine = UreqEngine::default();
        let resp = perform(&engine, |e, r| {
            e.request_set_url(r, "http://127.0.0.1:1/");
            e.request_set_proxy_url(r, "not a proxy url");
        });
        assert_eq!(engine.response_error(resp), 5);
        assert!(!logs(&engine, resp).contains("connecting"));
    }

    #[test]
    fn ca_bundle_yields_its_certificates() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../test-vectors/ca-bundle.pem");
        assert_eq!(load_ca_bundle(path).unwrap().len(), 1);
    }

    #[test]
    fn ca_bundle_without_certificates_is_rejected() {
        let path = std::env::temp_dir().join(format!("mk-empty-bundle-{}.pem", std::process::id()));
        std::fs::write(&path, "not a certificate\n").unwrap();
        let err = load_ca_bundle(path.to_str().unwrap()).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
