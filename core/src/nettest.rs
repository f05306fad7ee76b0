//! Pluggable measurements run by the built-in engine.
//!
//! A `Nettest` measures one input at a time and returns its `test_keys`.
//! The engine owns everything around it: settings, per-input events,
//! progress, interruption and the final `status.end`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::types::{LogLevel, OptionValue};

/// A measurement the engine can run by name.
pub trait Nettest: Send + Sync {
    /// Whether the nettest refuses to run without inputs.
    fn needs_input(&self) -> bool {
        false
    }

    fn measure(&self, ctx: &MeasureContext<'_>, input: Option<&str>) -> Result<Value, String>;
}

/// Bytes moved by a task, reported in `status.end`.
#[derive(Debug, Default)]
pub struct DataUsage {
    down: AtomicU64,
    up: AtomicU64,
}

impl DataUsage {
    pub fn add(&self, down: u64, up: u64) {
        self.down.fetch_add(down, Ordering::Relaxed);
        self.up.fetch_add(up, Ordering::Relaxed);
    }

    pub fn downloaded_kb(&self) -> f64 {
        self.down.load(Ordering::Relaxed) as f64 / 1024.0
    }

    pub fn uploaded_kb(&self) -> f64 {
        self.up.load(Ordering::Relaxed) as f64 / 1024.0
    }
}

/// What a nettest may see and do while measuring.
pub struct MeasureContext<'a> {
    options: &'a BTreeMap<String, OptionValue>,
    log: &'a (dyn Fn(LogLevel, &str) + Sync),
    interrupted: &'a AtomicBool,
    usage: &'a DataUsage,
}

impl<'a> MeasureContext<'a> {
    pub fn new(
        options: &'a BTreeMap<String, OptionValue>,
        log: &'a (dyn Fn(LogLevel, &str) + Sync),
        interrupted: &'a AtomicBool,
        usage: &'a DataUsage,
    ) -> Self {
        Self {
            options,
            log,
            interrupted,
            usage,
        }
    }

    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    pub fn option_f64(&self, name: &str) -> Option<f64> {
        self.option(name).and_then(OptionValue::as_f64)
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        (self.log)(level, message)
    }

    /// True once the task was asked to stop. Long measurements should poll it.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn account(&self, down: u64, up: u64) {
        self.usage.add(down, up)
    }
}

/// Nettests known to an engine, keyed by the `name` setting.
#[derive(Clone, Default)]
pub struct NettestRegistry {
    nettests: HashMap<String, Arc<dyn Nettest>>,
}

impl NettestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the nettests this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("TcpConnect", TcpConnect);
        registry
    }

    pub fn register(&mut self, name: &str, nettest: impl Nettest + 'static) -> &mut Self {
        self.nettests.insert(name.to_string(), Arc::new(nettest));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Nettest>> {
        self.nettests.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nettests.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for NettestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NettestRegistry")
            .field("nettests", &self.names())
            .finish()
    }
}

/// Connects to each `host:port` input and records whether it succeeded.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnect;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl Nettest for TcpConnect {
    fn needs_input(&self) -> bool {
        true
    }

    fn measure(&self, ctx: &MeasureContext<'_>, input: Option<&str>) -> Result<Value, String> {
        let input = input.ok_or_else(|| "TcpConnect needs a host:port input".to_string())?;
        let timeout = ctx
            .option_f64("timeout")
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|d| !d.is_zero())
            .unwrap_or(TCP_CONNECT_TIMEOUT);

        let addrs: Vec<_> = match input.to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                ctx.log(LogLevel::Info, &format!("cannot resolve {input}: {err}"));
                return Ok(json!({ "connection": "dns_lookup_error" }));
            }
        };

        let mut failure = String::from("dns_lookup_error");
        for addr in addrs {
            if ctx.is_interrupted() {
                failure = "interrupted".to_string();
                break;
            }
            ctx.log(LogLevel::Debug, &format!("connecting to {addr}"));
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(_) => return Ok(json!({ "connection": "success" })),
                Err(err) => {
                    failure = match err.kind() {
                        std::io::ErrorKind::ConnectionRefused => "connection_refused".to_string(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                            "generic_timeout_error".to_string()
                        }
                        _ => format!("connect_error: {err}"),
                    };
                    ctx.log(LogLevel::Info, &format!("connect to {addr} failed: {err}"));
                }
            }
        }
        Ok(json!({ "connection": failure }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Mutex;

    fn run_tcp_connect(input: &str) -> Value {
        let options = BTreeMap::new();
        let logs = Mutex::new(Vec::new());
        let log = |level: LogLevel, msg: &str| logs.lock().unwrap().push(format!("{level}: {msg}"));
        let interrupted = AtomicBool::new(false);
        let usage = DataUsage::default();
        let ctx = MeasureContext::new(&options, &log, &interrupted, &usage);
        TcpConnect.measure(&ctx, Some(input)).unwrap()
    }

    #[test]
    fn tcp_connect_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let keys = run_tcp_connect(&addr.to_string());
        assert_eq!(keys["connection"], "success");
    }

    #[test]
    fn tcp_connect_reports_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let keys = run_tcp_connect(&addr.to_string());
        assert_ne!(keys["connection"], "success");
    }

    #[test]
    fn tcp_connect_requires_input() {
        let options = BTreeMap::new();
        let log = |_: LogLevel, _: &str| {};
        let interrupted = AtomicBool::new(false);
        let usage = DataUsage::default();
        let ctx = MeasureContext::new(&options, &log, &interrupted, &usage);
        assert!(TcpConnect.measure(&ctx, None).is_err());
    }

    #[test]
    fn registry_lists_builtin_names() {
        let registry = NettestRegistry::builtin();
        assert_eq!(registry.names(), vec!["TcpConnect"]);
        assert!(registry.get("TcpConnect").unwrap().needs_input());
        assert!(registry.get("Ndt").is_none());
    }

    #[test]
    fn data_usage_reports_kilobytes() {
        let usage = DataUsage::default();
        usage.add(2048, 512);
        assert_eq!(usage.downloaded_kb(), 2.0);
        assert_eq!(usage.uploaded_kb(), 0.5);
    }
}
