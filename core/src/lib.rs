//! Typed bindings for a measurement engine: an asynchronous task/event
//! pipeline and a synchronous HTTP exchange.
//!
//! # Overview
//! The binding types (`TaskRunner`, `Task`, `Event`, `Request`, `Response`)
//! own opaque engine handles and release each exactly once. They talk to the
//! engine only through the `TaskEngine` and `HttpEngine` traits, so any
//! implementation can sit underneath.
//!
//! # Design
//! - Handles are typed per resource kind (`handle`), so mixing a task handle
//!   with an event handle does not compile.
//! - "Could not even start" is a `BindingError`; a finished exchange that
//!   failed on the wire is a `Response` carrying a `TransportError` code.
//! - Two engines ship with the crate: `ThreadedEngine` runs `Nettest`
//!   plug-ins on worker threads, and `UreqEngine` performs real HTTP
//!   exchanges with `ureq`.
//! - `geoip` reads the probe IP out of a lookup `Response` and resolves it
//!   against a local MaxMind database.

pub mod engine;
pub mod error;
pub mod exchange;
pub mod geoip;
pub mod handle;
pub mod http;
pub mod nettest;
pub mod runner;
pub mod task;
pub mod types;

pub use engine::{HttpEngine, TaskEngine};
pub use error::{BindingError, ResourceKind};
pub use exchange::{ExchangeDefaults, UreqEngine};
pub use geoip::{parse_probe_ip, probe_ip, ubuntu_get_url, Mmdb, UBUNTU_LOOKUP_URL};
pub use handle::{EventHandle, Handle, HandleSlot, HandleTable, RequestHandle, ResponseHandle, TaskHandle};
pub use http::{Request, Response, TransportError};
pub use nettest::{DataUsage, MeasureContext, Nettest, NettestRegistry, TcpConnect};
pub use runner::ThreadedEngine;
pub use task::{Canceller, Event, Events, Task, TaskRunner};
pub use types::{EventRecord, LogLevel, OptionValue, Settings};
