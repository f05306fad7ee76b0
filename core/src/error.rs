//! Error types for the binding layer.
//!
//! # Design
//! Only failures that prevent a result from existing are errors here.
//! A completed exchange that failed on the wire is *not* an error: it is a
//! `Response` carrying a nonzero transport code, so diagnostics stay
//! inspectable. Disposal never produces an error.

use std::fmt;

/// The four kinds of engine-side resources a binding object can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Task,
    Event,
    Request,
    Response,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Task => "task",
            ResourceKind::Event => "event",
            ResourceKind::Request => "request",
            ResourceKind::Response => "response",
        };
        f.write_str(name)
    }
}

/// Errors returned by the binding types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    /// The engine returned an invalid handle when asked for a new resource.
    #[error("cannot allocate {0} resource")]
    AllocationFailed(ResourceKind),

    /// The engine could not start a task from the given configuration.
    #[error("engine could not start the task")]
    StartFailed,

    /// The engine could not even produce a response for the request.
    #[error("engine could not perform the request")]
    PerformFailed,

    /// The engine reported the field as absent on a completed result.
    #[error("engine reported a missing {0}")]
    MissingField(&'static str),

    /// The object's handle was already released.
    #[error("{0} handle already released")]
    Released(ResourceKind),

    /// A GeoIP database could not be opened or is not a MaxMind database.
    #[error("cannot open GeoIP database {path}: {reason}")]
    DatabaseOpen { path: String, reason: String },
}
