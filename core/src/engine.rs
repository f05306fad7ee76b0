//! The operations the binding layer consumes from an engine.
//!
//! # Design
//! An engine owns the real resources and names them with typed handles.
//! `None` stands for the invalid handle (or an absent value). Callers must
//! only pass handles that are still live; the binding types in `task` and
//! `http` guarantee this by releasing each handle exactly once.
//!
//! The crate ships one implementation of each trait (`runner::ThreadedEngine`
//! and `exchange::UreqEngine`), but anything implementing them can be plugged
//! into `TaskRunner` and `Request`.

use std::time::Duration;

use crate::handle::{EventHandle, RequestHandle, ResponseHandle, TaskHandle};

/// Runs measurement tasks and produces their events.
pub trait TaskEngine: Send + Sync {
    /// Start a task from an opaque configuration blob. Does not block until
    /// the task completes.
    fn task_start(&self, config: &str) -> Option<TaskHandle>;

    fn task_is_done(&self, task: TaskHandle) -> bool;

    /// Block until the next event is available. `None` means end-of-stream.
    fn task_wait_next_event(&self, task: TaskHandle) -> Option<EventHandle>;

    fn task_interrupt(&self, task: TaskHandle);

    fn task_destroy(&self, task: TaskHandle);

    fn event_serialize(&self, event: EventHandle) -> Option<String>;

    fn event_destroy(&self, event: EventHandle);
}

/// Performs single blocking HTTP exchanges.
pub trait HttpEngine: Send + Sync {
    fn request_new(&self) -> Option<RequestHandle>;

    fn request_set_ca_bundle_path(&self, request: RequestHandle, path: &str);

    fn request_enable_http2(&self, request: RequestHandle);

    fn request_set_method_post(&self, request: RequestHandle);

    fn request_set_url(&self, request: RequestHandle, url: &str);

    fn request_add_header(&self, request: RequestHandle, header: &str);

    fn request_set_body(&self, request: RequestHandle, body: &[u8]);

    fn request_set_timeout(&self, request: RequestHandle, timeout: Duration);

    fn request_set_proxy_url(&self, request: RequestHandle, url: &str);

    fn request_enable_follow_redirect(&self, request: RequestHandle);

    fn request_delete(&self, request: RequestHandle);

    /// Run the exchange, blocking the calling thread. `None` means the
    /// exchange could not even be initiated.
    fn perform(&self, request: RequestHandle) -> Option<ResponseHandle>;

    fn response_error(&self, response: ResponseHandle) -> i64;

    /// HTTP status of the final response, absent when none was received.
    fn response_status_code(&self, response: ResponseHandle) -> Option<u16>;

    fn response_redirect_url(&self, response: ResponseHandle) -> Option<String>;

    fn response_body(&self, response: ResponseHandle) -> Option<Vec<u8>>;

    fn response_bytes_sent(&self, response: ResponseHandle) -> f64;

    fn response_bytes_recv(&self, response: ResponseHandle) -> f64;

    fn response_logs(&self, response: ResponseHandle) -> Option<Vec<u8>>;

    fn response_request_headers(&self, response: ResponseHandle) -> Option<String>;

    fn response_response_headers(&self, response: ResponseHandle) -> Option<Vec<u8>>;

    fn response_certificate_chain(&self, response: ResponseHandle) -> Option<String>;

    fn response_delete(&self, response: ResponseHandle);
}
