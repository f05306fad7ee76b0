//! Binding-side task/event pipeline.
//!
//! # Design
//! `TaskRunner` starts tasks on a `TaskEngine`; each `Task` and `Event` owns
//! exactly one engine handle and releases it exactly once, either through
//! `close` or on drop. Consumption is a blocking pull: `Task::events` wraps
//! `wait_for_next_event` in a finite iterator that a `Canceller` can end
//! early from another thread.
//!
//! A task should be drained to end-of-stream before it is closed, even after
//! an interrupt. Closing early is still safe: the engine discards whatever
//! was left in the queue.

use std::fmt;
use std::io;
use std::iter::FusedIterator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::engine::TaskEngine;
use crate::error::{BindingError, ResourceKind};
use crate::handle::{EventHandle, HandleSlot, TaskHandle};
use crate::runner::ThreadedEngine;

/// Starts measurement tasks on an engine.
#[derive(Clone)]
pub struct TaskRunner {
    engine: Arc<dyn TaskEngine>,
}

impl TaskRunner {
    pub fn new(engine: Arc<dyn TaskEngine>) -> Self {
        Self { engine }
    }

    /// Runner backed by a `ThreadedEngine` with the nettests this crate ships.
    pub fn with_builtin_nettests() -> Self {
        Self::new(Arc::new(ThreadedEngine::default()))
    }

    /// Start a task. The call returns as soon as the task is launched.
    ///
    /// `config` is handed to the engine untouched.
    pub fn start(&self, config: &str) -> Result<Task, BindingError> {
        let handle = self
            .engine
            .task_start(config)
            .ok_or(BindingError::StartFailed)?;
        debug!(?handle, "task started");
        Ok(Task {
            inner: Arc::new(TaskInner {
                engine: Arc::clone(&self.engine),
                slot: HandleSlot::new(handle),
                cancelled: AtomicBool::new(false),
            }),
        })
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner").finish_non_exhaustive()
    }
}

struct TaskInner {
    engine: Arc<dyn TaskEngine>,
    slot: HandleSlot<TaskHandle>,
    cancelled: AtomicBool,
}

impl TaskInner {
    fn interrupt(&self) {
        self.slot.with(|handle| self.engine.task_interrupt(handle));
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// One running or finished measurement.
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Non-blocking. A released task reports done.
    pub fn is_done(&self) -> bool {
        self.inner
            .slot
            .with(|handle| self.inner.engine.task_is_done(handle))
            .unwrap_or(true)
    }

    /// Block until the next event. `None` is end-of-stream, and is also what
    /// a closed task returns.
    pub fn wait_for_next_event(&self) -> Option<Event> {
        // Not `slot.with`: the slot lock must stay free for `Canceller` while
        // this blocks. Only `close(&mut self)` releases the handle, so it
        // cannot go away underneath us.
        let handle = self.inner.slot.get()?;
        let event = self.inner.engine.task_wait_next_event(handle)?;
        Some(Event {
            engine: Arc::clone(&self.inner.engine),
            slot: HandleSlot::new(event),
        })
    }

    /// Ask the task to stop early. Keep draining afterwards.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    /// Iterate over events until end-of-stream or cancellation.
    pub fn events(&self) -> Events<'_> {
        Events {
            task: self,
            finished: false,
        }
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Drain the task on a dedicated thread, forwarding each serialized event
    /// over a channel. The task is closed once the stream ends.
    ///
    /// If the receiver is dropped the task is interrupted and drained anyway.
    pub fn into_channel(self) -> io::Result<Receiver<String>> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("mk-task-drain".to_string())
            .spawn(move || {
                let mut task = self;
                let mut connected = true;
                for event in task.events() {
                    match event.serialize() {
                        Ok(json) => {
                            if connected && tx.send(json).is_err() {
                                debug!("event receiver dropped; interrupting task");
                                connected = false;
                                task.interrupt();
                            }
                        }
                        Err(err) => warn!(%err, "skipping event"),
                    }
                }
                // Close before the sender goes away so receivers observe a
                // released task once the channel disconnects.
                task.close();
            })?;
        Ok(rx)
    }

    /// Release the task. Safe to call at any point, and more than once.
    pub fn close(&mut self) {
        if let Some(handle) = self.inner.slot.take() {
            self.inner.engine.task_destroy(handle);
            debug!(?handle, "task closed");
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("handle", &self.inner.slot).finish()
    }
}

/// Blocking iterator over a task's events. Created by `Task::events`.
pub struct Events<'a> {
    task: &'a Task,
    finished: bool,
}

impl Iterator for Events<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.finished {
            return None;
        }
        let next = if self.task.inner.is_cancelled() {
            None
        } else {
            self.task.wait_for_next_event()
        };
        match next {
            // An event that arrives after cancellation is dropped, which
            // releases it.
            Some(event) if !self.task.inner.is_cancelled() => Some(event),
            _ => {
                self.finished = true;
                None
            }
        }
    }
}

impl FusedIterator for Events<'_> {}

/// Ends a task's `Events` iterator early from any thread.
#[derive(Clone)]
pub struct Canceller {
    inner: Arc<TaskInner>,
}

impl Canceller {
    /// Interrupts the task if it is still alive. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One record emitted by a task.
pub struct Event {
    engine: Arc<dyn TaskEngine>,
    slot: HandleSlot<EventHandle>,
}

impl Event {
    /// Serialize the event, then release it. The payload is passed through
    /// as the engine produced it.
    pub fn serialize(self) -> Result<String, BindingError> {
        let handle = self
            .slot
            .take()
            .ok_or(BindingError::Released(ResourceKind::Event))?;
        let json = self.engine.event_serialize(handle);
        self.engine.event_destroy(handle);
        json.ok_or(BindingError::MissingField("event payload"))
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.slot.take() {
            self.engine.event_destroy(handle);
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("handle", &self.slot).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of payloads and records every call.
    #[derive(Default)]
    struct ScriptedEngine {
        refuse: bool,
        payloads: Mutex<VecDeque<Option<String>>>,
        served: Mutex<Vec<Option<String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        fn with_payloads(payloads: &[Option<&str>]) -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(payloads.iter().map(|p| p.map(String::from)).collect()),
                ..Self::default()
            })
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TaskEngine for ScriptedEngine {
        fn task_start(&self, config: &str) -> Option<TaskHandle> {
            self.record(format!("start {config}"));
            if self.refuse {
                None
            } else {
                TaskHandle::from_raw(1)
            }
        }

        fn task_is_done(&self, _: TaskHandle) -> bool {
            self.payloads.lock().unwrap().is_empty()
        }

        fn task_wait_next_event(&self, _: TaskHandle) -> Option<EventHandle> {
            let payload = self.payloads.lock().unwrap().pop_front()?;
            let mut served = self.served.lock().unwrap();
            served.push(payload);
            EventHandle::from_raw(served.len() as u64)
        }

        fn task_interrupt(&self, _: TaskHandle) {
            self.record("interrupt".to_string());
        }

        fn task_destroy(&self, _: TaskHandle) {
            self.record("destroy task".to_string());
        }

        fn event_serialize(&self, event: EventHandle) -> Option<String> {
            let idx = event.as_raw() as usize - 1;
            self.served.lock().unwrap()[idx].clone()
        }

        fn event_destroy(&self, event: EventHandle) {
            self.record(format!("destroy {event:?}"));
        }
    }

    fn runner(engine: &Arc<ScriptedEngine>) -> TaskRunner {
        TaskRunner::new(Arc::clone(engine) as Arc<dyn TaskEngine>)
    }

    #[test]
    fn refused_start_is_start_failed() {
        let engine = Arc::new(ScriptedEngine {
            refuse: true,
            ..ScriptedEngine::default()
        });
        let err = runner(&engine).start("{}").unwrap_err();
        assert_eq!(err, BindingError::StartFailed);
    }

    #[test]
    fn events_come_out_in_engine_order() {
        let engine = ScriptedEngine::with_payloads(&[Some("a"), Some("b"), Some("c")]);
        let task = runner(&engine).start("cfg").unwrap();
        assert!(!task.is_done());
        let seen: Vec<String> = task.events().map(|e| e.serialize().unwrap()).collect();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(task.is_done());
        assert!(task.wait_for_next_event().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let engine = ScriptedEngine::with_payloads(&[]);
        let mut task = runner(&engine).start("cfg").unwrap();
        task.close();
        task.close();
        drop(task);
        let destroys = engine
            .calls()
            .iter()
            .filter(|c| *c == "destroy task")
            .count();
        assert_eq!(destroys, 1);
    }

    #[test]
    fn closed_task_is_done_and_empty() {
        let engine = ScriptedEngine::with_payloads(&[Some("a")]);
        let mut task = runner(&engine).start("cfg").unwrap();
        task.close();
        assert!(task.is_done());
        assert!(task.wait_for_next_event().is_none());
        task.interrupt();
        assert!(!engine.calls().contains(&"interrupt".to_string()));
    }

    #[test]
    fn serialize_releases_the_event_once() {
        let engine = ScriptedEngine::with_payloads(&[Some("a")]);
        let task = runner(&engine).start("cfg").unwrap();
        let event = task.wait_for_next_event().unwrap();
        assert_eq!(event.serialize().unwrap(), "a");
        let destroys = engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("destroy event"))
            .count();
        assert_eq!(destroys, 1);
    }

    #[test]
    fn closed_event_cannot_be_serialized() {
        let engine = ScriptedEngine::with_payloads(&[Some("a")]);
        let task = runner(&engine).start("cfg").unwrap();
        let mut event = task.wait_for_next_event().unwrap();
        event.close();
        event.close();
        assert_eq!(
            event.serialize().unwrap_err(),
            BindingError::Released(ResourceKind::Event)
        );
    }

    #[test]
    fn absent_payload_is_missing_field() {
        let engine = ScriptedEngine::with_payloads(&[None]);
        let task = runner(&engine).start("cfg").unwrap();
        let event = task.wait_for_next_event().unwrap();
        assert_eq!(
            event.serialize().unwrap_err(),
            BindingError::MissingField("event payload")
        );
    }

    #[test]
    fn cancel_ends_iteration_and_interrupts_once() {
        let engine = ScriptedEngine::with_payloads(&[Some("a"), Some("b"), Some("c")]);
        let task = runner(&engine).start("cfg").unwrap();
        let canceller = task.canceller();
        let mut events = task.events();
        assert!(events.next().is_some());
        canceller.cancel();
        canceller.cancel();
        assert!(canceller.is_cancelled());
        assert!(events.next().is_none());
        assert!(events.next().is_none());
        let interrupts = engine
            .calls()
            .iter()
            .filter(|c| *c == "interrupt")
            .count();
        assert_eq!(interrupts, 1);
    }

    #[test]
    fn channel_forwards_every_event_then_closes() {
        let engine = ScriptedEngine::with_payloads(&[Some("a"), Some("b")]);
        let task = runner(&engine).start("cfg").unwrap();
        let rx = task.into_channel().unwrap();
        let seen: Vec<String> = rx.iter().collect();
        assert_eq!(seen, vec!["a", "b"]);
        assert!(engine.calls().contains(&"destroy task".to_string()));
    }
}
