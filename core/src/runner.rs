//! Built-in measurement engine: one worker thread per task.
//!
//! # Design
//! Each task owns a queue of events guarded by a mutex and a condition
//! variable. The worker pushes, the consumer pops with
//! `task_wait_next_event`. A task is done only once the worker finished AND
//! the queue is drained, so no event is lost at the end of the stream.
//!
//! An engine-wide gate lets a single measurement run at a time; tasks
//! started meanwhile emit `status.queued` and wait their turn. Interrupting
//! a queued task wakes it, and it ends with `status.end` without running.
//!
//! The configuration blob is parsed here. A blob that is not JSON at all is
//! rejected by `task_start`; every other problem is reported through
//! `log` + `failure.startup` events on a task that then ends normally.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::engine::TaskEngine;
use crate::handle::{EventHandle, Handle, HandleTable, TaskHandle};
use crate::nettest::{DataUsage, MeasureContext, NettestRegistry};
use crate::types::{
    is_known_event, EventRecord, LogLevel, OptionValue, Settings, KNOWN_EVENTS, KNOWN_SETTINGS,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Queue {
    events: VecDeque<EventRecord>,
    running: bool,
}

/// Lets one measurement run at a time. Waiters give up when interrupted.
#[derive(Default)]
struct Gate {
    busy: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn acquire<'a>(&'a self, interrupted: &AtomicBool) -> Option<GatePermit<'a>> {
        let busy = lock(&self.busy);
        let mut busy = self
            .cond
            .wait_while(busy, |busy| *busy && !interrupted.load(Ordering::Acquire))
            .unwrap_or_else(PoisonError::into_inner);
        if interrupted.load(Ordering::Acquire) {
            return None;
        }
        *busy = true;
        Some(GatePermit(self))
    }

    /// Wake every waiter so it can recheck its interrupt flag.
    fn wake(&self) {
        let _busy = lock(&self.busy);
        self.cond.notify_all();
    }
}

struct GatePermit<'a>(&'a Gate);

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        *lock(&self.0.busy) = false;
        self.0.cond.notify_all();
    }
}

struct TaskShared {
    queue: Mutex<Queue>,
    cond: Condvar,
    interrupted: AtomicBool,
    gate: Arc<Gate>,
}

impl TaskShared {
    fn new(gate: Arc<Gate>) -> Self {
        Self {
            queue: Mutex::new(Queue {
                events: VecDeque::new(),
                running: true,
            }),
            cond: Condvar::new(),
            interrupted: AtomicBool::new(false),
            gate,
        }
    }

    fn push(&self, record: EventRecord) {
        lock(&self.queue).events.push_back(record);
        self.cond.notify_all();
    }

    fn finish(&self) {
        lock(&self.queue).running = false;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        let queue = lock(&self.queue);
        !queue.running && queue.events.is_empty()
    }

    fn wait_next(&self) -> Option<EventRecord> {
        let queue = lock(&self.queue);
        let mut queue = self
            .cond
            .wait_while(queue, |q| q.running && q.events.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        queue.events.pop_front()
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.gate.wake();
    }
}

/// Marks the task finished even if the nettest panics.
struct FinishGuard<'a>(&'a TaskShared);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

struct TaskWorker {
    shared: Arc<TaskShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TaskWorker {
    fn stop(&self) {
        self.shared.interrupt();
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!("measurement worker panicked");
            }
        }
    }
}

/// In-process `TaskEngine` that runs registered nettests on worker threads.
pub struct ThreadedEngine {
    nettests: Arc<NettestRegistry>,
    gate: Arc<Gate>,
    tasks: HandleTable<TaskHandle, Arc<TaskWorker>>,
    events: HandleTable<EventHandle, String>,
}

impl ThreadedEngine {
    pub fn new(nettests: NettestRegistry) -> Self {
        Self {
            nettests: Arc::new(nettests),
            gate: Arc::new(Gate::default()),
            tasks: HandleTable::new(),
            events: HandleTable::new(),
        }
    }

    /// Tasks started and not yet destroyed.
    pub fn live_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Events popped and not yet destroyed.
    pub fn live_events(&self) -> usize {
        self.events.len()
    }
}

impl Default for ThreadedEngine {
    fn default() -> Self {
        Self::new(NettestRegistry::builtin())
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        for worker in self.tasks.drain() {
            worker.stop();
        }
    }
}

impl TaskEngine for ThreadedEngine {
    fn task_start(&self, config: &str) -> Option<TaskHandle> {
        let settings: Value = match serde_json::from_str(config) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(%err, "task configuration is not valid JSON");
                return None;
            }
        };

        let worker = Arc::new(TaskWorker {
            shared: Arc::new(TaskShared::new(Arc::clone(&self.gate))),
            thread: Mutex::new(None),
        });
        let handle = self.tasks.insert(Arc::clone(&worker))?;

        let shared = Arc::clone(&worker.shared);
        let nettests = Arc::clone(&self.nettests);
        let spawned = thread::Builder::new()
            .name(format!("mk-task-{}", handle.as_raw()))
            .spawn(move || run_worker(&shared, &nettests, settings));
        match spawned {
            Ok(thread) => {
                *lock(&worker.thread) = Some(thread);
                debug!(?handle, "task worker started");
                Some(handle)
            }
            Err(err) => {
                error!(%err, "cannot spawn measurement worker");
                self.tasks.remove(handle);
                None
            }
        }
    }

    fn task_is_done(&self, task: TaskHandle) -> bool {
        self.tasks
            .with(task, |worker| worker.shared.is_done())
            .unwrap_or(true)
    }

    fn task_wait_next_event(&self, task: TaskHandle) -> Option<EventHandle> {
        // Clone the worker out so the table is not locked while blocking.
        let worker = self.tasks.get_cloned(task)?;
        loop {
            let record = worker.shared.wait_next()?;
            match serde_json::to_string(&record) {
                Ok(json) => return self.events.insert(json),
                Err(err) => warn!(%err, key = %record.key, "dropping unserializable event"),
            }
        }
    }

    fn task_interrupt(&self, task: TaskHandle) {
        if self.tasks.with(task, |worker| worker.shared.interrupt()).is_some() {
            debug!(?task, "task interrupted");
        }
    }

    fn task_destroy(&self, task: TaskHandle) {
        if let Some(worker) = self.tasks.remove(task) {
            worker.stop();
            debug!(?task, "task destroyed");
        }
    }

    fn event_serialize(&self, event: EventHandle) -> Option<String> {
        self.events.get_cloned(event)
    }

    fn event_destroy(&self, event: EventHandle) {
        self.events.remove(event);
    }
}

fn run_worker(shared: &TaskShared, nettests: &NettestRegistry, settings: Value) {
    let _finish = FinishGuard(shared);
    shared.push(EventRecord::empty("status.queued"));
    let Some(_permit) = shared.gate.acquire(&shared.interrupted) else {
        debug!("task interrupted while queued");
        shared.push(EventRecord::new(
            "status.end",
            json!({ "downloaded_kb": 0.0, "uploaded_kb": 0.0, "failure": "interrupted" }),
        ));
        return;
    };
    let mut sink = EventSink::new(shared);
    run_task(&mut sink, shared, nettests, settings);
}

/// Routes events into the task queue, honoring disabled events, verbosity
/// and the optional log/output files.
struct EventSink<'a> {
    shared: &'a TaskShared,
    disabled: HashSet<String>,
    verbosity: LogLevel,
    log_file: Option<File>,
    output_file: Option<File>,
}

impl<'a> EventSink<'a> {
    fn new(shared: &'a TaskShared) -> Self {
        Self {
            shared,
            disabled: HashSet::new(),
            verbosity: LogLevel::default(),
            log_file: None,
            output_file: None,
        }
    }

    fn emit(&self, key: &str, value: Value) {
        if !is_known_event(key) {
            warn!(key, "refusing to emit unknown event");
            return;
        }
        if self.disabled.contains(key) {
            return;
        }
        self.shared.push(EventRecord::new(key, value));
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Err => error!(target: "mk::task", "{message}"),
            LogLevel::Warning => warn!(target: "mk::task", "{message}"),
            LogLevel::Info => info!(target: "mk::task", "{message}"),
            LogLevel::Debug => debug!(target: "mk::task", "{message}"),
            LogLevel::Debug2 => trace!(target: "mk::task", "{message}"),
        }
        if level > self.verbosity {
            return;
        }
        if let Some(mut file) = self.log_file.as_ref() {
            let _ = writeln!(file, "[{level}] {message}");
        }
        self.emit("log", json!({ "log_level": level.as_str(), "message": message }));
    }

    fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    fn startup_failure(&self, reason: &str) {
        self.log(LogLevel::Err, reason);
        self.emit("failure.startup", json!({ "failure": "value_error" }));
    }

    fn record_measurement(&self, entry: &str) {
        if let Some(mut file) = self.output_file.as_ref() {
            if let Err(err) = writeln!(file, "{entry}") {
                self.warning(&format!("cannot write measurement to output file: {err}"));
            }
        }
    }
}

/// Settings after validation, ready to drive a run.
struct Plan {
    name: String,
    options: BTreeMap<String, OptionValue>,
    annotations: BTreeMap<String, String>,
    inputs: Vec<String>,
}

fn run_task(sink: &mut EventSink<'_>, shared: &TaskShared, nettests: &NettestRegistry, settings: Value) {
    let Some(plan) = prepare(sink, nettests, settings) else {
        return;
    };
    let Some(nettest) = nettests.get(&plan.name) else {
        return;
    };

    sink.emit("status.started", json!({}));

    let usage = DataUsage::default();
    let mut failure: Option<String> = None;
    let inputs: Vec<Option<&str>> = if plan.inputs.is_empty() {
        if nettest.needs_input() {
            sink.log(LogLevel::Err, &format!("{} needs at least one input", plan.name));
            failure = Some("missing_input".to_string());
            Vec::new()
        } else {
            vec![None]
        }
    } else {
        plan.inputs.iter().map(|s| Some(s.as_str())).collect()
    };

    let sink = &*sink;
    let log = |level: LogLevel, message: &str| sink.log(level, message);
    let ctx = MeasureContext::new(&plan.options, &log, &shared.interrupted, &usage);
    let total = inputs.len();

    for (idx, input) in inputs.into_iter().enumerate() {
        if ctx.is_interrupted() {
            sink.log(LogLevel::Info, "task interrupted; skipping remaining inputs");
            failure = Some("interrupted".to_string());
            break;
        }
        sink.emit(
            "status.measurement_start",
            json!({ "idx": idx, "input": input.unwrap_or("") }),
        );
        let started = Instant::now();
        match nettest.measure(&ctx, input) {
            Ok(test_keys) => {
                let entry = json!({
                    "id": Uuid::new_v4().to_string(),
                    "test_name": plan.name,
                    "input": input,
                    "annotations": plan.annotations,
                    "test_keys": test_keys,
                    "test_runtime": started.elapsed().as_secs_f64(),
                });
                let entry = entry.to_string();
                sink.record_measurement(&entry);
                sink.emit("measurement", json!({ "idx": idx, "json_str": entry }));
            }
            Err(reason) => {
                sink.log(LogLevel::Warning, &format!("measurement {idx} failed: {reason}"));
                sink.emit("failure.measurement", json!({ "idx": idx, "failure": reason }));
            }
        }
        sink.emit("status.measurement_done", json!({ "idx": idx }));
        sink.emit(
            "status.progress",
            json!({
                "percentage": (idx + 1) as f64 / total as f64,
                "message": format!("measured input {}/{total}", idx + 1),
            }),
        );
    }

    sink.emit(
        "status.end",
        json!({
            "downloaded_kb": usage.downloaded_kb(),
            "uploaded_kb": usage.uploaded_kb(),
            "failure": failure,
        }),
    );
}

/// Validate the settings blob, configuring `sink` as a side effect. Emits the
/// startup failure and returns `None` when the task cannot run.
fn prepare(sink: &mut EventSink<'_>, nettests: &NettestRegistry, settings: Value) -> Option<Plan> {
    let mut map = match settings {
        Value::Object(map) => map,
        other => {
            sink.startup_failure(&format!(
                "invalid settings: expected a JSON object like {{\"name\": \"TcpConnect\"}}, found '{other}'"
            ));
            return None;
        }
    };

    let unknown: Vec<String> = map
        .keys()
        .filter(|key| !KNOWN_SETTINGS.contains(&key.as_str()))
        .cloned()
        .collect();
    for key in unknown {
        sink.warning(&format!("ignoring unknown setting '{key}'"));
        map.remove(&key);
    }

    let settings: Settings = match serde_json::from_value(Value::Object(map)) {
        Ok(settings) => settings,
        Err(err) => {
            sink.warning(&format!("invalid settings: {err}"));
            sink.startup_failure("failed to validate settings");
            return None;
        }
    };

    if nettests.get(&settings.name).is_none() {
        sink.startup_failure(&format!(
            "unknown task name '{}' (known tasks: {})",
            settings.name,
            nettests.names().join(", ")
        ));
        return None;
    }

    let mut options = BTreeMap::new();
    for (key, value) in &settings.options {
        let value = match value {
            // Empty strings mean "use the default".
            Value::String(s) if s.is_empty() => continue,
            Value::String(s) => OptionValue::Text(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => OptionValue::Int(i),
                None => OptionValue::Float(n.as_f64().unwrap_or_default()),
            },
            _ => {
                sink.startup_failure(&format!(
                    "option '{key}' has an invalid type (valid types: int, double, string)"
                ));
                return None;
            }
        };
        options.insert(key.clone(), value);
    }

    let annotations = match stringify_annotations(&settings.annotations) {
        Ok(annotations) => annotations,
        Err(key) => {
            sink.startup_failure(&format!(
                "annotation '{key}' has an invalid type (valid types: int, double, string)"
            ));
            return None;
        }
    };

    let mut inputs = Vec::new();
    for value in &settings.inputs {
        match value.as_str() {
            Some(input) => inputs.push(input.to_string()),
            None => {
                sink.startup_failure(&format!("input {value} is not a string"));
                return None;
            }
        }
    }
    for value in &settings.input_filepaths {
        let Some(path) = value.as_str() else {
            sink.startup_failure(&format!("input file path {value} is not a string"));
            return None;
        };
        match std::fs::read_to_string(path) {
            Ok(content) => inputs.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            ),
            Err(err) => {
                sink.startup_failure(&format!("cannot read input file '{path}': {err}"));
                return None;
            }
        }
    }

    if let Some(path) = &settings.log_filepath {
        match append_to(path) {
            Ok(file) => sink.log_file = Some(file),
            Err(err) => sink.warning(&format!("cannot open log file '{path}': {err}")),
        }
    }

    if let Some(path) = &settings.output_filepath {
        match append_to(path) {
            Ok(file) => sink.output_file = Some(file),
            Err(err) => {
                sink.startup_failure(&format!("cannot open output file '{path}': {err}"));
                return None;
            }
        }
    }

    if let Some(level) = &settings.log_level {
        match level.parse::<LogLevel>() {
            Ok(level) => sink.verbosity = level,
            Err(_) => {
                let known: Vec<&str> = LogLevel::ALL.iter().map(|l| l.as_str()).collect();
                sink.startup_failure(&format!(
                    "unknown log_level '{level}' (known levels: {})",
                    known.join(", ")
                ));
                return None;
            }
        }
    }

    for entry in &settings.disabled_events {
        let Some(key) = entry.as_str() else {
            sink.startup_failure(&format!("disabled_events entry {entry} is not a string"));
            return None;
        };
        if !is_known_event(key) {
            sink.warning(&format!(
                "ignoring unknown event '{key}' in disabled_events (known events: {})",
                KNOWN_EVENTS.join(", ")
            ));
            continue;
        }
        sink.disabled.insert(key.to_string());
    }

    Some(Plan {
        name: settings.name,
        options,
        annotations,
        inputs,
    })
}

fn stringify_annotations(annotations: &Map<String, Value>) -> Result<BTreeMap<String, String>, String> {
    annotations
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key.clone(), s.clone())),
            Value::Number(n) => Ok((key.clone(), n.to_string())),
            _ => Err(key.clone()),
        })
        .collect()
}

fn append_to(path: &str) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
