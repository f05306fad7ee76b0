//! Run the configurations in `test-vectors/settings.json` through the
//! built-in engine and compare the emitted event keys.
//!
//! Events are parsed back into `EventRecord`s rather than compared as raw
//! strings, so field ordering inside payloads does not matter.

use std::sync::Arc;

use mk_core::{
    BindingError, EventRecord, MeasureContext, Nettest, NettestRegistry, TaskRunner,
    ThreadedEngine,
};
use serde_json::{json, Value};

struct Echo;

impl Nettest for Echo {
    fn measure(&self, ctx: &MeasureContext<'_>, input: Option<&str>) -> Result<Value, String> {
        ctx.log(mk_core::LogLevel::Info, "echoing");
        match input {
            Some("fail") => Err("generic_failure".to_string()),
            other => Ok(json!({ "echo": other })),
        }
    }
}

fn runner() -> TaskRunner {
    let mut registry = NettestRegistry::new();
    registry.register("Echo", Echo);
    TaskRunner::new(Arc::new(ThreadedEngine::new(registry)))
}

fn drain(runner: &TaskRunner, config: &str) -> Result<Vec<EventRecord>, BindingError> {
    let task = runner.start(config)?;
    Ok(task
        .events()
        .map(|event| serde_json::from_str(&event.serialize().unwrap()).unwrap())
        .collect())
}

#[test]
fn settings_test_vectors() {
    let raw = include_str!("../../test-vectors/settings.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();
    let runner = runner();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let config = case["config"].as_str().unwrap();
        let result = drain(&runner, config);

        if case["start_failed"].as_bool().unwrap_or(false) {
            assert_eq!(result.unwrap_err(), BindingError::StartFailed, "{name}");
            continue;
        }

        let records = result.unwrap_or_else(|err| panic!("{name}: {err}"));
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        let expected: Vec<&str> = case["keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k.as_str().unwrap())
            .collect();
        assert_eq!(keys, expected, "{name}: event keys");
    }
}

#[test]
fn startup_failure_payload_is_value_error() {
    let records = drain(&runner(), r#"{"name":"Missing"}"#).unwrap();
    let failure = records.iter().find(|r| r.key == "failure.startup").unwrap();
    assert_eq!(failure.value, json!({ "failure": "value_error" }));
    let log = records.iter().find(|r| r.key == "log").unwrap();
    assert_eq!(log.value["log_level"], "ERR");
}

#[test]
fn measurement_entry_round_trips() {
    let config = json!({
        "name": "Echo",
        "inputs": ["example.org:443"],
        "annotations": {"network_type": "wifi", "attempt": 2},
        "log_level": "ERR",
    });
    let records = drain(&runner(), &config.to_string()).unwrap();
    let measurement = records.iter().find(|r| r.key == "measurement").unwrap();
    assert_eq!(measurement.value["idx"], 0);

    let entry: Value =
        serde_json::from_str(measurement.value["json_str"].as_str().unwrap()).unwrap();
    assert_eq!(entry["test_name"], "Echo");
    assert_eq!(entry["input"], "example.org:443");
    assert_eq!(entry["test_keys"], json!({ "echo": "example.org:443" }));
    assert_eq!(entry["annotations"]["network_type"], "wifi");
    assert_eq!(entry["annotations"]["attempt"], "2");
    assert!(uuid::Uuid::parse_str(entry["id"].as_str().unwrap()).is_ok());
    assert!(entry["test_runtime"].as_f64().unwrap() >= 0.0);

    let end = records.last().unwrap();
    assert_eq!(end.key, "status.end");
    assert_eq!(end.value["failure"], Value::Null);
}
