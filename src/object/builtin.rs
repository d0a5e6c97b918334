//! Builtin `echo` class.
//!
//! A small stateful object used by the server binary's default factory and by
//! the test suites. Arguments and results are JSON where structure is needed.
//!
//! | function  | args                       | result                       |
//! |-----------|----------------------------|------------------------------|
//! | `ping`    | ignored                    | `pong`                       |
//! | `echo`    | any bytes                  | the same bytes               |
//! | `slow_fn` | `{"ms": N, "value": V}`    | JSON of `V` after N ms       |
//! | `incr`    | optional JSON integer      | new counter as JSON          |
//! | `get`     | ignored                    | counter as JSON              |
//! | `fail`    | message bytes              | `ok = false` with message    |
//! | `panic`   | ignored                    | panics inside the object     |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::factory::FactoryTable;
use super::traits::{CallOutcome, HostedObject};
use crate::codec::{JsonCodec, Payload, PayloadCodec};
use crate::config::ConfigSnapshot;

pub const ECHO_CLASS: &str = "echo";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EchoState {
    name: String,
    counter: i64,
    history: Vec<String>,
    config_version: u64,
}

#[derive(Debug, Default, Deserialize)]
struct InitArgs {
    name: Option<String>,
    #[serde(default)]
    counter: i64,
}

#[derive(Debug, Deserialize)]
struct SlowArgs {
    ms: u64,
    #[serde(default)]
    value: Value,
}

/// Stateful demo object.
#[derive(Debug)]
pub struct EchoObject {
    class_name: String,
    state: Mutex<EchoState>,
}

impl EchoObject {
    pub fn new(class_name: impl Into<String>) -> Self {
        let class_name = class_name.into();
        Self {
            state: Mutex::new(EchoState { name: class_name.clone(), ..EchoState::default() }),
            class_name,
        }
    }

    /// Build from optional JSON init args: `{"name": "...", "counter": N}`.
    pub fn from_init_args(init_args: &Payload, config: &ConfigSnapshot) -> Result<Self, String> {
        let args: InitArgs = if init_args.is_empty() {
            InitArgs::default()
        } else {
            JsonCodec.decode(init_args).map_err(|e| e.to_string())?
        };

        let object = Self::new(ECHO_CLASS);
        {
            let mut state = object.state.lock();
            if let Some(name) = args.name {
                state.name = name;
            }
            state.counter = args.counter;
            state.config_version = config.version;
        }
        Ok(object)
    }

    fn record(&self, function: &str) {
        self.state.lock().history.push(function.to_string());
    }

    fn encode(value: &impl Serialize) -> CallOutcome {
        match JsonCodec.encode(value) {
            Ok(payload) => CallOutcome::success(payload),
            Err(e) => CallOutcome::failure(e.to_string()),
        }
    }
}

#[async_trait]
impl HostedObject for EchoObject {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    async fn invoke(&self, function: &str, args: Payload) -> CallOutcome {
        match function {
            "ping" => {
                self.record(function);
                CallOutcome::success("pong")
            }
            "echo" => {
                self.record(function);
                CallOutcome::success(args)
            }
            "slow_fn" => {
                let slow: SlowArgs = match JsonCodec.decode(&args) {
                    Ok(a) => a,
                    Err(e) => return CallOutcome::failure(e.to_string()),
                };
                tokio::time::sleep(Duration::from_millis(slow.ms)).await;
                self.record(function);
                Self::encode(&slow.value)
            }
            "incr" => {
                let by: i64 = if args.is_empty() {
                    1
                } else {
                    match JsonCodec.decode(&args) {
                        Ok(n) => n,
                        Err(e) => return CallOutcome::failure(e.to_string()),
                    }
                };
                let counter = {
                    let mut state = self.state.lock();
                    state.counter += by;
                    state.history.push(function.to_string());
                    state.counter
                };
                Self::encode(&counter)
            }
            "get" => {
                let counter = self.state.lock().counter;
                Self::encode(&counter)
            }
            "fail" => {
                self.record(function);
                CallOutcome::failure(String::from_utf8_lossy(args.as_bytes()).into_owned())
            }
            "panic" => panic!("object asked to panic"),
            _ => CallOutcome::failure("no such function"),
        }
    }

    async fn memory(&self) -> Payload {
        let state = self.state.lock().clone();
        JsonCodec.encode(&state).unwrap_or_default()
    }

    async fn fork(&self) -> Result<Arc<dyn HostedObject>, String> {
        let state = self.state.lock().clone();
        Ok(Arc::new(EchoObject { class_name: self.class_name.clone(), state: Mutex::new(state) }))
    }
}

/// Factory with the builtin classes registered.
pub fn factory() -> FactoryTable {
    FactoryTable::new().register(ECHO_CLASS, |args, config| {
        EchoObject::from_init_args(args, config).map(|o| Arc::new(o) as Arc<dyn HostedObject>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_and_missing_function() {
        let object = EchoObject::new(ECHO_CLASS);
        assert_eq!(object.invoke("ping", Payload::empty()).await, CallOutcome::success("pong"));

        let missing = object.invoke("missing_fn", Payload::empty()).await;
        assert!(!missing.ok);
        assert_eq!(missing.message, "no such function");
    }

    #[tokio::test]
    async fn test_fork_is_independent() {
        let object = EchoObject::new(ECHO_CLASS);
        object.invoke("incr", Payload::from("5")).await;

        let copy = object.fork().await.unwrap();
        copy.invoke("incr", Payload::empty()).await;

        assert_eq!(object.invoke("get", Payload::empty()).await.result, Payload::from("5"));
        assert_eq!(copy.invoke("get", Payload::empty()).await.result, Payload::from("6"));
    }

    #[tokio::test]
    async fn test_init_args_and_config_version() {
        let config = ConfigSnapshot { version: 3, ..ConfigSnapshot::default() };
        let object =
            EchoObject::from_init_args(&Payload::from(r#"{"name":"bob","counter":2}"#), &config)
                .unwrap();

        let memory: Value = JsonCodec.decode(&object.memory().await).unwrap();
        assert_eq!(memory["name"], "bob");
        assert_eq!(memory["counter"], 2);
        assert_eq!(memory["config_version"], 3);
    }

    #[tokio::test]
    async fn test_bad_init_args_rejected() {
        let err = EchoObject::from_init_args(&Payload::from("{nope"), &ConfigSnapshot::default())
            .unwrap_err();
        assert!(err.starts_with("json codec:"));
    }

    #[tokio::test]
    async fn test_slow_fn_returns_json_value() {
        let object = EchoObject::new(ECHO_CLASS);
        let outcome = object.invoke("slow_fn", Payload::from(r#"{"ms":1,"value":"done"}"#)).await;
        assert!(outcome.ok);
        assert_eq!(outcome.result, Payload::from(r#""done""#));
    }
}
