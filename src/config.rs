//! Server configuration and the process-wide model configuration store.
//!
//! [`ServerConfig`] is fixed at startup (JSON file + CLI overrides).
//! [`ConfigStore`] holds the model configuration that clients push through
//! `SetConfig`: one writer at a time, readers take an immutable, versioned
//! [`ConfigSnapshot`] that is handed to every object construction.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// How calls on the same object are admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPolicy {
    /// One in-flight call per object; overlapping calls wait their turn.
    #[default]
    #[serde(rename = "serialize")]
    Serialized,
    /// One in-flight call per object; overlapping calls fail with backpressure.
    Reject,
    /// No per-object gate; the hosted object guards its own state.
    Concurrent,
}

impl std::str::FromStr for CallPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serialize" | "serialized" => Ok(CallPolicy::Serialized),
            "reject" => Ok(CallPolicy::Reject),
            "concurrent" => Ok(CallPolicy::Concurrent),
            other => Err(Error::InvalidConfig(format!(
                "unknown call policy `{}` (expected serialize, reject or concurrent)",
                other
            ))),
        }
    }
}

/// Startup configuration for the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gRPC server binds to
    pub listen_addr: SocketAddr,
    /// Maximum number of live objects (0 = unbounded)
    pub max_objects: usize,
    /// Per-object call admission
    pub call_policy: CallPolicy,
    /// Async calls executing at once
    pub max_workers: usize,
    /// Async calls allowed to wait for a worker
    pub max_queued: usize,
    /// Maximum placeholders held (pending + resolved)
    pub result_capacity: usize,
    /// Resolved placeholders are evicted after this long
    #[serde(with = "duration_secs")]
    pub result_ttl: Duration,
    /// How often the placeholder sweeper runs
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// How long a placeholder-valued argument may be waited on
    #[serde(with = "duration_millis")]
    pub dependency_wait: Duration,
    /// Upper bound for a client-requested fetch wait
    #[serde(with = "duration_millis")]
    pub max_fetch_wait: Duration,
    /// Root directory served by `DownloadFile` (None disables downloads)
    pub download_root: Option<PathBuf>,
    /// Chunk size for downloads
    pub download_chunk_size: usize,
    /// How long in-flight work may drain after Stop
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
    /// Class used when a create request names none
    pub default_class: String,
    /// OTLP collector endpoint; tracing export is off when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 12310)),
            max_objects: 0,
            call_policy: CallPolicy::Serialized,
            max_workers: 8,
            max_queued: 256,
            result_capacity: 8192,
            result_ttl: Duration::from_secs(7200),
            sweep_interval: Duration::from_secs(30),
            dependency_wait: Duration::from_millis(30_000),
            max_fetch_wait: Duration::from_millis(60_000),
            download_root: None,
            download_chunk_size: 64 * 1024,
            shutdown_grace: Duration::from_secs(10),
            default_class: "echo".to_string(),
            otlp_endpoint: None,
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&json)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the host cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig("max_workers must be greater than zero".into()));
        }
        if self.result_capacity == 0 {
            return Err(Error::InvalidConfig("result_capacity must be greater than zero".into()));
        }
        if self.download_chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "download_chunk_size must be greater than zero".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep_interval must be greater than zero".into()));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Immutable view of the model configuration at one version.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    /// 0 until the first `SetConfig`
    pub version: u64,
    /// Raw blob as last stored
    pub blob: Bytes,
    /// Parsed form when the blob is JSON
    pub parsed: Option<Value>,
}

impl ConfigSnapshot {
    /// Look up a model entry by `config_name` when the blob is a JSON list of
    /// configs, or by key when it is a JSON object.
    pub fn model(&self, name: &str) -> Option<&Value> {
        match self.parsed.as_ref()? {
            Value::Array(items) => items
                .iter()
                .find(|item| item.get("config_name").and_then(Value::as_str) == Some(name)),
            Value::Object(map) => map.get(name),
            _ => None,
        }
    }
}

/// Single-writer, many-reader holder of the model configuration.
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Holding it does not block writers.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Replace the configuration, or merge it into the current one.
    ///
    /// Replacement accepts any bytes. Merging requires both sides to be JSON:
    /// objects merge key by key, lists of `{"config_name": ..}` entries merge
    /// by name. Returns the new version.
    pub fn apply(&self, blob: Bytes, merge: bool) -> Result<u64> {
        let incoming: Option<Value> = serde_json::from_slice(&blob).ok();

        let mut current = self.current.write();
        let version = current.version + 1;

        let next = if merge && current.version > 0 {
            let incoming = incoming.ok_or_else(|| {
                Error::InvalidConfig("merge requires a JSON configuration".into())
            })?;
            let base = current.parsed.clone().ok_or_else(|| {
                Error::InvalidConfig("current configuration is not JSON, cannot merge".into())
            })?;
            let merged = merge_json(base, incoming)?;
            let blob = serde_json::to_vec(&merged)
                .map_err(|e| Error::InvalidConfig(e.to_string()))?;
            ConfigSnapshot { version, blob: Bytes::from(blob), parsed: Some(merged) }
        } else {
            ConfigSnapshot { version, blob, parsed: incoming }
        };

        *current = Arc::new(next);
        tracing::info!(version, merge, "model configuration updated");
        Ok(version)
    }
}

fn merge_json(base: Value, incoming: Value) -> Result<Value> {
    match (base, incoming) {
        (Value::Object(mut base), Value::Object(incoming)) => {
            for (key, value) in incoming {
                base.insert(key, value);
            }
            Ok(Value::Object(base))
        }
        (Value::Array(mut base), Value::Array(incoming)) => {
            for entry in incoming {
                let name = entry.get("config_name").and_then(Value::as_str).ok_or_else(|| {
                    Error::InvalidConfig("model config entries need a `config_name`".into())
                })?;
                let existing = base
                    .iter()
                    .position(|e| e.get("config_name").and_then(Value::as_str) == Some(name));
                match existing {
                    Some(idx) => base[idx] = entry,
                    None => base.push(entry),
                }
            }
            Ok(Value::Array(base))
        }
        _ => Err(Error::InvalidConfig(
            "cannot merge configurations of different shapes".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.call_policy, CallPolicy::Serialized);
        assert_eq!(config.result_capacity, 8192);
    }

    #[test]
    fn test_server_config_partial_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"max_workers": 2, "call_policy": "reject", "result_ttl": 5}"#)
                .unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.call_policy, CallPolicy::Reject);
        assert_eq!(config.result_ttl, Duration::from_secs(5));
        assert_eq!(config.max_queued, ServerConfig::default().max_queued);
    }

    #[test]
    fn test_server_config_rejects_zero_workers() {
        let config = ServerConfig { max_workers: 0, ..ServerConfig::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_call_policy_from_str() {
        assert_eq!("concurrent".parse::<CallPolicy>().unwrap(), CallPolicy::Concurrent);
        assert!("sometimes".parse::<CallPolicy>().is_err());
    }

    #[test]
    fn test_config_store_versions_and_replaces() {
        let store = ConfigStore::new();
        assert_eq!(store.snapshot().version, 0);

        let v1 = store.apply(Bytes::from_static(b"opaque"), false).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(store.snapshot().blob.as_ref(), b"opaque");
        assert!(store.snapshot().parsed.is_none());

        let v2 = store.apply(Bytes::from_static(br#"{"a":1}"#), false).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(store.snapshot().parsed, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_config_store_merges_model_lists_by_name() {
        let store = ConfigStore::new();
        store
            .apply(
                Bytes::from_static(
                    br#"[{"config_name":"gpt","model":"a"},{"config_name":"local","model":"b"}]"#,
                ),
                false,
            )
            .unwrap();
        store
            .apply(Bytes::from_static(br#"[{"config_name":"gpt","model":"c"}]"#), true)
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.model("gpt").unwrap()["model"], "c");
        assert_eq!(snapshot.model("local").unwrap()["model"], "b");
    }

    #[test]
    fn test_config_store_merge_keeps_old_snapshot_readable() {
        let store = ConfigStore::new();
        store.apply(Bytes::from_static(br#"{"a":1}"#), false).unwrap();
        let before = store.snapshot();
        store.apply(Bytes::from_static(br#"{"b":2}"#), true).unwrap();

        assert_eq!(before.parsed, Some(serde_json::json!({"a": 1})));
        assert_eq!(store.snapshot().parsed, Some(serde_json::json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_config_store_merge_rejects_mismatched_shapes() {
        let store = ConfigStore::new();
        store.apply(Bytes::from_static(br#"{"a":1}"#), false).unwrap();
        let err = store.apply(Bytes::from_static(br#"[1]"#), true).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(store.snapshot().version, 1);
    }
}
