//! Sensor payload normalization.
//!
//! Each sensor family gets a [`SensorAdapter`]; adapters are the only
//! sensor-specific code in the system. The [`Normalizer`] dispatches raw JSON
//! to the adapter registered under a name and counts what it accepts and
//! rejects. A rejected record never becomes a half-formed [`Event`].

pub mod generic;
pub mod kitnet;
pub mod suricata;
pub mod zeek;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::Event;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unsupported record type '{0}'")]
    Unsupported(String),
    #[error("no adapter registered for '{0}'")]
    UnknownAdapter(String),
}

/// Maps one sensor family's JSON into the canonical [`Event`].
pub trait SensorAdapter: Send + Sync {
    /// Registry name, e.g. `"suricata"`.
    fn name(&self) -> &'static str;

    fn adapt(&self, raw: &Value) -> Result<Event, NormalizeError>;
}

#[derive(Default)]
struct AdapterCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Accepted/rejected totals for one adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeCounts {
    pub accepted: u64,
    pub rejected: u64,
}

/// Registry of adapters plus per-adapter counters.
pub struct Normalizer {
    adapters: BTreeMap<&'static str, (Box<dyn SensorAdapter>, AdapterCounters)>,
}

impl Normalizer {
    pub fn empty() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    /// Normalizer with every built-in adapter registered.
    pub fn with_builtin_adapters() -> Self {
        let mut n = Self::empty();
        n.register(Box::new(suricata::SuricataAdapter));
        n.register(Box::new(zeek::ZeekAdapter));
        n.register(Box::new(kitnet::KitnetAdapter));
        n.register(Box::new(generic::GenericAdapter));
        n
    }

    pub fn register(&mut self, adapter: Box<dyn SensorAdapter>) {
        let name = adapter.name();
        self.adapters
            .insert(name, (adapter, AdapterCounters::default()));
    }

    pub fn adapter_names(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }

    /// Normalize one raw payload with the named adapter.
    pub fn normalize(&self, adapter: &str, raw: &Value) -> Result<Event, NormalizeError> {
        let (adapter_impl, counters) = self
            .adapters
            .get(adapter)
            .ok_or_else(|| NormalizeError::UnknownAdapter(adapter.to_string()))?;

        match adapter_impl.adapt(raw) {
            Ok(event) => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(adapter, event_id = %event.id, kind = %event.kind, "normalized sensor record");
                Ok(event)
            }
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(adapter, error = %e, "rejected malformed sensor record");
                Err(e)
            }
        }
    }

    pub fn counts(&self) -> BTreeMap<&'static str, NormalizeCounts> {
        self.adapters
            .iter()
            .map(|(name, (_, c))| {
                (
                    *name,
                    NormalizeCounts {
                        accepted: c.accepted.load(Ordering::Relaxed),
                        rejected: c.rejected.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Field helpers shared by the adapters
// ---------------------------------------------------------------------------

pub(crate) fn as_object(raw: &Value) -> Result<&serde_json::Map<String, Value>, NormalizeError> {
    raw.as_object().ok_or(NormalizeError::NotAnObject)
}

/// Non-empty string at `key`, if present.
pub(crate) fn opt_str(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() && s != "-" => Some(s.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn req_str(
    obj: &serde_json::Map<String, Value>,
    key: &'static str,
) -> Result<String, NormalizeError> {
    opt_str(obj, key).ok_or(NormalizeError::MissingField(key))
}

/// Accepts RFC 3339 strings and numeric epoch seconds (Zeek's `ts`).
pub(crate) fn parse_timestamp(
    value: Option<&Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, NormalizeError> {
    match value {
        None | Some(Value::Null) => Err(NormalizeError::MissingField(field)),
        Some(Value::Number(n)) => {
            let secs = n.as_f64().ok_or_else(|| NormalizeError::InvalidField {
                field,
                reason: "not a finite number".into(),
            })?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs.fract()) * 1e9).round() as u32;
            Utc.timestamp_opt(whole, nanos)
                .single()
                .ok_or_else(|| NormalizeError::InvalidField {
                    field,
                    reason: format!("epoch {} out of range", secs),
                })
        }
        Some(Value::String(s)) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            // Suricata writes offsets without a colon, e.g. +0000.
            if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(secs) = s.parse::<f64>() {
                return parse_timestamp(Some(&serde_json::json!(secs)), field);
            }
            Err(NormalizeError::InvalidField {
                field,
                reason: format!("unparseable timestamp '{}'", s),
            })
        }
        Some(other) => Err(NormalizeError::InvalidField {
            field,
            reason: format!("unexpected type {}", other),
        }),
    }
}

/// Stable id for a record whose sensor has no per-record id. Hashes the
/// whole record, so a resend of the same record keeps its id while two
/// alerts on one flow or connection get different ones.
pub(crate) fn record_id(raw: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Use the sensor's own id when present, otherwise mint one.
pub(crate) fn event_id(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> String {
    for key in keys {
        match obj.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    uuid::Uuid::new_v4().to_string()
}
