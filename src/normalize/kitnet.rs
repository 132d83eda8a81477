//! KitNET anomaly-model adapter.
//!
//! KitNET reports `anomaly_score` relative to its own threshold (1.0 means
//! "at threshold"). Scores already in 0..1 pass through; larger values map to
//! `1 - 0.5 / score`, so the threshold itself lands at 0.5.

use serde_json::Value;

use crate::event::{Event, Severity, Source, Subject};
use crate::normalize::{as_object, event_id, opt_str, parse_timestamp, NormalizeError, SensorAdapter};

pub struct KitnetAdapter;

pub fn normalize_score(raw: f64) -> f64 {
    if raw <= 1.0 {
        raw.max(0.0)
    } else {
        1.0 - 0.5 / raw
    }
}

impl SensorAdapter for KitnetAdapter {
    fn name(&self) -> &'static str {
        "kitnet"
    }

    fn adapt(&self, raw: &Value) -> Result<Event, NormalizeError> {
        let obj = as_object(raw)?;

        let raw_score = obj
            .get("anomaly_score")
            .ok_or(NormalizeError::MissingField("anomaly_score"))?
            .as_f64()
            .filter(|s| s.is_finite())
            .ok_or_else(|| NormalizeError::InvalidField {
                field: "anomaly_score",
                reason: "not a finite number".into(),
            })?;
        let observed_at = parse_timestamp(obj.get("timestamp"), "timestamp")?;

        let network = obj
            .get("network")
            .and_then(Value::as_object)
            .ok_or(NormalizeError::MissingField("network"))?;
        let src = opt_str(network, "src_ip").ok_or(NormalizeError::MissingField("network.src_ip"))?;
        let dst = opt_str(network, "dest_ip");
        let proto = opt_str(network, "protocol");

        let score = normalize_score(raw_score);
        let kind = opt_str(network, "service")
            .map(|svc| format!("flow-anomaly/{}", svc))
            .unwrap_or_else(|| "flow-anomaly".to_string());

        let mut event = Event::new(
            event_id(obj, &["id"]),
            Source::AnomalyModel,
            Severity::from_score(score),
            kind,
            Subject::new(src, dst, proto),
            observed_at,
        )
        .with_score(score)
        .with_payload("anomaly_score", Value::from(raw_score));

        for key in ["threshold", "context"] {
            if let Some(v) = obj.get(key) {
                event.payload.insert(key.to_string(), v.clone());
            }
        }
        for key in ["src_port", "dest_port", "duration"] {
            if let Some(v) = network.get(key) {
                event.payload.insert(key.to_string(), v.clone());
            }
        }

        Ok(event)
    }
}
