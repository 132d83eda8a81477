//! Suricata EVE JSON adapter. Only `event_type = "alert"` records are events.

use serde_json::{Map, Value};

use crate::event::{Event, Severity, Source, Subject};
use crate::normalize::{
    as_object, opt_str, parse_timestamp, record_id, req_str, NormalizeError, SensorAdapter,
};

/// Protocol sections carried into the payload when present.
const CONTEXT_SECTIONS: &[&str] = &["http", "dns", "tls", "fileinfo", "smb"];

pub struct SuricataAdapter;

/// Suricata priorities: 1 is the most severe.
fn map_priority(priority: i64) -> Severity {
    match priority {
        i64::MIN..=1 => Severity::High,
        2 => Severity::Medium,
        _ => Severity::Low,
    }
}

impl SensorAdapter for SuricataAdapter {
    fn name(&self) -> &'static str {
        "suricata"
    }

    fn adapt(&self, raw: &Value) -> Result<Event, NormalizeError> {
        let obj = as_object(raw)?;

        let event_type = req_str(obj, "event_type")?;
        if event_type != "alert" {
            return Err(NormalizeError::Unsupported(event_type));
        }

        let alert: &Map<String, Value> = obj
            .get("alert")
            .and_then(Value::as_object)
            .ok_or(NormalizeError::MissingField("alert"))?;

        let observed_at = parse_timestamp(obj.get("timestamp"), "timestamp")?;
        let src = req_str(obj, "src_ip")?;
        let dst = opt_str(obj, "dest_ip");
        let proto = opt_str(obj, "proto");

        let priority = alert.get("severity").and_then(Value::as_i64).unwrap_or(3);
        let signature = opt_str(alert, "signature").unwrap_or_else(|| "Unknown".to_string());
        let kind = opt_str(alert, "category").unwrap_or_else(|| signature.clone());

        let mut event = Event::new(
            record_id(raw),
            Source::IntrusionDetector,
            map_priority(priority),
            kind,
            Subject::new(src, dst, proto),
            observed_at,
        )
        .with_payload("signature", Value::String(signature));

        for key in ["signature_id", "rev", "gid", "metadata"] {
            if let Some(v) = alert.get(key) {
                event.payload.insert(key.to_string(), v.clone());
            }
        }
        for key in ["src_port", "dest_port", "flow_id"] {
            if let Some(v) = obj.get(key) {
                event.payload.insert(key.to_string(), v.clone());
            }
        }
        for section in CONTEXT_SECTIONS {
            if let Some(v) = obj.get(*section) {
                event.payload.insert(section.to_string(), v.clone());
            }
        }

        Ok(event)
    }
}
