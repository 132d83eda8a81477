//! Minimum-contract adapter: `type`, `severity`, `timestamp` plus optional
//! subject fields. Used by sensors without a dedicated adapter.

use serde_json::Value;

use crate::event::{Event, Severity, Source, Subject};
use crate::normalize::{
    as_object, event_id, opt_str, parse_timestamp, req_str, NormalizeError, SensorAdapter,
};

pub struct GenericAdapter;

impl SensorAdapter for GenericAdapter {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn adapt(&self, raw: &Value) -> Result<Event, NormalizeError> {
        let obj = as_object(raw)?;

        let kind = req_str(obj, "type")?;
        let severity: Severity = req_str(obj, "severity")?.parse().map_err(|e| {
            NormalizeError::InvalidField {
                field: "severity",
                reason: format!("{}", e),
            }
        })?;
        let observed_at = parse_timestamp(obj.get("timestamp"), "timestamp")?;

        let source = match opt_str(obj, "source") {
            Some(s) => s.parse::<Source>().unwrap_or(Source::Other),
            None => Source::Other,
        };

        let src = opt_str(obj, "src")
            .or_else(|| opt_str(obj, "src_ip"))
            .or_else(|| opt_str(obj, "host"))
            .ok_or(NormalizeError::MissingField("src"))?;
        let dst = opt_str(obj, "dst").or_else(|| opt_str(obj, "dest_ip"));
        let protocol = opt_str(obj, "protocol").or_else(|| opt_str(obj, "proto"));

        let mut event = Event::new(
            event_id(obj, &["id"]),
            source,
            severity,
            kind,
            Subject::new(src, dst, protocol),
            observed_at,
        );

        if let Some(score) = obj.get("score") {
            let s = score.as_f64().ok_or_else(|| NormalizeError::InvalidField {
                field: "score",
                reason: "not a number".into(),
            })?;
            if !(0.0..=1.0).contains(&s) {
                return Err(NormalizeError::InvalidField {
                    field: "score",
                    reason: format!("{} outside 0..1", s),
                });
            }
            event = event.with_score(s);
        }

        // Everything not lifted into the canonical fields is kept verbatim.
        const LIFTED: &[&str] = &[
            "id", "type", "severity", "timestamp", "source", "src", "src_ip", "host", "dst",
            "dest_ip", "protocol", "proto", "score",
        ];
        for (k, v) in obj {
            if !LIFTED.contains(&k.as_str()) {
                event.payload.insert(k.clone(), v.clone());
            }
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimum_contract() {
        let e = GenericAdapter
            .adapt(&json!({
                "type": "dns_tunnel",
                "severity": "medium",
                "timestamp": "2026-03-01T12:00:00Z",
                "src_ip": "192.168.1.20",
                "detail": { "qname": "aaaa.example" }
            }))
            .unwrap();
        assert_eq!(e.kind, "dns_tunnel");
        assert_eq!(e.severity, Severity::Medium);
        assert_eq!(e.source, Source::Other);
        assert_eq!(e.subject.src, "192.168.1.20");
        assert!(e.subject.dst.is_none());
        assert_eq!(e.payload["detail"]["qname"], "aaaa.example");
    }

    #[test]
    fn test_declared_source_and_score() {
        let e = GenericAdapter
            .adapt(&json!({
                "id": "gen-7",
                "type": "beacon",
                "severity": "high",
                "timestamp": "2026-03-01T12:00:00Z",
                "source": "anomaly-model",
                "src": "10.1.1.1",
                "dst": "8.8.8.8",
                "score": 0.82
            }))
            .unwrap();
        assert_eq!(e.id, "gen-7");
        assert_eq!(e.source, Source::AnomalyModel);
        assert_eq!(e.score, Some(0.82));
    }

    #[test]
    fn test_rejects_bad_severity_and_score() {
        let base = json!({
            "type": "x", "severity": "urgent", "timestamp": "2026-03-01T12:00:00Z", "src": "h"
        });
        assert!(matches!(
            GenericAdapter.adapt(&base),
            Err(NormalizeError::InvalidField { field: "severity", .. })
        ));

        let bad_score = json!({
            "type": "x", "severity": "low", "timestamp": "2026-03-01T12:00:00Z",
            "src": "h", "score": 3.0
        });
        assert!(matches!(
            GenericAdapter.adapt(&bad_score),
            Err(NormalizeError::InvalidField { field: "score", .. })
        ));
    }

    #[test]
    fn test_rejects_missing_subject() {
        let raw = json!({ "type": "x", "severity": "low", "timestamp": "2026-03-01T12:00:00Z" });
        assert_eq!(
            GenericAdapter.adapt(&raw),
            Err(NormalizeError::MissingField("src"))
        );
    }
}
