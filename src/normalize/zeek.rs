//! Zeek `notice.log` (JSON) adapter.

use serde_json::Value;

use crate::event::{Event, Severity, Source, Subject};
use crate::normalize::{as_object, opt_str, parse_timestamp, record_id, NormalizeError, SensorAdapter};

const CRITICAL_NOTICES: &[&str] = &[
    "Intel::Notice",
    "Signatures::Sensitive_Signature",
    "HTTP::SQL_Injection_Attacker",
    "TeamCymruMalwareHashRegistry::Match",
];

const HIGH_NOTICES: &[&str] = &[
    "Scan::Port_Scan",
    "Scan::Address_Scan",
    "SSH::Password_Guessing",
    "FTP::Bruteforcing",
    "SSL::Invalid_Server_Cert",
    "Weird::Activity",
    "TrackerHit",
];

const MEDIUM_NOTICES: &[&str] = &[
    "SSH::Interesting_Hostname",
    "SSL::Certificate_Expired",
    "Software::Vulnerable_Version",
    "CaptureLoss::Packet_Drops",
];

fn notice_severity(note: &str) -> Severity {
    let hit = |list: &[&str]| list.iter().any(|n| note.contains(n));
    if hit(CRITICAL_NOTICES) {
        Severity::Critical
    } else if hit(HIGH_NOTICES) {
        Severity::High
    } else if hit(MEDIUM_NOTICES) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// ATT&CK technique for well-known notice types.
pub fn mitre_technique(note: &str) -> Option<&'static str> {
    Some(match note {
        "Scan::Port_Scan" | "Scan::Address_Scan" => "T1046 - Network Service Scanning",
        "SSH::Password_Guessing" | "FTP::Bruteforcing" => "T1110 - Brute Force",
        "HTTP::SQL_Injection_Attacker" => "T1190 - Exploit Public-Facing Application",
        "SSL::Invalid_Server_Cert" => "T1557 - Adversary-in-the-Middle",
        "Weird::Activity" => "T1205 - Traffic Signaling",
        "TeamCymruMalwareHashRegistry::Match" => "T1204 - User Execution",
        "Software::Vulnerable_Version" => "T1203 - Exploitation for Client Execution",
        _ => return None,
    })
}

pub struct ZeekAdapter;

impl SensorAdapter for ZeekAdapter {
    fn name(&self) -> &'static str {
        "zeek"
    }

    fn adapt(&self, raw: &Value) -> Result<Event, NormalizeError> {
        let obj = as_object(raw)?;

        let note = opt_str(obj, "note").ok_or(NormalizeError::MissingField("note"))?;
        let observed_at = parse_timestamp(obj.get("ts"), "ts")?;
        let src = opt_str(obj, "id.orig_h")
            .or_else(|| opt_str(obj, "src"))
            .ok_or(NormalizeError::MissingField("id.orig_h"))?;
        let dst = opt_str(obj, "id.resp_h").or_else(|| opt_str(obj, "dst"));
        let proto = opt_str(obj, "proto");

        let mut event = Event::new(
            record_id(raw),
            Source::NetworkMonitor,
            notice_severity(&note),
            note.clone(),
            Subject::new(src, dst, proto),
            observed_at,
        );

        if let Some(technique) = mitre_technique(&note) {
            event = event.with_payload("mitre", Value::String(technique.to_string()));
        }
        for key in [
            "uid", "fuid", "msg", "sub", "actions", "id.orig_p", "id.resp_p", "p", "n",
        ] {
            if let Some(v) = obj.get(key) {
                event.payload.insert(key.to_string(), v.clone());
            }
        }

        Ok(event)
    }
}
