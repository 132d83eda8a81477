use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::Event;

/// Dedup key over an event's coarse identity.
///
/// Covers `(source, kind, subject, observed_at rounded down to a bucket)`.
/// The event id and payload are excluded, so two sensors
/// reporting the same flow in the same bucket collapse into one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(event: &Event, bucket_sec: u64) -> Self {
        let bucket = bucket_sec.max(1) as i64;
        let ts = event.observed_at.timestamp();
        let rounded = ts.div_euclid(bucket) * bucket;

        let mut hasher = Sha256::new();
        hasher.update(event.source.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(event.kind.as_bytes());
        hasher.update(b"|");
        hasher.update(event.subject.src.as_bytes());
        hasher.update(b"|");
        hasher.update(event.subject.dst.as_deref().unwrap_or("-").as_bytes());
        hasher.update(b"|");
        hasher.update(event.subject.protocol.as_deref().unwrap_or("-").as_bytes());
        hasher.update(b"|");
        hasher.update(rounded.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}
