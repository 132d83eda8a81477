//! Event correlation: groups related events into incidents by spatial key
//! and time window.
//!
//! Open incidents live in lock-partitioned shards. A key always hashes to the
//! same shard, so every mutation for that key is serialized by the shard lock
//! while unrelated keys proceed in parallel. The periodic sweep is the only
//! path from `Open` to `Scoring`: it removes expired incidents from the shard
//! under the same lock, so an event arriving afterwards starts a new incident.

pub mod incident;

pub use self::incident::{Grace, Incident, IncidentError, IncidentRecord, IncidentStatus};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::CorrelationConfig;
use crate::event::{Event, Subject};

/// Canonical grouping key. Pairs are stored sorted so `a -> b` and `b -> a`
/// land on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpatialKey {
    Pair(String, String),
    Host(String),
}

impl SpatialKey {
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        match a.cmp(&b) {
            std::cmp::Ordering::Less => SpatialKey::Pair(a, b),
            std::cmp::Ordering::Greater => SpatialKey::Pair(b, a),
            std::cmp::Ordering::Equal => SpatialKey::Host(a),
        }
    }

    pub fn host(h: impl Into<String>) -> Self {
        SpatialKey::Host(h.into())
    }

    /// The key a new incident for this subject is created under.
    pub fn primary(subject: &Subject) -> Self {
        match &subject.dst {
            Some(dst) => Self::pair(subject.src.clone(), dst.clone()),
            None => Self::host(subject.src.clone()),
        }
    }

    /// Every key an event with this subject may join, primary first.
    ///
    /// A pair event may also join an open host-only incident for either of
    /// its endpoints. A host-only event matches only its own host key.
    pub fn candidates(subject: &Subject) -> Vec<SpatialKey> {
        let primary = Self::primary(subject);
        let mut keys = vec![primary.clone()];
        if let SpatialKey::Pair(a, b) = primary {
            keys.push(SpatialKey::Host(a));
            keys.push(SpatialKey::Host(b));
        }
        keys
    }
}

impl fmt::Display for SpatialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpatialKey::Pair(a, b) => write!(f, "{}<->{}", a, b),
            SpatialKey::Host(h) => write!(f, "{}", h),
        }
    }
}

/// Where an ingested event ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Opened {
        incident_id: String,
        spatial_key: SpatialKey,
    },
    Appended {
        incident_id: String,
        spatial_key: SpatialKey,
    },
}

impl Placement {
    pub fn incident_id(&self) -> &str {
        match self {
            Placement::Opened { incident_id, .. } | Placement::Appended { incident_id, .. } => {
                incident_id
            }
        }
    }
}

/// Open incidents per key. Several may coexist under one key when events
/// arrive far apart before the sweep has claimed the older one.
type Shard = HashMap<SpatialKey, Vec<Incident>>;

pub struct Correlator {
    shards: Vec<Mutex<Shard>>,
    grace: Grace,
}

impl Correlator {
    pub fn new(cfg: &CorrelationConfig) -> Self {
        let n = cfg.shards.max(1);
        Self {
            shards: (0..n).map(|_| Mutex::new(HashMap::new())).collect(),
            grace: Grace::from_config(cfg),
        }
    }

    pub fn grace(&self) -> Grace {
        self.grace
    }

    fn shard_of(&self, key: &SpatialKey) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() % self.shards.len() as u64) as usize
    }

    /// Place one event into an incident.
    ///
    /// All shards holding a candidate key are locked in ascending index order,
    /// so candidate selection and the append happen atomically with respect
    /// to the sweep and to other events for the same keys.
    pub async fn ingest(&self, event: Arc<Event>) -> Placement {
        let candidates = SpatialKey::candidates(&event.subject);
        let mut shard_ids: Vec<usize> = candidates.iter().map(|k| self.shard_of(k)).collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();

        let mut guards: Vec<(usize, MutexGuard<'_, Shard>)> = Vec::with_capacity(shard_ids.len());
        for id in shard_ids {
            guards.push((id, self.shards[id].lock().await));
        }

        // Most recent window_end wins when several candidates accept the event.
        let mut best: Option<(SpatialKey, usize, DateTime<Utc>)> = None;
        for key in &candidates {
            let shard = self.shard_of(key);
            let Some(list) = guards
                .iter()
                .find(|(i, _)| *i == shard)
                .and_then(|(_, g)| g.get(key))
            else {
                continue;
            };
            for (pos, inc) in list.iter().enumerate() {
                if !inc.accepts(event.observed_at, &self.grace) {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((_, _, end)) => inc.window_end() > *end,
                };
                if better {
                    best = Some((key.clone(), pos, inc.window_end()));
                }
            }
        }

        if let Some((key, pos, _)) = best {
            let shard = self.shard_of(&key);
            let target = guards
                .iter_mut()
                .find(|(i, _)| *i == shard)
                .and_then(|(_, g)| g.get_mut(&key))
                .and_then(|list| list.get_mut(pos));
            if let Some(inc) = target {
                if inc.append(Arc::clone(&event)).is_ok() {
                    debug!(
                        incident_id = %inc.id(),
                        spatial_key = %key,
                        event_id = %event.id,
                        events = inc.events().len(),
                        "appended event to open incident"
                    );
                    return Placement::Appended {
                        incident_id: inc.id().to_string(),
                        spatial_key: key,
                    };
                }
            }
        }

        let key = SpatialKey::primary(&event.subject);
        let shard = self.shard_of(&key);
        let incident = Incident::open(key.clone(), event);
        let incident_id = incident.id().to_string();
        info!(
            incident_id = %incident_id,
            spatial_key = %key,
            "opened incident"
        );
        match guards.iter().position(|(i, _)| *i == shard) {
            Some(p) => guards[p].1.entry(key.clone()).or_default().push(incident),
            None => {
                drop(guards);
                self.shards[shard]
                    .lock()
                    .await
                    .entry(key.clone())
                    .or_default()
                    .push(incident);
            }
        }
        Placement::Opened {
            incident_id,
            spatial_key: key,
        }
    }

    /// Move every open incident whose grace has elapsed at `now` to
    /// `Scoring` and hand it to the caller. Claimed incidents leave the
    /// shards, so later events for the same key open a new incident.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<Incident> {
        let grace = self.grace;
        let mut claimed = Vec::new();

        for shard in &self.shards {
            let mut guard = shard.lock().await;
            guard.retain(|_, list| {
                let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(list)
                    .into_iter()
                    .partition(|inc| now >= inc.expires_at(&grace));
                *list = live;
                for mut inc in expired {
                    if inc.begin_scoring().is_ok() {
                        claimed.push(inc);
                    }
                }
                !list.is_empty()
            });
        }

        if !claimed.is_empty() {
            info!(count = claimed.len(), "sweep claimed incidents for scoring");
        }
        claimed
    }

    pub async fn open_count(&self) -> usize {
        let mut n = 0;
        for shard in &self.shards {
            n += shard.lock().await.values().map(Vec::len).sum::<usize>();
        }
        n
    }
}
