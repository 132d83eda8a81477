//! Database schema and migrations.
//!
//! Edge and brain share one schema; each process only touches its own tables.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Edge: durable per-source FIFO.
        CREATE TABLE IF NOT EXISTS edge_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            severity INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            event_json TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_edge_queue_source ON edge_queue(source, id);
        CREATE INDEX IF NOT EXISTS idx_edge_queue_evict ON edge_queue(source, severity, id);

        -- Brain: ingress gate state shared between brain processes.
        CREATE TABLE IF NOT EXISTS dedup_cache (
            fingerprint TEXT PRIMARY KEY,
            first_seen INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dedup_expires ON dedup_cache(expires_at);

        CREATE TABLE IF NOT EXISTS token_buckets (
            bucket_key TEXT PRIMARY KEY,
            tokens REAL NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Brain: incident archive.
        CREATE TABLE IF NOT EXISTS incidents (
            incident_id TEXT PRIMARY KEY,
            spatial_key TEXT NOT NULL,
            status TEXT NOT NULL,
            severity INTEGER,
            score REAL,
            ai_generated INTEGER NOT NULL DEFAULT 0,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            scored_at INTEGER,
            closed_at INTEGER,
            record_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_incidents_scored ON incidents(scored_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_key ON incidents(spatial_key);

        CREATE TABLE IF NOT EXISTS incident_events (
            incident_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            source TEXT NOT NULL,
            kind TEXT NOT NULL,
            PRIMARY KEY (incident_id, seq),
            FOREIGN KEY (incident_id) REFERENCES incidents(incident_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_incident_events_source ON incident_events(source);
        CREATE INDEX IF NOT EXISTS idx_incident_events_kind ON incident_events(kind);

        -- Brain: every threshold recommendation ever issued.
        CREATE TABLE IF NOT EXISTS recommendations (
            id INTEGER PRIMARY KEY,
            sensor_target TEXT NOT NULL,
            direction TEXT NOT NULL,
            suggested_value REAL NOT NULL,
            issued_at INTEGER NOT NULL,
            record_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_recommendations_target ON recommendations(sensor_target, issued_at);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "edge_queue",
            "dedup_cache",
            "token_buckets",
            "incidents",
            "incident_events",
            "recommendations",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
