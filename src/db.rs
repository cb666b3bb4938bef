//! SQLite store for tunnels, nodes, and per-core reset schedules
//!
//! Durable state that survives restarts: the tunnel inventory consumed by the
//! health aggregator and reset orchestrator, the node registry, and one reset
//! schedule row per core.

use crate::core::Core;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Default reset interval for a lazily created schedule row
const DEFAULT_INTERVAL_MINUTES: i64 = 10;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A persisted tunnel. `spec` is the per-core JSON bag parsed by
/// [`crate::core::TunnelSpec`].
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub id: String,
    pub core: Core,
    pub status: String,
    pub node_id: Option<String>,
    pub spec: Value,
}

/// A remote host running a tunnel client agent.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub agent_url: String,
}

/// Reset schedule for one core.
#[derive(Debug, Clone, Serialize)]
pub struct ResetConfigRecord {
    pub core: Core,
    pub enabled: bool,
    pub interval_minutes: i64,
    pub last_reset: Option<DateTime<Utc>>,
    pub next_reset: Option<DateTime<Utc>>,
}

/// `next_reset` is defined iff the schedule is enabled; it is anchored at
/// `last_reset` when one exists, else at `now`.
pub fn compute_next_reset(
    enabled: bool,
    interval_minutes: i64,
    last_reset: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !enabled || interval_minutes < 1 {
        return None;
    }
    Some(last_reset.unwrap_or(now) + Duration::minutes(interval_minutes))
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Tunnels, one row per logical forwarding rule
            CREATE TABLE IF NOT EXISTS tunnels (
                id TEXT PRIMARY KEY,
                core TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                node_id TEXT,
                spec TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_tunnels_core_status ON tunnels(core, status);

            -- Remote hosts running tunnel client agents
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                agent_url TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- One reset schedule row per core, created lazily
            CREATE TABLE IF NOT EXISTS core_reset_config (
                core TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 0,
                interval_minutes INTEGER NOT NULL DEFAULT 10,
                last_reset TEXT,
                next_reset TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Tunnels marked active for `core`.
    pub fn active_tunnels(&self, core: Core) -> Result<Vec<TunnelRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, core, status, node_id, spec FROM tunnels
             WHERE core = ?1 AND status = 'active' ORDER BY id",
        )?;
        let rows = stmt.query_map(params![core.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut tunnels = Vec::new();
        for row in rows {
            let (id, core_name, status, node_id, spec) = row?;
            let core = Core::from_str(&core_name)
                .ok_or_else(|| anyhow!("unknown core '{core_name}' for tunnel {id}"))?;
            let spec = serde_json::from_str(&spec)
                .with_context(|| format!("malformed spec for tunnel {id}"))?;
            tunnels.push(TunnelRecord {
                id,
                core,
                status,
                node_id,
                spec,
            });
        }
        Ok(tunnels)
    }

    pub fn upsert_tunnel(&self, tunnel: &TunnelRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tunnels (id, core, status, node_id, spec) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                core = excluded.core,
                status = excluded.status,
                node_id = excluded.node_id,
                spec = excluded.spec",
            params![
                tunnel.id,
                tunnel.core.as_str(),
                tunnel.status,
                tunnel.node_id,
                serde_json::to_string(&tunnel.spec)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, agent_url FROM nodes WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![node_id], |row| {
            Ok(NodeRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                agent_url: row.get(2)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn upsert_node(&self, node: &NodeRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO nodes (id, name, agent_url) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                agent_url = excluded.agent_url",
            params![node.id, node.name, node.agent_url],
        )?;
        Ok(())
    }

    /// Reset schedule for `core`; created with defaults (disabled, 10 minute
    /// interval) on first read.
    pub fn get_reset_config(&self, core: Core) -> Result<ResetConfigRecord> {
        if let Some(record) = self.query_reset_config(core)? {
            return Ok(record);
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO core_reset_config (core, enabled, interval_minutes, updated_at)
             VALUES (?1, 0, ?2, ?3)",
            params![
                core.as_str(),
                DEFAULT_INTERVAL_MINUTES,
                Utc::now().to_rfc3339()
            ],
        )?;
        drop(conn);

        self.query_reset_config(core)?
            .ok_or_else(|| anyhow!("reset config for {core} missing after insert"))
    }

    /// Reset schedules for every core, creating missing rows lazily.
    pub fn list_reset_configs(&self) -> Result<Vec<ResetConfigRecord>> {
        Core::ALL.iter().map(|&core| self.get_reset_config(core)).collect()
    }

    /// Apply a partial schedule update and recompute `next_reset`. Interval
    /// validation happens at the API boundary; this assumes sane input.
    pub fn update_reset_config(
        &self,
        core: Core,
        enabled: Option<bool>,
        interval_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<ResetConfigRecord> {
        let mut record = self.get_reset_config(core)?;
        if let Some(enabled) = enabled {
            record.enabled = enabled;
        }
        if let Some(interval) = interval_minutes {
            record.interval_minutes = interval;
        }
        record.next_reset = compute_next_reset(
            record.enabled,
            record.interval_minutes,
            record.last_reset,
            now,
        );
        self.store_reset_config(&record, now)?;
        Ok(record)
    }

    /// Record a completed reset pass: `last_reset = now`, `next_reset`
    /// recomputed only while the schedule is still enabled.
    pub fn mark_reset(&self, core: Core, now: DateTime<Utc>) -> Result<ResetConfigRecord> {
        let mut record = self.get_reset_config(core)?;
        record.last_reset = Some(now);
        record.next_reset = compute_next_reset(
            record.enabled,
            record.interval_minutes,
            record.last_reset,
            now,
        );
        self.store_reset_config(&record, now)?;
        Ok(record)
    }

    fn store_reset_config(&self, record: &ResetConfigRecord, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE core_reset_config
             SET enabled = ?2, interval_minutes = ?3, last_reset = ?4, next_reset = ?5, updated_at = ?6
             WHERE core = ?1",
            params![
                record.core.as_str(),
                record.enabled,
                record.interval_minutes,
                record.last_reset.map(|t| t.to_rfc3339()),
                record.next_reset.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn query_reset_config(&self, core: Core) -> Result<Option<ResetConfigRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT enabled, interval_minutes, last_reset, next_reset
             FROM core_reset_config WHERE core = ?1",
        )?;
        let mut rows = stmt.query_map(params![core.as_str()], |row| {
            Ok((
                row.get::<_, bool>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        match rows.next().transpose()? {
            None => Ok(None),
            Some((enabled, interval_minutes, last_reset, next_reset)) => {
                Ok(Some(ResetConfigRecord {
                    core,
                    enabled,
                    interval_minutes,
                    last_reset: parse_timestamp(last_reset.as_deref())?,
                    next_reset: parse_timestamp(next_reset.as_deref())?,
                }))
            }
        }
    }
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(s) => {
            let parsed = DateTime::parse_from_rfc3339(s)
                .with_context(|| format!("malformed timestamp '{s}'"))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_reset_is_last_reset_plus_interval() {
        let last = Utc::now();
        let next = compute_next_reset(true, 10, Some(last), last + Duration::minutes(3));
        assert_eq!(next, Some(last + Duration::minutes(10)));
    }

    #[test]
    fn next_reset_anchors_at_now_without_a_last_reset() {
        let now = Utc::now();
        let next = compute_next_reset(true, 5, None, now);
        assert_eq!(next, Some(now + Duration::minutes(5)));
    }

    #[test]
    fn next_reset_is_none_when_disabled() {
        let now = Utc::now();
        assert_eq!(compute_next_reset(false, 10, Some(now), now), None);
        assert_eq!(compute_next_reset(false, 10, None, now), None);
    }

    #[test]
    fn reset_config_is_created_lazily_with_defaults() {
        let db = Database::open_in_memory().unwrap();

        let config = db.get_reset_config(Core::Rathole).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.interval_minutes, 10);
        assert_eq!(config.last_reset, None);
        assert_eq!(config.next_reset, None);

        let all = db.list_reset_configs().unwrap();
        assert_eq!(all.len(), Core::ALL.len());
    }

    #[test]
    fn update_enables_the_schedule_and_sets_next_reset() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let updated = db
            .update_reset_config(Core::Frp, Some(true), Some(5), now)
            .unwrap();
        assert!(updated.enabled);
        assert_eq!(updated.interval_minutes, 5);
        assert_eq!(updated.next_reset, Some(now + Duration::minutes(5)));

        // Disabling clears next_reset regardless of last_reset
        let updated = db
            .update_reset_config(Core::Frp, Some(false), None, now)
            .unwrap();
        assert_eq!(updated.next_reset, None);
    }

    #[test]
    fn mark_reset_advances_the_schedule() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.update_reset_config(Core::Chisel, Some(true), Some(10), now)
            .unwrap();
        let marked = db.mark_reset(Core::Chisel, now).unwrap();
        assert_eq!(marked.last_reset, Some(now));
        assert_eq!(marked.next_reset, Some(now + Duration::minutes(10)));

        // Disabled schedule keeps last_reset but drops next_reset
        db.update_reset_config(Core::Chisel, Some(false), None, now)
            .unwrap();
        let marked = db.mark_reset(Core::Chisel, now).unwrap();
        assert_eq!(marked.last_reset, Some(now));
        assert_eq!(marked.next_reset, None);
    }

    #[test]
    fn active_tunnels_filters_by_core_and_status() {
        let db = Database::open_in_memory().unwrap();

        db.upsert_tunnel(&TunnelRecord {
            id: "t1".to_string(),
            core: Core::Rathole,
            status: "active".to_string(),
            node_id: Some("n1".to_string()),
            spec: json!({"remote_addr": "0.0.0.0:23333"}),
        })
        .unwrap();
        db.upsert_tunnel(&TunnelRecord {
            id: "t2".to_string(),
            core: Core::Rathole,
            status: "stopped".to_string(),
            node_id: None,
            spec: json!({}),
        })
        .unwrap();
        db.upsert_tunnel(&TunnelRecord {
            id: "t3".to_string(),
            core: Core::Frp,
            status: "active".to_string(),
            node_id: None,
            spec: json!({}),
        })
        .unwrap();

        let active = db.active_tunnels(Core::Rathole).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "t1");
        assert_eq!(active[0].spec["remote_addr"], "0.0.0.0:23333");
    }

    #[test]
    fn nodes_round_trip() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.get_node("n1").unwrap().is_none());
        db.upsert_node(&NodeRecord {
            id: "n1".to_string(),
            name: "edge-1".to_string(),
            agent_url: "http://10.0.0.5:9000".to_string(),
        })
        .unwrap();

        let node = db.get_node("n1").unwrap().unwrap();
        assert_eq!(node.name, "edge-1");
        assert_eq!(node.agent_url, "http://10.0.0.5:9000");
    }
}
