//! SQLite storage implementation.
//!
//! Three tables: `host_agent` (one row per agent, snapshot as a JSON
//! blob), `seed` (one row per workflow instance) and `seed_stage_state`
//! (append-only observation log owned by its seed).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::agents::{Agent, AgentData, AgentInfo, AgentStatus};
use crate::error::{Error, Result};
use crate::seeds::{Seed, SeedMethod, SeedSide, SeedStage, SeedStageState, SeedStatus, StageStatus};

/// Statuses that end a seed; active seeds are everything else.
const TERMINAL_STATUSES: &str = "('Completed', 'Failed')";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS host_agent (
                hostname TEXT PRIMARY KEY,
                port INTEGER NOT NULL,
                token TEXT NOT NULL,
                mysql_port INTEGER NOT NULL,
                last_seen TEXT NOT NULL,
                last_checked TEXT,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS seed (
                seed_id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_hostname TEXT NOT NULL,
                source_hostname TEXT NOT NULL,
                method TEXT NOT NULL,
                backup_side TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS seed_stage_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                seed_id INTEGER NOT NULL,
                hostname TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (seed_id) REFERENCES seed(seed_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_seed_status ON seed(status);
            CREATE INDEX IF NOT EXISTS idx_seed_target ON seed(target_hostname);
            CREATE INDEX IF NOT EXISTS idx_seed_source ON seed(source_hostname);
            CREATE INDEX IF NOT EXISTS idx_seed_stage_state_seed
                ON seed_stage_state(seed_id, id DESC);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Agent operations
    // ========================================================================

    /// Create or replace the row for an agent.
    pub async fn save_agent(&self, agent: &Agent) -> Result<()> {
        let data = serde_json::to_string(&agent.data)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "REPLACE INTO host_agent
                 (hostname, port, token, mysql_port, last_seen, last_checked, status, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                agent.info.hostname,
                agent.info.port,
                agent.info.token,
                agent.info.mysql_port,
                agent.last_seen.to_rfc3339(),
                agent.last_checked.map(|t| t.to_rfc3339()),
                agent.status.to_string(),
                data,
            ],
        )?;
        Ok(())
    }

    /// All known agents with their snapshots, ordered by hostname.
    pub async fn read_agents(&self) -> Result<Vec<Agent>> {
        self.query_agents("", &[], true).await
    }

    /// All known agents without snapshot payloads.
    pub async fn read_agents_info(&self) -> Result<Vec<Agent>> {
        self.query_agents("", &[], false).await
    }

    /// One agent with its snapshot.
    pub async fn read_agent(&self, hostname: &str) -> Result<Agent> {
        self.query_one_agent(hostname, true).await
    }

    /// One agent without the snapshot payload.
    pub async fn read_agent_info(&self, hostname: &str) -> Result<Agent> {
        self.query_one_agent(hostname, false).await
    }

    /// Agents whose `last_checked` is older than the cutoff or missing.
    pub async fn read_outdated_agents(&self, cutoff: DateTime<Utc>) -> Result<Vec<Agent>> {
        let cutoff_str = cutoff.to_rfc3339();
        self.query_agents(
            "WHERE last_checked IS NULL OR last_checked < ?1",
            &[cutoff_str.as_str()],
            false,
        )
        .await
    }

    async fn query_agents(
        &self,
        where_clause: &str,
        args: &[&str],
        with_data: bool,
    ) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT hostname, port, token, mysql_port, last_seen, last_checked, status, data
             FROM host_agent {} ORDER BY hostname",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let agents = stmt
            .query_map(rusqlite::params_from_iter(args), |row| {
                Self::agent_from_row(row, with_data)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    async fn query_one_agent(&self, hostname: &str, with_data: bool) -> Result<Agent> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT hostname, port, token, mysql_port, last_seen, last_checked, status, data
             FROM host_agent WHERE hostname = ?1",
        )?;
        let agent = stmt
            .query_row([hostname], |row| Self::agent_from_row(row, with_data))
            .optional()?;
        agent.ok_or_else(|| Error::NotFound(format!("Agent {} not found", hostname)))
    }

    fn agent_from_row(row: &rusqlite::Row<'_>, with_data: bool) -> rusqlite::Result<Agent> {
        let data = if with_data {
            let blob: String = row.get(7)?;
            serde_json::from_str(&blob).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e))
            })?
        } else {
            AgentData::default()
        };
        Ok(Agent {
            info: AgentInfo {
                hostname: row.get(0)?,
                port: row.get(1)?,
                token: row.get(2)?,
                mysql_port: row.get(3)?,
            },
            data,
            last_seen: parse_ts(&row.get::<_, String>(4)?),
            last_checked: row.get::<_, Option<String>>(5)?.map(|s| parse_ts(&s)),
            status: parse_col(6, row.get::<_, String>(6)?)?,
        })
    }

    /// Stamp `last_checked = now` ahead of a refresh attempt.
    pub async fn touch_agent_last_checked(&self, hostname: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE host_agent SET last_checked = ?1 WHERE hostname = ?2",
            params![Utc::now().to_rfc3339(), hostname],
        )?;
        Ok(())
    }

    pub async fn update_agent_status(&self, hostname: &str, status: AgentStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE host_agent SET status = ?1 WHERE hostname = ?2",
            params![status.to_string(), hostname],
        )?;
        Ok(())
    }

    /// Store a freshly fetched snapshot: Active, `last_seen = now`.
    pub async fn update_agent_data(&self, hostname: &str, data: &AgentData) -> Result<()> {
        let blob = serde_json::to_string(data)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE host_agent
             SET data = ?1, status = ?2, last_seen = ?3
             WHERE hostname = ?4",
            params![
                blob,
                AgentStatus::Active.to_string(),
                Utc::now().to_rfc3339(),
                hostname
            ],
        )?;
        Ok(())
    }

    /// Delete agents unseen since the cutoff.
    ///
    /// Agents referenced by an active seed on either side are kept.
    pub async fn forget_unseen_agents(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "DELETE FROM host_agent
             WHERE last_seen < ?1
               AND hostname NOT IN (
                   SELECT target_hostname FROM seed WHERE status NOT IN {terminal}
                   UNION
                   SELECT source_hostname FROM seed WHERE status NOT IN {terminal}
               )",
            terminal = TERMINAL_STATUSES
        );
        let deleted = conn.execute(&sql, params![cutoff.to_rfc3339()])?;
        Ok(deleted)
    }

    // ========================================================================
    // Seed operations
    // ========================================================================

    /// Insert a new seed in its initial state and return its id.
    pub async fn create_seed(
        &self,
        target_hostname: &str,
        source_hostname: &str,
        method: SeedMethod,
        backup_side: SeedSide,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO seed
                 (target_hostname, source_hostname, method, backup_side,
                  stage, status, retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                target_hostname,
                source_hostname,
                method.to_string(),
                backup_side.to_string(),
                SeedStage::Prepare.to_string(),
                SeedStatus::Started.to_string(),
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Persist the seed's current stage, status and retry count.
    pub async fn update_seed(&self, seed: &Seed) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE seed
             SET stage = ?1, status = ?2, retries = ?3, updated_at = ?4
             WHERE seed_id = ?5",
            params![
                seed.stage.to_string(),
                seed.status.to_string(),
                seed.retries,
                Utc::now().to_rfc3339(),
                seed.seed_id,
            ],
        )?;
        Ok(())
    }

    pub async fn read_seed(&self, seed_id: i64) -> Result<Seed> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{} WHERE seed_id = ?1", SELECT_SEED))?;
        let seed = stmt.query_row([seed_id], seed_from_row).optional()?;
        seed.ok_or_else(|| Error::NotFound(format!("Seed {} not found", seed_id)))
    }

    /// All non-terminal seeds.
    pub async fn read_active_seeds(&self) -> Result<Vec<Seed>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "{} WHERE status NOT IN {} ORDER BY seed_id",
            SELECT_SEED, TERMINAL_STATUSES
        );
        let mut stmt = conn.prepare(&sql)?;
        let seeds = stmt
            .query_map([], seed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(seeds)
    }

    /// Recent seeds in any status, newest first, bounded.
    pub async fn read_recent_seeds(&self, limit: usize) -> Result<Vec<Seed>> {
        let conn = self.conn.lock().await;
        let sql = format!("{} ORDER BY seed_id DESC LIMIT ?1", SELECT_SEED);
        let mut stmt = conn.prepare(&sql)?;
        let seeds = stmt
            .query_map([limit], seed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(seeds)
    }

    /// Recent seeds referencing the agent on either side, in a status.
    pub async fn read_recent_seeds_for_agent_in_status(
        &self,
        hostname: &str,
        status: SeedStatus,
        limit: usize,
    ) -> Result<Vec<Seed>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "{} WHERE (target_hostname = ?1 OR source_hostname = ?1) AND status = ?2
             ORDER BY seed_id DESC LIMIT ?3",
            SELECT_SEED
        );
        let mut stmt = conn.prepare(&sql)?;
        let seeds = stmt
            .query_map(params![hostname, status.to_string(), limit], seed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(seeds)
    }

    /// Non-terminal seeds referencing the agent; at most one row by the
    /// one-active-seed-per-agent invariant.
    pub async fn read_active_seeds_for_agent(&self, hostname: &str) -> Result<Vec<Seed>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "{} WHERE (target_hostname = ?1 OR source_hostname = ?1)
               AND status NOT IN {} ORDER BY seed_id",
            SELECT_SEED, TERMINAL_STATUSES
        );
        let mut stmt = conn.prepare(&sql)?;
        let seeds = stmt
            .query_map([hostname], seed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(seeds)
    }

    // ========================================================================
    // Stage state observations
    // ========================================================================

    /// Append one observation row; observations are never mutated.
    pub async fn append_seed_stage_state(&self, state: &SeedStageState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO seed_stage_state
                 (seed_id, hostname, stage, status, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.seed_id,
                state.hostname,
                state.stage.to_string(),
                state.status.to_string(),
                state.details,
                state.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Observation log for a seed, newest first.
    pub async fn read_seed_stage_states(&self, seed_id: i64) -> Result<Vec<SeedStageState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seed_id, hostname, stage, status, details, timestamp
             FROM seed_stage_state WHERE seed_id = ?1 ORDER BY id DESC",
        )?;
        let states = stmt
            .query_map([seed_id], |row| {
                Ok(SeedStageState {
                    seed_id: row.get(0)?,
                    hostname: row.get(1)?,
                    stage: parse_col(2, row.get::<_, String>(2)?)?,
                    status: parse_col(3, row.get::<_, String>(3)?)?,
                    details: row.get(4)?,
                    timestamp: parse_ts(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Overwrite an agent's clock fields directly (test setup only).
    #[cfg(test)]
    pub(crate) async fn force_agent_timestamps(
        &self,
        hostname: &str,
        last_seen: DateTime<Utc>,
        last_checked: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE host_agent SET last_seen = ?1, last_checked = ?2 WHERE hostname = ?3",
            params![
                last_seen.to_rfc3339(),
                last_checked.map(|t| t.to_rfc3339()),
                hostname
            ],
        )?;
        Ok(())
    }
}

const SELECT_SEED: &str = "SELECT seed_id, target_hostname, source_hostname, method, backup_side,
        stage, status, retries, created_at, updated_at FROM seed";

fn seed_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Seed> {
    Ok(Seed {
        seed_id: row.get(0)?,
        target_hostname: row.get(1)?,
        source_hostname: row.get(2)?,
        method: parse_col(3, row.get::<_, String>(3)?)?,
        backup_side: parse_col(4, row.get::<_, String>(4)?)?,
        stage: parse_col(5, row.get::<_, String>(5)?)?,
        status: parse_col(6, row.get::<_, String>(6)?)?,
        retries: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        updated_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("timestamps are written as RFC 3339")
        .with_timezone(&Utc)
}

fn parse_col<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}
