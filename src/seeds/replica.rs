//! Attach-replica step: turn the freshly seeded target MySQL into a
//! replica of the source MySQL.
//!
//! The actual SQL goes through the [`Topology`] trait so the state
//! machine can be exercised without a MySQL server.

use std::sync::Arc;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::seeds::SeedMetadata;

/// One MySQL server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlEndpoint {
    pub hostname: String,
    pub port: u16,
}

/// Credentials the target uses to replicate from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationCredentials {
    pub username: String,
    pub password: String,
}

/// Topology MySQL access used by the ConnectSlave stage.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Read the replication user credentials from the source MySQL via
    /// the configured query.
    async fn replication_credentials(
        &self,
        source: &MySqlEndpoint,
    ) -> Result<ReplicationCredentials>;

    /// Point the target at the source and start replication.
    async fn attach_replica(
        &self,
        target: &MySqlEndpoint,
        source: &MySqlEndpoint,
        credentials: &ReplicationCredentials,
        metadata: &SeedMetadata,
    ) -> Result<()>;
}

/// Production topology over `mysql_async`, logging in as the
/// configured topology user.
pub struct MySqlTopology {
    config: Arc<Config>,
}

impl MySqlTopology {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn opts(&self, endpoint: &MySqlEndpoint) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(endpoint.hostname.clone())
            .tcp_port(endpoint.port)
            .user(Some(self.config.mysql_topology_user.clone()))
            .pass(Some(self.config.mysql_topology_password.clone()))
            .into()
    }
}

#[async_trait]
impl Topology for MySqlTopology {
    async fn replication_credentials(
        &self,
        source: &MySqlEndpoint,
    ) -> Result<ReplicationCredentials> {
        let query = self.config.replication_credentials_query.trim();
        if query.is_empty() {
            return Err(Error::Topology(
                "replication_credentials_query is not configured".to_string(),
            ));
        }

        let mut conn = Conn::new(self.opts(source)).await?;
        let row: Option<(String, String)> = conn.query_first(query).await?;
        conn.disconnect().await?;

        let (username, password) = row.ok_or_else(|| {
            Error::Topology("replication credentials query returned no rows".to_string())
        })?;
        Ok(ReplicationCredentials { username, password })
    }

    async fn attach_replica(
        &self,
        target: &MySqlEndpoint,
        source: &MySqlEndpoint,
        credentials: &ReplicationCredentials,
        metadata: &SeedMetadata,
    ) -> Result<()> {
        let mut conn = Conn::new(self.opts(target)).await?;

        let gtid_mode: Option<String> = conn
            .query_first("SELECT @@GLOBAL.gtid_mode")
            .await
            .unwrap_or(None);
        let use_gtid = gtid_enabled(metadata, gtid_mode.as_deref());

        if use_gtid {
            conn.query_drop("RESET MASTER").await?;
            conn.query_drop(format!(
                "SET GLOBAL gtid_purged = '{}'",
                escape(&metadata.gtid_executed)
            ))
            .await?;
        }
        conn.query_drop(change_master_sql(source, credentials, metadata, use_gtid))
            .await?;
        conn.query_drop("START SLAVE").await?;
        conn.disconnect().await?;

        info!(
            target = %target.hostname,
            source = %source.hostname,
            gtid = use_gtid,
            "attached replica"
        );
        Ok(())
    }
}

/// GTID attach requires both a reported GTID set and GTID mode ON on
/// the target; anything else falls back to file and position.
fn gtid_enabled(metadata: &SeedMetadata, gtid_mode: Option<&str>) -> bool {
    !metadata.gtid_executed.is_empty() && gtid_mode.is_some_and(|mode| mode.eq_ignore_ascii_case("ON"))
}

fn change_master_sql(
    source: &MySqlEndpoint,
    credentials: &ReplicationCredentials,
    metadata: &SeedMetadata,
    use_gtid: bool,
) -> String {
    let common = format!(
        "CHANGE MASTER TO MASTER_HOST = '{}', MASTER_PORT = {}, MASTER_USER = '{}', MASTER_PASSWORD = '{}'",
        escape(&source.hostname),
        source.port,
        escape(&credentials.username),
        escape(&credentials.password),
    );
    if use_gtid {
        format!("{}, MASTER_AUTO_POSITION = 1", common)
    } else {
        format!(
            "{}, MASTER_LOG_FILE = '{}', MASTER_LOG_POS = {}",
            common,
            escape(&metadata.log_file),
            metadata.log_pos
        )
    }
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "''")
}
