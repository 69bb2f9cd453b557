//! Durable catalog of known agents.
//!
//! An agent registers itself, gets its capability snapshot fetched
//! synchronously, and is then refreshed on a schedule. Agents that stay
//! unseen past the forget horizon are dropped, unless an active seed
//! still references them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::client::AgentClient;
use super::data::{Agent, AgentData, AgentInfo, AgentStatus};
use crate::config::Config;
use crate::error::Result;
use crate::storage::SqliteStorage;

/// Registry over the `host_agent` table plus the agent HTTP surface.
#[derive(Clone)]
pub struct AgentRegistry {
    storage: SqliteStorage,
    config: Arc<Config>,
    http: Client,
}

impl AgentRegistry {
    pub fn new(storage: SqliteStorage, config: Arc<Config>, http: Client) -> Self {
        Self {
            storage,
            config,
            http,
        }
    }

    pub fn client(&self, info: &AgentInfo) -> AgentClient {
        AgentClient::new(
            self.http.clone(),
            info,
            Duration::from_secs(self.config.agent_http_timeout_seconds),
        )
    }

    /// Register a new agent (or replace an existing row by hostname).
    ///
    /// The initial snapshot is fetched synchronously; if the agent is
    /// unreachable the registration fails. A background discovery of
    /// the managed MySQL instance is kicked off on success.
    pub async fn register(&self, info: AgentInfo) -> Result<String> {
        let data = self.client(&info).get_agent_data().await?;

        let agent = Agent {
            info: info.clone(),
            data,
            last_seen: Utc::now(),
            last_checked: None,
            status: AgentStatus::Active,
        };
        self.storage.save_agent(&agent).await?;
        info!(agent = %info.hostname, "registered agent");

        self.discover_agent_instance(info.clone());

        Ok(info.hostname)
    }

    pub async fn read_agents(&self) -> Result<Vec<Agent>> {
        self.storage.read_agents().await
    }

    pub async fn read_agents_info(&self) -> Result<Vec<Agent>> {
        self.storage.read_agents_info().await
    }

    pub async fn read_agent(&self, hostname: &str) -> Result<Agent> {
        self.storage.read_agent(hostname).await
    }

    pub async fn read_agent_info(&self, hostname: &str) -> Result<Agent> {
        self.storage.read_agent_info(hostname).await
    }

    /// Agents due for a refresh: `last_checked` missing or older than
    /// the poll interval.
    pub async fn read_outdated_agents(&self) -> Result<Vec<Agent>> {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.config.agent_poll_minutes);
        self.storage.read_outdated_agents(cutoff).await
    }

    /// Refresh one agent's snapshot.
    ///
    /// `last_checked` is stamped before the attempt. On success the
    /// agent becomes Active with a fresh snapshot and `last_seen`; on
    /// failure it becomes Inactive and the stored snapshot stays as it
    /// was.
    pub async fn update_agent(&self, agent: &mut Agent) -> Result<()> {
        debug!(agent = %agent.info.hostname, "refreshing agent");
        self.storage
            .touch_agent_last_checked(&agent.info.hostname)
            .await?;

        match self.client(&agent.info).get_agent_data().await {
            Ok(data) => {
                self.storage
                    .update_agent_data(&agent.info.hostname, &data)
                    .await?;
                agent.data = data;
                agent.status = AgentStatus::Active;
                agent.last_seen = Utc::now();
                Ok(())
            }
            Err(e) => {
                warn!(agent = %agent.info.hostname, error = %e, "agent refresh failed");
                agent.status = AgentStatus::Inactive;
                self.storage
                    .update_agent_status(&agent.info.hostname, AgentStatus::Inactive)
                    .await?;
                Err(e)
            }
        }
    }

    /// Drop agents unseen past the forget horizon. Agents referenced by
    /// an active seed are kept.
    pub async fn forget_long_unseen_agents(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.unseen_agent_forget_hours);
        let deleted = self.storage.forget_unseen_agents(cutoff).await?;
        if deleted > 0 {
            info!(count = deleted, "forgot long-unseen agents");
        }
        Ok(deleted)
    }

    /// Unmount the agent's snapshot mount point and persist the
    /// refreshed snapshot it answers with.
    pub async fn unmount(&self, hostname: &str) -> Result<AgentData> {
        let agent = self.storage.read_agent_info(hostname).await?;
        let data = self.client(&agent.info).unmount().await?;
        self.storage.update_agent_data(hostname, &data).await?;
        Ok(data)
    }

    /// Fire-and-forget probe of the agent's MySQL instance. Failure is
    /// logged and never affects the registration that triggered it.
    fn discover_agent_instance(&self, info: AgentInfo) {
        let timeout = Duration::from_secs(self.config.agent_http_timeout_seconds);
        tokio::spawn(async move {
            let addr = (info.hostname.clone(), info.mysql_port);
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {
                    info!(agent = %info.hostname, port = info.mysql_port, "discovered agent MySQL instance");
                }
                Ok(Err(e)) => {
                    warn!(agent = %info.hostname, port = info.mysql_port, error = %e, "agent MySQL instance discovery failed");
                }
                Err(_) => {
                    warn!(agent = %info.hostname, port = info.mysql_port, "agent MySQL instance discovery timed out");
                }
            }
        });
    }
}
