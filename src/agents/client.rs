//! HTTP client for one agent.
//!
//! All endpoints live under `http://<host>:<port>/api` and carry the
//! agent's shared token as a bearer header. Stage commands only start
//! work on the agent; progress is read back with `seed_stage_state`.
//! Retrying a start for an already-started stage is safe, the agent
//! ignores the duplicate.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::data::{AgentData, AgentInfo};
use crate::error::{Error, Result};
use crate::seeds::{SeedMetadata, SeedMethod, SeedSide, SeedStage, SeedStageState};

/// Client for a single agent endpoint.
///
/// Stateless apart from the shared connection pool; cheap to construct
/// per call site.
#[derive(Clone)]
pub struct AgentClient {
    http: Client,
    hostname: String,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(http: Client, info: &AgentInfo, timeout: Duration) -> Self {
        Self {
            http,
            hostname: info.hostname.clone(),
            base_url: format!("http://{}:{}/api", info.hostname, info.port),
            token: info.token.clone(),
            timeout,
        }
    }

    /// Fetch the agent's capability snapshot.
    pub async fn get_agent_data(&self) -> Result<AgentData> {
        self.get_json("get-agent-data").await
    }

    /// Unmount the agent's snapshot mount point; the agent answers with
    /// a refreshed capability snapshot.
    pub async fn unmount(&self) -> Result<AgentData> {
        self.get_json("umount").await
    }

    /// Start the prepare stage on the agent.
    pub async fn prepare(&self, seed_id: i64, method: SeedMethod, side: SeedSide) -> Result<()> {
        self.command(&format!("prepare/{}/{}/{}", seed_id, method, side))
            .await
    }

    /// Start the backup stage; the agent needs the peer's MySQL endpoint.
    pub async fn backup(
        &self,
        seed_id: i64,
        method: SeedMethod,
        peer_hostname: &str,
        peer_mysql_port: u16,
    ) -> Result<()> {
        self.command(&format!(
            "backup/{}/{}/{}/{}",
            seed_id, method, peer_hostname, peer_mysql_port
        ))
        .await
    }

    /// Start the restore stage on the agent.
    pub async fn restore(&self, seed_id: i64, method: SeedMethod) -> Result<()> {
        self.command(&format!("restore/{}/{}", seed_id, method)).await
    }

    /// Start the cleanup stage on the agent.
    pub async fn cleanup(&self, seed_id: i64, method: SeedMethod, side: SeedSide) -> Result<()> {
        self.command(&format!("cleanup/{}/{}/{}", seed_id, method, side))
            .await
    }

    /// Current stage state as reported by the agent.
    pub async fn seed_stage_state(&self, seed_id: i64, stage: SeedStage) -> Result<SeedStageState> {
        self.get_json(&format!("seed-stage-state/{}/{}", seed_id, stage))
            .await
    }

    /// Backup position metadata for the attach-replica step.
    pub async fn get_metadata(&self, seed_id: i64, method: SeedMethod) -> Result<SeedMetadata> {
        self.get_json(&format!("get-metadata/{}/{}", seed_id, method))
            .await
    }

    /// Ask the agent to abort a seed. Best-effort: accepted whenever the
    /// agent is reachable.
    pub async fn abort_seed(&self, seed_id: i64) -> Result<()> {
        self.command(&format!("abort-seed/{}", seed_id)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, command: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, command);
        debug!(agent = %self.hostname, %url, "agent GET");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(command, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Unreachable(format!(
                "{} {} -> HTTP {}",
                self.hostname, command, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| self.unreachable(command, e))
    }

    /// Issue a start-style command. 2xx means the agent accepted the
    /// work; any other status is a rejection.
    async fn command(&self, command: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_url, command);
        debug!(agent = %self.hostname, %url, "agent command");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(command, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Rejected(format!(
                "{} {} -> HTTP {}",
                self.hostname, command, status
            )))
        }
    }

    fn unreachable(&self, command: &str, err: reqwest::Error) -> Error {
        Error::Unreachable(format!("{} {}: {}", self.hostname, command, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::mock::MockAgent;
    use chrono::Utc;

    fn client_for(info: &AgentInfo) -> AgentClient {
        AgentClient::new(Client::new(), info, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_get_agent_data() {
        let mock = MockAgent::spawn("127.0.0.1").await;
        let client = client_for(&mock.info());

        let data = client.get_agent_data().await.unwrap();
        assert_eq!(data, mock.data().await);
        assert!(data.mysql_running);
    }

    #[tokio::test]
    async fn test_stage_commands_accepted_and_recorded() {
        let mock = MockAgent::spawn("127.0.0.1").await;
        let client = client_for(&mock.info());

        client
            .prepare(1, SeedMethod::Mydumper, SeedSide::Target)
            .await
            .unwrap();
        client
            .backup(1, SeedMethod::Mydumper, "127.0.0.2", 3306)
            .await
            .unwrap();
        client.restore(1, SeedMethod::Mydumper).await.unwrap();
        client
            .cleanup(1, SeedMethod::Mydumper, SeedSide::Source)
            .await
            .unwrap();
        client.abort_seed(1).await.unwrap();

        let calls = mock.calls().await;
        assert_eq!(
            calls,
            vec![
                "prepare/1/Mydumper/Target",
                "backup/1/Mydumper/127.0.0.2/3306",
                "restore/1/Mydumper",
                "cleanup/1/Mydumper/Source",
                "abort-seed/1",
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_start_maps_to_rejected() {
        let mock = MockAgent::spawn("127.0.0.1").await;
        mock.reject_starts(true);
        let client = client_for(&mock.info());

        let err = client
            .prepare(1, SeedMethod::Mydumper, SeedSide::Target)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        // Bind and immediately drop a listener so the port is free.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let info = AgentInfo {
            hostname: "127.0.0.1".to_string(),
            port,
            token: "token".to_string(),
            mysql_port: 3306,
        };
        let client = client_for(&info);
        let err = client.get_agent_data().await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_stage_state_round_trip() {
        let mock = MockAgent::spawn("127.0.0.1").await;
        mock.set_stage_state(SeedStageState {
            seed_id: 3,
            stage: SeedStage::Backup,
            hostname: "127.0.0.1".to_string(),
            timestamp: Utc::now(),
            status: crate::seeds::StageStatus::Running,
            details: "running backup stage".to_string(),
        })
        .await;

        let client = client_for(&mock.info());
        let state = client.seed_stage_state(3, SeedStage::Backup).await.unwrap();
        assert_eq!(state.seed_id, 3);
        assert_eq!(state.stage, SeedStage::Backup);
        assert_eq!(state.details, "running backup stage");
    }

    #[tokio::test]
    async fn test_get_metadata() {
        let mock = MockAgent::spawn("127.0.0.1").await;
        mock.set_metadata(SeedMetadata {
            log_file: "mysql-bin.000003".to_string(),
            log_pos: 154,
            gtid_executed: String::new(),
        })
        .await;

        let client = client_for(&mock.info());
        let metadata = client.get_metadata(1, SeedMethod::Mydumper).await.unwrap();
        assert_eq!(metadata.log_file, "mysql-bin.000003");
        assert_eq!(metadata.log_pos, 154);
    }
}
