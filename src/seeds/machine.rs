//! Per-seed state machine.
//!
//! One `step` drives a seed through at most one transition. Stage
//! transitions are monotone; the only way back from Running to Started
//! is a retry, visible as the retry counter incrementing. A step
//! performs at most one seed update plus any number of observation
//! appends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::agents::{Agent, AgentClient, AgentInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::seeds::replica::{MySqlEndpoint, Topology};
use crate::seeds::{
    acting_sides, Seed, SeedSide, SeedStage, SeedStageState, SeedStatus, StageStatus,
};
use crate::storage::SqliteStorage;

/// Drives one seed forward by one transition per call.
#[derive(Clone)]
pub struct SeedStateMachine {
    storage: SqliteStorage,
    config: Arc<Config>,
    http: Client,
    topology: Arc<dyn Topology>,
}

impl SeedStateMachine {
    pub fn new(
        storage: SqliteStorage,
        config: Arc<Config>,
        http: Client,
        topology: Arc<dyn Topology>,
    ) -> Self {
        Self {
            storage,
            config,
            http,
            topology,
        }
    }

    fn client(&self, info: &AgentInfo) -> AgentClient {
        AgentClient::new(
            self.http.clone(),
            info,
            Duration::from_secs(self.config.agent_http_timeout_seconds),
        )
    }

    /// Advance the seed by at most one transition.
    ///
    /// Terminal seeds are left untouched. Unreachable agents stall a
    /// Running seed (no observation this tick) but count as a rejection
    /// when dispatching.
    pub async fn step(&self, seed: &mut Seed) -> Result<()> {
        if seed.is_terminal() {
            return Ok(());
        }

        let target = self.storage.read_agent_info(&seed.target_hostname).await?;
        let source = self.storage.read_agent_info(&seed.source_hostname).await?;

        match seed.status {
            SeedStatus::Started => self.dispatch(seed, &target, &source).await,
            SeedStatus::Running => self.poll(seed, &target, &source).await,
            SeedStatus::Completed | SeedStatus::Failed => Ok(()),
        }
    }

    /// Operator abort: terminal failure now, best-effort agent aborts.
    pub async fn abort(&self, seed: &mut Seed) -> Result<()> {
        if seed.is_terminal() {
            return Err(Error::Abort(format!(
                "Seed {} is already terminal ({})",
                seed.seed_id, seed.status
            )));
        }
        let target = self.storage.read_agent_info(&seed.target_hostname).await?;
        let source = self.storage.read_agent_info(&seed.source_hostname).await?;
        info!(seed = seed.seed_id, "aborting seed");
        seed.status = SeedStatus::Failed;
        self.storage.update_seed(seed).await?;
        self.abort_agents(seed, &target, &source).await;
        Ok(())
    }

    /// Ask every acting agent to start the current stage.
    async fn dispatch(&self, seed: &mut Seed, target: &Agent, source: &Agent) -> Result<()> {
        if seed.stage == SeedStage::ConnectSlave {
            return self.connect_slave(seed, target, source).await;
        }

        let mut failure: Option<Error> = None;
        for side in acting_sides(seed.stage, seed.backup_side) {
            let (agent, peer) = match side {
                SeedSide::Target => (target, source),
                SeedSide::Source => (source, target),
            };
            let client = self.client(&agent.info);
            let result = match seed.stage {
                SeedStage::Prepare => client.prepare(seed.seed_id, seed.method, *side).await,
                SeedStage::Backup => {
                    client
                        .backup(
                            seed.seed_id,
                            seed.method,
                            &peer.info.hostname,
                            peer.info.mysql_port,
                        )
                        .await
                }
                SeedStage::Restore => client.restore(seed.seed_id, seed.method).await,
                SeedStage::Cleanup => client.cleanup(seed.seed_id, seed.method, *side).await,
                SeedStage::ConnectSlave => unreachable!("handled above"),
            };
            if let Err(e) = result {
                warn!(
                    seed = seed.seed_id,
                    stage = %seed.stage,
                    agent = %agent.info.hostname,
                    error = %e,
                    "stage dispatch failed"
                );
                failure.get_or_insert(e);
            }
        }

        match failure {
            None => {
                debug!(seed = seed.seed_id, stage = %seed.stage, "stage dispatched");
                seed.status = SeedStatus::Running;
                self.storage.update_seed(seed).await
            }
            Some(_) => self.fail_or_retry(seed, target, source).await,
        }
    }

    /// Poll every acting agent, append what they report, and fold the
    /// reports into the next seed state.
    async fn poll(&self, seed: &mut Seed, target: &Agent, source: &Agent) -> Result<()> {
        let sides = acting_sides(seed.stage, seed.backup_side);
        let mut reported = Vec::with_capacity(sides.len());

        for side in sides {
            let agent = match side {
                SeedSide::Target => target,
                SeedSide::Source => source,
            };
            match self
                .client(&agent.info)
                .seed_stage_state(seed.seed_id, seed.stage)
                .await
            {
                Ok(state) => {
                    self.storage.append_seed_stage_state(&state).await?;
                    reported.push(state.status);
                }
                Err(e) => {
                    // No observation this tick; tolerated indefinitely.
                    debug!(
                        seed = seed.seed_id,
                        agent = %agent.info.hostname,
                        error = %e,
                        "stage state unavailable"
                    );
                }
            }
        }

        let any_failed = reported
            .iter()
            .any(|s| matches!(s, StageStatus::Failed | StageStatus::Errored));
        let all_completed =
            reported.len() == sides.len() && reported.iter().all(|s| *s == StageStatus::Completed);

        if any_failed {
            self.fail_or_retry(seed, target, source).await
        } else if all_completed {
            self.advance(seed).await
        } else {
            Ok(())
        }
    }

    /// Move to the next stage; the retry budget is per stage and resets
    /// on completion.
    async fn advance(&self, seed: &mut Seed) -> Result<()> {
        let next = seed
            .stage
            .next()
            .expect("stages with acting agents always have a successor");
        info!(
            seed = seed.seed_id,
            from = %seed.stage,
            to = %next,
            "stage completed"
        );
        seed.stage = next;
        seed.status = SeedStatus::Started;
        seed.retries = 0;
        self.storage.update_seed(seed).await
    }

    /// Retry the current stage while budget remains, otherwise fail the
    /// seed terminally and tell both agents to stop.
    async fn fail_or_retry(&self, seed: &mut Seed, target: &Agent, source: &Agent) -> Result<()> {
        if seed.retries < self.config.max_seed_retries_per_stage {
            seed.retries += 1;
            seed.status = SeedStatus::Started;
            warn!(
                seed = seed.seed_id,
                stage = %seed.stage,
                retries = seed.retries,
                "retrying stage"
            );
            self.storage.update_seed(seed).await
        } else {
            warn!(
                seed = seed.seed_id,
                stage = %seed.stage,
                "retries exhausted, failing seed"
            );
            seed.status = SeedStatus::Failed;
            self.storage.update_seed(seed).await?;
            self.abort_agents(seed, target, source).await;
            Ok(())
        }
    }

    async fn abort_agents(&self, seed: &Seed, target: &Agent, source: &Agent) {
        for agent in [target, source] {
            if let Err(e) = self.client(&agent.info).abort_seed(seed.seed_id).await {
                warn!(
                    seed = seed.seed_id,
                    agent = %agent.info.hostname,
                    error = %e,
                    "abort-seed delivery failed"
                );
            }
        }
    }

    /// Final stage, executed by the coordinator itself: fetch backup
    /// metadata from the source agent and attach the target MySQL as a
    /// replica of the source MySQL.
    async fn connect_slave(&self, seed: &mut Seed, target: &Agent, source: &Agent) -> Result<()> {
        match self.try_connect_slave(seed, target, source).await {
            Ok(()) => {
                self.storage
                    .append_seed_stage_state(&SeedStageState {
                        seed_id: seed.seed_id,
                        stage: SeedStage::ConnectSlave,
                        hostname: seed.target_hostname.clone(),
                        timestamp: Utc::now(),
                        status: StageStatus::Completed,
                        details: "attached".to_string(),
                    })
                    .await?;
                info!(seed = seed.seed_id, "seed completed");
                seed.status = SeedStatus::Completed;
                self.storage.update_seed(seed).await
            }
            Err(e) => {
                warn!(seed = seed.seed_id, error = %e, "connect-slave failed");
                self.storage
                    .append_seed_stage_state(&SeedStageState {
                        seed_id: seed.seed_id,
                        stage: SeedStage::ConnectSlave,
                        hostname: seed.target_hostname.clone(),
                        timestamp: Utc::now(),
                        status: StageStatus::Failed,
                        details: e.to_string(),
                    })
                    .await?;
                self.fail_or_retry(seed, target, source).await
            }
        }
    }

    async fn try_connect_slave(&self, seed: &Seed, target: &Agent, source: &Agent) -> Result<()> {
        let metadata = self
            .client(&source.info)
            .get_metadata(seed.seed_id, seed.method)
            .await?;

        let source_mysql = MySqlEndpoint {
            hostname: source.info.hostname.clone(),
            port: source.info.mysql_port,
        };
        let target_mysql = MySqlEndpoint {
            hostname: target.info.hostname.clone(),
            port: target.info.mysql_port,
        };

        let credentials = self.topology.replication_credentials(&source_mysql).await?;
        self.topology
            .attach_replica(&target_mysql, &source_mysql, &credentials, &metadata)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::mock::MockAgent;
    use crate::agents::{AgentStatus, AgentData};
    use crate::seeds::replica::fake::FakeTopology;
    use crate::seeds::{SeedMetadata, SeedMethod};

    struct Harness {
        storage: SqliteStorage,
        machine: SeedStateMachine,
        topology: Arc<FakeTopology>,
        target: MockAgent,
        source: MockAgent,
    }

    async fn harness() -> Harness {
        harness_with(Config::default(), FakeTopology::default()).await
    }

    async fn harness_with(config: Config, topology: FakeTopology) -> Harness {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let topology = Arc::new(topology);
        let machine = SeedStateMachine::new(
            storage.clone(),
            Arc::new(config),
            Client::new(),
            topology.clone(),
        );
        let target = MockAgent::spawn("127.0.0.1").await;
        let source = MockAgent::spawn("127.0.0.2").await;
        for mock in [&target, &source] {
            save_agent(&storage, mock).await;
        }
        Harness {
            storage,
            machine,
            topology,
            target,
            source,
        }
    }

    async fn save_agent(storage: &SqliteStorage, mock: &MockAgent) {
        storage
            .save_agent(&Agent {
                info: mock.info(),
                data: mock.data().await,
                last_seen: Utc::now(),
                last_checked: None,
                status: AgentStatus::Active,
            })
            .await
            .unwrap();
    }

    async fn new_seed(h: &Harness) -> Seed {
        let seed_id = h
            .storage
            .create_seed(
                &h.target.info().hostname,
                &h.source.info().hostname,
                SeedMethod::Mydumper,
                SeedSide::Target,
            )
            .await
            .unwrap();
        h.storage.read_seed(seed_id).await.unwrap()
    }

    async fn report(mock: &MockAgent, seed: &Seed, stage: SeedStage, status: StageStatus) {
        mock.set_stage_state(SeedStageState {
            seed_id: seed.seed_id,
            stage,
            hostname: mock.info().hostname,
            timestamp: Utc::now(),
            status,
            details: format!("{} {}", status, stage),
        })
        .await;
    }

    #[tokio::test]
    async fn test_dispatch_prepare_to_both_sides() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.stage, SeedStage::Prepare);
        assert_eq!(seed.status, SeedStatus::Running);

        let id = seed.seed_id;
        assert_eq!(
            h.target.calls().await,
            vec![format!("prepare/{}/Mydumper/Target", id)]
        );
        assert_eq!(
            h.source.calls().await,
            vec![format!("prepare/{}/Mydumper/Source", id)]
        );

        let stored = h.storage.read_seed(id).await.unwrap();
        assert_eq!(stored.status, SeedStatus::Running);
    }

    #[tokio::test]
    async fn test_poll_running_appends_observations_without_transition() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        h.machine.step(&mut seed).await.unwrap();

        report(&h.target, &seed, SeedStage::Prepare, StageStatus::Running).await;
        report(&h.source, &seed, SeedStage::Prepare, StageStatus::Running).await;

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(
            (seed.stage, seed.status, seed.retries),
            (SeedStage::Prepare, SeedStatus::Running, 0)
        );

        let states = h.storage.read_seed_stage_states(seed.seed_id).await.unwrap();
        assert_eq!(states.len(), 2);

        // Idempotence: same agent state, same fold.
        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(
            (seed.stage, seed.status, seed.retries),
            (SeedStage::Prepare, SeedStatus::Running, 0)
        );
        let states = h.storage.read_seed_stage_states(seed.seed_id).await.unwrap();
        assert_eq!(states.len(), 4);
    }

    #[tokio::test]
    async fn test_one_side_completed_does_not_advance() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        h.machine.step(&mut seed).await.unwrap();

        report(&h.target, &seed, SeedStage::Prepare, StageStatus::Completed).await;
        report(&h.source, &seed, SeedStage::Prepare, StageStatus::Running).await;

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.stage, SeedStage::Prepare);
        assert_eq!(seed.status, SeedStatus::Running);
    }

    #[tokio::test]
    async fn test_both_completed_advances_and_resets_retries() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        seed.retries = 1;
        h.storage.update_seed(&seed).await.unwrap();
        h.machine.step(&mut seed).await.unwrap();

        report(&h.target, &seed, SeedStage::Prepare, StageStatus::Completed).await;
        report(&h.source, &seed, SeedStage::Prepare, StageStatus::Completed).await;

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.stage, SeedStage::Backup);
        assert_eq!(seed.status, SeedStatus::Started);
        assert_eq!(seed.retries, 0);
    }

    #[tokio::test]
    async fn test_backup_dispatch_only_backup_side_with_peer_endpoint() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        seed.stage = SeedStage::Backup;
        h.storage.update_seed(&seed).await.unwrap();

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Running);

        let source_info = h.source.info();
        assert_eq!(
            h.target.calls().await,
            vec![format!(
                "backup/{}/Mydumper/{}/{}",
                seed.seed_id, source_info.hostname, source_info.mysql_port
            )]
        );
        assert!(h.source.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_errored_report_retries_stage() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        h.machine.step(&mut seed).await.unwrap();

        report(&h.target, &seed, SeedStage::Prepare, StageStatus::Errored).await;
        report(&h.source, &seed, SeedStage::Prepare, StageStatus::Running).await;

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.stage, SeedStage::Prepare);
        assert_eq!(seed.status, SeedStatus::Started);
        assert_eq!(seed.retries, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_and_aborts_both() {
        let h = harness_with(
            Config {
                max_seed_retries_per_stage: 0,
                ..Config::default()
            },
            FakeTopology::default(),
        )
        .await;
        let mut seed = new_seed(&h).await;
        h.machine.step(&mut seed).await.unwrap();

        report(&h.target, &seed, SeedStage::Prepare, StageStatus::Failed).await;
        report(&h.source, &seed, SeedStage::Prepare, StageStatus::Running).await;

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Failed);
        assert!(seed.is_terminal());

        let abort = format!("abort-seed/{}", seed.seed_id);
        assert!(h.target.calls().await.contains(&abort));
        assert!(h.source.calls().await.contains(&abort));
    }

    #[tokio::test]
    async fn test_unreachable_while_running_is_absorbed() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        h.machine.step(&mut seed).await.unwrap();

        report(&h.target, &seed, SeedStage::Prepare, StageStatus::Running).await;
        h.source.shutdown();

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.stage, SeedStage::Prepare);
        assert_eq!(seed.status, SeedStatus::Running);
        assert_eq!(seed.retries, 0);

        // Only the reachable side produced an observation.
        let states = h.storage.read_seed_stage_states(seed.seed_id).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].hostname, h.target.info().hostname);
    }

    #[tokio::test]
    async fn test_unreachable_while_dispatching_counts_as_rejection() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        h.source.shutdown();

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.stage, SeedStage::Prepare);
        assert_eq!(seed.status, SeedStatus::Started);
        assert_eq!(seed.retries, 1);
    }

    #[tokio::test]
    async fn test_rejected_dispatch_retries() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        h.target.reject_starts(true);

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Started);
        assert_eq!(seed.retries, 1);

        h.target.reject_starts(false);
        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Running);
        assert_eq!(seed.retries, 1);
    }

    #[tokio::test]
    async fn test_connect_slave_attaches_with_source_metadata() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        seed.stage = SeedStage::ConnectSlave;
        h.storage.update_seed(&seed).await.unwrap();

        let metadata = SeedMetadata {
            log_file: "mysql-bin.000003".to_string(),
            log_pos: 154,
            gtid_executed: "3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5".to_string(),
        };
        h.source.set_metadata(metadata.clone()).await;

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.stage, SeedStage::ConnectSlave);
        assert_eq!(seed.status, SeedStatus::Completed);

        let calls = h.topology.attach_calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source.hostname, h.source.info().hostname);
        assert_eq!(calls[0].source.port, h.source.info().mysql_port);
        assert_eq!(calls[0].target.hostname, h.target.info().hostname);
        assert_eq!(calls[0].metadata.gtid_executed, metadata.gtid_executed);
        assert_eq!(calls[0].credentials.username, "slave");
        drop(calls);

        let states = h.storage.read_seed_stage_states(seed.seed_id).await.unwrap();
        assert_eq!(states[0].stage, SeedStage::ConnectSlave);
        assert_eq!(states[0].status, StageStatus::Completed);
        assert_eq!(states[0].details, "attached");
    }

    #[tokio::test]
    async fn test_connect_slave_failure_records_observation_and_retries() {
        let h = harness_with(Config::default(), FakeTopology::failing()).await;
        let mut seed = new_seed(&h).await;
        seed.stage = SeedStage::ConnectSlave;
        h.storage.update_seed(&seed).await.unwrap();

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Started);
        assert_eq!(seed.retries, 1);

        let states = h.storage.read_seed_stage_states(seed.seed_id).await.unwrap();
        assert_eq!(states[0].status, StageStatus::Failed);
        assert!(states[0].details.contains("CHANGE MASTER"));
    }

    #[tokio::test]
    async fn test_terminal_seed_is_noop() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        seed.status = SeedStatus::Completed;
        h.storage.update_seed(&seed).await.unwrap();

        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Completed);
        assert!(h.target.calls().await.is_empty());
        assert!(h.source.calls().await.is_empty());
        assert!(h
            .storage
            .read_seed_stage_states(seed.seed_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_operator_abort() {
        let h = harness().await;
        let mut seed = new_seed(&h).await;
        h.machine.step(&mut seed).await.unwrap();

        h.machine.abort(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Failed);

        let abort = format!("abort-seed/{}", seed.seed_id);
        assert!(h.target.calls().await.contains(&abort));
        assert!(h.source.calls().await.contains(&abort));

        assert!(h.machine.abort(&mut seed).await.is_err());
    }

    #[tokio::test]
    async fn test_step_reads_agents_without_snapshot() {
        // The machine only needs transport info; make sure it does not
        // depend on snapshot payloads being present.
        let h = harness().await;
        let hostname = h.target.info().hostname;
        let agent = h.storage.read_agent_info(&hostname).await.unwrap();
        assert_eq!(agent.data, AgentData::default());

        let mut seed = new_seed(&h).await;
        h.machine.step(&mut seed).await.unwrap();
        assert_eq!(seed.status, SeedStatus::Running);
    }
}
