//! Seed scheduler: the coordinator's periodic ticks.
//!
//! One tick steps every active seed; another refreshes outdated agents
//! and forgets long-unseen ones. Seeds are stepped independently, each
//! under its own per-seed-id lock, so one seed's failure or slowness
//! never affects the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::agents::{AgentInfo, AgentRegistry};
use crate::config::Config;
use crate::error::Result;
use crate::seeds::{Seed, SeedStateMachine, SeedStatus};
use crate::shutdown::Shutdown;
use crate::storage::SqliteStorage;

/// Capacity of the seeded-agents observability channel; sends never
/// block and overflow is dropped with a warning.
const SEEDED_AGENTS_BUFFER: usize = 16;

/// Tracks per-seed locks so a slow tick cannot overlap a seed with the
/// next tick or with an operator abort.
#[derive(Clone, Default)]
struct SeedLocks {
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl SeedLocks {
    async fn acquire(&self, seed_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(seed_id)
            .or_default()
            .clone()
    }

    async fn release_terminal(&self, seed_id: i64) {
        self.locks.lock().await.remove(&seed_id);
    }
}

/// Periodic driver for seeds and the agent registry.
pub struct Scheduler {
    storage: SqliteStorage,
    config: Arc<Config>,
    registry: AgentRegistry,
    machine: SeedStateMachine,
    locks: SeedLocks,
    seeded_tx: mpsc::Sender<AgentInfo>,
    shutdown: Shutdown,
}

impl Scheduler {
    /// Build a scheduler; the returned receiver yields the target agent
    /// of every seed that completes.
    pub fn new(
        storage: SqliteStorage,
        config: Arc<Config>,
        registry: AgentRegistry,
        machine: SeedStateMachine,
        shutdown: Shutdown,
    ) -> (Self, mpsc::Receiver<AgentInfo>) {
        let (seeded_tx, seeded_rx) = mpsc::channel(SEEDED_AGENTS_BUFFER);
        (
            Self {
                storage,
                config,
                registry,
                machine,
                locks: SeedLocks::default(),
                seeded_tx,
                shutdown,
            },
            seeded_rx,
        )
    }

    /// Run both periodic ticks until shutdown is requested. In-flight
    /// steps finish; no new ticks start afterwards.
    pub async fn run(&self) {
        info!(
            seed_interval = self.config.seed_process_seconds,
            poll_minutes = self.config.agent_poll_minutes,
            "scheduler started"
        );
        let mut seed_tick =
            tokio::time::interval(Duration::from_secs(self.config.seed_process_seconds.max(1)));
        let mut agent_tick = tokio::time::interval(Duration::from_secs(
            (self.config.agent_poll_minutes.max(1) as u64) * 60,
        ));

        loop {
            tokio::select! {
                _ = seed_tick.tick() => self.process_seeds().await,
                _ = agent_tick.tick() => self.refresh_agents().await,
                _ = self.shutdown.wait() => {
                    info!("scheduler stopped");
                    return;
                }
            }
        }
    }

    /// One seed tick: step every active seed, each at most once,
    /// concurrently across seeds.
    pub async fn process_seeds(&self) {
        let seeds = match self.storage.read_active_seeds().await {
            Ok(seeds) => seeds,
            Err(e) => {
                error!(error = %e, "failed to load active seeds");
                return;
            }
        };
        if seeds.is_empty() {
            return;
        }
        debug!(count = seeds.len(), "processing seeds");

        let mut join_set: JoinSet<()> = JoinSet::new();
        for seed in seeds {
            let machine = self.machine.clone();
            let locks = self.locks.clone();
            let storage = self.storage.clone();
            let seeded_tx = self.seeded_tx.clone();
            let shutdown = self.shutdown.clone();
            join_set.spawn(async move {
                let lock = locks.acquire(seed.seed_id).await;
                let _guard = lock.lock().await;
                let _step = shutdown.step_guard();
                let mut seed = seed;
                step_one(&machine, &storage, &seeded_tx, &mut seed).await;
                if seed.is_terminal() {
                    locks.release_terminal(seed.seed_id).await;
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    /// One agent tick: refresh every outdated agent, then forget the
    /// long-unseen ones.
    pub async fn refresh_agents(&self) {
        match self.registry.read_outdated_agents().await {
            Ok(outdated) => {
                for mut agent in outdated {
                    if let Err(e) = self.registry.update_agent(&mut agent).await {
                        warn!(agent = %agent.info.hostname, error = %e, "agent refresh failed");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to load outdated agents"),
        }

        if let Err(e) = self.registry.forget_long_unseen_agents().await {
            error!(error = %e, "failed to forget unseen agents");
        }
    }

    /// Operator abort: flip the seed to Failed under its lock and fire
    /// best-effort aborts at both agents.
    pub async fn abort_seed(&self, seed_id: i64) -> Result<()> {
        let lock = self.locks.acquire(seed_id).await;
        let _guard = lock.lock().await;
        let mut seed = self.storage.read_seed(seed_id).await?;
        self.machine.abort(&mut seed).await?;
        self.locks.release_terminal(seed_id).await;
        Ok(())
    }
}

async fn step_one(
    machine: &SeedStateMachine,
    storage: &SqliteStorage,
    seeded_tx: &mpsc::Sender<AgentInfo>,
    seed: &mut Seed,
) {
    let seed_id = seed.seed_id;
    if let Err(e) = machine.step(seed).await {
        // The seed stays as-is and is retried on the next tick.
        if e.is_persistence() {
            error!(seed = seed_id, error = %e, "seed step aborted on persistence failure");
        } else {
            warn!(seed = seed_id, error = %e, "seed step failed");
        }
        return;
    }

    if seed.status == SeedStatus::Completed {
        match storage.read_agent_info(&seed.target_hostname).await {
            Ok(agent) => {
                if seeded_tx.try_send(agent.info).is_err() {
                    warn!(seed = seed_id, "seeded-agents channel full, dropping notification");
                }
            }
            Err(e) => warn!(seed = seed_id, error = %e, "seeded agent lookup failed"),
        }
    }
}
