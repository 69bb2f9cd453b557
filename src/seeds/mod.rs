//! Seeds: one cloning workflow instance per (target, source) pair.

pub mod feasibility;
pub mod machine;
pub mod replica;
mod types;

pub use machine::SeedStateMachine;
pub use replica::{MySqlEndpoint, MySqlTopology, ReplicationCredentials, Topology};
pub use types::{
    acting_sides, Engine, Seed, SeedMetadata, SeedMethod, SeedSide, SeedStage, SeedStageState,
    SeedStatus, StageStatus,
};

use crate::agents::Agent;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;

/// Create a new seed after gating it on feasibility.
///
/// The method name is parsed first, then the pure capability checks
/// run, and finally neither agent may already take part in an active
/// seed. Returns the new seed id; the seed starts at
/// (Prepare, Started, 0 retries).
pub async fn create_seed(
    storage: &SqliteStorage,
    config: &Config,
    method_name: &str,
    target: &Agent,
    source: &Agent,
) -> Result<i64> {
    let method: SeedMethod = method_name.parse().map_err(Error::CapabilityMismatch)?;
    let backup_side = feasibility::check_feasible(
        target,
        source,
        method,
        config.seed_acceptable_bytes_diff,
    )?;

    for agent in [target, source] {
        let active = storage
            .read_active_seeds_for_agent(&agent.info.hostname)
            .await?;
        if let Some(existing) = active.first() {
            return Err(Error::Conflict(format!(
                "Agent {} already has active seed {}",
                agent.info.hostname, existing.seed_id
            )));
        }
    }

    storage
        .create_seed(
            &target.info.hostname,
            &source.info.hostname,
            method,
            backup_side,
        )
        .await
}
