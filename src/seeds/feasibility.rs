//! Seed feasibility: can this method clone source onto target?
//!
//! Pure over the two capability snapshots; checks run in a fixed order
//! and the first failure wins.

use crate::agents::Agent;
use crate::error::{Error, Result};
use crate::seeds::{SeedMethod, SeedSide};

/// Decide whether `method` can seed `target` from `source`.
///
/// Returns the backup side taken from the source's method options.
/// The caller is responsible for the remaining non-pure check, that
/// neither agent already takes part in an active seed.
pub fn check_feasible(
    target: &Agent,
    source: &Agent,
    method: SeedMethod,
    acceptable_bytes_diff: i64,
) -> Result<SeedSide> {
    if target.info.hostname == source.info.hostname {
        return Err(Error::CapabilityMismatch(format!(
            "Agent {} cannot seed itself",
            target.info.hostname
        )));
    }

    let source_opts = source
        .data
        .available_seed_methods
        .get(&method)
        .ok_or_else(|| {
            Error::CapabilityMismatch(format!(
                "Seed method {} not supported by source agent {}",
                method, source.info.hostname
            ))
        })?;
    let backup_side = source_opts.backup_side.unwrap_or(SeedSide::Target);

    if !target.data.available_seed_methods.contains_key(&method) {
        return Err(Error::CapabilityMismatch(format!(
            "Seed method {} not supported by target agent {}",
            method, target.info.hostname
        )));
    }

    for (name, database) in source.data.user_databases() {
        for engine in &database.engines {
            if !source_opts.supported_engines.contains(engine) {
                return Err(Error::CapabilityMismatch(format!(
                    "Database {} uses engine {} which {} does not support",
                    name, engine, method
                )));
            }
        }
    }

    if !version_at_least(&target.data.mysql_version, &source.data.mysql_version) {
        return Err(Error::CapabilityMismatch(format!(
            "Target MySQL version {} is older than source version {}",
            target.data.mysql_version, source.data.mysql_version
        )));
    }

    if target.data.mysql_datadir_disk_free + acceptable_bytes_diff
        < source.data.mysql_datadir_disk_used
    {
        return Err(Error::CapabilityMismatch(format!(
            "Not enough free space in target datadir: {} free vs {} used on source",
            target.data.mysql_datadir_disk_free, source.data.mysql_datadir_disk_used
        )));
    }

    Ok(backup_side)
}

/// Compare MySQL versions on their numeric dot components; trailing
/// build suffixes like "-log" are ignored. MySQL versions are not
/// strict semver.
fn version_at_least(target: &str, source: &str) -> bool {
    version_components(target) >= version_components(source)
}

fn version_components(version: &str) -> Vec<u64> {
    version
        .split(['-', '_', '+'])
        .next()
        .unwrap_or_default()
        .split('.')
        .map_while(|part| part.parse().ok())
        .collect()
}
