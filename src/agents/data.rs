//! Agent identity and capability snapshot model.
//!
//! Field spellings mirror the agent wire payload exactly, including its
//! historical quirks (`AvailiableSeedMethods`, `SnaphostHosts`); the
//! snapshot is persisted as-is and must round-trip losslessly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::seeds::{Engine, SeedMethod, SeedSide};

/// Transport identity of an agent, unique by hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
    pub port: u16,
    pub token: String,
    pub mysql_port: u16,
}

/// Liveness of an agent: Active iff the last refresh succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Inactive => write!(f, "Inactive"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(Self::Active),
            "Inactive" => Ok(Self::Inactive),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

/// Per-method options an agent advertises.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedMethodOpts {
    #[serde(rename = "BackupSide", default)]
    pub backup_side: Option<SeedSide>,
    #[serde(rename = "SupportedEngines", default)]
    pub supported_engines: Vec<Engine>,
    #[serde(rename = "BackupToDatadir", default)]
    pub backup_to_datadir: bool,
}

/// One user database as seen by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MySqlDatabase {
    #[serde(rename = "Engines", default)]
    pub engines: Vec<Engine>,
    #[serde(rename = "Size", default)]
    pub size: i64,
}

/// An LVM logical volume on the agent host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalVolume {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "GroupName", default)]
    pub group_name: String,
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "IsSnapshot", default)]
    pub is_snapshot: bool,
    #[serde(rename = "SnapshotPercent", default)]
    pub snapshot_percent: f64,
}

/// A file system mount point on the agent host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "Device", default)]
    pub device: String,
    #[serde(rename = "LVPath", default)]
    pub lv_path: String,
    #[serde(rename = "FileSystem", default)]
    pub file_system: String,
    #[serde(rename = "IsMounted", default)]
    pub is_mounted: bool,
    #[serde(rename = "DiskUsage", default)]
    pub disk_usage: i64,
}

/// The last successful capability payload from an agent.
///
/// Overwritten in full on each successful refresh; a failed refresh
/// leaves the previous snapshot untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentData {
    #[serde(rename = "LocalSnapshotsHosts", default)]
    pub local_snapshots_hosts: Vec<String>,
    #[serde(rename = "SnaphostHosts", default)]
    pub snapshot_hosts: Vec<String>,
    #[serde(rename = "LogicalVolumes", default)]
    pub logical_volumes: Vec<LogicalVolume>,
    #[serde(rename = "MountPoint", default)]
    pub mount_point: Option<Mount>,
    #[serde(rename = "BackupDir", default)]
    pub backup_dir: String,
    #[serde(rename = "BackupDirDiskFree", default)]
    pub backup_dir_disk_free: i64,
    #[serde(rename = "MySQLRunning", default)]
    pub mysql_running: bool,
    #[serde(rename = "MySQLDatadir", default)]
    pub mysql_datadir: String,
    #[serde(rename = "MySQLDatadirDiskUsed", default)]
    pub mysql_datadir_disk_used: i64,
    #[serde(rename = "MySQLDatadirDiskFree", default)]
    pub mysql_datadir_disk_free: i64,
    #[serde(rename = "MySQLVersion", default)]
    pub mysql_version: String,
    #[serde(rename = "MySQLDatabases", default)]
    pub mysql_databases: HashMap<String, MySqlDatabase>,
    #[serde(rename = "AvailiableSeedMethods", default)]
    pub available_seed_methods: HashMap<SeedMethod, SeedMethodOpts>,
}

/// Databases MySQL itself owns; they never constrain seed methods.
pub const SYSTEM_DATABASES: &[&str] = &["mysql", "sys", "information_schema", "performance_schema"];

impl AgentData {
    /// User databases only.
    pub fn user_databases(&self) -> impl Iterator<Item = (&String, &MySqlDatabase)> {
        self.mysql_databases
            .iter()
            .filter(|(name, _)| !SYSTEM_DATABASES.contains(&name.as_str()))
    }
}

/// A known agent: identity plus the last observed snapshot and
/// liveness bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub info: AgentInfo,
    pub data: AgentData,
    pub last_seen: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub status: AgentStatus,
}
