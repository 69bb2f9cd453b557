//! Seed domain types.
//!
//! Every enum here has a stable string form that is used both in HTTP
//! paths to agents and in persistence; the mapping is canonical and
//! case is preserved exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a seed moves the data from source to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeedMethod {
    Mydumper,
    Mysqldump,
    Xtrabackup,
}

impl std::fmt::Display for SeedMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mydumper => write!(f, "Mydumper"),
            Self::Mysqldump => write!(f, "Mysqldump"),
            Self::Xtrabackup => write!(f, "Xtrabackup"),
        }
    }
}

impl std::str::FromStr for SeedMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Mydumper" => Ok(Self::Mydumper),
            "Mysqldump" => Ok(Self::Mysqldump),
            "Xtrabackup" => Ok(Self::Xtrabackup),
            _ => Err(format!("Unknown seed method: {}", s)),
        }
    }
}

/// Which party produces the backup for a given method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeedSide {
    Target,
    Source,
}

impl std::fmt::Display for SeedSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target => write!(f, "Target"),
            Self::Source => write!(f, "Source"),
        }
    }
}

impl std::str::FromStr for SeedSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Target" => Ok(Self::Target),
            "Source" => Ok(Self::Source),
            _ => Err(format!("Unknown seed side: {}", s)),
        }
    }
}

/// Ordered phases of a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeedStage {
    Prepare,
    Backup,
    Restore,
    Cleanup,
    ConnectSlave,
}

impl SeedStage {
    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<SeedStage> {
        match self {
            Self::Prepare => Some(Self::Backup),
            Self::Backup => Some(Self::Restore),
            Self::Restore => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::ConnectSlave),
            Self::ConnectSlave => None,
        }
    }
}

impl std::fmt::Display for SeedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "Prepare"),
            Self::Backup => write!(f, "Backup"),
            Self::Restore => write!(f, "Restore"),
            Self::Cleanup => write!(f, "Cleanup"),
            Self::ConnectSlave => write!(f, "ConnectSlave"),
        }
    }
}

impl std::str::FromStr for SeedStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Prepare" => Ok(Self::Prepare),
            "Backup" => Ok(Self::Backup),
            "Restore" => Ok(Self::Restore),
            "Cleanup" => Ok(Self::Cleanup),
            "ConnectSlave" => Ok(Self::ConnectSlave),
            _ => Err(format!("Unknown seed stage: {}", s)),
        }
    }
}

/// Seed status, as driven by the coordinator.
///
/// A seed moves Started -> Running and then either advances (back to
/// Started on the next stage), retries the same stage, or ends in one
/// of the terminal statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeedStatus {
    Started,
    Running,
    Completed,
    Failed,
}

impl SeedStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "Started"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for SeedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Started" => Ok(Self::Started),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown seed status: {}", s)),
        }
    }
}

/// Stage status as reported by an agent for one stage.
///
/// Unlike [`SeedStatus`] this includes `Errored`: an agent-side error
/// that the coordinator treats as retryable until the per-stage retry
/// budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    Started,
    Running,
    Completed,
    Errored,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "Started"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Errored => write!(f, "Errored"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Started" => Ok(Self::Started),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Errored" => Ok(Self::Errored),
            "Failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown stage status: {}", s)),
        }
    }
}

/// MySQL storage engine, as reported by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "InnoDB")]
    InnoDb,
    #[serde(rename = "MyISAM")]
    MyIsam,
    #[serde(rename = "ROCKSDB")]
    RocksDb,
    #[serde(rename = "TokuDB")]
    TokuDb,
    #[serde(rename = "MRG_MYISAM")]
    MrgMyisam,
    #[serde(rename = "CSV")]
    Csv,
    #[serde(rename = "BLACKHOLE")]
    Blackhole,
    #[serde(rename = "MEMORY")]
    Memory,
    #[serde(rename = "ARCHIVE")]
    Archive,
    #[serde(rename = "FEDERATED")]
    Federated,
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InnoDb => "InnoDB",
            Self::MyIsam => "MyISAM",
            Self::RocksDb => "ROCKSDB",
            Self::TokuDb => "TokuDB",
            Self::MrgMyisam => "MRG_MYISAM",
            Self::Csv => "CSV",
            Self::Blackhole => "BLACKHOLE",
            Self::Memory => "MEMORY",
            Self::Archive => "ARCHIVE",
            Self::Federated => "FEDERATED",
        };
        write!(f, "{}", s)
    }
}

/// Which sides must act for a stage.
///
/// This table is data, keyed by (stage, backup side); ConnectSlave is
/// executed by the coordinator itself and has no acting agent.
pub fn acting_sides(stage: SeedStage, backup_side: SeedSide) -> &'static [SeedSide] {
    const BOTH: &[SeedSide] = &[SeedSide::Target, SeedSide::Source];
    const TARGET: &[SeedSide] = &[SeedSide::Target];
    const SOURCE: &[SeedSide] = &[SeedSide::Source];
    const COORDINATOR: &[SeedSide] = &[];

    match stage {
        SeedStage::Prepare | SeedStage::Cleanup => BOTH,
        SeedStage::Backup => match backup_side {
            SeedSide::Target => TARGET,
            SeedSide::Source => SOURCE,
        },
        SeedStage::Restore => TARGET,
        SeedStage::ConnectSlave => COORDINATOR,
    }
}

/// One seed workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    pub seed_id: i64,
    pub target_hostname: String,
    pub source_hostname: String,
    pub method: SeedMethod,
    pub backup_side: SeedSide,
    pub stage: SeedStage,
    pub status: SeedStatus,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Seed {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Hostname of the given side.
    pub fn hostname(&self, side: SeedSide) -> &str {
        match side {
            SeedSide::Target => &self.target_hostname,
            SeedSide::Source => &self.source_hostname,
        }
    }

    /// Hostname of the opposite side.
    pub fn peer_hostname(&self, side: SeedSide) -> &str {
        match side {
            SeedSide::Target => &self.source_hostname,
            SeedSide::Source => &self.target_hostname,
        }
    }
}

/// One stage state observation reported by an agent.
///
/// Append-only: rows are written when the scheduler polls and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedStageState {
    #[serde(rename = "seedID")]
    pub seed_id: i64,
    pub stage: SeedStage,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    pub status: StageStatus,
    pub details: String,
}

/// Backup position metadata reported by the source agent, used to
/// attach the target as a replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedMetadata {
    #[serde(rename = "logFile", default)]
    pub log_file: String,
    #[serde(rename = "logPos", default)]
    pub log_pos: i64,
    #[serde(rename = "gtidExecuted", default)]
    pub gtid_executed: String,
}
