//! seedr - coordinator for distributed MySQL seeding
//!
//! seedr drives remote, single-purpose worker processes ("agents")
//! through the stages of cloning a MySQL data directory from a source
//! host onto a target host, and finally attaches the target as a
//! replica of the source.
//!
//! ## How a seed runs
//!
//! ```text
//! Prepare -> Backup -> Restore -> Cleanup -> ConnectSlave
//! ```
//!
//! Prepare and Cleanup run on both agents, Backup on the method's
//! backup side, Restore on the target; ConnectSlave is executed by the
//! coordinator itself against the two MySQL servers. Stage commands
//! only *start* work on an agent; a periodic scheduler polls the
//! reported stage states, records every observation durably, and folds
//! them into the next transition, so the whole workflow survives
//! coordinator restarts.

pub mod agents;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod seeds;
pub mod shutdown;
pub mod storage;

pub use error::{Error, Result};
