//! Agents: remote worker processes, one per managed MySQL server.

mod client;
mod data;
mod registry;

#[cfg(test)]
pub(crate) mod mock;

pub use client::AgentClient;
pub use data::{
    Agent, AgentData, AgentInfo, AgentStatus, LogicalVolume, Mount, MySqlDatabase, SeedMethodOpts,
    SYSTEM_DATABASES,
};
pub use registry::AgentRegistry;
