//! Storage layer for agents, seeds and stage observations.

mod sqlite;

pub use sqlite::SqliteStorage;
