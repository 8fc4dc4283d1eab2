// Core modules
pub mod commands;
pub mod config;
pub mod conn;
pub mod ledger;
pub mod loader;
pub mod optimizer;
pub mod orchestrator;
pub mod partition;
pub mod planner;
pub mod query;
pub mod schema;
pub mod sql;

// Re-export for convenience
pub use config::Config;
pub use conn::Session;
pub use orchestrator::{Orchestrator, RunSummary};
pub use partition::{Month, Partition, ServiceType};
