pub mod config;
pub mod logging;

// Orchestrator building blocks, bottom-up.
pub mod error;
pub mod types;
pub mod retry;
pub mod storage;
pub mod transfer;
pub mod catalog;
pub mod scheduler;
pub mod events;
pub mod store;
pub mod download;
pub mod deployment;
pub mod monitor;
pub mod orchestrator;
pub mod control;

pub use error::{OrchestratorError, Result};
pub use orchestrator::{DeploymentRequest, DownloadRequest, Orchestrator, OrchestratorBuilder};
