//! Minimal persistence for download tasks (SQLite via sqlx).
//!
//! Holds what a restarted daemon needs to resume: status, byte offset,
//! total, paths and the resolved descriptor. Deployments are not persisted.

mod db;
mod downloads;

pub use db::TaskStore;

use serde::{Deserialize, Serialize};

use crate::catalog::ModelDescriptor;
use crate::types::DownloadSnapshot;

/// One persisted download row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDownload {
    pub snapshot: DownloadSnapshot,
    /// Resolved fetch location; absent until the catalog answered.
    pub descriptor: Option<ModelDescriptor>,
}
