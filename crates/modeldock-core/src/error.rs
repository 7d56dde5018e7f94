//! Errors surfaced to orchestrator callers.
//!
//! Transient transfer errors and single failed health probes are absorbed
//! internally; only the kinds below reach a caller.

use crate::catalog::CatalogError;
use crate::scheduler::Pool;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Command not valid in the current state. No state change happened.
    #[error("cannot {command} {kind} in state {state}")]
    InvalidTransition {
        command: &'static str,
        kind: &'static str,
        state: String,
    },
    /// Storage reservation failed; the task never started.
    #[error("insufficient space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    /// Admission rejected; nothing was created.
    #[error("{pool} queue is full (capacity {capacity})")]
    QueueFull { pool: Pool, capacity: usize },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("model source not found: {0}")]
    SourceNotFound(String),
    #[error("catalog: {0}")]
    Catalog(String),
    #[error("no usable network binding: {0}")]
    Binding(String),
    #[error("storage: {0}")]
    Storage(StorageError),
    #[error("task store: {0}")]
    Store(String),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    pub(crate) fn invalid(command: &'static str, kind: &'static str, state: impl ToString) -> Self {
        OrchestratorError::InvalidTransition {
            command,
            kind,
            state: state.to_string(),
        }
    }

    pub(crate) fn download_not_found(id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            kind: "download",
            id: id.to_string(),
        }
    }

    pub(crate) fn deployment_not_found(id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            kind: "deployment",
            id: id.to_string(),
        }
    }

    /// Stable machine-readable name, used on the control socket.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidTransition { .. } => "invalid_transition",
            OrchestratorError::InsufficientSpace { .. } => "insufficient_space",
            OrchestratorError::QueueFull { .. } => "queue_full",
            OrchestratorError::NotFound { .. } => "not_found",
            OrchestratorError::SourceNotFound(_) => "source_not_found",
            OrchestratorError::Catalog(_) => "catalog",
            OrchestratorError::Binding(_) => "binding",
            OrchestratorError::Storage(_) => "storage",
            OrchestratorError::Store(_) => "store",
            OrchestratorError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InsufficientSpace {
                required,
                available,
            } => OrchestratorError::InsufficientSpace {
                required,
                available,
            },
            other => OrchestratorError::Storage(other),
        }
    }
}

impl From<CatalogError> for OrchestratorError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(model) => OrchestratorError::SourceNotFound(model),
            other => OrchestratorError::Catalog(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(e: anyhow::Error) -> Self {
        OrchestratorError::Store(format!("{e:#}"))
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_is_lifted_out_of_storage() {
        let e: OrchestratorError = StorageError::InsufficientSpace {
            required: 10,
            available: 3,
        }
        .into();
        assert_eq!(e.kind(), "insufficient_space");
        assert_eq!(e.to_string(), "insufficient space: need 10 bytes, 3 available");
    }

    #[test]
    fn invalid_transition_message_names_command_and_state() {
        let e = OrchestratorError::invalid("pause", "download", "completed");
        assert_eq!(e.to_string(), "cannot pause download in state completed");
    }
}
