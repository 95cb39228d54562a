use serde::{Deserialize, Serialize};

use crate::model::ExternalReferences;

use super::SyncError;

/// Tunables shared by client and repository replicators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of early events held per source while waiting for a gap
    /// to close.
    pub reorder_capacity: usize,

    /// What happens to references leaving a subtree hydrated from a peer.
    pub hydration_references: ExternalReferences,

    /// Treat repository events caused by our own commands as acknowledgements
    /// instead of applying them a second time.
    pub acknowledge_own_commands: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reorder_capacity: 1024,
            hydration_references: ExternalReferences::Preserve,
            acknowledge_own_commands: true,
        }
    }
}

impl SyncConfig {
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_reorder_capacity(mut self, capacity: usize) -> Self {
        self.reorder_capacity = capacity;
        self
    }
}
