//! Process supervision capability
//!
//! Starting and stopping node processes belongs to an external supervisor.
//! The manager only asks for it through [`NodeSupervisor`] and keeps its own
//! registry bookkeeping in step.

use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::info;

use crate::registry::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to start node {id}: {reason}")]
    Start { id: NodeId, reason: String },

    #[error("Failed to stop node {id}: {reason}")]
    Stop { id: NodeId, reason: String },
}

pub trait NodeSupervisor: Send + Sync {
    fn start(&self, id: NodeId) -> Result<(), SupervisorError>;

    fn stop(&self, id: NodeId) -> Result<(), SupervisorError>;

    fn is_alive(&self, id: NodeId) -> bool;
}

/// Supervisor for deployments where an operator launches nodes by hand
///
/// `start` records the request and logs the command to run; `is_alive`
/// reports whether a start was requested and not yet stopped.
#[derive(Debug, Default)]
pub struct ManualSupervisor {
    requested: Mutex<BTreeSet<NodeId>>,
}

impl ManualSupervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeSupervisor for ManualSupervisor {
    fn start(&self, id: NodeId) -> Result<(), SupervisorError> {
        let mut requested = self.requested.lock().map_err(|e| SupervisorError::Start {
            id,
            reason: e.to_string(),
        })?;
        requested.insert(id);
        info!("Start node {} with: civicvault node --id {}", id, id);
        Ok(())
    }

    fn stop(&self, id: NodeId) -> Result<(), SupervisorError> {
        let mut requested = self.requested.lock().map_err(|e| SupervisorError::Stop {
            id,
            reason: e.to_string(),
        })?;
        requested.remove(&id);
        info!("Stop node {} by terminating its process", id);
        Ok(())
    }

    fn is_alive(&self, id: NodeId) -> bool {
        self.requested
            .lock()
            .map(|requested| requested.contains(&id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_supervisor_tracks_requests() {
        let supervisor = ManualSupervisor::new();
        assert!(!supervisor.is_alive(1));

        supervisor.start(1).unwrap();
        assert!(supervisor.is_alive(1));

        supervisor.stop(1).unwrap();
        assert!(!supervisor.is_alive(1));
    }
}
