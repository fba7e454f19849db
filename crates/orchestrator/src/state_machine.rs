use cluster_core::{ClusterEntity, Operation, OperationStatus, Phase};

use crate::error::{OrchestratorError, Result};

const MUTATING_OPERATIONS: [Operation; 3] = [Operation::Update, Operation::Upgrade, Operation::Delete];

pub struct ClusterStateMachine;

impl ClusterStateMachine {
    pub fn validate_transition(from: &Phase, to: &Phase) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn allowed_transitions(from: &Phase) -> Vec<Phase> {
        match from.status {
            OperationStatus::InProgress => vec![
                Phase::succeeded(from.operation),
                Phase::failed(from.operation),
            ],
            OperationStatus::Succeeded if from.operation == Operation::Delete => vec![],
            OperationStatus::Succeeded | OperationStatus::Failed => MUTATING_OPERATIONS
                .iter()
                .map(|op| Phase::in_progress(*op))
                .collect(),
            OperationStatus::Unknown => std::iter::once(Operation::Create)
                .chain(MUTATING_OPERATIONS)
                .map(Phase::in_progress)
                .collect(),
        }
    }

    pub fn can_transition(from: &Phase, to: &Phase) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// Single-writer guard: a cluster with an operation in flight accepts no other.
    pub fn ensure_idle(entity: &ClusterEntity) -> Result<()> {
        if entity.is_busy() {
            return Err(OrchestratorError::ClusterBusy {
                name: entity.name.clone(),
                phase: entity.status.phase.to_string(),
            });
        }
        Ok(())
    }

    /// Check that `operation` may start on `entity` and return its in-progress phase.
    pub fn begin(entity: &ClusterEntity, operation: Operation) -> Result<Phase> {
        Self::ensure_idle(entity)?;
        let next = Phase::in_progress(operation);
        Self::validate_transition(&entity.status.phase, &next)?;
        Ok(next)
    }
}
