//! Typed error hierarchy for the Gantry orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError`: job tree creation, status derivation, dispatch
//! - `PhaseError`: per-phase execution failures inside the pipeline engine
//! - `GateError`: gate decision validation and application

use thiserror::Error;

/// Errors from the job orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Job {id} is a child job; status must be requested on its parent")]
    NotAParent { id: String },

    #[error("Job {id} is not runnable in status '{status}'")]
    NotRunnable { id: String, status: String },

    #[error("Job {id} is already executing in this process")]
    AlreadyRunning { id: String },

    #[error("Job {id} has no pipeline run attached")]
    NoRun { id: String },

    #[error("Job {id} cannot be cancelled from status '{status}'")]
    NotCancellable { id: String, status: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase '{phase}' failed: {message}")]
    WorkFailed { phase: String, message: String },

    #[error("Phase index {index} is out of range for pipeline '{kind}'")]
    InvalidPhaseIndex { kind: String, index: usize },

    #[error("Job {id} carries no board snapshot in its config")]
    MissingSnapshot { id: String },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Errors from the gate decision handler.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Run {id} is not awaiting a gate (status '{status}')")]
    NotAwaitingGate { id: String, status: String },

    #[error("Run {id} is awaiting gate '{expected}', not '{submitted}'")]
    WrongGate {
        id: String,
        expected: String,
        submitted: String,
    },

    #[error("Unknown gate '{gate}' for pipeline '{kind}'")]
    UnknownGate { gate: String, kind: String },

    #[error("Invalid decision '{0}': expected approve, revise, or scrap")]
    InvalidDecision(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_error_not_found_carries_id() {
        let err = OrchestratorError::JobNotFound { id: "abc".into() };
        match &err {
            OrchestratorError::JobNotFound { id } => assert_eq!(id, "abc"),
            _ => panic!("Expected JobNotFound variant"),
        }
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn orchestrator_error_not_runnable_names_status() {
        let err = OrchestratorError::NotRunnable {
            id: "j1".into(),
            status: "completed".into(),
        };
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn phase_error_converts_from_orchestrator_error() {
        let inner = OrchestratorError::JobNotFound { id: "j2".into() };
        let phase_err: PhaseError = inner.into();
        match &phase_err {
            PhaseError::Orchestrator(OrchestratorError::JobNotFound { id }) => {
                assert_eq!(id, "j2");
            }
            _ => panic!("Expected PhaseError::Orchestrator(JobNotFound)"),
        }
    }

    #[test]
    fn gate_error_wrong_gate_names_both_gates() {
        let err = GateError::WrongGate {
            id: "r1".into(),
            expected: "approval_outline".into(),
            submitted: "approval_draft".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("approval_outline"));
        assert!(msg.contains("approval_draft"));
    }

    #[test]
    fn gate_error_variants_are_distinct() {
        let not_awaiting = GateError::NotAwaitingGate {
            id: "r".into(),
            status: "drafting".into(),
        };
        let unknown = GateError::UnknownGate {
            gate: "approval_x".into(),
            kind: "seo_content".into(),
        };
        assert!(matches!(not_awaiting, GateError::NotAwaitingGate { .. }));
        assert!(matches!(unknown, GateError::UnknownGate { .. }));
        assert!(!matches!(not_awaiting, GateError::UnknownGate { .. }));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let orch = OrchestratorError::AlreadyRunning { id: "x".into() };
        assert_std_error(&orch);
        let phase = PhaseError::WorkFailed {
            phase: "importing_cards".into(),
            message: "boom".into(),
        };
        assert_std_error(&phase);
        let gate = GateError::InvalidDecision("maybe".into());
        assert_std_error(&gate);
    }
}
