use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PmwError {
    #[error("not initialized: run 'pmw init'")]
    NotInitialized,

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("plan already exists: {0} (choose resume, replace, or rename)")]
    PlanExists(String),

    #[error("invalid plan id '{0}': must be kebab-case, at most 50 characters")]
    InvalidPlanId(String),

    #[error("missing artifact '{artifact}' for plan '{plan}' (produced by {producer})")]
    MissingArtifact {
        artifact: String,
        plan: String,
        producer: String,
    },

    #[error("schema violation in '{artifact}': {reason}")]
    SchemaViolation { artifact: String, reason: String },

    #[error("count mismatch for {what}: expected {expected}, found {actual}")]
    CountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("scope mismatch: {0}")]
    ScopeMismatch(String),

    #[error("dependency cycle in {kind}: {}", .path.join(" -> "))]
    Cycle { kind: String, path: Vec<String> },

    #[error("verification failed for {target}: {reason}")]
    VerificationFailure { target: String, reason: String },

    #[error("{loop_name} loop exceeded its limit of {cap} iterations with unresolved findings")]
    IterationLimitExceeded { loop_name: String, cap: u32 },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: String, value: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("invalid step '{step}' in {task}: {reason}")]
    InvalidStep {
        task: String,
        step: String,
        reason: String,
    },

    #[error("finding not found: {0}")]
    FindingNotFound(String),

    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    #[error("invalid domain registration '{key}': {reason}")]
    InvalidDomain { key: String, reason: String },

    #[error("module not found in architecture index: {0}")]
    ModuleNotFound(String),

    #[error("profile '{profile}' is not defined for module '{module}'")]
    ProfileNotDefined { module: String, profile: String },

    #[error("no '{kind}' command defined for module '{module}'")]
    CommandNotDefined { module: String, kind: String },

    #[error("plan '{0}' is locked by another writer")]
    Locked(String),

    #[error("a phase of plan '{0}' is already running")]
    PhaseRunning(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PmwError>;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Coarse error taxonomy surfaced to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingArtifact,
    SchemaViolation,
    CountMismatch,
    ScopeMismatch,
    CycleError,
    VerificationFailure,
    IterationLimitExceeded,
    Conflict,
    NotFound,
    InvalidInput,
    Locked,
    Io,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::MissingArtifact => "missing_artifact",
            ErrorCategory::SchemaViolation => "schema_violation",
            ErrorCategory::CountMismatch => "count_mismatch",
            ErrorCategory::ScopeMismatch => "scope_mismatch",
            ErrorCategory::CycleError => "cycle_error",
            ErrorCategory::VerificationFailure => "verification_failure",
            ErrorCategory::IterationLimitExceeded => "iteration_limit_exceeded",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Locked => "locked",
            ErrorCategory::Io => "io",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PmwError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PmwError::MissingArtifact { .. } => ErrorCategory::MissingArtifact,
            PmwError::SchemaViolation { .. } | PmwError::Yaml(_) | PmwError::Json(_) => {
                ErrorCategory::SchemaViolation
            }
            PmwError::CountMismatch { .. } => ErrorCategory::CountMismatch,
            PmwError::ScopeMismatch(_) | PmwError::InvalidStep { .. } => {
                ErrorCategory::ScopeMismatch
            }
            PmwError::Cycle { .. } => ErrorCategory::CycleError,
            PmwError::VerificationFailure { .. } => ErrorCategory::VerificationFailure,
            PmwError::IterationLimitExceeded { .. } => ErrorCategory::IterationLimitExceeded,
            PmwError::PlanExists(_) | PmwError::TaskExists(_) | PmwError::InvalidTransition { .. } => {
                ErrorCategory::Conflict
            }
            PmwError::NotInitialized
            | PmwError::PlanNotFound(_)
            | PmwError::TaskNotFound(_)
            | PmwError::FindingNotFound(_)
            | PmwError::ModuleNotFound(_)
            | PmwError::ProfileNotDefined { .. }
            | PmwError::CommandNotDefined { .. } => ErrorCategory::NotFound,
            PmwError::InvalidPlanId(_)
            | PmwError::InvalidPhase(_)
            | PmwError::InvalidValue { .. }
            | PmwError::UnknownDomain(_)
            | PmwError::InvalidDomain { .. } => ErrorCategory::InvalidInput,
            PmwError::Locked(_) | PmwError::PhaseRunning(_) => ErrorCategory::Locked,
            PmwError::Io(_) => ErrorCategory::Io,
        }
    }

    /// A short, actionable suggestion shown next to the error.
    pub fn recovery_hint(&self) -> String {
        match self {
            PmwError::NotInitialized => "run 'pmw init' in the project root".to_string(),
            PmwError::PlanNotFound(id) => format!("check 'pmw plan list' for '{id}'"),
            PmwError::PlanExists(id) => format!(
                "re-run with --on-conflict resume|replace|rename to handle existing plan '{id}'"
            ),
            PmwError::MissingArtifact { producer, .. } => {
                format!("re-run the {producer} phase to produce it")
            }
            PmwError::SchemaViolation { artifact, .. } | PmwError::CountMismatch { what: artifact, .. } => {
                format!("regenerate '{artifact}' from its upstream phase")
            }
            PmwError::Yaml(_) | PmwError::Json(_) => {
                "repair or regenerate the malformed artifact".to_string()
            }
            PmwError::Cycle { .. } => {
                "remove one dependency edge from the reported path, then re-plan".to_string()
            }
            PmwError::VerificationFailure { .. } => {
                "fix the failure, then re-run the task".to_string()
            }
            PmwError::IterationLimitExceeded { .. } => {
                "resolve the remaining findings manually, then advance the plan".to_string()
            }
            PmwError::InvalidTransition { .. } => {
                "check 'pmw status get' for the current phase".to_string()
            }
            PmwError::Locked(id) => format!(
                "wait for the other writer to finish and retry; if no pmw process is running, delete .plan/plans/{id}/.lock"
            ),
            PmwError::PhaseRunning(_) => {
                "wait for the running 'pmw phase next' or 'pmw phase run' to finish".to_string()
            }
            PmwError::ModuleNotFound(_)
            | PmwError::ProfileNotDefined { .. }
            | PmwError::CommandNotDefined { .. } => {
                "add the module to .plan/architecture.yaml".to_string()
            }
            PmwError::UnknownDomain(_) | PmwError::InvalidDomain { .. } => {
                "register the domain in .plan/config.yaml".to_string()
            }
            PmwError::ScopeMismatch(_) | PmwError::InvalidStep { .. } => {
                "use concrete file paths from the deliverable's affected files".to_string()
            }
            _ => "correct the input and retry".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_shows_path() {
        let err = PmwError::Cycle {
            kind: "deliverables".to_string(),
            path: vec!["1".to_string(), "2".to_string(), "1".to_string()],
        };
        assert_eq!(err.to_string(), "dependency cycle in deliverables: 1 -> 2 -> 1");
        assert_eq!(err.category(), ErrorCategory::CycleError);
    }

    #[test]
    fn yaml_errors_are_schema_violations() {
        let err: PmwError = serde_yaml::from_str::<u32>("not: [a number").unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::SchemaViolation);
    }

    #[test]
    fn every_error_has_a_hint() {
        let err = PmwError::IterationLimitExceeded {
            loop_name: "verify".to_string(),
            cap: 5,
        };
        assert!(err.recovery_hint().contains("manually"));
        assert_eq!(err.category().as_str(), "iteration_limit_exceeded");
    }
}
