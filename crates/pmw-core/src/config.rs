use crate::error::{PmwError, Result};
use crate::paths;
use crate::lock::LockSettings;
use crate::skills::{DomainDescriptor, DomainRegistry, SYSTEM_DOMAIN};
use crate::types::FindingType;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// IterationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationConfig {
    #[serde(default = "default_verify_cap")]
    pub verify: u32,
    #[serde(default = "default_finalize_cap")]
    pub finalize: u32,
    /// Verification attempts per task before it is blocked.
    #[serde(default = "default_task_attempts")]
    pub task_verification: u32,
}

fn default_verify_cap() -> u32 {
    5
}

fn default_finalize_cap() -> u32 {
    3
}

fn default_task_attempts() -> u32 {
    3
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            verify: default_verify_cap(),
            finalize: default_finalize_cap(),
            task_verification: default_task_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_verification_timeout")]
    pub verification_timeout_seconds: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    /// A plan lock older than this is treated as left by a crashed writer.
    #[serde(default = "default_stale_lock")]
    pub stale_lock_seconds: u64,
}

fn default_max_parallel() -> usize {
    3
}

fn default_verification_timeout() -> u64 {
    600
}

fn default_lock_timeout() -> u64 {
    10_000
}

fn default_stale_lock() -> u64 {
    900
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            verification_timeout_seconds: default_verification_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            stale_lock_seconds: default_stale_lock(),
        }
    }
}

// ---------------------------------------------------------------------------
// PlanningConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCreationMode {
    /// One task per (deliverable, profile).
    #[default]
    Strict,
    /// Legacy: merge independent deliverables that share domain, module and profile.
    Aggregate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default)]
    pub task_creation: TaskCreationMode,
}

// ---------------------------------------------------------------------------
// VerificationConfig
// ---------------------------------------------------------------------------

/// A project-wide check run by the verify phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCommand {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Finding type recorded when this command fails.
    #[serde(default = "default_failure_kind")]
    pub kind: FindingType,
}

fn default_failure_kind() -> FindingType {
    FindingType::BuildError
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub commands: Vec<VerificationCommand>,
}

// ---------------------------------------------------------------------------
// FinalizeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    /// Step names recorded via `finalize-step` (commit, push, pr, ...).
    #[serde(default = "default_finalize_steps")]
    pub steps: Vec<String>,
    #[serde(default = "default_archive_on_complete")]
    pub archive_on_complete: bool,
}

fn default_finalize_steps() -> Vec<String> {
    ["commit", "push", "create-pr", "automated-review", "knowledge-capture"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_archive_on_complete() -> bool {
    true
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            steps: default_finalize_steps(),
            archive_on_complete: default_archive_on_complete(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<DomainDescriptor>,
    #[serde(default)]
    pub iterations: IterationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
}

fn default_version() -> u32 {
    1
}

impl WorkflowConfig {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            domains: Vec::new(),
            iterations: IterationConfig::default(),
            execution: ExecutionConfig::default(),
            planning: PlanningConfig::default(),
            verification: VerificationConfig::default(),
            finalize: FinalizeConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(PmwError::NotInitialized);
        }
        crate::io::read_yaml(&path, "config")
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        crate::io::write_yaml(&paths::config_path(root), self)
    }

    pub fn domain_registry(&self) -> Result<DomainRegistry> {
        DomainRegistry::from_descriptors(&self.domains)
    }

    pub fn has_domain(&self, key: &str) -> bool {
        self.domains.iter().any(|d| d.key == key)
    }

    /// Rejects domains that are reserved or not configured for this project.
    pub fn check_domains(&self, domains: &[String]) -> Result<()> {
        for d in domains {
            if d == SYSTEM_DOMAIN || !self.has_domain(d) {
                return Err(PmwError::UnknownDomain(d.clone()));
            }
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.execution.lock_timeout_ms)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            timeout: self.lock_timeout(),
            stale_after: std::time::Duration::from_secs(self.execution.stale_lock_seconds),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if let Err(e) = self.domain_registry() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: e.to_string(),
            });
        }

        if self.iterations.verify == 0 || self.iterations.finalize == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "iteration caps must be at least 1".to_string(),
            });
        }
        if self.iterations.verify > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "iterations.verify={} (>10 is unusual)",
                    self.iterations.verify
                ),
            });
        }
        if self.iterations.task_verification == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "iterations.task_verification must be at least 1".to_string(),
            });
        }

        if self.execution.max_parallel == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "execution.max_parallel must be at least 1".to_string(),
            });
        }
        if self.execution.verification_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "execution.verification_timeout_seconds=0 disables the timeout"
                    .to_string(),
            });
        }

        for cmd in &self.verification.commands {
            if cmd.command.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("verification command '{}' is empty", cmd.name),
                });
            }
        }

        if self.planning.task_creation == TaskCreationMode::Aggregate {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "planning.task_creation=aggregate is a legacy mode".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
