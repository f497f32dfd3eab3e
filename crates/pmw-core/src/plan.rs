use crate::error::{PmwError, Result};
use crate::io;
use crate::lock::{LockSettings, PlanLock};
use crate::paths;
use crate::references::References;
use crate::request::Request;
use crate::skills::SYSTEM_DOMAIN;
use crate::types::{Compatibility, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// PlanConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSettings {
    #[serde(default = "default_commit_strategy")]
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_prefix: Option<String>,
}

fn default_commit_strategy() -> String {
    "per_plan".to_string()
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            strategy: default_commit_strategy(),
            message_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSettings {
    #[serde(default = "default_true")]
    pub create: bool,
    #[serde(default = "default_base_branch")]
    pub base: String,
}

fn default_true() -> bool {
    true
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for BranchSettings {
    fn default() -> Self {
        Self {
            create: true,
            base: default_base_branch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestSettings {
    #[serde(default = "default_true")]
    pub create: bool,
    #[serde(default)]
    pub draft: bool,
}

impl Default for PullRequestSettings {
    fn default() -> Self {
        Self {
            create: true,
            draft: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub plan_id: String,
    /// Ordered; the first domain wins when resolving phase handlers.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub compatibility: Compatibility,
    #[serde(default)]
    pub commit: CommitSettings,
    #[serde(default)]
    pub branch: BranchSettings,
    #[serde(default)]
    pub pull_request: PullRequestSettings,
    pub created_at: DateTime<Utc>,
}

impl PlanConfig {
    pub fn new(plan_id: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            domains,
            compatibility: Compatibility::default(),
            commit: CommitSettings::default(),
            branch: BranchSettings::default(),
            pull_request: PullRequestSettings::default(),
            created_at: Utc::now(),
        }
    }

    fn validate(&self) -> Result<()> {
        paths::validate_plan_id(&self.plan_id)?;
        for d in &self.domains {
            if d == SYSTEM_DOMAIN || !paths::is_kebab(d) {
                return Err(PmwError::UnknownDomain(d.clone()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PlanStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub entered: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeStep {
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Why a plan ended up aborted or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNote {
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatus {
    pub plan_id: String,
    pub phase: Phase,
    #[serde(default)]
    pub phase_history: Vec<PhaseTransition>,
    #[serde(default)]
    pub verify_iteration: u32,
    #[serde(default)]
    pub finalize_iteration: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub finalize_steps: BTreeMap<String, FinalizeStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StatusNote>,
    pub updated_at: DateTime<Utc>,
}

impl PlanStatus {
    pub fn new(plan_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan_id.into(),
            phase: Phase::Init,
            phase_history: vec![PhaseTransition {
                phase: Phase::Init,
                entered: now,
                exited: None,
                note: None,
            }],
            verify_iteration: 0,
            finalize_iteration: 0,
            finalize_steps: BTreeMap::new(),
            outcome: None,
            updated_at: now,
        }
    }

    /// Records entry into `phase`, closing the open history entry.
    pub(crate) fn enter(&mut self, phase: Phase, note: Option<String>) {
        let now = Utc::now();
        if let Some(last) = self.phase_history.last_mut() {
            if last.exited.is_none() {
                last.exited = Some(now);
            }
        }
        self.phase_history.push(PhaseTransition {
            phase,
            entered: now,
            exited: None,
            note,
        });
        self.phase = phase;
        self.updated_at = now;
    }

    pub(crate) fn record_finalize_step(
        &mut self,
        step: &str,
        outcome: &str,
        detail: Option<String>,
    ) {
        self.finalize_steps.insert(
            step.to_string(),
            FinalizeStep {
                outcome: outcome.to_string(),
                detail,
                at: Utc::now(),
            },
        );
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub config: PlanConfig,
    pub status: PlanStatus,
}

impl Plan {
    pub fn id(&self) -> &str {
        &self.config.plan_id
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }
}

/// How to handle `create` when the plan already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    Resume,
    Replace,
    Rename(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateAction {
    Created,
    Resumed,
    Replaced,
    Renamed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub plan: Plan,
    pub action: CreateAction,
}

/// Partial update of plan settings. The phase is deliberately absent: it
/// only moves through the phase controller.
#[derive(Debug, Clone, Default)]
pub struct PlanUpdate {
    pub domains: Option<Vec<String>>,
    pub compatibility: Option<Compatibility>,
    pub commit_strategy: Option<String>,
    pub commit_prefix: Option<String>,
    pub branch_create: Option<bool>,
    pub branch_base: Option<String>,
    pub pr_create: Option<bool>,
    pub pr_draft: Option<bool>,
}

impl PlanUpdate {
    fn apply(self, cfg: &mut PlanConfig) {
        if let Some(v) = self.domains {
            cfg.domains = v;
        }
        if let Some(v) = self.compatibility {
            cfg.compatibility = v;
        }
        if let Some(v) = self.commit_strategy {
            cfg.commit.strategy = v;
        }
        if let Some(v) = self.commit_prefix {
            cfg.commit.message_prefix = Some(v);
        }
        if let Some(v) = self.branch_create {
            cfg.branch.create = v;
        }
        if let Some(v) = self.branch_base {
            cfg.branch.base = v;
        }
        if let Some(v) = self.pr_create {
            cfg.pull_request.create = v;
        }
        if let Some(v) = self.pr_draft {
            cfg.pull_request.draft = v;
        }
    }
}

// ---------------------------------------------------------------------------
// PlanStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlanStore {
    root: PathBuf,
    lock: LockSettings,
}

impl PlanStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: LockSettings::default(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock.timeout = timeout;
        self
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock = settings;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock(&self, plan_id: &str) -> Result<PlanLock> {
        PlanLock::acquire_with(&self.root, plan_id, self.lock)
    }

    /// Held across a phase handler so two handlers of one plan never run
    /// at the same time.
    pub fn phase_guard(&self, plan_id: &str) -> Result<PlanLock> {
        paths::validate_plan_id(plan_id)?;
        PlanLock::acquire_phase(&self.root, plan_id)
    }

    pub fn exists(&self, plan_id: &str) -> bool {
        paths::validate_plan_id(plan_id).is_ok() && paths::plan_dir(&self.root, plan_id).is_dir()
    }

    pub fn create(&self, config: PlanConfig, mut request: Request) -> Result<Plan> {
        config.validate()?;
        let id = config.plan_id.clone();
        let dir = paths::plan_dir(&self.root, &id);
        if dir.exists() {
            return Err(PmwError::PlanExists(id));
        }
        io::ensure_dir(&dir)?;

        request.plan_id = id.clone();
        let status = PlanStatus::new(&id);
        io::write_yaml(&paths::plan_config_path(&self.root, &id), &config)?;
        io::write_yaml(&paths::status_path(&self.root, &id), &status)?;
        request.save(&self.root)?;
        let mut refs = References::new(&id);
        refs.base_branch = Some(config.branch.base.clone());
        if let crate::request::RequestSource::Issue { url } = &request.source {
            refs.issue_url = Some(url.clone());
        }
        refs.save(&self.root)?;

        tracing::info!(plan = %id, "plan created");
        Ok(Plan { config, status })
    }

    /// Create a plan, or apply `resolution` when it already exists. Without a
    /// resolution an existing plan is a conflict.
    pub fn create_or_reference(
        &self,
        config: PlanConfig,
        request: Request,
        resolution: Option<ConflictResolution>,
    ) -> Result<CreateOutcome> {
        let id = config.plan_id.clone();
        paths::validate_plan_id(&id)?;
        if !self.exists(&id) {
            let plan = self.create(config, request)?;
            return Ok(CreateOutcome {
                plan,
                action: CreateAction::Created,
            });
        }

        match resolution {
            None => Err(PmwError::PlanExists(id)),
            Some(ConflictResolution::Resume) => Ok(CreateOutcome {
                plan: self.read(&id)?,
                action: CreateAction::Resumed,
            }),
            Some(ConflictResolution::Replace) => {
                self.delete(&id)?;
                Ok(CreateOutcome {
                    plan: self.create(config, request)?,
                    action: CreateAction::Replaced,
                })
            }
            Some(ConflictResolution::Rename(new_id)) => {
                let mut config = config;
                config.plan_id = new_id;
                Ok(CreateOutcome {
                    plan: self.create(config, request)?,
                    action: CreateAction::Renamed,
                })
            }
        }
    }

    pub fn read(&self, plan_id: &str) -> Result<Plan> {
        paths::validate_plan_id(plan_id)?;
        if !paths::plan_dir(&self.root, plan_id).is_dir() {
            return Err(PmwError::PlanNotFound(plan_id.to_string()));
        }
        Ok(Plan {
            config: self.read_config(plan_id)?,
            status: self.read_status(plan_id)?,
        })
    }

    pub fn read_config(&self, plan_id: &str) -> Result<PlanConfig> {
        let path = paths::plan_config_path(&self.root, plan_id);
        if !path.exists() {
            return Err(PmwError::MissingArtifact {
                artifact: "config".to_string(),
                plan: plan_id.to_string(),
                producer: "init".to_string(),
            });
        }
        io::read_yaml(&path, "config")
    }

    pub fn read_status(&self, plan_id: &str) -> Result<PlanStatus> {
        let path = paths::status_path(&self.root, plan_id);
        if !path.exists() {
            return Err(PmwError::MissingArtifact {
                artifact: "status".to_string(),
                plan: plan_id.to_string(),
                producer: "init".to_string(),
            });
        }
        io::read_yaml(&path, "status")
    }

    pub(crate) fn save_status(&self, status: &PlanStatus) -> Result<()> {
        io::write_yaml(&paths::status_path(&self.root, &status.plan_id), status)
    }

    pub fn update(&self, plan_id: &str, update: PlanUpdate) -> Result<Plan> {
        let mut plan = self.read(plan_id)?;
        let _lock = self.lock(plan_id)?;
        update.apply(&mut plan.config);
        plan.config.validate()?;
        io::write_yaml(&paths::plan_config_path(&self.root, plan_id), &plan.config)?;
        Ok(plan)
    }

    /// Append a clarification to the request. Only allowed during refine.
    pub fn clarify(&self, plan_id: &str, text: &str) -> Result<Request> {
        let status = self.read_status(plan_id)?;
        if status.phase != Phase::Refine {
            return Err(PmwError::InvalidTransition {
                from: status.phase.to_string(),
                to: "clarify".to_string(),
                reason: "clarifications may only be added during refine".to_string(),
            });
        }
        let _lock = self.lock(plan_id)?;
        let mut request = Request::load(&self.root, plan_id)?;
        request.clarify(text);
        request.save(&self.root)?;
        Ok(request)
    }

    pub fn delete(&self, plan_id: &str) -> Result<()> {
        paths::validate_plan_id(plan_id)?;
        let dir = paths::plan_dir(&self.root, plan_id);
        if !dir.is_dir() {
            return Err(PmwError::PlanNotFound(plan_id.to_string()));
        }
        let plans = paths::plans_dir(&self.root).canonicalize()?;
        let target = dir.canonicalize()?;
        if target.parent() != Some(plans.as_path()) {
            return Err(PmwError::InvalidPlanId(plan_id.to_string()));
        }
        std::fs::remove_dir_all(&target)?;
        tracing::info!(plan = plan_id, "plan deleted");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Plan>> {
        let dir = paths::plans_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut plans = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.read(&id) {
                Ok(p) => plans.push(p),
                Err(PmwError::InvalidPlanId(_)) | Err(PmwError::MissingArtifact { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        plans.sort_by(|a, b| a.config.created_at.cmp(&b.config.created_at));
        Ok(plans)
    }

    /// Move the plan to `archived-plans/{date}-{id}` and return its new path.
    pub fn archive(&self, plan_id: &str) -> Result<PathBuf> {
        self.read(plan_id)?;
        let archive = paths::archive_dir(&self.root);
        io::ensure_dir(&archive)?;
        let stem = format!("{}-{plan_id}", Utc::now().format("%Y-%m-%d"));
        let mut target = archive.join(&stem);
        let mut n = 2;
        while target.exists() {
            target = archive.join(format!("{stem}-{n}"));
            n += 1;
        }
        {
            // The lock file travels with the directory; it is dropped from
            // the archived copy once no writer can be inside.
            let _lock = self.lock(plan_id)?;
            std::fs::rename(paths::plan_dir(&self.root, plan_id), &target)?;
        }
        for leftover in [paths::LOCK_FILE, paths::PHASE_LOCK_FILE] {
            let _ = std::fs::remove_file(target.join(leftover));
        }
        tracing::info!(plan = plan_id, path = %target.display(), "plan archived");
        Ok(target)
    }

    pub fn list_archived(&self) -> Result<Vec<String>> {
        let dir = paths::archive_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
