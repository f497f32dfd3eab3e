use crate::error::{PmwError, Result};
use crate::io;
use crate::lock::{LockSettings, PlanLock};
use crate::paths;
use crate::types::{FindingType, Phase, Resolution, RuleCategory, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Finding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub hash_id: String,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<RuleCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_task: Option<String>,
    #[serde(default)]
    pub promoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_to: Option<PromotionTarget>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Finding {
    pub fn new(finding_type: FindingType, title: impl Into<String>, severity: Severity) -> Self {
        Self {
            hash_id: String::new(),
            finding_type,
            title: title.into(),
            detail: None,
            file_path: None,
            line: None,
            severity,
            category: None,
            rule: None,
            resolution: Resolution::Pending,
            resolution_detail: None,
            phase: None,
            source_task: None,
            fix_task: None,
            promoted: false,
            promoted_to: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_location(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file_path = Some(file.into());
        self.line = line;
        self
    }

    /// Explicit category, else the one implied by the finding type.
    pub fn rule_category(&self) -> RuleCategory {
        self.category
            .unwrap_or_else(|| self.finding_type.default_category())
    }

    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }
}

fn new_hash_id(existing: &[Finding]) -> String {
    loop {
        let id: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        if !existing.iter().any(|f| f.hash_id == id) {
            return id;
        }
    }
}

// ---------------------------------------------------------------------------
// Scope / promotion target
// ---------------------------------------------------------------------------

/// Plan-level findings are long-lived; Q-Gate findings belong to one phase
/// and are deduplicated by title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingScope {
    Plan,
    QGate(Phase),
}

impl FindingScope {
    pub fn path(self, root: &Path, plan_id: &str) -> PathBuf {
        match self {
            FindingScope::Plan => paths::findings_path(root, plan_id),
            FindingScope::QGate(phase) => paths::qgate_path(root, plan_id, phase.as_str()),
        }
    }
}

impl fmt::Display for FindingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingScope::Plan => f.write_str("plan"),
            FindingScope::QGate(phase) => write!(f, "qgate-{phase}"),
        }
    }
}

impl FromStr for FindingScope {
    type Err = PmwError;

    /// `plan`, or `qgate-{phase}` / `qgate:{phase}`.
    fn from_str(s: &str) -> Result<Self> {
        if s == "plan" {
            return Ok(FindingScope::Plan);
        }
        let phase = s
            .strip_prefix("qgate-")
            .or_else(|| s.strip_prefix("qgate:"))
            .ok_or_else(|| PmwError::InvalidValue {
                field: "finding scope".to_string(),
                value: s.to_string(),
            })?;
        Ok(FindingScope::QGate(phase.parse()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionTarget {
    Lesson,
    Architecture,
}

impl PromotionTarget {
    fn store_name(self) -> &'static str {
        match self {
            PromotionTarget::Lesson => "lessons",
            PromotionTarget::Architecture => "architecture",
        }
    }
}

impl FromStr for PromotionTarget {
    type Err = PmwError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lesson" | "lessons" => Ok(PromotionTarget::Lesson),
            "architecture" => Ok(PromotionTarget::Architecture),
            _ => Err(PmwError::InvalidValue {
                field: "promotion target".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub plan_id: String,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub promoted_at: DateTime<Utc>,
}

pub fn load_knowledge(root: &Path, target: PromotionTarget) -> Result<Vec<KnowledgeEntry>> {
    let path = paths::knowledge_path(root, target.store_name());
    Ok(io::read_yaml_optional(&path, target.store_name())?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// FindingLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddStatus {
    Added,
    Deduplicated,
    Reopened,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    pub status: AddStatus,
    pub hash_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct FindingFilter {
    pub finding_type: Option<FindingType>,
    pub severity: Option<Severity>,
    pub resolution: Option<Resolution>,
    pub file_contains: Option<String>,
    pub promoted: Option<bool>,
}

impl FindingFilter {
    pub fn pending() -> Self {
        Self {
            resolution: Some(Resolution::Pending),
            ..Self::default()
        }
    }

    pub fn matches(&self, f: &Finding) -> bool {
        self.finding_type.map_or(true, |t| f.finding_type == t)
            && self.severity.map_or(true, |s| f.severity == s)
            && self.resolution.map_or(true, |r| f.resolution == r)
            && self.promoted.map_or(true, |p| f.promoted == p)
            && self.file_contains.as_deref().map_or(true, |needle| {
                f.file_path.as_deref().is_some_and(|p| p.contains(needle))
            })
    }
}

/// Append-only finding records for one scope of one plan. Every mutation
/// takes the plan lock, so concurrent tasks never race on the file.
#[derive(Debug, Clone)]
pub struct FindingLog {
    root: PathBuf,
    plan_id: String,
    scope: FindingScope,
    lock: LockSettings,
}

impl FindingLog {
    pub fn new(root: &Path, plan_id: &str, scope: FindingScope) -> Self {
        Self {
            root: root.to_path_buf(),
            plan_id: plan_id.to_string(),
            scope,
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

    pub fn scope(&self) -> FindingScope {
        self.scope
    }

    fn path(&self) -> PathBuf {
        self.scope.path(&self.root, &self.plan_id)
    }

    fn lock(&self) -> Result<PlanLock> {
        PlanLock::acquire_with(&self.root, &self.plan_id, self.lock)
    }

    /// All findings in discovery order.
    pub fn load(&self) -> Result<Vec<Finding>> {
        if !paths::plan_dir(&self.root, &self.plan_id).is_dir() {
            return Err(PmwError::PlanNotFound(self.plan_id.clone()));
        }
        Ok(io::read_yaml_optional(&self.path(), &self.scope.to_string())?.unwrap_or_default())
    }

    fn save(&self, findings: &[Finding]) -> Result<()> {
        io::write_yaml(&self.path(), &findings)
    }

    fn update<T>(&self, f: impl FnOnce(&mut Vec<Finding>) -> Result<(T, bool)>) -> Result<T> {
        let _lock = self.lock()?;
        let mut findings = self.load()?;
        let (out, dirty) = f(&mut findings)?;
        if dirty {
            self.save(&findings)?;
        }
        Ok(out)
    }

    pub fn add(&self, mut finding: Finding) -> Result<AddOutcome> {
        let scope = self.scope;
        self.update(|findings| {
            if let FindingScope::QGate(phase) = scope {
                finding.phase.get_or_insert(phase);
                if let Some(existing) = findings.iter_mut().find(|f| f.title == finding.title) {
                    if existing.is_pending() {
                        return Ok((
                            AddOutcome {
                                status: AddStatus::Deduplicated,
                                hash_id: existing.hash_id.clone(),
                            },
                            false,
                        ));
                    }
                    existing.resolution = Resolution::Pending;
                    existing.resolution_detail = None;
                    existing.resolved_at = None;
                    existing.fix_task = None;
                    existing.detail = finding.detail.or(existing.detail.take());
                    tracing::info!(finding = %existing.hash_id, title = %existing.title, "finding reopened");
                    return Ok((
                        AddOutcome {
                            status: AddStatus::Reopened,
                            hash_id: existing.hash_id.clone(),
                        },
                        true,
                    ));
                }
            }
            finding.hash_id = new_hash_id(findings);
            finding.resolution = Resolution::Pending;
            let hash_id = finding.hash_id.clone();
            tracing::info!(finding = %hash_id, title = %finding.title, scope = %scope, "finding added");
            findings.push(finding);
            Ok((
                AddOutcome {
                    status: AddStatus::Added,
                    hash_id,
                },
                true,
            ))
        })
    }

    pub fn get(&self, hash_id: &str) -> Result<Finding> {
        self.load()?
            .into_iter()
            .find(|f| f.hash_id == hash_id)
            .ok_or_else(|| PmwError::FindingNotFound(hash_id.to_string()))
    }

    pub fn query(&self, filter: &FindingFilter) -> Result<Vec<Finding>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|f| filter.matches(f))
            .collect())
    }

    pub fn resolve(&self, hash_id: &str, resolution: Resolution, detail: Option<String>) -> Result<Finding> {
        if !resolution.is_resolved() {
            return Err(PmwError::InvalidValue {
                field: "resolution".to_string(),
                value: "pending (use a resolved value)".to_string(),
            });
        }
        self.update(|findings| {
            let f = find_mut(findings, hash_id)?;
            f.resolution = resolution;
            f.resolution_detail = detail;
            f.resolved_at = Some(Utc::now());
            Ok((f.clone(), true))
        })
    }

    pub fn set_fix_task(&self, hash_id: &str, task_id: &str) -> Result<()> {
        self.update(|findings| {
            find_mut(findings, hash_id)?.fix_task = Some(task_id.to_string());
            Ok(((), true))
        })
    }

    /// Copy the finding into the project knowledge store and flag it.
    pub fn promote(&self, hash_id: &str, target: PromotionTarget) -> Result<Finding> {
        self.update(|findings| {
            let f = find_mut(findings, hash_id)?;
            if f.promoted {
                return Err(PmwError::InvalidTransition {
                    from: "promoted".to_string(),
                    to: "promoted".to_string(),
                    reason: format!("finding {hash_id} was already promoted"),
                });
            }
            let mut entries = load_knowledge(&self.root, target)?;
            entries.push(KnowledgeEntry {
                id: f.hash_id.clone(),
                plan_id: self.plan_id.clone(),
                finding_type: f.finding_type,
                title: f.title.clone(),
                detail: f.detail.clone(),
                file_path: f.file_path.clone(),
                promoted_at: Utc::now(),
            });
            io::write_yaml(&paths::knowledge_path(&self.root, target.store_name()), &entries)?;
            f.promoted = true;
            f.promoted_to = Some(target);
            Ok((f.clone(), true))
        })
    }
}

/// Every scope a plan may hold findings in: the plan log first, then each
/// phase's Q-Gate log.
pub fn all_scopes() -> Vec<FindingScope> {
    let mut scopes = vec![FindingScope::Plan];
    scopes.extend(
        Phase::lifecycle()
            .iter()
            .filter(|p| !p.is_terminal())
            .map(|p| FindingScope::QGate(*p)),
    );
    scopes
}

/// Find which log holds `hash_id`.
pub fn locate(root: &Path, plan_id: &str, hash_id: &str) -> Result<(FindingLog, Finding)> {
    for scope in all_scopes() {
        let log = FindingLog::new(root, plan_id, scope);
        if let Some(f) = log.load()?.into_iter().find(|f| f.hash_id == hash_id) {
            return Ok((log, f));
        }
    }
    Err(PmwError::FindingNotFound(hash_id.to_string()))
}

fn find_mut<'a>(findings: &'a mut [Finding], hash_id: &str) -> Result<&'a mut Finding> {
    findings
        .iter_mut()
        .find(|f| f.hash_id == hash_id)
        .ok_or_else(|| PmwError::FindingNotFound(hash_id.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
