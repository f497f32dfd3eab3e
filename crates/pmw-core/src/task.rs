use crate::error::{PmwError, Result};
use crate::graph::DependencyGraph;
use crate::outline::SolutionOutline;
use crate::paths;
use crate::skills::SYSTEM_DOMAIN;
use crate::types::{Priority, Profile, StepStatus, TaskOrigin, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub path: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn pending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: StepStatus::Pending,
            reason: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskVerification {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub domain: String,
    pub module: String,
    pub profile: Profile,
    pub origin: TaskOrigin,
    pub priority: Priority,
    #[serde(default)]
    pub deliverables: Vec<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub verification: TaskVerification,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub verification_attempts: u32,
    /// Finding hash ids this fix task addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes_findings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        domain: impl Into<String>,
        module: impl Into<String>,
        profile: Profile,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            domain: domain.into(),
            module: module.into(),
            profile,
            origin: TaskOrigin::Plan,
            priority: Priority::Medium,
            deliverables: Vec::new(),
            depends_on: Vec::new(),
            skills: Vec::new(),
            steps: Vec::new(),
            verification: TaskVerification::default(),
            status: TaskStatus::Pending,
            blocker: None,
            modified_files: Vec::new(),
            verification_attempts: 0,
            fixes_findings: Vec::new(),
            source_task: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_steps<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = paths.into_iter().map(Step::pending).collect();
        self
    }

    pub fn seq(&self) -> u32 {
        paths::parse_task_id(&self.id).map(|(n, _)| n).unwrap_or(0)
    }

    pub fn is_started(&self) -> bool {
        self.status != TaskStatus::Pending
            || self.started_at.is_some()
            || self.steps.iter().any(|s| s.status != StepStatus::Pending)
    }

    pub fn pending_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.status == StepStatus::Pending)
    }

    pub fn track_modified<S: AsRef<str>>(&mut self, files: &[S]) {
        for f in files {
            let f = f.as_ref();
            if !self.modified_files.iter().any(|m| m == f) {
                self.modified_files.push(f.to_string());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    pub fn start(&mut self) {
        if self.status != TaskStatus::InProgress {
            self.status = TaskStatus::InProgress;
            self.started_at.get_or_insert_with(Utc::now);
        }
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Done;
        self.blocker = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Blocked;
        self.blocker = Some(reason.into());
    }

    /// Back to pending so the executor picks it up again; completed steps stay done.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.blocker = None;
        self.verification_attempts = 0;
        self.completed_at = None;
    }

    pub fn set_status(&mut self, status: TaskStatus, reason: Option<String>) -> Result<()> {
        match status {
            TaskStatus::Pending => self.reset(),
            TaskStatus::InProgress => self.start(),
            TaskStatus::Done => self.complete(),
            TaskStatus::Blocked => {
                let reason = reason.ok_or_else(|| PmwError::InvalidValue {
                    field: "blocker".to_string(),
                    value: "a reason is required to block a task".to_string(),
                })?;
                self.block(reason);
            }
        }
        Ok(())
    }

    /// Mark a step `done` or `skipped`. Skipping requires a reason.
    pub fn mark_step(&mut self, path: &str, status: StepStatus, reason: Option<String>) -> Result<()> {
        let task_id = self.id.clone();
        let invalid = |reason: &str| PmwError::InvalidStep {
            task: task_id.clone(),
            step: path.to_string(),
            reason: reason.to_string(),
        };
        if status == StepStatus::Pending {
            return Err(invalid("a step can only be marked done or skipped"));
        }
        if status == StepStatus::Skipped && reason.as_deref().map_or(true, str::is_empty) {
            return Err(invalid("skipping a step requires a reason"));
        }
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.path == path)
            .ok_or_else(|| invalid("no such step in task"))?;
        step.status = status;
        step.reason = reason;
        step.completed_at = Some(Utc::now());
        if status == StepStatus::Done {
            self.track_modified(&[path]);
        }
        if self.status == TaskStatus::Pending {
            self.start();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Field-level checks. Plan-origin steps are also checked against the
    /// referenced deliverables' affected files when an outline is supplied.
    pub fn validate(&self, outline: Option<&SolutionOutline>) -> Result<()> {
        if paths::parse_task_id(&self.id).is_none() {
            return Err(PmwError::InvalidValue {
                field: "task id".to_string(),
                value: self.id.clone(),
            });
        }
        if self.domain == SYSTEM_DOMAIN {
            return Err(PmwError::UnknownDomain(format!(
                "{SYSTEM_DOMAIN} (task {})",
                self.id
            )));
        }
        if self.origin == TaskOrigin::Plan && self.deliverables.is_empty() {
            return Err(PmwError::CountMismatch {
                what: format!("deliverables of {}", self.id),
                expected: 1,
                actual: 0,
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            paths::check_file_path(&step.path).map_err(|reason| PmwError::InvalidStep {
                task: self.id.clone(),
                step: step.path.clone(),
                reason: reason.to_string(),
            })?;
            if !seen.insert(step.path.as_str()) {
                return Err(PmwError::InvalidStep {
                    task: self.id.clone(),
                    step: step.path.clone(),
                    reason: "duplicate step".to_string(),
                });
            }
        }

        if let (TaskOrigin::Plan, Some(outline)) = (self.origin, outline) {
            let mut allowed: Vec<&str> = Vec::new();
            for n in &self.deliverables {
                let d = outline.deliverable(*n).ok_or_else(|| PmwError::SchemaViolation {
                    artifact: self.id.clone(),
                    reason: format!("references unknown deliverable {n}"),
                })?;
                allowed.extend(d.affected_files.iter().map(String::as_str));
            }
            for step in &self.steps {
                if !allowed.contains(&step.path.as_str()) {
                    return Err(PmwError::InvalidStep {
                        task: self.id.clone(),
                        step: step.path.clone(),
                        reason: "not among the deliverable's affected files".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn load(root: &Path, plan_id: &str, task_id: &str) -> Result<Self> {
        if paths::parse_task_id(task_id).is_none() {
            return Err(PmwError::TaskNotFound(task_id.to_string()));
        }
        let path = paths::task_path(root, plan_id, task_id);
        if !path.exists() {
            return Err(PmwError::TaskNotFound(task_id.to_string()));
        }
        crate::io::read_yaml(&path, task_id)
    }

    pub fn save(&self, root: &Path, plan_id: &str) -> Result<()> {
        crate::io::write_yaml(&paths::task_path(root, plan_id, &self.id), self)
    }

    /// All tasks of a plan, ordered by sequence number.
    pub fn list(root: &Path, plan_id: &str) -> Result<Vec<Self>> {
        let dir = paths::plan_dir(root, plan_id);
        if !dir.is_dir() {
            return Err(PmwError::PlanNotFound(plan_id.to_string()));
        }
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !paths::is_task_file(&name) {
                continue;
            }
            let id = name.trim_end_matches(".yaml");
            if paths::parse_task_id(id).is_some() {
                tasks.push(crate::io::read_yaml::<Task>(&entry.path(), id)?);
            }
        }
        tasks.sort_by(|a, b| a.seq().cmp(&b.seq()).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub fn remove(root: &Path, plan_id: &str, task_id: &str) -> Result<()> {
        let path = paths::task_path(root, plan_id, task_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task list operations
// ---------------------------------------------------------------------------

pub fn next_seq(tasks: &[Task]) -> u32 {
    tasks.iter().map(Task::seq).max().unwrap_or(0) + 1
}

pub fn task_id(seq: u32, suffix: &str) -> String {
    format!("{}{seq:03}-{suffix}", paths::TASK_PREFIX)
}

pub fn find<'a>(tasks: &'a [Task], id: &str) -> Result<&'a Task> {
    tasks
        .iter()
        .find(|t| t.id == id)
        .ok_or_else(|| PmwError::TaskNotFound(id.to_string()))
}

pub fn task_graph(tasks: &[Task]) -> DependencyGraph {
    let mut g = DependencyGraph::new();
    for t in tasks {
        g.add_node(&t.id);
    }
    for t in tasks {
        for dep in &t.depends_on {
            g.add_edge(&t.id, dep);
        }
    }
    g
}

/// Checks the whole task set: unique ids, known dependencies, acyclic graph.
pub fn validate_set(tasks: &[Task]) -> Result<()> {
    let mut ids = HashSet::new();
    for t in tasks {
        if !ids.insert(t.id.as_str()) {
            return Err(PmwError::TaskExists(t.id.clone()));
        }
    }
    for t in tasks {
        for dep in &t.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(PmwError::TaskNotFound(format!("{dep} (dependency of {})", t.id)));
            }
        }
    }
    task_graph(tasks).ensure_acyclic("tasks")
}

/// Validate and persist a manually added task against the existing set.
pub fn add(root: &Path, plan_id: &str, task: Task, outline: Option<&SolutionOutline>) -> Result<Task> {
    let mut tasks = Task::list(root, plan_id)?;
    if tasks.iter().any(|t| t.id == task.id) {
        return Err(PmwError::TaskExists(task.id));
    }
    task.validate(outline)?;
    tasks.push(task.clone());
    validate_set(&tasks)?;
    task.save(root, plan_id)?;
    Ok(task)
}

/// Tasks that can run now: pending or in progress with every dependency done.
pub fn next_ready(tasks: &[Task]) -> Vec<&Task> {
    let done: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id.as_str())
        .collect();
    tasks
        .iter()
        .filter(|t| {
            matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                && t.depends_on.iter().all(|d| done.contains(d.as_str()))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionGroup {
    pub layer: usize,
    pub tasks: Vec<String>,
}

pub fn execution_groups(tasks: &[Task]) -> Result<Vec<ExecutionGroup>> {
    Ok(task_graph(tasks)
        .layers("tasks")?
        .into_iter()
        .enumerate()
        .map(|(layer, tasks)| ExecutionGroup { layer, tasks })
        .collect())
}

/// Human-readable summary: "3/5 tasks done, 1 in progress, 1 blocked"
pub fn summarize(tasks: &[Task]) -> String {
    let total = tasks.len();
    let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
    let done = count(TaskStatus::Done);
    let in_progress = count(TaskStatus::InProgress);
    let blocked = count(TaskStatus::Blocked);

    let mut parts = vec![format!("{done}/{total} tasks done")];
    if in_progress > 0 {
        parts.push(format!("{in_progress} in progress"));
    }
    if blocked > 0 {
        parts.push(format!("{blocked} blocked"));
    }
    parts.join(", ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::HEALTH_OUTLINE;
    use tempfile::TempDir;

    fn impl_task(seq: u32) -> Task {
        let mut t = Task::new(
            task_id(seq, "IMPL"),
            "Add health endpoint",
            "java",
            "api-service",
            Profile::Implementation,
        )
        .with_steps(["src/main/java/Health.java"]);
        t.deliverables = vec![1];
        t
    }

    fn plan_dir(dir: &TempDir) -> &Path {
        std::fs::create_dir_all(paths::plan_dir(dir.path(), "p")).unwrap();
        dir.path()
    }

    #[test]
    fn free_text_step_is_rejected() {
        let t = impl_task(1).with_steps(["Update the controller"]);
        let err = t.validate(None).unwrap_err();
        assert!(matches!(err, PmwError::InvalidStep { .. }));
    }

    #[test]
    fn step_outside_deliverable_is_rejected() {
        let outline = SolutionOutline::parse(HEALTH_OUTLINE).unwrap();
        impl_task(1).validate(Some(&outline)).unwrap();
        let t = impl_task(1).with_steps(["src/main/java/Other.java"]);
        assert!(matches!(
            t.validate(Some(&outline)),
            Err(PmwError::InvalidStep { .. })
        ));
    }

    #[test]
    fn system_domain_task_is_rejected() {
        let mut t = impl_task(1);
        t.domain = "system".to_string();
        assert!(t.validate(None).is_err());
    }

    #[test]
    fn mark_step_records_modified_file() {
        let mut t = impl_task(1);
        t.mark_step("src/main/java/Health.java", StepStatus::Done, None)
            .unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.modified_files, vec!["src/main/java/Health.java"]);
        assert!(t
            .mark_step("src/main/java/Nope.java", StepStatus::Done, None)
            .is_err());
    }

    #[test]
    fn skip_requires_reason() {
        let mut t = impl_task(1);
        assert!(t
            .mark_step("src/main/java/Health.java", StepStatus::Skipped, None)
            .is_err());
        t.mark_step(
            "src/main/java/Health.java",
            StepStatus::Skipped,
            Some("already present".to_string()),
        )
        .unwrap();
        assert!(t.modified_files.is_empty());
    }

    #[test]
    fn add_rejects_duplicates_unknown_deps_and_cycles() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        add(root, "p", impl_task(1), None).unwrap();
        assert!(matches!(
            add(root, "p", impl_task(1), None),
            Err(PmwError::TaskExists(_))
        ));

        let mut t2 = impl_task(2);
        t2.depends_on = vec!["TASK-009-IMPL".to_string()];
        assert!(add(root, "p", t2, None).is_err());

        let mut t2 = impl_task(2);
        t2.depends_on = vec!["TASK-002-IMPL".to_string()];
        assert!(matches!(
            add(root, "p", t2, None),
            Err(PmwError::Cycle { .. })
        ));
    }

    #[test]
    fn list_orders_by_sequence() {
        let dir = TempDir::new().unwrap();
        let root = plan_dir(&dir);
        impl_task(10).save(root, "p").unwrap();
        impl_task(2).save(root, "p").unwrap();
        let ids: Vec<_> = Task::list(root, "p").unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["TASK-002-IMPL", "TASK-010-IMPL"]);
        assert_eq!(next_seq(&Task::list(root, "p").unwrap()), 11);
    }

    #[test]
    fn next_ready_respects_dependencies() {
        let t1 = impl_task(1);
        let mut t2 = impl_task(2);
        t2.depends_on = vec![t1.id.clone()];
        let mut tasks = vec![t1, t2];
        let ready: Vec<_> = next_ready(&tasks).iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["TASK-001-IMPL"]);

        tasks[0].complete();
        let ready: Vec<_> = next_ready(&tasks).iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["TASK-002-IMPL"]);
        assert_eq!(summarize(&tasks), "1/2 tasks done");
    }

    #[test]
    fn blocking_requires_reason() {
        let mut t = impl_task(1);
        assert!(t.set_status(TaskStatus::Blocked, None).is_err());
        t.set_status(TaskStatus::Blocked, Some("build broken".to_string()))
            .unwrap();
        assert_eq!(summarize(std::slice::from_ref(&t)), "0/1 tasks done, 1 blocked");
    }
}
