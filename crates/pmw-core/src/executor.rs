use crate::config::WorkflowConfig;
use crate::error::{PmwError, Result};
use crate::finding::{self, Finding, FindingLog, FindingScope};
use crate::plan::PlanStore;
use crate::references::References;
use crate::task::{self, Step, Task};
use crate::types::{FindingType, Resolution, Severity, StepStatus, TaskStatus};
use crate::verify::{self, CommandResult, CommandRunner, VerificationReport, VerificationScope};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

/// Failure output kept in the finding raised for a blocked task.
const FINDING_DETAIL_LIMIT: usize = 2000;

// ---------------------------------------------------------------------------
// StepWorker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's file was written; `modified` lists any other files touched.
    Done { modified: Vec<String> },
    Skipped { reason: String },
    /// Not performed yet; the task stays in progress.
    Deferred,
}

/// The agent doing the actual edits.
pub trait StepWorker: Send + Sync {
    fn perform(&self, task: &Task, step: &Step) -> StepOutcome;

    /// Try to repair a failed verification. Returns the files it modified.
    fn attempt_fix(&self, task: &Task, failure: &CommandResult) -> Vec<String>;
}

/// Steps are recorded out of band (`pmw task step`); anything still pending
/// is deferred until the agent records it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordedWorker;

impl StepWorker for RecordedWorker {
    fn perform(&self, _task: &Task, _step: &Step) -> StepOutcome {
        StepOutcome::Deferred
    }

    fn attempt_fix(&self, _task: &Task, _failure: &CommandResult) -> Vec<String> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Done,
    Blocked,
    /// Steps remain pending; run again once they are recorded.
    Incomplete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_steps: Vec<String>,
    pub modified_files: Vec<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocker: Option<String>,
    /// Finding raised when the task was blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding: Option<String>,
    /// Findings resolved because this fix task succeeded.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolved_findings: Vec<String>,
}

impl ExecutionResult {
    fn of(task: &Task, status: ExecutionStatus) -> Self {
        Self {
            task_id: task.id.clone(),
            status,
            pending_steps: task.pending_steps().map(|s| s.path.clone()).collect(),
            modified_files: task.modified_files.clone(),
            attempts: task.verification_attempts,
            verification: None,
            blocker: task.blocker.clone(),
            finding: None,
            resolved_findings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor<'a> {
    store: &'a PlanStore,
    worker: &'a dyn StepWorker,
    runner: &'a dyn CommandRunner,
    max_attempts: u32,
    max_parallel: usize,
    timeout: Option<Duration>,
}

impl<'a> Executor<'a> {
    pub fn new(
        store: &'a PlanStore,
        worker: &'a dyn StepWorker,
        runner: &'a dyn CommandRunner,
        config: &WorkflowConfig,
    ) -> Self {
        let secs = config.execution.verification_timeout_seconds;
        Self {
            store,
            worker,
            runner,
            max_attempts: config.iterations.task_verification.max(1),
            max_parallel: config.execution.max_parallel.max(1),
            timeout: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }

    /// Run one task: perform its pending steps, then verify with bounded
    /// retries. A task that still fails is blocked and raises a finding.
    pub fn execute(&self, plan_id: &str, task_id: &str) -> Result<ExecutionResult> {
        let root = self.store.root();
        let tasks = Task::list(root, plan_id)?;
        let mut task = task::find(&tasks, task_id)?.clone();

        match task.status {
            TaskStatus::Done => return Ok(ExecutionResult::of(&task, ExecutionStatus::Done)),
            TaskStatus::Blocked => return Ok(ExecutionResult::of(&task, ExecutionStatus::Blocked)),
            TaskStatus::Pending | TaskStatus::InProgress => {}
        }
        let unmet: Vec<&str> = task
            .depends_on
            .iter()
            .filter(|d| !tasks.iter().any(|t| &t.id == *d && t.status == TaskStatus::Done))
            .map(String::as_str)
            .collect();
        if !unmet.is_empty() {
            return Err(PmwError::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
                reason: format!("dependencies not done: {}", unmet.join(", ")),
            });
        }

        task.start();
        let pending: Vec<Step> = task.pending_steps().cloned().collect();
        for step in &pending {
            match self.worker.perform(&task, step) {
                StepOutcome::Done { modified } => {
                    task.mark_step(&step.path, StepStatus::Done, None)?;
                    task.track_modified(&modified);
                }
                StepOutcome::Skipped { reason } => {
                    task.mark_step(&step.path, StepStatus::Skipped, Some(reason))?;
                }
                StepOutcome::Deferred => {}
            }
        }
        if task.pending_steps().next().is_some() {
            self.save(plan_id, &task)?;
            tracing::debug!(task = %task.id, "steps pending; task left in progress");
            return Ok(ExecutionResult::of(&task, ExecutionStatus::Incomplete));
        }

        let report = self.verify(&mut task);
        if report.as_ref().map_or(true, |r| r.passed) {
            task.complete();
            self.save(plan_id, &task)?;
            tracing::info!(task = %task.id, attempts = task.verification_attempts, "task done");
            let mut result = ExecutionResult::of(&task, ExecutionStatus::Done);
            result.verification = report;
            result.resolved_findings = self.close_findings(plan_id, &task)?;
            return Ok(result);
        }

        let report = report.unwrap_or_else(|| VerificationReport {
            scope: VerificationScope::FullProject,
            results: Vec::new(),
            passed: false,
        });
        let failure = report
            .first_failure()
            .cloned()
            .unwrap_or_else(|| CommandResult::failed("verification", "no output"));
        task.block(format!(
            "verification failed after {} attempts: {}",
            task.verification_attempts, failure.command
        ));
        self.save(plan_id, &task)?;
        tracing::warn!(task = %task.id, command = %failure.command, "task blocked");

        let hash = self.raise_finding(plan_id, &task, &failure)?;
        let mut result = ExecutionResult::of(&task, ExecutionStatus::Blocked);
        result.verification = Some(report);
        result.finding = Some(hash);
        Ok(result)
    }

    /// `None` when the task has no verification commands.
    fn verify(&self, task: &mut Task) -> Option<VerificationReport> {
        if task.verification.commands.is_empty() {
            tracing::debug!(task = %task.id, "no verification commands");
            return None;
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            task.verification_attempts = attempt;
            let scope = VerificationScope::from_modified(&task.modified_files);
            let report = verify::run_all(self.runner, &task.verification.commands, &scope, self.timeout);
            if report.passed || attempt >= self.max_attempts {
                return Some(report);
            }
            if let Some(failure) = report.first_failure() {
                tracing::info!(task = %task.id, attempt, command = %failure.command, "verification failed; attempting fix");
                let touched = self.worker.attempt_fix(task, failure);
                task.track_modified(&touched);
            }
        }
    }

    /// Task file and tracked references are written together under the lock.
    fn save(&self, plan_id: &str, task: &Task) -> Result<()> {
        let root = self.store.root();
        let _lock = self.store.lock(plan_id)?;
        task.save(root, plan_id)?;
        if !task.modified_files.is_empty() {
            let mut refs = References::load(root, plan_id)?;
            if refs.track_files(&task.modified_files) > 0 {
                refs.save(root)?;
            }
        }
        Ok(())
    }

    fn raise_finding(&self, plan_id: &str, task: &Task, failure: &CommandResult) -> Result<String> {
        let kind = if task.profile.is_testing() {
            FindingType::TestFailure
        } else {
            FindingType::BuildError
        };
        let mut detail = failure.output.clone();
        if detail.len() > FINDING_DETAIL_LIMIT {
            let mut start = detail.len() - FINDING_DETAIL_LIMIT;
            while !detail.is_char_boundary(start) {
                start += 1;
            }
            detail = detail[start..].to_string();
        }
        let mut f = Finding::new(
            kind,
            format!("Verification failed: {} ({})", task.id, failure.command),
            Severity::Error,
        )
        .with_detail(detail);
        if let [only] = task.modified_files.as_slice() {
            f.file_path = Some(only.clone());
        }
        f.source_task = Some(task.id.clone());
        let log = FindingLog::new(self.store.root(), plan_id, FindingScope::Plan);
        Ok(log.add(f)?.hash_id)
    }

    /// A finished fix task resolves its findings and releases blocked sources.
    fn close_findings(&self, plan_id: &str, task: &Task) -> Result<Vec<String>> {
        let root = self.store.root();
        let mut resolved = Vec::new();
        for hash in &task.fixes_findings {
            let (log, found) = match finding::locate(root, plan_id, hash) {
                Ok(hit) => hit,
                Err(PmwError::FindingNotFound(_)) => {
                    tracing::warn!(finding = %hash, task = %task.id, "fixed finding no longer exists");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if found.is_pending() {
                log.resolve(hash, Resolution::Fixed, Some(format!("fixed by {}", task.id)))?;
                resolved.push(hash.clone());
            }
            if let Some(src) = found.source_task.as_deref() {
                let _lock = self.store.lock(plan_id)?;
                let mut source = match Task::load(root, plan_id, src) {
                    Ok(t) => t,
                    Err(PmwError::TaskNotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if source.status == TaskStatus::Blocked {
                    source.reset();
                    source.save(root, plan_id)?;
                    tracing::info!(task = %src, fix = %task.id, "blocked task released");
                }
            }
        }
        Ok(resolved)
    }

    /// Run the given tasks concurrently, at most `max_parallel` at a time.
    /// Results keep the input order.
    pub fn execute_layer(&self, plan_id: &str, task_ids: &[String]) -> Vec<Result<ExecutionResult>> {
        let mut results = Vec::with_capacity(task_ids.len());
        for chunk in task_ids.chunks(self.max_parallel) {
            let chunk_results: Vec<Result<ExecutionResult>> = std::thread::scope(|s| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|id| s.spawn(move || self.execute(plan_id, id)))
                    .collect();
                handles
                    .into_iter()
                    .zip(chunk)
                    .map(|(h, id)| {
                        h.join().unwrap_or_else(|_| {
                            Err(PmwError::VerificationFailure {
                                target: id.clone(),
                                reason: "executor thread panicked".to_string(),
                            })
                        })
                    })
                    .collect()
            });
            results.extend(chunk_results);
        }
        results
    }

    /// Execute ready tasks layer after layer until nothing new becomes ready.
    /// Each task runs at most once per call.
    pub fn execute_ready(&self, plan_id: &str) -> Result<Vec<ExecutionResult>> {
        let mut attempted: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        loop {
            let tasks = Task::list(self.store.root(), plan_id)?;
            let ready: Vec<String> = task::next_ready(&tasks)
                .into_iter()
                .filter(|t| !attempted.contains(&t.id))
                .map(|t| t.id.clone())
                .collect();
            if ready.is_empty() {
                return Ok(out);
            }
            attempted.extend(ready.iter().cloned());
            for result in self.execute_layer(plan_id, &ready) {
                out.push(result?);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanConfig;
    use crate::request::Request;
    use crate::types::{Profile, TaskOrigin};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes every step; passes verification once `fix_after` fixes ran.
    struct ScriptedWorker {
        fixes: AtomicUsize,
        performed: Mutex<Vec<String>>,
    }

    impl ScriptedWorker {
        fn new() -> Self {
            Self {
                fixes: AtomicUsize::new(0),
                performed: Mutex::new(Vec::new()),
            }
        }
    }

    impl StepWorker for ScriptedWorker {
        fn perform(&self, _task: &Task, step: &Step) -> StepOutcome {
            self.performed.lock().unwrap().push(step.path.clone());
            StepOutcome::Done { modified: Vec::new() }
        }

        fn attempt_fix(&self, _task: &Task, _failure: &CommandResult) -> Vec<String> {
            self.fixes.fetch_add(1, Ordering::SeqCst);
            vec!["src/Fixed.java".to_string()]
        }
    }

    /// Fails until `pass_after` calls have been made.
    struct CountingRunner {
        calls: AtomicUsize,
        pass_after: usize,
    }

    impl CommandRunner for CountingRunner {
        fn run(&self, command: &str, _scope: &VerificationScope, _t: Option<Duration>) -> CommandResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            CommandResult {
                command: command.to_string(),
                passed: n > self.pass_after,
                output: format!("run {n}"),
                duration_ms: 1,
                timed_out: false,
            }
        }
    }

    fn setup() -> (TempDir, PlanStore) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path());
        store
            .create(
                PlanConfig::new("p", vec!["java".to_string()]),
                Request::description("p", "x"),
            )
            .unwrap();
        (dir, store)
    }

    fn task(seq: u32, file: &str) -> Task {
        let mut t = Task::new(
            task::task_id(seq, "IMPL"),
            "t",
            "java",
            "api-service",
            Profile::Implementation,
        )
        .with_steps([file]);
        t.deliverables = vec![1];
        t.verification.commands = vec!["mvn -q compile".to_string()];
        t
    }

    fn config() -> WorkflowConfig {
        WorkflowConfig::new("demo")
    }

    #[test]
    fn passing_task_is_done_and_tracks_references() {
        let (dir, store) = setup();
        task(1, "src/Health.java").save(dir.path(), "p").unwrap();
        let worker = ScriptedWorker::new();
        let runner = CountingRunner { calls: AtomicUsize::new(0), pass_after: 0 };
        let exec = Executor::new(&store, &worker, &runner, &config());

        let r = exec.execute("p", "TASK-001-IMPL").unwrap();
        assert_eq!(r.status, ExecutionStatus::Done);
        assert_eq!(r.attempts, 1);
        let refs = References::load(dir.path(), "p").unwrap();
        assert_eq!(refs.modified_files, vec!["src/Health.java"]);
    }

    #[test]
    fn retries_with_fix_then_passes() {
        let (dir, store) = setup();
        task(1, "src/Health.java").save(dir.path(), "p").unwrap();
        let worker = ScriptedWorker::new();
        let runner = CountingRunner { calls: AtomicUsize::new(0), pass_after: 2 };
        let exec = Executor::new(&store, &worker, &runner, &config());

        let r = exec.execute("p", "TASK-001-IMPL").unwrap();
        assert_eq!(r.status, ExecutionStatus::Done);
        assert_eq!(r.attempts, 3);
        assert_eq!(worker.fixes.load(Ordering::SeqCst), 2);
        assert!(r.modified_files.contains(&"src/Fixed.java".to_string()));
    }

    #[test]
    fn persistent_failure_blocks_and_raises_finding() {
        let (dir, store) = setup();
        task(1, "src/Health.java").save(dir.path(), "p").unwrap();
        let worker = ScriptedWorker::new();
        let runner = CountingRunner { calls: AtomicUsize::new(0), pass_after: usize::MAX };
        let exec = Executor::new(&store, &worker, &runner, &config());

        let r = exec.execute("p", "TASK-001-IMPL").unwrap();
        assert_eq!(r.status, ExecutionStatus::Blocked);
        assert_eq!(r.attempts, 3);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);

        let findings = FindingLog::new(dir.path(), "p", FindingScope::Plan).load().unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].finding_type, FindingType::BuildError);
        assert_eq!(findings[0].source_task.as_deref(), Some("TASK-001-IMPL"));
        assert_eq!(Some(findings[0].hash_id.clone()), r.finding);
    }

    #[test]
    fn deferred_steps_leave_task_incomplete() {
        let (dir, store) = setup();
        task(1, "src/Health.java").save(dir.path(), "p").unwrap();
        let runner = CountingRunner { calls: AtomicUsize::new(0), pass_after: 0 };
        let exec = Executor::new(&store, &RecordedWorker, &runner, &config());

        let r = exec.execute("p", "TASK-001-IMPL").unwrap();
        assert_eq!(r.status, ExecutionStatus::Incomplete);
        assert_eq!(r.pending_steps, vec!["src/Health.java"]);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        let mut t = Task::load(dir.path(), "p", "TASK-001-IMPL").unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        t.mark_step("src/Health.java", StepStatus::Done, None).unwrap();
        t.save(dir.path(), "p").unwrap();
        assert_eq!(exec.execute("p", "TASK-001-IMPL").unwrap().status, ExecutionStatus::Done);
    }

    #[test]
    fn unmet_dependency_is_rejected() {
        let (dir, store) = setup();
        task(1, "src/A.java").save(dir.path(), "p").unwrap();
        let mut t2 = task(2, "src/B.java");
        t2.depends_on = vec!["TASK-001-IMPL".to_string()];
        t2.save(dir.path(), "p").unwrap();
        let runner = CountingRunner { calls: AtomicUsize::new(0), pass_after: 0 };
        let exec = Executor::new(&store, &RecordedWorker, &runner, &config());
        assert!(matches!(
            exec.execute("p", "TASK-002-IMPL"),
            Err(PmwError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn execute_ready_walks_layers_in_order() {
        let (dir, store) = setup();
        task(1, "src/A.java").save(dir.path(), "p").unwrap();
        task(2, "src/B.java").save(dir.path(), "p").unwrap();
        let mut t3 = task(3, "src/C.java");
        t3.depends_on = vec!["TASK-001-IMPL".to_string(), "TASK-002-IMPL".to_string()];
        t3.save(dir.path(), "p").unwrap();

        let worker = ScriptedWorker::new();
        let runner = CountingRunner { calls: AtomicUsize::new(0), pass_after: 0 };
        let exec = Executor::new(&store, &worker, &runner, &config());
        let results = exec.execute_ready("p").unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == ExecutionStatus::Done));
        assert_eq!(results[2].task_id, "TASK-003-IMPL");
        let performed = worker.performed.lock().unwrap();
        assert_eq!(performed.last().map(String::as_str), Some("src/C.java"));
        let refs = References::load(dir.path(), "p").unwrap();
        assert_eq!(refs.modified_files.len(), 3);
    }

    #[test]
    fn fix_task_resolves_finding_and_releases_source() {
        let (dir, store) = setup();
        let mut src = task(1, "src/Health.java");
        src.block("verification failed");
        src.save(dir.path(), "p").unwrap();
        let log = FindingLog::new(dir.path(), "p", FindingScope::Plan);
        let mut f = Finding::new(FindingType::BuildError, "broken", Severity::Error);
        f.source_task = Some(src.id.clone());
        let hash = log.add(f).unwrap().hash_id;

        let mut fix = Task::new("TASK-002-FIX", "Fix: broken", "java", "api-service", Profile::Implementation);
        fix.origin = TaskOrigin::Fix;
        fix.fixes_findings = vec![hash.clone()];
        fix.save(dir.path(), "p").unwrap();

        let runner = CountingRunner { calls: AtomicUsize::new(0), pass_after: 0 };
        let exec = Executor::new(&store, &RecordedWorker, &runner, &config());
        let r = exec.execute("p", "TASK-002-FIX").unwrap();
        assert_eq!(r.resolved_findings, vec![hash.clone()]);
        assert_eq!(log.get(&hash).unwrap().resolution, Resolution::Fixed);
        assert_eq!(
            Task::load(dir.path(), "p", "TASK-001-IMPL").unwrap().status,
            TaskStatus::Pending
        );
    }
}
