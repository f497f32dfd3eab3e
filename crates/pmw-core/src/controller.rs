use crate::config::WorkflowConfig;
use crate::error::{PmwError, Result};
use crate::handlers::{Collaborators, HandlerRegistry, PhaseContext, PhaseOutcome, TerminalError};
use crate::outline::SolutionOutline;
use crate::plan::{ConflictResolution, CreateOutcome, Plan, PlanConfig, PlanStatus, PlanStore, StatusNote};
use crate::request::Request;
use crate::skills::{ModuleIndex, WorkflowSkill, SYSTEM_DOMAIN};
use crate::task::Task;
use crate::types::{Phase, TaskStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};

const STEP_OUTCOMES: &[&str] = &["done", "skipped", "failed"];

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub plan_id: String,
    pub from: Phase,
    pub phase: Phase,
    pub handler: String,
    pub workflow_skill: WorkflowSkill,
    pub outcome: PhaseOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Terminal,
    Waiting,
    StepLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan_id: String,
    pub phase: Phase,
    pub stopped: StopReason,
    pub steps: Vec<StepReport>,
}

/// Drives plans through their phases. The only writer of plan phase state.
pub struct PhaseController {
    store: PlanStore,
    config: WorkflowConfig,
    modules: ModuleIndex,
    registry: HandlerRegistry,
    collaborators: Collaborators,
}

impl PhaseController {
    pub fn new(root: &Path, config: WorkflowConfig, modules: ModuleIndex, collaborators: Collaborators) -> Self {
        let store = PlanStore::new(root).with_lock_settings(config.lock_settings());
        Self {
            store,
            config,
            modules,
            registry: HandlerRegistry::system(),
            collaborators,
        }
    }

    /// Load project config and module index from `root`.
    pub fn open(root: &Path, collaborators: Collaborators) -> Result<Self> {
        let config = WorkflowConfig::load(root)?;
        let modules = ModuleIndex::load(root)?;
        Ok(Self::new(root, config, modules, collaborators))
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    pub fn init(
        &self,
        config: PlanConfig,
        request: Request,
        resolution: Option<ConflictResolution>,
    ) -> Result<CreateOutcome> {
        self.config.check_domains(&config.domains)?;
        let outcome = self.store.create_or_reference(config, request, resolution)?;
        tracing::info!(plan = outcome.plan.id(), action = ?outcome.action, "plan initialized");
        Ok(outcome)
    }

    /// Run the handler of the plan's current phase once and apply its outcome.
    pub fn step(&self, plan_id: &str) -> Result<StepReport> {
        let _running = self.store.phase_guard(plan_id)?;
        let plan = self.store.read(plan_id)?;
        let from = plan.phase();
        if from.is_terminal() {
            return Err(PmwError::InvalidTransition {
                from: from.to_string(),
                to: "next".to_string(),
                reason: "the plan has ended".to_string(),
            });
        }

        let resolved = self.registry.resolve(from, &plan.config.domains)?;
        let workflow_skill = self.workflow_skill(&plan, from)?;
        let handler = resolved.handler.name().to_string();
        tracing::info!(plan = plan_id, phase = %from, handler = %handler, skill = %workflow_skill.skill, "running phase");

        let mut ctx = PhaseContext::new(&self.store, &self.config, &self.modules, &self.collaborators, &plan);
        let outcome = resolved.handler.handle(&mut ctx)?;
        let recorded = ctx.take_recorded();

        let (status, outcome) = {
            let _lock = self.store.lock(plan_id)?;
            let mut status = self.store.read_status(plan_id)?;
            if status.phase != from {
                return Err(PmwError::InvalidTransition {
                    from: from.to_string(),
                    to: status.phase.to_string(),
                    reason: "the phase changed while its handler ran".to_string(),
                });
            }
            for r in recorded {
                status.record_finalize_step(&r.step, &r.outcome, r.detail);
            }
            let outcome = self.apply(&mut status, from, outcome)?;
            self.store.save_status(&status)?;
            (status, outcome)
        };

        let archived = if status.phase == Phase::Complete && self.config.finalize.archive_on_complete {
            Some(self.store.archive(plan_id)?)
        } else {
            None
        };

        Ok(StepReport {
            plan_id: plan_id.to_string(),
            from,
            phase: status.phase,
            handler,
            workflow_skill,
            outcome,
            archived,
        })
    }

    /// Step until the plan ends, waits, or `max_steps` handlers ran.
    pub fn run(&self, plan_id: &str, max_steps: usize) -> Result<RunReport> {
        let mut steps = Vec::new();
        let stopped = loop {
            if steps.len() >= max_steps {
                break StopReason::StepLimit;
            }
            let report = self.step(plan_id)?;
            let waiting = matches!(report.outcome, PhaseOutcome::Wait { .. });
            let ended = report.phase.is_terminal();
            steps.push(report);
            if ended {
                break StopReason::Terminal;
            }
            if waiting {
                break StopReason::Waiting;
            }
        };
        let phase = steps
            .last()
            .map(|s| s.phase)
            .map_or_else(|| self.store.read_status(plan_id).map(|s| s.phase), Ok)?;
        Ok(RunReport {
            plan_id: plan_id.to_string(),
            phase,
            stopped,
            steps,
        })
    }

    /// Ends the plan in `aborted`. Artifacts stay on disk.
    pub fn abort(&self, plan_id: &str, reason: &str) -> Result<PlanStatus> {
        self.store.read(plan_id)?;
        let _lock = self.store.lock(plan_id)?;
        let mut status = self.store.read_status(plan_id)?;
        if status.phase.is_terminal() {
            return Err(PmwError::InvalidTransition {
                from: status.phase.to_string(),
                to: Phase::Aborted.to_string(),
                reason: "the plan has already ended".to_string(),
            });
        }
        status.enter(Phase::Aborted, Some(reason.to_string()));
        status.outcome = Some(StatusNote {
            category: "aborted".to_string(),
            message: reason.to_string(),
        });
        self.store.save_status(&status)?;
        tracing::info!(plan = plan_id, reason, "plan aborted");
        Ok(status)
    }

    /// Manual forward transition, checked against the target's preconditions.
    pub fn advance(&self, plan_id: &str, target: Phase) -> Result<PlanStatus> {
        let plan = self.store.read(plan_id)?;
        self.can_advance(&plan, target)?;
        let status = {
            let _lock = self.store.lock(plan_id)?;
            let mut status = self.store.read_status(plan_id)?;
            status.enter(target, Some("manual transition".to_string()));
            self.store.save_status(&status)?;
            status
        };
        tracing::info!(plan = plan_id, from = %plan.phase(), to = %target, "phase advanced");
        if target == Phase::Complete && self.config.finalize.archive_on_complete {
            self.store.archive(plan_id)?;
        }
        Ok(status)
    }

    pub fn can_advance(&self, plan: &Plan, target: Phase) -> Result<()> {
        let from = plan.phase();
        let refuse = |reason: String| PmwError::InvalidTransition {
            from: from.to_string(),
            to: target.to_string(),
            reason,
        };
        if from.is_terminal() {
            return Err(refuse("the plan has ended".to_string()));
        }
        if matches!(target, Phase::Aborted | Phase::Failed) {
            return Err(refuse("use abort to end a plan early".to_string()));
        }
        if target <= from {
            return Err(refuse("transitions are forward-only".to_string()));
        }

        let root = self.store.root();
        let id = plan.id();
        if target >= Phase::Refine {
            Request::load(root, id)?;
        }
        if target >= Phase::Plan {
            SolutionOutline::load(root, id)?.validate(&plan.config.domains, None)?;
        }
        if target >= Phase::Execute {
            let tasks = Task::list(root, id)?;
            if tasks.is_empty() {
                return Err(PmwError::MissingArtifact {
                    artifact: "tasks".to_string(),
                    plan: id.to_string(),
                    producer: "plan".to_string(),
                });
            }
            if target >= Phase::Verify {
                if let Some(t) = tasks.iter().find(|t| t.status != TaskStatus::Done) {
                    return Err(refuse(format!("task {} is {}", t.id, t.status)));
                }
            }
        }
        if target == Phase::Complete {
            let missing: Vec<&str> = self
                .config
                .finalize
                .steps
                .iter()
                .filter(|s| !plan.status.finalize_steps.contains_key(s.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(refuse(format!("finalize steps not recorded: {}", missing.join(", "))));
            }
        }
        Ok(())
    }

    pub fn record_finalize_step(
        &self,
        plan_id: &str,
        step: &str,
        outcome: &str,
        detail: Option<String>,
    ) -> Result<PlanStatus> {
        if !self.config.finalize.steps.iter().any(|s| s == step) {
            return Err(PmwError::InvalidValue {
                field: "finalize step".to_string(),
                value: format!("{step} (configured: {})", self.config.finalize.steps.join(", ")),
            });
        }
        if !STEP_OUTCOMES.contains(&outcome) {
            return Err(PmwError::InvalidValue {
                field: "finalize step outcome".to_string(),
                value: outcome.to_string(),
            });
        }
        self.store.read(plan_id)?;
        let _lock = self.store.lock(plan_id)?;
        let mut status = self.store.read_status(plan_id)?;
        if status.phase != Phase::Finalize {
            return Err(PmwError::InvalidTransition {
                from: status.phase.to_string(),
                to: "finalize-step".to_string(),
                reason: "finalize steps are recorded during finalize".to_string(),
            });
        }
        status.record_finalize_step(step, outcome, detail);
        self.store.save_status(&status)?;
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn workflow_skill(&self, plan: &Plan, phase: Phase) -> Result<WorkflowSkill> {
        let key = match phase {
            Phase::Execute => "implementation",
            other => other.as_str(),
        };
        let domain = plan
            .config
            .domains
            .first()
            .map(String::as_str)
            .unwrap_or(SYSTEM_DOMAIN);
        self.config
            .domain_registry()?
            .resolve_workflow_skill(domain, key)
    }

    /// Validate an outcome against the transition rules and write it into
    /// `status`. Exceeding a loop cap turns a loop-back into a terminal error.
    fn apply(&self, status: &mut PlanStatus, from: Phase, outcome: PhaseOutcome) -> Result<PhaseOutcome> {
        let refuse = |to: Phase, reason: &str| PmwError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        };
        match outcome {
            PhaseOutcome::Continue(next) => {
                if next <= from || matches!(next, Phase::Aborted | Phase::Failed) {
                    return Err(refuse(next, "handlers may only continue forward"));
                }
                status.enter(next, None);
                tracing::info!(plan = %status.plan_id, from = %from, to = %next, "phase transition");
                Ok(PhaseOutcome::Continue(next))
            }
            PhaseOutcome::LoopBack {
                reason,
                next,
                iteration,
            } => {
                if next >= from {
                    return Err(refuse(next, "a loop-back must target an earlier phase"));
                }
                let (loop_name, cap, counter) = match from {
                    Phase::Verify => ("verify", self.config.iterations.verify, &mut status.verify_iteration),
                    Phase::Finalize => ("finalize", self.config.iterations.finalize, &mut status.finalize_iteration),
                    _ => return Err(refuse(next, "only verify and finalize may loop back")),
                };
                if iteration > cap {
                    let err = PmwError::IterationLimitExceeded {
                        loop_name: loop_name.to_string(),
                        cap,
                    };
                    tracing::warn!(plan = %status.plan_id, loop_name, cap, "iteration limit reached");
                    let terminal = TerminalError::from(&err);
                    fail(status, &terminal);
                    return Ok(PhaseOutcome::Terminal(terminal));
                }
                *counter = iteration;
                status.enter(next, Some(reason.clone()));
                tracing::info!(plan = %status.plan_id, from = %from, to = %next, iteration, reason = %reason, "loop back");
                Ok(PhaseOutcome::LoopBack {
                    reason,
                    next,
                    iteration,
                })
            }
            PhaseOutcome::Wait { reason } => {
                status.updated_at = chrono::Utc::now();
                tracing::info!(plan = %status.plan_id, phase = %from, reason = %reason, "waiting");
                Ok(PhaseOutcome::Wait { reason })
            }
            PhaseOutcome::Terminal(terminal) => {
                fail(status, &terminal);
                Ok(PhaseOutcome::Terminal(terminal))
            }
        }
    }
}

fn fail(status: &mut PlanStatus, terminal: &TerminalError) {
    status.enter(Phase::Failed, Some(terminal.message.clone()));
    status.outcome = Some(StatusNote {
        category: terminal.category.to_string(),
        message: format!("{} ({})", terminal.message, terminal.hint),
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerificationCommand;
    use crate::executor::{StepOutcome, StepWorker};
    use crate::finding::{FindingLog, FindingScope};
    use crate::handlers::{Outliner, ShipReviewer};
    use crate::paths;
    use crate::references::References;
    use crate::skills::DomainDescriptor;
    use crate::task::Step;
    use crate::testutil::{module_index, HEALTH_OUTLINE};
    use crate::types::{FindingType, Severity};
    use crate::verify::{CommandResult, CommandRunner, VerificationScope};
    use crate::finding::Finding;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const FAILING: &str = "lint-check";

    struct WritesEverything;

    impl StepWorker for WritesEverything {
        fn perform(&self, _task: &Task, _step: &Step) -> StepOutcome {
            StepOutcome::Done { modified: Vec::new() }
        }

        fn attempt_fix(&self, _task: &Task, _failure: &CommandResult) -> Vec<String> {
            Vec::new()
        }
    }

    /// Passes everything except [`FAILING`].
    struct StubRunner;

    impl CommandRunner for StubRunner {
        fn run(&self, command: &str, _scope: &VerificationScope, _t: Option<Duration>) -> CommandResult {
            CommandResult {
                command: command.to_string(),
                passed: command != FAILING,
                output: String::new(),
                duration_ms: 0,
                timed_out: false,
            }
        }
    }

    struct FixedOutline;

    impl Outliner for FixedOutline {
        fn outline(&self, _plan: &Plan, _request: &Request) -> Result<Option<SolutionOutline>> {
            SolutionOutline::parse(HEALTH_OUTLINE).map(Some)
        }
    }

    /// Reports one PR comment on the first `rounds` reviews.
    struct CommentingReviewer {
        calls: AtomicUsize,
        rounds: usize,
    }

    impl ShipReviewer for CommentingReviewer {
        fn review(&self, _plan: &Plan, _refs: &References) -> Result<Vec<Finding>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.rounds {
                return Ok(Vec::new());
            }
            Ok(vec![Finding::new(
                FindingType::PrComment,
                format!("Review comment {n}"),
                Severity::Warning,
            )
            .with_location("src/main/java/Health.java", Some(12))])
        }
    }

    fn workflow_config() -> WorkflowConfig {
        let mut cfg = WorkflowConfig::new("demo");
        cfg.domains = vec![DomainDescriptor::new("java").with_workflow_skill("plan", "java:plan-java")];
        cfg.finalize.steps = vec!["automated-review".to_string(), "knowledge-capture".to_string()];
        cfg
    }

    fn controller(dir: &TempDir, cfg: WorkflowConfig, collab: Collaborators) -> PhaseController {
        PhaseController::new(dir.path(), cfg, module_index(), collab)
    }

    fn collaborators(dir: &TempDir) -> Collaborators {
        Collaborators::standard(dir.path())
            .with_worker(Arc::new(WritesEverything))
            .with_runner(Arc::new(StubRunner))
            .with_outliner(Arc::new(FixedOutline))
    }

    fn init(c: &PhaseController) {
        c.init(
            PlanConfig::new("health-check", vec!["java".to_string()]),
            Request::description("health-check", "Add a health-check endpoint"),
            None,
        )
        .unwrap();
    }

    #[test]
    fn basic_plan_lifecycle() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, workflow_config(), collaborators(&dir));
        init(&c);
        assert_eq!(c.store().read("health-check").unwrap().phase(), Phase::Init);

        let r = c.step("health-check").unwrap();
        assert_eq!(r.phase, Phase::Refine);
        let r = c.step("health-check").unwrap();
        assert_eq!(r.phase, Phase::Outline);
        let r = c.step("health-check").unwrap();
        assert_eq!(r.phase, Phase::Plan);
        assert!(SolutionOutline::exists(dir.path(), "health-check"));

        let r = c.step("health-check").unwrap();
        assert_eq!(r.phase, Phase::Execute);
        assert_eq!(r.workflow_skill.skill, "java:plan-java");
        assert!(!r.workflow_skill.fallback);
        // Two profiles for deliverable 1, one for deliverable 2.
        assert_eq!(Task::list(dir.path(), "health-check").unwrap().len(), 3);

        let report = c.run("health-check", 20).unwrap();
        assert_eq!(report.stopped, StopReason::Terminal);
        assert_eq!(report.phase, Phase::Complete);
        let phases: Vec<Phase> = report.steps.iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![Phase::Verify, Phase::Finalize, Phase::Complete]);
        assert!(report.steps[0].workflow_skill.fallback);

        let archived = report.steps.last().unwrap().archived.clone().unwrap();
        assert!(archived.join(paths::STATUS_FILE).exists());
        assert!(!c.store().exists("health-check"));
    }

    #[test]
    fn concurrent_step_is_refused_before_the_handler_runs() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, workflow_config(), collaborators(&dir));
        init(&c);

        let running = c.store().phase_guard("health-check").unwrap();
        assert!(matches!(
            c.step("health-check"),
            Err(PmwError::PhaseRunning(_))
        ));
        assert_eq!(c.store().read("health-check").unwrap().phase(), Phase::Init);
        drop(running);

        assert_eq!(c.step("health-check").unwrap().phase, Phase::Refine);
        assert!(!paths::phase_lock_path(dir.path(), "health-check").exists());
    }

    #[test]
    fn verify_loop_stops_at_cap() {
        let dir = TempDir::new().unwrap();
        let mut cfg = workflow_config();
        cfg.verification.commands = vec![VerificationCommand {
            name: "lint".to_string(),
            command: FAILING.to_string(),
            timeout_seconds: None,
            kind: FindingType::BuildError,
        }];
        let c = controller(&dir, cfg, collaborators(&dir));
        init(&c);

        let report = c.run("health-check", 100).unwrap();
        assert_eq!(report.stopped, StopReason::Terminal);
        assert_eq!(report.phase, Phase::Failed);
        let loop_backs = report
            .steps
            .iter()
            .filter(|s| matches!(s.outcome, PhaseOutcome::LoopBack { .. }))
            .count();
        assert_eq!(loop_backs, 5);
        match &report.steps.last().unwrap().outcome {
            PhaseOutcome::Terminal(t) => {
                assert_eq!(t.category, crate::error::ErrorCategory::IterationLimitExceeded)
            }
            other => panic!("expected terminal outcome, got {other:?}"),
        }

        let status = c.store().read_status("health-check").unwrap();
        assert_eq!(status.verify_iteration, 5);
        assert_eq!(status.outcome.unwrap().category, "iteration_limit_exceeded");
        // The finding was not dropped.
        let pending = FindingLog::new(dir.path(), "health-check", FindingScope::QGate(Phase::Verify))
            .query(&crate::finding::FindingFilter::pending())
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(c.step("health-check").is_err());
    }

    #[test]
    fn finalize_review_loops_back_to_execute() {
        let dir = TempDir::new().unwrap();
        let collab = collaborators(&dir).with_reviewer(Arc::new(CommentingReviewer {
            calls: AtomicUsize::new(0),
            rounds: 1,
        }));
        let c = controller(&dir, workflow_config(), collab);
        init(&c);

        let report = c.run("health-check", 30).unwrap();
        assert_eq!(report.phase, Phase::Complete);
        let back: Vec<&StepReport> = report
            .steps
            .iter()
            .filter(|s| s.from == Phase::Finalize && s.phase == Phase::Execute)
            .collect();
        assert_eq!(back.len(), 1);
        let archived = report.steps.last().unwrap().archived.clone().unwrap();
        let status: PlanStatus =
            serde_yaml::from_str(&std::fs::read_to_string(archived.join(paths::STATUS_FILE)).unwrap()).unwrap();
        assert_eq!(status.finalize_iteration, 1);
        assert!(status.finalize_steps.contains_key("automated-review"));
    }

    #[test]
    fn finalize_cap_is_three() {
        let dir = TempDir::new().unwrap();
        let collab = collaborators(&dir).with_reviewer(Arc::new(CommentingReviewer {
            calls: AtomicUsize::new(0),
            rounds: usize::MAX,
        }));
        let c = controller(&dir, workflow_config(), collab);
        init(&c);
        let report = c.run("health-check", 100).unwrap();
        assert_eq!(report.phase, Phase::Failed);
        assert_eq!(c.store().read_status("health-check").unwrap().finalize_iteration, 3);
    }

    #[test]
    fn waits_for_external_steps_and_outline() {
        let dir = TempDir::new().unwrap();
        let collab = Collaborators::standard(dir.path()).with_runner(Arc::new(StubRunner));
        let c = controller(&dir, workflow_config(), collab);
        init(&c);

        let report = c.run("health-check", 10).unwrap();
        assert_eq!(report.stopped, StopReason::Waiting);
        assert_eq!(report.phase, Phase::Outline);

        SolutionOutline::parse(HEALTH_OUTLINE)
            .unwrap()
            .save(dir.path(), "health-check")
            .unwrap();
        let report = c.run("health-check", 10).unwrap();
        assert_eq!(report.stopped, StopReason::Waiting);
        assert_eq!(report.phase, Phase::Execute);
        match &report.steps.last().unwrap().outcome {
            PhaseOutcome::Wait { reason } => assert!(reason.contains("0/3 tasks done")),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn abort_and_manual_advance() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, workflow_config(), collaborators(&dir));
        init(&c);

        assert!(c.advance("health-check", Phase::Plan).is_err());
        c.advance("health-check", Phase::Refine).unwrap();
        assert!(c.advance("health-check", Phase::Init).is_err());
        assert!(c.advance("health-check", Phase::Failed).is_err());
        assert!(c
            .record_finalize_step("health-check", "automated-review", "done", None)
            .is_err());

        let status = c.abort("health-check", "requirements changed").unwrap();
        assert_eq!(status.phase, Phase::Aborted);
        assert!(c.abort("health-check", "again").is_err());
        assert!(c.step("health-check").is_err());
    }

    #[test]
    fn init_rejects_unconfigured_domains() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, workflow_config(), collaborators(&dir));
        let err = c
            .init(
                PlanConfig::new("p", vec!["rust".to_string()]),
                Request::description("p", "x"),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PmwError::UnknownDomain(_)));
    }
}
