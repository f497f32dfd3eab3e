//! Phase handlers: the work done in each phase, behind a registry that lets a
//! domain replace the system handler for any active phase.
//!
//! Handlers never write plan status. They return a [`PhaseOutcome`] and may
//! record finalize steps on the [`PhaseContext`]; the controller applies both.

use crate::config::WorkflowConfig;
use crate::error::{ErrorCategory, PmwError, Result};
use crate::executor::{Executor, RecordedWorker, StepWorker};
use crate::finding::{self, Finding, FindingFilter, FindingLog, FindingScope};
use crate::outline::SolutionOutline;
use crate::paths;
use crate::plan::{Plan, PlanStore};
use crate::planner::Planner;
use crate::references::References;
use crate::request::Request;
use crate::skills::{ModuleIndex, RelevancePredicate, TagRelevance, SYSTEM_DOMAIN};
use crate::task::{self, Task};
use crate::triage::{self, DefaultTriagePolicy, TriagePolicy};
use crate::types::{Phase, Resolution, Severity, TaskStatus};
use crate::verify::{CommandRunner, ShellRunner, VerificationScope};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalError {
    pub category: ErrorCategory,
    pub message: String,
    pub hint: String,
}

impl From<&PmwError> for TerminalError {
    fn from(e: &PmwError) -> Self {
        Self {
            category: e.category(),
            message: e.to_string(),
            hint: e.recovery_hint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Continue(Phase),
    LoopBack {
        reason: String,
        next: Phase,
        iteration: u32,
    },
    /// Stay in the current phase until something external happens.
    Wait { reason: String },
    Terminal(TerminalError),
}

// ---------------------------------------------------------------------------
// External collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refinement {
    Ready,
    Clarified(String),
    NeedsInput(String),
}

pub trait Refiner: Send + Sync {
    fn refine(&self, request: &Request) -> Result<Refinement>;
}

/// Takes the request as written.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptRequest;

impl Refiner for AcceptRequest {
    fn refine(&self, _request: &Request) -> Result<Refinement> {
        Ok(Refinement::Ready)
    }
}

pub trait Outliner: Send + Sync {
    /// `None` means the outline will be written out of band.
    fn outline(&self, plan: &Plan, request: &Request) -> Result<Option<SolutionOutline>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExistingOutline;

impl Outliner for ExistingOutline {
    fn outline(&self, _plan: &Plan, _request: &Request) -> Result<Option<SolutionOutline>> {
        Ok(None)
    }
}

/// Post-ship review (CI, PR comments, static analysis).
pub trait ShipReviewer: Send + Sync {
    fn review(&self, plan: &Plan, references: &References) -> Result<Vec<Finding>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoReview;

impl ShipReviewer for NoReview {
    fn review(&self, _plan: &Plan, _references: &References) -> Result<Vec<Finding>> {
        Ok(Vec::new())
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub worker: Arc<dyn StepWorker>,
    pub runner: Arc<dyn CommandRunner>,
    pub refiner: Arc<dyn Refiner>,
    pub outliner: Arc<dyn Outliner>,
    pub reviewer: Arc<dyn ShipReviewer>,
    pub triage: Arc<dyn TriagePolicy>,
    pub relevance: Arc<dyn RelevancePredicate>,
}

impl Collaborators {
    /// Out-of-band agent, shell verification, default triage and relevance.
    pub fn standard(root: &Path) -> Self {
        Self {
            worker: Arc::new(RecordedWorker),
            runner: Arc::new(ShellRunner::new(root)),
            refiner: Arc::new(AcceptRequest),
            outliner: Arc::new(ExistingOutline),
            reviewer: Arc::new(NoReview),
            triage: Arc::new(DefaultTriagePolicy::default()),
            relevance: Arc::new(TagRelevance::default()),
        }
    }

    pub fn with_worker(mut self, worker: Arc<dyn StepWorker>) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_outliner(mut self, outliner: Arc<dyn Outliner>) -> Self {
        self.outliner = outliner;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn ShipReviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedStep {
    pub step: String,
    pub outcome: String,
    pub detail: Option<String>,
}

pub struct PhaseContext<'a> {
    pub store: &'a PlanStore,
    pub config: &'a WorkflowConfig,
    pub modules: &'a ModuleIndex,
    pub collaborators: &'a Collaborators,
    pub plan: &'a Plan,
    recorded: Vec<RecordedStep>,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        store: &'a PlanStore,
        config: &'a WorkflowConfig,
        modules: &'a ModuleIndex,
        collaborators: &'a Collaborators,
        plan: &'a Plan,
    ) -> Self {
        Self {
            store,
            config,
            modules,
            collaborators,
            plan,
            recorded: Vec::new(),
        }
    }

    pub fn plan_id(&self) -> &str {
        self.plan.id()
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn finding_log(&self, scope: FindingScope) -> FindingLog {
        FindingLog::new(self.root(), self.plan_id(), scope).with_lock_settings(self.config.lock_settings())
    }

    /// Queue a finalize step; written with the phase outcome.
    pub fn record_finalize_step(&mut self, step: &str, outcome: &str, detail: Option<String>) {
        self.recorded.push(RecordedStep {
            step: step.to_string(),
            outcome: outcome.to_string(),
            detail,
        });
    }

    fn is_recorded(&self, step: &str) -> bool {
        self.plan.status.finalize_steps.contains_key(step)
            || self.recorded.iter().any(|r| r.step == step)
    }

    pub(crate) fn take_recorded(&mut self) -> Vec<RecordedStep> {
        std::mem::take(&mut self.recorded)
    }
}

// ---------------------------------------------------------------------------
// Handler trait & registry
// ---------------------------------------------------------------------------

pub trait PhaseHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;
}

pub struct ResolvedHandler {
    pub handler: Arc<dyn PhaseHandler>,
    /// Domain whose override was chosen; `None` for the system handler.
    pub domain: Option<String>,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    defaults: BTreeMap<Phase, Arc<dyn PhaseHandler>>,
    overrides: BTreeMap<(String, Phase), Arc<dyn PhaseHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in handler for every active phase.
    pub fn system() -> Self {
        let mut r = Self::empty();
        r.set_default(Phase::Init, Arc::new(InitHandler));
        r.set_default(Phase::Refine, Arc::new(RefineHandler));
        r.set_default(Phase::Outline, Arc::new(OutlineHandler));
        r.set_default(Phase::Plan, Arc::new(PlanHandler));
        r.set_default(Phase::Execute, Arc::new(ExecuteHandler));
        r.set_default(Phase::Verify, Arc::new(VerifyHandler));
        r.set_default(Phase::Finalize, Arc::new(FinalizeHandler));
        r
    }

    pub fn set_default(&mut self, phase: Phase, handler: Arc<dyn PhaseHandler>) {
        self.defaults.insert(phase, handler);
    }

    pub fn register(&mut self, domain: &str, phase: Phase, handler: Arc<dyn PhaseHandler>) -> Result<()> {
        let invalid = |reason: String| PmwError::InvalidDomain {
            key: domain.to_string(),
            reason,
        };
        if domain == SYSTEM_DOMAIN {
            return Err(invalid("'system' handlers are the defaults".to_string()));
        }
        if !paths::is_kebab(domain) {
            return Err(invalid("key must be kebab-case".to_string()));
        }
        if !phase.is_active() {
            return Err(invalid(format!("phase '{phase}' has no handler")));
        }
        let key = (domain.to_string(), phase);
        if self.overrides.contains_key(&key) {
            return Err(invalid(format!("a '{phase}' handler is already registered")));
        }
        self.overrides.insert(key, handler);
        Ok(())
    }

    /// First domain (in plan order) with an override wins, else the default.
    pub fn resolve(&self, phase: Phase, domains: &[String]) -> Result<ResolvedHandler> {
        for d in domains {
            if let Some(h) = self.overrides.get(&(d.clone(), phase)) {
                return Ok(ResolvedHandler {
                    handler: Arc::clone(h),
                    domain: Some(d.clone()),
                });
            }
        }
        self.defaults
            .get(&phase)
            .map(|h| ResolvedHandler {
                handler: Arc::clone(h),
                domain: None,
            })
            .ok_or_else(|| PmwError::InvalidPhase(format!("no handler for phase '{phase}'")))
    }
}

// ---------------------------------------------------------------------------
// System handlers
// ---------------------------------------------------------------------------

pub struct InitHandler;

impl PhaseHandler for InitHandler {
    fn name(&self) -> &str {
        "system:init"
    }

    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        Request::load(ctx.root(), ctx.plan_id())?;
        ctx.config.check_domains(&ctx.plan.config.domains)?;
        Ok(PhaseOutcome::Continue(Phase::Refine))
    }
}

pub struct RefineHandler;

impl PhaseHandler for RefineHandler {
    fn name(&self) -> &str {
        "system:refine"
    }

    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let request = Request::load(ctx.root(), ctx.plan_id())?;
        match ctx.collaborators.refiner.refine(&request)? {
            Refinement::Ready => {}
            Refinement::Clarified(text) => {
                ctx.store.clarify(ctx.plan_id(), &text)?;
            }
            Refinement::NeedsInput(question) => {
                return Ok(PhaseOutcome::Wait { reason: question });
            }
        }
        Ok(PhaseOutcome::Continue(Phase::Outline))
    }
}

pub struct OutlineHandler;

impl PhaseHandler for OutlineHandler {
    fn name(&self) -> &str {
        "system:outline"
    }

    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let (root, id) = (ctx.root(), ctx.plan_id());
        let outline = if SolutionOutline::exists(root, id) {
            SolutionOutline::load(root, id)?
        } else {
            let request = Request::load(root, id)?;
            match ctx.collaborators.outliner.outline(ctx.plan, &request)? {
                Some(outline) => {
                    outline.save(root, id)?;
                    outline
                }
                None => {
                    return Ok(PhaseOutcome::Wait {
                        reason: format!("waiting for {}", paths::OUTLINE_FILE),
                    })
                }
            }
        };
        outline.validate(&ctx.plan.config.domains, None)?;
        for d in &outline.deliverables {
            ctx.modules.module(&d.module)?;
        }
        tracing::info!(plan = id, deliverables = outline.deliverables.len(), "outline accepted");
        Ok(PhaseOutcome::Continue(Phase::Plan))
    }
}

pub struct PlanHandler;

impl PhaseHandler for PlanHandler {
    fn name(&self) -> &str {
        "system:plan"
    }

    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let outline = SolutionOutline::load(ctx.root(), ctx.plan_id())?;
        let planner = Planner::new(
            ctx.modules,
            ctx.collaborators.relevance.as_ref(),
            ctx.config.planning.task_creation,
        );
        let plan = planner.plan(&outline, &ctx.plan.config.domains)?;
        plan.persist(ctx.store, ctx.plan_id())?;
        Ok(PhaseOutcome::Continue(Phase::Execute))
    }
}

pub struct ExecuteHandler;

impl PhaseHandler for ExecuteHandler {
    fn name(&self) -> &str {
        "system:execute"
    }

    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let c = ctx.collaborators;
        let executor = Executor::new(ctx.store, c.worker.as_ref(), c.runner.as_ref(), ctx.config);
        executor.execute_ready(ctx.plan_id())?;

        let tasks = Task::list(ctx.root(), ctx.plan_id())?;
        if tasks.is_empty() {
            return Err(PmwError::MissingArtifact {
                artifact: "tasks".to_string(),
                plan: ctx.plan_id().to_string(),
                producer: "plan".to_string(),
            });
        }
        let unfinished: Vec<&str> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .map(|t| t.id.as_str())
            .collect();
        let blocked = tasks.iter().any(|t| t.status == TaskStatus::Blocked);
        if unfinished.is_empty() || blocked {
            return Ok(PhaseOutcome::Continue(Phase::Verify));
        }
        Ok(PhaseOutcome::Wait {
            reason: format!(
                "{}; awaiting {}",
                task::summarize(&tasks),
                unfinished.join(", ")
            ),
        })
    }
}

pub struct VerifyHandler;

impl VerifyHandler {
    fn title(name: &str) -> String {
        format!("{name} failed")
    }
}

impl PhaseHandler for VerifyHandler {
    fn name(&self) -> &str {
        "system:verify"
    }

    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let (root, id) = (ctx.root(), ctx.plan_id());
        let refs = References::load(root, id)?;
        let scope = VerificationScope::from_modified(&refs.modified_files);
        let qgate = ctx.finding_log(FindingScope::QGate(Phase::Verify));

        for cmd in &ctx.config.verification.commands {
            let secs = cmd
                .timeout_seconds
                .unwrap_or(ctx.config.execution.verification_timeout_seconds);
            let timeout = (secs > 0).then(|| Duration::from_secs(secs));
            let result = ctx.collaborators.runner.run(&cmd.command, &scope, timeout);
            let title = Self::title(&cmd.name);
            if result.passed {
                for f in qgate.query(&FindingFilter::pending())? {
                    if f.title == title {
                        qgate.resolve(&f.hash_id, Resolution::Fixed, Some("passes on re-run".to_string()))?;
                    }
                }
            } else {
                let out = qgate.add(
                    Finding::new(cmd.kind, title, Severity::Error).with_detail(result.output),
                )?;
                tracing::info!(check = %cmd.name, finding = %out.hash_id, status = ?out.status, "verification check failed");
            }
        }

        let policy = ctx.collaborators.triage.as_ref();
        let mut fix_tasks = Vec::new();
        let mut needs_fixes = false;
        for log in [ctx.finding_log(FindingScope::Plan), qgate] {
            let report = triage::apply(ctx.store, id, &log, policy, true)?;
            needs_fixes |= report.needs_fixes();
            fix_tasks.extend(report.fix_tasks);
        }
        if needs_fixes {
            return Ok(PhaseOutcome::LoopBack {
                reason: format!("unresolved findings; fix tasks: {}", list_or_none(&fix_tasks)),
                next: Phase::Execute,
                iteration: ctx.plan.status.verify_iteration + 1,
            });
        }

        let tasks = Task::list(root, id)?;
        let open: Vec<&str> = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Done)
            .map(|t| t.id.as_str())
            .collect();
        if !open.is_empty() {
            return Ok(PhaseOutcome::Wait {
                reason: format!("tasks not done: {}", open.join(", ")),
            });
        }
        Ok(PhaseOutcome::Continue(Phase::Finalize))
    }
}

pub const REVIEW_STEP: &str = "automated-review";
pub const KNOWLEDGE_STEP: &str = "knowledge-capture";

pub struct FinalizeHandler;

impl PhaseHandler for FinalizeHandler {
    fn name(&self) -> &str {
        "system:finalize"
    }

    fn handle(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let (root, id) = (ctx.root(), ctx.plan_id());
        let config = ctx.config;
        let steps = &config.finalize.steps;
        let qgate = ctx.finding_log(FindingScope::QGate(Phase::Finalize));

        let refs = References::load(root, id)?;
        let reviewed = ctx.collaborators.reviewer.review(ctx.plan, &refs)?;
        let count = reviewed.len();
        for f in reviewed {
            qgate.add(f)?;
        }
        let report = triage::apply(ctx.store, id, &qgate, ctx.collaborators.triage.as_ref(), true)?;
        if steps.iter().any(|s| s == REVIEW_STEP) {
            ctx.record_finalize_step(REVIEW_STEP, "done", Some(format!("{count} findings")));
        }
        if report.needs_fixes() {
            return Ok(PhaseOutcome::LoopBack {
                reason: format!(
                    "post-ship review found issues; fix tasks: {}",
                    list_or_none(&report.fix_tasks)
                ),
                next: Phase::Execute,
                iteration: ctx.plan.status.finalize_iteration + 1,
            });
        }

        if steps.iter().any(|s| s == KNOWLEDGE_STEP) && !ctx.is_recorded(KNOWLEDGE_STEP) {
            let mut promoted = 0;
            for scope in finding::all_scopes() {
                promoted += ctx
                    .finding_log(scope)
                    .query(&FindingFilter {
                        promoted: Some(true),
                        ..FindingFilter::default()
                    })?
                    .len();
            }
            ctx.record_finalize_step(KNOWLEDGE_STEP, "done", Some(format!("{promoted} findings promoted")));
        }

        if let Some((step, _)) = ctx
            .plan
            .status
            .finalize_steps
            .iter()
            .find(|(_, s)| s.outcome == "failed")
        {
            return Ok(PhaseOutcome::Wait {
                reason: format!("finalize step '{step}' failed; resolve it, record it again, then re-run finalize"),
            });
        }
        let missing: Vec<&str> = steps
            .iter()
            .filter(|s| !ctx.is_recorded(s))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Ok(PhaseOutcome::Wait {
                reason: format!("awaiting finalize steps: {}", missing.join(", ")),
            });
        }
        Ok(PhaseOutcome::Continue(Phase::Complete))
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none new".to_string()
    } else {
        items.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
