use crate::error::Result;
use crate::finding::{Finding, FindingLog};
use crate::paths;
use crate::plan::PlanStore;
use crate::task::{self, Task};
use crate::types::{Priority, Profile, Resolution, RuleCategory, Severity, TaskOrigin, TaskStatus};
use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLocation {
    Production,
    Test,
    Generated,
    Unknown,
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileLocation::Production => "production",
            FileLocation::Test => "test",
            FileLocation::Generated => "generated",
            FileLocation::Unknown => "unknown",
        })
    }
}

const GENERATED_DIRS: &[&str] = &["generated", "gen", "target", "build", "dist", "node_modules"];
const GENERATED_SUFFIXES: &[&str] = &[".pb.go", ".g.dart", ".designer.cs", ".min.js"];
const TEST_DIRS: &[&str] = &["test", "tests", "__tests__", "spec", "it"];
const TEST_MARKERS: &[&str] = &["Test.", "Tests.", "IT.", "_test.", ".test.", ".spec.", "_spec."];

/// Path-pattern classification; generated code wins over test code.
pub fn classify_location(path: Option<&str>) -> FileLocation {
    let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
        return FileLocation::Unknown;
    };
    let normalized = path.replace('\\', "/");
    let mut parts: Vec<&str> = normalized.split('/').collect();
    let file = parts.pop().unwrap_or_default();

    if parts.iter().any(|d| GENERATED_DIRS.contains(d))
        || GENERATED_SUFFIXES.iter().any(|s| file.ends_with(s))
        || file.contains("_generated.")
    {
        return FileLocation::Generated;
    }
    if parts.iter().any(|d| TEST_DIRS.contains(d))
        || TEST_MARKERS.iter().any(|m| file.contains(m))
        || file.starts_with("test_")
    {
        return FileLocation::Test;
    }
    FileLocation::Production
}

/// What the decision function sees of a finding.
#[derive(Debug, Clone, Copy)]
pub struct TriageInput {
    pub severity: Severity,
    pub location: FileLocation,
    pub category: RuleCategory,
}

impl TriageInput {
    pub fn of(finding: &Finding) -> Self {
        Self {
            severity: finding.severity,
            location: classify_location(finding.file_path.as_deref()),
            category: finding.rule_category(),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageAction {
    Fix,
    Suppress,
    Accept,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriageDecision {
    pub hash_id: String,
    pub title: String,
    pub action: TriageAction,
    pub priority: Priority,
    pub location: FileLocation,
    pub category: RuleCategory,
    pub rule: &'static str,
}

pub trait TriagePolicy: Send + Sync {
    /// Returns the action and the id of the rule that produced it.
    fn decide(&self, input: &TriageInput) -> (TriageAction, &'static str);
}

/// First matching rule wins.
pub struct TriageRule {
    pub id: &'static str,
    pub condition: fn(&TriageInput) -> bool,
    pub action: TriageAction,
}

pub struct DefaultTriagePolicy {
    rules: Vec<TriageRule>,
}

impl DefaultTriagePolicy {
    pub fn new(rules: Vec<TriageRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[TriageRule] {
        &self.rules
    }
}

impl Default for DefaultTriagePolicy {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl TriagePolicy for DefaultTriagePolicy {
    fn decide(&self, input: &TriageInput) -> (TriageAction, &'static str) {
        self.rules
            .iter()
            .find(|r| (r.condition)(input))
            .map(|r| (r.action, r.id))
            .unwrap_or((TriageAction::Fix, "fallback-fix"))
    }
}

pub fn default_rules() -> Vec<TriageRule> {
    vec![
        TriageRule {
            id: "security-or-bug",
            condition: |i| matches!(i.category, RuleCategory::Security | RuleCategory::Bug),
            action: TriageAction::Fix,
        },
        TriageRule {
            id: "generated-code",
            condition: |i| i.location == FileLocation::Generated,
            action: TriageAction::Suppress,
        },
        TriageRule {
            id: "informational",
            condition: |i| i.severity == Severity::Info,
            action: TriageAction::Accept,
        },
        TriageRule {
            id: "test-warning",
            condition: |i| i.location == FileLocation::Test && i.severity == Severity::Warning,
            action: TriageAction::Suppress,
        },
        TriageRule {
            id: "test-error",
            condition: |i| i.location == FileLocation::Test && i.severity == Severity::Error,
            action: TriageAction::Fix,
        },
        TriageRule {
            id: "production-issue",
            condition: |i| {
                matches!(i.location, FileLocation::Production | FileLocation::Unknown)
                    && matches!(i.severity, Severity::Error | Severity::Warning)
            },
            action: TriageAction::Fix,
        },
    ]
}

/// Decide every pending finding. Pure: nothing is written.
pub fn assess(policy: &dyn TriagePolicy, findings: &[Finding]) -> Vec<TriageDecision> {
    findings
        .iter()
        .filter(|f| f.is_pending())
        .map(|f| {
            let input = TriageInput::of(f);
            let (action, rule) = policy.decide(&input);
            TriageDecision {
                hash_id: f.hash_id.clone(),
                title: f.title.clone(),
                action,
                priority: Priority::from(f.severity),
                location: input.location,
                category: input.category,
                rule,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct TriageReport {
    pub decisions: Vec<TriageDecision>,
    pub fix_tasks: Vec<String>,
    /// Findings already covered by an unfinished fix task.
    pub in_progress: Vec<String>,
    /// Fix decisions left pending because spawning was not allowed.
    pub deferred: Vec<String>,
    pub suppressed: usize,
    pub accepted: usize,
}

impl TriageReport {
    pub fn needs_fixes(&self) -> bool {
        !self.fix_tasks.is_empty() || !self.in_progress.is_empty() || !self.deferred.is_empty()
    }
}

/// Apply the policy to the pending findings of `log`: suppress and accept are
/// resolved in place; fixes become `TASK-nnn-FIX` tasks when `spawn_fixes`.
pub fn apply(
    store: &PlanStore,
    plan_id: &str,
    log: &FindingLog,
    policy: &dyn TriagePolicy,
    spawn_fixes: bool,
) -> Result<TriageReport> {
    let findings = log.load()?;
    let decisions = assess(policy, &findings);
    let mut report = TriageReport::default();

    for decision in &decisions {
        match decision.action {
            TriageAction::Suppress => {
                log.resolve(
                    &decision.hash_id,
                    Resolution::Suppressed,
                    Some(format!("suppressed by triage rule {}", decision.rule)),
                )?;
                report.suppressed += 1;
            }
            TriageAction::Accept => {
                log.resolve(
                    &decision.hash_id,
                    Resolution::Accepted,
                    Some(format!("accepted by triage rule {}", decision.rule)),
                )?;
                report.accepted += 1;
            }
            TriageAction::Fix => {
                let Some(finding) = findings.iter().find(|f| f.hash_id == decision.hash_id) else {
                    continue;
                };
                let tasks = Task::list(store.root(), plan_id)?;
                if fix_underway(finding, &tasks) {
                    report.in_progress.push(decision.hash_id.clone());
                    continue;
                }
                if !spawn_fixes {
                    report.deferred.push(decision.hash_id.clone());
                    continue;
                }
                let fix = fix_task(finding, decision.priority, &tasks, store, plan_id)?;
                let id = {
                    let _lock = store.lock(plan_id)?;
                    task::add(store.root(), plan_id, fix, None)?.id
                };
                log.set_fix_task(&decision.hash_id, &id)?;
                tracing::info!(finding = %decision.hash_id, task = %id, "fix task created");
                report.fix_tasks.push(id);
            }
        }
    }

    report.decisions = decisions;
    Ok(report)
}

fn fix_underway(finding: &Finding, tasks: &[Task]) -> bool {
    finding.fix_task.as_deref().is_some_and(|id| {
        tasks
            .iter()
            .any(|t| t.id == id && matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
    })
}

/// Domain, module and verification come from the task that produced the
/// finding, else from the first task touching the file, else the first task.
fn fix_task(
    finding: &Finding,
    priority: Priority,
    tasks: &[Task],
    store: &PlanStore,
    plan_id: &str,
) -> Result<Task> {
    let source = finding
        .source_task
        .as_deref()
        .and_then(|id| tasks.iter().find(|t| t.id == id));
    let anchor = source
        .or_else(|| {
            finding.file_path.as_deref().and_then(|file| {
                tasks
                    .iter()
                    .find(|t| t.steps.iter().any(|s| s.path == file))
            })
        })
        .or_else(|| tasks.iter().find(|t| t.origin == TaskOrigin::Plan));

    let (domain, module) = match anchor {
        Some(t) => (t.domain.clone(), t.module.clone()),
        None => {
            let config = store.read_config(plan_id)?;
            (
                config.domains.first().cloned().unwrap_or_default(),
                String::new(),
            )
        }
    };

    let id = task::task_id(task::next_seq(tasks), "FIX");
    let mut fix = Task::new(
        id,
        format!("Fix: {}", finding.title),
        domain,
        module,
        Profile::Implementation,
    );
    if let Some(file) = finding
        .file_path
        .as_deref()
        .filter(|f| paths::check_file_path(f).is_ok())
    {
        fix = fix.with_steps([file]);
    }
    fix.origin = TaskOrigin::Fix;
    fix.priority = priority;
    fix.fixes_findings = vec![finding.hash_id.clone()];
    fix.source_task = finding.source_task.clone();
    if let Some(src) = source {
        fix.skills = src.skills.clone();
        fix.verification = src.verification.clone();
        fix.deliverables = src.deliverables.clone();
    }
    Ok(fix)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::FindingScope;
    use crate::plan::PlanConfig;
    use crate::request::Request;
    use crate::types::FindingType;
    use tempfile::TempDir;

    fn input(category: RuleCategory, location: FileLocation, severity: Severity) -> TriageInput {
        TriageInput {
            severity,
            location,
            category,
        }
    }

    #[test]
    fn locations_from_paths() {
        use FileLocation::*;
        assert_eq!(classify_location(Some("src/main/java/Health.java")), Production);
        assert_eq!(classify_location(Some("src/test/java/HealthTest.java")), Test);
        assert_eq!(classify_location(Some("web/app.spec.ts")), Test);
        assert_eq!(classify_location(Some("target/generated/Foo.java")), Generated);
        assert_eq!(classify_location(Some("api/service.pb.go")), Generated);
        assert_eq!(classify_location(None), Unknown);
    }

    #[test]
    fn default_table() {
        use FileLocation::*;
        use RuleCategory::*;
        use TriageAction::*;
        let p = DefaultTriagePolicy::default();
        let d = |c, l, s| p.decide(&input(c, l, s)).0;

        assert_eq!(d(Security, Generated, Severity::Info), Fix);
        assert_eq!(d(Bug, Test, Severity::Warning), Fix);
        assert_eq!(d(Style, Generated, Severity::Error), Suppress);
        assert_eq!(d(Style, Production, Severity::Warning), Fix);
        assert_eq!(d(CodeSmell, Unknown, Severity::Error), Fix);
        assert_eq!(d(Style, Test, Severity::Error), Fix);
        assert_eq!(d(Style, Test, Severity::Warning), Suppress);
        assert_eq!(d(Performance, Production, Severity::Info), Accept);
    }

    #[test]
    fn assess_is_deterministic_and_skips_resolved() {
        let mut a = Finding::new(FindingType::LintIssue, "a", Severity::Warning)
            .with_location("src/lib.rs", None);
        a.hash_id = "aaaaaaaa".to_string();
        let mut b = Finding::new(FindingType::Tip, "b", Severity::Info);
        b.hash_id = "bbbbbbbb".to_string();
        b.resolution = Resolution::Accepted;

        let p = DefaultTriagePolicy::default();
        let first = assess(&p, &[a.clone(), b.clone()]);
        let second = assess(&p, &[a, b]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].action, TriageAction::Fix);
        assert_eq!(first[0].priority, Priority::Medium);
        assert_eq!(first[0].rule, second[0].rule);
    }

    #[test]
    fn apply_spawns_one_fix_task_per_finding() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path());
        store
            .create(
                PlanConfig::new("p", vec!["java".to_string()]),
                Request::description("p", "x"),
            )
            .unwrap();
        let mut src = Task::new("TASK-001-IMPL", "Impl", "java", "api-service", Profile::Implementation)
            .with_steps(["src/Health.java"]);
        src.deliverables = vec![1];
        src.verification.commands = vec!["mvn -q test".to_string()];
        src.block("verification failed");
        src.save(dir.path(), "p").unwrap();

        let log = FindingLog::new(dir.path(), "p", FindingScope::Plan);
        let mut f = Finding::new(FindingType::BuildError, "Build broke", Severity::Error)
            .with_location("src/Health.java", Some(4));
        f.source_task = Some("TASK-001-IMPL".to_string());
        let hash = log.add(f).unwrap().hash_id;
        log.add(Finding::new(FindingType::Tip, "nice to have", Severity::Info))
            .unwrap();

        let policy = DefaultTriagePolicy::default();
        let report = apply(&store, "p", &log, &policy, true).unwrap();
        assert_eq!(report.fix_tasks, vec!["TASK-002-FIX"]);
        assert_eq!(report.accepted, 1);

        let fix = Task::load(dir.path(), "p", "TASK-002-FIX").unwrap();
        assert_eq!(fix.origin, TaskOrigin::Fix);
        assert_eq!(fix.priority, Priority::High);
        assert_eq!(fix.fixes_findings, vec![hash.clone()]);
        assert_eq!(fix.module, "api-service");
        assert_eq!(fix.verification.commands, vec!["mvn -q test"]);
        assert_eq!(log.get(&hash).unwrap().fix_task.as_deref(), Some("TASK-002-FIX"));

        // A second pass leaves the pending fix task alone.
        let again = apply(&store, "p", &log, &policy, true).unwrap();
        assert!(again.fix_tasks.is_empty());
        assert_eq!(again.in_progress, vec![hash]);
        assert!(again.needs_fixes());
    }

    #[test]
    fn apply_without_spawning_defers() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path());
        store
            .create(
                PlanConfig::new("p", vec!["java".to_string()]),
                Request::description("p", "x"),
            )
            .unwrap();
        let log = FindingLog::new(dir.path(), "p", FindingScope::Plan);
        log.add(Finding::new(FindingType::Bug, "NPE", Severity::Error))
            .unwrap();
        let report = apply(&store, "p", &log, &DefaultTriagePolicy::default(), false).unwrap();
        assert_eq!(report.deferred.len(), 1);
        assert!(Task::list(dir.path(), "p").unwrap().is_empty());
    }
}
