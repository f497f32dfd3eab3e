//! Deliverable to task planning.
//!
//! Strict mode creates one task per (deliverable, profile). Aggregate mode is
//! the legacy alternative: deliverables that share domain, module and profile
//! and are not dependency-related merge into one task. Both modes produce
//! deterministic ids, so re-planning an unchanged outline yields the same
//! task set and the same edges.

use crate::config::TaskCreationMode;
use crate::error::{PmwError, Result};
use crate::graph::DependencyGraph;
use crate::outline::{Deliverable, SolutionOutline};
use crate::plan::PlanStore;
use crate::skills::{ModuleIndex, RelevancePredicate, SkillContext, SkillResolution};
use crate::task::{self, ExecutionGroup, Task, TaskVerification};
use crate::types::{Profile, TaskOrigin};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct SkillLogEntry {
    pub task_id: String,
    pub deliverable: u32,
    pub resolution: SkillResolution,
}

/// An edge added only because two same-layer tasks touch the same file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerializedEdge {
    pub task: String,
    pub after: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPlan {
    pub tasks: Vec<Task>,
    pub groups: Vec<ExecutionGroup>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub serialized: Vec<SerializedEdge>,
    pub skill_log: Vec<SkillLogEntry>,
}

impl TaskPlan {
    /// Write the tasks, replacing earlier plan-origin tasks. Refuses once any
    /// task has started so execution history is never overwritten.
    pub fn persist(&self, store: &PlanStore, plan_id: &str) -> Result<()> {
        let root = store.root();
        let _lock = store.lock(plan_id)?;
        let existing = Task::list(root, plan_id)?;
        if let Some(started) = existing.iter().find(|t| t.is_started()) {
            return Err(PmwError::InvalidTransition {
                from: "execute".to_string(),
                to: "plan".to_string(),
                reason: format!("task {} has already started", started.id),
            });
        }
        for t in existing.iter().filter(|t| t.origin == TaskOrigin::Plan) {
            Task::remove(root, plan_id, &t.id)?;
        }
        for t in &self.tasks {
            t.save(root, plan_id)?;
        }
        tracing::info!(plan = plan_id, tasks = self.tasks.len(), "task plan persisted");
        Ok(())
    }
}

pub struct Planner<'a> {
    index: &'a ModuleIndex,
    predicate: &'a dyn RelevancePredicate,
    mode: TaskCreationMode,
}

/// Deliverables (in outline order) that become one task.
#[derive(Clone)]
struct Unit<'d> {
    profile: Profile,
    deliverables: Vec<&'d Deliverable>,
}

impl<'a> Planner<'a> {
    pub fn new(
        index: &'a ModuleIndex,
        predicate: &'a dyn RelevancePredicate,
        mode: TaskCreationMode,
    ) -> Self {
        Self {
            index,
            predicate,
            mode,
        }
    }

    pub fn plan(&self, outline: &SolutionOutline, domains: &[String]) -> Result<TaskPlan> {
        outline.validate(domains, None)?;

        let units = match self.mode {
            TaskCreationMode::Strict => strict_units(outline),
            TaskCreationMode::Aggregate => aggregate_units(outline),
        };

        let mut tasks = Vec::with_capacity(units.len());
        let mut skill_log = Vec::new();
        for (i, unit) in units.iter().enumerate() {
            let id = task::task_id(i as u32 + 1, unit.profile.task_suffix());
            let (task, log) = self.build_task(id, unit)?;
            tasks.push(task);
            skill_log.extend(log);
        }

        link_dependencies(&mut tasks, outline);
        task::validate_set(&tasks)?;
        let serialized = serialize_shared_files(&mut tasks)?;
        check_coverage(outline, &tasks)?;
        for t in &tasks {
            t.validate(Some(outline))?;
        }

        let groups = task::execution_groups(&tasks)?;
        tracing::info!(
            tasks = tasks.len(),
            groups = groups.len(),
            mode = ?self.mode,
            "planned tasks"
        );
        Ok(TaskPlan {
            tasks,
            groups,
            serialized,
            skill_log,
        })
    }

    fn build_task(&self, id: String, unit: &Unit<'_>) -> Result<(Task, Vec<SkillLogEntry>)> {
        let first = unit.deliverables[0];
        let title = unit
            .deliverables
            .iter()
            .map(|d| d.title.as_str())
            .collect::<Vec<_>>()
            .join(" + ");
        let title = match unit.profile {
            Profile::Implementation => title,
            Profile::ModuleTesting => format!("Test: {title}"),
            Profile::IntegrationTesting => format!("Integration test: {title}"),
        };

        let mut t = Task::new(&id, title, &first.domain, &first.module, unit.profile);
        t.deliverables = unit.deliverables.iter().map(|d| d.number).collect();

        let mut steps: Vec<&str> = Vec::new();
        let mut commands: Vec<String> = Vec::new();
        let mut criteria: Vec<&str> = Vec::new();
        let mut log = Vec::new();

        for d in &unit.deliverables {
            for f in &d.affected_files {
                if !steps.contains(&f.as_str()) {
                    steps.push(f);
                }
            }

            let ctx = SkillContext {
                title: d.title.clone(),
                change_type: Some(d.change_type),
                affected_files: d.affected_files.clone(),
            };
            let resolution =
                self.index
                    .resolve_skills(&d.module, unit.profile, &ctx, self.predicate)?;
            for s in &resolution.skills {
                if !t.skills.contains(s) {
                    t.skills.push(s.clone());
                }
            }
            log.push(SkillLogEntry {
                task_id: id.clone(),
                deliverable: d.number,
                resolution,
            });

            let command = match &d.verification.command {
                Some(c) => Some(c.clone()),
                None => self
                    .index
                    .verification_command(&d.module, unit.profile.command_kind())
                    .ok(),
            };
            if let Some(c) = command {
                if !commands.contains(&c) {
                    commands.push(c);
                }
            }
            if let Some(c) = &d.verification.criteria {
                criteria.push(c);
            }
        }

        t = t.with_steps(steps);
        t.verification = TaskVerification {
            commands,
            criteria: (!criteria.is_empty()).then(|| criteria.join("; ")),
        };
        Ok((t, log))
    }
}

fn strict_units(outline: &SolutionOutline) -> Vec<Unit<'_>> {
    let mut units = Vec::new();
    for d in &outline.deliverables {
        for p in &d.profiles {
            units.push(Unit {
                profile: *p,
                deliverables: vec![d],
            });
        }
    }
    units
}

fn aggregate_units(outline: &SolutionOutline) -> Vec<Unit<'_>> {
    let related = |a: u32, b: u32| reaches(outline, a, b) || reaches(outline, b, a);

    let mut units: Vec<Unit<'_>> = Vec::new();
    for d in &outline.deliverables {
        for p in &d.profiles {
            let slot = (0..units.len()).find(|&i| {
                let u = &units[i];
                let head = u.deliverables[0];
                u.profile == *p
                    && head.domain == d.domain
                    && head.module == d.module
                    && u.deliverables.iter().all(|o| !related(o.number, d.number))
                    && merge_is_acyclic(&units, i, d)
            });
            match slot {
                Some(i) => units[i].deliverables.push(d),
                None => units.push(Unit {
                    profile: *p,
                    deliverables: vec![d],
                }),
            }
        }
    }

    // A fresh unit can still close a cycle through earlier merges.
    if unit_graph(&units).find_cycle().is_some() {
        tracing::warn!("aggregated tasks would depend on each other; planning one task per deliverable");
        return strict_units(outline);
    }
    units
}

fn merge_is_acyclic(units: &[Unit<'_>], target: usize, d: &Deliverable) -> bool {
    let mut trial = units.to_vec();
    trial[target].deliverables.push(d);
    unit_graph(&trial).find_cycle().is_none()
}

/// The task edges `link_dependencies` would derive, keyed by unit index.
fn unit_graph(units: &[Unit<'_>]) -> DependencyGraph {
    let holding = |n: u32| -> Vec<usize> {
        units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.deliverables.iter().any(|o| o.number == n))
            .map(|(j, _)| j)
            .collect()
    };

    let mut g = DependencyGraph::new();
    for i in 0..units.len() {
        g.add_node(&i.to_string());
    }
    for (i, u) in units.iter().enumerate() {
        for d in &u.deliverables {
            for up in &d.depends {
                for j in holding(*up) {
                    if j != i {
                        g.add_edge(&i.to_string(), &j.to_string());
                    }
                }
            }
            if u.profile.is_testing() {
                for j in holding(d.number) {
                    if j != i && units[j].profile == Profile::Implementation {
                        g.add_edge(&i.to_string(), &j.to_string());
                    }
                }
            }
        }
    }
    g
}

/// Whether deliverable `from` depends on `to`, directly or transitively.
fn reaches(outline: &SolutionOutline, from: u32, to: u32) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        if let Some(d) = outline.deliverable(n) {
            for dep in &d.depends {
                if *dep == to {
                    return true;
                }
                stack.push(*dep);
            }
        }
    }
    false
}

/// Upstream deliverable edges plus testing -> implementation sibling edges.
fn link_dependencies(tasks: &mut [Task], outline: &SolutionOutline) {
    let mut by_deliverable: BTreeMap<u32, Vec<(String, Profile)>> = BTreeMap::new();
    for t in tasks.iter() {
        for n in &t.deliverables {
            by_deliverable
                .entry(*n)
                .or_default()
                .push((t.id.clone(), t.profile));
        }
    }

    for t in tasks.iter_mut() {
        let mut deps: Vec<String> = Vec::new();
        for n in &t.deliverables {
            let upstream = outline.deliverable(*n).map(|d| d.depends.as_slice()).unwrap_or(&[]);
            for up in upstream {
                for (id, _) in by_deliverable.get(up).into_iter().flatten() {
                    if *id != t.id && !deps.contains(id) {
                        deps.push(id.clone());
                    }
                }
            }
            if t.profile.is_testing() {
                for (id, profile) in by_deliverable.get(n).into_iter().flatten() {
                    if *profile == Profile::Implementation && *id != t.id && !deps.contains(id) {
                        deps.push(id.clone());
                    }
                }
            }
        }
        t.depends_on = deps;
    }
}

/// Same-layer tasks with overlapping steps get an edge from the later task
/// to the earlier one; repeated until no layer holds an overlap.
fn serialize_shared_files(tasks: &mut [Task]) -> Result<Vec<SerializedEdge>> {
    let mut added = Vec::new();
    loop {
        let layers = task::task_graph(tasks).layers("tasks")?;
        let mut changed = false;
        for layer in &layers {
            for (i, earlier) in layer.iter().enumerate() {
                for later in &layer[i + 1..] {
                    let shared = shared_steps(tasks, earlier, later);
                    if shared.is_empty() {
                        continue;
                    }
                    if let Some(t) = tasks.iter_mut().find(|t| &t.id == later) {
                        t.depends_on.push(earlier.clone());
                    }
                    tracing::info!(task = %later, after = %earlier, files = ?shared, "serialized tasks sharing files");
                    added.push(SerializedEdge {
                        task: later.clone(),
                        after: earlier.clone(),
                        files: shared,
                    });
                    changed = true;
                }
            }
            if changed {
                break;
            }
        }
        if !changed {
            return Ok(added);
        }
    }
}

fn shared_steps(tasks: &[Task], a: &str, b: &str) -> Vec<String> {
    let (Some(a), Some(b)) = (
        tasks.iter().find(|t| t.id == a),
        tasks.iter().find(|t| t.id == b),
    ) else {
        return Vec::new();
    };
    a.steps
        .iter()
        .filter(|s| b.steps.iter().any(|o| o.path == s.path))
        .map(|s| s.path.clone())
        .collect()
}

fn check_coverage(outline: &SolutionOutline, tasks: &[Task]) -> Result<()> {
    let covered: HashSet<u32> = tasks.iter().flat_map(|t| t.deliverables.iter().copied()).collect();
    let uncovered = outline
        .deliverables
        .iter()
        .filter(|d| !covered.contains(&d.number))
        .count();
    if uncovered > 0 {
        return Err(PmwError::CountMismatch {
            what: "deliverables covered by tasks".to_string(),
            expected: outline.deliverables.len(),
            actual: outline.deliverables.len() - uncovered,
        });
    }
    if let Some(orphan) = tasks.iter().find(|t| t.deliverables.is_empty()) {
        return Err(PmwError::CountMismatch {
            what: format!("deliverables of {}", orphan.id),
            expected: 1,
            actual: 0,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::TagRelevance;
    use crate::testutil::{module_index, HEALTH_OUTLINE};

    fn domains() -> Vec<String> {
        vec!["java".to_string()]
    }

    fn plan(md: &str, mode: TaskCreationMode) -> Result<TaskPlan> {
        let index = module_index();
        let predicate = TagRelevance::default();
        let outline = SolutionOutline::parse(md)?;
        Planner::new(&index, &predicate, mode).plan(&outline, &domains())
    }

    fn ids(plan: &TaskPlan) -> Vec<&str> {
        plan.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn one_task_per_deliverable_profile() {
        let p = plan(HEALTH_OUTLINE, TaskCreationMode::Strict).unwrap();
        assert_eq!(ids(&p), vec!["TASK-001-IMPL", "TASK-002-TEST", "TASK-003-IMPL"]);

        let test = &p.tasks[1];
        assert_eq!(test.depends_on, vec!["TASK-001-IMPL"]);
        assert_eq!(test.skills, vec!["java:junit"]);

        let docs = &p.tasks[2];
        assert_eq!(docs.depends_on, vec!["TASK-001-IMPL", "TASK-002-TEST"]);
        assert_eq!(docs.steps[0].path, "docs/health.md");
    }

    #[test]
    fn skills_and_verification_are_resolved() {
        let p = plan(HEALTH_OUTLINE, TaskCreationMode::Strict).unwrap();
        let impl_task = &p.tasks[0];
        assert_eq!(
            impl_task.skills,
            vec!["java:core-standards", "java:rest-endpoints"]
        );
        assert_eq!(impl_task.verification.commands, vec!["mvn -q test"]);
        // no deliverable command: falls back to the module's compile command
        assert_eq!(p.tasks[2].verification.commands, vec!["true"]);
        assert!(!p.skill_log.is_empty());
    }

    #[test]
    fn groups_follow_dependencies() {
        let p = plan(HEALTH_OUTLINE, TaskCreationMode::Strict).unwrap();
        let layers: Vec<Vec<String>> = p.groups.iter().map(|g| g.tasks.clone()).collect();
        assert_eq!(
            layers,
            vec![
                vec!["TASK-001-IMPL".to_string()],
                vec!["TASK-002-TEST".to_string()],
                vec!["TASK-003-IMPL".to_string()],
            ]
        );
    }

    #[test]
    fn replanning_is_idempotent() {
        let a = plan(HEALTH_OUTLINE, TaskCreationMode::Strict).unwrap();
        let b = plan(HEALTH_OUTLINE, TaskCreationMode::Strict).unwrap();
        let edges = |p: &TaskPlan| {
            p.tasks
                .iter()
                .map(|t| (t.id.clone(), t.depends_on.clone(), t.steps.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(edges(&a), edges(&b));
    }

    #[test]
    fn cyclic_outline_is_rejected_before_tasks() {
        let md = HEALTH_OUTLINE.replace("- depends: none", "- depends: 2");
        assert!(matches!(
            plan(&md, TaskCreationMode::Strict),
            Err(PmwError::Cycle { .. })
        ));
    }

    #[test]
    fn unknown_module_is_rejected() {
        let md = HEALTH_OUTLINE.replace("module: api-service\n- depends: 1", "module: billing\n- depends: 1");
        assert!(matches!(
            plan(&md, TaskCreationMode::Strict),
            Err(PmwError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn undefined_profile_is_rejected() {
        let md = HEALTH_OUTLINE.replacen("- module_testing", "- integration_testing", 1);
        assert!(matches!(
            plan(&md, TaskCreationMode::Strict),
            Err(PmwError::ProfileNotDefined { .. })
        ));
    }

    const INDEPENDENT: &str = r#"# Solution Outline: Two endpoints

## Deliverables

### 1. Add status endpoint

**Metadata:**
- change_type: feature
- domain: java
- module: api-service
- depends: none

**Profiles:**
- implementation

**Affected files:**
- `src/Status.java`
- `src/Routes.java`

### 2. Add version endpoint

**Metadata:**
- change_type: feature
- domain: java
- module: api-service
- depends: none

**Profiles:**
- implementation

**Affected files:**
- `src/Version.java`
- `src/Routes.java`
"#;

    #[test]
    fn shared_files_in_one_layer_are_serialized() {
        let p = plan(INDEPENDENT, TaskCreationMode::Strict).unwrap();
        assert_eq!(p.tasks[1].depends_on, vec!["TASK-001-IMPL"]);
        assert_eq!(p.serialized.len(), 1);
        assert_eq!(p.serialized[0].files, vec!["src/Routes.java"]);
        assert_eq!(p.groups.len(), 2);
    }

    #[test]
    fn aggregate_mode_merges_independent_deliverables() {
        let p = plan(INDEPENDENT, TaskCreationMode::Aggregate).unwrap();
        assert_eq!(p.tasks.len(), 1);
        let t = &p.tasks[0];
        assert_eq!(t.deliverables, vec![1, 2]);
        assert_eq!(t.steps.len(), 3);
    }

    #[test]
    fn aggregate_mode_keeps_dependent_deliverables_apart() {
        let p = plan(HEALTH_OUTLINE, TaskCreationMode::Aggregate).unwrap();
        assert_eq!(p.tasks.len(), 3);
    }

    #[test]
    fn persist_replaces_pending_plan_tasks_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PlanStore::new(dir.path());
        store
            .create(
                crate::plan::PlanConfig::new("p", domains()),
                crate::request::Request::description("p", "x"),
            )
            .unwrap();
        let p = plan(HEALTH_OUTLINE, TaskCreationMode::Strict).unwrap();
        p.persist(&store, "p").unwrap();
        p.persist(&store, "p").unwrap();
        assert_eq!(Task::list(dir.path(), "p").unwrap().len(), 3);

        let mut t = Task::load(dir.path(), "p", "TASK-001-IMPL").unwrap();
        t.start();
        t.save(dir.path(), "p").unwrap();
        assert!(matches!(
            p.persist(&store, "p"),
            Err(PmwError::InvalidTransition { .. })
        ));
    }

    const TWO_MODULES: &str = r#"
modules:
  mod-a:
    domain: java
    path: a
    profiles:
      implementation:
        defaults: ["java:core-standards"]
      module_testing:
        defaults: ["java:junit"]
  mod-b:
    domain: java
    path: b
    profiles:
      implementation:
        defaults: ["java:core-standards"]
      module_testing:
        defaults: ["java:junit"]
"#;

    fn two_module_index() -> ModuleIndex {
        serde_yaml::from_str(TWO_MODULES).unwrap()
    }

    fn deliverable(number: u32, module: &str, depends: Vec<u32>, profiles: Vec<Profile>, file: &str) -> Deliverable {
        Deliverable {
            number,
            title: format!("Deliverable {number}"),
            change_type: crate::types::ChangeType::Feature,
            execution_mode: crate::types::ExecutionMode::Automated,
            domain: "java".to_string(),
            module: module.to_string(),
            profiles,
            depends,
            affected_files: vec![file.to_string()],
            changes: Vec::new(),
            verification: Default::default(),
            success_criteria: Vec::new(),
        }
    }

    fn outline_of(deliverables: Vec<Deliverable>) -> SolutionOutline {
        SolutionOutline {
            title: "Generated".to_string(),
            summary: String::new(),
            deliverables,
        }
    }

    fn plan_outline(outline: &SolutionOutline, mode: TaskCreationMode) -> Result<TaskPlan> {
        let index = two_module_index();
        let predicate = TagRelevance::default();
        Planner::new(&index, &predicate, mode).plan(outline, &domains())
    }

    #[test]
    fn aggregate_mode_never_merges_into_a_task_cycle() {
        // 1 and 3 share mod-a, 2 and 4 share mod-b; merging both pairs
        // would make the two tasks depend on each other.
        let imp = || vec![Profile::Implementation];
        let outline = outline_of(vec![
            deliverable(1, "mod-a", vec![], imp(), "a/One.java"),
            deliverable(2, "mod-b", vec![1], imp(), "b/Two.java"),
            deliverable(3, "mod-a", vec![4], imp(), "a/Three.java"),
            deliverable(4, "mod-b", vec![], imp(), "b/Four.java"),
        ]);
        assert!(plan_outline(&outline, TaskCreationMode::Strict).is_ok());

        let p = plan_outline(&outline, TaskCreationMode::Aggregate).unwrap();
        assert_eq!(p.tasks.len(), 3);
        assert_eq!(p.tasks[0].deliverables, vec![1, 3]);
        assert_eq!(p.tasks[1].deliverables, vec![2]);
        assert_eq!(p.tasks[2].deliverables, vec![4]);
        assert!(task::validate_set(&p.tasks).is_ok());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const MODULES: [&str; 2] = ["mod-a", "mod-b"];
        const FILES: [&str; 3] = ["src/Api.java", "src/Model.java", "src/Routes.java"];

        /// Per position in a hidden topological order: edges to earlier
        /// positions, module, whether it is tested, file. Positions are then
        /// relabelled by a random permutation so dependencies also point
        /// forward in outline order.
        #[derive(Debug, Clone)]
        struct Shape {
            edges: Vec<Vec<bool>>,
            modules: Vec<usize>,
            tested: Vec<bool>,
            files: Vec<usize>,
            labels: Vec<u32>,
        }

        fn arb_shape() -> impl Strategy<Value = Shape> {
            (1usize..8).prop_flat_map(|n| {
                (
                    prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
                    prop::collection::vec(0usize..MODULES.len(), n),
                    prop::collection::vec(any::<bool>(), n),
                    prop::collection::vec(0usize..FILES.len(), n),
                    Just((1..=n as u32).collect::<Vec<_>>()).prop_shuffle(),
                )
                    .prop_map(|(edges, modules, tested, files, labels)| Shape {
                        edges,
                        modules,
                        tested,
                        files,
                        labels,
                    })
            })
        }

        fn build(shape: &Shape) -> SolutionOutline {
            let mut ds: Vec<Deliverable> = (0..shape.labels.len())
                .map(|k| {
                    let depends = (0..k)
                        .filter(|&j| shape.edges[k][j])
                        .map(|j| shape.labels[j])
                        .collect();
                    let mut profiles = vec![Profile::Implementation];
                    if shape.tested[k] {
                        profiles.push(Profile::ModuleTesting);
                    }
                    deliverable(
                        shape.labels[k],
                        MODULES[shape.modules[k]],
                        depends,
                        profiles,
                        FILES[shape.files[k]],
                    )
                })
                .collect();
            ds.sort_by_key(|d| d.number);
            outline_of(ds)
        }

        fn edges(p: &TaskPlan) -> Vec<(String, Vec<String>, Vec<u32>)> {
            p.tasks
                .iter()
                .map(|t| (t.id.clone(), t.depends_on.clone(), t.deliverables.clone()))
                .collect()
        }

        proptest! {
            #[test]
            fn acyclic_outlines_plan_in_both_modes(shape in arb_shape()) {
                let outline = build(&shape);
                for mode in [TaskCreationMode::Strict, TaskCreationMode::Aggregate] {
                    let first = match plan_outline(&outline, mode) {
                        Ok(p) => p,
                        Err(e) => return Err(TestCaseError::fail(format!("{mode:?} planning failed: {e}"))),
                    };
                    let second = plan_outline(&outline, mode).unwrap();
                    prop_assert_eq!(edges(&first), edges(&second));

                    prop_assert!(task::validate_set(&first.tasks).is_ok());
                    for d in &outline.deliverables {
                        prop_assert!(
                            first.tasks.iter().any(|t| t.deliverables.contains(&d.number)),
                            "deliverable {} has no task", d.number
                        );
                    }
                }
            }

            #[test]
            fn cyclic_outlines_are_rejected(shape in arb_shape().prop_filter("needs two deliverables", |s| s.labels.len() > 1)) {
                let mut outline = build(&shape);
                let first = shape.labels[0];
                let last = shape.labels[shape.labels.len() - 1];
                for d in outline.deliverables.iter_mut() {
                    if d.number == first && !d.depends.contains(&last) {
                        d.depends.push(last);
                    }
                    if d.number == last && !d.depends.contains(&first) {
                        d.depends.push(first);
                    }
                }
                for mode in [TaskCreationMode::Strict, TaskCreationMode::Aggregate] {
                    let result = plan_outline(&outline, mode);
                    prop_assert!(matches!(result, Err(PmwError::Cycle { .. })), "{:?}: {:?}", mode, result.map(|p| p.tasks.len()));
                }
            }
        }
    }
}
