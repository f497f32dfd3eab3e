use crate::cmd::{load_config, parse, parse_opt, store};
use crate::output::{join_or_dash, print_success, print_table};
use anyhow::Context;
use clap::Subcommand;
use pmw_core::executor::{ExecutionResult, ExecutionStatus, Executor, RecordedWorker};
use pmw_core::outline::SolutionOutline;
use pmw_core::planner::Planner;
use pmw_core::references::References;
use pmw_core::skills::{ModuleIndex, SkillContext, TagRelevance};
use pmw_core::task::{self as task_ops, Task};
use pmw_core::types::{Priority, Profile, StepStatus, TaskOrigin, TaskStatus};
use pmw_core::verify::ShellRunner;
use pmw_core::PmwError;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// Turn the solution outline into tasks
    Plan {
        plan_id: String,
        /// Show the task plan without writing it
        #[arg(long)]
        dry_run: bool,
    },

    /// List tasks of a plan
    List {
        plan_id: String,
        /// Only tasks with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show full details for a single task
    Show { plan_id: String, task_id: String },

    /// Add a task by hand
    Add {
        plan_id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        module: String,
        /// implementation, module_testing or integration_testing
        #[arg(long, default_value = "implementation")]
        profile: String,
        /// plan (needs --deliverable) or fix
        #[arg(long, default_value = "plan")]
        origin: String,
        #[arg(long = "deliverable", value_delimiter = ',')]
        deliverables: Vec<u32>,
        #[arg(long = "depends", value_delimiter = ',')]
        depends_on: Vec<String>,
        /// File path to change (repeatable)
        #[arg(long = "step")]
        steps: Vec<String>,
        /// Verification command (repeatable; default: the module's command)
        #[arg(long = "verify")]
        verify: Vec<String>,
        #[arg(long)]
        priority: Option<String>,
    },

    /// Record a step as done or skipped
    Step {
        plan_id: String,
        task_id: String,
        path: String,
        #[arg(long, conflicts_with = "skip")]
        done: bool,
        #[arg(long, requires = "reason")]
        skip: bool,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Set a task's status
    Status {
        plan_id: String,
        task_id: String,
        /// pending, in_progress, done or blocked
        status: String,
        /// Required for blocked
        #[arg(long)]
        reason: Option<String>,
    },

    /// Tasks whose dependencies are all done
    Next { plan_id: String },

    /// Execute one task, or every ready task layer by layer
    Execute {
        plan_id: String,
        task_id: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TaskSubcommand::Plan { plan_id, dry_run } => plan(root, &plan_id, dry_run, json),
        TaskSubcommand::List { plan_id, status } => {
            list(root, &plan_id, parse_opt(status.as_deref())?, json)
        }
        TaskSubcommand::Show { plan_id, task_id } => show(root, &plan_id, &task_id, json),
        TaskSubcommand::Add {
            plan_id,
            title,
            module,
            profile,
            origin,
            deliverables,
            depends_on,
            steps,
            verify,
            priority,
        } => {
            let new_task = NewTask {
                title,
                module,
                profile: parse(&profile)?,
                origin: parse(&origin)?,
                deliverables,
                depends_on,
                steps,
                verify,
                priority: parse_opt(priority.as_deref())?,
            };
            add(root, &plan_id, new_task, json)
        }
        TaskSubcommand::Step {
            plan_id,
            task_id,
            path,
            done,
            skip,
            reason,
        } => {
            let status = match (done, skip) {
                (_, true) => StepStatus::Skipped,
                (true, false) => StepStatus::Done,
                (false, false) => anyhow::bail!("pass --done or --skip --reason <why>"),
            };
            step(root, &plan_id, &task_id, &path, status, reason, json)
        }
        TaskSubcommand::Status {
            plan_id,
            task_id,
            status,
            reason,
        } => set_status(root, &plan_id, &task_id, parse(&status)?, reason, json),
        TaskSubcommand::Next { plan_id } => next(root, &plan_id, json),
        TaskSubcommand::Execute { plan_id, task_id } => {
            execute(root, &plan_id, task_id.as_deref(), json)
        }
    }
}

// ---------------------------------------------------------------------------
// plan
// ---------------------------------------------------------------------------

fn plan(root: &Path, plan_id: &str, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let store = store(root)?;
    let config = load_config(root)?;
    let plan = store.read(plan_id)?;
    let outline = SolutionOutline::load(root, plan_id)
        .with_context(|| format!("failed to load outline of '{plan_id}'"))?;
    let modules = ModuleIndex::load(root)?;
    let relevance = TagRelevance::default();

    let task_plan = Planner::new(&modules, &relevance, config.planning.task_creation)
        .plan(&outline, &plan.config.domains)?;
    if !dry_run {
        task_plan.persist(&store, plan_id)?;
    }

    if json {
        return print_success(&serde_json::json!({
            "dry_run": dry_run,
            "plan": task_plan,
        }));
    }

    print_tasks(&task_plan.tasks);
    println!();
    for g in &task_plan.groups {
        println!("layer {}: {}", g.layer, g.tasks.join(", "));
    }
    for e in &task_plan.serialized {
        println!(
            "serialized: {} after {} (shared: {})",
            e.task,
            e.after,
            e.files.join(", ")
        );
    }
    if dry_run {
        println!("\n(dry run: nothing written)");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list / show / next
// ---------------------------------------------------------------------------

fn print_tasks(tasks: &[Task]) {
    let rows = tasks
        .iter()
        .map(|t| {
            let done = t.steps.iter().filter(|s| s.status != StepStatus::Pending).count();
            vec![
                t.id.clone(),
                t.status.to_string(),
                t.module.clone(),
                t.profile.to_string(),
                join_or_dash(&t.depends_on),
                format!("{done}/{}", t.steps.len()),
                t.title.clone(),
            ]
        })
        .collect();
    print_table(
        &["ID", "STATUS", "MODULE", "PROFILE", "DEPENDS", "STEPS", "TITLE"],
        rows,
    );
}

fn list(root: &Path, plan_id: &str, status: Option<TaskStatus>, json: bool) -> anyhow::Result<()> {
    let tasks: Vec<Task> = Task::list(root, plan_id)?
        .into_iter()
        .filter(|t| status.map_or(true, |s| t.status == s))
        .collect();

    if json {
        return print_success(&tasks);
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    print_tasks(&tasks);
    println!("\n{}", task_ops::summarize(&tasks));
    Ok(())
}

fn show(root: &Path, plan_id: &str, task_id: &str, json: bool) -> anyhow::Result<()> {
    let task = Task::load(root, plan_id, task_id)?;
    if json {
        return print_success(&task);
    }

    println!("{}: {}", task.id, task.title);
    println!("  status:       {}", task.status);
    println!("  origin:       {}", task.origin);
    println!("  priority:     {}", task.priority);
    println!("  domain:       {}", task.domain);
    println!("  module:       {} ({})", task.module, task.profile);
    println!(
        "  deliverables: {}",
        join_or_dash(&task.deliverables.iter().map(u32::to_string).collect::<Vec<_>>())
    );
    println!("  depends on:   {}", join_or_dash(&task.depends_on));
    println!("  skills:       {}", join_or_dash(&task.skills));
    if let Some(b) = &task.blocker {
        println!("  blocker:      {b}");
    }
    if !task.fixes_findings.is_empty() {
        println!("  fixes:        {}", task.fixes_findings.join(", "));
    }
    println!("  steps:");
    for s in &task.steps {
        match &s.reason {
            Some(r) => println!("    [{}] {} ({r})", s.status, s.path),
            None => println!("    [{}] {}", s.status, s.path),
        }
    }
    if !task.verification.commands.is_empty() {
        println!("  verification:");
        for c in &task.verification.commands {
            println!("    {c}");
        }
    }
    Ok(())
}

fn next(root: &Path, plan_id: &str, json: bool) -> anyhow::Result<()> {
    let tasks = Task::list(root, plan_id)?;
    let ready: Vec<&Task> = task_ops::next_ready(&tasks);

    if json {
        return print_success(&ready);
    }
    if ready.is_empty() {
        println!("No ready tasks ({}).", task_ops::summarize(&tasks));
        return Ok(());
    }
    for t in ready {
        println!("{}  {}", t.id, t.title);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

struct NewTask {
    title: String,
    module: String,
    profile: Profile,
    origin: TaskOrigin,
    deliverables: Vec<u32>,
    depends_on: Vec<String>,
    steps: Vec<String>,
    verify: Vec<String>,
    priority: Option<Priority>,
}

fn add(root: &Path, plan_id: &str, new_task: NewTask, json: bool) -> anyhow::Result<()> {
    let store = store(root)?;
    store.read(plan_id)?;
    let modules = ModuleIndex::load(root)?;
    let descriptor = modules.module(&new_task.module)?;

    let ctx = SkillContext {
        title: new_task.title.clone(),
        change_type: None,
        affected_files: new_task.steps.clone(),
    };
    let skills = modules
        .resolve_skills(&new_task.module, new_task.profile, &ctx, &TagRelevance::default())?
        .skills;
    let commands = if new_task.verify.is_empty() {
        match modules.verification_command(&new_task.module, new_task.profile.command_kind()) {
            Ok(c) => vec![c],
            Err(PmwError::CommandNotDefined { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        }
    } else {
        new_task.verify
    };
    let outline = if SolutionOutline::exists(root, plan_id) {
        Some(SolutionOutline::load(root, plan_id)?)
    } else {
        None
    };

    let task = {
        let _lock = store.lock(plan_id)?;
        let existing = Task::list(root, plan_id)?;
        let suffix = match new_task.origin {
            TaskOrigin::Fix => "FIX",
            TaskOrigin::Plan => new_task.profile.task_suffix(),
        };
        let mut task = Task::new(
            task_ops::task_id(task_ops::next_seq(&existing), suffix),
            new_task.title,
            descriptor.domain.clone(),
            new_task.module,
            new_task.profile,
        )
        .with_steps(new_task.steps);
        task.origin = new_task.origin;
        task.deliverables = new_task.deliverables;
        task.depends_on = new_task.depends_on;
        task.skills = skills;
        task.verification.commands = commands;
        if let Some(p) = new_task.priority {
            task.priority = p;
        }
        task_ops::add(root, plan_id, task, outline.as_ref())?
    };

    if json {
        return print_success(&task);
    }
    println!("Added task [{}]: {}", task.id, task.title);
    Ok(())
}

// ---------------------------------------------------------------------------
// step / status
// ---------------------------------------------------------------------------

fn step(
    root: &Path,
    plan_id: &str,
    task_id: &str,
    path: &str,
    status: StepStatus,
    reason: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let store = store(root)?;
    let task = {
        let _lock = store.lock(plan_id)?;
        let mut task = Task::load(root, plan_id, task_id)?;
        task.mark_step(path, status, reason)?;
        task.save(root, plan_id)?;
        if status == StepStatus::Done {
            let mut refs = References::load(root, plan_id)?;
            if refs.track_files([path]) > 0 {
                refs.save(root)?;
            }
        }
        task
    };

    if json {
        return print_success(&task);
    }
    let remaining = task.pending_steps().count();
    println!("[{task_id}] {path}: {status} ({remaining} steps pending)");
    Ok(())
}

fn set_status(
    root: &Path,
    plan_id: &str,
    task_id: &str,
    status: TaskStatus,
    reason: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let store = store(root)?;
    let task = {
        let _lock = store.lock(plan_id)?;
        let mut task = Task::load(root, plan_id, task_id)?;
        task.set_status(status, reason)?;
        task.save(root, plan_id)?;
        task
    };

    if json {
        return print_success(&task);
    }
    println!("[{task_id}] is now {}", task.status);
    Ok(())
}

// ---------------------------------------------------------------------------
// execute
// ---------------------------------------------------------------------------

fn execute(root: &Path, plan_id: &str, task_id: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = store(root)?;
    let config = load_config(root)?;
    let worker = RecordedWorker;
    let runner = ShellRunner::new(root);
    let executor = Executor::new(&store, &worker, &runner, &config);

    let results = match task_id {
        Some(id) => vec![executor.execute(plan_id, id)?],
        None => executor.execute_ready(plan_id)?,
    };

    if json {
        return print_success(&results);
    }
    if results.is_empty() {
        println!("No ready tasks.");
    }
    for r in &results {
        print_result(r);
    }
    Ok(())
}

fn print_result(r: &ExecutionResult) {
    match r.status {
        ExecutionStatus::Done => println!(
            "[{}] done after {} verification attempt(s)",
            r.task_id, r.attempts
        ),
        ExecutionStatus::Incomplete => println!(
            "[{}] waiting on steps: {}",
            r.task_id,
            r.pending_steps.join(", ")
        ),
        ExecutionStatus::Blocked => {
            println!(
                "[{}] blocked: {}",
                r.task_id,
                r.blocker.as_deref().unwrap_or("verification failed")
            );
            if let Some(f) = &r.finding {
                println!("  finding: {f}");
            }
        }
    }
    for f in &r.resolved_findings {
        println!("  resolved finding {f}");
    }
}
