use crate::cmd::{controller, parse_opt, store};
use crate::output::{join_or_dash, print_success, print_table};
use anyhow::Context;
use clap::Subcommand;
use pmw_core::plan::{ConflictResolution, PlanConfig, PlanUpdate};
use pmw_core::references::References;
use pmw_core::request::Request;
use pmw_core::task::{self, Task};
use pmw_core::types::Compatibility;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum PlanSubcommand {
    /// Create a plan, or reference an existing one with --on-conflict
    Create {
        plan_id: String,
        /// Free-text request
        #[arg(long, group = "source")]
        description: Option<String>,
        /// Lesson id to apply
        #[arg(long, group = "source")]
        lesson: Option<String>,
        /// Issue URL to resolve
        #[arg(long, group = "source")]
        issue: Option<String>,
        #[arg(long)]
        title: Option<String>,
        /// Plan domains in resolution order (repeatable or comma-separated)
        #[arg(long = "domain", value_delimiter = ',')]
        domains: Vec<String>,
        /// breaking, deprecation or smart_and_ask
        #[arg(long)]
        compatibility: Option<String>,
        /// resume, replace or rename
        #[arg(long)]
        on_conflict: Option<String>,
        /// New plan id when --on-conflict rename
        #[arg(long)]
        rename_to: Option<String>,
    },

    /// List plans
    List {
        /// List archived plan directories instead
        #[arg(long)]
        archived: bool,
    },

    /// Show plan config, status, request and references
    Show { plan_id: String },

    /// Update plan settings (never the phase)
    Update {
        plan_id: String,
        #[arg(long = "domain", value_delimiter = ',')]
        domains: Option<Vec<String>>,
        #[arg(long)]
        compatibility: Option<String>,
        #[arg(long)]
        commit_strategy: Option<String>,
        #[arg(long)]
        commit_prefix: Option<String>,
        #[arg(long)]
        branch_create: Option<bool>,
        #[arg(long)]
        branch_base: Option<String>,
        #[arg(long)]
        pr_create: Option<bool>,
        #[arg(long)]
        pr_draft: Option<bool>,
    },

    /// Append a clarification to the request (refine phase only)
    Clarify {
        plan_id: String,
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Delete a plan directory
    Delete { plan_id: String },

    /// End a plan early; artifacts stay on disk
    Abort {
        plan_id: String,
        #[arg(long, default_value = "aborted by user")]
        reason: String,
    },

    /// Move a plan to archived-plans/
    Archive { plan_id: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: PlanSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PlanSubcommand::Create {
            plan_id,
            description,
            lesson,
            issue,
            title,
            domains,
            compatibility,
            on_conflict,
            rename_to,
        } => {
            let mut request = Request::from_sources(&plan_id, description, lesson, issue)?;
            request.title = title;
            let mut config = PlanConfig::new(&plan_id, domains);
            if let Some(c) = parse_opt::<Compatibility>(compatibility.as_deref())? {
                config.compatibility = c;
            }
            let resolution = conflict_resolution(on_conflict.as_deref(), rename_to)?;
            create(root, config, request, resolution, json)
        }
        PlanSubcommand::List { archived } => list(root, archived, json),
        PlanSubcommand::Show { plan_id } => show(root, &plan_id, json),
        PlanSubcommand::Update {
            plan_id,
            domains,
            compatibility,
            commit_strategy,
            commit_prefix,
            branch_create,
            branch_base,
            pr_create,
            pr_draft,
        } => {
            let update = PlanUpdate {
                domains,
                compatibility: parse_opt(compatibility.as_deref())?,
                commit_strategy,
                commit_prefix,
                branch_create,
                branch_base,
                pr_create,
                pr_draft,
            };
            update_plan(root, &plan_id, update, json)
        }
        PlanSubcommand::Clarify { plan_id, text } => clarify(root, &plan_id, &text.join(" "), json),
        PlanSubcommand::Delete { plan_id } => delete(root, &plan_id, json),
        PlanSubcommand::Abort { plan_id, reason } => abort(root, &plan_id, &reason, json),
        PlanSubcommand::Archive { plan_id } => archive(root, &plan_id, json),
    }
}

fn conflict_resolution(
    on_conflict: Option<&str>,
    rename_to: Option<String>,
) -> anyhow::Result<Option<ConflictResolution>> {
    let resolution = match (on_conflict, rename_to) {
        (None, None) => None,
        (Some("resume"), None) => Some(ConflictResolution::Resume),
        (Some("replace"), None) => Some(ConflictResolution::Replace),
        (Some("rename") | None, Some(new_id)) => Some(ConflictResolution::Rename(new_id)),
        (Some("rename"), None) => anyhow::bail!("--on-conflict rename requires --rename-to"),
        (Some(_), Some(_)) => anyhow::bail!("--rename-to only applies to --on-conflict rename"),
        (Some(other), None) => {
            return Err(pmw_core::PmwError::InvalidValue {
                field: "on-conflict".to_string(),
                value: other.to_string(),
            }
            .into())
        }
    };
    Ok(resolution)
}

// ---------------------------------------------------------------------------
// create / list / show
// ---------------------------------------------------------------------------

fn create(
    root: &Path,
    config: PlanConfig,
    request: Request,
    resolution: Option<ConflictResolution>,
    json: bool,
) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let outcome = ctl.init(config, request, resolution)?;

    if json {
        return print_success(&outcome);
    }
    println!(
        "Plan '{}' {} (phase: {}, domains: {})",
        outcome.plan.id(),
        format!("{:?}", outcome.action).to_lowercase(),
        outcome.plan.phase(),
        join_or_dash(&outcome.plan.config.domains)
    );
    Ok(())
}

fn list(root: &Path, archived: bool, json: bool) -> anyhow::Result<()> {
    let store = store(root)?;
    if archived {
        let names = store.list_archived()?;
        if json {
            return print_success(&names);
        }
        if names.is_empty() {
            println!("No archived plans.");
        }
        for n in names {
            println!("{n}");
        }
        return Ok(());
    }

    let plans = store.list().context("failed to list plans")?;
    if json {
        return print_success(&plans);
    }
    if plans.is_empty() {
        println!("No plans. Create one with: pmw plan create <id> --description ...");
        return Ok(());
    }
    let rows = plans
        .iter()
        .map(|p| {
            vec![
                p.id().to_string(),
                p.phase().to_string(),
                join_or_dash(&p.config.domains),
                p.status.verify_iteration.to_string(),
                p.config.created_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(&["PLAN", "PHASE", "DOMAINS", "VERIFY", "CREATED"], rows);
    Ok(())
}

fn show(root: &Path, plan_id: &str, json: bool) -> anyhow::Result<()> {
    let store = store(root)?;
    let plan = store
        .read(plan_id)
        .with_context(|| format!("failed to read plan '{plan_id}'"))?;
    let request = Request::load(root, plan_id).ok();
    let references = References::load(root, plan_id)?;
    let tasks = Task::list(root, plan_id)?;

    if json {
        return print_success(&serde_json::json!({
            "plan": plan,
            "request": request,
            "references": references,
            "tasks": task::summarize(&tasks),
        }));
    }

    println!("Plan:          {}", plan.id());
    println!("Phase:         {}", plan.phase());
    println!("Domains:       {}", join_or_dash(&plan.config.domains));
    println!("Compatibility: {}", plan.config.compatibility);
    println!(
        "Iterations:    verify {}, finalize {}",
        plan.status.verify_iteration, plan.status.finalize_iteration
    );
    if let Some(note) = &plan.status.outcome {
        println!("Outcome:       [{}] {}", note.category, note.message);
    }
    if let Some(req) = &request {
        if let Some(t) = &req.title {
            println!("Title:         {t}");
        }
        println!("\nRequest:\n  {}", req.full_text().replace('\n', "\n  "));
    }
    println!("\nTasks: {}", task::summarize(&tasks));
    if !references.modified_files.is_empty() {
        println!("Modified files:");
        for f in &references.modified_files {
            println!("  {f}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// update / clarify / delete / abort / archive
// ---------------------------------------------------------------------------

fn update_plan(root: &Path, plan_id: &str, update: PlanUpdate, json: bool) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    if let Some(domains) = &update.domains {
        ctl.config().check_domains(domains)?;
    }
    let plan = ctl
        .store()
        .update(plan_id, update)
        .with_context(|| format!("failed to update plan '{plan_id}'"))?;
    if json {
        return print_success(&plan.config);
    }
    println!("Updated plan '{plan_id}'");
    Ok(())
}

fn clarify(root: &Path, plan_id: &str, text: &str, json: bool) -> anyhow::Result<()> {
    let request = store(root)?.clarify(plan_id, text)?;
    if json {
        return print_success(&request);
    }
    println!(
        "Added clarification {} to '{plan_id}'",
        request.clarifications.len()
    );
    Ok(())
}

fn delete(root: &Path, plan_id: &str, json: bool) -> anyhow::Result<()> {
    store(root)?.delete(plan_id)?;
    if json {
        return print_success(&serde_json::json!({ "plan_id": plan_id, "deleted": true }));
    }
    println!("Deleted plan '{plan_id}'");
    Ok(())
}

fn abort(root: &Path, plan_id: &str, reason: &str, json: bool) -> anyhow::Result<()> {
    let status = controller(root)?.abort(plan_id, reason)?;
    if json {
        return print_success(&status);
    }
    println!("Aborted plan '{plan_id}': {reason}");
    Ok(())
}

fn archive(root: &Path, plan_id: &str, json: bool) -> anyhow::Result<()> {
    let path = store(root)?.archive(plan_id)?;
    if json {
        return print_success(&serde_json::json!({
            "plan_id": plan_id,
            "path": path.display().to_string(),
        }));
    }
    println!("Archived '{plan_id}' to {}", path.display());
    Ok(())
}
