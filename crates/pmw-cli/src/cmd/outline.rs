use crate::cmd::{load_config, store};
use crate::output::{join_or_dash, print_success, print_table};
use anyhow::Context;
use clap::Subcommand;
use pmw_core::outline::SolutionOutline;
use pmw_core::skills::ModuleIndex;
use pmw_core::PmwError;
use std::path::Path;

#[derive(Subcommand)]
pub enum OutlineSubcommand {
    /// List the deliverables of a plan's solution outline
    Show { plan_id: String },

    /// Validate the outline against the plan domains and the module index
    Validate {
        plan_id: String,
        /// Required number of deliverables
        #[arg(long)]
        expected: Option<usize>,
    },
}

pub fn run(root: &Path, subcmd: OutlineSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        OutlineSubcommand::Show { plan_id } => show(root, &plan_id, json),
        OutlineSubcommand::Validate { plan_id, expected } => validate(root, &plan_id, expected, json),
    }
}

fn show(root: &Path, plan_id: &str, json: bool) -> anyhow::Result<()> {
    store(root)?.read(plan_id)?;
    let outline = SolutionOutline::load(root, plan_id)
        .with_context(|| format!("failed to parse outline of '{plan_id}'"))?;

    if json {
        return print_success(&outline);
    }
    println!("{}", outline.title);
    if !outline.summary.is_empty() {
        println!("\n{}\n", outline.summary);
    }
    let rows = outline
        .deliverables
        .iter()
        .map(|d| {
            vec![
                d.number.to_string(),
                d.title.clone(),
                d.domain.clone(),
                d.module.clone(),
                d.profiles
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                join_or_dash(&d.depends.iter().map(u32::to_string).collect::<Vec<_>>()),
                d.affected_files.len().to_string(),
            ]
        })
        .collect();
    print_table(
        &["#", "TITLE", "DOMAIN", "MODULE", "PROFILES", "DEPENDS", "FILES"],
        rows,
    );
    Ok(())
}

fn validate(root: &Path, plan_id: &str, expected: Option<usize>, json: bool) -> anyhow::Result<()> {
    let plan = store(root)?.read(plan_id)?;
    let config = load_config(root)?;
    config.check_domains(&plan.config.domains)?;
    let outline = SolutionOutline::load(root, plan_id)?;
    outline.validate(&plan.config.domains, expected)?;

    let modules = ModuleIndex::load(root)?;
    for d in &outline.deliverables {
        let module = modules.module(&d.module)?;
        if module.domain != d.domain {
            return Err(PmwError::ScopeMismatch(format!(
                "deliverable {} declares domain '{}' but module '{}' belongs to '{}'",
                d.number, d.domain, d.module, module.domain
            ))
            .into());
        }
        for profile in &d.profiles {
            if !module.profiles.contains_key(profile) {
                return Err(PmwError::ProfileNotDefined {
                    module: d.module.clone(),
                    profile: profile.to_string(),
                }
                .into());
            }
        }
    }

    if json {
        return print_success(&serde_json::json!({
            "plan_id": plan_id,
            "deliverables": outline.deliverables.len(),
            "valid": true,
        }));
    }
    println!(
        "Outline of '{plan_id}' is valid ({} deliverables)",
        outline.deliverables.len()
    );
    Ok(())
}
