use crate::cmd::load_config;
use crate::output::{join_or_dash, print_json, print_success};
use anyhow::Context;
use clap::Subcommand;
use pmw_core::config::{ConfigWarning, WarnLevel};
use pmw_core::skills::ModuleIndex;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show the effective configuration, defaults included
    Show,

    /// Validate the config and module index for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    if json {
        return print_success(&config);
    }

    let domains: Vec<String> = config.domains.iter().map(|d| d.key.clone()).collect();
    println!("Project:        {}", config.project.name);
    println!("Domains:        {}", join_or_dash(&domains));
    println!(
        "Loop caps:      verify {}, finalize {}, task verification {}",
        config.iterations.verify, config.iterations.finalize, config.iterations.task_verification
    );
    println!(
        "Execution:      max parallel {}, verification timeout {}s, lock timeout {}ms, stale lock {}s",
        config.execution.max_parallel,
        config.execution.verification_timeout_seconds,
        config.execution.lock_timeout_ms,
        config.execution.stale_lock_seconds
    );
    println!("Task creation:  {:?}", config.planning.task_creation);
    println!("Finalize steps: {}", join_or_dash(&config.finalize.steps));
    if !config.verification.commands.is_empty() {
        println!("Verification:");
        for c in &config.verification.commands {
            println!("  {}: {}", c.name, c.command);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let mut warnings = config.validate();

    let modules = ModuleIndex::load(root).context("failed to load .plan/architecture.yaml")?;
    for (name, module) in &modules.modules {
        if !config.has_domain(&module.domain) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "module '{name}' belongs to domain '{}', which is not configured",
                    module.domain
                ),
            });
        }
        if module.profiles.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!("module '{name}' declares no profiles"),
            });
        }
    }

    if json {
        print_json(&serde_json::json!({
            "status": if warnings.iter().any(|w| w.level == WarnLevel::Error) { "error" } else { "success" },
            "data": { "warnings": warnings },
        }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    let has_errors = warnings.iter().any(|w| w.level == WarnLevel::Error);
    if has_errors {
        if json {
            return Err(crate::output::Reported.into());
        }
        anyhow::bail!("config validation found errors");
    }

    Ok(())
}
