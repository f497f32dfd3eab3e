use crate::cmd::{controller, parse, store};
use crate::output::{print_success, print_table};
use anyhow::Context;
use clap::Subcommand;
use pmw_core::plan::PlanStatus;
use pmw_core::types::Phase;
use std::path::Path;

#[derive(Subcommand)]
pub enum StatusSubcommand {
    /// Show phase, history, iteration counters and finalize steps
    Get { plan_id: String },

    /// Manually advance to a later phase (preconditions are checked)
    Set {
        plan_id: String,
        #[arg(long)]
        phase: String,
    },
}

pub fn run(root: &Path, subcmd: StatusSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        StatusSubcommand::Get { plan_id } => {
            let status = store(root)?
                .read_status(&plan_id)
                .with_context(|| format!("failed to read status of '{plan_id}'"))?;
            if json {
                return print_success(&status);
            }
            print_status(&status);
            Ok(())
        }
        StatusSubcommand::Set { plan_id, phase } => {
            let target: Phase = parse(&phase)?;
            let status = controller(root)?.advance(&plan_id, target)?;
            if json {
                return print_success(&status);
            }
            println!("Plan '{plan_id}' is now in {}", status.phase);
            Ok(())
        }
    }
}

fn print_status(status: &PlanStatus) {
    println!("Plan:     {}", status.plan_id);
    println!("Phase:    {}", status.phase);
    println!(
        "Loops:    verify {}, finalize {}",
        status.verify_iteration, status.finalize_iteration
    );
    if let Some(note) = &status.outcome {
        println!("Outcome:  [{}] {}", note.category, note.message);
    }

    println!();
    let rows = status
        .phase_history
        .iter()
        .map(|t| {
            vec![
                t.phase.to_string(),
                t.entered.format("%Y-%m-%d %H:%M:%S").to_string(),
                t.exited
                    .map(|e| e.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                t.note.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["PHASE", "ENTERED", "EXITED", "NOTE"], rows);

    if !status.finalize_steps.is_empty() {
        println!("\nFinalize steps:");
        for (name, step) in &status.finalize_steps {
            match &step.detail {
                Some(d) => println!("  {name}: {} ({d})", step.outcome),
                None => println!("  {name}: {}", step.outcome),
            }
        }
    }
}
