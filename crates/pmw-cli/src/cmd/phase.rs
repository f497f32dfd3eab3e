use crate::cmd::controller;
use crate::output::{print_json, Reported};
use clap::Subcommand;
use pmw_core::controller::{StepReport, StopReason};
use pmw_core::handlers::PhaseOutcome;
use std::path::Path;

#[derive(Subcommand)]
pub enum PhaseSubcommand {
    /// Run the current phase's handler once
    Next { plan_id: String },

    /// Run handlers until the plan waits, ends, or --max-steps is reached
    Run {
        plan_id: String,
        #[arg(long, default_value_t = 20)]
        max_steps: usize,
    },
}

pub fn run(root: &Path, subcmd: PhaseSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PhaseSubcommand::Next { plan_id } => next(root, &plan_id, json),
        PhaseSubcommand::Run { plan_id, max_steps } => run_until_stop(root, &plan_id, max_steps, json),
    }
}

fn next(root: &Path, plan_id: &str, json: bool) -> anyhow::Result<()> {
    let report = controller(root)?.step(plan_id)?;

    if json {
        let envelope = match &report.outcome {
            PhaseOutcome::LoopBack {
                reason,
                next,
                iteration,
            } => serde_json::json!({
                "status": "loop_back",
                "reason": reason,
                "next_phase": next,
                "iteration": iteration,
                "data": report,
            }),
            PhaseOutcome::Terminal(err) => serde_json::json!({
                "status": "error",
                "operation": "phase next",
                "category": err.category,
                "message": err.message,
                "hint": err.hint,
                "data": report,
            }),
            _ => serde_json::json!({ "status": "success", "data": report }),
        };
        print_json(&envelope)?;
    } else {
        print_step(&report);
    }

    if matches!(report.outcome, PhaseOutcome::Terminal(_)) {
        return Err(Reported.into());
    }
    Ok(())
}

fn run_until_stop(root: &Path, plan_id: &str, max_steps: usize, json: bool) -> anyhow::Result<()> {
    let report = controller(root)?.run(plan_id, max_steps)?;
    let terminal = report
        .steps
        .last()
        .and_then(|s| match &s.outcome {
            PhaseOutcome::Terminal(err) => Some(err.clone()),
            _ => None,
        });

    if json {
        let envelope = match &terminal {
            Some(err) => serde_json::json!({
                "status": "error",
                "operation": "phase run",
                "category": err.category,
                "message": err.message,
                "hint": err.hint,
                "data": report,
            }),
            None => serde_json::json!({ "status": "success", "data": report }),
        };
        print_json(&envelope)?;
    } else {
        for step in &report.steps {
            print_step(step);
        }
        let stopped = match report.stopped {
            StopReason::Terminal => "plan ended",
            StopReason::Waiting => "waiting",
            StopReason::StepLimit => "step limit reached",
        };
        println!("Stopped in {} ({stopped})", report.phase);
    }

    if terminal.is_some() {
        return Err(Reported.into());
    }
    Ok(())
}

fn print_step(report: &StepReport) {
    let head = format!(
        "[{}] {} via {} ({})",
        report.plan_id, report.from, report.handler, report.workflow_skill.skill
    );
    match &report.outcome {
        PhaseOutcome::Continue(next) => println!("{head}: -> {next}"),
        PhaseOutcome::LoopBack {
            reason,
            next,
            iteration,
        } => println!("{head}: loop back to {next} (iteration {iteration}): {reason}"),
        PhaseOutcome::Wait { reason } => println!("{head}: waiting: {reason}"),
        PhaseOutcome::Terminal(err) => {
            eprintln!("{head}: failed [{}]: {}", err.category, err.message);
            eprintln!("hint: {}", err.hint);
        }
    }
    if let Some(path) = &report.archived {
        println!("  archived to {}", path.display());
    }
}
