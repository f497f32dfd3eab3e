use crate::cmd::controller;
use crate::output::print_success;
use std::path::Path;

pub fn run(
    root: &Path,
    plan_id: &str,
    step: &str,
    outcome: &str,
    detail: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let ctl = controller(root)?;
    let status = ctl.record_finalize_step(plan_id, step, outcome, detail)?;

    if json {
        return print_success(&status);
    }
    let pending: Vec<&str> = ctl
        .config()
        .finalize
        .steps
        .iter()
        .filter(|s| !status.finalize_steps.contains_key(s.as_str()))
        .map(String::as_str)
        .collect();
    println!("Recorded finalize step '{step}': {outcome}");
    if !pending.is_empty() {
        println!("  still pending: {}", pending.join(", "));
    }
    Ok(())
}
