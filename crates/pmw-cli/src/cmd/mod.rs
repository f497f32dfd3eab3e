pub mod config;
pub mod finalize_step;
pub mod finding;
pub mod init;
pub mod outline;
pub mod phase;
pub mod plan;
pub mod skill;
pub mod status;
pub mod task;

use anyhow::Context;
use pmw_core::config::WorkflowConfig;
use pmw_core::controller::PhaseController;
use pmw_core::handlers::Collaborators;
use pmw_core::plan::PlanStore;
use std::path::Path;

/// Controller with the standard collaborators: shell verification, steps
/// recorded out of band through `task step`.
pub fn controller(root: &Path) -> anyhow::Result<PhaseController> {
    PhaseController::open(root, Collaborators::standard(root))
        .context("failed to load .plan configuration")
}

pub fn load_config(root: &Path) -> anyhow::Result<WorkflowConfig> {
    WorkflowConfig::load(root).context("failed to load .plan/config.yaml")
}

pub fn store(root: &Path) -> anyhow::Result<PlanStore> {
    let config = load_config(root)?;
    Ok(PlanStore::new(root).with_lock_settings(config.lock_settings()))
}

/// Parse a CLI string through the core's `FromStr`, keeping its error category.
pub fn parse<T>(value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr<Err = pmw_core::PmwError>,
{
    Ok(value.parse::<T>()?)
}

pub fn parse_opt<T>(value: Option<&str>) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr<Err = pmw_core::PmwError>,
{
    value.map(parse).transpose()
}
