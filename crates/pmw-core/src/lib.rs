pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod finding;
pub mod graph;
pub mod handlers;
pub mod io;
pub mod lock;
pub mod outline;
pub mod paths;
pub mod plan;
pub mod planner;
pub mod references;
pub mod request;
pub mod skills;
pub mod task;
pub mod triage;
pub mod types;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{PmwError, Result};
