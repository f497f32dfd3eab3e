use crate::error::{PmwError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PLAN_DIR: &str = ".plan";
pub const PLANS_DIR: &str = ".plan/plans";
pub const ARCHIVE_DIR: &str = ".plan/archived-plans";
pub const KNOWLEDGE_DIR: &str = ".plan/knowledge";

pub const CONFIG_FILE: &str = ".plan/config.yaml";
pub const ARCHITECTURE_FILE: &str = ".plan/architecture.yaml";

pub const PLAN_CONFIG_FILE: &str = "config.yaml";
pub const STATUS_FILE: &str = "status.yaml";
pub const REQUEST_FILE: &str = "request.yaml";
pub const OUTLINE_FILE: &str = "solution_outline.md";
pub const FINDINGS_FILE: &str = "findings.yaml";
pub const REFERENCES_FILE: &str = "references.yaml";
pub const LOCK_FILE: &str = ".lock";
pub const PHASE_LOCK_FILE: &str = ".phase.lock";

pub const TASK_PREFIX: &str = "TASK-";

pub const MAX_PLAN_ID_LEN: usize = 50;

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn plan_root(root: &Path) -> PathBuf {
    root.join(PLAN_DIR)
}

pub fn plans_dir(root: &Path) -> PathBuf {
    root.join(PLANS_DIR)
}

pub fn archive_dir(root: &Path) -> PathBuf {
    root.join(ARCHIVE_DIR)
}

pub fn knowledge_dir(root: &Path) -> PathBuf {
    root.join(KNOWLEDGE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn architecture_path(root: &Path) -> PathBuf {
    root.join(ARCHITECTURE_FILE)
}

pub fn plan_dir(root: &Path, plan_id: &str) -> PathBuf {
    plans_dir(root).join(plan_id)
}

pub fn plan_config_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(PLAN_CONFIG_FILE)
}

pub fn status_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(STATUS_FILE)
}

pub fn request_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(REQUEST_FILE)
}

pub fn outline_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(OUTLINE_FILE)
}

pub fn findings_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(FINDINGS_FILE)
}

pub fn qgate_path(root: &Path, plan_id: &str, phase: &str) -> PathBuf {
    plan_dir(root, plan_id).join(format!("qgate-{phase}.yaml"))
}

pub fn references_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(REFERENCES_FILE)
}

pub fn lock_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(LOCK_FILE)
}

pub fn phase_lock_path(root: &Path, plan_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(PHASE_LOCK_FILE)
}

pub fn task_path(root: &Path, plan_id: &str, task_id: &str) -> PathBuf {
    plan_dir(root, plan_id).join(format!("{task_id}.yaml"))
}

pub fn knowledge_path(root: &Path, target: &str) -> PathBuf {
    knowledge_dir(root).join(format!("{target}.yaml"))
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

static PLAN_ID_RE: OnceLock<Regex> = OnceLock::new();
static TASK_ID_RE: OnceLock<Regex> = OnceLock::new();

fn plan_id_re() -> &'static Regex {
    PLAN_ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap())
}

fn task_id_re() -> &'static Regex {
    TASK_ID_RE.get_or_init(|| Regex::new(r"^TASK-(\d{3,})-([A-Z]+)$").unwrap())
}

/// Plan ids name a directory under `.plan/plans`, so this runs before any
/// filesystem access keyed on a caller-supplied id.
pub fn validate_plan_id(plan_id: &str) -> Result<()> {
    if plan_id.is_empty() || plan_id.len() > MAX_PLAN_ID_LEN || !plan_id_re().is_match(plan_id) {
        return Err(PmwError::InvalidPlanId(plan_id.to_string()));
    }
    Ok(())
}

/// Kebab-case check shared by plan ids and domain keys.
pub fn is_kebab(value: &str) -> bool {
    !value.is_empty() && plan_id_re().is_match(value)
}

/// Split `TASK-007-IMPL` into `(7, "IMPL")`.
pub fn parse_task_id(task_id: &str) -> Option<(u32, &str)> {
    let caps = task_id_re().captures(task_id)?;
    let seq = caps.get(1)?.as_str().parse().ok()?;
    let kind = caps.get(2)?.as_str();
    Some((seq, kind))
}

pub fn is_task_file(name: &str) -> bool {
    name.starts_with(TASK_PREFIX) && name.ends_with(".yaml")
}

/// Checks that `path` names a concrete project-relative file rather than a
/// sentence or a directory. Returns the reason on rejection.
pub fn check_file_path(path: &str) -> std::result::Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("path is empty");
    }
    if path.chars().any(char::is_whitespace) {
        return Err("path contains whitespace; steps must be file paths, not descriptions");
    }
    if path.ends_with('/') {
        return Err("path names a directory");
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err("path must be relative to the project root");
    }
    if path.split(['/', '\\']).any(|c| c == "..") {
        return Err("path must not contain '..'");
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    if !path.contains('/') && !file_name.contains('.') {
        return Err("path has neither a directory nor an extension");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
