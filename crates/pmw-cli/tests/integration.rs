#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const ARCHITECTURE: &str = r#"
modules:
  core:
    domain: rust
    path: crates/core
    profiles:
      implementation:
        defaults: ["rust:idioms"]
      module_testing:
        defaults: ["rust:unit-tests"]
    commands:
      compile: "true"
      module-tests: "true"
"#;

const OUTLINE: &str = r#"# Solution Outline: Config loader

## Summary

Read settings from a file.

## Deliverables

### 1. Add config loader

**Metadata:**
- change_type: feature
- execution_mode: automated
- domain: rust
- module: core
- depends: none

**Profiles:**
- implementation

**Affected files:**
- `crates/core/src/config.rs`

**Verification:**
- Command: `true`
- Criteria: builds

**Success Criteria:**
- settings load from disk
"#;

fn pmw(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pmw").unwrap();
    cmd.current_dir(dir.path()).env("PMW_ROOT", dir.path());
    cmd
}

fn init_project(dir: &TempDir) {
    pmw(dir).args(["init", "--domain", "rust"]).assert().success();
    std::fs::write(dir.path().join(".plan/architecture.yaml"), ARCHITECTURE).unwrap();
}

fn create_plan(dir: &TempDir, id: &str) {
    pmw(dir)
        .args([
            "plan",
            "create",
            id,
            "--description",
            "Load settings from a config file",
            "--domain",
            "rust",
        ])
        .assert()
        .success();
}

fn json_of(output: &[u8]) -> serde_json::Value {
    serde_json::from_slice(output).expect("stdout is JSON")
}

fn phase_next(dir: &TempDir, id: &str) -> serde_json::Value {
    let out = pmw(dir)
        .args(["--json", "phase", "next", id])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    json_of(&out)
}

// ---------------------------------------------------------------------------
// pmw init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_plan_tree() {
    let dir = TempDir::new().unwrap();
    pmw(&dir).arg("init").assert().success();

    assert!(dir.path().join(".plan/plans").is_dir());
    assert!(dir.path().join(".plan/archived-plans").is_dir());
    assert!(dir.path().join(".plan/knowledge").is_dir());
    assert!(dir.path().join(".plan/config.yaml").exists());
    assert!(dir.path().join(".plan/architecture.yaml").exists());
}

#[test]
fn init_is_idempotent_and_keeps_architecture() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    pmw(&dir).args(["init", "--domain", "docs"]).assert().success();

    let arch = std::fs::read_to_string(dir.path().join(".plan/architecture.yaml")).unwrap();
    assert!(arch.contains("rust:idioms"));
    let config = std::fs::read_to_string(dir.path().join(".plan/config.yaml")).unwrap();
    assert!(config.contains("key: rust"));
    assert!(config.contains("key: docs"));
}

#[test]
fn commands_before_init_report_not_found() {
    let dir = TempDir::new().unwrap();
    pmw(&dir)
        .args(["--json", "plan", "list"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"category\": \"not_found\""))
        .stdout(predicate::str::contains("pmw init"));
}

// ---------------------------------------------------------------------------
// pmw plan
// ---------------------------------------------------------------------------

#[test]
fn plan_create_list_show() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    pmw(&dir)
        .args(["plan", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config-loader"))
        .stdout(predicate::str::contains("init"));

    pmw(&dir)
        .args(["plan", "show", "config-loader"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Load settings from a config file"));
}

#[test]
fn plan_create_requires_one_source() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    pmw(&dir)
        .args(["plan", "create", "no-source", "--domain", "rust"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid_input"));
}

#[test]
fn plan_create_rejects_unknown_domain() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    pmw(&dir)
        .args(["plan", "create", "web", "--description", "x", "--domain", "frontend"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown domain: frontend"));
    assert!(!dir.path().join(".plan/plans/web").exists());
}

#[test]
fn plan_create_existing_needs_resolution() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    pmw(&dir)
        .args(["--json", "plan", "create", "config-loader", "--description", "again", "--domain", "rust"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"category\": \"conflict\""));

    let out = pmw(&dir)
        .args([
            "--json",
            "plan",
            "create",
            "config-loader",
            "--description",
            "again",
            "--domain",
            "rust",
            "--on-conflict",
            "resume",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v = json_of(&out);
    assert_eq!(v["status"], "success");
    assert_eq!(v["data"]["action"], "resumed");

    pmw(&dir)
        .args([
            "plan",
            "create",
            "config-loader",
            "--description",
            "again",
            "--domain",
            "rust",
            "--rename-to",
            "config-loader-2",
        ])
        .assert()
        .success();
    assert!(dir.path().join(".plan/plans/config-loader-2").is_dir());
}

#[test]
fn plan_delete_rejects_path_like_ids() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    pmw(&dir)
        .args(["plan", "delete", "../outside"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid plan id"));
}

#[test]
fn plan_abort_ends_the_plan() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    pmw(&dir)
        .args(["plan", "abort", "config-loader", "--reason", "superseded"])
        .assert()
        .success();
    pmw(&dir)
        .args(["status", "get", "config-loader"])
        .assert()
        .success()
        .stdout(predicate::str::contains("aborted"))
        .stdout(predicate::str::contains("superseded"));
    pmw(&dir)
        .args(["phase", "next", "config-loader"])
        .assert()
        .failure();
}

// ---------------------------------------------------------------------------
// pmw status set
// ---------------------------------------------------------------------------

#[test]
fn status_set_checks_preconditions() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    pmw(&dir)
        .args(["status", "set", "config-loader", "--phase", "refine"])
        .assert()
        .success();
    // no outline yet
    pmw(&dir)
        .args(["--json", "status", "set", "config-loader", "--phase", "plan"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("missing_artifact"));
    // backwards
    pmw(&dir)
        .args(["status", "set", "config-loader", "--phase", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("forward-only"));
}

// ---------------------------------------------------------------------------
// Full lifecycle
// ---------------------------------------------------------------------------

#[test]
fn plan_runs_from_request_to_archive() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    assert_eq!(phase_next(&dir, "config-loader")["data"]["phase"], "refine");
    assert_eq!(phase_next(&dir, "config-loader")["data"]["phase"], "outline");

    let waiting = phase_next(&dir, "config-loader");
    assert_eq!(waiting["data"]["outcome"]["kind"], "wait");
    assert_eq!(waiting["data"]["phase"], "outline");

    std::fs::write(
        dir.path().join(".plan/plans/config-loader/solution_outline.md"),
        OUTLINE,
    )
    .unwrap();
    pmw(&dir)
        .args(["outline", "validate", "config-loader", "--expected", "1"])
        .assert()
        .success();

    assert_eq!(phase_next(&dir, "config-loader")["data"]["phase"], "plan");
    assert_eq!(phase_next(&dir, "config-loader")["data"]["phase"], "execute");

    pmw(&dir)
        .args(["task", "list", "config-loader"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASK-001-IMPL"));

    // the step has not been recorded yet
    let waiting = phase_next(&dir, "config-loader");
    assert_eq!(waiting["data"]["outcome"]["kind"], "wait");

    pmw(&dir)
        .args([
            "task",
            "step",
            "config-loader",
            "TASK-001-IMPL",
            "crates/core/src/config.rs",
            "--done",
        ])
        .assert()
        .success();

    assert_eq!(phase_next(&dir, "config-loader")["data"]["phase"], "verify");
    assert_eq!(phase_next(&dir, "config-loader")["data"]["phase"], "finalize");

    let waiting = phase_next(&dir, "config-loader");
    assert!(waiting["data"]["outcome"]["detail"]["reason"]
        .as_str()
        .unwrap()
        .contains("commit"));

    for step in ["commit", "push", "create-pr"] {
        pmw(&dir)
            .args(["finalize-step", "config-loader", step])
            .assert()
            .success();
    }

    let done = phase_next(&dir, "config-loader");
    assert_eq!(done["data"]["phase"], "complete");
    assert!(done["data"]["archived"].is_string());
    assert!(!dir.path().join(".plan/plans/config-loader").exists());

    pmw(&dir)
        .args(["plan", "list", "--archived"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config-loader"));
}

#[test]
fn task_plan_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");
    std::fs::write(
        dir.path().join(".plan/plans/config-loader/solution_outline.md"),
        OUTLINE,
    )
    .unwrap();

    pmw(&dir)
        .args(["task", "plan", "config-loader", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASK-001-IMPL"))
        .stdout(predicate::str::contains("dry run"));
    assert!(!dir
        .path()
        .join(".plan/plans/config-loader/TASK-001-IMPL.yaml")
        .exists());
}

#[test]
fn task_step_skip_requires_reason() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");
    pmw(&dir)
        .args([
            "task",
            "add",
            "config-loader",
            "--title",
            "Hotfix",
            "--module",
            "core",
            "--origin",
            "fix",
            "--step",
            "crates/core/src/lib.rs",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASK-001-FIX"));

    pmw(&dir)
        .args(["task", "step", "config-loader", "TASK-001-FIX", "crates/core/src/lib.rs", "--skip"])
        .assert()
        .failure();
    pmw(&dir)
        .args([
            "task",
            "step",
            "config-loader",
            "TASK-001-FIX",
            "crates/core/src/lib.rs",
            "--skip",
            "--reason",
            "already correct",
        ])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// pmw finding
// ---------------------------------------------------------------------------

#[test]
fn finding_add_query_resolve() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    let out = pmw(&dir)
        .args([
            "--json",
            "finding",
            "add",
            "config-loader",
            "--type",
            "bug",
            "--title",
            "Null config path",
            "--severity",
            "error",
            "--file",
            "crates/core/src/config.rs",
            "--line",
            "12",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v = json_of(&out);
    assert_eq!(v["data"]["status"], "added");
    let hash = v["data"]["hash_id"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 8);

    pmw(&dir)
        .args(["finding", "query", "config-loader", "--resolution", "pending"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Null config path"));

    pmw(&dir)
        .args(["finding", "resolve", "config-loader", &hash, "--resolution", "fixed"])
        .assert()
        .success();

    pmw(&dir)
        .args(["finding", "query", "config-loader", "--resolution", "pending"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No findings."));
}

#[test]
fn qgate_findings_deduplicate_by_title() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    let add = |dir: &TempDir| {
        let out = pmw(dir)
            .args([
                "--json",
                "finding",
                "add",
                "config-loader",
                "--type",
                "lint-issue",
                "--title",
                "unused import",
                "--scope",
                "qgate-verify",
            ])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        json_of(&out)
    };
    let first = add(&dir);
    let second = add(&dir);
    assert_eq!(first["data"]["status"], "added");
    assert_eq!(second["data"]["status"], "deduplicated");
    assert_eq!(first["data"]["hash_id"], second["data"]["hash_id"]);
}

#[test]
fn triage_suppresses_test_warnings() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_plan(&dir, "config-loader");

    pmw(&dir)
        .args([
            "finding",
            "add",
            "config-loader",
            "--type",
            "lint-issue",
            "--title",
            "long line",
            "--file",
            "crates/core/tests/config_test.rs",
        ])
        .assert()
        .success();

    pmw(&dir)
        .args(["finding", "triage", "config-loader"])
        .assert()
        .success()
        .stdout(predicate::str::contains("suppress"));

    pmw(&dir)
        .args(["finding", "triage", "config-loader", "--apply"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 suppressed"));
}

// ---------------------------------------------------------------------------
// pmw skill / config
// ---------------------------------------------------------------------------

#[test]
fn skill_resolution() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    pmw(&dir)
        .args(["skill", "resolve", "--domain", "rust", "--phase", "outline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("system:workflow-outline"));

    pmw(&dir)
        .args(["skill", "module", "core", "--profile", "module_testing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rust:unit-tests"));

    pmw(&dir)
        .args(["skill", "verify-command", "core", "--profile", "module_testing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("true"));

    pmw(&dir)
        .args(["--json", "skill", "verify-command", "core", "--kind", "integration-tests"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("not_found"));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    pmw(&dir).args(["config", "validate"]).assert().success();

    let path = dir.path().join(".plan/config.yaml");
    let config = std::fs::read_to_string(&path).unwrap();
    let config = config.replace("max_parallel: 3", "max_parallel: 0");
    std::fs::write(&path, config).unwrap();

    pmw(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] execution.max_parallel"));
}
