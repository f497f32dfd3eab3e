use crate::cmd::{load_config, parse, parse_opt, store};
use crate::output::{print_success, print_table};
use clap::Subcommand;
use pmw_core::finding::{self, Finding, FindingFilter, FindingLog, FindingScope, PromotionTarget};
use pmw_core::triage::{self, DefaultTriagePolicy, TriageAction};
use pmw_core::types::{FindingType, Resolution, Severity};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum FindingSubcommand {
    /// Record a finding
    Add {
        plan_id: String,
        /// Finding type, e.g. bug, lint-issue, build-error, pr-comment
        #[arg(long = "type")]
        finding_type: String,
        #[arg(long)]
        title: String,
        /// error, warning or info
        #[arg(long, default_value = "warning")]
        severity: String,
        #[arg(long)]
        detail: Option<String>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        line: Option<u32>,
        /// security, bug, code_smell, style, performance or other
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        rule: Option<String>,
        /// Task that produced the finding
        #[arg(long)]
        task: Option<String>,
        /// plan, or qgate-{phase}
        #[arg(long, default_value = "plan")]
        scope: String,
    },

    /// List findings, optionally filtered
    Query {
        plan_id: String,
        /// plan, qgate-{phase}, or all
        #[arg(long, default_value = "all")]
        scope: String,
        #[arg(long = "type")]
        finding_type: Option<String>,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        resolution: Option<String>,
        /// Substring of the file path
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        promoted: Option<bool>,
    },

    /// Resolve a finding
    Resolve {
        plan_id: String,
        hash_id: String,
        /// fixed, suppressed, accepted or taken_into_account
        #[arg(long)]
        resolution: String,
        #[arg(long)]
        detail: Option<String>,
    },

    /// Copy a finding into the project knowledge store
    Promote {
        plan_id: String,
        hash_id: String,
        /// lesson or architecture
        #[arg(long, default_value = "lesson")]
        to: String,
    },

    /// Decide fix / suppress / accept for pending findings
    Triage {
        plan_id: String,
        #[arg(long, default_value = "plan")]
        scope: String,
        /// Resolve suppressed and accepted findings in place
        #[arg(long)]
        apply: bool,
        /// With --apply, create fix tasks for findings that need fixing
        #[arg(long, requires = "apply")]
        spawn_fixes: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: FindingSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        FindingSubcommand::Add {
            plan_id,
            finding_type,
            title,
            severity,
            detail,
            file,
            line,
            category,
            rule,
            task,
            scope,
        } => {
            let mut f = Finding::new(parse::<FindingType>(&finding_type)?, title, parse::<Severity>(&severity)?);
            f.detail = detail;
            if let Some(file) = file {
                f = f.with_location(file, line);
            }
            f.category = parse_opt(category.as_deref())?;
            f.rule = rule;
            f.source_task = task;
            add(root, &plan_id, parse(&scope)?, f, json)
        }
        FindingSubcommand::Query {
            plan_id,
            scope,
            finding_type,
            severity,
            resolution,
            file,
            promoted,
        } => {
            let filter = FindingFilter {
                finding_type: parse_opt(finding_type.as_deref())?,
                severity: parse_opt(severity.as_deref())?,
                resolution: parse_opt(resolution.as_deref())?,
                file_contains: file,
                promoted,
            };
            let scopes = if scope == "all" {
                finding::all_scopes()
            } else {
                vec![parse(&scope)?]
            };
            query(root, &plan_id, &scopes, &filter, json)
        }
        FindingSubcommand::Resolve {
            plan_id,
            hash_id,
            resolution,
            detail,
        } => resolve(root, &plan_id, &hash_id, parse(&resolution)?, detail, json),
        FindingSubcommand::Promote { plan_id, hash_id, to } => {
            promote(root, &plan_id, &hash_id, parse(&to)?, json)
        }
        FindingSubcommand::Triage {
            plan_id,
            scope,
            apply,
            spawn_fixes,
        } => run_triage(root, &plan_id, parse(&scope)?, apply, spawn_fixes, json),
    }
}

fn log_for(root: &Path, plan_id: &str, scope: FindingScope) -> anyhow::Result<FindingLog> {
    let config = load_config(root)?;
    Ok(FindingLog::new(root, plan_id, scope).with_lock_settings(config.lock_settings()))
}

// ---------------------------------------------------------------------------
// add / query
// ---------------------------------------------------------------------------

fn add(root: &Path, plan_id: &str, scope: FindingScope, f: Finding, json: bool) -> anyhow::Result<()> {
    let outcome = log_for(root, plan_id, scope)?.add(f)?;
    if json {
        return print_success(&outcome);
    }
    println!(
        "Finding {} {} in {scope}",
        outcome.hash_id,
        format!("{:?}", outcome.status).to_lowercase()
    );
    Ok(())
}

fn query(
    root: &Path,
    plan_id: &str,
    scopes: &[FindingScope],
    filter: &FindingFilter,
    json: bool,
) -> anyhow::Result<()> {
    let mut found: Vec<(FindingScope, Finding)> = Vec::new();
    for scope in scopes {
        let log = FindingLog::new(root, plan_id, *scope);
        found.extend(log.query(filter)?.into_iter().map(|f| (*scope, f)));
    }

    if json {
        let items: Vec<serde_json::Value> = found
            .iter()
            .map(|(scope, f)| -> Result<serde_json::Value, serde_json::Error> {
                let mut v = serde_json::to_value(f)?;
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("scope".to_string(), scope.to_string().into());
                }
                Ok(v)
            })
            .collect::<Result<_, _>>()?;
        return print_success(&items);
    }

    if found.is_empty() {
        println!("No findings.");
        return Ok(());
    }
    let rows = found
        .iter()
        .map(|(scope, f)| {
            vec![
                f.hash_id.clone(),
                scope.to_string(),
                f.finding_type.to_string(),
                f.severity.to_string(),
                f.resolution.to_string(),
                f.file_path.clone().unwrap_or_else(|| "-".to_string()),
                f.title.clone(),
            ]
        })
        .collect();
    print_table(
        &["ID", "SCOPE", "TYPE", "SEVERITY", "RESOLUTION", "FILE", "TITLE"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// resolve / promote
// ---------------------------------------------------------------------------

fn resolve(
    root: &Path,
    plan_id: &str,
    hash_id: &str,
    resolution: Resolution,
    detail: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let (log, _) = finding::locate(root, plan_id, hash_id)?;
    let config = load_config(root)?;
    let f = log
        .with_lock_settings(config.lock_settings())
        .resolve(hash_id, resolution, detail)?;
    if json {
        return print_success(&f);
    }
    println!("Finding {hash_id} resolved as {}", f.resolution);
    Ok(())
}

fn promote(
    root: &Path,
    plan_id: &str,
    hash_id: &str,
    target: PromotionTarget,
    json: bool,
) -> anyhow::Result<()> {
    let (log, _) = finding::locate(root, plan_id, hash_id)?;
    let config = load_config(root)?;
    let f = log
        .with_lock_settings(config.lock_settings())
        .promote(hash_id, target)?;
    if json {
        return print_success(&f);
    }
    println!("Finding {hash_id} promoted to {target:?}");
    Ok(())
}

// ---------------------------------------------------------------------------
// triage
// ---------------------------------------------------------------------------

fn run_triage(
    root: &Path,
    plan_id: &str,
    scope: FindingScope,
    apply: bool,
    spawn_fixes: bool,
    json: bool,
) -> anyhow::Result<()> {
    let log = log_for(root, plan_id, scope)?;
    let policy = DefaultTriagePolicy::default();

    if !apply {
        let decisions = triage::assess(&policy, &log.load()?);
        if json {
            return print_success(&decisions);
        }
        if decisions.is_empty() {
            println!("No pending findings in {scope}.");
            return Ok(());
        }
        let rows = decisions
            .iter()
            .map(|d| {
                vec![
                    d.hash_id.clone(),
                    action_label(d.action).to_string(),
                    d.priority.to_string(),
                    d.location.to_string(),
                    d.rule.to_string(),
                    d.title.clone(),
                ]
            })
            .collect();
        print_table(&["ID", "ACTION", "PRIORITY", "LOCATION", "RULE", "TITLE"], rows);
        return Ok(());
    }

    let store = store(root)?;
    let report = triage::apply(&store, plan_id, &log, &policy, spawn_fixes)?;
    if json {
        return print_success(&report);
    }
    println!(
        "Triaged {} finding(s) in {scope}: {} suppressed, {} accepted",
        report.decisions.len(),
        report.suppressed,
        report.accepted
    );
    for t in &report.fix_tasks {
        println!("  fix task created: {t}");
    }
    for h in &report.in_progress {
        println!("  already being fixed: {h}");
    }
    for h in &report.deferred {
        println!("  needs a fix (re-run with --spawn-fixes): {h}");
    }
    Ok(())
}

fn action_label(action: TriageAction) -> &'static str {
    match action {
        TriageAction::Fix => "fix",
        TriageAction::Suppress => "suppress",
        TriageAction::Accept => "accept",
    }
}
