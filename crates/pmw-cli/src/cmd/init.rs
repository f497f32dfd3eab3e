use crate::output::print_success;
use anyhow::Context;
use pmw_core::{config::WorkflowConfig, io, paths, skills::DomainDescriptor};
use std::path::Path;

const EMPTY_ARCHITECTURE: &str = "modules: {}\n";

pub fn run(root: &Path, name: Option<&str>, domains: &[String], json: bool) -> anyhow::Result<()> {
    let project_name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let mut created = Vec::new();

    // 1. Directory structure
    for dir in [
        paths::plan_root(root),
        paths::plans_dir(root),
        paths::archive_dir(root),
        paths::knowledge_dir(root),
    ] {
        io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    // 2. config.yaml: created once, later runs only register new domains
    let config_path = paths::config_path(root);
    let mut config = if config_path.exists() {
        WorkflowConfig::load(root).context("failed to read existing config.yaml")?
    } else {
        created.push(".plan/config.yaml");
        WorkflowConfig::new(&project_name)
    };
    let mut added_domains = Vec::new();
    for d in domains {
        if !config.has_domain(d) {
            config.domains.push(DomainDescriptor::new(d.as_str()));
            added_domains.push(d.clone());
        }
    }
    config
        .domain_registry()
        .context("invalid --domain")?;
    if !config_path.exists() || !added_domains.is_empty() {
        config.save(root).context("failed to write config.yaml")?;
    }

    // 3. architecture.yaml, never overwritten
    if io::write_if_missing(&paths::architecture_path(root), EMPTY_ARCHITECTURE.as_bytes())
        .context("failed to write architecture.yaml")?
    {
        created.push(".plan/architecture.yaml");
    }

    if json {
        return print_success(&serde_json::json!({
            "root": root.display().to_string(),
            "project": config.project.name,
            "created": created,
            "added_domains": added_domains,
        }));
    }

    println!("Initialized .plan in: {}", root.display());
    for c in &created {
        println!("  created: {c}");
    }
    for d in &added_domains {
        println!("  domain:  {d}");
    }
    Ok(())
}
