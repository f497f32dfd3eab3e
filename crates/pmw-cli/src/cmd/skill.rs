use crate::cmd::{load_config, parse, parse_opt};
use crate::output::{print_success, print_table};
use clap::Subcommand;
use pmw_core::skills::{ModuleIndex, SkillContext, SkillKind, TagRelevance};
use pmw_core::types::Profile;
use std::path::Path;

#[derive(Subcommand)]
pub enum SkillSubcommand {
    /// Workflow skill for a domain and workflow phase (falls back to system)
    Resolve {
        #[arg(long)]
        domain: String,
        /// init, refine, outline, plan, implementation, module_testing, ...
        #[arg(long)]
        phase: String,
    },

    /// Task skills for a module and profile, with relevance rationale
    Module {
        module: String,
        #[arg(long, default_value = "implementation")]
        profile: String,
        /// Deliverable title used for tag matching
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long)]
        change_type: Option<String>,
        /// Affected file (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
    },

    /// Verification command of a module
    VerifyCommand {
        module: String,
        /// Command kind, e.g. compile, module-tests, quality-gate
        #[arg(long, conflicts_with = "profile")]
        kind: Option<String>,
        /// Use the profile's default command kind
        #[arg(long)]
        profile: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: SkillSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SkillSubcommand::Resolve { domain, phase } => {
            let registry = load_config(root)?.domain_registry()?;
            let skill = registry.resolve_workflow_skill(&domain, &phase)?;
            if json {
                return print_success(&skill);
            }
            if skill.fallback {
                println!("{} (system default; '{domain}' has no '{phase}' skill)", skill.skill);
            } else {
                println!("{}", skill.skill);
            }
            Ok(())
        }
        SkillSubcommand::Module {
            module,
            profile,
            title,
            change_type,
            files,
        } => {
            let ctx = SkillContext {
                title,
                change_type: parse_opt(change_type.as_deref())?,
                affected_files: files,
            };
            let resolution = ModuleIndex::load(root)?.resolve_skills(
                &module,
                parse(&profile)?,
                &ctx,
                &TagRelevance::default(),
            )?;
            if json {
                return print_success(&resolution);
            }
            let rows = resolution
                .decisions
                .iter()
                .map(|d| {
                    vec![
                        d.skill.clone(),
                        match d.kind {
                            SkillKind::Default => "default".to_string(),
                            SkillKind::Optional => "optional".to_string(),
                        },
                        if d.included { "yes" } else { "no" }.to_string(),
                        d.rationale.clone(),
                    ]
                })
                .collect();
            print_table(&["SKILL", "KIND", "INCLUDED", "RATIONALE"], rows);
            Ok(())
        }
        SkillSubcommand::VerifyCommand {
            module,
            kind,
            profile,
        } => {
            let kind = match (kind, profile) {
                (Some(k), _) => k,
                (None, Some(p)) => parse::<Profile>(&p)?.command_kind().to_string(),
                (None, None) => Profile::Implementation.command_kind().to_string(),
            };
            let command = ModuleIndex::load(root)?.verification_command(&module, &kind)?;
            if json {
                return print_success(&serde_json::json!({
                    "module": module,
                    "kind": kind,
                    "command": command,
                }));
            }
            println!("{command}");
            Ok(())
        }
    }
}
