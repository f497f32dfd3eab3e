//! Domain registry and skill resolution.
//!
//! Two lookups live here:
//! - workflow skills per (domain, workflow phase), with a system default when
//!   the domain does not override the phase;
//! - task skills per (module, profile) from the architecture index, where
//!   "default" skills always apply and "optional" skills are admitted by a
//!   pluggable [`RelevancePredicate`].
//!
//! Relevance is scored over structured metadata (change type, file
//! extensions, tags). It approximates a judgement call, so every decision is
//! returned with its rationale and logged.

use crate::error::{PmwError, Result};
use crate::io;
use crate::paths;
use crate::types::{ChangeType, Profile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Reserved key for workflow-internal skills. Never valid on a deliverable or task.
pub const SYSTEM_DOMAIN: &str = "system";

/// Workflow phases that can carry a domain-specific skill.
pub const WORKFLOW_PHASES: &[&str] = &[
    "init",
    "refine",
    "outline",
    "plan",
    "implementation",
    "module_testing",
    "integration_testing",
    "verify",
    "finalize",
    "triage",
];

pub fn system_skill(phase: &str) -> String {
    format!("{SYSTEM_DOMAIN}:workflow-{phase}")
}

fn is_skill_ref(value: &str) -> bool {
    match value.split_once(':') {
        Some((bundle, skill)) => {
            !bundle.is_empty() && !skill.is_empty() && !value.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// DomainDescriptor / DomainRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Workflow phase -> skill reference (`bundle:skill`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflow_skills: BTreeMap<String, String>,
    #[serde(default)]
    pub extensions: DomainExtensions,
}

impl DomainDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: None,
            workflow_skills: BTreeMap::new(),
            extensions: DomainExtensions::default(),
        }
    }

    pub fn with_workflow_skill(mut self, phase: &str, skill: &str) -> Self {
        self.workflow_skills
            .insert(phase.to_string(), skill.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| PmwError::InvalidDomain {
            key: self.key.clone(),
            reason,
        };
        if self.key == SYSTEM_DOMAIN {
            return Err(invalid("'system' is reserved".to_string()));
        }
        if !paths::is_kebab(&self.key) {
            return Err(invalid("key must be kebab-case".to_string()));
        }
        for (phase, skill) in &self.workflow_skills {
            if !WORKFLOW_PHASES.contains(&phase.as_str()) {
                return Err(invalid(format!("unknown workflow phase '{phase}'")));
            }
            if !is_skill_ref(skill) {
                return Err(invalid(format!(
                    "skill '{skill}' for phase '{phase}' must be 'bundle:skill'"
                )));
            }
        }
        for skill in [&self.extensions.outline, &self.extensions.triage]
            .into_iter()
            .flatten()
        {
            if !is_skill_ref(skill) {
                return Err(invalid(format!("extension '{skill}' must be 'bundle:skill'")));
            }
        }
        Ok(())
    }
}

/// Result of a workflow skill lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSkill {
    pub domain: String,
    pub phase: String,
    pub skill: String,
    pub fallback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    domains: BTreeMap<String, DomainDescriptor>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: &[DomainDescriptor]) -> Result<Self> {
        let mut registry = Self::new();
        for d in descriptors {
            registry.register(d.clone())?;
        }
        Ok(registry)
    }

    /// Descriptors are validated here, once, rather than at every lookup.
    pub fn register(&mut self, descriptor: DomainDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.domains.contains_key(&descriptor.key) {
            return Err(PmwError::InvalidDomain {
                key: descriptor.key,
                reason: "already registered".to_string(),
            });
        }
        self.domains.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&DomainDescriptor> {
        self.domains.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.domains.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    pub fn resolve_workflow_skill(&self, domain: &str, phase: &str) -> Result<WorkflowSkill> {
        if !WORKFLOW_PHASES.contains(&phase) {
            return Err(PmwError::InvalidValue {
                field: "workflow phase".to_string(),
                value: phase.to_string(),
            });
        }
        let over = self
            .domains
            .get(domain)
            .and_then(|d| d.workflow_skills.get(phase));
        let resolved = match over {
            Some(skill) => WorkflowSkill {
                domain: domain.to_string(),
                phase: phase.to_string(),
                skill: skill.clone(),
                fallback: false,
            },
            None => WorkflowSkill {
                domain: domain.to_string(),
                phase: phase.to_string(),
                skill: system_skill(phase),
                fallback: true,
            },
        };
        tracing::debug!(
            domain,
            phase,
            skill = %resolved.skill,
            fallback = resolved.fallback,
            "resolved workflow skill"
        );
        Ok(resolved)
    }
}

// ---------------------------------------------------------------------------
// Module index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionalSkill {
    pub skill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub change_types: Vec<ChangeType>,
    /// Extensions without the dot, e.g. `java`, `ts`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSkills {
    #[serde(default)]
    pub defaults: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optionals: Vec<OptionalSkill>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<Profile, ProfileSkills>,
    /// Command kind (`compile`, `module-tests`, ...) -> shell command.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, String>,
}

/// Deliverable context used to judge optional skills.
#[derive(Debug, Clone, Default)]
pub struct SkillContext {
    pub title: String,
    pub change_type: Option<ChangeType>,
    pub affected_files: Vec<String>,
}

impl SkillContext {
    fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self
            .affected_files
            .iter()
            .filter_map(|f| Path::new(f).extension())
            .map(|e| e.to_string_lossy().to_lowercase())
            .collect();
        exts.sort();
        exts.dedup();
        exts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relevance {
    pub included: bool,
    pub score: u32,
    pub rationale: String,
}

pub trait RelevancePredicate: Send + Sync {
    fn assess(&self, skill: &OptionalSkill, ctx: &SkillContext) -> Relevance;
}

/// Default predicate: scores change type (+2), file extensions (+1 each) and
/// title tags (+1 each). Included at `threshold` or above.
#[derive(Debug, Clone)]
pub struct TagRelevance {
    pub threshold: u32,
}

impl Default for TagRelevance {
    fn default() -> Self {
        Self { threshold: 1 }
    }
}

impl RelevancePredicate for TagRelevance {
    fn assess(&self, skill: &OptionalSkill, ctx: &SkillContext) -> Relevance {
        if skill.tags.is_empty() && skill.change_types.is_empty() && skill.file_extensions.is_empty() {
            return Relevance {
                included: false,
                score: 0,
                rationale: "no applicability metadata declared".to_string(),
            };
        }

        let mut score = 0;
        let mut reasons = Vec::new();

        if let Some(ct) = ctx.change_type {
            if skill.change_types.contains(&ct) {
                score += 2;
                reasons.push(format!("change_type {ct}"));
            }
        }

        let exts = ctx.extensions();
        for ext in &skill.file_extensions {
            let ext = ext.trim_start_matches('.').to_lowercase();
            if exts.contains(&ext) {
                score += 1;
                reasons.push(format!("files .{ext}"));
            }
        }

        let title = ctx.title.to_lowercase();
        let words: Vec<&str> = title
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|w| !w.is_empty())
            .collect();
        for tag in &skill.tags {
            let tag = tag.to_lowercase();
            if words.contains(&tag.as_str()) {
                score += 1;
                reasons.push(format!("tag '{tag}'"));
            }
        }

        let included = score >= self.threshold;
        let rationale = if reasons.is_empty() {
            "no metadata matched".to_string()
        } else {
            format!("matched {}", reasons.join(", "))
        };
        Relevance {
            included,
            score,
            rationale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillKind {
    Default,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillDecision {
    pub skill: String,
    pub kind: SkillKind,
    pub included: bool,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillResolution {
    pub module: String,
    pub profile: Profile,
    pub skills: Vec<String>,
    pub decisions: Vec<SkillDecision>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleIndex {
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDescriptor>,
}

impl ModuleIndex {
    /// A missing index file yields an empty index; lookups then fail per module.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::architecture_path(root);
        Ok(io::read_yaml_optional(&path, "architecture")?.unwrap_or_default())
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        io::write_yaml(&paths::architecture_path(root), self)
    }

    pub fn module(&self, name: &str) -> Result<&ModuleDescriptor> {
        self.modules
            .get(name)
            .ok_or_else(|| PmwError::ModuleNotFound(name.to_string()))
    }

    pub fn resolve_skills(
        &self,
        module: &str,
        profile: Profile,
        ctx: &SkillContext,
        predicate: &dyn RelevancePredicate,
    ) -> Result<SkillResolution> {
        let descriptor = self.module(module)?;
        let profile_skills =
            descriptor
                .profiles
                .get(&profile)
                .ok_or_else(|| PmwError::ProfileNotDefined {
                    module: module.to_string(),
                    profile: profile.to_string(),
                })?;

        let mut skills = Vec::new();
        let mut decisions = Vec::new();

        for skill in &profile_skills.defaults {
            if !skills.contains(skill) {
                skills.push(skill.clone());
            }
            decisions.push(SkillDecision {
                skill: skill.clone(),
                kind: SkillKind::Default,
                included: true,
                rationale: "default skill".to_string(),
            });
        }

        for optional in &profile_skills.optionals {
            let relevance = predicate.assess(optional, ctx);
            tracing::info!(
                module,
                %profile,
                skill = %optional.skill,
                included = relevance.included,
                score = relevance.score,
                rationale = %relevance.rationale,
                "optional skill relevance"
            );
            if relevance.included && !skills.contains(&optional.skill) {
                skills.push(optional.skill.clone());
            }
            decisions.push(SkillDecision {
                skill: optional.skill.clone(),
                kind: SkillKind::Optional,
                included: relevance.included,
                rationale: relevance.rationale,
            });
        }

        Ok(SkillResolution {
            module: module.to_string(),
            profile,
            skills,
            decisions,
        })
    }

    pub fn verification_command(&self, module: &str, kind: &str) -> Result<String> {
        let descriptor = self.module(module)?;
        descriptor
            .commands
            .get(kind)
            .cloned()
            .ok_or_else(|| PmwError::CommandNotDefined {
                module: module.to_string(),
                kind: kind.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
