//! Solution outline: the Markdown deliverable document produced by the
//! outline phase and consumed by the planner.
//!
//! Deliverables live under `### N. Title` headings, numbered from 1 without
//! gaps. Each one carries bold-labelled sections (`**Metadata:**`,
//! `**Profiles:**`, `**Affected files:**`, `**Change per file:**`,
//! `**Verification:**`, `**Success Criteria:**`) with bullet content.

use crate::error::{PmwError, Result};
use crate::graph::DependencyGraph;
use crate::paths;
use crate::skills::SYSTEM_DOMAIN;
use crate::types::{ChangeType, ExecutionMode, Profile};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::OnceLock;

const ARTIFACT: &str = "solution_outline";

static HEADING_RE: OnceLock<Regex> = OnceLock::new();
static LABEL_RE: OnceLock<Regex> = OnceLock::new();

fn heading_re() -> &'static Regex {
    HEADING_RE.get_or_init(|| Regex::new(r"^###\s+(\d+)\.\s+(.+?)\s*$").unwrap())
}

fn label_re() -> &'static Regex {
    LABEL_RE.get_or_init(|| Regex::new(r"^\*\*([A-Za-z ]+):\*\*\s*(.*)$").unwrap())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliverableVerification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub number: u32,
    pub title: String,
    pub change_type: ChangeType,
    pub execution_mode: ExecutionMode,
    pub domain: String,
    pub module: String,
    pub profiles: Vec<Profile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<u32>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
    #[serde(default)]
    pub verification: DeliverableVerification,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolutionOutline {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    pub deliverables: Vec<Deliverable>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Metadata,
    Profiles,
    AffectedFiles,
    Changes,
    Verification,
    SuccessCriteria,
}

fn section_for(label: &str) -> Option<Section> {
    match label.trim().to_lowercase().as_str() {
        "metadata" => Some(Section::Metadata),
        "profiles" | "profile" => Some(Section::Profiles),
        "affected files" => Some(Section::AffectedFiles),
        "change per file" | "changes" => Some(Section::Changes),
        "verification" => Some(Section::Verification),
        "success criteria" => Some(Section::SuccessCriteria),
        _ => None,
    }
}

fn strip_ticks(s: &str) -> String {
    s.trim().trim_matches('`').trim().to_string()
}

fn bullet(line: &str) -> Option<&str> {
    line.strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .map(str::trim)
}

fn schema(number: Option<u32>, reason: impl Into<String>) -> PmwError {
    let reason = reason.into();
    PmwError::SchemaViolation {
        artifact: ARTIFACT.to_string(),
        reason: match number {
            Some(n) => format!("deliverable {n}: {reason}"),
            None => reason,
        },
    }
}

/// Accumulates one deliverable while its lines are read.
#[derive(Default)]
struct Draft {
    number: u32,
    title: String,
    change_type: Option<String>,
    execution_mode: Option<String>,
    domain: Option<String>,
    module: Option<String>,
    depends: Option<String>,
    profiles: Vec<String>,
    affected_files: Vec<String>,
    changes: Vec<String>,
    command: Option<String>,
    criteria: Option<String>,
    success_criteria: Vec<String>,
}

impl Draft {
    fn push(&mut self, section: Section, item: &str) -> Result<()> {
        match section {
            Section::None => {}
            Section::Metadata => {
                let Some((key, value)) = item.split_once(':') else {
                    return Err(schema(
                        Some(self.number),
                        format!("metadata entry '{item}' is not 'key: value'"),
                    ));
                };
                let value = Some(strip_ticks(value));
                match key.trim().to_lowercase().as_str() {
                    "change_type" => self.change_type = value,
                    "execution_mode" => self.execution_mode = value,
                    "domain" => self.domain = value,
                    "module" => self.module = value,
                    "depends" => self.depends = value,
                    _ => {}
                }
            }
            Section::Profiles => self.profiles.push(strip_ticks(item)),
            Section::AffectedFiles => self.affected_files.push(strip_ticks(item)),
            Section::Changes => self.changes.push(item.to_string()),
            Section::Verification => match item.split_once(':') {
                Some((k, v)) if k.trim().eq_ignore_ascii_case("command") => {
                    self.command = Some(strip_ticks(v)).filter(|c| !c.is_empty());
                }
                Some((k, v)) if k.trim().eq_ignore_ascii_case("criteria") => {
                    self.criteria = Some(v.trim().to_string()).filter(|c| !c.is_empty());
                }
                _ => {}
            },
            Section::SuccessCriteria => self.success_criteria.push(item.to_string()),
        }
        Ok(())
    }

    fn finish(self) -> Result<Deliverable> {
        let n = Some(self.number);
        let required = |field: Option<String>, name: &str| {
            field
                .filter(|v| !v.is_empty())
                .ok_or_else(|| schema(n, format!("missing metadata field '{name}'")))
        };
        let change_type = required(self.change_type, "change_type")?
            .parse::<ChangeType>()
            .map_err(|e| schema(n, e.to_string()))?;
        let execution_mode = match self.execution_mode.filter(|v| !v.is_empty()) {
            Some(v) => v.parse().map_err(|e: PmwError| schema(n, e.to_string()))?,
            None => ExecutionMode::Automated,
        };
        let domain = required(self.domain, "domain")?;
        let module = required(self.module, "module")?;
        let depends = parse_depends(self.depends.as_deref().unwrap_or("none"))
            .map_err(|reason| schema(n, reason))?;
        let profiles = self
            .profiles
            .iter()
            .map(|p| p.parse::<Profile>().map_err(|e| schema(n, e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Deliverable {
            number: self.number,
            title: self.title,
            change_type,
            execution_mode,
            domain,
            module,
            profiles,
            depends,
            affected_files: self.affected_files,
            changes: self.changes,
            verification: DeliverableVerification {
                command: self.command,
                criteria: self.criteria,
            },
            success_criteria: self.success_criteria,
        })
    }
}

/// `none`, empty, or a comma-separated list such as `1, 2` or `D1, D3`.
fn parse_depends(value: &str) -> std::result::Result<Vec<u32>, String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") || value == "-" {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in value.split(',') {
        let raw = part.trim().trim_start_matches(['D', 'd', '#']);
        let n: u32 = raw
            .parse()
            .map_err(|_| format!("invalid dependency reference '{}'", part.trim()))?;
        if !out.contains(&n) {
            out.push(n);
        }
    }
    Ok(out)
}

impl SolutionOutline {
    pub fn parse(markdown: &str) -> Result<Self> {
        let mut title = String::new();
        let mut summary: Vec<&str> = Vec::new();
        let mut in_summary = false;
        let mut deliverables = Vec::new();
        let mut draft: Option<Draft> = None;
        let mut section = Section::None;

        for raw in markdown.lines() {
            let line = raw.trim();

            if let Some(rest) = line.strip_prefix("### ") {
                let caps = heading_re()
                    .captures(line)
                    .ok_or_else(|| schema(None, format!("malformed deliverable heading '### {rest}'")))?;
                let number: u32 = caps[1]
                    .parse()
                    .map_err(|_| schema(None, format!("bad deliverable number in '{line}'")))?;
                if let Some(d) = draft.take() {
                    deliverables.push(d.finish()?);
                }
                let expected = deliverables.len() as u32 + 1;
                if number != expected {
                    return Err(schema(
                        None,
                        format!("deliverable headings must be sequential: expected {expected}, found {number}"),
                    ));
                }
                draft = Some(Draft {
                    number,
                    title: caps[2].to_string(),
                    ..Draft::default()
                });
                section = Section::None;
                in_summary = false;
                continue;
            }

            if let Some(rest) = line.strip_prefix("## ") {
                if let Some(d) = draft.take() {
                    deliverables.push(d.finish()?);
                }
                in_summary = rest.trim().eq_ignore_ascii_case("summary");
                section = Section::None;
                continue;
            }

            if let Some(rest) = line.strip_prefix("# ") {
                if title.is_empty() {
                    let rest = rest.trim();
                    title = rest
                        .strip_prefix("Solution Outline:")
                        .unwrap_or(rest)
                        .trim()
                        .to_string();
                }
                continue;
            }

            let Some(d) = draft.as_mut() else {
                if in_summary && !line.is_empty() {
                    summary.push(line);
                }
                continue;
            };

            if let Some(caps) = label_re().captures(line) {
                if let Some(s) = section_for(&caps[1]) {
                    section = s;
                    let inline = caps[2].trim();
                    if !inline.is_empty() {
                        d.push(section, inline)?;
                    }
                    continue;
                }
            }

            if let Some(item) = bullet(line) {
                d.push(section, item)?;
            }
        }

        if let Some(d) = draft.take() {
            deliverables.push(d.finish()?);
        }

        Ok(Self {
            title,
            summary: summary.join("\n"),
            deliverables,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Solution Outline: {}\n", self.title);
        if !self.summary.is_empty() {
            let _ = writeln!(out, "## Summary\n\n{}\n", self.summary);
        }
        out.push_str("## Deliverables\n");
        for d in &self.deliverables {
            let _ = writeln!(out, "\n### {}. {}\n", d.number, d.title);
            out.push_str("**Metadata:**\n");
            let _ = writeln!(out, "- change_type: {}", d.change_type);
            let _ = writeln!(out, "- execution_mode: {}", d.execution_mode);
            let _ = writeln!(out, "- domain: {}", d.domain);
            let _ = writeln!(out, "- module: {}", d.module);
            let depends = if d.depends.is_empty() {
                "none".to_string()
            } else {
                d.depends
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let _ = writeln!(out, "- depends: {depends}\n");

            out.push_str("**Profiles:**\n");
            for p in &d.profiles {
                let _ = writeln!(out, "- {p}");
            }
            out.push_str("\n**Affected files:**\n");
            for f in &d.affected_files {
                let _ = writeln!(out, "- `{f}`");
            }
            if !d.changes.is_empty() {
                out.push_str("\n**Change per file:**\n");
                for c in &d.changes {
                    let _ = writeln!(out, "- {c}");
                }
            }
            out.push_str("\n**Verification:**\n");
            if let Some(cmd) = &d.verification.command {
                let _ = writeln!(out, "- Command: `{cmd}`");
            }
            if let Some(criteria) = &d.verification.criteria {
                let _ = writeln!(out, "- Criteria: {criteria}");
            }
            if !d.success_criteria.is_empty() {
                out.push_str("\n**Success Criteria:**\n");
                for c in &d.success_criteria {
                    let _ = writeln!(out, "- {c}");
                }
            }
        }
        out
    }

    pub fn exists(root: &Path, plan_id: &str) -> bool {
        paths::outline_path(root, plan_id).exists()
    }

    pub fn load(root: &Path, plan_id: &str) -> Result<Self> {
        let path = paths::outline_path(root, plan_id);
        if !path.exists() {
            return Err(PmwError::MissingArtifact {
                artifact: ARTIFACT.to_string(),
                plan: plan_id.to_string(),
                producer: "outline".to_string(),
            });
        }
        let text = std::fs::read_to_string(&path)?;
        Self::parse(&text)
    }

    pub fn save(&self, root: &Path, plan_id: &str) -> Result<()> {
        crate::io::atomic_write(&paths::outline_path(root, plan_id), self.render().as_bytes())
    }

    pub fn deliverable(&self, number: u32) -> Option<&Deliverable> {
        self.deliverables.iter().find(|d| d.number == number)
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for d in &self.deliverables {
            g.add_node(&d.number.to_string());
        }
        for d in &self.deliverables {
            for dep in &d.depends {
                g.add_edge(&d.number.to_string(), &dep.to_string());
            }
        }
        g
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Structural checks against the plan's configured domains. With
    /// `expected_count`, the number of deliverables must match exactly.
    pub fn validate(&self, domains: &[String], expected_count: Option<usize>) -> Result<()> {
        if self.deliverables.is_empty() {
            return Err(schema(None, "outline contains no deliverables"));
        }
        if let Some(expected) = expected_count {
            if expected != self.deliverables.len() {
                return Err(PmwError::CountMismatch {
                    what: "deliverables".to_string(),
                    expected,
                    actual: self.deliverables.len(),
                });
            }
        }

        for d in &self.deliverables {
            let n = Some(d.number);
            if d.profiles.is_empty() {
                return Err(schema(n, "at least one profile is required"));
            }
            if d.domain == SYSTEM_DOMAIN {
                return Err(schema(n, "the 'system' domain cannot own a deliverable"));
            }
            if !domains.iter().any(|k| k == &d.domain) {
                return Err(PmwError::UnknownDomain(format!(
                    "{} (deliverable {} of {ARTIFACT}; plan domains: {})",
                    d.domain,
                    d.number,
                    domains.join(", ")
                )));
            }
            if d.affected_files.is_empty() && d.change_type != ChangeType::Analysis {
                return Err(schema(n, "affected files must list at least one file"));
            }
            for f in &d.affected_files {
                paths::check_file_path(f)
                    .map_err(|reason| schema(n, format!("affected file '{f}': {reason}")))?;
            }
            for dep in &d.depends {
                if self.deliverable(*dep).is_none() {
                    return Err(schema(n, format!("depends on unknown deliverable {dep}")));
                }
            }
        }

        self.dependency_graph().ensure_acyclic("deliverables")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::HEALTH_OUTLINE;
    use tempfile::TempDir;

    fn domains() -> Vec<String> {
        vec!["java".to_string()]
    }

    #[test]
    fn parses_deliverables() {
        let outline = SolutionOutline::parse(HEALTH_OUTLINE).unwrap();
        assert_eq!(outline.title, "Health check");
        assert_eq!(outline.summary, "Expose a health-check endpoint.");
        assert_eq!(outline.deliverables.len(), 2);
        let d1 = &outline.deliverables[0];
        assert_eq!(d1.profiles, vec![Profile::Implementation, Profile::ModuleTesting]);
        assert_eq!(d1.affected_files[0], "src/main/java/Health.java");
        assert_eq!(d1.verification.command.as_deref(), Some("mvn -q test"));
        let d2 = &outline.deliverables[1];
        assert_eq!(d2.depends, vec![1]);
        assert_eq!(d2.execution_mode, ExecutionMode::Automated);
        outline.validate(&domains(), Some(2)).unwrap();
    }

    #[test]
    fn render_parses_back_to_same_outline() {
        let outline = SolutionOutline::parse(HEALTH_OUTLINE).unwrap();
        let again = SolutionOutline::parse(&outline.render()).unwrap();
        assert_eq!(outline, again);
    }

    #[test]
    fn non_sequential_heading_is_schema_violation() {
        let md = HEALTH_OUTLINE.replace("### 2.", "### 3.");
        let err = SolutionOutline::parse(&md).unwrap_err();
        assert!(err.to_string().contains("sequential"));
    }

    #[test]
    fn missing_module_is_schema_violation() {
        let md = HEALTH_OUTLINE.replace("- module: api-service\n- depends: 1", "- depends: 1");
        let err = SolutionOutline::parse(&md).unwrap_err();
        assert!(matches!(err, PmwError::SchemaViolation { .. }));
        assert!(err.to_string().contains("deliverable 2"));
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let md = HEALTH_OUTLINE.replace("- depends: none", "- depends: 2");
        let outline = SolutionOutline::parse(&md).unwrap();
        let err = outline.validate(&domains(), None).unwrap_err();
        assert!(matches!(err, PmwError::Cycle { .. }));
        assert_eq!(err.to_string(), "dependency cycle in deliverables: 1 -> 2 -> 1");
    }

    #[test]
    fn system_and_unknown_domains_are_rejected() {
        let md = HEALTH_OUTLINE.replacen("domain: java", "domain: system", 1);
        let outline = SolutionOutline::parse(&md).unwrap();
        assert!(outline.validate(&domains(), None).is_err());

        let outline = SolutionOutline::parse(HEALTH_OUTLINE).unwrap();
        assert!(matches!(
            outline.validate(&["python".to_string()], None),
            Err(PmwError::UnknownDomain(_))
        ));
    }

    #[test]
    fn free_text_affected_file_is_rejected() {
        let md = HEALTH_OUTLINE.replace("- `docs/health.md`", "- Update the docs");
        let outline = SolutionOutline::parse(&md).unwrap();
        assert!(outline.validate(&domains(), None).is_err());
    }

    #[test]
    fn count_mismatch() {
        let outline = SolutionOutline::parse(HEALTH_OUTLINE).unwrap();
        assert!(matches!(
            outline.validate(&domains(), Some(3)),
            Err(PmwError::CountMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn empty_outline_is_invalid() {
        let outline = SolutionOutline::parse("# Solution Outline: nothing\n").unwrap();
        assert!(outline.validate(&domains(), None).is_err());
    }

    #[test]
    fn load_missing_is_missing_artifact() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SolutionOutline::load(dir.path(), "demo"),
            Err(PmwError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let outline = SolutionOutline::parse(HEALTH_OUTLINE).unwrap();
        outline.save(dir.path(), "demo").unwrap();
        assert_eq!(SolutionOutline::load(dir.path(), "demo").unwrap(), outline);
    }
}
