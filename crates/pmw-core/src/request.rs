use crate::error::{PmwError, Result};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where the work request came from. Exactly one source per plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestSource {
    Description,
    Lesson { id: String },
    Issue { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub text: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub plan_id: String,
    pub source: RequestSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Verbatim request text; never rewritten.
    pub original: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clarifications: Vec<Clarification>,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(plan_id: impl Into<String>, source: RequestSource, original: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            source,
            title: None,
            original: original.into(),
            clarifications: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn description(plan_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(plan_id, RequestSource::Description, text)
    }

    /// Builds a request from whichever single source was supplied.
    pub fn from_sources(
        plan_id: &str,
        description: Option<String>,
        lesson: Option<String>,
        issue: Option<String>,
    ) -> Result<Self> {
        let req = match (description, lesson, issue) {
            (Some(text), None, None) => Self::description(plan_id, text),
            (None, Some(id), None) => {
                let text = format!("Apply lesson {id}");
                Self::new(plan_id, RequestSource::Lesson { id }, text)
            }
            (None, None, Some(url)) => {
                let text = format!("Resolve issue {url}");
                Self::new(plan_id, RequestSource::Issue { url }, text)
            }
            (d, l, i) => {
                let given = [d.is_some(), l.is_some(), i.is_some()]
                    .into_iter()
                    .filter(|b| *b)
                    .count();
                return Err(PmwError::InvalidValue {
                    field: "request source".to_string(),
                    value: format!(
                        "{given} sources given; exactly one of description, lesson, issue is required"
                    ),
                });
            }
        };
        Ok(req)
    }

    pub fn clarify(&mut self, text: impl Into<String>) {
        self.clarifications.push(Clarification {
            text: text.into(),
            added_at: Utc::now(),
        });
    }

    pub fn is_clarified(&self) -> bool {
        !self.clarifications.is_empty()
    }

    /// Original text followed by every clarification.
    pub fn full_text(&self) -> String {
        let mut out = self.original.clone();
        for c in &self.clarifications {
            out.push_str("\n\n");
            out.push_str(&c.text);
        }
        out
    }

    pub fn exists(root: &Path, plan_id: &str) -> bool {
        paths::request_path(root, plan_id).exists()
    }

    pub fn load(root: &Path, plan_id: &str) -> Result<Self> {
        let path = paths::request_path(root, plan_id);
        if !path.exists() {
            return Err(PmwError::MissingArtifact {
                artifact: "request".to_string(),
                plan: plan_id.to_string(),
                producer: "init".to_string(),
            });
        }
        crate::io::read_yaml(&path, "request")
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        crate::io::write_yaml(&paths::request_path(root, &self.plan_id), self)
    }
}
