use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-plan pointers into the outside world plus the running list of files
/// modified by task execution, which scopes later verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct References {
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_system: Option<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
}

impl References {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            ..Self::default()
        }
    }

    /// Appends files not yet tracked, keeping first-seen order. Returns how
    /// many were new.
    pub fn track_files<I, S>(&mut self, files: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for f in files {
            let f = f.as_ref();
            if !f.is_empty() && !self.modified_files.iter().any(|m| m == f) {
                self.modified_files.push(f.to_string());
                added += 1;
            }
        }
        added
    }

    /// Missing file yields an empty record for the plan.
    pub fn load(root: &Path, plan_id: &str) -> Result<Self> {
        let path = paths::references_path(root, plan_id);
        Ok(crate::io::read_yaml_optional(&path, "references")?
            .unwrap_or_else(|| Self::new(plan_id)))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        crate::io::write_yaml(&paths::references_path(root, &self.plan_id), self)
    }
}
