use crate::error::PmwError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Refine,
    Outline,
    Plan,
    Execute,
    Verify,
    Finalize,
    Complete,
    Aborted,
    Failed,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Init,
            Phase::Refine,
            Phase::Outline,
            Phase::Plan,
            Phase::Execute,
            Phase::Verify,
            Phase::Finalize,
            Phase::Complete,
            Phase::Aborted,
            Phase::Failed,
        ]
    }

    /// The forward lifecycle, excluding the two abnormal terminals.
    pub fn lifecycle() -> &'static [Phase] {
        &Phase::all()[..8]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Phase> {
        if self.is_terminal() {
            return None;
        }
        Phase::lifecycle().get(self.index() + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Aborted | Phase::Failed)
    }

    /// Phases that run a handler (everything but the terminals).
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Refine => "refine",
            Phase::Outline => "outline",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Verify => "verify",
            Phase::Finalize => "finalize",
            Phase::Complete => "complete",
            Phase::Aborted => "aborted",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PmwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PmwError::InvalidPhase(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// String-backed enums
// ---------------------------------------------------------------------------

/// Closed vocabulary enums stored as plain strings in artifacts and accepted
/// verbatim on the command line.
macro_rules! str_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($field:literal) {
            $($variant:ident => $s:literal $(| $alias:literal)*),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $s $(, alias = $alias)*)]
                $variant,
            )+
        }

        impl $name {
            pub fn all() -> &'static [$name] {
                &[$($name::$variant),+]
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = PmwError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s $(| $alias)* => Ok($name::$variant),)+
                    _ => Err(PmwError::InvalidValue {
                        field: $field.to_string(),
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

str_enum! {
    /// How aggressively a plan may change public contracts.
    Compatibility ("compatibility") {
        Breaking => "breaking",
        Deprecation => "deprecation",
        SmartAndAsk => "smart_and_ask" | "smart-and-ask",
    }
}

impl Default for Compatibility {
    fn default() -> Self {
        Compatibility::Breaking
    }
}

str_enum! {
    /// The kind of work a task performs.
    Profile ("profile") {
        Implementation => "implementation",
        ModuleTesting => "module_testing" | "module-testing",
        IntegrationTesting => "integration_testing" | "integration-testing",
    }
}

impl Profile {
    /// Suffix used in task ids: `TASK-001-IMPL`.
    pub fn task_suffix(self) -> &'static str {
        match self {
            Profile::Implementation => "IMPL",
            Profile::ModuleTesting => "TEST",
            Profile::IntegrationTesting => "ITEST",
        }
    }

    pub fn is_testing(self) -> bool {
        !matches!(self, Profile::Implementation)
    }

    /// Module command kind used as the default verification for this profile.
    pub fn command_kind(self) -> &'static str {
        match self {
            Profile::Implementation => "compile",
            Profile::ModuleTesting => "module-tests",
            Profile::IntegrationTesting => "integration-tests",
        }
    }
}

str_enum! {
    ChangeType ("change_type") {
        Feature => "feature",
        Enhancement => "enhancement",
        BugFix => "bug_fix" | "bugfix",
        TechDebt => "tech_debt" | "tech-debt",
        Analysis => "analysis",
        Verification => "verification",
        Documentation => "documentation",
    }
}

str_enum! {
    ExecutionMode ("execution_mode") {
        Automated => "automated",
        Manual => "manual",
        Mixed => "mixed",
    }
}

str_enum! {
    TaskStatus ("task status") {
        Pending => "pending",
        InProgress => "in_progress" | "in-progress",
        Done => "done",
        Blocked => "blocked",
    }
}

str_enum! {
    StepStatus ("step status") {
        Pending => "pending",
        Done => "done",
        Skipped => "skipped",
    }
}

str_enum! {
    TaskOrigin ("origin") {
        Plan => "plan",
        Fix => "fix",
    }
}

str_enum! {
    Severity ("severity") {
        Error => "error",
        Warning => "warning",
        Info => "info",
    }
}

str_enum! {
    Priority ("priority") {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

impl From<Severity> for Priority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Error => Priority::High,
            Severity::Warning => Priority::Medium,
            Severity::Info => Priority::Low,
        }
    }
}

str_enum! {
    Resolution ("resolution") {
        Pending => "pending",
        Fixed => "fixed",
        Suppressed => "suppressed",
        Accepted => "accepted",
        TakenIntoAccount => "taken_into_account" | "taken-into-account",
    }
}

impl Resolution {
    pub fn is_resolved(self) -> bool {
        !matches!(self, Resolution::Pending)
    }
}

str_enum! {
    FindingType ("finding type") {
        Bug => "bug",
        Improvement => "improvement",
        AntiPattern => "anti-pattern",
        Tip => "tip",
        Insight => "insight",
        BestPractice => "best-practice",
        LintIssue => "lint-issue",
        BuildError => "build-error",
        TestFailure => "test-failure",
        SonarIssue => "sonar-issue",
        PrComment => "pr-comment",
        CiFailure => "ci-failure",
    }
}

str_enum! {
    /// Rule family of a finding; drives triage bias.
    RuleCategory ("category") {
        Security => "security",
        Bug => "bug",
        CodeSmell => "code_smell" | "code-smell",
        Style => "style",
        Performance => "performance",
        Other => "other",
    }
}

impl FindingType {
    /// Category assumed when a finding does not carry one explicitly.
    pub fn default_category(self) -> RuleCategory {
        match self {
            FindingType::Bug
            | FindingType::BuildError
            | FindingType::TestFailure
            | FindingType::CiFailure => RuleCategory::Bug,
            FindingType::LintIssue => RuleCategory::Style,
            FindingType::SonarIssue | FindingType::AntiPattern => RuleCategory::CodeSmell,
            _ => RuleCategory::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
