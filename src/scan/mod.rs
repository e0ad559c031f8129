pub mod checks;
pub mod classify;
pub mod consent;
pub mod orchestrator;
pub mod privilege;
pub mod runner;

use classify::Failure;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// What a check action reports back: a display-ready success message or a classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    Passed(String),
    Failed(Failure),
}

#[cfg(test)]
impl CheckResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Passed(_))
    }

    pub fn message(&self) -> String {
        match self {
            Self::Passed(message) => message.clone(),
            Self::Failed(failure) => failure.to_string(),
        }
    }
}

pub type CheckAction = Box<dyn Fn() -> CheckResult + Send + Sync>;

/// One named step of a full scan.
pub struct ScanCheck {
    pub name: String,
    pub requires_confirmation: bool,
    /// The step restarts the machine; implies confirmation.
    pub requires_reboot: bool,
    action: CheckAction,
}

impl ScanCheck {
    pub fn new(
        name: impl Into<String>,
        action: impl Fn() -> CheckResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            requires_confirmation: false,
            requires_reboot: false,
            action: Box::new(action),
        }
    }

    #[cfg(test)]
    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn rebooting(mut self) -> Self {
        self.requires_reboot = true;
        self.requires_confirmation = true;
        self
    }

    pub fn run(&self) -> CheckResult {
        (self.action)()
    }

    pub fn consent_prompt(&self) -> String {
        if self.requires_reboot {
            format!(
                "The check '{}' requires a system restart.\n\nDo you want to proceed knowing your PC will reboot?",
                self.name
            )
        } else {
            format!("Do you want to run '{}'?", self.name)
        }
    }
}

impl fmt::Debug for ScanCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCheck")
            .field("name", &self.name)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("requires_reboot", &self.requires_reboot)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum CheckOutcome {
    Pending,
    Running,
    Succeeded(String),
    Failed(String),
    SkippedNoConsent,
    SkippedNotApplicable,
}

impl CheckOutcome {
    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::SkippedNoConsent => "skipped_no_consent",
            Self::SkippedNotApplicable => "skipped_not_applicable",
        }
    }

    pub fn display_text(&self) -> String {
        match self {
            Self::Pending => "Pending".to_string(),
            Self::Running => "Running...".to_string(),
            Self::Succeeded(message) | Self::Failed(message) => message.clone(),
            Self::SkippedNoConsent => "Skipped by User".to_string(),
            Self::SkippedNotApplicable => "Skipped (Not a Laptop)".to_string(),
        }
    }

    pub fn color(&self) -> ColorHint {
        match self {
            Self::Pending => ColorHint::Neutral,
            Self::Running => ColorHint::Busy,
            Self::Succeeded(_) => ColorHint::Positive,
            Self::Failed(_) => ColorHint::Negative,
            Self::SkippedNoConsent | Self::SkippedNotApplicable => ColorHint::Caution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorHint {
    Neutral,
    Busy,
    Positive,
    Caution,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckStatus {
    pub name: String,
    pub outcome: CheckOutcome,
    pub message: String,
    pub color: ColorHint,
}

impl CheckStatus {
    pub fn new(name: impl Into<String>, outcome: CheckOutcome) -> Self {
        Self {
            name: name.into(),
            message: outcome.display_text(),
            color: outcome.color(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub checks: Vec<CheckStatus>,
    pub elapsed_ms: u64,
}

impl PassSummary {
    pub fn count(&self, label: &str) -> usize {
        self.checks
            .iter()
            .filter(|c| c.outcome.label() == label)
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.count("failed") > 0
    }
}

/// Status stream of one orchestrator, delivered in order.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    PassStarted { checks: Vec<CheckStatus> },
    Check(CheckStatus),
    PassFinished(PassSummary),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("administrator privileges are required to run a full scan")]
    AdminRequired,
    #[error("a full scan is already running")]
    AlreadyRunning,
    #[error("scan check name '{0}' must be unique")]
    DuplicateCheck(String),
}
