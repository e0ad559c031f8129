use std::fmt;

const LAST_LINE_MAX_CHARS: usize = 60;

/// Classified failure vocabulary shown to operators in place of raw tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    SourceFilesMissing,
    CannotDownloadSource,
    AccessDenied,
    InvalidParameter,
    PendingReboot,
    NoBatteryDetected,
    NoBatteryLibrary,
    /// A line from the tool output carrying an `error:` marker, trimmed.
    ToolError(String),
    /// Last non-blank output line, already truncated.
    ToolOutput(String),
    Unknown,
    AdminRequired,
    /// The program could not be started at all.
    Launch(String),
}

impl Failure {
    /// Ordered rule list: the first match wins, and the order is part of the contract.
    pub fn from_output(raw: &str) -> Self {
        let lower = raw.to_lowercase();

        if lower.contains("0x800f081f") {
            return Self::SourceFilesMissing;
        }
        if lower.contains("0x800f0906") {
            return Self::CannotDownloadSource;
        }
        if lower.contains("access is denied") || lower.contains("error: 5") {
            return Self::AccessDenied;
        }
        if lower.contains("error: 87") {
            return Self::InvalidParameter;
        }
        if lower.contains("3017") {
            return Self::PendingReboot;
        }
        if lower.contains("0x10d2") || lower.contains("no battery") {
            return Self::NoBatteryDetected;
        }
        if lower.contains("unable to perform operation") && lower.contains("library") {
            return Self::NoBatteryLibrary;
        }

        if let Some(line) = raw
            .lines()
            .find(|line| line.to_lowercase().contains("error:"))
        {
            return Self::ToolError(line.trim().to_string());
        }

        match raw.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
            Some(line) => Self::ToolOutput(truncate_chars(line, LAST_LINE_MAX_CHARS)),
            None => Self::Unknown,
        }
    }

    /// Hardware-absence conditions: the check does not apply to this machine.
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, Self::NoBatteryDetected | Self::NoBatteryLibrary)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceFilesMissing => f.write_str("Source Files Missing"),
            Self::CannotDownloadSource => f.write_str("Cannot Download Source Files"),
            Self::AccessDenied => f.write_str("Access Denied (Run as Admin)"),
            Self::InvalidParameter => f.write_str("Invalid Parameter"),
            Self::PendingReboot => f.write_str("PENDING REBOOT (Restart PC & Try Again)"),
            Self::NoBatteryDetected => f.write_str("Not a Laptop (No Battery Detected)"),
            Self::NoBatteryLibrary => f.write_str("Not a Laptop (No Battery)"),
            Self::ToolError(line) => f.write_str(line),
            Self::ToolOutput(line) => write!(f, "Failed: {line}"),
            Self::Unknown => f.write_str("Failed: Unknown Error"),
            Self::AdminRequired => f.write_str("Administrator privileges required."),
            Self::Launch(err) => f.write_str(err),
        }
    }
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
