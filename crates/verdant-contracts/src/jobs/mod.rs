pub mod receipts;
pub mod summary;

use serde::{Deserialize, Serialize};

use crate::edits::VerificationMode;
use crate::regions::EllipseRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub ts: String,
    pub level: LogLevel,
    pub message: String,
}

/// One scored image from a single generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Attempt number followed by a letter, e.g. `2B`.
    pub label: String,
    pub step: u32,
    pub attempt: u32,
    pub score: f64,
    pub passed: bool,
    pub threshold: f64,
    pub mode: VerificationMode,
    pub sha256: String,
    #[serde(default)]
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationFailureKind {
    /// Network, HTTP status or payload failure.
    Transport,
    /// The service answered but returned no images.
    Empty,
}

impl GenerationFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed {
        label: String,
    },
    NoPassingCandidate,
    GenerationFailed {
        failure: GenerationFailureKind,
        message: String,
    },
}

impl AttemptOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Region the mask was drawn from, after earlier adjustments.
    pub region: EllipseRegion,
    pub candidates: Vec<CandidateRecord>,
    pub outcome: AttemptOutcome,
    pub logs: Vec<LogLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceptance {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// 1-based position in the chain.
    pub step: u32,
    pub original: String,
    pub replacement: String,
    pub status: StepStatus,
    pub attempts: Vec<AttemptRecord>,
    pub winner: Option<CandidateRecord>,
    pub acceptance: Option<Acceptance>,
    /// Digest of the working image this step started from.
    pub input_sha256: String,
    /// Digest of the working image handed to the next step.
    pub output_sha256: Option<String>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Point-in-time copy of a job, safe to hand to any observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub total_steps: u32,
    pub current_step: u32,
    pub current_attempt: u32,
    pub results: Vec<StepResult>,
    pub logs: Vec<LogLine>,
    pub live_candidates: Vec<CandidateRecord>,
    pub pending_selection: bool,
    pub selected_candidate: Option<String>,
    pub error: Option<String>,
    pub final_image_path: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl JobSnapshot {
    pub fn succeeded_steps(&self) -> usize {
        self.results.iter().filter(|step| step.succeeded()).count()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AttemptOutcome, GenerationFailureKind, JobStatus};

    #[test]
    fn attempt_outcome_serializes_with_kind_tag() -> anyhow::Result<()> {
        let outcome = AttemptOutcome::GenerationFailed {
            failure: GenerationFailureKind::Empty,
            message: "no images".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&outcome)?,
            json!({"kind": "generation_failed", "failure": "empty", "message": "no images"})
        );
        assert_eq!(
            serde_json::to_value(AttemptOutcome::NoPassingCandidate)?,
            json!({"kind": "no_passing_candidate"})
        );
        Ok(())
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }
}
