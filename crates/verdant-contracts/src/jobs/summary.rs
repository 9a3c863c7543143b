use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{JobStatus, StepResult, StepStatus};
use crate::events::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: u32,
    pub original: String,
    pub replacement: String,
    pub status: StepStatus,
    pub attempts: u64,
    pub candidates: u64,
    pub winner_label: Option<String>,
    pub winner_score: Option<f64>,
}

impl StepSummary {
    pub fn from_result(result: &StepResult) -> Self {
        Self {
            step: result.step,
            original: result.original.clone(),
            replacement: result.replacement.clone(),
            status: result.status,
            attempts: result.attempts.len() as u64,
            candidates: result
                .attempts
                .iter()
                .map(|attempt| attempt.candidates.len() as u64)
                .sum(),
            winner_label: result.winner.as_ref().map(|winner| winner.label.clone()),
            winner_score: result.winner.as_ref().map(|winner| winner.score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub started_at: String,
    pub finished_at: String,
    pub total_steps: u64,
    pub succeeded_steps: u64,
    pub steps: Vec<StepSummary>,
}

impl JobSummary {
    pub fn headline(&self) -> String {
        format!(
            "{}/{} edits passed verification",
            self.succeeded_steps, self.total_steps
        )
    }
}

pub fn write_summary(
    path: &Path,
    summary: &JobSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("headline".to_string(), Value::String(summary.headline()));
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}
