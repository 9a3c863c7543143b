use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use verdant_contracts::edits::EditSpec;
use verdant_contracts::jobs::summary::{write_summary, JobSummary, StepSummary};
use verdant_contracts::jobs::{JobStatus, LogLevel, StepResult, StepStatus};
use verdant_contracts::settings::{ChainPolicy, ChainSettings};

use crate::controller::{RetryController, StepInput};
use crate::imaging::{
    decode_image, encode_jpeg, extension_for_mime, prepare_next_input, sha256_hex, sniff_mime,
};
use crate::job::JobHandle;
use crate::providers::{error_chain_text, GenerationClient, ImagePayload};

#[derive(Debug, Clone)]
pub struct ChainStep {
    pub edit: EditSpec,
    /// Reference photos sent after the masked canvas.
    pub references: Vec<ImagePayload>,
}

impl ChainStep {
    pub fn new(edit: EditSpec) -> Self {
        Self {
            edit,
            references: Vec::new(),
        }
    }

    pub fn with_reference(mut self, reference: ImagePayload) -> Self {
        self.references.push(reference);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChainInput {
    pub source: Vec<u8>,
    pub steps: Vec<ChainStep>,
    pub instruction_template: String,
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub status: JobStatus,
    pub results: Vec<StepResult>,
    pub final_image: Vec<u8>,
    pub final_image_path: Option<PathBuf>,
    /// Accepted candidate bytes per finished step, aligned with `results`.
    pub accepted_images: Vec<Option<Vec<u8>>>,
    /// Step that stopped the chain under the halt policy.
    pub halted_at: Option<u32>,
}

/// Applies edits one after another, each to the previous step's output.
pub struct EditChain {
    client: Arc<dyn GenerationClient>,
    settings: ChainSettings,
}

impl EditChain {
    pub fn new(client: Arc<dyn GenerationClient>, settings: ChainSettings) -> Self {
        Self {
            client,
            settings: settings.normalized(),
        }
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Runs the whole chain and leaves `job` in a terminal state.
    ///
    /// Unexpected failures become status `error`; they are never returned.
    pub fn run(&self, job: &JobHandle, input: ChainInput) -> Option<ChainOutcome> {
        match self.run_steps(job, input) {
            Ok(outcome) => {
                job.finish(outcome.status, None, outcome.final_image_path.as_deref());
                Some(outcome)
            }
            Err(err) => {
                let message = error_chain_text(&err, 1024);
                let _ = job.log(LogLevel::Error, format!("Job failed: {message}"));
                job.finish(JobStatus::Error, Some(message), None);
                None
            }
        }
    }

    fn run_steps(&self, job: &JobHandle, input: ChainInput) -> Result<ChainOutcome> {
        let ChainInput {
            source,
            steps,
            instruction_template,
        } = input;
        let total = steps.len();
        job.emit(
            "job_started",
            json!({
                "total_steps": total,
                "provider": self.client.name(),
                "max_retries": self.settings.max_retries,
                "policy": self.settings.policy.as_str(),
            }),
        )?;
        job.log(
            LogLevel::Info,
            format!(
                "Starting plant replacement: {total} edits, up to {} attempts each",
                self.settings.max_retries
            ),
        )?;
        for (index, step) in steps.iter().enumerate() {
            step.edit
                .validate()
                .with_context(|| format!("edit {} is malformed", index + 1))?;
        }
        decode_image(&source).context("source image could not be decoded")?;
        write_output(
            job,
            &format!("ORIGINAL.{}", extension_for_mime(sniff_mime(&source))),
            &source,
        )?;

        let controller = RetryController::new(self.client.as_ref(), &self.settings, job);
        let mut working = source;
        let mut status = JobStatus::Completed;
        let mut halted_at = None;
        let mut results = Vec::with_capacity(total);
        let mut accepted_images = Vec::with_capacity(total);

        for (index, step) in steps.iter().enumerate() {
            let number = index as u32 + 1;
            if job.is_cancelled() || (index > 0 && !job.pause(self.settings.step_delay())) {
                status = JobStatus::Cancelled;
                break;
            }
            job.begin_step(number);
            job.emit(
                "step_started",
                json!({
                    "step": number,
                    "original": step.edit.original,
                    "replacement": step.edit.replacement,
                }),
            )?;
            job.log(
                LogLevel::Info,
                format!("Step {number}/{total}: {}", step.edit.label()),
            )?;

            let mut outcome = controller.run_step(StepInput {
                step: number,
                edit: &step.edit,
                image: &working,
                references: &step.references,
                instruction_template: &instruction_template,
            })?;

            let step_status = outcome.result.status;
            let accepted = outcome.accepted.take();
            match (step_status, accepted.as_deref()) {
                (StepStatus::Succeeded, Some(accepted)) => {
                    working = prepare_next_input(
                        accepted,
                        self.settings.max_input_width,
                        self.settings.jpeg_quality,
                    )
                    .with_context(|| format!("step {number} output could not be re-encoded"))?;
                }
                (StepStatus::Cancelled, _) => {
                    status = JobStatus::Cancelled;
                }
                _ => {}
            }
            accepted_images.push(accepted);
            outcome.result.output_sha256 = Some(sha256_hex(&working));
            job.emit(
                "step_finished",
                json!({
                    "step": number,
                    "status": step_status,
                    "attempts": outcome.result.attempts.len(),
                    "winner": outcome.result.winner.as_ref().map(|winner| winner.label.clone()),
                }),
            )?;
            job.push_result(outcome.result.clone());
            results.push(outcome.result);

            if status == JobStatus::Cancelled {
                break;
            }
            if step_status == StepStatus::Failed {
                if self.settings.policy == ChainPolicy::Halt {
                    job.log(
                        LogLevel::Error,
                        format!("Halting chain after step {number} failed"),
                    )?;
                    halted_at = Some(number);
                    break;
                }
                job.log(
                    LogLevel::Warning,
                    format!("Skipping step {number}; continuing with the unchanged image"),
                )?;
            }
        }
        if status == JobStatus::Cancelled {
            job.log(LogLevel::Warning, "Job cancelled")?;
        }

        let final_image = encode_jpeg(&decode_image(&working)?, self.settings.jpeg_quality)?;
        let final_image_path = write_output(job, "FINAL.jpg", &final_image)?;
        let succeeded = results.iter().filter(|result| result.succeeded()).count();
        job.log(
            LogLevel::Success,
            format!("{succeeded}/{total} edits passed verification"),
        )?;
        if let Some(dir) = job.out_dir() {
            let snapshot = job.snapshot();
            let summary = JobSummary {
                job_id: job.id().to_string(),
                status,
                started_at: snapshot.started_at,
                finished_at: verdant_contracts::events::now_utc_iso(),
                total_steps: total as u64,
                succeeded_steps: succeeded as u64,
                steps: results.iter().map(StepSummary::from_result).collect(),
            };
            let mut extra = Map::new();
            extra.insert("provider".to_string(), Value::String(self.client.name().to_string()));
            extra.insert("policy".to_string(), Value::String(self.settings.policy.as_str().to_string()));
            if let Some(path) = final_image_path.as_ref() {
                extra.insert(
                    "final_image".to_string(),
                    Value::String(path.to_string_lossy().to_string()),
                );
            }
            if let Some(step) = halted_at {
                extra.insert("halted_at".to_string(), Value::from(step));
            }
            write_summary(&dir.join("summary.json"), &summary, Some(&extra))?;
        }

        Ok(ChainOutcome {
            status,
            results,
            final_image,
            final_image_path,
            accepted_images,
            halted_at,
        })
    }
}

fn write_output(job: &JobHandle, name: &str, bytes: &[u8]) -> Result<Option<PathBuf>> {
    let Some(dir) = job.out_dir() else {
        return Ok(None);
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed creating output dir {}", dir.display()))?;
    let path = dir.join(name);
    fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use verdant_contracts::edits::{EditSpec, VerificationMode};
    use verdant_contracts::jobs::{JobStatus, StepStatus};
    use verdant_contracts::regions::RegionDescriptor;
    use verdant_contracts::settings::ChainPolicy;

    use super::{ChainInput, ChainStep, EditChain};
    use crate::imaging::{decode_image, prepare_next_input, sha256_hex};
    use crate::job::{JobHandle, JobOptions, JobStore};
    use crate::test_support::{fast_settings, gray_png, Script, ScriptedClient};

    fn steps(count: usize) -> Vec<ChainStep> {
        (0..count)
            .map(|index| {
                ChainStep::new(EditSpec::new(
                    format!("Plant {index}"),
                    format!("Replacement {index}"),
                    RegionDescriptor::ellipse(0.3 + 0.1 * index as f64, 0.6, 0.08, 0.15),
                ))
            })
            .collect()
    }

    fn input(count: usize) -> anyhow::Result<ChainInput> {
        Ok(ChainInput {
            source: gray_png(64, 48, 128)?,
            steps: steps(count),
            instruction_template: "Replace with {{PLANT_NAME}}".to_string(),
        })
    }

    #[test]
    fn each_step_starts_from_previous_output() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient::new(vec![
            Script::Uniform(vec![128]),
            Script::Uniform(vec![130]),
            Script::Uniform(vec![126]),
        ]));
        let mut settings = fast_settings(2);
        settings.max_input_width = 300;
        let (width, quality) = (settings.max_input_width, settings.jpeg_quality);
        let chain = EditChain::new(client, settings);
        let job = JobHandle::new("job-chain", 3, None, None);
        let source = ChainInput {
            source: gray_png(600, 400, 128)?,
            ..input(3)?
        };
        let source_digest = sha256_hex(&source.source);
        let outcome = chain
            .run(&job, source)
            .ok_or_else(|| anyhow::anyhow!("chain errored"))?;

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.accepted_images.len(), 3);
        assert_eq!(outcome.results[0].input_sha256, source_digest);
        for (index, result) in outcome.results.iter().enumerate() {
            let accepted = outcome.accepted_images[index]
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("step {} kept no image", index + 1))?;
            let winner = result
                .winner
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("step {} has no winner", index + 1))?;
            assert_eq!(winner.sha256, sha256_hex(accepted));

            let next_input = prepare_next_input(accepted, width, quality)?;
            assert_eq!(decode_image(&next_input)?.width(), width);
            assert_eq!(result.output_sha256, Some(sha256_hex(&next_input)));
            if let Some(next) = outcome.results.get(index + 1) {
                assert_eq!(next.input_sha256, sha256_hex(&next_input));
            }
        }
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.succeeded_steps(), 3);
        assert!(snapshot.finished_at.is_some());
        Ok(())
    }

    #[test]
    fn failed_step_is_skipped_and_image_carried_forward() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient::new(vec![
            Script::Uniform(vec![0, 40, 90]),
            Script::Uniform(vec![0, 40, 90]),
            Script::Uniform(vec![0, 40, 90]),
            Script::Uniform(vec![128]),
        ]));
        let chain = EditChain::new(client, fast_settings(3));
        let job = JobHandle::new("job-skip", 2, None, None);
        let outcome = chain
            .run(&job, input(2)?)
            .ok_or_else(|| anyhow::anyhow!("chain errored"))?;

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.results[0].status, StepStatus::Failed);
        assert_eq!(outcome.results[0].attempts.len(), 3);
        assert_eq!(outcome.results[1].status, StepStatus::Succeeded);
        assert_eq!(
            Some(outcome.results[0].input_sha256.clone()),
            outcome.results[0].output_sha256
        );
        assert_eq!(outcome.results[1].input_sha256, outcome.results[0].input_sha256);
        Ok(())
    }

    #[test]
    fn halt_policy_stops_at_first_failure() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient::repeat(Script::Uniform(vec![0])));
        let mut settings = fast_settings(1);
        settings.policy = ChainPolicy::Halt;
        let chain = EditChain::new(client.clone(), settings);
        let job = JobHandle::new("job-halt", 3, None, None);
        let outcome = chain
            .run(&job, input(3)?)
            .ok_or_else(|| anyhow::anyhow!("chain errored"))?;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.halted_at, Some(1));
        assert_eq!(client.calls(), 1);
        Ok(())
    }

    #[test]
    fn malformed_edit_ends_job_in_error() -> anyhow::Result<()> {
        let mut source = input(2)?;
        source.steps[1].edit.verification = VerificationMode::PreserveRegion;
        let client = Arc::new(ScriptedClient::repeat(Script::Uniform(vec![128])));
        let chain = EditChain::new(client.clone(), fast_settings(1));
        let job = JobHandle::new("job-bad", 2, None, None);

        assert!(chain.run(&job, source).is_none());
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Error);
        assert!(snapshot.error.is_some_and(|message| message.contains("edit 2")));
        assert_eq!(client.calls(), 0);
        Ok(())
    }

    #[test]
    fn undecodable_source_ends_job_in_error() {
        let client = Arc::new(ScriptedClient::repeat(Script::Uniform(vec![128])));
        let chain = EditChain::new(client, fast_settings(1));
        let job = JobHandle::new("job-source", 1, None, None);
        let outcome = chain.run(
            &job,
            ChainInput {
                source: b"not an image".to_vec(),
                steps: steps(1),
                instruction_template: String::new(),
            },
        );
        assert!(outcome.is_none());
        assert_eq!(job.status(), JobStatus::Error);
    }

    #[test]
    fn cancel_between_steps_keeps_finished_steps() -> anyhow::Result<()> {
        let job = JobHandle::new("job-cancel", 4, None, None);
        // Cancellation lands while step 2 is generating; step 2 still passes.
        let client = Arc::new(
            ScriptedClient::repeat(Script::Uniform(vec![128])).cancel_after(2, job.clone()),
        );
        let chain = EditChain::new(client.clone(), fast_settings(3));
        let worker_job = job.clone();
        let source = input(4)?;
        let worker = std::thread::spawn(move || chain.run(&worker_job, source));
        let outcome = worker
            .join()
            .map_err(|_| anyhow::anyhow!("job thread panicked"))?
            .ok_or_else(|| anyhow::anyhow!("chain errored"))?;

        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(client.calls(), 2);
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(snapshot.results.len(), 2);
        assert!(snapshot.current_step <= 2);
        Ok(())
    }

    #[test]
    fn writes_original_final_and_summary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = temp.path().join("events.jsonl");
        let store = JobStore::new();
        let client = Arc::new(ScriptedClient::repeat(Script::Uniform(vec![128])));
        let chain = EditChain::new(client, fast_settings(1));
        let options = JobOptions {
            out_dir: Some(temp.path().to_path_buf()),
            events_path: Some(events.clone()),
        };
        let (job, worker) = store.start(chain, input(2)?, &options)?;
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("job thread panicked"))?;

        assert!(temp.path().join("ORIGINAL.png").is_file());
        assert!(temp.path().join("FINAL.jpg").is_file());
        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(temp.path().join("summary.json"))?)?;
        assert_eq!(summary["headline"], serde_json::json!("2/2 edits passed verification"));
        assert_eq!(summary["job_id"], serde_json::json!(job.id()));

        let types: Vec<String> = std::fs::read_to_string(&events)?
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("job_started"));
        assert_eq!(types.last().map(String::as_str), Some("job_finished"));
        assert_eq!(types.iter().filter(|kind| *kind == "step_finished").count(), 2);
        assert!(types.iter().any(|kind| kind == "candidate_scored"));
        Ok(())
    }
}
