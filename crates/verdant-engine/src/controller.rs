//! Drives one edit to an accepted candidate or to exhaustion.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use image::DynamicImage;
use serde_json::json;
use verdant_contracts::edits::EditSpec;
use verdant_contracts::jobs::receipts::{build_receipt, write_receipt, CandidateReceipt};
use verdant_contracts::jobs::{
    Acceptance, AttemptOutcome, AttemptRecord, CandidateRecord, LogLevel, LogLine, StepResult,
    StepStatus,
};
use verdant_contracts::regions::EllipseRegion;
use verdant_contracts::settings::ChainSettings;

use crate::imaging::{decode_image, encode_png, extension_for_mime, sha256_hex, sniff_mime};
use crate::job::{JobHandle, SelectionWait};
use crate::mask::{build_overlay, MarkerStyle};
use crate::providers::{GenerationClient, GenerationRequest, GeneratedImage, ImagePayload};
use crate::similarity::Comparator;

/// `1` + `0` -> `1A`, `2` + `2` -> `2C`.
pub fn candidate_label(attempt: u32, index: usize) -> String {
    let letter = (b'A' + (index % 26) as u8) as char;
    format!("{attempt}{letter}")
}

pub struct StepInput<'a> {
    /// 1-based position in the chain.
    pub step: u32,
    pub edit: &'a EditSpec,
    /// Encoded working image the edit applies to.
    pub image: &'a [u8],
    pub references: &'a [ImagePayload],
    pub instruction_template: &'a str,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    /// Raw bytes of the accepted candidate, if any.
    pub accepted: Option<Vec<u8>>,
}

struct ScoredCandidate {
    record: CandidateRecord,
    bytes: Arc<[u8]>,
}

/// Collects an attempt's log lines while forwarding them to the job.
struct AttemptLog<'a> {
    job: &'a JobHandle,
    lines: Vec<LogLine>,
}

impl<'a> AttemptLog<'a> {
    fn new(job: &'a JobHandle) -> Self {
        Self {
            job,
            lines: Vec::new(),
        }
    }

    fn push(&mut self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        let line = self.job.log(level, message)?;
        self.lines.push(line);
        Ok(())
    }
}

pub struct RetryController<'a> {
    client: &'a dyn GenerationClient,
    settings: &'a ChainSettings,
    comparator: Comparator,
    job: &'a JobHandle,
}

impl<'a> RetryController<'a> {
    pub fn new(
        client: &'a dyn GenerationClient,
        settings: &'a ChainSettings,
        job: &'a JobHandle,
    ) -> Self {
        Self {
            client,
            settings,
            comparator: Comparator::from_settings(settings),
            job,
        }
    }

    /// Runs attempts until a candidate passes, an operator picks one, the
    /// attempt budget is spent, or the job is cancelled.
    ///
    /// Generation failures and low scores are recorded in the result. Only
    /// unexpected failures (undecodable input, unwritable artifacts) are
    /// returned as errors.
    pub fn run_step(&self, input: StepInput<'_>) -> Result<StepOutcome> {
        let edit = input.edit;
        let step = input.step;
        edit.validate()?;
        let source = decode_image(input.image)
            .with_context(|| format!("step {step} input image could not be decoded"))?;
        let (width, height) = (source.width(), source.height());
        let mode = edit.verification;
        let threshold = self.settings.threshold_for(mode);
        let instruction = edit.render_instruction(input.instruction_template);
        let style = MarkerStyle::new(edit.marker, self.settings.marker_alpha);
        let max_attempts = self.settings.max_retries.max(1);

        let mut outcome = StepOutcome {
            result: StepResult {
                step,
                original: edit.original.clone(),
                replacement: edit.replacement.clone(),
                status: StepStatus::Failed,
                attempts: Vec::new(),
                winner: None,
                acceptance: None,
                input_sha256: sha256_hex(input.image),
                output_sha256: None,
            },
            accepted: None,
        };
        let mut pool: Vec<ScoredCandidate> = Vec::new();
        let mut region = edit.region.to_ellipse(width, height);

        for attempt in 1..=max_attempts {
            if self.job.is_cancelled() {
                return self.cancelled(outcome);
            }
            self.job.begin_attempt(attempt);
            let mut log = AttemptLog::new(self.job);
            log.push(
                LogLevel::Info,
                format!("Step {step} attempt {attempt}/{max_attempts}: {}", edit.label()),
            )?;
            self.job.emit(
                "attempt_started",
                json!({"step": step, "attempt": attempt, "region": region}),
            )?;

            let canvas = DynamicImage::ImageRgb8(build_overlay(&source, &region, style));
            let canvas_png = encode_png(&canvas)?;
            let mask_path = self.write_artifact(
                &format!("step{step}-attempt{attempt}-mask.png"),
                &canvas_png,
            )?;
            self.job.emit(
                "mask_built",
                json!({
                    "step": step,
                    "attempt": attempt,
                    "width": width,
                    "height": height,
                    "path": mask_path.as_ref().map(|path| path.to_string_lossy().to_string()),
                }),
            )?;

            let mut images = Vec::with_capacity(input.references.len() + 1);
            images.push(ImagePayload::new(canvas_png, "image/png"));
            images.extend(input.references.iter().cloned());
            let request = GenerationRequest {
                instruction: instruction.clone(),
                images,
                num_candidates: self.settings.candidates_per_attempt,
                resolution: self.settings.resolution.clone(),
                output_format: self.settings.output_format.clone(),
                model: self.settings.model.clone(),
            };

            let mut candidates = Vec::new();
            let mut winner: Option<usize> = None;
            let attempt_outcome = match self.client.generate(&request) {
                Err(err) => {
                    log.push(
                        LogLevel::Warning,
                        format!("Attempt {attempt} generation failed: {}", err.message()),
                    )?;
                    self.job.emit(
                        "generation_failed",
                        json!({
                            "step": step,
                            "attempt": attempt,
                            "failure": err.kind().as_str(),
                            "message": err.message(),
                        }),
                    )?;
                    AttemptOutcome::GenerationFailed {
                        failure: err.kind(),
                        message: err.message().to_string(),
                    }
                }
                Ok(response) => {
                    for warning in &response.warnings {
                        log.push(LogLevel::Warning, warning.clone())?;
                    }
                    for (index, image) in response.images.into_iter().enumerate() {
                        let label = candidate_label(attempt, index);
                        let score = match decode_image(&image.bytes) {
                            Ok(decoded) => self.comparator.score(
                                mode,
                                &source,
                                &decoded,
                                &region,
                                edit.preserve_region.as_ref(),
                            ),
                            Err(err) => {
                                log.push(
                                    LogLevel::Warning,
                                    format!("Candidate {label} could not be decoded: {err}"),
                                )?;
                                0.0
                            }
                        };
                        let passed = score >= threshold;
                        let mut record = CandidateRecord {
                            label: label.clone(),
                            step,
                            attempt,
                            score,
                            passed,
                            threshold,
                            mode,
                            sha256: sha256_hex(&image.bytes),
                            image_path: None,
                        };
                        record.image_path = self.persist_candidate(
                            edit,
                            &record,
                            &region,
                            &image,
                            &response.provider_request,
                            &response.warnings,
                        )?;
                        let bytes: Arc<[u8]> = Arc::from(image.bytes);
                        self.job.push_live_candidate(record.clone(), Arc::clone(&bytes));
                        self.job.emit(
                            "candidate_scored",
                            json!({
                                "step": step,
                                "attempt": attempt,
                                "label": label,
                                "score": score,
                                "threshold": threshold,
                                "passed": passed,
                                "mode": mode.as_str(),
                            }),
                        )?;
                        let percent = score * 100.0;
                        if passed {
                            log.push(
                                LogLevel::Success,
                                format!("Candidate {label} scored {percent:.1}% (passed)"),
                            )?;
                            if winner.is_none() {
                                winner = Some(pool.len());
                            }
                        } else {
                            log.push(
                                LogLevel::Warning,
                                format!(
                                    "Candidate {label} scored {percent:.1}% (below {:.0}%)",
                                    threshold * 100.0
                                ),
                            )?;
                        }
                        candidates.push(record.clone());
                        pool.push(ScoredCandidate { record, bytes });
                    }
                    match winner {
                        Some(index) => AttemptOutcome::Passed {
                            label: pool[index].record.label.clone(),
                        },
                        None => AttemptOutcome::NoPassingCandidate,
                    }
                }
            };

            outcome.result.attempts.push(AttemptRecord {
                attempt,
                region,
                candidates,
                outcome: attempt_outcome,
                logs: log.lines,
            });

            if let Some(label) = self.job.take_selection(step) {
                if let Some(index) = find_candidate(&pool, &label) {
                    return self.accept(outcome, &pool, index, Acceptance::Manual);
                }
                self.job.log(
                    LogLevel::Warning,
                    format!("Ignoring selection {label}: no such candidate for step {step}"),
                )?;
            }
            if let Some(index) = winner {
                return self.accept(outcome, &pool, index, Acceptance::Automatic);
            }

            if attempt < max_attempts {
                let next = region.shrunk(self.settings.shrink.ry_factor, self.settings.shrink.cy_shift);
                self.log_adjustment(step, attempt, &region, &next)?;
                region = next;
                self.job.pause(self.settings.retry_delay());
            }
        }

        if self.job.is_cancelled() {
            return self.cancelled(outcome);
        }
        self.await_manual_pick(outcome, &pool, max_attempts)
    }

    fn await_manual_pick(
        &self,
        outcome: StepOutcome,
        pool: &[ScoredCandidate],
        max_attempts: u32,
    ) -> Result<StepOutcome> {
        let step = outcome.result.step;
        let wait = self.settings.selection_wait();
        self.job.set_pending_selection(true);
        self.job.emit(
            "selection_pending",
            json!({"step": step, "candidates": pool.len(), "wait_ms": wait.as_millis() as u64}),
        )?;
        self.job.log(
            LogLevel::Warning,
            format!(
                "Step {step}: no candidate passed after {max_attempts} attempts; waiting {:.1}s for a manual pick",
                wait.as_secs_f64()
            ),
        )?;

        let decision = self.job.wait_for_selection(step, wait);
        self.job.set_pending_selection(false);
        match decision {
            SelectionWait::Selected(label) => match find_candidate(pool, &label) {
                Some(index) => self.accept(outcome, pool, index, Acceptance::Manual),
                None => {
                    self.job.log(
                        LogLevel::Warning,
                        format!("Ignoring selection {label}: no such candidate for step {step}"),
                    )?;
                    self.failed(outcome)
                }
            },
            SelectionWait::Cancelled => self.cancelled(outcome),
            SelectionWait::TimedOut => self.failed(outcome),
        }
    }

    fn accept(
        &self,
        mut outcome: StepOutcome,
        pool: &[ScoredCandidate],
        index: usize,
        acceptance: Acceptance,
    ) -> Result<StepOutcome> {
        let chosen = &pool[index];
        let step = outcome.result.step;
        let how = match acceptance {
            Acceptance::Automatic => "passed verification",
            Acceptance::Manual => "selected manually",
        };
        self.job.log(
            LogLevel::Success,
            format!(
                "Step {step}: accepted {} ({:.1}%, {how})",
                chosen.record.label,
                chosen.record.score * 100.0
            ),
        )?;
        if acceptance == Acceptance::Manual {
            self.job.record_manual_pick(&chosen.record.label);
        }
        outcome.result.status = StepStatus::Succeeded;
        outcome.result.winner = Some(chosen.record.clone());
        outcome.result.acceptance = Some(acceptance);
        outcome.accepted = Some(chosen.bytes.to_vec());
        Ok(outcome)
    }

    fn failed(&self, mut outcome: StepOutcome) -> Result<StepOutcome> {
        let step = outcome.result.step;
        self.job.log(
            LogLevel::Error,
            format!(
                "Step {step} failed verification after {} attempts",
                outcome.result.attempts.len()
            ),
        )?;
        outcome.result.status = StepStatus::Failed;
        Ok(outcome)
    }

    fn cancelled(&self, mut outcome: StepOutcome) -> Result<StepOutcome> {
        outcome.result.status = StepStatus::Cancelled;
        Ok(outcome)
    }

    fn log_adjustment(
        &self,
        step: u32,
        attempt: u32,
        from: &EllipseRegion,
        to: &EllipseRegion,
    ) -> Result<()> {
        self.job.emit(
            "region_adjusted",
            json!({"step": step, "attempt": attempt, "from": from, "to": to}),
        )?;
        self.job.log(
            LogLevel::Info,
            format!(
                "Adjusting mask: ry {:.3} -> {:.3}, cy {:.3} -> {:.3}",
                from.ry, to.ry, from.cy, to.cy
            ),
        )?;
        Ok(())
    }

    fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<Option<PathBuf>> {
        let Some(dir) = self.job.out_dir() else {
            return Ok(None);
        };
        fs::create_dir_all(dir)
            .with_context(|| format!("failed creating output dir {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(Some(path))
    }

    fn persist_candidate(
        &self,
        edit: &EditSpec,
        record: &CandidateRecord,
        region: &EllipseRegion,
        image: &GeneratedImage,
        provider_request: &serde_json::Map<String, serde_json::Value>,
        warnings: &[String],
    ) -> Result<Option<String>> {
        let mime = image
            .mime_type
            .clone()
            .unwrap_or_else(|| sniff_mime(&image.bytes).to_string());
        let stem = format!("step{}-v{}", record.step, record.label);
        let Some(image_path) =
            self.write_artifact(&format!("{stem}.{}", extension_for_mime(&mime)), &image.bytes)?
        else {
            return Ok(None);
        };
        let receipt_path = image_path.with_file_name(format!("{stem}.json"));
        let mut stored = record.clone();
        stored.image_path = Some(image_path.to_string_lossy().to_string());
        let payload = build_receipt(
            &CandidateReceipt {
                job_id: self.job.id(),
                edit,
                candidate: &stored,
                region,
                provider: self.client.name(),
                provider_request,
                warnings,
            },
            &image_path,
            &receipt_path,
        );
        write_receipt(&receipt_path, &payload)?;
        Ok(stored.image_path)
    }
}

fn find_candidate(pool: &[ScoredCandidate], label: &str) -> Option<usize> {
    pool.iter()
        .position(|candidate| candidate.record.label.eq_ignore_ascii_case(label))
}
