use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::edits::VerificationMode;

/// What the chain does with the working image after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChainPolicy {
    /// Keep the working image and move on to the next edit.
    #[default]
    SkipAndContinue,
    /// Stop the chain at the first failed step.
    Halt,
}

impl ChainPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "skip" | "continue" | "skip_and_continue" => Some(Self::SkipAndContinue),
            "halt" | "stop" => Some(Self::Halt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkipAndContinue => "skip_and_continue",
            Self::Halt => "halt",
        }
    }
}

/// Mask adjustment applied after an attempt without a passing candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkPolicy {
    pub ry_factor: f64,
    pub cy_shift: f64,
}

impl Default for ShrinkPolicy {
    fn default() -> Self {
        Self {
            ry_factor: 0.85,
            cy_shift: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    pub max_retries: u32,
    pub candidates_per_attempt: u32,
    pub outside_threshold: f64,
    pub preserve_threshold: f64,
    pub shrink: ShrinkPolicy,
    pub retry_delay_ms: u64,
    pub step_delay_ms: u64,
    pub selection_wait_ms: u64,
    pub policy: ChainPolicy,
    pub max_input_width: u32,
    pub jpeg_quality: u8,
    pub resolution: String,
    pub output_format: String,
    /// Provider model or endpoint; each provider has its own default.
    pub model: Option<String>,
    pub comparison_width: u32,
    pub preserve_tile: u32,
    pub marker_alpha: f32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            candidates_per_attempt: 3,
            outside_threshold: 0.92,
            preserve_threshold: 0.95,
            shrink: ShrinkPolicy::default(),
            retry_delay_ms: 3000,
            step_delay_ms: 2000,
            selection_wait_ms: 3000,
            policy: ChainPolicy::default(),
            max_input_width: 2400,
            jpeg_quality: 95,
            resolution: "4K".to_string(),
            output_format: "png".to_string(),
            model: None,
            comparison_width: 400,
            preserve_tile: 100,
            marker_alpha: 0.5,
        }
    }
}

impl ChainSettings {
    pub fn threshold_for(&self, mode: VerificationMode) -> f64 {
        match mode {
            VerificationMode::OutsideRegion => self.outside_threshold,
            VerificationMode::PreserveRegion => self.preserve_threshold,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn selection_wait(&self) -> Duration {
        Duration::from_millis(self.selection_wait_ms)
    }

    /// Applies `VERDANT_*` environment overrides; returns warnings for values
    /// that could not be parsed.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides_from(|key| {
            env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(value) = parse_override(&lookup, "VERDANT_MAX_RETRIES", &mut warnings) {
            self.max_retries = value;
        }
        if let Some(value) = parse_override(&lookup, "VERDANT_CANDIDATES", &mut warnings) {
            self.candidates_per_attempt = value;
        }
        if let Some(value) = parse_override(&lookup, "VERDANT_RETRY_DELAY_MS", &mut warnings) {
            self.retry_delay_ms = value;
        }
        if let Some(value) = parse_override(&lookup, "VERDANT_STEP_DELAY_MS", &mut warnings) {
            self.step_delay_ms = value;
        }
        if let Some(value) = parse_override(&lookup, "VERDANT_SELECTION_WAIT_MS", &mut warnings) {
            self.selection_wait_ms = value;
        }
        if let Some(model) = lookup("VERDANT_MODEL") {
            self.model = Some(model);
        }
        if let Some(raw) = lookup("VERDANT_CHAIN_POLICY") {
            match ChainPolicy::parse(&raw) {
                Some(policy) => self.policy = policy,
                None => warnings.push(format!("VERDANT_CHAIN_POLICY: unknown policy '{raw}'")),
            }
        }
        warnings
    }

    /// Clamps every knob into a range the controller can run with.
    pub fn normalized(mut self) -> Self {
        self.max_retries = self.max_retries.clamp(1, 50);
        self.candidates_per_attempt = self.candidates_per_attempt.clamp(1, 4);
        self.outside_threshold = clamp_unit(self.outside_threshold, 0.92);
        self.preserve_threshold = clamp_unit(self.preserve_threshold, 0.95);
        if !(self.shrink.ry_factor > 0.0 && self.shrink.ry_factor <= 1.0) {
            self.shrink.ry_factor = ShrinkPolicy::default().ry_factor;
        }
        if !self.shrink.cy_shift.is_finite() || self.shrink.cy_shift < 0.0 {
            self.shrink.cy_shift = ShrinkPolicy::default().cy_shift;
        }
        self.retry_delay_ms = self.retry_delay_ms.min(MAX_DELAY_MS);
        self.step_delay_ms = self.step_delay_ms.min(MAX_DELAY_MS);
        self.selection_wait_ms = self.selection_wait_ms.min(MAX_DELAY_MS);
        self.max_input_width = self.max_input_width.max(256);
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        self.comparison_width = self.comparison_width.max(16);
        self.preserve_tile = self.preserve_tile.max(8);
        self.marker_alpha = if self.marker_alpha.is_finite() {
            self.marker_alpha.clamp(0.05, 1.0)
        } else {
            0.5
        };
        if self.resolution.trim().is_empty() {
            self.resolution = "4K".to_string();
        }
        if self.output_format.trim().is_empty() {
            self.output_format = "png".to_string();
        }
        self
    }
}

/// Longest any single delay or operator wait may last (ten minutes).
pub const MAX_DELAY_MS: u64 = 600_000;

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    warnings: &mut Vec<String>,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warnings.push(format!("{key}: expected a number, got '{raw}'"));
            None
        }
    }
}

fn clamp_unit(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        default
    }
}
