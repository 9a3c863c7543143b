//! Deterministic generation clients for controller and chain tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::Map;
use verdant_contracts::settings::ChainSettings;

use crate::imaging::{decode_image, encode_png};
use crate::job::JobHandle;
use crate::providers::{
    GeneratedImage, GenerationClient, GenerationError, GenerationRequest, GenerationResponse,
};

#[derive(Debug, Clone)]
pub enum Script {
    /// One flat gray image per value, sized like the masked canvas.
    Uniform(Vec<u8>),
    /// Bytes that are not an image.
    Garbage,
    Empty,
    Transport,
}

pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Option<Script>,
    calls: AtomicUsize,
    cancel_after: Option<(usize, JobHandle)>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            cancel_after: None,
        }
    }

    pub fn repeat(script: Script) -> Self {
        Self {
            fallback: Some(script),
            ..Self::new(Vec::new())
        }
    }

    /// Cancels `job` as the `calls`-th generation returns.
    pub fn cancel_after(mut self, calls: usize, job: JobHandle) -> Self {
        self.cancel_after = Some((calls, job));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Script {
        let queued = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front());
        queued
            .or_else(|| self.fallback.clone())
            .unwrap_or(Script::Empty)
    }
}

impl GenerationClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, job)) = self.cancel_after.as_ref() {
            if call >= *after {
                job.cancel();
            }
        }
        let canvas = request
            .images
            .first()
            .ok_or_else(|| GenerationError::empty("no canvas"))?;
        let images = match self.next_script() {
            Script::Transport => return Err(GenerationError::transport("connection reset")),
            Script::Empty => return Err(GenerationError::empty("no images")),
            Script::Garbage => vec![b"not an image".to_vec()],
            Script::Uniform(values) => {
                let decoded = decode_image(&canvas.bytes)
                    .map_err(|err| GenerationError::transport(err.to_string()))?;
                let mut out = Vec::new();
                for value in values {
                    let flat = RgbImage::from_pixel(
                        decoded.width(),
                        decoded.height(),
                        Rgb([value, value, value]),
                    );
                    out.push(
                        encode_png(&DynamicImage::ImageRgb8(flat))
                            .map_err(|err| GenerationError::transport(err.to_string()))?,
                    );
                }
                out
            }
        };
        Ok(GenerationResponse {
            images: images
                .into_iter()
                .map(|bytes| GeneratedImage {
                    bytes,
                    mime_type: Some("image/png".to_string()),
                })
                .collect(),
            provider_request: Map::new(),
            warnings: Vec::new(),
        })
    }
}

/// Zero delays and a short manual-selection window.
pub fn fast_settings(max_retries: u32) -> ChainSettings {
    ChainSettings {
        max_retries,
        retry_delay_ms: 0,
        step_delay_ms: 0,
        selection_wait_ms: 20,
        comparison_width: 64,
        ..ChainSettings::default()
    }
}

pub fn gray_png(width: u32, height: u32, value: u8) -> Result<Vec<u8>> {
    let image = RgbImage::from_pixel(width, height, Rgb([value, value, value]));
    encode_png(&DynamicImage::ImageRgb8(image))
}
