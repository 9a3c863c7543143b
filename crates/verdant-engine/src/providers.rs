use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use verdant_contracts::jobs::GenerationFailureKind;

use crate::imaging::{data_url, decode_data_url, sniff_mime};

pub const DEFAULT_FAL_ENDPOINT: &str = "fal-ai/nano-banana-pro/edit";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-3-pro-image-preview";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// One image handed to the generation service, already in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn sniffed(bytes: Vec<u8>) -> Self {
        let mime_type = sniff_mime(&bytes).to_string();
        Self { bytes, mime_type }
    }

    pub fn data_url(&self) -> String {
        data_url(&self.bytes, &self.mime_type)
    }

    /// Loads a reference image from a path, an `http(s)` URL or a data URL.
    ///
    /// Relative paths resolve against `base_dir` when one is given.
    pub fn load(location: &str, base_dir: Option<&Path>) -> Result<Self> {
        let trimmed = location.trim();
        if trimmed.starts_with("data:") {
            let (bytes, mime) = decode_data_url(trimmed)?;
            return Ok(match mime {
                Some(mime) => Self::new(bytes, mime),
                None => Self::sniffed(bytes),
            });
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let image = fetch_url(&http_client(), trimmed, "reference")?;
            return Ok(Self::sniffed(image.bytes));
        }
        let path = Path::new(trimmed);
        let resolved = match base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        };
        let bytes = fs::read(&resolved)
            .with_context(|| format!("failed reading reference image {}", resolved.display()))?;
        Ok(Self::sniffed(bytes))
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub instruction: String,
    /// Masked canvas first, then reference images.
    pub images: Vec<ImagePayload>,
    pub num_candidates: u32,
    pub resolution: String,
    pub output_format: String,
    /// Provider-specific model or endpoint override.
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub images: Vec<GeneratedImage>,
    pub provider_request: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Failure of one generation call. Never fatal to a job by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationError {
    kind: GenerationFailureKind,
    message: String,
}

impl GenerationError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: GenerationFailureKind::Transport,
            message: message.into(),
        }
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            kind: GenerationFailureKind::Empty,
            message: message.into(),
        }
    }

    pub fn from_anyhow(err: anyhow::Error) -> Self {
        Self::transport(error_chain_text(&err, 512))
    }

    pub fn kind(&self) -> GenerationFailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for GenerationError {}

pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError>;
}

#[derive(Default)]
pub struct GenerationClientRegistry {
    providers: BTreeMap<String, Arc<dyn GenerationClient>>,
}

impl GenerationClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: GenerationClient + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationClient>> {
        self.providers
            .get(name.trim().to_ascii_lowercase().as_str())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_registry() -> GenerationClientRegistry {
    let mut registry = GenerationClientRegistry::new();
    registry.register(DryrunProvider);
    registry.register(FalProvider::new());
    registry.register(GeminiProvider::new());
    registry
}

/// Offline client that hands the masked canvas back unchanged.
///
/// Useful for exercising the full chain without credentials: every
/// candidate keeps the marker, so outside-region scores stay near 1.
pub struct DryrunProvider;

impl GenerationClient for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let Some(canvas) = request.images.first() else {
            return Err(GenerationError::empty("dryrun request carried no images"));
        };
        let images = (0..request.num_candidates.max(1))
            .map(|_| GeneratedImage {
                bytes: canvas.bytes.clone(),
                mime_type: Some(canvas.mime_type.clone()),
            })
            .collect();
        Ok(GenerationResponse {
            images,
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "prompt": request.instruction,
                    "num_images": request.num_candidates,
                    "image_count": request.images.len(),
                }
            })),
            warnings: Vec::new(),
        })
    }
}

pub struct FalProvider {
    api_base: String,
    http: HttpClient,
}

impl FalProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("FAL_API_BASE", "https://fal.run"),
            http: http_client(),
        }
    }

    fn api_key() -> Option<String> {
        env_value("FAL_KEY").or_else(|| env_value("FAL_API_KEY"))
    }

    fn resolve_endpoint(&self, request: &GenerationRequest) -> String {
        let raw = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_FAL_ENDPOINT);
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return raw.to_string();
        }
        format!("{}/{}", self.api_base, raw.trim_start_matches('/'))
    }

    fn build_payload(request: &GenerationRequest) -> Map<String, Value> {
        let image_urls: Vec<Value> = request
            .images
            .iter()
            .map(|image| Value::String(image.data_url()))
            .collect();
        map_object(json!({
            "prompt": request.instruction,
            "image_urls": image_urls,
            "num_images": request.num_candidates.max(1),
            "resolution": request.resolution,
            "output_format": request.output_format,
        }))
    }

    fn request(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("FAL_KEY (or FAL_API_KEY) not set");
        };
        let endpoint = self.resolve_endpoint(request);
        let payload = Self::build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .json(&Value::Object(payload.clone()))
            .send()
            .with_context(|| format!("Fal request failed ({endpoint})"))?;
        let parsed: FalResponse = read_json("Fal", response)?;

        let mut images = Vec::new();
        let mut warnings = Vec::new();
        for (url, declared_mime) in parsed
            .downloads()
            .into_iter()
            .take(request.num_candidates.max(1) as usize)
        {
            // A broken download loses one candidate, not the whole attempt.
            match fetch_url(&self.http, &url, "Fal") {
                Ok(mut image) => {
                    image.mime_type = image.mime_type.or(declared_mime);
                    images.push(image);
                }
                Err(err) => warnings.push(error_chain_text(&err, 256)),
            }
        }

        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), Value::String(endpoint));
        provider_request.insert("payload".to_string(), Value::Object(payload));
        Ok(GenerationResponse {
            images,
            provider_request,
            warnings,
        })
    }
}

/// Body of a Fal edit response. Images arrive as bare URLs or as objects.
#[derive(Debug, Default, Deserialize)]
struct FalResponse {
    #[serde(default)]
    images: Vec<FalImage>,
    #[serde(default)]
    image: Option<FalImage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FalImage {
    Url(String),
    Hosted {
        url: String,
        #[serde(default)]
        content_type: Option<String>,
    },
}

impl FalResponse {
    /// Downloadable locations with their declared MIME type, first
    /// occurrence wins.
    fn downloads(self) -> Vec<(String, Option<String>)> {
        let mut seen = Vec::new();
        for image in self.images.into_iter().chain(self.image) {
            let (url, mime) = match image {
                FalImage::Url(url) => (url, None),
                FalImage::Hosted { url, content_type } => (url, content_type),
            };
            let url = url.trim();
            let fetchable = url.starts_with("http") || url.starts_with("data:");
            if fetchable && !seen.iter().any(|(known, _)| known == url) {
                seen.push((url.to_string(), mime));
            }
        }
        seen
    }
}

impl Default for FalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationClient for FalProvider {
    fn name(&self) -> &str {
        "fal"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let response = self.request(request).map_err(GenerationError::from_anyhow)?;
        if response.images.is_empty() {
            let detail = response.warnings.first().cloned().unwrap_or_default();
            return Err(GenerationError::empty(
                format!("Fal response returned no usable images {detail}")
                    .trim()
                    .to_string(),
            ));
        }
        Ok(response)
    }
}

pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            http: http_client(),
        }
    }

    fn api_key() -> Option<String> {
        env_value("GEMINI_API_KEY").or_else(|| env_value("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerationRequest) -> Map<String, Value> {
        let mut parts: Vec<Value> = request
            .images
            .iter()
            .map(|image| {
                json!({
                    "inlineData": {
                        "mimeType": image.mime_type,
                        "data": BASE64.encode(&image.bytes),
                    }
                })
            })
            .collect();
        parts.push(json!({ "text": request.instruction }));

        map_object(json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {
                "candidateCount": request.num_candidates.max(1),
                "responseModalities": ["IMAGE"],
                "imageConfig": {"imageSize": request.resolution},
            }
        }))
    }

    fn request(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_GEMINI_MODEL);
        let endpoint = self.endpoint_for_model(model);
        let payload = Self::build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .json(&Value::Object(payload.clone()))
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let parsed: GeminiResponse = read_json("Gemini", response)?;
        let mut images = parsed.into_images()?;
        images.truncate(request.num_candidates.max(1) as usize);

        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), Value::String(endpoint));
        provider_request.insert("payload".to_string(), Value::Object(payload));
        Ok(GenerationResponse {
            images,
            provider_request,
            warnings: Vec::new(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiPart {
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    #[serde(default, rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

impl GeminiResponse {
    /// Decodes every inline image part across all candidates, in order.
    fn into_images(self) -> Result<Vec<GeneratedImage>> {
        self.candidates
            .into_iter()
            .flat_map(|candidate| candidate.content.parts)
            .filter_map(|part| part.inline_data)
            .filter(|inline| !inline.data.is_empty())
            .map(|inline| {
                let bytes = BASE64
                    .decode(inline.data.as_bytes())
                    .context("Gemini image base64 decode failed")?;
                Ok(GeneratedImage {
                    bytes,
                    mime_type: inline.mime_type,
                })
            })
            .collect()
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationClient for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let response = self.request(request).map_err(GenerationError::from_anyhow)?;
        if response.images.is_empty() {
            return Err(GenerationError::empty("Gemini response returned no images"));
        }
        Ok(response)
    }
}

fn http_client() -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

fn fetch_url(http: &HttpClient, url: &str, provider: &str) -> Result<GeneratedImage> {
    if url.starts_with("data:") {
        let (bytes, mime_type) = decode_data_url(url)?;
        return Ok(GeneratedImage { bytes, mime_type });
    }
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("failed downloading {provider} image ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "{provider} image download failed ({code}): {}",
            clip(&body, 512)
        );
    }
    let mime_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .with_context(|| format!("failed reading {provider} image bytes"))?
        .to_vec();
    Ok(GeneratedImage { bytes, mime_type })
}

fn env_value(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let value = raw.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn api_base_from_env(key: &str, fallback: &str) -> String {
    env_value(key)
        .map(|base| base.trim_end_matches('/').to_string())
        .filter(|base| !base.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Reads a response body and decodes it as `T`; non-2xx statuses become
/// errors carrying a clipped copy of the body.
fn read_json<T: DeserializeOwned>(provider: &str, response: HttpResponse) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!("{provider} returned HTTP {}: {}", status.as_u16(), clip(&body, 512));
    }
    serde_json::from_str(&body)
        .with_context(|| format!("{provider} response did not match the expected shape"))
}

/// Joins an error and its causes into one line, skipping blank and
/// repeated messages, clipped to `max_chars`.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut messages: Vec<String> = Vec::new();
    for cause in err.chain() {
        let message = cause.to_string().trim().to_string();
        if !message.is_empty() && messages.last() != Some(&message) {
            messages.push(message);
        }
    }
    clip(&messages.join(" | caused by: "), max_chars)
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
