use std::collections::BTreeMap;
use std::env;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use rand::Rng as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use switchyard_contracts::envelope::{build_response, ApiResponse};
use switchyard_contracts::errors::{DispatchError, DispatchErrorKind};
use switchyard_contracts::events::EventWriter;
use switchyard_contracts::intent::signals_edit_intent;
use switchyard_contracts::invocation::{named_parameter, InvocationRequest};
use switchyard_contracts::models::{
    refine_strategy, resolve_strategy, ModelCatalog, ModelStrategy, STABILITY_PREFIX,
    TITAN_IMAGE_V1, TITAN_IMAGE_V2,
};

pub const DEFAULT_IMAGE_BUCKET: &str = "bedrock-agent-images";
pub const DEFAULT_REFERENCE_KEY: &str = "the_image.png";
pub const DEFAULT_MODIFIED_KEY: &str = "modified_image.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    Fixed(u32),
    Random,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextGenerationSettings {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
}

impl Default for TextGenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 2000,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageGenerationSettings {
    pub number_of_images: u32,
    pub quality: String,
    pub width: u32,
    pub height: u32,
    pub cfg_scale: f64,
    pub seed_mode: SeedMode,
}

impl ImageGenerationSettings {
    /// Inpainting runs the same config shape at the premium quality tier.
    pub fn inpaint_defaults() -> Self {
        Self {
            quality: "premium".to_string(),
            ..Self::default()
        }
    }
}

impl Default for ImageGenerationSettings {
    fn default() -> Self {
        Self {
            number_of_images: 1,
            quality: "standard".to_string(),
            width: 1024,
            height: 1024,
            cfg_scale: 7.5,
            seed_mode: SeedMode::Fixed(42),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StabilitySettings {
    pub cfg_scale: f64,
    pub steps: u32,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            cfg_scale: 9.0,
            steps: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceControl {
    pub mode: String,
    pub strength: f64,
}

impl ReferenceControl {
    pub fn new(mode: impl Into<String>, strength: f64) -> Self {
        Self {
            mode: mode.into(),
            strength: strength.clamp(0.0, 1.0),
        }
    }
}

impl Default for ReferenceControl {
    fn default() -> Self {
        Self::new("CANNY_EDGE", 0.7)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultimodalSettings {
    pub anthropic_version: String,
    pub max_tokens: u32,
}

impl Default for MultimodalSettings {
    fn default() -> Self {
        Self {
            anthropic_version: "bedrock-2023-05-31".to_string(),
            max_tokens: 2048,
        }
    }
}

/// All per-process dispatch configuration, built once at startup and
/// passed by reference into every component.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub region: String,
    pub bucket: String,
    pub reference_key: String,
    pub modified_key: String,
    pub generated_url_ttl: u64,
    pub modified_url_ttl: u64,
    pub text: TextGenerationSettings,
    pub image: ImageGenerationSettings,
    pub inpaint: ImageGenerationSettings,
    pub stability: StabilitySettings,
    pub control: ReferenceControl,
    pub multimodal: MultimodalSettings,
    pub falcon_endpoint: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            bucket: DEFAULT_IMAGE_BUCKET.to_string(),
            reference_key: DEFAULT_REFERENCE_KEY.to_string(),
            modified_key: DEFAULT_MODIFIED_KEY.to_string(),
            generated_url_ttl: 3600,
            modified_url_ttl: 604_800,
            text: TextGenerationSettings::default(),
            image: ImageGenerationSettings::default(),
            inpaint: ImageGenerationSettings::inpaint_defaults(),
            stability: StabilitySettings::default(),
            control: ReferenceControl::default(),
            multimodal: MultimodalSettings::default(),
            falcon_endpoint: None,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(region) = non_empty_env("AWS_REGION") {
            config.region = region;
        }
        if let Some(bucket) = non_empty_env("S3_IMAGE_BUCKET") {
            config.bucket = bucket;
        }
        config.falcon_endpoint = non_empty_env("ENDPOINT");
        if let Some(seed) = non_empty_env("IMAGE_SEED") {
            if seed.eq_ignore_ascii_case("random") {
                config.image.seed_mode = SeedMode::Random;
            } else if let Ok(value) = seed.parse::<u32>() {
                config.image.seed_mode = SeedMode::Fixed(value);
            }
        }
        config
    }
}

/// Signed-request construction is delegated, not implemented here. The
/// dispatcher only needs headers for an outbound call and a shareable URL
/// for a stored object.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, method: &str, url: &str, body: &[u8]) -> Result<Vec<(String, String)>>;
    fn presign(&self, method: &str, url: &str, ttl_seconds: u64) -> Result<String>;
}

/// Bearer-token signer for gateways that accept header auth. Presigned
/// URLs carry a token-keyed digest so the URL itself is shareable.
pub struct BearerTokenSigner {
    token: String,
}

impl BearerTokenSigner {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        non_empty_env("BEDROCK_API_TOKEN").map(Self::new)
    }
}

impl RequestSigner for BearerTokenSigner {
    fn sign(&self, _method: &str, _url: &str, _body: &[u8]) -> Result<Vec<(String, String)>> {
        Ok(vec![(
            "authorization".to_string(),
            format!("Bearer {}", self.token),
        )])
    }

    fn presign(&self, method: &str, url: &str, ttl_seconds: u64) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.token.as_bytes());
        hasher.update(method.as_bytes());
        hasher.update(url.as_bytes());
        hasher.update(ttl_seconds.to_be_bytes());
        let signature = hex::encode(hasher.finalize());
        Ok(format!("{url}?X-Expires={ttl_seconds}&X-Signature={signature}"))
    }
}

/// Narrow storage collaborator. `get` reports a missing object as `None`;
/// every other failure is an error.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn presign(&self, key: &str, ttl_seconds: u64) -> Result<String>;
}

/// In-memory store for tests and dry runs.
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?;
        Ok(objects.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?;
        objects.remove(key);
        Ok(())
    }

    fn presign(&self, key: &str, ttl_seconds: u64) -> Result<String> {
        Ok(format!(
            "memory://{}/{}?expires={}",
            self.bucket, key, ttl_seconds
        ))
    }
}

/// Object store speaking S3-style REST against a configurable base URL.
pub struct HttpObjectStore {
    api_base: String,
    bucket: String,
    http: HttpClient,
    signer: Arc<dyn RequestSigner>,
}

impl HttpObjectStore {
    pub fn new(
        api_base: impl Into<String>,
        bucket: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        Self {
            api_base: trim_base(api_base.into()),
            bucket: bucket.into(),
            http: HttpClient::new(),
            signer,
        }
    }

    pub fn for_region(region: &str, bucket: &str, signer: Arc<dyn RequestSigner>) -> Self {
        let api_base = non_empty_env("S3_API_BASE")
            .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
        Self::new(api_base, bucket, signer)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.bucket, key)
    }

    fn signed_request(
        &self,
        method: &str,
        url: &str,
        body: &[u8],
    ) -> Result<reqwest::blocking::RequestBuilder> {
        let mut request = match method {
            "PUT" => self.http.put(url),
            "DELETE" => self.http.delete(url),
            _ => self.http.get(url),
        };
        for (name, value) in self.signer.sign(method, url, body)? {
            request = request.header(name.as_str(), value.as_str());
        }
        Ok(request)
    }
}

impl ObjectStore for HttpObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let url = self.object_url(key);
        let response = self
            .signed_request("PUT", &url, bytes)?
            .body(bytes.to_vec())
            .send()
            .with_context(|| format!("object put failed ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "object put failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.object_url(key);
        let response = self
            .signed_request("GET", &url, &[])?
            .send()
            .with_context(|| format!("object get failed ({url})"))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "object get failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed reading object bytes ({url})"))?;
        Ok(Some(bytes.to_vec()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key);
        let response = self
            .signed_request("DELETE", &url, &[])?
            .send()
            .with_context(|| format!("object delete failed ({url})"))?;
        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            bail!("object delete failed ({})", status.as_u16());
        }
        Ok(())
    }

    fn presign(&self, key: &str, ttl_seconds: u64) -> Result<String> {
        self.signer.presign("GET", &self.object_url(key), ttl_seconds)
    }
}

/// Direct model-invocation collaborator. `invoke` posts a provider-shaped
/// body; `converse` targets the uniform chat route text models share.
pub trait ModelInvoker: Send + Sync {
    fn invoke(&self, model_id: &str, payload: &Value) -> Result<Value>;
    fn converse(&self, model_id: &str, payload: &Value) -> Result<Value>;
}

pub struct BedrockRuntimeClient {
    api_base: String,
    http: HttpClient,
    signer: Arc<dyn RequestSigner>,
}

impl BedrockRuntimeClient {
    pub fn new(api_base: impl Into<String>, signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            api_base: trim_base(api_base.into()),
            http: HttpClient::new(),
            signer,
        }
    }

    pub fn for_region(region: &str, signer: Arc<dyn RequestSigner>) -> Self {
        let api_base = non_empty_env("BEDROCK_API_BASE")
            .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
        Self::new(api_base, signer)
    }

    fn post_json(&self, url: &str, payload: &Value) -> Result<Value> {
        let body = serde_json::to_vec(payload).context("failed to encode request payload")?;
        let mut request = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .header("accept", "application/json");
        for (name, value) in self.signer.sign("POST", url, &body)? {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .body(body)
            .send()
            .with_context(|| format!("model request failed ({url})"))?;
        response_json_or_error(url, response)
    }
}

impl ModelInvoker for BedrockRuntimeClient {
    fn invoke(&self, model_id: &str, payload: &Value) -> Result<Value> {
        self.post_json(
            &format!("{}/model/{}/invoke", self.api_base, model_id),
            payload,
        )
    }

    fn converse(&self, model_id: &str, payload: &Value) -> Result<Value> {
        self.post_json(
            &format!("{}/model/{}/converse", self.api_base, model_id),
            payload,
        )
    }
}

/// Deterministic offline invoker backing tests and `--dry-run`. Answers
/// are derived from the prompt so repeated runs stay stable.
#[derive(Default)]
pub struct DryrunInvoker;

impl ModelInvoker for DryrunInvoker {
    fn invoke(&self, model_id: &str, payload: &Value) -> Result<Value> {
        if payload.get("text_prompts").is_some() {
            let prompt = payload
                .get("text_prompts")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(|row| row.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Ok(json!({
                "artifacts": [{"base64": dryrun_png_base64(prompt)?, "finishReason": "SUCCESS"}]
            }));
        }
        if payload.get("anthropic_version").is_some() {
            let prompt = payload
                .pointer("/messages/0/content/0/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!("dryrun vision answer: {}", truncate_text(prompt, 64)),
                }],
                "usage": {
                    "input_tokens": prompt.split_whitespace().count(),
                    "output_tokens": 12,
                }
            }));
        }
        if let Some(task) = payload.get("taskType").and_then(Value::as_str) {
            let prompt = match task {
                "INPAINTING" => payload.pointer("/inPaintingParams/text"),
                _ => payload.pointer("/textToImageParams/text"),
            }
            .and_then(Value::as_str)
            .unwrap_or_default();
            return Ok(json!({
                "images": [dryrun_png_base64(prompt)?],
                "error": Value::Null,
            }));
        }
        bail!("dryrun invoker does not recognize the payload shape for {model_id}")
    }

    fn converse(&self, model_id: &str, payload: &Value) -> Result<Value> {
        let prompt = payload
            .pointer("/messages/0/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(json!({
            "output": {"message": {
                "role": "assistant",
                "content": [{"text": format!("dryrun answer from {model_id}: {prompt}")}],
            }},
            "metrics": {"latencyMs": 7},
            "usage": {
                "inputTokens": prompt.split_whitespace().count(),
                "outputTokens": 9,
            }
        }))
    }
}

/// Secondary inference endpoint with the simpler `{inputs} -> generations`
/// contract.
pub trait TextEndpoint: Send + Sync {
    fn invoke_endpoint(&self, payload: &Value) -> Result<Value>;
}

pub struct FalconEndpointClient {
    api_base: String,
    endpoint_name: String,
    http: HttpClient,
    signer: Arc<dyn RequestSigner>,
}

impl FalconEndpointClient {
    pub fn new(
        api_base: impl Into<String>,
        endpoint_name: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        Self {
            api_base: trim_base(api_base.into()),
            endpoint_name: endpoint_name.into(),
            http: HttpClient::new(),
            signer,
        }
    }

    pub fn for_region(region: &str, endpoint_name: &str, signer: Arc<dyn RequestSigner>) -> Self {
        let api_base = non_empty_env("SAGEMAKER_API_BASE")
            .unwrap_or_else(|| format!("https://runtime.sagemaker.{region}.amazonaws.com"));
        Self::new(api_base, endpoint_name, signer)
    }

    fn invocation_url(&self) -> String {
        format!(
            "{}/endpoints/{}/invocations",
            self.api_base, self.endpoint_name
        )
    }
}

impl TextEndpoint for FalconEndpointClient {
    fn invoke_endpoint(&self, payload: &Value) -> Result<Value> {
        let url = self.invocation_url();
        let body = serde_json::to_vec(payload).context("failed to encode endpoint payload")?;
        let mut request = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        for (name, value) in self.signer.sign("POST", &url, &body)? {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .body(body)
            .send()
            .with_context(|| format!("endpoint request failed ({url})"))?;
        response_json_or_error(&url, response)
    }
}

#[derive(Default)]
pub struct DryrunTextEndpoint;

impl TextEndpoint for DryrunTextEndpoint {
    fn invoke_endpoint(&self, payload: &Value) -> Result<Value> {
        let inputs = payload
            .get("inputs")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(json!([{ "generated_text": format!("dryrun endpoint echo: {inputs}") }]))
    }
}

pub fn resolve_seed(mode: SeedMode) -> u32 {
    match mode {
        SeedMode::Fixed(seed) => seed,
        SeedMode::Random => rand::rng().random(),
    }
}

pub fn build_converse_payload(prompt: &str, settings: &TextGenerationSettings) -> Value {
    json!({
        "messages": [{"role": "user", "content": [{"text": prompt}]}],
        "inferenceConfig": {
            "temperature": settings.temperature,
            "maxTokens": settings.max_tokens,
            "topP": settings.top_p,
        }
    })
}

pub fn build_titan_image_payload(prompt: &str, settings: &ImageGenerationSettings) -> Value {
    json!({
        "taskType": "TEXT_IMAGE",
        "textToImageParams": {"text": prompt},
        "imageGenerationConfig": {
            "numberOfImages": settings.number_of_images,
            "quality": settings.quality,
            "height": settings.height,
            "width": settings.width,
            "cfgScale": settings.cfg_scale,
            "seed": resolve_seed(settings.seed_mode),
        }
    })
}

pub fn build_reference_image_payload(
    prompt: &str,
    reference_b64: &str,
    control: &ReferenceControl,
    settings: &ImageGenerationSettings,
) -> Value {
    json!({
        "taskType": "TEXT_IMAGE",
        "textToImageParams": {
            "text": prompt,
            "conditionImage": reference_b64,
            "controlMode": control.mode,
            "controlStrength": control.strength,
        },
        "imageGenerationConfig": {
            "numberOfImages": settings.number_of_images,
            "seed": resolve_seed(settings.seed_mode),
        }
    })
}

pub fn build_inpaint_payload(
    prompt: &str,
    image_b64: &str,
    mask_b64: &str,
    settings: &ImageGenerationSettings,
) -> Value {
    json!({
        "taskType": "INPAINTING",
        "inPaintingParams": {
            "text": prompt,
            "image": image_b64,
            "maskImage": mask_b64,
        },
        "imageGenerationConfig": {
            "numberOfImages": settings.number_of_images,
            "quality": settings.quality,
            "height": settings.height,
            "width": settings.width,
            "cfgScale": settings.cfg_scale,
            "seed": resolve_seed(settings.seed_mode),
        }
    })
}

pub fn build_stability_payload(prompt: &str, settings: &StabilitySettings) -> Value {
    json!({
        "text_prompts": [{"text": prompt}],
        "cfg_scale": settings.cfg_scale,
        "steps": settings.steps,
    })
}

pub fn build_multimodal_payload(
    prompt: &str,
    image_b64: &str,
    settings: &MultimodalSettings,
) -> Value {
    // Text block first, then the image block. The provider contract is
    // order-sensitive.
    json!({
        "anthropic_version": settings.anthropic_version,
        "max_tokens": settings.max_tokens,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": prompt},
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": "image/png",
                        "data": image_b64,
                    }
                },
            ],
        }],
    })
}

pub const MASK_STRIP_WIDTH: u32 = 300;
const MASK_TOP_INSET: u32 = 300;
const MASK_BOTTOM_INSET: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Derives the fixed interior box for an inpainting mask. The box must be
/// strictly inside the image bounds.
pub fn inpaint_mask_box(width: u32, height: u32) -> Result<MaskBox, DispatchError> {
    let too_small = || {
        DispatchError::validation(format!(
            "reference image {width}x{height} cannot contain the {MASK_STRIP_WIDTH}px inpainting box"
        ))
    };
    let left = width.checked_sub(MASK_STRIP_WIDTH).ok_or_else(too_small)? / 2;
    let top = height.checked_sub(MASK_TOP_INSET).ok_or_else(too_small)?;
    let right = width.saturating_add(MASK_STRIP_WIDTH) / 2;
    let bottom = height - MASK_BOTTOM_INSET;
    let boxed = MaskBox {
        left,
        top,
        right,
        bottom,
    };
    if left == 0 || top == 0 || left >= right || top >= bottom || right >= width || bottom >= height
    {
        return Err(too_small());
    }
    Ok(boxed)
}

/// Renders a binary inpainting mask at the source dimensions: interior
/// black (edit region), exterior white, per provider convention.
pub fn render_inpaint_mask(width: u32, height: u32, boxed: MaskBox) -> RgbImage {
    let mut mask = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    for y in boxed.top..boxed.bottom {
        for x in boxed.left..boxed.right {
            mask.put_pixel(x, y, Rgb([0, 0, 0]));
        }
    }
    mask
}

pub fn png_bytes(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(out.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePayloadFlavor {
    Titan,
    Stability,
}

pub fn image_payload_flavor(model_id: &str) -> Result<ImagePayloadFlavor, DispatchError> {
    if model_id == TITAN_IMAGE_V1 || model_id == TITAN_IMAGE_V2 {
        return Ok(ImagePayloadFlavor::Titan);
    }
    if model_id.starts_with(STABILITY_PREFIX) {
        return Ok(ImagePayloadFlavor::Stability);
    }
    Err(DispatchError::unsupported_model("Unsupported image model ID"))
}

pub fn parse_converse_text(response: &Value) -> Result<String, DispatchError> {
    let text = response
        .pointer("/output/message/content/0/text")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::provider("converse response is missing the message text"))?;
    let latency = response
        .pointer("/metrics/latencyMs")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let input_tokens = response
        .pointer("/usage/inputTokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output_tokens = response
        .pointer("/usage/outputTokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Ok(format!(
        "{text}\n--- Latency: {latency}ms - Input tokens:{input_tokens} - Output tokens:{output_tokens} ---\n"
    ))
}

pub fn parse_multimodal_text(response: &Value) -> Result<(String, i64, i64), DispatchError> {
    let text = response
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::provider("multimodal response is missing the content text"))?;
    let input_tokens = response
        .pointer("/usage/input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output_tokens = response
        .pointer("/usage/output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Ok((text.to_string(), input_tokens, output_tokens))
}

/// Extracts the first generated image from a provider response and
/// decodes it.
pub fn parse_image_bytes(
    response: &Value,
    flavor: ImagePayloadFlavor,
) -> Result<Vec<u8>, DispatchError> {
    if let Some(reason) = response.get("error").filter(|value| !value.is_null()) {
        return Err(DispatchError::provider(format!(
            "Image generation error. Error is {reason}"
        )));
    }
    let encoded = match flavor {
        ImagePayloadFlavor::Titan => response
            .get("images")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_str),
        ImagePayloadFlavor::Stability => response
            .get("artifacts")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("base64"))
            .and_then(Value::as_str),
    }
    .map(str::trim)
    .filter(|value| !value.is_empty())
    .ok_or_else(|| DispatchError::no_image_data("No image data found in the response."))?;
    BASE64
        .decode(encoded.as_bytes())
        .map_err(|_| DispatchError::no_image_data("No image data found in the response."))
}

pub const MESSAGE_TYPE_DELIMITER: &str = ":message-type";
const FINAL_RESPONSE_MARKER: &str = "finalResponse";

/// Decoded output of one agent invocation: intermediate trace frames and
/// the final answer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentReply {
    pub trace: String,
    pub answer: String,
}

/// Reconstructs the final answer and trace channel from the chunked agent
/// event stream.
///
/// The stream multiplexes two shapes: framed events carrying a quoted
/// base64 `bytes` payload, and a raw JSON tail holding a `finalResponse`
/// record. Framed events before the last delimiter are trace frames; the
/// last segment is the answer if framed, otherwise the tail is scanned.
/// A chunk that is not valid UTF-8 is dropped whole — partial multi-byte
/// sequences across chunk boundaries are a known lossy edge of the wire
/// format, not repaired here.
pub fn decode_agent_stream<I>(chunks: I) -> Result<AgentReply, DispatchError>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut buffer = String::new();
    for chunk in chunks {
        match String::from_utf8(chunk) {
            Ok(text) => buffer.push_str(&text),
            Err(_) => continue,
        }
    }

    let segments: Vec<&str> = buffer.split(MESSAGE_TYPE_DELIMITER).collect();
    let last_index = segments.len() - 1;

    let mut trace_lines: Vec<String> = Vec::new();
    for segment in &segments[..last_index] {
        if segment.contains("bytes") {
            trace_lines.push(decode_frame_payload(segment)?);
        }
    }

    let last = segments[last_index];
    let raw_answer = if last.contains("bytes") {
        decode_frame_payload(last)?
    } else {
        final_response_text(&buffer)?
    };

    Ok(AgentReply {
        trace: trace_lines.join("\n"),
        answer: normalize_answer(&raw_answer),
    })
}

fn decode_frame_payload(segment: &str) -> Result<String, DispatchError> {
    let encoded = segment.split('"').nth(3).ok_or_else(|| {
        DispatchError::stream_decode(
            "event frame carries a bytes marker but no quoted payload field",
        )
    })?;
    let decoded = BASE64
        .decode(encoded.as_bytes())
        .map_err(|err| DispatchError::stream_decode(format!("frame payload is not valid base64: {err}")))?;
    String::from_utf8(decoded)
        .map_err(|_| DispatchError::stream_decode("frame payload is not valid UTF-8"))
}

fn final_response_text(buffer: &str) -> Result<String, DispatchError> {
    let idx = buffer.find(FINAL_RESPONSE_MARKER).ok_or_else(|| {
        DispatchError::stream_decode(
            "stream carries neither a framed answer nor a finalResponse tail",
        )
    })?;
    let tail = buffer[idx + FINAL_RESPONSE_MARKER.len()..].trim_start_matches(['"', ':', ' ']);
    if tail.starts_with('{') {
        let end = tail
            .find("\"}")
            .map(|found| found + 2)
            .ok_or_else(|| DispatchError::stream_decode("unterminated finalResponse record"))?;
        let record: Value = serde_json::from_str(&tail[..end])
            .map_err(|err| DispatchError::stream_decode(format!("malformed finalResponse record: {err}")))?;
        record
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                DispatchError::stream_decode("finalResponse record has no text field")
            })
    } else {
        // Bare-string tail: the leading quote was consumed above, so the
        // answer runs to the next quote.
        tail.find('"')
            .map(|end| tail[..end].to_string())
            .ok_or_else(|| DispatchError::stream_decode("unterminated finalResponse text"))
    }
}

/// Strips the quote characters and wrapper substrings the upstream
/// framing sometimes leaves embedded in the answer.
fn normalize_answer(raw: &str) -> String {
    raw.replace('"', "")
        .replace("{input:{value:", "")
        .replace(",source:null}}", "")
}

/// Long-lived agent invocation: signed POST, chunked body read, stream
/// decode.
pub struct AgentRuntimeClient {
    api_base: String,
    agent_id: String,
    alias_id: String,
    http: HttpClient,
    signer: Arc<dyn RequestSigner>,
}

impl AgentRuntimeClient {
    pub fn new(
        api_base: impl Into<String>,
        agent_id: impl Into<String>,
        alias_id: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        Self {
            api_base: trim_base(api_base.into()),
            agent_id: agent_id.into(),
            alias_id: alias_id.into(),
            http: HttpClient::new(),
            signer,
        }
    }

    pub fn from_env(region: &str, signer: Arc<dyn RequestSigner>) -> Result<Self> {
        let agent_id = non_empty_env("AGENT_ID")
            .ok_or_else(|| anyhow::anyhow!("AGENT_ID not set"))?;
        let alias_id = non_empty_env("AGENT_ALIAS_ID")
            .ok_or_else(|| anyhow::anyhow!("AGENT_ALIAS_ID not set"))?;
        let api_base = non_empty_env("AGENT_API_BASE")
            .unwrap_or_else(|| format!("https://bedrock-agent-runtime.{region}.amazonaws.com"));
        Ok(Self::new(api_base, agent_id, alias_id, signer))
    }

    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/agents/{}/agentAliases/{}/sessions/{}/text",
            self.api_base, self.agent_id, self.alias_id, session_id
        )
    }

    pub fn ask(
        &self,
        session_id: &str,
        question: &str,
        end_session: bool,
    ) -> Result<AgentReply, DispatchError> {
        let url = self.session_url(session_id);
        let body = serde_json::to_vec(&json!({
            "inputText": question,
            "enableTrace": true,
            "endSession": end_session,
        }))
        .map_err(|err| DispatchError::provider(format!("failed to encode agent request: {err}")))?;
        let headers = self
            .signer
            .sign("POST", &url, &body)
            .map_err(|err| DispatchError::provider(format!("request signing failed: {err:#}")))?;

        let mut request = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("accept", "application/json");
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let mut response = request
            .body(body)
            .send()
            .map_err(|err| DispatchError::provider(format!("agent request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(DispatchError::provider(format!(
                "agent request failed ({}): {}",
                status.as_u16(),
                truncate_text(&text, 512)
            )));
        }

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match response.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => chunks.push(buf[..read].to_vec()),
                Err(err) => {
                    return Err(DispatchError::provider(format!(
                        "agent stream read failed: {err}"
                    )))
                }
            }
        }
        decode_agent_stream(chunks)
    }
}

const SUPPORTED_UPLOAD_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn supported_upload_extension(extension: &str) -> bool {
    SUPPORTED_UPLOAD_EXTENSIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(extension))
}

/// Converts an uploaded image to PNG bytes for the reference slot.
pub fn encode_reference_png(bytes: &[u8]) -> Result<Vec<u8>, DispatchError> {
    let decoded = image::load_from_memory(bytes).map_err(|err| {
        DispatchError::validation(format!("uploaded file is not a decodable image: {err}"))
    })?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| DispatchError::validation(format!("failed to convert upload to PNG: {err}")))?;
    Ok(out.into_inner())
}

/// Proportional downscale to the preview width. Images at or below the
/// target pass through untouched.
pub fn shrink_to_width(decoded: DynamicImage, target_width: u32) -> DynamicImage {
    let (width, height) = decoded.dimensions();
    if width <= target_width {
        return decoded;
    }
    let new_height = ((target_width as f64) * (height as f64) / (width as f64)).round() as u32;
    decoded.resize_exact(target_width, new_height.max(1), FilterType::Lanczos3)
}

/// The dispatch pipeline: normalizer, capability lookup, builder, invoker,
/// parser, envelope. One envelope per inbound event, always.
pub struct Dispatcher {
    config: DispatchConfig,
    catalog: ModelCatalog,
    store: Arc<dyn ObjectStore>,
    invoker: Arc<dyn ModelInvoker>,
    endpoint: Option<Arc<dyn TextEndpoint>>,
    events: Option<EventWriter>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn ObjectStore>,
        invoker: Arc<dyn ModelInvoker>,
    ) -> Self {
        Self {
            config,
            catalog: ModelCatalog::default(),
            store,
            invoker,
            endpoint: None,
            events: None,
        }
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Arc<dyn TextEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Handles one action event. Never returns an error and never
    /// panics through: any failure becomes an envelope.
    pub fn handle(&self, event: &Value) -> ApiResponse {
        let api_path = event
            .get("apiPath")
            .and_then(Value::as_str)
            .unwrap_or("/unknown")
            .to_string();
        self.emit("invocation_received", json!({"api_path": api_path}));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.route(&api_path, event)
        }));
        let (code, body) = match outcome {
            Ok(result) => result,
            Err(_) => {
                self.emit("dispatch_panicked", json!({"api_path": api_path}));
                (500, json!({"error": "Internal dispatcher error"}))
            }
        };

        self.emit(
            "envelope_built",
            json!({"api_path": api_path, "http_status_code": code}),
        );
        build_response(code, body, event)
    }

    fn route(&self, api_path: &str, event: &Value) -> (u16, Value) {
        match api_path {
            "/callBedrockModel" | "/callModel" => self.call_model(event),
            "/callFalconModel" => self.call_falcon(event),
            _ => (404, Value::String("Invalid API path".to_string())),
        }
    }

    fn call_model(&self, event: &Value) -> (u16, Value) {
        let request = match InvocationRequest::from_event(event) {
            Ok(request) => request,
            Err(err) => return (400, json!({"error": err.message()})),
        };
        match self.run_model_request(&request) {
            Ok(body) => (200, body),
            Err(err) => {
                self.emit(
                    "dispatch_failed",
                    json!({
                        "model_id": request.model_id,
                        "kind": err.kind().label(),
                        "message": err.message(),
                    }),
                );
                // The wire contract reports most model failures as a
                // structurally successful call with an error body; only
                // validation failures map to a client error code.
                let code = if err.is_validation() { 400 } else { 200 };
                (code, json!({"error": err.message()}))
            }
        }
    }

    fn run_model_request(&self, request: &InvocationRequest) -> Result<Value, DispatchError> {
        let resolved = resolve_strategy(&self.catalog, &request.model_id);

        let wants_reference = match resolved {
            ModelStrategy::PlainText => self.catalog.supports(&request.model_id, "vision"),
            ModelStrategy::ImageGenerate => {
                request.model_id == TITAN_IMAGE_V1 && signals_edit_intent(&request.prompt)
            }
            ModelStrategy::ImageGenerateWithReference => true,
            _ => false,
        };
        let reference = if wants_reference {
            self.fetch_reference()?
        } else {
            None
        };

        let strategy = refine_strategy(
            &self.catalog,
            resolved,
            &request.model_id,
            &request.prompt,
            reference.is_some(),
        );
        self.emit(
            "strategy_resolved",
            json!({"model_id": request.model_id, "strategy": strategy.label()}),
        );

        match strategy {
            ModelStrategy::PlainText => self.text_generation(request),
            ModelStrategy::MultimodalVision => self.multimodal_vision(request, reference),
            ModelStrategy::ImageGenerate => self.image_generation(request),
            ModelStrategy::ImageGenerateWithReference => {
                self.reference_generation(request, reference)
            }
            ModelStrategy::Inpaint => self.inpaint(request, reference),
            ModelStrategy::Unsupported => Err(DispatchError::unsupported_model(
                "Unsupported text model ID",
            )),
        }
    }

    fn text_generation(&self, request: &InvocationRequest) -> Result<Value, DispatchError> {
        let payload = build_converse_payload(&request.prompt, &self.config.text);
        let started = Instant::now();
        let response = self
            .invoker
            .converse(&request.model_id, &payload)
            .map_err(|err| DispatchError::wrap(DispatchErrorKind::Provider, &err))?;
        self.emit(
            "model_invoked",
            json!({
                "model_id": request.model_id,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        let text = parse_converse_text(&response)?;
        Ok(json!({"result": text}))
    }

    fn multimodal_vision(
        &self,
        request: &InvocationRequest,
        reference: Option<Vec<u8>>,
    ) -> Result<Value, DispatchError> {
        let bytes = reference
            .ok_or_else(|| DispatchError::storage("Failed to fetch reference image from S3"))?;
        let payload = build_multimodal_payload(
            &request.prompt,
            &BASE64.encode(&bytes),
            &self.config.multimodal,
        );
        let response = self.invoke_model(&request.model_id, &payload)?;
        let (text, input_tokens, output_tokens) = parse_multimodal_text(&response)?;
        self.emit(
            "invocation_metrics",
            json!({
                "model_id": request.model_id,
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
            }),
        );
        Ok(json!({"result": text}))
    }

    fn image_generation(&self, request: &InvocationRequest) -> Result<Value, DispatchError> {
        let flavor = image_payload_flavor(&request.model_id)?;
        let payload = match flavor {
            ImagePayloadFlavor::Titan => {
                build_titan_image_payload(&request.prompt, &self.config.image)
            }
            ImagePayloadFlavor::Stability => {
                build_stability_payload(&request.prompt, &self.config.stability)
            }
        };
        let response = self.invoke_model(&request.model_id, &payload)?;
        let image = parse_image_bytes(&response, flavor)?;
        let url = self.persist_image(
            &self.config.reference_key,
            self.config.generated_url_ttl,
            &image,
        )?;
        Ok(json!({"message": "Image generated successfully", "image_url": url}))
    }

    fn reference_generation(
        &self,
        request: &InvocationRequest,
        reference: Option<Vec<u8>>,
    ) -> Result<Value, DispatchError> {
        let bytes = reference
            .ok_or_else(|| DispatchError::storage("Failed to fetch reference image from S3"))?;
        let payload = build_reference_image_payload(
            &request.prompt,
            &BASE64.encode(&bytes),
            &self.config.control,
            &self.config.image,
        );
        let response = self.invoke_model(&request.model_id, &payload)?;
        let image = parse_image_bytes(&response, ImagePayloadFlavor::Titan)?;
        let url = self.persist_image(
            &self.config.reference_key,
            self.config.generated_url_ttl,
            &image,
        )?;
        Ok(json!({"message": "Image generated successfully", "image_url": url}))
    }

    fn inpaint(
        &self,
        request: &InvocationRequest,
        reference: Option<Vec<u8>>,
    ) -> Result<Value, DispatchError> {
        let bytes = reference.ok_or_else(|| {
            DispatchError::validation("Reference image not found for inpainting")
        })?;
        let source = image::load_from_memory(&bytes).map_err(|err| {
            DispatchError::validation(format!("reference image is not decodable: {err}"))
        })?;
        let (width, height) = source.dimensions();
        let boxed = inpaint_mask_box(width, height)?;
        let mask = render_inpaint_mask(width, height, boxed);
        let mask_png = png_bytes(&mask)
            .map_err(|err| DispatchError::wrap(DispatchErrorKind::Validation, &err))?;

        let payload = build_inpaint_payload(
            &request.prompt,
            &BASE64.encode(&bytes),
            &BASE64.encode(&mask_png),
            &self.config.inpaint,
        );
        let response = self.invoke_model(&request.model_id, &payload)?;
        let image = parse_image_bytes(&response, ImagePayloadFlavor::Titan)?;
        // The unmodified source stays under the reference key; the edit
        // lands under its own key.
        let url = self.persist_image(
            &self.config.modified_key,
            self.config.modified_url_ttl,
            &image,
        )?;
        Ok(json!({"message": "Image generated successfully", "image_url": url}))
    }

    fn call_falcon(&self, event: &Value) -> (u16, Value) {
        let prompt = match named_parameter(event, "prompt") {
            Ok(prompt) => prompt,
            Err(err) => return (400, json!({"error": err.message()})),
        };
        let Some(endpoint) = self.endpoint.as_ref() else {
            self.emit(
                "dispatch_failed",
                json!({"kind": "provider", "message": "no secondary text endpoint configured"}),
            );
            return (500, Value::String("Error calling Falcon model".to_string()));
        };
        match endpoint.invoke_endpoint(&json!({"inputs": prompt})) {
            Ok(body) => (200, json!({"result": body})),
            Err(err) => {
                self.emit(
                    "dispatch_failed",
                    json!({"kind": "provider", "message": format!("{err:#}")}),
                );
                (500, Value::String("Error calling Falcon model".to_string()))
            }
        }
    }

    fn invoke_model(&self, model_id: &str, payload: &Value) -> Result<Value, DispatchError> {
        let started = Instant::now();
        let response = self
            .invoker
            .invoke(model_id, payload)
            .map_err(|err| DispatchError::wrap(DispatchErrorKind::Provider, &err))?;
        self.emit(
            "model_invoked",
            json!({
                "model_id": model_id,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        Ok(response)
    }

    fn fetch_reference(&self) -> Result<Option<Vec<u8>>, DispatchError> {
        self.store.get(&self.config.reference_key).map_err(|err| {
            DispatchError::storage(format!("Failed to fetch reference image from S3: {err:#}"))
        })
    }

    fn persist_image(
        &self,
        key: &str,
        ttl_seconds: u64,
        bytes: &[u8],
    ) -> Result<String, DispatchError> {
        self.store.put(key, bytes).map_err(|err| {
            DispatchError::storage(format!("generated image could not be stored: {err:#}"))
        })?;
        self.emit(
            "image_persisted",
            json!({
                "key": key,
                "bytes": bytes.len(),
                "sha256": sha256_hex(bytes),
            }),
        );
        self.store.presign(key, ttl_seconds).map_err(|err| {
            DispatchError::storage(format!(
                "generated image stored but presign failed: {err:#}"
            ))
        })
    }

    // Events are best-effort diagnostics; a write failure never breaks
    // the one-envelope-per-invocation contract.
    fn emit(&self, event_type: &str, payload: Value) {
        if let Some(events) = &self.events {
            let _ = events.emit(event_type, map_object(payload));
        }
    }
}

fn response_json_or_error(url: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        bail!(
            "request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    response
        .json()
        .with_context(|| format!("failed parsing JSON response ({url})"))
}

fn dryrun_png_base64(prompt: &str) -> Result<String> {
    let (r, g, b) = color_from_prompt(prompt);
    let image = RgbImage::from_pixel(8, 8, Rgb([r, g, b]));
    Ok(BASE64.encode(png_bytes(&image)?))
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn trim_base(value: String) -> String {
    value.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Arc;

    use serde_json::{json, Value};
    use switchyard_contracts::errors::DispatchErrorKind;
    use switchyard_contracts::events::EventWriter;

    use super::*;

    fn bedrock_event(model_id: &str, prompt: &str) -> Value {
        json!({
            "actionGroup": "modelOps",
            "apiPath": "/callBedrockModel",
            "httpMethod": "POST",
            "parameters": [
                {"name": "modelId", "value": model_id},
                {"name": "prompt", "value": prompt}
            ]
        })
    }

    fn dryrun_dispatcher() -> (Dispatcher, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new(DEFAULT_IMAGE_BUCKET));
        let dispatcher = Dispatcher::new(
            DispatchConfig::default(),
            store.clone(),
            Arc::new(DryrunInvoker),
        );
        (dispatcher, store)
    }

    fn envelope_body(envelope: &ApiResponse) -> &Value {
        &envelope.response.response_body.json.body
    }

    fn seed_reference(store: &MemoryObjectStore, width: u32, height: u32) {
        let image = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        store
            .put(DEFAULT_REFERENCE_KEY, &png_bytes(&image).unwrap())
            .unwrap();
    }

    #[test]
    fn mask_box_is_strictly_interior_for_admitted_sizes() {
        for (width, height) in [(1024, 1024), (512, 512), (640, 480), (302, 302)] {
            let boxed = inpaint_mask_box(width, height).unwrap();
            assert!(boxed.left > 0, "{width}x{height}");
            assert!(boxed.left < boxed.right);
            assert!(boxed.right < width);
            assert!(boxed.top > 0);
            assert!(boxed.top < boxed.bottom);
            assert!(boxed.bottom < height);
        }
    }

    #[test]
    fn mask_box_rejects_images_that_cannot_contain_it() {
        for (width, height) in [(300, 1024), (301, 1024), (1024, 300), (1024, 150), (0, 0)] {
            let err = inpaint_mask_box(width, height).unwrap_err();
            assert!(err.is_validation(), "{width}x{height}");
        }
    }

    #[test]
    fn mask_render_matches_dimensions_and_convention() {
        let (width, height) = (512, 512);
        let boxed = inpaint_mask_box(width, height).unwrap();
        let mask = render_inpaint_mask(width, height, boxed);
        assert_eq!(mask.dimensions(), (width, height));
        assert_eq!(*mask.get_pixel(0, 0), Rgb([255, 255, 255]));
        assert_eq!(
            *mask.get_pixel(boxed.left, boxed.top),
            Rgb([0, 0, 0]),
            "box interior is black"
        );
        assert_eq!(
            *mask.get_pixel(boxed.right, boxed.top),
            Rgb([255, 255, 255]),
            "box exterior stays white"
        );
        assert_eq!(
            *mask.get_pixel(boxed.left, boxed.bottom),
            Rgb([255, 255, 255])
        );
    }

    #[test]
    fn fixed_seed_payloads_are_byte_identical() {
        let settings = ImageGenerationSettings::default();
        let first = serde_json::to_string(&build_titan_image_payload("a boat", &settings)).unwrap();
        let second =
            serde_json::to_string(&build_titan_image_payload("a boat", &settings)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn random_seed_mode_varies_across_draws() {
        let seeds: HashSet<u32> = (0..16).map(|_| resolve_seed(SeedMode::Random)).collect();
        assert_eq!(seeds.len(), 16, "expected no repeats in 16 draws");
    }

    #[test]
    fn titan_payload_carries_the_generation_config() {
        let payload = build_titan_image_payload("a boat", &ImageGenerationSettings::default());
        assert_eq!(payload["taskType"], json!("TEXT_IMAGE"));
        assert_eq!(payload["textToImageParams"]["text"], json!("a boat"));
        assert_eq!(payload["imageGenerationConfig"]["numberOfImages"], json!(1));
        assert_eq!(payload["imageGenerationConfig"]["quality"], json!("standard"));
        assert_eq!(payload["imageGenerationConfig"]["cfgScale"], json!(7.5));
        assert_eq!(payload["imageGenerationConfig"]["seed"], json!(42));
    }

    #[test]
    fn multimodal_blocks_are_text_then_image() {
        let payload = build_multimodal_payload("what is this", "QUJD", &MultimodalSettings::default());
        let content = payload["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], json!("text"));
        assert_eq!(content[1]["type"], json!("image"));
        assert_eq!(content[1]["source"]["data"], json!("QUJD"));
    }

    #[test]
    fn reference_payload_carries_control_parameters() {
        let payload = build_reference_image_payload(
            "a boat",
            "QUJD",
            &ReferenceControl::default(),
            &ImageGenerationSettings::default(),
        );
        assert_eq!(payload["textToImageParams"]["conditionImage"], json!("QUJD"));
        assert_eq!(payload["textToImageParams"]["controlMode"], json!("CANNY_EDGE"));
        assert_eq!(payload["textToImageParams"]["controlStrength"], json!(0.7));
    }

    #[test]
    fn reference_control_strength_is_clamped() {
        assert_eq!(ReferenceControl::new("CANNY_EDGE", 1.7).strength, 1.0);
        assert_eq!(ReferenceControl::new("CANNY_EDGE", -0.2).strength, 0.0);
    }

    #[test]
    fn converse_parse_appends_the_latency_footer() {
        let response = json!({
            "output": {"message": {"content": [{"text": "hi there"}]}},
            "metrics": {"latencyMs": 321},
            "usage": {"inputTokens": 5, "outputTokens": 9}
        });
        let text = parse_converse_text(&response).unwrap();
        assert_eq!(
            text,
            "hi there\n--- Latency: 321ms - Input tokens:5 - Output tokens:9 ---\n"
        );
    }

    #[test]
    fn image_parse_reads_titan_and_stability_shapes() {
        let encoded = BASE64.encode(b"png-bytes");
        let titan = json!({"images": [encoded], "error": Value::Null});
        assert_eq!(
            parse_image_bytes(&titan, ImagePayloadFlavor::Titan).unwrap(),
            b"png-bytes"
        );
        let stability = json!({"artifacts": [{"base64": encoded}]});
        assert_eq!(
            parse_image_bytes(&stability, ImagePayloadFlavor::Stability).unwrap(),
            b"png-bytes"
        );
    }

    #[test]
    fn empty_image_list_is_no_image_data() {
        let err = parse_image_bytes(&json!({"images": []}), ImagePayloadFlavor::Titan).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::NoImageData);
        assert_eq!(err.message(), "No image data found in the response.");

        let err =
            parse_image_bytes(&json!({"images": ["%%%"]}), ImagePayloadFlavor::Titan).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::NoImageData);
    }

    #[test]
    fn provider_error_field_wins_over_image_extraction() {
        let response = json!({"images": ["QUJD"], "error": "content filtered"});
        let err = parse_image_bytes(&response, ImagePayloadFlavor::Titan).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::Provider);
        assert!(err.message().contains("content filtered"));
    }

    fn frame(payload: &str) -> String {
        format!("{{\"bytes\":\"{}\",\"headers\":9}}", BASE64.encode(payload))
    }

    #[test]
    fn stream_round_trip_reproduces_the_answer() {
        let stream = format!(
            "preamble:message-type{}:message-type{}",
            frame("searching the knowledge base"),
            frame("{input:{value:All done.,source:null}}"),
        );
        let bytes = stream.into_bytes();
        // Split at arbitrary boundaries to exercise chunk reassembly.
        let chunks = vec![
            bytes[..17].to_vec(),
            bytes[17..63].to_vec(),
            bytes[63..].to_vec(),
        ];
        let reply = decode_agent_stream(chunks).unwrap();
        assert_eq!(reply.trace, "searching the knowledge base");
        assert_eq!(reply.answer, "All done.");
    }

    #[test]
    fn final_response_tail_is_used_when_last_segment_has_no_bytes() {
        let chunks = vec![
            format!("start:message-type{}:message-type", frame("thinking"))
                .into_bytes(),
            b"{\"finalResponse\":{\"text\":\"done\"},\"sessionId\":\"s-1\"}".to_vec(),
        ];
        let reply = decode_agent_stream(chunks).unwrap();
        assert_eq!(reply.answer, "done");
        assert_eq!(reply.trace, "thinking");
    }

    #[test]
    fn bare_string_final_response_tail_is_accepted() {
        let chunks = vec![b"x:message-type plain tail \"finalResponse\":\"done\"}".to_vec()];
        let reply = decode_agent_stream(chunks).unwrap();
        assert_eq!(reply.answer, "done");
    }

    #[test]
    fn undecodable_chunks_are_dropped_not_fatal() {
        let chunks = vec![
            b"head:message-type".to_vec(),
            vec![0xff, 0xfe, 0xfd],
            frame("{input:{value:ok,source:null}}").into_bytes(),
        ];
        let reply = decode_agent_stream(chunks).unwrap();
        assert_eq!(reply.answer, "ok");
    }

    #[test]
    fn bytes_marker_without_quoted_payload_is_a_decode_error() {
        let chunks = vec![b"x:message-type raw bytes marker with no quotes".to_vec()];
        let err = decode_agent_stream(chunks).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::StreamDecode);
    }

    #[test]
    fn empty_stream_is_a_decode_error() {
        let err = decode_agent_stream(Vec::<Vec<u8>>::new()).unwrap_err();
        assert_eq!(err.kind(), DispatchErrorKind::StreamDecode);
    }

    #[test]
    fn plain_text_scenario_returns_footered_result() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let envelope = dispatcher.handle(&bedrock_event("amazon.titan-text-lite-v1", "hello"));
        assert_eq!(envelope.response.http_status_code, 200);
        let result = envelope_body(&envelope)["result"].as_str().unwrap();
        assert!(result.contains("dryrun answer from amazon.titan-text-lite-v1: hello"));
        assert!(result.contains("--- Latency: 7ms - Input tokens:1 - Output tokens:9 ---"));
    }

    #[test]
    fn unsupported_model_is_a_structurally_successful_error() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let envelope = dispatcher.handle(&bedrock_event("unknown.model-x", "hello"));
        assert_eq!(envelope.response.http_status_code, 200);
        assert_eq!(
            envelope_body(&envelope),
            &json!({"error": "Unsupported text model ID"})
        );
    }

    #[test]
    fn unknown_api_path_maps_to_404() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let mut event = bedrock_event("amazon.titan-text-lite-v1", "hello");
        event["apiPath"] = json!("/notARoute");
        let envelope = dispatcher.handle(&event);
        assert_eq!(envelope.response.http_status_code, 404);
        assert_eq!(envelope_body(&envelope), &json!("Invalid API path"));
    }

    #[test]
    fn missing_prompt_parameter_is_a_400() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let event = json!({
            "apiPath": "/callBedrockModel",
            "parameters": [{"name": "modelId", "value": "amazon.titan-text-lite-v1"}]
        });
        let envelope = dispatcher.handle(&event);
        assert_eq!(envelope.response.http_status_code, 400);
        assert_eq!(
            envelope_body(&envelope),
            &json!({"error": "Missing named parameter 'prompt'"})
        );
    }

    #[test]
    fn image_generation_persists_and_returns_a_url() {
        let (dispatcher, store) = dryrun_dispatcher();
        let envelope = dispatcher.handle(&bedrock_event(TITAN_IMAGE_V1, "a boat on a lake"));
        assert_eq!(envelope.response.http_status_code, 200);
        let body = envelope_body(&envelope);
        assert_eq!(body["message"], json!("Image generated successfully"));
        let url = body["image_url"].as_str().unwrap();
        assert!(url.starts_with("memory://bedrock-agent-images/the_image.png"));
        assert!(url.contains("expires=3600"));
        assert!(store.contains(DEFAULT_REFERENCE_KEY));
    }

    #[test]
    fn stability_models_use_the_artifact_shape() {
        let (dispatcher, store) = dryrun_dispatcher();
        let envelope =
            dispatcher.handle(&bedrock_event("stability.stable-diffusion-xl-v1", "a boat"));
        assert_eq!(envelope.response.http_status_code, 200);
        assert_eq!(
            envelope_body(&envelope)["message"],
            json!("Image generated successfully")
        );
        assert!(store.contains(DEFAULT_REFERENCE_KEY));
    }

    #[test]
    fn unknown_titan_image_variant_is_unsupported() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let envelope = dispatcher.handle(&bedrock_event("amazon.titan-image-generator-v9", "x"));
        assert_eq!(envelope.response.http_status_code, 200);
        assert_eq!(
            envelope_body(&envelope),
            &json!({"error": "Unsupported image model ID"})
        );
    }

    #[test]
    fn edit_intent_inpaints_under_the_modified_key() {
        let (dispatcher, store) = dryrun_dispatcher();
        seed_reference(&store, 512, 512);
        let envelope = dispatcher.handle(&bedrock_event(TITAN_IMAGE_V1, "change the sky to dusk"));
        assert_eq!(envelope.response.http_status_code, 200);
        let url = envelope_body(&envelope)["image_url"].as_str().unwrap();
        assert!(url.contains(DEFAULT_MODIFIED_KEY));
        assert!(url.contains("expires=604800"));
        assert!(store.contains(DEFAULT_MODIFIED_KEY));
        // The inpainting source stays untouched under the reference key.
        assert!(store.contains(DEFAULT_REFERENCE_KEY));
    }

    #[test]
    fn edit_intent_without_reference_is_a_validation_error() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let envelope = dispatcher.handle(&bedrock_event(TITAN_IMAGE_V1, "change the sky"));
        assert_eq!(envelope.response.http_status_code, 400);
        assert_eq!(
            envelope_body(&envelope),
            &json!({"error": "Reference image not found for inpainting"})
        );
    }

    #[test]
    fn reference_generation_requires_the_stored_image() {
        let (dispatcher, store) = dryrun_dispatcher();
        let envelope = dispatcher.handle(&bedrock_event(TITAN_IMAGE_V2, "a boat"));
        assert_eq!(envelope.response.http_status_code, 200);
        assert_eq!(
            envelope_body(&envelope),
            &json!({"error": "Failed to fetch reference image from S3"})
        );

        seed_reference(&store, 64, 64);
        let envelope = dispatcher.handle(&bedrock_event(TITAN_IMAGE_V2, "a boat"));
        assert_eq!(
            envelope_body(&envelope)["message"],
            json!("Image generated successfully")
        );
    }

    #[test]
    fn stored_reference_upgrades_claude_to_multimodal() {
        let (dispatcher, store) = dryrun_dispatcher();
        seed_reference(&store, 64, 64);
        let envelope = dispatcher.handle(&bedrock_event(
            "anthropic.claude-3-haiku-20240307-v1:0",
            "what is in this picture?",
        ));
        assert_eq!(envelope.response.http_status_code, 200);
        let result = envelope_body(&envelope)["result"].as_str().unwrap();
        assert!(result.starts_with("dryrun vision answer:"));
    }

    #[test]
    fn falcon_route_uses_the_secondary_endpoint() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let dispatcher = dispatcher.with_endpoint(Arc::new(DryrunTextEndpoint));
        let event = json!({
            "apiPath": "/callFalconModel",
            "parameters": [{"name": "prompt", "value": "hello falcon"}]
        });
        let envelope = dispatcher.handle(&event);
        assert_eq!(envelope.response.http_status_code, 200);
        assert_eq!(
            envelope_body(&envelope),
            &json!({"result": [{"generated_text": "dryrun endpoint echo: hello falcon"}]})
        );
    }

    #[test]
    fn falcon_route_without_endpoint_is_a_500() {
        let (dispatcher, _store) = dryrun_dispatcher();
        let event = json!({
            "apiPath": "/callFalconModel",
            "parameters": [{"name": "prompt", "value": "hello"}]
        });
        let envelope = dispatcher.handle(&event);
        assert_eq!(envelope.response.http_status_code, 500);
        assert_eq!(envelope_body(&envelope), &json!("Error calling Falcon model"));
    }

    #[test]
    fn dispatch_emits_events_in_pipeline_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let (dispatcher, _store) = dryrun_dispatcher();
        let dispatcher = dispatcher.with_events(EventWriter::new(&events_path, "req-1"));

        let envelope = dispatcher.handle(&bedrock_event(TITAN_IMAGE_V1, "a boat"));
        assert_eq!(envelope.response.http_status_code, 200);

        let raw = fs::read_to_string(&events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();

        let received = types
            .iter()
            .position(|value| value == "invocation_received")
            .expect("missing invocation_received");
        let resolved = types
            .iter()
            .position(|value| value == "strategy_resolved")
            .expect("missing strategy_resolved");
        let invoked = types
            .iter()
            .position(|value| value == "model_invoked")
            .expect("missing model_invoked");
        let persisted = types
            .iter()
            .position(|value| value == "image_persisted")
            .expect("missing image_persisted");
        let built = types
            .iter()
            .position(|value| value == "envelope_built")
            .expect("missing envelope_built");

        assert!(received < resolved);
        assert!(resolved < invoked);
        assert!(invoked < persisted);
        assert!(persisted < built);
        Ok(())
    }

    #[test]
    fn upload_conversion_produces_png_bytes() {
        let source = RgbImage::from_pixel(16, 16, Rgb([200, 100, 50]));
        let mut jpeg = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(source)
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();
        let png = encode_reference_png(&jpeg.into_inner()).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn upload_rejects_undecodable_bytes() {
        let err = encode_reference_png(b"not an image").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn upload_extension_policy_matches_the_supported_set() {
        assert!(supported_upload_extension("jpg"));
        assert!(supported_upload_extension("JPEG"));
        assert!(supported_upload_extension("png"));
        assert!(!supported_upload_extension("gif"));
    }

    #[test]
    fn shrink_to_width_preserves_aspect_ratio() {
        let wide = DynamicImage::ImageRgb8(RgbImage::from_pixel(600, 300, Rgb([1, 2, 3])));
        let resized = shrink_to_width(wide, 300);
        assert_eq!(resized.dimensions(), (300, 150));

        let small = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([1, 2, 3])));
        assert_eq!(shrink_to_width(small, 300).dimensions(), (200, 100));
    }

    #[test]
    fn presigned_urls_are_deterministic_per_ttl() {
        let signer = BearerTokenSigner::new("token-1");
        let first = signer
            .presign("GET", "https://example.test/bucket/key", 3600)
            .unwrap();
        let second = signer
            .presign("GET", "https://example.test/bucket/key", 3600)
            .unwrap();
        assert_eq!(first, second);
        assert!(first.contains("X-Expires=3600"));

        let other_ttl = signer
            .presign("GET", "https://example.test/bucket/key", 604_800)
            .unwrap();
        assert_ne!(first, other_ttl);
    }

    #[test]
    fn memory_store_round_trips_objects() {
        let store = MemoryObjectStore::new("bucket");
        assert!(store.get("missing").unwrap().is_none());
        store.put("key", b"bytes").unwrap();
        assert_eq!(store.get("key").unwrap().unwrap(), b"bytes");
        store.delete("key").unwrap();
        assert!(store.get("key").unwrap().is_none());
    }

    #[test]
    fn agent_session_urls_follow_the_template() {
        let client = AgentRuntimeClient::new(
            "https://agents.example.test/",
            "AGENT1",
            "ALIAS1",
            Arc::new(BearerTokenSigner::new("t")),
        );
        assert_eq!(
            client.session_url("sess-9"),
            "https://agents.example.test/agents/AGENT1/agentAliases/ALIAS1/sessions/sess-9/text"
        );
    }
}
