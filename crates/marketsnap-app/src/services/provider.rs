//! Extraction adapter: a uniform surface over vision-capable inference
//! providers with per-provider rate limits, bounded retry, and cooperative
//! cancellation.

use std::{num::NonZeroU32, num::NonZeroUsize, sync::Arc, time::Duration};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bon::Builder;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type ProviderRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const EXTRACTION_SYSTEM_PROMPT: &str = "You are a meticulous market-listing extraction engine. \
Given a screenshot of marketplace listings, return a JSON array of objects with keys \
item_name, quantity, unit_price, total_price, and optional category. Return only JSON.";

/// One structured record extracted from a screenshot row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub item_name: String,
    pub quantity: u32,
    pub unit_price: u64,
    pub total_price: u64,
    #[serde(default)]
    pub category: Option<String>,
}

/// Token accounting for a single provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn merge(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Outcome of the once-per-session prompt cache negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Created,
    Reused,
    Unavailable,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Reused => "reused",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Successful extraction for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub records: Vec<ListingRecord>,
    pub usage: TokenUsage,
}

/// Failure taxonomy for a provider call.
///
/// `RateLimited` and `Transient` are retried inside the adapter; `Fatal`
/// propagates immediately and ends the batch; `Aborted` and `Skipped` are
/// distinguished control conditions, never content errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("authentication or configuration failure: {0}")]
    Fatal(String),
    #[error("missing GOOGLE_AI_API_KEY or GEMINI_API_KEY environment variable")]
    MissingApiKey,
    #[error("unparseable provider response: {0}")]
    Malformed(String),
    #[error("extraction aborted by cancellation")]
    Aborted,
    #[error("file skipped by operator request")]
    Skipped,
}

impl ExtractError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Transient(_) | Self::Malformed(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::MissingApiKey)
    }
}

/// Supported inference providers. Each declares its concurrency and rate
/// profile as data; selection is by this enumeration, never by string
/// branching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Gemini,
    GeminiFlash,
    DeepInfra,
}

/// Concurrency and pacing limits a provider tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderProfile {
    /// Simultaneous calls the provider tolerates; sizes processor chunks.
    pub max_concurrent: NonZeroUsize,
    /// Minimum spacing imposed between chunk starts.
    pub delay_between: Duration,
    /// Sustained requests per second for the outbound limiter.
    pub requests_per_second: NonZeroU32,
}

impl ProviderKind {
    pub fn profile(self) -> ProviderProfile {
        match self {
            Self::Gemini => ProviderProfile {
                max_concurrent: NonZeroUsize::new(3).expect("non-zero concurrency"),
                delay_between: Duration::from_millis(1_500),
                requests_per_second: NonZeroU32::new(4).expect("non-zero quota"),
            },
            Self::GeminiFlash => ProviderProfile {
                max_concurrent: NonZeroUsize::new(6).expect("non-zero concurrency"),
                delay_between: Duration::from_millis(750),
                requests_per_second: NonZeroU32::new(8).expect("non-zero quota"),
            },
            Self::DeepInfra => ProviderProfile {
                max_concurrent: NonZeroUsize::new(4).expect("non-zero concurrency"),
                delay_between: Duration::from_millis(1_000),
                requests_per_second: NonZeroU32::new(6).expect("non-zero quota"),
            },
        }
    }
}

/// Injected capability performing the raw provider call: given image bytes,
/// return parsed records and token cost, respecting the cancellation signal.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn extract(
        &self,
        image: Arc<[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Extraction, ExtractError>;

    /// Negotiate a reusable cached context. Must never block extraction;
    /// the default is to report the capability as unavailable.
    async fn ensure_prompt_cache(&self) -> CacheStatus {
        CacheStatus::Unavailable
    }
}

/// Retry policy applied by the adapter around every per-file call.
#[derive(Debug, Clone, Builder)]
pub struct AdapterConfig {
    #[builder(default = 3)]
    pub max_attempts: usize,
    #[builder(default = Duration::from_millis(500))]
    pub base_delay: Duration,
    #[builder(default = Duration::from_secs(8))]
    pub max_delay: Duration,
    /// Replaces the provider's declared concurrency and pacing limits.
    /// Tighter self-imposed quotas stay expressible without a new variant.
    pub profile: Option<ProviderProfile>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Uniform extraction surface handed to the processor: rate limiting,
/// bounded retry with exponential backoff, and cancellation handling live
/// here so the scheduling core stays policy-free.
pub struct ExtractionAdapter {
    kind: ProviderKind,
    profile: ProviderProfile,
    client: Arc<dyn VisionClient>,
    limiter: Arc<ProviderRateLimiter>,
    backoff: ExponentialBuilder,
}

impl ExtractionAdapter {
    pub fn new(kind: ProviderKind, client: Arc<dyn VisionClient>, config: AdapterConfig) -> Self {
        debug_assert!(config.max_attempts > 0);
        let profile = config.profile.unwrap_or_else(|| kind.profile());
        let quota = Quota::per_second(profile.requests_per_second);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(config.base_delay)
            .with_max_delay(config.max_delay)
            .with_max_times(config.max_attempts.saturating_sub(1))
            .with_jitter();
        Self {
            kind,
            profile,
            client,
            limiter: Arc::new(RateLimiter::direct(quota)),
            backoff,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn profile(&self) -> ProviderProfile {
        self.profile
    }

    /// Attempt to create or reuse the provider's cached context, once per
    /// processing session. Failure degrades to full-context calls.
    pub async fn negotiate_cache(&self) -> CacheStatus {
        let status = self.client.ensure_prompt_cache().await;
        debug!(provider = self.kind.as_ref(), status = status.as_str(), "prompt cache negotiated");
        status
    }

    /// Extract with the configured retry budget. Retries only retryable
    /// failures; a pending skip request gives up on the file between
    /// attempts and cancellation aborts mid-call. The skip closure is
    /// consulted between attempts and its signal, once observed, is
    /// honored even if the closure consumes it.
    pub async fn extract(
        &self,
        image: Arc<[u8]>,
        cancel: &CancellationToken,
        skip_requested: impl Fn() -> bool + Send + Sync,
    ) -> Result<Extraction, ExtractError> {
        let skipped = std::sync::atomic::AtomicBool::new(false);
        let observe_skip = || {
            if skip_requested() {
                skipped.store(true, std::sync::atomic::Ordering::SeqCst);
                true
            } else {
                false
            }
        };
        let attempt = || async { self.attempt(Arc::clone(&image), cancel).await };
        let outcome = attempt
            .retry(self.backoff.clone())
            .when(|err: &ExtractError| err.is_retryable() && !observe_skip())
            .notify(|err, delay| {
                warn!(provider = self.kind.as_ref(), %err, ?delay, "retrying provider call");
            })
            .await;
        match outcome {
            Err(err)
                if err.is_retryable() && skipped.load(std::sync::atomic::Ordering::SeqCst) =>
            {
                Err(ExtractError::Skipped)
            }
            other => other,
        }
    }

    /// Exactly one attempt; used by the serial retry phase.
    pub async fn extract_once(
        &self,
        image: Arc<[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Extraction, ExtractError> {
        self.attempt(image, cancel).await
    }

    async fn attempt(
        &self,
        image: Arc<[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Extraction, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Aborted);
        }
        self.limiter.until_ready().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(ExtractError::Aborted),
            result = self.client.extract(image, cancel) => result,
        }
    }
}

/// Gemini `generateContent` client over reqwest, with optional cached
/// system-prompt context negotiated through the `cachedContents` API.
pub struct GeminiVisionClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
    cached_content: OnceCell<Option<String>>,
}

impl GeminiVisionClient {
    pub fn from_env(model: impl Into<String>) -> Result<Self, ExtractError> {
        let api_key = std::env::var("GOOGLE_AI_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| ExtractError::MissingApiKey)?;
        Ok(Self::new(api_key, model, GEMINI_API_BASE))
    }

    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        let model = model.into();
        debug_assert!(!model.trim().is_empty());
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model,
            api_base: api_base.into(),
            cached_content: OnceCell::new(),
        }
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        )
    }

    async fn create_cache(&self) -> Option<String> {
        let url = format!("{}/cachedContents?key={}", self.api_base, self.api_key);
        let body = serde_json::json!({
            "model": format!("models/{}", self.model),
            "systemInstruction": {
                "parts": [{ "text": EXTRACTION_SYSTEM_PROMPT }]
            },
            "ttl": "3600s",
        });
        let response = match self.http.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "prompt cache creation request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "prompt cache creation rejected");
            return None;
        }
        let payload: serde_json::Value = response.json().await.ok()?;
        payload
            .get("name")
            .and_then(|name| name.as_str())
            .map(str::to_owned)
    }

    fn classify_status(status: reqwest::StatusCode, detail: String) -> ExtractError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ExtractError::RateLimited(detail)
        } else if status.is_server_error() {
            ExtractError::Transient(detail)
        } else if matches!(
            status,
            reqwest::StatusCode::UNAUTHORIZED
                | reqwest::StatusCode::FORBIDDEN
                | reqwest::StatusCode::BAD_REQUEST
        ) {
            ExtractError::Fatal(detail)
        } else {
            ExtractError::Transient(detail)
        }
    }
}

#[async_trait]
impl VisionClient for GeminiVisionClient {
    async fn extract(
        &self,
        image: Arc<[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Extraction, ExtractError> {
        let mut body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inline_data": {
                            "mime_type": "image/png",
                            "data": BASE64_STANDARD.encode(image.as_ref()),
                        }
                    },
                    { "text": "Extract every listing row visible in this screenshot." }
                ]
            }],
            "generationConfig": {
                "temperature": 0.0,
                "responseMimeType": "application/json",
            }
        });
        match self.cached_content.get() {
            Some(Some(cache_name)) => {
                body["cachedContent"] = serde_json::Value::String(cache_name.clone());
            }
            _ => {
                body["systemInstruction"] = serde_json::json!({
                    "parts": [{ "text": EXTRACTION_SYSTEM_PROMPT }]
                });
            }
        }

        let request = self.http.post(self.generate_url()).json(&body).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ExtractError::Aborted),
            result = request => result.map_err(|err| ExtractError::Transient(err.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, detail));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ExtractError::Malformed(err.to_string()))?;
        parse_generate_response(&payload)
    }

    async fn ensure_prompt_cache(&self) -> CacheStatus {
        if let Some(existing) = self.cached_content.get() {
            return match existing {
                Some(_) => CacheStatus::Reused,
                None => CacheStatus::Unavailable,
            };
        }
        let created = self
            .cached_content
            .get_or_init(|| self.create_cache())
            .await;
        match created {
            Some(_) => CacheStatus::Created,
            None => CacheStatus::Unavailable,
        }
    }
}

fn parse_generate_response(payload: &serde_json::Value) -> Result<Extraction, ExtractError> {
    let text = payload
        .pointer("/candidates/0/content/parts")
        .and_then(|parts| parts.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|text| text.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ExtractError::Malformed(
            "response carried no textual candidate".to_string(),
        ));
    }

    let records: Vec<ListingRecord> = serde_json::from_str(text.trim())
        .map_err(|err| ExtractError::Malformed(format!("listing JSON did not parse: {err}")))?;

    let usage_at = |key: &str| {
        payload
            .pointer(&format!("/usageMetadata/{key}"))
            .and_then(|value| value.as_u64())
            .unwrap_or(0)
    };
    let usage = TokenUsage {
        prompt_tokens: usage_at("promptTokenCount"),
        completion_tokens: usage_at("candidatesTokenCount"),
        total_tokens: usage_at("totalTokenCount"),
    };

    Ok(Extraction { records, usage })
}
