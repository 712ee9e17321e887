//! Reverse-image search through the SearchApi Google Lens engine.

use crate::http::build_client;
use crate::models::VisualMatch;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_VISUAL_MATCHES: usize = 15;

#[derive(Debug, Clone)]
pub struct LensConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub engine: String,
}

impl LensConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("SEARCH_API_URL")
                .unwrap_or_else(|_| "https://www.searchapi.io/api/v1/search".into()),
            api_key: std::env::var("SEARCH_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            engine: "google_lens".into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LensError {
    #[error("missing search api key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Failures never escape: an unreachable provider reads as "no matches".
#[async_trait]
pub trait VisualMatcher: Send + Sync {
    async fn find_matches(&self, image_url: &str) -> Vec<VisualMatch>;
}

pub struct LensClient {
    http: Client,
    config: LensConfig,
}

impl LensClient {
    pub fn new(config: LensConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub async fn search(&self, image_url: &str) -> Result<Vec<VisualMatch>, LensError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LensError::MissingApiKey)?;
        let response = self
            .http
            .get(&self.config.endpoint)
            .query(&[
                ("engine", self.config.engine.as_str()),
                ("url", image_url),
                ("api_key", api_key),
            ])
            .send()
            .await
            .map_err(|err| LensError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LensError::Http(format!("HTTP {}", response.status())));
        }

        let payload: LensResponse = response
            .json()
            .await
            .map_err(|err| LensError::InvalidResponse(err.to_string()))?;
        Ok(into_matches(payload))
    }
}

#[async_trait]
impl VisualMatcher for LensClient {
    async fn find_matches(&self, image_url: &str) -> Vec<VisualMatch> {
        match self.search(image_url).await {
            Ok(matches) => {
                debug!(target = "appraisal.lens", count = matches.len(), "visual_matches");
                matches
            }
            Err(err) => {
                warn!(target = "appraisal.lens", error = %err, "lens_search_failed");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LensResponse {
    #[serde(default)]
    visual_matches: Vec<RawMatch>,
}

#[derive(Debug, Deserialize)]
struct RawMatch {
    #[serde(default)]
    source: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    price: Option<Value>,
}

fn into_matches(payload: LensResponse) -> Vec<VisualMatch> {
    payload
        .visual_matches
        .into_iter()
        .take(MAX_VISUAL_MATCHES)
        .map(|raw| VisualMatch {
            source_marketplace: raw.source,
            title: raw.title,
            price: raw.price.as_ref().and_then(price_label),
            listing_url: raw.link,
        })
        .collect()
}

// The provider sends either a display string or an object with `value`,
// `extracted_value` and `currency`.
fn price_label(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Object(fields) => {
            if let Some(text) = fields.get("value").and_then(Value::as_str) {
                return Some(text.to_string());
            }
            let amount = fields.get("extracted_value")?;
            let currency = fields
                .get("currency")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(format!("{amount} {currency}").trim().to_string())
        }
        _ => None,
    }
}
