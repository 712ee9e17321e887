//! Market summaries for a set of visual matches.

use crate::llm::{LlmClient, LlmMessage};
use crate::models::VisualMatch;
use async_trait::async_trait;
use tracing::{debug, warn};

pub const NO_ANALYSIS: &str = "No analysis generated";
pub const ANALYSIS_FAILED: &str = "Analysis failed";

const INSTRUCTIONS: &str = r#"Analyze the product search results below and return a structured summary using these rules:
1. Name: if several listings share the same or nearly the same name, the pictured item is that item; state it assertively as item: "Name". If every listing name differs, the first listing is most likely the pictured item; state it as item: "likely- <first listing name>".
2. Opinion: say briefly what is known about the item, its collector market and current trends.
3. eBay prices: list every price seen in the eBay listings, comma separated, prices only.
4. Etsy prices: list every price seen in the Etsy listings, comma separated, prices only.
5. Amazon, Walmart and Macy's prices if present.
6. Auction houses: name the auction houses where the item was or is listed, without their prices.
7. Present everything above as bullet points.
8. Do not open with an introduction such as "Here's the structured summary:"."#;

/// Always yields text. Provider failures become [`ANALYSIS_FAILED`].
#[async_trait]
pub trait MarketSummarizer: Send + Sync {
    async fn summarize(&self, matches: &[VisualMatch]) -> String;
}

pub struct LlmSummarizer {
    client: LlmClient,
}

impl LlmSummarizer {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketSummarizer for LlmSummarizer {
    async fn summarize(&self, matches: &[VisualMatch]) -> String {
        let prompt = build_prompt(matches);
        match self.client.chat(&[LlmMessage::user(prompt)]).await {
            Ok(response) => {
                debug!(
                    target = "appraisal.llm",
                    model = self.client.model(),
                    input_tokens = response.usage.as_ref().and_then(|u| u.input_tokens),
                    output_tokens = response.usage.as_ref().and_then(|u| u.output_tokens),
                    "summary_generated"
                );
                response.text.unwrap_or_else(|| NO_ANALYSIS.to_string())
            }
            Err(err) => {
                warn!(target = "appraisal.llm", error = %err, "summary_failed");
                ANALYSIS_FAILED.to_string()
            }
        }
    }
}

pub fn build_prompt(matches: &[VisualMatch]) -> String {
    let data = serde_json::to_string_pretty(matches).unwrap_or_else(|_| "[]".to_string());
    format!("{INSTRUCTIONS}\n\nData: {data}")
}
