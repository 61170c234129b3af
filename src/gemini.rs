use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GeminiConfig;
use crate::image::InlineImage;

/// Text fragments of one streamed answer, in arrival order.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'static>>;

/// One piece of user input.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    Image(InlineImage),
}

/// A generative model that answers an ordered list of parts with streamed text.
pub trait ChatModel: Send + Sync {
    fn stream_generate(&self, parts: Vec<Part>) -> TextStream;
}

// ── Wire types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

impl GenerateRequest {
    fn from_parts(parts: Vec<Part>) -> Self {
        let parts = parts
            .into_iter()
            .map(|part| match part {
                Part::Text(text) => RequestPart::Text { text },
                Part::Image(image) => RequestPart::InlineData {
                    inline_data: Blob {
                        mime_type: image.mime_type,
                        data: image.base64(),
                    },
                },
            })
            .collect();

        Self {
            contents: vec![Content {
                role: "user",
                parts,
            }],
        }
    }
}

/// Text carried by one streamed response object.
fn chunk_text(data: &str) -> Result<String> {
    let response: GenerateResponse =
        serde_json::from_str(data).context("Failed to parse Gemini stream chunk")?;

    if let Some(error) = response.error {
        anyhow::bail!("Gemini error: {}", error.message);
    }

    if response.candidates.is_empty() {
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            anyhow::bail!("Prompt blocked: {}", reason);
        }
    }

    Ok(response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default())
}

/// Pull the human-readable message out of an error body, if it is one.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

// ── Client ─────────────────────────────────────────────────────────────────────

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, config: &GeminiConfig) -> Result<Self> {
        // No total timeout: answers may stream for a long time.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }
}

impl ChatModel for GeminiClient {
    fn stream_generate(&self, parts: Vec<Part>) -> TextStream {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let url = self.stream_url();
        let request = GenerateRequest::from_parts(parts);

        Box::pin(async_stream::try_stream! {
            debug!("Sending streaming request to Gemini: {}", url);

            let response = client
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&request)
                .send()
                .await
                .context("Failed to send request to Gemini")?;

            let status = response.status();
            let response = if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                Err::<(), _>(anyhow!(
                    "Gemini API error ({}): {}",
                    status,
                    api_error_message(&body)
                ))?;
                unreachable!()
            } else {
                response
            };

            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event =
                    event.map_err(|e| anyhow!("Failed to read Gemini response stream: {e}"))?;
                if event.data.is_empty() {
                    continue;
                }
                yield chunk_text(&event.data)?;
            }
        })
    }
}
