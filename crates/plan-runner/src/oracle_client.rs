//! HTTP oracle: OpenAI-compatible chat completions
//!
//! Failure classification feeds the gateway's retry policy:
//!
//! | Failure                                   | Class     |
//! |-------------------------------------------|-----------|
//! | 408, 429, 5xx                             | transient |
//! | timeout, connection refused/reset         | transient |
//! | other 4xx                                 | permanent |
//! | malformed body, no choices, empty content | permanent |

use crate::config::OracleEndpoint;
use async_trait::async_trait;
use plan_coordination::{Oracle, OracleError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You write deterministic, step-by-step software test plans. \
Answer in Markdown. Present steps as two-column tables with a header row \
(Step | Expected Result).";

/// Longest error body echoed into an error message
const MAX_ERROR_BODY: usize = 300;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct HttpOracle {
    http: reqwest::Client,
    completions_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl HttpOracle {
    pub fn new(endpoint: &OracleEndpoint) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            completions_url: completions_url(&endpoint.url),
            model: endpoint.model.clone(),
            api_key: endpoint.api_key.clone(),
            max_tokens: endpoint.max_tokens,
            temperature: endpoint.temperature,
        })
    }

    pub fn completions_url(&self) -> &str {
        &self.completions_url
    }
}

/// `.../v1` → `.../v1/chat/completions`; full URLs are kept
pub fn completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

/// Classify a non-success HTTP status
pub fn classify_status(status: StatusCode, body: &str) -> OracleError {
    let mut snippet: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    if snippet.is_empty() {
        snippet = status.canonical_reason().unwrap_or("no body").to_string();
    }
    let message = format!("HTTP {}: {snippet}", status.as_u16());
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        OracleError::Transient(message)
    } else {
        OracleError::Permanent(message)
    }
}

fn classify_transport(err: &reqwest::Error) -> OracleError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        OracleError::Transient(err.to_string())
    } else {
        OracleError::Permanent(err.to_string())
    }
}

/// Extract the completion text from a response body
pub fn parse_completion(body: &str) -> Result<String, OracleError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| OracleError::Permanent(format!("malformed completion response: {e}")))?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| OracleError::Permanent("completion response has no content".into()))?;
    if content.trim().is_empty() {
        return Err(OracleError::Permanent("completion content is empty".into()));
    }
    Ok(content)
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn generate(&self, context: &str) -> Result<String, OracleError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: context,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self.http.post(&self.completions_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;
        debug!(status = status.as_u16(), bytes = body.len(), model = %self.model, "Oracle responded");

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        parse_completion(&body)
    }
}
