//! Google Gemini backend (GenerateContent API).
//!
//! Streams via `streamGenerateContent?alt=sse`; the non-streaming path hits
//! `generateContent` and replays the whole body as a single delta. History
//! roles map 1:1 (`user`/`model`); the system prompt travels out-of-band as
//! `system_instruction`. Note the API's mixed casing: `system_instruction`
//! is snake_case while `generationConfig` is camelCase.

use anyhow::Result;
use atelier_types::{ApiProvider, ApiUsage, GeminiParams, Role, StreamEvent};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::{
    GatewayRequest, SseParseAction, SseParser, api_key, http_client, pump_sse_stream,
    read_capped_error_body,
    retry::{RetryConfig, RetryOutcome, send_with_retry},
    send_event,
};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
    }
}

fn build_request_body(params: &GeminiParams, request: &GatewayRequest<'_>) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    for message in request.history {
        contents.push(json!({
            "role": role_name(message.role),
            "parts": [{ "text": message.prompt_body() }]
        }));
    }
    contents.push(json!({
        "role": "user",
        "parts": [{ "text": request.user_prompt }]
    }));

    let mut body = serde_json::Map::new();
    body.insert("contents".into(), json!(contents));

    if let Some(prompt) = request.system_prompt
        && !prompt.trim().is_empty()
    {
        body.insert(
            "system_instruction".into(),
            json!({ "parts": [{ "text": prompt }] }),
        );
    }

    let mut generation = serde_json::Map::new();
    if let Some(temperature) = params.temperature {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        generation.insert("topP".into(), json!(top_p));
    }
    if let Some(top_k) = params.top_k {
        generation.insert("topK".into(), json!(top_k));
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }

    Value::Object(body)
}

// ============================================================================
// Response payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
    /// Thought parts carry reasoning, not answer text.
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
    #[serde(rename = "thoughtsTokenCount", default)]
    thoughts_token_count: u64,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u64,
}

impl From<UsageMetadata> for ApiUsage {
    fn from(usage: UsageMetadata) -> Self {
        Self {
            prompt_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            thinking_tokens: usage.thoughts_token_count,
            total_tokens: usage.total_token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
}

// ============================================================================
// SSE parser
// ============================================================================

#[derive(Default)]
struct GeminiParser {
    /// Usage arrives cumulatively on stream chunks; the last one wins and
    /// is emitted only at completion.
    pending_usage: Option<ApiUsage>,
}

impl SseParser for GeminiParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let response: GenerateResponse = match serde_json::from_value(json.clone()) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%err, "Failed to parse Gemini SSE payload");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = response.error {
            return SseParseAction::Error(
                error.message.unwrap_or_else(|| "Gemini API error".to_string()),
            );
        }

        if let Some(usage) = response.usage_metadata {
            self.pending_usage = Some(usage.into());
        }

        let mut events = Vec::new();
        for candidate in response.candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if part.thought {
                        continue;
                    }
                    if let Some(text) = part.text
                        && !text.is_empty()
                    {
                        events.push(StreamEvent::TextDelta(text));
                    }
                }
            }
            match candidate.finish_reason.as_deref() {
                None => {}
                Some("STOP") => events.push(StreamEvent::Done),
                Some(reason) => {
                    events.push(StreamEvent::Error(format!("Generation stopped: {reason}")));
                }
            }
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn take_usage(&mut self) -> Option<ApiUsage> {
        self.pending_usage.take()
    }

    fn provider_name(&self) -> &'static str {
        "Gemini"
    }
}

// ============================================================================
// Entry point
// ============================================================================

pub async fn send_message(
    params: &GeminiParams,
    streaming: bool,
    request: GatewayRequest<'_>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()> {
    let Some(key) = api_key(ApiProvider::Gemini) else {
        let _ = send_event(
            tx,
            StreamEvent::Error("GEMINI_API_KEY is not set in the environment".to_string()),
        )
        .await;
        return Ok(());
    };

    let method = if streaming {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    };
    let url = format!("{API_BASE}/models/{}:{method}", params.model);
    let body = build_request_body(params, &request);

    let client = http_client();
    let outcome = send_with_retry(
        || {
            client
                .post(&url)
                .header("x-goog-api-key", &key)
                .header("content-type", "application/json")
                .json(&body)
        },
        &RetryConfig::default(),
    )
    .await;

    let response = match outcome {
        RetryOutcome::Success(response) => response,
        RetryOutcome::HttpError(response) => {
            let status = response.status();
            let detail = read_capped_error_body(response).await;
            let _ = send_event(tx, StreamEvent::Error(format!("API error {status}: {detail}")))
                .await;
            return Ok(());
        }
        RetryOutcome::ConnectionError { attempts, source } => {
            let _ = send_event(
                tx,
                StreamEvent::Error(format!("Request failed after {attempts} attempts: {source}")),
            )
            .await;
            return Ok(());
        }
        RetryOutcome::NonRetryable(err) => {
            let _ = send_event(tx, StreamEvent::Error(format!("Request failed: {err}"))).await;
            return Ok(());
        }
    };

    if streaming {
        let mut parser = GeminiParser::default();
        return pump_sse_stream(response, &mut parser, tx).await;
    }

    let payload: GenerateResponse = match response.json().await {
        Ok(payload) => payload,
        Err(err) => {
            let _ = send_event(tx, StreamEvent::Error(format!("Invalid response body: {err}")))
                .await;
            return Ok(());
        }
    };
    if let Some(error) = payload.error {
        let _ = send_event(
            tx,
            StreamEvent::Error(error.message.unwrap_or_else(|| "Gemini API error".to_string())),
        )
        .await;
        return Ok(());
    }

    let text: String = payload
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter(|part| !part.thought)
        .filter_map(|part| part.text.as_deref())
        .collect();
    if !send_event(tx, StreamEvent::TextDelta(text)).await {
        return Ok(());
    }
    if let Some(usage) = payload.usage_metadata {
        if !send_event(tx, StreamEvent::Usage(usage.into())).await {
            return Ok(());
        }
    }
    let _ = send_event(tx, StreamEvent::Done).await;
    Ok(())
}
