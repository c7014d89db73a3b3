//! OpenAI-compatible backend (Chat Completions API).
//!
//! Targets the `chat/completions` endpoint under a configurable base URL so
//! any OpenAI-compatible server works. History roles map `user`/`model` to
//! `user`/`assistant`; the system prompt becomes the leading `system`
//! message. Streaming requests ask for the terminal usage chunk via
//! `stream_options.include_usage`.

use anyhow::Result;
use atelier_types::{ApiProvider, ApiUsage, OpenAiParams, Role, StreamEvent};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::{
    GatewayRequest, SseParseAction, SseParser, api_key, http_client, pump_sse_stream,
    read_capped_error_body,
    retry::{RetryConfig, RetryOutcome, send_with_retry},
    send_event,
};

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "assistant",
    }
}

fn completions_url(params: &OpenAiParams) -> String {
    format!("{}/chat/completions", params.base_url.trim_end_matches('/'))
}

fn build_request_body(params: &OpenAiParams, request: &GatewayRequest<'_>, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if let Some(prompt) = request.system_prompt
        && !prompt.trim().is_empty()
    {
        messages.push(json!({ "role": "system", "content": prompt }));
    }
    for message in request.history {
        messages.push(json!({
            "role": role_name(message.role),
            "content": message.prompt_body()
        }));
    }
    messages.push(json!({ "role": "user", "content": request.user_prompt }));

    let mut body = serde_json::Map::new();
    body.insert("model".into(), json!(params.model));
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(stream));
    if stream {
        body.insert("stream_options".into(), json!({ "include_usage": true }));
    }
    if let Some(temperature) = params.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        body.insert("top_p".into(), json!(top_p));
    }

    Value::Object(body)
}

// ============================================================================
// Response payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

impl From<Usage> for ApiUsage {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            thinking_tokens: usage
                .completion_tokens_details
                .map_or(0, |details| details.reasoning_tokens),
            total_tokens: usage.total_tokens,
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
struct OpenAiParser {
    /// The usage chunk arrives after the last delta; held until `[DONE]`.
    pending_usage: Option<ApiUsage>,
}

impl SseParser for OpenAiParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: StreamChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(%err, "Failed to parse OpenAI SSE payload");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = chunk.error {
            return SseParseAction::Error(
                error.message.unwrap_or_else(|| "OpenAI API error".to_string()),
            );
        }

        if let Some(usage) = chunk.usage {
            self.pending_usage = Some(usage.into());
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.and_then(|delta| delta.content)
                && !text.is_empty()
            {
                events.push(StreamEvent::TextDelta(text));
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
        "OpenAI"
    }
}

// ============================================================================
// Entry point
// ============================================================================

pub async fn send_message(
    params: &OpenAiParams,
    streaming: bool,
    request: GatewayRequest<'_>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()> {
    let Some(key) = api_key(ApiProvider::OpenAi) else {
        let _ = send_event(
            tx,
            StreamEvent::Error("OPENAI_API_KEY is not set in the environment".to_string()),
        )
        .await;
        return Ok(());
    };

    let url = completions_url(params);
    let body = build_request_body(params, &request, streaming);
    let auth = format!("Bearer {key}");

    let client = http_client();
    let outcome = send_with_retry(
        || {
            client
                .post(&url)
                .header("Authorization", &auth)
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
        let mut parser = OpenAiParser::default();
        return pump_sse_stream(response, &mut parser, tx).await;
    }

    let payload: Completion = match response.json().await {
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
            StreamEvent::Error(error.message.unwrap_or_else(|| "OpenAI API error".to_string())),
        )
        .await;
        return Ok(());
    }

    let text = payload
        .choices
        .into_iter()
        .filter_map(|choice| choice.message.and_then(|message| message.content))
        .collect::<String>();
    if !send_event(tx, StreamEvent::TextDelta(text)).await {
        return Ok(());
    }
    if let Some(usage) = payload.usage {
        if !send_event(tx, StreamEvent::Usage(usage.into())).await {
            return Ok(());
        }
    }
    let _ = send_event(tx, StreamEvent::Done).await;
    Ok(())
}


#[cfg(test)]
mod integration_tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn sse_body(events: &[&str]) -> String {
        let mut body = String::new();
        for event in events {
            body.push_str("data: ");
            body.push_str(event);
            body.push_str("\n\n");
        }
        body
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_deltas_then_usage_then_done() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            "[DONE]",
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let params = OpenAiParams {
            base_url: format!("{}/v1", server.uri()),
            ..OpenAiParams::default()
        };
        let request = GatewayRequest {
            system_prompt: None,
            history: &[],
            user_prompt: "hi",
        };

        // SAFETY: test-local env mutation, no concurrent readers of this var.
        unsafe { std::env::set_var("OPENAI_API_KEY", "test-key") };
        let (tx, rx) = mpsc::channel(16);
        send_message(&params, true, request, &tx).await.unwrap();
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hel".to_string()),
                StreamEvent::TextDelta("lo".to_string()),
                StreamEvent::Usage(ApiUsage {
                    prompt_tokens: 5,
                    output_tokens: 2,
                    thinking_tokens: 0,
                    total_tokens: 7,
                }),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn non_streaming_replays_full_body_as_one_delta() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "Hello there" } }],
                "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
            })))
            .mount(&server)
            .await;

        let params = OpenAiParams {
            base_url: format!("{}/v1", server.uri()),
            ..OpenAiParams::default()
        };
        let request = GatewayRequest {
            system_prompt: None,
            history: &[],
            user_prompt: "hi",
        };

        // SAFETY: test-local env mutation, no concurrent readers of this var.
        unsafe { std::env::set_var("OPENAI_API_KEY", "test-key") };
        let (tx, rx) = mpsc::channel(16);
        send_message(&params, false, request, &tx).await.unwrap();
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::TextDelta("Hello there".to_string()));
        assert!(matches!(events[1], StreamEvent::Usage(_)));
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[tokio::test]
    async fn http_error_surfaces_as_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401).set_body_string(r#"{"error":{"message":"bad key"}}"#),
            )
            .mount(&server)
            .await;

        let params = OpenAiParams {
            base_url: format!("{}/v1", server.uri()),
            ..OpenAiParams::default()
        };
        let request = GatewayRequest {
            system_prompt: None,
            history: &[],
            user_prompt: "hi",
        };

        // SAFETY: test-local env mutation, no concurrent readers of this var.
        unsafe { std::env::set_var("OPENAI_API_KEY", "test-key") };
        let (tx, rx) = mpsc::channel(16);
        send_message(&params, true, request, &tx).await.unwrap();
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Error(message) if message.contains("401")
        ));
    }
}
