//! Model gateway: uniform streaming access to the Gemini and OpenAI backends.
//!
//! Both backends are driven through one contract: a request goes in, and a
//! sequence of [`StreamEvent`]s comes back over a
//! `tokio::sync::mpsc::Sender` — text deltas in model order, then at most
//! one terminal usage record, then `Done` (or `Error`, after which nothing
//! follows). All backend-specific knowledge — endpoints, credentials, role
//! names, payload shapes — stays inside this crate.
//!
//! # Cancellation
//!
//! [`send_message`] races the exchange against the caller's
//! [`CancellationToken`]. On cancellation the in-flight HTTP exchange is
//! dropped and the sequence simply stops: no `Usage`, no terminator.
//!
//! # Errors
//!
//! Failures during an exchange are delivered as `StreamEvent::Error` events
//! rather than `Err` returns, so partial output already forwarded to the
//! caller stays valid. Only unrecoverable internal failures return `Err`.

pub mod gemini;
pub mod openai;
pub mod retry;

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use atelier_types::{ApiProvider, ApiUsage, ChatMessage, Settings, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

// Caps defend against a misbehaving server, not normal traffic.
const MAX_PENDING_STREAM_BYTES: usize = 4 * 1024 * 1024;
const PARSE_SLIP_TOLERANCE: usize = 3;
const PARSE_SLIP_PREVIEW_CHARS: usize = 160;
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Shared HTTP client for all backend requests.
///
/// No total timeout: SSE streams can run for extended periods. Redirects
/// are disabled; API endpoints never redirect.
pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|err| {
                tracing::error!("Failed to build HTTP client: {err}. Using default.");
                reqwest::Client::new()
            })
    })
}

/// One model exchange: the out-of-band system prompt, the (optimized)
/// conversation history, and the composed user prompt.
#[derive(Debug, Clone, Copy)]
pub struct GatewayRequest<'a> {
    pub system_prompt: Option<&'a str>,
    pub history: &'a [ChatMessage],
    pub user_prompt: &'a str,
}

/// Send one exchange to the configured backend and stream events to `tx`.
///
/// Honors `settings.enable_streaming`: when disabled, the backend still
/// emits a single `TextDelta` carrying the whole response, then `Usage`,
/// then `Done`.
pub async fn send_message(
    settings: &Settings,
    request: GatewayRequest<'_>,
    cancel: &CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<()> {
    let streaming = settings.enable_streaming;
    let exchange = async {
        match settings.api_provider {
            ApiProvider::Gemini => {
                gemini::send_message(&settings.model_parameters, streaming, request, &tx).await
            }
            ApiProvider::OpenAi => {
                openai::send_message(&settings.openai_parameters, streaming, request, &tx).await
            }
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!("Model exchange cancelled; dropping in-flight request");
            Ok(())
        }
        result = exchange => result,
    }
}

/// The backend's API key from the process environment. Secrets never come
/// from the config document.
fn api_key(provider: ApiProvider) -> Option<String> {
    std::env::var(provider.env_var())
        .ok()
        .filter(|key| !key.trim().is_empty())
}

async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

// ============================================================================
// Shared SSE plumbing
// ============================================================================

/// What a provider parser wants done with one decoded payload.
enum SseParseAction {
    /// Nothing to emit yet.
    Continue,
    /// Emit these events; a trailing `Done`/`Error` ends the stream.
    Emit(Vec<StreamEvent>),
    /// The payload signaled normal completion.
    Done,
    /// Fatal provider-reported error.
    Error(String),
}

/// Provider-specific interpretation of SSE JSON payloads.
///
/// The shared [`pump_sse_stream`] loop owns frame decoding, timeouts, the
/// `[DONE]` marker, and error tracking; parsers own payload shape. Usage
/// metadata is accumulated by the parser and only emitted at stream end so
/// the `Usage` event always follows every `TextDelta`.
trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;

    /// Terminal usage collected so far, surrendered once at completion.
    fn take_usage(&mut self) -> Option<ApiUsage>;

    fn provider_name(&self) -> &'static str;
}

/// Incremental decoder for an SSE byte stream.
///
/// Transport chunks accumulate here; [`SseFrameBuffer::next_data`] drains
/// one complete frame at a time (frames end at a blank line) and joins its
/// `data:` field lines. A scan cursor remembers how far the pending bytes
/// have already been searched, so a frame arriving in many small chunks is
/// not rescanned from the start each time.
struct SseFrameBuffer {
    pending: Vec<u8>,
    /// Offset up to which `pending` holds no frame terminator.
    scanned: usize,
}

impl SseFrameBuffer {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn over_capacity(&self) -> bool {
        self.pending.len() > MAX_PENDING_STREAM_BYTES
    }

    /// The `data:` payload of the next complete frame. Frames carrying no
    /// data (comments, keep-alives) are consumed and skipped.
    fn next_data(&mut self) -> Result<Option<String>, std::string::FromUtf8Error> {
        while let Some(frame) = self.take_frame() {
            if let Some(data) = join_data_lines(&String::from_utf8(frame)?) {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Drain the next blank-line-terminated frame, terminator excluded.
    /// `None` until a whole frame has arrived.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let mut i = self.scanned;
        loop {
            if i + 1 >= self.pending.len() {
                break;
            }
            if self.pending[i] != b'\n' {
                i += 1;
                continue;
            }
            // A frame ends at "\n\n" (LF framing) or "\n\r\n" (CRLF).
            let consumed = if self.pending[i + 1] == b'\n' {
                i + 2
            } else if self.pending[i + 1] == b'\r' {
                match self.pending.get(i + 2) {
                    Some(b'\n') => i + 3,
                    Some(_) => {
                        i += 1;
                        continue;
                    }
                    // The terminator may complete in the next chunk.
                    None => break,
                }
            } else {
                i += 1;
                continue;
            };

            let mut frame: Vec<u8> = self.pending.drain(..consumed).collect();
            frame.truncate(i);
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            self.scanned = 0;
            return Some(frame);
        }
        // Two bytes of lookback keep a terminator split across chunks
        // findable on the next push.
        self.scanned = self.pending.len().saturating_sub(2);
        None
    }
}

/// Concatenate the `data:` field lines of one frame, newline-joined.
/// `None` when the frame carries no data field at all.
fn join_data_lines(frame: &str) -> Option<String> {
    let values: Vec<&str> = frame
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("\n"))
    }
}

/// Emit the accumulated usage (if any) followed by `Done`.
async fn finish_stream<P: SseParser>(parser: &mut P, tx: &mpsc::Sender<StreamEvent>) {
    if let Some(usage) = parser.take_usage() {
        if !send_event(tx, StreamEvent::Usage(usage)).await {
            return;
        }
    }
    let _ = send_event(tx, StreamEvent::Done).await;
}

/// End the sequence with an `Error` event.
async fn abort_stream(tx: &mpsc::Sender<StreamEvent>, message: String) -> Result<()> {
    let _ = send_event(tx, StreamEvent::Error(message)).await;
    Ok(())
}

enum Flow {
    Forward,
    Stop,
}

/// Forward one parse action's events; `Stop` after any terminal event.
async fn dispatch_action<P: SseParser>(
    action: SseParseAction,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
) -> Flow {
    match action {
        SseParseAction::Continue => Flow::Forward,
        SseParseAction::Done => {
            finish_stream(parser, tx).await;
            Flow::Stop
        }
        SseParseAction::Error(message) => {
            let _ = send_event(tx, StreamEvent::Error(message)).await;
            Flow::Stop
        }
        SseParseAction::Emit(events) => {
            for event in events {
                match event {
                    StreamEvent::Done => {
                        finish_stream(parser, tx).await;
                        return Flow::Stop;
                    }
                    StreamEvent::Error(_) => {
                        let _ = send_event(tx, event).await;
                        return Flow::Stop;
                    }
                    other => {
                        if !send_event(tx, other).await {
                            return Flow::Stop;
                        }
                    }
                }
            }
            Flow::Forward
        }
    }
}

/// Drive a provider SSE response to completion, forwarding events to `tx`.
async fn pump_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()> {
    use futures_util::StreamExt;

    let idle_limit = Duration::from_secs(STREAM_IDLE_TIMEOUT_SECS);
    let mut transport = response.bytes_stream();
    let mut frames = SseFrameBuffer::new();
    // A few undecodable payloads are tolerated; one good payload restores
    // the budget.
    let mut patience = PARSE_SLIP_TOLERANCE;

    loop {
        let chunk = match tokio::time::timeout(idle_limit, transport.next()).await {
            Err(_) => {
                return abort_stream(
                    tx,
                    format!("Model stream went quiet for {STREAM_IDLE_TIMEOUT_SECS}s; giving up"),
                )
                .await;
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };
        frames.push(&chunk);
        if frames.over_capacity() {
            return abort_stream(tx, "Model stream backed up past the 4 MiB frame cap".to_string())
                .await;
        }

        loop {
            let data = match frames.next_data() {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(_) => {
                    return abort_stream(tx, "Model stream is not valid UTF-8 text".to_string())
                        .await;
                }
            };
            if data == "[DONE]" {
                finish_stream(parser, tx).await;
                return Ok(());
            }

            let payload: serde_json::Value = match serde_json::from_str(&data) {
                Ok(payload) => {
                    patience = PARSE_SLIP_TOLERANCE;
                    payload
                }
                Err(err) => {
                    patience -= 1;
                    let glimpse: String = data.chars().take(PARSE_SLIP_PREVIEW_CHARS).collect();
                    tracing::warn!(
                        %err,
                        glimpse = %glimpse,
                        provider = parser.provider_name(),
                        "Skipping undecodable stream payload"
                    );
                    if patience == 0 {
                        return abort_stream(
                            tx,
                            format!("Model stream payloads stopped decoding: {err}"),
                        )
                        .await;
                    }
                    continue;
                }
            };

            if let Flow::Stop = dispatch_action(parser.parse(&payload), parser, tx).await {
                return Ok(());
            }
        }
    }

    abort_stream(tx, "Model stream ended without a completion event".to_string()).await
}

/// Collect an HTTP error response body, keeping at most the first 32 KiB.
async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;

    let mut collected = Vec::new();
    let mut truncated = false;
    let mut transport = response.bytes_stream();
    while let Some(chunk) = transport.next().await {
        let Ok(chunk) = chunk else { break };
        let room = MAX_ERROR_BODY_BYTES.saturating_sub(collected.len());
        if chunk.len() > room {
            collected.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        collected.extend_from_slice(&chunk);
    }

    let mut text = String::from_utf8_lossy(&collected).into_owned();
    if truncated {
        text.push_str(" [error body truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_buffer_yields_data_in_arrival_order() {
        let mut frames = SseFrameBuffer::new();
        frames.push(b"data: one\n\ndata: two\n\ndata: par");

        assert_eq!(frames.next_data().unwrap(), Some("one".to_string()));
        assert_eq!(frames.next_data().unwrap(), Some("two".to_string()));
        // The tail is an incomplete frame.
        assert_eq!(frames.next_data().unwrap(), None);
    }

    #[test]
    fn frame_buffer_handles_crlf_and_terminators_split_across_chunks() {
        let mut frames = SseFrameBuffer::new();
        frames.push(b"data: a\r\n\r");
        assert_eq!(frames.next_data().unwrap(), None);

        frames.push(b"\ndata: b\r\n\r\n");
        assert_eq!(frames.next_data().unwrap(), Some("a".to_string()));
        assert_eq!(frames.next_data().unwrap(), Some("b".to_string()));
    }

    #[test]
    fn frames_without_data_fields_are_skipped() {
        let mut frames = SseFrameBuffer::new();
        frames.push(b": keep-alive\n\nevent: ping\n\ndata: real\n\n");
        assert_eq!(frames.next_data().unwrap(), Some("real".to_string()));
        assert_eq!(frames.next_data().unwrap(), None);
    }

    #[test]
    fn joins_split_data_fields_with_newlines() {
        assert_eq!(
            join_data_lines("data: {\"a\":\ndata: 1}"),
            Some("{\"a\":\n1}".to_string())
        );
        assert_eq!(join_data_lines(": comment only"), None);
        assert_eq!(join_data_lines("event: ping\ndata: x"), Some("x".to_string()));
    }

    #[tokio::test]
    async fn cancellation_before_send_emits_nothing() {
        let settings = Settings::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(8);

        let request = GatewayRequest {
            system_prompt: None,
            history: &[],
            user_prompt: "hello",
        };
        send_message(&settings, request, &cancel, tx).await.unwrap();

        assert!(rx.recv().await.is_none());
    }
}
