//! OpenRouter chat-completion client
//!
//! The streaming path consumes a chunked SSE body and reduces it to a flat
//! event sequence: zero or more deltas followed by exactly one terminal
//! event. Every failure after the request is issued arrives as a terminal
//! event, so callers have a single control-flow path.
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::types::ChatRequest;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Events emitted by a streaming chat completion
#[derive(Debug)]
pub enum StreamEvent {
    /// Incremental text fragment
    Delta(String),
    /// Stream ended; `cancelled` distinguishes an intentional stop from a
    /// natural end of output
    Done { cancelled: bool },
    /// Stream failed after the retry budget was spent
    Failed(Error),
}

// Streaming wire types
#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

// Non-streaming wire types
#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// What a single reassembled line contributes to the event stream
enum LineEvent {
    Delta(String),
    Done,
    Skip,
}

/// Classify one complete line of the response body.
///
/// Unrecognized and malformed lines are skipped rather than aborting the
/// stream; empty fragments are not emitted.
fn classify_line(line: &str) -> LineEvent {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return LineEvent::Skip;
    };
    if data == DONE_SENTINEL {
        return LineEvent::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty())
            .map(LineEvent::Delta)
            .unwrap_or(LineEvent::Skip),
        Err(e) => {
            tracing::debug!("skipping unparseable stream line: {}", e);
            LineEvent::Skip
        }
    }
}

/// Reassembles arbitrarily-sized byte chunks into complete lines.
///
/// Splits on the raw newline byte before decoding, so a multi-byte UTF-8
/// sequence or a JSON object cut across chunk boundaries is held in the
/// carry-over buffer until its line terminator arrives.
#[derive(Default)]
struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }
}

#[derive(Clone)]
pub struct OpenRouterClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
    request_retry: RetryPolicy,
    read_retry: RetryPolicy,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, OPENROUTER_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            timeout: REQUEST_TIMEOUT,
            request_retry: RetryPolicy::requests(),
            read_retry: RetryPolicy::reads(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policies(mut self, requests: RetryPolicy, reads: RetryPolicy) -> Self {
        self.request_retry = requests;
        self.read_retry = reads;
        self
    }

    /// Issue the request once and map a non-2xx response to an error
    /// carrying the HTTP status and the server's message when present
    async fn issue_request(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let res = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .header("X-Title", "LUMI - Learning & Understanding Machine Interface")
            .json(request)
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let body = res.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.error)
            .map(|e| e.message)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Non-streaming completion; returns the assistant's full reply
    pub async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let mut request = request.clone();
        request.stream = false;

        let res = self
            .request_retry
            .run("chat completion", || self.issue_request(&request))
            .await?;

        let completion: CompletionResponse = res.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Api {
                status: 200,
                message: "no choices in response".to_string(),
            })
    }

    /// Streaming completion.
    ///
    /// The returned receiver yields `Delta` events in arrival order followed
    /// by exactly one terminal event. The sequence is finite and not
    /// restartable; call again to retry. Cancelling `cancel` stops reading
    /// at the next iteration and terminates with `Done { cancelled: true }`.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(100);
        let client = self.clone();
        let mut request = request;
        request.stream = true;

        tokio::spawn(async move {
            client.run_stream(request, cancel, tx).await;
        });

        rx
    }

    async fn run_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        if cancel.is_cancelled() {
            let _ = tx.send(StreamEvent::Done { cancelled: true }).await;
            return;
        }

        // Request setup, retried on transient failures. Cancellation during
        // setup or backoff terminates without error.
        let res = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(StreamEvent::Done { cancelled: true }).await;
                return;
            }
            res = self
                .request_retry
                .run("streaming chat completion", || self.issue_request(&request)) => res,
        };

        let res = match res {
            Ok(res) => res,
            Err(err) => {
                let _ = tx.send(StreamEvent::Failed(err)).await;
                return;
            }
        };

        let mut stream = res.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut read_failures = 0u32;

        loop {
            // The reader is released on return, before the terminal event
            // is observed
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(StreamEvent::Done { cancelled: true }).await;
                    return;
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    read_failures = 0;
                    for line in lines.push(&bytes) {
                        match classify_line(&line) {
                            LineEvent::Delta(text) => {
                                if tx.send(StreamEvent::Delta(text)).await.is_err() {
                                    return;
                                }
                            }
                            // The sentinel takes priority over anything
                            // still buffered
                            LineEvent::Done => {
                                let _ = tx.send(StreamEvent::Done { cancelled: false }).await;
                                return;
                            }
                            LineEvent::Skip => {}
                        }
                    }
                    // Let other tasks run between chunks of a fast stream
                    tokio::task::yield_now().await;
                }
                Some(Err(e)) => {
                    read_failures += 1;
                    if read_failures >= self.read_retry.max_attempts {
                        let _ = tx
                            .send(StreamEvent::Failed(Error::Stream(e.to_string())))
                            .await;
                        return;
                    }
                    let delay = self.read_retry.delay_for(read_failures);
                    tracing::warn!(
                        "stream read failed (attempt {}/{}): {} - retrying in {:?}",
                        read_failures,
                        self.read_retry.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                // Body ended without a sentinel; treat as a normal end
                None => {
                    let _ = tx.send(StreamEvent::Done { cancelled: false }).await;
                    return;
                }
            }
        }
    }
}
