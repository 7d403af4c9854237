//! Scripted mock LLM backend for integration tests
//!
//! Serves queued streamed responses in order, on any path, and records every
//! request it receives

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// One scripted upstream response
#[derive(Debug, Clone)]
pub enum Reply {
    /// Event-stream body sent as-is
    Stream(String),
    /// Error status with a JSON body
    Status(u16, serde_json::Value),
    /// Another reply sent after a delay
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    /// `data:` framed stream of the given payloads
    pub fn sse<I, S>(payloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Stream(payloads.into_iter().map(|p| format!("data: {}\n\n", p.as_ref())).collect())
    }

    /// Stream with named `event:` lines, as Anthropic sends them
    pub fn named_sse<'a>(events: impl IntoIterator<Item = (&'a str, serde_json::Value)>) -> Self {
        Self::Stream(
            events
                .into_iter()
                .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
                .collect(),
        )
    }

    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }
}

/// A request the mock received
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub body: serde_json::Value,
}

/// Mock LLM backend that replays a script of responses
pub struct MockLlm {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockLlmState>,
}

struct MockLlmState {
    request_count: AtomicU32,
    script: Mutex<VecDeque<Reply>>,
    /// Served once the script is exhausted
    fallback: Option<Reply>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockLlm {
    /// Start a mock that serves `script` in order, then 500s
    pub async fn start(script: Vec<Reply>) -> anyhow::Result<Self> {
        Self::start_inner(script, None).await
    }

    /// Start a mock that serves `reply` to every request
    pub async fn start_repeating(reply: Reply) -> anyhow::Result<Self> {
        Self::start_inner(Vec::new(), Some(reply)).await
    }

    async fn start_inner(script: Vec<Reply>, fallback: Option<Reply>) -> anyhow::Result<Self> {
        let state = Arc::new(MockLlmState {
            request_count: AtomicU32::new(0),
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(handle).with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Base URL for configuring the mock as a provider
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// Number of requests received
    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for MockLlm {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// -- OpenAI stream chunk types --

#[derive(Debug, Serialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Serialize)]
struct StreamChoice {
    index: u32,
    delta: StreamDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Serialize)]
struct StreamToolCall {
    index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    tool_type: Option<String>,
    function: StreamFunctionCall,
}

#[derive(Debug, Serialize)]
struct StreamFunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn chunk(delta: StreamDelta, finish_reason: Option<&str>) -> String {
    let chunk = StreamChunk {
        choices: vec![StreamChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_owned),
        }],
        usage: finish_reason.map(|_| ChunkUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    };
    serde_json::to_string(&chunk).unwrap_or_default()
}

/// OpenAI stream answering with `words` and a `stop` finish
pub fn openai_text(words: &[&str]) -> Reply {
    let mut payloads: Vec<String> = words
        .iter()
        .map(|w| {
            chunk(
                StreamDelta {
                    content: Some((*w).to_owned()),
                    ..StreamDelta::default()
                },
                None,
            )
        })
        .collect();
    payloads.push(chunk(StreamDelta::default(), Some("stop")));
    payloads.push("[DONE]".to_owned());
    Reply::sse(payloads)
}

/// OpenAI stream requesting one tool call, with arguments split in two
/// fragments the way real providers stream them
pub fn openai_tool_call(name: &str, arguments: &str) -> Reply {
    let split = arguments.len() / 2;
    let (head, tail) = arguments.split_at(split);

    let first = StreamToolCall {
        index: 0,
        id: Some("call_mock".to_owned()),
        tool_type: Some("function".to_owned()),
        function: StreamFunctionCall {
            name: Some(name.to_owned()),
            arguments: head.to_owned(),
        },
    };
    let second = StreamToolCall {
        index: 0,
        id: None,
        tool_type: None,
        function: StreamFunctionCall {
            name: None,
            arguments: tail.to_owned(),
        },
    };

    Reply::sse([
        chunk(
            StreamDelta {
                tool_calls: Some(vec![first]),
                ..StreamDelta::default()
            },
            None,
        ),
        chunk(
            StreamDelta {
                tool_calls: Some(vec![second]),
                ..StreamDelta::default()
            },
            None,
        ),
        chunk(StreamDelta::default(), Some("tool_calls")),
        "[DONE]".to_owned(),
    ])
}

// -- Handler --

async fn handle(State(state): State<Arc<MockLlmState>>, uri: Uri, body: Bytes) -> Response {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    state
        .requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(RecordedRequest {
            path: uri.path().to_owned(),
            body: serde_json::from_slice(&body).unwrap_or_default(),
        });

    let next = state
        .script
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
        .or_else(|| state.fallback.clone());

    let Some(mut reply) = next else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "script exhausted").into_response();
    };

    loop {
        match reply {
            Reply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            Reply::Stream(body) => {
                return ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response();
            }
            Reply::Status(status, body) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return (status, axum::Json(body)).into_response();
            }
        }
    }
}
