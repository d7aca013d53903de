//! In-crate fakes shared by the unit tests: a scripted backend, a
//! presentation sink that records every push, and a one-shot HTTP stub.

use crate::api::{
    ApiError, ApiProvider, GenerationRequest, ProviderKind, StreamChunk, StreamingProvider,
};
use crate::fragments::{GenerationTask, PresentationSink, SinkError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Latch that releases every current and future waiter once opened
#[derive(Clone, Default)]
pub struct Gate(CancellationToken);

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.0.cancel();
    }

    async fn wait(&self) {
        self.0.cancelled().await
    }
}

/// One scripted backend action
#[derive(Clone)]
pub enum Step {
    Text(&'static str),
    /// Block until the gate is opened
    Wait(Gate),
    Fail(&'static str),
    Done,
}

/// Backend that replays the same script on every streaming call
pub struct ScriptedBackend {
    script: Vec<Step>,
    reply: Result<&'static str, &'static str>,
    open_error: Option<&'static str>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            reply: Ok(""),
            open_error: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer for non-streaming calls
    pub fn with_reply(mut self, reply: Result<&'static str, &'static str>) -> Self {
        self.reply = reply;
        self
    }

    /// Reject the streaming request before any chunk
    pub fn failing_to_open(mut self, message: &'static str) -> Self {
        self.open_error = Some(message);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, request: &GenerationRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
    }
}

fn provider_error(message: &str) -> ApiError {
    ApiError::Provider {
        code: 1,
        message: message.to_string(),
    }
}

#[async_trait]
impl ApiProvider for ScriptedBackend {
    async fn send_request(&self, request: &GenerationRequest) -> Result<String, ApiError> {
        self.record(request);
        self.reply.map(str::to_string).map_err(provider_error)
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }
}

#[async_trait]
impl StreamingProvider for ScriptedBackend {
    async fn send_streaming(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ApiError> {
        self.record(request);
        if let Some(message) = self.open_error {
            return Err(provider_error(message));
        }

        let (tx, rx) = mpsc::channel(64);
        let script = self.script.clone();
        tokio::spawn(async move {
            for step in script {
                let chunk = match step {
                    Step::Text(text) => StreamChunk::TextDelta(text.to_string()),
                    Step::Fail(message) => StreamChunk::Error(provider_error(message)),
                    Step::Done => StreamChunk::Done,
                    Step::Wait(gate) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = gate.wait() => continue,
                        }
                    }
                };
                if cancel.is_cancelled() {
                    return;
                }
                let terminal = chunk.is_terminal();
                if tx.send(chunk).await.is_err() || terminal {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Presentation sink keeping a log of every create/update/close
#[derive(Default)]
pub struct RecordingSink {
    pub created: Mutex<Vec<GenerationTask>>,
    pub updated: Mutex<Vec<GenerationTask>>,
    pub closed: Mutex<Vec<String>>,
    pub fail: bool,
    /// Time spent delivering an update of a still-generating task
    pub delay: Option<Duration>,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last_update(&self) -> Option<GenerationTask> {
        self.updated.lock().unwrap().last().cloned()
    }

    pub fn updates(&self) -> Vec<GenerationTask> {
        self.updated.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), SinkError> {
        if self.fail {
            Err(SinkError::Unavailable("window closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresentationSink for RecordingSink {
    async fn create(&self, task: &GenerationTask) -> Result<(), SinkError> {
        self.check()?;
        self.created.lock().unwrap().push(task.clone());
        Ok(())
    }

    async fn update(&self, task: &GenerationTask) -> Result<(), SinkError> {
        if let Some(delay) = self.delay.filter(|_| task.is_generating) {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.updated.lock().unwrap().push(task.clone());
        Ok(())
    }

    async fn close(&self, id: &str) -> Result<(), SinkError> {
        self.check()?;
        self.closed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// What the stub server received
#[derive(Debug)]
pub struct Recorded {
    pub request_line: String,
    headers: HashMap<String, String>,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// HTTP server on a loopback port that answers exactly one request
pub struct StubServer {
    pub base_url: String,
    handle: JoinHandle<Recorded>,
}

impl StubServer {
    pub async fn respond(status: u16, content_type: &str, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason(status),
            content_type,
            body.len(),
            body
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];

            let header_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before the request head");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let mut lines = head.split("\r\n");
            let request_line = lines.next().unwrap_or_default().to_string();
            let headers: HashMap<String, String> = lines
                .filter_map(|line| line.split_once(':'))
                .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
                .collect();

            let length = headers
                .get("content-length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < header_end + length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let end = buf.len().min(header_end + length);
            let body = String::from_utf8_lossy(&buf[header_end..end]).to_string();

            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;

            Recorded {
                request_line,
                headers,
                body,
            }
        });

        Self { base_url, handle }
    }

    pub async fn json(status: u16, body: &str) -> Self {
        Self::respond(status, "application/json", body).await
    }

    pub async fn sse(body: &str) -> Self {
        Self::respond(200, "text/event-stream", body).await
    }

    /// The request the server answered
    pub async fn request(self) -> Recorded {
        self.handle.await.unwrap()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Status",
    }
}

/// Drain a chunk receiver to the end
pub async fn collect_chunks(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}

/// Text of every delta, in order
pub fn delta_texts(chunks: &[StreamChunk]) -> Vec<&str> {
    chunks
        .iter()
        .filter_map(|chunk| match chunk {
            StreamChunk::TextDelta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
