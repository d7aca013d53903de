//! Generation sessions
//!
//! A session is one in-flight call to a backend. Its lifecycle is
//! `Idle -> Streaming -> {Completed | Cancelled | Failed}`; terminal states
//! are final. The state lives in a single atomic shared by the driver task,
//! every [`SessionHandle`] and the [`SessionEvents`] consumer, so whichever
//! party reaches a terminal state first wins and the others observe it.

use crate::api::{ApiError, Backend, GenerationRequest, StreamChunk};
use futures_util::stream::{self, Stream};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Current state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Streaming = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Streaming,
            2 => SessionState::Completed,
            3 => SessionState::Cancelled,
            _ => SessionState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Event delivered to the consumer of a session
#[derive(Debug)]
pub enum SessionEvent {
    /// Incremental text, in arrival order
    Chunk(String),
    /// End of stream; carries the full accumulated text
    Completed { text: String },
    Failed(ApiError),
    /// The session was cancelled; nothing follows
    Cancelled,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Chunk(_))
    }
}

struct Shared {
    id: SessionId,
    state: AtomicU8,
    token: CancellationToken,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn begin(&self) -> bool {
        let started = self
            .state
            .compare_exchange(
                SessionState::Idle as u8,
                SessionState::Streaming as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if started {
            debug!(session = %self.id, "Idle -> Streaming");
        }
        started
    }

    /// Move to a terminal state unless one was already reached
    fn finish(&self, to: SessionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let from = SessionState::from_u8(current);
            if from.is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!(session = %self.id, "{:?} -> {:?}", from, to);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Cloneable control handle for a running session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request cancellation.
    ///
    /// Returns true only for the call that actually cancelled the session;
    /// repeated calls, or calls after the session already ended, are no-ops.
    pub fn cancel(&self) -> bool {
        if !self.shared.finish(SessionState::Cancelled) {
            return false;
        }
        self.shared.token.cancel();
        true
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// The consuming side of a session.
///
/// Yields chunks in order and then exactly one terminal event. Once the
/// session is cancelled, anything still buffered is dropped and a single
/// [`SessionEvent::Cancelled`] is yielded instead.
pub struct SessionEvents {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    done: bool,
}

impl SessionEvents {
    pub async fn next(&mut self) -> Option<SessionEvent> {
        if self.done {
            return None;
        }
        if self.shared.state() == SessionState::Cancelled {
            self.done = true;
            return Some(SessionEvent::Cancelled);
        }

        let event = tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => None,
            event = self.rx.recv() => event,
        };

        // Cancellation may land while we were parked on the channel
        if self.shared.state() == SessionState::Cancelled {
            self.done = true;
            return Some(SessionEvent::Cancelled);
        }

        match event {
            Some(event) => {
                self.done = event.is_terminal();
                Some(event)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// The same sequence as a `Stream`; finite and not restartable
    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send {
        stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}

/// Entry points for starting sessions
pub struct GenerationSession;

impl GenerationSession {
    /// Start streaming `request` on a background task
    pub fn spawn(
        backend: Arc<dyn Backend>,
        request: GenerationRequest,
    ) -> (SessionHandle, SessionEvents) {
        let shared = Arc::new(Shared {
            id: SessionId::next(),
            state: AtomicU8::new(SessionState::Idle as u8),
            token: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(backend, request, shared.clone(), tx));

        let handle = SessionHandle {
            shared: shared.clone(),
        };
        let events = SessionEvents {
            shared,
            rx,
            done: false,
        };
        (handle, events)
    }

    /// Start a session whose events are pushed into `callback`
    pub fn spawn_with_callback<F>(
        backend: Arc<dyn Backend>,
        request: GenerationRequest,
        mut callback: F,
    ) -> SessionHandle
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        let (handle, mut events) = Self::spawn(backend, request);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                callback(event);
            }
        });
        handle
    }
}

async fn drive(
    backend: Arc<dyn Backend>,
    request: GenerationRequest,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<SessionEvent>,
) {
    if !shared.begin() {
        return;
    }

    let opened = tokio::select! {
        biased;
        _ = shared.token.cancelled() => return,
        opened = backend.send_streaming(&request, shared.token.clone()) => opened,
    };

    let mut chunks = match opened {
        Ok(chunks) => chunks,
        Err(e) => {
            fail(&shared, &tx, e);
            return;
        }
    };

    let mut text = String::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = shared.token.cancelled() => return,
            chunk = chunks.recv() => chunk,
        };

        match chunk {
            Some(StreamChunk::TextDelta(delta)) => {
                if shared.token.is_cancelled() {
                    return;
                }
                text.push_str(&delta);
                let _ = tx.send(SessionEvent::Chunk(delta));
            }
            Some(StreamChunk::Done) | None => {
                if shared.finish(SessionState::Completed) {
                    let _ = tx.send(SessionEvent::Completed { text });
                }
                return;
            }
            Some(StreamChunk::Error(e)) => {
                fail(&shared, &tx, e);
                return;
            }
        }
    }
}

fn fail(shared: &Shared, tx: &mpsc::UnboundedSender<SessionEvent>, error: ApiError) {
    // Aborts surface as Cancelled through the consumer instead
    if error.is_abort() {
        return;
    }
    if shared.finish(SessionState::Failed) {
        debug!(session = %shared.id, error = %error, "session failed");
        let _ = tx.send(SessionEvent::Failed(error));
    }
}
