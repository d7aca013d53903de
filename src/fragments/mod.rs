//! Fragment task registry
//!
//! Coordinates concurrent generations keyed by fragment id. The registry
//! owns every [`GenerationTask`] and its [`GenerationParams`], keeps at most
//! one active session per fragment, and mirrors each task change into the
//! presentation sink.
//!
//! All maps sit behind one mutex that is never held across an `.await`, so
//! every check-then-mutate sequence is atomic with respect to other calls.
//! Each fragment also has a push lane, an async mutex held from a state
//! change until its snapshot has reached the sink, so a surface receives
//! snapshots in the order the registry produced them.

mod params;
mod prompt;
mod sink;
mod task;

pub use params::{GenerationKind, GenerationParams};
pub use prompt::{
    ConversationBuilder, InstructionBuilder, ManuscriptContext, ManuscriptSource, PromptError,
    StaticManuscript,
};
pub use sink::{Fallback, PresentationSink, SinkError};
pub use task::{FragmentId, GenerationTask};

use crate::api::ProviderAdapter;
use crate::session::{SessionEvent, SessionEvents, SessionHandle, SessionId};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

/// User-facing, non-fatal registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown fragment: {0}")]
    UnknownFragment(FragmentId),

    #[error("No saved generation parameters for fragment {0}")]
    MissingParams(FragmentId),

    #[error("Fragment {0} has no active generation")]
    NoActiveSession(FragmentId),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// What a successful `stop` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// An active session was cancelled
    Stopped,
    /// The session had already ended; only stale state was cleared
    Reconciled,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<FragmentId, GenerationTask>,
    params: HashMap<FragmentId, GenerationParams>,
    active: HashMap<FragmentId, SessionHandle>,
    lanes: HashMap<FragmentId, Arc<AsyncMutex<()>>>,
}

#[derive(Clone)]
pub struct FragmentRegistry {
    adapter: ProviderAdapter,
    builder: Arc<dyn ConversationBuilder>,
    sink: Option<Arc<dyn PresentationSink>>,
    fallback: Option<Fallback>,
    state: Arc<Mutex<RegistryState>>,
    /// Signalled after every push
    pushed: Arc<Notify>,
}

impl FragmentRegistry {
    pub fn new(adapter: ProviderAdapter, builder: Arc<dyn ConversationBuilder>) -> Self {
        Self {
            adapter,
            builder,
            sink: None,
            fallback: None,
            state: Arc::new(Mutex::new(RegistryState::default())),
            pushed: Arc::new(Notify::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PresentationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lane(&self, id: &FragmentId) -> Arc<AsyncMutex<()>> {
        self.state().lanes.entry(id.clone()).or_default().clone()
    }

    /// Lane of a fragment the registry knows about
    fn existing_lane(&self, id: &FragmentId) -> Option<Arc<AsyncMutex<()>>> {
        self.state().lanes.get(id).cloned()
    }

    /// Start generating a fragment.
    ///
    /// Without an id a new one is minted. With an id that already names a
    /// task, that task is reset and reused so its surface is updated rather
    /// than duplicated; a session still running for it is cancelled.
    pub async fn start(
        &self,
        id: Option<FragmentId>,
        params: GenerationParams,
    ) -> Result<FragmentId, RegistryError> {
        let messages = self.builder.build(&params).await?;
        let id = id.unwrap_or_else(FragmentId::generate);
        let title = params.title();

        let lane = self.lane(&id);
        let _push = lane.lock().await;

        let (handle, events) = self.adapter.open_session(messages);
        let session = handle.id();

        let (snapshot, created) = {
            let mut state = self.state();
            if let Some(superseded) = state.active.insert(id.clone(), handle) {
                superseded.cancel();
            }
            state.params.insert(id.clone(), params);

            let created = !state.tasks.contains_key(&id);
            let task = state
                .tasks
                .entry(id.clone())
                .and_modify(|task| task.restart(title))
                .or_insert_with(|| GenerationTask::new(id.clone(), title));
            task.has_params = true;
            (task.clone(), created)
        };

        info!(fragment = %id, %session, "Generation started");
        self.push(&snapshot, created).await;

        tokio::spawn(self.clone().pump(id.clone(), session, events, lane.clone()));
        Ok(id)
    }

    async fn pump(
        self,
        id: FragmentId,
        session: SessionId,
        mut events: SessionEvents,
        lane: Arc<AsyncMutex<()>>,
    ) {
        while let Some(event) = events.next().await {
            let terminal = event.is_terminal();
            let _push = lane.lock().await;
            if let Some(snapshot) = self.apply(&id, session, event) {
                self.push(&snapshot, false).await;
            }
            if terminal {
                break;
            }
        }
    }

    /// Fold one session event into the task; None when the event is stale
    fn apply(
        &self,
        id: &FragmentId,
        session: SessionId,
        event: SessionEvent,
    ) -> Option<GenerationTask> {
        let mut state = self.state();
        let current = state.active.get(id).map(SessionHandle::id);
        if current != Some(session) {
            debug!(fragment = %id, %session, "Ignoring event from superseded session");
            return None;
        }
        if event.is_terminal() {
            state.active.remove(id);
        }

        let task = state.tasks.get_mut(id)?;
        match event {
            SessionEvent::Chunk(text) => task.append(&text),
            SessionEvent::Completed { .. } => {
                info!(fragment = %id, chars = task.content.chars().count(), "Generation completed");
                task.complete();
            }
            SessionEvent::Failed(error) => {
                warn!(fragment = %id, "Generation failed: {}", error);
                task.fail(error.to_string());
            }
            SessionEvent::Cancelled => task.mark_stopped(),
        }
        Some(task.clone())
    }

    /// Stop a fragment's generation
    pub async fn stop(&self, id: &FragmentId) -> Result<StopOutcome, RegistryError> {
        let lane = self
            .existing_lane(id)
            .ok_or_else(|| RegistryError::UnknownFragment(id.clone()))?;
        let _push = lane.lock().await;

        let (snapshot, outcome) = {
            let mut state = self.state();
            if !state.tasks.contains_key(id) {
                return Err(RegistryError::UnknownFragment(id.clone()));
            }

            match state.active.get(id).cloned() {
                Some(handle) => {
                    if !handle.cancel() {
                        // Finished concurrently; its pump delivers the rest
                        return Ok(StopOutcome::Reconciled);
                    }
                    state.active.remove(id);
                    let task = state.tasks.get_mut(id).map(|task| {
                        task.mark_stopped();
                        task.clone()
                    });
                    (task, StopOutcome::Stopped)
                }
                None => {
                    let task = state
                        .tasks
                        .get_mut(id)
                        .filter(|task| task.is_generating)
                        .map(|task| {
                            task.complete();
                            task.clone()
                        });
                    match task {
                        Some(task) => (Some(task), StopOutcome::Reconciled),
                        None => return Err(RegistryError::NoActiveSession(id.clone())),
                    }
                }
            }
        };

        info!(fragment = %id, ?outcome, "Generation stopped");
        if let Some(snapshot) = snapshot {
            self.push(&snapshot, false).await;
        }
        Ok(outcome)
    }

    /// Stop every active generation concurrently; returns how many were cancelled
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<FragmentId> = self.state().active.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        results
            .into_iter()
            .filter(|result| matches!(result, Ok(StopOutcome::Stopped)))
            .count()
    }

    /// Regenerate a fragment from its stored parameters under the same id
    pub async fn regenerate(&self, id: &FragmentId) -> Result<FragmentId, RegistryError> {
        let (params, generating) = {
            let state = self.state();
            let params = state
                .params
                .get(id)
                .cloned()
                .ok_or_else(|| RegistryError::MissingParams(id.clone()))?;
            let task = state
                .tasks
                .get(id)
                .ok_or_else(|| RegistryError::UnknownFragment(id.clone()))?;
            (params, task.is_generating)
        };

        if generating {
            if let Err(e) = self.stop(id).await {
                debug!(fragment = %id, "Stop before regenerate: {}", e);
            }
        }

        self.start(Some(id.clone()), params).await
    }

    /// Cancel if running and forget the fragment entirely
    pub async fn dismiss(&self, id: &FragmentId) -> Result<(), RegistryError> {
        let lane = self
            .existing_lane(id)
            .ok_or_else(|| RegistryError::UnknownFragment(id.clone()))?;
        let _push = lane.lock().await;

        {
            let mut state = self.state();
            state.lanes.remove(id);
            if let Some(handle) = state.active.remove(id) {
                handle.cancel();
            }
            state.params.remove(id);
            if state.tasks.remove(id).is_none() {
                return Err(RegistryError::UnknownFragment(id.clone()));
            }
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.close(id.as_str()).await {
                warn!(fragment = %id, "Failed to close surface: {}", e);
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    /// Wait until the fragment stops generating and its final snapshot has
    /// been pushed. None for an unknown or dismissed fragment.
    pub async fn settled(&self, id: &FragmentId) -> Option<GenerationTask> {
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lane = self.existing_lane(id)?;
            let task = {
                let _push = lane.lock().await;
                self.task(id)?
            };
            if !task.is_generating {
                return Some(task);
            }
            notified.await;
        }
    }

    pub fn task(&self, id: &FragmentId) -> Option<GenerationTask> {
        self.state().tasks.get(id).cloned()
    }

    /// All tasks, oldest first
    pub fn tasks(&self) -> Vec<GenerationTask> {
        let mut tasks: Vec<GenerationTask> = self.state().tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    pub fn params(&self, id: &FragmentId) -> Option<GenerationParams> {
        self.state().params.get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn is_active(&self, id: &FragmentId) -> bool {
        self.state().active.contains_key(id)
    }

    async fn push(&self, task: &GenerationTask, created: bool) {
        self.present(task, created).await;
        self.pushed.notify_waiters();
    }

    async fn present(&self, task: &GenerationTask, created: bool) {
        let Some(sink) = &self.sink else {
            self.fall_back(task);
            return;
        };

        let result = if created {
            sink.create(task).await
        } else {
            sink.update(task).await
        };
        if let Err(e) = result {
            warn!(fragment = %task.id, "Presentation sink failed: {}", e);
            self.fall_back(task);
        }
    }

    fn fall_back(&self, task: &GenerationTask) {
        if let Some(fallback) = &self.fallback {
            fallback(&task.content, &task.title);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Gate, RecordingSink, ScriptedBackend, Step};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        registry: FragmentRegistry,
        backend: Arc<ScriptedBackend>,
        sink: Arc<RecordingSink>,
        builder: Arc<InstructionBuilder<StaticManuscript>>,
    }

    fn manuscript() -> ManuscriptContext {
        ManuscriptContext {
            book_title: "The Salt Road".into(),
            settings: None,
            chapter_outline: Some("Mira leaves the oasis".into()),
            chapter_text: "Dawn broke.".into(),
        }
    }

    fn fixture(script: Vec<Step>) -> Fixture {
        fixture_with_sink(script, RecordingSink::default())
    }

    fn fixture_with_sink(script: Vec<Step>, sink: RecordingSink) -> Fixture {
        let backend = Arc::new(ScriptedBackend::new(script));
        let sink = Arc::new(sink);
        let builder = Arc::new(InstructionBuilder::new(StaticManuscript::new(manuscript())));
        let registry =
            FragmentRegistry::new(ProviderAdapter::from_backend(backend.clone()), builder.clone())
                .with_sink(sink.clone());
        Fixture {
            registry,
            backend,
            sink,
            builder,
        }
    }

    fn expand() -> GenerationParams {
        GenerationParams::new(GenerationKind::Expand, "She walked.", "b1", "c1")
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn settle(registry: &FragmentRegistry, id: &FragmentId) -> GenerationTask {
        wait_until(|| {
            registry
                .task(id)
                .map(|task| !task.is_generating)
                .unwrap_or(false)
        })
        .await;
        registry.task(id).unwrap()
    }

    #[tokio::test]
    async fn test_streamed_chunks_accumulate() {
        let f = fixture(vec![Step::Text("Hi"), Step::Text(" there"), Step::Done]);
        let id = assert_ok!(f.registry.start(Some("f1".into()), expand()).await);
        assert_eq!(id.as_str(), "f1");

        let task = settle(&f.registry, &id).await;
        assert_eq!(task.content, "Hi there");
        assert!(!task.is_generating);
        assert!(!task.was_stopped);
        assert!(task.error.is_none());
        assert!(task.has_params);
        assert_eq!(task.title, "Expanded passage");
        assert_eq!(f.registry.active_count(), 0);

        wait_until(|| {
            f.sink
                .last_update()
                .map(|t| !t.is_generating)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(f.sink.created_count(), 1);
        assert_eq!(f.sink.last_update().unwrap().content, "Hi there");
    }

    #[tokio::test]
    async fn test_start_without_id_mints_one() {
        let f = fixture(vec![Step::Done]);
        let id = assert_ok!(f.registry.start(None, expand()).await);
        assert!(id.as_str().starts_with("streaming-"));
        assert!(f.registry.task(&id).is_some());
    }

    #[tokio::test]
    async fn test_stop_before_first_chunk() {
        let gate = Gate::new();
        let f = fixture(vec![Step::Wait(gate.clone()), Step::Text("late"), Step::Done]);
        let id = assert_ok!(f.registry.start(Some("f2".into()), expand()).await);

        assert_eq!(assert_ok!(f.registry.stop(&id).await), StopOutcome::Stopped);
        gate.open();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let task = f.registry.task(&id).unwrap();
        assert!(!task.is_generating);
        assert!(task.was_stopped);
        assert_eq!(task.content, "");
        assert!(task.error.is_none());
        assert!(!f.registry.is_active(&id));
    }

    #[tokio::test]
    async fn test_stop_twice_same_end_state() {
        let gate = Gate::new();
        let f = fixture(vec![Step::Text("a"), Step::Wait(gate), Step::Done]);
        let id = assert_ok!(f.registry.start(Some("f3".into()), expand()).await);
        wait_until(|| f.registry.task(&id).map(|t| t.content == "a").unwrap_or(false)).await;

        assert_ok!(f.registry.stop(&id).await);
        let once = f.registry.task(&id).unwrap();

        let second = assert_err!(f.registry.stop(&id).await);
        assert!(matches!(second, RegistryError::NoActiveSession(_)));
        let twice = f.registry.task(&id).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.content, "a");
        assert!(twice.was_stopped);
    }

    #[tokio::test]
    async fn test_stop_unknown_fragment() {
        let f = fixture(vec![Step::Done]);
        let err = assert_err!(f.registry.stop(&"nope".into()).await);
        assert!(matches!(err, RegistryError::UnknownFragment(_)));
    }

    #[tokio::test]
    async fn test_regenerate_unknown_makes_no_call() {
        let f = fixture(vec![Step::Done]);
        let err = assert_err!(f.registry.regenerate(&"unknown-id".into()).await);
        assert!(matches!(err, RegistryError::MissingParams(_)));
        assert_eq!(f.backend.calls(), 0);
        assert!(f.registry.tasks().is_empty());
        assert_eq!(f.sink.created_count(), 0);
    }

    #[tokio::test]
    async fn test_regenerate_reuses_surface_and_resets_content() {
        let f = fixture(vec![Step::Text("Hi"), Step::Done]);
        let id = assert_ok!(f.registry.start(Some("f1".into()), expand()).await);
        settle(&f.registry, &id).await;
        wait_until(|| f.sink.last_update().map(|t| !t.is_generating).unwrap_or(false)).await;
        let before = f.sink.updates().len();

        let again = assert_ok!(f.registry.regenerate(&id).await);
        assert_eq!(again, id);

        let task = settle(&f.registry, &id).await;
        assert_eq!(task.content, "Hi");
        assert_eq!(f.backend.calls(), 2);
        assert_eq!(f.sink.created_count(), 1);

        let first_push = f.sink.updates()[before].clone();
        assert_eq!(first_push.content, "");
        assert!(first_push.is_generating);
    }

    #[tokio::test]
    async fn test_regenerate_while_generating_stops_first() {
        let gate = Gate::new();
        let f = fixture(vec![Step::Text("a"), Step::Wait(gate.clone()), Step::Done]);
        let id = assert_ok!(f.registry.start(Some("f4".into()), expand()).await);
        wait_until(|| f.registry.task(&id).map(|t| t.content == "a").unwrap_or(false)).await;

        assert_ok!(f.registry.regenerate(&id).await);
        assert!(f.sink.updates().iter().any(|t| t.was_stopped));

        gate.open();
        let task = settle(&f.registry, &id).await;
        assert_eq!(task.content, "a");
        assert!(!task.was_stopped);
        assert_eq!(f.backend.calls(), 2);
        assert_eq!(f.registry.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_regenerate_rebuilds_from_current_manuscript() {
        let f = fixture(vec![Step::Done]);
        let id = assert_ok!(f.registry.start(Some("f5".into()), expand()).await);
        settle(&f.registry, &id).await;

        f.builder.source().replace(ManuscriptContext {
            chapter_text: "Night fell.".into(),
            ..manuscript()
        });
        assert_ok!(f.registry.regenerate(&id).await);
        settle(&f.registry, &id).await;

        let requests = f.backend.requests();
        assert!(requests[0].messages[0].content.contains("Dawn broke."));
        assert!(requests[1].messages[0].content.contains("Night fell."));
    }

    #[tokio::test]
    async fn test_cancelling_one_leaves_other_running() {
        let gate = Gate::new();
        let f = fixture(vec![Step::Text("a"), Step::Wait(gate.clone()), Step::Text("b"), Step::Done]);
        let one = assert_ok!(f.registry.start(Some("one".into()), expand()).await);
        let two = assert_ok!(f.registry.start(Some("two".into()), expand()).await);
        wait_until(|| {
            [&one, &two]
                .iter()
                .all(|id| f.registry.task(id).map(|t| t.content == "a").unwrap_or(false))
        })
        .await;

        assert_ok!(f.registry.stop(&one).await);
        assert!(f.registry.task(&two).unwrap().is_generating);

        gate.open();
        let two_task = settle(&f.registry, &two).await;
        assert_eq!(two_task.content, "ab");
        assert!(!two_task.was_stopped);

        let one_task = f.registry.task(&one).unwrap();
        assert_eq!(one_task.content, "a");
        assert!(one_task.was_stopped);
    }

    #[tokio::test]
    async fn test_stop_all_fans_out() {
        let gate = Gate::new();
        let f = fixture(vec![Step::Wait(gate), Step::Done]);
        let a = assert_ok!(f.registry.start(None, expand()).await);
        let b = assert_ok!(f.registry.start(None, expand()).await);
        assert_eq!(f.registry.active_count(), 2);

        assert_eq!(f.registry.stop_all().await, 2);
        assert_eq!(f.registry.active_count(), 0);
        for id in [a, b] {
            let task = f.registry.task(&id).unwrap();
            assert!(task.was_stopped);
            assert!(!task.is_generating);
        }
        assert_eq!(f.registry.stop_all().await, 0);
    }

    #[tokio::test]
    async fn test_failure_recorded_and_cleaned_up() {
        let f = fixture(vec![Step::Text("x"), Step::Fail("quota exceeded")]);
        let id = assert_ok!(f.registry.start(Some("f6".into()), expand()).await);

        let task = settle(&f.registry, &id).await;
        assert!(task.error.unwrap().contains("quota exceeded"));
        assert!(!task.was_stopped);
        assert_eq!(f.registry.active_count(), 0);

        let err = assert_err!(f.registry.stop(&id).await);
        assert!(matches!(err, RegistryError::NoActiveSession(_)));
    }

    #[tokio::test]
    async fn test_prompt_error_starts_nothing() {
        let f = fixture(vec![Step::Done]);
        let params = GenerationParams::new(GenerationKind::Rewrite, "text", "b1", "c1");
        let err = assert_err!(f.registry.start(None, params).await);
        assert!(matches!(
            err,
            RegistryError::Prompt(PromptError::MissingRewriteInstruction)
        ));
        assert_eq!(f.backend.calls(), 0);
        assert!(f.registry.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_without_sink() {
        let delivered = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
        let log = delivered.clone();
        let backend = Arc::new(ScriptedBackend::new(vec![Step::Text("Hi"), Step::Done]));
        let builder = Arc::new(InstructionBuilder::new(StaticManuscript::new(manuscript())));
        let registry = FragmentRegistry::new(ProviderAdapter::from_backend(backend), builder)
            .with_fallback(move |content, title| {
                log.lock().unwrap().push((content.to_string(), title.to_string()));
            });

        let id = assert_ok!(registry.start(None, expand()).await);
        settle(&registry, &id).await;
        wait_until(|| {
            delivered
                .lock()
                .unwrap()
                .last()
                .map(|(content, _)| content == "Hi")
                .unwrap_or(false)
        })
        .await;

        let last = delivered.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last, ("Hi".to_string(), "Expanded passage".to_string()));
    }

    #[tokio::test]
    async fn test_failing_sink_falls_back() {
        let delivered = Arc::new(Mutex::new(0usize));
        let count = delivered.clone();
        let backend = Arc::new(ScriptedBackend::new(vec![Step::Done]));
        let builder = Arc::new(InstructionBuilder::new(StaticManuscript::new(manuscript())));
        let registry = FragmentRegistry::new(ProviderAdapter::from_backend(backend), builder)
            .with_sink(Arc::new(RecordingSink::failing()))
            .with_fallback(move |_, _| *count.lock().unwrap() += 1);

        assert_ok!(registry.start(None, expand()).await);
        assert!(*delivered.lock().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_dismiss_forgets_fragment() {
        let gate = Gate::new();
        let f = fixture(vec![Step::Wait(gate), Step::Done]);
        let id = assert_ok!(f.registry.start(Some("f7".into()), expand()).await);

        assert_ok!(f.registry.dismiss(&id).await);
        assert!(f.registry.task(&id).is_none());
        assert!(f.registry.params(&id).is_none());
        assert_eq!(f.registry.active_count(), 0);
        assert_eq!(*f.sink.closed.lock().unwrap(), vec!["f7".to_string()]);

        let err = assert_err!(f.registry.dismiss(&id).await);
        assert!(matches!(err, RegistryError::UnknownFragment(_)));
    }

    #[tokio::test]
    async fn test_stop_is_the_last_push_behind_a_slow_sink() {
        let gate = Gate::new();
        let f = fixture_with_sink(
            vec![Step::Text("a"), Step::Wait(gate), Step::Done],
            RecordingSink::slow(Duration::from_millis(50)),
        );
        let id = assert_ok!(f.registry.start(Some("f8".into()), expand()).await);
        wait_until(|| f.registry.task(&id).map(|t| t.content == "a").unwrap_or(false)).await;

        assert_eq!(assert_ok!(f.registry.stop(&id).await), StopOutcome::Stopped);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let task = f.registry.task(&id).unwrap();
        assert!(!task.is_generating);
        assert!(task.was_stopped);

        let last = f.sink.last_update().unwrap();
        assert!(!last.is_generating);
        assert!(last.was_stopped);
        assert_eq!(last.content, "a");
    }

    #[tokio::test]
    async fn test_regenerate_reset_not_overtaken_by_old_session() {
        let gate = Gate::new();
        let f = fixture_with_sink(
            vec![Step::Text("a"), Step::Wait(gate.clone()), Step::Text("b"), Step::Done],
            RecordingSink::slow(Duration::from_millis(30)),
        );
        let id = assert_ok!(f.registry.start(Some("f9".into()), expand()).await);
        wait_until(|| f.registry.task(&id).map(|t| t.content == "a").unwrap_or(false)).await;

        assert_ok!(f.registry.regenerate(&id).await);
        gate.open();
        let task = tokio::time::timeout(Duration::from_secs(2), f.registry.settled(&id))
            .await
            .expect("regeneration did not settle")
            .unwrap();
        assert_eq!(task.content, "ab");

        let updates = f.sink.updates();
        let stopped = updates.iter().position(|t| t.was_stopped).unwrap();
        let reset = updates
            .iter()
            .position(|t| t.is_generating && t.content.is_empty())
            .unwrap();
        assert!(stopped < reset);
        assert!(updates[reset..].iter().all(|t| !t.was_stopped));

        let last = updates.last().unwrap();
        assert_eq!(last.content, "ab");
        assert!(!last.is_generating);
    }

    #[tokio::test]
    async fn test_settled_waits_for_final_push() {
        let f = fixture_with_sink(
            vec![Step::Text("Hi"), Step::Text(" there"), Step::Done],
            RecordingSink::slow(Duration::from_millis(20)),
        );
        let id = assert_ok!(f.registry.start(Some("f10".into()), expand()).await);

        let task = tokio::time::timeout(Duration::from_secs(2), f.registry.settled(&id))
            .await
            .expect("generation did not settle")
            .unwrap();
        assert_eq!(task.content, "Hi there");

        // Already delivered, no polling needed
        let last = f.sink.last_update().unwrap();
        assert_eq!(last, task);
    }

    #[tokio::test]
    async fn test_settled_unknown_fragment() {
        let f = fixture(vec![Step::Done]);
        assert!(f.registry.settled(&"nope".into()).await.is_none());
    }
}
