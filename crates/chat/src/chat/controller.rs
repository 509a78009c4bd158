use std::sync::Arc;

use medigraph_triage::{
    DEFAULT_HISTORY, DEFAULT_USER_ID, FailureKind, TriageBackend, TriageRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chat::cancellation::{CancellationController, RequestToken};
use crate::chat::events::{
    StreamEvent, StreamEventPayload, StreamTarget, TurnOutcome, TurnProgress,
};
use crate::chat::ingest::{self, IngestOutcome};
use crate::chat::message::{ConversationLog, LogError, Role, Turn};
use crate::session::{SessionId, start_session};

/// Assistant text shown in place of a response that failed.
pub const FALLBACK_MESSAGE: &str = "Sorry, I encountered an error.";

/// Per-request fields that do not come from the conversation itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProfile {
    pub user_id: String,
    pub history: String,
    pub fallback_message: String,
}

impl Default for RequestProfile {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            history: DEFAULT_HISTORY.to_string(),
            fallback_message: FALLBACK_MESSAGE.to_string(),
        }
    }
}

/// Whether a triage request is in flight, and which one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming(StreamTarget),
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub session_id: SessionId,
    pub turns: Vec<Turn>,
    pub active_index: Option<usize>,
    pub is_streaming: bool,
}

enum PumpSignal {
    Event(StreamEvent),
    WorkerExited,
}

/// Owns one conversation and runs at most one triage request at a time.
///
/// Operations that start a request spawn the ingestion task on the current tokio
/// runtime, so they must be called from inside one. Stream output is applied only
/// through [`ChatController::pump`], which keeps every log mutation on the caller's task.
pub struct ChatController {
    backend: Arc<dyn TriageBackend>,
    profile: RequestProfile,
    session_id: SessionId,
    log: ConversationLog,
    cancellation: CancellationController,
    state: TurnState,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    worker: Option<JoinHandle<()>>,
}

impl ChatController {
    pub fn new(backend: Arc<dyn TriageBackend>, profile: RequestProfile) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session_id = start_session();

        tracing::info!(
            session_id = %session_id,
            endpoint = %backend.endpoint(),
            "started conversation session"
        );

        Self {
            backend,
            profile,
            session_id,
            log: ConversationLog::new(),
            cancellation: CancellationController::new(),
            state: TurnState::Idle,
            event_tx,
            event_rx,
            worker: None,
        }
    }

    /// Identifier sent with every request of the current conversation.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// True while a request is in flight; submit and regenerate are ignored then.
    pub fn is_streaming(&self) -> bool {
        matches!(self.state, TurnState::Streaming(_))
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            session_id: self.session_id,
            turns: self.log.turns().to_vec(),
            active_index: self.log.active_index(),
            is_streaming: self.is_streaming(),
        }
    }

    /// Sends `text` as a new user turn. Returns false when the submit was ignored.
    pub fn submit(&mut self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }

        if self.is_streaming() {
            // Never queue: one request in flight per session.
            tracing::debug!(session_id = %self.session_id, "ignoring submit while streaming");
            return false;
        }

        if let Err(error) = self.log.append(Turn::user(text)) {
            self.invariant_violation(error);
            return false;
        }

        self.start_turn(text.to_string())
    }

    /// Replays the most recent user turn after dropping the assistant reply to it.
    pub fn regenerate(&mut self) -> bool {
        if self.is_streaming() {
            tracing::debug!(session_id = %self.session_id, "ignoring regenerate while streaming");
            return false;
        }

        let Some(prompt) = self.log.find_last_user_turn().map(|turn| turn.content.clone())
        else {
            return false;
        };

        // A user tail has no reply to discard; truncating it would lose the prompt.
        if self
            .log
            .last()
            .is_some_and(|turn| turn.role == Role::Assistant)
            && let Err(error) = self.log.truncate_last()
        {
            self.invariant_violation(error);
            return false;
        }

        tracing::info!(session_id = %self.session_id, "regenerating last response");
        self.start_turn(prompt)
    }

    /// Cancels the in-flight request, keeping whatever text already streamed.
    ///
    /// Returns `None` when nothing was streaming. Otherwise returns the text of deltas
    /// that were queued but not yet pumped; it is already in the log, callers that
    /// render deltas print it so their output matches the log.
    pub fn stop(&mut self) -> Option<String> {
        let TurnState::Streaming(target) = self.state else {
            return None;
        };

        self.cancellation.cancel_live();
        let flushed = self.apply_pending_deltas(target);
        self.finish_turn(target, TurnOutcome::Cancelled);
        Some(flushed)
    }

    /// Abandons the conversation and starts an empty one under a new session id.
    pub fn new_session(&mut self) -> SessionId {
        self.stop();

        let previous = self.session_id;
        self.session_id = start_session();
        self.log = ConversationLog::new();

        tracing::info!(
            previous_session_id = %previous,
            session_id = %self.session_id,
            "started new conversation session"
        );
        self.session_id
    }

    /// Waits for the next stream event and applies it to the log.
    ///
    /// Stale events from superseded requests are dropped without returning.
    pub async fn pump(&mut self) -> TurnProgress {
        loop {
            let TurnState::Streaming(target) = self.state else {
                return TurnProgress::Idle;
            };

            let Some(worker) = self.worker.as_mut() else {
                // The worker is gone; replay what it queued one event per call.
                if let Some(progress) = self.handle_worker_exit(target) {
                    return progress;
                }
                continue;
            };

            let signal = tokio::select! {
                biased;
                Some(event) = self.event_rx.recv() => PumpSignal::Event(event),
                _ = worker => PumpSignal::WorkerExited,
            };

            match signal {
                PumpSignal::Event(event) => {
                    if let Some(progress) = self.handle_stream_event(event) {
                        return progress;
                    }
                }
                PumpSignal::WorkerExited => self.worker = None,
            }
        }
    }

    /// Pumps until the current turn settles and returns how it ended.
    pub async fn wait_idle(&mut self) -> Option<TurnOutcome> {
        let mut outcome = None;
        loop {
            match self.pump().await {
                TurnProgress::Idle => return outcome,
                TurnProgress::Delta(_) => {}
                TurnProgress::Finished(finished) => outcome = Some(finished),
            }
        }
    }

    fn start_turn(&mut self, prompt: String) -> bool {
        if let Err(error) = self.log.append(Turn::assistant(String::new())) {
            self.invariant_violation(error);
            return false;
        }

        let token = self.cancellation.begin_token();
        let target = StreamTarget::new(self.session_id, token.generation());
        self.state = TurnState::Streaming(target);

        let request = TriageRequest::new(prompt, self.session_id.to_string())
            .with_history(self.profile.history.clone())
            .with_user_id(self.profile.user_id.clone());

        tracing::info!(
            session_id = %self.session_id,
            generation = target.generation.0,
            turn_count = self.log.len(),
            "starting triage turn"
        );

        self.worker = Some(tokio::spawn(run_stream_worker(
            Arc::clone(&self.backend),
            request,
            token,
            target,
            self.event_tx.clone(),
        )));
        true
    }

    fn handle_stream_event(&mut self, event: StreamEvent) -> Option<TurnProgress> {
        if !self.stream_event_is_current(event.target) {
            tracing::debug!(
                generation = event.target.generation.0,
                "dropping event from superseded stream"
            );
            return None;
        }

        let target = event.target;
        let progress = match event.payload {
            StreamEventPayload::Delta(text) => {
                if let Err(error) = self.log.append_to_active(&text) {
                    self.invariant_violation(error);
                }
                TurnProgress::Delta(text)
            }
            StreamEventPayload::Done => {
                self.finish_turn(target, TurnOutcome::Completed);
                TurnProgress::Finished(TurnOutcome::Completed)
            }
            StreamEventPayload::Failed { kind, message } => {
                tracing::warn!(
                    session_id = %target.session_id,
                    generation = target.generation.0,
                    kind = ?kind,
                    error = %message,
                    "triage turn failed"
                );
                self.install_fallback();
                self.finish_turn(target, TurnOutcome::Failed(kind));
                TurnProgress::Finished(TurnOutcome::Failed(kind))
            }
            StreamEventPayload::Cancelled => {
                self.finish_turn(target, TurnOutcome::Cancelled);
                TurnProgress::Finished(TurnOutcome::Cancelled)
            }
        };

        Some(progress)
    }

    fn handle_worker_exit(&mut self, target: StreamTarget) -> Option<TurnProgress> {
        while let Ok(event) = self.event_rx.try_recv() {
            if let Some(progress) = self.handle_stream_event(event) {
                return Some(progress);
            }
        }

        if !self.stream_event_is_current(target) {
            return None;
        }

        tracing::warn!(
            session_id = %target.session_id,
            generation = target.generation.0,
            "stream worker ended before a terminal event"
        );
        self.install_fallback();
        self.finish_turn(target, TurnOutcome::Failed(FailureKind::Stream));
        Some(TurnProgress::Finished(TurnOutcome::Failed(FailureKind::Stream)))
    }

    fn apply_pending_deltas(&mut self, target: StreamTarget) -> String {
        let mut flushed = String::new();
        while let Ok(event) = self.event_rx.try_recv() {
            if event.target != target {
                continue;
            }
            let StreamEventPayload::Delta(text) = event.payload else {
                continue;
            };
            match self.log.append_to_active(&text) {
                Ok(()) => flushed.push_str(&text),
                Err(error) => self.invariant_violation(error),
            }
        }
        flushed
    }

    fn install_fallback(&mut self) {
        if let Err(error) = self.log.overwrite_active(&self.profile.fallback_message) {
            self.invariant_violation(error);
        }
    }

    fn finish_turn(&mut self, target: StreamTarget, outcome: TurnOutcome) {
        self.cancellation.cancel_live();
        self.log.deactivate();
        self.state = TurnState::Idle;
        // The task exits on its own once its token is dead or its body ended.
        self.worker = None;

        tracing::info!(
            session_id = %target.session_id,
            generation = target.generation.0,
            outcome = ?outcome,
            "triage turn finished"
        );
    }

    fn stream_event_is_current(&self, target: StreamTarget) -> bool {
        matches!(self.state, TurnState::Streaming(active) if active == target)
    }

    fn invariant_violation(&self, error: LogError) {
        tracing::error!(
            session_id = %self.session_id,
            error = %error,
            "conversation log invariant violated"
        );
        debug_assert!(false, "conversation log invariant violated: {error}");
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        self.cancellation.cancel_live();
    }
}

async fn run_stream_worker(
    backend: Arc<dyn TriageBackend>,
    request: TriageRequest,
    token: RequestToken,
    target: StreamTarget,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
) {
    let result = ingest::run(backend.as_ref(), &request, &token, |text| {
        let _ = event_tx.send(StreamEvent::delta(target, text));
    })
    .await;

    let payload = match result {
        Ok(IngestOutcome::Completed) => StreamEventPayload::Done,
        Ok(IngestOutcome::Cancelled) => {
            tracing::debug!(generation = target.generation.0, "triage stream cancelled");
            StreamEventPayload::Cancelled
        }
        Err(error) => StreamEventPayload::Failed {
            kind: error.kind(),
            message: error.to_string(),
        },
    };

    let _ = event_tx.send(StreamEvent::new(target, payload));
}
