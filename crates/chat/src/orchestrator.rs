use std::sync::{Arc, Mutex, MutexGuard};

use breeze_llm::{
    EngineHost, GenerateRequest, GenerationController, LoadProgress, LoadRequest,
    ModelSessionManager, ProgressSink, Role, SessionResult,
};
use breeze_storage::{MessageId, PersistentStore};
use tokio::sync::watch;

use crate::message::ChatMessage;
use crate::settings::ChatSettings;
use crate::state::{ChatPhase, PhaseRejection, PhaseTransition, SessionState};
use crate::transcript::TranscriptStore;

/// Reply content when generation fails before producing any text.
pub const FALLBACK_REPLY: &str = "An error occurred while generating the response.";

/// Why `send` did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Empty,
    NotReady(ChatPhase),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Cancelled,
    /// Generation failed; the reply keeps its partial text or [`FALLBACK_REPLY`].
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Ignored(IgnoreReason),
    Finished {
        user_message_id: MessageId,
        message_id: MessageId,
        status: TurnStatus,
    },
}

impl TurnOutcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// Collapses whitespace runs to single spaces and trims the ends.
pub fn normalize_input(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drives one chat context: model startup, then send → stream → finalize turns.
///
/// State is published through a watch channel; [`ChatOrchestrator::subscribe`] observes
/// every transition and progress update.
pub struct ChatOrchestrator {
    sessions: Arc<ModelSessionManager>,
    generator: GenerationController,
    transcript: Mutex<TranscriptStore>,
    state: Arc<watch::Sender<SessionState>>,
    system_prompt: String,
    model_id: Option<String>,
}

impl ChatOrchestrator {
    pub fn new(
        sessions: Arc<ModelSessionManager>,
        store: Arc<dyn PersistentStore>,
        settings: &ChatSettings,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            generator: GenerationController::new(sessions.clone()),
            sessions,
            transcript: Mutex::new(TranscriptStore::open(store)),
            state: Arc::new(state),
            system_prompt: settings.system_prompt.clone(),
            model_id: settings.model_id.clone(),
        }
    }

    /// Builds the whole stack over the settings' file store.
    pub fn from_settings(host: Arc<dyn EngineHost>, settings: &ChatSettings) -> Self {
        let store = settings.open_store();
        let sessions = Arc::new(ModelSessionManager::with_default_model(
            host,
            store.clone(),
            settings.default_model_id.clone(),
        ));
        Self::new(sessions, store, settings)
    }

    pub fn sessions(&self) -> &Arc<ModelSessionManager> {
        &self.sessions
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.transcript().messages().to_vec()
    }

    pub fn find_message(&self, id: MessageId) -> Option<ChatMessage> {
        self.transcript().find_by_id(id).cloned()
    }

    pub fn clear_transcript(&self) {
        self.transcript().clear();
    }

    /// Repairs stored replies, then loads the model.
    ///
    /// A failed load leaves the context `Failed` with `error` set; calling `start` again
    /// retries. Returns immediately when a model is already loaded.
    pub async fn start(&self) -> SessionResult<()> {
        self.transcript().split_think_in_all();

        let mut rejection = None;
        self.state.send_if_modified(|state| match state.apply(PhaseTransition::BeginLoad) {
            Ok(()) => {
                state.begin_load();
                true
            }
            Err(error) => {
                rejection = Some(error);
                false
            }
        });
        if rejection == Some(PhaseRejection::AlreadyLoaded) {
            return Ok(());
        }

        let state = self.state.clone();
        let sink: ProgressSink = Arc::new(move |progress: &LoadProgress| {
            state.send_if_modified(|state| state.record_progress(progress));
        });
        let mut request = LoadRequest::new().with_progress(sink);
        if let Some(model_id) = &self.model_id {
            request = request.with_model_id(model_id.clone());
        }

        match self.sessions.load(request).await {
            Ok(session) => {
                tracing::info!(model_id = %session.model_id(), "chat ready");
                self.state.send_modify(|state| {
                    if state.apply(PhaseTransition::LoadSucceeded).is_ok() {
                        state.finish_load();
                    }
                });
                Ok(())
            }
            Err(error) => {
                tracing::error!(error = %error, "model load failed");
                let message = error.to_string();
                self.state.send_modify(|state| {
                    if state.apply(PhaseTransition::LoadFailed).is_ok() {
                        state.error = Some(message);
                    }
                });
                Err(error)
            }
        }
    }

    /// Runs one turn to completion.
    ///
    /// Ignored when the normalized text is empty or the context is not `Ready`. Otherwise
    /// the user message and an empty assistant reply are appended, tokens stream into
    /// the reply, and the reply is always finalized, even if this future is dropped.
    pub async fn send(&self, text: &str) -> TurnOutcome {
        let text = normalize_input(text);
        if text.is_empty() {
            return TurnOutcome::Ignored(IgnoreReason::Empty);
        }

        let mut rejection = None;
        let claimed = self.state.send_if_modified(|state| {
            match state.apply(PhaseTransition::BeginTurn) {
                Ok(()) => true,
                Err(error) => {
                    rejection = Some(error);
                    false
                }
            }
        });
        if !claimed {
            let phase = self.state.borrow().phase;
            tracing::debug!(phase = %phase, rejection = ?rejection, "send ignored");
            return TurnOutcome::Ignored(IgnoreReason::NotReady(phase));
        }

        let (user_message_id, message_id, history) = {
            let mut transcript = self.transcript();
            let user_message_id = transcript.add_message(Role::User, text.clone());
            let history = transcript.history();
            let message_id = transcript.add_message(Role::Assistant, "");
            (user_message_id, message_id, history)
        };
        self.state
            .send_modify(|state| state.streaming_message_id = Some(message_id));

        let mut turn = TurnGuard {
            orchestrator: self,
            message_id,
            failed: false,
        };

        let request = GenerateRequest::new(text)
            .with_system_prompt(self.system_prompt.clone())
            .with_history(history);
        let result = self
            .generator
            .generate(request, |delta| {
                self.transcript().append_content(message_id, delta);
            })
            .await;

        let status = match result {
            Ok(outcome) if outcome.was_cancelled() => TurnStatus::Cancelled,
            Ok(_) => TurnStatus::Completed,
            Err(error) => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %error,
                    "generation failed; keeping partial reply"
                );
                turn.failed = true;
                TurnStatus::Failed(error.to_string())
            }
        };
        drop(turn);

        TurnOutcome::Finished {
            user_message_id,
            message_id,
            status,
        }
    }

    /// Cancels the in-flight turn and re-enables input without waiting for it to finish.
    ///
    /// Returns false outside `Generating`.
    pub fn stop(&self) -> bool {
        let stopped = self
            .state
            .send_if_modified(|state| state.apply(PhaseTransition::Stop).is_ok());
        if stopped {
            self.generator.stop();
        }
        stopped
    }

    fn transcript(&self) -> MutexGuard<'_, TranscriptStore> {
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Finalizes the reply of one turn when dropped.
struct TurnGuard<'a> {
    orchestrator: &'a ChatOrchestrator,
    message_id: MessageId,
    failed: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        {
            let mut transcript = self.orchestrator.transcript();
            let empty = transcript
                .find_by_id(self.message_id)
                .is_some_and(|message| message.content.is_empty());
            if self.failed && empty {
                transcript.update_content(self.message_id, FALLBACK_REPLY);
            }
            transcript.post_process(self.message_id);
        }

        let message_id = self.message_id;
        self.orchestrator.state.send_if_modified(|state| {
            if state.streaming_message_id != Some(message_id) {
                return false;
            }
            state.streaming_message_id = None;
            if let Err(rejection) = state.apply(PhaseTransition::FinishTurn) {
                tracing::debug!(rejection = ?rejection, "turn finished outside a turn phase");
            }
            true
        });
    }
}
