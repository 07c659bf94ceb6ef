use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use snafu::{OptionExt, ResultExt};
use tokio_util::sync::CancellationToken;

use super::engine::{EngineMessage, Role};
use super::error::{GenerationResult, OpenStreamSnafu, SessionNotReadySnafu, StreamChunkSnafu};
use super::session::ModelSessionManager;

/// Input for one streamed completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerateRequest {
    pub user_text: String,
    pub system_prompt: Option<String>,
    /// Prior conversation, used verbatim when non-empty.
    pub history: Vec<EngineMessage>,
}

impl GenerateRequest {
    pub fn new(user_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            system_prompt: None,
            history: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<EngineMessage>) -> Self {
        self.history = history;
        self
    }

    /// Message list sent to the engine.
    ///
    /// A non-empty history is sent as-is, with the system prompt prepended only when the
    /// history does not already open with a system message. Without history the list is
    /// the optional system prompt followed by the user text.
    pub fn build_messages(&self) -> Vec<EngineMessage> {
        let system_prompt = self
            .system_prompt
            .as_deref()
            .filter(|prompt| !prompt.is_empty());

        if self.history.is_empty() {
            let mut messages = Vec::with_capacity(2);
            if let Some(prompt) = system_prompt {
                messages.push(EngineMessage::system(prompt));
            }
            messages.push(EngineMessage::user(self.user_text.clone()));
            return messages;
        }

        let mut messages = Vec::with_capacity(self.history.len() + 1);
        let opens_with_system = self
            .history
            .first()
            .is_some_and(|message| message.role == Role::System);
        if let Some(prompt) = system_prompt
            && !opens_with_system
        {
            messages.push(EngineMessage::system(prompt));
        }
        messages.extend(self.history.iter().cloned());
        messages
    }
}

/// How a generation ended when the stream did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { deltas: usize },
    Cancelled { deltas: usize },
}

impl GenerationOutcome {
    pub fn deltas(&self) -> usize {
        match self {
            Self::Completed { deltas } | Self::Cancelled { deltas } => *deltas,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[derive(Debug)]
struct ActiveGeneration {
    id: u64,
    cancel: CancellationToken,
}

/// Streams completions from the manager's ready session.
///
/// Every `generate` call gets a fresh cancellation token, so a `stop` aimed at one turn can
/// never cancel the next. The controller does not enforce exclusivity: a second
/// `generate` replaces the first as the target of `stop`.
pub struct GenerationController {
    sessions: Arc<ModelSessionManager>,
    active: Mutex<Option<ActiveGeneration>>,
    next_generation_id: AtomicU64,
}

impl GenerationController {
    pub fn new(sessions: Arc<ModelSessionManager>) -> Self {
        Self {
            sessions,
            active: Mutex::new(None),
            next_generation_id: AtomicU64::new(1),
        }
    }

    pub fn sessions(&self) -> &Arc<ModelSessionManager> {
        &self.sessions
    }

    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    /// Cancels the active generation. Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        let active = self.active();
        match active.as_ref() {
            Some(generation) => {
                tracing::debug!(generation_id = generation.id, "generation stop requested");
                generation.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Streams one completion, calling `on_token` once per non-empty delta in stream order.
    ///
    /// Cancellation is checked at every chunk boundary; once observed the remaining stream
    /// is dropped without being drained.
    pub async fn generate<F>(
        &self,
        request: GenerateRequest,
        mut on_token: F,
    ) -> GenerationResult<GenerationOutcome>
    where
        F: FnMut(&str),
    {
        let session = self.sessions.ready_session().context(SessionNotReadySnafu {
            stage: "generate-require-session",
        })?;
        let model_id = session.model_id().to_string();

        let cancel = CancellationToken::new();
        let generation_id = self.next_generation_id.fetch_add(1, Ordering::AcqRel);
        *self.active() = Some(ActiveGeneration {
            id: generation_id,
            cancel: cancel.clone(),
        });
        let _active = ActiveGuard {
            controller: self,
            generation_id,
        };

        let messages = request.build_messages();
        tracing::debug!(
            generation_id,
            model_id = %model_id,
            message_count = messages.len(),
            "opening completion stream"
        );

        let mut stream = session
            .stream_chat(messages)
            .await
            .context(OpenStreamSnafu {
                stage: "generate-open-stream",
                model_id: model_id.clone(),
            })?;

        let mut deltas = 0usize;
        let outcome = loop {
            let next_item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break GenerationOutcome::Cancelled { deltas },
                next_item = stream.next() => next_item,
            };

            match next_item {
                Some(Ok(delta)) => {
                    if cancel.is_cancelled() {
                        break GenerationOutcome::Cancelled { deltas };
                    }
                    if delta.text.is_empty() {
                        continue;
                    }
                    deltas += 1;
                    on_token(&delta.text);
                }
                Some(Err(source)) => {
                    tracing::warn!(
                        generation_id,
                        model_id = %model_id,
                        delivered = deltas,
                        error = %source,
                        "completion stream emitted an error chunk"
                    );
                    return Err(source).context(StreamChunkSnafu {
                        stage: "generate-stream-chunk",
                        model_id,
                        delivered: deltas,
                    });
                }
                None => break GenerationOutcome::Completed { deltas },
            }
        };

        if outcome.was_cancelled() {
            tracing::debug!(generation_id, delivered = deltas, "completion stream cancelled");
        }

        Ok(outcome)
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveGeneration>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the active slot on every exit path, unless a newer generation already took it.
struct ActiveGuard<'a> {
    controller: &'a GenerationController,
    generation_id: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.controller.active();
        if active
            .as_ref()
            .is_some_and(|generation| generation.id == self.generation_id)
        {
            *active = None;
        }
    }
}
