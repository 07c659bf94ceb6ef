//! Scripted engine doubles for tests.
//!
//! `ScriptedHost` hands out one shared `ScriptedRuntime`; every session the runtime builds
//! answers `stream_chat` from the same `ReplyScript` queue, one queued reply per call.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::mpsc;

use super::engine::{
    BoxError, BoxFuture, ChatDelta, DeltaStream, EngineHost, EngineMessage, EngineResult, EngineRuntime,
    EngineSession, InitProgress, SessionOptions,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct ScriptedFailure(pub String);

impl fmt::Display for ScriptedFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl std::error::Error for ScriptedFailure {}

/// One step of a scripted completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedChunk {
    Text(String),
    Fail(String),
}

impl ScriptedChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }

    fn into_result(self) -> EngineResult<ChatDelta> {
        match self {
            Self::Text(text) => Ok(ChatDelta::new(text)),
            Self::Fail(message) => Err(Box::new(ScriptedFailure(message))),
        }
    }
}

enum ScriptedReply {
    Chunks(Vec<ScriptedChunk>),
    Live(mpsc::UnboundedReceiver<ScriptedChunk>),
    OpenFailure(String),
}

/// Queue of replies consumed by `stream_chat`, plus a log of requests.
#[derive(Default)]
pub struct ReplyScript {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<EngineMessage>>>,
}

impl ReplyScript {
    pub fn push_chunks<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = chunks.into_iter().map(ScriptedChunk::text).collect();
        lock(&self.replies).push_back(ScriptedReply::Chunks(chunks));
    }

    /// Queues a reply that yields `chunks` and then fails with `message`.
    pub fn push_failure_after<I, S>(&self, chunks: I, message: &str)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut chunks = chunks
            .into_iter()
            .map(ScriptedChunk::text)
            .collect::<Vec<_>>();
        chunks.push(ScriptedChunk::fail(message));
        lock(&self.replies).push_back(ScriptedReply::Chunks(chunks));
    }

    /// Queues a reply whose chunks the test feeds by hand; dropping the sender ends it.
    pub fn push_live(&self) -> mpsc::UnboundedSender<ScriptedChunk> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.replies).push_back(ScriptedReply::Live(receiver));
        sender
    }

    /// Queues a reply whose stream cannot be opened at all.
    pub fn push_open_failure(&self, message: impl Into<String>) {
        lock(&self.replies).push_back(ScriptedReply::OpenFailure(message.into()));
    }

    pub fn requests(&self) -> Vec<Vec<EngineMessage>> {
        lock(&self.requests).clone()
    }

    fn next_reply(&self, messages: Vec<EngineMessage>) -> EngineResult<DeltaStream> {
        lock(&self.requests).push(messages);
        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or(ScriptedReply::Chunks(Vec::new()));

        match reply {
            ScriptedReply::Chunks(chunks) => Ok(futures::stream::iter(
                chunks.into_iter().map(ScriptedChunk::into_result),
            )
            .boxed()),
            ScriptedReply::Live(receiver) => Ok(futures::stream::unfold(
                receiver,
                |mut receiver| async move {
                    receiver
                        .recv()
                        .await
                        .map(|chunk| (chunk.into_result(), receiver))
                },
            )
            .boxed()),
            ScriptedReply::OpenFailure(message) => Err(Box::new(ScriptedFailure(message))),
        }
    }
}

pub struct ScriptedSession {
    model_id: String,
    script: Arc<ReplyScript>,
}

impl EngineSession for ScriptedSession {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn stream_chat(&self, messages: Vec<EngineMessage>) -> BoxFuture<'_, EngineResult<DeltaStream>> {
        Box::pin(async move { self.script.next_reply(messages) })
    }
}

#[derive(Default)]
pub struct ScriptedRuntime {
    script: Arc<ReplyScript>,
    progress_script: Vec<InitProgress>,
    pending_failures: AtomicUsize,
    created_models: Mutex<Vec<String>>,
    cache_flags: Mutex<Vec<bool>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress events replayed through the init callback on every construction.
    pub fn with_progress_script(mut self, progress: Vec<InitProgress>) -> Self {
        self.progress_script = progress;
        self
    }

    pub fn script(&self) -> Arc<ReplyScript> {
        self.script.clone()
    }

    pub fn fail_next_creations(&self, count: usize) {
        self.pending_failures.store(count, Ordering::Release);
    }

    pub fn create_calls(&self) -> usize {
        lock(&self.created_models).len()
    }

    pub fn created_models(&self) -> Vec<String> {
        lock(&self.created_models).clone()
    }

    pub fn cache_flags(&self) -> Vec<bool> {
        lock(&self.cache_flags).clone()
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

impl EngineRuntime for ScriptedRuntime {
    fn create_session<'a>(
        &'a self,
        model_id: &'a str,
        options: SessionOptions,
    ) -> BoxFuture<'a, EngineResult<Arc<dyn EngineSession>>> {
        Box::pin(async move {
            lock(&self.created_models).push(model_id.to_string());
            lock(&self.cache_flags).push(options.cache_enabled);

            for progress in &self.progress_script {
                (options.on_init_progress)(progress.clone());
                tokio::task::yield_now().await;
            }
            // Keeps the construction in flight across at least one scheduler turn.
            tokio::task::yield_now().await;

            if self.take_failure() {
                let error: BoxError = Box::new(ScriptedFailure(format!(
                    "failed to fetch weights for {model_id}"
                )));
                return Err(error);
            }

            Ok(Arc::new(ScriptedSession {
                model_id: model_id.to_string(),
                script: self.script.clone(),
            }) as Arc<dyn EngineSession>)
        })
    }
}

pub struct ScriptedHost {
    runtime: Arc<ScriptedRuntime>,
    compute: AtomicBool,
    runtime_loads: AtomicUsize,
    pending_runtime_failures: AtomicUsize,
}

impl ScriptedHost {
    pub fn new(runtime: Arc<ScriptedRuntime>) -> Self {
        Self {
            runtime,
            compute: AtomicBool::new(true),
            runtime_loads: AtomicUsize::new(0),
            pending_runtime_failures: AtomicUsize::new(0),
        }
    }

    pub fn without_compute(self) -> Self {
        self.compute.store(false, Ordering::Release);
        self
    }

    pub fn fail_next_runtime_loads(&self, count: usize) {
        self.pending_runtime_failures
            .store(count, Ordering::Release);
    }

    pub fn runtime_loads(&self) -> usize {
        self.runtime_loads.load(Ordering::Acquire)
    }
}

impl EngineHost for ScriptedHost {
    fn name(&self) -> &str {
        "scripted"
    }

    fn has_compute(&self) -> bool {
        self.compute.load(Ordering::Acquire)
    }

    fn load_runtime(&self) -> BoxFuture<'_, EngineResult<Arc<dyn EngineRuntime>>> {
        Box::pin(async move {
            self.runtime_loads.fetch_add(1, Ordering::AcqRel);
            let failed = self
                .pending_runtime_failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                    remaining.checked_sub(1)
                })
                .is_ok();
            if failed {
                let error: BoxError = Box::new(ScriptedFailure("runtime import failed".to_string()));
                return Err(error);
            }

            Ok(self.runtime.clone() as Arc<dyn EngineRuntime>)
        })
    }
}
