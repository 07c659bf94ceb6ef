use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use breeze_storage::{PersistentStore, PersistentStoreExt};
use snafu::{ResultExt, ensure};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

use super::engine::{EngineHost, EngineRuntime, EngineSession, SessionOptions};
use super::error::{
    InitializationSnafu, JoinedInitializationSnafu, SessionResult, UnsupportedEnvironmentSnafu,
};
use super::progress::{LoadProgress, ProgressReporter, ProgressSink, RUNTIME_PHASE};

/// Model loaded when neither the caller nor persistence names one.
pub const DEFAULT_MODEL_ID: &str = "Qwen3-4B-q4f16_1-MLC";
/// Store key holding the last model id passed to `load`.
pub const MODEL_KEY: &str = "model";

/// Arguments for [`ModelSessionManager::load`].
#[derive(Clone, Default)]
pub struct LoadRequest {
    pub model_id: Option<String>,
    pub progress: Option<ProgressSink>,
}

impl LoadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Owns the single engine session of one chat context.
///
/// Concurrent `load` calls collapse onto one initialization: the first caller builds the
/// session while later callers queue behind it. Callers that joined an attempt share its
/// outcome, the session on success and a [`crate::SessionError::JoinedInitialization`] on
/// failure. Only a `load` that starts after the failure tries again. The runtime acquired
/// along the way is kept even when session construction fails.
pub struct ModelSessionManager {
    host: Arc<dyn EngineHost>,
    store: Arc<dyn PersistentStore>,
    default_model_id: String,
    current_model_id: Mutex<String>,
    runtime: OnceCell<Arc<dyn EngineRuntime>>,
    session: OnceCell<Arc<dyn EngineSession>>,
    init_lock: AsyncMutex<()>,
    failed_attempts: AtomicU64,
    last_failure: Mutex<Option<FailedAttempt>>,
    loading: AtomicBool,
    initializations: AtomicUsize,
}

#[derive(Debug, Clone)]
struct FailedAttempt {
    model_id: String,
    message: String,
}

impl ModelSessionManager {
    pub fn new(host: Arc<dyn EngineHost>, store: Arc<dyn PersistentStore>) -> Self {
        Self::with_default_model(host, store, DEFAULT_MODEL_ID)
    }

    pub fn with_default_model(
        host: Arc<dyn EngineHost>,
        store: Arc<dyn PersistentStore>,
        default_model_id: impl Into<String>,
    ) -> Self {
        let default_model_id = default_model_id.into();
        let current_model_id = store.load_json(MODEL_KEY, default_model_id.clone());

        Self {
            host,
            store,
            default_model_id,
            current_model_id: Mutex::new(current_model_id),
            runtime: OnceCell::new(),
            session: OnceCell::new(),
            init_lock: AsyncMutex::new(()),
            failed_attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            loading: AtomicBool::new(false),
            initializations: AtomicUsize::new(0),
        }
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model_id
    }

    /// Id the next `load` without an explicit model uses.
    pub fn model_id(&self) -> String {
        self.current_model_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn ready_session(&self) -> Option<Arc<dyn EngineSession>> {
        self.session
            .get()
            .filter(|session| session.is_ready())
            .cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.ready_session().is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Number of engine constructions attempted so far, failed ones included.
    pub fn initialization_count(&self) -> usize {
        self.initializations.load(Ordering::Acquire)
    }

    pub async fn load(&self, request: LoadRequest) -> SessionResult<Arc<dyn EngineSession>> {
        let reporter = ProgressReporter::new(request.progress);

        ensure!(
            self.host.has_compute(),
            UnsupportedEnvironmentSnafu {
                stage: "load-check-compute",
                host: self.host.name().to_string(),
            }
        );

        let model_id = self.select_model(request.model_id);

        if let Some(session) = self.ready_session() {
            if session.model_id() != model_id {
                tracing::warn!(
                    loaded_model_id = %session.model_id(),
                    requested_model_id = %model_id,
                    "a model session is already loaded; reusing it"
                );
            }
            reporter.finish();
            return Ok(session);
        }

        let failures_seen = self.failed_attempts.load(Ordering::Acquire);
        let _init = self.init_lock.lock().await;

        if let Some(session) = self.session.get() {
            reporter.finish();
            return Ok(session.clone());
        }

        if self.failed_attempts.load(Ordering::Acquire) != failures_seen {
            let failure = self.last_failure().clone().unwrap_or_else(|| FailedAttempt {
                model_id: model_id.clone(),
                message: "initialization failed".to_string(),
            });
            return JoinedInitializationSnafu {
                stage: "load-join-in-flight",
                model_id: failure.model_id,
                message: failure.message,
            }
            .fail();
        }

        match self.initialize(&model_id, &reporter).await {
            Ok(session) => {
                let session = self.session.get_or_init(|| async { session }).await.clone();
                *self.last_failure() = None;
                reporter.finish();
                Ok(session)
            }
            Err(error) => {
                *self.last_failure() = Some(FailedAttempt {
                    model_id: model_id.clone(),
                    message: error.to_string(),
                });
                self.failed_attempts.fetch_add(1, Ordering::AcqRel);
                Err(error)
            }
        }
    }

    fn last_failure(&self) -> MutexGuard<'_, Option<FailedAttempt>> {
        self.last_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select_model(&self, requested: Option<String>) -> String {
        let model_id = requested
            .map(|model_id| model_id.trim().to_string())
            .filter(|model_id| !model_id.is_empty())
            .unwrap_or_else(|| self.model_id());

        *self
            .current_model_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = model_id.clone();
        self.store.save_json(MODEL_KEY, &model_id);
        model_id
    }

    async fn initialize(
        &self,
        model_id: &str,
        reporter: &ProgressReporter,
    ) -> SessionResult<Arc<dyn EngineSession>> {
        self.loading.store(true, Ordering::Release);
        let _loading = LoadingFlag(&self.loading);

        let runtime = self
            .runtime
            .get_or_try_init(|| async {
                reporter.report(LoadProgress::new(0, Some(RUNTIME_PHASE)));
                tracing::info!(host = %self.host.name(), "acquiring inference runtime");
                self.host.load_runtime().await.context(InitializationSnafu {
                    stage: "load-acquire-runtime",
                    model_id: model_id.to_string(),
                })
            })
            .await?
            .clone();

        self.initializations.fetch_add(1, Ordering::AcqRel);
        tracing::info!(model_id = %model_id, "initializing model session");

        let options = SessionOptions {
            cache_enabled: true,
            on_init_progress: reporter.engine_callback(),
        };

        match runtime.create_session(model_id, options).await {
            Ok(session) => {
                tracing::info!(model_id = %model_id, "model session ready");
                Ok(session)
            }
            Err(source) => {
                tracing::error!(
                    model_id = %model_id,
                    error = %source,
                    "model session initialization failed"
                );
                Err(source).context(InitializationSnafu {
                    stage: "load-create-session",
                    model_id: model_id.to_string(),
                })
            }
        }
    }
}

struct LoadingFlag<'a>(&'a AtomicBool);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use breeze_storage::{DEFAULT_NAMESPACE, MemoryStore, PersistentStore};
    use serde_json::json;

    use super::*;
    use crate::engine::InitProgress;
    use crate::error::SessionError;
    use crate::testing::{ScriptedHost, ScriptedRuntime};

    fn recording_sink() -> (ProgressSink, Arc<StdMutex<Vec<LoadProgress>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let captured = events.clone();
        let sink: ProgressSink = Arc::new(move |progress: &LoadProgress| {
            captured
                .lock()
                .expect("events lock should not be poisoned")
                .push(progress.clone());
        });
        (sink, events)
    }

    fn manager_with(runtime: Arc<ScriptedRuntime>) -> (ModelSessionManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(DEFAULT_NAMESPACE));
        let host = Arc::new(ScriptedHost::new(runtime));
        (ModelSessionManager::new(host, store.clone()), store)
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_initialization() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _store) = manager_with(runtime.clone());
        let (first_sink, first_events) = recording_sink();
        let (second_sink, second_events) = recording_sink();

        let (first, second) = tokio::join!(
            manager.load(LoadRequest::new().with_progress(first_sink)),
            manager.load(LoadRequest::new().with_progress(second_sink)),
        );

        let first = first.expect("first load should succeed");
        let second = second.expect("second load should succeed");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runtime.create_calls(), 1);
        assert_eq!(manager.initialization_count(), 1);
        assert!(manager.is_ready());
        assert!(!manager.is_loading());

        for events in [first_events, second_events] {
            let events = events.lock().expect("events lock should not be poisoned");
            assert_eq!(events.last(), Some(&LoadProgress::ready()));
        }
    }

    #[tokio::test]
    async fn ready_fast_path_reports_100_and_skips_initialization() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _store) = manager_with(runtime.clone());
        manager
            .load(LoadRequest::new())
            .await
            .expect("initial load should succeed");

        let (sink, events) = recording_sink();
        manager
            .load(LoadRequest::new().with_progress(sink))
            .await
            .expect("second load should succeed");

        assert_eq!(runtime.create_calls(), 1);
        let events = events.lock().expect("events lock should not be poisoned");
        assert_eq!(events.as_slice(), &[LoadProgress::ready()]);
    }

    #[tokio::test]
    async fn cold_load_progress_is_monotonic_and_terminates_at_100() {
        let runtime = Arc::new(ScriptedRuntime::new().with_progress_script(vec![
            InitProgress::fraction(0.25, Some("Fetching param cache[1/4]")),
            InitProgress::fraction(0.10, Some("Fetching param cache[2/4]")),
            InitProgress::percent(75, Some("Compile shaders")),
        ]));
        let (manager, _store) = manager_with(runtime);
        let (sink, events) = recording_sink();

        manager
            .load(LoadRequest::new().with_progress(sink))
            .await
            .expect("load should succeed");

        let events = events.lock().expect("events lock should not be poisoned");
        let percents = events.iter().map(|event| event.percent).collect::<Vec<_>>();
        assert_eq!(percents, vec![0, 25, 25, 75, 100]);
        assert_eq!(events[0].phase.as_deref(), Some(RUNTIME_PHASE));
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(events.last(), Some(&LoadProgress::ready()));
    }

    #[tokio::test]
    async fn missing_compute_fails_before_any_work() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let store = Arc::new(MemoryStore::new(DEFAULT_NAMESPACE));
        let host = Arc::new(ScriptedHost::new(runtime.clone()).without_compute());
        let manager = ModelSessionManager::new(host.clone(), store.clone());

        let error = match manager.load(LoadRequest::new()).await {
            Ok(_) => panic!("load should fail without compute"),
            Err(error) => error,
        };

        assert!(matches!(error, SessionError::UnsupportedEnvironment { .. }));
        assert!(!error.is_retryable());
        assert_eq!(host.runtime_loads(), 0);
        assert_eq!(runtime.create_calls(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_initialization_is_not_cached() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.fail_next_creations(1);
        let store = Arc::new(MemoryStore::new(DEFAULT_NAMESPACE));
        let host = Arc::new(ScriptedHost::new(runtime.clone()));
        let manager = ModelSessionManager::new(host.clone(), store);

        let error = match manager.load(LoadRequest::new()).await {
            Ok(_) => panic!("first load should fail"),
            Err(error) => error,
        };
        assert!(matches!(error, SessionError::Initialization { .. }));
        assert!(error.is_retryable());
        assert!(!manager.is_ready());
        assert!(!manager.is_loading());

        manager
            .load(LoadRequest::new())
            .await
            .expect("retry should succeed");

        assert_eq!(runtime.create_calls(), 2);
        assert_eq!(host.runtime_loads(), 1);
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn concurrent_loads_share_a_failed_initialization() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.fail_next_creations(1);
        let (manager, _store) = manager_with(runtime.clone());

        let (first, second) = tokio::join!(
            manager.load(LoadRequest::new()),
            manager.load(LoadRequest::new()),
        );

        assert!(matches!(first, Err(SessionError::Initialization { .. })));
        let Err(joined) = second else {
            panic!("joined load should share the failure");
        };
        assert!(matches!(
            &joined,
            SessionError::JoinedInitialization { model_id, message, .. }
                if model_id == DEFAULT_MODEL_ID && message.contains("failed to fetch weights")
        ));
        assert!(joined.is_retryable());
        assert_eq!(runtime.create_calls(), 1);
        assert!(!manager.is_ready());

        manager
            .load(LoadRequest::new())
            .await
            .expect("a later load should retry");
        assert_eq!(runtime.create_calls(), 2);
    }

    #[tokio::test]
    async fn runtime_acquisition_failure_is_an_initialization_error() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let store = Arc::new(MemoryStore::new(DEFAULT_NAMESPACE));
        let host = Arc::new(ScriptedHost::new(runtime.clone()));
        host.fail_next_runtime_loads(1);
        let manager = ModelSessionManager::new(host.clone(), store);

        let error = match manager.load(LoadRequest::new()).await {
            Ok(_) => panic!("load should fail"),
            Err(error) => error,
        };

        assert!(matches!(
            error,
            SessionError::Initialization {
                stage: "load-acquire-runtime",
                ..
            }
        ));
        assert_eq!(runtime.create_calls(), 0);

        manager
            .load(LoadRequest::new())
            .await
            .expect("retry should acquire the runtime");
        assert_eq!(host.runtime_loads(), 2);
    }

    #[tokio::test]
    async fn selected_model_is_persisted_and_reused() {
        let store = Arc::new(MemoryStore::new(DEFAULT_NAMESPACE));
        let first = ModelSessionManager::new(
            Arc::new(ScriptedHost::new(Arc::new(ScriptedRuntime::new()))),
            store.clone(),
        );
        assert_eq!(first.model_id(), DEFAULT_MODEL_ID);

        let session = first
            .load(LoadRequest::new().with_model_id("Llama-3.2-1B-Instruct-q4f16_1-MLC"))
            .await
            .expect("load should succeed");
        assert_eq!(session.model_id(), "Llama-3.2-1B-Instruct-q4f16_1-MLC");
        assert_eq!(
            store.load(MODEL_KEY, json!(null)),
            json!("Llama-3.2-1B-Instruct-q4f16_1-MLC")
        );

        let runtime = Arc::new(ScriptedRuntime::new());
        let second = ModelSessionManager::new(
            Arc::new(ScriptedHost::new(runtime.clone())),
            store.clone(),
        );
        let session = second
            .load(LoadRequest::new())
            .await
            .expect("load should succeed");
        assert_eq!(session.model_id(), "Llama-3.2-1B-Instruct-q4f16_1-MLC");
        assert_eq!(runtime.created_models(), vec!["Llama-3.2-1B-Instruct-q4f16_1-MLC"]);
    }

    #[tokio::test]
    async fn engine_receives_cache_enabled_options() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _store) = manager_with(runtime.clone());

        manager
            .load(LoadRequest::new())
            .await
            .expect("load should succeed");

        assert_eq!(runtime.cache_flags(), vec![true]);
    }
}
