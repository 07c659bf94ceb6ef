#![deny(unsafe_code)]

/// Capabilities consumed from the inference engine.
pub mod engine;
pub mod error;
/// Streaming completions with cooperative cancellation.
pub mod generation;
/// Load progress normalization and display classification.
pub mod progress;
/// Model session lifecycle: load once, reuse, retry after failure.
pub mod session;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use engine::{
    BoxError, BoxFuture, ChatDelta, DeltaStream, EngineHost, EngineMessage, EngineResult,
    EngineRuntime, EngineSession, InitProgress, InitProgressCallback, ProgressValue, Role,
    SessionOptions,
};
pub use error::{GenerationError, GenerationResult, SessionError, SessionResult};
pub use generation::{GenerateRequest, GenerationController, GenerationOutcome};
pub use progress::{
    LoadPhase, LoadProgress, ProgressSink, READY_PHASE, RUNTIME_PHASE, normalize_percent,
};
pub use session::{DEFAULT_MODEL_ID, LoadRequest, MODEL_KEY, ModelSessionManager};
