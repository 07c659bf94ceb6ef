use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type EngineResult<T> = Result<T, BoxError>;

/// Ordered deltas produced by one streaming completion.
pub type DeltaStream = BoxStream<'static, EngineResult<ChatDelta>>;

/// Receives raw initialization progress from the engine while a session is built.
pub type InitProgressCallback = Arc<dyn Fn(InitProgress) + Send + Sync>;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One `{role, content}` entry of a chat completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMessage {
    pub role: Role,
    pub content: String,
}

impl EngineMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One streamed chunk; `text` may be empty for role-only or bookkeeping chunks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatDelta {
    pub text: String,
}

impl ChatDelta {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Progress value as engines report it: sometimes a 0..=1 fraction, sometimes a percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressValue {
    Fraction(f64),
    Percent(u32),
}

/// Raw initialization progress with an optional free-text phase (`"Fetching param cache[3/40]"`).
#[derive(Debug, Clone, PartialEq)]
pub struct InitProgress {
    pub value: ProgressValue,
    pub phase: Option<String>,
}

impl InitProgress {
    pub fn fraction(value: f64, phase: Option<&str>) -> Self {
        Self {
            value: ProgressValue::Fraction(value),
            phase: phase.map(str::to_string),
        }
    }

    pub fn percent(value: u32, phase: Option<&str>) -> Self {
        Self {
            value: ProgressValue::Percent(value),
            phase: phase.map(str::to_string),
        }
    }
}

/// Options forwarded to [`EngineRuntime::create_session`].
#[derive(Clone)]
pub struct SessionOptions {
    /// Reuse previously downloaded/compiled artifacts across process starts.
    pub cache_enabled: bool,
    pub on_init_progress: InitProgressCallback,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SessionOptions")
            .field("cache_enabled", &self.cache_enabled)
            .finish_non_exhaustive()
    }
}

/// The machine the engine runs on: compute check plus one-time runtime acquisition.
pub trait EngineHost: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the low-level GPU/compute capability the engine needs is present.
    fn has_compute(&self) -> bool;

    fn load_runtime(&self) -> BoxFuture<'_, EngineResult<Arc<dyn EngineRuntime>>>;
}

/// A loaded inference runtime able to construct model sessions.
pub trait EngineRuntime: Send + Sync {
    fn create_session<'a>(
        &'a self,
        model_id: &'a str,
        options: SessionOptions,
    ) -> BoxFuture<'a, EngineResult<Arc<dyn EngineSession>>>;
}

/// A constructed model, reusable across any number of completions.
pub trait EngineSession: Send + Sync {
    fn model_id(&self) -> &str;

    fn is_ready(&self) -> bool {
        true
    }

    fn stream_chat(&self, messages: Vec<EngineMessage>) -> BoxFuture<'_, EngineResult<DeltaStream>>;
}
