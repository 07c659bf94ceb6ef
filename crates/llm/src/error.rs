use snafu::Snafu;

use super::engine::BoxError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("host '{host}' lacks the compute capability required to run a local model"))]
    UnsupportedEnvironment { stage: &'static str, host: String },
    #[snafu(display("failed to initialize model '{model_id}' on `{stage}`: {source}"))]
    Initialization {
        stage: &'static str,
        model_id: String,
        source: BoxError,
    },
    #[snafu(display(
        "model '{model_id}' failed to initialize in the load this call joined: {message}"
    ))]
    JoinedInitialization {
        stage: &'static str,
        model_id: String,
        message: String,
    },
}

impl SessionError {
    /// True when a later `load` may succeed without the host changing.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnsupportedEnvironment { .. })
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GenerationError {
    #[snafu(display("no ready model session; call load first"))]
    SessionNotReady { stage: &'static str },
    #[snafu(display("failed to open completion stream for '{model_id}': {source}"))]
    OpenStream {
        stage: &'static str,
        model_id: String,
        source: BoxError,
    },
    #[snafu(display("completion stream for '{model_id}' failed after {delivered} deltas: {source}"))]
    StreamChunk {
        stage: &'static str,
        model_id: String,
        delivered: usize,
        source: BoxError,
    },
}

pub type GenerationResult<T> = Result<T, GenerationError>;
