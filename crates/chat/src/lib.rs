#![deny(unsafe_code)]

pub mod message;
/// Turn-taking over a loaded model: send, stream, finalize.
pub mod orchestrator;
pub mod reasoning;
pub mod settings;
/// Observable chat phase and its transition rules.
pub mod state;
pub mod transcript;

pub use message::ChatMessage;
pub use orchestrator::{
    ChatOrchestrator, FALLBACK_REPLY, IgnoreReason, TurnOutcome, TurnStatus, normalize_input,
};
pub use reasoning::{
    ReasoningSplit, THINK_END, THINK_START, has_reasoning_marker, split_reasoning,
};
pub use settings::{ChatSettings, DEFAULT_SYSTEM_PROMPT, SettingsError, SettingsResult, SettingsStore};
pub use state::{
    ChatPhase, PREPARING_LABEL, PhaseRejection, PhaseTransition, PhaseTransitionResult,
    SessionState, progress_label,
};
pub use transcript::{MESSAGES_KEY, TranscriptStore};
