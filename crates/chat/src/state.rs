use std::fmt;

use breeze_llm::{LoadProgress, READY_PHASE};
use breeze_storage::MessageId;

/// Label shown from the start of a load until the first progress event.
pub const PREPARING_LABEL: &str = "Preparing model...";

/// Turn-taking phase of one chat context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChatPhase {
    #[default]
    Idle,
    AwaitingModel,
    Ready,
    Generating,
    /// The last load failed; input stays disabled until a later load succeeds.
    Failed,
}

impl ChatPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingModel => "awaiting-model",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChatPhase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// State transition input for the chat phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    BeginLoad,
    LoadSucceeded,
    LoadFailed,
    BeginTurn,
    FinishTurn,
    Stop,
}

/// Rejection reason for illegal phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyLoading,
    AlreadyLoaded,
    NoLoadInProgress(ChatPhase),
    AlreadyGenerating,
    NotReady(ChatPhase),
    NoActiveTurn(ChatPhase),
}

pub type PhaseTransitionResult = Result<ChatPhase, PhaseRejection>;

impl ChatPhase {
    /// Applies one transition deterministically.
    ///
    /// `LoadSucceeded` is accepted while `Failed` so a retried load that outlives an earlier
    /// failure report can still enable input. `FinishTurn` is accepted while `Ready`
    /// because `Stop` re-enables input before the turn finishes.
    pub fn apply(self, transition: PhaseTransition) -> PhaseTransitionResult {
        match transition {
            PhaseTransition::BeginLoad => match self {
                Self::Idle | Self::Failed => Ok(Self::AwaitingModel),
                Self::AwaitingModel => Err(PhaseRejection::AlreadyLoading),
                Self::Ready | Self::Generating => Err(PhaseRejection::AlreadyLoaded),
            },
            PhaseTransition::LoadSucceeded => match self {
                Self::AwaitingModel | Self::Failed | Self::Ready => Ok(Self::Ready),
                Self::Idle | Self::Generating => Err(PhaseRejection::NoLoadInProgress(self)),
            },
            PhaseTransition::LoadFailed => match self {
                Self::AwaitingModel => Ok(Self::Failed),
                Self::Idle | Self::Ready | Self::Generating | Self::Failed => {
                    Err(PhaseRejection::NoLoadInProgress(self))
                }
            },
            PhaseTransition::BeginTurn => match self {
                Self::Ready => Ok(Self::Generating),
                Self::Generating => Err(PhaseRejection::AlreadyGenerating),
                Self::Idle | Self::AwaitingModel | Self::Failed => {
                    Err(PhaseRejection::NotReady(self))
                }
            },
            PhaseTransition::FinishTurn => match self {
                Self::Generating | Self::Ready => Ok(Self::Ready),
                Self::Idle | Self::AwaitingModel | Self::Failed => {
                    Err(PhaseRejection::NoActiveTurn(self))
                }
            },
            PhaseTransition::Stop => match self {
                Self::Generating => Ok(Self::Ready),
                Self::Idle | Self::AwaitingModel | Self::Ready | Self::Failed => {
                    Err(PhaseRejection::NoActiveTurn(self))
                }
            },
        }
    }
}

/// Observable state of one chat context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub phase: ChatPhase,
    pub generating: bool,
    pub model_ready: bool,
    /// Load progress, `0..=100`, non-decreasing within one load.
    pub progress: u8,
    pub progress_label: String,
    /// Message of the last failed load, cleared by the next successful one.
    pub error: Option<String>,
    /// Assistant placeholder the in-flight turn streams into.
    pub streaming_message_id: Option<MessageId>,
}

impl SessionState {
    pub fn accepts_input(&self) -> bool {
        self.phase == ChatPhase::Ready
    }

    /// Applies `transition` and refreshes the derived flags.
    pub fn apply(&mut self, transition: PhaseTransition) -> Result<(), PhaseRejection> {
        self.phase = self.phase.apply(transition)?;
        self.generating = self.phase == ChatPhase::Generating;
        self.model_ready = matches!(self.phase, ChatPhase::Ready | ChatPhase::Generating);
        Ok(())
    }

    pub(crate) fn begin_load(&mut self) {
        self.progress = 0;
        self.progress_label = PREPARING_LABEL.to_string();
    }

    /// Records one load progress event. Ignored outside a load.
    pub(crate) fn record_progress(&mut self, progress: &LoadProgress) -> bool {
        if self.phase != ChatPhase::AwaitingModel {
            return false;
        }

        self.progress = self.progress.max(progress.percent);
        self.progress_label = progress_label(progress);
        true
    }

    pub(crate) fn finish_load(&mut self) {
        self.progress = 100;
        self.progress_label = READY_PHASE.to_string();
        self.error = None;
    }
}

/// Display label for a load progress event.
pub fn progress_label(progress: &LoadProgress) -> String {
    if progress.is_complete() {
        READY_PHASE.to_string()
    } else {
        progress.label()
    }
}
