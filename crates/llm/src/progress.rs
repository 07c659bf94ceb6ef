use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use super::engine::{InitProgress, InitProgressCallback, ProgressValue};

/// Phase emitted before the runtime is acquired for the first time.
pub const RUNTIME_PHASE: &str = "Loading runtime...";
/// Phase attached to the terminal 100% event of every load.
pub const READY_PHASE: &str = "Model ready";

/// Consumer-side progress callback. Events arrive in emission order.
pub type ProgressSink = Arc<dyn Fn(&LoadProgress) + Send + Sync>;

/// Normalized load progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadProgress {
    /// Always within `0..=100`.
    pub percent: u8,
    /// Engine phase text, forwarded verbatim.
    pub phase: Option<String>,
}

impl LoadProgress {
    pub fn new(percent: u8, phase: Option<&str>) -> Self {
        Self {
            percent: percent.min(100),
            phase: phase.map(str::to_string),
        }
    }

    pub fn ready() -> Self {
        Self::new(100, Some(READY_PHASE))
    }

    pub fn is_complete(&self) -> bool {
        self.percent >= 100
    }

    pub fn load_phase(&self) -> LoadPhase {
        LoadPhase::classify(self.phase.as_deref())
    }

    /// Display label such as `Downloading model... 42%`.
    pub fn label(&self) -> String {
        self.load_phase().label(self.percent)
    }
}

impl From<InitProgress> for LoadProgress {
    fn from(raw: InitProgress) -> Self {
        Self {
            percent: normalize_percent(raw.value),
            phase: raw.phase,
        }
    }
}

/// Floors fractions to whole percents; percents pass through. Both clamp into `0..=100`.
pub fn normalize_percent(value: ProgressValue) -> u8 {
    match value {
        ProgressValue::Fraction(fraction) if fraction.is_nan() => 0,
        ProgressValue::Fraction(fraction) => (fraction * 100.0).floor().clamp(0.0, 100.0) as u8,
        ProgressValue::Percent(percent) => percent.min(100) as u8,
    }
}

/// Coarse display phase derived from the engine's free-text phase label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadPhase {
    Cache,
    Download,
    Compile,
    Loading,
}

impl LoadPhase {
    pub fn classify(phase: Option<&str>) -> Self {
        let Some(phase) = phase else {
            return Self::Loading;
        };

        let phase = phase.to_ascii_lowercase();
        if phase.contains("cache") {
            Self::Cache
        } else if phase.contains("download") {
            Self::Download
        } else if phase.contains("compile") || phase.contains("build") {
            Self::Compile
        } else {
            Self::Loading
        }
    }

    pub fn label(self, percent: u8) -> String {
        format!("{self}... {percent}%")
    }
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Cache => "Loading from cache",
            Self::Download => "Downloading model",
            Self::Compile => "Compiling kernels",
            Self::Loading => "Loading model",
        };
        formatter.write_str(text)
    }
}

/// Per-load progress fan-in: clamps to a non-decreasing percent and guarantees the
/// terminal `(100, "Model ready")` event.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    sink: Option<ProgressSink>,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub(crate) fn new(sink: Option<ProgressSink>) -> Self {
        Self {
            sink,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    pub(crate) fn report(&self, progress: LoadProgress) {
        let previous = self.high_water.fetch_max(progress.percent, Ordering::AcqRel);
        let percent = previous.max(progress.percent);

        if let Some(sink) = &self.sink {
            sink(&LoadProgress {
                percent,
                phase: progress.phase,
            });
        }
    }

    pub(crate) fn finish(&self) {
        self.report(LoadProgress::ready());
    }

    pub(crate) fn engine_callback(&self) -> InitProgressCallback {
        let reporter = self.clone();
        Arc::new(move |raw: InitProgress| reporter.report(raw.into()))
    }
}
