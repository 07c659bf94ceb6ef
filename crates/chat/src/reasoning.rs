//! Splitting delimited reasoning ("thinking") out of assistant replies.

pub const THINK_START: &str = "<think>";
pub const THINK_END: &str = "</think>";

/// Visible reply and extracted reasoning of one assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningSplit {
    pub visible: String,
    /// Trimmed reasoning text; `None` when the segment was blank.
    pub think: Option<String>,
}

/// True when `text` contains a start marker, ignoring ASCII case.
pub fn has_reasoning_marker(text: &str) -> bool {
    text.to_ascii_lowercase().contains(THINK_START)
}

/// Extracts the first complete reasoning segment of a reply.
///
/// Markers match case-insensitively. The reasoning moves to `think`; markers and reasoning
/// leave the visible text, which is trimmed. Returns `None`, leaving the reply as it is,
/// unless a start marker is followed by an end marker.
pub fn split_reasoning(text: &str) -> Option<ReasoningSplit> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let folded = text.to_ascii_lowercase();
    let start = folded.find(THINK_START)?;
    let body_start = start + THINK_START.len();
    let body_end = body_start + folded[body_start..].find(THINK_END)?;
    let rest_start = body_end + THINK_END.len();

    let think = text[body_start..body_end].trim();
    let mut visible = String::with_capacity(start + text.len() - rest_start);
    visible.push_str(&text[..start]);
    visible.push_str(&text[rest_start..]);

    Some(ReasoningSplit {
        visible: visible.trim().to_string(),
        think: (!think.is_empty()).then(|| think.to_string()),
    })
}
