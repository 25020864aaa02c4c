//! Plain-text rendering of streamed turns

use std::fmt::Write;

use coach_core::{sources_heading, CitationGroup, ConversationTurn};

/// Source list printed under an answer
///
/// ```text
/// Sources (2)
///   [1] PLC Handbook, pp. 3, 5 (80%)
///   [2] Assessment Memo (60%)
/// ```
pub fn sources(groups: &[CitationGroup]) -> String {
    if groups.is_empty() {
        return String::new();
    }

    let mut out = sources_heading(groups);
    out.push('\n');
    for (n, group) in groups.iter().enumerate() {
        let _ = write!(out, "  [{}] {}", n + 1, group.source_title);
        if let Some(pages) = group.page_label() {
            let _ = write!(out, ", {pages}");
        }
        let _ = writeln!(out, " ({}%)", group.relevance_percent());
    }
    out
}

/// One transcript line for `/history`
pub fn turn_line(turn: &ConversationTurn) -> String {
    let role = match turn.role {
        coach_core::MessageRole::User => "you",
        coach_core::MessageRole::Assistant => "coach",
        coach_core::MessageRole::System => "system",
    };
    let first_line = turn.content.lines().next().unwrap_or_default();
    format!("{role:>6}: {first_line}")
}
