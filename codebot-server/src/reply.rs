//! Canned reviewer-facing reply texts.

use crate::classifier::NitpickAnalysis;

pub const APPRECIATION_REPLY: &str = "Thank you! 🙏";

pub const ERROR_REPLY: &str = "❌ I encountered an error while processing this comment.\n\nPlease try again or contact the maintainers.";

pub const NO_CHANGES_REPLY: &str =
    "ℹ️ I've reviewed this comment. No code changes were necessary.";

pub const QUERY_FALLBACK_REPLY: &str = "Thank you for the question. I've reviewed this.";

pub const NITPICK_FALLBACK_REPLY: &str =
    "Thanks for the feedback! I'll consider this for future improvements.";

const GENERATED_MARKER: &str = "🤖 Generated with Claude Code";
const CO_AUTHOR_PREFIX: &str = "Co-Authored-By:";

pub fn clarification(question: &str) -> String {
    format!(
        "🤔 {}\n\nPlease clarify if you'd like me to:\n- **Answer a question** about the code\n- **Make specific changes** to the code",
        question
    )
}

pub fn nitpick(analysis: Option<&NitpickAnalysis>) -> String {
    match analysis {
        Some(a) if a.agrees => format!(
            "I agree with this suggestion! {}\n\nWould you like me to go ahead and make this change?",
            a.reasoning
        ),
        Some(a) => format!(
            "Thanks for the suggestion! {}\n\nI think the current implementation works well here, but I'm happy to discuss further if you'd like.",
            a.reasoning
        ),
        None => NITPICK_FALLBACK_REPLY.to_string(),
    }
}

/// Summary posted when a change was pushed but the agent produced no text.
pub fn commit_summary(hash: &str, message: &str) -> String {
    let short = hash.get(..7).unwrap_or(hash);
    format!(
        "✅ Changes have been made to address this review comment.\n\n**Commit:** {}\n**Message:** {}",
        short, message
    )
}

/// Pick the agent's own words when it produced any, else `fallback`.
pub fn agent_text_or(response: Option<String>, fallback: impl FnOnce() -> String) -> String {
    match response {
        Some(text) if !text.trim().is_empty() => text,
        _ => fallback(),
    }
}

/// Drop tool attribution lines from a generated PR description.
pub fn clean_description(text: &str) -> String {
    text.lines()
        .filter(|line| {
            !line.contains(GENERATED_MARKER) && !line.trim_start().starts_with(CO_AUTHOR_PREFIX)
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
