//! Prompt construction for the code agent and the text classifier.

use codebot_core::thread::ThreadComment;

const RULE: &str = "================================================================================";

const NO_ATTRIBUTION: &str = "- **DO NOT include any of the following in your commit messages:**\n  \
     * \"🤖 Generated with Claude Code\" or any variation of this text\n  \
     * \"Co-Authored-By:\" trailers or any author attribution lines\n  \
     * Any text that mentions Claude Code or Claude as an author";

/// Where an inline comment is anchored in the diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentLocation {
    pub path: Option<String>,
    pub line: Option<u64>,
    pub diff_hunk: Option<String>,
}

/// Everything known about the PR when an event is handled.
#[derive(Debug, Clone, Default)]
pub struct PrContext {
    pub title: String,
    pub body: String,
    /// One `<STATUS>    <path>` line per changed file.
    pub files_changed: String,
    pub location: Option<CommentLocation>,
    /// Earlier comments of the same thread, oldest first. Excludes the
    /// comment being handled.
    pub thread: Vec<ThreadComment>,
}

impl PrContext {
    fn push_location(&self, parts: &mut Vec<String>) {
        let Some(location) = &self.location else {
            return;
        };
        let Some(path) = &location.path else {
            return;
        };
        parts.push(String::new());
        parts.push("Comment Location:".to_string());
        parts.push(format!("- File: {}", path));
        parts.push(format!(
            "- Line: {}",
            location
                .line
                .map(|l| l.to_string())
                .unwrap_or_else(|| "N/A".to_string())
        ));
        if let Some(hunk) = location.diff_hunk.as_deref().filter(|h| !h.is_empty()) {
            parts.push(String::new());
            parts.push("Code Being Reviewed:".to_string());
            parts.push("```".to_string());
            parts.push(hunk.to_string());
            parts.push("```".to_string());
        }
    }

    fn push_thread(&self, parts: &mut Vec<String>) {
        if self.thread.is_empty() {
            return;
        }
        parts.push(String::new());
        parts.push("Comment Thread (Previous Conversation):".to_string());
        for (i, comment) in self.thread.iter().enumerate() {
            parts.push(format!("{}. {}: {}", i + 1, comment.author, comment.body));
        }
    }

    fn preamble(&self, opening: &str) -> Vec<String> {
        let mut parts = vec![
            opening.to_string(),
            String::new(),
            "PR Context:".to_string(),
            format!("- Title: {}", or_na(&self.title)),
            format!("- Files Changed: {}", or_na(&self.files_changed)),
        ];
        self.push_location(&mut parts);
        self.push_thread(&mut parts);
        parts
    }
}

fn or_na(value: &str) -> &str {
    if value.trim().is_empty() {
        "N/A"
    } else {
        value
    }
}

/// Prompt asking for a JSON intent classification.
pub fn classification_prompt(comment: &str, context: &PrContext) -> String {
    let mut parts =
        context.preamble("You are analyzing a code review comment to determine its intent.");
    parts.push(String::new());
    parts.push("Current Review Comment:".to_string());
    parts.push(comment.to_string());
    parts.push(String::new());
    parts.join("\n")
        + r#"
Classify this comment into ONE of these categories:

1. QUERY - The reviewer is asking a question or seeking clarification about the code
   Examples: "Why did you choose this approach?", "What does this parameter do?", "How does this work?"

2. CHANGE_REQUEST - The reviewer is requesting specific code changes
   Examples: "Please add error handling", "This should use async/await", "Remove this console.log"

3. APPRECIATION - The reviewer is expressing approval, appreciation, or positive feedback (non-blocking)
   Examples: "Looks good!", "Nice work!", "Great implementation", "Approved", "LGTM"

4. NITPICK - The reviewer is making a minor suggestion or pointing out a small issue (not a blocking change request)
   Examples: "Maybe use a more descriptive variable name?", "Consider adding a comment here", "Minor: could use const instead"

5. AMBIGUOUS - The intent is unclear and needs clarification from the reviewer
   Examples: "This could be better", "Not sure about this", "Hmm..."

Respond ONLY with valid JSON in this exact format:
{
  "type": "query" | "change_request" | "appreciation" | "nitpick" | "ambiguous",
  "reasoning": "brief explanation of your classification",
  "clarification_question": "question to ask if ambiguous (only if type is ambiguous)"
}

Do not include any other text, markdown, or formatting. Only the JSON object."#
}

/// Prompt asking whether the agent agrees with a nitpick.
pub fn nitpick_prompt(comment: &str, context: &PrContext) -> String {
    let mut parts = context.preamble("You received a nitpick comment on your code review.");
    parts.push(String::new());
    parts.push("Current Nitpick Comment:".to_string());
    parts.push(comment.to_string());
    parts.push(String::new());
    parts.join("\n")
        + r#"
Analyze this nitpick and determine if you agree with it or not. Consider:
- Is the suggestion reasonable and would it improve the code?
- Do you have a valid reason for the current implementation?
- Is this a matter of preference or an actual improvement?
- Look at the actual code being reviewed to make an informed decision

Respond ONLY with valid JSON in this exact format:
{
  "agrees": true | false,
  "reasoning": "brief explanation of why you agree or disagree"
}

Do not include any other text, markdown, or formatting. Only the JSON object."#
}

/// Task handed to the code agent for a change request or a query.
pub fn task_description(comment: &str, is_change_request: bool) -> String {
    if is_change_request {
        format!(
            "Code Review Change Request:\n\n{}\n\n\
             Please make the requested changes, test them, and commit with a clear message.\n\n\
             IMPORTANT: After completing the changes, provide a CONCISE summary in this format:\n\
             ✅ [Brief statement of what was done]\n\n\
             **Changes:**\n- [Change 1]\n- [Change 2]\n\n\
             **Results:** [Brief test results]\n\n\
             Keep it short and scannable. Skip pleasantries like 'Perfect!' or 'Here's what I did'.",
            comment
        )
    } else {
        format!(
            "Code Review Query:\n\n{}\n\n\
             Please provide a clear, concise, but sufficient answer. \
             Be direct and to the point while ensuring the reviewer understands. \
             Do not make any code changes.",
            comment
        )
    }
}

/// Extra system instructions describing the review situation.
pub fn review_instructions(comment: &str, context: &PrContext, is_change_request: bool) -> String {
    let mut parts = vec![
        RULE.to_string(),
        "CODE REVIEW CONTEXT".to_string(),
        RULE.to_string(),
        String::new(),
        "You are responding to a code review comment on a pull request.".to_string(),
        String::new(),
    ];

    if !context.title.is_empty() {
        parts.push(format!("PR Title: {}", context.title));
    }
    if !context.body.is_empty() {
        parts.push("\nOriginal Task Description:".to_string());
        parts.push(context.body.clone());
    }
    if !context.files_changed.is_empty() {
        parts.push("\nFiles Changed in This PR:".to_string());
        parts.push("```".to_string());
        parts.push(context.files_changed.clone());
        parts.push("```".to_string());
    }
    context.push_location(&mut parts);

    if !context.thread.is_empty() {
        parts.push(String::new());
        parts.push(RULE.to_string());
        parts.push("COMMENT THREAD (Previous Conversation)".to_string());
        parts.push(RULE.to_string());
        for (i, earlier) in context.thread.iter().enumerate() {
            parts.push(format!("\n{}. {}:", i + 1, earlier.author));
            parts.push(earlier.body.clone());
        }
    }

    parts.extend([
        String::new(),
        RULE.to_string(),
        "CURRENT REVIEW COMMENT".to_string(),
        RULE.to_string(),
        String::new(),
        comment.to_string(),
        String::new(),
        RULE.to_string(),
        String::new(),
    ]);

    if is_change_request {
        parts.push(format!(
            "This is a CHANGE REQUEST. You should:\n\
             1. Understand what changes are being requested\n\
             2. Make the necessary code changes\n\
             3. Test the changes to ensure they work\n\
             4. Run all tests to ensure nothing is broken\n\
             5. Commit the changes with a clear message\n\n\
             **CRITICAL COMMIT MESSAGE REQUIREMENTS:**\n\
             - Your commit message should reference that this addresses a review comment\n\
             {}\n\n\
             RESPONSE FORMAT:\n\
             Provide a CONCISE, scannable summary. NO pleasantries or preambles.\n\
             Format:\n\
             ✅ [One-line summary of what was done]\n\n\
             **Changes:**\n- [Specific change 1]\n- [Specific change 2]\n\n\
             **Results:** [Brief test/verification results]",
            NO_ATTRIBUTION
        ));
    } else {
        parts.push(
            "This is a QUERY/QUESTION. You should:\n\
             1. Understand what is being asked\n\
             2. Provide a CONCISE but SUFFICIENT answer\n\
             3. Be direct and to the point\n\
             4. Reference specific code or files if relevant\n\
             5. DO NOT make any code changes\n\n\
             IMPORTANT: Keep your answer brief and focused. Avoid unnecessary elaboration.\n\
             Your response will be posted as a comment reply."
                .to_string(),
        );
    }

    parts.join("\n")
}

/// Heading that every generated PR description must keep.
pub const TASK_DESCRIPTION_HEADING: &str = "## 📋 Task Description";

/// Pull the original task text out of an existing PR description.
pub fn extract_task_description(body: &str) -> String {
    let Some(start) = body.find(TASK_DESCRIPTION_HEADING) else {
        return String::new();
    };
    let rest = &body[start + TASK_DESCRIPTION_HEADING.len()..];
    let end = rest
        .find("## 🔨 Changes Made")
        .or_else(|| rest.find("## 📁 Files Changed"))
        .unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

/// Prompt asking for a fresh PR description after new commits.
pub fn description_prompt(task: &str, files_changed: &[String]) -> String {
    let files_section = if files_changed.len() <= 5 {
        let mut section = String::from("\n\n## 📁 Files Changed\n\n");
        for file in files_changed {
            section.push_str(&format!("- `{}`\n", file));
        }
        section
    } else {
        String::new()
    };

    format!(
        "Analyze this PR and generate a concise, cohesive description of ALL changes made.\n\n\
         Original Task:\n{task}\n\n\
         Files Changed: {files}\n\n\
         Generate a PR description in this EXACT format (respond ONLY with the markdown, no preamble):\n\n\
         {heading}\n\n{task}\n\n\
         ## 🔨 Changes Made\n\n\
         [Write a cohesive summary of what was implemented. Describe the changes as ONE unified \
         implementation, not as separate commits. Focus on WHAT was built and HOW it works. \
         Be concise but complete.]{files_section}\n\n\
         ---\n\
         *This PR was automatically generated by codebot 🤖*\n\n\
         **CRITICAL REQUIREMENTS:**\n\
         - Write the \"Changes Made\" section as a unified description of the complete implementation.\n\
         {rules}",
        task = task,
        files = files_changed.join(", "),
        heading = TASK_DESCRIPTION_HEADING,
        files_section = files_section,
        rules = NO_ATTRIBUTION.replace("commit messages", "response"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn context_with_location() -> PrContext {
        PrContext {
            title: "Add retry".to_string(),
            body: "Retry failed uploads".to_string(),
            files_changed: "M    src/upload.rs".to_string(),
            location: Some(CommentLocation {
                path: Some("src/upload.rs".to_string()),
                line: Some(12),
                diff_hunk: Some("@@ -10,3 +10,4 @@".to_string()),
            }),
            thread: vec![ThreadComment {
                id: 1,
                in_reply_to: None,
                author: "alice".to_string(),
                body: "Why three retries?".to_string(),
                created_at: Utc::now(),
            }],
        }
    }

    #[test]
    fn test_classification_prompt_includes_context() {
        let prompt = classification_prompt("Please use five", &context_with_location());
        assert!(prompt.contains("- Title: Add retry"));
        assert!(prompt.contains("- File: src/upload.rs"));
        assert!(prompt.contains("- Line: 12"));
        assert!(prompt.contains("@@ -10,3 +10,4 @@"));
        assert!(prompt.contains("1. alice: Why three retries?"));
        assert!(prompt.contains("Current Review Comment:\nPlease use five"));
        assert!(prompt.contains("\"type\": \"query\" | \"change_request\""));
    }

    #[test]
    fn test_empty_context_uses_placeholders() {
        let prompt = nitpick_prompt("nit: spacing", &PrContext::default());
        assert!(prompt.contains("- Title: N/A"));
        assert!(!prompt.contains("Comment Location:"));
        assert!(!prompt.contains("Comment Thread"));
    }

    #[test]
    fn test_task_description_by_kind() {
        assert!(task_description("Rename x", true).starts_with("Code Review Change Request:"));
        assert!(task_description("Why x?", false).contains("Do not make any code changes."));
    }

    #[test]
    fn test_review_instructions_by_kind() {
        let context = context_with_location();
        let change = review_instructions("Rename x", &context, true);
        assert!(change.contains("This is a CHANGE REQUEST."));
        assert!(change.contains("COMMENT THREAD (Previous Conversation)"));

        let query = review_instructions("Why x?", &context, false);
        assert!(query.contains("This is a QUERY/QUESTION."));
        assert!(query.contains("PR Title: Add retry"));
    }

    #[test]
    fn test_extract_task_description() {
        let body = "## 📋 Task Description\n\nAdd retries\n\n## 🔨 Changes Made\n\nStuff";
        assert_eq!(extract_task_description(body), "Add retries");
        assert_eq!(extract_task_description("free text"), "");
    }
}
