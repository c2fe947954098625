//! Prompt text and the small parsers around it

use lazy_static::lazy_static;
use regex::Regex;

use crate::patch::remove_file_changes;
use crate::store::{Message, Project, UserType};

lazy_static! {
    static ref FOLLOW_UPS: Regex =
        Regex::new(r"(?s)<follow-ups>(.*?)</follow-ups>").expect("valid follow-ups pattern");
    static ref BULLET: Regex = Regex::new(r"(?m)^\s*-\s*(.*)$").expect("valid bullet pattern");
    static ref BACKEND_DOC: Regex =
        Regex::new(r"(?s)BACKEND DOC:(.*?)(```|$)").expect("valid backend doc pattern");
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]+").expect("valid punctuation pattern");
}

/// Follow-up suggestions only look at the tail of the transcript
pub const FOLLOW_UP_CONTEXT_CHARS: usize = 10_000;

/// Commit messages only look at the head of the patch content
pub const COMMIT_CONTEXT_CHARS: usize = 100_000;

pub const DEFAULT_COMMIT_MESSAGE: &str = "Updated project files";

pub const PLAN_SUFFIX: &str = "Provide the plan in the correct format only.";

pub const DOC_HANDOFF_INSTRUCTIONS: &str =
    "PHASE 1: Produce BACKEND code. Include 'BACKEND DOC:' in your final message describing new endpoints.";

/// Project/stack context shared by every prompt of a turn
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub project_text: String,
    pub user_text: String,
    pub stack_text: String,
    pub files_text: String,
    pub git_log_text: String,
}

pub fn user_style(user_type: UserType) -> &'static str {
    match user_type {
        UserType::WebDesigner => {
            "User Type: Web Designer\n\
             Experience: Familiar with web design concepts and basic HTML/CSS\n\
             Communication Style: Use design and UI/UX terminology. Explain technical concepts in terms of visual and user experience impact.\n\
             Code Explanations: Focus on how changes affect the look and feel. Provide context for any backend changes."
        }
        UserType::LearningToCode => {
            "User Type: Learning to Code\n\
             Experience: Basic programming knowledge, learning fundamentals\n\
             Communication Style: Break down complex concepts. Use simple terms and provide explanations for technical decisions.\n\
             Code Explanations: Include brief comments explaining what each major code block does. Point out patterns and best practices."
        }
        UserType::ExpertDeveloper => {
            "User Type: Expert Developer\n\
             Experience: Proficient in full-stack development\n\
             Communication Style: Use technical terminology freely. Focus on architecture and implementation details.\n\
             Code Explanations: Can skip basic explanations. Highlight advanced patterns and potential edge cases."
        }
    }
}

pub fn project_text(project: &Project, sandbox_ready: bool) -> String {
    format!(
        "Name: {}\nSandbox Status: {}\nCustom Instructions: {}",
        project.name,
        if sandbox_ready { "Ready" } else { "Booting..." },
        project.custom_instructions.as_deref().unwrap_or("None")
    )
}

pub fn files_text(file_paths: Option<&[String]>) -> String {
    match file_paths {
        Some(paths) => paths.join("\n"),
        None => "(still booting)".to_string(),
    }
}

/// `hash|message|author|...` lines become `hash: message`
pub fn git_log_text(git_log: Option<&str>) -> String {
    let Some(raw) = git_log.filter(|log| !log.trim().is_empty()) else {
        return "Sandbox is still booting...".to_string();
    };
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split('|');
            match (parts.next(), parts.next()) {
                (Some(hash), Some(message)) => Some(format!("{}: {}", hash, message)),
                _ => None,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn plan_system_prompt(ctx: &PromptContext) -> String {
    format!(
        r#"You are a full-stack expert developer on the platform Spark Stack. You are given a project and a sandbox to develop in and are helping PLAN the next steps. You do not write code and only provide advice as a Senior Engineer.

They will be able to edit files, run arbitrary commands in the sandbox, and navigate the user's browser.

<project>
{project}
</project>

<user>
{user}
</user>

<stack>
{stack}
</stack>

<project-files>
{files}
</project-files>

<git-log>
{git_log}
</git-log>

Answer the following questions:
1. What is being asked by the most recent message?
1a. Is this a general question, command to build something, etc.?
2. Which files are relevant to the question or would be needed to perform the request?
2a. What page should the user be navigated to to see/verify the change? (e.g. /settings)
2b. If there's weird behavior, what files should we cat to double check?
3. What commands might you need to run?
3a. Packages needed?
4. For EACH stack-specific tip, what to keep in mind or how does it adjust your plan?
5. Sequence of steps to do it? (tools/commands -> generate files -> conclusion)
6. Verify your plan with respect to the user's knowledge level.
7. Output in markdown with h3 headings, no code blocks, just ADVICE ONLY."#,
        project = ctx.project_text,
        user = ctx.user_text,
        stack = ctx.stack_text,
        files = ctx.files_text,
        git_log = ctx.git_log_text,
    )
}

/// The planner's single user message: prose-only transcript plus instructions
pub fn plan_user_prompt(transcript: &[Message], extra_instructions: &str) -> String {
    let conversation = transcript
        .iter()
        .map(|m| format!("<msg>{}</msg>", remove_file_changes(&m.content)))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{}\n\n{}\n\n{}", conversation, extra_instructions, PLAN_SUFFIX)
}

pub fn exec_system_prompt(ctx: &PromptContext) -> String {
    format!(
        r#"You are a full-stack expert developer on the platform Spark Stack. You are given a <project> and a <stack> sandbox to develop in and a <plan> from a senior engineer.

<commands>
You can run shell commands in the sandbox.
- e.g. `npm install`, `cat`, `ls`, `git`, etc.
- DO NOT USE it to modify files (like `vim`, `nano`, `touch`).
</commands>

<formatting-instructions>
Respond in plain markdown. Use special codeblocks to update files:
  - The first line: `// /path/to/file.ext`
  - Then `// ... existing code ...`
  - Then your changes, etc.
No indentation for the ``` lines. That's your entire code update block.

The system will automatically apply diffs after the final response, then commit the changes with git.
</formatting-instructions>

<project>
{project}
</project>

<user>
{user}
</user>

<stack>
{stack}
</stack>

<tips>
- Use the `simple-code-block-template` style for file modifications.
- No need to show `npm run dev`.
- The user can see changes in a preview window.
</tips>

Follow the <plan>."#,
        project = ctx.project_text,
        user = ctx.user_text,
        stack = ctx.stack_text,
    )
}

/// Context block appended to the last user message of the EXECUTE prompt
pub fn exec_trailer(files_text: &str, plan: &str) -> String {
    format!(
        "---\n<project-files>\n{}\n</project-files>\n<plan>\n{}\n</plan>\n---",
        files_text, plan
    )
}

pub fn follow_up_system_prompt(ctx: &PromptContext) -> String {
    format!(
        r#"You are a full-stack developer helping someone build a webapp.

You are given a conversation between the user and the assistant for building <project> on <stack>.

Your job is to suggest 3 follow up prompts the user might ask next.

<output-format>
<follow-ups>
- ...prompt...
- ...prompt...
- ...prompt...
</follow-ups>
</output-format>

<example>
<follow-ups>
- Add a settings page
- Improve the styling of the homepage
- Add more dummy content
</follow-ups>
</example>

<tips>
- Keep them short, <10 words, related to user's conversation.
- Do not propose devops or unrelated tasks.
- Plain text only, in <follow-ups> tags.
</tips>

<project>
{project}
</project>

<stack>
{stack}
</stack>

Respond with <follow-ups> tags only."#,
        project = ctx.project_text,
        stack = ctx.stack_text,
    )
}

/// Role-tagged, prose-only transcript, cut to its last `FOLLOW_UP_CONTEXT_CHARS`
pub fn follow_up_user_prompt(transcript: &[Message]) -> String {
    let conversation = transcript
        .iter()
        .map(|m| {
            let role = m.role.as_str();
            format!("<{}>{}</{}>", role, remove_file_changes(&m.content), role)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    tail_chars(&conversation, FOLLOW_UP_CONTEXT_CHARS).to_string()
}

pub fn parse_follow_ups(content: &str) -> Vec<String> {
    let Some(block) = FOLLOW_UPS.captures(content).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    BULLET
        .captures_iter(block.as_str())
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

pub const COMMIT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant that writes commit messages for git.

Given the following changes, write a commit message for the changes.

- Respond only with the commit message.
- Do not use quotes or special characters.
- Do not use markdown formatting, newlines, or other formatting.
- Start with a verb, e.g. "Fixed", "Added", "Updated", etc."#;

pub fn commit_user_prompt(total_content: &str) -> &str {
    head_chars(total_content, COMMIT_CONTEXT_CHARS)
}

/// Strip punctuation and collapse whitespace; empty becomes the default message
pub fn clean_commit_message(raw: &str) -> String {
    let cleaned = NON_WORD.replace_all(raw, "");
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        DEFAULT_COMMIT_MESSAGE.to_string()
    } else {
        collapsed
    }
}

/// Text after a `BACKEND DOC:` marker, up to the next code fence or the end
pub fn extract_backend_doc(response: &str) -> Option<String> {
    BACKEND_DOC
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|doc| !doc.is_empty())
}

fn head_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Role, UserProfile};
    use chrono::Utc;

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: 1,
            chat_id: 1,
            role,
            content: content.to_string(),
            images: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_git_log_formatting() {
        let raw = "a1b2c3|Add settings page|dev|2024-01-01\n\nd4e5f6|Initial commit|dev\nmalformed\n";
        assert_eq!(
            git_log_text(Some(raw)),
            "a1b2c3: Add settings page\nd4e5f6: Initial commit"
        );
        assert_eq!(git_log_text(None), "Sandbox is still booting...");
        assert_eq!(git_log_text(Some("  ")), "Sandbox is still booting...");
    }

    #[test]
    fn test_planner_never_sees_file_blocks() {
        let transcript = vec![
            message(Role::User, "Add a footer"),
            message(
                Role::Assistant,
                "Sure.\n```tsx\n// /app/footer.tsx\nexport const Footer = () => null;\n```\nAdded.",
            ),
        ];
        let prompt = plan_user_prompt(&transcript, "");
        assert!(prompt.contains("<msg>Add a footer</msg>"));
        assert!(!prompt.contains("export const Footer"));
        assert!(prompt.ends_with(PLAN_SUFFIX));
    }

    #[test]
    fn test_parse_follow_ups() {
        let content = "Sure!\n<follow-ups>\n- Add a settings page\n-   Dark mode \n- \n</follow-ups>";
        assert_eq!(parse_follow_ups(content), vec!["Add a settings page", "Dark mode"]);
        assert!(parse_follow_ups("no tags here").is_empty());
    }

    #[test]
    fn test_follow_up_prompt_keeps_the_tail() {
        let long = "x".repeat(FOLLOW_UP_CONTEXT_CHARS * 2);
        let transcript = vec![message(Role::User, "first"), message(Role::Assistant, &long)];
        let prompt = follow_up_user_prompt(&transcript);
        assert_eq!(prompt.chars().count(), FOLLOW_UP_CONTEXT_CHARS);
        assert!(prompt.ends_with("</assistant>"));
    }

    #[test]
    fn test_commit_message_cleanup() {
        assert_eq!(clean_commit_message("\"Added settings page!\"\n"), "Added settings page");
        assert_eq!(clean_commit_message("..."), DEFAULT_COMMIT_MESSAGE);
    }

    #[test]
    fn test_backend_doc_extraction() {
        let response = "Done.\nBACKEND DOC: GET /api/settings returns the settings.\n```ts\n// x\n```";
        assert_eq!(
            extract_backend_doc(response).as_deref(),
            Some("GET /api/settings returns the settings.")
        );
        assert_eq!(
            extract_backend_doc("BACKEND DOC: POST /api/items").as_deref(),
            Some("POST /api/items")
        );
        assert!(extract_backend_doc("no marker").is_none());
    }

    #[test]
    fn test_project_text_and_styles() {
        let project = Project {
            id: 1,
            name: "Astro".into(),
            custom_instructions: None,
            owner: UserProfile::default(),
            services: vec![],
        };
        assert_eq!(
            project_text(&project, false),
            "Name: Astro\nSandbox Status: Booting...\nCustom Instructions: None"
        );
        assert!(user_style(UserType::ExpertDeveloper).starts_with("User Type: Expert Developer"));
        assert_eq!(files_text(None), "(still booting)");
    }
}
