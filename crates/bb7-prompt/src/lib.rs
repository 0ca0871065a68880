//! Prompt assembler: builds the single structured user message (and the
//! system message carrying the system prompt) sent to the LLM transport.
//! Every entry point here is a pure function of its inputs — no disk or
//! network access — so the same `(config-derived system prompt, chat
//! history, context contents, latest turn)` always yields the same text,
//! keeping the prompt prefix stable across turns for provider-side caches.

use bb7_core::{ChatMessage, Part};
use serde_json::Value;

/// A context entry's content, already read from disk by the caller (the
/// coordinator), so this crate never touches the filesystem.
#[derive(Debug, Clone)]
pub struct ContextFileContent {
    pub path: String,
    pub file_id: String,
    pub readonly: bool,
    pub range: Option<(u32, u32)>,
    pub content: String,
}

impl ContextFileContent {
    fn is_section(&self) -> bool {
        self.range.is_some()
    }
}

/// A failed tool call from a previous turn, injected as `@retry_context`
/// when auto-retry is disabled. Never persisted to `chat.json`.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub tool_call: Value,
    pub error_message: String,
}

pub struct PromptInput<'a> {
    pub system_prompt: &'a str,
    /// Messages preceding the turn being assembled, in chat order.
    pub history: &'a [ChatMessage],
    /// The active chat's current context entries with content attached.
    pub context_files: &'a [ContextFileContent],
    /// Paths that currently have a pending (uncommitted-to-context) output.
    pub pending_outputs: &'a [String],
    pub latest_user_text: &'a str,
    pub retry_context: Option<&'a RetryContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
}

fn header_for(entry: &ContextFileContent) -> String {
    let mut header = format!("path={} file_id={}", entry.path, entry.file_id);
    if let Some((start, end)) = entry.range {
        header.push_str(&format!(" lines={start}-{end}"));
    }
    header
}

fn render_file_block(entry: &ContextFileContent) -> String {
    format!(
        "@file {}\n{}\n@end file",
        header_for(entry),
        entry.content.trim_end_matches('\n')
    )
}

fn render_readonly_block(context_files: &[ContextFileContent]) -> String {
    let mut entries: Vec<&ContextFileContent> = context_files.iter().filter(|e| e.readonly).collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.range.cmp(&b.range)));
    let mut out = String::from("@readonly");
    for entry in entries {
        out.push('\n');
        out.push_str(&render_file_block(entry));
    }
    out.push_str("\n@end readonly");
    out
}

fn render_writable_block(context_files: &[ContextFileContent]) -> String {
    let mut entries: Vec<&ContextFileContent> = context_files
        .iter()
        .filter(|e| !e.readonly && !e.is_section())
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    let mut out = String::from("@writable");
    for entry in entries {
        out.push('\n');
        out.push_str(&render_file_block(entry));
    }
    out.push_str("\n@end writable");
    out
}

fn render_context_event(part: &Part) -> Option<String> {
    match part {
        Part::ContextEvent { action, path, version, .. } => {
            let mut line = format!("{action:?} {path}");
            if let Some(v) = version {
                line.push(' ');
                line.push_str(v);
            }
            Some(line)
        }
        _ => None,
    }
}

fn render_message_body(message: &ChatMessage) -> String {
    let mut lines = Vec::new();
    for part in message.parts() {
        match part {
            Part::Text { text } | Part::Thinking { text } => {
                if !text.is_empty() {
                    lines.push(text.clone());
                }
            }
            Part::Code { lang, text } => lines.push(format!("```{lang}\n{text}\n```")),
            Part::File { path } => lines.push(format!("[file: {path}]")),
            Part::ContextEvent { .. } => {
                if let Some(line) = render_context_event(part) {
                    lines.push(line);
                }
            }
            Part::Raw { .. } => {}
        }
    }
    lines.join("\n")
}

fn role_label(message: &ChatMessage) -> &'static str {
    match message {
        ChatMessage::User { .. } => "user",
        ChatMessage::Assistant { .. } => "assistant",
        ChatMessage::System { .. } => "system",
    }
}

fn render_history_block(history: &[ChatMessage]) -> String {
    let mut out = String::from("@history");
    for message in history {
        let body = render_message_body(message);
        if body.is_empty() {
            continue;
        }
        out.push_str(&format!("\n@{}\n{}\n@end {}", role_label(message), body, role_label(message)));
    }
    out.push_str("\n@end history");
    out
}

fn render_latest_block(input: &PromptInput) -> String {
    let mut out = String::from("@latest\n");
    out.push_str(input.latest_user_text);
    out.push_str("\n\n@context_state");

    let mut writable: Vec<&str> = input
        .context_files
        .iter()
        .filter(|e| !e.readonly && !e.is_section())
        .map(|e| e.path.as_str())
        .collect();
    writable.sort_unstable();
    out.push_str(&format!("\nwritable: {}", writable.join(", ")));

    let mut readonly: Vec<&str> = input
        .context_files
        .iter()
        .filter(|e| e.readonly)
        .map(|e| e.path.as_str())
        .collect();
    readonly.sort_unstable();
    out.push_str(&format!("\nreadonly: {}", readonly.join(", ")));

    let mut pending = input.pending_outputs.to_vec();
    pending.sort();
    out.push_str(&format!("\npending_output: {}", pending.join(", ")));

    out.push_str("\n@end context_state\n@end latest");
    out
}

fn render_retry_block(retry: &RetryContext) -> String {
    format!(
        "@retry_context\ntool_call: {}\nerror: {}\n@end retry_context",
        retry.tool_call, retry.error_message
    )
}

/// Assemble the user message for one send: `@readonly`, `@history`,
/// `@latest`, `@writable`, in that fixed order, plus an optional
/// `@retry_context` block injected right after `@latest`.
pub fn assemble(input: &PromptInput) -> AssembledPrompt {
    let mut blocks = vec![render_readonly_block(input.context_files), render_history_block(input.history), render_latest_block(input)];
    if let Some(retry) = input.retry_context {
        blocks.push(render_retry_block(retry));
    }
    blocks.push(render_writable_block(input.context_files));
    AssembledPrompt {
        system: input.system_prompt.to_string(),
        user: blocks.join("\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb7_core::ContextEventAction;

    fn file(path: &str, readonly: bool, content: &str) -> ContextFileContent {
        ContextFileContent {
            path: path.to_string(),
            file_id: "deadbeef".to_string(),
            readonly,
            range: None,
            content: content.to_string(),
        }
    }

    #[test]
    fn blocks_appear_in_fixed_order() {
        let files = vec![file("b.rs", true, "ro body"), file("a.rs", false, "rw body")];
        let input = PromptInput {
            system_prompt: "sys",
            history: &[],
            context_files: &files,
            pending_outputs: &[],
            latest_user_text: "do it",
            retry_context: None,
        };
        let out = assemble(&input);
        let ro = out.user.find("@readonly").unwrap();
        let hist = out.user.find("@history").unwrap();
        let latest = out.user.find("@latest").unwrap();
        let rw = out.user.find("@writable").unwrap();
        assert!(ro < hist && hist < latest && latest < rw);
        assert!(out.user.contains("path=b.rs"));
        assert!(out.user.contains("path=a.rs"));
    }

    #[test]
    fn is_a_pure_function_of_its_inputs() {
        let files = vec![file("a.rs", false, "x")];
        let input = PromptInput {
            system_prompt: "sys",
            history: &[],
            context_files: &files,
            pending_outputs: &[],
            latest_user_text: "hi",
            retry_context: None,
        };
        assert_eq!(assemble(&input), assemble(&input));
    }

    #[test]
    fn retry_context_is_injected_after_latest_and_before_writable() {
        let files = vec![];
        let retry = RetryContext {
            tool_call: serde_json::json!({"name": "edit_file"}),
            error_message: "anchor not unique".to_string(),
        };
        let input = PromptInput {
            system_prompt: "sys",
            history: &[],
            context_files: &files,
            pending_outputs: &[],
            latest_user_text: "retry please",
            retry_context: Some(&retry),
        };
        let out = assemble(&input);
        let latest = out.user.find("@end latest").unwrap();
        let retry_pos = out.user.find("@retry_context").unwrap();
        let writable = out.user.find("@writable").unwrap();
        assert!(latest < retry_pos && retry_pos < writable);
    }

    #[test]
    fn history_renders_context_events_as_terse_lines() {
        let mut msg = ChatMessage::System {
            parts: vec![],
            timestamp: chrono::Utc::now(),
        };
        msg.parts_mut()
            .push(Part::context_event(ContextEventAction::UserWriteFile, "a.rs").with_version("1234abcd"));
        let input = PromptInput {
            system_prompt: "sys",
            history: std::slice::from_ref(&msg),
            context_files: &[],
            pending_outputs: &[],
            latest_user_text: "next",
            retry_context: None,
        };
        let out = assemble(&input);
        assert!(out.user.contains("UserWriteFile a.rs 1234abcd"));
    }
}
