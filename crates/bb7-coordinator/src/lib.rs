//! Stream coordinator: the one place that ties prompt assembly, the LLM
//! transport, the file-edit engine, and chat persistence together into a
//! single `send`. A send either commits every staged write and persists one
//! assistant message with a full `output_files` list, or it commits nothing
//! at all — there is no partially-written turn on disk.

use bb7_core::{Chat, ChatMessage, ContextEventAction, Part, Usage, file_id};
use bb7_diff::EditRequest;
use bb7_errors::{BbError, EditFailure, Result};
use bb7_llm::{ChatRequest, LlmClient, StreamEvent, ToolCallEvent};
use bb7_prompt::{ContextFileContent, PromptInput, RetryContext};
use bb7_store::Store;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Events forwarded to the caller (the stdio layer) as a send streams.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Content(String),
    Thinking(String),
    Done {
        output_files: Vec<String>,
        usage: Option<Usage>,
    },
}

/// Guards "at most one stream active at a time" for the whole process.
/// The stdio layer owns one of these and checks it before calling `run_send`.
pub struct StreamGate(AtomicBool);

impl StreamGate {
    pub fn new() -> Self {
        StreamGate(AtomicBool::new(false))
    }

    /// Returns `true` if the gate was free and is now held by the caller.
    pub fn try_acquire(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Is a stream currently held? Used by context-mutation handlers to
    /// decide whether they are running during an active send.
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an in-flight request id to the cancellation flag `run_send` polls,
/// so a `cancel{target_request_id}` frame can reach the right stream.
#[derive(Default)]
pub struct CancelRegistry(Mutex<HashMap<String, Arc<AtomicBool>>>);

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.0.lock().unwrap().insert(request_id.to_string(), flag.clone());
        flag
    }

    /// Signals the flag registered for `request_id`. Returns `false` if no
    /// stream is registered under that id (already finished, or unknown).
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.0.lock().unwrap().get(request_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self, request_id: &str) {
        self.0.lock().unwrap().remove(request_id);
    }
}

/// Holds the most recent failing tool call + reason per chat, so a later
/// `retry_last` can inject the same `@retry_context` block a hidden
/// auto-retry would have used.
#[derive(Default)]
pub struct RetryStash(Mutex<HashMap<String, RetryContext>>);

impl RetryStash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, chat_id: &str, ctx: RetryContext) {
        self.0.lock().unwrap().insert(chat_id.to_string(), ctx);
    }

    pub fn take(&self, chat_id: &str) -> Option<RetryContext> {
        self.0.lock().unwrap().remove(chat_id)
    }

    pub fn clear(&self, chat_id: &str) {
        self.0.lock().unwrap().remove(chat_id);
    }
}

/// Model resolution order for a send: explicit argument, the chat's
/// recorded model, the global last-used model, then the configured default.
pub fn resolve_model(
    explicit: Option<&str>,
    chat_model: Option<&str>,
    last_model: Option<&str>,
    default_model: Option<&str>,
) -> Option<String> {
    explicit.or(chat_model).or(last_model).or(default_model).map(str::to_string)
}

fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "write_file",
                "description": "Replace the entire contents of a writable file.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "edit_file",
                "description": "Apply anchored or search/replace edits to a writable file.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "file_id": {"type": "string"},
                        "old_string": {"type": "string"},
                        "new_string": {"type": "string"},
                        "replace_all": {"type": "boolean"},
                        "edits": {"type": "array"},
                        "changes": {"type": "array"}
                    },
                    "required": ["path"]
                }
            }
        }),
    ]
}

fn build_context_file_contents(store: &Store, chat: &Chat) -> Result<Vec<ContextFileContent>> {
    let mut out = Vec::with_capacity(chat.context_files.len());
    for entry in &chat.context_files {
        let bytes = if entry.external {
            store.read_external_file(&chat.id, &entry.file_id)?
        } else if entry.is_section() {
            store.read_section_file(&chat.id, &entry.file_id)?
        } else {
            store.read_context_file(&chat.id, &entry.path)?
        };
        out.push(ContextFileContent {
            path: entry.path.clone(),
            file_id: entry.file_id.clone(),
            readonly: entry.readonly,
            range: match (entry.start_line, entry.end_line) {
                (Some(s), Some(e)) => Some((s, e)),
                _ => None,
            },
            content: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// One attempt: assemble a prompt, stream it, stage tool calls.
// ---------------------------------------------------------------------

struct AttemptResult {
    text: String,
    thinking: String,
    usage: Option<Usage>,
    cancelled: bool,
    /// Candidate content per touched path, by the end of this attempt.
    pending_writes: HashMap<String, String>,
    /// Touched paths in first-seen order, deduplicated.
    touched_paths: Vec<String>,
    errors: Vec<EditFailure>,
    /// `{"name": ..., "arguments": ...}` for every tool call seen, used to
    /// build the next `@retry_context` block if this attempt fails.
    raw_tool_calls: Vec<Value>,
}

fn current_candidate_for_edit(
    store: &Store,
    chat: &Chat,
    path: &str,
    pending: &HashMap<String, String>,
) -> std::result::Result<String, String> {
    if let Some(existing) = pending.get(path) {
        return Ok(existing.clone());
    }
    let entry = chat.full_entry(path).ok_or_else(|| format!("no context entry for {path}"))?;
    if entry.readonly {
        return Err(format!("{path} is read-only"));
    }
    let bytes = if entry.external {
        store.read_external_file(&chat.id, &entry.file_id)
    } else {
        store.read_context_file(&chat.id, path)
    };
    let bytes = bytes.map_err(|e| e.to_string())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Stage one tool call's effect into the per-turn pending buffer. Errors are
/// recorded but do not stop the stream — the rest of the turn's text still
/// matters to the user even though the whole buffer will be discarded.
fn handle_tool_call(
    store: &Store,
    chat: &Chat,
    pending: &mut HashMap<String, String>,
    touched: &mut Vec<String>,
    errors: &mut Vec<EditFailure>,
    raw_calls: &mut Vec<Value>,
    call: &ToolCallEvent,
) {
    raw_calls.push(json!({"name": call.name, "arguments": call.arguments}));

    let args: Value = match serde_json::from_str(&call.arguments) {
        Ok(v) => v,
        Err(e) => {
            errors.push(EditFailure::new(touched.len(), format!("malformed tool arguments: {e}")));
            return;
        }
    };

    match call.name.as_str() {
        "write_file" => {
            let Some(path) = args.get("path").and_then(Value::as_str) else {
                errors.push(EditFailure::new(touched.len(), "write_file is missing \"path\""));
                return;
            };
            let content = args.get("content").and_then(Value::as_str).unwrap_or("");
            if !touched.iter().any(|p| p == path) {
                touched.push(path.to_string());
            }
            pending.insert(path.to_string(), bb7_diff::apply_write_file(content));
        }
        "edit_file" => {
            let request = match bb7_diff::parse_edit_args(&args) {
                Ok(r) => r,
                Err(reason) => {
                    errors.push(EditFailure::new(touched.len(), reason));
                    return;
                }
            };
            let path = request.path().to_string();
            let candidate = match current_candidate_for_edit(store, chat, &path, pending) {
                Ok(c) => c,
                Err(reason) => {
                    errors.push(EditFailure::new(touched.len(), reason));
                    return;
                }
            };
            match apply(&candidate, &request) {
                Ok(next) => {
                    if !touched.iter().any(|p| p == &path) {
                        touched.push(path.clone());
                    }
                    pending.insert(path, next);
                }
                Err(fails) => errors.extend(fails),
            }
        }
        other => errors.push(EditFailure::new(touched.len(), format!("unknown tool {other}"))),
    }
}

fn apply(candidate: &str, request: &EditRequest) -> std::result::Result<String, Vec<EditFailure>> {
    bb7_diff::apply_edit_request(candidate, request)
}

#[allow(clippy::too_many_arguments)]
fn run_attempt(
    store: &Store,
    chat: &Chat,
    system_prompt: &str,
    history: &[ChatMessage],
    context_files: &[ContextFileContent],
    pending_outputs: &[String],
    latest_user_text: &str,
    retry_context: Option<&RetryContext>,
    model: &str,
    reasoning_effort: Option<&str>,
    llm: &LlmClient,
    cancel: &AtomicBool,
    mut emit: impl FnMut(CoordinatorEvent),
) -> Result<AttemptResult> {
    let assembled = bb7_prompt::assemble(&PromptInput {
        system_prompt,
        history,
        context_files,
        pending_outputs,
        latest_user_text,
        retry_context,
    });
    let req = ChatRequest {
        model: model.to_string(),
        system_prompt: assembled.system,
        user_message: assembled.user,
        reasoning_effort: reasoning_effort.map(str::to_string),
        tools: tool_schemas(),
    };

    let mut text = String::new();
    let mut thinking = String::new();
    let mut usage = None;
    let mut pending: HashMap<String, String> = HashMap::new();
    let mut touched: Vec<String> = Vec::new();
    let mut errors: Vec<EditFailure> = Vec::new();
    let mut raw_calls: Vec<Value> = Vec::new();

    llm.chat_stream(&req, cancel, |event| match event {
        StreamEvent::Content(chunk) => {
            text.push_str(&chunk);
            emit(CoordinatorEvent::Content(chunk));
        }
        StreamEvent::Thinking(chunk) => {
            thinking.push_str(&chunk);
            emit(CoordinatorEvent::Thinking(chunk));
        }
        StreamEvent::ToolCall(call) => {
            handle_tool_call(store, chat, &mut pending, &mut touched, &mut errors, &mut raw_calls, &call);
        }
        StreamEvent::Done { usage: u } => usage = u,
    })?;

    Ok(AttemptResult {
        text,
        thinking,
        usage,
        cancelled: cancel.load(Ordering::Relaxed),
        pending_writes: pending,
        touched_paths: touched,
        errors,
        raw_tool_calls: raw_calls,
    })
}

// ---------------------------------------------------------------------
// Commit / discard
// ---------------------------------------------------------------------

fn commit_pending_writes(store: &Store, chat: &Chat, attempt: &AttemptResult) -> Result<Vec<String>> {
    let mut committed = Vec::new();
    for path in &attempt.touched_paths {
        if let Some(content) = attempt.pending_writes.get(path) {
            store.write_output_file(&chat.id, path, content.as_bytes())?;
            committed.push(path.clone());
        }
    }
    committed.sort();
    Ok(committed)
}

fn append_assistant_message(
    chat: &mut Chat,
    model: &str,
    attempt: &AttemptResult,
    output_files: Vec<String>,
    usage: Option<Usage>,
) {
    let mut parts = Vec::new();
    if !attempt.thinking.is_empty() {
        parts.push(Part::thinking(attempt.thinking.clone()));
    }
    if !attempt.text.is_empty() {
        parts.push(Part::text(attempt.text.clone()));
    }
    for path in &output_files {
        let bytes = attempt.pending_writes.get(path).map(|s| s.as_bytes().to_vec()).unwrap_or_default();
        let version = file_id(path, &bytes);
        parts.push(Part::context_event(ContextEventAction::AssistantWriteFile, path).with_version(version));
    }
    chat.messages.push(ChatMessage::Assistant {
        parts,
        model: Some(model.to_string()),
        timestamp: Utc::now(),
        output_files,
        usage,
    });
}

fn build_retry_context(raw_calls: &[Value], errors: &[EditFailure]) -> RetryContext {
    RetryContext {
        tool_call: raw_calls.last().cloned().unwrap_or(Value::Null),
        error_message: errors.iter().map(|f| f.reason.clone()).collect::<Vec<_>>().join("; "),
    }
}

enum Settled {
    Cancelled,
    Succeeded { output_files: Vec<String>, usage: Option<Usage> },
    Failed(RetryContext),
}

/// Resolve one attempt's outcome into a persisted chat state: cancellation
/// and failure both discard the pending-write buffer and persist only the
/// text/thinking seen so far; success commits every staged write and
/// records it on the assistant message in the same save.
fn settle(
    store: &Store,
    chat: &mut Chat,
    model: &str,
    attempt: &AttemptResult,
    mut emit: impl FnMut(CoordinatorEvent),
) -> Result<Settled> {
    if attempt.cancelled {
        append_assistant_message(chat, model, attempt, Vec::new(), None);
        chat.messages.push(ChatMessage::system("Response aborted by user."));
        store.save_chat(chat)?;
        emit(CoordinatorEvent::Done { output_files: Vec::new(), usage: None });
        return Ok(Settled::Cancelled);
    }
    if attempt.errors.is_empty() {
        let output_files = commit_pending_writes(store, chat, attempt)?;
        append_assistant_message(chat, model, attempt, output_files.clone(), attempt.usage.clone());
        store.save_chat(chat)?;
        emit(CoordinatorEvent::Done { output_files: output_files.clone(), usage: attempt.usage.clone() });
        return Ok(Settled::Succeeded { output_files, usage: attempt.usage.clone() });
    }
    append_assistant_message(chat, model, attempt, Vec::new(), None);
    store.save_chat(chat)?;
    Ok(Settled::Failed(build_retry_context(&attempt.raw_tool_calls, &attempt.errors)))
}

// ---------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------

/// Everything a send needs that isn't the new user text itself — resolved
/// once by the caller (the stdio layer, which owns config/global state) and
/// threaded through both the first attempt and any hidden retry.
pub struct SendInputs<'a> {
    pub model_override: Option<&'a str>,
    pub reasoning_override: Option<&'a str>,
    pub last_model: Option<&'a str>,
    pub default_model: Option<&'a str>,
    pub auto_retry_partial_edits: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn run_send(
    store: &Store,
    llm: &LlmClient,
    chat_id: &str,
    project_root: &std::path::Path,
    content: &str,
    inputs: &SendInputs,
    cancel: &AtomicBool,
    retry_stash: &RetryStash,
    mut emit: impl FnMut(CoordinatorEvent),
) -> Result<()> {
    let mut chat = store.chat_get(chat_id)?;
    let model = resolve_model(inputs.model_override, chat.model.as_deref(), inputs.last_model, inputs.default_model)
        .ok_or_else(|| BbError::config("no model is configured; set a default model or pass one explicitly"))?;
    let reasoning_effort = inputs.reasoning_override.map(str::to_string).or_else(|| chat.reasoning_effort.clone());

    let global = bb7_instructions::load_global_instructions();
    let project = bb7_instructions::load_project_instructions(project_root, &store.bb7_dir())?;
    let system_prompt = bb7_instructions::build_system_prompt(global.as_deref(), project.as_deref());

    let context_files = build_context_file_contents(store, &chat)?;
    let pending_outputs = store.list_output_files(&chat.id)?;

    let snapshot = chat.context_snapshot();
    chat.messages.push(ChatMessage::User {
        parts: vec![Part::text(content)],
        model: Some(model.clone()),
        timestamp: Some(Utc::now()),
        context_snapshot: snapshot,
    });
    store.save_chat(&chat)?;
    let history = chat.messages[..chat.messages.len() - 1].to_vec();

    let attempt1 = run_attempt(
        store,
        &chat,
        &system_prompt,
        &history,
        &context_files,
        &pending_outputs,
        content,
        None,
        &model,
        reasoning_effort.as_deref(),
        llm,
        cancel,
        &mut emit,
    )?;

    match settle(store, &mut chat, &model, &attempt1, &mut emit)? {
        Settled::Cancelled => Ok(()),
        Settled::Succeeded { .. } => {
            retry_stash.clear(chat_id);
            Ok(())
        }
        Settled::Failed(retry_ctx) => {
            if !inputs.auto_retry_partial_edits {
                retry_stash.put(chat_id, retry_ctx.clone());
                return Err(BbError::edit(retry_ctx.error_message));
            }
            let attempt2 = run_attempt(
                store,
                &chat,
                &system_prompt,
                &history,
                &context_files,
                &pending_outputs,
                content,
                Some(&retry_ctx),
                &model,
                reasoning_effort.as_deref(),
                llm,
                cancel,
                &mut emit,
            )?;
            match settle(store, &mut chat, &model, &attempt2, &mut emit)? {
                Settled::Cancelled => Ok(()),
                Settled::Succeeded { .. } => {
                    retry_stash.clear(chat_id);
                    Ok(())
                }
                Settled::Failed(retry_ctx2) => {
                    retry_stash.put(chat_id, retry_ctx2.clone());
                    Err(BbError::edit(retry_ctx2.error_message))
                }
            }
        }
    }
}

/// `retry_last`: re-issue the most recent failed turn with its stashed
/// `@retry_context` block, reusing the original user text rather than
/// appending a new user message. One attempt only — the same discipline as
/// the hidden auto-retry, just triggered manually.
pub fn retry_last(
    store: &Store,
    llm: &LlmClient,
    chat_id: &str,
    project_root: &std::path::Path,
    retry_stash: &RetryStash,
    cancel: &AtomicBool,
    mut emit: impl FnMut(CoordinatorEvent),
) -> Result<()> {
    let mut chat = store.chat_get(chat_id)?;
    let retry_ctx = retry_stash
        .take(chat_id)
        .ok_or_else(|| BbError::conflict("no retry context is pending for this chat"))?;
    let model = chat
        .model
        .clone()
        .ok_or_else(|| BbError::config("chat has no recorded model to retry with"))?;
    let reasoning_effort = chat.reasoning_effort.clone();
    let last_user_text = chat
        .messages
        .iter()
        .rev()
        .find(|m| matches!(m, ChatMessage::User { .. }))
        .map(ChatMessage::text_content)
        .ok_or_else(|| BbError::conflict("chat has no user message to retry"))?;

    let global = bb7_instructions::load_global_instructions();
    let project = bb7_instructions::load_project_instructions(project_root, &store.bb7_dir())?;
    let system_prompt = bb7_instructions::build_system_prompt(global.as_deref(), project.as_deref());
    let context_files = build_context_file_contents(store, &chat)?;
    let pending_outputs = store.list_output_files(&chat.id)?;
    let history = chat.messages.clone();

    let attempt = run_attempt(
        store,
        &chat,
        &system_prompt,
        &history,
        &context_files,
        &pending_outputs,
        &last_user_text,
        Some(&retry_ctx),
        &model,
        reasoning_effort.as_deref(),
        llm,
        cancel,
        &mut emit,
    )?;

    match settle(store, &mut chat, &model, &attempt, &mut emit)? {
        Settled::Cancelled => Ok(()),
        Settled::Succeeded { .. } => {
            retry_stash.clear(chat_id);
            Ok(())
        }
        Settled::Failed(retry_ctx2) => {
            retry_stash.put(chat_id, retry_ctx2.clone());
            Err(BbError::edit(retry_ctx2.error_message))
        }
    }
}

/// Single-flight, fire-and-forget background title generation. A chat id
/// already being generated for is skipped silently; failures are swallowed
/// (the caller's debug log, if any, is its own concern — this type makes no
/// assumptions about logging).
#[derive(Default)]
pub struct TitleGenerator(Mutex<HashSet<String>>);

impl TitleGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn maybe_generate(
        self: &Arc<Self>,
        store: Arc<Store>,
        llm: Arc<LlmClient>,
        chat_id: String,
        title_model: String,
        first_user_text: String,
        on_success: impl FnOnce(&str, &str) + Send + 'static,
    ) {
        {
            let mut active = self.0.lock().unwrap();
            if !active.insert(chat_id.clone()) {
                return;
            }
        }
        let generator = Arc::clone(self);
        std::thread::spawn(move || {
            let result = llm.simple_chat(
                &title_model,
                "Summarise the user's request in five words or fewer, title case, no punctuation.",
                &first_user_text,
            );
            if let Ok(title) = result {
                let title = title.trim().to_string();
                if !title.is_empty() && store.chat_rename(&chat_id, &title).is_ok() {
                    on_success(&chat_id, &title);
                }
            }
            generator.0.lock().unwrap().remove(&chat_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_model_prefers_explicit_then_chat_then_last_then_default() {
        assert_eq!(resolve_model(Some("a"), Some("b"), Some("c"), Some("d")).as_deref(), Some("a"));
        assert_eq!(resolve_model(None, Some("b"), Some("c"), Some("d")).as_deref(), Some("b"));
        assert_eq!(resolve_model(None, None, Some("c"), Some("d")).as_deref(), Some("c"));
        assert_eq!(resolve_model(None, None, None, Some("d")).as_deref(), Some("d"));
        assert_eq!(resolve_model(None, None, None, None), None);
    }

    #[test]
    fn write_file_tool_call_stages_a_pending_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init().unwrap();
        let chat = store.chat_new(None).unwrap();

        let mut pending = HashMap::new();
        let mut touched = Vec::new();
        let mut errors = Vec::new();
        let mut raw = Vec::new();
        let call = ToolCallEvent {
            id: "1".into(),
            name: "write_file".into(),
            arguments: r#"{"path":"a.rs","content":"fn main() {}"}"#.into(),
        };
        handle_tool_call(&store, &chat, &mut pending, &mut touched, &mut errors, &mut raw, &call);
        assert!(errors.is_empty());
        assert_eq!(touched, vec!["a.rs".to_string()]);
        assert_eq!(pending["a.rs"], "fn main() {}\n");
    }

    #[test]
    fn edit_file_tool_call_against_readonly_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init().unwrap();
        let mut chat = store.chat_new(None).unwrap();
        bb7_context::context_add(&store, &mut chat, "a.rs", b"fn main() {}\n", true, false, false).unwrap();

        let mut pending = HashMap::new();
        let mut touched = Vec::new();
        let mut errors = Vec::new();
        let mut raw = Vec::new();
        let call = ToolCallEvent {
            id: "1".into(),
            name: "edit_file".into(),
            arguments: r#"{"path":"a.rs","old_string":"main","new_string":"start"}"#.into(),
        };
        handle_tool_call(&store, &chat, &mut pending, &mut touched, &mut errors, &mut raw, &call);
        assert!(errors.iter().any(|f| f.reason.contains("read-only")));
        assert!(pending.is_empty());
    }

    #[test]
    fn edit_file_tool_call_builds_on_a_prior_pending_write_in_the_same_turn() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init().unwrap();
        let mut chat = store.chat_new(None).unwrap();
        bb7_context::context_add(&store, &mut chat, "a.rs", b"fn main() {}\n", false, false, false).unwrap();

        let mut pending = HashMap::new();
        let mut touched = Vec::new();
        let mut errors = Vec::new();
        let mut raw = Vec::new();
        let write = ToolCallEvent {
            id: "1".into(),
            name: "write_file".into(),
            arguments: r#"{"path":"a.rs","content":"fn main() {\n    old();\n}"}"#.into(),
        };
        handle_tool_call(&store, &chat, &mut pending, &mut touched, &mut errors, &mut raw, &write);
        let edit = ToolCallEvent {
            id: "2".into(),
            name: "edit_file".into(),
            arguments: r#"{"path":"a.rs","old_string":"old()","new_string":"new()"}"#.into(),
        };
        handle_tool_call(&store, &chat, &mut pending, &mut touched, &mut errors, &mut raw, &edit);
        assert!(errors.is_empty());
        assert_eq!(pending["a.rs"], "fn main() {\n    new();\n}\n");
    }
}
