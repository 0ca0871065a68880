//! Stdio request/response multiplexer: reads newline-delimited JSON
//! requests from a `BufRead`, dispatches each by `action`, and writes
//! newline-delimited JSON replies (plus async events) to a shared,
//! mutex-guarded writer. Every handler other than `cancel`/`shutdown`
//! runs on its own thread so a slow request can never block the cancel
//! frame that is meant to interrupt it.

use bb7_context::{self, FileStatus};
use bb7_coordinator::{CancelRegistry, CoordinatorEvent, RetryStash, SendInputs, StreamGate, TitleGenerator};
use bb7_core::{Config, GlobalState};
use bb7_errors::{BbError, Result};
use bb7_llm::{LlmClient, TransportConfig};
use bb7_sandbox::RootKind;
use bb7_store::Store;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Deserialize)]
struct RequestFrame {
    request_id: String,
    action: String,
    #[serde(flatten)]
    args: Value,
}

/// Everything a running backend process needs, shared across request
/// threads behind one `Arc`. `W` is the frame writer — stdout in
/// production, an in-memory buffer in tests.
pub struct Session<W> {
    pub store: Arc<Store>,
    llm: Mutex<Arc<LlmClient>>,
    pub project_root: PathBuf,
    config: Mutex<Config>,
    global: Mutex<GlobalState>,
    active_chat: Mutex<Option<String>>,
    /// Serializes every chat-store read-modify-write: each mutating action
    /// runs on its own thread, so without this a second mutation on the same
    /// chat can interleave its load/mutate/save with the first and silently
    /// drop an update.
    chat_mutation: Mutex<()>,
    gate: StreamGate,
    cancels: CancelRegistry,
    retry_stash: RetryStash,
    title_gen: Arc<TitleGenerator>,
    writer: Mutex<W>,
}

impl<W: Write> Session<W> {
    pub fn new(store: Store, project_root: PathBuf, config: Config, global: GlobalState, writer: W) -> Result<Self> {
        let llm = LlmClient::new(TransportConfig::from_config(&config))?;
        Ok(Session {
            store: Arc::new(store),
            llm: Mutex::new(Arc::new(llm)),
            project_root,
            config: Mutex::new(config),
            global: Mutex::new(global),
            active_chat: Mutex::new(None),
            chat_mutation: Mutex::new(()),
            gate: StreamGate::new(),
            cancels: CancelRegistry::new(),
            retry_stash: RetryStash::new(),
            title_gen: Arc::new(TitleGenerator::new()),
            writer: Mutex::new(writer),
        })
    }
}

fn write_frame<W: Write>(writer: &Mutex<W>, value: &Value) -> Result<()> {
    let mut w = writer.lock().unwrap();
    let line = serde_json::to_string(value)?;
    writeln!(w, "{line}")?;
    w.flush()?;
    Ok(())
}

fn error_frame(request_id: &str, err: &BbError) -> Value {
    let mut body = err.as_frame_body();
    body["request_id"] = json!(request_id);
    body["type"] = json!("error");
    body
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BbError::parse(format!("missing or invalid \"{key}\" argument")))
}

fn require_u32(args: &Value, key: &str) -> Result<u32> {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| BbError::parse(format!("missing or invalid \"{key}\" argument")))
}

fn require_usize(args: &Value, key: &str) -> Result<usize> {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| BbError::parse(format!("missing or invalid \"{key}\" argument")))
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn opt_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn path_to_string(p: PathBuf) -> String {
    p.to_string_lossy().into_owned()
}

/// An external context entry is any path the frontend addresses by its
/// absolute location rather than one relative to the project root.
fn is_external(path: &str) -> bool {
    Path::new(path).is_absolute()
}

fn sandbox_check(project_root: &Path, path: &str, external: bool) -> Result<()> {
    if external {
        bb7_sandbox::resolve_external(path)?;
    } else {
        bb7_sandbox::resolve(RootKind::ProjectRoot, project_root, path)?;
    }
    Ok(())
}

/// A coarse stand-in for a real tokenizer (explicitly out of scope; the
/// frontend is told to treat this as an estimate, not an exact count).
fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn active_chat_id<W>(session: &Session<W>) -> Result<String> {
    session.active_chat.lock().unwrap().clone().ok_or_else(BbError::no_active_chat)
}

/// Handle every action except `shutdown`, `cancel`, `send`, `retry_last` —
/// those either finish synchronously in the read loop or stream their own
/// reply frames directly and are dispatched separately.
fn dispatch<W: Write>(session: &Session<W>, action: &str, args: &Value) -> Result<Value> {
    match action {
        "bb7_init" => {
            session.store.init()?;
            let new_config = Config::load()?;
            let new_llm = LlmClient::new(TransportConfig::from_config(&new_config))?;
            *session.config.lock().unwrap() = new_config;
            *session.llm.lock().unwrap() = Arc::new(new_llm);
            Ok(json!({"type": "bb7_init", "initialised": true}))
        }
        "init" => {
            let chats = session.store.chat_list()?;
            let global = session.global.lock().unwrap().clone();
            let active = session.active_chat.lock().unwrap().clone();
            let default_model = session.config.lock().unwrap().default_model.clone();
            Ok(json!({
                "type": "init",
                "chats": chats,
                "active_chat": active,
                "favorites": global.favorites,
                "last_model": global.last_model,
                "default_model": default_model,
            }))
        }
        "ping" => Ok(json!({"type": "pong"})),
        "version" => Ok(json!({"type": "version", "version": env!("CARGO_PKG_VERSION")})),

        "chat_new" => {
            let name = opt_str(args, "name");
            let chat = session.store.chat_new(name)?;
            Ok(json!({"type": "chat_new", "chat": chat}))
        }
        "chat_list" => {
            let chats = session.store.chat_list()?;
            Ok(json!({"type": "chat_list", "chats": chats}))
        }
        "chat_select" => {
            let id = require_str(args, "id")?;
            if !session.store.chat_exists(id) {
                return Err(BbError::not_found(format!("chat {id}")));
            }
            let chat = session.store.chat_get(id)?;
            *session.active_chat.lock().unwrap() = Some(id.to_string());
            Ok(json!({"type": "chat_select", "chat": chat}))
        }
        "chat_get" => {
            let id = active_chat_id(session)?;
            let chat = session.store.chat_get(&id)?;
            Ok(json!({"type": "chat_get", "chat": chat}))
        }
        "chat_active" => {
            let id = session.active_chat.lock().unwrap().clone();
            Ok(json!({"type": "chat_active", "chat_id": id}))
        }
        "chat_delete" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = require_str(args, "id")?;
            session.store.chat_delete(id)?;
            let mut active = session.active_chat.lock().unwrap();
            if active.as_deref() == Some(id) {
                *active = None;
            }
            Ok(json!({"type": "chat_delete", "ok": true}))
        }
        "chat_rename" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = require_str(args, "id")?;
            let name = require_str(args, "name")?;
            let chat = session.store.chat_rename(id, name)?;
            Ok(json!({"type": "chat_rename", "chat": chat}))
        }
        "save_chat_settings" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let model = opt_str(args, "model");
            let reasoning_effort = opt_str(args, "reasoning_effort");
            let chat = session.store.save_chat_settings(&id, model, reasoning_effort)?;
            Ok(json!({"type": "save_chat_settings", "chat": chat}))
        }
        "save_draft" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let draft = require_str(args, "draft")?;
            session.store.save_draft(&id, draft)?;
            Ok(json!({"type": "save_draft", "ok": true}))
        }
        "chat_edit" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let chat_id = require_str(args, "chat_id")?;
            let message_index = require_usize(args, "message_index")?;
            let content = require_str(args, "content")?;
            let (chat, warnings) = session.store.chat_edit(chat_id, message_index, content)?;
            Ok(json!({"type": "chat_edit", "chat": chat, "warnings": warnings}))
        }
        "fork_chat" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let chat_id = require_str(args, "chat_id")?;
            let fork_message_index = require_usize(args, "fork_message_index")?;
            let (chat, warnings) = session.store.fork_chat(chat_id, fork_message_index)?;
            *session.active_chat.lock().unwrap() = Some(chat.id.clone());
            Ok(json!({"type": "fork_chat", "chat": chat, "warnings": warnings}))
        }
        "search_chats" => {
            let query = require_str(args, "query")?;
            let results = session.store.search_chats(query)?;
            Ok(json!({"type": "search_chats", "results": results}))
        }
        "context_add" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let content = require_str(args, "content")?;
            let readonly = opt_bool(args, "readonly", false);
            let external = is_external(path);
            sandbox_check(&session.project_root, path, external)?;
            bb7_context::context_add(&session.store, &mut chat, path, content.as_bytes(), readonly, external, session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "context_add", "chat": chat}))
        }
        "context_add_section" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let content = require_str(args, "content")?;
            let start_line = require_u32(args, "start_line")?;
            let end_line = require_u32(args, "end_line")?;
            sandbox_check(&session.project_root, path, false)?;
            bb7_context::context_add_section(&session.store, &mut chat, path, content.as_bytes(), start_line, end_line, session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "context_add_section", "chat": chat}))
        }
        "context_update" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let content = require_str(args, "content")?;
            let outcome = bb7_context::context_update(&session.store, &mut chat, path, content.as_bytes(), session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "context_update", "chat": chat, "output_invalidated": outcome.output_invalidated}))
        }
        "context_remove" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            bb7_context::context_remove(&session.store, &mut chat, path, session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "context_remove", "chat": chat}))
        }
        "context_remove_section" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let start_line = require_u32(args, "start_line")?;
            let end_line = require_u32(args, "end_line")?;
            bb7_context::context_remove_section(&session.store, &mut chat, path, start_line, end_line, session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "context_remove_section", "chat": chat}))
        }
        "context_list" => {
            let id = active_chat_id(session)?;
            let chat = session.store.chat_get(&id)?;
            let entries = bb7_context::context_list(&chat).to_vec();
            Ok(json!({"type": "context_list", "entries": entries}))
        }
        "context_set_readonly" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let readonly = opt_bool(args, "readonly", false);
            bb7_context::context_set_readonly(&mut chat, path, readonly, session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "context_set_readonly", "chat": chat}))
        }

        "get_context_file" => {
            let id = active_chat_id(session)?;
            let chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let bytes = bb7_context::get_context_file(&session.store, &chat, path)?;
            Ok(json!({"type": "get_context_file", "path": path, "content": String::from_utf8_lossy(&bytes)}))
        }
        "get_output_file" => {
            let id = active_chat_id(session)?;
            let chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let bytes = bb7_context::get_output_file(&session.store, &chat, path)?;
            Ok(json!({"type": "get_output_file", "path": path, "content": String::from_utf8_lossy(&bytes)}))
        }
        "get_diff_paths" => {
            let id = active_chat_id(session)?;
            let chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let diff = bb7_context::get_diff_paths(&session.store, &chat, path)?;
            Ok(json!({
                "type": "get_diff_paths",
                "context_path": diff.context_path.map(path_to_string),
                "output_path": diff.output_path.map(path_to_string),
            }))
        }
        "get_file_statuses" => {
            let id = active_chat_id(session)?;
            let chat = session.store.chat_get(&id)?;
            let entries = bb7_context::get_file_statuses(&session.store, &chat, &session.project_root)?;
            Ok(json!({"type": "get_file_statuses", "entries": entries}))
        }
        "apply_file" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            bb7_context::apply_file(&session.store, &mut chat, &session.project_root, path, None, session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "apply_file", "chat": chat}))
        }
        "apply_file_as" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            let destination = require_str(args, "destination")?;
            bb7_context::apply_file(&session.store, &mut chat, &session.project_root, path, Some(destination), session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "apply_file_as", "chat": chat}))
        }
        "output_delete" => {
            let _guard = session.chat_mutation.lock().unwrap();
            let id = active_chat_id(session)?;
            let mut chat = session.store.chat_get(&id)?;
            let path = require_str(args, "path")?;
            bb7_context::output_delete(&session.store, &mut chat, path, session.gate.is_active())?;
            session.store.save_chat(&chat)?;
            Ok(json!({"type": "output_delete", "chat": chat}))
        }
        // The frontend sends this once it has shown (and the user has
        // dismissed) a local diff view. Nothing server-side depends on it.
        "diff_local_done" => Ok(json!({"type": "diff_local_done", "ok": true})),

        "estimate_tokens" => {
            let text = require_str(args, "text")?;
            Ok(json!({"type": "estimate_tokens", "tokens": estimate_tokens(text)}))
        }
        "estimate_text_tokens" => {
            let texts = args
                .get("texts")
                .and_then(Value::as_array)
                .ok_or_else(|| BbError::parse("missing or invalid \"texts\" argument"))?;
            let tokens: Vec<usize> = texts.iter().map(|v| estimate_tokens(v.as_str().unwrap_or(""))).collect();
            Ok(json!({"type": "estimate_text_tokens", "tokens": tokens}))
        }
        "get_balance" => {
            let llm = Arc::clone(&*session.llm.lock().unwrap());
            let balance = llm.get_balance()?;
            Ok(json!({"type": "get_balance", "balance": balance}))
        }
        "get_models" => {
            let llm = Arc::clone(&*session.llm.lock().unwrap());
            let models = llm.get_models()?;
            Ok(json!({"type": "get_models", "models": models}))
        }

        "prepare_instructions" => {
            let level = require_str(args, "level")?;
            let bb7_dir = session.store.bb7_dir();
            match level {
                "global" => {
                    let content = bb7_instructions::load_global_instructions();
                    Ok(json!({"type": "prepare_instructions", "level": "global", "content": content}))
                }
                "project" => {
                    let content = bb7_instructions::load_project_instructions(&session.project_root, &bb7_dir)?;
                    Ok(json!({"type": "prepare_instructions", "level": "project", "content": content}))
                }
                "system" => {
                    let global = bb7_instructions::load_global_instructions();
                    let project = bb7_instructions::load_project_instructions(&session.project_root, &bb7_dir)?;
                    let content = bb7_instructions::build_system_prompt(global.as_deref(), project.as_deref());
                    Ok(json!({"type": "prepare_instructions", "level": "system", "content": content}))
                }
                other => Err(BbError::parse(format!("unknown instructions level {other:?}"))),
            }
        }
        "get_customization_info" => {
            let info = bb7_instructions::get_customization_info(&session.project_root, &session.store.bb7_dir());
            Ok(json!({
                "type": "get_customization_info",
                "global_instructions": info.global_instructions,
                "project_instructions": info.project_instructions,
                "project_instructions_error": info.project_instructions_error,
            }))
        }

        other => Err(BbError::parse(format!("unrecognised action {other:?}"))),
    }
}

fn handle_generate_title<W: Write + Send + Sync + 'static>(session: Arc<Session<W>>, request_id: String, args: Value) {
    let reply = (|| -> Result<()> {
        let chat_id = require_str(&args, "chat_id")?.to_string();
        let content = require_str(&args, "content")?.to_string();
        let title_model = session
            .config
            .lock()
            .unwrap()
            .title_model
            .clone()
            .ok_or_else(|| BbError::config("no title_model is configured"))?;
        let store = Arc::clone(&session.store);
        let llm = Arc::clone(&*session.llm.lock().unwrap());
        let emit_session = Arc::clone(&session);
        session.title_gen.clone().maybe_generate(store, llm, chat_id, title_model, content, move |chat_id, title| {
            let _ = write_frame(&emit_session.writer, &json!({"type": "title_updated", "chat_id": chat_id, "title": title}));
        });
        Ok(())
    })();
    let frame = match reply {
        Ok(()) => json!({"request_id": request_id, "type": "generate_title", "accepted": true}),
        Err(e) => error_frame(&request_id, &e),
    };
    let _ = write_frame(&session.writer, &frame);
}

fn coordinator_event_frame(request_id: &str, event: CoordinatorEvent) -> Value {
    match event {
        CoordinatorEvent::Content(content) => json!({"request_id": request_id, "type": "chunk", "content": content}),
        CoordinatorEvent::Thinking(content) => json!({"request_id": request_id, "type": "thinking", "content": content}),
        CoordinatorEvent::Done { output_files, usage } => {
            json!({"request_id": request_id, "type": "done", "output_files": output_files, "usage": usage})
        }
    }
}

/// Record the model a send actually used as the new "last model" — read
/// back from the persisted chat rather than threaded through `run_send`'s
/// return value, since a cancelled or failed attempt still resolved one.
fn record_last_model<W>(session: &Session<W>, chat_id: &str) {
    if let Ok(chat) = session.store.chat_get(chat_id) {
        if let Some(model) = chat.model {
            let mut global = session.global.lock().unwrap();
            global.last_model = Some(model);
            let _ = global.save();
        }
    }
}

fn handle_send<W: Write + Send + Sync + 'static>(session: Arc<Session<W>>, request_id: String, args: Value) {
    if !session.gate.try_acquire() {
        let _ = write_frame(
            &session.writer,
            &error_frame(&request_id, &BbError::busy("a send is already streaming; cancel it or wait for it to finish")),
        );
        return;
    }
    let cancel = session.cancels.register(&request_id);

    let outcome = (|| -> Result<String> {
        let content = require_str(&args, "content")?.to_string();
        let model_override = opt_str(&args, "model");
        let reasoning_override = opt_str(&args, "reasoning_effort");
        let chat_id = active_chat_id(&session)?;

        let config = session.config.lock().unwrap().clone();
        let llm = Arc::clone(&*session.llm.lock().unwrap());
        let global = session.global.lock().unwrap().clone();
        let inputs = SendInputs {
            model_override: model_override.as_deref(),
            reasoning_override: reasoning_override.as_deref(),
            last_model: global.last_model.as_deref(),
            default_model: config.default_model.as_deref(),
            auto_retry_partial_edits: config.auto_retry_partial_edits,
        };

        let emit_session = Arc::clone(&session);
        let emit_request_id = request_id.clone();
        bb7_coordinator::run_send(
            &session.store,
            &llm,
            &chat_id,
            &session.project_root,
            &content,
            &inputs,
            &cancel,
            &session.retry_stash,
            move |event| {
                let _ = write_frame(&emit_session.writer, &coordinator_event_frame(&emit_request_id, event));
            },
        )?;
        Ok(chat_id)
    })();

    session.cancels.clear(&request_id);
    session.gate.release();
    match outcome {
        Ok(chat_id) => record_last_model(&session, &chat_id),
        Err(e) => {
            let _ = write_frame(&session.writer, &error_frame(&request_id, &e));
        }
    }
}

fn handle_retry_last<W: Write + Send + Sync + 'static>(session: Arc<Session<W>>, request_id: String) {
    if !session.gate.try_acquire() {
        let _ = write_frame(
            &session.writer,
            &error_frame(&request_id, &BbError::busy("a send is already streaming; cancel it or wait for it to finish")),
        );
        return;
    }
    let cancel = session.cancels.register(&request_id);

    let outcome = (|| -> Result<String> {
        let chat_id = active_chat_id(&session)?;
        let llm = Arc::clone(&*session.llm.lock().unwrap());
        let emit_session = Arc::clone(&session);
        let emit_request_id = request_id.clone();
        bb7_coordinator::retry_last(
            &session.store,
            &llm,
            &chat_id,
            &session.project_root,
            &session.retry_stash,
            &cancel,
            move |event| {
                let _ = write_frame(&emit_session.writer, &coordinator_event_frame(&emit_request_id, event));
            },
        )?;
        Ok(chat_id)
    })();

    session.cancels.clear(&request_id);
    session.gate.release();
    match outcome {
        Ok(chat_id) => record_last_model(&session, &chat_id),
        Err(e) => {
            let _ = write_frame(&session.writer, &error_frame(&request_id, &e));
        }
    }
}

/// Run the stdio loop to completion: one physical line per frame, replies
/// written through the session's mutex-guarded writer so streaming chunks
/// and request replies never interleave mid-object. Returns once a
/// `shutdown` frame is processed or the input stream ends.
pub fn run<R: BufRead, W: Write + Send + Sync + 'static>(session: Arc<Session<W>>, reader: R) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: RequestFrame = match serde_json::from_str(trimmed) {
            Ok(f) => f,
            Err(e) => {
                let _ = write_frame(&session.writer, &json!({"type": "error", "message": format!("parse error: {e}")}));
                continue;
            }
        };

        match frame.action.as_str() {
            "shutdown" => {
                let _ = write_frame(&session.writer, &json!({"request_id": frame.request_id, "type": "ok"}));
                return Ok(());
            }
            "cancel" => {
                let target = frame.args.get("target_request_id").and_then(Value::as_str).unwrap_or_default();
                let cancelled = session.cancels.cancel(target);
                let _ = write_frame(&session.writer, &json!({"request_id": frame.request_id, "type": "ok", "cancelled": cancelled}));
            }
            "send" => {
                let session = Arc::clone(&session);
                std::thread::spawn(move || handle_send(session, frame.request_id, frame.args));
            }
            "retry_last" => {
                let session = Arc::clone(&session);
                std::thread::spawn(move || handle_retry_last(session, frame.request_id));
            }
            "generate_title" => {
                let session = Arc::clone(&session);
                std::thread::spawn(move || handle_generate_title(session, frame.request_id, frame.args));
            }
            _ => {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    let reply = match dispatch(&*session, &frame.action, &frame.args) {
                        Ok(mut body) => {
                            body["request_id"] = json!(frame.request_id);
                            body
                        }
                        Err(e) => error_frame(&frame.request_id, &e),
                    };
                    let _ = write_frame(&session.writer, &reply);
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_session() -> (tempfile::TempDir, Arc<Session<Vec<u8>>>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init().unwrap();
        let mut config = Config::default();
        config.api_key = "test-key".to_string();
        let session = Session::new(store, dir.path().to_path_buf(), config, GlobalState::default(), Vec::new()).unwrap();
        (dir, Arc::new(session))
    }

    fn lines_of(buf: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(buf)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn ping_replies_with_matching_request_id() {
        let (_dir, session) = test_session();
        let input = Cursor::new(b"{\"request_id\":\"1\",\"action\":\"ping\"}\n".to_vec());
        run(Arc::clone(&session), input).unwrap();
        let out = session.writer.lock().unwrap().clone();
        let frames = lines_of(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["request_id"], "1");
        assert_eq!(frames[0]["type"], "pong");
    }

    #[test]
    fn unknown_action_is_a_parse_error() {
        let (_dir, session) = test_session();
        let input = Cursor::new(b"{\"request_id\":\"1\",\"action\":\"not_a_real_action\"}\n".to_vec());
        run(Arc::clone(&session), input).unwrap();
        let frames = lines_of(&session.writer.lock().unwrap());
        assert_eq!(frames[0]["type"], "error");
        assert!(frames[0]["message"].as_str().unwrap().contains("unrecognised action"));
    }

    #[test]
    fn chat_new_then_select_then_send_without_content_is_a_parse_error() {
        let (_dir, session) = test_session();
        let input = Cursor::new(
            b"{\"request_id\":\"1\",\"action\":\"chat_new\"}\n{\"request_id\":\"2\",\"action\":\"send\"}\n".to_vec(),
        );
        run(Arc::clone(&session), input).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let frames = lines_of(&session.writer.lock().unwrap());
        assert_eq!(frames[0]["type"], "chat_new");
        let chat_id = frames[0]["chat"]["id"].as_str().unwrap();
        *session.active_chat.lock().unwrap() = Some(chat_id.to_string());
        assert!(frames.iter().any(|f| f["type"] == "error" && f["request_id"] == "2"));
    }

    #[test]
    fn shutdown_ends_the_loop_before_later_lines_are_read() {
        let (_dir, session) = test_session();
        let input = Cursor::new(b"{\"request_id\":\"1\",\"action\":\"shutdown\"}\n{\"request_id\":\"2\",\"action\":\"ping\"}\n".to_vec());
        run(Arc::clone(&session), input).unwrap();
        let frames = lines_of(&session.writer.lock().unwrap());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "ok");
    }

    #[test]
    fn cancel_with_no_matching_stream_reports_not_cancelled() {
        let (_dir, session) = test_session();
        let input = Cursor::new(b"{\"request_id\":\"1\",\"action\":\"cancel\",\"target_request_id\":\"ghost\"}\n".to_vec());
        run(Arc::clone(&session), input).unwrap();
        let frames = lines_of(&session.writer.lock().unwrap());
        assert_eq!(frames[0]["cancelled"], false);
    }

    #[test]
    fn estimate_tokens_is_a_coarse_heuristic() {
        let (_dir, session) = test_session();
        let input = Cursor::new(b"{\"request_id\":\"1\",\"action\":\"estimate_tokens\",\"text\":\"twelve characters\"}\n".to_vec());
        run(Arc::clone(&session), input).unwrap();
        let frames = lines_of(&session.writer.lock().unwrap());
        assert_eq!(frames[0]["tokens"], 5);
    }
}
