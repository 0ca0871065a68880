//! Shared data model for the BB-7 backend: chats, messages,
//! parts, context entries, and the ambient config/global-state files that
//! live outside any single project.

use bb7_errors::{BbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_CHAT_VERSION: u32 = 2;

/// First 8 hex characters of SHA-256 over `path || 0x00 || content`.
pub fn file_id(path: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

/// Full hex digest used to name section snapshot files (`context/_sections/<hash>`).
/// Hashes `path || start || end || content`.
pub fn section_hash(path: &str, start: u32, end: u32, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(start.to_le_bytes());
    hasher.update(end.to_le_bytes());
    hasher.update(content);
    let digest = hasher.finalize();
    hex_prefix(&digest, digest.len() * 2)
}

fn hex_prefix(digest: &[u8], hex_chars: usize) -> String {
    let mut out = String::with_capacity(hex_chars);
    for byte in digest {
        if out.len() >= hex_chars {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(hex_chars);
    out
}

/// Write `bytes` to `path` via a temp-file-in-the-same-directory + rename,
/// so a crash can never leave a half-written file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| BbError::Conflict(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
        uuid::Uuid::now_v7().simple()
    ));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

// ---------------------------------------------------------------------
// Context entries
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextFileEntry {
    pub path: String,
    pub readonly: bool,
    #[serde(default)]
    pub external: bool,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
}

impl ContextFileEntry {
    pub fn is_section(&self) -> bool {
        self.start_line.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextSnapshotEntry {
    pub path: String,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt: u64,
    pub completion: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

// ---------------------------------------------------------------------
// Parts — closed sum, with a `raw` escape hatch for forward compatibility.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextEventAction {
    UserAddFile,
    UserAddSection,
    UserRemoveFile,
    UserRemoveSection,
    UserWriteFile,
    UserApplyFile,
    UserSaveAs,
    UserRejectOutput,
    UserSetReadOnly,
    AssistantWriteFile,
    ForkWarningModified,
    ForkWarningDeleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    Code {
        lang: String,
        text: String,
    },
    File {
        path: String,
    },
    ContextEvent {
        action: ContextEventAction,
        path: String,
        version: Option<String>,
        prev_version: Option<String>,
        readonly: Option<bool>,
        external: Option<bool>,
        start: Option<u32>,
        end: Option<u32>,
    },
    /// An unrecognised part shape, kept byte-faithful so a chat written by a
    /// newer backend still loads.
    Raw {
        value: Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Part::Thinking { text: text.into() }
    }

    pub fn context_event(action: ContextEventAction, path: impl Into<String>) -> Self {
        Part::ContextEvent {
            action,
            path: path.into(),
            version: None,
            prev_version: None,
            readonly: None,
            external: None,
            start: None,
            end: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        if let Part::ContextEvent { version: v, .. } = &mut self {
            *v = Some(version.into());
        }
        self
    }

    pub fn with_prev_version(mut self, prev: impl Into<String>) -> Self {
        if let Part::ContextEvent { prev_version, .. } = &mut self {
            *prev_version = Some(prev.into());
        }
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        if let Part::ContextEvent { readonly: r, .. } = &mut self {
            *r = Some(readonly);
        }
        self
    }

    pub fn with_range(mut self, start: u32, end: u32) -> Self {
        if let Part::ContextEvent { start: s, end: e, .. } = &mut self {
            *s = Some(start);
            *e = Some(end);
        }
        self
    }

    /// Append `more` to this part's text if it is a `text`/`thinking`
    /// accumulator, used while coalescing consecutive streamed chunks into
    /// a single logical section.
    pub fn push_text(&mut self, more: &str) {
        match self {
            Part::Text { text } | Part::Thinking { text } => text.push_str(more),
            _ => {}
        }
    }
}

impl Serialize for Part {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = match self {
            Part::Text { text } => json!({ "type": "text", "text": text }),
            Part::Thinking { text } => json!({ "type": "thinking", "text": text }),
            Part::Code { lang, text } => json!({ "type": "code", "lang": lang, "text": text }),
            Part::File { path } => json!({ "type": "file", "path": path }),
            Part::ContextEvent {
                action,
                path,
                version,
                prev_version,
                readonly,
                external,
                start,
                end,
            } => {
                let mut obj = json!({
                    "type": "context_event",
                    "action": action,
                    "path": path,
                });
                let map = obj.as_object_mut().unwrap();
                if let Some(v) = version {
                    map.insert("version".into(), json!(v));
                }
                if let Some(v) = prev_version {
                    map.insert("prev_version".into(), json!(v));
                }
                if let Some(v) = readonly {
                    map.insert("readonly".into(), json!(v));
                }
                if let Some(v) = external {
                    map.insert("external".into(), json!(v));
                }
                if let Some(v) = start {
                    map.insert("start".into(), json!(v));
                }
                if let Some(v) = end {
                    map.insert("end".into(), json!(v));
                }
                obj
            }
            Part::Raw { value } => value.clone(),
        };
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Part::from_value(value))
    }
}

impl Part {
    fn from_value(value: Value) -> Self {
        let ty = value.get("type").and_then(Value::as_str).unwrap_or("");
        match ty {
            "text" => Part::Text {
                text: str_field(&value, "text"),
            },
            "thinking" => Part::Thinking {
                text: str_field(&value, "text"),
            },
            "code" => Part::Code {
                lang: str_field(&value, "lang"),
                text: str_field(&value, "text"),
            },
            "file" => Part::File {
                path: str_field(&value, "path"),
            },
            "context_event" => {
                let action = value
                    .get("action")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok());
                match action {
                    Some(action) => Part::ContextEvent {
                        action,
                        path: str_field(&value, "path"),
                        version: opt_str_field(&value, "version"),
                        prev_version: opt_str_field(&value, "prev_version"),
                        readonly: value.get("readonly").and_then(Value::as_bool),
                        external: value.get("external").and_then(Value::as_bool),
                        start: value.get("start").and_then(Value::as_u64).map(|v| v as u32),
                        end: value.get("end").and_then(Value::as_u64).map(|v| v as u32),
                    },
                    None => Part::Raw { value },
                }
            }
            _ => Part::Raw { value },
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn opt_str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

// ---------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User {
        parts: Vec<Part>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// `None` only for legacy (schema-0) chats that never recorded one —
        /// do not synthesise a value, mark it missing instead.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        context_snapshot: Vec<ContextSnapshotEntry>,
    },
    Assistant {
        parts: Vec<Part>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        output_files: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    System {
        parts: Vec<Part>,
        timestamp: DateTime<Utc>,
    },
}

impl ChatMessage {
    pub fn parts(&self) -> &[Part] {
        match self {
            ChatMessage::User { parts, .. }
            | ChatMessage::Assistant { parts, .. }
            | ChatMessage::System { parts, .. } => parts,
        }
    }

    pub fn parts_mut(&mut self) -> &mut Vec<Part> {
        match self {
            ChatMessage::User { parts, .. }
            | ChatMessage::Assistant { parts, .. }
            | ChatMessage::System { parts, .. } => parts,
        }
    }

    pub fn push_context_event(&mut self, action: ContextEventAction, path: impl Into<String>) {
        self.parts_mut().push(Part::context_event(action, path));
    }

    pub fn system(text: impl Into<String>) -> Self {
        ChatMessage::System {
            parts: vec![Part::text(text)],
            timestamp: Utc::now(),
        }
    }

    pub fn text_content(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ---------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub draft: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub context_files: Vec<ContextFileEntry>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

fn default_version() -> u32 {
    CURRENT_CHAT_VERSION
}

impl Chat {
    pub fn new(id: String, name: String) -> Self {
        Chat {
            id,
            name,
            created: Utc::now(),
            model: None,
            reasoning_effort: None,
            draft: String::new(),
            version: CURRENT_CHAT_VERSION,
            context_files: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn new_id() -> String {
        uuid::Uuid::now_v7().to_string()
    }

    pub fn full_entry(&self, path: &str) -> Option<&ContextFileEntry> {
        self.context_files
            .iter()
            .find(|e| e.path == path && !e.is_section())
    }

    pub fn full_entry_mut(&mut self, path: &str) -> Option<&mut ContextFileEntry> {
        self.context_files
            .iter_mut()
            .find(|e| e.path == path && !e.is_section())
    }

    pub fn sections_for(&self, path: &str) -> Vec<&ContextFileEntry> {
        self.context_files
            .iter()
            .filter(|e| e.path == path && e.is_section())
            .collect()
    }

    /// Current entries that are a readonly view over `path` — used to
    /// decide whether a section's snapshot file is still referenced by
    /// another entry before its snapshot file is deleted.
    pub fn section_refcount(&self, file_id: &str) -> usize {
        self.context_files
            .iter()
            .filter(|e| e.is_section() && e.file_id == file_id)
            .count()
    }

    pub fn context_snapshot(&self) -> Vec<ContextSnapshotEntry> {
        self.context_files
            .iter()
            .map(|e| ContextSnapshotEntry {
                path: e.path.clone(),
                file_id: e.file_id.clone(),
                start: e.start_line,
                end: e.end_line,
            })
            .collect()
    }

    /// Append `part` to the chat's currently-open message for mutation
    /// events, creating a synthetic system message when no user message is
    /// under construction.
    pub fn record_context_event(&mut self, action: ContextEventAction, path: &str) {
        if let Some(last) = self.messages.last_mut() {
            if matches!(last, ChatMessage::User { .. } | ChatMessage::Assistant { .. }) {
                last.push_context_event(action, path);
                return;
            }
        }
        let mut msg = ChatMessage::System {
            parts: Vec::new(),
            timestamp: Utc::now(),
        };
        msg.push_context_event(action, path);
        self.messages.push(msg);
    }
}

// ---------------------------------------------------------------------
// Chat index (per project)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatIndexEntry {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatIndex {
    #[serde(default)]
    pub chats: Vec<ChatIndexEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinnedChats {
    #[serde(default)]
    pub ids: BTreeSet<String>,
}

// ---------------------------------------------------------------------
// Ambient services: global state + config
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalState {
    #[serde(default)]
    pub favorites: BTreeSet<String>,
    #[serde(default)]
    pub last_model: Option<String>,
}

impl GlobalState {
    pub fn path() -> PathBuf {
        home_dir().join(".bb7").join("state.json")
    }

    pub fn load() -> Result<Self> {
        let path = Self::path();
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(&path)
    }

    pub fn save(&self) -> Result<()> {
        atomic_write_json(&Self::path(), self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_model: Option<String>,
    pub allow_training: bool,
    pub allow_data_retention: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit_cache_key: Option<String>,
    pub auto_retry_partial_edits: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            default_model: None,
            title_model: None,
            allow_training: false,
            allow_data_retention: false,
            explicit_cache_key: None,
            auto_retry_partial_edits: false,
        }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        config_dir().join("config.json")
    }

    /// Loads `~/.config/bb7/config.json`, validating `api_key` is present.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if !path.exists() {
            return Err(BbError::config(format!(
                "config file not found at {}",
                path.display()
            )));
        }
        let cfg: Config = read_json(&path)
            .map_err(|e| BbError::config(format!("could not parse config: {e}")))?;
        if cfg.api_key.trim().is_empty() {
            return Err(BbError::config("api_key is missing from config"));
        }
        Ok(cfg)
    }
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"))
        .join("bb7")
}

pub fn global_dir() -> PathBuf {
    home_dir().join(".bb7")
}

pub fn logs_dir() -> PathBuf {
    global_dir().join("logs")
}

pub fn debug_enabled() -> bool {
    std::env::var("BB7_DEBUG").map(|v| v == "1").unwrap_or(false) || global_dir().join("debug").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_is_a_pure_function_of_path_and_content() {
        let a = file_id("src/main.go", b"package main\n");
        let b = file_id("src/main.go", b"package main\n");
        let c = file_id("src/other.go", b"package main\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn part_round_trips_through_json() {
        let part = Part::context_event(ContextEventAction::UserAddFile, "src/a.rs")
            .with_version("abcd1234");
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "context_event");
        assert_eq!(value["action"], "UserAddFile");
        let back: Part = serde_json::from_value(value).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn unknown_part_type_is_preserved_as_raw() {
        let value = json!({"type": "future_kind", "payload": 42});
        let part: Part = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(part, Part::Raw { value: value.clone() });
        assert_eq!(serde_json::to_value(&part).unwrap(), value);
    }

    #[test]
    fn chat_message_tags_by_role() {
        let msg = ChatMessage::User {
            parts: vec![Part::text("hi")],
            model: None,
            timestamp: None,
            context_snapshot: vec![],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "user");
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn atomic_write_survives_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        let tmp_leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(tmp_leftovers.is_empty());
    }
}
