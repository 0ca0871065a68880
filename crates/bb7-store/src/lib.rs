//! On-disk chat persistence. Directory layout per project:
//!
//! ```text
//! <project>/.bb7/
//!   instructions
//!   pinned_chats.json
//!   chats/
//!     index.json
//!     <chat-id>/
//!       chat.json
//!       context/<path>
//!       context/_sections/<hash>
//!       output/<path>
//! ```
//!
//! Every write here is atomic (temp file + rename, via `bb7_core::atomic_write`)
//! and the index is a denormalised view rebuilt defensively if it goes
//! missing or fails to parse.

use bb7_core::{
    Chat, ChatIndex, ChatIndexEntry, ChatMessage, ContextSnapshotEntry, CURRENT_CHAT_VERSION,
    PinnedChats, atomic_write, atomic_write_json,
};
use bb7_errors::{BbError, Result};
use bb7_sandbox::RootKind;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

pub struct Store {
    project_root: PathBuf,
}

impl Store {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Store {
            project_root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn bb7_dir(&self) -> PathBuf {
        self.project_root.join(".bb7")
    }

    pub fn instructions_path(&self) -> PathBuf {
        self.bb7_dir().join("instructions")
    }

    pub fn pinned_path(&self) -> PathBuf {
        self.bb7_dir().join("pinned_chats.json")
    }

    pub fn chats_dir(&self) -> PathBuf {
        self.bb7_dir().join("chats")
    }

    pub fn index_path(&self) -> PathBuf {
        self.chats_dir().join("index.json")
    }

    pub fn chat_dir(&self, id: &str) -> PathBuf {
        self.chats_dir().join(id)
    }

    pub fn chat_path(&self, id: &str) -> PathBuf {
        self.chat_dir(id).join("chat.json")
    }

    pub fn context_dir(&self, id: &str) -> PathBuf {
        self.chat_dir(id).join("context")
    }

    pub fn sections_dir(&self, id: &str) -> PathBuf {
        self.context_dir(id).join("_sections")
    }

    /// Snapshot storage for `external` full-file entries (absolute paths
    /// outside the project): keyed by `file_id` rather than `path`, the
    /// same content-addressed shape as sections, since an arbitrary
    /// absolute path can't be rooted under `context/<path>` safely.
    pub fn external_dir(&self, id: &str) -> PathBuf {
        self.context_dir(id).join("_external")
    }

    pub fn output_dir(&self, id: &str) -> PathBuf {
        self.chat_dir(id).join("output")
    }

    pub fn is_initialised(&self) -> bool {
        self.bb7_dir().is_dir()
    }

    /// `bb7_init`: ensure `.bb7/chats/` and an empty index exist.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.chats_dir())?;
        if !self.index_path().exists() {
            atomic_write_json(&self.index_path(), &ChatIndex::default())?;
        }
        if !self.pinned_path().exists() {
            atomic_write_json(&self.pinned_path(), &PinnedChats::default())?;
        }
        Ok(())
    }

    fn require_initialised(&self) -> Result<()> {
        if !self.is_initialised() {
            return Err(BbError::not_initialised(
                "project has no .bb7 directory; run bb7_init first",
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------
    // Index + pinned chats
    // -------------------------------------------------------------

    fn load_index(&self) -> Result<ChatIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(self.rebuild_index()?);
        }
        match fs::read(&path).map_err(BbError::from).and_then(|raw| {
            serde_json::from_slice::<ChatIndex>(&raw).map_err(BbError::from)
        }) {
            Ok(index) => Ok(index),
            Err(_) => self.rebuild_index(),
        }
    }

    /// Rebuild `index.json` by scanning `chats/*/chat.json` directly. Used
    /// when the index is missing or fails to parse, the same defensive
    /// posture a corrupt cache warrants elsewhere.
    fn rebuild_index(&self) -> Result<ChatIndex> {
        let mut entries = Vec::new();
        let pinned = self.load_pinned().unwrap_or_default();
        if let Ok(read_dir) = fs::read_dir(self.chats_dir()) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let chat_json = path.join("chat.json");
                if !chat_json.exists() {
                    continue;
                }
                if let Ok(raw) = fs::read(&chat_json) {
                    if let Ok(value) = serde_json::from_slice::<Value>(&raw) {
                        let id = value
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let name = value
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("untitled")
                            .to_string();
                        let created = value
                            .get("created")
                            .and_then(Value::as_str)
                            .and_then(|s| s.parse().ok())
                            .unwrap_or_else(Utc::now);
                        entries.push(ChatIndexEntry {
                            pinned: pinned.ids.contains(&id),
                            id,
                            name,
                            created,
                        });
                    }
                }
            }
        }
        entries.sort_by(|a, b| b.created.cmp(&a.created));
        let index = ChatIndex { chats: entries };
        atomic_write_json(&self.index_path(), &index)?;
        Ok(index)
    }

    fn save_index(&self, index: &ChatIndex) -> Result<()> {
        atomic_write_json(&self.index_path(), index)
    }

    fn load_pinned(&self) -> Result<PinnedChats> {
        let path = self.pinned_path();
        if !path.exists() {
            return Ok(PinnedChats::default());
        }
        Ok(bb7_core::read_json(&path)?)
    }

    fn save_pinned(&self, pinned: &PinnedChats) -> Result<()> {
        atomic_write_json(&self.pinned_path(), pinned)
    }

    pub fn pin(&self, id: &str) -> Result<()> {
        self.require_initialised()?;
        let mut pinned = self.load_pinned()?;
        pinned.ids.insert(id.to_string());
        self.save_pinned(&pinned)?;
        self.sync_index_pin(id, true)
    }

    pub fn unpin(&self, id: &str) -> Result<()> {
        self.require_initialised()?;
        let mut pinned = self.load_pinned()?;
        pinned.ids.remove(id);
        self.save_pinned(&pinned)?;
        self.sync_index_pin(id, false)
    }

    fn sync_index_pin(&self, id: &str, pinned: bool) -> Result<()> {
        let mut index = self.load_index()?;
        if let Some(entry) = index.chats.iter_mut().find(|e| e.id == id) {
            entry.pinned = pinned;
        }
        self.save_index(&index)
    }

    // -------------------------------------------------------------
    // Chat lifecycle
    // -------------------------------------------------------------

    pub fn chat_list(&self) -> Result<Vec<ChatIndexEntry>> {
        self.require_initialised()?;
        let mut index = self.load_index()?;
        index.chats.sort_by(|a, b| match (b.pinned, a.pinned) {
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            _ => b.created.cmp(&a.created),
        });
        Ok(index.chats)
    }

    pub fn chat_new(&self, name: Option<String>) -> Result<Chat> {
        self.require_initialised()?;
        let id = Chat::new_id();
        let name = name.unwrap_or_else(|| "New chat".to_string());
        let chat = Chat::new(id.clone(), name.clone());
        fs::create_dir_all(self.context_dir(&id))?;
        fs::create_dir_all(self.sections_dir(&id))?;
        fs::create_dir_all(self.output_dir(&id))?;
        self.save_chat(&chat)?;

        let mut index = self.load_index()?;
        index.chats.push(ChatIndexEntry {
            id,
            name,
            created: chat.created,
            pinned: false,
        });
        self.save_index(&index)?;
        Ok(chat)
    }

    pub fn chat_exists(&self, id: &str) -> bool {
        self.chat_path(id).exists()
    }

    pub fn chat_get(&self, id: &str) -> Result<Chat> {
        self.require_initialised()?;
        let path = self.chat_path(id);
        if !path.exists() {
            return Err(BbError::not_found(format!("chat {id}")));
        }
        let raw: Value = serde_json::from_slice(&fs::read(&path)?)?;
        let original_version = raw.get("version").and_then(Value::as_u64).unwrap_or(0);
        let chat = migrate_legacy_chat(raw)?;
        if original_version < CURRENT_CHAT_VERSION as u64 {
            self.save_chat(&chat)?;
        }
        Ok(chat)
    }

    pub fn save_chat(&self, chat: &Chat) -> Result<()> {
        atomic_write_json(&self.chat_path(&chat.id), chat)
    }

    pub fn chat_delete(&self, id: &str) -> Result<()> {
        self.require_initialised()?;
        if !self.chat_exists(id) {
            return Err(BbError::not_found(format!("chat {id}")));
        }
        fs::remove_dir_all(self.chat_dir(id))?;
        let mut index = self.load_index()?;
        index.chats.retain(|e| e.id != id);
        self.save_index(&index)?;
        let mut pinned = self.load_pinned()?;
        if pinned.ids.remove(id) {
            self.save_pinned(&pinned)?;
        }
        Ok(())
    }

    pub fn chat_rename(&self, id: &str, name: &str) -> Result<Chat> {
        let mut chat = self.chat_get(id)?;
        chat.name = name.to_string();
        self.save_chat(&chat)?;
        let mut index = self.load_index()?;
        if let Some(entry) = index.chats.iter_mut().find(|e| e.id == id) {
            entry.name = name.to_string();
        }
        self.save_index(&index)?;
        Ok(chat)
    }

    pub fn save_chat_settings(
        &self,
        id: &str,
        model: Option<String>,
        reasoning_effort: Option<String>,
    ) -> Result<Chat> {
        let mut chat = self.chat_get(id)?;
        if model.is_some() {
            chat.model = model;
        }
        if reasoning_effort.is_some() {
            chat.reasoning_effort = reasoning_effort;
        }
        self.save_chat(&chat)?;
        Ok(chat)
    }

    pub fn save_draft(&self, id: &str, draft: &str) -> Result<()> {
        let mut chat = self.chat_get(id)?;
        chat.draft = draft.to_string();
        self.save_chat(&chat)
    }

    // -------------------------------------------------------------
    // Context/output file paths (used by bb7-context)
    // -------------------------------------------------------------

    pub fn context_file_path(&self, id: &str, rel_path: &str) -> Result<PathBuf> {
        bb7_sandbox::resolve(RootKind::ChatDir, &self.context_dir(id), rel_path)
    }

    pub fn section_file_path(&self, id: &str, hash: &str) -> Result<PathBuf> {
        bb7_sandbox::resolve(RootKind::ChatDir, &self.sections_dir(id), hash)
    }

    pub fn external_file_path(&self, id: &str, file_id: &str) -> Result<PathBuf> {
        bb7_sandbox::resolve(RootKind::ChatDir, &self.external_dir(id), file_id)
    }

    pub fn output_file_path(&self, id: &str, rel_path: &str) -> PathBuf {
        bb7_sandbox::resolve_output(&self.output_dir(id), rel_path)
    }

    pub fn write_context_file(&self, id: &str, rel_path: &str, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.context_file_path(id, rel_path)?, bytes)
    }

    pub fn write_section_file(&self, id: &str, hash: &str, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.section_file_path(id, hash)?, bytes)
    }

    pub fn write_external_file(&self, id: &str, file_id: &str, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.external_file_path(id, file_id)?, bytes)
    }

    pub fn read_context_file(&self, id: &str, rel_path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.context_file_path(id, rel_path)?)?)
    }

    pub fn read_section_file(&self, id: &str, hash: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.section_file_path(id, hash)?)?)
    }

    pub fn read_external_file(&self, id: &str, file_id: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.external_file_path(id, file_id)?)?)
    }

    pub fn remove_context_file(&self, id: &str, rel_path: &str) -> Result<()> {
        let path = self.context_file_path(id, rel_path)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn remove_section_file(&self, id: &str, hash: &str) -> Result<()> {
        let path = self.section_file_path(id, hash)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn remove_external_file(&self, id: &str, file_id: &str) -> Result<()> {
        let path = self.external_file_path(id, file_id)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn read_output_file(&self, id: &str, rel_path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.output_file_path(id, rel_path))?)
    }

    pub fn write_output_file(&self, id: &str, rel_path: &str, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.output_file_path(id, rel_path), bytes)
    }

    pub fn remove_output_file(&self, id: &str, rel_path: &str) -> Result<()> {
        let path = self.output_file_path(id, rel_path);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn output_file_exists(&self, id: &str, rel_path: &str) -> bool {
        self.output_file_path(id, rel_path).exists()
    }

    /// Project-root-relative paths of every file currently pending under
    /// `output/`, used to derive file statuses for paths that have no
    /// context entry at all (a brand-new file the assistant wrote).
    pub fn list_output_files(&self, id: &str) -> Result<Vec<String>> {
        let root = self.output_dir(id);
        let mut out = Vec::new();
        if root.is_dir() {
            walk_relative(&root, &root, &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    // -------------------------------------------------------------
    // Fork / edit-in-place
    // -------------------------------------------------------------

    pub fn fork_chat(&self, src_id: &str, fork_message_index: usize) -> Result<(Chat, Vec<ContextWarning>)> {
        let src = self.chat_get(src_id)?;
        if fork_message_index >= src.messages.len() {
            return Err(BbError::not_found(format!(
                "message index {fork_message_index} in chat {src_id}"
            )));
        }
        let target_message = &src.messages[fork_message_index];
        let snapshot = target_message_snapshot(target_message);
        let draft = target_message.text_content();

        let (restored, warnings) = restore_context(&src, &snapshot);

        let new_id = Chat::new_id();
        let mut new_chat = Chat::new(new_id.clone(), format!("{} (fork)", src.name));
        new_chat.messages = src.messages[..fork_message_index].to_vec();
        new_chat.model = src.model.clone();
        new_chat.reasoning_effort = src.reasoning_effort.clone();
        new_chat.draft = draft;
        new_chat.context_files = restored.clone();

        fs::create_dir_all(self.context_dir(&new_id))?;
        fs::create_dir_all(self.sections_dir(&new_id))?;
        fs::create_dir_all(self.output_dir(&new_id))?;

        for entry in &restored {
            if entry.is_section() {
                let hash = entry.file_id.clone();
                if let Ok(bytes) = self.read_section_file(src_id, &hash) {
                    self.write_section_file(&new_id, &hash, &bytes)?;
                }
            } else if entry.external {
                if let Ok(bytes) = self.read_external_file(src_id, &entry.file_id) {
                    self.write_external_file(&new_id, &entry.file_id, &bytes)?;
                }
            } else if let Ok(bytes) = self.read_context_file(src_id, &entry.path) {
                self.write_context_file(&new_id, &entry.path, &bytes)?;
            }
        }

        record_fork_warnings(&mut new_chat, &warnings);
        self.save_chat(&new_chat)?;

        let mut index = self.load_index()?;
        index.chats.push(ChatIndexEntry {
            id: new_id,
            name: new_chat.name.clone(),
            created: new_chat.created,
            pinned: false,
        });
        self.save_index(&index)?;

        Ok((new_chat, warnings))
    }

    pub fn chat_edit(
        &self,
        chat_id: &str,
        message_index: usize,
        content: &str,
    ) -> Result<(Chat, Vec<ContextWarning>)> {
        let mut chat = self.chat_get(chat_id)?;
        if message_index >= chat.messages.len() {
            return Err(BbError::not_found(format!(
                "message index {message_index} in chat {chat_id}"
            )));
        }
        let target_message = chat.messages[message_index].clone();
        let snapshot = target_message_snapshot(&target_message);
        let (restored, warnings) = restore_context(&chat, &snapshot);

        chat.messages.truncate(message_index);
        chat.draft = content.to_string();
        chat.context_files = restored;
        record_fork_warnings(&mut chat, &warnings);
        self.save_chat(&chat)?;
        Ok((chat, warnings))
    }

    // -------------------------------------------------------------
    // Search
    // -------------------------------------------------------------

    pub fn search_chats(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.require_initialised()?;
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let needle = query.to_lowercase();
        let mut titles = Vec::new();
        let mut contents = Vec::new();
        for entry in self.chat_list()? {
            if entry.name.to_lowercase().contains(&needle) {
                titles.push(SearchResult {
                    chat_id: entry.id.clone(),
                    chat_name: entry.name.clone(),
                    match_type: MatchType::Title,
                    excerpt: None,
                });
                continue;
            }
            if let Ok(chat) = self.chat_get(&entry.id) {
                for message in &chat.messages {
                    let text = message.text_content();
                    let lower = text.to_lowercase();
                    if let Some(byte_pos) = lower.find(&needle) {
                        contents.push(SearchResult {
                            chat_id: entry.id.clone(),
                            chat_name: entry.name.clone(),
                            match_type: MatchType::Content,
                            excerpt: Some(excerpt_around(&text, byte_pos, needle.len())),
                        });
                        break;
                    }
                }
            }
        }
        titles.extend(contents);
        Ok(titles)
    }
}

fn walk_relative(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_relative(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Legacy migration (chat.json version 0/1 -> 2)
// ---------------------------------------------------------------------

fn migrate_legacy_chat(mut raw: Value) -> Result<Chat> {
    let version = raw.get("version").and_then(Value::as_u64).unwrap_or(0);
    if version >= CURRENT_CHAT_VERSION as u64 {
        return Ok(serde_json::from_value(raw)?);
    }
    if let Some(messages) = raw.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages.iter_mut() {
            let Some(obj) = message.as_object_mut() else {
                continue;
            };
            if !obj.contains_key("parts") {
                let legacy_text = obj
                    .remove("content")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                obj.insert("parts".into(), json!([{"type": "text", "text": legacy_text}]));
            }
            if obj.get("role").and_then(Value::as_str) == Some("user")
                && !obj.contains_key("context_snapshot")
            {
                obj.insert("context_snapshot".into(), json!([]));
            }
            if obj.get("role").and_then(Value::as_str) == Some("assistant")
                && !obj.contains_key("output_files")
            {
                obj.insert("output_files".into(), json!([]));
            }
            // Schema-0 user messages occasionally lack a timestamp. Leave
            // it absent rather than synthesising one.
        }
    }
    raw["version"] = json!(CURRENT_CHAT_VERSION);
    Ok(serde_json::from_value(raw)?)
}

// ---------------------------------------------------------------------
// Fork / edit context restoration
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningIssue {
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextWarning {
    pub path: String,
    pub issue: WarningIssue,
    pub original_version: String,
}

fn target_message_snapshot(message: &ChatMessage) -> Vec<ContextSnapshotEntry> {
    match message {
        ChatMessage::User { context_snapshot, .. } => context_snapshot.clone(),
        _ => Vec::new(),
    }
}

/// Filter `chat`'s *current* context entries down to the subset named by
/// `snapshot`, flagging entries that no longer exist or whose content has
/// since changed. The store keeps only one live copy per context entry,
/// so "restoring" means picking the current bytes for whatever of the
/// snapshot's paths survive — not reconstructing historical content.
fn restore_context(
    chat: &Chat,
    snapshot: &[ContextSnapshotEntry],
) -> (Vec<bb7_core::ContextFileEntry>, Vec<ContextWarning>) {
    let mut entries = Vec::new();
    let mut warnings = Vec::new();
    for snap in snapshot {
        let current = if snap.start.is_some() {
            chat.context_files.iter().find(|e| {
                e.path == snap.path && e.start_line == snap.start && e.end_line == snap.end
            })
        } else {
            chat.full_entry(&snap.path)
        };
        match current {
            None => warnings.push(ContextWarning {
                path: snap.path.clone(),
                issue: WarningIssue::Deleted,
                original_version: snap.file_id.clone(),
            }),
            Some(entry) => {
                if entry.file_id != snap.file_id {
                    warnings.push(ContextWarning {
                        path: snap.path.clone(),
                        issue: WarningIssue::Modified,
                        original_version: snap.file_id.clone(),
                    });
                }
                entries.push(entry.clone());
            }
        }
    }
    (entries, warnings)
}

fn record_fork_warnings(chat: &mut Chat, warnings: &[ContextWarning]) {
    use bb7_core::ContextEventAction;
    for warning in warnings {
        let action = match warning.issue {
            WarningIssue::Modified => ContextEventAction::ForkWarningModified,
            WarningIssue::Deleted => ContextEventAction::ForkWarningDeleted,
        };
        chat.record_context_event(action, &warning.path);
    }
}

// ---------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Title,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub chat_id: String,
    pub chat_name: String,
    pub match_type: MatchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

fn boundary_floor(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn boundary_ceil(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn excerpt_around(haystack: &str, match_byte_start: usize, match_byte_len: usize) -> String {
    const WINDOW: usize = 40;
    let start = boundary_floor(haystack, match_byte_start.saturating_sub(WINDOW));
    let end = boundary_ceil(haystack, (match_byte_start + match_byte_len + WINDOW).min(haystack.len()));
    let mut out = String::new();
    if start > 0 {
        out.push('\u{2026}');
    }
    out.push_str(&haystack[start..end]);
    if end < haystack.len() {
        out.push('\u{2026}');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb7_core::{ContextFileEntry, Part};

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn chat_new_appears_in_chat_list() {
        let (_dir, store) = store();
        let chat = store.chat_new(Some("first".into())).unwrap();
        let list = store.chat_list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, chat.id);
        assert_eq!(list[0].name, "first");
    }

    #[test]
    fn chat_get_round_trips() {
        let (_dir, store) = store();
        let mut chat = store.chat_new(None).unwrap();
        chat.draft = "hello".into();
        store.save_chat(&chat).unwrap();
        let loaded = store.chat_get(&chat.id).unwrap();
        assert_eq!(loaded.draft, "hello");
    }

    #[test]
    fn chat_delete_removes_from_index_and_disk() {
        let (_dir, store) = store();
        let chat = store.chat_new(None).unwrap();
        store.chat_delete(&chat.id).unwrap();
        assert!(store.chat_list().unwrap().is_empty());
        assert!(!store.chat_dir(&chat.id).exists());
    }

    #[test]
    fn legacy_chat_is_migrated_on_load() {
        let (_dir, store) = store();
        let id = "legacy-1".to_string();
        fs::create_dir_all(store.chat_dir(&id)).unwrap();
        fs::create_dir_all(store.context_dir(&id)).unwrap();
        let legacy = json!({
            "id": id,
            "name": "legacy chat",
            "created": Utc::now().to_rfc3339(),
            "version": 1,
            "context_files": [],
            "messages": [
                {"role": "user", "content": "hi there"},
                {"role": "assistant", "content": "hello!", "timestamp": Utc::now().to_rfc3339()}
            ]
        });
        fs::write(store.chat_path(&id), serde_json::to_vec(&legacy).unwrap()).unwrap();

        let chat = store.chat_get(&id).unwrap();
        assert_eq!(chat.version, CURRENT_CHAT_VERSION);
        assert_eq!(chat.messages[0].text_content(), "hi there");

        let raw: Value = serde_json::from_slice(&fs::read(store.chat_path(&id)).unwrap()).unwrap();
        assert_eq!(raw["version"], CURRENT_CHAT_VERSION);
    }

    #[test]
    fn fork_chat_copies_prefix_and_flags_missing_context() {
        let (_dir, store) = store();
        let mut chat = store.chat_new(None).unwrap();
        chat.context_files.push(ContextFileEntry {
            path: "x".into(),
            readonly: false,
            external: false,
            file_id: "aaaaaaaa".into(),
            start_line: None,
            end_line: None,
        });
        chat.messages.push(ChatMessage::User {
            parts: vec![Part::text("first")],
            model: None,
            timestamp: Some(Utc::now()),
            context_snapshot: vec![],
        });
        chat.messages.push(ChatMessage::User {
            parts: vec![Part::text("do the thing")],
            model: None,
            timestamp: Some(Utc::now()),
            context_snapshot: vec![
                ContextSnapshotEntry {
                    path: "x".into(),
                    file_id: "aaaaaaaa".into(),
                    start: None,
                    end: None,
                },
                ContextSnapshotEntry {
                    path: "y".into(),
                    file_id: "bbbbbbbb".into(),
                    start: None,
                    end: None,
                },
            ],
        });
        store.write_context_file(&chat.id, "x", b"content").unwrap();
        // Simulate the file having changed since the snapshot.
        chat.context_files[0].file_id = "cccccccc".into();
        store.save_chat(&chat).unwrap();

        let (forked, warnings) = store.fork_chat(&chat.id, 1).unwrap();
        assert_eq!(forked.messages.len(), 1);
        assert_eq!(forked.draft, "do the thing");
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.path == "x" && w.issue == WarningIssue::Modified));
        assert!(warnings.iter().any(|w| w.path == "y" && w.issue == WarningIssue::Deleted));
        assert_eq!(store.read_context_file(&forked.id, "x").unwrap(), b"content");
    }

    #[test]
    fn search_chats_finds_title_before_content() {
        let (_dir, store) = store();
        let titled = store.chat_new(Some("needle title".into())).unwrap();
        let mut other = store.chat_new(Some("unrelated".into())).unwrap();
        other.messages.push(ChatMessage::User {
            parts: vec![Part::text("a needle in the haystack")],
            model: None,
            timestamp: Some(Utc::now()),
            context_snapshot: vec![],
        });
        store.save_chat(&other).unwrap();

        let results = store.search_chats("needle").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chat_id, titled.id);
        assert_eq!(results[0].match_type, MatchType::Title);
        assert_eq!(results[1].chat_id, other.id);
        assert_eq!(results[1].match_type, MatchType::Content);
        assert!(results[1].excerpt.as_ref().unwrap().contains("needle"));
    }
}
