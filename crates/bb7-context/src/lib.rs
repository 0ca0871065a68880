//! In-memory context manager. Every mutating operation here takes the
//! active `Chat` by mutable reference and the `Store` for the on-disk
//! side effects, and an explicit `locked` flag standing in for "a stream
//! is currently in flight" — the coordinator owns that state, this crate
//! just enforces the rule once it is told.

use bb7_core::{Chat, ChatMessage, ContextEventAction, ContextFileEntry, Part, file_id, section_hash};
use bb7_errors::{BbError, Result};
use bb7_sandbox::RootKind;
use bb7_store::Store;
use std::fs;
use std::path::PathBuf;

const BUSY_MESSAGE: &str = "Cannot modify context while a request is active";

fn check_unlocked(locked: bool) -> Result<()> {
    if locked {
        return Err(BbError::busy(BUSY_MESSAGE));
    }
    Ok(())
}

/// Append `part` to the chat's currently-open message, or a synthetic
/// system message when no user/assistant message is under construction.
fn push_event(chat: &mut Chat, part: Part) {
    if let Some(last) = chat.messages.last_mut() {
        if matches!(last, ChatMessage::User { .. } | ChatMessage::Assistant { .. }) {
            last.parts_mut().push(part);
            return;
        }
    }
    let mut msg = ChatMessage::system(String::new());
    msg.parts_mut().clear();
    msg.parts_mut().push(part);
    chat.messages.push(msg);
}

pub fn context_add(
    store: &Store,
    chat: &mut Chat,
    path: &str,
    content: &[u8],
    readonly: bool,
    external: bool,
    locked: bool,
) -> Result<()> {
    check_unlocked(locked)?;
    if chat.full_entry(path).is_some() {
        return Err(BbError::conflict(format!("context already has {path}")));
    }
    let id = file_id(path, content);
    if external {
        store.write_external_file(&chat.id, &id, content)?;
    } else {
        store.write_context_file(&chat.id, path, content)?;
    }
    chat.context_files.push(ContextFileEntry {
        path: path.to_string(),
        readonly,
        external,
        file_id: id.clone(),
        start_line: None,
        end_line: None,
    });
    chat.record_context_event(ContextEventAction::UserAddFile, path);
    if let Some(last) = chat.messages.last_mut() {
        if let Some(part) = last.parts_mut().last_mut() {
            *part = std::mem::replace(part, part.clone()).with_version(id).with_readonly(readonly);
        }
    }
    Ok(())
}

pub fn context_add_section(
    store: &Store,
    chat: &mut Chat,
    path: &str,
    content: &[u8],
    start_line: u32,
    end_line: u32,
    locked: bool,
) -> Result<()> {
    check_unlocked(locked)?;
    let hash = section_hash(path, start_line, end_line, content);
    store.write_section_file(&chat.id, &hash, content)?;
    chat.context_files.push(ContextFileEntry {
        path: path.to_string(),
        readonly: true,
        external: false,
        file_id: hash.clone(),
        start_line: Some(start_line),
        end_line: Some(end_line),
    });
    chat.record_context_event(ContextEventAction::UserAddSection, path);
    if let Some(last) = chat.messages.last_mut() {
        if let Some(part) = last.parts_mut().last_mut() {
            *part = std::mem::replace(part, part.clone())
                .with_version(hash)
                .with_range(start_line, end_line);
        }
    }
    Ok(())
}

pub fn context_remove(store: &Store, chat: &mut Chat, path: &str, locked: bool) -> Result<()> {
    check_unlocked(locked)?;
    let Some(pos) = chat
        .context_files
        .iter()
        .position(|e| e.path == path && !e.is_section())
    else {
        return Err(BbError::not_found(format!("context entry {path}")));
    };
    let entry = chat.context_files.remove(pos);
    if entry.external {
        store.remove_external_file(&chat.id, &entry.file_id)?;
    } else {
        store.remove_context_file(&chat.id, path)?;
    }
    chat.record_context_event(ContextEventAction::UserRemoveFile, path);
    Ok(())
}

pub fn context_remove_section(
    store: &Store,
    chat: &mut Chat,
    path: &str,
    start_line: u32,
    end_line: u32,
    locked: bool,
) -> Result<()> {
    check_unlocked(locked)?;
    let Some(pos) = chat.context_files.iter().position(|e| {
        e.path == path && e.start_line == Some(start_line) && e.end_line == Some(end_line)
    }) else {
        return Err(BbError::not_found(format!(
            "context section {path}:{start_line}-{end_line}"
        )));
    };
    let entry = chat.context_files.remove(pos);
    if chat.section_refcount(&entry.file_id) == 0 {
        store.remove_section_file(&chat.id, &entry.file_id)?;
    }
    chat.record_context_event(ContextEventAction::UserRemoveSection, path);
    Ok(())
}

pub struct UpdateOutcome {
    pub output_invalidated: bool,
}

/// Replace a full context entry's snapshot in place. Sections are
/// immutable and have no update operation.
pub fn context_update(
    store: &Store,
    chat: &mut Chat,
    path: &str,
    content: &[u8],
    locked: bool,
) -> Result<UpdateOutcome> {
    check_unlocked(locked)?;
    let prev_id = {
        let entry = chat
            .full_entry(path)
            .ok_or_else(|| BbError::not_found(format!("context entry {path}")))?;
        entry.file_id.clone()
    };
    let new_id = file_id(path, content);
    store.write_context_file(&chat.id, path, content)?;
    if let Some(entry) = chat.full_entry_mut(path) {
        entry.file_id = new_id.clone();
    }

    let output_invalidated = store.output_file_exists(&chat.id, path);
    if output_invalidated {
        store.remove_output_file(&chat.id, path)?;
    }

    if let Some(last) = chat.messages.last_mut() {
        if matches!(last, bb7_core::ChatMessage::User { .. } | bb7_core::ChatMessage::Assistant { .. }) {
            last.parts_mut().push(
                bb7_core::Part::context_event(ContextEventAction::UserWriteFile, path)
                    .with_version(new_id)
                    .with_prev_version(prev_id),
            );
            return Ok(UpdateOutcome { output_invalidated });
        }
    }
    chat.record_context_event(ContextEventAction::UserWriteFile, path);
    Ok(UpdateOutcome { output_invalidated })
}

pub fn context_set_readonly(
    chat: &mut Chat,
    path: &str,
    readonly: bool,
    locked: bool,
) -> Result<()> {
    check_unlocked(locked)?;
    let entry = chat
        .full_entry_mut(path)
        .ok_or_else(|| BbError::not_found(format!("context entry {path}")))?;
    entry.readonly = readonly;
    chat.record_context_event(ContextEventAction::UserSetReadOnly, path);
    if let Some(last) = chat.messages.last_mut() {
        if let Some(part) = last.parts_mut().last_mut() {
            *part = std::mem::replace(part, part.clone()).with_readonly(readonly);
        }
    }
    Ok(())
}

/// Copy `output/<path>` over the project file at `destination` (default:
/// `path`), promote the new bytes into the context snapshot when writing
/// back to the same path, and discard the output entry either way.
pub fn apply_file(
    store: &Store,
    chat: &mut Chat,
    project_root: &std::path::Path,
    path: &str,
    destination: Option<&str>,
    locked: bool,
) -> Result<()> {
    check_unlocked(locked)?;
    let bytes = store.read_output_file(&chat.id, path)?;
    let target = destination.unwrap_or(path);
    let local_path = bb7_sandbox::resolve(RootKind::ProjectRoot, project_root, target)?;
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&local_path, &bytes)?;

    let is_save_as = destination.is_some() && destination != Some(path);
    if !is_save_as {
        let new_id = file_id(path, &bytes);
        store.write_context_file(&chat.id, path, &bytes)?;
        match chat.full_entry_mut(path) {
            Some(entry) => entry.file_id = new_id,
            None => chat.context_files.push(ContextFileEntry {
                path: path.to_string(),
                readonly: false,
                external: false,
                file_id: new_id,
                start_line: None,
                end_line: None,
            }),
        }
        chat.record_context_event(ContextEventAction::UserApplyFile, path);
    } else {
        chat.record_context_event(ContextEventAction::UserSaveAs, target);
    }
    store.remove_output_file(&chat.id, path)?;
    Ok(())
}

pub fn output_delete(store: &Store, chat: &mut Chat, path: &str, locked: bool) -> Result<()> {
    check_unlocked(locked)?;
    if !store.output_file_exists(&chat.id, path) {
        return Err(BbError::not_found(format!("output {path}")));
    }
    store.remove_output_file(&chat.id, path)?;
    chat.record_context_event(ContextEventAction::UserRejectOutput, path);
    Ok(())
}

pub fn context_list(chat: &Chat) -> &[ContextFileEntry] {
    &chat.context_files
}

pub fn get_context_file(store: &Store, chat: &Chat, path: &str) -> Result<Vec<u8>> {
    let entry = chat
        .full_entry(path)
        .or_else(|| chat.context_files.iter().find(|e| e.path == path))
        .ok_or_else(|| BbError::not_found(format!("context entry {path}")))?;
    if entry.external {
        store.read_external_file(&chat.id, &entry.file_id)
    } else if entry.is_section() {
        store.read_section_file(&chat.id, &entry.file_id)
    } else {
        store.read_context_file(&chat.id, path)
    }
}

pub fn get_output_file(store: &Store, chat: &Chat, path: &str) -> Result<Vec<u8>> {
    store.read_output_file(&chat.id, path)
}

pub struct DiffPaths {
    pub context_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
}

pub fn get_diff_paths(store: &Store, chat: &Chat, path: &str) -> Result<DiffPaths> {
    let context_path = if chat.full_entry(path).is_some() {
        Some(store.context_file_path(&chat.id, path)?)
    } else {
        None
    };
    let output_path = if store.output_file_exists(&chat.id, path) {
        Some(store.output_file_path(&chat.id, path))
    } else {
        None
    };
    Ok(DiffPaths {
        context_path,
        output_path,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Blank,
    Modified,
    Added,
    AddedConflict,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileStatusEntry {
    pub path: String,
    pub status: FileStatus,
}

/// Derive each known path's status from whether it has a pending output
/// and whether that output differs from the current context snapshot.
pub fn get_file_statuses(
    store: &Store,
    chat: &Chat,
    project_root: &std::path::Path,
) -> Result<Vec<FileStatusEntry>> {
    let mut paths: Vec<String> = chat
        .context_files
        .iter()
        .filter(|e| !e.is_section())
        .map(|e| e.path.clone())
        .collect();
    for path in store.list_output_files(&chat.id)? {
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    paths.dedup();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let has_output = store.output_file_exists(&chat.id, &path);
        let context_entry = chat.full_entry(&path);
        let status = match (context_entry, has_output) {
            (_, false) => FileStatus::Blank,
            (Some(entry), true) => {
                let output_bytes = store.read_output_file(&chat.id, &path)?;
                let output_id = file_id(&path, &output_bytes);
                if output_id == entry.file_id {
                    FileStatus::Blank
                } else {
                    FileStatus::Modified
                }
            }
            (None, true) => {
                if project_root.join(&path).exists() {
                    FileStatus::AddedConflict
                } else {
                    FileStatus::Added
                }
            }
        };
        out.push(FileStatusEntry { path, status });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb7_core::Chat;

    fn setup() -> (tempfile::TempDir, Store, Chat) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init().unwrap();
        let chat = store.chat_new(None).unwrap();
        (dir, store, chat)
    }

    #[test]
    fn add_then_duplicate_add_conflicts() {
        let (_dir, store, mut chat) = setup();
        context_add(&store, &mut chat, "a.txt", b"hi", false, false, false).unwrap();
        let err = context_add(&store, &mut chat, "a.txt", b"hi2", false, false, false).unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn mutation_blocked_while_locked() {
        let (_dir, store, mut chat) = setup();
        let err = context_add(&store, &mut chat, "a.txt", b"hi", false, false, true).unwrap_err();
        assert!(err.to_string().contains("Cannot modify context while a request is active"));
    }

    #[test]
    fn remove_drops_refcounted_section_only_when_last_reference_gone() {
        let (_dir, store, mut chat) = setup();
        context_add_section(&store, &mut chat, "a.txt", b"body", 1, 2, false).unwrap();
        let file_id = chat.context_files[0].file_id.clone();
        // Simulate a second logical reference to the same hash by pushing
        // a duplicate entry directly (as a second add with identical range
        // would naturally dedupe to the same hash).
        chat.context_files.push(ContextFileEntry {
            path: "a.txt".into(),
            readonly: true,
            external: false,
            file_id: file_id.clone(),
            start_line: Some(1),
            end_line: Some(2),
        });
        context_remove_section(&store, &mut chat, "a.txt", 1, 2, false).unwrap();
        assert!(store.read_section_file(&chat.id, &file_id).is_ok());
        context_remove_section(&store, &mut chat, "a.txt", 1, 2, false).unwrap();
        assert!(store.read_section_file(&chat.id, &file_id).is_err());
    }

    #[test]
    fn update_invalidates_pending_output_for_same_path() {
        let (_dir, store, mut chat) = setup();
        context_add(&store, &mut chat, "a.txt", b"one", false, false, false).unwrap();
        store.write_output_file(&chat.id, "a.txt", b"two").unwrap();
        let outcome = context_update(&store, &mut chat, "a.txt", b"three", false).unwrap();
        assert!(outcome.output_invalidated);
        assert!(!store.output_file_exists(&chat.id, "a.txt"));
    }

    #[test]
    fn apply_file_promotes_output_into_context() {
        let (dir, store, mut chat) = setup();
        context_add(&store, &mut chat, "a.txt", b"one", false, false, false).unwrap();
        store.write_output_file(&chat.id, "a.txt", b"two").unwrap();
        apply_file(&store, &mut chat, dir.path(), "a.txt", None, false).unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"two");
        assert!(!store.output_file_exists(&chat.id, "a.txt"));
        assert_eq!(
            chat.full_entry("a.txt").unwrap().file_id,
            file_id("a.txt", b"two")
        );
    }

    #[test]
    fn apply_file_blocked_while_locked() {
        let (dir, store, mut chat) = setup();
        context_add(&store, &mut chat, "a.txt", b"one", false, false, false).unwrap();
        store.write_output_file(&chat.id, "a.txt", b"two").unwrap();
        let err = apply_file(&store, &mut chat, dir.path(), "a.txt", None, true).unwrap_err();
        assert!(err.to_string().contains("Cannot modify context while a request is active"));
    }

    #[test]
    fn statuses_cover_blank_modified_added_and_conflicting() {
        let (dir, store, mut chat) = setup();
        context_add(&store, &mut chat, "blank.txt", b"x", false, false, false).unwrap();
        context_add(&store, &mut chat, "mod.txt", b"x", false, false, false).unwrap();
        store.write_output_file(&chat.id, "mod.txt", b"y").unwrap();
        store.write_output_file(&chat.id, "new.txt", b"z").unwrap();
        store.write_output_file(&chat.id, "conflict.txt", b"z").unwrap();
        fs::write(dir.path().join("conflict.txt"), b"local").unwrap();

        let statuses = get_file_statuses(&store, &chat, dir.path()).unwrap();
        let status = |p: &str| statuses.iter().find(|s| s.path == p).unwrap().status.clone();
        assert_eq!(status("blank.txt"), FileStatus::Blank);
        assert_eq!(status("mod.txt"), FileStatus::Modified);
        assert_eq!(status("new.txt"), FileStatus::Added);
        assert_eq!(status("conflict.txt"), FileStatus::AddedConflict);
    }
}
