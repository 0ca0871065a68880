//! Path sandbox.
//!
//! Every path argument the backend accepts is resolved against one
//! declared root — a project root, a chat directory, the user config
//! directory, or home — before it touches disk. Absolute paths,
//! `..`-traversal past the root, and symlinks that resolve outside the
//! root are all rejected. Output writes get an extra, fatal check: a
//! write that would land outside the chat's `output/` tree kills the
//! process rather than risk corrupting user state.

use bb7_errors::{BbError, Result};
use std::path::{Component, Path, PathBuf};

/// Which kind of root a path is being resolved against — carried only for
/// clearer violation messages, not for any behavioral difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    ProjectRoot,
    ChatDir,
    ConfigDir,
    Home,
}

impl RootKind {
    fn label(self) -> &'static str {
        match self {
            RootKind::ProjectRoot => "project root",
            RootKind::ChatDir => "chat directory",
            RootKind::ConfigDir => "config directory",
            RootKind::Home => "home directory",
        }
    }
}

/// Normalise `candidate`'s path components without touching disk: resolve
/// `.` and collapse `..` against what has been pushed so far, rejecting
/// any `..` that would climb above the (implicit) root, any absolute
/// segment, and any empty input.
fn normalize_relative(candidate: &str, kind: RootKind) -> Result<PathBuf> {
    if candidate.trim().is_empty() {
        return Err(BbError::conflict(format!(
            "path sandbox violation: empty path against {}",
            kind.label()
        )));
    }
    let candidate_path = Path::new(candidate);
    if candidate_path.is_absolute() {
        return Err(BbError::conflict(format!(
            "path sandbox violation: absolute path {candidate:?} against {}",
            kind.label()
        )));
    }
    let mut normalized = PathBuf::new();
    for component in candidate_path.components() {
        match component {
            Component::Normal(seg) => normalized.push(seg),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(BbError::conflict(format!(
                        "path sandbox violation: {candidate:?} escapes {} via '..'",
                        kind.label()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BbError::conflict(format!(
                    "path sandbox violation: absolute path {candidate:?} against {}",
                    kind.label()
                )));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(BbError::conflict(format!(
            "path sandbox violation: empty path against {}",
            kind.label()
        )));
    }
    Ok(normalized)
}

/// Canonicalise `path`, resolving symlinks on whatever prefix of it
/// already exists and leaving the rest (e.g. a file not yet written)
/// untouched. Lets the sandbox reject symlink escapes even for paths
/// that are about to be created for the first time.
pub fn canonicalize_allow_missing(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing: &Path = path;
    let mut missing_tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(base) => {
                let mut result = base;
                for seg in missing_tail.into_iter().rev() {
                    result.push(seg);
                }
                return Ok(result);
            }
            Err(err) => {
                let Some(parent) = existing.parent() else {
                    return Err(err);
                };
                if parent == existing {
                    return Err(err);
                }
                if let Some(name) = existing.file_name() {
                    missing_tail.push(name.to_os_string());
                }
                existing = parent;
            }
        }
    }
}

/// Resolve `candidate` (a project-root-relative path argument) against
/// `root`, rejecting absolute paths, `..`-escapes, and symlink escapes.
/// Does not require `candidate` to already exist.
pub fn resolve(kind: RootKind, root: &Path, candidate: &str) -> Result<PathBuf> {
    let normalized = normalize_relative(candidate, kind)?;
    let joined = root.join(&normalized);

    let root_canon = canonicalize_allow_missing(root)
        .map_err(|e| BbError::conflict(format!("cannot resolve {}: {e}", kind.label())))?;
    let joined_canon = canonicalize_allow_missing(&joined)
        .map_err(|e| BbError::conflict(format!("cannot resolve {candidate:?}: {e}")))?;

    if joined_canon != root_canon && !joined_canon.starts_with(&root_canon) {
        return Err(BbError::conflict(format!(
            "path sandbox violation: {candidate:?} resolves outside {}",
            kind.label()
        )));
    }
    Ok(joined)
}

/// Resolve an `external` context path: the one case where an absolute
/// path is legitimate (a read-only file outside the project). No
/// containment check applies since there is no declared root, but the
/// path must genuinely be absolute — a relative path here is a caller
/// bug, not a sandbox escape, so it is still rejected.
pub fn resolve_external(candidate: &str) -> Result<PathBuf> {
    let path = Path::new(candidate);
    if !path.is_absolute() {
        return Err(BbError::conflict(format!(
            "external path must be absolute: {candidate:?}"
        )));
    }
    canonicalize_allow_missing(path)
        .map_err(|e| BbError::conflict(format!("cannot resolve external path {candidate:?}: {e}")))
}

/// Resolve a destination inside a chat's `output/` directory. Any
/// violation here is fatal: the whole process exits rather than risk
/// writing an LLM-authored file outside the sandbox.
pub fn resolve_output(output_dir: &Path, candidate: &str) -> PathBuf {
    match resolve(RootKind::ChatDir, output_dir, candidate) {
        Ok(resolved) => {
            let output_canon = match canonicalize_allow_missing(output_dir) {
                Ok(p) => p,
                Err(e) => fatal_violation(&format!("cannot resolve output directory: {e}")),
            };
            let resolved_canon = match canonicalize_allow_missing(&resolved) {
                Ok(p) => p,
                Err(e) => fatal_violation(&format!("cannot resolve output path {candidate:?}: {e}")),
            };
            if resolved_canon == output_canon || !resolved_canon.starts_with(&output_canon) {
                fatal_violation(&format!(
                    "output write {candidate:?} does not lie strictly within output/"
                ));
            }
            resolved
        }
        Err(e) => fatal_violation(&e.to_string()),
    }
}

/// Terminate the process immediately on a sandbox violation that must
/// never happen: a write escaping its declared root. Exits non-zero.
pub fn fatal_violation(message: &str) -> ! {
    eprintln!("bb7: fatal sandbox violation: {message}");
    std::process::exit(70);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rejects_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(RootKind::ProjectRoot, dir.path(), "/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn rejects_dot_dot_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(RootKind::ProjectRoot, dir.path(), "../../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn allows_plain_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(RootKind::ProjectRoot, dir.path(), "src/main.rs").unwrap();
        assert!(resolved.starts_with(dir.path()));
    }

    #[test]
    fn rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        fs::create_dir_all(&root).unwrap();
        let link = root.join("escape");
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        #[cfg(unix)]
        {
            let err = resolve(RootKind::ProjectRoot, &root, "escape/file.txt").unwrap_err();
            assert!(err.to_string().contains("outside"));
        }
    }

    #[test]
    fn external_requires_absolute_path() {
        assert!(resolve_external("relative/path").is_err());
    }

    #[test]
    fn normalizes_internal_dot_dot_that_stays_within_root() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(RootKind::ProjectRoot, dir.path(), "a/../b.rs").unwrap();
        assert_eq!(resolved, dir.path().join("b.rs"));
    }
}
