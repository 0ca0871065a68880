//! Instruction resolver: loads the global `~/.config/bb7/instructions.md`
//! (included verbatim) and the project `<project>/.bb7/instructions` file
//! (directive-aware: `@@ ` comments are stripped, `@include <path>`
//! expands to the verbatim contents of a sandboxed path, both ignored
//! inside fenced code blocks), then assembles the system prompt from an
//! embedded base plus either piece wrapped in a tagged, `source`-attributed
//! block.

use bb7_errors::{BbError, Result};
use bb7_sandbox::RootKind;
use std::fs;
use std::path::Path;

pub const BASE_SYSTEM_PROMPT: &str = "\
You are BB-7, a coding assistant embedded in the user's editor. You read \
the files given to you, answer questions, and propose edits using the \
write_file and edit_file tools. Only write files the user has made \
writable; never invent paths outside the project.";

fn global_instructions_path() -> std::path::PathBuf {
    bb7_core::config_dir().join("instructions.md")
}

/// Read `~/.config/bb7/instructions.md` verbatim. `None` if absent.
pub fn load_global_instructions() -> Option<String> {
    fs::read_to_string(global_instructions_path()).ok()
}

/// Read and expand `<project>/.bb7/instructions`. `None` if the file does
/// not exist; `Err` if an `@include` directive escapes the project root or
/// names an unreadable file.
pub fn load_project_instructions(project_root: &Path, bb7_dir: &Path) -> Result<Option<String>> {
    let path = bb7_dir.join("instructions");
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    Some(expand_directives(&raw, project_root)).transpose()
}

/// Is `line` a fence delimiter (``` or ~~~, any length ≥ 3)? Toggles the
/// "inside a fenced block" state; directives inside are left untouched.
fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    (trimmed.starts_with("```") || trimmed.starts_with("~~~")) && trimmed.trim_start_matches(['`', '~']).is_empty()
}

fn parse_include_target(rest: &str) -> Option<&str> {
    let rest = rest.strip_prefix("@include")?;
    let rest = rest.strip_prefix(' ')?.trim();
    if let Some(quoted) = rest.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(quoted)
    } else {
        Some(rest)
    }
}

/// Expand `@@ ` comments and `@include` directives in `raw`, single level
/// (the included body is not itself re-parsed for directives).
pub fn expand_directives(raw: &str, project_root: &Path) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut in_fence = false;
    for line in raw.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if in_fence {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if line.starts_with("@@ ") || line == "@@" {
            continue;
        }
        if line.starts_with("@include") {
            let target = parse_include_target(line).ok_or_else(|| {
                BbError::parse(format!("malformed @include directive: {line:?}"))
            })?;
            let resolved = bb7_sandbox::resolve(RootKind::ProjectRoot, project_root, target)
                .map_err(|e| BbError::parse(format!("@include {target:?} escapes project root: {e}")))?;
            let included = fs::read_to_string(&resolved).map_err(|e| {
                BbError::parse(format!("@include {target:?} could not be read: {e}"))
            })?;
            out.push_str(&included);
            if !included.ends_with('\n') {
                out.push('\n');
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}

fn wrap(source: &str, body: &str) -> String {
    format!("<instructions source=\"{source}\">\n{body}\n</instructions>")
}

/// Assemble the system prompt: embedded base, then global instructions (if
/// any) wrapped in a tagged block, then project instructions (if any) the
/// same way.
pub fn build_system_prompt(global: Option<&str>, project: Option<&str>) -> String {
    let mut out = String::from(BASE_SYSTEM_PROMPT);
    if let Some(global) = global {
        out.push_str("\n\n");
        out.push_str(&wrap("global", global));
    }
    if let Some(project) = project {
        out.push_str("\n\n");
        out.push_str(&wrap("project", project));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CustomizationInfo {
    pub global_instructions: bool,
    pub project_instructions: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_instructions_error: Option<String>,
}

/// `get_customization_info`: whether each instruction source is present
/// and loadable, surfacing any `@include` sandbox/parse failure so the
/// frontend can prompt the user to fix it. A send is blocked while
/// `project_instructions_error` is set.
pub fn get_customization_info(project_root: &Path, bb7_dir: &Path) -> CustomizationInfo {
    let global_instructions = global_instructions_path().exists();
    match load_project_instructions(project_root, bb7_dir) {
        Ok(Some(_)) => CustomizationInfo {
            global_instructions,
            project_instructions: true,
            project_instructions_error: None,
        },
        Ok(None) => CustomizationInfo {
            global_instructions,
            project_instructions: false,
            project_instructions_error: None,
        },
        Err(e) => CustomizationInfo {
            global_instructions,
            project_instructions: false,
            project_instructions_error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let bb7_dir = dir.path().join(".bb7");
        fs::create_dir_all(&bb7_dir).unwrap();
        (dir, dir.path().to_path_buf(), bb7_dir)
    }

    #[test]
    fn at_at_comments_are_stripped() {
        let (_dir, root, bb7) = project();
        fs::write(bb7.join("instructions"), "@@ a note\nkeep this\n").unwrap();
        let out = load_project_instructions(&root, &bb7).unwrap().unwrap();
        assert_eq!(out, "keep this\n");
    }

    #[test]
    fn include_expands_verbatim_single_level() {
        let (_dir, root, bb7) = project();
        fs::write(root.join("shared.md"), "shared body\n").unwrap();
        fs::write(bb7.join("instructions"), "before\n@include shared.md\nafter\n").unwrap();
        let out = load_project_instructions(&root, &bb7).unwrap().unwrap();
        assert_eq!(out, "before\nshared body\nafter\n");
    }

    #[test]
    fn quoted_include_path_is_supported() {
        let (_dir, root, bb7) = project();
        fs::write(root.join("shared.md"), "body\n").unwrap();
        fs::write(bb7.join("instructions"), "@include \"shared.md\"\n").unwrap();
        let out = load_project_instructions(&root, &bb7).unwrap().unwrap();
        assert_eq!(out, "body\n");
    }

    #[test]
    fn include_inside_fenced_block_is_left_untouched() {
        let (_dir, root, bb7) = project();
        fs::write(bb7.join("instructions"), "```\n@include shared.md\n```\n").unwrap();
        let out = load_project_instructions(&root, &bb7).unwrap().unwrap();
        assert_eq!(out, "```\n@include shared.md\n```\n");
    }

    #[test]
    fn include_escape_is_a_parse_error() {
        let (_dir, root, bb7) = project();
        fs::write(bb7.join("instructions"), "@include ../../etc/passwd\n").unwrap();
        let err = load_project_instructions(&root, &bb7).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn customization_info_surfaces_include_escape() {
        let (_dir, root, bb7) = project();
        fs::write(bb7.join("instructions"), "@include ../../etc/passwd\n").unwrap();
        let info = get_customization_info(&root, &bb7);
        assert!(!info.project_instructions);
        assert!(info.project_instructions_error.unwrap().contains("escapes"));
    }

    #[test]
    fn missing_project_instructions_is_not_an_error() {
        let (_dir, root, bb7) = project();
        let info = get_customization_info(&root, &bb7);
        assert!(!info.project_instructions);
        assert!(info.project_instructions_error.is_none());
    }

    #[test]
    fn system_prompt_wraps_each_source_with_its_tag() {
        let prompt = build_system_prompt(Some("global body"), Some("project body"));
        assert!(prompt.starts_with(BASE_SYSTEM_PROMPT));
        assert!(prompt.contains("<instructions source=\"global\">\nglobal body\n</instructions>"));
        assert!(prompt.contains("<instructions source=\"project\">\nproject body\n</instructions>"));
    }
}
