//! The file-edit engine: deterministic, anchor-based region edits plus a
//! line-based search/replace fallback, both built on the same four-pass
//! matcher. Every entry point is pure — it takes the current candidate
//! text and returns the next candidate, or a list of structured
//! [`EditFailure`]s — so the coordinator can stage writes in an
//! in-memory per-turn buffer and discard the whole buffer atomically on
//! any failure.

use bb7_errors::EditFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MIN_PREFIX_NONWS: usize = 8;
const MAX_ANCHOR_LINES: usize = 10;

// ---------------------------------------------------------------------
// Line-ending / line-vector helpers
// ---------------------------------------------------------------------

pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Split normalised text into its line vector. A trailing `\n` does not
/// produce a spurious empty final line.
pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let had_trailing_newline = text.ends_with('\n');
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    if had_trailing_newline {
        lines.pop();
    }
    lines
}

/// Join a line vector back into text, with a trailing `\n` unless the
/// file is empty.
pub fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `write_file` tool: the content *is* the complete new file, normalised.
pub fn apply_write_file(content: &str) -> String {
    let normalized = normalize_line_endings(content);
    if normalized.is_empty() || normalized.ends_with('\n') {
        normalized
    } else {
        format!("{normalized}\n")
    }
}

fn leading_ws(s: &str) -> &str {
    let trimmed = s.trim_start_matches([' ', '\t']);
    &s[..s.len() - trimmed.len()]
}

fn trim_trailing(s: &str) -> &str {
    s.trim_end_matches([' ', '\t', '\r'])
}

fn nonws_len(s: &str) -> usize {
    s.chars().filter(|c| !c.is_whitespace()).count()
}

// ---------------------------------------------------------------------
// Four-pass anchor matching
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Exact,
    TrimTrailing,
    TrimFull,
    BoundaryPrefix,
}

fn find_positions(
    lines: &[String],
    anchor: &[String],
    from: usize,
    eq: impl Fn(&str, &str) -> bool,
) -> Vec<usize> {
    let mut out = Vec::new();
    if anchor.is_empty() || from >= lines.len() || anchor.len() > lines.len() - from {
        return out;
    }
    for start in from..=(lines.len() - anchor.len()) {
        if (0..anchor.len()).all(|k| eq(&lines[start + k], &anchor[k])) {
            out.push(start);
        }
    }
    out
}

/// A boundary line may match exactly, or the anchor's trimmed text may be
/// a proper (truncated), non-trivial prefix of the file's trimmed line.
/// Returns `(matches, is_strict_prefix)`.
fn boundary_match(file_line: &str, anchor_line: &str) -> (bool, bool) {
    let file_trimmed = file_line.trim();
    let anchor_trimmed = anchor_line.trim();
    if file_trimmed == anchor_trimmed {
        return (true, false);
    }
    if anchor_trimmed.len() < file_trimmed.len()
        && file_trimmed.starts_with(anchor_trimmed)
        && nonws_len(anchor_trimmed) >= MIN_PREFIX_NONWS
    {
        return (true, true);
    }
    (false, false)
}

fn find_boundary_prefix_positions(lines: &[String], anchor: &[String], from: usize) -> Vec<usize> {
    let mut out = Vec::new();
    if anchor.len() < 2 || from >= lines.len() || anchor.len() > lines.len() - from {
        return out;
    }
    let last = anchor.len() - 1;
    for start in from..=(lines.len() - anchor.len()) {
        let mut ok = true;
        let mut any_strict = false;
        for (k, anchor_line) in anchor.iter().enumerate() {
            let file_line = &lines[start + k];
            if k == 0 || k == last {
                let (matches, strict) = boundary_match(file_line, anchor_line);
                if !matches {
                    ok = false;
                    break;
                }
                any_strict |= strict;
            } else if file_line.trim() != anchor_line.trim() {
                ok = false;
                break;
            }
        }
        if ok && any_strict {
            out.push(start);
        }
    }
    out
}

/// Run all four passes in order against `lines[from..]`, stopping at the
/// first pass that matches anywhere. Returns every position that pass
/// matched (the caller decides what "more than one" means for its case).
fn find_all_positions(lines: &[String], anchor: &[String], from: usize) -> Option<(Vec<usize>, Pass)> {
    let p1 = find_positions(lines, anchor, from, |a, b| a == b);
    if !p1.is_empty() {
        return Some((p1, Pass::Exact));
    }
    let p2 = find_positions(lines, anchor, from, |a, b| trim_trailing(a) == trim_trailing(b));
    if !p2.is_empty() {
        return Some((p2, Pass::TrimTrailing));
    }
    let p3 = find_positions(lines, anchor, from, |a, b| a.trim() == b.trim());
    if !p3.is_empty() {
        return Some((p3, Pass::TrimFull));
    }
    let p4 = find_boundary_prefix_positions(lines, anchor, from);
    if !p4.is_empty() {
        return Some((p4, Pass::BoundaryPrefix));
    }
    None
}

fn describe_positions(positions: &[usize]) -> String {
    positions
        .iter()
        .map(|p| (p + 1).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolve a *unique* anchor (used by the anchored engine, where
/// ambiguity is always an error).
fn resolve_unique_anchor(
    lines: &[String],
    anchor: &[String],
    from: usize,
) -> Result<(usize, Pass), String> {
    match find_all_positions(lines, anchor, from) {
        None => Err("anchor not found".to_string()),
        Some((positions, _)) if positions.len() > 1 => {
            Err(format!("anchor not unique (lines {})", describe_positions(&positions)))
        }
        Some((positions, pass)) => Ok((positions[0], pass)),
    }
}

/// Pass-3 indentation adjustment: `content`'s lines are re-indented from
/// the anchor's indentation to the file's, unless the model's content
/// already carries a different indentation on its first non-empty line
/// (it compensated already).
fn maybe_adjust_indentation(file_line: &str, anchor_line: &str, content: &[String]) -> Vec<String> {
    let fix = leading_ws(file_line);
    let del = leading_ws(anchor_line);
    if fix == del {
        return content.to_vec();
    }
    if let Some(first_nonempty) = content.iter().find(|l| !l.trim().is_empty()) {
        if leading_ws(first_nonempty) != del {
            return content.to_vec();
        }
    }
    content
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                line.clone()
            } else if let Some(stripped) = line.strip_prefix(del) {
                format!("{fix}{stripped}")
            } else {
                line.clone()
            }
        })
        .collect()
}

/// Pass-4 boundary expansion: if `content[idx]` is the truncated form of
/// the matched boundary line, expand it back to the file's full line.
fn expand_boundary_content(content: &mut [String], idx: usize, full_file_line: &str) {
    let Some(line) = content.get(idx) else { return };
    let (matches, strict) = boundary_match(full_file_line, line);
    if matches && strict {
        content[idx] = full_file_line.to_string();
    }
}

// ---------------------------------------------------------------------
// Anchored engine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchoredChange {
    pub start: Vec<String>,
    #[serde(default)]
    pub end: Option<Vec<String>>,
    pub content: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutcome {
    pub change_index: usize,
    /// `false` when the change's resolved region already equalled its
    /// `content` and was dropped as a no-op.
    pub applied: bool,
}

struct ResolvedChange {
    index: usize,
    region: (usize, usize),
    content: Vec<String>,
    matched_lines: Vec<String>,
}

fn validate_change_shape(change: &AnchoredChange, idx: usize) -> Result<(), EditFailure> {
    if change.start.is_empty() || change.start.len() > MAX_ANCHOR_LINES {
        return Err(EditFailure::new(idx, "start anchor must have 1-10 lines"));
    }
    if let Some(end) = &change.end {
        if end.len() > MAX_ANCHOR_LINES {
            return Err(EditFailure::new(idx, "end anchor must have at most 10 lines"));
        }
    }
    Ok(())
}

fn resolve_change(lines: &[String], change: &AnchoredChange, idx: usize) -> Result<ResolvedChange, EditFailure> {
    let (start_pos, start_pass) =
        resolve_unique_anchor(lines, &change.start, 0).map_err(|reason| EditFailure::new(idx, reason))?;

    let mut content = change.content.clone();
    let end_anchor = change.end.as_ref().filter(|e| !e.is_empty());

    let region_end = if let Some(end_anchor) = end_anchor {
        let search_from = start_pos + change.start.len();
        let (end_pos, end_pass) = resolve_unique_anchor(lines, end_anchor, search_from)
            .map_err(|reason| EditFailure::new(idx, reason))?;
        let region_end = end_pos + end_anchor.len() - 1;
        if end_pass == Pass::BoundaryPrefix {
            let last_idx = content.len().saturating_sub(1);
            expand_boundary_content(&mut content, last_idx, &lines[region_end]);
        }
        region_end
    } else {
        start_pos + change.start.len() - 1
    };

    if start_pass == Pass::TrimFull {
        content = maybe_adjust_indentation(&lines[start_pos], &change.start[0], &content);
    }
    if start_pass == Pass::BoundaryPrefix {
        expand_boundary_content(&mut content, 0, &lines[start_pos]);
        if end_anchor.is_none() {
            let last_idx = content.len().saturating_sub(1);
            let file_last = &lines[start_pos + change.start.len() - 1];
            expand_boundary_content(&mut content, last_idx, file_last);
        }
    }

    let matched_lines = lines[start_pos..=region_end].to_vec();
    Ok(ResolvedChange {
        index: idx,
        region: (start_pos, region_end),
        content,
        matched_lines,
    })
}

/// Apply every change in `changes` against `original`: validate shape,
/// resolve anchors, check for overlaps, then splice bottom-to-top.
/// On success, returns the new text plus a per-change applied/no-op
/// report. On any validation, matching, or overlap failure, returns every
/// failure found — the caller discards the whole turn.
pub fn apply_anchored_changes(
    original: &str,
    changes: &[AnchoredChange],
) -> Result<(String, Vec<ChangeOutcome>), Vec<EditFailure>> {
    let normalized = normalize_line_endings(original);
    let lines = split_lines(&normalized);

    let mut failures = Vec::new();
    for (idx, change) in changes.iter().enumerate() {
        if let Err(f) = validate_change_shape(change, idx) {
            failures.push(f);
        }
    }
    if !failures.is_empty() {
        return Err(failures);
    }

    let mut resolved = Vec::with_capacity(changes.len());
    for (idx, change) in changes.iter().enumerate() {
        match resolve_change(&lines, change, idx) {
            Ok(r) => resolved.push(r),
            Err(f) => failures.push(f),
        }
    }
    if !failures.is_empty() {
        return Err(failures);
    }

    let mut by_start: Vec<&ResolvedChange> = resolved.iter().collect();
    by_start.sort_by_key(|r| r.region.0);
    for pair in by_start.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.region.1 >= b.region.0 {
            failures.push(EditFailure::new(b.index, "regions overlap").at(b.region.0, b.region.1));
        }
    }
    if !failures.is_empty() {
        return Err(failures);
    }

    let mut working = lines;
    let mut by_start_desc: Vec<&ResolvedChange> = resolved.iter().collect();
    by_start_desc.sort_by(|a, b| b.region.0.cmp(&a.region.0));

    let mut outcomes_by_index = vec![None; changes.len()];
    for r in by_start_desc {
        if r.content == r.matched_lines {
            outcomes_by_index[r.index] = Some(ChangeOutcome {
                change_index: r.index,
                applied: false,
            });
            continue;
        }
        working.splice(r.region.0..=r.region.1, r.content.clone());
        outcomes_by_index[r.index] = Some(ChangeOutcome {
            change_index: r.index,
            applied: true,
        });
    }

    let outcomes = outcomes_by_index.into_iter().flatten().collect();
    Ok((join_lines(&working), outcomes))
}

// ---------------------------------------------------------------------
// Search/replace engine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReplaceItem {
    pub path: String,
    #[serde(default)]
    pub file_id: Option<String>,
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

/// Find-and-replace `old_string` in `content`: three line-based passes,
/// a boundary-prefix pass, then a raw substring fallback.
pub fn apply_search_replace(
    content: &str,
    old_string: &str,
    new_string: &str,
    replace_all: bool,
) -> Result<String, EditFailure> {
    let normalized_content = normalize_line_endings(content);
    let normalized_old = normalize_line_endings(old_string);
    let normalized_new = normalize_line_endings(new_string);

    let mut lines = split_lines(&normalized_content);
    let old_lines = split_lines(&normalized_old);

    if !old_lines.is_empty() {
        if let Some((positions, pass)) = find_all_positions(&lines, &old_lines, 0) {
            if !replace_all && positions.len() > 1 {
                return Err(EditFailure::new(
                    0,
                    format!("anchor not unique (lines {})", describe_positions(&positions)),
                ));
            }
            let mut targets = if replace_all {
                positions
            } else {
                vec![positions[0]]
            };
            targets.sort_unstable();
            targets.reverse();
            for pos in targets {
                let mut new_lines = split_lines(&normalized_new);
                if pass == Pass::TrimFull {
                    new_lines = maybe_adjust_indentation(&lines[pos], &old_lines[0], &new_lines);
                }
                if pass == Pass::BoundaryPrefix {
                    expand_boundary_content(&mut new_lines, 0, &lines[pos]);
                    let last_idx = new_lines.len().saturating_sub(1);
                    let file_last = &lines[pos + old_lines.len() - 1];
                    expand_boundary_content(&mut new_lines, last_idx, file_last);
                }
                let region_end = pos + old_lines.len() - 1;
                lines.splice(pos..=region_end, new_lines);
            }
            return Ok(join_lines(&lines));
        }
    }

    // Pass 5: raw substring fallback for fragments that don't align to
    // line boundaries.
    let occurrences = count_occurrences(&normalized_content, &normalized_old);
    if occurrences == 0 {
        return Err(EditFailure::new(0, "anchor not found"));
    }
    if !replace_all && occurrences > 1 {
        return Err(EditFailure::new(
            0,
            format!("anchor not unique ({occurrences} occurrences)"),
        ));
    }
    Ok(if replace_all {
        normalized_content.replace(&normalized_old, &normalized_new)
    } else {
        normalized_content.replacen(&normalized_old, &normalized_new, 1)
    })
}

// ---------------------------------------------------------------------
// Tool-call argument parsing and dispatch
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum EditRequest {
    /// Covers both `search_replace` (one item) and `search_replace_multi`
    /// (several, applied sequentially).
    SearchReplace {
        path: String,
        file_id: Option<String>,
        edits: Vec<SearchReplaceItem>,
    },
    Anchored {
        path: String,
        file_id: Option<String>,
        changes: Vec<AnchoredChange>,
    },
}

impl EditRequest {
    pub fn path(&self) -> &str {
        match self {
            EditRequest::SearchReplace { path, .. } => path,
            EditRequest::Anchored { path, .. } => path,
        }
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            EditRequest::SearchReplace { file_id, .. } => file_id.as_deref(),
            EditRequest::Anchored { file_id, .. } => file_id.as_deref(),
        }
    }
}

/// Parse an `edit_file` tool call's JSON arguments into one of the three
/// schemas: `search_replace`, `search_replace_multi`, `anchored`. The
/// schema is distinguished by which fields are present, not by a
/// caller-supplied discriminator.
pub fn parse_edit_args(args: &Value) -> Result<EditRequest, String> {
    if let Some(changes) = args.get("changes") {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or("anchored edit is missing \"path\"")?
            .to_string();
        let file_id = args.get("file_id").and_then(Value::as_str).map(str::to_string);
        let changes: Vec<AnchoredChange> =
            serde_json::from_value(changes.clone()).map_err(|e| format!("invalid \"changes\": {e}"))?;
        return Ok(EditRequest::Anchored { path, file_id, changes });
    }
    if let Some(edits) = args.get("edits") {
        let edits: Vec<SearchReplaceItem> =
            serde_json::from_value(edits.clone()).map_err(|e| format!("invalid \"edits\": {e}"))?;
        let path = edits
            .first()
            .map(|e| e.path.clone())
            .ok_or("search_replace_multi requires at least one edit")?;
        let file_id = edits.first().and_then(|e| e.file_id.clone());
        return Ok(EditRequest::SearchReplace { path, file_id, edits });
    }
    if args.get("old_string").is_some() {
        let item: SearchReplaceItem =
            serde_json::from_value(args.clone()).map_err(|e| format!("invalid search_replace args: {e}"))?;
        let path = item.path.clone();
        let file_id = item.file_id.clone();
        return Ok(EditRequest::SearchReplace {
            path,
            file_id,
            edits: vec![item],
        });
    }
    Err("unrecognised edit_file arguments: expected \"changes\", \"edits\", or \"old_string\"".to_string())
}

/// Apply an already-parsed edit request to the current pending candidate
/// for its file. Returns the next candidate, or the structured failures
/// that should abort the whole turn.
pub fn apply_edit_request(candidate: &str, request: &EditRequest) -> Result<String, Vec<EditFailure>> {
    match request {
        EditRequest::SearchReplace { edits, .. } => {
            let mut current = candidate.to_string();
            for (idx, item) in edits.iter().enumerate() {
                current = apply_search_replace(&current, &item.old_string, &item.new_string, item.replace_all)
                    .map_err(|f| {
                        vec![EditFailure {
                            change_index: idx,
                            ..f
                        }]
                    })?;
            }
            Ok(current)
        }
        EditRequest::Anchored { changes, .. } => {
            let (text, _) = apply_anchored_changes(candidate, changes)?;
            Ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(s: &str) -> Vec<String> {
        s.lines().map(str::to_string).collect()
    }

    #[test]
    fn anchored_three_pass_indentation_fix() {
        let original = "class A:\n    def f(self):\n        return 1\n";
        let change = AnchoredChange {
            start: lines("def f(self):"),
            end: Some(lines("return 1")),
            content: lines("def f(self):\n    return 2"),
        };
        let (out, outcomes) = apply_anchored_changes(original, &[change]).unwrap();
        assert_eq!(out, "class A:\n    def f(self):\n        return 2\n");
        assert!(outcomes[0].applied);
    }

    #[test]
    fn ambiguous_single_line_anchor_is_rejected() {
        let original = "    pass\n    pass\n";
        let change = AnchoredChange {
            start: lines("    pass"),
            end: None,
            content: lines("    return"),
        };
        let err = apply_anchored_changes(original, &[change]).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].reason.contains("anchor not unique"));
        assert!(err[0].reason.contains("1, 2"));
    }

    #[test]
    fn no_op_change_is_dropped_and_reported() {
        let original = "a\nb\nc\n";
        let change = AnchoredChange {
            start: lines("b"),
            end: None,
            content: lines("b"),
        };
        let (out, outcomes) = apply_anchored_changes(original, &[change]).unwrap();
        assert_eq!(out, original);
        assert!(!outcomes[0].applied);
    }

    #[test]
    fn overlapping_changes_are_rejected_and_file_is_untouched() {
        let original = "a\nb\nc\nd\n";
        let c1 = AnchoredChange {
            start: lines("a\nb"),
            end: None,
            content: lines("x"),
        };
        let c2 = AnchoredChange {
            start: lines("b\nc"),
            end: None,
            content: lines("y"),
        };
        let err = apply_anchored_changes(original, &[c1, c2]).unwrap_err();
        assert!(err.iter().any(|f| f.reason.contains("overlap")));
    }

    #[test]
    fn anchor_not_found_is_reported() {
        let original = "a\nb\nc\n";
        let change = AnchoredChange {
            start: lines("zzz"),
            end: None,
            content: lines("q"),
        };
        let err = apply_anchored_changes(original, &[change]).unwrap_err();
        assert!(err[0].reason.contains("anchor not found"));
    }

    #[test]
    fn bottom_to_top_application_keeps_earlier_line_numbers_stable() {
        let original = "one\ntwo\nthree\nfour\n";
        let c1 = AnchoredChange {
            start: lines("one"),
            end: None,
            content: lines("ONE\nONE2"),
        };
        let c2 = AnchoredChange {
            start: lines("three"),
            end: None,
            content: lines("THREE"),
        };
        let (out, _) = apply_anchored_changes(original, &[c1, c2]).unwrap();
        assert_eq!(out, "ONE\nONE2\ntwo\nTHREE\nfour\n");
    }

    #[test]
    fn search_replace_requires_unique_match_by_default() {
        let err = apply_search_replace("foo\nfoo\n", "foo", "bar", false).unwrap_err();
        assert!(err.reason.contains("anchor not unique"));
    }

    #[test]
    fn search_replace_all_replaces_every_match() {
        let out = apply_search_replace("foo\nfoo\n", "foo", "bar", true).unwrap();
        assert_eq!(out, "bar\nbar\n");
    }

    #[test]
    fn search_replace_falls_back_to_raw_substring() {
        let out = apply_search_replace("abcdef\n", "cd", "XY", false).unwrap();
        assert_eq!(out, "abXYef\n");
    }

    #[test]
    fn crlf_input_is_normalized() {
        let out = apply_search_replace("foo\r\nbar\r\n", "foo", "baz", false).unwrap();
        assert_eq!(out, "baz\nbar\n");
    }

    #[test]
    fn write_file_adds_trailing_newline() {
        assert_eq!(apply_write_file("hello"), "hello\n");
        assert_eq!(apply_write_file(""), "");
        assert_eq!(apply_write_file("hello\n"), "hello\n");
    }

    #[test]
    fn parses_all_three_edit_schemas() {
        let search = serde_json::json!({"path": "a.rs", "file_id": "abcd1234", "old_string": "x", "new_string": "y"});
        assert!(matches!(parse_edit_args(&search).unwrap(), EditRequest::SearchReplace { .. }));

        let multi = serde_json::json!({"edits": [{"path": "a.rs", "old_string": "x", "new_string": "y"}]});
        assert!(matches!(parse_edit_args(&multi).unwrap(), EditRequest::SearchReplace { .. }));

        let anchored = serde_json::json!({"path": "a.rs", "changes": [{"start": ["x"], "content": ["y"]}]});
        assert!(matches!(parse_edit_args(&anchored).unwrap(), EditRequest::Anchored { .. }));
    }

    #[test]
    fn boundary_prefix_pass_expands_truncated_anchor_lines() {
        let original = "def handler(request, response_object_that_is_long):\n    pass\n    done()\n";
        let change = AnchoredChange {
            start: lines("def handler(request, respon\n    pass"),
            end: None,
            content: lines("def handler(request, respon\n    return None"),
        };
        let (out, outcomes) = apply_anchored_changes(original, &[change]).unwrap();
        assert!(outcomes[0].applied);
        assert!(out.contains("def handler(request, response_object_that_is_long):\n    return None\n"));
    }
}
