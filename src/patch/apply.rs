//! Edit application with stale-target protection
//!
//! Edits apply in order, each against the text left by the previous one.
//! Every target is resolved again here: a replace only lands when its
//! `before` still matches the live text.

use super::edit::{Edit, InsertAnchor, ReplaceTarget};
use super::locate::{
    first_container, line_byte_range, locate_container, locate_named_preferring, locate_param,
    split_lines, LocateError, Region,
};
use super::markers::{class_name, indent_width, is_blank};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("before mismatch for {label}: the file changed since this edit was built")]
    Stale { label: String },
    #[error("invalid range {start}-{end} (file has {total} lines)")]
    InvalidRange {
        start: usize,
        end: usize,
        total: usize,
    },
    #[error("anchor not found: {0}")]
    AnchorNotFound(String),
    #[error(transparent)]
    Target(#[from] LocateError),
}

/// Where an edit actually landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedEdit {
    pub kind: String,
    pub label: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// Apply `edits` to `src`, returning the new text and where each edit landed.
pub fn apply_edits(src: &str, edits: &[Edit]) -> Result<(String, Vec<AppliedEdit>), ApplyError> {
    let mut current = src.to_string();
    let mut applied = Vec::with_capacity(edits.len());

    for edit in edits {
        match edit {
            Edit::Replace {
                target,
                before,
                after,
            } => {
                let (start, end) = resolve_target(&current, target)?;
                let total = split_lines(&current).len();
                let range = line_byte_range(&current, start, end)
                    .ok_or(ApplyError::InvalidRange { start, end, total })?;
                let segment = &current[range.clone()];
                if !segment_matches(segment, before) {
                    return Err(ApplyError::Stale {
                        label: target.label(),
                    });
                }

                let mut replacement = after.clone();
                if segment.ends_with('\n') && !replacement.is_empty() && !replacement.ends_with('\n')
                {
                    replacement.push('\n');
                }
                current.replace_range(range, &replacement);
                applied.push(AppliedEdit {
                    kind: "replace".to_string(),
                    label: target.label(),
                    start_line: start,
                    end_line: end,
                });
            }
            Edit::Insert { anchor, content } => {
                let (insert_at, label) = resolve_anchor(&current, anchor)?;
                let total = split_lines(&current).len();
                let offset = if insert_at == 0 {
                    0
                } else {
                    line_byte_range(&current, insert_at, insert_at)
                        .map(|r| r.end)
                        .unwrap_or(current.len())
                };

                let mut block = String::new();
                if offset == current.len() && !current.is_empty() && !current.ends_with('\n') {
                    block.push('\n');
                }
                block.push_str(content);
                if insert_at < total && !block.ends_with('\n') {
                    block.push('\n');
                }
                current.insert_str(offset, &block);
                applied.push(AppliedEdit {
                    kind: "insert".to_string(),
                    label,
                    start_line: insert_at + 1,
                    end_line: insert_at + 1,
                });
            }
        }
    }

    Ok((current, applied))
}

/// `\r\n`-insensitive comparison that tolerates a missing final newline.
fn segment_matches(segment: &str, before: &str) -> bool {
    let segment = segment.replace("\r\n", "\n");
    let before = before.replace("\r\n", "\n");
    segment == before || segment.trim_end_matches('\n') == before.trim_end_matches('\n')
}

fn resolve_target(file: &str, target: &ReplaceTarget) -> Result<(usize, usize), ApplyError> {
    let region = match target {
        ReplaceTarget::Range {
            start_line,
            end_line,
        } => {
            let total = split_lines(file).len();
            if *start_line < 1 || end_line < start_line || *end_line > total {
                return Err(ApplyError::InvalidRange {
                    start: *start_line,
                    end: *end_line,
                    total,
                });
            }
            return Ok((*start_line, *end_line));
        }
        ReplaceTarget::Function { name } => locate_function(file, name)?,
        ReplaceTarget::Class { name } => locate_container(file, name)?,
        ReplaceTarget::Param { name } => locate_param(file, name)?,
    };
    Ok((region.start_line, region.end_line))
}

/// Resolve an anchor to the number of lines that precede the insertion.
fn resolve_anchor(file: &str, anchor: &InsertAnchor) -> Result<(usize, String), ApplyError> {
    let total = split_lines(file).len();
    match anchor {
        InsertAnchor::ModuleEnd => Ok((total, "end of module".to_string())),
        InsertAnchor::AfterFunction { name } => {
            let region = locate_function(file, name)
                .map_err(|_| ApplyError::AnchorNotFound(format!("function {}", name)))?;
            Ok((region.end_line, format!("after function {}", name)))
        }
        InsertAnchor::AfterImports => Ok((after_imports(file), "after imports".to_string())),
        InsertAnchor::ClassEnd { name } => {
            let found = match name {
                Some(name) => locate_container(file, name)
                    .ok()
                    .map(|r| (name.clone(), r)),
                None => strategy_class(file),
            };
            let (name, region) =
                found.ok_or_else(|| ApplyError::AnchorNotFound("class".to_string()))?;
            Ok((region.end_line, format!("end of class {}", name)))
        }
        InsertAnchor::HeuristicIndicators => {
            let Some((name, class_region)) = strategy_class(file) else {
                return Ok((total, "end of module".to_string()));
            };
            match locate_function(file, "populate_indicators") {
                Ok(r) if class_region.contains(r.start_line) => {
                    Ok((r.end_line, "after populate_indicators".to_string()))
                }
                _ => Ok((class_region.end_line, format!("end of class {}", name))),
            }
        }
    }
}

/// Function targets resolve to a method of the strategy class before any
/// other definition with the same name.
pub fn locate_function(file: &str, name: &str) -> Result<Region, LocateError> {
    let scope = strategy_class(file).map(|(_, region)| region);
    locate_named_preferring(file, name, scope.as_ref())
}

/// The class deriving from `IStrategy`, else the first class in the file.
pub fn strategy_class(file: &str) -> Option<(String, Region)> {
    let lines = split_lines(file);
    let declared = lines
        .iter()
        .find(|l| class_name(l).is_some() && l.contains("IStrategy"))
        .and_then(|l| class_name(l));
    if let Some(name) = declared {
        return locate_container(file, name)
            .ok()
            .map(|r| (name.to_string(), r));
    }
    let region = first_container(file)?;
    let name = lines
        .get(region.start_line - 1)
        .and_then(|l| class_name(l))
        .unwrap_or_default()
        .to_string();
    Some((name, region))
}

/// Line count preceding the first code after the module docstring and the
/// leading import block.
fn after_imports(file: &str) -> usize {
    let lines = split_lines(file);
    let mut idx = 0;
    while idx < lines.len() && is_blank(lines[idx]) {
        idx += 1;
    }

    let mut doc_end = 0;
    if let Some(first) = lines.get(idx) {
        let trimmed = first.trim_start();
        let quote = ["\"\"\"", "'''"]
            .into_iter()
            .find(|q| trimmed.starts_with(q));
        if let Some(q) = quote {
            if trimmed.matches(q).count() >= 2 {
                doc_end = idx + 1;
            } else if let Some(close) = (idx + 1..lines.len()).find(|&i| lines[i].contains(q)) {
                doc_end = close + 1;
            }
        }
    }

    let mut last_import_end = 0;
    let mut i = doc_end;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();
        if is_blank(line) || trimmed.starts_with('#') || indent_width(line) > 0 {
            i += 1;
            continue;
        }
        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            let mut end = i;
            if line.contains('(') && !line.contains(')') {
                while end + 1 < lines.len() && !lines[end].contains(')') {
                    end += 1;
                }
            }
            last_import_end = end + 1;
            i = end + 1;
            continue;
        }
        if last_import_end > 0 {
            break;
        }
        i += 1;
    }

    doc_end.max(last_import_end)
}
