//! Edit records and the builder that turns a resolved target into one

use super::apply::locate_function;
use super::locate::{locate_enclosing, locate_param, locate_selection, LocateError, Region};
use super::mismatch::{context_name, detect_mismatch, extract_def_name};
use super::normalize::{infer_module_indent, reindent, target_prefix};
use serde::{Deserialize, Serialize};

/// What a replace edit overwrites. Resolved again by the validator at apply
/// time, where `before` must still match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplaceTarget {
    Range {
        #[serde(rename = "startLine")]
        start_line: usize,
        #[serde(rename = "endLine")]
        end_line: usize,
    },
    Function {
        name: String,
    },
    Class {
        name: String,
    },
    /// A hyperopt `*Parameter(...)` assignment.
    Param {
        name: String,
    },
}

impl ReplaceTarget {
    pub fn label(&self) -> String {
        match self {
            ReplaceTarget::Range {
                start_line,
                end_line,
            } => format!("range {}-{}", start_line, end_line),
            ReplaceTarget::Function { name } => format!("function {}", name),
            ReplaceTarget::Class { name } => format!("class {}", name),
            ReplaceTarget::Param { name } => format!("param {}", name),
        }
    }
}

/// Where an insert edit lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InsertAnchor {
    ModuleEnd,
    /// After `populate_indicators`, else at the end of the strategy class,
    /// else at the end of the module.
    HeuristicIndicators,
    AfterFunction {
        name: String,
    },
    /// After the module docstring and leading import block.
    AfterImports,
    ClassEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    Replace {
        target: ReplaceTarget,
        before: String,
        after: String,
    },
    Insert {
        anchor: InsertAnchor,
        #[serde(alias = "after")]
        content: String,
    },
}

impl Edit {
    pub fn label(&self) -> String {
        match self {
            Edit::Replace { target, .. } => format!("replace {}", target.label()),
            Edit::Insert { anchor, .. } => format!("insert {:?}", anchor),
        }
    }
}

/// How the user pointed at the code a snippet should replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTarget {
    /// Literal selected text.
    Selection(String),
    /// The function enclosing this 1-indexed line.
    Enclosing { line: usize },
    /// A function by name; `None` takes the name from the snippet itself.
    Named(Option<String>),
    /// A hyperopt parameter assignment by name.
    Param(String),
    Insert(InsertAnchor),
}

/// A built edit plus what the preview needs to show around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    pub edit: Edit,
    /// Resolved region for replaces.
    pub region: Option<Region>,
    /// Advisory name-mismatch warning; the user must confirm to proceed.
    pub warning: Option<String>,
    /// The snippet re-indented for where it lands.
    pub snippet: String,
}

impl PatchPlan {
    pub fn needs_confirmation(&self) -> bool {
        self.warning.is_some()
    }
}

/// Resolve `target` in `file` and build the edit that puts `snippet` there.
pub fn build_patch(file: &str, target: PatchTarget, snippet: &str) -> Result<PatchPlan, LocateError> {
    let snippet = clean_snippet(snippet);

    match target {
        PatchTarget::Selection(text) => {
            let region = locate_selection(file, &text)?;
            let warning = detect_mismatch(context_name(file, Some(&text), None).as_deref(), &snippet);
            let target = ReplaceTarget::Range {
                start_line: region.start_line,
                end_line: region.end_line,
            };
            replace_plan(file, region, target, &snippet, warning)
        }
        PatchTarget::Enclosing { line } => {
            let region = locate_enclosing(file, line)?;
            let warning = detect_mismatch(context_name(file, None, Some(line)).as_deref(), &snippet);
            let target = ReplaceTarget::Range {
                start_line: region.start_line,
                end_line: region.end_line,
            };
            replace_plan(file, region, target, &snippet, warning)
        }
        PatchTarget::Named(name) => {
            let (name, warning) = match name {
                Some(name) => {
                    let warning = detect_mismatch(Some(&name), &snippet);
                    (name, warning)
                }
                None => (
                    extract_def_name(&snippet).ok_or(LocateError::AmbiguousSnippetName)?,
                    None,
                ),
            };
            let region = locate_function(file, &name)?;
            replace_plan(file, region, ReplaceTarget::Function { name }, &snippet, warning)
        }
        PatchTarget::Param(name) => {
            let region = locate_param(file, &name)?;
            replace_plan(file, region, ReplaceTarget::Param { name }, &snippet, None)
        }
        PatchTarget::Insert(anchor) => {
            let prefix = insert_prefix(file, &anchor);
            let body = reindent(&snippet, &prefix);
            let content = match anchor {
                InsertAnchor::AfterImports => format!("{}\n", body),
                _ => format!("\n{}\n", body),
            };
            Ok(PatchPlan {
                edit: Edit::Insert { anchor, content },
                region: None,
                warning: None,
                snippet: body,
            })
        }
    }
}

fn replace_plan(
    file: &str,
    region: Region,
    target: ReplaceTarget,
    snippet: &str,
    warning: Option<String>,
) -> Result<PatchPlan, LocateError> {
    let before = region
        .slice(file)
        .ok_or(LocateError::LineOutOfRange {
            line: region.end_line,
            total: file.lines().count(),
        })?
        .to_string();
    let prefix = target_prefix(file, Some(&region));
    let normalized = reindent(snippet, &prefix);
    let mut after = normalized.clone();
    if before.ends_with('\n') {
        after.push('\n');
    }

    Ok(PatchPlan {
        edit: Edit::Replace {
            target,
            before,
            after,
        },
        region: Some(region),
        warning,
        snippet: normalized,
    })
}

fn insert_prefix(file: &str, anchor: &InsertAnchor) -> String {
    match anchor {
        InsertAnchor::AfterImports => String::new(),
        InsertAnchor::AfterFunction { name } => locate_function(file, name)
            .map(|r| r.indent)
            .unwrap_or_else(|_| infer_module_indent(file)),
        _ => infer_module_indent(file),
    }
}

/// Drop leading blank lines and trailing whitespace so the terminator is
/// decided by the target, not by the assistant's formatting.
fn clean_snippet(snippet: &str) -> String {
    let normalized = snippet.replace("\r\n", "\n");
    let mut lines: Vec<&str> = normalized.split('\n').collect();
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    lines.join("\n").trim_end().to_string()
}
