//! Snippet indentation normalization

use super::locate::{split_lines, Region};
use super::markers::{indent_width, is_blank, is_populate_hook, leading_ws};

/// Indent used for inserted code when nothing in the file suggests better:
/// one class-body level.
pub const DEFAULT_INDENT: &str = "    ";

/// Strip the snippet's minimal indentation from every non-blank line.
/// Blank lines are left exactly as they are.
pub fn dedent(snippet: &str) -> String {
    let min = snippet
        .split('\n')
        .filter(|l| !is_blank(l))
        .map(indent_width)
        .min()
        .unwrap_or(0);

    if min == 0 {
        return snippet.to_string();
    }

    snippet
        .split('\n')
        .map(|line| {
            if is_blank(line) {
                line.to_string()
            } else {
                line.chars().skip(min).collect()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Dedent, then prefix every non-blank line with `prefix`.
pub fn reindent(snippet: &str, prefix: &str) -> String {
    dedent(snippet)
        .split('\n')
        .map(|line| {
            if is_blank(line) {
                line.to_string()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Indentation of the first `populate_*` hook in the file, which is where
/// strategy methods live. Falls back to [`DEFAULT_INDENT`].
pub fn infer_module_indent(file: &str) -> String {
    split_lines(file)
        .into_iter()
        .find(|l| is_populate_hook(l))
        .map(|l| leading_ws(l).to_string())
        .unwrap_or_else(|| DEFAULT_INDENT.to_string())
}

/// Prefix the snippet should carry once it lands.
///
/// Replacements inherit the first non-blank line of the region they replace;
/// insertions use [`infer_module_indent`].
pub fn target_prefix(file: &str, region: Option<&Region>) -> String {
    let Some(region) = region else {
        return infer_module_indent(file);
    };
    region
        .slice(file)
        .and_then(|text| text.split('\n').find(|l| !is_blank(l)))
        .map(|l| leading_ws(l).to_string())
        .unwrap_or_else(|| region.indent.clone())
}
