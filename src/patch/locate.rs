//! Indentation-based block location
//!
//! Resolves where an edit will land without building a syntax tree: the file
//! may be half-written, so every lookup is a scan over raw lines using the
//! markers in [`super::markers`].

use super::markers::{
    bracket_delta, class_name, def_name, indent_width, is_blank, is_block_boundary, is_decorator,
    is_def, leading_ws, param_name,
};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// A 1-indexed, inclusive line range plus the indentation prefix of its
/// first line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub start_line: usize,
    pub end_line: usize,
    pub indent: String,
}

impl Region {
    pub fn contains(&self, line: usize) -> bool {
        line >= self.start_line && line <= self.end_line
    }

    /// Exact current text of the region, including the end line's terminator.
    pub fn slice<'a>(&self, file: &'a str) -> Option<&'a str> {
        line_byte_range(file, self.start_line, self.end_line).map(|r| &file[r])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error("cannot build a safe edit here: the selection is empty")]
    EmptySelection,
    #[error("cannot build a safe edit here: the selected text no longer appears in the file")]
    SelectionNotFound,
    #[error("cannot build a safe edit here: the selected text appears {count} times in the file")]
    AmbiguousSelection { count: usize },
    #[error("cannot build a safe edit here: the selection starts or ends mid-line")]
    PartialLineSelection,
    #[error("cannot build a safe edit here: line {line} is outside the file ({total} lines)")]
    LineOutOfRange { line: usize, total: usize },
    #[error("cannot build a safe edit here: no function encloses line {line}")]
    NoEnclosingBlock { line: usize },
    #[error("cannot build a safe edit here: function `{name}` was not found")]
    FunctionNotFound { name: String },
    #[error("cannot build a safe edit here: class `{name}` was not found")]
    ClassNotFound { name: String },
    #[error("cannot build a safe edit here: parameter `{name}` was not found")]
    ParamNotFound { name: String },
    #[error("cannot build a safe edit here: the proposed code does not name exactly one function")]
    AmbiguousSnippetName,
}

/// Split into lines without terminators. A trailing newline does not open an
/// extra empty line.
pub(crate) fn split_lines(file: &str) -> Vec<&str> {
    if file.is_empty() {
        return Vec::new();
    }
    let body = file.strip_suffix('\n').unwrap_or(file);
    body.split('\n').collect()
}

/// Byte range covering lines `start..=end` (1-indexed) with the terminator of
/// the last line.
pub(crate) fn line_byte_range(file: &str, start: usize, end: usize) -> Option<Range<usize>> {
    if start == 0 || end < start {
        return None;
    }
    let mut starts = vec![0usize];
    starts.extend(
        file.bytes()
            .enumerate()
            .filter(|(_, b)| *b == b'\n')
            .map(|(i, _)| i + 1),
    );
    let total = split_lines(file).len();
    if end > total {
        return None;
    }
    let begin = *starts.get(start - 1)?;
    let finish = starts.get(end).copied().unwrap_or(file.len());
    Some(begin..finish)
}

/// Every start offset of `needle` in `haystack`, overlapping matches included.
fn occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let at = from + pos;
        found.push(at);
        let step = haystack[at..].chars().next().map(char::len_utf8).unwrap_or(1);
        from = at + step;
        if from > haystack.len() {
            break;
        }
    }
    found
}

/// Resolve a literal selection to the whole lines it covers.
///
/// The selection must occur exactly once and must start at a line start and
/// end at a line end; partial-line matches are rejected rather than widened.
pub fn locate_selection(file: &str, selection: &str) -> Result<Region, LocateError> {
    if selection.trim().is_empty() {
        return Err(LocateError::EmptySelection);
    }

    let hits = occurrences(file, selection);
    let start = match hits.as_slice() {
        [] => return Err(LocateError::SelectionNotFound),
        [only] => *only,
        many => return Err(LocateError::AmbiguousSelection { count: many.len() }),
    };
    let end = start + selection.len();

    let starts_on_line = start == 0 || file.as_bytes()[start - 1] == b'\n';
    let rest = &file[end..];
    let ends_on_line = selection.ends_with('\n')
        || rest.is_empty()
        || rest.starts_with('\n')
        || rest.starts_with("\r\n");
    if !starts_on_line || !ends_on_line {
        return Err(LocateError::PartialLineSelection);
    }

    let start_line = file[..start].matches('\n').count() + 1;
    let body = selection.strip_suffix('\n').unwrap_or(selection);
    let end_line = start_line + body.matches('\n').count();
    let indent = body
        .split('\n')
        .find(|l| !is_blank(l))
        .map(leading_ws)
        .unwrap_or("")
        .to_string();

    Ok(Region {
        start_line,
        end_line,
        indent,
    })
}

/// Smallest definition block enclosing `line` (1-indexed).
///
/// When the nearest marker above the cursor closes before reaching it (a
/// nested sibling), the search resumes above that marker, so the cursor
/// resolves to the nearest block that actually contains it.
pub fn locate_enclosing(file: &str, line: usize) -> Result<Region, LocateError> {
    let lines = split_lines(file);
    if line == 0 || line > lines.len() {
        return Err(LocateError::LineOutOfRange {
            line,
            total: lines.len(),
        });
    }
    let target = line - 1;

    // A decorator line belongs to the definition it decorates.
    let mut scan_from = target;
    if is_decorator(lines[target]) {
        let width = indent_width(lines[target]);
        let mut next = target;
        while next < lines.len() && is_decorator(lines[next]) && indent_width(lines[next]) == width
        {
            next += 1;
        }
        if next < lines.len() && is_def(lines[next]) && indent_width(lines[next]) == width {
            scan_from = next;
        }
    }

    let mut from = Some(scan_from);
    while let Some(upper) = from {
        let Some(marker) = (0..=upper).rev().find(|&i| is_def(lines[i])) else {
            break;
        };
        let region = block_at(&lines, marker);
        if region.contains(line) {
            return Ok(region);
        }
        from = marker.checked_sub(1);
    }

    Err(LocateError::NoEnclosingBlock { line })
}

/// Block of the first definition named exactly `name`.
pub fn locate_named(file: &str, name: &str) -> Result<Region, LocateError> {
    let lines = split_lines(file);
    lines
        .iter()
        .position(|l| def_name(l) == Some(name))
        .map(|marker| block_at(&lines, marker))
        .ok_or_else(|| LocateError::FunctionNotFound {
            name: name.to_string(),
        })
}

/// Block of a definition named `name`, preferring one declared inside
/// `scope`, then one inside any container, then the first in the file.
pub fn locate_named_preferring(
    file: &str,
    name: &str,
    scope: Option<&Region>,
) -> Result<Region, LocateError> {
    let lines = split_lines(file);
    let markers: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| def_name(l) == Some(name))
        .map(|(i, _)| i)
        .collect();
    let containers: Vec<Region> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| class_name(l).is_some())
        .map(|(i, _)| block_at(&lines, i))
        .collect();

    let inside = |region: &Region, marker: usize| region.contains(marker + 1);
    let preferred = scope
        .and_then(|scope| markers.iter().copied().find(|&m| inside(scope, m)))
        .or_else(|| {
            markers
                .iter()
                .copied()
                .find(|&m| containers.iter().any(|c| inside(c, m)))
        });
    match preferred {
        Some(marker) => Ok(block_at(&lines, marker)),
        None => locate_named(file, name),
    }
}

/// Statement assigning the first `*Parameter(...)` named `name`, including
/// its continuation lines up to the closing bracket.
pub fn locate_param(file: &str, name: &str) -> Result<Region, LocateError> {
    let lines = split_lines(file);
    let marker = lines
        .iter()
        .position(|l| param_name(l) == Some(name))
        .ok_or_else(|| LocateError::ParamNotFound {
            name: name.to_string(),
        })?;

    let mut depth = bracket_delta(lines[marker]);
    let mut end = marker;
    while depth > 0 && end + 1 < lines.len() {
        end += 1;
        depth += bracket_delta(lines[end]);
    }

    Ok(Region {
        start_line: marker + 1,
        end_line: end + 1,
        indent: leading_ws(lines[marker]).to_string(),
    })
}

/// Block of the first container (`class`) named exactly `name`.
pub fn locate_container(file: &str, name: &str) -> Result<Region, LocateError> {
    let lines = split_lines(file);
    lines
        .iter()
        .position(|l| class_name(l) == Some(name))
        .map(|marker| block_at(&lines, marker))
        .ok_or_else(|| LocateError::ClassNotFound {
            name: name.to_string(),
        })
}

/// Block of the first container in the file, whatever its name.
pub fn first_container(file: &str) -> Option<Region> {
    let lines = split_lines(file);
    lines
        .iter()
        .position(|l| class_name(l).is_some())
        .map(|marker| block_at(&lines, marker))
}

/// Block opened by the marker at 0-based index `marker`: preceding
/// same-indent decorators, then every line up to the last non-blank line
/// before a dedent or a same-indent sibling marker.
fn block_at(lines: &[&str], marker: usize) -> Region {
    let width = indent_width(lines[marker]);

    let mut start = marker;
    while start > 0 && is_decorator(lines[start - 1]) && indent_width(lines[start - 1]) == width {
        start -= 1;
    }

    let mut end = marker;
    for (i, line) in lines.iter().enumerate().skip(marker + 1) {
        if is_blank(line) {
            continue;
        }
        let w = indent_width(line);
        if w < width || (w == width && is_block_boundary(line)) {
            break;
        }
        end = i;
    }

    Region {
        start_line: start + 1,
        end_line: end + 1,
        indent: leading_ws(lines[marker]).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FNS: &str = "def f():\n    a()\n\ndef g():\n    b()\n";

    const STRATEGY: &str = "\
from freqtrade.strategy import IStrategy


class Sample(IStrategy):
    timeframe = '5m'

    @property
    def protections(self):
        return []

    def populate_indicators(self, dataframe, metadata):
        def helper(x):
            return x * 2

        dataframe['rsi'] = helper(dataframe['close'])
        return dataframe

    def populate_entry_trend(self, dataframe, metadata):
        return dataframe
";

    fn region(start: usize, end: usize, indent: &str) -> Region {
        Region {
            start_line: start,
            end_line: end,
            indent: indent.to_string(),
        }
    }

    #[test]
    fn test_enclosing_block_excludes_trailing_blank_lines() {
        assert_eq!(locate_enclosing(TWO_FNS, 2), Ok(region(1, 2, "")));
        assert_eq!(locate_enclosing(TWO_FNS, 5), Ok(region(4, 5, "")));
    }

    #[test]
    fn test_selection_scenario_aligned_single_line() {
        assert_eq!(locate_selection(TWO_FNS, "    a()\n"), Ok(region(2, 2, "    ")));
    }

    #[test]
    fn test_selection_without_trailing_newline_still_aligned() {
        assert_eq!(locate_selection(TWO_FNS, "def g():\n    b()"), Ok(region(4, 5, "")));
    }

    #[test]
    fn test_selection_rejects_partial_lines() {
        assert_eq!(
            locate_selection(TWO_FNS, "a()"),
            Err(LocateError::PartialLineSelection)
        );
        assert_eq!(
            locate_selection(TWO_FNS, "f():\n    a()\n"),
            Err(LocateError::PartialLineSelection)
        );
    }

    #[test]
    fn test_selection_zero_or_many_occurrences() {
        assert_eq!(
            locate_selection(TWO_FNS, "    c()\n"),
            Err(LocateError::SelectionNotFound)
        );
        let twice = "x = 1\ny = 2\nx = 1\n";
        assert_eq!(
            locate_selection(twice, "x = 1\n"),
            Err(LocateError::AmbiguousSelection { count: 2 })
        );
        assert_eq!(locate_selection(twice, "  \n"), Err(LocateError::EmptySelection));
    }

    #[test]
    fn test_selection_counts_overlapping_occurrences() {
        let file = "aa\naa\naa\n";
        assert!(matches!(
            locate_selection(file, "aa\naa\n"),
            Err(LocateError::AmbiguousSelection { count: 2 })
        ));
    }

    #[test]
    fn test_every_aligned_unique_line_selection_resolves_to_its_line() {
        for (idx, line) in STRATEGY.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let needle = format!("{line}\n");
            if STRATEGY.matches(needle.as_str()).count() != 1 {
                continue;
            }
            let found = locate_selection(STRATEGY, &needle).unwrap();
            assert_eq!((found.start_line, found.end_line), (idx + 1, idx + 1), "line {line:?}");
        }
    }

    #[test]
    fn test_enclosing_includes_decorators() {
        let r = locate_enclosing(STRATEGY, 9).unwrap();
        assert_eq!(r, region(7, 9, "    "));
        // Cursor on the decorator resolves to the decorated method.
        assert_eq!(locate_enclosing(STRATEGY, 7).unwrap(), r);
    }

    #[test]
    fn test_enclosing_nested_block_resolves_to_nearest() {
        let file = "\
def outer():
    if ready():
        def inner():
            pass
    tail()
";
        assert_eq!(locate_enclosing(file, 4).unwrap(), region(3, 4, "        "));
        // inner closes before the cursor, so the search resumes above it.
        assert_eq!(locate_enclosing(file, 5).unwrap(), region(1, 5, ""));
    }

    #[test]
    fn test_same_indent_plain_lines_stay_in_block() {
        // Only a dedent or a sibling marker closes a block.
        assert_eq!(locate_enclosing(STRATEGY, 13).unwrap(), region(12, 16, "        "));
        let file = "def f():\n    a()\nx = 1\ndef g():\n    b()\n";
        assert_eq!(locate_enclosing(file, 2).unwrap(), region(1, 3, ""));
    }

    #[test]
    fn test_enclosing_is_idempotent_for_flat_blocks() {
        let r = locate_enclosing(STRATEGY, 19).unwrap();
        for line in r.start_line..=r.end_line {
            assert_eq!(locate_enclosing(STRATEGY, line).unwrap(), r);
        }
    }

    #[test]
    fn test_enclosing_without_marker_fails() {
        assert_eq!(
            locate_enclosing(STRATEGY, 1),
            Err(LocateError::NoEnclosingBlock { line: 1 })
        );
        assert_eq!(
            locate_enclosing(STRATEGY, 99),
            Err(LocateError::LineOutOfRange { line: 99, total: 19 })
        );
    }

    #[test]
    fn test_blank_lines_do_not_interrupt_blocks() {
        let file = "def f():\n    a()\n\n\n    b()\ndef g():\n    c()\n";
        assert_eq!(locate_enclosing(file, 2).unwrap(), region(1, 5, ""));
    }

    #[test]
    fn test_named_uses_first_occurrence() {
        let file = "def f():\n    one()\n\ndef f():\n    two()\n";
        assert_eq!(locate_named(file, "f").unwrap(), region(1, 2, ""));
        assert_eq!(
            locate_named(file, "missing"),
            Err(LocateError::FunctionNotFound {
                name: "missing".to_string()
            })
        );
    }

    #[test]
    fn test_container_block_spans_class_body() {
        let r = locate_container(STRATEGY, "Sample").unwrap();
        assert_eq!((r.start_line, r.end_line), (4, 19));
        assert_eq!(first_container(STRATEGY), Some(r));
    }

    #[test]
    fn test_region_slice_is_exact_text() {
        let r = locate_enclosing(TWO_FNS, 2).unwrap();
        assert_eq!(r.slice(TWO_FNS), Some("def f():\n    a()\n"));
        let no_newline = "def f():\n    a()";
        assert_eq!(region(2, 2, "").slice(no_newline), Some("    a()"));
        assert_eq!(region(3, 3, "").slice(no_newline), None);
    }

    #[test]
    fn test_named_preferring_scope_then_any_container() {
        let file = "\
def populate_indicators(dataframe):
    return dataframe


class Helper:
    def populate_indicators(self, dataframe):
        return dataframe


class Sample(IStrategy):
    def populate_indicators(self, dataframe, metadata):
        return dataframe
";
        let scope = locate_container(file, "Sample").unwrap();
        assert_eq!(
            locate_named_preferring(file, "populate_indicators", Some(&scope)).unwrap(),
            region(11, 12, "    ")
        );
        assert_eq!(
            locate_named_preferring(file, "populate_indicators", None).unwrap(),
            region(6, 7, "    ")
        );
        assert_eq!(
            locate_named_preferring("def f():\n    pass\n", "f", Some(&scope)).unwrap(),
            region(1, 2, "")
        );
        assert!(matches!(
            locate_named_preferring(file, "missing", Some(&scope)),
            Err(LocateError::FunctionNotFound { .. })
        ));
    }

    #[test]
    fn test_param_spans_continuation_lines() {
        let file = "\
class Sample(IStrategy):
    buy_rsi = IntParameter(10, 40, default=30, space='buy')
    sell_profit = DecimalParameter(
        0.01, 0.2,
        default=0.05,  # tuned (roughly)
        space='sell',
    )
    stoploss = -0.1
";
        assert_eq!(locate_param(file, "buy_rsi").unwrap(), region(2, 2, "    "));
        assert_eq!(locate_param(file, "sell_profit").unwrap(), region(3, 7, "    "));
        assert_eq!(
            locate_param(file, "stoploss"),
            Err(LocateError::ParamNotFound {
                name: "stoploss".to_string()
            })
        );
    }
}
