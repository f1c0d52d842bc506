//! Unified diff rendering and parsing
//!
//! Renders the preview diff for locally validated edits and parses diffs
//! handed back by a remote validator so the preview can report stats.

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// (additions, removals) in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self.lines.iter().filter(|l| matches!(l, DiffLine::Remove(_))).count();
        (adds, removes)
    }
}

/// A parsed unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    /// Get total additions and deletions
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }
}

const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Equal,
    Remove,
    Add,
}

/// One step of the edit script, with the old/new line index it sits at.
#[derive(Debug, Clone, Copy)]
struct Op {
    kind: OpKind,
    old: usize,
    new: usize,
}

/// Edit script between two line lists. The common leading and trailing
/// lines are matched directly so the LCS table only spans the changed window.
fn edit_script(old: &[&str], new: &[&str]) -> Vec<Op> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let (old_tail, new_tail) = (old.len() - suffix, new.len() - suffix);

    let mut ops = Vec::with_capacity(old.len() + new.len());
    ops.extend((0..prefix).map(|i| Op { kind: OpKind::Equal, old: i, new: i }));
    ops.extend(
        lcs_script(&old[prefix..old_tail], &new[prefix..new_tail])
            .into_iter()
            .map(|op| Op { old: op.old + prefix, new: op.new + prefix, ..op }),
    );
    ops.extend((0..suffix).map(|k| Op {
        kind: OpKind::Equal,
        old: old_tail + k,
        new: new_tail + k,
    }));
    ops
}

/// Longest-common-subsequence edit script between two line lists.
fn lcs_script(old: &[&str], new: &[&str]) -> Vec<Op> {
    let (n, m) = (old.len(), new.len());
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if old[i] == new[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && old[i] == new[j] {
            ops.push(Op { kind: OpKind::Equal, old: i, new: j });
            i += 1;
            j += 1;
        } else if i < n && (j == m || table[i + 1][j] >= table[i][j + 1]) {
            ops.push(Op { kind: OpKind::Remove, old: i, new: j });
            i += 1;
        } else {
            ops.push(Op { kind: OpKind::Add, old: i, new: j });
            j += 1;
        }
    }
    ops
}

fn format_range(start: usize, count: usize) -> String {
    // An empty side points at the line before the change.
    let start = if count == 0 { start } else { start + 1 };
    if count == 1 {
        start.to_string()
    } else {
        format!("{},{}", start, count)
    }
}

/// Render a unified diff (`--- before` / `+++ after`, three context lines).
/// Identical inputs render as an empty string.
pub fn render_unified_diff(before: &str, after: &str) -> String {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();
    let ops = edit_script(&old, &new);

    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.kind != OpKind::Equal)
        .map(|(i, _)| i)
        .collect();
    if changes.is_empty() {
        return String::new();
    }

    // Group changes whose context windows touch.
    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &idx in &changes {
        let lo = idx.saturating_sub(CONTEXT_LINES);
        let hi = (idx + CONTEXT_LINES).min(ops.len() - 1);
        match groups.last_mut() {
            Some((_, end)) if lo <= *end + 1 => *end = hi,
            _ => groups.push((lo, hi)),
        }
    }

    let mut out = vec!["--- before".to_string(), "+++ after".to_string()];
    for (lo, hi) in groups {
        let window = &ops[lo..=hi];
        let old_count = window.iter().filter(|op| op.kind != OpKind::Add).count();
        let new_count = window.iter().filter(|op| op.kind != OpKind::Remove).count();
        out.push(format!(
            "@@ -{} +{} @@",
            format_range(window[0].old, old_count),
            format_range(window[0].new, new_count)
        ));
        for op in window {
            out.push(match op.kind {
                OpKind::Equal => format!(" {}", old[op.old]),
                OpKind::Remove => format!("-{}", old[op.old]),
                OpKind::Add => format!("+{}", new[op.new]),
            });
        }
    }
    out.join("\n")
}

/// Parse a unified diff string into structured data
pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, String> {
    let lines: Vec<&str> = diff.lines().collect();

    if lines.len() < 3 {
        return Err("Diff too short".to_string());
    }

    // Find --- and +++ lines
    let mut old_path = String::new();
    let mut new_path = String::new();
    let mut start_idx = 0;

    for (i, line) in lines.iter().enumerate() {
        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = rest.trim_start_matches("a/").to_string();
            // Handle timestamp suffix
            if let Some(tab_pos) = old_path.find('\t') {
                old_path.truncate(tab_pos);
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            new_path = rest.trim_start_matches("b/").to_string();
            if let Some(tab_pos) = new_path.find('\t') {
                new_path.truncate(tab_pos);
            }
            start_idx = i + 1;
            break;
        }
    }

    if old_path.is_empty() || new_path.is_empty() {
        return Err("Could not find file paths in diff".to_string());
    }

    let mut hunks = Vec::new();
    let mut i = start_idx;

    while i < lines.len() {
        // Parse hunk header: @@ -start,count +start,count @@
        if lines[i].starts_with("@@ ") {
            let hunk = parse_hunk(&lines, &mut i)?;
            hunks.push(hunk);
        } else {
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err("No hunks found in diff".to_string());
    }

    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

/// Parse a single hunk from the diff
fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let header = lines[*idx];

    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(format!("Invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];

        // Stop at next hunk or end
        if line.starts_with("@@ ") || line.starts_with("diff ") {
            break;
        }

        if let Some(added) = line.strip_prefix('+').filter(|_| !line.starts_with("+++")) {
            diff_lines.push(DiffLine::Add(added.to_string()));
        } else if let Some(removed) = line.strip_prefix('-').filter(|_| !line.starts_with("---")) {
            diff_lines.push(DiffLine::Remove(removed.to_string()));
        } else if let Some(context) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(context.to_string()));
        } else if line.is_empty() {
            diff_lines.push(DiffLine::Context(String::new()));
        }
        // Skip other lines (like "\ No newline at end of file")

        *idx += 1;
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    if let Some((start, count)) = s.split_once(',') {
        let start: usize = start.parse().map_err(|_| format!("Invalid start: {}", s))?;
        let count: usize = count.parse().map_err(|_| format!("Invalid count: {}", s))?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| format!("Invalid line number: {}", s))?;
        Ok((start, 1))
    }
}
