//! Advisory check that a proposed snippet targets the function it replaces

use super::locate::locate_enclosing;
use super::markers::{def_name, is_class};

/// The single function name a block of code defines.
///
/// Returns `None` when the text defines no function, several functions, or
/// contains a class: ambiguous blocks are never matched automatically.
pub fn extract_def_name(text: &str) -> Option<String> {
    let mut found: Option<&str> = None;
    for line in text.lines() {
        if is_class(line) {
            return None;
        }
        if let Some(name) = def_name(line) {
            if found.is_some() {
                return None;
            }
            found = Some(name);
        }
    }
    found.map(str::to_string)
}

/// Name the user is currently pointing at: the selection when there is one,
/// otherwise the block enclosing the cursor.
pub fn context_name(file: &str, selection: Option<&str>, cursor_line: Option<usize>) -> Option<String> {
    if let Some(selection) = selection.filter(|s| !s.trim().is_empty()) {
        return extract_def_name(selection);
    }
    let region = locate_enclosing(file, cursor_line?).ok()?;
    extract_def_name(region.slice(file)?)
}

/// Warning text when the snippet defines a different function than the one
/// targeted. Equal names, or a missing name on either side, never warn.
pub fn detect_mismatch(target_name: Option<&str>, snippet: &str) -> Option<String> {
    let target = target_name?;
    let proposed = extract_def_name(snippet)?;
    if proposed == target {
        return None;
    }
    Some(format!(
        "The proposed code defines `{proposed}`, but the targeted code is `{target}`. \
         Applying it will replace `{target}` with `{proposed}`."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_single_name() {
        assert_eq!(
            extract_def_name("    def populate_indicators(self, df, md):\n        return df\n"),
            Some("populate_indicators".to_string())
        );
        assert_eq!(extract_def_name("x = 1\n"), None);
    }

    #[test]
    fn test_extract_rejects_ambiguous_blocks() {
        assert_eq!(extract_def_name("def a():\n    pass\ndef b():\n    pass\n"), None);
        assert_eq!(extract_def_name("class A:\n    def a(self):\n        pass\n"), None);
    }

    #[test]
    fn test_two_defs_in_snippet_never_warn() {
        let snippet = "def a():\n    pass\n\ndef b():\n    pass\n";
        assert_eq!(detect_mismatch(Some("a"), snippet), None);
        assert_eq!(detect_mismatch(Some("zzz"), snippet), None);
        assert_eq!(detect_mismatch(None, snippet), None);
    }

    #[test]
    fn test_mismatch_warns_on_different_names() {
        let warning = detect_mismatch(Some("populate_exit_trend"), "def populate_entry_trend(self):\n    pass\n");
        let text = warning.unwrap();
        assert!(text.contains("populate_entry_trend"));
        assert!(text.contains("populate_exit_trend"));
        assert_eq!(detect_mismatch(Some("f"), "def f():\n    pass\n"), None);
        assert_eq!(detect_mismatch(Some("f"), "    return 1\n"), None);
    }

    #[test]
    fn test_context_name_prefers_selection_over_cursor() {
        let file = "def f():\n    a()\n\ndef g():\n    b()\n";
        assert_eq!(
            context_name(file, Some("def g():\n    b()\n"), Some(2)),
            Some("g".to_string())
        );
        assert_eq!(context_name(file, None, Some(2)), Some("f".to_string()));
        assert_eq!(context_name(file, Some("   "), Some(5)), Some("g".to_string()));
        assert_eq!(context_name(file, None, None), None);
        // A body-only selection names nothing.
        assert_eq!(context_name(file, Some("    a()\n"), Some(5)), None);
    }
}
