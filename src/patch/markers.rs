//! Marker vocabulary for indentation-delimited strategy files
//!
//! Everything the locator knows about the language lives here: which lines
//! open a named block, which lines decorate one, which lines open a
//! container, and which lines assign a hyperopt parameter. Nothing is parsed
//! beyond a single line at a time.

use regex::Regex;
use std::sync::LazyLock;

static DEF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*(?:async[ \t]+)?def[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*\(")
        .expect("valid def marker pattern")
});

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*class[ \t]+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid class marker pattern")
});

static DECORATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*@").expect("valid decorator pattern")
});

static INDICATORS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*(?:async[ \t]+)?def[ \t]+populate_[A-Za-z0-9_]*[ \t]*\(")
        .expect("valid populate pattern")
});

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[ \t]*([A-Za-z_][A-Za-z0-9_]*)[ \t]*(?::[^=]*)?=[ \t]*(?:[A-Za-z_][A-Za-z0-9_]*\.)*[A-Za-z0-9_]*Parameter[A-Za-z0-9_]*[ \t]*\(",
    )
    .expect("valid parameter pattern")
});

/// Name introduced by a definition line (`def name(`), if any.
pub fn def_name(line: &str) -> Option<&str> {
    DEF_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Name introduced by a container line (`class Name`), if any.
pub fn class_name(line: &str) -> Option<&str> {
    CLASS_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Name assigned a `*Parameter(...)` call on this line (`buy_rsi =
/// IntParameter(`), if any.
pub fn param_name(line: &str) -> Option<&str> {
    PARAM_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Net bracket depth change across `line`, ignoring brackets inside string
/// literals and after a comment.
pub fn bracket_delta(line: &str) -> i32 {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '#' => break,
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            },
        }
    }
    depth
}

pub fn is_def(line: &str) -> bool {
    DEF_RE.is_match(line)
}

pub fn is_class(line: &str) -> bool {
    CLASS_RE.is_match(line)
}

pub fn is_decorator(line: &str) -> bool {
    DECORATOR_RE.is_match(line)
}

/// `populate_indicators`-style hook definitions.
pub fn is_populate_hook(line: &str) -> bool {
    INDICATORS_RE.is_match(line)
}

/// Any line that starts a new sibling block at its indentation.
pub fn is_block_boundary(line: &str) -> bool {
    is_def(line) || is_decorator(line) || is_class(line)
}

/// Raw leading whitespace. Tabs and spaces are not normalized.
pub fn leading_ws(line: &str) -> &str {
    let end = line
        .char_indices()
        .find(|(_, c)| *c != ' ' && *c != '\t')
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    &line[..end]
}

/// Indentation width in whitespace characters.
pub fn indent_width(line: &str) -> usize {
    leading_ws(line).chars().count()
}

pub fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_def_name_variants() {
        assert_eq!(def_name("def f():"), Some("f"));
        assert_eq!(def_name("    async def fetch_data(self, x):"), Some("fetch_data"));
        assert_eq!(def_name("\tdef  spaced (a):"), Some("spaced"));
        assert_eq!(def_name("    x = define(3)"), None);
        assert_eq!(def_name("# def commented():"), None);
    }

    #[test]
    fn test_class_and_decorator_markers() {
        assert_eq!(class_name("class MyStrategy(IStrategy):"), Some("MyStrategy"));
        assert!(is_decorator("    @property"));
        assert!(!is_decorator("    x = a @ b"));
        assert!(is_block_boundary("    @informative('1h')"));
    }

    #[test]
    fn test_leading_ws_counts_tabs_and_spaces_alike() {
        assert_eq!(leading_ws("\t  x"), "\t  ");
        assert_eq!(indent_width("\t  x"), 3);
        assert_eq!(indent_width("    "), 4);
    }

    #[test]
    fn test_populate_hook_detection() {
        assert!(is_populate_hook("    def populate_indicators(self, dataframe, metadata):"));
        assert!(is_populate_hook("    def populate_entry_trend(self, df, md):"));
        assert!(!is_populate_hook("    def custom_stoploss(self):"));
    }

    #[test]
    fn test_param_assignment_markers() {
        assert_eq!(param_name("    buy_rsi = IntParameter(10, 40, default=30, space='buy')"), Some("buy_rsi"));
        assert_eq!(param_name("    sell_x: DecimalParameter = DecimalParameter(0.1, 0.5,"), Some("sell_x"));
        assert_eq!(param_name("    use_ema = freqtrade.strategy.BooleanParameter(default=True)"), Some("use_ema"));
        assert_eq!(param_name("    stoploss = -0.1"), None);
        assert_eq!(param_name("    if x == IntParameter(1, 2):"), None);
    }

    #[test]
    fn test_bracket_delta_skips_strings_and_comments() {
        assert_eq!(bracket_delta("x = IntParameter(10, 40,"), 1);
        assert_eq!(bracket_delta("    space='buy(')  # close ("), -1);
        assert_eq!(bracket_delta("f({'a': [1, 2]})"), 0);
        assert_eq!(bracket_delta(r#"s = "\")(""#), 0);
    }
}
