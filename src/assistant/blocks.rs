//! Fenced block extraction from assistant replies.

use crate::refine::RunRequest;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([\w+.-]*)[ \t]*\r?\n(.*?)^[ \t]*```[ \t]*$")
        .expect("valid fence pattern")
});

const ACTION_LANG: &str = "action";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub lang: Option<String>,
    pub code: String,
}

fn fenced_blocks(reply: &str) -> impl Iterator<Item = CodeBlock> + '_ {
    FENCE.captures_iter(reply).map(|caps| {
        let lang = caps
            .get(1)
            .map(|m| m.as_str().to_ascii_lowercase())
            .filter(|l| !l.is_empty());
        let code = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        CodeBlock {
            lang,
            code: code.trim_end_matches(['\r', '\n']).to_string(),
        }
    })
}

/// Code blocks in reply order, excluding action blocks.
pub fn extract_code_blocks(reply: &str) -> Vec<CodeBlock> {
    fenced_blocks(reply)
        .filter(|b| b.lang.as_deref() != Some(ACTION_LANG))
        .collect()
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ActionBlock {
    Backtest {
        strategy: String,
        #[serde(default)]
        config: serde_json::Value,
    },
    BatchBacktest {
        strategy: String,
        configs: Vec<serde_json::Value>,
    },
}

/// The first `action` block, parsed into a run request. A reply with no
/// action block yields `Ok(None)`.
pub fn extract_action(reply: &str) -> anyhow::Result<Option<RunRequest>> {
    let Some(block) = fenced_blocks(reply).find(|b| b.lang.as_deref() == Some(ACTION_LANG)) else {
        return Ok(None);
    };
    let action: ActionBlock = serde_json::from_str(&block.code)
        .map_err(|e| anyhow::anyhow!("Unreadable action block: {}", e))?;
    let request = match action {
        ActionBlock::Backtest { strategy, config } => {
            let config = if config.is_null() {
                serde_json::json!({})
            } else {
                config
            };
            RunRequest::single(strategy, config)
        }
        ActionBlock::BatchBacktest { strategy, configs } => {
            if configs.is_empty() {
                anyhow::bail!("Batch action block has no configs");
            }
            RunRequest::batch(strategy, configs)
        }
    };
    Ok(Some(request))
}
