//! Assistant turn endpoint
//!
//! One prompt in, one free-text reply out. Replies may carry fenced code and
//! action blocks, see [`blocks`].

pub mod blocks;

use crate::config::Config;
use crate::refine::{Narrator, RefinementState};
use crate::util::truncate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use blocks::{extract_action, extract_code_blocks, CodeBlock};

/// OpenRouter direct API URL
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const MAX_TOKENS: u32 = 4096;
const MAX_FILE_CHARS: usize = 24_000;

const SYSTEM_PROMPT: &str = "You help refine algorithmic trading strategies written in Python. \
When proposing a code change, reply with exactly one fenced python block containing a complete \
function. To run a backtest, add a fenced `action` block with JSON: \
{\"action\": \"backtest\", \"strategy\": NAME, \"config\": {...}} or \
{\"action\": \"batch_backtest\", \"strategy\": NAME, \"configs\": [...]}.";

/// What the assistant sees alongside the prompt.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub file_name: Option<String>,
    pub file: Option<String>,
    pub selection: Option<String>,
    pub last_run: Option<RefinementState>,
}

impl TurnContext {
    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(file) = &self.file {
            let name = self.file_name.as_deref().unwrap_or("strategy.py");
            out.push_str(&format!(
                "Current file {}:\n```python\n{}\n```\n\n",
                name,
                truncate(file, MAX_FILE_CHARS)
            ));
        }
        if let Some(selection) = &self.selection {
            out.push_str(&format!("Selected code:\n```python\n{}\n```\n\n", selection));
        }
        if let Some(run) = &self.last_run {
            if let Ok(json) = serde_json::to_string(&run.summaries) {
                out.push_str(&format!(
                    "Last run of {} ({}): {}\n\n",
                    run.strategy_name, run.stage, json
                ));
            }
        }
        out
    }
}

#[async_trait]
pub trait AssistantApi: Send + Sync {
    async fn turn(&self, prompt: &str, context: &TurnContext) -> anyhow::Result<String>;
}

#[async_trait]
impl<T: AssistantApi> Narrator for T {
    async fn narrate(&self, prompt: &str) -> anyhow::Result<String> {
        self.turn(prompt, &TurnContext::default()).await
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Chat-completions client. Failures are returned as-is; nothing retries.
#[derive(Debug, Clone)]
pub struct OpenRouterAssistant {
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenRouterAssistant {
    pub fn new(model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.assistant_model.clone(), config.get_api_key())
    }
}

#[async_trait]
impl AssistantApi for OpenRouterAssistant {
    async fn turn(&self, prompt: &str, context: &TurnContext) -> anyhow::Result<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No API key configured. Run 'workbench setup' to add one.")
        })?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: format!("{}{}", context.render(), prompt),
                },
            ],
            max_tokens: MAX_TOKENS,
            stream: false,
        };

        debug!(model = %self.model, prompt_chars = prompt.len(), "assistant turn");
        let response = self
            .client
            .post(OPENROUTER_URL)
            .header("X-Title", "Strategy Workbench")
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = match status.as_u16() {
                401 => "Invalid API key. Run 'workbench setup' to update it.".to_string(),
                429 => "Rate limited by OpenRouter. Try again in a few minutes.".to_string(),
                500..=599 => format!(
                    "OpenRouter server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, truncate(&text, 200)),
            };
            return Err(anyhow::anyhow!("{}", message));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!("Failed to parse OpenRouter response: {}\n{}", e, truncate(&text, 200))
        })?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}
