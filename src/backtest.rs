//! Backtest job service client
//!
//! Jobs are submitted one config at a time and polled by id. The service
//! may report ids as numbers or strings; both are kept verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        JobId(id.to_string())
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(serde_json::Number),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => JobId(n.to_string()),
            Raw::Text(s) => JobId(s),
        })
    }
}

/// Upstream job state. Anything that is not finished yet (`queued`,
/// `pending`, ...) counts as running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Completed,
    Failed,
    #[serde(other)]
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub status: JobState,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn last_log_line(&self) -> Option<&str> {
        self.logs
            .iter()
            .rev()
            .map(|l| l.trim_end())
            .find(|l| !l.is_empty())
    }

    /// Completed with a results payload. `completed` alone is not enough.
    pub fn is_success(&self) -> bool {
        self.status == JobState::Completed
            && self.results.as_ref().is_some_and(|r| !r.is_null())
    }
}

#[async_trait]
pub trait BacktestApi: Send + Sync {
    async fn submit(&self, strategy: &str, config: &serde_json::Value) -> anyhow::Result<JobId>;
    async fn status(&self, id: &JobId) -> anyhow::Result<JobStatus>;
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    strategy: &'a str,
    config: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: JobId,
}

#[derive(Debug, Clone)]
pub struct HttpBacktestApi {
    base: Url,
    client: reqwest::Client,
}

impl HttpBacktestApi {
    /// `base` must end with `/` so `backtests` nests under it.
    pub fn new(base: Url) -> Self {
        Self {
            base,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base
            .join(path)
            .map_err(|e| anyhow::anyhow!("Invalid backtest endpoint {}: {}", path, e))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(anyhow::anyhow!(
            "Backtest service error {} on {}: {}",
            status,
            what,
            crate::util::truncate(text.trim(), 200)
        ));
    }
    serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("Failed to parse {} response: {}", what, e))
}

#[async_trait]
impl BacktestApi for HttpBacktestApi {
    async fn submit(&self, strategy: &str, config: &serde_json::Value) -> anyhow::Result<JobId> {
        let url = self.endpoint("backtests")?;
        debug!(%url, strategy, "submitting backtest");
        let response = self
            .client
            .post(url)
            .json(&SubmitRequest { strategy, config })
            .send()
            .await?;
        let parsed: SubmitResponse = read_json(response, "submit").await?;
        Ok(parsed.id)
    }

    async fn status(&self, id: &JobId) -> anyhow::Result<JobStatus> {
        let url = self.endpoint(&format!("backtests/{}", id))?;
        let response = self.client.get(url).send().await?;
        read_json(response, "status").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id_accepts_numbers_and_strings() {
        let numeric: JobId = serde_json::from_value(json!(42)).unwrap();
        let text: JobId = serde_json::from_value(json!("bt-7")).unwrap();
        assert_eq!(numeric, JobId::from(42));
        assert_eq!(text.as_str(), "bt-7");
    }

    #[test]
    fn test_unknown_state_is_running() {
        let status: JobStatus =
            serde_json::from_value(json!({"id": 3, "status": "queued"})).unwrap();
        assert_eq!(status.status, JobState::Running);
        assert!(status.logs.is_empty());
    }

    #[test]
    fn test_completed_without_results_is_not_success() {
        let bare: JobStatus =
            serde_json::from_value(json!({"id": 1, "status": "completed"})).unwrap();
        let null: JobStatus =
            serde_json::from_value(json!({"id": 1, "status": "completed", "results": null}))
                .unwrap();
        let full: JobStatus = serde_json::from_value(
            json!({"id": 1, "status": "completed", "results": {"total_trades": 3}}),
        )
        .unwrap();
        assert!(!bare.is_success());
        assert!(!null.is_success());
        assert!(full.is_success());
    }

    #[test]
    fn test_last_log_line_skips_trailing_blanks() {
        let status: JobStatus = serde_json::from_value(
            json!({"id": 1, "status": "running", "logs": ["loading data", "epoch 3/10", ""]}),
        )
        .unwrap();
        assert_eq!(status.last_log_line(), Some("epoch 3/10"));
    }

    #[test]
    fn test_endpoints_nest_under_base() {
        let api = HttpBacktestApi::new(Url::parse("http://bt.local/api/").unwrap());
        assert_eq!(
            api.endpoint("backtests/9").unwrap().as_str(),
            "http://bt.local/api/backtests/9"
        );
    }
}
