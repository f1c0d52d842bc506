//! Refinement run state
//!
//! The whole run is one serializable value. The poll task is its only
//! writer; [`RefinementState::reconcile`] is the pure half of a poll tick.

use crate::backtest::{JobId, JobState, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    #[default]
    Single,
    Batch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
}

impl Stage {
    fn rank(self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::Starting => 1,
            Stage::Running => 2,
            Stage::Completed | Stage::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Move forward to `next`. Backward moves, and any move out of a
    /// terminal stage, are refused.
    pub fn advance(&mut self, next: Stage) -> bool {
        if self.is_terminal() || next.rank() <= self.rank() {
            return false;
        }
        *self = next;
        true
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Idle => "idle",
            Stage::Starting => "starting",
            Stage::Running => "running",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        })
    }
}

/// One or more backtest configs to run against a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub kind: RunKind,
    pub strategy: String,
    pub configs: Vec<Value>,
}

impl RunRequest {
    pub fn single(strategy: impl Into<String>, config: Value) -> Self {
        Self {
            kind: RunKind::Single,
            strategy: strategy.into(),
            configs: vec![config],
        }
    }

    pub fn batch(strategy: impl Into<String>, configs: Vec<Value>) -> Self {
        Self {
            kind: RunKind::Batch,
            strategy: strategy.into(),
            configs,
        }
    }
}

/// Per-job metrics in ratio form (0.12 means 12%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSummary {
    pub id: JobId,
    pub profit_total: Option<f64>,
    pub win_rate: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub total_trades: Option<u64>,
}

const PROFIT_KEYS: &[&str] = &["profit_total", "profit_total_pct", "profit_pct"];
const WIN_RATE_KEYS: &[&str] = &["winrate", "win_rate", "winrate_pct"];
const DRAWDOWN_KEYS: &[&str] = &[
    "max_drawdown_account",
    "max_drawdown",
    "max_drawdown_pct",
    "max_relative_drawdown",
];
const TRADES_KEYS: &[&str] = &["total_trades", "trades"];

impl BacktestSummary {
    /// Normalize a results payload. Accepts the per-strategy block
    /// (`strategy.{name}`), the first `strategy_comparison` row, or a flat
    /// object, in that order.
    pub fn from_results(id: JobId, strategy: &str, results: &Value) -> Self {
        let block = metrics_block(results, strategy);
        let total_trades = TRADES_KEYS.iter().find_map(|k| block.get(*k).and_then(as_count));

        let win_rate = first_ratio(block, WIN_RATE_KEYS)
            .map(|w| if w > 1.0 { w / 100.0 } else { w })
            .or_else(|| {
                let wins = block.get("wins").and_then(as_count)?;
                match total_trades {
                    Some(total) if total > 0 => Some(wins as f64 / total as f64),
                    _ => None,
                }
            });

        Self {
            id,
            profit_total: first_ratio(block, PROFIT_KEYS),
            win_rate,
            max_drawdown: first_ratio(block, DRAWDOWN_KEYS).map(f64::abs),
            total_trades,
        }
    }
}

fn metrics_block<'a>(results: &'a Value, strategy: &str) -> &'a Value {
    if let Some(per_strategy) = results.get("strategy").filter(|v| v.is_object()) {
        let named = per_strategy
            .get(strategy)
            .or_else(|| per_strategy.as_object().and_then(|m| m.values().next()));
        if let Some(block) = named {
            return block;
        }
    }
    if let Some(row) = results.get("strategy_comparison").and_then(|c| c.get(0)) {
        return row;
    }
    results
}

fn first_ratio(block: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| block.get(*key).and_then(|v| as_ratio(key, v)))
}

fn as_ratio(key: &str, value: &Value) -> Option<f64> {
    let scaled_key = key.ends_with("_pct");
    match value {
        Value::Number(n) => {
            let n = n.as_f64()?;
            Some(if scaled_key { n / 100.0 } else { n })
        }
        Value::String(s) => {
            let s = s.trim();
            if let Some(pct) = s.strip_suffix('%') {
                return pct.trim().parse::<f64>().ok().map(|n| n / 100.0);
            }
            let n = s.parse::<f64>().ok()?;
            Some(if scaled_key { n / 100.0 } else { n })
        }
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Something the tracker reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Started { run_id: Uuid, ids: Vec<JobId> },
    SubmitFailed { error: String },
    Log { id: JobId, line: String },
    JobCompleted(BacktestSummary),
    JobFailed { id: JobId, error: Option<String> },
    Finished { stage: Stage },
    Narration { reply: String },
    NarrationFailed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementState {
    pub run_id: Uuid,
    #[serde(rename = "type")]
    pub kind: RunKind,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub strategy_name: String,
    pub ids: Vec<JobId>,
    pub completed_ids: Vec<JobId>,
    pub failed_ids: Vec<JobId>,
    pub last_log_line: Option<String>,
    pub last_log_lines: BTreeMap<JobId, String>,
    /// Ids whose completion or failure has already been reported.
    pub announced: BTreeSet<JobId>,
    pub summaries: Vec<BacktestSummary>,
    pub error: Option<String>,
}

impl RefinementState {
    /// A fresh run in `starting`, before any job has been submitted.
    pub fn begin(request: &RunRequest, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind: request.kind,
            stage: Stage::Starting,
            started_at: now,
            updated_at: now,
            strategy_name: request.strategy.clone(),
            ..Self::default()
        }
    }

    pub fn mark_submitted(&mut self, ids: Vec<JobId>, now: DateTime<Utc>) {
        self.ids = ids;
        self.stage.advance(Stage::Running);
        self.updated_at = now;
    }

    pub fn mark_submit_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.error = Some(error);
        self.stage.advance(Stage::Failed);
        self.updated_at = now;
    }

    pub fn pending(&self) -> Vec<JobId> {
        self.ids
            .iter()
            .filter(|id| !self.completed_ids.contains(id))
            .cloned()
            .collect()
    }

    pub fn all_accounted(&self) -> bool {
        !self.ids.is_empty() && self.completed_ids.len() == self.ids.len()
    }

    /// Mean time per finished job times the jobs left. `None` until at
    /// least one job has finished.
    pub fn estimate_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let done = self.completed_ids.len() as u32;
        if done == 0 {
            return None;
        }
        let remaining = self.ids.len().saturating_sub(self.completed_ids.len()) as u32;
        let elapsed = (now - self.started_at).to_std().unwrap_or_default();
        Some(elapsed / done * remaining)
    }

    /// Fold one tick's fetched statuses into the state, returning the
    /// events to report. Repeated statuses for an already reported job are
    /// ignored.
    pub fn reconcile(&mut self, fetched: Vec<JobStatus>, now: DateTime<Utc>) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        if self.stage.is_terminal() {
            return events;
        }

        for status in fetched {
            if !self.ids.contains(&status.id) || self.completed_ids.contains(&status.id) {
                continue;
            }

            if let Some(line) = status.last_log_line() {
                if self.last_log_lines.get(&status.id).map(String::as_str) != Some(line) {
                    self.last_log_lines.insert(status.id.clone(), line.to_string());
                    self.last_log_line = Some(line.to_string());
                    events.push(TrackerEvent::Log {
                        id: status.id.clone(),
                        line: line.to_string(),
                    });
                }
            }

            if status.status == JobState::Failed {
                if self.announced.insert(status.id.clone()) {
                    self.completed_ids.push(status.id.clone());
                    self.failed_ids.push(status.id.clone());
                    events.push(TrackerEvent::JobFailed {
                        id: status.id,
                        error: status.error,
                    });
                }
            } else if status.is_success() && self.announced.insert(status.id.clone()) {
                let results = status.results.unwrap_or_default();
                let summary =
                    BacktestSummary::from_results(status.id.clone(), &self.strategy_name, &results);
                self.completed_ids.push(status.id);
                self.summaries.push(summary.clone());
                events.push(TrackerEvent::JobCompleted(summary));
            }
        }

        if self.all_accounted() {
            let terminal = if self.failed_ids.is_empty() {
                Stage::Completed
            } else {
                Stage::Failed
            };
            if self.stage.advance(terminal) {
                events.push(TrackerEvent::Finished { stage: terminal });
            }
        }

        if !events.is_empty() {
            self.updated_at = now;
        }
        events
    }
}
