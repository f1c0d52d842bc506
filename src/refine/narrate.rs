//! Follow-up prompt synthesized when a run finishes.

use super::state::{BacktestSummary, RefinementState, RunKind};

const FEW_TRADES: u64 = 20;
const LOW_WIN_RATE: f64 = 0.4;
const DEEP_DRAWDOWN: f64 = 0.25;

fn pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}%", v * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

fn trades(value: Option<u64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

/// Where to look next, from the most pressing problem down.
fn focus_hints(summary: &BacktestSummary) -> Vec<&'static str> {
    let mut hints = Vec::new();
    if summary.total_trades.is_some_and(|t| t < FEW_TRADES) {
        hints.push("Very few trades: entry conditions may be too strict, consider loosening them.");
    }
    if summary.win_rate.is_some_and(|w| w < LOW_WIN_RATE) {
        hints.push("Low win rate: improve entry filters or add trend confirmation.");
    }
    if summary.max_drawdown.is_some_and(|d| d > DEEP_DRAWDOWN) {
        hints.push("Deep drawdown: tighten the stoploss or add protections.");
    }
    if summary.profit_total.is_some_and(|p| p <= 0.0) {
        hints.push("Unprofitable: revisit exit logic and ROI targets.");
    }
    if hints.is_empty() {
        hints.push("Results look healthy: fine-tune parameters or run a hyperopt pass.");
    }
    hints
}

/// Build the assistant turn that summarizes a finished run.
pub fn follow_up_prompt(state: &RefinementState) -> String {
    match state.kind {
        RunKind::Single => single_prompt(state),
        RunKind::Batch => batch_prompt(state),
    }
}

fn single_prompt(state: &RefinementState) -> String {
    let Some(summary) = state.summaries.first() else {
        let reason = state.error.as_deref().unwrap_or("no results were produced");
        return format!(
            "The backtest of {} failed ({}). Explain the likely cause and suggest a fix.",
            state.strategy_name, reason
        );
    };

    let mut out = format!(
        "The backtest of {} finished.\n\n\
         - Total profit: {}\n\
         - Win rate: {}\n\
         - Max drawdown: {}\n\
         - Trades: {}\n\n\
         What to focus on next:\n",
        state.strategy_name,
        pct(summary.profit_total),
        pct(summary.win_rate),
        pct(summary.max_drawdown),
        trades(summary.total_trades),
    );
    for hint in focus_hints(summary) {
        out.push_str("- ");
        out.push_str(hint);
        out.push('\n');
    }
    out.push_str("\nPropose one concrete change to the strategy.");
    out
}

fn batch_prompt(state: &RefinementState) -> String {
    let mut out = format!(
        "The batch of {} backtests for {} finished.\n\n\
         | Run | Profit | Win rate | Max drawdown | Trades |\n\
         |-----|--------|----------|--------------|--------|\n",
        state.ids.len(),
        state.strategy_name
    );
    for summary in &state.summaries {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            summary.id,
            pct(summary.profit_total),
            pct(summary.win_rate),
            pct(summary.max_drawdown),
            trades(summary.total_trades),
        ));
    }
    if !state.failed_ids.is_empty() {
        let failed: Vec<String> = state.failed_ids.iter().map(|id| id.to_string()).collect();
        out.push_str(&format!("\nFailed runs: {}\n", failed.join(", ")));
    }
    out.push_str(
        "\nCompare these runs: which configuration is most robust, and what should change next?",
    );
    out
}
