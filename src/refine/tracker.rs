//! Poll loop driving a refinement run to completion.

use super::narrate::follow_up_prompt;
use super::state::{RefinementState, RunRequest, Stage, TrackerEvent};
use crate::backtest::{BacktestApi, JobId, JobStatus};
use crate::config::Config;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turns a finished run's follow-up prompt into an assistant reply.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    pub poll_interval: Duration,
    pub auto_narrate: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
            auto_narrate: true,
        }
    }
}

impl TrackerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            auto_narrate: config.auto_narrate,
        }
    }
}

/// Owns the run state and the poll task. Readers get `watch` snapshots;
/// only the tracker and its poll task write.
pub struct RefinementTracker<B, N> {
    api: Arc<B>,
    narrator: Arc<N>,
    options: TrackerOptions,
    state: Arc<watch::Sender<RefinementState>>,
    events: mpsc::Sender<TrackerEvent>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<B, N> RefinementTracker<B, N>
where
    B: BacktestApi + 'static,
    N: Narrator + 'static,
{
    pub fn new(api: B, narrator: N, options: TrackerOptions) -> (Self, mpsc::Receiver<TrackerEvent>) {
        let (events, rx) = mpsc::channel();
        let (state, _) = watch::channel(RefinementState::default());
        let tracker = Self {
            api: Arc::new(api),
            narrator: Arc::new(narrator),
            options,
            state: Arc::new(state),
            events,
            stop_tx: None,
            task: None,
        };
        (tracker, rx)
    }

    pub fn snapshot(&self) -> RefinementState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RefinementState> {
        self.state.subscribe()
    }

    /// Start a run, replacing any previous one. The state reads `starting`
    /// before the first submission is sent. Any failed submission fails the
    /// whole run and no poll loop is armed.
    pub async fn start(&mut self, request: RunRequest) -> anyhow::Result<Uuid> {
        self.stop();

        let begun = RefinementState::begin(&request, Utc::now());
        let run_id = begun.run_id;
        self.state.send_replace(begun);
        info!(%run_id, strategy = %request.strategy, jobs = request.configs.len(), "starting run");

        let submitted = if request.configs.is_empty() {
            Err(anyhow::anyhow!("No backtest configs to run"))
        } else {
            try_join_all(
                request
                    .configs
                    .iter()
                    .map(|config| self.api.submit(&request.strategy, config)),
            )
            .await
        };

        let ids = match submitted {
            Ok(ids) => ids,
            Err(err) => {
                let error = err.to_string();
                warn!(%run_id, error = %error, "backtest submission failed");
                self.state
                    .send_modify(|s| s.mark_submit_failed(error.clone(), Utc::now()));
                let _ = self.events.send(TrackerEvent::SubmitFailed { error });
                return Err(err);
            }
        };

        self.state
            .send_modify(|s| s.mark_submitted(ids.clone(), Utc::now()));
        let _ = self.events.send(TrackerEvent::Started { run_id, ids });

        let (stop_tx, stop_rx) = oneshot::channel();
        let ctx = PollContext {
            run_id,
            api: Arc::clone(&self.api),
            narrator: Arc::clone(&self.narrator),
            options: self.options,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        self.stop_tx = Some(stop_tx);
        self.task = Some(tokio::spawn(poll_loop(ctx, stop_rx)));
        Ok(run_id)
    }

    /// Tear down the poll loop. Fetches already in flight finish on their
    /// own, but their results are never applied.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
            debug!("poll loop stop requested");
        }
        self.task = None;
    }

    /// Wait for the poll loop to end on its own (terminal stage reached and
    /// narration, if any, delivered).
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "poll task ended abnormally");
            }
        }
        self.stop_tx = None;
    }
}

impl<B, N> Drop for RefinementTracker<B, N> {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

struct PollContext<B, N> {
    run_id: Uuid,
    api: Arc<B>,
    narrator: Arc<N>,
    options: TrackerOptions,
    state: Arc<watch::Sender<RefinementState>>,
    events: mpsc::Sender<TrackerEvent>,
}

async fn wait_in_flight<T>(in_flight: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn fetch_statuses<B: BacktestApi>(api: Arc<B>, pending: Vec<JobId>) -> Vec<JobStatus> {
    let results = join_all(pending.iter().map(|id| api.status(id))).await;
    results
        .into_iter()
        .zip(&pending)
        .filter_map(|(result, id)| match result {
            Ok(status) => Some(status),
            Err(err) => {
                debug!(job = %id, error = %err, "status fetch failed, no update this tick");
                None
            }
        })
        .collect()
}

async fn poll_loop<B, N>(ctx: PollContext<B, N>, mut stop_rx: oneshot::Receiver<()>)
where
    B: BacktestApi + 'static,
    N: Narrator + 'static,
{
    let mut interval = tokio::time::interval(ctx.options.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<Vec<JobStatus>>> = None;

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                debug!(run_id = %ctx.run_id, "poll loop stopped");
                return;
            }

            joined = wait_in_flight(&mut in_flight) => {
                in_flight = None;
                let fetched = match joined {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        warn!(run_id = %ctx.run_id, error = %err, "status fetch task failed");
                        continue;
                    }
                };
                if let Some(stage) = apply_tick(&ctx, fetched) {
                    if ctx.options.auto_narrate {
                        narrate(&ctx, stage, &mut stop_rx).await;
                    }
                    return;
                }
            }

            _ = interval.tick() => {
                if in_flight.is_some() {
                    debug!(run_id = %ctx.run_id, "previous poll still in flight, skipping tick");
                    continue;
                }
                let pending = ctx.state.borrow().pending();
                if pending.is_empty() {
                    return;
                }
                in_flight = Some(tokio::spawn(fetch_statuses(Arc::clone(&ctx.api), pending)));
            }
        }
    }
}

/// Fold fetched statuses into the state and report what changed. Returns
/// the terminal stage once the run has finished.
fn apply_tick<B, N>(ctx: &PollContext<B, N>, fetched: Vec<JobStatus>) -> Option<Stage> {
    let mut events = Vec::new();
    ctx.state.send_if_modified(|state| {
        if state.run_id != ctx.run_id {
            return false;
        }
        events = state.reconcile(fetched, Utc::now());
        !events.is_empty()
    });

    let mut finished = None;
    for event in events {
        match &event {
            TrackerEvent::JobCompleted(summary) => {
                info!(run_id = %ctx.run_id, job = %summary.id, "backtest completed");
            }
            TrackerEvent::JobFailed { id, error } => {
                warn!(run_id = %ctx.run_id, job = %id, error = ?error, "backtest failed");
            }
            TrackerEvent::Finished { stage } => finished = Some(*stage),
            _ => {}
        }
        let _ = ctx.events.send(event);
    }

    if let Some(stage) = finished {
        info!(run_id = %ctx.run_id, %stage, "run finished");
    }
    finished
}

/// Ask the narrator about the finished run. A stop, or a newer run taking
/// over the state, drops the reply.
async fn narrate<B, N: Narrator>(
    ctx: &PollContext<B, N>,
    stage: Stage,
    stop_rx: &mut oneshot::Receiver<()>,
) {
    let prompt = follow_up_prompt(&ctx.state.borrow());
    debug!(run_id = %ctx.run_id, %stage, "requesting run narration");
    let reply = tokio::select! {
        biased;

        _ = stop_rx => {
            debug!(run_id = %ctx.run_id, "narration dropped, run torn down");
            return;
        }
        reply = ctx.narrator.narrate(&prompt) => reply,
    };
    if ctx.state.borrow().run_id != ctx.run_id {
        return;
    }
    let event = match reply {
        Ok(reply) => TrackerEvent::Narration { reply },
        Err(err) => TrackerEvent::NarrationFailed {
            error: err.to_string(),
        },
    };
    let _ = ctx.events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted statuses per job. The last scripted status repeats.
    #[derive(Default)]
    struct ScriptedApi {
        scripts: Mutex<HashMap<JobId, VecDeque<JobStatus>>>,
        submit_error: Option<String>,
        submit_delay: Duration,
        fetch_delay: Duration,
        status_calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn script(self, id: u64, statuses: &[(&str, Option<serde_json::Value>)]) -> Self {
            let queue = statuses
                .iter()
                .map(|(state, results)| {
                    serde_json::from_value(json!({
                        "id": id,
                        "status": state,
                        "results": results,
                        "logs": [format!("{id}: {state}")],
                    }))
                    .unwrap()
                })
                .collect();
            self.scripts.lock().unwrap().insert(JobId::from(id), queue);
            self
        }
    }

    #[async_trait]
    impl BacktestApi for ScriptedApi {
        async fn submit(&self, _strategy: &str, config: &serde_json::Value) -> anyhow::Result<JobId> {
            tokio::time::sleep(self.submit_delay).await;
            if let Some(err) = &self.submit_error {
                anyhow::bail!("{}", err);
            }
            Ok(JobId::from(config["job"].as_u64().unwrap()))
        }

        async fn status(&self, id: &JobId) -> anyhow::Result<JobStatus> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.fetch_delay).await;
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown job {}", id))?;
            let status = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            status.ok_or_else(|| anyhow::anyhow!("no script for {}", id))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNarrator {
        prompts: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait]
    impl Narrator for RecordingNarrator {
        async fn narrate(&self, prompt: &str) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            tokio::time::sleep(self.delay).await;
            Ok("compare the runs".to_string())
        }
    }

    fn batch(ids: &[u64]) -> RunRequest {
        RunRequest::batch("Sample", ids.iter().map(|id| json!({"job": id})).collect())
    }

    fn options() -> TrackerOptions {
        TrackerOptions {
            poll_interval: Duration::from_millis(1500),
            auto_narrate: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_runs_to_failed_and_narrates_once() {
        let api = ScriptedApi::default()
            .script(1, &[("completed", Some(json!({"total_trades": 30, "profit_total": 0.04})))])
            .script(2, &[("running", None), ("failed", None)]);
        let narrator = RecordingNarrator::default();
        let (mut tracker, events) = RefinementTracker::new(api, narrator.clone(), options());

        let mut rx = tracker.subscribe();
        tracker.start(batch(&[1, 2])).await.unwrap();
        assert_eq!(tracker.snapshot().stage, Stage::Running);

        {
            let state = rx.wait_for(|s| !s.completed_ids.is_empty()).await.unwrap();
            assert_eq!(state.stage, Stage::Running);
            assert_eq!(state.completed_ids, vec![JobId::from(1)]);
            assert_eq!(state.summaries.len(), 1);
        }

        tracker.join().await;
        let state = tracker.snapshot();
        assert_eq!(state.stage, Stage::Failed);
        assert_eq!(state.completed_ids, vec![JobId::from(1), JobId::from(2)]);
        assert_eq!(state.summaries.len(), 1);

        let events: Vec<TrackerEvent> = events.try_iter().collect();
        let count = |f: fn(&TrackerEvent) -> bool| events.iter().filter(|e| f(e)).count();
        assert_eq!(count(|e| matches!(e, TrackerEvent::Started { .. })), 1);
        assert_eq!(count(|e| matches!(e, TrackerEvent::JobCompleted(_))), 1);
        assert_eq!(count(|e| matches!(e, TrackerEvent::JobFailed { .. })), 1);
        assert_eq!(count(|e| matches!(e, TrackerEvent::Finished { .. })), 1);
        assert_eq!(count(|e| matches!(e, TrackerEvent::Narration { .. })), 1);

        let prompts = narrator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Failed runs: 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_failure_fails_run_without_polling() {
        let api = ScriptedApi {
            submit_error: Some("backtest service offline".to_string()),
            ..ScriptedApi::default()
        };
        let (mut tracker, events) =
            RefinementTracker::new(api, RecordingNarrator::default(), options());

        assert!(tracker.start(batch(&[1])).await.is_err());
        let state = tracker.snapshot();
        assert_eq!(state.stage, Stage::Failed);
        assert!(state.ids.is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tracker.api.status_calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            TrackerEvent::SubmitFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_results() {
        let api = ScriptedApi {
            fetch_delay: Duration::from_secs(5),
            ..ScriptedApi::default()
        }
        .script(1, &[("completed", Some(json!({"total_trades": 3})))]);
        let (mut tracker, _events) =
            RefinementTracker::new(api, RecordingNarrator::default(), options());

        tracker.start(batch(&[1])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(tracker.api.status_calls.load(Ordering::SeqCst), 1);

        tracker.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let state = tracker.snapshot();
        assert_eq!(state.stage, Stage::Running);
        assert!(state.completed_ids.is_empty());
        assert_eq!(tracker.api.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetches_do_not_overlap() {
        let api = ScriptedApi {
            fetch_delay: Duration::from_secs(4),
            ..ScriptedApi::default()
        }
        .script(1, &[("running", None)]);
        let (mut tracker, _events) =
            RefinementTracker::new(api, RecordingNarrator::default(), options());

        tracker.start(batch(&[1])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let calls = tracker.api.status_calls.load(Ordering::SeqCst);
        assert!((2..=3).contains(&calls), "calls = {calls}");
        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_run_replaces_previous() {
        let api = ScriptedApi::default()
            .script(1, &[("running", None)])
            .script(2, &[("completed", Some(json!({"total_trades": 50})))]);
        let (mut tracker, _events) = RefinementTracker::new(
            api,
            RecordingNarrator::default(),
            TrackerOptions {
                auto_narrate: false,
                ..options()
            },
        );

        let first = tracker.start(batch(&[1])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = tracker.start(RunRequest::single("Sample", json!({"job": 2}))).await.unwrap();
        assert_ne!(first, second);

        tracker.join().await;
        let state = tracker.snapshot();
        assert_eq!(state.run_id, second);
        assert_eq!(state.stage, Stage::Completed);
        assert_eq!(state.ids, vec![JobId::from(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_is_published_before_submission_resolves() {
        let api = ScriptedApi {
            submit_delay: Duration::from_secs(3),
            ..ScriptedApi::default()
        }
        .script(1, &[("running", None)]);
        let (mut tracker, _events) =
            RefinementTracker::new(api, RecordingNarrator::default(), options());

        let mut rx = tracker.subscribe();
        let observe = async {
            rx.changed().await.unwrap();
            let seen = rx.borrow_and_update().clone();
            (seen, tokio::time::Instant::now())
        };
        let begun = tokio::time::Instant::now();
        let (started, (seen, seen_at)) = tokio::join!(tracker.start(batch(&[1])), observe);

        assert_eq!(seen.stage, Stage::Starting);
        assert!(seen.ids.is_empty());
        assert_eq!(seen.strategy_name, "Sample");
        assert!(seen_at - begun < Duration::from_secs(3));

        assert_eq!(started.unwrap(), seen.run_id);
        let state = tracker.snapshot();
        assert_eq!(state.stage, Stage::Running);
        assert_eq!(state.ids, vec![JobId::from(1)]);
        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_run_never_delivers_its_narration() {
        let api = ScriptedApi::default()
            .script(1, &[("completed", Some(json!({"total_trades": 30})))])
            .script(2, &[("running", None)]);
        let narrator = RecordingNarrator {
            delay: Duration::from_secs(10),
            ..RecordingNarrator::default()
        };
        let (mut tracker, events) = RefinementTracker::new(api, narrator.clone(), options());

        tracker.start(RunRequest::single("Old", json!({"job": 1}))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tracker.snapshot().stage, Stage::Completed);
        assert_eq!(narrator.prompts.lock().unwrap().len(), 1);

        let second = tracker.start(RunRequest::single("New", json!({"job": 2}))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let state = tracker.snapshot();
        assert_eq!(state.run_id, second);
        assert_eq!(state.strategy_name, "New");
        assert_eq!(state.stage, Stage::Running);

        let events: Vec<TrackerEvent> = events.try_iter().collect();
        assert!(
            !events.iter().any(|e| matches!(e, TrackerEvent::Narration { .. } | TrackerEvent::NarrationFailed { .. })),
            "{events:?}"
        );
        assert_eq!(
            events.iter().filter(|e| matches!(e, TrackerEvent::Started { .. })).count(),
            2
        );
        tracker.stop();
    }
}
