//! Streaming session: one multi-step run under an already-held device
//! lock, publishing ordered events and honoring cooperative abort.
//!
//! The session never touches the durable handle until it completes
//! successfully. It runs against a fresh clone of the conversational
//! context; on a finished/max-steps stop the clone's context is copied
//! back and the original's per-run counters are reset. On abort the clone
//! is discarded and the original is left exactly as it was.
//!
//! Abort points are step boundaries only: a running step is never
//! preempted — its result is discarded instead. A worker still running
//! when the stream ends is joined by a background reaper (bounded, with
//! logged abandonment), and the device lock is released only after that
//! reaper finishes.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::{BackendError, StepResult, StreamEvent};

use crate::orchestrator::Orchestrator;
use crate::registry::SharedBackend;

/// Everything the session driver needs, bundled at spawn time.
pub(crate) struct SessionContext {
    pub orchestrator: Arc<Orchestrator>,
    pub device_key: String,
    /// The durable handle, untouched until successful completion.
    pub original: SharedBackend,
    /// Fresh clone the steps run against.
    pub streaming: SharedBackend,
    /// Task input carried by the first step.
    pub task: String,
    pub max_steps: u32,
    pub join_timeout: Duration,
    /// The one cooperative abort flag for this session.
    pub token: CancellationToken,
    pub events: mpsc::Sender<StreamEvent>,
}

/// Consumer side of a streaming session.
#[derive(Debug)]
pub struct StreamingSession {
    device_key: String,
    events: mpsc::Receiver<StreamEvent>,
    abort: CancellationToken,
}

impl StreamingSession {
    /// Device this session runs against.
    pub fn device_key(&self) -> &str {
        &self.device_key
    }

    /// Next event, in order. `None` once the channel is drained after a
    /// terminal event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Signal cooperative abort. The running step (if any) completes and
    /// is discarded; no further steps dispatch.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// The session's abort token.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Tear into the raw event receiver (for transport adapters).
    pub fn into_events(self) -> mpsc::Receiver<StreamEvent> {
        self.events
    }
}

/// How the drive loop ended, and what cleanup still owes.
enum SessionEnd {
    /// Terminal event emitted, no worker left behind.
    Settled,
    /// Aborted while a step worker was still running.
    AbandonedWorker(JoinHandle<Result<StepResult, BackendError>>),
}

/// Spawn the driver task and hand back the consumer side.
pub(crate) fn spawn_session(
    ctx: SessionContext,
    receiver: mpsc::Receiver<StreamEvent>,
) -> StreamingSession {
    let session = StreamingSession {
        device_key: ctx.device_key.clone(),
        events: receiver,
        abort: ctx.token.clone(),
    };
    let _ = tokio::spawn(run(ctx));
    session
}

async fn run(ctx: SessionContext) {
    let end = drive(&ctx).await;

    // Reap any abandoned worker before giving the lock back: the durable
    // handle must not become acquirable while a clone step is in flight.
    if let SessionEnd::AbandonedWorker(worker) = end {
        match tokio::time::timeout(ctx.join_timeout, worker).await {
            Ok(_) => debug!(device_key = %ctx.device_key, "abandoned step worker finished"),
            Err(_elapsed) => warn!(
                device_key = %ctx.device_key,
                timeout_ms = ctx.join_timeout.as_millis() as u64,
                "step worker still running after join timeout, abandoning"
            ),
        }
    }

    ctx.orchestrator.finish_session(&ctx.device_key);
}

async fn drive(ctx: &SessionContext) -> SessionEnd {
    let mut first = true;

    loop {
        // Abort checkpoint: before dispatching any work.
        if ctx.token.is_cancelled() {
            emit_aborted(ctx).await;
            return SessionEnd::Settled;
        }

        let task = first.then(|| ctx.task.clone());
        first = false;

        let backend = Arc::clone(&ctx.streaming);
        let mut worker =
            tokio::task::spawn_blocking(move || backend.lock().step(task.as_deref()));

        // Wait for the step, staying responsive to abort. The step itself
        // is not preemptible: on abort we stop waiting and leave it to the
        // reaper.
        let join = tokio::select! {
            biased;
            () = ctx.token.cancelled() => {
                emit_aborted(ctx).await;
                return SessionEnd::AbandonedWorker(worker);
            }
            join = &mut worker => join,
        };

        // Abort checkpoint: completed result is discarded, not applied.
        if ctx.token.is_cancelled() {
            emit_aborted(ctx).await;
            return SessionEnd::Settled;
        }

        let result = match join {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(device_key = %ctx.device_key, error = %err, "step failed");
                let _ = emit(
                    ctx,
                    StreamEvent::Error {
                        message: err.message().to_string(),
                    },
                )
                .await;
                return SessionEnd::Settled;
            }
            Err(join_err) => {
                warn!(device_key = %ctx.device_key, error = %join_err, "step worker died");
                let _ = emit(
                    ctx,
                    StreamEvent::Error {
                        message: join_err.to_string(),
                    },
                )
                .await;
                return SessionEnd::Settled;
            }
        };

        let steps = ctx.streaming.lock().step_count();
        counter!("agent_steps_total").increment(1);

        if !emit(ctx, StreamEvent::step(steps, &result)).await {
            // Consumer went away mid-run; treat like an abort.
            ctx.token.cancel();
            return SessionEnd::Settled;
        }

        if result.finished {
            commit(ctx);
            let _ = emit(
                ctx,
                StreamEvent::Done {
                    message: result.message,
                    steps,
                    success: result.success,
                },
            )
            .await;
            return SessionEnd::Settled;
        }

        if steps >= ctx.max_steps {
            commit(ctx);
            let _ = emit(
                ctx,
                StreamEvent::Done {
                    message: "Max steps reached".to_string(),
                    steps,
                    success: result.success,
                },
            )
            .await;
            return SessionEnd::Settled;
        }
    }
}

/// Copy the clone's context back onto the durable handle and clear its
/// per-run counters. Only called on a finished/max-steps stop.
fn commit(ctx: &SessionContext) {
    let snapshot = ctx.streaming.lock().snapshot();
    let mut original = ctx.original.lock();
    original.restore(snapshot);
    original.reset();
}

async fn emit_aborted(ctx: &SessionContext) {
    counter!("session_aborts_total").increment(1);
    let _ = emit(ctx, StreamEvent::Aborted).await;
}

/// Ordered emit. Returns `false` when the consumer dropped the stream.
async fn emit(ctx: &SessionContext, event: StreamEvent) -> bool {
    ctx.events.send(event).await.is_ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RuntimeError;
    use crate::testutil::{ScriptPlan, ScriptedFactory, ScriptedStep};
    use tether_core::{AgentConfig, BackendCallbacks, ModelConfig};

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    /// Orchestrator with one plan for the durable handle (empty) and one
    /// for the streaming clone.
    fn orchestrator_with_stream_plan(
        plan: ScriptPlan,
        max_steps: u32,
    ) -> (Arc<Orchestrator>, Arc<crate::testutil::BackendStats>) {
        let factory = ScriptedFactory::new();
        factory.push_plan(ScriptPlan::new(Vec::new())); // durable handle
        let stats = plan.stats();
        factory.push_plan(plan); // streaming clone
        let orch = Arc::new(Orchestrator::new(Arc::new(factory)));

        let mut agent_config = AgentConfig::default();
        agent_config.device_key = "d1".into();
        agent_config.max_steps = max_steps;
        let _ = orch
            .initialize(
                "d1",
                ModelConfig::default(),
                agent_config,
                BackendCallbacks::default(),
                false,
            )
            .unwrap();
        (orch, stats)
    }

    async fn collect(session: &mut StreamingSession) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn finished_run_emits_steps_then_done_and_commits_context() {
        let plan = ScriptPlan::new(vec![
            ScriptedStep::unfinished("tap").with_thinking(&["let me ", "look"]),
            ScriptedStep::unfinished("swipe"),
            ScriptedStep::finished("all done").with_thinking(&["wrapping up"]),
        ]);
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 100);

        let mut session = orch
            .start_session("d1", "open the app", Some(Duration::ZERO))
            .await
            .unwrap();
        let events = collect(&mut session).await;

        // Step indices in order, terminal done
        let step_indices: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Step { step, .. } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(step_indices, vec![1, 2, 3]);
        match events.last().unwrap() {
            StreamEvent::Done {
                message,
                steps,
                success,
            } => {
                assert_eq!(message, "all done");
                assert_eq!(*steps, 3);
                assert!(*success);
            }
            other => panic!("expected done, got {other:?}"),
        }

        // Thinking chunks precede their step events
        let first_step_pos = events
            .iter()
            .position(|event| matches!(event, StreamEvent::Step { step: 1, .. }))
            .unwrap();
        let chunk_positions: Vec<usize> = events
            .iter()
            .enumerate()
            .filter_map(|(pos, event)| match event {
                StreamEvent::ThinkingChunk { chunk } if chunk.starts_with("l") => Some(pos),
                _ => None,
            })
            .collect();
        assert!(chunk_positions.iter().all(|pos| *pos < first_step_pos));

        // Context committed back to the durable handle, counters cleared,
        // lock released after cleanup
        wait_until(|| !orch.is_locked("d1")).await;
        let original = orch.get("d1").unwrap();
        let snapshot = original.lock().snapshot();
        assert_eq!(snapshot.entries.len(), 3);
        assert_eq!(original.lock().step_count(), 0);
        assert!(!orch.has_active_session("d1"));
    }

    #[tokio::test]
    async fn abort_before_first_step_emits_only_aborted() {
        let plan = ScriptPlan::repeating(Vec::new());
        let (orch, stats) = orchestrator_with_stream_plan(plan, 100);

        // Current-thread runtime: the driver task cannot poll before our
        // next await, so the abort lands before the first step dispatches.
        let mut session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();
        session.abort();

        let events = collect(&mut session).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Aborted));
        wait_until(|| !orch.is_locked("d1")).await;

        // Zero steps executed; original untouched
        assert_eq!(stats.steps.load(std::sync::atomic::Ordering::SeqCst), 0);
        let original = orch.get("d1").unwrap();
        assert_eq!(original.lock().step_count(), 0);
    }

    #[tokio::test]
    async fn abort_mid_step_discards_result() {
        let plan = ScriptPlan::repeating(vec![
            ScriptedStep::unfinished("slow").with_delay(Duration::from_millis(300)),
        ]);
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 100);

        let mut session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();

        // Let the worker get into the slow step, then abort.
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.abort();

        let events = collect(&mut session).await;
        assert!(events.iter().all(|event| !matches!(event, StreamEvent::Step { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Aborted)));

        // The lock is released only after the reaper saw the worker out.
        wait_until(|| !orch.is_locked("d1")).await;
        let original = orch.get("d1").unwrap();
        assert_eq!(original.lock().step_count(), 0);
        assert_eq!(original.lock().snapshot().entries.len(), 0);
    }

    #[tokio::test]
    async fn abort_between_steps_stops_before_next_dispatch() {
        let plan = ScriptPlan::repeating(vec![
            ScriptedStep::unfinished("first"),
            ScriptedStep::unfinished("second").with_delay(Duration::from_millis(200)),
        ]);
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 100);

        let mut session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();

        // Consume up to the first step event, then abort.
        loop {
            match session.next_event().await.unwrap() {
                StreamEvent::Step { step: 1, .. } => break,
                StreamEvent::ThinkingChunk { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        session.abort();

        let events = collect(&mut session).await;
        assert!(events.iter().all(|event| !matches!(event, StreamEvent::Step { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Aborted)));
        wait_until(|| !orch.is_locked("d1")).await;
    }

    #[tokio::test]
    async fn step_failure_emits_error_and_preserves_original() {
        let plan = ScriptPlan::new(vec![
            ScriptedStep::unfinished("tap"),
            ScriptedStep::failing("inference backend unreachable"),
        ]);
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 100);

        let mut session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();
        let events = collect(&mut session).await;

        match events.last().unwrap() {
            StreamEvent::Error { message } => {
                assert_eq!(message, "inference backend unreachable");
            }
            other => panic!("expected error, got {other:?}"),
        }

        // Failed run: nothing copied back
        wait_until(|| !orch.is_locked("d1")).await;
        let original = orch.get("d1").unwrap();
        assert_eq!(original.lock().snapshot().entries.len(), 0);
    }

    #[tokio::test]
    async fn max_steps_stop_emits_done() {
        let plan = ScriptPlan::repeating(Vec::new());
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 2);

        let mut session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();
        let events = collect(&mut session).await;

        match events.last().unwrap() {
            StreamEvent::Done {
                message, steps, ..
            } => {
                assert_eq!(message, "Max steps reached");
                assert_eq!(*steps, 2);
            }
            other => panic!("expected done, got {other:?}"),
        }
        wait_until(|| !orch.is_locked("d1")).await;
    }

    #[tokio::test]
    async fn second_session_rejected_while_first_active() {
        let plan = ScriptPlan::repeating(vec![
            ScriptedStep::unfinished("slow").with_delay(Duration::from_millis(300)),
        ]);
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 100);

        let session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();

        let err = orch
            .start_session("d1", "task2", Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::DeviceBusy(_)));

        session.abort();
        wait_until(|| !orch.is_locked("d1")).await;
    }

    #[tokio::test]
    async fn orchestrator_abort_session_triggers_session_token() {
        let plan = ScriptPlan::repeating(vec![
            ScriptedStep::unfinished("slow").with_delay(Duration::from_millis(300)),
        ]);
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 100);

        let mut session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(orch.has_active_session("d1"));
        assert!(orch.abort_session("d1"));

        let events = collect(&mut session).await;
        assert!(matches!(events.last(), Some(StreamEvent::Aborted)));
        wait_until(|| !orch.has_active_session("d1")).await;
    }

    #[tokio::test]
    async fn dropped_consumer_winds_down_session() {
        let plan = ScriptPlan::repeating(Vec::new());
        let (orch, _stats) = orchestrator_with_stream_plan(plan, 1000);

        let session = orch
            .start_session("d1", "task", Some(Duration::ZERO))
            .await
            .unwrap();
        drop(session);

        wait_until(|| !orch.is_locked("d1")).await;
        assert!(!orch.has_active_session("d1"));
    }
}
