//! Scripted backend doubles for exercising the coordination layer without
//! a real automation backend.
//!
//! A [`ScriptedBackend`] plays back a fixed sequence of step outcomes,
//! optionally emitting thinking chunks and sleeping to simulate a slow
//! step. A [`ScriptedFactory`] hands out one scripted backend per `build`
//! call, in plan order, so tests can give the durable handle and the
//! streaming clone different behavior. Shared [`BackendStats`] let tests
//! observe what each build actually did.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use tether_core::{
    AgentBackend, AgentConfig, BackendCallbacks, BackendError, BackendFactory, ContextSnapshot,
    ModelConfig, StepResult,
};

/// One scripted step outcome.
#[derive(Clone, Debug)]
pub struct ScriptedStep {
    /// Outcome returned from `step`.
    pub result: Result<StepResult, BackendError>,
    /// Thinking chunks emitted through the callback before returning.
    pub thinking: Vec<String>,
    /// Blocking sleep before returning, to simulate a long step.
    pub delay: Option<Duration>,
}

impl ScriptedStep {
    /// A successful, non-final step.
    pub fn unfinished(action: &str) -> Self {
        Self {
            result: Ok(StepResult {
                thinking: format!("considering {action}"),
                action: action.to_string(),
                success: true,
                finished: false,
                message: String::new(),
            }),
            thinking: Vec::new(),
            delay: None,
        }
    }

    /// A successful step that finishes the task.
    pub fn finished(message: &str) -> Self {
        Self {
            result: Ok(StepResult {
                thinking: "task complete".to_string(),
                action: "finish".to_string(),
                success: true,
                finished: true,
                message: message.to_string(),
            }),
            thinking: Vec::new(),
            delay: None,
        }
    }

    /// A step that fails with a backend error.
    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(BackendError::new(message)),
            thinking: Vec::new(),
            delay: None,
        }
    }

    /// Attach thinking chunks emitted before the result.
    pub fn with_thinking(mut self, chunks: &[&str]) -> Self {
        self.thinking = chunks.iter().map(ToString::to_string).collect();
        self
    }

    /// Attach a blocking delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// What a scripted backend does once its script runs out.
#[derive(Clone, Copy, Debug, Default)]
pub enum ExhaustedBehavior {
    /// Return a finishing step (default — keeps loops terminating).
    #[default]
    Finish,
    /// Keep returning unfinished steps (for step-limit tests).
    RepeatUnfinished,
}

/// Observable counters shared between a test and the backend it scripted.
#[derive(Debug, Default)]
pub struct BackendStats {
    /// Successful steps executed.
    pub steps: AtomicU32,
    /// Reset calls received.
    pub resets: AtomicU32,
    /// Task inputs seen by `step`, in order.
    pub tasks: Mutex<Vec<Option<String>>>,
}

/// Playback backend driven by a script.
pub struct ScriptedBackend {
    script: VecDeque<ScriptedStep>,
    exhausted: ExhaustedBehavior,
    callbacks: BackendCallbacks,
    step_count: u32,
    context: Vec<serde_json::Value>,
    stats: Arc<BackendStats>,
}

impl ScriptedBackend {
    /// Backend with no script: the first step finishes immediately.
    pub fn empty() -> Self {
        Self::new(Vec::new(), ExhaustedBehavior::Finish, BackendCallbacks::default())
    }

    /// Backend playing back the given steps.
    pub fn new(
        steps: Vec<ScriptedStep>,
        exhausted: ExhaustedBehavior,
        callbacks: BackendCallbacks,
    ) -> Self {
        Self {
            script: steps.into(),
            exhausted,
            callbacks,
            step_count: 0,
            context: Vec::new(),
            stats: Arc::new(BackendStats::default()),
        }
    }

    /// Share the stats handle.
    pub fn stats(&self) -> Arc<BackendStats> {
        Arc::clone(&self.stats)
    }

    fn with_stats(mut self, stats: Arc<BackendStats>) -> Self {
        self.stats = stats;
        self
    }
}

impl AgentBackend for ScriptedBackend {
    fn step(&mut self, task: Option<&str>) -> Result<StepResult, BackendError> {
        self.stats.tasks.lock().push(task.map(ToString::to_string));

        let scripted = self.script.pop_front().unwrap_or_else(|| match self.exhausted {
            ExhaustedBehavior::Finish => ScriptedStep::finished("script exhausted"),
            ExhaustedBehavior::RepeatUnfinished => ScriptedStep::unfinished("keep going"),
        });

        if let Some(on_thinking) = &self.callbacks.on_thinking {
            for chunk in &scripted.thinking {
                on_thinking(chunk);
            }
        }
        if let Some(delay) = scripted.delay {
            // Steps run on a blocking-capable worker; sleeping here models
            // a backend stuck in network I/O.
            std::thread::sleep(delay);
        }

        let result = scripted.result?;
        self.step_count += 1;
        let _ = self.stats.steps.fetch_add(1, Ordering::SeqCst);
        self.context.push(json!({
            "step": self.step_count,
            "task": task,
            "action": result.action,
        }));
        Ok(result)
    }

    fn step_count(&self) -> u32 {
        self.step_count
    }

    fn reset(&mut self) {
        self.step_count = 0;
        let _ = self.stats.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            entries: self.context.clone(),
            step_count: self.step_count,
        }
    }

    fn restore(&mut self, snapshot: ContextSnapshot) {
        self.context = snapshot.entries;
        self.step_count = snapshot.step_count;
    }
}

/// Plan for one `build` call of a [`ScriptedFactory`].
pub struct ScriptPlan {
    /// Steps the built backend will play back.
    pub steps: Vec<ScriptedStep>,
    /// Behavior once the script runs out.
    pub exhausted: ExhaustedBehavior,
    /// When set, `build` fails with this message instead.
    pub fail: Option<String>,
    /// Stats handle shared with the built backend.
    pub stats: Arc<BackendStats>,
}

impl ScriptPlan {
    /// Plan that builds a backend playing back `steps`.
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps,
            exhausted: ExhaustedBehavior::Finish,
            fail: None,
            stats: Arc::new(BackendStats::default()),
        }
    }

    /// Plan whose backend keeps producing unfinished steps after the script.
    pub fn repeating(steps: Vec<ScriptedStep>) -> Self {
        Self {
            exhausted: ExhaustedBehavior::RepeatUnfinished,
            ..Self::new(steps)
        }
    }

    /// Plan that makes `build` fail.
    pub fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Share the stats handle of the backend this plan will build.
    pub fn stats(&self) -> Arc<BackendStats> {
        Arc::clone(&self.stats)
    }
}

/// Factory handing out scripted backends in plan order.
///
/// With no queued plan, `build` returns an empty backend (first step
/// finishes immediately).
#[derive(Default)]
pub struct ScriptedFactory {
    plans: Mutex<VecDeque<ScriptPlan>>,
    built: AtomicU32,
}

impl ScriptedFactory {
    /// Factory with no queued plans.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plan for the next `build` call.
    pub fn push_plan(&self, plan: ScriptPlan) {
        self.plans.lock().push_back(plan);
    }

    /// Number of backends built so far.
    pub fn built_count(&self) -> u32 {
        self.built.load(Ordering::SeqCst)
    }
}

impl BackendFactory for ScriptedFactory {
    fn build(
        &self,
        _model: &ModelConfig,
        _agent: &AgentConfig,
        callbacks: BackendCallbacks,
    ) -> Result<Box<dyn AgentBackend>, BackendError> {
        let plan = self.plans.lock().pop_front();
        let plan = plan.unwrap_or_else(|| ScriptPlan::new(Vec::new()));
        if let Some(message) = plan.fail {
            return Err(BackendError::new(message));
        }
        let _ = self.built.fetch_add(1, Ordering::SeqCst);
        let backend = ScriptedBackend::new(plan.steps, plan.exhausted, callbacks)
            .with_stats(plan.stats);
        Ok(Box::new(backend))
    }
}
