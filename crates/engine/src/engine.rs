//! The flow engine.
//!
//! Scheduling model: every step outcome assigns a fired / not-fired verdict
//! to each of the step's outgoing edges. A step becomes ready once every
//! inbound edge has a verdict — it runs when at least one fired, and is
//! skipped (propagating not-fired verdicts of its own) when none did. A
//! fired error edge schedules its target immediately. Re-entry of a step
//! with an identical context projection is rejected as a cyclic step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use archflow_core::{ExecutionId, ExecutionKind, keys};
use archflow_event::ArchflowEvent;
use archflow_execution::{
    ExecutionContext, ExecutionError, ExecutionTracker, FlowResult, FlowStatus, StepError,
    StepResult, StepStatus,
};
use archflow_expression::evaluate_guard;
use archflow_metrics::FlowMetricsCollector;
use archflow_resilience::{NoopListener, RetryError, StrictRetryPolicy, execute_with_retry};
use archflow_streaming::StreamingRegistry;
use archflow_tool::ToolInvoker;
use archflow_workflow::{Connection, FlowGraph, Step, Workflow};

use crate::EngineError;
use crate::config::EngineConfig;
use crate::control::{RunControl, RunStatus};
use crate::handler::{
    CtxResolver, NoopHandler, StepHandler, StepRegistry, ToolStepHandler, TransformHandler,
    WaitHandler,
};
use crate::store::{StateStore, SuspensionRecord};

/// Drives workflow graphs to terminal results.
pub struct FlowEngine {
    config: EngineConfig,
    handlers: StepRegistry,
    tracker: Arc<ExecutionTracker>,
    invoker: Arc<ToolInvoker>,
    streaming: Arc<StreamingRegistry>,
    collector: Arc<FlowMetricsCollector>,
    store: Arc<dyn StateStore>,
    // One shared worker pool for step dispatch across all runs.
    semaphore: Arc<Semaphore>,
    workflows: DashMap<String, Arc<Workflow>>,
    runs: DashMap<String, Arc<RunControl>>,
}

impl FlowEngine {
    /// Create an engine over explicit collaborators and register the
    /// built-in handlers (`noop`, `transform`, `wait`, `tool`).
    #[must_use]
    pub fn new(
        config: EngineConfig,
        tracker: Arc<ExecutionTracker>,
        invoker: Arc<ToolInvoker>,
        streaming: Arc<StreamingRegistry>,
        collector: Arc<FlowMetricsCollector>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let engine = Self {
            config,
            handlers: StepRegistry::new(),
            tracker,
            invoker,
            streaming,
            collector,
            store,
            semaphore,
            workflows: DashMap::new(),
            runs: DashMap::new(),
        };
        engine.handlers.register(Arc::new(NoopHandler));
        engine.handlers.register(Arc::new(WaitHandler));
        engine
            .handlers
            .register(Arc::new(TransformHandler::new(Arc::clone(&engine.streaming))));
        engine.handlers.register(Arc::new(ToolStepHandler::new(
            Arc::clone(&engine.invoker),
            Arc::clone(&engine.streaming),
        )));
        engine
    }

    /// Register an application handler.
    pub fn register_handler(&self, handler: Arc<dyn StepHandler>) {
        self.handlers.register(handler);
    }

    /// Register a workflow for id-based lookup (`resume`, the MCP broker).
    pub fn register_workflow(&self, workflow: Workflow) {
        self.workflows.insert(workflow.id.clone(), Arc::new(workflow));
    }

    /// Look up a registered workflow.
    #[must_use]
    pub fn workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(id).map(|w| Arc::clone(&w))
    }

    /// All registered workflows.
    #[must_use]
    pub fn workflows(&self) -> Vec<Arc<Workflow>> {
        self.workflows.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// The streaming registry runs publish through.
    #[must_use]
    pub fn streaming(&self) -> &Arc<StreamingRegistry> {
        &self.streaming
    }

    /// The execution tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// The metrics collector.
    #[must_use]
    pub fn collector(&self) -> &Arc<FlowMetricsCollector> {
        &self.collector
    }

    /// The tool invoker.
    #[must_use]
    pub fn invoker(&self) -> &Arc<ToolInvoker> {
        &self.invoker
    }

    /// Run a workflow to a terminal (or suspended) result.
    ///
    /// # Errors
    ///
    /// Load-time rejections only ([`EngineError::Workflow`],
    /// [`EngineError::UnknownStepType`]); runtime step failures surface in
    /// the returned [`FlowResult`].
    pub async fn run(&self, workflow: &Workflow, input: Value) -> Result<FlowResult, EngineError> {
        let prepared = self.prepare(workflow, input)?;
        self.execute(
            &prepared.workflow,
            &prepared.graph,
            prepared.ctx,
            prepared.control,
            Seed::Entry,
        )
        .await
    }

    /// Validate and start a run on a background task, returning its id
    /// immediately so callers can subscribe to the event stream before the
    /// first step executes.
    ///
    /// # Errors
    ///
    /// The same load-time rejections as [`FlowEngine::run`].
    pub fn start(
        self: &Arc<Self>,
        workflow: &Workflow,
        input: Value,
    ) -> Result<StartedRun, EngineError> {
        let prepared = self.prepare(workflow, input)?;
        let run_id = prepared.control.run_id().to_owned();
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            engine
                .execute(
                    &prepared.workflow,
                    &prepared.graph,
                    prepared.ctx,
                    prepared.control,
                    Seed::Entry,
                )
                .await
        });
        Ok(StartedRun { run_id, task })
    }

    fn prepare(&self, workflow: &Workflow, input: Value) -> Result<PreparedRun, EngineError> {
        let workflow = Arc::new(workflow.clone());
        self.workflows
            .insert(workflow.id.clone(), Arc::clone(&workflow));
        let graph = FlowGraph::build(&workflow)?;
        self.check_handlers(&graph)?;

        let run_root = self.tracker.start_root(ExecutionKind::Flow);
        let ctx = ExecutionContext::new(run_root.clone(), workflow.id.clone()).with_input(input);
        let control = Arc::new(RunControl::new(
            run_root.to_string(),
            ctx.cancellation.clone(),
        ));
        self.runs.insert(run_root.to_string(), Arc::clone(&control));

        self.collector.record_flow_start(&workflow.id);
        self.collector
            .record_flow_status(&workflow.id, FlowStatus::Running);
        // Create the emitter eagerly so subscribers attaching between
        // `start` and the first step miss nothing.
        let _ = self.streaming.emitter(&run_root);

        Ok(PreparedRun {
            workflow,
            graph,
            ctx,
            control,
        })
    }

    /// Pause a run: the next scheduling tick blocks, in-flight steps finish.
    ///
    /// # Errors
    ///
    /// [`EngineError::RunNotFound`].
    pub fn pause(&self, run_id: &str) -> Result<(), EngineError> {
        let control = self.control(run_id)?;
        control.pause();
        Ok(())
    }

    /// Stop a run, cancelling in-flight steps best-effort. Idempotent:
    /// repeated calls return the same terminal result.
    ///
    /// # Errors
    ///
    /// [`EngineError::RunNotFound`].
    pub async fn stop(&self, run_id: &str) -> Result<FlowResult, EngineError> {
        let control = self.control(run_id)?;
        if let Some(result) = control.result() {
            return Ok(result);
        }
        control.request_stop();
        Ok(control.wait_result().await)
    }

    /// Resume a run.
    ///
    /// With a suspension on record, restores the context, stores the user
    /// data under `interaction.userData` and continues from the suspended
    /// step's successors. Without one, merely releases a pause (a no-op
    /// when nothing suspended or paused).
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuspension`] for unknown runs,
    /// [`EngineError::InvalidResumeToken`] / [`EngineError::SuspensionExpired`]
    /// for bad or stale tokens.
    pub async fn resume(
        &self,
        run_id: &str,
        resume_token: &str,
        user_data: Value,
    ) -> Result<FlowResult, EngineError> {
        let record = self.store.load(run_id).await?;
        let Some(record) = record else {
            // No suspend event was emitted: pause-then-resume is a no-op.
            let control = self.control(run_id)?;
            if control.result().is_none() {
                control.unpause();
            }
            let status = control.status();
            return Ok(FlowResult {
                run_id: run_id.to_owned(),
                status: status.status,
                output: None,
                metrics: archflow_execution::ExecutionMetrics::default(),
                errors: Vec::new(),
                resume_token: None,
            });
        };

        if record.resume_token != resume_token {
            return Err(EngineError::InvalidResumeToken);
        }
        if record.is_expired() {
            self.store.remove(run_id).await?;
            return Err(EngineError::SuspensionExpired(run_id.to_owned()));
        }
        self.store.remove(run_id).await?;

        let workflow = self
            .workflow(&record.flow_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(record.flow_id.clone()))?;
        let graph = FlowGraph::build(&workflow)?;
        self.check_handlers(&graph)?;

        let root = ExecutionId::parse(run_id)?;
        let ctx = ExecutionContext::from_snapshot(
            root.clone(),
            workflow.id.clone(),
            record.context_snapshot.clone(),
        );
        ctx.set(keys::INTERACTION_USER_DATA, user_data.clone());
        ctx.set(keys::step_output(&record.graph_cursor), user_data.clone());

        let control = Arc::new(RunControl::new(run_id.to_owned(), ctx.cancellation.clone()));
        self.runs.insert(run_id.to_owned(), Arc::clone(&control));
        control.note_completed(&record.graph_cursor);

        self.streaming.publish(
            &root,
            ArchflowEvent::interaction_resume(&root, resume_token, user_data),
        );

        self.execute(&workflow, &graph, ctx, control, Seed::Resume(record.graph_cursor))
            .await
    }

    /// Progress snapshot for a run.
    ///
    /// # Errors
    ///
    /// [`EngineError::RunNotFound`].
    pub fn status(&self, run_id: &str) -> Result<RunStatus, EngineError> {
        Ok(self.control(run_id)?.status())
    }

    fn control(&self, run_id: &str) -> Result<Arc<RunControl>, EngineError> {
        self.runs
            .get(run_id)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_owned()))
    }

    fn check_handlers(&self, graph: &FlowGraph) -> Result<(), EngineError> {
        for id in graph.step_ids() {
            let step_type = &graph.step(id).map(|s| s.step_type.clone()).unwrap_or_default();
            if self.handlers.get(step_type).is_none() {
                return Err(EngineError::UnknownStepType(step_type.clone()));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        workflow: &Arc<Workflow>,
        graph: &FlowGraph,
        ctx: ExecutionContext,
        control: Arc<RunControl>,
        seed: Seed,
    ) -> Result<FlowResult, EngineError> {
        self.streaming.publish(
            &ctx.execution_id,
            ArchflowEvent::audit_trace(
                &ctx.execution_id,
                "info",
                "engine",
                &format!("run started for workflow {}", workflow.id),
            ),
        );
        let wall = std::time::Instant::now();
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(
                workflow
                    .timeout_ms
                    .unwrap_or(self.config.default_flow_timeout_ms),
            );

        let mut driver = Driver {
            engine: self,
            workflow,
            graph,
            ctx: ctx.clone(),
            control: Arc::clone(&control),
            deadline,
            verdicts: HashMap::new(),
            scheduled: HashSet::new(),
            projections: HashMap::new(),
            pending: VecDeque::new(),
            errors: Vec::new(),
            final_output: None,
            suspension: None,
            fatal: false,
        };
        let status = driver.drive(seed).await;

        let metrics = ctx.metrics(wall.elapsed().as_millis() as u64);

        let mut resume_token = None;
        if status == FlowStatus::Suspended {
            if let Some(pending) = driver.suspension.take() {
                resume_token = Some(pending.token.clone());
                self.store
                    .save(SuspensionRecord {
                        run_id: control.run_id().to_owned(),
                        flow_id: workflow.id.clone(),
                        resume_token: pending.token,
                        graph_cursor: pending.step_id,
                        context_snapshot: ctx.snapshot(),
                        created_at: Utc::now(),
                        expires_at: Utc::now()
                            + chrono::Duration::milliseconds(pending.timeout_ms as i64),
                    })
                    .await?;
            }
        }

        let result = FlowResult {
            run_id: control.run_id().to_owned(),
            status,
            output: driver.final_output.take(),
            metrics: metrics.clone(),
            errors: std::mem::take(&mut driver.errors),
            resume_token,
        };

        ctx.set_status(status);
        self.collector.record_flow_status(&workflow.id, status);
        match status {
            FlowStatus::Completed => {
                self.collector
                    .record_flow_completion(&workflow.id, &metrics, true);
            }
            FlowStatus::Failed | FlowStatus::Stopped => {
                self.collector
                    .record_flow_completion(&workflow.id, &metrics, false);
                if let Some(first) = result.errors.first() {
                    self.collector.record_flow_error(&workflow.id, &first.message);
                }
            }
            FlowStatus::Suspended | FlowStatus::Running => {}
        }

        if status.is_terminal() {
            let root = &ctx.execution_id;
            if status == FlowStatus::Completed {
                self.tracker.complete(root, result.output.clone());
            } else {
                let message = result
                    .errors
                    .first()
                    .map_or_else(|| status.to_string(), |e| e.message.clone());
                self.tracker.fail(root, message);
            }
            self.streaming.complete(control.run_id());
        }

        control.set_result(result.clone());
        Ok(result)
    }
}

enum Seed {
    Entry,
    Resume(String),
}

struct PreparedRun {
    workflow: Arc<Workflow>,
    graph: FlowGraph,
    ctx: ExecutionContext,
    control: Arc<RunControl>,
}

/// Handle to a run launched with [`FlowEngine::start`].
pub struct StartedRun {
    /// The run's root execution id.
    pub run_id: String,
    task: tokio::task::JoinHandle<Result<FlowResult, EngineError>>,
}

impl StartedRun {
    /// Wait for the run to finish.
    ///
    /// # Errors
    ///
    /// Engine errors from the run, or an internal error if the driving task
    /// panicked.
    pub async fn wait(self) -> Result<FlowResult, EngineError> {
        match self.task.await {
            Ok(result) => result,
            Err(join_error) => Err(EngineError::RunNotFound(format!(
                "run task failed: {join_error}"
            ))),
        }
    }
}

struct PendingSuspension {
    step_id: String,
    token: String,
    timeout_ms: u64,
}

type StepJoin = (String, StepResult);

struct Driver<'a> {
    engine: &'a FlowEngine,
    workflow: &'a Workflow,
    graph: &'a FlowGraph,
    ctx: ExecutionContext,
    control: Arc<RunControl>,
    deadline: tokio::time::Instant,
    // (source, target, is_error_path) -> fired
    verdicts: HashMap<(String, String, bool), bool>,
    scheduled: HashSet<String>,
    projections: HashMap<String, HashSet<u64>>,
    pending: VecDeque<String>,
    errors: Vec<ExecutionError>,
    final_output: Option<Value>,
    suspension: Option<PendingSuspension>,
    fatal: bool,
}

fn edge_key(connection: &Connection) -> (String, String, bool) {
    (
        connection.source.clone(),
        connection.target.clone(),
        connection.is_error_path,
    )
}

impl Driver<'_> {
    async fn drive(&mut self, seed: Seed) -> FlowStatus {
        let mut join_set: JoinSet<StepJoin> = JoinSet::new();
        let mut in_flight = 0usize;

        match seed {
            Seed::Entry => self.enqueue(self.graph.entry().to_owned()),
            Seed::Resume(cursor) => {
                self.prime_from_snapshot(&cursor);
                self.assign_verdicts(&cursor, Verdicts::Success);
            }
        }

        let max_parallel = if self.workflow.parallel_execution {
            self.engine.config.max_concurrent.max(1)
        } else {
            1
        };

        loop {
            if self.control.is_stopped() {
                self.errors.insert(
                    0,
                    ExecutionError::new(None, "Stopped", "run stopped by request"),
                );
                self.drain(&mut join_set, false).await;
                return FlowStatus::Stopped;
            }
            if self.fatal {
                self.ctx.cancellation.cancel();
                self.drain(&mut join_set, false).await;
                return FlowStatus::Failed;
            }
            if self.suspension.is_some() {
                // Flush steps that were already ready so their outputs make
                // it into the suspension snapshot, then let in-flight work
                // finish.
                self.drain(&mut join_set, true).await;
                return FlowStatus::Suspended;
            }

            if !self.control.is_paused() {
                while in_flight < max_parallel {
                    let Some(step_id) = self.pending.pop_front() else {
                        break;
                    };
                    if !self.note_projection(&step_id) {
                        self.fatal = true;
                        break;
                    }
                    self.spawn_step(&step_id, &mut join_set);
                    in_flight += 1;
                }
                if self.fatal {
                    continue;
                }
            }

            if in_flight == 0 {
                if self.control.is_paused() {
                    self.control.wait_while_paused().await;
                    continue;
                }
                if self.pending.is_empty() {
                    return FlowStatus::Completed;
                }
                continue;
            }

            let control = Arc::clone(&self.control);
            tokio::select! {
                joined = join_set.join_next() => {
                    in_flight = in_flight.saturating_sub(1);
                    match joined {
                        Some(Ok((step_id, result))) => self.handle_result(&step_id, result, true),
                        Some(Err(join_error)) => {
                            tracing::error!(?join_error, "step task panicked");
                            self.errors.push(ExecutionError::new(
                                None,
                                "INTERNAL_ERROR",
                                join_error.to_string(),
                            ));
                            self.fatal = true;
                        }
                        None => {}
                    }
                }
                () = control.changed() => {}
            }
        }
    }

    /// Collect every outstanding step. With `flush_pending`, ready-but-not-
    /// spawned steps run first; otherwise they are abandoned (the cancel
    /// token is already tripped for stop/failure paths).
    async fn drain(&mut self, join_set: &mut JoinSet<StepJoin>, flush_pending: bool) {
        if flush_pending {
            while let Some(step_id) = self.pending.pop_front() {
                if self.note_projection(&step_id) {
                    self.spawn_step(&step_id, join_set);
                }
            }
        } else {
            self.pending.clear();
        }
        while let Some(joined) = join_set.join_next().await {
            if let Ok((step_id, result)) = joined {
                self.handle_result(&step_id, result, false);
            }
        }
    }

    /// Rebuild verdicts for steps that already ran before a suspension, so
    /// joins downstream of both the suspended step and earlier work still
    /// resolve after resume.
    fn prime_from_snapshot(&mut self, cursor: &str) {
        self.scheduled.insert(cursor.to_owned());
        let step_ids: Vec<String> = self.graph.step_ids().map(ToOwned::to_owned).collect();
        for id in step_ids {
            if id == cursor {
                continue;
            }
            let completed = self.ctx.contains(&keys::step_output(&id));
            let failed = self.ctx.contains(&keys::step_error(&id));
            if !completed && !failed {
                continue;
            }
            self.scheduled.insert(id.clone());
            for connection in self.graph.outgoing(&id).to_vec() {
                let fired = if connection.is_error_path {
                    failed && self.guard_fires(&connection)
                } else {
                    completed && self.guard_fires(&connection)
                };
                self.verdicts.insert(edge_key(&connection), fired);
            }
        }
    }

    fn enqueue(&mut self, step_id: String) {
        self.scheduled.insert(step_id.clone());
        self.pending.push_back(step_id);
    }

    /// Record the context projection for a step about to run. Returns
    /// `false` — a cyclic re-entry — when this exact (step, projection) was
    /// already seen.
    fn note_projection(&mut self, step_id: &str) -> bool {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        serde_json::to_string(&self.ctx.snapshot())
            .unwrap_or_default()
            .hash(&mut hasher);
        let projection = hasher.finish();

        let seen = self.projections.entry(step_id.to_owned()).or_default();
        if seen.insert(projection) {
            true
        } else {
            tracing::warn!(step_id, "rejecting cyclic re-entry with identical context");
            self.errors.push(ExecutionError::new(
                Some(step_id.to_owned()),
                "CyclicStep",
                format!("step {step_id:?} re-entered with an identical context projection"),
            ));
            false
        }
    }

    fn spawn_step(&self, step_id: &str, join_set: &mut JoinSet<StepJoin>) {
        let (Some(step), Some(handler)) = (
            self.graph.step(step_id).cloned(),
            self.graph
                .step(step_id)
                .and_then(|s| self.engine.handlers.get(&s.step_type)),
        ) else {
            // Guarded against at load time.
            tracing::error!(step_id, "step or handler vanished after validation");
            return;
        };

        let step_timeout = Duration::from_millis(
            step.timeout_ms
                .unwrap_or(self.engine.config.default_step_timeout_ms),
        );
        // Smallest applicable deadline wins: per-step vs remaining per-flow.
        let remaining = self.deadline.saturating_duration_since(tokio::time::Instant::now());
        let timeout = step_timeout.min(remaining);

        join_set.spawn(
            StepTask {
                handler,
                step,
                ctx: self.ctx.clone(),
                semaphore: Arc::clone(&self.engine.semaphore),
                cancel: self.ctx.cancellation.clone(),
                timeout,
            }
            .run(),
        );
    }

    fn handle_result(&mut self, step_id: &str, result: StepResult, schedule: bool) {
        match result.status {
            StepStatus::Completed => {
                let output = result.output.clone().unwrap_or(Value::Null);
                self.ctx.set(keys::step_output(step_id), output.clone());
                self.ctx.record_step(&result.metrics, false);
                self.control.note_completed(step_id);
                self.engine
                    .collector
                    .record_step_metrics(&self.workflow.id, step_id, &result.metrics);
                self.trace(step_id, "completed");
                if self.is_terminal_step(step_id) {
                    self.final_output = Some(output);
                }
                if schedule {
                    self.assign_verdicts(step_id, Verdicts::Success);
                }
            }
            StepStatus::Skipped => {
                self.trace(step_id, "skipped");
                if schedule {
                    self.assign_verdicts(step_id, Verdicts::NoneFired);
                }
            }
            StepStatus::Failed => {
                let message = result
                    .errors
                    .first()
                    .map_or_else(|| "step failed".to_owned(), |e| e.message.clone());
                self.ctx
                    .set(keys::step_error(step_id), Value::String(message));
                self.ctx.record_step(&result.metrics, true);
                self.control.note_failed(step_id);
                self.engine
                    .collector
                    .record_step_metrics(&self.workflow.id, step_id, &result.metrics);
                for error in &result.errors {
                    self.errors.push(ExecutionError::new(
                        Some(step_id.to_owned()),
                        error.kind.clone(),
                        error.message.clone(),
                    ));
                }
                self.trace(step_id, "failed");
                if schedule && !self.assign_verdicts(step_id, Verdicts::Error) {
                    // No error path fired: the run terminates failed.
                    self.fatal = true;
                }
            }
            StepStatus::Suspended => {
                let token = result
                    .resume_token
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                let step = self.graph.step(step_id);
                let reason = step
                    .and_then(|s| s.config.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("waiting for user input")
                    .to_owned();
                let timeout_ms = step
                    .and_then(|s| s.config.get("timeout_ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(300_000);
                self.engine.streaming.publish(
                    &self.ctx.execution_id,
                    ArchflowEvent::interaction_suspend(
                        &self.ctx.execution_id,
                        &reason,
                        &token,
                        timeout_ms,
                    ),
                );
                self.trace(step_id, "suspended");
                self.suspension = Some(PendingSuspension {
                    step_id: step_id.to_owned(),
                    token,
                    timeout_ms,
                });
            }
            StepStatus::Cancelled => {
                self.errors.push(ExecutionError::new(
                    Some(step_id.to_owned()),
                    "Cancelled",
                    format!("step {step_id:?} cancelled"),
                ));
                self.trace(step_id, "cancelled");
            }
        }
    }

    /// Assign verdicts to a step's outgoing edges and consider targets.
    /// Returns whether any edge fired.
    fn assign_verdicts(&mut self, step_id: &str, mode: Verdicts) -> bool {
        let outgoing: Vec<Connection> = self.graph.outgoing(step_id).to_vec();
        let mut any_fired = false;
        for connection in outgoing {
            let fired = match mode {
                Verdicts::NoneFired => false,
                Verdicts::Success => !connection.is_error_path && self.guard_fires(&connection),
                Verdicts::Error => connection.is_error_path && self.guard_fires(&connection),
            };
            any_fired |= fired;
            self.verdicts.insert(edge_key(&connection), fired);
            self.consider_target(&connection.target, fired, connection.is_error_path);
        }
        any_fired
    }

    fn guard_fires(&self, connection: &Connection) -> bool {
        match &connection.guard {
            None => true,
            Some(source) => match evaluate_guard(source, &CtxResolver(&self.ctx)) {
                Ok(fired) => fired,
                Err(error) => {
                    tracing::warn!(
                        guard = %source,
                        %error,
                        "guard evaluation failed; treating as false"
                    );
                    false
                }
            },
        }
    }

    fn consider_target(&mut self, target: &str, fired_now: bool, via_error: bool) {
        if self.scheduled.contains(target) {
            // Loop re-entry: only a freshly fired edge re-queues the step;
            // the projection check rejects identical re-entries.
            if fired_now {
                self.pending.push_back(target.to_owned());
            }
            return;
        }
        if via_error {
            if fired_now {
                self.enqueue(target.to_owned());
            }
            return;
        }

        let inbound: Vec<Connection> = self.graph.incoming(target).to_vec();
        if !inbound
            .iter()
            .all(|c| self.verdicts.contains_key(&edge_key(c)))
        {
            return;
        }
        if inbound
            .iter()
            .any(|c| self.verdicts.get(&edge_key(c)).copied().unwrap_or(false))
        {
            self.enqueue(target.to_owned());
        } else {
            // Nothing selected this step: it is skipped, and its own edges
            // propagate not-fired so downstream joins still resolve.
            self.handle_result(target, StepResult::skipped(target), true);
        }
    }

    fn is_terminal_step(&self, step_id: &str) -> bool {
        self.graph
            .outgoing(step_id)
            .iter()
            .all(|c| c.is_error_path)
    }

    fn trace(&self, step_id: &str, what: &str) {
        let level = if what == "failed" { "warn" } else { "debug" };
        self.engine.streaming.publish(
            &self.ctx.execution_id,
            ArchflowEvent::audit_trace(
                &self.ctx.execution_id,
                level,
                "engine",
                &format!("step {step_id} {what}"),
            ),
        );
    }
}

#[derive(Clone, Copy)]
enum Verdicts {
    /// Success edges fire subject to guards; error edges do not.
    Success,
    /// Error edges fire subject to guards; success edges do not.
    Error,
    /// Nothing fires (skipped step).
    NoneFired,
}

struct StepTask {
    handler: Arc<dyn StepHandler>,
    step: Step,
    ctx: ExecutionContext,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl StepTask {
    async fn run(self) -> StepJoin {
        let step_id = self.step.id.clone();
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return (step_id.clone(), StepResult::cancelled(step_id));
        };
        if self.cancel.is_cancelled() {
            return (step_id.clone(), StepResult::cancelled(step_id));
        }

        let started = std::time::Instant::now();
        let mut result = tokio::select! {
            result = Self::execute(&self.handler, &self.step, &self.ctx) => result,
            () = tokio::time::sleep(self.timeout) => StepResult::failed(
                &step_id,
                StepError::new(
                    "StepTimeout",
                    format!("step {step_id:?} exceeded its {:?} deadline", self.timeout),
                ),
            ),
            () = self.cancel.cancelled() => StepResult::cancelled(&step_id),
        };
        result.metrics.duration_ms = started.elapsed().as_millis() as u64;
        (step_id, result)
    }

    async fn execute(
        handler: &Arc<dyn StepHandler>,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> StepResult {
        let Some(retry) = &step.retry else {
            return match handler.execute(step, ctx).await {
                Ok(result) => result,
                Err(error) => {
                    StepResult::failed(&step.id, StepError::new(error.kind(), error.to_string()))
                }
            };
        };

        let policy = StrictRetryPolicy::retries(retry.clone());
        let outcome = execute_with_retry(&policy, &NoopListener, &ctx.cancellation, || async {
            match handler.execute(step, ctx).await {
                Ok(result) if result.status == StepStatus::Failed => Err(result
                    .errors
                    .first()
                    .map_or_else(|| "step failed".to_owned(), |e| e.message.clone())),
                Ok(result) => Ok(result),
                Err(error) => Err(error.to_string()),
            }
        })
        .await;

        match outcome {
            Ok(outcome) => {
                let retries = (outcome.attempts.len() as u32).saturating_sub(1);
                let mut result = outcome.value.unwrap_or_else(|| {
                    StepResult::failed(&step.id, StepError::new("StepFailed", "no result"))
                });
                result.metrics.retry_count = retries;
                result
            }
            Err(RetryError::Exhausted { attempts }) => {
                let last = attempts
                    .last()
                    .and_then(|a| a.error.clone())
                    .unwrap_or_else(|| "step failed".to_owned());
                let mut result =
                    StepResult::failed(&step.id, StepError::new("RetryExhausted", last));
                result.metrics.retry_count = (attempts.len() as u32).saturating_sub(1);
                result
            }
            Err(RetryError::InvalidConfig(message)) => {
                StepResult::failed(&step.id, StepError::new("InvalidWorkflow", message))
            }
        }
    }
}
