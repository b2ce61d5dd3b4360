//! Run orchestration.
//!
//! The [`Orchestrator`] resolves the dependency graph, then drives every
//! unit through diffing, submission and polling on its own task. Units whose
//! prerequisites are done run concurrently, bounded by a semaphore; a unit
//! whose prerequisite did not succeed stays `Pending`.

mod cancel;
mod task;
mod types;

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendHandle, BackendStatus, ContextResolver, ProvisioningBackend, RetryPolicy};
use crate::error::{OrchestratorError, Result, StackwrightError, StateError, ValidationError};
use crate::graph::{DependencyGraph, OutputHandle};
use crate::planner::reference::{scan, Reference};
use crate::planner::{ChangeKind, ChangeSet, DeploymentPlan, DiffEngine, PlannedUnit, UnitPreview};
use crate::state::{ContextCache, ContextKey, RunLock, StateStore};
use crate::unit::{DeployableUnit, UnitState};

use task::UnitTask;

pub use cancel::CancellationSignal;
pub use types::{
    ApplyMode, ApplyOptions, ProgressEvent, RunReport, UnitError, UnitOutcome,
    DEFAULT_CONCURRENCY_LIMIT,
};

/// Capacity of the progress event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Drives deployment runs.
///
/// Cloning is cheap: all collaborators are shared.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    backend: Arc<dyn ProvisioningBackend>,
    resolver: Arc<dyn ContextResolver>,
    context: Arc<ContextCache>,
    engine: DiffEngine,
    events: broadcast::Sender<ProgressEvent>,
    cancel: CancellationSignal,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store.backend_type())
            .field("engine", &self.engine)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        backend: Arc<dyn ProvisioningBackend>,
        resolver: Arc<dyn ContextResolver>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            context: Arc::new(ContextCache::new(Arc::clone(&store))),
            store,
            backend,
            resolver,
            engine: DiffEngine::new(),
            events,
            cancel: CancellationSignal::new(),
        }
    }

    /// Replaces the diff engine.
    #[must_use]
    pub fn with_diff_engine(mut self, engine: DiffEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Returns the context cache.
    #[must_use]
    pub fn context_cache(&self) -> &ContextCache {
        &self.context
    }

    /// Returns the diff engine.
    #[must_use]
    pub const fn engine(&self) -> &DiffEngine {
        &self.engine
    }

    /// Returns the cancellation signal shared by every clone.
    ///
    /// The signal is cleared when a run finishes, so a cancelled orchestrator
    /// can drive later runs.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// Subscribes to progress events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn emit(&self, run_id: Uuid, unit: &DeployableUnit, state: UnitState, message: Option<String>) {
        debug!("{} -> {state}", unit.id);
        let event = ProgressEvent {
            run_id,
            unit_id: unit.id.clone(),
            environment: unit.environment.clone(),
            state,
            message,
            at: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Previews a deploy run.
    ///
    /// # Errors
    ///
    /// Returns an error if the dependency graph is invalid.
    pub async fn plan(&self, units: Vec<DeployableUnit>) -> Result<DeploymentPlan> {
        self.plan_mode(units, ApplyMode::Deploy).await
    }

    /// Previews a run in the given mode without submitting anything.
    ///
    /// Output references are resolved from the producers' recorded outputs
    /// and context tokens from stored entries only; anything else is
    /// reported as unresolved.
    ///
    /// # Errors
    ///
    /// Returns an error if the dependency graph is invalid.
    pub async fn plan_mode(&self, units: Vec<DeployableUnit>, mode: ApplyMode) -> Result<DeploymentPlan> {
        let graph = DependencyGraph::build(units)?;
        let order = Self::order(&graph, mode)?;
        self.prefill_outputs(&graph).await;

        let mut plan = DeploymentPlan::new(mode);
        for &i in &order {
            let Some(unit) = graph.unit(i) else { continue };
            let inputs: Vec<OutputHandle> = graph.inputs(i).cloned().collect();

            let preview = match self.preview(unit, &inputs, mode).await {
                Ok(change_set) => UnitPreview::Changes { change_set },
                Err(e) => UnitPreview::Error {
                    class: e.class(),
                    message: e.to_string(),
                },
            };
            plan.units.push(PlannedUnit {
                unit_id: unit.id.clone(),
                environment: unit.environment.clone(),
                preview,
            });
        }

        Ok(plan)
    }

    async fn preview(&self, unit: &DeployableUnit, inputs: &[OutputHandle], mode: ApplyMode) -> Result<ChangeSet> {
        let record = self.store.load_record(&unit.id, &unit.environment).await?;
        Ok(match mode {
            ApplyMode::Deploy => {
                let resolved = self.resolve_unit(unit, inputs, None).await?;
                self.engine.diff(&resolved, record.as_ref())
            }
            ApplyMode::Destroy => self.engine.destroy(unit, record.as_ref()),
            ApplyMode::Rollback => match record {
                Some(record) => {
                    let resolved = self.resolve_unit(unit, inputs, None).await?;
                    self.engine.rollback(&resolved, Some(&record))
                }
                None => self.engine.unchanged(unit, ChangeKind::Rollback),
            },
        })
    }

    /// Runs `units` in `mode`.
    ///
    /// Graph errors abort the run before any backend call. Unit-level
    /// failures are reported in the returned [`RunReport`].
    ///
    /// # Errors
    ///
    /// Returns an error for invalid options, an invalid dependency graph, or
    /// a run lock held by another process.
    pub async fn apply(
        &self,
        units: Vec<DeployableUnit>,
        mode: ApplyMode,
        options: ApplyOptions,
    ) -> Result<RunReport> {
        options.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let graph = DependencyGraph::build(units)?;
        let order = Self::order(&graph, mode)?;

        info!(
            "Starting {mode} run {run_id} over {} units{}",
            order.len(),
            if options.dry_run { " (dry run)" } else { "" }
        );

        self.context.clear_run();
        let mut lock = if options.dry_run {
            None
        } else {
            Some(RunLock::acquire(self.store.as_ref(), None).await?)
        };

        let drive = self.drive(&graph, &order, mode, &options, run_id);
        let outcomes = match lock.as_mut() {
            Some(lock) => self.hold_lock(lock, options.lock_refresh_interval, drive).await,
            None => drive.await,
        };

        if let Some(lock) = lock {
            if let Err(e) = lock.release().await {
                warn!("Failed to release run lock: {e}");
            }
        }

        let report = RunReport {
            run_id,
            mode,
            dry_run: options.dry_run,
            cancelled: self.cancel.is_cancelled(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };

        info!(
            "Run {run_id} finished: {} succeeded, {} failed, {} rolled back, {} pending",
            report.count(UnitState::Succeeded) + report.count(UnitState::Planned),
            report.count(UnitState::Failed),
            report.count(UnitState::RolledBack),
            report.count(UnitState::Pending)
        );

        self.cancel.reset();
        Ok(report)
    }

    /// Awaits `run` while renewing `lock` every `every`.
    ///
    /// Losing the lock cancels the run: units already submitted finish, no
    /// new ones start.
    async fn hold_lock<T>(
        &self,
        lock: &mut RunLock<'_, dyn StateStore>,
        every: Duration,
        run: impl Future<Output = T>,
    ) -> T {
        tokio::pin!(run);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick() => match lock.refresh().await {
                    Ok(()) => {}
                    Err(StackwrightError::State(StateError::LockLost { lock_id })) => {
                        error!("Run lock {lock_id} was taken over, cancelling the run");
                        self.cancel.cancel();
                    }
                    Err(e) => warn!("Failed to renew run lock: {e}"),
                },
            }
        }
    }

    fn order(graph: &DependencyGraph, mode: ApplyMode) -> Result<Vec<usize>> {
        let order = if mode.is_reverse() {
            graph.teardown_order()
        } else {
            graph.resolve()
        };
        order.map_err(|e| {
            error!("Aborting run: {e}");
            StackwrightError::from(e)
        })
    }

    /// Seeds every output handle from recorded state.
    async fn prefill_outputs(&self, graph: &DependencyGraph) {
        for (i, unit) in graph.units().iter().enumerate() {
            match self.store.load_record(&unit.id, &unit.environment).await {
                Ok(Some(record)) => {
                    if let Some(handle) = graph.output_handle(i) {
                        handle.fulfil(record.outputs);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("No usable outputs for {}: {e}", unit.id),
            }
        }
    }

    async fn drive(
        &self,
        graph: &DependencyGraph,
        order: &[usize],
        mode: ApplyMode,
        options: &ApplyOptions,
        run_id: Uuid,
    ) -> Vec<UnitOutcome> {
        let n = graph.len();
        let prerequisites: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                if mode.is_reverse() {
                    graph.dependents(i).to_vec()
                } else {
                    graph.dependencies(i)
                }
            })
            .collect();

        if mode == ApplyMode::Rollback {
            self.prefill_outputs(graph).await;
        }

        let semaphore = Arc::new(Semaphore::new(options.concurrency_limit));
        let mut outcomes: Vec<Option<UnitOutcome>> = vec![None; n];
        let mut started = vec![false; n];
        let mut tasks = JoinSet::new();

        loop {
            if !self.cancel.is_cancelled() {
                for &i in order {
                    let ready = !started[i]
                        && prerequisites[i]
                            .iter()
                            .all(|&p| outcomes[p].as_ref().is_some_and(UnitOutcome::is_success));
                    if !ready {
                        continue;
                    }
                    let (Some(unit), Some(handle)) = (graph.unit(i), graph.output_handle(i)) else {
                        continue;
                    };

                    started[i] = true;
                    let task = UnitTask {
                        orchestrator: self.clone(),
                        run_id,
                        mode,
                        options: options.clone(),
                        unit: unit.clone(),
                        inputs: graph.inputs(i).cloned().collect(),
                        handle: handle.clone(),
                    };
                    let permits = Arc::clone(&semaphore);
                    tasks.spawn(async move {
                        let outcome = match permits.acquire_owned().await {
                            Ok(_permit) => task.run().await,
                            Err(e) => task.aborted(&e.to_string()),
                        };
                        (i, outcome)
                    });
                }
            }

            match tasks.join_next().await {
                Some(Ok((i, outcome))) => outcomes[i] = Some(outcome),
                Some(Err(e)) => error!("Unit task ended abnormally: {e}"),
                None => break,
            }
        }

        order
            .iter()
            .filter_map(|&i| match &outcomes[i] {
                Some(outcome) => Some(outcome.clone()),
                None => graph
                    .unit(i)
                    .map(|unit| self.unfinished(graph, unit, started[i], &prerequisites[i], &outcomes)),
            })
            .collect()
    }

    /// Builds the outcome of a unit whose task never reported one.
    fn unfinished(
        &self,
        graph: &DependencyGraph,
        unit: &DeployableUnit,
        started: bool,
        prerequisites: &[usize],
        outcomes: &[Option<UnitOutcome>],
    ) -> UnitOutcome {
        let mut outcome = UnitOutcome::pending(unit);

        if started {
            let error = StackwrightError::from(OrchestratorError::TaskAborted {
                unit: unit.id.clone(),
                reason: String::from("task panicked or was cancelled"),
            });
            outcome.state = UnitState::Failed;
            outcome.error = Some(UnitError::from_error(&error));
            return outcome;
        }

        outcome.blocked_by = prerequisites
            .iter()
            .filter(|&&p| !outcomes[p].as_ref().is_some_and(UnitOutcome::is_success))
            .filter_map(|&p| graph.unit(p).map(|u| u.id.clone()))
            .collect();

        if outcome.blocked_by.is_empty() && self.cancel.is_cancelled() {
            outcome.error = Some(UnitError::from_error(&StackwrightError::from(
                OrchestratorError::Cancelled,
            )));
        }
        outcome
    }

    /// Substitutes deferred values in a unit's document.
    ///
    /// With a retry policy, context tokens are resolved through the cache
    /// (invoking the resolver on a miss); without one, only stored entries
    /// are used.
    async fn resolve_unit(
        &self,
        unit: &DeployableUnit,
        inputs: &[OutputHandle],
        live: Option<&RetryPolicy>,
    ) -> Result<DeployableUnit> {
        let mut lookups = Vec::new();
        for (_, token, parsed) in scan(&unit.document) {
            match parsed {
                Ok(reference @ Reference::Context { .. }) => lookups.push(reference),
                Ok(Reference::Output { .. }) => {}
                Err(message) => {
                    return Err(ValidationError::InvalidReference {
                        unit: unit.id.clone(),
                        token,
                        message,
                    }
                    .into());
                }
            }
        }

        let outputs: BTreeMap<String, _> = inputs
            .iter()
            .filter_map(|h| h.get().map(|o| (h.producer().to_string(), o.clone())))
            .collect();

        let mut context = BTreeMap::new();
        for reference in lookups {
            if context.contains_key(&reference) {
                continue;
            }
            let Reference::Context { provider, params } = &reference else {
                continue;
            };
            let key = ContextKey {
                provider: provider.clone(),
                environment: unit.environment.clone(),
                params: params.clone(),
            };

            let value = match live {
                Some(retry) => Some(self.lookup_context(&key, retry).await?),
                None => self
                    .store
                    .load_context(&key)
                    .await?
                    .filter(|entry| !entry.stale)
                    .map(|entry| entry.value),
            };
            if let Some(value) = value {
                context.insert(reference, value);
            }
        }

        let document = DiffEngine::resolve_document(&unit.id, &unit.document, &outputs, &context)?;
        Ok(DeployableUnit {
            document,
            ..unit.clone()
        })
    }

    async fn lookup_context(&self, key: &ContextKey, retry: &RetryPolicy) -> Result<Value> {
        let resolver = self.resolver.as_ref();
        self.context
            .lookup_with(key, |k| async move {
                retry.run("context", || resolver.resolve(&k)).await
            })
            .await
    }

    async fn submit(&self, change_set: &ChangeSet, retry: &RetryPolicy) -> Result<BackendHandle> {
        retry
            .run("submit", || self.backend.submit(change_set))
            .await
    }

    async fn poll(&self, handle: &BackendHandle, retry: &RetryPolicy) -> Result<BackendStatus> {
        retry.run("poll", || self.backend.poll(handle)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockContextResolver, MockProvisioningBackend};
    use crate::error::{BackendError, ErrorClass};
    use crate::state::LocalStateStore;
    use crate::unit::EnvironmentKey;
    use serde_json::{json, Map};
    use std::time::Duration;
    use tempfile::TempDir;

    fn env() -> EnvironmentKey {
        EnvironmentKey::new("123456789012", "eu-west-1")
    }

    fn units() -> Vec<DeployableUnit> {
        vec![
            DeployableUnit::new("network", env(), json!({"type": "vpc", "cidr": "10.0.0.0/16"})),
            DeployableUnit::new(
                "app",
                env(),
                json!({"type": "service", "vpc": "${network.vpc_id}", "replicas": 2}),
            ),
        ]
    }

    fn options() -> ApplyOptions {
        ApplyOptions {
            poll_interval: Duration::from_millis(1),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                call_timeout: Duration::from_secs(5),
            },
            ..ApplyOptions::default()
        }
    }

    fn outputs_for(handle: &BackendHandle) -> Map<String, Value> {
        let mut outputs = Map::new();
        if handle.as_str() == "cs-network" {
            outputs.insert(String::from("vpc_id"), json!("vpc-0abc"));
        }
        outputs
    }

    fn succeeding_backend(submits: usize) -> MockProvisioningBackend {
        let mut backend = MockProvisioningBackend::new();
        backend
            .expect_submit()
            .times(submits)
            .returning(|cs| Ok(BackendHandle::new(format!("cs-{}", cs.unit_id))));
        backend.expect_poll().returning(|h| {
            Ok(BackendStatus::Succeeded {
                fingerprint: format!("fp-{h}"),
                outputs: outputs_for(h),
            })
        });
        backend
    }

    fn orchestrator(dir: &TempDir, backend: MockProvisioningBackend) -> Orchestrator {
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        Orchestrator::new(store, Arc::new(backend), Arc::new(MockContextResolver::new()))
    }

    #[tokio::test]
    async fn test_deploy_resolves_outputs_and_records_state() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, succeeding_backend(2));

        let report = orchestrator
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("run");

        assert!(report.is_success());
        assert_eq!(report.order(), vec!["network", "app"]);

        let app = orchestrator
            .store()
            .load_record("app", &env())
            .await
            .expect("load")
            .expect("recorded");
        assert_eq!(app.document["vpc"], json!("vpc-0abc"));
        assert_eq!(app.revision, 1);
    }

    #[tokio::test]
    async fn test_second_run_submits_nothing() {
        let dir = TempDir::new().expect("tempdir");
        orchestrator(&dir, succeeding_backend(2))
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("first run");

        let report = orchestrator(&dir, succeeding_backend(0))
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("second run");

        assert!(report.is_success());
        for outcome in &report.outcomes {
            assert_eq!(outcome.submissions, 0);
            assert!(outcome.change_set.as_ref().is_some_and(ChangeSet::is_empty));
        }
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_any_backend_call() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, succeeding_backend(0));
        let cyclic = vec![
            DeployableUnit::new("a", env(), json!({})).depends_on("b"),
            DeployableUnit::new("b", env(), json!({})).depends_on("a"),
        ];

        let err = orchestrator
            .apply(cyclic, ApplyMode::Deploy, options())
            .await
            .expect_err("cycle");
        assert_eq!(err.class(), ErrorClass::Cycle);
        assert!(err.to_string().contains("a, b"));
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_only() {
        let dir = TempDir::new().expect("tempdir");
        let mut backend = MockProvisioningBackend::new();
        backend
            .expect_submit()
            .returning(|cs| Ok(BackendHandle::new(format!("cs-{}", cs.unit_id))));
        backend.expect_poll().returning(|h| {
            if h.as_str() == "cs-network" {
                Ok(BackendStatus::Failed {
                    diagnostics: vec![String::from("quota exceeded")],
                })
            } else {
                Ok(BackendStatus::Succeeded {
                    fingerprint: String::from("fp"),
                    outputs: Map::new(),
                })
            }
        });

        let mut all = units();
        all.push(DeployableUnit::new("dns", env(), json!({"zone": "example.com"})));

        let report = orchestrator(&dir, backend)
            .apply(
                all,
                ApplyMode::Deploy,
                ApplyOptions {
                    rollback_on_failure: false,
                    ..options()
                },
            )
            .await
            .expect("run");

        let network = report.get("network").expect("network");
        assert_eq!(network.state, UnitState::Failed);
        assert_eq!(network.last_active_state, Some(UnitState::InProgress));
        let error = network.error.as_ref().expect("error");
        assert_eq!(error.class, ErrorClass::TerminalBackend);
        assert_eq!(error.diagnostics, vec![String::from("quota exceeded")]);

        let app = report.get("app").expect("app");
        assert_eq!(app.state, UnitState::Pending);
        assert_eq!(app.blocked_by, vec![String::from("network")]);

        assert_eq!(report.get("dns").expect("dns").state, UnitState::Succeeded);
    }

    #[tokio::test]
    async fn test_transient_submit_is_retried() {
        let dir = TempDir::new().expect("tempdir");
        let mut backend = MockProvisioningBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(BackendError::Throttled { retry_after_secs: 0 }.into()));
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(BackendHandle::new("cs-network")));
        backend.expect_poll().returning(|h| {
            Ok(BackendStatus::Succeeded {
                fingerprint: String::from("fp"),
                outputs: outputs_for(h),
            })
        });

        let report = orchestrator(&dir, backend)
            .apply(units().into_iter().take(1).collect(), ApplyMode::Deploy, options())
            .await
            .expect("run");

        let network = report.get("network").expect("network");
        assert_eq!(network.state, UnitState::Succeeded);
        assert_eq!(network.submissions, 1);
    }

    #[tokio::test]
    async fn test_dry_run_submits_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, succeeding_backend(0));

        let report = orchestrator
            .apply(
                units(),
                ApplyMode::Deploy,
                ApplyOptions {
                    dry_run: true,
                    ..options()
                },
            )
            .await
            .expect("run");

        assert!(report.dry_run);
        assert_eq!(report.count(UnitState::Planned), 2);
        let app = report.get("app").expect("app");
        let change_set = app.change_set.as_ref().expect("change set");
        assert_eq!(change_set.unresolved, vec![String::from("/vpc")]);
        assert!(orchestrator.store().list_records().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_units_pending() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, succeeding_backend(0));
        orchestrator.cancellation().cancel();

        let report = orchestrator
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("run");

        assert!(report.cancelled);
        assert_eq!(report.count(UnitState::Pending), 2);
        let network = report.get("network").expect("network");
        assert_eq!(
            network.error.as_ref().map(|e| e.class),
            Some(ErrorClass::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_destroy_tears_down_dependents_first() {
        let dir = TempDir::new().expect("tempdir");
        orchestrator(&dir, succeeding_backend(2))
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("deploy");

        let orchestrator = orchestrator(&dir, succeeding_backend(2));
        let report = orchestrator
            .apply(units(), ApplyMode::Destroy, options())
            .await
            .expect("destroy");

        assert!(report.is_success());
        assert_eq!(report.order(), vec!["app", "network"]);
        assert!(orchestrator.store().list_records().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_plan_uses_recorded_outputs() {
        let dir = TempDir::new().expect("tempdir");
        orchestrator(&dir, succeeding_backend(2))
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("deploy");

        let mut changed = units();
        changed[1].document["replicas"] = json!(3);

        let plan = orchestrator(&dir, succeeding_backend(0))
            .plan(changed)
            .await
            .expect("plan");

        assert_eq!(plan.order(), vec!["network", "app"]);
        let app = plan.get("app").and_then(PlannedUnit::change_set).expect("app");
        assert!(app.unresolved.is_empty());
        assert_eq!(app.entries.len(), 1);
        assert_eq!(app.entries[0].path, "/replicas");
        assert!(plan.get("network").and_then(PlannedUnit::change_set).is_some_and(ChangeSet::is_empty));
    }

    #[tokio::test]
    async fn test_progress_events_are_broadcast() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, succeeding_backend(1));
        let mut events = orchestrator.subscribe();

        orchestrator
            .apply(units().into_iter().take(1).collect(), ApplyMode::Deploy, options())
            .await
            .expect("run");

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![
                UnitState::Diffing,
                UnitState::Submitting,
                UnitState::InProgress,
                UnitState::Succeeded
            ]
        );
    }

    fn drain(events: &mut broadcast::Receiver<ProgressEvent>) -> Vec<UnitState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        states
    }

    #[tokio::test]
    async fn test_rollback_reports_a_single_terminal_state() {
        let dir = TempDir::new().expect("tempdir");
        let mut backend = MockProvisioningBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(BackendHandle::new("cs-apply")));
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(BackendHandle::new("cs-revert")));
        backend.expect_poll().returning(|h| {
            if h.as_str() == "cs-apply" {
                Ok(BackendStatus::Failed {
                    diagnostics: vec![String::from("quota exceeded")],
                })
            } else {
                Ok(BackendStatus::Succeeded {
                    fingerprint: String::from("fp"),
                    outputs: Map::new(),
                })
            }
        });
        let orchestrator = orchestrator(&dir, backend);
        let mut events = orchestrator.subscribe();

        let report = orchestrator
            .apply(units().into_iter().take(1).collect(), ApplyMode::Deploy, options())
            .await
            .expect("run");

        let network = report.get("network").expect("network");
        assert_eq!(network.state, UnitState::RolledBack);
        assert_eq!(network.submissions, 2);
        assert_eq!(
            network.error.as_ref().map(|e| e.class),
            Some(ErrorClass::TerminalBackend)
        );
        assert_eq!(
            drain(&mut events),
            vec![
                UnitState::Diffing,
                UnitState::Submitting,
                UnitState::InProgress,
                UnitState::RolledBack
            ]
        );
    }

    #[tokio::test]
    async fn test_unanswered_polls_fail_without_rollback() {
        let dir = TempDir::new().expect("tempdir");
        let mut backend = MockProvisioningBackend::new();
        backend
            .expect_submit()
            .times(1)
            .returning(|_| Ok(BackendHandle::new("cs-network")));
        backend
            .expect_poll()
            .returning(|_| Err(BackendError::network("connection reset").into()));
        let orchestrator = orchestrator(&dir, backend);
        let mut events = orchestrator.subscribe();

        let report = orchestrator
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("run");

        let network = report.get("network").expect("network");
        assert_eq!(network.state, UnitState::Failed);
        assert_eq!(network.last_active_state, Some(UnitState::InProgress));
        assert_eq!(network.submissions, 1);
        let error = network.error.as_ref().expect("error");
        assert_eq!(error.class, ErrorClass::TransientBackend);
        assert!(error.message.contains("cs-network"));

        assert_eq!(report.get("app").expect("app").blocked_by, vec![String::from("network")]);
        assert!(orchestrator.store().list_records().await.expect("list").is_empty());

        let states: Vec<_> = drain(&mut events);
        assert_eq!(states.last(), Some(&UnitState::Failed));
        assert!(!states.contains(&UnitState::RolledBack));
    }

    #[tokio::test]
    async fn test_cancellation_is_cleared_after_a_run() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, succeeding_backend(2));
        orchestrator.cancellation().cancel();

        let cancelled = orchestrator
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("cancelled run");
        assert!(cancelled.cancelled);
        assert!(!orchestrator.cancellation().is_cancelled());

        let report = orchestrator
            .apply(units(), ApplyMode::Deploy, options())
            .await
            .expect("second run");
        assert!(report.is_success());
    }
}
