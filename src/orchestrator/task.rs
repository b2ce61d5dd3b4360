//! Execution of a single unit within a run.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendHandle, BackendStatus};
use crate::error::{ErrorClass, OrchestratorError, Result, StackwrightError, ValidationError};
use crate::graph::OutputHandle;
use crate::planner::{ChangeKind, ChangeSet};
use crate::state::RecordedState;
use crate::unit::{DeployableUnit, UnitState};

use super::types::{ApplyMode, ApplyOptions, UnitError, UnitOutcome};
use super::Orchestrator;

/// How the backend settled a change set.
enum Settled {
    Applied {
        fingerprint: String,
        outputs: Map<String, Value>,
    },
    Rejected {
        diagnostics: Vec<String>,
    },
}

/// Everything one unit needs to run on its own task.
pub(super) struct UnitTask {
    pub orchestrator: Orchestrator,
    pub run_id: Uuid,
    pub mode: ApplyMode,
    pub options: ApplyOptions,
    pub unit: DeployableUnit,
    pub inputs: Vec<OutputHandle>,
    pub handle: OutputHandle,
}

impl UnitTask {
    /// Drives the unit to a terminal state.
    pub async fn run(self) -> UnitOutcome {
        let mut outcome = UnitOutcome::pending(&self.unit);

        if self.orchestrator.cancellation().is_cancelled() {
            Self::mark_cancelled(&mut outcome);
            return outcome;
        }

        let result = match self.mode {
            ApplyMode::Deploy => self.deploy(&mut outcome).await,
            ApplyMode::Destroy => self.destroy(&mut outcome).await,
            ApplyMode::Rollback => self.revert(&mut outcome).await,
        };

        if let Err(e) = result {
            self.fail(&mut outcome, UnitError::from_error(&e));
        }
        outcome
    }

    /// Outcome for a task that could not even start.
    pub fn aborted(&self, reason: &str) -> UnitOutcome {
        let mut outcome = UnitOutcome::pending(&self.unit);
        let error = StackwrightError::from(OrchestratorError::TaskAborted {
            unit: self.unit.id.clone(),
            reason: reason.to_string(),
        });
        outcome.state = UnitState::Failed;
        outcome.error = Some(UnitError::from_error(&error));
        outcome
    }

    fn transition(&self, outcome: &mut UnitOutcome, state: UnitState, message: Option<String>) {
        if !state.is_terminal() {
            outcome.last_active_state = Some(state);
        }
        outcome.state = state;
        self.orchestrator.emit(self.run_id, &self.unit, state, message);
    }

    fn fail(&self, outcome: &mut UnitOutcome, error: UnitError) {
        warn!("Unit {} failed: {}", self.unit.id, error.message);
        let message = error.message.clone();
        outcome.error = Some(error);
        self.transition(outcome, UnitState::Failed, Some(message));
    }

    fn mark_cancelled(outcome: &mut UnitOutcome) {
        outcome.error = Some(UnitError::from_error(&StackwrightError::from(
            OrchestratorError::Cancelled,
        )));
    }

    /// Returns true and records the cancellation if the run was cancelled.
    fn stop_if_cancelled(&self, outcome: &mut UnitOutcome) -> bool {
        if !self.orchestrator.cancellation().is_cancelled() {
            return false;
        }
        info!("Run cancelled, not submitting {}", self.unit.id);
        Self::mark_cancelled(outcome);
        outcome.state = UnitState::Pending;
        self.orchestrator
            .emit(self.run_id, &self.unit, UnitState::Pending, Some(String::from("cancelled")));
        true
    }

    async fn load_record(&self) -> Result<Option<RecordedState>> {
        self.orchestrator
            .store()
            .load_record(&self.unit.id, &self.unit.environment)
            .await
    }

    async fn deploy(&self, outcome: &mut UnitOutcome) -> Result<()> {
        self.transition(outcome, UnitState::Diffing, None);

        let record = self.load_record().await?;
        let live = (!self.options.dry_run).then_some(&self.options.retry);
        let resolved = self
            .orchestrator
            .resolve_unit(&self.unit, &self.inputs, live)
            .await?;
        let change_set = self.orchestrator.engine().diff(&resolved, record.as_ref());
        outcome.change_set = Some(change_set.clone());

        if change_set.is_empty() {
            if let Some(record) = &record {
                self.handle.fulfil(record.outputs.clone());
            }
            self.transition(outcome, UnitState::Succeeded, Some(String::from("no changes")));
            return Ok(());
        }

        if self.options.dry_run {
            self.transition(outcome, UnitState::Planned, Some(change_set.to_string()));
            return Ok(());
        }

        if !change_set.unresolved.is_empty() {
            return Err(ValidationError::MalformedDocument {
                unit: self.unit.id.clone(),
                message: format!("unresolved values at {}", change_set.unresolved.join(", ")),
            }
            .into());
        }

        if self.stop_if_cancelled(outcome) {
            return Ok(());
        }

        let handle = self.submit(outcome, &change_set).await?;
        match self.wait(&handle).await {
            Ok(Settled::Applied {
                fingerprint,
                outputs,
            }) => {
                let next = match &record {
                    Some(previous) => {
                        previous.next_revision(resolved.document.clone(), &fingerprint, outputs.clone())
                    }
                    None => RecordedState::new(
                        &self.unit.id,
                        self.unit.environment.clone(),
                        resolved.document.clone(),
                        &fingerprint,
                        outputs.clone(),
                    ),
                };
                self.orchestrator.store().commit_record(&next).await?;
                self.handle.fulfil(outputs);
                self.transition(
                    outcome,
                    UnitState::Succeeded,
                    Some(format!("revision {}", next.revision)),
                );
            }
            Ok(Settled::Rejected { diagnostics }) => {
                let error = UnitError {
                    class: ErrorClass::TerminalBackend,
                    message: format!("Backend failed to apply {} change set", change_set.kind),
                    diagnostics,
                };
                self.recover(outcome, error, &resolved, record.as_ref()).await;
            }
            // The change set may still be running; no rollback.
            Err(e) => self.fail(outcome, UnitError::from_error(&e)),
        }

        Ok(())
    }

    /// Handles a deploy the backend rejected, reverting it when the options
    /// ask for it. With rollback enabled the unit reports `RolledBack`, or
    /// `Failed` only if the revert itself fails.
    async fn recover(
        &self,
        outcome: &mut UnitOutcome,
        error: UnitError,
        attempted: &DeployableUnit,
        record: Option<&RecordedState>,
    ) {
        if !self.options.rollback_on_failure {
            self.fail(outcome, error);
            return;
        }

        warn!("Unit {} failed: {}", self.unit.id, error.message);
        outcome.error = Some(error);

        let change_set = self.orchestrator.engine().rollback(attempted, record);
        if change_set.is_empty() {
            self.transition(outcome, UnitState::RolledBack, None);
            return;
        }

        info!("Rolling back {} in {}", self.unit.id, self.unit.environment);
        let reverted = match self.orchestrator.submit(&change_set, &self.options.retry).await {
            Ok(handle) => {
                outcome.submissions += 1;
                self.wait(&handle).await
            }
            Err(e) => Err(e),
        };

        match reverted {
            Ok(Settled::Applied { .. }) => {
                self.transition(outcome, UnitState::RolledBack, Some(String::from("rolled back")));
            }
            Ok(Settled::Rejected { diagnostics }) => {
                self.rollback_failed(outcome, "backend rejected the rollback", diagnostics);
            }
            Err(e) => self.rollback_failed(outcome, &e.to_string(), Vec::new()),
        }
    }

    fn rollback_failed(&self, outcome: &mut UnitOutcome, reason: &str, diagnostics: Vec<String>) {
        warn!("Rollback of {} failed: {reason}", outcome.unit_id);
        let mut message = None;
        if let Some(error) = outcome.error.as_mut() {
            error.message = format!("{}; rollback failed: {reason}", error.message);
            error.diagnostics.extend(diagnostics);
            message = Some(error.message.clone());
        }
        self.transition(outcome, UnitState::Failed, message);
    }

    async fn destroy(&self, outcome: &mut UnitOutcome) -> Result<()> {
        self.transition(outcome, UnitState::Diffing, None);

        let record = self.load_record().await?;
        let change_set = self.orchestrator.engine().destroy(&self.unit, record.as_ref());
        outcome.change_set = Some(change_set.clone());

        if change_set.is_empty() {
            self.transition(outcome, UnitState::Succeeded, Some(String::from("nothing to destroy")));
            return Ok(());
        }

        self.converge(outcome, &change_set).await
    }

    async fn revert(&self, outcome: &mut UnitOutcome) -> Result<()> {
        self.transition(outcome, UnitState::Diffing, None);

        let Some(record) = self.load_record().await? else {
            outcome.change_set = Some(self.orchestrator.engine().unchanged(&self.unit, ChangeKind::Rollback));
            self.transition(outcome, UnitState::Succeeded, Some(String::from("no recorded state")));
            return Ok(());
        };

        let resolved = self
            .orchestrator
            .resolve_unit(&self.unit, &self.inputs, None)
            .await?;
        let change_set = self.orchestrator.engine().rollback(&resolved, Some(&record));
        outcome.change_set = Some(change_set.clone());

        if change_set.is_empty() {
            self.transition(outcome, UnitState::Succeeded, Some(String::from("already at recorded state")));
            return Ok(());
        }

        self.converge(outcome, &change_set).await
    }

    /// Submits a teardown or rollback change set and records the result.
    async fn converge(&self, outcome: &mut UnitOutcome, change_set: &ChangeSet) -> Result<()> {
        if self.options.dry_run {
            self.transition(outcome, UnitState::Planned, Some(change_set.to_string()));
            return Ok(());
        }

        if self.stop_if_cancelled(outcome) {
            return Ok(());
        }

        let handle = self.submit(outcome, change_set).await?;
        match self.wait(&handle).await? {
            Settled::Applied { .. } => {
                if change_set.kind == ChangeKind::Destroy {
                    self.orchestrator
                        .store()
                        .remove_record(&self.unit.id, &self.unit.environment)
                        .await?;
                }
                self.transition(outcome, UnitState::Succeeded, None);
            }
            Settled::Rejected { diagnostics } => {
                let error = UnitError {
                    class: ErrorClass::TerminalBackend,
                    message: format!("Backend failed to apply {} change set", change_set.kind),
                    diagnostics,
                };
                self.fail(outcome, error);
            }
        }
        Ok(())
    }

    async fn submit(&self, outcome: &mut UnitOutcome, change_set: &ChangeSet) -> Result<BackendHandle> {
        self.transition(outcome, UnitState::Submitting, Some(change_set.to_string()));
        let handle = self
            .orchestrator
            .submit(change_set, &self.options.retry)
            .await?;
        outcome.submissions += 1;
        self.transition(outcome, UnitState::InProgress, Some(format!("handle {handle}")));
        Ok(handle)
    }

    /// Polls until the backend reports a terminal status.
    ///
    /// A poll that still fails after its retries leaves the change set's fate
    /// unknown and is reported as [`OrchestratorError::OutcomeUnknown`].
    async fn wait(&self, handle: &BackendHandle) -> Result<Settled> {
        loop {
            let status = self
                .orchestrator
                .poll(handle, &self.options.retry)
                .await
                .map_err(|e| OrchestratorError::OutcomeUnknown {
                    unit: self.unit.id.clone(),
                    handle: handle.to_string(),
                    message: e.to_string(),
                })?;
            match status {
                BackendStatus::InProgress => {
                    debug!("{} still in progress ({handle})", self.unit.id);
                    tokio::time::sleep(self.options.poll_interval).await;
                }
                BackendStatus::Succeeded {
                    fingerprint,
                    outputs,
                } => {
                    return Ok(Settled::Applied {
                        fingerprint,
                        outputs,
                    });
                }
                BackendStatus::Failed { diagnostics } => {
                    return Ok(Settled::Rejected { diagnostics });
                }
            }
        }
    }
}
