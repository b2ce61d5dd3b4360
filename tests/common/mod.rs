//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use stackwright::backend::{BackendHandle, BackendStatus, ContextResolver, ProvisioningBackend, RetryPolicy};
use stackwright::error::{BackendError, Result};
use stackwright::planner::{ChangeKind, ChangeSet};
use stackwright::state::{ContextKey, LocalStateStore, StateStore};
use stackwright::unit::{DeployableUnit, EnvironmentKey};
use stackwright::{ApplyOptions, Orchestrator};
use tempfile::TempDir;

/// One change set the fake backend accepted.
#[derive(Debug, Clone)]
pub struct Submission {
    pub unit_id: String,
    pub kind: ChangeKind,
    pub document: Value,
}

#[derive(Default)]
struct Script {
    /// Units whose deploy change sets the backend rejects.
    failing: Vec<String>,
    /// Remaining throttled responses per unit.
    throttled: HashMap<String, u32>,
    /// Units whose change sets can be submitted but never polled.
    unreachable: Vec<String>,
    /// Polls answered with `InProgress` before a unit settles.
    slow: HashMap<String, u32>,
    /// Outputs reported per unit.
    outputs: HashMap<String, Map<String, Value>>,
    /// Accepted change sets by handle.
    handles: HashMap<String, ChangeSet>,
    submissions: Vec<Submission>,
}

/// Scripted provisioning backend and context resolver.
#[derive(Clone, Default)]
pub struct FakeBackend {
    script: Arc<Mutex<Script>>,
    resolutions: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.with_outputs("network", json!({"vpc_id": "vpc-0abc"}))
    }

    /// Rejects every create or update change set for `unit`.
    pub fn failing(self, unit: &str) -> Self {
        self.script.lock().unwrap().failing.push(unit.to_string());
        self
    }

    /// Throttles the first `times` submissions for `unit`.
    pub fn throttled(self, unit: &str, times: u32) -> Self {
        self.script.lock().unwrap().throttled.insert(unit.to_string(), times);
        self
    }

    /// Accepts change sets for `unit` and then fails every poll of them.
    pub fn unreachable(self, unit: &str) -> Self {
        self.script.lock().unwrap().unreachable.push(unit.to_string());
        self
    }

    /// Keeps change sets for `unit` in progress for `polls` polls.
    pub fn slow(self, unit: &str, polls: u32) -> Self {
        self.script.lock().unwrap().slow.insert(unit.to_string(), polls);
        self
    }

    pub fn with_outputs(self, unit: &str, outputs: Value) -> Self {
        let Value::Object(outputs) = outputs else {
            panic!("outputs must be an object");
        };
        self.script.lock().unwrap().outputs.insert(unit.to_string(), outputs);
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.script.lock().unwrap().submissions.clone()
    }

    pub fn submitted_units(&self) -> Vec<String> {
        self.submissions().into_iter().map(|s| s.unit_id).collect()
    }

    pub fn clear(&self) {
        self.script.lock().unwrap().submissions.clear();
    }

    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvisioningBackend for FakeBackend {
    async fn submit(&self, change_set: &ChangeSet) -> Result<BackendHandle> {
        let mut script = self.script.lock().unwrap();

        if let Some(left) = script.throttled.get_mut(&change_set.unit_id) {
            if *left > 0 {
                *left -= 1;
                return Err(BackendError::Throttled { retry_after_secs: 0 }.into());
            }
        }

        let handle = format!("cs-{}-{}", change_set.unit_id, script.submissions.len());
        script.submissions.push(Submission {
            unit_id: change_set.unit_id.clone(),
            kind: change_set.kind,
            document: change_set.document.clone(),
        });
        script.handles.insert(handle.clone(), change_set.clone());
        Ok(BackendHandle::new(handle))
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        let mut script = self.script.lock().unwrap();
        let Some(change_set) = script.handles.get(handle.as_str()).cloned() else {
            return Err(BackendError::HandleNotFound {
                handle: handle.to_string(),
            }
            .into());
        };

        if script.unreachable.contains(&change_set.unit_id) {
            return Err(BackendError::network("connection reset").into());
        }
        if let Some(left) = script.slow.get_mut(&change_set.unit_id) {
            if *left > 0 {
                *left -= 1;
                return Ok(BackendStatus::InProgress);
            }
        }

        let applies_document = matches!(change_set.kind, ChangeKind::Create | ChangeKind::Update);
        if applies_document && script.failing.contains(&change_set.unit_id) {
            return Ok(BackendStatus::Failed {
                diagnostics: vec![format!("{} rejected by policy", change_set.unit_id)],
            });
        }

        Ok(BackendStatus::Succeeded {
            fingerprint: change_set.fingerprint,
            outputs: script.outputs.get(&change_set.unit_id).cloned().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ContextResolver for FakeBackend {
    async fn resolve(&self, key: &ContextKey) -> Result<Value> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!([
            format!("{}a", key.environment.region()),
            format!("{}b", key.environment.region())
        ]))
    }
}

/// An orchestrator over a fresh state directory.
pub struct Harness {
    pub dir: TempDir,
    pub backend: FakeBackend,
    pub store: Arc<dyn StateStore>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(backend: FakeBackend) -> Self {
        let dir = TempDir::new().unwrap();
        Self::in_dir(dir, backend)
    }

    /// Reuses the state directory with another backend script.
    pub fn reopen(self, backend: FakeBackend) -> Self {
        Self::in_dir(self.dir, backend)
    }

    fn in_dir(dir: TempDir, backend: FakeBackend) -> Self {
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let shared = Arc::new(backend.clone());
        let orchestrator = Orchestrator::new(Arc::clone(&store), shared.clone(), shared);
        Self {
            dir,
            backend,
            store,
            orchestrator,
        }
    }
}

pub fn env() -> EnvironmentKey {
    EnvironmentKey::new("123456789012", "eu-west-1")
}

pub fn network(cidr: &str) -> DeployableUnit {
    DeployableUnit::new("network", env(), json!({"type": "vpc", "cidr": cidr}))
}

pub fn app() -> DeployableUnit {
    DeployableUnit::new(
        "app",
        env(),
        json!({"type": "service", "vpc": "${network.vpc_id}", "replicas": 2}),
    )
    .depends_on("network")
}

pub fn options() -> ApplyOptions {
    ApplyOptions {
        poll_interval: Duration::from_millis(1),
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
        },
        ..ApplyOptions::default()
    }
}
