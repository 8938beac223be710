#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autosave_core::{
    AutoSaveConfig, Record, RemoteStore, SaveFailure, SaveReceipt, SaveRequest, SaveState,
    SaveStatus, StateObserver,
};
use autosave_engine::{Session, SessionBuilder};
use autosave_local::MemoryStore;
use tokio::time::Instant;

pub const KEY: &str = "doc-1";

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// A save the remote store received.
#[derive(Debug, Clone)]
pub struct Call {
    pub data: Record,
    pub expected_version: Option<String>,
    pub at: Instant,
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// Remote store that answers from a script, then succeeds once the script
/// runs out. Successful saves are versioned `v1`, `v2`, ...
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<VecDeque<Result<(), SaveFailure>>>,
    calls: Mutex<Vec<Call>>,
    on_call: Mutex<Option<Hook>>,
    latency: Mutex<Duration>,
    versions: Mutex<u32>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(steps: Vec<Result<(), SaveFailure>>) -> Arc<Self> {
        let remote = Self::default();
        *remote.script.lock().unwrap() = steps.into();
        Arc::new(remote)
    }

    /// Run `hook` with the 1-based call number inside every save.
    pub fn on_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_call.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn saved_payloads(&self) -> Vec<Record> {
        self.calls().into_iter().map(|c| c.data).collect()
    }
}

pub fn transient() -> Result<(), SaveFailure> {
    Err(SaveFailure::Transient("503 Service Unavailable".to_string()))
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn save(&self, request: SaveRequest) -> Result<SaveReceipt, SaveFailure> {
        let number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                data: request.data.clone(),
                expected_version: request.expected_version.clone(),
                at: Instant::now(),
            });
            calls.len()
        };
        if let Some(hook) = self.on_call.lock().unwrap().as_ref() {
            hook(number);
        }

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        step.map(|()| {
            let mut versions = self.versions.lock().unwrap();
            *versions += 1;
            SaveReceipt::new(Some(format!("v{}", versions)))
        })
    }
}

/// Records every state the session reports.
pub fn state_log() -> (Arc<dyn StateObserver>, Arc<Mutex<Vec<SaveState>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let observer: Arc<dyn StateObserver> =
        Arc::new(move |status: &SaveStatus| sink.lock().unwrap().push(status.state));
    (observer, log)
}

pub fn builder(remote: &Arc<ScriptedRemote>, store: &Arc<MemoryStore>) -> SessionBuilder {
    Session::builder(KEY, remote.clone(), store.clone()).config(AutoSaveConfig::default())
}

pub async fn started(builder: SessionBuilder) -> Session {
    let session = builder.build();
    session.initialize().await.unwrap();
    session
}
