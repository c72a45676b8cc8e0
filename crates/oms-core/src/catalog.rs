//! The run catalog (spec §3 "RunState", §5 "Shared-resource policy").
//!
//! A single in-memory object guarded by one lock; every component publishes
//! a snapshot into it each cycle, and the HTTP layer only ever reads from
//! it. Per DESIGN.md, the teacher's "list with PushFront/evict-from-back"
//! shape (see `rust/crates/ob-workflow/src/state.rs`'s transition history)
//! is replaced here with a bounded `VecDeque` ring per model, indexed by
//! model name, holding (digest, run_stamp)-keyed entries.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};

use crate::job::ResourceDemand;
use crate::paths::DiskStatus;
use crate::stamp::Stamp;

/// Maximum number of retained run records per model name.
pub const MAX_RUNS_PER_MODEL: usize = 200;

/// A per-run cancellation handle. Receiving the signal sends an OS kill to
/// the child and proceeds to the normal exit path (spec §5 "Cancellation
/// semantics"). `None` once the kill has been sent or the process is no
/// longer running.
pub struct RunState {
    pub model_name: String,
    pub model_digest: String,
    pub sub_stamp: Stamp,
    pub run_stamp: Stamp,
    pub run_name: String,
    pub task_name: String,
    pub is_final: bool,
    pub updated_at: DateTime<Utc>,
    pub log_path: Option<PathBuf>,
    pub pid: Option<u32>,
    pub command_path: Option<String>,
    pub kill: Option<oneshot::Sender<()>>,
}

/// Read-only view of a [`RunState`] for the HTTP layer and tests — the kill
/// channel is not `Clone`, so snapshots carry only whether one is present.
#[derive(Debug, Clone, Serialize)]
pub struct RunStateView {
    pub model_name: String,
    pub model_digest: String,
    pub sub_stamp: Stamp,
    pub run_stamp: Stamp,
    pub run_name: String,
    pub task_name: String,
    pub is_final: bool,
    pub updated_at: DateTime<Utc>,
    pub log_path: Option<PathBuf>,
    pub pid: Option<u32>,
    pub command_path: Option<String>,
    pub killable: bool,
}

impl From<&RunState> for RunStateView {
    fn from(s: &RunState) -> Self {
        RunStateView {
            model_name: s.model_name.clone(),
            model_digest: s.model_digest.clone(),
            sub_stamp: s.sub_stamp.clone(),
            run_stamp: s.run_stamp.clone(),
            run_name: s.run_name.clone(),
            task_name: s.task_name.clone(),
            is_final: s.is_final,
            updated_at: s.updated_at,
            log_path: s.log_path.clone(),
            pid: s.pid,
            command_path: s.command_path.clone(),
            killable: s.kill.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceTotals {
    pub queue_total: ResourceDemand,
    pub queue_own: ResourceDemand,
    pub active_total: ResourceDemand,
    pub active_own: ResourceDemand,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUseSnapshot {
    pub this_instance_bytes: u64,
    pub global_bytes: u64,
    pub per_instance_limit_bytes: u64,
    pub global_limit_bytes: u64,
    pub is_over: bool,
    pub status: DiskStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct CatalogInner {
    runs: HashMap<String, VecDeque<RunState>>,
    totals: ResourceTotals,
    disk_use: Option<DiskUseSnapshot>,
}

/// The single mutex-guarded catalog object (spec §5).
#[derive(Default)]
pub struct RunCatalog {
    inner: Mutex<CatalogInner>,
}

impl RunCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_started(&self, state: RunState) {
        let mut inner = self.inner.lock().await;
        let ring = inner.runs.entry(state.model_name.clone()).or_default();
        ring.push_back(state);
        while ring.len() > MAX_RUNS_PER_MODEL {
            ring.pop_front();
        }
    }

    pub async fn mark_final(&self, model: &str, run_stamp: &Stamp) {
        let mut inner = self.inner.lock().await;
        if let Some(ring) = inner.runs.get_mut(model) {
            if let Some(run) = ring.iter_mut().find(|r| &r.run_stamp == run_stamp) {
                run.is_final = true;
                run.updated_at = Utc::now();
                run.kill = None;
            }
        }
    }

    /// Take the kill handle for a run, if one is registered and the job is
    /// not yet final. Consumes the handle: a second call returns `None`.
    pub async fn take_kill(&self, model: &str, run_stamp: &Stamp) -> Option<oneshot::Sender<()>> {
        let mut inner = self.inner.lock().await;
        inner
            .runs
            .get_mut(model)?
            .iter_mut()
            .find(|r| &r.run_stamp == run_stamp)?
            .kill
            .take()
    }

    pub async fn snapshot_model(&self, model: &str) -> Vec<RunStateView> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .get(model)
            .map(|ring| ring.iter().map(RunStateView::from).collect())
            .unwrap_or_default()
    }

    pub async fn snapshot_all(&self) -> Vec<RunStateView> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .values()
            .flat_map(|ring| ring.iter().map(RunStateView::from))
            .collect()
    }

    pub async fn set_totals(&self, totals: ResourceTotals) {
        self.inner.lock().await.totals = totals;
    }

    pub async fn totals(&self) -> ResourceTotals {
        self.inner.lock().await.totals
    }

    pub async fn set_disk_use(&self, snapshot: DiskUseSnapshot) {
        self.inner.lock().await.disk_use = Some(snapshot);
    }

    pub async fn disk_use(&self) -> Option<DiskUseSnapshot> {
        self.inner.lock().await.disk_use.clone()
    }
}
