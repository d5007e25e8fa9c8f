use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PropagateConfig;
use crate::item::{SharedItem, SyncDirection, SyncInstruction, SyncItem, SyncStatus, shared};
use crate::journal::{FileRecord, SyncJournal};
use crate::ops::{LocalOps, RemoteOps};
use crate::transfer::{self, LeafCtx};

/// Items smaller than this keep a scheduling slot cheap enough to overbook.
const QUICK_TRANSFER_BYTES: i64 = 100 * 1024;

/// Events the propagator emits while executing a plan.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ItemCompleted(SyncItem),
    Progress { item: SyncItem, bytes: u64 },
    Finished(SyncStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskSpaceResult {
    Ok,
    Failure,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobParallelism {
    FullParallelism,
    WaitForFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    NotYetStarted,
    Running,
    Finished,
}

pub(crate) type JobId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafOp {
    LocalRemove,
    RemoteDelete,
    LocalMkdir { delete_existing: bool },
    RemoteMkdir { delete_existing: bool },
    Download { delete_existing_folder: bool },
    Upload { ng: bool, delete_existing: bool },
    RemoteMove,
    LocalRename,
    Ignore,
}

impl LeafOp {
    pub(crate) fn is_transfer(self) -> bool {
        matches!(self, LeafOp::Download { .. } | LeafOp::Upload { .. })
    }

    pub(crate) fn is_remote_change(self) -> bool {
        matches!(
            self,
            LeafOp::RemoteDelete
                | LeafOp::RemoteMkdir { .. }
                | LeafOp::RemoteMove
                | LeafOp::Upload { .. }
        )
    }
}

struct LeafJob {
    item: SharedItem,
    op: LeafOp,
}

struct CompositeJob {
    /// Pre-built child jobs, typically subdirectories.
    jobs_to_do: VecDeque<JobId>,
    /// Raw items turned into leaf jobs on demand.
    tasks_to_do: VecDeque<SharedItem>,
    /// Directory removals, deferred behind every other child: a delete of
    /// `D` must not start while a rename out of `D/` may still be running.
    deferred_jobs: VecDeque<JobId>,
    running: Vec<JobId>,
    worst_error: SyncStatus,
    finalize_requested: bool,
}

impl CompositeJob {
    fn new() -> Self {
        Self {
            jobs_to_do: VecDeque::new(),
            tasks_to_do: VecDeque::new(),
            deferred_jobs: VecDeque::new(),
            running: Vec::new(),
            worst_error: SyncStatus::NoStatus,
            finalize_requested: false,
        }
    }

    fn is_drained(&self) -> bool {
        self.jobs_to_do.is_empty()
            && self.tasks_to_do.is_empty()
            && self.deferred_jobs.is_empty()
            && self.running.is_empty()
    }
}

struct DirectoryJob {
    /// Absent only on the root job.
    item: Option<SharedItem>,
    /// The mkdir/rename/delete for the directory itself; runs alone, before
    /// any child, and is cleared once finished.
    first: Option<JobId>,
    subjobs: JobId,
    /// Plan entries subsumed by this directory's removal.
    affected: u32,
}

enum JobKind {
    Leaf(LeafJob),
    Composite(CompositeJob),
    Directory(DirectoryJob),
}

struct JobSlot {
    parent: Option<JobId>,
    state: JobState,
    kind: JobKind,
}

enum JobEvent {
    ScheduleNext,
    Finalize(JobId),
    LeafFinished { id: JobId, status: SyncStatus },
}

/// Clonable handle for aborting a running propagation from another task.
#[derive(Clone)]
pub struct PropagatorHandle {
    abort_requested: Arc<AtomicBool>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl PropagatorHandle {
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        let _ = self.tx.send(JobEvent::ScheduleNext);
    }
}

/// Executes a reconciled plan against the remote and the local tree.
///
/// A single control task owns the job arena and advances it on events; leaf
/// I/O runs on spawned tasks that report back over the internal channel.
pub struct Propagator {
    cfg: Arc<PropagateConfig>,
    remote: Arc<dyn RemoteOps>,
    local: Arc<dyn LocalOps>,
    journal: Arc<SyncJournal>,
    local_dir: PathBuf,
    events: mpsc::UnboundedSender<SyncEvent>,
    abort_requested: Arc<AtomicBool>,
    another_sync_needed: Arc<AtomicBool>,
    cancel: CancellationToken,

    jobs: Vec<JobSlot>,
    root: JobId,
    /// Running leaf jobs, oldest first.
    active_jobs: Vec<JobId>,
    job_tx: mpsc::UnboundedSender<JobEvent>,
    job_rx: Option<mpsc::UnboundedReceiver<JobEvent>>,
    final_status: Option<SyncStatus>,
}

impl Propagator {
    pub fn new(
        cfg: PropagateConfig,
        remote: Arc<dyn RemoteOps>,
        local: Arc<dyn LocalOps>,
        journal: Arc<SyncJournal>,
        local_dir: PathBuf,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        Self {
            cfg: Arc::new(cfg),
            remote,
            local,
            journal,
            local_dir,
            events,
            abort_requested: Arc::new(AtomicBool::new(false)),
            another_sync_needed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            jobs: Vec::new(),
            root: 0,
            active_jobs: Vec::new(),
            job_tx,
            job_rx: Some(job_rx),
            final_status: None,
        }
    }

    pub fn handle(&self) -> PropagatorHandle {
        PropagatorHandle {
            abort_requested: self.abort_requested.clone(),
            cancel: self.cancel.clone(),
            tx: self.job_tx.clone(),
        }
    }

    /// Whether this run discovered state that only another sync can repair.
    pub fn another_sync_needed(&self) -> bool {
        self.another_sync_needed.load(Ordering::Relaxed)
    }

    pub fn is_in_shared_directory(&self, path: &str) -> bool {
        transfer::is_in_shared_directory(&self.cfg, path)
    }

    pub fn disk_space_check(&self) -> DiskSpaceResult {
        let Some(free) = self.local.free_space(&self.local_dir) else {
            return DiskSpaceResult::Ok;
        };
        if free < self.cfg.critical_free_space_limit {
            return DiskSpaceResult::Critical;
        }
        if free - self.committed_disk_space() < self.cfg.free_space_limit {
            return DiskSpaceResult::Failure;
        }
        DiskSpaceResult::Ok
    }

    /// Bytes provisionally reserved by running downloads.
    pub fn committed_disk_space(&self) -> i64 {
        if self.jobs.is_empty() {
            0
        } else {
            self.committed(self.root)
        }
    }

    fn committed(&self, id: JobId) -> i64 {
        match &self.jobs[id].kind {
            JobKind::Leaf(leaf) => {
                if self.jobs[id].state == JobState::Running
                    && matches!(leaf.op, LeafOp::Download { .. })
                {
                    leaf.item.lock().expect("item mutex poisoned").size.max(0)
                } else {
                    0
                }
            }
            JobKind::Composite(c) => c.running.iter().map(|&child| self.committed(child)).sum(),
            JobKind::Directory(d) => {
                d.first.map(|f| self.committed(f)).unwrap_or(0) + self.committed(d.subjobs)
            }
        }
    }

    pub(crate) fn abort(&mut self) {
        if !self.abort_requested.swap(true, Ordering::Relaxed) {
            debug!("aborting propagation");
        }
        self.cancel.cancel();
        self.clear_pending();
        self.schedule_next_job();
    }

    fn push_job(&mut self, parent: Option<JobId>, kind: JobKind) -> JobId {
        let id = self.jobs.len();
        self.jobs.push(JobSlot {
            parent,
            state: JobState::NotYetStarted,
            kind,
        });
        id
    }
}

include!("propagator_impl_build.rs");
include!("propagator_impl_sched.rs");

#[cfg(test)]
#[path = "propagator_tests/mod.rs"]
mod tests;
