use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use url::Url;

use super::*;
use crate::blacklist::BlacklistRecord;
use crate::item::SyncDirection::{Down, Up};
use crate::item::SyncInstruction;
use crate::journal::{DownloadInfo, FileRecord, ItemType, PollRecord, UploadInfo};
use crate::ops::{
    PollOutcome, RemoteError, RemoteGet, RemoteInfo, RemoteOps, StdLocalOps, UploadOutcome,
};

/// Scripted in-process remote: records an operation log and fails or delays
/// configured operations. Keys match the logged entries.
#[derive(Default)]
struct MockRemote {
    log: StdMutex<Vec<String>>,
    bodies: StdMutex<HashMap<String, Vec<u8>>>,
    fail: StdMutex<HashMap<String, StatusCode>>,
    delay: StdMutex<HashMap<String, Duration>>,
    finalize_pending: StdMutex<HashMap<String, String>>,
    poll_script: StdMutex<HashMap<String, VecDeque<PollOutcome>>>,
}

impl MockRemote {
    fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn position(&self, prefix: &str) -> Option<usize> {
        self.log_entries()
            .iter()
            .position(|entry| entry.starts_with(prefix))
    }

    fn count(&self, prefix: &str) -> usize {
        self.log_entries()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    fn set_body(&self, path: &str, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(path.to_string(), body.to_vec());
    }

    fn fail_with(&self, key: &str, status: StatusCode) {
        self.fail.lock().unwrap().insert(key.to_string(), status);
    }

    fn clear_failure(&self, key: &str) {
        self.fail.lock().unwrap().remove(key);
    }

    fn delay_op(&self, key: &str, delay: Duration) {
        self.delay.lock().unwrap().insert(key.to_string(), delay);
    }

    fn pend_finalize(&self, path: &str, poll_url: &str) {
        self.finalize_pending
            .lock()
            .unwrap()
            .insert(path.to_string(), poll_url.to_string());
    }

    fn script_poll(&self, url: &str, outcomes: Vec<PollOutcome>) {
        self.poll_script
            .lock()
            .unwrap()
            .insert(url.to_string(), outcomes.into());
    }

    fn info_for(path: &str) -> RemoteInfo {
        RemoteInfo {
            etag: Some(format!("etag-{path}")),
            file_id: Some(format!("fid-{path}")),
            remote_perm: None,
            size: 0,
            modtime: 0,
            is_directory: false,
        }
    }

    fn note(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    async fn gate(&self, key: &str) -> Result<(), RemoteError> {
        let delay = self.delay.lock().unwrap().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.fail.lock().unwrap().get(key).copied();
        match failure {
            Some(status) => Err(RemoteError::server(status, "scripted failure")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteOps for MockRemote {
    async fn stat(&self, path: &str) -> Result<RemoteInfo, RemoteError> {
        let key = format!("stat {path}");
        self.note(key.clone());
        self.gate(&key).await?;
        Ok(Self::info_for(path))
    }

    async fn mkcol(&self, path: &str) -> Result<RemoteInfo, RemoteError> {
        let key = format!("mkcol {path}");
        self.note(key.clone());
        self.gate(&key).await?;
        Ok(Self::info_for(path))
    }

    async fn move_item(&self, from: &str, to: &str) -> Result<RemoteInfo, RemoteError> {
        let key = format!("move {from} {to}");
        self.note(key.clone());
        self.gate(&key).await?;
        Ok(Self::info_for(to))
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let key = format!("delete {path}");
        self.note(key.clone());
        self.gate(&key).await
    }

    async fn get(&self, path: &str, offset: u64) -> Result<RemoteGet, RemoteError> {
        self.note(format!("get {path} {offset}"));
        self.gate(&format!("get {path}")).await?;
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default();
        let start = (offset as usize).min(body.len());
        let rest = body[start..].to_vec();
        let content_length = Some(rest.len() as u64);
        let chunks: Vec<Result<Bytes, RemoteError>> = if rest.is_empty() {
            Vec::new()
        } else {
            vec![Ok(Bytes::from(rest))]
        };
        Ok(RemoteGet {
            content_length,
            stream: Box::pin(futures_util::stream::iter(chunks)),
        })
    }

    async fn put(&self, path: &str, data: Bytes, _modtime: i64) -> Result<RemoteInfo, RemoteError> {
        self.note(format!("put {path} {}", data.len()));
        self.gate(&format!("put {path}")).await?;
        Ok(Self::info_for(path))
    }

    async fn put_chunk_v1(
        &self,
        path: &str,
        _transfer_id: u64,
        chunk: u32,
        chunk_count: u32,
        _data: Bytes,
        _modtime: i64,
    ) -> Result<Option<RemoteInfo>, RemoteError> {
        let key = format!("put_chunk_v1 {path} {chunk}/{chunk_count}");
        self.note(key.clone());
        self.gate(&key).await?;
        Ok(if chunk + 1 == chunk_count {
            Some(Self::info_for(path))
        } else {
            None
        })
    }

    async fn create_upload_session(
        &self,
        path: &str,
        _transfer_id: u64,
    ) -> Result<(), RemoteError> {
        let key = format!("create_session {path}");
        self.note(key.clone());
        self.gate(&key).await
    }

    async fn put_session_chunk(
        &self,
        _transfer_id: u64,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        let key = format!("session_chunk {offset} {}", data.len());
        self.note(key.clone());
        self.gate(&key).await
    }

    async fn finalize_upload_session(
        &self,
        _transfer_id: u64,
        path: &str,
        _modtime: i64,
    ) -> Result<UploadOutcome, RemoteError> {
        let key = format!("finalize {path}");
        self.note(key.clone());
        self.gate(&key).await?;
        let pending = self.finalize_pending.lock().unwrap().get(path).cloned();
        match pending {
            Some(url) => Ok(UploadOutcome::Pending(Url::parse(&url).unwrap())),
            None => Ok(UploadOutcome::Done(Self::info_for(path))),
        }
    }

    async fn poll(&self, url: &Url) -> Result<PollOutcome, RemoteError> {
        self.note(format!("poll {url}"));
        let scripted = self
            .poll_script
            .lock()
            .unwrap()
            .get_mut(&url.to_string())
            .and_then(|queue| queue.pop_front());
        Ok(scripted.unwrap_or_else(|| PollOutcome::Done(Self::info_for("polled"))))
    }
}

/// Real filesystem underneath, with free space and case behaviour overrides.
struct TestLocal {
    inner: StdLocalOps,
    free: Option<i64>,
    case_preserving: bool,
}

impl Default for TestLocal {
    fn default() -> Self {
        Self {
            inner: StdLocalOps,
            free: None,
            case_preserving: false,
        }
    }
}

#[async_trait]
impl LocalOps for TestLocal {
    async fn mkdir(&self, path: &Path) -> io::Result<()> {
        self.inner.mkdir(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir_all(path).await
    }

    async fn metadata(&self, path: &Path) -> io::Result<std::fs::Metadata> {
        self.inner.metadata(path).await
    }

    fn free_space(&self, path: &Path) -> Option<i64> {
        self.free.or_else(|| self.inner.free_space(path))
    }

    fn is_case_preserving(&self) -> bool {
        self.case_preserving
    }

    fn has_case_clash(&self, path: &Path) -> bool {
        self.inner.has_case_clash(path)
    }
}

struct Harness {
    dir: tempfile::TempDir,
    remote: Arc<MockRemote>,
    journal: Arc<SyncJournal>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    propagator: Propagator,
}

fn make_harness(cfg: PropagateConfig) -> Harness {
    make_harness_with_local(cfg, TestLocal::default())
}

fn make_harness_with_local(cfg: PropagateConfig, local: TestLocal) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote::default());
    let journal = Arc::new(SyncJournal::in_memory(false));
    let (tx, events) = mpsc::unbounded_channel();
    let propagator = Propagator::new(
        cfg,
        remote.clone(),
        Arc::new(local),
        journal.clone(),
        dir.path().to_path_buf(),
        tx,
    );
    Harness {
        dir,
        remote,
        journal,
        events,
        propagator,
    }
}

impl Harness {
    fn write_local(&self, rel: &str, content: &[u8]) {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn read_local(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.dir.path().join(rel)).unwrap()
    }

    fn local_exists(&self, rel: &str) -> bool {
        self.dir.path().join(rel).exists()
    }

    fn completed_items(&mut self) -> Vec<SyncItem> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let SyncEvent::ItemCompleted(item) = event {
                out.push(item);
            }
        }
        out
    }

    fn completed_for(&mut self, path: &str) -> Vec<SyncItem> {
        self.completed_items()
            .into_iter()
            .filter(|item| item.path == path)
            .collect()
    }
}

fn file_item(path: &str, instruction: SyncInstruction, direction: crate::item::SyncDirection) -> SyncItem {
    let mut item = SyncItem::new(path);
    item.instruction = instruction;
    item.direction = direction;
    item
}

fn dir_item(path: &str, instruction: SyncInstruction, direction: crate::item::SyncDirection) -> SyncItem {
    let mut item = file_item(path, instruction, direction);
    item.is_directory = true;
    item
}

fn journal_record(path: &str, file_type: ItemType) -> FileRecord {
    FileRecord {
        path: path.into(),
        inode: 3,
        mode: 0o644,
        modtime: 1_700_000_000,
        file_type,
        etag: Some(format!("old-{path}")),
        file_id: Some(format!("old-id-{path}")),
        remote_perm: None,
        size: 1,
    }
}

include!("part1.rs");
include!("part2.rs");
include!("part3.rs");
