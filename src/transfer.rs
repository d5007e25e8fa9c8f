use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blacklist::{BlacklistRecord, RetryDelay};
use crate::config::PropagateConfig;
use crate::item::{SharedItem, SyncInstruction, SyncItem, SyncStatus, shared};
use crate::journal::{DownloadInfo, FileRecord, JournalError, PollRecord, SyncJournal, UploadInfo};
use crate::ops::{LocalOps, PollOutcome, RemoteError, RemoteErrorClass, RemoteInfo, RemoteOps, UploadOutcome};
use crate::paths::{self, PathError};
use crate::propagator::{LeafOp, SyncEvent};

/// A partial download that failed this often is thrown away and restarted.
const MAX_RESUME_ERRORS: u32 = 3;

/// Everything a leaf executor needs, cloned out of the propagator.
pub(crate) struct LeafCtx {
    pub remote: Arc<dyn RemoteOps>,
    pub local: Arc<dyn LocalOps>,
    pub journal: Arc<SyncJournal>,
    pub cfg: Arc<PropagateConfig>,
    pub local_dir: PathBuf,
    pub events: mpsc::UnboundedSender<SyncEvent>,
    pub abort_requested: Arc<AtomicBool>,
    pub another_sync_needed: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

pub(crate) struct LeafError {
    status: SyncStatus,
    message: String,
    http: Option<StatusCode>,
    may_blacklist: bool,
}

impl LeafError {
    fn soft(message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::SoftError,
            message: message.into(),
            http: None,
            may_blacklist: false,
        }
    }

    fn normal(message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::NormalError,
            message: message.into(),
            http: None,
            may_blacklist: false,
        }
    }
}

impl From<RemoteError> for LeafError {
    fn from(err: RemoteError) -> Self {
        let status = match err.classification() {
            RemoteErrorClass::Auth => SyncStatus::FatalError,
            RemoteErrorClass::RateLimit | RemoteErrorClass::Transient => SyncStatus::SoftError,
            RemoteErrorClass::Permanent => SyncStatus::NormalError,
        };
        let http = err.status();
        // storage exhaustion is retried, but tracked in the blacklist
        let may_blacklist = matches!(
            http,
            Some(StatusCode::INSUFFICIENT_STORAGE | StatusCode::PAYLOAD_TOO_LARGE)
        );
        Self {
            status,
            message: err.to_string(),
            http,
            may_blacklist,
        }
    }
}

impl From<io::Error> for LeafError {
    fn from(err: io::Error) -> Self {
        Self::normal(err.to_string())
    }
}

impl From<PathError> for LeafError {
    fn from(err: PathError) -> Self {
        Self::normal(err.to_string())
    }
}

impl From<JournalError> for LeafError {
    fn from(err: JournalError) -> Self {
        Self {
            status: SyncStatus::FatalError,
            message: format!("Error writing metadata to the database: {err}"),
            http: None,
            may_blacklist: false,
        }
    }
}

pub(crate) fn is_in_shared_directory(cfg: &PropagateConfig, path: &str) -> bool {
    // Servers without per-file permissions: the Shared tree is either the
    // whole connection or a top-level directory.
    cfg.remote_folder.starts_with("Shared") || path == "Shared" || path.starts_with("Shared/")
}

/// Entry point of a spawned leaf task. Runs the operation, applies the
/// completion policy and returns the final status for the job tree.
pub(crate) async fn run_leaf(ctx: LeafCtx, op: LeafOp, item: SharedItem) -> SyncStatus {
    let result = execute(&ctx, op, &item).await;

    if let Err(err) = &result
        && err.http == Some(StatusCode::FORBIDDEN)
        && op.is_remote_change()
        && is_in_shared_directory(&ctx.cfg, &snapshot(&item).path)
    {
        let message = err.message.clone();
        return handle_shared_403(&ctx, &item, message).await;
    }

    finish_leaf_result(&ctx, &item, result).await
}

async fn execute(
    ctx: &LeafCtx,
    op: LeafOp,
    item: &SharedItem,
) -> Result<SyncStatus, LeafError> {
    match op {
        LeafOp::Ignore => run_ignore(item),
        LeafOp::LocalRemove => run_local_remove(ctx, item).await,
        LeafOp::RemoteDelete => run_remote_delete(ctx, item).await,
        LeafOp::LocalMkdir { delete_existing } => run_local_mkdir(ctx, item, delete_existing).await,
        LeafOp::RemoteMkdir { delete_existing } => {
            run_remote_mkdir(ctx, item, delete_existing).await
        }
        LeafOp::Download {
            delete_existing_folder,
        } => run_download(ctx, item, delete_existing_folder).await,
        LeafOp::Upload {
            ng,
            delete_existing,
        } => run_upload(ctx, item, ng, delete_existing).await,
        LeafOp::RemoteMove => run_remote_move(ctx, item).await,
        LeafOp::LocalRename => run_local_rename(ctx, item).await,
    }
}

async fn finish_leaf_result(
    ctx: &LeafCtx,
    item: &SharedItem,
    result: Result<SyncStatus, LeafError>,
) -> SyncStatus {
    match result {
        Ok(status) => finish_item(ctx, item, status, None).await,
        Err(err) => {
            if err.may_blacklist {
                item.lock()
                    .expect("item mutex poisoned")
                    .error_may_be_blacklisted = true;
            }
            finish_item(ctx, item, err.status, Some(err.message)).await
        }
    }
}

/// The completion policy every finished item passes through: restoration
/// rewrite, abort softening, blacklist bookkeeping, completion event.
pub(crate) async fn finish_item(
    ctx: &LeafCtx,
    item: &SharedItem,
    status: SyncStatus,
    error: Option<String>,
) -> SyncStatus {
    let mut status = status;
    {
        let mut locked = item.lock().expect("item mutex poisoned");
        if locked.is_restoration {
            match status {
                SyncStatus::Success | SyncStatus::Conflict => status = SyncStatus::Restoration,
                _ => {
                    if let Some(message) = &error {
                        locked.error_string = if locked.error_string.is_empty() {
                            format!("Restoration failed: {message}")
                        } else {
                            format!("{}; Restoration failed: {message}", locked.error_string)
                        };
                    }
                }
            }
        } else if locked.error_string.is_empty()
            && let Some(message) = &error
        {
            locked.error_string = message.clone();
        }
    }

    if ctx.abort_requested.load(Ordering::Relaxed)
        && matches!(status, SyncStatus::NormalError | SyncStatus::FatalError)
    {
        // an abort request is ongoing, soften the failure
        status = SyncStatus::SoftError;
    }

    match status {
        SyncStatus::SoftError | SyncStatus::NormalError | SyncStatus::FatalError => {
            let (may_blacklist, has_entry) = {
                let locked = item.lock().expect("item mutex poisoned");
                (locked.error_may_be_blacklisted, locked.has_blacklist_entry)
            };
            // normal errors are blacklisted aggressively, others only on
            // explicit request
            if (status == SyncStatus::NormalError || may_blacklist)
                && blacklist_check(ctx, item, status).await
                && has_entry
            {
                // the item was, and continues to be, blacklisted: don't
                // re-alert the user every sync
                status = SyncStatus::FileIgnored;
                let mut locked = item.lock().expect("item mutex poisoned");
                locked.error_string = format!("Continue blacklisting: {}", locked.error_string);
            }
        }
        SyncStatus::Success | SyncStatus::Restoration => {
            let (has_entry, path, original) = {
                let locked = item.lock().expect("item mutex poisoned");
                (
                    locked.has_blacklist_entry,
                    locked.path.clone(),
                    locked.original().to_string(),
                )
            };
            if has_entry {
                let _ = ctx.journal.wipe_blacklist_entry(&path).await;
                if original != path {
                    let _ = ctx.journal.wipe_blacklist_entry(&original).await;
                }
            }
        }
        SyncStatus::Conflict | SyncStatus::FileIgnored | SyncStatus::NoStatus => {}
    }

    let completed = {
        let mut locked = item.lock().expect("item mutex poisoned");
        locked.status = status;
        locked.clone()
    };
    let _ = ctx.events.send(SyncEvent::ItemCompleted(completed));
    status
}

/// Updates the blacklist row for a failed item. Returns whether the error
/// should be suppressed.
async fn blacklist_check(ctx: &LeafCtx, item: &SharedItem, status: SyncStatus) -> bool {
    let snap = snapshot(item);
    let old = match ctx.journal.blacklist_entry(&snap.path).await {
        Ok(entry) => entry,
        Err(_) => return false,
    };
    match BlacklistRecord::update(old.as_ref(), &snap, status, now_unix()) {
        Some(new_entry) => {
            let suppress = new_entry.ignore_duration > 0;
            let _ = ctx.journal.update_blacklist_entry(&new_entry).await;
            suppress
        }
        None => {
            if old.is_some() {
                let _ = ctx.journal.wipe_blacklist_entry(&snap.path).await;
            }
            false
        }
    }
}

/// A 403 on a change inside a shared directory: the server took the write
/// back, so recover the server state locally and report a soft error.
async fn handle_shared_403(ctx: &LeafCtx, item: &SharedItem, message: String) -> SyncStatus {
    let snap = snapshot(item);
    debug!(path = %snap.path, "change rejected inside a shared directory, restoring");

    let mut restore = snap.clone();
    restore.status = SyncStatus::NoStatus;
    restore.error_string.clear();
    restore.is_restoration = true;
    restore.direction = crate::item::SyncDirection::Down;

    let restore_status = if !snap.is_directory {
        match snap.instruction {
            SyncInstruction::New | SyncInstruction::TypeChange => {
                // don't try to recover pushing new files
                return finish_item(ctx, item, SyncStatus::NormalError, Some(message)).await;
            }
            SyncInstruction::Sync => {
                // modified locally, keep both versions
                restore.instruction = SyncInstruction::Conflict;
                // the server modtime is unknown at this point
                restore.modtime = now_unix();
            }
            _ => {
                // the file was removed or renamed, recover the old one
                restore.instruction = SyncInstruction::Sync;
            }
        }
        let restore = shared(restore);
        let raw = run_download(ctx, &restore, false).await;
        finish_leaf_result(ctx, &restore, raw).await
    } else {
        // Directories are harder to recover. Re-create the directory and let
        // the next sync recover the files.
        restore.instruction = SyncInstruction::New;
        let restore = shared(restore);
        let raw = run_local_mkdir(ctx, &restore, false).await;
        let _ = ctx.journal.avoid_renames_on_next_sync(&snap.path).await;
        ctx.another_sync_needed.store(true, Ordering::Relaxed);
        finish_leaf_result(ctx, &restore, raw).await
    };

    match restore_status {
        SyncStatus::Success | SyncStatus::Conflict | SyncStatus::Restoration => {
            finish_item(ctx, item, SyncStatus::SoftError, Some(message)).await
        }
        other => {
            finish_item(
                ctx,
                item,
                other,
                Some(format!(
                    "A file or folder was removed from a read only share, but restoring failed: {message}"
                )),
            )
            .await
        }
    }
}

// ---- leaf executors ----------------------------------------------------

fn run_ignore(item: &SharedItem) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    Ok(if snap.status == SyncStatus::NoStatus {
        SyncStatus::FileIgnored
    } else {
        snap.status
    })
}

async fn run_local_remove(ctx: &LeafCtx, item: &SharedItem) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    let target = paths::local_path_for(&ctx.local_dir, &snap.path)?;
    let result = if snap.is_directory {
        ctx.local.remove_dir_all(&target).await
    } else {
        ctx.local.remove_file(&target).await
    };
    match result {
        Ok(()) => {}
        // already gone is the goal state
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    ctx.journal
        .delete_file_record(&snap.path, snap.is_directory)
        .await?;
    Ok(SyncStatus::Success)
}

async fn run_remote_delete(ctx: &LeafCtx, item: &SharedItem) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    match ctx.remote.delete(&snap.path).await {
        Ok(()) => {}
        Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => {
            debug!(path = %snap.path, "remote file already absent");
        }
        Err(err) => return Err(err.into()),
    }
    ctx.journal
        .delete_file_record(&snap.path, snap.is_directory)
        .await?;
    Ok(SyncStatus::Success)
}

async fn run_local_mkdir(
    ctx: &LeafCtx,
    item: &SharedItem,
    delete_existing: bool,
) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    let target = paths::local_path_for(&ctx.local_dir, &snap.path)?;

    if ctx.local.is_case_preserving() && ctx.local.has_case_clash(&target) {
        return Err(LeafError::normal(format!(
            "Folder {} clashes with an existing name on this filesystem",
            snap.path
        )));
    }
    if delete_existing
        && let Ok(meta) = ctx.local.metadata(&target).await
        && meta.is_file()
    {
        ctx.local.remove_file(&target).await?;
    }
    ctx.local.mkdir(&target).await?;
    // the journal row is written by the owning directory job
    Ok(SyncStatus::Success)
}

async fn run_remote_mkdir(
    ctx: &LeafCtx,
    item: &SharedItem,
    delete_existing: bool,
) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    if delete_existing {
        match ctx.remote.delete(&snap.path).await {
            Ok(()) => {}
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => {}
            Err(err) => return Err(err.into()),
        }
    }
    match ctx.remote.mkcol(&snap.path).await {
        Ok(info) => apply_remote_info(item, &info),
        Err(err) if err.status() == Some(StatusCode::METHOD_NOT_ALLOWED) => {
            // the collection already exists, adopt its metadata
            if let Ok(info) = ctx.remote.stat(&snap.path).await {
                apply_remote_info(item, &info);
            }
        }
        Err(err) => return Err(err.into()),
    }
    Ok(SyncStatus::Success)
}

async fn run_remote_move(ctx: &LeafCtx, item: &SharedItem) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    let to = snap.destination().to_string();
    if to != snap.path {
        let info = ctx.remote.move_item(&snap.path, &to).await?;
        apply_remote_info(item, &info);
    }
    ctx.journal.delete_file_record(&snap.path, false).await?;
    let mut moved = snapshot(item);
    moved.path = to;
    ctx.journal
        .set_file_record(&FileRecord::from_item(&moved))
        .await?;
    Ok(SyncStatus::Success)
}

async fn run_local_rename(ctx: &LeafCtx, item: &SharedItem) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    let to_rel = snap.destination().to_string();
    let from = paths::local_path_for(&ctx.local_dir, &snap.path)?;
    let to = paths::local_path_for(&ctx.local_dir, &to_rel)?;

    // renaming an entry to another case of itself is not a clash
    let case_rename_of_self = from.parent() == to.parent()
        && from
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            == to.file_name().map(|n| n.to_string_lossy().to_lowercase());
    if !case_rename_of_self && ctx.local.is_case_preserving() && ctx.local.has_case_clash(&to) {
        return Err(LeafError::normal(format!(
            "File {} can not be renamed to {} because of a local file name clash",
            snap.path, to_rel
        )));
    }

    ctx.local.rename(&from, &to).await?;
    ctx.journal.delete_file_record(&snap.path, false).await?;
    let mut moved = snapshot(item);
    moved.path = to_rel;
    ctx.journal
        .set_file_record(&FileRecord::from_item(&moved))
        .await?;
    Ok(SyncStatus::Success)
}

async fn run_download(
    ctx: &LeafCtx,
    item: &SharedItem,
    delete_existing_folder: bool,
) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    let target = paths::local_path_for(&ctx.local_dir, &snap.path)?;

    // pick up a resumable partial file when its etag still matches
    let mut tmp_rel = String::new();
    let mut offset = 0u64;
    let mut error_count = 0u32;
    if let Some(info) = ctx.journal.get_download_info(&snap.path).await? {
        let tmp_abs = paths::local_path_for(&ctx.local_dir, &info.tmp_file)?;
        if info.error_count > MAX_RESUME_ERRORS {
            debug!(path = %snap.path, "discarding partial file after repeated failures");
            let _ = ctx.local.remove_file(&tmp_abs).await;
            ctx.journal.set_download_info(&snap.path, None).await?;
        } else if info.etag == snap.etag {
            if let Ok(meta) = ctx.local.metadata(&tmp_abs).await {
                offset = meta.len();
                tmp_rel = info.tmp_file.clone();
                error_count = info.error_count;
            }
        } else {
            let _ = ctx.local.remove_file(&tmp_abs).await;
        }
    }
    if tmp_rel.is_empty() {
        tmp_rel = paths::download_tmp_name(&snap.path);
        offset = 0;
    }

    ctx.journal
        .set_download_info(
            &snap.path,
            Some(&DownloadInfo {
                tmp_file: tmp_rel.clone(),
                etag: snap.etag.clone(),
                error_count: error_count + 1,
            }),
        )
        .await?;

    let tmp_abs = paths::local_path_for(&ctx.local_dir, &tmp_rel)?;
    if let Some(parent) = tmp_abs.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&tmp_abs)
        .await?;
    if offset == 0 {
        file.set_len(0).await?;
    }

    let body = ctx.remote.get(&snap.path, offset).await?;
    let expected = body.content_length;
    let mut stream = body.stream;
    let mut received = offset;
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                // the resume row stays, the next sync continues from here
                return Err(LeafError::soft("Sync was aborted"));
            }
            chunk = stream.next() => match chunk {
                None => break,
                Some(Ok(data)) => {
                    file.write_all(&data).await?;
                    received += data.len() as u64;
                    let _ = ctx.events.send(SyncEvent::Progress {
                        item: snap.clone(),
                        bytes: received,
                    });
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = expected {
        let got = received - offset;
        if got < expected {
            return Err(LeafError::soft(format!(
                "The download stream ended early ({got} of {expected} bytes)"
            )));
        }
        if got > expected {
            let _ = ctx.local.remove_file(&tmp_abs).await;
            let _ = ctx.journal.set_download_info(&snap.path, None).await;
            return Err(LeafError::soft(
                "The server sent more data than advertised".to_string(),
            ));
        }
    }

    if delete_existing_folder
        && let Ok(meta) = ctx.local.metadata(&target).await
        && meta.is_dir()
    {
        ctx.local.remove_dir_all(&target).await?;
    }

    let mut conflict = false;
    if snap.instruction == SyncInstruction::Conflict
        && let Ok(meta) = ctx.local.metadata(&target).await
    {
        // keep the local version next to the server copy
        let stamp = modtime_of(&meta).unwrap_or_else(now_unix);
        let conflict_rel = paths::conflict_file_name(&snap.path, stamp);
        let conflict_abs = paths::local_path_for(&ctx.local_dir, &conflict_rel)?;
        ctx.local.rename(&target, &conflict_abs).await?;
        conflict = true;
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // rename within the volume is atomic
    ctx.local.rename(&tmp_abs, &target).await?;
    set_local_modtime(&target, snap.modtime);

    let mut done = snapshot(item);
    if let Ok(meta) = ctx.local.metadata(&target).await {
        done.inode = inode_of(&meta);
        item.lock().expect("item mutex poisoned").inode = done.inode;
    }
    ctx.journal
        .set_file_record(&FileRecord::from_item(&done))
        .await?;
    ctx.journal.set_download_info(&snap.path, None).await?;

    Ok(if conflict {
        SyncStatus::Conflict
    } else {
        SyncStatus::Success
    })
}

async fn run_upload(
    ctx: &LeafCtx,
    item: &SharedItem,
    ng: bool,
    delete_existing: bool,
) -> Result<SyncStatus, LeafError> {
    let snap = snapshot(item);
    let source = paths::local_path_for(&ctx.local_dir, &snap.path)?;
    let meta = ctx.local.metadata(&source).await?;
    let size = meta.len();
    let modtime = modtime_of(&meta).unwrap_or(snap.modtime);

    if size as i64 != snap.size || (snap.modtime != 0 && modtime != snap.modtime) {
        ctx.another_sync_needed.store(true, Ordering::Relaxed);
        return Err(LeafError::soft(
            "Local file changed during sync, it will be handled by the next sync",
        ));
    }

    if delete_existing {
        match ctx.remote.delete(&snap.path).await {
            Ok(()) => {}
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let info = if !ng && size <= ctx.cfg.chunk_size {
        let data = tokio::fs::read(&source).await?;
        let info = ctx
            .remote
            .put(&snap.path, Bytes::from(data), snap.modtime)
            .await?;
        let _ = ctx.events.send(SyncEvent::Progress {
            item: snap.clone(),
            bytes: size,
        });
        info
    } else if ng {
        upload_chunked_ng(ctx, &snap, &source, size).await?
    } else {
        upload_chunked_v1(ctx, &snap, &source, size).await?
    };

    apply_remote_info(item, &info);
    let mut done = snapshot(item);
    done.inode = inode_of(&meta);
    item.lock().expect("item mutex poisoned").inode = done.inode;
    ctx.journal
        .set_file_record(&FileRecord::from_item(&done))
        .await?;
    ctx.journal.set_upload_info(&snap.path, None).await?;
    Ok(SyncStatus::Success)
}

/// Resume point of a chunked upload: (chunks done, transfer id, error count).
async fn upload_resume_state(
    ctx: &LeafCtx,
    snap: &SyncItem,
    size: u64,
) -> Result<(u32, u64, u32), LeafError> {
    if let Some(info) = ctx.journal.get_upload_info(&snap.path).await? {
        if info.size == size as i64 && info.modtime == snap.modtime && info.error_count <= MAX_RESUME_ERRORS
        {
            debug!(path = %snap.path, chunk = info.chunk, "resuming chunked upload");
            return Ok((info.chunk, info.transfer_id, info.error_count));
        }
        // the file changed since the partial upload; start over
        ctx.journal.set_upload_info(&snap.path, None).await?;
    }
    Ok((0, u64::from(rand::random::<u32>()), 0))
}

async fn persist_upload_state(
    ctx: &LeafCtx,
    snap: &SyncItem,
    chunk: u32,
    transfer_id: u64,
    error_count: u32,
    size: u64,
) -> Result<(), LeafError> {
    ctx.journal
        .set_upload_info(
            &snap.path,
            Some(&UploadInfo {
                chunk,
                transfer_id,
                error_count,
                size: size as i64,
                modtime: snap.modtime,
            }),
        )
        .await?;
    Ok(())
}

async fn upload_chunked_v1(
    ctx: &LeafCtx,
    snap: &SyncItem,
    source: &std::path::Path,
    size: u64,
) -> Result<RemoteInfo, LeafError> {
    let chunk_size = ctx.cfg.chunk_size;
    let chunk_count = size.div_ceil(chunk_size) as u32;
    let (done, transfer_id, error_count) = upload_resume_state(ctx, snap, size).await?;
    let done = done.min(chunk_count);

    // the resume row must exist before the first byte leaves the machine
    persist_upload_state(ctx, snap, done, transfer_id, error_count + 1, size).await?;

    let mut file = tokio::fs::File::open(source).await?;
    file.seek(SeekFrom::Start(u64::from(done) * chunk_size))
        .await?;

    let mut final_info = None;
    for index in done..chunk_count {
        if ctx.cancel.is_cancelled() {
            return Err(LeafError::soft("Sync was aborted"));
        }
        let data = read_chunk(&mut file, index, chunk_count, chunk_size, size).await?;
        match ctx
            .remote
            .put_chunk_v1(
                &snap.path,
                transfer_id,
                index,
                chunk_count,
                data,
                snap.modtime,
            )
            .await
        {
            Ok(reply) => final_info = reply,
            Err(err) => {
                let _ =
                    persist_upload_state(ctx, snap, index, transfer_id, error_count + 1, size).await;
                return Err(err.into());
            }
        }
        let sent = (u64::from(index) + 1) * chunk_size;
        let _ = ctx.events.send(SyncEvent::Progress {
            item: snap.clone(),
            bytes: sent.min(size),
        });
        persist_upload_state(ctx, snap, index + 1, transfer_id, error_count, size).await?;
    }

    match final_info {
        Some(info) => Ok(info),
        None => Ok(ctx.remote.stat(&snap.path).await?),
    }
}

async fn upload_chunked_ng(
    ctx: &LeafCtx,
    snap: &SyncItem,
    source: &std::path::Path,
    size: u64,
) -> Result<RemoteInfo, LeafError> {
    let chunk_size = ctx.cfg.chunk_size;
    let chunk_count = size.div_ceil(chunk_size) as u32;
    let (done, transfer_id, error_count) = upload_resume_state(ctx, snap, size).await?;
    let done = done.min(chunk_count);

    if done == 0 {
        ctx.remote
            .create_upload_session(&snap.path, transfer_id)
            .await?;
    }
    persist_upload_state(ctx, snap, done, transfer_id, error_count + 1, size).await?;

    let mut file = tokio::fs::File::open(source).await?;
    file.seek(SeekFrom::Start(u64::from(done) * chunk_size))
        .await?;

    for index in done..chunk_count {
        if ctx.cancel.is_cancelled() {
            return Err(LeafError::soft("Sync was aborted"));
        }
        let data = read_chunk(&mut file, index, chunk_count, chunk_size, size).await?;
        if let Err(err) = ctx
            .remote
            .put_session_chunk(transfer_id, u64::from(index) * chunk_size, data)
            .await
        {
            let _ = persist_upload_state(ctx, snap, index, transfer_id, error_count + 1, size).await;
            return Err(err.into());
        }
        let sent = (u64::from(index) + 1) * chunk_size;
        let _ = ctx.events.send(SyncEvent::Progress {
            item: snap.clone(),
            bytes: sent.min(size),
        });
        persist_upload_state(ctx, snap, index + 1, transfer_id, error_count, size).await?;
    }

    match ctx
        .remote
        .finalize_upload_session(transfer_id, &snap.path, snap.modtime)
        .await?
    {
        UploadOutcome::Done(info) => Ok(info),
        UploadOutcome::Pending(url) => {
            // The server assembles the file asynchronously. Persist the poll
            // handle first: a crash or abort from here on is recovered by the
            // poll cleanup of the next sync.
            ctx.journal
                .set_poll_info(&PollRecord {
                    path: snap.path.clone(),
                    modtime: snap.modtime,
                    poll_url: Some(url.to_string()),
                })
                .await?;
            ctx.journal.commit("set poll info", true).await?;
            poll_until_done(ctx, snap, &url).await
        }
    }
}

async fn poll_until_done(
    ctx: &LeafCtx,
    snap: &SyncItem,
    url: &url::Url,
) -> Result<RemoteInfo, LeafError> {
    let retry = RetryDelay::new(Duration::from_secs(1), Duration::from_secs(30));
    let mut attempt = 0u32;
    loop {
        match ctx.remote.poll(url).await? {
            PollOutcome::Done(info) => {
                ctx.journal
                    .set_poll_info(&PollRecord {
                        path: snap.path.clone(),
                        modtime: snap.modtime,
                        poll_url: None,
                    })
                    .await?;
                return Ok(info);
            }
            PollOutcome::Failed(message) => {
                return Err(LeafError::normal(format!(
                    "Asynchronous upload failed: {message}"
                )));
            }
            PollOutcome::Pending => {
                attempt += 1;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        // the poll row survives for the next sync
                        return Err(LeafError::soft("Sync was aborted"));
                    }
                    _ = tokio::time::sleep(retry.wait_for(attempt)) => {}
                }
            }
        }
    }
}

// ---- small helpers -----------------------------------------------------

fn snapshot(item: &SharedItem) -> SyncItem {
    item.lock().expect("item mutex poisoned").clone()
}

fn apply_remote_info(item: &SharedItem, info: &RemoteInfo) {
    let mut locked = item.lock().expect("item mutex poisoned");
    if info.etag.is_some() {
        locked.etag = info.etag.clone();
    }
    if info.file_id.is_some() {
        locked.file_id = info.file_id.clone();
    }
    if info.remote_perm.is_some() {
        locked.remote_perm = info.remote_perm.clone();
    }
}

async fn read_chunk(
    file: &mut tokio::fs::File,
    index: u32,
    chunk_count: u32,
    chunk_size: u64,
    size: u64,
) -> Result<Bytes, LeafError> {
    let len = if index + 1 == chunk_count {
        size - u64::from(index) * chunk_size
    } else {
        chunk_size
    };
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn set_local_modtime(path: &std::path::Path, modtime: i64) {
    if modtime <= 0 {
        return;
    }
    let mtime = UNIX_EPOCH + Duration::from_secs(modtime as u64);
    if let Ok(file) = std::fs::File::options().write(true).open(path) {
        let _ = file.set_modified(mtime);
    }
}

fn inode_of(meta: &std::fs::Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0
    }
}

fn modtime_of(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
