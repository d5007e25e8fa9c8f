use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::blacklist::RetryDelay;
use crate::journal::{JournalError, PollRecord, SyncJournal};
use crate::ops::{PollOutcome, RemoteError, RemoteOps};

#[derive(Debug, Error)]
pub enum PollCleanupError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("invalid poll url: {0}")]
    Url(#[from] url::ParseError),
}

/// Finishes asynchronous uploads left over from an interrupted sync: walks
/// the persisted poll rows, drives each to completion and records the result
/// in the journal. A transport failure aborts the walk and leaves the
/// remaining rows for the next run.
pub async fn cleanup_polls(
    remote: &dyn RemoteOps,
    journal: &SyncJournal,
) -> Result<(), PollCleanupError> {
    let retry = RetryDelay::new(Duration::from_secs(1), Duration::from_secs(30));

    for info in journal.get_poll_infos().await? {
        let Some(url) = info.poll_url.as_deref() else {
            continue;
        };
        let url = Url::parse(url)?;
        let Some(mut record) = journal.get_file_record(&info.path).await? else {
            debug!(path = %info.path, "poll entry without a journal record, skipping");
            continue;
        };

        let mut attempt = 0u32;
        loop {
            match remote.poll(&url).await? {
                PollOutcome::Pending => {
                    attempt += 1;
                    tokio::time::sleep(retry.wait_for(attempt)).await;
                }
                PollOutcome::Done(remote_info) => {
                    if remote_info.etag.is_some() {
                        record.etag = remote_info.etag;
                    }
                    if remote_info.file_id.is_some() {
                        record.file_id = remote_info.file_id;
                    }
                    if remote_info.size > 0 {
                        record.size = remote_info.size;
                    }
                    record.modtime = info.modtime;
                    journal.set_file_record(&record).await?;
                    journal
                        .set_poll_info(&PollRecord {
                            path: info.path.clone(),
                            modtime: info.modtime,
                            poll_url: None,
                        })
                        .await?;
                    break;
                }
                PollOutcome::Failed(message) => {
                    warn!(path = %info.path, message, "asynchronous upload failed");
                    journal
                        .set_poll_info(&PollRecord {
                            path: info.path.clone(),
                            modtime: info.modtime,
                            poll_url: None,
                        })
                        .await?;
                    break;
                }
            }
        }
    }
    Ok(())
}
