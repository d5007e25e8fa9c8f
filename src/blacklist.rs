use std::time::Duration;

use rand::Rng;

use crate::item::{SyncItem, SyncStatus};

/// Shortest suppression window after the first blacklistable failure.
const MIN_IGNORE_SECS: i64 = 25;
/// Suppression ceiling.
const MAX_IGNORE_SECS: i64 = 24 * 60 * 60;

/// One row of the journal's error blacklist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistRecord {
    pub path: String,
    pub last_try_etag: Option<String>,
    pub last_try_modtime: i64,
    pub retry_count: u32,
    pub error_string: String,
    pub last_try_time: i64,
    /// Seconds during which repeats of this error are reported as ignored.
    pub ignore_duration: i64,
}

impl BlacklistRecord {
    /// Escalates (or creates) the record for a freshly failed item.
    /// Returns `None` when the failure must not be tracked.
    pub fn update(
        old: Option<&BlacklistRecord>,
        item: &SyncItem,
        status: SyncStatus,
        now: i64,
    ) -> Option<BlacklistRecord> {
        // Soft errors are transient; tracking them would only delay retries.
        if status == SyncStatus::SoftError && !item.error_may_be_blacklisted {
            return None;
        }

        let retry_count = old.map(|entry| entry.retry_count).unwrap_or(0) + 1;
        Some(BlacklistRecord {
            path: item.path.clone(),
            last_try_etag: item.etag.clone(),
            last_try_modtime: item.modtime,
            retry_count,
            error_string: item.error_string.clone(),
            last_try_time: now,
            ignore_duration: suppression_window(retry_count),
        })
    }
}

/// Doubles with every failed retry, from 25 seconds up to a full day.
fn suppression_window(retry_count: u32) -> i64 {
    // twelve doublings of the minimum already exceed the ceiling
    let doublings = retry_count.saturating_sub(1).min(12);
    (MIN_IGNORE_SECS << doublings).min(MAX_IGNORE_SECS)
}

/// Escalating wait between retries of a server-side operation. The window
/// doubles from `floor` up to `ceiling`; the actual wait is drawn from the
/// upper half of the window so concurrent clients spread out without
/// collapsing the back-off.
#[derive(Debug, Clone, Copy)]
pub struct RetryDelay {
    floor_ms: u64,
    ceiling_ms: u64,
}

impl RetryDelay {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor_ms: (floor.as_millis().min(u128::from(u64::MAX)) as u64).max(1),
            ceiling_ms: ceiling.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    pub fn wait_for(&self, attempt: u32) -> Duration {
        self.wait_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn wait_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let scale = 1u64 << attempt.min(20);
        let full = self
            .floor_ms
            .saturating_mul(scale)
            .clamp(self.floor_ms, self.ceiling_ms.max(self.floor_ms));
        Duration::from_millis(rng.gen_range(full / 2..=full))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn failed_item(path: &str) -> SyncItem {
        let mut item = SyncItem::new(path);
        item.etag = Some("e1".into());
        item.modtime = 1_700_000_000;
        item.error_string = "server returned 400".into();
        item
    }

    #[test]
    fn first_failure_opens_the_minimum_window() {
        let item = failed_item("Docs/A.txt");
        let rec = BlacklistRecord::update(None, &item, SyncStatus::NormalError, 99).unwrap();
        assert_eq!(rec.retry_count, 1);
        assert_eq!(rec.last_try_time, 99);
        assert_eq!(rec.ignore_duration, 25);
        assert_eq!(rec.last_try_etag.as_deref(), Some("e1"));
    }

    #[test]
    fn window_doubles_with_each_retry() {
        let item = failed_item("Docs/A.txt");
        let first = BlacklistRecord::update(None, &item, SyncStatus::NormalError, 1).unwrap();
        let second =
            BlacklistRecord::update(Some(&first), &item, SyncStatus::NormalError, 2).unwrap();
        let third =
            BlacklistRecord::update(Some(&second), &item, SyncStatus::NormalError, 3).unwrap();
        assert_eq!(first.ignore_duration, 25);
        assert_eq!(second.ignore_duration, 50);
        assert_eq!(third.ignore_duration, 100);
    }

    #[test]
    fn window_is_capped_at_one_day() {
        let item = failed_item("Docs/A.txt");
        let mut rec = BlacklistRecord::update(None, &item, SyncStatus::NormalError, 1).unwrap();
        for _ in 0..30 {
            rec = BlacklistRecord::update(Some(&rec), &item, SyncStatus::NormalError, 2).unwrap();
        }
        assert_eq!(rec.retry_count, 31);
        assert_eq!(rec.ignore_duration, 24 * 60 * 60);
    }

    #[test]
    fn plain_soft_error_is_not_tracked() {
        let item = failed_item("Docs/A.txt");
        assert!(BlacklistRecord::update(None, &item, SyncStatus::SoftError, 1).is_none());

        let mut flagged = failed_item("Docs/A.txt");
        flagged.error_may_be_blacklisted = true;
        assert!(BlacklistRecord::update(None, &flagged, SyncStatus::SoftError, 1).is_some());
    }

    #[test]
    fn retry_delay_stays_in_the_doubling_window() {
        let delay = RetryDelay::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8 {
            let window = (1_000u64 << attempt).min(30_000);
            let wait = delay.wait_with_rng(attempt, &mut rng);
            assert!(wait >= Duration::from_millis(window / 2));
            assert!(wait <= Duration::from_millis(window));
        }
    }

    #[test]
    fn retry_delay_saturates_at_the_ceiling() {
        let delay = RetryDelay::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);
        let wait = delay.wait_with_rng(40, &mut rng);
        assert!(wait >= Duration::from_secs(15));
        assert!(wait <= Duration::from_secs(30));
    }
}
