use std::env;
use std::time::Duration;

const DEFAULT_HARD_MAX_ACTIVE: usize = 6;
const DEFAULT_CHUNK_SIZE: u64 = 10 * 1000 * 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_FREE_SPACE_BYTES: i64 = 250 * 1000 * 1000;
const DEFAULT_CRITICAL_FREE_SPACE_BYTES: i64 = 50 * 1000 * 1000;

/// Immutable per-run configuration. Read from the environment once and passed
/// through the propagator; nothing here is cached in globals.
#[derive(Debug, Clone)]
pub struct PropagateConfig {
    /// Hard cap on concurrently active jobs.
    pub hard_max_active: usize,
    /// Byte threshold above which uploads are chunked, and the chunk size.
    pub chunk_size: u64,
    /// Per-request timeout, consumed by `RemoteOps` implementations.
    pub http_timeout: Duration,
    /// Soft free-space floor for downloads.
    pub free_space_limit: i64,
    /// Critical free-space floor, clamped to `[0, free_space_limit]`.
    pub critical_free_space_limit: i64,
    /// Download bandwidth cap in bytes/s; non-zero disables parallelism.
    pub download_limit: i64,
    /// Upload bandwidth cap in bytes/s; non-zero disables parallelism.
    pub upload_limit: i64,
    /// Whether the server advertises the next-generation chunking scheme.
    pub server_chunking_ng: bool,
    /// Remote folder this sync connection mirrors, for the shared-dir check.
    pub remote_folder: String,
}

impl PropagateConfig {
    pub fn from_env() -> Self {
        let free_space_limit = read_env("DAVMIRROR_FREE_SPACE_BYTES", DEFAULT_FREE_SPACE_BYTES);
        let max_parallel: usize = read_env("DAVMIRROR_MAX_PARALLEL", 0);
        Self {
            hard_max_active: if max_parallel == 0 {
                DEFAULT_HARD_MAX_ACTIVE
            } else {
                max_parallel
            },
            chunk_size: read_env("DAVMIRROR_CHUNK_SIZE", DEFAULT_CHUNK_SIZE).max(1),
            http_timeout: Duration::from_secs(
                read_env("DAVMIRROR_TIMEOUT", DEFAULT_TIMEOUT_SECS).max(1),
            ),
            free_space_limit,
            critical_free_space_limit: read_env(
                "DAVMIRROR_CRITICAL_FREE_SPACE_BYTES",
                DEFAULT_CRITICAL_FREE_SPACE_BYTES,
            )
            .clamp(0, free_space_limit.max(0)),
            download_limit: read_env("DAVMIRROR_DOWNLOAD_LIMIT", 0),
            upload_limit: read_env("DAVMIRROR_UPLOAD_LIMIT", 0),
            server_chunking_ng: false,
            remote_folder: String::new(),
        }
    }

    /// Soft cap: one when a bandwidth limit is in force, half the hard cap
    /// (rounded up) otherwise.
    pub fn max_active_transfers(&self) -> usize {
        if self.download_limit != 0 || self.upload_limit != 0 {
            return 1;
        }
        self.hard_max_active.div_ceil(2)
    }
}

impl Default for PropagateConfig {
    fn default() -> Self {
        Self {
            hard_max_active: DEFAULT_HARD_MAX_ACTIVE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            http_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            free_space_limit: DEFAULT_FREE_SPACE_BYTES,
            critical_free_space_limit: DEFAULT_CRITICAL_FREE_SPACE_BYTES,
            download_limit: 0,
            upload_limit: 0,
            server_chunking_ng: false,
            remote_folder: String::new(),
        }
    }
}

fn read_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_cap_is_half_of_hard_cap() {
        let cfg = PropagateConfig::default();
        assert_eq!(cfg.hard_max_active, 6);
        assert_eq!(cfg.max_active_transfers(), 3);
    }

    #[test]
    fn bandwidth_limit_disables_parallelism() {
        let cfg = PropagateConfig {
            download_limit: 80_000,
            ..PropagateConfig::default()
        };
        assert_eq!(cfg.max_active_transfers(), 1);
    }

    #[test]
    fn critical_limit_never_exceeds_soft_limit() {
        let cfg = PropagateConfig::default();
        assert!(cfg.critical_free_space_limit <= cfg.free_space_limit);
    }
}
