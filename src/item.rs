use std::sync::{Arc, Mutex};

/// What the reconciler decided should happen to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncInstruction {
    None,
    New,
    Sync,
    Rename,
    Remove,
    Conflict,
    TypeChange,
    Ignore,
    Error,
    UpdateMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NoStatus,
    Success,
    Conflict,
    SoftError,
    NormalError,
    FatalError,
    FileIgnored,
    Restoration,
}

impl SyncStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            SyncStatus::SoftError | SyncStatus::NormalError | SyncStatus::FatalError
        )
    }
}

/// One entry of the reconciled plan. Mutated by its job while it runs,
/// logically frozen once the job has finished.
#[derive(Debug, Clone)]
pub struct SyncItem {
    /// Forward-slash relative path; empty only for the sync root.
    pub path: String,
    /// Prior path when the instruction is a rename; `None` means unchanged.
    pub original_path: Option<String>,
    /// New path when the instruction is a rename.
    pub rename_target: Option<String>,
    pub is_directory: bool,
    pub instruction: SyncInstruction,
    pub direction: SyncDirection,
    pub size: i64,
    /// Seconds since the unix epoch.
    pub modtime: i64,
    pub etag: Option<String>,
    pub file_id: Option<String>,
    pub remote_perm: Option<String>,
    pub inode: u64,
    pub mode: u32,
    pub status: SyncStatus,
    pub error_string: String,
    pub error_may_be_blacklisted: bool,
    pub has_blacklist_entry: bool,
    pub is_restoration: bool,
}

impl SyncItem {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            original_path: None,
            rename_target: None,
            is_directory: false,
            instruction: SyncInstruction::None,
            direction: SyncDirection::None,
            size: 0,
            modtime: 0,
            etag: None,
            file_id: None,
            remote_perm: None,
            inode: 0,
            mode: 0,
            status: SyncStatus::NoStatus,
            error_string: String::new(),
            error_may_be_blacklisted: false,
            has_blacklist_entry: false,
            is_restoration: false,
        }
    }

    /// The path the item will occupy after propagation.
    pub fn destination(&self) -> &str {
        self.rename_target.as_deref().unwrap_or(&self.path)
    }

    /// The path the item occupied before propagation.
    pub fn original(&self) -> &str {
        self.original_path.as_deref().unwrap_or(&self.path)
    }
}

/// Items are shared between the plan, the owning job and emitted events.
pub type SharedItem = Arc<Mutex<SyncItem>>;

pub fn shared(item: SyncItem) -> SharedItem {
    Arc::new(Mutex::new(item))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_prefers_rename_target() {
        let mut item = SyncItem::new("A/x");
        assert_eq!(item.destination(), "A/x");
        item.rename_target = Some("B/x".into());
        assert_eq!(item.destination(), "B/x");
        assert_eq!(item.original(), "A/x");
    }
}
