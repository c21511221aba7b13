//! Storage contracts: the four storage kinds and their engines.
//!
//! Each kind pairs a backend trait (primitive I/O a backend must provide)
//! with an engine struct (policy implemented once, shared by every
//! backend). Backends stay dumb; the merge logic, rollback algorithm, and
//! monotonicity rules live here.

pub mod blob;
pub mod doc;
pub mod history;
pub mod sync;

pub use blob::{BlobBackend, BlobStorage};
pub use doc::{DocBackend, DocStorage};
pub use history::{HistoryBackend, HistoryStorage};
pub use sync::{SyncBackend, SyncStorage};

use serde::{Deserialize, Serialize};

/// Flavor of space a storage serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceType {
    /// Shared, multi-user space.
    Workspace,
    /// Single-user private space.
    Userspace,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Workspace => "workspace",
            SpaceType::Userspace => "userspace",
        }
    }
}

impl std::fmt::Display for SpaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four storage kinds a peer composes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    Doc,
    Blob,
    Sync,
    History,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Doc => "doc",
            StorageKind::Blob => "blob",
            StorageKind::Sync => "sync",
            StorageKind::History => "history",
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the space a storage instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpaceScope {
    pub space_type: SpaceType,
    pub id: String,
}

impl SpaceScope {
    pub fn workspace(id: impl Into<String>) -> Self {
        Self {
            space_type: SpaceType::Workspace,
            id: id.into(),
        }
    }

    pub fn userspace(id: impl Into<String>) -> Self {
        Self {
            space_type: SpaceType::Userspace,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for SpaceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.space_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        assert_eq!(SpaceScope::workspace("w1").to_string(), "workspace:w1");
        assert_eq!(SpaceScope::userspace("u1").to_string(), "userspace:u1");
    }
}
