//! In-memory descriptors of retained commits.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tessera_common::{BlockId, CommitId};

/// Public view of a retained commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: CommitId,
    pub parent: Option<CommitId>,
    pub sequence: u64,
    pub persistent: bool,
    pub consistency_point: bool,
}

/// A committed, immutable state of the store.
///
/// The descriptor owns one reference on each of its two roots; the
/// reference is dropped when the commit is evicted.
#[derive(Debug)]
pub struct CommitDescriptor {
    id: CommitId,
    sequence: u64,
    consistency_point: bool,
    directory_root: BlockId,
    history_root: BlockId,
    parent: Mutex<Option<CommitId>>,
    persistent: AtomicBool,
    readers: AtomicUsize,
    evicting: AtomicBool,
}

impl CommitDescriptor {
    pub fn new(
        info: &CommitInfo,
        directory_root: BlockId,
        history_root: BlockId,
    ) -> Self {
        Self {
            id: info.id,
            sequence: info.sequence,
            consistency_point: info.consistency_point,
            directory_root,
            history_root,
            parent: Mutex::new(info.parent),
            persistent: AtomicBool::new(info.persistent),
            readers: AtomicUsize::new(0),
            evicting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> CommitId {
        self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_consistency_point(&self) -> bool {
        self.consistency_point
    }

    pub fn directory_root(&self) -> BlockId {
        self.directory_root
    }

    pub fn history_root(&self) -> BlockId {
        self.history_root
    }

    pub fn parent(&self) -> Option<CommitId> {
        *self.parent.lock()
    }

    pub fn set_parent(&self, parent: Option<CommitId>) {
        *self.parent.lock() = parent;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    /// Number of open snapshots reading this commit.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::Acquire)
    }

    pub(crate) fn set_evicting(&self, evicting: bool) {
        self.evicting.store(evicting, Ordering::Release);
    }

    pub fn info(&self) -> CommitInfo {
        CommitInfo {
            id: self.id,
            parent: self.parent(),
            sequence: self.sequence,
            persistent: self.is_persistent(),
            consistency_point: self.consistency_point,
        }
    }
}

/// Registers a reader on a descriptor for as long as it lives.
#[derive(Debug)]
pub struct ReaderGuard {
    descriptor: Arc<CommitDescriptor>,
}

impl ReaderGuard {
    pub(crate) fn new(descriptor: Arc<CommitDescriptor>) -> Self {
        descriptor.readers.fetch_add(1, Ordering::AcqRel);
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &CommitDescriptor {
        &self.descriptor
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.descriptor.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> CommitInfo {
        CommitInfo {
            id: CommitId(3),
            parent: Some(CommitId(2)),
            sequence: 3,
            persistent: false,
            consistency_point: true,
        }
    }

    #[test]
    fn test_reader_guard_counts() {
        let descriptor = Arc::new(CommitDescriptor::new(&info(), BlockId(1), BlockId(2)));
        let first = ReaderGuard::new(descriptor.clone());
        let second = ReaderGuard::new(descriptor.clone());
        assert_eq!(descriptor.readers(), 2);
        drop(first);
        assert_eq!(second.descriptor().readers(), 1);
        drop(second);
        assert_eq!(descriptor.readers(), 0);
    }

    #[test]
    fn test_mutable_flags() {
        let descriptor = CommitDescriptor::new(&info(), BlockId(1), BlockId(2));
        assert_eq!(descriptor.info(), info());
        descriptor.set_persistent(true);
        descriptor.set_parent(None);
        let changed = descriptor.info();
        assert!(changed.persistent);
        assert_eq!(changed.parent, None);
        assert!(!descriptor.is_evicting());
    }
}
