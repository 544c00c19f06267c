//! The history container lists every retained commit.

use tessera_common::{BlockId, CommitId, ContainerId, NodeConfig, Result};
use tessera_node::{BTree, NodeLayout, NodeSource, NodeStore};
use tessera_packed::{IndexKind, SubstreamDescriptor, SubstreamKind, SubstreamParams};

use crate::descriptor::CommitInfo;

const KEYS: usize = 0;
const VALUES: usize = 1;

const FLAG_PERSISTENT: u64 = 1;
const FLAG_CONSISTENCY_POINT: u64 = 2;

/// One history entry. Root ids are plain values here; the references
/// belong to the commit descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HistoryRecord {
    pub info: CommitInfo,
    pub directory_root: BlockId,
    /// Unknown (invalid) for the commit that writes the record; the next
    /// commit fills it in.
    pub history_root: BlockId,
}

impl HistoryRecord {
    fn values(&self) -> Vec<u64> {
        let mut flags = 0;
        if self.info.persistent {
            flags |= FLAG_PERSISTENT;
        }
        if self.info.consistency_point {
            flags |= FLAG_CONSISTENCY_POINT;
        }
        vec![
            self.info.sequence,
            flags,
            self.info.parent.map_or(0, |id| id.0),
            self.directory_root.as_u64(),
            self.history_root.as_u64(),
        ]
    }

    fn from_row(key: u64, values: &[u64]) -> Self {
        Self {
            info: CommitInfo {
                id: CommitId(key),
                parent: (values[2] != 0).then_some(CommitId(values[2])),
                sequence: values[0],
                persistent: values[1] & FLAG_PERSISTENT != 0,
                consistency_point: values[1] & FLAG_CONSISTENCY_POINT != 0,
            },
            directory_root: BlockId(values[3]),
            history_root: BlockId(values[4]),
        }
    }
}

pub(crate) fn layout() -> Result<NodeLayout> {
    NodeLayout::new(vec![
        SubstreamDescriptor::new(
            SubstreamKind::FseTree,
            0,
            SubstreamParams::columns(1).with_index(IndexKind::Max),
        ),
        SubstreamDescriptor::vle_array(0, 5),
    ])
}

#[derive(Debug, Clone)]
pub(crate) struct History {
    tree: BTree,
}

impl History {
    pub(crate) fn create<S: NodeStore + ?Sized>(store: &mut S, config: NodeConfig) -> Result<Self> {
        let tree = BTree::create(store, layout()?, config, ContainerId::HISTORY)?;
        Ok(Self { tree })
    }

    pub(crate) fn open<S: NodeSource + ?Sized>(
        store: &S,
        config: NodeConfig,
        root: BlockId,
    ) -> Result<Self> {
        let tree = BTree::open(store, layout()?, config, ContainerId::HISTORY, root)?;
        Ok(Self { tree })
    }

    pub(crate) fn root(&self) -> BlockId {
        self.tree.root()
    }

    #[cfg(test)]
    pub(crate) fn tree(&self) -> &BTree {
        &self.tree
    }

    fn position<S: NodeSource + ?Sized>(&self, store: &S, id: CommitId) -> Result<Option<usize>> {
        let Some(pos) = self.tree.find_by_key(store, KEYS, 0, id.0)? else {
            return Ok(None);
        };
        let key = self.tree.get(store, KEYS, pos)?[0];
        Ok((key == id.0).then_some(pos))
    }

    /// Records in commit id order.
    pub(crate) fn records<S: NodeSource + ?Sized>(&self, store: &S) -> Result<Vec<HistoryRecord>> {
        let keys = self.tree.scan(store, KEYS)?;
        let values = self.tree.scan(store, VALUES)?;
        Ok(keys
            .iter()
            .zip(&values)
            .map(|(key, row)| HistoryRecord::from_row(key[0], row))
            .collect())
    }

    #[cfg(test)]
    pub(crate) fn get<S: NodeSource + ?Sized>(
        &self,
        store: &S,
        id: CommitId,
    ) -> Result<Option<HistoryRecord>> {
        let Some(pos) = self.position(store, id)? else {
            return Ok(None);
        };
        let row = self.tree.get(store, VALUES, pos)?;
        Ok(Some(HistoryRecord::from_row(id.0, &row)))
    }

    /// Inserts a record or rewrites the one with the same commit id.
    /// Unchanged records are left alone.
    pub(crate) fn upsert<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        record: &HistoryRecord,
    ) -> Result<()> {
        let id = record.info.id;
        let values = record.values();
        if let Some(pos) = self.position(store, id)? {
            if self.tree.get(store, VALUES, pos)? != values {
                self.tree.update(store, VALUES, pos, &values)?;
            }
            return Ok(());
        }
        let at = match self.tree.find_by_key(store, KEYS, 0, id.0)? {
            Some(pos) => pos,
            None => self.tree.size(store, KEYS)?,
        };
        self.tree.insert(store, 0, at, &[vec![id.0], values])
    }

    /// Removes the record of `id`; returns whether it existed.
    pub(crate) fn remove<S: NodeStore + ?Sized>(&mut self, store: &mut S, id: CommitId) -> Result<bool> {
        let Some(pos) = self.position(store, id)? else {
            return Ok(false);
        };
        self.tree.remove(store, 0, pos, pos + 1)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_node::MemoryNodeStore;

    fn record(id: u64, parent: Option<u64>) -> HistoryRecord {
        HistoryRecord {
            info: CommitInfo {
                id: CommitId(id),
                parent: parent.map(CommitId),
                sequence: id * 10,
                persistent: id % 2 == 0,
                consistency_point: id == 1,
            },
            directory_root: BlockId(id * 4),
            history_root: BlockId::INVALID,
        }
    }

    fn config() -> NodeConfig {
        NodeConfig {
            block_size: 512,
            merge_threshold_percent: 50,
        }
    }

    #[test]
    fn test_upsert_and_records() {
        let mut store = MemoryNodeStore::new(512);
        let mut history = History::create(&mut store, config()).unwrap();
        for id in [3u64, 1, 2] {
            history.upsert(&mut store, &record(id, id.checked_sub(1).filter(|&p| p > 0))).unwrap();
        }
        let records = history.records(&store).unwrap();
        assert_eq!(
            records.iter().map(|r| r.info.id.0).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(records[0], record(1, None));
        assert_eq!(records[2].info.parent, Some(CommitId(2)));
        assert_eq!(records[2].history_root, BlockId::INVALID);

        let mut changed = record(3, None);
        changed.history_root = BlockId(77);
        history.upsert(&mut store, &changed).unwrap();
        assert_eq!(history.get(&store, CommitId(3)).unwrap(), Some(changed));
        assert_eq!(history.records(&store).unwrap().len(), 3);
    }

    #[test]
    fn test_remove() {
        let mut store = MemoryNodeStore::new(512);
        let mut history = History::create(&mut store, config()).unwrap();
        for id in 1..=40u64 {
            history.upsert(&mut store, &record(id, Some(id - 1))).unwrap();
        }
        assert!(history.remove(&mut store, CommitId(7)).unwrap());
        assert!(!history.remove(&mut store, CommitId(7)).unwrap());
        assert_eq!(history.get(&store, CommitId(7)).unwrap(), None);
        assert_eq!(history.records(&store).unwrap().len(), 39);
        history.tree().check(&store).unwrap();
        let reopened = History::open(&store, config(), history.root()).unwrap();
        assert_eq!(reopened.get(&store, CommitId(8)).unwrap(), Some(record(8, Some(7))));
    }
}
