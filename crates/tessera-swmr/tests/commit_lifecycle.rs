//! Commit, snapshot, eviction and recovery scenarios against whole stores.

use tempfile::tempdir;
use tessera_common::{
    BlockId, CommitId, ContainerId, PoolConfig, StoreConfig, TesseraError,
};
use tessera_node::NodeLayout;
use tessera_packed::{IndexKind, SubstreamDescriptor, SubstreamKind, SubstreamParams};
use tessera_swmr::{AllocationStatus, CommitState, ConsistencyPoint, SwmrStore};

const ITEMS: ContainerId = ContainerId(16);
const OTHER: ContainerId = ContainerId(17);

fn config() -> StoreConfig {
    StoreConfig {
        basic_block_size: 512,
        node_block_size: 512,
        initial_arena_blocks: 256,
        arena_growth_blocks: 256,
        max_arena_blocks: 8192,
        metadata_slot_size: 64 * 1024,
        pool: PoolConfig {
            levels: 4,
            level0_capacity: 16,
            upper_capacity: 2,
            level0_reserved: 4,
        },
        fsync_enabled: false,
        populate_retries: 4,
        ..StoreConfig::default()
    }
}

fn layout() -> NodeLayout {
    NodeLayout::new(vec![
        SubstreamDescriptor::new(
            SubstreamKind::FseTree,
            0,
            SubstreamParams::columns(1).with_index(IndexKind::Max),
        ),
        SubstreamDescriptor::vle_array(0, 1),
    ])
    .unwrap()
}

/// Commits a container holding `count` sorted keys with value `key * 3`.
fn commit_items(store: &SwmrStore, id: ContainerId, count: u64, cp: ConsistencyPoint) -> CommitId {
    let mut commit = store.begin().unwrap();
    {
        let mut items = commit.create_container(id, layout()).unwrap();
        for key in 0..count {
            items
                .insert(0, key as usize, &[vec![key * 10], vec![key * 3]])
                .unwrap();
        }
        items.check().unwrap();
    }
    commit.commit(cp).unwrap()
}

fn keys(store: &SwmrStore, commit: CommitId, id: ContainerId) -> Vec<u64> {
    let snapshot = store.snapshot(commit).unwrap();
    let items = snapshot.container(id, layout()).unwrap();
    items.check().unwrap();
    items.scan(0).unwrap().into_iter().map(|row| row[0]).collect()
}

#[test]
fn test_new_store_has_initial_commit() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    assert_eq!(store.head_id().unwrap(), CommitId(1));
    let commits = store.commits();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].consistency_point);
    assert_eq!(commits[0].parent, None);
    assert!(store.pool_level0_total() >= 1);
    assert!(store.head().unwrap().containers().unwrap().is_empty());
    store.check_refcounters().unwrap();
}

#[test]
fn test_commit_and_read_back() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let id = commit_items(&store, ITEMS, 300, ConsistencyPoint::No);
    assert_eq!(id, CommitId(2));
    assert_eq!(store.head_id().unwrap(), id);

    let snapshot = store.head().unwrap();
    assert_eq!(snapshot.containers().unwrap(), vec![ITEMS]);
    snapshot.check().unwrap();
    let items = snapshot.container(ITEMS, layout()).unwrap();
    assert_eq!(items.size(0).unwrap(), 300);
    assert_eq!(items.get(1, 120).unwrap(), vec![360]);
    assert_eq!(items.find_by_key(0, 0, 1005).unwrap(), Some(101));
    assert_eq!(items.prefix_sum(1, 3).unwrap()[0], 3);
    assert_eq!(snapshot.info().parent, Some(CommitId(1)));
    drop(snapshot);
    store.check_refcounters().unwrap();
}

#[test]
fn test_edits_do_not_touch_older_commits() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let first = commit_items(&store, ITEMS, 200, ConsistencyPoint::Yes);
    store.set_persistent(first, true).unwrap();

    let mut commit = store.begin().unwrap();
    {
        let mut items = commit.container_mut(ITEMS, layout()).unwrap();
        items.remove(0, 10, 50).unwrap();
        items.update(1, 0, &[99]).unwrap();
        items.insert(0, 0, &[vec![0], vec![1]]).unwrap();
    }
    let second = commit.commit(ConsistencyPoint::No).unwrap();

    let old = keys(&store, first, ITEMS);
    assert_eq!(old, (0..200).map(|k| k * 10).collect::<Vec<_>>());
    let new = keys(&store, second, ITEMS);
    assert_eq!(new.len(), 161);
    assert_eq!(new[..3], [0, 0, 10]);
    let head = store.head().unwrap();
    assert_eq!(head.container(ITEMS, layout()).unwrap().get(1, 1).unwrap(), vec![99]);
    drop(head);
    store.check_refcounters().unwrap();
}

#[test]
fn test_rollback_discards_changes() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    commit_items(&store, ITEMS, 50, ConsistencyPoint::No);
    let before = store.pool_level0_total();

    let mut commit = store.begin().unwrap();
    commit.drop_container(ITEMS).unwrap();
    commit
        .create_container(OTHER, layout())
        .unwrap()
        .insert(0, 0, &[vec![5], vec![6]])
        .unwrap();
    commit.rollback().unwrap();
    assert_eq!(commit.state(), CommitState::RolledBack);
    assert!(matches!(
        commit.commit(ConsistencyPoint::No),
        Err(TesseraError::CommitClosed(3))
    ));
    drop(commit);

    assert_eq!(store.head().unwrap().containers().unwrap(), vec![ITEMS]);
    assert_eq!(store.pool_level0_total(), before);
    store.check_refcounters().unwrap();

    // The abandoned commit id is reused.
    assert_eq!(commit_items(&store, OTHER, 5, ConsistencyPoint::No), CommitId(3));
    store.check_refcounters().unwrap();
}

#[test]
fn test_dropping_an_open_commit_rolls_back() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    {
        let mut commit = store.begin().unwrap();
        commit.create_container(ITEMS, layout()).unwrap();
    }
    assert!(store.head().unwrap().containers().unwrap().is_empty());
    assert!(store.begin().is_ok());
}

#[test]
fn test_single_writer() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let first = store.begin().unwrap();
    let err = store.begin().unwrap_err();
    assert!(matches!(err, TesseraError::WriterActive));
    assert_eq!(err.to_string(), "Another writable commit is active");
    drop(first);
    let mut second = store.begin().unwrap();
    second.commit(ConsistencyPoint::No).unwrap();
    assert!(store.begin().is_ok());
}

#[test]
fn test_prepared_commit_is_closed() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let mut commit = store.begin().unwrap();
    commit.create_container(ITEMS, layout()).unwrap();
    commit.prepare(ConsistencyPoint::No).unwrap();
    assert_eq!(commit.state(), CommitState::Prepared);

    let err = commit.create_container(OTHER, layout()).err().unwrap();
    assert_eq!(err.to_string(), "Commit 2 is already closed");
    assert!(matches!(
        commit.allocate_one_or_throw(0),
        Err(TesseraError::CommitClosed(2))
    ));
    assert!(matches!(
        commit.prepare(ConsistencyPoint::No),
        Err(TesseraError::CommitClosed(2))
    ));

    assert_eq!(commit.commit(ConsistencyPoint::No).unwrap(), CommitId(2));
    assert_eq!(commit.state(), CommitState::Committed);
    assert!(commit.rollback().is_err());
    assert_eq!(store.head().unwrap().containers().unwrap(), vec![ITEMS]);
}

#[test]
fn test_failed_prepare_closes_the_commit() {
    let config = StoreConfig {
        metadata_slot_size: 6 * 1024,
        ..config()
    };
    let store = SwmrStore::create_in_memory(config).unwrap();
    commit_items(&store, OTHER, 10, ConsistencyPoint::No);
    let head = store.head_id().unwrap();

    let mut commit = store.begin().unwrap();
    {
        let mut items = commit.create_container(ITEMS, layout()).unwrap();
        for key in 0..20000u64 {
            items
                .insert(0, key as usize, &[vec![key << 20], vec![key]])
                .unwrap();
        }
    }
    let err = commit.prepare(ConsistencyPoint::No).unwrap_err();
    assert!(err.is_out_of_space(), "{err}");
    assert_eq!(commit.state(), CommitState::RolledBack);

    // Retrying neither re-runs the half-applied prepare nor commits.
    assert!(matches!(
        commit.prepare(ConsistencyPoint::No),
        Err(TesseraError::CommitClosed(_))
    ));
    assert!(matches!(
        commit.commit(ConsistencyPoint::No),
        Err(TesseraError::CommitClosed(_))
    ));
    drop(commit);

    assert_eq!(store.head_id().unwrap(), head);
    assert_eq!(keys(&store, head, OTHER).len(), 10);
    store.check_refcounters().unwrap();
    let next = commit_items(&store, ITEMS, 5, ConsistencyPoint::No);
    assert_eq!(keys(&store, next, ITEMS), vec![0, 10, 20, 30, 40]);
    store.check_refcounters().unwrap();
}

#[test]
fn test_container_errors() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    commit_items(&store, ITEMS, 3, ConsistencyPoint::No);
    let mut commit = store.begin().unwrap();
    assert!(matches!(
        commit.create_container(ITEMS, layout()).err(),
        Some(TesseraError::ContainerAlreadyExists(16))
    ));
    assert!(matches!(
        commit.drop_container(OTHER),
        Err(TesseraError::ContainerNotFound(17))
    ));
    assert!(matches!(
        commit.create_container(ContainerId::DIRECTORY, layout()).err(),
        Some(TesseraError::InvalidParameter { .. })
    ));
    let other_layout = NodeLayout::new(vec![SubstreamDescriptor::fse_tree(0, 2)]).unwrap();
    assert!(commit.container(ITEMS, other_layout).is_err());
}

#[test]
fn test_unreferenced_commits_are_evicted() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let kept = commit_items(&store, ITEMS, 20, ConsistencyPoint::No);
    store.set_persistent(kept, true).unwrap();
    commit_items(&store, OTHER, 20, ConsistencyPoint::No);
    for _ in 0..2 {
        let mut commit = store.begin().unwrap();
        commit.commit(ConsistencyPoint::No).unwrap();
    }

    let ids: Vec<CommitId> = store.commits().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![CommitId(2), CommitId(4), CommitId(5)]);
    assert!(matches!(
        store.snapshot(CommitId(1)),
        Err(TesseraError::CommitNotFound(1))
    ));
    // Commit 3 was evicted, so commit 4 now descends from commit 2.
    assert_eq!(
        store.snapshot(CommitId(4)).unwrap().info().parent,
        Some(CommitId(2))
    );
    store.check_refcounters().unwrap();

    store.remove_commit(kept).unwrap();
    assert!(store.remove_commit(CommitId(5)).is_err());
    let mut commit = store.begin().unwrap();
    commit.commit(ConsistencyPoint::No).unwrap();
    let ids: Vec<CommitId> = store.commits().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![CommitId(5), CommitId(6)]);
    assert_eq!(store.commits()[0].parent, None);
    store.check_refcounters().unwrap();
}

#[test]
fn test_open_snapshot_blocks_eviction() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let first = commit_items(&store, ITEMS, 100, ConsistencyPoint::No);
    let reader = store.snapshot(first).unwrap();

    let mut commit = store.begin().unwrap();
    commit.drop_container(ITEMS).unwrap();
    commit.commit(ConsistencyPoint::No).unwrap();
    let mut commit = store.begin().unwrap();
    commit.commit(ConsistencyPoint::No).unwrap();

    assert!(store.commits().iter().any(|c| c.id == first));
    let items = reader.container(ITEMS, layout()).unwrap();
    assert_eq!(items.size(0).unwrap(), 100);
    drop(items);
    drop(reader);

    let mut commit = store.begin().unwrap();
    commit.commit(ConsistencyPoint::No).unwrap();
    assert!(!store.commits().iter().any(|c| c.id == first));
    store.check_refcounters().unwrap();
}

#[test]
fn test_freed_blocks_wait_for_consistency_point() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let filled = commit_items(&store, ITEMS, 300, ConsistencyPoint::Yes);
    let root: BlockId = store
        .snapshot(filled)
        .unwrap()
        .container(ITEMS, layout())
        .unwrap()
        .root();

    // The drop leaves the nodes to the filled commit.
    let mut commit = store.begin().unwrap();
    commit.drop_container(ITEMS).unwrap();
    commit.commit(ConsistencyPoint::No).unwrap();
    assert_eq!(store.allocation_status(root).unwrap(), AllocationStatus::Allocated);

    // Evicting the filled commit frees the nodes, but the last consistency
    // point still lists them.
    let mut commit = store.begin().unwrap();
    commit.commit(ConsistencyPoint::No).unwrap();
    assert!(!store.commits().iter().any(|c| c.id == filled));
    assert_eq!(store.allocation_status(root).unwrap(), AllocationStatus::Allocated);
    assert!(!store.cp_postponed().is_empty());

    let mut commit = store.begin().unwrap();
    commit.commit(ConsistencyPoint::Yes).unwrap();
    assert_eq!(store.allocation_status(root).unwrap(), AllocationStatus::Free);
    assert!(store.cp_postponed().is_empty());
    store.check_refcounters().unwrap();
}

#[test]
fn test_reopen_recovers_head_and_history() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..config()
    };
    let store = SwmrStore::create(config.clone()).unwrap();
    let store_id = store.store_id();
    let first = commit_items(&store, ITEMS, 150, ConsistencyPoint::Yes);
    let second = commit_items(&store, OTHER, 40, ConsistencyPoint::No);
    store.set_persistent(second, true).unwrap();
    let head = commit_items(&store, ContainerId(18), 10, ConsistencyPoint::No);
    drop(store);

    let store = SwmrStore::open(config).unwrap();
    assert_eq!(store.store_id(), store_id);
    assert_eq!(store.head_id().unwrap(), head);
    let ids: Vec<CommitId> = store.commits().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![second, head]);
    assert!(store.commits()[0].persistent);
    assert_eq!(keys(&store, head, ITEMS).len(), 150);
    assert_eq!(keys(&store, second, OTHER).len(), 40);
    assert!(store.snapshot(first).is_err());
    store.check_refcounters().unwrap();

    let next = commit_items(&store, ContainerId(19), 5, ConsistencyPoint::Yes);
    assert_eq!(next, head.next());
    store.check_refcounters().unwrap();
}

#[test]
fn test_arena_grows_on_demand() {
    let store = SwmrStore::create_in_memory(config()).unwrap();
    let mut commit = store.begin().unwrap();
    {
        let mut items = commit.create_container(ITEMS, layout()).unwrap();
        for key in 0..4000u64 {
            items
                .insert(0, key as usize, &[vec![key << 20], vec![key]])
                .unwrap();
        }
    }
    commit.commit(ConsistencyPoint::Yes).unwrap();
    assert_eq!(keys(&store, CommitId(2), ITEMS).len(), 4000);
    store.check_refcounters().unwrap();
}

#[test]
fn test_config_round_trips_through_json() {
    let config = config();
    let json = serde_json::to_string(&config).unwrap();
    let parsed: StoreConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.pool, config.pool);
    assert_eq!(parsed.metadata_slot_size, config.metadata_slot_size);
    assert!(!parsed.fsync_enabled);
    assert!(SwmrStore::create_in_memory(parsed).is_ok());
}
