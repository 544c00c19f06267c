//! Randomized B-tree operation sequences checked against a vector model,
//! plus copy-on-write sharing between tree versions.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_common::{BlockId, BlockKind, ContainerId, NodeConfig};
use tessera_node::{BTree, LeafNodeSo, MemoryNodeStore, NodeBlock, NodeLayout, NodeStore};
use tessera_packed::{IndexKind, SubstreamDescriptor, SubstreamKind, SubstreamParams};

const BLOCK: usize = 512;

fn config() -> NodeConfig {
    NodeConfig {
        block_size: BLOCK,
        merge_threshold_percent: 50,
    }
}

/// Group 0: sorted keys with a maximum index plus a value column.
/// Group 1: a 2-bit SSRLE symbol sequence.
fn layout() -> NodeLayout {
    NodeLayout::new(vec![
        SubstreamDescriptor::new(
            SubstreamKind::FseTree,
            0,
            SubstreamParams::columns(1).with_index(IndexKind::Max),
        ),
        SubstreamDescriptor::vle_array(0, 1),
        SubstreamDescriptor::ssrle_seq(1, 2),
    ])
    .unwrap()
}

#[derive(Debug, Default)]
struct Model {
    pairs: Vec<(u64, u64)>,
    symbols: Vec<u64>,
}

fn assert_matches(store: &MemoryNodeStore, tree: &BTree, model: &Model) {
    tree.check(store).unwrap();
    assert_eq!(
        tree.sizes(store).unwrap(),
        vec![model.pairs.len(), model.pairs.len(), model.symbols.len()]
    );
    let keys: Vec<u64> = tree.scan(store, 0).unwrap().into_iter().map(|r| r[0]).collect();
    let values: Vec<u64> = tree.scan(store, 1).unwrap().into_iter().map(|r| r[0]).collect();
    let symbols: Vec<u64> = tree.scan(store, 2).unwrap().into_iter().map(|r| r[0]).collect();
    assert_eq!(keys, model.pairs.iter().map(|p| p.0).collect::<Vec<_>>());
    assert_eq!(values, model.pairs.iter().map(|p| p.1).collect::<Vec<_>>());
    assert_eq!(symbols, model.symbols);
}

#[test]
fn test_random_operations_match_model() {
    let mut rng = StdRng::seed_from_u64(0x7e55e7a);
    let mut store = MemoryNodeStore::new(BLOCK);
    let mut tree = BTree::create(&mut store, layout(), config(), ContainerId(16)).unwrap();
    let mut model = Model::default();

    for step in 0..1500 {
        match rng.random_range(0..10) {
            0..=3 => {
                let at = rng.random_range(0..=model.pairs.len());
                let key = rng.random_range(0..1u64 << 40);
                let value = rng.random_range(0..1u64 << 20);
                tree.insert(&mut store, 0, at, &[vec![key], vec![value]]).unwrap();
                model.pairs.insert(at, (key, value));
            }
            4..=6 => {
                let at = rng.random_range(0..=model.symbols.len());
                let run = rng.random_range(1..12);
                let symbol = rng.random_range(0..4u64);
                tree.insert(&mut store, 1, at, &[vec![symbol; run]]).unwrap();
                model.symbols.splice(at..at, std::iter::repeat_n(symbol, run));
            }
            7 if !model.pairs.is_empty() => {
                let start = rng.random_range(0..model.pairs.len());
                let end = (start + rng.random_range(1..40)).min(model.pairs.len());
                tree.remove(&mut store, 0, start, end).unwrap();
                model.pairs.drain(start..end);
            }
            8 if !model.symbols.is_empty() => {
                let start = rng.random_range(0..model.symbols.len());
                let end = (start + rng.random_range(1..40)).min(model.symbols.len());
                tree.remove(&mut store, 1, start, end).unwrap();
                model.symbols.drain(start..end);
            }
            9 if !model.pairs.is_empty() => {
                let pos = rng.random_range(0..model.pairs.len());
                let value = rng.random_range(0..1u64 << 60);
                tree.update(&mut store, 1, pos, &[value]).unwrap();
                model.pairs[pos].1 = value;
            }
            _ => {}
        }
        if step % 100 == 0 {
            assert_matches(&store, &tree, &model);
        }
    }
    assert_matches(&store, &tree, &model);

    for pos in [0, model.pairs.len() / 2, model.pairs.len().saturating_sub(1)] {
        if pos < model.pairs.len() {
            assert_eq!(tree.get(&store, 1, pos).unwrap(), vec![model.pairs[pos].1]);
        }
    }

    tree.release(&mut store).unwrap();
    assert!(store.is_empty());
}

/// Keys in group 0 and variable-length values in group 1, interleaved by
/// a symbols stream.
fn interleaved_layout() -> NodeLayout {
    NodeLayout::with_symbols(
        vec![
            SubstreamDescriptor::fse_tree(0, 1),
            SubstreamDescriptor::vle_array(1, 1),
        ],
        SubstreamKind::SsrleSeq,
    )
    .unwrap()
}

#[test]
fn test_interleaved_streams_match_model() {
    let mut rng = StdRng::seed_from_u64(0x5eb01);
    let mut store = MemoryNodeStore::new(BLOCK);
    let mut tree =
        BTree::create(&mut store, interleaved_layout(), config(), ContainerId(16)).unwrap();
    let mut keys: Vec<u64> = Vec::new();
    let mut values: Vec<u64> = Vec::new();

    let check = |store: &MemoryNodeStore, tree: &BTree, keys: &[u64], values: &[u64]| {
        tree.check(store).unwrap();
        let total = keys.len() + values.len();
        assert_eq!(tree.sizes(store).unwrap(), vec![keys.len(), values.len(), total]);
        let scanned: Vec<u64> = tree.scan(store, 0).unwrap().into_iter().map(|r| r[0]).collect();
        assert_eq!(scanned, keys);
        let scanned: Vec<u64> = tree.scan(store, 1).unwrap().into_iter().map(|r| r[0]).collect();
        assert_eq!(scanned, values);
        let tags = tree.scan(store, 2).unwrap();
        assert_eq!(tags.iter().filter(|r| r[0] == 0).count(), keys.len());
        assert_eq!(tags.iter().filter(|r| r[0] == 1).count(), values.len());
    };

    for step in 0..1200 {
        match rng.random_range(0..8) {
            0..=2 => {
                let at = rng.random_range(0..=keys.len());
                let key = rng.random_range(0..1u64 << 40);
                tree.insert(&mut store, 0, at, &[vec![key]]).unwrap();
                keys.insert(at, key);
            }
            3..=5 => {
                let at = rng.random_range(0..=values.len());
                let count = rng.random_range(1..6);
                let batch: Vec<u64> = (0..count).map(|_| rng.random_range(0..1u64 << 30)).collect();
                tree.insert(&mut store, 1, at, &[batch.clone()]).unwrap();
                values.splice(at..at, batch);
            }
            6 if !keys.is_empty() => {
                let start = rng.random_range(0..keys.len());
                let end = (start + rng.random_range(1..20)).min(keys.len());
                tree.remove(&mut store, 0, start, end).unwrap();
                keys.drain(start..end);
            }
            7 if !values.is_empty() => {
                let start = rng.random_range(0..values.len());
                let end = (start + rng.random_range(1..20)).min(values.len());
                tree.remove(&mut store, 1, start, end).unwrap();
                values.drain(start..end);
            }
            _ => {}
        }
        if step % 100 == 0 {
            check(&store, &tree, &keys, &values);
        }
    }
    check(&store, &tree, &keys, &values);
    assert!(tree.height(&store).unwrap() > 1);

    // The symbols stream is derived and takes no writes of its own.
    assert!(tree.insert(&mut store, 2, 0, &[vec![0]]).is_err());
    assert!(tree.update(&mut store, 2, 0, &[1]).is_err());
    check(&store, &tree, &keys, &values);

    tree.release(&mut store).unwrap();
    assert!(store.is_empty());
}

#[test]
fn test_key_search_over_sorted_keys() {
    let mut store = MemoryNodeStore::new(BLOCK);
    let mut tree = BTree::create(&mut store, layout(), config(), ContainerId(16)).unwrap();
    for key in 0..500u64 {
        tree.insert(&mut store, 0, key as usize, &[vec![key * 3], vec![key]]).unwrap();
    }
    for key in [0u64, 1, 2, 3, 299, 1497] {
        let expected = key.div_ceil(3) as usize;
        assert_eq!(tree.find_by_key(&store, 0, 0, key).unwrap(), Some(expected));
    }
    assert_eq!(tree.find_by_key(&store, 0, 0, 1498).unwrap(), None);
    assert_eq!(tree.prefix_sum(&store, 0, 500).unwrap(), vec![500, 1497]);
}

#[test]
fn test_versions_share_unchanged_nodes() {
    let mut store = MemoryNodeStore::new(BLOCK);
    let mut tree = BTree::create(&mut store, layout(), config(), ContainerId(16)).unwrap();
    for key in 0..300u64 {
        tree.insert(&mut store, 0, key as usize, &[vec![key], vec![key]]).unwrap();
    }
    let before = store.len();

    // Keep the current version alive while editing a copy of it.
    let old = tree.clone();
    store.ref_block(old.root()).unwrap();
    tree.update(&mut store, 1, 299, &[7]).unwrap();

    // Only the path down to the last leaf is copied.
    let copied = store.len() - before;
    assert_eq!(copied, tree.height(&store).unwrap());
    assert_eq!(old.get(&store, 1, 299).unwrap(), vec![299]);
    assert_eq!(tree.get(&store, 1, 299).unwrap(), vec![7]);

    tree.remove(&mut store, 0, 0, 150).unwrap();
    assert_eq!(old.size(&store, 0).unwrap(), 300);
    assert_eq!(tree.size(&store, 0).unwrap(), 150);
    old.check(&store).unwrap();
    tree.check(&store).unwrap();

    old.release(&mut store).unwrap();
    tree.check(&store).unwrap();
    tree.release(&mut store).unwrap();
    assert!(store.is_empty());
}

fn leaf(layout: &NodeLayout) -> NodeBlock {
    NodeBlock::new(BlockId(1), BlockKind::Leaf, 0, ContainerId(16), 256, layout).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A prepare that does not fit leaves the node byte-identical.
    #[test]
    fn failed_prepare_leaves_node_untouched(
        batches in prop::collection::vec(
            (0usize..4, prop::collection::vec(0u64..1 << 50, 1..12)),
            1..30,
        )
    ) {
        let layout = layout();
        let mut node = leaf(&layout);
        for (symbol, values) in batches {
            let before = node.to_bytes();
            let mut so = LeafNodeSo::new(&layout, &mut node).unwrap();
            let keys = values.clone();
            let status = so.insert_group(0, 0, &[keys, values]).unwrap();
            if !status.is_success() {
                prop_assert_eq!(node.to_bytes(), before);
                continue;
            }

            let before = node.to_bytes();
            let mut so = LeafNodeSo::new(&layout, &mut node).unwrap();
            let symbols = vec![symbol as u64; 5];
            let at = so.size(2).unwrap() / 2;
            if !so.insert_group(1, at, &[symbols]).unwrap().is_success() {
                prop_assert_eq!(node.to_bytes(), before);
            }
        }
    }
}
