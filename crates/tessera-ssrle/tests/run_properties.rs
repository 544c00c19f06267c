//! Property tests for SSRLE runs and the segment codec.

use proptest::prelude::*;
use tessera_ssrle::{
    RunTraits, SEGMENT_UNITS, SsrleRun, compactify_runs, read_runs, total_length,
    write_segments_to,
};

fn arb_traits() -> impl Strategy<Value = RunTraits> {
    prop_oneof![Just(1usize), Just(2), Just(4), Just(8)].prop_map(|bps| RunTraits::new(bps).unwrap())
}

fn arb_run_for(traits: RunTraits) -> impl Strategy<Value = SsrleRun> {
    let max_pl = traits.max_pattern_length().min(8);
    let max_symbol = 1u64 << traits.bps();
    (prop::collection::vec(0..max_symbol, 1..=max_pl), 1u64..40).prop_filter_map(
        "run must fit a code word",
        move |(symbols, run_length)| {
            let literal = SsrleRun::literal(&symbols, &traits).ok()?;
            traits
                .is_fit(literal.pattern_length(), run_length)
                .then(|| SsrleRun::new(literal.pattern_length(), literal.pattern(), run_length))
        },
    )
}

fn arb_run() -> impl Strategy<Value = (RunTraits, SsrleRun)> {
    arb_traits().prop_flat_map(|t| (Just(t), arb_run_for(t)))
}

fn arb_run_pair() -> impl Strategy<Value = (RunTraits, SsrleRun, SsrleRun)> {
    arb_traits().prop_flat_map(|t| (Just(t), arb_run_for(t), arb_run_for(t)))
}

fn expand_all(runs: &[SsrleRun], traits: &RunTraits) -> Vec<u64> {
    runs.iter().flat_map(|r| r.expand(traits)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn split_then_concatenate_is_identity((t, run) in arb_run(), cut in 0u64..=1000) {
        let full = run.full_run_length();
        let at = full * cut / 1000;
        let split = run.split(at, &t).unwrap();

        prop_assert_eq!(total_length(&split.left), at);
        prop_assert_eq!(total_length(&split.right), full - at);
        for piece in split.left.iter().chain(split.right.iter()) {
            prop_assert!(t.is_fit(piece.pattern_length(), piece.run_length()));
        }

        let mut joined = split.left.clone();
        joined.extend(split.right.iter().copied());
        let rebuilt = compactify_runs(&joined, &t);
        prop_assert_eq!(total_length(&rebuilt), full);
        prop_assert_eq!(expand_all(&rebuilt, &t), run.expand(&t));
    }

    #[test]
    fn insert_places_symbols_at_position((t, run, other) in arb_run_pair(), cut in 0u64..=1000) {
        let full = run.full_run_length();
        let at = full * cut / 1000;

        let result = run.insert(&other, at, &t).unwrap();

        let mut expected = run.expand(&t);
        let inserted = other.expand(&t);
        expected.splice(at as usize..at as usize, inserted);

        prop_assert_eq!(total_length(&result), full + other.full_run_length());
        prop_assert_eq!(expand_all(&result, &t), expected);
    }

    #[test]
    fn select_inverts_rank((t, run) in arb_run(), symbol_seed in any::<u64>(), pos_seed in any::<u64>()) {
        let full = run.full_run_length();
        let symbol = symbol_seed & t.symbol_mask();
        let p = pos_seed % (full + 1);
        let symbols = run.expand(&t);

        let rank = run.rank_eq(p, symbol, &t).unwrap();
        let expected_rank = symbols[..p as usize].iter().filter(|&&s| s == symbol).count() as u64;
        prop_assert_eq!(rank, expected_rank);

        if rank > 0 {
            let last = symbols[..p as usize].iter().rposition(|&s| s == symbol).unwrap() as u64;
            prop_assert_eq!(run.select_fw_eq(rank - 1, symbol, &t), Some(last));
        }
        prop_assert_eq!(run.select_fw_eq(run.full_rank_eq(symbol, &t), symbol, &t), None);
    }

    #[test]
    fn merge_keeps_concatenation((t, a, b) in arb_run_pair()) {
        let mut merged = a;
        if merged.merge(&b, &t) {
            let mut expected = a.expand(&t);
            expected.extend(b.expand(&t));
            prop_assert_eq!(merged.expand(&t), expected);
            prop_assert!(t.is_fit(merged.pattern_length(), merged.run_length()));
        } else {
            prop_assert_eq!(merged, a);
        }
    }

    #[test]
    fn merge_with_copy_of_same_pattern((t, a) in arb_run()) {
        let mut merged = a;
        let fits = t.is_fit(a.pattern_length(), a.run_length() * 2);
        prop_assert_eq!(merged.merge(&a, &t) || !fits, true);
        if fits {
            prop_assert_eq!(merged.run_length(), a.run_length() * 2);
        }
    }

    #[test]
    fn segments_preserve_runs((t, runs) in arb_traits().prop_flat_map(|t| (Just(t), prop::collection::vec(arb_run_for(t), 0..80)))) {
        let units = write_segments_to(&runs, &t).unwrap();
        prop_assert_eq!(units.len() % SEGMENT_UNITS, 0);
        prop_assert_eq!(read_runs(&units, &t).unwrap(), runs);
    }
}
