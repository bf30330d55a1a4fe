//! Chain construction: every policy must produce exactly one cycle over its cells.

use memprobe_rs::ProbeError;
use memprobe_rs::buffer::ProbeBuffer;
use memprobe_rs::chain::{self, LinkPolicy, WORD};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

/// Cells of a full lap from the head, asserting the walk closes back on the head.
fn lap(buffer: &mut ProbeBuffer, cell_size: usize, policy: LinkPolicy) -> Vec<usize> {
    let chain = chain::build(buffer, cell_size, policy).unwrap();
    let cells: Vec<usize> = chain.walk().collect();
    let last = *cells.last().unwrap();
    assert_eq!(chain.successor(last), Some(chain.head()), "lap does not close");
    cells
}

fn sorted(mut cells: Vec<usize>) -> Vec<usize> {
    cells.sort_unstable();
    cells
}

#[rstest]
fn single_cycle_covers_every_cell(
    #[values(2, 3, 100, 100_000)] n: usize,
    #[values(
        LinkPolicy::Sequential { stride_cells: 1 },
        LinkPolicy::Sequential { stride_cells: 4 },
        LinkPolicy::Sequential { stride_cells: 7 },
        LinkPolicy::Random { seed: 1 },
        LinkPolicy::Random { seed: 0xDEAD_BEEF }
    )]
    policy: LinkPolicy,
) {
    let mut buffer = ProbeBuffer::allocate(n * 64).unwrap();
    let cells = lap(&mut buffer, 64, policy);
    assert_eq!(cells.len(), n);
    assert_eq!(sorted(cells), (0..n).collect::<Vec<_>>());
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(8)]
#[case(32)]
fn conflict_set_links_first_ways_cells(#[case] ways: usize) {
    let stride = 4096;
    let mut buffer = ProbeBuffer::allocate(32 * stride).unwrap();
    let cells = lap(&mut buffer, stride, LinkPolicy::ConflictSet { ways });
    assert_eq!(sorted(cells), (0..ways).collect::<Vec<_>>());
}

#[rstest]
fn conflict_set_cycle_covers_every_way(#[values(2, 3, 100, 100_000)] ways: usize) {
    let mut buffer = ProbeBuffer::allocate(ways * 64).unwrap();
    let cells = lap(&mut buffer, 64, LinkPolicy::ConflictSet { ways });
    assert_eq!(cells.len(), ways);
    assert_eq!(sorted(cells), (0..ways).collect::<Vec<_>>());
}

/// Full successor map of a freshly built chain, `None` for cells outside it.
fn successor_map(cells: usize, cell_size: usize, policy: LinkPolicy) -> Vec<Option<usize>> {
    let mut buffer = ProbeBuffer::allocate(cells * cell_size).unwrap();
    let chain = chain::build(&mut buffer, cell_size, policy).unwrap();
    (0..cells).map(|cell| chain.successor(cell)).collect()
}

#[rstest]
#[case::sequential(LinkPolicy::Sequential { stride_cells: 4 })]
#[case::conflict_set(LinkPolicy::ConflictSet { ways: 24 })]
#[case::random(LinkPolicy::Random { seed: 99 })]
fn same_parameters_build_the_same_chain(#[case] policy: LinkPolicy) {
    let first = successor_map(1000, 64, policy);
    assert_eq!(first, successor_map(1000, 64, policy));
    assert!(first.iter().filter(|next| next.is_some()).count() >= 24);
}

#[test]
fn every_hop_of_a_coprime_stride_advances_by_the_stride() {
    let n = 1000;
    let mut buffer = ProbeBuffer::allocate(n * WORD).unwrap();
    let chain = chain::build(&mut buffer, WORD, LinkPolicy::Sequential { stride_cells: 3 }).unwrap();
    for i in 0..n {
        assert_eq!(chain.successor(i), Some((i + 3) % n));
    }
}

#[test]
fn fewer_than_two_cells_is_insufficient() {
    let mut buffer = ProbeBuffer::allocate(100).unwrap();
    let err = chain::build(&mut buffer, 64, LinkPolicy::Random { seed: 3 })
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ProbeError::InsufficientCells {
            cells: 1,
            required: 2,
            ..
        }
    ));
}

#[test]
fn same_seed_same_permutation() {
    let walk = |seed| {
        let mut buffer = ProbeBuffer::allocate(4096 * 64).unwrap();
        lap(&mut buffer, 64, LinkPolicy::Random { seed })
    };
    assert_eq!(walk(11), walk(11));
    assert_ne!(walk(11), walk(12));
}

/// A random chain must not degenerate into address order: few hops land on the next cell and
/// the average forward distance is about half the buffer.
#[test]
fn random_chains_do_not_follow_address_order() {
    let n = 4096;
    for seed in 0..20 {
        let mut buffer = ProbeBuffer::allocate(n * 64).unwrap();
        let chain = chain::build(&mut buffer, 64, LinkPolicy::Random { seed }).unwrap();

        let adjacent = (0..n).filter(|&i| chain.successor(i) == Some((i + 1) % n)).count();
        assert!(
            (adjacent as f64) < 0.01 * n as f64,
            "seed {seed}: {adjacent} adjacent hops"
        );

        let mean_offset = (0..n)
            .map(|i| ((chain.successor(i).unwrap() + n - i) % n) as f64)
            .sum::<f64>()
            / n as f64;
        let half = n as f64 / 2.0;
        assert!(
            (mean_offset - half).abs() < 0.1 * half,
            "seed {seed}: mean forward offset {mean_offset}"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sequential_chains_are_single_cycles(n in 2usize..2000, stride in 1usize..300) {
        let mut buffer = ProbeBuffer::allocate(n * WORD).unwrap();
        let cells = lap(&mut buffer, WORD, LinkPolicy::Sequential { stride_cells: stride });
        prop_assert_eq!(sorted(cells), (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn random_chains_are_single_cycles(n in 2usize..2000, seed in any::<u64>()) {
        let mut buffer = ProbeBuffer::allocate(n * WORD).unwrap();
        let cells = lap(&mut buffer, WORD, LinkPolicy::Random { seed });
        prop_assert_eq!(sorted(cells), (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn conflict_sets_are_single_cycles(ways in 1usize..64, extra in 0usize..64) {
        let stride = 64;
        let mut buffer = ProbeBuffer::allocate((ways + extra).max(2) * stride).unwrap();
        let cells = lap(&mut buffer, stride, LinkPolicy::ConflictSet { ways });
        prop_assert_eq!(sorted(cells), (0..ways).collect::<Vec<_>>());
    }
}
