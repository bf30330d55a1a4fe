//! Pointer-chasing chains over a [`ProbeBuffer`].
//!
//! A chain partitions the buffer into fixed-size cells and stores, in the first machine word of
//! every participating cell, the address of its successor cell. Links are read and written
//! unaligned, so a conflict set may use any stride of at least one word. Following those addresses from
//! any participating cell visits each of them exactly once before returning to the start. The
//! traversal has to load the next address from memory on every hop, so each access depends on
//! the one before it and its latency can't be hidden by the out-of-order core.
use crate::buffer::ProbeBuffer;
use crate::error::{ProbeError, Result};
use crate::timer::Traversal;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::mem;

/// Bytes occupied by one stored link.
pub const WORD: usize = mem::size_of::<*const u8>();

/// How successor links are laid out across the cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkPolicy {
    /// `successor(i) = (i + stride_cells) mod n`, measures a fixed stride.
    Sequential { stride_cells: usize },
    /// Walks a seeded Fisher-Yates permutation of all cells, defeating stride prefetchers.
    Random { seed: u64 },
    /// Only the first `ways` cells participate; with a cell size equal to the set stride they
    /// all land in the same cache set.
    ConflictSet { ways: usize },
}

/// A single-cycle successor relation written into a buffer.
pub struct Chain<'a> {
    buffer: &'a ProbeBuffer,
    cell_size: usize,
    cells: usize,
    head: usize,
}

/// Partition `buffer` into `cell_size` cells and link them according to `policy`.
pub fn build(buffer: &mut ProbeBuffer, cell_size: usize, policy: LinkPolicy) -> Result<Chain<'_>> {
    if cell_size < WORD {
        return Err(ProbeError::invalid(format!(
            "cell size of {cell_size} bytes cannot hold a {WORD} byte link"
        )));
    }
    // conflict sets take any stride the caller names, other chains keep links word aligned
    let conflict_set = matches!(policy, LinkPolicy::ConflictSet { .. });
    if !conflict_set && cell_size % WORD != 0 {
        return Err(ProbeError::invalid(format!(
            "cell size of {cell_size} bytes must be a multiple of {WORD} bytes"
        )));
    }

    let n = buffer.cells(cell_size);
    if n < 2 {
        return Err(ProbeError::InsufficientCells {
            size_bytes: buffer.len(),
            cell_size,
            cells: n,
            required: 2,
        });
    }

    let order = match policy {
        LinkPolicy::Sequential { stride_cells } => {
            if stride_cells == 0 {
                return Err(ProbeError::invalid("sequential stride must be at least one cell"));
            }
            sequential_order(n, stride_cells)
        }
        LinkPolicy::Random { seed } => shuffled_order(n, seed),
        LinkPolicy::ConflictSet { ways } => {
            if ways == 0 {
                return Err(ProbeError::invalid("conflict set needs at least one way"));
            }
            if ways > n {
                return Err(ProbeError::InsufficientCells {
                    size_bytes: buffer.len(),
                    cell_size,
                    cells: n,
                    required: ways,
                });
            }
            (0..ways).collect()
        }
    };

    link(buffer, cell_size, &order);
    debug!(
        "linked {} of {n} cells ({cell_size} B each) with {policy:?}",
        order.len()
    );

    Ok(Chain {
        buffer,
        cell_size,
        cells: order.len(),
        head: order[0],
    })
}

/// Visit order for a fixed stride.
///
/// When the stride shares a factor with `n` the plain modular walk would close after `n / g`
/// cells, so each residue class is walked in stride order and the classes are chained one after
/// the other. With a coprime stride this is exactly `(i + stride) mod n`.
pub(crate) fn sequential_order(n: usize, stride_cells: usize) -> Vec<usize> {
    let stride = stride_cells % n;
    let classes = gcd(n, stride);
    let lap = n / classes;
    if classes > 1 {
        debug!("stride of {stride_cells} cells over {n} cells splits into {classes} classes");
    }

    let mut order = Vec::with_capacity(n);
    for start in 0..classes {
        let mut cell = start;
        for _ in 0..lap {
            order.push(cell);
            cell = (cell + stride) % n;
        }
    }
    order
}

/// Seeded Fisher-Yates shuffle of `0..n`.
pub(crate) fn shuffled_order(n: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = rng.random_range(0..=i);
        order.swap(i, j);
    }
    order
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Write `order[k] -> order[k + 1]` links, closing the cycle at the end.
fn link(buffer: &mut ProbeBuffer, cell_size: usize, order: &[usize]) {
    let base = buffer.as_mut_ptr();
    for (k, &cell) in order.iter().enumerate() {
        let next = order[(k + 1) % order.len()];
        // SAFETY: every index in `order` is below len / cell_size and cell_size >= WORD, so
        // both addresses and the stored word are inside the buffer
        unsafe {
            let target = base.add(next * cell_size).cast_const();
            base.add(cell * cell_size)
                .cast::<*const u8>()
                .write_unaligned(target);
        }
    }
}

/// Load the link stored at `p`.
///
/// # Safety
/// `p` must point at `WORD` readable bytes.
#[inline(always)]
unsafe fn load_link(p: *const u8) -> *const u8 {
    // SAFETY: upheld by the caller
    unsafe { p.cast::<*const u8>().read_unaligned() }
}

impl Chain<'_> {
    /// Number of participating cells (one lap).
    pub fn len(&self) -> usize {
        self.cells
    }

    pub fn is_empty(&self) -> bool {
        self.cells == 0
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Cell the traversal starts from.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Successor of `cell`, read back from the link stored in the buffer.
    ///
    /// `None` for cells outside the buffer and for cells that take no part in the chain (the
    /// unlinked padding after a conflict set).
    pub fn successor(&self, cell: usize) -> Option<usize> {
        let offset = cell.checked_mul(self.cell_size)?;
        if offset.checked_add(WORD)? > self.buffer.len() {
            return None;
        }
        let base = self.buffer.as_ptr();
        // SAFETY: the link word lies inside the buffer, checked above
        let next = unsafe { load_link(base.add(offset)) } as usize;
        let target = next.checked_sub(base as usize)?;
        if target >= self.buffer.len() || target % self.cell_size != 0 {
            return None;
        }
        Some(target / self.cell_size)
    }

    /// Cells in traversal order starting at the head, one full lap.
    pub fn walk(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(self.head), |&cell| self.successor(cell)).take(self.cells)
    }

    fn head_ptr(&self) -> *const u8 {
        // SAFETY: head is a participating cell inside the buffer
        unsafe { self.buffer.as_ptr().add(self.head * self.cell_size) }
    }
}

impl Traversal for Chain<'_> {
    fn lap(&self) -> usize {
        self.cells
    }

    fn chase(&self, hops: usize) -> usize {
        black_box(chase_from(self.head_ptr(), hops));
        hops
    }
}

/// Follow `hops` stored links starting at `p`.
#[inline(never)]
fn chase_from(mut p: *const u8, hops: usize) -> *const u8 {
    let mut remaining = hops;
    // SAFETY (all loads): `p` always points at a participating cell, whose first word holds the
    // address of another participating cell of the same live buffer
    while remaining >= 8 {
        // Unroll 8x to reduce loop overhead relative to memory latency
        p = unsafe { load_link(p) };
        p = unsafe { load_link(p) };
        p = unsafe { load_link(p) };
        p = unsafe { load_link(p) };
        p = unsafe { load_link(p) };
        p = unsafe { load_link(p) };
        p = unsafe { load_link(p) };
        p = unsafe { load_link(p) };
        remaining -= 8;
    }
    for _ in 0..remaining {
        p = unsafe { load_link(p) };
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_of(cells: usize, cell_size: usize) -> ProbeBuffer {
        ProbeBuffer::allocate(cells * cell_size).unwrap()
    }

    #[test]
    fn coprime_stride_is_plain_modular_walk() {
        let mut buffer = buffer_of(10, 64);
        let chain = build(&mut buffer, 64, LinkPolicy::Sequential { stride_cells: 3 }).unwrap();
        for i in 0..10 {
            assert_eq!(chain.successor(i), Some((i + 3) % 10));
        }
    }

    #[test]
    fn shared_factor_stride_is_stitched_into_one_cycle() {
        let mut buffer = buffer_of(8, 64);
        let chain = build(&mut buffer, 64, LinkPolicy::Sequential { stride_cells: 2 }).unwrap();
        let visited: Vec<usize> = chain.walk().collect();
        assert_eq!(visited, vec![0, 2, 4, 6, 1, 3, 5, 7]);
        assert_eq!(chain.successor(7), Some(0));
    }

    #[test]
    fn conflict_set_links_only_its_ways() {
        let mut buffer = buffer_of(32, 4096);
        let chain = build(&mut buffer, 4096, LinkPolicy::ConflictSet { ways: 5 }).unwrap();
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.walk().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(chain.successor(4), Some(0));
    }

    #[test]
    fn single_way_is_a_self_loop() {
        let mut buffer = buffer_of(4, 128);
        let chain = build(&mut buffer, 128, LinkPolicy::ConflictSet { ways: 1 }).unwrap();
        assert_eq!(chain.successor(0), Some(0));
        assert_eq!(chain.chase(100), 100);
    }

    #[test]
    fn padding_after_a_conflict_set_has_no_successor() {
        let mut buffer = buffer_of(8, 64);
        let chain = build(&mut buffer, 64, LinkPolicy::ConflictSet { ways: 2 }).unwrap();
        assert_eq!(chain.successor(1), Some(0));
        for cell in 2..8 {
            assert_eq!(chain.successor(cell), None);
        }
        assert_eq!(chain.successor(8), None);
        assert_eq!(chain.successor(usize::MAX), None);
    }

    #[test]
    fn conflict_set_accepts_unaligned_strides() {
        let mut buffer = buffer_of(6, 100);
        let chain = build(&mut buffer, 100, LinkPolicy::ConflictSet { ways: 6 }).unwrap();
        assert_eq!(chain.walk().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        let end = chase_from(chain.head_ptr(), 6 * 4);
        assert_eq!(end, chain.head_ptr());

        let err = build(&mut buffer, WORD - 1, LinkPolicy::ConflictSet { ways: 2 })
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::InvalidConfiguration(_)));
    }

    #[test]
    fn one_cell_is_insufficient() {
        let mut buffer = buffer_of(1, 64);
        let err = build(&mut buffer, 64, LinkPolicy::Random { seed: 1 }).err().unwrap();
        assert!(matches!(err, ProbeError::InsufficientCells { cells: 1, .. }));
    }

    #[test]
    fn too_many_ways_is_insufficient() {
        let mut buffer = buffer_of(4, 64);
        let err = build(&mut buffer, 64, LinkPolicy::ConflictSet { ways: 5 }).err().unwrap();
        assert!(matches!(err, ProbeError::InsufficientCells { cells: 4, required: 5, .. }));
    }

    #[test]
    fn misaligned_cells_are_rejected() {
        let mut buffer = buffer_of(4, 64);
        for cell_size in [0, 4, 12] {
            let err = build(&mut buffer, cell_size, LinkPolicy::Sequential { stride_cells: 1 })
                .err()
                .unwrap();
            assert!(matches!(err, ProbeError::InvalidConfiguration(_)));
        }
    }

    #[test]
    fn zero_stride_is_rejected() {
        let mut buffer = buffer_of(4, 64);
        let err = build(&mut buffer, 64, LinkPolicy::Sequential { stride_cells: 0 })
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::InvalidConfiguration(_)));
    }

    #[test]
    fn chase_returns_to_head_after_full_laps() {
        let mut buffer = buffer_of(100, 64);
        let chain = build(&mut buffer, 64, LinkPolicy::Random { seed: 7 }).unwrap();
        let end = chase_from(chain.head_ptr(), 100 * 3);
        assert_eq!(end, chain.head_ptr());
    }

    #[test]
    fn gcd_basics() {
        assert_eq!(gcd(12, 8), 4);
        assert_eq!(gcd(7, 0), 7);
        assert_eq!(gcd(9, 4), 1);
    }
}
