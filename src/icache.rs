//! Instruction-cache chains.
//!
//! The same chain idea as [`crate::chain`], but the cells are blocks of executable x86-64 code.
//! Each block is a run of `nop`s ending in a `jmp rel32` to its successor block; the block whose
//! successor is the head ends in `ret` instead. Calling the head therefore executes every block
//! once, in chain order, and the front end has to fetch each block before it learns where the
//! next one lives.
use crate::buffer::ProbeBuffer;
use crate::chain::{LinkPolicy, sequential_order, shuffled_order};
use crate::error::{ProbeError, Result};
use crate::timer::Traversal;
use log::debug;
use std::mem;

const NOP: u8 = 0x90;
const RET: u8 = 0xC3;
const JMP_REL32: u8 = 0xE9;
const JMP_LEN: usize = 5;

/// Smallest block that still holds a jump plus padding.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Executable chain of code blocks inside a sealed probe buffer.
pub struct CodeChain {
    buffer: ProbeBuffer,
    block_size: usize,
    blocks: usize,
    head: usize,
}

/// Lay out `code_bytes` of code as `block_size` blocks linked per `policy`.
///
/// Only sequential and random linking make sense for code; a conflict set is rejected.
pub fn build(code_bytes: usize, block_size: usize, policy: LinkPolicy) -> Result<CodeChain> {
    if block_size < MIN_BLOCK_SIZE {
        return Err(ProbeError::invalid(format!(
            "code blocks must be at least {MIN_BLOCK_SIZE} bytes, got {block_size}"
        )));
    }
    if code_bytes > i32::MAX as usize {
        return Err(ProbeError::invalid(
            "code chains are limited to 2 GiB so jumps fit in rel32",
        ));
    }

    let blocks = code_bytes / block_size;
    if blocks < 2 {
        return Err(ProbeError::InsufficientCells {
            size_bytes: code_bytes,
            cell_size: block_size,
            cells: blocks,
            required: 2,
        });
    }

    let order = match policy {
        LinkPolicy::Sequential { stride_cells } if stride_cells > 0 => {
            sequential_order(blocks, stride_cells)
        }
        LinkPolicy::Random { seed } => shuffled_order(blocks, seed),
        other => {
            return Err(ProbeError::invalid(format!(
                "{other:?} cannot link code blocks"
            )));
        }
    };

    let mut buffer = ProbeBuffer::allocate(code_bytes)?;
    let base = buffer.as_mut_ptr();
    // SAFETY: the buffer is writable until sealed and `code_bytes` long
    let code = unsafe { std::slice::from_raw_parts_mut(base, code_bytes) };
    code.fill(NOP);

    for (k, &block) in order.iter().enumerate() {
        let start = block * block_size;
        let tail = start + block_size - JMP_LEN;
        let next = order[(k + 1) % order.len()];
        if k + 1 == order.len() {
            code[tail] = RET;
        } else {
            let target = (next * block_size) as i64;
            let rel = (target - (tail + JMP_LEN) as i64) as i32;
            code[tail] = JMP_REL32;
            code[tail + 1..tail + JMP_LEN].copy_from_slice(&rel.to_le_bytes());
        }
    }

    buffer.seal_executable()?;
    debug!("emitted {blocks} code blocks of {block_size} B with {policy:?}");

    Ok(CodeChain {
        buffer,
        block_size,
        blocks,
        head: order[0],
    })
}

impl CodeChain {
    pub fn len(&self) -> usize {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Run the whole chain once.
    #[inline(never)]
    pub fn call(&self) {
        // SAFETY: the head block starts a straight-line sequence of nops and jumps that stays
        // inside the sealed buffer and ends in `ret`; it touches no registers the C ABI cares
        // about and no stack besides popping its own return address
        unsafe {
            let entry = self.buffer.as_ptr().add(self.head * self.block_size);
            let f: extern "C" fn() = mem::transmute(entry);
            f();
        }
    }
}

impl Traversal for CodeChain {
    fn lap(&self) -> usize {
        self.blocks
    }

    /// Whole calls only, so this rounds `hops` up to a multiple of the block count.
    fn chase(&self, hops: usize) -> usize {
        let calls = hops.div_ceil(self.blocks);
        for _ in 0..calls {
            self.call();
        }
        calls * self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_chain_runs_and_counts_whole_laps() {
        let chain = build(4096, 64, LinkPolicy::Sequential { stride_cells: 1 }).unwrap();
        assert_eq!(chain.len(), 64);
        assert_eq!(chain.chase(100), 128);
        assert_eq!(chain.chase(0), 0);
    }

    #[test]
    fn random_chain_runs() {
        let chain = build(16 * 1024, 64, LinkPolicy::Random { seed: 3 }).unwrap();
        assert_eq!(chain.chase(256), 256);
    }

    #[test]
    fn tiny_code_is_insufficient() {
        let err = build(64, 64, LinkPolicy::Random { seed: 3 }).err().unwrap();
        assert!(matches!(err, ProbeError::InsufficientCells { cells: 1, .. }));
    }

    #[test]
    fn conflict_sets_and_tiny_blocks_are_rejected() {
        let err = build(4096, 64, LinkPolicy::ConflictSet { ways: 4 }).err().unwrap();
        assert!(matches!(err, ProbeError::InvalidConfiguration(_)));
        let err = build(4096, 4, LinkPolicy::Random { seed: 1 }).err().unwrap();
        assert!(matches!(err, ProbeError::InvalidConfiguration(_)));
    }
}
