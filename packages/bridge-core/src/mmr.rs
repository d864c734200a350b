//! Merkle Mountain Range position arithmetic and inclusion-proof checks
//!
//! The source chain appends one leaf per block header, so leaf index `n` is
//! block `n` and an MMR with `k` leaves covers blocks `0..k`. Positions are
//! 0-based node indices in insertion order.

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

use crate::error::ProofError;
use crate::hash::{bytes32_to_hex, merge_nodes};

/// Inclusion proof for one leaf as served by the chain's MMR RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmrProof {
    pub mmr_size: u64,
    /// Every peak of the MMR, left to right
    pub peaks: Vec<B256>,
    /// Path from the leaf up to the peak that covers it
    pub siblings: Vec<B256>,
}

/// Largest leaf count the position arithmetic supports. Every position and
/// height stays clear of `u64` overflow below it.
pub const MAX_LEAVES: u64 = 1 << 61;

/// MMR size after appending the leaf at `index`
pub fn leaf_index_to_mmr_size(index: u64) -> u64 {
    mmr_size_for_leaves(index + 1)
}

/// Node position of the leaf at `index`
pub fn leaf_index_to_pos(index: u64) -> u64 {
    leaf_index_to_mmr_size(index) - (index + 1).trailing_zeros() as u64 - 1
}

/// MMR size holding exactly `leaf_count` leaves
pub fn mmr_size_for_leaves(leaf_count: u64) -> u64 {
    2 * leaf_count - leaf_count.count_ones() as u64
}

/// [`mmr_size_for_leaves`] for untrusted counts; `None` above [`MAX_LEAVES`]
pub fn checked_mmr_size_for_leaves(leaf_count: u64) -> Option<u64> {
    (leaf_count <= MAX_LEAVES).then(|| mmr_size_for_leaves(leaf_count))
}

/// Leaf count of an MMR of `mmr_size` nodes, or `None` if no leaf count
/// produces that size
pub fn leaf_count_for_size(mmr_size: u64) -> Option<u64> {
    let count = get_peaks(mmr_size)
        .into_iter()
        .map(|pos| 1u64 << pos_height_in_tree(pos))
        .sum();
    (mmr_size_for_leaves(count) == mmr_size).then_some(count)
}

/// Height of the node at `pos` (leaves are height 0)
pub fn pos_height_in_tree(pos: u64) -> u32 {
    let mut pos = pos + 1;
    while !all_ones(pos) {
        pos = jump_left(pos);
    }
    64 - pos.leading_zeros() - 1
}

pub fn parent_offset(height: u32) -> u64 {
    2 << height
}

pub fn sibling_offset(height: u32) -> u64 {
    (2 << height) - 1
}

fn all_ones(num: u64) -> bool {
    num != 0 && num.count_zeros() == num.leading_zeros()
}

fn jump_left(pos: u64) -> u64 {
    let bit_length = 64 - pos.leading_zeros();
    let most_significant_bit = 1u64 << (bit_length - 1);
    pos - (most_significant_bit - 1)
}

/// Peak positions of an MMR of `mmr_size` nodes, left to right
pub fn get_peaks(mmr_size: u64) -> Vec<u64> {
    if mmr_size == 0 {
        return Vec::new();
    }

    let mut positions = Vec::new();
    let (mut height, mut pos) = left_peak_height_pos(mmr_size);
    positions.push(pos);
    while height > 0 {
        match get_right_peak(height, pos, mmr_size) {
            Some((h, p)) => {
                height = h;
                pos = p;
                positions.push(pos);
            }
            None => break,
        }
    }
    positions
}

fn get_right_peak(mut height: u32, mut pos: u64, mmr_size: u64) -> Option<(u32, u64)> {
    pos += sibling_offset(height);
    while pos > mmr_size - 1 {
        if height == 0 {
            return None;
        }
        pos -= parent_offset(height - 1);
        height -= 1;
    }
    Some((height, pos))
}

fn left_peak_height_pos(mmr_size: u64) -> (u32, u64) {
    let left_pos = |height: u32| (1u64 << (height + 1)) - 2;
    let mut height = 1;
    let mut prev_pos = 0;
    let mut pos = left_pos(height);
    while pos < mmr_size {
        height += 1;
        prev_pos = pos;
        pos = left_pos(height);
    }
    (height - 1, prev_pos)
}

/// Fold peaks right to left into a single root
pub fn bag_peaks(peaks: &[B256]) -> Option<B256> {
    let mut iter = peaks.iter().rev();
    let mut acc = *iter.next()?;
    for left in iter {
        acc = merge_nodes(&acc, left);
    }
    Some(acc)
}

/// Check that `leaf` sits at `leaf_index` of the MMR committed to by `root`.
pub fn verify_leaf(
    root: &B256,
    leaf_index: u64,
    leaf: &B256,
    proof: &MmrProof,
) -> Result<(), ProofError> {
    let mmr_size = proof.mmr_size;
    let max_size = mmr_size_for_leaves(MAX_LEAVES);
    if mmr_size > max_size || leaf_index >= MAX_LEAVES {
        return Err(ProofError::MalformedMmrProof(format!(
            "leaf {} of an MMR of size {} exceeds the supported size {}",
            leaf_index, mmr_size, max_size
        )));
    }
    let leaf_pos = leaf_index_to_pos(leaf_index);
    if leaf_pos >= mmr_size {
        return Err(ProofError::MalformedMmrProof(format!(
            "leaf {} lies outside an MMR of size {}",
            leaf_index, mmr_size
        )));
    }

    let peak_positions = get_peaks(mmr_size);
    if peak_positions.len() != proof.peaks.len() {
        return Err(ProofError::MalformedMmrProof(format!(
            "expected {} peaks for size {}, got {}",
            peak_positions.len(),
            mmr_size,
            proof.peaks.len()
        )));
    }

    // a path can never be taller than the left-most peak
    let max_height = peak_positions
        .first()
        .map(|&p| pos_height_in_tree(p))
        .unwrap_or(0);
    if proof.siblings.len() > max_height as usize {
        return Err(ProofError::MalformedMmrProof(format!(
            "{} siblings exceed the tallest peak height {}",
            proof.siblings.len(),
            max_height
        )));
    }

    let mut pos = leaf_pos;
    let mut height = 0u32;
    let mut hash = *leaf;
    for sibling in &proof.siblings {
        let next = if pos_height_in_tree(pos + 1) > height {
            // right child: parent follows immediately
            hash = merge_nodes(sibling, &hash);
            pos.checked_add(1)
        } else {
            hash = merge_nodes(&hash, sibling);
            pos.checked_add(parent_offset(height))
        };
        pos = next.filter(|&p| p < mmr_size).ok_or_else(|| {
            ProofError::MalformedMmrProof(format!(
                "sibling {} climbs past an MMR of size {}",
                height, mmr_size
            ))
        })?;
        height += 1;
    }

    let peak_index = peak_positions
        .iter()
        .position(|&p| p == pos)
        .ok_or_else(|| {
            ProofError::MalformedMmrProof(format!(
                "{} siblings climb to position {}, which is not a peak",
                proof.siblings.len(),
                pos
            ))
        })?;

    if proof.peaks[peak_index] != hash {
        return Err(ProofError::PeakMismatch {
            peak: bytes32_to_hex(&proof.peaks[peak_index].0),
            position: pos,
        });
    }

    let bagged = bag_peaks(&proof.peaks)
        .ok_or_else(|| ProofError::MalformedMmrProof("no peaks".to_string()))?;
    if bagged != *root {
        return Err(ProofError::RootMismatch {
            expected: bytes32_to_hex(&root.0),
            computed: bytes32_to_hex(&bagged.0),
        });
    }

    Ok(())
}
