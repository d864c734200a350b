//! In-memory header MMR that can produce roots and proofs at any past size

use alloy::primitives::B256;

use crate::hash::merge_nodes;
use crate::mmr::{
    bag_peaks, get_peaks, leaf_index_to_pos, mmr_size_for_leaves, parent_offset,
    pos_height_in_tree, sibling_offset, MmrProof,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryMmr {
    nodes: Vec<B256>,
    leaves: u64,
}

impl MemoryMmr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaves
    }

    /// Append a leaf and every parent it completes. Returns the leaf position.
    pub fn push(&mut self, leaf: B256) -> u64 {
        let leaf_pos = self.nodes.len() as u64;
        self.nodes.push(leaf);

        let mut pos = leaf_pos;
        let mut height = 0u32;
        while pos_height_in_tree(pos + 1) > height {
            pos += 1;
            let left_pos = pos - parent_offset(height);
            let right_pos = left_pos + sibling_offset(height);
            let parent = merge_nodes(
                &self.nodes[left_pos as usize],
                &self.nodes[right_pos as usize],
            );
            self.nodes.push(parent);
            height += 1;
        }

        self.leaves += 1;
        leaf_pos
    }

    /// Root of the MMR as it stood when it held `leaf_count` leaves
    pub fn root_at(&self, leaf_count: u64) -> Option<B256> {
        if leaf_count == 0 || leaf_count > self.leaves {
            return None;
        }
        let peaks = self.peaks_at(mmr_size_for_leaves(leaf_count));
        bag_peaks(&peaks)
    }

    /// Proof for `leaf_index` against the root at `leaf_count` leaves
    pub fn proof_at(&self, leaf_index: u64, leaf_count: u64) -> Option<MmrProof> {
        if leaf_index >= leaf_count || leaf_count > self.leaves {
            return None;
        }
        let mmr_size = mmr_size_for_leaves(leaf_count);

        let mut siblings = Vec::new();
        let mut pos = leaf_index_to_pos(leaf_index);
        let mut height = 0u32;
        loop {
            let (sibling_pos, parent_pos) = if pos_height_in_tree(pos + 1) > height {
                (pos - sibling_offset(height), pos + 1)
            } else {
                (pos + sibling_offset(height), pos + parent_offset(height))
            };
            if sibling_pos >= mmr_size {
                break;
            }
            siblings.push(self.nodes[sibling_pos as usize]);
            pos = parent_pos;
            height += 1;
        }

        Some(MmrProof {
            mmr_size,
            peaks: self.peaks_at(mmr_size),
            siblings,
        })
    }

    fn peaks_at(&self, mmr_size: u64) -> Vec<B256> {
        get_peaks(mmr_size)
            .into_iter()
            .map(|p| self.nodes[p as usize])
            .collect()
    }
}
