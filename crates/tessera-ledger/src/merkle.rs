//! Incremental binary Merkle tree.
//!
//! Leaves are `BLAKE3(0x00 || data)`; inner nodes are keyed BLAKE3 under the
//! Merkle inner-node context (see [`tessera_crypto::blake3::merkle_inner`]).
//! When a level has an odd number of nodes, the last node is paired with
//! itself. A tree of one leaf has that leaf as its root; an empty tree has
//! the all-zero root.
//!
//! Appending a leaf recomputes only the nodes on its path to the root, so the
//! stored levels always equal a full rebuild over the same leaves.

use tessera_crypto::blake3;
use tessera_types::ledger::ProofStep;
use tessera_types::Hash;

use crate::{LedgerError, Result};

/// Root of the empty tree.
pub const EMPTY_ROOT: Hash = [0u8; 32];

/// Append-only Merkle tree over leaf hashes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MerkleTree {
    /// `levels[0]` holds the leaves; the last level holds the root.
    levels: Vec<Vec<Hash>>,
}

/// Point-in-time copy of a tree, detached from further appends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleSnapshot {
    pub leaves: Vec<Hash>,
    /// Inner levels, lowest first. Empty for trees of zero or one leaf.
    pub levels: Vec<Vec<Hash>>,
    pub root: Hash,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from existing leaf hashes.
    pub fn from_leaves(leaves: &[Hash]) -> Self {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.push(*leaf);
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leaves(&self) -> &[Hash] {
        self.levels.first().map_or(&[], Vec::as_slice)
    }

    /// Append a leaf hash, returning its index.
    pub fn push(&mut self, leaf: Hash) -> usize {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);
        let index = self.levels[0].len() - 1;

        let mut node = index;
        let mut level = 0;
        while self.levels[level].len() > 1 {
            let parent = node / 2;
            let nodes = &self.levels[level];
            let left = nodes[2 * parent];
            let right = nodes.get(2 * parent + 1).copied().unwrap_or(left);
            let hash = blake3::merkle_inner(&left, &right);

            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            let above = &mut self.levels[level + 1];
            if parent == above.len() {
                above.push(hash);
            } else {
                above[parent] = hash;
            }
            node = parent;
            level += 1;
        }
        index
    }

    pub fn root(&self) -> Hash {
        match self.levels.last() {
            Some(top) if !top.is_empty() => top[0],
            _ => EMPTY_ROOT,
        }
    }

    /// Root of the tree formed by the first `tree_size` leaves.
    pub fn root_at(&self, tree_size: usize) -> Result<Hash> {
        if tree_size > self.len() {
            return Err(LedgerError::InvalidTreeSize {
                requested: tree_size as u64,
                available: self.len() as u64,
            });
        }
        if tree_size == self.len() {
            return Ok(self.root());
        }
        Ok(compute_root(&self.leaves()[..tree_size]))
    }

    /// Inclusion proof for leaf `index`, ordered from leaf to root.
    pub fn get_proof(&self, index: usize) -> Result<Vec<ProofStep>> {
        if index >= self.len() {
            return Err(LedgerError::EntryNotFound(index as u64));
        }
        let mut proof = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut node = index;
        for (level, nodes) in self.levels.iter().enumerate() {
            if nodes.len() <= 1 {
                break;
            }
            let sibling = if node % 2 == 1 {
                node - 1
            } else if node + 1 < nodes.len() {
                node + 1
            } else {
                node
            };
            proof.push(ProofStep {
                sibling_hash: nodes[sibling],
                is_left_sibling: node % 2 == 1,
                level: level as u32,
            });
            node /= 2;
        }
        Ok(proof)
    }

    /// Fold `proof` over `leaf` and compare with `root` in constant time.
    pub fn verify_proof(leaf: &Hash, proof: &[ProofStep], root: &Hash) -> bool {
        let mut current = *leaf;
        for (expected_level, step) in proof.iter().enumerate() {
            if step.level as usize != expected_level {
                return false;
            }
            current = if step.is_left_sibling {
                blake3::merkle_inner(&step.sibling_hash, &current)
            } else {
                blake3::merkle_inner(&current, &step.sibling_hash)
            };
        }
        blake3::digest_eq(&current, root)
    }

    pub fn snapshot(&self) -> MerkleSnapshot {
        MerkleSnapshot {
            leaves: self.leaves().to_vec(),
            levels: self.levels.iter().skip(1).cloned().collect(),
            root: self.root(),
        }
    }
}

impl MerkleSnapshot {
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn root(&self) -> Hash {
        self.root
    }
}

/// Full rebuild of the root over `leaves`.
pub fn compute_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return EMPTY_ROOT;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| blake3::merkle_inner(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash> {
        (0..n).map(|i| blake3::merkle_leaf(&[i])).collect()
    }

    #[test]
    fn test_empty_and_single() {
        let mut tree = MerkleTree::new();
        assert_eq!(tree.root(), EMPTY_ROOT);
        let leaf = blake3::merkle_leaf(b"only");
        tree.push(leaf);
        assert_eq!(tree.root(), leaf);
        assert!(tree.get_proof(0).expect("proof").is_empty());
        assert!(MerkleTree::verify_proof(&leaf, &[], &tree.root()));
    }

    #[test]
    fn test_incremental_matches_rebuild() {
        let all = leaves(17);
        let mut tree = MerkleTree::new();
        for (i, leaf) in all.iter().enumerate() {
            tree.push(*leaf);
            assert_eq!(tree.root(), compute_root(&all[..=i]), "size {}", i + 1);
        }
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let l = leaves(3);
        let left = blake3::merkle_inner(&l[0], &l[1]);
        let right = blake3::merkle_inner(&l[2], &l[2]);
        assert_eq!(
            MerkleTree::from_leaves(&l).root(),
            blake3::merkle_inner(&left, &right)
        );
    }

    #[test]
    fn test_every_proof_verifies() {
        for n in 1..=9u8 {
            let l = leaves(n);
            let tree = MerkleTree::from_leaves(&l);
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.get_proof(i).expect("proof");
                assert!(
                    MerkleTree::verify_proof(leaf, &proof, &tree.root()),
                    "n={n} i={i}"
                );
            }
        }
    }

    #[test]
    fn test_proof_rejects_wrong_leaf_or_root() {
        let l = leaves(5);
        let tree = MerkleTree::from_leaves(&l);
        let proof = tree.get_proof(2).expect("proof");
        assert!(!MerkleTree::verify_proof(&l[3], &proof, &tree.root()));
        assert!(!MerkleTree::verify_proof(&l[2], &proof, &[0xFF; 32]));

        let mut bent = proof.clone();
        bent[0].is_left_sibling = !bent[0].is_left_sibling;
        assert!(!MerkleTree::verify_proof(&l[2], &bent, &tree.root()));
    }

    #[test]
    fn test_altered_leaf_changes_root() {
        let mut l = leaves(8);
        let root = MerkleTree::from_leaves(&l).root();
        l[5] = blake3::merkle_leaf(b"altered");
        assert_ne!(MerkleTree::from_leaves(&l).root(), root);
    }

    #[test]
    fn test_root_at_history() {
        let l = leaves(10);
        let tree = MerkleTree::from_leaves(&l);
        for size in 0..=10 {
            assert_eq!(tree.root_at(size).expect("root"), compute_root(&l[..size]));
        }
        assert!(matches!(
            tree.root_at(11),
            Err(LedgerError::InvalidTreeSize { requested: 11, available: 10 })
        ));
    }

    #[test]
    fn test_proof_out_of_range() {
        let tree = MerkleTree::from_leaves(&leaves(2));
        assert!(matches!(tree.get_proof(2), Err(LedgerError::EntryNotFound(2))));
    }

    #[test]
    fn test_snapshot_detached() {
        let mut tree = MerkleTree::from_leaves(&leaves(4));
        let snapshot = tree.snapshot();
        tree.push(blake3::merkle_leaf(b"later"));
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.root(), compute_root(&leaves(4)));
        assert_eq!(snapshot.levels.len(), 2);
        assert_ne!(snapshot.root(), tree.root());
    }
}
