//! Append-only incremental merkle tree for group membership.
//!
//! Nodes live in an arena indexed by `(level, position)`. A node whose subtree
//! is completely filled never changes again, so any historical root (and any
//! path against it) can be rebuilt from the arena plus the zero hashes by
//! recomputing only the single partially filled node per level.

use std::fmt;

use crate::types::Hash32;
use crate::utils::sha3_concat;

const ZERO_LEAF_DOMAIN: &[u8] = b"zkitter/merkle/zero-leaf";

/// Sibling hashes and directions from a leaf up to a root.
///
/// `path_indices[l]` is `0` when the running hash is the left child at level
/// `l`, `1` when it is the right child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerklePath {
    pub leaf: Hash32,
    pub leaf_index: usize,
    pub siblings: Vec<Hash32>,
    pub path_indices: Vec<u8>,
    pub root: Hash32,
}

impl MerklePath {
    /// Folds the leaf with its siblings.
    #[must_use]
    pub fn compute_root(&self) -> Hash32 {
        self.siblings
            .iter()
            .zip(&self.path_indices)
            .fold(self.leaf, |current, (sibling, direction)| {
                if *direction == 0 {
                    hash_pair(&current, sibling)
                } else {
                    hash_pair(sibling, &current)
                }
            })
    }

    /// Whether the path recomputes its recorded root.
    #[must_use]
    pub fn verify(&self) -> bool {
        self.siblings.len() == self.path_indices.len() && self.compute_root() == self.root
    }
}

impl fmt::Display for MerklePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MerklePath:\n  Leaf: {}\n  Root: {}\n  Index: {}\n  Siblings: {}",
            self.leaf,
            self.root,
            self.leaf_index,
            self.siblings.len()
        )
    }
}

fn hash_pair(left: &Hash32, right: &Hash32) -> Hash32 {
    Hash32(sha3_concat(&[left.as_bytes(), right.as_bytes()]))
}

/// Deepest tree a group may be configured with.
pub const MAX_TREE_DEPTH: usize = 32;

/// Fixed-depth, append-only binary merkle tree.
#[derive(Debug, Clone)]
pub struct IncrementalTree {
    depth: usize,
    /// `zeros[l]` is the hash of an empty subtree of height `l`.
    zeros: Vec<Hash32>,
    /// `nodes[l][p]` is the current hash of the node at level `l`, position `p`.
    nodes: Vec<Vec<Hash32>>,
    /// `roots[n]` is the root after the first `n` leaves.
    roots: Vec<Hash32>,
}

impl IncrementalTree {
    /// Creates an empty tree. `domain` separates the empty-leaf value, which
    /// makes every root of this tree distinct from the roots of trees with a
    /// different domain.
    #[must_use]
    pub fn new(depth: usize, domain: &[u8]) -> Self {
        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push(Hash32(sha3_concat(&[ZERO_LEAF_DOMAIN, domain])));
        for level in 0..depth {
            let below = zeros[level];
            zeros.push(hash_pair(&below, &below));
        }
        let empty_root = zeros[depth];
        Self {
            depth,
            zeros,
            nodes: vec![Vec::new(); depth + 1],
            roots: vec![empty_root],
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        1usize << self.depth
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes[0].len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes[0].is_empty()
    }

    #[must_use]
    pub fn leaves(&self) -> &[Hash32] {
        &self.nodes[0]
    }

    #[must_use]
    pub fn root(&self) -> Hash32 {
        self.roots[self.len()]
    }

    /// Every root the tree has had, oldest first, starting with the empty root.
    #[must_use]
    pub fn roots(&self) -> &[Hash32] {
        &self.roots
    }

    /// Root after the first `size` leaves.
    #[must_use]
    pub fn root_at(&self, size: usize) -> Option<Hash32> {
        self.roots.get(size).copied()
    }

    /// Appends a leaf and returns the new root, or `None` if the tree is full.
    ///
    /// Only the nodes on the new leaf's path are recomputed.
    pub fn append(&mut self, leaf: Hash32) -> Option<Hash32> {
        let index = self.len();
        if index >= self.capacity() {
            return None;
        }
        self.nodes[0].push(leaf);

        let mut position = index;
        let mut current = leaf;
        for level in 0..self.depth {
            let (left, right) = if position % 2 == 0 {
                (current, self.zeros[level])
            } else {
                (self.nodes[level][position - 1], current)
            };
            current = hash_pair(&left, &right);
            position /= 2;

            let row = &mut self.nodes[level + 1];
            if position < row.len() {
                row[position] = current;
            } else {
                row.push(current);
            }
        }

        self.roots.push(current);
        Some(current)
    }

    /// Path for `leaf_index` against the current root.
    #[must_use]
    pub fn path(&self, leaf_index: usize) -> Option<MerklePath> {
        self.path_at(leaf_index, self.len())
    }

    /// Path for `leaf_index` against the root the tree had at `size` leaves.
    #[must_use]
    pub fn path_at(&self, leaf_index: usize, size: usize) -> Option<MerklePath> {
        if leaf_index >= size || size > self.len() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.depth);
        let mut path_indices = Vec::with_capacity(self.depth);
        let mut position = leaf_index;
        for level in 0..self.depth {
            siblings.push(self.node_at(level, position ^ 1, size));
            path_indices.push((position & 1) as u8);
            position /= 2;
        }

        Some(MerklePath {
            leaf: self.nodes[0][leaf_index],
            leaf_index,
            siblings,
            path_indices,
            root: self.roots[size],
        })
    }

    /// Hash of node `(level, position)` as it was when the tree held `size`
    /// leaves.
    fn node_at(&self, level: usize, position: usize, size: usize) -> Hash32 {
        let width = 1usize << level;
        let start = position * width;
        if start >= size {
            return self.zeros[level];
        }
        if level == 0 || start + width <= size {
            return self.nodes[level][position];
        }
        let left = self.node_at(level - 1, position * 2, size);
        let right = self.node_at(level - 1, position * 2 + 1, size);
        hash_pair(&left, &right)
    }
}
