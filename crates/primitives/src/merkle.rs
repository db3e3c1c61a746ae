//! Merkle trees, branches, proofs and roots.
//!
//! Rows with an odd hash count duplicate their final hash when computing
//! the row above. `MerkleCache` keeps one interior row of the header tree
//! so branch queries only rehash a single leaf segment.

use crate::hash::sha256d;
use crate::Hash256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    EmptyHashes,
    IndexOutOfRange { index: usize, count: usize },
    LengthOutOfRange,
    LevelMismatch,
    Source(String),
}

impl std::fmt::Display for MerkleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MerkleError::EmptyHashes => write!(f, "hash count must be at least 1"),
            MerkleError::IndexOutOfRange { index, count } => {
                write!(f, "index {index}/{count} out of range")
            }
            MerkleError::LengthOutOfRange => write!(f, "branch length out of range"),
            MerkleError::LevelMismatch => write!(f, "leaf hashes inconsistent with cached level"),
            MerkleError::Source(message) => write!(f, "hash source: {message}"),
        }
    }
}

impl std::error::Error for MerkleError {}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

/// Length of a merkle branch for `hash_count` leaves, ceil(log2).
pub fn branch_length(hash_count: usize) -> Result<usize, MerkleError> {
    if hash_count == 0 {
        return Err(MerkleError::EmptyHashes);
    }
    Ok((usize::BITS - (hash_count - 1).leading_zeros()) as usize)
}

pub fn tree_depth(hash_count: usize) -> Result<usize, MerkleError> {
    Ok(branch_length(hash_count)? + 1)
}

/// Branch and root for the hash at `index`. `length`, when given, must be
/// at least the natural branch length; extra levels keep hashing the
/// root-so-far against itself, which pads proofs served from a cached
/// interior row.
pub fn branch_and_root(
    hashes: &[Hash256],
    index: usize,
    length: Option<usize>,
) -> Result<(Vec<Hash256>, Hash256), MerkleError> {
    if index >= hashes.len() {
        return Err(MerkleError::IndexOutOfRange {
            index,
            count: hashes.len(),
        });
    }
    let natural = branch_length(hashes.len())?;
    let length = match length {
        None => natural,
        Some(length) if length >= natural => length,
        Some(_) => return Err(MerkleError::LengthOutOfRange),
    };

    let mut row = hashes.to_vec();
    let mut index = index;
    let mut branch = Vec::with_capacity(length);
    for _ in 0..length {
        if row.len() & 1 == 1 {
            let last = row[row.len() - 1];
            row.push(last);
        }
        branch.push(row[index ^ 1]);
        index >>= 1;
        row = row
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    Ok((branch, row[0]))
}

pub fn root(hashes: &[Hash256], length: Option<usize>) -> Result<Hash256, MerkleError> {
    Ok(branch_and_root(hashes, 0, length)?.1)
}

/// Fold a proof back up to its root. The branch runs deepest first; any
/// index bits left over after consuming the branch mean the index was out
/// of range for a proof of this depth.
pub fn root_from_proof(
    hash: &Hash256,
    branch: &[Hash256],
    index: usize,
) -> Result<Hash256, MerkleError> {
    let mut hash = *hash;
    let mut index = index;
    for elt in branch {
        hash = if index & 1 == 1 {
            hash_pair(elt, &hash)
        } else {
            hash_pair(&hash, elt)
        };
        index >>= 1;
    }
    if index != 0 {
        return Err(MerkleError::IndexOutOfRange {
            index,
            count: 1 << branch.len(),
        });
    }
    Ok(hash)
}

/// The tree row `depth_higher` levels above the leaves: one sub-root per
/// segment of `1 << depth_higher` leaves.
pub fn level(hashes: &[Hash256], depth_higher: usize) -> Result<Vec<Hash256>, MerkleError> {
    if hashes.is_empty() {
        return Err(MerkleError::EmptyHashes);
    }
    let size = 1usize << depth_higher;
    hashes
        .chunks(size)
        .map(|segment| root(segment, Some(depth_higher)))
        .collect()
}

/// Branch and root using a cached interior row plus the leaf segment
/// containing `index`.
pub fn branch_and_root_from_level(
    level: &[Hash256],
    leaf_hashes: &[Hash256],
    index: usize,
    depth_higher: usize,
) -> Result<(Vec<Hash256>, Hash256), MerkleError> {
    let leaf_start = (index >> depth_higher) << depth_higher;
    let (mut branch, leaf_root) =
        branch_and_root(leaf_hashes, index - leaf_start, Some(depth_higher))?;
    let level_index = index >> depth_higher;
    let (level_branch, root) = branch_and_root(level, level_index, None)?;
    if leaf_root != level[level_index] {
        return Err(MerkleError::LevelMismatch);
    }
    branch.extend(level_branch);
    Ok((branch, root))
}

/// Source of ordered leaf hashes backing a `MerkleCache`.
pub trait HashSource {
    fn hashes(&self, start: usize, count: usize) -> Result<Vec<Hash256>, MerkleError>;
}

/// Caches the tree row at half the tree depth so a branch query rehashes
/// one leaf segment instead of the whole history.
pub struct MerkleCache {
    length: usize,
    depth_higher: usize,
    level: Vec<Hash256>,
}

impl MerkleCache {
    pub fn new() -> Self {
        Self {
            length: 0,
            depth_higher: 0,
            level: Vec::new(),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    fn segment_length(&self) -> usize {
        1 << self.depth_higher
    }

    fn leaf_start(&self, index: usize) -> usize {
        (index >> self.depth_higher) << self.depth_higher
    }

    /// Rebuild the cache over the first `length` source hashes.
    pub fn initialize<S: HashSource>(
        &mut self,
        source: &S,
        length: usize,
    ) -> Result<(), MerkleError> {
        self.length = length;
        if length == 0 {
            self.depth_higher = 0;
            self.level.clear();
            return Ok(());
        }
        self.depth_higher = tree_depth(length)? / 2;
        self.level = level(&source.hashes(0, length)?, self.depth_higher)?;
        Ok(())
    }

    /// Drop cached state past `length` leaves. Alignment to a segment
    /// boundary means nothing is ever recomputed here.
    pub fn truncate(&mut self, length: usize) {
        if length == 0 || length >= self.length {
            return;
        }
        let length = self.leaf_start(length);
        self.length = length;
        self.level.truncate(length >> self.depth_higher);
    }

    fn extend_to<S: HashSource>(&mut self, source: &S, length: usize) -> Result<(), MerkleError> {
        if length <= self.length {
            return Ok(());
        }
        // Restart from the beginning of any final partial segment.
        // depth_higher is retained; in practice this is fine.
        let start = self.leaf_start(self.length);
        let hashes = source.hashes(start, length - start)?;
        self.level.truncate(start >> self.depth_higher);
        self.level.extend(level(&hashes, self.depth_higher)?);
        self.length = length;
        Ok(())
    }

    /// Cached level for a truncation of the source to `length` hashes.
    fn level_for<S: HashSource>(
        &self,
        source: &S,
        length: usize,
    ) -> Result<Vec<Hash256>, MerkleError> {
        if length == self.length {
            return Ok(self.level.clone());
        }
        let mut out = self.level[..length >> self.depth_higher].to_vec();
        let leaf_start = self.leaf_start(length);
        // A segment-aligned length has no partial tail to rehash.
        if leaf_start < length {
            let hashes = source.hashes(leaf_start, length - leaf_start)?;
            out.extend(level(&hashes, self.depth_higher)?);
        }
        Ok(out)
    }

    /// Merkle branch and root over the first `length` source hashes for
    /// the hash at `index`.
    pub fn branch_and_root<S: HashSource>(
        &mut self,
        source: &S,
        length: usize,
        index: usize,
    ) -> Result<(Vec<Hash256>, Hash256), MerkleError> {
        if length == 0 {
            return Err(MerkleError::EmptyHashes);
        }
        if index >= length {
            return Err(MerkleError::IndexOutOfRange {
                index,
                count: length,
            });
        }
        self.extend_to(source, length)?;
        let leaf_start = self.leaf_start(index);
        let count = self.segment_length().min(length - leaf_start);
        let leaf_hashes = source.hashes(leaf_start, count)?;
        if length < self.segment_length() {
            return branch_and_root(&leaf_hashes, index, None);
        }
        let level = self.level_for(source, length)?;
        branch_and_root_from_level(&level, &leaf_hashes, index, self.depth_higher)
    }
}

impl Default for MerkleCache {
    fn default() -> Self {
        Self::new()
    }
}
