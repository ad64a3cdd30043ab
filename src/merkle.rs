//! Merkle tree with multi-leaf inclusion proofs.
//!
//! Leaves and internal nodes are domain separated. Pairs are hashed in sorted order, and an
//! odd-sized layer is padded with the zero hash, so a single proof can cover any subset of
//! leaves without recording left/right positions. The proof layout and verification follow
//! the queue-based multi-proof scheme used on chain: `hashes` are the siblings that cannot
//! be derived from the proven leaves, and one source flag per computed node says whether its
//! second input comes from the queue of derived hashes (`true`) or from `hashes` (`false`).

use crate::{
    constants::MAX_NUMBER_TREE_LEAVES,
    error::MerkleError,
    types::{ExecutionReport, Message},
};
use alloy::{
    primitives::{Address, B256, Keccak256, U256, keccak256},
    sol_types::SolValue,
};

/// Prefix of every leaf preimage.
pub const LEAF_DOMAIN_SEPARATOR: u8 = 0x00;

/// Prefix of every internal node preimage.
pub const INTERNAL_DOMAIN_SEPARATOR: B256 = B256::with_last_byte(1);

/// A merkle tree over at most [`MAX_NUMBER_TREE_LEAVES`] leaves.
///
/// All layers live in a single allocation: the leaves first, then each parent layer, with
/// the root as the last node.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// All tree nodes, layer by layer.
    nodes: Vec<B256>,
    /// Number of nodes in each layer, leaves first, root layer last.
    layer_sizes: Vec<usize>,
    /// Offset of each layer in `nodes`.
    layer_offsets: Vec<usize>,
}

impl MerkleTree {
    /// Builds a tree from leaf hashes.
    pub fn new(leaves: &[B256]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }
        if leaves.len() > MAX_NUMBER_TREE_LEAVES {
            return Err(MerkleError::TooManyLeaves {
                count: leaves.len(),
                max: MAX_NUMBER_TREE_LEAVES,
            });
        }

        let mut layer_sizes = vec![leaves.len()];
        let mut current = leaves.len();
        while current > 1 {
            current = current.div_ceil(2);
            layer_sizes.push(current);
        }

        let mut layer_offsets = Vec::with_capacity(layer_sizes.len());
        let mut total = 0;
        for &size in &layer_sizes {
            layer_offsets.push(total);
            total += size;
        }

        let mut nodes = Vec::with_capacity(total);
        nodes.extend_from_slice(leaves);

        // Reusable buffer for hashing
        let mut buffer = [0u8; 96];
        for layer in 0..layer_sizes.len() - 1 {
            let offset = layer_offsets[layer];
            let size = layer_sizes[layer];
            for i in (0..size).step_by(2) {
                let left = nodes[offset + i];
                let right = if i + 1 < size { nodes[offset + i + 1] } else { B256::ZERO };
                nodes.push(hash_internal(&left, &right, &mut buffer));
            }
        }

        Ok(Self { nodes, layer_sizes, layer_offsets })
    }

    /// Number of leaves.
    #[inline]
    pub fn len(&self) -> usize {
        self.layer_sizes[0]
    }

    /// Always false, a tree has at least one leaf.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The root of the tree. A single-leaf tree's root is the leaf itself.
    #[inline]
    pub fn root(&self) -> B256 {
        self.nodes[self.nodes.len() - 1]
    }

    /// Node `index` of `layer`, or the zero hash when it falls into the padding.
    fn node(&self, layer: usize, index: usize) -> B256 {
        if index < self.layer_sizes[layer] {
            self.nodes[self.layer_offsets[layer] + index]
        } else {
            B256::ZERO
        }
    }

    /// Builds a proof for the leaves at `indices`, which must be strictly ascending.
    pub fn prove(&self, indices: &[usize]) -> Result<Proof, MerkleError> {
        if indices.is_empty() {
            return Err(MerkleError::EmptyTree);
        }
        if indices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MerkleError::UnsortedIndices);
        }
        if let Some(&index) = indices.iter().find(|&&index| index >= self.len()) {
            return Err(MerkleError::IndexOutOfBounds { index, tree_size: self.len() });
        }

        let mut proof = Proof::default();
        let mut current = indices.to_vec();
        for layer in 0..self.layer_sizes.len() - 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            let mut j = 0;
            while j < current.len() {
                let index = current[j];
                let sibling = index ^ 1;
                if current.get(j + 1) == Some(&sibling) {
                    proof.source_flags.push(true);
                    j += 2;
                } else {
                    proof.source_flags.push(false);
                    proof.hashes.push(self.node(layer, sibling));
                    j += 1;
                }
                next.push(index / 2);
            }
            current = next;
        }

        Ok(proof)
    }
}

/// A multi-leaf inclusion proof.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proof {
    /// Sibling hashes that cannot be derived from the proven leaves.
    pub hashes: Vec<B256>,
    /// One flag per computed node, `true` when both inputs come from the queue.
    pub source_flags: Vec<bool>,
}

impl Proof {
    /// Packs the source flags into a bit set, bit `i` set when flag `i` is `true`.
    pub fn flag_bits(&self) -> U256 {
        self.source_flags
            .iter()
            .enumerate()
            .filter(|(_, flag)| **flag)
            .fold(U256::ZERO, |bits, (i, _)| bits | (U256::from(1) << i))
    }

    /// Unpacks `count` source flags from a bit set.
    pub fn flags_from_bits(bits: U256, count: usize) -> Vec<bool> {
        (0..count).map(|i| bits.bit(i)).collect()
    }
}

/// Recomputes the root from the proven `leaves`, in ascending index order, and a proof.
pub fn verify_compute_root(leaves: &[B256], proof: &Proof) -> Result<B256, MerkleError> {
    if leaves.is_empty() {
        return Err(MerkleError::EmptyTree);
    }
    if leaves.len() > MAX_NUMBER_TREE_LEAVES {
        return Err(MerkleError::TooManyLeaves { count: leaves.len(), max: MAX_NUMBER_TREE_LEAVES });
    }

    let total_hashes = leaves.len() + proof.hashes.len() - 1;
    if total_hashes == 0 {
        return Ok(leaves[0]);
    }
    if proof.source_flags.len() != total_hashes {
        return Err(MerkleError::FlagCountMismatch {
            flags: proof.source_flags.len(),
            expected: total_hashes,
        });
    }

    let mut hashes = Vec::with_capacity(total_hashes);
    let (mut leaf_pos, mut hash_pos, mut proof_pos) = (0, 0, 0);
    let mut buffer = [0u8; 96];

    for &from_queue in &proof.source_flags {
        let a = pop_queue(leaves, &hashes, &mut leaf_pos, &mut hash_pos)?;
        let b = if from_queue {
            pop_queue(leaves, &hashes, &mut leaf_pos, &mut hash_pos)?
        } else {
            let hash = proof.hashes.get(proof_pos).copied().ok_or(MerkleError::MalformedProof)?;
            proof_pos += 1;
            hash
        };
        hashes.push(hash_internal(&a, &b, &mut buffer));
    }

    if hash_pos != total_hashes - 1 || leaf_pos != leaves.len() || proof_pos != proof.hashes.len()
    {
        return Err(MerkleError::UnconsumedInputs);
    }

    Ok(hashes[total_hashes - 1])
}

/// Takes the next leaf, or the next derived hash once the leaves are exhausted.
fn pop_queue(
    leaves: &[B256],
    hashes: &[B256],
    leaf_pos: &mut usize,
    hash_pos: &mut usize,
) -> Result<B256, MerkleError> {
    if let Some(leaf) = leaves.get(*leaf_pos) {
        *leaf_pos += 1;
        return Ok(*leaf);
    }
    let hash = hashes.get(*hash_pos).copied().ok_or(MerkleError::MalformedProof)?;
    *hash_pos += 1;
    Ok(hash)
}

/// Hash two nodes together in sorted order, prefixed with the internal domain separator.
#[inline(always)]
fn hash_internal(left: &B256, right: &B256, buffer: &mut [u8; 96]) -> B256 {
    let (first, second) = if left < right { (left, right) } else { (right, left) };

    buffer[..32].copy_from_slice(INTERNAL_DOMAIN_SEPARATOR.as_ref());
    buffer[32..64].copy_from_slice(first.as_ref());
    buffer[64..].copy_from_slice(second.as_ref());

    keccak256(buffer)
}

/// Computes message leaf hashes for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafHasher {
    metadata_hash: B256,
}

impl LeafHasher {
    /// Creates a hasher for messages from `source_chain_selector` to `dest_chain_selector`
    /// sent through `on_ramp`.
    pub fn new(source_chain_selector: u64, dest_chain_selector: u64, on_ramp: Address) -> Self {
        let metadata_hash = keccak256(
            (keccak256("Any2EVMMessageHashV1"), source_chain_selector, dest_chain_selector, on_ramp)
                .abi_encode(),
        );
        Self { metadata_hash }
    }

    /// Leaf hash of `message`. Ignores `messageId`, which is expected to hold this value.
    pub fn hash(&self, message: &Message) -> B256 {
        let fixed = (
            message.sender,
            message.receiver,
            message.sequenceNumber,
            message.gasLimit,
            message.strict,
            message.nonce,
            message.feeToken,
            message.feeTokenAmount,
        )
            .abi_encode();
        let variable =
            (keccak256(&message.data), keccak256(message.tokenAmounts.abi_encode())).abi_encode();

        let mut hasher = Keccak256::new();
        hasher.update([LEAF_DOMAIN_SEPARATOR]);
        hasher.update(self.metadata_hash);
        hasher.update(keccak256(fixed));
        hasher.update(keccak256(variable));
        hasher.finalize()
    }

    /// Root proven by an execution report: its messages hashed as leaves, folded with the
    /// report's proof hashes and flag bits.
    pub fn execution_report_root(&self, report: &ExecutionReport) -> Result<B256, MerkleError> {
        let leaves: Vec<B256> = report.messages.iter().map(|message| self.hash(message)).collect();
        let flag_count = (leaves.len() + report.proofs.len()).saturating_sub(1);
        let proof = Proof {
            hashes: report.proofs.clone(),
            source_flags: Proof::flags_from_bits(report.proofFlagBits, flag_count),
        };
        verify_compute_root(&leaves, &proof)
    }
}
