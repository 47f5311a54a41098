//! Block headers.
use crate::block::target::{Target, TargetV1, TargetV2};
use crate::block::{sha256d, BlockHash, Height, TxRoot};

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 80;

/// A block header.
///
/// Fixed 80-byte layout: previous hash, compact target, merkle root,
/// version, timestamp, nonce. The target field's encoding depends on the
/// header's height relative to [`Params::v2_height`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Hash of the previous block.
    pub prev_blockhash: BlockHash,
    /// Compact difficulty target.
    pub target: Target,
    /// Commitment to the block body.
    pub merkle_root: TxRoot,
    /// Header version.
    pub version: u32,
    /// Unix timestamp.
    pub time: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl Header {
    /// Serialize to the fixed 80-byte layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..32].copy_from_slice(&self.prev_blockhash.0);
        out[32..36].copy_from_slice(&self.target.raw().to_be_bytes());
        out[36..68].copy_from_slice(&self.merkle_root.0);
        out[68..72].copy_from_slice(&self.version.to_be_bytes());
        out[72..76].copy_from_slice(&self.time.to_be_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_be_bytes());
        out
    }

    /// The header's proof-of-work hash.
    pub fn block_hash(&self) -> BlockHash {
        BlockHash(sha256d(&self.to_bytes()))
    }

    /// Whether the header's hash satisfies its own declared target.
    pub fn pow_ok(&self) -> bool {
        self.target.valid() && self.target.compatible(&self.block_hash())
    }
}

/// Consensus parameters relevant to the coordinator.
///
/// Difficulty *retargeting* is the chain server's business; the coordinator
/// only needs to know which target encoding is in force at a height and how
/// often the target is allowed to change.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    /// Height at which the v2 target encoding activates.
    pub v2_height: Height,
    /// Number of blocks between difficulty adjustments.
    pub retarget_interval: Height,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            v2_height: 745_200,
            retarget_interval: 8_640,
        }
    }
}

impl Params {
    /// Whether `target` uses the encoding in force at `height`.
    pub fn encoding_ok(&self, height: Height, target: &Target) -> bool {
        target.is_v2() == (height >= self.v2_height)
    }

    /// Whether the target may differ from the previous block's at `height`.
    pub fn retarget_boundary(&self, height: Height) -> bool {
        height % self.retarget_interval == 0 || height == self.v2_height
    }

    /// Decode a raw 4-byte target using the encoding in force at `height`.
    pub fn decode_target(&self, height: Height, raw: u32) -> Target {
        if height >= self.v2_height {
            Target::V2(TargetV2::from_raw(raw))
        } else {
            Target::V1(TargetV1::from_raw(raw))
        }
    }
}
