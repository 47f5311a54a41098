//! Header chains and chain identification.
use thiserror::Error;

use crate::block::header::Header;
use crate::block::target::Worksum;
use crate::block::{BlockHash, Height};

/// Compact fingerprint identifying a particular chain history.
///
/// A node bumps its descriptor whenever its chain shrinks or forks; two
/// chains with equal descriptors at equal length are identical. Descriptor
/// `0` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(pub u32);

impl Descriptor {
    /// The descriptor of a freshly started chain.
    pub fn initial() -> Self {
        Self(1)
    }

    /// The next descriptor after a fork or rollback.
    pub fn bumped(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selects a contiguous run of headers of a descripted chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSelector {
    /// Chain the headers are requested from.
    pub descriptor: Descriptor,
    /// First height requested.
    pub start: Height,
    /// Number of headers requested.
    pub length: u32,
}

impl BatchSelector {
    /// One past the last height requested.
    pub fn end(&self) -> Height {
        self.start + self.length
    }
}

/// An inclusive range of block heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderRange {
    /// First height of the range.
    pub lower: Height,
    /// Last height of the range.
    pub upper: Height,
}

impl HeaderRange {
    /// Construct a range; `lower` must not exceed `upper`.
    pub fn new(lower: Height, upper: Height) -> Self {
        debug_assert!(lower <= upper);
        Self { lower, upper }
    }

    /// Number of heights in the range.
    pub fn len(&self) -> u32 {
        self.upper - self.lower + 1
    }

    /// Whether the range is empty. Never true for a well-formed range.
    pub fn is_empty(&self) -> bool {
        self.lower > self.upper
    }

    /// Whether `height` falls within the range.
    pub fn contains(&self, height: Height) -> bool {
        (self.lower..=self.upper).contains(&height)
    }

    /// Whether the two ranges share any height.
    pub fn overlaps(&self, other: &HeaderRange) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }
}

impl std::fmt::Display for HeaderRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.lower, self.upper)
    }
}

/// Priority rank of a signed snapshot.
///
/// Higher importance wins; equal importance is broken by the pinned height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SnapshotPriority {
    /// Authority-assigned importance. Zero means "no snapshot".
    pub importance: u32,
    /// Height the snapshot pins.
    pub height: Height,
}

/// Authoritative pinning of a historical block, used to resolve deep
/// rollbacks.
///
/// Signature verification is the chain server's business; the coordinator
/// only compares priorities and checks chain compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedSnapshot {
    /// Priority rank.
    pub priority: SnapshotPriority,
    /// Hash of the pinned block.
    pub block_hash: BlockHash,
}

impl SignedSnapshot {
    /// Whether the chain contains the pinned block at the pinned height.
    pub fn compatible(&self, chain: &Headerchain) -> bool {
        chain.hash_at(self.priority.height) == Some(self.block_hash)
    }
}

/// Error appending headers to a [`Headerchain`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppendError {
    /// A header's previous-hash link does not match the chain tip.
    #[error("header at height {0} does not link to the previous block")]
    BrokenLink(Height),
}

/// An append-only sequence of block headers with cumulative work.
///
/// Height `n` (`n >= 1`) lives at index `n - 1`; height `0` is the genesis
/// block, represented only by its hash. The chain caches header hashes so
/// probe replies and fork checks don't rehash.
#[derive(Debug, Clone)]
pub struct Headerchain {
    genesis_hash: BlockHash,
    headers: Vec<Header>,
    hashes: Vec<BlockHash>,
    worksums: Vec<Worksum>,
}

impl Headerchain {
    /// An empty chain rooted at the given genesis hash.
    pub fn new(genesis_hash: BlockHash) -> Self {
        Self {
            genesis_hash,
            headers: Vec::new(),
            hashes: Vec::new(),
            worksums: Vec::new(),
        }
    }

    /// Chain length: the height of the tip.
    pub fn length(&self) -> Height {
        self.headers.len() as Height
    }

    /// Total accumulated work.
    pub fn total_work(&self) -> Worksum {
        self.worksums.last().copied().unwrap_or_default()
    }

    /// Accumulated work through the given height.
    pub fn work_at(&self, height: Height) -> Worksum {
        if height == 0 {
            Worksum::zero()
        } else {
            self.worksums
                .get(height as usize - 1)
                .copied()
                .unwrap_or_else(|| self.total_work())
        }
    }

    /// Hash of the chain tip.
    pub fn tip_hash(&self) -> BlockHash {
        self.hashes.last().copied().unwrap_or(self.genesis_hash)
    }

    /// Hash of the block at `height`, if within the chain.
    pub fn hash_at(&self, height: Height) -> Option<BlockHash> {
        if height == 0 {
            Some(self.genesis_hash)
        } else {
            self.hashes.get(height as usize - 1).copied()
        }
    }

    /// Header at `height`, if within the chain.
    pub fn get_header(&self, height: Height) -> Option<&Header> {
        if height == 0 {
            None
        } else {
            self.headers.get(height as usize - 1)
        }
    }

    /// Headers in `[start, end)`, clamped to the chain.
    pub fn get_headers(&self, start: Height, end: Height) -> Vec<Header> {
        if start == 0 || start > self.length() {
            return Vec::new();
        }
        let end = end.min(self.length() + 1);
        self.headers[start as usize - 1..end as usize - 1].to_vec()
    }

    /// Append headers at the tip. Each header must link to its predecessor.
    pub fn append(&mut self, headers: &[Header]) -> Result<(), AppendError> {
        for header in headers {
            if header.prev_blockhash != self.tip_hash() {
                return Err(AppendError::BrokenLink(self.length() + 1));
            }
            let work = self.total_work() + header.target.work();
            self.hashes.push(header.block_hash());
            self.worksums.push(work);
            self.headers.push(*header);
        }
        Ok(())
    }

    /// Truncate the chain to the given length.
    pub fn shrink(&mut self, new_length: Height) {
        let n = new_length as usize;
        self.headers.truncate(n);
        self.hashes.truncate(n);
        self.worksums.truncate(n);
    }

    /// Hashrate estimate over the last `n` blocks, in hashes per second.
    pub fn hashrate(&self, n: usize) -> f64 {
        let len = self.headers.len();
        let n = n.min(len);
        if n == 0 {
            return 0.0;
        }
        let window = &self.headers[len - n..];
        let work: f64 = window.iter().map(|h| h.target.difficulty()).sum();
        let t0 = window.first().map(|h| h.time).unwrap_or_default();
        let t1 = window.last().map(|h| h.time).unwrap_or_default();
        let span = t1.saturating_sub(t0).max(1);
        work / span as f64
    }

    /// Hashrate estimates over `[from, to]`, one per `window` blocks.
    pub fn hashrate_chart(&self, from: Height, to: Height, window: u32) -> Vec<(Height, f64)> {
        let mut out = Vec::new();
        if window == 0 || from == 0 || from > to {
            return out;
        }
        let to = to.min(self.length());
        let mut h = from;
        while h <= to {
            let upper = (h + window - 1).min(to);
            let lower_idx = h as usize - 1;
            let upper_idx = upper as usize;
            let slice = &self.headers[lower_idx..upper_idx];
            let work: f64 = slice.iter().map(|x| x.target.difficulty()).sum();
            let t0 = slice.first().map(|x| x.time).unwrap_or_default();
            let t1 = slice.last().map(|x| x.time).unwrap_or_default();
            let span = t1.saturating_sub(t0).max(1);
            out.push((upper, work / span as f64));
            h = upper + 1;
        }
        out
    }
}
