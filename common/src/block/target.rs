//! Difficulty targets and accumulated work.
//!
//! Two compact target encodings exist on the network. Both pack a
//! leading-zero count and a normalized mantissa into four bytes; they differ
//! in how the bits are split:
//!
//! * [`TargetV1`]: byte 0 is the number of required leading zero bits
//!   (0..=224), bytes 1..=3 are a 24-bit mantissa with its top bit set.
//! * [`TargetV2`]: the top 10 bits are the zero count (0..=767), the bottom
//!   22 bits are a mantissa with its top bit set.
//!
//! A hash satisfies a target when its leading zero count and mantissa
//! compare below the target's. `TargetV2` compares against the
//! [`HashExponentialDigest`] of the hash instead of raw bytes, which admits
//! zero counts beyond 256.
use crate::block::BlockHash;

/// Number of mantissa bits in a [`TargetV1`].
const V1_MANTISSA_BITS: u32 = 24;
/// Number of mantissa bits in a [`TargetV2`].
const V2_MANTISSA_BITS: u32 = 22;

/// First-generation compact target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetV1(u32);

impl TargetV1 {
    /// The genesis target: 32 zero bits, maximum mantissa.
    pub fn genesis() -> Self {
        Self::new(32, 0x00FF_FFFF)
    }

    /// Construct from a zero count and a 24-bit mantissa.
    pub fn new(zeros: u32, mantissa: u32) -> Self {
        debug_assert!(zeros <= 224);
        debug_assert!((0x0080_0000..=0x00FF_FFFF).contains(&mantissa));
        Self(zeros << 24 | mantissa)
    }

    /// Decode from the wire representation.
    pub fn from_raw(data: u32) -> Self {
        Self(data)
    }

    /// The wire representation.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Number of required leading zero bits.
    pub fn zeros8(&self) -> u32 {
        self.0 >> 24
    }

    /// Mantissa, in `[2^23, 2^24)` for well-formed targets.
    pub fn bits24(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Whether the encoding is well-formed.
    pub fn valid(&self) -> bool {
        self.zeros8() <= 256 - 32 && self.bits24() & 0x0080_0000 != 0
    }

    /// Check whether a hash satisfies this target.
    ///
    /// The hash is interpreted as a 256-bit little-endian number: its most
    /// significant byte is `hash[31]`.
    pub fn compatible(&self, hash: &BlockHash) -> bool {
        let zeros = self.zeros8();
        if zeros > 256 - 32 {
            return false;
        }
        let bits = self.bits24();
        if bits & 0x0080_0000 == 0 {
            return false;
        }
        let h = &hash.0;
        let zerobytes = (zeros / 8) as usize;
        let shift = zeros & 0x07;

        for i in 0..zerobytes {
            if h[31 - i] != 0 {
                return false;
            }
        }
        let threshold = bits << (8 - shift);
        let src = &h[28 - zerobytes..32 - zerobytes];
        let candidate = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);

        if candidate > threshold {
            return false;
        }
        if candidate < threshold {
            return true;
        }
        h[..28 - zerobytes].iter().all(|b| *b == 0)
    }

    /// The expected number of hashes to find a block at this target.
    pub fn difficulty(&self) -> f64 {
        let zeros = self.zeros8();
        let dbits = self.bits24() as f64;
        (1.0 / dbits) * ((zeros + V1_MANTISSA_BITS) as f64).exp2()
    }

    /// Accumulated work contributed by one block at this target.
    pub fn work(&self) -> Worksum {
        Worksum::pow2_div(self.zeros8() + V1_MANTISSA_BITS, self.bits24())
    }
}

/// Second-generation compact target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetV2(u32);

impl TargetV2 {
    /// The target in force when the v2 encoding activates.
    pub fn initial() -> Self {
        Self::new(40, 0x003F_FFFF)
    }

    /// Construct from a zero count and a 22-bit mantissa.
    pub fn new(zeros: u32, mantissa: u32) -> Self {
        debug_assert!(zeros < 3 * 256);
        debug_assert!((0x0020_0000..=0x003F_FFFF).contains(&mantissa));
        Self(zeros << 22 | mantissa)
    }

    /// Decode from the wire representation.
    pub fn from_raw(data: u32) -> Self {
        Self(data)
    }

    /// The wire representation.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Number of required leading zero bits.
    pub fn zeros10(&self) -> u32 {
        self.0 >> 22
    }

    /// Mantissa, in `[2^21, 2^22)` for well-formed targets.
    pub fn bits22(&self) -> u32 {
        self.0 & 0x003F_FFFF
    }

    /// Whether the encoding is well-formed.
    pub fn valid(&self) -> bool {
        self.zeros10() < 3 * 256 && self.bits22() & 0x0020_0000 != 0
    }

    /// Check whether a hash digest satisfies this target.
    pub fn compatible(&self, digest: &HashExponentialDigest) -> bool {
        let zeros_target = self.zeros10();
        debug_assert!(digest.neg_exp > 0);
        let zeros_digest = digest.neg_exp - 1;
        if zeros_target > zeros_digest {
            return false;
        }
        if zeros_target < zeros_digest {
            return true;
        }
        let bits32 = self.bits22() << 10;
        digest.data < bits32
    }

    /// The expected number of hashes to find a block at this target.
    pub fn difficulty(&self) -> f64 {
        let zeros = self.zeros10();
        let dbits = self.bits22() as f64;
        (1.0 / dbits) * ((zeros + V2_MANTISSA_BITS) as f64).exp2()
    }

    /// Accumulated work contributed by one block at this target.
    pub fn work(&self) -> Worksum {
        Worksum::pow2_div(self.zeros10() + V2_MANTISSA_BITS, self.bits22())
    }
}

/// A difficulty target in either encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// First-generation encoding.
    V1(TargetV1),
    /// Second-generation encoding.
    V2(TargetV2),
}

impl Target {
    /// Whether the encoding is well-formed.
    pub fn valid(&self) -> bool {
        match self {
            Self::V1(t) => t.valid(),
            Self::V2(t) => t.valid(),
        }
    }

    /// Check whether a hash satisfies this target.
    pub fn compatible(&self, hash: &BlockHash) -> bool {
        match self {
            Self::V1(t) => t.compatible(hash),
            Self::V2(t) => t.compatible(&HashExponentialDigest::of(hash)),
        }
    }

    /// The expected number of hashes to find a block at this target.
    pub fn difficulty(&self) -> f64 {
        match self {
            Self::V1(t) => t.difficulty(),
            Self::V2(t) => t.difficulty(),
        }
    }

    /// Accumulated work contributed by one block at this target.
    pub fn work(&self) -> Worksum {
        match self {
            Self::V1(t) => t.work(),
            Self::V2(t) => t.work(),
        }
    }

    /// The wire representation.
    pub fn raw(&self) -> u32 {
        match self {
            Self::V1(t) => t.raw(),
            Self::V2(t) => t.raw(),
        }
    }

    /// Whether this target uses the v2 encoding.
    pub fn is_v2(&self) -> bool {
        matches!(self, Self::V2(_))
    }
}

/// Floating-exponent representation of a hash.
///
/// `neg_exp` is one more than the number of leading zero bits of the hash
/// (interpreted as a little-endian 256-bit number); `data` holds the 32 bits
/// starting at the first set bit, so its top bit is always set for nonzero
/// hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashExponentialDigest {
    /// Negative exponent: leading zero bits plus one.
    pub neg_exp: u32,
    /// Normalized 32-bit mantissa.
    pub data: u32,
}

impl HashExponentialDigest {
    /// Compute the digest of a hash.
    pub fn of(hash: &BlockHash) -> Self {
        // Big-endian byte order of the number the hash represents.
        let mut be = [0u8; 32];
        for (i, b) in hash.0.iter().rev().enumerate() {
            be[i] = *b;
        }
        let mut zeros = 0u32;
        for byte in be {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        if zeros == 256 {
            // The all-zero hash: treat as maximally small.
            return Self {
                neg_exp: 257,
                data: u32::MAX,
            };
        }
        // Extract 32 bits starting at the first set bit.
        let mut data = 0u32;
        let start = zeros as usize;
        for i in 0..32 {
            let pos = start + i;
            let bit = if pos < 256 {
                (be[pos / 8] >> (7 - pos % 8)) & 1
            } else {
                0
            };
            data = data << 1 | bit as u32;
        }
        Self {
            neg_exp: zeros + 1,
            data,
        }
    }
}

/// 256-bit accumulated proof-of-work.
///
/// Limbs are little-endian. Addition saturates: exponents beyond 2²⁵⁵ cannot
/// occur on realistic chains and saturation only under-reports claimed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Worksum([u64; 4]);

impl Worksum {
    /// The zero worksum.
    pub fn zero() -> Self {
        Self::default()
    }

    /// The maximum representable worksum.
    pub fn max() -> Self {
        Self([u64::MAX; 4])
    }

    /// Whether no work has been accumulated.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    /// `floor(2^e / m)`, saturating at the 256-bit maximum.
    fn pow2_div(e: u32, m: u32) -> Self {
        debug_assert!(m > 0);
        let mut limbs = [0u64; 4];
        let mut rem: u64 = 0;
        let m = m as u64;
        for pos in (0..=e).rev() {
            rem = rem << 1 | u64::from(pos == e);
            if rem >= m {
                rem -= m;
                if pos >= 256 {
                    return Self::max();
                }
                limbs[(pos / 64) as usize] |= 1u64 << (pos % 64);
            }
        }
        Self(limbs)
    }

    /// Approximate value, for display and rate estimates.
    pub fn as_f64(&self) -> f64 {
        self.0
            .iter()
            .enumerate()
            .map(|(i, limb)| *limb as f64 * ((64 * i) as f64).exp2())
            .sum()
    }
}

impl PartialOrd for Worksum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Worksum {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for i in (0..4).rev() {
            match self.0[i].cmp(&other.0[i]) {
                std::cmp::Ordering::Equal => continue,
                ord => return ord,
            }
        }
        std::cmp::Ordering::Equal
    }
}

impl std::ops::Add for Worksum {
    type Output = Worksum;

    fn add(self, other: Worksum) -> Worksum {
        let mut out = [0u64; 4];
        let mut carry = false;
        for i in 0..4 {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(u64::from(carry));
            out[i] = sum;
            carry = c1 || c2;
        }
        if carry {
            Worksum::max()
        } else {
            Worksum(out)
        }
    }
}

impl std::ops::AddAssign for Worksum {
    fn add_assign(&mut self, other: Worksum) {
        *self = *self + other;
    }
}

impl std::ops::Sub for Worksum {
    type Output = Worksum;

    fn sub(self, other: Worksum) -> Worksum {
        let mut out = [0u64; 4];
        let mut borrow = false;
        for i in 0..4 {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(u64::from(borrow));
            out[i] = diff;
            borrow = b1 || b2;
        }
        if borrow {
            Worksum::zero()
        } else {
            Worksum(out)
        }
    }
}

impl std::fmt::Display for Worksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4e}", self.as_f64())
    }
}
