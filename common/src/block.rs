//! Block primitives.
pub mod chain;
pub mod header;
pub mod target;

use sha2::{Digest, Sha256};

/// Block height. Height `0` is the genesis block.
pub type Height = u32;

/// Maximum serialized size of a block body, in bytes.
pub const MAX_BLOCK_SIZE: usize = 4_000_000;

/// Double-SHA256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero hash.
            pub fn all_zeros() -> Self {
                Self([0; 32])
            }

            /// Hash the given bytes.
            pub fn hash(data: &[u8]) -> Self {
                Self(sha256d(data))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                for b in self.0.iter().rev() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

hash_newtype! {
    /// Hash identifying a block.
    BlockHash
}

hash_newtype! {
    /// Merkle root over a block body.
    TxRoot
}

hash_newtype! {
    /// Hash identifying a transaction.
    TxId
}

/// A serialized block body, as transferred between peers.
///
/// The coordinator treats bodies as opaque: it checks size and that the body
/// digest matches the staged header's merkle root, and hands them to the
/// chain server for full validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body(pub Vec<u8>);

impl Body {
    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Digest committed to by the block header.
    pub fn merkle_root(&self) -> TxRoot {
        TxRoot::hash(&self.0)
    }

    /// Whether the body is within the protocol size bound.
    pub fn within_size_bound(&self) -> bool {
        self.size() <= MAX_BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_display_is_big_endian_hex() {
        let mut h = [0u8; 32];
        h[31] = 0xAB;
        let s = BlockHash(h).to_string();

        assert!(s.starts_with("ab"));
        assert_eq!(s.len(), 64);
    }

    #[test]
    fn test_body_root_is_stable() {
        let body = Body(vec![1, 2, 3]);

        assert_eq!(body.merkle_root(), body.merkle_root());
        assert_ne!(body.merkle_root(), Body(vec![3, 2, 1]).merkle_root());
    }

    #[test]
    fn test_body_size_bound() {
        assert!(Body(vec![0; 100]).within_size_bound());
        assert!(!Body(vec![0; MAX_BLOCK_SIZE + 1]).within_size_bound());
    }
}
