//! Protocol error taxonomy.
//!
//! Every protocol violation maps to a typed code. Handlers return the code at
//! the first violation; the dispatcher converts it into a peer close and the
//! loop keeps running. No error crosses the loop boundary to other threads.
use thiserror::Error;

use oryx_common::Height;

use crate::ConnectionId;

/// Typed protocol error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    /// Message checksum mismatch.
    #[error("message checksum mismatch")]
    Checksum,
    /// Block body exceeds the protocol size bound.
    #[error("block body exceeds size bound")]
    BlockSize,
    /// First message was not INIT.
    #[error("expected INIT as first message")]
    NoInit,
    /// INIT received twice.
    #[error("unexpected repeated INIT")]
    InvInit,
    /// Reply does not correlate with an outstanding request.
    #[error("unrequested reply")]
    Unrequested,
    /// Header batch size outside the requested bounds.
    #[error("header batch size out of bounds")]
    BatchSize,
    /// Probe reply was empty for a height the peer must have.
    #[error("empty probe reply")]
    Empty,
    /// Rollback inconsistent with the chain it claims to abandon.
    #[error("inconsistent rollback")]
    BadRollback,
    /// Rollback does not shrink the peer's chain.
    #[error("rollback does not shrink the chain")]
    BadRollbackLen,
    /// Block body does not match the staged header.
    #[error("invalid block body")]
    InvBody,
    /// Declared work does not match computed work.
    #[error("declared work does not match computed work")]
    BadWork,
    /// Leader snapshot priority not above the acknowledged priority.
    #[error("snapshot priority too low")]
    LowPriority,
    /// Peer did not reply in time.
    #[error("peer timed out")]
    Timeout,
    /// Requested data is not available.
    #[error("not found")]
    NotFound,
    /// Peer exceeded a rate limit.
    #[error("rate limit exceeded")]
    Flood,
    /// Peer failed admission into the registry.
    #[error("connection refused by registry")]
    Refused,
    /// Local shutdown.
    #[error("node is shutting down")]
    Shutdown,
}

/// Coarse classification of an error code, deciding the close policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Message framing: close, no chain-level penalty.
    Framing,
    /// Protocol sequencing: close.
    Sequencing,
    /// Invalid content: close, possibly recorded as offender.
    Content,
    /// Priority or consistency violation: close.
    Priority,
    /// Timeout: close.
    Timeout,
    /// Transport-level failure: reschedule, no peer to close.
    Transport,
}

impl ErrorCode {
    /// The taxonomy kind of this code.
    pub fn kind(&self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            Checksum | BlockSize => ErrorKind::Framing,
            NoInit | InvInit | Unrequested => ErrorKind::Sequencing,
            BatchSize | Empty | BadRollback | BadRollbackLen | InvBody | BadWork | Flood => {
                ErrorKind::Content
            }
            LowPriority => ErrorKind::Priority,
            Timeout => ErrorKind::Timeout,
            NotFound | Refused | Shutdown => ErrorKind::Transport,
        }
    }

    /// The conventional protocol name of this code.
    pub fn name(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            Checksum => "ECHECKSUM",
            BlockSize => "EBLOCKSIZE",
            NoInit => "ENOINIT",
            InvInit => "EINVINIT",
            Unrequested => "EUNREQUESTED",
            BatchSize => "EBATCHSIZE",
            Empty => "EEMPTY",
            BadRollback => "EBADROLLBACK",
            BadRollbackLen => "EBADROLLBACKLEN",
            InvBody => "EINVBODY",
            BadWork => "EBADWORK",
            LowPriority => "ELOWPRIORITY",
            Timeout => "ETIMEOUT",
            NotFound => "ENOTFOUND",
            Flood => "EFLOOD",
            Refused => "EREFUSED",
            Shutdown => "ESHUTDOWN",
        }
    }
}

/// A chain-level violation at a specific height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code} at height {height}")]
pub struct ChainError {
    /// The violated rule.
    pub code: ErrorCode,
    /// Height at which the violation was detected.
    pub height: Height,
}

/// A peer judged to have supplied invalid chain content.
///
/// Downloaders report offenders; the coordinator closes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOffender {
    /// The offending peer.
    pub con_id: ConnectionId,
    /// What it did.
    pub error: ChainError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_partition() {
        assert_eq!(ErrorCode::Checksum.kind(), ErrorKind::Framing);
        assert_eq!(ErrorCode::NoInit.kind(), ErrorKind::Sequencing);
        assert_eq!(ErrorCode::BatchSize.kind(), ErrorKind::Content);
        assert_eq!(ErrorCode::LowPriority.kind(), ErrorKind::Priority);
        assert_eq!(ErrorCode::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(ErrorCode::NotFound.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_names_follow_convention() {
        assert_eq!(ErrorCode::Unrequested.name(), "EUNREQUESTED");
        assert_eq!(ErrorCode::BadRollbackLen.name(), "EBADROLLBACKLEN");
    }
}
