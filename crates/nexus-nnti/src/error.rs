//! Transport result codes.
//!
//! Every public transport call returns one of these; nothing unwinds across
//! the public surface. The success path is the `Ok` side of
//! [`NntiResult`]; completion events carry an [`EventResult`] so a single
//! `Copy` value can ride inside the event struct.

use std::fmt;

pub type NntiResult<T> = Result<T, NntiError>;

/// Outcome carried inside a completion event.
pub type EventResult = Result<(), NntiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NntiError {
    /// Unspecified I/O error
    Io,
    /// Message larger than the supported maximum
    MsgSize,
    /// Operation or process canceled
    Canceled,
    /// Operation timed out
    Timedout,
    /// Invalid parameter value
    Inval,
    /// No memory available
    Nomem,
    /// No such entry
    Noent,
    /// Unsupported operation
    Notsup,
    /// Item already exists
    Exist,
    /// Unsuccessful rpc operation
    BadRpc,
    /// Not initialized
    NotInit,
    /// Insufficient privileges
    Perm,
    /// Wait interrupted by interrupt()
    Intr,
    /// Async operation would have blocked
    WouldBlock,
    /// Resource temporarily unavailable, retry later
    Again,
    /// Request could not be delivered
    Dropped,
    /// Error unpacking a wire structure
    Decode,
    /// Error packing a wire structure
    Encode,
    /// Address or length violates the rdma alignment rule
    Align,
}

impl fmt::Display for NntiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Io => "i/o error",
            Self::MsgSize => "message too large",
            Self::Canceled => "operation canceled",
            Self::Timedout => "operation timed out",
            Self::Inval => "invalid argument",
            Self::Nomem => "out of memory",
            Self::Noent => "no such entry",
            Self::Notsup => "operation not supported",
            Self::Exist => "already exists",
            Self::BadRpc => "rpc failed",
            Self::NotInit => "not initialized",
            Self::Perm => "permission denied",
            Self::Intr => "interrupted",
            Self::WouldBlock => "would block",
            Self::Again => "temporarily unavailable",
            Self::Dropped => "request dropped",
            Self::Decode => "unpack error",
            Self::Encode => "pack error",
            Self::Align => "alignment violation",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for NntiError {}
