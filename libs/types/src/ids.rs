//! Identifier types shared by the aggregator and every adapter
//!
//! - [`TransactionId`]: typed wrapper over the per-process transaction counter
//! - [`TransactionIdGenerator`]: monotonic, never-reusing id source
//! - [`AdapterId`]: stable identity of a leaf or aggregate adapter
//! - [`SecurityId`]: venue-neutral instrument key (code + board)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Generate a zero-cost typed wrapper around a `u64` identifier.
macro_rules! define_typed_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Default,
            Serialize,
            Deserialize
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Sentinel for "not set"
            pub const NONE: Self = Self(0);

            /// Create a new typed ID
            #[inline(always)]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Extract the raw value
            #[inline(always)]
            pub const fn inner(self) -> u64 {
                self.0
            }

            /// Whether this id carries a value (ids are strictly positive)
            #[inline(always)]
            pub const fn is_set(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

define_typed_id! {
    /// Transaction identifier of a request or the request a response refers to
    TransactionId
}

/// Monotonic transaction id source.
///
/// Ids start at the configured seed and are handed out strictly increasing,
/// so a value is never produced twice by the same generator.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    next: AtomicU64,
}

impl TransactionIdGenerator {
    /// Generator whose first id is `1`
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Generator whose first id is `first` (clamped to at least `1`)
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    /// Hand out the next id
    pub fn next_id(&self) -> TransactionId {
        TransactionId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Peek at the id the next call will return
    pub fn peek(&self) -> TransactionId {
        TransactionId(self.next.load(Ordering::Relaxed))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique adapter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdapterId(Uuid);

impl AdapterId {
    /// Create a fresh random adapter id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AdapterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter-{}", self.0.simple())
    }
}

/// Instrument key: security code plus the board (exchange segment) it trades on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecurityId {
    /// Ticker or venue-specific code
    pub code: String,
    /// Board / exchange segment
    pub board: String,
}

impl SecurityId {
    /// Build a security id from code and board
    pub fn new(code: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            board: board.into(),
        }
    }
}

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.code, self.board)
    }
}
