//! Per-client permission table.
//!
//! Authorization is a static bitmap per client identity (the subject CN of
//! the peer certificate). The table is built once at startup and never
//! mutated, so lookups are lock-free.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The four operations a client may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Status,
    Stream,
}

impl Operation {
    const fn bit(self) -> u8 {
        match self {
            Self::Start => 1 << 0,
            Self::Stop => 1 << 1,
            Self::Status => 1 << 2,
            Self::Stream => 1 << 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Status => write!(f, "status"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// Bitmap of granted [`Operation`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions(u8);

impl Permissions {
    /// No operations granted.
    pub const NONE: Self = Self(0);

    /// Build a bitmap from a list of operations.
    #[must_use]
    pub fn grant(ops: &[Operation]) -> Self {
        ops.iter().fold(Self::NONE, |acc, op| acc.with(*op))
    }

    /// Add one operation to the bitmap.
    #[must_use]
    pub const fn with(self, op: Operation) -> Self {
        Self(self.0 | op.bit())
    }

    /// Whether `op` is granted.
    #[must_use]
    pub const fn allows(self, op: Operation) -> bool {
        self.0 & op.bit() != 0
    }
}

/// Immutable mapping from client identity to granted operations.
#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    grants: HashMap<String, Permissions>,
}

impl PermissionTable {
    /// Build a table from explicit grants.
    #[must_use]
    pub fn new(grants: HashMap<String, Permissions>) -> Self {
        Self { grants }
    }

    /// The reference deployment matrix: `client1` may do everything,
    /// `client2` everything except `status`.
    #[must_use]
    pub fn reference() -> Self {
        use Operation::{Start, Status, Stop, Stream};
        let mut grants = HashMap::new();
        grants.insert(
            "client1".to_string(),
            Permissions::grant(&[Start, Stop, Status, Stream]),
        );
        grants.insert(
            "client2".to_string(),
            Permissions::grant(&[Start, Stop, Stream]),
        );
        Self { grants }
    }

    /// Whether `client` is granted `op`. Unknown clients (including the
    /// empty identity) are granted nothing.
    #[must_use]
    pub fn allows(&self, client: &str, op: Operation) -> bool {
        self.grants.get(client).is_some_and(|p| p.allows(op))
    }

    /// Number of known clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Whether the table grants nothing to anyone.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
