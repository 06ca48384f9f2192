use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one global transaction (saga instance).
///
/// The value is opaque to every participant. The coordinator generates it
/// once per saga and it travels with every branch call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Xid(String);

impl Xid {
    /// Generates a fresh random XID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parses an XID received from another service.
    ///
    /// Surrounding whitespace is ignored; blank values are rejected.
    pub fn parse(value: &str) -> Result<Self, InvalidXid> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidXid);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the XID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Xid {
    type Error = InvalidXid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Xid> for String {
    fn from(xid: Xid) -> Self {
        xid.0
    }
}

/// Error returned when an XID is blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transaction id must not be empty")]
pub struct InvalidXid;

/// Identifier of one branch inside a global transaction.
///
/// Allocated by the coordinator, starting at 1 and increasing with every
/// branch call of the same transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BranchId(i64);

impl BranchId {
    /// The first branch id of a transaction.
    pub fn first() -> Self {
        Self(1)
    }

    /// Creates a branch id from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the following branch id.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BranchId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Unique identifier for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Creates a new random order ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an order ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OrderId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
