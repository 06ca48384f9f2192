//! Transaction context carried explicitly through every branch call.

use common::Xid;
use thiserror::Error;

/// Starts a new global transaction id.
pub fn begin() -> Xid {
    Xid::generate()
}

/// Raised when a context that already belongs to one transaction is bound to another.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("context is bound to transaction {bound}, cannot bind {requested}")]
pub struct ContextConflictError {
    pub bound: Xid,
    pub requested: Xid,
}

/// Execution context of one call.
///
/// A context without an xid describes plain local work. With an xid, all
/// work done under it belongs to that global transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxContext {
    xid: Option<Xid>,
}

impl TxContext {
    /// Creates a context for local work outside any transaction.
    pub fn local() -> Self {
        Self::default()
    }

    /// Creates a context bound to `xid`.
    pub fn with_xid(xid: Xid) -> Self {
        Self { xid: Some(xid) }
    }

    /// Binds the context to `xid`.
    ///
    /// Binding the xid the context already carries is a no-op. Nested
    /// transactions are not supported, so a different xid is a conflict.
    pub fn bind(&mut self, xid: Xid) -> Result<(), ContextConflictError> {
        match &self.xid {
            Some(bound) if *bound != xid => Err(ContextConflictError {
                bound: bound.clone(),
                requested: xid,
            }),
            Some(_) => Ok(()),
            None => {
                self.xid = Some(xid);
                Ok(())
            }
        }
    }

    /// Returns the bound xid, if any.
    pub fn current(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    /// Removes the binding and returns it.
    pub fn unbind(&mut self) -> Option<Xid> {
        self.xid.take()
    }

    /// Returns true if the context belongs to a global transaction.
    pub fn in_transaction(&self) -> bool {
        self.xid.is_some()
    }
}
