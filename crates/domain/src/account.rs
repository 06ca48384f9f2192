//! Account rows owned by the account service.

use common::Amount;
use serde::{Deserialize, Serialize};
use tx_store::Row;

use crate::{DomainError, Resource, Result};

/// A user's account balance.
///
/// Invariant: `residue == total - used` and `residue >= 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: String,
    pub total: Amount,
    pub used: Amount,
    pub residue: Amount,
}

impl Account {
    /// Opens an account with nothing used yet.
    pub fn open(user_id: impl Into<String>, total: Amount) -> Self {
        Self {
            user_id: user_id.into(),
            total,
            used: Amount::zero(),
            residue: total,
        }
    }

    /// Returns true if the balance columns agree with each other.
    pub fn is_consistent(&self) -> bool {
        self.total.checked_sub(self.used) == Some(self.residue) && !self.residue.is_negative()
    }
}

impl Row for Account {
    fn kind() -> &'static str {
        "account"
    }

    fn key(&self) -> String {
        self.user_id.clone()
    }
}

impl Resource for Account {
    fn decrease(&self, amount: Amount) -> Result<Self> {
        if !amount.is_positive() {
            return Err(DomainError::validation(format!(
                "money must be positive, got {amount}"
            )));
        }
        if amount > self.residue {
            return Err(DomainError::Insufficient {
                what: "balance",
                requested: amount.to_string(),
                available: self.residue.to_string(),
            });
        }

        let overflow = || DomainError::validation(format!("money {amount} is out of range"));
        Ok(Self {
            user_id: self.user_id.clone(),
            total: self.total,
            used: self.used.checked_add(amount).ok_or_else(overflow)?,
            residue: self.residue.checked_sub(amount).ok_or_else(overflow)?,
        })
    }
}
