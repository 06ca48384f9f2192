//! Product rows owned by the storage service.

use common::Amount;
use serde::{Deserialize, Serialize};
use tx_store::Row;

use crate::{DomainError, Resource, Result};

/// A product with its remaining stock.
///
/// Invariant: `stock >= 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: Amount,
    pub stock: i64,
}

impl Product {
    /// Creates a product.
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Amount, stock: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            stock,
        }
    }
}

impl Row for Product {
    fn kind() -> &'static str {
        "storage"
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Resource for Product {
    fn decrease(&self, amount: Amount) -> Result<Self> {
        if !amount.is_positive() {
            return Err(DomainError::validation(format!(
                "count must be positive, got {amount}"
            )));
        }
        let Some(count) = amount.whole_units() else {
            return Err(DomainError::validation(format!(
                "count must be a whole number, got {amount}"
            )));
        };
        if count > self.stock {
            return Err(DomainError::Insufficient {
                what: "stock",
                requested: count.to_string(),
                available: self.stock.to_string(),
            });
        }

        Ok(Self {
            stock: self.stock - count,
            ..self.clone()
        })
    }
}
