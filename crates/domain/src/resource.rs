use common::Amount;
use tx_store::Row;

use crate::Result;

/// A business row that branch work can decrease.
///
/// `decrease` is pure: it validates the request against the current row and
/// returns the row as it should be written, leaving persistence to the store.
pub trait Resource: Row {
    /// Returns the row after taking `amount` from it.
    fn decrease(&self, amount: Amount) -> Result<Self>;
}
