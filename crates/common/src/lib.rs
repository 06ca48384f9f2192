//! Shared types for the distributed transaction services.

pub mod amount;
pub mod result;
pub mod types;

pub use amount::{Amount, ParseAmountError};
pub use result::{CommonResult, ErrorCode};
pub use types::{BranchId, InvalidXid, OrderId, Xid};
