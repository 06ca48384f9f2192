//! Domain layer for the order-placement demo.
//!
//! This crate provides the business rows owned by each service:
//! - `Product` (storage service) and `Account` (account service), both
//!   implementing [`Resource`] so a generic resource manager can decrease them
//! - `Order` (order service) with its `OrderStatus` state machine and the
//!   `OrderService` that creates and finalizes orders

pub mod account;
pub mod error;
pub mod order;
pub mod product;
pub mod resource;

pub use account::Account;
pub use error::{DomainError, Result};
pub use order::{NewOrder, Order, OrderService, OrderStatus};
pub use product::Product;
pub use resource::Resource;
