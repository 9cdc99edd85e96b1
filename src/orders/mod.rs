//! Order domain types.
//!
//! The order records themselves are externally owned; the worker only reads
//! and writes the fields involved in panel reconciliation. This module holds
//! the typed view of those fields plus the status lifecycle.

mod types;

pub use types::{Order, OrderId, OrderStatus, ServiceType};
