//! Order Store Gateway.
//!
//! Decouples the engine from the storage backend: the engine only ever sees
//! [`OrderStore`], so it is testable against [`MemoryStore`] and deployable
//! against the hosted REST backend ([`RestStore`]).

mod memory;
mod rest;

pub use memory::MemoryStore;
pub use rest::RestStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::WorkerError;
use crate::orders::{Order, OrderId, OrderStatus};

/// Result of the conditional external-id write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// This call won: the id is now set and the order is `processing`
    Attached,
    /// Another submission already set an external id; nothing was written
    AlreadyAttached,
}

/// Fields written back after a panel status poll.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: OrderStatus,
    pub start_count: Option<u32>,
    pub remains: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Build an update stamped with the current time.
    pub fn now(status: OrderStatus, start_count: Option<u32>, remains: Option<u32>) -> Self {
        Self {
            status,
            start_count,
            remains,
            updated_at: Utc::now(),
        }
    }
}

/// Read/write facade onto the external order table.
///
/// All operations fail with `StorageUnavailable` on backend faults.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Fetch a single order.
    async fn get_by_id(&self, id: &OrderId) -> Result<Order, WorkerError>;

    /// Look an order up by its panel-assigned id.
    async fn get_by_external_id(&self, external_order_id: &str) -> Result<Order, WorkerError>;

    /// Every order with `status IN (pending, processing)` and an external id
    /// set. Ordering is unspecified but stable within a call.
    async fn list_active(&self) -> Result<Vec<Order>, WorkerError>;

    /// Atomically set `external_order_id` if and only if it is currently
    /// unset, moving the order to `processing`.
    ///
    /// This compare-and-set is the only cross-operation synchronization in
    /// the system; it is what makes duplicate submits harmless.
    async fn attach_external_id(
        &self,
        id: &OrderId,
        external_order_id: &str,
    ) -> Result<AttachOutcome, WorkerError>;

    /// Write status and counters, refusing lifecycle back-transitions with
    /// `IllegalTransition` (nothing is mutated in that case). Returns the
    /// order as persisted.
    async fn apply_status(
        &self,
        id: &OrderId,
        update: StatusUpdate,
    ) -> Result<Order, WorkerError>;
}

/// Clamp a reported `remains` into `0..=quantity`, logging when the panel
/// reports more undelivered units than were purchased.
pub(crate) fn clamp_remains(id: &OrderId, remains: Option<u32>, quantity: u32) -> Option<u32> {
    match remains {
        Some(r) if r > quantity => {
            tracing::warn!(
                order_id = %id,
                remains = r,
                quantity,
                "panel reported remains above purchased quantity, clamping"
            );
            Some(quantity)
        }
        other => other,
    }
}
