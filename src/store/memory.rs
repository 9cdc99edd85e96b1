//! In-memory order store.
//!
//! Backs the test suite and the dev/standalone mode. The conditional write
//! runs under the map's write lock, which gives it the same atomicity the
//! REST backend gets from its filtered update.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{clamp_remains, AttachOutcome, OrderStore, StatusUpdate};
use crate::error::WorkerError;
use crate::orders::{Order, OrderId, OrderStatus};

/// Thread-safe in-memory order map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an order row (seeding for tests and dev mode).
    pub async fn insert(&self, order: Order) {
        let mut orders = self.orders.write().await;
        orders.insert(order.id.clone(), order);
    }

    /// Number of stored orders.
    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn get_by_id(&self, id: &OrderId) -> Result<Order, WorkerError> {
        let orders = self.orders.read().await;
        orders
            .get(id)
            .cloned()
            .ok_or_else(|| WorkerError::NotFound(id.clone()))
    }

    async fn get_by_external_id(&self, external_order_id: &str) -> Result<Order, WorkerError> {
        let orders = self.orders.read().await;
        orders
            .values()
            .find(|o| o.external_order_id.as_deref() == Some(external_order_id))
            .cloned()
            .ok_or_else(|| WorkerError::NotFound(OrderId::new(external_order_id)))
    }

    async fn list_active(&self) -> Result<Vec<Order>, WorkerError> {
        let orders = self.orders.read().await;
        let mut active: Vec<Order> = orders
            .values()
            .filter(|o| o.is_sweepable())
            .cloned()
            .collect();
        // HashMap iteration order is not stable across calls; sort for the
        // "stable within a call" contract and deterministic tests.
        active.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(active)
    }

    async fn attach_external_id(
        &self,
        id: &OrderId,
        external_order_id: &str,
    ) -> Result<AttachOutcome, WorkerError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(id)
            .ok_or_else(|| WorkerError::NotFound(id.clone()))?;

        if order.external_order_id.is_some() {
            debug!(
                order_id = %id,
                existing = order.external_order_id.as_deref().unwrap_or_default(),
                "external id already attached, conditional write is a no-op"
            );
            return Ok(AttachOutcome::AlreadyAttached);
        }

        order.external_order_id = Some(external_order_id.to_string());
        order.status = OrderStatus::Processing;
        order.updated_at = chrono::Utc::now();

        info!(
            order_id = %id,
            external_order_id,
            "external id attached, order moved to processing"
        );
        Ok(AttachOutcome::Attached)
    }

    async fn apply_status(
        &self,
        id: &OrderId,
        update: StatusUpdate,
    ) -> Result<Order, WorkerError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(id)
            .ok_or_else(|| WorkerError::NotFound(id.clone()))?;

        if !order.status.can_transition(update.status) {
            return Err(WorkerError::IllegalTransition {
                order_id: id.clone(),
                from: order.status,
                to: update.status,
            });
        }

        let old_status = order.status;
        order.status = update.status;
        if let Some(start_count) = update.start_count {
            order.start_count = Some(start_count);
        }
        if let Some(remains) = clamp_remains(id, update.remains, order.quantity) {
            order.remains = Some(remains);
        }
        // updated_at is monotone per order even if the caller's clock lags
        if update.updated_at > order.updated_at {
            order.updated_at = update.updated_at;
        }

        info!(
            order_id = %id,
            old_status = %old_status,
            new_status = %order.status,
            start_count = ?order.start_count,
            remains = ?order.remains,
            "order status applied"
        );
        Ok(order.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::ServiceType;

    fn pending_order(id: &str) -> Order {
        Order::new(
            OrderId::new(id),
            ServiceType::Likes,
            "https://tiktok.com/@a/video/1",
            500,
        )
    }

    #[tokio::test]
    async fn test_attach_is_conditional() {
        let store = MemoryStore::new();
        store.insert(pending_order("o1")).await;

        let id = OrderId::new("o1");
        let first = store.attach_external_id(&id, "9001").await.unwrap();
        assert_eq!(first, AttachOutcome::Attached);

        let second = store.attach_external_id(&id, "9004").await.unwrap();
        assert_eq!(second, AttachOutcome::AlreadyAttached);

        let order = store.get_by_id(&id).await.unwrap();
        assert_eq!(order.external_order_id.as_deref(), Some("9001"));
        assert_eq!(order.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_apply_status_refuses_back_transitions() {
        let store = MemoryStore::new();
        store.insert(pending_order("o1")).await;
        let id = OrderId::new("o1");
        store.attach_external_id(&id, "9001").await.unwrap();

        store
            .apply_status(&id, StatusUpdate::now(OrderStatus::Completed, None, Some(0)))
            .await
            .unwrap();

        let err = store
            .apply_status(&id, StatusUpdate::now(OrderStatus::Processing, None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::IllegalTransition { .. }));

        // The refused write mutated nothing
        let order = store.get_by_id(&id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.remains, Some(0));
    }

    #[tokio::test]
    async fn test_apply_status_is_idempotent() {
        let store = MemoryStore::new();
        store.insert(pending_order("o1")).await;
        let id = OrderId::new("o1");
        store.attach_external_id(&id, "9001").await.unwrap();

        let update = StatusUpdate::now(OrderStatus::Processing, Some(120), Some(400));
        let first = store.apply_status(&id, update.clone()).await.unwrap();
        let second = store.apply_status(&id, update).await.unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.start_count, second.start_count);
        assert_eq!(first.remains, second.remains);
    }

    #[tokio::test]
    async fn test_counters_are_preserved_when_absent() {
        let store = MemoryStore::new();
        store.insert(pending_order("o1")).await;
        let id = OrderId::new("o1");
        store.attach_external_id(&id, "9001").await.unwrap();

        store
            .apply_status(
                &id,
                StatusUpdate::now(OrderStatus::Processing, Some(120), Some(400)),
            )
            .await
            .unwrap();

        // A later poll without counters must not erase the known ones
        let order = store
            .apply_status(&id, StatusUpdate::now(OrderStatus::Processing, None, None))
            .await
            .unwrap();
        assert_eq!(order.start_count, Some(120));
        assert_eq!(order.remains, Some(400));
    }

    #[tokio::test]
    async fn test_list_active_requires_external_id() {
        let store = MemoryStore::new();
        store.insert(pending_order("o1")).await;
        store.insert(pending_order("o2")).await;
        store
            .attach_external_id(&OrderId::new("o2"), "9002")
            .await
            .unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "o2");
    }

    #[tokio::test]
    async fn test_list_active_skips_terminal() {
        let store = MemoryStore::new();
        for id in ["o1", "o2"] {
            store.insert(pending_order(id)).await;
            store
                .attach_external_id(&OrderId::new(id), &format!("x-{id}"))
                .await
                .unwrap();
        }
        store
            .apply_status(
                &OrderId::new("o1"),
                StatusUpdate::now(OrderStatus::Completed, None, Some(0)),
            )
            .await
            .unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "o2");
    }

    #[tokio::test]
    async fn test_remains_clamped_to_quantity() {
        let store = MemoryStore::new();
        store.insert(pending_order("o1")).await;
        let id = OrderId::new("o1");
        store.attach_external_id(&id, "9001").await.unwrap();

        let order = store
            .apply_status(
                &id,
                StatusUpdate::now(OrderStatus::Processing, None, Some(9999)),
            )
            .await
            .unwrap();
        assert_eq!(order.remains, Some(order.quantity));
    }
}
