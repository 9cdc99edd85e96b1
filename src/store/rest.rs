//! REST order store for the hosted backend.
//!
//! The order table lives behind a PostgREST-style endpoint. Conditional
//! semantics are expressed as row filters on the update itself:
//!
//! - the external-id attach filters on `external_order_id=is.null`, so the
//!   compare-and-set happens inside the database, not as read-then-write;
//! - status writes filter on the set of legal `from` states, so a racing
//!   administrative override wins and the stale write touches zero rows.
//!
//! `Prefer: return=representation` makes every update report the rows it
//! actually touched, which is how zero-row writes are detected.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{clamp_remains, AttachOutcome, OrderStore, StatusUpdate};
use crate::error::WorkerError;
use crate::orders::{Order, OrderId, OrderStatus};

/// Order store backed by a PostgREST endpoint.
pub struct RestStore {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl RestStore {
    /// Build a store for `{base_url}/orders`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn orders_url(&self) -> String {
        format!("{}/orders", self.base_url)
    }

    fn storage_err(context: &str, e: impl std::fmt::Display) -> WorkerError {
        WorkerError::StorageUnavailable(format!("{context}: {e}"))
    }

    /// GET rows matching the given PostgREST filters.
    async fn select(&self, filters: &[(&str, &str)]) -> Result<Vec<Order>, WorkerError> {
        let response = self
            .client
            .get(self.orders_url())
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .query(filters)
            .send()
            .await
            .map_err(|e| Self::storage_err("order select failed", e))?;

        if !response.status().is_success() {
            return Err(WorkerError::StorageUnavailable(format!(
                "order select returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Vec<Order>>()
            .await
            .map_err(|e| Self::storage_err("order select returned malformed rows", e))
    }

    /// PATCH rows matching `filters`, returning the rows actually updated.
    async fn update(
        &self,
        filters: &[(&str, &str)],
        body: serde_json::Value,
    ) -> Result<Vec<Order>, WorkerError> {
        let response = self
            .client
            .patch(self.orders_url())
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation")
            .query(filters)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::storage_err("order update failed", e))?;

        if !response.status().is_success() {
            return Err(WorkerError::StorageUnavailable(format!(
                "order update returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Vec<Order>>()
            .await
            .map_err(|e| Self::storage_err("order update returned malformed rows", e))
    }

    async fn first_match(&self, filters: &[(&str, &str)]) -> Result<Option<Order>, WorkerError> {
        let mut rows = self.select(filters).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }
}

/// PostgREST `in.(...)` filter over the states that may legally move to `to`.
fn legal_from_filter(to: OrderStatus) -> String {
    let froms: Vec<String> = [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Failed,
    ]
    .iter()
    .filter(|from| from.can_transition(to))
    .map(|from| from.to_string())
    .collect();
    format!("in.({})", froms.join(","))
}

#[async_trait]
impl OrderStore for RestStore {
    async fn get_by_id(&self, id: &OrderId) -> Result<Order, WorkerError> {
        let id_filter = format!("eq.{}", id.as_str());
        self.first_match(&[("id", id_filter.as_str())])
            .await?
            .ok_or_else(|| WorkerError::NotFound(id.clone()))
    }

    async fn get_by_external_id(&self, external_order_id: &str) -> Result<Order, WorkerError> {
        let ext_filter = format!("eq.{external_order_id}");
        self.first_match(&[("external_order_id", ext_filter.as_str())])
            .await?
            .ok_or_else(|| WorkerError::NotFound(OrderId::new(external_order_id)))
    }

    async fn list_active(&self) -> Result<Vec<Order>, WorkerError> {
        self.select(&[
            ("status", "in.(pending,processing)"),
            ("external_order_id", "not.is.null"),
            ("order", "id.asc"),
        ])
        .await
    }

    async fn attach_external_id(
        &self,
        id: &OrderId,
        external_order_id: &str,
    ) -> Result<AttachOutcome, WorkerError> {
        let id_filter = format!("eq.{}", id.as_str());
        let updated = self
            .update(
                &[
                    ("id", id_filter.as_str()),
                    ("external_order_id", "is.null"),
                ],
                json!({
                    "external_order_id": external_order_id,
                    "status": OrderStatus::Processing,
                    "updated_at": chrono::Utc::now(),
                }),
            )
            .await?;

        if !updated.is_empty() {
            info!(
                order_id = %id,
                external_order_id,
                "external id attached, order moved to processing"
            );
            return Ok(AttachOutcome::Attached);
        }

        // Zero rows: either the row is missing or the id is already set.
        let existing = self.get_by_id(id).await?;
        debug!(
            order_id = %id,
            existing = existing.external_order_id.as_deref().unwrap_or_default(),
            "external id already attached, conditional write was a no-op"
        );
        Ok(AttachOutcome::AlreadyAttached)
    }

    async fn apply_status(
        &self,
        id: &OrderId,
        update: StatusUpdate,
    ) -> Result<Order, WorkerError> {
        // Need the quantity for the remains clamp; a stale read here is fine
        // because quantity is immutable.
        let current = self.get_by_id(id).await?;
        let remains = clamp_remains(id, update.remains, current.quantity);

        let mut body = json!({
            "status": update.status,
            "updated_at": update.updated_at,
        });
        if let Some(start_count) = update.start_count {
            body["start_count"] = json!(start_count);
        }
        if let Some(remains) = remains {
            body["remains"] = json!(remains);
        }

        let id_filter = format!("eq.{}", id.as_str());
        let from_filter = legal_from_filter(update.status);
        let mut updated = self
            .update(
                &[
                    ("id", id_filter.as_str()),
                    ("status", from_filter.as_str()),
                ],
                body,
            )
            .await?;

        if let Some(order) = updated.pop() {
            info!(
                order_id = %id,
                new_status = %order.status,
                start_count = ?order.start_count,
                remains = ?order.remains,
                "order status applied"
            );
            return Ok(order);
        }

        // Zero rows: distinguish a vanished row from a lifecycle conflict.
        let current = self.get_by_id(id).await?;
        Err(WorkerError::IllegalTransition {
            order_id: id.clone(),
            from: current.status,
            to: update.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_from_filter_for_completed() {
        // pending, processing, and completed itself may write completed
        assert_eq!(
            legal_from_filter(OrderStatus::Completed),
            "in.(pending,processing,completed)"
        );
    }

    #[test]
    fn test_legal_from_filter_for_processing() {
        // terminal states never accept processing
        assert_eq!(
            legal_from_filter(OrderStatus::Processing),
            "in.(pending,processing)"
        );
    }

    #[test]
    fn test_legal_from_filter_for_pending() {
        assert_eq!(legal_from_filter(OrderStatus::Pending), "in.(pending)");
    }
}
