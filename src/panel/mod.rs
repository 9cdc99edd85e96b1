//! Provider Adapter for the external SMM panel.
//!
//! The panel speaks a fixed form-encoded HTTP protocol and a loose
//! string-typed vocabulary. This module owns both: the [`PanelClient`] trait
//! is the seam the engine depends on, and the normalization functions here
//! collapse the panel's strings into the internal [`OrderStatus`] enum.
//!
//! New panels can be added by implementing [`PanelClient`] without touching
//! the engine.

mod client;

pub use client::HttpPanelClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::orders::OrderStatus;

/// Typed result of a panel `status` call, after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelOrderStatus {
    /// Normalized lifecycle state
    pub status: OrderStatus,
    /// Engagement count at panel pickup, when the panel reports one
    pub start_count: Option<u32>,
    /// Undelivered units, when the panel reports them
    pub remains: Option<u32>,
    /// Amount charged, when parseable
    pub charge: Option<Decimal>,
}

/// Operations the engine needs from a panel.
///
/// Implementations hold no state beyond configuration and are safe to call
/// concurrently. This panel offers no batched status call, so the engine
/// composes bulk status checks from single `status` calls.
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Submit an order; returns the panel-assigned external order id.
    async fn submit(
        &self,
        service_id: &str,
        link: &str,
        quantity: u32,
    ) -> Result<String, WorkerError>;

    /// Fetch per-order progress for a previously submitted order.
    async fn status(&self, external_order_id: &str) -> Result<PanelOrderStatus, WorkerError>;
}

/// Raw panel response to `action=add`.
#[derive(Debug, Deserialize)]
pub(crate) struct RawSubmitResponse {
    pub order: Option<serde_json::Value>,
    #[serde(default)]
    pub success: bool,
}

/// Raw panel response to `action=status`. All numeric fields arrive as strings.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct RawStatusResponse {
    #[serde(default)]
    pub charge: Option<String>,
    #[serde(default)]
    pub start_count: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub remains: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Collapse a panel status label into the internal enum.
///
/// Unknown labels map to `processing`: the panel adding a new vocabulary
/// word must never invent a terminal transition on our side. `Partial`
/// counts as completed only once nothing remains undelivered.
pub fn normalize_status(raw: &str, remains: Option<u32>) -> OrderStatus {
    match raw.trim() {
        "Completed" => OrderStatus::Completed,
        "Canceled" | "Cancelled" => OrderStatus::Cancelled,
        "In progress" | "Processing" | "Pending" => OrderStatus::Processing,
        "Partial" => {
            if remains == Some(0) {
                OrderStatus::Completed
            } else {
                OrderStatus::Processing
            }
        }
        _ => OrderStatus::Processing,
    }
}

/// Lenient string-to-integer parse for panel counters.
///
/// The panel serializes every number as a string and sometimes sends empty
/// or garbage values; those become absent, never zero.
pub fn parse_count(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|s| s.trim().parse::<u32>().ok())
}

/// Lenient money parse for the panel `charge` field.
pub fn parse_charge(raw: Option<&str>) -> Option<Decimal> {
    raw.and_then(|s| s.trim().parse::<Decimal>().ok())
}

impl RawStatusResponse {
    /// Normalize the raw wire payload into typed fields.
    pub(crate) fn normalize(&self) -> PanelOrderStatus {
        let remains = parse_count(self.remains.as_deref());
        let status = normalize_status(self.status.as_deref().unwrap_or_default(), remains);
        PanelOrderStatus {
            status,
            start_count: parse_count(self.start_count.as_deref()),
            remains,
            charge: parse_charge(self.charge.as_deref()),
        }
    }
}
