//! Core types for panel-backed orders.
//!
//! Provides type-safe order identifiers and the status lifecycle the
//! reconciliation engine enforces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type-safe internal order identifier.
///
/// Uses a newtype wrapper to prevent accidentally mixing internal order ids
/// with panel-assigned external ids (both are opaque strings on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    /// Create a new OrderId from any string-like type.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let s: String = id.into();
        debug_assert!(!s.is_empty(), "OrderId cannot be empty");
        if s.is_empty() {
            tracing::warn!("Creating OrderId with empty string - this may cause tracking issues");
        }
        Self(s)
    }

    /// Get the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner String.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for OrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Engagement service a customer can purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Followers,
    Likes,
    Views,
    Shares,
}

impl ServiceType {
    /// All known service types, in the order of the default panel mapping.
    pub const ALL: [ServiceType; 4] = [
        Self::Followers,
        Self::Likes,
        Self::Views,
        Self::Shares,
    ];
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Followers => write!(f, "followers"),
            Self::Likes => write!(f, "likes"),
            Self::Views => write!(f, "views"),
            Self::Shares => write!(f, "shares"),
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "followers" => Ok(Self::Followers),
            "likes" => Ok(Self::Likes),
            "views" => Ok(Self::Views),
            "shares" => Ok(Self::Shares),
            _ => Err(format!(
                "Unknown service type: {}. Valid options: followers, likes, views, shares",
                s
            )),
        }
    }
}

/// Order lifecycle states.
///
/// The lifecycle is a DAG: `pending -> processing -> {completed, cancelled,
/// failed}`. Back-transitions are never legal; the store refuses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted internally, not yet submitted to the panel
    Pending,
    /// Panel accepted the order and is delivering
    Processing,
    /// Panel delivered everything
    Completed,
    /// Panel (or an operator) cancelled the order
    Cancelled,
    /// Marked failed by administrative override
    Failed,
}

impl OrderStatus {
    /// Returns true if the order is in a terminal state (the sweep ignores it).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Returns true if the order still needs reconciliation.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Whether moving from `self` to `to` is legal under the lifecycle DAG.
    ///
    /// Same-state writes are legal: they refresh counters without advancing
    /// the lifecycle. Terminal states accept nothing but themselves.
    pub fn can_transition(&self, to: OrderStatus) -> bool {
        if *self == to {
            return true;
        }
        match self {
            Self::Pending => true,
            Self::Processing => to.is_terminal(),
            Self::Completed | Self::Cancelled | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The reconciliation-relevant view of an order row.
///
/// `quantity` is the purchased amount; `start_count` and `remains` arrive
/// from the panel and stay absent until it reports them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Internal identifier (stable, externally assigned)
    pub id: OrderId,
    /// Which engagement service was purchased
    pub service_type: ServiceType,
    /// Absolute URL the engagement targets
    pub target_url: String,
    /// Purchased amount (positive)
    pub quantity: u32,
    /// Panel-assigned id; absent until submit succeeds, then immutable
    pub external_order_id: Option<String>,
    /// Lifecycle state
    pub status: OrderStatus,
    /// Target's engagement count at panel pickup
    pub start_count: Option<u32>,
    /// Units still undelivered; reaches 0 at completion
    pub remains: Option<u32>,
    /// Refreshed on every mutation, non-decreasing
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a freshly accepted order in `pending` with no external id.
    #[must_use]
    pub fn new(
        id: OrderId,
        service_type: ServiceType,
        target_url: impl Into<String>,
        quantity: u32,
    ) -> Self {
        Self {
            id,
            service_type,
            target_url: target_url.into(),
            quantity,
            external_order_id: None,
            status: OrderStatus::Pending,
            start_count: None,
            remains: None,
            updated_at: Utc::now(),
        }
    }

    /// True when the sweep should visit this order.
    pub fn is_sweepable(&self) -> bool {
        self.status.is_active() && self.external_order_id.is_some()
    }
}
