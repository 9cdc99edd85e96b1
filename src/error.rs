//! Closed error set for the reconciliation worker.
//!
//! Every fallible path in the worker resolves to one of these kinds so the
//! HTTP layer can map them to status codes and the sweep can decide what is
//! transient (log and skip) versus what must surface to the caller.

use thiserror::Error;

use crate::orders::OrderId;

/// Errors that can occur anywhere in the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Caller's bearer token is missing or rejected by the identity provider
    #[error("unauthorized")]
    Unauthorized,

    /// Request body or query parameters could not be understood
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No panel service id is configured for the requested service type
    #[error("unsupported service type: {0}")]
    UnsupportedService(String),

    /// Panel accepted the request but refused the order (success=false or no id)
    #[error("panel rejected order: {0}")]
    ProviderRejected(String),

    /// Network or HTTP-level failure talking to the panel
    #[error("panel transport error: {message}")]
    Transport {
        message: String,
        /// True when the panel signalled rate limiting (HTTP 429 or body marker)
        rate_limited: bool,
    },

    /// Panel returned a body we could not parse
    #[error("panel protocol violation: {0}")]
    ProtocolViolation(String),

    /// Order store backend fault
    #[error("order store unavailable: {0}")]
    StorageUnavailable(String),

    /// Attempted status change that would move backwards through the lifecycle
    #[error("illegal transition for order {order_id}: {from} -> {to}")]
    IllegalTransition {
        order_id: OrderId,
        from: crate::orders::OrderStatus,
        to: crate::orders::OrderStatus,
    },

    /// Order not present in the store
    #[error("order not found: {0}")]
    NotFound(OrderId),

    /// Any uncaught case
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Transport error helper for non-rate-limited failures.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            rate_limited: false,
        }
    }

    /// True when retrying the same call later could plausibly succeed.
    ///
    /// The sweep skips these and revisits the order on the next pass; the
    /// single-order paths surface them as 500 so the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ProtocolViolation(_) | Self::StorageUnavailable(_)
        )
    }

    /// True when the panel asked us to back off before retrying.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Transport { rate_limited: true, .. })
    }

    /// HTTP status code for the request handler.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest(_) | Self::UnsupportedService(_) => 400,
            Self::NotFound(_) => 404,
            Self::ProviderRejected(_) => 422,
            Self::Transport { .. }
            | Self::ProtocolViolation(_)
            | Self::StorageUnavailable(_)
            | Self::IllegalTransition { .. }
            | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(WorkerError::Unauthorized.status_code(), 401);
        assert_eq!(WorkerError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(
            WorkerError::UnsupportedService("points".into()).status_code(),
            400
        );
        assert_eq!(
            WorkerError::NotFound(OrderId::new("o1")).status_code(),
            404
        );
        assert_eq!(
            WorkerError::ProviderRejected("no".into()).status_code(),
            422
        );
        assert_eq!(WorkerError::transport("boom").status_code(), 500);
    }

    #[test]
    fn test_transient_classification() {
        assert!(WorkerError::transport("timeout").is_transient());
        assert!(WorkerError::ProtocolViolation("not json".into()).is_transient());
        assert!(WorkerError::StorageUnavailable("db down".into()).is_transient());
        assert!(!WorkerError::Unauthorized.is_transient());
        assert!(!WorkerError::ProviderRejected("no".into()).is_transient());
    }

    #[test]
    fn test_rate_limited_flag() {
        let err = WorkerError::Transport {
            message: "429".into(),
            rate_limited: true,
        };
        assert!(err.is_rate_limited());
        assert!(!WorkerError::transport("timeout").is_rate_limited());
    }
}
