//! Reconciliation engine.
//!
//! Orchestrates the three operations the worker exposes: submitting accepted
//! orders to the panel, polling a single order, and sweeping every active
//! order with bounded concurrency and pacing. The engine owns the lifecycle
//! decisions; the panel and store adapters stay mechanical.

mod backoff;

pub use backoff::BackoffPolicy;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::metrics;
use crate::orders::{OrderId, OrderStatus, ServiceType};
use crate::panel::{PanelClient, PanelOrderStatus};
use crate::store::{AttachOutcome, OrderStore, StatusUpdate};

/// How long a duplicate `create_order` call waits for the in-flight
/// submission on the same order before giving up.
const PEER_SUBMIT_WAIT: Duration = Duration::from_secs(30);
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Engine tuning. Defaults match the worker's documented behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Internal service type -> panel service id
    pub service_map: HashMap<ServiceType, String>,
    /// Concurrent status requests during a sweep (W)
    pub sweep_workers: usize,
    /// Delay between successive requests on the same worker (P)
    pub sweep_pacing: Duration,
    /// Overall sweep budget; orders not started by then wait for the next sweep
    pub sweep_budget: Duration,
    /// Rate-limit backoff schedule
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_map: default_service_map(),
            sweep_workers: 8,
            sweep_pacing: Duration::from_millis(100),
            sweep_budget: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The operator-overridable default panel mapping.
pub fn default_service_map() -> HashMap<ServiceType, String> {
    HashMap::from([
        (ServiceType::Followers, "1".to_string()),
        (ServiceType::Likes, "2".to_string()),
        (ServiceType::Views, "3".to_string()),
        (ServiceType::Shares, "4".to_string()),
    ])
}

/// Inputs to the submit path.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(rename = "orderId")]
    pub order_id: OrderId,
    #[serde(rename = "serviceType")]
    pub service_type: ServiceType,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    pub quantity: u32,
}

/// What a single-order poll persisted (plus the unstored charge).
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: OrderStatus,
    pub start_count: Option<u32>,
    pub remains: Option<u32>,
    pub charge: Option<Decimal>,
}

/// Aggregate outcome of one sweep.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SweepReport {
    /// Orders for which a status request was issued
    pub attempted: usize,
    /// Polls whose result was persisted
    pub succeeded: usize,
    /// Polls recorded as failed (the order is revisited next sweep)
    pub failed: usize,
    /// Wall-clock sweep duration in milliseconds
    pub duration_ms: u64,
}

/// The reconciliation engine.
///
/// Safe to share behind an `Arc`; all state beyond configuration is the
/// submit-coalescing set.
pub struct ReconcileEngine {
    panel: Arc<dyn PanelClient>,
    store: Arc<dyn OrderStore>,
    config: EngineConfig,
    /// Order ids with a provider submission currently in flight
    submits_in_flight: Mutex<HashSet<OrderId>>,
}

impl ReconcileEngine {
    pub fn new(
        panel: Arc<dyn PanelClient>,
        store: Arc<dyn OrderStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            panel,
            store,
            config,
            submits_in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Submit path (`create_order`).
    ///
    /// Forwards an internally-accepted `pending` order to the panel and
    /// attaches the returned external id through the store's conditional
    /// write. Provider failures leave the order `pending` and retriable;
    /// nothing is ever marked `failed` here.
    pub async fn create_order(&self, req: CreateOrderRequest) -> Result<String, WorkerError> {
        let service_id = self
            .config
            .service_map
            .get(&req.service_type)
            .cloned()
            .ok_or_else(|| WorkerError::UnsupportedService(req.service_type.to_string()))?;

        // Already-submitted orders short-circuit to the attached id.
        let order = self.store.get_by_id(&req.order_id).await?;
        if let Some(external_id) = order.external_order_id {
            debug!(order_id = %req.order_id, external_id, "order already submitted");
            return Ok(external_id);
        }

        if !self.begin_submit(&req.order_id).await {
            // A concurrent call owns the provider submission; wait for its
            // outcome instead of issuing a second one.
            return self.await_peer_submit(&req.order_id).await;
        }

        let result = self.submit_and_attach(&req, &service_id).await;
        self.end_submit(&req.order_id).await;
        metrics::record_submit(req.service_type, result.is_ok());
        result
    }

    async fn submit_and_attach(
        &self,
        req: &CreateOrderRequest,
        service_id: &str,
    ) -> Result<String, WorkerError> {
        let external_id = self
            .panel
            .submit(service_id, &req.target_url, req.quantity)
            .await
            .map_err(|e| {
                // Stays pending: a transient transport error must be retriable
                warn!(order_id = %req.order_id, error = %e, "panel submit failed, order stays pending");
                e
            })?;

        match self
            .store
            .attach_external_id(&req.order_id, &external_id)
            .await?
        {
            AttachOutcome::Attached => Ok(external_id),
            AttachOutcome::AlreadyAttached => {
                // Another invocation won the race. Its id is persisted; ours
                // exists only on the panel side. Record the leak for
                // operators and report the persisted id.
                warn!(
                    order_id = %req.order_id,
                    leaked_external_id = %external_id,
                    "duplicate submission lost the attach race; panel order is untracked"
                );
                let order = self.store.get_by_id(&req.order_id).await?;
                order.external_order_id.ok_or_else(|| {
                    WorkerError::Internal(format!(
                        "order {} reported AlreadyAttached but has no external id",
                        req.order_id
                    ))
                })
            }
        }
    }

    /// Try to claim the submission slot for this order id.
    async fn begin_submit(&self, id: &OrderId) -> bool {
        let mut in_flight = self.submits_in_flight.lock().await;
        in_flight.insert(id.clone())
    }

    async fn end_submit(&self, id: &OrderId) {
        let mut in_flight = self.submits_in_flight.lock().await;
        in_flight.remove(id);
    }

    /// Wait for the concurrent submission on `id` to settle, then report its
    /// outcome from the store.
    async fn await_peer_submit(&self, id: &OrderId) -> Result<String, WorkerError> {
        debug!(order_id = %id, "coalescing duplicate submit onto in-flight call");
        let deadline = Instant::now() + PEER_SUBMIT_WAIT;

        loop {
            {
                let in_flight = self.submits_in_flight.lock().await;
                if !in_flight.contains(id) {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::transport(format!(
                    "timed out waiting for in-flight submission of order {id}"
                )));
            }
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }

        let order = self.store.get_by_id(id).await?;
        order.external_order_id.ok_or_else(|| {
            WorkerError::transport(format!(
                "concurrent submission of order {id} did not attach an external id; retry"
            ))
        })
    }

    /// Poll-one path (`check_status`).
    pub async fn check_status(&self, external_order_id: &str) -> Result<StatusReport, WorkerError> {
        let order = self.store.get_by_external_id(external_order_id).await?;
        let polled = poll_with_backoff(self.panel.as_ref(), self.config.backoff, external_order_id)
            .await?;
        metrics::record_poll(true);

        let persisted = self
            .store
            .apply_status(
                &order.id,
                StatusUpdate::now(polled.status, polled.start_count, polled.remains),
            )
            .await?;

        Ok(StatusReport {
            status: persisted.status,
            start_count: persisted.start_count,
            remains: persisted.remains,
            charge: polled.charge,
        })
    }

    /// Sweep path (`bulk_status_check`).
    ///
    /// Visits every active order at most once with bounded concurrency and
    /// pacing. One failing order never aborts the sweep; results are applied
    /// as they arrive so partial progress survives an expired budget.
    pub async fn sweep(&self) -> Result<SweepReport, WorkerError> {
        let started = Instant::now();
        let orders = self.store.list_active().await?;

        if orders.is_empty() {
            debug!("sweep found no active orders");
            return Ok(SweepReport {
                attempted: 0,
                succeeded: 0,
                failed: 0,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let total = orders.len();
        info!(active_orders = total, workers = self.config.sweep_workers, "sweep started");

        let semaphore = Arc::new(Semaphore::new(self.config.sweep_workers.max(1)));
        let mut tasks: JoinSet<Result<(), WorkerError>> = JoinSet::new();
        let mut attempted = 0usize;

        for order in orders {
            if started.elapsed() >= self.config.sweep_budget {
                warn!(
                    attempted,
                    total,
                    budget_secs = self.config.sweep_budget.as_secs(),
                    "sweep budget exceeded, remaining orders deferred to the next sweep"
                );
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| WorkerError::Internal(format!("sweep semaphore closed: {e}")))?;
            attempted += 1;

            let panel = Arc::clone(&self.panel);
            let store = Arc::clone(&self.store);
            let backoff = self.config.backoff;
            let pacing = self.config.sweep_pacing;

            tasks.spawn(async move {
                let outcome = sweep_one(panel.as_ref(), store.as_ref(), backoff, &order).await;
                // Pace this worker before it picks up its next order
                tokio::time::sleep(pacing).await;
                drop(permit);
                outcome
            });
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(_)) => failed += 1,
                Err(e) => {
                    error!(error = %e, "sweep task panicked");
                    failed += 1;
                }
            }
        }

        let report = SweepReport {
            attempted,
            succeeded,
            failed,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        metrics::record_sweep(&report);
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "sweep finished"
        );
        Ok(report)
    }
}

/// Poll one order and persist the result. Errors are logged here, keyed by
/// order id, so operators can reconcile; the caller just counts them.
async fn sweep_one(
    panel: &dyn PanelClient,
    store: &dyn OrderStore,
    backoff: BackoffPolicy,
    order: &crate::orders::Order,
) -> Result<(), WorkerError> {
    // list_active guarantees the external id is present
    let Some(external_id) = order.external_order_id.as_deref() else {
        warn!(order_id = %order.id, "active order without external id reached the sweep");
        return Err(WorkerError::Internal("active order missing external id".into()));
    };

    let polled = match poll_with_backoff(panel, backoff, external_id).await {
        Ok(polled) => {
            metrics::record_poll(true);
            polled
        }
        Err(e) => {
            metrics::record_poll(false);
            error!(order_id = %order.id, external_id, error = %e, "sweep poll failed");
            return Err(e);
        }
    };

    match store
        .apply_status(
            &order.id,
            StatusUpdate::now(polled.status, polled.start_count, polled.remains),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(WorkerError::IllegalTransition { order_id, from, to }) => {
            // An administrative override moved the order first; it wins and
            // the sweep stops caring about this order.
            warn!(
                order_id = %order_id,
                from = %from,
                to = %to,
                "stale sweep result discarded after administrative transition"
            );
            Ok(())
        }
        Err(e) => {
            error!(order_id = %order.id, error = %e, "sweep status write failed");
            Err(e)
        }
    }
}

/// Call the panel's status endpoint, backing off on rate-limit signals.
async fn poll_with_backoff(
    panel: &dyn PanelClient,
    policy: BackoffPolicy,
    external_order_id: &str,
) -> Result<PanelOrderStatus, WorkerError> {
    let mut attempt = 0u32;
    loop {
        match panel.status(external_order_id).await {
            Err(e) if e.is_rate_limited() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    external_order_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "panel rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::RwLock;

    use crate::orders::Order;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Scripted panel for engine tests: counts calls, injects failures.
    #[derive(Default)]
    struct StubPanel {
        submit_calls: AtomicU32,
        status_calls: AtomicU32,
        submit_results: RwLock<Vec<Result<String, WorkerError>>>,
        status_result: RwLock<Option<PanelOrderStatus>>,
        rate_limited_polls: AtomicU32,
    }

    impl StubPanel {
        async fn push_submit(&self, result: Result<String, WorkerError>) {
            self.submit_results.write().await.push(result);
        }

        async fn set_status(&self, status: PanelOrderStatus) {
            *self.status_result.write().await = Some(status);
        }

        fn processing(start_count: Option<u32>, remains: Option<u32>) -> PanelOrderStatus {
            PanelOrderStatus {
                status: OrderStatus::Processing,
                start_count,
                remains,
                charge: None,
            }
        }
    }

    #[async_trait]
    impl PanelClient for StubPanel {
        async fn submit(&self, _: &str, _: &str, _: u32) -> Result<String, WorkerError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.submit_results.write().await;
            if results.is_empty() {
                Ok("9001".to_string())
            } else {
                results.remove(0)
            }
        }

        async fn status(&self, _: &str) -> Result<PanelOrderStatus, WorkerError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.rate_limited_polls.load(Ordering::SeqCst);
            if remaining > 0 {
                self.rate_limited_polls.store(remaining - 1, Ordering::SeqCst);
                return Err(WorkerError::Transport {
                    message: "429".into(),
                    rate_limited: true,
                });
            }
            self.status_result
                .read()
                .await
                .clone()
                .ok_or_else(|| WorkerError::transport("no scripted status"))
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            sweep_pacing: Duration::ZERO,
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(4),
                max_retries: 3,
            },
            ..EngineConfig::default()
        }
    }

    fn engine_with(panel: Arc<StubPanel>, store: Arc<MemoryStore>) -> ReconcileEngine {
        ReconcileEngine::new(panel, store, fast_config())
    }

    async fn seed_pending(store: &MemoryStore, id: &str) {
        store
            .insert(Order::new(
                OrderId::new(id),
                ServiceType::Likes,
                "https://tiktok.com/@a/video/1",
                500,
            ))
            .await;
    }

    fn likes_request(id: &str) -> CreateOrderRequest {
        CreateOrderRequest {
            order_id: OrderId::new(id),
            service_type: ServiceType::Likes,
            target_url: "https://tiktok.com/@a/video/1".to_string(),
            quantity: 500,
        }
    }

    #[tokio::test]
    async fn test_unsupported_service_is_hard_error() {
        let panel = Arc::new(StubPanel::default());
        let store = Arc::new(MemoryStore::new());
        seed_pending(&store, "o1").await;

        let mut config = fast_config();
        config.service_map.remove(&ServiceType::Likes);
        let engine = ReconcileEngine::new(panel.clone(), store, config);

        let err = engine.create_order(likes_request("o1")).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedService(_)));
        // The panel was never contacted
        assert_eq!(panel.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_failure_leaves_order_pending() {
        let panel = Arc::new(StubPanel::default());
        panel
            .push_submit(Err(WorkerError::transport("connection reset")))
            .await;
        let store = Arc::new(MemoryStore::new());
        seed_pending(&store, "o1").await;
        let engine = engine_with(panel, store.clone());

        let err = engine.create_order(likes_request("o1")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Transport { .. }));

        let order = store.get_by_id(&OrderId::new("o1")).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.external_order_id.is_none());
    }

    #[tokio::test]
    async fn test_resubmit_after_success_is_idempotent() {
        let panel = Arc::new(StubPanel::default());
        let store = Arc::new(MemoryStore::new());
        seed_pending(&store, "o1").await;
        let engine = engine_with(panel.clone(), store);

        let first = engine.create_order(likes_request("o1")).await.unwrap();
        let second = engine.create_order(likes_request("o1")).await.unwrap();
        assert_eq!(first, second);
        // The second call never reached the panel
        assert_eq!(panel.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_coalesce() {
        let panel = Arc::new(StubPanel::default());
        let store = Arc::new(MemoryStore::new());
        seed_pending(&store, "o3").await;
        let engine = Arc::new(engine_with(panel.clone(), store));

        let a = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.create_order(likes_request("o3")).await }
        });
        let b = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.create_order(likes_request("o3")).await }
        });

        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(ra, rb);
        assert_eq!(panel.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_backoff_retries_then_succeeds() {
        let panel = Arc::new(StubPanel::default());
        panel.rate_limited_polls.store(2, Ordering::SeqCst);
        panel
            .set_status(StubPanel::processing(Some(120), Some(400)))
            .await;

        let store = Arc::new(MemoryStore::new());
        seed_pending(&store, "o1").await;
        store
            .attach_external_id(&OrderId::new("o1"), "9001")
            .await
            .unwrap();
        let engine = engine_with(panel.clone(), store);

        let report = engine.check_status("9001").await.unwrap();
        assert_eq!(report.status, OrderStatus::Processing);
        assert_eq!(report.remains, Some(400));
        // 2 rate-limited attempts + 1 success
        assert_eq!(panel.status_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_retries() {
        let panel = Arc::new(StubPanel::default());
        panel.rate_limited_polls.store(10, Ordering::SeqCst);

        let store = Arc::new(MemoryStore::new());
        seed_pending(&store, "o1").await;
        store
            .attach_external_id(&OrderId::new("o1"), "9001")
            .await
            .unwrap();
        let engine = engine_with(panel.clone(), store);

        let err = engine.check_status("9001").await.unwrap_err();
        assert!(err.is_rate_limited());
        // initial attempt + max_retries
        assert_eq!(panel.status_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_check_status_unknown_external_id() {
        let panel = Arc::new(StubPanel::default());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(panel, store);

        let err = engine.check_status("nope").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sweep_empty_store() {
        let panel = Arc::new(StubPanel::default());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(panel, store);

        let report = engine.sweep().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_sweep_swallows_admin_override_conflict() {
        let panel = Arc::new(StubPanel::default());
        // Panel still thinks the order is running
        panel.set_status(StubPanel::processing(None, Some(10))).await;

        let store = Arc::new(MemoryStore::new());
        seed_pending(&store, "o1").await;
        store
            .attach_external_id(&OrderId::new("o1"), "9001")
            .await
            .unwrap();
        // Operator cancels before the sweep's write lands; simulate by
        // cancelling now: the sweep's listing happened conceptually earlier.
        let cancelled = store
            .apply_status(
                &OrderId::new("o1"),
                StatusUpdate::now(OrderStatus::Cancelled, None, None),
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        // Drive the stale poll result directly through the sweep worker
        let order_snapshot = {
            let mut o = Order::new(
                OrderId::new("o1"),
                ServiceType::Likes,
                "https://tiktok.com/@a/video/1",
                500,
            );
            o.external_order_id = Some("9001".to_string());
            o.status = OrderStatus::Processing;
            o
        };
        let result = sweep_one(
            panel.as_ref(),
            store.as_ref(),
            BackoffPolicy::default(),
            &order_snapshot,
        )
        .await;
        assert!(result.is_ok());

        // The override stands
        let order = store.get_by_id(&OrderId::new("o1")).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_sweep_budget_defers_remaining_orders() {
        let panel = Arc::new(StubPanel::default());
        panel.set_status(StubPanel::processing(None, Some(1))).await;

        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            let id = format!("o{i}");
            seed_pending(&store, &id).await;
            store
                .attach_external_id(&OrderId::new(&id), &format!("x{i}"))
                .await
                .unwrap();
        }

        let config = EngineConfig {
            sweep_budget: Duration::ZERO, // budget already spent
            ..fast_config()
        };
        let engine = ReconcileEngine::new(panel, store, config);

        let report = engine.sweep().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.succeeded + report.failed, 0);
    }
}
