//! Bill and payment reconciliation.
//!
//! Drives the server-owned payment lifecycle from the guest's side:
//! request bill, wait for staff acceptance (which carries the authoritative
//! discount), choose a method, pay, confirm, show the receipt. The engine
//! owns the retry/backoff order acquisition, the 2s acceptance poll, the
//! durable snapshot used for receipt recovery after an external checkout
//! redirect, and the one-shot confirmation latch.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{Order, Payment, PaymentMethod, PaymentStatus};
use crate::orders::OrderSource;
use crate::payments::{PaymentRequest, PaymentSource};
use crate::storage::{keys, Storage};
use crate::totals::{BillTotals, TipSelection};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// First retry delay for the order fetch.
pub const ORDER_FETCH_BASE_DELAY: Duration = Duration::from_millis(1_000);
/// Ceiling for the doubling backoff.
pub const ORDER_FETCH_MAX_DELAY: Duration = Duration::from_millis(5_000);
/// Retries after the initial attempt.
pub const ORDER_FETCH_RETRIES: u32 = 3;
/// Retries for the post-recovery and post-acceptance order re-fetches.
pub const ORDER_REFETCH_RETRIES: u32 = 2;
/// Payment status poll cadence while waiting for staff acceptance.
pub const PAYMENT_POLL_INTERVAL: Duration = Duration::from_millis(2_000);

/// Delay before retry `attempt` (0-based): base doubled per attempt,
/// capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let doubled = ORDER_FETCH_BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    doubled.min(ORDER_FETCH_MAX_DELAY)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the bill flow currently stands, as observed by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum BillStage {
    /// Fetching the order / no payment yet.
    Loading,
    /// Bill not yet requested for the held order.
    NoPayment,
    /// Payment exists with status `created`; waiting for staff acceptance.
    AwaitingAcceptance,
    /// Staff accepted; the discount is known and the guest can pay.
    ReadyToPay,
    /// Receipt view (cash settled at the table, or online confirmed).
    Preview { method: PaymentMethod },
    /// Terminal: no order and no cached payment after all retries.
    Unavailable,
}

/// Observable engine state.
#[derive(Debug, Clone)]
pub struct BillState {
    pub stage: BillStage,
    pub order: Option<Order>,
    pub payment: Option<Payment>,
    pub tip: TipSelection,
    /// Soft warning banner (e.g. confirmation failed but the receipt still
    /// shows). Persists until superseded; never auto-cleared.
    pub notice: Option<String>,
}

impl BillState {
    fn initial() -> Self {
        Self {
            stage: BillStage::Loading,
            order: None,
            payment: None,
            tip: TipSelection::None,
            notice: None,
        }
    }
}

/// Durable snapshot for receipt recovery, written whenever a non-null
/// order is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillSnapshot {
    pub order: Order,
    pub table_number: Option<String>,
    #[serde(flatten)]
    pub tip: TipSelection,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// What `pay` asks the caller to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum PayOutcome {
    /// Cash: settled at the table, receipt is ready.
    Settled,
    /// Online: leave the app for the external checkout page.
    RedirectTo(String),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BillingEngine {
    orders: Arc<dyn OrderSource>,
    payments: Arc<dyn PaymentSource>,
    storage: Arc<Storage>,
    state_tx: watch::Sender<BillState>,
    cancel: CancellationToken,
    confirm_latch: AtomicBool,
    state: Mutex<BillState>,
}

impl BillingEngine {
    pub fn new(
        orders: Arc<dyn OrderSource>,
        payments: Arc<dyn PaymentSource>,
        storage: Arc<Storage>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(BillState::initial());
        Arc::new(Self {
            orders,
            payments,
            storage,
            state_tx,
            cancel: CancellationToken::new(),
            confirm_latch: AtomicBool::new(false),
            state: Mutex::new(BillState::initial()),
        })
    }

    /// Subscribe to engine state.
    pub fn subscribe(&self) -> watch::Receiver<BillState> {
        self.state_tx.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> BillState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop polling and retries. Called on view teardown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn update<F: FnOnce(&mut BillState)>(&self, f: F) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
        self.state_tx.send_replace(state.clone());
    }

    // -----------------------------------------------------------------------
    // Snapshot persistence
    // -----------------------------------------------------------------------

    fn persist_snapshot(&self) {
        let state = self.state();
        let Some(order) = state.order else { return };
        let snapshot = BillSnapshot {
            table_number: order.table_number.clone(),
            order,
            tip: state.tip,
            saved_at: chrono::Utc::now(),
        };
        if let Err(e) = self.storage.set_typed(keys::ORDER_SNAPSHOT, &snapshot) {
            warn!("failed to persist bill snapshot: {e}");
        }
    }

    /// Restore the last persisted snapshot, for receipt display after the
    /// active-order concept has moved on server-side.
    pub fn restore_snapshot(&self) -> Option<BillSnapshot> {
        self.storage.get_typed(keys::ORDER_SNAPSHOT)
    }

    // -----------------------------------------------------------------------
    // Order acquisition
    // -----------------------------------------------------------------------

    /// Fetch the current order with exponential backoff: the initial
    /// attempt plus `retries` more, sleeping 1s, 2s, 4s (capped at 5s)
    /// between attempts. `Ok(None)` (no active order) is a result, not a
    /// failure: it does not retry.
    async fn fetch_order_with_retry(&self, retries: u32) -> Result<Option<Order>> {
        let mut attempt = 0u32;
        loop {
            match self.orders.fetch_current().await {
                Ok(order) => return Ok(order),
                Err(e) => {
                    if attempt >= retries {
                        warn!("order fetch failed after {} attempts: {e}", attempt + 1);
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt);
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(e),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Entry point: acquire the order (with the recovery path) and settle
    /// into the right stage. Returns the terminal `Unavailable` stage as
    /// `Err(OrderUnavailable)` for callers that want to branch.
    pub async fn start(&self) -> Result<()> {
        self.update(|s| s.stage = BillStage::Loading);

        let order = match self.fetch_order_with_retry(ORDER_FETCH_RETRIES).await {
            Ok(order) => order,
            Err(_) => self.recover_via_cached_payment().await?,
        };

        match order {
            Some(order) => {
                self.adopt_order(order).await;
                Ok(())
            }
            None => {
                // No active order. A snapshot may still carry a receipt
                // (e.g. returning from checkout after completion).
                if let Some(snapshot) = self.restore_snapshot() {
                    info!(order_id = %snapshot.order.id, "no live order, restored snapshot");
                    self.update(|s| {
                        s.order = Some(snapshot.order);
                        s.tip = snapshot.tip;
                        s.stage = BillStage::NoPayment;
                    });
                    self.sync_payment_stage().await;
                    return Ok(());
                }
                self.update(|s| s.stage = BillStage::Unavailable);
                Err(Error::OrderUnavailable)
            }
        }
    }

    /// Recovery path: the live order fetch failed outright, but a payment
    /// flow may be in progress for a cached order id. Payments outlive the
    /// active-order view, so fetch the payment first, then give the order
    /// fetch a further bounded run.
    async fn recover_via_cached_payment(&self) -> Result<Option<Order>> {
        let cached_order_id = self
            .storage
            .session_get(keys::PENDING_PAYMENT_ORDER_ID)
            .filter(|id| !id.trim().is_empty());

        let Some(order_id) = cached_order_id else {
            self.update(|s| s.stage = BillStage::Unavailable);
            return Err(Error::OrderUnavailable);
        };

        info!(order_id, "order fetch failed, recovering via cached payment");
        match self.payments.fetch_by_order(&order_id).await {
            Ok(Some(payment)) => {
                self.update(|s| s.payment = Some(payment));
            }
            Ok(None) | Err(_) => {
                self.update(|s| s.stage = BillStage::Unavailable);
                return Err(Error::OrderUnavailable);
            }
        }

        match self.fetch_order_with_retry(ORDER_REFETCH_RETRIES).await {
            Ok(order) => Ok(order),
            Err(_) => {
                // A payment without an order still lets the receipt show
                // from the snapshot.
                Ok(None)
            }
        }
    }

    /// Hold an order: persist the snapshot and settle the payment stage.
    async fn adopt_order(&self, order: Order) {
        self.update(|s| {
            s.order = Some(order);
            s.stage = BillStage::NoPayment;
        });
        self.persist_snapshot();
        self.sync_payment_stage().await;
    }

    /// Look up the payment for the held order and move the stage to match
    /// its status.
    async fn sync_payment_stage(&self) {
        let Some(order_id) = self.state().order.as_ref().map(|o| o.id.clone()) else {
            return;
        };
        match self.payments.fetch_by_order(&order_id).await {
            Ok(Some(payment)) => {
                self.apply_payment(payment);
            }
            Ok(None) => {}
            Err(e) => warn!("payment lookup failed: {e}"),
        }
    }

    fn apply_payment(&self, payment: Payment) {
        let stage = match payment.status {
            PaymentStatus::Created => BillStage::AwaitingAcceptance,
            PaymentStatus::Accepted => BillStage::ReadyToPay,
            PaymentStatus::Success => BillStage::Preview {
                method: PaymentMethod::Stripe,
            },
            PaymentStatus::Failed => BillStage::ReadyToPay,
        };
        self.update(|s| {
            s.payment = Some(payment);
            s.stage = stage;
        });
    }

    // -----------------------------------------------------------------------
    // Bill request + acceptance polling
    // -----------------------------------------------------------------------

    /// Ask for the bill. The order status flips to `payment_pending`
    /// optimistically; the next confirmed read reconciles it.
    pub async fn request_bill(&self) -> Result<()> {
        let Some(order) = self.state().order else {
            return Err(Error::OrderUnavailable);
        };
        let updated = self.orders.request_bill(&order.id).await?;
        self.update(|s| {
            s.order = Some(updated);
            s.stage = BillStage::AwaitingAcceptance;
        });
        self.persist_snapshot();
        self.sync_payment_stage().await;
        Ok(())
    }

    /// Poll the payment every 2s until staff accepts (or teardown). On
    /// acceptance, re-fetch the order when the held snapshot has no items,
    /// since item data may not have been available during acquisition.
    pub async fn poll_until_accepted(&self) -> Result<()> {
        loop {
            let state = self.state();
            let Some(order_id) = state.order.as_ref().map(|o| o.id.clone()) else {
                return Err(Error::OrderUnavailable);
            };
            match state.payment.as_ref().map(|p| p.status) {
                Some(PaymentStatus::Created) | None => {}
                // Accepted (or further): polling's job is done.
                Some(_) => return Ok(()),
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(PAYMENT_POLL_INTERVAL) => {}
            }

            match self.payments.fetch_by_order(&order_id).await {
                Ok(Some(payment)) => {
                    let accepted = payment.status == PaymentStatus::Accepted;
                    self.apply_payment(payment);
                    if accepted {
                        self.refetch_order_if_empty().await;
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("payment poll failed: {e}"),
            }
        }
    }

    /// Bounded re-fetch of the order when the held snapshot has no items.
    async fn refetch_order_if_empty(&self) {
        let empty = self
            .state()
            .order
            .as_ref()
            .map(|o| o.order_items.is_empty())
            .unwrap_or(true);
        if !empty {
            return;
        }
        match self.fetch_order_with_retry(ORDER_REFETCH_RETRIES).await {
            Ok(Some(order)) => {
                self.update(|s| s.order = Some(order));
                self.persist_snapshot();
            }
            Ok(None) => {}
            Err(e) => warn!("post-acceptance order re-fetch failed: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Tip + totals
    // -----------------------------------------------------------------------

    /// Record the guest's tip choice and persist it with the snapshot.
    pub fn set_tip(&self, tip: TipSelection) {
        self.update(|s| s.tip = tip);
        self.persist_snapshot();
    }

    /// Derived bill amounts for the current order/payment/tip, if an order
    /// is held.
    pub fn totals(&self) -> Option<BillTotals> {
        let state = self.state();
        let order = state.order.as_ref()?;
        Some(BillTotals::for_order(
            order,
            state.payment.as_ref(),
            state.tip,
        ))
    }

    // -----------------------------------------------------------------------
    // Payment
    // -----------------------------------------------------------------------

    /// Pay the accepted bill. Cash settles immediately; online returns the
    /// checkout URL and caches the order id for the return path.
    pub async fn pay(
        &self,
        method: PaymentMethod,
        return_url: Option<String>,
    ) -> Result<PayOutcome> {
        let state = self.state();
        let Some(order) = state.order.as_ref() else {
            return Err(Error::OrderUnavailable);
        };
        let totals = self.totals().ok_or(Error::OrderUnavailable)?;

        let req = PaymentRequest {
            method,
            return_url,
            tip_amount: totals.tip_amount,
            discount_amount: totals.discount_amount,
        };
        let initiation = self.payments.initiate(&req).await?;

        match method {
            PaymentMethod::Cash => {
                // Settled at the table; the receipt shows right away.
                self.update(|s| {
                    s.payment = Some(initiation.payment);
                    s.stage = BillStage::Preview {
                        method: PaymentMethod::Cash,
                    };
                });
                self.persist_snapshot();
                Ok(PayOutcome::Settled)
            }
            PaymentMethod::Stripe => {
                let url = initiation.checkout_url.ok_or_else(|| Error::Api {
                    status: 502,
                    message: "Checkout URL missing from payment response".to_string(),
                })?;
                self.storage
                    .session_set(keys::PENDING_PAYMENT_ORDER_ID, &order.id);
                self.update(|s| s.payment = Some(initiation.payment));
                self.persist_snapshot();
                Ok(PayOutcome::RedirectTo(url))
            }
        }
    }

    /// Confirm an online payment on return from checkout.
    ///
    /// One-shot: the automatic confirm-on-return effect and a manual
    /// "I have paid" action cannot both fire. A failed confirm does not
    /// block the receipt, because the gateway's webhook may already have
    /// advanced the record server-side; it only posts a soft warning banner.
    pub async fn confirm_returned_payment(&self, payment_id: &str) {
        if self.confirm_latch.swap(true, Ordering::SeqCst) {
            info!(payment_id, "confirmation already fired, skipping");
            return;
        }

        match self.payments.confirm(payment_id, "success").await {
            Ok(payment) => {
                self.update(|s| {
                    s.payment = Some(payment);
                    s.stage = BillStage::Preview {
                        method: PaymentMethod::Stripe,
                    };
                });
            }
            Err(e) => {
                warn!(payment_id, "payment confirmation failed: {e}");
                self.update(|s| {
                    s.notice = Some(format!(
                        "We could not confirm your payment automatically ({e}). \
                         If you completed checkout, your receipt is below."
                    ));
                    s.stage = BillStage::Preview {
                        method: PaymentMethod::Stripe,
                    };
                });
            }
        }

        // The pending marker has served its purpose either way.
        self.storage.session_remove(keys::PENDING_PAYMENT_ORDER_ID);
        self.persist_snapshot();

        // Returning from checkout with no live order: restore the receipt
        // from the snapshot rather than failing closed.
        if self.state().order.is_none() {
            if let Some(snapshot) = self.restore_snapshot() {
                self.update(|s| {
                    s.order = Some(snapshot.order);
                    s.tip = snapshot.tip;
                });
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::PaymentInitiation;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    fn order(id: &str, status: &str, items: usize) -> Order {
        let items: Vec<_> = (0..items)
            .map(|i| {
                serde_json::json!({
                    "id": format!("oi-{i}"),
                    "menuItemId": format!("m-{i}"),
                    "quantity": 1,
                    "unitPrice": 10.0,
                    "status": "served",
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": status,
            "orderItems": items,
        }))
        .unwrap()
    }

    fn payment(id: &str, status: PaymentStatus) -> Payment {
        Payment {
            id: id.into(),
            status,
            order_id: Some("ord-1".into()),
            discount_rate: 0.0,
            discount_amount: 0.0,
            stripe_session_id: None,
            checkout_url: None,
            total_amount: None,
        }
    }

    // -- Fakes --------------------------------------------------------------

    struct FakeOrders {
        responses: std::sync::Mutex<Vec<Result<Option<Order>>>>,
        fetches: AtomicUsize,
    }

    impl FakeOrders {
        fn new(responses: Vec<Result<Option<Order>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses),
                fetches: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Self::new(vec![])
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl OrderSource for FakeOrders {
        fn fetch_current(&self) -> BoxFuture<'_, Result<Option<Order>>> {
            Box::pin(async {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    Err(Error::Transport("unreachable".into()))
                } else {
                    responses.remove(0)
                }
            })
        }

        fn request_bill<'a>(&'a self, order_id: &'a str) -> BoxFuture<'a, Result<Order>> {
            Box::pin(async move { Ok(order(order_id, "payment_pending", 1)) })
        }
    }

    struct FakePayments {
        by_order: std::sync::Mutex<Vec<Result<Option<Payment>>>>,
        confirm_result: std::sync::Mutex<Result<Payment>>,
        confirms: AtomicUsize,
        checkout_url: Option<String>,
    }

    impl FakePayments {
        fn new(by_order: Vec<Result<Option<Payment>>>) -> Arc<Self> {
            Arc::new(Self {
                by_order: std::sync::Mutex::new(by_order),
                confirm_result: std::sync::Mutex::new(Ok(payment(
                    "pay-1",
                    PaymentStatus::Success,
                ))),
                confirms: AtomicUsize::new(0),
                checkout_url: Some("https://checkout.stripe.com/s/abc".into()),
            })
        }

        fn confirm_count(&self) -> usize {
            self.confirms.load(Ordering::SeqCst)
        }
    }

    impl PaymentSource for FakePayments {
        fn fetch<'a>(&'a self, payment_id: &'a str) -> BoxFuture<'a, Result<Payment>> {
            Box::pin(async move { Ok(payment(payment_id, PaymentStatus::Created)) })
        }

        fn fetch_by_order<'a>(
            &'a self,
            _order_id: &'a str,
        ) -> BoxFuture<'a, Result<Option<Payment>>> {
            Box::pin(async {
                let mut responses = self.by_order.lock().unwrap();
                if responses.is_empty() {
                    Ok(None)
                } else {
                    responses.remove(0)
                }
            })
        }

        fn initiate<'a>(
            &'a self,
            req: &'a PaymentRequest,
        ) -> BoxFuture<'a, Result<PaymentInitiation>> {
            Box::pin(async move {
                Ok(PaymentInitiation {
                    payment: payment("pay-1", PaymentStatus::Accepted),
                    checkout_url: match req.method {
                        PaymentMethod::Stripe => self.checkout_url.clone(),
                        PaymentMethod::Cash => None,
                    },
                    total_amount: 0.0,
                })
            })
        }

        fn confirm<'a>(
            &'a self,
            _payment_id: &'a str,
            _status: &'a str,
        ) -> BoxFuture<'a, Result<Payment>> {
            Box::pin(async {
                self.confirms.fetch_add(1, Ordering::SeqCst);
                self.confirm_result.lock().unwrap().clone()
            })
        }
    }

    fn engine(
        orders: Arc<FakeOrders>,
        payments: Arc<FakePayments>,
    ) -> (tempfile::TempDir, Arc<Storage>, Arc<BillingEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::init(dir.path()).unwrap());
        let engine = BillingEngine::new(orders, payments, storage.clone());
        (dir, storage, engine)
    }

    // -- Backoff ------------------------------------------------------------

    #[test]
    fn test_backoff_delays_double_then_cap() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(5_000));
        assert_eq!(backoff_delay(10), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_terminal() {
        // All attempts fail: initial + 3 retries = 4 fetches, then the
        // terminal state. No 5th attempt, no cached payment to recover.
        let orders = FakeOrders::failing();
        let payments = FakePayments::new(vec![]);
        let (_dir, _storage, engine) = engine(orders.clone(), payments);

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, Error::OrderUnavailable));
        assert_eq!(orders.fetch_count(), 4);
        assert_eq!(engine.state().stage, BillStage::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_midway() {
        let orders = FakeOrders::new(vec![
            Err(Error::Transport("down".into())),
            Err(Error::Transport("down".into())),
            Ok(Some(order("ord-1", "served", 2))),
        ]);
        let payments = FakePayments::new(vec![Ok(None)]);
        let (_dir, _storage, engine) = engine(orders.clone(), payments);

        engine.start().await.unwrap();
        assert_eq!(orders.fetch_count(), 3);
        let state = engine.state();
        assert_eq!(state.stage, BillStage::NoPayment);
        assert_eq!(state.order.unwrap().id, "ord-1");
    }

    // -- Recovery -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_recovery_via_cached_payment() {
        // Live order fetch fails on every attempt, but a cached order id
        // resolves a payment, and the follow-up order fetch succeeds.
        let orders = FakeOrders::new(vec![
            Err(Error::Transport("down".into())),
            Err(Error::Transport("down".into())),
            Err(Error::Transport("down".into())),
            Err(Error::Transport("down".into())),
            Ok(Some(order("ord-1", "payment_pending", 1))),
        ]);
        let payments = FakePayments::new(vec![
            Ok(Some(payment("pay-1", PaymentStatus::Created))),
            Ok(Some(payment("pay-1", PaymentStatus::Created))),
        ]);
        let (_dir, storage, engine) = engine(orders, payments);
        storage.session_set(keys::PENDING_PAYMENT_ORDER_ID, "ord-1");

        engine.start().await.unwrap();
        let state = engine.state();
        assert_eq!(state.stage, BillStage::AwaitingAcceptance);
        assert!(state.order.is_some());
        assert!(state.payment.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_without_cached_id_fails_closed() {
        let orders = FakeOrders::failing();
        let payments = FakePayments::new(vec![]);
        let (_dir, _storage, engine) = engine(orders, payments);

        assert!(engine.start().await.is_err());
        assert_eq!(engine.state().stage, BillStage::Unavailable);
    }

    // -- Acceptance polling -------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_accepted_stops_on_acceptance() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 1)))]);
        let payments = FakePayments::new(vec![
            // start(): payment lookup
            Ok(Some(payment("pay-1", PaymentStatus::Created))),
            // poll iterations
            Ok(Some(payment("pay-1", PaymentStatus::Created))),
            Ok(Some(payment("pay-1", PaymentStatus::Accepted))),
        ]);
        let (_dir, _storage, engine) = engine(orders, payments);

        engine.start().await.unwrap();
        assert_eq!(engine.state().stage, BillStage::AwaitingAcceptance);

        engine.poll_until_accepted().await.unwrap();
        let state = engine.state();
        assert_eq!(state.stage, BillStage::ReadyToPay);
        assert_eq!(
            state.payment.as_ref().map(|p| p.status),
            Some(PaymentStatus::Accepted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_is_noop_once_accepted() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 1)))]);
        let payments = FakePayments::new(vec![Ok(Some(payment("pay-1", PaymentStatus::Accepted)))]);
        let (_dir, _storage, engine) = engine(orders, payments);

        engine.start().await.unwrap();
        assert_eq!(engine.state().stage, BillStage::ReadyToPay);
        // Poll guard: already accepted, returns without sleeping forever.
        engine.poll_until_accepted().await.unwrap();
    }

    // -- Payment ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_cash_payment_settles_immediately() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 2)))]);
        let payments = FakePayments::new(vec![Ok(Some(payment("pay-1", PaymentStatus::Accepted)))]);
        let (_dir, _storage, engine) = engine(orders, payments);

        engine.start().await.unwrap();
        engine.set_tip(TipSelection::Preset(10));
        let outcome = engine.pay(PaymentMethod::Cash, None).await.unwrap();
        assert_eq!(outcome, PayOutcome::Settled);
        assert_eq!(
            engine.state().stage,
            BillStage::Preview {
                method: PaymentMethod::Cash
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_payment_redirects_and_caches_order_id() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 2)))]);
        let payments = FakePayments::new(vec![Ok(Some(payment("pay-1", PaymentStatus::Accepted)))]);
        let (_dir, storage, engine) = engine(orders, payments);

        engine.start().await.unwrap();
        let outcome = engine.pay(PaymentMethod::Stripe, Some("app://bill".into())).await.unwrap();
        assert_eq!(
            outcome,
            PayOutcome::RedirectTo("https://checkout.stripe.com/s/abc".into())
        );
        assert_eq!(
            storage.session_get(keys::PENDING_PAYMENT_ORDER_ID).as_deref(),
            Some("ord-1")
        );
    }

    // -- Confirmation latch -------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_confirm_is_one_shot() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 1)))]);
        let payments = FakePayments::new(vec![Ok(Some(payment("pay-1", PaymentStatus::Accepted)))]);
        let (_dir, _storage, engine) = engine(orders, payments.clone());

        engine.start().await.unwrap();
        engine.confirm_returned_payment("pay-1").await;
        engine.confirm_returned_payment("pay-1").await;
        assert_eq!(payments.confirm_count(), 1);
        assert_eq!(
            engine.state().stage,
            BillStage::Preview {
                method: PaymentMethod::Stripe
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_failure_still_shows_receipt() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 1)))]);
        let payments = FakePayments::new(vec![Ok(Some(payment("pay-1", PaymentStatus::Accepted)))]);
        *payments.confirm_result.lock().unwrap() =
            Err(Error::Transport("gateway timeout".into()));
        let (_dir, _storage, engine) = engine(orders, payments);

        engine.start().await.unwrap();
        engine.confirm_returned_payment("pay-1").await;
        let state = engine.state();
        assert_eq!(
            state.stage,
            BillStage::Preview {
                method: PaymentMethod::Stripe
            }
        );
        assert!(state.notice.unwrap().contains("could not confirm"));
    }

    // -- Snapshot -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_roundtrip_restores_receipt() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 2)))]);
        let payments = FakePayments::new(vec![Ok(Some(payment("pay-1", PaymentStatus::Accepted)))]);
        let (_dir, storage, engine) = engine(orders, payments);

        engine.start().await.unwrap();
        engine.set_tip(TipSelection::Custom(12.5));

        // A fresh engine over the same storage restores the receipt even
        // with the backend refusing everything.
        let dead_orders = FakeOrders::failing();
        let dead_payments = FakePayments::new(vec![]);
        let engine2 = BillingEngine::new(dead_orders, dead_payments, storage);
        let snapshot = engine2.restore_snapshot().unwrap();
        assert_eq!(snapshot.order.id, "ord-1");
        assert_eq!(snapshot.tip, TipSelection::Custom(12.5));
    }

    // -- Totals -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_totals_use_accepted_discount() {
        let orders = FakeOrders::new(vec![Ok(Some(order("ord-1", "payment_pending", 10)))]);
        let mut accepted = payment("pay-1", PaymentStatus::Accepted);
        accepted.discount_rate = 10.0;
        let payments = FakePayments::new(vec![Ok(Some(accepted))]);
        let (_dir, _storage, engine) = engine(orders, payments);

        engine.start().await.unwrap();
        engine.set_tip(TipSelection::Preset(15));
        // 10 items x 10.00 = 100.00 subtotal
        let totals = engine.totals().unwrap();
        assert_eq!(totals.subtotal, 100.0);
        assert_eq!(totals.discount_amount, 10.0);
        assert_eq!(totals.tax, 9.0);
        assert_eq!(totals.total, 99.0);
        assert_eq!(totals.tip_amount, 14.85);
        assert_eq!(totals.grand_total, 113.85);
    }
}
