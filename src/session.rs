//! Order snapshot coordination.
//!
//! Polling, socket pushes, and user mutations all funnel into one
//! invalidate-and-refetch path: producers send [`OrderSignal`]s, the
//! session drains them with at most one fetch in flight, and duplicate
//! invalidations arriving mid-fetch coalesce into a single follow-up
//! fetch. Mutations may install an optimistic snapshot; the next confirmed
//! read replaces it unconditionally.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::Order;
use crate::orders::OrderSource;
use crate::realtime::{OrderSignal, REJECTED_NOTICE_MS};

/// Where the current snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// Read back from the server.
    Confirmed,
    /// Set locally after a successful mutation, ahead of the next fetch.
    Optimistic,
}

/// The session's view of the current order.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub order: Option<Order>,
    pub origin: SnapshotOrigin,
}

/// A transient, auto-dismissing notice (rejected-item reasons).
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub message: String,
}

/// Coordinates the order snapshot for one tracking view.
pub struct OrderSession {
    source: Arc<dyn OrderSource>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notice_tx: watch::Sender<Option<Notice>>,
    refresh_lock: Mutex<()>,
    dirty: AtomicBool,
    notice_generation: Arc<AtomicU64>,
}

impl OrderSession {
    pub fn new(source: Arc<dyn OrderSource>) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            order: None,
            origin: SnapshotOrigin::Confirmed,
        });
        let (notice_tx, _) = watch::channel(None);
        Arc::new(Self {
            source,
            snapshot_tx,
            notice_tx,
            refresh_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            notice_generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to transient notices.
    pub fn notices(&self) -> watch::Receiver<Option<Notice>> {
        self.notice_tx.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Current order, if any.
    pub fn current_order(&self) -> Option<Order> {
        self.snapshot_tx.borrow().order.clone()
    }

    /// Install an optimistic snapshot after a successful mutation (e.g.
    /// `payment_pending` right after a bill request). Superseded by the
    /// next confirmed read, whether it confirms or contradicts it.
    pub fn apply_optimistic(&self, order: Order) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            order: Some(order),
            origin: SnapshotOrigin::Optimistic,
        });
    }

    fn set_confirmed(&self, order: Option<Order>) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            order,
            origin: SnapshotOrigin::Confirmed,
        });
    }

    /// Refetch the current order.
    ///
    /// At most one fetch is in flight at a time. A call that arrives while
    /// a fetch is running marks the snapshot dirty and returns immediately;
    /// the running fetch loops once more before releasing the lock, so
    /// coalesced invalidations still end with fresh data.
    pub async fn refresh(&self) -> Result<Option<Order>> {
        self.dirty.store(true, Ordering::SeqCst);
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!("refresh already in flight, coalescing");
            return Ok(self.current_order());
        };

        let mut last = self.current_order();
        while self.dirty.swap(false, Ordering::SeqCst) {
            match self.source.fetch_current().await {
                Ok(order) => {
                    self.set_confirmed(order.clone());
                    last = order;
                }
                Err(e) => {
                    // Keep the previous snapshot; the next signal retries.
                    warn!("order refresh failed: {e}");
                    return Err(e);
                }
            }
        }
        Ok(last)
    }

    /// Show a transient notice, auto-dismissing after
    /// [`REJECTED_NOTICE_MS`]. A newer notice supersedes the timer of an
    /// older one.
    pub fn show_notice(&self, message: String) {
        let generation = self.notice_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.notice_tx.send_replace(Some(Notice { message }));

        let notice_tx = self.notice_tx.clone();
        let generations = Arc::clone(&self.notice_generation);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(REJECTED_NOTICE_MS)).await;
            if generations.load(Ordering::SeqCst) == generation {
                notice_tx.send_replace(None);
            }
        });
    }

    /// Drain signals from the bridge (and any other producer) until the
    /// channel closes or the token fires. This is the single consumer of
    /// invalidations for the view.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<OrderSignal>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                signal = rx.recv() => {
                    let Some(signal) = signal else { break };
                    match signal {
                        OrderSignal::Invalidate => {
                            if let Err(e) = self.refresh().await {
                                debug!("invalidation refresh failed: {e}");
                            }
                        }
                        OrderSignal::ItemRejected { reason } => {
                            self.show_notice(reason);
                            if let Err(e) = self.refresh().await {
                                debug!("rejection refresh failed: {e}");
                            }
                        }
                    }
                }
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
    use crate::error::Error;
    use crate::model::OrderStatus;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    fn order(id: &str, status: &str) -> Order {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": status,
            "orderItems": [],
        }))
        .unwrap()
    }

    /// Fake source that pops queued responses and counts fetches.
    struct ScriptedSource {
        responses: std::sync::Mutex<Vec<Result<Option<Order>>>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Option<Order>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses),
                fetches: AtomicUsize::new(0),
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl OrderSource for ScriptedSource {
        fn fetch_current(&self) -> BoxFuture<'_, Result<Option<Order>>> {
            Box::pin(async {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    Ok(None)
                } else {
                    responses.remove(0)
                }
            })
        }

        fn request_bill<'a>(&'a self, _order_id: &'a str) -> BoxFuture<'a, Result<Order>> {
            Box::pin(async { Err(Error::OrderUnavailable) })
        }
    }

    #[tokio::test]
    async fn test_refresh_sets_confirmed_snapshot() {
        let source = ScriptedSource::new(vec![Ok(Some(order("ord-1", "active")))]);
        let session = OrderSession::new(source.clone());

        let fetched = session.refresh().await.unwrap().unwrap();
        assert_eq!(fetched.id, "ord-1");

        let snapshot = session.snapshot();
        assert_eq!(snapshot.origin, SnapshotOrigin::Confirmed);
        assert_eq!(snapshot.order.unwrap().id, "ord-1");
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_optimistic_superseded_by_confirmed_read() {
        let mut contradicting = order("ord-1", "served");
        contradicting.total_amount = 20.0;
        let source = ScriptedSource::new(vec![Ok(Some(contradicting))]);
        let session = OrderSession::new(source);

        let mut optimistic = order("ord-1", "payment_pending");
        optimistic.total_amount = 0.0;
        session.apply_optimistic(optimistic);
        assert_eq!(session.snapshot().origin, SnapshotOrigin::Optimistic);
        assert_eq!(
            session.current_order().unwrap().status,
            OrderStatus::PaymentPending
        );

        // The confirmed read wins even though it contradicts the optimism.
        session.refresh().await.unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.origin, SnapshotOrigin::Confirmed);
        assert_eq!(snapshot.order.unwrap().status, OrderStatus::Served);
    }

    #[tokio::test]
    async fn test_refresh_keeps_snapshot_on_failure() {
        let source = ScriptedSource::new(vec![
            Ok(Some(order("ord-1", "active"))),
            Err(Error::Transport("boom".into())),
        ]);
        let session = OrderSession::new(source);

        session.refresh().await.unwrap();
        assert!(session.refresh().await.is_err());
        // Previous confirmed order survives the failed fetch.
        assert_eq!(session.current_order().unwrap().id, "ord-1");
    }

    #[tokio::test]
    async fn test_run_drains_signals_and_notices() {
        let source = ScriptedSource::new(vec![
            Ok(Some(order("ord-1", "active"))),
            Ok(Some(order("ord-1", "active"))),
        ]);
        let session = OrderSession::new(source.clone());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(session.clone().run(rx, cancel.clone()));

        tx.send(OrderSignal::Invalidate).await.unwrap();
        tx.send(OrderSignal::ItemRejected {
            reason: "out of stock".into(),
        })
        .await
        .unwrap();
        drop(tx);
        runner.await.unwrap();

        assert_eq!(source.fetch_count(), 2);
        assert_eq!(
            session.notices().borrow().as_ref().map(|n| n.message.clone()),
            Some("out of stock".to_string())
        );
        assert!(session.current_order().is_some());
    }
}
