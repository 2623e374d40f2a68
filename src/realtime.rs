//! Realtime order events.
//!
//! One WebSocket connection per tracking view, connected on mount and torn
//! down on unmount. The bridge never mutates order state: both inbound
//! event kinds collapse into an invalidation signal, and the next
//! successful fetch is the sole source of truth. That sidesteps any need
//! to reconcile out-of-order push payloads with concurrent polling.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How long a rejected-item notice stays on screen.
pub const REJECTED_NOTICE_MS: u64 = 6_000;

/// Signals the bridge feeds into the session's refresh coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderSignal {
    /// Something about the order changed server-side; refetch.
    Invalidate,
    /// An item was rejected with a reason; show a transient notice for
    /// [`REJECTED_NOTICE_MS`] in addition to refetching.
    ItemRejected { reason: String },
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// Split an inbound text frame into `(event, data)`.
fn parse_event_frame(raw: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let event = value.get("event").and_then(Value::as_str)?.to_string();
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    Some((event, data))
}

/// Map one inbound event to the signals it produces. Unknown events
/// produce nothing.
fn signals_for_event(event: &str, data: &Value) -> Vec<OrderSignal> {
    match event {
        "order_status_updated" => vec![OrderSignal::Invalidate],
        "order_item_updated" => {
            let mut signals = vec![OrderSignal::Invalidate];
            let rejected = data
                .get("status")
                .and_then(Value::as_str)
                .is_some_and(|s| s == "rejected");
            if rejected {
                let reason = data
                    .get("rejected_reason")
                    .or_else(|| data.get("rejectedReason"))
                    .and_then(Value::as_str)
                    .unwrap_or("Item was rejected")
                    .to_string();
                signals.push(OrderSignal::ItemRejected { reason });
            }
            signals
        }
        other => {
            debug!(event = other, "ignoring unknown realtime event");
            vec![]
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Handle to a connected realtime bridge. Dropping it without calling
/// [`EventBridge::disconnect`] cancels the reader task as well.
pub struct EventBridge {
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl EventBridge {
    /// Connect to the orders namespace and join the table's room. Signals
    /// are delivered on `tx` until the socket closes or the bridge is
    /// disconnected.
    pub async fn connect(
        socket_url: &str,
        table_id: &str,
        tx: mpsc::Sender<OrderSignal>,
    ) -> Result<Self> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(socket_url)
            .await
            .map_err(|e| Error::Socket(format!("connect {socket_url}: {e}")))?;

        // Join the table room so the server can target events at us.
        let join = json!({ "event": "join_table", "data": { "table_id": table_id } });
        ws.send(Message::Text(join.to_string()))
            .await
            .map_err(|e| Error::Socket(format!("join_table: {e}")))?;

        info!(table_id, "realtime bridge connected");

        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    frame = ws.next() => {
                        match frame {
                            Some(Ok(Message::Text(raw))) => {
                                let Some((event, data)) = parse_event_frame(&raw) else {
                                    debug!("unparsable realtime frame, ignoring");
                                    continue;
                                };
                                for signal in signals_for_event(&event, &data) {
                                    if tx.send(signal).await.is_err() {
                                        // Receiver gone; the view is done with us.
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                            Some(Ok(Message::Close(_))) | None => {
                                info!("realtime socket closed by server");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("realtime socket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { cancel, reader: Some(reader) })
    }

    /// Tear the bridge down: unsubscribe and close the socket. The next
    /// mount reconnects fresh; there is no event replay.
    pub async fn disconnect(mut self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        info!("realtime bridge disconnected");
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
