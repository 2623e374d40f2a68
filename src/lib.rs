//! Tableside - guest ordering client engine.
//!
//! The headless core of the guest QR ordering experience: cart management
//! with durable persistence, order placement and live status tracking for
//! the single active order per table, a realtime invalidation bridge over
//! WebSocket, and the bill/payment reconciliation flow (request bill, wait
//! for staff acceptance and the discount it carries, pay cash or through
//! the external checkout, confirm, show the receipt).
//!
//! All business logic lives in the backend; this crate holds snapshots,
//! derives display state, and drives the client-side state machine:
//!
//! - [`cart::CartStore`]: client-owned cart with price snapshots
//! - [`session::OrderSession`]: invalidate-and-refetch coordination
//! - [`realtime::EventBridge`]: socket events to invalidation signals
//! - [`progress`]: pure order-progress derivation
//! - [`billing::BillingEngine`]: bill/payment lifecycle

pub mod api;
pub mod billing;
pub mod cart;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod menu;
pub mod model;
pub mod orders;
pub mod payments;
pub mod progress;
pub mod realtime;
pub mod session;
pub mod storage;
pub mod totals;

pub use api::ApiClient;
pub use billing::{BillStage, BillState, BillingEngine, PayOutcome};
pub use cart::{CartItem, CartOption, CartStore};
pub use config::{Auth, ClientConfig, TableSelection};
pub use error::{Error, Result};
pub use model::{Order, OrderItem, OrderStatus, Payment, PaymentMethod, PaymentStatus};
pub use progress::{can_request_bill, derive_progress, OrderProgress};
pub use realtime::{EventBridge, OrderSignal};
pub use session::OrderSession;
pub use storage::Storage;
pub use totals::{BillTotals, TipSelection};
