//! Terminal exercise client for the Tableside engine.
//!
//! Drives the guest flows against a dev backend: browse the menu, build a
//! cart, place an order, watch live status, and run the bill flow. Reads
//! `TABLESIDE_API_URL` and `TABLESIDE_DATA_DIR` from the environment (or a
//! `.env` file).

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tableside::billing::BillingEngine;
use tableside::cart::{CartItem, CartOption, CartStore};
use tableside::config::{decode_table_qr_payload, ClientConfig};
use tableside::model::PaymentMethod;
use tableside::orders;
use tableside::progress::derive_progress;
use tableside::realtime::EventBridge;
use tableside::session::OrderSession;
use tableside::storage::{keys, Storage};
use tableside::totals::TipSelection;
use tableside::ApiClient;

#[derive(Parser, Debug)]
#[command(name = "tableside")]
#[command(about = "guest ordering client for a Tableside dev backend", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store the table selection from a QR payload
    Table {
        /// QR deep-link payload (JSON or base64)
        payload: String,
    },
    /// Show the guest menu
    Menu,
    /// Cart operations
    #[command(arg_required_else_help = true)]
    Cart(CartArgs),
    /// Place the cart as an order
    Place {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show the current order and its progress
    Current,
    /// Follow live order updates until interrupted
    Track,
    /// Ask staff to come to the table
    CallWaiter,
    /// Run the bill flow (request, wait for acceptance, pay)
    Bill {
        /// Tip percentage (preset or custom)
        #[arg(long, default_value_t = 0.0)]
        tip: f64,
        /// Pay cash at the table instead of online checkout
        #[arg(long)]
        cash: bool,
    },
}

#[derive(Debug, Args)]
struct CartArgs {
    #[command(subcommand)]
    command: CartCmds,
}

#[derive(Debug, Subcommand)]
enum CartCmds {
    /// Add a menu item
    Add {
        menu_item_id: String,
        #[arg(long, default_value_t = 1)]
        qty: u32,
        #[arg(long)]
        request: Option<String>,
        /// Option as id:name:price, repeatable
        #[arg(long = "option")]
        options: Vec<String>,
    },
    /// List cart lines
    List,
    /// Remove all lines of a menu item
    Remove { menu_item_id: String },
    /// Clear the cart
    Clear,
}

fn parse_option(raw: &str) -> anyhow::Result<CartOption> {
    let mut parts = raw.splitn(3, ':');
    let option_id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("option must be id:name:price"))?;
    let option_name = parts.next().unwrap_or_default();
    let price_at_time = parts.next().unwrap_or("0").parse::<f64>()?;
    Ok(CartOption {
        option_id: option_id.to_string(),
        option_name: option_name.to_string(),
        price_at_time,
    })
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    let data_dir = std::env::var("TABLESIDE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".tableside"));
    let base_url =
        std::env::var("TABLESIDE_API_URL").unwrap_or_else(|_| "http://localhost:4000".to_string());

    let _log_guard = tableside::diagnostics::init_logging(&data_dir);

    let storage = Arc::new(Storage::init(&data_dir)?);
    let config = ClientConfig::new(&base_url);
    let socket_url = config.socket_url.clone();
    let api = Arc::new(ApiClient::new(config, storage.clone())?);
    let cart = CartStore::load(storage.clone());

    match args.command {
        Commands::Table { payload } => {
            let selection = decode_table_qr_payload(&payload)
                .ok_or_else(|| anyhow::anyhow!("unrecognized table payload"))?;
            storage.set_typed(keys::TABLE_SELECTION, &selection)?;
            println!("Table {} selected", selection.table_number);
        }
        Commands::Menu => {
            let menu = tableside::menu::MenuCache::new();
            menu.refresh(&api).await?;
            for category in menu.categories() {
                println!("{}", category.name);
                for item in &category.items {
                    let marker = if item.is_available { ' ' } else { '-' };
                    println!("  {marker} {:30} {:>6.2}  [{}]", item.name, item.price, item.id);
                }
            }
        }
        Commands::Cart(cart_args) => match cart_args.command {
            CartCmds::Add {
                menu_item_id,
                qty,
                request,
                options,
            } => {
                let options = options
                    .iter()
                    .map(|o| parse_option(o))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                let menu = tableside::menu::MenuCache::new();
                let (name, price) = match menu.refresh(&api).await {
                    Ok(_) => menu
                        .find_item(&menu_item_id)
                        .map(|i| (i.name, i.price))
                        .unwrap_or_default(),
                    Err(_) => Default::default(),
                };
                cart.add_item(CartItem {
                    menu_item_id,
                    menu_item_name: name,
                    price,
                    quantity: qty,
                    special_request: request,
                    options,
                });
                println!("Cart: {} items, {:.2}", cart.item_count(), cart.total_price());
            }
            CartCmds::List => {
                for line in cart.items() {
                    println!(
                        "{:>2}x {:30} {:>6.2}  [{}]",
                        line.quantity,
                        line.menu_item_name,
                        line.line_total(),
                        line.menu_item_id
                    );
                }
                println!("Total: {:.2}", cart.total_price());
            }
            CartCmds::Remove { menu_item_id } => {
                cart.remove_item(&menu_item_id);
                println!("Removed. {} items left", cart.item_count());
            }
            CartCmds::Clear => {
                cart.clear();
                println!("Cart cleared");
            }
        },
        Commands::Place { name, notes } => {
            let order =
                orders::place_order(&api, &cart, name.as_deref(), notes.as_deref()).await?;
            println!("Order {} placed ({})", order.id, order.status.as_str());
        }
        Commands::Current => {
            match orders::get_current_order(&api).await? {
                Some(order) => {
                    let progress = derive_progress(&order);
                    println!(
                        "Order {} - step {}/3 ({:?})",
                        order.id, progress.step_index, progress.display_status
                    );
                    for item in &order.order_items {
                        println!("  {:?} {:28} x{}", item.status, item.menu_item_name, item.quantity);
                    }
                }
                None => println!("No active order for this table"),
            }
        }
        Commands::Track => {
            let selection: tableside::TableSelection = storage
                .get_typed(keys::TABLE_SELECTION)
                .ok_or_else(|| anyhow::anyhow!("no table selected; run `tableside table` first"))?;

            let session = OrderSession::new(api.clone());
            let mut snapshots = session.subscribe();
            let (tx, rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();

            let bridge = EventBridge::connect(&socket_url, &selection.table_id, tx).await?;
            let runner = tokio::spawn(session.clone().run(rx, cancel.clone()));
            session.refresh().await?;

            println!("Tracking order for table {} (ctrl-c to stop)", selection.table_number);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if let Some(order) = snapshots.borrow_and_update().order.clone() {
                            let progress = derive_progress(&order);
                            println!(
                                "Order {} - step {}/3 ({:?})",
                                order.id, progress.step_index, progress.display_status
                            );
                        }
                    }
                }
            }
            cancel.cancel();
            bridge.disconnect().await;
            let _ = runner.await;
        }
        Commands::CallWaiter => {
            let message = orders::call_waiter(&api).await?;
            println!("{message}");
        }
        Commands::Bill { tip, cash } => {
            let engine = BillingEngine::new(api.clone(), api.clone(), storage.clone());
            engine.start().await?;
            if tip > 0.0 {
                engine.set_tip(TipSelection::Custom(tip));
            }

            let state = engine.state();
            if state.payment.is_none() {
                engine.request_bill().await?;
                println!("Bill requested, waiting for staff acceptance...");
            }
            engine.poll_until_accepted().await?;

            if let Some(totals) = engine.totals() {
                println!(
                    "Subtotal {:.2}  discount {:.2}  tax {:.2}  tip {:.2}  total {:.2}",
                    totals.subtotal,
                    totals.discount_amount,
                    totals.tax,
                    totals.tip_amount,
                    totals.grand_total
                );
            }

            let method = if cash { PaymentMethod::Cash } else { PaymentMethod::Stripe };
            match engine.pay(method, None).await? {
                tableside::PayOutcome::Settled => println!("Pay at the table. Receipt ready."),
                tableside::PayOutcome::RedirectTo(url) => {
                    println!("Complete checkout at:\n  {url}");
                }
            }
        }
    }

    Ok(())
}
