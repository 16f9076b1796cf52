use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{money, Ctx};
use crate::api::SupabaseClient;
use crate::badges::{filter_orders, BadgeCounts, OrderBoard, Tab};
use crate::models::Order;
use crate::orders::{self, ExtraCharge};
use crate::realtime::{self, ClientSlot, RealtimeSubscription, ReloadGate};
use crate::status::{derive_display_status, DisplayStatus, ItemStatus};
use crate::{auth, sales, Error};

#[derive(Debug, Subcommand)]
pub enum OrdersCommand {
    /// List orders under a tab
    List(ListArgs),
    /// Badge counts per tab
    Badges {
        /// Use the last saved list instead of the server
        #[arg(long)]
        offline: bool,
    },
    /// Show one order with its items
    Show { order: String },
    /// Change the status of one item
    Item {
        order: String,
        item_id: String,
        #[arg(value_parser = parse_item_status)]
        status: ItemStatus,
    },
    /// Mark every reserved or waiting item as picked
    PickAll { order: String },
    /// Cancel every item that is not cancelled yet
    Cancel { order: String },
    /// Replace the extra charges stored on the order
    Charges {
        order: String,
        /// DESCRIPTION=AMOUNT, repeatable
        #[arg(long = "extra")]
        extra: Vec<String>,
    },
    /// Close a fully picked order
    Close {
        order: String,
        /// Payment method name or id
        #[arg(long)]
        payment_method: String,
        /// DESCRIPTION=AMOUNT, repeatable; defaults to the charges already stored
        #[arg(long = "extra")]
        extra: Vec<String>,
    },
    /// Mark a closed order as shipped
    Send { order: String },
    /// Send a closed order to a store for pickup
    SendToLocal {
        order: String,
        /// Warehouse name or id
        #[arg(long)]
        warehouse: String,
    },
    /// Register the return of a closed or sent order
    Return { order: String },
    /// Stores that can receive orders
    Warehouses,
    /// Keep the board on screen, reloading on every remote change
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, default_value = "active", value_parser = parse_tab)]
    tab: Tab,
    /// Order number, customer name, dni or phone
    #[arg(long, default_value = "")]
    search: String,
    /// Use the last saved list instead of the server
    #[arg(long)]
    offline: bool,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[arg(long, default_value = "active", value_parser = parse_tab)]
    tab: Tab,
    #[arg(long, default_value = "")]
    search: String,
}

fn parse_item_status(s: &str) -> Result<ItemStatus, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_tab(s: &str) -> Result<Tab, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_charges(raw: &[String]) -> Result<Vec<ExtraCharge>> {
    raw.iter()
        .map(|r| orders::parse_charge_arg(r).map_err(anyhow::Error::from))
        .collect()
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OrderRow<'a> {
    id: &'a str,
    order_number: &'a str,
    customer: &'a str,
    display_status: DisplayStatus,
    items: usize,
    total: f64,
    created_at: Option<String>,
}

impl<'a> From<&'a Order> for OrderRow<'a> {
    fn from(o: &'a Order) -> Self {
        let charges = orders::parse_extra_charges(o.notes.as_deref());
        Self {
            id: &o.id,
            order_number: &o.order_number,
            customer: o.customer_name(),
            display_status: derive_display_status(o),
            items: o.order_items.len(),
            total: orders::order_total(o, &charges),
            created_at: o
                .created_at
                .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()),
        }
    }
}

fn render_rows(rows: &[OrderRow<'_>]) -> String {
    if rows.is_empty() {
        return "No orders.".into();
    }
    let mut out = format!(
        "{:<10} {:<16} {:<28} {:>5} {:>14}  {}",
        "#", "CREATED", "CUSTOMER", "ITEMS", "TOTAL", "STATE"
    );
    for r in rows {
        out.push_str(&format!(
            "\n{:<10} {:<16} {:<28} {:>5} {:>14}  {}",
            r.order_number,
            r.created_at.as_deref().unwrap_or("-"),
            r.customer.chars().take(28).collect::<String>(),
            r.items,
            money(r.total),
            r.display_status
        ));
    }
    out
}

fn render_counts(c: &BadgeCounts) -> String {
    format!(
        "active {} | picked {} | waiting {} | closed {} | sent {} | returned {} | with missing {} | total {}",
        c.active, c.picked, c.waiting, c.closed, c.sent, c.returned, c.with_missing, c.total
    )
}

fn render_order(o: &Order) -> String {
    let charges = orders::parse_extra_charges(o.notes.as_deref());
    let mut out = format!(
        "Order #{}  [{}]  stored: {}\nCustomer: {}",
        o.order_number,
        derive_display_status(o),
        o.status,
        o.customer_name()
    );
    if let Some(c) = &o.customers {
        if let Some(phone) = &c.phone {
            out.push_str(&format!("  tel {phone}"));
        }
        if let Some(dni) = &c.dni {
            out.push_str(&format!("  dni {dni}"));
        }
    }
    for it in &o.order_items {
        out.push_str(&format!(
            "\n  {:<38} {:<36} x{:<3} {:>12}  {}",
            it.id,
            it.label().chars().take(36).collect::<String>(),
            it.quantity,
            money(it.line_total()),
            it.status
        ));
    }
    for c in &charges {
        out.push_str(&format!("\n  + {:<76} {:>12}", c.description, money(c.amount)));
    }
    out.push_str(&format!("\nTotal: {}", money(orders::order_total(o, &charges))));
    out
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Load from the server and refresh the snapshot, or fall back to the
/// snapshot when the server is unreachable.
async fn load_board_orders(ctx: &Ctx<'_>, offline: bool) -> Result<(Vec<Order>, bool)> {
    if offline {
        return Ok((orders::load_snapshot(ctx.db), true));
    }
    let (client, _session) = auth::admin_client(ctx.config).await?;
    match orders::load_orders(&client).await {
        Ok(list) => {
            if let Err(e) = orders::save_snapshot(ctx.db, &list) {
                warn!("could not save orders snapshot: {e}");
            }
            Ok((list, false))
        }
        Err(e) if e.is_offline() => {
            warn!("backend unreachable, showing last saved orders: {e}");
            Ok((orders::load_snapshot(ctx.db), true))
        }
        Err(e) => Err(e.into()),
    }
}

async fn resolve(ctx: &Ctx<'_>, key: &str) -> Result<(SupabaseClient, Order)> {
    let (client, _session) = auth::admin_client(ctx.config).await?;
    let list = orders::load_orders(&client).await?;
    if let Err(e) = orders::save_snapshot(ctx.db, &list) {
        warn!("could not save orders snapshot: {e}");
    }
    let order = orders::find_order(&list, key)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("order {key}")))?;
    Ok((client, order))
}

/// Re-read an order after a change and print it.
async fn show_after(ctx: &Ctx<'_>, client: &SupabaseClient, order_id: &str, message: &str) -> Result<()> {
    let order = orders::load_order(client, order_id).await?;
    ctx.emit(&order, |o| format!("{message}\n{}", render_order(o)))
}

pub async fn run(cmd: OrdersCommand, ctx: &Ctx<'_>) -> Result<()> {
    match cmd {
        OrdersCommand::List(args) => {
            let (list, stale) = load_board_orders(ctx, args.offline).await?;
            let counts = BadgeCounts::from_orders(&list);
            let visible = filter_orders(&list, args.tab, &args.search);
            let rows: Vec<OrderRow> = visible.into_iter().map(OrderRow::from).collect();
            let value = serde_json::json!({
                "tab": args.tab,
                "offline": stale,
                "counts": counts,
                "orders": rows,
            });
            ctx.emit(&value, |_| {
                let mut out = String::new();
                if stale {
                    out.push_str("(offline: showing last saved list)\n");
                }
                out.push_str(&format!("[{}] {}\n", args.tab, render_counts(&counts)));
                out.push_str(&render_rows(&rows));
                out
            })
        }
        OrdersCommand::Badges { offline } => {
            let (list, _) = load_board_orders(ctx, offline).await?;
            let counts = orders::summarize(&list);
            ctx.emit(&counts, render_counts)
        }
        OrdersCommand::Show { order } => {
            let (_, order) = resolve(ctx, &order).await?;
            ctx.emit(&order, render_order)
        }
        OrdersCommand::Item {
            order,
            item_id,
            status,
        } => {
            let (client, order) = resolve(ctx, &order).await?;
            orders::update_item_status(&client, &order, &item_id, status).await?;
            show_after(ctx, &client, &order.id, &format!("Item set to {status}.")).await
        }
        OrdersCommand::PickAll { order } => {
            let (client, order) = resolve(ctx, &order).await?;
            let n = orders::pick_all(&client, &order).await?;
            show_after(ctx, &client, &order.id, &format!("{n} item(s) picked.")).await
        }
        OrdersCommand::Cancel { order } => {
            let (client, order) = resolve(ctx, &order).await?;
            let n = orders::cancel_open_items(&client, &order).await?;
            show_after(ctx, &client, &order.id, &format!("{n} item(s) cancelled.")).await
        }
        OrdersCommand::Charges { order, extra } => {
            let charges = parse_charges(&extra)?;
            let (client, order) = resolve(ctx, &order).await?;
            orders::set_extra_charges(&client, &order, &charges).await?;
            show_after(ctx, &client, &order.id, "Extra charges saved.").await
        }
        OrdersCommand::Close {
            order,
            payment_method,
            extra,
        } => {
            let (client, order) = resolve(ctx, &order).await?;
            let charges = if extra.is_empty() {
                orders::parse_extra_charges(order.notes.as_deref())
            } else {
                parse_charges(&extra)?
            };
            let methods = sales::list_payment_methods(&client).await?;
            let method = sales::find_payment_method(&methods, &payment_method)
                .ok_or_else(|| Error::NotFound(format!("payment method {payment_method:?}")))?;
            orders::close_order(&client, &order, &method.id, &charges).await?;
            let total = orders::order_total(&order, &charges);
            show_after(
                ctx,
                &client,
                &order.id,
                &format!("Order closed: {} via {}.", money(total), method.name),
            )
            .await
        }
        OrdersCommand::Send { order } => {
            let (client, order) = resolve(ctx, &order).await?;
            orders::mark_as_sent(&client, &order).await?;
            show_after(ctx, &client, &order.id, "Order marked as sent.").await
        }
        OrdersCommand::SendToLocal { order, warehouse } => {
            let (client, order) = resolve(ctx, &order).await?;
            let warehouses = orders::list_warehouses(&client).await?;
            let wanted = warehouse.trim().to_lowercase();
            let target = warehouses
                .iter()
                .find(|w| w.id == warehouse.trim() || w.name.to_lowercase() == wanted)
                .ok_or_else(|| Error::NotFound(format!("warehouse {warehouse:?}")))?;
            orders::send_to_local(&client, &order, &target.id).await?;
            show_after(ctx, &client, &order.id, &format!("Order sent to {}.", target.name)).await
        }
        OrdersCommand::Return { order } => {
            let (client, order) = resolve(ctx, &order).await?;
            orders::return_order(&client, &order).await?;
            show_after(ctx, &client, &order.id, "Return registered.").await
        }
        OrdersCommand::Warehouses => {
            let (client, _) = auth::admin_client(ctx.config).await?;
            let list = orders::list_warehouses(&client).await?;
            ctx.emit(&list, |ws| {
                ws.iter()
                    .map(|w| format!("{:<38} {:<24} {}", w.id, w.name, w.address.as_deref().unwrap_or("")))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        OrdersCommand::Watch(args) => watch(args, ctx).await,
    }
}

// ---------------------------------------------------------------------------
// Live board
// ---------------------------------------------------------------------------

fn print_board(ctx: &Ctx<'_>, board: &OrderBoard) -> Result<()> {
    let rows: Vec<OrderRow> = board.visible().into_iter().map(OrderRow::from).collect();
    if ctx.json {
        let line = serde_json::json!({ "tab": board.tab(), "counts": board.counts(), "orders": rows });
        println!("{line}");
    } else {
        println!(
            "\n== {} ==\n[{}] {}\n{}",
            Local::now().format("%H:%M:%S"),
            board.tab(),
            render_counts(&board.counts()),
            render_rows(&rows)
        );
    }
    Ok(())
}

fn spawn_reload(
    client: &SupabaseClient,
    gate: &ReloadGate,
    done: &mpsc::Sender<(u64, crate::Result<Vec<Order>>)>,
) {
    let ticket = gate.begin();
    let client = client.clone();
    let done = done.clone();
    tokio::spawn(async move {
        let result = orders::load_orders(&client).await;
        let _ = done.send((ticket, result)).await;
    });
}

async fn watch(args: WatchArgs, ctx: &Ctx<'_>) -> Result<()> {
    // The session is resolved in the background; the subscription starts as
    // soon as a client shows up in the slot.
    let slot = ClientSlot::new();
    let init = {
        let slot = slot.clone();
        let config = ctx.config.clone();
        tokio::spawn(async move {
            let (client, session) = auth::admin_client(&config).await?;
            slot.set(client);
            Ok::<_, Error>(session)
        })
    };
    let client = match realtime::wait_for_client(
        &slot,
        realtime::CLIENT_WAIT_ATTEMPTS,
        realtime::CLIENT_WAIT_INTERVAL,
    )
    .await
    {
        Ok(client) => client,
        Err(wait_err) => {
            if init.is_finished() {
                init.await.context("session task panicked")??;
            }
            return Err(wait_err.into());
        }
    };
    let session = init.await.context("session task panicked")??;

    let cancel = CancellationToken::new();
    let mut subscription = RealtimeSubscription::spawn(
        &client,
        Some(session.access_token().to_string()),
        realtime::ORDER_TABLES,
        cancel.clone(),
    )?;

    // Coalesce notification bursts into single reload requests.
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<usize>(4);
    let coalescer = tokio::spawn(async move {
        while let Some(batch) =
            realtime::next_batch(&mut subscription.notices, realtime::COALESCE_WINDOW).await
        {
            if trigger_tx.send(batch.len()).await.is_err() {
                break;
            }
        }
    });

    let gate = ReloadGate::new();
    let (done_tx, mut done_rx) = mpsc::channel(8);
    let mut board = OrderBoard::new(args.tab);
    board.set_search(&args.search);
    spawn_reload(&client, &gate, &done_tx);

    if !ctx.json {
        eprintln!("Watching orders; press Ctrl-C to stop.");
    }
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            trigger = trigger_rx.recv() => match trigger {
                Some(notices) => {
                    debug!(notices, "remote change, reloading");
                    spawn_reload(&client, &gate, &done_tx);
                }
                None => bail!("realtime feed ended"),
            },
            Some((ticket, result)) = done_rx.recv() => {
                if !gate.try_commit(ticket) {
                    debug!(ticket, "discarding stale reload");
                    continue;
                }
                match result {
                    Ok(list) => {
                        if let Err(e) = orders::save_snapshot(ctx.db, &list) {
                            warn!("could not save orders snapshot: {e}");
                        }
                        board.replace_orders(list);
                        print_board(ctx, &board)?;
                    }
                    Err(Error::Unauthorized) => return Err(Error::Unauthorized.into()),
                    Err(e) => warn!("reload failed, keeping current board: {e}"),
                }
            }
        }
    }

    info!("stopping order watch");
    cancel.cancel();
    coalescer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::fixtures::{item, order};
    use crate::status::OrderStatus;

    #[test]
    fn item_status_and_tab_arguments() {
        assert_eq!(parse_item_status("Picked").unwrap(), ItemStatus::Picked);
        assert!(parse_item_status("lost").is_err());
        assert_eq!(parse_tab("devolucion").unwrap(), Tab::Returned);
    }

    #[test]
    fn rows_include_extra_charges_in_total() {
        let mut o = order(
            "2001",
            OrderStatus::Active,
            vec![
                item("a", ItemStatus::Picked, 1000.0, 2),
                item("b", ItemStatus::Missing, 500.0, 1),
            ],
        );
        o.notes = Some(r#"{"extra_charges":[{"description":"Envío","amount":1500}]}"#.into());
        let row = OrderRow::from(&o);
        assert_eq!(row.total, 3500.0);
        assert_eq!(row.display_status, DisplayStatus::Picked);
        assert!(render_rows(&[row]).contains("$ 3500.00"));
    }

    #[test]
    fn order_detail_lists_items_and_charges() {
        let mut o = order("2002", OrderStatus::Active, vec![item("a", ItemStatus::Waiting, 100.0, 1)]);
        o.notes = Some(r#"{"extra_charges":[{"description":"Envío","amount":50}]}"#.into());
        let text = render_order(&o);
        assert!(text.contains("Order #2002  [waiting]"));
        assert!(text.contains("Envío"));
        assert!(text.contains("Total: $ 150.00"));
    }
}
