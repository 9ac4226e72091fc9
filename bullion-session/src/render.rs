//! Plain-text reply rendering for the conversational channel.
//!
//! Timestamps render in Gulf Standard Time (UTC+4, no DST).

use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;

use bullion_core::pricing::round_money;
use bullion_core::{Account, Freshness, LedgerEntry, Order, Quote, Side};
use bullion_engine::{BalanceCheck, OpenTradeOutcome};

use crate::PendingOrder;

fn gulf_offset() -> FixedOffset {
    FixedOffset::east_opt(4 * 3600).expect("fixed UTC+4 offset")
}

/// Render a UTC timestamp for Gulf-time readers.
pub fn gulf_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&gulf_offset())
        .format("%d %b %Y %H:%M GST")
        .to_string()
}

pub fn menu(user_name: Option<&str>) -> String {
    let greeting = match user_name {
        Some(name) => format!("Welcome {name}!"),
        None => "Welcome!".to_string(),
    };
    format!(
        "{greeting}\n\
         1. Buy TTB\n\
         2. Sell TTB\n\
         3. Live price\n\
         4. My orders\n\
         5. Balance\n\n\
         Shortcuts: BUY 2, SELL 1 TTB, 2TTB, CLOSE 1, STATEMENT"
    )
}

pub fn balance(account: &Account) -> String {
    format!(
        "Account {}\nCash: {} AED\nGold: {} g",
        account.ref_mid,
        round_money(account.cash_balance),
        account.metal_weight
    )
}

pub fn price_board(quote: &Quote, buy_per_bar: Decimal, sell_per_bar: Decimal) -> String {
    let freshness = Freshness::for_age(quote.age(Utc::now()));
    format!(
        "Gold spot {} / {} USD ({freshness})\n\
         TTB buy: {} AED\n\
         TTB sell: {} AED\n\
         As of {}",
        quote.bid,
        quote.ask,
        round_money(buy_per_bar),
        round_money(sell_per_bar),
        gulf_time(quote.fetched_at)
    )
}

pub fn ask_volume(side: Side) -> String {
    format!("How many TTB would you like to {side}? Send a number (e.g. 0.5).")
}

pub fn confirm(pending: &PendingOrder, quote: &Quote) -> String {
    let freshness = Freshness::for_age(quote.age(Utc::now()));
    format!(
        "Confirm {} {} TTB\n\
         Price per bar: {} AED ({freshness})\n\
         Total: {} AED\n\n\
         Reply Y to confirm or N to cancel.",
        pending.side,
        pending.volume,
        round_money(pending.unit_price),
        round_money(pending.total_cost)
    )
}

pub fn order_placed(outcome: &OpenTradeOutcome) -> String {
    format!(
        "Order {} placed: {} {} TTB @ {}\n\
         Margin reserved: {} AED\n\
         Cash: {} AED | Gold: {} g",
        outcome.order.order_no,
        outcome.order.side,
        outcome.order.volume,
        outcome.order.opening_price,
        round_money(outcome.required_margin),
        round_money(outcome.balances.cash),
        outcome.balances.gold
    )
}

pub fn order_closed(order: &Order, profit: Decimal, cash: Decimal, gold: Decimal) -> String {
    format!(
        "Order {} closed @ {}\n\
         P/L: {} AED\n\
         Cash: {} AED | Gold: {} g",
        order.order_no,
        order.closing_price.unwrap_or(order.price),
        round_money(profit),
        round_money(cash),
        gold
    )
}

pub fn orders_list(orders: &[Order]) -> String {
    if orders.is_empty() {
        return "No open orders. Send BUY 1 to get started.".to_string();
    }
    let mut lines = vec!["Open orders:".to_string()];
    for (index, order) in orders.iter().enumerate() {
        lines.push(format!(
            "{}. {} {} {} TTB @ {} ({})",
            index + 1,
            order.order_no,
            order.side,
            order.volume,
            order.opening_price,
            gulf_time(order.opening_date)
        ));
    }
    lines.push("Send CLOSE <number> to close one.".to_string());
    lines.join("\n")
}

pub fn statement(entries: &[LedgerEntry]) -> String {
    if entries.is_empty() {
        return "No statement entries yet.".to_string();
    }
    let mut lines = vec!["Recent activity:".to_string()];
    for entry in entries {
        lines.push(format!(
            "{} {} {} -> balance {} ({})",
            entry.nature,
            entry.amount,
            entry.reference_number,
            entry.running_balance,
            gulf_time(entry.date)
        ));
    }
    lines.join("\n")
}

pub fn insufficient(check: &BalanceCheck) -> String {
    format!(
        "Insufficient balance.\n\
         Required: {} AED (incl. existing exposure: {} AED)\n\
         Available: {} AED\n\
         Max volume right now: {} TTB",
        round_money(check.total_needed),
        round_money(check.existing_amount),
        round_money(check.user_balance),
        check.max_allowed_volume
    )
}

pub fn pricing_unavailable() -> String {
    "Live pricing is unavailable right now. Please try again in a moment.".to_string()
}

pub fn cancelled() -> String {
    "Order cancelled. Send MENU for options.".to_string()
}

pub fn session_reset() -> String {
    "Session reset. Send MENU for options.".to_string()
}

pub fn confirm_prompt() -> String {
    "Please reply Y to confirm or N to cancel.".to_string()
}

pub fn order_not_found() -> String {
    "Order not found. Send ORDERS to list your open orders.".to_string()
}

pub fn likely_closed(order_no: &str) -> String {
    format!(
        "Order {order_no} appears to be already closed upstream. \
         Our desk will reconcile it shortly."
    )
}

pub fn unknown() -> String {
    "Sorry, I did not understand that. Send MENU for options.".to_string()
}

pub fn failure(message: &str) -> String {
    format!("Could not complete that request: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn gulf_time_shifts_four_hours() {
        let utc = Utc.with_ymd_and_hms(2026, 3, 1, 20, 30, 0).unwrap();
        assert_eq!(gulf_time(utc), "02 Mar 2026 00:30 GST");
    }

    #[test]
    fn menu_greets_by_name() {
        assert!(menu(Some("Fatima")).starts_with("Welcome Fatima!"));
        assert!(menu(None).starts_with("Welcome!"));
    }
}
