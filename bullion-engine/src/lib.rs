//! The transactional trading engine.
//!
//! `open_trade` and `close_trade` wrap the upstream venue call, the account
//! balance mutation, the client order, the mirrored LP position and the four
//! ledger entries of each leg into one atomic unit: every database write of
//! an operation shares a single store transaction and rolls back together.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use bullion_broker::{CloseRequest, TradeRequest, VenueClient, VenueError};
use bullion_core::identifiers::{next_entry_id, next_order_no, next_transaction_id};
use bullion_core::pricing::{gold_weight_value, quote_for_close, quote_for_open, round_money};
use bullion_core::{
    Account, Asset, CashTransaction, EntryDetails, EntryKind, EntryNature, LedgerEntry,
    LpPosition, Order, OrderStatus, PositionStatus, Price, Side, Symbol, TransactionKind,
    TransactionStatus, Weight,
};
use bullion_store::repository::{accounts, ledger, lp_positions, orders, transactions};
use bullion_store::{Store, StoreError};

pub mod policy;

pub use policy::{check_sufficient_balance, BalanceCheck, PolicyConfig};

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-specific error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Account, order or position absent (or hidden by admin scoping).
    #[error("not found: {0}")]
    NotFound(String),
    /// Caller is not allowed to touch the resource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Request parameters failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The account cannot cover the requested amount.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    /// The upstream venue rejected or failed the request.
    #[error("upstream error: {0}")]
    Upstream(#[from] VenueError),
    /// The operation collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::Database(what) => Self::Internal(what),
        }
    }
}

/// Engine settings shared by every operation.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upstream venue symbol mirrored for client orders (e.g. `XAUUSD`).
    pub venue_symbol: Symbol,
    /// Magic number stamped on upstream orders.
    pub magic: i64,
    pub sl_distance: Decimal,
    pub tp_distance: Decimal,
    /// When false, a SELL that would drive the metal balance negative is
    /// rejected before any write.
    pub allow_negative_metal: bool,
    pub policy: PolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            venue_symbol: "XAUUSD".into(),
            magic: 116_640,
            sl_distance: dec!(10),
            tp_distance: dec!(10),
            allow_negative_metal: true,
            policy: PolicyConfig::default(),
        }
    }
}

/// Parameters accepted by [`TradingEngine::open_trade`].
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTradeRequest {
    pub symbol: Symbol,
    #[serde(rename = "type")]
    pub side: Side,
    pub volume: Weight,
    /// Raw spot used for quoting; the venue fill price when placed upstream.
    pub price: Price,
    #[serde(default)]
    pub required_margin: Option<Price>,
    #[serde(default)]
    pub opening_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Mirror the order on the upstream venue before persisting.
    #[serde(default = "default_true")]
    pub place_upstream: bool,
}

fn default_true() -> bool {
    true
}

/// Cash/metal balances after an engine operation.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Balances {
    pub cash: Price,
    pub gold: Weight,
}

/// Everything written by a successful open.
#[derive(Clone, Debug, Serialize)]
pub struct OpenTradeOutcome {
    pub order: Order,
    pub lp_position: LpPosition,
    pub balances: Balances,
    pub required_margin: Price,
    pub gold_weight_value: Price,
    pub ledger_entries: Vec<LedgerEntry>,
}

/// Whitelisted fields accepted by [`TradingEngine::close_trade`]. Unknown
/// payload fields are dropped at deserialization.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseUpdate {
    #[serde(default)]
    pub order_status: Option<OrderStatus>,
    #[serde(default)]
    pub closing_price: Option<Price>,
    #[serde(default)]
    pub closing_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub price: Option<Price>,
}

/// Everything written by a successful close/cancel/update.
#[derive(Clone, Debug, Serialize)]
pub struct CloseTradeOutcome {
    pub order: Order,
    pub lp_position: LpPosition,
    pub balances: Balances,
    pub client_profit: Decimal,
    pub lp_profit: Decimal,
    pub ledger_entries: Vec<LedgerEntry>,
}

/// Result of a close that consulted the upstream venue first.
#[derive(Clone, Debug)]
pub enum UpstreamClose {
    /// The venue closed the position and the settlement committed.
    Settled(Box<CloseTradeOutcome>),
    /// The venue no longer knows the ticket. Balances are untouched.
    LikelyClosed { order: Order },
}

/// Parameters for a deposit or withdrawal.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub asset: Asset,
    pub amount: Decimal,
    pub user: Uuid,
}

/// The engine facade owned by the server context.
pub struct TradingEngine {
    store: Arc<Store>,
    venue: Arc<dyn VenueClient>,
    config: EngineConfig,
}

impl TradingEngine {
    pub fn new(store: Arc<Store>, venue: Arc<dyn VenueClient>, config: EngineConfig) -> Self {
        Self {
            store,
            venue,
            config,
        }
    }

    /// Admin-scoped account read.
    pub fn account(&self, admin_id: Uuid, user_id: Uuid) -> EngineResult<Account> {
        Ok(self
            .store
            .with_conn(|conn| accounts::by_id_for_admin(conn, user_id, admin_id))?)
    }

    /// Orders still carrying exposure for a user, oldest first.
    pub fn processing_orders(&self, user_id: Uuid) -> EngineResult<Vec<Order>> {
        Ok(self
            .store
            .with_conn(|conn| orders::processing_for_user(conn, user_id))?)
    }

    /// Admin-scoped order listing, newest first.
    pub fn orders_for_admin(&self, admin_id: Uuid) -> EngineResult<Vec<Order>> {
        Ok(self
            .store
            .with_conn(|conn| orders::list_for_admin(conn, admin_id))?)
    }

    /// A statement page of ledger entries, newest first.
    pub fn statement(&self, user_id: Uuid, limit: u32, offset: u32) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self
            .store
            .with_conn(|conn| ledger::list_for_user(conn, user_id, limit, offset))?)
    }

    /// Evaluate the margin policy for a requested volume.
    pub fn check_sufficient_balance(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        volume: Weight,
    ) -> EngineResult<BalanceCheck> {
        let account = self.account(admin_id, user_id)?;
        let open = self.processing_orders(user_id)?;
        Ok(policy::check_sufficient_balance(
            &self.config.policy,
            &account,
            volume,
            &open,
        ))
    }

    /// Open a trade: quote, mirror upstream, then commit the nine writes.
    pub async fn open_trade(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        request: OpenTradeRequest,
    ) -> EngineResult<OpenTradeOutcome> {
        if request.volume <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "volume must be positive, got {}",
                request.volume
            )));
        }

        // Fail fast on scoping and metal policy before touching the venue.
        let preflight = self
            .store
            .with_conn(|conn| accounts::by_id_for_admin(conn, user_id, admin_id))?;
        if request.side == Side::Sell
            && !self.config.allow_negative_metal
            && preflight.metal_weight - request.volume < Decimal::ZERO
        {
            return Err(EngineError::InsufficientBalance(format!(
                "sell of {} g exceeds metal balance {} g",
                request.volume, preflight.metal_weight
            )));
        }

        let order_no = next_order_no();
        let ticket = if request.place_upstream {
            let receipt = self
                .venue
                .place_trade(TradeRequest {
                    symbol: self.config.venue_symbol.clone(),
                    volume: request.volume,
                    side: request.side,
                    sl_distance: self.config.sl_distance,
                    tp_distance: self.config.tp_distance,
                    comment: order_no.clone(),
                    magic: self.config.magic,
                })
                .await?;
            Some(receipt.ticket)
        } else {
            None
        };

        let opening_date = request.opening_date.unwrap_or_else(Utc::now);
        let spot = request.price;
        let outcome = self.store.with_tx(|tx| {
            let account = accounts::by_id_for_admin(tx, user_id, admin_id)?;

            let client_price =
                quote_for_open(spot, request.side, account.ask_spread, account.bid_spread);
            let weight_value = gold_weight_value(client_price, request.volume);
            let required_margin = request.required_margin.unwrap_or(weight_value);

            let cash_after = account.cash_balance - required_margin;
            let metal_after =
                account.metal_weight + request.side.metal_sign() * request.volume;

            let order = Order {
                id: Uuid::new_v4(),
                order_no: order_no.clone(),
                side: request.side,
                volume: request.volume,
                symbol: request.symbol.clone(),
                price: client_price,
                opening_price: client_price,
                closing_price: None,
                required_margin,
                opening_date,
                closing_date: None,
                status: OrderStatus::Processing,
                profit: Decimal::ZERO,
                user: user_id,
                admin_id,
                lp_position_id: Some(order_no.clone()),
                ticket,
                comment: request.comment.clone(),
                notification_error: None,
            };
            orders::insert(tx, &order)?;

            let lp_position = LpPosition {
                position_id: order_no.clone(),
                side: request.side,
                volume: request.volume,
                symbol: request.symbol.clone(),
                entry_price: spot,
                current_price: spot,
                closing_price: None,
                open_date: opening_date,
                close_date: None,
                status: PositionStatus::Open,
                profit: Decimal::ZERO,
                client_order: order.id,
                admin_id,
            };
            lp_positions::insert(tx, &lp_position)?;

            accounts::update_balances(tx, account.id, cash_after, metal_after)?;

            let lp_value = gold_weight_value(spot, request.volume);
            let entries = vec![
                LedgerEntry {
                    entry_id: next_entry_id(EntryKind::Order),
                    kind: EntryKind::Order,
                    nature: EntryNature::Debit,
                    reference_number: order_no.clone(),
                    amount: required_margin,
                    running_balance: cash_after,
                    date: opening_date,
                    user: user_id,
                    admin_id,
                    details: EntryDetails::Order {
                        side: request.side,
                        volume: request.volume,
                        opening_price: client_price,
                    },
                    description: format!("{} {} {} @ {}", request.side, request.volume, request.symbol, client_price),
                    notes: None,
                },
                LedgerEntry {
                    entry_id: next_entry_id(EntryKind::LpPosition),
                    kind: EntryKind::LpPosition,
                    nature: EntryNature::Credit,
                    reference_number: order_no.clone(),
                    amount: lp_value,
                    running_balance: cash_after,
                    date: opening_date,
                    user: user_id,
                    admin_id,
                    details: EntryDetails::LpPosition {
                        position_id: order_no.clone(),
                        entry_price: spot,
                    },
                    description: format!("LP position opened @ {spot}"),
                    notes: None,
                },
                LedgerEntry {
                    entry_id: next_entry_id(EntryKind::Transaction),
                    kind: EntryKind::Transaction,
                    nature: EntryNature::Debit,
                    reference_number: order_no.clone(),
                    amount: required_margin,
                    running_balance: cash_after,
                    date: opening_date,
                    user: user_id,
                    admin_id,
                    details: EntryDetails::Transaction {
                        asset: Asset::Cash,
                        previous_balance: account.cash_balance,
                    },
                    description: "Margin reserved".into(),
                    notes: None,
                },
                LedgerEntry {
                    entry_id: next_entry_id(EntryKind::Transaction),
                    kind: EntryKind::Transaction,
                    nature: match request.side {
                        Side::Buy => EntryNature::Credit,
                        Side::Sell => EntryNature::Debit,
                    },
                    reference_number: order_no.clone(),
                    amount: request.volume,
                    running_balance: metal_after,
                    date: opening_date,
                    user: user_id,
                    admin_id,
                    details: EntryDetails::Transaction {
                        asset: Asset::Gold,
                        previous_balance: account.metal_weight,
                    },
                    description: "Metal allocated".into(),
                    notes: None,
                },
            ];
            for entry in &entries {
                ledger::append(tx, entry)?;
            }

            Ok(OpenTradeOutcome {
                order,
                lp_position,
                balances: Balances {
                    cash: cash_after,
                    gold: metal_after,
                },
                required_margin,
                gold_weight_value: weight_value,
                ledger_entries: entries,
            })
        });

        match outcome {
            Ok(outcome) => {
                info!(
                    order_no = %outcome.order.order_no,
                    side = %outcome.order.side,
                    volume = %outcome.order.volume,
                    price = %outcome.order.opening_price,
                    "trade opened"
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Some(ticket) = ticket {
                    // The upstream fill cannot be rolled back; flag it for
                    // manual reconciliation.
                    error!(ticket, error = %err, "order persisted nothing but venue filled");
                    return Err(EngineError::Internal(format!(
                        "venue filled ticket {ticket} but persistence failed: {err}"
                    )));
                }
                Err(err.into())
            }
        }
    }

    /// Close, cancel or update an order. Settlement and reversal run under
    /// one transaction; plain field updates never touch balances.
    pub fn close_trade(
        &self,
        admin_id: Uuid,
        order_id: Uuid,
        mut update: CloseUpdate,
    ) -> EngineResult<CloseTradeOutcome> {
        if update.order_status == Some(OrderStatus::Closed) && update.closing_date.is_none() {
            update.closing_date = Some(Utc::now());
        }
        if let Some(closing_price) = update.closing_price {
            update.price = Some(closing_price);
        }

        let outcome = self.store.with_tx(|tx| {
            let mut order = orders::by_id_for_admin(tx, order_id, admin_id)?;
            if order.status.is_terminal() {
                return Err(StoreError::Conflict(format!(
                    "order {} already {}",
                    order.order_no, order.status
                )));
            }
            let account = accounts::by_id(tx, order.user)?;
            let mut lp_position = lp_positions::by_position_id(tx, &order.order_no)?;

            let spot = update.closing_price.unwrap_or(order.price);
            let client_closing =
                quote_for_close(spot, order.side, account.ask_spread, account.bid_spread);

            let entry_value = gold_weight_value(order.opening_price, order.volume);
            let close_spot_value = gold_weight_value(spot, order.volume);
            let close_client_value = gold_weight_value(client_closing, order.volume);
            let lp_entry_value = gold_weight_value(lp_position.entry_price, order.volume);

            let client_profit = match order.side {
                Side::Buy => (client_closing - order.opening_price) * order.volume,
                Side::Sell => (order.opening_price - client_closing) * order.volume,
            };
            // Spread captured on both legs, in AED gold-weight terms.
            let lp_profit = (lp_entry_value - entry_value).abs()
                + (close_spot_value - close_client_value).abs();

            if let Some(price) = update.price {
                order.price = price;
            }
            if let Some(comment) = &update.comment {
                order.comment = Some(comment.clone());
            }
            if let Some(profit) = update.profit {
                order.profit = profit;
            }

            lp_position.current_price = spot;

            let target = update.order_status.unwrap_or(order.status);
            let (balances, entries, client_profit, lp_profit) = match target {
                OrderStatus::Closed => {
                    order.status = OrderStatus::Closed;
                    order.closing_price = Some(spot);
                    order.closing_date = update.closing_date;
                    order.profit = round_money(client_profit);

                    let settlement = if order.required_margin > Decimal::ZERO {
                        order.required_margin
                    } else {
                        match order.side {
                            Side::Buy => close_client_value,
                            Side::Sell => entry_value,
                        }
                    };
                    let user_profit = client_profit.max(Decimal::ZERO);

                    let cash_after = account.cash_balance + settlement + user_profit;
                    let metal_after =
                        account.metal_weight - order.side.metal_sign() * order.volume;
                    accounts::update_balances(tx, account.id, cash_after, metal_after)?;

                    lp_position.status = PositionStatus::Closed;
                    lp_position.closing_price = Some(spot);
                    lp_position.close_date = update.closing_date;
                    lp_position.profit = round_money(lp_profit);

                    let date = update.closing_date.unwrap_or_else(Utc::now);
                    let entries = settlement_entries(
                        &order,
                        &account,
                        SettlementAmounts {
                            order_amount: settlement,
                            lp_amount: close_spot_value,
                            cash_delta: settlement + user_profit,
                            cash_after,
                            metal_after,
                            date,
                            description: format!(
                                "Closed {} @ {client_closing}",
                                order.order_no
                            ),
                        },
                    );
                    for entry in &entries {
                        ledger::append(tx, entry)?;
                    }
                    (
                        Balances {
                            cash: cash_after,
                            gold: metal_after,
                        },
                        entries,
                        client_profit,
                        lp_profit,
                    )
                }
                OrderStatus::Cancelled | OrderStatus::Failed => {
                    order.status = target;

                    // Reverse the opening deltas: refund the margin, undo
                    // the metal move.
                    let cash_after = account.cash_balance + order.required_margin;
                    let metal_after =
                        account.metal_weight - order.side.metal_sign() * order.volume;
                    accounts::update_balances(tx, account.id, cash_after, metal_after)?;

                    lp_position.status = PositionStatus::Closed;
                    lp_position.close_date = Some(Utc::now());

                    let entries = settlement_entries(
                        &order,
                        &account,
                        SettlementAmounts {
                            order_amount: order.required_margin,
                            lp_amount: lp_entry_value,
                            cash_delta: order.required_margin,
                            cash_after,
                            metal_after,
                            date: Utc::now(),
                            description: format!("{} {}", target, order.order_no),
                        },
                    );
                    for entry in &entries {
                        ledger::append(tx, entry)?;
                    }
                    (
                        Balances {
                            cash: cash_after,
                            gold: metal_after,
                        },
                        entries,
                        Decimal::ZERO,
                        Decimal::ZERO,
                    )
                }
                _ => {
                    if let Some(status) = update.order_status {
                        order.status = status;
                    }
                    (
                        Balances {
                            cash: account.cash_balance,
                            gold: account.metal_weight,
                        },
                        Vec::new(),
                        Decimal::ZERO,
                        Decimal::ZERO,
                    )
                }
            };

            orders::update(tx, &order)?;
            lp_positions::update(tx, &lp_position)?;

            Ok(CloseTradeOutcome {
                order,
                lp_position,
                balances,
                client_profit,
                lp_profit,
                ledger_entries: entries,
            })
        })?;

        info!(
            order_no = %outcome.order.order_no,
            status = %outcome.order.status,
            client_profit = %outcome.client_profit,
            lp_profit = %outcome.lp_profit,
            "order updated"
        );
        Ok(outcome)
    }

    /// Close an order against the venue first, then settle. A position the
    /// venue no longer knows about leaves balances untouched.
    pub async fn close_order_upstream(
        &self,
        admin_id: Uuid,
        order_id: Uuid,
    ) -> EngineResult<UpstreamClose> {
        let order = self
            .store
            .with_conn(|conn| orders::by_id_for_admin(conn, order_id, admin_id))?;
        if order.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "order {} already {}",
                order.order_no, order.status
            )));
        }
        let ticket = order.ticket.ok_or_else(|| {
            EngineError::Validation(format!("order {} has no upstream ticket", order.order_no))
        })?;

        let outcome = self
            .venue
            .close_trade(CloseRequest {
                ticket,
                symbol: self.config.venue_symbol.clone(),
                volume: None,
                side: order.side,
            })
            .await?;

        if outcome.likely_closed {
            warn!(order_no = %order.order_no, ticket, "position already closed upstream");
            return Ok(UpstreamClose::LikelyClosed { order });
        }

        let update = CloseUpdate {
            order_status: Some(OrderStatus::Closed),
            closing_price: outcome.close_price,
            closing_date: Some(Utc::now()),
            ..CloseUpdate::default()
        };
        let settled = self.close_trade(admin_id, order_id, update)?;
        Ok(UpstreamClose::Settled(Box::new(settled)))
    }

    /// Apply a deposit or withdrawal to one asset balance.
    pub fn create_transaction(
        &self,
        admin_id: Uuid,
        request: TransactionRequest,
    ) -> EngineResult<CashTransaction> {
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let record = self.store.with_tx(|tx| {
            let account = accounts::by_id_for_admin(tx, request.user, admin_id)?;
            let previous = account.balance(request.asset);
            let new_balance = match request.kind {
                TransactionKind::Deposit => previous + request.amount,
                TransactionKind::Withdrawal => {
                    if previous < request.amount {
                        return Err(StoreError::Conflict(format!(
                            "insufficient {} balance: {previous} available, {} requested",
                            request.asset, request.amount
                        )));
                    }
                    previous - request.amount
                }
            };

            let (cash, metal) = match request.asset {
                Asset::Cash => (new_balance, account.metal_weight),
                Asset::Gold => (account.cash_balance, new_balance),
            };
            accounts::update_balances(tx, account.id, cash, metal)?;

            let record = CashTransaction {
                transaction_id: next_transaction_id(),
                kind: request.kind,
                asset: request.asset,
                amount: request.amount,
                user: request.user,
                admin_id,
                previous_balance: previous,
                new_balance,
                status: TransactionStatus::Completed,
                created_at: Utc::now(),
            };
            transactions::insert(tx, &record)?;

            ledger::append(
                tx,
                &LedgerEntry {
                    entry_id: next_entry_id(EntryKind::Transaction),
                    kind: EntryKind::Transaction,
                    nature: match request.kind {
                        TransactionKind::Deposit => EntryNature::Credit,
                        TransactionKind::Withdrawal => EntryNature::Debit,
                    },
                    reference_number: record.transaction_id.clone(),
                    amount: request.amount,
                    running_balance: new_balance,
                    date: record.created_at,
                    user: request.user,
                    admin_id,
                    details: EntryDetails::Transaction {
                        asset: request.asset,
                        previous_balance: previous,
                    },
                    description: format!("{} {} {}", record.kind, request.amount, request.asset),
                    notes: None,
                },
            )?;
            Ok(record)
        });

        match record {
            Ok(record) => {
                info!(
                    transaction_id = %record.transaction_id,
                    kind = %record.kind,
                    asset = %record.asset,
                    amount = %record.amount,
                    "transaction completed"
                );
                Ok(record)
            }
            Err(StoreError::Conflict(message)) if message.starts_with("insufficient") => {
                Err(EngineError::InsufficientBalance(message))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Transition a transaction's status. Leaving COMPLETED reverses the
    /// original balance delta under the same transaction.
    pub fn update_transaction_status(
        &self,
        admin_id: Uuid,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> EngineResult<CashTransaction> {
        let result = self.store.with_tx(|tx| {
            let record = transactions::by_id(tx, transaction_id)?;
            if record.admin_id != admin_id {
                return Err(StoreError::NotFound(format!(
                    "transaction {transaction_id}"
                )));
            }
            if record.status == status {
                return Ok(record);
            }
            match (record.status, status) {
                (TransactionStatus::Pending, TransactionStatus::Completed) => {
                    apply_transaction_delta(tx, &record, false)?;
                }
                (
                    TransactionStatus::Completed,
                    TransactionStatus::Cancelled | TransactionStatus::Failed,
                ) => {
                    apply_transaction_delta(tx, &record, true)?;
                }
                (TransactionStatus::Pending, _) => {}
                (from, to) => {
                    return Err(StoreError::Conflict(format!(
                        "cannot transition transaction from {from} to {to}"
                    )));
                }
            }
            transactions::update_status(tx, transaction_id, status)?;
            let mut updated = record;
            updated.status = status;
            Ok(updated)
        });

        match result {
            Err(StoreError::Conflict(message)) if message.starts_with("insufficient") => {
                Err(EngineError::InsufficientBalance(message))
            }
            other => Ok(other?),
        }
    }

    /// Record a failed post-commit notification on the order. Never fails
    /// the caller.
    pub fn annotate_notification_error(&self, order_id: Uuid, admin_id: Uuid, message: &str) {
        let result = self.store.with_tx(|tx| {
            let mut order = orders::by_id_for_admin(tx, order_id, admin_id)?;
            order.notification_error = Some(message.to_string());
            orders::update(tx, &order)
        });
        if let Err(err) = result {
            warn!(%order_id, error = %err, "failed to annotate notification error");
        }
    }

    /// Ledger conservation check for one `(user, asset)` pair.
    pub fn ledger_sum(&self, user_id: Uuid, asset: Asset) -> EngineResult<Decimal> {
        Ok(self
            .store
            .with_conn(|conn| ledger::signed_sum(conn, user_id, asset))?)
    }
}

struct SettlementAmounts {
    order_amount: Decimal,
    lp_amount: Decimal,
    cash_delta: Decimal,
    cash_after: Decimal,
    metal_after: Decimal,
    date: DateTime<Utc>,
    description: String,
}

/// The four closing-leg entries, mirroring the opening leg with flipped
/// natures: ORDER -> LP_POSITION -> TRX-CASH -> TRX-GOLD.
fn settlement_entries(
    order: &Order,
    account: &Account,
    amounts: SettlementAmounts,
) -> Vec<LedgerEntry> {
    vec![
        LedgerEntry {
            entry_id: next_entry_id(EntryKind::Order),
            kind: EntryKind::Order,
            nature: EntryNature::Credit,
            reference_number: order.order_no.clone(),
            amount: amounts.order_amount,
            running_balance: amounts.cash_after,
            date: amounts.date,
            user: order.user,
            admin_id: order.admin_id,
            details: EntryDetails::Order {
                side: order.side,
                volume: order.volume,
                opening_price: order.opening_price,
            },
            description: amounts.description.clone(),
            notes: None,
        },
        LedgerEntry {
            entry_id: next_entry_id(EntryKind::LpPosition),
            kind: EntryKind::LpPosition,
            nature: EntryNature::Debit,
            reference_number: order.order_no.clone(),
            amount: amounts.lp_amount,
            running_balance: amounts.cash_after,
            date: amounts.date,
            user: order.user,
            admin_id: order.admin_id,
            details: EntryDetails::LpPosition {
                position_id: order.order_no.clone(),
                entry_price: order.opening_price,
            },
            description: format!("LP position closed for {}", order.order_no),
            notes: None,
        },
        LedgerEntry {
            entry_id: next_entry_id(EntryKind::Transaction),
            kind: EntryKind::Transaction,
            nature: EntryNature::Credit,
            reference_number: order.order_no.clone(),
            amount: amounts.cash_delta,
            running_balance: amounts.cash_after,
            date: amounts.date,
            user: order.user,
            admin_id: order.admin_id,
            details: EntryDetails::Transaction {
                asset: Asset::Cash,
                previous_balance: account.cash_balance,
            },
            description: "Settlement released".into(),
            notes: None,
        },
        LedgerEntry {
            entry_id: next_entry_id(EntryKind::Transaction),
            kind: EntryKind::Transaction,
            nature: match order.side {
                Side::Buy => EntryNature::Debit,
                Side::Sell => EntryNature::Credit,
            },
            reference_number: order.order_no.clone(),
            amount: order.volume,
            running_balance: amounts.metal_after,
            date: amounts.date,
            user: order.user,
            admin_id: order.admin_id,
            details: EntryDetails::Transaction {
                asset: Asset::Gold,
                previous_balance: account.metal_weight,
            },
            description: "Metal released".into(),
            notes: None,
        },
    ]
}

fn apply_transaction_delta(
    tx: &rusqlite::Transaction<'_>,
    record: &CashTransaction,
    reverse: bool,
) -> Result<(), StoreError> {
    let account = accounts::by_id(tx, record.user)?;
    let current = account.balance(record.asset);
    let signed = match (record.kind, reverse) {
        (TransactionKind::Deposit, false) | (TransactionKind::Withdrawal, true) => record.amount,
        (TransactionKind::Deposit, true) | (TransactionKind::Withdrawal, false) => -record.amount,
    };
    let updated = current + signed;
    if updated < Decimal::ZERO {
        return Err(StoreError::Conflict(format!(
            "insufficient {} balance to adjust transaction {}",
            record.asset, record.transaction_id
        )));
    }
    let (cash, metal) = match record.asset {
        Asset::Cash => (updated, account.metal_weight),
        Asset::Gold => (account.cash_balance, updated),
    };
    accounts::update_balances(tx, account.id, cash, metal)?;

    ledger::append(
        tx,
        &LedgerEntry {
            entry_id: next_entry_id(EntryKind::Transaction),
            kind: EntryKind::Transaction,
            nature: if signed >= Decimal::ZERO {
                EntryNature::Credit
            } else {
                EntryNature::Debit
            },
            reference_number: record.transaction_id.clone(),
            amount: record.amount,
            running_balance: updated,
            date: Utc::now(),
            user: record.user,
            admin_id: record.admin_id,
            details: EntryDetails::Transaction {
                asset: record.asset,
                previous_balance: current,
            },
            description: if reverse {
                format!("Reversal of {}", record.transaction_id)
            } else {
                format!("Completion of {}", record.transaction_id)
            },
            notes: None,
        },
    )?;
    Ok(())
}
