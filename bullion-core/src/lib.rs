//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod identifiers;
pub mod pricing;

/// Alias for monetary amounts (AED unless stated otherwise).
pub type Price = Decimal;
/// Alias for metal weights, denominated in grams.
pub type Weight = Decimal;
/// Alias used for human-readable market symbols (e.g., `XAUUSD`).
pub type Symbol = String;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed unit used when applying metal deltas (buy adds, sell removes).
    #[must_use]
    pub fn metal_sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unsupported side '{other}'")),
        }
    }
}

/// Client order lifecycle states.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Processing,
    Executed,
    Cancelled,
    Closed,
    Pending,
    Failed,
}

impl OrderStatus {
    /// Terminal states admit no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Processing => "PROCESSING",
            Self::Executed => "EXECUTED",
            Self::Cancelled => "CANCELLED",
            Self::Closed => "CLOSED",
            Self::Pending => "PENDING",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "PROCESSING" => Ok(Self::Processing),
            "EXECUTED" => Ok(Self::Executed),
            "CANCELLED" => Ok(Self::Cancelled),
            "CLOSED" => Ok(Self::Closed),
            "PENDING" => Ok(Self::Pending),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unsupported order status '{other}'")),
        }
    }
}

/// Mirrored LP position lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("OPEN"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "CLOSED" => Ok(Self::Closed),
            other => Err(format!("unsupported position status '{other}'")),
        }
    }
}

/// The two balance assets every account carries.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Cash,
    Gold,
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cash => f.write_str("CASH"),
            Self::Gold => f.write_str("GOLD"),
        }
    }
}

impl std::str::FromStr for Asset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "CASH" => Ok(Self::Cash),
            "GOLD" => Ok(Self::Gold),
            other => Err(format!("unsupported asset '{other}'")),
        }
    }
}

/// Administrative state of a client account.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Inactive,
    Suspended,
    Pending,
}

/// KYC review state of a client account.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KycStatus {
    #[default]
    Pending,
    Verified,
    Rejected,
}

/// The client's book: profile fields plus the cash and metal balances the
/// engine mutates inside its transactions.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Account {
    pub id: Uuid,
    /// Five-digit globally unique reference.
    pub ref_mid: String,
    pub account_head: String,
    /// Admin-scoped account code; unique per `(accode, admin_owner)`.
    pub accode: String,
    pub account_type: String,
    /// AED balance. Negative only for SELL exposure awaiting close.
    pub cash_balance: Price,
    /// Gram balance of allocated metal.
    pub metal_weight: Weight,
    /// Margin requirement in percent.
    pub margin_pct: Decimal,
    /// Per-account AED adjustment added to BUY quotes.
    pub ask_spread: Price,
    /// Per-account AED adjustment subtracted from SELL quotes.
    pub bid_spread: Price,
    pub admin_owner: Uuid,
    pub phone_number: String,
    pub email: Option<String>,
    pub status: AccountStatus,
    pub kyc_status: KycStatus,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Read the balance for the given asset.
    #[must_use]
    pub fn balance(&self, asset: Asset) -> Decimal {
        match asset {
            Asset::Cash => self.cash_balance,
            Asset::Gold => self.metal_weight,
        }
    }
}

/// The client-facing trade record.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub id: Uuid,
    /// Human-facing unique number, `ORD-` prefixed.
    pub order_no: String,
    pub side: Side,
    /// Volume in TTB bars (1 bar = 116.64 g).
    pub volume: Weight,
    /// Logical symbol, e.g. `GOLD`.
    pub symbol: Symbol,
    /// Latest reference price; mirrors `closing_price` once closed.
    pub price: Price,
    /// Quoted spot adjusted by the account spread at open.
    pub opening_price: Price,
    pub closing_price: Option<Price>,
    pub required_margin: Price,
    pub opening_date: DateTime<Utc>,
    pub closing_date: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub profit: Decimal,
    pub user: Uuid,
    pub admin_id: Uuid,
    /// Set iff venue placement succeeded; equals the LP position id.
    pub lp_position_id: Option<String>,
    /// Upstream venue ticket, set iff the venue returned one.
    pub ticket: Option<u64>,
    pub comment: Option<String>,
    /// Populated when the post-commit client notification failed.
    pub notification_error: Option<String>,
}

/// The mirrored upstream position, one per client order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LpPosition {
    /// Equals the client order's `order_no`.
    pub position_id: String,
    pub side: Side,
    pub volume: Weight,
    pub symbol: Symbol,
    /// Raw spot at open; never spread-adjusted.
    pub entry_price: Price,
    pub current_price: Price,
    pub closing_price: Option<Price>,
    pub open_date: DateTime<Utc>,
    pub close_date: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    /// AED spread captured by the broker across both legs.
    pub profit: Decimal,
    pub client_order: Uuid,
    pub admin_id: Uuid,
}

/// Journal entry families.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Order,
    LpPosition,
    Transaction,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Order => "ORDER",
            Self::LpPosition => "LP_POSITION",
            Self::Transaction => "TRANSACTION",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ORDER" => Ok(Self::Order),
            "LP_POSITION" => Ok(Self::LpPosition),
            "TRANSACTION" => Ok(Self::Transaction),
            other => Err(format!("unsupported entry kind '{other}'")),
        }
    }
}

/// Whether the entry debits or credits the account.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryNature {
    Debit,
    Credit,
}

impl EntryNature {
    /// Sign applied when summing entries into a balance.
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Debit => -Decimal::ONE,
            Self::Credit => Decimal::ONE,
        }
    }
}

impl std::fmt::Display for EntryNature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debit => f.write_str("DEBIT"),
            Self::Credit => f.write_str("CREDIT"),
        }
    }
}

impl std::str::FromStr for EntryNature {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "DEBIT" => Ok(Self::Debit),
            "CREDIT" => Ok(Self::Credit),
            other => Err(format!("unsupported entry nature '{other}'")),
        }
    }
}

/// Typed detail payload carried by each journal entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryDetails {
    Order {
        side: Side,
        volume: Weight,
        opening_price: Price,
    },
    LpPosition {
        position_id: String,
        entry_price: Price,
    },
    Transaction {
        asset: Asset,
        previous_balance: Decimal,
    },
}

/// Immutable journal line. Four are written per open and per close.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LedgerEntry {
    /// `ORD-`, `LP-` or `TRX-` prefixed identifier.
    pub entry_id: String,
    pub kind: EntryKind,
    pub nature: EntryNature,
    /// Always the client order's `order_no`.
    pub reference_number: String,
    pub amount: Decimal,
    /// Post-mutation balance of the affected asset.
    pub running_balance: Decimal,
    pub date: DateTime<Utc>,
    pub user: Uuid,
    pub admin_id: Uuid,
    pub details: EntryDetails,
    pub description: String,
    pub notes: Option<String>,
}

/// Deposit/withdrawal direction.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deposit => f.write_str("DEPOSIT"),
            Self::Withdrawal => f.write_str("WITHDRAWAL"),
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "DEPOSIT" => Ok(Self::Deposit),
            "WITHDRAWAL" => Ok(Self::Withdrawal),
            other => Err(format!("unsupported transaction kind '{other}'")),
        }
    }
}

/// Settlement state of a deposit/withdrawal.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unsupported transaction status '{other}'")),
        }
    }
}

/// A cash or metal deposit/withdrawal applied outside the trade lifecycle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CashTransaction {
    pub transaction_id: String,
    pub kind: TransactionKind,
    pub asset: Asset,
    pub amount: Decimal,
    pub user: Uuid,
    pub admin_id: Uuid,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// A cached upstream quote with its retrieval metadata.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid: Price,
    pub ask: Price,
    /// Venue spread expressed in points.
    pub spread_points: Decimal,
    pub venue_time: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    /// False when the service had to serve a stale cache entry.
    pub is_fresh: bool,
}

impl Quote {
    /// Age of the quote relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }
}

/// User-facing freshness bucket for a quote age.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Freshness {
    Live,
    Delayed,
    Stale,
}

impl Freshness {
    /// Classify a quote age: `Live` under a minute, `Delayed` up to five.
    #[must_use]
    pub fn for_age(age: Duration) -> Self {
        if age < Duration::seconds(60) {
            Self::Live
        } else if age < Duration::seconds(300) {
            Self::Delayed
        } else {
            Self::Stale
        }
    }
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => f.write_str("Live"),
            Self::Delayed => f.write_str("Delayed"),
            Self::Stale => f.write_str("Stale"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn side_inverse_round_trips() {
        assert_eq!(Side::Buy.inverse(), Side::Sell);
        assert_eq!(Side::Sell.inverse().inverse(), Side::Sell);
    }

    #[test]
    fn order_status_terminality() {
        assert!(OrderStatus::Closed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
    }

    #[test]
    fn entry_nature_signs_sum_to_zero() {
        assert_eq!(
            EntryNature::Debit.sign() + EntryNature::Credit.sign(),
            dec!(0)
        );
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            OrderStatus::Processing,
            OrderStatus::Executed,
            OrderStatus::Cancelled,
            OrderStatus::Closed,
            OrderStatus::Pending,
            OrderStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<OrderStatus>(), Ok(status));
        }
    }

    #[test]
    fn freshness_buckets_match_cutoffs() {
        assert_eq!(Freshness::for_age(Duration::seconds(5)), Freshness::Live);
        assert_eq!(Freshness::for_age(Duration::seconds(59)), Freshness::Live);
        assert_eq!(
            Freshness::for_age(Duration::seconds(60)),
            Freshness::Delayed
        );
        assert_eq!(
            Freshness::for_age(Duration::seconds(299)),
            Freshness::Delayed
        );
        assert_eq!(Freshness::for_age(Duration::seconds(300)), Freshness::Stale);
    }

    #[test]
    fn order_serializes_statuses_uppercase() {
        let json = serde_json::to_string(&OrderStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        let json = serde_json::to_string(&EntryKind::LpPosition).unwrap();
        assert_eq!(json, "\"LP_POSITION\"");
    }
}
