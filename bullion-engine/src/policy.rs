//! Balance and margin admission policy.
//!
//! Evaluated before an order reaches the engine: a requested volume must be
//! coverable by the account's cash after reserving base and margin for every
//! order still carrying open exposure.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use bullion_core::{Account, Order, Weight};

/// Tunable policy constants.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    /// AED reserved per unit of volume before margin.
    pub base_amount_per_volume: Decimal,
    /// Margin requirement as a percentage of the base amount.
    pub minimum_balance_pct: Decimal,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            base_amount_per_volume: dec!(2200),
            minimum_balance_pct: dec!(20),
        }
    }
}

/// Full derivation returned to callers so user-facing messages can show
/// every intermediate figure.
#[derive(Clone, Debug, Serialize)]
pub struct BalanceCheck {
    pub ok: bool,
    pub user_balance: Decimal,
    pub base_amount: Decimal,
    pub margin_amount: Decimal,
    pub total_required: Decimal,
    pub existing_volume: Weight,
    pub existing_amount: Decimal,
    pub total_needed: Decimal,
    pub remaining_balance: Decimal,
    pub max_allowed_volume: Weight,
    pub message: String,
}

/// Evaluate whether `volume` is admissible for the account given its open
/// PROCESSING exposure.
#[must_use]
pub fn check_sufficient_balance(
    config: &PolicyConfig,
    account: &Account,
    volume: Weight,
    processing_orders: &[Order],
) -> BalanceCheck {
    let pct = config.minimum_balance_pct / dec!(100);
    let per_unit = config.base_amount_per_volume * (Decimal::ONE + pct);

    let base_amount = volume * config.base_amount_per_volume;
    let margin_amount = base_amount * pct;
    let total_required = base_amount + margin_amount;

    let existing_volume: Weight = processing_orders.iter().map(|order| order.volume).sum();
    let existing_amount = existing_volume * per_unit;

    let total_needed = total_required + existing_amount;
    let remaining_balance = account.cash_balance - total_needed;

    let headroom = account.cash_balance - existing_amount;
    let max_allowed_volume = if per_unit.is_zero() || headroom <= Decimal::ZERO {
        Decimal::ZERO
    } else {
        (headroom / per_unit).floor()
    };

    let ok = remaining_balance >= Decimal::ZERO && volume > Decimal::ZERO;
    let message = if ok {
        format!("Volume {volume} approved; {remaining_balance} AED remains after reservation")
    } else if volume <= Decimal::ZERO {
        "Volume must be greater than zero".to_string()
    } else {
        format!(
            "Insufficient balance: {total_needed} AED needed, {} AED available. \
             Maximum volume: {max_allowed_volume}",
            account.cash_balance
        )
    };

    BalanceCheck {
        ok,
        user_balance: account.cash_balance,
        base_amount,
        margin_amount,
        total_required,
        existing_volume,
        existing_amount,
        total_needed,
        remaining_balance,
        max_allowed_volume,
        message,
    }
}
