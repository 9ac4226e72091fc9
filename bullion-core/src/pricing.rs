//! Pure price derivation from spot XAU/USD to client-visible TTB prices.
//!
//! A TTB (Ten-Tola Bar) weighs 116.64 g. Upstream quotes are USD per troy
//! ounce; client prices are AED per bar.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::{Price, Side, Weight};

/// Grams per troy ounce.
pub const TROY_OUNCE_GRAMS: Decimal = dec!(31.103);
/// USD to AED conversion factor.
pub const USD_TO_AED: Decimal = dec!(3.674);
/// Grams per Ten-Tola Bar.
pub const TTB_GRAMS: Decimal = dec!(116.64);

/// AED price of one bar at the given spot XAU/USD price.
#[must_use]
pub fn spot_to_ttb(spot: Price) -> Price {
    spot / TROY_OUNCE_GRAMS * USD_TO_AED * TTB_GRAMS
}

/// Client-visible price when opening: BUY pays the ask spread on top of
/// spot, SELL gives up the bid spread.
#[must_use]
pub fn quote_for_open(spot: Price, side: Side, ask_spread: Price, bid_spread: Price) -> Price {
    match side {
        Side::Buy => spot + ask_spread,
        Side::Sell => spot - bid_spread,
    }
}

/// Client-visible price when closing. The opposite-side rule applies:
/// closing a BUY sells into the bid, closing a SELL buys at the ask.
#[must_use]
pub fn quote_for_close(spot: Price, side: Side, ask_spread: Price, bid_spread: Price) -> Price {
    match side {
        Side::Buy => spot - bid_spread,
        Side::Sell => spot + ask_spread,
    }
}

/// AED value of `volume` bars priced at `price` spot.
#[must_use]
pub fn gold_weight_value(price: Price, volume: Weight) -> Price {
    spot_to_ttb(price) * volume
}

/// Round a monetary amount to 2 decimal places, half away from zero.
#[must_use]
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttb_price_scales_linearly_with_spot() {
        let one = spot_to_ttb(dec!(1));
        assert_eq!(spot_to_ttb(dec!(1900)), one * dec!(1900));
        // 1 / 31.103 * 3.674 * 116.64
        assert_eq!(round_money(one), dec!(13.78));
    }

    #[test]
    fn open_quote_applies_side_spread() {
        let spot = dec!(1902);
        assert_eq!(
            quote_for_open(spot, Side::Buy, dec!(0.5), dec!(0.75)),
            dec!(1902.5)
        );
        assert_eq!(
            quote_for_open(spot, Side::Sell, dec!(0.5), dec!(0.75)),
            dec!(1901.25)
        );
    }

    #[test]
    fn close_quote_uses_opposite_side() {
        let spot = dec!(1904);
        // Closing a BUY sells into the bid.
        assert_eq!(
            quote_for_close(spot, Side::Buy, dec!(0.5), dec!(0.5)),
            dec!(1903.5)
        );
        // Closing a SELL buys at the ask.
        assert_eq!(
            quote_for_close(spot, Side::Sell, dec!(0.5), dec!(0.5)),
            dec!(1904.5)
        );
    }

    #[test]
    fn gold_weight_value_scales_with_volume() {
        let unit = gold_weight_value(dec!(1900), dec!(1));
        assert_eq!(gold_weight_value(dec!(1900), dec!(3)), unit * dec!(3));
    }

    #[test]
    fn round_money_is_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
        assert_eq!(round_money(dec!(19.0249)), dec!(19.02));
    }
}
