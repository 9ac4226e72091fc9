//! Venue-agnostic traits used by the rest of the workspace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use bullion_core::{Price, Side, Symbol, Weight};

/// Convenience alias for venue results.
pub type VenueResult<T> = Result<T, VenueError>;

/// MT5 result code signalling a completed request.
pub const RETCODE_DONE: u32 = 10_009;

/// Common error type returned by venue connectors.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Transport-level failures (pipe closed, subprocess died, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// The request exceeded its deadline and was evicted.
    #[error("timed out after {seconds}s waiting for {action}")]
    Timeout { action: String, seconds: u64 },
    /// Operation attempted before `connect` succeeded.
    #[error("not connected to venue")]
    NotConnected,
    /// The venue does not know the requested symbol.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),
    /// The request parameters failed connector-side validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The venue answered with a business rejection carrying a retcode.
    #[error("venue rejected request: {message} (retcode {retcode})")]
    Rejected { retcode: u32, message: String },
    /// Wraps serialization or protocol parsing failures.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl VenueError {
    /// Build a rejection from a raw retcode using the standard message map.
    #[must_use]
    pub fn from_retcode(retcode: u32) -> Self {
        Self::Rejected {
            retcode,
            message: retcode_message(retcode).to_string(),
        }
    }

    /// Whether a retry with widened deviation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                retcode: 10_020 | 10_021,
                ..
            }
        )
    }
}

/// Human message for an MT5 trade-server result code.
#[must_use]
pub fn retcode_message(retcode: u32) -> &'static str {
    match retcode {
        10_009 => "done",
        10_013 => "requote",
        10_017 => "invalid parameters",
        10_018 => "market closed",
        10_019 => "insufficient funds",
        10_020 => "prices changed",
        10_021 => "invalid request (check volume, symbol, or market status)",
        10_022 => "invalid SL/TP",
        10_027 => "autotrading disabled",
        _ => "unknown venue error",
    }
}

/// Immutable metadata describing a tradable venue symbol.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SymbolInfo {
    pub name: Symbol,
    pub point: Decimal,
    pub digits: u32,
    pub spread: Decimal,
    /// Zero means the symbol is not tradable.
    pub trade_mode: i64,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    /// Minimum stop distance in points.
    pub stops_level: Decimal,
    pub filling_mode: i64,
}

impl SymbolInfo {
    /// Whether orders may be placed on this symbol at all.
    #[must_use]
    pub fn is_tradable(&self) -> bool {
        self.trade_mode != 0
    }

    /// Clamp a requested volume into the venue's bounds, snapped to the
    /// volume step.
    #[must_use]
    pub fn snap_volume(&self, volume: Decimal) -> Decimal {
        let stepped = if self.volume_step.is_zero() {
            volume
        } else {
            (volume / self.volume_step).round() * self.volume_step
        };
        stepped.clamp(self.volume_min, self.volume_max)
    }

    /// Minimum stop distance in price units.
    #[must_use]
    pub fn min_stop_distance(&self) -> Decimal {
        self.stops_level * self.point
    }
}

/// A bid/ask snapshot straight from the venue.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VenueQuote {
    pub symbol: Symbol,
    pub bid: Price,
    pub ask: Price,
    /// Venue spread in points.
    pub spread: Decimal,
    pub time: DateTime<Utc>,
}

/// Parameters for placing a market order upstream.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeRequest {
    pub symbol: Symbol,
    pub volume: Weight,
    pub side: Side,
    pub sl_distance: Decimal,
    pub tp_distance: Decimal,
    pub comment: String,
    pub magic: i64,
}

/// Fill confirmation returned by the venue.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeReceipt {
    pub ticket: u64,
    pub deal: u64,
    pub price: Price,
    pub volume: Weight,
    pub sl: Price,
    pub tp: Price,
    pub retcode: u32,
}

/// An open position as reported by the venue.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenuePosition {
    pub ticket: u64,
    pub side: Side,
    pub volume: Weight,
    pub symbol: Symbol,
    pub price_open: Price,
    pub price_current: Price,
    pub profit: Decimal,
    pub comment: String,
}

/// Parameters for closing an upstream position.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CloseRequest {
    pub ticket: u64,
    pub symbol: Symbol,
    /// Desired volume; the connector caps it at the live position volume.
    pub volume: Option<Weight>,
    pub side: Side,
}

/// Result of a close attempt. "Position not found" is non-fatal: the
/// position may already be closed upstream.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CloseOutcome {
    pub success: bool,
    pub close_price: Option<Price>,
    pub profit: Option<Decimal>,
    pub deal: Option<u64>,
    pub likely_closed: bool,
}

impl CloseOutcome {
    /// Outcome for a position the venue no longer knows about.
    #[must_use]
    pub fn likely_closed() -> Self {
        Self {
            success: false,
            close_price: None,
            profit: None,
            deal: None,
            likely_closed: true,
        }
    }
}

/// Trait describing the upstream execution venue (MT5 in production, the
/// paper venue in tests).
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Human-friendly connector name used for logging.
    fn name(&self) -> &str;

    /// Establish the upstream session. Idempotent.
    async fn connect(&self) -> VenueResult<()>;

    /// Tear the session down.
    async fn disconnect(&self) -> VenueResult<()>;

    /// All symbols known to the venue.
    async fn symbols(&self) -> VenueResult<Vec<Symbol>>;

    /// Metadata for one symbol.
    async fn symbol_info(&self, symbol: &str) -> VenueResult<SymbolInfo>;

    /// Latest bid/ask for a symbol.
    async fn price(&self, symbol: &str) -> VenueResult<VenueQuote>;

    /// Place a market order.
    async fn place_trade(&self, request: TradeRequest) -> VenueResult<TradeReceipt>;

    /// All open positions.
    async fn positions(&self) -> VenueResult<Vec<VenuePosition>>;

    /// Close an open position.
    async fn close_trade(&self, request: CloseRequest) -> VenueResult<CloseOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_info() -> SymbolInfo {
        SymbolInfo {
            name: "XAUUSD".into(),
            point: dec!(0.01),
            digits: 2,
            spread: dec!(20),
            trade_mode: 4,
            volume_min: dec!(0.01),
            volume_max: dec!(100),
            volume_step: dec!(0.01),
            stops_level: dec!(50),
            filling_mode: 1,
        }
    }

    #[test]
    fn snap_volume_clamps_and_steps() {
        let info = sample_info();
        assert_eq!(info.snap_volume(dec!(0.014)), dec!(0.01));
        assert_eq!(info.snap_volume(dec!(0.017)), dec!(0.02));
        assert_eq!(info.snap_volume(dec!(0.001)), dec!(0.01));
        assert_eq!(info.snap_volume(dec!(500)), dec!(100));
    }

    #[test]
    fn min_stop_distance_uses_points() {
        assert_eq!(sample_info().min_stop_distance(), dec!(0.50));
    }

    #[test]
    fn transient_retcodes_are_retryable() {
        assert!(VenueError::from_retcode(10_020).is_transient());
        assert!(VenueError::from_retcode(10_021).is_transient());
        assert!(!VenueError::from_retcode(10_019).is_transient());
        assert!(!VenueError::Transport("gone".into()).is_transient());
    }

    #[test]
    fn retcode_messages_cover_known_codes() {
        assert_eq!(retcode_message(10_018), "market closed");
        assert_eq!(retcode_message(10_019), "insufficient funds");
        assert_eq!(retcode_message(1), "unknown venue error");
    }
}
