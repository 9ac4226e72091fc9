//! In-memory venue that fills trades immediately at the scripted quote.
//!
//! Used by the engine and server tests in place of the MT5 sidecar. Quotes
//! are set by the test; retcode sequences can be scripted to exercise the
//! retry paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;

use bullion_broker::{
    CloseOutcome, CloseRequest, SymbolInfo, TradeReceipt, TradeRequest, VenueClient, VenueError,
    VenuePosition, VenueQuote, VenueResult, RETCODE_DONE,
};
use bullion_core::{Side, Symbol};

#[derive(Default)]
struct PaperState {
    quotes: HashMap<Symbol, (Decimal, Decimal)>,
    positions: Vec<VenuePosition>,
    /// Retcodes popped ahead of each `place_trade`; empty means success.
    scripted_retcodes: VecDeque<u32>,
    /// Tickets the venue pretends not to know on close.
    vanished_tickets: Vec<u64>,
}

/// Scriptable in-memory [`VenueClient`].
#[derive(Clone)]
pub struct PaperVenue {
    state: Arc<Mutex<PaperState>>,
    connected: Arc<AtomicBool>,
    next_ticket: Arc<AtomicU64>,
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperVenue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState::default())),
            connected: Arc::new(AtomicBool::new(false)),
            next_ticket: Arc::new(AtomicU64::new(1_000)),
        }
    }

    /// Set the live bid/ask for a symbol.
    pub fn set_quote(&self, symbol: impl Into<Symbol>, bid: Decimal, ask: Decimal) {
        self.state
            .lock()
            .unwrap()
            .quotes
            .insert(symbol.into(), (bid, ask));
    }

    /// Drop the quote for a symbol so subsequent reads fail.
    pub fn clear_quote(&self, symbol: &str) {
        self.state.lock().unwrap().quotes.remove(symbol);
    }

    /// Queue retcodes to be returned by upcoming `place_trade` calls.
    pub fn script_retcodes(&self, retcodes: impl IntoIterator<Item = u32>) {
        self.state
            .lock()
            .unwrap()
            .scripted_retcodes
            .extend(retcodes);
    }

    /// Make a ticket vanish so the next close reports "likely closed".
    pub fn vanish_ticket(&self, ticket: u64) {
        let mut state = self.state.lock().unwrap();
        state.vanished_tickets.push(ticket);
        state.positions.retain(|position| position.ticket != ticket);
    }

    /// Number of open scripted positions.
    #[must_use]
    pub fn open_positions(&self) -> usize {
        self.state.lock().unwrap().positions.len()
    }

    fn quote_for(&self, symbol: &str) -> VenueResult<(Decimal, Decimal)> {
        self.state
            .lock()
            .unwrap()
            .quotes
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::UnknownSymbol(symbol.to_string()))
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn connect(&self) -> VenueResult<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> VenueResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn symbols(&self) -> VenueResult<Vec<Symbol>> {
        Ok(self.state.lock().unwrap().quotes.keys().cloned().collect())
    }

    async fn symbol_info(&self, symbol: &str) -> VenueResult<SymbolInfo> {
        self.quote_for(symbol)?;
        Ok(SymbolInfo {
            name: symbol.to_string(),
            point: dec!(0.01),
            digits: 2,
            spread: dec!(20),
            trade_mode: 4,
            volume_min: dec!(0.01),
            volume_max: dec!(100),
            volume_step: dec!(0.01),
            stops_level: dec!(0),
            filling_mode: 1,
        })
    }

    async fn price(&self, symbol: &str) -> VenueResult<VenueQuote> {
        let (bid, ask) = self.quote_for(symbol)?;
        Ok(VenueQuote {
            symbol: symbol.to_string(),
            bid,
            ask,
            spread: (ask - bid) / dec!(0.01),
            time: Utc::now(),
        })
    }

    async fn place_trade(&self, request: TradeRequest) -> VenueResult<TradeReceipt> {
        let scripted = self.state.lock().unwrap().scripted_retcodes.pop_front();
        if let Some(retcode) = scripted {
            if retcode != RETCODE_DONE {
                return Err(VenueError::from_retcode(retcode));
            }
        }
        let (bid, ask) = self.quote_for(&request.symbol)?;
        let price = match request.side {
            Side::Buy => ask,
            Side::Sell => bid,
        };
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let position = VenuePosition {
            ticket,
            side: request.side,
            volume: request.volume,
            symbol: request.symbol.clone(),
            price_open: price,
            price_current: price,
            profit: Decimal::ZERO,
            comment: request.comment.clone(),
        };
        self.state.lock().unwrap().positions.push(position);
        info!(ticket, symbol = %request.symbol, "paper trade filled");
        Ok(TradeReceipt {
            ticket,
            deal: ticket,
            price,
            volume: request.volume,
            sl: Decimal::ZERO,
            tp: Decimal::ZERO,
            retcode: RETCODE_DONE,
        })
    }

    async fn positions(&self) -> VenueResult<Vec<VenuePosition>> {
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn close_trade(&self, request: CloseRequest) -> VenueResult<CloseOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.vanished_tickets.contains(&request.ticket) {
            return Ok(CloseOutcome::likely_closed());
        }
        let Some(index) = state
            .positions
            .iter()
            .position(|position| position.ticket == request.ticket)
        else {
            return Ok(CloseOutcome::likely_closed());
        };
        let position = state.positions.remove(index);
        let (bid, ask) = state
            .quotes
            .get(&position.symbol)
            .copied()
            .ok_or_else(|| VenueError::UnknownSymbol(position.symbol.clone()))?;
        // Closing a long sells into the bid; closing a short buys the ask.
        let close_price = match position.side {
            Side::Buy => bid,
            Side::Sell => ask,
        };
        let profit = match position.side {
            Side::Buy => (close_price - position.price_open) * position.volume,
            Side::Sell => (position.price_open - close_price) * position.volume,
        };
        Ok(CloseOutcome {
            success: true,
            close_price: Some(close_price),
            profit: Some(profit),
            deal: Some(request.ticket),
            likely_closed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fills_at_side_appropriate_price() {
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
        venue.connect().await.unwrap();

        let receipt = venue
            .place_trade(TradeRequest {
                symbol: "XAUUSD".into(),
                volume: dec!(0.01),
                side: Side::Buy,
                sl_distance: dec!(10),
                tp_distance: dec!(10),
                comment: String::new(),
                magic: 0,
            })
            .await
            .unwrap();
        assert_eq!(receipt.price, dec!(1902));
        assert_eq!(venue.open_positions(), 1);
    }

    #[tokio::test]
    async fn scripted_retcodes_surface_as_rejections() {
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
        venue.script_retcodes([10_020]);

        let err = venue
            .place_trade(TradeRequest {
                symbol: "XAUUSD".into(),
                volume: dec!(0.01),
                side: Side::Sell,
                sl_distance: dec!(10),
                tp_distance: dec!(10),
                comment: String::new(),
                magic: 0,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn vanished_ticket_reports_likely_closed() {
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
        venue.vanish_ticket(42);

        let outcome = venue
            .close_trade(CloseRequest {
                ticket: 42,
                symbol: "XAUUSD".into(),
                volume: None,
                side: Side::Buy,
            })
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.likely_closed);
    }
}
