//! Per-phone conversational sessions driving the trading engine.
//!
//! Sessions are lazily created on the first inbound message, cached in
//! memory, and evicted after inactivity. The command parser runs before
//! state dispatch on every message; order placement always re-quotes at
//! confirmation time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use bullion_core::pricing::{quote_for_open, spot_to_ttb};
use bullion_core::{Account, Order, Price, Quote, Side, Symbol, Weight};
use bullion_engine::{
    EngineError, OpenTradeRequest, TradingEngine, UpstreamClose,
};
use bullion_marketdata::MarketDataService;

pub mod parser;
mod render;

pub use parser::{parse, CloseTarget, Command};

/// Conversational position of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Start,
    MainMenu,
    /// A side was chosen; the next number is the volume.
    AwaitingVolume(Side),
    ConfirmOrder,
    Statement,
}

/// A quoted order waiting for Y/N confirmation.
#[derive(Clone, Debug)]
pub struct PendingOrder {
    pub side: Side,
    pub volume: Weight,
    /// Spot used for the quote (ask for BUY, bid for SELL).
    pub spot: Price,
    /// Client AED price per bar, spread applied.
    pub unit_price: Price,
    pub total_cost: Price,
}

/// Per-phone conversational state.
#[derive(Clone, Debug)]
pub struct Session {
    pub phone: String,
    pub account_id: Uuid,
    pub admin_id: Uuid,
    pub user_name: Option<String>,
    pub state: SessionState,
    pub pending_order: Option<PendingOrder>,
    /// Cached open orders backing `CLOSE <index>`.
    pub open_orders: Vec<Order>,
    pub last_activity: Instant,
}

impl Session {
    fn new(phone: &str, account: &Account, user_name: Option<&str>) -> Self {
        Self {
            phone: phone.to_string(),
            account_id: account.id,
            admin_id: account.admin_owner,
            user_name: user_name.map(str::to_string),
            state: SessionState::Start,
            pending_order: None,
            open_orders: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::MainMenu;
        self.pending_order = None;
    }
}

/// In-memory session registry with idle eviction.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Load the session for a phone, creating one lazily.
    pub fn get_or_create(
        &self,
        phone: &str,
        account: &Account,
        user_name: Option<&str>,
    ) -> Session {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(phone.to_string())
            .or_insert_with(|| Session::new(phone, account, user_name));
        if session.user_name.is_none() {
            session.user_name = user_name.map(str::to_string);
        }
        session.last_activity = Instant::now();
        session.clone()
    }

    /// Persist the post-dispatch session state.
    pub fn store(&self, session: Session) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.phone.clone(), session);
    }

    /// Drop sessions idle past the timeout. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity.elapsed() < self.idle_timeout);
        before - sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}

/// Handler settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Logical instrument clients trade (order records).
    pub symbol: Symbol,
    /// Venue symbol quoted for pricing.
    pub venue_symbol: Symbol,
    pub idle_timeout: Duration,
    /// Ledger entries shown per statement page.
    pub statement_page: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            symbol: "GOLD".into(),
            venue_symbol: "XAUUSD".into(),
            idle_timeout: Duration::from_secs(30 * 60),
            statement_page: 5,
        }
    }
}

/// Reply produced by one inbound message.
#[derive(Clone, Debug)]
pub struct SessionReply {
    pub text: String,
    /// Order the reply notifies about, when one was placed or closed; used
    /// to annotate the order if the outbound send fails.
    pub order_id: Option<Uuid>,
}

impl SessionReply {
    fn text_only(text: String) -> Self {
        Self {
            text,
            order_id: None,
        }
    }
}

/// Drives one inbound message through the session state machine.
pub struct SessionHandler {
    engine: Arc<TradingEngine>,
    market: Arc<MarketDataService>,
    manager: SessionManager,
    config: SessionConfig,
}

impl SessionHandler {
    pub fn new(
        engine: Arc<TradingEngine>,
        market: Arc<MarketDataService>,
        config: SessionConfig,
    ) -> Self {
        Self {
            engine,
            market,
            manager: SessionManager::new(config.idle_timeout),
            config,
        }
    }

    /// Session registry, exposed for eviction sweeps.
    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Process one authorized inbound message and produce the reply.
    pub async fn handle(
        &self,
        phone: &str,
        account: &Account,
        user_name: Option<&str>,
        body: &str,
    ) -> SessionReply {
        let mut session = self.manager.get_or_create(phone, account, user_name);
        let command = parser::parse(body);
        let reply = match self.dispatch(&mut session, account, command).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(phone = %session.phone, error = %err, "session command failed");
                let text = match err {
                    EngineError::InsufficientBalance(message) => render::failure(&message),
                    EngineError::Upstream(venue) => render::failure(&venue.to_string()),
                    EngineError::Conflict(message) => render::failure(&message),
                    _ => render::failure("an internal error occurred, please try again"),
                };
                SessionReply::text_only(text)
            }
        };
        self.manager.store(session);
        reply
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        account: &Account,
        command: Command,
    ) -> Result<SessionReply, EngineError> {
        match command {
            Command::Greet | Command::Menu => {
                session.reset();
                Ok(SessionReply::text_only(render::menu(
                    session.user_name.as_deref(),
                )))
            }
            Command::Reset => {
                session.reset();
                Ok(SessionReply::text_only(render::session_reset()))
            }
            Command::Cancel => {
                session.reset();
                Ok(SessionReply::text_only(render::cancelled()))
            }
            Command::Balance => {
                session.state = SessionState::MainMenu;
                let account = self.engine.account(session.admin_id, session.account_id)?;
                Ok(SessionReply::text_only(render::balance(&account)))
            }
            Command::Price | Command::Refresh => {
                session.state = SessionState::MainMenu;
                self.price_board(session, account).await
            }
            Command::Orders => {
                self.reload_orders(session)?;
                session.state = SessionState::MainMenu;
                Ok(SessionReply::text_only(render::orders_list(
                    &session.open_orders,
                )))
            }
            Command::Statement => {
                session.state = SessionState::Statement;
                let entries = self.engine.statement(
                    session.account_id,
                    self.config.statement_page,
                    0,
                )?;
                Ok(SessionReply::text_only(render::statement(&entries)))
            }
            Command::Shortcode { side, volume } => {
                let side = side.unwrap_or(match session.state {
                    SessionState::AwaitingVolume(side) => side,
                    _ => Side::Buy,
                });
                self.quote_order(session, account, side, volume).await
            }
            Command::Number(value) => self.dispatch_number(session, account, value).await,
            Command::Close(target) => self.close_order(session, target).await,
            Command::Text(text) => self.dispatch_text(session, account, &text).await,
        }
    }

    /// Bare numbers: a volume answer when one is awaited, a menu choice for
    /// the reserved digits, an implicit BUY otherwise.
    async fn dispatch_number(
        &self,
        session: &mut Session,
        account: &Account,
        value: Decimal,
    ) -> Result<SessionReply, EngineError> {
        if let SessionState::AwaitingVolume(side) = session.state {
            return self.quote_order(session, account, side, value).await;
        }
        if value == Decimal::ONE {
            session.state = SessionState::AwaitingVolume(Side::Buy);
            return Ok(SessionReply::text_only(render::ask_volume(Side::Buy)));
        }
        if value == Decimal::TWO {
            session.state = SessionState::AwaitingVolume(Side::Sell);
            return Ok(SessionReply::text_only(render::ask_volume(Side::Sell)));
        }
        if value == Decimal::from(3) {
            return self.price_board(session, account).await;
        }
        if value == Decimal::from(4) {
            self.reload_orders(session)?;
            session.state = SessionState::MainMenu;
            return Ok(SessionReply::text_only(render::orders_list(
                &session.open_orders,
            )));
        }
        if value == Decimal::from(5) {
            session.state = SessionState::MainMenu;
            let account = self.engine.account(session.admin_id, session.account_id)?;
            return Ok(SessionReply::text_only(render::balance(&account)));
        }
        self.quote_order(session, account, Side::Buy, value).await
    }

    async fn dispatch_text(
        &self,
        session: &mut Session,
        account: &Account,
        text: &str,
    ) -> Result<SessionReply, EngineError> {
        match session.state {
            SessionState::ConfirmOrder => match text.to_ascii_uppercase().as_str() {
                "Y" | "YES" => self.confirm_order(session, account).await,
                "N" | "NO" => {
                    session.reset();
                    Ok(SessionReply::text_only(render::cancelled()))
                }
                _ => Ok(SessionReply::text_only(render::confirm_prompt())),
            },
            SessionState::AwaitingVolume(side) => {
                Ok(SessionReply::text_only(render::ask_volume(side)))
            }
            _ => Ok(SessionReply::text_only(render::unknown())),
        }
    }

    async fn price_board(
        &self,
        session: &mut Session,
        account: &Account,
    ) -> Result<SessionReply, EngineError> {
        self.market.add_subscriber(session.phone.clone());
        let quote = self
            .market
            .market_data(&self.config.venue_symbol)
            .await
            .map_err(EngineError::Upstream);
        let quote = match quote {
            Ok(quote) => quote,
            Err(_) => return Ok(SessionReply::text_only(render::pricing_unavailable())),
        };
        let buy = spot_to_ttb(quote_for_open(
            quote.ask,
            Side::Buy,
            account.ask_spread,
            account.bid_spread,
        ));
        let sell = spot_to_ttb(quote_for_open(
            quote.bid,
            Side::Sell,
            account.ask_spread,
            account.bid_spread,
        ));
        session.state = SessionState::MainMenu;
        Ok(SessionReply::text_only(render::price_board(
            &quote, buy, sell,
        )))
    }

    async fn quote_order(
        &self,
        session: &mut Session,
        account: &Account,
        side: Side,
        volume: Weight,
    ) -> Result<SessionReply, EngineError> {
        let check =
            self.engine
                .check_sufficient_balance(session.admin_id, session.account_id, volume)?;
        if !check.ok {
            session.state = SessionState::MainMenu;
            return Ok(SessionReply::text_only(render::insufficient(&check)));
        }

        let Some((pending, quote)) = self.build_quote(account, side, volume).await else {
            session.state = SessionState::MainMenu;
            return Ok(SessionReply::text_only(render::pricing_unavailable()));
        };
        let reply = render::confirm(&pending, &quote);
        session.pending_order = Some(pending);
        session.state = SessionState::ConfirmOrder;
        Ok(SessionReply::text_only(reply))
    }

    async fn confirm_order(
        &self,
        session: &mut Session,
        account: &Account,
    ) -> Result<SessionReply, EngineError> {
        let Some(pending) = session.pending_order.clone() else {
            session.reset();
            return Ok(SessionReply::text_only(render::unknown()));
        };

        // Re-quote at confirmation time; the pending quote may be stale.
        let Some((pending, _)) = self
            .build_quote(account, pending.side, pending.volume)
            .await
        else {
            return Ok(SessionReply::text_only(render::pricing_unavailable()));
        };

        let outcome = self
            .engine
            .open_trade(
                session.admin_id,
                session.account_id,
                OpenTradeRequest {
                    symbol: self.config.symbol.clone(),
                    side: pending.side,
                    volume: pending.volume,
                    price: pending.spot,
                    required_margin: None,
                    opening_date: None,
                    comment: Some(format!("chat:{}", session.phone)),
                    place_upstream: true,
                },
            )
            .await?;

        info!(
            phone = %session.phone,
            order_no = %outcome.order.order_no,
            "order placed from chat"
        );
        session.reset();
        self.reload_orders(session)?;
        Ok(SessionReply {
            text: render::order_placed(&outcome),
            order_id: Some(outcome.order.id),
        })
    }

    async fn close_order(
        &self,
        session: &mut Session,
        target: CloseTarget,
    ) -> Result<SessionReply, EngineError> {
        if session.open_orders.is_empty() {
            self.reload_orders(session)?;
        }
        let order = match &target {
            CloseTarget::Index(index) => session.open_orders.get(index - 1).cloned(),
            CloseTarget::OrderNo(order_no) => session
                .open_orders
                .iter()
                .find(|order| order.order_no.eq_ignore_ascii_case(order_no))
                .cloned(),
        };
        let Some(order) = order else {
            return Ok(SessionReply::text_only(render::order_not_found()));
        };

        let result = self
            .engine
            .close_order_upstream(session.admin_id, order.id)
            .await?;
        self.reload_orders(session)?;
        session.state = SessionState::MainMenu;
        match result {
            UpstreamClose::Settled(outcome) => Ok(SessionReply {
                text: render::order_closed(
                    &outcome.order,
                    outcome.client_profit,
                    outcome.balances.cash,
                    outcome.balances.gold,
                ),
                order_id: Some(outcome.order.id),
            }),
            UpstreamClose::LikelyClosed { order } => Ok(SessionReply {
                text: render::likely_closed(&order.order_no),
                order_id: Some(order.id),
            }),
        }
    }

    async fn build_quote(
        &self,
        account: &Account,
        side: Side,
        volume: Weight,
    ) -> Option<(PendingOrder, Quote)> {
        let quote = self
            .market
            .market_data(&self.config.venue_symbol)
            .await
            .ok()?;
        let spot = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        let client_price = quote_for_open(spot, side, account.ask_spread, account.bid_spread);
        let unit_price = spot_to_ttb(client_price);
        Some((
            PendingOrder {
                side,
                volume,
                spot,
                unit_price,
                total_cost: unit_price * volume,
            },
            quote,
        ))
    }

    fn reload_orders(&self, session: &mut Session) -> Result<(), EngineError> {
        session.open_orders = self.engine.processing_orders(session.account_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bullion_core::{AccountStatus, KycStatus};
    use bullion_engine::EngineConfig;
    use bullion_marketdata::MarketDataConfig;
    use bullion_paper::PaperVenue;
    use bullion_store::repository::accounts;
    use bullion_store::Store;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Chat {
        handler: SessionHandler,
        account: Account,
    }

    impl Chat {
        async fn send(&self, body: &str) -> String {
            self.handler
                .handle("whatsapp:+971501234567", &self.account, Some("Fatima"), body)
                .await
                .text
        }
    }

    fn chat_fixture() -> Chat {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));

        let admin = Uuid::new_v4();
        let account = Account {
            id: Uuid::new_v4(),
            ref_mid: "10234".into(),
            account_head: "Fatima".into(),
            accode: "F-01".into(),
            account_type: "trading".into(),
            cash_balance: dec!(100000),
            metal_weight: dec!(0),
            margin_pct: dec!(20),
            ask_spread: dec!(0.5),
            bid_spread: dec!(0.5),
            admin_owner: admin,
            phone_number: "971501234567".into(),
            email: None,
            status: AccountStatus::Active,
            kyc_status: KycStatus::Verified,
            created_at: Utc::now(),
        };
        store.with_tx(|tx| accounts::insert(tx, &account)).unwrap();

        let engine = Arc::new(TradingEngine::new(
            store,
            Arc::new(venue.clone()),
            EngineConfig::default(),
        ));
        let market = Arc::new(MarketDataService::new(
            Arc::new(venue),
            MarketDataConfig::default(),
        ));
        let handler = SessionHandler::new(engine, market, SessionConfig::default());
        Chat { handler, account }
    }

    #[tokio::test]
    async fn greeting_shows_the_menu() {
        let chat = chat_fixture();
        let reply = chat.send("hi").await;
        assert!(reply.contains("Welcome Fatima!"));
        assert!(reply.contains("1. Buy TTB"));
    }

    #[tokio::test]
    async fn menu_digit_then_number_quotes_with_chosen_side() {
        let chat = chat_fixture();
        chat.send("hi").await;
        let reply = chat.send("2").await;
        assert!(reply.contains("SELL"), "menu digit 2 starts the sell flow");
        // In AWAITING_VOLUME, "2" is the volume, not a menu choice.
        let reply = chat.send("2").await;
        assert!(reply.contains("Confirm SELL 2 TTB"), "got: {reply}");
    }

    #[tokio::test]
    async fn shortcode_quotes_and_confirms_an_order() {
        let chat = chat_fixture();
        let reply = chat.send("BUY 1").await;
        assert!(reply.contains("Confirm BUY 1 TTB"), "got: {reply}");

        let reply = chat.send("y").await;
        assert!(reply.contains("placed"), "got: {reply}");
        assert!(reply.contains("Cash:"));

        let reply = chat.send("orders").await;
        assert!(reply.contains("1."), "order listed: {reply}");
    }

    #[tokio::test]
    async fn placement_reply_carries_the_order_id() {
        let chat = chat_fixture();
        chat.send("BUY 1").await;
        let reply = chat
            .handler
            .handle("whatsapp:+971501234567", &chat.account, None, "y")
            .await;
        assert!(reply.order_id.is_some());
    }

    #[tokio::test]
    async fn declining_the_confirmation_returns_to_menu() {
        let chat = chat_fixture();
        chat.send("2TTB").await;
        let reply = chat.send("n").await;
        assert!(reply.contains("cancelled"), "got: {reply}");
        let reply = chat.send("what").await;
        assert!(reply.contains("MENU"), "back at menu: {reply}");
    }

    #[tokio::test]
    async fn close_by_index_settles_the_order() {
        let chat = chat_fixture();
        chat.send("BUY 1").await;
        chat.send("y").await;

        let reply = chat.send("close 1").await;
        assert!(reply.contains("closed"), "got: {reply}");
        let reply = chat.send("orders").await;
        assert!(reply.contains("No open orders"), "got: {reply}");
    }

    #[tokio::test]
    async fn reserved_digits_route_to_balance_and_orders() {
        let chat = chat_fixture();
        let reply = chat.send("5").await;
        assert!(reply.contains("Cash:"), "got: {reply}");
        let reply = chat.send("4").await;
        assert!(reply.contains("No open orders"), "got: {reply}");
    }

    #[tokio::test]
    async fn oversized_order_reports_max_volume() {
        let chat = chat_fixture();
        let reply = chat.send("BUY 100").await;
        assert!(reply.contains("Insufficient balance"), "got: {reply}");
        assert!(reply.contains("Max volume"), "got: {reply}");
    }

    #[tokio::test]
    async fn price_command_renders_freshness() {
        let chat = chat_fixture();
        let reply = chat.send("price").await;
        assert!(reply.contains("Live"), "fresh quote labelled: {reply}");
        assert!(reply.contains("TTB buy:"));
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let manager = SessionManager::new(Duration::from_millis(0));
        let account = chat_fixture().account;
        manager.get_or_create("phone-1", &account, None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.evict_idle(), 1);
        assert!(manager.is_empty());
    }
}
