use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use bullion_core::pricing::gold_weight_value;
use bullion_core::{
    Account, AccountStatus, Asset, EntryKind, KycStatus, OrderStatus, PositionStatus, Side,
    TransactionKind, TransactionStatus,
};
use bullion_engine::{
    CloseUpdate, EngineConfig, EngineError, OpenTradeRequest, TradingEngine, TransactionRequest,
    UpstreamClose,
};
use bullion_paper::PaperVenue;
use bullion_store::repository::{accounts, ledger};
use bullion_store::Store;

struct Fixture {
    engine: TradingEngine,
    store: Arc<Store>,
    venue: PaperVenue,
    admin: Uuid,
    user: Uuid,
}

fn fixture_with_cash(cash: Decimal) -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let venue = PaperVenue::new();
    venue.set_quote("XAUUSD", dec!(1900), dec!(1902));

    let admin = Uuid::new_v4();
    let user = Uuid::new_v4();
    let account = Account {
        id: user,
        ref_mid: "10234".into(),
        account_head: "Al Noor Jewellery".into(),
        accode: "ANJ-01".into(),
        account_type: "trading".into(),
        cash_balance: cash,
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

    let engine = TradingEngine::new(
        Arc::clone(&store),
        Arc::new(venue.clone()),
        EngineConfig::default(),
    );
    Fixture {
        engine,
        store,
        venue,
        admin,
        user,
    }
}

fn buy_request(volume: Decimal, spot: Decimal, margin: Option<Decimal>) -> OpenTradeRequest {
    OpenTradeRequest {
        symbol: "GOLD".into(),
        side: Side::Buy,
        volume,
        price: spot,
        required_margin: margin,
        opening_date: None,
        comment: None,
        place_upstream: true,
    }
}

#[tokio::test]
async fn open_reserves_margin_and_writes_four_entries() {
    let fx = fixture_with_cash(dec!(10000));

    let outcome = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();

    assert_eq!(outcome.order.status, OrderStatus::Processing);
    assert_eq!(outcome.order.opening_price, dec!(1902.5));
    assert_eq!(outcome.balances.cash, dec!(9980.975));
    assert_eq!(outcome.balances.gold, dec!(0.01));
    assert_eq!(outcome.ledger_entries.len(), 4);
    assert!(outcome.order.ticket.is_some());
    assert_eq!(
        outcome.lp_position.position_id,
        outcome.order.order_no,
        "LP position mirrors the client order"
    );
    assert_eq!(outcome.lp_position.entry_price, dec!(1902));

    let account = fx
        .store
        .with_conn(|conn| accounts::by_id(conn, fx.user))
        .unwrap();
    assert_eq!(account.cash_balance, dec!(9980.975));
    assert_eq!(account.metal_weight, dec!(0.01));

    let rows = fx
        .store
        .with_conn(|conn| ledger::by_reference(conn, &outcome.order.order_no))
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].kind, EntryKind::Order);
    assert!(rows
        .iter()
        .all(|row| row.reference_number == outcome.order.order_no));
}

#[tokio::test]
async fn close_settles_profit_and_releases_metal() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();

    // Market moved up: closing a BUY uses bid 1904 minus the 0.5 spread.
    let closed = fx
        .engine
        .close_trade(
            fx.admin,
            opened.order.id,
            CloseUpdate {
                order_status: Some(OrderStatus::Closed),
                closing_price: Some(dec!(1904)),
                ..CloseUpdate::default()
            },
        )
        .unwrap();

    assert_eq!(closed.client_profit, dec!(0.0100));
    assert_eq!(closed.order.status, OrderStatus::Closed);
    assert_eq!(closed.order.closing_price, Some(dec!(1904)));
    assert!(closed.order.closing_date.is_some());
    assert_eq!(closed.order.profit, dec!(0.01));
    // cash back: margin 19.025 + user profit 0.01
    assert_eq!(closed.balances.cash, dec!(10000.01));
    assert_eq!(closed.balances.gold, dec!(0));
    assert_eq!(closed.lp_position.status, PositionStatus::Closed);
    assert_eq!(closed.lp_position.closing_price, Some(dec!(1904)));
    assert_eq!(closed.ledger_entries.len(), 4);

    // Spread capture across both legs, in gold-weight AED terms.
    let expected_lp = (gold_weight_value(dec!(1902), dec!(0.01))
        - gold_weight_value(dec!(1902.5), dec!(0.01)))
    .abs()
        + (gold_weight_value(dec!(1904), dec!(0.01))
            - gold_weight_value(dec!(1903.5), dec!(0.01)))
        .abs();
    assert_eq!(
        closed.lp_position.profit,
        bullion_core::pricing::round_money(expected_lp)
    );
}

#[tokio::test]
async fn round_trip_at_same_spot_costs_the_full_spread() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(2), dec!(1900), Some(dec!(3800))))
        .await
        .unwrap();

    let closed = fx
        .engine
        .close_trade(
            fx.admin,
            opened.order.id,
            CloseUpdate {
                order_status: Some(OrderStatus::Closed),
                closing_price: Some(dec!(1900)),
                ..CloseUpdate::default()
            },
        )
        .unwrap();

    // Half-spread paid on each side: (0.5 + 0.5) * 2 bars.
    assert_eq!(closed.client_profit, dec!(-2.0));
    assert_eq!(closed.order.profit, dec!(-2.00));
    // Losses are not deducted twice: only the margin comes back.
    assert_eq!(closed.balances.cash, dec!(10000));
}

#[tokio::test]
async fn sell_close_mirrors_metal_restoration() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(
            fx.admin,
            fx.user,
            OpenTradeRequest {
                side: Side::Sell,
                ..buy_request(dec!(1), dec!(1900), Some(dec!(1899.5)))
            },
        )
        .await
        .unwrap();
    // SELL removes metal at open.
    assert_eq!(opened.balances.gold, dec!(-1));
    assert_eq!(opened.order.opening_price, dec!(1899.5));

    let closed = fx
        .engine
        .close_trade(
            fx.admin,
            opened.order.id,
            CloseUpdate {
                order_status: Some(OrderStatus::Closed),
                closing_price: Some(dec!(1898)),
                ..CloseUpdate::default()
            },
        )
        .unwrap();

    // Closing a SELL buys at ask: 1898 + 0.5.
    assert_eq!(closed.client_profit, dec!(1.0));
    assert_eq!(closed.balances.gold, dec!(0));
}

#[tokio::test]
async fn closing_twice_conflicts() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();

    let update = CloseUpdate {
        order_status: Some(OrderStatus::Closed),
        closing_price: Some(dec!(1904)),
        ..CloseUpdate::default()
    };
    fx.engine
        .close_trade(fx.admin, opened.order.id, update.clone())
        .unwrap();
    let err = fx
        .engine
        .close_trade(fx.admin, opened.order.id, update)
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn cancel_reverses_the_opening_deltas() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.5), dec!(1902), Some(dec!(950))))
        .await
        .unwrap();
    assert_eq!(opened.balances.cash, dec!(9050));

    let cancelled = fx
        .engine
        .close_trade(
            fx.admin,
            opened.order.id,
            CloseUpdate {
                order_status: Some(OrderStatus::Cancelled),
                ..CloseUpdate::default()
            },
        )
        .unwrap();

    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.balances.cash, dec!(10000));
    assert_eq!(cancelled.balances.gold, dec!(0));
    assert_eq!(cancelled.client_profit, dec!(0));

    let rows = fx
        .store
        .with_conn(|conn| ledger::by_reference(conn, &opened.order.order_no))
        .unwrap();
    assert_eq!(rows.len(), 8, "four opening plus four reversal entries");
}

#[tokio::test]
async fn cross_admin_access_is_not_found() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();

    let stranger = Uuid::new_v4();
    let err = fx
        .engine
        .close_trade(stranger, opened.order.id, CloseUpdate::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn transient_rejection_persists_nothing_then_succeeds() {
    let fx = fixture_with_cash(dec!(10000));
    fx.venue.script_retcodes([10_020]);

    let err = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Upstream(_)));
    assert!(fx.engine.processing_orders(fx.user).unwrap().is_empty());

    // Retcodes exhausted: the next attempt fills and persists exactly once.
    let outcome = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();
    assert_eq!(outcome.order.status, OrderStatus::Processing);
    assert_eq!(fx.engine.processing_orders(fx.user).unwrap().len(), 1);
}

#[tokio::test]
async fn vanished_upstream_position_leaves_balances_untouched() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();
    fx.venue.vanish_ticket(opened.order.ticket.unwrap());

    let result = fx
        .engine
        .close_order_upstream(fx.admin, opened.order.id)
        .await
        .unwrap();
    assert!(matches!(result, UpstreamClose::LikelyClosed { .. }));

    let account = fx
        .store
        .with_conn(|conn| accounts::by_id(conn, fx.user))
        .unwrap();
    assert_eq!(account.cash_balance, dec!(9980.975));
    assert_eq!(account.metal_weight, dec!(0.01));
}

#[tokio::test]
async fn upstream_close_settles_at_venue_price() {
    let fx = fixture_with_cash(dec!(10000));
    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();

    // Venue bid moved to 1904 before the close.
    fx.venue.set_quote("XAUUSD", dec!(1904), dec!(1906));
    let result = fx
        .engine
        .close_order_upstream(fx.admin, opened.order.id)
        .await
        .unwrap();
    match result {
        UpstreamClose::Settled(outcome) => {
            assert_eq!(outcome.order.closing_price, Some(dec!(1904)));
            assert_eq!(outcome.client_profit, dec!(0.0100));
        }
        UpstreamClose::LikelyClosed { .. } => panic!("expected settlement"),
    }
}

#[tokio::test]
async fn negative_metal_gate_rejects_uncovered_sell() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let venue = PaperVenue::new();
    venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
    let admin = Uuid::new_v4();
    let user = Uuid::new_v4();
    let account = Account {
        id: user,
        ref_mid: "10777".into(),
        account_head: "strict".into(),
        accode: "ST-01".into(),
        account_type: "trading".into(),
        cash_balance: dec!(10000),
        metal_weight: dec!(0.5),
        margin_pct: dec!(20),
        ask_spread: dec!(0.5),
        bid_spread: dec!(0.5),
        admin_owner: admin,
        phone_number: "971509876543".into(),
        email: None,
        status: AccountStatus::Active,
        kyc_status: KycStatus::Verified,
        created_at: Utc::now(),
    };
    store.with_tx(|tx| accounts::insert(tx, &account)).unwrap();

    let engine = TradingEngine::new(
        store,
        Arc::new(venue),
        EngineConfig {
            allow_negative_metal: false,
            ..EngineConfig::default()
        },
    );

    let err = engine
        .open_trade(
            admin,
            user,
            OpenTradeRequest {
                side: Side::Sell,
                ..buy_request(dec!(1), dec!(1900), Some(dec!(1900)))
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance(_)));
}

#[test]
fn deposit_then_withdrawal_conserves_the_ledger() {
    let fx = fixture_with_cash(dec!(0));

    let deposit = fx
        .engine
        .create_transaction(
            fx.admin,
            TransactionRequest {
                kind: TransactionKind::Deposit,
                asset: Asset::Cash,
                amount: dec!(500),
                user: fx.user,
            },
        )
        .unwrap();
    assert_eq!(deposit.new_balance, dec!(500));
    assert_eq!(deposit.status, TransactionStatus::Completed);
    assert_eq!(fx.engine.ledger_sum(fx.user, Asset::Cash).unwrap(), dec!(500));

    // Over-withdrawal fails and leaves the balance unchanged.
    let err = fx
        .engine
        .create_transaction(
            fx.admin,
            TransactionRequest {
                kind: TransactionKind::Withdrawal,
                asset: Asset::Cash,
                amount: dec!(600),
                user: fx.user,
            },
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance(_)));
    let account = fx
        .store
        .with_conn(|conn| accounts::by_id(conn, fx.user))
        .unwrap();
    assert_eq!(account.cash_balance, dec!(500));

    // An exact withdrawal zeroes both the balance and the signed ledger sum.
    fx.engine
        .create_transaction(
            fx.admin,
            TransactionRequest {
                kind: TransactionKind::Withdrawal,
                asset: Asset::Cash,
                amount: dec!(500),
                user: fx.user,
            },
        )
        .unwrap();
    assert_eq!(fx.engine.ledger_sum(fx.user, Asset::Cash).unwrap(), dec!(0));
}

#[test]
fn cancelling_a_completed_deposit_reverses_it() {
    let fx = fixture_with_cash(dec!(0));
    let deposit = fx
        .engine
        .create_transaction(
            fx.admin,
            TransactionRequest {
                kind: TransactionKind::Deposit,
                asset: Asset::Cash,
                amount: dec!(500),
                user: fx.user,
            },
        )
        .unwrap();

    let updated = fx
        .engine
        .update_transaction_status(
            fx.admin,
            &deposit.transaction_id,
            TransactionStatus::Cancelled,
        )
        .unwrap();
    assert_eq!(updated.status, TransactionStatus::Cancelled);

    let account = fx
        .store
        .with_conn(|conn| accounts::by_id(conn, fx.user))
        .unwrap();
    assert_eq!(account.cash_balance, dec!(0));
    assert_eq!(fx.engine.ledger_sum(fx.user, Asset::Cash).unwrap(), dec!(0));
}

#[tokio::test]
async fn ledger_conservation_holds_across_a_full_lifecycle() {
    let fx = fixture_with_cash(dec!(0));
    fx.engine
        .create_transaction(
            fx.admin,
            TransactionRequest {
                kind: TransactionKind::Deposit,
                asset: Asset::Cash,
                amount: dec!(10000),
                user: fx.user,
            },
        )
        .unwrap();

    let opened = fx
        .engine
        .open_trade(fx.admin, fx.user, buy_request(dec!(0.01), dec!(1902), Some(dec!(19.025))))
        .await
        .unwrap();
    fx.engine
        .close_trade(
            fx.admin,
            opened.order.id,
            CloseUpdate {
                order_status: Some(OrderStatus::Closed),
                closing_price: Some(dec!(1904)),
                ..CloseUpdate::default()
            },
        )
        .unwrap();

    let account = fx
        .store
        .with_conn(|conn| accounts::by_id(conn, fx.user))
        .unwrap();
    assert_eq!(
        fx.engine.ledger_sum(fx.user, Asset::Cash).unwrap(),
        account.cash_balance
    );
    assert_eq!(
        fx.engine.ledger_sum(fx.user, Asset::Gold).unwrap(),
        account.metal_weight
    );
}
