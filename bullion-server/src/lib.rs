//! Server wiring: context construction, startup and the HTTP listener.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bullion_broker::VenueClient;
use bullion_config::AppConfig;
use bullion_engine::{EngineConfig, PolicyConfig, TradingEngine};
use bullion_marketdata::{MarketDataConfig, MarketDataService};
use bullion_mt5::{Mt5Bridge, Mt5Config};
use bullion_paper::PaperVenue;
use bullion_session::{SessionConfig, SessionHandler};
use bullion_store::Store;

pub mod http;
pub mod messenger;
pub mod telemetry;
pub mod webhook;

use messenger::Messenger;
use telemetry::ServerMetrics;
use webhook::DedupCache;

/// Long-lived services shared by every request handler.
pub struct AppContext {
    pub store: Arc<Store>,
    pub venue: Arc<dyn VenueClient>,
    pub engine: Arc<TradingEngine>,
    pub market: Arc<MarketDataService>,
    pub sessions: Arc<SessionHandler>,
    pub messenger: Arc<Messenger>,
    pub dedup: DedupCache,
    pub metrics: Arc<ServerMetrics>,
    pub api_key: String,
    pub venue_symbol: String,
}

impl AppContext {
    /// Wire every service from configuration. The venue is connected and
    /// the traded symbol validated before this returns.
    pub async fn build(config: &AppConfig) -> Result<Arc<Self>> {
        let store = Arc::new(
            Store::open(&config.database.path).context("failed to open the database")?,
        );

        let venue: Arc<dyn VenueClient> = match config.mt5.driver.as_str() {
            "paper" => {
                warn!("paper venue selected; trades will not reach MT5");
                Arc::new(PaperVenue::new())
            }
            _ => Arc::new(
                Mt5Bridge::spawn(Mt5Config {
                    command: config.mt5.command.clone(),
                    args: config.mt5.args.clone(),
                    server: config.mt5.server.clone(),
                    login: config.mt5.login,
                    password: config.mt5.password.clone(),
                    request_timeout: Duration::from_secs(config.mt5.request_timeout_secs),
                    trade_timeout: Duration::from_secs(config.mt5.trade_timeout_secs),
                })
                .context("failed to spawn the MT5 sidecar")?,
            ),
        };

        venue.connect().await.context("venue connect failed")?;
        // Symbol discovery: fail startup when the traded symbol is absent.
        if config.mt5.driver != "paper" {
            let info = venue
                .symbol_info(&config.engine.venue_symbol)
                .await
                .with_context(|| {
                    format!("venue does not serve {}", config.engine.venue_symbol)
                })?;
            if !info.is_tradable() {
                anyhow::bail!("symbol {} is not tradable", config.engine.venue_symbol);
            }
        }

        let market = Arc::new(MarketDataService::new(
            Arc::clone(&venue),
            MarketDataConfig {
                default_interval: Duration::from_secs(config.market_data.poll_interval_secs),
                min_interval: Duration::from_secs(config.market_data.min_interval_secs),
                max_interval: Duration::from_secs(config.market_data.max_interval_secs),
                cache_ttl: Duration::from_secs(config.market_data.cache_ttl_secs),
                request_spacing: Duration::from_millis(50),
                inactive_timeout: Duration::from_secs(config.market_data.inactive_timeout_secs),
            },
        ));
        market.track_symbol(config.engine.venue_symbol.clone());

        let engine = Arc::new(TradingEngine::new(
            Arc::clone(&store),
            Arc::clone(&venue),
            EngineConfig {
                venue_symbol: config.engine.venue_symbol.clone(),
                magic: config.engine.magic,
                sl_distance: config.engine.sl_distance,
                tp_distance: config.engine.tp_distance,
                allow_negative_metal: config.engine.allow_negative_metal,
                policy: PolicyConfig {
                    base_amount_per_volume: config.engine.base_amount_per_volume,
                    minimum_balance_pct: config.engine.minimum_balance_pct,
                },
            },
        ));

        let sessions = Arc::new(SessionHandler::new(
            Arc::clone(&engine),
            Arc::clone(&market),
            SessionConfig {
                symbol: config.engine.symbol.clone(),
                venue_symbol: config.engine.venue_symbol.clone(),
                idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
                statement_page: config.session.statement_page,
            },
        ));

        Ok(Arc::new(Self {
            store,
            venue,
            engine,
            market,
            sessions,
            messenger: Arc::new(Messenger::new(config.messaging.clone())),
            dedup: DedupCache::new(Duration::from_secs(config.session.dedup_ttl_secs)),
            metrics: Arc::new(ServerMetrics::new()),
            api_key: config.server.api_key.clone(),
            venue_symbol: config.engine.venue_symbol.clone(),
        }))
    }

    /// Test/development context over an in-memory store and a caller-built
    /// venue.
    pub fn for_testing(
        store: Arc<Store>,
        venue: Arc<dyn VenueClient>,
        api_key: &str,
    ) -> Arc<Self> {
        let market = Arc::new(MarketDataService::new(
            Arc::clone(&venue),
            MarketDataConfig::default(),
        ));
        let engine = Arc::new(TradingEngine::new(
            Arc::clone(&store),
            Arc::clone(&venue),
            EngineConfig::default(),
        ));
        let sessions = Arc::new(SessionHandler::new(
            Arc::clone(&engine),
            Arc::clone(&market),
            SessionConfig::default(),
        ));
        Arc::new(Self {
            store,
            venue,
            engine,
            market,
            sessions,
            messenger: Arc::new(Messenger::new(Default::default())),
            dedup: DedupCache::new(Duration::from_secs(300)),
            metrics: Arc::new(ServerMetrics::new()),
            api_key: api_key.to_string(),
            venue_symbol: "XAUUSD".into(),
        })
    }
}

/// Bind the API listener. Returns the bound address and the serve task.
pub async fn spawn_server(
    ctx: Arc<AppContext>,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |_| {
        let ctx = Arc::clone(&ctx);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, Infallible>(http::route(req, ctx).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(make_svc);
    let bound = server.local_addr();
    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!(error = %err, "api server terminated");
        }
    });
    info!(%bound, "api server listening");
    Ok((bound, handle))
}

/// Periodic housekeeping: dedup sweeps, session eviction, quote-age gauge.
pub fn spawn_housekeeping(ctx: Arc<AppContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let dropped = ctx.dedup.sweep();
            let evicted = ctx.sessions.manager().evict_idle();
            if dropped > 0 || evicted > 0 {
                info!(dropped, evicted, "housekeeping sweep");
            }
            if let Some(quote) = ctx.market.cached(&ctx.venue_symbol) {
                let age = quote.age(chrono::Utc::now()).num_milliseconds() as f64 / 1000.0;
                ctx.metrics.update_quote_age(age);
            }
        }
    })
}
