//! Periodic quote poller with an adaptive interval.
//!
//! One service instance owns the cache for every subscribed symbol. The
//! poll loop refreshes only entries older than the cache TTL and widens its
//! interval under errors or inactivity; the first active subscriber tightens
//! it again. Reads are synchronous against the cache with an async
//! force-refresh fallback.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bullion_broker::{VenueClient, VenueError, VenueResult};
use bullion_core::{Quote, Symbol};

/// Tuning knobs for the poll loop.
#[derive(Clone, Debug)]
pub struct MarketDataConfig {
    pub default_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Cached quotes older than this are refreshed.
    pub cache_ttl: Duration,
    /// Spacing between per-symbol requests within one poll tick.
    pub request_spacing: Duration,
    /// No subscribers and no activity for this long widens the interval.
    pub inactive_timeout: Duration,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(10),
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(15),
            request_spacing: Duration::from_millis(50),
            inactive_timeout: Duration::from_secs(300),
        }
    }
}

struct ServiceState {
    cache: HashMap<Symbol, (Quote, Instant)>,
    symbols: HashSet<Symbol>,
    subscribers: HashSet<String>,
    last_activity: Instant,
    interval: Duration,
}

/// Single-writer cache of venue quotes shared across request handlers.
pub struct MarketDataService {
    venue: Arc<dyn VenueClient>,
    config: MarketDataConfig,
    state: Mutex<ServiceState>,
    /// Only one poll tick may run at a time.
    updating: AtomicBool,
}

impl MarketDataService {
    pub fn new(venue: Arc<dyn VenueClient>, config: MarketDataConfig) -> Self {
        let interval = config.default_interval;
        Self {
            venue,
            config,
            state: Mutex::new(ServiceState {
                cache: HashMap::new(),
                symbols: HashSet::new(),
                subscribers: HashSet::new(),
                last_activity: Instant::now(),
                interval,
            }),
            updating: AtomicBool::new(false),
        }
    }

    /// Add a symbol to the poll set.
    pub fn track_symbol(&self, symbol: impl Into<Symbol>) {
        self.state.lock().unwrap().symbols.insert(symbol.into());
    }

    /// Register an active consumer. The first one tightens the interval.
    pub fn add_subscriber(&self, id: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        state.last_activity = Instant::now();
        let was_empty = state.subscribers.is_empty();
        state.subscribers.insert(id.into());
        if was_empty {
            state.interval = clamp(
                state.interval.mul_f64(0.8),
                self.config.min_interval,
                self.config.max_interval,
            );
            debug!(interval = ?state.interval, "first subscriber, scaling up polling");
        }
    }

    /// Deregister a consumer.
    pub fn remove_subscriber(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.remove(id);
        state.last_activity = Instant::now();
    }

    /// Current poll interval (adaptive).
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.state.lock().unwrap().interval
    }

    /// Cached quote for a symbol, regardless of age.
    #[must_use]
    pub fn cached(&self, symbol: &str) -> Option<Quote> {
        self.state
            .lock()
            .unwrap()
            .cache
            .get(symbol)
            .map(|(quote, _)| quote.clone())
    }

    /// Return market data for a symbol, forcing a refresh when the cache is
    /// stale. A failed refresh falls back to the stale entry flagged
    /// `is_fresh = false`; with no cache at all the error surfaces.
    pub async fn market_data(&self, symbol: &str) -> VenueResult<Quote> {
        let cached = {
            let state = self.state.lock().unwrap();
            state.cache.get(symbol).cloned()
        };
        if let Some((quote, at)) = &cached {
            if at.elapsed() < self.config.cache_ttl {
                return Ok(quote.clone());
            }
        }
        match self.refresh_symbol(symbol).await {
            Ok(quote) => Ok(quote),
            Err(err) => match cached {
                Some((mut quote, _)) => {
                    warn!(symbol, error = %err, "refresh failed, serving stale quote");
                    quote.is_fresh = false;
                    Ok(quote)
                }
                None => Err(err),
            },
        }
    }

    async fn refresh_symbol(&self, symbol: &str) -> VenueResult<Quote> {
        let venue_quote = self.venue.price(symbol).await?;
        let quote = Quote {
            symbol: venue_quote.symbol.clone(),
            bid: venue_quote.bid,
            ask: venue_quote.ask,
            spread_points: venue_quote.spread,
            venue_time: venue_quote.time,
            fetched_at: Utc::now(),
            is_fresh: true,
        };
        self.state
            .lock()
            .unwrap()
            .cache
            .insert(venue_quote.symbol, (quote.clone(), Instant::now()));
        Ok(quote)
    }

    /// One poll tick: refresh every tracked symbol whose cache entry has
    /// aged out. Returns the number of symbols refreshed.
    pub async fn poll_once(&self) -> usize {
        if self.updating.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let stale: Vec<Symbol> = {
            let state = self.state.lock().unwrap();
            state
                .symbols
                .iter()
                .filter(|symbol| {
                    state
                        .cache
                        .get(*symbol)
                        .map_or(true, |(_, at)| at.elapsed() >= self.config.cache_ttl)
                })
                .cloned()
                .collect()
        };

        let mut refreshed = 0;
        let mut failed = false;
        for (index, symbol) in stale.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.request_spacing).await;
            }
            match self.refresh_symbol(symbol).await {
                Ok(_) => refreshed += 1,
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "quote refresh failed");
                    failed = true;
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            if failed {
                state.interval = clamp(
                    state.interval.mul_f64(1.2),
                    self.config.min_interval,
                    self.config.max_interval,
                );
            } else if state.subscribers.is_empty()
                && state.last_activity.elapsed() >= self.config.inactive_timeout
            {
                state.interval = self.config.max_interval;
            }
        }
        self.updating.store(false, Ordering::Release);
        refreshed
    }

    /// Spawn the poll loop. It runs until the returned handle is aborted.
    pub fn spawn(service: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?service.interval(), "market data poller started");
            loop {
                let interval = service.interval();
                tokio::time::sleep(interval).await;
                service.poll_once().await;
            }
        })
    }

    /// Age-gated freshness check against the cache.
    #[must_use]
    pub fn is_fresh(&self, symbol: &str, max_age: Duration) -> bool {
        self.state
            .lock()
            .unwrap()
            .cache
            .get(symbol)
            .is_some_and(|(_, at)| at.elapsed() < max_age)
    }
}

fn clamp(value: Duration, min: Duration, max: Duration) -> Duration {
    value.max(min).min(max)
}

/// Convenience alias shared by consumers that only need reads.
pub type SharedMarketData = Arc<MarketDataService>;

#[cfg(test)]
mod tests {
    use super::*;
    use bullion_paper::PaperVenue;
    use rust_decimal_macros::dec;

    fn service_with(venue: PaperVenue, config: MarketDataConfig) -> MarketDataService {
        MarketDataService::new(Arc::new(venue), config)
    }

    #[tokio::test]
    async fn serves_cached_quotes_within_ttl() {
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
        let service = service_with(venue, MarketDataConfig::default());

        let first = service.market_data("XAUUSD").await.unwrap();
        assert!(first.is_fresh);
        let second = service.market_data("XAUUSD").await.unwrap();
        assert_eq!(first.fetched_at, second.fetched_at);
    }

    #[tokio::test]
    async fn falls_back_to_stale_cache_on_refresh_failure() {
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
        let config = MarketDataConfig {
            cache_ttl: Duration::from_millis(0),
            ..MarketDataConfig::default()
        };
        let service = MarketDataService::new(Arc::new(venue.clone()), config);

        service.market_data("XAUUSD").await.unwrap();
        venue.clear_quote("XAUUSD");
        let quote = service.market_data("XAUUSD").await.unwrap();
        assert!(!quote.is_fresh);
        assert_eq!(quote.bid, dec!(1900));
    }

    #[tokio::test]
    async fn missing_symbol_with_no_cache_errors() {
        let venue = PaperVenue::new();
        let service = service_with(venue, MarketDataConfig::default());
        assert!(service.market_data("XAGUSD").await.is_err());
    }

    #[tokio::test]
    async fn poll_errors_widen_the_interval() {
        let venue = PaperVenue::new();
        let service = service_with(venue, MarketDataConfig::default());
        service.track_symbol("XAUUSD");

        let before = service.interval();
        service.poll_once().await;
        assert!(service.interval() > before);
    }

    #[tokio::test]
    async fn interval_never_exceeds_bounds() {
        let venue = PaperVenue::new();
        let service = service_with(venue, MarketDataConfig::default());
        service.track_symbol("XAUUSD");

        for _ in 0..20 {
            service.poll_once().await;
        }
        assert!(service.interval() <= MarketDataConfig::default().max_interval);
    }

    #[tokio::test]
    async fn first_subscriber_tightens_interval() {
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
        let service = service_with(venue, MarketDataConfig::default());

        let before = service.interval();
        service.add_subscriber("client-1");
        assert!(service.interval() < before);
        // A second subscriber does not tighten again.
        let after_first = service.interval();
        service.add_subscriber("client-2");
        assert_eq!(service.interval(), after_first);
    }

    #[tokio::test]
    async fn poll_refreshes_stale_symbols() {
        let venue = PaperVenue::new();
        venue.set_quote("XAUUSD", dec!(1900), dec!(1902));
        let service = service_with(venue, MarketDataConfig::default());
        service.track_symbol("XAUUSD");

        assert_eq!(service.poll_once().await, 1);
        // Fresh now, so the next tick skips it.
        assert_eq!(service.poll_once().await, 0);
    }
}
