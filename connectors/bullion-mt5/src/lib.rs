//! MetaTrader 5 connector backed by a sidecar subprocess.
//!
//! The sidecar exposes MT5 as line-delimited JSON RPC on stdin/stdout. One
//! bridge instance owns the subprocess for the whole server lifetime; every
//! call serializes through the stdin pipe and is correlated back by
//! `requestId`. Stderr output is logged and never fatal.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use bullion_broker::{
    CloseOutcome, CloseRequest, SymbolInfo, TradeReceipt, TradeRequest, VenueClient, VenueError,
    VenuePosition, VenueQuote, VenueResult, RETCODE_DONE,
};
use bullion_core::Symbol;

mod proto;

use proto::{Inbound, RpcResponse};

/// MT5 comments are capped upstream; longer ones are rejected outright.
const COMMENT_MAX_CHARS: usize = 26;
/// Attempts per trade on transient retcodes (10020/10021).
const TRADE_ATTEMPTS: u32 = 3;
/// Pause between trade attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Base slippage tolerance, widened by 10 per retry.
const BASE_DEVIATION: i64 = 20;

/// Connection and timeout settings for the sidecar.
#[derive(Clone, Debug)]
pub struct Mt5Config {
    /// Program to spawn (e.g. `python3`).
    pub command: String,
    /// Arguments, typically the sidecar script path.
    pub args: Vec<String>,
    pub server: String,
    pub login: i64,
    pub password: String,
    /// Deadline for ordinary requests.
    pub request_timeout: Duration,
    /// Deadline for trade placement and close.
    pub trade_timeout: Duration,
}

impl Default for Mt5Config {
    fn default() -> Self {
        Self {
            command: "python3".into(),
            args: vec!["mt5_sidecar.py".into()],
            server: String::new(),
            login: 0,
            password: String::new(),
            request_timeout: Duration::from_secs(30),
            trade_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Clone)]
struct CachedQuote {
    quote: VenueQuote,
    at: Instant,
}

struct BridgeShared {
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>,
    price_cache: Mutex<HashMap<Symbol, CachedQuote>>,
    symbol_cache: Mutex<HashMap<Symbol, SymbolInfo>>,
    connected: AtomicBool,
}

/// Long-lived client to the MT5 sidecar.
pub struct Mt5Bridge {
    config: Mt5Config,
    shared: Arc<BridgeShared>,
    stdin: AsyncMutex<ChildStdin>,
    next_id: AtomicU64,
    _child: Child,
}

impl Mt5Bridge {
    /// Spawn the sidecar and start the stdout/stderr reader tasks.
    pub fn spawn(config: Mt5Config) -> VenueResult<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| VenueError::Transport(format!("failed to spawn sidecar: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| VenueError::Transport("sidecar stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VenueError::Transport("sidecar stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| VenueError::Transport("sidecar stderr unavailable".into()))?;

        let shared = Arc::new(BridgeShared {
            pending: Mutex::new(HashMap::new()),
            price_cache: Mutex::new(HashMap::new()),
            symbol_cache: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match proto::parse_line(&line) {
                    Inbound::Reply(reply) => {
                        let sender = {
                            let mut pending = reader_shared.pending.lock().unwrap();
                            pending.remove(&reply.request_id)
                        };
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(reply);
                            }
                            None => {
                                debug!(request_id = reply.request_id, "late reply dropped");
                            }
                        }
                    }
                    Inbound::PriceUpdate(event) => {
                        if let (Some(bid), Some(ask), Some(spread)) = (
                            Decimal::from_f64_retain(event.bid),
                            Decimal::from_f64_retain(event.ask),
                            Decimal::from_f64_retain(event.spread),
                        ) {
                            let quote = VenueQuote {
                                symbol: event.symbol.clone(),
                                bid,
                                ask,
                                spread,
                                time: chrono::Utc::now(),
                            };
                            reader_shared.price_cache.lock().unwrap().insert(
                                event.symbol,
                                CachedQuote {
                                    quote,
                                    at: Instant::now(),
                                },
                            );
                        }
                    }
                    Inbound::Noise(line) if !line.is_empty() => {
                        debug!(line = %line, "sidecar stdout noise");
                    }
                    Inbound::Noise(_) => {}
                }
            }
            warn!("sidecar stdout closed");
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(line = %line, "mt5 sidecar stderr");
            }
        });

        Ok(Self {
            config,
            shared,
            stdin: AsyncMutex::new(stdin),
            next_id: AtomicU64::new(1),
            _child: child,
        })
    }

    async fn request(&self, action: &str, params: Value, timeout: Duration) -> VenueResult<Value> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, tx);

        let line = proto::request_line(action, request_id, params);
        {
            let mut stdin = self.stdin.lock().await;
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(err) = write.await {
                self.shared.pending.lock().unwrap().remove(&request_id);
                return Err(VenueError::Transport(format!("sidecar write failed: {err}")));
            }
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                return Err(VenueError::Transport("sidecar reader stopped".into()));
            }
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                return Err(VenueError::Timeout {
                    action: action.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        };

        if reply.success {
            Ok(reply.data.unwrap_or(Value::Null))
        } else {
            Err(proto::rejection(&reply))
        }
    }

    fn ensure_connected(&self) -> VenueResult<()> {
        if self.shared.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(VenueError::NotConnected)
        }
    }

    /// Latest cached quote for a symbol, if any was ever fetched.
    #[must_use]
    pub fn cached_price(&self, symbol: &str) -> Option<VenueQuote> {
        self.shared
            .price_cache
            .lock()
            .unwrap()
            .get(symbol)
            .map(|cached| cached.quote.clone())
    }

    /// Whether the cached quote for a symbol is younger than `max_age`.
    #[must_use]
    pub fn is_price_fresh(&self, symbol: &str, max_age: Duration) -> bool {
        self.shared
            .price_cache
            .lock()
            .unwrap()
            .get(symbol)
            .is_some_and(|cached| cached.at.elapsed() < max_age)
    }

    async fn cached_symbol_info(&self, symbol: &str) -> VenueResult<SymbolInfo> {
        if let Some(info) = self.shared.symbol_cache.lock().unwrap().get(symbol) {
            return Ok(info.clone());
        }
        let data = self
            .request(
                "get_symbol_info",
                json!({ "symbol": symbol }),
                self.config.request_timeout,
            )
            .await
            .map_err(|err| match err {
                VenueError::Other(message) if message.contains("not found") => {
                    VenueError::UnknownSymbol(symbol.to_string())
                }
                other => other,
            })?;
        let info = proto::decode_symbol_info(data)?;
        self.shared
            .symbol_cache
            .lock()
            .unwrap()
            .insert(symbol.to_string(), info.clone());
        Ok(info)
    }

    fn as_f64(value: Decimal, field: &'static str) -> VenueResult<f64> {
        value
            .to_f64()
            .ok_or_else(|| VenueError::Serialization(format!("unrepresentable {field}: {value}")))
    }
}

#[async_trait]
impl VenueClient for Mt5Bridge {
    fn name(&self) -> &str {
        "mt5"
    }

    async fn connect(&self) -> VenueResult<()> {
        if self.shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.request(
            "connect",
            json!({
                "server": self.config.server,
                "login": self.config.login,
                "password": self.config.password,
            }),
            self.config.request_timeout,
        )
        .await?;
        self.shared.connected.store(true, Ordering::Release);
        info!(server = %self.config.server, "connected to MT5");
        Ok(())
    }

    async fn disconnect(&self) -> VenueResult<()> {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.request("disconnect", json!({}), self.config.request_timeout)
            .await?;
        Ok(())
    }

    async fn symbols(&self) -> VenueResult<Vec<Symbol>> {
        self.ensure_connected()?;
        let data = self
            .request("get_symbols", json!({}), self.config.request_timeout)
            .await?;
        serde_json::from_value(data).map_err(|err| VenueError::Serialization(err.to_string()))
    }

    async fn symbol_info(&self, symbol: &str) -> VenueResult<SymbolInfo> {
        self.ensure_connected()?;
        self.cached_symbol_info(symbol).await
    }

    async fn price(&self, symbol: &str) -> VenueResult<VenueQuote> {
        self.ensure_connected()?;
        self.cached_symbol_info(symbol).await?;
        let data = self
            .request(
                "get_price",
                json!({ "symbol": symbol }),
                self.config.request_timeout,
            )
            .await?;
        let quote = proto::decode_quote(data)?;
        self.shared.price_cache.lock().unwrap().insert(
            symbol.to_string(),
            CachedQuote {
                quote: quote.clone(),
                at: Instant::now(),
            },
        );
        Ok(quote)
    }

    async fn place_trade(&self, request: TradeRequest) -> VenueResult<TradeReceipt> {
        self.ensure_connected()?;
        let info = self.cached_symbol_info(&request.symbol).await?;
        if !info.is_tradable() {
            return Err(VenueError::InvalidRequest(format!(
                "symbol {} not tradable",
                request.symbol
            )));
        }
        if request.volume < info.volume_min {
            return Err(VenueError::InvalidRequest(format!(
                "volume {} below minimum {}",
                request.volume, info.volume_min
            )));
        }
        let volume = info.snap_volume(request.volume);
        let min_stop = info.min_stop_distance();
        let sl_distance = request.sl_distance.max(min_stop);
        let tp_distance = request.tp_distance.max(min_stop);
        let comment: String = request.comment.chars().take(COMMENT_MAX_CHARS).collect();

        let mut last_err = None;
        for attempt in 0..TRADE_ATTEMPTS {
            let deviation = BASE_DEVIATION + i64::from(attempt) * 10;
            let params = json!({
                "symbol": request.symbol,
                "volume": Self::as_f64(volume, "volume")?,
                "type": request.side.to_string(),
                "sl_distance": Self::as_f64(sl_distance, "sl_distance")?,
                "tp_distance": Self::as_f64(tp_distance, "tp_distance")?,
                "comment": comment,
                "magic": request.magic,
                "deviation": deviation,
            });
            match self
                .request("place_trade", params, self.config.trade_timeout)
                .await
                .and_then(proto::decode_receipt)
            {
                Ok(receipt) if receipt.retcode == RETCODE_DONE => {
                    info!(
                        ticket = receipt.ticket,
                        deal = receipt.deal,
                        symbol = %request.symbol,
                        "trade placed"
                    );
                    return Ok(receipt);
                }
                Ok(receipt) => {
                    last_err = Some(VenueError::from_retcode(receipt.retcode));
                }
                Err(err) => last_err = Some(err),
            }
            if let Some(err) = &last_err {
                if err.is_transient() && attempt + 1 < TRADE_ATTEMPTS {
                    warn!(attempt, error = %err, "transient rejection, retrying with wider deviation");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
            }
            break;
        }
        Err(last_err.unwrap_or_else(|| VenueError::Other("trade failed".into())))
    }

    async fn positions(&self) -> VenueResult<Vec<VenuePosition>> {
        self.ensure_connected()?;
        let data = self
            .request("get_positions", json!({}), self.config.request_timeout)
            .await?;
        proto::decode_positions(data)
    }

    async fn close_trade(&self, request: CloseRequest) -> VenueResult<CloseOutcome> {
        self.ensure_connected()?;
        // The venue's view of the position is authoritative for the volume.
        let positions = self.positions().await?;
        let Some(position) = positions
            .iter()
            .find(|position| position.ticket == request.ticket)
        else {
            info!(ticket = request.ticket, "position absent upstream, likely closed");
            return Ok(CloseOutcome::likely_closed());
        };

        let info = self.cached_symbol_info(&position.symbol).await?;
        let requested = request.volume.unwrap_or(position.volume);
        let volume = info.snap_volume(requested.min(position.volume));

        let mut last_err = None;
        for attempt in 0..TRADE_ATTEMPTS {
            let deviation = BASE_DEVIATION + i64::from(attempt) * 10;
            let params = json!({
                "ticket": request.ticket,
                "symbol": position.symbol,
                "volume": Self::as_f64(volume, "volume")?,
                "type": position.side.to_string(),
                "deviation": deviation,
            });
            match self
                .request("close_trade", params, self.config.trade_timeout)
                .await
            {
                Ok(data) => {
                    let close: proto::CloseData = serde_json::from_value(data)
                        .map_err(|err| VenueError::Serialization(err.to_string()))?;
                    return Ok(CloseOutcome {
                        success: true,
                        close_price: Some(proto::to_decimal(close.price, "price")?),
                        profit: Some(proto::to_decimal(close.profit, "profit")?),
                        deal: Some(close.deal),
                        likely_closed: false,
                    });
                }
                Err(VenueError::Other(message)) if message.contains("not found") => {
                    return Ok(CloseOutcome::likely_closed());
                }
                Err(err) => last_err = Some(err),
            }
            if let Some(err) = &last_err {
                if err.is_transient() && attempt + 1 < TRADE_ATTEMPTS {
                    warn!(attempt, error = %err, "transient close rejection, retrying");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
            }
            break;
        }
        Err(last_err.unwrap_or_else(|| VenueError::Other("close failed".into())))
    }
}
