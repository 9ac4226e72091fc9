//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mt5: Mt5Settings,
    #[serde(default)]
    pub market_data: MarketDataSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    /// Shared secret required on every admin route.
    #[serde(default)]
    pub api_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Mt5Settings {
    /// `mt5` spawns the sidecar; `paper` runs the in-memory venue.
    #[serde(default = "default_venue_driver")]
    pub driver: String,
    #[serde(default = "default_sidecar_command")]
    pub command: String,
    #[serde(default = "default_sidecar_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub login: i64,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_trade_timeout_secs")]
    pub trade_timeout_secs: u64,
}

impl Default for Mt5Settings {
    fn default() -> Self {
        Self {
            driver: default_venue_driver(),
            command: default_sidecar_command(),
            args: default_sidecar_args(),
            server: String::new(),
            login: 0,
            password: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            trade_timeout_secs: default_trade_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketDataSettings {
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_min_poll_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_poll_secs")]
    pub max_interval_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_inactive_timeout_secs")]
    pub inactive_timeout_secs: u64,
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_secs(),
            min_interval_secs: default_min_poll_secs(),
            max_interval_secs: default_max_poll_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            inactive_timeout_secs: default_inactive_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_venue_symbol")]
    pub venue_symbol: String,
    #[serde(default = "default_magic")]
    pub magic: i64,
    #[serde(default = "default_stop_distance")]
    pub sl_distance: Decimal,
    #[serde(default = "default_stop_distance")]
    pub tp_distance: Decimal,
    #[serde(default = "default_true")]
    pub allow_negative_metal: bool,
    #[serde(default = "default_base_amount")]
    pub base_amount_per_volume: Decimal,
    #[serde(default = "default_minimum_balance_pct")]
    pub minimum_balance_pct: Decimal,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            venue_symbol: default_venue_symbol(),
            magic: default_magic(),
            sl_distance: default_stop_distance(),
            tp_distance: default_stop_distance(),
            allow_negative_metal: true,
            base_amount_per_volume: default_base_amount(),
            minimum_balance_pct: default_minimum_balance_pct(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct MessagingConfig {
    /// When false, replies are logged instead of sent.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_messaging_url")]
    pub api_url: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    /// Sender id, e.g. `whatsapp:+14155238886`.
    #[serde(default)]
    pub sender: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    #[serde(default = "default_session_idle_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_statement_page")]
    pub statement_page: u32,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_session_idle_secs(),
            statement_page: default_statement_page(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9100".into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/bullion.db")
}

fn default_venue_driver() -> String {
    "mt5".to_string()
}

fn default_sidecar_command() -> String {
    "python3".to_string()
}

fn default_sidecar_args() -> Vec<String> {
    vec!["mt5_sidecar.py".to_string()]
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_trade_timeout_secs() -> u64 {
    45
}

fn default_poll_secs() -> u64 {
    10
}

fn default_min_poll_secs() -> u64 {
    5
}

fn default_max_poll_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    15
}

fn default_inactive_timeout_secs() -> u64 {
    300
}

fn default_symbol() -> String {
    "GOLD".into()
}

fn default_venue_symbol() -> String {
    "XAUUSD".into()
}

fn default_magic() -> i64 {
    116_640
}

fn default_stop_distance() -> Decimal {
    Decimal::TEN
}

fn default_true() -> bool {
    true
}

fn default_base_amount() -> Decimal {
    Decimal::from(2_200)
}

fn default_minimum_balance_pct() -> Decimal {
    Decimal::from(20)
}

fn default_messaging_url() -> String {
    "https://api.twilio.com/2010-04-01".into()
}

fn default_session_idle_secs() -> u64 {
    30 * 60
}

fn default_statement_page() -> u32 {
    5
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `BULLION__`
/// 5. The flat legacy variables (`MT5_SERVER`, `MT5_LOGIN`, `MT5_PASSWORD`,
///    `API_KEY`, `PORT`, `DATABASE_PATH`, `MSG_ACCOUNT_SID`,
///    `MSG_AUTH_TOKEN`, `MSG_SENDER`)
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("BULLION")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    let mut app: AppConfig = config
        .try_deserialize()
        .map_err(|err: ConfigError| anyhow::Error::from(err))?;
    apply_flat_env(&mut app);
    Ok(app)
}

/// Deployment environments commonly export the flat variable names; they
/// win over every file layer.
fn apply_flat_env(app: &mut AppConfig) {
    if let Ok(server) = std::env::var("MT5_SERVER") {
        app.mt5.server = server;
    }
    if let Ok(login) = std::env::var("MT5_LOGIN") {
        if let Ok(login) = login.parse() {
            app.mt5.login = login;
        }
    }
    if let Ok(password) = std::env::var("MT5_PASSWORD") {
        app.mt5.password = password;
    }
    if let Ok(api_key) = std::env::var("API_KEY") {
        app.server.api_key = api_key;
    }
    if let Ok(port) = std::env::var("PORT") {
        if port.parse::<u16>().is_ok() {
            app.server.listen_addr = format!("0.0.0.0:{port}");
        }
    }
    if let Ok(path) = std::env::var("DATABASE_PATH") {
        app.database.path = PathBuf::from(path);
    }
    if let Ok(sid) = std::env::var("MSG_ACCOUNT_SID") {
        app.messaging.account_sid = sid;
    }
    if let Ok(token) = std::env::var("MSG_AUTH_TOKEN") {
        app.messaging.auth_token = token;
    }
    if let Ok(sender) = std::env::var("MSG_SENDER") {
        app.messaging.sender = sender;
    }
}
