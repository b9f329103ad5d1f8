//! Configuration management for deal-escrow
//!
//! Configuration is loaded from a TOML file. Every section has defaults, so an
//! empty file (or no file) yields a working regtest-style setup.
//!
//! # Example Configuration File
//!
//! ```toml
//! [escrow]
//! fee_rate_ppm = 20000
//! reservation_ttl_hours = 12
//! admin_telegram_ids = [11111111, 22222222]
//! admin_username = "escrow_admin"
//!
//! [currencies.btc]
//! min_amount = "0.0003"
//! min_confirmations = 3
//!
//! [currencies.ltc]
//! min_amount = "0.1"
//! min_confirmations = 2
//!
//! [chain]
//! api_token = "..."
//! timeout_seconds = 15
//!
//! [pool]
//! seed_file = "deposit_addresses.json"
//!
//! [api]
//! bind_address = "10.0.0.5:8080"
//! ```
//!
//! # Trust boundary
//!
//! The API takes the caller's Telegram ID from the request body and trusts it.
//! Admin rights and party checks rest on that ID alone, so the API must only be
//! reachable by the messaging front-end. Bind it to loopback or a private
//! network; never expose it publicly.

use crate::{Amount, Currency};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Escrow service rules
    #[serde(default)]
    pub escrow: EscrowConfig,

    /// Per-currency limits
    #[serde(default)]
    pub currencies: CurrenciesConfig,

    /// Block explorer connection
    #[serde(default)]
    pub chain: ChainConfig,

    /// Deposit address pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Escrow service rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Service fee (parts per million of the deal amount)
    #[serde(default = "default_fee_rate_ppm")]
    pub fee_rate_ppm: u64,

    /// How long a deposit address stays bound to a deal before it can be reclaimed
    #[serde(default = "default_reservation_ttl_hours")]
    pub reservation_ttl_hours: u64,

    /// Deal ID generation attempts before giving up
    #[serde(default = "default_max_id_attempts")]
    pub max_id_attempts: u32,

    /// Maximum description length (characters)
    #[serde(default = "default_max_description_chars")]
    pub max_description_chars: usize,

    /// Telegram IDs allowed to confirm payments and release funds
    #[serde(default)]
    pub admin_telegram_ids: Vec<i64>,

    /// Admin username handed to participants who ask for help
    pub admin_username: Option<String>,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            fee_rate_ppm: default_fee_rate_ppm(),
            reservation_ttl_hours: default_reservation_ttl_hours(),
            max_id_attempts: default_max_id_attempts(),
            max_description_chars: default_max_description_chars(),
            admin_telegram_ids: Vec::new(),
            admin_username: None,
        }
    }
}

fn default_fee_rate_ppm() -> u64 {
    20_000 // 2%
}

fn default_reservation_ttl_hours() -> u64 {
    12
}

fn default_max_id_attempts() -> u32 {
    5
}

fn default_max_description_chars() -> usize {
    200
}

/// Per-currency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrenciesConfig {
    /// Bitcoin limits
    #[serde(default = "default_btc")]
    pub btc: CurrencyConfig,

    /// Litecoin limits
    #[serde(default = "default_ltc")]
    pub ltc: CurrencyConfig,
}

impl Default for CurrenciesConfig {
    fn default() -> Self {
        Self {
            btc: default_btc(),
            ltc: default_ltc(),
        }
    }
}

/// Limits for one currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyConfig {
    /// Smallest deal amount accepted (major units, decimal string)
    pub min_amount: Amount,

    /// Confirmations a payment needs before it counts
    pub min_confirmations: u32,
}

fn default_btc() -> CurrencyConfig {
    CurrencyConfig {
        min_amount: Amount::from_base_units(30_000), // 0.0003 BTC
        min_confirmations: 3,
    }
}

fn default_ltc() -> CurrencyConfig {
    CurrencyConfig {
        min_amount: Amount::from_base_units(10_000_000), // 0.1 LTC
        min_confirmations: 2,
    }
}

/// Block explorer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Explorer API base URL
    #[serde(default = "default_chain_base_url")]
    pub base_url: String,

    /// API token (optional; anonymous access is heavily rate limited)
    pub api_token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_chain_timeout")]
    pub timeout_seconds: u64,

    /// Number of transactions requested per address
    #[serde(default = "default_tx_limit")]
    pub tx_limit: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            base_url: default_chain_base_url(),
            api_token: None,
            timeout_seconds: default_chain_timeout(),
            tx_limit: default_tx_limit(),
        }
    }
}

fn default_chain_base_url() -> String {
    "https://api.blockcypher.com/v1".to_string()
}

fn default_chain_timeout() -> u64 {
    15
}

fn default_tx_limit() -> u32 {
    10
}

/// Deposit address pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// JSON file of addresses to import at startup (`{"BTC": [...], "LTC": [...]}`)
    pub seed_file: Option<PathBuf>,

    /// Interval of the background reservation sweep; 0 keeps sweeping inline only
    #[serde(default)]
    pub sweep_interval_seconds: u64,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to.
    ///
    /// Requests are authorised by the `telegram_id` they carry, which any client
    /// can set. Keep this on loopback or a private interface that only the
    /// front-end reaches.
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Directory relative database paths are resolved against
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:deal-escrow.db".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("deal-escrow"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Resolve the database URL, making it relative to data_dir if needed
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;

        if url.starts_with("sqlite:/") || url == "sqlite::memory:" {
            return url.clone();
        }

        let path = url.strip_prefix("sqlite:").unwrap_or(url);

        if std::path::Path::new(path).is_absolute() {
            return url.clone();
        }

        let db_path = self.database.data_dir.join(path);
        format!("sqlite:{}", db_path.display())
    }

    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Limits for a currency
    pub fn currency(&self, currency: Currency) -> &CurrencyConfig {
        match currency {
            Currency::Btc => &self.currencies.btc,
            Currency::Ltc => &self.currencies.ltc,
        }
    }

    /// Minimum confirmations a payment in `currency` needs
    pub fn min_confirmations(&self, currency: Currency) -> u32 {
        self.currency(currency).min_confirmations
    }

    /// Whether the Telegram user is an admin
    pub fn is_admin(&self, telegram_id: i64) -> bool {
        self.escrow.admin_telegram_ids.contains(&telegram_id)
    }

    /// Amount the buyer must pay for a deal of `amount`
    pub fn payable_amount(&self, amount: Amount) -> Amount {
        amount.with_fee_ppm(self.escrow.fee_rate_ppm)
    }

    /// Reservation TTL as a chrono duration
    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.escrow.reservation_ttl_hours as i64)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.escrow.fee_rate_ppm > 1_000_000 {
            return Err("Fee rate cannot exceed 100% (1,000,000 ppm)".to_string());
        }

        if self.escrow.reservation_ttl_hours == 0 {
            return Err("Reservation TTL must be at least one hour".to_string());
        }

        if self.escrow.max_id_attempts == 0 {
            return Err("max_id_attempts must be at least 1".to_string());
        }

        if self.escrow.max_description_chars == 0 || self.escrow.max_description_chars > 200 {
            return Err("max_description_chars must be between 1 and 200".to_string());
        }

        for currency in Currency::ALL {
            let c = self.currency(currency);
            if c.min_confirmations == 0 {
                return Err(format!("{} min_confirmations must be at least 1", currency));
            }
            if c.min_amount == Amount::ZERO {
                return Err(format!("{} min_amount must be positive", currency));
            }
        }

        // Bitcoin settles slower than Litecoin and needs the deeper threshold
        if self.currencies.btc.min_confirmations <= self.currencies.ltc.min_confirmations {
            return Err(format!(
                "BTC min_confirmations ({}) must exceed LTC min_confirmations ({})",
                self.currencies.btc.min_confirmations, self.currencies.ltc.min_confirmations
            ));
        }

        if self.chain.timeout_seconds == 0 {
            return Err("Chain timeout cannot be 0".to_string());
        }

        if self.chain.base_url.is_empty() {
            return Err("Chain base_url cannot be empty".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payable_amount() {
        let config = Config::default();
        let one: Amount = "1".parse().unwrap();
        assert_eq!(config.payable_amount(one).to_string(), "1.02");
    }

    #[test]
    fn test_validate_config() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.escrow.fee_rate_ppm = 2_000_000;
        assert!(config.validate().is_err());

        // Reset and make the thresholds equal
        config.escrow.fee_rate_ppm = 20_000;
        config.currencies.ltc.min_confirmations = 3;
        assert!(config.validate().is_err());

        config.currencies.ltc.min_confirmations = 2;
        config.escrow.reservation_ttl_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_binds_to_loopback_by_default() {
        let addr: std::net::SocketAddr = Config::default().api.bind_address.parse().unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [escrow]
            admin_telegram_ids = [42]

            [currencies.ltc]
            min_amount = "0.5"
            min_confirmations = 1

            [chain]
            timeout_seconds = 5
            "#,
        )
        .unwrap();

        assert!(config.is_admin(42));
        assert!(!config.is_admin(7));
        assert_eq!(config.currency(Currency::Ltc).min_amount.to_string(), "0.5");
        assert_eq!(config.min_confirmations(Currency::Btc), 3);
        assert_eq!(config.chain.timeout_seconds, 5);
        assert_eq!(config.escrow.reservation_ttl_hours, 12);
    }

    #[test]
    fn test_resolve_database_url() {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        assert_eq!(config.resolve_database_url(), "sqlite::memory:");

        config.database.url = "sqlite:escrow.db".to_string();
        config.database.data_dir = PathBuf::from("/var/lib/deal-escrow");
        assert_eq!(
            config.resolve_database_url(),
            "sqlite:/var/lib/deal-escrow/escrow.db"
        );
    }
}
