//! deal-escrow: the core of a three-party cryptocurrency escrow service
//!
//! A buyer funds a pooled deposit address, an admin verifies the on-chain payment,
//! the seller ships, and the admin releases the funds. This crate owns:
//!
//! - **Address pool**: exclusive, time-boxed reservation of deposit addresses with
//!   automatic reclaim of stale reservations
//! - **Deal lifecycle**: the ordered, admin-gated status transitions of a deal
//! - **Payment matching**: deciding from raw chain transactions whether a deal is paid
//! - **HTTP API**: the surface a messaging front-end drives
//!
//! # Architecture
//!
//! 1. `db` holds the SQLite schema and row-level queries
//! 2. `escrow` holds the pool, the matcher, the deal store and the engine that spans them
//! 3. `chain` fetches address transactions from a block explorer
//! 4. `api` exposes the engine over HTTP
//!
#![warn(missing_docs)]

pub mod amount;
pub mod api;
pub mod chain;
pub mod config;
pub mod currency;
pub mod db;
pub mod escrow;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

pub use amount::Amount;
pub use config::Config;
pub use currency::Currency;
use chain::ChainSource;
use db::Database;
use escrow::{AddressPool, DealEngine};

/// The main escrow application state
#[derive(Clone)]
pub struct EscrowApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Deposit address pool
    pub pool: Arc<AddressPool>,
    /// Deal orchestration
    pub engine: Arc<DealEngine>,
}

impl EscrowApp {
    /// Create a new escrow application instance backed by BlockCypher
    pub async fn new(config: Config) -> Result<Self> {
        if config.chain.api_token.is_none() {
            warn!("Chain API token not configured, requests will be subject to anonymous rate limits");
        }
        let chain = Arc::new(chain::BlockCypherClient::new(&config.chain)?);
        Self::with_chain(config, chain).await
    }

    /// Create a new escrow application instance with a given chain data source
    pub async fn with_chain(config: Config, chain: Arc<dyn ChainSource>) -> Result<Self> {
        info!("Initializing deal-escrow application...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Arc::new(Database::connect(&db_url).await?);

        let pool = Arc::new(AddressPool::new(config.clone(), db.clone()));

        let engine = Arc::new(DealEngine::new(config.clone(), db.clone(), pool.clone(), chain));

        info!("deal-escrow application initialized successfully");

        Ok(Self { config, db, pool, engine })
    }

    /// Start the application with shutdown signal
    pub async fn run_with_shutdown(&self, shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        info!("Starting deal-escrow application...");

        if let Some(seed_file) = &self.config.pool.seed_file {
            info!("Importing deposit addresses from {}", seed_file.display());
            match self.pool.import_seed_file(seed_file).await {
                Ok(imported) => info!("Imported {} new deposit addresses", imported),
                Err(e) => {
                    error!("Failed to import deposit addresses: {}", e);
                    return Err(e.into());
                }
            }
        }

        // Log admin-review events; fan-out to admins belongs to the front-end
        let mut events = self.engine.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => info!(deal_id = event.deal_id(), "Deal event: {}", event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Deal event log lagged, {} events skipped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if self.config.pool.sweep_interval_seconds > 0 {
            let pool = self.pool.clone();
            let period = std::time::Duration::from_secs(self.config.pool.sweep_interval_seconds);
            info!("Starting periodic reservation sweep every {:?}", period);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if let Err(e) = pool.sweep(chrono::Utc::now()).await {
                        error!("Periodic sweep failed: {}", e);
                    }
                }
            });
        }

        let api_handle = tokio::spawn({
            let app = self.clone();
            async move {
                if let Err(e) = api::serve_with_shutdown(app, shutdown_rx).await {
                    warn!("API server error: {}", e);
                }
            }
        });

        info!(
            "deal-escrow running. API available at http://{}",
            self.config.api_bind_address()
        );

        api_handle.await?;

        Ok(())
    }

    /// Shutdown the application gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down deal-escrow application...");
        info!("deal-escrow shutdown complete");
        Ok(())
    }
}

/// Error types for escrow operations
#[derive(thiserror::Error, Debug)]
pub enum EscrowError {
    /// No deposit address available for the currency
    #[error("No free deposit addresses for {0}. Contact administrator.")]
    PoolExhausted(Currency),

    /// Requested status change does not match the deal's current status
    #[error("Deal {deal_id}: cannot move from {from} to {to}")]
    IllegalTransition {
        /// Deal ID
        deal_id: String,
        /// Status the deal is actually in
        from: escrow::DealStatus,
        /// Status that was requested
        to: escrow::DealStatus,
    },

    /// Deal ID already taken
    #[error("Deal ID {0} already exists")]
    DuplicateId(String),

    /// Every generated deal ID collided
    #[error("Could not allocate a unique deal ID after {0} attempts")]
    IdSpaceExhausted(u32),

    /// Deal lookup failed
    #[error("Deal {0} not found")]
    DealNotFound(String),

    /// User lookup failed
    #[error("User {0} not found")]
    UserNotFound(String),

    /// Input rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage failure
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for EscrowError {
    fn from(e: rusqlite::Error) -> Self {
        EscrowError::Database(e.to_string())
    }
}

/// Result type alias for escrow operations
pub type EscrowResult<T> = std::result::Result<T, EscrowError>;
