//! Database module for deal-escrow
//!
//! This module handles persistent storage for:
//! - Users (external identities)
//! - Deposit addresses (the reservation pool)
//! - Deals (the escrow audit trail)

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Database connection handle
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        // Ensure the directory exists for file-based databases
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let conn = Connection::open(path)?;

        // Other processes may hold the write lock while reserving addresses
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::create_schema(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create tables and indexes
    fn create_schema(conn: &Connection) -> anyhow::Result<()> {
        debug!("Creating database schema...");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER UNIQUE NOT NULL,
                username TEXT,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deposit_addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT UNIQUE NOT NULL,
                currency TEXT NOT NULL CHECK(currency IN ('BTC', 'LTC')),
                state TEXT NOT NULL DEFAULT 'free' CHECK(state IN ('free', 'reserved')),
                reserved_until INTEGER NULL,
                CHECK(state = 'free' OR reserved_until IS NOT NULL)
            );

            CREATE INDEX IF NOT EXISTS idx_addresses_currency_state
                ON deposit_addresses(currency, state);

            CREATE TABLE IF NOT EXISTS deals (
                id TEXT PRIMARY KEY,
                buyer_id INTEGER NOT NULL REFERENCES users(id),
                seller_id INTEGER NOT NULL REFERENCES users(id),
                currency TEXT NOT NULL CHECK(currency IN ('BTC', 'LTC')),
                original_amount INTEGER NOT NULL,
                payable_amount INTEGER NOT NULL,
                description TEXT NOT NULL CHECK(LENGTH(description) <= 200),
                status TEXT NOT NULL,
                deposit_address TEXT NOT NULL REFERENCES deposit_addresses(address),
                tx_hash TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deals_status ON deals(status);
            CREATE INDEX IF NOT EXISTS idx_deals_deposit_address ON deals(deposit_address);

            -- One on-chain payment settles at most one deal
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deals_tx_hash
                ON deals(tx_hash) WHERE tx_hash IS NOT NULL;
            "#,
        )?;

        debug!("Database schema ready");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('users', 'deals', 'deposit_addresses')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[tokio::test]
    async fn test_reserved_address_requires_expiry() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let result = conn.execute(
            "INSERT INTO deposit_addresses (address, currency, state) VALUES ('bc1qx', 'BTC', 'reserved')",
            [],
        );
        assert!(result.is_err());
    }
}
