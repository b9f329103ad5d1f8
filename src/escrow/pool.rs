//! Deposit address pool
//!
//! Every deal receives its own deposit address from a pre-provisioned pool.
//! A reservation lasts `reservation_ttl_hours`; after that the address can be
//! handed to a new deal unless a deal bound to it has reached PAID or later.
//!
//! Sweeping and selection run inside a single `BEGIN IMMEDIATE` transaction, so
//! concurrent reservations (from this process or another one sharing the database
//! file) serialise on SQLite's write lock and never return the same address.

use crate::{
    config::Config,
    db::{AddressState, Database, DepositAddressModel},
    escrow::DealStatus,
    Currency, EscrowError, EscrowResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pool of deposit addresses shared by all deals
pub struct AddressPool {
    /// Configuration
    config: Arc<Config>,
    /// Database connection
    db: Arc<Database>,
}

impl AddressPool {
    /// Create a new address pool
    pub fn new(config: Arc<Config>, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    /// Reserve an address for a new deal
    pub async fn reserve(&self, currency: Currency) -> EscrowResult<DepositAddressModel> {
        self.reserve_at(currency, Utc::now()).await
    }

    /// Reserve an address as of `now`.
    ///
    /// Expired reservations are swept first. A free address with the lowest ID wins;
    /// failing that, the reclaimable reservation that expired earliest.
    pub async fn reserve_at(
        &self,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> EscrowResult<DepositAddressModel> {
        let now_ms = now.timestamp_millis();
        let reserved_until = now + self.config.reservation_ttl();

        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let released = sweep_expired(&tx, now_ms)?;
        if released > 0 {
            info!("Released {} addresses with expired reservation", released);
        }

        let candidate = tx
            .query_row(
                &format!(
                    r#"
                    SELECT id, address, currency, state, reserved_until
                    FROM deposit_addresses
                    WHERE currency = ?1 AND (
                        state = 'free'
                        OR (reserved_until < ?2 AND address NOT IN ({}))
                    )
                    ORDER BY CASE state WHEN 'free' THEN 0 ELSE 1 END, reserved_until ASC, id ASC
                    LIMIT 1
                    "#,
                    protected_addresses_sql()
                ),
                params![currency, now_ms],
                DepositAddressModel::from_row,
            )
            .optional()?;

        let Some(mut address) = candidate else {
            // Keep whatever the sweep released
            tx.commit()?;
            warn!("Address pool exhausted for {}", currency);
            return Err(EscrowError::PoolExhausted(currency));
        };

        tx.execute(
            "UPDATE deposit_addresses SET state = 'reserved', reserved_until = ?1 WHERE id = ?2",
            params![reserved_until.timestamp_millis(), address.id],
        )?;
        tx.commit()?;

        address.state = AddressState::Reserved;
        address.reserved_until = Some(reserved_until);

        info!(
            "Reserved {} address {} until {}",
            currency, address.address, reserved_until
        );

        Ok(address)
    }

    /// Free every expired reservation whose bound deal (if any) is not PAID or later.
    /// Returns the number of addresses released.
    pub async fn sweep(&self, now: DateTime<Utc>) -> EscrowResult<usize> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let released = sweep_expired(&tx, now.timestamp_millis())?;
        tx.commit()?;

        if released > 0 {
            info!("Released {} addresses with expired reservation", released);
        } else {
            debug!("Sweep found no expired reservations");
        }
        Ok(released)
    }

    /// Whether a reservation for `currency` would currently succeed. Does not reserve.
    pub async fn has_free(&self, currency: Currency) -> EscrowResult<bool> {
        self.has_free_at(currency, Utc::now()).await
    }

    /// [`Self::has_free`] as of `now`
    pub async fn has_free_at(&self, currency: Currency, now: DateTime<Utc>) -> EscrowResult<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let available: bool = conn.query_row(
            &format!(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM deposit_addresses
                    WHERE currency = ?1 AND (
                        state = 'free'
                        OR (reserved_until < ?2 AND address NOT IN ({}))
                    )
                )
                "#,
                protected_addresses_sql()
            ),
            params![currency, now.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(available)
    }

    /// Return a reservation to the pool, e.g. when deal creation is abandoned.
    /// Addresses pinned by a PAID-or-later deal are left alone.
    pub async fn release(&self, address: &str) -> EscrowResult<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE deposit_addresses SET state = 'free', reserved_until = NULL
                WHERE address = ?1 AND state = 'reserved' AND address NOT IN ({})
                "#,
                protected_addresses_sql()
            ),
            params![address],
        )?;

        if changed > 0 {
            info!("Released deposit address {}", address);
        }
        Ok(changed > 0)
    }

    /// Add addresses to the pool. Already-known addresses are skipped.
    /// Returns the number of new addresses.
    pub async fn import(&self, currency: Currency, addresses: &[String]) -> EscrowResult<usize> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        let mut inserted = 0;
        for address in addresses {
            let address = address.trim();
            if address.is_empty() {
                continue;
            }
            inserted += tx.execute(
                "INSERT OR IGNORE INTO deposit_addresses (address, currency, state) VALUES (?1, ?2, 'free')",
                params![address, currency],
            )?;
        }
        tx.commit()?;

        info!(
            "Imported {} new {} addresses ({} submitted)",
            inserted,
            currency,
            addresses.len()
        );
        Ok(inserted)
    }

    /// Import a JSON seed file of the form `{"BTC": ["..."], "LTC": ["..."]}`
    pub async fn import_seed_file(&self, path: &Path) -> EscrowResult<usize> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EscrowError::Config(format!("Failed to read seed file {}: {}", path.display(), e))
        })?;
        let seed: HashMap<String, Vec<String>> = serde_json::from_str(&content).map_err(|e| {
            EscrowError::Config(format!("Invalid seed file {}: {}", path.display(), e))
        })?;

        let mut total = 0;
        for (ticker, addresses) in seed {
            match ticker.parse::<Currency>() {
                Ok(currency) => total += self.import(currency, &addresses).await?,
                Err(_) => warn!("Skipping unsupported currency {} in seed file", ticker),
            }
        }
        Ok(total)
    }

    /// Look up one address
    pub async fn get(&self, address: &str) -> EscrowResult<Option<DepositAddressModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let model = conn
            .query_row(
                "SELECT id, address, currency, state, reserved_until FROM deposit_addresses WHERE address = ?1",
                params![address],
                DepositAddressModel::from_row,
            )
            .optional()?;
        Ok(model)
    }

    /// All addresses of a currency in import order
    pub async fn list(&self, currency: Currency) -> EscrowResult<Vec<DepositAddressModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, address, currency, state, reserved_until FROM deposit_addresses WHERE currency = ?1 ORDER BY id ASC",
        )?;
        let addresses = stmt
            .query_map(params![currency], DepositAddressModel::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(addresses)
    }
}

/// Subquery selecting addresses pinned by a PAID-or-later deal
fn protected_addresses_sql() -> String {
    let statuses = DealStatus::ADDRESS_PROTECTED
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT deposit_address FROM deals WHERE status IN ({})",
        statuses
    )
}

/// Free expired, unprotected reservations. Must run inside the caller's transaction.
fn sweep_expired(conn: &Connection, now_ms: i64) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            r#"
            UPDATE deposit_addresses SET state = 'free', reserved_until = NULL
            WHERE state = 'reserved' AND reserved_until < ?1 AND address NOT IN ({})
            "#,
            protected_addresses_sql()
        ),
        params![now_ms],
    )
}
