//! Database queries

use super::{Database, DealModel, UserModel};
use crate::escrow::DealStatus;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use tracing::info;

/// Column list matching [`DealModel::from_row`]
pub const DEAL_COLUMNS: &str = "id, buyer_id, seller_id, currency, original_amount, payable_amount, description, status, deposit_address, tx_hash, created_at, updated_at";

/// Outcome of a deal insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row written
    Inserted,
    /// The deal ID is already taken
    DuplicateId,
}

/// Outcome of a conditional status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Row moved to the new status
    Updated,
    /// The deal was not in the expected status (or does not exist)
    StatusMismatch,
    /// Another deal already recorded this transaction hash
    TxHashClaimed,
}

/// User queries
pub struct UserQueries<'a> {
    db: &'a Database,
}

impl<'a> UserQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Get or create a user by Telegram ID, refreshing the stored username
    pub async fn upsert(&self, telegram_id: i64, username: Option<&str>) -> Result<UserModel> {
        let conn = self.db.conn();
        let conn = conn.lock().await;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (telegram_id, username, created_at) VALUES (?1, ?2, ?3)",
            params![telegram_id, username, chrono::Utc::now()],
        )?;

        if inserted > 0 {
            info!("DB: Created new user: telegram_id={}, username={:?}", telegram_id, username);
        } else if username.is_some() {
            conn.execute(
                "UPDATE users SET username = ?1 WHERE telegram_id = ?2",
                params![username, telegram_id],
            )?;
        }

        let user = conn.query_row(
            "SELECT id, telegram_id, username, created_at FROM users WHERE telegram_id = ?1",
            params![telegram_id],
            Self::map_row,
        )?;
        Ok(user)
    }

    /// Get a user by internal ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<UserModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let user = conn
            .query_row(
                "SELECT id, telegram_id, username, created_at FROM users WHERE id = ?1",
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Get a user by Telegram ID
    pub async fn get_by_telegram_id(&self, telegram_id: i64) -> Result<Option<UserModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let user = conn
            .query_row(
                "SELECT id, telegram_id, username, created_at FROM users WHERE telegram_id = ?1",
                params![telegram_id],
                Self::map_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Get a user by username (case-insensitive, leading @ ignored)
    pub async fn get_by_username(&self, username: &str) -> Result<Option<UserModel>> {
        let username = username.trim().trim_start_matches('@');
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let user = conn
            .query_row(
                "SELECT id, telegram_id, username, created_at FROM users WHERE username = ?1 COLLATE NOCASE",
                params![username],
                Self::map_row,
            )
            .optional()?;
        Ok(user)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserModel> {
        Ok(UserModel {
            id: row.get(0)?,
            telegram_id: row.get(1)?,
            username: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

/// Deal queries
pub struct DealQueries<'a> {
    db: &'a Database,
}

impl<'a> DealQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new deal; a primary key collision is reported, not raised
    pub async fn insert(&self, deal: &DealModel) -> Result<InsertOutcome> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn.execute(
            r#"
            INSERT INTO deals (id, buyer_id, seller_id, currency, original_amount, payable_amount, description, status, deposit_address, tx_hash, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                &deal.id,
                deal.buyer_id,
                deal.seller_id,
                deal.currency,
                deal.original_amount.base_units() as i64,
                deal.payable_amount.base_units() as i64,
                &deal.description,
                deal.status,
                &deal.deposit_address,
                deal.tx_hash.as_deref(),
                deal.created_at,
                deal.updated_at,
            ],
        );

        match result {
            Ok(_) => {
                info!(
                    "DB: Inserted deal: id={}, currency={}, payable={}, address={}, status={}",
                    deal.id, deal.currency, deal.payable_amount, deal.deposit_address, deal.status
                );
                Ok(InsertOutcome::Inserted)
            }
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || (err.code == rusqlite::ErrorCode::ConstraintViolation
                        && msg.as_deref().is_some_and(|m| m.contains("deals.id"))) =>
            {
                Ok(InsertOutcome::DuplicateId)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a deal by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<DealModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let deal = conn
            .query_row(
                &format!("SELECT {} FROM deals WHERE id = ?1", DEAL_COLUMNS),
                params![id],
                DealModel::from_row,
            )
            .optional()?;
        Ok(deal)
    }

    /// List deals in a status, oldest first
    pub async fn list_by_status(&self, status: DealStatus) -> Result<Vec<DealModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM deals WHERE status = ?1 ORDER BY created_at ASC",
            DEAL_COLUMNS
        ))?;
        let deals = stmt
            .query_map(params![status], DealModel::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deals)
    }

    /// Get the deal that recorded a transaction hash
    pub async fn get_by_tx_hash(&self, tx_hash: &str) -> Result<Option<DealModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let deal = conn
            .query_row(
                &format!("SELECT {} FROM deals WHERE tx_hash = ?1", DEAL_COLUMNS),
                params![tx_hash],
                DealModel::from_row,
            )
            .optional()?;
        Ok(deal)
    }

    /// Move a deal from `from` to `to` if and only if it is currently in `from`
    pub async fn compare_and_set_status(
        &self,
        id: &str,
        from: DealStatus,
        to: DealStatus,
        tx_hash: Option<&str>,
    ) -> Result<StatusUpdate> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn.execute(
            r#"
            UPDATE deals
            SET status = ?1, tx_hash = COALESCE(?2, tx_hash), updated_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
            params![to, tx_hash, chrono::Utc::now(), id, from],
        );

        match result {
            Ok(0) => Ok(StatusUpdate::StatusMismatch),
            Ok(_) => {
                info!("DB: Deal {} status {} -> {}", id, from, to);
                Ok(StatusUpdate::Updated)
            }
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && msg.as_deref().is_some_and(|m| m.contains("deals.tx_hash")) =>
            {
                Ok(StatusUpdate::TxHashClaimed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_upsert_refreshes_username() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let users = UserQueries::new(&db);

        let first = users.upsert(1001, Some("alice_old")).await.unwrap();
        let second = users.upsert(1001, Some("alice_new")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.username.as_deref(), Some("alice_new"));

        // A missing username keeps the stored one
        let third = users.upsert(1001, None).await.unwrap();
        assert_eq!(third.username.as_deref(), Some("alice_new"));

        let found = users.get_by_username("@Alice_New").await.unwrap().unwrap();
        assert_eq!(found.telegram_id, 1001);
        assert!(users.get_by_username("nobody").await.unwrap().is_none());
        assert!(users.get_by_telegram_id(1001).await.unwrap().is_some());
        assert!(users.get_by_id(first.id).await.unwrap().is_some());
    }
}
