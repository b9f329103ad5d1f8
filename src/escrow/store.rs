//! Deal persistence and status transition rules
//!
//! A deal only ever moves one step forward:
//!
//! ```text
//! CREATED -> AWAITING_PAYMENT -> PAID_WAITING_ADMIN -> PAID -> SHIPPED -> COMPLETED
//! ```
//!
//! Each transition is a conditional update on the deal row, so two callers racing
//! on the same step cannot both succeed.

use crate::{
    db::{Database, DealModel, DealQueries, InsertOutcome, StatusUpdate},
    EscrowError, EscrowResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Deal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    /// Constructed, no deposit address yet
    Created,
    /// Address bound, waiting for the buyer to pay
    AwaitingPayment,
    /// Buyer says they paid, waiting for admin verification
    PaidWaitingAdmin,
    /// Admin confirmed the payment on chain
    Paid,
    /// Seller shipped the item
    Shipped,
    /// Admin released the funds
    Completed,
}

impl DealStatus {
    /// Statuses whose deposit address must never be reclaimed
    pub const ADDRESS_PROTECTED: [DealStatus; 3] =
        [DealStatus::Paid, DealStatus::Shipped, DealStatus::Completed];

    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Created => "CREATED",
            DealStatus::AwaitingPayment => "AWAITING_PAYMENT",
            DealStatus::PaidWaitingAdmin => "PAID_WAITING_ADMIN",
            DealStatus::Paid => "PAID",
            DealStatus::Shipped => "SHIPPED",
            DealStatus::Completed => "COMPLETED",
        }
    }

    /// The only status a deal may be in before moving to `self`
    pub fn predecessor(&self) -> Option<DealStatus> {
        match self {
            DealStatus::Created => None,
            DealStatus::AwaitingPayment => Some(DealStatus::Created),
            DealStatus::PaidWaitingAdmin => Some(DealStatus::AwaitingPayment),
            DealStatus::Paid => Some(DealStatus::PaidWaitingAdmin),
            DealStatus::Shipped => Some(DealStatus::Paid),
            DealStatus::Completed => Some(DealStatus::Shipped),
        }
    }

    /// The next status in the lifecycle
    pub fn next(&self) -> Option<DealStatus> {
        match self {
            DealStatus::Created => Some(DealStatus::AwaitingPayment),
            DealStatus::AwaitingPayment => Some(DealStatus::PaidWaitingAdmin),
            DealStatus::PaidWaitingAdmin => Some(DealStatus::Paid),
            DealStatus::Paid => Some(DealStatus::Shipped),
            DealStatus::Shipped => Some(DealStatus::Completed),
            DealStatus::Completed => None,
        }
    }

    /// Whether the deal has finished
    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    /// Whether the deal's deposit address is pinned regardless of reservation expiry
    pub fn protects_address(&self) -> bool {
        Self::ADDRESS_PROTECTED.contains(self)
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(DealStatus::Created),
            "AWAITING_PAYMENT" => Ok(DealStatus::AwaitingPayment),
            "PAID_WAITING_ADMIN" => Ok(DealStatus::PaidWaitingAdmin),
            "PAID" => Ok(DealStatus::Paid),
            "SHIPPED" => Ok(DealStatus::Shipped),
            "COMPLETED" => Ok(DealStatus::Completed),
            other => Err(EscrowError::Validation(format!("Unknown deal status: {}", other))),
        }
    }
}

impl rusqlite::types::ToSql for DealStatus {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl rusqlite::types::FromSql for DealStatus {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: EscrowError| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

/// Deal persistence with transition enforcement
#[derive(Clone)]
pub struct DealStore {
    db: Arc<Database>,
}

impl DealStore {
    /// Create a new deal store
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a new deal. Fails with `DuplicateId` when the code is taken.
    pub async fn insert(&self, deal: &DealModel) -> EscrowResult<()> {
        let outcome = DealQueries::new(&self.db)
            .insert(deal)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to insert deal {}: {}", deal.id, e)))?;

        match outcome {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::DuplicateId => {
                debug!("Deal ID {} already taken", deal.id);
                Err(EscrowError::DuplicateId(deal.id.clone()))
            }
        }
    }

    /// Load a deal if it exists
    pub async fn find(&self, deal_id: &str) -> EscrowResult<Option<DealModel>> {
        DealQueries::new(&self.db)
            .get_by_id(deal_id)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to load deal {}: {}", deal_id, e)))
    }

    /// Load a deal, failing with `DealNotFound`
    pub async fn get(&self, deal_id: &str) -> EscrowResult<DealModel> {
        self.find(deal_id)
            .await?
            .ok_or_else(|| EscrowError::DealNotFound(deal_id.to_string()))
    }

    /// The deal that recorded `tx_hash` as its payment, if any
    pub async fn find_by_tx_hash(&self, tx_hash: &str) -> EscrowResult<Option<DealModel>> {
        DealQueries::new(&self.db)
            .get_by_tx_hash(tx_hash)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to look up transaction {}: {}", tx_hash, e)))
    }

    /// List deals in a status
    pub async fn list_by_status(&self, status: DealStatus) -> EscrowResult<Vec<DealModel>> {
        DealQueries::new(&self.db)
            .list_by_status(status)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to list {} deals: {}", status, e)))
    }

    /// Advance a deal to `to`. The deal must currently be in `to`'s predecessor;
    /// anything else is `IllegalTransition`. Moving to `Paid` records `tx_hash`.
    pub async fn transition(
        &self,
        deal_id: &str,
        to: DealStatus,
        tx_hash: Option<&str>,
    ) -> EscrowResult<DealModel> {
        let Some(from) = to.predecessor() else {
            let current = self.get(deal_id).await?;
            return Err(EscrowError::IllegalTransition {
                deal_id: deal_id.to_string(),
                from: current.status,
                to,
            });
        };

        if to == DealStatus::Paid && tx_hash.is_none() {
            return Err(EscrowError::Validation(format!(
                "Deal {}: a confirmed payment needs a transaction hash",
                deal_id
            )));
        }

        let update = DealQueries::new(&self.db)
            .compare_and_set_status(deal_id, from, to, tx_hash)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to update deal {}: {}", deal_id, e)))?;

        if update == StatusUpdate::TxHashClaimed {
            warn!(
                "Rejected transition for deal {}: transaction {} already settles another deal",
                deal_id,
                tx_hash.unwrap_or_default()
            );
            return Err(EscrowError::Validation(format!(
                "Deal {}: transaction {} already settles another deal",
                deal_id,
                tx_hash.unwrap_or_default()
            )));
        }

        let deal = self.get(deal_id).await?;
        if update == StatusUpdate::StatusMismatch {
            warn!(
                "Rejected transition for deal {}: requested {} -> {}, current status {}",
                deal_id, from, to, deal.status
            );
            return Err(EscrowError::IllegalTransition {
                deal_id: deal_id.to_string(),
                from: deal.status,
                to,
            });
        }

        Ok(deal)
    }
}
