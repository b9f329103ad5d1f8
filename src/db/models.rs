//! Database models

use crate::{escrow::DealStatus, Amount, Currency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserModel {
    /// Internal user ID
    pub id: i64,
    /// Telegram user ID
    pub telegram_id: i64,
    /// Telegram username (without @)
    pub username: Option<String>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// Reservation state of a deposit address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressState {
    /// Available for a new deal
    Free,
    /// Bound to a deal until `reserved_until`
    Reserved,
}

impl AddressState {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressState::Free => "free",
            AddressState::Reserved => "reserved",
        }
    }
}

impl rusqlite::types::FromSql for AddressState {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        match value.as_str()? {
            "free" => Ok(AddressState::Free),
            "reserved" => Ok(AddressState::Reserved),
            other => Err(rusqlite::types::FromSqlError::Other(
                format!("unknown address state: {}", other).into(),
            )),
        }
    }
}

/// Deposit address database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositAddressModel {
    /// Internal ID (import order)
    pub id: i64,
    /// On-chain address
    pub address: String,
    /// Currency the address receives
    pub currency: Currency,
    /// Reservation state
    pub state: AddressState,
    /// End of the current reservation
    pub reserved_until: Option<DateTime<Utc>>,
}

impl DepositAddressModel {
    /// Map a `SELECT id, address, currency, state, reserved_until` row
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let reserved_until: Option<i64> = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            address: row.get(1)?,
            currency: row.get(2)?,
            state: row.get(3)?,
            reserved_until: reserved_until.and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }
}

/// Deal database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealModel {
    /// 6-character deal code
    pub id: String,
    /// Buyer user ID
    pub buyer_id: i64,
    /// Seller user ID
    pub seller_id: i64,
    /// Deal currency
    pub currency: Currency,
    /// Amount agreed between buyer and seller
    pub original_amount: Amount,
    /// Amount the buyer must send (original plus service fee)
    pub payable_amount: Amount,
    /// Item description
    pub description: String,
    /// Lifecycle status
    pub status: DealStatus,
    /// Deposit address bound to the deal
    pub deposit_address: String,
    /// Confirmed payment transaction
    pub tx_hash: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl DealModel {
    /// Map a row selected with [`super::DEAL_COLUMNS`]
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let original: i64 = row.get(4)?;
        let payable: i64 = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            buyer_id: row.get(1)?,
            seller_id: row.get(2)?,
            currency: row.get(3)?,
            original_amount: Amount::from_base_units(original as u64),
            payable_amount: Amount::from_base_units(payable as u64),
            description: row.get(6)?,
            status: row.get(7)?,
            deposit_address: row.get(8)?,
            tx_hash: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}
