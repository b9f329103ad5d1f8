//! Supported currencies

use crate::EscrowError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currency a deal is denominated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// Bitcoin
    Btc,
    /// Litecoin
    Ltc,
}

impl Currency {
    /// All supported currencies
    pub const ALL: [Currency; 2] = [Currency::Btc, Currency::Ltc];

    /// Ticker as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Ltc => "LTC",
        }
    }

    /// Chain name in block explorer URLs
    pub fn chain_slug(&self) -> &'static str {
        match self {
            Currency::Btc => "btc",
            Currency::Ltc => "ltc",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BTC" => Ok(Currency::Btc),
            "LTC" => Ok(Currency::Ltc),
            other => Err(EscrowError::Validation(format!(
                "Unsupported currency: {}. Only BTC and LTC are allowed",
                other
            ))),
        }
    }
}

impl rusqlite::types::ToSql for Currency {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl rusqlite::types::FromSql for Currency {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: EscrowError| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}
