//! Chain data access
//!
//! The escrow core only needs one capability from a block explorer: list the
//! transactions received by an address. [`ChainSource`] is that seam; the
//! production implementation talks to BlockCypher.

use crate::{Amount, Currency};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod blockcypher;

pub use blockcypher::BlockCypherClient;

/// A transaction touching a deposit address, as reported by the explorer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedTransaction {
    /// Transaction hash
    pub tx_id: String,
    /// Value received by the address
    pub value: Amount,
    /// Blocks mined on top of the transaction's block
    pub confirmations: u32,
    /// When the transaction was confirmed or first seen
    pub observed_at: Option<DateTime<Utc>>,
}

/// Why fetching transactions failed
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request did not finish within the configured timeout
    #[error("Timeout when requesting blockchain data")]
    Timeout,

    /// The explorer throttled us (HTTP 429)
    #[error("API request limit exceeded")]
    RateLimited,

    /// Could not reach the explorer
    #[error("Connection error: {0}")]
    Connection(String),

    /// The explorer answered with an error status
    #[error("API error ({status}): {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Error text from the response
        message: String,
    },

    /// The response body was not what we expected
    #[error("Failed to parse blockchain response: {0}")]
    Parse(String),
}

/// Source of address transactions
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// List transactions received by `address`, in the explorer's order
    async fn fetch_transactions(
        &self,
        currency: Currency,
        address: &str,
    ) -> Result<Vec<ObservedTransaction>, FetchError>;
}
