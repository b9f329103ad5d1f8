//! Payment confirmation matching
//!
//! Decides, from the transactions an explorer reports for a deposit address,
//! whether a deal's payment has arrived. Pure: fetching is the caller's job.
//!
//! A transaction qualifies when it has at least the currency's minimum
//! confirmations and carries at least the expected amount minus a 1e-6 tolerance.
//! If several qualify, the first one in feed order wins; the feed is not re-sorted.

use crate::{
    chain::{FetchError, ObservedTransaction},
    config::Config,
    Amount, Currency,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Slack for amounts that were rounded on the way to the explorer (1e-6 coin)
pub const AMOUNT_TOLERANCE: Amount = Amount::from_base_units(100);

/// Sample transactions listed in a not-qualified diagnostic
const DIAGNOSTIC_SAMPLES: usize = 3;

/// Hash characters shown per sample
const HASH_PREFIX_CHARS: usize = 10;

/// Outcome of checking a deposit address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmationResult {
    /// Whether a qualifying payment was found
    pub confirmed: bool,
    /// Hash of the qualifying transaction
    pub tx_hash: Option<String>,
    /// Value of the qualifying transaction
    pub observed_amount: Option<Amount>,
    /// Confirmations of the qualifying transaction
    pub confirmations: Option<u32>,
    /// When the qualifying transaction was confirmed
    pub observed_at: Option<DateTime<Utc>>,
    /// Why the payment is not confirmed
    pub failure: Option<ConfirmationFailure>,
}

impl ConfirmationResult {
    fn confirmed(tx: &ObservedTransaction) -> Self {
        Self {
            confirmed: true,
            tx_hash: Some(tx.tx_id.clone()),
            observed_amount: Some(tx.value),
            confirmations: Some(tx.confirmations),
            observed_at: tx.observed_at,
            failure: None,
        }
    }

    fn failed(failure: ConfirmationFailure) -> Self {
        Self {
            confirmed: false,
            tx_hash: None,
            observed_amount: None,
            confirmations: None,
            observed_at: None,
            failure: Some(failure),
        }
    }

    /// Human-readable reason when not confirmed
    pub fn error(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.to_string())
    }
}

/// Classified reason a payment could not be confirmed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfirmationFailure {
    /// The address has no transactions
    NoTransactions,
    /// Transactions exist but none is large or deep enough
    NotQualified {
        /// Currency of the deal
        currency: Currency,
        /// Amount the deal expects
        required: Amount,
        /// Sum of all observed transactions
        received: Amount,
        /// Confirmations a transaction needs
        min_confirmations: u32,
        /// First few observed transactions
        samples: Vec<TransactionSample>,
        /// Transactions beyond the samples
        omitted: usize,
    },
    /// The explorer did not answer in time
    Timeout,
    /// The explorer throttled the request
    RateLimited,
    /// Network or HTTP-level failure
    Transport {
        /// Failure description
        message: String,
    },
    /// The explorer answered with something unreadable
    Parse {
        /// Failure description
        message: String,
    },
}

impl ConfirmationFailure {
    /// Short machine-readable classification
    pub fn kind(&self) -> &'static str {
        match self {
            ConfirmationFailure::NoTransactions => "no_transactions",
            ConfirmationFailure::NotQualified { .. } => "not_qualified",
            ConfirmationFailure::Timeout => "timeout",
            ConfirmationFailure::RateLimited => "rate_limited",
            ConfirmationFailure::Transport { .. } => "transport",
            ConfirmationFailure::Parse { .. } => "parse",
        }
    }

    /// Whether asking again later may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConfirmationFailure::Parse { .. })
    }
}

impl From<FetchError> for ConfirmationFailure {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Timeout => ConfirmationFailure::Timeout,
            FetchError::RateLimited => ConfirmationFailure::RateLimited,
            FetchError::Parse(message) => ConfirmationFailure::Parse { message },
            e @ (FetchError::Connection(_) | FetchError::Http { .. }) => {
                ConfirmationFailure::Transport { message: e.to_string() }
            }
        }
    }
}

impl fmt::Display for ConfirmationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationFailure::NoTransactions => {
                write!(f, "No transactions found for this address")
            }
            ConfirmationFailure::NotQualified {
                currency,
                required,
                received,
                min_confirmations,
                samples,
                omitted,
            } => {
                writeln!(f, "Required amount: {} {}", required, currency)?;
                writeln!(f, "Received: {} {}", received, currency)?;
                writeln!(f, "Min. confirmations: {}", min_confirmations)?;
                writeln!(f)?;
                writeln!(f, "Transaction details:")?;
                for (i, sample) in samples.iter().enumerate() {
                    writeln!(
                        f,
                        "{}. {}... | {} {} | {} conf.",
                        i + 1,
                        sample.hash_prefix,
                        sample.value,
                        currency,
                        sample.confirmations
                    )?;
                }
                if *omitted > 0 {
                    write!(f, "+ {} more transactions", omitted)?;
                }
                Ok(())
            }
            ConfirmationFailure::Timeout => {
                write!(f, "Timeout when requesting blockchain. Please try again later.")
            }
            ConfirmationFailure::RateLimited => {
                write!(f, "API request limit exceeded. Try again in 1 minute.")
            }
            ConfirmationFailure::Transport { message } => {
                write!(f, "Could not reach blockchain API: {}", message)
            }
            ConfirmationFailure::Parse { message } => {
                write!(f, "Blockchain response processing error: {}", message)
            }
        }
    }
}

/// One line of a not-qualified diagnostic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSample {
    /// First characters of the transaction hash
    pub hash_prefix: String,
    /// Transaction value
    pub value: Amount,
    /// Transaction confirmations
    pub confirmations: u32,
}

/// Applies the confirmation policy
#[derive(Clone)]
pub struct TransactionMatcher {
    config: Arc<Config>,
}

impl TransactionMatcher {
    /// Create a matcher using the configured confirmation thresholds
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Evaluate a fetch outcome for a deposit address
    pub fn evaluate(
        &self,
        currency: Currency,
        address: &str,
        expected: Amount,
        fetched: Result<Vec<ObservedTransaction>, FetchError>,
    ) -> ConfirmationResult {
        match fetched {
            Ok(transactions) => self.evaluate_transactions(currency, address, expected, &transactions),
            Err(e) => {
                info!("Could not check {} address {}: {}", currency, address, e);
                ConfirmationResult::failed(e.into())
            }
        }
    }

    /// Evaluate an already-fetched transaction list
    pub fn evaluate_transactions(
        &self,
        currency: Currency,
        address: &str,
        expected: Amount,
        transactions: &[ObservedTransaction],
    ) -> ConfirmationResult {
        if transactions.is_empty() {
            return ConfirmationResult::failed(ConfirmationFailure::NoTransactions);
        }

        let min_confirmations = self.config.min_confirmations(currency);
        let threshold = expected.saturating_sub(AMOUNT_TOLERANCE);

        for tx in transactions {
            debug!(
                "Transaction {}: confirmations={}, amount={} {}",
                tx.tx_id, tx.confirmations, tx.value, currency
            );
            if tx.confirmations >= min_confirmations && tx.value >= threshold {
                info!(
                    "Payment found for {} address {}: tx={}, amount={}, confirmations={}",
                    currency, address, tx.tx_id, tx.value, tx.confirmations
                );
                return ConfirmationResult::confirmed(tx);
            }
        }

        let received = transactions
            .iter()
            .fold(Amount::ZERO, |sum, tx| sum.saturating_add(tx.value));
        let samples = transactions
            .iter()
            .take(DIAGNOSTIC_SAMPLES)
            .map(|tx| TransactionSample {
                hash_prefix: tx.tx_id.chars().take(HASH_PREFIX_CHARS).collect(),
                value: tx.value,
                confirmations: tx.confirmations,
            })
            .collect();

        ConfirmationResult::failed(ConfirmationFailure::NotQualified {
            currency,
            required: expected,
            received,
            min_confirmations,
            samples,
            omitted: transactions.len().saturating_sub(DIAGNOSTIC_SAMPLES),
        })
    }
}
