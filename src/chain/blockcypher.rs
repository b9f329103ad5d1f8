//! BlockCypher address API client

use super::{ChainSource, FetchError, ObservedTransaction};
use crate::{config::ChainConfig, Amount, Currency, EscrowError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Client for `GET /{chain}/main/addrs/{address}`
#[derive(Debug, Clone)]
pub struct BlockCypherClient {
    /// HTTP client (carries the request timeout)
    client: reqwest::Client,
    /// API base URL, without trailing slash
    base_url: String,
    /// API token
    api_token: Option<String>,
    /// Transactions requested per address
    tx_limit: u32,
}

impl BlockCypherClient {
    /// Create a client from configuration
    pub fn new(config: &ChainConfig) -> Result<Self, EscrowError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("deal-escrow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EscrowError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            tx_limit: config.tx_limit,
        })
    }

    fn address_url(&self, currency: Currency, address: &str) -> String {
        let mut url = format!(
            "{}/{}/main/addrs/{}?limit={}",
            self.base_url,
            currency.chain_slug(),
            address,
            self.tx_limit
        );
        if let Some(token) = &self.api_token {
            url.push_str("&token=");
            url.push_str(token);
        }
        url
    }
}

#[async_trait]
impl ChainSource for BlockCypherClient {
    async fn fetch_transactions(
        &self,
        currency: Currency,
        address: &str,
    ) -> Result<Vec<ObservedTransaction>, FetchError> {
        info!("Checking transactions for {} address: {}", currency, address);

        let response = self
            .client
            .get(self.address_url(currency, address))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!("Timeout when requesting BlockCypher API for {}", address);
                    FetchError::Timeout
                } else {
                    error!("Connection error to BlockCypher API: {}", e);
                    FetchError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("BlockCypher rate limit hit while checking {}", address);
            return Err(FetchError::RateLimited);
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Connection(e.to_string())
            }
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("HTTP error {}", status.as_u16()));
            error!("BlockCypher API error: {} - {}", status, message);
            return Err(FetchError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let transactions = parse_address_response(&body)?;
        debug!("Found {} transactions for {}", transactions.len(), address);
        Ok(transactions)
    }
}

/// Parse an address endpoint body into observations, preserving order
fn parse_address_response(body: &str) -> Result<Vec<ObservedTransaction>, FetchError> {
    let response: AddressResponse = serde_json::from_str(body).map_err(|e| {
        error!("JSON parsing error for BlockCypher response: {}", e);
        FetchError::Parse(e.to_string())
    })?;

    // Spends from the address appear as txrefs too; only received outputs count
    Ok(response
        .txrefs
        .into_iter()
        .filter(|tx| tx.tx_output_n >= 0 && tx.tx_input_n < 0)
        .map(|tx| ObservedTransaction {
            tx_id: tx.tx_hash,
            value: Amount::from_base_units(tx.value),
            confirmations: tx.confirmations,
            observed_at: tx.confirmed,
        })
        .collect())
}

/// Address endpoint response (only the fields we read)
#[derive(Debug, serde::Deserialize)]
struct AddressResponse {
    #[serde(default)]
    txrefs: Vec<TxRef>,
}

#[derive(Debug, serde::Deserialize)]
struct TxRef {
    tx_hash: String,
    /// Input index when the address spent funds, -1 otherwise
    #[serde(default = "not_indexed")]
    tx_input_n: i64,
    /// Output index when the address received funds, -1 otherwise
    #[serde(default = "not_indexed")]
    tx_output_n: i64,
    /// Base units
    value: u64,
    #[serde(default)]
    confirmations: u32,
    confirmed: Option<DateTime<Utc>>,
}

fn not_indexed() -> i64 {
    -1
}

#[derive(Debug, serde::Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, timeout_seconds: u64) -> BlockCypherClient {
        let config = ChainConfig {
            base_url: server.uri(),
            timeout_seconds,
            ..ChainConfig::default()
        };
        BlockCypherClient::new(&config).unwrap()
    }

    async fn mount(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/btc/main/addrs/bc1qtest"))
            .and(query_param("limit", "10"))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[test]
    fn test_address_url() {
        let mut config = ChainConfig::default();
        let client = BlockCypherClient::new(&config).unwrap();
        assert_eq!(
            client.address_url(Currency::Ltc, "Lxyz"),
            "https://api.blockcypher.com/v1/ltc/main/addrs/Lxyz?limit=10"
        );

        config.api_token = Some("secret".to_string());
        config.base_url = "http://localhost:9000/v1/".to_string();
        let client = BlockCypherClient::new(&config).unwrap();
        assert_eq!(
            client.address_url(Currency::Btc, "bc1q"),
            "http://localhost:9000/v1/btc/main/addrs/bc1q?limit=10&token=secret"
        );
    }

    #[test]
    fn test_parse_address_response() {
        let body = r#"{
            "address": "bc1qtest",
            "final_balance": 102000,
            "txrefs": [
                {"tx_hash": "aaaa1111", "tx_input_n": -1, "tx_output_n": 0, "value": 102000, "confirmations": 4, "confirmed": "2024-05-01T10:00:00Z"},
                {"tx_hash": "bbbb2222", "tx_input_n": -1, "tx_output_n": 1, "value": 5000, "confirmations": 0}
            ]
        }"#;

        let txs = parse_address_response(body).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].tx_id, "aaaa1111");
        assert_eq!(txs[0].value.to_string(), "0.00102");
        assert_eq!(txs[0].confirmations, 4);
        assert!(txs[0].observed_at.is_some());
        assert_eq!(txs[1].observed_at, None);

        // An unused address has no txrefs key
        assert!(parse_address_response(r#"{"address": "bc1qnew"}"#).unwrap().is_empty());

        assert!(matches!(
            parse_address_response("<html>bad gateway</html>"),
            Err(FetchError::Parse(_))
        ));
    }

    #[test]
    fn test_spends_from_address_are_ignored() {
        let body = r#"{
            "txrefs": [
                {"tx_hash": "spend01", "tx_input_n": 0, "tx_output_n": -1, "value": 102000, "confirmations": 9},
                {"tx_hash": "recv01", "tx_input_n": -1, "tx_output_n": 0, "value": 102000, "confirmations": 12}
            ]
        }"#;

        let txs = parse_address_response(body).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].tx_id, "recv01");

        let only_spend = r#"{"txrefs": [{"tx_hash": "spend01", "tx_input_n": 0, "tx_output_n": -1, "value": 102000, "confirmations": 9}]}"#;
        assert!(parse_address_response(only_spend).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        mount(
            &server,
            ResponseTemplate::new(200).set_body_string(
                r#"{"txrefs": [{"tx_hash": "aaaa1111", "tx_input_n": -1, "tx_output_n": 0, "value": 102000, "confirmations": 3}]}"#,
            ),
        )
        .await;

        let txs = client_for(&server, 5)
            .fetch_transactions(Currency::Btc, "bc1qtest")
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].confirmations, 3);
    }

    #[tokio::test]
    async fn test_fetch_rate_limited() {
        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(429)).await;

        let result = client_for(&server, 5)
            .fetch_transactions(Currency::Btc, "bc1qtest")
            .await;
        assert_eq!(result, Err(FetchError::RateLimited));
    }

    #[tokio::test]
    async fn test_fetch_http_error_uses_api_message() {
        let server = MockServer::start().await;
        mount(
            &server,
            ResponseTemplate::new(500).set_body_string(r#"{"error": "Backend unavailable"}"#),
        )
        .await;

        let result = client_for(&server, 5)
            .fetch_transactions(Currency::Btc, "bc1qtest")
            .await;
        assert_eq!(
            result,
            Err(FetchError::Http {
                status: 500,
                message: "Backend unavailable".to_string(),
            })
        );

        // Without a JSON error body the status is reported
        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(404).set_body_string("not found")).await;
        let result = client_for(&server, 5)
            .fetch_transactions(Currency::Btc, "bc1qtest")
            .await;
        assert_eq!(
            result,
            Err(FetchError::Http {
                status: 404,
                message: "HTTP error 404".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = MockServer::start().await;
        mount(
            &server,
            ResponseTemplate::new(200)
                .set_body_string(r#"{"txrefs": []}"#)
                .set_delay(Duration::from_secs(3)),
        )
        .await;

        let result = client_for(&server, 1)
            .fetch_transactions(Currency::Btc, "bc1qtest")
            .await;
        assert_eq!(result, Err(FetchError::Timeout));
    }

    #[tokio::test]
    async fn test_fetch_malformed_body() {
        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(200).set_body_string("{\"txrefs\": [")).await;

        let result = client_for(&server, 5)
            .fetch_transactions(Currency::Btc, "bc1qtest")
            .await;
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        let config = ChainConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_seconds: 5,
            ..ChainConfig::default()
        };
        let client = BlockCypherClient::new(&config).unwrap();

        let result = client.fetch_transactions(Currency::Btc, "bc1qtest").await;
        assert!(matches!(result, Err(FetchError::Connection(_))));
    }
}
