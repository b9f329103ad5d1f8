//! Escrow core
//!
//! [`DealEngine`] is the only component that spans the address pool and the deal
//! store in one logical operation. It owns deal ID generation (with collision
//! retry), payment confirmation, and the broadcast of deal events the front-end
//! uses to notify buyers, sellers and admins.

mod matcher;
mod pool;
mod store;

pub use matcher::{
    ConfirmationFailure, ConfirmationResult, TransactionMatcher, TransactionSample, AMOUNT_TOLERANCE,
};
pub use pool::AddressPool;
pub use store::{DealStatus, DealStore};

use crate::{
    chain::{ChainSource, ObservedTransaction},
    config::Config,
    db::{Database, DealModel, UserModel, UserQueries},
    Amount, Currency, EscrowError, EscrowResult,
};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Length of a deal code
pub const DEAL_ID_LEN: usize = 6;

const DEAL_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Source of candidate deal IDs
pub trait DealIdGenerator: Send + Sync {
    /// Produce a candidate ID; collisions are handled by the caller
    fn generate(&self) -> String;
}

/// Uniformly random uppercase alphanumeric IDs
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDealIds;

impl DealIdGenerator for RandomDealIds {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..DEAL_ID_LEN)
            .map(|_| DEAL_ID_ALPHABET[rng.gen_range(0..DEAL_ID_ALPHABET.len())] as char)
            .collect()
    }
}

/// Canonical form of a user-supplied deal ID
pub fn normalize_deal_id(deal_id: &str) -> EscrowResult<String> {
    let id = deal_id.trim().to_ascii_uppercase();
    if id.len() != DEAL_ID_LEN || !id.bytes().all(|b| DEAL_ID_ALPHABET.contains(&b)) {
        return Err(EscrowError::Validation(format!("Invalid deal ID: '{}'", deal_id.trim())));
    }
    Ok(id)
}

/// Something that happened to a deal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DealEvent {
    /// A deal was created and is waiting for payment
    Created {
        /// Deal ID
        deal_id: String,
        /// Deal currency
        currency: Currency,
        /// Amount the buyer must send
        payable_amount: Amount,
        /// Where to send it
        deposit_address: String,
    },
    /// The buyer reported payment; an admin must verify it
    AwaitingAdmin {
        /// Deal ID
        deal_id: String,
    },
    /// An admin confirmed the payment on chain
    Paid {
        /// Deal ID
        deal_id: String,
        /// Confirmed transaction
        tx_hash: String,
    },
    /// The seller shipped
    Shipped {
        /// Deal ID
        deal_id: String,
    },
    /// Funds were released
    Completed {
        /// Deal ID
        deal_id: String,
    },
    /// A participant asked an admin to step in
    HelpRequested {
        /// Deal ID
        deal_id: String,
        /// Telegram ID of the participant
        telegram_id: i64,
        /// Their username, when known
        username: Option<String>,
    },
}

impl DealEvent {
    /// The deal this event concerns
    pub fn deal_id(&self) -> &str {
        match self {
            DealEvent::Created { deal_id, .. }
            | DealEvent::AwaitingAdmin { deal_id }
            | DealEvent::Paid { deal_id, .. }
            | DealEvent::Shipped { deal_id }
            | DealEvent::Completed { deal_id }
            | DealEvent::HelpRequested { deal_id, .. } => deal_id,
        }
    }
}

impl fmt::Display for DealEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DealEvent::Created {
                deal_id,
                currency,
                payable_amount,
                deposit_address,
            } => write!(
                f,
                "deal {} created, awaiting {} {} at {}",
                deal_id, payable_amount, currency, deposit_address
            ),
            DealEvent::AwaitingAdmin { deal_id } => {
                write!(f, "deal {} reported paid, awaiting admin confirmation", deal_id)
            }
            DealEvent::Paid { deal_id, tx_hash } => {
                write!(f, "deal {} payment confirmed (tx {})", deal_id, tx_hash)
            }
            DealEvent::Shipped { deal_id } => write!(f, "deal {} shipped", deal_id),
            DealEvent::Completed { deal_id } => write!(f, "deal {} completed", deal_id),
            DealEvent::HelpRequested {
                deal_id,
                telegram_id,
                username,
            } => match username {
                Some(username) => write!(f, "deal {}: @{} asked for admin help", deal_id, username),
                None => write!(f, "deal {}: user {} asked for admin help", deal_id, telegram_id),
            },
        }
    }
}

/// Who to contact about a deal that needs an admin
#[derive(Debug, Clone, Serialize)]
pub struct HelpRequest {
    /// Deal ID
    pub deal_id: String,
    /// Deal status when help was requested
    pub status: DealStatus,
    /// Telegram ID of the participant asking
    pub telegram_id: i64,
    /// Admin username to contact, when configured
    pub admin_username: Option<String>,
}

/// Deal orchestration
pub struct DealEngine {
    config: Arc<Config>,
    db: Arc<Database>,
    pool: Arc<AddressPool>,
    store: DealStore,
    chain: Arc<dyn ChainSource>,
    matcher: TransactionMatcher,
    id_gen: Arc<dyn DealIdGenerator>,
    events: broadcast::Sender<DealEvent>,
}

impl DealEngine {
    /// Create a new deal engine
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        pool: Arc<AddressPool>,
        chain: Arc<dyn ChainSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            matcher: TransactionMatcher::new(config.clone()),
            store: DealStore::new(db.clone()),
            config,
            db,
            pool,
            chain,
            id_gen: Arc::new(RandomDealIds),
            events,
        }
    }

    /// Replace the deal ID generator
    pub fn with_id_generator(mut self, id_gen: Arc<dyn DealIdGenerator>) -> Self {
        self.id_gen = id_gen;
        self
    }

    /// Subscribe to deal events
    pub fn subscribe(&self) -> broadcast::Receiver<DealEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DealEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register a user on first contact, refreshing the username on later calls
    pub async fn register_user(&self, telegram_id: i64, username: Option<&str>) -> EscrowResult<UserModel> {
        let username = username
            .map(|u| u.trim().trim_start_matches('@'))
            .filter(|u| !u.is_empty());
        UserQueries::new(&self.db)
            .upsert(telegram_id, username)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to register user {}: {}", telegram_id, e)))
    }

    /// Look up a user by internal ID
    pub async fn get_user(&self, user_id: i64) -> EscrowResult<UserModel> {
        UserQueries::new(&self.db)
            .get_by_id(user_id)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to load user {}: {}", user_id, e)))?
            .ok_or_else(|| EscrowError::UserNotFound(user_id.to_string()))
    }

    /// Look up a user by Telegram ID
    pub async fn get_user_by_telegram_id(&self, telegram_id: i64) -> EscrowResult<UserModel> {
        UserQueries::new(&self.db)
            .get_by_telegram_id(telegram_id)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to load user {}: {}", telegram_id, e)))?
            .ok_or_else(|| EscrowError::UserNotFound(format!("telegram:{}", telegram_id)))
    }

    /// Look up a user by username (leading `@` and case ignored)
    pub async fn find_user_by_username(&self, username: &str) -> EscrowResult<UserModel> {
        UserQueries::new(&self.db)
            .get_by_username(username)
            .await
            .map_err(|e| EscrowError::Database(format!("Failed to look up @{}: {}", username, e)))?
            .ok_or_else(|| EscrowError::UserNotFound(format!("@{}", username.trim().trim_start_matches('@'))))
    }

    /// Create a deal and bind it to a fresh deposit address.
    ///
    /// Nothing is persisted when validation or address reservation fails. When every
    /// generated ID collides, the reserved address goes back to the pool.
    pub async fn create_deal(
        &self,
        buyer_id: i64,
        seller_id: i64,
        currency: Currency,
        amount: Amount,
        description: &str,
    ) -> EscrowResult<DealModel> {
        let limits = self.config.currency(currency);
        if amount < limits.min_amount {
            return Err(EscrowError::Validation(format!(
                "Minimum amount for {} is {} {}, got {}",
                currency, limits.min_amount, currency, amount
            )));
        }

        let description = description.trim();
        if description.is_empty() {
            return Err(EscrowError::Validation("Description must not be empty".to_string()));
        }
        let max_chars = self.config.escrow.max_description_chars;
        if description.chars().count() > max_chars {
            return Err(EscrowError::Validation(format!(
                "Description is longer than {} characters",
                max_chars
            )));
        }

        if buyer_id == seller_id {
            return Err(EscrowError::Validation(
                "Buyer and seller must be different users".to_string(),
            ));
        }
        let buyer = self.get_user(buyer_id).await?;
        let seller = self.get_user(seller_id).await?;

        let payable_amount = self.config.payable_amount(amount);
        let address = self.pool.reserve(currency).await?;

        let max_attempts = self.config.escrow.max_id_attempts;
        let mut created = None;
        for attempt in 1..=max_attempts {
            let now = Utc::now();
            let deal = DealModel {
                id: self.id_gen.generate(),
                buyer_id: buyer.id,
                seller_id: seller.id,
                currency,
                original_amount: amount,
                payable_amount,
                description: description.to_string(),
                status: DealStatus::Created,
                deposit_address: address.address.clone(),
                tx_hash: None,
                created_at: now,
                updated_at: now,
            };

            match self.store.insert(&deal).await {
                Ok(()) => {
                    created = Some(deal);
                    break;
                }
                Err(EscrowError::DuplicateId(id)) => {
                    warn!("Deal ID {} collided (attempt {}/{})", id, attempt, max_attempts);
                }
                Err(e) => {
                    self.release_abandoned(&address.address).await;
                    return Err(e);
                }
            }
        }

        let Some(deal) = created else {
            self.release_abandoned(&address.address).await;
            return Err(EscrowError::IdSpaceExhausted(max_attempts));
        };

        let deal = match self
            .store
            .transition(&deal.id, DealStatus::AwaitingPayment, None)
            .await
        {
            Ok(deal) => deal,
            Err(e) => {
                error!("Deal {} stuck in {}: {}", deal.id, DealStatus::Created, e);
                self.release_abandoned(&address.address).await;
                return Err(e);
            }
        };

        info!(
            "Created deal {}: {} {} (payable {}) from buyer {} to seller {}, address {}",
            deal.id, amount, currency, payable_amount, buyer.telegram_id, seller.telegram_id, deal.deposit_address
        );

        self.emit(DealEvent::Created {
            deal_id: deal.id.clone(),
            currency,
            payable_amount,
            deposit_address: deal.deposit_address.clone(),
        });

        Ok(deal)
    }

    async fn release_abandoned(&self, address: &str) {
        if let Err(e) = self.pool.release(address).await {
            error!("Failed to release deposit address {}: {}", address, e);
        }
    }

    /// Load a deal
    pub async fn get_deal(&self, deal_id: &str) -> EscrowResult<DealModel> {
        let deal_id = normalize_deal_id(deal_id)?;
        self.store.get(&deal_id).await
    }

    /// Deals in a status, oldest first
    pub async fn list_deals_by_status(&self, status: DealStatus) -> EscrowResult<Vec<DealModel>> {
        self.store.list_by_status(status).await
    }

    /// Check the deal's deposit address without changing the deal
    pub async fn check_payment(&self, deal_id: &str) -> EscrowResult<ConfirmationResult> {
        let deal = self.get_deal(deal_id).await?;
        self.match_payment(&deal).await
    }

    /// Verify the payment on chain and, when found, move the deal to PAID.
    ///
    /// The deal must be waiting for admin review; an unconfirmed result leaves it there.
    pub async fn confirm_payment(&self, deal_id: &str) -> EscrowResult<ConfirmationResult> {
        let deal = self.get_deal(deal_id).await?;
        if deal.status != DealStatus::PaidWaitingAdmin {
            return Err(EscrowError::IllegalTransition {
                deal_id: deal.id,
                from: deal.status,
                to: DealStatus::Paid,
            });
        }

        info!("Starting payment check for deal {}", deal.id);
        let result = self.match_payment(&deal).await?;

        match (&result.tx_hash, result.confirmed) {
            (Some(tx_hash), true) => {
                self.store
                    .transition(&deal.id, DealStatus::Paid, Some(tx_hash.as_str()))
                    .await?;
                info!("Payment for deal {} confirmed in tx {}", deal.id, tx_hash);
                self.emit(DealEvent::Paid {
                    deal_id: deal.id,
                    tx_hash: tx_hash.clone(),
                });
            }
            _ => {
                info!(
                    "Payment for deal {} not confirmed: {}",
                    deal.id,
                    result.failure.as_ref().map(|f| f.kind()).unwrap_or("unknown")
                );
            }
        }

        Ok(result)
    }

    async fn match_payment(&self, deal: &DealModel) -> EscrowResult<ConfirmationResult> {
        let fetched = match self
            .chain
            .fetch_transactions(deal.currency, &deal.deposit_address)
            .await
        {
            Ok(transactions) => Ok(self.unclaimed(deal, transactions).await?),
            Err(e) => Err(e),
        };
        Ok(self
            .matcher
            .evaluate(deal.currency, &deal.deposit_address, deal.payable_amount, fetched))
    }

    /// Drop transactions already recorded as the payment of another deal.
    /// A reclaimed address can carry an earlier deal's payment.
    async fn unclaimed(
        &self,
        deal: &DealModel,
        transactions: Vec<ObservedTransaction>,
    ) -> EscrowResult<Vec<ObservedTransaction>> {
        let mut kept = Vec::with_capacity(transactions.len());
        for tx in transactions {
            match self.store.find_by_tx_hash(&tx.tx_id).await? {
                Some(owner) if owner.id != deal.id => {
                    info!(
                        "Ignoring transaction {} for deal {}: it settles deal {}",
                        tx.tx_id, deal.id, owner.id
                    );
                }
                _ => kept.push(tx),
            }
        }
        Ok(kept)
    }

    /// A buyer or seller asks an admin to look at the deal.
    ///
    /// Admins learn about it through [`DealEvent::HelpRequested`]; the caller gets
    /// the admin username to contact directly.
    pub async fn request_help(&self, deal_id: &str, telegram_id: i64) -> EscrowResult<HelpRequest> {
        let deal = self.get_deal(deal_id).await?;
        let user = self.get_user_by_telegram_id(telegram_id).await?;
        if user.id != deal.buyer_id && user.id != deal.seller_id {
            return Err(EscrowError::Validation(format!(
                "User {} is not a party to deal {}",
                telegram_id, deal.id
            )));
        }

        warn!("Help requested for deal {} ({}) by {}", deal.id, deal.status, telegram_id);
        self.emit(DealEvent::HelpRequested {
            deal_id: deal.id.clone(),
            telegram_id,
            username: user.username,
        });

        let admin_username = self
            .config
            .escrow
            .admin_username
            .as_deref()
            .map(|u| u.trim().trim_start_matches('@').to_string())
            .filter(|u| !u.is_empty());
        Ok(HelpRequest {
            deal_id: deal.id,
            status: deal.status,
            telegram_id,
            admin_username,
        })
    }

    /// Buyer says the payment was sent
    pub async fn report_paid(&self, deal_id: &str) -> EscrowResult<DealModel> {
        let deal_id = normalize_deal_id(deal_id)?;
        let deal = self
            .store
            .transition(&deal_id, DealStatus::PaidWaitingAdmin, None)
            .await?;
        info!("Buyer reported payment for deal {}", deal.id);
        self.emit(DealEvent::AwaitingAdmin { deal_id: deal.id.clone() });
        Ok(deal)
    }

    /// Seller says the item was shipped
    pub async fn report_shipped(&self, deal_id: &str) -> EscrowResult<DealModel> {
        let deal_id = normalize_deal_id(deal_id)?;
        let deal = self.store.transition(&deal_id, DealStatus::Shipped, None).await?;
        info!("Seller shipped deal {}", deal.id);
        self.emit(DealEvent::Shipped { deal_id: deal.id.clone() });
        Ok(deal)
    }

    /// Admin releases the funds to the seller
    pub async fn release_funds(&self, deal_id: &str) -> EscrowResult<DealModel> {
        let deal_id = normalize_deal_id(deal_id)?;
        let deal = self.store.transition(&deal_id, DealStatus::Completed, None).await?;
        info!("Funds released for deal {}", deal.id);
        self.emit(DealEvent::Completed { deal_id: deal.id.clone() });
        Ok(deal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FetchError, ObservedTransaction};
    use crate::db::AddressState;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Fetched = Result<Vec<ObservedTransaction>, FetchError>;

    /// Answers fetches from a queue; an empty queue means no transactions
    #[derive(Default)]
    struct ScriptedChain {
        responses: Mutex<VecDeque<Fetched>>,
    }

    impl ScriptedChain {
        fn push(&self, response: Fetched) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl ChainSource for ScriptedChain {
        async fn fetch_transactions(&self, _currency: Currency, _address: &str) -> Fetched {
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    /// Hands out IDs from a list, repeating the last one, and counts calls
    struct ScriptedIds {
        ids: Mutex<VecDeque<String>>,
        last: Mutex<String>,
        calls: AtomicUsize,
    }

    impl ScriptedIds {
        fn new(ids: &[&str]) -> Self {
            Self {
                ids: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
                last: Mutex::new(String::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn extend(&self, ids: &[&str]) {
            self.ids.lock().unwrap().extend(ids.iter().map(|s| s.to_string()));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DealIdGenerator for ScriptedIds {
        fn generate(&self) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.ids.lock().unwrap().pop_front() {
                *last = next;
            }
            last.clone()
        }
    }

    struct Harness {
        engine: DealEngine,
        db: Arc<Database>,
        pool: Arc<AddressPool>,
        chain: Arc<ScriptedChain>,
        buyer: UserModel,
        seller: UserModel,
    }

    async fn harness(btc_addresses: &[&str], ids: Option<Arc<ScriptedIds>>) -> Harness {
        harness_with(Config::default(), btc_addresses, ids).await
    }

    async fn harness_with(config: Config, btc_addresses: &[&str], ids: Option<Arc<ScriptedIds>>) -> Harness {
        let config = Arc::new(config);
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let pool = Arc::new(AddressPool::new(config.clone(), db.clone()));
        let addresses: Vec<String> = btc_addresses.iter().map(|a| a.to_string()).collect();
        pool.import(Currency::Btc, &addresses).await.unwrap();

        let chain = Arc::new(ScriptedChain::default());
        let mut engine = DealEngine::new(config, db.clone(), pool.clone(), chain.clone());
        if let Some(ids) = ids {
            engine = engine.with_id_generator(ids);
        }

        let buyer = engine.register_user(100, Some("@Alice")).await.unwrap();
        let seller = engine.register_user(200, Some("bob")).await.unwrap();

        Harness {
            engine,
            db,
            pool,
            chain,
            buyer,
            seller,
        }
    }

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn test_random_ids_and_normalization() {
        for _ in 0..50 {
            let id = RandomDealIds.generate();
            assert_eq!(normalize_deal_id(&id).unwrap(), id);
        }
        assert_eq!(normalize_deal_id(" ab12cd ").unwrap(), "AB12CD");
        assert!(matches!(normalize_deal_id("AB12C"), Err(EscrowError::Validation(_))));
        assert!(matches!(normalize_deal_id("AB-12C"), Err(EscrowError::Validation(_))));
    }

    #[tokio::test]
    async fn test_end_to_end_lifecycle() {
        let ids = Arc::new(ScriptedIds::new(&["DEAL01"]));
        let h = harness(&["bc1qa", "bc1qb"], Some(ids)).await;
        let mut events = h.engine.subscribe();

        let deal = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.001"), "Vintage camera")
            .await
            .unwrap();
        assert_eq!(deal.id, "DEAL01");
        assert_eq!(deal.payable_amount, amt("0.00102"));
        assert_eq!(deal.status, DealStatus::AwaitingPayment);
        assert_eq!(deal.deposit_address, "bc1qa");
        assert_eq!(h.pool.get("bc1qa").await.unwrap().unwrap().state, AddressState::Reserved);
        assert_eq!(h.pool.get("bc1qb").await.unwrap().unwrap().state, AddressState::Free);
        assert!(matches!(events.recv().await.unwrap(), DealEvent::Created { .. }));

        let deal = h.engine.report_paid("deal01").await.unwrap();
        assert_eq!(deal.status, DealStatus::PaidWaitingAdmin);
        assert_eq!(
            events.recv().await.unwrap(),
            DealEvent::AwaitingAdmin { deal_id: "DEAL01".to_string() }
        );

        // Two confirmations are not enough for BTC
        h.chain.push(Ok(vec![ObservedTransaction {
            tx_id: "f00dbabe".to_string(),
            value: amt("0.00102"),
            confirmations: 2,
            observed_at: None,
        }]));
        let result = h.engine.confirm_payment("DEAL01").await.unwrap();
        assert!(!result.confirmed);
        assert_eq!(h.engine.get_deal("DEAL01").await.unwrap().status, DealStatus::PaidWaitingAdmin);

        h.chain.push(Ok(vec![ObservedTransaction {
            tx_id: "f00dbabe".to_string(),
            value: amt("0.00102"),
            confirmations: 3,
            observed_at: None,
        }]));
        let result = h.engine.confirm_payment("DEAL01").await.unwrap();
        assert!(result.confirmed);
        let deal = h.engine.get_deal("DEAL01").await.unwrap();
        assert_eq!(deal.status, DealStatus::Paid);
        assert_eq!(deal.tx_hash.as_deref(), Some("f00dbabe"));

        // Confirming again is not re-processed
        assert!(matches!(
            h.engine.confirm_payment("DEAL01").await,
            Err(EscrowError::IllegalTransition { from: DealStatus::Paid, .. })
        ));

        assert_eq!(h.engine.report_shipped("DEAL01").await.unwrap().status, DealStatus::Shipped);
        assert_eq!(h.engine.release_funds("DEAL01").await.unwrap().status, DealStatus::Completed);

        // The address stays pinned to the completed deal
        assert_eq!(h.pool.sweep(Utc::now() + chrono::Duration::days(2)).await.unwrap(), 0);
        assert_eq!(h.pool.get("bc1qa").await.unwrap().unwrap().state, AddressState::Reserved);
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let h = harness(&["bc1qa"], None).await;
        let deal = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Book")
            .await
            .unwrap();

        assert!(matches!(
            h.engine.release_funds(&deal.id).await,
            Err(EscrowError::IllegalTransition { from: DealStatus::AwaitingPayment, to: DealStatus::Completed, .. })
        ));
        assert!(matches!(
            h.engine.confirm_payment(&deal.id).await,
            Err(EscrowError::IllegalTransition { from: DealStatus::AwaitingPayment, .. })
        ));

        h.engine.report_paid(&deal.id).await.unwrap();
        h.chain.push(Ok(vec![ObservedTransaction {
            tx_id: "abc".to_string(),
            value: amt("0.0102"),
            confirmations: 6,
            observed_at: None,
        }]));
        h.engine.confirm_payment(&deal.id).await.unwrap();

        assert!(matches!(
            h.engine.report_paid(&deal.id).await,
            Err(EscrowError::IllegalTransition { from: DealStatus::Paid, to: DealStatus::PaidWaitingAdmin, .. })
        ));
        assert!(matches!(
            h.engine.report_shipped("ZZZZZZ").await,
            Err(EscrowError::DealNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_id_collision_retry() {
        let ids = Arc::new(ScriptedIds::new(&["AAAAAA", "BBBBBB"]));
        let h = harness(&["bc1qa", "bc1qb", "bc1qc"], Some(ids.clone())).await;

        for _ in 0..2 {
            h.engine
                .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Item")
                .await
                .unwrap();
        }
        let before = ids.calls();

        ids.extend(&["AAAAAA", "BBBBBB", "CCCCCC"]);
        let deal = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Item")
            .await
            .unwrap();
        assert_eq!(deal.id, "CCCCCC");
        assert_eq!(ids.calls() - before, 3);
    }

    #[tokio::test]
    async fn test_id_space_exhausted_releases_address() {
        let ids = Arc::new(ScriptedIds::new(&["AAAAAA"]));
        let h = harness(&["bc1qa", "bc1qb"], Some(ids.clone())).await;

        h.engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Item")
            .await
            .unwrap();

        match h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Item")
            .await
        {
            Err(EscrowError::IdSpaceExhausted(attempts)) => assert_eq!(attempts, 5),
            other => panic!("expected IdSpaceExhausted, got {:?}", other),
        }
        assert_eq!(ids.calls(), 6);
        assert_eq!(h.pool.get("bc1qb").await.unwrap().unwrap().state, AddressState::Free);
    }

    #[tokio::test]
    async fn test_pool_exhausted_creates_nothing() {
        let h = harness(&["bc1qa"], None).await;

        h.engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "First")
            .await
            .unwrap();
        assert!(matches!(
            h.engine
                .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Second")
                .await,
            Err(EscrowError::PoolExhausted(Currency::Btc))
        ));

        let awaiting = h.engine.list_deals_by_status(DealStatus::AwaitingPayment).await.unwrap();
        assert_eq!(awaiting.len(), 1);
        assert!(h.engine.list_deals_by_status(DealStatus::Created).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_deal_validation() {
        let h = harness(&["bc1qa"], None).await;
        let e = &h.engine;

        let below_min = e
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.0002"), "Item")
            .await;
        assert!(matches!(below_min, Err(EscrowError::Validation(_))));

        let empty = e
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "   ")
            .await;
        assert!(matches!(empty, Err(EscrowError::Validation(_))));

        let long = "x".repeat(201);
        let too_long = e
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), &long)
            .await;
        assert!(matches!(too_long, Err(EscrowError::Validation(_))));

        let self_deal = e
            .create_deal(h.buyer.id, h.buyer.id, Currency::Btc, amt("0.01"), "Item")
            .await;
        assert!(matches!(self_deal, Err(EscrowError::Validation(_))));

        let unknown = e
            .create_deal(h.buyer.id, 9999, Currency::Btc, amt("0.01"), "Item")
            .await;
        assert!(matches!(unknown, Err(EscrowError::UserNotFound(_))));

        // None of the rejected requests consumed the address
        assert!(h.pool.has_free(Currency::Btc).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_payment_reports_failures_without_transition() {
        let h = harness(&["bc1qa"], None).await;
        let deal = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Item")
            .await
            .unwrap();
        h.engine.report_paid(&deal.id).await.unwrap();

        h.chain.push(Err(FetchError::RateLimited));
        let result = h.engine.confirm_payment(&deal.id).await.unwrap();
        assert!(!result.confirmed);
        assert_eq!(result.failure.unwrap().kind(), "rate_limited");

        h.chain.push(Ok(vec![ObservedTransaction {
            tx_id: "abc".to_string(),
            value: amt("0.0102"),
            confirmations: 10,
            observed_at: None,
        }]));
        let preview = h.engine.check_payment(&deal.id).await.unwrap();
        assert!(preview.confirmed);
        assert_eq!(
            h.engine.get_deal(&deal.id).await.unwrap().status,
            DealStatus::PaidWaitingAdmin
        );
    }

    fn paid(tx_id: &str, value: &str, confirmations: u32) -> Fetched {
        Ok(vec![ObservedTransaction {
            tx_id: tx_id.to_string(),
            value: amt(value),
            confirmations,
            observed_at: None,
        }])
    }

    #[tokio::test]
    async fn test_reclaimed_address_payment_settles_one_deal() {
        let ids = Arc::new(ScriptedIds::new(&["FIRST1", "SECND2"]));
        let h = harness(&["bc1qa"], Some(ids)).await;

        let first = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Lens")
            .await
            .unwrap();
        h.engine.report_paid(&first.id).await.unwrap();

        // Expire the reservation so the next deal reclaims the address
        {
            let conn = h.db.conn();
            let conn = conn.lock().await;
            conn.execute("UPDATE deposit_addresses SET reserved_until = 0 WHERE address = 'bc1qa'", [])
                .unwrap();
        }
        let second = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Lens")
            .await
            .unwrap();
        assert_eq!(second.deposit_address, "bc1qa");
        h.engine.report_paid(&second.id).await.unwrap();

        h.chain.push(paid("samepay", "0.0102", 4));
        h.chain.push(paid("samepay", "0.0102", 4));

        let result = h.engine.confirm_payment(&first.id).await.unwrap();
        assert!(result.confirmed);
        assert_eq!(h.engine.get_deal(&first.id).await.unwrap().status, DealStatus::Paid);

        let result = h.engine.confirm_payment(&second.id).await.unwrap();
        assert!(!result.confirmed);
        assert_eq!(result.tx_hash, None);
        let second = h.engine.get_deal(&second.id).await.unwrap();
        assert_eq!(second.status, DealStatus::PaidWaitingAdmin);
        assert_eq!(second.tx_hash, None);
    }

    #[tokio::test]
    async fn test_failed_activation_releases_address() {
        let h = harness(&["bc1qa"], None).await;
        {
            let conn = h.db.conn();
            let conn = conn.lock().await;
            conn.execute_batch(
                "CREATE TRIGGER block_activation BEFORE UPDATE OF status ON deals
                 WHEN NEW.status = 'AWAITING_PAYMENT'
                 BEGIN SELECT RAISE(ABORT, 'activation blocked'); END;",
            )
            .unwrap();
        }

        let result = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Item")
            .await;
        assert!(result.is_err());
        assert_eq!(h.pool.get("bc1qa").await.unwrap().unwrap().state, AddressState::Free);
        assert!(h.pool.has_free(Currency::Btc).await.unwrap());
    }

    #[tokio::test]
    async fn test_request_help() {
        let mut config = Config::default();
        config.escrow.admin_username = Some("@escrow_admin".to_string());
        let h = harness_with(config, &["bc1qa"], None).await;
        let outsider = h.engine.register_user(300, Some("carol")).await.unwrap();
        let deal = h
            .engine
            .create_deal(h.buyer.id, h.seller.id, Currency::Btc, amt("0.01"), "Item")
            .await
            .unwrap();
        let mut events = h.engine.subscribe();

        let help = h.engine.request_help(&deal.id, h.seller.telegram_id).await.unwrap();
        assert_eq!(help.deal_id, deal.id);
        assert_eq!(help.status, DealStatus::AwaitingPayment);
        assert_eq!(help.admin_username.as_deref(), Some("escrow_admin"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.deal_id(), deal.id);
        assert_eq!(
            event,
            DealEvent::HelpRequested {
                deal_id: deal.id.clone(),
                telegram_id: 200,
                username: Some("bob".to_string()),
            }
        );

        assert!(matches!(
            h.engine.request_help(&deal.id, outsider.telegram_id).await,
            Err(EscrowError::Validation(_))
        ));
        assert!(matches!(
            h.engine.request_help("ZZZZZZ", h.buyer.telegram_id).await,
            Err(EscrowError::DealNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let h = harness(&[], None).await;
        assert_eq!(h.buyer.username.as_deref(), Some("Alice"));

        let found = h.engine.find_user_by_username("@alice").await.unwrap();
        assert_eq!(found.telegram_id, 100);
        assert_eq!(h.engine.get_user_by_telegram_id(200).await.unwrap().id, h.seller.id);

        assert!(matches!(
            h.engine.find_user_by_username("carol").await,
            Err(EscrowError::UserNotFound(_))
        ));
        assert!(matches!(h.engine.get_user(4242).await, Err(EscrowError::UserNotFound(_))));
    }
}
