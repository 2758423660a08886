//! The invoice state machine.
//!
//! The tracker holds every non-terminal invoice in memory, keyed by its
//! receiving address. Mempool and block events from the poller are matched
//! against the tracked set by view-key scanning; expiry timers run per
//! invoice. Removal from the tracked set is the only gate to a terminal
//! transition, and removal is a test-and-delete, so each invoice fires at
//! most one terminal effect no matter how many handlers race.

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use monero::{cryptonote::onetime_key::SubKeyChecker, Amount};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use crate::{
    invoice::{piconeros_to_xmr, CoinType, Invoice, InvoiceStatus},
    monerod_client::{Block, Client as MonerodClient, FetchedTransaction, PoolTransaction},
    poller::DaemonPoller,
    storage::Storage,
    subaddress,
};

/// How often the poller's sync height is flushed to storage.
const PERSIST_CACHE_INTERVAL: Duration = Duration::from_secs(60);

/// A transaction the tracker may credit to an invoice, observed either in
/// the txpool or in a fetched block.
///
/// Both shapes report zero confirmations; real confirmation counts are only
/// trusted when fetched explicitly on the confirm path.
#[derive(Debug, Clone)]
pub(crate) enum IncomingTx {
    Pool(PoolTransaction),
    Fetched(FetchedTransaction),
}

impl IncomingTx {
    fn transaction(&self) -> &monero::Transaction {
        match self {
            IncomingTx::Pool(tx) => &tx.tx,
            IncomingTx::Fetched(tx) => &tx.tx,
        }
    }

    fn confirmations(&self) -> u64 {
        0
    }

    fn double_spend_seen(&self) -> bool {
        match self {
            IncomingTx::Pool(tx) => tx.double_spend_seen,
            IncomingTx::Fetched(tx) => tx.double_spend_seen,
        }
    }

    fn tx_id(&self) -> monero::Hash {
        match self {
            IncomingTx::Pool(tx) => tx.id_hash,
            IncomingTx::Fetched(tx) => tx.tx_hash,
        }
    }
}

/// A non-terminal invoice held by the tracker. The snapshot pointer is
/// swapped whole on every committed mutation, so readers always see a
/// consistent row.
#[derive(Debug, Clone)]
struct TrackedInvoice {
    snapshot: Arc<RwLock<Arc<Invoice>>>,
    expiry_cancel: CancellationToken,
}

impl TrackedInvoice {
    fn new(invoice: Invoice, expiry_cancel: CancellationToken) -> TrackedInvoice {
        TrackedInvoice {
            snapshot: Arc::new(RwLock::new(Arc::new(invoice))),
            expiry_cancel,
        }
    }

    fn load(&self) -> Arc<Invoice> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, invoice: Invoice) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(invoice);
    }
}

pub(crate) struct XmrTracker<S: Storage, M: MonerodClient> {
    store: S,
    client: M,
    poller: Arc<DaemonPoller<M>>,
    pending: Arc<DashMap<String, TrackedInvoice>>,
    events: mpsc::UnboundedSender<Invoice>,
    cancel: CancellationToken,
}

impl<S: Storage, M: MonerodClient> Clone for XmrTracker<S, M> {
    fn clone(&self) -> Self {
        XmrTracker {
            store: self.store.clone(),
            client: self.client.clone(),
            poller: self.poller.clone(),
            pending: self.pending.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: Storage, M: MonerodClient> XmrTracker<S, M> {
    pub(crate) fn new(
        store: S,
        client: M,
        poller: Arc<DaemonPoller<M>>,
        events: mpsc::UnboundedSender<Invoice>,
        cancel: CancellationToken,
    ) -> XmrTracker<S, M> {
        XmrTracker {
            store,
            client,
            poller,
            pending: Arc::new(DashMap::new()),
            events,
            cancel,
        }
    }

    /// Resolve the height the poller should start at: the persisted sync
    /// cursor when one exists, the daemon's current tip otherwise. A fresh
    /// deployment never scans history.
    pub(crate) async fn resolve_start_height(&self) -> Result<u64, crate::ProcessorError> {
        if let Some(cache) = self.store.find_cache(CoinType::Xmr).await? {
            if let Some(height) = cache.last_synced_block_height {
                info!("Resuming XMR sync from persisted height {height}");
                return Ok(height);
            }
        }
        let tip = self.client.last_block_header().await?.height;
        info!("No persisted XMR sync height; starting at daemon tip {tip}");
        Ok(tip)
    }

    /// Subscribe to the poller's event feeds, start the poller at
    /// `start_height`, and spawn the cache-persist loop.
    pub(crate) fn start(&self, start_height: u64) {
        let tracker = self.clone();
        let mut txpool = self.poller.subscribe_txpool();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    tx = txpool.recv() => match tx {
                        Some(tx) => {
                            let tracker = tracker.clone();
                            tokio::spawn(async move {
                                tracker.verify_tx(IncomingTx::Pool(tx)).await;
                            });
                        }
                        None => return,
                    },
                }
            }
        });

        let tracker = self.clone();
        let mut blocks = self.poller.subscribe_blocks();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    block = blocks.recv() => match block {
                        Some(block) => {
                            let tracker = tracker.clone();
                            tokio::spawn(async move {
                                tracker.on_new_block(block).await;
                            });
                        }
                        None => return,
                    },
                }
            }
        });

        // Subscriptions are in place; let events flow. The poller must be
        // running before the first cache persist, so the persisted cursor
        // is never behind the configured start.
        self.poller.start(start_height);

        let tracker = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(PERSIST_CACHE_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => tracker.persist_cache().await,
                }
            }
        });
    }

    /// Number of invoices currently tracked.
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Begin tracking a non-terminal invoice and arm its expiry timer.
    /// Tracking an address twice does nothing.
    pub(crate) fn track(&self, invoice: Invoice) {
        if self.pending.contains_key(&invoice.crypto_address) {
            return;
        }

        let expiry_cancel = self.cancel.child_token();
        self.pending.insert(
            invoice.crypto_address.clone(),
            TrackedInvoice::new(invoice.clone(), expiry_cancel.clone()),
        );
        debug!("Now tracking invoice {} at {}", invoice.id, invoice.crypto_address);

        let tracker = self.clone();
        tokio::spawn(async move {
            let delay = (invoice.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                () = expiry_cancel.cancelled() => {}
                () = time::sleep(delay) => tracker.expire(&invoice).await,
            }
        });
    }

    /// Match an incoming transaction against every tracked invoice. Each
    /// check runs as its own task.
    pub(crate) async fn verify_tx(&self, tx: IncomingTx) {
        trace!(
            "Verifying tx {} ({} embedded confirmations) against {} tracked invoices",
            tx.tx_id(),
            tx.confirmations(),
            self.pending.len()
        );
        let addresses: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            let tracker = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                tracker.check_tx_pays_address(&address, &tx).await;
            });
        }
    }

    /// Handle a new block: fetch its transactions and match them like
    /// mempool ones, and run the confirmation sweep over the tracked set.
    pub(crate) async fn on_new_block(&self, block: Block) {
        let tracker = self.clone();
        tokio::spawn(async move {
            if block.tx_hashes.is_empty() {
                return;
            }
            match tracker.client.transactions_by_hashes(&block.tx_hashes).await {
                Ok(response) => {
                    for tx in response.txs {
                        tracker.verify_tx(IncomingTx::Fetched(tx)).await;
                    }
                }
                Err(e) => error!("Failed to fetch transactions of block {}: {e}", block.height),
            }
        });

        let addresses: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            let tracker = self.clone();
            tokio::spawn(async move {
                tracker.try_confirm(&address).await;
            });
        }
    }

    /// Check whether `tx` pays the tracked invoice at `address` enough to
    /// move it to `PENDING_MEMPOOL`.
    async fn check_tx_pays_address(&self, address: &str, tx: &IncomingTx) {
        let Some(tracked) = self.pending.get(address).map(|e| e.value().clone()) else {
            return;
        };
        let invoice = tracked.load();
        if invoice.status != InvoiceStatus::Pending {
            // Already observed a payment; the confirm sweep takes it from
            // here.
            return;
        }

        let keys = match self.store.find_xmr_keys(invoice.user_id).await {
            Ok(keys) => keys,
            Err(e) => {
                error!("Failed to load XMR keys for user {}: {e}", invoice.user_id);
                return;
            }
        };
        let address_row = match self.store.find_address(address).await {
            Ok(row) => row,
            Err(e) => {
                error!("Failed to load address row for {address}: {e}");
                return;
            }
        };
        let viewpair = match subaddress::view_pair(&keys) {
            Ok(viewpair) => viewpair,
            Err(e) => {
                error!("Stored key material for user {} is invalid: {e}", invoice.user_id);
                return;
            }
        };

        // A checker over exactly this invoice's subaddress index.
        let checker = SubKeyChecker::new(
            &viewpair,
            address_row.major_index..address_row.major_index.saturating_add(1),
            address_row.minor_index..address_row.minor_index.saturating_add(1),
        );
        let outputs = match tx.transaction().check_outputs_with(&checker) {
            Ok(outputs) => outputs,
            Err(e) => {
                debug!("Skipping undecodable tx {}: {e}", tx.tx_id());
                return;
            }
        };

        if tx.double_spend_seen() {
            warn!("Ignoring double-spend tx {} for {address}", tx.tx_id());
            return;
        }
        let amounts: Vec<Option<Amount>> = outputs.iter().map(|o| o.amount()).collect();
        let Some(amount) = first_qualifying(&amounts, invoice.required_amount) else {
            return;
        };

        let tx_id = hex::encode(tx.tx_id().as_bytes());
        let paid = piconeros_to_xmr(amount.as_pico());
        let updated = match self.store.confirm_mempool(invoice.id, paid, &tx_id).await {
            Ok(updated) => updated,
            Err(e) => {
                error!("Failed to record mempool payment for invoice {}: {e}", invoice.id);
                return;
            }
        };
        tracked.store(updated.clone());

        // Another transaction may have won the race; only the recorded one
        // publishes.
        if updated.status == InvoiceStatus::PendingMempool
            && updated.tx_id.as_deref() == Some(tx_id.as_str())
        {
            info!("Invoice {} saw {} XMR in tx {tx_id}", updated.id, paid);
            self.publish(updated);
            // Zero-confirmation invoices can confirm off this observation.
            self.try_confirm(address).await;
        }
    }

    /// Confirm or reject a tracked invoice based on what the daemon reports
    /// for its recorded transaction.
    async fn try_confirm(&self, address: &str) {
        let Some(tracked) = self.pending.get(address).map(|e| e.value().clone()) else {
            return;
        };
        let invoice = tracked.load();
        let Some(tx_id) = invoice.tx_id.clone() else {
            return;
        };

        let hash_bytes = match hex::decode(&tx_id) {
            Ok(bytes) if bytes.len() == 32 => bytes,
            _ => {
                error!("Invoice {} has an unparsable tx id {tx_id}", invoice.id);
                return;
            }
        };
        let hash = monero::Hash::from_slice(&hash_bytes);

        let response = match self.client.transactions_by_hashes(&[hash]).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to fetch tx {tx_id}: {e}");
                return;
            }
        };
        if response.missed.contains(&hash) {
            info!("Tx {tx_id} was rejected by the blockchain");
            self.expire(&invoice).await;
            return;
        }
        let Some(fetched) = response.txs.first() else {
            return;
        };
        if fetched.confirmations < u64::try_from(invoice.confirmations_required).unwrap_or(0) {
            return;
        }

        // Test-and-delete: whoever removes the entry fires the terminal
        // effect.
        let Some((_, tracked)) = self.pending.remove(address) else {
            return;
        };
        tracked.expiry_cancel.cancel();

        let confirmed = match self.store.confirm(invoice.id).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                error!("Failed to confirm invoice {}: {e}", invoice.id);
                return;
            }
        };
        self.release_address(&confirmed.crypto_address).await;
        info!("Invoice {} confirmed after {} confirmations", confirmed.id, fetched.confirmations);
        self.publish(confirmed);
    }

    /// Expire a tracked invoice. Does nothing if a concurrent handler
    /// already fired the invoice's terminal transition.
    async fn expire(&self, invoice: &Invoice) {
        let Some((_, tracked)) = self.pending.remove(&invoice.crypto_address) else {
            return;
        };
        tracked.expiry_cancel.cancel();

        let expired = match self.store.expire(invoice.id).await {
            Ok(expired) => expired,
            Err(e) => {
                error!("Failed to expire invoice {}: {e}", invoice.id);
                return;
            }
        };
        self.release_address(&expired.crypto_address).await;
        info!("Invoice {} expired", expired.id);
        self.publish(expired);
    }

    async fn release_address(&self, address: &str) {
        if let Err(e) = self.store.release_address(address).await {
            error!("Failed to release address {address}: {e}");
        }
    }

    async fn persist_cache(&self) {
        let height = self.poller.last_synced_height();
        if let Err(e) = self.store.update_cache(CoinType::Xmr, height).await {
            error!("Failed to persist XMR sync height {height}: {e}");
        }
    }

    fn publish(&self, invoice: Invoice) {
        if self.events.send(invoice).is_err() {
            warn!("Invoice event bus is closed; dropping status event");
        }
    }
}

/// The first output whose unblinded amount covers the required amount.
/// Undecodable outputs are skipped.
fn first_qualifying(amounts: &[Option<Amount>], required_xmr: f64) -> Option<Amount> {
    amounts
        .iter()
        .flatten()
        .find(|amount| piconeros_to_xmr(amount.as_pico()) >= required_xmr)
        .copied()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use monero::{Amount, Hash};
    use paygate_testing_utils::{empty_transaction, pub_spend_key_hex, PRIVATE_VIEW_KEY};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{first_qualifying, XmrTracker};
    use crate::{
        invoice::{CoinType, Invoice, InvoiceStatus, NewInvoice, XmrKeys, PICONEROS_PER_XMR},
        monerod_client::{Block, FetchedTransaction, MockClient},
        poller::DaemonPoller,
        storage::{stores::InMemory, Storage},
    };

    fn test_rig(
        store: InMemory,
        client: MockClient,
    ) -> (XmrTracker<InMemory, MockClient>, mpsc::UnboundedReceiver<Invoice>) {
        let cancel = CancellationToken::new();
        let poller = Arc::new(DaemonPoller::new(
            client.clone(),
            Duration::from_millis(10),
            Duration::from_secs(1),
            cancel.clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            XmrTracker::new(store, client, poller, events_tx, cancel),
            events_rx,
        )
    }

    async fn pending_invoice(store: &InMemory, expires_in: chrono::Duration) -> Invoice {
        let user_id = store.create_user(None).await.unwrap();
        store
            .update_xmr_keys(
                user_id,
                XmrKeys {
                    priv_view_key: PRIVATE_VIEW_KEY.to_string(),
                    pub_spend_key: pub_spend_key_hex(),
                },
            )
            .await
            .unwrap();
        store
            .create_invoice(
                NewInvoice {
                    user_id,
                    coin: CoinType::Xmr,
                    required_amount: 1.0,
                    confirmations_required: 1,
                    expires_at: Utc::now() + expires_in,
                },
                monero::Network::Mainnet,
            )
            .await
            .unwrap()
    }

    fn tagged_hash(tag: u8) -> Hash {
        Hash::from_slice(&[tag; 32])
    }

    fn fetched_tx(hash: Hash, confirmations: u64) -> FetchedTransaction {
        FetchedTransaction {
            tx: empty_transaction(),
            tx_hash: hash,
            confirmations,
            in_pool: confirmations == 0,
            double_spend_seen: false,
        }
    }

    #[test]
    fn first_qualifying_output_wins() {
        let xmr = |n: u64| Some(Amount::from_pico(n * PICONEROS_PER_XMR));

        assert_eq!(first_qualifying(&[xmr(2)], 1.0), xmr(2));
        // Undecodable and underpaying outputs are skipped.
        assert_eq!(first_qualifying(&[None, xmr(1), xmr(3)], 2.0), xmr(3));
        assert_eq!(first_qualifying(&[None, xmr(1)], 2.0), None);
        assert_eq!(first_qualifying(&[], 0.5), None);
        // An exact payment qualifies.
        assert_eq!(first_qualifying(&[xmr(1)], 1.0), xmr(1));
    }

    #[tokio::test]
    async fn expiry_timer_fires_terminal_transition() {
        let store = InMemory::new();
        let client = MockClient::new();
        let (tracker, mut events) = test_rig(store.clone(), client);

        let invoice = pending_invoice(&store, chrono::Duration::milliseconds(100)).await;
        tracker.track(invoice.clone());
        assert_eq!(tracker.pending_count(), 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event.id, invoice.id);
        assert_eq!(event.status, InvoiceStatus::Expired);
        assert_eq!(tracker.pending_count(), 0);

        let stored = store.find_invoices_by_ids(&[invoice.id]).await.unwrap();
        assert_eq!(stored[0].status, InvoiceStatus::Expired);
        let address = store.find_address(&invoice.crypto_address).await.unwrap();
        assert!(!address.is_occupied);
    }

    #[tokio::test]
    async fn block_sweep_confirms_once_deep_enough() {
        let store = InMemory::new();
        let client = MockClient::new();
        let (tracker, mut events) = test_rig(store.clone(), client.clone());

        let invoice = pending_invoice(&store, chrono::Duration::minutes(10)).await;
        let tx_hash = tagged_hash(1);
        let observed = store
            .confirm_mempool(invoice.id, 1.5, &hex::encode(tx_hash.as_bytes()))
            .await
            .unwrap();
        tracker.track(observed);

        // Not deep enough yet.
        client.insert_transaction(fetched_tx(tx_hash, 0));
        tracker
            .on_new_block(Block {
                height: 10,
                hash: tagged_hash(10),
                tx_hashes: Vec::new(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.pending_count(), 1);
        assert!(events.try_recv().is_err());

        client.insert_transaction(fetched_tx(tx_hash, 1));
        tracker
            .on_new_block(Block {
                height: 11,
                hash: tagged_hash(11),
                tx_hashes: Vec::new(),
            })
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, InvoiceStatus::Confirmed);
        assert!(event.confirmed_at.is_some());
        assert_eq!(tracker.pending_count(), 0);
        let address = store.find_address(&invoice.crypto_address).await.unwrap();
        assert!(!address.is_occupied);
    }

    #[tokio::test]
    async fn missed_tx_expires_invoice() {
        let store = InMemory::new();
        let client = MockClient::new();
        let (tracker, mut events) = test_rig(store.clone(), client.clone());

        let invoice = pending_invoice(&store, chrono::Duration::minutes(10)).await;
        let tx_hash = tagged_hash(2);
        let observed = store
            .confirm_mempool(invoice.id, 1.5, &hex::encode(tx_hash.as_bytes()))
            .await
            .unwrap();
        tracker.track(observed);

        client.set_missed(tx_hash);
        tracker
            .on_new_block(Block {
                height: 12,
                hash: tagged_hash(12),
                tx_hashes: Vec::new(),
            })
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, InvoiceStatus::Expired);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn at_most_one_terminal_transition() {
        let store = InMemory::new();
        let client = MockClient::new();
        let (tracker, mut events) = test_rig(store.clone(), client.clone());

        let invoice = pending_invoice(&store, chrono::Duration::minutes(10)).await;
        let tx_hash = tagged_hash(3);
        let observed = store
            .confirm_mempool(invoice.id, 2.0, &hex::encode(tx_hash.as_bytes()))
            .await
            .unwrap();
        tracker.track(observed.clone());
        client.insert_transaction(fetched_tx(tx_hash, 5));

        // A confirm sweep and an expiry race for the same invoice.
        let block = Block {
            height: 13,
            hash: tagged_hash(13),
            tx_hashes: Vec::new(),
        };
        tokio::join!(tracker.on_new_block(block), tracker.expire(&observed));

        let first = events.recv().await.unwrap();
        assert!(first.status.is_terminal());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn tracking_is_idempotent_per_address() {
        let store = InMemory::new();
        let client = MockClient::new();
        let (tracker, _events) = test_rig(store.clone(), client);

        let invoice = pending_invoice(&store, chrono::Duration::minutes(10)).await;
        tracker.track(invoice.clone());
        tracker.track(invoice);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn start_height_prefers_persisted_cursor() {
        let store = InMemory::new();
        let client = MockClient::new();
        client.push_block(Block {
            height: 500,
            hash: tagged_hash(42),
            tx_hashes: Vec::new(),
        });
        let (tracker, _events) = test_rig(store.clone(), client);

        // No cache row: start at the daemon tip.
        assert_eq!(tracker.resolve_start_height().await.unwrap(), 500);

        store.update_cache(CoinType::Xmr, 420).await.unwrap();
        assert_eq!(tracker.resolve_start_height().await.unwrap(), 420);
    }
}
