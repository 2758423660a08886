//! The payment processor: public facade over the poller, tracker, and
//! status fan-out.

use std::{ops::Deref, sync::Arc, time::Duration};

use chrono::Utc;
use hyper::Uri;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    invoice::{CoinType, Invoice, NewInvoice, XmrKeys},
    monerod_client::{Client as MonerodClient, MockClient, RpcClient},
    poller::{DaemonPoller, DEFAULT_BLOCK_INTERVAL},
    pubsub::{Subscriber, SubscriberRegistry},
    storage::Storage,
    tracker::XmrTracker,
    ProcessorError,
};

/// Timeout for RPC connection formation.
const DEFAULT_RPC_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for total RPC call completion.
const DEFAULT_RPC_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A request to create an invoice, as received from a client.
#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    /// Owning user.
    pub user_id: Uuid,
    /// Coin the invoice is denominated in.
    pub coin: CoinType,
    /// Amount due, in whole coins.
    pub amount: f64,
    /// Requested lifetime. Clamped up to the block poll interval so every
    /// invoice survives at least one sync tick.
    pub timeout: Duration,
    /// Confirmation depth required before the invoice is confirmed.
    pub confirmations: u32,
}

/// The `PaymentProcessor` assigns receiving addresses, watches the daemon
/// for matching payments, and multiplexes invoice status changes to any
/// number of subscribers.
pub struct PaymentProcessor<S: Storage, M: MonerodClient = RpcClient>(
    pub(crate) Arc<PaymentProcessorInner<S, M>>,
);

#[doc(hidden)]
pub struct PaymentProcessorInner<S: Storage, M: MonerodClient> {
    store: S,
    xmr: XmrTracker<S, M>,
    network: monero::Network,
    subscribers: Arc<SubscriberRegistry<Invoice>>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Invoice>>>,
    cancel: CancellationToken,
    min_invoice_timeout: Duration,
}

impl<S: Storage, M: MonerodClient> Clone for PaymentProcessor<S, M> {
    fn clone(&self) -> Self {
        PaymentProcessor(self.0.clone())
    }
}

impl<S: Storage, M: MonerodClient> Deref for PaymentProcessor<S, M> {
    type Target = PaymentProcessorInner<S, M>;

    fn deref(&self) -> &PaymentProcessorInner<S, M> {
        &self.0
    }
}

impl<S: Storage, M: MonerodClient> PaymentProcessor<S, M> {
    /// Returns a builder used to create a new payment processor.
    #[must_use]
    pub fn builder(store: S) -> PaymentProcessorBuilder<S> {
        PaymentProcessorBuilder::new(store)
    }

    /// Run the processor: start the event bus, reload persisted pending
    /// invoices (shifting their expiry into the restart grace window), and
    /// begin polling the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::AlreadyRunning`] if the processor was
    /// already started, and storage/RPC errors from the startup reload.
    pub async fn run(&self) -> Result<(), ProcessorError> {
        let Some(mut events_rx) = self.events_rx.lock().await.take() else {
            return Err(ProcessorError::AlreadyRunning);
        };

        // Event bus: single ingress from the tracker, fan-out to all
        // subscribers.
        let subscribers = self.subscribers.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events_rx.recv() => match event {
                        Some(invoice) => {
                            info!("Invoice {} changed status to {}", invoice.id, invoice.status);
                            subscribers.publish(&invoice);
                        }
                        None => return,
                    },
                }
            }
        });

        // Expiry timers did not run while the process was down; every
        // still-pending invoice gets one bounded retry window.
        let reloaded = self.store.shift_expiry_for_non_confirmed().await?;
        if !reloaded.is_empty() {
            info!("Reloaded {} pending invoices from storage", reloaded.len());
        }
        for invoice in reloaded {
            match invoice.coin {
                CoinType::Xmr => self.xmr.track(invoice),
                coin => warn!("Cannot reload invoice {}: {coin} is unimplemented", invoice.id),
            }
        }

        let start_height = self.xmr.resolve_start_height().await?;
        self.xmr.start(start_height);
        debug!("Payment processor started");
        Ok(())
    }

    /// Stop all polling, tracking, and fan-out. Subscribers observe their
    /// streams closing.
    pub fn stop(&self) {
        info!("Stopping payment processor");
        self.cancel.cancel();
    }

    /// Create a user and its crypto-data row, using the supplied id
    /// verbatim if one is given.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the user could not be created (including
    /// an id collision).
    pub async fn register_user(&self, user_id: Option<Uuid>) -> Result<Uuid, ProcessorError> {
        Ok(self.store.create_user(user_id).await?)
    }

    /// Whether a user exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup failed.
    pub async fn user_exists(&self, user_id: Uuid) -> Result<bool, ProcessorError> {
        Ok(self.store.user_exists(user_id).await?)
    }

    /// Replace a user's XMR key material, dropping all previously issued
    /// XMR addresses.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the user does not exist or the keys are
    /// already bound to another user.
    pub async fn update_crypto_keys(
        &self,
        user_id: Uuid,
        keys: XmrKeys,
    ) -> Result<(), ProcessorError> {
        Ok(self.store.update_xmr_keys(user_id, keys).await?)
    }

    /// Fetch a user's XMR key material.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the user has no keys registered.
    pub async fn get_crypto_keys(&self, user_id: Uuid) -> Result<XmrKeys, ProcessorError> {
        Ok(self.store.find_xmr_keys(user_id).await?)
    }

    /// Create an invoice and start tracking it.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Unimplemented`] for coins other than XMR,
    /// and storage errors from address allocation or persistence.
    pub async fn new_invoice(&self, request: InvoiceRequest) -> Result<Invoice, ProcessorError> {
        match request.coin {
            CoinType::Xmr => {}
            coin => return Err(ProcessorError::Unimplemented(coin)),
        }

        let timeout = request.timeout.max(self.min_invoice_timeout);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let invoice = self
            .store
            .create_invoice(
                NewInvoice {
                    user_id: request.user_id,
                    coin: request.coin,
                    required_amount: request.amount,
                    confirmations_required: i16::try_from(request.confirmations)
                        .unwrap_or(i16::MAX),
                    expires_at,
                },
                self.network,
            )
            .await?;

        self.xmr.track(invoice.clone());
        debug!("Created invoice {} at {}", invoice.id, invoice.crypto_address);
        Ok(invoice)
    }

    /// Fetch invoices by payment id. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup failed.
    pub async fn get_invoices(&self, ids: &[Uuid]) -> Result<Vec<Invoice>, ProcessorError> {
        Ok(self.store.find_invoices_by_ids(ids).await?)
    }

    /// Returns a subscriber receiving every invoice status change published
    /// after this call.
    #[must_use]
    pub fn subscribe(&self) -> Subscriber<Invoice> {
        self.subscribers.subscribe().1
    }

    /// Number of invoices currently tracked in memory.
    #[must_use]
    pub fn tracked_invoices(&self) -> usize {
        self.xmr.pending_count()
    }

    /// A token cancelled when the processor stops.
    #[must_use]
    pub fn cancelled_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A builder for the payment processor. Used to configure the monero
/// daemon, poll intervals, and fan-out behavior.
pub struct PaymentProcessorBuilder<S> {
    daemon_url: String,
    daemon_username: Option<String>,
    daemon_password: Option<String>,
    rpc_timeout: Duration,
    rpc_connection_timeout: Duration,
    block_interval: Duration,
    send_timeout: Option<Duration>,
    store: S,
    seed: Option<u64>,
}

impl<S: Storage> PaymentProcessorBuilder<S> {
    /// Create a new payment processor builder.
    #[must_use]
    pub fn new(store: S) -> PaymentProcessorBuilder<S> {
        PaymentProcessorBuilder {
            daemon_url: "http://node.moneroworld.com:18089".to_string(),
            daemon_username: None,
            daemon_password: None,
            rpc_timeout: DEFAULT_RPC_TOTAL_TIMEOUT,
            rpc_connection_timeout: DEFAULT_RPC_CONNECTION_TIMEOUT,
            block_interval: DEFAULT_BLOCK_INTERVAL,
            send_timeout: None,
            store,
            seed: None,
        }
    }

    /// Set the url and port of the monero daemon to poll.
    #[must_use]
    pub fn daemon_url(mut self, url: String) -> PaymentProcessorBuilder<S> {
        self.daemon_url = url;
        self
    }

    /// If the daemon requires a login, configure it here.
    #[must_use]
    pub fn daemon_login(
        mut self,
        username: String,
        password: String,
    ) -> PaymentProcessorBuilder<S> {
        self.daemon_username = Some(username);
        self.daemon_password = Some(password);
        self
    }

    /// Time before a daemon RPC call times out. Defaults to 10 seconds.
    #[must_use]
    pub fn rpc_timeout(mut self, timeout: Duration) -> PaymentProcessorBuilder<S> {
        self.rpc_timeout = timeout;
        self
    }

    /// Time before a daemon connection attempt times out. Defaults to 5
    /// seconds.
    #[must_use]
    pub fn rpc_connection_timeout(mut self, timeout: Duration) -> PaymentProcessorBuilder<S> {
        self.rpc_connection_timeout = timeout;
        self
    }

    /// Period of the block poll loop; the txpool loop runs at half this
    /// period, and the minimum invoice lifetime equals it. Defaults to 60
    /// seconds.
    #[must_use]
    pub fn block_interval(mut self, interval: Duration) -> PaymentProcessorBuilder<S> {
        self.block_interval = interval;
        self
    }

    /// Deadline for delivering one event to one subscriber before that
    /// subscriber is evicted. Defaults to the block interval.
    #[must_use]
    pub fn send_timeout(mut self, timeout: Duration) -> PaymentProcessorBuilder<S> {
        self.send_timeout = Some(timeout);
        self
    }

    /// Seed for random number generation in digest authentication. Use only
    /// for reproducible testing.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> PaymentProcessorBuilder<S> {
        warn!("Seed set to {seed}. Operations intended to be random will be predictable.");
        self.seed = Some(seed);
        self
    }

    /// Build the payment processor against a real daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon URL cannot be parsed or the daemon's
    /// network information cannot be fetched.
    pub async fn build(self) -> Result<PaymentProcessor<S, RpcClient>, ProcessorError> {
        let url = self
            .daemon_url
            .parse::<Uri>()
            .map_err(|e| ProcessorError::Parse {
                datatype: "Uri",
                input: self.daemon_url.clone(),
                error: e.to_string(),
            })?;
        let client = RpcClient::new(
            url,
            self.rpc_timeout,
            self.rpc_connection_timeout,
            self.daemon_username.clone(),
            self.daemon_password.clone(),
            self.seed,
        );
        self.build_inner(client).await
    }

    /// Build a payment processor with a mocked daemon client for testing
    /// purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if the mock daemon's network information cannot be
    /// fetched.
    pub async fn build_with_mock_daemon(
        self,
        client: MockClient,
    ) -> Result<PaymentProcessor<S, MockClient>, ProcessorError> {
        self.build_inner(client).await
    }

    async fn build_inner<M: MonerodClient>(
        self,
        client: M,
    ) -> Result<PaymentProcessor<S, M>, ProcessorError> {
        // The daemon's network decides which address network subaddresses
        // are derived on.
        let network = client.info().await?.network();
        debug!("Daemon at {} follows {network:?}", client.url());

        let send_timeout = self.send_timeout.unwrap_or(self.block_interval);
        let cancel = CancellationToken::new();
        let poller = Arc::new(DaemonPoller::new(
            client.clone(),
            self.block_interval,
            send_timeout,
            cancel.child_token(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let xmr = XmrTracker::new(
            self.store.clone(),
            client,
            poller,
            events_tx,
            cancel.child_token(),
        );

        Ok(PaymentProcessor(Arc::new(PaymentProcessorInner {
            store: self.store,
            xmr,
            network,
            subscribers: Arc::new(SubscriberRegistry::new(send_timeout)),
            events_rx: AsyncMutex::new(Some(events_rx)),
            cancel,
            min_invoice_timeout: self.block_interval,
        })))
    }
}
