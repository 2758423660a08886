//! Periodic block catch-up and txpool diffing against the monero daemon.
//!
//! The poller runs two independent tickers. The block loop fetches the
//! daemon's best header and walks the local height up to it one block per
//! iteration, publishing each block. The txpool loop fetches the pool and
//! publishes each transaction the previous snapshot did not contain. Either
//! loop abandons its tick on a daemon error and retries on the next one.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{error, info, trace};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::{
    monerod_client::{Block, Client as MonerodClient, PoolTransaction},
    pubsub::{Subscriber, SubscriberRegistry},
};

/// Default period of the block loop. The txpool loop runs twice as often.
pub const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) struct DaemonPoller<M: MonerodClient> {
    client: M,
    block_subs: Arc<SubscriberRegistry<Block>>,
    txpool_subs: Arc<SubscriberRegistry<PoolTransaction>>,
    local_height: Arc<AtomicU64>,
    started: AtomicBool,
    cancel: CancellationToken,
    block_interval: Duration,
}

impl<M: MonerodClient> DaemonPoller<M> {
    pub(crate) fn new(
        client: M,
        block_interval: Duration,
        send_timeout: Duration,
        cancel: CancellationToken,
    ) -> DaemonPoller<M> {
        DaemonPoller {
            client,
            block_subs: Arc::new(SubscriberRegistry::new(send_timeout)),
            txpool_subs: Arc::new(SubscriberRegistry::new(send_timeout)),
            local_height: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
            cancel,
            block_interval,
        }
    }

    pub(crate) fn subscribe_blocks(&self) -> Subscriber<Block> {
        self.block_subs.subscribe().1
    }

    pub(crate) fn subscribe_txpool(&self) -> Subscriber<PoolTransaction> {
        self.txpool_subs.subscribe().1
    }

    /// The height the block loop will fetch next.
    pub(crate) fn last_synced_height(&self) -> u64 {
        self.local_height.load(Ordering::Relaxed)
    }

    /// Spawn the block and txpool loops, starting the block catch-up at
    /// `start_height`. Calling `start` on a running poller does nothing.
    pub(crate) fn start(&self, start_height: u64) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local_height.store(start_height, Ordering::Relaxed);
        info!("Starting daemon poller at height {start_height}");

        let block_loop = BlockLoop {
            client: self.client.clone(),
            subs: self.block_subs.clone(),
            local_height: self.local_height.clone(),
        };
        let interval = self.block_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => block_loop.sync(&cancel).await,
                }
            }
        });

        let client = self.client.clone();
        let subs = self.txpool_subs.clone();
        let interval = self.block_interval / 2;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut snapshot = HashSet::new();
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => sync_txpool(&client, &subs, &mut snapshot).await,
                }
            }
        });
    }

    /// Signal both loops to stop. A stopped poller stays stopped.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

struct BlockLoop<M: MonerodClient> {
    client: M,
    subs: Arc<SubscriberRegistry<Block>>,
    local_height: Arc<AtomicU64>,
}

impl<M: MonerodClient> BlockLoop<M> {
    async fn sync(&self, cancel: &CancellationToken) {
        let remote_height = match self.client.last_block_header().await {
            Ok(header) => header.height,
            Err(e) => {
                error!("Failed to fetch last block header: {e}");
                return;
            }
        };

        while self.local_height.load(Ordering::Relaxed) <= remote_height {
            if cancel.is_cancelled() {
                return;
            }
            let height = self.local_height.load(Ordering::Relaxed);
            let block = match self.client.block(height).await {
                Ok(block) => block,
                Err(e) => {
                    error!("Failed to fetch block {height}: {e}");
                    return;
                }
            };
            info!("Synced block height: {height}");
            self.subs.publish(&block);
            self.local_height.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn sync_txpool<M: MonerodClient>(
    client: &M,
    subs: &SubscriberRegistry<PoolTransaction>,
    snapshot: &mut HashSet<monero::Hash>,
) {
    let fetched = match client.txpool().await {
        Ok(txs) => txs,
        Err(e) => {
            error!("Failed to fetch txpool: {e}");
            return;
        }
    };
    trace!("Fetched {} txpool transactions", fetched.len());

    let mut new_snapshot = HashSet::with_capacity(fetched.len());
    for tx in fetched {
        new_snapshot.insert(tx.id_hash);
        if snapshot.contains(&tx.id_hash) {
            continue;
        }
        subs.publish(&tx);
    }
    *snapshot = new_snapshot;
}
