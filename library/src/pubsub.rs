//! Many-producer/many-consumer fan-out with slow-consumer eviction.
//!
//! Each subscriber owns a delivery slot keyed by a fresh identifier. A slot
//! buffers published events in arrival order and a dedicated forwarder task
//! drains it toward the consumer, applying the registry's send timeout to
//! every delivery. A consumer that fails to accept an event within the
//! timeout is unsubscribed; it must resubscribe to keep receiving.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use log::warn;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    time::{error::Elapsed, timeout},
};

/// Identifier of a subscriber's delivery slot.
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct SubscriberId(u128);

impl SubscriberId {
    fn new() -> SubscriberId {
        SubscriberId(rand::random())
    }
}

type Slots<T> = Arc<Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<T>>>>;

pub(crate) struct SubscriberRegistry<T> {
    slots: Slots<T>,
    send_timeout: Duration,
}

impl<T: Clone + Send + 'static> SubscriberRegistry<T> {
    pub(crate) fn new(send_timeout: Duration) -> SubscriberRegistry<T> {
        SubscriberRegistry {
            slots: Arc::new(Mutex::new(HashMap::new())),
            send_timeout,
        }
    }

    /// Registers a new delivery slot, returning its identifier and the
    /// receiving half.
    pub(crate) fn subscribe(&self) -> (SubscriberId, Subscriber<T>) {
        let id = SubscriberId::new();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(1);

        let slots = self.slots.clone();
        let send_timeout = self.send_timeout;
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                match timeout(send_timeout, out_tx.send(event)).await {
                    Ok(Ok(())) => {}
                    Err(_) => {
                        warn!("Subscriber failed to accept an event within {send_timeout:?}; unsubscribing it");
                        slots
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&id);
                        break;
                    }
                    // Receiving half was dropped; reap the slot quietly.
                    Ok(Err(_)) => {
                        slots
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&id);
                        break;
                    }
                }
            }
        });

        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, queue_tx);
        (id, Subscriber(out_rx))
    }

    /// Hands the event to every live slot. Never blocks on a consumer; each
    /// slot's forwarder delivers concurrently and in publish order.
    pub(crate) fn publish(&self, event: &T) {
        let senders: Vec<(SubscriberId, mpsc::UnboundedSender<T>)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        for (id, sender) in senders {
            if sender.send(event.clone()).is_err() {
                // Forwarder already exited; drop the stale slot.
                self.unsubscribe(id);
            }
        }
    }

    /// Removes a slot. Removing an unknown or already-evicted slot is a
    /// no-op.
    pub(crate) fn unsubscribe(&self, id: SubscriberId) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// The receiving half of a subscription. Events arrive in the order they
/// were published.
pub struct Subscriber<T>(mpsc::Receiver<T>);

impl<T> Subscriber<T> {
    /// Waits for the next event.
    ///
    /// Returns `None` once the subscription is closed, either by
    /// unsubscription, slow-consumer eviction, or shutdown of the publisher.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }

    /// Waits for the next event, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if no event arrives in time.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<T>, SubscriberError> {
        Ok(timeout(wait, self.0.recv()).await?)
    }

    /// Returns the next event if one is immediately available.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription is closed or no event is queued.
    pub fn try_recv(&mut self) -> Result<T, SubscriberError> {
        Ok(self.0.try_recv()?)
    }

    /// Polls for the next event. Allows bridging the subscription into a
    /// stream without an intermediate task.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.0.poll_recv(cx)
    }
}

/// An error receiving an event from a [`Subscriber`].
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// Timed out before an event arrived.
    #[error("subscriber recv timeout: {0}")]
    RecvTimeout(#[from] Elapsed),
    /// Subscription is empty or closed.
    #[error("subscriber try recv failed: {0}")]
    TryRecv(#[from] TryRecvError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::SubscriberRegistry;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let registry = SubscriberRegistry::new(Duration::from_millis(100));
        let (_, mut subscriber) = registry.subscribe();

        for i in 0..10_u32 {
            registry.publish(&i);
        }
        for i in 0..10_u32 {
            assert_eq!(subscriber.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn evicts_slow_consumer() {
        let registry = SubscriberRegistry::new(Duration::from_millis(50));
        let (_, _stalled) = registry.subscribe();
        let (_, mut reader) = registry.subscribe();
        assert_eq!(registry.len(), 2);

        // More events than the stalled subscriber's consumer channel holds.
        for i in 0..3_u32 {
            registry.publish(&i);
        }
        for i in 0..3_u32 {
            assert_eq!(reader.recv().await, Some(i));
        }

        sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let registry = SubscriberRegistry::<u32>::new(Duration::from_millis(50));
        let (id, mut subscriber) = registry.subscribe();

        registry.unsubscribe(id);
        registry.unsubscribe(id);
        assert_eq!(registry.len(), 0);

        registry.publish(&7);
        assert_eq!(subscriber.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_subscriber_slot_is_reaped() {
        let registry = SubscriberRegistry::new(Duration::from_millis(20));
        let (_, subscriber) = registry.subscribe();
        drop(subscriber);

        registry.publish(&1_u32);
        sleep(Duration::from_millis(60)).await;
        registry.publish(&2_u32);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.len(), 0);
    }
}
