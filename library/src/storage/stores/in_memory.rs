use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    invoice::{CoinType, CryptoAddress, CryptoCache, Invoice, InvoiceStatus, NewInvoice, XmrKeys},
    storage::{expiry_shift, Storage, StorageError},
    subaddress,
};

/// In-memory store. Carries no persistence across restarts; intended for
/// testing.
#[derive(Debug, Clone, Default)]
pub struct InMemory(Arc<Mutex<Inner>>);

#[derive(Debug, Default)]
struct Inner {
    users: Vec<Uuid>,
    // user id -> key material and derivation cursor.
    xmr_data: HashMap<Uuid, XmrRow>,
    // Issue order doubles as creation order.
    addresses: Vec<CryptoAddress>,
    invoices: Vec<Invoice>,
    cache: HashMap<CoinType, CryptoCache>,
}

#[derive(Debug, Clone)]
struct XmrRow {
    keys: XmrKeys,
    last_major_index: u32,
    last_minor_index: u32,
}

impl InMemory {
    /// Returns an empty store.
    #[must_use]
    pub fn new() -> InMemory {
        InMemory::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn invoice_mut(&mut self, id: Uuid) -> Result<&mut Invoice, StorageError> {
        self.invoices
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StorageError::NotFound)
    }

    fn allocate_address(
        &mut self,
        user_id: Uuid,
        coin: CoinType,
        network: monero::Network,
    ) -> Result<String, StorageError> {
        if let Some(free) = self
            .addresses
            .iter_mut()
            .find(|a| a.user_id == user_id && a.coin == coin && !a.is_occupied)
        {
            free.is_occupied = true;
            return Ok(free.address.clone());
        }

        let row = self
            .xmr_data
            .get_mut(&user_id)
            .ok_or(StorageError::NotFound)?;
        let (major, minor) = subaddress::next_index(row.last_major_index, row.last_minor_index);
        let address = subaddress::derive(&row.keys, major, minor, network)?;
        row.last_major_index = major;
        row.last_minor_index = minor;
        self.addresses.push(CryptoAddress {
            address: address.clone(),
            coin,
            user_id,
            is_occupied: true,
            major_index: major,
            minor_index: minor,
        });
        Ok(address)
    }
}

impl Storage for InMemory {
    async fn create_user(&self, user_id: Option<Uuid>) -> Result<Uuid, StorageError> {
        let id = user_id.unwrap_or_else(Uuid::new_v4);
        let mut inner = self.lock();
        if inner.users.contains(&id) {
            return Err(StorageError::AlreadyExists("user".to_string()));
        }
        inner.users.push(id);
        Ok(id)
    }

    async fn user_exists(&self, user_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.lock().users.contains(&user_id))
    }

    async fn update_xmr_keys(&self, user_id: Uuid, keys: XmrKeys) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if !inner.users.contains(&user_id) {
            return Err(StorageError::NotFound);
        }
        let duplicate = inner.xmr_data.iter().any(|(other, row)| {
            *other != user_id
                && (row.keys.priv_view_key == keys.priv_view_key
                    || row.keys.pub_spend_key == keys.pub_spend_key)
        });
        if duplicate {
            return Err(StorageError::AlreadyExists("XMR keys".to_string()));
        }
        inner
            .addresses
            .retain(|a| !(a.user_id == user_id && a.coin == CoinType::Xmr));
        inner.xmr_data.insert(
            user_id,
            XmrRow {
                keys,
                last_major_index: 0,
                last_minor_index: 0,
            },
        );
        Ok(())
    }

    async fn find_xmr_keys(&self, user_id: Uuid) -> Result<XmrKeys, StorageError> {
        self.lock()
            .xmr_data
            .get(&user_id)
            .map(|row| row.keys.clone())
            .ok_or(StorageError::NotFound)
    }

    async fn create_invoice(
        &self,
        invoice: NewInvoice,
        network: monero::Network,
    ) -> Result<Invoice, StorageError> {
        let mut inner = self.lock();
        if !inner.users.contains(&invoice.user_id) {
            return Err(StorageError::NotFound);
        }
        let address = inner.allocate_address(invoice.user_id, invoice.coin, network)?;
        let created = Invoice {
            id: Uuid::new_v4(),
            user_id: invoice.user_id,
            coin: invoice.coin,
            crypto_address: address,
            required_amount: invoice.required_amount,
            actual_amount: None,
            confirmations_required: invoice.confirmations_required,
            tx_id: None,
            created_at: Utc::now(),
            expires_at: invoice.expires_at,
            confirmed_at: None,
            status: InvoiceStatus::Pending,
        };
        inner.invoices.push(created.clone());
        Ok(created)
    }

    async fn find_invoices_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Invoice>, StorageError> {
        Ok(self
            .lock()
            .invoices
            .iter()
            .filter(|i| ids.contains(&i.id))
            .cloned()
            .collect())
    }

    async fn find_address(&self, address: &str) -> Result<CryptoAddress, StorageError> {
        self.lock()
            .addresses
            .iter()
            .find(|a| a.address == address)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn confirm_mempool(
        &self,
        id: Uuid,
        actual_amount: f64,
        tx_id: &str,
    ) -> Result<Invoice, StorageError> {
        let mut inner = self.lock();
        let invoice = inner.invoice_mut(id)?;
        if invoice.status == InvoiceStatus::Pending {
            invoice.status = InvoiceStatus::PendingMempool;
            invoice.actual_amount = Some(actual_amount);
            invoice.tx_id = Some(tx_id.to_string());
        }
        Ok(invoice.clone())
    }

    async fn confirm(&self, id: Uuid) -> Result<Invoice, StorageError> {
        let mut inner = self.lock();
        let invoice = inner.invoice_mut(id)?;
        invoice.status = InvoiceStatus::Confirmed;
        invoice.confirmed_at = Some(Utc::now());
        Ok(invoice.clone())
    }

    async fn expire(&self, id: Uuid) -> Result<Invoice, StorageError> {
        let mut inner = self.lock();
        let invoice = inner.invoice_mut(id)?;
        invoice.status = InvoiceStatus::Expired;
        Ok(invoice.clone())
    }

    async fn release_address(&self, address: &str) -> Result<(), StorageError> {
        if let Some(row) = self
            .lock()
            .addresses
            .iter_mut()
            .find(|a| a.address == address)
        {
            row.is_occupied = false;
        }
        Ok(())
    }

    async fn shift_expiry_for_non_confirmed(&self) -> Result<Vec<Invoice>, StorageError> {
        let shifted_to = Utc::now() + expiry_shift();
        let mut shifted = Vec::new();
        for invoice in &mut self.lock().invoices {
            if invoice.status.is_terminal() {
                continue;
            }
            invoice.expires_at = shifted_to;
            shifted.push(invoice.clone());
        }
        Ok(shifted)
    }

    async fn update_cache(&self, coin: CoinType, height: u64) -> Result<(), StorageError> {
        self.lock().cache.insert(
            coin,
            CryptoCache {
                coin,
                last_synced_block_height: Some(height),
                synced_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn find_cache(&self, coin: CoinType) -> Result<Option<CryptoCache>, StorageError> {
        Ok(self.lock().cache.get(&coin).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, Utc};
    use monero::Network;
    use paygate_testing_utils::{pub_spend_key_hex, PRIVATE_VIEW_KEY};
    use uuid::Uuid;

    use super::InMemory;
    use crate::{
        invoice::{CoinType, InvoiceStatus, NewInvoice, XmrKeys},
        storage::{Storage, StorageError},
    };

    fn test_keys() -> XmrKeys {
        XmrKeys {
            priv_view_key: PRIVATE_VIEW_KEY.to_string(),
            pub_spend_key: pub_spend_key_hex(),
        }
    }

    async fn user_with_keys(store: &InMemory) -> Uuid {
        let user_id = store.create_user(None).await.unwrap();
        store.update_xmr_keys(user_id, test_keys()).await.unwrap();
        user_id
    }

    fn new_invoice(user_id: Uuid) -> NewInvoice {
        NewInvoice {
            user_id,
            coin: CoinType::Xmr,
            required_amount: 1.0,
            confirmations_required: 1,
            expires_at: Utc::now() + Duration::minutes(10),
        }
    }

    #[tokio::test]
    async fn create_user_with_explicit_id() {
        let store = InMemory::new();
        let id = Uuid::new_v4();
        assert_eq!(store.create_user(Some(id)).await.unwrap(), id);
        assert!(store.user_exists(id).await.unwrap());
        assert!(matches!(
            store.create_user(Some(id)).await.unwrap_err(),
            StorageError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn allocation_advances_cursor_and_reuses_released() {
        let store = InMemory::new();
        let user_id = user_with_keys(&store).await;

        let first = store
            .create_invoice(new_invoice(user_id), Network::Mainnet)
            .await
            .unwrap();
        let second = store
            .create_invoice(new_invoice(user_id), Network::Mainnet)
            .await
            .unwrap();
        assert_ne!(first.crypto_address, second.crypto_address);

        let a1 = store.find_address(&first.crypto_address).await.unwrap();
        let a2 = store.find_address(&second.crypto_address).await.unwrap();
        assert_eq!((a1.major_index, a1.minor_index), (0, 1));
        assert_eq!((a2.major_index, a2.minor_index), (0, 2));
        assert!(a1.is_occupied && a2.is_occupied);

        // A released address is claimed before a new one is derived.
        store.release_address(&first.crypto_address).await.unwrap();
        let third = store
            .create_invoice(new_invoice(user_id), Network::Mainnet)
            .await
            .unwrap();
        assert_eq!(third.crypto_address, first.crypto_address);
        assert!(
            store
                .find_address(&first.crypto_address)
                .await
                .unwrap()
                .is_occupied
        );
    }

    #[tokio::test]
    async fn keys_are_unique_across_users() {
        let store = InMemory::new();
        let first = store.create_user(None).await.unwrap();
        let second = store.create_user(None).await.unwrap();
        store.update_xmr_keys(first, test_keys()).await.unwrap();
        assert!(matches!(
            store.update_xmr_keys(second, test_keys()).await.unwrap_err(),
            StorageError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn updating_keys_drops_issued_addresses() {
        let store = InMemory::new();
        let user_id = user_with_keys(&store).await;
        let invoice = store
            .create_invoice(new_invoice(user_id), Network::Mainnet)
            .await
            .unwrap();

        store.update_xmr_keys(user_id, test_keys()).await.unwrap();
        assert!(matches!(
            store.find_address(&invoice.crypto_address).await.unwrap_err(),
            StorageError::NotFound
        ));
    }

    #[tokio::test]
    async fn confirm_mempool_is_idempotent() {
        let store = InMemory::new();
        let user_id = user_with_keys(&store).await;
        let invoice = store
            .create_invoice(new_invoice(user_id), Network::Mainnet)
            .await
            .unwrap();

        let updated = store
            .confirm_mempool(invoice.id, 1.5, "txhash")
            .await
            .unwrap();
        assert_eq!(updated.status, InvoiceStatus::PendingMempool);
        assert_eq!(updated.actual_amount, Some(1.5));

        // A repeat observation with different values changes nothing.
        let repeated = store
            .confirm_mempool(invoice.id, 9.0, "other")
            .await
            .unwrap();
        assert_eq!(repeated, updated);

        let confirmed = store.confirm(invoice.id).await.unwrap();
        assert_eq!(confirmed.status, InvoiceStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn shift_expiry_lands_in_grace_window() {
        let store = InMemory::new();
        let user_id = user_with_keys(&store).await;
        let pending = store
            .create_invoice(new_invoice(user_id), Network::Mainnet)
            .await
            .unwrap();
        let confirmed = store
            .create_invoice(new_invoice(user_id), Network::Mainnet)
            .await
            .unwrap();
        store.confirm(confirmed.id).await.unwrap();

        let shifted = store.shift_expiry_for_non_confirmed().await.unwrap();
        assert_eq!(shifted.len(), 1);
        assert_eq!(shifted[0].id, pending.id);

        let until_expiry = shifted[0].expires_at - Utc::now();
        assert!(until_expiry >= chrono::Duration::minutes(4));
        assert!(until_expiry <= chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn cache_round_trips() {
        let store = InMemory::new();
        assert!(store.find_cache(CoinType::Xmr).await.unwrap().is_none());

        store.update_cache(CoinType::Xmr, 3_000_000).await.unwrap();
        let cache = store.find_cache(CoinType::Xmr).await.unwrap().unwrap();
        assert_eq!(cache.last_synced_block_height, Some(3_000_000));
        assert!(cache.synced_at.is_some());
    }
}
