//! Persistent state behind the payment processor.
//!
//! Consumers pick one of the existing [`stores`], or implement the
//! [`Storage`] trait themselves for a custom storage solution. Every
//! mutating method is one unit of work: implementations run it inside a
//! single database transaction, committed on success and rolled back on any
//! error.

pub mod stores;

use std::future::Future;

use thiserror::Error;
use uuid::Uuid;

use crate::{
    invoice::{CoinType, CryptoAddress, CryptoCache, Invoice, NewInvoice, XmrKeys},
    subaddress::KeyError,
};

/// Storage operations the payment processor relies on.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Create a user and its crypto-data row. A caller-supplied id is used
    /// verbatim; otherwise a fresh one is generated.
    fn create_user(
        &self,
        user_id: Option<Uuid>,
    ) -> impl Future<Output = Result<Uuid, StorageError>> + Send;

    /// Whether a user exists.
    fn user_exists(&self, user_id: Uuid)
        -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Replace a user's XMR key material. All previously issued XMR
    /// addresses of the user are deleted in the same transaction, since
    /// they are no longer derivable from the new keys.
    fn update_xmr_keys(
        &self,
        user_id: Uuid,
        keys: XmrKeys,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Fetch a user's XMR key material.
    fn find_xmr_keys(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<XmrKeys, StorageError>> + Send;

    /// Create an invoice, allocating its receiving address within the same
    /// transaction: the oldest non-occupied address of the user is claimed,
    /// or a new subaddress is derived by advancing the user's
    /// `(major, minor)` cursor under a row lock.
    fn create_invoice(
        &self,
        invoice: NewInvoice,
        network: monero::Network,
    ) -> impl Future<Output = Result<Invoice, StorageError>> + Send;

    /// Fetch invoices by payment id. Unknown ids are skipped.
    fn find_invoices_by_ids(
        &self,
        ids: &[Uuid],
    ) -> impl Future<Output = Result<Vec<Invoice>, StorageError>> + Send;

    /// Fetch an issued address row.
    fn find_address(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<CryptoAddress, StorageError>> + Send;

    /// Record a qualifying mempool observation: status moves to
    /// `PENDING_MEMPOOL` and the observed amount and transaction are
    /// stored. Firing again for an invoice already past `PENDING` leaves
    /// the row unchanged and returns it.
    fn confirm_mempool(
        &self,
        id: Uuid,
        actual_amount: f64,
        tx_id: &str,
    ) -> impl Future<Output = Result<Invoice, StorageError>> + Send;

    /// Move an invoice to `CONFIRMED`, stamping `confirmed_at`.
    fn confirm(&self, id: Uuid) -> impl Future<Output = Result<Invoice, StorageError>> + Send;

    /// Move an invoice to `EXPIRED`.
    fn expire(&self, id: Uuid) -> impl Future<Output = Result<Invoice, StorageError>> + Send;

    /// Mark an address as no longer attached to a live invoice.
    fn release_address(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Push `expires_at` of every non-terminal invoice a short, bounded
    /// window into the future and return the affected invoices. Run once at
    /// startup so invoices whose timers could not fire during downtime get
    /// one fair retry window instead of expiring immediately.
    fn shift_expiry_for_non_confirmed(
        &self,
    ) -> impl Future<Output = Result<Vec<Invoice>, StorageError>> + Send;

    /// Upsert the per-coin sync cursor.
    fn update_cache(
        &self,
        coin: CoinType,
        height: u64,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Fetch the per-coin sync cursor, if one was ever written.
    fn find_cache(
        &self,
        coin: CoinType,
    ) -> impl Future<Output = Result<Option<CryptoCache>, StorageError>> + Send;
}

/// Window applied by
/// [`shift_expiry_for_non_confirmed`](Storage::shift_expiry_for_non_confirmed).
pub(crate) fn expiry_shift() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

/// An error occurring while storing or retrieving values from a database.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,
    /// A uniqueness guarantee would be violated.
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    /// Stored key material could not be used.
    #[error("invalid key material: {0}")]
    Key(#[from] KeyError),
    /// An error caused by the database, or some interaction with it.
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            other => StorageError::Internal(Box::new(other)),
        }
    }
}
