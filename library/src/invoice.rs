use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use strum::{Display as StrumDisplay, EnumIter, EnumString};
use uuid::Uuid;

/// Piconeros per XMR.
pub const PICONEROS_PER_XMR: u64 = 1_000_000_000_000;

/// Convert an amount in piconeros to whole XMR.
///
/// Note that rounding may occur because the precision of `f64` is
/// insufficient for representing large amounts of XMR out to many decimal
/// places.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn piconeros_to_xmr(piconeros: u64) -> f64 {
    piconeros as f64 / PICONEROS_PER_XMR as f64
}

/// Coins known to the payment processor. Only XMR is currently implemented;
/// the remaining coins are accepted by the RPC surface and schema but return
/// an unimplemented error when used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString, EnumIter)]
pub enum CoinType {
    /// Monero.
    #[strum(serialize = "XMR")]
    Xmr,
    /// Bitcoin.
    #[strum(serialize = "BTC")]
    Btc,
    /// Litecoin.
    #[strum(serialize = "LTC")]
    Ltc,
    /// Ethereum.
    #[strum(serialize = "ETH")]
    Eth,
    /// Toncoin.
    #[strum(serialize = "TON")]
    Ton,
}

/// Lifecycle state of an [`Invoice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString, EnumIter)]
pub enum InvoiceStatus {
    /// Created, no payment observed yet.
    #[strum(serialize = "PENDING")]
    Pending,
    /// A qualifying transaction was observed in the mempool.
    #[strum(serialize = "PENDING_MEMPOOL")]
    PendingMempool,
    /// The observed transaction reached the required confirmation depth.
    #[strum(serialize = "CONFIRMED")]
    Confirmed,
    /// The invoice timed out, or its transaction was rejected.
    #[strum(serialize = "EXPIRED")]
    Expired,
}

impl InvoiceStatus {
    /// Returns `true` for [`Confirmed`](Self::Confirmed) and
    /// [`Expired`](Self::Expired), the states an invoice never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Confirmed | InvoiceStatus::Expired)
    }
}

/// A payment request for a fixed amount to a dedicated subaddress.
///
/// `Invoice`s are created by the
/// [`PaymentProcessor`](crate::PaymentProcessor) and move through
/// [`InvoiceStatus`] as payments are observed on chain. Status changes can be
/// received with a [`Subscriber`](crate::Subscriber).
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    /// Payment id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Coin the invoice is denominated in.
    pub coin: CoinType,
    /// Receiving address, unique to this invoice while it is live.
    pub crypto_address: String,
    /// Amount due, in whole coins.
    pub required_amount: f64,
    /// Amount carried by the observed transaction, once one is seen.
    pub actual_amount: Option<f64>,
    /// Confirmation depth required before the invoice is confirmed.
    pub confirmations_required: i16,
    /// Hash of the observed transaction, once one is seen.
    pub tx_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time after which the invoice expires if still unconfirmed.
    pub expires_at: DateTime<Utc>,
    /// Time the invoice reached [`InvoiceStatus::Confirmed`].
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub status: InvoiceStatus,
}

impl Invoice {
    /// Returns `true` once the invoice has reached a state it never leaves.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invoice {} to {}: {} of {} {} required, status {}",
            self.id,
            self.crypto_address,
            self.actual_amount.unwrap_or(0.0),
            self.required_amount,
            self.coin,
            self.status,
        )
    }
}

/// Parameters for creating a new invoice. Produced by the
/// [`PaymentProcessor`](crate::PaymentProcessor) after validating and
/// clamping the caller's request.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    /// Owning user.
    pub user_id: Uuid,
    /// Coin the invoice is denominated in.
    pub coin: CoinType,
    /// Amount due, in whole coins.
    pub required_amount: f64,
    /// Confirmation depth required before the invoice is confirmed.
    pub confirmations_required: i16,
    /// Time after which the invoice expires if still unconfirmed.
    pub expires_at: DateTime<Utc>,
}

/// A user's monero view/spend key material, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmrKeys {
    /// Private view key.
    pub priv_view_key: String,
    /// Public spend key of the primary address.
    pub pub_spend_key: String,
}

/// A receiving subaddress issued to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAddress {
    /// Base58 address.
    pub address: String,
    /// Coin the address belongs to.
    pub coin: CoinType,
    /// Owning user.
    pub user_id: Uuid,
    /// `true` while the address is attached to a live invoice.
    pub is_occupied: bool,
    /// Subaddress major (account) index used to derive the address.
    pub major_index: u32,
    /// Subaddress minor index used to derive the address.
    pub minor_index: u32,
}

/// Per-coin sync state, persisted so a restart resumes near the tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoCache {
    /// Coin this row belongs to.
    pub coin: CoinType,
    /// Height the poller will fetch next.
    pub last_synced_block_height: Option<u64>,
    /// When the height was last written.
    pub synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::{piconeros_to_xmr, CoinType, InvoiceStatus, PICONEROS_PER_XMR};

    #[test]
    fn coin_type_round_trips() {
        for coin in CoinType::iter() {
            assert_eq!(CoinType::from_str(&coin.to_string()).unwrap(), coin);
        }
        CoinType::from_str("DOGE").unwrap_err();
        CoinType::from_str("xmr").unwrap_err();
    }

    #[test]
    fn invoice_status_round_trips() {
        for status in InvoiceStatus::iter() {
            assert_eq!(
                InvoiceStatus::from_str(&status.to_string()).unwrap(),
                status
            );
        }
        InvoiceStatus::from_str("PAID").unwrap_err();
    }

    #[test]
    fn terminal_statuses() {
        assert!(InvoiceStatus::Confirmed.is_terminal());
        assert!(InvoiceStatus::Expired.is_terminal());
        assert!(!InvoiceStatus::Pending.is_terminal());
        assert!(!InvoiceStatus::PendingMempool.is_terminal());
    }

    #[test]
    fn piconero_conversion() {
        assert!((piconeros_to_xmr(PICONEROS_PER_XMR) - 1.0).abs() < f64::EPSILON);
        assert!((piconeros_to_xmr(PICONEROS_PER_XMR / 2) - 0.5).abs() < f64::EPSILON);
        assert!((piconeros_to_xmr(0)).abs() < f64::EPSILON);
    }
}
