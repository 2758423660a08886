//! Conversions between domain types and their protobuf representations.

use chrono::{DateTime, Utc};
use paygate::{CoinType, Invoice, InvoiceStatus};
use prost_types::Timestamp;
use tonic::Status;

use super::v1;

pub(crate) fn coin_to_pb(coin: CoinType) -> v1::CoinType {
    match coin {
        CoinType::Xmr => v1::CoinType::Xmr,
        CoinType::Btc => v1::CoinType::Btc,
        CoinType::Ltc => v1::CoinType::Ltc,
        CoinType::Eth => v1::CoinType::Eth,
        CoinType::Ton => v1::CoinType::Ton,
    }
}

pub(crate) fn coin_from_pb(coin: v1::CoinType) -> CoinType {
    match coin {
        v1::CoinType::Xmr => CoinType::Xmr,
        v1::CoinType::Btc => CoinType::Btc,
        v1::CoinType::Ltc => CoinType::Ltc,
        v1::CoinType::Eth => CoinType::Eth,
        v1::CoinType::Ton => CoinType::Ton,
    }
}

/// Interpret the raw enum value carried by a request.
pub(crate) fn coin_from_raw(raw: i32) -> Result<CoinType, Status> {
    v1::CoinType::try_from(raw)
        .map(coin_from_pb)
        .map_err(|_| Status::invalid_argument(format!("unknown coin type {raw}")))
}

pub(crate) fn status_to_pb(status: InvoiceStatus) -> v1::InvoiceStatusType {
    match status {
        InvoiceStatus::Pending => v1::InvoiceStatusType::Pending,
        InvoiceStatus::PendingMempool => v1::InvoiceStatusType::PendingMempool,
        InvoiceStatus::Confirmed => v1::InvoiceStatusType::Confirmed,
        InvoiceStatus::Expired => v1::InvoiceStatusType::Expired,
    }
}

fn timestamp(datetime: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: datetime.timestamp(),
        #[allow(clippy::cast_possible_wrap)]
        nanos: datetime.timestamp_subsec_nanos() as i32,
    }
}

pub(crate) fn invoice_to_pb(invoice: &Invoice) -> v1::Invoice {
    v1::Invoice {
        id: invoice.id.to_string(),
        crypto_address: invoice.crypto_address.clone(),
        coin: coin_to_pb(invoice.coin).into(),
        required_amount: invoice.required_amount,
        actual_amount: invoice.actual_amount.unwrap_or(0.0),
        confirmations_required: u32::try_from(invoice.confirmations_required).unwrap_or(0),
        created_at: Some(timestamp(invoice.created_at)),
        confirmed_at: invoice.confirmed_at.map(timestamp),
        status: status_to_pb(invoice.status).into(),
        expires_at: Some(timestamp(invoice.expires_at)),
        tx_id: invoice.tx_id.clone().unwrap_or_default(),
        user_id: invoice.user_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use paygate::{CoinType, InvoiceStatus};
    use uuid::Uuid;

    use super::{coin_from_pb, coin_from_raw, coin_to_pb, status_to_pb, v1};

    #[test]
    fn coin_round_trips_through_pb() {
        for coin in [
            CoinType::Xmr,
            CoinType::Btc,
            CoinType::Ltc,
            CoinType::Eth,
            CoinType::Ton,
        ] {
            assert_eq!(coin_from_pb(coin_to_pb(coin)), coin);
            assert_eq!(coin_from_raw(coin_to_pb(coin) as i32).unwrap(), coin);
        }
    }

    #[test]
    fn unknown_coin_value_is_an_error() {
        let status = coin_from_raw(999).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn status_maps_onto_distinct_pb_values() {
        let mapped: Vec<v1::InvoiceStatusType> = [
            InvoiceStatus::Pending,
            InvoiceStatus::PendingMempool,
            InvoiceStatus::Confirmed,
            InvoiceStatus::Expired,
        ]
        .into_iter()
        .map(status_to_pb)
        .collect();
        assert_eq!(
            mapped,
            vec![
                v1::InvoiceStatusType::Pending,
                v1::InvoiceStatusType::PendingMempool,
                v1::InvoiceStatusType::Confirmed,
                v1::InvoiceStatusType::Expired,
            ]
        );
    }

    #[test]
    fn uuid_string_round_trips() {
        let id = Uuid::new_v4();
        assert_eq!(Uuid::parse_str(&id.to_string()).unwrap(), id);
        // The canonical hyphenated form is produced.
        assert_eq!(id.to_string().len(), 36);
    }
}
