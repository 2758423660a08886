use std::{pin::Pin, time::Duration};

use log::debug;
use paygate::{
    monerod_client::Client as MonerodClient, storage::Storage, InvoiceRequest, PaymentProcessor,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::{Request, Response, Status};
use uuid::Uuid;

use super::{
    mapping, to_status,
    v1::{
        invoice_service_server::InvoiceService, CreateInvoiceRequest, CreateInvoiceResponse,
        GetInvoicesRequest, GetInvoicesResponse, InvoiceStatusStreamRequest,
        InvoiceStatusStreamResponse,
    },
};

/// `InvoiceService` backed by a [`PaymentProcessor`].
pub struct InvoiceApi<S: Storage, M: MonerodClient> {
    processor: PaymentProcessor<S, M>,
}

impl<S: Storage, M: MonerodClient> InvoiceApi<S, M> {
    /// Create the service.
    pub fn new(processor: PaymentProcessor<S, M>) -> InvoiceApi<S, M> {
        InvoiceApi { processor }
    }
}

#[tonic::async_trait]
impl<S: Storage, M: MonerodClient> InvoiceService for InvoiceApi<S, M> {
    async fn create_invoice(
        &self,
        request: Request<CreateInvoiceRequest>,
    ) -> Result<Response<CreateInvoiceResponse>, Status> {
        let request = request.into_inner();

        if request.amount < 0.0 {
            return Err(Status::invalid_argument("invoice amount can't be below 0"));
        }
        let user_id = Uuid::parse_str(&request.user_id)
            .map_err(|_| Status::invalid_argument("invalid userId (uuid)"))?;
        let coin = mapping::coin_from_raw(request.coin)?;
        let exists = self
            .processor
            .user_exists(user_id)
            .await
            .map_err(to_status)?;
        if !exists {
            return Err(Status::invalid_argument("user does not exist"));
        }

        let invoice = self
            .processor
            .new_invoice(InvoiceRequest {
                user_id,
                coin,
                amount: request.amount,
                timeout: Duration::from_secs(request.timeout),
                confirmations: request.confirmations,
            })
            .await
            .map_err(to_status)?;
        debug!("Created invoice {} for user {user_id}", invoice.id);

        Ok(Response::new(CreateInvoiceResponse {
            payment_id: invoice.id.to_string(),
            address: invoice.crypto_address,
        }))
    }

    async fn get_invoices(
        &self,
        request: Request<GetInvoicesRequest>,
    ) -> Result<Response<GetInvoicesResponse>, Status> {
        let request = request.into_inner();

        let mut ids = Vec::with_capacity(request.payment_ids.len());
        for raw in &request.payment_ids {
            let id = Uuid::parse_str(raw)
                .map_err(|_| Status::invalid_argument("invalid payment id"))?;
            ids.push(id);
        }

        let invoices = self
            .processor
            .get_invoices(&ids)
            .await
            .map_err(to_status)?;

        Ok(Response::new(GetInvoicesResponse {
            invoices: invoices.iter().map(mapping::invoice_to_pb).collect(),
        }))
    }

    type InvoiceStatusStreamStream =
        Pin<Box<dyn Stream<Item = Result<InvoiceStatusStreamResponse, Status>> + Send>>;

    async fn invoice_status_stream(
        &self,
        _request: Request<InvoiceStatusStreamRequest>,
    ) -> Result<Response<Self::InvoiceStatusStreamStream>, Status> {
        let mut subscriber = self.processor.subscribe();
        let cancel = self.processor.cancelled_token();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = tx.send(Err(Status::cancelled("stream has been closed"))).await;
                        return;
                    }
                    event = subscriber.recv() => match event {
                        Some(invoice) => {
                            let message = InvoiceStatusStreamResponse {
                                invoice: Some(mapping::invoice_to_pb(&invoice)),
                            };
                            // A failed send means the client went away;
                            // dropping the subscriber reaps the slot.
                            if tx.send(Ok(message)).await.is_err() {
                                return;
                            }
                        }
                        None => {
                            let _ = tx.send(Err(Status::cancelled("stream has been closed"))).await;
                            return;
                        }
                    },
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
