//! The gRPC surface: `UserService` and `InvoiceService`.

mod invoice;
mod mapping;
mod user;

use std::net::SocketAddr;

use anyhow::{Context, Result};
pub use invoice::InvoiceApi;
use log::{debug, error, info};
use paygate::{
    monerod_client::Client as MonerodClient,
    storage::{Storage, StorageError},
    PaymentProcessor, ProcessorError,
};
use tonic::{transport::Server, Request, Status};
pub use user::UserApi;

use self::v1::{
    invoice_service_server::InvoiceServiceServer, user_service_server::UserServiceServer,
};

use crate::config::AppMode;

/// Generated protobuf types for the `paygate.v1` package.
#[allow(clippy::pedantic, missing_docs)]
pub mod v1 {
    tonic::include_proto!("paygate.v1");

    pub(crate) const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("paygate_descriptor");
}

/// Serve both services on `addr` until an interrupt signal arrives, then
/// stop the processor and drain in-flight requests.
///
/// # Errors
///
/// Returns an error if the server cannot bind or fails while running.
pub async fn serve<S: Storage, M: MonerodClient>(
    processor: PaymentProcessor<S, M>,
    addr: SocketAddr,
    mode: AppMode,
) -> Result<()> {
    let user_service =
        UserServiceServer::with_interceptor(UserApi::new(processor.clone()), log_request);
    let invoice_service =
        InvoiceServiceServer::with_interceptor(InvoiceApi::new(processor.clone()), log_request);

    let router = Server::builder()
        .add_service(user_service)
        .add_service(invoice_service);
    let router = if mode == AppMode::Dev {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(v1::FILE_DESCRIPTOR_SET)
            .build_v1()
            .context("failed to build reflection service")?;
        router.add_service(reflection)
    } else {
        router
    };

    info!("Starting gRPC server on {addr}");
    router
        .serve_with_shutdown(addr, shutdown(processor))
        .await
        .context("gRPC server failed")
}

async fn shutdown<S: Storage, M: MonerodClient>(processor: PaymentProcessor<S, M>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt signal. Shutting down."),
        Err(e) => error!("Failed to listen for interrupt signal: {e}"),
    }
    processor.stop();
}

/// Request-logging interceptor applied to both services.
#[allow(clippy::unnecessary_wraps)]
fn log_request(request: Request<()>) -> Result<Request<()>, Status> {
    debug!("Incoming gRPC request from {:?}", request.remote_addr());
    Ok(request)
}

/// Map a processor error onto the gRPC status surface. Anything that is
/// not a client fault or an unimplemented coin is an internal error, logged
/// here and reported without detail.
pub(crate) fn to_status(e: ProcessorError) -> Status {
    match &e {
        ProcessorError::Unimplemented(_) => Status::unimplemented(e.to_string()),
        ProcessorError::Storage(StorageError::AlreadyExists(_)) | ProcessorError::Key(_) => {
            Status::invalid_argument(e.to_string())
        }
        _ => {
            error!("Request failed: {e}");
            Status::internal("an internal error occurred while handling the request")
        }
    }
}
