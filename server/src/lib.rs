//! # `paygate-server`: a monero payment processing server.
//!
//! `paygate-server` wires the `PayGate` library to a `PostgreSQL` store and
//! exposes it over gRPC: user and key registration, invoice creation, and a
//! long-lived invoice status stream.

#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

mod config;
pub mod grpc;
pub mod logging;

use anyhow::{Context, Result};
pub use config::{AppMode, Config};
use log::info;
use paygate::{monerod_client::RpcClient, storage::stores::Postgres, PaymentProcessor};
use secrecy::ExposeSecret;

/// Start the payment processing server, blocking until shutdown.
///
/// # Errors
///
/// Returns an error if configuration, the database, the daemon, or the
/// gRPC listener could not be brought up, or if the server fails while
/// running.
pub async fn entrypoint() -> Result<()> {
    let config_path = Config::get_path();
    let config = Config::read(&config_path)?;
    logging::init_logger(config.mode);
    info!("Configuration loaded from {}", config_path.display());

    let store = Postgres::connect(&config.database_url())
        .await
        .context("failed to connect to database")?;

    let daemon = &config.coin.xmr.daemon;
    let mut builder =
        PaymentProcessor::<Postgres, RpcClient>::builder(store).daemon_url(daemon.url.clone());
    if !daemon.user.is_empty() || !daemon.pass.expose_secret().is_empty() {
        builder = builder.daemon_login(daemon.user.clone(), daemon.pass.expose_secret().clone());
    }
    let processor = builder
        .build()
        .await
        .context("failed to build payment processor")?;
    processor
        .run()
        .await
        .context("failed to run payment processor")?;
    info!("Payment processor running.");

    let addr = config.listen_addr()?;
    grpc::serve(processor, addr, config.mode).await
}
