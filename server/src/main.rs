//! Binary entrypoint for `paygate-server`.

#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::process::ExitCode;

use paygate_server::entrypoint;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = entrypoint().await {
        eprintln!("paygate-server failed: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
