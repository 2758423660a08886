use std::ops::Deref;

use httpmock::{Mock, MockServer};
use serde_json::json;

/// A mock monerod HTTP server with canned RPC responses.
pub struct MockDaemon {
    server: MockServer,
}

impl Deref for MockDaemon {
    type Target = MockServer;

    fn deref(&self) -> &MockServer {
        &self.server
    }
}

impl MockDaemon {
    pub async fn start() -> MockDaemon {
        MockDaemon {
            server: MockServer::start_async().await,
        }
    }

    /// Base URL of the mock daemon, with a trailing slash.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}/", self.server.address())
    }

    pub fn mock_get_info(&self, stagenet: bool, testnet: bool) -> Mock<'_> {
        self.mock(|when, then| {
            when.path("/json_rpc")
                .body_contains(r#""method":"get_info""#);
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "0",
                    "jsonrpc": "2.0",
                    "result": {
                        "stagenet": stagenet,
                        "testnet": testnet,
                        "mainnet": !stagenet && !testnet,
                        "status": "OK"
                    }
                }));
        })
    }

    pub fn mock_last_block_header(&self, height: u64, hash_hex: &str) -> Mock<'_> {
        self.mock(|when, then| {
            when.path("/json_rpc")
                .body_contains(r#""method":"get_last_block_header""#);
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "0",
                    "jsonrpc": "2.0",
                    "result": {
                        "block_header": {
                            "height": height,
                            "hash": hash_hex,
                        },
                        "status": "OK"
                    }
                }));
        })
    }

    pub fn mock_empty_txpool(&self) -> Mock<'_> {
        self.mock(|when, then| {
            when.path("/get_transaction_pool");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({ "status": "OK" }));
        })
    }

    /// All requested transactions come back missed.
    pub fn mock_transactions_missed(&self, missed_hash_hex: &str) -> Mock<'_> {
        self.mock(|when, then| {
            when.path("/get_transactions");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "missed_tx": [missed_hash_hex],
                    "status": "OK"
                }));
        })
    }
}
