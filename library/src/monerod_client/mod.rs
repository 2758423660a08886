//! Typed calls to a monerod daemon's RPC interface.

mod authentication;

use std::{
    any,
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

pub use authentication::AuthError;
use authentication::AuthInfo;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    header::{AUTHORIZATION, WWW_AUTHENTICATE},
    http::StatusCode,
    Method, Request, Uri,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client as HttpClient},
    rt::TokioExecutor,
};
use log::{debug, trace, warn};
use monero::consensus::{deserialize, encode};
use serde_json::json;
use thiserror::Error;
use tokio::time::{error, timeout};

/// Maximum number of transactions to request at once (daemon limits this).
const MAX_REQUESTED_TRANSACTIONS: usize = 100;

/// Header of the daemon's best block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Height of the block.
    pub height: u64,
    /// Hash of the block.
    pub hash: monero::Hash,
}

/// A block fetched by height: header data plus the hashes of the
/// transactions it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Height of the block.
    pub height: u64,
    /// Hash of the block.
    pub hash: monero::Hash,
    /// Hashes of the block's transactions, excluding the miner transaction.
    pub tx_hashes: Vec<monero::Hash>,
}

/// An unconfirmed transaction observed in the daemon's txpool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTransaction {
    /// The parsed transaction.
    pub tx: monero::Transaction,
    /// The transaction's hash as reported by the daemon.
    pub id_hash: monero::Hash,
    /// `true` if the daemon has seen a competing spend of an input.
    pub double_spend_seen: bool,
}

/// A transaction fetched by hash via `get_transactions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTransaction {
    /// The parsed transaction.
    pub tx: monero::Transaction,
    /// The transaction's hash as reported by the daemon.
    pub tx_hash: monero::Hash,
    /// Blocks mined on top of the transaction's block (0 while in the pool).
    pub confirmations: u64,
    /// `true` while the transaction is still in the pool.
    pub in_pool: bool,
    /// `true` if the daemon has seen a competing spend of an input.
    pub double_spend_seen: bool,
}

/// Result of a `get_transactions` call: found transactions plus the hashes
/// the daemon no longer knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionsResponse {
    /// Transactions the daemon returned.
    pub txs: Vec<FetchedTransaction>,
    /// Requested hashes missing from both the chain and the pool.
    pub missed: Vec<monero::Hash>,
}

/// Daemon network information, used to pick the address network at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonInfo {
    /// Daemon is on stagenet.
    pub stagenet: bool,
    /// Daemon is on testnet.
    pub testnet: bool,
}

impl DaemonInfo {
    /// The network the daemon follows.
    #[must_use]
    pub fn network(&self) -> monero::Network {
        if self.stagenet {
            monero::Network::Stagenet
        } else if self.testnet {
            monero::Network::Testnet
        } else {
            monero::Network::Mainnet
        }
    }
}

/// Necessary methods for a monerod client.
pub trait Client: Clone + Send + Sync + 'static {
    /// Fetch the header of the daemon's best block.
    fn last_block_header(&self) -> impl Future<Output = Result<BlockHeader, RpcError>> + Send;
    /// Fetch a block given its height.
    fn block(&self, height: u64) -> impl Future<Output = Result<Block, RpcError>> + Send;
    /// Fetch the daemon's transaction pool.
    fn txpool(&self) -> impl Future<Output = Result<Vec<PoolTransaction>, RpcError>> + Send;
    /// Fetch transactions given their hashes. Hashes the daemon does not
    /// know are reported in the response's missed list rather than failing
    /// the call.
    fn transactions_by_hashes(
        &self,
        hashes: &[monero::Hash],
    ) -> impl Future<Output = Result<TransactionsResponse, RpcError>> + Send;
    /// Fetch daemon network information.
    fn info(&self) -> impl Future<Output = Result<DaemonInfo, RpcError>> + Send;
    /// The URL of the monero daemon.
    fn url(&self) -> String;
}

/// A monerod RPC client.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    url: Uri,
    timeout: Duration,
    auth_info: Option<Arc<AuthInfo>>,
}

impl RpcClient {
    /// Returns an RPC client pointing at the specified monero daemon.
    pub(crate) fn new(
        url: Uri,
        total_timeout: Duration,
        connection_timeout: Duration,
        username: Option<String>,
        password: Option<String>,
        seed: Option<u64>,
    ) -> RpcClient {
        let mut hyper_connector = HttpConnector::new();
        hyper_connector.set_connect_timeout(Some(connection_timeout));
        hyper_connector.enforce_http(false);
        hyper_connector.set_keepalive(Some(Duration::from_secs(25)));
        let rustls_connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(hyper_connector);
        let client = HttpClient::builder(TokioExecutor::new()).build(rustls_connector);
        let auth_info = if username.is_some() || password.is_some() {
            Some(Arc::new(AuthInfo::new(
                username.unwrap_or_default(),
                password.unwrap_or_default(),
                seed,
            )))
        } else {
            None
        };

        RpcClient {
            client,
            url,
            timeout: total_timeout,
            auth_info,
        }
    }

    async fn request(&self, body: &str, endpoint: &str) -> Result<serde_json::Value, RpcError> {
        let uri: Uri = (self.url.to_string() + endpoint)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| RpcError::Request(Box::new(e)))?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri.clone())
            .body(Full::new(body.to_owned().into()))?;

        let mut response = timeout(self.timeout, self.client.request(req))
            .await?
            .map_err(|e| RpcError::Request(Box::new(e)))?;

        // Monerod with --rpc-login answers with a digest challenge; answer
        // it and retry the request once.
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .ok_or(AuthError::Unauthorized)?;
            debug!("Received 401 UNAUTHORIZED response. Performing digest authentication.");
            let auth_header = self
                .auth_info
                .as_ref()
                .ok_or(AuthError::Unauthorized)?
                .answer(challenge, &uri, &Method::POST)?;
            let req = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(AUTHORIZATION, auth_header)
                .body(Full::new(body.to_owned().into()))?;
            response = timeout(self.timeout, self.client.request(req))
                .await?
                .map_err(|e| RpcError::Request(Box::new(e)))?;
        }

        let (_parts, body) = response.into_parts();

        Ok(serde_json::from_slice(
            &body
                .collect()
                .await
                .map_err(|e| RpcError::Request(Box::new(e)))?
                .to_bytes(),
        )?)
    }
}

impl Client for RpcClient {
    async fn last_block_header(&self) -> Result<BlockHeader, RpcError> {
        trace!("Requesting last block header");
        let request_body = r#"{"jsonrpc":"2.0","id":"0","method":"get_last_block_header"}"#;
        let res = self.request(request_body, "json_rpc").await?;

        let header = &res["result"]["block_header"];
        let height = header["height"].as_u64().ok_or_else(|| {
            RpcError::MissingData("{{ result: {{ block_header: {{ height: ... }} }} }}".to_string())
        })?;
        let hash = parse_hash(&header["hash"])?;
        Ok(BlockHeader { height, hash })
    }

    async fn block(&self, height: u64) -> Result<Block, RpcError> {
        trace!("Requesting block {}", height);
        let request_body = r#"{"jsonrpc":"2.0","id":"0","method":"get_block","params":{"height":"#
            .to_owned()
            + &height.to_string()
            + "}}";

        let res = self.request(&request_body, "json_rpc").await?;

        let hash = parse_hash(&res["result"]["block_header"]["hash"])?;
        let block_str = res["result"]["blob"]
            .as_str()
            .ok_or_else(|| RpcError::MissingData("{{ result: {{ blob: \"...\" }} }}".to_string()))?;
        let block_hex = hex::decode(block_str)?;
        let block: monero::Block = deserialize(&block_hex)?;

        Ok(Block {
            height,
            hash,
            tx_hashes: block.tx_hashes,
        })
    }

    async fn txpool(&self) -> Result<Vec<PoolTransaction>, RpcError> {
        trace!("Requesting txpool");
        let mut transactions = Vec::new();
        let res = self.request("", "get_transaction_pool").await?;

        let Some(blobs) = res["transactions"].as_array() else {
            // An empty txpool comes back with no transactions field.
            return Ok(transactions);
        };
        for blob in blobs {
            let tx_str = blob["tx_blob"].as_str().ok_or_else(|| {
                RpcError::MissingData("{{ transactions: [ {{ tx_blob: \"...\" }} ] }}".to_string())
            })?;
            let tx_hex = hex::decode(tx_str)?;
            let tx: monero::Transaction = deserialize(&tx_hex)?;
            transactions.push(PoolTransaction {
                tx,
                id_hash: parse_hash(&blob["id_hash"])?,
                double_spend_seen: blob["double_spend_seen"].as_bool().unwrap_or(false),
            });
        }
        Ok(transactions)
    }

    async fn transactions_by_hashes(
        &self,
        hashes: &[monero::Hash],
    ) -> Result<TransactionsResponse, RpcError> {
        let mut response = TransactionsResponse::default();
        for i in 0..=hashes.len() / MAX_REQUESTED_TRANSACTIONS {
            // Request in chunks to stay under the restricted RPC maximum.
            let starting_index: usize = i * MAX_REQUESTED_TRANSACTIONS;
            let ending_index: usize =
                std::cmp::min(MAX_REQUESTED_TRANSACTIONS * (i + 1), hashes.len());
            if ending_index == starting_index {
                return Ok(response);
            }

            trace!("Requesting {} transactions", ending_index - starting_index);
            let request_body = r#"{"txs_hashes":"#.to_owned()
                + &json!(hashes[starting_index..ending_index]
                    .iter()
                    .map(|x| hex::encode(x.as_bytes()))
                    .collect::<Vec<String>>())
                .to_string()
                + "}";

            let res = self.request(&request_body, "get_transactions").await?;

            if let Some(missed) = res["missed_tx"].as_array() {
                for hash in missed {
                    response.missed.push(parse_hash(hash)?);
                }
            }

            let Some(entries) = res["txs"].as_array() else {
                continue;
            };
            if ending_index - starting_index != entries.len() + response.missed.len() {
                warn!(
                    "Received {} transactions, requested {}",
                    entries.len(),
                    ending_index - starting_index
                );
            }

            for entry in entries {
                let tx_str = entry["as_hex"].as_str().ok_or(RpcError::DataType {
                    found: entry["as_hex"].clone(),
                    expected: any::type_name::<&str>(),
                })?;
                let tx_hex = hex::decode(tx_str)?;
                let tx: monero::Transaction = deserialize(&tx_hex)?;
                response.txs.push(FetchedTransaction {
                    tx,
                    tx_hash: parse_hash(&entry["tx_hash"])?,
                    confirmations: entry["confirmations"].as_u64().unwrap_or(0),
                    in_pool: entry["in_pool"].as_bool().unwrap_or(false),
                    double_spend_seen: entry["double_spend_seen"].as_bool().unwrap_or(false),
                });
            }
        }
        Ok(response)
    }

    async fn info(&self) -> Result<DaemonInfo, RpcError> {
        let request_body = r#"{"jsonrpc":"2.0","id":"0","method":"get_info"}"#;
        let res = self.request(request_body, "json_rpc").await?;

        let result = &res["result"];
        if result.is_null() {
            return Err(RpcError::MissingData("{{ result: ... }}".to_string()));
        }
        Ok(DaemonInfo {
            stagenet: result["stagenet"].as_bool().unwrap_or(false),
            testnet: result["testnet"].as_bool().unwrap_or(false),
        })
    }

    fn url(&self) -> String {
        self.url.to_string()
    }
}

fn parse_hash(value: &serde_json::Value) -> Result<monero::Hash, RpcError> {
    let hash_str = value.as_str().ok_or(RpcError::DataType {
        found: value.clone(),
        expected: any::type_name::<&str>(),
    })?;
    let hash_hex = hex::decode(hash_str)?;
    Ok(monero::Hash::from_slice(&hash_hex))
}

/// A programmable mock monerod client for testing purposes.
#[derive(Debug, Clone, Default)]
pub struct MockClient(Arc<Mutex<MockState>>);

#[derive(Debug, Default)]
struct MockState {
    chain: VecDeque<Block>,
    txpool: Vec<PoolTransaction>,
    transactions: HashMap<monero::Hash, FetchedTransaction>,
    missed: HashSet<monero::Hash>,
    info: DaemonInfo,
}

impl MockClient {
    /// Returns a mock client with an empty chain and pool.
    #[must_use]
    pub fn new() -> MockClient {
        MockClient::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a block to the mock chain.
    pub fn push_block(&self, block: Block) {
        self.lock().chain.push_back(block);
    }

    /// Replace the mock txpool.
    pub fn set_txpool(&self, txs: Vec<PoolTransaction>) {
        self.lock().txpool = txs;
    }

    /// Make a transaction available to `transactions_by_hashes`.
    pub fn insert_transaction(&self, tx: FetchedTransaction) {
        let mut state = self.lock();
        state.missed.remove(&tx.tx_hash);
        state.transactions.insert(tx.tx_hash, tx);
    }

    /// Make `transactions_by_hashes` report a hash as missed.
    pub fn set_missed(&self, hash: monero::Hash) {
        let mut state = self.lock();
        state.transactions.remove(&hash);
        state.missed.insert(hash);
    }
}

impl Client for MockClient {
    async fn last_block_header(&self) -> Result<BlockHeader, RpcError> {
        let state = self.lock();
        let block = state
            .chain
            .back()
            .ok_or_else(|| RpcError::MissingData("mock chain is empty".to_string()))?;
        Ok(BlockHeader {
            height: block.height,
            hash: block.hash,
        })
    }

    async fn block(&self, height: u64) -> Result<Block, RpcError> {
        self.lock()
            .chain
            .iter()
            .find(|b| b.height == height)
            .cloned()
            .ok_or_else(|| RpcError::MissingData(format!("mock block {height} not found")))
    }

    async fn txpool(&self) -> Result<Vec<PoolTransaction>, RpcError> {
        Ok(self.lock().txpool.clone())
    }

    async fn transactions_by_hashes(
        &self,
        hashes: &[monero::Hash],
    ) -> Result<TransactionsResponse, RpcError> {
        let state = self.lock();
        let mut response = TransactionsResponse::default();
        for hash in hashes {
            if let Some(tx) = state.transactions.get(hash) {
                response.txs.push(tx.clone());
            } else if state.missed.contains(hash) {
                response.missed.push(*hash);
            }
        }
        Ok(response)
    }

    async fn info(&self) -> Result<DaemonInfo, RpcError> {
        Ok(self.lock().info)
    }

    fn url(&self) -> String {
        "http://node.example.com".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use monero::{Hash, Network};

    use super::{Client, DaemonInfo, FetchedTransaction, MockClient};

    #[test]
    fn daemon_info_network_mapping() {
        let mainnet = DaemonInfo::default();
        assert_eq!(mainnet.network(), Network::Mainnet);
        let stagenet = DaemonInfo {
            stagenet: true,
            testnet: false,
        };
        assert_eq!(stagenet.network(), Network::Stagenet);
        let testnet = DaemonInfo {
            stagenet: false,
            testnet: true,
        };
        assert_eq!(testnet.network(), Network::Testnet);
    }

    #[tokio::test]
    async fn mock_client_reports_missed_and_found() {
        let client = MockClient::new();
        let known = Hash::from_slice(&[1; 32]);
        let missed = Hash::from_slice(&[2; 32]);
        let unknown = Hash::from_slice(&[3; 32]);

        client.insert_transaction(FetchedTransaction {
            tx: paygate_testing_utils::empty_transaction(),
            tx_hash: known,
            confirmations: 3,
            in_pool: false,
            double_spend_seen: false,
        });
        client.set_missed(missed);

        let response = client
            .transactions_by_hashes(&[known, missed, unknown])
            .await
            .unwrap();
        assert_eq!(response.txs.len(), 1);
        assert_eq!(response.txs[0].confirmations, 3);
        assert_eq!(response.missed, vec![missed]);
    }
}

/// An error originating from the monerod client.
#[derive(Error, Debug)]
pub enum RpcError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Request(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to build the HTTP request.
    #[error("failed to build HTTP Request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),
    /// HTTP request timed out.
    #[error("HTTP request timed out: {0}")]
    Timeout(#[from] error::Elapsed),
    /// Failed to decode a hex value.
    #[error("hex decoding failed: {0}")]
    HexDecode(#[from] hex::FromHexError),
    /// Failed to (de)serialize.
    #[error("(de)serialization failed: {0}")]
    Serialization(#[from] encode::Error),
    /// RPC response is missing expected data.
    #[error("expected data was not present in RPC response, or was the wrong data type: {0}")]
    MissingData(String),
    /// A field in the RPC response has the wrong type.
    #[error("failed to interpret json value \"{found}\" from RPC response as {expected}")]
    DataType {
        /// The type received.
        found: serde_json::Value,
        /// The type expected.
        expected: &'static str,
    },
    /// The response is not valid json.
    #[error("failed to interpret response body as json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// Failed to authenticate.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
}
