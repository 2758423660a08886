use std::{net::SocketAddr, time::Duration};

use monero::Hash;
use paygate::{
    monerod_client::{Block, MockClient},
    storage::stores::InMemory,
    PaymentProcessor,
};
use paygate_server::grpc::{
    v1::{
        invoice_service_client::InvoiceServiceClient,
        invoice_service_server::InvoiceServiceServer, user_service_client::UserServiceClient,
        user_service_server::UserServiceServer, CoinType, CreateInvoiceRequest,
        GetCryptoKeysRequest, GetInvoicesRequest, InvoiceStatusStreamRequest, InvoiceStatusType,
        RegisterUserRequest, UpdateCryptoKeysRequest, XmrKeysUpdateRequest,
    },
    InvoiceApi, UserApi,
};
use paygate_testing_utils::{init_logger, pub_spend_key_hex, PRIVATE_VIEW_KEY};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{transport::Server, Code};
use uuid::Uuid;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_server() -> SocketAddr {
    init_logger();

    let client = MockClient::new();
    client.push_block(Block {
        height: 1000,
        hash: Hash::from_slice(&[0; 32]),
        tx_hashes: Vec::new(),
    });
    let processor = PaymentProcessor::<InMemory, MockClient>::builder(InMemory::new())
        .block_interval(Duration::from_millis(50))
        .build_with_mock_daemon(client)
        .await
        .expect("failed to build payment processor");
    processor.run().await.expect("failed to run processor");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("failed to read listener addr");

    let router = Server::builder()
        .add_service(UserServiceServer::new(UserApi::new(processor.clone())))
        .add_service(InvoiceServiceServer::new(InvoiceApi::new(processor)));
    tokio::spawn(router.serve_with_incoming(TcpListenerStream::new(listener)));

    addr
}

async fn register_user_with_keys(addr: SocketAddr) -> String {
    let mut users = UserServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("failed to connect");

    let user_id = users
        .register_user(RegisterUserRequest { user_id: None })
        .await
        .expect("RegisterUser failed")
        .into_inner()
        .user_id;

    users
        .update_crypto_keys(UpdateCryptoKeysRequest {
            user_id: user_id.clone(),
            xmr_req: Some(XmrKeysUpdateRequest {
                priv_view_key: PRIVATE_VIEW_KEY.to_string(),
                pub_spend_key: pub_spend_key_hex(),
            }),
        })
        .await
        .expect("UpdateCryptoKeys failed");

    user_id
}

#[tokio::test]
async fn register_update_and_fetch_keys() {
    let addr = start_server().await;
    let mut users = UserServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("failed to connect");

    // Server-generated id.
    let user_id = register_user_with_keys(addr).await;
    Uuid::parse_str(&user_id).expect("returned user id is not a uuid");

    let keys = users
        .get_crypto_keys(GetCryptoKeysRequest {
            user_id: user_id.clone(),
        })
        .await
        .expect("GetCryptoKeys failed")
        .into_inner()
        .xmr_keys
        .expect("no xmr keys in response");
    assert_eq!(keys.priv_view_key, PRIVATE_VIEW_KEY);
    assert_eq!(keys.pub_spend_key, pub_spend_key_hex());

    // Client-supplied id is used verbatim.
    let supplied = Uuid::new_v4().to_string();
    let echoed = users
        .register_user(RegisterUserRequest {
            user_id: Some(supplied.clone()),
        })
        .await
        .expect("RegisterUser with id failed")
        .into_inner()
        .user_id;
    assert_eq!(echoed, supplied);
}

#[tokio::test]
async fn user_service_rejects_bad_input() {
    let addr = start_server().await;
    let mut users = UserServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("failed to connect");

    let status = users
        .register_user(RegisterUserRequest {
            user_id: Some("not-a-uuid".to_string()),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = users
        .get_crypto_keys(GetCryptoKeysRequest {
            user_id: Uuid::new_v4().to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let user_id = register_user_with_keys(addr).await;
    let status = users
        .update_crypto_keys(UpdateCryptoKeysRequest {
            user_id,
            xmr_req: Some(XmrKeysUpdateRequest {
                priv_view_key: "zzz".to_string(),
                pub_spend_key: pub_spend_key_hex(),
            }),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn invoice_lifecycle_over_grpc() {
    let addr = start_server().await;
    let user_id = register_user_with_keys(addr).await;
    let mut invoices = InvoiceServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("failed to connect");

    // Subscribe before creating, so the terminal event is observed.
    let mut stream = invoices
        .invoice_status_stream(InvoiceStatusStreamRequest {})
        .await
        .expect("InvoiceStatusStream failed")
        .into_inner();

    let created = invoices
        .create_invoice(CreateInvoiceRequest {
            user_id: user_id.clone(),
            coin: CoinType::Xmr.into(),
            amount: 1.0,
            timeout: 0,
            confirmations: 1,
        })
        .await
        .expect("CreateInvoice failed")
        .into_inner();
    assert!(!created.address.is_empty());

    let fetched = invoices
        .get_invoices(GetInvoicesRequest {
            payment_ids: vec![created.payment_id.clone()],
        })
        .await
        .expect("GetInvoices failed")
        .into_inner()
        .invoices;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, created.payment_id);
    assert_eq!(fetched[0].crypto_address, created.address);
    assert_eq!(fetched[0].user_id, user_id);

    // The requested lifetime is clamped to the block interval; the invoice
    // expires shortly and the stream reports it.
    let event = tokio::time::timeout(EVENT_TIMEOUT, stream.message())
        .await
        .expect("timeout waiting for status event")
        .expect("stream failed")
        .expect("stream ended")
        .invoice
        .expect("event carried no invoice");
    assert_eq!(event.id, created.payment_id);
    assert_eq!(event.status, InvoiceStatusType::Expired as i32);
}

#[tokio::test]
async fn invoice_service_rejects_bad_input() {
    let addr = start_server().await;
    let user_id = register_user_with_keys(addr).await;
    let mut invoices = InvoiceServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("failed to connect");

    let status = invoices
        .create_invoice(CreateInvoiceRequest {
            user_id: user_id.clone(),
            coin: CoinType::Xmr.into(),
            amount: -1.0,
            timeout: 60,
            confirmations: 1,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = invoices
        .create_invoice(CreateInvoiceRequest {
            user_id: user_id.clone(),
            coin: 999,
            amount: 1.0,
            timeout: 60,
            confirmations: 1,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Coins in the schema but without an implementation are typed stubs.
    let status = invoices
        .create_invoice(CreateInvoiceRequest {
            user_id,
            coin: CoinType::Btc.into(),
            amount: 1.0,
            timeout: 60,
            confirmations: 1,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = invoices
        .get_invoices(GetInvoicesRequest {
            payment_ids: vec!["nope".to_string()],
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}
