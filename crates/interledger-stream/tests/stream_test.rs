//! End-to-end exercise of the STREAM client/server stack entirely
//! in-process: a client `Connection` built via `connect`, bridged through a
//! `ConnectionPool` standing in for a server plugin, with no real network.

use async_trait::async_trait;
use bytes::Bytes;
use interledger_ildcp::IldcpService;
use interledger_packet::Address;
use interledger_service::{
    Account, IlpResult, IncomingRequest, IncomingService, OutgoingRequest, OutgoingService,
    Username,
};
use interledger_stream::{
    connect, send_money, ConnectionConfig, ConnectionPool, PaymentNotification,
    StreamNotificationsStore,
};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct TestAccount {
    id: Uuid,
    username: Username,
    ilp_address: Address,
    asset_code: String,
    asset_scale: u8,
}

impl TestAccount {
    fn new(ilp_address: Address, username: &str, asset_code: &str, asset_scale: u8) -> Self {
        TestAccount {
            id: Uuid::new_v4(),
            username: Username::from_str(username).unwrap(),
            ilp_address,
            asset_code: asset_code.to_string(),
            asset_scale,
        }
    }
}

impl Account for TestAccount {
    fn id(&self) -> Uuid {
        self.id
    }

    fn username(&self) -> &Username {
        &self.username
    }

    fn ilp_address(&self) -> &Address {
        &self.ilp_address
    }

    fn asset_scale(&self) -> u8 {
        self.asset_scale
    }

    fn asset_code(&self) -> &str {
        &self.asset_code
    }
}

#[derive(Clone, Default)]
struct NullStore {
    notifications: Arc<Mutex<Vec<PaymentNotification>>>,
}

impl StreamNotificationsStore for NullStore {
    type Account = TestAccount;

    fn add_payment_notification_subscription(
        &self,
        _account_id: Uuid,
        _sender: UnboundedSender<PaymentNotification>,
    ) {
    }

    fn publish_payment_notification(&self, payment: PaymentNotification) {
        self.notifications.lock().unwrap().push(payment);
    }
}

/// Rejects everything: the bottom of the `ConnectionPool`'s chain, stood in
/// for "no further routing available."
#[derive(Clone)]
struct DeadEnd;

#[async_trait]
impl OutgoingService<TestAccount> for DeadEnd {
    async fn send_request(&mut self, request: OutgoingRequest<TestAccount>) -> IlpResult {
        Err(interledger_packet::RejectBuilder {
            code: interledger_packet::ErrorCode::F02_UNREACHABLE,
            message: b"no route",
            triggered_by: Some(request.to.ilp_address()),
            data: &[],
        }
        .build())
    }
}

/// Bridges the client's outbound "plugin" calls into a server-side
/// `OutgoingService` chain, as if the two sides were connected by a single
/// duplex link instead of two separate traits.
#[derive(Clone)]
struct NetworkBridge<O, A> {
    to: A,
    next: O,
}

#[async_trait]
impl<O, A> IncomingService<A> for NetworkBridge<O, A>
where
    O: OutgoingService<A> + Clone + Send + Sync,
    A: Account + Clone + Send + Sync,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let original_amount = request.prepare.amount();
        self.next
            .send_request(OutgoingRequest {
                from: request.from,
                to: self.to.clone(),
                original_amount,
                prepare: request.prepare,
            })
            .await
    }
}

fn server_account(address: &str) -> TestAccount {
    TestAccount::new(Address::from_str(address).unwrap(), "bob", "XYZ", 9)
}

fn client_account(address: &str) -> TestAccount {
    TestAccount::new(Address::from_str(address).unwrap(), "alice", "XYZ", 9)
}

#[tokio::test]
async fn send_money_delivers_full_amount_to_a_new_connection() {
    let server_address = Address::from_str("example.receiver").unwrap();
    let server_account = server_account("example.receiver");

    let (pool, mut incoming) = ConnectionPool::new(
        Bytes::from(&[7u8; 32][..]),
        NullStore::default(),
        DeadEnd,
        ConnectionConfig::default(),
    );

    let (destination_account, shared_secret) = pool
        .generate_address_and_secret(&server_address, None)
        .unwrap();

    let bridge = IldcpService::new(NetworkBridge {
        to: server_account,
        next: pool,
    });

    let sender = client_account("example.sender");

    let (delivery, _service) = send_money(
        bridge,
        &sender,
        destination_account,
        &shared_secret[..],
        1_000,
    )
    .await
    .expect("payment should succeed");

    assert_eq!(delivery.sent_amount, 1_000);
    assert_eq!(delivery.delivered_amount, 1_000);
    assert_eq!(delivery.sent_asset_code, "XYZ");

    let connection = incoming
        .accept_connection()
        .await
        .expect("pool should have surfaced the new connection");
    assert_eq!(connection.total_delivered().await, 1_000);
}

#[tokio::test]
async fn multiple_streams_share_one_connection_and_round_trip_data() {
    let server_address = Address::from_str("example.receiver").unwrap();
    let server_account = server_account("example.receiver");

    let (pool, mut incoming) = ConnectionPool::new(
        Bytes::from(&[3u8; 32][..]),
        NullStore::default(),
        DeadEnd,
        ConnectionConfig::default(),
    );

    let (destination_account, shared_secret) = pool
        .generate_address_and_secret(&server_address, Some("integration-test"))
        .unwrap();

    let bridge = IldcpService::new(NetworkBridge {
        to: server_account,
        next: pool,
    });

    let sender = client_account("example.sender");

    let connection = connect(
        bridge,
        sender,
        destination_account,
        &shared_secret[..],
        ConnectionConfig::default(),
    )
    .await
    .expect("connection should open");

    let (money_stream, _money_handle) = connection.create_stream().await;
    let (data_stream, _data_handle) = connection.create_stream().await;

    money_stream
        .send_total(500)
        .await
        .expect("money stream should deliver its full amount");

    data_stream
        .write(Bytes::from_static(b"hello stream"))
        .await
        .expect("data stream should accept a write");
    data_stream.close().await;

    connection.end().await;

    assert_eq!(connection.total_delivered().await, 500);

    let server_connection = incoming
        .accept_connection()
        .await
        .expect("server side should see the connection");

    let (server_money, _) = server_connection
        .accept_stream()
        .await
        .expect("server should observe the money stream");
    let (server_data, mut server_data_handle) = server_connection
        .accept_stream()
        .await
        .expect("server should observe the data stream");

    assert_eq!(server_money.total_sent().await, 0);

    let received =
        tokio::time::timeout(Duration::from_millis(200), server_data_handle.events.recv())
            .await
            .expect("should not time out waiting for data")
            .expect("channel should not be closed");
    match received {
        interledger_stream::StreamEvent::Data(bytes) => {
            assert_eq!(&bytes[..], b"hello stream");
        }
        other => panic!("expected Data event, got {:?}", other),
    }
    assert_eq!(server_data.id(), data_stream.id());
}
