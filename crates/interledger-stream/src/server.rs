//! Routes inbound Prepares to the `Connection` their destination token
//! identifies, creating that `Connection` the first time a token is seen.
//!
//! A single `ConnectionPool` is shared by every account an outer service
//! chain serves; the plugin-level "one data handler" constraint from the
//! protocol's concurrency model becomes, here, "one `ConnectionPool` wraps
//! the next `OutgoingService` in the chain".
use super::connection::{Connection, ConnectionConfig};
use super::crypto::*;
use bytes::Bytes;
use futures::channel::mpsc::UnboundedSender;
use interledger_packet::{Address, ErrorCode as IlpErrorCode, RejectBuilder};
use interledger_service::{Account, IlpResult, OutgoingRequest, OutgoingService, Username};
use log::debug;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::{collections::HashMap, str};
use uuid::Uuid;

// Note we are using the same magic bytes as the Javascript
// implementation but this is not strictly necessary. These
// magic bytes need to be the same for the server that creates the
// STREAM details for a given packet and for the server that fulfills
// it, but in the vast majority of cases those two servers will be
// running the same STREAM implementation so it doesn't matter what
// this string is.
const STREAM_SERVER_SECRET_GENERATOR: &[u8] = b"ilp_stream_shared_secret";

/// A connection tag may only use characters that survive unescaped inside
/// an ILP address segment.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("connectionTag can only include ASCII characters a-z, A-Z, 0-9, \"_\", \"-\", and \"~\"")]
pub struct InvalidConnectionTag;

fn validate_connection_tag(tag: &str) -> Result<(), InvalidConnectionTag> {
    let valid = !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'~');
    if valid {
        Ok(())
    } else {
        Err(InvalidConnectionTag)
    }
}

/// A STREAM connection generator that creates `destination_account` and `shared_secret` values
/// based on a single root secret.
///
/// This can be reused across multiple STREAM connections so that a single receiver can
/// accept incoming packets for multiple connections.
#[derive(Clone)]
pub struct ConnectionGenerator {
    secret_generator: Bytes,
}

impl ConnectionGenerator {
    pub fn new(server_secret: Bytes) -> Self {
        assert_eq!(server_secret.len(), 32, "Server secret must be 32 bytes");
        ConnectionGenerator {
            secret_generator: Bytes::from(
                &hmac_sha256(&server_secret[..], STREAM_SERVER_SECRET_GENERATOR)[..],
            ),
        }
    }

    /// Generate the STREAM parameters for the given ILP address and the configured server secret.
    ///
    /// The `destination_account` is generated such that the `shared_secret` can be re-derived
    /// from a Prepare packet's destination and the same server secret. If `connection_tag` is
    /// given, it is appended to the token after a `~` and later echoed back to the application
    /// via `Connection::connection_tag` once the connection accepting this token is created.
    pub fn generate_address_and_secret(
        &self,
        base_address: &Address,
        connection_tag: Option<&str>,
    ) -> Result<(Address, [u8; 32]), InvalidConnectionTag> {
        if let Some(tag) = connection_tag {
            validate_connection_tag(tag)?;
        }

        let token = base64::encode_config(&generate_token(), base64::URL_SAFE_NO_PAD);
        let token = match connection_tag {
            Some(tag) => format!("{}~{}", token, tag),
            None => token,
        };
        // Note the shared secret is generated from the base64-encoded version of the token,
        // rather than from the unencoded bytes
        let shared_secret = hmac_sha256(&self.secret_generator[..], token.as_bytes());
        // Note that the unwrap here is safe because we know the base_address
        // is valid and adding base64-url/tilde characters will always be valid
        let destination_account = base_address.with_suffix(token.as_bytes()).unwrap();

        debug!("Generated address: {}", destination_account);
        Ok((destination_account, shared_secret))
    }

    /// Rederive the `shared_secret` from a `destination_account`.
    ///
    /// Although it is not strictly necessary, this uses the same logic as the Javascript
    /// STREAM server. Because this STREAM server is intended to be used as part of a node with
    /// forwarding capabilities, rather than as a standalone receiver, it will try forwarding
    /// any packets that it is unable to decrypt. An alternative algorithm for rederiving
    /// the shared secret could include an auth tag to definitively check whether the packet
    /// is meant for this receiver before attempting to decrypt the packet. That will be more
    /// important if/when we want to use STREAM for sending larger amounts of data and want
    /// to avoid copying the STREAM data packet before decrypting it.
    ///
    /// This method returns a Result in case we want to change the internal
    /// logic in the future.
    pub fn rederive_secret(&self, destination_account: &Address) -> Result<[u8; 32], ()> {
        let local_part = destination_account.segments().rev().next().unwrap();
        // Note this computes the HMAC with the token _encoded as UTF8_,
        // rather than decoding the base64 first.
        let shared_secret = hmac_sha256(&self.secret_generator[..], local_part.as_bytes());
        Ok(shared_secret)
    }
}

/// Notification that STREAM fulfilled a packet and received a single Interledger payment, used by Pubsub API consumers
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PaymentNotification {
    /// The username of the account that received the Interledger payment
    pub to_username: Username,
    /// The username of the account that routed the Interledger payment to this node
    pub from_username: Username,
    /// The ILP Address of the receiver of the payment notification
    pub destination: Address,
    /// The amount received
    pub amount: u64,
    /// The time this payment notification was fired in RFC3339 format
    pub timestamp: String,
}

/// A trait representing the Publish side of a pub/sub store
pub trait StreamNotificationsStore {
    type Account: Account;

    /// *Synchronously* saves the sending side of the provided account id's websocket channel to the store's memory
    fn add_payment_notification_subscription(
        &self,
        account_id: Uuid,
        sender: UnboundedSender<PaymentNotification>,
    );

    /// Instructs the store to publish the provided payment notification object
    /// via its Pubsub interface
    fn publish_payment_notification(&self, _payment: PaymentNotification);
}

/// Extracts the token segment immediately following `to_address` in
/// `destination`, if one is present (i.e. `destination` is
/// `to_address.<token>[.rest...]`).
fn local_token(destination: &[u8], to_address: &[u8]) -> Option<&str> {
    if destination.len() <= to_address.len() + 1 || destination[to_address.len()] != b'.' {
        return None;
    }
    let rest = &destination[to_address.len() + 1..];
    let end = rest.iter().position(|&b| b == b'.').unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    str::from_utf8(&rest[..end]).ok()
}

/// Splits a token into its base64url part and its connection tag, if the
/// token carries a `~<tag>` suffix.
fn connection_tag_from_token(token: &str) -> Option<String> {
    token.find('~').map(|i| token[i + 1..].to_string())
}

/// Notified whenever the pool creates a `Connection` for a token it has
/// never seen before. This is the `connection` event from the protocol's
/// server public API.
pub struct IncomingConnections<A: Account> {
    receiver: tokio::sync::mpsc::UnboundedReceiver<Connection<A>>,
}

impl<A: Account> IncomingConnections<A> {
    /// Waits for the next connection accepted by the pool. Returns `None`
    /// once every clone of the pool that could produce one has been
    /// dropped.
    pub async fn accept_connection(&mut self) -> Option<Connection<A>> {
        self.receiver.recv().await
    }
}

/// An `OutgoingService` that routes each Prepare bound for this node to the
/// persistent, possibly-multi-stream `Connection` its destination token
/// names, creating that `Connection` on first sight of a token.
///
/// Packets not addressed to this node, or whose destination fails to
/// decrypt (taken as evidence the packet was never meant for this STREAM
/// server, e.g. a token collision with some other routing use of the same
/// address prefix), fall through to the next service in the chain.
#[derive(Clone)]
pub struct ConnectionPool<S, O, A: Account> {
    connection_generator: ConnectionGenerator,
    next: O,
    store: S,
    connections: Arc<Mutex<HashMap<String, Connection<A>>>>,
    new_connections: tokio::sync::mpsc::UnboundedSender<Connection<A>>,
    config: ConnectionConfig,
    account_type: PhantomData<A>,
}

impl<S, O, A> ConnectionPool<S, O, A>
where
    S: StreamNotificationsStore<Account = A>,
    O: OutgoingService<A>,
    A: Account,
{
    pub fn new(
        server_secret: Bytes,
        store: S,
        next: O,
        config: ConnectionConfig,
    ) -> (Self, IncomingConnections<A>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (
            ConnectionPool {
                connection_generator: ConnectionGenerator::new(server_secret),
                next,
                store,
                connections: Arc::new(Mutex::new(HashMap::new())),
                new_connections: sender,
                config,
                account_type: PhantomData,
            },
            IncomingConnections { receiver },
        )
    }

    pub fn generate_address_and_secret(
        &self,
        base_address: &Address,
        connection_tag: Option<&str>,
    ) -> Result<(Address, [u8; 32]), InvalidConnectionTag> {
        self.connection_generator
            .generate_address_and_secret(base_address, connection_tag)
    }

    /// Drops every connection currently held open by the pool.
    pub fn close(&self) {
        self.connections.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl<S, O, A> OutgoingService<A> for ConnectionPool<S, O, A>
where
    S: StreamNotificationsStore + Send + Sync + 'static + Clone,
    O: OutgoingService<A> + Send + Sync + Clone,
    A: Account + Send + Sync + Clone + 'static,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        let to_address = request.to.ilp_address().clone();
        let destination = request.prepare.destination();
        let dest_bytes: &[u8] = destination.as_ref();

        if !dest_bytes.starts_with(to_address.as_ref()) {
            return self.next.send_request(request).await;
        }

        let token = match local_token(dest_bytes, to_address.as_ref()) {
            Some(token) => token.to_string(),
            None => {
                return Err(RejectBuilder {
                    code: IlpErrorCode::F02_UNREACHABLE,
                    message: &[],
                    triggered_by: Some(&to_address),
                    data: &[],
                }
                .build());
            }
        };

        let shared_secret = self
            .connection_generator
            .rederive_secret(&destination)
            .expect("rederiving a shared secret is infallible");

        let (connection, is_new) = {
            let mut connections = self.connections.lock().unwrap();
            match connections.get(&token) {
                Some(connection) => (connection.clone(), false),
                None => {
                    let connection_tag = connection_tag_from_token(&token);
                    let connection = Connection::new_server(
                        Bytes::copy_from_slice(&shared_secret),
                        to_address.clone(),
                        request.to.asset_code().to_string(),
                        request.to.asset_scale(),
                        connection_tag,
                        self.config.clone(),
                    );
                    connections.insert(token.clone(), connection.clone());
                    (connection, true)
                }
            }
        };

        let result = connection.handle_prepare(&request.prepare).await;

        if is_new {
            match &result {
                // Only a freshly minted connection can still plausibly not
                // be for us: an established connection failing to decrypt
                // its own shared secret would be a bug, not a routing miss.
                Err(reject) if reject.code() == IlpErrorCode::F06_UNEXPECTED_PAYMENT => {
                    self.connections.lock().unwrap().remove(&token);
                    return self.next.send_request(request).await;
                }
                _ => {
                    let _ = self.new_connections.send(connection.clone());
                }
            }
        }

        if result.is_ok() {
            self.store
                .publish_payment_notification(PaymentNotification {
                    to_username: request.to.username().clone(),
                    from_username: request.from.username().clone(),
                    destination: destination.clone(),
                    amount: request.prepare.amount(),
                    timestamp: chrono::DateTime::<chrono::Utc>::from(std::time::SystemTime::now())
                        .to_rfc3339(),
                });
        }

        result
    }
}

#[cfg(test)]
mod connection_generator {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn generates_valid_ilp_address() {
        let server_secret = [9; 32];
        let receiver_address = Address::from_str("example.receiver").unwrap();
        let connection_generator = ConnectionGenerator::new(Bytes::from(&server_secret[..]));
        let (destination_account, shared_secret) = connection_generator
            .generate_address_and_secret(&receiver_address, None)
            .unwrap();

        assert!(destination_account
            .to_bytes()
            .starts_with(receiver_address.as_ref()));

        assert_eq!(
            connection_generator
                .rederive_secret(&destination_account)
                .unwrap(),
            shared_secret
        );
    }

    #[test]
    fn embeds_and_recovers_connection_tag() {
        let server_secret = [9; 32];
        let receiver_address = Address::from_str("example.receiver").unwrap();
        let connection_generator = ConnectionGenerator::new(Bytes::from(&server_secret[..]));
        let (destination_account, _) = connection_generator
            .generate_address_and_secret(&receiver_address, Some("my-tag_1"))
            .unwrap();
        let token = destination_account.segments().rev().next().unwrap();
        assert_eq!(connection_tag_from_token(token).as_deref(), Some("my-tag_1"));
    }

    #[test]
    fn rejects_invalid_connection_tag() {
        let server_secret = [9; 32];
        let receiver_address = Address::from_str("example.receiver").unwrap();
        let connection_generator = ConnectionGenerator::new(Bytes::from(&server_secret[..]));
        let result = connection_generator.generate_address_and_secret(&receiver_address, Some("invalid\n"));
        assert_eq!(
            result.unwrap_err().to_string(),
            "connectionTag can only include ASCII characters a-z, A-Z, 0-9, \"_\", \"-\", and \"~\""
        );
    }
}

#[cfg(test)]
mod connection_pool {
    use super::*;
    use crate::test_helpers::TestAccount;
    use interledger_packet::{ErrorCode, Prepare, PrepareBuilder, RejectBuilder};
    use interledger_service::outgoing_service_fn;
    use std::str::FromStr;
    use std::time::{Duration, UNIX_EPOCH};

    #[derive(Clone, Default)]
    struct DummyStore;

    impl StreamNotificationsStore for DummyStore {
        type Account = TestAccount;

        fn add_payment_notification_subscription(
            &self,
            _account_id: Uuid,
            _sender: UnboundedSender<PaymentNotification>,
        ) {
        }

        fn publish_payment_notification(&self, _payment: PaymentNotification) {}
    }

    fn probe_prepare(shared_secret: &[u8; 32], dest: Address) -> Prepare {
        let stream_packet = crate::packet::StreamPacketBuilder {
            ilp_packet_type: interledger_packet::PacketType::Prepare,
            prepare_amount: 0,
            sequence: 1,
            frames: &[crate::packet::Frame::StreamMoney(
                crate::packet::StreamMoneyFrame {
                    stream_id: 1,
                    shares: 1,
                },
            )],
        }
        .build();
        let data = stream_packet.into_encrypted(&shared_secret[..]);
        let execution_condition = generate_condition(&shared_secret[..], &data);
        PrepareBuilder {
            destination: dest,
            amount: 100,
            expires_at: UNIX_EPOCH + Duration::from_secs(1_000_000),
            data: &data[..],
            execution_condition: &execution_condition,
        }
        .build()
    }

    #[tokio::test]
    async fn fulfills_and_reuses_connection_for_repeated_tokens() {
        let ilp_address = Address::from_str("example.destination").unwrap();
        let server_secret = Bytes::from(&[1; 32][..]);
        let (mut pool, mut incoming) = ConnectionPool::new(
            server_secret,
            DummyStore,
            outgoing_service_fn(|_: OutgoingRequest<TestAccount>| -> IlpResult {
                panic!("shouldn't get here")
            }),
            ConnectionConfig::default(),
        );

        let (destination_account, shared_secret) = pool
            .generate_address_and_secret(&ilp_address, None)
            .unwrap();

        let to = TestAccount::new(ilp_address.clone(), "XYZ", 9);
        let from = TestAccount::new(Address::from_str("example.sender").unwrap(), "XYZ", 9);

        let prepare = probe_prepare(&shared_secret, destination_account.clone());
        let result = pool
            .send_request(OutgoingRequest {
                from: from.clone(),
                to: to.clone(),
                original_amount: prepare.amount(),
                prepare,
            })
            .await;
        assert!(result.is_ok());
        assert!(incoming.accept_connection().await.is_some());
        assert_eq!(pool.connections.lock().unwrap().len(), 1);

        let prepare = probe_prepare(&shared_secret, destination_account);
        let result = pool
            .send_request(OutgoingRequest {
                from,
                to,
                original_amount: prepare.amount(),
                prepare,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(
            pool.connections.lock().unwrap().len(),
            1,
            "second Prepare for the same token should reuse the existing connection"
        );
    }

    #[tokio::test]
    async fn passes_on_packets_not_addressed_to_this_node() {
        let ilp_address = Address::from_str("example.destination").unwrap();
        let other = Address::from_str("example.elsewhere.token123").unwrap();
        let server_secret = Bytes::from(&[1; 32][..]);

        let (mut pool, _incoming) = ConnectionPool::new(
            server_secret,
            DummyStore,
            outgoing_service_fn(|_: OutgoingRequest<TestAccount>| -> IlpResult {
                Err(RejectBuilder {
                    code: ErrorCode::F02_UNREACHABLE,
                    message: &[],
                    data: &[],
                    triggered_by: None,
                }
                .build())
            }),
            ConnectionConfig::default(),
        );

        let to = TestAccount::new(ilp_address, "XYZ", 9);
        let from = TestAccount::new(Address::from_str("example.sender").unwrap(), "XYZ", 9);
        let prepare = PrepareBuilder {
            destination: other,
            amount: 100,
            expires_at: UNIX_EPOCH + Duration::from_secs(1_000_000),
            data: &[],
            execution_condition: &[0; 32],
        }
        .build();

        let result = pool
            .send_request(OutgoingRequest {
                from,
                to,
                original_amount: prepare.amount(),
                prepare,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn forwards_undecryptable_packets_addressed_to_this_node() {
        let ilp_address = Address::from_str("example.destination").unwrap();
        let server_secret = Bytes::from(&[1; 32][..]);
        let (mut pool, mut incoming) = ConnectionPool::new(
            server_secret,
            DummyStore,
            outgoing_service_fn(|_: OutgoingRequest<TestAccount>| -> IlpResult {
                Err(RejectBuilder {
                    code: ErrorCode::F02_UNREACHABLE,
                    message: b"forwarded",
                    data: &[],
                    triggered_by: None,
                }
                .build())
            }),
            ConnectionConfig::default(),
        );

        let to = TestAccount::new(ilp_address.clone(), "XYZ", 9);
        let from = TestAccount::new(Address::from_str("example.sender").unwrap(), "XYZ", 9);
        let dest = ilp_address.with_suffix(b"sometoken").unwrap();
        let prepare = PrepareBuilder {
            destination: dest,
            amount: 100,
            expires_at: UNIX_EPOCH + Duration::from_secs(1_000_000),
            data: b"not a valid stream packet",
            execution_condition: &[7; 32],
        }
        .build();

        let result = pool
            .send_request(OutgoingRequest {
                from,
                to,
                original_amount: prepare.amount(),
                prepare,
            })
            .await;
        assert_eq!(result.unwrap_err().message(), b"forwarded");
        assert_eq!(
            pool.connections.lock().unwrap().len(),
            0,
            "a connection that never decrypted a packet should not be kept"
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(10), incoming.accept_connection())
                .await
                .is_err(),
            "no connection event should fire for a packet that wasn't ours"
        );
    }
}
