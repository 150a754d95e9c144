//! Bootstraps a STREAM `Connection` against a plugin/service chain: look up
//! our own ILP address and asset details via ILDCP, build the connection,
//! and spawn its outbound send loop.
//!
//! `send_money` is kept as a single-stream, single-call convenience
//! wrapper, generalizing the teacher's `SendMoneyFuture` (whose
//! `SendMoneyFutureState`, `MAX_TIME_SINCE_LAST_FULFILL` watchdog, and
//! reject classification now live inside `Connection`) into a thin veneer
//! over `connect()` + `Connection::create_stream` + `StreamRef::send_total`.
use super::connection::{Connection, ConnectionConfig};
use bytes::Bytes;
use interledger_ildcp::get_ildcp_info;
use interledger_packet::Address;
use interledger_service::{Account, IncomingService};
use log::{error, warn};
use serde::{Deserialize, Serialize};

use super::error::Error;

/// Metadata about a completed STREAM payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamDelivery {
    /// The sender's ILP Address
    pub from: Address,
    /// The receiver's ILP Address
    pub to: Address,
    // StreamDelivery variables which we know ahead of time
    /// The amount sent by the sender
    pub sent_amount: u64,
    /// The sender's asset scale
    pub sent_asset_scale: u8,
    /// The sender's asset code
    pub sent_asset_code: String,
    /// The amount delivered to the receiver
    pub delivered_amount: u64,
    // StreamDelivery variables which may get updated if the receiver sends us a
    // ConnectionAssetDetails frame.
    /// The asset scale delivered to the receiver
    /// (this may change depending on the granularity of accounts across nodes)
    pub delivered_asset_scale: Option<u8>,
    /// The asset code delivered to the receiver (this may happen in cross-currency payments)
    pub delivered_asset_code: Option<String>,
}

/// Looks up our own ILP address and asset details via ILDCP, builds a
/// `Connection` to `destination_account`, and spawns its outbound send
/// loop. Resolves once the connection's exchange-rate probe establishes at
/// least [`MIN_EXCHANGE_RATE_PRECISION_DIGITS`](./../connection/index.html)
/// of precision, or fails with the connection's close reason if it never
/// does.
pub async fn connect<S, A>(
    mut service: S,
    from_account: A,
    destination_account: Address,
    shared_secret: &[u8],
    config: ConnectionConfig,
) -> Result<Connection<A>, Error>
where
    S: IncomingService<A> + Clone + Send + Sync + 'static,
    A: Account + Clone + Send + Sync + 'static,
{
    let account_details = get_ildcp_info(&mut service, from_account.clone())
        .await
        .map_err(|_| Error::ConnectionError("Unable to get ILDCP info".to_string()))?;

    let source_account = account_details.ilp_address().clone();
    if source_account.scheme() != destination_account.scheme() {
        warn!(
            "Destination ILP address starts with a different scheme prefix (\"{}\") than ours (\"{}\"), this probably isn't going to work",
            destination_account.scheme(),
            source_account.scheme()
        );
    }

    let connection = Connection::new_client(
        Bytes::copy_from_slice(shared_secret),
        source_account,
        destination_account,
        from_account,
        account_details.asset_code().to_string(),
        account_details.asset_scale(),
        config,
    );

    // Must be taken before the run loop is spawned: it registers the
    // channel that `maybe_open`/`fail_opening` will signal once the
    // exchange-rate probe settles one way or the other.
    let opening_result = connection.take_opening_result();

    tokio::spawn({
        let connection = connection.clone();
        async move {
            if let Err(err) = connection.run(service).await {
                error!("Connection send loop ended with error: {:?}", err);
            }
        }
    });

    if let Some(receiver) = opening_result {
        match receiver.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(Error::ConnectionError(
                    "Connection closed before opening completed".to_string(),
                ))
            }
        }
    }

    Ok(connection)
}

/// Send a given amount of money using the STREAM transport protocol.
///
/// This opens a connection with a single stream, waits for the full amount
/// to be sent (or for a fatal error), and returns the amount delivered as
/// reported by the receiver, in the receiver's asset's units.
pub async fn send_money<S, A>(
    service: S,
    from_account: &A,
    destination_account: Address,
    shared_secret: &[u8],
    source_amount: u64,
) -> Result<(StreamDelivery, S), Error>
where
    S: IncomingService<A> + Clone + Send + Sync + 'static,
    A: Account + Clone + Send + Sync + 'static,
{
    let connection = connect(
        service.clone(),
        from_account.clone(),
        destination_account.clone(),
        shared_secret,
        ConnectionConfig::default(),
    )
    .await?;

    let (stream, _handle) = connection.create_stream().await;
    let result = stream.send_total(source_amount).await;
    connection.end().await;
    result?;

    let (delivered_asset_code, delivered_asset_scale) =
        match connection.remote_asset_details().await {
            Some((code, scale)) => (Some(code), Some(scale)),
            None => (None, None),
        };

    let receipt = StreamDelivery {
        from: from_account.ilp_address().clone(),
        to: destination_account,
        sent_amount: connection.total_sent().await,
        sent_asset_scale: from_account.asset_scale(),
        sent_asset_code: from_account.asset_code().to_string(),
        delivered_amount: connection.total_delivered().await,
        delivered_asset_scale,
        delivered_asset_code,
    };

    Ok((receipt, service))
}

#[cfg(test)]
mod send_money_tests {
    use super::*;
    use crate::test_helpers::{TestAccount, EXAMPLE_CONNECTOR};
    use interledger_ildcp::IldcpService;
    use interledger_packet::{ErrorCode as IlpErrorCode, RejectBuilder};
    use interledger_service::incoming_service_fn;
    use parking_lot::Mutex;
    use std::str::FromStr;
    use std::sync::Arc;

    #[tokio::test]
    async fn stops_at_final_errors() {
        let account = TestAccount::new(Address::from_str("example.destination").unwrap(), "XYZ", 9);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = requests.clone();
        let connector: Address = Address::from_str(EXAMPLE_CONNECTOR).unwrap();
        let result = send_money(
            IldcpService::new(incoming_service_fn(move |request| {
                requests_clone.lock().push(request);
                Err(RejectBuilder {
                    code: IlpErrorCode::F00_BAD_REQUEST,
                    message: b"just some final error",
                    triggered_by: Some(&connector),
                    data: &[],
                }
                .build())
            })),
            &account,
            Address::from_str("example.destination").unwrap(),
            &[0; 32][..],
            100,
        )
        .await;
        assert!(result.is_err());
        assert!(!requests.lock().is_empty());
    }
}
