//! The STREAM connection state machine: pacing money on a single in-flight
//! `Prepare`, path maximum packet amount (MPPA) discovery, exchange-rate
//! tracking with slippage, frame scheduling across multiplexed streams, and
//! close coordination.
//!
//! This generalizes `client::send_money`'s single-shot,
//! single-stream send loop (`SendMoneyFutureState`, `MAX_TIME_SINCE_LAST_FULFILL`,
//! `CongestionController` pacing) into a persistent, multi-stream
//! `Connection` that keeps running after any one `send_total`/`write` call
//! completes, and that also knows how to answer inbound Prepares
//! (`handle_prepare`) the way `server::receive_money` used to, but against
//! durable per-stream state instead of a single shot.
//!
//! Real STREAM-over-ILP is asymmetric: only the endpoint with a route out
//! through the network can originate a Prepare. A `Connection` built by
//! `client::connect` drives an outbound send loop (`Connection::run`,
//! spawned as a background task); a `Connection` built by the server's
//! `ConnectionPool` only ever answers Prepares it receives. Both share the
//! same state machine — only the half that originates Prepares differs.
use super::congestion::CongestionController;
use super::crypto::{generate_condition, generate_fulfillment};
use super::error::Error;
use super::packet::*;
use super::receipt;
use super::stream::{Stream, StreamState, UNBOUNDED};
use bytes::{Bytes, BytesMut};
use interledger_packet::{
    Address, ErrorClass, ErrorCode as IlpErrorCode, Fulfill, FulfillBuilder, IlpResult,
    MaxPacketAmountDetails, PacketType as IlpPacketType, Prepare, PrepareBuilder, Reject,
    RejectBuilder,
};
use interledger_service::{Account, IncomingRequest, IncomingService};
use log::{debug, error, warn};
use ring::rand::{SecureRandom, SystemRandom};
use std::{
    collections::HashMap,
    str,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

/// How many significant digits of precision the exchange-rate probe must
/// reach before the connection is considered `Open`. Hard-coded to 3 per
/// the protocol ("no packets meeting the minimum exchange precision of 3
/// digits made it through the path").
const MIN_EXCHANGE_RATE_PRECISION_DIGITS: u32 = 3;

/// How far past the highest offset a stream has reassembled so far we
/// advertise via `StreamMaxData`, giving the sender headroom before it has
/// to stop and wait for a fresh window.
const STREAM_DATA_WINDOW: u64 = 1024 * 1024;

/// Plain configuration struct, no file/env parsing — callers build one with
/// `Default::default()` and override fields, the same way
/// `CongestionController::new` takes explicit constructor arguments.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Tolerance for exchange-rate degradation between probing and sending.
    pub slippage: f64,
    /// Starting point for the congestion controller's window.
    pub initial_congestion_window: u64,
    /// Source-amount used for exchange-rate probe packets before any
    /// stream has money queued to send.
    pub probe_amount: u64,
    /// How many probe packets to try before giving up on establishing a
    /// usable exchange rate.
    pub max_probe_attempts: u32,
    /// Target size (bytes) of an encrypted STREAM packet; data frames are
    /// packed up to roughly this size minus encryption/frame overhead.
    pub packet_target_size: usize,
    /// `expires_at` horizon for outgoing Prepares.
    pub packet_expiry: Duration,
    /// Upper bound on retries for a single application-level send before
    /// giving up (bounded independently of the overarching expiry).
    pub max_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            slippage: 0.01,
            initial_congestion_window: 10_000,
            probe_amount: 1_000,
            max_probe_attempts: 20,
            packet_target_size: 32 * 1024,
            packet_expiry: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Opening,
    Open,
    Closing,
    Closed,
}

struct Inner<A: Account> {
    shared_secret: Bytes,
    receipt_secret: [u8; 32],
    is_server: bool,
    local_address: Address,
    asset_code: String,
    asset_scale: u8,
    remote_asset_code: Option<String>,
    remote_asset_scale: Option<u8>,
    connection_tag: Option<String>,

    // client-only outbound plumbing
    from_account: Option<A>,
    destination_account: Option<Address>,

    next_outgoing_sequence: u64,
    greatest_incoming_sequence: u64,
    should_send_source_account: bool,
    sent_asset_details: bool,

    max_packet_amount: Option<u64>,
    congestion: CongestionController,
    config: ConnectionConfig,

    exchange_rate_sent_total: u64,
    exchange_rate_delivered_total: u64,
    exchange_rate: Option<f64>,
    probe_attempts: u32,
    /// Consecutive non-fatal (`F08`/`T*`/`F99`) rejects since the last
    /// fulfill. Bounded by `config.max_retries` so a persistent reject
    /// (e.g. a receive cap that never rises) doesn't retry forever.
    consecutive_retries: u32,

    streams: HashMap<u64, Stream>,
    next_stream_id: u64,
    connection_max_data_in: u64,
    connection_max_data_out: u64,
    total_data_sent: u64,

    state: LifecycleState,
    closing_drain: bool,
    close_reason: Option<(ErrorCode, String)>,
    opening_result: Option<oneshot::Sender<Result<(), Error>>>,

    total_sent: u64,
    total_delivered: u64,
}

/// A STREAM connection. Cheaply `Clone`able (an `Arc` handle); every clone
/// refers to the same underlying state guarded by a single async mutex, so
/// the outbound send loop and any number of inbound dispatches never
/// observe torn state, even though the critical sections span `.await`
/// points (awaiting the plugin's response while holding connection state is
/// exactly why this uses `tokio::sync::Mutex` rather than `parking_lot`'s
/// synchronous one).
#[derive(Clone)]
pub struct Connection<A: Account> {
    inner: Arc<Mutex<Inner<A>>>,
    notify: Arc<Notify>,
    closed_notify: Arc<Notify>,
    new_streams_tx: mpsc::UnboundedSender<(StreamRef<A>, super::stream::StreamHandle)>,
    new_streams_rx: Arc<Mutex<mpsc::UnboundedReceiver<(StreamRef<A>, super::stream::StreamHandle)>>>,
}

/// The command half of a stream, returned alongside its `StreamHandle`
/// event receiver by `Connection::create_stream`.
#[derive(Clone)]
pub struct StreamRef<A: Account> {
    connection: Connection<A>,
    id: u64,
}

struct PacketPlan {
    source_amount: u64,
    frames_meta: Vec<FrameMeta>,
    is_close: bool,
    is_probe: bool,
}

/// Deferred frame contents: borrowed `Frame<'a>`s can't outlive the buffers
/// that back them, so the plan stores owned copies and the fields are
/// turned into borrowed frames only at encode time.
enum FrameMeta {
    NewAddress(Address),
    AssetDetails(String, u8),
    Money { stream_id: u64, shares: u64 },
    Data { stream_id: u64, offset: u64, data: Bytes },
    ConnectionMaxData(u64),
    Close(ErrorCode, String),
    StreamClose(u64, ErrorCode, String),
}

impl<A: Account + Clone + Send + Sync + 'static> Connection<A> {
    pub(crate) fn new_client(
        shared_secret: Bytes,
        local_address: Address,
        destination_account: Address,
        from_account: A,
        asset_code: String,
        asset_scale: u8,
        config: ConnectionConfig,
    ) -> Self {
        Self::new(
            shared_secret,
            local_address,
            asset_code,
            asset_scale,
            false,
            Some(from_account),
            Some(destination_account),
            None,
            config,
        )
    }

    pub(crate) fn new_server(
        shared_secret: Bytes,
        local_address: Address,
        asset_code: String,
        asset_scale: u8,
        connection_tag: Option<String>,
        config: ConnectionConfig,
    ) -> Self {
        let conn = Self::new(
            shared_secret,
            local_address,
            asset_code,
            asset_scale,
            true,
            None,
            None,
            connection_tag,
            config,
        );
        // A server-side connection never probes for an exchange rate itself
        // (it never originates a Prepare); it's "open" as soon as it
        // exists.
        conn
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        shared_secret: Bytes,
        local_address: Address,
        asset_code: String,
        asset_scale: u8,
        is_server: bool,
        from_account: Option<A>,
        destination_account: Option<Address>,
        connection_tag: Option<String>,
        config: ConnectionConfig,
    ) -> Self {
        let receipt_secret = super::crypto::derive_receipt_secret(&shared_secret);
        let congestion = CongestionController::new(config.initial_congestion_window, config.initial_congestion_window / 10, 2.0);
        let inner = Inner {
            shared_secret,
            receipt_secret,
            is_server,
            local_address,
            asset_code,
            asset_scale,
            remote_asset_code: None,
            remote_asset_scale: None,
            connection_tag,
            from_account,
            destination_account,
            next_outgoing_sequence: 1,
            greatest_incoming_sequence: 0,
            should_send_source_account: true,
            sent_asset_details: false,
            max_packet_amount: None,
            congestion,
            config,
            exchange_rate_sent_total: 0,
            exchange_rate_delivered_total: 0,
            exchange_rate: None,
            probe_attempts: 0,
            consecutive_retries: 0,
            streams: HashMap::new(),
            next_stream_id: if is_server { 2 } else { 1 },
            connection_max_data_in: 10 * 1024 * 1024,
            connection_max_data_out: UNBOUNDED,
            total_data_sent: 0,
            state: if is_server {
                LifecycleState::Open
            } else {
                LifecycleState::Opening
            },
            closing_drain: true,
            close_reason: None,
            opening_result: None,
            total_sent: 0,
            total_delivered: 0,
        };
        let (new_streams_tx, new_streams_rx) = mpsc::unbounded_channel();
        Connection {
            inner: Arc::new(Mutex::new(inner)),
            notify: Arc::new(Notify::new()),
            closed_notify: Arc::new(Notify::new()),
            new_streams_tx,
            new_streams_rx: Arc::new(Mutex::new(new_streams_rx)),
        }
    }

    /// Wait for the peer to open a new stream (a `StreamMoney`/`StreamData`
    /// frame referencing a stream id this side has never seen before).
    /// Streams created locally via `create_stream` are never delivered here.
    pub async fn accept_stream(&self) -> Option<(StreamRef<A>, super::stream::StreamHandle)> {
        self.new_streams_rx.lock().await.recv().await
    }

    /// Create a new locally-initiated stream: odd ids for clients, even for
    /// servers, per the protocol's parity rule.
    pub async fn create_stream(&self) -> (StreamRef<A>, super::stream::StreamHandle) {
        let mut inner = self.inner.lock().await;
        let id = inner.next_stream_id;
        inner.next_stream_id += 2;
        let (stream, handle) = Stream::new(id);
        inner.streams.insert(id, stream);
        drop(inner);
        (
            StreamRef {
                connection: self.clone(),
                id,
            },
            handle,
        )
    }

    pub async fn total_sent(&self) -> u64 {
        self.inner.lock().await.total_sent
    }

    pub async fn total_delivered(&self) -> u64 {
        self.inner.lock().await.total_delivered
    }

    pub async fn minimum_acceptable_exchange_rate(&self) -> Option<f64> {
        let inner = self.inner.lock().await;
        inner.exchange_rate.map(|rate| rate * (1.0 - inner.config.slippage))
    }

    pub async fn connection_tag(&self) -> Option<String> {
        self.inner.lock().await.connection_tag.clone()
    }

    /// The peer's asset code and scale, once learned from a
    /// `ConnectionAssetDetails` frame.
    pub async fn remote_asset_details(&self) -> Option<(String, u8)> {
        let inner = self.inner.lock().await;
        match (&inner.remote_asset_code, inner.remote_asset_scale) {
            (Some(code), Some(scale)) => Some((code.clone(), scale)),
            _ => None,
        }
    }

    /// Gracefully close: drain pending sends, send `ConnectionClose{NoError}`,
    /// wait for it to be acknowledged.
    pub async fn end(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.is_server {
                inner.state = LifecycleState::Closed;
                drop(inner);
                self.closed_notify.notify_waiters();
                return;
            }
            if inner.state == LifecycleState::Open || inner.state == LifecycleState::Opening {
                inner.state = LifecycleState::Closing;
                inner.closing_drain = true;
            }
        }
        self.notify.notify_one();
        self.wait_closed().await;
    }

    /// Abruptly tear down: skip draining, surface `ApplicationError` to every
    /// open stream, send `ConnectionClose{ApplicationError}` best-effort.
    pub async fn destroy(&self) {
        {
            let mut inner = self.inner.lock().await;
            for stream in inner.streams.values_mut() {
                stream.destroy();
            }
            if inner.is_server {
                inner.state = LifecycleState::Closed;
                drop(inner);
                self.closed_notify.notify_waiters();
                return;
            }
            inner.state = LifecycleState::Closing;
            inner.closing_drain = false;
        }
        self.notify.notify_one();
        self.wait_closed().await;
    }

    async fn wait_closed(&self) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.state == LifecycleState::Closed {
                    return;
                }
            }
            self.closed_notify.notified().await;
        }
    }

    /// Drive the outbound send loop. Only meaningful for client-constructed
    /// connections; returns as soon as the connection reaches `Closed`.
    pub async fn run<S>(&self, mut service: S) -> Result<(), Error>
    where
        S: IncomingService<A> + Clone + Send,
    {
        loop {
            let plan = {
                let inner = self.inner.lock().await;
                if inner.state == LifecycleState::Closed {
                    return Ok(());
                }
                self.plan_packet(&inner)
            };
            match plan {
                None => {
                    let notified = self.notify.notified();
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                    }
                }
                Some(plan) => {
                    self.send_planned_packet(&mut service, plan).await?;
                }
            }
        }
    }

    fn plan_packet(&self, inner: &Inner<A>) -> Option<PacketPlan> {
        if inner.state == LifecycleState::Closing {
            let idle = inner.streams.values().all(|s| {
                !s.has_data_to_send() && s.sendable() == 0 && !s.needs_close_frame()
            });
            if !inner.closing_drain || idle {
                return Some(PacketPlan {
                    source_amount: 0,
                    frames_meta: vec![FrameMeta::Close(
                        ErrorCode::NoError,
                        String::new(),
                    )],
                    is_close: true,
                    is_probe: false,
                });
            }
        }

        let mut shares: Vec<(u64, u64)> = Vec::new();
        for (id, stream) in inner.streams.iter() {
            let want = stream.sendable();
            if want > 0 {
                shares.push((*id, want.min(1 << 48)));
            }
        }
        let sum_shares: u64 = shares.iter().map(|(_, s)| *s).sum();

        let congestion_amount = {
            // CongestionController::get_max_amount takes &mut self; the
            // caller of plan_packet only holds a shared &Inner, so this uses
            // the read-only ceiling instead. send_planned_packet is the one
            // place that actually commits `prepare()` against the real
            // controller.
            inner.congestion_peek_max()
        };
        let mut source_amount = sum_shares
            .min(congestion_amount)
            .min(inner.max_packet_amount.unwrap_or(u64::max_value()));

        let is_probe = source_amount == 0
            && inner.state == LifecycleState::Opening
            && inner.probe_attempts < inner.config.max_probe_attempts;
        if is_probe {
            source_amount = inner
                .config
                .probe_amount
                .min(congestion_amount.max(1))
                .min(inner.max_packet_amount.unwrap_or(u64::max_value()));
        }

        let mut frames_meta = Vec::new();
        if inner.should_send_source_account {
            frames_meta.push(FrameMeta::NewAddress(inner.local_address.clone()));
        }
        if !inner.sent_asset_details {
            frames_meta.push(FrameMeta::AssetDetails(
                inner.asset_code.clone(),
                inner.asset_scale,
            ));
        }

        let allocation = apportion(source_amount, &shares);
        for (id, amount) in &allocation {
            if *amount > 0 {
                frames_meta.push(FrameMeta::Money {
                    stream_id: *id,
                    shares: *amount,
                });
            }
        }

        // Data pressure is independent of money pressure: a stream with
        // `send_max == 0` still has bytes to deliver, so this scans every
        // stream with queued data rather than just the ones in `shares`.
        let mut data_candidates: Vec<u64> = inner
            .streams
            .iter()
            .filter(|(_, s)| s.has_data_to_send())
            .map(|(id, _)| *id)
            .collect();
        data_candidates.sort_unstable();

        let mut used_bytes: usize = 64;
        let mut connection_data_room = inner
            .connection_max_data_out
            .saturating_sub(inner.total_data_sent);
        for id in data_candidates {
            let stream = inner.streams.get(&id)?;
            let remaining = inner.config.packet_target_size.saturating_sub(used_bytes);
            if remaining < 16 || connection_data_room == 0 || !stream.has_data_to_send() {
                continue;
            }
            let cap = remaining.saturating_sub(16).min(connection_data_room as usize);
            if let Some((offset, data)) = stream.peek_outgoing_data(cap) {
                used_bytes += data.len() + 16;
                connection_data_room -= data.len() as u64;
                frames_meta.push(FrameMeta::Data {
                    stream_id: id,
                    offset,
                    data,
                });
            }
        }

        for (id, stream) in inner.streams.iter() {
            if stream.needs_close_frame() {
                frames_meta.push(FrameMeta::StreamClose(*id, ErrorCode::NoError, String::new()));
            }
        }

        if source_amount == 0
            && frames_meta
                .iter()
                .all(|f| matches!(f, FrameMeta::NewAddress(_) | FrameMeta::AssetDetails(..)))
            && !is_probe
        {
            return None;
        }

        Some(PacketPlan {
            source_amount,
            frames_meta,
            is_close: false,
            is_probe,
        })
    }

    async fn send_planned_packet<S>(&self, service: &mut S, plan: PacketPlan) -> Result<(), Error>
    where
        S: IncomingService<A> + Clone + Send,
    {
        let (sequence, shared_secret, destination_account, from_account, source_amount) = {
            let mut inner = self.inner.lock().await;
            let sequence = inner.next_outgoing_sequence;
            inner.next_outgoing_sequence = inner
                .next_outgoing_sequence
                .checked_add(1)
                .ok_or_else(|| Error::ProtocolViolation("sequence number exhausted".into()))?;
            inner.congestion.prepare(plan.source_amount);
            for meta in &plan.frames_meta {
                if let FrameMeta::Money { stream_id, shares } = meta {
                    if let Some(stream) = inner.streams.get_mut(stream_id) {
                        stream.commit_hold(*shares);
                    }
                }
            }
            (
                sequence,
                inner.shared_secret.clone(),
                inner.destination_account.clone(),
                inner.from_account.clone(),
                plan.source_amount,
            )
        };

        let destination_account = destination_account
            .ok_or_else(|| Error::ConnectionError("connection has no destination".into()))?;
        let from_account =
            from_account.ok_or_else(|| Error::ConnectionError("connection has no sender".into()))?;

        let frames = self.render_frames(&plan.frames_meta);
        let stream_packet = StreamPacketBuilder {
            ilp_packet_type: IlpPacketType::Prepare,
            prepare_amount: 0,
            sequence,
            frames: &frames,
        }
        .build();

        let data = stream_packet.into_encrypted(&shared_secret);
        let execution_condition = generate_condition(&shared_secret, &data);
        let prepare = PrepareBuilder {
            destination: destination_account,
            amount: source_amount,
            execution_condition: &execution_condition,
            expires_at: SystemTime::now() + self.expiry().await,
            data: &data[..],
        }
        .build();

        debug!(
            "sending STREAM packet {} amount={} frames={}",
            sequence,
            source_amount,
            plan.frames_meta.len()
        );
        let result = service
            .handle_request(IncomingRequest {
                from: from_account,
                prepare,
            })
            .await;

        match result {
            Ok(fulfill) => self.on_fulfill(&plan, sequence, source_amount, fulfill).await,
            Err(reject) => self.on_reject(&plan, sequence, source_amount, reject).await,
        }
        Ok(())
    }

    async fn expiry(&self) -> Duration {
        self.inner.lock().await.config.packet_expiry
    }

    fn render_frames<'a>(&self, meta: &'a [FrameMeta]) -> Vec<Frame<'a>> {
        meta.iter()
            .map(|m| match m {
                FrameMeta::NewAddress(addr) => {
                    Frame::ConnectionNewAddress(ConnectionNewAddressFrame {
                        source_account: addr.clone(),
                    })
                }
                FrameMeta::AssetDetails(code, scale) => {
                    Frame::ConnectionAssetDetails(ConnectionAssetDetailsFrame {
                        source_asset_code: code,
                        source_asset_scale: *scale,
                    })
                }
                FrameMeta::Money { stream_id, shares } => Frame::StreamMoney(StreamMoneyFrame {
                    stream_id: *stream_id,
                    shares: *shares,
                }),
                FrameMeta::Data {
                    stream_id,
                    offset,
                    data,
                } => Frame::StreamData(StreamDataFrame {
                    stream_id: *stream_id,
                    offset: *offset,
                    data,
                }),
                FrameMeta::ConnectionMaxData(max_offset) => {
                    Frame::ConnectionMaxData(ConnectionMaxDataFrame {
                        max_offset: *max_offset,
                    })
                }
                FrameMeta::Close(code, message) => Frame::ConnectionClose(ConnectionCloseFrame {
                    code: code.clone(),
                    message,
                }),
                FrameMeta::StreamClose(stream_id, code, message) => {
                    Frame::StreamClose(StreamCloseFrame {
                        stream_id: *stream_id,
                        code: code.clone(),
                        message,
                    })
                }
            })
            .collect()
    }

    async fn on_fulfill(&self, plan: &PacketPlan, sequence: u64, amount: u64, fulfill: Fulfill) {
        let mut inner = self.inner.lock().await;
        inner.congestion.fulfill(amount);
        inner.should_send_source_account = false;
        inner.consecutive_retries = 0;

        let delivered = match StreamPacket::from_encrypted(
            &inner.shared_secret,
            BytesMut::from(fulfill.data()),
        ) {
            Ok(packet) if packet.ilp_packet_type() == IlpPacketType::Fulfill => {
                for frame in packet.frames() {
                    match frame {
                        Frame::ConnectionAssetDetails(f) => {
                            inner.remote_asset_code = Some(f.source_asset_code.to_string());
                            inner.remote_asset_scale = Some(f.source_asset_scale);
                            inner.sent_asset_details = true;
                        }
                        Frame::StreamReceipt(f) => {
                            if let Some(stream) = inner.streams.get_mut(&f.stream_id) {
                                stream.set_latest_receipt(Bytes::copy_from_slice(f.receipt));
                            }
                        }
                        Frame::ConnectionMaxData(f) => {
                            inner.connection_max_data_out = f.max_offset;
                        }
                        Frame::StreamMaxData(f) => {
                            if let Some(stream) = inner.streams.get_mut(&f.stream_id) {
                                stream.set_remote_max_offset(f.max_offset);
                            }
                        }
                        _ => {}
                    }
                }
                packet.prepare_amount()
            }
            _ => {
                warn!("unable to parse STREAM packet from fulfill for sequence {}", sequence);
                0
            }
        };

        if plan.is_close {
            inner.state = LifecycleState::Closed;
            drop(inner);
            self.closed_notify.notify_waiters();
            return;
        }

        if amount > 0 {
            inner.exchange_rate_sent_total += amount;
            inner.exchange_rate_delivered_total += delivered;
            self.update_exchange_rate(&mut inner);
        }

        for meta in &plan.frames_meta {
            match meta {
                FrameMeta::Money { stream_id, shares } => {
                    let stream_delivered = if amount > 0 {
                        ((*shares as u128) * (delivered as u128) / (amount as u128)) as u64
                    } else {
                        0
                    };
                    if let Some(stream) = inner.streams.get_mut(stream_id) {
                        stream.commit_money_sent(*shares, stream_delivered);
                    }
                }
                FrameMeta::Data { stream_id, offset, data } => {
                    if let Some(stream) = inner.streams.get_mut(stream_id) {
                        stream.commit_data_sent(*offset, data.len());
                    }
                    inner.total_data_sent += data.len() as u64;
                }
                FrameMeta::StreamClose(stream_id, ..) => {
                    if let Some(stream) = inner.streams.get_mut(stream_id) {
                        stream.mark_close_frame_sent();
                    }
                }
                _ => {}
            }
        }
        inner.total_sent += amount;
        inner.total_delivered += delivered;

        // A fulfilled probe still counts as an attempt: a plugin that
        // fulfills everything but delivers nothing (exchange rate 0.0)
        // would otherwise never advance `probe_attempts`, since rejects are
        // the only other place it's counted, and `maybe_open` would spin
        // forever waiting for precision that can never arrive.
        if plan.is_probe && inner.state == LifecycleState::Opening {
            inner.probe_attempts += 1;
        }

        self.maybe_open(&mut inner);
        drop(inner);
        self.notify.notify_one();
    }

    async fn on_reject(&self, plan: &PacketPlan, sequence: u64, amount: u64, reject: Reject) {
        let mut inner = self.inner.lock().await;
        inner.congestion.reject(amount, &reject);

        for meta in &plan.frames_meta {
            if let FrameMeta::Money { stream_id, shares } = meta {
                if let Some(stream) = inner.streams.get_mut(stream_id) {
                    stream.release_hold(*shares);
                }
            }
        }

        debug!(
            "Prepare {} with amount {} was rejected with code {} ({} left in flight)",
            sequence,
            amount,
            reject.code(),
            amount
        );

        if plan.is_close {
            // best-effort: the close is considered acknowledged regardless
            inner.state = LifecycleState::Closed;
            drop(inner);
            self.closed_notify.notify_waiters();
            return;
        }

        let is_retryable = match reject.code() {
            IlpErrorCode::F08_AMOUNT_TOO_LARGE => {
                if let Ok(details) = MaxPacketAmountDetails::from_bytes(reject.data()) {
                    if details.amount_received() > 0 {
                        let new_max = amount * details.max_amount() / details.amount_received();
                        inner.max_packet_amount =
                            Some(inner.max_packet_amount.map_or(new_max, |m| m.min(new_max)));
                    }
                }
                true
            }
            code if code.class() == ErrorClass::Temporary => {
                // retried on the next loop iteration with no special state change
                true
            }
            IlpErrorCode::F99_APPLICATION_ERROR => {
                if let Ok(packet) = StreamPacket::from_encrypted(
                    &inner.shared_secret,
                    BytesMut::from(reject.data()),
                ) {
                    for frame in packet.frames() {
                        if let Frame::StreamMaxMoney(f) = frame {
                            if let Some(stream) = inner.streams.get_mut(&f.stream_id) {
                                stream.set_receive_max(f.receive_max);
                            }
                        }
                    }
                }
                true
            }
            _ => {
                if inner.state == LifecycleState::Opening {
                    self.fail_opening(
                        &mut inner,
                        Error::ConnectionError(format!(
                            "connection rejected with fatal error: {}",
                            reject.code()
                        )),
                    );
                } else {
                    inner.state = LifecycleState::Closed;
                    inner.close_reason = Some((
                        ErrorCode::InternalError,
                        format!("fatal reject: {}", reject.code()),
                    ));
                }
                false
            }
        };

        if is_retryable && inner.state != LifecycleState::Closed {
            inner.consecutive_retries += 1;
            if inner.consecutive_retries > inner.config.max_retries {
                let error = Error::ConnectionError(format!(
                    "retry budget of {} exceeded after repeated {} rejects",
                    inner.config.max_retries,
                    reject.code()
                ));
                if inner.state == LifecycleState::Opening {
                    self.fail_opening(&mut inner, error);
                } else {
                    inner.state = LifecycleState::Closed;
                    inner.close_reason = Some((
                        ErrorCode::InternalError,
                        format!("retry budget exceeded: {}", reject.code()),
                    ));
                }
            }
        }

        if inner.state == LifecycleState::Opening {
            inner.probe_attempts += 1;
            if inner.probe_attempts >= inner.config.max_probe_attempts
                && inner.exchange_rate.is_none()
            {
                self.fail_opening(&mut inner, min_precision_error());
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    fn update_exchange_rate(&self, inner: &mut Inner<A>) {
        if inner.exchange_rate_sent_total == 0 {
            return;
        }
        inner.exchange_rate = Some(
            inner.exchange_rate_delivered_total as f64 / inner.exchange_rate_sent_total as f64,
        );
    }

    fn maybe_open(&self, inner: &mut Inner<A>) {
        if inner.state != LifecycleState::Opening {
            return;
        }
        let has_precision = inner.exchange_rate_delivered_total > 0
            && inner.exchange_rate_sent_total
                >= 10u64.pow(MIN_EXCHANGE_RATE_PRECISION_DIGITS - 1);
        if has_precision {
            inner.state = LifecycleState::Open;
            if let Some(tx) = inner.opening_result.take() {
                let _ = tx.send(Ok(()));
            }
        } else if inner.probe_attempts >= inner.config.max_probe_attempts {
            self.fail_opening(inner, min_precision_error());
        }
    }

    fn fail_opening(&self, inner: &mut Inner<A>, error: Error) {
        inner.state = LifecycleState::Closed;
        if let Some(tx) = inner.opening_result.take() {
            let _ = tx.send(Err(error));
        }
    }

    pub(crate) fn take_opening_result(&self) -> Option<oneshot::Receiver<Result<(), Error>>> {
        let (tx, rx) = oneshot::channel();
        // called right after construction, so this never races a concurrent take
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.opening_result = Some(tx);
            Some(rx)
        } else {
            None
        }
    }

    /// Handle an inbound `Prepare`, the response-only half shared by both
    /// client and server connections.
    pub async fn handle_prepare(&self, prepare: &Prepare) -> IlpResult {
        let mut inner = self.inner.lock().await;
        let local_address = inner.local_address.clone();

        let ciphertext = BytesMut::from(prepare.data());
        let stream_packet = match StreamPacket::from_encrypted(&inner.shared_secret, ciphertext) {
            Ok(packet) => packet,
            Err(_) => {
                return Err(RejectBuilder {
                    code: IlpErrorCode::F06_UNEXPECTED_PAYMENT,
                    message: &[],
                    triggered_by: Some(&local_address),
                    data: &[],
                }
                .build());
            }
        };

        if stream_packet.ilp_packet_type() != IlpPacketType::Prepare {
            return Err(RejectBuilder {
                code: IlpErrorCode::F06_UNEXPECTED_PAYMENT,
                message: &[],
                triggered_by: Some(&local_address),
                data: &[],
            }
            .build());
        }

        let condition = generate_condition(&inner.shared_secret, prepare.data());
        if condition[..] != *prepare.execution_condition() {
            return Err(RejectBuilder {
                code: IlpErrorCode::F06_UNEXPECTED_PAYMENT,
                message: &[],
                triggered_by: Some(&local_address),
                data: &[],
            }
            .build());
        }

        if stream_packet.sequence() <= inner.greatest_incoming_sequence
            && inner.greatest_incoming_sequence != 0
        {
            return Err(reject_application_error(&local_address, &[]));
        }

        // Phase 1: validate every StreamMoney/StreamData frame without
        // mutating state, so a single overflowing stream rejects the whole
        // Prepare atomically rather than leaving partial credit applied.
        let mut money_by_stream: HashMap<u64, u64> = HashMap::new();
        let mut shares: Vec<(u64, u64)> = Vec::new();
        let mut data_frames: Vec<(u64, u64, Bytes)> = Vec::new();
        let mut new_remote_address: Option<Address> = None;
        let mut new_remote_asset: Option<(String, u8)> = None;
        let mut remote_close: Option<(ErrorCode, String)> = None;
        let mut newly_created_streams: Vec<(u64, super::stream::StreamHandle)> = Vec::new();

        for frame in stream_packet.frames() {
            match frame {
                Frame::StreamMoney(f) => shares.push((f.stream_id, f.shares)),
                Frame::StreamData(f) => {
                    data_frames.push((f.stream_id, f.offset, Bytes::copy_from_slice(f.data)))
                }
                Frame::ConnectionNewAddress(f) => new_remote_address = Some(f.source_account),
                Frame::ConnectionAssetDetails(f) => {
                    new_remote_asset =
                        Some((f.source_asset_code.to_string(), f.source_asset_scale))
                }
                Frame::ConnectionClose(f) => {
                    remote_close = Some((f.code, f.message.to_string()))
                }
                Frame::StreamClose(f) => {
                    if let Some(stream) = inner.streams.get_mut(&f.stream_id) {
                        stream.apply_peer_close(f.code, f.message.to_string());
                    }
                }
                _ => {}
            }
        }

        let allocation = apportion(prepare.amount(), &shares);
        for (stream_id, amount) in &allocation {
            if *amount == 0 {
                continue;
            }
            if !inner.streams.contains_key(stream_id) {
                let (stream, handle) = Stream::new_incoming(*stream_id);
                inner.streams.insert(*stream_id, stream);
                newly_created_streams.push((*stream_id, handle));
            }
            let stream = inner.streams.get_mut(stream_id).expect("just inserted");
            let would_be = stream.total_received().saturating_add(*amount);
            let receive_max = stream.receive_max();
            let total_received = stream.total_received();
            if would_be > receive_max {
                return Err(reject_with_max_money(
                    &inner.shared_secret,
                    &local_address,
                    stream_packet.sequence(),
                    *stream_id,
                    receive_max,
                    total_received,
                ));
            }
            money_by_stream.insert(*stream_id, *amount);
        }

        let incoming_bytes: u64 = data_frames.iter().map(|(_, _, d)| d.len() as u64).sum();
        if incoming_bytes > inner.connection_max_data_in {
            return Err(reject_application_error(&local_address, &[]));
        }

        // Phase 2: commit.
        inner.greatest_incoming_sequence = stream_packet.sequence();
        if let Some(addr) = new_remote_address {
            debug!("peer announced address {}", addr);
        }
        if let Some((code, scale)) = new_remote_asset {
            inner.remote_asset_code = Some(code);
            inner.remote_asset_scale = Some(scale);
        }
        if let Some((code, message)) = remote_close {
            inner.state = LifecycleState::Closing;
            inner.close_reason = Some((code, message));
        }

        let mut receipt_frames: Vec<(u64, Bytes)> = Vec::new();
        let mut max_money_frames: Vec<(u64, u64, u64)> = Vec::new();
        for (stream_id, amount) in &money_by_stream {
            let stream = inner.streams.get_mut(stream_id).expect("checked above");
            stream
                .credit_received(*amount)
                .expect("validated in phase 1");
            max_money_frames.push((*stream_id, stream.receive_max(), stream.total_received()));
            if let Some(nonce) = stream.receipt_nonce() {
                if let Ok(receipt) =
                    receipt::create(&nonce, *stream_id, stream.total_received(), &inner.receipt_secret)
                {
                    receipt_frames.push((*stream_id, receipt));
                }
            }
        }

        let mut max_data_frames: Vec<(u64, u64)> = Vec::new();
        let mut touched_data_streams: Vec<u64> = Vec::new();
        for (stream_id, offset, data) in &data_frames {
            if !inner.streams.contains_key(stream_id) {
                let (stream, handle) = Stream::new_incoming(*stream_id);
                inner.streams.insert(*stream_id, stream);
                newly_created_streams.push((*stream_id, handle));
            }
            let stream = inner.streams.get_mut(stream_id).expect("just inserted");
            if let Err(e) = stream.apply_incoming_data(*offset, data) {
                warn!("dropping bad StreamData frame: {}", e);
            }
            if !touched_data_streams.contains(stream_id) {
                touched_data_streams.push(*stream_id);
            }
        }
        for stream_id in &touched_data_streams {
            let stream = inner.streams.get(stream_id).expect("touched above");
            max_data_frames.push((
                *stream_id,
                stream.incoming_max_offset().saturating_add(STREAM_DATA_WINDOW),
            ));
        }

        let include_asset_details = !inner.sent_asset_details;
        inner.sent_asset_details = true;
        let my_asset_code = inner.asset_code.clone();
        let my_asset_scale = inner.asset_scale;
        let shared_secret = inner.shared_secret.clone();
        let sequence = stream_packet.sequence();
        let connection_max_data_in = inner.connection_max_data_in;
        drop(inner);

        for (stream_id, handle) in newly_created_streams {
            let stream_ref = StreamRef {
                connection: self.clone(),
                id: stream_id,
            };
            let _ = self.new_streams_tx.send((stream_ref, handle));
        }

        let mut frames: Vec<Frame> = Vec::new();
        if include_asset_details {
            frames.push(Frame::ConnectionAssetDetails(ConnectionAssetDetailsFrame {
                source_asset_code: &my_asset_code,
                source_asset_scale: my_asset_scale,
            }));
        }
        if !touched_data_streams.is_empty() {
            frames.push(Frame::ConnectionMaxData(ConnectionMaxDataFrame {
                max_offset: connection_max_data_in,
            }));
        }
        for (stream_id, receive_max, total_received) in &max_money_frames {
            frames.push(Frame::StreamMaxMoney(StreamMaxMoneyFrame {
                stream_id: *stream_id,
                receive_max: *receive_max,
                total_received: *total_received,
            }));
        }
        for (stream_id, max_offset) in &max_data_frames {
            frames.push(Frame::StreamMaxData(StreamMaxDataFrame {
                stream_id: *stream_id,
                max_offset: *max_offset,
            }));
        }
        for (stream_id, receipt) in &receipt_frames {
            frames.push(Frame::StreamReceipt(StreamReceiptFrame {
                stream_id: *stream_id,
                receipt,
            }));
        }

        let response_packet = StreamPacketBuilder {
            sequence,
            ilp_packet_type: IlpPacketType::Fulfill,
            prepare_amount: prepare.amount(),
            frames: &frames,
        }
        .build();
        let encrypted_response = response_packet.into_encrypted(&shared_secret);
        let fulfillment = generate_fulfillment(&shared_secret, prepare.data());
        Ok(FulfillBuilder {
            fulfillment: &fulfillment,
            data: &encrypted_response[..],
        }
        .build())
    }
}

impl<A: Account> Inner<A> {
    fn congestion_peek_max(&self) -> u64 {
        // Safe because the single-packet-in-flight invariant guarantees
        // amount_in_flight == 0 whenever plan_packet runs.
        self.congestion.max_amount_ceiling()
    }
}

fn min_precision_error() -> Error {
    Error::ConnectionError(
        "Unable to establish connection, no packets meeting the minimum exchange precision of 3 digits made it through the path.".to_string(),
    )
}

fn reject_application_error(local_address: &Address, data: &[u8]) -> Reject {
    RejectBuilder {
        code: IlpErrorCode::F99_APPLICATION_ERROR,
        message: &[],
        triggered_by: Some(local_address),
        data,
    }
    .build()
}

fn reject_with_max_money(
    shared_secret: &[u8],
    local_address: &Address,
    sequence: u64,
    stream_id: u64,
    receive_max: u64,
    total_received: u64,
) -> Reject {
    let frames = [Frame::StreamMaxMoney(StreamMaxMoneyFrame {
        stream_id,
        receive_max,
        total_received,
    })];
    let response_packet = StreamPacketBuilder {
        sequence,
        ilp_packet_type: IlpPacketType::Reject,
        prepare_amount: 0,
        frames: &frames,
    }
    .build();
    let encrypted = response_packet.into_encrypted(shared_secret);
    RejectBuilder {
        code: IlpErrorCode::F99_APPLICATION_ERROR,
        message: &[],
        triggered_by: Some(local_address),
        data: &encrypted[..],
    }
    .build()
}

/// Split `total` across `shares` proportionally, using integer floor
/// division with the remainder assigned to the lowest key — matching the
/// protocol's deterministic-remainder rule so both ends of a connection
/// land on the same allocation given the same shares.
fn apportion(total: u64, shares: &[(u64, u64)]) -> HashMap<u64, u64> {
    let mut result = HashMap::new();
    let sum_shares: u128 = shares.iter().map(|(_, s)| u128::from(*s)).sum();
    if sum_shares == 0 {
        return result;
    }
    let mut allocated: u128 = 0;
    let mut lowest_key: Option<u64> = None;
    for (key, share) in shares {
        let portion = (u128::from(total) * u128::from(*share) / sum_shares) as u64;
        allocated += u128::from(portion);
        *result.entry(*key).or_insert(0) += portion;
        if lowest_key.map_or(true, |k| *key < k) {
            lowest_key = Some(*key);
        }
    }
    if let Some(key) = lowest_key {
        let remainder = (u128::from(total) - allocated) as u64;
        *result.get_mut(&key).unwrap() += remainder;
    }
    result
}

impl<A: Account + Clone + Send + Sync + 'static> StreamRef<A> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn set_send_max(&self, send_max: u64) {
        let mut inner = self.connection.inner.lock().await;
        if let Some(stream) = inner.streams.get_mut(&self.id) {
            stream.set_send_max(send_max);
        }
        drop(inner);
        self.connection.notify.notify_one();
    }

    pub async fn set_receive_max(&self, receive_max: u64) {
        let mut inner = self.connection.inner.lock().await;
        if let Some(stream) = inner.streams.get_mut(&self.id) {
            stream.set_receive_max(receive_max);
        }
    }

    /// Opt this stream into receipt generation: the receiving side will
    /// attach an HMAC-signed receipt to the response of every Prepare that
    /// credits it from now on, retrievable via `receipt()`.
    pub async fn request_receipts(&self) {
        let nonce = random_nonce();
        let mut inner = self.connection.inner.lock().await;
        if let Some(stream) = inner.streams.get_mut(&self.id) {
            stream.request_receipts(nonce);
        }
    }

    pub async fn write(&self, data: Bytes) -> Result<(), Error> {
        let mut inner = self.connection.inner.lock().await;
        let stream = inner
            .streams
            .get_mut(&self.id)
            .ok_or_else(|| Error::ProtocolViolation("stream no longer exists".into()))?;
        stream.write(data)?;
        drop(inner);
        self.connection.notify.notify_one();
        Ok(())
    }

    pub async fn close(&self) {
        let mut inner = self.connection.inner.lock().await;
        if let Some(stream) = inner.streams.get_mut(&self.id) {
            stream.close();
        }
        drop(inner);
        self.connection.notify.notify_one();
    }

    pub async fn destroy(&self) {
        let mut inner = self.connection.inner.lock().await;
        if let Some(stream) = inner.streams.get_mut(&self.id) {
            stream.destroy();
        }
    }

    pub async fn state(&self) -> Option<StreamState> {
        self.connection
            .inner
            .lock()
            .await
            .streams
            .get(&self.id)
            .map(|s| s.state())
    }

    pub async fn total_sent(&self) -> u64 {
        self.connection
            .inner
            .lock()
            .await
            .streams
            .get(&self.id)
            .map_or(0, |s| s.total_sent())
    }

    pub async fn total_delivered(&self) -> u64 {
        self.connection
            .inner
            .lock()
            .await
            .streams
            .get(&self.id)
            .map_or(0, |s| s.total_delivered())
    }

    pub async fn receipt(&self) -> Option<Bytes> {
        self.connection
            .inner
            .lock()
            .await
            .streams
            .get(&self.id)
            .and_then(|s| s.receipt().cloned())
    }

    /// Convenience: `set_send_max(n)` then wait until at least `n` more has
    /// been sent (or the stream errors out).
    pub async fn send_total(&self, amount: u64) -> Result<(), Error> {
        let notify = {
            let mut inner = self.connection.inner.lock().await;
            let stream = inner
                .streams
                .get_mut(&self.id)
                .ok_or_else(|| Error::ProtocolViolation("stream no longer exists".into()))?;
            stream.request_send_total(amount)
        };
        self.connection.notify.notify_one();
        loop {
            {
                let inner = self.connection.inner.lock().await;
                let stream = inner
                    .streams
                    .get(&self.id)
                    .ok_or_else(|| Error::ProtocolViolation("stream no longer exists".into()))?;
                if let Some((code, message)) = stream.error() {
                    return Err(Error::SendMoneyError(format!("{:?}: {}", code, message)));
                }
                if stream.send_max() != UNBOUNDED
                    && stream.total_sent() + 0 >= stream.send_max()
                {
                    return Ok(());
                }
            }
            notify.notified().await;
        }
    }
}

fn random_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    SystemRandom::new()
        .fill(&mut nonce)
        .expect("failed to generate receipt nonce");
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apportion_floors_and_gives_remainder_to_lowest_stream_id() {
        let shares = vec![(5u64, 1u64), (2u64, 1u64), (3u64, 1u64)];
        let result = apportion(10, &shares);
        assert_eq!(result[&2], 4);
        assert_eq!(result[&3], 3);
        assert_eq!(result[&5], 3);
        assert_eq!(result.values().sum::<u64>(), 10);
    }

    #[test]
    fn apportion_with_no_shares_is_empty() {
        assert!(apportion(100, &[]).is_empty());
    }
}
