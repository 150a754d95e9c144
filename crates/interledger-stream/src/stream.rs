//! Per-stream state: send/receive caps, accounting, data queues, close
//! state, and the outgoing event stream the application observes.
//!
//! A `Stream` is a plain, non-service struct mutated through explicit
//! methods, the same shape `congestion::CongestionController` already uses
//! (`prepare`/`fulfill`/`reject`) rather than a trait object the connection
//! has to poll. The `Connection` is the only thing that calls the
//! `connection`-facing methods below; the `application`-facing ones are what
//! `Connection::create_stream`'s caller gets.
use super::packet::ErrorCode as StreamErrorCode;
use super::reassembler::Reassembler;
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::{mpsc, Notify};

/// Sentinel meaning "no cap" for `send_max`/`receive_max`, matching the
/// wire's use of `2^64 - 1` for the same purpose (see `StreamMaxMoneyFrame`).
pub const UNBOUNDED: u64 = u64::max_value();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    SendClosed,
    RecvClosed,
    Closed,
}

impl StreamState {
    fn close_send(self) -> Self {
        match self {
            StreamState::Open => StreamState::SendClosed,
            StreamState::RecvClosed => StreamState::Closed,
            other => other,
        }
    }

    fn close_recv(self) -> Self {
        match self {
            StreamState::Open => StreamState::RecvClosed,
            StreamState::SendClosed => StreamState::Closed,
            other => other,
        }
    }
}

/// Observable events an application can subscribe to via
/// `Stream::subscribe`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MoneyReceived(u64),
    MoneySent(u64),
    OutgoingTotalSentChanged(u64),
    Data(Bytes),
    End,
    Error(StreamErrorCode, String),
}

/// Per-stream state, owned by the `Connection` it belongs to.
pub struct Stream {
    id: u64,
    send_max: u64,
    total_sent: u64,
    send_total_delivered: u64,
    holds: u64,
    receive_max: u64,
    total_received: u64,
    outgoing_data: VecDeque<(u64, Bytes)>,
    outgoing_offset: u64,
    outgoing_end_offset: Option<u64>,
    incoming_data: Reassembler,
    /// Highest offset the peer has told us (via `StreamMaxData`) we're
    /// allowed to write to. `UNBOUNDED` until the peer restricts it.
    remote_max_offset: u64,
    receipt_nonce: Option<[u8; 16]>,
    receipt_latest: Option<Bytes>,
    close_frame_sent: bool,
    state: StreamState,
    error: Option<(StreamErrorCode, String)>,
    events: mpsc::UnboundedSender<StreamEvent>,
    send_total_notify: std::sync::Arc<Notify>,
}

/// The application-facing handle returned by `Connection::create_stream`:
/// the `Stream` itself plus the receiving half of its event channel.
pub struct StreamHandle {
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Stream {
    pub(crate) fn new(id: u64) -> (Self, StreamHandle) {
        Self::with_receive_max(id, 0)
    }

    /// Create a stream the connection learned about from the peer (a
    /// `StreamMoney`/`StreamData` frame referencing an id never seen
    /// before), rather than one the local application opened. Defaults to
    /// an unbounded `receive_max`, matching the teacher's accept-all
    /// `StreamReceiverService`: the application only finds out about this
    /// stream via `accept_stream` *after* the Prepare that created it has
    /// already been credited, so a `0` default would reject every inbound
    /// stream's first payment before the application ever gets a chance to
    /// raise the cap.
    pub(crate) fn new_incoming(id: u64) -> (Self, StreamHandle) {
        Self::with_receive_max(id, UNBOUNDED)
    }

    fn with_receive_max(id: u64, receive_max: u64) -> (Self, StreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Stream {
                id,
                send_max: 0,
                total_sent: 0,
                send_total_delivered: 0,
                holds: 0,
                receive_max,
                total_received: 0,
                outgoing_data: VecDeque::new(),
                outgoing_offset: 0,
                outgoing_end_offset: None,
                incoming_data: Reassembler::new(),
                remote_max_offset: UNBOUNDED,
                receipt_nonce: None,
                receipt_latest: None,
                close_frame_sent: false,
                state: StreamState::Open,
                error: None,
                events: tx,
                send_total_notify: std::sync::Arc::new(Notify::new()),
            },
            StreamHandle { events: rx },
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn error(&self) -> Option<&(StreamErrorCode, String)> {
        self.error.as_ref()
    }

    // -- application-facing --------------------------------------------

    pub fn send_max(&self) -> u64 {
        self.send_max
    }

    /// Raise (or lower) the amount this stream is allowed to send, in
    /// addition to whatever has already been sent. Effective immediately on
    /// the next packet-planning pass.
    pub fn set_send_max(&mut self, send_max: u64) {
        self.send_max = send_max;
        self.send_total_notify.notify_one();
    }

    pub fn receive_max(&self) -> u64 {
        self.receive_max
    }

    pub fn set_receive_max(&mut self, receive_max: u64) {
        self.receive_max = receive_max;
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn total_delivered(&self) -> u64 {
        self.send_total_delivered
    }

    pub fn receipt(&self) -> Option<&Bytes> {
        self.receipt_latest.as_ref()
    }

    /// Opt this stream into receipt generation: the receiver will attach a
    /// signed receipt to the response of every Prepare that credits it.
    pub fn request_receipts(&mut self, nonce: [u8; 16]) {
        self.receipt_nonce = Some(nonce);
    }

    /// Queue bytes to send. Fails once the send side has been closed.
    pub fn write(&mut self, data: Bytes) -> Result<(), super::error::Error> {
        if matches!(self.state, StreamState::SendClosed | StreamState::Closed) {
            return Err(super::error::Error::ProtocolViolation(
                "cannot write to a stream whose send side is closed".into(),
            ));
        }
        let offset = self.outgoing_offset;
        self.outgoing_offset += data.len() as u64;
        self.outgoing_data.push_back((offset, data));
        Ok(())
    }

    /// Gracefully finish the send side: drain queued data/money, then mark
    /// no more bytes will ever be written.
    pub fn close(&mut self) {
        self.outgoing_end_offset = Some(self.outgoing_offset);
        self.state = self.state.close_send();
    }

    /// Abruptly tear the stream down; pending sends are discarded and an
    /// `ApplicationError` surfaces to the peer.
    pub fn destroy(&mut self) {
        self.state = StreamState::Closed;
        self.error = Some((
            StreamErrorCode::ApplicationError,
            "stream destroyed locally".to_string(),
        ));
        let _ = self
            .events
            .send(StreamEvent::Error(
                StreamErrorCode::ApplicationError,
                "stream destroyed locally".to_string(),
            ));
    }

    /// Convenience used by `Connection::send_total`: bump `send_max` to
    /// `total_sent + holds + amount` and asynchronously wait until at least
    /// `amount` more has been sent (or the stream errors out).
    pub fn request_send_total(&mut self, amount: u64) -> std::sync::Arc<Notify> {
        let target = self.total_sent.saturating_add(self.holds).saturating_add(amount);
        if target > self.send_max {
            self.set_send_max(target);
        }
        self.send_total_notify.clone()
    }

    // -- connection-facing ------------------------------------------------

    /// How much more this stream wants to send right now, net of anything
    /// already committed to an in-flight Prepare.
    pub(crate) fn sendable(&self) -> u64 {
        if self.send_max == UNBOUNDED {
            return UNBOUNDED;
        }
        self.send_max
            .saturating_sub(self.total_sent)
            .saturating_sub(self.holds)
    }

    /// Whether this stream has data queued that also fits inside the
    /// window the peer has most recently advertised via `StreamMaxData`.
    pub(crate) fn has_data_to_send(&self) -> bool {
        match self.outgoing_data.front() {
            Some((offset, _)) => *offset < self.remote_max_offset,
            None => false,
        }
    }

    pub(crate) fn remote_max_offset(&self) -> u64 {
        self.remote_max_offset
    }

    /// Record the peer's latest `StreamMaxData` window. Last-value-wins,
    /// matching `set_receive_max`'s treatment of `StreamMaxMoney`.
    pub(crate) fn set_remote_max_offset(&mut self, max_offset: u64) {
        self.remote_max_offset = max_offset;
    }

    /// Pull up to `max_bytes` of outgoing data starting at the front of the
    /// queue, clipped to the peer's advertised window, without removing it
    /// — removal happens only once the Prepare carrying it fulfills
    /// (`commit_data_sent`); on reject the bytes stay queued for
    /// retransmission on the next packet.
    pub(crate) fn peek_outgoing_data(&self, max_bytes: usize) -> Option<(u64, Bytes)> {
        let (offset, data) = self.outgoing_data.front()?;
        if *offset >= self.remote_max_offset {
            return None;
        }
        let window_room = (self.remote_max_offset - offset) as usize;
        let cap = max_bytes.min(window_room);
        if cap == 0 {
            return None;
        }
        if data.len() <= cap {
            Some((*offset, data.clone()))
        } else {
            Some((*offset, data.slice(0..cap)))
        }
    }

    pub(crate) fn is_send_finished(&self) -> bool {
        matches!(self.outgoing_end_offset, Some(end) if self.outgoing_offset == end)
            && self.outgoing_data.is_empty()
    }

    /// Whether the connection still owes the peer a `StreamClose` telling it
    /// this stream's send side has finished — true once every queued byte
    /// has been committed and no close frame has gone out yet.
    pub(crate) fn needs_close_frame(&self) -> bool {
        self.is_send_finished() && !self.close_frame_sent
    }

    pub(crate) fn mark_close_frame_sent(&mut self) {
        self.close_frame_sent = true;
    }

    pub(crate) fn commit_hold(&mut self, amount: u64) {
        self.holds += amount;
    }

    pub(crate) fn release_hold(&mut self, amount: u64) {
        self.holds = self.holds.saturating_sub(amount);
    }

    pub(crate) fn commit_money_sent(&mut self, amount: u64, delivered: u64) {
        self.holds = self.holds.saturating_sub(amount);
        self.total_sent += amount;
        self.send_total_delivered += delivered;
        let _ = self.events.send(StreamEvent::MoneySent(amount));
        let _ = self
            .events
            .send(StreamEvent::OutgoingTotalSentChanged(self.total_sent));
        if self.total_sent + self.holds >= self.send_max {
            self.send_total_notify.notify_one();
        }
    }

    pub(crate) fn commit_data_sent(&mut self, offset: u64, len: usize) {
        if let Some((front_offset, data)) = self.outgoing_data.front().cloned() {
            if front_offset == offset {
                if len >= data.len() {
                    self.outgoing_data.pop_front();
                } else {
                    let remaining = data.slice(len..);
                    self.outgoing_data[0] = (offset + len as u64, remaining);
                }
            }
        }
    }

    /// Apply a `StreamMoney` frame's resulting credit. Returns an error if
    /// it would exceed `receive_max` — the caller (the `Connection`) must
    /// treat this as fatal for the *whole Prepare*, per the spec's
    /// atomic-credit rule.
    pub(crate) fn credit_received(&mut self, amount: u64) -> Result<(), super::error::Error> {
        if self.total_received.saturating_add(amount) > self.receive_max {
            return Err(super::error::Error::FlowControlError(format!(
                "stream {} receive_max {} exceeded by additional {}",
                self.id, self.receive_max, amount
            )));
        }
        self.total_received += amount;
        let _ = self.events.send(StreamEvent::MoneyReceived(amount));
        Ok(())
    }

    pub(crate) fn apply_incoming_data(
        &mut self,
        offset: u64,
        data: &[u8],
    ) -> Result<(), super::error::Error> {
        self.incoming_data
            .push(offset, Bytes::copy_from_slice(data))
            .map_err(|e| super::error::Error::ProtocolViolation(e.to_string()))?;
        while let Some(chunk) = self.incoming_data.read() {
            let _ = self.events.send(StreamEvent::Data(chunk));
        }
        if self.incoming_data.is_complete() {
            self.state = self.state.close_recv();
            let _ = self.events.send(StreamEvent::End);
        }
        Ok(())
    }

    pub(crate) fn mark_final_offset(&mut self, end_offset: u64) {
        self.incoming_data.set_end_offset(end_offset);
    }

    pub(crate) fn incoming_max_offset(&self) -> u64 {
        self.incoming_data.max_offset()
    }

    pub(crate) fn receipt_nonce(&self) -> Option<[u8; 16]> {
        self.receipt_nonce
    }

    pub(crate) fn set_latest_receipt(&mut self, receipt: Bytes) {
        self.receipt_latest = Some(receipt);
    }

    pub(crate) fn apply_peer_close(&mut self, code: StreamErrorCode, message: String) {
        if code != StreamErrorCode::NoError {
            self.state = StreamState::Closed;
            self.error = Some((code.clone(), message.clone()));
            let _ = self.events.send(StreamEvent::Error(code, message));
        } else {
            self.state = self.state.close_recv();
            let _ = self.events.send(StreamEvent::End);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == StreamState::Closed && self.holds == 0
    }
}
