//! # interledger-stream
//!
//! Client and server implementations of the STREAM transport protocol:
//! multiplexed byte streams and money transfer carried inside encrypted
//! ILP Prepare/Fulfill packets, with per-stream flow control, path maximum
//! packet amount discovery, exchange-rate tracking, and HMAC receipts.

mod client;
mod congestion;
mod connection;
mod crypto;
mod error;
mod packet;
mod reassembler;
mod receipt;
mod server;
mod stream;

#[cfg(test)]
mod test_helpers;

pub use client::{connect, send_money, StreamDelivery};
pub use connection::{Connection, ConnectionConfig, StreamRef};
pub use error::Error;
pub use packet::ErrorCode;
pub use receipt::{
    create as create_receipt, decode as decode_receipt, verify as verify_receipt, Receipt,
    ReceiptError, RECEIPT_LENGTH,
};
pub use server::{
    ConnectionGenerator, ConnectionPool, IncomingConnections, InvalidConnectionTag,
    PaymentNotification, StreamNotificationsStore,
};
pub use stream::{StreamEvent, StreamHandle, StreamState};
