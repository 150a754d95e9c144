//! # interledger-packet
//!
//! Interledger packet serialization/deserialization.

mod address;

mod error;
mod errors;
#[cfg(test)]
mod fixtures;
pub mod hex;
pub mod oer;
mod packet;

pub use self::address::{Address, AddressError};
pub use self::error::{ErrorClass, ErrorCode};
pub use self::errors::ParseError;

pub use self::packet::MaxPacketAmountDetails;
pub use self::packet::{Fulfill, Packet, PacketType, Prepare, Reject};
pub use self::packet::{FulfillBuilder, PrepareBuilder, RejectBuilder};
