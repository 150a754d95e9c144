//! # interledger-ildcp
//!
//! Client and server implementations of the Interledger Dynamic Configuration
//! Protocol (ILDCP), used to fetch `{clientAddress, assetCode, assetScale}`
//! for an account from its peer over a single zero-amount Prepare.

mod client;
mod packet;
mod server;
mod store;

#[cfg(test)]
mod test_helpers;

pub use client::get_ildcp_info;
pub use packet::*;
pub use server::IldcpService;
pub use store::{AccountDetails, IldcpStore};
