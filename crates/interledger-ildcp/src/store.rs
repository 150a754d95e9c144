use async_trait::async_trait;
use interledger_packet::Address;
use uuid::Uuid;

/// The account details assigned to a peer via ILDCP.
pub struct AccountDetails {
    pub client_address: Address,
    pub asset_scale: u8,
    pub asset_code: String,
}

/// A store capable of looking up the [`AccountDetails`](./struct.AccountDetails.html)
/// that should be returned for a given account id.
#[async_trait]
pub trait IldcpStore {
    async fn get_account_details(&self, account_id: Uuid) -> Result<AccountDetails, ()>;
}
