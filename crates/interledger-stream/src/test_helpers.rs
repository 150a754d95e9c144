use interledger_packet::Address;
use interledger_service::{Account, Username};
use std::str::FromStr;
use uuid::Uuid;

pub static EXAMPLE_CONNECTOR: &str = "example.connector";

/// A bare-bones `Account` used by this crate's tests. Asset details and
/// address are configurable because the connection handshake and exchange
/// rate math both depend on the two sides disagreeing (or not) about scale.
#[derive(Debug, Clone)]
pub struct TestAccount {
    pub id: Uuid,
    pub ilp_address: Address,
    pub asset_code: String,
    pub asset_scale: u8,
}

impl TestAccount {
    pub fn new(ilp_address: Address, asset_code: &str, asset_scale: u8) -> Self {
        TestAccount {
            id: Uuid::new_v4(),
            ilp_address,
            asset_code: asset_code.to_string(),
            asset_scale,
        }
    }
}

impl Default for TestAccount {
    fn default() -> Self {
        TestAccount::new(
            Address::from_str("example.connector.alice").unwrap(),
            "XYZ",
            9,
        )
    }
}

impl Account for TestAccount {
    fn id(&self) -> Uuid {
        self.id
    }

    fn username(&self) -> &Username {
        static USERNAME: once_cell::sync::Lazy<Username> =
            once_cell::sync::Lazy::new(|| Username::from_str("alice").unwrap());
        &USERNAME
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
