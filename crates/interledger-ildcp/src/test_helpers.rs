use super::*;
use interledger_packet::{Address, ErrorCode, RejectBuilder};
use interledger_service::{incoming_service_fn, Account, IncomingService, Username};
use once_cell::sync::Lazy;
use std::str::FromStr;
use uuid::Uuid;

pub static SERVICE_ADDRESS: Lazy<Address> =
    Lazy::new(|| Address::from_str("example.connector").unwrap());
pub static USERNAME_ACC: Lazy<TestAccount> =
    Lazy::new(|| TestAccount::new("ausername", "example.connector.ausername"));

#[derive(Debug, Clone)]
pub struct TestAccount {
    pub id: Uuid,
    pub username: Username,
    pub ilp_address: Address,
}

impl TestAccount {
    pub fn new(username: &str, ilp_address: &str) -> Self {
        TestAccount {
            id: Uuid::new_v4(),
            username: Username::from_str(username).unwrap(),
            ilp_address: Address::from_str(ilp_address).unwrap(),
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
        9
    }

    fn asset_code(&self) -> &str {
        "XYZ"
    }
}

pub fn test_service() -> IldcpService<impl IncomingService<TestAccount> + Clone, TestAccount> {
    IldcpService::new(incoming_service_fn(|_request| {
        Err(RejectBuilder {
            code: ErrorCode::F02_UNREACHABLE,
            message: b"No other incoming handler!",
            data: &[],
            triggered_by: Some(&SERVICE_ADDRESS),
        }
        .build())
    }))
}
