use super::packet::*;
use async_trait::async_trait;
use interledger_packet::*;
use interledger_service::*;
use log::debug;
use std::marker::PhantomData;

/// A simple service that intercepts incoming ILDCP requests
/// and responds using the information already present on the account
/// that made the request.
#[derive(Clone)]
pub struct IldcpService<I, A> {
    next: I,
    account_type: PhantomData<A>,
}

impl<I, A> IldcpService<I, A>
where
    I: IncomingService<A> + Clone + Send + Sync + 'static,
    A: Account + Clone + Send + Sync + 'static,
{
    pub fn new(next: I) -> Self {
        IldcpService {
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<I, A> IncomingService<A> for IldcpService<I, A>
where
    I: IncomingService<A> + Clone + Send + Sync + 'static,
    A: Account + Clone + Send + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        if is_ildcp_request(&request.prepare) {
            debug!(
                "Responding to ILDCP query from {} with address: {}",
                request.from.username(),
                request.from.ilp_address(),
            );
            let response = IldcpResponseBuilder {
                ilp_address: request.from.ilp_address(),
                asset_code: request.from.asset_code(),
                asset_scale: request.from.asset_scale(),
            }
            .build();
            Ok(Fulfill::from(response))
        } else {
            self.next.handle_request(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use bytes::Bytes;
    use std::convert::TryFrom;
    use std::time::SystemTime;

    #[tokio::test]
    async fn responds_with_account_address() {
        let mut service = test_service();
        let result = service
            .handle_request(IncomingRequest {
                from: USERNAME_ACC.clone(),
                prepare: PrepareBuilder {
                    destination: ILDCP_DESTINATION.clone(),
                    amount: 100,
                    execution_condition: &PEER_PROTOCOL_CONDITION,
                    expires_at: SystemTime::UNIX_EPOCH,
                    data: &[],
                }
                .build(),
            })
            .await;

        let fulfill = result.unwrap();
        let response = IldcpResponse::try_from(Bytes::from(fulfill.data().to_vec())).unwrap();
        assert_eq!(response.ilp_address(), USERNAME_ACC.ilp_address().clone());
        assert_eq!(response.asset_scale(), 9);
    }

    #[tokio::test]
    async fn passes_on_other_requests() {
        let mut service = test_service();
        let result = service
            .handle_request(IncomingRequest {
                from: USERNAME_ACC.clone(),
                prepare: PrepareBuilder {
                    destination: SERVICE_ADDRESS.clone(),
                    amount: 100,
                    execution_condition: &[0; 32],
                    expires_at: SystemTime::UNIX_EPOCH,
                    data: &[],
                }
                .build(),
            })
            .await;
        assert!(result.is_err());
    }
}
