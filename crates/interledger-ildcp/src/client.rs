use super::packet::*;
use interledger_service::*;
use log::{error, trace};
use std::convert::TryFrom;

/// Look up the ILP address, asset code, and asset scale assigned to `account` by
/// sending it an ILDCP request over the given service.
pub async fn get_ildcp_info<S, A>(service: &mut S, account: A) -> Result<IldcpResponse, ()>
where
    S: IncomingService<A>,
    A: Account,
{
    let prepare = IldcpRequest::new().to_prepare();
    let fulfill = service
        .handle_request(IncomingRequest {
            from: account,
            prepare,
        })
        .await
        .map_err(|err| error!("Error getting ILDCP info: {:?}", err))?;

    let response = IldcpResponse::try_from(fulfill.into_data().freeze()).map_err(|err| {
        error!(
            "Unable to parse ILDCP response from fulfill packet: {:?}",
            err
        );
    })?;
    trace!("Got ILDCP response: {:?}", response);
    Ok(response)
}
