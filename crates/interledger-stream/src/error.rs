/// Stream Errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error connecting: {0}")]
    ConnectionError(String),
    #[error("Error polling: {0}")]
    PollError(String),
    #[error("Error polling: {0}")]
    SendMoneyError(String),
    #[error("Error maximum time exceeded: {0}")]
    TimeoutError(String),
    #[error("Receipt error: {0}")]
    ReceiptError(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Flow control error: {0}")]
    FlowControlError(String),
}
