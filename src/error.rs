#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("Binding is already taken")]
    BindingConflict,
    #[error("No free TCP port available")]
    NoFreePortAvailable,
    #[error("Timed out waiting for proxy connection")]
    ProxyTimeout,
    #[error("Control connection closed before proxy connection arrived")]
    ProxyConnectionClosed,
    #[error("Unknown client")]
    UnknownClient,
    #[error("Duplicate request ID")]
    DuplicateRequestId,
    #[error("Pending proxy request not found")]
    PendingRequestNotFound,
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
