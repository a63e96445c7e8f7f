/// Errors returned by operations on an open connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection has already closed.
    #[error("connection closed")]
    Closed,

    /// The connection is between transports and the send asked not to wait.
    #[error("connection suspended while reconnecting")]
    Suspended,

    /// The close code cannot be expressed on this connection's wire format.
    #[error("close code {0} cannot be sent on this connection")]
    InvalidCloseCode(i32),

    /// Writing to the underlying transport failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),
}

/// Errors from listening for or opening physical connections.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the listening socket failed.
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Accepting or upgrading an incoming connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Opening an outgoing connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),
}
