/// Errors returned by the on-chain and off-chain readers.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Off-chain token data is not available yet.
    #[error("token data not ready")]
    TokenDataNotReady,
    /// The reader does not know the requested item.
    #[error("{0} not found")]
    NotFound(String),
    /// An internal error occurred.
    #[error(transparent)]
    Internal(#[from] eyre::Error),
}
