use b_x::BX;

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// An error occurred while reading from the downstream
    #[error("Error reading from downstream: {0}")]
    DownstreamRead(std::io::Error),

    /// An error occurred while writing to the downstream
    #[error("Error writing to downstream: {0}")]
    DownstreamWrite(std::io::Error),
}

impl From<ServeError> for BX {
    fn from(e: ServeError) -> Self {
        BX::from_err(e)
    }
}
