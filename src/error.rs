use thiserror::Error;

#[derive(Error, Debug)]
pub enum GossipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Multiple errors: {0}")]
    Aggregate(String),
}

impl GossipError {
    /// Join the per-target errors of one protocol phase into a single error,
    /// so one unreachable member does not abort the remaining sends.
    pub fn join(mut errors: Vec<GossipError>) -> Option<GossipError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(GossipError::Aggregate(joined))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, GossipError>;
