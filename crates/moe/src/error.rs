use thiserror::Error;

/// Errors raised by the routing layers.
///
/// Configuration problems surface at construction; the only runtime check is
/// the presence of token ids for hash routing, which happens before any tensor
/// work. Expert overflow is never reported as an error.
#[derive(Debug, Error)]
pub enum MoeError {
    #[error("unknown router '{0}', expected \"hash\" or \"linear\"")]
    InvalidRouter(String),

    #[error("invalid routing parameters: {0}")]
    InvalidRouting(String),

    #[error("invalid moe configuration: {0}")]
    Config(String),

    #[error("hash routing requires input token ids")]
    MissingTokenIds,

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MoeError>;
