use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token length of {bytes} bytes is below the minimum of {minimum} bytes")]
    InsufficientEntropy { bytes: usize, minimum: usize },
}

pub type TokenResult<T> = std::result::Result<T, TokenError>;
