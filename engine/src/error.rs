//! Error types for tsp-engine

use thiserror::Error;

/// Errors raised outside the request/response path.
///
/// Caller mistakes never surface here: they become rejection responses.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value is missing or malformed
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A TimeStampReq or TimeStampResp could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The issuance core failed
    #[error(transparent)]
    Signer(#[from] tsp_signer::Error),
}

/// Malformed DER input. Nothing partially decoded escapes with it.
#[derive(Error, Debug)]
#[error("malformed DER: {0}")]
pub struct DecodeError(#[from] pub der::Error);

/// Configuration failures, naming the offending setting.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("no policy is configured")]
    NoPolicy,

    /// Without a durable high-water mark a restart would reissue serials
    #[error("TSA_SERIAL_STATE_PATH is not set")]
    NoSerialState,

    #[error("serial state: {0}")]
    SerialState(#[from] tsp_signer::SerialError),
}

/// Result type for tsp-engine operations
pub type Result<T> = std::result::Result<T, Error>;
