//! Error types for tsp-signer

use thiserror::Error;

/// Errors raised while issuing a timestamp token.
#[derive(Error, Debug)]
pub enum Error {
    /// The time source could not produce a trusted time
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// The serial allocator could not issue a serial number
    #[error(transparent)]
    Serial(#[from] SerialError),

    /// Producing the signed envelope failed
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// The signing identity is unusable
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// DER encoding/decoding error
    #[error("ASN.1 error: {0}")]
    Asn1(#[from] der::Error),
}

/// Time source failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// The clock has not been synchronized against a trusted reference
    #[error("time source not synchronized")]
    Unavailable,

    /// The system clock reports a time before the Unix epoch
    #[error("system clock is before the Unix epoch")]
    BeforeEpoch,
}

/// Serial number allocation failures.
#[derive(Error, Debug)]
pub enum SerialError {
    /// The persistent counter state could not be read or written
    #[error("serial state store failed: {0}")]
    Store(#[from] std::io::Error),

    /// The persistent counter state exists but cannot be parsed
    #[error("serial state is corrupt: {0}")]
    Corrupt(String),

    /// The numeric range is used up
    #[error("serial number range exhausted")]
    Exhausted,
}

/// Failures while producing the signed envelope.
#[derive(Error, Debug)]
pub enum SigningError {
    /// genTime falls outside the signing certificate's validity window
    #[error("signing certificate is not valid at genTime")]
    ExpiredSigner,

    /// The key backend cannot be reached
    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),

    /// The identity's signature algorithm is not in the configured allow-list
    #[error("signature algorithm {0} is not allowed")]
    DisallowedAlgorithm(String),

    /// The key is malformed
    #[error("invalid private key")]
    InvalidKey,

    /// The backend returned an error while signing
    #[error("signing backend failed: {0}")]
    Backend(String),

    /// The envelope could not be encoded
    #[error("envelope encoding failed: {0}")]
    Encoding(#[from] der::Error),

    /// An envelope failed verification
    #[error("envelope verification failed: {0}")]
    Verification(String),
}

/// Problems with a signing identity's certificate chain.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// The backend did not provide any certificate
    #[error("signing identity has no certificate")]
    EmptyChain,

    /// The leaf certificate could not be processed
    #[error("invalid signing certificate: {0}")]
    InvalidCertificate(String),

    /// The leaf certificate's extended key usage is not timeStamping only
    #[error("signing certificate key usage: {0}")]
    KeyUsage(String),

    /// The provider could not supply an identity
    #[error("signing identity unavailable: {0}")]
    Unavailable(String),
}

impl From<der::Error> for IdentityError {
    fn from(e: der::Error) -> Self {
        IdentityError::InvalidCertificate(e.to_string())
    }
}

/// Result type for tsp-signer operations
pub type Result<T> = std::result::Result<T, Error>;
