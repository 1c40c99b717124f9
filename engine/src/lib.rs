//! RFC 3161 time-stamp authority engine.
//!
//! Takes DER `TimeStampReq` bytes and returns DER `TimeStampResp` bytes.
//! Transport (HTTP, media types, content negotiation) stays with the caller.
//! Token issuance itself lives in `tsp-signer`.

pub mod authority;
pub mod builder;
pub mod config;
pub mod error;
pub mod response;
pub mod rfc3161;
pub mod validate;

pub use crate::authority::{IssueError, Outcome, TimestampAuthority};
pub use crate::config::{AuthorityConfig, NonCriticalExtensions};
pub use crate::error::{ConfigError, DecodeError, Error, Result};
pub use crate::response::{
    decode_response, encode_response, FailureInfo, PkiStatus, PkiStatusInfo, TimeStampResp,
};
pub use crate::rfc3161::{decode_request, encode_request, TimeStampReq};
pub use crate::validate::{PolicyOutcome, RejectionReason, ValidatedRequest};
