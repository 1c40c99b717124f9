//! RFC 3161 TimeStampReq codec.
//!
//! ```text
//! TimeStampReq ::= SEQUENCE {
//!     version         INTEGER { v1(1) },
//!     messageImprint  MessageImprint,
//!     reqPolicy       TSAPolicyId              OPTIONAL,
//!     nonce           INTEGER                  OPTIONAL,
//!     certReq         BOOLEAN                  DEFAULT FALSE,
//!     extensions      [0] IMPLICIT Extensions  OPTIONAL }
//! ```
//!
//! Decoding is strict DER: truncated input, unexpected tags and trailing
//! bytes after the outer SEQUENCE are all errors.

use crate::error::DecodeError;

use const_oid::ObjectIdentifier;
use der::asn1::Int;
use der::{Decode, Encode, Sequence};
use tsp_signer::MessageImprint;
use x509_cert::ext::{Extension, Extensions};

/// TimeStampReq.version accepted by this authority.
pub const TSP_VERSION_1: u32 = 1;

fn default_false() -> bool {
    false
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampReq {
    pub version: u32,
    pub message_imprint: MessageImprint,
    #[asn1(optional = "true")]
    pub req_policy: Option<ObjectIdentifier>,
    #[asn1(optional = "true")]
    pub nonce: Option<Int>,
    #[asn1(default = "default_false")]
    pub cert_req: bool,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "IMPLICIT")]
    pub extensions: Option<Extensions>,
}

impl TimeStampReq {
    /// A v1 request for `message_imprint` with every optional field absent.
    pub fn new(message_imprint: MessageImprint) -> Self {
        Self {
            version: TSP_VERSION_1,
            message_imprint,
            req_policy: None,
            nonce: None,
            cert_req: false,
            extensions: None,
        }
    }

    pub fn with_policy(mut self, policy: ObjectIdentifier) -> Self {
        self.req_policy = Some(policy);
        self
    }

    pub fn with_nonce(mut self, nonce: Int) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_cert_req(mut self, cert_req: bool) -> Self {
        self.cert_req = cert_req;
        self
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extensions.get_or_insert_with(Vec::new).push(extension);
        self
    }

    /// Request extensions, empty when absent.
    pub fn extensions(&self) -> &[Extension] {
        self.extensions.as_deref().unwrap_or(&[])
    }
}

/// Decode a DER TimeStampReq (`application/timestamp-query`).
pub fn decode_request(bytes: &[u8]) -> Result<TimeStampReq, DecodeError> {
    Ok(TimeStampReq::from_der(bytes)?)
}

/// Encode a TimeStampReq as DER.
pub fn encode_request(req: &TimeStampReq) -> der::Result<Vec<u8>> {
    req.to_der()
}
