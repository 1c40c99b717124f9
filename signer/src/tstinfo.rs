//! RFC 3161 TSTInfo: the to-be-signed payload of a timestamp token.
//!
//! ```text
//! TSTInfo ::= SEQUENCE {
//!     version         INTEGER { v1(1) },
//!     policy          TSAPolicyId,
//!     messageImprint  MessageImprint,
//!     serialNumber    INTEGER,
//!     genTime         GeneralizedTime,
//!     accuracy        Accuracy                OPTIONAL,
//!     ordering        BOOLEAN                 DEFAULT FALSE,
//!     nonce           INTEGER                 OPTIONAL,
//!     tsa             [0] GeneralName         OPTIONAL,
//!     extensions      [1] IMPLICIT Extensions OPTIONAL }
//! ```

use crate::serial::SerialNumber;
use crate::time::Timestamp;

use const_oid::ObjectIdentifier;
use der::asn1::{Int, OctetString};
use der::{Decode, Encode, Sequence};
use std::time::Duration;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::Extensions;
use x509_cert::name::Name;
use x509_cert::spki::AlgorithmIdentifierOwned;

/// TSTInfo.version
pub const TST_INFO_V1: u8 = 1;

/// id-ct-TSTInfo: 1.2.840.113549.1.9.16.1.4
pub const OID_CT_TST_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");

fn default_false() -> bool {
    false
}

/// The digest being timestamped, with the algorithm that produced it.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct MessageImprint {
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub hashed_message: OctetString,
}

impl MessageImprint {
    pub fn new(algorithm: ObjectIdentifier, digest: &[u8]) -> der::Result<Self> {
        Ok(Self {
            hash_algorithm: AlgorithmIdentifierOwned {
                oid: algorithm,
                parameters: None,
            },
            hashed_message: OctetString::new(digest)?,
        })
    }

    pub fn digest(&self) -> &[u8] {
        self.hashed_message.as_bytes()
    }
}

/// Bound on genTime precision.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Accuracy {
    #[asn1(optional = "true")]
    pub seconds: Option<u32>,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "IMPLICIT")]
    pub millis: Option<u16>,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "IMPLICIT")]
    pub micros: Option<u16>,
}

impl Accuracy {
    /// Express `d` at millisecond granularity; `None` for a zero bound.
    pub fn from_duration(d: Duration) -> Option<Self> {
        let ms = d.as_millis();
        if ms == 0 {
            return None;
        }
        let seconds = u32::try_from(ms / 1000).unwrap_or(u32::MAX);
        let millis = (ms % 1000) as u16;
        Some(Self {
            seconds: (seconds != 0).then_some(seconds),
            millis: (millis != 0).then_some(millis),
            micros: None,
        })
    }
}

/// Timestamp token payload.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TstInfo {
    pub version: u8,
    pub policy: ObjectIdentifier,
    pub message_imprint: MessageImprint,
    pub serial_number: u64,
    pub gen_time: Timestamp,
    #[asn1(optional = "true")]
    pub accuracy: Option<Accuracy>,
    #[asn1(default = "default_false")]
    pub ordering: bool,
    #[asn1(optional = "true")]
    pub nonce: Option<Int>,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub tsa: Option<GeneralName>,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "IMPLICIT")]
    pub extensions: Option<Extensions>,
}

/// Inputs to [`build_tstinfo`].
pub struct TstInfoParams<'a> {
    /// Policy under which the token is issued.
    pub policy: ObjectIdentifier,
    /// Copied verbatim from the request.
    pub message_imprint: &'a MessageImprint,
    pub serial_number: SerialNumber,
    pub gen_time: Timestamp,
    pub accuracy: Duration,
    pub ordering: bool,
    /// Copied verbatim from the request.
    pub nonce: Option<&'a Int>,
    /// Issuing authority, as a directory name.
    pub tsa_name: Option<&'a Name>,
    /// Extensions the authority supports and echoes.
    pub extensions: &'a [x509_cert::ext::Extension],
}

/// A TSTInfo together with its canonical DER encoding.
///
/// The encoding is computed once; the signature and the envelope both use
/// exactly these bytes.
#[derive(Clone, Debug)]
pub struct UnsignedToken {
    tst_info: TstInfo,
    der: Vec<u8>,
}

impl UnsignedToken {
    pub fn tst_info(&self) -> &TstInfo {
        &self.tst_info
    }

    pub fn gen_time(&self) -> Timestamp {
        self.tst_info.gen_time
    }

    pub fn serial_number(&self) -> u64 {
        self.tst_info.serial_number
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// Decode a TSTInfo and keep the bytes it came from.
    pub fn from_der(der: &[u8]) -> der::Result<Self> {
        Ok(Self {
            tst_info: TstInfo::from_der(der)?,
            der: der.to_vec(),
        })
    }
}

/// Build a DER-encoded TSTInfo structure.
pub fn build_tstinfo(params: &TstInfoParams) -> der::Result<UnsignedToken> {
    let tst_info = TstInfo {
        version: TST_INFO_V1,
        policy: params.policy,
        message_imprint: params.message_imprint.clone(),
        serial_number: params.serial_number.get(),
        gen_time: params.gen_time,
        accuracy: Accuracy::from_duration(params.accuracy),
        ordering: params.ordering,
        nonce: params.nonce.cloned(),
        tsa: params
            .tsa_name
            .map(|name| GeneralName::DirectoryName(name.clone())),
        extensions: (!params.extensions.is_empty()).then(|| params.extensions.to_vec()),
    };
    let der = tst_info.to_der()?;
    Ok(UnsignedToken { tst_info, der })
}
