/// TimeStampResp construction and parsing.
///
/// TimeStampResp ::= SEQUENCE {
///     status          PKIStatusInfo,
///     timeStampToken  ContentInfo OPTIONAL
/// }
///
/// PKIStatusInfo ::= SEQUENCE {
///     status        PKIStatus,
///     statusString  PKIFreeText     OPTIONAL,
///     failInfo      PKIFailureInfo  OPTIONAL
/// }
use crate::error::DecodeError;

use cms::content_info::ContentInfo;
use der::asn1::BitString;
use der::{Decode, Encode, Sequence};
use std::fmt;

/// PKIStatus values per RFC 3161.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PkiStatus {
    Granted = 0,
    GrantedWithMods = 1,
    Rejection = 2,
    Waiting = 3,
    RevocationWarning = 4,
    RevocationNotification = 5,
}

impl PkiStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Granted,
            1 => Self::GrantedWithMods,
            2 => Self::Rejection,
            3 => Self::Waiting,
            4 => Self::RevocationWarning,
            5 => Self::RevocationNotification,
            _ => return None,
        })
    }

    /// Whether a token accompanies this status.
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted | Self::GrantedWithMods)
    }
}

/// PKIFailureInfo named bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureInfo {
    BadAlg,
    BadRequest,
    BadDataFormat,
    TimeNotAvailable,
    UnacceptedPolicy,
    UnacceptedExtension,
    AddInfoNotAvailable,
    SystemFailure,
}

impl FailureInfo {
    pub const ALL: [FailureInfo; 8] = [
        Self::BadAlg,
        Self::BadRequest,
        Self::BadDataFormat,
        Self::TimeNotAvailable,
        Self::UnacceptedPolicy,
        Self::UnacceptedExtension,
        Self::AddInfoNotAvailable,
        Self::SystemFailure,
    ];

    /// Bit position per RFC 3161 Section 2.4.2.
    pub fn bit(self) -> u32 {
        match self {
            Self::BadAlg => 0,
            Self::BadRequest => 2,
            Self::BadDataFormat => 5,
            Self::TimeNotAvailable => 14,
            Self::UnacceptedPolicy => 15,
            Self::UnacceptedExtension => 16,
            Self::AddInfoNotAvailable => 17,
            Self::SystemFailure => 25,
        }
    }

    pub fn from_bit(bit: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.bit() == bit)
    }

    /// Encode as a DER named-bit BIT STRING with only this bit set.
    ///
    /// DER drops trailing zero bits, so the string ends at the set bit.
    pub fn to_bit_string(self) -> der::Result<BitString> {
        let bit = self.bit();
        let byte_index = (bit / 8) as usize;
        let mut value = vec![0u8; byte_index + 1];
        value[byte_index] = 1 << (7 - bit % 8);
        BitString::new((7 - bit % 8) as u8, value)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BadAlg => "badAlg",
            Self::BadRequest => "badRequest",
            Self::BadDataFormat => "badDataFormat",
            Self::TimeNotAvailable => "timeNotAvailable",
            Self::UnacceptedPolicy => "unacceptedPolicy",
            Self::UnacceptedExtension => "unacceptedExtension",
            Self::AddInfoNotAvailable => "addInfoNotAvailable",
            Self::SystemFailure => "systemFailure",
        }
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PkiStatusInfo {
    pub status: u8,
    /// PKIFreeText: SEQUENCE OF UTF8String
    #[asn1(optional = "true")]
    pub status_string: Option<Vec<String>>,
    #[asn1(optional = "true")]
    pub fail_info: Option<BitString>,
}

impl PkiStatusInfo {
    pub fn status(&self) -> Option<PkiStatus> {
        PkiStatus::from_u8(self.status)
    }

    /// Every named failure bit set in failInfo.
    pub fn failure_info(&self) -> Vec<FailureInfo> {
        self.fail_info
            .iter()
            .flat_map(|bits| bits.bits().enumerate())
            .filter(|(_, set)| *set)
            .filter_map(|(bit, _)| FailureInfo::from_bit(bit as u32))
            .collect()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampResp {
    pub status: PkiStatusInfo,
    #[asn1(optional = "true")]
    pub time_stamp_token: Option<ContentInfo>,
}

impl TimeStampResp {
    /// A response carrying `token`.
    pub fn granted(token: ContentInfo, with_mods: bool) -> Self {
        let status = if with_mods {
            PkiStatus::GrantedWithMods
        } else {
            PkiStatus::Granted
        };
        Self {
            status: PkiStatusInfo {
                status: status as u8,
                status_string: None,
                fail_info: None,
            },
            time_stamp_token: Some(token),
        }
    }

    /// A status-only rejection.
    pub fn rejection(failure: FailureInfo, status_string: Option<String>) -> der::Result<Self> {
        Ok(Self {
            status: PkiStatusInfo {
                status: PkiStatus::Rejection as u8,
                status_string: status_string.map(|s| vec![s]),
                fail_info: Some(failure.to_bit_string()?),
            },
            time_stamp_token: None,
        })
    }
}

/// Encode a TimeStampResp as DER (`application/timestamp-reply`).
pub fn encode_response(resp: &TimeStampResp) -> der::Result<Vec<u8>> {
    resp.to_der()
}

/// Decode a DER TimeStampResp.
pub fn decode_response(bytes: &[u8]) -> Result<TimeStampResp, DecodeError> {
    Ok(TimeStampResp::from_der(bytes)?)
}

/// Minimal rejection used when even the regular rejection cannot be encoded.
///
/// SEQUENCE { SEQUENCE { INTEGER 2, BIT STRING systemFailure } }
pub const SYSTEM_FAILURE_RESPONSE: &[u8] = &[
    0x30, 0x0C, 0x30, 0x0A, 0x02, 0x01, 0x02, 0x03, 0x05, 0x06, 0x00, 0x00, 0x00, 0x40,
];

/// Lifecycle of one request through the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Received,
    Validating,
    Rejected,
    Building,
    Signing,
    SignFailed,
    Issued,
}

impl IssuanceState {
    pub fn can_transition_to(self, next: IssuanceState) -> bool {
        use IssuanceState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Received, Rejected)
                | (Validating, Rejected)
                | (Validating, Building)
                | (Building, Signing)
                | (Building, SignFailed)
                | (Signing, SignFailed)
                | (Signing, Issued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::SignFailed | Self::Issued)
    }
}
