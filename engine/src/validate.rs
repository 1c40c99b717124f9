//! Request validation.
//!
//! Checks run in a fixed order and the first failure wins:
//! version, hash algorithm and digest length, policy, extensions.
//! Validation only reads the request and the configuration.

use crate::config::{AuthorityConfig, NonCriticalExtensions};
use crate::response::FailureInfo;
use crate::rfc3161::{TimeStampReq, TSP_VERSION_1};

use const_oid::ObjectIdentifier;
use thiserror::Error;
use tsp_signer::HashAlgorithm;
use x509_cert::ext::Extension;

/// Why a request was turned away. Each maps to one PKIFailureInfo bit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("request could not be decoded")]
    Malformed,

    #[error("unsupported request version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown hash algorithm {0}")]
    UnknownHashAlgorithm(ObjectIdentifier),

    #[error("hash algorithm {0} is not accepted")]
    HashNotAllowed(HashAlgorithm),

    #[error("{algorithm} digest must be {expected} bytes, got {actual}")]
    DigestLength {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },

    #[error("policy {0} is not supported")]
    UnacceptedPolicy(ObjectIdentifier),

    #[error("request names no policy and no default is configured")]
    NoPolicy,

    #[error("critical extension {0} is not supported")]
    UnacceptedExtension(ObjectIdentifier),
}

impl RejectionReason {
    pub fn failure_info(&self) -> FailureInfo {
        match self {
            Self::Malformed => FailureInfo::BadDataFormat,
            Self::UnsupportedVersion(_) => FailureInfo::BadRequest,
            Self::UnknownHashAlgorithm(_) | Self::HashNotAllowed(_) => FailureInfo::BadAlg,
            Self::DigestLength { .. } => FailureInfo::BadDataFormat,
            Self::UnacceptedPolicy(_) | Self::NoPolicy => FailureInfo::UnacceptedPolicy,
            Self::UnacceptedExtension(_) => FailureInfo::UnacceptedExtension,
        }
    }
}

/// Result of matching the requested policy against the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// The request named a policy and the token carries it.
    RequestedPolicyHonored(ObjectIdentifier),
    /// The token carries the default policy. `requested` is the policy the
    /// request asked for, if any.
    DefaultPolicySubstituted {
        policy: ObjectIdentifier,
        requested: Option<ObjectIdentifier>,
    },
    /// No acceptable policy. Carries the requested one, if any.
    PolicyRejected(Option<ObjectIdentifier>),
}

impl PolicyOutcome {
    /// Policy the token is issued under.
    pub fn policy(&self) -> Option<ObjectIdentifier> {
        match self {
            Self::RequestedPolicyHonored(policy) => Some(*policy),
            Self::DefaultPolicySubstituted { policy, .. } => Some(*policy),
            Self::PolicyRejected(_) => None,
        }
    }

    /// True when a policy the caller explicitly asked for was replaced.
    pub fn is_modified(&self) -> bool {
        matches!(
            self,
            Self::DefaultPolicySubstituted {
                requested: Some(_),
                ..
            }
        )
    }
}

/// Decide which policy a request is issued under.
pub fn negotiate_policy(
    requested: Option<&ObjectIdentifier>,
    config: &AuthorityConfig,
) -> PolicyOutcome {
    match (requested, config.default_policy) {
        (Some(policy), _) if config.accepts_policy(policy) => {
            PolicyOutcome::RequestedPolicyHonored(*policy)
        }
        (Some(policy), Some(default)) if config.allow_policy_substitution => {
            PolicyOutcome::DefaultPolicySubstituted {
                policy: default,
                requested: Some(*policy),
            }
        }
        (Some(policy), _) => PolicyOutcome::PolicyRejected(Some(*policy)),
        (None, Some(default)) => PolicyOutcome::DefaultPolicySubstituted {
            policy: default,
            requested: None,
        },
        (None, None) => PolicyOutcome::PolicyRejected(None),
    }
}

/// A request that passed every check, with everything the builder needs.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub request: TimeStampReq,
    pub hash_algorithm: HashAlgorithm,
    pub policy: PolicyOutcome,
    /// Supported extensions, to be carried into the token.
    pub extensions: Vec<Extension>,
    /// Unsupported non-critical extensions were dropped and the
    /// configuration asks for that to be reported.
    pub extensions_modified: bool,
}

impl ValidatedRequest {
    /// The response status should be grantedWithMods.
    pub fn is_modified(&self) -> bool {
        self.policy.is_modified() || self.extensions_modified
    }
}

/// Validate `request` against `config`.
pub fn validate(
    request: TimeStampReq,
    config: &AuthorityConfig,
) -> Result<ValidatedRequest, RejectionReason> {
    if request.version != TSP_VERSION_1 {
        return Err(RejectionReason::UnsupportedVersion(request.version));
    }

    let hash_algorithm = check_hash(&request, config)?;

    let policy = negotiate_policy(request.req_policy.as_ref(), config);
    if let PolicyOutcome::PolicyRejected(requested) = &policy {
        return Err(match requested {
            Some(oid) => RejectionReason::UnacceptedPolicy(*oid),
            None => RejectionReason::NoPolicy,
        });
    }

    let mut extensions = Vec::new();
    let mut dropped = false;
    for ext in request.extensions() {
        if config.supported_extensions.contains(&ext.extn_id) {
            extensions.push(ext.clone());
        } else if ext.critical {
            return Err(RejectionReason::UnacceptedExtension(ext.extn_id));
        } else {
            tracing::debug!(oid = %ext.extn_id, "dropping unsupported non-critical extension");
            dropped = true;
        }
    }
    let extensions_modified =
        dropped && config.non_critical_extensions == NonCriticalExtensions::Report;

    Ok(ValidatedRequest {
        request,
        hash_algorithm,
        policy,
        extensions,
        extensions_modified,
    })
}

fn check_hash(
    request: &TimeStampReq,
    config: &AuthorityConfig,
) -> Result<HashAlgorithm, RejectionReason> {
    let oid = request.message_imprint.hash_algorithm.oid;
    let algorithm =
        HashAlgorithm::from_oid(&oid).ok_or(RejectionReason::UnknownHashAlgorithm(oid))?;
    if !config.hash_algorithms.contains(&algorithm) {
        return Err(RejectionReason::HashNotAllowed(algorithm));
    }

    let actual = request.message_imprint.digest().len();
    if actual != algorithm.digest_length() {
        return Err(RejectionReason::DigestLength {
            algorithm,
            expected: algorithm.digest_length(),
            actual,
        });
    }
    Ok(algorithm)
}
