//! The time-stamp authority: one DER request in, one DER response out.
//!
//! Decode, validate, then (only for valid requests) read the clock, take a
//! serial, build the TSTInfo and sign it. Rejections never reach the
//! allocator or the signer. genTime and serial are taken together, so serial
//! order and genTime order never disagree, and an unavailable time source
//! leaves the counter untouched.

use crate::builder::{build, BuildError};
use crate::config::AuthorityConfig;
use crate::response::{
    encode_response, FailureInfo, IssuanceState, TimeStampResp, SYSTEM_FAILURE_RESPONSE,
};
use crate::rfc3161::{decode_request, TimeStampReq};
use crate::validate::{validate, RejectionReason, ValidatedRequest};

use std::sync::Arc;
use thiserror::Error;
use tsp_signer::{
    Clock, IdentityProvider, SerialAllocator, SignedEnvelope, Signer, SigningIdentity,
    UnsignedToken,
};

/// Why a valid request still produced no token.
#[derive(Error, Debug)]
pub enum IssueError {
    #[error(transparent)]
    Signer(#[from] tsp_signer::Error),

    #[error(transparent)]
    Build(#[from] BuildError),
}

impl IssueError {
    pub fn failure_info(&self) -> FailureInfo {
        match self {
            Self::Signer(tsp_signer::Error::Clock(_)) => FailureInfo::TimeNotAvailable,
            _ => FailureInfo::SystemFailure,
        }
    }
}

/// Terminal state of one request.
#[derive(Debug)]
pub enum Outcome {
    /// Caller-caused; status-only response.
    Rejected(RejectionReason),
    /// Authority-caused; status-only response.
    SignFailed(IssueError),
    /// A signed token. `modified` selects grantedWithMods.
    Issued {
        envelope: SignedEnvelope,
        modified: bool,
    },
}

impl Outcome {
    pub fn state(&self) -> IssuanceState {
        match self {
            Self::Rejected(_) => IssuanceState::Rejected,
            Self::SignFailed(_) => IssuanceState::SignFailed,
            Self::Issued { .. } => IssuanceState::Issued,
        }
    }

    pub fn failure_info(&self) -> Option<FailureInfo> {
        match self {
            Self::Rejected(reason) => Some(reason.failure_info()),
            Self::SignFailed(e) => Some(e.failure_info()),
            Self::Issued { .. } => None,
        }
    }

    /// Map the outcome to PKIStatus/PKIFailureInfo.
    ///
    /// Rejections explain themselves in statusString; system failures
    /// only name the failure class.
    pub fn into_response(self) -> der::Result<TimeStampResp> {
        match self {
            Self::Issued { envelope, modified } => {
                Ok(TimeStampResp::granted(envelope.into_content_info(), modified))
            }
            Self::Rejected(reason) => {
                TimeStampResp::rejection(reason.failure_info(), Some(reason.to_string()))
            }
            Self::SignFailed(e) => {
                let failure = e.failure_info();
                let text = match failure {
                    FailureInfo::TimeNotAvailable => "time source unavailable",
                    _ => "internal error",
                };
                TimeStampResp::rejection(failure, Some(text.to_string()))
            }
        }
    }
}

/// Tracks a request through [`IssuanceState`].
struct Progress {
    state: IssuanceState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: IssuanceState::Received,
        }
    }

    fn enter(&mut self, next: IssuanceState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(from = ?self.state, to = ?next, "request state");
        self.state = next;
    }
}

/// RFC 3161 time-stamp authority.
///
/// Requests are independent; share one instance across threads. The serial
/// allocator is the only state that changes between requests.
pub struct TimestampAuthority {
    config: AuthorityConfig,
    serials: SerialAllocator,
    clock: Arc<dyn Clock>,
    identities: Arc<dyn IdentityProvider>,
    signer: Signer,
}

impl TimestampAuthority {
    pub fn new(
        config: AuthorityConfig,
        serials: SerialAllocator,
        clock: Arc<dyn Clock>,
        identities: Arc<dyn IdentityProvider>,
    ) -> Self {
        let signer = Signer::new(config.signature_algorithms.clone());
        Self {
            config,
            serials,
            clock,
            identities,
            signer,
        }
    }

    /// Check `config` and open the serial allocator it describes.
    ///
    /// Unusable serial state is fatal: no authority is returned.
    pub fn from_config(
        config: AuthorityConfig,
        clock: Arc<dyn Clock>,
        identities: Arc<dyn IdentityProvider>,
    ) -> crate::Result<Self> {
        config.check()?;
        let serials = config.open_serial_allocator()?;
        tracing::info!(
            next_serial = serials.current(),
            policy = ?config.default_policy,
            "time-stamp authority ready"
        );
        Ok(Self::new(config, serials, clock, identities))
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    /// Answer a DER TimeStampReq with a DER TimeStampResp.
    pub fn respond(&self, request_der: &[u8]) -> Vec<u8> {
        let outcome = self.process(request_der);
        match outcome.into_response().and_then(|resp| encode_response(&resp)) {
            Ok(der) => der,
            Err(e) => {
                tracing::error!(error = %e, "response encoding failed");
                SYSTEM_FAILURE_RESPONSE.to_vec()
            }
        }
    }

    /// Run a DER request through the pipeline.
    pub fn process(&self, request_der: &[u8]) -> Outcome {
        let mut progress = Progress::new();
        match decode_request(request_der) {
            Ok(request) => self.run(request, progress),
            Err(e) => {
                tracing::warn!(error = %e, "rejecting malformed request");
                progress.enter(IssuanceState::Rejected);
                Outcome::Rejected(RejectionReason::Malformed)
            }
        }
    }

    /// Run an already decoded request through the pipeline.
    pub fn issue(&self, request: TimeStampReq) -> Outcome {
        self.run(request, Progress::new())
    }

    fn run(&self, request: TimeStampReq, mut progress: Progress) -> Outcome {
        progress.enter(IssuanceState::Validating);
        let validated = match validate(request, &self.config) {
            Ok(v) => v,
            Err(reason) => {
                tracing::warn!(
                    reason = %reason,
                    failure = %reason.failure_info(),
                    "rejecting request"
                );
                progress.enter(IssuanceState::Rejected);
                return Outcome::Rejected(reason);
            }
        };

        progress.enter(IssuanceState::Building);
        let cert_req = validated.request.cert_req;
        let modified = validated.is_modified();

        let (identity, token) = match self.build_token(&validated) {
            Ok(built) => built,
            Err(e) => {
                tracing::error!(error = %e, "token build failed");
                progress.enter(IssuanceState::SignFailed);
                return Outcome::SignFailed(e);
            }
        };

        progress.enter(IssuanceState::Signing);
        match self.signer.sign(&identity, &token, cert_req) {
            Ok(envelope) => {
                progress.enter(IssuanceState::Issued);
                tracing::debug!(
                    serial = token.serial_number(),
                    gen_time_ms = token.gen_time().unix_ms(),
                    modified,
                    "issued timestamp token"
                );
                Outcome::Issued { envelope, modified }
            }
            Err(e) => {
                tracing::error!(serial = token.serial_number(), error = %e, "signing failed");
                progress.enter(IssuanceState::SignFailed);
                Outcome::SignFailed(IssueError::Signer(e.into()))
            }
        }
    }

    fn build_token(
        &self,
        validated: &ValidatedRequest,
    ) -> Result<(Arc<SigningIdentity>, UnsignedToken), IssueError> {
        // The request completes against this identity even if the provider
        // rotates meanwhile.
        let identity = self
            .identities
            .current_signing_identity()
            .map_err(tsp_signer::Error::from)?;
        let (now, serial) = self.serials.next_stamped(self.clock.as_ref())?;
        let token = build(
            validated,
            serial,
            now,
            self.clock.accuracy(),
            &identity,
            &self.config,
        )?;
        Ok((identity, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{decode_response, PkiStatus};
    use tsp_signer::{
        ClockError, HashAlgorithm, ManualClock, MessageImprint, SoftwareKey, StaticIdentity,
        SystemClock, Timestamp,
    };

    const NOT_BEFORE: Timestamp = Timestamp::from_unix_ms(1_767_225_600_000);
    const NOT_AFTER: Timestamp = Timestamp::from_unix_ms(1_830_297_600_000);

    fn identities() -> Arc<dyn IdentityProvider> {
        let key = SoftwareKey::self_signed("CN=Unit TSA", NOT_BEFORE, NOT_AFTER).unwrap();
        Arc::new(StaticIdentity::new(
            SigningIdentity::new(Arc::new(key)).unwrap(),
        ))
    }

    fn authority(clock: Arc<dyn Clock>) -> TimestampAuthority {
        TimestampAuthority::new(
            AuthorityConfig::default(),
            SerialAllocator::starting_at(1),
            clock,
            identities(),
        )
    }

    fn manual_clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(
            Timestamp::from_unix_ms(1_771_156_800_000),
            std::time::Duration::from_secs(1),
        ))
    }

    fn request() -> TimeStampReq {
        TimeStampReq::new(MessageImprint::new(HashAlgorithm::Sha256.oid(), &[0u8; 32]).unwrap())
    }

    #[test]
    fn issues_token_for_valid_request() {
        let tsa = authority(manual_clock());
        let outcome = tsa.issue(request());
        assert_eq!(outcome.state(), IssuanceState::Issued);
        assert!(outcome.failure_info().is_none());
        assert_eq!(tsa.serials().current(), 2);
    }

    #[test]
    fn malformed_input_is_bad_data_format() {
        let tsa = authority(manual_clock());
        let outcome = tsa.process(&[0x30, 0x05, 0x02]);
        assert_eq!(outcome.failure_info(), Some(FailureInfo::BadDataFormat));
        assert_eq!(tsa.serials().current(), 1);
    }

    #[test]
    fn unavailable_clock_is_time_not_available_without_serial() {
        let tsa = authority(Arc::new(SystemClock::unsynchronized(
            std::time::Duration::from_secs(1),
        )));
        let outcome = tsa.issue(request());
        assert!(matches!(
            &outcome,
            Outcome::SignFailed(IssueError::Signer(tsp_signer::Error::Clock(
                ClockError::Unavailable
            )))
        ));
        assert_eq!(outcome.failure_info(), Some(FailureInfo::TimeNotAvailable));
        assert_eq!(tsa.serials().current(), 1);
    }

    #[test]
    fn exhausted_serials_are_system_failure() {
        let tsa = TimestampAuthority::new(
            AuthorityConfig::default(),
            SerialAllocator::starting_at(u64::MAX),
            manual_clock(),
            identities(),
        );
        let resp = decode_response(&tsa.respond(&crate::rfc3161::encode_request(&request()).unwrap()))
            .unwrap();
        assert_eq!(resp.status.status(), Some(PkiStatus::Rejection));
        assert_eq!(resp.status.failure_info(), vec![FailureInfo::SystemFailure]);
        assert_eq!(
            resp.status.status_string,
            Some(vec!["internal error".to_string()])
        );
    }

    #[test]
    fn rejection_explains_itself() {
        let tsa = authority(manual_clock());
        let mut req = request();
        req.version = 2;
        let resp = tsa.issue(req).into_response().unwrap();
        assert_eq!(
            resp.status.status_string,
            Some(vec!["unsupported request version 2".to_string()])
        );
    }

    #[test]
    fn progress_follows_the_state_machine() {
        let mut progress = Progress::new();
        for next in [
            IssuanceState::Validating,
            IssuanceState::Building,
            IssuanceState::Signing,
            IssuanceState::Issued,
        ] {
            progress.enter(next);
        }
        assert!(progress.state.is_terminal());
    }
}
