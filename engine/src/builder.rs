//! Token builder: turns a validated request into an unsigned TSTInfo.

use crate::config::AuthorityConfig;
use crate::validate::ValidatedRequest;

use std::time::Duration;
use thiserror::Error;
use tsp_signer::tstinfo::{build_tstinfo, TstInfoParams};
use tsp_signer::{SerialNumber, SigningIdentity, Timestamp, UnsignedToken};

#[derive(Error, Debug)]
pub enum BuildError {
    /// Neither the request nor the configuration supplies a policy
    #[error("no policy to issue under")]
    NoPolicy,

    #[error("TSTInfo encoding failed: {0}")]
    Encoding(#[from] der::Error),
}

/// Assemble the TSTInfo for `validated`.
///
/// `accuracy` is the clock's stated precision; a configured accuracy
/// overrides it. The TSA name, when configured, is the subject of the
/// identity that will sign.
pub fn build(
    validated: &ValidatedRequest,
    serial: SerialNumber,
    now: Timestamp,
    accuracy: Duration,
    identity: &SigningIdentity,
    config: &AuthorityConfig,
) -> Result<UnsignedToken, BuildError> {
    let policy = validated.policy.policy().ok_or(BuildError::NoPolicy)?;

    let token = build_tstinfo(&TstInfoParams {
        policy,
        message_imprint: &validated.request.message_imprint,
        serial_number: serial,
        gen_time: now,
        accuracy: config.accuracy.unwrap_or(accuracy),
        ordering: config.ordering,
        nonce: validated.request.nonce.as_ref(),
        tsa_name: config.include_tsa_name.then(|| identity.subject()),
        extensions: &validated.extensions,
    })?;

    tracing::debug!(serial = serial.get(), %policy, "built TSTInfo");
    Ok(token)
}
