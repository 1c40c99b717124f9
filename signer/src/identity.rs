//! Signing identities and the provider that hands them out.
//!
//! A [`SigningIdentity`] is a backend whose leaf certificate has been
//! checked once, up front: it must be restricted to time-stamping by a
//! critical extended key usage. Requests take an `Arc` snapshot from the
//! [`IdentityProvider`] when they start and finish against it, even if the
//! provider rotates in between.

use crate::error::IdentityError;
use crate::hash::HashAlgorithm;
use crate::signing::{SignatureAlgorithm, SigningBackend};
use crate::time::Timestamp;

use const_oid::db::rfc5280::{ID_CE_EXT_KEY_USAGE, ID_KP_TIME_STAMPING};
use der::{Decode, Encode};
use std::sync::{Arc, RwLock};
use x509_cert::ext::pkix::ExtendedKeyUsage;
use x509_cert::name::Name;
use x509_cert::time::Time;
use x509_cert::Certificate;

/// Inclusive notBefore..=notAfter range of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub not_before: Timestamp,
    pub not_after: Timestamp,
}

impl ValidityWindow {
    pub fn contains(&self, t: Timestamp) -> bool {
        self.not_before <= t && t <= self.not_after
    }
}

fn to_timestamp(t: &Time) -> Timestamp {
    Timestamp::from_unix_duration(t.to_unix_duration())
}

/// A signing backend with a verified timestamping certificate.
pub struct SigningIdentity {
    backend: Arc<dyn SigningBackend>,
    leaf: Certificate,
    leaf_der: Vec<u8>,
    cert_hash: Vec<u8>,
    validity: ValidityWindow,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("algorithm", &self.algorithm())
            .field("subject", &self.subject().to_string())
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    pub fn new(backend: Arc<dyn SigningBackend>) -> Result<Self, IdentityError> {
        let leaf = backend
            .certificate_chain()
            .first()
            .ok_or(IdentityError::EmptyChain)?;
        check_timestamping_usage(leaf)?;

        let validity = &leaf.tbs_certificate.validity;
        let validity = ValidityWindow {
            not_before: to_timestamp(&validity.not_before),
            not_after: to_timestamp(&validity.not_after),
        };
        let leaf_der = leaf.to_der()?;
        let cert_hash = HashAlgorithm::Sha256.digest(&leaf_der);

        let leaf = leaf.clone();

        Ok(Self {
            backend,
            leaf,
            leaf_der,
            cert_hash,
            validity,
        })
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.backend.algorithm()
    }

    pub fn backend(&self) -> &dyn SigningBackend {
        self.backend.as_ref()
    }

    pub fn leaf(&self) -> &Certificate {
        &self.leaf
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.leaf_der
    }

    /// SHA-256 of the DER leaf certificate.
    pub fn cert_hash(&self) -> &[u8] {
        &self.cert_hash
    }

    pub fn chain(&self) -> &[Certificate] {
        self.backend.certificate_chain()
    }

    pub fn subject(&self) -> &Name {
        &self.leaf().tbs_certificate.subject
    }

    pub fn validity(&self) -> ValidityWindow {
        self.validity
    }
}

/// The leaf must carry a critical extended key usage listing only
/// id-kp-timeStamping (RFC 3161 Section 2.3).
fn check_timestamping_usage(leaf: &Certificate) -> Result<(), IdentityError> {
    let eku = leaf
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == ID_CE_EXT_KEY_USAGE)
        .ok_or_else(|| IdentityError::KeyUsage("extended key usage missing".into()))?;

    if !eku.critical {
        return Err(IdentityError::KeyUsage(
            "extended key usage must be critical".into(),
        ));
    }

    let usages = ExtendedKeyUsage::from_der(eku.extn_value.as_bytes())?;
    if usages.0.as_slice() != [ID_KP_TIME_STAMPING] {
        return Err(IdentityError::KeyUsage(format!(
            "expected only id-kp-timeStamping, found {:?}",
            usages.0
        )));
    }
    Ok(())
}

/// Source of the identity a request is signed with.
pub trait IdentityProvider: Send + Sync {
    fn current_signing_identity(&self) -> Result<Arc<SigningIdentity>, IdentityError>;
}

/// Always the same identity.
pub struct StaticIdentity(Arc<SigningIdentity>);

impl StaticIdentity {
    pub fn new(identity: SigningIdentity) -> Self {
        Self(Arc::new(identity))
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_signing_identity(&self) -> Result<Arc<SigningIdentity>, IdentityError> {
        Ok(self.0.clone())
    }
}

/// An identity that can be replaced while requests are in flight.
pub struct RotatingIdentity {
    current: RwLock<Arc<SigningIdentity>>,
}

impl RotatingIdentity {
    pub fn new(identity: SigningIdentity) -> Self {
        Self {
            current: RwLock::new(Arc::new(identity)),
        }
    }

    /// Install `identity` for requests that start from now on.
    pub fn rotate(&self, identity: SigningIdentity) -> Result<(), IdentityError> {
        tracing::info!(
            subject = %identity.subject(),
            not_after = identity.validity().not_after.unix_ms(),
            "rotating signing identity"
        );
        let mut current = self
            .current
            .write()
            .map_err(|_| IdentityError::Unavailable("identity lock poisoned".into()))?;
        *current = Arc::new(identity);
        Ok(())
    }
}

impl IdentityProvider for RotatingIdentity {
    fn current_signing_identity(&self) -> Result<Arc<SigningIdentity>, IdentityError> {
        self.current
            .read()
            .map(|current| current.clone())
            .map_err(|_| IdentityError::Unavailable("identity lock poisoned".into()))
    }
}
