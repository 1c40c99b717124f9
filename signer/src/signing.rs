/// Signing backends for the token signer.
///
/// A backend owns the private key and the certificate chain that vouches
/// for it. `SoftwareKey` holds an ECDSA P-384 key in memory; `HardwareKey`
/// drives an exclusive-access device through a `KeySession`, serializing
/// calls into the device and nothing else.
use crate::error::SigningError;
use crate::hash::HashAlgorithm;
use crate::time::Timestamp;

use const_oid::db::rfc5280::{ID_CE_EXT_KEY_USAGE, ID_KP_TIME_STAMPING};
use const_oid::db::rfc5912::{ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384};
use const_oid::ObjectIdentifier;
use der::asn1::{BitString, GeneralizedTime, OctetString};
use der::{Decode, Encode};
use ecdsa::signature::Signer;
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::pkcs8::EncodePublicKey;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use x509_cert::ext::pkix::ExtendedKeyUsage;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};
use x509_cert::{Certificate, TbsCertificate, Version};

/// Signature algorithms a signing identity may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    EcdsaP256Sha256,
    EcdsaP384Sha384,
}

impl SignatureAlgorithm {
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Self::EcdsaP256Sha256 => ECDSA_WITH_SHA_256,
            Self::EcdsaP384Sha384 => ECDSA_WITH_SHA_384,
        }
    }

    /// The digest applied to the signed message.
    pub fn digest(self) -> HashAlgorithm {
        match self {
            Self::EcdsaP256Sha256 => HashAlgorithm::Sha256,
            Self::EcdsaP384Sha384 => HashAlgorithm::Sha384,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            Self::EcdsaP384Sha384 => "ecdsa-p384-sha384",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ecdsa-p256-sha256" => Some(Self::EcdsaP256Sha256),
            "ecdsa-p384-sha384" => Some(Self::EcdsaP384Sha384),
            _ => None,
        }
    }

    /// AlgorithmIdentifier for SignerInfo.signatureAlgorithm.
    /// ECDSA identifiers carry no parameters (RFC 5758 Section 3.2).
    pub fn identifier(self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: None,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A private key together with the certificate chain for it.
pub trait SigningBackend: Send + Sync {
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Sign `message`, returning a DER-encoded ECDSA-Sig-Value.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError>;

    /// Leaf certificate first, then any intermediates.
    fn certificate_chain(&self) -> &[Certificate];
}

/// In-memory ECDSA P-384 key.
/// The key is never persisted or logged.
pub struct SoftwareKey {
    signing_key: SigningKey,
    chain: Vec<Certificate>,
}

impl SoftwareKey {
    pub fn new(signing_key: SigningKey, chain: Vec<Certificate>) -> Self {
        Self { signing_key, chain }
    }

    /// Generate a new random key with no certificate.
    pub fn generate() -> Self {
        Self::new(SigningKey::random(&mut rand_core::OsRng), Vec::new())
    }

    /// Load a raw private key scalar (48 bytes).
    pub fn from_private_key_bytes(key_bytes: &[u8]) -> Result<Self, SigningError> {
        let signing_key = SigningKey::from_slice(key_bytes).map_err(|_| SigningError::InvalidKey)?;
        Ok(Self::new(signing_key, Vec::new()))
    }

    /// Generate a key and a self-signed timestamping certificate for it.
    ///
    /// Meant for development and tests; production identities come from a
    /// certificate provider.
    pub fn self_signed(
        subject: &str,
        not_before: Timestamp,
        not_after: Timestamp,
    ) -> Result<Self, SigningError> {
        let key = Self::generate();
        let subject = Name::from_str(subject)
            .map_err(|e| SigningError::Backend(format!("invalid subject: {}", e)))?;
        let cert = issue_certificate(
            &key.signing_key,
            &subject,
            not_before,
            not_after,
            vec![timestamping_eku(true)?],
        )?;
        Ok(key.with_chain(vec![cert]))
    }

    pub fn with_chain(mut self, chain: Vec<Certificate>) -> Self {
        self.chain = chain;
        self
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl SigningBackend for SoftwareKey {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::EcdsaP384Sha384
    }

    /// The signing process internally computes SHA-384 of the input.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let signature: Signature = self
            .signing_key
            .try_sign(message)
            .map_err(|e| SigningError::Backend(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn certificate_chain(&self) -> &[Certificate] {
        &self.chain
    }
}

/// An open session with a key device that permits one operation at a time.
pub trait KeySession: Send {
    fn algorithm(&self) -> SignatureAlgorithm;

    fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// A device-held key. Only the device call is serialized.
pub struct HardwareKey<S> {
    session: Mutex<S>,
    algorithm: SignatureAlgorithm,
    chain: Vec<Certificate>,
}

impl<S: KeySession> HardwareKey<S> {
    pub fn new(session: S, chain: Vec<Certificate>) -> Self {
        let algorithm = session.algorithm();
        Self {
            session: Mutex::new(session),
            algorithm,
            chain,
        }
    }
}

impl<S: KeySession> SigningBackend for HardwareKey<S> {
    fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| SigningError::KeyUnavailable("key session poisoned".into()))?;
        session.sign(message)
    }

    fn certificate_chain(&self) -> &[Certificate] {
        &self.chain
    }
}

/// Extended key usage restricted to id-kp-timeStamping.
pub fn timestamping_eku(critical: bool) -> Result<Extension, SigningError> {
    let eku = ExtendedKeyUsage(vec![ID_KP_TIME_STAMPING]);
    Ok(Extension {
        extn_id: ID_CE_EXT_KEY_USAGE,
        critical,
        extn_value: OctetString::new(eku.to_der()?)?,
    })
}

/// Issue a self-signed v3 certificate for `key`.
pub fn issue_certificate(
    key: &SigningKey,
    subject: &Name,
    not_before: Timestamp,
    not_after: Timestamp,
    extensions: Vec<Extension>,
) -> Result<Certificate, SigningError> {
    let spki_der = key
        .verifying_key()
        .to_public_key_der()
        .map_err(|e| SigningError::Backend(e.to_string()))?;
    let signature = SignatureAlgorithm::EcdsaP384Sha384.identifier();

    let serial: [u8; 8] = rand_serial();
    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(&serial)?,
        signature: signature.clone(),
        issuer: subject.clone(),
        validity: Validity {
            not_before: Time::GeneralTime(GeneralizedTime::from_unix_duration(
                not_before.to_unix_duration(),
            )?),
            not_after: Time::GeneralTime(GeneralizedTime::from_unix_duration(
                not_after.to_unix_duration(),
            )?),
        },
        subject: subject.clone(),
        subject_public_key_info: SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: (!extensions.is_empty()).then_some(extensions),
    };

    let tbs_der = tbs_certificate.to_der()?;
    let sig: Signature = key
        .try_sign(&tbs_der)
        .map_err(|e| SigningError::Backend(e.to_string()))?;

    Ok(Certificate {
        tbs_certificate,
        signature_algorithm: signature,
        signature: BitString::from_bytes(sig.to_der().as_bytes())?,
    })
}

/// Positive, non-zero certificate serial.
fn rand_serial() -> [u8; 8] {
    use rand_core::RngCore;
    let mut serial = [0u8; 8];
    rand_core::OsRng.fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7F) | 0x01;
    serial
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecdsa::signature::Verifier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const NOT_BEFORE: Timestamp = Timestamp::from_unix_ms(1_767_225_600_000);
    const NOT_AFTER: Timestamp = Timestamp::from_unix_ms(1_830_297_600_000);

    #[test]
    fn generate_and_sign() {
        let key = SoftwareKey::generate();
        let data = b"test signed attrs data";
        let sig_bytes = key.sign(data).unwrap();
        assert!(!sig_bytes.is_empty());

        let sig = Signature::from_der(&sig_bytes).unwrap();
        key.verifying_key().verify(data, &sig).unwrap();
    }

    #[test]
    fn signatures_over_same_data_both_verify() {
        let key = SoftwareKey::generate();
        let data = b"same data";
        for _ in 0..2 {
            let sig = Signature::from_der(&key.sign(data).unwrap()).unwrap();
            key.verifying_key().verify(data, &sig).unwrap();
        }
    }

    #[test]
    fn roundtrip_from_key_bytes() {
        let original = SoftwareKey::generate();
        let key_bytes = original.signing_key().to_bytes();
        let restored = SoftwareKey::from_private_key_bytes(&key_bytes).unwrap();

        let data = b"roundtrip test";
        let sig = Signature::from_der(&restored.sign(data).unwrap()).unwrap();
        original.verifying_key().verify(data, &sig).unwrap();
    }

    #[test]
    fn short_key_bytes_are_rejected() {
        assert!(matches!(
            SoftwareKey::from_private_key_bytes(&[0x01; 16]),
            Err(SigningError::InvalidKey)
        ));
    }

    #[test]
    fn self_signed_certificate_matches_key() {
        let key = SoftwareKey::self_signed("CN=Test TSA", NOT_BEFORE, NOT_AFTER).unwrap();
        let chain = key.certificate_chain();
        assert_eq!(chain.len(), 1);

        let tbs = &chain[0].tbs_certificate;
        assert_eq!(tbs.subject, tbs.issuer);
        assert_eq!(
            tbs.subject_public_key_info.subject_public_key.raw_bytes(),
            key.verifying_key().to_encoded_point(false).as_bytes()
        );

        // The certificate's own signature verifies under its key.
        let sig = Signature::from_der(chain[0].signature.raw_bytes()).unwrap();
        key.verifying_key()
            .verify(&tbs.to_der().unwrap(), &sig)
            .unwrap();
    }

    #[test]
    fn self_signed_certificate_has_critical_timestamping_eku() {
        let key = SoftwareKey::self_signed("CN=Test TSA", NOT_BEFORE, NOT_AFTER).unwrap();
        let exts = key.certificate_chain()[0]
            .tbs_certificate
            .extensions
            .as_ref()
            .unwrap();
        let eku = exts.iter().find(|e| e.extn_id == ID_CE_EXT_KEY_USAGE).unwrap();
        assert!(eku.critical);
        let usages = ExtendedKeyUsage::from_der(eku.extn_value.as_bytes()).unwrap();
        assert_eq!(usages.0, vec![ID_KP_TIME_STAMPING]);
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!(
            SignatureAlgorithm::from_name("ECDSA-P384-SHA384"),
            Some(SignatureAlgorithm::EcdsaP384Sha384)
        );
        assert_eq!(
            SignatureAlgorithm::from_name("ecdsa-p256-sha256"),
            Some(SignatureAlgorithm::EcdsaP256Sha256)
        );
        assert_eq!(SignatureAlgorithm::from_name("rsa-sha1"), None);
        assert_eq!(
            SignatureAlgorithm::EcdsaP384Sha384.digest(),
            HashAlgorithm::Sha384
        );
    }

    /// A device that fails the test if two operations ever overlap.
    struct ExclusiveDevice {
        key: SigningKey,
        busy: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    impl KeySession for ExclusiveDevice {
        fn algorithm(&self) -> SignatureAlgorithm {
            SignatureAlgorithm::EcdsaP384Sha384
        }

        fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
            assert!(!self.busy.swap(true, Ordering::SeqCst), "device re-entered");
            let sig: Signature = self.key.sign(message);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
            Ok(sig.to_der().as_bytes().to_vec())
        }
    }

    #[test]
    fn hardware_key_serializes_device_calls() {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        let verifying_key = *signing_key.verifying_key();
        let calls = Arc::new(AtomicUsize::new(0));
        let device = ExclusiveDevice {
            key: signing_key,
            busy: Arc::new(AtomicBool::new(false)),
            calls: calls.clone(),
        };
        let backend = HardwareKey::new(device, Vec::new());

        std::thread::scope(|s| {
            for i in 0..4u8 {
                let backend = &backend;
                s.spawn(move || {
                    for _ in 0..10 {
                        let msg = [i; 32];
                        let sig = Signature::from_der(&backend.sign(&msg).unwrap()).unwrap();
                        verifying_key.verify(&msg, &sig).unwrap();
                    }
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 40);
        assert_eq!(backend.algorithm(), SignatureAlgorithm::EcdsaP384Sha384);
    }
}
