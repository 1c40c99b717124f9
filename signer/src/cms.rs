/// CMS SignedData envelope for timestamp tokens (RFC 5652, RFC 3161 Section 2.4.2).
///
/// ContentInfo {
///   contentType: id-signedData,
///   content: SignedData {
///     version: 3,
///     digestAlgorithms: { <signature digest> },
///     encapContentInfo: { id-ct-TSTInfo, OCTET STRING(TSTInfo DER) },
///     certificates: [0] IMPLICIT { leaf, intermediates... }   -- only on certReq
///     signerInfos: { SignerInfo v1 (issuerAndSerialNumber) }
///   }
/// }
use crate::error::SigningError;
use crate::hash::HashAlgorithm;
use crate::identity::SigningIdentity;
use crate::signed_attrs::{build_signed_attrs, message_digest, signed_attrs_message};
use crate::signing::SignatureAlgorithm;
use crate::tstinfo::{TstInfo, UnsignedToken, OID_CT_TST_INFO};

use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use const_oid::db::rfc5911::ID_SIGNED_DATA;
use der::asn1::{OctetString, SetOfVec};
use der::{Any, Encode};
use ecdsa::signature::Verifier;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

/// Produces signed envelopes with an allow-listed signature algorithm.
pub struct Signer {
    allowed: Vec<SignatureAlgorithm>,
}

impl Signer {
    pub fn new(allowed: Vec<SignatureAlgorithm>) -> Self {
        Self { allowed }
    }

    pub fn allowed(&self) -> &[SignatureAlgorithm] {
        &self.allowed
    }

    /// Sign `token` with `identity`.
    ///
    /// The algorithm is the identity's own and must be allow-listed; it is
    /// never chosen by the requester. Fails with `ExpiredSigner` when
    /// genTime falls outside the leaf certificate's validity window.
    pub fn sign(
        &self,
        identity: &SigningIdentity,
        token: &UnsignedToken,
        include_chain: bool,
    ) -> Result<SignedEnvelope, SigningError> {
        let algorithm = identity.algorithm();
        if !self.allowed.contains(&algorithm) {
            return Err(SigningError::DisallowedAlgorithm(algorithm.to_string()));
        }
        if !identity.validity().contains(token.gen_time()) {
            return Err(SigningError::ExpiredSigner);
        }

        let digest = algorithm.digest();
        let signed_attrs = build_signed_attrs(token.to_der(), digest, identity.cert_hash())?;
        let signature = identity
            .backend()
            .sign(&signed_attrs_message(&signed_attrs)?)?;

        let leaf = identity.leaf();
        let digest_alg = AlgorithmIdentifierOwned {
            oid: digest.oid(),
            parameters: None,
        };
        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: leaf.tbs_certificate.issuer.clone(),
                serial_number: leaf.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_alg.clone(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm: algorithm.identifier(),
            signature: OctetString::new(signature)?,
            unsigned_attrs: None,
        };

        let certificates = if include_chain {
            let choices = identity
                .chain()
                .iter()
                .cloned()
                .map(CertificateChoices::Certificate)
                .collect::<Vec<_>>();
            Some(CertificateSet(SetOfVec::try_from(choices)?))
        } else {
            None
        };

        let signed_data = SignedData {
            version: CmsVersion::V3,
            digest_algorithms: SetOfVec::try_from(vec![digest_alg])?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: OID_CT_TST_INFO,
                econtent: Some(Any::encode_from(&OctetString::new(token.to_der())?)?),
            },
            certificates,
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
        };

        let content_info = ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data)?,
        };
        let der = content_info.to_der()?;

        tracing::debug!(
            serial = token.serial_number(),
            %algorithm,
            include_chain,
            "signed timestamp token"
        );

        Ok(SignedEnvelope {
            content_info,
            der,
            tst_info: token.tst_info().clone(),
        })
    }
}

/// A signed timestamp token.
#[derive(Clone, Debug)]
pub struct SignedEnvelope {
    content_info: ContentInfo,
    der: Vec<u8>,
    tst_info: TstInfo,
}

impl SignedEnvelope {
    pub fn content_info(&self) -> &ContentInfo {
        &self.content_info
    }

    pub fn into_content_info(self) -> ContentInfo {
        self.content_info
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn tst_info(&self) -> &TstInfo {
        &self.tst_info
    }
}

/// Unwrap the SignedData of a timestamp token.
pub fn signed_data(content_info: &ContentInfo) -> Result<SignedData, SigningError> {
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(SigningError::Verification(
            "content type is not id-signedData".into(),
        ));
    }
    Ok(content_info.content.decode_as::<SignedData>()?)
}

/// The TSTInfo carried in a token, with its exact encoded bytes.
pub fn tst_info_from_content_info(content_info: &ContentInfo) -> Result<UnsignedToken, SigningError> {
    let signed_data = signed_data(content_info)?;
    encapsulated_token(&signed_data)
}

fn encapsulated_token(signed_data: &SignedData) -> Result<UnsignedToken, SigningError> {
    let encap = &signed_data.encap_content_info;
    if encap.econtent_type != OID_CT_TST_INFO {
        return Err(SigningError::Verification(
            "encapsulated content is not id-ct-TSTInfo".into(),
        ));
    }
    let econtent = encap
        .econtent
        .as_ref()
        .ok_or_else(|| SigningError::Verification("no encapsulated TSTInfo".into()))?;
    Ok(UnsignedToken::from_der(econtent.value())?)
}

/// Certificates embedded in the token, in set order.
pub fn embedded_certificates(signed_data: &SignedData) -> Vec<Certificate> {
    signed_data
        .certificates
        .iter()
        .flat_map(|set| set.0.iter())
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert.clone()),
            _ => None,
        })
        .collect()
}

/// Check a token's signature against `signer` and return its TSTInfo.
///
/// Verifies the messageDigest attribute against the encapsulated TSTInfo
/// and the ECDSA signature over the signed attributes. Chain building is
/// left to relying parties.
///
/// Only ecdsa-with-SHA384 over P-384 is verified here. Tokens signed with
/// any other algorithm, including an allow-listed P-256 device key, fail
/// with [`SigningError::Verification`].
pub fn verify_token(
    content_info: &ContentInfo,
    signer: &Certificate,
) -> Result<TstInfo, SigningError> {
    let signed_data = signed_data(content_info)?;
    let token = encapsulated_token(&signed_data)?;

    let signer_info = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| SigningError::Verification("no signer info".into()))?;

    let digest = HashAlgorithm::from_oid(&signer_info.digest_alg.oid)
        .ok_or_else(|| SigningError::Verification("unknown digest algorithm".into()))?;
    let attrs = signer_info
        .signed_attrs
        .as_ref()
        .ok_or_else(|| SigningError::Verification("no signed attributes".into()))?;
    if message_digest(attrs).as_deref() != Some(digest.digest(token.to_der()).as_slice()) {
        return Err(SigningError::Verification("messageDigest mismatch".into()));
    }

    let algorithm = [
        SignatureAlgorithm::EcdsaP256Sha256,
        SignatureAlgorithm::EcdsaP384Sha384,
    ]
    .into_iter()
    .find(|a| a.oid() == signer_info.signature_algorithm.oid)
    .ok_or_else(|| SigningError::Verification("unknown signature algorithm".into()))?;
    if algorithm != SignatureAlgorithm::EcdsaP384Sha384 {
        return Err(SigningError::Verification(format!(
            "verification of {} is not supported",
            algorithm
        )));
    }

    let public_key = signer
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    let verifying_key = p384::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| SigningError::Verification(format!("signer public key: {}", e)))?;
    let signature = p384::ecdsa::Signature::from_der(signer_info.signature.as_bytes())
        .map_err(|e| SigningError::Verification(format!("signature encoding: {}", e)))?;
    verifying_key
        .verify(&signed_attrs_message(attrs)?, &signature)
        .map_err(|_| SigningError::Verification("signature does not verify".into()))?;

    Ok(token.tst_info().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::SerialAllocator;
    use crate::signed_attrs::{find_attribute, SigningCertificateV2, OID_SIGNING_CERT_V2};
    use crate::signing::{HardwareKey, KeySession, SigningBackend, SoftwareKey};
    use ecdsa::signature::Signer as _;
    use crate::time::Timestamp;
    use crate::tstinfo::{build_tstinfo, MessageImprint, TstInfoParams};
    use std::sync::Arc;
    use std::time::Duration;

    const NOT_BEFORE: Timestamp = Timestamp::from_unix_ms(1_767_225_600_000);
    const NOT_AFTER: Timestamp = Timestamp::from_unix_ms(1_830_297_600_000);
    const IN_WINDOW: Timestamp = Timestamp::from_unix_ms(1_771_156_800_123);

    fn identity() -> SigningIdentity {
        let key = SoftwareKey::self_signed("CN=Test TSA,O=Example", NOT_BEFORE, NOT_AFTER).unwrap();
        SigningIdentity::new(Arc::new(key)).unwrap()
    }

    fn token(gen_time: Timestamp) -> UnsignedToken {
        let imprint = MessageImprint::new(HashAlgorithm::Sha256.oid(), &[0x42; 32]).unwrap();
        build_tstinfo(&TstInfoParams {
            policy: const_oid::ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.2"),
            message_imprint: &imprint,
            serial_number: SerialAllocator::starting_at(7).next().unwrap(),
            gen_time,
            accuracy: Duration::from_secs(1),
            ordering: false,
            nonce: None,
            tsa_name: None,
            extensions: &[],
        })
        .unwrap()
    }

    fn signer() -> Signer {
        Signer::new(vec![SignatureAlgorithm::EcdsaP384Sha384])
    }

    #[test]
    fn envelope_verifies_against_leaf() {
        let id = identity();
        let token = token(IN_WINDOW);
        let envelope = signer().sign(&id, &token, false).unwrap();

        let tst_info = verify_token(envelope.content_info(), id.leaf()).unwrap();
        assert_eq!(&tst_info, token.tst_info());
    }

    #[test]
    fn envelope_structure() {
        let id = identity();
        let envelope = signer().sign(&id, &token(IN_WINDOW), false).unwrap();
        let sd = signed_data(envelope.content_info()).unwrap();

        assert_eq!(sd.version, CmsVersion::V3);
        assert_eq!(sd.digest_algorithms.len(), 1);
        assert!(sd.certificates.is_none());
        let si = sd.signer_infos.0.iter().next().unwrap();
        assert_eq!(si.version, CmsVersion::V1);
        assert_eq!(si.digest_alg.oid, HashAlgorithm::Sha384.oid());
        assert_eq!(si.signature_algorithm.oid, SignatureAlgorithm::EcdsaP384Sha384.oid());
        match &si.sid {
            SignerIdentifier::IssuerAndSerialNumber(isn) => {
                assert_eq!(isn.serial_number, id.leaf().tbs_certificate.serial_number);
            }
            other => panic!("unexpected signer identifier {:?}", other),
        }
    }

    #[test]
    fn chain_embedded_only_on_request() {
        let id = identity();
        let envelope = signer().sign(&id, &token(IN_WINDOW), true).unwrap();
        let sd = signed_data(envelope.content_info()).unwrap();
        let certs = embedded_certificates(&sd);
        assert_eq!(certs.len(), 1);
        assert_eq!(&certs[0], id.leaf());
    }

    #[test]
    fn encapsulated_bytes_are_the_signed_bytes() {
        let id = identity();
        let token = token(IN_WINDOW);
        let envelope = signer().sign(&id, &token, false).unwrap();
        let decoded = tst_info_from_content_info(envelope.content_info()).unwrap();
        assert_eq!(decoded.to_der(), token.to_der());
    }

    #[test]
    fn gen_time_outside_validity_is_expired_signer() {
        let id = identity();
        let late = Timestamp::from_unix_ms(NOT_AFTER.unix_ms() + 1_000);
        let early = Timestamp::from_unix_ms(NOT_BEFORE.unix_ms() - 1_000);
        for t in [late, early] {
            assert!(matches!(
                signer().sign(&id, &token(t), false),
                Err(SigningError::ExpiredSigner)
            ));
        }
    }

    #[test]
    fn algorithm_outside_allow_list_is_refused() {
        let id = identity();
        let signer = Signer::new(vec![SignatureAlgorithm::EcdsaP256Sha256]);
        assert!(matches!(
            signer.sign(&id, &token(IN_WINDOW), false),
            Err(SigningError::DisallowedAlgorithm(_))
        ));
    }

    #[test]
    fn signing_certificate_attribute_names_the_leaf() {
        let id = identity();
        let envelope = signer().sign(&id, &token(IN_WINDOW), false).unwrap();
        let sd = signed_data(envelope.content_info()).unwrap();
        let si = sd.signer_infos.0.iter().next().unwrap();
        let value = find_attribute(si.signed_attrs.as_ref().unwrap(), &OID_SIGNING_CERT_V2).unwrap();
        let signing_cert = value.decode_as::<SigningCertificateV2>().unwrap();

        assert_eq!(signing_cert.certs[0].cert_hash.as_bytes(), id.cert_hash());
        assert_eq!(id.cert_hash(), HashAlgorithm::Sha256.digest(&id.leaf().to_der().unwrap()));
    }

    /// Reports P-256 but signs with the P-384 key behind the certificate.
    struct P256Device(p384::ecdsa::SigningKey);

    impl KeySession for P256Device {
        fn algorithm(&self) -> SignatureAlgorithm {
            SignatureAlgorithm::EcdsaP256Sha256
        }

        fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
            let sig: p384::ecdsa::Signature = self.0.sign(message);
            Ok(sig.to_der().as_bytes().to_vec())
        }
    }

    #[test]
    fn p256_tokens_are_not_verified() {
        let key = SoftwareKey::self_signed("CN=Device TSA", NOT_BEFORE, NOT_AFTER).unwrap();
        let chain = key.certificate_chain().to_vec();
        let device = HardwareKey::new(P256Device(key.signing_key().clone()), chain);
        let id = SigningIdentity::new(Arc::new(device)).unwrap();

        let signer = Signer::new(vec![SignatureAlgorithm::EcdsaP256Sha256]);
        let envelope = signer.sign(&id, &token(IN_WINDOW), false).unwrap();
        match verify_token(envelope.content_info(), id.leaf()) {
            Err(SigningError::Verification(msg)) => assert!(msg.contains("ecdsa-p256-sha256")),
            other => panic!("expected a verification error, got {:?}", other),
        }
    }

    #[test]
    fn wrong_certificate_does_not_verify() {
        let id = identity();
        let other = identity();
        let envelope = signer().sign(&id, &token(IN_WINDOW), false).unwrap();
        assert!(matches!(
            verify_token(envelope.content_info(), other.leaf()),
            Err(SigningError::Verification(_))
        ));
    }
}
