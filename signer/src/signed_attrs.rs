/// CMS SignedAttributes (signedAttrs) for a timestamp token.
///
/// Per RFC 5652 Section 5.4, when the content type is not id-data,
/// signedAttrs MUST be present and the signature covers DER(signedAttrs).
///
/// signedAttrs = SET OF Attribute {
///   { contentType,          SET { id-ct-TSTInfo } },
///   { messageDigest,        SET { OCTET STRING (digest of TSTInfo DER) } },
///   { signingCertificateV2, SET { SigningCertificateV2 } },
/// }
use crate::hash::HashAlgorithm;
use crate::tstinfo::OID_CT_TST_INFO;

use cms::signed_data::SignedAttributes;
use const_oid::ObjectIdentifier;
use der::asn1::{OctetString, SetOfVec};
use der::{Any, Decode, Encode, Sequence};
use x509_cert::attr::Attribute;
use x509_cert::spki::AlgorithmIdentifierOwned;

/// contentType (1.2.840.113549.1.9.3)
pub const OID_CONTENT_TYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");

/// messageDigest (1.2.840.113549.1.9.4)
pub const OID_MESSAGE_DIGEST: ObjectIdentifier = const_oid::db::rfc6268::ID_MESSAGE_DIGEST;

/// signingCertificateV2 (1.2.840.113549.1.9.16.2.47)
pub const OID_SIGNING_CERT_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");

/// ESSCertIDv2 ::= SEQUENCE {
///     hashAlgorithm AlgorithmIdentifier DEFAULT {algorithm id-sha256},
///     certHash      OCTET STRING,
///     issuerSerial  IssuerSerial OPTIONAL }
///
/// The authority always hashes with SHA-256, so hashAlgorithm is omitted
/// per DER and issuerSerial is never sent.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct EssCertIdV2 {
    #[asn1(optional = "true")]
    pub hash_algorithm: Option<AlgorithmIdentifierOwned>,
    pub cert_hash: OctetString,
}

/// SigningCertificateV2 ::= SEQUENCE { certs SEQUENCE OF ESSCertIDv2 }
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SigningCertificateV2 {
    pub certs: Vec<EssCertIdV2>,
}

fn attribute(oid: ObjectIdentifier, value: Any) -> der::Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value])?,
    })
}

/// Build the complete signedAttrs SET.
///
/// `digest` is the signature algorithm's digest; it hashes the TSTInfo for
/// the messageDigest attribute. `signing_cert_hash` is the SHA-256 of the
/// DER signing certificate.
pub fn build_signed_attrs(
    tstinfo_der: &[u8],
    digest: HashAlgorithm,
    signing_cert_hash: &[u8],
) -> der::Result<SignedAttributes> {
    let content_type = attribute(OID_CONTENT_TYPE, Any::encode_from(&OID_CT_TST_INFO)?)?;

    let message_digest = attribute(
        OID_MESSAGE_DIGEST,
        Any::encode_from(&OctetString::new(digest.digest(tstinfo_der))?)?,
    )?;

    let signing_cert = SigningCertificateV2 {
        certs: vec![EssCertIdV2 {
            hash_algorithm: None,
            cert_hash: OctetString::new(signing_cert_hash)?,
        }],
    };
    let signing_cert = attribute(OID_SIGNING_CERT_V2, Any::encode_from(&signing_cert)?)?;

    // SET OF is sorted by DER encoding on construction.
    SetOfVec::try_from(vec![content_type, message_digest, signing_cert])
}

/// The bytes a signature over `attrs` covers: the attributes encoded as a
/// universal SET OF, not the [0] IMPLICIT form they take inside SignerInfo.
pub fn signed_attrs_message(attrs: &SignedAttributes) -> der::Result<Vec<u8>> {
    attrs.to_der()
}

/// Find the single value of the attribute `oid`.
pub fn find_attribute<'a>(attrs: &'a SignedAttributes, oid: &ObjectIdentifier) -> Option<&'a Any> {
    let attr = attrs.iter().find(|attr| &attr.oid == oid)?;
    if attr.values.len() != 1 {
        return None;
    }
    attr.values.iter().next()
}

/// The messageDigest attribute's value.
pub fn message_digest(attrs: &SignedAttributes) -> Option<Vec<u8>> {
    let value = find_attribute(attrs, &OID_MESSAGE_DIGEST)?;
    let der = value.to_der().ok()?;
    OctetString::from_der(&der).ok().map(|o| o.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSTINFO: &[u8] = &[0x30, 0x03, 0x02, 0x01, 0x01];
    const CERT_HASH: &[u8] = &[0x5C; 32];

    #[test]
    fn signed_attrs_starts_with_set_tag() {
        let attrs = build_signed_attrs(TSTINFO, HashAlgorithm::Sha384, CERT_HASH).unwrap();
        let der = signed_attrs_message(&attrs).unwrap();
        assert_eq!(der[0], 0x31);
    }

    #[test]
    fn signed_attrs_contains_three_attributes() {
        let attrs = build_signed_attrs(TSTINFO, HashAlgorithm::Sha384, CERT_HASH).unwrap();
        assert_eq!(attrs.len(), 3);
        assert!(find_attribute(&attrs, &OID_CONTENT_TYPE).is_some());
        assert!(find_attribute(&attrs, &OID_SIGNING_CERT_V2).is_some());
    }

    #[test]
    fn message_digest_covers_tstinfo() {
        let attrs = build_signed_attrs(TSTINFO, HashAlgorithm::Sha384, CERT_HASH).unwrap();
        assert_eq!(
            message_digest(&attrs).unwrap(),
            HashAlgorithm::Sha384.digest(TSTINFO)
        );
    }

    #[test]
    fn content_type_is_tstinfo() {
        let attrs = build_signed_attrs(TSTINFO, HashAlgorithm::Sha256, CERT_HASH).unwrap();
        let value = find_attribute(&attrs, &OID_CONTENT_TYPE).unwrap();
        let oid = value.decode_as::<ObjectIdentifier>().unwrap();
        assert_eq!(oid, OID_CT_TST_INFO);
    }

    #[test]
    fn signing_certificate_carries_leaf_hash() {
        let cert_hash = HashAlgorithm::Sha256.digest(b"not really a certificate");
        let attrs = build_signed_attrs(TSTINFO, HashAlgorithm::Sha384, &cert_hash).unwrap();
        let value = find_attribute(&attrs, &OID_SIGNING_CERT_V2).unwrap();
        let decoded = value.decode_as::<SigningCertificateV2>().unwrap();
        assert_eq!(decoded.certs.len(), 1);
        assert!(decoded.certs[0].hash_algorithm.is_none());
        assert_eq!(decoded.certs[0].cert_hash.as_bytes(), cert_hash.as_slice());
    }

    #[test]
    fn different_tstinfo_produces_different_digest() {
        let a = build_signed_attrs(TSTINFO, HashAlgorithm::Sha384, CERT_HASH).unwrap();
        let b = build_signed_attrs(&[0x30, 0x03, 0x02, 0x01, 0x02], HashAlgorithm::Sha384, CERT_HASH)
            .unwrap();
        assert_ne!(a, b);
    }
}
