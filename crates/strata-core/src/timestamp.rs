//! RFC 3161 timestamp tokens
//!
//! A token is the DER `ContentInfo` returned by the time-stamping
//! authority. Verification is local: once the authority's certificate is
//! known the token proves on its own that the digest existed at `genTime`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::asn1::{AnyRef, IntRef, ObjectIdentifier, OctetString};
use der::{Decode, Encode, Reader, Sequence, SliceReader, Tag, Tagged};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use spki::AlgorithmIdentifierOwned;
use std::time::Duration;
use tracing::{debug, info, warn};
use x509_cert::Certificate;

use crate::certificate::{
    certificate_public_key, verify_pkcs1v15, SHA256_WITH_RSA, SHA384_WITH_RSA, SHA512_WITH_RSA,
};
use crate::types::Digest;
use crate::{Error, Result};

pub const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
pub const ID_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2");
pub const ID_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3");
pub const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
pub const ID_CT_TST_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");
pub const ID_CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
pub const ID_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Content type for timestamp requests
pub const TIMESTAMP_QUERY_CONTENT_TYPE: &str = "application/timestamp-query";

/// `MessageImprint ::= SEQUENCE { hashAlgorithm, hashedMessage }`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct MessageImprint {
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub hashed_message: OctetString,
}

impl MessageImprint {
    /// SHA-512 imprint of a digest
    pub fn sha512(digest: &Digest) -> Result<Self> {
        Ok(Self {
            hash_algorithm: AlgorithmIdentifierOwned {
                oid: ID_SHA512,
                parameters: Some(der::Any::null()),
            },
            hashed_message: OctetString::new(digest.as_bytes().to_vec())?,
        })
    }
}

/// `TimeStampReq` without nonce, policy or extensions
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampReq {
    pub version: u8,
    pub message_imprint: MessageImprint,
    pub cert_req: Option<bool>,
}

/// `PKIStatusInfo`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PkiStatusInfo {
    pub status: u8,
    pub status_string: Option<Vec<String>>,
    pub fail_info: Option<der::asn1::BitString>,
}

/// `TimeStampResp ::= SEQUENCE { status, timeStampToken OPTIONAL }`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampResp {
    pub status: PkiStatusInfo,
    pub time_stamp_token: Option<ContentInfo>,
}

/// The fields of `TSTInfo` that verification relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TstInfo {
    pub policy: ObjectIdentifier,
    pub message_imprint: MessageImprint,
    pub serial_number: Vec<u8>,
    pub gen_time: DateTime<Utc>,
}

/// Parse `TSTInfo`, keeping the fields up to and including `genTime`
pub fn parse_tst_info(der: &[u8]) -> Result<TstInfo> {
    let mut reader = SliceReader::new(der)?;
    let (policy, message_imprint, serial_number, time_tag, time_value) =
        reader.sequence(|r| {
            let _version: u8 = r.decode()?;
            let policy: ObjectIdentifier = r.decode()?;
            let imprint: MessageImprint = r.decode()?;
            let serial: IntRef<'_> = r.decode()?;
            let time: AnyRef<'_> = r.decode()?;
            // accuracy, ordering, nonce, tsa and extensions are not needed
            while !r.is_finished() {
                r.tlv_bytes()?;
            }
            Ok((
                policy,
                imprint,
                serial.as_bytes().to_vec(),
                time.tag(),
                time.value().to_vec(),
            ))
        })?;

    if time_tag != Tag::GeneralizedTime {
        return Err(Error::MalformedData("TSTInfo genTime is not GeneralizedTime".into()));
    }
    let gen_time = parse_generalized_time(&time_value)?;

    Ok(TstInfo {
        policy,
        message_imprint,
        serial_number,
        gen_time,
    })
}

/// GeneralizedTime with optional fractional seconds, as issued by TSAs
fn parse_generalized_time(value: &[u8]) -> Result<DateTime<Utc>> {
    let text = std::str::from_utf8(value)
        .map_err(|_| Error::MalformedData("genTime is not ASCII".into()))?;
    let naive = NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%S%.fZ")
        .map_err(|e| Error::MalformedData(format!("genTime {:?}: {}", text, e)))?;
    Ok(naive.and_utc())
}

fn hash_for(algorithm: &ObjectIdentifier, data: &[u8]) -> Result<Vec<u8>> {
    Ok(match *algorithm {
        ID_SHA256 => Sha256::digest(data).to_vec(),
        ID_SHA384 => Sha384::digest(data).to_vec(),
        ID_SHA512 => Sha512::digest(data).to_vec(),
        other => {
            return Err(Error::TimestampInvalid(format!(
                "unsupported digest algorithm {}",
                other
            )))
        }
    })
}

/// Timestamp token together with its issuance time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampToken {
    bytes: Vec<u8>,
    issued_at: DateTime<Utc>,
}

impl TimestampToken {
    /// Decode a stored token without checking its signature
    pub fn from_der(bytes: Vec<u8>) -> Result<Self> {
        let (_, tst_der) = unwrap_signed_data(&bytes)?;
        let info = parse_tst_info(&tst_der)?;
        Ok(Self {
            bytes,
            issued_at: info.gen_time,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Split a token into its SignedData and the encapsulated TSTInfo DER
fn unwrap_signed_data(token: &[u8]) -> Result<(SignedData, Vec<u8>)> {
    let content_info = ContentInfo::from_der(token)?;
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(Error::MalformedData(format!(
            "token content type {} is not signedData",
            content_info.content_type
        )));
    }
    let signed_data: SignedData = content_info.content.decode_as()?;
    let encap = &signed_data.encap_content_info;
    if encap.econtent_type != ID_CT_TST_INFO {
        return Err(Error::MalformedData(format!(
            "encapsulated content {} is not TSTInfo",
            encap.econtent_type
        )));
    }
    let tst_der = encap
        .econtent
        .as_ref()
        .ok_or_else(|| Error::MalformedData("token carries no TSTInfo".into()))?
        .decode_as::<OctetString>()?
        .into_bytes();
    Ok((signed_data, tst_der))
}

/// Verify that `token` binds `digest` and is signed by `tsa_certificate`
pub fn verify_timestamp(
    token: &[u8],
    digest: &Digest,
    tsa_certificate: &Certificate,
) -> Result<TimestampToken> {
    verify_token_inner(token, digest, tsa_certificate).map_err(|e| match e {
        Error::TimestampInvalid(_) => e,
        other => Error::TimestampInvalid(other.to_string()),
    })
}

fn verify_token_inner(
    token: &[u8],
    digest: &Digest,
    tsa_certificate: &Certificate,
) -> Result<TimestampToken> {
    let (signed_data, tst_der) = unwrap_signed_data(token)?;
    let info = parse_tst_info(&tst_der)?;

    // 1. Imprint must be the SHA-512 of our digest
    if info.message_imprint.hash_algorithm.oid != ID_SHA512 {
        return Err(Error::TimestampInvalid(format!(
            "imprint algorithm {} is not SHA-512",
            info.message_imprint.hash_algorithm.oid
        )));
    }
    if info.message_imprint.hashed_message.as_bytes() != digest.as_bytes() {
        return Err(Error::TimestampInvalid("imprint does not match digest".into()));
    }

    // 2. Signed attributes must commit to the TSTInfo
    let signer = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| Error::TimestampInvalid("token has no signer".into()))?;
    let signed_attrs = signer
        .signed_attrs
        .as_ref()
        .ok_or_else(|| Error::TimestampInvalid("token has no signed attributes".into()))?;

    let mut message_digest = None;
    let mut content_type = None;
    for attr in signed_attrs.iter() {
        let value = attr.values.iter().next();
        if attr.oid == ID_MESSAGE_DIGEST {
            message_digest = value
                .map(|v| v.decode_as::<OctetString>())
                .transpose()?;
        } else if attr.oid == ID_CONTENT_TYPE {
            content_type = value
                .map(|v| v.decode_as::<ObjectIdentifier>())
                .transpose()?;
        }
    }
    if content_type != Some(ID_CT_TST_INFO) {
        return Err(Error::TimestampInvalid("signed content type is not TSTInfo".into()));
    }
    let message_digest = message_digest
        .ok_or_else(|| Error::TimestampInvalid("messageDigest attribute missing".into()))?;
    if hash_for(&signer.digest_alg.oid, &tst_der)? != message_digest.as_bytes() {
        return Err(Error::TimestampInvalid("messageDigest does not match TSTInfo".into()));
    }

    // 3. Signature over the DER SET OF signed attributes
    let signature_algorithm = match signer.signature_algorithm.oid {
        RSA_ENCRYPTION => match signer.digest_alg.oid {
            ID_SHA256 => SHA256_WITH_RSA,
            ID_SHA384 => SHA384_WITH_RSA,
            _ => SHA512_WITH_RSA,
        },
        other => other,
    };
    let key = certificate_public_key(tsa_certificate)?;
    let signed_bytes = signed_attrs.to_der()?;
    verify_pkcs1v15(
        &signature_algorithm,
        &key,
        &signed_bytes,
        signer.signature.as_bytes(),
    )
    .map_err(|_| Error::TimestampInvalid("token signature does not verify".into()))?;

    debug!("Timestamp for {} valid, issued {}", digest.short(), info.gen_time);
    Ok(TimestampToken {
        bytes: token.to_vec(),
        issued_at: info.gen_time,
    })
}

/// A time-stamping authority
#[async_trait]
pub trait TimestampAuthority: Send + Sync {
    /// Identity recorded in FilePackage rows (the endpoint URL)
    fn identity(&self) -> &str;

    /// Certificate the authority signs tokens with
    fn certificate(&self) -> &Certificate;

    /// Obtain a fresh token over `digest`
    async fn request(&self, digest: &Digest) -> Result<TimestampToken>;

    /// Re-validate a stored token against `digest` and this authority
    fn verify(&self, token: &[u8], digest: &Digest) -> Result<TimestampToken> {
        verify_timestamp(token, digest, self.certificate())
    }
}

/// RFC 3161 authority reached over HTTP
pub struct Rfc3161Authority {
    url: String,
    certificate: Certificate,
    client: reqwest::Client,
}

impl Rfc3161Authority {
    pub fn new(url: impl Into<String>, certificate: Certificate, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            certificate,
            client,
        })
    }

    /// DER-encoded request for a digest
    pub fn build_request(digest: &Digest) -> Result<Vec<u8>> {
        let request = TimeStampReq {
            version: 1,
            message_imprint: MessageImprint::sha512(digest)?,
            cert_req: Some(true),
        };
        Ok(request.to_der()?)
    }
}

/// Extract the token from a DER `TimeStampResp`
pub fn token_from_response(response: &[u8]) -> Result<Vec<u8>> {
    let response = TimeStampResp::from_der(response)
        .map_err(|e| Error::TsaUnreachable(format!("malformed response: {}", e)))?;
    // granted (0) or grantedWithMods (1)
    if response.status.status > 1 {
        let reason = response
            .status
            .status_string
            .map(|s| s.join("; "))
            .unwrap_or_default();
        return Err(Error::TsaUnreachable(format!(
            "request rejected with status {}: {}",
            response.status.status, reason
        )));
    }
    let token = response
        .time_stamp_token
        .ok_or_else(|| Error::TsaUnreachable("response carries no token".into()))?;
    Ok(token.to_der()?)
}

#[async_trait]
impl TimestampAuthority for Rfc3161Authority {
    fn identity(&self) -> &str {
        &self.url
    }

    fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    async fn request(&self, digest: &Digest) -> Result<TimestampToken> {
        let body = Self::build_request(digest)?;
        info!("Requesting timestamp for {} from {}", digest.short(), self.url);

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, TIMESTAMP_QUERY_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::TsaUnreachable(format!("{}: {}", self.url, e)))?;
        if !response.status().is_success() {
            warn!("TSA {} answered HTTP {}", self.url, response.status());
            return Err(Error::TsaUnreachable(format!(
                "{}: HTTP {}",
                self.url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::TsaUnreachable(format!("{}: {}", self.url, e)))?;

        let token = token_from_response(&bytes)?;
        self.verify(&token, digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::digest_bytes;
    use crate::mock::LocalTimestampAuthority;

    #[tokio::test]
    async fn test_issued_token_verifies() {
        let tsa = LocalTimestampAuthority::new("https://tsa.test/tsr").unwrap();
        let digest = digest_bytes(b"hello");

        let token = tsa.request(&digest).await.unwrap();
        let verified = verify_timestamp(token.as_bytes(), &digest, tsa.certificate()).unwrap();
        assert_eq!(verified.issued_at(), token.issued_at());
    }

    #[tokio::test]
    async fn test_token_for_other_digest_rejected() {
        let tsa = LocalTimestampAuthority::new("https://tsa.test/tsr").unwrap();
        let token = tsa.request(&digest_bytes(b"hello")).await.unwrap();

        let result = tsa.verify(token.as_bytes(), &digest_bytes(b"hullo"));
        assert!(matches!(result, Err(Error::TimestampInvalid(_))));
    }

    #[tokio::test]
    async fn test_token_from_other_authority_rejected() {
        let tsa = LocalTimestampAuthority::new("https://tsa.test/tsr").unwrap();
        let impostor = LocalTimestampAuthority::with_name("https://evil.test/tsr", "Impostor TSA")
            .unwrap();
        let digest = digest_bytes(b"hello");
        let token = impostor.request(&digest).await.unwrap();

        assert!(matches!(
            tsa.verify(token.as_bytes(), &digest),
            Err(Error::TimestampInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_token_rejected() {
        let tsa = LocalTimestampAuthority::new("https://tsa.test/tsr").unwrap();
        let digest = digest_bytes(b"hello");
        let mut token = tsa.request(&digest).await.unwrap().into_bytes();
        let last = token.len() - 1;
        token[last] ^= 0xff;

        assert!(matches!(
            tsa.verify(&token, &digest),
            Err(Error::TimestampInvalid(_))
        ));
        assert!(tsa.verify(b"garbage", &digest).is_err());
    }

    #[tokio::test]
    async fn test_from_der_reads_issuance_time() {
        let tsa = LocalTimestampAuthority::new("https://tsa.test/tsr").unwrap();
        let token = tsa.request(&digest_bytes(b"x")).await.unwrap();
        let decoded = TimestampToken::from_der(token.as_bytes().to_vec()).unwrap();
        assert_eq!(decoded.issued_at(), token.issued_at());
    }

    #[test]
    fn test_generalized_time_with_fraction() {
        let t = parse_generalized_time(b"20240301120000.25Z").unwrap();
        assert_eq!(t.timestamp(), 1_709_294_400);
        assert_eq!(t.timestamp_subsec_millis(), 250);

        let whole = parse_generalized_time(b"20240301120000Z").unwrap();
        assert_eq!(whole.timestamp(), 1_709_294_400);
    }

    #[test]
    fn test_request_encoding() {
        let digest = digest_bytes(b"hello");
        let der = Rfc3161Authority::build_request(&digest).unwrap();
        let request = TimeStampReq::from_der(&der).unwrap();
        assert_eq!(request.version, 1);
        assert_eq!(request.cert_req, Some(true));
        assert_eq!(request.message_imprint.hash_algorithm.oid, ID_SHA512);
        assert_eq!(
            request.message_imprint.hashed_message.as_bytes(),
            digest.as_bytes()
        );
    }

    #[test]
    fn test_rejected_response() {
        let response = TimeStampResp {
            status: PkiStatusInfo {
                status: 2,
                status_string: Some(vec!["bad alg".to_string()]),
                fail_info: None,
            },
            time_stamp_token: None,
        };
        let der = response.to_der().unwrap();
        assert!(matches!(
            token_from_response(&der),
            Err(Error::TsaUnreachable(_))
        ));
    }
}
