//! Offline time-stamping authority and throwaway PKI
//!
//! Everything here issues real DER structures (certificates, CRLs and
//! RFC 3161 tokens) so that the verification paths run unchanged in
//! tests. Keys are 1024-bit and cached per subject name.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use cms::cert::IssuerAndSerialNumber;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo, SignerInfos,
};
use der::asn1::{BitString, GeneralizedTime, ObjectIdentifier, OctetString, SetOfVec};
use der::{Any, Decode, Encode, Sequence};
use rsa::pkcs1v15;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Sha256, Sha512};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use x509_cert::attr::Attribute;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};
use x509_cert::{Certificate, Version};

use crate::certificate::{certificate_to_pem, CrlSource, SHA256_WITH_RSA, SHA512_WITH_RSA};
use crate::crypto::digest_bytes;
use crate::timestamp::{
    MessageImprint, TimestampAuthority, TimestampToken, ID_CONTENT_TYPE, ID_CT_TST_INFO,
    ID_MESSAGE_DIGEST, ID_SHA512, ID_SIGNED_DATA,
};
use crate::types::Digest;
use crate::{Error, Result};

const TEST_POLICY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.55555.1.1");
const TEST_KEY_BITS: usize = 1024;

fn crypto_err(e: impl std::fmt::Display) -> Error {
    Error::Crypto(e.to_string())
}

/// Cached RSA key for a subject name
pub fn rsa_key_for(name: &str) -> Result<RsaPrivateKey> {
    static KEYS: OnceLock<Mutex<HashMap<String, RsaPrivateKey>>> = OnceLock::new();
    let keys = KEYS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut keys = keys
        .lock()
        .map_err(|_| Error::Crypto("test key cache poisoned".into()))?;
    if let Some(key) = keys.get(name) {
        return Ok(key.clone());
    }
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), TEST_KEY_BITS).map_err(crypto_err)?;
    keys.insert(name.to_string(), key.clone());
    Ok(key)
}

/// RSA key shared by tests that only need "some" key
pub fn test_rsa_key() -> RsaPrivateKey {
    match rsa_key_for("strata test key") {
        Ok(key) => key,
        Err(e) => panic!("test key generation failed: {}", e),
    }
}

/// Self-signed certificate with its key, able to issue CRLs
pub struct TestPki {
    pub name: String,
    pub key: RsaPrivateKey,
    pub certificate: Certificate,
}

impl TestPki {
    pub fn new(name: &str) -> Result<Self> {
        let key = rsa_key_for(name)?;
        let signer = pkcs1v15::SigningKey::<Sha256>::new(key.clone());

        let spki_der = key
            .to_public_key()
            .to_public_key_der()
            .map_err(crypto_err)?;
        let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())?;
        let subject = Name::from_str(&format!("CN={},O=Strata Test", name))?;
        let d = digest_bytes(name.as_bytes()).0;
        let serial = SerialNumber::from(u32::from_be_bytes([d[0] & 0x7f, d[1], d[2], d[3] | 1]));
        let validity = Validity::from_now(Duration::from_secs(10 * 365 * 24 * 3600))?;

        let builder =
            CertificateBuilder::new(Profile::Root, serial, validity, subject, spki, &signer)
                .map_err(crypto_err)?;
        let certificate = builder
            .build::<pkcs1v15::Signature>()
            .map_err(crypto_err)?;

        Ok(Self {
            name: name.to_string(),
            key,
            certificate,
        })
    }

    pub fn certificate_pem(&self) -> Result<String> {
        certificate_to_pem(&self.certificate)
    }

    /// Private key as unencrypted PKCS#8 PEM
    pub fn key_pem(&self) -> Result<String> {
        Ok(self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(crypto_err)?
            .to_string())
    }

    /// DER CRL signed by this PKI listing `revoked`
    pub fn crl(&self, revoked: &[SerialNumber]) -> Result<Vec<u8>> {
        let now = SystemTime::now();
        let this_update = Time::try_from(now)?;
        let next_update = Time::try_from(now + Duration::from_secs(7 * 24 * 3600))?;
        let revoked_certificates = if revoked.is_empty() {
            None
        } else {
            Some(
                revoked
                    .iter()
                    .map(|serial| RevokedCert {
                        serial_number: serial.clone(),
                        revocation_date: this_update,
                        crl_entry_extensions: None,
                    })
                    .collect(),
            )
        };
        let algorithm = AlgorithmIdentifierOwned {
            oid: SHA256_WITH_RSA,
            parameters: Some(Any::null()),
        };
        let tbs = TbsCertList {
            version: Version::V2,
            signature: algorithm.clone(),
            issuer: self.certificate.tbs_certificate.subject.clone(),
            this_update,
            next_update: Some(next_update),
            revoked_certificates,
            crl_extensions: None,
        };
        let signer = pkcs1v15::SigningKey::<Sha256>::new(self.key.clone());
        let signature = signer.try_sign(&tbs.to_der()?).map_err(crypto_err)?;
        let crl = CertificateList {
            tbs_cert_list: tbs,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&signature.to_vec())?,
        };
        Ok(crl.to_der()?)
    }
}

/// Encodable subset of `TSTInfo`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct TstInfoFields {
    version: u8,
    policy: ObjectIdentifier,
    message_imprint: MessageImprint,
    serial_number: u64,
    gen_time: GeneralizedTime,
}

/// Time-stamping authority that signs tokens locally
pub struct LocalTimestampAuthority {
    identity: String,
    pki: TestPki,
    serial: AtomicU64,
    last_issued: Mutex<Option<DateTime<Utc>>>,
    offline: AtomicBool,
}

impl LocalTimestampAuthority {
    pub fn new(identity: &str) -> Result<Self> {
        Self::with_name(identity, "Strata Test TSA")
    }

    pub fn with_name(identity: &str, name: &str) -> Result<Self> {
        Ok(Self {
            identity: identity.to_string(),
            pki: TestPki::new(name)?,
            serial: AtomicU64::new(1),
            last_issued: Mutex::new(None),
            offline: AtomicBool::new(false),
        })
    }

    pub fn pki(&self) -> &TestPki {
        &self.pki
    }

    /// Make further requests fail as if the authority were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Whole-second issuance times, strictly increasing per authority
    fn next_issue_time(&self) -> Result<DateTime<Utc>> {
        let mut last = self
            .last_issued
            .lock()
            .map_err(|_| Error::Crypto("TSA clock poisoned".into()))?;
        let now = Utc::now()
            .duration_trunc(ChronoDuration::seconds(1))
            .map_err(crypto_err)?;
        let issued = match *last {
            Some(prev) if prev >= now => prev + ChronoDuration::seconds(1),
            _ => now,
        };
        *last = Some(issued);
        Ok(issued)
    }

    fn issue(&self, digest: &Digest, gen_time: DateTime<Utc>) -> Result<Vec<u8>> {
        let tst = TstInfoFields {
            version: 1,
            policy: TEST_POLICY,
            message_imprint: MessageImprint::sha512(digest)?,
            serial_number: self.serial.fetch_add(1, Ordering::SeqCst),
            gen_time: GeneralizedTime::from_unix_duration(Duration::from_secs(
                gen_time.timestamp() as u64,
            ))?,
        };
        let tst_der = tst.to_der()?;

        let sha512 = AlgorithmIdentifierOwned {
            oid: ID_SHA512,
            parameters: Some(Any::null()),
        };
        let signed_attrs = SetOfVec::try_from(vec![
            Attribute {
                oid: ID_CONTENT_TYPE,
                values: SetOfVec::try_from(vec![Any::encode_from(&ID_CT_TST_INFO)?])?,
            },
            Attribute {
                oid: ID_MESSAGE_DIGEST,
                values: SetOfVec::try_from(vec![Any::encode_from(&OctetString::new(
                    digest_bytes(&tst_der).as_bytes().to_vec(),
                )?)?])?,
            },
        ])?;

        let signer = pkcs1v15::SigningKey::<Sha512>::new(self.pki.key.clone());
        let signature = signer
            .try_sign(&signed_attrs.to_der()?)
            .map_err(crypto_err)?;

        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: self.pki.certificate.tbs_certificate.issuer.clone(),
                serial_number: self.pki.certificate.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: sha512.clone(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: SHA512_WITH_RSA,
                parameters: Some(Any::null()),
            },
            signature: OctetString::new(signature.to_vec())?,
            unsigned_attrs: None,
        };

        let signed_data = SignedData {
            version: CmsVersion::V3,
            digest_algorithms: SetOfVec::try_from(vec![sha512])?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: ID_CT_TST_INFO,
                econtent: Some(Any::encode_from(&OctetString::new(tst_der)?)?),
            },
            certificates: None,
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
        };

        let content_info = ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data)?,
        };
        Ok(content_info.to_der()?)
    }
}

#[async_trait]
impl TimestampAuthority for LocalTimestampAuthority {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn certificate(&self) -> &Certificate {
        &self.pki.certificate
    }

    async fn request(&self, digest: &Digest) -> Result<TimestampToken> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::TsaUnreachable(format!("{}: offline", self.identity)));
        }
        let gen_time = self.next_issue_time()?;
        let token = self.issue(digest, gen_time)?;
        TimestampToken::from_der(token)
    }
}

/// CRL source serving whatever was last published for a URL
#[derive(Default)]
pub struct StaticCrlSource {
    crls: Mutex<HashMap<String, Vec<u8>>>,
}

impl StaticCrlSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, url: &str, crl: Vec<u8>) {
        self.crls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(url.to_string(), crl);
    }

    /// Make `url` unreachable
    pub fn withdraw(&self, url: &str) {
        self.crls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(url);
    }
}

#[async_trait]
impl CrlSource for StaticCrlSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.crls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(url)
            .cloned()
            .ok_or_else(|| Error::CrlUnavailable(format!("{}: not published", url)))
    }
}
