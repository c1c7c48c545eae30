//! X.509 certificates and certificate revocation lists

use async_trait::async_trait;
use der::asn1::ObjectIdentifier;
use der::pem::LineEnding;
use der::{Decode, Document, Encode, EncodePem};
use rsa::pkcs1v15;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::{Sha256, Sha384, Sha512};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use x509_cert::crl::CertificateList;
use x509_cert::Certificate;

use crate::crypto::rsa_public_key_from_spki_der;
use crate::{Error, Result};

/// PEM label of a CRL
pub const CRL_PEM_LABEL: &str = "X509 CRL";

pub(crate) const SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
pub(crate) const SHA384_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
pub(crate) const SHA512_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map_or(false, |&b| b == b'-')
}

fn pem_body(bytes: &[u8]) -> Result<Document> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::MalformedData("PEM input is not UTF-8".into()))?;
    let (_label, doc) = Document::from_pem(text.trim())?;
    Ok(doc)
}

/// Parse a certificate from PEM or DER bytes
pub fn parse_certificate(bytes: &[u8]) -> Result<Certificate> {
    if looks_like_pem(bytes) {
        let doc = pem_body(bytes)?;
        Ok(Certificate::from_der(doc.as_bytes())?)
    } else {
        Ok(Certificate::from_der(bytes)?)
    }
}

pub fn load_certificate(path: &Path) -> Result<Certificate> {
    let bytes = std::fs::read(path)?;
    parse_certificate(&bytes).map_err(|e| e.context(format!("loading certificate {:?}", path)))
}

/// PEM encoding of a certificate
pub fn certificate_to_pem(cert: &Certificate) -> Result<String> {
    Ok(cert.to_pem(LineEnding::LF)?)
}

/// RSA public key carried by a certificate
pub fn certificate_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let spki = cert.tbs_certificate.subject_public_key_info.to_der()?;
    rsa_public_key_from_spki_der(&spki)
}

/// Parse a CRL from PEM or DER bytes
pub fn parse_crl(bytes: &[u8]) -> Result<CertificateList> {
    if looks_like_pem(bytes) {
        let doc = pem_body(bytes)?;
        Ok(CertificateList::from_der(doc.as_bytes())?)
    } else {
        Ok(CertificateList::from_der(bytes)?)
    }
}

/// Check that `crl` is signed by `certificate`'s key and that the
/// certificate's serial number is not listed as revoked
pub fn validate_certificate(crl: &[u8], certificate: &Certificate) -> Result<()> {
    let crl = parse_crl(crl)
        .map_err(|e| Error::CertificateNotValid(format!("unreadable CRL: {}", e)))?;
    let key = certificate_public_key(certificate)
        .map_err(|e| Error::CertificateNotValid(e.to_string()))?;

    let tbs = crl.tbs_cert_list.to_der()?;
    let signature = crl
        .signature
        .as_bytes()
        .ok_or_else(|| Error::CertificateNotValid("CRL signature has unused bits".into()))?;
    verify_pkcs1v15(&crl.signature_algorithm.oid, &key, &tbs, signature).map_err(|e| {
        warn!("CRL signature does not verify against the certificate");
        Error::CertificateNotValid(format!("CRL signature invalid: {}", e))
    })?;

    let serial = &certificate.tbs_certificate.serial_number;
    let revoked = crl
        .tbs_cert_list
        .revoked_certificates
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|entry| &entry.serial_number == serial);
    if revoked {
        warn!("Certificate {} is revoked", serial);
        return Err(Error::CertificateNotValid(format!(
            "certificate {} is revoked",
            serial
        )));
    }

    debug!("Certificate {} not revoked", serial);
    Ok(())
}

/// Validate a CRL against a certificate stored on disk
pub fn validate_certificate_file(crl: &[u8], certificate_path: &Path) -> Result<()> {
    let certificate = load_certificate(certificate_path)
        .map_err(|e| Error::CertificateNotValid(e.to_string()))?;
    validate_certificate(crl, &certificate)
}

/// Verify an RSA PKCS#1 v1.5 signature for the given signature algorithm
pub(crate) fn verify_pkcs1v15(
    algorithm: &ObjectIdentifier,
    key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let signature = pkcs1v15::Signature::try_from(signature)
        .map_err(|e| Error::InvalidSignature(e.to_string()))?;
    let result = if *algorithm == SHA256_WITH_RSA {
        pkcs1v15::VerifyingKey::<Sha256>::new(key.clone()).verify(message, &signature)
    } else if *algorithm == SHA384_WITH_RSA {
        pkcs1v15::VerifyingKey::<Sha384>::new(key.clone()).verify(message, &signature)
    } else if *algorithm == SHA512_WITH_RSA {
        pkcs1v15::VerifyingKey::<Sha512>::new(key.clone()).verify(message, &signature)
    } else {
        return Err(Error::InvalidSignature(format!(
            "unsupported signature algorithm {}",
            algorithm
        )));
    };
    result.map_err(|_| Error::InvalidSignature("signature mismatch".into()))
}

/// Source of current CRLs
#[async_trait]
pub trait CrlSource: Send + Sync {
    /// Fetch the CRL bytes published at `url`
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetches CRLs over HTTP(S)
pub struct HttpCrlSource {
    client: reqwest::Client,
}

impl HttpCrlSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CrlSource for HttpCrlSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Fetching CRL from {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::CrlUnavailable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::CrlUnavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::CrlUnavailable(format!("{}: {}", url, e)))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestPki;

    #[test]
    fn test_valid_crl_accepted() {
        let pki = TestPki::new("Archive Signing CA").unwrap();
        let crl = pki.crl(&[]).unwrap();
        validate_certificate(&crl, &pki.certificate).unwrap();
    }

    #[test]
    fn test_revoked_certificate_rejected() {
        let pki = TestPki::new("Archive Signing CA").unwrap();
        let serial = pki.certificate.tbs_certificate.serial_number.clone();
        let crl = pki.crl(&[serial]).unwrap();
        assert!(matches!(
            validate_certificate(&crl, &pki.certificate),
            Err(Error::CertificateNotValid(_))
        ));
    }

    #[test]
    fn test_crl_from_other_issuer_rejected() {
        let pki = TestPki::new("Archive Signing CA").unwrap();
        let other = TestPki::new("Someone Else").unwrap();
        let crl = other.crl(&[]).unwrap();
        assert!(matches!(
            validate_certificate(&crl, &pki.certificate),
            Err(Error::CertificateNotValid(_))
        ));
    }

    #[test]
    fn test_pem_and_der_accepted() {
        let pki = TestPki::new("TSA").unwrap();
        let pem = certificate_to_pem(&pki.certificate).unwrap();
        let der = pki.certificate.to_der().unwrap();
        assert_eq!(parse_certificate(pem.as_bytes()).unwrap(), pki.certificate);
        assert_eq!(parse_certificate(&der).unwrap(), pki.certificate);

        let crl_der = pki.crl(&[]).unwrap();
        let crl_pem = Document::try_from(crl_der.as_slice())
            .unwrap()
            .to_pem(CRL_PEM_LABEL, LineEnding::LF)
            .unwrap();
        validate_certificate(crl_pem.as_bytes(), &pki.certificate).unwrap();
    }

    #[test]
    fn test_garbage_crl_is_not_valid() {
        let pki = TestPki::new("TSA").unwrap();
        assert!(matches!(
            validate_certificate(b"definitely not a crl", &pki.certificate),
            Err(Error::CertificateNotValid(_))
        ));
    }
}
