//! Trust material shared by the evidence operations
//!
//! Holds the time-stamping authority, the signing key and the
//! certificates and CRLs that every layer snapshots into its
//! `certificate_files/` directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use strata_core::package::{
    CERTIFICATE_DIR, SIGNING_CERT, SIGNING_CRL, TSA_CA, TSA_CERT, TSA_CRL,
};
use strata_core::{
    certificate_to_pem, load_certificate, parse_certificate, validate_certificate, Certificate,
    CrlSource, Error, FilePackage, HttpCrlSource, Result, ResultExt, Rfc3161Authority, SigningKey,
    TimestampAuthority,
};

use crate::config::StrataConfig;

/// Authority, keys, certificates and CRL locations used to build and check evidence
pub struct TrustContext {
    authority: Arc<dyn TimestampAuthority>,
    crl_source: Arc<dyn CrlSource>,
    tsa_crl_url: String,
    tsa_ca: Certificate,
    signing_key: SigningKey,
    signing_cert: Certificate,
    signing_crl_path: PathBuf,
}

/// CRLs checked at the start of an operation, ready to be snapshotted
pub struct CheckedCrls {
    pub tsa_crl: Vec<u8>,
    pub signing_crl: Vec<u8>,
}

impl TrustContext {
    pub fn new(
        authority: Arc<dyn TimestampAuthority>,
        crl_source: Arc<dyn CrlSource>,
        tsa_crl_url: impl Into<String>,
        tsa_ca: Certificate,
        signing_key: SigningKey,
        signing_cert: Certificate,
        signing_crl_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            authority,
            crl_source,
            tsa_crl_url: tsa_crl_url.into(),
            tsa_ca,
            signing_key,
            signing_cert,
            signing_crl_path: signing_crl_path.into(),
        }
    }

    /// Load keys and certificates named by the configuration, talking to
    /// the configured RFC 3161 endpoint and fetching CRLs over HTTP
    pub fn from_config(config: &StrataConfig) -> Result<Self> {
        let tsa_cert = load_certificate(&config.tsa.tsa_cert_path)?;
        let tsa_ca = load_certificate(&config.tsa.tsa_ca_path)?;
        let signing_cert = load_certificate(&config.signing.certificate_path)?;
        let signing_key = SigningKey::load(
            &config.signing.private_key_path,
            config.signing.key_password.as_deref(),
        )
        .context(format!("loading {:?}", config.signing.private_key_path))?;

        let authority = Rfc3161Authority::new(config.tsa.url.clone(), tsa_cert, config.tsa_timeout())?;
        let crl_source = HttpCrlSource::new(config.tsa_timeout())?;

        Ok(Self::new(
            Arc::new(authority),
            Arc::new(crl_source),
            config.tsa.tsa_crl_url.clone(),
            tsa_ca,
            signing_key,
            signing_cert,
            config.signing.crl_path.clone(),
        ))
    }

    pub fn authority(&self) -> &dyn TimestampAuthority {
        self.authority.as_ref()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn signing_cert_pem(&self) -> Result<String> {
        certificate_to_pem(&self.signing_cert)
    }

    pub fn tsa_cert_pem(&self) -> Result<String> {
        certificate_to_pem(self.authority.certificate())
    }

    /// Fetch the TSA CA's current CRL and check it against the CA certificate
    pub async fn current_tsa_crl(&self) -> Result<Vec<u8>> {
        let crl = self.crl_source.fetch(&self.tsa_crl_url).await?;
        validate_certificate(&crl, &self.tsa_ca).context("TSA CA")?;
        debug!("TSA CRL from {} accepted", self.tsa_crl_url);
        Ok(crl)
    }

    /// Read the signing CRL and check it against the signing certificate
    pub fn current_signing_crl(&self) -> Result<Vec<u8>> {
        let crl = fs::read(&self.signing_crl_path).map_err(|e| {
            Error::CertificateNotValid(format!(
                "cannot read signing CRL {:?}: {}",
                self.signing_crl_path, e
            ))
        })?;
        validate_certificate(&crl, &self.signing_cert).context("signing certificate")?;
        Ok(crl)
    }

    /// Validate both certificates against their current CRLs
    pub async fn check_certificates(&self) -> Result<CheckedCrls> {
        let tsa_crl = self.current_tsa_crl().await?;
        let signing_crl = self.current_signing_crl()?;
        info!("TSA and signing certificates are valid");
        Ok(CheckedCrls {
            tsa_crl,
            signing_crl,
        })
    }

    /// CRLs for a renewal layer. Only the TSA side is checked; the signing
    /// CRL is copied as currently published, since nothing is signed.
    pub async fn renewal_crls(&self) -> Result<CheckedCrls> {
        let tsa_crl = self.current_tsa_crl().await?;
        let signing_crl = fs::read(&self.signing_crl_path).map_err(|e| {
            Error::CertificateNotValid(format!(
                "cannot read signing CRL {:?}: {}",
                self.signing_crl_path, e
            ))
        })?;
        Ok(CheckedCrls {
            tsa_crl,
            signing_crl,
        })
    }

    /// Write `certificate_files/` into `dir`
    pub fn write_snapshot(&self, dir: &Path, crls: &CheckedCrls) -> Result<PathBuf> {
        let snapshot = dir.join(CERTIFICATE_DIR);
        fs::create_dir_all(&snapshot)?;
        fs::write(snapshot.join(SIGNING_CERT), self.signing_cert_pem()?)?;
        fs::write(snapshot.join(SIGNING_CRL), &crls.signing_crl)?;
        fs::write(snapshot.join(TSA_CERT), self.tsa_cert_pem()?)?;
        fs::write(snapshot.join(TSA_CA), certificate_to_pem(&self.tsa_ca)?)?;
        fs::write(snapshot.join(TSA_CRL), &crls.tsa_crl)?;
        debug!("Certificate snapshot written to {:?}", snapshot);
        Ok(snapshot)
    }
}

/// TSA certificate recorded with a FilePackage row
pub fn recorded_tsa_certificate(package: &FilePackage) -> Result<Certificate> {
    parse_certificate(package.fields().tsa_cert.as_bytes()).map_err(|e| {
        Error::CertificateNotValid(format!(
            "TsaCert of package {}: {}",
            package.package_id, e
        ))
    })
}

/// Check a CRL stored in an extracted layer against a certificate stored next to it
pub fn verify_snapshot_crl(layer_dir: &Path, crl_name: &str, cert_name: &str) -> Result<()> {
    let snapshot = layer_dir.join(CERTIFICATE_DIR);
    let crl = fs::read(snapshot.join(crl_name)).map_err(|e| {
        Error::FileNotInDirectory(format!("{} in {:?}: {}", crl_name, snapshot, e))
    })?;
    let cert = fs::read(snapshot.join(cert_name)).map_err(|e| {
        Error::FileNotInDirectory(format!("{} in {:?}: {}", cert_name, snapshot, e))
    })?;
    let cert = parse_certificate(&cert)
        .map_err(|e| Error::CertificateNotValid(format!("{}: {}", cert_name, e)))?;
    validate_certificate(&crl, &cert).context(format!("{} against {}", crl_name, cert_name))
}
