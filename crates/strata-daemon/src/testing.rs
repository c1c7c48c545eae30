//! Self-contained environment for exercising the evidence operations
//!
//! Builds a throwaway PKI, an offline time-stamping authority, an
//! in-memory record store and notifier, and a scratch directory holding
//! originals and evidence.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use strata_core::mock::{LocalTimestampAuthority, StaticCrlSource, TestPki};
use strata_core::{Result, SigningKey, DEFAULT_VALIDITY_YEARS};

use crate::archiver::{ArchiveSettings, Archiver};
use crate::config::ContactConfig;
use crate::evidence::TrustContext;
use crate::notifier::MemoryNotifier;
use crate::retimestamper::Retimestamper;
use crate::store::{MemoryStore, RecordStore};
use crate::task::Dispatcher;
use crate::transport::LocalSource;
use crate::validator::Validator;

pub const TEST_TSA_URL: &str = "https://tsa.strata.test/tsr";
pub const TEST_TSA_CRL_URL: &str = "https://tsa.strata.test/ca.crl";

pub struct TestEnvironment {
    pub root: TempDir,
    pub storage_dir: PathBuf,
    pub originals_dir: PathBuf,
    pub signing_crl_path: PathBuf,
    pub authority: Arc<LocalTimestampAuthority>,
    pub tsa_ca: TestPki,
    pub signing: TestPki,
    pub crl_source: Arc<StaticCrlSource>,
    pub trust: Arc<TrustContext>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<MemoryNotifier>,
    pub source: Arc<LocalSource>,
    pub contact: ContactConfig,
    pub validity_years: u32,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let root = TempDir::new()?;
        let storage_dir = root.path().join("storage");
        let originals_dir = root.path().join("originals");
        fs::create_dir_all(&storage_dir)?;
        fs::create_dir_all(&originals_dir)?;

        let authority = Arc::new(LocalTimestampAuthority::new(TEST_TSA_URL)?);
        let tsa_ca = TestPki::new("Strata Test TSA CA")?;
        let signing = TestPki::new("Strata Test Signing")?;

        let crl_source = Arc::new(StaticCrlSource::new());
        crl_source.publish(TEST_TSA_CRL_URL, tsa_ca.crl(&[])?);

        let signing_crl_path = root.path().join("signing_crl.crl");
        fs::write(&signing_crl_path, signing.crl(&[])?)?;

        let trust = Arc::new(TrustContext::new(
            authority.clone(),
            crl_source.clone(),
            TEST_TSA_CRL_URL,
            tsa_ca.certificate.clone(),
            SigningKey::from_rsa(signing.key.clone()),
            signing.certificate.clone(),
            signing_crl_path.clone(),
        ));

        let contact = ContactConfig {
            email: "archive-admin@strata.test".to_string(),
            phone: "+1 555 0100".to_string(),
            ..ContactConfig::default()
        };

        Ok(Self {
            root,
            storage_dir,
            originals_dir,
            signing_crl_path,
            authority,
            tsa_ca,
            signing,
            crl_source,
            trust,
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(MemoryNotifier::new()),
            source: Arc::new(LocalSource),
            contact,
            validity_years: DEFAULT_VALIDITY_YEARS,
        })
    }

    /// Write an original and return its path as a task would carry it
    pub fn write_original(&self, name: &str, contents: &[u8]) -> Result<String> {
        let path = self.originals_dir.join(name);
        fs::write(&path, contents)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Publish a signing CRL listing the signing certificate
    pub fn revoke_signing_certificate(&self) -> Result<()> {
        let serial = self.signing.certificate.tbs_certificate.serial_number.clone();
        fs::write(&self.signing_crl_path, self.signing.crl(&[serial])?)?;
        Ok(())
    }

    /// Make the TSA CA's CRL unreachable
    pub fn withdraw_tsa_crl(&self) {
        self.crl_source.withdraw(TEST_TSA_CRL_URL);
    }

    pub fn settings(&self) -> ArchiveSettings {
        ArchiveSettings {
            storage_dir: self.storage_dir.clone(),
            validity_years: self.validity_years,
            transfer_attempts: 3,
        }
    }

    pub fn archiver(&self) -> Archiver {
        self.archiver_for(self.store.clone())
    }

    pub fn archiver_for(&self, store: Arc<dyn RecordStore>) -> Archiver {
        Archiver::new(store, self.source.clone(), self.trust.clone(), self.settings())
    }

    pub fn retimestamper(&self) -> Retimestamper {
        self.retimestamper_for(self.store.clone())
    }

    pub fn retimestamper_for(&self, store: Arc<dyn RecordStore>) -> Retimestamper {
        Retimestamper::new(store, self.trust.clone(), self.validity_years)
    }

    pub fn validator(&self) -> Validator {
        self.validator_for(self.store.clone())
    }

    pub fn validator_for(&self, store: Arc<dyn RecordStore>) -> Validator {
        Validator::new(
            store,
            self.source.clone(),
            self.notifier.clone(),
            self.contact.clone(),
        )
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.archiver(), self.retimestamper(), self.validator())
    }
}
