//! Archiver: turns an original file into a sealed evidence directory
//!
//! The evidence directory ends up holding a single `Package1.tar`:
//!
//! ```text
//! Package1.tar
//! ├── Package0.tar
//! │   ├── <original file>
//! │   └── timestamp0          token over the original's digest
//! ├── signature.sig           RSA-PSS over Package0's digest
//! ├── timestamp1              token over the signature's digest
//! └── certificate_files/      signing and TSA certificates with their CRLs
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::package::{
    CERTIFICATE_DIR, PACKAGE0, PACKAGE1, PACKAGE_PREFIX, SIGNATURE, TIMESTAMP0, TIMESTAMP1,
};
use strata_core::records::expiration_after;
use strata_core::{
    certificate_to_pem, seal, ArchivedFile, ContainerLayer, Error, NewArchivedFile,
    NewFilePackage, Result, ResultExt,
};

use crate::blocking::run_blocking;
use crate::config::StrataConfig;
use crate::evidence::{CheckedCrls, TrustContext};
use crate::store::RecordStore;
use crate::transport::{file_name_of, transfer_with_retry, FileSource};

/// Member names an original may not take; anything starting with
/// `Package` is refused as well
const RESERVED_NAMES: &[&str] = &[TIMESTAMP0, TIMESTAMP1, SIGNATURE, CERTIFICATE_DIR];

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    /// Root under which evidence directories are created
    pub storage_dir: PathBuf,
    pub validity_years: u32,
    pub transfer_attempts: u32,
}

impl ArchiveSettings {
    pub fn from_config(config: &StrataConfig) -> Self {
        Self {
            storage_dir: config.storage_dir.clone(),
            validity_years: config.validity_years,
            transfer_attempts: config.worker.transfer_attempts,
        }
    }
}

pub struct Archiver {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn FileSource>,
    trust: Arc<TrustContext>,
    settings: ArchiveSettings,
}

impl Archiver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn FileSource>,
        trust: Arc<TrustContext>,
        settings: ArchiveSettings,
    ) -> Self {
        Self {
            store,
            source,
            trust,
            settings,
        }
    }

    /// Archive the file at `source_path` on behalf of `owner`.
    ///
    /// Nothing is left on disk unless the ArchivedFile and its first
    /// FilePackage were both persisted.
    pub async fn archive(&self, source_path: &str, owner: &str) -> Result<ArchivedFile> {
        let file_name = file_name_of(source_path)?;
        if owner.trim().is_empty() {
            return Err(Error::WrongTask("archive task has no owner".into()));
        }
        if RESERVED_NAMES.contains(&file_name.as_str()) || file_name.starts_with(PACKAGE_PREFIX) {
            return Err(Error::WrongTask(format!(
                "{:?} clashes with an evidence member name",
                file_name
            )));
        }

        let crls = self.trust.check_certificates().await?;

        let evidence_dir = self.settings.storage_dir.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&evidence_dir)?;
        info!(owner, "Archiving {} into {:?}", source_path, evidence_dir);

        let result = self
            .build_evidence(source_path, owner, &file_name, &evidence_dir, crls)
            .await
            .and_then(|(file, package)| self.store.create_archived(file, package));

        match result {
            Ok((file, package)) => {
                info!(
                    file_id = file.file_id,
                    package_id = package.package_id,
                    "Archived {} for {}, valid until {}",
                    file.file_name(),
                    owner,
                    file.expiration()
                );
                Ok(file)
            }
            Err(e) => {
                warn!("Archiving {} failed: {}", source_path, e);
                if let Err(cleanup) = fs::remove_dir_all(&evidence_dir) {
                    warn!("Could not remove {:?}: {}", evidence_dir, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn build_evidence(
        &self,
        source_path: &str,
        owner: &str,
        file_name: &str,
        dir: &Path,
        crls: CheckedCrls,
    ) -> Result<(NewArchivedFile, NewFilePackage)> {
        let authority = self.trust.authority();

        // Package0: the original and a token over it
        let origin_digest = {
            let source = Arc::clone(&self.source);
            let path = source_path.to_string();
            let dest = dir.join(file_name);
            let attempts = self.settings.transfer_attempts;
            run_blocking(move || transfer_with_retry(source.as_ref(), &path, &dest, attempts))
                .await?
        };
        let timestamp0 = authority
            .request(&origin_digest)
            .await
            .context("timestamp over original")?;
        let package0_digest = {
            let dir = dir.to_path_buf();
            let token = timestamp0.as_bytes().to_vec();
            run_blocking(move || {
                fs::write(dir.join(TIMESTAMP0), token)?;
                let (_, digest) = seal(&dir, ContainerLayer::Content)?;
                Ok(digest)
            })
            .await?
        };
        debug!("{} sealed, digest {}", PACKAGE0, package0_digest.short());

        // Package1: Package0, a signature over it and a token over the signature
        let signature_digest = {
            let trust = Arc::clone(&self.trust);
            let dir = dir.to_path_buf();
            run_blocking(move || {
                let signature = trust.signing_key().sign(&package0_digest)?;
                fs::write(dir.join(SIGNATURE), signature.as_bytes())?;
                Ok(signature.digest())
            })
            .await?
        };
        let timestamp1 = authority
            .request(&signature_digest)
            .await
            .context("timestamp over signature")?;
        let package1_digest = {
            let trust = Arc::clone(&self.trust);
            let dir = dir.to_path_buf();
            let token = timestamp1.as_bytes().to_vec();
            run_blocking(move || {
                fs::write(dir.join(TIMESTAMP1), token)?;
                trust.write_snapshot(&dir, &crls)?;
                let (_, digest) = seal(&dir, ContainerLayer::Initial)?;
                Ok(digest)
            })
            .await?
        };
        debug!("{} sealed, digest {}", PACKAGE1, package1_digest.short());

        let issued = timestamp1.issued_at();
        let file = NewArchivedFile {
            file_name: file_name.to_string(),
            owner_name: owner.to_string(),
            original_file_path: source_path.to_string(),
            package_storage_path: dir.to_path_buf(),
            origin_digest,
            time_of_first_ts: timestamp0.issued_at(),
            signing_cert: self.trust.signing_cert_pem()?,
            signature_digest,
            package0_digest,
            expiration: expiration_after(issued, self.settings.validity_years)?,
        };
        let package = NewFilePackage {
            time_stamping_authority: authority.identity().to_string(),
            issuing_date: issued,
            tsa_cert: certificate_to_pem(authority.certificate())?,
            package_digest: package1_digest,
        };
        Ok((file, package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnvironment;
    use strata_core::{digest_bytes, digest_file, extract, ErrorKind};
    use tempfile::TempDir;

    fn evidence_dirs(env: &TestEnvironment) -> Vec<PathBuf> {
        fs::read_dir(&env.storage_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[tokio::test]
    async fn test_archive_builds_package1() {
        let env = TestEnvironment::new().unwrap();
        let path = env.write_original("report.txt", b"hello").unwrap();

        let file = env.archiver().archive(&path, "alice").await.unwrap();
        assert_eq!(file.file_name(), "report.txt");
        assert_eq!(file.owner_name(), "alice");
        assert_eq!(file.fields().origin_digest, digest_bytes(b"hello"));

        // only the outer container remains in the evidence directory
        let members: Vec<_> = fs::read_dir(file.storage_path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(members, vec![PACKAGE1.to_string()]);

        let package = env.store.latest_package(file.file_id).unwrap();
        let container = file.storage_path().join(PACKAGE1);
        assert_eq!(&digest_file(&container).unwrap(), package.package_digest());
        assert_eq!(package.fields().time_stamping_authority, crate::testing::TEST_TSA_URL);
        assert!(file.fields().time_of_first_ts < package.issuing_date());
        assert_eq!(
            file.expiration(),
            expiration_after(package.issuing_date(), 5).unwrap()
        );

        let scratch = TempDir::new().unwrap();
        extract(&container, scratch.path()).unwrap();
        assert_eq!(
            digest_file(&scratch.path().join(PACKAGE0)).unwrap(),
            file.fields().package0_digest
        );
        assert_eq!(
            digest_file(&scratch.path().join(SIGNATURE)).unwrap(),
            file.fields().signature_digest
        );
        assert!(scratch.path().join(CERTIFICATE_DIR).is_dir());

        let inner = scratch.path().join("inner");
        extract(&scratch.path().join(PACKAGE0), &inner).unwrap();
        assert_eq!(fs::read(inner.join("report.txt")).unwrap(), b"hello");
        assert!(inner.join(TIMESTAMP0).exists());
    }

    #[tokio::test]
    async fn test_revoked_signing_certificate_creates_nothing() {
        let env = TestEnvironment::new().unwrap();
        env.revoke_signing_certificate().unwrap();
        let path = env.write_original("report.txt", b"hello").unwrap();

        let err = env.archiver().archive(&path, "alice").await.unwrap_err();
        assert!(matches!(err.root(), Error::CertificateNotValid(_)));
        assert!(evidence_dirs(&env).is_empty());
        assert!(env.store.all_file_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tsa_outage_leaves_no_evidence() {
        let env = TestEnvironment::new().unwrap();
        env.authority.set_offline(true);
        let path = env.write_original("report.txt", b"hello").unwrap();

        let err = env.archiver().archive(&path, "alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(evidence_dirs(&env).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_removes_evidence() {
        let env = TestEnvironment::new().unwrap();
        env.store.reject_inserts(true);
        let path = env.write_original("report.txt", b"hello").unwrap();

        let err = env.archiver().archive(&path, "alice").await.unwrap_err();
        assert!(matches!(err.root(), Error::RecordCanNotBeInserted(_)));
        assert!(evidence_dirs(&env).is_empty());
    }

    #[tokio::test]
    async fn test_missing_original() {
        let env = TestEnvironment::new().unwrap();
        let path = env.originals_dir.join("absent.txt");

        let err = env
            .archiver()
            .archive(&path.to_string_lossy(), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::FileTransferNotSuccessful(_)));
        assert!(evidence_dirs(&env).is_empty());
    }

    #[tokio::test]
    async fn test_reserved_names_rejected() {
        let env = TestEnvironment::new().unwrap();
        for name in [TIMESTAMP0, "Package7.tar"] {
            let path = env.write_original(name, b"x").unwrap();
            assert!(matches!(
                env.archiver().archive(&path, "alice").await,
                Err(Error::WrongTask(_))
            ));
        }
        let path = env.write_original("report.txt", b"x").unwrap();
        assert!(matches!(
            env.archiver().archive(&path, " ").await,
            Err(Error::WrongTask(_))
        ));
        assert!(evidence_dirs(&env).is_empty());
    }

    #[tokio::test]
    async fn test_same_name_archived_twice() {
        let env = TestEnvironment::new().unwrap();
        let path = env.write_original("report.txt", b"v1").unwrap();
        let first = env.archiver().archive(&path, "alice").await.unwrap();
        fs::write(&path, b"v2").unwrap();
        let second = env.archiver().archive(&path, "alice").await.unwrap();

        assert_ne!(first.storage_path(), second.storage_path());
        assert_eq!(
            env.store.find_file_id("alice", "report.txt").unwrap(),
            second.file_id
        );
    }
}
