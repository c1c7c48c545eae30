//! Retimestamper: wraps the outermost container in a fresh timestamp layer
//!
//! A renewal turns the evidence directory's single `Package*.tar` into
//! `PackageF{n}.tar` holding the previous container, a token over its
//! digest and a refreshed certificate snapshot. `n` is the number of
//! FilePackage rows before the renewal, so names never repeat.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use strata_core::package::{
    CERTIFICATE_DIR, PACKAGE_PREFIX, RENEWAL_TIMESTAMP, SIGNATURE, TIMESTAMP1,
};
use strata_core::records::expiration_after;
use strata_core::{
    certificate_to_pem, container_digest, digest_file, extract, find_member, require_member,
    seal, verify_timestamp, ContainerLayer, Digest, Error, FileId, FilePackage, NewFilePackage,
    Result, ResultExt,
};

use crate::blocking::run_blocking;
use crate::evidence::{recorded_tsa_certificate, TrustContext};
use crate::store::RecordStore;

pub struct Retimestamper {
    store: Arc<dyn RecordStore>,
    trust: Arc<TrustContext>,
    validity_years: u32,
    in_flight: Mutex<HashSet<FileId>>,
}

/// Marks a file as being renewed until dropped
struct RenewalClaim<'a> {
    in_flight: &'a Mutex<HashSet<FileId>>,
    file_id: FileId,
}

impl Drop for RenewalClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.file_id);
    }
}

impl Retimestamper {
    pub fn new(store: Arc<dyn RecordStore>, trust: Arc<TrustContext>, validity_years: u32) -> Self {
        Self {
            store,
            trust,
            validity_years,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, file_id: FileId) -> Result<RenewalClaim<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_flight.insert(file_id) {
            return Err(Error::WrongTask(format!(
                "renewal of file {} is already running",
                file_id
            )));
        }
        Ok(RenewalClaim {
            in_flight: &self.in_flight,
            file_id,
        })
    }

    /// Add a timestamp layer around the current outermost container.
    /// A second renewal of a file that is still being renewed is refused.
    pub async fn retimestamp(&self, file_id: FileId) -> Result<FilePackage> {
        let _claim = self.claim(file_id)?;
        let file = self.store.archived(file_id)?;
        let packages = self.store.packages(file_id)?;
        let latest = packages.first().cloned().ok_or_else(|| {
            Error::RecordDoesNotExist(format!("no packages for file {}", file_id))
        })?;
        let dir = file.storage_path().to_path_buf();

        let outer_digest = {
            let dir = dir.clone();
            run_blocking(move || check_outer_layer(&dir, &latest)).await?
        };

        let crls = self.trust.renewal_crls().await?;
        let authority = self.trust.authority();
        let token = authority
            .request(&outer_digest)
            .await
            .context("renewal timestamp")?;

        let renewal = u32::try_from(packages.len())
            .map(ContainerLayer::Renewal)
            .map_err(|_| Error::WrongRecordFormat(format!("file {} has too many packages", file_id)))?;

        let (container, package_digest) = {
            let trust = Arc::clone(&self.trust);
            let dir = dir.clone();
            let token = token.as_bytes().to_vec();
            run_blocking(move || {
                let sealed = fs::write(dir.join(RENEWAL_TIMESTAMP), token)
                    .map_err(Error::from)
                    .and_then(|_| trust.write_snapshot(&dir, &crls))
                    .and_then(|_| seal(&dir, renewal));
                if sealed.is_err() {
                    discard_partial_renewal(&dir, &renewal.file_name());
                }
                sealed
            })
            .await?
        };
        debug!("{:?} sealed, digest {}", container, package_digest.short());

        let issued = token.issued_at();
        let record = NewFilePackage {
            time_stamping_authority: authority.identity().to_string(),
            issuing_date: issued,
            tsa_cert: certificate_to_pem(authority.certificate())?,
            package_digest,
        };
        let expiration = expiration_after(issued, self.validity_years)?;
        let package = match self.store.record_renewal(file_id, record, expiration) {
            Ok(package) => package,
            Err(e) => {
                warn!("Recording renewal of file {} failed: {}", file_id, e);
                let restored = run_blocking(move || unwrap_layer(&dir, &container)).await;
                if let Err(restore) = restored {
                    warn!("Could not restore previous container of file {}: {}", file_id, restore);
                }
                return Err(e);
            }
        };

        info!(
            file_id,
            package_id = package.package_id,
            "Renewed {} as {}, valid until {}",
            file.file_name(),
            renewal.file_name(),
            expiration
        );
        Ok(package)
    }
}

/// Compare the outermost container with its row and check the token it
/// carries; returns the container's digest
fn check_outer_layer(dir: &Path, latest: &FilePackage) -> Result<Digest> {
    let outer = find_member(dir, PACKAGE_PREFIX)?;
    let layer = ContainerLayer::classify(&outer)?;
    let outer_digest = container_digest(&outer)?;
    if &outer_digest != latest.package_digest() {
        return Err(Error::DigestsNotMatched(format!(
            "{:?} no longer matches package {} of file {}",
            outer, latest.package_id, latest.archived_file_id
        )));
    }
    verify_layer_timestamp(&outer, layer, latest)
        .context(format!("verifying {}", layer.file_name()))?;
    Ok(outer_digest)
}

/// Check the token a container carries over the member it protects
fn verify_layer_timestamp(
    container: &Path,
    layer: ContainerLayer,
    package: &FilePackage,
) -> Result<()> {
    let scratch = TempDir::new()?;
    extract(container, scratch.path())?;

    let (token_name, covered) = match layer {
        ContainerLayer::Initial => (TIMESTAMP1, require_member(scratch.path(), SIGNATURE)?),
        ContainerLayer::Renewal(_) => (
            RENEWAL_TIMESTAMP,
            find_member(scratch.path(), PACKAGE_PREFIX)?,
        ),
        ContainerLayer::Content => {
            return Err(Error::WrongPathToArchivedFile(format!(
                "{:?} is not a timestamp layer",
                container
            )))
        }
    };
    let token = fs::read(require_member(scratch.path(), token_name)?)?;
    verify_timestamp(&token, &digest_file(&covered)?, &recorded_tsa_certificate(package)?)?;
    Ok(())
}

/// Remove whatever a failed renewal left next to the previous container
fn discard_partial_renewal(dir: &Path, container_name: &str) {
    for name in [RENEWAL_TIMESTAMP, container_name] {
        let path = dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove partial renewal member {:?}: {}", path, e),
        }
    }
    let snapshot = dir.join(CERTIFICATE_DIR);
    match fs::remove_dir_all(&snapshot) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial snapshot {:?}: {}", snapshot, e),
    }
}

/// Undo a sealed renewal: put the previous container back in place
fn unwrap_layer(dir: &Path, container: &Path) -> Result<()> {
    let scratch = TempDir::new()?;
    extract(container, scratch.path())?;
    let previous = find_member(scratch.path(), PACKAGE_PREFIX)?;
    let name = previous
        .file_name()
        .ok_or_else(|| Error::MalformedData(format!("unnamed member in {:?}", container)))?;
    fs::copy(&previous, dir.join(name))?;
    fs::remove_file(container)?;
    Ok(())
}
