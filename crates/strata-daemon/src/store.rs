//! Record store for ArchivedFile and FilePackage rows

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use strata_core::{
    ArchivedFile, Error, FileId, FilePackage, NewArchivedFile, NewFilePackage, PackageId, Result,
};

pub use crate::sqlite::SqliteStore;

/// Narrow read/write interface the evidence operations persist through
pub trait RecordStore: Send + Sync {
    /// Insert an ArchivedFile and its first FilePackage as one unit
    fn create_archived(
        &self,
        file: NewArchivedFile,
        package: NewFilePackage,
    ) -> Result<(ArchivedFile, FilePackage)>;

    fn archived(&self, file_id: FileId) -> Result<ArchivedFile>;

    /// Most recently archived file with this owner and name
    fn find_file_id(&self, owner: &str, file_name: &str) -> Result<FileId>;

    /// FilePackage with the latest IssuingDate
    fn latest_package(&self, file_id: FileId) -> Result<FilePackage> {
        self.packages(file_id)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::RecordDoesNotExist(format!("no packages for file {}", file_id)))
    }

    /// All FilePackage rows of a file, outermost (latest IssuingDate) first
    fn packages(&self, file_id: FileId) -> Result<Vec<FilePackage>>;

    fn append_package(&self, file_id: FileId, package: NewFilePackage) -> Result<FilePackage>;

    fn update_expiration(&self, file_id: FileId, expiration: DateTime<Utc>) -> Result<()>;

    /// Append a renewal's FilePackage and move the file's expiration in one
    /// unit: either both writes land or neither does
    fn record_renewal(
        &self,
        file_id: FileId,
        package: NewFilePackage,
        expiration: DateTime<Utc>,
    ) -> Result<FilePackage>;

    fn all_file_ids(&self) -> Result<Vec<FileId>>;
}

/// Outermost first; ties broken by insertion order
pub(crate) fn sort_outermost_first(packages: &mut [FilePackage]) {
    packages.sort_by(|a, b| {
        b.issuing_date()
            .cmp(&a.issuing_date())
            .then(b.package_id.cmp(&a.package_id))
    });
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<FileId, ArchivedFile>,
    packages: Vec<FilePackage>,
    next_file_id: FileId,
    next_package_id: PackageId,
}

/// In-process record store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    reject_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every further insert fail with `RecordCanNotBeInserted`
    pub fn reject_inserts(&self, reject: bool) {
        self.reject_inserts.store(reject, Ordering::SeqCst);
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Database("record store lock poisoned".into()))
    }

    fn check_inserts(&self) -> Result<()> {
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(Error::RecordCanNotBeInserted("store is rejecting inserts".into()));
        }
        Ok(())
    }
}

fn missing(file_id: FileId) -> Error {
    Error::RecordDoesNotExist(format!("archived file {}", file_id))
}

impl RecordStore for MemoryStore {
    fn create_archived(
        &self,
        file: NewArchivedFile,
        package: NewFilePackage,
    ) -> Result<(ArchivedFile, FilePackage)> {
        self.check_inserts()?;
        let mut state = self.state()?;

        let file_id = state.next_file_id + 1;
        let package_id = state.next_package_id + 1;
        let archived = ArchivedFile::new(file_id, file)?;
        let package = FilePackage::new(package_id, file_id, package)?;

        state.next_file_id = file_id;
        state.next_package_id = package_id;
        state.files.insert(file_id, archived.clone());
        state.packages.push(package.clone());
        Ok((archived, package))
    }

    fn archived(&self, file_id: FileId) -> Result<ArchivedFile> {
        self.state()?
            .files
            .get(&file_id)
            .cloned()
            .ok_or_else(|| missing(file_id))
    }

    fn find_file_id(&self, owner: &str, file_name: &str) -> Result<FileId> {
        self.state()?
            .files
            .values()
            .rev()
            .find(|f| f.owner_name() == owner && f.file_name() == file_name)
            .map(|f| f.file_id)
            .ok_or_else(|| {
                Error::RecordDoesNotExist(format!("no file {:?} owned by {:?}", file_name, owner))
            })
    }

    fn packages(&self, file_id: FileId) -> Result<Vec<FilePackage>> {
        let state = self.state()?;
        if !state.files.contains_key(&file_id) {
            return Err(missing(file_id));
        }
        let mut packages: Vec<FilePackage> = state
            .packages
            .iter()
            .filter(|p| p.archived_file_id == file_id)
            .cloned()
            .collect();
        sort_outermost_first(&mut packages);
        Ok(packages)
    }

    fn append_package(&self, file_id: FileId, package: NewFilePackage) -> Result<FilePackage> {
        self.check_inserts()?;
        let mut state = self.state()?;
        if !state.files.contains_key(&file_id) {
            return Err(missing(file_id));
        }
        let package_id = state.next_package_id + 1;
        let package = FilePackage::new(package_id, file_id, package)?;
        state.next_package_id = package_id;
        state.packages.push(package.clone());
        Ok(package)
    }

    fn update_expiration(&self, file_id: FileId, expiration: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        let file = state.files.get_mut(&file_id).ok_or_else(|| missing(file_id))?;
        file.set_expiration(expiration);
        Ok(())
    }

    fn record_renewal(
        &self,
        file_id: FileId,
        package: NewFilePackage,
        expiration: DateTime<Utc>,
    ) -> Result<FilePackage> {
        self.check_inserts()?;
        let mut state = self.state()?;
        let package_id = state.next_package_id + 1;
        let package = FilePackage::new(package_id, file_id, package)?;
        state
            .files
            .get_mut(&file_id)
            .ok_or_else(|| missing(file_id))?
            .set_expiration(expiration);
        state.next_package_id = package_id;
        state.packages.push(package.clone());
        Ok(package)
    }

    fn all_file_ids(&self) -> Result<Vec<FileId>> {
        Ok(self.state()?.files.keys().copied().collect())
    }
}
