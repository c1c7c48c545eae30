//! Record store persistence using SQLite

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use strata_core::records::{format_time, parse_digest, parse_time};
use strata_core::{
    ArchivedFile, Error, FileId, FilePackage, NewArchivedFile, NewFilePackage, Result,
};

use crate::store::{sort_outermost_first, RecordStore};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS ArchivedFiles (
        FileID INTEGER PRIMARY KEY AUTOINCREMENT,
        FileName TEXT NOT NULL,
        OwnerName TEXT NOT NULL,
        OriginalFilePath TEXT NOT NULL,
        PackageStoragePath TEXT NOT NULL,
        OriginFileHashSha512 TEXT NOT NULL,
        TimeOfFirstTS TEXT NOT NULL,
        SigningCert TEXT NOT NULL,
        SignatureHashSha512 TEXT NOT NULL,
        Package0HashSha512 TEXT NOT NULL,
        ExpirationDateTS TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS FilePackages (
        PackageID INTEGER PRIMARY KEY AUTOINCREMENT,
        ArchivedFileID INTEGER NOT NULL,
        TimeStampingAuthority TEXT NOT NULL,
        IssuingDate TEXT NOT NULL,
        TsaCert TEXT NOT NULL,
        PackageHashSha512 TEXT NOT NULL,
        FOREIGN KEY (ArchivedFileID) REFERENCES ArchivedFiles(FileID)
    );

    CREATE INDEX IF NOT EXISTS idx_archived_owner_name
        ON ArchivedFiles(OwnerName, FileName);

    CREATE INDEX IF NOT EXISTS idx_packages_file
        ON FilePackages(ArchivedFileID, IssuingDate DESC);
"#;

const ARCHIVED_COLUMNS: &str = "FileID, FileName, OwnerName, OriginalFilePath, \
     PackageStoragePath, OriginFileHashSha512, TimeOfFirstTS, SigningCert, \
     SignatureHashSha512, Package0HashSha512, ExpirationDateTS";

const PACKAGE_COLUMNS: &str = "PackageID, ArchivedFileID, TimeStampingAuthority, \
     IssuingDate, TsaCert, PackageHashSha512";

/// Map a rusqlite error onto the persistence taxonomy
fn db_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            warn!("Constraint violation: {}", e);
            Error::RecordCanNotBeInserted(e.to_string())
        }
        rusqlite::Error::QueryReturnedNoRows => Error::RecordDoesNotExist(e.to_string()),
        _ => Error::Database(e.to_string()),
    }
}

/// ArchivedFiles row as stored text
struct ArchivedRow {
    file_id: FileId,
    file_name: String,
    owner_name: String,
    original_file_path: String,
    package_storage_path: String,
    origin_digest: String,
    time_of_first_ts: String,
    signing_cert: String,
    signature_digest: String,
    package0_digest: String,
    expiration: String,
}

impl ArchivedRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_id: row.get(0)?,
            file_name: row.get(1)?,
            owner_name: row.get(2)?,
            original_file_path: row.get(3)?,
            package_storage_path: row.get(4)?,
            origin_digest: row.get(5)?,
            time_of_first_ts: row.get(6)?,
            signing_cert: row.get(7)?,
            signature_digest: row.get(8)?,
            package0_digest: row.get(9)?,
            expiration: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<ArchivedFile> {
        ArchivedFile::new(
            self.file_id,
            NewArchivedFile {
                file_name: self.file_name,
                owner_name: self.owner_name,
                original_file_path: self.original_file_path,
                package_storage_path: PathBuf::from(self.package_storage_path),
                origin_digest: parse_digest("OriginFileHashSha512", &self.origin_digest)?,
                time_of_first_ts: parse_time("TimeOfFirstTS", &self.time_of_first_ts)?,
                signing_cert: self.signing_cert,
                signature_digest: parse_digest("SignatureHashSha512", &self.signature_digest)?,
                package0_digest: parse_digest("Package0HashSha512", &self.package0_digest)?,
                expiration: parse_time("ExpirationDateTS", &self.expiration)?,
            },
        )
    }
}

/// FilePackages row as stored text
struct PackageRow {
    package_id: i64,
    archived_file_id: FileId,
    authority: String,
    issuing_date: String,
    tsa_cert: String,
    package_digest: String,
}

impl PackageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            package_id: row.get(0)?,
            archived_file_id: row.get(1)?,
            authority: row.get(2)?,
            issuing_date: row.get(3)?,
            tsa_cert: row.get(4)?,
            package_digest: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<FilePackage> {
        FilePackage::new(
            self.package_id,
            self.archived_file_id,
            NewFilePackage {
                time_stamping_authority: self.authority,
                issuing_date: parse_time("IssuingDate", &self.issuing_date)?,
                tsa_cert: self.tsa_cert,
                package_digest: parse_digest("PackageHashSha512", &self.package_digest)?,
            },
        )
    }
}

fn insert_package(
    conn: &Connection,
    file_id: FileId,
    package: &NewFilePackage,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO FilePackages (ArchivedFileID, TimeStampingAuthority, IssuingDate, \
         TsaCert, PackageHashSha512) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            file_id,
            package.time_stamping_authority,
            format_time(&package.issuing_date),
            package.tsa_cert,
            package.package_digest.to_base64(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// SQLite-backed record store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("Opened record store at {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(())
    }

    fn file_exists(conn: &Connection, file_id: FileId) -> Result<bool> {
        conn.query_row(
            "SELECT 1 FROM ArchivedFiles WHERE FileID = ?1",
            params![file_id],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(db_err)
    }
}

fn missing(file_id: FileId) -> Error {
    Error::RecordDoesNotExist(format!("archived file {}", file_id))
}

impl RecordStore for SqliteStore {
    fn create_archived(
        &self,
        file: NewArchivedFile,
        package: NewFilePackage,
    ) -> Result<(ArchivedFile, FilePackage)> {
        file.validate()?;
        package.validate()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            &format!(
                "INSERT INTO ArchivedFiles ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                ARCHIVED_COLUMNS
            ),
            params![
                file.file_name,
                file.owner_name,
                file.original_file_path,
                file.package_storage_path.to_string_lossy(),
                file.origin_digest.to_base64(),
                format_time(&file.time_of_first_ts),
                file.signing_cert,
                file.signature_digest.to_base64(),
                file.package0_digest.to_base64(),
                format_time(&file.expiration),
            ],
        )
        .map_err(db_err)?;
        let file_id = tx.last_insert_rowid();
        let package_id = insert_package(&tx, file_id, &package).map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        debug!(file_id, package_id, "Inserted archived file records");
        Ok((
            ArchivedFile::new(file_id, file)?,
            FilePackage::new(package_id, file_id, package)?,
        ))
    }

    fn archived(&self, file_id: FileId) -> Result<ArchivedFile> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM ArchivedFiles WHERE FileID = ?1", ARCHIVED_COLUMNS),
                params![file_id],
                ArchivedRow::read,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| missing(file_id))?;
        row.into_record()
    }

    fn find_file_id(&self, owner: &str, file_name: &str) -> Result<FileId> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT FileID FROM ArchivedFiles WHERE OwnerName = ?1 AND FileName = ?2 \
             ORDER BY FileID DESC LIMIT 1",
            params![owner, file_name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| {
            Error::RecordDoesNotExist(format!("no file {:?} owned by {:?}", file_name, owner))
        })
    }

    fn packages(&self, file_id: FileId) -> Result<Vec<FilePackage>> {
        let conn = self.conn()?;
        if !Self::file_exists(&conn, file_id)? {
            return Err(missing(file_id));
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM FilePackages WHERE ArchivedFileID = ?1 \
                 ORDER BY IssuingDate DESC, PackageID DESC",
                PACKAGE_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![file_id], PackageRow::read)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut packages = rows
            .into_iter()
            .map(PackageRow::into_record)
            .collect::<Result<Vec<_>>>()?;
        // text ordering already matches; re-sort on parsed times regardless
        sort_outermost_first(&mut packages);
        Ok(packages)
    }

    fn append_package(&self, file_id: FileId, package: NewFilePackage) -> Result<FilePackage> {
        package.validate()?;
        let conn = self.conn()?;
        if !Self::file_exists(&conn, file_id)? {
            return Err(missing(file_id));
        }
        let package_id = insert_package(&conn, file_id, &package).map_err(db_err)?;
        FilePackage::new(package_id, file_id, package)
    }

    fn update_expiration(&self, file_id: FileId, expiration: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE ArchivedFiles SET ExpirationDateTS = ?1 WHERE FileID = ?2",
                params![format_time(&expiration), file_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(missing(file_id));
        }
        Ok(())
    }

    fn record_renewal(
        &self,
        file_id: FileId,
        package: NewFilePackage,
        expiration: DateTime<Utc>,
    ) -> Result<FilePackage> {
        package.validate()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        if !Self::file_exists(&tx, file_id)? {
            return Err(missing(file_id));
        }
        let package_id = insert_package(&tx, file_id, &package).map_err(db_err)?;
        tx.execute(
            "UPDATE ArchivedFiles SET ExpirationDateTS = ?1 WHERE FileID = ?2",
            params![format_time(&expiration), file_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        debug!(file_id, package_id, "Recorded renewal");
        FilePackage::new(package_id, file_id, package)
    }

    fn all_file_ids(&self) -> Result<Vec<FileId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT FileID FROM ArchivedFiles ORDER BY FileID")
            .map_err(db_err)?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<FileId>>>()
            .map_err(db_err)?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{exercise_store, new_file, new_package};

    #[test]
    fn test_sqlite_store() {
        exercise_store(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.db");
        let file_id = {
            let store = SqliteStore::open(&path).unwrap();
            let (file, _) = store
                .create_archived(new_file("report.txt", "alice"), new_package(0))
                .unwrap();
            file.file_id
        };

        let store = SqliteStore::open(&path).unwrap();
        let file = store.archived(file_id).unwrap();
        assert_eq!(file.fields(), &new_file("report.txt", "alice"));
        assert_eq!(store.packages(file_id).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_renewal_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (file, _) = store
            .create_archived(new_file("report.txt", "alice"), new_package(0))
            .unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER freeze_expiration BEFORE UPDATE ON ArchivedFiles \
                 BEGIN SELECT RAISE(ABORT, 'expiration frozen'); END;",
            )
            .unwrap();

        let later = Utc::now() + chrono::Duration::days(3650);
        assert!(store
            .record_renewal(file.file_id, new_package(60), later)
            .is_err());
        assert_eq!(store.packages(file.file_id).unwrap().len(), 1);
        assert_eq!(store.archived(file.file_id).unwrap().expiration(), file.expiration());
    }

    #[test]
    fn test_corrupted_digest_is_wrong_format() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (file, _) = store
            .create_archived(new_file("report.txt", "alice"), new_package(0))
            .unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE ArchivedFiles SET Package0HashSha512 = 'dG9vIHNob3J0' WHERE FileID = ?1",
                params![file.file_id],
            )
            .unwrap();

        assert!(matches!(
            store.archived(file.file_id),
            Err(Error::WrongRecordFormat(_))
        ));
    }
}
