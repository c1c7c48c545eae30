//! Typed ArchivedFile and FilePackage records
//!
//! Digest fields are [`Digest`] values, so a record carrying a hash of the
//! wrong length (or none at all) cannot be built. Text coming back from a
//! store is converted through the `parse_*` helpers, which fail with
//! [`Error::WrongRecordFormat`].

use chrono::{DateTime, Months, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::Digest;
use crate::{Error, Result};

/// Identity of an ArchivedFile row, assigned by the store
pub type FileId = i64;

/// Identity of a FilePackage row, assigned by the store
pub type PackageId = i64;

/// ArchivedFile fields known before the store assigns an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArchivedFile {
    pub file_name: String,
    pub owner_name: String,
    pub original_file_path: String,
    pub package_storage_path: PathBuf,
    pub origin_digest: Digest,
    pub time_of_first_ts: DateTime<Utc>,
    /// PEM of the signing certificate
    pub signing_cert: String,
    pub signature_digest: Digest,
    pub package0_digest: Digest,
    pub expiration: DateTime<Utc>,
}

impl NewArchivedFile {
    /// Check the text fields; digests and times are valid by type
    pub fn validate(&self) -> Result<()> {
        non_empty("FileName", &self.file_name)?;
        non_empty("OwnerName", &self.owner_name)?;
        non_empty("OriginalFilePath", &self.original_file_path)?;
        non_empty("SigningCert", &self.signing_cert)?;
        if self.file_name.contains('/') || self.file_name.contains('\\') {
            return Err(Error::WrongRecordFormat(format!(
                "FileName {:?} contains a path separator",
                self.file_name
            )));
        }
        if self.package_storage_path.as_os_str().is_empty() {
            return Err(Error::WrongRecordFormat("PackageStoragePath is empty".into()));
        }
        Ok(())
    }
}

/// A persisted ArchivedFile row; only built through [`ArchivedFile::new`]
///
/// ```compile_fail
/// use strata_core::{ArchivedFile, NewArchivedFile};
///
/// fn unchecked(fields: NewArchivedFile) -> ArchivedFile {
///     ArchivedFile { file_id: 1, fields }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedFile {
    pub file_id: FileId,
    #[serde(flatten)]
    fields: NewArchivedFile,
}

impl ArchivedFile {
    pub fn new(file_id: FileId, fields: NewArchivedFile) -> Result<Self> {
        fields.validate()?;
        Ok(Self { file_id, fields })
    }

    pub fn fields(&self) -> &NewArchivedFile {
        &self.fields
    }

    pub fn file_name(&self) -> &str {
        &self.fields.file_name
    }

    pub fn owner_name(&self) -> &str {
        &self.fields.owner_name
    }

    pub fn storage_path(&self) -> &std::path::Path {
        &self.fields.package_storage_path
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.fields.expiration
    }

    pub fn set_expiration(&mut self, expiration: DateTime<Utc>) {
        self.fields.expiration = expiration;
    }
}

/// FilePackage fields known before the store assigns an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFilePackage {
    /// Identity (URL) of the authority that issued this layer's timestamp
    pub time_stamping_authority: String,
    pub issuing_date: DateTime<Utc>,
    /// PEM of the authority's certificate at issuance
    pub tsa_cert: String,
    pub package_digest: Digest,
}

impl NewFilePackage {
    pub fn validate(&self) -> Result<()> {
        non_empty("TimeStampingAuthority", &self.time_stamping_authority)?;
        non_empty("TsaCert", &self.tsa_cert)
    }
}

/// A persisted FilePackage row; only built through [`FilePackage::new`]
///
/// ```compile_fail
/// use strata_core::{FilePackage, NewFilePackage};
///
/// fn unchecked(fields: NewFilePackage) -> FilePackage {
///     FilePackage { package_id: 1, archived_file_id: 1, fields }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilePackage {
    pub package_id: PackageId,
    pub archived_file_id: FileId,
    #[serde(flatten)]
    fields: NewFilePackage,
}

impl FilePackage {
    pub fn new(package_id: PackageId, archived_file_id: FileId, fields: NewFilePackage) -> Result<Self> {
        fields.validate()?;
        Ok(Self {
            package_id,
            archived_file_id,
            fields,
        })
    }

    pub fn fields(&self) -> &NewFilePackage {
        &self.fields
    }

    pub fn package_digest(&self) -> &Digest {
        &self.fields.package_digest
    }

    pub fn issuing_date(&self) -> DateTime<Utc> {
        self.fields.issuing_date
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::WrongRecordFormat(format!("{} is empty", field)))
    } else {
        Ok(())
    }
}

/// `issued + years`, clamped to the last day of the month where needed
pub fn expiration_after(issued: DateTime<Utc>, years: u32) -> Result<DateTime<Utc>> {
    issued
        .checked_add_months(Months::new(years.saturating_mul(12)))
        .ok_or_else(|| Error::WrongRecordFormat(format!("{} + {} years overflows", issued, years)))
}

/// RFC 3339 text form used by the record store; fixed width, so it sorts
/// chronologically as text
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(field: &str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::WrongRecordFormat(format!("{} {:?}: {}", field, text, e)))
}

pub fn parse_digest(field: &str, text: &str) -> Result<Digest> {
    Digest::from_base64(text).map_err(|e| Error::WrongRecordFormat(format!("{}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::digest_bytes;
    use chrono::TimeZone;

    fn sample() -> NewArchivedFile {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        NewArchivedFile {
            file_name: "report.txt".into(),
            owner_name: "alice".into(),
            original_file_path: "/data/report.txt".into(),
            package_storage_path: PathBuf::from("/srv/strata"),
            origin_digest: digest_bytes(b"hello"),
            time_of_first_ts: now,
            signing_cert: "-----BEGIN CERTIFICATE-----".into(),
            signature_digest: digest_bytes(b"sig"),
            package0_digest: digest_bytes(b"p0"),
            expiration: expiration_after(now, 5).unwrap(),
        }
    }

    #[test]
    fn test_valid_record_constructs() {
        let record = ArchivedFile::new(1, sample()).unwrap();
        assert_eq!(record.file_name(), "report.txt");
        assert_eq!(record.expiration().to_rfc3339(), "2029-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_invalid_record_does_not_construct() {
        let mut fields = sample();
        fields.owner_name = " ".into();
        assert!(matches!(
            ArchivedFile::new(1, fields),
            Err(Error::WrongRecordFormat(_))
        ));

        let mut fields = sample();
        fields.file_name = "../etc/passwd".into();
        assert!(ArchivedFile::new(1, fields).is_err());
    }

    #[test]
    fn test_leap_day_expiration() {
        let leap = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        let expires = expiration_after(leap, 1).unwrap();
        assert_eq!(expires, Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_stored_text_conversion() {
        let digest = digest_bytes(b"x");
        assert_eq!(parse_digest("PackageHashSha512", &digest.to_base64()).unwrap(), digest);
        assert!(matches!(
            parse_digest("PackageHashSha512", "c2hvcnQ="),
            Err(Error::WrongRecordFormat(_))
        ));

        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_time("IssuingDate", &format_time(&t)).unwrap(), t);
        assert!(parse_time("IssuingDate", "yesterday").is_err());
    }

    #[test]
    fn test_package_requires_authority() {
        let fields = NewFilePackage {
            time_stamping_authority: String::new(),
            issuing_date: Utc::now(),
            tsa_cert: "pem".into(),
            package_digest: digest_bytes(b"p1"),
        };
        assert!(FilePackage::new(1, 1, fields).is_err());
    }
}
