//! Validator: walks the onion from the outermost layer inward
//!
//! Each layer `i` of the walk is checked against the `i`-th FilePackage
//! row (latest IssuingDate first). Renewal layers carry a token over the
//! container they wrap; the initial layer carries the signature, both
//! inner tokens and the original itself. Once the archive checks out,
//! the live original is compared with the archived digest.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use strata_core::package::{
    CERTIFICATE_DIR, PACKAGE0, PACKAGE_PREFIX, RENEWAL_TIMESTAMP, SIGNATURE, SIGNING_CERT,
    SIGNING_CRL, TIMESTAMP0, TIMESTAMP1, TSA_CA, TSA_CRL,
};
use strata_core::{
    certificate_public_key, digest_bytes, digest_file, extract, find_member, parse_certificate,
    require_member, verify_signature, verify_timestamp, ArchivedFile, ContainerLayer, Digest,
    Error, FileId, FilePackage, Result,
};

use crate::blocking::run_blocking;
use crate::config::ContactConfig;
use crate::evidence::{recorded_tsa_certificate, verify_snapshot_crl};
use crate::notifier::{Notification, Notifier};
use crate::store::RecordStore;
use crate::transport::FileSource;

/// Returned by [`Validator::validate`] once the result was dispatched
pub const VALIDATION_OK: &str = "OK";

/// Which archived file a validation task refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileIdentifier {
    Id(FileId),
    OwnerAndName { owner: String, name: String },
}

impl FileIdentifier {
    /// Accepts a number, a string of digits, `[owner, name]` or
    /// `{"owner": .., "name": ..}`
    pub fn from_json(value: &Value) -> Result<Self> {
        let wrong = || Error::WrongTask(format!("cannot identify an archived file from {}", value));
        match value {
            Value::Number(n) => n.as_i64().map(FileIdentifier::Id).ok_or_else(wrong),
            Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse().map(FileIdentifier::Id).map_err(|_| wrong())
            }
            Value::Array(items) => match items.as_slice() {
                [Value::String(owner), Value::String(name)] => Self::owner_and_name(owner, name),
                _ => Err(wrong()),
            },
            Value::Object(map) => match (
                map.get("owner").and_then(Value::as_str),
                map.get("name").and_then(Value::as_str),
            ) {
                (Some(owner), Some(name)) => Self::owner_and_name(owner, name),
                _ => Err(wrong()),
            },
            _ => Err(wrong()),
        }
    }

    fn owner_and_name(owner: &str, name: &str) -> Result<Self> {
        if owner.is_empty() || name.is_empty() {
            return Err(Error::WrongTask("owner and name must not be empty".into()));
        }
        Ok(FileIdentifier::OwnerAndName {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            FileIdentifier::Id(id) => Value::from(*id),
            FileIdentifier::OwnerAndName { owner, name } => {
                Value::Array(vec![Value::from(owner.as_str()), Value::from(name.as_str())])
            }
        }
    }
}

impl fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileIdentifier::Id(id) => write!(f, "file {}", id),
            FileIdentifier::OwnerAndName { owner, name } => write!(f, "{} of {}", name, owner),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Every layer and the live original check out
    ArchivedFileValid { origin_digest: Digest },
    /// A layer failed a check; `layer` names the container
    ArchivedFileInvalid { layer: String, cause: String },
    /// The archive is sound but the original drifted or cannot be reached
    OriginalFileInvalid { cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub file_id: FileId,
    pub file_name: String,
    #[serde(flatten)]
    pub outcome: ValidationOutcome,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        matches!(self.outcome, ValidationOutcome::ArchivedFileValid { .. })
    }

    pub fn describe(&self) -> String {
        match &self.outcome {
            ValidationOutcome::ArchivedFileValid { .. } => {
                format!("file {} is still valid", self.file_name)
            }
            ValidationOutcome::ArchivedFileInvalid { layer, cause } => format!(
                "archived file with id {} is not valid in the archive ({}: {})",
                self.file_id, layer, cause
            ),
            ValidationOutcome::OriginalFileInvalid { cause } => format!(
                "archived file with id {} is still valid, but its original is not ({})",
                self.file_id, cause
            ),
        }
    }

    pub fn notification(&self, contact: &ContactConfig, recipients: &[String]) -> Notification {
        let body = if self.is_valid() {
            format!("Result: {}", self.describe())
        } else {
            format!(
                "Result: {}\n\
                 Please contact administrator.\n\
                 \n\
                 DO NOT RESPOND TO THIS EMAIL! Contact details are below.\n\
                 \n\
                 Contact details:\n\
                 email: {}\n\
                 phone number: {}\n",
                self.describe(),
                contact.email,
                contact.phone
            )
        };
        Notification {
            recipients: recipients.to_vec(),
            subject: format!("Verification of file validity for: {}", self.file_name),
            body,
        }
    }
}

struct LayerFailure {
    layer: String,
    cause: Error,
}

impl LayerFailure {
    fn new(layer: impl Into<String>, cause: Error) -> Self {
        Self {
            layer: layer.into(),
            cause,
        }
    }
}

#[derive(Clone)]
pub struct Validator {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn FileSource>,
    notifier: Arc<dyn Notifier>,
    contact: ContactConfig,
}

impl Validator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn FileSource>,
        notifier: Arc<dyn Notifier>,
        contact: ContactConfig,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            contact,
        }
    }

    /// Verify and mail the outcome to `recipients`. The outcome travels in
    /// the notification; `Ok` only means it was dispatched.
    pub async fn validate(
        &self,
        identifier: &FileIdentifier,
        recipients: &[String],
    ) -> Result<&'static str> {
        if recipients.is_empty() {
            return Err(Error::WrongTask("validation task has no recipients".into()));
        }
        let validator = self.clone();
        let identifier = identifier.clone();
        let report = run_blocking(move || validator.verify(&identifier)).await?;
        self.notifier
            .send(&report.notification(&self.contact, recipients))
            .await?;
        Ok(VALIDATION_OK)
    }

    /// Walk every layer and check the live original, without notifying
    pub fn verify(&self, identifier: &FileIdentifier) -> Result<ValidationReport> {
        let file = self.resolve(identifier)?;
        let packages = self.store.packages(file.file_id)?;
        info!(
            file_id = file.file_id,
            layers = packages.len(),
            "Validating {}",
            file.file_name()
        );

        let outcome = match walk_layers(&file, &packages)? {
            Some(failure) => {
                warn!(
                    file_id = file.file_id,
                    "Layer {} of {} is invalid: {}",
                    failure.layer,
                    file.file_name(),
                    failure.cause
                );
                ValidationOutcome::ArchivedFileInvalid {
                    layer: failure.layer,
                    cause: failure.cause.to_string(),
                }
            }
            None => self.check_original(&file),
        };

        Ok(ValidationReport {
            file_id: file.file_id,
            file_name: file.file_name().to_string(),
            outcome,
        })
    }

    fn resolve(&self, identifier: &FileIdentifier) -> Result<ArchivedFile> {
        let file_id = match identifier {
            FileIdentifier::Id(id) => *id,
            FileIdentifier::OwnerAndName { owner, name } => self.store.find_file_id(owner, name)?,
        };
        self.store.archived(file_id)
    }

    fn check_original(&self, file: &ArchivedFile) -> ValidationOutcome {
        let archived = file.fields().origin_digest;
        match self.source.digest(&file.fields().original_file_path) {
            Ok(current) if current == archived => {
                info!(file_id = file.file_id, "{} is valid", file.file_name());
                ValidationOutcome::ArchivedFileValid {
                    origin_digest: archived,
                }
            }
            Ok(current) => {
                warn!(file_id = file.file_id, "Original of {} changed", file.file_name());
                ValidationOutcome::OriginalFileInvalid {
                    cause: format!(
                        "original digest {} differs from archived {}",
                        current.short(),
                        archived.short()
                    ),
                }
            }
            Err(e) => {
                warn!(file_id = file.file_id, "Original of {} unavailable: {}", file.file_name(), e);
                ValidationOutcome::OriginalFileInvalid {
                    cause: e.to_string(),
                }
            }
        }
    }
}

/// `Ok(None)` when every layer verifies; container names matching no
/// layer pattern are errors rather than failures
fn walk_layers(file: &ArchivedFile, packages: &[FilePackage]) -> Result<Option<LayerFailure>> {
    let scratch = TempDir::new()?;
    let mut current = match find_member(file.storage_path(), PACKAGE_PREFIX) {
        Ok(path) => path,
        Err(e) => return Ok(Some(LayerFailure::new("evidence directory", e))),
    };

    for (depth, package) in packages.iter().enumerate() {
        let layer = ContainerLayer::classify(&current)?;
        let work = scratch.path().join(depth.to_string());
        debug!("Checking {} against package {}", layer.file_name(), package.package_id);

        match layer {
            ContainerLayer::Renewal(_) => match check_renewal_layer(&current, package, &work) {
                Ok(inner) => current = inner,
                Err(e) => return Ok(Some(LayerFailure::new(layer.file_name(), e))),
            },
            ContainerLayer::Initial => {
                let remaining = packages.len() - depth - 1;
                if remaining > 0 {
                    return Ok(Some(LayerFailure::new(
                        layer.file_name(),
                        Error::MalformedData(format!(
                            "{} FilePackage records have no container",
                            remaining
                        )),
                    )));
                }
                return Ok(check_initial_layer(&current, package, file, &work)
                    .err()
                    .map(|e| LayerFailure::new(layer.file_name(), e)));
            }
            ContainerLayer::Content => {
                return Err(Error::WrongPathToArchivedFile(format!(
                    "{:?} found where a timestamp layer was expected",
                    current
                )))
            }
        }
    }

    let name = current
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Some(LayerFailure::new(
        name,
        Error::MalformedData("container has no FilePackage record".into()),
    )))
}

/// Digest `path` and compare it with what the records say
fn check_recorded_digest(path: &Path, recorded: &Digest) -> Result<Digest> {
    let actual = digest_file(path)?;
    if &actual != recorded {
        return Err(Error::DigestsNotMatched(format!(
            "{:?} has digest {}, recorded {}",
            path.file_name().unwrap_or_default(),
            actual.short(),
            recorded.short()
        )));
    }
    Ok(actual)
}

fn read_member(dir: &Path, name: &str) -> Result<Vec<u8>> {
    Ok(fs::read(require_member(dir, name)?)?)
}

/// Returns the container the renewal wraps
fn check_renewal_layer(container: &Path, package: &FilePackage, work: &Path) -> Result<PathBuf> {
    check_recorded_digest(container, package.package_digest())?;
    let layer_dir = work.join("layer");
    extract(container, &layer_dir)?;

    let inner = find_member(&layer_dir, PACKAGE_PREFIX)?;
    let token = read_member(&layer_dir, RENEWAL_TIMESTAMP)?;
    verify_timestamp(&token, &digest_file(&inner)?, &recorded_tsa_certificate(package)?)?;
    verify_snapshot_crl(&layer_dir, TSA_CRL, TSA_CA)?;
    Ok(inner)
}

fn check_initial_layer(
    container: &Path,
    package: &FilePackage,
    file: &ArchivedFile,
    work: &Path,
) -> Result<()> {
    check_recorded_digest(container, package.package_digest())?;
    let layer_dir = work.join("layer");
    extract(container, &layer_dir)?;

    let package0 = require_member(&layer_dir, PACKAGE0)?;
    let package0_digest = check_recorded_digest(&package0, &file.fields().package0_digest)?;

    let signature = read_member(&layer_dir, SIGNATURE)?;
    let signature_digest = digest_bytes(&signature);
    if signature_digest != file.fields().signature_digest {
        return Err(Error::DigestsNotMatched(format!(
            "{} has digest {}, recorded {}",
            SIGNATURE,
            signature_digest.short(),
            file.fields().signature_digest.short()
        )));
    }

    let signing_cert = parse_certificate(file.fields().signing_cert.as_bytes())?;
    let snapshot_cert = parse_certificate(&read_member(&layer_dir.join(CERTIFICATE_DIR), SIGNING_CERT)?)?;
    if snapshot_cert != signing_cert {
        return Err(Error::CertificateNotValid(
            "signing certificate in the snapshot differs from the recorded one".into(),
        ));
    }
    verify_signature(&package0_digest, &signature, &certificate_public_key(&signing_cert)?)?;

    let tsa_cert = recorded_tsa_certificate(package)?;
    verify_timestamp(&read_member(&layer_dir, TIMESTAMP1)?, &signature_digest, &tsa_cert)?;

    let content_dir = work.join("content");
    extract(&package0, &content_dir)?;
    let payload = require_member(&content_dir, file.file_name())?;
    let origin_digest = check_recorded_digest(&payload, &file.fields().origin_digest)?;
    verify_timestamp(&read_member(&content_dir, TIMESTAMP0)?, &origin_digest, &tsa_cert)?;

    verify_snapshot_crl(&layer_dir, TSA_CRL, TSA_CA)?;
    verify_snapshot_crl(&layer_dir, SIGNING_CRL, SIGNING_CERT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnvironment;
    use serde_json::json;
    use strata_core::package::PACKAGE1;
    use strata_core::NewFilePackage;

    async fn archived(env: &TestEnvironment) -> (ArchivedFile, String) {
        let path = env.write_original("report.txt", b"hello").unwrap();
        let file = env.archiver().archive(&path, "alice").await.unwrap();
        (file, path)
    }

    fn corrupt(path: &Path) {
        let mut bytes = fs::read(path).unwrap();
        bytes.push(0);
        fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn test_fresh_archive_is_valid() {
        let env = TestEnvironment::new().unwrap();
        let (file, _) = archived(&env).await;

        let result = env
            .validator()
            .validate(&FileIdentifier::Id(file.file_id), &["a@b.com".to_string()])
            .await
            .unwrap();
        assert_eq!(result, VALIDATION_OK);

        let sent = env.notifier.last().unwrap();
        assert_eq!(sent.recipients, vec!["a@b.com".to_string()]);
        assert_eq!(sent.subject, "Verification of file validity for: report.txt");
        assert_eq!(sent.body, "Result: file report.txt is still valid");

        let report = env.validator().verify(&FileIdentifier::Id(file.file_id)).unwrap();
        assert_eq!(
            report.outcome,
            ValidationOutcome::ArchivedFileValid {
                origin_digest: digest_bytes(b"hello")
            }
        );
    }

    #[tokio::test]
    async fn test_renewed_archive_is_valid() {
        let env = TestEnvironment::new().unwrap();
        let (file, _) = archived(&env).await;
        for _ in 0..2 {
            env.retimestamper().retimestamp(file.file_id).await.unwrap();
        }

        let report = env
            .validator()
            .verify(&FileIdentifier::OwnerAndName {
                owner: "alice".into(),
                name: "report.txt".into(),
            })
            .unwrap();
        assert!(report.is_valid(), "{:?}", report);
    }

    #[tokio::test]
    async fn test_changed_original_is_reported_separately() {
        let env = TestEnvironment::new().unwrap();
        let (file, path) = archived(&env).await;
        fs::write(&path, b"hellO").unwrap();

        let report = env.validator().verify(&FileIdentifier::Id(file.file_id)).unwrap();
        assert!(matches!(
            report.outcome,
            ValidationOutcome::OriginalFileInvalid { .. }
        ));

        fs::remove_file(&path).unwrap();
        env.validator()
            .validate(&FileIdentifier::Id(file.file_id), &["a@b.com".to_string()])
            .await
            .unwrap();
        let body = env.notifier.last().unwrap().body;
        assert!(body.contains("its original is not"));
        assert!(body.contains("Please contact administrator."));
        assert!(body.contains("email: archive-admin@strata.test"));
        assert!(body.contains("phone number: +1 555 0100"));
    }

    /// Original store that cannot be reached at all
    struct UnreachableSource;

    impl FileSource for UnreachableSource {
        fn describe(&self) -> String {
            "sftp://archive@offline.strata.test:22".into()
        }

        fn digest(&self, _path: &str) -> Result<Digest> {
            Err(Error::RemoteUnreachable("offline.strata.test: connection refused".into()))
        }

        fn copy_to(&self, _path: &str, _dest: &Path) -> Result<()> {
            Err(Error::RemoteUnreachable("offline.strata.test: connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_original_is_not_drift() {
        let env = TestEnvironment::new().unwrap();
        let (file, _) = archived(&env).await;
        let validator = Validator::new(
            env.store.clone(),
            Arc::new(UnreachableSource),
            env.notifier.clone(),
            env.contact.clone(),
        );

        let report = validator.verify(&FileIdentifier::Id(file.file_id)).unwrap();
        match &report.outcome {
            ValidationOutcome::OriginalFileInvalid { cause } => {
                assert!(cause.contains("Remote storage unreachable"), "{}", cause);
                assert!(!cause.contains("differs"), "{}", cause);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        validator
            .validate(&FileIdentifier::Id(file.file_id), &["a@b.com".to_string()])
            .await
            .unwrap();
        let body = env.notifier.last().unwrap().body;
        assert!(body.contains("still valid, but its original is not"));
        assert!(body.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_corrupted_layer_named_in_outcome() {
        let env = TestEnvironment::new().unwrap();
        let (file, _) = archived(&env).await;
        env.retimestamper().retimestamp(file.file_id).await.unwrap();
        corrupt(&file.storage_path().join("PackageF1.tar"));

        let report = env.validator().verify(&FileIdentifier::Id(file.file_id)).unwrap();
        match report.outcome {
            ValidationOutcome::ArchivedFileInvalid { layer, cause } => {
                assert_eq!(layer, "PackageF1.tar");
                assert!(cause.contains("digest"), "{}", cause);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupted_initial_layer() {
        let env = TestEnvironment::new().unwrap();
        let (file, _) = archived(&env).await;
        corrupt(&file.storage_path().join(PACKAGE1));

        let report = env.validator().verify(&FileIdentifier::Id(file.file_id)).unwrap();
        assert!(matches!(
            report.outcome,
            ValidationOutcome::ArchivedFileInvalid { ref layer, .. } if layer == PACKAGE1
        ));
    }

    #[tokio::test]
    async fn test_record_without_container() {
        let env = TestEnvironment::new().unwrap();
        let (file, _) = archived(&env).await;
        let latest = env.store.latest_package(file.file_id).unwrap();
        env.store
            .append_package(
                file.file_id,
                NewFilePackage {
                    issuing_date: latest.issuing_date() + chrono::Duration::seconds(1),
                    ..latest.fields().clone()
                },
            )
            .unwrap();

        let report = env.validator().verify(&FileIdentifier::Id(file.file_id)).unwrap();
        assert!(!report.is_valid());
    }

    #[tokio::test]
    async fn test_unexpected_container_name() {
        let env = TestEnvironment::new().unwrap();
        let (file, _) = archived(&env).await;
        fs::rename(
            file.storage_path().join(PACKAGE1),
            file.storage_path().join("PackageX.tar"),
        )
        .unwrap();

        assert!(matches!(
            env.validator().verify(&FileIdentifier::Id(file.file_id)),
            Err(Error::WrongPathToArchivedFile(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_file() {
        let env = TestEnvironment::new().unwrap();
        assert!(matches!(
            env.validator()
                .validate(&FileIdentifier::Id(7), &["a@b.com".to_string()])
                .await,
            Err(Error::RecordDoesNotExist(_))
        ));
        assert!(env.notifier.sent().is_empty());
    }

    #[test]
    fn test_identifier_shapes() {
        assert_eq!(FileIdentifier::from_json(&json!(12)).unwrap(), FileIdentifier::Id(12));
        assert_eq!(FileIdentifier::from_json(&json!("12")).unwrap(), FileIdentifier::Id(12));
        let pair = FileIdentifier::OwnerAndName {
            owner: "alice".into(),
            name: "report.txt".into(),
        };
        assert_eq!(FileIdentifier::from_json(&json!(["alice", "report.txt"])).unwrap(), pair);
        assert_eq!(
            FileIdentifier::from_json(&json!({"owner": "alice", "name": "report.txt"})).unwrap(),
            pair
        );
        assert_eq!(FileIdentifier::from_json(&pair.to_json()).unwrap(), pair);

        for bad in [json!("report.txt"), json!(1.5), json!(["alice"]), json!(null), json!({})] {
            assert!(
                matches!(FileIdentifier::from_json(&bad), Err(Error::WrongTask(_))),
                "{} accepted",
                bad
            );
        }
    }
}
