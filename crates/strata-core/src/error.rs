//! Error types for the Strata evidence engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure class, used by task dispatch to decide how a failure is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Data could not be moved or fetched
    Transport,
    /// A certificate, timestamp, signature or digest check failed
    Trust,
    /// Malformed task, missing member or unexpected storage layout
    Format,
    /// Record store rejected or could not serve a request
    Persistence,
    /// Anything unclassified; a further attempt may succeed
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    // Transport
    #[error("File transfer not successful: {0}")]
    FileTransferNotSuccessful(String),

    #[error("Remote storage unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Time-stamping authority unreachable: {0}")]
    TsaUnreachable(String),

    #[error("CRL unavailable: {0}")]
    CrlUnavailable(String),

    // Trust
    #[error("Certificate not valid: {0}")]
    CertificateNotValid(String),

    #[error("Timestamp invalid: {0}")]
    TimestampInvalid(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Digests do not match: {0}")]
    DigestsNotMatched(String),

    // Format
    #[error("Wrong task: {0}")]
    WrongTask(String),

    #[error("File not in directory: {0}")]
    FileNotInDirectory(String),

    #[error("Wrong path to archived file: {0}")]
    WrongPathToArchivedFile(String),

    #[error("Malformed data: {0}")]
    MalformedData(String),

    // Persistence
    #[error("Record does not exist: {0}")]
    RecordDoesNotExist(String),

    #[error("Record can not be inserted: {0}")]
    RecordCanNotBeInserted(String),

    #[error("Wrong record format: {0}")]
    WrongRecordFormat(String),

    #[error("Database error: {0}")]
    Database(String),

    // Internal
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with a description of what was being attempted
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context layers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Error::FileTransferNotSuccessful(_)
            | Error::RemoteUnreachable(_)
            | Error::TsaUnreachable(_)
            | Error::CrlUnavailable(_) => ErrorKind::Transport,
            Error::CertificateNotValid(_)
            | Error::TimestampInvalid(_)
            | Error::InvalidSignature(_)
            | Error::DigestsNotMatched(_) => ErrorKind::Trust,
            Error::WrongTask(_)
            | Error::FileNotInDirectory(_)
            | Error::WrongPathToArchivedFile(_)
            | Error::MalformedData(_) => ErrorKind::Format,
            Error::RecordDoesNotExist(_)
            | Error::RecordCanNotBeInserted(_)
            | Error::WrongRecordFormat(_)
            | Error::Database(_) => ErrorKind::Persistence,
            Error::Io(_)
            | Error::Crypto(_)
            | Error::Config(_)
            | Error::Internal(_)
            | Error::Context { .. } => ErrorKind::Internal,
        }
    }
}

impl From<der::Error> for Error {
    fn from(e: der::Error) -> Self {
        Error::MalformedData(e.to_string())
    }
}

/// Attach context to the error of a `Result`
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
