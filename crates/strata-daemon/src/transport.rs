//! Access to original files, on local disk or a remote SFTP store

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use strata_core::{digest_file, Digest, Error, ErrorKind, Result};

use crate::config::StrataConfig;

/// Where original files live
pub trait FileSource: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Digest of the original, computed where it lives
    fn digest(&self, path: &str) -> Result<Digest>;

    /// Copy the original to `dest` on local disk
    fn copy_to(&self, path: &str, dest: &Path) -> Result<()>;
}

/// Originals on the local filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalSource;

impl FileSource for LocalSource {
    fn describe(&self) -> String {
        "local filesystem".to_string()
    }

    fn digest(&self, path: &str) -> Result<Digest> {
        digest_file(Path::new(path))
            .map_err(|e| Error::FileTransferNotSuccessful(format!("cannot read {}: {}", path, e)))
    }

    fn copy_to(&self, path: &str, dest: &Path) -> Result<()> {
        fs::copy(path, dest).map_err(|e| {
            Error::FileTransferNotSuccessful(format!("cannot copy {} to {:?}: {}", path, dest, e))
        })?;
        Ok(())
    }
}

/// Final path component, accepting both `/` and `\` separators
pub fn file_name_of(path: &str) -> Result<String> {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .ok_or_else(|| Error::WrongTask(format!("no file name in path {:?}", path)))
}

/// Copy an original into `dest`, re-digesting the copy each time, until
/// the copy matches the digest taken at the source or `attempts` runs out
pub fn transfer_with_retry(
    source: &dyn FileSource,
    path: &str,
    dest: &Path,
    attempts: u32,
) -> Result<Digest> {
    let origin = source.digest(path)?;
    debug!("Origin digest of {}: {}", path, origin.short());

    for attempt in 1..=attempts.max(1) {
        match source.copy_to(path, dest) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Transport && !matches!(e.root(), Error::RemoteUnreachable(_)) => {
                warn!(attempt, "Transfer of {} failed: {}", path, e);
                continue;
            }
            Err(e) => return Err(e),
        }

        let copied = digest_file(dest)?;
        if copied == origin {
            info!(attempt, "Transferred {} from {}", path, source.describe());
            return Ok(origin);
        }
        warn!(
            attempt,
            "Digest of copied {} ({}) differs from origin ({})",
            path,
            copied.short(),
            origin.short()
        );
    }

    // leave nothing half-copied behind
    let _ = fs::remove_file(dest);
    Err(Error::FileTransferNotSuccessful(format!(
        "{} did not arrive intact after {} attempts",
        path, attempts
    )))
}

/// File source selected by configuration
pub fn source_from_config(config: &StrataConfig) -> Result<Arc<dyn FileSource>> {
    match &config.remote_access {
        None => Ok(Arc::new(LocalSource)),
        #[cfg(feature = "sftp")]
        Some(remote) => Ok(Arc::new(SftpSource::new(remote.clone()))),
        #[cfg(not(feature = "sftp"))]
        Some(remote) => Err(Error::Config(format!(
            "remote_access to {} configured but SFTP support is not compiled in",
            remote.host
        ))),
    }
}

#[cfg(feature = "sftp")]
pub use sftp::SftpSource;

#[cfg(feature = "sftp")]
mod sftp {
    use ssh2::Session;
    use std::fs::File;
    use std::io;
    use std::net::TcpStream;
    use std::path::Path;
    use tracing::debug;

    use strata_core::{digest_reader, Digest, Error, Result};

    use super::FileSource;
    use crate::config::RemoteAccess;

    /// Originals on a remote SFTP server; one session per operation
    pub struct SftpSource {
        remote: RemoteAccess,
    }

    fn unreachable(host: &str, e: impl std::fmt::Display) -> Error {
        Error::RemoteUnreachable(format!("{}: {}", host, e))
    }

    impl SftpSource {
        pub fn new(remote: RemoteAccess) -> Self {
            Self { remote }
        }

        fn session(&self) -> Result<Session> {
            let host = &self.remote.host;
            let tcp = TcpStream::connect((host.as_str(), self.remote.port))
                .map_err(|e| unreachable(host, e))?;
            let mut session = Session::new().map_err(|e| unreachable(host, e))?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(|e| unreachable(host, e))?;

            match (&self.remote.key_path, &self.remote.password) {
                (Some(key), _) => session
                    .userauth_pubkey_file(&self.remote.username, None, key, None)
                    .map_err(|e| unreachable(host, e))?,
                (None, Some(password)) => session
                    .userauth_password(&self.remote.username, password)
                    .map_err(|e| unreachable(host, e))?,
                (None, None) => {
                    return Err(Error::Config("remote_access has no credentials".into()))
                }
            }
            if !session.authenticated() {
                return Err(unreachable(host, "authentication rejected"));
            }
            debug!("SFTP session to {} established", host);
            Ok(session)
        }
    }

    impl FileSource for SftpSource {
        fn describe(&self) -> String {
            format!("sftp://{}@{}:{}", self.remote.username, self.remote.host, self.remote.port)
        }

        fn digest(&self, path: &str) -> Result<Digest> {
            let session = self.session()?;
            let sftp = session.sftp().map_err(|e| unreachable(&self.remote.host, e))?;
            let file = sftp.open(Path::new(path)).map_err(|e| {
                Error::FileTransferNotSuccessful(format!("cannot open remote {}: {}", path, e))
            })?;
            digest_reader(file)
        }

        fn copy_to(&self, path: &str, dest: &Path) -> Result<()> {
            let session = self.session()?;
            let sftp = session.sftp().map_err(|e| unreachable(&self.remote.host, e))?;
            let mut remote = sftp.open(Path::new(path)).map_err(|e| {
                Error::FileTransferNotSuccessful(format!("cannot open remote {}: {}", path, e))
            })?;
            let mut local = File::create(dest)?;
            io::copy(&mut remote, &mut local).map_err(|e| {
                Error::FileTransferNotSuccessful(format!("copy of remote {} broke off: {}", path, e))
            })?;
            local.sync_all()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Corrupts the first `bad_copies` copies
    struct FlakySource {
        inner: LocalSource,
        bad_copies: u32,
        copies: AtomicU32,
    }

    impl FileSource for FlakySource {
        fn describe(&self) -> String {
            "flaky".into()
        }

        fn digest(&self, path: &str) -> Result<Digest> {
            self.inner.digest(path)
        }

        fn copy_to(&self, path: &str, dest: &Path) -> Result<()> {
            let n = self.copies.fetch_add(1, Ordering::SeqCst);
            self.inner.copy_to(path, dest)?;
            if n < self.bad_copies {
                fs::write(dest, b"garbled")?;
            }
            Ok(())
        }
    }

    fn original(dir: &TempDir) -> String {
        let path = dir.path().join("report.txt");
        fs::write(&path, b"hello").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_local_transfer() {
        let dir = TempDir::new().unwrap();
        let src = original(&dir);
        let dest = dir.path().join("copy");

        let digest = transfer_with_retry(&LocalSource, &src, &dest, 3).unwrap();
        assert_eq!(digest, strata_core::digest_bytes(b"hello"));
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn test_retry_recovers_from_bad_copy() {
        let dir = TempDir::new().unwrap();
        let src = original(&dir);
        let source = FlakySource {
            inner: LocalSource,
            bad_copies: 2,
            copies: AtomicU32::new(0),
        };

        transfer_with_retry(&source, &src, &dir.path().join("copy"), 3).unwrap();
        assert_eq!(source.copies.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let dir = TempDir::new().unwrap();
        let src = original(&dir);
        let dest = dir.path().join("copy");
        let source = FlakySource {
            inner: LocalSource,
            bad_copies: 10,
            copies: AtomicU32::new(0),
        };

        assert!(matches!(
            transfer_with_retry(&source, &src, &dest, 3),
            Err(Error::FileTransferNotSuccessful(_))
        ));
        assert_eq!(source.copies.load(Ordering::SeqCst), 3);
        assert!(!dest.exists());
    }

    #[test]
    fn test_missing_original() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope").to_string_lossy().into_owned();
        assert!(matches!(
            transfer_with_retry(&LocalSource, &missing, &dir.path().join("copy"), 3),
            Err(Error::FileTransferNotSuccessful(_))
        ));
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of("/data/report.txt").unwrap(), "report.txt");
        assert_eq!(file_name_of(r"C:\data\report.txt").unwrap(), "report.txt");
        assert_eq!(file_name_of("/data/dir/").unwrap(), "dir");
        assert_eq!(file_name_of("report.txt").unwrap(), "report.txt");
        assert!(matches!(file_name_of("/"), Err(Error::WrongTask(_))));
        assert!(file_name_of("/data/..").is_err());
    }
}
