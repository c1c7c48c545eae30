//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{DaemonError, Result};

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "STRATA_CONFIG";

/// Strata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Root directory holding one evidence directory per archived file
    pub storage_dir: PathBuf,

    /// SQLite file backing the record store
    pub database_path: PathBuf,

    /// Validity period added to each timestamp's issuance time
    pub validity_years: u32,

    pub tsa: TsaConfig,

    pub signing: SigningConfig,

    /// Remote store holding the originals; `None` means local files
    pub remote_access: Option<RemoteAccess>,

    pub contact: ContactConfig,

    pub worker: WorkerConfig,
}

/// Time-stamping authority settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsaConfig {
    /// RFC 3161 endpoint, also recorded as the authority's identity
    pub url: String,

    /// Certificate the authority signs tokens with
    pub tsa_cert_path: PathBuf,

    /// Certificate of the authority's CA
    pub tsa_ca_path: PathBuf,

    /// Where the CA publishes its current CRL
    pub tsa_crl_url: String,

    /// Timeout for TSA and CRL requests (seconds)
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub private_key_path: PathBuf,

    /// Password of an encrypted PKCS#8 key
    pub key_password: Option<String>,

    pub certificate_path: PathBuf,

    /// CRL of the signing certificate's CA, kept current by the operator
    pub crl_path: PathBuf,
}

/// SFTP access to the original files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAccess {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key used instead of a password
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_sftp_port() -> u16 {
    22
}

/// Notification sender and administrator contact details
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactConfig {
    pub sender_email: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    /// Defaults to `sender_email` when empty
    pub smtp_username: String,
    pub smtp_password: String,
    /// Administrator email shown in failure reports
    pub email: String,
    /// Administrator phone shown in failure reports
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tasks processed at the same time
    pub concurrency: usize,

    /// Attempts at copying an original before giving up
    pub transfer_attempts: u32,

    /// Deliveries of a task before it goes to the dead-letter queue
    pub delivery_attempts: u32,

    /// Files expiring within this many days are retimestamped
    pub retimestamp_margin_days: i64,

    /// Interval between expiration scans (seconds)
    pub scan_interval_secs: u64,

    /// Unix socket accepting task messages
    pub socket_path: PathBuf,
}

impl Default for StrataConfig {
    fn default() -> Self {
        let data_dir = Self::default_data_dir();
        Self {
            storage_dir: data_dir.join("storage"),
            database_path: data_dir.join("records.db"),
            validity_years: strata_core::DEFAULT_VALIDITY_YEARS,
            tsa: TsaConfig::default(),
            signing: SigningConfig::default(),
            remote_access: None,
            contact: ContactConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for TsaConfig {
    fn default() -> Self {
        let dir = StrataConfig::default_certificate_dir();
        Self {
            url: "https://freetsa.org/tsr".to_string(),
            tsa_cert_path: dir.join("tsa.crt"),
            tsa_ca_path: dir.join("tsa_cacert.pem"),
            tsa_crl_url: "https://www.freetsa.org/crl/root_ca.crl".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        let dir = StrataConfig::default_certificate_dir();
        Self {
            private_key_path: dir.join("signing_key.pem"),
            key_password: None,
            certificate_path: dir.join("signing_cert.pem"),
            crl_path: dir.join("signing_crl.crl"),
        }
    }
}

impl Default for ContactConfig {
    fn default() -> Self {
        Self {
            sender_email: "archive@localhost".to_string(),
            smtp_server: "localhost".to_string(),
            smtp_port: 465,
            smtp_username: String::new(),
            smtp_password: String::new(),
            email: "admin@localhost".to_string(),
            phone: String::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            transfer_attempts: 3,
            delivery_attempts: 3,
            retimestamp_margin_days: 2,
            scan_interval_secs: 3600,
            socket_path: StrataConfig::default_data_dir().join("strata.sock"),
        }
    }
}

impl StrataConfig {
    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("strata")
    }

    fn default_certificate_dir() -> PathBuf {
        Self::default_config_dir().join("certificates")
    }

    fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("strata")
    }

    /// `$STRATA_CONFIG`, or `config.json` in the user's config directory
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_config_dir().join("config.json"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.check()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load `path`, writing a default configuration there first if it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(path)?;
        info!("Created default config at {:?}", path);
        Ok(config)
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage_dir)?;
        for path in [&self.database_path, &self.worker.socket_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.validity_years == 0 {
            return Err(DaemonError::Config("validity_years must be at least 1".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(DaemonError::Config("worker.concurrency must be at least 1".into()));
        }
        if self.worker.delivery_attempts == 0 {
            return Err(DaemonError::Config(
                "worker.delivery_attempts must be at least 1".into(),
            ));
        }
        if self.worker.transfer_attempts == 0 {
            return Err(DaemonError::Config(
                "worker.transfer_attempts must be at least 1".into(),
            ));
        }
        if let Some(remote) = &self.remote_access {
            if remote.password.is_none() && remote.key_path.is_none() {
                return Err(DaemonError::Config(
                    "remote_access needs a password or a key_path".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn tsa_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tsa.timeout_secs)
    }
}
