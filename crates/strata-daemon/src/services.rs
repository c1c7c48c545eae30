//! Wiring of the evidence operations from configuration

use std::sync::Arc;
use tracing::info;

use crate::archiver::{ArchiveSettings, Archiver};
use crate::config::StrataConfig;
use crate::error::Result;
use crate::evidence::TrustContext;
use crate::notifier::{Notifier, SmtpNotifier};
use crate::retimestamper::Retimestamper;
use crate::store::{RecordStore, SqliteStore};
use crate::task::Dispatcher;
use crate::transport::{source_from_config, FileSource};
use crate::validator::Validator;

/// Collaborators shared by the archiver, retimestamper and validator
pub struct Services {
    pub store: Arc<dyn RecordStore>,
    pub trust: Arc<TrustContext>,
    pub source: Arc<dyn FileSource>,
    pub notifier: Arc<dyn Notifier>,
    config: StrataConfig,
}

impl Services {
    /// SQLite records, configured TSA and signing key, SMTP notification
    pub fn from_config(config: &StrataConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database_path)?;
        let trust = TrustContext::from_config(config)?;
        let source = source_from_config(config)?;
        let notifier = SmtpNotifier::new(&config.contact)?;
        info!(
            "Records in {:?}, originals from {}",
            config.database_path,
            source.describe()
        );
        Ok(Self {
            store: Arc::new(store),
            trust: Arc::new(trust),
            source,
            notifier: Arc::new(notifier),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn archiver(&self) -> Archiver {
        Archiver::new(
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            Arc::clone(&self.trust),
            ArchiveSettings::from_config(&self.config),
        )
    }

    pub fn retimestamper(&self) -> Retimestamper {
        Retimestamper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.trust),
            self.config.validity_years,
        )
    }

    pub fn validator(&self) -> Validator {
        Validator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            Arc::clone(&self.notifier),
            self.config.contact.clone(),
        )
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.archiver(), self.retimestamper(), self.validator())
    }
}
