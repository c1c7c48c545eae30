//! Strata Daemon - Long-term archival evidence service
//!
//! This crate provides:
//! - The archiver, retimestamper and validator
//! - The record store (SQLite or in-memory)
//! - Local and SFTP access to original files
//! - Email notification of validation results
//! - Task parsing, a bounded worker pool and the expiration scheduler
//! - A Unix socket accepting task messages

pub mod archiver;
mod blocking;
pub mod config;
pub mod error;
pub mod evidence;
#[cfg(unix)]
pub mod intake;
pub mod notifier;
pub mod retimestamper;
pub mod scheduler;
pub mod services;
mod sqlite;
pub mod store;
pub mod task;
pub mod transport;
pub mod validator;
pub mod worker;

#[cfg(any(test, feature = "mock"))]
pub mod testing;

pub use archiver::{ArchiveSettings, Archiver};
pub use config::StrataConfig;
pub use error::{DaemonError, Result};
pub use evidence::TrustContext;
#[cfg(unix)]
pub use intake::{IntakeResponse, TaskIntake};
pub use notifier::{MemoryNotifier, Notification, Notifier, SmtpNotifier};
pub use retimestamper::Retimestamper;
pub use scheduler::{due_for_retimestamp, ExpirationScheduler};
pub use services::Services;
pub use store::{MemoryStore, RecordStore, SqliteStore};
pub use task::{Dispatcher, Task, TaskOutcome};
pub use transport::{FileSource, LocalSource};
pub use validator::{FileIdentifier, ValidationOutcome, ValidationReport, Validator};
pub use worker::{ChannelQueue, Delivery, TaskQueue, WorkerPool, DEAD_LETTER_QUEUE};
