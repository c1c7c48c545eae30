//! Periodic scan for archived files whose timestamps are about to expire

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use strata_core::FileId;

use crate::error::Result;
use crate::store::RecordStore;
use crate::task::Task;
use crate::worker::ChannelQueue;

/// Files whose ExpirationDateTS is less than `margin_days` after `now`.
/// Rows that cannot be read are skipped.
pub fn due_for_retimestamp(
    store: &dyn RecordStore,
    now: DateTime<Utc>,
    margin_days: i64,
) -> strata_core::Result<Vec<FileId>> {
    let margin = Duration::days(margin_days);
    let mut due = Vec::new();
    for file_id in store.all_file_ids()? {
        match store.archived(file_id) {
            Ok(file) if file.expiration() - now < margin => due.push(file_id),
            Ok(_) => {}
            Err(e) => warn!(file_id, "Skipping unreadable record: {}", e),
        }
    }
    Ok(due)
}

pub struct ExpirationScheduler {
    store: Arc<dyn RecordStore>,
    queue: Arc<ChannelQueue>,
    period: std::time::Duration,
    margin_days: i64,
}

impl ExpirationScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<ChannelQueue>,
        period: std::time::Duration,
        margin_days: i64,
    ) -> Self {
        Self {
            store,
            queue,
            period,
            margin_days,
        }
    }

    /// Publish a Retimestamp task for every file that is due
    pub fn scan_once(&self) -> Result<Vec<FileId>> {
        let due = due_for_retimestamp(self.store.as_ref(), Utc::now(), self.margin_days)?;
        for file_id in &due {
            self.queue.publish_task(&Task::Retimestamp { file_id: *file_id })?;
        }
        if due.is_empty() {
            debug!("No files due for retimestamping");
        } else {
            info!("Queued {} files for retimestamping", due.len());
        }
        Ok(due)
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.scan_once() {
                error!("Expiration scan failed: {}", e);
            }
        }
    }
}
