//! Release of identifiers held by failed records.
//!
//! A record left in `error` keeps its id, address, and port so an
//! operator can look at it. Once the grace period has passed, the sweep
//! purges whatever the failed pipeline left behind and marks the record
//! `deleted`. Each record is re-read under the lifecycle lock, so a
//! concurrent delete is never repeated.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::{ContainerId, ContainerRecord, ContainerStatus};

use crate::lifecycle::OpsLock;
use crate::notify::{self, AuditEvent, AuditKind, Notifier};
use crate::state::{RecordFilter, StateStore};
use crate::teardown::Purger;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Records moved to `deleted`.
    pub reclaimed: Vec<ContainerId>,
    /// Records whose purge failed; retried by the next sweep.
    pub skipped: Vec<ContainerId>,
    /// Error records still inside their grace period.
    pub waiting: usize,
}

/// Sweeps expired `error` records.
pub struct Reclaimer {
    store: Arc<dyn StateStore>,
    purger: Arc<Purger>,
    notifier: Arc<dyn Notifier>,
    ops: OpsLock,
    grace: TimeDelta,
}

impl Reclaimer {
    pub(crate) fn new(
        store: Arc<dyn StateStore>,
        purger: Arc<Purger>,
        notifier: Arc<dyn Notifier>,
        ops: OpsLock,
        grace: Duration,
    ) -> Result<Self> {
        let grace = TimeDelta::from_std(grace).map_err(|e| ForgeError::Config {
            message: format!("reclaim grace period out of range: {e}"),
        })?;
        Ok(Self {
            store,
            purger,
            notifier,
            ops,
            grace,
        })
    }

    /// The stored version of `scanned` if it is still the same failed
    /// record.
    async fn current(&self, scanned: &ContainerRecord) -> Result<Option<ContainerRecord>> {
        Ok(self
            .store
            .find_one(&RecordFilter::by_id(scanned.id))
            .await?
            .filter(|r| r.key == scanned.key && r.status() == ContainerStatus::Error))
    }

    fn expired(&self, record: &ContainerRecord, now: DateTime<Utc>) -> bool {
        let failed_at = record
            .failure
            .as_ref()
            .map_or(record.updated_at, |failure| failure.at);
        failed_at + self.grace <= now
    }

    /// Reclaims every `error` record whose failure is at least the grace
    /// period older than `now`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store cannot be read. A record that
    /// cannot be purged is logged, left untouched, and reported as
    /// skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let failed = self
            .store
            .find(&RecordFilter::with_status(ContainerStatus::Error))
            .await?;
        let mut report = ReclaimReport::default();
        for scanned in failed {
            if !self.expired(&scanned, now) {
                report.waiting += 1;
                continue;
            }
            let _ops = self.ops.lock().await;
            let Some(mut record) = self.current(&scanned).await? else {
                tracing::debug!(id = %scanned.id, "record changed since the scan, leaving it");
                continue;
            };
            match self.reclaim(&mut record, now).await {
                Ok(()) => report.reclaimed.push(record.id),
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "reclaim skipped");
                    report.skipped.push(record.id);
                }
            }
        }
        tracing::info!(
            reclaimed = report.reclaimed.len(),
            skipped = report.skipped.len(),
            waiting = report.waiting,
            "reclaim sweep finished"
        );
        Ok(report)
    }

    async fn reclaim(&self, record: &mut ContainerRecord, now: DateTime<Utc>) -> Result<()> {
        self.purger.purge(record).await?;
        record.mark_deleted(now)?;
        self.store.save(record).await?;
        tracing::info!(id = %record.id, "failed container reclaimed");
        notify::deliver(
            self.notifier.as_ref(),
            &AuditEvent::new(AuditKind::Reclaimed, record, now),
        )
        .await;
        Ok(())
    }
}
