//! Persistent state management.
//!
//! Records are consumed through `find` / `find_one` / `save`, plus
//! `insert_with` for the allocator's scan-and-insert. A stored `deleted`
//! record is never replaced by a live one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vpsforge_common::constants::DEFAULT_LOCK_TIMEOUT_SECS;
use vpsforge_common::error::{ForgeError, Result, invalid_state};
use vpsforge_common::lock::{self, HostLock};
use vpsforge_common::types::{ContainerId, ContainerRecord, ContainerStatus, OwnerId};

const STATE_VERSION: u32 = 1;

/// Query over container records. Empty fields match everything.
///
/// Deleted records are skipped unless `include_deleted` is set or
/// `status` asks for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Hypervisor id.
    pub id: Option<ContainerId>,
    /// Owning account.
    pub owner: Option<OwnerId>,
    /// Exact status.
    pub status: Option<ContainerStatus>,
    /// Also return deleted records.
    pub include_deleted: bool,
}

impl RecordFilter {
    /// Every record that still holds identifiers.
    #[must_use]
    pub fn live() -> Self {
        Self::default()
    }

    /// Every record, deleted ones included.
    #[must_use]
    pub fn all() -> Self {
        Self {
            include_deleted: true,
            ..Self::default()
        }
    }

    /// The live record with `id`.
    #[must_use]
    pub fn by_id(id: ContainerId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Live records of `owner`.
    #[must_use]
    pub fn owned_by(owner: OwnerId) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    /// Records in `status`.
    #[must_use]
    pub fn with_status(status: ContainerStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Returns whether `record` satisfies the filter.
    #[must_use]
    pub fn matches(&self, record: &ContainerRecord) -> bool {
        let wants_deleted =
            self.include_deleted || self.status == Some(ContainerStatus::Deleted);
        (wants_deleted || record.holds_identifiers())
            && self.id.is_none_or(|id| record.id == id)
            && self.owner.as_ref().is_none_or(|owner| record.is_owned_by(owner))
            && self.status.is_none_or(|status| record.status() == status)
    }
}

/// Durable container records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Records matching `filter`, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Persistence`] if the store cannot be read.
    async fn find(&self, filter: &RecordFilter) -> Result<Vec<ContainerRecord>>;

    /// First record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Persistence`] if the store cannot be read.
    async fn find_one(&self, filter: &RecordFilter) -> Result<Option<ContainerRecord>> {
        Ok(self.find(filter).await?.into_iter().next())
    }

    /// Inserts or replaces the record with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Persistence`] if the store cannot be written,
    /// or [`ForgeError::InvalidState`] if the stored record is already
    /// `deleted` and `record` is not.
    async fn save(&self, record: &ContainerRecord) -> Result<()>;

    /// Builds a record from the live records and inserts it, with no
    /// other writer in between.
    ///
    /// # Errors
    ///
    /// Returns the error of `build`, or [`ForgeError::Persistence`] if
    /// the store cannot be read or written.
    async fn insert_with(
        &self,
        build: &(dyn for<'r> Fn(&'r [ContainerRecord]) -> Result<ContainerRecord> + Sync),
    ) -> Result<ContainerRecord>;
}

fn upsert(records: &mut Vec<ContainerRecord>, record: &ContainerRecord) -> Result<()> {
    match records.iter_mut().find(|r| r.key == record.key) {
        Some(slot)
            if slot.status() == ContainerStatus::Deleted
                && record.status() != ContainerStatus::Deleted =>
        {
            Err(invalid_state(record.id, ContainerStatus::Deleted, "update"))
        }
        Some(slot) => {
            *slot = record.clone();
            Ok(())
        }
        None => {
            records.push(record.clone());
            Ok(())
        }
    }
}

fn live(records: &[ContainerRecord]) -> Vec<ContainerRecord> {
    let filter = RecordFilter::live();
    records.iter().filter(|r| filter.matches(r)).cloned().collect()
}

/// On-disk layout of the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    records: Vec<ContainerRecord>,
}

/// Store keeping every record in one JSON file.
///
/// Writes go to a sibling temporary file that is renamed over the
/// original, so readers never see a torn file. Every load-modify-store
/// holds a [`HostLock`] on `<path>.lock`, which also serializes separate
/// processes sharing the file.
#[derive(Debug)]
pub struct JsonStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl JsonStateStore {
    /// Opens the store at `path`. A missing file reads as empty.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_path: lock::lock_path(&path),
            path,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }

    /// Sets how long writers wait for the file lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Location of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failure(&self, action: &str, detail: impl std::fmt::Display) -> ForgeError {
        ForgeError::persistence(format!(
            "cannot {action} {}: {detail}",
            self.path.display()
        ))
    }

    async fn exclusive(&self) -> Result<HostLock> {
        HostLock::acquire(&self.lock_path, self.lock_timeout).await
    }

    fn load(&self) -> Result<Vec<ContainerRecord>> {
        tracing::debug!(path = %self.path.display(), "loading state index");
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.failure("read", e)),
        };
        let file: StateFile =
            serde_json::from_str(&content).map_err(|e| self.failure("parse", e))?;
        if file.version != STATE_VERSION {
            return Err(self.failure(
                "read",
                format!("unsupported state version {}", file.version),
            ));
        }
        Ok(file.records)
    }

    fn store(&self, records: Vec<ContainerRecord>) -> Result<()> {
        tracing::debug!(path = %self.path.display(), records = records.len(), "saving state index");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.failure("create directory for", e))?;
        }
        let file = StateFile {
            version: STATE_VERSION,
            records,
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| self.failure("encode", e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.failure("write", e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.failure("replace", e))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn find(&self, filter: &RecordFilter) -> Result<Vec<ContainerRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }

    async fn save(&self, record: &ContainerRecord) -> Result<()> {
        let _held = self.exclusive().await?;
        let mut records = self.load()?;
        upsert(&mut records, record)?;
        self.store(records)
    }

    async fn insert_with(
        &self,
        build: &(dyn for<'r> Fn(&'r [ContainerRecord]) -> Result<ContainerRecord> + Sync),
    ) -> Result<ContainerRecord> {
        let _held = self.exclusive().await?;
        let mut records = self.load()?;
        let record = build(&live(&records))?;
        upsert(&mut records, &record)?;
        self.store(records)?;
        Ok(record)
    }
}

/// Store keeping records in memory only.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<Vec<ContainerRecord>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn find(&self, filter: &RecordFilter) -> Result<Vec<ContainerRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn save(&self, record: &ContainerRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        upsert(&mut records, record)
    }

    async fn insert_with(
        &self,
        build: &(dyn for<'r> Fn(&'r [ContainerRecord]) -> Result<ContainerRecord> + Sync),
    ) -> Result<ContainerRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = build(&live(&records))?;
        upsert(&mut records, &record)?;
        Ok(record)
    }
}
