//! Moves pending entries to the archive or error collection.
//!
//! Every entry is claimed with a compare-and-set from `Pending` to `Processing` before
//! the transform runs, so two callers can never process the same entry. The outcome is
//! written and the pending row removed in a single transaction.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    error::Error,
    message::{ArchivedMessage, ErrorRecord, MessageState, PendingEntry, MAX_ERROR_DETAIL_LEN},
    transform::{DomainEffects, MessageTransform, TransformError},
};

/// Recorded on entries handed back after their processing was cancelled.
pub const INTERRUPTED: &str = "processing was interrupted";

/// Result of processing a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "uuid", rename_all = "snake_case")]
pub enum Outcome {
    /// Transform succeeded; holds the uuid of the new archive.
    Archived(Uuid),
    /// Transform failed; holds the uuid of the new error record.
    Failed(Uuid),
    /// Entry was in a state that is never processed.
    Skipped,
}

/// Ensures only one drain runs at a time, and counts processed items across drains.
#[derive(Debug, Default)]
pub struct DrainCoordinator {
    draining: Mutex<bool>,
    processed: AtomicU64,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_draining(&self) -> bool {
        *self.draining.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total number of items processed by drains since startup.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn try_begin(&self) -> Option<DrainPermit<'_>> {
        let mut draining = self.draining.lock().unwrap_or_else(|e| e.into_inner());
        if *draining {
            return None;
        }
        *draining = true;

        Some(DrainPermit { coordinator: self })
    }

    /// Records one processed item. Returns true when resources are due for release.
    fn record_processed(&self, interval: u64) -> bool {
        let count = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        count % interval == 0
    }
}

struct DrainPermit<'a> {
    coordinator: &'a DrainCoordinator,
}

impl Drop for DrainPermit<'_> {
    fn drop(&mut self) {
        *self
            .coordinator
            .draining
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = false;
    }
}

#[derive(Clone)]
pub struct QueueProcessor {
    db: SqlitePool,
    transform: Arc<dyn MessageTransform>,
    coordinator: Arc<DrainCoordinator>,
    release_interval: u64,
}

impl QueueProcessor {
    pub fn new(db: SqlitePool, transform: Arc<dyn MessageTransform>, release_interval: u64) -> Self {
        Self {
            db,
            transform,
            coordinator: Arc::new(DrainCoordinator::new()),
            release_interval: release_interval.max(1),
        }
    }

    pub fn coordinator(&self) -> &Arc<DrainCoordinator> {
        &self.coordinator
    }

    /// Processes one entry into exactly one archive or error record.
    ///
    /// Fails with [`Error::ConflictingState`] if the entry is already being processed, in
    /// which case nothing is changed. If the outcome cannot be stored, or the call is
    /// cancelled after the claim, the entry is put back in the queue.
    #[tracing::instrument(skip_all, fields(uuid = %entry.uuid()))]
    pub async fn process_one(&self, entry: &PendingEntry) -> Result<Outcome, Error> {
        match entry.message_state {
            MessageState::Pending => {}
            MessageState::Processing => {
                return Err(Error::conflicting_state(entry.uuid(), MessageState::Processing))
            }
            state => {
                tracing::debug!(%state, "skipping queue entry");
                return Ok(Outcome::Skipped);
            }
        }

        let uuid = entry.uuid();

        let mut claim = {
            let mut conn = self.db.acquire().await?;
            if !PendingEntry::claim(&mut conn, uuid).await? {
                let state = PendingEntry::get(&mut conn, uuid)
                    .await?
                    .map(|e| e.message_state.to_string())
                    .unwrap_or_else(|| "processed".to_owned());

                return Err(Error::conflicting_state(uuid, state));
            }

            Claim {
                db: self.db.clone(),
                uuid,
                held: true,
            }
        };

        let res = match self.transform.transform(&entry.payload).await {
            Ok(effects) => self.store_archive(entry, &effects).await,
            Err(e) => self.store_error(entry, e).await,
        };

        match &res {
            // The pending row is gone along with the claim.
            Ok(_) => claim.held = false,
            Err(e) => {
                tracing::error!(error = %e, "failed to store processing outcome, requeueing");

                if let Err(release) = claim.release(&e.to_string()).await {
                    tracing::error!(error = %release, "failed to requeue entry");
                }
            }
        }

        res
    }

    async fn store_archive(
        &self,
        entry: &PendingEntry,
        effects: &DomainEffects,
    ) -> Result<Outcome, Error> {
        let archive = entry.to_archive();

        let mut tx = self.db.begin().await?;

        ArchivedMessage::insert(&mut *tx, &archive).await?;
        PendingEntry::delete(&mut *tx, entry.uuid()).await?;

        tx.commit().await?;

        tracing::info!(
            archive = %archive.uuid(),
            message_type = effects.message_type.as_deref().unwrap_or_default(),
            "message archived"
        );

        Ok(Outcome::Archived(archive.uuid()))
    }

    async fn store_error(&self, entry: &PendingEntry, err: TransformError) -> Result<Outcome, Error> {
        let mut record: ErrorRecord = entry.to_error();
        record.error_summary = err.summary;

        if record.set_error_detail(err.detail).is_err() {
            record.set_error_detail(format!(
                "error detail exceeded {MAX_ERROR_DETAIL_LEN} bytes and was not stored"
            ))?;
        }

        let mut tx = self.db.begin().await?;

        ErrorRecord::insert(&mut *tx, &record).await?;
        PendingEntry::delete(&mut *tx, entry.uuid()).await?;

        tx.commit().await?;

        tracing::warn!(
            error = %record.uuid(),
            summary = %record.error_summary,
            "message moved to error queue"
        );

        Ok(Outcome::Failed(record.uuid()))
    }

    /// Processes the oldest pending entry. Returns `false` when the queue is empty.
    ///
    /// An entry another caller claimed first counts as handled.
    pub async fn process_next(&self) -> Result<bool, Error> {
        Ok(self.step().await? != Step::Empty)
    }

    async fn step(&self) -> Result<Step, Error> {
        let next = {
            let mut conn = self.db.acquire().await?;
            PendingEntry::next(&mut conn).await?
        };

        let Some(entry) = next else {
            return Ok(Step::Empty);
        };

        Step::from_outcome(self.process_one(&entry).await)
    }

    /// Processes entries until the queue is empty and returns how many this drain
    /// handled itself.
    ///
    /// Only one drain runs at a time; a call made while another drain is in progress
    /// returns 0 immediately. Entries claimed by another caller between the lookup
    /// and the claim are neither counted nor included in the release cadence.
    pub async fn drain_queue(&self) -> Result<usize, Error> {
        let Some(_permit) = self.coordinator.try_begin() else {
            tracing::warn!("queue drain already in progress, skipping");
            return Ok(0);
        };

        tracing::debug!("draining queue");

        let mut processed = 0;
        loop {
            match self.step().await? {
                Step::Empty => break,
                Step::Elsewhere => continue,
                Step::Handled => {}
            }

            processed += 1;

            if self.coordinator.record_processed(self.release_interval) {
                tracing::debug!("releasing transform resources");
                self.transform.release_resources();
            }
        }

        tracing::debug!(processed, "queue drained");

        Ok(processed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Nothing left to process
    Empty,
    /// This caller archived or failed the entry
    Handled,
    /// The entry was taken by someone else or left alone
    Elsewhere,
}

impl Step {
    fn from_outcome(res: Result<Outcome, Error>) -> Result<Self, Error> {
        match res {
            Ok(Outcome::Archived(_) | Outcome::Failed(_)) => Ok(Self::Handled),
            Ok(Outcome::Skipped) => Ok(Self::Elsewhere),
            Err(Error::ConflictingState { item, state }) => {
                tracing::debug!(%item, %state, "entry claimed elsewhere");
                Ok(Self::Elsewhere)
            }
            Err(e) => Err(e),
        }
    }
}

/// A claimed pending entry. Dropped while still held, for instance when the
/// processing future is cancelled mid-transform, it hands the entry back to the queue.
struct Claim {
    db: SqlitePool,
    uuid: Uuid,
    held: bool,
}

impl Claim {
    async fn release(&mut self, reason: &str) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;
        PendingEntry::release(&mut conn, self.uuid, Some(reason)).await?;
        self.held = false;

        Ok(())
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(uuid = %self.uuid, "no runtime to requeue interrupted entry");
            return;
        };

        tracing::warn!(uuid = %self.uuid, "processing interrupted, requeueing entry");

        let db = self.db.clone();
        let uuid = self.uuid;
        runtime.spawn(async move {
            let res = match db.acquire().await {
                Ok(mut conn) => PendingEntry::release(&mut conn, uuid, Some(INTERRUPTED)).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = res {
                tracing::error!(%uuid, error = %e, "failed to requeue interrupted entry");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_permit() {
        let coordinator = DrainCoordinator::new();

        let permit = coordinator.try_begin();
        assert!(permit.is_some());
        assert!(coordinator.is_draining());
        assert!(coordinator.try_begin().is_none());

        drop(permit);
        assert!(!coordinator.is_draining());
        assert!(coordinator.try_begin().is_some());
    }

    #[test]
    fn test_release_interval_is_a_running_count() {
        let coordinator = DrainCoordinator::new();

        let due: Vec<u64> = (1..=60)
            .filter(|_| coordinator.record_processed(25))
            .collect();

        assert_eq!(due.len(), 2);
        assert_eq!(coordinator.processed(), 60);
    }

    #[test]
    fn test_only_local_work_is_handled() {
        let uuid = Uuid::new_v4();

        assert_eq!(
            Step::from_outcome(Ok(Outcome::Archived(uuid))).unwrap(),
            Step::Handled
        );
        assert_eq!(
            Step::from_outcome(Ok(Outcome::Failed(uuid))).unwrap(),
            Step::Handled
        );
        assert_eq!(
            Step::from_outcome(Ok(Outcome::Skipped)).unwrap(),
            Step::Elsewhere
        );
        assert_eq!(
            Step::from_outcome(Err(Error::conflicting_state(uuid, MessageState::Processing)))
                .unwrap(),
            Step::Elsewhere
        );
        assert!(matches!(
            Step::from_outcome(Err(Error::from(sqlx::Error::PoolTimedOut))),
            Err(Error::Sqlx { .. })
        ));
    }
}
