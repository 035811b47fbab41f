//! Background migration of aged archive payloads to filesystem storage.
//!
//! A single worker walks the processed archives older than the retention cutoff in
//! `(created_at, uuid)` order, writes each payload to the [`ArchiveStore`] and clears it
//! from the database. Items that fail are counted and skipped; the walk never revisits
//! them within a run.
//!
//! Failures reading a batch are classified: recoverable ones (a busy database, a
//! transient I/O error) are retried after a delay, anything else ends the run with
//! [`Status::Error`].

use std::{
    io::ErrorKind,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    archive::ArchiveStore,
    config::Config,
    db::archive::ArchiveCursor,
    error::Error,
    message::ArchivedMessage,
};

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// No run since startup
    #[default]
    None,
    Running,
    /// Last run found nothing more to migrate
    Completed,
    /// Last run was stopped on request
    Stopped,
    /// Last run hit an unrecoverable failure
    Error,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub retention_days: u32,
    pub batch_size: u32,
    pub retry_delay: Duration,
    /// Consecutive recoverable failures tolerated before giving up. `None` retries
    /// until stopped.
    pub max_retries: Option<u32>,
}

impl MigrationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention_days: config.retention_days(),
            batch_size: config.batch_size(),
            retry_delay: config.retry_delay(),
            max_retries: config.max_retries,
        }
    }

    /// Archives created strictly before this instant are eligible.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(TimeDelta::days(self.retention_days.into()))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying after a delay
    Recoverable,
    /// Ends the run
    Unrecoverable,
}

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_IOERR: i64 = 10;
const SQLITE_FULL: i64 = 13;

/// Decides whether a failure to read or prepare a batch is worth retrying.
pub fn classify(err: &Error) -> FailureClass {
    match err {
        Error::Sqlx { source } => match source {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
                FailureClass::Recoverable
            }
            sqlx::Error::Database(db) => {
                // Extended result codes carry the primary code in the low byte.
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i64>().ok())
                    .map(|code| code & 0xff);

                match primary {
                    Some(SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_FULL) => {
                        FailureClass::Recoverable
                    }
                    _ => FailureClass::Unrecoverable,
                }
            }
            _ => FailureClass::Unrecoverable,
        },
        Error::Io { source, .. } => match source.kind() {
            ErrorKind::PermissionDenied
            | ErrorKind::AlreadyExists
            | ErrorKind::InvalidInput
            | ErrorKind::Unsupported => FailureClass::Unrecoverable,
            _ => FailureClass::Recoverable,
        },
        _ => FailureClass::Unrecoverable,
    }
}

/// Tracks the one migration worker allowed to run at a time.
#[derive(Debug, Default)]
pub struct MigrationCoordinator {
    status: Mutex<Status>,
    transferred: AtomicU64,
    failed: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<Status>>>,
}

impl MigrationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn progress(&self) -> Progress {
        Progress {
            transferred: self.transferred.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Whether a worker is running and has not been asked to stop.
    pub fn is_active(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Spawns a worker. Fails with [`Error::ConflictingState`] while another one is
    /// running. Progress counters start over from zero.
    pub fn start(
        self: &Arc<Self>,
        db: SqlitePool,
        store: ArchiveStore,
        settings: MigrationSettings,
    ) -> Result<(), Error> {
        let cancel = self.begin()?;

        tracing::info!(
            retention_days = settings.retention_days,
            batch_size = settings.batch_size,
            "starting archive migration"
        );

        let worker = MigrationWorker {
            db,
            store,
            settings,
            coordinator: self.clone(),
            cancel,
        };

        let handle = tokio::spawn(worker.run());
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(())
    }

    /// Asks the running worker to stop after the item it is working on. Returns false
    /// if no worker is running.
    pub fn stop(&self) -> bool {
        match self.cancel.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) => {
                tracing::info!("stopping archive migration");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Waits for the last started worker to exit and returns the status it finished
    /// with. Without a worker to wait on, returns the current status.
    pub async fn wait(&self) -> Result<Status, Error> {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();

        match worker {
            Some(handle) => handle.await.map_err(Error::internal),
            None => Ok(self.status()),
        }
    }

    fn begin(&self) -> Result<CancellationToken, Error> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == Status::Running {
            return Err(Error::conflicting_state("archive migration", Status::Running));
        }

        *status = Status::Running;
        self.transferred.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        Ok(token)
    }

    fn finish(&self, status: Status) {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *current = status;
    }
}

/// Publishes the final status however the worker exits.
struct RunScope<'a> {
    coordinator: &'a MigrationCoordinator,
    status: Status,
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        self.coordinator.finish(self.status);
    }
}

struct MigrationWorker {
    db: SqlitePool,
    store: ArchiveStore,
    settings: MigrationSettings,
    coordinator: Arc<MigrationCoordinator>,
    cancel: CancellationToken,
}

impl MigrationWorker {
    async fn run(self) -> Status {
        let mut scope = RunScope {
            coordinator: &self.coordinator,
            status: Status::Error,
        };

        let status = match self.migrate().await {
            Ok(()) if self.cancel.is_cancelled() => Status::Stopped,
            Ok(()) => Status::Completed,
            Err(e) => {
                tracing::error!(error = %e, "archive migration failed");
                Status::Error
            }
        };

        let progress = self.coordinator.progress();
        tracing::info!(
            %status,
            transferred = progress.transferred,
            failed = progress.failed,
            "archive migration finished"
        );

        scope.status = status;
        status
    }

    async fn migrate(&self) -> Result<(), Error> {
        let cutoff = self.settings.cutoff(Utc::now());
        let mut cursor: Option<ArchiveCursor> = None;
        let mut attempts = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let (mut conn, batch) = match self.next_batch(cutoff, cursor).await {
                Ok(res) => {
                    attempts = 0;
                    res
                }
                Err(e) if classify(&e) == FailureClass::Recoverable => {
                    attempts += 1;
                    if self.settings.max_retries.is_some_and(|max| attempts > max) {
                        return Err(e);
                    }

                    tracing::warn!(error = %e, attempts, "archive migration batch failed, retrying");

                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(last) = batch.last() else {
                return Ok(());
            };
            cursor = Some((last.envelope.created_at, last.uuid()));

            tracing::debug!(items = batch.len(), "migrating batch");

            for archive in batch {
                if self.cancel.is_cancelled() {
                    break;
                }

                let uuid = archive.uuid();
                match self.migrate_one(&mut conn, archive).await {
                    Ok(()) => {
                        self.coordinator.transferred.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(%uuid, error = %e, "failed to migrate archive");
                        self.coordinator.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    async fn next_batch(
        &self,
        cutoff: DateTime<Utc>,
        cursor: Option<ArchiveCursor>,
    ) -> Result<(sqlx::pool::PoolConnection<sqlx::Sqlite>, Vec<ArchivedMessage>), Error> {
        self.store.ensure_root().await?;

        let mut conn = self.db.acquire().await?;
        let batch = ArchivedMessage::eligible_for_migration(
            &mut conn,
            cutoff,
            cursor,
            self.settings.batch_size,
        )
        .await?;

        Ok((conn, batch))
    }

    async fn migrate_one(
        &self,
        conn: &mut SqliteConnection,
        mut archive: ArchivedMessage,
    ) -> Result<(), Error> {
        let path = self.store.write(&archive).await?;
        let now = Utc::now();

        match ArchivedMessage::mark_migrated(conn, archive.uuid(), now).await {
            Ok(true) => {
                archive.unload(now);
                tracing::debug!(uuid = %archive.uuid(), path = %path.display(), "archive migrated");
                Ok(())
            }
            // Someone else already migrated it; the file they point at is the one we wrote.
            Ok(false) => Err(Error::conflicting_state(archive.uuid(), "migrated")),
            Err(e) => {
                if let Err(cleanup) = self.store.remove(&archive).await {
                    tracing::warn!(error = %cleanup, "failed to remove orphaned archive file");
                }
                Err(e)
            }
        }
    }
}
