use std::sync::Arc;

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};
use uuid::Uuid;

use crate::{
    archive::ArchiveStore,
    config::Config,
    db::{ListQuery, Page},
    error::Error,
    message::{ArchivedMessage, ErrorRecord, PendingEntry, QueueItem, Source},
    migration::{MigrationCoordinator, MigrationSettings, Progress, Status},
    processor::{Outcome, QueueProcessor},
    transform::{MessageTransform, MshHeaderTransform},
};

pub struct Service {
    db: SqlitePool,
    config: Config,
    processor: QueueProcessor,
    archives: ArchiveStore,
    migration: Arc<MigrationCoordinator>,
}

#[bon::bon]
impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with().config(Config::default()).call().await
    }

    /// Opens the database, applies migrations and requeues entries a previous process
    /// left half-processed. Without a transform, messages are checked with
    /// [`MshHeaderTransform`].
    #[builder]
    pub async fn connect_with(
        config: Config,
        transform: Option<Arc<dyn MessageTransform>>,
    ) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size())
            .acquire_timeout(config.acquire_timeout())
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let requeued = {
            let mut conn = pool.acquire().await?;
            PendingEntry::release_stale(&mut conn).await?
        };
        if requeued > 0 {
            tracing::warn!(requeued, "requeued entries left in processing");
        }

        let transform = transform.unwrap_or_else(|| Arc::new(MshHeaderTransform::new()));
        let processor = QueueProcessor::new(pool.clone(), transform, config.release_interval());
        let archives = ArchiveStore::new(config.archive_dir());

        Ok(Self {
            db: pool,
            config,
            processor,
            archives,
            migration: Arc::new(MigrationCoordinator::new()),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn archives(&self) -> &ArchiveStore {
        &self.archives
    }

    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }

    pub async fn create_source(
        &self,
        name: impl AsRef<str>,
        description: Option<&str>,
    ) -> Result<Source, Error> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(Error::invalid_parameter("source name must not be empty"));
        }

        let mut conn = self.db.acquire().await?;
        if Source::get_by_name(&mut conn, name).await?.is_some() {
            return Err(Error::validation(format!("source {name:?} already exists")));
        }

        Source::insert(&mut conn, name, description).await
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>, Error> {
        let mut conn = self.db.acquire().await?;
        Source::list(&mut conn).await
    }

    pub async fn retire_source(&self, id: i64, reason: Option<&str>) -> Result<Source, Error> {
        let mut tx = self.db.begin().await?;

        if !Source::retire(&mut *tx, id, reason).await? {
            return Err(Error::source_not_found(id));
        }
        let source = Source::get(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::source_not_found(id))?;

        tx.commit().await?;

        Ok(source)
    }

    /// Deletes a source no queue item refers to anymore.
    pub async fn purge_source(&self, id: i64) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        if Source::get(&mut *tx, id).await?.is_none() {
            return Err(Error::source_not_found(id));
        }
        if Source::is_referenced(&mut *tx, id).await? {
            return Err(Error::conflicting_state(format!("source {id}"), "in use"));
        }

        Source::delete(&mut *tx, id).await?;

        tx.commit().await?;

        Ok(())
    }

    /// Adds a message to the inbound queue.
    pub async fn enqueue(
        &self,
        source: impl AsRef<str>,
        source_key: Option<String>,
        payload: impl Into<String>,
    ) -> Result<PendingEntry, Error> {
        let payload = payload.into();
        if payload.trim().is_empty() {
            return Err(Error::invalid_parameter("payload must not be empty"));
        }

        let mut tx = self.db.begin().await?;

        let source = Source::get_by_name(&mut *tx, source.as_ref())
            .await?
            .ok_or_else(|| Error::source_not_found(source.as_ref()))?;
        if source.retired {
            return Err(Error::validation(format!(
                "source {:?} is retired",
                source.name
            )));
        }

        let entry = PendingEntry::new(source.id, source_key, payload);
        PendingEntry::insert(&mut *tx, &entry).await?;

        tx.commit().await?;

        tracing::debug!(uuid = %entry.uuid(), source = %source.name, "message enqueued");

        Ok(entry)
    }

    pub async fn list_pending(&self, query: &ListQuery) -> Result<Page<PendingEntry>, Error> {
        let mut conn = self.db.acquire().await?;

        Ok(Page {
            items: PendingEntry::list(&mut conn, query).await?,
            total: PendingEntry::count(&mut conn, query).await?,
        })
    }

    pub async fn list_archives(&self, query: &ListQuery) -> Result<Page<ArchivedMessage>, Error> {
        let mut conn = self.db.acquire().await?;

        Ok(Page {
            items: ArchivedMessage::list(&mut conn, query).await?,
            total: ArchivedMessage::count(&mut conn, query).await?,
        })
    }

    pub async fn list_errors(&self, query: &ListQuery) -> Result<Page<ErrorRecord>, Error> {
        let mut conn = self.db.acquire().await?;

        Ok(Page {
            items: ErrorRecord::list(&mut conn, query).await?,
            total: ErrorRecord::count(&mut conn, query).await?,
        })
    }

    /// Looks an item up by uuid in the pending, error and archive collections, in
    /// that order.
    pub async fn get_item(&self, uuid: Uuid) -> Result<Option<QueueItem>, Error> {
        let mut conn = self.db.acquire().await?;

        if let Some(entry) = PendingEntry::get(&mut conn, uuid).await? {
            return Ok(Some(QueueItem::Pending(entry)));
        }
        if let Some(record) = ErrorRecord::get(&mut conn, uuid).await? {
            return Ok(Some(QueueItem::Error(record)));
        }

        Ok(ArchivedMessage::get(&mut conn, uuid)
            .await?
            .map(QueueItem::Archived))
    }

    /// Fetches an archive, loading its payload back from the filesystem when asked to.
    pub async fn get_archive(&self, uuid: Uuid, hydrate: bool) -> Result<ArchivedMessage, Error> {
        let mut archive = {
            let mut conn = self.db.acquire().await?;
            ArchivedMessage::get(&mut conn, uuid)
                .await?
                .ok_or_else(|| Error::item_not_found(uuid))?
        };

        if hydrate {
            self.load_payload(&mut archive).await?;
        }

        Ok(archive)
    }

    pub async fn load_payload(&self, archive: &mut ArchivedMessage) -> Result<(), Error> {
        self.archives.load_payload(archive).await
    }

    pub async fn purge_error(&self, uuid: Uuid) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;

        if !ErrorRecord::delete(&mut conn, uuid).await? {
            return Err(Error::item_not_found(uuid));
        }

        Ok(())
    }

    /// Puts a failed message back in the queue as a new pending entry.
    pub async fn requeue_error(&self, uuid: Uuid) -> Result<PendingEntry, Error> {
        let mut tx = self.db.begin().await?;

        let record = ErrorRecord::get(&mut *tx, uuid)
            .await?
            .ok_or_else(|| Error::item_not_found(uuid))?;

        let entry = record.to_pending();
        PendingEntry::insert(&mut *tx, &entry).await?;
        ErrorRecord::delete(&mut *tx, uuid).await?;

        tx.commit().await?;

        tracing::info!(error = %uuid, pending = %entry.uuid(), "error record requeued");

        Ok(entry)
    }

    pub async fn process_one(&self, entry: &PendingEntry) -> Result<Outcome, Error> {
        self.processor.process_one(entry).await
    }

    pub async fn process_next(&self) -> Result<bool, Error> {
        self.processor.process_next().await
    }

    pub async fn drain_queue(&self) -> Result<usize, Error> {
        self.processor.drain_queue().await
    }

    /// Starts the archive migration worker. Unset parameters fall back to the
    /// configuration.
    pub fn start_migration(
        &self,
        retention_days: Option<u32>,
        batch_size: Option<u32>,
    ) -> Result<(), Error> {
        let mut settings = MigrationSettings::from_config(&self.config);
        if let Some(days) = retention_days {
            settings.retention_days = days;
        }
        if let Some(size) = batch_size {
            if size == 0 {
                return Err(Error::invalid_parameter("batch size must be at least 1"));
            }
            settings.batch_size = size;
        }

        self.migration
            .start(self.db.clone(), self.archives.clone(), settings)
    }

    pub fn stop_migration(&self) -> bool {
        self.migration.stop()
    }

    /// Waits for the migration worker to exit and returns its final status.
    pub async fn wait_migration(&self) -> Result<Status, Error> {
        self.migration.wait().await
    }

    /// Stops the migration worker, if any, and waits for it to exit.
    pub async fn shutdown_migration(&self) -> Result<Status, Error> {
        self.migration.stop();
        self.migration.wait().await
    }

    pub fn migration_status(&self) -> Status {
        self.migration.status()
    }

    pub fn migration_progress(&self) -> Progress {
        self.migration.progress()
    }

    pub fn migration_active(&self) -> bool {
        self.migration.is_active()
    }
}
