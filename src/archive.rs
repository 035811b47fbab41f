//! Filesystem storage for migrated archive payloads.
//!
//! Each payload lives in its own file, grouped by the day the archive was created:
//! `<root>/<YYYY>/<MM>/<DD>/<uuid>[_<source key>].txt`. The path is derived from the
//! archive itself, so the database does not need to remember it.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{error::Error, message::ArchivedMessage};

const MAX_KEY_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, archive: &ArchivedMessage) -> PathBuf {
        let created = archive.envelope.created_at;

        let mut name = archive.uuid().to_string();
        if let Some(key) = archive
            .envelope
            .source_key
            .as_deref()
            .map(sanitize_key)
            .filter(|k| !k.is_empty())
        {
            name.push('_');
            name.push_str(&key);
        }
        name.push_str(".txt");

        self.root
            .join(created.format("%Y").to_string())
            .join(created.format("%m").to_string())
            .join(created.format("%d").to_string())
            .join(name)
    }

    pub async fn ensure_root(&self) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::io(&self.root, e))
    }

    /// Writes the payload of a loaded archive and returns where it went.
    pub async fn write(&self, archive: &ArchivedMessage) -> Result<PathBuf, Error> {
        let payload = archive
            .payload()
            .ok_or_else(|| Error::validation(format!("archive {} is not loaded", archive.uuid())))?;

        let path = self.path_for(archive);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        // Readers never see a half-written file.
        let tmp = path.with_extension("txt.partial");
        if let Err(e) = tokio::fs::write(&tmp, payload).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::io(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::io(&path, e));
        }

        Ok(path)
    }

    pub async fn read(&self, archive: &ArchivedMessage) -> Result<String, Error> {
        let path = self.path_for(archive);

        match tokio::fs::read_to_string(&path).await {
            Ok(payload) => Ok(payload),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ArchiveFileMissing { path }),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub async fn remove(&self, archive: &ArchivedMessage) -> Result<(), Error> {
        let path = self.path_for(archive);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Loads the payload of a migrated archive back from its file. Loaded archives are
    /// left alone.
    pub async fn load_payload(&self, archive: &mut ArchivedMessage) -> Result<(), Error> {
        if archive.is_loaded() {
            return Ok(());
        }

        let payload = self.read(archive).await?;
        archive.hydrate(payload);

        Ok(())
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .take(MAX_KEY_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::message::{ArchivedMessage, Envelope};

    fn archive(source_key: Option<&str>) -> ArchivedMessage {
        let mut envelope = Envelope::new(1, source_key.map(str::to_owned));
        envelope.created_at = Utc.with_ymd_and_hms(2008, 2, 26, 10, 26, 56).unwrap();
        ArchivedMessage::new(envelope, "MSH|^~\\&|FORMENTRY".to_owned())
    }

    #[test]
    fn test_path_groups_by_creation_day() {
        let store = ArchiveStore::new("/var/lib/hl7");
        let archive = archive(Some("visit/42 a"));

        let expected = PathBuf::from("/var/lib/hl7/2008/02/26")
            .join(format!("{}_visit_42_a.txt", archive.uuid()));

        assert_eq!(store.path_for(&archive), expected);
    }

    #[test]
    fn test_path_without_source_key() {
        let store = ArchiveStore::new("archives");
        let archive = archive(None);

        assert_eq!(
            store.path_for(&archive).file_name().unwrap().to_string_lossy(),
            format!("{}.txt", archive.uuid())
        );
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());
        let original = archive(Some("k1"));

        let path = store.write(&original).await.unwrap();
        assert!(path.is_file());

        let mut migrated = original.clone();
        migrated.unload(Utc::now());
        store.load_payload(&mut migrated).await.unwrap();

        assert!(migrated.is_loaded());
        assert_eq!(migrated.payload(), original.payload());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());

        let mut migrated = archive(None);
        migrated.unload(Utc::now());

        let res = store.load_payload(&mut migrated).await;
        assert!(matches!(res, Err(Error::ArchiveFileMissing { .. })));
        assert!(!migrated.is_loaded());
    }
}
