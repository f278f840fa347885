//! The catalog of typed stores and its durable image.
//!
//! This module provides [`Storage`], the set of [`ResourceStore`]s that back
//! the service, all sharing one [`Database`] write slot.
//!
//! ## Image Format
//!
//! The whole catalog can be written to a single file: the JSON
//! serialization of [`StorageImage`], optionally gzip-compressed. Loading
//! detects the format from the first two bytes (gzip magic `1f 8b`).

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::lifetime::Lifetime;
use crate::model::{
    ContentAnalysis, File, FileAccess, FileContent, FileDataBlock, FileSnapshot, User,
    UserAuthentication, UserSession,
};
use crate::store::{Database, ResourceStore, TableImage};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Clone)]
pub struct Storage {
    pub db: Database,
    pub users: ResourceStore<User>,
    pub authentications: ResourceStore<UserAuthentication>,
    pub sessions: ResourceStore<UserSession>,
    pub files: ResourceStore<File>,
    pub access: ResourceStore<FileAccess>,
    pub contents: ResourceStore<FileContent>,
    pub snapshots: ResourceStore<FileSnapshot>,
    pub blocks: ResourceStore<FileDataBlock>,
    pub analysis: ResourceStore<ContentAnalysis>,
}

#[derive(Default, Serialize, Deserialize)]
pub struct StorageImage {
    pub users: TableImage<User>,
    pub authentications: TableImage<UserAuthentication>,
    pub sessions: TableImage<UserSession>,
    pub files: TableImage<File>,
    pub access: TableImage<FileAccess>,
    pub contents: TableImage<FileContent>,
    pub snapshots: TableImage<FileSnapshot>,
    pub blocks: TableImage<FileDataBlock>,
    #[serde(default)]
    pub analysis: TableImage<ContentAnalysis>,
}

/// Row counts for status output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub users: usize,
    pub files: usize,
    pub snapshots: usize,
    pub blocks: usize,
    pub block_bytes: u64,
}

impl Default for Storage {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Storage {
    pub fn in_memory() -> Self {
        let db = Database::new();
        Self {
            users: ResourceStore::in_memory(&db),
            authentications: ResourceStore::in_memory(&db),
            sessions: ResourceStore::in_memory(&db),
            files: ResourceStore::in_memory(&db),
            access: ResourceStore::in_memory(&db),
            contents: ResourceStore::in_memory(&db),
            snapshots: ResourceStore::in_memory(&db),
            blocks: ResourceStore::in_memory(&db),
            analysis: ResourceStore::in_memory(&db),
            db,
        }
    }

    /// Consistent copy of every table. Holds the write slot while exporting
    /// so no commit lands halfway through.
    pub async fn export(&self) -> Result<StorageImage> {
        let slot = self
            .db
            .begin(&Lifetime::new())
            .await
            .context("acquiring write slot for export")?;
        let image = StorageImage {
            users: self.users.export(),
            authentications: self.authentications.export(),
            sessions: self.sessions.export(),
            files: self.files.export(),
            access: self.access.export(),
            contents: self.contents.export(),
            snapshots: self.snapshots.export(),
            blocks: self.blocks.export(),
            analysis: self.analysis.export(),
        };
        drop(slot);
        Ok(image)
    }

    pub fn import(&self, image: StorageImage) {
        self.users.import(image.users);
        self.authentications.import(image.authentications);
        self.sessions.import(image.sessions);
        self.files.import(image.files);
        self.access.import(image.access);
        self.contents.import(image.contents);
        self.snapshots.import(image.snapshots);
        self.blocks.import(image.blocks);
        self.analysis.import(image.analysis);
    }

    /// Write the image to `path`, replacing any previous image atomically.
    pub async fn save(&self, path: impl AsRef<Path>, compress: bool) -> Result<u64> {
        let path = path.as_ref();
        let image = self.export().await?;
        let json = serde_json::to_vec(&image).context("serializing storage image")?;
        let bytes = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            encoder.finish().context("compressing storage image")?
        } else {
            json
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {:?}", parent))?;
        }
        let staging = path.with_extension("tmp");
        fs::write(&staging, &bytes)
            .await
            .with_context(|| format!("writing {:?}", &staging))?;
        fs::rename(&staging, path)
            .await
            .with_context(|| format!("replacing {:?}", path))?;

        info!(path = %path.display(), bytes = bytes.len(), compressed = compress, "storage image saved");
        Ok(bytes.len() as u64)
    }

    /// Open the image at `path`, or an empty catalog if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let storage = Self::in_memory();
        if !fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "no storage image yet, starting empty");
            return Ok(storage);
        }

        let data = fs::read(path)
            .await
            .with_context(|| format!("reading {:?}", path))?;
        let compressed = data.starts_with(&GZIP_MAGIC);
        let json = if compressed {
            let mut out = Vec::new();
            GzDecoder::new(data.as_slice())
                .read_to_end(&mut out)
                .context("decompressing storage image")?;
            out
        } else {
            data
        };
        let image: StorageImage =
            serde_json::from_slice(&json).with_context(|| format!("parsing {:?}", path))?;
        storage.import(image);

        info!(path = %path.display(), compressed, "storage image loaded");
        Ok(storage)
    }

    pub fn stats(&self) -> StorageStats {
        use crate::store::{DeletedFilter, Query};

        let blocks = self
            .blocks
            .query(None, &Query::new().deleted(DeletedFilter::Include));
        StorageStats {
            users: self.users.count(None, &Query::new()),
            files: self.files.count(None, &Query::new().deleted(DeletedFilter::Include)),
            snapshots: self.snapshots.count(None, &Query::new()),
            block_bytes: blocks.iter().map(|b| b.encrypted_bytes.len() as u64).sum(),
            blocks: blocks.len(),
        }
    }
}
