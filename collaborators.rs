//! Content analysis collaborators: virus scanning, MIME sniffing and
//! thumbnail generation.
//!
//! The service only depends on the traits. Results are cached per
//! `(file, content, snapshot)` in the [`ContentAnalysis`] table, so a
//! snapshot is analysed at most once per kind until its bytes change.
//!
//! Content is never loaded whole: scanning walks the snapshot in
//! overlapping windows, sniffing looks at the head only, and thumbnails
//! are only generated for sources up to [`MAX_THUMBNAIL_SOURCE`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{ContentAnalysis, ContentId, FileKind, UserId};
use crate::storage::Storage;
use crate::store::{Stored, Transaction};
use crate::tree::FileTree;
use crate::vault::Unlocked;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const THUMBNAIL_CONTENT: &str = "thumbnail";

/// Bytes handed to the scanner per call.
pub const SCAN_WINDOW: usize = 1024 * 1024;
/// Bytes each scan window repeats from the previous one, so a signature
/// shorter than this is seen whole even when it straddles a boundary.
pub const SCAN_OVERLAP: usize = 4096;
/// Bytes of the head handed to the MIME sniffer.
pub const SNIFF_WINDOW: usize = 8192;
pub const MAX_THUMBNAIL_SOURCE: u64 = 32 * 1024 * 1024;

const EICAR: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

#[async_trait]
pub trait VirusScanner: Send + Sync {
    /// Names of the threats found in one window of a file; empty when
    /// clean.
    async fn scan(&self, data: &[u8]) -> Result<Vec<String>>;
}

#[async_trait]
pub trait MimeSniffer: Send + Sync {
    /// Classify a file from its first [`SNIFF_WINDOW`] bytes.
    async fn sniff(&self, data: &[u8]) -> Result<String>;
}

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// A thumbnail for `data`, or `None` when the type is not supported.
    async fn generate(&self, mime: &str, data: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Matches the EICAR anti-virus test signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureScanner;

#[async_trait]
impl VirusScanner for SignatureScanner {
    async fn scan(&self, data: &[u8]) -> Result<Vec<String>> {
        let found = data.windows(EICAR.len()).any(|window| window == EICAR);
        Ok(if found {
            vec!["EICAR-Test-File".to_string()]
        } else {
            Vec::new()
        })
    }
}

/// Magic-number lookup with a plain-text fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicSniffer;

const MAGIC: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
];

#[async_trait]
impl MimeSniffer for MagicSniffer {
    async fn sniff(&self, data: &[u8]) -> Result<String> {
        if let Some((_, mime)) = MAGIC.iter().find(|(magic, _)| data.starts_with(magic)) {
            return Ok(mime.to_string());
        }
        if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Ok("image/webp".to_string());
        }
        let head = &data[..data.len().min(4096)];
        let text = match std::str::from_utf8(head) {
            Ok(text) => Some(text),
            // A multi-byte character cut at the window edge is still text.
            Err(e) if e.error_len().is_none() => std::str::from_utf8(&head[..e.valid_up_to()]).ok(),
            Err(_) => None,
        };
        Ok(match text {
            Some(text) if !data.is_empty() && !text.contains('\0') => "text/plain".to_string(),
            _ => OCTET_STREAM.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub scanner: Arc<dyn VirusScanner>,
    pub sniffer: Arc<dyn MimeSniffer>,
    pub thumbnails: Option<Arc<dyn ThumbnailGenerator>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            scanner: Arc::new(SignatureScanner),
            sniffer: Arc::new(MagicSniffer),
            thumbnails: None,
        }
    }
}

impl Collaborators {
    pub fn with_thumbnails(mut self, generator: Arc<dyn ThumbnailGenerator>) -> Self {
        self.thumbnails = Some(generator);
        self
    }
}

/// Where a file's latest main-content bytes live.
struct Target {
    content_id: ContentId,
    snapshot_id: crate::model::SnapshotId,
    size: u64,
}

/// Runs collaborators against a file's latest main snapshot with caching.
#[derive(Clone)]
pub struct Analyzer {
    storage: Storage,
    tree: FileTree,
    collaborators: Collaborators,
}

impl Analyzer {
    pub fn new(storage: Storage, tree: FileTree, collaborators: Collaborators) -> Self {
        Self {
            storage,
            tree,
            collaborators,
        }
    }

    fn target(&self, tx: &Transaction, unlocked: &Unlocked) -> Option<Target> {
        let content = self.tree.find_main_content(Some(tx), unlocked.file.id)?;
        let snapshot = self.tree.latest_snapshot(Some(tx), content.id)?;
        Some(Target {
            content_id: content.id,
            snapshot_id: snapshot.id,
            size: snapshot.size,
        })
    }

    fn record(
        &self,
        tx: &Transaction,
        unlocked: &Unlocked,
        target: &Target,
        patch: impl FnOnce(&mut ContentAnalysis),
    ) -> Result<Stored<ContentAnalysis>> {
        Ok(match self.tree.cached_analysis(Some(tx), target.snapshot_id) {
            Some(row) => self.storage.analysis.update(tx, row.id, None, patch)?,
            None => {
                let mut fresh = ContentAnalysis {
                    file_id: unlocked.file.id,
                    content_id: target.content_id,
                    snapshot_id: target.snapshot_id,
                    threats: None,
                    mime: None,
                };
                patch(&mut fresh);
                self.storage.analysis.insert(tx, fresh)?
            }
        })
    }

    pub async fn scan(&self, tx: &Transaction, unlocked: &Unlocked) -> Result<Vec<String>> {
        let Some(target) = self.target(tx, unlocked) else {
            return Ok(Vec::new());
        };
        if let Some(threats) = self
            .tree
            .cached_analysis(Some(tx), target.snapshot_id)
            .and_then(|row| row.fields.threats)
        {
            debug!(file = unlocked.file.id, snapshot = target.snapshot_id, "scan served from cache");
            return Ok(threats);
        }

        let mut threats: Vec<String> = Vec::new();
        let mut offset = 0u64;
        while offset < target.size {
            let window = self.tree.read_main_at(Some(tx), unlocked, offset, SCAN_WINDOW)?;
            if window.is_empty() {
                break;
            }
            for threat in self.collaborators.scanner.scan(&window).await? {
                if !threats.contains(&threat) {
                    threats.push(threat);
                }
            }
            if window.len() < SCAN_WINDOW {
                break;
            }
            offset += (SCAN_WINDOW - SCAN_OVERLAP) as u64;
        }
        if threats.is_empty() {
            info!(file = unlocked.file.id, snapshot = target.snapshot_id, "scan clean");
        } else {
            warn!(file = unlocked.file.id, snapshot = target.snapshot_id, threats = ?threats, "threats found");
        }
        let cached = threats.clone();
        self.record(tx, unlocked, &target, move |row| row.threats = Some(cached))?;
        Ok(threats)
    }

    pub async fn sniff_mime(&self, tx: &Transaction, unlocked: &Unlocked) -> Result<String> {
        if unlocked.file.kind == FileKind::Folder {
            return Ok("inode/directory".to_string());
        }
        let Some(target) = self.target(tx, unlocked) else {
            return Ok(OCTET_STREAM.to_string());
        };
        if let Some(mime) = self
            .tree
            .cached_analysis(Some(tx), target.snapshot_id)
            .and_then(|row| row.fields.mime)
        {
            return Ok(mime);
        }

        let head = self.tree.read_main_at(Some(tx), unlocked, 0, SNIFF_WINDOW)?;
        let mime = self.collaborators.sniffer.sniff(&head).await?;
        let cached = mime.clone();
        self.record(tx, unlocked, &target, move |row| row.mime = Some(cached))?;
        debug!(file = unlocked.file.id, mime = %mime, "mime sniffed");
        Ok(mime)
    }

    /// Store a thumbnail as the file's `thumbnail` content. `None` when no
    /// generator is configured or it declines the type.
    pub async fn generate_thumbnail(
        &self,
        tx: &Transaction,
        unlocked: &Unlocked,
        creator: UserId,
    ) -> Result<Option<ContentId>> {
        let Some(generator) = self.collaborators.thumbnails.clone() else {
            return Ok(None);
        };
        if unlocked.file.kind == FileKind::Folder {
            return Ok(None);
        }
        let Some(target) = self.target(tx, unlocked) else {
            return Ok(None);
        };
        if target.size > MAX_THUMBNAIL_SOURCE {
            debug!(file = unlocked.file.id, size = target.size, "too large for a thumbnail");
            return Ok(None);
        }
        let mime = self.sniff_mime(tx, unlocked).await?;
        let data = self
            .tree
            .read_main_at(Some(tx), unlocked, 0, target.size as usize)?;
        let Some(thumbnail) = generator.generate(&mime, &data).await? else {
            return Ok(None);
        };

        let content = match self.tree.find_content(Some(tx), unlocked.file.id, THUMBNAIL_CONTENT) {
            Some(content) => content,
            None => self.tree.create_content(tx, &unlocked.file, THUMBNAIL_CONTENT)?,
        };
        let snapshot = self.tree.write_content(tx, unlocked, &content, &thumbnail, creator)?;
        info!(file = unlocked.file.id, content = content.id, bytes = snapshot.size, "thumbnail stored");
        Ok(Some(content.id))
    }
}
