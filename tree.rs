//! Files, folders, contents and snapshots.
//!
//! This module provides [`FileTree`], the operations over a user's folder
//! hierarchy. Every operation unlocks the files it touches through the
//! [`KeyVault`] first; nothing here reads or writes bytes without a key.
//!
//! ## Contents and Snapshots
//!
//! A file owns one or more named byte streams ([`FileContent`]); exactly
//! one is the main content, created on first use. Each content's history
//! is a tree of [`FileSnapshot`]s linked by `base_snapshot_id`. The latest
//! snapshot is the leaf with the greatest id.

use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use crate::auth::UserAuth;
use crate::block_codec::BlockCodec;
use crate::content_io::{BlockScope, ContentIo};
use crate::error::{Result, StrongboxError};
use crate::keys::{self, SymmetricKey};
use crate::model::{
    AccessLevel, ContentAnalysis, ContentId, File, FileContent, FileId, FileKind, FileSnapshot,
    SnapshotId, UserId,
};
use crate::storage::Storage;
use crate::store::{DeletedFilter, Query, Stored, Transaction};
use crate::vault::{new_child_key, KeyVault, Unlocked};

const MAIN_CONTENT: &str = "main";
const SEARCH_LIMIT: usize = 100;

/// A fresh root folder for `user_id`, its key sealed to `public_key`.
pub fn new_root(user_id: UserId, public_key: &[u8]) -> Result<File> {
    let key = SymmetricKey::generate();
    let sealed = keys::seal_key(public_key, &key)
        .map_err(|e| StrongboxError::internal(format!("sealing root key: {}", e)))?;
    Ok(File {
        parent_id: None,
        owner_user_id: user_id,
        name: String::new(),
        kind: FileKind::Folder,
        encrypted_content_key: sealed,
    })
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(StrongboxError::invalid(format!("invalid file name '{}'", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(StrongboxError::invalid("file names cannot contain '/' or NUL"));
    }
    Ok(name)
}

/// `report.txt` -> `report (n).txt`; names without an extension get the
/// suffix at the end.
fn suffixed(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{} ({})", name, n),
    }
}

#[derive(Clone)]
pub struct FileTree {
    storage: Storage,
    vault: KeyVault,
    io: ContentIo,
}

impl FileTree {
    pub fn new(storage: Storage, vault: KeyVault, codec: BlockCodec) -> Self {
        Self {
            io: ContentIo::new(storage.clone(), codec),
            storage,
            vault,
        }
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn io(&self) -> &ContentIo {
        &self.io
    }

    pub fn root_of(&self, tx: Option<&Transaction>, user_id: UserId) -> Result<Stored<File>> {
        self.storage
            .files
            .first(
                tx,
                &Query::new().filter(move |f: &File| f.owner_user_id == user_id && f.is_root()),
            )
            .ok_or_else(|| StrongboxError::not_found(format!("user {} has no root folder", user_id)))
    }

    /// Unlock a live file. Trashed files read as missing here.
    pub fn open(
        &self,
        tx: Option<&Transaction>,
        file_id: FileId,
        auth: &UserAuth,
        level: AccessLevel,
    ) -> Result<Unlocked> {
        let unlocked = self.vault.unlock(tx, file_id, auth, level)?;
        if unlocked.file.deleted {
            return Err(StrongboxError::not_found(format!("file {} is in the trash", file_id)));
        }
        Ok(unlocked)
    }

    fn live_children(&self, tx: Option<&Transaction>, folder_id: FileId) -> Vec<Stored<File>> {
        self.storage.files.query(tx, &Query::new().partition(folder_id))
    }

    fn name_taken(&self, tx: Option<&Transaction>, folder_id: FileId, name: &str, except: Option<FileId>) -> bool {
        let wanted = name.to_lowercase();
        self.live_children(tx, folder_id)
            .iter()
            .any(|sibling| Some(sibling.id) != except && sibling.name.to_lowercase() == wanted)
    }

    /// Create a file or folder under `parent_id` (the caller's root if
    /// omitted). Folder names must be free; file names get ` (n)` appended
    /// until they are.
    pub fn create(
        &self,
        tx: &Transaction,
        parent_id: Option<FileId>,
        name: &str,
        kind: FileKind,
        auth: &UserAuth,
    ) -> Result<Stored<File>> {
        let name = validate_name(name)?;
        let parent_id = match parent_id {
            Some(id) => id,
            None => self.root_of(Some(tx), auth.user_id)?.id,
        };
        let parent = self.open(Some(tx), parent_id, auth, AccessLevel::ReadWrite)?;
        if parent.file.kind != FileKind::Folder {
            return Err(StrongboxError::invalid(format!("{} is not a folder", parent_id)));
        }

        let name = if !self.name_taken(Some(tx), parent_id, name, None) {
            name.to_string()
        } else if kind == FileKind::Folder {
            return Err(StrongboxError::conflict(format!("'{}' already exists", name)));
        } else {
            (1..)
                .map(|n| suffixed(name, n))
                .find(|candidate| !self.name_taken(Some(tx), parent_id, candidate, None))
                .ok_or_else(|| StrongboxError::conflict(format!("'{}' already exists", name)))?
        };

        let (_, wrapped) = new_child_key(&parent.key)?;
        let file = self.storage.files.insert(
            tx,
            File {
                parent_id: Some(parent_id),
                owner_user_id: parent.file.owner_user_id,
                name,
                kind,
                encrypted_content_key: wrapped,
            },
        )?;
        info!(file = file.id, parent = parent_id, kind = %kind, user = auth.user_id, "file created");
        Ok(file)
    }

    pub fn list_children(
        &self,
        tx: Option<&Transaction>,
        folder_id: FileId,
        auth: &UserAuth,
    ) -> Result<Vec<Stored<File>>> {
        let folder = self.open(tx, folder_id, auth, AccessLevel::Read)?;
        if folder.file.kind != FileKind::Folder {
            return Err(StrongboxError::invalid(format!("{} is not a folder", folder_id)));
        }
        Ok(self.storage.files.query(
            tx,
            &Query::new().partition(folder_id).order_by(|a: &Stored<File>, b: &Stored<File>| {
                (a.kind != FileKind::Folder, a.name.to_lowercase())
                    .cmp(&(b.kind != FileKind::Folder, b.name.to_lowercase()))
            }),
        ))
    }

    pub fn rename(&self, tx: &Transaction, file_id: FileId, name: &str, auth: &UserAuth) -> Result<Stored<File>> {
        let name = validate_name(name)?.to_string();
        let unlocked = self.open(Some(tx), file_id, auth, AccessLevel::ReadWrite)?;
        let parent_id = unlocked
            .file
            .parent_id
            .ok_or_else(|| StrongboxError::invalid("the root folder cannot be renamed"))?;
        if self.name_taken(Some(tx), parent_id, &name, Some(file_id)) {
            return Err(StrongboxError::conflict(format!("'{}' already exists", name)));
        }
        let renamed = self
            .storage
            .files
            .update(tx, file_id, Some(unlocked.file.data_id), |f| f.name = name)?;
        debug!(file = file_id, user = auth.user_id, "file renamed");
        Ok(renamed)
    }

    /// Move `file_id` under `new_parent_id`, rewrapping its key under the
    /// new parent. Both ends need write access and must share an owner.
    pub fn move_file(
        &self,
        tx: &Transaction,
        file_id: FileId,
        new_parent_id: FileId,
        auth: &UserAuth,
    ) -> Result<Stored<File>> {
        let moving = self.open(Some(tx), file_id, auth, AccessLevel::ReadWrite)?;
        if moving.file.is_root() {
            return Err(StrongboxError::invalid("the root folder cannot be moved"));
        }
        let destination = self.open(Some(tx), new_parent_id, auth, AccessLevel::ReadWrite)?;
        if destination.file.kind != FileKind::Folder {
            return Err(StrongboxError::invalid(format!("{} is not a folder", new_parent_id)));
        }
        if destination.file.owner_user_id != moving.file.owner_user_id {
            return Err(StrongboxError::invalid("files cannot move between owners"));
        }
        if moving.file.parent_id == Some(new_parent_id) {
            return Ok(moving.file);
        }
        if self.name_taken(Some(tx), new_parent_id, &moving.file.name, Some(file_id)) {
            return Err(StrongboxError::conflict(format!(
                "'{}' already exists in the destination",
                moving.file.name
            )));
        }

        let mut visited = HashSet::new();
        let mut cursor = Some(new_parent_id);
        while let Some(id) = cursor {
            if id == file_id {
                return Err(StrongboxError::invalid("a folder cannot move into itself"));
            }
            if !visited.insert(id) {
                return Err(StrongboxError::internal(format!("cycle in parent chain at {}", id)));
            }
            cursor = self.storage.files.get_any(Some(tx), id)?.parent_id;
        }

        let rewrapped = keys::wrap_key(&destination.key, &moving.key)
            .map_err(|e| StrongboxError::internal(format!("rewrapping file key: {}", e)))?;
        let moved = self
            .storage
            .files
            .update(tx, file_id, Some(moving.file.data_id), move |f| {
                f.parent_id = Some(new_parent_id);
                f.encrypted_content_key = rewrapped;
            })?;
        info!(file = file_id, to = new_parent_id, user = auth.user_id, "file moved");
        Ok(moved)
    }

    pub fn trash(&self, tx: &Transaction, file_id: FileId, auth: &UserAuth) -> Result<()> {
        let unlocked = self.open(Some(tx), file_id, auth, AccessLevel::Manage)?;
        if unlocked.file.is_root() {
            return Err(StrongboxError::invalid("the root folder cannot be trashed"));
        }
        self.storage.files.delete(tx, file_id)?;
        info!(file = file_id, user = auth.user_id, "file trashed");
        Ok(())
    }

    pub fn untrash(&self, tx: &Transaction, file_id: FileId, auth: &UserAuth) -> Result<Stored<File>> {
        let unlocked = self.vault.unlock(Some(tx), file_id, auth, AccessLevel::Manage)?;
        if !unlocked.file.deleted {
            return Ok(unlocked.file);
        }
        if let Some(parent_id) = unlocked.file.parent_id {
            if self.storage.files.get(Some(tx), parent_id).is_err() {
                return Err(StrongboxError::invalid("the parent folder is in the trash"));
            }
            if self.name_taken(Some(tx), parent_id, &unlocked.file.name, Some(file_id)) {
                return Err(StrongboxError::conflict(format!(
                    "'{}' already exists",
                    unlocked.file.name
                )));
            }
        }
        self.storage.files.restore(tx, file_id)?;
        info!(file = file_id, user = auth.user_id, "file restored from trash");
        Ok(self.storage.files.get(Some(tx), file_id)?)
    }

    /// Permanently remove `file_id` and its whole subtree with every
    /// content, snapshot, block, grant and cached analysis. Returns the
    /// number of files removed.
    pub fn purge(&self, tx: &Transaction, file_id: FileId, auth: &UserAuth) -> Result<usize> {
        let unlocked = self.vault.unlock(Some(tx), file_id, auth, AccessLevel::Full)?;
        if unlocked.file.is_root() {
            return Err(StrongboxError::invalid("the root folder cannot be purged"));
        }
        let removed = self.purge_subtree(tx, file_id)?;
        info!(file = file_id, files = removed, user = auth.user_id, "file purged");
        Ok(removed)
    }

    /// Remove a subtree without access checks.
    pub(crate) fn purge_subtree(&self, tx: &Transaction, file_id: FileId) -> Result<usize> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([file_id]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            let children = self.storage.files.query(
                Some(tx),
                &Query::new().partition(id).deleted(DeletedFilter::Include),
            );
            queue.extend(children.iter().map(|child| child.id));
        }

        for id in order.iter().rev() {
            for content in self.all_contents(Some(tx), *id) {
                for snapshot in self.list_snapshots(Some(tx), content.id) {
                    self.io.purge_blocks(tx, snapshot.id)?;
                    self.purge_analysis(tx, snapshot.id)?;
                    self.storage.snapshots.purge(tx, snapshot.id)?;
                }
                self.storage.contents.purge(tx, content.id)?;
            }
            self.vault.revoke_all(tx, *id)?;
            self.storage.files.purge(tx, *id)?;
        }
        Ok(order.len())
    }

    fn purge_analysis(&self, tx: &Transaction, snapshot_id: SnapshotId) -> Result<()> {
        let cached = self
            .storage
            .analysis
            .query(Some(tx), &Query::new().partition(snapshot_id));
        for row in cached {
            self.storage.analysis.purge(tx, row.id)?;
        }
        Ok(())
    }

    /// Trashed files owned by the caller, top-most first.
    pub fn list_trash(&self, tx: Option<&Transaction>, auth: &UserAuth) -> Vec<Stored<File>> {
        let owner = auth.user_id;
        self.storage.files.query(
            tx,
            &Query::new()
                .deleted(DeletedFilter::Only)
                .filter(move |f: &File| f.owner_user_id == owner),
        )
    }

    /// Live files owned by the caller whose name contains `text`.
    pub fn search(&self, tx: Option<&Transaction>, auth: &UserAuth, text: &str) -> Vec<Stored<File>> {
        let owner = auth.user_id;
        self.storage.files.query(
            tx,
            &Query::new()
                .search(text)
                .filter(move |f: &File| f.owner_user_id == owner && !f.is_root())
                .limit(SEARCH_LIMIT),
        )
    }

    /// `/`-separated path from the owner's root.
    pub fn file_path(&self, tx: Option<&Transaction>, file_id: FileId, auth: &UserAuth) -> Result<String> {
        let unlocked = self.vault.unlock(tx, file_id, auth, AccessLevel::Read)?;
        let mut names = Vec::new();
        let mut visited = HashSet::new();
        let mut current = unlocked.file;
        while let Some(parent_id) = current.parent_id {
            if !visited.insert(current.id) {
                return Err(StrongboxError::internal(format!("cycle in parent chain at {}", current.id)));
            }
            names.push(current.name.clone());
            current = self.storage.files.get_any(tx, parent_id)?;
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    pub fn file_history(&self, tx: Option<&Transaction>, file_id: FileId, auth: &UserAuth) -> Result<Vec<Stored<File>>> {
        self.vault.unlock(tx, file_id, auth, AccessLevel::Read)?;
        Ok(self.storage.files.history(tx, file_id)?)
    }

    // Contents

    fn all_contents(&self, tx: Option<&Transaction>, file_id: FileId) -> Vec<Stored<FileContent>> {
        self.storage.contents.query(
            tx,
            &Query::new().partition(file_id).deleted(DeletedFilter::Include),
        )
    }

    pub fn list_contents(&self, tx: Option<&Transaction>, file_id: FileId) -> Vec<Stored<FileContent>> {
        self.storage.contents.query(tx, &Query::new().partition(file_id))
    }

    pub fn find_main_content(&self, tx: Option<&Transaction>, file_id: FileId) -> Option<Stored<FileContent>> {
        self.storage.contents.first(
            tx,
            &Query::new()
                .partition(file_id)
                .filter(|c: &FileContent| c.is_main),
        )
    }

    /// The file's main content, created on first use.
    pub fn get_main_content(&self, tx: &Transaction, file: &Stored<File>) -> Result<Stored<FileContent>> {
        if file.kind != FileKind::File {
            return Err(StrongboxError::invalid(format!("{} is not a file", file.id)));
        }
        if let Some(content) = self.find_main_content(Some(tx), file.id) {
            return Ok(content);
        }
        let content = self.storage.contents.insert(
            tx,
            FileContent {
                file_id: file.id,
                name: MAIN_CONTENT.to_string(),
                is_main: true,
            },
        )?;
        debug!(file = file.id, content = content.id, "main content created");
        Ok(content)
    }

    /// A secondary named stream, e.g. a generated thumbnail.
    pub fn create_content(&self, tx: &Transaction, file: &Stored<File>, name: &str) -> Result<Stored<FileContent>> {
        let name = validate_name(name)?;
        if name.eq_ignore_ascii_case(MAIN_CONTENT) {
            return Err(StrongboxError::invalid("'main' names the main content"));
        }
        let wanted = name.to_lowercase();
        let taken = self
            .list_contents(Some(tx), file.id)
            .iter()
            .any(|c| c.name.to_lowercase() == wanted);
        if taken {
            return Err(StrongboxError::conflict(format!("content '{}' already exists", name)));
        }
        let content = self.storage.contents.insert(
            tx,
            FileContent {
                file_id: file.id,
                name: name.to_string(),
                is_main: false,
            },
        )?;
        debug!(file = file.id, content = content.id, name, "content created");
        Ok(content)
    }

    pub fn find_content(&self, tx: Option<&Transaction>, file_id: FileId, name: &str) -> Option<Stored<FileContent>> {
        let wanted = name.to_lowercase();
        self.list_contents(tx, file_id)
            .into_iter()
            .find(|c| c.name.to_lowercase() == wanted)
    }

    // Snapshots

    pub fn list_snapshots(&self, tx: Option<&Transaction>, content_id: ContentId) -> Vec<Stored<FileSnapshot>> {
        self.storage.snapshots.query(tx, &Query::new().partition(content_id))
    }

    /// Greatest-id snapshot that no other snapshot uses as its base.
    pub fn latest_snapshot(&self, tx: Option<&Transaction>, content_id: ContentId) -> Option<Stored<FileSnapshot>> {
        let snapshots = self.list_snapshots(tx, content_id);
        let bases: HashSet<SnapshotId> = snapshots.iter().filter_map(|s| s.base_snapshot_id).collect();
        snapshots
            .into_iter()
            .filter(|s| !bases.contains(&s.id))
            .max_by_key(|s| s.id)
    }

    /// New snapshot branching from `base` (a fresh root when `None`), with
    /// a copy of the base's blocks.
    pub fn fork_snapshot(
        &self,
        tx: &Transaction,
        content: &Stored<FileContent>,
        base: Option<SnapshotId>,
        creator: UserId,
    ) -> Result<Stored<FileSnapshot>> {
        let size = match base {
            Some(base_id) => {
                let base = self.storage.snapshots.get(Some(tx), base_id)?;
                if base.content_id != content.id {
                    return Err(StrongboxError::invalid(format!(
                        "snapshot {} belongs to another content",
                        base_id
                    )));
                }
                base.size
            }
            None => 0,
        };
        let snapshot = self.storage.snapshots.insert(
            tx,
            FileSnapshot {
                file_id: content.file_id,
                content_id: content.id,
                base_snapshot_id: base,
                creator_user_id: creator,
                size,
            },
        )?;
        let copied = match base {
            Some(base_id) => self.io.copy_blocks(tx, base_id, snapshot.id)?,
            None => 0,
        };
        debug!(content = content.id, snapshot = snapshot.id, base = ?base, blocks = copied, "snapshot forked");
        Ok(snapshot)
    }

    /// Snapshot ancestry, newest first.
    pub fn snapshot_history(&self, tx: Option<&Transaction>, snapshot_id: SnapshotId) -> Result<Vec<Stored<FileSnapshot>>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(snapshot_id);
        while let Some(id) = cursor {
            if !visited.insert(id) {
                return Err(StrongboxError::internal(format!("cycle in snapshot chain at {}", id)));
            }
            let snapshot = self.storage.snapshots.get(tx, id)?;
            cursor = snapshot.base_snapshot_id;
            chain.push(snapshot);
        }
        Ok(chain)
    }

    /// Up to `count` bytes of the latest main snapshot starting at
    /// `offset`; empty past the end or when nothing was written yet.
    pub fn read_main_at(
        &self,
        tx: Option<&Transaction>,
        unlocked: &Unlocked,
        offset: u64,
        count: usize,
    ) -> Result<Vec<u8>> {
        let Some(content) = self.find_main_content(tx, unlocked.file.id) else {
            return Ok(Vec::new());
        };
        let Some(snapshot) = self.latest_snapshot(tx, content.id) else {
            return Ok(Vec::new());
        };
        let scope = BlockScope {
            file_id: unlocked.file.id,
            content_id: content.id,
            snapshot_id: snapshot.id,
            key: &unlocked.key,
        };
        self.io.read_at(tx, &scope, offset, count)
    }

    /// Replace a content's bytes with `data` as one new snapshot.
    pub fn write_content(
        &self,
        tx: &Transaction,
        unlocked: &Unlocked,
        content: &Stored<FileContent>,
        data: &[u8],
        creator: UserId,
    ) -> Result<Stored<FileSnapshot>> {
        let base = self.latest_snapshot(Some(tx), content.id).map(|s| s.id);
        let snapshot = self.fork_snapshot(tx, content, base, creator)?;
        let scope = BlockScope {
            file_id: unlocked.file.id,
            content_id: content.id,
            snapshot_id: snapshot.id,
            key: &unlocked.key,
        };
        self.io.truncate(tx, &scope, 0)?;
        self.io.write_at(tx, &scope, 0, data)?;
        Ok(self.storage.snapshots.get(Some(tx), snapshot.id)?)
    }

    pub(crate) fn cached_analysis(
        &self,
        tx: Option<&Transaction>,
        snapshot_id: SnapshotId,
    ) -> Option<Stored<ContentAnalysis>> {
        self.storage
            .analysis
            .first(tx, &Query::new().partition(snapshot_id))
    }
}
