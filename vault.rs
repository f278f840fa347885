//! The key hierarchy that gates file access.
//!
//! Every file's content key is wrapped exactly one way:
//!
//! - a root folder's key is sealed to its owner's public key
//! - every other key is wrapped under its parent folder's key
//!
//! and additionally sealed to each grantee's public key in a
//! [`FileAccess`] row. Unlocking a file walks up the parent chain until it
//! reaches either the caller's own root or a grant the caller holds, then
//! unwraps keys back down. Holding a folder key therefore exposes every
//! descendant, while a descendant key reveals nothing above it.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::auth::UserAuth;
use crate::error::{Result, StrongboxError};
use crate::keys::{self, KeyError, SymmetricKey};
use crate::model::{AccessLevel, File, FileAccess, FileId, UserId};
use crate::storage::Storage;
use crate::store::{Query, Stored, Transaction};

/// A file whose content key the caller has recovered.
#[derive(Debug, Clone)]
pub struct Unlocked {
    pub file: Stored<File>,
    pub key: SymmetricKey,
    pub level: AccessLevel,
}

fn chain_error(file_id: FileId, err: KeyError) -> StrongboxError {
    warn!(file = file_id, error = %err, "key chain failed to open");
    StrongboxError::forbidden(format!("no access to file {}", file_id))
}

#[derive(Clone)]
pub struct KeyVault {
    storage: Storage,
}

impl KeyVault {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Recover the content key of `file_id` for `auth`, requiring at least
    /// `required` access. Trashed files can still be unlocked.
    pub fn unlock(
        &self,
        tx: Option<&Transaction>,
        file_id: FileId,
        auth: &UserAuth,
        required: AccessLevel,
    ) -> Result<Unlocked> {
        let target = self.storage.files.get_any(tx, file_id)?;
        let denied = || StrongboxError::forbidden(format!("no access to file {}", file_id));

        // Files whose keys must be unwrapped on the way back down, nearest
        // to the anchor last.
        let mut descent: Vec<Stored<File>> = Vec::new();
        let mut visited = HashSet::new();
        let mut current = target.clone();

        let (mut key, level) = loop {
            if !visited.insert(current.id) {
                warn!(file = current.id, "cycle in parent chain");
                return Err(denied());
            }

            if current.owner_user_id == auth.user_id && current.is_root() {
                let key = auth
                    .key_pair()
                    .open(&current.encrypted_content_key)
                    .map_err(|e| chain_error(current.id, e))?;
                break (key, AccessLevel::Full);
            }

            if let Some(grant) = self.find_grant(tx, current.id, auth.user_id) {
                if grant.level >= required {
                    let key = auth
                        .key_pair()
                        .open(&grant.wrapped_key)
                        .map_err(|e| chain_error(current.id, e))?;
                    break (key, grant.level);
                }
            }

            match current.parent_id {
                Some(parent_id) => {
                    let parent = self.storage.files.get_any(tx, parent_id)?;
                    descent.push(current);
                    current = parent;
                }
                None => {
                    debug!(file = file_id, user = auth.user_id, "no owner or grant path");
                    return Err(denied());
                }
            }
        };

        while let Some(child) = descent.pop() {
            key = keys::unwrap_key(&key, &child.encrypted_content_key)
                .map_err(|e| chain_error(child.id, e))?;
        }

        if level < required {
            return Err(denied());
        }
        debug!(file = file_id, user = auth.user_id, level = %level, "file unlocked");
        Ok(Unlocked {
            file: target,
            key,
            level,
        })
    }

    pub fn find_grant(&self, tx: Option<&Transaction>, file_id: FileId, user_id: UserId) -> Option<Stored<FileAccess>> {
        self.storage.access.first(
            tx,
            &Query::new()
                .partition(file_id)
                .filter(move |grant: &FileAccess| grant.target_user_id == user_id),
        )
    }

    /// Give `target_user_id` access to `file_id` at `level`; `None` revokes.
    /// The granter needs `Manage` and cannot hand out more than they hold.
    pub fn grant(
        &self,
        tx: &Transaction,
        file_id: FileId,
        target_user_id: UserId,
        level: AccessLevel,
        granter: &UserAuth,
    ) -> Result<Option<Stored<FileAccess>>> {
        let unlocked = self.unlock(Some(tx), file_id, granter, AccessLevel::Manage)?;
        if level > unlocked.level {
            return Err(StrongboxError::forbidden(format!(
                "cannot grant {} while holding {}",
                level, unlocked.level
            )));
        }
        if target_user_id == granter.user_id {
            return Err(StrongboxError::invalid("cannot change your own access"));
        }
        let target = self.storage.users.get(Some(tx), target_user_id)?;
        let existing = self.find_grant(Some(tx), file_id, target_user_id);

        if level == AccessLevel::None {
            if let Some(existing) = existing {
                self.storage.access.purge(tx, existing.id)?;
                info!(file = file_id, target = target_user_id, granter = granter.user_id, "access revoked");
            }
            return Ok(None);
        }

        let wrapped_key = keys::seal_key(&target.public_key, &unlocked.key)
            .map_err(|e| StrongboxError::internal(format!("sealing file key: {}", e)))?;
        let granter_user_id = granter.user_id;
        let stored = match existing {
            Some(existing) => self.storage.access.update(tx, existing.id, None, move |grant| {
                grant.level = level;
                grant.granter_user_id = granter_user_id;
                grant.wrapped_key = wrapped_key;
            })?,
            None => self.storage.access.insert(
                tx,
                FileAccess {
                    file_id,
                    target_user_id,
                    level,
                    granter_user_id,
                    wrapped_key,
                },
            )?,
        };
        info!(file = file_id, target = target_user_id, granter = granter.user_id, level = %level, "access granted");
        Ok(Some(stored))
    }

    pub fn list_grants(&self, tx: Option<&Transaction>, file_id: FileId) -> Vec<Stored<FileAccess>> {
        self.storage.access.query(tx, &Query::new().partition(file_id))
    }

    /// Drop every grant on `file_id`; used when the file is purged.
    pub(crate) fn revoke_all(&self, tx: &Transaction, file_id: FileId) -> Result<usize> {
        let grants = self.list_grants(Some(tx), file_id);
        for grant in &grants {
            self.storage.access.purge(tx, grant.id)?;
        }
        Ok(grants.len())
    }
}

/// Generate a content key and wrap it under `parent_key`.
pub(crate) fn new_child_key(parent_key: &SymmetricKey) -> Result<(SymmetricKey, keys::WrappedKey)> {
    let key = SymmetricKey::generate();
    let wrapped = keys::wrap_key(parent_key, &key)
        .map_err(|e| StrongboxError::internal(format!("wrapping file key: {}", e)))?;
    Ok((key, wrapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::cheap_kdf;
    use crate::auth::{Accounts, SessionPolicy};
    use crate::error::ErrorKind;
    use crate::lifetime::Lifetime;
    use crate::model::{FileKind, RoleSet};
    use crate::tree::FileTree;

    struct Fixture {
        storage: Storage,
        vault: KeyVault,
        tree: FileTree,
        owner: UserAuth,
        stranger: UserAuth,
    }

    async fn fixture() -> Fixture {
        let storage = Storage::in_memory();
        let accounts = Accounts::new(storage.clone(), cheap_kdf(), SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let owner = accounts.register_user(&tx, "owner", "pw", RoleSet::EMPTY).expect("owner");
        let stranger = accounts.register_user(&tx, "stranger", "pw", RoleSet::EMPTY).expect("stranger");
        tx.commit();
        let vault = KeyVault::new(storage.clone());
        let tree = FileTree::new(storage.clone(), vault.clone(), Default::default());
        Fixture {
            storage,
            vault,
            tree,
            owner,
            stranger,
        }
    }

    #[tokio::test]
    async fn owner_unlocks_root_and_descendants_with_full_access() {
        let f = fixture().await;
        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let folder = f.tree.create(&tx, None, "F", FileKind::Folder, &f.owner).expect("folder");
        let nested = f.tree.create(&tx, Some(folder.id), "G", FileKind::Folder, &f.owner).expect("nested");
        let file = f.tree.create(&tx, Some(nested.id), "X", FileKind::File, &f.owner).expect("file");
        let root = f.tree.root_of(Some(&tx), f.owner.user_id).expect("root");

        for id in [root.id, folder.id, nested.id, file.id] {
            let unlocked = f.vault.unlock(Some(&tx), id, &f.owner, AccessLevel::Full).expect("unlock");
            assert_eq!(unlocked.level, AccessLevel::Full);
        }
    }

    #[tokio::test]
    async fn stranger_is_forbidden_without_a_grant() {
        let f = fixture().await;
        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let file = f.tree.create(&tx, None, "X", FileKind::File, &f.owner).expect("file");
        let root = f.tree.root_of(Some(&tx), f.owner.user_id).expect("root");

        for id in [root.id, file.id] {
            let err = f.vault.unlock(Some(&tx), id, &f.stranger, AccessLevel::Read).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Forbidden);
        }
    }

    #[tokio::test]
    async fn grant_then_revoke_controls_unlock() {
        let f = fixture().await;
        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let file = f.tree.create(&tx, None, "X", FileKind::File, &f.owner).expect("file");
        let owner_key = f.vault.unlock(Some(&tx), file.id, &f.owner, AccessLevel::Read).expect("owner").key;

        f.vault
            .grant(&tx, file.id, f.stranger.user_id, AccessLevel::Read, &f.owner)
            .expect("grant");
        let unlocked = f.vault.unlock(Some(&tx), file.id, &f.stranger, AccessLevel::Read).expect("granted");
        assert_eq!(unlocked.level, AccessLevel::Read);
        assert_eq!(unlocked.key.as_bytes(), owner_key.as_bytes());

        let err = f
            .vault
            .unlock(Some(&tx), file.id, &f.stranger, AccessLevel::ReadWrite)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let revoked = f
            .vault
            .grant(&tx, file.id, f.stranger.user_id, AccessLevel::None, &f.owner)
            .expect("revoke");
        assert!(revoked.is_none());
        assert!(f.vault.list_grants(Some(&tx), file.id).is_empty());
        let err = f.vault.unlock(Some(&tx), file.id, &f.stranger, AccessLevel::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn folder_grant_reaches_descendants() {
        let f = fixture().await;
        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let folder = f.tree.create(&tx, None, "shared", FileKind::Folder, &f.owner).expect("folder");
        let file = f.tree.create(&tx, Some(folder.id), "doc", FileKind::File, &f.owner).expect("file");
        let sibling = f.tree.create(&tx, None, "private", FileKind::File, &f.owner).expect("sibling");

        f.vault
            .grant(&tx, folder.id, f.stranger.user_id, AccessLevel::ReadWrite, &f.owner)
            .expect("grant");

        let unlocked = f.vault.unlock(Some(&tx), file.id, &f.stranger, AccessLevel::Read).expect("child");
        assert_eq!(unlocked.level, AccessLevel::ReadWrite);
        assert!(f.vault.unlock(Some(&tx), sibling.id, &f.stranger, AccessLevel::Read).is_err());
    }

    #[tokio::test]
    async fn granting_requires_manage_and_cannot_escalate() {
        let f = fixture().await;
        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let file = f.tree.create(&tx, None, "X", FileKind::File, &f.owner).expect("file");

        f.vault
            .grant(&tx, file.id, f.stranger.user_id, AccessLevel::ReadWrite, &f.owner)
            .expect("grant");
        let err = f
            .vault
            .grant(&tx, file.id, f.owner.user_id, AccessLevel::Read, &f.stranger)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        f.vault
            .grant(&tx, file.id, f.stranger.user_id, AccessLevel::Manage, &f.owner)
            .expect("upgrade");
        assert_eq!(f.vault.list_grants(Some(&tx), file.id).len(), 1);
        let err = f
            .vault
            .grant(&tx, file.id, f.owner.user_id, AccessLevel::Full, &f.stranger)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
