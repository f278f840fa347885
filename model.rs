//! Persisted entity types.
//!
//! Every type here is a [`Resource`]: its rows live in a versioned
//! [`ResourceStore`](crate::store::ResourceStore) and carry only their own
//! fields. Record state (`id`, `deleted`) and version links live in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::keys::{KdfParams, WrappedKey};
use crate::store::{Resource, ResourceId};

pub type UserId = ResourceId;
pub type FileId = ResourceId;
pub type ContentId = ResourceId;
pub type SnapshotId = ResourceId;

/// Serde adapter storing byte vectors as standard base64 strings.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Member,
    Admin,
    Guest,
}

impl Role {
    fn bit(self) -> u32 {
        match self {
            Role::Member => 1 << 0,
            Role::Admin => 1 << 1,
            Role::Guest => 1 << 2,
        }
    }
}

/// Bitset of [`Role`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(u32);

impl RoleSet {
    pub const EMPTY: RoleSet = RoleSet(0);

    pub fn of(roles: &[Role]) -> Self {
        roles.iter().fold(Self::EMPTY, |set, role| set.with(*role))
    }

    pub fn with(self, role: Role) -> Self {
        RoleSet(self.0 | role.bit())
    }

    pub fn without(self, role: Role) -> Self {
        RoleSet(self.0 & !role.bit())
    }

    pub fn contains(self, role: Role) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn intersects(self, other: RoleSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn roles(self) -> Vec<Role> {
        [Role::Member, Role::Admin, Role::Guest]
            .into_iter()
            .filter(|role| self.contains(*role))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    pub roles: RoleSet,
}

impl Resource for User {
    const TABLE: &'static str = "users";

    fn search_text(&self) -> Vec<&str> {
        vec![self.username.as_str()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialKind {
    Password,
    Token,
}

/// One credential able to open a user's private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAuthentication {
    pub user_id: UserId,
    pub kind: CredentialKind,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// Argon2id cost; only password credentials carry one.
    #[serde(default)]
    pub kdf: Option<KdfParams>,
    pub encrypted_private_key: WrappedKey,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

impl Resource for UserAuthentication {
    const TABLE: &'static str = "user_authentications";

    fn partition(&self) -> Option<u64> {
        Some(self.user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: UserId,
    pub origin_authentication_id: ResourceId,
    pub expire_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// The user's private key, wrapped under the session key held by the client.
    pub wrapped_private_key: WrappedKey,
}

impl Resource for UserSession {
    const TABLE: &'static str = "user_sessions";

    fn partition(&self) -> Option<u64> {
        Some(self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Folder,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::File => write!(f, "file"),
            FileKind::Folder => write!(f, "folder"),
        }
    }
}

/// A file or folder. Roots have no parent and their key is sealed to the
/// owner's public key; every other key is wrapped under the parent's key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub parent_id: Option<FileId>,
    pub owner_user_id: UserId,
    pub name: String,
    pub kind: FileKind,
    pub encrypted_content_key: WrappedKey,
}

impl File {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl Resource for File {
    const TABLE: &'static str = "files";

    fn partition(&self) -> Option<u64> {
        self.parent_id
    }

    fn search_text(&self) -> Vec<&str> {
        vec![self.name.as_str()]
    }
}

/// Ordered access levels: `None < Read < ReadWrite < Manage < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    None,
    Read,
    ReadWrite,
    Manage,
    Full,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An explicit grant letting `target_user_id` unlock `file_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccess {
    pub file_id: FileId,
    pub target_user_id: UserId,
    pub level: AccessLevel,
    pub granter_user_id: UserId,
    /// The file key sealed to the target's public key.
    pub wrapped_key: WrappedKey,
}

impl Resource for FileAccess {
    const TABLE: &'static str = "file_access";

    fn partition(&self) -> Option<u64> {
        Some(self.file_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub file_id: FileId,
    pub name: String,
    pub is_main: bool,
}

impl Resource for FileContent {
    const TABLE: &'static str = "file_contents";

    fn partition(&self) -> Option<u64> {
        Some(self.file_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub file_id: FileId,
    pub content_id: ContentId,
    pub base_snapshot_id: Option<SnapshotId>,
    pub creator_user_id: UserId,
    pub size: u64,
}

impl Resource for FileSnapshot {
    const TABLE: &'static str = "file_snapshots";

    fn partition(&self) -> Option<u64> {
        Some(self.content_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDataBlock {
    pub file_id: FileId,
    pub content_id: ContentId,
    pub snapshot_id: SnapshotId,
    pub index: u64,
    #[serde(with = "b64")]
    pub encrypted_bytes: Vec<u8>,
}

impl Resource for FileDataBlock {
    const TABLE: &'static str = "file_data_blocks";

    fn partition(&self) -> Option<u64> {
        Some(self.snapshot_id)
    }
}

/// Cached collaborator output for one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub file_id: FileId,
    pub content_id: ContentId,
    pub snapshot_id: SnapshotId,
    #[serde(default)]
    pub threats: Option<Vec<String>>,
    #[serde(default)]
    pub mime: Option<String>,
}

impl Resource for ContentAnalysis {
    const TABLE: &'static str = "content_analysis";

    fn partition(&self) -> Option<u64> {
        Some(self.snapshot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::None < AccessLevel::Read);
        assert!(AccessLevel::Read < AccessLevel::ReadWrite);
        assert!(AccessLevel::ReadWrite < AccessLevel::Manage);
        assert!(AccessLevel::Manage < AccessLevel::Full);
    }

    #[test]
    fn role_sets_combine() {
        let set = RoleSet::of(&[Role::Member, Role::Admin]);
        assert!(set.contains(Role::Admin));
        assert!(!set.contains(Role::Guest));
        assert!(!set.without(Role::Admin).contains(Role::Admin));
        assert!(set.intersects(RoleSet::of(&[Role::Admin])));
        assert!(!set.intersects(RoleSet::of(&[Role::Guest])));
        assert_eq!(set.roles(), vec![Role::Member, Role::Admin]);
    }

    #[test]
    fn block_bytes_serialize_as_base64() {
        let block = FileDataBlock {
            file_id: 1,
            content_id: 2,
            snapshot_id: 3,
            index: 0,
            encrypted_bytes: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_value(&block).expect("serialize");
        assert_eq!(json["encrypted_bytes"], "3q2+7w==");

        let back: FileDataBlock = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.encrypted_bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}
