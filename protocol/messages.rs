//! Request and response bodies carried in packet `data`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pipeline::{FileTarget, StreamTarget};
use crate::auth::SessionGrant;
use crate::model::{
    b64, AccessLevel, ContentId, File, FileAccess, FileContent, FileId, FileKind, FileSnapshot, Role,
    SnapshotId, User, UserId,
};
use crate::store::{DataId, ResourceId, Stored};
use crate::stream::HandleId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

impl FileTarget for Empty {
    fn file_id(&self) -> Option<FileId> {
        None
    }
}

// Accounts

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogin {
    pub username: String,
    #[serde(with = "b64")]
    pub token: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: ResourceId,
    #[serde(with = "b64")]
    pub session_key: Vec<u8>,
    pub user_id: UserId,
    pub expire_time: DateTime<Utc>,
}

impl From<SessionGrant> for SessionInfo {
    fn from(grant: SessionGrant) -> Self {
        Self {
            session_id: grant.session_id,
            session_key: grant.session_key,
            user_id: grant.user_id,
            expire_time: grant.expire_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: UserId,
    pub username: String,
    pub roles: Vec<Role>,
}

impl From<&Stored<User>> for UserInfo {
    fn from(user: &Stored<User>) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            roles: user.roles.roles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub authentication_id: ResourceId,
    #[serde(with = "b64")]
    pub token: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRoles {
    pub user_id: UserId,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTarget {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Count {
    pub count: usize,
}

// Files

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(default)]
    pub file_id: Option<FileId>,
}

impl FileRef {
    pub fn to(file_id: FileId) -> Self {
        Self {
            file_id: Some(file_id),
        }
    }
}

impl FileTarget for FileRef {
    fn file_id(&self) -> Option<FileId> {
        self.file_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: FileId,
    pub parent_id: Option<FileId>,
    pub owner_user_id: UserId,
    pub name: String,
    pub kind: FileKind,
    pub deleted: bool,
    pub data_id: DataId,
    pub modified: DateTime<Utc>,
}

impl From<&Stored<File>> for FileInfo {
    fn from(file: &Stored<File>) -> Self {
        Self {
            file_id: file.id,
            parent_id: file.parent_id,
            owner_user_id: file.owner_user_id,
            name: file.name.clone(),
            kind: file.kind,
            deleted: file.deleted,
            data_id: file.data_id,
            modified: file.create_time,
        }
    }
}

pub fn file_infos(files: &[Stored<File>]) -> Vec<FileInfo> {
    files.iter().map(FileInfo::from).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFile {
    #[serde(default)]
    pub parent_id: Option<FileId>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameFile {
    pub file_id: FileId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveFile {
    pub file_id: FileId,
    pub new_parent_id: FileId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFiles {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathInfo {
    pub path: String,
}

// Access

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantAccess {
    pub file_id: FileId,
    pub username: String,
    pub level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantInfo {
    pub grant_id: ResourceId,
    pub file_id: FileId,
    pub target_user_id: UserId,
    pub level: AccessLevel,
    pub granter_user_id: UserId,
}

impl From<&Stored<FileAccess>> for GrantInfo {
    fn from(grant: &Stored<FileAccess>) -> Self {
        Self {
            grant_id: grant.id,
            file_id: grant.file_id,
            target_user_id: grant.target_user_id,
            level: grant.level,
            granter_user_id: grant.granter_user_id,
        }
    }
}

// Contents and snapshots

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub content_id: ContentId,
    pub name: String,
    pub is_main: bool,
}

impl From<&Stored<FileContent>> for ContentInfo {
    fn from(content: &Stored<FileContent>) -> Self {
        Self {
            content_id: content.id,
            name: content.name.clone(),
            is_main: content.is_main,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotQuery {
    pub file_id: FileId,
    /// Defaults to the main content.
    #[serde(default)]
    pub content_id: Option<ContentId>,
}

impl FileTarget for SnapshotQuery {
    fn file_id(&self) -> Option<FileId> {
        Some(self.file_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: SnapshotId,
    pub content_id: ContentId,
    pub base_snapshot_id: Option<SnapshotId>,
    pub creator_user_id: UserId,
    pub size: u64,
    pub created: DateTime<Utc>,
}

impl From<&Stored<FileSnapshot>> for SnapshotInfo {
    fn from(snapshot: &Stored<FileSnapshot>) -> Self {
        Self {
            snapshot_id: snapshot.id,
            content_id: snapshot.content_id,
            base_snapshot_id: snapshot.base_snapshot_id,
            creator_user_id: snapshot.creator_user_id,
            size: snapshot.size,
            created: snapshot.create_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub threats: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimeResult {
    pub mime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailResult {
    pub content_id: Option<ContentId>,
}

// Streams

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenFileStream {
    pub file_id: FileId,
    #[serde(default)]
    pub write: bool,
}

impl FileTarget for OpenFileStream {
    fn file_id(&self) -> Option<FileId> {
        Some(self.file_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleRef {
    pub handle_id: HandleId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamReadRequest {
    pub handle_id: HandleId,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamData {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamWriteRequest {
    pub handle_id: HandleId,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSeekRequest {
    pub handle_id: HandleId,
    pub position: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTruncateRequest {
    pub handle_id: HandleId,
    pub length: u64,
}

macro_rules! stream_target {
    ($($request:ty),+) => {
        $(impl StreamTarget for $request {
            fn handle_id(&self) -> HandleId {
                self.handle_id
            }
        })+
    };
}

stream_target!(
    HandleRef,
    StreamReadRequest,
    StreamWriteRequest,
    StreamSeekRequest,
    StreamTruncateRequest
);
