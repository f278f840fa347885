//! Request handlers and the table that routes codes to them.

use std::sync::Arc;
use tracing::info;

use super::codes::{Dispatcher, RequestCode};
use super::messages::*;
use super::pipeline::{
    admin_scoped, authenticated, file_scoped, stream_scoped, transacted, typed, AdminScoped,
    Authenticated, FileRequirement, FileScoped, RolePolicy, Scope, SessionCredentials, StreamScoped,
    Transacted,
};
use crate::error::{Result, StrongboxError};
use crate::model::{AccessLevel, FileId, FileKind, Role, RoleSet};
use crate::stream::{OpenStream, StreamInfo};
use crate::vault::Unlocked;

/// Guests may browse what is shared with them but not change anything.
fn writers() -> RolePolicy {
    RolePolicy::deny(RoleSet::of(&[Role::Guest]))
}

/// Build the dispatch table for one connection.
pub fn dispatcher(scope: &Arc<Scope>) -> Dispatcher {
    let any = RolePolicy::ANY;
    let mut d = Dispatcher::new();

    d.register(RequestCode::Register, typed(scope, transacted(register)));
    d.register(RequestCode::Login, typed(scope, transacted(login)));
    d.register(RequestCode::LoginWithToken, typed(scope, transacted(login_with_token)));
    d.register(RequestCode::ResumeSession, typed(scope, transacted(resume_session)));
    d.register(RequestCode::Logout, typed(scope, transacted(authenticated(any, logout))));
    d.register(RequestCode::WhoAmI, typed(scope, transacted(authenticated(any, who_am_i))));
    d.register(RequestCode::AddToken, typed(scope, transacted(authenticated(writers(), add_token))));
    d.register(RequestCode::ChangePassword, typed(scope, transacted(authenticated(any, change_password))));

    d.register(
        RequestCode::GetRoot,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::folder(AccessLevel::Read), get_root)))),
    );
    d.register(
        RequestCode::GetFile,
        typed(
            scope,
            transacted(authenticated(
                any,
                file_scoped(FileRequirement::any(AccessLevel::Read).including_trash(), get_file),
            )),
        ),
    );
    d.register(
        RequestCode::ListChildren,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::folder(AccessLevel::Read), list_children)))),
    );
    d.register(RequestCode::CreateFile, typed(scope, transacted(authenticated(writers(), create_file))));
    d.register(RequestCode::CreateFolder, typed(scope, transacted(authenticated(writers(), create_folder))));
    d.register(RequestCode::Rename, typed(scope, transacted(authenticated(writers(), rename))));
    d.register(RequestCode::Move, typed(scope, transacted(authenticated(writers(), move_file))));
    d.register(RequestCode::Trash, typed(scope, transacted(authenticated(writers(), trash))));
    d.register(RequestCode::Untrash, typed(scope, transacted(authenticated(writers(), untrash))));
    d.register(RequestCode::Purge, typed(scope, transacted(authenticated(writers(), purge))));
    d.register(RequestCode::ListTrash, typed(scope, transacted(authenticated(any, list_trash))));
    d.register(RequestCode::Search, typed(scope, transacted(authenticated(any, search))));
    d.register(RequestCode::FilePath, typed(scope, transacted(authenticated(any, file_path))));
    d.register(RequestCode::FileHistory, typed(scope, transacted(authenticated(any, file_history))));

    d.register(RequestCode::Grant, typed(scope, transacted(authenticated(writers(), grant))));
    d.register(
        RequestCode::ListGrants,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::any(AccessLevel::Manage), list_grants)))),
    );

    d.register(
        RequestCode::ListContents,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::file(AccessLevel::Read), list_contents)))),
    );
    d.register(
        RequestCode::ListSnapshots,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::file(AccessLevel::Read), list_snapshots)))),
    );
    d.register(
        RequestCode::Scan,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::file(AccessLevel::Read), scan)))),
    );
    d.register(
        RequestCode::SniffMime,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::any(AccessLevel::Read), sniff_mime)))),
    );
    d.register(
        RequestCode::GenerateThumbnail,
        typed(
            scope,
            transacted(authenticated(
                writers(),
                file_scoped(FileRequirement::file(AccessLevel::ReadWrite), generate_thumbnail),
            )),
        ),
    );

    d.register(
        RequestCode::OpenStream,
        typed(scope, transacted(authenticated(any, file_scoped(FileRequirement::file(AccessLevel::Read), open_stream)))),
    );
    d.register(RequestCode::CreateFileStream, typed(scope, transacted(authenticated(writers(), create_file_stream))));
    d.register(RequestCode::StreamRead, typed(scope, stream_scoped(stream_read)));
    d.register(RequestCode::StreamWrite, typed(scope, stream_scoped(stream_write)));
    d.register(RequestCode::StreamSeek, typed(scope, stream_scoped(stream_seek)));
    d.register(RequestCode::StreamTruncate, typed(scope, stream_scoped(stream_truncate)));
    d.register(RequestCode::StreamInfo, typed(scope, stream_scoped(stream_info)));
    d.register(RequestCode::StreamClose, typed(scope, stream_scoped(stream_close)));

    d.register(RequestCode::AdminListUsers, typed(scope, transacted(authenticated(any, admin_scoped(admin_list_users)))));
    d.register(RequestCode::AdminSetRoles, typed(scope, transacted(authenticated(any, admin_scoped(admin_set_roles)))));
    d.register(
        RequestCode::AdminRevokeSessions,
        typed(scope, transacted(authenticated(any, admin_scoped(admin_revoke_sessions)))),
    );

    d
}

fn required(file: &FileRef) -> Result<FileId> {
    file.file_id
        .ok_or_else(|| StrongboxError::invalid("file_id is required"))
}

// Accounts

async fn register(ctx: Transacted, body: Credentials) -> Result<UserInfo> {
    let auth = ctx.services().accounts.register_user(
        ctx.tx(),
        &body.username,
        &body.password,
        RoleSet::of(&[Role::Member]),
    )?;
    Ok(UserInfo {
        user_id: auth.user_id,
        username: auth.username.clone(),
        roles: auth.roles.roles(),
    })
}

fn bind(ctx: &Transacted, info: &SessionInfo) {
    ctx.scope.bind_session(SessionCredentials {
        session_id: info.session_id,
        session_key: info.session_key.clone(),
    });
}

async fn login(ctx: Transacted, body: Credentials) -> Result<SessionInfo> {
    let grant = ctx
        .services()
        .accounts
        .login(ctx.tx(), &body.username, &body.password)?;
    let info = SessionInfo::from(grant);
    bind(&ctx, &info);
    Ok(info)
}

async fn login_with_token(ctx: Transacted, body: TokenLogin) -> Result<SessionInfo> {
    let grant = ctx
        .services()
        .accounts
        .login_with_token(ctx.tx(), &body.username, &body.token)?;
    let info = SessionInfo::from(grant);
    bind(&ctx, &info);
    Ok(info)
}

async fn resume_session(ctx: Transacted, body: SessionCredentials) -> Result<UserInfo> {
    let auth = ctx
        .services()
        .accounts
        .resolve_session(ctx.tx(), body.session_id, &body.session_key)?;
    ctx.scope.bind_session(body);
    Ok(UserInfo {
        user_id: auth.user_id,
        username: auth.username.clone(),
        roles: auth.roles.roles(),
    })
}

async fn logout(ctx: Authenticated, _: Empty) -> Result<Empty> {
    if let Some(session_id) = ctx.auth.session_id {
        ctx.services().accounts.logout(ctx.tx(), session_id)?;
    }
    ctx.scope.clear_session();
    Ok(Empty {})
}

async fn who_am_i(ctx: Authenticated, _: Empty) -> Result<UserInfo> {
    Ok(UserInfo {
        user_id: ctx.auth.user_id,
        username: ctx.auth.username.clone(),
        roles: ctx.auth.roles.roles(),
    })
}

async fn add_token(ctx: Authenticated, _: Empty) -> Result<TokenInfo> {
    let (authentication_id, token) = ctx
        .services()
        .accounts
        .add_token_credential(ctx.tx(), &ctx.auth)?;
    Ok(TokenInfo {
        authentication_id,
        token,
    })
}

async fn change_password(ctx: Authenticated, body: PasswordChange) -> Result<Empty> {
    ctx.services().accounts.change_password(
        ctx.tx(),
        &ctx.auth,
        &body.old_password,
        &body.new_password,
    )?;
    Ok(Empty {})
}

// Files

async fn get_root(ctx: FileScoped, _: Empty) -> Result<FileInfo> {
    Ok(FileInfo::from(&ctx.unlocked.file))
}

async fn get_file(ctx: FileScoped, _: FileRef) -> Result<FileInfo> {
    Ok(FileInfo::from(&ctx.unlocked.file))
}

async fn list_children(ctx: FileScoped, _: FileRef) -> Result<Vec<FileInfo>> {
    let children = ctx
        .services()
        .tree
        .list_children(Some(ctx.tx()), ctx.unlocked.file.id, &ctx.auth)?;
    Ok(file_infos(&children))
}

async fn create(ctx: Authenticated, body: NewFile, kind: FileKind) -> Result<FileInfo> {
    let file = ctx
        .services()
        .tree
        .create(ctx.tx(), body.parent_id, &body.name, kind, &ctx.auth)?;
    Ok(FileInfo::from(&file))
}

async fn create_file(ctx: Authenticated, body: NewFile) -> Result<FileInfo> {
    create(ctx, body, FileKind::File).await
}

async fn create_folder(ctx: Authenticated, body: NewFile) -> Result<FileInfo> {
    create(ctx, body, FileKind::Folder).await
}

async fn rename(ctx: Authenticated, body: RenameFile) -> Result<FileInfo> {
    let file = ctx
        .services()
        .tree
        .rename(ctx.tx(), body.file_id, &body.name, &ctx.auth)?;
    Ok(FileInfo::from(&file))
}

async fn move_file(ctx: Authenticated, body: MoveFile) -> Result<FileInfo> {
    let file = ctx
        .services()
        .tree
        .move_file(ctx.tx(), body.file_id, body.new_parent_id, &ctx.auth)?;
    Ok(FileInfo::from(&file))
}

async fn trash(ctx: Authenticated, body: FileRef) -> Result<Empty> {
    ctx.services().tree.trash(ctx.tx(), required(&body)?, &ctx.auth)?;
    Ok(Empty {})
}

async fn untrash(ctx: Authenticated, body: FileRef) -> Result<FileInfo> {
    let file = ctx
        .services()
        .tree
        .untrash(ctx.tx(), required(&body)?, &ctx.auth)?;
    Ok(FileInfo::from(&file))
}

async fn purge(ctx: Authenticated, body: FileRef) -> Result<Count> {
    let count = ctx.services().tree.purge(ctx.tx(), required(&body)?, &ctx.auth)?;
    Ok(Count { count })
}

async fn list_trash(ctx: Authenticated, _: Empty) -> Result<Vec<FileInfo>> {
    Ok(file_infos(&ctx.services().tree.list_trash(Some(ctx.tx()), &ctx.auth)))
}

async fn search(ctx: Authenticated, body: SearchFiles) -> Result<Vec<FileInfo>> {
    Ok(file_infos(
        &ctx.services().tree.search(Some(ctx.tx()), &ctx.auth, &body.text),
    ))
}

async fn file_path(ctx: Authenticated, body: FileRef) -> Result<PathInfo> {
    let path = ctx
        .services()
        .tree
        .file_path(Some(ctx.tx()), required(&body)?, &ctx.auth)?;
    Ok(PathInfo { path })
}

async fn file_history(ctx: Authenticated, body: FileRef) -> Result<Vec<FileInfo>> {
    let versions = ctx
        .services()
        .tree
        .file_history(Some(ctx.tx()), required(&body)?, &ctx.auth)?;
    Ok(file_infos(&versions))
}

// Access

async fn grant(ctx: Authenticated, body: GrantAccess) -> Result<Option<GrantInfo>> {
    let target = ctx
        .services()
        .accounts
        .find_user(Some(ctx.tx()), &body.username)
        .ok_or_else(|| StrongboxError::not_found(format!("no user '{}'", body.username)))?;
    let grant = ctx
        .services()
        .tree
        .vault()
        .grant(ctx.tx(), body.file_id, target.id, body.level, &ctx.auth)?;
    Ok(grant.as_ref().map(GrantInfo::from))
}

async fn list_grants(ctx: FileScoped, _: FileRef) -> Result<Vec<GrantInfo>> {
    let grants = ctx
        .services()
        .tree
        .vault()
        .list_grants(Some(ctx.tx()), ctx.unlocked.file.id);
    Ok(grants.iter().map(GrantInfo::from).collect())
}

// Contents

async fn list_contents(ctx: FileScoped, _: FileRef) -> Result<Vec<ContentInfo>> {
    let contents = ctx
        .services()
        .tree
        .list_contents(Some(ctx.tx()), ctx.unlocked.file.id);
    Ok(contents.iter().map(ContentInfo::from).collect())
}

async fn list_snapshots(ctx: FileScoped, body: SnapshotQuery) -> Result<Vec<SnapshotInfo>> {
    let tree = &ctx.services().tree;
    let tx = Some(ctx.tx());
    let content = match body.content_id {
        Some(content_id) => ctx.services().storage.contents.get(tx, content_id)?,
        None => match tree.find_main_content(tx, ctx.unlocked.file.id) {
            Some(content) => content,
            None => return Ok(Vec::new()),
        },
    };
    if content.file_id != ctx.unlocked.file.id {
        return Err(StrongboxError::invalid(format!(
            "content {} belongs to another file",
            content.id
        )));
    }
    Ok(tree
        .list_snapshots(tx, content.id)
        .iter()
        .map(SnapshotInfo::from)
        .collect())
}

async fn scan(ctx: FileScoped, _: FileRef) -> Result<ScanResult> {
    let threats = ctx.services().analyzer.scan(ctx.tx(), &ctx.unlocked).await?;
    Ok(ScanResult { threats })
}

async fn sniff_mime(ctx: FileScoped, _: FileRef) -> Result<MimeResult> {
    let mime = ctx
        .services()
        .analyzer
        .sniff_mime(ctx.tx(), &ctx.unlocked)
        .await?;
    Ok(MimeResult { mime })
}

async fn generate_thumbnail(ctx: FileScoped, _: FileRef) -> Result<ThumbnailResult> {
    let content_id = ctx
        .services()
        .analyzer
        .generate_thumbnail(ctx.tx(), &ctx.unlocked, ctx.auth.user_id)
        .await?;
    Ok(ThumbnailResult { content_id })
}

// Streams

/// Open a stream on `unlocked`'s main content. It joins this connection's
/// registry once the request's transaction commits.
async fn start_stream(ctx: &Authenticated, unlocked: Unlocked, new_file: bool) -> Result<StreamInfo> {
    let tree = &ctx.services().tree;
    let content = tree.get_main_content(ctx.tx(), &unlocked.file)?;
    let snapshot_id = tree.latest_snapshot(Some(ctx.tx()), content.id).map(|s| s.id);
    let handle = ctx.services().streams.open(
        OpenStream {
            unlocked,
            content,
            snapshot_id,
            auth: ctx.auth.clone(),
            new_file,
        },
        ctx.scope.lifetime.child(),
    );
    let info = handle.info().await?;
    let scope = ctx.scope.clone();
    ctx.after_commit(move || {
        scope.streams.insert(handle);
    });
    Ok(info)
}

async fn open_stream(ctx: FileScoped, body: OpenFileStream) -> Result<StreamInfo> {
    let mut unlocked = ctx.unlocked.clone();
    if body.write {
        if unlocked.level < AccessLevel::ReadWrite {
            return Err(StrongboxError::forbidden(format!(
                "write access to {} required",
                unlocked.file.id
            )));
        }
    } else {
        unlocked.level = unlocked.level.min(AccessLevel::Read);
    }
    start_stream(&ctx, unlocked, false).await
}

async fn create_file_stream(ctx: Authenticated, body: NewFile) -> Result<StreamInfo> {
    let tree = &ctx.services().tree;
    let file = tree.create(ctx.tx(), body.parent_id, &body.name, FileKind::File, &ctx.auth)?;
    let unlocked = tree.open(Some(ctx.tx()), file.id, &ctx.auth, AccessLevel::ReadWrite)?;
    start_stream(&ctx, unlocked, true).await
}

async fn stream_read(ctx: StreamScoped, body: StreamReadRequest) -> Result<StreamData> {
    let data = ctx.handle.read(body.count).await?;
    Ok(StreamData { data })
}

async fn stream_write(ctx: StreamScoped, body: StreamWriteRequest) -> Result<StreamInfo> {
    ctx.handle.write(body.data).await
}

async fn stream_seek(ctx: StreamScoped, body: StreamSeekRequest) -> Result<StreamInfo> {
    ctx.handle.seek(body.position).await
}

async fn stream_truncate(ctx: StreamScoped, body: StreamTruncateRequest) -> Result<StreamInfo> {
    ctx.handle.truncate(body.length).await
}

async fn stream_info(ctx: StreamScoped, _: HandleRef) -> Result<StreamInfo> {
    ctx.handle.info().await
}

async fn stream_close(ctx: StreamScoped, body: HandleRef) -> Result<StreamInfo> {
    ctx.scope.streams.remove(body.handle_id);
    ctx.handle.close().await
}

// Administration

async fn admin_list_users(ctx: AdminScoped, _: Empty) -> Result<Vec<UserInfo>> {
    let users = ctx.services().accounts.list_users(Some(ctx.tx()));
    Ok(users.iter().map(UserInfo::from).collect())
}

async fn admin_set_roles(ctx: AdminScoped, body: SetRoles) -> Result<UserInfo> {
    let roles = RoleSet::of(&body.roles);
    if body.user_id == ctx.admin.user_id && !roles.contains(Role::Admin) {
        return Err(StrongboxError::invalid("admins cannot remove their own admin role"));
    }
    let user = ctx
        .services()
        .accounts
        .set_roles(ctx.tx(), body.user_id, roles)?;
    info!(admin = ctx.admin.user_id, user = body.user_id, "roles updated by admin");
    Ok(UserInfo::from(&user))
}

async fn admin_revoke_sessions(ctx: AdminScoped, body: UserTarget) -> Result<Count> {
    let count = ctx
        .services()
        .accounts
        .revoke_sessions(ctx.tx(), body.user_id)?;
    info!(admin = ctx.admin.user_id, user = body.user_id, count, "sessions revoked by admin");
    Ok(Count { count })
}
