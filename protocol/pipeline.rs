//! Dispatch stages.
//!
//! Each stage wraps an inner handler and hands it a richer context:
//!
//! ```text
//! typed -> transacted -> authenticated -> file_scoped | admin_scoped
//! typed -> stream_scoped
//! ```
//!
//! Stages are plain functions returning closures, so a handler's
//! authorization is visible at the point where it is registered.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

use super::codes::{Call, Handler};
use crate::auth::UserAuth;
use crate::error::{Result, StrongboxError};
use crate::lifetime::Lifetime;
use crate::model::{b64, AccessLevel, FileId, FileKind, RoleSet, UserId};
use crate::service::Services;
use crate::store::{ResourceId, Transaction};
use crate::stream::{HandleId, StreamHandle, StreamRegistry};
use crate::vault::Unlocked;

/// What a client presents to act as a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub session_id: ResourceId,
    #[serde(with = "b64")]
    pub session_key: Vec<u8>,
}

/// State shared by every request on one connection.
pub struct Scope {
    pub services: Arc<Services>,
    pub streams: StreamRegistry,
    /// The connection's lifetime; stream actors hang off it.
    pub lifetime: Lifetime,
    session: Mutex<Option<SessionCredentials>>,
}

impl Scope {
    pub fn new(services: Arc<Services>, lifetime: Lifetime) -> Self {
        Self {
            services,
            streams: StreamRegistry::new(),
            lifetime,
            session: Mutex::new(None),
        }
    }

    pub fn session(&self) -> Option<SessionCredentials> {
        self.session.lock().clone()
    }

    pub fn bind_session(&self, credentials: SessionCredentials) {
        *self.session.lock() = Some(credentials);
    }

    pub fn clear_session(&self) {
        self.session.lock().take();
    }
}

#[derive(Clone)]
pub struct Request {
    pub scope: Arc<Scope>,
    pub lifetime: Lifetime,
    pub id: u64,
}

impl Request {
    pub fn services(&self) -> &Services {
        &self.scope.services
    }
}

type CommitHook = Box<dyn FnOnce() + Send>;

pub struct Transacted {
    request: Request,
    tx: Arc<Transaction>,
    committed: Arc<Mutex<Vec<CommitHook>>>,
}

impl Transacted {
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    /// Run `hook` once the transaction has committed. Dropped unrun when
    /// the handler fails.
    pub fn after_commit(&self, hook: impl FnOnce() + Send + 'static) {
        self.committed.lock().push(Box::new(hook));
    }
}

impl Deref for Transacted {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.request
    }
}

/// Proof that the caller holds the admin role.
#[derive(Debug, Clone, Copy)]
pub struct AdminCapability {
    pub user_id: UserId,
}

pub struct Authenticated {
    base: Transacted,
    pub auth: UserAuth,
    pub admin: Option<AdminCapability>,
}

impl Deref for Authenticated {
    type Target = Transacted;

    fn deref(&self) -> &Transacted {
        &self.base
    }
}

pub struct FileScoped {
    base: Authenticated,
    pub unlocked: Unlocked,
}

impl Deref for FileScoped {
    type Target = Authenticated;

    fn deref(&self) -> &Authenticated {
        &self.base
    }
}

pub struct AdminScoped {
    base: Authenticated,
    pub admin: AdminCapability,
}

impl Deref for AdminScoped {
    type Target = Authenticated;

    fn deref(&self) -> &Authenticated {
        &self.base
    }
}

pub struct StreamScoped {
    request: Request,
    pub handle: StreamHandle,
}

impl Deref for StreamScoped {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.request
    }
}

/// Roles a caller must hold (any of `include`, when non-empty) and must not
/// hold (any of `exclude`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy {
    pub include: RoleSet,
    pub exclude: RoleSet,
}

impl RolePolicy {
    pub const ANY: RolePolicy = RolePolicy {
        include: RoleSet::EMPTY,
        exclude: RoleSet::EMPTY,
    };

    pub fn require(include: RoleSet) -> Self {
        Self {
            include,
            exclude: RoleSet::EMPTY,
        }
    }

    pub fn deny(exclude: RoleSet) -> Self {
        Self {
            include: RoleSet::EMPTY,
            exclude,
        }
    }

    pub fn check(&self, roles: RoleSet) -> Result<()> {
        if !self.include.is_empty() && !roles.intersects(self.include) {
            return Err(StrongboxError::forbidden("missing a required role"));
        }
        if roles.intersects(self.exclude) {
            return Err(StrongboxError::forbidden("role not allowed here"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileRequirement {
    pub kind: Option<FileKind>,
    pub level: AccessLevel,
    pub allow_deleted: bool,
}

impl FileRequirement {
    pub fn any(level: AccessLevel) -> Self {
        Self {
            kind: None,
            level,
            allow_deleted: false,
        }
    }

    pub fn file(level: AccessLevel) -> Self {
        Self {
            kind: Some(FileKind::File),
            ..Self::any(level)
        }
    }

    pub fn folder(level: AccessLevel) -> Self {
        Self {
            kind: Some(FileKind::Folder),
            ..Self::any(level)
        }
    }

    pub fn including_trash(mut self) -> Self {
        self.allow_deleted = true;
        self
    }
}

/// Requests aimed at one file; `None` means the caller's root.
pub trait FileTarget {
    fn file_id(&self) -> Option<FileId>;
}

/// Requests aimed at one open stream.
pub trait StreamTarget {
    fn handle_id(&self) -> HandleId;
}

/// Deserialize the request body, serialize the response.
pub fn typed<Req, Resp, F, Fut>(scope: &Arc<Scope>, handler: F) -> Handler
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Request, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let scope = scope.clone();
    Arc::new(move |call: Call| -> BoxFuture<'static, Result<serde_json::Value>> {
        let parsed = serde_json::from_value::<Req>(call.data)
            .map_err(|e| StrongboxError::invalid(format!("malformed request: {}", e)));
        let request = Request {
            scope: scope.clone(),
            lifetime: call.lifetime,
            id: call.id,
        };
        let pending = parsed.map(|body| handler(request, body));
        async move {
            let response = pending?.await?;
            Ok(serde_json::to_value(response)?)
        }
        .boxed()
    })
}

/// Run the handler inside one store transaction, committed only when it
/// succeeds.
pub fn transacted<Req, Resp, F, Fut>(
    handler: F,
) -> impl Fn(Request, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync + 'static
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Transacted, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let handler = Arc::new(handler);
    move |request: Request, body: Req| -> BoxFuture<'static, Result<Resp>> {
        let handler = handler.clone();
        async move {
            let tx = Arc::new(request.services().storage.db.begin(&request.lifetime).await?);
            let committed = Arc::new(Mutex::new(Vec::new()));
            let response = handler(
                Transacted {
                    request,
                    tx: tx.clone(),
                    committed: committed.clone(),
                },
                body,
            )
            .await?;
            let tx = Arc::try_unwrap(tx)
                .map_err(|_| StrongboxError::internal("transaction outlived its handler"))?;
            tx.commit();
            let hooks = std::mem::take(&mut *committed.lock());
            for hook in hooks {
                hook();
            }
            Ok(response)
        }
        .boxed()
    }
}

/// Resolve the connection's session and enforce `policy`.
pub fn authenticated<Req, Resp, F, Fut>(
    policy: RolePolicy,
    handler: F,
) -> impl Fn(Transacted, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync + 'static
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Authenticated, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let handler = Arc::new(handler);
    move |ctx: Transacted, body: Req| -> BoxFuture<'static, Result<Resp>> {
        let handler = handler.clone();
        async move {
            let credentials = ctx
                .scope
                .session()
                .ok_or_else(|| StrongboxError::unauthorized("no session on this connection"))?;
            let auth = ctx.services().accounts.resolve_session(
                ctx.tx(),
                credentials.session_id,
                &credentials.session_key,
            )?;
            policy.check(auth.roles)?;
            let admin = auth.is_admin().then_some(AdminCapability {
                user_id: auth.user_id,
            });
            handler(
                Authenticated {
                    base: ctx,
                    auth,
                    admin,
                },
                body,
            )
            .await
        }
        .boxed()
    }
}

/// Unlock the target file at the required level.
pub fn file_scoped<Req, Resp, F, Fut>(
    requirement: FileRequirement,
    handler: F,
) -> impl Fn(Authenticated, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync + 'static
where
    Req: FileTarget + Send + 'static,
    Resp: Send + 'static,
    F: Fn(FileScoped, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let handler = Arc::new(handler);
    move |ctx: Authenticated, body: Req| -> BoxFuture<'static, Result<Resp>> {
        let handler = handler.clone();
        async move {
            let tree = &ctx.services().tree;
            let file_id = match body.file_id() {
                Some(id) => id,
                None => tree.root_of(Some(ctx.tx()), ctx.auth.user_id)?.id,
            };
            let unlocked = if requirement.allow_deleted {
                tree.vault()
                    .unlock(Some(ctx.tx()), file_id, &ctx.auth, requirement.level)?
            } else {
                tree.open(Some(ctx.tx()), file_id, &ctx.auth, requirement.level)?
            };
            if let Some(kind) = requirement.kind {
                if unlocked.file.kind != kind {
                    return Err(StrongboxError::invalid(format!("{} is not a {}", file_id, kind)));
                }
            }
            handler(FileScoped { base: ctx, unlocked }, body).await
        }
        .boxed()
    }
}

/// Require the admin capability.
pub fn admin_scoped<Req, Resp, F, Fut>(
    handler: F,
) -> impl Fn(Authenticated, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync + 'static
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(AdminScoped, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let handler = Arc::new(handler);
    move |ctx: Authenticated, body: Req| -> BoxFuture<'static, Result<Resp>> {
        let handler = handler.clone();
        async move {
            let Some(admin) = ctx.admin else {
                debug!(user = ctx.auth.user_id, "admin request refused");
                return Err(StrongboxError::forbidden("admin role required"));
            };
            handler(AdminScoped { base: ctx, admin }, body).await
        }
        .boxed()
    }
}

/// The session a handle was opened under must still be bound to this
/// connection and still be live. A handle that fails the check is closed.
async fn check_stream_session(request: &Request, handle: &StreamHandle) -> Result<()> {
    let accounts = &request.services().accounts;
    let bound = request.scope.session().map(|c| c.session_id);
    let checked = match handle.session_id() {
        Some(session_id) if bound == Some(session_id) => accounts.check_session(None, session_id).ok(),
        _ => None,
    };
    if let (Some(due), Some(session_id)) = (checked, handle.session_id()) {
        if due {
            let tx = request.services().storage.db.begin(&request.lifetime).await?;
            accounts.touch_session(&tx, session_id)?;
            tx.commit();
        }
        return Ok(());
    }
    debug!(handle = handle.id(), session = ?handle.session_id(), "stream session ended");
    if request.scope.streams.remove(handle.id()).is_some() {
        if let Err(e) = handle.close().await {
            debug!(handle = handle.id(), error = %e, "stream already stopped");
        }
    }
    Err(StrongboxError::unauthorized("the stream's session has ended"))
}

/// Look up a handle opened on this connection and re-check its session.
pub fn stream_scoped<Req, Resp, F, Fut>(
    handler: F,
) -> impl Fn(Request, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync + 'static
where
    Req: StreamTarget + Send + 'static,
    Resp: Send + 'static,
    F: Fn(StreamScoped, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let handler = Arc::new(handler);
    move |request: Request, body: Req| -> BoxFuture<'static, Result<Resp>> {
        let handler = handler.clone();
        async move {
            let handle = request.scope.streams.get(body.handle_id())?;
            check_stream_session(&request, &handle).await?;
            handler(StreamScoped { request, handle }, body).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::model::Role;
    use crate::storage::Storage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn commit_hooks_run_only_after_a_commit() {
        let services = Arc::new(Services::new(
            Config::in_memory(),
            Storage::in_memory(),
            Collaborators::default(),
        ));
        let scope = Arc::new(Scope::new(services, Lifetime::new()));
        let request = |id| Request {
            scope: scope.clone(),
            lifetime: Lifetime::new(),
            id,
        };
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let handler = transacted(move |ctx: Transacted, fail: bool| {
            let counter = counter.clone();
            async move {
                let hook = counter.clone();
                ctx.after_commit(move || {
                    hook.fetch_add(1, Ordering::SeqCst);
                });
                assert_eq!(counter.load(Ordering::SeqCst), 0, "hook ran before commit");
                if fail {
                    return Err(StrongboxError::invalid("rolled back"));
                }
                Ok(())
            }
        });

        let err = handler(request(1), true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        handler(request(2), false).await.expect("commit");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn role_policy_include_and_exclude() {
        let member = RoleSet::of(&[Role::Member]);
        let guest = RoleSet::of(&[Role::Guest]);

        assert!(RolePolicy::ANY.check(RoleSet::EMPTY).is_ok());
        assert!(RolePolicy::require(member).check(member).is_ok());
        assert_eq!(
            RolePolicy::require(member).check(guest).unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            RolePolicy::deny(guest).check(guest.with(Role::Member)).unwrap_err().kind(),
            ErrorKind::Forbidden
        );
    }

    #[test]
    fn file_requirements_compose() {
        let requirement = FileRequirement::file(AccessLevel::Manage).including_trash();
        assert_eq!(requirement.kind, Some(FileKind::File));
        assert_eq!(requirement.level, AccessLevel::Manage);
        assert!(requirement.allow_deleted);
    }
}
