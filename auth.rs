//! Users, credentials and sessions.
//!
//! Every user owns an X25519 key pair. The private key is never stored in
//! the clear: each [`UserAuthentication`] row holds it wrapped under a key
//! derived from one credential (Argon2id for passwords, HKDF for tokens),
//! and each [`UserSession`] holds it wrapped under a fresh session key that
//! only the client keeps. Presenting `(session_id, session_key)` is what
//! lets later requests act as the user.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, StrongboxError};
use crate::keys::{
    self, derive_password_key, derive_token_key, random_salt, random_token, KdfParams, KeyError,
    KeyPair, SymmetricKey,
};
use crate::model::{CredentialKind, RoleSet, User, UserAuthentication, UserId, UserSession};
use crate::storage::Storage;
use crate::store::{Query, ResourceId, Stored, Transaction};
use crate::tree;

/// An authenticated caller: who they are, plus their opened private key.
#[derive(Clone)]
pub struct UserAuth {
    pub user_id: UserId,
    pub username: String,
    pub roles: RoleSet,
    pub authentication_id: ResourceId,
    pub session_id: Option<ResourceId>,
    key_pair: Arc<KeyPair>,
}

impl std::fmt::Debug for UserAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAuth")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("roles", &self.roles)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl UserAuth {
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(crate::model::Role::Admin)
    }
}

/// Credentials handed back to the client after a successful login.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session_id: ResourceId,
    pub session_key: Vec<u8>,
    pub user_id: UserId,
    pub expire_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub idle: Duration,
    pub max_age: Duration,
}

impl SessionPolicy {
    /// How far `last_active` may lag before a request writes it again.
    pub fn refresh_step(&self) -> Duration {
        (self.idle / 4).min(Duration::seconds(60))
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle: Duration::minutes(30),
            max_age: Duration::days(7),
        }
    }
}

fn private_key_aad(user_id: UserId) -> Vec<u8> {
    let mut aad = b"strongbox/private-key/".to_vec();
    aad.extend_from_slice(&user_id.to_le_bytes());
    aad
}

/// Key errors while opening a credential mean the caller got it wrong.
fn credential_error(err: KeyError) -> StrongboxError {
    match err {
        KeyError::TagMismatch => StrongboxError::unauthorized("invalid credentials"),
        other => StrongboxError::internal(format!("credential key failure: {}", other)),
    }
}

fn key_fault(err: KeyError) -> StrongboxError {
    StrongboxError::internal(format!("key wrapping failed: {}", err))
}

#[derive(Clone)]
pub struct Accounts {
    storage: Storage,
    kdf: KdfParams,
    policy: SessionPolicy,
}

impl Accounts {
    pub fn new(storage: Storage, kdf: KdfParams, policy: SessionPolicy) -> Self {
        Self {
            storage,
            kdf,
            policy,
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn find_user(&self, tx: Option<&Transaction>, username: &str) -> Option<Stored<User>> {
        let wanted = username.trim().to_lowercase();
        self.storage
            .users
            .first(tx, &Query::new().filter(move |u: &User| u.username.to_lowercase() == wanted))
    }

    /// Create a user, their password credential and their root folder.
    pub fn register_user(
        &self,
        tx: &Transaction,
        username: &str,
        password: &str,
        roles: RoleSet,
    ) -> Result<UserAuth> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StrongboxError::invalid("username cannot be empty"));
        }
        if password.is_empty() {
            return Err(StrongboxError::invalid("password cannot be empty"));
        }
        if self.find_user(Some(tx), username).is_some() {
            return Err(StrongboxError::conflict(format!("username '{}' is taken", username)));
        }

        let key_pair = KeyPair::generate();
        let user = self.storage.users.insert(
            tx,
            User {
                username: username.to_string(),
                public_key: key_pair.public_bytes(),
                roles,
            },
        )?;

        let salt = random_salt();
        let wrapping = derive_password_key(password.as_bytes(), &salt, self.kdf).map_err(key_fault)?;
        let credential = self.storage.authentications.insert(
            tx,
            UserAuthentication {
                user_id: user.id,
                kind: CredentialKind::Password,
                salt,
                kdf: Some(self.kdf),
                encrypted_private_key: keys::wrap_bytes(
                    &wrapping,
                    &key_pair.secret_bytes(),
                    &private_key_aad(user.id),
                )
                .map_err(key_fault)?,
                public_key: key_pair.public_bytes(),
            },
        )?;

        let root = tree::new_root(user.id, &key_pair.public_bytes())?;
        let root = self.storage.files.insert(tx, root)?;

        info!(user = user.id, username, root = root.id, "user registered");
        Ok(UserAuth {
            user_id: user.id,
            username: username.to_string(),
            roles,
            authentication_id: credential.id,
            session_id: None,
            key_pair: Arc::new(key_pair),
        })
    }

    /// Add a token credential; the returned token is shown once.
    pub fn add_token_credential(&self, tx: &Transaction, auth: &UserAuth) -> Result<(ResourceId, Vec<u8>)> {
        let token = random_token();
        let salt = random_salt();
        let wrapping = derive_token_key(&token, &salt).map_err(key_fault)?;
        let credential = self.storage.authentications.insert(
            tx,
            UserAuthentication {
                user_id: auth.user_id,
                kind: CredentialKind::Token,
                salt,
                kdf: None,
                encrypted_private_key: keys::wrap_bytes(
                    &wrapping,
                    &auth.key_pair.secret_bytes(),
                    &private_key_aad(auth.user_id),
                )
                .map_err(key_fault)?,
                public_key: auth.key_pair.public_bytes(),
            },
        )?;
        info!(user = auth.user_id, credential = credential.id, "token credential added");
        Ok((credential.id, token))
    }

    pub fn login(&self, tx: &Transaction, username: &str, password: &str) -> Result<SessionGrant> {
        let (user, credential, key_pair) =
            self.open_credential(tx, username, CredentialKind::Password, |credential| {
                derive_password_key(
                    password.as_bytes(),
                    &credential.salt,
                    credential.kdf.unwrap_or_default(),
                )
            })?;
        self.start_session(tx, &user, credential, &key_pair)
    }

    pub fn login_with_token(&self, tx: &Transaction, username: &str, token: &[u8]) -> Result<SessionGrant> {
        let (user, credential, key_pair) =
            self.open_credential(tx, username, CredentialKind::Token, |credential| {
                derive_token_key(token, &credential.salt)
            })?;
        self.start_session(tx, &user, credential, &key_pair)
    }

    fn open_credential(
        &self,
        tx: &Transaction,
        username: &str,
        kind: CredentialKind,
        derive: impl Fn(&UserAuthentication) -> std::result::Result<SymmetricKey, KeyError>,
    ) -> Result<(Stored<User>, ResourceId, KeyPair)> {
        let user = self.find_user(Some(tx), username).ok_or_else(|| {
            debug!(username, "login for unknown user");
            StrongboxError::unauthorized("invalid credentials")
        })?;
        let credentials = self.storage.authentications.query(
            Some(tx),
            &Query::new()
                .partition(user.id)
                .filter(move |c: &UserAuthentication| c.kind == kind),
        );

        for credential in credentials {
            let wrapping = derive(&credential).map_err(key_fault)?;
            match keys::unwrap_bytes(&wrapping, &credential.encrypted_private_key, &private_key_aad(user.id)) {
                Ok(secret) => {
                    let key_pair = KeyPair::from_secret_bytes(&secret).map_err(key_fault)?;
                    return Ok((user, credential.id, key_pair));
                }
                Err(KeyError::TagMismatch) => continue,
                Err(other) => return Err(credential_error(other)),
            }
        }
        warn!(user = user.id, kind = ?kind, "login rejected");
        Err(StrongboxError::unauthorized("invalid credentials"))
    }

    fn start_session(
        &self,
        tx: &Transaction,
        user: &Stored<User>,
        credential: ResourceId,
        key_pair: &KeyPair,
    ) -> Result<SessionGrant> {
        let session_key = SymmetricKey::generate();
        let now = Utc::now();
        self.purge_expired_sessions(tx, user.id, now)?;
        let expire_time = now + self.policy.max_age;
        let session = self.storage.sessions.insert(
            tx,
            UserSession {
                user_id: user.id,
                origin_authentication_id: credential,
                expire_time,
                last_active: now,
                wrapped_private_key: keys::wrap_bytes(
                    &session_key,
                    &key_pair.secret_bytes(),
                    &private_key_aad(user.id),
                )
                .map_err(key_fault)?,
            },
        )?;
        info!(user = user.id, session = session.id, "session started");
        Ok(SessionGrant {
            session_id: session.id,
            session_key: session_key.as_bytes().to_vec(),
            user_id: user.id,
            expire_time,
        })
    }

    /// Drop a user's sessions that are past their absolute expiry. Idle
    /// sessions stay until they expire.
    fn purge_expired_sessions(&self, tx: &Transaction, user_id: UserId, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.storage.sessions.query(
            Some(tx),
            &Query::new()
                .partition(user_id)
                .filter(move |s: &UserSession| now >= s.expire_time),
        );
        for session in &expired {
            self.storage.sessions.purge(tx, session.id)?;
        }
        if !expired.is_empty() {
            debug!(user = user_id, purged = expired.len(), "expired sessions removed");
        }
        Ok(expired.len())
    }

    fn live_session(
        &self,
        tx: Option<&Transaction>,
        session_id: ResourceId,
        now: DateTime<Utc>,
    ) -> Result<Stored<UserSession>> {
        let rejected = || StrongboxError::unauthorized("session is not valid");
        let session = self.storage.sessions.get(tx, session_id).map_err(|_| rejected())?;
        if now >= session.expire_time {
            debug!(session = session_id, "session past its expiry");
            return Err(rejected());
        }
        if now - session.last_active > self.policy.idle {
            debug!(session = session_id, last_active = %session.last_active, "session idle too long");
            return Err(rejected());
        }
        Ok(session)
    }

    /// Fail unless a session still exists and is neither expired nor idle.
    /// Returns whether its idle clock is due for [`Accounts::touch_session`].
    pub fn check_session(&self, tx: Option<&Transaction>, session_id: ResourceId) -> Result<bool> {
        let now = Utc::now();
        let session = self.live_session(tx, session_id, now)?;
        Ok(now - session.last_active >= self.policy.refresh_step())
    }

    pub fn touch_session(&self, tx: &Transaction, session_id: ResourceId) -> Result<()> {
        let now = Utc::now();
        self.storage
            .sessions
            .update(tx, session_id, None, |s| s.last_active = now)?;
        Ok(())
    }

    /// Check a session, refresh its idle clock and open the user's key.
    pub fn resolve_session(
        &self,
        tx: &Transaction,
        session_id: ResourceId,
        session_key: &[u8],
    ) -> Result<UserAuth> {
        let rejected = || StrongboxError::unauthorized("session is not valid");
        let now = Utc::now();
        let session = self.live_session(Some(tx), session_id, now)?;

        let session_key = SymmetricKey::from_slice(session_key).map_err(|_| rejected())?;
        let secret = keys::unwrap_bytes(
            &session_key,
            &session.wrapped_private_key,
            &private_key_aad(session.user_id),
        )
        .map_err(credential_error)?;
        let key_pair = KeyPair::from_secret_bytes(&secret).map_err(key_fault)?;

        let user = self.storage.users.get(Some(tx), session.user_id).map_err(|_| rejected())?;
        if now - session.last_active >= self.policy.refresh_step() {
            self.touch_session(tx, session_id)?;
        }

        Ok(UserAuth {
            user_id: user.id,
            username: user.username.clone(),
            roles: user.roles,
            authentication_id: session.origin_authentication_id,
            session_id: Some(session_id),
            key_pair: Arc::new(key_pair),
        })
    }

    pub fn logout(&self, tx: &Transaction, session_id: ResourceId) -> Result<()> {
        self.storage.sessions.purge(tx, session_id)?;
        info!(session = session_id, "session ended");
        Ok(())
    }

    pub fn change_password(&self, tx: &Transaction, auth: &UserAuth, old: &str, new: &str) -> Result<()> {
        if new.is_empty() {
            return Err(StrongboxError::invalid("password cannot be empty"));
        }
        let credentials = self.storage.authentications.query(
            Some(tx),
            &Query::new()
                .partition(auth.user_id)
                .filter(|c: &UserAuthentication| c.kind == CredentialKind::Password),
        );
        let aad = private_key_aad(auth.user_id);
        let current = credentials
            .into_iter()
            .find(|credential| {
                derive_password_key(old.as_bytes(), &credential.salt, credential.kdf.unwrap_or_default())
                    .and_then(|key| keys::unwrap_bytes(&key, &credential.encrypted_private_key, &aad))
                    .is_ok()
            })
            .ok_or_else(|| StrongboxError::unauthorized("invalid credentials"))?;

        let salt = random_salt();
        let wrapping = derive_password_key(new.as_bytes(), &salt, self.kdf).map_err(key_fault)?;
        let wrapped = keys::wrap_bytes(&wrapping, &auth.key_pair.secret_bytes(), &aad).map_err(key_fault)?;
        let kdf = self.kdf;
        self.storage
            .authentications
            .update(tx, current.id, Some(current.data_id), move |c| {
                c.salt = salt;
                c.kdf = Some(kdf);
                c.encrypted_private_key = wrapped;
            })?;
        info!(user = auth.user_id, credential = current.id, "password changed");
        Ok(())
    }

    pub fn list_users(&self, tx: Option<&Transaction>) -> Vec<Stored<User>> {
        self.storage.users.query(tx, &Query::new())
    }

    pub fn set_roles(&self, tx: &Transaction, user_id: UserId, roles: RoleSet) -> Result<Stored<User>> {
        let user = self.storage.users.update(tx, user_id, None, |u| u.roles = roles)?;
        info!(user = user_id, roles = ?roles.roles(), "roles changed");
        Ok(user)
    }

    /// End every session of `user_id`; returns how many were ended.
    pub fn revoke_sessions(&self, tx: &Transaction, user_id: UserId) -> Result<usize> {
        let sessions = self
            .storage
            .sessions
            .query(Some(tx), &Query::new().partition(user_id));
        for session in &sessions {
            self.storage.sessions.purge(tx, session.id)?;
        }
        info!(user = user_id, count = sessions.len(), "sessions revoked");
        Ok(sessions.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::lifetime::Lifetime;
    use crate::model::Role;

    pub(crate) fn cheap_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
        }
    }

    fn accounts(policy: SessionPolicy) -> (Storage, Accounts) {
        let storage = Storage::in_memory();
        let accounts = Accounts::new(storage.clone(), cheap_kdf(), policy);
        (storage, accounts)
    }

    #[tokio::test]
    async fn register_creates_user_credential_and_root() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let auth = accounts
            .register_user(&tx, "ada", "hunter2", RoleSet::of(&[Role::Member]))
            .expect("register");
        tx.commit();

        let user = storage.users.get(None, auth.user_id).expect("user");
        assert_eq!(user.public_key, auth.key_pair().public_bytes());
        let owner = auth.user_id;
        let roots = storage.files.query(
            None,
            &Query::new().filter(move |f: &crate::model::File| f.owner_user_id == owner && f.is_root()),
        );
        assert_eq!(roots.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_username_conflicts_case_insensitively() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        accounts.register_user(&tx, "Ada", "pw", RoleSet::EMPTY).expect("register");
        let err = accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn login_then_resolve_opens_the_same_key() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let registered = accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let grant = accounts.login(&tx, "ada", "pw").expect("login");
        let resolved = accounts
            .resolve_session(&tx, grant.session_id, &grant.session_key)
            .expect("resolve");
        assert_eq!(resolved.user_id, registered.user_id);
        assert_eq!(
            resolved.key_pair().public_bytes(),
            registered.key_pair().public_bytes()
        );
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");

        assert_eq!(accounts.login(&tx, "ada", "nope").unwrap_err().kind(), ErrorKind::Unauthorized);
        assert_eq!(accounts.login(&tx, "bob", "pw").unwrap_err().kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn wrong_session_key_is_unauthorized() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let grant = accounts.login(&tx, "ada", "pw").expect("login");

        let err = accounts
            .resolve_session(&tx, grant.session_id, &[9u8; 32])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn idle_session_is_rejected_while_row_remains() {
        let policy = SessionPolicy {
            idle: Duration::milliseconds(20),
            max_age: Duration::days(1),
        };
        let (storage, accounts) = accounts(policy);
        let lifetime = Lifetime::new();
        let tx = storage.db.begin(&lifetime).await.expect("begin");
        accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let grant = accounts.login(&tx, "ada", "pw").expect("login");
        tx.commit();

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let tx = storage.db.begin(&lifetime).await.expect("begin");
        let err = accounts
            .resolve_session(&tx, grant.session_id, &grant.session_key)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(storage.sessions.get(Some(&tx), grant.session_id).is_ok());
    }

    #[tokio::test]
    async fn token_credential_logs_in() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let auth = accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let (_, token) = accounts.add_token_credential(&tx, &auth).expect("token");

        let grant = accounts.login_with_token(&tx, "ada", &token).expect("token login");
        assert_eq!(grant.user_id, auth.user_id);
        assert!(accounts.login_with_token(&tx, "ada", b"pw").is_err());
    }

    #[tokio::test]
    async fn change_password_replaces_the_credential() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let auth = accounts.register_user(&tx, "ada", "old", RoleSet::EMPTY).expect("register");

        let err = accounts.change_password(&tx, &auth, "wrong", "new").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        accounts.change_password(&tx, &auth, "old", "new").expect("change");
        assert!(accounts.login(&tx, "ada", "old").is_err());
        assert!(accounts.login(&tx, "ada", "new").is_ok());
    }

    #[tokio::test]
    async fn logout_and_revoke_end_sessions() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let auth = accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let first = accounts.login(&tx, "ada", "pw").expect("login");
        let second = accounts.login(&tx, "ada", "pw").expect("login");

        accounts.logout(&tx, first.session_id).expect("logout");
        assert!(accounts.resolve_session(&tx, first.session_id, &first.session_key).is_err());

        assert_eq!(accounts.revoke_sessions(&tx, auth.user_id).expect("revoke"), 1);
        assert!(accounts.resolve_session(&tx, second.session_id, &second.session_key).is_err());
    }

    #[tokio::test]
    async fn busy_sessions_refresh_in_coarse_steps() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let grant = accounts.login(&tx, "ada", "pw").expect("login");
        for _ in 0..5 {
            accounts
                .resolve_session(&tx, grant.session_id, &grant.session_key)
                .expect("resolve");
        }
        let versions = storage.sessions.history(Some(&tx), grant.session_id).expect("history");
        assert_eq!(versions.len(), 1);
        assert_eq!(SessionPolicy::default().refresh_step(), Duration::seconds(60));
    }

    #[tokio::test]
    async fn stale_sessions_refresh_once_the_step_passes() {
        let policy = SessionPolicy {
            idle: Duration::milliseconds(400),
            max_age: Duration::days(1),
        };
        let (storage, accounts) = accounts(policy);
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let grant = accounts.login(&tx, "ada", "pw").expect("login");
        let before = storage.sessions.get(Some(&tx), grant.session_id).expect("session").last_active;

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        accounts
            .resolve_session(&tx, grant.session_id, &grant.session_key)
            .expect("resolve");
        let after = storage.sessions.get(Some(&tx), grant.session_id).expect("session").last_active;
        assert!(after > before);
    }

    #[tokio::test]
    async fn login_sweeps_expired_sessions() {
        let policy = SessionPolicy {
            idle: Duration::milliseconds(10),
            max_age: Duration::milliseconds(20),
        };
        let (storage, accounts) = accounts(policy);
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let old = accounts.login(&tx, "ada", "pw").expect("login");

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        let fresh = accounts.login(&tx, "ada", "pw").expect("login again");
        assert!(storage.sessions.find(Some(&tx), old.session_id).is_none());
        assert!(storage.sessions.find(Some(&tx), fresh.session_id).is_some());
        assert!(accounts.check_session(Some(&tx), fresh.session_id).is_ok());
    }

    #[tokio::test]
    async fn check_session_follows_logout() {
        let (storage, accounts) = accounts(SessionPolicy::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("register");
        let grant = accounts.login(&tx, "ada", "pw").expect("login");
        assert!(!accounts.check_session(Some(&tx), grant.session_id).expect("live"));

        accounts.logout(&tx, grant.session_id).expect("logout");
        let err = accounts.check_session(Some(&tx), grant.session_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
