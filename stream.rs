//! Sequential I/O actors for open file streams.
//!
//! Opening a stream spawns one task that owns the handle's cursor and fork
//! state. Every command goes through its bounded queue and is answered on a
//! oneshot channel, so commands on one handle run strictly in arrival
//! order while different handles run independently.
//!
//! ```text
//! Open -> {Read | Write | Seek | Truncate | Info}* -> Closed
//!                                                  \-> Aborted (fault)
//! ```
//!
//! The first write or truncate forks a new snapshot from the one the handle
//! was opened on; later writes reuse it. Each write or truncate is its own
//! store transaction. Reads never take the write slot.
//!
//! Every chunk is bounded by [`StreamLimits`]: a read or write larger than
//! `max_chunk`, or a write or truncate that would grow the content past
//! `max_size`, is rejected and the stream stays usable.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::auth::UserAuth;
use crate::content_io::BlockScope;
use crate::error::{ErrorKind, Result, StrongboxError};
use crate::lifetime::Lifetime;
use crate::model::{AccessLevel, ContentId, FileContent, FileId, SnapshotId};
use crate::storage::Storage;
use crate::store::{ResourceId, Stored};
use crate::tree::FileTree;
use crate::vault::Unlocked;

pub type HandleId = u64;

#[derive(Debug)]
pub enum Command {
    Read { count: usize },
    Write { data: Vec<u8> },
    Seek { position: u64 },
    Truncate { length: u64 },
    Info,
    Close,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Read { .. } => "read",
            Command::Write { .. } => "write",
            Command::Seek { .. } => "seek",
            Command::Truncate { .. } => "truncate",
            Command::Info => "info",
            Command::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub handle_id: HandleId,
    pub file_id: FileId,
    pub content_id: ContentId,
    pub snapshot_id: Option<SnapshotId>,
    pub position: u64,
    pub size: u64,
    pub has_forked: bool,
}

#[derive(Debug)]
enum Outcome {
    Data(Vec<u8>),
    Info(StreamInfo),
}

struct Envelope {
    command: Command,
    reply: oneshot::Sender<Result<Outcome>>,
}

/// Upper bounds on what one stream command may move or allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Largest read count or write payload, in bytes.
    pub max_chunk: usize,
    /// Largest size a write or truncate may give the content.
    pub max_size: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_chunk: 3 * 1024 * 1024,
            max_size: 64 * 1024 * 1024 * 1024,
        }
    }
}

impl StreamLimits {
    fn check_chunk(&self, what: &str, len: usize) -> Result<()> {
        if len > self.max_chunk {
            return Err(StrongboxError::invalid(format!(
                "{} of {} bytes exceeds the {} byte chunk limit",
                what, len, self.max_chunk
            )));
        }
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.max_size {
            return Err(StrongboxError::invalid(format!(
                "size {} exceeds the {} byte file limit",
                size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Client side of one open stream.
#[derive(Clone)]
pub struct StreamHandle {
    id: HandleId,
    file_id: FileId,
    session_id: Option<ResourceId>,
    sender: mpsc::Sender<Envelope>,
    stopped: watch::Receiver<bool>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("file_id", &self.file_id)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// The session the stream was opened under, if any.
    pub fn session_id(&self) -> Option<ResourceId> {
        self.session_id
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once the actor has exited, for whatever reason.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        while !*stopped.borrow_and_update() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
    }

    async fn send(&self, command: Command) -> Result<Outcome> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope { command, reply })
            .await
            .map_err(|_| StrongboxError::invalid(format!("stream {} is closed", self.id)))?;
        response
            .await
            .map_err(|_| StrongboxError::invalid(format!("stream {} is closed", self.id)))?
    }

    async fn send_info(&self, command: Command) -> Result<StreamInfo> {
        match self.send(command).await? {
            Outcome::Info(info) => Ok(info),
            Outcome::Data(_) => Err(StrongboxError::internal("stream answered with data")),
        }
    }

    /// Up to `count` bytes from the cursor; empty at end of stream.
    pub async fn read(&self, count: usize) -> Result<Vec<u8>> {
        match self.send(Command::Read { count }).await? {
            Outcome::Data(data) => Ok(data),
            Outcome::Info(_) => Err(StrongboxError::internal("stream answered without data")),
        }
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<StreamInfo> {
        self.send_info(Command::Write { data }).await
    }

    pub async fn seek(&self, position: u64) -> Result<StreamInfo> {
        self.send_info(Command::Seek { position }).await
    }

    pub async fn truncate(&self, length: u64) -> Result<StreamInfo> {
        self.send_info(Command::Truncate { length }).await
    }

    pub async fn info(&self) -> Result<StreamInfo> {
        self.send_info(Command::Info).await
    }

    /// Finish queued commands, then stop the actor.
    pub async fn close(&self) -> Result<StreamInfo> {
        self.send_info(Command::Close).await
    }
}

/// Parameters for a new stream.
pub struct OpenStream {
    pub unlocked: Unlocked,
    pub content: Stored<FileContent>,
    pub snapshot_id: Option<SnapshotId>,
    pub auth: UserAuth,
    /// The file was created for this stream; purge it if the stream faults
    /// before anything is committed.
    pub new_file: bool,
}

#[derive(Clone)]
pub struct StreamEngine {
    storage: Storage,
    tree: FileTree,
    queue_depth: usize,
    limits: StreamLimits,
    next_id: Arc<AtomicU64>,
}

impl StreamEngine {
    pub fn new(storage: Storage, tree: FileTree, queue_depth: usize) -> Self {
        Self {
            storage,
            tree,
            queue_depth: queue_depth.max(1),
            limits: StreamLimits::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_limits(mut self, limits: StreamLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> StreamLimits {
        self.limits
    }

    /// Spawn the actor for a stream; it stops on close, on a fault, or
    /// when `lifetime` ends.
    pub fn open(&self, params: OpenStream, lifetime: Lifetime) -> StreamHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let (exit, stopped) = watch::channel(false);
        let file_id = params.unlocked.file.id;
        let session_id = params.auth.session_id;
        let actor = StreamActor {
            id,
            limits: self.limits,
            storage: self.storage.clone(),
            tree: self.tree.clone(),
            file_id,
            content_id: params.content.id,
            key_level: params.unlocked.level,
            unlocked: params.unlocked,
            creator: params.auth.user_id,
            snapshot_id: params.snapshot_id,
            position: 0,
            has_forked: false,
            new_file: params.new_file,
            committed: false,
            lifetime,
        };
        info!(handle = id, file = file_id, new_file = params.new_file, "stream opened");
        tokio::spawn(async move {
            actor.run(receiver).await;
            exit.send_replace(true);
        });
        StreamHandle {
            id,
            file_id,
            session_id,
            sender,
            stopped,
        }
    }
}

struct StreamActor {
    id: HandleId,
    limits: StreamLimits,
    storage: Storage,
    tree: FileTree,
    file_id: FileId,
    content_id: ContentId,
    key_level: AccessLevel,
    unlocked: Unlocked,
    creator: crate::model::UserId,
    snapshot_id: Option<SnapshotId>,
    position: u64,
    has_forked: bool,
    new_file: bool,
    committed: bool,
    lifetime: Lifetime,
}

/// Faults that leave the stream usable.
fn recoverable(err: &StrongboxError) -> bool {
    matches!(err.kind(), ErrorKind::InvalidRequest | ErrorKind::Forbidden)
}

impl StreamActor {
    async fn run(mut self, mut receiver: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => {
                    debug!(handle = self.id, "stream lifetime ended");
                    break;
                }
                envelope = receiver.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => {
                        debug!(handle = self.id, "every sender dropped");
                        break;
                    }
                },
            };

            let closing = matches!(envelope.command, Command::Close);
            let command = envelope.command.name();
            let result = self.handle(envelope.command).await;
            match result {
                Ok(outcome) => {
                    let _ = envelope.reply.send(Ok(outcome));
                    if closing {
                        info!(handle = self.id, file = self.file_id, "stream closed");
                        break;
                    }
                }
                Err(err) if recoverable(&err) => {
                    debug!(handle = self.id, command, error = %err, "stream command rejected");
                    let _ = envelope.reply.send(Err(err));
                }
                Err(err) => {
                    error!(handle = self.id, file = self.file_id, command, error = %err, "stream aborted");
                    self.cleanup().await;
                    let _ = envelope.reply.send(Err(err));
                    break;
                }
            }
        }

        receiver.close();
        while let Ok(envelope) = receiver.try_recv() {
            let _ = envelope
                .reply
                .send(Err(StrongboxError::invalid(format!("stream {} is closed", self.id))));
        }
    }

    fn scope(&self, snapshot_id: SnapshotId) -> BlockScope<'_> {
        BlockScope {
            file_id: self.file_id,
            content_id: self.content_id,
            snapshot_id,
            key: &self.unlocked.key,
        }
    }

    fn size(&self) -> Result<u64> {
        match self.snapshot_id {
            Some(snapshot_id) => self.tree.io().size(None, snapshot_id),
            None => Ok(0),
        }
    }

    fn info(&self) -> Result<StreamInfo> {
        Ok(StreamInfo {
            handle_id: self.id,
            file_id: self.file_id,
            content_id: self.content_id,
            snapshot_id: self.snapshot_id,
            position: self.position,
            size: self.size()?,
            has_forked: self.has_forked,
        })
    }

    async fn handle(&mut self, command: Command) -> Result<Outcome> {
        match command {
            Command::Read { count } => {
                self.limits.check_chunk("read", count)?;
                let data = match self.snapshot_id {
                    Some(snapshot_id) => {
                        self.tree
                            .io()
                            .read_at(None, &self.scope(snapshot_id), self.position, count)?
                    }
                    None => Vec::new(),
                };
                self.position += data.len() as u64;
                Ok(Outcome::Data(data))
            }
            Command::Seek { position } => {
                let size = self.size()?;
                if position > size {
                    return Err(StrongboxError::invalid(format!(
                        "position {} out of range 0..={}",
                        position, size
                    )));
                }
                self.position = position;
                Ok(Outcome::Info(self.info()?))
            }
            Command::Write { data } => {
                self.limits.check_chunk("write", data.len())?;
                let written = data.len() as u64;
                self.limits.check_size(self.position.saturating_add(written))?;
                self.mutate(|actor, tx, scope_id| {
                    actor.tree.io().write_at(tx, &actor.scope(scope_id), actor.position, &data)
                })
                .await?;
                self.position += written;
                Ok(Outcome::Info(self.info()?))
            }
            Command::Truncate { length } => {
                self.limits.check_size(length)?;
                self.mutate(|actor, tx, scope_id| actor.tree.io().truncate(tx, &actor.scope(scope_id), length))
                    .await?;
                self.position = self.position.min(length);
                Ok(Outcome::Info(self.info()?))
            }
            Command::Info | Command::Close => Ok(Outcome::Info(self.info()?)),
        }
    }

    /// Run one write-side change in its own transaction, forking first if
    /// this handle has not forked yet.
    async fn mutate(
        &mut self,
        apply: impl FnOnce(&Self, &crate::store::Transaction, SnapshotId) -> Result<u64>,
    ) -> Result<u64> {
        if self.key_level < AccessLevel::ReadWrite {
            return Err(StrongboxError::forbidden("stream is read-only"));
        }
        let tx = self.storage.db.begin(&self.lifetime).await?;

        let (snapshot_id, forked) = if self.has_forked {
            let snapshot_id = self
                .snapshot_id
                .ok_or_else(|| StrongboxError::internal("forked stream without a snapshot"))?;
            (snapshot_id, false)
        } else {
            let content = self.storage.contents.get(Some(&tx), self.content_id)?;
            let fork = self.tree.fork_snapshot(&tx, &content, self.snapshot_id, self.creator)?;
            (fork.id, true)
        };

        let size = apply(self, &tx, snapshot_id)?;
        tx.commit();

        if forked {
            debug!(handle = self.id, snapshot = snapshot_id, base = ?self.snapshot_id, "stream forked");
            self.snapshot_id = Some(snapshot_id);
            self.has_forked = true;
        }
        self.committed = true;
        Ok(size)
    }

    /// Remove a file created for this stream if nothing was ever committed.
    async fn cleanup(&self) {
        if !self.new_file || self.committed {
            return;
        }
        let tx = match self.storage.db.begin(&Lifetime::new()).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(handle = self.id, file = self.file_id, error = %e, "cleanup could not start");
                return;
            }
        };
        match self.tree.purge_subtree(&tx, self.file_id) {
            Ok(_) => {
                tx.commit();
                info!(handle = self.id, file = self.file_id, "removed file from failed stream");
            }
            Err(e) => warn!(handle = self.id, file = self.file_id, error = %e, "cleanup failed"),
        }
    }
}

/// Open streams of one connection, keyed by handle id. A handle leaves
/// the registry when it is removed or when its actor exits.
#[derive(Default)]
pub struct StreamRegistry {
    handles: Arc<Mutex<HashMap<HandleId, StreamHandle>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: StreamHandle) -> HandleId {
        let id = handle.id();
        let mut stopped = handle.stopped.clone();
        self.handles.lock().insert(id, handle);

        let handles = Arc::downgrade(&self.handles);
        tokio::spawn(async move {
            while !*stopped.borrow_and_update() {
                if stopped.changed().await.is_err() {
                    break;
                }
            }
            if let Some(handles) = handles.upgrade() {
                if handles.lock().remove(&id).is_some() {
                    debug!(handle = id, "stopped stream unregistered");
                }
            }
        });
        id
    }

    pub fn get(&self, id: HandleId) -> Result<StreamHandle> {
        self.handles
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrongboxError::not_found(format!("no open stream {}", id)))
    }

    pub fn remove(&self, id: HandleId) -> Option<StreamHandle> {
        self.handles.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every handle, letting queued commands finish.
    pub async fn close_all(&self) {
        let handles: Vec<StreamHandle> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.close().await {
                debug!(handle = handle.id(), error = %e, "stream already stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::cheap_kdf;
    use crate::auth::{Accounts, SessionPolicy};
    use crate::block_codec::{BlockCodec, BLOCK_SIZE};
    use crate::model::{FileKind, RoleSet};
    use crate::store::Query;
    use crate::vault::KeyVault;
    use std::time::Duration;

    struct Fixture {
        storage: Storage,
        tree: FileTree,
        engine: StreamEngine,
        ada: UserAuth,
    }

    #[tokio::test]
    async fn handles_remember_their_session() {
        let f = fixture().await;
        let handle = open(&f, "x", AccessLevel::Read, false).await;
        assert_eq!(handle.session_id(), f.ada.session_id);
        assert!(!handle.is_stopped());
        handle.close().await.expect("close");
        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .expect("stopped after close");
    }

    async fn fixture() -> Fixture {
        let storage = Storage::in_memory();
        let accounts = Accounts::new(storage.clone(), cheap_kdf(), SessionPolicy::default());
        let tree = FileTree::new(storage.clone(), KeyVault::new(storage.clone()), BlockCodec::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let ada = accounts.register_user(&tx, "ada", "pw", RoleSet::EMPTY).expect("ada");
        tx.commit();
        let engine = StreamEngine::new(storage.clone(), tree.clone(), 8);
        Fixture {
            storage,
            tree,
            engine,
            ada,
        }
    }

    async fn open(f: &Fixture, name: &str, level: AccessLevel, new_file: bool) -> StreamHandle {
        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let file = f.tree.create(&tx, None, name, FileKind::File, &f.ada).expect("file");
        let mut unlocked = f.tree.open(Some(&tx), file.id, &f.ada, AccessLevel::Read).expect("open");
        unlocked.level = level;
        let content = f.tree.get_main_content(&tx, &file).expect("main");
        let snapshot_id = f.tree.latest_snapshot(Some(&tx), content.id).map(|s| s.id);
        tx.commit();
        f.engine.open(
            OpenStream {
                unlocked,
                content,
                snapshot_id,
                auth: f.ada.clone(),
                new_file,
            },
            Lifetime::new(),
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn write_then_read_back_through_one_handle() {
        let f = fixture().await;
        for len in [10, BLOCK_SIZE, BLOCK_SIZE * 3 + 5] {
            let handle = open(&f, &format!("f{}", len), AccessLevel::Full, false).await;
            let data = pattern(len);
            let info = handle.write(data.clone()).await.expect("write");
            assert_eq!(info.size, len as u64);
            assert_eq!(info.position, len as u64);

            handle.seek(0).await.expect("seek");
            assert_eq!(handle.read(len).await.expect("read"), data);
            assert!(handle.read(1).await.expect("eof").is_empty());
            handle.close().await.expect("close");
        }
    }

    #[tokio::test]
    async fn two_writes_fork_exactly_one_snapshot() {
        let f = fixture().await;
        let handle = open(&f, "x", AccessLevel::ReadWrite, false).await;
        let first = handle.write(b"hello ".to_vec()).await.expect("first");
        let second = handle.write(b"world".to_vec()).await.expect("second");
        assert!(first.has_forked);
        assert_eq!(first.snapshot_id, second.snapshot_id);

        let snapshots = f
            .storage
            .snapshots
            .count(None, &Query::new().partition(first.content_id));
        assert_eq!(snapshots, 1);

        handle.seek(0).await.expect("seek");
        assert_eq!(handle.read(64).await.expect("read"), b"hello world");
    }

    #[tokio::test]
    async fn seek_past_end_is_rejected_but_stream_survives() {
        let f = fixture().await;
        let handle = open(&f, "x", AccessLevel::ReadWrite, false).await;
        handle.write(b"abc".to_vec()).await.expect("write");

        let err = handle.seek(4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(handle.seek(3).await.expect("seek end").position, 3);
        assert_eq!(handle.info().await.expect("info").size, 3);
    }

    #[tokio::test]
    async fn read_only_stream_refuses_writes() {
        let f = fixture().await;
        let handle = open(&f, "x", AccessLevel::Read, false).await;
        let err = handle.write(b"no".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(handle.read(10).await.expect("read still works").is_empty());
    }

    #[tokio::test]
    async fn truncate_clamps_the_cursor() {
        let f = fixture().await;
        let handle = open(&f, "x", AccessLevel::ReadWrite, false).await;
        handle.write(pattern(100)).await.expect("write");
        let info = handle.truncate(40).await.expect("truncate");
        assert_eq!(info.size, 40);
        assert_eq!(info.position, 40);
    }

    #[tokio::test]
    async fn commands_on_one_handle_apply_in_order() {
        let f = fixture().await;
        let handle = open(&f, "x", AccessLevel::ReadWrite, false).await;
        let mut pending = Vec::new();
        for i in 0..20u8 {
            let handle = handle.clone();
            pending.push(tokio::spawn(async move { handle.write(vec![i; 4]).await }));
            tokio::task::yield_now().await;
        }
        for task in pending {
            task.await.expect("join").expect("write");
        }
        let info = handle.info().await.expect("info");
        assert_eq!(info.size, 80);
        handle.seek(0).await.expect("seek");
        let data = handle.read(80).await.expect("read");
        for chunk in data.chunks(4) {
            assert!(chunk.iter().all(|b| *b == chunk[0]), "interleaved write {:?}", chunk);
        }
    }

    #[tokio::test]
    async fn closed_handle_rejects_further_commands() {
        let f = fixture().await;
        let handle = open(&f, "x", AccessLevel::ReadWrite, false).await;
        handle.close().await.expect("close");
        let err = handle.info().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn fault_before_commit_removes_new_file() {
        let f = fixture().await;
        let handle = open(&f, "doomed", AccessLevel::ReadWrite, true).await;
        let file_id = handle.file_id();

        // Remove the content row underneath the actor so its fork fails.
        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let content = f.tree.find_main_content(Some(&tx), file_id).expect("content");
        f.storage.contents.purge(&tx, content.id).expect("purge");
        tx.commit();

        let err = handle.write(b"bytes".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(f.storage.files.get_any(None, file_id).is_err());
        assert!(handle.info().await.is_err());
    }

    #[tokio::test]
    async fn faulted_stream_leaves_the_registry() {
        let f = fixture().await;
        let registry = StreamRegistry::new();
        let handle = open(&f, "doomed", AccessLevel::ReadWrite, true).await;
        let id = registry.insert(handle.clone());
        let healthy = registry.insert(open(&f, "fine", AccessLevel::ReadWrite, false).await);

        let tx = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let content = f.tree.find_main_content(Some(&tx), handle.file_id()).expect("content");
        f.storage.contents.purge(&tx, content.id).expect("purge");
        tx.commit();
        assert!(handle.write(b"bytes".to_vec()).await.is_err());

        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .expect("actor exits");
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get(id).is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("entry removed");
        assert!(handle.is_stopped());
        assert!(registry.get(healthy).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn oversized_chunks_are_rejected_and_the_stream_survives() {
        let f = fixture().await;
        let engine = f.engine.clone().with_limits(StreamLimits {
            max_chunk: 1024,
            max_size: 4096,
        });
        let f = Fixture { engine, ..f };
        let handle = open(&f, "x", AccessLevel::ReadWrite, false).await;

        let err = handle.read(usize::MAX).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        let err = handle.write(vec![1u8; 1025]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        let err = handle.truncate(u64::MAX / 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        handle.truncate(4090).await.expect("grow inside the limit");
        handle.seek(4090).await.expect("seek");
        let err = handle.write(vec![2u8; 7]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let info = handle.write(vec![2u8; 6]).await.expect("fill to the limit");
        assert_eq!(info.size, 4096);
        handle.seek(4000).await.expect("seek back");
        assert_eq!(handle.read(1024).await.expect("read").len(), 96);
    }

    #[tokio::test]
    async fn two_handles_interleave_without_mixing() {
        let f = fixture().await;
        let a = open(&f, "a", AccessLevel::ReadWrite, false).await;
        let b = open(&f, "b", AccessLevel::ReadWrite, false).await;

        let (a1, b1, a2, b2, a3, b3) = tokio::join!(
            a.write(b"a1-".to_vec()),
            b.write(b"b1-".to_vec()),
            a.write(b"a2-".to_vec()),
            b.write(b"b2-".to_vec()),
            a.write(b"a3".to_vec()),
            b.write(b"b3".to_vec()),
        );
        for result in [a1, b1, a2, b2, a3, b3] {
            result.expect("write");
        }

        let (sa, sb) = tokio::join!(a.seek(0), b.seek(0));
        sa.expect("seek a");
        sb.expect("seek b");
        let (ra, rb) = tokio::join!(a.read(64), b.read(64));
        assert_eq!(ra.expect("read a"), b"a1-a2-a3");
        assert_eq!(rb.expect("read b"), b"b1-b2-b3");
    }

    #[tokio::test]
    async fn a_stalled_handle_does_not_block_another() {
        let f = fixture().await;
        let a = open(&f, "a", AccessLevel::ReadWrite, false).await;
        let b = open(&f, "b", AccessLevel::ReadWrite, false).await;
        b.write(b"readable".to_vec()).await.expect("write b");
        b.seek(0).await.expect("seek b");

        // Hold the write slot so a's write waits on it.
        let held = f.storage.db.begin(&Lifetime::new()).await.expect("begin");
        let stalled = tokio::spawn({
            let a = a.clone();
            async move { a.write(b"later".to_vec()).await }
        });
        tokio::task::yield_now().await;

        let read = tokio::time::timeout(Duration::from_secs(5), b.read(64))
            .await
            .expect("b is not blocked by a")
            .expect("read b");
        assert_eq!(read, b"readable");
        assert!(!stalled.is_finished());

        drop(held);
        let info = stalled.await.expect("join").expect("write a");
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn registry_closes_everything() {
        let f = fixture().await;
        let registry = StreamRegistry::new();
        let a = registry.insert(open(&f, "a", AccessLevel::ReadWrite, false).await);
        let b = registry.insert(open(&f, "b", AccessLevel::ReadWrite, false).await);
        assert_ne!(a, b);
        let kept = registry.get(a).expect("a");

        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(kept.info().await.is_err());
        assert_eq!(registry.get(b).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
