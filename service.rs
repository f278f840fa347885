//! The composed service.
//!
//! [`Service`] wires the store, key vault, file tree, collaborators and
//! stream engine together and hands every accepted transport its own
//! [`Connection`] with a freshly built dispatch table.

use anyhow::Context;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Accounts;
use crate::block_codec::BlockCodec;
use crate::collaborators::{Analyzer, Collaborators};
use crate::config::Config;
use crate::error::{Result, StrongboxError};
use crate::lifetime::Lifetime;
use crate::protocol::{handlers, Connection, Scope, Transport};
use crate::storage::Storage;
use crate::stream::StreamEngine;
use crate::tree::FileTree;
use crate::vault::KeyVault;

/// Everything a request handler can reach.
pub struct Services {
    pub config: Config,
    pub storage: Storage,
    pub accounts: Accounts,
    pub tree: FileTree,
    pub analyzer: Analyzer,
    pub streams: StreamEngine,
}

impl Services {
    pub fn new(config: Config, storage: Storage, collaborators: Collaborators) -> Self {
        let accounts = Accounts::new(storage.clone(), config.password_kdf, config.session_policy());
        let tree = FileTree::new(
            storage.clone(),
            KeyVault::new(storage.clone()),
            BlockCodec::default(),
        );
        let analyzer = Analyzer::new(storage.clone(), tree.clone(), collaborators);
        let streams = StreamEngine::new(storage.clone(), tree.clone(), config.stream_queue_depth)
            .with_limits(config.stream_limits());
        Self {
            config,
            storage,
            accounts,
            tree,
            analyzer,
            streams,
        }
    }
}

pub struct Service {
    services: Arc<Services>,
    lifetime: Mutex<Lifetime>,
    running: AtomicBool,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn new(config: Config, storage: Storage, collaborators: Collaborators) -> Self {
        Self {
            services: Arc::new(Services::new(config, storage, collaborators)),
            lifetime: Mutex::new(Lifetime::new()),
            running: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Build a service over the image at `config.data_path`, or an empty
    /// in-memory store when none is configured.
    pub async fn open(config: Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        let storage = match &config.data_path {
            Some(path) => Storage::open(path)
                .await
                .with_context(|| format!("opening store image {}", path))?,
            None => Storage::in_memory(),
        };
        Ok(Self::new(config, storage, collaborators))
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn storage(&self) -> &Storage {
        &self.services.storage
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut lifetime = self.lifetime.lock();
        if lifetime.is_cancelled() {
            *lifetime = Lifetime::new();
        }
        info!(listen = %self.services.config.listen_addr, "service started");
    }

    /// Serve one transport until it closes or the service stops.
    pub fn accept(&self, transport: Transport) -> Result<Connection> {
        if !self.is_running() {
            return Err(StrongboxError::invalid("service is not running"));
        }
        let lifetime = self.lifetime.lock().child();
        let scope = Arc::new(Scope::new(self.services.clone(), lifetime.clone()));
        let dispatcher = handlers::dispatcher(&scope);
        let (connection, driver) = Connection::open(transport, dispatcher, lifetime);

        let teardown = tokio::spawn(async move {
            let _ = driver.await;
            let open = scope.streams.len();
            scope.streams.close_all().await;
            debug!(streams = open, "connection streams closed");
        });
        let mut connections = self.connections.lock();
        connections.retain(|task| !task.is_finished());
        connections.push(teardown);
        Ok(connection)
    }

    /// Accept TCP connections until the service stops.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let lifetime = self.lifetime.lock().clone();
        let max_frame_bytes = self.services.config.max_frame_bytes;
        info!(addr = ?listener.local_addr().ok(), "accepting connections");
        loop {
            let (stream, peer) = tokio::select! {
                _ = lifetime.cancelled() => break,
                accepted = listener.accept() => accepted.context("accepting connection")?,
            };
            debug!(peer = %peer, "tcp connection accepted");
            if let Err(e) = self.accept(Transport::tcp(stream, max_frame_bytes)) {
                warn!(peer = %peer, error = %e, "connection refused");
            }
        }
        Ok(())
    }

    /// Cancel every connection, wait for their teardown and persist the
    /// store image when a data path is configured.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.lifetime.lock().cancel();
        let connections: Vec<JoinHandle<()>> = self.connections.lock().drain(..).collect();
        let count = connections.len();
        for task in connections {
            if let Err(e) = task.await {
                warn!(error = %e, "connection task failed");
            }
        }
        info!(connections = count, "connections closed");

        if let Some(path) = &self.services.config.data_path {
            self.services
                .storage
                .save(path, self.services.config.compress_image)
                .await
                .with_context(|| format!("saving store image {}", path))?;
        }
        info!("service stopped");
        Ok(())
    }
}
