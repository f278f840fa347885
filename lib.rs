//! # Strongbox - Encrypted Multi-User File Storage
//!
//! Strongbox is the backend of an end-to-end encrypted file service. Every
//! file and folder has its own content key; keys are wrapped under the
//! parent folder's key up to a per-user root whose key is sealed to the
//! owner's X25519 public key. Sharing seals a file key to another user's
//! public key.
//!
//! ## Features
//!
//! - **Versioned store**: every change appends a version; one write
//!   transaction at a time, reads never wait
//! - **Key hierarchy**: XChaCha20-Poly1305 key wrapping, Argon2id
//!   credentials, idle-expiring sessions
//! - **Block storage**: 256 KiB encrypted blocks addressed by snapshot, with
//!   copy-on-fork snapshots
//! - **Streams**: per-handle actors with strictly ordered reads and writes
//! - **Protocol**: symmetric JSON request/response over any message
//!   transport, with staged authorization
//!
//! ## Quick Start
//!
//! ```no_run
//! use strongbox::{collaborators::Collaborators, config::Config, service::Service};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_with_env(None)?;
//!     let service = Service::open(config.clone(), Collaborators::default()).await?;
//!     service.start();
//!
//!     let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//!     service.serve(listener).await?;
//!     service.stop().await
//! }
//! ```

pub mod auth;
pub mod block_codec;
pub mod collaborators;
pub mod config;
pub mod content_io;
pub mod error;
pub mod keys;
pub mod lifetime;
pub mod model;
pub mod protocol;
pub mod service;
pub mod storage;
pub mod store;
pub mod stream;
pub mod tree;
pub mod vault;

// Re-export common types for convenience
pub use error::{ErrorKind, StrongboxError};
