//! Request/response protocol over a duplex message transport.

pub mod codes;
pub mod connection;
pub mod handlers;
pub mod messages;
pub mod packet;
pub mod pipeline;
pub mod transport;

pub use codes::{Call, Dispatcher, Handler, RequestCode};
pub use connection::Connection;
pub use packet::{Body, Packet};
pub use pipeline::{FileRequirement, RolePolicy, Scope, SessionCredentials};
pub use transport::{SendError, Transport};
