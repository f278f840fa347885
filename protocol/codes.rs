//! Request codes and the per-connection dispatch table.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::lifetime::Lifetime;

/// One inbound request as the dispatch table sees it.
pub struct Call {
    pub id: u64,
    pub data: Value,
    /// Ends when the peer cancels this request or the connection closes.
    pub lifetime: Lifetime,
}

pub type Handler = Arc<dyn Fn(Call) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

macro_rules! request_codes {
    ($($code:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum RequestCode {
            $($code),+
        }

        impl RequestCode {
            pub const ALL: &'static [RequestCode] = &[$(RequestCode::$code),+];

            /// Wire name carried in a Request packet.
            pub fn name(self) -> &'static str {
                match self {
                    $(RequestCode::$code => stringify!($code)),+
                }
            }

            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $(stringify!($code) => Some(RequestCode::$code),)+
                    _ => None,
                }
            }
        }
    };
}

request_codes! {
    Register,
    Login,
    LoginWithToken,
    ResumeSession,
    Logout,
    WhoAmI,
    AddToken,
    ChangePassword,
    GetRoot,
    GetFile,
    ListChildren,
    CreateFile,
    CreateFolder,
    Rename,
    Move,
    Trash,
    Untrash,
    Purge,
    ListTrash,
    Search,
    FilePath,
    FileHistory,
    Grant,
    ListGrants,
    ListContents,
    ListSnapshots,
    Scan,
    SniffMime,
    GenerateThumbnail,
    OpenStream,
    CreateFileStream,
    StreamRead,
    StreamWrite,
    StreamSeek,
    StreamTruncate,
    StreamInfo,
    StreamClose,
    AdminListUsers,
    AdminSetRoles,
    AdminRevokeSessions,
}

impl std::fmt::Display for RequestCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Handlers keyed by request code, built once when a connection starts.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<RequestCode, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics if `code` already has a handler.
    pub fn register(&mut self, code: RequestCode, handler: Handler) {
        let previous = self.handlers.insert(code, handler);
        assert!(previous.is_none(), "handler for {} registered twice", code);
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        RequestCode::parse(name).and_then(|code| self.handlers.get(&code).cloned())
    }

    pub fn contains(&self, code: RequestCode) -> bool {
        self.handlers.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop() -> Handler {
        Arc::new(|_call: Call| async { Ok::<_, crate::error::StrongboxError>(Value::Null) }.boxed())
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(RequestCode::ALL.len(), 40);
        for code in RequestCode::ALL {
            assert_eq!(RequestCode::parse(code.name()), Some(*code));
        }
        assert_eq!(RequestCode::parse("getfile"), None);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_is_fatal() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RequestCode::Login, noop());
        dispatcher.register(RequestCode::Login, noop());
    }

    #[test]
    fn lookup_by_wire_name() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RequestCode::Scan, noop());
        assert!(dispatcher.get("Scan").is_some());
        assert!(dispatcher.get("SniffMime").is_none());
    }
}
