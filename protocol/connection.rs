//! Symmetric request/response connections.
//!
//! A [`Connection`] both serves inbound requests through its [`Dispatcher`]
//! and issues outbound calls correlated by packet id. One writer task owns
//! the transport's sink so frames never interleave; every inbound request
//! runs in its own task under a child of the connection's lifetime.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::codes::{Call, Dispatcher, RequestCode};
use super::packet::{Body, Packet};
use super::transport::{FrameSink, FrameSource, SendError, Transport};
use crate::error::{Result, StrongboxError};
use crate::lifetime::Lifetime;

enum Outbound {
    Packet(Packet),
    Shutdown,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Packet>>>,
    running: Mutex<HashMap<u64, Lifetime>>,
    next_id: AtomicU64,
    lifetime: Lifetime,
    peer: String,
}

impl Shared {
    fn send(&self, packet: Packet) -> Result<()> {
        self.outbound
            .send(Outbound::Packet(packet))
            .map_err(|_| StrongboxError::Cancelled)
    }
}

#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.shared.peer).finish_non_exhaustive()
    }
}

impl Connection {
    /// Start serving `transport`. The returned task finishes once the
    /// connection is torn down and every in-flight request has stopped.
    pub fn open(transport: Transport, dispatcher: Dispatcher, lifetime: Lifetime) -> (Self, JoinHandle<()>) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound,
            pending: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            lifetime,
            peer: transport.peer,
        });
        info!(peer = %shared.peer, "connection opened");

        let writer = tokio::spawn(write_loop(
            Arc::downgrade(&shared),
            transport.sink,
            queue,
            shared.lifetime.clone(),
        ));
        let driver = tokio::spawn(read_loop(
            shared.clone(),
            transport.source,
            Arc::new(dispatcher),
            writer,
        ));
        (Self { shared }, driver)
    }

    /// A connection that only issues calls.
    pub fn client(transport: Transport) -> (Self, JoinHandle<()>) {
        Self::open(transport, Dispatcher::new(), Lifetime::new())
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.shared.lifetime
    }

    pub fn close(&self) {
        self.shared.lifetime.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lifetime.is_cancelled()
    }

    /// Issue `name` and wait for the peer's answer.
    pub async fn call(&self, name: &str, data: Value) -> Result<Value> {
        self.call_within(name, data, &self.shared.lifetime).await
    }

    /// Like [`call`](Self::call), but gives up when `lifetime` ends and asks
    /// the peer to cancel its work.
    pub async fn call_within(&self, name: &str, data: Value, lifetime: &Lifetime) -> Result<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, answer) = oneshot::channel();
        self.shared.pending.lock().insert(id, reply);
        if let Err(e) = self.shared.send(Packet::request(id, name, data)) {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        let packet = tokio::select! {
            biased;
            answer = answer => answer.map_err(|_| StrongboxError::Cancelled)?,
            _ = lifetime.cancelled() => {
                self.shared.pending.lock().remove(&id);
                let _ = self.shared.send(Packet { id, body: Body::Cancel });
                return Err(StrongboxError::Cancelled);
            }
        };

        match packet.body {
            Body::Response { data } => Ok(data),
            Body::Error { code, message, .. } => Err(StrongboxError::from_kind(code, message)),
            Body::Cancelled => Err(StrongboxError::Cancelled),
            other => Err(StrongboxError::internal(format!("unexpected reply {:?}", other))),
        }
    }

    /// Typed wrapper around [`call`](Self::call).
    pub async fn request<Req, Resp>(&self, code: RequestCode, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let data = serde_json::to_value(request)?;
        let answer = self.call(code.name(), data).await?;
        serde_json::from_value(answer)
            .map_err(|e| StrongboxError::internal(format!("malformed {} response: {}", code.name(), e)))
    }
}

enum Delivery {
    /// This packet cannot go out, but the transport is fine.
    Refused(StrongboxError),
    Broken(io::Error),
}

async fn deliver(sink: &mut Box<dyn FrameSink>, packet: &Packet) -> std::result::Result<(), Delivery> {
    let frame = packet.encode().map_err(|e| {
        Delivery::Refused(StrongboxError::internal(format!("encoding packet {}: {}", packet.id, e)))
    })?;
    match sink.send(frame).await {
        Ok(()) => Ok(()),
        Err(SendError::TooLarge { size, limit }) => Err(Delivery::Refused(StrongboxError::invalid(
            format!("message of {} bytes exceeds the {} byte frame limit", size, limit),
        ))),
        Err(SendError::Io(e)) => Err(Delivery::Broken(e)),
    }
}

/// What to do about a packet that could not be sent: our own requests fail
/// locally, replies are replaced by an error for the same id.
fn substitute(shared: &Weak<Shared>, packet: &Packet, err: StrongboxError) -> Option<Packet> {
    match &packet.body {
        Body::Request { .. } => {
            let waiter = shared
                .upgrade()
                .and_then(|shared| shared.pending.lock().remove(&packet.id));
            if let Some(waiter) = waiter {
                let _ = waiter.send(Packet::error(packet.id, &err));
            }
            None
        }
        Body::Cancel => None,
        Body::Response { .. } | Body::Error { .. } | Body::Cancelled => Some(Packet::error(packet.id, &err)),
    }
}

async fn write_loop(
    shared: Weak<Shared>,
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    lifetime: Lifetime,
) {
    while let Some(outbound) = queue.recv().await {
        let packet = match outbound {
            Outbound::Packet(packet) => packet,
            Outbound::Shutdown => break,
        };
        let refused = match deliver(&mut sink, &packet).await {
            Ok(()) => continue,
            Err(Delivery::Refused(err)) => err,
            Err(Delivery::Broken(e)) => {
                warn!(error = %e, "transport write failed");
                lifetime.cancel();
                break;
            }
        };

        match &refused {
            StrongboxError::Internal(detail) => error!(id = packet.id, detail = %detail, "packet not sent"),
            other => warn!(id = packet.id, error = %other, "packet not sent"),
        }
        let Some(fallback) = substitute(&shared, &packet, refused) else {
            continue;
        };
        match deliver(&mut sink, &fallback).await {
            Ok(()) => {}
            Err(Delivery::Refused(err)) => error!(id = packet.id, error = %err, "error reply not sent"),
            Err(Delivery::Broken(e)) => {
                warn!(error = %e, "transport write failed");
                lifetime.cancel();
                break;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

async fn read_loop(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    dispatcher: Arc<Dispatcher>,
    writer: JoinHandle<()>,
) {
    let mut tasks = JoinSet::new();
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.lifetime.cancelled() => break,
            frame = source.recv() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(peer = %shared.peer, "peer closed the transport");
                break;
            }
            Err(e) => {
                warn!(peer = %shared.peer, error = %e, "transport read failed");
                break;
            }
        };
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %shared.peer, error = %e, "ignoring malformed frame");
                continue;
            }
        };

        match packet.body {
            Body::Request { name, data } => {
                let id = packet.id;
                let Some(handler) = dispatcher.get(&name) else {
                    debug!(id, name = %name, "unknown request");
                    let err = StrongboxError::invalid(format!("unknown request '{}'", name));
                    let _ = shared.send(Packet::error(id, &err));
                    continue;
                };
                let lifetime = shared.lifetime.child();
                shared.running.lock().insert(id, lifetime.clone());
                let shared = shared.clone();
                tasks.spawn(async move {
                    let call = Call {
                        id,
                        data,
                        lifetime: lifetime.clone(),
                    };
                    let work = AssertUnwindSafe(async move { handler(call).await }).catch_unwind();
                    let outcome = match lifetime.guard(work).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(panic)) => {
                            error!(id, name = %name, panic = panic_message(panic.as_ref()), "handler panicked");
                            Err(StrongboxError::internal("handler panicked"))
                        }
                        Err(cancelled) => Err(cancelled),
                    };
                    shared.running.lock().remove(&id);
                    let packet = match outcome {
                        Ok(data) => Packet::response(id, data),
                        Err(err) => {
                            match &err {
                                StrongboxError::Internal(detail) => {
                                    error!(id, name = %name, detail = %detail, "request failed")
                                }
                                StrongboxError::Cancelled => debug!(id, name = %name, "request cancelled"),
                                other => debug!(id, name = %name, error = %other, "request rejected"),
                            }
                            Packet::error(id, &err)
                        }
                    };
                    let _ = shared.send(packet);
                });
            }
            Body::Cancel => {
                if let Some(lifetime) = shared.running.lock().get(&packet.id) {
                    debug!(id = packet.id, "peer cancelled request");
                    lifetime.cancel();
                }
            }
            Body::Response { .. } | Body::Error { .. } | Body::Cancelled => {
                let waiter = shared.pending.lock().remove(&packet.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(packet);
                    }
                    None => debug!(id = packet.id, "dropping reply with no pending call"),
                }
            }
        }
        while tasks.try_join_next().is_some() {}
    }

    shared.lifetime.cancel();
    while tasks.join_next().await.is_some() {}
    shared.pending.lock().clear();
    let _ = shared.outbound.send(Outbound::Shutdown);
    let _ = writer.await;
    info!(peer = %shared.peer, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::FutureExt;
    use serde_json::json;
    use std::time::Duration;

    fn echo_dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            RequestCode::WhoAmI,
            Arc::new(|call: Call| async move { Ok::<_, StrongboxError>(json!({"echo": call.data})) }.boxed()),
        );
        dispatcher.register(
            RequestCode::GetFile,
            Arc::new(|_call: Call| async move { Err::<Value, _>(StrongboxError::internal("secret detail")) }.boxed()),
        );
        dispatcher.register(
            RequestCode::Trash,
            Arc::new(|_call: Call| -> futures::future::BoxFuture<'static, Result<Value>> { panic!("handler bug") }),
        );
        dispatcher.register(
            RequestCode::ListTrash,
            Arc::new(|_call: Call| async move { Ok::<_, StrongboxError>(json!("x".repeat(4096))) }.boxed()),
        );
        dispatcher.register(
            RequestCode::Search,
            Arc::new(|_call: Call| {
                async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, StrongboxError>(Value::Null)
                }
                .boxed()
            }),
        );
        dispatcher
    }

    fn pair() -> (Connection, Connection) {
        limited_pair(usize::MAX)
    }

    fn limited_pair(max_frame_bytes: usize) -> (Connection, Connection) {
        let (server_end, client_end) = Transport::memory_pair_with_limit(max_frame_bytes);
        let (server, _) = Connection::open(server_end, echo_dispatcher(), Lifetime::new());
        let (client, _) = Connection::client(client_end);
        (server, client)
    }

    #[tokio::test]
    async fn calls_are_answered_by_id() {
        let (_server, client) = pair();
        let (a, b) = tokio::join!(
            client.call("WhoAmI", json!(1)),
            client.call("WhoAmI", json!(2)),
        );
        assert_eq!(a.expect("a"), json!({"echo": 1}));
        assert_eq!(b.expect("b"), json!({"echo": 2}));
    }

    #[tokio::test]
    async fn handler_faults_become_error_packets() {
        let (_server, client) = pair();
        let err = client.call("GetFile", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.to_string().contains("secret detail"));

        // The connection keeps serving after a fault.
        assert!(client.call("WhoAmI", json!(3)).await.is_ok());
    }

    #[tokio::test]
    async fn panicking_handlers_still_answer() {
        let (_server, client) = pair();
        let result = tokio::time::timeout(Duration::from_secs(5), client.call("Trash", Value::Null))
            .await
            .expect("a reply should arrive");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal);
        assert!(client.call("WhoAmI", json!(4)).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_replies_become_errors() {
        let (_server, client) = limited_pair(1024);
        let err = client.call("ListTrash", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(!client.is_closed());
        assert_eq!(client.call("WhoAmI", json!(5)).await.expect("echo"), json!({"echo": 5}));
    }

    #[tokio::test]
    async fn oversized_requests_fail_locally() {
        let (_server, client) = limited_pair(1024);
        let err = client.call("WhoAmI", json!("y".repeat(4096))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(client.call("WhoAmI", json!(6)).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_names_are_invalid_requests() {
        let (_server, client) = pair();
        let err = client.call("Teleport", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn caller_cancellation_reaches_the_server() {
        let (_server, client) = pair();
        let lifetime = Lifetime::new();
        let trigger = lifetime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = client
            .call_within("Search", Value::Null, &lifetime)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn closing_the_server_cancels_in_flight_requests() {
        let (server, client) = pair();
        let closer = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), client.call("Search", Value::Null))
            .await
            .expect("call should finish");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
