//! Message-oriented duplex transports.
//!
//! A transport moves whole frames in order. The in-memory pair is used by
//! tests and embedders; TCP frames are `[length:u32 BE][payload]`.

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SendError {
    /// The frame was refused before any byte reached the wire; the
    /// transport is still usable.
    #[error("frame of {size} bytes exceeds {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SendError>;
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next whole frame, or `None` once the peer has gone away.
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;
}

pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    pub peer: String,
}

impl Transport {
    /// Two connected in-memory ends.
    pub fn memory_pair() -> (Transport, Transport) {
        Self::memory_pair_with_limit(usize::MAX)
    }

    /// Like [`memory_pair`](Self::memory_pair), refusing frames above
    /// `max_frame_bytes` the way TCP does.
    pub fn memory_pair_with_limit(max_frame_bytes: usize) -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Transport {
                sink: Box::new(MemorySink {
                    peer: a_tx,
                    max_frame_bytes,
                }),
                source: Box::new(MemorySource(b_rx)),
                peer: "memory:a".to_string(),
            },
            Transport {
                sink: Box::new(MemorySink {
                    peer: b_tx,
                    max_frame_bytes,
                }),
                source: Box::new(MemorySource(a_rx)),
                peer: "memory:b".to_string(),
            },
        )
    }

    /// Length-prefixed frames over TCP; frames above `max_frame_bytes`
    /// are refused in both directions.
    pub fn tcp(stream: TcpStream, max_frame_bytes: usize) -> Transport {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp:unknown".to_string());
        let (reader, writer) = stream.into_split();
        Transport {
            sink: Box::new(TcpSink {
                writer,
                max_frame_bytes,
            }),
            source: Box::new(TcpSource {
                reader,
                max_frame_bytes,
            }),
            peer,
        }
    }
}

struct MemorySink {
    peer: mpsc::UnboundedSender<Vec<u8>>,
    max_frame_bytes: usize,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SendError> {
        if frame.len() > self.max_frame_bytes {
            return Err(SendError::TooLarge {
                size: frame.len(),
                limit: self.max_frame_bytes,
            });
        }
        self.peer
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed").into())
    }
}

struct MemorySource(mpsc::UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.0.recv().await)
    }
}

struct TcpSink {
    writer: OwnedWriteHalf,
    max_frame_bytes: usize,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SendError> {
        if frame.len() > self.max_frame_bytes {
            return Err(SendError::TooLarge {
                size: frame.len(),
                limit: self.max_frame_bytes,
            });
        }
        self.writer.write_u32(frame.len() as u32).await?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

struct TcpSource {
    reader: OwnedReadHalf,
    max_frame_bytes: usize,
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let len = match self.reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        if len > self.max_frame_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds {}", len, self.max_frame_bytes),
            ));
        }
        let mut frame = vec![0u8; len];
        self.reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn memory_pair_is_crossed() {
        let (mut a, mut b) = Transport::memory_pair();
        a.sink.send(b"ping".to_vec()).await.expect("send");
        assert_eq!(b.source.recv().await.expect("recv"), Some(b"ping".to_vec()));
        b.sink.send(b"pong".to_vec()).await.expect("send");
        assert_eq!(a.source.recv().await.expect("recv"), Some(b"pong".to_vec()));

        drop(a);
        assert_eq!(b.source.recv().await.expect("recv"), None);
    }

    #[tokio::test]
    async fn tcp_frames_keep_their_boundaries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut transport = Transport::tcp(stream, 1024);
            let mut frames = Vec::new();
            while let Some(frame) = transport.source.recv().await.expect("recv") {
                frames.push(frame);
            }
            frames
        });

        let mut client = Transport::tcp(TcpStream::connect(addr).await.expect("connect"), 1024);
        client.sink.send(b"one".to_vec()).await.expect("one");
        client.sink.send(Vec::new()).await.expect("empty");
        client.sink.send(vec![7u8; 1000]).await.expect("big");
        assert!(matches!(
            client.sink.send(vec![0u8; 2048]).await,
            Err(SendError::TooLarge { size: 2048, limit: 1024 })
        ));
        client.sink.send(b"after".to_vec()).await.expect("still usable");
        drop(client);

        let frames = server.await.expect("join");
        assert_eq!(
            frames,
            vec![b"one".to_vec(), Vec::new(), vec![7u8; 1000], b"after".to_vec()]
        );
    }
}
