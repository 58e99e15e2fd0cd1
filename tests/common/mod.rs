//! Common utilities for integration tests
//!
//! Spawns a real bridge on an ephemeral port and talks the raw text
//! protocol to it over TCP, so every test exercises the full stack:
//! wire codec, round-tripper, locks and backend.

#![allow(dead_code)]

use membridge::{Keyspace, MemoryStore, RecordBackend, server};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

/// Generate a unique key prefix to avoid conflicts between tests
pub fn test_prefix() -> String {
    format!("membridge_test:{}:", rand::random::<u32>())
}

/// A bridge serving on an ephemeral local port
pub struct Bridge {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Bridge {
    /// Spawn a bridge over the given backend
    pub async fn spawn<B>(backend: B, prefix: &str) -> Self
    where
        B: RecordBackend + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let keyspace = Keyspace::new(prefix);
        tokio::spawn(async move {
            let _ = server::run(listener, backend, keyspace, async move {
                let _ = shutdown_rx.await;
            })
            .await;
        });

        Self {
            addr,
            shutdown: Some(shutdown_tx),
        }
    }

    /// Spawn a bridge over an in-process store
    pub async fn spawn_memory() -> Self {
        Self::spawn(MemoryStore::new(), "t:").await
    }

    /// Trigger a graceful shutdown
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A raw protocol client
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("failed to connect to bridge");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Write raw bytes to the bridge
    pub async fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write failed");
        self.writer.flush().await.expect("flush failed");
    }

    /// Read one `\r\n`-terminated line, without the terminator
    ///
    /// Returns an empty string on EOF.
    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .expect("read failed");
        if read == 0 {
            return String::new();
        }
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Read exactly `len` payload bytes plus the trailing `\r\n`
    pub async fn data_block(&mut self, len: usize) -> Vec<u8> {
        let mut block = vec![0u8; len + 2];
        self.reader
            .read_exact(&mut block)
            .await
            .expect("short data block");
        assert!(block.ends_with(b"\r\n"), "data block not CRLF-terminated");
        block.truncate(len);
        block
    }

    /// Send one command line and read the single-line reply
    pub async fn round_trip(&mut self, command: &str) -> String {
        self.send(format!("{command}\r\n").as_bytes()).await;
        self.line().await
    }

    /// Store a payload via `set` and assert it was stored
    pub async fn set(&mut self, key: &str, flags: &str, exptime: u64, data: &[u8]) {
        let header = format!("set {key} {flags} {exptime} {}\r\n", data.len());
        self.send(header.as_bytes()).await;
        self.send(data).await;
        self.send(b"\r\n").await;
        assert_eq!(self.line().await, "STORED");
    }

    /// True when the server has closed the connection
    pub async fn at_eof(&mut self) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.reader.read(&mut probe).await, Ok(0))
    }
}
