//! # TCP Responder
//!
//! Accept connections, parse commands, and answer them from a shared
//! in-memory map (or echo the raw bytes back) with minimal overhead.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{CommandParser, ParseError};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How the responder answers inbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderMode {
    /// Write every received chunk straight back.
    Echo,
    /// Parse commands and answer in RESP2 from the shared store.
    KeyValue,
}

impl FromStr for ResponderMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "echo" => Ok(ResponderMode::Echo),
            "kv" | "keyvalue" => Ok(ResponderMode::KeyValue),
            other => Err(format!("unknown responder mode: {other}")),
        }
    }
}

impl fmt::Display for ResponderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponderMode::Echo => write!(f, "echo"),
            ResponderMode::KeyValue => write!(f, "kv"),
        }
    }
}

/// Responder configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. "127.0.0.1:6379". Port 0 picks a free port.
    pub addr: String,
    pub mode: ResponderMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: "127.0.0.1:6379".to_string(),
            mode: ResponderMode::KeyValue,
        }
    }
}

/// Key/value map shared by every connection of one server.
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Store {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().get(key).cloned()
    }

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.inner.lock().insert(key, value);
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    pub fn flush(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bound listener ready to accept connections.
pub struct Server {
    listener: TcpListener,
    mode: ResponderMode,
    store: Store,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(Server {
            listener,
            mode: config.mode,
            store: Store::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the store, for seeding or inspecting it.
    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// Accepts connections forever, one task per connection.
    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.listener.local_addr()?, mode = %self.mode, "responder listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "accepted connection");
            let mode = self.mode;
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, mode, store).await {
                    debug!(%peer, error = %err, "connection ended with error");
                }
            });
        }
    }

    /// Runs the accept loop on a background task.
    pub fn spawn(self) -> JoinHandle<io::Result<()>> {
        tokio::spawn(self.run())
    }
}

/// Handles a single TCP client connection.
pub async fn handle_connection(
    mut stream: TcpStream,
    mode: ResponderMode,
    store: Store,
) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut parser = CommandParser::new();
    let mut replies = Vec::with_capacity(256);

    loop {
        buffer.reserve(READ_BUFFER_SIZE);
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        if mode == ResponderMode::Echo {
            stream.write_all(&buffer.split()).await?;
            continue;
        }

        replies.clear();
        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => replies.extend_from_slice(&dispatch_command(&args, &store)),
                Ok(None) => break,
                Err(ParseError::Protocol) => {
                    warn!("protocol error, closing connection");
                    replies.extend_from_slice(&resp_error("protocol error"));
                    stream.write_all(&replies).await?;
                    return Ok(());
                }
            }
        }
        if !replies.is_empty() {
            stream.write_all(&replies).await?;
        }
    }

    Ok(())
}

fn dispatch_command(args: &[Vec<u8>], store: &Store) -> Vec<u8> {
    let Some(cmd) = args.first() else {
        return resp_error("empty command");
    };
    if cmd.eq_ignore_ascii_case(b"PING") {
        return handle_ping(args);
    }
    if cmd.eq_ignore_ascii_case(b"ECHO") {
        return handle_echo(args);
    }
    if cmd.eq_ignore_ascii_case(b"GET") {
        return handle_get(args, store);
    }
    if cmd.eq_ignore_ascii_case(b"SET") {
        return handle_set(args, store);
    }
    if cmd.eq_ignore_ascii_case(b"DEL") {
        return handle_del(args, store);
    }
    if cmd.eq_ignore_ascii_case(b"FLUSHALL") {
        store.flush();
        return resp_simple("OK");
    }

    resp_error("unknown command")
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => resp_bulk(&args[1]),
        _ => resp_error("wrong number of arguments for PING"),
    }
}

fn handle_echo(args: &[Vec<u8>]) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for ECHO");
    }
    resp_bulk(&args[1])
}

fn handle_get(args: &[Vec<u8>], store: &Store) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for GET");
    }
    match store.get(&args[1]) {
        Some(value) => resp_bulk(&value),
        None => resp_null(),
    }
}

fn handle_set(args: &[Vec<u8>], store: &Store) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for SET");
    }
    store.set(args[1].clone(), args[2].clone());
    resp_simple("OK")
}

fn handle_del(args: &[Vec<u8>], store: &Store) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for DEL");
    }
    let removed = args[1..].iter().filter(|key| store.delete(key)).count();
    resp_integer(removed as i64)
}

fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 6);
    buf.extend_from_slice(b"-ERR ");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}
