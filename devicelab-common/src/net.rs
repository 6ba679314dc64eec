//! Framed transport for the realtime channel
//!
//! Messages are JSON documents with a 4-byte big-endian length prefix over
//! TCP, which gives every client a reliable ordered session channel. The
//! server side accept loop lives in the hub; this module provides the
//! framing primitives, the origin allow-list, and the client connection.

use crate::{Envelope, Event, LabError, Request, RequestFrame, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Maximum framed message size (16MB) — screen frames dominate
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default upper bound a client waits for a response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Write a length-prefixed JSON message to the stream
pub async fn write_message<W, T>(stream: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)
        .map_err(|e| LabError::network(format!("failed to serialize message: {}", e)))?;

    if data.len() > MAX_MESSAGE_SIZE {
        return Err(LabError::network("message too large"));
    }

    let len_bytes = (data.len() as u32).to_be_bytes();
    stream
        .write_all(&len_bytes)
        .await
        .map_err(|e| LabError::network(format!("failed to send message length: {}", e)))?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| LabError::network(format!("failed to send message data: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| LabError::network(format!("failed to flush stream: {}", e)))?;
    Ok(())
}

/// Read a length-prefixed JSON message from the stream
pub async fn read_message<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| LabError::network(format!("failed to read message length: {}", e)))?;

    let message_len = u32::from_be_bytes(len_bytes) as usize;
    if message_len > MAX_MESSAGE_SIZE {
        return Err(LabError::network("message too large"));
    }

    let mut data = vec![0u8; message_len];
    stream
        .read_exact(&mut data)
        .await
        .map_err(|e| LabError::network(format!("failed to read message data: {}", e)))?;

    serde_json::from_slice(&data)
        .map_err(|e| LabError::network(format!("failed to deserialize message: {}", e)))
}

/// Origin allow-list for the push channel; an empty list admits all peers
#[derive(Debug, Clone, Default)]
pub struct OriginAllowlist {
    allowed: Vec<IpAddr>,
}

impl OriginAllowlist {
    /// Build from configured origin strings; host parts that do not parse as
    /// addresses are ignored with a warning
    pub fn from_origins(origins: &[String]) -> Self {
        let mut allowed = Vec::new();
        for origin in origins {
            let host = origin
                .trim_start_matches("http://")
                .trim_start_matches("https://")
                .split(':')
                .next()
                .unwrap_or_default();
            match host.parse::<IpAddr>() {
                Ok(ip) => allowed.push(ip),
                Err(_) => warn!("Ignoring non-address origin entry: {}", origin),
            }
        }
        Self { allowed }
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&ip) || ip.is_loopback()
    }
}

/// Client side of the realtime channel
///
/// Owns the socket halves; responses are correlated to requests by frame id,
/// broadcast events are surfaced on a separate stream.
pub struct LabClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>,
    events_rx: mpsc::Receiver<Event>,
    next_id: AtomicU64,
    peer: SocketAddr,
}

impl LabClient {
    /// Connect to a server and spawn the demultiplexing reader
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| LabError::network(format!("failed to connect to {}: {}", addr, e)))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| LabError::network(format!("failed to get peer address: {}", e)))?;
        let (reader, writer) = stream.into_split();

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::channel(256);

        tokio::spawn(Self::read_loop(reader, pending.clone(), events_tx));

        info!("Connected to device lab at {}", peer);
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            pending,
            events_rx,
            next_id: AtomicU64::new(1),
            peer,
        })
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>,
        events_tx: mpsc::Sender<Event>,
    ) {
        loop {
            let event: Event = match read_message(&mut reader).await {
                Ok(event) => event,
                Err(e) => {
                    debug!("Client read loop ended: {}", e);
                    break;
                }
            };
            match event {
                Event::Response { request_id, envelope, .. } => {
                    let waiter = pending.lock().await.remove(&request_id);
                    if let Some(tx) = waiter {
                        let _ = tx.send(envelope);
                    } else {
                        warn!("Response for unknown request id {}", request_id);
                    }
                }
                other => {
                    if events_tx.send(other).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Issue a request and wait for the correlated envelope
    pub async fn request(&self, request: Request) -> Result<Envelope> {
        self.request_with_timeout(request, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Issue a request with an explicit response deadline
    pub async fn request_with_timeout(
        &self,
        request: Request,
        deadline: Duration,
    ) -> Result<Envelope> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = RequestFrame { id, request };
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_message(&mut *writer, &frame).await {
                self.pending.lock().await.remove(&id);
                return Err(e);
            }
        }

        match timeout(deadline, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(LabError::network("connection closed before response")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(LabError::timeout(format!(
                    "no response within {}s",
                    deadline.as_secs()
                )))
            }
        }
    }

    /// Receive the next broadcast event (device updates, logs, frames)
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }
}
