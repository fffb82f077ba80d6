//! TCP front end: accepts connections, frames their byte streams and answers
//! each request in arrival order.
//!
//! Each admitted connection gets a slot in a fixed-size [`ConnectionTable`]
//! and its own task. When the table is full a new connection is accepted and
//! closed at once, without a protocol response.

use crate::allocator::DockAllocator;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::ledger::LedgerStore;
use crate::protocol::{FrameBuffer, ProtocolError, READ_CHUNK_LEN};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub type ConnectionId = u32;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no port available on {address} in {first}..={last}")]
    NoPortAvailable { address: String, first: u16, last: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("idle for {0:?}")]
    IdleTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

/// Fixed number of connection slots, addressed by stable ids.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Option<ConnectionInfo>>,
    next_id: ConnectionId,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            next_id: 1,
        }
    }

    /// Claims a free slot, or returns `None` when all are taken.
    pub fn insert(&mut self, peer: SocketAddr) -> Option<ConnectionId> {
        let slot = self.slots.iter_mut().find(|slot| slot.is_none())?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        *slot = Some(ConnectionInfo {
            id,
            peer,
            connected_at: Instant::now(),
        });
        Some(id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|c| c.id == id))
            .and_then(Option::take)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.slots.iter().flatten().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
    requests: AtomicU64,
    protocol_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub active: u64,
    pub requests: u64,
    pub protocol_errors: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Binds the first free port in `first..=last` on `address`.
pub async fn bind_in_range(
    address: &str,
    first: u16,
    last: u16,
) -> Result<TcpListener, ServerError> {
    for port in first..=last {
        match TcpListener::bind((address, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(address, port, error = %e, "Port unavailable"),
        }
    }
    Err(ServerError::NoPortAvailable {
        address: address.to_string(),
        first,
        last,
    })
}

pub struct DockServer<S> {
    listener: TcpListener,
    dispatcher: Dispatcher<S>,
    table: Arc<Mutex<ConnectionTable>>,
    stats: Arc<ServerStats>,
    idle_timeout: Option<Duration>,
}

impl<S: LedgerStore + 'static> DockServer<S> {
    pub async fn bind(
        config: &ServerConfig,
        allocator: Arc<DockAllocator<S>>,
    ) -> Result<Self, ServerError> {
        let listener = bind_in_range(&config.bind_address, config.port, config.last_port()).await?;
        let local = listener.local_addr()?;
        info!(address = %local, max_clients = config.max_clients, "Docking server listening");

        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(allocator),
            table: Arc::new(Mutex::new(ConnectionTable::new(config.max_clients))),
            stats: Arc::new(ServerStats::default()),
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then drops every open connection.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(&mut sessions, stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        sessions.shutdown().await;
        Ok(())
    }

    fn admit(&self, sessions: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        let Some(id) = lock_table(&self.table).insert(peer) else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(%peer, "Connection table full, closing new connection");
            drop(stream);
            return;
        };

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        info!(connection = id, %peer, "Client connected");

        let session = Session {
            id,
            stream,
            buffer: FrameBuffer::new(),
            dispatcher: self.dispatcher.clone(),
            stats: Arc::clone(&self.stats),
            idle_timeout: self.idle_timeout,
        };
        let table = Arc::clone(&self.table);
        let stats = Arc::clone(&self.stats);

        sessions.spawn(async move {
            match session.run().await {
                Ok(()) => info!(connection = id, %peer, "Client disconnected"),
                Err(SessionError::Protocol(e)) => {
                    stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        connection = id,
                        %peer,
                        error = %e,
                        "Protocol violation, connection closed"
                    );
                }
                Err(e @ SessionError::IdleTimeout(_)) => {
                    info!(connection = id, %peer, reason = %e, "Idle connection closed");
                }
                Err(e) => warn!(connection = id, %peer, error = %e, "Connection error"),
            }
            lock_table(&table).remove(id);
            stats.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

fn lock_table(table: &Mutex<ConnectionTable>) -> MutexGuard<'_, ConnectionTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session<S> {
    id: ConnectionId,
    stream: TcpStream,
    buffer: FrameBuffer,
    dispatcher: Dispatcher<S>,
    stats: Arc<ServerStats>,
    idle_timeout: Option<Duration>,
}

impl<S: LedgerStore> Session<S> {
    /// Runs until the peer closes its write side or a fault ends the session.
    async fn run(mut self) -> Result<(), SessionError> {
        let mut chunk = [0u8; READ_CHUNK_LEN];

        loop {
            while let Some(request) = self.buffer.next_frame()? {
                debug!(
                    connection = self.id,
                    sequence = request.sequence,
                    message = ?request.message.message_type(),
                    "Request received"
                );
                let response = self.dispatcher.handle(&request, self.id)?;
                self.stream.write_all(&response.encode()).await?;
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
            }

            let n = self.read(&mut chunk).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    debug!(
                        connection = self.id,
                        pending = self.buffer.pending(),
                        "Peer closed with a partial frame buffered"
                    );
                }
                return Ok(());
            }
            self.buffer.extend(&chunk[..n])?;
        }
    }

    async fn read(&mut self, chunk: &mut [u8]) -> Result<usize, SessionError> {
        match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream.read(chunk))
                .await
                .map_err(|_| SessionError::IdleTimeout(limit))?
                .map_err(SessionError::from),
            None => Ok(self.stream.read(chunk).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn table_rejects_when_full_and_reuses_freed_slots() {
        let mut table = ConnectionTable::new(2);
        let a = table.insert(peer(1)).unwrap();
        let b = table.insert(peer(2)).unwrap();
        assert_ne!(a, b);
        assert!(table.is_full());
        assert!(table.insert(peer(3)).is_none());

        assert_eq!(table.remove(a).unwrap().peer, peer(1));
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);

        let c = table.insert(peer(3)).unwrap();
        assert_ne!(c, a);
        assert_eq!(table.get(c).unwrap().peer, peer(3));
        assert_eq!(table.get(b).unwrap().peer, peer(2));
    }
}
