//! One replication session with one peer
//!
//! ```text
//! Connecting ──► SendIdentity ──► AwaitIdentity ──► Steady ──► Closed
//!     ▲            (inbound                                      │
//!     │             starts here)                                 │
//!     └──────────────── outbound: after reconnect delay ─────────┘
//! ```
//!
//! In `Steady` the socket is split: one half feeds received records to
//! [`Store::apply_incoming`], the other drains the peer's backlog with
//! [`Store::drain_next`]. Store calls run on the blocking pool so that no
//! LMDB transaction ever spans an `.await`.

use super::config::{ConnectPeer, ReplicatorConfig};
use super::protocol::{Message, MessageCodec};
use super::SEND_BATCH;
use crate::store::{ApplyOutcome, Received, Record, Store, Timestamp};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Dialing the peer (outbound only)
    Connecting,
    /// Sending our identity
    SendIdentity,
    /// Waiting for the peer's identity
    AwaitIdentity,
    /// Exchanging records
    Steady,
    /// Socket closed
    Closed,
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionRole {
    Outbound,
    Inbound,
}

/// Counters of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub role: SessionRole,
    pub state: SessionState,
    /// Peer name, known once the handshake completed
    pub peer: Option<String>,
    pub remote_addr: Option<String>,
    /// Full records written to the socket
    pub entries_sent: u64,
    /// Acknowledgements written to the socket
    pub acks_sent: u64,
    /// Full records applied locally
    pub entries_applied: u64,
    /// Full records we already had
    pub duplicates: u64,
    /// Acknowledgements received
    pub acks_received: u64,
    /// Outbound connection attempts after the first
    pub reconnects: u64,
}

impl SessionStats {
    fn new(role: SessionRole, peer: Option<String>, remote_addr: Option<String>) -> Self {
        Self {
            role,
            state: match role {
                SessionRole::Outbound => SessionState::Connecting,
                SessionRole::Inbound => SessionState::SendIdentity,
            },
            peer,
            remote_addr,
            entries_sent: 0,
            acks_sent: 0,
            entries_applied: 0,
            duplicates: 0,
            acks_received: 0,
            reconnects: 0,
        }
    }
}

/// Everything a session shares with the service that spawned it
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub store: Arc<Store>,
    pub config: Arc<ReplicatorConfig>,
    pub shutdown: CancellationToken,
}

pub(crate) struct Session {
    ctx: SessionContext,
    target: Option<ConnectPeer>,
    stats: Arc<Mutex<SessionStats>>,
}

/// Run a store operation on the blocking pool
async fn blocking<T, F>(store: &Arc<Store>, op: F) -> Result<T>
where
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| Error::internal(format!("store task failed: {e}")))?
}

impl Session {
    /// Session dialing `peer`
    pub(crate) fn outbound(ctx: SessionContext, peer: ConnectPeer) -> Self {
        let stats = SessionStats::new(
            SessionRole::Outbound,
            Some(peer.name.clone()),
            Some(peer.addr.clone()),
        );
        Self {
            ctx,
            target: Some(peer),
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    /// Session for a connection accepted from `remote_addr`
    pub(crate) fn inbound(ctx: SessionContext, remote_addr: Option<String>) -> Self {
        let stats = SessionStats::new(SessionRole::Inbound, None, remote_addr);
        Self {
            ctx,
            target: None,
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    pub(crate) fn stats_handle(&self) -> Arc<Mutex<SessionStats>> {
        Arc::clone(&self.stats)
    }

    fn update(&self, f: impl FnOnce(&mut SessionStats)) {
        f(&mut self.stats.lock());
    }

    fn set_state(&self, state: SessionState) {
        self.update(|s| s.state = state);
    }

    /// Dial the peer until shutdown, reconnecting after every failure
    ///
    /// Returns an error only for failures that must stop the replicator.
    pub(crate) async fn run_outbound(self) -> Result<()> {
        let Some(peer) = self.target.clone() else {
            return Err(Error::internal("outbound session without a target"));
        };
        let config = Arc::clone(&self.ctx.config);
        let mut attempt = 0u64;

        while !self.ctx.shutdown.is_cancelled() {
            if attempt > 0 {
                self.update(|s| s.reconnects += 1);
            }
            attempt += 1;
            self.set_state(SessionState::Connecting);

            let outcome = match self.connect(&peer).await {
                Ok(stream) => {
                    info!(peer = %peer.name, addr = %peer.addr, "connected to peer");
                    self.run_connection(stream).await
                }
                Err(e) => Err(e),
            };
            self.set_state(SessionState::Closed);

            match outcome {
                Ok(()) => debug!(peer = %peer.name, "session ended"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    peer = %peer.name,
                    error = %e,
                    "session failed, reconnecting in {:?}",
                    config.reconnect_delay
                ),
            }

            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.reconnect_delay) => {}
            }
        }
        Ok(())
    }

    async fn connect(&self, peer: &ConnectPeer) -> Result<TcpStream> {
        let timeout = self.ctx.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&peer.addr))
            .await
            .map_err(|_| Error::replication(format!("connecting to {} timed out", peer.addr)))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Serve one accepted connection
    ///
    /// Returns an error only for failures that must stop the replicator.
    pub(crate) async fn run_inbound<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let outcome = self.run_connection(stream).await;
        self.set_state(SessionState::Closed);
        let peer = self.stats.lock().peer.clone().unwrap_or_default();
        match outcome {
            Ok(()) => {
                debug!(peer = %peer, "inbound session ended");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(peer = %peer, error = %e, "inbound session failed");
                Ok(())
            }
        }
    }

    /// Handshake, then exchange records until the socket closes or the
    /// service shuts down
    async fn run_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, MessageCodec::new());
        let mut writer = FramedWrite::new(write_half, MessageCodec::new());

        let handshake = self.handshake(&mut reader, &mut writer);
        let peer = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => return Ok(()),
            peer = handshake => peer?,
        };

        let rearmed = {
            let peer = peer.clone();
            blocking(&self.ctx.store, move |store| store.rearm_pending(&peer)).await?
        };
        self.update(|s| {
            s.peer = Some(peer.clone());
            s.state = SessionState::Steady;
        });
        info!(peer = %peer, rearmed, "session established");

        let wake = Notify::new();
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => Ok(()),
            res = self.receive_loop(&peer, reader, &wake) => res,
            res = self.send_loop(&peer, writer, &wake) => res,
        }
    }

    async fn handshake<S>(
        &self,
        reader: &mut FramedRead<ReadHalf<S>, MessageCodec>,
        writer: &mut FramedWrite<WriteHalf<S>, MessageCodec>,
    ) -> Result<String>
    where
        S: AsyncRead + AsyncWrite,
    {
        self.set_state(SessionState::SendIdentity);
        writer
            .send(Message::Identity(self.ctx.config.node.clone()))
            .await?;

        self.set_state(SessionState::AwaitIdentity);
        let first = tokio::time::timeout(self.ctx.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| Error::replication("timed out waiting for the peer's identity"))?;
        let name = match first {
            Some(Ok(Message::Identity(name))) => name,
            Some(Ok(Message::LogEntry(_))) => {
                return Err(Error::invalid_message("log entry received before identity"));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(Error::replication("connection closed during handshake")),
        };

        let allowed = match &self.target {
            Some(target) => target.name == name,
            None => self.ctx.config.accepts(&name),
        };
        if !allowed {
            return Err(Error::replication(format!("unexpected peer identity `{name}`")));
        }
        Ok(name)
    }

    async fn receive_loop<R>(
        &self,
        peer: &str,
        mut reader: FramedRead<R, MessageCodec>,
        wake: &Notify,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        while let Some(message) = reader.next().await {
            let record = match message? {
                Message::LogEntry(record) => record,
                Message::Identity(_) => {
                    return Err(Error::invalid_message("identity repeated after handshake"));
                }
            };
            trace!(peer = %peer, ts = %record.timestamp(), "received record");

            let received = {
                let peer = peer.to_owned();
                blocking(&self.ctx.store, move |store| store.apply_incoming(&peer, &record)).await?
            };
            match received {
                Received::Applied(outcome) => {
                    self.update(|s| match outcome {
                        ApplyOutcome::Duplicate => s.duplicates += 1,
                        ApplyOutcome::Current | ApplyOutcome::Superseded => s.entries_applied += 1,
                    });
                    // an acknowledgement is now queued for the peer
                    wake.notify_one();
                }
                Received::Acknowledged => self.update(|s| s.acks_received += 1),
            }
        }
        debug!(peer = %peer, "peer closed the connection");
        Ok(())
    }

    async fn send_loop<W>(
        &self,
        peer: &str,
        mut writer: FramedWrite<W, MessageCodec>,
        wake: &Notify,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let poll_interval = self.ctx.config.poll_interval;
        loop {
            let mut after: Option<Timestamp> = None;
            let mut sent = 0usize;
            loop {
                let next = {
                    let peer = peer.to_owned();
                    blocking(&self.ctx.store, move |store| {
                        store.drain_next(&peer, after.as_ref())
                    })
                    .await?
                };
                let Some(record) = next else {
                    break;
                };
                after = Some(*record.timestamp());
                self.update(|s| match &record {
                    Record::Full(_) => s.entries_sent += 1,
                    Record::Ack(_) => s.acks_sent += 1,
                });
                writer.feed(Message::LogEntry(record)).await?;
                sent += 1;
                if sent % SEND_BATCH == 0 {
                    writer.flush().await?;
                }
            }
            writer.flush().await?;

            if sent > 0 {
                trace!(peer = %peer, sent, "drained backlog");
                continue;
            }
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
