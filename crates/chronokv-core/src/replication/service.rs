//! Replicator service: peer registration, listener and session tasks

use super::config::ReplicatorConfig;
use super::session::{Session, SessionContext, SessionRole, SessionState, SessionStats};
use crate::store::Store;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept` before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Live view of the service's sessions
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<Vec<Arc<Mutex<SessionStats>>>>>,
}

impl SessionRegistry {
    fn register(&self, stats: Arc<Mutex<SessionStats>>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| {
            let s = s.lock();
            !(s.role == SessionRole::Inbound && s.state == SessionState::Closed)
        });
        sessions.push(stats);
    }

    /// Copy of every session's counters
    pub fn snapshot(&self) -> Vec<SessionStats> {
        self.sessions.lock().iter().map(|s| s.lock().clone()).collect()
    }

    /// Counters of the sessions currently in steady state with `peer`
    pub fn steady_with(&self, peer: &str) -> Vec<SessionStats> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.state == SessionState::Steady && s.peer.as_deref() == Some(peer))
            .collect()
    }
}

/// Replicates one store with its configured peers
///
/// ```no_run
/// # async fn demo() -> chronokv_core::Result<()> {
/// use chronokv_core::replication::{ReplicatorConfig, ReplicatorService};
/// use chronokv_core::store::{Store, StoreOptions};
/// use std::sync::Arc;
///
/// let config = ReplicatorConfig::new("./data/a", "a").with_connect("b", "10.0.0.2:15480");
/// let store = Arc::new(Store::open(&config.database, StoreOptions::default())?);
/// let service = ReplicatorService::bind(store, config).await?;
/// service.run().await
/// # }
/// ```
pub struct ReplicatorService {
    store: Arc<Store>,
    config: Arc<ReplicatorConfig>,
    listener: Option<TcpListener>,
    shutdown: CancellationToken,
    registry: SessionRegistry,
}

impl ReplicatorService {
    /// Register every configured peer and bind the listener
    pub async fn bind(store: Arc<Store>, config: ReplicatorConfig) -> Result<Self> {
        config.validate()?;

        let peers: Vec<String> = config.peers().map(str::to_owned).collect();
        let registering = Arc::clone(&store);
        let added = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut txn = registering.write_txn()?;
            let mut added = 0;
            for peer in &peers {
                if registering.add_node(&mut txn, peer)? {
                    added += 1;
                }
            }
            txn.commit()?;
            Ok(added)
        })
        .await
        .map_err(|e| Error::internal(format!("peer registration task failed: {e}")))??;
        if added > 0 {
            info!(added, "registered new peers");
        }

        let listener = match config.listen_port() {
            Some(port) => {
                let listener = TcpListener::bind(("0.0.0.0", port)).await?;
                info!(node = %config.node, addr = %listener.local_addr()?, "listening for peers");
                Some(listener)
            }
            None => {
                if config.port.is_some() {
                    warn!("`port` is set but no peer is accepted; not listening");
                }
                None
            }
        };

        Ok(Self {
            store,
            config: Arc::new(config),
            listener,
            shutdown: CancellationToken::new(),
            registry: SessionRegistry::default(),
        })
    }

    /// Address of the listener, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Token that stops the service when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle for observing sessions while the service runs
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Snapshot of every session's counters
    pub fn stats(&self) -> Vec<SessionStats> {
        self.registry.snapshot()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run until the shutdown token is cancelled or a session hits a
    /// storage failure
    pub async fn run(self) -> Result<()> {
        let ctx = SessionContext {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            shutdown: self.shutdown.clone(),
        };
        let mut tasks = JoinSet::new();

        for peer in &self.config.connect {
            let session = Session::outbound(ctx.clone(), peer.clone());
            self.registry.register(session.stats_handle());
            tasks.spawn(session.run_outbound());
        }
        info!(
            node = %self.config.node,
            outbound = self.config.connect.len(),
            accepted = self.config.accept.len(),
            "replicator started"
        );

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                accepted = accept(self.listener.as_ref()) => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(%addr, error = %e, "failed to set TCP_NODELAY");
                        }
                        let session = Session::inbound(ctx.clone(), Some(addr.to_string()));
                        self.registry.register(session.stats_handle());
                        tasks.spawn(session.run_inbound(stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "stopping replicator after storage failure");
                        break Err(e);
                    }
                    Err(e) => {
                        error!(error = %e, "session task panicked");
                        break Err(Error::internal(format!("session task failed: {e}")));
                    }
                },
            }
        };

        self.shutdown.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!(error = %e, "session ended with error during shutdown");
            }
        }
        info!(node = %self.config.node, "replicator stopped");
        result
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
