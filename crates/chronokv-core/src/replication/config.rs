//! Replicator configuration
//!
//! The configuration file is a list of `key = value` lines; `#` starts a
//! comment. Example:
//!
//! ```text
//! database = /var/lib/chronokv/node-a
//! node = node-a
//! port = 15480
//! accept = node-b
//! connect = node-c 10.0.0.3:15480
//! ```

use super::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_REPLICATION_PORT,
};
use crate::store::DEFAULT_MAP_SIZE;
use crate::store::keys::validate_node_name;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A peer this node dials
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectPeer {
    /// Name the peer must announce in its identity message
    pub name: String,
    /// `host:port` to dial
    pub addr: String,
}

/// Replicator configuration
#[derive(Debug, Clone, Serialize)]
pub struct ReplicatorConfig {
    /// Store directory
    pub database: PathBuf,

    /// This node's name, sent in every handshake
    pub node: String,

    /// Listening port; only used when `accept` is not empty
    pub port: Option<u16>,

    /// Peers allowed to connect to us
    pub accept: Vec<String>,

    /// Peers we dial
    pub connect: Vec<ConnectPeer>,

    /// LMDB map size in bytes
    pub map_size: usize,

    /// Pause between outbound connection attempts
    pub reconnect_delay: Duration,

    /// Longest an idle session waits before re-scanning its backlog
    pub poll_interval: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Time allowed for the identity exchange
    pub handshake_timeout: Duration,
}

impl ReplicatorConfig {
    /// Configuration with default timings and no peers
    pub fn new(database: impl Into<PathBuf>, node: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            node: node.into(),
            port: None,
            accept: Vec::new(),
            connect: Vec::new(),
            map_size: DEFAULT_MAP_SIZE,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        }
    }

    /// Accept connections from `peer`
    pub fn with_accept(mut self, peer: impl Into<String>) -> Self {
        self.accept.push(peer.into());
        self
    }

    /// Dial `peer` at `addr`
    pub fn with_connect(mut self, peer: impl Into<String>, addr: impl Into<String>) -> Self {
        self.connect.push(ConnectPeer {
            name: peer.into(),
            addr: addr.into(),
        });
        self
    }

    /// Listen on `port`; 0 picks a free one
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parse configuration text and validate the result
    pub fn parse(text: &str) -> Result<Self> {
        let mut database: Option<PathBuf> = None;
        let mut node: Option<String> = None;
        let mut port: Option<u16> = None;
        let mut accept = Vec::new();
        let mut connect = Vec::new();
        let mut map_size = None;
        let mut reconnect_delay = None;
        let mut poll_interval = None;
        let mut connect_timeout = None;
        let mut handshake_timeout = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::config(format!("line {line_no}: expected `key = value`")))?;
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                return Err(Error::config(format!("line {line_no}: `{key}` has no value")));
            }

            match key {
                "database" => set_once(&mut database, PathBuf::from(value), key, line_no)?,
                "node" => set_once(&mut node, value.to_owned(), key, line_no)?,
                "port" => set_once(&mut port, parse_number(value, key, line_no)?, key, line_no)?,
                "accept" => accept.push(value.to_owned()),
                "connect" => connect.push(parse_connect(value, line_no)?),
                "map_size" => {
                    set_once(&mut map_size, parse_number(value, key, line_no)?, key, line_no)?
                }
                "reconnect_delay_ms" => {
                    set_once(&mut reconnect_delay, parse_millis(value, key, line_no)?, key, line_no)?
                }
                "poll_interval_ms" => {
                    set_once(&mut poll_interval, parse_millis(value, key, line_no)?, key, line_no)?
                }
                "connect_timeout_ms" => {
                    set_once(&mut connect_timeout, parse_millis(value, key, line_no)?, key, line_no)?
                }
                "handshake_timeout_ms" => set_once(
                    &mut handshake_timeout,
                    parse_millis(value, key, line_no)?,
                    key,
                    line_no,
                )?,
                other => {
                    return Err(Error::config(format!("line {line_no}: unknown key `{other}`")));
                }
            }
        }

        let database = database.ok_or_else(|| Error::config("`database` is required"))?;
        let node = node.ok_or_else(|| Error::config("`node` is required"))?;

        let mut config = Self::new(database, node);
        config.port = port;
        config.accept = accept;
        config.connect = connect;
        if let Some(map_size) = map_size {
            config.map_size = map_size;
        }
        if let Some(delay) = reconnect_delay {
            config.reconnect_delay = delay;
        }
        if let Some(interval) = poll_interval {
            config.poll_interval = interval;
        }
        if let Some(timeout) = connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = handshake_timeout {
            config.handshake_timeout = timeout;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check names, peers and timings
    pub fn validate(&self) -> Result<()> {
        validate_node_name(&self.node).map_err(|e| Error::config(e.to_string()))?;

        if self.accept.is_empty() && self.connect.is_empty() {
            return Err(Error::config("at least one `accept` or `connect` peer is required"));
        }

        // a peer may be both accepted and dialed, but not listed twice on one side
        let sides: [(&str, Vec<&str>); 2] = [
            ("accept", self.accept.iter().map(String::as_str).collect()),
            ("connect", self.connect.iter().map(|p| p.name.as_str()).collect()),
        ];
        for (key, names) in sides {
            let mut seen = HashSet::new();
            for peer in names {
                validate_node_name(peer).map_err(|e| Error::config(e.to_string()))?;
                if peer == self.node {
                    return Err(Error::config(format!("`{peer}` is this node's own name")));
                }
                if !seen.insert(peer) {
                    return Err(Error::config(format!(
                        "peer `{peer}` is listed more than once under `{key}`"
                    )));
                }
            }
        }

        if self.map_size == 0 {
            return Err(Error::config("`map_size` must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("`poll_interval_ms` must be positive"));
        }
        Ok(())
    }

    /// Port to listen on, `None` when no peer is accepted
    pub fn listen_port(&self) -> Option<u16> {
        if self.accept.is_empty() {
            None
        } else {
            Some(self.port.unwrap_or(DEFAULT_REPLICATION_PORT))
        }
    }

    /// Every configured peer name, once each
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        let dialed = self
            .connect
            .iter()
            .map(|p| p.name.as_str())
            .filter(|name| !self.accepts(name));
        self.accept.iter().map(String::as_str).chain(dialed)
    }

    /// Whether `name` may connect to us
    pub fn accepts(&self, name: &str) -> bool {
        self.accept.iter().any(|peer| peer == name)
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str, line_no: usize) -> Result<()> {
    if slot.is_some() {
        return Err(Error::config(format!("line {line_no}: `{key}` is set twice")));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str, line_no: usize) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("line {line_no}: `{key}` expects a number, got `{value}`")))
}

fn parse_millis(value: &str, key: &str, line_no: usize) -> Result<Duration> {
    parse_number::<u64>(value, key, line_no).map(Duration::from_millis)
}

fn parse_connect(value: &str, line_no: usize) -> Result<ConnectPeer> {
    let mut parts = value.split_whitespace();
    let (Some(name), Some(addr), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::config(format!(
            "line {line_no}: `connect` expects `<peer> <host:port>`"
        )));
    };
    let port_ok = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !port_ok {
        return Err(Error::config(format!(
            "line {line_no}: `{addr}` is not a host:port address"
        )));
    }
    Ok(ConnectPeer {
        name: name.to_owned(),
        addr: addr.to_owned(),
    })
}
