//! Validated configuration surface consumed by the server and client
//! engines (C8, spec §6).
//!
//! Loading these from a file, environment, or CLI is out of scope
//! (spec §1 lists "configuration loading, CLI wrapping" as external
//! collaborators) — this module only defines the struct and its
//! invariants. None of the timing knobs default; spec §9's Open
//! Questions calls out that the source hard-codes values like
//! `MaxAcceptedMessages` and says to require them explicitly instead of
//! guessing constants (see SPEC_FULL.md section E.3).

use std::time::Duration;

use crate::{envelope::SharedKey, error::ConfigError, membership::Endpoint};

/// A configured server: either a literal endpoint, or a DNS name plus
/// port re-resolved on an interval (spec §4.6 "Configured servers").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Literal(Endpoint),
    Named { host: String, port: u16 },
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(endpoint) => write!(f, "{endpoint}"),
            Self::Named { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub network_binding: Endpoint,
    pub socket_buffer_size: usize,
    /// Peer servers gossiped to on every tick, spec §4.5 step 2.
    /// Servers address each other by literal endpoint only; DNS
    /// resolution is a client-only concern (spec §4.6).
    pub peers: Vec<Endpoint>,
    pub shared_key: SharedKey,
    pub message_ttl: Duration,
    pub bk_task_interval: Duration,
    pub cluster_keepalive_interval: Duration,
    pub server_ttl: Duration,
    pub client_ttl: Duration,
}

impl ServerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("message_ttl", self.message_ttl)?;
        require_positive("bk_task_interval", self.bk_task_interval)?;
        require_positive("cluster_keepalive_interval", self.cluster_keepalive_interval)?;
        require_positive("server_ttl", self.server_ttl)?;
        require_positive("client_ttl", self.client_ttl)?;
        if self.shared_key.is_empty() {
            return Err(ConfigError::EmptySharedKey);
        }
        if self.cluster_keepalive_interval >= self.server_ttl {
            return Err(ConfigError::KeepaliveNotBelowServerTtl {
                keepalive: self.cluster_keepalive_interval,
                ttl: self.server_ttl,
            });
        }
        if self.bk_task_interval > self.cluster_keepalive_interval
            || self.bk_task_interval > self.server_ttl
            || self.bk_task_interval > self.client_ttl
        {
            return Err(ConfigError::TickCoarserThanInterval {
                tick: self.bk_task_interval,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub network_binding: Endpoint,
    pub socket_buffer_size: usize,
    pub servers: Vec<ServerAddr>,
    pub shared_key: SharedKey,
    pub message_ttl: Duration,
    pub bk_task_interval: Duration,
    pub keepalive_interval: Duration,
    pub server_resolve_interval: Duration,
    pub broadcast_group: u32,
}

impl ClientSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("message_ttl", self.message_ttl)?;
        require_positive("bk_task_interval", self.bk_task_interval)?;
        require_positive("keepalive_interval", self.keepalive_interval)?;
        require_positive("server_resolve_interval", self.server_resolve_interval)?;
        if self.shared_key.is_empty() {
            return Err(ConfigError::EmptySharedKey);
        }
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.bk_task_interval > self.keepalive_interval
            || self.bk_task_interval > self.server_resolve_interval
        {
            return Err(ConfigError::TickCoarserThanInterval {
                tick: self.bk_task_interval,
            });
        }
        Ok(())
    }
}

fn require_positive(field: &'static str, duration: Duration) -> Result<(), ConfigError> {
    if duration.is_zero() {
        Err(ConfigError::NotPositive { field })
    } else {
        Ok(())
    }
}
