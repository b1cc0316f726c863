//! Fatal error kinds (§7 ConfigFail / BindFail). ParseFail and SendFail
//! never reach here — they are absorbed at the point of occurrence
//! (see `envelope::EnvelopeError` and `transport::send_logged`).

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("cluster_keepalive_interval ({keepalive:?}) must be less than server_ttl ({ttl:?}), or peers will always appear expired")]
    KeepaliveNotBelowServerTtl { keepalive: Duration, ttl: Duration },
    #[error("bk_task_interval ({tick:?}) must be no greater than every other interval, or ticks would miss their own deadlines")]
    TickCoarserThanInterval { tick: Duration },
    #[error("server list must not be empty")]
    NoServers,
    #[error("shared_key must not be empty")]
    EmptySharedKey,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
