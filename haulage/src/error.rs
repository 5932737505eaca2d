use std::net::IpAddr;

/// Errors returned by the persistence gateway (C4).
///
/// Every gateway operation funnels its backend failures through this type so
/// callers (C2, C3, C5) can match on the disposition table in the spec
/// without needing to know anything about the underlying driver.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no static IP mapping for {0}")]
    NotFound(IpAddr),

    #[error("data loss: unable to commit after {attempts} attempts")]
    TransactionLost { attempts: u32 },

    #[error("backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Errors returned by the packet-filter effector (C6).
#[derive(Debug, thiserror::Error)]
pub enum EffectorError {
    #[error("enable_block({0}) failed: {1}")]
    EnableFailed(IpAddr, String),

    #[error("disable_block({0}) failed: {1}")]
    DisableFailed(IpAddr, String),

    #[error("probe({0}) failed: {1}")]
    ProbeFailed(IpAddr, String),
}

/// Fatal startup errors — these abort the process (§7).
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open capture source: {0}")]
    CaptureOpen(String),

    #[error("failed to reach persistence backend: {0}")]
    Backend(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid CIDR or IP address {0:?}")]
    InvalidCidr(String),
}
