//! Cluster error types.

use std::time::Duration;

use thiserror::Error;

/// Lifecycle event a cool-down is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Restart,
    Terminate,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LifecycleEvent::Restart => "restarted",
            LifecycleEvent::Terminate => "terminated",
        })
    }
}

/// Errors reported by the key-value client capability.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("watch closed unexpectedly")]
    WatchClosed,

    #[error("metrics scrape failed: {0}")]
    Metrics(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur during cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0} does not exist")]
    NotFound(String),

    #[error("{0} is already running or requested to restart")]
    AlreadyActive(String),

    #[error("{0} is already terminated or requested to terminate")]
    NotActive(String),

    #[error("{0} is still running; terminate it before cleaning")]
    StillActive(String),

    #[error("somebody {event} {node} only {elapsed:?} ago, retry in {required:?}")]
    TooSoon {
        node: String,
        event: LifecycleEvent,
        elapsed: Duration,
        required: Duration,
    },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("no leader found")]
    NoLeaderFound,

    #[error("no active node")]
    NoActiveNode,

    #[error("{0} timed out")]
    Timeout(String),

    #[error("{failed} of {total} failed, last error: {last}")]
    PartialFailure {
        failed: usize,
        total: usize,
        last: Box<ClusterError>,
    },

    #[error("{op} {node}: panic ({message})")]
    Panicked {
        op: &'static str,
        node: String,
        message: String,
    },

    #[error("{node}: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<ClusterError>,
    },

    #[error("key-value client error: {0}")]
    Kv(#[from] KvError),

    #[error("agent error: {0}")]
    Agent(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] kvplay_core::ConfigError),
}

impl ClusterError {
    /// Attach the node name to an error raised while acting on it.
    pub(crate) fn on_node(self, node: &str) -> Self {
        ClusterError::Node {
            node: node.to_string(),
            source: Box::new(self),
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
