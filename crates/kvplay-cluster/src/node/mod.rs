//! Member process control.
//!
//! Every member is a [`Node`]. Two variants exist: [`LocalNode`] spawns
//! the member as a child process, [`RemoteNode`] drives it through an
//! [`Agent`](crate::agent::Agent). Both share the same [`Lifecycle`]
//! bookkeeping, so the active flag, the in-flight guard, and the
//! cool-down policy behave identically.

mod lifecycle;
mod local;
mod remote;

use async_trait::async_trait;

use crate::error::ClusterResult;
use crate::stream::LogStream;

pub use lifecycle::{Lifecycle, NodeSnapshot, Transition};
pub use local::LocalNode;
pub use remote::RemoteNode;

/// Process control contract shared by all member variants.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Client RPC endpoint (`host:port`).
    fn endpoint(&self) -> String;

    /// Base URL of the member's status/metrics endpoint.
    fn status_endpoint(&self) -> String;

    fn is_active(&self) -> bool;

    /// Start the process for the first time.
    async fn start(&self) -> ClusterResult<()>;

    /// Relaunch the process so it rejoins the existing cluster.
    async fn restart(&self) -> ClusterResult<()>;

    /// Ask the process to exit.
    async fn terminate(&self) -> ClusterResult<()>;

    /// Remove the process's persistent data. Requires the node be inactive.
    async fn clean(&self) -> ClusterResult<()>;

    /// Stream that accepts free-form messages for this node, if any.
    fn message_stream(&self) -> Option<&LogStream> {
        None
    }

    /// Stop background tasks owned by the node.
    async fn close(&self) {}
}
