//! Remote process agent capability.
//!
//! An agent runs next to a member process on another machine and
//! starts, restarts, stops, and cleans it on request. The transport is
//! owned by the implementation; the engine only sees this trait.

use async_trait::async_trait;

/// Controls one member process on a remote host.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Launch the process with the given arguments; returns its id.
    async fn start(&self, args: &[String]) -> anyhow::Result<u32>;

    /// Relaunch the process with its previous arguments.
    async fn restart(&self) -> anyhow::Result<u32>;

    /// Stop the process.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Remove the process's data.
    async fn cleanup(&self) -> anyhow::Result<()>;
}
