//! Agent-controlled member.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use kvplay_core::{InitialClusterState, NodeConfig};

use super::{Lifecycle, Node};
use crate::agent::Agent;
use crate::error::ClusterResult;
use crate::options::ClusterOptions;

/// A member whose process runs on another host behind an [`Agent`].
pub struct RemoteNode {
    config: NodeConfig,
    agent: Arc<dyn Agent>,
    lifecycle: Lifecycle,
}

impl RemoteNode {
    pub fn new(config: NodeConfig, agent: Arc<dyn Agent>, options: &ClusterOptions) -> Self {
        let lifecycle = Lifecycle::new(&config.name, options.limit_interval);
        Self {
            config,
            agent,
            lifecycle,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

#[async_trait]
impl Node for RemoteNode {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn endpoint(&self) -> String {
        self.config.grpc_addr.clone().unwrap_or_default()
    }

    fn status_endpoint(&self) -> String {
        self.config.client_url().unwrap_or_default().to_string()
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    async fn start(&self) -> ClusterResult<()> {
        let transition = self.lifecycle.begin_start()?;
        let state = if self.lifecycle.snapshot().rejoin {
            InitialClusterState::Existing
        } else {
            self.config.initial_cluster_state
        };
        let args = self.config.to_args(state);
        let pid = self.agent.start(&args).await?;
        transition.started(Some(pid));
        info!(node = %self.config.name, pid, "remote member started");
        Ok(())
    }

    async fn restart(&self) -> ClusterResult<()> {
        let transition = self.lifecycle.begin_restart()?;
        let pid = self.agent.restart().await?;
        transition.restarted(Some(pid));
        info!(node = %self.config.name, pid, "remote member restarted");
        Ok(())
    }

    async fn terminate(&self) -> ClusterResult<()> {
        let (transition, _) = self.lifecycle.begin_terminate()?;
        self.agent.stop().await?;
        transition.terminated();
        info!(node = %self.config.name, "remote member stopped");
        Ok(())
    }

    async fn clean(&self) -> ClusterResult<()> {
        let transition = self.lifecycle.begin_clean()?;
        self.agent.cleanup().await?;
        transition.cleaned();
        info!(node = %self.config.name, "remote member cleaned");
        Ok(())
    }
}
