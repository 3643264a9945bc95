//! Cluster registry and lifecycle orchestration.
//!
//! The [`Cluster`] owns every [`Node`], the shared log stream, and the
//! named streams. Single-node operations delegate by name; bootstrap,
//! shutdown, and revive fan out across all members.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use kvplay_core::config::combine;
use kvplay_core::{ClusterConfig, ConfigError, NodeConfig};

use crate::agent::Agent;
use crate::error::{ClusterError, ClusterResult, KvResult};
use crate::kv::{HttpMetricsScraper, KvConnection, KvConnector, MetricsScraper};
use crate::node::{LocalNode, Node, RemoteNode};
use crate::options::ClusterOptions;
use crate::stream::{LineTagger, LogStream, Streams};

/// Lifecycle operation applied to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleOp {
    Start,
    Restart,
    Terminate,
    Clean,
}

impl LifecycleOp {
    fn as_str(self) -> &'static str {
        match self {
            LifecycleOp::Start => "Start",
            LifecycleOp::Restart => "Restart",
            LifecycleOp::Terminate => "Terminate",
            LifecycleOp::Clean => "Clean",
        }
    }

    async fn run(self, node: &dyn Node) -> ClusterResult<()> {
        match self {
            LifecycleOp::Start => node.start().await,
            LifecycleOp::Restart => node.restart().await,
            LifecycleOp::Terminate => node.terminate().await,
            LifecycleOp::Clean => node.clean().await,
        }
    }
}

/// Run `op` on `node`, turning a panic into a shared-stream line and an error.
pub(crate) async fn invoke(
    shared: &LogStream,
    node: &Arc<dyn Node>,
    op: LifecycleOp,
) -> ClusterResult<()> {
    let name = node.name();
    match AssertUnwindSafe(op.run(node.as_ref())).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(node = %name, op = op.as_str(), %message, "lifecycle operation panicked");
            shared
                .send(format!("{} {name}: panic ({message})", op.as_str()))
                .await;
            Err(ClusterError::Panicked {
                op: op.as_str(),
                node: name.to_string(),
                message,
            })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bound a key-value call, mapping expiry to [`ClusterError::Timeout`].
pub(crate) async fn bounded<T>(
    what: &str,
    limit: Duration,
    fut: impl Future<Output = KvResult<T>>,
) -> ClusterResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ClusterError::Timeout(what.to_string())),
    }
}

/// Connector and scraper used for every key-value interaction.
#[derive(Clone)]
pub(crate) struct KvBackend {
    pub(crate) connector: Arc<dyn KvConnector>,
    pub(crate) scraper: Arc<dyn MetricsScraper>,
}

/// Builds a [`Cluster`] from member configs.
///
/// Members are local child processes unless agents are supplied, in
/// which case every member is driven through its agent.
pub struct ClusterBuilder {
    members: Vec<NodeConfig>,
    program: PathBuf,
    options: ClusterOptions,
    agents: Option<Vec<Arc<dyn Agent>>>,
    connector: Option<Arc<dyn KvConnector>>,
    scraper: Option<Arc<dyn MetricsScraper>>,
}

impl ClusterBuilder {
    pub fn new(members: Vec<NodeConfig>) -> Self {
        Self {
            members,
            program: PathBuf::new(),
            options: ClusterOptions::default(),
            agents: None,
            connector: None,
            scraper: None,
        }
    }

    /// Members, program, and policy from a `cluster.toml`.
    pub fn from_config(config: ClusterConfig) -> ClusterResult<Self> {
        let options = ClusterOptions::from_config(&config)?;
        Ok(Self::new(config.members)
            .with_program(config.program)
            .with_options(options))
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_options(mut self, options: ClusterOptions) -> Self {
        self.options = options;
        self
    }

    /// Drive members through agents, one per member in order.
    pub fn with_agents(mut self, agents: Vec<Arc<dyn Agent>>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_kv(mut self, connector: Arc<dyn KvConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_metrics_scraper(mut self, scraper: Arc<dyn MetricsScraper>) -> Self {
        self.scraper = Some(scraper);
        self
    }

    /// Validate the members and create one node per member.
    ///
    /// Fails before any process is launched.
    pub fn build(mut self) -> ClusterResult<Cluster> {
        let remote = self.agents.is_some();
        if let Some(agents) = &self.agents {
            if agents.len() != self.members.len() {
                return Err(ConfigError::Invalid(format!(
                    "agent count must match member count ({} != {})",
                    agents.len(),
                    self.members.len()
                ))
                .into());
            }
        }
        combine(&mut self.members, remote)?;
        if !remote && self.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("no program configured".into()).into());
        }

        let streams = Arc::new(Streams::new(self.options.stream_capacity));
        let width = self.members.iter().map(|m| m.name.len()).max().unwrap_or(0);

        let mut nodes: BTreeMap<String, Arc<dyn Node>> = BTreeMap::new();
        for (i, member) in self.members.into_iter().enumerate() {
            let name = member.name.clone();
            let node: Arc<dyn Node> = match &self.agents {
                Some(agents) => Arc::new(RemoteNode::new(member, agents[i].clone(), &self.options)),
                None => {
                    let tagger = LineTagger::new(&name, width, i, self.options.line_style);
                    Arc::new(LocalNode::new(
                        member,
                        self.program.clone(),
                        streams.shared().clone(),
                        tagger,
                        &self.options,
                    ))
                }
            };
            nodes.insert(name, node);
        }

        let kv = self.connector.map(|connector| KvBackend {
            connector,
            scraper: self
                .scraper
                .unwrap_or_else(|| Arc::new(HttpMetricsScraper::default())),
        });

        let (shutdown_tx, _) = watch::channel(false);
        info!(members = nodes.len(), remote, "cluster created");
        Ok(Cluster {
            nodes,
            streams,
            kv,
            options: self.options,
            background: Mutex::new(Vec::new()),
            rollbacks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }
}

/// A set of member nodes and their log streams.
pub struct Cluster {
    nodes: BTreeMap<String, Arc<dyn Node>>,
    streams: Arc<Streams>,
    kv: Option<KvBackend>,
    options: ClusterOptions,
    /// Reviver tasks, aborted on close.
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Bootstrap rollbacks, awaited on close.
    rollbacks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Cluster {
    pub fn builder(members: Vec<NodeConfig>) -> ClusterBuilder {
        ClusterBuilder::new(members)
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Member names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> ClusterResult<&Arc<dyn Node>> {
        self.nodes
            .get(name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    pub fn is_active(&self, name: &str) -> ClusterResult<bool> {
        Ok(self.node(name)?.is_active())
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Arc<dyn Node>> {
        self.nodes.values()
    }

    /// The broadcast stream drained by the presentation layer.
    pub fn shared_stream(&self) -> LogStream {
        self.streams.shared().clone()
    }

    /// The named stream for `id`, created on first use.
    pub async fn stream(&self, id: &str) -> LogStream {
        self.streams.named(id).await
    }

    /// Route `msg` for node `name` to the node's own stream, or to each
    /// named stream when ids are given.
    pub async fn write(&self, name: &str, msg: &str, stream_ids: &[String]) -> ClusterResult<()> {
        let node = self.node(name)?;
        if stream_ids.is_empty() {
            let stream = node.message_stream().ok_or_else(|| {
                ClusterError::UnsupportedOperation(format!(
                    "{name} does not accept messages without a stream id"
                ))
            })?;
            stream.send(msg).await;
            return Ok(());
        }
        for id in stream_ids {
            self.streams.named(id).await.send(msg).await;
        }
        Ok(())
    }

    /// Streams that progress lines for `name` should go to.
    pub(crate) async fn targets(&self, name: &str, stream_ids: &[String]) -> Vec<LogStream> {
        if stream_ids.is_empty() {
            return self
                .nodes
                .get(name)
                .and_then(|n| n.message_stream())
                .cloned()
                .into_iter()
                .collect();
        }
        let mut targets = Vec::with_capacity(stream_ids.len());
        for id in stream_ids {
            targets.push(self.streams.named(id).await);
        }
        targets
    }

    async fn apply(&self, name: &str, op: LifecycleOp) -> ClusterResult<()> {
        let node = self.node(name)?;
        invoke(self.streams.shared(), node, op).await
    }

    pub async fn start(&self, name: &str) -> ClusterResult<()> {
        self.apply(name, LifecycleOp::Start).await
    }

    pub async fn restart(&self, name: &str) -> ClusterResult<()> {
        self.apply(name, LifecycleOp::Restart).await
    }

    pub async fn terminate(&self, name: &str) -> ClusterResult<()> {
        self.apply(name, LifecycleOp::Terminate).await
    }

    pub async fn clean(&self, name: &str) -> ClusterResult<()> {
        self.apply(name, LifecycleOp::Clean).await
    }

    /// Start every node concurrently.
    ///
    /// Returns the first failure as soon as it arrives. Starts still in
    /// flight are handed to a rollback task that terminates whatever
    /// came up.
    pub async fn start_all(&self) -> ClusterResult<()> {
        let mut starts = JoinSet::new();
        for node in self.nodes.values() {
            let node = node.clone();
            let shared = self.streams.shared().clone();
            starts.spawn(async move {
                let result = invoke(&shared, &node, LifecycleOp::Start).await;
                (node.name().to_string(), result)
            });
        }

        while let Some(joined) = starts.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((name, Err(e))) => e.on_node(&name),
                Err(e) => ClusterError::Panicked {
                    op: "Start",
                    node: "<task>".to_string(),
                    message: e.to_string(),
                },
            };
            error!(error = %err, "bootstrap failed");
            self.spawn_rollback(starts);
            return Err(err);
        }

        info!(members = self.nodes.len(), "all members started");
        Ok(())
    }

    fn spawn_rollback(&self, mut pending: JoinSet<(String, ClusterResult<()>)>) {
        let nodes: Vec<_> = self.nodes.values().cloned().collect();
        let shared = self.streams.shared().clone();
        let handle = tokio::spawn(async move {
            while pending.join_next().await.is_some() {}
            for node in nodes.iter().filter(|n| n.is_active()) {
                match invoke(&shared, node, LifecycleOp::Terminate).await {
                    Ok(()) => info!(node = %node.name(), "rolled back after failed bootstrap"),
                    Err(e) => warn!(node = %node.name(), error = %e, "rollback terminate failed"),
                }
            }
        });
        let mut rollbacks = self.rollbacks.lock().unwrap_or_else(PoisonError::into_inner);
        rollbacks.retain(|h| !h.is_finished());
        rollbacks.push(handle);
    }

    /// Start every node, wait for `interrupt`, then shut down.
    pub async fn bootstrap(&self, interrupt: impl Future<Output = ()>) -> ClusterResult<()> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        self.start_all().await?;
        interrupt.await;
        info!("interrupt received, shutting down");
        self.shutdown().await
    }

    /// Terminate and clean every node concurrently.
    ///
    /// Per-node failures are logged; this always succeeds once every
    /// node has been handled.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let mut workers = JoinSet::new();
        for node in self.nodes.values() {
            let node = node.clone();
            let shared = self.streams.shared().clone();
            workers.spawn(async move {
                if let Err(e) = invoke(&shared, &node, LifecycleOp::Terminate).await {
                    warn!(node = %node.name(), error = %e, "terminate failed during shutdown");
                }
                if let Err(e) = invoke(&shared, &node, LifecycleOp::Clean).await {
                    warn!(node = %node.name(), error = %e, "clean failed during shutdown");
                }
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "shutdown worker failed");
            }
        }
        info!(members = self.nodes.len(), "cluster shut down");
        Ok(())
    }

    /// Restart every node in name order, but only if none is active.
    pub async fn revive(&self) -> ClusterResult<()> {
        if self.nodes.values().any(|n| n.is_active()) {
            return Ok(());
        }
        info!("no member is active, reviving cluster");
        for node in self.nodes.values() {
            invoke(self.streams.shared(), node, LifecycleOp::Restart)
                .await
                .map_err(|e| e.on_node(node.name()))?;
        }
        Ok(())
    }

    /// Call [`Cluster::revive`] every `interval` until [`Cluster::close`].
    pub fn spawn_reviver(self: &Arc<Self>, interval: Duration) {
        let cluster: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(strong) = cluster.upgrade() else { break };
                        if let Err(e) = strong.revive().await {
                            warn!(error = %e, "revive failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("reviver shutting down");
                        break;
                    }
                }
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Stop every background task owned by the cluster and its nodes.
    ///
    /// Pending bootstrap rollbacks run to completion first, so no member
    /// started by a failed bootstrap outlives the call.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        let rollbacks: Vec<_> = self
            .rollbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in rollbacks {
            if let Err(e) = handle.await {
                error!(error = %e, "bootstrap rollback failed");
            }
        }
        for node in self.nodes.values() {
            node.close().await;
        }
        debug!("cluster background tasks stopped");
    }

    /// Sorted endpoints of active nodes, plus every node's endpoint by name.
    pub fn endpoints(&self) -> (Vec<String>, BTreeMap<String, String>) {
        let mut active = Vec::new();
        let mut by_name = BTreeMap::new();
        for (name, node) in &self.nodes {
            let endpoint = node.endpoint();
            if !endpoint.is_empty() && node.is_active() {
                active.push(endpoint.clone());
            }
            by_name.insert(name.clone(), endpoint);
        }
        active.sort();
        (active, by_name)
    }

    /// Name of the current leader according to the membership API.
    pub async fn leader(&self) -> ClusterResult<String> {
        let (endpoints, _) = self.endpoints();
        if endpoints.is_empty() {
            return Err(ClusterError::NoActiveNode);
        }
        let conn = self.connect(&endpoints).await?;
        let members = bounded("member list", self.options.request_timeout, conn.member_list()).await;
        conn.close().await;

        let leader = members?
            .into_iter()
            .find(|m| m.is_leader)
            .ok_or(ClusterError::NoLeaderFound)?;
        if self.nodes.contains_key(&leader.name) {
            Ok(leader.name)
        } else {
            Err(ClusterError::NoLeaderFound)
        }
    }

    pub(crate) fn kv(&self) -> ClusterResult<&KvBackend> {
        self.kv.as_ref().ok_or_else(|| {
            ClusterError::UnsupportedOperation("no key-value client configured".into())
        })
    }

    pub(crate) async fn connect(&self, endpoints: &[String]) -> ClusterResult<Arc<dyn KvConnection>> {
        let kv = self.kv()?;
        let dial = self.options.dial_timeout;
        bounded("connect", dial, kv.connector.connect(endpoints, dial)).await
    }

    /// Node to send a request to: `name`, or a random active node when empty.
    pub(crate) fn resolve_target(&self, name: &str) -> ClusterResult<(String, String)> {
        if name.is_empty() {
            let active: Vec<_> = self.nodes.values().filter(|n| n.is_active()).collect();
            let node = active
                .choose(&mut rand::thread_rng())
                .ok_or(ClusterError::NoActiveNode)?;
            return Ok((node.name().to_string(), node.endpoint()));
        }
        let node = self.node(name)?;
        Ok((name.to_string(), node.endpoint()))
    }
}

// Rollback handles are detached on drop; they own clones of the nodes.
impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.background.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            handle.abort();
        }
    }
}
