//! Cluster configuration: `cluster.toml` parsing, validation, and
//! per-member flag generation.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Whether a member bootstraps a new cluster or rejoins an existing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialClusterState {
    #[default]
    New,
    Existing,
}

impl InitialClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitialClusterState::New => "new",
            InitialClusterState::Existing => "existing",
        }
    }
}

impl fmt::Display for InitialClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_token() -> String {
    "kvplay-cluster".to_string()
}

/// Immutable configuration of a single cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub listen_client_urls: Vec<String>,
    #[serde(default)]
    pub advertise_client_urls: Vec<String>,
    #[serde(default)]
    pub listen_peer_urls: Vec<String>,
    #[serde(default)]
    pub initial_advertise_peer_urls: Vec<String>,
    #[serde(default = "default_token")]
    pub initial_cluster_token: String,
    #[serde(default)]
    pub initial_cluster_state: InitialClusterState,
    /// Filled in by [`ClusterConfig::combine`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initial_cluster: String,
    /// RPC address used by agent-controlled members.
    #[serde(default)]
    pub grpc_addr: Option<String>,
}

impl NodeConfig {
    /// A member listening on one client URL and one peer URL.
    pub fn new(
        name: &str,
        data_dir: impl Into<PathBuf>,
        client_url: &str,
        peer_url: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            data_dir: data_dir.into(),
            listen_client_urls: vec![client_url.to_string()],
            advertise_client_urls: vec![client_url.to_string()],
            listen_peer_urls: vec![peer_url.to_string()],
            initial_advertise_peer_urls: vec![peer_url.to_string()],
            initial_cluster_token: default_token(),
            initial_cluster_state: InitialClusterState::New,
            initial_cluster: String::new(),
            grpc_addr: None,
        }
    }

    /// Set the RPC address used by agent-controlled members.
    pub fn with_grpc_addr(mut self, addr: &str) -> Self {
        self.grpc_addr = Some(addr.to_string());
        self
    }

    /// The first listen client URL, e.g. `http://localhost:2379`.
    pub fn client_url(&self) -> Option<&str> {
        self.listen_client_urls.first().map(String::as_str)
    }

    /// `host:port` of the first listen client URL.
    pub fn client_host(&self) -> Option<String> {
        let url = self.client_url()?;
        let uri: http::Uri = url.parse().ok()?;
        uri.authority().map(|a| a.as_str().to_string())
    }

    fn peer_url(&self) -> Option<&str> {
        self.initial_advertise_peer_urls
            .first()
            .or_else(|| self.listen_peer_urls.first())
            .map(String::as_str)
    }

    /// Render the member's process arguments.
    ///
    /// `state` overrides the configured initial cluster state; restarts
    /// pass [`InitialClusterState::Existing`] so the process rejoins.
    pub fn to_args(&self, state: InitialClusterState) -> Vec<String> {
        let mut args = vec![
            format!("--name={}", self.name),
            format!("--data-dir={}", self.data_dir.display()),
            format!("--listen-client-urls={}", self.listen_client_urls.join(",")),
        ];

        let advertise = if self.advertise_client_urls.is_empty() {
            &self.listen_client_urls
        } else {
            &self.advertise_client_urls
        };
        args.push(format!("--advertise-client-urls={}", advertise.join(",")));

        if !self.listen_peer_urls.is_empty() {
            args.push(format!("--listen-peer-urls={}", self.listen_peer_urls.join(",")));
        }
        if !self.initial_advertise_peer_urls.is_empty() {
            args.push(format!(
                "--initial-advertise-peer-urls={}",
                self.initial_advertise_peer_urls.join(",")
            ));
        }
        args.push(format!("--initial-cluster-token={}", self.initial_cluster_token));
        if !self.initial_cluster.is_empty() {
            args.push(format!("--initial-cluster={}", self.initial_cluster));
        }
        args.push(format!("--initial-cluster-state={state}"));
        args
    }
}

/// Top-level `cluster.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Path of the server binary launched for local members.
    pub program: PathBuf,
    /// Minimum gap between restart/terminate events on one member.
    #[serde(default)]
    pub limit_interval: Option<String>,
    /// Forward member stdout/stderr to the shared stream.
    #[serde(default)]
    pub live_log: bool,
    /// Escalate to a forced kill when a terminated member outlives this.
    #[serde(default)]
    pub kill_grace: Option<String>,
    #[serde(rename = "member", default)]
    pub members: Vec<NodeConfig>,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parsed `limit_interval`; zero when unset.
    pub fn limit_interval(&self) -> ConfigResult<Duration> {
        match &self.limit_interval {
            Some(s) => parse_duration(s).ok_or_else(|| ConfigError::Duration(s.clone())),
            None => Ok(Duration::ZERO),
        }
    }

    /// Parsed `kill_grace`; `None` disables forced-kill escalation.
    pub fn kill_grace(&self) -> ConfigResult<Option<Duration>> {
        self.kill_grace
            .as_ref()
            .map(|s| parse_duration(s).ok_or_else(|| ConfigError::Duration(s.clone())))
            .transpose()
    }

    /// Validate the member set and fill each member's `initial_cluster`.
    ///
    /// Must succeed before any member process is created. `remote`
    /// additionally requires every member to carry a `grpc_addr`.
    pub fn combine(&mut self, remote: bool) -> ConfigResult<()> {
        combine(&mut self.members, remote)
    }
}

/// Validate a member set and derive the shared `--initial-cluster` value.
pub fn combine(members: &mut [NodeConfig], remote: bool) -> ConfigResult<()> {
    if members.is_empty() {
        return Err(ConfigError::Invalid("no members configured".into()));
    }

    let mut names = HashSet::new();
    let mut dirs = HashSet::new();
    let mut client_urls = HashSet::new();
    let mut peer_urls = HashSet::new();

    for m in members.iter() {
        if m.name.is_empty() {
            return Err(ConfigError::Invalid("member with empty name".into()));
        }
        if !names.insert(m.name.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate member name {:?}", m.name)));
        }
        if !dirs.insert(m.data_dir.as_path()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate data dir {:?} ({})",
                m.data_dir, m.name
            )));
        }
        if m.listen_client_urls.is_empty() {
            return Err(ConfigError::Invalid(format!("{} has no client URL", m.name)));
        }
        for url in &m.listen_client_urls {
            if !client_urls.insert(url.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate client URL {url}")));
            }
        }
        for url in &m.listen_peer_urls {
            if !peer_urls.insert(url.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate peer URL {url}")));
            }
        }
        if remote && m.grpc_addr.is_none() {
            return Err(ConfigError::Invalid(format!(
                "{} has no grpc_addr (required for agent-controlled members)",
                m.name
            )));
        }
    }

    let mut entries: Vec<(String, String)> = members
        .iter()
        .filter_map(|m| m.peer_url().map(|u| (m.name.clone(), u.to_string())))
        .collect();
    entries.sort();
    let initial_cluster = entries
        .iter()
        .map(|(name, url)| format!("{name}={url}"))
        .collect::<Vec<_>>()
        .join(",");

    for m in members.iter_mut() {
        m.initial_cluster = initial_cluster.clone();
    }
    Ok(())
}

/// Parse `"500ms"`, `"3s"`, `"2m"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(n) = s.strip_suffix("ms") {
        (n, Duration::from_millis)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, Duration::from_secs)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, |m| Duration::from_secs(m * 60))
    } else {
        (s, Duration::from_secs)
    };
    digits.parse::<u64>().ok().map(unit)
}
