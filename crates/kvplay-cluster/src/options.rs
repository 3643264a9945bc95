//! Engine tunables.

use std::time::Duration;

use kvplay_core::{ClusterConfig, ConfigResult};

use crate::stream::{DEFAULT_STREAM_CAPACITY, LineStyle};

/// Timeouts, pool sizes, and lifecycle policy for a [`Cluster`](crate::Cluster).
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Minimum gap between restart/terminate events on one node.
    pub limit_interval: Duration,
    /// Bound on opening a key-value connection.
    pub dial_timeout: Duration,
    /// Bound on each individual key-value request.
    pub request_timeout: Duration,
    /// Hard bound on each status sub-query, over `request_timeout`.
    pub probe_deadline: Duration,
    /// Bound on a whole stress burst.
    pub stress_timeout: Duration,
    /// How long each watcher waits for the triggering event.
    pub watch_timeout: Duration,
    /// Logical clients sharing one connection in load generators.
    pub clients_per_connection: usize,
    pub stream_capacity: usize,
    /// Forward child stdout/stderr to the shared stream.
    pub live_log: bool,
    /// Force-kill a terminated process that outlives this grace period.
    pub kill_grace: Option<Duration>,
    pub line_style: LineStyle,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            limit_interval: Duration::ZERO,
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            probe_deadline: Duration::from_secs(5),
            stress_timeout: Duration::from_secs(5),
            watch_timeout: Duration::from_secs(3),
            clients_per_connection: 10,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            live_log: false,
            kill_grace: None,
            line_style: LineStyle::Html,
        }
    }
}

impl ClusterOptions {
    /// Options carried by a `cluster.toml`, defaults for the rest.
    pub fn from_config(config: &ClusterConfig) -> ConfigResult<Self> {
        Ok(Self {
            limit_interval: config.limit_interval()?,
            live_log: config.live_log,
            kill_grace: config.kill_grace()?,
            ..Self::default()
        })
    }

    pub fn with_limit_interval(mut self, d: Duration) -> Self {
        self.limit_interval = d;
        self
    }

    pub fn with_request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = d;
        self
    }

    pub fn with_probe_deadline(mut self, d: Duration) -> Self {
        self.probe_deadline = d;
        self
    }

    pub fn with_stress_timeout(mut self, d: Duration) -> Self {
        self.stress_timeout = d;
        self
    }

    pub fn with_watch_timeout(mut self, d: Duration) -> Self {
        self.watch_timeout = d;
        self
    }

    pub fn with_live_log(mut self, on: bool) -> Self {
        self.live_log = on;
        self
    }

    pub fn with_kill_grace(mut self, grace: Option<Duration>) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_line_style(mut self, style: LineStyle) -> Self {
        self.line_style = style;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_bounds() {
        let o = ClusterOptions::default();
        assert_eq!(o.request_timeout, Duration::from_secs(3));
        assert_eq!(o.probe_deadline, Duration::from_secs(5));
        assert_eq!(o.stress_timeout, Duration::from_secs(5));
        assert_eq!(o.clients_per_connection, 10);
        assert_eq!(o.stream_capacity, 5000);
        assert!(o.kill_grace.is_none());
    }

    #[test]
    fn from_config_reads_policy() {
        let config = ClusterConfig::from_toml_str(
            "program = \"/bin/etcd\"\nlimit_interval = \"100ms\"\nlive_log = true\nkill_grace = \"2s\"\n",
        )
        .unwrap();
        let o = ClusterOptions::from_config(&config).unwrap();
        assert_eq!(o.limit_interval, Duration::from_millis(100));
        assert!(o.live_log);
        assert_eq!(o.kill_grace, Some(Duration::from_secs(2)));
        assert_eq!(o.dial_timeout, Duration::from_secs(5));
    }
}
