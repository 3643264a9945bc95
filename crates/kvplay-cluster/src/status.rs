//! Best-effort cluster status.
//!
//! Every active node is probed concurrently. A probe opens its own
//! connection and runs three sequential sub-queries (membership, content
//! hash, key count), each bounded by the request timeout and a harder
//! probe deadline. A failing probe never stops the others, and every
//! node ends up in the result, as a placeholder if need be.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use kvplay_core::{MemberState, ServerStatus};

use crate::cluster::{Cluster, KvBackend, bounded};
use crate::error::{ClusterError, ClusterResult, KvResult};

/// Outcome of [`Cluster::status`].
#[derive(Debug)]
pub struct StatusReport {
    /// One entry per node, reachable or not.
    pub statuses: BTreeMap<String, ServerStatus>,
    /// Probes that failed.
    pub failed: usize,
    /// Probes that were launched.
    pub probed: usize,
    /// The last probe error observed, if any.
    pub last_error: Option<ClusterError>,
}

impl StatusReport {
    /// The statuses, or a [`ClusterError::PartialFailure`] if any probe failed.
    pub fn into_result(self) -> ClusterResult<BTreeMap<String, ServerStatus>> {
        match self.last_error {
            None => Ok(self.statuses),
            Some(last) => Err(ClusterError::PartialFailure {
                failed: self.failed,
                total: self.probed,
                last: Box::new(last),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeLimits {
    dial: Duration,
    request: Duration,
    deadline: Duration,
}

struct ProbeTarget {
    name: String,
    endpoint: String,
    status_endpoint: String,
}

impl Cluster {
    /// Probe every active node and return a snapshot covering all nodes.
    ///
    /// The report carries the last probe error alongside the statuses;
    /// a report with an error still has one entry per node.
    pub async fn status(&self) -> StatusReport {
        let (_, by_name) = self.endpoints();
        let mut statuses = BTreeMap::new();
        let mut failed = 0;
        let mut last_error = None;

        let targets: Vec<ProbeTarget> = self
            .nodes()
            .filter(|n| n.is_active())
            .map(|n| ProbeTarget {
                name: n.name().to_string(),
                endpoint: n.endpoint(),
                status_endpoint: n.status_endpoint(),
            })
            .collect();
        let probed = targets.len();

        match self.kv() {
            Ok(backend) if probed > 0 => {
                let limits = ProbeLimits {
                    dial: self.options().dial_timeout,
                    request: self.options().request_timeout,
                    deadline: self.options().probe_deadline,
                };
                let (ok_tx, mut ok_rx) = mpsc::channel::<ServerStatus>(probed);
                let (err_tx, mut err_rx) = mpsc::channel::<ClusterError>(probed);

                for target in targets {
                    let backend = backend.clone();
                    let ok_tx = ok_tx.clone();
                    let err_tx = err_tx.clone();
                    tokio::spawn(async move {
                        let name = target.name.clone();
                        match probe(backend, target, limits).await {
                            Ok(status) => {
                                let _ = ok_tx.send(status).await;
                            }
                            Err(e) => {
                                let _ = err_tx.send(e.on_node(&name)).await;
                            }
                        }
                    });
                }
                drop(ok_tx);
                drop(err_tx);

                let mut seen = 0;
                while seen < probed {
                    tokio::select! {
                        Some(status) = ok_rx.recv() => {
                            statuses.insert(status.name.clone(), status);
                        }
                        Some(err) = err_rx.recv() => {
                            warn!(error = %err, "status probe failed");
                            failed += 1;
                            last_error = Some(err);
                        }
                        else => break,
                    }
                    seen += 1;
                }
            }
            Ok(_) => {}
            Err(e) => {
                failed = probed;
                if probed > 0 {
                    last_error = Some(e);
                }
            }
        }

        for (name, endpoint) in &by_name {
            statuses
                .entry(name.clone())
                .or_insert_with(|| ServerStatus::unreachable(name, endpoint));
        }

        debug!(nodes = statuses.len(), probed, failed, "status collected");
        StatusReport {
            statuses,
            failed,
            probed,
            last_error,
        }
    }
}

/// Run one sub-query under both the request timeout and the probe deadline.
async fn step<T>(
    what: &str,
    limits: ProbeLimits,
    fut: impl Future<Output = KvResult<T>>,
) -> ClusterResult<T> {
    match tokio::time::timeout(limits.deadline, bounded(what, limits.request, fut)).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::Timeout(what.to_string())),
    }
}

async fn probe(backend: KvBackend, target: ProbeTarget, limits: ProbeLimits) -> ClusterResult<ServerStatus> {
    let endpoints = [target.endpoint.clone()];
    let conn = bounded(
        "connect",
        limits.dial,
        backend.connector.connect(&endpoints, limits.dial),
    )
    .await?;

    let mut stat = ServerStatus::unreachable(&target.name, &target.endpoint);
    let result = async {
        let members = step("member list", limits, conn.member_list()).await?;
        if let Some(m) = members.iter().find(|m| m.name == target.name) {
            stat.id = format!("{:x}", m.id);
            stat.state = if m.is_leader {
                MemberState::Leader
            } else {
                MemberState::Follower
            };
        }

        stat.hash = step("hash", limits, conn.hash()).await?;
        stat.number_of_keys = step(
            "key count",
            limits,
            backend.scraper.key_count(&target.status_endpoint),
        )
        .await?;
        Ok::<_, ClusterError>(())
    }
    .await;

    conn.close().await;
    result.map(|()| stat)
}
