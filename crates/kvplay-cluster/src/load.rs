//! Load generators: concurrent put bursts and the watch demo.
//!
//! Both open a single connection to the target member and spread their
//! work across a small pool of logical clients sharing it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, bounded};
use crate::error::{ClusterError, ClusterResult};
use crate::kv::{KvClient, KvConnection, WatchStream};
use crate::stream::{LogStream, emit};

/// Key every watch-demo watcher subscribes to.
pub const WATCH_KEY: &str = "foo";

/// Timing of a completed stress burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressReport {
    pub requests: usize,
    pub clients: usize,
    pub elapsed: Duration,
    /// `elapsed` divided by `requests`; zero for an empty burst.
    pub per_request: Duration,
}

fn random_string(rng: &mut impl Rng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl Cluster {
    /// Fire `n` concurrent puts with random keys through one member.
    ///
    /// The first failing put ends the burst with its error; puts still in
    /// flight are abandoned. The whole burst is bounded by the stress
    /// timeout regardless of `n`.
    pub async fn stress(
        &self,
        name: &str,
        n: usize,
        stream_ids: &[String],
    ) -> ClusterResult<StressReport> {
        match tokio::time::timeout(self.options().stress_timeout, self.run_stress(name, n, stream_ids))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(node = %name, requests = n, "stress timed out");
                Err(ClusterError::Timeout("stress".into()))
            }
        }
    }

    async fn run_stress(&self, name: &str, n: usize, stream_ids: &[String]) -> ClusterResult<StressReport> {
        let (name, endpoint) = self.resolve_target(name)?;
        let endpoints = [endpoint];
        let targets = self.targets(&name, stream_ids).await;

        let conn = self.connect(&endpoints).await?;
        let result = self.burst(&conn, n, &targets).await;
        conn.close().await;
        let report = result?;

        emit(
            &targets,
            format!(
                "[STRESS] Done! Took {:?} for {} requests({:?} per each), {} client(s) (endpoints: {endpoints:?})",
                report.elapsed, report.requests, report.per_request, report.clients
            ),
        )
        .await;
        info!(node = %name, requests = n, elapsed = ?report.elapsed, "stress done");
        Ok(report)
    }

    async fn burst(
        &self,
        conn: &Arc<dyn KvConnection>,
        n: usize,
        targets: &[LogStream],
    ) -> ClusterResult<StressReport> {
        let clients = self.options().clients_per_connection.max(1);
        let pool: Vec<Arc<dyn KvClient>> = (0..clients).map(|_| conn.client()).collect();
        let request_timeout = self.options().request_timeout;

        let work: Vec<(usize, String, String)> = {
            let mut rng = rand::thread_rng();
            (0..n)
                .map(|i| {
                    let key = format!("sample_{i}_{}", random_string(&mut rng, 5));
                    let val = random_string(&mut rng, 5);
                    (i, key, val)
                })
                .collect()
        };
        let picks: Vec<usize> = {
            let mut rng = rand::thread_rng();
            (0..n).map(|_| rng.gen_range(0..pool.len())).collect()
        };

        let st = Instant::now();
        let mut puts = JoinSet::new();
        for ((i, key, val), pick) in work.into_iter().zip(picks) {
            let client = pool[pick].clone();
            let targets = targets.to_vec();
            puts.spawn(async move {
                bounded("stress put", request_timeout, client.put(&key, &val)).await?;
                emit(&targets, format!("[STRESS PUT {i:2}] {key:?} : {val:?}")).await;
                Ok::<_, ClusterError>(())
            });
        }

        let mut done = 0;
        while let Some(joined) = puts.join_next().await {
            match joined {
                Ok(Ok(())) => done += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, done, requests = n, "stress put failed");
                    return Err(e);
                }
                Err(e) => {
                    return Err(ClusterError::Panicked {
                        op: "Stress",
                        node: "<task>".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        debug!(done, "stress puts completed");

        let elapsed = st.elapsed();
        let per_request = u32::try_from(n)
            .ok()
            .and_then(|n| elapsed.checked_div(n))
            .unwrap_or_default();
        Ok(StressReport {
            requests: n,
            clients,
            elapsed,
            per_request,
        })
    }

    /// Open `watchers` watches on [`WATCH_KEY`], trigger them with one put,
    /// and report what each watcher saw.
    ///
    /// Only the triggering put's error is returned. Every opened watch is
    /// cancelled before returning.
    pub async fn watch_put(&self, name: &str, watchers: usize, stream_ids: &[String]) -> ClusterResult<()> {
        let (name, endpoint) = self.resolve_target(name)?;
        let endpoints = [endpoint];
        let targets = self.targets(&name, stream_ids).await;

        let conn = self.connect(&endpoints).await?;
        let clients = self.options().clients_per_connection.max(1);
        let pool: Vec<Arc<dyn KvClient>> = (0..clients).map(|_| conn.client()).collect();

        let mut streams = Vec::with_capacity(watchers);
        for _ in 0..watchers {
            let pick = rand::thread_rng().gen_range(0..pool.len());
            match bounded("watch", self.options().request_timeout, pool[pick].watch(WATCH_KEY)).await {
                Ok(stream) => streams.push(stream),
                Err(e) => warn!(node = %name, error = %e, "opening watch failed"),
            }
        }

        let result = self.trigger(&conn, &mut streams, &targets).await;

        emit(
            &targets,
            format!("[WatchPut] Closing all watchers! (endpoints: {endpoints:?})"),
        )
        .await;
        for stream in &streams {
            stream.cancel();
        }
        drop(streams);
        conn.close().await;
        result
    }

    async fn trigger(
        &self,
        conn: &Arc<dyn KvConnection>,
        streams: &mut [WatchStream],
        targets: &[LogStream],
    ) -> ClusterResult<()> {
        emit(targets, "[PUT] Triggers watch...").await;
        let client = conn.client();
        bounded("put", self.options().request_timeout, client.put(WATCH_KEY, "bar")).await?;

        let st = Instant::now();
        let wait = self.options().watch_timeout;
        join_all(streams.iter_mut().map(|stream| async move {
            match tokio::time::timeout(wait, stream.next()).await {
                Ok(Some(resp)) => {
                    emit(targets, format!("[Watch revision] {}", resp.revision)).await;
                    for ev in resp.events {
                        emit(
                            targets,
                            format!("[{}] {:?} : {:?}", ev.kind, ev.kv.key, ev.kv.value),
                        )
                        .await;
                    }
                }
                Ok(None) => emit(targets, "watcher unexpectedly closed").await,
                Err(_) => emit(targets, "watch timed out").await,
            }
        }))
        .await;

        emit(targets, format!("[Watch] Done! Took {:?}!", st.elapsed())).await;
        Ok(())
    }
}
