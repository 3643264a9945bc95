//! In-memory stand-ins for the agent and key-value capabilities.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kvplay_cluster::{
    Agent, Cluster, ClusterBuilder, ClusterOptions, EventKind, KeyValue, KvClient, KvConnection,
    KvConnector, KvError, KvResult, MemberInfo, MetricsScraper, WatchEvent, WatchFeed,
    WatchResponse, WatchStream,
};
use kvplay_core::NodeConfig;

/// Shared state behind every mock connection.
#[derive(Default)]
pub struct MockStore {
    pub data: Mutex<BTreeMap<String, String>>,
    pub members: Mutex<Vec<MemberInfo>>,
    /// Endpoints that refuse connections.
    pub down: Mutex<HashSet<String>>,
    /// Endpoints whose membership query never answers.
    pub stalled: Mutex<HashSet<String>>,
    /// Puts of keys with this prefix never complete.
    pub hang_prefix: Mutex<Option<String>>,
    /// Swallow watch events instead of delivering them.
    pub mute_watches: Mutex<bool>,
    pub feeds: tokio::sync::Mutex<Vec<(String, WatchFeed)>>,
    pub revision: AtomicI64,
    pub closed: AtomicU32,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_members(self: Arc<Self>, names: &[&str], leader: &str) -> Arc<Self> {
        *self.members.lock().unwrap() = names
            .iter()
            .enumerate()
            .map(|(i, name)| MemberInfo {
                id: 0x100 + i as u64,
                name: name.to_string(),
                is_leader: *name == leader,
            })
            .collect();
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.lock().unwrap().keys().cloned().collect()
    }

    async fn notify(&self, key: &str, kind: EventKind, value: &str) {
        if *self.mute_watches.lock().unwrap() {
            return;
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let feeds = self.feeds.lock().await;
        for (watched, feed) in feeds.iter() {
            if watched == key {
                feed.send(WatchResponse {
                    revision,
                    events: vec![WatchEvent {
                        kind,
                        kv: KeyValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        },
                    }],
                })
                .await;
            }
        }
    }
}

pub struct MockClient {
    store: Arc<MockStore>,
}

#[async_trait]
impl KvClient for MockClient {
    async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        let hang = self
            .store
            .hang_prefix
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|p| key.starts_with(p.as_str()));
        if hang {
            std::future::pending::<()>().await;
        }
        self.store
            .data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.store.notify(key, EventKind::Put, value).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Vec<KeyValue>> {
        Ok(self
            .store
            .data
            .lock()
            .unwrap()
            .get(key)
            .map(|v| KeyValue {
                key: key.to_string(),
                value: v.clone(),
            })
            .into_iter()
            .collect())
    }

    async fn delete(&self, key: &str) -> KvResult<u64> {
        let removed = self.store.data.lock().unwrap().remove(key);
        if removed.is_some() {
            self.store.notify(key, EventKind::Delete, "").await;
        }
        Ok(u64::from(removed.is_some()))
    }

    async fn watch(&self, key: &str) -> KvResult<WatchStream> {
        let (feed, stream) = WatchStream::channel(16);
        self.store.feeds.lock().await.push((key.to_string(), feed));
        Ok(stream)
    }
}

pub struct MockConnection {
    store: Arc<MockStore>,
    endpoints: Vec<String>,
}

#[async_trait]
impl KvConnection for MockConnection {
    fn client(&self) -> Arc<dyn KvClient> {
        Arc::new(MockClient {
            store: self.store.clone(),
        })
    }

    async fn member_list(&self) -> KvResult<Vec<MemberInfo>> {
        let stalled = {
            let stalled = self.store.stalled.lock().unwrap();
            self.endpoints.iter().any(|e| stalled.contains(e))
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(self.store.members.lock().unwrap().clone())
    }

    async fn hash(&self) -> KvResult<u32> {
        Ok(self.store.data.lock().unwrap().len() as u32 * 7 + 1)
    }

    async fn close(&self) {
        self.store.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    pub store: Arc<MockStore>,
}

#[async_trait]
impl KvConnector for MockConnector {
    async fn connect(
        &self,
        endpoints: &[String],
        _dial_timeout: Duration,
    ) -> KvResult<Arc<dyn KvConnection>> {
        let down = self.store.down.lock().unwrap();
        if let Some(e) = endpoints.iter().find(|e| down.contains(*e)) {
            return Err(KvError::Unavailable(e.clone()));
        }
        Ok(Arc::new(MockConnection {
            store: self.store.clone(),
            endpoints: endpoints.to_vec(),
        }))
    }
}

pub struct MockScraper {
    pub store: Arc<MockStore>,
}

#[async_trait]
impl MetricsScraper for MockScraper {
    async fn key_count(&self, _status_endpoint: &str) -> KvResult<u64> {
        Ok(self.store.data.lock().unwrap().len() as u64)
    }
}

/// Agent that pretends every call succeeds.
#[derive(Default)]
pub struct NoopAgent {
    next_pid: AtomicU32,
}

#[async_trait]
impl Agent for NoopAgent {
    async fn start(&self, _args: &[String]) -> anyhow::Result<u32> {
        Ok(1000 + self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
    async fn restart(&self) -> anyhow::Result<u32> {
        Ok(2000 + self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Endpoint of agent-controlled member `i`.
pub fn grpc_addr(i: usize) -> String {
    format!("10.0.0.{}:2378", i + 1)
}

/// Agent-controlled members backed by `store`.
pub fn remote_builder(names: &[&str], store: &Arc<MockStore>) -> ClusterBuilder {
    let members: Vec<NodeConfig> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            NodeConfig::new(
                name,
                format!("/var/lib/kvplay/{name}"),
                &format!("http://10.0.0.{}:2379", i + 1),
                &format!("http://10.0.0.{}:2380", i + 1),
            )
            .with_grpc_addr(&grpc_addr(i))
        })
        .collect();
    let agents: Vec<Arc<dyn Agent>> = names
        .iter()
        .map(|_| Arc::new(NoopAgent::default()) as Arc<dyn Agent>)
        .collect();
    ClusterBuilder::new(members)
        .with_agents(agents)
        .with_kv(Arc::new(MockConnector {
            store: store.clone(),
        }))
        .with_metrics_scraper(Arc::new(MockScraper {
            store: store.clone(),
        }))
}

/// A started agent-controlled cluster.
pub async fn started_cluster(names: &[&str], store: &Arc<MockStore>, options: ClusterOptions) -> Cluster {
    let cluster = remote_builder(names, store).with_options(options).build().unwrap();
    cluster.start_all().await.unwrap();
    cluster
}

pub fn ids(id: &str) -> Vec<String> {
    vec![id.to_string()]
}
