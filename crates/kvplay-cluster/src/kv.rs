//! Key-value store client capability.
//!
//! The engine never speaks the store's wire protocol. It connects
//! through a [`KvConnector`], hands out logical [`KvClient`]s that share
//! one [`KvConnection`], and scrapes key counts through a
//! [`MetricsScraper`]. [`HttpMetricsScraper`] is the stock scraper for
//! Prometheus-style `/metrics` endpoints.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{KvError, KvResult};

/// Metric that carries the number of keys in the store.
pub const KEYS_TOTAL_METRIC: &str = "etcd_storage_keys_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Put => "PUT",
            EventKind::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

/// One batch of events delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

/// A member as reported by the membership API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: u64,
    pub name: String,
    pub is_leader: bool,
}

/// Consumer side of a watch subscription.
///
/// Dropping the stream cancels the subscription.
pub struct WatchStream {
    events: mpsc::Receiver<WatchResponse>,
    cancel: watch::Sender<bool>,
}

/// Producer side of a watch subscription, held by client implementations.
pub struct WatchFeed {
    events: mpsc::Sender<WatchResponse>,
    cancelled: watch::Receiver<bool>,
}

impl WatchStream {
    /// Create a connected feed/stream pair.
    pub fn channel(buffer: usize) -> (WatchFeed, WatchStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            WatchFeed {
                events: tx,
                cancelled: cancel_rx,
            },
            WatchStream {
                events: rx,
                cancel: cancel_tx,
            },
        )
    }

    /// Next response; `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<WatchResponse> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl WatchFeed {
    /// Deliver a response. Returns `false` once the watcher is gone.
    pub async fn send(&self, resp: WatchResponse) -> bool {
        !self.is_cancelled() && self.events.send(resp).await.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolve once the watcher cancels or drops its stream.
    pub async fn cancelled(&mut self) {
        while !*self.cancelled.borrow_and_update() {
            if self.cancelled.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Key-value and watch operations of one logical client.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Vec<KeyValue>>;

    /// Returns the number of deleted keys.
    async fn delete(&self, key: &str) -> KvResult<u64>;

    async fn watch(&self, key: &str) -> KvResult<WatchStream>;
}

/// A connection to one or more store endpoints.
#[async_trait]
pub trait KvConnection: Send + Sync {
    /// A logical client multiplexed over this connection.
    fn client(&self) -> Arc<dyn KvClient>;

    async fn member_list(&self) -> KvResult<Vec<MemberInfo>>;

    /// Hash of the store's content.
    async fn hash(&self) -> KvResult<u32>;

    async fn close(&self);
}

/// Opens connections to store endpoints.
#[async_trait]
pub trait KvConnector: Send + Sync {
    async fn connect(
        &self,
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> KvResult<Arc<dyn KvConnection>>;
}

/// Reads a member's key count from its status endpoint.
#[async_trait]
pub trait MetricsScraper: Send + Sync {
    async fn key_count(&self, status_endpoint: &str) -> KvResult<u64>;
}

/// Scrapes `<status endpoint>/metrics` over HTTP/1.
#[derive(Debug, Clone)]
pub struct HttpMetricsScraper {
    metric: String,
}

impl Default for HttpMetricsScraper {
    fn default() -> Self {
        Self::new(KEYS_TOTAL_METRIC)
    }
}

impl HttpMetricsScraper {
    pub fn new(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
        }
    }

    async fn fetch(&self, status_endpoint: &str) -> KvResult<String> {
        let uri: http::Uri = status_endpoint
            .parse()
            .map_err(|e| KvError::Metrics(format!("bad endpoint {status_endpoint}: {e}")))?;
        let address = uri
            .authority()
            .ok_or_else(|| KvError::Metrics(format!("no host in {status_endpoint}")))?
            .as_str()
            .to_string();

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| KvError::Unavailable(format!("{address}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| KvError::Metrics(format!("handshake with {address}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri("/metrics")
            .header("host", &address)
            .header("user-agent", "kvplay/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| KvError::Metrics(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| KvError::Metrics(format!("GET {address}/metrics: {e}")))?;
        if !resp.status().is_success() {
            return Err(KvError::Metrics(format!(
                "GET {address}/metrics returned {}",
                resp.status()
            )));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| KvError::Metrics(e.to_string()))?
            .to_bytes();
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl MetricsScraper for HttpMetricsScraper {
    async fn key_count(&self, status_endpoint: &str) -> KvResult<u64> {
        let body = self.fetch(status_endpoint).await?;
        let count = parse_metric(&body, &self.metric);
        debug!(endpoint = %status_endpoint, metric = %self.metric, count, "scraped key count");
        Ok(count)
    }
}

/// Value of `metric` in a Prometheus text body, truncated to an integer.
///
/// A missing metric or an unparsable value reads as zero.
pub fn parse_metric(body: &str, metric: &str) -> u64 {
    for line in body.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let name = parts.next().unwrap_or_default();
        if name != metric {
            continue;
        }
        let value = parts
            .next()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        return value.max(0.0) as u64;
    }
    0
}
