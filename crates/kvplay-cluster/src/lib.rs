//! kvplay-cluster — orchestration engine for a small key-value cluster.
//!
//! Owns the member nodes, drives their lifecycle, and runs the
//! status, stress, and watch operations against whichever members are
//! currently alive. Progress is reported as pre-formatted lines on the
//! shared stream or on caller-named side streams.
//!
//! # Architecture
//!
//! ```text
//! Cluster
//!   ├── Node registry (name → Arc<dyn Node>)
//!   │   ├── LocalNode  → child process + supervisor task
//!   │   └── RemoteNode → Agent capability
//!   ├── Streams (shared + lazily created named streams)
//!   ├── Lifecycle fan-out: bootstrap / shutdown / revive
//!   ├── status()            → concurrent probes, one entry per node
//!   ├── put / get / delete  → one request through one member
//!   └── stress / watch_put  → load over a pooled connection
//! ```
//!
//! The key-value store itself sits behind [`KvConnector`]; the engine
//! never speaks its wire protocol.

pub mod agent;
pub mod cluster;
pub mod error;
pub mod kv;
pub mod load;
pub mod node;
pub mod ops;
pub mod options;
pub mod status;
pub mod stream;

pub use agent::Agent;
pub use cluster::{Cluster, ClusterBuilder};
pub use error::{ClusterError, ClusterResult, KvError, KvResult, LifecycleEvent};
pub use kv::{
    EventKind, HttpMetricsScraper, KeyValue, KvClient, KvConnection, KvConnector, MemberInfo,
    MetricsScraper, WatchEvent, WatchFeed, WatchResponse, WatchStream,
};
pub use load::{StressReport, WATCH_KEY};
pub use node::{LocalNode, Node, NodeSnapshot, RemoteNode};
pub use options::ClusterOptions;
pub use status::StatusReport;
pub use stream::{LineStyle, LineTagger, LogStream};
