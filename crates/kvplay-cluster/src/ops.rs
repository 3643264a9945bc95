//! Single-request key-value operations against one member.

use std::time::Instant;

use tracing::debug;

use crate::cluster::{Cluster, bounded};
use crate::error::ClusterResult;
use crate::stream::emit;

impl Cluster {
    /// Put `key` = `value` through `name`, or any active node when `name` is empty.
    pub async fn put(
        &self,
        name: &str,
        key: &str,
        value: &str,
        stream_ids: &[String],
    ) -> ClusterResult<()> {
        let (name, endpoint) = self.resolve_target(name)?;
        let endpoints = [endpoint];
        let targets = self.targets(&name, stream_ids).await;

        let conn = self.connect(&endpoints).await?;
        let st = Instant::now();
        emit(&targets, format!("[PUT] Started! (endpoints: {endpoints:?})")).await;

        let client = conn.client();
        let result = bounded("put", self.options().request_timeout, client.put(key, value)).await;
        conn.close().await;
        result?;

        emit(
            &targets,
            format!(
                "[PUT] {key:?} : {value:?} / Took {:?} (endpoints: {endpoints:?})",
                st.elapsed()
            ),
        )
        .await;
        debug!(node = %name, key, "put done");
        Ok(())
    }

    /// Values stored under `key`, sorted.
    pub async fn get(&self, name: &str, key: &str, stream_ids: &[String]) -> ClusterResult<Vec<String>> {
        let (name, endpoint) = self.resolve_target(name)?;
        let endpoints = [endpoint];
        let targets = self.targets(&name, stream_ids).await;

        let conn = self.connect(&endpoints).await?;
        let st = Instant::now();
        emit(&targets, format!("[GET] Started! (endpoints: {endpoints:?})")).await;

        let client = conn.client();
        let result = bounded("get", self.options().request_timeout, client.get(key)).await;
        conn.close().await;
        let kvs = result?;

        if kvs.is_empty() {
            emit(&targets, format!("[GET] {key:?} does not exist!")).await;
        }
        let mut values = Vec::with_capacity(kvs.len());
        for kv in kvs {
            emit(&targets, format!("[GET] {:?} : {:?}", kv.key, kv.value)).await;
            values.push(kv.value);
        }
        emit(
            &targets,
            format!("[GET] Done! Took {:?} (endpoints: {endpoints:?})", st.elapsed()),
        )
        .await;

        values.sort();
        Ok(values)
    }

    /// Delete `key`. Returns how many keys were removed.
    pub async fn delete(&self, name: &str, key: &str, stream_ids: &[String]) -> ClusterResult<u64> {
        let (name, endpoint) = self.resolve_target(name)?;
        let endpoints = [endpoint];
        let targets = self.targets(&name, stream_ids).await;

        let conn = self.connect(&endpoints).await?;
        let st = Instant::now();
        emit(&targets, format!("[DELETE] Started! (endpoints: {endpoints:?})")).await;

        let client = conn.client();
        let result = bounded("delete", self.options().request_timeout, client.delete(key)).await;
        conn.close().await;
        let deleted = result?;

        emit(
            &targets,
            format!("[DELETE] Done! Took {:?} (endpoints: {endpoints:?})", st.elapsed()),
        )
        .await;
        debug!(node = %name, key, deleted, "delete done");
        Ok(deleted)
    }
}
