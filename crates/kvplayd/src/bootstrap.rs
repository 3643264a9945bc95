//! Bootstrap mode — the cluster lives as long as the daemon.
//!
//! In this mode, the daemon:
//! 1. Loads and validates the cluster config
//! 2. Forwards the shared stream to the daemon log
//! 3. Starts every member concurrently
//! 4. Waits for Ctrl-C, then terminates and cleans every member

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kvplay_cluster::{Cluster, ClusterBuilder, ClusterOptions, LineStyle, LogStream};
use kvplay_core::ClusterConfig;

pub async fn run_bootstrap(
    config_path: PathBuf,
    plain: bool,
    revive_interval: Option<u64>,
) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(path = ?config_path, members = config.members.len(), "cluster config loaded");

    let style = if plain { LineStyle::Plain } else { LineStyle::Html };
    let options = ClusterOptions::from_config(&config)?.with_line_style(style);
    let cluster = Arc::new(
        ClusterBuilder::from_config(config)?
            .with_options(options)
            .build()?,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let forwarder = tokio::spawn(forward(cluster.shared_stream(), stop_rx, |line| {
        info!(target: "kvplayd::stream", "{line}");
    }));

    if let Some(secs) = revive_interval {
        cluster.spawn_reviver(Duration::from_secs(secs));
        info!(interval = secs, "reviver started");
    }

    let result = cluster
        .bootstrap(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
        })
        .await;

    cluster.close().await;

    let _ = stop_tx.send(true);
    match forwarder.await {
        Ok(lines) => info!(lines, "stream forwarder stopped"),
        Err(e) => error!(error = %e, "stream forwarder failed"),
    }

    result?;
    info!("kvplay cluster stopped");
    Ok(())
}

/// Hand every shared-stream line to `sink` until `stop` fires, then
/// flush what is still queued. Returns the number of lines forwarded.
async fn forward(
    shared: LogStream,
    mut stop: watch::Receiver<bool>,
    mut sink: impl FnMut(String),
) -> usize {
    let mut forwarded = 0;
    loop {
        tokio::select! {
            biased;
            line = shared.recv() => match line {
                Some(line) => {
                    sink(line);
                    forwarded += 1;
                }
                None => return forwarded,
            },
            _ = stop.changed() => break,
        }
    }
    for line in shared.drain() {
        sink(line);
        forwarded += 1;
    }
    forwarded
}

pub fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    let mut config = ClusterConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.combine(false)?;
    ClusterOptions::from_config(&config)?;

    println!("program: {}", config.program.display());
    for member in &config.members {
        let args = member.to_args(member.initial_cluster_state);
        println!("{}: {}", member.name, args.join(" "));
    }
    info!(members = config.members.len(), "cluster config is valid");
    Ok(())
}
