//! Lifecycle tests that drive real child processes.
//!
//! The member program is a generated shell script that ignores its
//! flags and sleeps, so no key-value server is needed.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use kvplay_cluster::{Cluster, ClusterError, ClusterOptions, LineStyle, LogStream};
use kvplay_core::NodeConfig;

struct Scripts {
    _dir: tempfile::TempDir,
    sleeper: PathBuf,
    chatty: PathBuf,
    stubborn: PathBuf,
}

/// Written once, before any test forks, so no child inherits an open
/// write handle to a script.
fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        let sleeper = write("sleeper.sh", "#!/bin/sh\nexec sleep 30\n");
        let chatty = write("chatty.sh", "#!/bin/sh\necho \"hello from $1\"\necho\nexec sleep 30\n");
        let stubborn = write("stubborn.sh", "#!/bin/sh\ntrap '' TERM\nexec sleep 30\n");
        Scripts {
            _dir: dir,
            sleeper,
            chatty,
            stubborn,
        }
    })
}

/// Members `a`, `b`, `c`, ... with client ports deliberately out of name order.
fn members(dir: &Path, n: usize) -> Vec<NodeConfig> {
    let ports = [32379, 12379, 22379, 42379];
    (0..n)
        .map(|i| {
            let name = ((b'a' + i as u8) as char).to_string();
            let data_dir = dir.join(&name);
            std::fs::create_dir_all(&data_dir).unwrap();
            NodeConfig::new(
                &name,
                data_dir,
                &format!("http://localhost:{}", ports[i]),
                &format!("http://localhost:{}", ports[i] + 1),
            )
        })
        .collect()
}

fn cluster(dir: &Path, n: usize, program: &Path, options: ClusterOptions) -> Cluster {
    Cluster::builder(members(dir, n))
        .with_program(program)
        .with_options(options)
        .build()
        .unwrap()
}

async fn wait_for_line(stream: &LogStream, pred: impl Fn(&str) -> bool) -> Option<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let line = tokio::time::timeout_at(deadline, stream.recv()).await.ok()??;
        if pred(&line) {
            return Some(line);
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn start_then_terminate_toggles_active() {
    let dir = tempfile::tempdir().unwrap();
    let c = cluster(dir.path(), 1, &scripts().sleeper, ClusterOptions::default());

    assert!(!c.is_active("a").unwrap());
    c.start("a").await.unwrap();
    assert!(c.is_active("a").unwrap());

    let shared = c.shared_stream();
    assert_eq!(shared.recv().await.unwrap(), "Start a");

    c.terminate("a").await.unwrap();
    assert!(!c.is_active("a").unwrap());
    let line = shared.recv().await.unwrap();
    assert!(line.starts_with("Terminate a [PID: "), "{line}");

    let exit = wait_for_line(&shared, |l| l.starts_with("Start(a) process exited with")).await;
    assert!(exit.is_some());
    c.close().await;
}

#[tokio::test]
async fn lifecycle_preconditions() {
    let dir = tempfile::tempdir().unwrap();
    let c = cluster(dir.path(), 1, &scripts().sleeper, ClusterOptions::default());

    assert!(matches!(c.terminate("a").await, Err(ClusterError::NotActive(_))));
    assert!(matches!(c.start("nope").await, Err(ClusterError::NotFound(_))));

    c.start("a").await.unwrap();
    assert!(matches!(c.start("a").await, Err(ClusterError::AlreadyActive(_))));
    assert!(c.is_active("a").unwrap());
    assert!(matches!(c.clean("a").await, Err(ClusterError::StillActive(_))));
    assert!(dir.path().join("a").exists());

    c.terminate("a").await.unwrap();
    c.clean("a").await.unwrap();
    assert!(!dir.path().join("a").exists());
    // Cleaning again is harmless.
    c.clean("a").await.unwrap();
    c.close().await;
}

#[tokio::test]
async fn cool_down_between_terminate_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let options = ClusterOptions::default().with_limit_interval(Duration::from_millis(100));
    let c = cluster(dir.path(), 3, &scripts().sleeper, options);

    c.start_all().await.unwrap();
    assert!(c.names().iter().all(|n| c.is_active(n).unwrap()));

    c.terminate("a").await.unwrap();
    assert!(!c.is_active("a").unwrap());
    assert!(c.is_active("b").unwrap() && c.is_active("c").unwrap());

    let err = c.restart("a").await.unwrap_err();
    match err {
        ClusterError::TooSoon { elapsed, required, .. } => {
            assert!(elapsed < required);
            assert_eq!(required, Duration::from_millis(100));
        }
        other => panic!("expected TooSoon, got {other}"),
    }
    assert!(!c.is_active("a").unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    c.restart("a").await.unwrap();
    assert!(c.is_active("a").unwrap());

    let (active, by_name) = c.endpoints();
    assert_eq!(
        active,
        vec!["localhost:12379", "localhost:22379", "localhost:32379"]
    );
    assert_eq!(by_name["a"], "localhost:32379");

    c.shutdown().await.unwrap();
    c.close().await;
}

#[tokio::test]
async fn bootstrap_runs_until_interrupt_then_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let c = Arc::new(cluster(dir.path(), 3, &scripts().sleeper, ClusterOptions::default()));

    let observed = c.clone();
    c.bootstrap(async move {
        assert!(observed.names().iter().all(|n| observed.is_active(n).unwrap()));
    })
    .await
    .unwrap();

    for name in c.names() {
        assert!(!c.is_active(&name).unwrap());
        assert!(!dir.path().join(&name).exists(), "{name} data dir left behind");
    }
    c.close().await;
}

#[tokio::test]
async fn revive_restarts_a_dead_cluster_only() {
    let dir = tempfile::tempdir().unwrap();
    let c = cluster(dir.path(), 2, &scripts().sleeper, ClusterOptions::default());
    c.start_all().await.unwrap();

    c.terminate("a").await.unwrap();
    c.revive().await.unwrap();
    assert!(!c.is_active("a").unwrap());

    c.terminate("b").await.unwrap();
    c.revive().await.unwrap();
    assert!(c.is_active("a").unwrap() && c.is_active("b").unwrap());

    c.shutdown().await.unwrap();
    c.close().await;
}

#[tokio::test]
async fn reviver_task_brings_members_back() {
    let dir = tempfile::tempdir().unwrap();
    let c = Arc::new(cluster(dir.path(), 2, &scripts().sleeper, ClusterOptions::default()));
    c.start_all().await.unwrap();
    c.spawn_reviver(Duration::from_millis(50));

    c.terminate("a").await.unwrap();
    c.terminate("b").await.unwrap();
    assert!(wait_until(|| c.is_active("a").unwrap() && c.is_active("b").unwrap()).await);

    c.close().await;
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn live_log_tags_process_output() {
    let dir = tempfile::tempdir().unwrap();
    let options = ClusterOptions::default()
        .with_live_log(true)
        .with_line_style(LineStyle::Plain);
    let c = cluster(dir.path(), 1, &scripts().chatty, options);
    c.start("a").await.unwrap();

    let line = wait_for_line(&c.shared_stream(), |l| l.contains("hello from")).await.unwrap();
    assert_eq!(line, "a | hello from --name=a");

    c.shutdown().await.unwrap();
    c.close().await;
}

#[tokio::test]
async fn stubborn_process_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let options = ClusterOptions::default().with_kill_grace(Some(Duration::from_millis(100)));
    let c = cluster(dir.path(), 1, &scripts().stubborn, options);
    c.start("a").await.unwrap();
    // Let the shell install its trap before signalling.
    tokio::time::sleep(Duration::from_millis(200)).await;

    c.terminate("a").await.unwrap();
    let line = wait_for_line(&c.shared_stream(), |l| l.starts_with("Kill a")).await;
    assert_eq!(line.as_deref(), Some("Kill a (did not exit after terminate)"));
    c.close().await;
}

#[tokio::test]
async fn close_lets_armed_kill_finish() {
    let dir = tempfile::tempdir().unwrap();
    let options = ClusterOptions::default().with_kill_grace(Some(Duration::from_millis(100)));
    let c = cluster(dir.path(), 1, &scripts().stubborn, options);
    c.start("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    c.shutdown().await.unwrap();
    c.close().await;

    let lines = c.shared_stream().drain();
    let pid: libc::pid_t = lines
        .iter()
        .find_map(|l| l.strip_prefix("Terminate a [PID: ")?.strip_suffix(']')?.parse().ok())
        .unwrap();
    assert!(lines.iter().any(|l| l == "Kill a (did not exit after terminate)"), "{lines:?}");

    // The supervisor reaped the child, so the pid no longer exists.
    // SAFETY: signal 0 only checks for existence.
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive, "member {pid} outlived close");
}

#[tokio::test]
async fn write_routes_to_shared_or_named_streams() {
    let dir = tempfile::tempdir().unwrap();
    let c = cluster(dir.path(), 1, &scripts().sleeper, ClusterOptions::default());

    c.write("a", "to everyone", &[]).await.unwrap();
    assert_eq!(c.shared_stream().drain(), vec!["to everyone"]);

    let ids = vec!["s1".to_string(), "s2".to_string()];
    c.write("a", "to sessions", &ids).await.unwrap();
    assert!(c.shared_stream().is_empty());
    assert_eq!(c.stream("s1").await.drain(), vec!["to sessions"]);
    assert_eq!(c.stream("s2").await.drain(), vec!["to sessions"]);

    assert!(matches!(
        c.write("zz", "lost", &[]).await,
        Err(ClusterError::NotFound(_))
    ));
}

#[tokio::test]
async fn invalid_config_fails_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let mut ms = members(dir.path(), 2);
    ms[1].name = "a".into();
    let err = Cluster::builder(ms)
        .with_program(&scripts().sleeper)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ClusterError::Config(_)));

    let err = Cluster::builder(members(dir.path(), 1)).build().err().unwrap();
    assert!(matches!(err, ClusterError::Config(_)));
}
