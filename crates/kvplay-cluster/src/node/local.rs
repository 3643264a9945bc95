//! Child-process member.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kvplay_core::{InitialClusterState, NodeConfig};

use super::{Lifecycle, Node};
use crate::error::{ClusterError, ClusterResult};
use crate::options::ClusterOptions;
use crate::stream::{LineTagger, LogStream};

/// Extra time [`LocalNode::close`] allows an armed supervisor beyond the
/// kill grace period.
const KILL_MARGIN: Duration = Duration::from_secs(1);

/// Supervisor of one launch plus its not-yet-armed escalation trigger.
struct Launch {
    supervisor: JoinHandle<()>,
    escalate: Option<oneshot::Sender<Duration>>,
}

/// A member launched as a local child process.
///
/// Output is forwarded line by line into the shared stream, and a
/// supervisor task reaps the process and reports its exit.
pub struct LocalNode {
    config: NodeConfig,
    program: PathBuf,
    lifecycle: Lifecycle,
    shared: LogStream,
    tagger: LineTagger,
    live_log: bool,
    kill_grace: Option<Duration>,
    /// Output forwarder tasks of every launch.
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    /// Every launch still being supervised, newest last.
    launches: Mutex<Vec<Launch>>,
}

impl LocalNode {
    pub fn new(
        config: NodeConfig,
        program: PathBuf,
        shared: LogStream,
        tagger: LineTagger,
        options: &ClusterOptions,
    ) -> Self {
        let lifecycle = Lifecycle::new(&config.name, options.limit_interval);
        Self {
            config,
            program,
            lifecycle,
            shared,
            tagger,
            live_log: options.live_log,
            kill_grace: options.kill_grace,
            forwarders: Mutex::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Launch the process and hand it to a supervisor task.
    fn spawn(&self, op: &'static str, state: InitialClusterState) -> ClusterResult<u32> {
        let args = self.config.to_args(state);
        debug!(node = %self.config.name, program = ?self.program, ?args, "spawning member");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(false);
        if self.live_log {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before reporting a pid"))?;

        let mut handles = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            handles.push(forward(out, self.tagger.clone(), self.shared.clone()));
        }
        if let Some(err) = child.stderr.take() {
            handles.push(forward(err, self.tagger.clone(), self.shared.clone()));
        }

        let (escalate_tx, escalate_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            self.config.name.clone(),
            op,
            child,
            self.shared.clone(),
            escalate_rx,
        ));

        let mut forwarders = self.forwarders.lock().unwrap_or_else(PoisonError::into_inner);
        forwarders.retain(|h| !h.is_finished());
        forwarders.extend(handles);
        let mut launches = self.launches.lock().unwrap_or_else(PoisonError::into_inner);
        launches.retain(|l| !l.supervisor.is_finished());
        launches.push(Launch {
            supervisor,
            escalate: Some(escalate_tx),
        });

        Ok(pid)
    }
}

#[async_trait]
impl Node for LocalNode {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn endpoint(&self) -> String {
        self.config.client_host().unwrap_or_default()
    }

    fn status_endpoint(&self) -> String {
        self.config.client_url().unwrap_or_default().to_string()
    }

    fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    async fn start(&self) -> ClusterResult<()> {
        let transition = self.lifecycle.begin_start()?;
        let state = if self.lifecycle.snapshot().rejoin {
            InitialClusterState::Existing
        } else {
            self.config.initial_cluster_state
        };

        self.shared.send(format!("Start {}", self.config.name)).await;
        let pid = self.spawn("Start", state)?;
        transition.started(Some(pid));
        info!(node = %self.config.name, pid, "member started");
        Ok(())
    }

    async fn restart(&self) -> ClusterResult<()> {
        let transition = self.lifecycle.begin_restart()?;

        self.shared.send(format!("Restart {}", self.config.name)).await;
        let pid = self.spawn("Restart", InitialClusterState::Existing)?;
        transition.restarted(Some(pid));
        info!(node = %self.config.name, pid, "member restarted");
        Ok(())
    }

    async fn terminate(&self) -> ClusterResult<()> {
        let (transition, pid) = self.lifecycle.begin_terminate()?;
        let pid = pid.ok_or_else(|| ClusterError::NotActive(self.config.name.clone()))?;

        self.shared
            .send(format!("Terminate {} [PID: {pid}]", self.config.name))
            .await;
        send_signal(pid, libc::SIGTERM)?;

        if let Some(grace) = self.kill_grace {
            let armed = self
                .launches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_mut()
                .and_then(|l| l.escalate.take());
            if let Some(tx) = armed {
                let _ = tx.send(grace);
            }
        }

        transition.terminated();
        info!(node = %self.config.name, pid, "member terminated");
        Ok(())
    }

    async fn clean(&self) -> ClusterResult<()> {
        let transition = self.lifecycle.begin_clean()?;

        let dir = &self.config.data_dir;
        self.shared
            .send(format!("Clean {} ({})", self.config.name, dir.display()))
            .await;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        transition.cleaned();
        debug!(node = %self.config.name, dir = ?dir, "member data removed");
        Ok(())
    }

    fn message_stream(&self) -> Option<&LogStream> {
        Some(&self.shared)
    }

    /// Abort supervision of running processes.
    ///
    /// Supervisors whose forced kill is armed are awaited for up to the
    /// grace period plus [`KILL_MARGIN`], so a terminated process that
    /// ignores `SIGTERM` is still killed and reaped.
    async fn close(&self) {
        let launches: Vec<_> = self
            .launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let bound = self.kill_grace.unwrap_or_default() + KILL_MARGIN;
        for Launch { mut supervisor, escalate } in launches {
            let armed = self.kill_grace.is_some() && escalate.is_none();
            if !armed || supervisor.is_finished() {
                supervisor.abort();
                continue;
            }
            if tokio::time::timeout(bound, &mut supervisor).await.is_err() {
                warn!(node = %self.config.name, "supervisor still running after kill grace");
                supervisor.abort();
            }
        }

        let forwarders: Vec<_> = self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in forwarders {
            handle.abort();
        }
    }
}

/// Send `signal` to `pid`.
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Forward non-empty lines of a child pipe into the shared stream.
fn forward<R>(reader: R, tagger: LineTagger, shared: LogStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            shared.send(tagger.tag(&line)).await;
        }
    })
}

/// Reap the child and report how it exited.
///
/// Once escalation is armed with a grace period, a child still running
/// after that period is killed.
async fn supervise(
    name: String,
    op: &'static str,
    mut child: Child,
    shared: LogStream,
    escalate: oneshot::Receiver<Duration>,
) {
    let forced = async {
        match escalate.await {
            Ok(grace) => tokio::time::sleep(grace).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    let status = tokio::select! {
        status = child.wait() => status,
        _ = forced => {
            warn!(node = %name, "grace period elapsed, killing member");
            shared.send(format!("Kill {name} (did not exit after terminate)")).await;
            if let Err(e) = child.start_kill() {
                warn!(node = %name, error = %e, "forced kill failed");
            }
            child.wait().await
        }
    };

    match status {
        Ok(s) if s.success() => shared.send(format!("Exiting {name}")).await,
        Ok(s) => {
            debug!(node = %name, status = %s, "member exited");
            shared.send(format!("{op}({name}) process exited with {s}")).await;
        }
        Err(e) => {
            warn!(node = %name, error = %e, "waiting on member failed");
            shared.send(format!("{op}({name}) wait returned {e}")).await;
        }
    }
}
