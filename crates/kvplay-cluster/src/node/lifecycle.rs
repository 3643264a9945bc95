//! Active-flag bookkeeping and the restart/terminate cool-down.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{ClusterError, ClusterResult, LifecycleEvent};

/// Mutable runtime state of one member.
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub active: bool,
    /// Valid only while `active`.
    pub pid: Option<u32>,
    /// Set after a restart so later launches rejoin the cluster.
    pub rejoin: bool,
    pub last_terminated: Option<Instant>,
    pub last_restarted: Option<Instant>,
    /// A transition has been admitted and not yet finished.
    busy: bool,
}

/// Guards a member's state behind one mutex.
///
/// Every transition is admitted with a check-and-set under the lock,
/// runs unlocked, and is committed under the lock. Timestamps move only
/// on commit.
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    limit_interval: Duration,
    state: Mutex<NodeSnapshot>,
}

impl Lifecycle {
    pub fn new(name: &str, limit_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            limit_interval,
            state: Mutex::new(NodeSnapshot::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, NodeSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn pid(&self) -> Option<u32> {
        let state = self.lock();
        if state.active { state.pid } else { None }
    }

    /// Admit a first start.
    pub fn begin_start(&self) -> ClusterResult<Transition<'_>> {
        let mut state = self.lock();
        if state.active || state.busy {
            return Err(ClusterError::AlreadyActive(self.name.clone()));
        }
        state.busy = true;
        Ok(Transition::new(self))
    }

    /// Admit a restart, enforcing the cool-down against the previous
    /// restart and the previous terminate.
    pub fn begin_restart(&self) -> ClusterResult<Transition<'_>> {
        let mut state = self.lock();
        if state.active || state.busy {
            return Err(ClusterError::AlreadyActive(self.name.clone()));
        }
        self.check_cooldown(state.last_restarted, LifecycleEvent::Restart)?;
        self.check_cooldown(state.last_terminated, LifecycleEvent::Terminate)?;
        state.busy = true;
        Ok(Transition::new(self))
    }

    /// Admit a terminate, enforcing the cool-down against the previous
    /// terminate and the previous restart. Yields the tracked pid.
    pub fn begin_terminate(&self) -> ClusterResult<(Transition<'_>, Option<u32>)> {
        let mut state = self.lock();
        if !state.active || state.busy {
            return Err(ClusterError::NotActive(self.name.clone()));
        }
        self.check_cooldown(state.last_terminated, LifecycleEvent::Terminate)?;
        self.check_cooldown(state.last_restarted, LifecycleEvent::Restart)?;
        state.busy = true;
        let pid = state.pid;
        Ok((Transition::new(self), pid))
    }

    /// Admit a clean. Only inactive members may be cleaned.
    pub fn begin_clean(&self) -> ClusterResult<Transition<'_>> {
        let mut state = self.lock();
        if state.active || state.busy {
            return Err(ClusterError::StillActive(self.name.clone()));
        }
        state.busy = true;
        Ok(Transition::new(self))
    }

    fn check_cooldown(&self, last: Option<Instant>, event: LifecycleEvent) -> ClusterResult<()> {
        let Some(last) = last else {
            return Ok(());
        };
        let elapsed = last.elapsed();
        if elapsed < self.limit_interval {
            return Err(ClusterError::TooSoon {
                node: self.name.clone(),
                event,
                elapsed,
                required: self.limit_interval,
            });
        }
        Ok(())
    }
}

/// An admitted transition. Dropping it without committing releases the
/// in-flight guard and leaves the state untouched.
#[must_use]
pub struct Transition<'a> {
    lifecycle: &'a Lifecycle,
    done: bool,
}

impl<'a> Transition<'a> {
    fn new(lifecycle: &'a Lifecycle) -> Self {
        Self {
            lifecycle,
            done: false,
        }
    }

    fn commit(mut self, apply: impl FnOnce(&mut NodeSnapshot)) {
        let mut state = self.lifecycle.lock();
        apply(&mut state);
        state.busy = false;
        self.done = true;
    }

    pub fn started(self, pid: Option<u32>) {
        self.commit(|s| {
            s.active = true;
            s.pid = pid;
        });
    }

    pub fn restarted(self, pid: Option<u32>) {
        self.commit(|s| {
            s.active = true;
            s.pid = pid;
            s.rejoin = true;
            s.last_restarted = Some(Instant::now());
        });
    }

    pub fn terminated(self) {
        self.commit(|s| {
            s.active = false;
            s.pid = None;
            s.last_terminated = Some(Instant::now());
        });
    }

    pub fn cleaned(self) {
        self.commit(|_| {});
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.lifecycle.lock().busy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_terminate() {
        let lc = Lifecycle::new("a", Duration::ZERO);
        lc.begin_start().unwrap().started(Some(42));
        assert!(lc.is_active());
        assert_eq!(lc.pid(), Some(42));

        let (t, pid) = lc.begin_terminate().unwrap();
        assert_eq!(pid, Some(42));
        t.terminated();
        assert!(!lc.is_active());
        assert_eq!(lc.pid(), None);
    }

    #[test]
    fn terminate_never_started_is_not_active() {
        let lc = Lifecycle::new("a", Duration::ZERO);
        assert!(matches!(lc.begin_terminate(), Err(ClusterError::NotActive(_))));
    }

    #[test]
    fn duplicate_start_is_already_active() {
        let lc = Lifecycle::new("a", Duration::ZERO);
        lc.begin_start().unwrap().started(None);
        assert!(matches!(lc.begin_start(), Err(ClusterError::AlreadyActive(_))));
        assert!(lc.is_active());
    }

    #[test]
    fn in_flight_start_blocks_second_start() {
        let lc = Lifecycle::new("a", Duration::ZERO);
        let first = lc.begin_start().unwrap();
        assert!(matches!(lc.begin_start(), Err(ClusterError::AlreadyActive(_))));
        drop(first);
        assert!(!lc.is_active());
        lc.begin_start().unwrap().started(None);
    }

    #[test]
    fn clean_requires_inactive() {
        let lc = Lifecycle::new("a", Duration::ZERO);
        lc.begin_start().unwrap().started(None);
        assert!(matches!(lc.begin_clean(), Err(ClusterError::StillActive(_))));
        lc.begin_terminate().unwrap().0.terminated();
        lc.begin_clean().unwrap().cleaned();
    }

    #[test]
    fn restart_too_soon_after_terminate() {
        let lc = Lifecycle::new("a", Duration::from_secs(60));
        lc.begin_start().unwrap().started(None);
        lc.begin_terminate().unwrap().0.terminated();

        match lc.begin_restart() {
            Err(ClusterError::TooSoon { event, required, .. }) => {
                assert_eq!(event, LifecycleEvent::Terminate);
                assert_eq!(required, Duration::from_secs(60));
            }
            other => panic!("expected TooSoon, got {:?}", other.map(|_| ())),
        }
        assert!(!lc.is_active());
    }

    #[test]
    fn terminate_too_soon_after_restart() {
        let lc = Lifecycle::new("a", Duration::from_millis(50));
        lc.begin_start().unwrap().started(None);
        lc.begin_terminate().unwrap().0.terminated();
        std::thread::sleep(Duration::from_millis(60));
        lc.begin_restart().unwrap().restarted(None);

        assert!(matches!(
            lc.begin_terminate(),
            Err(ClusterError::TooSoon { event: LifecycleEvent::Restart, .. })
        ));

        std::thread::sleep(Duration::from_millis(60));
        lc.begin_terminate().unwrap().0.terminated();
    }

    #[test]
    fn failed_transition_keeps_timestamps() {
        let lc = Lifecycle::new("a", Duration::from_secs(60));
        let t = lc.begin_restart().unwrap();
        drop(t);
        let snap = lc.snapshot();
        assert!(snap.last_restarted.is_none());
        assert!(!snap.rejoin);
        lc.begin_restart().unwrap().restarted(None);
        assert!(lc.snapshot().rejoin);
    }

    #[test]
    fn start_after_terminate_is_not_rate_limited() {
        let lc = Lifecycle::new("a", Duration::from_secs(60));
        lc.begin_start().unwrap().started(None);
        lc.begin_terminate().unwrap().0.terminated();
        lc.begin_start().unwrap().started(None);
    }
}
