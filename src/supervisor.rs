//! Page-side worker supervision.
//!
//! Detects a crashed or hung worker and surfaces it as a single user-visible
//! error instead of hanging silently. Liveness is an explicit state machine
//! ({uninitialized, alive, dead}) rather than scattered flags; transitions
//! are driven by probe ticks, heartbeat echoes, and fatal transport faults.
//! Once dead, the handle is torn down and nulled so a later action can
//! recreate it; recreation resets liveness to alive.

use crate::config::WorkerConfig;
use crate::error::{ChatError, Result};
use crate::pipeline::GenerationBackend;
use crate::protocol::{WorkerEvent, WorkerRequest};
use crate::worker::{self, WorkerHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Factory producing a fresh backend for each spawned worker.
pub type BackendFactory = Arc<dyn Fn() -> Arc<dyn GenerationBackend> + Send + Sync>;

/// Worker liveness as seen from the page side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Liveness {
    /// No worker has been created yet.
    #[default]
    Uninitialized,
    /// The worker is believed reachable.
    Alive,
    /// The worker has been declared dead; its events are no longer trusted.
    Dead,
}

/// Outcome of one probe tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Echo seen since the previous probe (or first probe of a session).
    Responsive,
    /// No echo since the previous probe; not yet at the limit.
    Missed(u32),
    /// Transitioned to dead on this tick. Reported exactly once.
    Died,
    /// Already dead; probing has stopped mattering.
    AlreadyDead,
}

/// Deterministic liveness core, separated from timers so the two-missed-probes
/// contract can be tested without a clock.
#[derive(Debug)]
pub struct LivenessProbe {
    state: Liveness,
    missed_limit: u32,
    missed: u32,
    awaiting_echo: bool,
}

impl LivenessProbe {
    #[must_use]
    pub fn new(missed_limit: u32) -> Self {
        Self {
            state: Liveness::Uninitialized,
            missed_limit: missed_limit.max(1),
            missed: 0,
            awaiting_echo: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> Liveness {
        self.state
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state == Liveness::Dead
    }

    /// A fresh worker exists; trust it until probes say otherwise.
    pub fn reset_alive(&mut self) {
        self.state = Liveness::Alive;
        self.missed = 0;
        self.awaiting_echo = false;
    }

    /// Record one probe tick. `reachable` is false when the worker reference
    /// is absent or its channel is closed, which kills the session
    /// immediately.
    pub fn on_probe_tick(&mut self, reachable: bool) -> ProbeOutcome {
        match self.state {
            Liveness::Dead => return ProbeOutcome::AlreadyDead,
            Liveness::Uninitialized | Liveness::Alive => {}
        }
        if !reachable {
            self.state = Liveness::Dead;
            return ProbeOutcome::Died;
        }
        self.state = Liveness::Alive;
        if self.awaiting_echo {
            self.missed += 1;
            if self.missed >= self.missed_limit {
                self.state = Liveness::Dead;
                return ProbeOutcome::Died;
            }
            return ProbeOutcome::Missed(self.missed);
        }
        self.awaiting_echo = true;
        ProbeOutcome::Responsive
    }

    /// A heartbeat echo arrived; clear the miss counter.
    pub fn on_echo(&mut self) {
        if self.state != Liveness::Dead {
            self.awaiting_echo = false;
            self.missed = 0;
        }
    }

    /// A fatal transport fault. Returns true only on the transition to dead,
    /// so the caller surfaces exactly one error.
    pub fn on_fatal(&mut self) -> bool {
        if self.state == Liveness::Dead {
            return false;
        }
        self.state = Liveness::Dead;
        true
    }
}

/// Owns the worker handle and its liveness.
pub struct Supervisor {
    config: WorkerConfig,
    factory: BackendFactory,
    handle: Option<WorkerHandle>,
    probe: LivenessProbe,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: WorkerConfig, factory: BackendFactory) -> Self {
        let probe = LivenessProbe::new(config.effective_missed_probe_limit());
        Self {
            config,
            factory,
            handle: None,
            probe,
        }
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.probe.state()
    }

    /// Spawn a worker if none is running (or the last one died). Returns the
    /// new event stream when a worker was spawned.
    pub fn ensure_worker(&mut self) -> Option<mpsc::Receiver<WorkerEvent>> {
        if self.handle.is_some() && !self.probe.is_dead() {
            return None;
        }
        Some(self.respawn())
    }

    /// Tear down any existing worker and spawn a fresh one. Resets liveness
    /// to alive.
    pub fn respawn(&mut self) -> mpsc::Receiver<WorkerEvent> {
        self.teardown();
        info!("spawning inference worker");
        let backend = (self.factory)();
        let (handle, events) = worker::spawn(backend, &self.config);
        self.handle = Some(handle);
        self.probe.reset_alive();
        events
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.terminate();
        }
    }

    /// Forward a generation request to the worker.
    ///
    /// # Errors
    ///
    /// Returns a channel error when no worker is running or the send fails;
    /// a closed channel also marks the session dead.
    pub fn send_generate(&mut self, text: String) -> Result<()> {
        let Some(handle) = &self.handle else {
            return Err(ChatError::Channel("worker not running".to_owned()));
        };
        match handle.send(WorkerRequest::Generate { text }) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !handle.is_reachable() {
                    self.fail("worker request channel closed");
                }
                Err(e)
            }
        }
    }

    /// One liveness tick: send a ping and account for the echo (or lack of
    /// one) since the previous tick. Returns a user-visible death message
    /// exactly once, on the tick that declares the worker dead.
    pub fn probe_tick(&mut self) -> Option<String> {
        let reachable = self
            .handle
            .as_ref()
            .is_some_and(WorkerHandle::is_reachable);
        if reachable {
            // Full queue still counts as reachable; don't stack pings.
            if let Some(handle) = &self.handle {
                let _ = handle.send(WorkerRequest::Heartbeat);
            }
        }
        match self.probe.on_probe_tick(reachable) {
            ProbeOutcome::Died => {
                self.teardown();
                let message = if reachable {
                    "worker died: unresponsive to consecutive liveness probes".to_owned()
                } else {
                    "worker died: channel unreachable".to_owned()
                };
                warn!("{message}");
                Some(message)
            }
            ProbeOutcome::Missed(count) => {
                warn!("liveness probe missed ({count})");
                None
            }
            ProbeOutcome::Responsive | ProbeOutcome::AlreadyDead => None,
        }
    }

    /// A heartbeat echo arrived on the event stream.
    pub fn note_echo(&mut self) {
        self.probe.on_echo();
    }

    /// Mark the session dead after a transport fault. Returns true only on
    /// the transition, so callers surface exactly one error.
    pub fn fail(&mut self, reason: &str) -> bool {
        let newly_dead = self.probe.on_fatal();
        if newly_dead {
            warn!("worker marked dead: {reason}");
            self.teardown();
        }
        newly_dead
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn absent_worker_dies_on_first_tick() {
        let mut probe = LivenessProbe::new(2);
        assert_eq!(probe.on_probe_tick(false), ProbeOutcome::Died);
        assert_eq!(probe.state(), Liveness::Dead);
    }

    #[test]
    fn two_missed_probes_kill_exactly_once() {
        let mut probe = LivenessProbe::new(2);
        probe.reset_alive();
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Responsive);
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Missed(1));
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Died);
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::AlreadyDead);
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::AlreadyDead);
    }

    #[test]
    fn echo_clears_the_miss_counter() {
        let mut probe = LivenessProbe::new(2);
        probe.reset_alive();
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Responsive);
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Missed(1));
        probe.on_echo();
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Responsive);
        assert_eq!(probe.state(), Liveness::Alive);
    }

    #[test]
    fn fatal_reports_transition_only_once() {
        let mut probe = LivenessProbe::new(2);
        probe.reset_alive();
        assert!(probe.on_fatal());
        assert!(!probe.on_fatal());
    }

    #[test]
    fn echo_after_death_is_ignored() {
        let mut probe = LivenessProbe::new(1);
        probe.reset_alive();
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Responsive);
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Died);
        probe.on_echo();
        assert!(probe.is_dead());
    }

    #[test]
    fn limit_is_floored_at_one() {
        let mut probe = LivenessProbe::new(0);
        probe.reset_alive();
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Responsive);
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Died);
    }

    #[test]
    fn reset_alive_revives_after_death() {
        let mut probe = LivenessProbe::new(1);
        probe.reset_alive();
        probe.on_probe_tick(false);
        assert!(probe.is_dead());
        probe.reset_alive();
        assert_eq!(probe.state(), Liveness::Alive);
        assert_eq!(probe.on_probe_tick(true), ProbeOutcome::Responsive);
    }
}
