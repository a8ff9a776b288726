//! Redundant node failover
//!
//! Presents one virtual sensor source and one virtual actuator sink to the
//! control loop while tracking liveness of the sensor and actuator nodes.
//!
//! Each role runs `Primary → Failed → BackupActive`. A role is declared failed
//! only after `miss_threshold` consecutive cycles without a valid frame (sensor)
//! or with failed writes (actuator); a single quiet cycle only degrades it.
//! On failure the backup node is sent a takeover directive and from then on
//! serves the role with the same message schema. There is no automatic
//! fail-back: the role stays on the backup until [`FailoverCoordinator::reset`].
//!
//! At any instant a role has at most one active source. While the backup
//! serves the sensor role, frames arriving from the old primary are discarded.

use serde::Serialize;
use std::fmt;

use crate::actuation::ActuatorSink;
use crate::protocol::{
    ActuatorCommand, Directive, Link, LinkError, Role, SensorLimits, SensorSample,
};

/// Observed condition of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Failed,
}

/// Failover state of one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoleState {
    Primary,
    Failed,
    BackupActive,
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleState::Primary => write!(f, "primary"),
            RoleState::Failed => write!(f, "failed"),
            RoleState::BackupActive => write!(f, "backup"),
        }
    }
}

/// Node currently serving a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Primary,
    Backup,
}

/// What one cycle revealed about a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    Alive,
    Missed,
    /// Nothing was expected from the node this cycle
    #[default]
    Idle,
}

impl Liveness {
    /// Fold two observations from the same cycle; a miss wins
    fn merge(self, other: Liveness) -> Liveness {
        match (self, other) {
            (Liveness::Missed, _) | (_, Liveness::Missed) => Liveness::Missed,
            (Liveness::Alive, _) | (_, Liveness::Alive) => Liveness::Alive,
            _ => Liveness::Idle,
        }
    }
}

/// Consecutive-miss counter behind [`NodeHealth`]
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    threshold: u32,
    misses: u32,
}

impl LivenessMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            misses: 0,
        }
    }

    pub fn observe(&mut self, liveness: Liveness) -> NodeHealth {
        match liveness {
            Liveness::Alive => self.misses = 0,
            Liveness::Missed => self.misses = self.misses.saturating_add(1),
            Liveness::Idle => {}
        }
        self.health()
    }

    pub fn health(&self) -> NodeHealth {
        if self.misses == 0 {
            NodeHealth::Healthy
        } else if self.misses < self.threshold {
            NodeHealth::Degraded
        } else {
            NodeHealth::Failed
        }
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn reset(&mut self) {
        self.misses = 0;
    }
}

/// Role transitions reported by [`FailoverCoordinator::check_health`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverEvent {
    NodeFailed(Role),
    TakeoverIssued(Role),
    TakeoverFailed(Role),
}

#[derive(Debug)]
struct RoleTracker {
    role: Role,
    state: RoleState,
    monitor: LivenessMonitor,
    observed: Liveness,
}

impl RoleTracker {
    fn new(role: Role, threshold: u32) -> Self {
        Self {
            role,
            state: RoleState::Primary,
            monitor: LivenessMonitor::new(threshold),
            observed: Liveness::Idle,
        }
    }

    fn note(&mut self, liveness: Liveness) {
        self.observed = self.observed.merge(liveness);
    }
}

/// Virtual sensor source / actuator sink over primary and backup links
pub struct FailoverCoordinator {
    sensor_link: Box<dyn Link>,
    actuator_link: Box<dyn Link>,
    backup_link: Box<dyn Link>,
    limits: SensorLimits,
    sensor: RoleTracker,
    actuator: RoleTracker,
    backup_monitor: LivenessMonitor,
    backup_observed: Liveness,
    malformed_frames: u64,
}

impl FailoverCoordinator {
    pub fn new(
        sensor_link: Box<dyn Link>,
        actuator_link: Box<dyn Link>,
        backup_link: Box<dyn Link>,
        limits: SensorLimits,
        miss_threshold: u32,
    ) -> Self {
        Self {
            sensor_link,
            actuator_link,
            backup_link,
            limits,
            sensor: RoleTracker::new(Role::Sensor, miss_threshold),
            actuator: RoleTracker::new(Role::Actuator, miss_threshold),
            backup_monitor: LivenessMonitor::new(miss_threshold),
            backup_observed: Liveness::Idle,
            malformed_frames: 0,
        }
    }

    fn tracker(&self, role: Role) -> &RoleTracker {
        match role {
            Role::Sensor => &self.sensor,
            Role::Actuator => &self.actuator,
        }
    }

    fn tracker_mut(&mut self, role: Role) -> &mut RoleTracker {
        match role {
            Role::Sensor => &mut self.sensor,
            Role::Actuator => &mut self.actuator,
        }
    }

    pub fn state(&self, role: Role) -> RoleState {
        self.tracker(role).state
    }

    /// Health of the primary node for `role`
    pub fn health(&self, role: Role) -> NodeHealth {
        match self.tracker(role).state {
            RoleState::Primary => self.tracker(role).monitor.health(),
            RoleState::Failed | RoleState::BackupActive => NodeHealth::Failed,
        }
    }

    pub fn backup_health(&self) -> NodeHealth {
        self.backup_monitor.health()
    }

    /// Node currently trusted for `role`, if any
    pub fn active_source(&self, role: Role) -> Option<Source> {
        match self.tracker(role).state {
            RoleState::Primary => Some(Source::Primary),
            RoleState::Failed => None,
            RoleState::BackupActive => Some(Source::Backup),
        }
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    fn backup_serves_any(&self) -> bool {
        self.sensor.state == RoleState::BackupActive || self.actuator.state == RoleState::BackupActive
    }

    /// Evaluate the observations gathered since the previous call and move
    /// roles whose primary has gone silent over to the backup node
    pub fn check_health(&mut self) -> Vec<FailoverEvent> {
        let mut events = Vec::new();

        let backup_observed = std::mem::take(&mut self.backup_observed);
        if self.backup_serves_any() {
            let before = self.backup_monitor.health();
            let after = self.backup_monitor.observe(backup_observed);
            if after == NodeHealth::Failed && before != NodeHealth::Failed {
                tracing::error!("backup node unresponsive; no further failover target");
            }
        }

        for role in [Role::Sensor, Role::Actuator] {
            let tracker = self.tracker_mut(role);
            let observed = std::mem::take(&mut tracker.observed);

            if tracker.state == RoleState::Primary {
                let health = tracker.monitor.observe(observed);
                if health == NodeHealth::Degraded {
                    tracing::debug!(role = %role, misses = tracker.monitor.misses(), "primary node quiet");
                }
                if health == NodeHealth::Failed {
                    tracing::warn!(role = %role, misses = tracker.monitor.misses(), "primary node failed");
                    tracker.state = RoleState::Failed;
                    events.push(FailoverEvent::NodeFailed(role));
                }
            }

            if self.tracker(role).state == RoleState::Failed {
                events.push(self.take_over(role));
            }
        }

        events
    }

    fn take_over(&mut self, role: Role) -> FailoverEvent {
        match self.backup_link.send_line(Directive::TakeOver(role).as_str()) {
            Ok(()) => {
                tracing::info!(role = %role, "backup node took over");
                self.tracker_mut(role).state = RoleState::BackupActive;
                FailoverEvent::TakeoverIssued(role)
            }
            Err(e) => {
                tracing::error!(role = %role, "takeover directive failed: {e}");
                FailoverEvent::TakeoverFailed(role)
            }
        }
    }

    /// Operator reset: hand `role` back to its primary node with a clean slate
    pub fn reset(&mut self, role: Role) {
        let previous = self.tracker(role).state;
        if previous == RoleState::BackupActive {
            if let Err(e) = self.backup_link.send_line(Directive::Release(role).as_str()) {
                tracing::warn!(role = %role, "release directive failed: {e}");
            }
        }

        let tracker = self.tracker_mut(role);
        tracker.state = RoleState::Primary;
        tracker.monitor.reset();
        tracker.observed = Liveness::Idle;
        if !self.backup_serves_any() {
            self.backup_monitor.reset();
        }
        tracing::info!(role = %role, from = %previous, "role reset to primary");
    }

    /// Read the freshest valid sample from the active sensor source.
    ///
    /// Drains every buffered frame so stale samples never carry over; the
    /// inactive node's frames are discarded.
    pub fn read_sensor(&mut self) -> Option<SensorSample> {
        // Actuator nodes may report back; any frame proves they are alive
        let actuator_frames = drain_count(self.actuator_link.as_mut());
        if actuator_frames > 0 && self.actuator.state == RoleState::Primary {
            self.actuator.note(Liveness::Alive);
        }

        match self.sensor.state {
            RoleState::Primary => {
                let (sample, liveness) = self.read_frames(Source::Primary);
                self.sensor.note(liveness);
                if self.backup_serves_any() {
                    // backup only holds the actuator role; its chatter still counts
                    if drain_count(self.backup_link.as_mut()) > 0 {
                        self.backup_observed = self.backup_observed.merge(Liveness::Alive);
                    }
                } else {
                    drain_count(self.backup_link.as_mut());
                }
                sample
            }
            RoleState::Failed => {
                drain_count(self.sensor_link.as_mut());
                None
            }
            RoleState::BackupActive => {
                drain_count(self.sensor_link.as_mut());
                let (sample, liveness) = self.read_frames(Source::Backup);
                self.backup_observed = self.backup_observed.merge(liveness);
                sample
            }
        }
    }

    fn read_frames(&mut self, source: Source) -> (Option<SensorSample>, Liveness) {
        let link = match source {
            Source::Primary => self.sensor_link.as_mut(),
            Source::Backup => self.backup_link.as_mut(),
        };

        let mut latest = None;
        loop {
            match link.try_recv_line() {
                Ok(Some(line)) => {
                    if Directive::parse(&line).is_some() {
                        continue;
                    }
                    match SensorSample::decode(&line, &self.limits) {
                        Ok(sample) => latest = Some(sample),
                        Err(e) => {
                            self.malformed_frames += 1;
                            tracing::warn!(link = link.name(), "dropping malformed frame: {e}");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(link = link.name(), "sensor read failed: {e}");
                    break;
                }
            }
        }

        let liveness = if latest.is_some() {
            Liveness::Alive
        } else {
            Liveness::Missed
        };
        (latest, liveness)
    }
}

impl ActuatorSink for FailoverCoordinator {
    fn dispatch(&mut self, command: &ActuatorCommand) -> Result<(), LinkError> {
        let line = command.encode();
        match self.actuator.state {
            RoleState::Primary => {
                let result = self.actuator_link.send_line(&line);
                self.actuator.note(if result.is_ok() {
                    Liveness::Alive
                } else {
                    Liveness::Missed
                });
                result
            }
            RoleState::Failed => Err(LinkError::Disconnected),
            RoleState::BackupActive => {
                let result = self.backup_link.send_line(&line);
                self.backup_observed = self.backup_observed.merge(if result.is_ok() {
                    Liveness::Alive
                } else {
                    Liveness::Missed
                });
                result
            }
        }
    }
}

fn drain_count(link: &mut dyn Link) -> usize {
    link.drain().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_degrades_before_failing() {
        let mut monitor = LivenessMonitor::new(3);
        assert_eq!(monitor.observe(Liveness::Missed), NodeHealth::Degraded);
        assert_eq!(monitor.observe(Liveness::Idle), NodeHealth::Degraded);
        assert_eq!(monitor.observe(Liveness::Missed), NodeHealth::Degraded);
        assert_eq!(monitor.observe(Liveness::Missed), NodeHealth::Failed);
    }

    #[test]
    fn alive_clears_misses() {
        let mut monitor = LivenessMonitor::new(2);
        monitor.observe(Liveness::Missed);
        assert_eq!(monitor.observe(Liveness::Alive), NodeHealth::Healthy);
        assert_eq!(monitor.misses(), 0);
    }

    #[test]
    fn miss_dominates_merge() {
        assert_eq!(Liveness::Alive.merge(Liveness::Missed), Liveness::Missed);
        assert_eq!(Liveness::Idle.merge(Liveness::Alive), Liveness::Alive);
        assert_eq!(Liveness::Idle.merge(Liveness::Idle), Liveness::Idle);
    }
}
