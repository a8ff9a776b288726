//! Actuation Scheduling
//!
//! Host-side half of the injector/ignition timing contract.
//!
//! The actuator node fires a command by holding the injector line HIGH for
//! the injector pulse, then the ignition line for the ignition pulse, and
//! cannot accept another command until both are done. The host therefore
//! keeps a model of how long the node stays busy and only admits a command if
//! it would start within the current cycle's budget. Commands that would
//! start later are deferred (dropped for this cycle) rather than left to
//! queue up on the node, which would drift actuation away from engine phase.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ActuatorCommand, LinkError, MAX_CYLINDERS};

/// Errors raised while validating or dispatching actuation
#[derive(Error, Debug)]
pub enum ActuationError {
    #[error("Invalid {line} duration: {value} ms")]
    InvalidDuration { line: &'static str, value: f64 },

    #[error("Cylinder {0} has no pin assignment")]
    UnmappedCylinder(u8),

    #[error("Pin {0} assigned more than once")]
    DuplicatePin(u8),

    #[error("Cylinder {0} is not connected")]
    NotConnected(u8),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Anything that can deliver a command to the active actuator node
pub trait ActuatorSink {
    fn dispatch(&mut self, command: &ActuatorCommand) -> Result<(), LinkError>;
}

/// Pulse durations at the node's microsecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTiming {
    pub injector_us: u32,
    pub ignition_us: u32,
}

fn ms_to_us(line: &'static str, ms: f64) -> Result<u32, ActuationError> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(ActuationError::InvalidDuration { line, value: ms });
    }
    Ok((ms * 1000.0).round().min(u32::MAX as f64) as u32)
}

impl PulseTiming {
    pub fn from_command(command: &ActuatorCommand) -> Result<Self, ActuationError> {
        Ok(Self {
            injector_us: ms_to_us("injector", command.injector_pulse_ms)?,
            ignition_us: ms_to_us("ignition", command.ignition_advance_ms)?,
        })
    }

    /// Neither line would be asserted
    pub fn is_noop(&self) -> bool {
        self.injector_us == 0 && self.ignition_us == 0
    }

    /// Time the node is blocked executing this command
    pub fn duration(&self) -> Duration {
        Duration::from_micros(u64::from(self.injector_us) + u64::from(self.ignition_us))
    }
}

/// Output pins driving one cylinder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CylinderPins {
    pub injector: u8,
    pub ignition: u8,
}

/// Static cylinder → pin assignment of the actuator node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinMap {
    pins: BTreeMap<u8, CylinderPins>,
}

impl Default for PinMap {
    /// Actuator node wiring: injectors on D9/D11/D13/D15, ignition on
    /// D10/D12/D14/D16
    fn default() -> Self {
        let pins = (1..=MAX_CYLINDERS)
            .map(|cyl| {
                let base = 7 + 2 * cyl;
                (
                    cyl,
                    CylinderPins {
                        injector: base,
                        ignition: base + 1,
                    },
                )
            })
            .collect();
        Self { pins }
    }
}

impl PinMap {
    pub fn new(pins: BTreeMap<u8, CylinderPins>) -> Self {
        Self { pins }
    }

    pub fn get(&self, cylinder: u8) -> Option<CylinderPins> {
        self.pins.get(&cylinder).copied()
    }

    /// Every connected cylinder must be mapped, and no pin may drive two lines
    pub fn validate(&self, connected: &[u8]) -> Result<(), ActuationError> {
        let mut used = BTreeSet::new();
        for &cyl in connected {
            let pins = self.get(cyl).ok_or(ActuationError::UnmappedCylinder(cyl))?;
            for pin in [pins.injector, pins.ignition] {
                if !used.insert(pin) {
                    return Err(ActuationError::DuplicatePin(pin));
                }
            }
        }
        Ok(())
    }

    /// Cylinders `1..=max` whose injector and ignition outputs both respond
    pub fn detect_connected<F>(&self, max: u8, mut probe: F) -> Vec<u8>
    where
        F: FnMut(u8) -> bool,
    {
        (1..=max)
            .filter(|&cyl| match self.get(cyl) {
                Some(pins) => probe(pins.injector) && probe(pins.ignition),
                None => false,
            })
            .collect()
    }
}

/// What happened to one command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FireOutcome {
    /// Handed to the actuator sink; the node starts it after `start_delay`
    Sent { start_delay: Duration },
    /// Node would still be busy past this cycle's budget
    Deferred { backlog: Duration },
    /// Both durations are zero; nothing sent
    NoOp,
}

/// Paces per-cylinder commands against the node's real-time budget
#[derive(Debug)]
pub struct ActuationScheduler {
    pins: PinMap,
    connected: BTreeSet<u8>,
    slack: Duration,
    budget: Duration,
    busy_until: Duration,
}

impl ActuationScheduler {
    /// `budget` is the longest the node may lag behind the host before new
    /// commands are deferred (normally one cycle period); `slack` is added
    /// after every command for UART transfer and line settling.
    pub fn new(
        pins: PinMap,
        connected: &[u8],
        slack: Duration,
        budget: Duration,
    ) -> Result<Self, ActuationError> {
        pins.validate(connected)?;
        Ok(Self {
            pins,
            connected: connected.iter().copied().collect(),
            slack,
            budget,
            busy_until: Duration::ZERO,
        })
    }

    pub fn pins(&self) -> &PinMap {
        &self.pins
    }

    /// How long the node is projected to stay busy after `now`
    pub fn backlog(&self, now: Duration) -> Duration {
        self.busy_until.saturating_sub(now)
    }

    /// Send one command through `sink` if the node can start it in budget.
    /// `now` is monotonic time since the scheduler's epoch.
    pub fn fire<S: ActuatorSink + ?Sized>(
        &mut self,
        sink: &mut S,
        now: Duration,
        command: &ActuatorCommand,
    ) -> Result<FireOutcome, ActuationError> {
        if !self.connected.contains(&command.cylinder) {
            return Err(ActuationError::NotConnected(command.cylinder));
        }
        let timing = PulseTiming::from_command(command)?;
        if timing.is_noop() {
            return Ok(FireOutcome::NoOp);
        }

        let start_delay = self.backlog(now);
        if start_delay >= self.budget {
            tracing::debug!(
                cylinder = command.cylinder,
                backlog_us = start_delay.as_micros() as u64,
                "actuator node saturated, deferring command"
            );
            return Ok(FireOutcome::Deferred {
                backlog: start_delay,
            });
        }

        sink.dispatch(command)?;
        self.busy_until = now.max(self.busy_until) + timing.duration() + self.slack;
        Ok(FireOutcome::Sent { start_delay })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<ActuatorCommand>,
        fail: bool,
    }

    impl ActuatorSink for RecordingSink {
        fn dispatch(&mut self, command: &ActuatorCommand) -> Result<(), LinkError> {
            if self.fail {
                return Err(LinkError::Timeout);
            }
            self.sent.push(*command);
            Ok(())
        }
    }

    fn scheduler(budget_ms: u64) -> ActuationScheduler {
        ActuationScheduler::new(
            PinMap::default(),
            &[1, 2, 3, 4],
            Duration::ZERO,
            Duration::from_millis(budget_ms),
        )
        .unwrap()
    }

    #[test]
    fn converts_ms_to_us() {
        let timing = PulseTiming::from_command(&ActuatorCommand::new(1, 2.5, 0.0126)).unwrap();
        assert_eq!(timing.injector_us, 2500);
        assert_eq!(timing.ignition_us, 13);
    }

    #[test]
    fn negative_duration_is_rejected() {
        let err = PulseTiming::from_command(&ActuatorCommand::new(1, -1.0, 1.0)).unwrap_err();
        assert!(matches!(err, ActuationError::InvalidDuration { line: "injector", .. }));
    }

    #[test]
    fn default_pins_match_node_wiring() {
        let pins = PinMap::default();
        assert_eq!(pins.get(1), Some(CylinderPins { injector: 9, ignition: 10 }));
        assert_eq!(pins.get(4), Some(CylinderPins { injector: 15, ignition: 16 }));
        assert!(pins.validate(&[1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn duplicate_pin_fails_validation() {
        let mut map = BTreeMap::new();
        map.insert(1, CylinderPins { injector: 9, ignition: 10 });
        map.insert(2, CylinderPins { injector: 10, ignition: 12 });
        let err = PinMap::new(map).validate(&[1, 2]).unwrap_err();
        assert!(matches!(err, ActuationError::DuplicatePin(10)));
    }

    #[test]
    fn unmapped_cylinder_fails_validation() {
        let err = ActuationScheduler::new(PinMap::default(), &[5], Duration::ZERO, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ActuationError::UnmappedCylinder(5)));
    }

    #[test]
    fn detect_requires_both_outputs() {
        let connected = PinMap::default().detect_connected(4, |pin| pin != 14);
        assert_eq!(connected, vec![1, 2, 4]);
    }

    #[test]
    fn zero_pulse_is_noop() {
        let mut sched = scheduler(50);
        let mut sink = RecordingSink::default();
        let outcome = sched
            .fire(&mut sink, Duration::ZERO, &ActuatorCommand::new(1, 0.0, 0.0))
            .unwrap();
        assert_eq!(outcome, FireOutcome::NoOp);
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn commands_serialize_within_budget() {
        let mut sched = scheduler(25);
        let mut sink = RecordingSink::default();
        let now = Duration::ZERO;

        // 10 ms per command: starts at 0, 10, 20, then 30 would exceed 25
        let outcomes: Vec<_> = (1..=4)
            .map(|cyl| sched.fire(&mut sink, now, &ActuatorCommand::new(cyl, 5.0, 5.0)).unwrap())
            .collect();

        assert_eq!(outcomes[0], FireOutcome::Sent { start_delay: Duration::ZERO });
        assert_eq!(outcomes[2], FireOutcome::Sent { start_delay: Duration::from_millis(20) });
        assert!(matches!(outcomes[3], FireOutcome::Deferred { .. }));
        assert_eq!(sink.sent.len(), 3);

        // once the node has drained, commands are admitted again
        let later = Duration::from_millis(30);
        assert_eq!(sched.backlog(later), Duration::ZERO);
        assert!(matches!(
            sched.fire(&mut sink, later, &ActuatorCommand::new(4, 5.0, 5.0)).unwrap(),
            FireOutcome::Sent { .. }
        ));
    }

    #[test]
    fn link_failure_does_not_consume_budget() {
        let mut sched = scheduler(50);
        let mut sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let err = sched
            .fire(&mut sink, Duration::ZERO, &ActuatorCommand::new(1, 5.0, 5.0))
            .unwrap_err();
        assert!(matches!(err, ActuationError::Link(LinkError::Timeout)));
        assert_eq!(sched.backlog(Duration::ZERO), Duration::ZERO);
    }
}
