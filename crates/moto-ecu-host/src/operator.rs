//! Operator commands read line by line from stdin
//!
//! ```text
//! reset sensor | reset actuator   hand a role back to its primary node
//! clear-dyno                      leave dyno mode
//! profile efficiency|performance  switch the tuning profile
//! power-off                       simulate loss of the 12 V supply
//! quit                            orderly shutdown
//! ```

use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::warn;

use moto_ecu_core::fuel_map::Profile;
use moto_ecu_core::protocol::Role;

use crate::parse_profile;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    Reset(Role),
    ClearDyno,
    Profile(Profile),
    PowerOff,
    Quit,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let arg = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments to '{verb}'"));
        }

        match (verb.to_ascii_lowercase().as_str(), arg) {
            ("reset", Some(role)) => match role.to_ascii_lowercase().as_str() {
                "sensor" => Ok(Self::Reset(Role::Sensor)),
                "actuator" => Ok(Self::Reset(Role::Actuator)),
                other => Err(format!("unknown role '{other}' (expected sensor or actuator)")),
            },
            ("reset", None) => Err("reset needs a role: sensor or actuator".to_string()),
            ("profile", Some(profile)) => parse_profile(profile).map(Self::Profile),
            ("profile", None) => Err("profile needs a name: efficiency or performance".to_string()),
            ("clear-dyno", None) => Ok(Self::ClearDyno),
            ("power-off", None) => Ok(Self::PowerOff),
            ("quit" | "exit", None) => Ok(Self::Quit),
            (other, Some(_)) if ["clear-dyno", "power-off", "quit", "exit"].contains(&other) => {
                Err(format!("'{other}' takes no arguments"))
            }
            (other, _) => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Read commands from stdin on a dedicated thread.
///
/// Interactive stdin blocks indefinitely, so it stays off the runtime's
/// blocking pool. The channel closes when stdin reaches EOF.
pub fn spawn_stdin_reader(depth: usize) -> mpsc::Receiver<OperatorCommand> {
    let (tx, rx) = mpsc::channel(depth);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match OperatorCommand::parse(&line) {
                Ok(command) => {
                    if tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("ignoring operator input: {e}"),
            }
        }
    });
    rx
}
