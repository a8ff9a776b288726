//! Typed wire messages
//!
//! Every frame on a node link is one JSON object (or a bare directive token)
//! terminated by `\n`. Decoding validates field presence and physical range
//! before a typed value is handed to the rest of the system, so a garbled frame
//! surfaces as [`MessageError`] instead of zeros.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use super::{MessageError, MAX_CYLINDERS};

/// Dynamometer feedback attached to a sensor frame while dyno mode is active
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynoData {
    pub hp: f64,
    pub torque: f64,
}

/// One sensor reading, valid for a single control cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Engine speed (rev/min)
    pub rpm: f64,
    /// Manifold absolute pressure (kPa)
    pub map: f64,
    /// Measured air-fuel ratio
    pub afr: f64,
    /// Engine block temperature (°C)
    pub engine_temp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "dyno_data")]
    pub dyno: Option<DynoData>,
}

/// Physical bounds applied when decoding sensor frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorLimits {
    pub rpm: RangeInclusive<f64>,
    pub map: RangeInclusive<f64>,
    pub afr: RangeInclusive<f64>,
    pub engine_temp: RangeInclusive<f64>,
}

impl Default for SensorLimits {
    fn default() -> Self {
        Self {
            rpm: 0.0..=20_000.0,
            map: 0.0..=250.0,
            afr: 6.0..=25.0,
            engine_temp: -40.0..=200.0,
        }
    }
}

fn check(field: &'static str, value: f64, range: &RangeInclusive<f64>) -> Result<(), MessageError> {
    if value.is_finite() && range.contains(&value) {
        Ok(())
    } else {
        Err(MessageError::OutOfRange { field, value })
    }
}

impl SensorSample {
    /// Decode one sensor frame and validate it against `limits`
    pub fn decode(line: &str, limits: &SensorLimits) -> Result<Self, MessageError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MessageError::Empty);
        }

        let sample: SensorSample = serde_json::from_str(line)?;
        check("rpm", sample.rpm, &limits.rpm)?;
        check("map", sample.map, &limits.map)?;
        check("afr", sample.afr, &limits.afr)?;
        check("engine_temp", sample.engine_temp, &limits.engine_temp)?;
        if let Some(dyno) = sample.dyno {
            check("hp", dyno.hp, &(0.0..=f64::MAX))?;
            check("torque", dyno.torque, &(0.0..=f64::MAX))?;
        }
        Ok(sample)
    }

    /// Encode as a single frame (no trailing newline)
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Per-cylinder actuation request for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub cylinder: u8,
    /// Injector open time (ms)
    #[serde(rename = "injector")]
    pub injector_pulse_ms: f64,
    /// Ignition output pulse (ms). Placeholder encoding: the node drives this
    /// through the same HIGH/LOW primitive as the injector.
    #[serde(rename = "ignition")]
    pub ignition_advance_ms: f64,
}

impl ActuatorCommand {
    pub fn new(cylinder: u8, injector_pulse_ms: f64, ignition_advance_ms: f64) -> Self {
        Self {
            cylinder,
            injector_pulse_ms,
            ignition_advance_ms,
        }
    }

    /// Check cylinder number and pulse durations
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.cylinder == 0 || self.cylinder > MAX_CYLINDERS {
            return Err(MessageError::UnknownCylinder(self.cylinder));
        }
        check("injector", self.injector_pulse_ms, &(0.0..=f64::MAX))?;
        check("ignition", self.ignition_advance_ms, &(0.0..=f64::MAX))?;
        Ok(())
    }

    pub fn decode(line: &str) -> Result<Self, MessageError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MessageError::Empty);
        }
        let command: ActuatorCommand = serde_json::from_str(line)?;
        command.validate()?;
        Ok(command)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Logical role a node can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sensor,
    Actuator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sensor => write!(f, "sensor"),
            Role::Actuator => write!(f, "actuator"),
        }
    }
}

/// Role-selecting token sent to the backup node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    TakeOver(Role),
    Release(Role),
}

impl Directive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::TakeOver(Role::Sensor) => "take_over_sensor",
            Directive::TakeOver(Role::Actuator) => "take_over_actuator",
            Directive::Release(Role::Sensor) => "release_sensor",
            Directive::Release(Role::Actuator) => "release_actuator",
        }
    }

    /// Parse a directive token; anything else is not a directive
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "take_over_sensor" => Some(Directive::TakeOver(Role::Sensor)),
            "take_over_actuator" => Some(Directive::TakeOver(Role::Actuator)),
            "release_sensor" => Some(Directive::Release(Role::Sensor)),
            "release_actuator" => Some(Directive::Release(Role::Actuator)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sensor_frame_with_dyno_data() {
        let line = r#"{"rpm":3000,"map":60,"afr":13.5,"engine_temp":25,"dyno_data":{"hp":40.0,"torque":35.5}}"#;
        let sample = SensorSample::decode(line, &SensorLimits::default()).unwrap();

        assert_eq!(sample.rpm, 3000.0);
        assert_eq!(sample.dyno, Some(DynoData { hp: 40.0, torque: 35.5 }));
    }

    #[test]
    fn missing_field_is_malformed() {
        let line = r#"{"rpm":3000,"map":60,"engine_temp":25}"#;
        let err = SensorSample::decode(line, &SensorLimits::default()).unwrap_err();
        assert!(matches!(err, MessageError::Json(_)));
    }

    #[test]
    fn out_of_range_afr_is_rejected() {
        let line = r#"{"rpm":3000,"map":60,"afr":99.0,"engine_temp":25}"#;
        let err = SensorSample::decode(line, &SensorLimits::default()).unwrap_err();
        assert!(matches!(err, MessageError::OutOfRange { field: "afr", .. }));
    }

    #[test]
    fn command_uses_wire_field_names() {
        let cmd = ActuatorCommand::new(2, 3.5, 10.0);
        assert_eq!(cmd.encode(), r#"{"cylinder":2,"injector":3.5,"ignition":10.0}"#);
    }

    #[test]
    fn command_rejects_unknown_cylinder() {
        let err = ActuatorCommand::decode(r#"{"cylinder":7,"injector":1.0,"ignition":1.0}"#)
            .unwrap_err();
        assert!(matches!(err, MessageError::UnknownCylinder(7)));
    }

    #[test]
    fn directive_tokens() {
        assert_eq!(Directive::TakeOver(Role::Sensor).as_str(), "take_over_sensor");
        assert_eq!(
            Directive::parse("take_over_actuator\r"),
            Some(Directive::TakeOver(Role::Actuator))
        );
        assert_eq!(Directive::parse(r#"{"rpm":1}"#), None);
    }
}
