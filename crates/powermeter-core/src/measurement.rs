//! Measurements produced by the measuring unit

use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
        }
    }
}

/// One complete reading of the measuring unit. The first entry is the
/// quantity the trackers record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementList(Vec<Measurement>);

impl MeasurementList {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, measurement: Measurement) {
        self.0.push(measurement);
    }

    pub fn get(&self, name: &str) -> Option<&Measurement> {
        self.0.iter().find(|m| m.name == name)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Measurement> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value fed to the trackers, if anything was measured yet.
    pub fn tracker_value(&self) -> Option<f64> {
        self.0.first().map(|m| m.value)
    }
}

impl From<Vec<Measurement>> for MeasurementList {
    fn from(measurements: Vec<Measurement>) -> Self {
        Self(measurements)
    }
}

impl FromIterator<Measurement> for MeasurementList {
    fn from_iter<I: IntoIterator<Item = Measurement>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Source of measurements (the AC front end, or a simulation).
pub trait MeasuringUnit {
    fn measure(&mut self) -> impl Future<Output = Result<MeasurementList>>;
}

/// Derived quantities of a single-phase AC reading.
///
/// Negative or non-finite inputs and results are reported as 0. A power factor
/// above 0.99 is reported as 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcPower {
    voltage_v: f64,
    current_a: f64,
    active_power_w: f64,
}

impl AcPower {
    pub fn new(voltage_v: f64, current_a: f64, active_power_w: f64) -> Self {
        Self {
            voltage_v,
            current_a,
            active_power_w,
        }
    }

    pub fn voltage_v(&self) -> f64 {
        non_negative(self.voltage_v)
    }

    pub fn current_a(&self) -> f64 {
        non_negative(self.current_a)
    }

    pub fn active_power_w(&self) -> f64 {
        non_negative(self.active_power_w)
    }

    pub fn apparent_power_va(&self) -> f64 {
        non_negative(self.voltage_v * self.current_a)
    }

    pub fn reactive_power_var(&self) -> f64 {
        let apparent = self.apparent_power_va();
        let squared = apparent * apparent - self.active_power_w * self.active_power_w;
        non_negative(libm::sqrt(squared))
    }

    pub fn power_factor(&self) -> f64 {
        let power_factor = non_negative(self.active_power_w / self.apparent_power_va());
        if power_factor > 0.99 { 1.0 } else { power_factor }
    }

    /// Active power first, so it becomes the tracked value.
    pub fn measurements(&self) -> MeasurementList {
        [
            Measurement::new("Active Power", self.active_power_w(), "W"),
            Measurement::new("Apparent Power", self.apparent_power_va(), "VA"),
            Measurement::new("Reactive Power", self.reactive_power_var(), "var"),
            Measurement::new("Voltage", self.voltage_v(), "V"),
            Measurement::new("Current", self.current_a(), "A"),
            Measurement::new("Power Factor", self.power_factor(), ""),
        ]
        .into_iter()
        .collect()
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ac_power_derivations() {
        let power = AcPower::new(230.0, 2.0, 368.0);
        assert_relative_eq!(power.apparent_power_va(), 460.0);
        assert_relative_eq!(power.reactive_power_var(), 276.0, epsilon = 1e-9);
        assert_relative_eq!(power.power_factor(), 0.8);
    }

    #[test]
    fn test_ac_power_clamps() {
        let idle = AcPower::new(230.0, 0.0, 0.0);
        assert_eq!(idle.apparent_power_va(), 0.0);
        assert_eq!(idle.power_factor(), 0.0);
        assert_eq!(idle.reactive_power_var(), 0.0);

        let resistive = AcPower::new(230.0, 1.0, 229.0);
        assert_eq!(resistive.power_factor(), 1.0);
        // Active above apparent (measurement noise): no reactive power.
        assert_eq!(AcPower::new(230.0, 1.0, 231.0).reactive_power_var(), 0.0);
        assert_eq!(AcPower::new(-1.0, 1.0, -5.0).active_power_w(), 0.0);
    }

    #[test]
    fn test_tracker_value_is_active_power() {
        let list = AcPower::new(230.0, 2.0, 368.0).measurements();
        assert_eq!(list.len(), 6);
        assert_eq!(list.tracker_value(), Some(368.0));
        assert_eq!(list.get("Voltage").map(|m| m.unit.as_str()), Some("V"));
        assert_eq!(MeasurementList::new().tracker_value(), None);
    }
}
