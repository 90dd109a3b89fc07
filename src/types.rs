use std::fmt;

use chrono::DateTime;

/// Phase key for multi-phase metered gateways. Queries default to the
/// aggregate when no phase is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn index(&self) -> usize {
        match self {
            Phase::L1 => 0,
            Phase::L2 => 1,
            Phase::L3 => 2,
        }
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            Phase::L1 => "l1",
            Phase::L2 => "l2",
            Phase::L3 => "l3",
        }
    }

    pub fn from_key(s: &str) -> Option<Self> {
        match s {
            "l1" => Some(Phase::L1),
            "l2" => Some(Phase::L2),
            "l3" => Some(Phase::L3),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Result of a metric query.
///
/// "This device cannot report that" is a first-class value, never an error,
/// and is kept distinct from a legitimate zero reading and from a transient
/// gap in the latest snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<T> {
    /// The snapshot holds a value for this metric.
    Value(T),
    /// The device supports the metric but the latest snapshot has no reading.
    NoData,
    /// The device cannot report this metric; carries the reason.
    Unsupported(&'static str),
}

impl<T> Reading<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Reading::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Reading::Unsupported(_))
    }

    pub fn unsupported_reason(&self) -> Option<&'static str> {
        match self {
            Reading::Unsupported(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
        match self {
            Reading::Value(v) => Reading::Value(f(v)),
            Reading::NoData => Reading::NoData,
            Reading::Unsupported(reason) => Reading::Unsupported(reason),
        }
    }
}

/// Relay state reported by an Enpower-equipped gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridStatus {
    Connected,
    Disconnected,
    #[default]
    Unknown,
}

impl GridStatus {
    pub fn from_report_str(s: &str) -> Self {
        match s {
            "closed" => GridStatus::Connected,
            "open" => GridStatus::Disconnected,
            _ => GridStatus::Unknown,
        }
    }
}

/// An aggregate value plus its per-phase breakdown in fixed [l1, l2, l3]
/// order. Phases beyond the device's configured phase count stay `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseValues {
    pub total: Option<f64>,
    pub phases: [Option<f64>; 3],
}

impl PhaseValues {
    pub fn get(&self, phase: Option<Phase>) -> Option<f64> {
        match phase {
            None => self.total,
            Some(p) => self.phases[p.index()],
        }
    }

    /// Set the aggregate only if no higher-priority source filled it already.
    pub(crate) fn fill_total(&mut self, value: f64) {
        if self.total.is_none() {
            self.total = Some(value);
        }
    }

    pub(crate) fn fill_phase(&mut self, index: usize, value: f64) {
        if index < 3 && self.phases[index].is_none() {
            self.phases[index] = Some(value);
        }
    }
}

/// One Encharge battery from the ensemble inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryDevice {
    pub serial_number: String,
    pub part_number: String,
    pub percent_full: Option<f64>,
    pub temperature: Option<f64>,
    pub operating: bool,
    pub communicating: bool,
    pub firmware_version: String,
    pub bmu_firmware_version: String,
    pub admin_state: String,
    pub capacity_wh: Option<u64>,
    pub last_report_epoch: Option<i64>,
}

/// Latest report from one microinverter.
#[derive(Debug, Clone, PartialEq)]
pub struct InverterReading {
    pub watts: f64,
    pub max_watts: Option<f64>,
    pub last_report_epoch: i64,
}

impl InverterReading {
    /// Last report time rendered as `YYYY-MM-DD HH:MM:SS` (UTC).
    pub fn last_report_time(&self) -> String {
        match DateTime::from_timestamp(self.last_report_epoch, 0) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_keys_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_key(phase.as_key()), Some(phase));
        }
        assert_eq!(Phase::from_key("l4"), None);
    }

    #[test]
    fn reading_distinguishes_zero_from_unsupported() {
        let zero: Reading<f64> = Reading::Value(0.0);
        let missing: Reading<f64> = Reading::Unsupported("no meter");
        assert_eq!(zero.value(), Some(0.0));
        assert!(zero.is_supported());
        assert_eq!(missing.value(), None);
        assert_eq!(missing.unsupported_reason(), Some("no meter"));
    }

    #[test]
    fn phase_values_fill_does_not_overwrite() {
        let mut v = PhaseValues::default();
        v.fill_total(100.0);
        v.fill_total(200.0);
        assert_eq!(v.total, Some(100.0));

        v.fill_phase(1, 50.0);
        v.fill_phase(1, 60.0);
        assert_eq!(v.get(Some(Phase::L2)), Some(50.0));
        assert_eq!(v.get(Some(Phase::L3)), None);
    }

    #[test]
    fn grid_status_vocabulary() {
        assert_eq!(GridStatus::from_report_str("closed"), GridStatus::Connected);
        assert_eq!(GridStatus::from_report_str("open"), GridStatus::Disconnected);
        assert_eq!(GridStatus::from_report_str("islanded"), GridStatus::Unknown);
    }

    #[test]
    fn inverter_report_time_formats_epoch() {
        let inv = InverterReading {
            watts: 201.0,
            max_watts: Some(250.0),
            last_report_epoch: 1691423441,
        };
        assert_eq!(inv.last_report_time(), "2023-08-07 15:50:41");
    }
}
