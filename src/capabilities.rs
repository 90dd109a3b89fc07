use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::endpoints::{Endpoint, ProbeResults};

/// Which endpoint the production totals are trusted from. Newer endpoints
/// supersede older ones; absence, not preference, drives the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionSource {
    ApiV1,
    ProductionJson,
    LegacyXml,
    Disabled,
}

/// Measurement type of a configured CT meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeterKind {
    #[default]
    None,
    Production,
    TotalConsumption,
    NetConsumption,
}

impl MeterKind {
    /// Fixed vocabulary lookup; unknown values map to `None` (caller warns).
    pub fn from_measurement_type(s: &str) -> Self {
        match s {
            "production" => MeterKind::Production,
            "total-consumption" => MeterKind::TotalConsumption,
            "net-consumption" => MeterKind::NetConsumption,
            _ => MeterKind::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverterDetailMode {
    /// Per-inverter reports via `/api/v1/production/inverters`.
    Modern,
    /// Only the aggregate inverter count from the home status page.
    Legacy,
    Unavailable,
}

/// What this particular device instance can report, derived once per session
/// from the first probe round plus the firmware version string. Every field
/// is total over its enumerated domain so downstream code never null-checks.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilitySet {
    pub production_source: ProductionSource,
    pub has_production_metering: bool,
    pub has_consumption_metering: bool,
    pub has_grid_status: bool,
    pub production_meter_phase_count: u8,
    pub consumption_meter_phase_count: u8,
    pub net_consumption_meter_kind: MeterKind,
    pub has_storage: bool,
    pub inverter_detail_mode: InverterDetailMode,
}

impl CapabilitySet {
    pub fn derive(probes: &ProbeResults, firmware_version: Option<&str>) -> Self {
        let production_source = if probes.succeeded(Endpoint::ApiV1Production) {
            ProductionSource::ApiV1
        } else if probes.succeeded(Endpoint::ProductionJson) {
            ProductionSource::ProductionJson
        } else if probes.succeeded(Endpoint::LegacyProduction) {
            ProductionSource::LegacyXml
        } else {
            ProductionSource::Disabled
        };

        let meters = MeterSummary::from_config(probes.json(Endpoint::MeterConfig));

        let has_storage = probes
            .json(Endpoint::EnsembleInventory)
            .and_then(Value::as_array)
            .map(|groups| {
                groups.iter().any(|g| {
                    g.get("devices")
                        .and_then(Value::as_array)
                        .is_some_and(|d| !d.is_empty())
                })
            })
            .unwrap_or(false);

        let home = probes
            .json(Endpoint::HomeJson)
            .or_else(|| probes.json(Endpoint::HomeLegacy));

        let has_grid_status = home
            .and_then(|h| h.pointer("/enpower/grid_status"))
            .is_some();

        let inverter_detail_mode = if probes.succeeded(Endpoint::ApiV1Inverters) {
            InverterDetailMode::Modern
        } else if home.and_then(|h| h.pointer("/comm/pcu/num")).is_some() {
            InverterDetailMode::Legacy
        } else {
            InverterDetailMode::Unavailable
        };

        let caps = CapabilitySet {
            production_source,
            has_production_metering: meters.has_production,
            has_consumption_metering: meters.has_consumption,
            has_grid_status,
            production_meter_phase_count: meters.production_phases,
            consumption_meter_phase_count: meters.consumption_phases,
            net_consumption_meter_kind: meters.consumption_kind,
            has_storage,
            inverter_detail_mode,
        };

        if let Some(version) = firmware_version {
            caps.check_version_conflict(version);
        }
        debug!(?caps, "derived capability set");
        caps
    }

    /// The firmware version string is advisory only. When it disagrees with
    /// what the probes actually found, the probes win and we log the
    /// disagreement.
    fn check_version_conflict(&self, version: &str) {
        let Some(major) = firmware_major(version) else {
            warn!(version, "unparsable firmware version string");
            return;
        };
        let expected_modern = major >= 7;
        let looks_modern = matches!(
            self.production_source,
            ProductionSource::ApiV1 | ProductionSource::ProductionJson
        );
        if expected_modern && !looks_modern {
            warn!(
                version,
                source = ?self.production_source,
                "firmware version suggests modern endpoints but probes found none; trusting probes"
            );
        }
        if !expected_modern && major < 4 && self.production_source != ProductionSource::LegacyXml {
            warn!(
                version,
                source = ?self.production_source,
                "firmware version suggests legacy-only endpoints; trusting probes"
            );
        }
    }
}

static FIRMWARE_MAJOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// First numeric component of strings like `D7.6.175` or `R3.9.36`.
pub(crate) fn firmware_major(version: &str) -> Option<u32> {
    FIRMWARE_MAJOR_RE.find(version)?.as_str().parse().ok()
}

#[derive(Debug, Default)]
struct MeterSummary {
    has_production: bool,
    has_consumption: bool,
    production_phases: u8,
    consumption_phases: u8,
    consumption_kind: MeterKind,
}

impl MeterSummary {
    /// Walk the `/ivp/meters` entries. An absent endpoint means pre-metering
    /// firmware: everything stays false/zero rather than erroring.
    fn from_config(config: Option<&Value>) -> Self {
        let mut summary = MeterSummary::default();
        let Some(entries) = config.and_then(Value::as_array) else {
            return summary;
        };

        for entry in entries {
            let state = entry.get("state").and_then(Value::as_str).unwrap_or("");
            if state == "disabled" {
                continue;
            }
            let mtype = entry
                .get("measurementType")
                .and_then(Value::as_str)
                .unwrap_or("");
            let kind = MeterKind::from_measurement_type(mtype);
            let phases = phase_count_of(entry);

            match kind {
                MeterKind::Production => {
                    summary.has_production = true;
                    summary.production_phases = phases;
                }
                MeterKind::TotalConsumption | MeterKind::NetConsumption => {
                    summary.has_consumption = true;
                    summary.consumption_phases = phases;
                    summary.consumption_kind = kind;
                }
                MeterKind::None => {
                    warn!(measurement_type = mtype, "unknown meter measurement type, ignoring entry");
                }
            }
        }
        summary
    }
}

/// `phaseCount` when present, then the `phaseMode` marker, then 1: a meter
/// that exists but does not specify its phases is treated as single-phase.
fn phase_count_of(entry: &Value) -> u8 {
    if let Some(n) = entry.get("phaseCount").and_then(Value::as_u64) {
        return n.clamp(1, 3) as u8;
    }
    match entry.get("phaseMode").and_then(Value::as_str) {
        Some("three") => 3,
        Some("split") => 2,
        Some("single") => 1,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::{classify_response, EndpointOutcome, ProbeResults};

    fn probes_with(pairs: &[(Endpoint, u16, &str)]) -> ProbeResults {
        let mut results = ProbeResults::default();
        for (ep, status, body) in pairs {
            results.insert(*ep, classify_response(*ep, *status, body));
        }
        results
    }

    #[test]
    fn empty_probe_round_is_total() {
        let caps = CapabilitySet::derive(&ProbeResults::default(), None);
        assert_eq!(caps.production_source, ProductionSource::Disabled);
        assert!(!caps.has_production_metering);
        assert!(!caps.has_consumption_metering);
        assert!(!caps.has_grid_status);
        assert!(!caps.has_storage);
        assert_eq!(caps.production_meter_phase_count, 0);
        assert_eq!(caps.consumption_meter_phase_count, 0);
        assert_eq!(caps.net_consumption_meter_kind, MeterKind::None);
        assert_eq!(caps.inverter_detail_mode, InverterDetailMode::Unavailable);
    }

    #[test]
    fn production_source_prefers_newest() {
        let probes = probes_with(&[
            (Endpoint::LegacyProduction, 200, "<html></html>"),
            (Endpoint::ProductionJson, 200, "{}"),
            (Endpoint::ApiV1Production, 200, "{}"),
        ]);
        let caps = CapabilitySet::derive(&probes, None);
        assert_eq!(caps.production_source, ProductionSource::ApiV1);

        let probes = probes_with(&[
            (Endpoint::LegacyProduction, 200, "<html></html>"),
            (Endpoint::ProductionJson, 200, "{}"),
            (Endpoint::ApiV1Production, 404, ""),
        ]);
        let caps = CapabilitySet::derive(&probes, None);
        assert_eq!(caps.production_source, ProductionSource::ProductionJson);

        let probes = probes_with(&[(Endpoint::LegacyProduction, 200, "<html></html>")]);
        let caps = CapabilitySet::derive(&probes, None);
        assert_eq!(caps.production_source, ProductionSource::LegacyXml);
    }

    #[test]
    fn malformed_production_json_falls_back() {
        // Present-but-broken endpoint: the production source falls back, but
        // presence is still visible to anyone asking.
        let mut probes = probes_with(&[(Endpoint::LegacyProduction, 200, "<html></html>")]);
        probes.insert(Endpoint::ProductionJson, EndpointOutcome::Malformed);
        let caps = CapabilitySet::derive(&probes, None);
        assert_eq!(caps.production_source, ProductionSource::LegacyXml);
        assert!(probes.outcome(Endpoint::ProductionJson).is_present());
    }

    #[test]
    fn meter_config_drives_phase_counts() {
        let config = r#"[
            {"eid": 1, "state": "enabled", "measurementType": "production",
             "phaseMode": "three", "phaseCount": 3},
            {"eid": 2, "state": "enabled", "measurementType": "net-consumption",
             "phaseMode": "three", "phaseCount": 3}
        ]"#;
        let probes = probes_with(&[(Endpoint::MeterConfig, 200, config)]);
        let caps = CapabilitySet::derive(&probes, None);
        assert!(caps.has_production_metering);
        assert!(caps.has_consumption_metering);
        assert_eq!(caps.production_meter_phase_count, 3);
        assert_eq!(caps.consumption_meter_phase_count, 3);
        assert_eq!(caps.net_consumption_meter_kind, MeterKind::NetConsumption);
    }

    #[test]
    fn disabled_meter_entries_are_skipped() {
        let config = r#"[
            {"eid": 1, "state": "enabled", "measurementType": "production", "phaseMode": "single"},
            {"eid": 2, "state": "disabled", "measurementType": "net-consumption", "phaseMode": "single"}
        ]"#;
        let probes = probes_with(&[(Endpoint::MeterConfig, 200, config)]);
        let caps = CapabilitySet::derive(&probes, None);
        assert!(caps.has_production_metering);
        assert!(!caps.has_consumption_metering);
        assert_eq!(caps.production_meter_phase_count, 1);
        assert_eq!(caps.consumption_meter_phase_count, 0);
    }

    #[test]
    fn unknown_measurement_type_is_ignored() {
        let config = r#"[
            {"eid": 1, "state": "enabled", "measurementType": "storage-flux", "phaseMode": "three"}
        ]"#;
        let probes = probes_with(&[(Endpoint::MeterConfig, 200, config)]);
        let caps = CapabilitySet::derive(&probes, None);
        assert!(!caps.has_consumption_metering);
        assert_eq!(caps.net_consumption_meter_kind, MeterKind::None);
    }

    #[test]
    fn phase_mode_fallback_when_count_missing() {
        let config = r#"[
            {"eid": 1, "state": "enabled", "measurementType": "production", "phaseMode": "split"},
            {"eid": 2, "state": "enabled", "measurementType": "total-consumption"}
        ]"#;
        let probes = probes_with(&[(Endpoint::MeterConfig, 200, config)]);
        let caps = CapabilitySet::derive(&probes, None);
        assert_eq!(caps.production_meter_phase_count, 2);
        // structurally present entry with no phase fields defaults to 1
        assert_eq!(caps.consumption_meter_phase_count, 1);
        assert_eq!(caps.net_consumption_meter_kind, MeterKind::TotalConsumption);
    }

    #[test]
    fn storage_needs_a_nonempty_device_list() {
        let probes = probes_with(&[(
            Endpoint::EnsembleInventory,
            200,
            r#"[{"type": "ENCHARGE", "devices": []}]"#,
        )]);
        assert!(!CapabilitySet::derive(&probes, None).has_storage);

        let probes = probes_with(&[(
            Endpoint::EnsembleInventory,
            200,
            r#"[{"type": "ENCHARGE", "devices": [{"serial_num": "1"}]}]"#,
        )]);
        assert!(CapabilitySet::derive(&probes, None).has_storage);
    }

    #[test]
    fn inverter_detail_mode_selection() {
        let probes = probes_with(&[(Endpoint::ApiV1Inverters, 200, "[]")]);
        assert_eq!(
            CapabilitySet::derive(&probes, None).inverter_detail_mode,
            InverterDetailMode::Modern
        );

        let probes = probes_with(&[(
            Endpoint::HomeJson,
            200,
            r#"{"comm": {"pcu": {"num": 12, "level": 5}}}"#,
        )]);
        assert_eq!(
            CapabilitySet::derive(&probes, None).inverter_detail_mode,
            InverterDetailMode::Legacy
        );
    }

    #[test]
    fn grid_status_requires_enpower_field() {
        let probes = probes_with(&[(
            Endpoint::HomeJson,
            200,
            r#"{"enpower": {"grid_status": "closed"}}"#,
        )]);
        assert!(CapabilitySet::derive(&probes, None).has_grid_status);

        let probes = probes_with(&[(Endpoint::HomeJson, 200, r#"{"network": {}}"#)]);
        assert!(!CapabilitySet::derive(&probes, None).has_grid_status);
    }

    #[test]
    fn firmware_major_parses_prefixed_versions() {
        assert_eq!(firmware_major("D7.6.175"), Some(7));
        assert_eq!(firmware_major("R3.9.36"), Some(3));
        assert_eq!(firmware_major("4.2.27"), Some(4));
        assert_eq!(firmware_major("unknown"), None);
    }

    #[test]
    fn version_conflict_does_not_change_derivation() {
        // D7 firmware claiming modern endpoints, but only legacy probed ok:
        // probes win, classification stays deterministic.
        let probes = probes_with(&[(Endpoint::LegacyProduction, 200, "<html></html>")]);
        let caps = CapabilitySet::derive(&probes, Some("D7.6.175"));
        assert_eq!(caps.production_source, ProductionSource::LegacyXml);
    }
}
