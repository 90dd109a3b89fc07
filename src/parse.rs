use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::capabilities::{CapabilitySet, InverterDetailMode, MeterKind};
use crate::endpoints::{Endpoint, ProbeResults};
use crate::snapshot::MetricsSnapshot;
use crate::types::{BatteryDevice, GridStatus, InverterReading, PhaseValues};

/// Identity block scraped from the `/info` XML document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub serial_number: Option<String>,
    pub part_number: Option<String>,
    pub software_version: Option<String>,
}

static INFO_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(sn|pn|software)>([^<]+)</").unwrap());

/// First occurrence of each tag wins; the document repeats `<pn>` inside its
/// package list.
pub(crate) fn parse_info(text: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    for caps in INFO_TAG_RE.captures_iter(text) {
        let value = caps[2].trim();
        if value.is_empty() {
            continue;
        }
        let slot = match &caps[1] {
            "sn" => &mut info.serial_number,
            "pn" => &mut info.part_number,
            _ => &mut info.software_version,
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }
    info
}

/// Build a fresh snapshot from whichever endpoints succeeded, in field
/// priority order. Every parser only fills fields still empty, so a
/// higher-priority source is never overwritten by a lower one.
pub(crate) fn build_snapshot(probes: &ProbeResults, caps: &CapabilitySet) -> MetricsSnapshot {
    let mut snap = MetricsSnapshot::default();

    if let Some(body) = probes.json(Endpoint::ApiV1Production) {
        apply_api_v1_production(body, &mut snap);
    }
    if let Some(body) = probes.json(Endpoint::ProductionJson) {
        apply_production_json(body, caps, &mut snap);
    }
    if let Some(text) = probes.text(Endpoint::LegacyProduction) {
        apply_legacy_production(text, &mut snap);
    }
    if let Some(body) = probes.json(Endpoint::MeterReadings) {
        let eids = MeterEids::from_config(probes.json(Endpoint::MeterConfig));
        apply_meter_readings(body, &eids, caps, &mut snap);
    }
    if let Some(body) = probes.json(Endpoint::MeterReports) {
        apply_meter_reports(body, caps, &mut snap);
    }
    if caps.has_storage
        && let Some(body) = probes.json(Endpoint::EnsembleInventory)
    {
        snap.batteries = parse_batteries(body);
    }
    if let Some(body) = probes.json(Endpoint::ApiV1Inverters) {
        snap.inverters = parse_inverters(body);
    }
    if let Some(body) = probes
        .json(Endpoint::HomeJson)
        .or_else(|| probes.json(Endpoint::HomeLegacy))
    {
        apply_home(body, caps, &mut snap);
    }

    debug!(
        production = ?snap.production_now.total,
        consumption = ?snap.consumption_now.total,
        batteries = snap.batteries.len(),
        inverters = snap.inverters.len(),
        "built snapshot"
    );
    snap
}

// -- /api/v1/production --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiV1Production {
    watts_now: Option<f64>,
    watt_hours_today: Option<f64>,
    watt_hours_seven_days: Option<f64>,
    watt_hours_lifetime: Option<f64>,
}

fn apply_api_v1_production(body: &Value, snap: &mut MetricsSnapshot) {
    let Ok(parsed) = serde_json::from_value::<ApiV1Production>(body.clone()) else {
        warn!("unexpected /api/v1/production shape, skipping");
        return;
    };
    if let Some(w) = parsed.watts_now {
        snap.production_now.fill_total(w);
    }
    if let Some(wh) = parsed.watt_hours_today {
        snap.production_today.fill_total(wh);
    }
    if let Some(wh) = parsed.watt_hours_seven_days {
        snap.production_seven_days.fill_total(wh);
    }
    if let Some(wh) = parsed.watt_hours_lifetime {
        snap.production_lifetime.fill_total(wh);
    }
}

// -- /production.json --

fn apply_production_json(body: &Value, caps: &CapabilitySet, snap: &mut MetricsSnapshot) {
    let entries = body.get("production").and_then(Value::as_array);
    let eim = find_entry(entries, "type", "eim");
    let inverters = find_entry(entries, "type", "inverters");

    // With a production CT the eim entry is authoritative; without one it
    // reports zeros and the inverter aggregate is the real value.
    if caps.has_production_metering {
        if let Some(entry) = eim {
            fill_energy_entry(
                entry,
                &mut snap.production_now,
                &mut snap.production_today,
                &mut snap.production_seven_days,
                &mut snap.production_lifetime,
            );
            fill_lines(
                entry,
                caps.production_meter_phase_count,
                "wNow",
                &mut snap.production_now,
            );
            fill_lines(
                entry,
                caps.production_meter_phase_count,
                "whToday",
                &mut snap.production_today,
            );
            fill_lines(
                entry,
                caps.production_meter_phase_count,
                "whLifetime",
                &mut snap.production_lifetime,
            );
            check_line_count(entry, caps.production_meter_phase_count);
        }
    } else if let Some(entry) = inverters {
        if let Some(w) = num(entry, "wNow") {
            snap.production_now.fill_total(w);
        }
        if let Some(wh) = num(entry, "whLifetime") {
            snap.production_lifetime.fill_total(wh);
        }
    }

    if !caps.has_consumption_metering {
        return;
    }
    let consumption = body.get("consumption").and_then(Value::as_array);
    if let Some(entry) = find_entry(consumption, "measurementType", "total-consumption") {
        fill_energy_entry(
            entry,
            &mut snap.consumption_now,
            &mut snap.consumption_today,
            &mut snap.consumption_seven_days,
            &mut snap.consumption_lifetime,
        );
        fill_lines(
            entry,
            caps.consumption_meter_phase_count,
            "wNow",
            &mut snap.consumption_now,
        );
        fill_lines(
            entry,
            caps.consumption_meter_phase_count,
            "whToday",
            &mut snap.consumption_today,
        );
        fill_lines(
            entry,
            caps.consumption_meter_phase_count,
            "whLifetime",
            &mut snap.consumption_lifetime,
        );
    }
    if let Some(entry) = find_entry(consumption, "measurementType", "net-consumption") {
        if let Some(w) = num(entry, "wNow") {
            snap.net_consumption_now.fill_total(w);
        }
        fill_lines(
            entry,
            caps.consumption_meter_phase_count,
            "wNow",
            &mut snap.net_consumption_now,
        );
    }
}

fn find_entry<'a>(entries: Option<&'a Vec<Value>>, key: &str, value: &str) -> Option<&'a Value> {
    entries?
        .iter()
        .find(|e| e.get(key).and_then(Value::as_str) == Some(value))
}

fn fill_energy_entry(
    entry: &Value,
    now: &mut PhaseValues,
    today: &mut PhaseValues,
    seven_days: &mut PhaseValues,
    lifetime: &mut PhaseValues,
) {
    if let Some(w) = num(entry, "wNow") {
        now.fill_total(w);
    }
    if let Some(wh) = num(entry, "whToday") {
        today.fill_total(wh);
    }
    if let Some(wh) = num(entry, "whLastSevenDays") {
        seven_days.fill_total(wh);
    }
    if let Some(wh) = num(entry, "whLifetime") {
        lifetime.fill_total(wh);
    }
}

fn fill_lines(entry: &Value, phase_count: u8, key: &str, target: &mut PhaseValues) {
    let Some(lines) = entry.get("lines").and_then(Value::as_array) else {
        return;
    };
    for (i, line) in lines.iter().take(phase_count as usize).enumerate() {
        if let Some(v) = num(line, key) {
            target.fill_phase(i, v);
        }
    }
}

/// Meter-configuration-derived phase counts win over report line counts;
/// the disagreement is only logged.
fn check_line_count(entry: &Value, phase_count: u8) {
    if let Some(lines) = entry.get("lines").and_then(Value::as_array)
        && lines.len() != phase_count as usize
    {
        warn!(
            report_lines = lines.len(),
            meter_phase_count = phase_count,
            "report line count disagrees with meter configuration; keeping meter configuration"
        );
    }
}

// -- legacy /production HTML --

static LEGACY_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<td>(Current[^<]*|Today|Past Week|Since Installation)</td>\s*<td>\s*([0-9]+(?:\.[0-9]+)?)\s*(k|M)?Wh?</td>",
    )
    .unwrap()
});

/// Scrape the `<td>label</td><td>value unit</td>` rows of the legacy
/// production page, normalizing kW/MW and kWh/MWh down to W / Wh.
fn apply_legacy_production(text: &str, snap: &mut MetricsSnapshot) {
    for caps in LEGACY_ROW_RE.captures_iter(text) {
        let Ok(value) = caps[2].parse::<f64>() else {
            continue;
        };
        let multiplier = match caps.get(3).map(|m| m.as_str()) {
            Some("k") => 1_000.0,
            Some("M") => 1_000_000.0,
            _ => 1.0,
        };
        let target = match &caps[1] {
            label if label.starts_with("Current") => &mut snap.production_now,
            "Today" => &mut snap.production_today,
            "Past Week" => &mut snap.production_seven_days,
            _ => &mut snap.production_lifetime,
        };
        target.fill_total(value * multiplier);
    }
}

// -- /ivp/meters/readings --

/// Meter eids keyed by role, so readings entries (which carry only an eid)
/// can be matched back to the configured meter kinds.
#[derive(Debug, Default)]
pub(crate) struct MeterEids {
    production: Option<u64>,
    consumption: Option<u64>,
}

impl MeterEids {
    pub(crate) fn from_config(config: Option<&Value>) -> Self {
        let mut eids = MeterEids::default();
        let Some(entries) = config.and_then(Value::as_array) else {
            return eids;
        };
        for entry in entries {
            if entry.get("state").and_then(Value::as_str) == Some("disabled") {
                continue;
            }
            let kind = entry
                .get("measurementType")
                .and_then(Value::as_str)
                .map(MeterKind::from_measurement_type)
                .unwrap_or_default();
            let eid = entry.get("eid").and_then(Value::as_u64);
            match kind {
                MeterKind::Production => eids.production = eid,
                MeterKind::TotalConsumption | MeterKind::NetConsumption => {
                    eids.consumption = eid;
                }
                MeterKind::None => {}
            }
        }
        eids
    }
}

fn apply_meter_readings(
    body: &Value,
    eids: &MeterEids,
    caps: &CapabilitySet,
    snap: &mut MetricsSnapshot,
) {
    let Some(entries) = body.as_array() else {
        return;
    };
    for entry in entries {
        let eid = entry.get("eid").and_then(Value::as_u64);
        if eid.is_some() && eid == eids.production {
            apply_production_reading(entry, caps, snap);
        } else if eid.is_some() && eid == eids.consumption {
            apply_consumption_reading(entry, caps, snap);
        }
    }
}

fn apply_production_reading(entry: &Value, caps: &CapabilitySet, snap: &mut MetricsSnapshot) {
    if let Some(a) = num(entry, "current") {
        snap.production_current.fill_total(a);
    }
    if let Some(w) = num(entry, "activePower") {
        snap.production_now.fill_total(w);
    }
    let phases = caps.production_meter_phase_count;
    fill_channels(entry, phases, "current", &mut snap.production_current);
    fill_channels(entry, phases, "activePower", &mut snap.production_now);
}

fn apply_consumption_reading(entry: &Value, caps: &CapabilitySet, snap: &mut MetricsSnapshot) {
    if let Some(a) = num(entry, "current") {
        snap.consumption_current.fill_total(a);
    }
    if let Some(v) = num(entry, "voltage") {
        snap.voltage.fill_total(v);
    }
    if let Some(hz) = num(entry, "freq") {
        snap.frequency.fill_total(hz);
    }
    if let Some(pf) = num(entry, "pwrFactor") {
        snap.power_factor.fill_total(pf);
    }
    let phases = caps.consumption_meter_phase_count;
    fill_channels(entry, phases, "current", &mut snap.consumption_current);
    fill_channels(entry, phases, "voltage", &mut snap.voltage);
    fill_channels(entry, phases, "freq", &mut snap.frequency);
    fill_channels(entry, phases, "pwrFactor", &mut snap.power_factor);

    // For a net CT, delivered energy is what the house drew from the grid
    // and received energy is what was exported.
    if caps.net_consumption_meter_kind == MeterKind::NetConsumption {
        if let Some(w) = num(entry, "activePower") {
            snap.net_consumption_now.fill_total(w);
        }
        if let Some(wh) = num(entry, "actEnergyDlvd") {
            snap.net_consumption_lifetime.fill_total(wh);
        }
        if let Some(wh) = num(entry, "actEnergyRcvd") {
            snap.net_production_lifetime.fill_total(wh);
        }
        fill_channels(entry, phases, "activePower", &mut snap.net_consumption_now);
        fill_channels(entry, phases, "actEnergyDlvd", &mut snap.net_consumption_lifetime);
        fill_channels(entry, phases, "actEnergyRcvd", &mut snap.net_production_lifetime);
    } else {
        if let Some(w) = num(entry, "activePower") {
            snap.consumption_now.fill_total(w);
        }
        if let Some(wh) = num(entry, "actEnergyDlvd") {
            snap.consumption_lifetime.fill_total(wh);
        }
        fill_channels(entry, phases, "activePower", &mut snap.consumption_now);
        fill_channels(entry, phases, "actEnergyDlvd", &mut snap.consumption_lifetime);
    }
}

fn fill_channels(entry: &Value, phase_count: u8, key: &str, target: &mut PhaseValues) {
    let Some(channels) = entry.get("channels").and_then(Value::as_array) else {
        return;
    };
    for (i, channel) in channels.iter().take(phase_count as usize).enumerate() {
        if let Some(v) = num(channel, key) {
            target.fill_phase(i, v);
        }
    }
}

// -- /ivp/meters/reports --

fn apply_meter_reports(body: &Value, caps: &CapabilitySet, snap: &mut MetricsSnapshot) {
    let Some(reports) = body.as_array() else {
        return;
    };
    for report in reports {
        let kind = report.get("reportType").and_then(Value::as_str).unwrap_or("");
        let cumulative = report.get("cumulative").unwrap_or(&Value::Null);
        match kind {
            "production" if caps.has_production_metering => {
                if let Some(w) = num(cumulative, "currW") {
                    snap.production_now.fill_total(w);
                }
                if let Some(wh) = num(cumulative, "whDlvdCum") {
                    snap.production_lifetime.fill_total(wh);
                }
                if let Some(a) = num(cumulative, "rmsCurrent") {
                    snap.production_current.fill_total(a);
                }
                fill_report_lines(report, caps.production_meter_phase_count, snap, ReportRole::Production);
            }
            "total-consumption" if caps.has_consumption_metering => {
                if let Some(w) = num(cumulative, "currW") {
                    snap.consumption_now.fill_total(w);
                }
                if let Some(wh) = num(cumulative, "whDlvdCum") {
                    snap.consumption_lifetime.fill_total(wh);
                }
                if let Some(a) = num(cumulative, "rmsCurrent") {
                    snap.consumption_current.fill_total(a);
                }
                fill_line_metrics(cumulative, snap);
                fill_report_lines(report, caps.consumption_meter_phase_count, snap, ReportRole::TotalConsumption);
            }
            "net-consumption" if caps.has_consumption_metering => {
                if let Some(w) = num(cumulative, "currW") {
                    snap.net_consumption_now.fill_total(w);
                }
                if let Some(wh) = num(cumulative, "whDlvdCum") {
                    snap.net_consumption_lifetime.fill_total(wh);
                }
                if let Some(wh) = num(cumulative, "whRcvdCum") {
                    snap.net_production_lifetime.fill_total(wh);
                }
                fill_line_metrics(cumulative, snap);
                fill_report_lines(report, caps.consumption_meter_phase_count, snap, ReportRole::NetConsumption);
            }
            _ => {}
        }
    }
}

fn fill_line_metrics(cumulative: &Value, snap: &mut MetricsSnapshot) {
    if let Some(v) = num(cumulative, "rmsVoltage") {
        snap.voltage.fill_total(v);
    }
    if let Some(pf) = num(cumulative, "pwrFactor") {
        snap.power_factor.fill_total(pf);
    }
    if let Some(hz) = num(cumulative, "freqHz") {
        snap.frequency.fill_total(hz);
    }
}

#[derive(Clone, Copy)]
enum ReportRole {
    Production,
    TotalConsumption,
    NetConsumption,
}

fn fill_report_lines(report: &Value, phase_count: u8, snap: &mut MetricsSnapshot, role: ReportRole) {
    let Some(lines) = report.get("lines").and_then(Value::as_array) else {
        return;
    };
    for (i, line) in lines.iter().take(phase_count as usize).enumerate() {
        match role {
            ReportRole::Production => {
                if let Some(w) = num(line, "currW") {
                    snap.production_now.fill_phase(i, w);
                }
                if let Some(wh) = num(line, "whDlvdCum") {
                    snap.production_lifetime.fill_phase(i, wh);
                }
                if let Some(a) = num(line, "rmsCurrent") {
                    snap.production_current.fill_phase(i, a);
                }
            }
            ReportRole::TotalConsumption => {
                if let Some(w) = num(line, "currW") {
                    snap.consumption_now.fill_phase(i, w);
                }
                if let Some(wh) = num(line, "whDlvdCum") {
                    snap.consumption_lifetime.fill_phase(i, wh);
                }
                if let Some(a) = num(line, "rmsCurrent") {
                    snap.consumption_current.fill_phase(i, a);
                }
                if let Some(v) = num(line, "rmsVoltage") {
                    snap.voltage.fill_phase(i, v);
                }
                if let Some(pf) = num(line, "pwrFactor") {
                    snap.power_factor.fill_phase(i, pf);
                }
                if let Some(hz) = num(line, "freqHz") {
                    snap.frequency.fill_phase(i, hz);
                }
            }
            ReportRole::NetConsumption => {
                if let Some(w) = num(line, "currW") {
                    snap.net_consumption_now.fill_phase(i, w);
                }
                if let Some(wh) = num(line, "whDlvdCum") {
                    snap.net_consumption_lifetime.fill_phase(i, wh);
                }
                if let Some(wh) = num(line, "whRcvdCum") {
                    snap.net_production_lifetime.fill_phase(i, wh);
                }
            }
        }
    }
}

// -- /ivp/ensemble/inventory --

#[derive(Debug, Deserialize)]
struct RawEnsembleGroup {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    devices: Vec<RawBattery>,
}

#[derive(Debug, Deserialize)]
struct RawBattery {
    #[serde(default)]
    serial_num: String,
    #[serde(default)]
    part_num: String,
    #[serde(rename = "percentFull")]
    percent_full: Option<f64>,
    temperature: Option<f64>,
    #[serde(default)]
    operating: bool,
    #[serde(default)]
    communicating: bool,
    #[serde(default)]
    img_pnum_running: String,
    #[serde(default)]
    bmu_fw_version: String,
    #[serde(default)]
    admin_state_str: String,
    encharge_capacity: Option<u64>,
    last_rpt_date: Option<i64>,
}

fn parse_batteries(body: &Value) -> Vec<BatteryDevice> {
    let Ok(groups) = serde_json::from_value::<Vec<RawEnsembleGroup>>(body.clone()) else {
        warn!("unexpected ensemble inventory shape, skipping");
        return Vec::new();
    };
    groups
        .into_iter()
        .filter(|g| g.kind == "ENCHARGE")
        .flat_map(|g| g.devices)
        .map(|d| BatteryDevice {
            serial_number: d.serial_num,
            part_number: d.part_num,
            percent_full: d.percent_full,
            temperature: d.temperature,
            operating: d.operating,
            communicating: d.communicating,
            firmware_version: d.img_pnum_running,
            bmu_firmware_version: d.bmu_fw_version,
            admin_state: d.admin_state_str,
            capacity_wh: d.encharge_capacity,
            last_report_epoch: d.last_rpt_date,
        })
        .collect()
}

// -- /api/v1/production/inverters --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInverter {
    serial_number: String,
    last_report_date: i64,
    last_report_watts: f64,
    max_report_watts: Option<f64>,
}

fn parse_inverters(body: &Value) -> BTreeMap<String, InverterReading> {
    let Ok(raw) = serde_json::from_value::<Vec<RawInverter>>(body.clone()) else {
        warn!("unexpected inverter list shape, skipping");
        return BTreeMap::new();
    };
    raw.into_iter()
        .map(|inv| {
            (
                inv.serial_number,
                InverterReading {
                    watts: inv.last_report_watts,
                    max_watts: inv.max_report_watts,
                    last_report_epoch: inv.last_report_date,
                },
            )
        })
        .collect()
}

// -- /home.json --

fn apply_home(body: &Value, caps: &CapabilitySet, snap: &mut MetricsSnapshot) {
    if caps.has_grid_status
        && let Some(status) = body.pointer("/enpower/grid_status").and_then(Value::as_str)
    {
        snap.grid_status = GridStatus::from_report_str(status);
    }
    if caps.inverter_detail_mode == InverterDetailMode::Legacy {
        snap.active_inverter_count = body.pointer("/comm/pcu/num").and_then(Value::as_u64);
    }
}

fn num(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}
