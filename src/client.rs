use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, trace};

use crate::auth::{NoAuth, StaticToken, TokenProvider};
use crate::capabilities::{CapabilitySet, InverterDetailMode, MeterKind, ProductionSource};
use crate::endpoints::{classify_response, Endpoint, EndpointOutcome, ProbeResults};
use crate::parse::{build_snapshot, parse_info, DeviceInfo};
use crate::snapshot::{MetricsSnapshot, SnapshotState, SnapshotStore};
use crate::types::{BatteryDevice, GridStatus, InverterReading, Phase, PhaseValues, Reading};
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MSG_NO_PRODUCTION: &str = "Production data not available for your Envoy device.";
const MSG_NO_CONSUMPTION: &str = "Consumption data not available for your Envoy device.";
const MSG_NO_NET_METER: &str =
    "Net consumption data not available for your Envoy device (no net consumption CT).";
const MSG_NO_PRODUCTION_CT: &str =
    "Production CT readings not available for your Envoy device.";
const MSG_NO_PHASE: &str = "Phase data not available for your Envoy device.";
const MSG_LEGACY_FIELD: &str =
    "This metric is not reported by your Envoy device's firmware.";
const MSG_NO_GRID_STATUS: &str = "Grid status not available for your Envoy device.";
const MSG_NO_INVERTERS: &str =
    "Individual inverter data not available for your Envoy device.";
const MSG_NO_INVERTER_COUNT: &str =
    "Active inverter count not available for your Envoy device.";

pub struct EnvoyClientBuilder {
    host: String,
    protocol: String,
    auth: Box<dyn TokenProvider>,
    timeout: Duration,
}

impl EnvoyClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            protocol: "https".to_string(),
            auth: Box::new(NoAuth),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn protocol(mut self, proto: &str) -> Self {
        self.protocol = proto.to_string();
        self
    }

    pub fn token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.auth = Box::new(provider);
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.token_provider(StaticToken::new(token))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> EnvoyClient {
        // Gateways serve self-signed TLS on the LAN.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .build()
            .expect("failed to build HTTP client");

        EnvoyClient {
            http,
            base_url: format!("{}://{}", self.protocol, self.host),
            host: self.host,
            auth: self.auth,
            store: SnapshotStore::default(),
            capabilities: None,
            device_info: None,
        }
    }
}

/// Client for one gateway instance. `refresh` probes the candidate endpoint
/// set, derives (once) what this firmware generation supports, and publishes
/// a fresh merged snapshot; the accessor methods answer against whatever
/// snapshot was published last.
pub struct EnvoyClient {
    http: reqwest::Client,
    base_url: String,
    host: String,
    auth: Box<dyn TokenProvider>,
    store: SnapshotStore,
    capabilities: Option<CapabilitySet>,
    device_info: Option<DeviceInfo>,
}

impl EnvoyClient {
    pub fn builder(host: impl Into<String>) -> EnvoyClientBuilder {
        EnvoyClientBuilder::new(host)
    }

    /// Run one refresh cycle: probe, classify, normalize, swap. The store is
    /// only written at the very end, so dropping the future mid-flight (a
    /// caller timeout) leaves the previous snapshot fully intact.
    ///
    /// The exclusive borrow keeps cycles linearizable per client: two
    /// refreshes can never interleave their capability derivations.
    pub async fn refresh(&mut self) -> Result<()> {
        if self.auth.needs_reauth() {
            return Err(Error::AuthRequired);
        }

        let probes = self.probe_all().await;
        if probes.all_unreachable() {
            return Err(Error::Unreachable {
                host: self.host.clone(),
            });
        }

        if let Some(text) = probes.text(Endpoint::Info) {
            self.device_info = Some(parse_info(text));
        }

        let capabilities = match &self.capabilities {
            Some(caps) => caps.clone(),
            None => {
                let version = self
                    .device_info
                    .as_ref()
                    .and_then(|i| i.software_version.as_deref());
                let caps = CapabilitySet::derive(&probes, version);
                self.capabilities = Some(caps.clone());
                caps
            }
        };

        let snapshot = build_snapshot(&probes, &capabilities);
        self.store.swap(SnapshotState {
            capabilities,
            snapshot,
            refreshed_at: Utc::now().timestamp(),
        });
        Ok(())
    }

    /// Drop the cached capability derivation so the next refresh re-probes
    /// from scratch, e.g. after a firmware update or credential change.
    pub fn force_rediscover(&mut self) {
        self.capabilities = None;
    }

    /// One GET per candidate path, concurrently; each endpoint's failure is
    /// isolated so a 404 or broken body never aborts the others.
    async fn probe_all(&self) -> ProbeResults {
        let token = self.auth.bearer_token();
        let fetches = Endpoint::CANDIDATES.map(|endpoint| {
            let url = format!("{}{}", self.base_url, endpoint.path());
            let mut request = self.http.get(&url);
            if let Some(ref t) = token {
                request = request.bearer_auth(t);
            }
            async move {
                let outcome = match request.send().await {
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        match resp.text().await {
                            Ok(body) => classify_response(endpoint, status, &body),
                            Err(e) => {
                                debug!(path = endpoint.path(), error = %e, "body read failed");
                                EndpointOutcome::NetworkError
                            }
                        }
                    }
                    Err(e) => {
                        debug!(path = endpoint.path(), error = %e, "probe failed");
                        EndpointOutcome::NetworkError
                    }
                };
                trace!(path = endpoint.path(), ?outcome, "probed");
                (endpoint, outcome)
            }
        });

        let mut results = ProbeResults::default();
        for (endpoint, outcome) in join_all(fetches).await {
            results.insert(endpoint, outcome);
        }
        results
    }

    // -- Device identity --

    pub fn serial_number(&self) -> Option<&str> {
        self.device_info.as_ref()?.serial_number.as_deref()
    }

    pub fn part_number(&self) -> Option<&str> {
        self.device_info.as_ref()?.part_number.as_deref()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.device_info.as_ref()?.software_version.as_deref()
    }

    /// Capability set derived for this device, once at least one refresh ran.
    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.capabilities.as_ref()
    }

    /// Epoch seconds of the last successful refresh.
    pub fn last_refresh(&self) -> Option<i64> {
        self.store.current().map(|s| s.refreshed_at)
    }

    // -- Production --

    pub fn production(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Production, phase, |s| s.production_now)
    }

    pub fn daily_production(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Production, phase, |s| s.production_today)
    }

    pub fn seven_days_production(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Production, phase, |s| s.production_seven_days)
    }

    pub fn lifetime_production(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Production, phase, |s| s.production_lifetime)
    }

    // -- Consumption --

    pub fn consumption(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Consumption, phase, |s| s.consumption_now)
    }

    pub fn daily_consumption(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Consumption, phase, |s| s.consumption_today)
    }

    pub fn seven_days_consumption(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Consumption, phase, |s| s.consumption_seven_days)
    }

    pub fn lifetime_consumption(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Consumption, phase, |s| s.consumption_lifetime)
    }

    // -- Net metering --

    pub fn net_consumption(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Net, phase, |s| s.net_consumption_now)
    }

    pub fn lifetime_net_production(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Net, phase, |s| s.net_production_lifetime)
    }

    pub fn lifetime_net_consumption(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::Net, phase, |s| s.net_consumption_lifetime)
    }

    // -- Line metrics --

    pub fn power_factor(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::ConsumptionLine, phase, |s| s.power_factor)
    }

    pub fn voltage(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::ConsumptionLine, phase, |s| s.voltage)
    }

    pub fn frequency(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::ConsumptionLine, phase, |s| s.frequency)
    }

    pub fn consumption_current(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::ConsumptionLine, phase, |s| s.consumption_current)
    }

    pub fn production_current(&self, phase: Option<Phase>) -> Reading<f64> {
        self.read(Family::ProductionLine, phase, |s| s.production_current)
    }

    // -- Storage, inverters, grid --

    /// Battery devices from the ensemble inventory; empty when the device
    /// has no storage (or has not refreshed yet).
    pub fn battery_storage(&self) -> Vec<BatteryDevice> {
        self.store
            .current()
            .map(|s| s.snapshot.batteries.clone())
            .unwrap_or_default()
    }

    /// Per-inverter last-reported watts, keyed by serial number.
    pub fn inverters_production(&self) -> Reading<BTreeMap<String, InverterReading>> {
        let Some(state) = self.store.current() else {
            return Reading::NoData;
        };
        match state.capabilities.inverter_detail_mode {
            InverterDetailMode::Modern => Reading::Value(state.snapshot.inverters.clone()),
            _ => Reading::Unsupported(MSG_NO_INVERTERS),
        }
    }

    /// Aggregate inverter count, only reported by legacy home-status
    /// firmware; modern firmware exposes per-inverter detail instead.
    pub fn active_inverter_count(&self) -> Reading<u64> {
        let Some(state) = self.store.current() else {
            return Reading::NoData;
        };
        match state.capabilities.inverter_detail_mode {
            InverterDetailMode::Legacy => match state.snapshot.active_inverter_count {
                Some(n) => Reading::Value(n),
                None => Reading::NoData,
            },
            _ => Reading::Unsupported(MSG_NO_INVERTER_COUNT),
        }
    }

    pub fn grid_status(&self) -> Reading<GridStatus> {
        let Some(state) = self.store.current() else {
            return Reading::NoData;
        };
        if !state.capabilities.has_grid_status {
            return Reading::Unsupported(MSG_NO_GRID_STATUS);
        }
        Reading::Value(state.snapshot.grid_status)
    }

    // -- Query engine --

    fn read(
        &self,
        family: Family,
        phase: Option<Phase>,
        select: fn(&MetricsSnapshot) -> PhaseValues,
    ) -> Reading<f64> {
        let Some(state) = self.store.current() else {
            return Reading::NoData;
        };
        let caps = &state.capabilities;

        if let Some(reason) = family.unsupported_reason(caps) {
            return Reading::Unsupported(reason);
        }

        if let Some(p) = phase
            && p.index() as u8 >= family.phase_count(caps)
        {
            return Reading::Unsupported(MSG_NO_PHASE);
        }

        match select(&state.snapshot).get(phase) {
            Some(v) => Reading::Value(v),
            // The legacy page reports a fixed row set; a row it never carried
            // is a device limitation, not a transient gap.
            None if family == Family::Production
                && caps.production_source == ProductionSource::LegacyXml =>
            {
                Reading::Unsupported(MSG_LEGACY_FIELD)
            }
            None => Reading::NoData,
        }
    }
}

/// Metric families share a capability gate and a phase-count bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Production,
    Consumption,
    Net,
    ConsumptionLine,
    ProductionLine,
}

impl Family {
    fn unsupported_reason(self, caps: &CapabilitySet) -> Option<&'static str> {
        match self {
            Family::Production => {
                (caps.production_source == ProductionSource::Disabled).then_some(MSG_NO_PRODUCTION)
            }
            Family::Consumption | Family::ConsumptionLine => {
                (!caps.has_consumption_metering).then_some(MSG_NO_CONSUMPTION)
            }
            Family::Net => (!caps.has_consumption_metering
                || caps.net_consumption_meter_kind != MeterKind::NetConsumption)
                .then_some(MSG_NO_NET_METER),
            Family::ProductionLine => {
                (!caps.has_production_metering).then_some(MSG_NO_PRODUCTION_CT)
            }
        }
    }

    fn phase_count(self, caps: &CapabilitySet) -> u8 {
        match self {
            Family::Production | Family::ProductionLine => caps.production_meter_phase_count,
            Family::Consumption | Family::Net | Family::ConsumptionLine => {
                caps.consumption_meter_phase_count
            }
        }
    }
}
