use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::capabilities::CapabilitySet;
use crate::types::{BatteryDevice, GridStatus, InverterReading, PhaseValues};

/// The merged, normalized metric values from one refresh cycle. Power is
/// watts, energy watt-hours, timestamps epoch seconds. A `None` inside a
/// `PhaseValues` means "no source reported this", never zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub production_now: PhaseValues,
    pub production_today: PhaseValues,
    pub production_seven_days: PhaseValues,
    pub production_lifetime: PhaseValues,

    pub consumption_now: PhaseValues,
    pub consumption_today: PhaseValues,
    pub consumption_seven_days: PhaseValues,
    pub consumption_lifetime: PhaseValues,

    pub net_consumption_now: PhaseValues,
    pub net_production_lifetime: PhaseValues,
    pub net_consumption_lifetime: PhaseValues,

    pub power_factor: PhaseValues,
    pub voltage: PhaseValues,
    pub frequency: PhaseValues,
    pub production_current: PhaseValues,
    pub consumption_current: PhaseValues,

    pub batteries: Vec<BatteryDevice>,
    pub inverters: BTreeMap<String, InverterReading>,
    pub active_inverter_count: Option<u64>,
    pub grid_status: GridStatus,
}

/// Snapshot plus the capability set it was built under, published together so
/// a reader can never pair a snapshot with a stale capability derivation.
#[derive(Debug, Clone)]
pub struct SnapshotState {
    pub capabilities: CapabilitySet,
    pub snapshot: MetricsSnapshot,
    pub refreshed_at: i64,
}

/// Holder for the latest complete snapshot/capability pair. Writers replace
/// the whole `Arc` at once; readers clone it and keep a consistent view for
/// as long as they like. A cancelled refresh never touches the store, so the
/// previous state stays authoritative.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: RwLock<Option<Arc<SnapshotState>>>,
}

impl SnapshotStore {
    /// `None` until the first successful refresh cycle.
    pub fn current(&self) -> Option<Arc<SnapshotState>> {
        self.inner.read().clone()
    }

    pub fn swap(&self, state: SnapshotState) {
        *self.inner.write() = Some(Arc::new(state));
    }
}
