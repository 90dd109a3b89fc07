//! Local-API telemetry client for Enphase Envoy / IQ Gateway solar monitors.
//!
//! The gateway's HTTP surface is undocumented and differs across a decade of
//! firmware generations. Given a host and credentials, the client probes the
//! fixed candidate endpoint set, derives what this particular device can
//! report, merges whatever answered into one normalized snapshot, and serves
//! typed queries against it, answering "unsupported for this device" as a
//! value rather than an error.

mod auth;
mod capabilities;
mod client;
mod endpoints;
mod error;
mod parse;
mod snapshot;
mod types;

pub use auth::{NoAuth, StaticToken, TokenProvider};
pub use capabilities::{CapabilitySet, InverterDetailMode, MeterKind, ProductionSource};
pub use client::{EnvoyClient, EnvoyClientBuilder};
pub use endpoints::{Body, Endpoint, EndpointOutcome, ProbeResults};
pub use error::{Error, Result};
pub use parse::DeviceInfo;
pub use snapshot::{MetricsSnapshot, SnapshotState, SnapshotStore};
pub use types::*;
