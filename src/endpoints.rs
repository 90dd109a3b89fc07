use std::collections::BTreeMap;

use serde_json::Value;

/// The fixed candidate endpoint set. Which of these actually exist depends on
/// the firmware generation; every refresh cycle probes all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Endpoint {
    Info,
    HomeLegacy,
    HomeJson,
    LegacyProduction,
    ProductionJson,
    ApiV1Production,
    ApiV1Inverters,
    EnsembleInventory,
    MeterConfig,
    MeterReadings,
    MeterReports,
}

impl Endpoint {
    pub const CANDIDATES: [Endpoint; 11] = [
        Endpoint::Info,
        Endpoint::HomeLegacy,
        Endpoint::HomeJson,
        Endpoint::LegacyProduction,
        Endpoint::ProductionJson,
        Endpoint::ApiV1Production,
        Endpoint::ApiV1Inverters,
        Endpoint::EnsembleInventory,
        Endpoint::MeterConfig,
        Endpoint::MeterReadings,
        Endpoint::MeterReports,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Info => "/info",
            Endpoint::HomeLegacy => "/home",
            Endpoint::HomeJson => "/home.json",
            Endpoint::LegacyProduction => "/production",
            Endpoint::ProductionJson => "/production.json",
            Endpoint::ApiV1Production => "/api/v1/production",
            Endpoint::ApiV1Inverters => "/api/v1/production/inverters",
            Endpoint::EnsembleInventory => "/ivp/ensemble/inventory",
            Endpoint::MeterConfig => "/ivp/meters",
            Endpoint::MeterReadings => "/ivp/meters/readings",
            Endpoint::MeterReports => "/ivp/meters/reports",
        }
    }

    /// Whether a 200 body is expected to be JSON. `/info` is an XML document
    /// and legacy `/production` is an HTML page; both are kept as raw text.
    pub fn expects_json(&self) -> bool {
        !matches!(self, Endpoint::Info | Endpoint::LegacyProduction)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            Body::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s),
            Body::Json(_) => None,
        }
    }
}

/// Per-endpoint probe outcome. `Malformed` (reachable, body unparsable) is
/// deliberately distinct from `NotFound`: the classifier treats the former as
/// feature-present-but-broken and the latter as feature-absent.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointOutcome {
    Ok(Body),
    NotFound,
    Unauthorized,
    Malformed,
    NetworkError,
}

impl EndpointOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, EndpointOutcome::Ok(_))
    }

    /// The endpoint exists on this firmware, even if its body was unusable.
    pub fn is_present(&self) -> bool {
        matches!(self, EndpointOutcome::Ok(_) | EndpointOutcome::Malformed)
    }
}

/// Classify one HTTP response into an outcome. Pure so the mapping is
/// testable without a transport.
pub(crate) fn classify_response(endpoint: Endpoint, status: u16, body: &str) -> EndpointOutcome {
    match status {
        200 => {
            if endpoint.expects_json() {
                match serde_json::from_str::<Value>(body) {
                    Ok(v) => EndpointOutcome::Ok(Body::Json(v)),
                    Err(_) => EndpointOutcome::Malformed,
                }
            } else {
                EndpointOutcome::Ok(Body::Text(body.to_string()))
            }
        }
        401 | 403 => EndpointOutcome::Unauthorized,
        404 => EndpointOutcome::NotFound,
        _ => EndpointOutcome::NetworkError,
    }
}

/// Outcome map for one probe round. Total over `Endpoint::CANDIDATES`:
/// endpoints the prober could not reach at all read as `NetworkError`.
#[derive(Debug, Default)]
pub struct ProbeResults {
    outcomes: BTreeMap<Endpoint, EndpointOutcome>,
}

const ABSENT: EndpointOutcome = EndpointOutcome::NetworkError;

impl ProbeResults {
    pub(crate) fn insert(&mut self, endpoint: Endpoint, outcome: EndpointOutcome) {
        self.outcomes.insert(endpoint, outcome);
    }

    pub fn outcome(&self, endpoint: Endpoint) -> &EndpointOutcome {
        self.outcomes.get(&endpoint).unwrap_or(&ABSENT)
    }

    pub fn succeeded(&self, endpoint: Endpoint) -> bool {
        self.outcome(endpoint).is_ok()
    }

    pub fn json(&self, endpoint: Endpoint) -> Option<&Value> {
        match self.outcome(endpoint) {
            EndpointOutcome::Ok(body) => body.as_json(),
            _ => None,
        }
    }

    pub fn text(&self, endpoint: Endpoint) -> Option<&str> {
        match self.outcome(endpoint) {
            EndpointOutcome::Ok(body) => body.as_text(),
            _ => None,
        }
    }

    /// True when not a single candidate got past the transport, meaning the
    /// device itself is unreachable rather than merely old firmware.
    pub fn all_unreachable(&self) -> bool {
        Endpoint::CANDIDATES
            .iter()
            .all(|ep| matches!(self.outcome(*ep), EndpointOutcome::NetworkError))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_json_endpoint() {
        let ok = classify_response(Endpoint::ProductionJson, 200, r#"{"production": []}"#);
        assert!(ok.is_ok());

        let bad = classify_response(Endpoint::ProductionJson, 200, "<html>oops</html>");
        assert_eq!(bad, EndpointOutcome::Malformed);
        assert!(bad.is_present());
    }

    #[test]
    fn classify_text_endpoint_never_malformed() {
        let out = classify_response(Endpoint::LegacyProduction, 200, "<html></html>");
        assert!(out.is_ok());
    }

    #[test]
    fn classify_statuses() {
        assert_eq!(
            classify_response(Endpoint::MeterConfig, 404, ""),
            EndpointOutcome::NotFound
        );
        assert_eq!(
            classify_response(Endpoint::MeterConfig, 401, ""),
            EndpointOutcome::Unauthorized
        );
        assert_eq!(
            classify_response(Endpoint::MeterConfig, 403, ""),
            EndpointOutcome::Unauthorized
        );
        assert_eq!(
            classify_response(Endpoint::MeterConfig, 500, ""),
            EndpointOutcome::NetworkError
        );
    }

    #[test]
    fn empty_array_counts_as_present() {
        let out = classify_response(Endpoint::ApiV1Inverters, 200, "[]");
        assert!(out.is_ok());
    }

    #[test]
    fn missing_outcome_reads_as_network_error() {
        let results = ProbeResults::default();
        assert!(results.all_unreachable());
        assert!(!results.succeeded(Endpoint::Info));
    }

    #[test]
    fn all_unreachable_false_after_one_404() {
        let mut results = ProbeResults::default();
        results.insert(Endpoint::MeterConfig, EndpointOutcome::NotFound);
        assert!(!results.all_unreachable());
    }
}
