use chrono::{DateTime, Utc};
use serde::Serialize;

/// Liveness answer for `health`
///
/// Says nothing about the rendering engine; a live process with a dead
/// browser still reports `ok` here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessReport {
    pub status: &'static str,
    pub service_name: String,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LivenessProbe {
    service_name: String,
}

impl LivenessProbe {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn check(&self) -> LivenessReport {
        LivenessReport {
            status: "ok",
            service_name: self.service_name.clone(),
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_report_shape() {
        let report = LivenessProbe::new("render-core").check();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "ok");
        assert_eq!(json["serviceName"], "render-core");
        assert!(json["timestamp"].is_string());
    }
}
