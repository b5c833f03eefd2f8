//! Documents exchanged with a service's stats sub-resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Path suffix of the stats sub-resource.
pub const STATS_SUFFIX: &str = "/stats";

/// Stat name of the per-action request counter, e.g. `READRequestCount`.
#[must_use]
pub fn request_count_stat(action: crate::Action) -> String {
    format!("{}RequestCount", action.as_str())
}

/// Stat name of the per-action latency sample, e.g. `UPDATELatencyMicros`.
#[must_use]
pub fn latency_stat(action: crate::Action) -> String {
    format!("{}LatencyMicros", action.as_str())
}

/// A named stat entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStat {
    pub name: String,
    pub latest_value: f64,
    #[serde(default)]
    pub accumulated_value: f64,
    /// Number of updates applied to this stat.
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub last_update_micros: u64,
}

impl ServiceStat {
    #[must_use]
    pub fn new(name: impl Into<String>, latest_value: f64) -> Self {
        Self {
            name: name.into(),
            latest_value,
            accumulated_value: 0.0,
            version: 0,
            unit: None,
            last_update_micros: 0,
        }
    }
}

/// All stats of one service, keyed by stat name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub document_self_link: String,
    pub entries: BTreeMap<String, ServiceStat>,
}
