//! Per-service stats behind the `<path>/stats` sub-resource.

use std::time::Duration;

use dashmap::DashMap;
use docket_core::{latency_stat, request_count_stat, Action, ServiceStat, ServiceStats};

use super::operation::{Operation, OperationError, OperationResponse, OperationResult};

/// Stats of every instrumented service, keyed by owner link.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    entries: DashMap<String, ServiceStats>,
}

impl StatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one completed `action` on `link` and records its latency.
    pub fn record_action(&self, link: &str, action: Action, latency: Duration, now_micros: u64) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let mut stats = self.stats_mut(link);
        apply(&mut stats.entries, &request_count_stat(action), 1.0, now_micros, true);
        #[allow(clippy::cast_precision_loss)]
        apply(&mut stats.entries, &latency_stat(action), micros as f64, now_micros, false);
    }

    /// Adds `stat` to the entry of the same name, creating it if needed.
    /// Returns the entry after the update.
    pub fn upsert(&self, link: &str, stat: &ServiceStat, now_micros: u64) -> ServiceStat {
        let mut stats = self.stats_mut(link);
        let entry = apply(
            &mut stats.entries,
            &stat.name,
            stat.latest_value,
            now_micros,
            false,
        );
        if stat.unit.is_some() {
            entry.unit.clone_from(&stat.unit);
        }
        entry.clone()
    }

    /// Forgets the stats of `link`.
    pub fn remove(&self, link: &str) {
        self.entries.remove(link);
    }

    #[must_use]
    pub fn snapshot(&self, link: &str) -> ServiceStats {
        self.entries
            .get(link)
            .map_or_else(|| empty(link), |stats| stats.clone())
    }

    /// Answers an operation addressed to `<owner>/stats`.
    pub(crate) fn handle(&self, owner: &str, op: &Operation, now_micros: u64) -> OperationResult {
        match op.action() {
            Action::Read => OperationResponse::json(&self.snapshot(owner)),
            Action::Create | Action::Update | Action::UpdateMerge => {
                let stat: ServiceStat = op.body_as()?;
                if stat.name.is_empty() {
                    return Err(OperationError::validation("stat name is required"));
                }
                OperationResponse::json(&self.upsert(owner, &stat, now_micros))
            }
            Action::Delete => {
                self.remove(owner);
                Ok(OperationResponse::empty())
            }
            Action::Discover => Err(OperationError::validation(format!(
                "{} not supported on stats",
                op.action()
            ))),
        }
    }

    fn stats_mut(&self, link: &str) -> dashmap::mapref::one::RefMut<'_, String, ServiceStats> {
        self.entries
            .entry(link.to_string())
            .or_insert_with(|| empty(link))
    }
}

fn empty(link: &str) -> ServiceStats {
    ServiceStats {
        document_self_link: format!("{link}{}", docket_core::STATS_SUFFIX),
        entries: std::collections::BTreeMap::new(),
    }
}

/// Folds one sample into the named stat. Counters report their running
/// total as the latest value.
fn apply<'a>(
    entries: &'a mut std::collections::BTreeMap<String, ServiceStat>,
    name: &str,
    value: f64,
    now_micros: u64,
    counter: bool,
) -> &'a mut ServiceStat {
    let entry = entries
        .entry(name.to_string())
        .or_insert_with(|| ServiceStat::new(name, 0.0));
    entry.accumulated_value += value;
    entry.latest_value = if counter {
        entry.accumulated_value
    } else {
        value
    };
    entry.version += 1;
    entry.last_update_micros = now_micros;
    entry
}
