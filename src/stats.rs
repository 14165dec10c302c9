//! Folding allocation events into dashboard counters.
//!
//! Records arrive from the events table's Kinesis stream, either as plain
//! `AllocationEvent` JSON (one object or an array) or wrapped in the
//! DynamoDB change envelope (`dynamodb.NewImage`). Each event bumps:
//!
//! - `(link_id, "total")`
//! - `(link_id, "allocated#<candidate_id>")` or `(link_id, "exhausted")`

use std::collections::{HashMap, HashSet};

use serde_json::Value as Json;

use crate::config::ConfigError;
use crate::model::Outcome;

pub const TOTAL_KEY: &str = "total";
pub const EXHAUSTED_KEY: &str = "exhausted";

/// Where the aggregator writes. Read once per cold start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSettings {
    pub table: String,
    /// The stats table may live in another region than the function.
    pub region: Option<String>,
}

impl StatsSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let table = get("TABLE_STATS")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("TABLE_STATS"))?;
        Ok(Self {
            table,
            region: get("TABLE_REGION").filter(|v| !v.is_empty()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub event_id: Option<String>,
    pub link_id: String,
    pub outcome: Outcome,
    pub candidate_id: Option<String>,
}

impl EventSummary {
    pub fn counter_keys(&self) -> Vec<String> {
        let specific = match (&self.outcome, &self.candidate_id) {
            (Outcome::Allocated, Some(c)) => format!("allocated#{c}"),
            _ => EXHAUSTED_KEY.to_string(),
        };
        vec![TOTAL_KEY.to_string(), specific]
    }
}

/// Per-batch counters. Duplicate deliveries of the same `event_id` inside
/// one batch are counted once.
#[derive(Debug, Default)]
pub struct Tally {
    counts: HashMap<(String, String), u64>,
    seen: HashSet<String>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: &EventSummary) -> bool {
        if let Some(id) = &event.event_id {
            if !self.seen.insert(id.clone()) {
                return false;
            }
        }
        for key in event.counter_keys() {
            *self
                .counts
                .entry((event.link_id.clone(), key))
                .or_insert(0) += 1;
        }
        true
    }

    /// Counts every event found in one stream record; returns how many.
    pub fn ingest(&mut self, data: &[u8]) -> usize {
        let Ok(val) = serde_json::from_slice::<Json>(data) else {
            tracing::warn!(bytes = data.len(), "skipping non-JSON record");
            return 0;
        };
        let objs: Vec<&Json> = match &val {
            Json::Array(arr) => arr.iter().collect(),
            Json::Object(_) => vec![&val],
            _ => Vec::new(),
        };
        objs.into_iter()
            .filter_map(extract_event)
            .filter(|e| self.add(e))
            .count()
    }

    /// Counters sorted by key, ready to write.
    pub fn into_counts(self) -> Vec<((String, String), u64)> {
        let mut out: Vec<_> = self.counts.into_iter().collect();
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

pub fn extract_event(obj: &Json) -> Option<EventSummary> {
    if let Some(image) = obj.pointer("/dynamodb/NewImage") {
        // only inserts; events are never modified
        if let Some(name) = obj.get("eventName").and_then(Json::as_str) {
            if name != "INSERT" {
                return None;
            }
        }
        let s = |k: &str| image.get(k)?.get("S")?.as_str().map(str::to_string);
        return summarize(s("event_id"), s("link_id"), s("outcome"), s("chosen_candidate_id"));
    }

    let s = |k: &str| obj.get(k)?.as_str().map(str::to_string);
    summarize(s("event_id"), s("link_id"), s("outcome"), s("chosen_candidate_id"))
}

fn summarize(
    event_id: Option<String>,
    link_id: Option<String>,
    outcome: Option<String>,
    candidate_id: Option<String>,
) -> Option<EventSummary> {
    let link_id = link_id.filter(|l| !l.is_empty())?;
    let outcome = match outcome?.as_str() {
        "allocated" => Outcome::Allocated,
        "exhausted" => Outcome::Exhausted,
        _ => return None,
    };
    if outcome == Outcome::Allocated && candidate_id.is_none() {
        return None;
    }
    Some(EventSummary {
        event_id,
        link_id,
        outcome,
        candidate_id,
    })
}
