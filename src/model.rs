use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type LinkId = String;
pub type CandidateId = String;

/// One routable endpoint as captured on the link when it was authored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CandidateRef {
    pub candidate_id: CandidateId,
    pub display_name: String,
    pub priority: i64, // lower is tried first
    pub external_ref: String,
}

/// Candidates in priority order. Only built through `from_authored`, which
/// performs the one and only sort, so selection is a plain scan.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(from = "Vec<CandidateRef>", into = "Vec<CandidateRef>")]
pub struct CandidateList(Vec<CandidateRef>);

impl CandidateList {
    pub fn from_authored(mut candidates: Vec<CandidateRef>) -> Self {
        // sort_by_key is stable: equal priorities keep their authored order
        candidates.sort_by_key(|c| c.priority);
        Self(candidates)
    }

    pub fn as_slice(&self) -> &[CandidateRef] {
        &self.0
    }

    pub fn ids(&self) -> Vec<CandidateId> {
        self.0.iter().map(|c| c.candidate_id.clone()).collect()
    }

    pub fn get(&self, candidate_id: &str) -> Option<&CandidateRef> {
        self.0.iter().find(|c| c.candidate_id == candidate_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<CandidateRef>> for CandidateList {
    fn from(v: Vec<CandidateRef>) -> Self {
        Self::from_authored(v)
    }
}

impl From<CandidateList> for Vec<CandidateRef> {
    fn from(l: CandidateList) -> Self {
        l.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RedirectLink {
    pub id: LinkId,
    pub slug: String,
    pub candidates: CandidateList,
    pub active: bool,
    pub total_clicks: u64,
}

/// Occupancy as last reported by the store. `occupancy` may run past
/// `capacity` while the external system catches up.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CandidateLiveState {
    pub occupancy: i64,
    pub capacity: i64,
}

impl CandidateLiveState {
    pub fn has_room(&self) -> bool {
        self.capacity > 0 && self.occupancy < self.capacity
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allocated,
    Exhausted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allocated => "allocated",
            Outcome::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AllocationEvent {
    pub event_id: String,
    pub link_id: LinkId,
    pub chosen_candidate_id: Option<CandidateId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub requester_fingerprint: Option<String>,
    pub outcome: Outcome,
}

impl AllocationEvent {
    pub fn new(
        link_id: &str,
        chosen: Option<&str>,
        requester_fingerprint: Option<String>,
    ) -> Self {
        let outcome = if chosen.is_some() {
            Outcome::Allocated
        } else {
            Outcome::Exhausted
        };
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            link_id: link_id.to_string(),
            chosen_candidate_id: chosen.map(str::to_string),
            timestamp: Utc::now(),
            requester_fingerprint,
            outcome,
        }
    }
}

/// Per-request metadata the HTTP layer extracts before resolving.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationResult {
    Allocated {
        destination: String,
        candidate_id: CandidateId,
    },
    Exhausted,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResp {
    pub destination: String,
    pub candidate_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, priority: i64) -> CandidateRef {
        CandidateRef {
            candidate_id: id.into(),
            display_name: id.to_uppercase(),
            priority,
            external_ref: format!("code-{id}"),
        }
    }

    #[test]
    fn authored_list_sorts_by_priority_and_keeps_ties_in_order() {
        let list = CandidateList::from_authored(vec![
            cand("c", 2),
            cand("a", 1),
            cand("d", 2),
            cand("b", 1),
        ]);
        let ids: Vec<_> = list.as_slice().iter().map(|c| c.candidate_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c", "d"]);
    }

    #[test]
    fn zero_or_negative_capacity_is_full() {
        assert!(!CandidateLiveState { occupancy: 0, capacity: 0 }.has_room());
        assert!(!CandidateLiveState { occupancy: -3, capacity: -1 }.has_room());
        assert!(!CandidateLiveState { occupancy: 12, capacity: 10 }.has_room());
        assert!(CandidateLiveState { occupancy: 9, capacity: 10 }.has_room());
    }

    #[test]
    fn event_outcome_follows_choice() {
        let e = AllocationEvent::new("l1", Some("g2"), None);
        assert_eq!(e.outcome, Outcome::Allocated);
        let e = AllocationEvent::new("l1", None, Some("fp".into()));
        assert_eq!(e.outcome, Outcome::Exhausted);
        assert_eq!(e.chosen_candidate_id, None);
    }

    #[test]
    fn resolve_resp_uses_camel_case() {
        let v = serde_json::to_value(ResolveResp {
            destination: "https://x.test/a".into(),
            candidate_id: "g1".into(),
        })
        .unwrap();
        assert_eq!(v["candidateId"], "g1");
    }
}
