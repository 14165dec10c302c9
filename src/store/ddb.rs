// =============================================
// DynamoDB collaborators
// =============================================
// Tables (names from Settings):
//   links       PK link_id (S); GSI "GSI1-slug" on slug (S)
//               status (S "active" | "inactive"), total_clicks (N)
//               candidates (L of M: candidate_id S, display_name S,
//                           priority N, external_ref S)
//   candidates  PK candidate_id (S); occupancy (N), capacity (N)
//   events      PK event_id (S); append-only, see AllocationEvent
//
// Counters only ever move through UpdateItem ADD; nothing here reads a
// counter and writes it back.

use std::collections::HashMap;
use std::time::Duration;

use aws_sdk_dynamodb as ddb;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata}; // for .code()
use ddb::types::{AttributeValue as Av, KeysAndAttributes};

use super::{AnalyticsRecorder, CandidateStore, StoreError, StoreFuture};
use crate::config::Settings;
use crate::model::{
    AllocationEvent, CandidateId, CandidateList, CandidateLiveState, CandidateRef, RedirectLink,
};

type Item = HashMap<String, Av>;

const BATCH_GET_LIMIT: usize = 100;
const UNPROCESSED_RETRIES: u32 = 3;
const UNPROCESSED_BACKOFF_MS: u64 = 25;

/// Wait before re-sending unprocessed keys: 25, 50, 100 ms.
fn unprocessed_backoff(attempt: u32) -> Duration {
    Duration::from_millis(UNPROCESSED_BACKOFF_MS << attempt.saturating_sub(1).min(6))
}

fn map_ddb_err<E: std::error::Error>(e: E) -> StoreError {
    StoreError::Backend(format!("ddb: {}", DisplayErrorContext(&e)))
}

#[derive(Clone)]
pub struct DdbStore {
    pub ddb: ddb::Client,
    pub table_links: String,
    pub links_slug_index: String,
    pub table_candidates: String,
}

impl DdbStore {
    pub fn new(ddb: ddb::Client, settings: &Settings) -> Self {
        Self {
            ddb,
            table_links: settings.table_links.clone(),
            links_slug_index: settings.links_slug_index.clone(),
            table_candidates: settings.table_candidates.clone(),
        }
    }

    async fn query_link(&self, slug: &str) -> Result<Option<RedirectLink>, StoreError> {
        let resp = self
            .ddb
            .query()
            .table_name(&self.table_links)
            .index_name(&self.links_slug_index)
            .key_condition_expression("#s = :s")
            .expression_attribute_names("#s", "slug")
            .expression_attribute_values(":s", Av::S(slug.to_string()))
            .limit(1)
            .send()
            .await
            .map_err(map_ddb_err)?;

        resp.items().first().map(decode_link).transpose()
    }

    async fn batch_live(
        &self,
        candidate_ids: &[CandidateId],
    ) -> Result<HashMap<CandidateId, CandidateLiveState>, StoreError> {
        let mut out = HashMap::with_capacity(candidate_ids.len());
        let mut unique: Vec<&CandidateId> = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }

        for chunk in unique.chunks(BATCH_GET_LIMIT) {
            let mut keys: Vec<Item> = chunk
                .iter()
                .map(|id| HashMap::from([("candidate_id".to_string(), Av::S(id.to_string()))]))
                .collect();

            for attempt in 0..=UNPROCESSED_RETRIES {
                if keys.is_empty() {
                    break;
                }
                if attempt > 0 {
                    tokio::time::sleep(unprocessed_backoff(attempt)).await;
                }
                let request = KeysAndAttributes::builder()
                    .set_keys(Some(keys))
                    .consistent_read(true)
                    .build()
                    .map_err(|e| StoreError::Backend(format!("batch request: {e}")))?;

                let resp = self
                    .ddb
                    .batch_get_item()
                    .request_items(&self.table_candidates, request)
                    .send()
                    .await
                    .map_err(map_ddb_err)?;

                if let Some(items) = resp
                    .responses()
                    .and_then(|r| r.get(&self.table_candidates))
                {
                    for item in items {
                        let (id, state) = decode_live(item)?;
                        out.insert(id, state);
                    }
                }

                keys = resp
                    .unprocessed_keys()
                    .and_then(|u| u.get(&self.table_candidates))
                    .map(|k| k.keys().to_vec())
                    .unwrap_or_default();
            }

            if !keys.is_empty() {
                return Err(StoreError::Backend(format!(
                    "{} candidate keys left unprocessed",
                    keys.len()
                )));
            }
        }
        Ok(out)
    }

    async fn add_click(&self, link_id: &str) -> Result<(), StoreError> {
        let r = self
            .ddb
            .update_item()
            .table_name(&self.table_links)
            .key("link_id", Av::S(link_id.to_string()))
            .update_expression("ADD total_clicks :inc")
            .condition_expression("attribute_exists(link_id)")
            .expression_attribute_values(":inc", Av::N("1".into()))
            .send()
            .await;

        match r {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.code() == Some("ConditionalCheckFailedException") {
                    return Err(StoreError::Conflict(format!("no link {link_id}")));
                }
                Err(map_ddb_err(e))
            }
        }
    }

    async fn reserve(&self, candidate_id: &str) -> Result<bool, StoreError> {
        let r = self
            .ddb
            .update_item()
            .table_name(&self.table_candidates)
            .key("candidate_id", Av::S(candidate_id.to_string()))
            .update_expression("ADD occupancy :inc")
            .condition_expression("capacity > :zero AND occupancy < capacity")
            .expression_attribute_values(":inc", Av::N("1".into()))
            .expression_attribute_values(":zero", Av::N("0".into()))
            .send()
            .await;

        match r {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.code() == Some("ConditionalCheckFailedException") {
                    // lost the race, or the candidate vanished
                    return Ok(false);
                }
                Err(map_ddb_err(e))
            }
        }
    }
}

impl CandidateStore for DdbStore {
    fn get_link<'a>(&'a self, slug: &'a str) -> StoreFuture<'a, Option<RedirectLink>> {
        Box::pin(self.query_link(slug))
    }

    fn get_live_states<'a>(
        &'a self,
        candidate_ids: &'a [CandidateId],
    ) -> StoreFuture<'a, HashMap<CandidateId, CandidateLiveState>> {
        Box::pin(self.batch_live(candidate_ids))
    }

    fn increment_click_counter<'a>(&'a self, link_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.add_click(link_id))
    }

    fn try_reserve<'a>(&'a self, candidate_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.reserve(candidate_id))
    }
}

#[derive(Clone)]
pub struct DdbAnalytics {
    pub ddb: ddb::Client,
    pub table_events: String,
}

impl DdbAnalytics {
    pub fn new(ddb: ddb::Client, settings: &Settings) -> Self {
        Self {
            ddb,
            table_events: settings.table_events.clone(),
        }
    }

    async fn put_event(&self, event: &AllocationEvent) -> Result<(), StoreError> {
        let r = self
            .ddb
            .put_item()
            .table_name(&self.table_events)
            .set_item(Some(encode_event(event)))
            .condition_expression("attribute_not_exists(#e)")
            .expression_attribute_names("#e", "event_id")
            .send()
            .await;

        match r {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.code() == Some("ConditionalCheckFailedException") {
                    return Err(StoreError::Conflict(event.event_id.clone()));
                }
                Err(map_ddb_err(e))
            }
        }
    }
}

impl AnalyticsRecorder for DdbAnalytics {
    fn append<'a>(&'a self, event: &'a AllocationEvent) -> StoreFuture<'a, ()> {
        Box::pin(self.put_event(event))
    }
}

// ----------------- item codecs -----------------

fn get_s<'a>(item: &'a Item, key: &str) -> Result<&'a str, StoreError> {
    item.get(key)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| StoreError::Decode(format!("missing string attribute {key}")))
}

fn get_n<T: std::str::FromStr>(item: &Item, key: &str) -> Result<T, StoreError> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| StoreError::Decode(format!("missing numeric attribute {key}")))
}

pub fn decode_link(item: &Item) -> Result<RedirectLink, StoreError> {
    let id = get_s(item, "link_id")?.to_string();
    let slug = get_s(item, "slug")?.to_string();
    // Unknown status is treated as inactive
    let active = item
        .get("status")
        .and_then(|v| v.as_s().ok())
        .is_some_and(|s| s == "active");
    let total_clicks = item
        .get("total_clicks")
        .and_then(|v| v.as_n().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let raw = match item.get("candidates") {
        None => Vec::new(),
        Some(v) => v
            .as_l()
            .map_err(|_| StoreError::Decode(format!("link {id}: candidates is not a list")))?
            .iter()
            .map(|c| {
                let m = c
                    .as_m()
                    .map_err(|_| StoreError::Decode(format!("link {id}: candidate is not a map")))?;
                decode_candidate(m)
            })
            .collect::<Result<Vec<_>, _>>()?,
    };

    Ok(RedirectLink {
        id,
        slug,
        candidates: CandidateList::from_authored(raw),
        active,
        total_clicks,
    })
}

fn decode_candidate(m: &Item) -> Result<CandidateRef, StoreError> {
    let candidate_id = get_s(m, "candidate_id")?.to_string();
    Ok(CandidateRef {
        display_name: get_s(m, "display_name")
            .map(str::to_string)
            .unwrap_or_else(|_| candidate_id.clone()),
        priority: get_n(m, "priority")?,
        external_ref: get_s(m, "external_ref")?.to_string(),
        candidate_id,
    })
}

pub fn decode_live(item: &Item) -> Result<(CandidateId, CandidateLiveState), StoreError> {
    Ok((
        get_s(item, "candidate_id")?.to_string(),
        CandidateLiveState {
            occupancy: get_n(item, "occupancy")?,
            capacity: get_n(item, "capacity")?,
        },
    ))
}

pub fn encode_event(event: &AllocationEvent) -> Item {
    let mut item = HashMap::new();
    item.insert("event_id".into(), Av::S(event.event_id.clone()));
    item.insert("link_id".into(), Av::S(event.link_id.clone()));
    item.insert("timestamp".into(), Av::S(event.timestamp.to_rfc3339()));
    item.insert("outcome".into(), Av::S(event.outcome.as_str().into()));
    if let Some(c) = &event.chosen_candidate_id {
        item.insert("chosen_candidate_id".into(), Av::S(c.clone()));
    }
    if let Some(fp) = &event.requester_fingerprint {
        item.insert("requester_fingerprint".into(), Av::S(fp.clone()));
    }
    item
}
