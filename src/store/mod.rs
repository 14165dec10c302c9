//! Collaborator boundaries: where links, live occupancy and allocation
//! events actually live.
//!
//! `ddb` talks to DynamoDB; `memory` backs tests and local runs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::model::{AllocationEvent, CandidateId, CandidateLiveState, RedirectLink};

pub mod ddb;
pub mod memory;

/// Boxed future alias keeping the collaborator traits dyn-compatible.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store call timed out after {0} ms")]
    Timeout(u64),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("malformed item: {0}")]
    Decode(String),
    #[error("conditional write rejected: {0}")]
    Conflict(String),
}

/// Durable link definitions and live occupancy counters.
pub trait CandidateStore: Send + Sync {
    /// `Ok(None)` when no link has this slug.
    fn get_link<'a>(&'a self, slug: &'a str) -> StoreFuture<'a, Option<RedirectLink>>;

    /// Ids without live state are simply absent from the map.
    fn get_live_states<'a>(
        &'a self,
        candidate_ids: &'a [CandidateId],
    ) -> StoreFuture<'a, HashMap<CandidateId, CandidateLiveState>>;

    /// Store-side atomic `total_clicks += 1`.
    fn increment_click_counter<'a>(&'a self, link_id: &'a str) -> StoreFuture<'a, ()>;

    /// Atomically bumps occupancy if and only if it is still below capacity.
    /// `Ok(false)` means someone else took the last slot.
    fn try_reserve<'a>(&'a self, candidate_id: &'a str) -> StoreFuture<'a, bool>;
}

/// Append-only allocation event log.
pub trait AnalyticsRecorder: Send + Sync {
    fn append<'a>(&'a self, event: &'a AllocationEvent) -> StoreFuture<'a, ()>;
}
