use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{AnalyticsRecorder, CandidateStore, StoreError, StoreFuture};
use crate::model::{AllocationEvent, CandidateId, CandidateLiveState, RedirectLink};

/// In-process `CandidateStore` with failure injection.
#[derive(Default)]
pub struct MemoryStore {
    links: Mutex<HashMap<String, RedirectLink>>, // keyed by slug
    live: Mutex<HashMap<CandidateId, CandidateLiveState>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_link(&self, link: RedirectLink) {
        lock(&self.links).insert(link.slug.clone(), link);
    }

    pub fn set_live(&self, candidate_id: &str, occupancy: i64, capacity: i64) {
        lock(&self.live).insert(
            candidate_id.to_string(),
            CandidateLiveState {
                occupancy,
                capacity,
            },
        );
    }

    pub fn live(&self, candidate_id: &str) -> Option<CandidateLiveState> {
        lock(&self.live).get(candidate_id).copied()
    }

    pub fn clicks(&self, slug: &str) -> Option<u64> {
        lock(&self.links).get(slug).map(|l| l.total_clicks)
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check(&self, flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("injected {what} failure")));
        }
        Ok(())
    }
}

impl CandidateStore for MemoryStore {
    fn get_link<'a>(&'a self, slug: &'a str) -> StoreFuture<'a, Option<RedirectLink>> {
        Box::pin(async move {
            self.pause().await;
            self.check(&self.fail_reads, "read")?;
            Ok(lock(&self.links).get(slug).cloned())
        })
    }

    fn get_live_states<'a>(
        &'a self,
        candidate_ids: &'a [CandidateId],
    ) -> StoreFuture<'a, HashMap<CandidateId, CandidateLiveState>> {
        Box::pin(async move {
            self.pause().await;
            self.check(&self.fail_reads, "read")?;
            let live = lock(&self.live);
            Ok(candidate_ids
                .iter()
                .filter_map(|id| live.get(id).map(|s| (id.clone(), *s)))
                .collect())
        })
    }

    fn increment_click_counter<'a>(&'a self, link_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            self.check(&self.fail_writes, "write")?;
            let mut links = lock(&self.links);
            match links.values_mut().find(|l| l.id == link_id) {
                Some(link) => {
                    link.total_clicks += 1;
                    Ok(())
                }
                None => Err(StoreError::Conflict(format!("no link {link_id}"))),
            }
        })
    }

    fn try_reserve<'a>(&'a self, candidate_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.pause().await;
            self.check(&self.fail_writes, "write")?;
            let mut live = lock(&self.live);
            match live.get_mut(candidate_id) {
                Some(state) if state.has_room() => {
                    state.occupancy += 1;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}

/// In-process `AnalyticsRecorder`; keeps every appended event.
#[derive(Default)]
pub struct MemoryAnalytics {
    events: Mutex<Vec<AllocationEvent>>,
    fail_writes: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AllocationEvent> {
        lock(&self.events).clone()
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

impl AnalyticsRecorder for MemoryAnalytics {
    fn append<'a>(&'a self, event: &'a AllocationEvent) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let ms = self.latency_ms.load(Ordering::SeqCst);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected append failure".into()));
            }
            let mut events = lock(&self.events);
            if events.iter().any(|e| e.event_id == event.event_id) {
                return Err(StoreError::Conflict(event.event_id.clone()));
            }
            events.push(event.clone());
            Ok(())
        })
    }
}

// A poisoned lock only means another test thread panicked mid-update;
// the maps stay usable.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CandidateList, CandidateRef};

    fn link() -> RedirectLink {
        RedirectLink {
            id: "L1".into(),
            slug: "promo".into(),
            candidates: CandidateList::from_authored(vec![CandidateRef {
                candidate_id: "g1".into(),
                display_name: "Group 1".into(),
                priority: 1,
                external_ref: "abc".into(),
            }]),
            active: true,
            total_clicks: 0,
        }
    }

    #[tokio::test]
    async fn live_states_omit_unknown_ids() {
        let store = MemoryStore::new();
        store.set_live("g1", 1, 2);
        let ids = vec!["g1".to_string(), "ghost".to_string()];
        let got = store.get_live_states(&ids).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(got.contains_key("g1"));
    }

    #[tokio::test]
    async fn reserve_stops_at_capacity() {
        let store = MemoryStore::new();
        store.set_live("g1", 1, 2);
        assert!(store.try_reserve("g1").await.unwrap());
        assert!(!store.try_reserve("g1").await.unwrap());
        assert_eq!(store.live("g1").unwrap().occupancy, 2);
        assert!(!store.try_reserve("nope").await.unwrap());
    }

    #[tokio::test]
    async fn click_counter_increments_by_link_id() {
        let store = MemoryStore::new();
        store.put_link(link());
        store.increment_click_counter("L1").await.unwrap();
        store.increment_click_counter("L1").await.unwrap();
        assert_eq!(store.clicks("promo"), Some(2));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_backend_errors() {
        let store = MemoryStore::new();
        store.put_link(link());
        store.fail_reads(true);
        assert!(matches!(
            store.get_link("promo").await,
            Err(StoreError::Backend(_))
        ));
        store.fail_reads(false);
        assert!(store.get_link("promo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn analytics_rejects_duplicate_event_ids() {
        let rec = MemoryAnalytics::new();
        let e = AllocationEvent::new("L1", Some("g1"), None);
        rec.append(&e).await.unwrap();
        assert!(matches!(rec.append(&e).await, Err(StoreError::Conflict(_))));
        assert_eq!(rec.events().len(), 1);
    }
}
