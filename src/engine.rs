//! One resolution request, end to end.
//!
//! ```text
//! Received -> LinkResolved -> SnapshotFetched -> Selected{Allocated|Exhausted}
//!          -> EventRecorded -> Responded
//! ```
//!
//! Reads before the decision are fatal to the request and record nothing.
//! Writes after the decision (event append, click counter) are logged on
//! failure and never change the answer.
//!
//! Known limitation: with reservations on, a `try_reserve` that times out
//! may still have committed its occupancy bump. That slot stays taken
//! with no event behind it, and the request answers 502.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::Settings;
use crate::fingerprint::requester_fingerprint;
use crate::model::{AllocationEvent, AllocationResult, CandidateRef, RedirectLink, RequestMeta};
use crate::selector::{self, LiveSnapshot};
use crate::store::{AnalyticsRecorder, CandidateStore, StoreError, StoreFuture};
use crate::util::destination_for;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no link with slug {0:?}")]
    NotFound(String),
    #[error("link {0:?} is inactive")]
    Inactive(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),
}

impl ResolveError {
    /// HTTP status. Inactive and unknown slugs look the same from outside.
    pub fn status(&self) -> u16 {
        match self {
            ResolveError::NotFound(_) | ResolveError::Inactive(_) => 404,
            ResolveError::StorageUnavailable(_) => 502,
        }
    }
}

impl From<StoreError> for ResolveError {
    fn from(e: StoreError) -> Self {
        ResolveError::StorageUnavailable(e)
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub destination_base: Url,
    pub store_timeout: Duration,
    pub reserve_on_allocate: bool,
    pub fingerprint_salt: String,
}

impl From<&Settings> for EngineOptions {
    fn from(s: &Settings) -> Self {
        Self {
            destination_base: s.destination_base.clone(),
            store_timeout: s.store_timeout,
            reserve_on_allocate: s.reserve_on_allocate,
            fingerprint_salt: s.fingerprint_salt.clone(),
        }
    }
}

/// Stateless between requests; every shared counter lives in the store.
#[derive(Clone)]
pub struct AllocationEngine {
    store: Arc<dyn CandidateStore>,
    analytics: Arc<dyn AnalyticsRecorder>,
    opts: EngineOptions,
}

impl AllocationEngine {
    pub fn new(
        store: Arc<dyn CandidateStore>,
        analytics: Arc<dyn AnalyticsRecorder>,
        opts: EngineOptions,
    ) -> Self {
        Self {
            store,
            analytics,
            opts,
        }
    }

    pub async fn resolve(
        &self,
        slug: &str,
        meta: &RequestMeta,
    ) -> Result<AllocationResult, ResolveError> {
        let link = self.load_link(slug).await?;

        // Never cached: capacity moves between any two requests.
        let ids = link.candidates.ids();
        let live = within(self.opts.store_timeout, self.store.get_live_states(&ids))
            .await
            .inspect_err(|e| tracing::error!(slug, "live state fetch failed: {e}"))?;

        let chosen = self.choose(&link, &live).await?;

        let fingerprint = requester_fingerprint(meta, &self.opts.fingerprint_salt);
        let event = AllocationEvent::new(
            &link.id,
            chosen.as_ref().map(|c| c.candidate_id.as_str()),
            fingerprint,
        );
        let count_click = chosen.as_ref().map(|_| link.id.clone());
        self.record(event, count_click).await;

        Ok(match chosen {
            Some(c) => {
                tracing::debug!(slug, candidate_id = %c.candidate_id, "allocated");
                AllocationResult::Allocated {
                    destination: destination_for(&self.opts.destination_base, &c.external_ref),
                    candidate_id: c.candidate_id,
                }
            }
            None => {
                tracing::info!(slug, candidates = ids.len(), "all candidates exhausted");
                AllocationResult::Exhausted
            }
        })
    }

    async fn load_link(&self, slug: &str) -> Result<RedirectLink, ResolveError> {
        let link = within(self.opts.store_timeout, self.store.get_link(slug))
            .await
            .inspect_err(|e| tracing::error!(slug, "link fetch failed: {e}"))?;

        let Some(link) = link else {
            return Err(ResolveError::NotFound(slug.to_string()));
        };
        if !link.active {
            tracing::debug!(slug, link_id = %link.id, "inactive link requested");
            return Err(ResolveError::Inactive(slug.to_string()));
        }
        if link.candidates.is_empty() {
            tracing::warn!(slug, link_id = %link.id, "link has no candidates configured");
        }
        Ok(link)
    }

    async fn choose(
        &self,
        link: &RedirectLink,
        live: &LiveSnapshot,
    ) -> Result<Option<CandidateRef>, ResolveError> {
        let candidates = link.candidates.as_slice();
        if !self.opts.reserve_on_allocate {
            return Ok(selector::select(candidates, live).cloned());
        }

        // Walk eligible candidates until one reservation sticks.
        for c in selector::eligible(candidates, live) {
            let won = within(self.opts.store_timeout, self.store.try_reserve(&c.candidate_id))
                .await
                .inspect_err(|e| match e {
                    // the conditional ADD may still have landed
                    StoreError::Timeout(_) => tracing::warn!(
                        candidate_id = %c.candidate_id,
                        "reservation outcome unknown: {e}"
                    ),
                    _ => tracing::error!(candidate_id = %c.candidate_id, "reservation failed: {e}"),
                })?;
            if won {
                return Ok(Some(c.clone()));
            }
            tracing::debug!(candidate_id = %c.candidate_id, "lost reservation race");
        }
        Ok(None)
    }

    /// Runs the post-decision writes on their own task so a dropped request
    /// still gets its event recorded.
    async fn record(&self, event: AllocationEvent, count_click: Option<String>) {
        let store = Arc::clone(&self.store);
        let analytics = Arc::clone(&self.analytics);
        let limit = self.opts.store_timeout;

        let task = tokio::spawn(async move {
            let append = async {
                if let Err(e) = within(limit, analytics.append(&event)).await {
                    tracing::error!(
                        event_id = %event.event_id,
                        link_id = %event.link_id,
                        outcome = event.outcome.as_str(),
                        "analytics append failed: {e}"
                    );
                }
            };
            let click = async {
                let Some(link_id) = count_click else {
                    return;
                };
                if let Err(e) = within(limit, store.increment_click_counter(&link_id)).await {
                    tracing::error!(link_id, "click counter increment failed: {e}");
                }
            };
            tokio::join!(append, click);
        });

        if let Err(e) = task.await {
            tracing::error!("allocation write task aborted: {e}");
        }
    }
}

async fn within<T>(limit: Duration, fut: StoreFuture<'_, T>) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(StoreError::Timeout(limit.as_millis() as u64)),
    }
}
