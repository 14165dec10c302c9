// =============================================
// Capacity selection
// =============================================
// First-fit over a priority-ordered candidate list. The list is already
// sorted (see CandidateList::from_authored); this module never reorders it.
//
//   - no live state for a candidate   -> skipped, logged
//   - occupancy < capacity (cap > 0)  -> eligible
//   - otherwise                       -> full
//
// No I/O and no hidden state: same inputs, same answer.

use std::collections::HashMap;

use crate::model::{CandidateId, CandidateLiveState, CandidateRef};

pub type LiveSnapshot = HashMap<CandidateId, CandidateLiveState>;

/// Returns the first candidate with free capacity, or `None` when every
/// candidate is full or has no live state.
pub fn select<'a>(candidates: &'a [CandidateRef], live: &LiveSnapshot) -> Option<&'a CandidateRef> {
    eligible(candidates, live).next()
}

/// All candidates with free capacity, in priority order. Used when the
/// caller has to reserve a slot and may lose the race on the first one.
pub fn eligible<'a, 'b>(
    candidates: &'a [CandidateRef],
    live: &'b LiveSnapshot,
) -> impl Iterator<Item = &'a CandidateRef> + 'b
where
    'a: 'b,
{
    candidates.iter().filter(move |c| match live.get(&c.candidate_id) {
        Some(state) => state.has_room(),
        None => {
            tracing::warn!(candidate_id = %c.candidate_id, "no live state for candidate; skipping");
            false
        }
    })
}
