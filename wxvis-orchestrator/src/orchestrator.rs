//! Per-actor composite-request sequencing (spec.md §4.7 "Trajectory
//! orchestrator (the hardest part)").
//!
//! Deliberately source-agnostic: this crate does not depend on
//! `wxvis-pipeline`'s `DataSource` trait or `wxvis-cache`'s `HostCache`.
//! Callers build sub-requests, hand them to [`TrajectoryOrchestrator::enqueue`],
//! dispatch them to real sources themselves, and report completions back
//! through [`TrajectoryOrchestrator::complete_sub_request`]. This mirrors
//! spec.md §5's "completion callbacks are marshalled onto the UI thread" --
//! the orchestrator only runs on that single thread, so its state needs no
//! internal locking.

use std::collections::{BTreeMap, VecDeque};

use fxhash::FxHashMap;

use wxvis_core::request::Request;

use crate::composite::{CompositeRequest, SubRequestRole};

struct Slot {
    pending: VecDeque<CompositeRequest>,
    connected: bool,
}

impl Slot {
    fn new() -> Self {
        Slot { pending: VecDeque::new(), connected: false }
    }
}

/// A composite drained from the head of a slot's queue (spec.md §4.7
/// "Drain"), ready for the caller to apply: release superseded held items,
/// fetch the new ones, recompute derived GPU buffers, notify pickers.
pub struct DrainedComposite {
    pub slot: usize,
    pub composite: CompositeRequest,
}

pub struct TrajectoryOrchestrator {
    slots: Vec<Slot>,
    slots_remaining_for_sync: FxHashMap<u64, usize>,
}

impl TrajectoryOrchestrator {
    pub fn new(num_slots: usize) -> Self {
        TrajectoryOrchestrator {
            slots: (0..num_slots).map(|_| Slot::new()).collect(),
            slots_remaining_for_sync: FxHashMap::default(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn pending_len(&self, slot: usize) -> usize {
        self.slots[slot].pending.len()
    }

    /// Registers that `sync_id` spans `num_slots_expected` composites; the
    /// controller is signaled once every one of them has drained (spec.md
    /// §4.7 "External sync bridge").
    pub fn begin_sync_event(&mut self, sync_id: u64, num_slots_expected: usize) {
        self.slots_remaining_for_sync.insert(sync_id, num_slots_expected);
    }

    /// Builds and enqueues a composite on `slot`, returning its
    /// `first_connection` flag so the caller knows whether to schedule the
    /// selection-only follow-up pass once the data leg resolves.
    ///
    /// The caller must dispatch every sub-request to its source
    /// *immediately* after this returns, and before any of those sources
    /// could plausibly complete -- spec.md §4.7 requires the orchestrator to
    /// never observe a completion before the matching sub-request is
    /// recorded in the queue. Since this method and dispatch both run on
    /// the caller's single orchestrator thread, that ordering falls out
    /// naturally as long as the caller doesn't hand dispatch off to another
    /// thread before enqueueing returns.
    pub fn enqueue(
        &mut self,
        slot: usize,
        subs: BTreeMap<SubRequestRole, Request>,
        sync_id: Option<u64>,
    ) -> bool {
        let has_data = subs.contains_key(&SubRequestRole::Data);
        let slot_state = &mut self.slots[slot];

        let mut composite = CompositeRequest::new(subs, sync_id);
        let first_connection = has_data && !slot_state.connected;
        if first_connection {
            composite.first_connection = true;
            slot_state.connected = true;
        }

        slot_state.pending.push_back(composite);
        log::debug!(
            target: "wxvis_orchestrator",
            "slot {} enqueued composite, {} now pending",
            slot,
            slot_state.pending.len()
        );
        first_connection
    }

    /// Applies a completion signal to every pending composite in every
    /// slot (spec.md §4.7 "Completion handling": "a single completion never
    /// breaks the loop early"), then drains each slot's head as far as it
    /// will go (spec.md §4.7 "Drain"). Returns drained composites in
    /// slot-major, FIFO-within-slot order, and any sync ids that just
    /// reached zero remaining.
    pub fn complete_sub_request(&mut self, completed: &str) -> (Vec<DrainedComposite>, Vec<u64>) {
        let mut drained = Vec::new();
        let mut completed_syncs = Vec::new();

        for (slot_idx, slot) in self.slots.iter_mut().enumerate() {
            for composite in slot.pending.iter_mut() {
                composite.mark_available(completed);
            }

            while slot.pending.front().map_or(false, CompositeRequest::is_ready) {
                let composite = slot.pending.pop_front().expect("front checked Some above");
                log::debug!(target: "wxvis_orchestrator", "slot {} drained a composite", slot_idx);

                if let Some(sync_id) = composite.sync_id {
                    if let Some(remaining) = self.slots_remaining_for_sync.get_mut(&sync_id) {
                        *remaining = remaining.saturating_sub(1);
                        if *remaining == 0 {
                            self.slots_remaining_for_sync.remove(&sync_id);
                            log::info!(target: "wxvis_orchestrator", "sync event {} completed", sync_id);
                            completed_syncs.push(sync_id);
                        }
                    }
                }

                drained.push(DrainedComposite { slot: slot_idx, composite });
            }

            if !slot.pending.is_empty() {
                log::debug!(
                    target: "wxvis_orchestrator",
                    "slot {} stalled at head, {} still pending",
                    slot_idx,
                    slot.pending.len()
                );
            }
        }

        (drained, completed_syncs)
    }
}

/// Tracks the items a slot currently references (spec.md §4.7 `held[slot]`).
/// `T` is typically an `Arc<DataItem>` from the caller's pipeline crate --
/// this crate only tracks replacement, not item lifetime or release.
pub struct HeldState<T> {
    pub data: Option<T>,
    pub selection: Option<T>,
    pub single_time_selection: Option<T>,
    pub normals: FxHashMap<usize, T>,
    pub derived_geometry: FxHashMap<usize, T>,
}

impl<T> HeldState<T> {
    pub fn new() -> Self {
        HeldState {
            data: None,
            selection: None,
            single_time_selection: None,
            normals: FxHashMap::default(),
            derived_geometry: FxHashMap::default(),
        }
    }

    /// Replaces the item held for `role`, returning whatever was held
    /// before so the caller can release it.
    pub fn replace(&mut self, role: &SubRequestRole, item: T) -> Option<T> {
        match role {
            SubRequestRole::Data => self.data.replace(item),
            SubRequestRole::Selection => self.selection.replace(item),
            SubRequestRole::SingleTimeSelection => self.single_time_selection.replace(item),
            SubRequestRole::Normals(view) => self.normals.insert(*view, item),
            SubRequestRole::DerivedGeometry(view) => self.derived_geometry.insert(*view, item),
        }
    }
}

impl<T> Default for HeldState<T> {
    fn default() -> Self {
        HeldState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(tag: &str) -> Request {
        Request::new().with("TAG", tag)
    }

    fn composite(slot_subs: &[(SubRequestRole, Request)]) -> BTreeMap<SubRequestRole, Request> {
        slot_subs.iter().cloned().collect()
    }

    // spec.md §8 seed scenario 5: two rapid parameter changes on one slot
    // must drain in enqueue order even if the second composite's sub
    // requests complete first.
    #[test]
    fn drains_strictly_in_fifo_order_despite_out_of_order_completions() {
        let mut orch = TrajectoryOrchestrator::new(1);
        orch.enqueue(0, composite(&[(SubRequestRole::Data, req("gen1"))]), None);
        orch.enqueue(0, composite(&[(SubRequestRole::Data, req("gen2"))]), None);

        // The second composite's sub-request completes first; it must not
        // drain ahead of the still-pending first composite.
        let (drained, _) = orch.complete_sub_request(&req("gen2").to_canonical_string());
        assert!(drained.is_empty(), "must not drain out of FIFO order");
        assert_eq!(orch.pending_len(0), 2);

        // Completing gen1 unblocks the head, which then also releases the
        // already-ready gen2 sitting right behind it, still in order.
        let (drained, _) = orch.complete_sub_request(&req("gen1").to_canonical_string());
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0].composite.request_for(&SubRequestRole::Data).unwrap().to_canonical_string(),
            req("gen1").to_canonical_string()
        );
        assert_eq!(
            drained[1].composite.request_for(&SubRequestRole::Data).unwrap().to_canonical_string(),
            req("gen2").to_canonical_string()
        );
        assert_eq!(orch.pending_len(0), 0);
    }

    #[test]
    fn a_single_completion_updates_every_waiting_composite() {
        let mut orch = TrajectoryOrchestrator::new(1);
        let shared = req("shared-selection");
        orch.enqueue(0, composite(&[(SubRequestRole::Data, req("d1")), (SubRequestRole::Selection, shared.clone())]), None);
        orch.enqueue(0, composite(&[(SubRequestRole::Data, req("d2")), (SubRequestRole::Selection, shared.clone())]), None);

        orch.complete_sub_request(&req("d1").to_canonical_string());
        orch.complete_sub_request(&req("d2").to_canonical_string());
        let (drained, _) = orch.complete_sub_request(&shared.to_canonical_string());
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn first_data_connection_is_flagged_once_per_slot() {
        let mut orch = TrajectoryOrchestrator::new(1);
        let first = orch.enqueue(0, composite(&[(SubRequestRole::Data, req("d1"))]), None);
        let second = orch.enqueue(0, composite(&[(SubRequestRole::Data, req("d2"))]), None);
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn sync_event_completes_only_after_every_tagged_slot_drains() {
        let mut orch = TrajectoryOrchestrator::new(2);
        orch.begin_sync_event(42, 2);
        orch.enqueue(0, composite(&[(SubRequestRole::Data, req("a"))]), Some(42));
        orch.enqueue(1, composite(&[(SubRequestRole::Data, req("b"))]), Some(42));

        let (_, syncs) = orch.complete_sub_request(&req("a").to_canonical_string());
        assert!(syncs.is_empty());
        let (_, syncs) = orch.complete_sub_request(&req("b").to_canonical_string());
        assert_eq!(syncs, vec![42]);
    }

    #[test]
    fn held_state_replace_returns_the_superseded_item() {
        let mut held: HeldState<u32> = HeldState::new();
        assert!(held.replace(&SubRequestRole::Data, 1).is_none());
        assert_eq!(held.replace(&SubRequestRole::Data, 2), Some(1));
        assert_eq!(held.replace(&SubRequestRole::Normals(0), 9), None);
        assert_eq!(held.replace(&SubRequestRole::Normals(0), 10), Some(9));
    }
}
