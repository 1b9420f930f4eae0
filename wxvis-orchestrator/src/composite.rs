//! The composite request and its sub-request legs (spec.md §4.7 "Request
//! fan-out").

use std::collections::BTreeMap;

use wxvis_core::request::Request;

/// One named leg of a composite request. Scene views are identified by a
/// caller-assigned id rather than a type this crate would need to know
/// about.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubRequestRole {
    Data,
    Selection,
    SingleTimeSelection,
    Normals(usize),
    DerivedGeometry(usize),
}

#[derive(Clone, Debug)]
struct SubRequest {
    request: Request,
    available: bool,
}

/// A pending composite request tracked in a slot's FIFO queue. Constructed
/// once per parameter change and never mutated except by
/// [`TrajectoryOrchestrator::complete_sub_request`].
#[derive(Clone, Debug)]
pub struct CompositeRequest {
    subs: BTreeMap<SubRequestRole, SubRequest>,
    num_pending: usize,
    pub sync_id: Option<u64>,
    /// Set when this is the first composite enqueued after a data source
    /// was newly connected to this slot (spec.md §4.7 "First-time special
    /// case"). The caller should enqueue a selection-only follow-up once
    /// this composite's `Data` leg becomes available.
    pub first_connection: bool,
}

impl CompositeRequest {
    pub fn new(subs: BTreeMap<SubRequestRole, Request>, sync_id: Option<u64>) -> Self {
        let num_pending = subs.len();
        let subs = subs
            .into_iter()
            .map(|(role, request)| (role, SubRequest { request, available: false }))
            .collect();
        CompositeRequest { subs, num_pending, sync_id, first_connection: false }
    }

    pub fn is_ready(&self) -> bool {
        self.num_pending == 0
    }

    pub fn request_for(&self, role: &SubRequestRole) -> Option<&Request> {
        self.subs.get(role).map(|sub| &sub.request)
    }

    pub fn roles(&self) -> impl Iterator<Item = &SubRequestRole> {
        self.subs.keys()
    }

    pub fn is_available(&self, role: &SubRequestRole) -> bool {
        self.subs.get(role).map_or(false, |sub| sub.available)
    }

    /// Marks every leg whose request's canonical string equals `completed`
    /// as available. Idempotent: a repeat completion does not decrement
    /// `num_pending` twice. Returns `true` if any leg changed.
    pub(crate) fn mark_available(&mut self, completed: &str) -> bool {
        let mut changed = false;
        for sub in self.subs.values_mut() {
            if !sub.available && sub.request.to_canonical_string() == completed {
                sub.available = true;
                self.num_pending = self.num_pending.saturating_sub(1);
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(tag: &str) -> Request {
        Request::new().with("TAG", tag)
    }

    #[test]
    fn ready_only_once_every_leg_is_available() {
        let mut subs = BTreeMap::new();
        subs.insert(SubRequestRole::Data, req("data"));
        subs.insert(SubRequestRole::Selection, req("sel"));
        let mut composite = CompositeRequest::new(subs, None);
        assert!(!composite.is_ready());

        composite.mark_available(&req("data").to_canonical_string());
        assert!(!composite.is_ready());
        composite.mark_available(&req("sel").to_canonical_string());
        assert!(composite.is_ready());
    }

    #[test]
    fn repeat_completion_does_not_double_decrement() {
        let mut subs = BTreeMap::new();
        subs.insert(SubRequestRole::Data, req("data"));
        subs.insert(SubRequestRole::Selection, req("sel"));
        let mut composite = CompositeRequest::new(subs, None);

        let changed_first = composite.mark_available(&req("data").to_canonical_string());
        let changed_second = composite.mark_available(&req("data").to_canonical_string());
        assert!(changed_first);
        assert!(!changed_second);
        assert!(!composite.is_ready());
    }
}
