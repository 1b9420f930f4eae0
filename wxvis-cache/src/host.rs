//! The host cache: stores [`wxvis_core::DataItem`]s and implements
//! [`CompanionReleaser`] so that a dependent grid's companion reference
//! (spec.md §3 "Ownership": "Companion references ... are reference counts
//! held for the full lifetime of the dependent grid") is released when the
//! dependent grid is finally dropped.

use std::sync::Arc;

use wxvis_core::item::{CompanionReleaser, DataItem};
use wxvis_core::request::Request;

use crate::manager::{CacheTier, MemoryManager};

/// Type alias for the host-resident cache.
pub type HostCache = MemoryManager<DataItem>;

/// Constructs a new host cache with the given byte budget (KiB).
pub fn new_host_cache(identifier: impl Into<String>, limit_kb: u64) -> Arc<HostCache> {
    MemoryManager::new(identifier, limit_kb, CacheTier::Host)
}

impl CompanionReleaser for MemoryManager<DataItem> {
    fn release_companion(&self, owner: &str, request: &Request) {
        if let Err(err) = self.release(owner, request) {
            log::warn!(
                target: "wxvis_cache",
                "failed to release companion reference for {}/{}: {}",
                owner,
                request,
                err
            );
        }
    }
}
