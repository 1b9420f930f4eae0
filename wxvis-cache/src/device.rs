//! The GPU cache: stores [`wxvis_core::GpuBufferItem`]s using the
//! "stored but unreferenced" admission discipline (spec.md §3 "Cache entry
//! (GPU)").

use std::sync::Arc;

use wxvis_core::item::GpuBufferItem;

use crate::manager::{CacheTier, MemoryManager};

/// Type alias for the device-resident cache.
pub type GpuCache = MemoryManager<GpuBufferItem>;

/// Constructs a new GPU cache with the given byte budget (KiB).
pub fn new_gpu_cache(identifier: impl Into<String>, limit_kb: u64) -> Arc<GpuCache> {
    MemoryManager::new(identifier, limit_kb, CacheTier::Device)
}
