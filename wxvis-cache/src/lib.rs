mod manager;
pub use manager::{CacheTier, MemoryManager};

mod host;
pub use host::{new_host_cache, HostCache};

mod device;
pub use device::{new_gpu_cache, GpuCache};
