//! Shared types for the wxvis data pipeline: request encoding, the error
//! taxonomy, and the cacheable data item variants.
//!
//! Nothing in this crate talks to a cache or a scheduler -- those live in
//! `wxvis-cache` and `wxvis-scheduler` respectively, and depend on this
//! crate rather than the other way around.

pub mod error;
pub mod item;
pub mod keys;
pub mod request;

pub use error::PipelineError;
pub use item::{
    CacheSized, CompanionReleaser, CompanionRef, ContributingMemberBitmap, DataItem,
    EnsembleOperation, GpuBufferItem, LevelType, StructuredGrid, Trajectories,
    TrajectoryNormals, TrajectorySelection, TrajectoryVertex, MISSING_VALUE,
};
pub use request::Request;
