//! Per-actor composite-request sequencing for trajectory rendering
//! (spec.md §4.7 "Trajectory orchestrator (the hardest part)") plus
//! persisted actor configuration (spec.md §6, SPEC_FULL.md §4.10).

pub mod composite;
pub mod config;
pub mod orchestrator;

pub use composite::{CompositeRequest, SubRequestRole};
pub use config::{ActorConfig, SeedActorConfig};
pub use orchestrator::{DrainedComposite, HeldState, TrajectoryOrchestrator};
