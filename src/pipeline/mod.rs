//! Resolution pipeline: suppression, burst linking, matching and identity
//! bookkeeping, sequenced by the orchestrator.

mod burst;
mod identity;
mod matcher;
mod orchestrator;
mod suppressor;

pub use burst::{BurstDecision, BurstLinker};
pub use identity::{IdentityStore, LocationLocks, PartitionLocks, Resolution, rebuild_index};
pub use matcher::{MatchDecision, Matcher, select_match};
pub use orchestrator::{Orchestrator, Outcome, RunSummary, Step, Task};
pub use suppressor::Suppressor;
