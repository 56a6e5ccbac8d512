//! Resumability: checkpoint detection over a presence store.

mod manager;
mod store;

pub use manager::{Checkpoint, CheckpointStatus, ResumabilityManager};
pub use store::{FilesystemStore, InMemoryStore, PresenceStore};
