//! Orchestration state: document schema, atomic persistence, and
//! checkpoint-based recovery.

mod model;
mod recovery;
mod store;

pub use model::{
    MergeStatus, OrchestrationState, STATE_SCHEMA_VERSION, TaskStateRecord, now_timestamp,
    parse_phase_index,
};
pub use recovery::{DEFAULT_CHECKPOINTS_KEPT, RecoveryManager};
pub use store::StateStore;
