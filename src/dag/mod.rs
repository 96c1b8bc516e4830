//! DAG engine: dependency graphs, topological phases, session assignment,
//! and the serialized dag.yaml document.
//!
//! Phases are topological generations: phase 0 holds every task with no
//! dependencies, phase k every task whose dependencies all live in phases
//! `< k`. Tasks within a phase can run concurrently; the coordinator
//! executes phases in order.

mod document;
mod engine;

pub use document::{DAG_SCHEMA_VERSION, DagDocument, DagNode, DagPhase};
pub use engine::DagEngine;
