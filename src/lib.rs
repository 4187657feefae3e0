//! supd - SMF-style service supervisor
//!
//! A dependency-graph driven restarter:
//! - Materializes services, instances, and dependency groups as a graph
//! - Computes tri-valued satisfiability under four group semantics
//! - Drives a per-instance lifecycle state machine over child processes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      supd                        │
//! ├──────────────────────────────────────────────────┤
//! │  Dependency Graph  │  Note Queue  │  Restarter   │
//! ├──────────────────────────────────────────────────┤
//! │   Repository   │  Process Tracker  │  Timer Set  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! The graph engine and the unit state machines never call each other
//! directly; everything flows through the note queue, drained on a single
//! event-loop task.

pub mod graph;
pub mod manager;
pub mod note;
pub mod path;
pub mod protocol;
pub mod repository;
pub mod restarter;

// Re-exports for the daemon and the test suites
pub use graph::{Graph, Satisfied, VertexKind, VtxState};
pub use manager::{Manager, ManagerError};
pub use note::{AdminOp, Note, NoteQueue, RestartOn, RestarterReq, StateEvent};
pub use path::SvcPath;
pub use repository::{MemRepository, Repository};
pub use restarter::{Restarter, UnitState};
