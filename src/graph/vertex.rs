//! Vertex and edge storage
//!
//! Vertices live in an arena owned by the graph and are addressed by
//! stable indices; edges store endpoint indices, so the dual edge lists
//! carry no ownership of their own.

use crate::note::RestartOn;
use crate::path::SvcPath;
use crate::repository::GroupKind;

/// Stable handle into the graph's vertex arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    /// Root of a service; depends on its instances and its own dep-groups.
    Service,
    /// Runnable leaf.
    Instance,
    /// Synthesized intermediate node for one declared dependency group.
    DepGroup,
}

/// Graph-side state of a vertex. Mirrors what the restarter reports for
/// instances; services and dep-groups never leave `Uninitialised`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtxState {
    Uninitialised,
    Disabled,
    Offline,
    Online,
    Degraded,
    Maintenance,
}

#[derive(Debug)]
pub struct Vertex {
    pub path: SvcPath,
    pub kind: VertexKind,
    /// Group semantics; only meaningful for dep-group vertices. Services
    /// and instances default to require-all, which is what the aggregate
    /// fold over their direct dependencies uses.
    pub group_kind: GroupKind,
    /// Restart intensity; only meaningful for dep-group vertices.
    pub restart_on: RestartOn,
    pub state: VtxState,
    pub is_setup: bool,
    pub is_enabled: bool,
    pub to_offline: bool,
    pub to_disable: bool,
    /// Edges to vertices this one depends on, insertion-ordered.
    pub dependencies: Vec<VertexId>,
    /// Reverse index: vertices depending on this one.
    pub dependents: Vec<VertexId>,
}

impl Vertex {
    pub fn new(path: SvcPath, kind: VertexKind, group_kind: GroupKind, restart_on: RestartOn) -> Self {
        Self {
            path,
            kind,
            group_kind,
            restart_on,
            state: VtxState::Uninitialised,
            is_setup: false,
            is_enabled: false,
            to_offline: false,
            to_disable: false,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }

    /// Online or degraded: the instance is up.
    pub fn is_running(&self) -> bool {
        matches!(self.state, VtxState::Online | VtxState::Degraded)
    }
}
