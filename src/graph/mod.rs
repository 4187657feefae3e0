//! Dependency graph engine
//!
//! Maintains the directed graph of services, instances, and dependency
//! groups. Vertices are created for each service, each instance, and each
//! declared dependency group; edges are generated like so:
//!
//! - Service -> Service's dep-groups
//! - Service -> Service's instances
//! - Instance -> Instance's dep-groups
//! - DepGroup -> the group's targets (services and instances)
//!
//! Service-level groups are inherited by instances transitively through
//! the parent service vertex. The graph never invokes unit methods; it
//! reacts to notes and emits further notes (see [`propagate`]).

mod propagate;
mod satisfy;
mod vertex;

pub use satisfy::Satisfied;
pub use vertex::{Vertex, VertexId, VertexKind, VtxState};

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::note::RestartOn;
use crate::path::SvcPath;
use crate::repository::{DepGroupDecl, GroupKind, RepoObject, Repository, ServiceDecl};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", .0.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" -> "))]
    Cycle(Vec<SvcPath>),

    #[error("dependency target does not exist: {0}")]
    MissingTarget(SvcPath),
}

/// The vertex arena plus a path index. A single graph instance is owned by
/// the manager and passed by handle into every entry point.
#[derive(Debug, Default)]
pub struct Graph {
    vertices: Vec<Vertex>,
    index: HashMap<SvcPath, VertexId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, path: &SvcPath) -> Option<VertexId> {
        self.index.get(path).copied()
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0]
    }

    pub(crate) fn vertex_mut(&mut self, id: VertexId) -> &mut Vertex {
        &mut self.vertices[id.0]
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = VertexId> {
        (0..self.vertices.len()).map(VertexId)
    }

    /// Find a vertex by path or create it with the given attributes.
    pub fn find_or_add(
        &mut self,
        path: SvcPath,
        kind: VertexKind,
        group_kind: GroupKind,
        restart_on: RestartOn,
    ) -> VertexId {
        if let Some(id) = self.find(&path) {
            return id;
        }
        let id = VertexId(self.vertices.len());
        self.index.insert(path.clone(), id);
        self.vertices
            .push(Vertex::new(path, kind, group_kind, restart_on));
        id
    }

    /// Add the symmetric edge pair `from -> to`. A repeated add is a no-op,
    /// which is what makes `install_service` idempotent.
    fn edge_add(&mut self, from: VertexId, to: VertexId) {
        if self.vertices[from.0].dependencies.contains(&to) {
            return;
        }
        self.vertices[from.0].dependencies.push(to);
        self.vertices[to.0].dependents.push(from);
    }

    /// Walk dependencies from `from` looking for `to`. Returns the path of
    /// vertices from `from` to `to` inclusive if one exists.
    ///
    /// Exclude-all groups do not carry reachability: an exclusion is not a
    /// "required to run" relation, so a cycle through one is permitted.
    pub fn reachable(&self, from: VertexId, to: VertexId) -> Option<Vec<SvcPath>> {
        let mut seen = HashSet::new();
        let mut trail = Vec::new();
        if self.reach_dfs(from, to, &mut seen, &mut trail) {
            Some(trail.iter().map(|id| self.vertex(*id).path.clone()).collect())
        } else {
            None
        }
    }

    fn reach_dfs(
        &self,
        at: VertexId,
        to: VertexId,
        seen: &mut HashSet<VertexId>,
        trail: &mut Vec<VertexId>,
    ) -> bool {
        if !seen.insert(at) {
            return false;
        }

        let v = self.vertex(at);
        if v.kind == VertexKind::DepGroup && v.group_kind == GroupKind::ExcludeAll {
            return false;
        }

        trail.push(at);
        if at == to {
            return true;
        }

        for dep in v.dependencies.iter() {
            if self.reach_dfs(*dep, to, seen, trail) {
                return true;
            }
        }

        trail.pop();
        false
    }

    /// Add a dependency edge `v -> to`, rejecting it if that would create
    /// a cycle. On rejection the computed reachability path is returned as
    /// evidence and no edge is committed.
    pub fn dependency_add(&mut self, v: VertexId, to: VertexId) -> Result<(), GraphError> {
        if let Some(trail) = self.reachable(to, v) {
            log::error!(
                "{}: cyclical dependency: {}",
                self.vertex(v).path,
                trail
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            return Err(GraphError::Cycle(trail));
        }
        self.edge_add(v, to);
        Ok(())
    }

    /// Materialize a service and its instances as vertices. Idempotent;
    /// dependency groups are materialized later by [`Graph::setup`].
    pub fn install_service(&mut self, decl: &ServiceDecl) -> VertexId {
        let sv = self.find_or_add(
            decl.path.clone(),
            VertexKind::Service,
            GroupKind::RequireAll,
            RestartOn::Any,
        );

        for inst in &decl.instances {
            let iv = self.find_or_add(
                inst.path.clone(),
                VertexKind::Instance,
                GroupKind::RequireAll,
                RestartOn::Any,
            );
            self.edge_add(sv, iv);
        }

        sv
    }

    /// Set up a vertex at most once: mark it enabled and materialize its
    /// declared dependency groups, recursing into targets. Configuration
    /// errors (cycles, missing targets) are collected into `errors`; the
    /// vertex stays set-up so the attempt is not repeated.
    pub fn setup(&mut self, id: VertexId, repo: &dyn Repository, errors: &mut Vec<GraphError>) {
        if self.vertex(id).is_setup {
            return;
        }
        self.vertex_mut(id).is_setup = true;
        self.vertex_mut(id).is_enabled = true;

        let path = self.vertex(id).path.clone();
        let depgroups: Vec<DepGroupDecl> = match self.vertex(id).kind {
            VertexKind::DepGroup => return,
            VertexKind::Instance => match repo.lookup_path(&path) {
                Ok(RepoObject::Instance(i)) => i.depgroups,
                Ok(_) => {
                    log::warn!("{}: repository returned a service for an instance path", path);
                    return;
                }
                Err(e) => {
                    log::error!("{}: lookup failed during setup: {}", path, e);
                    return;
                }
            },
            VertexKind::Service => match repo.lookup_path(&path) {
                Ok(RepoObject::Service(s)) => s.depgroups,
                Ok(_) => {
                    log::warn!("{}: repository returned an instance for a service path", path);
                    return;
                }
                Err(e) => {
                    log::error!("{}: lookup failed during setup: {}", path, e);
                    return;
                }
            },
        };

        for (cnt, dg) in depgroups.iter().enumerate() {
            let dgp = path.depgroup(cnt);
            if let Err(e) = self.setup_depgroup(id, dg, dgp, repo, errors) {
                log::error!("{}: {}", path, e);
                errors.push(e);
            }
        }
    }

    fn setup_depgroup(
        &mut self,
        v: VertexId,
        dg: &DepGroupDecl,
        dgp: SvcPath,
        repo: &dyn Repository,
        errors: &mut Vec<GraphError>,
    ) -> Result<(), GraphError> {
        let dgv = self.find_or_add(dgp, VertexKind::DepGroup, dg.kind, dg.restart_on);
        self.dependency_add(v, dgv)?;

        for target in &dg.targets {
            self.setup_dep(target, dgv, repo, errors)?;
        }

        Ok(())
    }

    fn setup_dep(
        &mut self,
        path: &SvcPath,
        dgv: VertexId,
        repo: &dyn Repository,
        errors: &mut Vec<GraphError>,
    ) -> Result<(), GraphError> {
        let vdep = self
            .find(path)
            .ok_or_else(|| GraphError::MissingTarget(path.clone()))?;

        self.dependency_add(dgv, vdep)?;
        self.setup(vdep, repo, errors);
        Ok(())
    }

    /// Set up every vertex, returning the configuration errors found.
    pub fn setup_all(&mut self, repo: &dyn Repository) -> Vec<GraphError> {
        let mut errors = Vec::new();
        for id in self.ids().collect::<Vec<_>>() {
            self.setup(id, repo, &mut errors);
        }
        errors
    }

    /// Never-started instances ready to come up. Used for the initial kick
    /// after setup; instances that already ran are left to propagation.
    pub fn startable_instances(&self) -> Vec<SvcPath> {
        self.ids()
            .filter(|id| {
                let v = self.vertex(*id);
                v.kind == VertexKind::Instance
                    && v.state == VtxState::Uninitialised
                    && self.can_come_up(*id)
            })
            .map(|id| self.vertex(id).path.clone())
            .collect()
    }

    /// Render the graph in DOT form for introspection tooling.
    pub fn render_dot(&self) -> String {
        let mut buf = String::from("digraph {\n");
        for id in self.ids() {
            let v = self.vertex(id);
            match v.kind {
                VertexKind::Service => {
                    let fill = if self.aggregate_satisfied(id, false) == Satisfied::Satisfied {
                        " [style=filled, fillcolor=green]"
                    } else {
                        ""
                    };
                    let _ = writeln!(buf, "\"{}\" [shape=cylinder]{}", v.path, fill);
                }
                VertexKind::Instance => {
                    let fill = if v.state == VtxState::Online {
                        " [style=filled, fillcolor=green]"
                    } else {
                        ""
                    };
                    let _ = writeln!(buf, "\"{}\" [shape=component]{}", v.path, fill);
                }
                VertexKind::DepGroup => {
                    let _ = writeln!(
                        buf,
                        "\"{}\" [shape=note, label=\"{}\\n{}\"]",
                        v.path,
                        v.path,
                        v.group_kind.as_str()
                    );
                }
            }
            for dep in &v.dependencies {
                let _ = writeln!(
                    buf,
                    "\"{}\" -> \"{}\" [label=\"depends on\"];",
                    v.path,
                    self.vertex(*dep).path
                );
            }
        }
        buf.push_str("}\n");
        buf
    }
}
