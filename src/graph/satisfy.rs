//! Satisfiability evaluation
//!
//! Three-valued: a vertex's prerequisites currently hold, may yet hold, or
//! cannot currently be made to hold. The `recurse` flag controls whether
//! an offline instance's own prerequisites are examined transitively or
//! the instance is simply counted unsatisfied.

use super::{Graph, VertexId, VertexKind, VtxState};
use crate::repository::GroupKind;

/// Cycle prevention should already make unbounded recursion impossible;
/// the explicit bound exists to keep a misconfigured graph debuggable.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfied {
    Satisfied,
    Unsatisfied,
    Unsatisfiable,
}

impl Graph {
    /// Whether an instance is ready to transition offline -> online.
    /// Maintenance holds until administrative intervention, so a vertex in
    /// maintenance never comes up on its own.
    pub fn can_come_up(&self, id: VertexId) -> bool {
        let v = self.vertex(id);
        v.is_enabled
            && !v.to_offline
            && !v.to_disable
            && v.state != VtxState::Maintenance
            && self.aggregate_satisfied(id, true) == Satisfied::Satisfied
    }

    /// Satisfiability of a vertex as a required dependency.
    pub fn vtx_satisfies(&self, id: VertexId, recurse: bool) -> Satisfied {
        self.satisfies_at(id, recurse, 0)
    }

    /// Fold a vertex's direct dependencies under its group semantics.
    /// Instances and services carry require-all semantics here.
    pub fn aggregate_satisfied(&self, id: VertexId, recurse: bool) -> Satisfied {
        self.aggregate_at(id, recurse, 0)
    }

    fn satisfies_at(&self, id: VertexId, recurse: bool, depth: usize) -> Satisfied {
        if self.vertex(id).kind == VertexKind::Instance {
            self.inst_satisfies(id, recurse, depth)
        } else {
            self.aggregate_at(id, recurse, depth)
        }
    }

    fn inst_satisfies(&self, id: VertexId, recurse: bool, depth: usize) -> Satisfied {
        let v = self.vertex(id);
        debug_assert_eq!(v.kind, VertexKind::Instance);

        // Not set up by now means an invalid instance; administrative
        // intervention is required to correct it.
        if !v.is_setup || !v.is_enabled {
            return Satisfied::Unsatisfiable;
        }

        match v.state {
            VtxState::Uninitialised => Satisfied::Unsatisfied,
            VtxState::Disabled | VtxState::Maintenance => Satisfied::Unsatisfiable,
            VtxState::Offline => {
                if !recurse {
                    Satisfied::Unsatisfied
                } else if self.aggregate_at(id, recurse, depth + 1) == Satisfied::Unsatisfiable {
                    Satisfied::Unsatisfiable
                } else {
                    Satisfied::Unsatisfied
                }
            }
            VtxState::Online | VtxState::Degraded => Satisfied::Satisfied,
        }
    }

    fn inst_satisfies_optional(&self, id: VertexId, recurse: bool, depth: usize) -> Satisfied {
        let v = self.vertex(id);
        debug_assert_eq!(v.kind, VertexKind::Instance);

        if !v.is_setup {
            return Satisfied::Satisfied;
        }

        match v.state {
            VtxState::Uninitialised => Satisfied::Unsatisfied,
            VtxState::Offline => {
                if !recurse {
                    Satisfied::Unsatisfied
                } else if self.aggregate_at(id, recurse, depth + 1) == Satisfied::Unsatisfiable {
                    // Optionals tolerate definitive failure.
                    Satisfied::Satisfied
                } else {
                    Satisfied::Unsatisfied
                }
            }
            VtxState::Disabled
            | VtxState::Maintenance
            | VtxState::Online
            | VtxState::Degraded => Satisfied::Satisfied,
        }
    }

    fn inst_satisfies_exclusion(&self, id: VertexId) -> Satisfied {
        let v = self.vertex(id);
        debug_assert_eq!(v.kind, VertexKind::Instance);

        if !v.is_setup {
            return Satisfied::Satisfied;
        }

        match v.state {
            // May be awaiting disabling.
            VtxState::Uninitialised | VtxState::Offline => Satisfied::Unsatisfied,
            VtxState::Maintenance | VtxState::Disabled => Satisfied::Satisfied,
            VtxState::Online | VtxState::Degraded => {
                if v.is_enabled {
                    Satisfied::Unsatisfiable
                } else {
                    // Up but awaiting shutdown.
                    Satisfied::Unsatisfied
                }
            }
        }
    }

    fn aggregate_at(&self, id: VertexId, recurse: bool, depth: usize) -> Satisfied {
        if depth > MAX_DEPTH {
            log::error!(
                "{}: satisfiability recursion exceeded depth {}",
                self.vertex(id).path,
                MAX_DEPTH
            );
            return Satisfied::Unsatisfied;
        }

        let v = self.vertex(id);
        match v.group_kind {
            GroupKind::RequireAll => {
                let mut sat = Satisfied::Satisfied;
                for dep in &v.dependencies {
                    let esat = self.satisfies_at(*dep, recurse, depth + 1);
                    if esat != Satisfied::Satisfied {
                        sat = if sat == Satisfied::Unsatisfiable {
                            Satisfied::Unsatisfiable
                        } else {
                            esat
                        };
                    }
                }
                sat
            }

            GroupKind::RequireAny => {
                if v.dependencies.is_empty() {
                    return Satisfied::Satisfied;
                }
                let mut sat = Satisfied::Unsatisfiable;
                for dep in &v.dependencies {
                    match self.satisfies_at(*dep, recurse, depth + 1) {
                        Satisfied::Satisfied => return Satisfied::Satisfied,
                        Satisfied::Unsatisfied => sat = Satisfied::Unsatisfied,
                        Satisfied::Unsatisfiable => {}
                    }
                }
                sat
            }

            GroupKind::OptionalAll => {
                let mut sat = Satisfied::Satisfied;
                for dep in &v.dependencies {
                    let dv = self.vertex(*dep);
                    debug_assert_ne!(dv.kind, VertexKind::DepGroup);
                    match dv.kind {
                        VertexKind::Instance => {
                            let esat = self.inst_satisfies_optional(*dep, recurse, depth + 1);
                            sat = fold_all(sat, esat);
                        }
                        VertexKind::Service => {
                            // A service target stands for its instances.
                            for inner in &dv.dependencies {
                                if self.vertex(*inner).kind != VertexKind::Instance {
                                    continue;
                                }
                                let esat =
                                    self.inst_satisfies_optional(*inner, recurse, depth + 1);
                                sat = fold_all(sat, esat);
                            }
                        }
                        VertexKind::DepGroup => {}
                    }
                }
                log::debug!(
                    "{}: optional-all: {}",
                    v.path,
                    if sat == Satisfied::Satisfied {
                        "satisfied"
                    } else {
                        "not satisfied"
                    }
                );
                sat
            }

            GroupKind::ExcludeAll => {
                let mut sat = Satisfied::Satisfied;
                for dep in &v.dependencies {
                    let dv = self.vertex(*dep);
                    debug_assert_ne!(dv.kind, VertexKind::DepGroup);
                    match dv.kind {
                        VertexKind::Instance => {
                            sat = fold_all(sat, self.inst_satisfies_exclusion(*dep));
                        }
                        VertexKind::Service => {
                            for inner in &dv.dependencies {
                                if self.vertex(*inner).kind != VertexKind::Instance {
                                    continue;
                                }
                                sat = fold_all(sat, self.inst_satisfies_exclusion(*inner));
                            }
                        }
                        VertexKind::DepGroup => {}
                    }
                }
                sat
            }
        }
    }
}

/// Require-all style fold step: unsatisfiable is sticky, any non-satisfied
/// result demotes the aggregate.
fn fold_all(sat: Satisfied, esat: Satisfied) -> Satisfied {
    if esat == Satisfied::Satisfied {
        sat
    } else if sat == Satisfied::Unsatisfiable {
        Satisfied::Unsatisfiable
    } else {
        esat
    }
}
