//! Intent propagation
//!
//! Translates admin requests and observed state changes into notes for
//! affected vertices. Handlers mutate graph state and append notes; they
//! never invoke unit methods directly, so processing one note cannot
//! re-enter the state machine mid-mutation.

use super::{Graph, VertexId, VertexKind, VtxState};
use crate::note::{AdminOp, NoteQueue, RestartOn, StateEvent};
use crate::path::SvcPath;
use crate::repository::GroupKind;

impl Graph {
    /// Handle an administrative request note.
    pub fn process_admin_req(
        &mut self,
        path: &SvcPath,
        op: AdminOp,
        _reason: RestartOn,
        out: &mut NoteQueue,
    ) {
        let Some(id) = self.find(path) else {
            log::warn!("{}: admin request for unknown vertex", path);
            return;
        };

        match op {
            AdminOp::Disable => {
                {
                    let v = self.vertex_mut(id);
                    v.to_disable = true;
                    v.to_offline = true;
                    v.is_enabled = false;
                }
                log::info!(
                    "{}: administrative disable; shutting down dependents first",
                    path
                );

                let dependents = self.vertex(id).dependents.clone();
                for d in dependents {
                    self.mark_admin_disable(d);
                }

                if self.can_go_down(id, true) {
                    log::info!("{}: no subnodes in the way; can go down directly", path);
                }

                for vid in self.ids().collect::<Vec<_>>() {
                    self.offline_if_possible(vid, RestartOn::Restart, out);
                }
            }

            AdminOp::Enable => {
                {
                    let v = self.vertex_mut(id);
                    v.to_disable = false;
                    v.to_offline = false;
                    v.is_enabled = true;
                }
                log::info!("{}: administrative enable", path);
                out.push_state_change(StateEvent::Offline, path.clone(), RestartOn::Restart);
            }

            AdminOp::Refresh => {
                log::warn!("{}: refresh request not handled", path);
            }
        }
    }

    /// Handle a state-change note. Returns true when the vertex actually
    /// transitioned; duplicate observations are absorbed without
    /// re-notifying dependents.
    pub fn process_state_change(
        &mut self,
        path: &SvcPath,
        event: StateEvent,
        reason: RestartOn,
        out: &mut NoteQueue,
    ) -> bool {
        let Some(id) = self.find(path) else {
            log::warn!("{}: state change for unknown vertex", path);
            return false;
        };

        let prior_offline_intent = self.vertex(id).to_offline;

        match event {
            StateEvent::Online => {
                if self.vertex(id).state == VtxState::Online {
                    log::debug!("{}: already online", path);
                    return false;
                }
                log::info!("{}: -> online", path);
                self.vertex_mut(id).state = VtxState::Online;

                let dependents = self.vertex(id).dependents.clone();
                for d in dependents {
                    self.notify_start(d, reason, out);
                }
                true
            }

            StateEvent::Offline => {
                // An offline with pending intent always drains the intent,
                // even if the vertex already reads offline.
                if self.vertex(id).state == VtxState::Offline && !prior_offline_intent {
                    log::debug!("{}: already offline", path);
                    return false;
                }
                // A unit reporting its arrival at offline after the graph
                // already disabled the vertex is stale, not a transition.
                if self.vertex(id).state == VtxState::Disabled
                    && !self.vertex(id).is_enabled
                    && !prior_offline_intent
                {
                    log::debug!("{}: offline report for a disabled vertex", path);
                    return false;
                }
                log::info!("{}: -> offline", path);
                {
                    let v = self.vertex_mut(id);
                    v.state = VtxState::Offline;
                    v.to_offline = false;
                }

                if prior_offline_intent {
                    let dependencies = self.vertex(id).dependencies.clone();
                    for dep in dependencies {
                        self.offline_dependency(dep, reason, out);
                    }
                    if self.vertex(id).to_disable {
                        out.push_state_change(StateEvent::Disabled, path.clone(), reason);
                    }
                } else if self.vertex(id).kind == VertexKind::Instance && self.can_come_up(id) {
                    // An unintended offline restarts as soon as the
                    // prerequisites hold.
                    out.push_state_change(StateEvent::Online, path.clone(), reason);
                }

                let dependents = self.vertex(id).dependents.clone();
                for d in dependents {
                    self.notify_stop(d, reason, out);
                }
                true
            }

            StateEvent::Disabled => {
                log::info!("{}: -> disabled", path);
                let transitioned = self.vertex(id).state != VtxState::Disabled;
                {
                    let v = self.vertex_mut(id);
                    v.to_offline = false;
                    v.to_disable = false;
                    v.state = VtxState::Disabled;
                }

                let dependents = self.vertex(id).dependents.clone();
                for d in dependents {
                    self.notify_misc(d, reason, out);
                }
                transitioned
            }

            StateEvent::Degraded => {
                if self.vertex(id).state == VtxState::Degraded {
                    return false;
                }
                log::warn!("{}: -> degraded", path);
                self.vertex_mut(id).state = VtxState::Degraded;
                true
            }

            StateEvent::Maintenance => {
                if self.vertex(id).state == VtxState::Maintenance {
                    return false;
                }
                log::warn!("{}: -> maintenance; administrative intervention required", path);
                self.vertex_mut(id).state = VtxState::Maintenance;

                // The vertex became unsatisfiable for its dependents.
                let dependents = self.vertex(id).dependents.clone();
                for d in dependents {
                    self.notify_stop(d, reason, out);
                }
                true
            }
        }
    }

    /// A dependency of `id` came up; bring up instances that can now run,
    /// walking through group and service vertices.
    fn notify_start(&self, id: VertexId, reason: RestartOn, out: &mut NoteQueue) {
        let v = self.vertex(id);
        match v.kind {
            VertexKind::Instance => {
                if !self.can_come_up(id) {
                    return;
                }
                if v.is_running() {
                    log::debug!("{}: not bringing up, already up", v.path);
                    if reason > RestartOn::Error {
                        log::debug!("{}: restart-worthy reason while up", v.path);
                    }
                } else {
                    log::info!("{}: bringing up because a dependency went up", v.path);
                    out.push_state_change(StateEvent::Online, v.path.clone(), RestartOn::None);
                }
            }
            VertexKind::DepGroup | VertexKind::Service => {
                for d in &v.dependents {
                    self.notify_start(*d, v.restart_on, out);
                }
            }
        }
    }

    /// A dependency of `id` went down; bring down running instances whose
    /// groups consider the reason restart-worthy.
    fn notify_stop(&self, id: VertexId, reason: RestartOn, out: &mut NoteQueue) {
        let v = self.vertex(id);
        match v.kind {
            VertexKind::Instance => {
                // This only reaches an instance when some group on the way
                // had restart-on at or above the reason.
                if !v.is_running() {
                    log::debug!("{}: not bringing down, already down", v.path);
                } else {
                    log::debug!("{}: bringing down in response to dependency down", v.path);
                    out.push_state_change(StateEvent::Offline, v.path.clone(), reason);
                }
            }
            VertexKind::DepGroup => {
                // Stops do not propagate through exclusions.
                if v.group_kind == GroupKind::ExcludeAll {
                    return;
                }
                // A group that only restarts on, say, error does not need
                // to hear about a plain restart.
                if v.restart_on < reason {
                    return;
                }
                for d in &v.dependents {
                    self.notify_stop(*d, reason, out);
                }
            }
            VertexKind::Service => {
                for d in &v.dependents {
                    self.notify_stop(*d, reason, out);
                }
            }
        }
    }

    /// Something changed that may let held-back instances come up.
    fn notify_misc(&self, id: VertexId, reason: RestartOn, out: &mut NoteQueue) {
        let v = self.vertex(id);
        if v.kind == VertexKind::Instance && self.can_come_up(id) && !v.is_running() {
            out.push_state_change(StateEvent::Online, v.path.clone(), reason);
        }
        for d in &v.dependents {
            self.notify_misc(*d, reason, out);
        }
    }

    /// Mark the dependent closure of a disabling vertex as pending-offline.
    /// Exclusion groups and groups with restart-on below restart do not
    /// carry the mark.
    fn mark_admin_disable(&mut self, id: VertexId) {
        match self.vertex(id).kind {
            VertexKind::Instance => {
                if !self.vertex(id).is_running() {
                    log::debug!("{}: not bringing down, already down", self.vertex(id).path);
                }
                self.vertex_mut(id).to_offline = true;
                let dependents = self.vertex(id).dependents.clone();
                for d in dependents {
                    self.mark_admin_disable(d);
                }
            }
            VertexKind::DepGroup => {
                let v = self.vertex(id);
                if v.group_kind == GroupKind::ExcludeAll
                    || matches!(v.restart_on, RestartOn::None | RestartOn::Error)
                {
                    return;
                }
                let dependents = v.dependents.clone();
                for d in dependents {
                    self.mark_admin_disable(d);
                }
            }
            VertexKind::Service => {
                let dependents = self.vertex(id).dependents.clone();
                for d in dependents {
                    self.mark_admin_disable(d);
                }
            }
        }
    }

    /// Whether every dependent of `id` is accounted for, so the vertex can
    /// be taken offline. A running instance reached transitively objects
    /// unless it is itself marked pending-offline; the root is exempt
    /// because it is the one being asked.
    pub fn can_go_down(&self, id: VertexId, root: bool) -> bool {
        let v = self.vertex(id);
        for d in &v.dependents {
            let dv = self.vertex(*d);
            if dv.kind == VertexKind::Instance && !dv.to_offline {
                continue;
            }
            if !self.can_go_down(*d, false) {
                return false;
            }
        }
        if v.kind == VertexKind::Instance && v.is_running() && !root {
            return false;
        }
        true
    }

    /// Emit an offline for a pending-offline instance whose dependents
    /// have cleared out.
    fn offline_if_possible(&self, id: VertexId, reason: RestartOn, out: &mut NoteQueue) {
        let v = self.vertex(id);
        if !v.to_offline {
            return;
        }
        if v.kind == VertexKind::Instance && self.can_go_down(id, true) {
            out.push_state_change(StateEvent::Offline, v.path.clone(), reason);
        }
    }

    /// After an instance goes offline, offline its dependencies that are
    /// themselves due to go.
    fn offline_dependency(&self, id: VertexId, reason: RestartOn, out: &mut NoteQueue) {
        let v = self.vertex(id);
        if v.kind == VertexKind::Instance {
            if !v.to_offline {
                return;
            }
            if self.can_go_down(id, true) {
                out.push_state_change(StateEvent::Offline, v.path.clone(), reason);
            }
        } else {
            for dep in &v.dependencies {
                self.offline_dependency(*dep, reason, out);
            }
        }
    }
}
