//! The master restarter: one unit state machine per known instance
//!
//! Routes restarter-request notes, process events, timer expiry, and
//! readiness notifications to the owning unit. Units are created when
//! their instance is first observed and live until manager shutdown.

mod notify;
mod process;
mod timer;
mod unit;

pub use notify::{ReadinessListener, ReadinessMessage, NOTIFY_SOCKET_PATH};
pub use process::{
    FakeProcessTracker, OsProcessTracker, ProcessEvent, ProcessEventKind, ProcessTracker,
    SpawnError, StopSignal,
};
pub use timer::{TimerData, TimerEntry, TimerId, TimerSet};
pub use unit::{Unit, UnitCtx, UnitState};

use std::collections::HashMap;

use crate::note::{NoteQueue, RestarterReq};
use crate::path::SvcPath;
use crate::repository::InstanceDecl;

pub struct Restarter {
    units: HashMap<SvcPath, Unit>,
    pub timers: TimerSet,
    tracker: Box<dyn ProcessTracker>,
}

impl Restarter {
    pub fn new(tracker: Box<dyn ProcessTracker>) -> Self {
        Self {
            units: HashMap::new(),
            timers: TimerSet::new(),
            tracker,
        }
    }

    /// Create the unit for an instance if it does not exist yet.
    pub fn ensure_unit(&mut self, decl: &InstanceDecl) {
        self.units
            .entry(decl.path.clone())
            .or_insert_with(|| Unit::new(decl));
    }

    pub fn unit(&self, path: &SvcPath) -> Option<&Unit> {
        self.units.get(path)
    }

    /// Clear a unit out of maintenance on administrative enable.
    pub fn admin_clear(&mut self, path: &SvcPath) {
        if let Some(unit) = self.units.get_mut(path) {
            unit.admin_clear();
        }
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// The unit owning a tracked PID, if any.
    pub fn find_unit_for_pid(&self, pid: u32) -> Option<&SvcPath> {
        self.units
            .values()
            .find(|u| u.has_pid(pid))
            .map(|u| &u.path)
    }

    fn with_unit<R>(
        &mut self,
        path: &SvcPath,
        notes: &mut NoteQueue,
        f: impl FnOnce(&mut Unit, &mut UnitCtx) -> R,
    ) -> Option<R> {
        let unit = self.units.get_mut(path)?;
        let mut ctx = UnitCtx {
            tracker: self.tracker.as_mut(),
            timers: &mut self.timers,
            notes,
        };
        Some(f(unit, &mut ctx))
    }

    /// Handle a restarter-request note from the graph.
    pub fn handle_rreq(&mut self, path: &SvcPath, req: RestarterReq, notes: &mut NoteQueue) {
        let Some(state) = self.units.get(path).map(|u| u.state) else {
            log::warn!("{}: request for unknown unit", path);
            return;
        };

        match req {
            RestarterReq::Start => match state {
                UnitState::Uninitialised | UnitState::Offline => {
                    log::info!("{}: received request to bring up", path);
                    self.with_unit(path, notes, |u, ctx| u.enter_prestart(ctx));
                }
                UnitState::Maintenance => {
                    log::warn!(
                        "{}: not starting, unit is in maintenance and needs administrative attention",
                        path
                    );
                }
                _ => {
                    log::debug!("{}: start request while in state {:?}", path, state);
                }
            },

            RestarterReq::Stop => match state {
                UnitState::PreStart | UnitState::Start | UnitState::PostStart | UnitState::Online => {
                    log::info!("{}: received request to bring down", path);
                    self.with_unit(path, notes, |u, ctx| {
                        u.target = UnitState::Offline;
                        u.enter_stop(ctx);
                    });
                }
                _ => {
                    log::debug!("{}: stop request while in state {:?}", path, state);
                }
            },
        }
    }

    /// Route a process event to the unit owning its PID.
    pub fn handle_process_event(&mut self, ev: ProcessEvent, notes: &mut NoteQueue) {
        let Some(path) = self.find_unit_for_pid(ev.pid).cloned() else {
            log::debug!("process event for untracked PID {}", ev.pid);
            return;
        };
        self.with_unit(&path, notes, |u, ctx| u.handle_process_event(ctx, ev));
    }

    /// Route a fired timer back to its unit.
    pub fn handle_timer(&mut self, entry: &TimerEntry, notes: &mut NoteQueue) {
        match &entry.data {
            TimerData::UnitTimeout(path) => {
                let path = path.clone();
                if self.with_unit(&path, notes, |u, ctx| u.handle_timeout(ctx)).is_none() {
                    log::warn!("{}: timer fired for unknown unit", path);
                }
            }
            TimerData::RestartBegin(path) => {
                let path = path.clone();
                self.with_unit(&path, notes, |u, ctx| u.handle_restart_timeout(ctx));
            }
            TimerData::RepoRetry => {
                // Owned by the manager; nothing to do here.
            }
        }
    }

    /// Route a readiness message to the unit owning the sending PID.
    pub fn handle_readiness(&mut self, msg: &ReadinessMessage, notes: &mut NoteQueue) {
        let pid = msg.main_pid().unwrap_or(msg.pid);
        let Some(path) = self.find_unit_for_pid(pid).cloned() else {
            log::debug!("readiness message from unowned PID {}", pid);
            return;
        };

        if let Some(status) = msg.status() {
            if let Some(unit) = self.units.get(&path) {
                unit.notify_status(status);
            }
        }
        if msg.is_ready() {
            self.with_unit(&path, notes, |u, ctx| u.notify_ready(ctx));
        }
    }
}
