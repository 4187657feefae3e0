//! Per-instance unit state machine
//!
//! A unit is the restarter's representation of a service instance. It is
//! driven by three inputs: child-process lifecycle events, timer expiry,
//! and readiness notifications. Stable arrivals (online, offline,
//! maintenance) are reported back to the graph as state-change notes.
//!
//! Failing to get a PID out of a fork is treated as an exceptional case
//! and heads straight for maintenance.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::note::{NoteQueue, RestartOn, StateEvent};
use crate::path::SvcPath;
use crate::repository::{InstanceDecl, MethodKind, UnitType};
use crate::restarter::process::{ProcessEvent, ProcessEventKind, ProcessTracker, StopSignal};
use crate::restarter::timer::{TimerData, TimerId, TimerSet};

/// Method/state timeout.
const UNIT_TIMEOUT: Duration = Duration::from_millis(2000);
/// Delay before re-entering prestart after a method failure.
const RETRY_DELAY: Duration = Duration::from_millis(5000);
/// A method slot failing more often than this puts the unit in
/// maintenance.
const MAX_METHOD_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Uninitialised,
    Offline,
    PreStart,
    Start,
    PostStart,
    Online,
    Stop,
    StopTerm,
    StopKill,
    Maintenance,
    /// Sentinel target: after a purge, park with no next state (a restart
    /// timer re-enters prestart).
    None,
}

/// Everything a unit needs to act on the world: the process tracker, the
/// timer set, and the note queue for reporting observed transitions.
pub struct UnitCtx<'a> {
    pub tracker: &'a mut dyn ProcessTracker,
    pub timers: &'a mut TimerSet,
    pub notes: &'a mut NoteQueue,
}

#[derive(Debug)]
pub struct Unit {
    pub path: SvcPath,
    pub unit_type: UnitType,
    methods: HashMap<MethodKind, String>,
    pub state: UnitState,
    pub target: UnitState,
    pub main_pid: Option<u32>,
    pub secondary_pid: Option<u32>,
    /// Every PID tracked for this unit. Each PID belongs to exactly one
    /// unit.
    pub pids: BTreeSet<u32>,
    pub timer_id: Option<TimerId>,
    pub restart_timer_id: Option<TimerId>,
    fail_cnt: [u32; 5],
}

impl Unit {
    pub fn new(decl: &InstanceDecl) -> Self {
        Self {
            path: decl.path.clone(),
            unit_type: decl.unit_type,
            methods: decl.methods.clone(),
            state: UnitState::Uninitialised,
            target: UnitState::None,
            main_pid: None,
            secondary_pid: None,
            pids: BTreeSet::new(),
            timer_id: None,
            restart_timer_id: None,
            fail_cnt: [0; 5],
        }
    }

    pub fn stopping(&self) -> bool {
        matches!(
            self.state,
            UnitState::Stop | UnitState::StopTerm | UnitState::StopKill
        )
    }

    pub fn has_pid(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub fn fail_count(&self, m: MethodKind) -> u32 {
        self.fail_cnt[m.index()]
    }

    /// The method slot charged for a failure observed in `state`.
    fn state_method(state: UnitState) -> Option<MethodKind> {
        match state {
            UnitState::PreStart => Some(MethodKind::PreStart),
            UnitState::Start => Some(MethodKind::Start),
            UnitState::PostStart => Some(MethodKind::PostStart),
            UnitState::Stop => Some(MethodKind::Stop),
            _ => None,
        }
    }

    fn arm_timer(&mut self, ctx: &mut UnitCtx) {
        if let Some(old) = self.timer_id.take() {
            ctx.timers.del(old);
        }
        self.timer_id = Some(
            ctx.timers
                .add(UNIT_TIMEOUT, TimerData::UnitTimeout(self.path.clone())),
        );
    }

    fn disarm_timer(&mut self, ctx: &mut UnitCtx) {
        if let Some(id) = self.timer_id.take() {
            ctx.timers.del(id);
        }
    }

    /// Fork a method command and track it. The tracker watches the PID
    /// from birth. Returns the PID, or nothing on fork failure.
    fn fork_and_register(&mut self, ctx: &mut UnitCtx, cmd: &str) -> Option<u32> {
        match ctx.tracker.fork_method(&self.path, cmd) {
            Ok(pid) => {
                self.pids.insert(pid);
                Some(pid)
            }
            Err(e) => {
                log::error!("{}: failed to fork for command {}: {}", self.path, cmd, e);
                None
            }
        }
    }

    fn deregister_pid(&mut self, ctx: &mut UnitCtx, pid: u32) {
        ctx.tracker.disregard(pid);
        self.pids.remove(&pid);
    }

    /// Purge any remaining PIDs, then enter the target state. Does not
    /// run the stop method's graceful path beyond what entering stop does.
    fn purge_and_target(&mut self, ctx: &mut UnitCtx) {
        if !self.pids.is_empty() {
            log::debug!(
                "{}: clearing {} leftover PID(s) before entering {:?}",
                self.path,
                self.pids.len(),
                self.target
            );
            self.enter_stop(ctx);
        } else {
            self.disarm_timer(ctx);
            let target = self.target;
            self.enter_state(ctx, target);
        }
    }

    /// As purge-and-target, but re-enters prestart after a delay.
    fn retry_start(&mut self, ctx: &mut UnitCtx, delay: Duration) {
        log::debug!("{}: scheduling start retry in {:?}", self.path, delay);
        self.target = UnitState::None;
        self.purge_and_target(ctx);
        if let Some(old) = self.restart_timer_id.take() {
            ctx.timers.del(old);
        }
        self.restart_timer_id = Some(
            ctx.timers
                .add(delay, TimerData::RestartBegin(self.path.clone())),
        );
    }

    fn method_failed(&mut self, ctx: &mut UnitCtx, slot: MethodKind, retry_target: UnitState) {
        self.fail_cnt[slot.index()] += 1;
        if self.fail_cnt[slot.index()] > MAX_METHOD_FAILURES {
            log::error!(
                "{}: transitioning to maintenance: {} method failed more than {} times",
                self.path,
                slot.as_str(),
                MAX_METHOD_FAILURES
            );
            self.target = UnitState::Maintenance;
            self.purge_and_target(ctx);
        } else {
            self.target = retry_target;
            self.retry_start(ctx, RETRY_DELAY);
        }
    }

    pub fn enter_state(&mut self, ctx: &mut UnitCtx, state: UnitState) {
        match state {
            UnitState::Offline => self.enter_offline(ctx),
            UnitState::Maintenance => self.enter_maintenance(ctx),
            UnitState::PreStart => self.enter_prestart(ctx),
            UnitState::Start => self.enter_start(ctx),
            UnitState::PostStart => self.enter_poststart(ctx),
            UnitState::Online => self.enter_online(ctx),
            UnitState::Stop => self.enter_stop(ctx),
            UnitState::StopTerm => self.enter_stopterm(ctx),
            UnitState::StopKill => self.enter_stopkill(ctx),
            UnitState::None => self.state = UnitState::None,
            UnitState::Uninitialised => self.state = UnitState::Uninitialised,
        }
    }

    pub fn enter_prestart(&mut self, ctx: &mut UnitCtx) {
        if let Some(cmd) = self.methods.get(&MethodKind::PreStart).cloned() {
            log::info!("{}: unit arrived at state PreStart", self.path);
            self.state = UnitState::PreStart;
            self.arm_timer(ctx);
            self.main_pid = self.fork_and_register(ctx, &cmd);
            if self.main_pid.is_none() {
                self.target = UnitState::Maintenance;
                self.purge_and_target(ctx);
            }
        } else {
            self.enter_start(ctx);
        }
    }

    fn enter_start(&mut self, ctx: &mut UnitCtx) {
        log::info!("{}: unit arrived at state Start", self.path);
        self.state = UnitState::Start;

        let Some(cmd) = self.methods.get(&MethodKind::Start).cloned() else {
            log::error!("{}: no start method declared", self.path);
            self.target = UnitState::Maintenance;
            self.purge_and_target(ctx);
            return;
        };

        self.main_pid = self.fork_and_register(ctx, &cmd);
        if self.main_pid.is_none() {
            self.target = UnitState::Maintenance;
            self.purge_and_target(ctx);
            return;
        }

        if matches!(
            self.unit_type,
            UnitType::Simple | UnitType::Oneshot | UnitType::Group
        ) {
            // In these kinds of service the unit counts as up as soon as
            // the start process is running.
            self.enter_poststart(ctx);
        } else {
            // Await the fork/readiness within the timer.
            self.arm_timer(ctx);
        }
    }

    fn enter_poststart(&mut self, ctx: &mut UnitCtx) {
        if let Some(cmd) = self.methods.get(&MethodKind::PostStart).cloned() {
            log::info!("{}: unit arrived at state PostStart", self.path);
            self.state = UnitState::PostStart;
            self.arm_timer(ctx);
            self.secondary_pid = self.fork_and_register(ctx, &cmd);
            if self.secondary_pid.is_none() {
                self.target = UnitState::Maintenance;
                self.purge_and_target(ctx);
            }
        } else {
            self.enter_online(ctx);
        }
    }

    fn enter_online(&mut self, ctx: &mut UnitCtx) {
        log::info!("{}: unit arrived at state Online", self.path);
        self.state = UnitState::Online;
        ctx.notes
            .push_state_change(StateEvent::Online, self.path.clone(), RestartOn::None);
    }

    fn enter_offline(&mut self, ctx: &mut UnitCtx) {
        log::info!("{}: unit arrived at state Offline", self.path);
        self.state = UnitState::Offline;
        ctx.notes
            .push_state_change(StateEvent::Offline, self.path.clone(), RestartOn::Error);
    }

    fn enter_maintenance(&mut self, ctx: &mut UnitCtx) {
        log::warn!("{}: unit arrived at state Maintenance", self.path);
        self.state = UnitState::Maintenance;
        // Maintenance holds until an administrator intervenes; a pending
        // retry must not resurrect the unit.
        if let Some(id) = self.restart_timer_id.take() {
            ctx.timers.del(id);
        }
        ctx.notes
            .push_state_change(StateEvent::Maintenance, self.path.clone(), RestartOn::Error);
    }

    pub fn enter_stop(&mut self, ctx: &mut UnitCtx) {
        if let Some(cmd) = self.methods.get(&MethodKind::Stop).cloned() {
            log::info!("{}: unit arrived at state Stop", self.path);
            self.state = UnitState::Stop;
            self.arm_timer(ctx);
            self.secondary_pid = self.fork_and_register(ctx, &cmd);
            if self.secondary_pid.is_none() {
                // No stop method process emerged; fall back to signalling
                // with maintenance as the landing state.
                self.target = UnitState::Maintenance;
                self.enter_stopterm(ctx);
            }
        } else {
            self.enter_stopterm(ctx);
        }
    }

    fn enter_stopterm(&mut self, ctx: &mut UnitCtx) {
        if self.pids.is_empty() {
            self.disarm_timer(ctx);
            let target = self.target;
            self.enter_state(ctx, target);
            return;
        }

        log::info!("{}: unit arrived at state StopTerm", self.path);
        self.state = UnitState::StopTerm;
        if let Some(main) = self.main_pid {
            ctx.tracker.signal(main, StopSignal::Term);
        }
        self.arm_timer(ctx);
        for pid in self.pids.clone() {
            ctx.tracker.signal(pid, StopSignal::Term);
        }
    }

    fn enter_stopkill(&mut self, ctx: &mut UnitCtx) {
        if self.pids.is_empty() {
            self.disarm_timer(ctx);
            let target = self.target;
            self.enter_state(ctx, target);
            return;
        }

        log::info!("{}: unit arrived at state StopKill", self.path);
        self.state = UnitState::StopKill;
        if let Some(main) = self.main_pid {
            ctx.tracker.signal(main, StopSignal::Kill);
        }
        // We should never time out in this state; if we do, something bad
        // has happened.
        self.arm_timer(ctx);
        for pid in self.pids.clone() {
            ctx.tracker.signal(pid, StopSignal::Kill);
        }
    }

    /// Child-process lifecycle event for a PID belonging to this unit.
    pub fn handle_process_event(&mut self, ctx: &mut UnitCtx, ev: ProcessEvent) {
        match ev.kind {
            ProcessEventKind::Child => {
                if self.has_pid(ev.pid) {
                    log::warn!(
                        "{}: tracker notified birth of PID {} but it is already tracked",
                        self.path,
                        ev.pid
                    );
                } else {
                    ctx.tracker.watch(ev.pid);
                    self.pids.insert(ev.pid);
                }
                return;
            }
            ProcessEventKind::Exit => {
                log::debug!("{}: deregistering PID {}", self.path, ev.pid);
                self.deregister_pid(ctx, ev.pid);
            }
        }

        // Stop-related transitions come first: while stopping, any exit
        // may be the one that empties the set.
        if self.stopping() {
            match self.state {
                UnitState::Stop => {
                    if self.pids.is_empty() {
                        self.disarm_timer(ctx);
                        self.enter_stopterm(ctx);
                    }
                }
                UnitState::StopTerm => {
                    if self.pids.is_empty() {
                        self.disarm_timer(ctx);
                        self.enter_stopkill(ctx);
                    }
                }
                _ => {}
            }
        } else if self.main_pid == Some(ev.pid) {
            self.main_pid = None;
            self.disarm_timer(ctx);
            log::debug!("{}: main PID exited", self.path);

            if ev.abnormal {
                log::warn!("{}: abnormal exit in main PID", self.path);
                if self.state == UnitState::Online {
                    // Let the graph engine decide what happens next.
                    self.target = UnitState::Offline;
                    self.purge_and_target(ctx);
                } else {
                    let state = self.state;
                    match Self::state_method(state) {
                        Some(slot) => self.method_failed(ctx, slot, state),
                        None => log::error!(
                            "{}: abnormal main exit in unexpected state {:?}",
                            self.path,
                            state
                        ),
                    }
                }
            } else {
                match self.state {
                    UnitState::PreStart => {
                        // Prestart is done; clean up remnants and start.
                        self.target = UnitState::Start;
                        self.purge_and_target(ctx);
                    }
                    UnitState::Online | UnitState::PostStart => {
                        if self.unit_type == UnitType::Simple {
                            log::debug!("{}: main PID gone from a simple unit", self.path);
                            self.target = UnitState::Offline;
                            self.enter_stop(ctx);
                        } else if self.unit_type != UnitType::Group && self.pids.is_empty() {
                            self.target = UnitState::Offline;
                            self.enter_stop(ctx);
                        }
                    }
                    _ => {}
                }
            }
        } else if self.secondary_pid == Some(ev.pid) {
            if self.state == UnitState::PostStart {
                self.disarm_timer(ctx);
                self.secondary_pid = None;

                if ev.abnormal {
                    log::warn!("{}: abnormal exit in secondary PID", self.path);
                    self.method_failed(ctx, MethodKind::PostStart, UnitState::PreStart);
                } else {
                    self.enter_online(ctx);
                }
            }
        }
    }

    /// The unit's state timer expired.
    pub fn handle_timeout(&mut self, ctx: &mut UnitCtx) {
        self.timer_id = None;
        log::debug!("{}: timer expired in state {:?}", self.path, self.state);

        match self.state {
            UnitState::Stop => {
                log::warn!("{}: stop method timed out", self.path);
                self.enter_stopterm(ctx);
            }
            UnitState::StopTerm => {
                // Deliberate hold: do not escalate to SIGKILL on a term
                // timeout, just record it.
                log::warn!("{}: timeout waiting for SIGTERM to clear processes", self.path);
            }
            UnitState::StopKill => {
                log::error!(
                    "{}: processes survived SIGKILL; entering {:?} regardless",
                    self.path,
                    self.target
                );
                let target = self.target;
                self.enter_state(ctx, target);
            }
            UnitState::PreStart | UnitState::Start => {
                self.fail_cnt[MethodKind::PreStart.index()] += 1;
                if self.fail_cnt[MethodKind::PreStart.index()] > MAX_METHOD_FAILURES {
                    log::error!(
                        "{}: transitioning to maintenance: method timed out/failed {} times in a row",
                        self.path,
                        MAX_METHOD_FAILURES
                    );
                    self.target = UnitState::Maintenance;
                    self.purge_and_target(ctx);
                } else {
                    self.target = UnitState::PreStart;
                    self.purge_and_target(ctx);
                }
            }
            _ => {
                log::debug!("{}: spurious timer in state {:?}", self.path, self.state);
            }
        }
    }

    /// The restart-delay timer expired; begin again from prestart.
    pub fn handle_restart_timeout(&mut self, ctx: &mut UnitCtx) {
        self.restart_timer_id = None;
        self.enter_prestart(ctx);
    }

    /// Readiness notification from the child. Only meaningful in Start.
    pub fn notify_ready(&mut self, ctx: &mut UnitCtx) {
        if self.state == UnitState::Start {
            self.disarm_timer(ctx);
            self.enter_poststart(ctx);
        }
    }

    pub fn notify_status(&self, status: &str) {
        log::info!("{}: status update: \"{}\"", self.path, status);
    }

    /// Administrative clear: take the unit out of maintenance and zero its
    /// failure counters, so a following start request can proceed.
    pub fn admin_clear(&mut self) {
        if self.state == UnitState::Maintenance {
            log::info!("{}: cleared from maintenance", self.path);
            self.state = UnitState::Offline;
            self.target = UnitState::None;
            self.fail_cnt = [0; 5];
        }
    }
}
