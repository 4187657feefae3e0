//! The manager: couples the graph engine and the restarter
//!
//! Owns the single note queue. Each tick of the event loop translates one
//! external event (process exit, timer expiry, readiness datagram, admin
//! request) into notes and then dispatches until the queue drains. All
//! mutation of the graph and the units happens here, on one task.

mod run;

pub use run::{run_daemon, DaemonOptions};

use std::time::Duration;

use crate::graph::{Graph, VertexKind, VtxState};
use crate::note::{AdminOp, Note, NoteQueue, RestartOn, RestarterReq, StateEvent};
use crate::path::SvcPath;
use crate::protocol::{Request, Response, UnitInfo};
use crate::repository::Repository;
use crate::restarter::{
    ProcessEvent, ProcessTracker, ReadinessMessage, Restarter, TimerData, TimerEntry, TimerId,
    UnitState,
};

/// First repository reconnect delay; doubles up to the cap.
const REPO_RETRY_INITIAL: Duration = Duration::from_secs(1);
const REPO_RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to load declarations: {0}")]
    Load(#[from] crate::repository::ParseError),

    #[error(transparent)]
    Ipc(#[from] crate::protocol::IpcError),
}

pub struct Manager {
    pub graph: Graph,
    pub restarter: Restarter,
    notes: NoteQueue,
    repository: Box<dyn Repository>,
    repo_up: bool,
    repo_retry_delay: Duration,
    repo_retry_timer: Option<TimerId>,
}

impl Manager {
    pub fn new(repository: Box<dyn Repository>, tracker: Box<dyn ProcessTracker>) -> Self {
        Self {
            graph: Graph::new(),
            restarter: Restarter::new(tracker),
            notes: NoteQueue::new(),
            repository,
            repo_up: false,
            repo_retry_delay: REPO_RETRY_INITIAL,
            repo_retry_timer: None,
        }
    }

    /// Install every declared service, set up the graph, create units,
    /// and kick startable instances. A repository failure arms the
    /// back-off retry timer instead; the graph is frozen until recovery.
    pub fn load_services(&mut self) {
        let decls = match self.repository.services() {
            Ok(d) => d,
            Err(e) => {
                log::error!("repository enumeration failed: {}", e);
                self.repository_down();
                return;
            }
        };

        self.repo_up = true;
        self.repo_retry_delay = REPO_RETRY_INITIAL;

        for decl in &decls {
            self.graph.install_service(decl);
            for inst in &decl.instances {
                self.restarter.ensure_unit(inst);
            }
        }

        for err in self.graph.setup_all(self.repository.as_ref()) {
            log::error!("configuration error: {}", err);
        }

        for path in self.graph.startable_instances() {
            self.notes
                .push_state_change(StateEvent::Offline, path, RestartOn::None);
        }
        self.dispatch_notes();
    }

    fn repository_down(&mut self) {
        self.repo_up = false;
        let delay = self.repo_retry_delay;
        log::warn!("repository down; retrying in {:?}", delay);
        self.repo_retry_delay = (self.repo_retry_delay * 2).min(REPO_RETRY_MAX);
        if let Some(old) = self.repo_retry_timer.take() {
            self.restarter.timers.del(old);
        }
        self.repo_retry_timer = Some(self.restarter.timers.add(delay, TimerData::RepoRetry));
    }

    fn repository_came_up(&mut self) {
        log::info!("repository came up");
        self.repo_up = true;
        self.repo_retry_delay = REPO_RETRY_INITIAL;
        if let Some(id) = self.repo_retry_timer.take() {
            self.restarter.timers.del(id);
        }
    }

    /// Enqueue an administrative request and drain the queue.
    pub fn admin_request(&mut self, op: AdminOp, path: SvcPath, reason: RestartOn) {
        self.notes.push(Note::AdminReq { op, path, reason });
        self.dispatch_notes();
    }

    /// One process event from the tracker, then drain.
    pub fn handle_process_event(&mut self, ev: ProcessEvent) {
        self.restarter.handle_process_event(ev, &mut self.notes);
        self.dispatch_notes();
    }

    /// One readiness datagram, then drain.
    pub fn handle_readiness(&mut self, msg: ReadinessMessage) {
        self.restarter.handle_readiness(&msg, &mut self.notes);
        self.dispatch_notes();
    }

    /// One fired timer, then drain.
    pub fn handle_timer_expiry(&mut self, entry: TimerEntry) {
        match entry.data {
            TimerData::RepoRetry => {
                self.repo_retry_timer = None;
                log::info!("retrying repository");
                self.load_services();
            }
            _ => {
                self.restarter.handle_timer(&entry, &mut self.notes);
                self.dispatch_notes();
            }
        }
    }

    /// Fire every timer due at `now` and drain. The event loop calls this
    /// with the current time; tests fabricate one.
    pub fn expire_timers(&mut self, now: std::time::Instant) {
        for entry in self.restarter.timers.pop_expired(now) {
            self.handle_timer_expiry(entry);
        }
    }

    /// Pop notes until the queue drains.
    pub fn dispatch_notes(&mut self) {
        while let Some(note) = self.notes.pop() {
            self.dispatch_note(note);
        }
    }

    fn dispatch_note(&mut self, note: Note) {
        match note {
            Note::AdminReq { op, path, reason } => {
                if op == AdminOp::Enable {
                    // Enabling is the administrative intervention that
                    // releases a unit held in maintenance.
                    self.restarter.admin_clear(&path);
                }
                self.graph
                    .process_admin_req(&path, op, reason, &mut self.notes);
            }
            Note::StateChange {
                event,
                path,
                reason,
            } => {
                let transitioned =
                    self.graph
                        .process_state_change(&path, event, reason, &mut self.notes);
                self.bridge_state_change(&path, event, transitioned);
            }
            Note::Rreq { req, path } => {
                self.restarter.handle_rreq(&path, req, &mut self.notes);
            }
        }
    }

    /// A graph transition on an instance may need the unit to actually do
    /// something: start after an online intent, stop after an offline
    /// intent. Unit echoes of states the graph already holds fall through
    /// the `transitioned` check.
    fn bridge_state_change(&mut self, path: &SvcPath, event: StateEvent, transitioned: bool) {
        let Some(id) = self.graph.find(path) else {
            return;
        };
        if self.graph.vertex(id).kind != VertexKind::Instance {
            return;
        }
        let unit_state = self.restarter.unit(path).map(|u| u.state);

        match event {
            StateEvent::Online => {
                if transitioned
                    && matches!(
                        unit_state,
                        Some(UnitState::Uninitialised) | Some(UnitState::Offline)
                    )
                {
                    self.notes.push(Note::Rreq {
                        req: RestarterReq::Start,
                        path: path.clone(),
                    });
                }
                if !self.repo_up
                    && *path == SvcPath::repository()
                    && unit_state == Some(UnitState::Online)
                {
                    self.repository_came_up();
                }
            }
            StateEvent::Offline => {
                if transitioned
                    && matches!(
                        unit_state,
                        Some(UnitState::PreStart)
                            | Some(UnitState::Start)
                            | Some(UnitState::PostStart)
                            | Some(UnitState::Online)
                    )
                {
                    self.notes.push(Note::Rreq {
                        req: RestarterReq::Stop,
                        path: path.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    /// Status row for one instance.
    pub fn unit_info(&self, path: &SvcPath) -> Option<UnitInfo> {
        let id = self.graph.find(path)?;
        let v = self.graph.vertex(id);
        if v.kind != VertexKind::Instance {
            return None;
        }
        Some(UnitInfo {
            path: path.to_string(),
            graph_state: vtx_state_str(v.state).to_string(),
            unit_state: self
                .restarter
                .unit(path)
                .map(|u| unit_state_str(u.state))
                .unwrap_or("unknown")
                .to_string(),
            enabled: v.is_enabled,
        })
    }

    /// Status rows for every instance.
    pub fn list_units(&self) -> Vec<UnitInfo> {
        let mut rows: Vec<UnitInfo> = self
            .graph
            .ids()
            .filter(|id| self.graph.vertex(*id).kind == VertexKind::Instance)
            .filter_map(|id| self.unit_info(&self.graph.vertex(id).path))
            .collect();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows
    }

    /// Serve one admin request.
    pub fn handle_admin(&mut self, req: Request) -> Response {
        match req {
            Request::Ping => Response::Pong,
            Request::Enable { path } => self.admin_op(AdminOp::Enable, &path),
            Request::Disable { path } => self.admin_op(AdminOp::Disable, &path),
            Request::Refresh { path } => self.admin_op(AdminOp::Refresh, &path),
            Request::Status { path } => match SvcPath::parse(&path) {
                Ok(p) => self
                    .unit_info(&p)
                    .map(Response::Status)
                    .unwrap_or_else(|| Response::Error(format!("no such instance: {}", path))),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::List => Response::Units(self.list_units()),
            Request::DotGraph => Response::Dot(self.graph.render_dot()),
        }
    }

    fn admin_op(&mut self, op: AdminOp, path: &str) -> Response {
        match SvcPath::parse(path) {
            Ok(p) => {
                if self.graph.find(&p).is_none() {
                    return Response::Error(format!("no such path: {}", path));
                }
                self.admin_request(op, p, RestartOn::None);
                Response::Ok
            }
            Err(e) => Response::Error(e.to_string()),
        }
    }
}

fn vtx_state_str(s: VtxState) -> &'static str {
    match s {
        VtxState::Uninitialised => "uninitialised",
        VtxState::Disabled => "disabled",
        VtxState::Offline => "offline",
        VtxState::Online => "online",
        VtxState::Degraded => "degraded",
        VtxState::Maintenance => "maintenance",
    }
}

fn unit_state_str(s: UnitState) -> &'static str {
    match s {
        UnitState::Uninitialised => "uninitialised",
        UnitState::Offline => "offline",
        UnitState::PreStart => "prestart",
        UnitState::Start => "start",
        UnitState::PostStart => "poststart",
        UnitState::Online => "online",
        UnitState::Stop => "stop",
        UnitState::StopTerm => "stopterm",
        UnitState::StopKill => "stopkill",
        UnitState::Maintenance => "maintenance",
        UnitState::None => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{
        DepGroupDecl, GroupKind, InstanceDecl, MemRepository, MethodKind, RepoError, RepoObject,
        ServiceDecl,
    };
    use crate::restarter::{FakeProcessTracker, ProcessEventKind};

    fn decl(svc: &str, inst: &str, groups: Vec<DepGroupDecl>) -> ServiceDecl {
        let mut s = ServiceDecl::new(SvcPath::service(svc));
        let mut i = InstanceDecl::new(SvcPath::instance(svc, inst));
        i.methods.insert(MethodKind::Start, "/usr/bin/d".into());
        i.depgroups = groups;
        s.instances.push(i);
        s
    }

    fn manager_with(decls: Vec<ServiceDecl>) -> Manager {
        let mut repo = MemRepository::new();
        for d in decls {
            repo.insert(d);
        }
        let mut m = Manager::new(Box::new(repo), Box::new(FakeProcessTracker::new()));
        m.load_services();
        m
    }

    fn unit_state(m: &Manager, path: &str) -> UnitState {
        m.restarter
            .unit(&SvcPath::parse(path).unwrap())
            .unwrap()
            .state
    }

    #[test]
    fn test_load_brings_independent_instance_online() {
        let m = manager_with(vec![decl("db", "main", vec![])]);
        assert_eq!(unit_state(&m, "db:main"), UnitState::Online);

        let info = m.unit_info(&SvcPath::instance("db", "main")).unwrap();
        assert_eq!(info.graph_state, "online");
        assert_eq!(info.unit_state, "online");
        assert!(info.enabled);
    }

    #[test]
    fn test_dependency_ordering_on_load() {
        // a:i requires b:j: both come up in one drain.
        let m = manager_with(vec![
            decl(
                "a",
                "i",
                vec![DepGroupDecl {
                    kind: GroupKind::RequireAll,
                    restart_on: RestartOn::Any,
                    targets: vec![SvcPath::instance("b", "j")],
                }],
            ),
            decl("b", "j", vec![]),
        ]);

        assert_eq!(unit_state(&m, "b:j"), UnitState::Online);
        assert_eq!(unit_state(&m, "a:i"), UnitState::Online);
    }

    #[test]
    fn test_admin_disable_stops_unit() {
        let mut m = manager_with(vec![decl("db", "main", vec![])]);
        assert_eq!(unit_state(&m, "db:main"), UnitState::Online);

        let resp = m.handle_admin(Request::Disable {
            path: "db:main".into(),
        });
        assert!(matches!(resp, Response::Ok));

        // The stop request went out; the unit is signalling its processes.
        assert_eq!(unit_state(&m, "db:main"), UnitState::StopTerm);

        // The main process obeys the TERM.
        let pid = m
            .restarter
            .unit(&SvcPath::instance("db", "main"))
            .unwrap()
            .pids
            .iter()
            .next()
            .copied()
            .unwrap();
        m.handle_process_event(ProcessEvent {
            pid,
            kind: ProcessEventKind::Exit,
            abnormal: false,
        });

        assert_eq!(unit_state(&m, "db:main"), UnitState::Offline);
        let info = m.unit_info(&SvcPath::instance("db", "main")).unwrap();
        assert_eq!(info.graph_state, "disabled");
        assert!(!info.enabled);
    }

    #[test]
    fn test_admin_unknown_path_is_an_error() {
        let mut m = manager_with(vec![decl("db", "main", vec![])]);
        let resp = m.handle_admin(Request::Disable {
            path: "ghost:x".into(),
        });
        assert!(matches!(resp, Response::Error(_)));
    }

    #[test]
    fn test_list_units_sorted() {
        let m = manager_with(vec![decl("zz", "a", vec![]), decl("aa", "b", vec![])]);
        let rows = m.list_units();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].path, "aa:b");
        assert_eq!(rows[1].path, "zz:a");
    }

    #[test]
    fn test_repo_failure_arms_retry() {
        struct DownRepo;
        impl Repository for DownRepo {
            fn lookup_path(&self, _path: &SvcPath) -> Result<RepoObject, RepoError> {
                Err(RepoError::Unavailable)
            }
            fn services(&self) -> Result<Vec<ServiceDecl>, RepoError> {
                Err(RepoError::Unavailable)
            }
        }

        let mut m = Manager::new(Box::new(DownRepo), Box::new(FakeProcessTracker::new()));
        m.load_services();
        assert!(!m.repo_up);
        assert!(m.repo_retry_timer.is_some());
        // Back-off doubled for the next attempt.
        assert_eq!(m.repo_retry_delay, REPO_RETRY_INITIAL * 2);
    }
}
