//! Integration tests driving the manager end to end with the in-memory
//! process tracker: graph intent flowing into unit execution and unit
//! observations flowing back.

use std::time::{Duration, Instant};

use supd::manager::Manager;
use supd::path::SvcPath;
use supd::repository::{
    DepGroupDecl, GroupKind, InstanceDecl, MemRepository, MethodKind, ServiceDecl, UnitType,
};
use supd::restarter::{
    FakeProcessTracker, ProcessEvent, ProcessEventKind, ReadinessMessage, UnitState,
};
use supd::{RestartOn, VtxState};

fn service(svc: &str, inst: &str, unit_type: UnitType, groups: Vec<DepGroupDecl>) -> ServiceDecl {
    let mut s = ServiceDecl::new(SvcPath::service(svc));
    let mut i = InstanceDecl::new(SvcPath::instance(svc, inst));
    i.unit_type = unit_type;
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

fn graph_state(m: &Manager, path: &str) -> VtxState {
    let p = SvcPath::parse(path).unwrap();
    m.graph.vertex(m.graph.find(&p).unwrap()).state
}

fn main_pid(m: &Manager, path: &str) -> u32 {
    m.restarter
        .unit(&SvcPath::parse(path).unwrap())
        .unwrap()
        .main_pid
        .unwrap()
}

fn exit(m: &mut Manager, pid: u32, abnormal: bool) {
    m.handle_process_event(ProcessEvent {
        pid,
        kind: ProcessEventKind::Exit,
        abnormal,
    });
}

/// Fire every armed timer as if time had passed.
fn fire_timers(m: &mut Manager) {
    m.expire_timers(Instant::now() + Duration::from_secs(600));
}

// S5: a simple unit whose main PID dies abnormally while online goes
// offline, and the graph restarts it because it can still come up.
#[test]
fn scenario_crashed_unit_restarts() {
    let mut m = manager_with(vec![service("db", "main", UnitType::Simple, vec![])]);
    assert_eq!(unit_state(&m, "db:main"), UnitState::Online);
    let first_pid = main_pid(&m, "db:main");

    exit(&mut m, first_pid, true);

    // One drain later the unit is running again on a fresh PID.
    assert_eq!(unit_state(&m, "db:main"), UnitState::Online);
    assert_eq!(graph_state(&m, "db:main"), VtxState::Online);
    assert_ne!(main_pid(&m, "db:main"), first_pid);
}

// S6 (happy half): a notify unit holds in start until readiness arrives.
#[test]
fn scenario_readiness_completes_start() {
    let mut m = manager_with(vec![service("ws", "main", UnitType::Notify, vec![])]);
    assert_eq!(unit_state(&m, "ws:main"), UnitState::Start);
    let pid = main_pid(&m, "ws:main");
    assert!(m
        .restarter
        .unit(&SvcPath::instance("ws", "main"))
        .unwrap()
        .timer_id
        .is_some());

    m.handle_readiness(ReadinessMessage::parse("READY=1\nSTATUS=Serving\n", pid));

    let unit = m.restarter.unit(&SvcPath::instance("ws", "main")).unwrap();
    assert_eq!(unit.state, UnitState::Online);
    assert!(unit.timer_id.is_none());
}

// S6 (failure half): readiness never arrives; each timeout purges the
// hung process and retries, and the sixth failure lands in maintenance.
#[test]
fn scenario_readiness_timeout_bounded() {
    let mut m = manager_with(vec![service("ws", "main", UnitType::Notify, vec![])]);

    for attempt in 1..=6 {
        assert_eq!(unit_state(&m, "ws:main"), UnitState::Start, "attempt {}", attempt);
        let hung = main_pid(&m, "ws:main");

        // Timeout fires; the hung start process is purged.
        fire_timers(&mut m);
        assert_eq!(unit_state(&m, "ws:main"), UnitState::StopTerm);
        exit(&mut m, hung, false);

        if attempt == 6 {
            break;
        }
    }

    assert_eq!(unit_state(&m, "ws:main"), UnitState::Maintenance);
    assert_eq!(graph_state(&m, "ws:main"), VtxState::Maintenance);
}

// Administrative enable is the way out of maintenance: counters reset and
// the unit starts again.
#[test]
fn enable_clears_maintenance() {
    let mut m = manager_with(vec![service("ws", "main", UnitType::Notify, vec![])]);

    // Drive the unit into maintenance through repeated start timeouts.
    for _ in 1..=6 {
        let hung = main_pid(&m, "ws:main");
        fire_timers(&mut m);
        exit(&mut m, hung, false);
    }
    assert_eq!(unit_state(&m, "ws:main"), UnitState::Maintenance);
    assert_eq!(graph_state(&m, "ws:main"), VtxState::Maintenance);

    m.admin_request(
        supd::AdminOp::Enable,
        SvcPath::instance("ws", "main"),
        RestartOn::None,
    );

    // Cleared, restarted, and waiting for readiness again.
    assert_eq!(unit_state(&m, "ws:main"), UnitState::Start);
    assert_eq!(graph_state(&m, "ws:main"), VtxState::Online);
    let unit = m.restarter.unit(&SvcPath::instance("ws", "main")).unwrap();
    assert_eq!(unit.fail_count(MethodKind::PreStart), 0);
}

// Property 8 at full stack: a prestart method that always crashes reaches
// maintenance after exactly six failed attempts.
#[test]
fn property_bounded_restart_loop() {
    let mut repo = MemRepository::new();
    let mut decl = service("db", "main", UnitType::Simple, vec![]);
    decl.instances[0]
        .methods
        .insert(MethodKind::PreStart, "/usr/bin/prep".into());
    repo.insert(decl);

    let mut m = Manager::new(Box::new(repo), Box::new(FakeProcessTracker::new()));
    m.load_services();

    for attempt in 1..=6 {
        assert_eq!(unit_state(&m, "db:main"), UnitState::PreStart);
        let pid = main_pid(&m, "db:main");
        exit(&mut m, pid, true);
        if attempt < 6 {
            // The retry timer re-enters prestart.
            fire_timers(&mut m);
        }
    }

    assert_eq!(unit_state(&m, "db:main"), UnitState::Maintenance);
    let unit = m.restarter.unit(&SvcPath::instance("db", "main")).unwrap();
    assert_eq!(unit.fail_count(MethodKind::PreStart), 6);
}

// Property 3: every tracked PID belongs to exactly one unit.
#[test]
fn property_exclusive_pid_ownership() {
    let m = manager_with(vec![
        service("a", "i", UnitType::Simple, vec![]),
        service("b", "j", UnitType::Simple, vec![]),
        service("c", "k", UnitType::Notify, vec![]),
    ]);

    let mut all_pids: Vec<u32> = Vec::new();
    for unit in m.restarter.units() {
        all_pids.extend(unit.pids.iter().copied());
    }
    assert!(!all_pids.is_empty());

    let mut deduped = all_pids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(all_pids.len(), deduped.len());

    for pid in all_pids {
        assert!(m.restarter.find_unit_for_pid(pid).is_some());
    }
}

// Property 4: at quiescence each unit holds at most one active timer, and
// a held timer id is actually registered.
#[test]
fn property_one_timer_per_unit() {
    let m = manager_with(vec![
        service("a", "i", UnitType::Simple, vec![]),
        service("c", "k", UnitType::Notify, vec![]),
    ]);

    let mut expected = 0;
    for unit in m.restarter.units() {
        let mut held = 0;
        if let Some(id) = unit.timer_id {
            assert!(m.restarter.timers.contains(id));
            held += 1;
        }
        if let Some(id) = unit.restart_timer_id {
            assert!(m.restarter.timers.contains(id));
            held += 1;
        }
        assert!(held <= 1, "{} holds {} timers", unit.path, held);
        expected += held;
    }
    assert_eq!(m.restarter.timers.len(), expected);
}

// Property 7 at full stack: disable then enable returns instance and unit
// to online with flags clear.
#[test]
fn property_disable_enable_round_trip() {
    let mut m = manager_with(vec![service("db", "main", UnitType::Simple, vec![])]);
    assert_eq!(unit_state(&m, "db:main"), UnitState::Online);

    m.admin_request(
        supd::AdminOp::Disable,
        SvcPath::instance("db", "main"),
        RestartOn::None,
    );
    // The unit is signalling its process; let it obey.
    let pid = main_pid(&m, "db:main");
    exit(&mut m, pid, false);

    assert_eq!(unit_state(&m, "db:main"), UnitState::Offline);
    assert_eq!(graph_state(&m, "db:main"), VtxState::Disabled);

    m.admin_request(
        supd::AdminOp::Enable,
        SvcPath::instance("db", "main"),
        RestartOn::None,
    );

    assert_eq!(unit_state(&m, "db:main"), UnitState::Online);
    let id = m.graph.find(&SvcPath::instance("db", "main")).unwrap();
    let v = m.graph.vertex(id);
    assert_eq!(v.state, VtxState::Online);
    assert!(v.is_enabled);
    assert!(!v.to_offline);
    assert!(!v.to_disable);
}

// A dependency crashing takes restart-on-any dependents down with it,
// and both recover in the same drain.
#[test]
fn dependency_crash_restarts_dependent() {
    let mut m = manager_with(vec![
        service(
            "a",
            "i",
            UnitType::Simple,
            vec![DepGroupDecl {
                kind: GroupKind::RequireAll,
                restart_on: RestartOn::Any,
                targets: vec![SvcPath::instance("b", "j")],
            }],
        ),
        service("b", "j", UnitType::Simple, vec![]),
    ]);
    assert_eq!(unit_state(&m, "a:i"), UnitState::Online);
    let a_pid = main_pid(&m, "a:i");
    let b_pid = main_pid(&m, "b:j");

    exit(&mut m, b_pid, true);

    // b:j restarted; a:i was told to stop and is draining its process.
    assert_eq!(unit_state(&m, "b:j"), UnitState::Online);
    assert_ne!(main_pid(&m, "b:j"), b_pid);
    assert_eq!(unit_state(&m, "a:i"), UnitState::StopTerm);

    exit(&mut m, a_pid, false);
    // Once down, the graph brings a:i straight back up.
    assert_eq!(unit_state(&m, "a:i"), UnitState::Online);
    assert_ne!(main_pid(&m, "a:i"), a_pid);
}

// Readiness with a MAINPID override resolves to the owning unit.
#[test]
fn readiness_mainpid_override() {
    let mut m = manager_with(vec![service("ws", "main", UnitType::Notify, vec![])]);
    let pid = main_pid(&m, "ws:main");

    // Sent by a child helper (pid unknown), naming the main PID.
    let msg = ReadinessMessage::parse(&format!("MAINPID={}\nREADY=1\n", pid), 42);
    m.handle_readiness(msg);

    assert_eq!(unit_state(&m, "ws:main"), UnitState::Online);
}
