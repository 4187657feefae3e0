//! Process tracking as a capability
//!
//! The unit state machine talks to child processes only through the
//! [`ProcessTracker`] trait: fork a method command, watch and disregard
//! PIDs, deliver stop signals. Exits come back through an event stream.
//! [`OsProcessTracker`] is the real implementation; [`FakeProcessTracker`]
//! is the in-memory double used by the test suites.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;

use crate::path::SvcPath;
use crate::restarter::notify::NOTIFY_SOCKET_PATH;

/// Process lifecycle events delivered to the restarter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventKind {
    /// A new child appeared under a unit's process tree.
    Child,
    /// A tracked process exited.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEvent {
    pub pid: u32,
    pub kind: ProcessEventKind,
    /// For exits: nonzero status or killed by a signal.
    pub abnormal: bool,
}

/// Which stop signal to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Kill,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("invalid method command: {0}")]
    InvalidCommand(String),

    #[error("failed to spawn process: {0}")]
    Spawn(String),
}

pub trait ProcessTracker {
    /// Fork a method command for a unit. The returned PID is already
    /// watched: its exit will be delivered even if the child is gone
    /// before this returns. The caller records it in the unit's pid set.
    fn fork_method(&mut self, path: &SvcPath, cmd: &str) -> Result<u32, SpawnError>;

    /// Begin delivering events for a PID that appeared some other way
    /// (a reported child birth).
    fn watch(&mut self, pid: u32);

    /// Stop delivering events for a PID.
    fn disregard(&mut self, pid: u32);

    /// Deliver a stop signal.
    fn signal(&mut self, pid: u32, sig: StopSignal);
}

/// Real tracker: spawns via tokio, waits for each child on a background
/// task, and classifies the exit status onto the event channel.
pub struct OsProcessTracker {
    tx: mpsc::UnboundedSender<ProcessEvent>,
    watched: Arc<Mutex<HashSet<u32>>>,
}

impl OsProcessTracker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                watched: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    fn parse_command(cmd: &str) -> Result<(String, Vec<String>), SpawnError> {
        let parts =
            shlex::split(cmd).ok_or_else(|| SpawnError::InvalidCommand(cmd.to_string()))?;
        if parts.is_empty() {
            return Err(SpawnError::InvalidCommand(cmd.to_string()));
        }
        let program = parts[0].clone();
        let args = parts[1..].to_vec();
        Ok((program, args))
    }
}

impl ProcessTracker for OsProcessTracker {
    fn fork_method(&mut self, path: &SvcPath, cmd: &str) -> Result<u32, SpawnError> {
        let (program, args) = Self::parse_command(cmd)?;

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            // Children discover the readiness socket through the
            // environment.
            .env("NOTIFY_SOCKET", NOTIFY_SOCKET_PATH);

        let mut child = command
            .spawn()
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Spawn("child exited before tracking".to_string()))?;

        log::debug!("{}: child PID {}", path, pid);

        // Watched before the wait task exists: the exit of a child that
        // dies immediately must still be delivered.
        if let Ok(mut w) = self.watched.lock() {
            w.insert(pid);
        }

        let tx = self.tx.clone();
        let watched = Arc::clone(&self.watched);
        tokio::spawn(async move {
            let abnormal = match child.wait().await {
                Ok(status) => status.code() != Some(0),
                Err(e) => {
                    log::error!("wait for PID {} failed: {}", pid, e);
                    true
                }
            };
            if watched.lock().map(|w| w.contains(&pid)).unwrap_or(false) {
                let _ = tx.send(ProcessEvent {
                    pid,
                    kind: ProcessEventKind::Exit,
                    abnormal,
                });
            }
        });

        Ok(pid)
    }

    fn watch(&mut self, pid: u32) {
        if let Ok(mut w) = self.watched.lock() {
            w.insert(pid);
        }
    }

    fn disregard(&mut self, pid: u32) {
        if let Ok(mut w) = self.watched.lock() {
            w.remove(&pid);
        }
    }

    fn signal(&mut self, pid: u32, sig: StopSignal) {
        let signal = match sig {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            log::warn!("failed to signal PID {}: {}", pid, e);
        }
    }
}

/// In-memory tracker for tests: hands out fabricated PIDs, records forks
/// and signals, and lets the test inject exits by hand.
#[derive(Debug, Default)]
pub struct FakeProcessTracker {
    next_pid: u32,
    pub spawned: Vec<(SvcPath, String, u32)>,
    pub watched: HashSet<u32>,
    pub signals: Vec<(u32, StopSignal)>,
    /// When set, the next fork fails.
    pub fail_fork: bool,
}

impl FakeProcessTracker {
    pub fn new() -> Self {
        Self {
            next_pid: 100,
            ..Self::default()
        }
    }

    /// Command string of the most recent fork.
    pub fn last_cmd(&self) -> Option<&str> {
        self.spawned.last().map(|(_, cmd, _)| cmd.as_str())
    }

    /// PID handed out by the most recent fork.
    pub fn last_pid(&self) -> Option<u32> {
        self.spawned.last().map(|(_, _, pid)| *pid)
    }
}

impl ProcessTracker for FakeProcessTracker {
    fn fork_method(&mut self, path: &SvcPath, cmd: &str) -> Result<u32, SpawnError> {
        if self.fail_fork {
            return Err(SpawnError::Spawn("injected fork failure".to_string()));
        }
        self.next_pid += 1;
        let pid = self.next_pid;
        self.spawned.push((path.clone(), cmd.to_string(), pid));
        self.watched.insert(pid);
        Ok(pid)
    }

    fn watch(&mut self, pid: u32) {
        self.watched.insert(pid);
    }

    fn disregard(&mut self, pid: u32) {
        self.watched.remove(&pid);
    }

    fn signal(&mut self, pid: u32, sig: StopSignal) {
        self.signals.push((pid, sig));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let (prog, args) = OsProcessTracker::parse_command("/usr/bin/dbd --port 5432").unwrap();
        assert_eq!(prog, "/usr/bin/dbd");
        assert_eq!(args, vec!["--port", "5432"]);
    }

    #[test]
    fn test_parse_command_quoting() {
        let (prog, args) =
            OsProcessTracker::parse_command("/bin/sh -c 'echo hello world'").unwrap();
        assert_eq!(prog, "/bin/sh");
        assert_eq!(args, vec!["-c", "echo hello world"]);
    }

    #[test]
    fn test_parse_command_rejects_empty() {
        assert!(OsProcessTracker::parse_command("").is_err());
        assert!(OsProcessTracker::parse_command("   ").is_err());
    }

    #[test]
    fn test_fake_tracker_pids_and_signals() {
        let mut t = FakeProcessTracker::new();
        let p = SvcPath::instance("a", "i");
        let pid1 = t.fork_method(&p, "/bin/true").unwrap();
        let pid2 = t.fork_method(&p, "/bin/true").unwrap();
        assert_ne!(pid1, pid2);

        // Forked PIDs are watched from birth; disregard releases them.
        assert!(t.watched.contains(&pid1));
        assert!(t.watched.contains(&pid2));
        t.disregard(pid1);
        assert!(!t.watched.contains(&pid1));

        // PIDs that appear by other means are watched on request.
        t.watch(777);
        assert!(t.watched.contains(&777));

        t.signal(pid2, StopSignal::Term);
        assert_eq!(t.signals, vec![(pid2, StopSignal::Term)]);
    }

    #[test]
    fn test_fake_tracker_fork_failure() {
        let mut t = FakeProcessTracker::new();
        t.fail_fork = true;
        assert!(t
            .fork_method(&SvcPath::instance("a", "i"), "/bin/true")
            .is_err());
    }
}
