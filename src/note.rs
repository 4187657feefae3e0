//! Notes: the unit of work on the single-threaded event queue
//!
//! Every external event (admin request, process exit, timer expiry,
//! readiness message) is first translated into a note and appended to the
//! queue, never dispatched inline. The queue is the single linearization
//! point between the graph engine and the unit state machines.

use std::collections::VecDeque;

use crate::path::SvcPath;

/// Restart-on intensity of a dependency group, and the "reason" carried by
/// state-change notes. The ordering is significant: a group propagates a
/// stop only when its own intensity is at least the reason's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RestartOn {
    #[default]
    None,
    Error,
    Restart,
    Refresh,
    Any,
}

impl RestartOn {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Self::None),
            "error" => Some(Self::Error),
            "restart" => Some(Self::Restart),
            "refresh" => Some(Self::Refresh),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Error => "error",
            Self::Restart => "restart",
            Self::Refresh => "refresh",
            Self::Any => "any",
        }
    }
}

/// Administrative request sub-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    Enable,
    Disable,
    Refresh,
}

/// State-change sub-types, both intents emitted by the graph engine and
/// observations reported by units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Online,
    Offline,
    Disabled,
    Degraded,
    Maintenance,
}

/// Requests routed to the restarter: make a unit execute its way up or
/// down. Emitted by the manager when a graph transition needs a unit to
/// actually do something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestarterReq {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    AdminReq {
        op: AdminOp,
        path: SvcPath,
        reason: RestartOn,
    },
    StateChange {
        event: StateEvent,
        path: SvcPath,
        reason: RestartOn,
    },
    Rreq {
        req: RestarterReq,
        path: SvcPath,
    },
}

/// FIFO note queue. Processing a note may append further notes; the
/// dispatcher keeps popping until the queue drains.
#[derive(Debug, Default)]
pub struct NoteQueue {
    queue: VecDeque<Note>,
}

impl NoteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, note: Note) {
        self.queue.push_back(note);
    }

    pub fn push_state_change(&mut self, event: StateEvent, path: SvcPath, reason: RestartOn) {
        self.push(Note::StateChange {
            event,
            path,
            reason,
        });
    }

    pub fn pop(&mut self) -> Option<Note> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_on_ordering() {
        assert!(RestartOn::None < RestartOn::Error);
        assert!(RestartOn::Error < RestartOn::Restart);
        assert!(RestartOn::Restart < RestartOn::Refresh);
        assert!(RestartOn::Refresh < RestartOn::Any);
    }

    #[test]
    fn test_restart_on_parse() {
        assert_eq!(RestartOn::parse("any"), Some(RestartOn::Any));
        assert_eq!(RestartOn::parse("ERROR"), Some(RestartOn::Error));
        assert_eq!(RestartOn::parse("sometimes"), None);
    }

    #[test]
    fn test_queue_fifo_order() {
        let mut q = NoteQueue::new();
        let a = SvcPath::instance("a", "i");
        let b = SvcPath::instance("b", "j");

        q.push_state_change(StateEvent::Online, a.clone(), RestartOn::None);
        q.push_state_change(StateEvent::Offline, b.clone(), RestartOn::Error);

        match q.pop() {
            Some(Note::StateChange { event, path, .. }) => {
                assert_eq!(event, StateEvent::Online);
                assert_eq!(path, a);
            }
            other => panic!("unexpected note: {:?}", other),
        }
        match q.pop() {
            Some(Note::StateChange { event, path, .. }) => {
                assert_eq!(event, StateEvent::Offline);
                assert_eq!(path, b);
            }
            other => panic!("unexpected note: {:?}", other),
        }
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }
}
