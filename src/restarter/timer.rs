//! Timed callbacks for the restarter
//!
//! A flat set of armed timers addressed by id. The event loop sleeps
//! until the earliest deadline and pops expired entries; tests pop with a
//! fabricated "now" to fire timers deterministically.

use std::time::{Duration, Instant};

use crate::path::SvcPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What to do when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerData {
    /// A unit's method/state timeout.
    UnitTimeout(SvcPath),
    /// Delayed re-entry into prestart after a method failure.
    RestartBegin(SvcPath),
    /// Repository reconnect attempt.
    RepoRetry,
}

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub id: TimerId,
    pub deadline: Instant,
    pub data: TimerData,
}

#[derive(Debug, Default)]
pub struct TimerSet {
    next_id: u64,
    entries: Vec<TimerEntry>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer firing after `after`. Ids are never reused.
    pub fn add(&mut self, after: Duration, data: TimerData) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.push(TimerEntry {
            id,
            deadline: Instant::now() + after,
            data,
        });
        id
    }

    /// Deregister a timer. Returns false if it already fired or was
    /// deleted.
    pub fn del(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest pending deadline, for the event loop's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut expired: Vec<TimerEntry> = Vec::new();
        self.entries.retain(|e| {
            if e.deadline <= now {
                expired.push(e.clone());
                false
            } else {
                true
            }
        });
        expired.sort_by_key(|e| e.deadline);
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_del() {
        let mut ts = TimerSet::new();
        let id = ts.add(Duration::from_secs(2), TimerData::RepoRetry);
        assert!(ts.contains(id));
        assert!(ts.del(id));
        assert!(!ts.contains(id));
        assert!(!ts.del(id));
    }

    #[test]
    fn test_ids_not_reused() {
        let mut ts = TimerSet::new();
        let a = ts.add(Duration::from_secs(1), TimerData::RepoRetry);
        ts.del(a);
        let b = ts.add(Duration::from_secs(1), TimerData::RepoRetry);
        assert_ne!(a, b);
    }

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let mut ts = TimerSet::new();
        let p = SvcPath::instance("a", "i");
        ts.add(Duration::from_millis(500), TimerData::RestartBegin(p.clone()));
        ts.add(Duration::from_millis(100), TimerData::UnitTimeout(p.clone()));
        ts.add(Duration::from_secs(600), TimerData::RepoRetry);

        let fired = ts.pop_expired(Instant::now() + Duration::from_secs(2));
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].data, TimerData::UnitTimeout(p.clone()));
        assert_eq!(fired[1].data, TimerData::RestartBegin(p));
        assert_eq!(ts.len(), 1);
    }

    #[test]
    fn test_next_deadline_is_min() {
        let mut ts = TimerSet::new();
        assert!(ts.next_deadline().is_none());
        ts.add(Duration::from_secs(5), TimerData::RepoRetry);
        let early = ts.add(Duration::from_secs(1), TimerData::RepoRetry);
        let dl = ts.next_deadline().unwrap();
        assert!(dl <= Instant::now() + Duration::from_secs(1));
        ts.del(early);
        assert!(ts.next_deadline().unwrap() > dl);
    }
}
