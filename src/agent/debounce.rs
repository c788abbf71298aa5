use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One remote-to-disk write waiting out its debounce window. The disk hash
/// recorded at schedule time guards against writing over bytes the
/// watcher has not reported yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub deadline: Instant,
    pub expected_disk_hash: Option<String>,
}

/// Deadline map for debounced remote-to-disk writes, keyed by
/// workspace-relative path. A filesystem event on the same path cancels
/// the entry; the filesystem is authoritative for what was just typed.
#[derive(Debug, Default)]
pub struct PendingWrites {
    map: HashMap<String, PendingWrite>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules or reschedules a write; the latest deadline wins.
    pub fn schedule(&mut self, path: &str, delay: Duration, expected_disk_hash: Option<String>) {
        self.map.insert(
            path.to_string(),
            PendingWrite {
                deadline: Instant::now() + delay,
                expected_disk_hash,
            },
        );
    }

    pub fn cancel(&mut self, path: &str) -> bool {
        self.map.remove(path).is_some()
    }

    pub fn drain_due(&mut self, now: Instant) -> Vec<(String, PendingWrite)> {
        let due: Vec<String> = self
            .map
            .iter()
            .filter(|(_, pw)| pw.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.into_iter()
            .filter_map(|path| self.map.remove(&path).map(|pw| (path, pw)))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.map.values().map(|pw| pw.deadline).min()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Suppresses watcher events briefly after the agent's own disk writes so
/// a remote update is not echoed back as a local edit.
#[derive(Debug, Default)]
pub struct QuietWindows {
    map: HashMap<String, Instant>,
}

impl QuietWindows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, path: &str, until: Instant) {
        self.map.insert(path.to_string(), until);
    }

    pub fn is_quiet(&mut self, path: &str, now: Instant) -> bool {
        self.map.retain(|_, until| *until > now);
        self.map.get(path).is_some_and(|until| *until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_then_drain_after_deadline() {
        let mut pending = PendingWrites::new();
        pending.schedule("main.py", Duration::from_millis(50), None);

        assert!(pending.drain_due(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_millis(100);
        let due = pending.drain_due(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "main.py");
        assert!(pending.is_empty());
    }

    #[test]
    fn cancel_drops_the_entry() {
        let mut pending = PendingWrites::new();
        pending.schedule("main.py", Duration::from_millis(10), None);
        assert!(pending.cancel("main.py"));
        assert!(!pending.cancel("main.py"));
        let later = Instant::now() + Duration::from_secs(1);
        assert!(pending.drain_due(later).is_empty());
    }

    #[test]
    fn reschedule_replaces_the_deadline() {
        let mut pending = PendingWrites::new();
        pending.schedule("a.py", Duration::from_millis(10), None);
        pending.schedule("a.py", Duration::from_secs(60), Some("abc".into()));

        let soon = Instant::now() + Duration::from_secs(1);
        assert!(pending.drain_due(soon).is_empty());
        assert!(pending.next_deadline().unwrap() > soon);
    }

    #[test]
    fn next_deadline_is_the_earliest() {
        let mut pending = PendingWrites::new();
        pending.schedule("late.py", Duration::from_secs(60), None);
        pending.schedule("soon.py", Duration::from_millis(5), None);
        let next = pending.next_deadline().unwrap();
        assert!(next <= Instant::now() + Duration::from_millis(50));
    }

    #[test]
    fn quiet_window_expires() {
        let mut quiet = QuietWindows::new();
        let now = Instant::now();
        quiet.mark("main.py", now + Duration::from_millis(100));

        assert!(quiet.is_quiet("main.py", now));
        assert!(!quiet.is_quiet("other.py", now));
        assert!(!quiet.is_quiet("main.py", now + Duration::from_millis(200)));
    }
}
