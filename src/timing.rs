//! Per-command "last contact" tracking.
//!
//! A command blocked on an interactive callback (a prompt or a resolve) is
//! paused so it is not mistaken for a hung command.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::CommandId;

#[derive(Clone, Copy, Debug)]
struct TimingEntry {
    /// `None` while paused.
    last_contact: Option<Instant>,
    pause_depth: u32,
}

/// Tracks last-contact timestamps for in-flight commands.
#[derive(Debug, Default)]
pub struct CommandTimingTracker {
    entries: Mutex<HashMap<CommandId, TimingEntry>>,
}

impl CommandTimingTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<CommandId, TimingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking `cmd_id` with a fresh contact time.
    pub fn start(&self, cmd_id: CommandId) {
        self.entries().insert(
            cmd_id,
            TimingEntry {
                last_contact: Some(Instant::now()),
                pause_depth: 0,
            },
        );
    }

    /// Stops tracking `cmd_id`.
    pub fn remove(&self, cmd_id: CommandId) {
        self.entries().remove(&cmd_id);
    }

    /// Returns `true` if `cmd_id` is being tracked.
    pub fn contains(&self, cmd_id: CommandId) -> bool {
        self.entries().contains_key(&cmd_id)
    }

    /// Records contact for `cmd_id` unless it is paused.
    pub fn touch(&self, cmd_id: CommandId) {
        if let Some(entry) = self.entries().get_mut(&cmd_id)
            && entry.pause_depth == 0
        {
            entry.last_contact = Some(Instant::now());
        }
    }

    /// Pauses the clock for `cmd_id`. Pauses nest.
    pub fn pause(&self, cmd_id: CommandId) {
        if let Some(entry) = self.entries().get_mut(&cmd_id) {
            entry.pause_depth += 1;
            entry.last_contact = None;
        }
    }

    /// Undoes one [`pause`](Self::pause). The clock restarts once every pause
    /// has been continued.
    pub fn resume(&self, cmd_id: CommandId) {
        if let Some(entry) = self.entries().get_mut(&cmd_id) {
            entry.pause_depth = entry.pause_depth.saturating_sub(1);
            if entry.pause_depth == 0 {
                entry.last_contact = Some(Instant::now());
            }
        }
    }

    /// Returns `true` if `cmd_id` is currently paused.
    pub fn is_paused(&self, cmd_id: CommandId) -> bool {
        self.entries()
            .get(&cmd_id)
            .is_some_and(|entry| entry.pause_depth > 0)
    }

    /// Returns `true` if `cmd_id` has had no contact for longer than `timeout`.
    ///
    /// Paused and untracked commands are never overdue.
    pub fn overdue(&self, cmd_id: CommandId, timeout: Duration) -> bool {
        self.entries()
            .get(&cmd_id)
            .and_then(|entry| entry.last_contact)
            .is_some_and(|last| last.elapsed() > timeout)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::OwnerId;

    fn id(n: u32) -> CommandId {
        CommandId::compose(OwnerId::from_raw(1), n)
    }

    #[test]
    fn pause_and_resume_are_symmetric() {
        let tracker = CommandTimingTracker::new();
        let cmd = id(1);
        tracker.start(cmd);
        for _ in 0..3 {
            tracker.pause(cmd);
        }
        tracker.resume(cmd);
        tracker.resume(cmd);
        assert!(tracker.is_paused(cmd));
        tracker.resume(cmd);
        assert!(!tracker.is_paused(cmd));
        assert!(!tracker.overdue(cmd, Duration::from_secs(60)));
    }

    #[test]
    fn paused_command_is_never_overdue() {
        let tracker = CommandTimingTracker::new();
        let cmd = id(2);
        tracker.start(cmd);
        tracker.pause(cmd);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!tracker.overdue(cmd, Duration::from_millis(1)));
        tracker.resume(cmd);
        assert!(!tracker.overdue(cmd, Duration::from_millis(15)));
    }

    #[test]
    fn stale_command_becomes_overdue() {
        let tracker = CommandTimingTracker::new();
        let cmd = id(3);
        tracker.start(cmd);
        std::thread::sleep(Duration::from_millis(20));
        assert!(tracker.overdue(cmd, Duration::from_millis(5)));
        tracker.touch(cmd);
        assert!(!tracker.overdue(cmd, Duration::from_millis(15)));
    }

    #[test]
    fn removed_commands_are_forgotten() {
        let tracker = CommandTimingTracker::new();
        let cmd = id(4);
        tracker.start(cmd);
        assert!(tracker.contains(cmd));
        tracker.remove(cmd);
        assert!(!tracker.contains(cmd));
        tracker.pause(cmd);
        assert!(!tracker.is_paused(cmd));
    }
}
