//! # Timeline Coordination
//!
//! Registry of timeline transitions shared by the loaders of one presentation.
//! Secondary loaders consult it before crossing a discontinuity the main loader
//! has not reached yet.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimelineRole {
    Main,
    Audio,
}

impl fmt::Display for TimelineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimelineRole::Main => write!(f, "main"),
            TimelineRole::Audio => write!(f, "audio"),
        }
    }
}

/// A move from one timeline to another. `from` is `None` for the first
/// segment a loader ever processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimelineChange {
    pub role: TimelineRole,
    pub from: Option<u64>,
    pub to: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineEvent {
    PendingChanged(TimelineRole),
    TimelineChanged(TimelineChange),
}

#[derive(Default)]
struct Records {
    last: HashMap<TimelineRole, TimelineChange>,
    pending: HashMap<TimelineRole, TimelineChange>,
}

pub struct TimelineChangeController {
    records: RwLock<Records>,
    events: broadcast::Sender<TimelineEvent>,
}

impl Default for TimelineChangeController {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineChangeController {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            records: RwLock::new(Records::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    pub fn last(&self, role: TimelineRole) -> Option<TimelineChange> {
        self.records.read().last.get(&role).copied()
    }

    pub fn pending(&self, role: TimelineRole) -> Option<TimelineChange> {
        self.records.read().pending.get(&role).copied()
    }

    /// Record a completed transition. Clears the pending record for the role.
    pub fn set_last(&self, change: TimelineChange) {
        {
            let mut records = self.records.write();
            records.last.insert(change.role, change);
            records.pending.remove(&change.role);
        }
        debug!(role = %change.role, from = ?change.from, to = change.to, "Timeline change completed");
        let _ = self.events.send(TimelineEvent::TimelineChanged(change));
    }

    pub fn set_pending(&self, change: TimelineChange) {
        self.records.write().pending.insert(change.role, change);
        debug!(role = %change.role, from = ?change.from, to = change.to, "Timeline change pending");
        let _ = self.events.send(TimelineEvent::PendingChanged(change.role));
    }

    pub fn clear_pending(&self, role: TimelineRole) {
        let removed = self.records.write().pending.remove(&role);
        if removed.is_some() {
            debug!(role = %role, "Pending timeline change cleared");
            let _ = self.events.send(TimelineEvent::PendingChanged(role));
        }
    }

    /// Whether `role` has a last or pending transition to `timeline`.
    pub fn reaches(&self, role: TimelineRole, timeline: u64) -> bool {
        let records = self.records.read();
        let hits = |map: &HashMap<TimelineRole, TimelineChange>| {
            map.get(&role).is_some_and(|change| change.to == timeline)
        };
        hits(&records.last) || hits(&records.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_change_clears_pending() {
        let controller = TimelineChangeController::new();
        let change = TimelineChange {
            role: TimelineRole::Main,
            from: Some(0),
            to: 1,
        };
        controller.set_pending(change);
        assert_eq!(controller.pending(TimelineRole::Main), Some(change));
        assert!(controller.reaches(TimelineRole::Main, 1));

        controller.set_last(change);
        assert_eq!(controller.pending(TimelineRole::Main), None);
        assert_eq!(controller.last(TimelineRole::Main), Some(change));
        assert!(controller.reaches(TimelineRole::Main, 1));
        assert!(!controller.reaches(TimelineRole::Audio, 1));
    }

    #[test]
    fn test_roles_are_independent() {
        let controller = TimelineChangeController::new();
        controller.set_pending(TimelineChange {
            role: TimelineRole::Audio,
            from: None,
            to: 0,
        });
        controller.clear_pending(TimelineRole::Main);
        assert!(controller.pending(TimelineRole::Audio).is_some());
        controller.clear_pending(TimelineRole::Audio);
        assert!(controller.pending(TimelineRole::Audio).is_none());
    }

    #[tokio::test]
    async fn test_events_distinguish_pending_and_completed() {
        let controller = TimelineChangeController::new();
        let mut events = controller.subscribe();
        let change = TimelineChange {
            role: TimelineRole::Main,
            from: Some(1),
            to: 2,
        };
        controller.set_pending(change);
        controller.set_last(change);

        assert_eq!(
            events.recv().await.unwrap(),
            TimelineEvent::PendingChanged(TimelineRole::Main)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TimelineEvent::TimelineChanged(change)
        );
    }
}
