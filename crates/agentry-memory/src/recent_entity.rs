//! In-process ring buffer of recently-touched files/folders/URLs, used to
//! resolve anaphoric references like "delete it" to a concrete path.

use std::collections::VecDeque;
use std::time::Duration as StdDuration;

use agentry_core::RecentEntity;
use time::OffsetDateTime;

pub struct RecentEntityTracker {
    capacity: usize,
    ttl: StdDuration,
    entries: VecDeque<RecentEntity>,
}

impl RecentEntityTracker {
    pub fn new(capacity: usize, ttl: StdDuration) -> Self {
        Self { capacity, ttl, entries: VecDeque::with_capacity(capacity) }
    }

    fn evict_expired(&mut self, now: OffsetDateTime) {
        while let Some(front) = self.entries.front() {
            if front.timestamp.age(now) > time_duration(self.ttl) {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an entity interaction. Newest-wins: an entity with the same
    /// `name` already tracked is removed and re-inserted at the back so it
    /// sorts as the most recent touch.
    pub fn record(&mut self, entity: RecentEntity) {
        let now = OffsetDateTime::now_utc();
        self.evict_expired(now);
        self.entries.retain(|existing| existing.name != entity.name);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entity);
    }

    pub fn recent(&self) -> impl Iterator<Item = &RecentEntity> {
        self.entries.iter().rev()
    }

    /// Render as a bullet list, newest first, for inclusion in an assembled
    /// prompt. Returns an empty string when nothing is tracked.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        self.recent()
            .map(|entity| format!("- {:?} {} {:?} at {}", entity.action, entity.name, entity.kind, entity.location))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn time_duration(std_duration: StdDuration) -> time::Duration {
    time::Duration::try_from(std_duration).unwrap_or(time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_core::{EntityAction, EntityKind};

    fn entity(name: &str) -> RecentEntity {
        RecentEntity {
            kind: EntityKind::File,
            name: name.to_string(),
            action: EntityAction::Modify,
            location: format!("/tmp/{name}"),
            timestamp: agentry_core::Timestamp::now(),
        }
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut tracker = RecentEntityTracker::new(2, StdDuration::from_secs(3600));
        tracker.record(entity("a"));
        tracker.record(entity("b"));
        tracker.record(entity("c"));
        let names: Vec<_> = tracker.recent().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn re_touching_an_entity_moves_it_to_most_recent() {
        let mut tracker = RecentEntityTracker::new(5, StdDuration::from_secs(3600));
        tracker.record(entity("a"));
        tracker.record(entity("b"));
        tracker.record(entity("a"));
        let names: Vec<_> = tracker.recent().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn render_produces_empty_string_when_nothing_tracked() {
        let tracker = RecentEntityTracker::new(5, StdDuration::from_secs(3600));
        assert_eq!(tracker.render(), "");
    }
}
