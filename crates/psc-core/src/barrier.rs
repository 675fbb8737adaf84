//! Startup barriers over the child map.
//!
//! The timer-driven barriers are plain predicates over the children a
//! parent knows. The fast-mode barrier counts processes announced by
//! heartbeats instead and releases exactly when the announced total
//! equals the expected process count.

use indexmap::IndexMap;

use crate::agent_info::{AgentInfo, ChildStatus};
use crate::id::Tag;

/// Every child has sent its first heartbeat.
pub fn all_started<'a>(children: impl IntoIterator<Item = &'a AgentInfo>) -> bool {
    children.into_iter().all(AgentInfo::is_started)
}

/// Every child has heartbeated since the last restart.
pub fn all_reinit_started<'a>(children: impl IntoIterator<Item = &'a AgentInfo>) -> bool {
    children
        .into_iter()
        .all(|c| c.status_reinit == ChildStatus::Started)
}

/// Every child reported its part of the application terminated.
pub fn all_terminated<'a>(children: impl IntoIterator<Item = &'a AgentInfo>) -> bool {
    children.into_iter().all(|c| c.appl_terminated)
}

/// Every child delivered its properties for this round.
pub fn all_properties_sent<'a>(children: impl IntoIterator<Item = &'a AgentInfo>) -> bool {
    children.into_iter().all(|c| c.properties_sent)
}

/// Fast-mode heartbeat counter.
///
/// Counts are kept per announcing agent, so a repeated heartbeat from the
/// same agent replaces its earlier count instead of adding to it.
#[derive(Debug, Clone)]
pub struct HeartbeatTally {
    expected: u32,
    announced: IndexMap<Tag, u32>,
    released: bool,
}

impl HeartbeatTally {
    pub fn new(expected: u32) -> Self {
        HeartbeatTally {
            expected,
            announced: IndexMap::new(),
            released: false,
        }
    }

    /// Records `num_procs` for `tag`. Returns `true` exactly once, on the
    /// heartbeat that makes the total equal the expected count.
    pub fn record(&mut self, tag: &Tag, num_procs: u32) -> bool {
        self.announced.insert(tag.clone(), num_procs);
        if !self.released && self.total() == self.expected {
            self.released = true;
            return true;
        }
        false
    }

    /// Forgets an agent that dismissed itself.
    pub fn forget(&mut self, tag: &Tag) {
        self.announced.shift_remove(tag);
    }

    pub fn total(&self) -> u32 {
        self.announced.values().sum()
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    #[test]
    fn duplicate_heartbeat_does_not_double_count() {
        let mut tally = HeartbeatTally::new(8);
        assert!(!tally.record(&tag("fe[1]:0:0"), 4));
        assert!(!tally.record(&tag("fe[1]:0:0"), 4));
        assert_eq!(tally.total(), 4);
        assert!(!tally.is_released());

        // the interior agent announces itself with no processes
        assert!(!tally.record(&tag("fe[1]:0"), 0));
        assert!(tally.record(&tag("fe[1]:0:1"), 4));
        assert!(tally.is_released());
        assert!(!tally.record(&tag("fe[1]:0:1"), 4));
    }

    #[test]
    fn overshoot_does_not_release() {
        let mut tally = HeartbeatTally::new(3);
        assert!(!tally.record(&tag("a"), 2));
        assert!(!tally.record(&tag("b"), 2));
        assert_eq!(tally.total(), 4);
        tally.forget(&tag("b"));
        assert!(tally.record(&tag("c"), 1));
    }

    #[test]
    fn predicates_over_children() {
        let mut a = AgentInfo::new(tag("fe[1]:0"));
        let mut b = AgentInfo::new(tag("fe[1]:1"));
        assert!(!all_started([&a, &b]));
        a.record_heartbeat("h", 1);
        b.record_heartbeat("h", 2);
        assert!(all_started([&a, &b]));
        assert!(!all_reinit_started([&a, &b]));
        a.record_heartbeat("h", 1);
        b.record_heartbeat("h", 2);
        assert!(all_reinit_started([&a, &b]));

        assert!(!all_terminated([&a, &b]));
        a.appl_terminated = true;
        b.appl_terminated = true;
        assert!(all_terminated([&a, &b]));
        assert!(!all_properties_sent([&a]));
        assert!(all_properties_sent(std::iter::empty()));
    }
}
