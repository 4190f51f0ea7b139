//! Groupcast Policy
//!
//! Watch-list, client-rule matching, rate limiting and per-destination cooldowns

pub mod cooldown;
pub mod matcher;
pub mod rate;

pub use cooldown::CooldownTracker;
pub use matcher::{normalize_arabic, TextMatcher};
pub use rate::RateLimiter;

use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct WatchPolicy {
    watch_list: HashSet<String>,
}

impl WatchPolicy {
    pub fn new(watch_list: &[String]) -> Self {
        let watch_list = watch_list
            .iter()
            .map(|destination| destination.trim().to_string())
            .filter(|destination| !destination.is_empty())
            .collect();
        Self { watch_list }
    }

    /// An empty watch-list watches every destination.
    pub fn is_watched(&self, destination: &str) -> bool {
        if self.watch_list.is_empty() {
            return true;
        }
        self.watch_list.contains(destination)
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut list: Vec<String> = self.watch_list.iter().cloned().collect();
        list.sort();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::WatchPolicy;

    #[test]
    fn empty_watch_list_watches_everything() {
        let policy = WatchPolicy::new(&[]);
        assert!(policy.is_watched("any@g.us"));
    }

    #[test]
    fn watch_list_filters_destinations() {
        let policy = WatchPolicy::new(&[" a@g.us ".to_string(), "b@g.us".to_string()]);
        assert!(policy.is_watched("a@g.us"));
        assert!(policy.is_watched("b@g.us"));
        assert!(!policy.is_watched("c@g.us"));
        assert_eq!(policy.destinations(), vec!["a@g.us", "b@g.us"]);
    }
}
