//! Round-robin route selection for consumers.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates the starting route of each receive so no route starves.
///
/// With no routes configured the consumer only observes untagged messages.
#[derive(Debug, Default)]
pub struct RouteRotation {
    routes: Vec<String>,
    next: AtomicUsize,
}

impl RouteRotation {
    pub fn new(routes: Vec<String>) -> Self {
        Self {
            routes,
            next: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All routes, starting at the next one in rotation. Each call advances
    /// the starting point by one.
    pub fn order(&self) -> Vec<String> {
        if self.routes.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.routes.len();
        self.routes[start..]
            .iter()
            .chain(&self.routes[..start])
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_the_first_route() {
        let rotation = RouteRotation::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(rotation.order(), ["a", "b", "c"]);
        assert_eq!(rotation.order(), ["b", "c", "a"]);
        assert_eq!(rotation.order(), ["c", "a", "b"]);
        assert_eq!(rotation.order(), ["a", "b", "c"]);
    }

    #[test]
    fn empty_rotation_is_empty() {
        let rotation = RouteRotation::default();
        assert!(rotation.is_empty());
        assert!(rotation.order().is_empty());
    }
}
