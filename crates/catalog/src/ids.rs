use std::collections::HashSet;

/// Hands out kernel ids that never collide with ids already in a catalog.
///
/// Each allocation returns the smallest unused id at or above an internal
/// cursor, so ids increase monotonically except where they fill gaps left
/// between reloaded ids.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    used: HashSet<u64>,
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            used: ids.into_iter().collect(),
            next: 0,
        }
    }

    pub fn allocate(&mut self) -> u64 {
        while self.used.contains(&self.next) {
            self.next += 1;
        }
        let id = self.next;
        self.used.insert(id);
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_preloaded_ids() {
        let mut ids = IdAllocator::from_ids([0, 2, 5]);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 3);
        assert_eq!(ids.allocate(), 4);
        assert_eq!(ids.allocate(), 6);
        assert_eq!(ids.allocate(), 7);
    }

    #[test]
    fn test_fresh_allocator_counts_from_zero() {
        let mut ids = IdAllocator::new();
        assert_eq!((0..3).map(|_| ids.allocate()).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
