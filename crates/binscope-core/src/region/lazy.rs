//! Index-addressed arena for children decoded on demand.
//!
//! Some record tables hold millions of entries (a ZIP central directory, for
//! instance). Decoding them eagerly is wasteful when a consumer only looks
//! at a handful, so such tables declare their child count up front and hand
//! a [`ChildSource`] to the arena. The first `get(i)` asks the source to
//! decode record `i`, and the result is cached for every later reader.

use super::Region;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Strategy that decodes one child of a lazy table.
///
/// A source must be deterministic: decoding index `i` yields the same region
/// whatever was materialized before. `known` gives access to the children
/// already in the arena so the source can start from the nearest one instead
/// of the table start.
pub trait ChildSource: Send + Sync {
    /// Decode child `index`
    fn fetch(&self, index: usize, known: KnownChildren<'_>) -> Result<Region>;
}

/// Read-only view of the children already materialized in an arena
#[derive(Clone, Copy)]
pub struct KnownChildren<'a> {
    slots: &'a BTreeMap<usize, Arc<Region>>,
}

impl<'a> KnownChildren<'a> {
    /// Returns child `index` if it has been materialized
    pub fn get(&self, index: usize) -> Option<&'a Region> {
        self.slots.get(&index).map(Arc::as_ref)
    }

    /// Returns the materialized child with the greatest index below `index`
    pub fn nearest_before(&self, index: usize) -> Option<(usize, &'a Region)> {
        self.slots
            .range(..index)
            .next_back()
            .map(|(i, r)| (*i, r.as_ref()))
    }
}

/// Children with a declared count, decoded and cached on first access
pub struct LazyChildren {
    count: usize,
    source: Box<dyn ChildSource>,
    slots: Mutex<BTreeMap<usize, Arc<Region>>>,
}

impl LazyChildren {
    /// Creates an arena of `count` children backed by `source`
    pub fn new(count: usize, source: impl ChildSource + 'static) -> Self {
        Self {
            count,
            source: Box::new(source),
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Declared number of children
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of children decoded so far
    pub fn materialized(&self) -> usize {
        self.lock().len()
    }

    /// Returns child `index`, decoding it on first access.
    ///
    /// The arena lock is held while the source runs, so concurrent callers
    /// never decode the same child twice.
    pub fn get(&self, index: usize) -> Result<Arc<Region>> {
        if index >= self.count {
            return Err(Error::IndexOutOfRange {
                index,
                count: self.count,
            });
        }

        let mut slots = self.lock();
        if let Some(region) = slots.get(&index) {
            return Ok(Arc::clone(region));
        }

        trace!("Materializing lazy child {} of {}", index, self.count);
        let region = Arc::new(self.source.fetch(index, KnownChildren { slots: &*slots })?);
        slots.insert(index, Arc::clone(&region));
        Ok(region)
    }

    /// Iterates over all children in order, decoding as it goes
    pub fn iter(&self) -> impl Iterator<Item = Result<Arc<Region>>> + '_ {
        (0..self.count).map(move |i| self.get(i))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<usize, Arc<Region>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LazyChildren {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyChildren")
            .field("count", &self.count)
            .field("materialized", &self.materialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed-size records of `index + 1` bytes each, laid end to end
    struct Growing {
        calls: Arc<AtomicUsize>,
    }

    impl ChildSource for Growing {
        fn fetch(&self, index: usize, known: KnownChildren<'_>) -> Result<Region> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (mut i, mut pos) = match known.nearest_before(index) {
                Some((i, r)) => (i + 1, r.end),
                None => (0, 0),
            };
            while i < index {
                pos += i + 1;
                i += 1;
            }
            Ok(Region::new("record", RegionKind::General, pos, pos + index + 1))
        }
    }

    #[test]
    fn test_fetch_order_does_not_matter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let forward = LazyChildren::new(5, Growing { calls: calls.clone() });
        let backward = LazyChildren::new(5, Growing { calls: calls.clone() });

        let a: Vec<_> = (0..5).map(|i| forward.get(i).unwrap()).collect();
        let b: Vec<_> = (0..5).rev().map(|i| backward.get(i).unwrap()).collect();
        for (x, y) in a.iter().zip(b.iter().rev()) {
            assert_eq!((x.start, x.end), (y.start, y.end));
        }
        assert_eq!((a[4].start, a[4].end), (10, 15));
    }

    #[test]
    fn test_children_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = LazyChildren::new(3, Growing { calls: calls.clone() });
        lazy.get(2).unwrap();
        lazy.get(2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.materialized(), 1);
    }

    #[test]
    fn test_out_of_range() {
        let lazy = LazyChildren::new(1, Growing { calls: Arc::default() });
        assert!(matches!(
            lazy.get(1),
            Err(Error::IndexOutOfRange { index: 1, count: 1 })
        ));
    }

    #[test]
    fn test_concurrent_readers_share_one_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = Arc::new(LazyChildren::new(64, Growing { calls: calls.clone() }));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lazy = Arc::clone(&lazy);
                std::thread::spawn(move || lazy.get(63).unwrap().start)
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), (0..63).map(|i| i + 1).sum::<usize>());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
