// vim: tw=80
//! The Pattern Registry
//!
//! Issues patterns, and remembers which pattern was most recently written, and
//! acknowledged, over each region of each volume.  One registry lives for an
//! entire test run, so that patterns stay distinguishable across scenarios
//! that reuse a volume.

use rand::Rng;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use crate::{
    pattern::{Pattern, PatternId},
    types::{Region, VolumeId},
    writer::WriteRecord,
};

#[derive(Default)]
struct Inner {
    /// Every pattern ever issued, per volume, in issue order
    issued:    BTreeMap<VolumeId, Vec<Arc<Pattern>>>,
    /// The current `WriteRecord` at each (volume, offset).  No two records on
    /// one volume overlap.
    completed: BTreeMap<(VolumeId, u64), WriteRecord>,
}

pub struct PatternRegistry {
    /// Sequence number of the first pattern issued for any volume
    base:  u64,
    inner: Mutex<Inner>,
}

impl PatternRegistry {
    /// Record that `record`'s write was acknowledged.
    ///
    /// Every older record whose region overlaps `record`'s is retired, since
    /// the device no longer holds all of its pattern.  Returns the retired
    /// records, in offset order.
    pub fn complete(&self, record: WriteRecord) -> Vec<WriteRecord> {
        let volume = record.region.volume;
        let mut inner = self.inner.lock().unwrap();
        let stale = inner
            .completed
            .range((volume, 0)..=(volume, u64::MAX))
            .filter(|(_, r)| r.region.overlaps(&record.region))
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();
        let superseded = stale
            .iter()
            .filter_map(|k| inner.completed.remove(k))
            .collect();
        inner
            .completed
            .insert((volume, record.region.offset), record);
        superseded
    }

    /// The current `WriteRecord` at `region`'s volume and offset, if any.
    pub fn completed(&self, region: Region) -> Option<WriteRecord> {
        self.inner
            .lock()
            .unwrap()
            .completed
            .get(&(region.volume, region.offset))
            .cloned()
    }

    /// How many patterns have been issued for `volume`?
    pub fn issued(&self, volume: VolumeId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .issued
            .get(&volume)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Return the most recently issued pattern for `volume`.
    ///
    /// # Panics
    ///
    /// If no pattern was ever issued for `volume`.
    pub fn latest(&self, volume: VolumeId) -> Arc<Pattern> {
        self.inner
            .lock()
            .unwrap()
            .issued
            .get(&volume)
            .and_then(|v| v.last())
            .cloned()
            .unwrap_or_else(|| panic!("No pattern was issued for volume {volume}"))
    }

    /// Create a registry whose sequence numbers start at a random base, so
    /// that data left behind by a previous run can never match.
    pub fn new() -> Self {
        Self::with_base(rand::thread_rng().gen::<u32>() as u64 * (1 << 32))
    }

    /// Issue a new pattern for `volume`, distinct from every pattern
    /// previously issued for it.
    pub fn new_pattern(&self, volume: VolumeId) -> Arc<Pattern> {
        let mut inner = self.inner.lock().unwrap();
        let v = inner.issued.entry(volume).or_default();
        let seq = self.base + v.len() as u64;
        let pattern = Arc::new(Pattern::new(PatternId { volume, seq }));
        v.push(pattern.clone());
        pattern
    }

    /// Return the `index`th pattern ever issued for `volume`.
    ///
    /// Multiple writers sharing a volume use this to recall their own patterns.
    ///
    /// # Panics
    ///
    /// If fewer than `index + 1` patterns were issued for `volume`.
    pub fn pattern(&self, volume: VolumeId, index: usize) -> Arc<Pattern> {
        self.inner
            .lock()
            .unwrap()
            .issued
            .get(&volume)
            .and_then(|v| v.get(index))
            .cloned()
            .unwrap_or_else(|| {
                panic!("Pattern {index} was never issued for volume {volume}")
            })
    }

    /// All current `WriteRecord`s for `volume`, in offset order
    pub fn records(&self, volume: VolumeId) -> Vec<WriteRecord> {
        self.inner
            .lock()
            .unwrap()
            .completed
            .range((volume, 0)..=(volume, u64::MAX))
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Create a registry whose sequence numbers start at `base`.
    pub fn with_base(base: u64) -> Self {
        PatternRegistry {
            base,
            inner: Mutex::default(),
        }
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}
