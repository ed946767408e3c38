//! Kernel cache: set-associative, tag-compared, LRU.
//!
//! Slots live in one flat array (`sets * ways`); a signature's set is its
//! hash modulo the set count, and every way in the set is compared against
//! the full signature, so two different shapes never alias even if their
//! hashes collide. Inserting into a full set evicts its least recently used
//! way. Evictions are counted, not treated as errors.

use crate::compiler::executable::CodeBlock;
use crate::types::KernelSignature;

/// Ways per set when capacity allows.
pub const CACHE_WAYS: usize = 8;

/// A compiled kernel resident in the cache.
#[derive(Debug)]
pub struct CachedKernel {
    pub signature: KernelSignature,
    pub hash: u64,
    pub block: CodeBlock,
    /// Logical clock value of the last lookup hit or insert.
    pub last_used: u64,
}

impl CachedKernel {
    pub fn new(signature: KernelSignature, block: CodeBlock) -> Self {
        Self { hash: signature.hash64(), signature, block, last_used: 0 }
    }
}

/// Counters the cache maintains itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    /// Unrelated kernels displaced by an insert into a full set.
    pub evictions: u64,
}

pub struct KernelCache {
    slots: Vec<Option<CachedKernel>>,
    ways: usize,
    sets: usize,
    clock: u64,
    stats: CacheStats,
}

impl KernelCache {
    /// Cache with room for at least `capacity` kernels.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let ways = CACHE_WAYS.min(capacity);
        let sets = capacity.div_ceil(ways);
        let mut slots = Vec::with_capacity(sets * ways);
        slots.resize_with(sets * ways, || None);
        Self { slots, ways, sets, clock: 0, stats: CacheStats::default() }
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Executable bytes held by resident kernels (page-rounded).
    pub fn code_bytes(&self) -> usize {
        self.iter().map(|k| k.block.capacity()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedKernel> {
        self.slots.iter().flatten()
    }

    fn set_range(&self, hash: u64) -> std::ops::Range<usize> {
        let set = (hash % self.sets as u64) as usize;
        set * self.ways..(set + 1) * self.ways
    }

    fn find(&self, sig: &KernelSignature, hash: u64) -> Option<usize> {
        self.set_range(hash).find(|&i| {
            self.slots[i]
                .as_ref()
                .is_some_and(|k| k.hash == hash && k.signature == *sig)
        })
    }

    /// Look up `sig`, refreshing its LRU stamp on a hit.
    pub fn lookup(&mut self, sig: &KernelSignature) -> Option<&mut CachedKernel> {
        let i = self.lookup_slot(sig)?;
        self.slots[i].as_mut()
    }

    /// [`lookup`](Self::lookup), returning the slot index instead.
    pub fn lookup_slot(&mut self, sig: &KernelSignature) -> Option<usize> {
        let hash = sig.hash64();
        match self.find(sig, hash) {
            Some(i) => {
                self.clock += 1;
                self.stats.hits += 1;
                if let Some(kernel) = self.slots[i].as_mut() {
                    kernel.last_used = self.clock;
                }
                Some(i)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Read-only probe: no LRU update, no hit/miss accounting.
    pub fn get(&self, sig: &KernelSignature) -> Option<&CachedKernel> {
        self.find(sig, sig.hash64()).and_then(|i| self.slots[i].as_ref())
    }

    /// Insert `kernel`, returning the slot index and whatever it displaced.
    ///
    /// Placement order: the slot already holding the same signature, then a
    /// free way, then the set's least recently used way.
    pub fn insert(&mut self, mut kernel: CachedKernel) -> (usize, Option<CachedKernel>) {
        self.clock += 1;
        kernel.last_used = self.clock;
        self.stats.insertions += 1;

        let range = self.set_range(kernel.hash);
        if let Some(i) = self.find(&kernel.signature, kernel.hash) {
            let old = self.slots[i].replace(kernel);
            return (i, old);
        }
        if let Some(i) = range.clone().find(|&i| self.slots[i].is_none()) {
            self.slots[i] = Some(kernel);
            return (i, None);
        }
        let victim = range
            .min_by_key(|&i| self.slots[i].as_ref().map_or(0, |k| k.last_used))
            .unwrap_or(0);
        let evicted = self.slots[victim].replace(kernel);
        if let Some(old) = &evicted {
            self.stats.evictions += 1;
            log::debug!("kernel cache: evicted {} from set slot {victim}", old.signature);
        }
        (victim, evicted)
    }

    /// Kernel at a slot index returned by [`insert`](Self::insert).
    pub fn slot(&self, index: usize) -> Option<&CachedKernel> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut CachedKernel> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Forget every kernel. The executable pages are not released.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}
