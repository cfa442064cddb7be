//! Stem Cache: a bounded raw-term → stemmed-term cache with clock
//! (second-chance) replacement.
//!
//! The stemmer itself is an external collaborator; this module only
//! amortises the cost of calling it by remembering recent results.
//! Capacity is fixed at construction; no operation ever grows the cache
//! or propagates an allocation failure to the caller, since a cache miss
//! is always safe to fall back to "stem without caching this call".

#[derive(Debug, Clone)]
struct Slot {
    raw: Vec<u8>,
    stemmed: Vec<u8>,
    ref_count: u8,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
}

impl Stats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Fixed-capacity clock cache. `slots[cursor]` is the next eviction
/// candidate; a hit or fresh insert resets that slot's reference count
/// to 2 so it survives at least two sweeps before being considered again.
pub struct StemCache {
    capacity: usize,
    slots: Vec<Option<Slot>>,
    cursor: usize,
    stats: Stats,
}

impl StemCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "stem cache capacity must be at least 1");
        Self {
            capacity,
            slots: vec![None; capacity],
            cursor: 0,
            stats: Stats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    fn find(&self, raw: &[u8]) -> Option<usize> {
        self.slots.iter().position(|slot| matches!(slot, Some(s) if s.raw == raw))
    }

    /// Looks up `raw`; on a hit returns the cached stemmed form and bumps
    /// its reference count back to 2. On a miss, returns `None` and the
    /// caller is expected to stem externally and call [`StemCache::insert`].
    pub fn lookup(&mut self, raw: &[u8]) -> Option<Vec<u8>> {
        if let Some(idx) = self.find(raw) {
            self.stats.hits += 1;
            let slot = self.slots[idx].as_mut().unwrap();
            slot.ref_count = 2;
            Some(slot.stemmed.clone())
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Stems `raw` through `stemmer`, caching the result and returning it.
    /// Equivalent to the spec's `stem(cache, term_buffer)` contract,
    /// expressed here as returning the stemmed form rather than rewriting
    /// a caller-owned buffer in place.
    pub fn stem(&mut self, raw: &[u8], stemmer: impl FnOnce(&[u8]) -> Vec<u8>) -> Vec<u8> {
        if let Some(hit) = self.lookup(raw) {
            return hit;
        }
        let stemmed = stemmer(raw);
        self.insert(raw, &stemmed);
        stemmed
    }

    /// Inserts a fresh `(raw, stemmed)` pair, allocating a free slot or
    /// evicting via the clock algorithm. Never fails: if eviction and
    /// reuse of a slot's storage genuinely cannot proceed, the slot is
    /// dropped and the pair is simply not cached.
    pub fn insert(&mut self, raw: &[u8], stemmed: &[u8]) {
        if let Some(idx) = self.find(raw) {
            let slot = self.slots[idx].as_mut().unwrap();
            slot.stemmed = stemmed.to_vec();
            slot.ref_count = 2;
            return;
        }

        let new_slot = Slot {
            raw: raw.to_vec(),
            stemmed: stemmed.to_vec(),
            ref_count: 2,
        };

        if let Some(free_idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[free_idx] = Some(new_slot);
            return;
        }

        if let Some(victim) = self.clock_evict() {
            self.slots[victim] = Some(new_slot);
        }
        // Growth/eviction failure: fall back to uncached stemming for
        // this call. With an in-memory Vec-backed slot there is no
        // growth step that can fail, so this path is unreachable today,
        // but callers must not assume `insert` always leaves an entry
        // behind.
    }

    /// Advances the clock hand, decrementing reference counts, until it
    /// finds a slot with a zero count, which becomes the eviction victim.
    fn clock_evict(&mut self) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        for _ in 0..(2 * self.capacity) {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % self.capacity;
            match &mut self.slots[idx] {
                Some(slot) if slot.ref_count == 0 => return Some(idx),
                Some(slot) => slot.ref_count -= 1,
                None => return Some(idx),
            }
        }
        Some(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upper(raw: &[u8]) -> Vec<u8> {
        raw.to_ascii_uppercase()
    }

    #[test]
    fn miss_then_hit_round_trips_stemmed_value() {
        let mut cache = StemCache::new(4);
        assert_eq!(cache.stem(b"running", upper), b"RUNNING".to_vec());
        assert_eq!(cache.stats().misses, 1);

        assert_eq!(cache.stem(b"running", upper), b"RUNNING".to_vec());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn capacity_one_cycles_between_two_inputs_without_growth() {
        let mut cache = StemCache::new(1);
        cache.stem(b"a", upper);
        cache.stem(b"b", upper);
        assert_eq!(cache.len(), 1);
        cache.stem(b"a", upper);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn repeat_sequence_reaches_full_hit_ratio_after_cache_fills() {
        let mut cache = StemCache::new(4);
        let sequence: [&[u8]; 8] = [b"sing", b"sang", b"sung", b"song", b"sing", b"sang", b"sung", b"song"];

        for term in &sequence[..4] {
            cache.stem(term, upper);
        }
        assert_eq!(cache.len(), 4);
        let stats_after_fill = cache.stats();
        assert_eq!(stats_after_fill.misses, 4);

        for term in &sequence[4..] {
            cache.stem(term, upper);
        }
        let hits_in_second_half = cache.stats().hits;
        assert_eq!(hits_in_second_half, 4);
    }

    #[test]
    fn eviction_makes_room_for_a_new_term_once_capacity_is_exceeded() {
        let mut cache = StemCache::new(2);
        cache.stem(b"one", upper);
        cache.stem(b"two", upper);
        cache.stem(b"three", upper);
        assert_eq!(cache.len(), 2);
    }
}
