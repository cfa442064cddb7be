//! Free-Space Map: tracks which byte ranges of which files are unused.
//!
//! Kept deliberately dumb: a best-fit search over a per-file list of free
//! extents. The stores are the ones with opinions about page sizing and
//! growth; this just answers "where can `size` bytes go" and "this range
//! is free again now."

use crate::error::{Result, StorageError};
use crate::page::PageLocation;
use std::collections::BTreeMap;

/// Guides an allocation beyond plain "give me `size` bytes somewhere."
#[derive(Debug, Clone, Copy)]
pub enum Hint {
    /// No constraint beyond size; pick any free extent.
    Anywhere,
    /// Prefer an extent that fits `size` exactly, to avoid fragmenting a
    /// larger extent for a page that will never grow.
    ExactSize,
    /// Reproduce an allocation observed during a reload: take this exact
    /// location regardless of what the map currently shows there.
    FixedLocation(PageLocation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Extent {
    offset: u64,
    size: u64,
}

#[derive(Default)]
pub struct FreeSpaceMap {
    // Per-file free extents, ordered by offset.
    files: std::collections::HashMap<u32, BTreeMap<u64, u64>>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `size` bytes starting at `offset` in `fileno` as free
    /// capacity available for future allocation, e.g. the untouched tail
    /// of a freshly created file.
    pub fn seed(&mut self, fileno: u32, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.files.entry(fileno).or_default().insert(offset, size);
    }

    pub fn allocate(&mut self, fileno: u32, size: u64, hint: Hint) -> Result<PageLocation> {
        if size == 0 {
            return Err(StorageError::arg("cannot allocate zero bytes"));
        }

        if let Hint::FixedLocation(location) = hint {
            self.take_fixed(location, size)?;
            return Ok(location);
        }

        let extents = self
            .files
            .get_mut(&fileno)
            .ok_or_else(|| StorageError::Mem(format!("no free space tracked for file {fileno}")))?;

        let chosen = match hint {
            Hint::ExactSize => extents
                .iter()
                .find(|(_, &extent_size)| extent_size == size)
                .map(|(&offset, _)| offset),
            _ => extents
                .iter()
                .find(|(_, &extent_size)| extent_size >= size)
                .map(|(&offset, _)| offset),
        };

        let offset = chosen.ok_or_else(|| {
            StorageError::Mem(format!("no free extent of at least {size} bytes in file {fileno}"))
        })?;

        let extent_size = *extents.get(&offset).unwrap();
        extents.remove(&offset);
        if extent_size > size {
            extents.insert(offset + size, extent_size - size);
        }

        Ok(PageLocation::new(fileno, offset))
    }

    fn take_fixed(&mut self, location: PageLocation, size: u64) -> Result<()> {
        let extents = self.files.entry(location.fileno).or_default();
        if let Some((&start, &extent_size)) = extents
            .range(..=location.offset)
            .next_back()
            .filter(|(&start, &extent_size)| {
                location.offset >= start && location.offset + size <= start + extent_size
            })
        {
            extents.remove(&start);
            if start < location.offset {
                extents.insert(start, location.offset - start);
            }
            let tail_start = location.offset + size;
            let tail_end = start + extent_size;
            if tail_start < tail_end {
                extents.insert(tail_start, tail_end - tail_start);
            }
        }
        // If the exact extent isn't tracked (reload replaying a prior
        // allocation) there's nothing to carve out of; that's expected.
        Ok(())
    }

    pub fn free(&mut self, location: PageLocation, size: u64) {
        if size == 0 {
            return;
        }
        let extents = self.files.entry(location.fileno).or_default();
        let mut start = location.offset;
        let mut end = location.offset + size;

        if let Some((&prev_offset, &prev_size)) = extents.range(..start).next_back() {
            if prev_offset + prev_size == start {
                extents.remove(&prev_offset);
                start = prev_offset;
            }
        }

        if let Some((&next_offset, &next_size)) = extents.range(end..).next() {
            if next_offset == end {
                extents.remove(&next_offset);
                end = next_offset + next_size;
            }
        }

        extents.insert(start, end - start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_carves_the_seeded_extent() {
        let mut map = FreeSpaceMap::new();
        map.seed(1, 0, 1000);

        let loc = map.allocate(1, 100, Hint::Anywhere).unwrap();
        assert_eq!(loc, PageLocation::new(1, 0));

        let loc2 = map.allocate(1, 50, Hint::Anywhere).unwrap();
        assert_eq!(loc2, PageLocation::new(1, 100));
    }

    #[test]
    fn allocate_fails_when_nothing_fits() {
        let mut map = FreeSpaceMap::new();
        map.seed(1, 0, 10);
        assert!(map.allocate(1, 100, Hint::Anywhere).is_err());
    }

    #[test]
    fn free_then_reallocate_reuses_space() {
        let mut map = FreeSpaceMap::new();
        map.seed(1, 0, 100);
        let loc = map.allocate(1, 100, Hint::Anywhere).unwrap();
        map.free(loc, 100);
        let loc2 = map.allocate(1, 40, Hint::Anywhere).unwrap();
        assert_eq!(loc2, PageLocation::new(1, 0));
    }

    #[test]
    fn free_coalesces_adjacent_extents() {
        let mut map = FreeSpaceMap::new();
        map.seed(1, 0, 300);
        let a = map.allocate(1, 100, Hint::Anywhere).unwrap();
        let b = map.allocate(1, 100, Hint::Anywhere).unwrap();
        map.free(a, 100);
        map.free(b, 100);
        // The coalesced extent should now satisfy a 200-byte request.
        let big = map.allocate(1, 200, Hint::Anywhere).unwrap();
        assert_eq!(big, PageLocation::new(1, 0));
    }

    #[test]
    fn fixed_location_hint_replays_an_exact_allocation() {
        let mut map = FreeSpaceMap::new();
        map.seed(2, 0, 500);
        let loc = map
            .allocate(2, 64, Hint::FixedLocation(PageLocation::new(2, 128)))
            .unwrap();
        assert_eq!(loc, PageLocation::new(2, 128));
    }
}
