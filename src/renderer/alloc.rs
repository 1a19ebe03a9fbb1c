//! Address-range bookkeeping for large pooled buffers. Nothing here touches device memory, the
//! owner of the pooled buffer maps [`VirtualAllocation::offset`] onto it.

use std::collections::{BTreeMap, BTreeSet};

use ash::vk;
use hashbrown::HashMap;

use super::error::BackendError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualAllocation {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Best-fit allocator over `[0, capacity)`. Free ranges are coalesced with their neighbours on
/// release, so any sequence that stays within capacity on a fragment-free layout succeeds.
pub struct VirtualBlock {
    capacity: vk::DeviceSize,
    /// offset -> size
    free_ranges: BTreeMap<vk::DeviceSize, vk::DeviceSize>,
    /// (size, offset), ordered for best-fit lookup
    free_by_size: BTreeSet<(vk::DeviceSize, vk::DeviceSize)>,
    /// offset -> (size, padding before offset)
    live: HashMap<vk::DeviceSize, (vk::DeviceSize, vk::DeviceSize)>,
    free_bytes: vk::DeviceSize,
}

impl VirtualBlock {
    pub fn new(capacity: vk::DeviceSize) -> VirtualBlock {
        let mut block = VirtualBlock {
            capacity,
            free_ranges: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            live: HashMap::new(),
            free_bytes: 0,
        };
        if capacity > 0 {
            block.insert_free(0, capacity);
        }
        block
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    pub fn free_bytes(&self) -> vk::DeviceSize {
        self.free_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// `alignment` can be any multiple, not only a power of two, so that vertex ranges can start
    /// on a whole vertex.
    pub fn allocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<VirtualAllocation, BackendError> {
        let alignment = alignment.max(1);
        let exhausted = || BackendError::CapacityExhausted {
            requested: size,
            alignment,
            free: self.free_bytes,
            capacity: self.capacity,
        };
        if size == 0 {
            return Err(exhausted());
        }

        let candidate = self
            .free_by_size
            .range((size, 0)..)
            .find(|&&(range_size, range_offset)| {
                let aligned = align_up(range_offset, alignment);
                aligned - range_offset + size <= range_size
            })
            .copied();
        let (range_size, range_offset) = match candidate {
            Some(range) => range,
            None => return Err(exhausted()),
        };

        self.remove_free(range_offset, range_size);
        let offset = align_up(range_offset, alignment);
        let padding = offset - range_offset;
        let tail = range_size - padding - size;
        if tail > 0 {
            self.insert_free(offset + size, tail);
        }
        // Alignment padding stays with the allocation and comes back on free.
        self.live.insert(offset, (size, padding));

        Ok(VirtualAllocation { offset, size })
    }

    pub fn free(&mut self, allocation: VirtualAllocation) {
        let (size, padding) = match self.live.remove(&allocation.offset) {
            Some(entry) => entry,
            None => {
                debug_assert!(false, "double free of virtual allocation at {}", allocation.offset);
                return;
            }
        };
        debug_assert_eq!(size, allocation.size, "virtual allocation size mismatch");

        let mut start = allocation.offset - padding;
        let mut end = allocation.offset + size;

        if let Some((&prev_offset, &prev_size)) = self.free_ranges.range(..start).next_back() {
            if prev_offset + prev_size == start {
                self.remove_free(prev_offset, prev_size);
                start = prev_offset;
            }
        }
        if let Some(&next_size) = self.free_ranges.get(&end) {
            self.remove_free(end, next_size);
            end += next_size;
        }

        self.insert_free(start, end - start);
    }

    /// Forgets every allocation.
    pub fn reset(&mut self) {
        *self = VirtualBlock::new(self.capacity);
    }

    fn insert_free(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        self.free_ranges.insert(offset, size);
        self.free_by_size.insert((size, offset));
        self.free_bytes += size;
    }

    fn remove_free(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        self.free_ranges.remove(&offset);
        self.free_by_size.remove(&(size, offset));
        self.free_bytes -= size;
    }
}

pub(crate) fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    (value + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn assert_disjoint(live: &[VirtualAllocation]) {
        let mut sorted = live.to_vec();
        sorted.sort_by_key(|a| a.offset);
        for pair in sorted.windows(2) {
            assert!(
                pair[0].offset + pair[0].size <= pair[1].offset,
                "{:?} overlaps {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn split_and_merge() {
        let mut block = VirtualBlock::new(1024);

        let a = block.allocate(512, 1).unwrap();
        let b = block.allocate(512, 1).unwrap();
        assert!(matches!(
            block.allocate(512, 1),
            Err(BackendError::CapacityExhausted { free: 0, .. })
        ));

        block.free(a);
        block.free(b);

        let whole = block.allocate(1024, 1).unwrap();
        assert_eq!(whole.offset, 0);
        block.free(whole);

        let mut small = (0..64).map(|_| block.allocate(16, 1).unwrap()).collect::<Vec<_>>();
        assert!(block.allocate(16, 1).is_err());
        assert_disjoint(&small);
        for allocation in small.drain(..).rev() {
            block.free(allocation);
        }
        assert_eq!(block.free_bytes(), 1024);
        assert_eq!(block.allocate(1024, 1).unwrap().offset, 0);
    }

    #[test]
    fn best_fit_prefers_the_tightest_hole() {
        let mut block = VirtualBlock::new(1000);
        let a = block.allocate(100, 1).unwrap();
        let _b = block.allocate(10, 1).unwrap();
        let c = block.allocate(40, 1).unwrap();
        let _d = block.allocate(10, 1).unwrap();
        block.free(a);
        block.free(c);

        let fit = block.allocate(30, 1).unwrap();
        assert_eq!(fit.offset, c.offset);
    }

    #[test]
    fn alignment_padding_is_reclaimed() {
        let mut block = VirtualBlock::new(256);
        let odd = block.allocate(3, 1).unwrap();
        let aligned = block.allocate(64, 64).unwrap();
        assert_eq!(aligned.offset % 64, 0);
        block.free(aligned);
        block.free(odd);
        assert_eq!(block.free_bytes(), 256);
        assert_eq!(block.allocate(256, 1).unwrap().offset, 0);
    }

    #[test]
    fn alignment_need_not_be_a_power_of_two() {
        let mut block = VirtualBlock::new(256);
        block.allocate(20, 1).unwrap();
        let vertices = block.allocate(36, 48).unwrap();
        assert_eq!(vertices.offset, 48);
        let next = block.allocate(24, 48).unwrap();
        assert_eq!(next.offset, 96);
    }

    #[test]
    fn zero_sized_requests_fail() {
        let mut block = VirtualBlock::new(64);
        assert!(block.allocate(0, 1).is_err());
    }

    #[test]
    fn random_churn_never_overlaps() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut block = VirtualBlock::new(1 << 20);
        let mut live: Vec<VirtualAllocation> = vec![];

        for _ in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..4096);
                let alignment = 1 << rng.gen_range(0..8);
                match block.allocate(size, alignment) {
                    Ok(allocation) => {
                        assert_eq!(allocation.offset % alignment, 0);
                        assert!(allocation.offset + allocation.size <= block.capacity());
                        live.push(allocation);
                    }
                    Err(BackendError::CapacityExhausted { .. }) => {
                        let victim = live.swap_remove(rng.gen_range(0..live.len()));
                        block.free(victim);
                    }
                    Err(other) => panic!("unexpected error {other}"),
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                block.free(victim);
            }
        }
        assert_disjoint(&live);
        assert_eq!(block.live_allocations(), live.len());

        for allocation in live.drain(..) {
            block.free(allocation);
        }
        assert_eq!(block.free_bytes(), block.capacity());
    }
}
