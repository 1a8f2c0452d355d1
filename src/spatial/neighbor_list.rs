use std::mem;

use log::{debug, warn};

use crate::{
    accelerator::{Accelerator, Allocation, LaunchConfig, Residency},
    arrangement::{Arrangement, BlockTask, SlotRange},
    concurrency::split_ranges_mut,
    error::{AcceleratorError, AllocationError, InvariantViolation},
    floating_type_mod::FT,
    scan::exclusive_scan,
    V3,
};

/// One staged candidate: sorted slot and position.
type TileEntry = (u32, V3);

/// Neighbors of every arranged particle in CSR layout, indexed by sorted slot.
///
/// `offsets` holds `middle + 1` entries so that the list of slot `i` is
/// `neighbors[offsets[i]..offsets[i + 1]]`.
pub struct NeighborList {
    work_group_size: usize,
    middle: usize,
    counts: Allocation<u32>,
    offsets: Allocation<u32>,
    neighbors: Allocation<u32>,
}

impl NeighborList {
    pub fn new(
        accel: &Accelerator,
        capacity: usize,
        neighbors_per_particle_hint: usize,
        work_group_size: usize,
    ) -> Result<NeighborList, AllocationError> {
        let initial_len = capacity
            .checked_mul(neighbors_per_particle_hint)
            .ok_or(AllocationError::CapacityOverflow {
                len: capacity,
                element_size: neighbors_per_particle_hint * mem::size_of::<u32>(),
            })?;

        Ok(NeighborList {
            work_group_size,
            middle: 0,
            counts: accel.allocate(capacity, Residency::Device)?,
            offsets: accel.allocate(capacity + 1, Residency::Device)?,
            neighbors: accel.allocate(initial_len, Residency::Device)?,
        })
    }

    /// Builds the lists of all particles arranged by `arrangement`. `positions` are the
    /// cell-sorted positions the arrangement left in the device buffer.
    ///
    /// Returns the total number of neighbor entries.
    pub fn build(
        &mut self,
        accel: &Accelerator,
        arrangement: &Arrangement,
        positions: &[V3],
        radius: FT,
    ) -> Result<usize, AcceleratorError> {
        let middle = arrangement.middle();
        assert!(middle < self.offsets.len(), "neighbor list is smaller than the arrangement");
        assert!(positions.len() >= middle);
        self.clear();

        let tasks = arrangement.block_tasks();
        let threads_per_group = arrangement.block_particle_limit();
        let tile_capacity = tile_capacity(accel);
        let config = LaunchConfig::new(tasks.len(), threads_per_group)
            .with_shared_memory(tile_capacity * mem::size_of::<TileEntry>());
        let radius2 = radius * radius;

        // count pass
        {
            let parts = split_ranges_mut(&mut self.counts[..middle], tasks.iter().map(|t| t.particles()));
            accel.launch_partitioned("count_neighbors", config, parts, |group, counts| {
                let task = &tasks[group.id];
                counts.iter_mut().for_each(|c| *c = 0);
                visit_pairs(task, arrangement.footprint(task), positions, radius2, tile_capacity, |local, _| {
                    counts[local] += 1;
                });
            })?;
        }

        let total = exclusive_scan(
            accel,
            self.work_group_size,
            &self.counts[..middle],
            &mut self.offsets[..middle],
        )? as usize;
        self.offsets[middle] = total as u32;

        self.ensure_neighbor_capacity(accel, total)?;

        // fill pass
        {
            let offsets = &self.offsets[..];
            let counts = &self.counts[..];
            let parts = split_ranges_mut(
                &mut self.neighbors[..total],
                tasks
                    .iter()
                    .map(|t| offsets[t.particle_begin as usize] as usize..offsets[t.particle_end as usize] as usize),
            );
            accel.launch_partitioned("fill_neighbors", config, parts, |group, neighbors| {
                let task = &tasks[group.id];
                let base = offsets[task.particle_begin as usize];

                // per-particle write cursors, relative to the start of this block's run
                let mut cursors: Vec<u32> = task.particles().map(|slot| offsets[slot] - base).collect();
                visit_pairs(task, arrangement.footprint(task), positions, radius2, tile_capacity, |local, neighbor| {
                    let slot = task.particle_begin as usize + local;
                    let cursor = cursors[local];
                    assert!(
                        cursor < offsets[slot + 1] - base,
                        "slot {} found more neighbors than its count {}",
                        slot,
                        counts[slot]
                    );
                    neighbors[cursor as usize] = neighbor;
                    cursors[local] += 1;
                });

                for (local, slot) in task.particles().enumerate() {
                    assert_eq!(
                        cursors[local],
                        offsets[slot + 1] - base,
                        "slot {} found fewer neighbors than its count {}",
                        slot,
                        counts[slot]
                    );
                }
            })?;
        }

        self.middle = middle;
        debug!("built neighbor lists for {} particles, {} entries", middle, total);

        Ok(total)
    }

    fn ensure_neighbor_capacity(&mut self, accel: &Accelerator, total: usize) -> Result<(), AllocationError> {
        if total <= self.neighbors.len() {
            return Ok(());
        }

        let grown = total + total / 4;
        warn!(
            "neighbor array too small ({} < {} entries), growing to {}",
            self.neighbors.len(),
            total,
            grown
        );
        // release the old reservation first so that both arrays never count against the budget at once
        self.neighbors = accel.allocate(0, Residency::Device)?;
        self.neighbors = accel.allocate(grown, Residency::Device)?;
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.middle = 0;
    }

    /// Number of particles the lists were built for.
    pub fn middle(&self) -> usize {
        self.middle
    }

    pub fn total(&self) -> usize {
        self.offsets[self.middle] as usize
    }

    /// Length of the flat neighbor array, i.e. how many entries fit without growing.
    pub fn neighbor_capacity(&self) -> usize {
        self.neighbors.len()
    }

    pub fn count(&self, slot: usize) -> usize {
        assert!(slot < self.middle, "slot {} out of range ({})", slot, self.middle);
        self.counts[slot] as usize
    }

    pub fn offset(&self, slot: usize) -> usize {
        assert!(slot <= self.middle, "slot {} out of range ({})", slot, self.middle);
        self.offsets[slot] as usize
    }

    /// Sorted slots of all neighbors of `slot`, in ascending order.
    pub fn neighbors_of(&self, slot: usize) -> &[u32] {
        let begin = self.offset(slot);
        &self.neighbors[begin..begin + self.count(slot)]
    }

    pub fn neighbor(&self, slot: usize, k: usize) -> u32 {
        let list = self.neighbors_of(slot);
        assert!(k < list.len(), "neighbor {} of slot {} out of range ({})", k, slot, list.len());
        list[k]
    }

    pub fn get(&self, slot: usize, k: usize) -> Option<u32> {
        if slot >= self.middle {
            return None;
        }
        self.neighbors_of(slot).get(k).copied()
    }

    /// Checks the CSR table and the neighbor ids of the last build.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let middle = self.middle;
        let mut expected = 0;
        for slot in 0..=middle {
            let offset = self.offsets[slot] as usize;
            if offset != expected {
                return Err(InvariantViolation::NeighborOffsetMismatch { slot, offset, expected });
            }
            if slot < middle {
                expected += self.counts[slot] as usize;
            }
        }

        for slot in 0..middle {
            for &neighbor in self.neighbors_of(slot) {
                let neighbor = neighbor as usize;
                if neighbor >= middle {
                    return Err(InvariantViolation::NeighborOutOfRange { slot, neighbor, middle });
                }
                if neighbor == slot {
                    return Err(InvariantViolation::SelfNeighbor(slot));
                }
            }
        }

        Ok(())
    }
}

/// Candidates that fit into the shared memory of one work-group.
fn tile_capacity(accel: &Accelerator) -> usize {
    (accel.properties().shared_memory_per_group / mem::size_of::<TileEntry>()).max(1)
}

/// Calls `f(local, neighbor_slot)` for every pair of a particle of `task` and a footprint particle
/// within `sqrt(radius2)`, except the particle itself.
///
/// The footprint is staged tile by tile; within one particle the neighbor slots come in ascending order.
fn visit_pairs(
    task: &BlockTask,
    footprint: &[SlotRange],
    positions: &[V3],
    radius2: FT,
    tile_capacity: usize,
    mut f: impl FnMut(usize, u32),
) {
    let block = &positions[task.particles()];
    let mut tile: Vec<TileEntry> = Vec::with_capacity(tile_capacity);

    let mut flush = |tile: &mut Vec<TileEntry>| {
        for (local, p) in block.iter().enumerate() {
            let slot = task.particle_begin + local as u32;
            for &(candidate, q) in tile.iter() {
                if candidate != slot && (q - p).norm_squared() <= radius2 {
                    f(local, candidate);
                }
            }
        }
        tile.clear();
    };

    for range in footprint {
        for candidate in range.begin..range.end {
            tile.push((candidate, positions[candidate as usize]));
            if tile.len() == tile_capacity {
                flush(&mut tile);
            }
        }
    }
    if !tile.is_empty() {
        flush(&mut tile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accelerator::test_accelerator, grid_parameters::GridParameters, particle_buffer::ParticleBuffer,
        search_parameters::{AcceleratorParams, DomainParams},
        vec3f,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    struct Built {
        positions: Vec<V3>,
        arrangement: Arrangement,
        list: NeighborList,
    }

    fn build(accel: &Accelerator, radius: FT, extent: FT, positions: &[V3], hint: usize, block_limit: usize) -> Built {
        let n = positions.len();
        let grid = GridParameters::new(radius, &DomainParams::new(extent, extent, extent)).unwrap();
        let mut buffer = ParticleBuffer::allocate(accel, n, Residency::Device).unwrap();
        let scratch = buffer.allocate_sub_buffer().unwrap();
        let mut arrangement = Arrangement::new(accel, grid, n, 64, block_limit).unwrap();
        let mut list = NeighborList::new(accel, n, hint, 64).unwrap();

        buffer.positions_mut().copy_from_slice(positions);
        arrangement.arrange(accel, &mut buffer, &scratch, n).unwrap();
        list.build(accel, &arrangement, buffer.positions(), radius).unwrap();

        Built {
            positions: buffer.positions().to_vec(),
            arrangement,
            list,
        }
    }

    fn brute_force(positions: &[V3], radius: FT, slot: usize) -> Vec<u32> {
        (0..positions.len())
            .filter(|&j| j != slot && (positions[j] - positions[slot]).norm_squared() <= radius * radius)
            .map(|j| j as u32)
            .collect()
    }

    #[test]
    fn matches_brute_force() {
        let accel = test_accelerator();
        let mut rng = StdRng::seed_from_u64(11);
        let positions: Vec<V3> = (0..1200)
            .map(|_| vec3f(rng.gen_range(0.0..2.0), rng.gen_range(0.0..2.0), rng.gen_range(0.0..2.0)))
            .collect();
        let radius = 0.25;
        let built = build(&accel, radius, 2., &positions, 8, 32);

        built.list.validate().unwrap();
        for slot in 0..positions.len() {
            assert_eq!(built.list.neighbors_of(slot), &brute_force(&built.positions, radius, slot)[..]);
        }
        assert_eq!(built.arrangement.middle(), 1200);
    }

    #[test]
    fn small_tiles_give_the_same_lists() {
        let mut rng = StdRng::seed_from_u64(12);
        let positions: Vec<V3> = (0..500)
            .map(|_| vec3f(rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)))
            .collect();

        let roomy = build(&test_accelerator(), 0.2, 1., &positions, 16, 64);
        let tight_accel = Accelerator::new(&AcceleratorParams {
            compute_units: Some(3),
            shared_memory_per_group: 5 * mem::size_of::<TileEntry>(),
            ..AcceleratorParams::default()
        })
        .unwrap();
        let tight = build(&tight_accel, 0.2, 1., &positions, 16, 64);

        for slot in 0..positions.len() {
            assert_eq!(roomy.list.neighbors_of(slot), tight.list.neighbors_of(slot));
        }
    }

    #[test]
    fn neighbor_array_grows_when_needed() {
        let accel = test_accelerator();
        // all particles within the radius of each other
        let positions: Vec<V3> = (0..40).map(|i| vec3f(0.5 + i as FT * 0.001, 0.5, 0.5)).collect();
        let built = build(&accel, 1., 2., &positions, 1, 256);

        assert_eq!(built.list.total(), 40 * 39);
        assert!(built.list.neighbor_capacity() >= 40 * 39);
        built.list.validate().unwrap();
        assert!((0..40).all(|slot| built.list.count(slot) == 39));
    }

    #[test]
    fn accessors_are_bounds_checked() {
        let accel = test_accelerator();
        let positions = vec![vec3f(0.2, 0.2, 0.2), vec3f(0.4, 0.2, 0.2)];
        let built = build(&accel, 0.5, 1., &positions, 4, 32);

        assert_eq!(built.list.count(0), 1);
        assert_eq!(built.list.neighbor(0, 0), 1);
        assert_eq!(built.list.get(1, 0), Some(0));
        assert_eq!(built.list.get(1, 1), None);
        assert_eq!(built.list.get(2, 0), None);
        assert_eq!(built.list.offset(2), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn neighbor_index_past_count_panics() {
        let accel = test_accelerator();
        let positions = vec![vec3f(0.2, 0.2, 0.2), vec3f(0.9, 0.9, 0.9)];
        let built = build(&accel, 0.5, 1., &positions, 4, 32);
        built.list.neighbor(0, 0);
    }

    #[test]
    fn injected_fill_failure_is_reported() {
        let accel = test_accelerator();
        let positions = vec![vec3f(0.2, 0.2, 0.2), vec3f(0.4, 0.2, 0.2)];
        let grid = GridParameters::new(0.5, &DomainParams::new(1., 1., 1.)).unwrap();
        let mut buffer = ParticleBuffer::allocate(&accel, 2, Residency::Device).unwrap();
        let scratch = buffer.allocate_sub_buffer().unwrap();
        let mut arrangement = Arrangement::new(&accel, grid, 2, 64, 64).unwrap();
        let mut list = NeighborList::new(&accel, 2, 4, 64).unwrap();

        buffer.positions_mut().copy_from_slice(&positions);
        arrangement.arrange(&accel, &mut buffer, &scratch, 2).unwrap();
        assert_eq!(list.build(&accel, &arrangement, buffer.positions(), 0.5).unwrap(), 2);
        assert_eq!(list.middle(), 2);

        accel.inject_failure("fill_neighbors");
        let err = list.build(&accel, &arrangement, buffer.positions(), 0.5).unwrap_err();
        assert!(matches!(err, AcceleratorError::InjectedFault("fill_neighbors")));
        assert_eq!(list.middle(), 0);
        assert_eq!(list.get(0, 0), None);
    }
}
