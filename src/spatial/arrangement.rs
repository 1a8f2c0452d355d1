use std::{
    ops::Range,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use log::{debug, warn};

use crate::{
    accelerator::{Accelerator, Allocation, LaunchConfig, Residency},
    concurrency::split_ranges_mut,
    error::{AcceleratorError, AllocationError, InvariantViolation},
    grid_parameters::GridParameters,
    particle_buffer::{ParticleBuffer, ScratchView},
    scan::exclusive_scan,
    thread_safe_ptr::ThreadSafeMutPtr,
};

/// Half-open range of sorted slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub begin: u32,
    pub end: u32,
}

impl SlotRange {
    pub fn range(&self) -> Range<usize> {
        self.begin as usize..self.end as usize
    }

    pub fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Work unit of the neighbor search: a run of cells within one grid row and the particles
/// sorted into them. One block task is processed by one work-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTask {
    pub cell_begin: u32,
    pub cell_end: u32,
    pub particle_begin: u32,
    pub particle_end: u32,
    footprint_begin: u32,
    footprint_end: u32,
}

impl BlockTask {
    pub fn cells(&self) -> Range<usize> {
        self.cell_begin as usize..self.cell_end as usize
    }

    pub fn particles(&self) -> Range<usize> {
        self.particle_begin as usize..self.particle_end as usize
    }

    pub fn num_particles(&self) -> usize {
        (self.particle_end - self.particle_begin) as usize
    }
}

/// Cell-sorted order of the particles plus everything the neighbor search needs to walk it.
/// Rebuilt from scratch by every [`arrange`](Arrangement::arrange).
pub struct Arrangement {
    grid: GridParameters,
    capacity: usize,
    work_group_size: usize,
    block_particle_limit: usize,

    middle: usize,
    clamped: usize,

    // per original particle
    cell_index: Allocation<u32>,
    part2idx: Allocation<u32>,

    // per sorted slot
    idx2part: Allocation<u32>,

    // per cell
    cell_counter: Allocation<AtomicU32>,
    cell_nump: Allocation<u32>,
    cell_offset: Allocation<u32>,

    block_tasks: Vec<BlockTask>,
    footprints: Vec<SlotRange>,
}

impl Arrangement {
    pub fn new(
        accel: &Accelerator,
        grid: GridParameters,
        capacity: usize,
        work_group_size: usize,
        block_particle_limit: usize,
    ) -> Result<Arrangement, AllocationError> {
        assert!(work_group_size > 0 && block_particle_limit > 0);
        let num_cells = grid.num_cells();

        Ok(Arrangement {
            grid,
            capacity,
            work_group_size,
            block_particle_limit,
            middle: 0,
            clamped: 0,
            cell_index: accel.allocate(capacity, Residency::Device)?,
            part2idx: accel.allocate(capacity, Residency::Device)?,
            idx2part: accel.allocate(capacity, Residency::Device)?,
            cell_counter: accel.allocate(num_cells, Residency::Device)?,
            cell_nump: accel.allocate(num_cells, Residency::Device)?,
            cell_offset: accel.allocate(num_cells, Residency::Device)?,
            block_tasks: Vec::new(),
            footprints: Vec::new(),
        })
    }

    /// Sorts the first `num_particles` positions of `buffer` by cell (in place, using `scratch`)
    /// and rebuilds permutation, cell table and block tasks. Returns the number of arranged particles.
    pub fn arrange(
        &mut self,
        accel: &Accelerator,
        buffer: &mut ParticleBuffer,
        scratch: &ScratchView,
        num_particles: usize,
    ) -> Result<usize, AcceleratorError> {
        assert!(num_particles <= self.capacity, "{} particles exceed capacity {}", num_particles, self.capacity);
        assert!(buffer.capacity() >= self.capacity);
        self.clear();

        let n = num_particles;
        let wg = self.work_group_size;
        let grid = self.grid;
        let num_cells = grid.num_cells();

        let Arrangement {
            cell_index,
            part2idx,
            idx2part,
            cell_counter,
            cell_nump,
            cell_offset,
            ..
        } = &mut *self;

        // cell assignment
        let clamped = AtomicUsize::new(0);
        {
            let positions = buffer.positions();
            accel.launch_chunked("assign_cells", wg, &mut cell_index[..n], |group, chunk| {
                let mut local_clamped = 0;
                for (cell, position) in chunk.iter_mut().zip(&positions[group.items(n)]) {
                    let (cell_id, was_clamped) = grid.cell_id_of(*position);
                    *cell = cell_id;
                    if was_clamped {
                        local_clamped += 1;
                    }
                }
                if local_clamped > 0 {
                    clamped.fetch_add(local_clamped, Ordering::Relaxed);
                }
            })?;
        }
        let clamped = clamped.into_inner();
        if clamped > 0 {
            warn!("{} particles outside of the domain were clamped to boundary cells", clamped);
        }

        // histogram
        clear_counters(accel, wg, &mut cell_counter[..])?;
        {
            let cell_index = &cell_index[..n];
            let counters = &cell_counter[..];
            accel.launch("count_cells", LaunchConfig::linear(n, wg), |group| {
                for i in group.items(n) {
                    counters[cell_index[i] as usize].fetch_add(1, Ordering::Relaxed);
                }
            })?;
        }
        {
            let counters = &cell_counter[..];
            accel.launch_chunked("load_cell_counts", wg, &mut cell_nump[..], |group, chunk| {
                for (count, counter) in chunk.iter_mut().zip(&counters[group.items(num_cells)]) {
                    *count = counter.load(Ordering::Relaxed);
                }
            })?;
        }

        let total = exclusive_scan(accel, wg, &cell_nump[..], &mut cell_offset[..])? as usize;
        if total != n {
            return Err(AcceleratorError::KernelAborted {
                kernel: "count_cells",
                message: format!("histogram holds {} particles, expected {}", total, n),
            });
        }

        // scatter, the counters act as per-cell write heads
        clear_counters(accel, wg, &mut cell_counter[..])?;
        {
            let cell_index = &cell_index[..n];
            let cell_offset = &cell_offset[..];
            let counters = &cell_counter[..];
            let idx2part_ptr = ThreadSafeMutPtr::new(&mut idx2part[..n]);
            accel.launch("scatter_particles", LaunchConfig::linear(n, wg), |group| {
                for i in group.items(n) {
                    let cell = cell_index[i] as usize;
                    let slot = cell_offset[cell] + counters[cell].fetch_add(1, Ordering::Relaxed);
                    // every slot is claimed exactly once through the write heads
                    unsafe { idx2part_ptr.write(slot as usize, i as u32) };
                }
            })?;
        }

        // the atomic scatter is unordered, restore ascending original index inside every cell
        {
            let cell_offset = &cell_offset[..];
            let cell_nump = &cell_nump[..];
            let config = LaunchConfig::linear(num_cells, wg);
            let cell_group_slots = (0..config.groups).map(|g| {
                let first = g * wg;
                let last = ((g + 1) * wg).min(num_cells) - 1;
                cell_offset[first] as usize..(cell_offset[last] + cell_nump[last]) as usize
            });
            let parts = split_ranges_mut(&mut idx2part[..n], cell_group_slots);
            accel.launch_partitioned("sort_cells", config, parts, |group, part| {
                let cells = group.items(num_cells);
                let base = cell_offset[cells.start] as usize;
                for cell in cells {
                    let begin = cell_offset[cell] as usize - base;
                    let end = begin + cell_nump[cell] as usize;
                    part[begin..end].sort_unstable();
                }
            })?;
        }

        // gather positions in slot order and invert the permutation
        {
            let (positions, sorted) = buffer.split_scratch(scratch);
            {
                let positions = &*positions;
                let idx2part = &idx2part[..n];
                let part2idx_ptr = ThreadSafeMutPtr::new(&mut part2idx[..n]);
                accel.launch_chunked("gather_sorted", wg, &mut sorted[..n], |group, chunk| {
                    for (sorted_position, slot) in chunk.iter_mut().zip(group.items(n)) {
                        let original = idx2part[slot] as usize;
                        *sorted_position = positions[original];
                        // idx2part is a permutation, so every original index is written once
                        unsafe { part2idx_ptr.write(original, slot as u32) };
                    }
                })?;
            }
            accel.copy("copy_sorted_positions", &*sorted, positions, 0..n)?;
        }

        self.build_block_tasks(accel)?;

        self.middle = n;
        self.clamped = clamped;

        debug!(
            "arranged {} particles into {} block tasks ({} footprint ranges)",
            n,
            self.block_tasks.len(),
            self.footprints.len()
        );

        Ok(n)
    }

    /// Groups the occupied cells of every grid row into block tasks of at most
    /// `block_particle_limit` particles and precomputes their neighbor-cell footprints.
    fn build_block_tasks(&mut self, accel: &Accelerator) -> Result<(), AcceleratorError> {
        let grid = self.grid;
        let limit = self.block_particle_limit as u32;
        let row_len = grid.dims().x as usize;
        let num_rows = grid.num_cells() / row_len;
        let cell_nump = &self.cell_nump[..];
        let cell_offset = &self.cell_offset[..];

        // (cell_begin, cell_end, particle_begin, particle_end) per task, one row per group
        let row_tasks = accel.launch_map("plan_blocks", LaunchConfig::new(num_rows, 1), |group| {
            let mut tasks: Vec<[u32; 4]> = Vec::new();
            let mut current: Option<[u32; 4]> = None;

            let row_cells = group.id * row_len..(group.id + 1) * row_len;
            for cell in row_cells {
                let count = cell_nump[cell];
                if count == 0 {
                    continue;
                }
                let begin = cell_offset[cell];
                let cell = cell as u32;

                if count > limit {
                    tasks.extend(current.take());
                    let mut b = begin;
                    while b < begin + count {
                        let e = (b + limit).min(begin + count);
                        tasks.push([cell, cell + 1, b, e]);
                        b = e;
                    }
                    continue;
                }

                match current.as_mut() {
                    Some(task) if task[3] - task[2] + count <= limit => {
                        task[1] = cell + 1;
                        task[3] = begin + count;
                    }
                    _ => {
                        tasks.extend(current.take());
                        current = Some([cell, cell + 1, begin, begin + count]);
                    }
                }
            }
            tasks.extend(current);
            tasks
        })?;
        let planned: Vec<[u32; 4]> = row_tasks.into_iter().flatten().collect();

        let footprints = accel.launch_map(
            "build_footprints",
            LaunchConfig::new(planned.len(), 1),
            |group| {
                let [cell_begin, cell_end, _, _] = planned[group.id];

                let mut cells: Vec<u32> = Vec::new();
                for cell in cell_begin..cell_end {
                    if cell_nump[cell as usize] == 0 {
                        continue;
                    }
                    grid.iterate_neighbor_cells(grid.cell_pos_of_id(cell), |neigh| cells.push(neigh));
                }
                cells.sort_unstable();
                cells.dedup();

                // cells with consecutive slot ranges merge into one range
                let mut ranges: Vec<SlotRange> = Vec::new();
                for cell in cells {
                    let count = cell_nump[cell as usize];
                    if count == 0 {
                        continue;
                    }
                    let begin = cell_offset[cell as usize];
                    match ranges.last_mut() {
                        Some(last) if last.end == begin => last.end = begin + count,
                        _ => ranges.push(SlotRange {
                            begin,
                            end: begin + count,
                        }),
                    }
                }
                ranges
            },
        )?;

        self.block_tasks.clear();
        self.footprints.clear();
        for ([cell_begin, cell_end, particle_begin, particle_end], ranges) in planned.into_iter().zip(footprints) {
            let footprint_begin = self.footprints.len() as u32;
            self.footprints.extend(ranges);
            self.block_tasks.push(BlockTask {
                cell_begin,
                cell_end,
                particle_begin,
                particle_end,
                footprint_begin,
                footprint_end: self.footprints.len() as u32,
            });
        }

        Ok(())
    }

    /// Drops the result of the last step.
    pub(crate) fn clear(&mut self) {
        self.middle = 0;
        self.clamped = 0;
        self.block_tasks.clear();
        self.footprints.clear();
    }

    pub fn grid(&self) -> &GridParameters {
        &self.grid
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of particles arranged by the last step.
    pub fn middle(&self) -> usize {
        self.middle
    }

    /// Number of particles the last step had to clamp into the grid.
    pub fn clamped_particles(&self) -> usize {
        self.clamped
    }

    pub fn block_particle_limit(&self) -> usize {
        self.block_particle_limit
    }

    /// original index -> sorted slot
    pub fn part2idx(&self) -> &[u32] {
        &self.part2idx[..self.middle]
    }

    /// sorted slot -> original index
    pub fn idx2part(&self) -> &[u32] {
        &self.idx2part[..self.middle]
    }

    /// Cell of every particle, by original index.
    pub fn cell_index(&self) -> &[u32] {
        &self.cell_index[..self.middle]
    }

    pub fn cell_offset(&self) -> &[u32] {
        &self.cell_offset
    }

    pub fn cell_nump(&self) -> &[u32] {
        &self.cell_nump
    }

    /// Sorted slots of the particles in `cell`.
    pub fn cell_slots(&self, cell: usize) -> Range<usize> {
        let begin = self.cell_offset[cell] as usize;
        begin..begin + self.cell_nump[cell] as usize
    }

    pub fn block_tasks(&self) -> &[BlockTask] {
        &self.block_tasks
    }

    pub fn num_blocks(&self) -> usize {
        self.block_tasks.len()
    }

    /// Slot ranges of all particles that can be neighbors of a particle in `task`.
    pub fn footprint(&self, task: &BlockTask) -> &[SlotRange] {
        &self.footprints[task.footprint_begin as usize..task.footprint_end as usize]
    }

    /// Checks permutation, cell table and block tasks of the last step.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let middle = self.middle;
        let part2idx = self.part2idx();
        let idx2part = self.idx2part();

        for (original, &slot) in part2idx.iter().enumerate() {
            let slot = slot as usize;
            if slot >= middle {
                return Err(InvariantViolation::PermutationOutOfRange {
                    index: original,
                    value: slot,
                    len: middle,
                });
            }
            let back = idx2part[slot] as usize;
            if back != original {
                return Err(InvariantViolation::PermutationNotBijective { original, slot, back });
            }
        }

        let mut expected_offset = 0;
        for cell in 0..self.grid.num_cells() {
            let offset = self.cell_offset[cell] as usize;
            if offset != expected_offset {
                return Err(InvariantViolation::CellOffsetMismatch {
                    cell,
                    offset,
                    expected: expected_offset,
                });
            }
            for slot in self.cell_slots(cell) {
                let actual = self.cell_index[idx2part[slot] as usize] as usize;
                if actual != cell {
                    return Err(InvariantViolation::SlotInWrongCell {
                        slot,
                        expected: cell,
                        actual,
                    });
                }
            }
            expected_offset += self.cell_nump[cell] as usize;
        }
        if expected_offset != middle {
            return Err(InvariantViolation::CellCountMismatch {
                sum: expected_offset,
                middle,
            });
        }

        let mut covered = 0;
        for (task_id, task) in self.block_tasks.iter().enumerate() {
            if task.particle_begin as usize != covered {
                return Err(InvariantViolation::BlockCoverageGap {
                    task: task_id,
                    begin: task.particle_begin as usize,
                    expected: covered,
                });
            }
            if task.num_particles() > self.block_particle_limit {
                return Err(InvariantViolation::BlockTooLarge {
                    task: task_id,
                    len: task.num_particles(),
                    limit: self.block_particle_limit,
                });
            }
            covered = task.particle_end as usize;
        }
        if covered != middle {
            return Err(InvariantViolation::BlockCoverageIncomplete { covered, middle });
        }

        Ok(())
    }
}

fn clear_counters(accel: &Accelerator, wg: usize, counters: &mut [AtomicU32]) -> Result<(), AcceleratorError> {
    accel.launch_chunked("clear_cells", wg, counters, |_, chunk| {
        for counter in chunk {
            *counter.get_mut() = 0;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accelerator::test_accelerator, floating_type_mod::FT, search_parameters::DomainParams, vec3f, V3,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    struct Fixture {
        accel: Accelerator,
        buffer: ParticleBuffer,
        scratch: ScratchView,
        arrangement: Arrangement,
    }

    fn fixture(radius: FT, extent: FT, capacity: usize, block_limit: usize) -> Fixture {
        let accel = test_accelerator();
        let grid = GridParameters::new(radius, &DomainParams::new(extent, extent, extent)).unwrap();
        let buffer = ParticleBuffer::allocate(&accel, capacity, Residency::Device).unwrap();
        let scratch = buffer.allocate_sub_buffer().unwrap();
        let arrangement = Arrangement::new(&accel, grid, capacity, 64, block_limit).unwrap();
        Fixture {
            accel,
            buffer,
            scratch,
            arrangement,
        }
    }

    impl Fixture {
        fn arrange(&mut self, positions: &[V3]) -> usize {
            self.buffer.positions_mut()[..positions.len()].copy_from_slice(positions);
            self.arrangement
                .arrange(&self.accel, &mut self.buffer, &self.scratch, positions.len())
                .unwrap()
        }
    }

    fn random_cloud(n: usize, lo: FT, hi: FT, seed: u64) -> Vec<V3> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| vec3f(rng.gen_range(lo..hi), rng.gen_range(lo..hi), rng.gen_range(lo..hi)))
            .collect()
    }

    #[test]
    fn random_cloud_is_sorted_by_cell() {
        let positions = random_cloud(3000, 0., 4., 1);
        let mut f = fixture(0.5, 4., 4000, 32);
        let middle = f.arrange(&positions);

        assert_eq!(middle, 3000);
        f.arrangement.validate().unwrap();

        let grid = *f.arrangement.grid();
        let sorted = f.buffer.positions();
        let idx2part = f.arrangement.idx2part();
        let mut last_cell = 0;
        for slot in 0..middle {
            assert_eq!(sorted[slot], positions[idx2part[slot] as usize]);
            let (cell, _) = grid.cell_id_of(sorted[slot]);
            assert!(cell >= last_cell);
            last_cell = cell;
        }

        let total: u32 = f.arrangement.cell_nump().iter().sum();
        assert_eq!(total as usize, middle);
        assert_eq!(f.arrangement.clamped_particles(), 0);
    }

    #[test]
    fn sort_is_stable_within_cells() {
        // everything in one cell, in reverse index order of position
        let positions: Vec<V3> = (0..200).map(|i| vec3f(0.5 - i as FT * 0.001, 0.5, 0.5)).collect();
        let mut f = fixture(1., 2., 200, 256);
        f.arrange(&positions);

        let idx2part = f.arrangement.idx2part();
        assert!(idx2part.windows(2).all(|w| w[0] < w[1]));
        assert!(f.arrangement.part2idx().iter().enumerate().all(|(i, &s)| s as usize == i));
    }

    #[test]
    fn dense_cell_is_split_into_several_tasks() {
        let positions: Vec<V3> = (0..100).map(|i| vec3f(0.1 + i as FT * 0.005, 0.2, 0.3)).collect();
        let mut f = fixture(1., 3., 128, 16);
        f.arrange(&positions);
        f.arrangement.validate().unwrap();

        let tasks = f.arrangement.block_tasks();
        assert_eq!(tasks.len(), 7);
        assert!(tasks.iter().all(|t| t.cells() == (0..1) && t.num_particles() <= 16));
        assert_eq!(tasks.last().unwrap().particle_end, 100);
    }

    #[test]
    fn blocks_stay_inside_grid_rows() {
        let positions = random_cloud(2000, 0., 3., 2);
        let mut f = fixture(0.25, 3., 2000, 64);
        f.arrange(&positions);
        f.arrangement.validate().unwrap();

        let grid = *f.arrangement.grid();
        for task in f.arrangement.block_tasks() {
            assert!(grid.same_row(task.cell_begin, task.cell_end - 1));
            assert!(task.num_particles() > 0);
        }
    }

    #[test]
    fn footprint_contains_all_neighbors() {
        let radius = 0.3;
        let positions = random_cloud(1500, 0., 2., 3);
        let mut f = fixture(radius, 2., 1500, 24);
        f.arrange(&positions);

        let sorted = f.buffer.positions();
        for task in f.arrangement.block_tasks() {
            let footprint = f.arrangement.footprint(task);
            for q in task.particles() {
                for (s, p) in sorted[..1500].iter().enumerate() {
                    if (p - sorted[q]).norm_squared() <= radius * radius {
                        assert!(
                            footprint.iter().any(|r| r.range().contains(&s)),
                            "slot {} is a neighbor of {} but not in the footprint",
                            s,
                            q
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn outside_particles_are_clamped() {
        let mut positions = random_cloud(50, 0., 2., 4);
        positions.push(vec3f(-1., 0.5, 0.5));
        positions.push(vec3f(0.5, 5., 0.5));
        positions.push(vec3f(0.5, 0.5, 2.0));
        let mut f = fixture(0.5, 2., 64, 32);
        let middle = f.arrange(&positions);

        assert_eq!(middle, 53);
        assert_eq!(f.arrangement.clamped_particles(), 3);
        f.arrangement.validate().unwrap();

        let grid = *f.arrangement.grid();
        let cell_of_outlier = f.arrangement.cell_index()[50];
        assert_eq!(grid.cell_pos_of_id(cell_of_outlier).x, 0);
    }

    #[test]
    fn partial_fill_and_empty_step() {
        let positions = random_cloud(10, 0., 1., 5);
        let mut f = fixture(0.5, 1., 100, 32);
        assert_eq!(f.arrange(&positions), 10);
        f.arrangement.validate().unwrap();
        assert_eq!(f.arrangement.part2idx().len(), 10);

        assert_eq!(f.arrange(&[]), 0);
        f.arrangement.validate().unwrap();
        assert_eq!(f.arrangement.num_blocks(), 0);
    }

    #[test]
    fn injected_failure_aborts_arrangement() {
        let mut f = fixture(0.5, 1., 10, 32);
        f.accel.inject_failure("scatter_particles");
        let positions = random_cloud(10, 0., 1., 6);
        f.buffer.positions_mut()[..10].copy_from_slice(&positions);
        let err = f
            .arrangement
            .arrange(&f.accel, &mut f.buffer, &f.scratch, 10)
            .unwrap_err();
        assert!(matches!(err, AcceleratorError::InjectedFault("scatter_particles")));
    }

    #[test]
    fn failed_arrangement_drops_previous_result() {
        let mut f = fixture(0.5, 1., 10, 32);
        let positions = random_cloud(10, 0., 1., 7);
        assert_eq!(f.arrange(&positions), 10);
        assert!(!f.arrangement.block_tasks().is_empty());

        f.accel.inject_failure("count_cells");
        assert!(f
            .arrangement
            .arrange(&f.accel, &mut f.buffer, &f.scratch, 10)
            .is_err());
        assert_eq!(f.arrangement.middle(), 0);
        assert_eq!(f.arrangement.clamped_particles(), 0);
        assert!(f.arrangement.block_tasks().is_empty());
    }
}
