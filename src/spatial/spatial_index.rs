use log::{debug, info};

use crate::{
    accelerator::{Accelerator, Allocation, Residency},
    arrangement::Arrangement,
    error::{AcceleratorError, InvariantViolation, SearchError, SearchStage},
    floating_type_mod::FT,
    grid_parameters::GridParameters,
    neighbor_list::NeighborList,
    particle_buffer::{ParticleBuffer, ParticleField, ScratchView, TransferDirection},
    search_parameters::{IndexingMode, SearchParams},
    statistics::{PerformanceCounters, ValueCounters},
    V3,
};

fn step_error(stage: SearchStage) -> impl FnOnce(AcceleratorError) -> SearchError {
    move |source| SearchError::Step { stage, source }
}

fn invariant_error(stage: SearchStage) -> impl FnOnce(InvariantViolation) -> SearchError {
    move |source| SearchError::Invariant { stage, source }
}

/// Fixed-radius neighborhood search over fluid and boundary particles.
///
/// Every call to [`neighborhood_search`](Self::neighborhood_search) uploads the positions, sorts
/// them by grid cell, and rebuilds all neighbor lists. Boundary particles are appended behind the
/// fluid particles, so original index `num_fluid() + b` is boundary particle `b`.
///
/// Neighbor queries take a sorted slot, obtained with [`part_idx`](Self::part_idx). What they
/// return depends on the [`IndexingMode`]:
///
/// - `Indirect`: `part_idx` maps an original index to its slot, `neighbor` returns original indices.
/// - `Reordered`: `part_idx` is the identity, `neighbor` returns sorted slots and
///   [`positions`](Self::positions) holds the positions in slot order.
pub struct SpatialIndex {
    params: SearchParams,
    grid: GridParameters,
    accel: Accelerator,

    host: ParticleBuffer,
    device: ParticleBuffer,
    scratch: ScratchView,

    arrangement: Arrangement,
    neighbor_list: NeighborList,

    // read back after every step
    host_part2idx: Allocation<u32>,
    host_idx2part: Allocation<u32>,

    num_fluid: usize,
    num_boundary: usize,
    middle: usize,
    timestamp: u64,

    pcounters: PerformanceCounters,
    vcounters: ValueCounters,
}

impl SpatialIndex {
    pub fn new(params: SearchParams) -> Result<SpatialIndex, SearchError> {
        params.validate()?;
        let accel = Accelerator::new(&params.accelerator)?;
        SpatialIndex::with_accelerator(params, accel)
    }

    /// Builds the index on an already created accelerator; `params.accelerator` is ignored.
    pub fn with_accelerator(params: SearchParams, accel: Accelerator) -> Result<SpatialIndex, SearchError> {
        params.validate()?;

        let max_threads = accel.properties().max_threads_per_group;
        if params.work_group_size > max_threads {
            return Err(AcceleratorError::WorkGroupTooLarge {
                kernel: "neighborhood_search",
                requested: params.work_group_size,
                limit: max_threads,
            }
            .into());
        }

        let grid = GridParameters::new(params.radius, &params.domain)?;
        let capacity = params.capacity;
        let block_particle_limit = params.block_particle_limit().min(max_threads);

        let host = ParticleBuffer::allocate(&accel, capacity, Residency::HostPinned)?;
        let device = ParticleBuffer::allocate(&accel, capacity, Residency::Device)?;
        let scratch = device.allocate_sub_buffer()?;

        let arrangement = Arrangement::new(&accel, grid, capacity, params.work_group_size, block_particle_limit)?;
        let neighbor_list = NeighborList::new(
            &accel,
            capacity,
            params.neighbors_per_particle_hint,
            params.work_group_size,
        )?;

        let host_part2idx = accel.allocate(capacity, Residency::HostPinned)?;
        let host_idx2part = accel.allocate(capacity, Residency::HostPinned)?;

        info!(
            "neighborhood search: radius {}, grid {}x{}x{} cells, capacity {}, {:?} indexing",
            params.radius,
            grid.dims().x,
            grid.dims().y,
            grid.dims().z,
            capacity,
            params.indexing_mode
        );
        info!(
            "device memory in use: {} bytes, pinned memory in use: {} bytes",
            accel.memory_in_use(Residency::Device),
            accel.memory_in_use(Residency::HostPinned)
        );

        Ok(SpatialIndex {
            grid,
            accel,
            host,
            device,
            scratch,
            arrangement,
            neighbor_list,
            host_part2idx,
            host_idx2part,
            num_fluid: 0,
            num_boundary: 0,
            middle: 0,
            timestamp: 0,
            pcounters: PerformanceCounters::new(params.statistics_enabled),
            vcounters: ValueCounters::new(params.statistics_enabled),
            params,
        })
    }

    /// Rebuilds the neighbor lists for the given positions.
    ///
    /// On error the index holds no particles until the next successful call.
    pub fn neighborhood_search(&mut self, fluid: &[V3], boundary: &[V3]) -> Result<(), SearchError> {
        let num_particles = fluid.len() + boundary.len();
        if num_particles > self.params.capacity {
            return Err(SearchError::CapacityExceeded {
                requested: num_particles,
                capacity: self.params.capacity,
            });
        }

        self.middle = 0;
        self.arrangement.clear();
        self.neighbor_list.clear();
        self.num_fluid = fluid.len();
        self.num_boundary = boundary.len();

        self.pcounters.begin("neighborhood-search");

        self.pcounters.begin("transfer");
        {
            let host_positions = self.host.positions_mut();
            host_positions[..fluid.len()].copy_from_slice(fluid);
            host_positions[fluid.len()..num_particles].copy_from_slice(boundary);
        }
        self.host
            .transfer(
                &self.accel,
                &mut self.device,
                ParticleField::Position,
                0..num_particles,
                TransferDirection::HostToDevice,
            )
            .map_err(step_error(SearchStage::Transfer))?;
        self.pcounters.end("transfer");

        self.pcounters.begin("arrange");
        let middle = self
            .arrangement
            .arrange(&self.accel, &mut self.device, &self.scratch, num_particles)
            .map_err(step_error(SearchStage::Arrange))?;
        if self.params.check_invariants {
            self.arrangement
                .validate()
                .map_err(invariant_error(SearchStage::Arrange))?;
        }
        self.pcounters.end("arrange");

        self.pcounters.begin("search");
        let total = self
            .neighbor_list
            .build(&self.accel, &self.arrangement, self.device.positions(), self.params.radius)
            .map_err(step_error(SearchStage::Search))?;
        if self.params.check_invariants {
            self.neighbor_list
                .validate()
                .map_err(invariant_error(SearchStage::Search))?;
        }
        self.pcounters.end("search");

        self.pcounters.begin("readback");
        self.read_back(middle).map_err(step_error(SearchStage::Readback))?;
        self.pcounters.end("readback");

        self.pcounters.end("neighborhood-search");

        self.middle = middle;
        self.vcounters.add_value("middle", middle as FT);
        self.vcounters.add_value("neighbor-count", total as FT);
        self.vcounters
            .add_value("clamped-particles", self.arrangement.clamped_particles() as FT);

        debug!(
            "step {}: {} fluid + {} boundary particles, {} neighbor entries",
            self.timestamp, self.num_fluid, self.num_boundary, total
        );

        Ok(())
    }

    fn read_back(&mut self, middle: usize) -> Result<(), AcceleratorError> {
        self.accel.copy(
            "readback_part2idx",
            self.arrangement.part2idx(),
            &mut self.host_part2idx,
            0..middle,
        )?;
        self.accel.copy(
            "readback_idx2part",
            self.arrangement.idx2part(),
            &mut self.host_idx2part,
            0..middle,
        )?;

        if self.params.indexing_mode == IndexingMode::Reordered {
            self.device.transfer(
                &self.accel,
                &mut self.host,
                ParticleField::Position,
                0..middle,
                TransferDirection::DeviceToHost,
            )?;
        }
        Ok(())
    }

    /// Advances the step counter.
    pub fn update(&mut self) {
        self.timestamp += 1;
    }

    pub fn current_timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Sorted slot of a particle. Identity in `Reordered` mode.
    pub fn part_idx(&self, i: usize) -> usize {
        assert!(i < self.middle, "particle {} out of range ({})", i, self.middle);
        match self.params.indexing_mode {
            IndexingMode::Indirect => self.host_part2idx[i] as usize,
            IndexingMode::Reordered => i,
        }
    }

    /// Original index of the particle in a sorted slot.
    pub fn idx_idx(&self, slot: usize) -> usize {
        assert!(slot < self.middle, "slot {} out of range ({})", slot, self.middle);
        self.host_idx2part[slot] as usize
    }

    fn to_caller_index(&self, slot: u32) -> usize {
        match self.params.indexing_mode {
            IndexingMode::Indirect => self.host_idx2part[slot as usize] as usize,
            IndexingMode::Reordered => slot as usize,
        }
    }

    /// Number of neighbors of the particle in sorted slot `slot`.
    pub fn n_neighbors(&self, slot: usize) -> usize {
        assert!(slot < self.middle, "slot {} out of range ({})", slot, self.middle);
        self.neighbor_list.count(slot)
    }

    /// `k`-th neighbor of the particle in sorted slot `slot`, in the caller's index space.
    pub fn neighbor(&self, slot: usize, k: usize) -> usize {
        assert!(slot < self.middle, "slot {} out of range ({})", slot, self.middle);
        self.to_caller_index(self.neighbor_list.neighbor(slot, k))
    }

    pub fn neighbors(&self, slot: usize) -> impl Iterator<Item = usize> + '_ {
        assert!(slot < self.middle, "slot {} out of range ({})", slot, self.middle);
        self.neighbor_list
            .neighbors_of(slot)
            .iter()
            .map(move |&n| self.to_caller_index(n))
    }

    pub fn num_fluid(&self) -> usize {
        self.num_fluid
    }

    pub fn num_boundary(&self) -> usize {
        self.num_boundary
    }

    pub fn num_particles(&self) -> usize {
        self.num_fluid + self.num_boundary
    }

    /// Whether an original index belongs to a boundary particle.
    pub fn is_boundary(&self, original: usize) -> bool {
        assert!(original < self.num_particles());
        original >= self.num_fluid
    }

    /// Host copy of the positions of the last step: as uploaded in `Indirect` mode, in slot
    /// order in `Reordered` mode.
    pub fn positions(&self) -> &[V3] {
        &self.host.positions()[..self.num_particles()]
    }

    /// Number of particles arranged and searched by the last successful step.
    pub fn middle(&self) -> usize {
        self.middle
    }

    pub fn clamped_particles(&self) -> usize {
        self.arrangement.clamped_particles()
    }

    pub fn radius(&self) -> FT {
        self.params.radius
    }

    pub fn grid(&self) -> &GridParameters {
        &self.grid
    }

    pub fn indexing_mode(&self) -> IndexingMode {
        self.params.indexing_mode
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.accel
    }

    pub fn arrangement(&self) -> &Arrangement {
        &self.arrangement
    }

    pub fn neighbor_list(&self) -> &NeighborList {
        &self.neighbor_list
    }

    pub(crate) fn performance_counters(&self) -> &PerformanceCounters {
        &self.pcounters
    }

    pub(crate) fn value_counters(&self) -> &ValueCounters {
        &self.vcounters
    }
}
