pub mod accelerator;
pub mod arrangement;
pub mod concurrency;
pub mod error;
pub mod grid_parameters;
pub mod neighbor_list;
pub mod particle_buffer;
pub mod scan;
pub mod search_parameters;
pub mod spatial_index;
pub mod statistics;
pub mod thread_safe_ptr;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
}

use floating_type_mod::FT;

use nalgebra::SVector;

pub type V<T, const D: usize> = SVector<T, D>;

pub type V3 = V<FT, 3>;
pub type VI3 = V<i32, 3>;
pub type VU3 = V<u32, 3>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub use accelerator::{Accelerator, DeviceProperties, Residency};
pub use arrangement::{Arrangement, BlockTask, SlotRange};
pub use error::{AcceleratorError, AllocationError, ConfigError, InvariantViolation, SearchError, SearchStage};
pub use grid_parameters::GridParameters;
pub use neighbor_list::NeighborList;
pub use particle_buffer::{ParticleBuffer, ParticleField, ScratchView, TransferDirection};
pub use search_parameters::{AcceleratorParams, DomainParams, IndexingMode, SearchParams};
pub use spatial_index::SpatialIndex;
pub use statistics::write_statistics;
