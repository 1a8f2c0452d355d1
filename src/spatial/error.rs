use std::fmt;

use crate::{accelerator::Residency, floating_type_mod::FT, particle_buffer::TransferDirection};

/// Memory could not be reserved for a buffer. Raised while constructing the index
/// (or when the flat neighbor array has to grow).
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("cannot reserve {requested} bytes of {residency} memory ({available} of {limit} bytes available)")]
    OutOfMemory {
        residency: Residency,
        requested: usize,
        available: usize,
        limit: usize,
    },
    #[error("host allocator refused {requested} bytes for a {residency} buffer")]
    HostAllocator { residency: Residency, requested: usize },
    #[error("{len} elements of {element_size} bytes overflow the address space")]
    CapacityOverflow { len: usize, element_size: usize },
    #[error("a scratch view can only alias a device buffer, not {0} memory")]
    SubBufferResidency(Residency),
}

/// Kernel launch or copy failure. Fatal for the step that issued it.
#[derive(Debug, thiserror::Error)]
pub enum AcceleratorError {
    #[error("failed to start accelerator worker pool: {0}")]
    Initialization(#[from] rayon::ThreadPoolBuildError),
    #[error("kernel `{kernel}` requested {requested} threads per work-group (limit {limit})")]
    WorkGroupTooLarge {
        kernel: &'static str,
        requested: usize,
        limit: usize,
    },
    #[error("kernel `{kernel}` requested {requested} bytes of shared memory per work-group (limit {limit})")]
    SharedMemoryExceeded {
        kernel: &'static str,
        requested: usize,
        limit: usize,
    },
    #[error("kernel `{kernel}` aborted: {message}")]
    KernelAborted { kernel: &'static str, message: String },
    #[error("copy `{operation}` of range [{begin}, {end}) does not fit buffers of length {src_len} -> {dst_len}")]
    CopyOutOfRange {
        operation: &'static str,
        begin: usize,
        end: usize,
        src_len: usize,
        dst_len: usize,
    },
    #[error("cannot copy {direction}: source is {src} memory, destination is {dst} memory")]
    ResidencyMismatch {
        direction: TransferDirection,
        src: Residency,
        dst: Residency,
    },
    #[error("injected failure in `{0}`")]
    InjectedFault(&'static str),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Inconsistent index state. Only ever caused by a bug in the index itself.
#[derive(Debug, thiserror::Error)]
pub enum InvariantViolation {
    #[error("permutation is not bijective: part2idx[{original}] = {slot} but idx2part[{slot}] = {back}")]
    PermutationNotBijective { original: usize, slot: usize, back: usize },
    #[error("permutation entry {index} -> {value} is outside [0, {len})")]
    PermutationOutOfRange { index: usize, value: usize, len: usize },
    #[error("cell {cell} starts at {offset}, expected {expected}")]
    CellOffsetMismatch { cell: usize, offset: usize, expected: usize },
    #[error("cell counts sum to {sum}, but {middle} particles were arranged")]
    CellCountMismatch { sum: usize, middle: usize },
    #[error("slot {slot} holds a particle of cell {actual}, but the cell table places it in cell {expected}")]
    SlotInWrongCell { slot: usize, expected: usize, actual: usize },
    #[error("block task {task} starts at particle {begin}, expected {expected}")]
    BlockCoverageGap { task: usize, begin: usize, expected: usize },
    #[error("block tasks cover [0, {covered}) instead of [0, {middle})")]
    BlockCoverageIncomplete { covered: usize, middle: usize },
    #[error("block task {task} holds {len} particles (limit {limit})")]
    BlockTooLarge { task: usize, len: usize, limit: usize },
    #[error("neighbor offset of slot {slot} is {offset}, expected {expected} (prefix sum of counts)")]
    NeighborOffsetMismatch { slot: usize, offset: usize, expected: usize },
    #[error("slot {slot} lists neighbor {neighbor} outside [0, {middle})")]
    NeighborOutOfRange { slot: usize, neighbor: usize, middle: usize },
    #[error("slot {0} lists itself as neighbor")]
    SelfNeighbor(usize),
}

/// Invalid parameters or an unreadable configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("interaction radius must be positive and finite, got {0}")]
    InvalidRadius(FT),
    #[error("domain extent must be positive and finite along every axis, got {0:?}")]
    InvalidDomain([FT; 3]),
    #[error("grid of {dims:?} cells exceeds the 32-bit cell id space")]
    TooManyCells { dims: [u64; 3] },
    #[error("`{0}` must be at least 1")]
    ZeroParameter(&'static str),
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("override key `{0}` does not exist in the configuration")]
    UnknownOverride(String),
}

/// The part of a search step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchStage {
    Transfer,
    Arrange,
    Search,
    Readback,
}

impl SearchStage {
    pub fn to_lowercase_string(self) -> &'static str {
        match self {
            SearchStage::Transfer => "transfer",
            SearchStage::Arrange => "arrange",
            SearchStage::Search => "search",
            SearchStage::Readback => "readback",
        }
    }
}

impl fmt::Display for SearchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_lowercase_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error("accelerator initialization failed: {0}")]
    Accelerator(#[from] AcceleratorError),
    #[error("{stage} stage failed: {source}")]
    Step {
        stage: SearchStage,
        #[source]
        source: AcceleratorError,
    },
    #[error("{stage} stage produced inconsistent state: {source}")]
    Invariant {
        stage: SearchStage,
        #[source]
        source: InvariantViolation,
    },
    #[error("{requested} particles exceed the allocated capacity of {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },
}

impl SearchError {
    /// Stage of a failed step, `None` for construction-time errors.
    pub fn stage(&self) -> Option<SearchStage> {
        match self {
            SearchError::Step { stage, .. } | SearchError::Invariant { stage, .. } => Some(*stage),
            SearchError::CapacityExceeded { .. } => Some(SearchStage::Transfer),
            _ => None,
        }
    }
}
